// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Attribute cache and selector engine for declaratively managed machine
//! fleets.
//!
//! Oxherd reads the attribute tree exported by a declarative fleet source
//! through an external evaluator, which is far too expensive to consult for
//! every lookup. The library sits between the two: selector paths address
//! positions in the tree, a partially-populated recursive cache answers what
//! it can, and everything else is batched into a single evaluator call whose
//! results persist across invocations.
//!
//! Entry points:
//!
//! - [`Flake`] — one external source, its pinned revision, and its cache.
//! - [`FlakeCache`] — the durable cache itself, usable standalone.
//! - [`parse_selector`] — the dot/brace path-query micro-language.
//! - [`ArtifactStore`] — existence checks for content-addressed artifacts
//!   referenced by cached values.

pub mod cache;
pub mod config;
pub mod flake;
pub mod path;
pub mod selector;
pub mod store;

pub use cache::{CacheEntry, CacheError, CacheFileError, CacheValue, FlakeCache};
pub use config::{ConfigError, EvaluatorSettings, ToolConfig};
pub use flake::{EvalError, Evaluator, Flake, FlakeError, FlakePin, NixEvaluator, FLEET_EXPORT};
pub use selector::{
    parse_selector, quote_key, selectors_as_json, Selector, SelectorError, SetSelector,
};
pub use store::ArtifactStore;
