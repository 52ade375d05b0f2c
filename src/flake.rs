// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Fleet source orchestration.
//!
//! A [`Flake`] identifies one external declarative source by its location
//! string and mediates every read of its attribute tree through a durable
//! [`FlakeCache`]. The source itself is opaque: resolving it to a pinned
//! content hash and evaluating selections against it is delegated to an
//! [`Evaluator`] implementation, normally the external `nix` toolchain.
//!
//! The orchestrator's one performance guarantee is call batching. Any number
//! of not-yet-cached selectors requested together turn into exactly one
//! evaluator invocation carrying all of them in canonical JSON form, and
//! re-requesting cached selectors issues no invocation at all. After a
//! successful batch the on-disk cache is reloaded, merged, and atomically
//! rewritten, so concurrent invocations against the same pinned source do not
//! lose each other's work. A failed batch merges nothing.

use crate::{
    cache::{CacheError, CacheFileError, FlakeCache},
    path,
    selector::{parse_selector, quote_key, selectors_as_json, SelectorError},
    store::ArtifactStore,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::{
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, info, instrument, warn};

/// Top-level attribute every fleet source is expected to export.
pub const FLEET_EXPORT: &str = "herdInternals";

/// Pinned content identity of one source revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlakePin {
    /// Physical location of the source copy in the artifact store.
    pub store_path: PathBuf,

    /// Content hash the copy is pinned to.
    pub nar_hash: String,
}

/// External evaluator boundary.
///
/// Implementations resolve source locations to pinned content and answer
/// batched selection requests against a pinned revision. The contract for
/// [`fetch`](Evaluator::fetch) is strict: one invocation per call, results in
/// request order, one result per requested selector.
pub trait Evaluator {
    /// Resolve a source location into the store and pin its content hash.
    fn prefetch(&self, identifier: &str) -> Result<FlakePin, EvalError>;

    /// Resolved metadata for a source location.
    fn metadata(&self, identifier: &str) -> Result<Value, EvalError>;

    /// Evaluate a batch of canonical-JSON selector paths against a pin.
    fn fetch(
        &self,
        pin: &FlakePin,
        selectors: &[String],
        options: &[String],
    ) -> Result<Vec<Value>, EvalError>;
}

/// Evaluator backed by the external `nix` toolchain.
#[derive(Clone, Debug)]
pub struct NixEvaluator {
    program: PathBuf,
}

impl Default for NixEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Selector application library injected into every evaluation expression.
///
/// Interprets the canonical JSON selector form one step at a time, mirroring
/// the cache's own branching rules on the evaluator side.
const APPLY_SELECTORS: &str = r#"
    selectors: value:
      if selectors == [ ] then
        value
      else
        let
          step = builtins.head selectors;
          descend = applySelectors (builtins.tail selectors);
        in
        if step.type == "all" then
          (if builtins.isList value then map descend value else builtins.mapAttrs (_: descend) value)
        else if step.type == "str" then
          (if builtins.isList value
           then descend (builtins.elemAt value (builtins.fromJSON step.value))
           else descend value.${step.value})
        else if step.type == "maybe" then
          (if value ? ${step.value} then { ${step.value} = descend value.${step.value}; } else { })
        else
          builtins.listToAttrs (
            map
              (item: { name = item.value; value = descend value.${item.value}; })
              (builtins.filter (item: item.type == "str" || value ? ${item.value}) step.value)
          )
"#;

/// Quoted attribute cited by an evaluator diagnostic.
static DIAG_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"attribute '([^']+)'").unwrap());

impl NixEvaluator {
    /// Construct an evaluator running the `nix` binary from `PATH`.
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("nix"),
        }
    }

    fn run(&self, args: &[String]) -> Result<String, EvalError> {
        let output = Command::new(&self.program)
            .args(["--extra-experimental-features", "nix-command flakes"])
            .args(args)
            .output()
            .map_err(|err| EvalError::Spawn {
                command: format!("{} {}", self.program.display(), args.join(" ")),
                source: err,
            })?;

        let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
        let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

        if !output.status.success() {
            if let Some(attribute) = missing_attribute(&stderr) {
                return Err(EvalError::MissingAttribute { attribute, stderr });
            }
            return Err(EvalError::Failed { stderr });
        }

        Ok(stdout)
    }

    fn selection_expr(&self, pin: &FlakePin, selectors: &[String]) -> String {
        let selections = selectors
            .iter()
            .map(|json| format!("  (applySelectors (builtins.fromJSON {}) flake)", nix_string(json)))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "let\n  flake = builtins.getFlake \"path:{}?narHash={}\";\n  applySelectors =\n{};\nin\n[\n{}\n]",
            pin.store_path.display(),
            pin.nar_hash,
            APPLY_SELECTORS,
            selections,
        )
    }
}

impl Evaluator for NixEvaluator {
    fn prefetch(&self, identifier: &str) -> Result<FlakePin, EvalError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PrefetchOutput {
            store_path: PathBuf,
            hash: String,
        }

        let stdout = self.run(&[
            "flake".into(),
            "prefetch".into(),
            "--json".into(),
            // INVARIANT: Pin against the location as written, never the
            // user's registry aliases.
            "--option".into(),
            "flake-registry".into(),
            String::new(),
            identifier.into(),
        ])?;

        let parsed: PrefetchOutput =
            serde_json::from_str(&stdout).map_err(|err| EvalError::Output { source: err })?;

        Ok(FlakePin {
            store_path: parsed.store_path,
            nar_hash: parsed.hash,
        })
    }

    fn metadata(&self, identifier: &str) -> Result<Value, EvalError> {
        let stdout = self.run(&[
            "flake".into(),
            "metadata".into(),
            "--json".into(),
            identifier.into(),
        ])?;

        serde_json::from_str(&stdout).map_err(|err| EvalError::Output { source: err })
    }

    fn fetch(
        &self,
        pin: &FlakePin,
        selectors: &[String],
        options: &[String],
    ) -> Result<Vec<Value>, EvalError> {
        let mut args: Vec<String> = vec![
            "eval".into(),
            "--json".into(),
            "--expr".into(),
            self.selection_expr(pin, selectors),
        ];
        args.extend(options.iter().cloned());

        let stdout = self.run(&args)?;
        serde_json::from_str(stdout.trim()).map_err(|err| EvalError::Output { source: err })
    }
}

/// Extract the attribute name an evaluator diagnostic complains about.
fn missing_attribute(stderr: &str) -> Option<String> {
    if !stderr.contains("missing") && !stderr.contains("does not provide") {
        return None;
    }

    DIAG_ATTRIBUTE
        .captures(stderr)
        .map(|captures| captures[1].to_owned())
}

/// Escape arbitrary text into a double-quoted nix string literal.
fn nix_string(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace("${", "\\${");
    format!("\"{escaped}\"")
}

/// Resolved per-revision state of a source.
#[derive(Debug)]
struct Prefetched {
    pin: FlakePin,
    path: PathBuf,
    is_local: bool,
    cache: FlakeCache,
    cache_file: PathBuf,
}

/// One external declarative source and its attribute cache.
///
/// Values are read with [`select`](Flake::select), which serves from cache
/// when possible and falls back to a batched evaluator call otherwise. A
/// freshly constructed flake is unresolved; the first operation (or an
/// explicit [`invalidate_cache`](Flake::invalidate_cache)) pins the source
/// content and loads the revision's cache file.
#[derive(Debug)]
pub struct Flake<E = NixEvaluator> {
    identifier: String,
    evaluator: E,
    store: ArtifactStore,
    options: Vec<String>,
    cache_root: Option<PathBuf>,
    state: Option<Prefetched>,
}

impl Flake<NixEvaluator> {
    /// Construct a flake evaluated by the external `nix` toolchain.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::with_evaluator(identifier, NixEvaluator::new())
    }
}

impl<E: Evaluator> Flake<E> {
    /// Construct a flake with an explicit evaluator implementation.
    pub fn with_evaluator(identifier: impl Into<String>, evaluator: E) -> Self {
        Self {
            identifier: identifier.into(),
            evaluator,
            store: ArtifactStore::from_env(),
            options: Vec::new(),
            cache_root: None,
            state: None,
        }
    }

    /// Check cached store references against the given artifact store.
    pub fn with_artifact_store(mut self, store: ArtifactStore) -> Self {
        self.store = store;
        self
    }

    /// Keep cache files under an explicit root instead of the user default.
    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(cache_root.into());
        self
    }

    /// Pass extra options through to every evaluator invocation.
    pub fn with_options(mut self, options: impl IntoIterator<Item = String>) -> Self {
        self.options = options.into_iter().collect();
        self
    }

    /// Location string identifying this source.
    pub fn identifier(&self) -> &str {
        self.identifier.as_str()
    }

    /// Resolved local path of the source, pinning it first if needed.
    ///
    /// For non-local sources this is the store copy.
    pub fn path(&mut self) -> Result<&Path, FlakeError> {
        self.ensure_prefetched()?;
        match &self.state {
            Some(state) => Ok(state.path.as_path()),
            None => Err(FlakeError::Uninitialized),
        }
    }

    /// Whether the source resolves to a local directory.
    pub fn is_local(&mut self) -> Result<bool, FlakeError> {
        self.ensure_prefetched()?;
        match &self.state {
            Some(state) => Ok(state.is_local),
            None => Err(FlakeError::Uninitialized),
        }
    }

    /// Current revision cache, if the source has been pinned.
    pub fn cache(&self) -> Option<&FlakeCache> {
        self.state.as_ref().map(|state| &state.cache)
    }

    /// Re-pin the source and reload its revision cache.
    ///
    /// Pins the source content, derives the revision's cache file from the
    /// content hash, and loads it when present. A corrupt or unreadable
    /// cache file is discarded with a warning, never an error.
    ///
    /// # Errors
    ///
    /// - Return [`FlakeError::SourceNotFound`] if the location does not
    ///   resolve.
    #[instrument(skip(self), level = "debug", fields(identifier = %self.identifier))]
    pub fn invalidate_cache(&mut self) -> Result<(), FlakeError> {
        let pin = self
            .evaluator
            .prefetch(&self.identifier)
            .map_err(|err| FlakeError::SourceNotFound {
                identifier: self.identifier.clone(),
                source: err,
            })?;
        debug!("pinned {} at {}", self.identifier, pin.nar_hash);

        let cache_file = match &self.cache_root {
            Some(root) => path::flake_cache_file_in(root, &pin.nar_hash),
            None => path::flake_cache_file(&pin.nar_hash)?,
        };

        let mut cache = FlakeCache::with_store(self.store.clone());
        if cache_file.exists() {
            if let Err(err) = cache.load_from_file(&cache_file) {
                warn!("failed to load evaluation cache: {err}; continuing without cache");
            }
        }

        let metadata = self
            .evaluator
            .metadata(&self.identifier)
            .map_err(|err| FlakeError::SourceNotFound {
                identifier: self.identifier.clone(),
                source: err,
            })?;
        let (is_local, local_path) = resolve_original(&metadata, &pin);

        self.state = Some(Prefetched {
            pin,
            path: local_path,
            is_local,
            cache,
            cache_file,
        });

        Ok(())
    }

    /// Ensure every given selector is answerable from cache.
    ///
    /// Not-yet-cached selectors are fetched in one batched evaluator call;
    /// fully cached input issues no call at all.
    ///
    /// # Errors
    ///
    /// - Return [`FlakeError::Selector`] if any selector text is malformed.
    /// - Propagate batch failures from the evaluator boundary.
    #[instrument(skip(self, selectors), level = "debug")]
    pub fn precache(&mut self, selectors: &[&str]) -> Result<(), FlakeError> {
        self.ensure_prefetched()?;

        let mut missing: Vec<String> = Vec::new();
        match &self.state {
            Some(state) => {
                for selector in selectors {
                    if !state.cache.is_cached(selector)? {
                        missing.push((*selector).to_owned());
                    }
                }
            }
            None => return Err(FlakeError::Uninitialized),
        }

        if !missing.is_empty() {
            self.fetch_batch(&missing)?;
        }

        Ok(())
    }

    /// Select a value, fetching it through the evaluator on a cache miss.
    ///
    /// Successful selections mark their leaves as consumed for cache-hit
    /// instrumentation.
    ///
    /// # Errors
    ///
    /// - Return [`FlakeError::Selector`] if the selector text is malformed.
    /// - Return [`FlakeError::Cache`] for missing-key lookups.
    /// - Propagate batch failures from the evaluator boundary.
    #[instrument(skip(self), level = "debug")]
    pub fn select(&mut self, selector: &str) -> Result<Value, FlakeError> {
        self.ensure_prefetched()?;

        let cached = match &self.state {
            Some(state) => state.cache.is_cached(selector)?,
            None => return Err(FlakeError::Uninitialized),
        };
        if !cached {
            debug!("cache miss for {selector}");
            self.fetch_batch(std::slice::from_ref(&selector.to_owned()))?;
        }

        let parsed = parse_selector(selector)?;
        match self.state.as_mut() {
            Some(state) => {
                let value = state.cache.select(selector)?;
                state.cache.mark_path_accessed(&parsed);
                Ok(value)
            }
            None => Err(FlakeError::Uninitialized),
        }
    }

    /// Select a value namespaced under one machine's configuration.
    ///
    /// The selector is evaluated relative to the machine's entry in the
    /// fleet export, so callers address `config.networking.hostName` rather
    /// than spelling out the per-machine prefix.
    pub fn select_machine(&mut self, machine: &str, selector: &str) -> Result<Value, FlakeError> {
        let prefix = format!("{FLEET_EXPORT}.machines.{}", quote_key(machine));
        if selector.is_empty() {
            return self.select(&prefix);
        }
        self.select(&format!("{prefix}.{selector}"))
    }

    fn ensure_prefetched(&mut self) -> Result<(), FlakeError> {
        if self.state.is_none() {
            self.invalidate_cache()?;
        }
        Ok(())
    }

    /// One batched evaluator call for the given selector texts.
    ///
    /// Exactly one invocation is issued no matter how many selectors are in
    /// the batch. Results merge into the on-disk cache only after the whole
    /// batch succeeded and arrived with a matching count.
    fn fetch_batch(&mut self, selectors: &[String]) -> Result<(), FlakeError> {
        let mut canonical = Vec::with_capacity(selectors.len());
        for text in selectors {
            let parsed = parse_selector(text)?;
            canonical.push(selectors_as_json(&parsed).to_string());
        }

        self.ensure_prefetched()?;
        let pin = match &self.state {
            Some(state) => state.pin.clone(),
            None => return Err(FlakeError::Uninitialized),
        };

        info!(
            "evaluating {} uncached selectors against {}",
            selectors.len(),
            self.identifier,
        );
        let results = self
            .evaluator
            .fetch(&pin, &canonical, &self.options)
            .map_err(|err| match err {
                EvalError::MissingAttribute { attribute, .. } => FlakeError::SourceInvalid {
                    identifier: self.identifier.clone(),
                    attribute,
                },
                other => FlakeError::Evaluation {
                    selectors: selectors.to_vec(),
                    source: other,
                },
            })?;

        if results.len() != selectors.len() {
            return Err(FlakeError::CountMismatch {
                expected: selectors.len(),
                got: results.len(),
            });
        }

        match self.state.as_mut() {
            Some(state) => {
                // INVARIANT: Reload before merging so selections cached by
                // concurrent invocations survive this write.
                if state.cache_file.exists() {
                    if let Err(err) = state.cache.load_from_file(&state.cache_file) {
                        warn!("failed to reload cache before merge: {err}");
                    }
                }

                for (selector, value) in selectors.iter().zip(results.iter()) {
                    state.cache.insert(value, selector)?;
                }
                state.cache.save_to_file(&state.cache_file)?;
                Ok(())
            }
            None => Err(FlakeError::Uninitialized),
        }
    }
}

impl<E> std::fmt::Display for Flake<E> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.write_str(self.identifier.as_str())
    }
}

/// Resolve whether a source is local from its evaluator metadata.
fn resolve_original(metadata: &Value, pin: &FlakePin) -> (bool, PathBuf) {
    let original = metadata.get("original");

    if let Some(url) = original
        .and_then(|original| original.get("url"))
        .and_then(Value::as_str)
    {
        if let Some(path) = url.strip_prefix("file://").or_else(|| url.strip_prefix("file:")) {
            return (true, PathBuf::from(path));
        }
    }

    if let Some(path) = original
        .and_then(|original| original.get("path"))
        .and_then(Value::as_str)
    {
        return (true, PathBuf::from(path));
    }

    (false, pin.store_path.clone())
}

/// Evaluator boundary error types.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// Evaluator process could not be spawned.
    #[error("failed to spawn evaluator: {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Evaluator exited unsuccessfully.
    #[error("evaluator failed:\n{stderr}")]
    Failed { stderr: String },

    /// Evaluator reported a missing top-level attribute.
    #[error("evaluator reports attribute {attribute:?} missing:\n{stderr}")]
    MissingAttribute { attribute: String, stderr: String },

    /// Evaluator produced output that does not parse.
    #[error("evaluator returned invalid output")]
    Output {
        #[source]
        source: serde_json::Error,
    },
}

/// Flake orchestration error types.
#[derive(Debug, thiserror::Error)]
pub enum FlakeError {
    /// Source location does not resolve.
    #[error(
        "source {identifier:?} could not be resolved; \
         check that the location exists and is reachable"
    )]
    SourceNotFound {
        identifier: String,
        #[source]
        source: EvalError,
    },

    /// Source resolves but does not export the expected interface.
    #[error(
        "source {identifier:?} does not export the expected interface \
         (attribute {attribute:?} is missing); \
         point at a fleet source that exports `{FLEET_EXPORT}`"
    )]
    SourceInvalid { identifier: String, attribute: String },

    /// Evaluator invocation failed.
    #[error("evaluation failed for selectors {selectors:?}")]
    Evaluation {
        selectors: Vec<String>,
        #[source]
        source: EvalError,
    },

    /// Evaluator answered with the wrong number of results.
    #[error("evaluator returned {got} results for {expected} selectors")]
    CountMismatch { expected: usize, got: usize },

    /// Operation ran against an unresolved source.
    #[error("source state was not initialized")]
    Uninitialized,

    /// Cache tree rejected an operation.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Cache file could not be persisted.
    #[error(transparent)]
    CacheFile(#[from] CacheFileError),

    /// Selector text failed to parse.
    #[error(transparent)]
    Selector(#[from] SelectorError),

    /// Per-user cache directory cannot be determined.
    #[error(transparent)]
    CachePath(#[from] path::NoCacheHome),
}

/// Friendly result alias :3
pub type Result<T, E = FlakeError> = std::result::Result<T, E>;
