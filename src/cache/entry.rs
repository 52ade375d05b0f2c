// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Recursive cache entry tree.
//!
//! Each entry caches the evaluated value at one position of a fleet source's
//! attribute tree. An entry is either a __scalar__ (string, number, boolean,
//! or null) or a map of named __children__, never both. The two-variant
//! [`CacheValue`] makes the conflation of the two shapes unrepresentable
//! instead of a runtime invariant to police.
//!
//! The tree is only ever partially populated. Bookkeeping flags record what
//! the partial picture is allowed to claim:
//!
//! - `fetched_all` — every key at this level has been inserted at least once,
//!   so a missing child proves absence instead of staleness. Once set it
//!   stays set for the life of the process.
//! - `exists` — cleared on entries recording that a tolerant lookup found
//!   nothing. Recorded absence is itself a cacheable fact.
//! - `is_list` — the children represent a sequence and their keys are
//!   stringified indices.
//! - `num_accessed` — incremented on true leaves when a selection is marked
//!   as consumed. Instrumentation only, never persisted.
//!
//! Insertion, cache checks, and selection all walk the same selector
//! branching rules, so the three stay in agreement about which positions a
//! selector addresses.

use crate::{
    selector::{Selector, SetSelector},
    store::ArtifactStore,
};

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Value held by one cache entry: a scalar or a map of children.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    /// Terminal value: string, number, boolean, or null.
    Scalar(Value),

    /// Named child entries, possibly representing a sequence.
    Children(BTreeMap<String, CacheEntry>),
}

/// One node of the cache tree.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    value: CacheValue,
    is_list: bool,
    exists: bool,
    fetched_all: bool,
    num_accessed: u64,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            value: CacheValue::Children(BTreeMap::new()),
            is_list: false,
            exists: true,
            fetched_all: false,
            num_accessed: 0,
        }
    }
}

impl PartialEq for CacheEntry {
    /// Structural equality over value and flags.
    ///
    /// The access counter is process-lifetime instrumentation and does not
    /// participate, so a persisted and reloaded tree compares equal to the
    /// tree that produced it.
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
            && self.is_list == other.is_list
            && self.exists == other.exists
            && self.fetched_all == other.fetched_all
    }
}

impl CacheEntry {
    fn scalar(value: Value) -> Self {
        Self {
            value: CacheValue::Scalar(value),
            ..Self::default()
        }
    }

    /// Value held at this node.
    pub fn value(&self) -> &CacheValue {
        &self.value
    }

    /// Child entry by key, if this node has children.
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        match &self.value {
            CacheValue::Children(children) => children.get(key),
            CacheValue::Scalar(_) => None,
        }
    }

    /// Whether a tolerant lookup recorded this position as absent.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Whether every key at this level has been inserted.
    pub fn fetched_all(&self) -> bool {
        self.fetched_all
    }

    /// Whether the children represent a sequence.
    pub fn is_list(&self) -> bool {
        self.is_list
    }

    /// How many times this leaf was consumed by a marked selection.
    pub fn num_accessed(&self) -> u64 {
        self.num_accessed
    }

    fn children_mut(&mut self) -> Result<&mut BTreeMap<String, CacheEntry>> {
        match &mut self.value {
            CacheValue::Children(children) => Ok(children),
            CacheValue::Scalar(existing) => Err(CacheError::ShapeConflict {
                existing: existing.clone(),
            }),
        }
    }

    /// Insert an evaluated value along a selector path.
    ///
    /// An empty selector path bulk-populates every key found in the value,
    /// exactly like an explicit all-step. Plain steps pass the value through
    /// unchanged, because the evaluator already narrowed its result for them;
    /// tolerant steps and sets receive the enclosing attribute set and narrow
    /// here, recording absent tolerant keys as terminal facts.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::ScalarConflict`] if a differing scalar is
    ///   already cached at the addressed position.
    /// - Return [`CacheError::ShapeConflict`] if a scalar and an attribute
    ///   set collide at the same position.
    /// - Return [`CacheError::UnexpectedValue`] if the evaluator handed back
    ///   a shape the selector cannot have produced.
    pub fn insert(
        &mut self,
        value: &Value,
        selectors: &[Selector],
        store: &ArtifactStore,
    ) -> Result<()> {
        let all = Selector::All;
        let (selector, rest) = match selectors.split_first() {
            Some((selector, rest)) => (selector, rest),
            None => (&all, &[][..]),
        };

        // INVARIANT: Completeness at a level is monotonic once proven.
        if matches!(selector, Selector::All) {
            self.fetched_all = true;
        }

        match selector {
            Selector::Str(key) => self
                .children_mut()?
                .entry(key.clone())
                .or_default()
                .insert(value, rest, store),
            Selector::Maybe(key) => {
                let Some(map) = value.as_object() else {
                    return Err(CacheError::UnexpectedValue {
                        selector: selector.to_string(),
                        found: value.to_string(),
                    });
                };

                if let Some(sub) = map.get(key) {
                    self.children_mut()?
                        .entry(key.clone())
                        .or_default()
                        .insert(sub, rest, store)
                } else {
                    // Absence is terminal, unless completeness already
                    // proves it and no entry is needed.
                    if !self.fetched_all {
                        self.children_mut()?.entry(key.clone()).or_default().exists = false;
                    }
                    Ok(())
                }
            }
            Selector::All | Selector::Set(_) => self.insert_value(value, selector, rest, store),
        }
    }

    fn insert_value(
        &mut self,
        value: &Value,
        selector: &Selector,
        rest: &[Selector],
        store: &ArtifactStore,
    ) -> Result<()> {
        match value {
            Value::Object(map) => {
                if let Selector::Set(items) = selector {
                    if !self.fetched_all {
                        for item in items {
                            if let SetSelector::Maybe(key) = item {
                                if !map.contains_key(key) {
                                    self.children_mut()?
                                        .entry(key.clone())
                                        .or_default()
                                        .exists = false;
                                }
                            }
                        }
                    }
                }

                let children = self.children_mut()?;
                for (key, sub) in map {
                    children
                        .entry(key.clone())
                        .or_default()
                        .insert(sub, rest, store)?;
                }

                Ok(())
            }
            Value::Array(list) => {
                self.is_list = true;

                // Which indices the evaluator handed back, in order.
                let indices: Vec<String> = match selector {
                    Selector::Set(items) => {
                        items.iter().map(|item| item.value().to_owned()).collect()
                    }
                    _ => (0..list.len()).map(|index| index.to_string()).collect(),
                };

                let children = self.children_mut()?;
                for (position, index) in indices.iter().enumerate() {
                    let Some(sub) = list.get(position) else {
                        return Err(CacheError::UnexpectedValue {
                            selector: selector.to_string(),
                            found: value.to_string(),
                        });
                    };
                    children
                        .entry(index.clone())
                        .or_default()
                        .insert(sub, rest, store)?;
                }

                Ok(())
            }
            scalar => {
                if !rest.is_empty() {
                    return Err(CacheError::UnexpectedValue {
                        selector: selector.to_string(),
                        found: scalar.to_string(),
                    });
                }
                self.insert_scalar(scalar, store)
            }
        }
    }

    fn insert_scalar(&mut self, value: &Value, store: &ArtifactStore) -> Result<()> {
        // Store paths wrap as the default attribute, mirroring the
        // evaluator's convention that an attribute set resolves to its
        // outPath when no further key is selected.
        if let Some(text) = value.as_str() {
            if store.is_store_path(text) {
                return self.insert_out_path(value);
            }
        }

        match &self.value {
            CacheValue::Children(children) if children.is_empty() => {
                self.value = CacheValue::Scalar(value.clone());
                Ok(())
            }
            CacheValue::Scalar(existing) if existing == value => Ok(()),
            CacheValue::Scalar(existing) => Err(CacheError::ScalarConflict {
                existing: existing.clone(),
                attempted: value.clone(),
            }),
            CacheValue::Children(_) => Err(CacheError::ShapeConflict {
                existing: value.clone(),
            }),
        }
    }

    fn insert_out_path(&mut self, value: &Value) -> Result<()> {
        match &self.value {
            CacheValue::Children(children) if children.is_empty() => {
                let mut wrapped = BTreeMap::new();
                wrapped.insert("outPath".to_owned(), CacheEntry::scalar(value.clone()));
                self.value = CacheValue::Children(wrapped);
                Ok(())
            }
            CacheValue::Children(children) => match children.get("outPath") {
                Some(entry) if entry.value == CacheValue::Scalar(value.clone()) => Ok(()),
                _ => Err(CacheError::ShapeConflict {
                    existing: value.clone(),
                }),
            },
            CacheValue::Scalar(existing) => Err(CacheError::ScalarConflict {
                existing: existing.clone(),
                attempted: value.clone(),
            }),
        }
    }

    /// Whether a selection can be answered without another evaluator call.
    ///
    /// A cached scalar that references store artifacts only counts while
    /// every referenced artifact still exists; garbage collection flips such
    /// entries back to uncached until re-inserted. Recorded absence counts as
    /// cached, and so does a key proven missing by level completeness.
    pub fn is_cached(&self, selectors: &[Selector], store: &ArtifactStore) -> bool {
        let children = match &self.value {
            CacheValue::Scalar(value) => {
                // Deeper selectors against a scalar are allowed here; they
                // surface as missing-key errors at selection time.
                return match value.as_str() {
                    Some(text) => store.references_exist(text),
                    None => true,
                };
            }
            CacheValue::Children(children) => children,
        };

        let all = Selector::All;
        let (selector, rest) = match selectors.split_first() {
            Some((selector, rest)) => (selector, rest),
            None => (&all, &[][..]),
        };

        match selector {
            Selector::All => {
                self.fetched_all
                    && children
                        .values()
                        .filter(|child| child.exists)
                        .all(|child| child.is_cached(rest, store))
            }
            Selector::Set(items) => items.iter().all(|item| match children.get(item.value()) {
                None => self.fetched_all,
                Some(child) if !child.exists => true,
                Some(child) => child.is_cached(rest, store),
            }),
            Selector::Str(key) | Selector::Maybe(key) => match children.get(key) {
                None => self.fetched_all,
                Some(child) if !child.exists => true,
                Some(child) => child.is_cached(rest, store),
            },
        }
    }

    /// Select a value out of the cached tree.
    ///
    /// Pure and non-mutating. Mirrors the evaluator's default-attribute
    /// convention: an attribute set holding an `outPath` resolves to that
    /// scalar when no further key is requested. Tolerant lookups on missing
    /// data degrade to empty results instead of erroring.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::MissingKey`] if a plain, all, or set step
    ///   addresses a key that is not present, or descends into a scalar.
    pub fn select(&self, selectors: &[Selector]) -> Result<Value> {
        if selectors.is_empty() {
            match &self.value {
                CacheValue::Scalar(value) => return Ok(value.clone()),
                CacheValue::Children(children) => {
                    if let Some(CacheValue::Scalar(out_path)) =
                        children.get("outPath").map(CacheEntry::value)
                    {
                        return Ok(out_path.clone());
                    }
                }
            }
        }

        let children = match &self.value {
            CacheValue::Children(children) => children,
            CacheValue::Scalar(_) => {
                // A scalar cannot satisfy deeper selection.
                let selector = selectors.first().map_or("*".to_owned(), ToString::to_string);
                return Err(CacheError::MissingKey { selector });
            }
        };

        let all = Selector::All;
        let (selector, rest) = match selectors.split_first() {
            Some((selector, rest)) => (selector, rest),
            None => (&all, &[][..]),
        };

        match selector {
            Selector::Str(key) => match children.get(key) {
                Some(child) => child.select(rest),
                None => Err(CacheError::MissingKey {
                    selector: selector.to_string(),
                }),
            },
            Selector::Maybe(key) => match children.get(key) {
                Some(child) if child.exists => {
                    let mut narrowed = Map::new();
                    narrowed.insert(key.clone(), child.select(rest)?);
                    Ok(Value::Object(narrowed))
                }
                _ => Ok(json!({})),
            },
            Selector::All | Selector::Set(_) => {
                let keys: Vec<&str> = match selector {
                    Selector::Set(items) => {
                        let mut keys = Vec::with_capacity(items.len());
                        for item in items {
                            match item {
                                SetSelector::Str(key) => keys.push(key.as_str()),
                                SetSelector::Maybe(key) => {
                                    if children.get(key).is_some_and(|child| child.exists) {
                                        keys.push(key.as_str());
                                    }
                                }
                            }
                        }
                        keys
                    }
                    _ => {
                        let mut keys: Vec<&str> = children
                            .iter()
                            .filter(|(_, child)| child.exists)
                            .map(|(key, _)| key.as_str())
                            .collect();
                        // INVARIANT: Sequences rebuild in index order, not
                        // lexicographic key order.
                        if self.is_list {
                            keys.sort_by_key(|key| key.parse::<u64>().unwrap_or(u64::MAX));
                        }
                        keys
                    }
                };

                if self.is_list {
                    let mut list = Vec::with_capacity(keys.len());
                    for key in keys {
                        let child = children.get(key).ok_or_else(|| CacheError::MissingKey {
                            selector: key.to_owned(),
                        })?;
                        list.push(child.select(rest)?);
                    }
                    Ok(Value::Array(list))
                } else {
                    let mut object = Map::new();
                    for key in keys {
                        let child = children.get(key).ok_or_else(|| CacheError::MissingKey {
                            selector: key.to_owned(),
                        })?;
                        object.insert(key.to_owned(), child.select(rest)?);
                    }
                    Ok(Value::Object(object))
                }
            }
        }
    }

    /// Record that the leaves addressed by a selection were consumed.
    ///
    /// Walks the same branching rules as selection, incrementing the access
    /// counter only on true scalar leaves. Intermediate containers keep a
    /// zero counter and absent keys are skipped silently.
    pub fn mark_accessed(&mut self, selectors: &[Selector]) {
        let children = match &mut self.value {
            CacheValue::Scalar(_) => {
                self.num_accessed += 1;
                return;
            }
            CacheValue::Children(children) => children,
        };

        let all = Selector::All;
        let (selector, rest) = match selectors.split_first() {
            Some((selector, rest)) => (selector, rest),
            None => (&all, &[][..]),
        };

        match selector {
            Selector::Str(key) | Selector::Maybe(key) => {
                if let Some(child) = children.get_mut(key) {
                    child.mark_accessed(rest);
                }
            }
            Selector::Set(items) => {
                for item in items {
                    if let Some(child) = children.get_mut(item.value()) {
                        child.mark_accessed(rest);
                    }
                }
            }
            Selector::All => {
                for child in children.values_mut() {
                    child.mark_accessed(rest);
                }
            }
        }
    }

    /// Whether none of the leaves addressed by a selection were consumed.
    ///
    /// True only if every terminal node the selector reaches has a zero
    /// counter. Positions that do not exist in the tree are vacuously
    /// unaccessed.
    pub fn is_unaccessed(&self, selectors: &[Selector]) -> bool {
        let children = match &self.value {
            CacheValue::Scalar(_) => return self.num_accessed == 0,
            CacheValue::Children(children) => children,
        };

        let all = Selector::All;
        let (selector, rest) = match selectors.split_first() {
            Some((selector, rest)) => (selector, rest),
            None => (&all, &[][..]),
        };

        match selector {
            Selector::Str(key) | Selector::Maybe(key) => children
                .get(key)
                .is_none_or(|child| child.is_unaccessed(rest)),
            Selector::Set(items) => items.iter().all(|item| {
                children
                    .get(item.value())
                    .is_none_or(|child| child.is_unaccessed(rest))
            }),
            Selector::All => children.values().all(|child| child.is_unaccessed(rest)),
        }
    }

    /// On-disk JSON form of this subtree.
    ///
    /// The access counter is deliberately left out.
    pub fn as_json(&self) -> Value {
        let value = match &self.value {
            CacheValue::Scalar(value) => value.clone(),
            CacheValue::Children(children) => Value::Object(
                children
                    .iter()
                    .map(|(key, child)| (key.clone(), child.as_json()))
                    .collect(),
            ),
        };

        json!({
            "value": value,
            "is_list": self.is_list,
            "exists": self.exists,
            "fetched_all": self.fetched_all,
        })
    }

    /// Rebuild a subtree from its on-disk JSON form.
    ///
    /// Missing flags take their defaults, so older cache files stay
    /// readable.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::MalformedEntry`] if the JSON does not have the
    ///   entry shape.
    pub fn from_json(data: &Value) -> Result<Self> {
        let Some(object) = data.as_object() else {
            return Err(CacheError::MalformedEntry {
                found: data.to_string(),
            });
        };

        let value = match object.get("value") {
            Some(Value::Object(raw)) => {
                let mut children = BTreeMap::new();
                for (key, sub) in raw {
                    children.insert(key.clone(), CacheEntry::from_json(sub)?);
                }
                CacheValue::Children(children)
            }
            Some(Value::Array(_)) => {
                return Err(CacheError::MalformedEntry {
                    found: data.to_string(),
                });
            }
            Some(scalar) => CacheValue::Scalar(scalar.clone()),
            None => CacheValue::Scalar(Value::Null),
        };

        Ok(Self {
            value,
            is_list: object.get("is_list").and_then(Value::as_bool).unwrap_or(false),
            exists: object.get("exists").and_then(Value::as_bool).unwrap_or(true),
            fetched_all: object
                .get("fetched_all")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            num_accessed: 0,
        })
    }
}

/// Cache tree error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CacheError {
    /// Conflicting scalar re-insertion at one position.
    #[error("cannot insert {attempted} into cache, already have {existing}")]
    ScalarConflict { existing: Value, attempted: Value },

    /// Scalar and attribute set collided at one position.
    #[error("cannot mix scalar and attribute set at one cache position, have {existing}")]
    ShapeConflict { existing: Value },

    /// Evaluator result shape does not match the selector that produced it.
    #[error("selector {selector} cannot have produced evaluator value {found}")]
    UnexpectedValue { selector: String, found: String },

    /// Selection addressed a key that is not present.
    #[error("no cached key for selector {selector}")]
    MissingKey { selector: String },

    /// On-disk entry is not in the expected shape.
    #[error("malformed cache entry: {found}")]
    MalformedEntry { found: String },

    /// Selection text failed to parse.
    #[error(transparent)]
    Selector(#[from] crate::selector::SelectorError),
}

/// Friendly result alias :3
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::parse_selector;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> ArtifactStore {
        ArtifactStore::new("/nix/store")
    }

    fn entry_at<'a>(entry: &'a CacheEntry, path: &[&str]) -> &'a CacheEntry {
        let mut current = entry;
        for key in path {
            current = current.get(key).unwrap();
        }
        current
    }

    fn scalar_at(entry: &CacheEntry, path: &[&str]) -> Value {
        match entry_at(entry, path).value() {
            CacheValue::Scalar(value) => value.clone(),
            CacheValue::Children(_) => panic!("expected scalar at {path:?}"),
        }
    }

    #[test]
    fn insert_and_is_cached_plain_path() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(&json!("x"), &parse_selector("x.y.z")?, &store())?;

        assert_eq!(scalar_at(&cache, &["x", "y", "z"]), json!("x"));
        assert!(cache.is_cached(&parse_selector("x.y.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.y")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.1")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.*.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.{y}.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?y.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.?z.z")?, &store()));
        Ok(())
    }

    #[test]
    fn insert_and_is_cached_all_step() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(&json!({ "y": "x" }), &parse_selector("x.*.z")?, &store())?;

        assert_eq!(scalar_at(&cache, &["x", "y", "z"]), json!("x"));
        assert!(cache.is_cached(&parse_selector("x.*.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.y")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.y.x")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.1")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.{y}.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.{y,z}.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.{y,?z}.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?y.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?z.z")?, &store()));
        Ok(())
    }

    #[test]
    fn insert_and_is_cached_set_step() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(&json!({ "y": "x" }), &parse_selector("x.{y}.z")?, &store())?;

        assert_eq!(scalar_at(&cache, &["x", "y", "z"]), json!("x"));
        assert!(cache.is_cached(&parse_selector("x.{y}.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.y")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.1")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.*.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?y.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.?z.z")?, &store()));
        Ok(())
    }

    #[test]
    fn insert_and_is_cached_maybe_present() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(&json!({ "y": "x" }), &parse_selector("x.?y.z")?, &store())?;

        assert_eq!(scalar_at(&cache, &["x", "y", "z"]), json!("x"));
        assert!(cache.is_cached(&parse_selector("x.?y.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.y")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.1")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.*.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.{y}.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.?z.z")?, &store()));
        Ok(())
    }

    #[test]
    fn maybe_absence_is_cached_permanently() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(&json!({}), &parse_selector("x.?y.z")?, &store())?;

        assert!(!entry_at(&cache, &["x", "y"]).exists());
        assert!(cache.is_cached(&parse_selector("x.?y.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.1")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?y.z.1")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.*.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.{y}.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?y.abc")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.?z.z")?, &store()));

        // Selecting recorded absence degrades to an empty result.
        assert_eq!(cache.select(&parse_selector("x.y")?)?, json!({}));
        Ok(())
    }

    #[test]
    fn insert_and_is_cached_multi_set() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(
            &json!({ "y": 1, "z": 2 }),
            &parse_selector("x.{y,z}.z")?,
            &store(),
        )?;

        assert_eq!(scalar_at(&cache, &["x", "y", "z"]), json!(1));
        assert_eq!(scalar_at(&cache, &["x", "z", "z"]), json!(2));
        assert!(cache.is_cached(&parse_selector("x.{y,z}.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.y")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.1")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.*.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.{y}.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.?y.abc")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?z.z")?, &store()));
        Ok(())
    }

    #[test]
    fn sibling_scalar_inserts() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(&json!(1), &parse_selector("x.y")?, &store())?;
        cache.insert(&json!(2), &parse_selector("x.z")?, &store())?;

        assert_eq!(scalar_at(&cache, &["x", "y"]), json!(1));
        assert_eq!(scalar_at(&cache, &["x", "z"]), json!(2));
        assert!(cache.is_cached(&parse_selector("x.y")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.1")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.*.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.{y}.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?y.abc")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.?z.z")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.?x.z")?, &store()));
        Ok(())
    }

    #[test]
    fn deep_value_insert_is_fully_cached() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(
            &json!({ "a": { "b": { "c": 1 } } }),
            &parse_selector("x.y.z")?,
            &store(),
        )?;

        assert!(cache.is_cached(&parse_selector("x.y.z")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.a.b.c")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.a.b")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.a")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x.y")?, &store()));
        assert!(!cache.is_cached(&parse_selector("x")?, &store()));
        assert!(cache.is_cached(&parse_selector("x.y.z.xxx")?, &store()));
        Ok(())
    }

    #[test]
    fn conflicting_scalar_insert_fails() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        let selectors = parse_selector("x.y")?;
        cache.insert(&json!(1), &selectors, &store())?;

        // Identical re-insertion is a no-op.
        cache.insert(&json!(1), &selectors, &store())?;

        let result = cache.insert(&json!(2), &selectors, &store());
        assert!(matches!(
            result,
            Err(CacheError::ScalarConflict { existing, attempted })
                if existing == json!(1) && attempted == json!(2)
        ));
        assert_eq!(scalar_at(&cache, &["x", "y"]), json!(1));
        Ok(())
    }

    #[test]
    fn select_walks_every_step_kind() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(&json!("bla"), &parse_selector("a.b.c")?, &store())?;

        assert_eq!(cache.select(&parse_selector("a.b.c")?)?, json!("bla"));
        assert_eq!(cache.select(&parse_selector("a.b")?)?, json!({ "c": "bla" }));
        assert_eq!(
            cache.select(&parse_selector("a")?)?,
            json!({ "b": { "c": "bla" } }),
        );
        assert_eq!(
            cache.select(&parse_selector("a.b.?c")?)?,
            json!({ "c": "bla" }),
        );
        assert_eq!(
            cache.select(&parse_selector("a.?b.?c")?)?,
            json!({ "b": { "c": "bla" } }),
        );
        assert_eq!(cache.select(&parse_selector("a.?c")?)?, json!({}));
        assert_eq!(cache.select(&parse_selector("a.?x.c")?)?, json!({}));
        assert_eq!(
            cache.select(&parse_selector("a.*")?)?,
            json!({ "b": { "c": "bla" } }),
        );
        assert_eq!(
            cache.select(&parse_selector("a.*.*")?)?,
            json!({ "b": { "c": "bla" } }),
        );
        assert_eq!(cache.select(&parse_selector("a.*.c")?)?, json!({ "b": "bla" }));
        assert_eq!(cache.select(&parse_selector("a.b.*")?)?, json!({ "c": "bla" }));
        assert_eq!(cache.select(&parse_selector("a.{b}.c")?)?, json!({ "b": "bla" }));
        assert_eq!(
            cache.select(&parse_selector("a.{b}.{c}")?)?,
            json!({ "b": { "c": "bla" } }),
        );
        assert_eq!(cache.select(&parse_selector("a.b.{c}")?)?, json!({ "c": "bla" }));
        assert_eq!(cache.select(&parse_selector("a.{?b}.c")?)?, json!({ "b": "bla" }));
        assert_eq!(
            cache.select(&parse_selector("a.{?b,?x}.c")?)?,
            json!({ "b": "bla" }),
        );

        assert!(matches!(
            cache.select(&parse_selector("a.b.x")?),
            Err(CacheError::MissingKey { .. }),
        ));
        assert!(matches!(
            cache.select(&parse_selector("a.b.c.x")?),
            Err(CacheError::MissingKey { .. }),
        ));
        assert!(matches!(
            cache.select(&parse_selector("a.{b,x}.c")?),
            Err(CacheError::MissingKey { .. }),
        ));
        Ok(())
    }

    #[test]
    fn select_rebuilds_sequences() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(
            &json!({ "x": { "y": [123, 345, 456], "z": "bla" } }),
            &parse_selector("testdict")?,
            &store(),
        )?;

        assert_eq!(scalar_at(&cache, &["testdict", "x", "z"]), json!("bla"));
        assert_eq!(cache.select(&parse_selector("testdict.x.z")?)?, json!("bla"));
        assert_eq!(cache.select(&parse_selector("testdict.x.y.0")?)?, json!(123));
        assert_eq!(
            cache.select(&parse_selector("testdict.x.y")?)?,
            json!([123, 345, 456]),
        );
        assert!(entry_at(&cache, &["testdict", "x", "y"]).is_list());

        assert!(matches!(
            cache.select(&parse_selector("testdict.x.z.z")?),
            Err(CacheError::MissingKey { .. }),
        ));
        assert!(matches!(
            cache.select(&parse_selector("testdict.x.z.1")?),
            Err(CacheError::MissingKey { .. }),
        ));
        Ok(())
    }

    #[test]
    fn store_paths_wrap_as_default_attribute() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(
            &json!({ "x": { "y": [123, 345, 456], "z": "/nix/store/bla" } }),
            &[],
            &store(),
        )?;

        assert_eq!(
            cache.select(&parse_selector("x.z")?)?,
            json!("/nix/store/bla"),
        );
        assert_eq!(
            cache.select(&parse_selector("x.z.outPath")?)?,
            json!("/nix/store/bla"),
        );
        Ok(())
    }

    #[test]
    fn diagnostic_strings_are_stored_verbatim() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        let selectors = parse_selector("report")?;
        cache.insert(
            &json!("/nix/store/abc-src/flake.nix:12:5"),
            &selectors,
            &store(),
        )?;

        // No outPath wrapping happened.
        assert_eq!(
            scalar_at(&cache, &["report"]),
            json!("/nix/store/abc-src/flake.nix:12:5"),
        );
        Ok(())
    }

    #[test]
    fn gc_flips_cached_store_paths_to_uncached() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = ArtifactStore::new(root.path());

        let artifact = root.path().join("abc123-test-output");
        std::fs::write(&artifact, "test content")?;

        let mut cache = CacheEntry::default();
        let selectors = parse_selector("testOutput")?;
        cache.insert(
            &json!(artifact.to_string_lossy().into_owned()),
            &selectors,
            &store,
        )?;

        assert!(cache.is_cached(&selectors, &store));
        assert_eq!(
            cache.select(&selectors)?,
            json!(artifact.to_string_lossy().into_owned()),
        );

        // Out-of-band garbage collection invalidates the entry while the
        // in-memory value stays put.
        std::fs::remove_file(&artifact)?;
        assert!(!cache.is_cached(&selectors, &store));
        assert_eq!(
            cache.select(&selectors)?,
            json!(artifact.to_string_lossy().into_owned()),
        );
        Ok(())
    }

    #[test]
    fn all_and_set_selections_agree() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(
            &json!({ "y": { "z": 1 }, "z": { "z": 2 } }),
            &parse_selector("x.*")?,
            &store(),
        )?;

        assert!(cache.is_cached(&parse_selector("x.{y,z}.z")?, &store()));
        assert_eq!(
            cache.select(&parse_selector("x.{y,z}.z")?)?,
            json!({ "y": 1, "z": 2 }),
        );
        assert_eq!(
            cache.select(&parse_selector("x.*.z")?)?,
            json!({ "y": 1, "z": 2 }),
        );
        Ok(())
    }

    #[test]
    fn insert_is_idempotent() -> anyhow::Result<()> {
        let value = json!({ "y": { "z": 1 }, "z": { "z": 2 } });
        let selectors = parse_selector("x.*")?;

        let mut once = CacheEntry::default();
        once.insert(&value, &selectors, &store())?;

        let mut twice = CacheEntry::default();
        twice.insert(&value, &selectors, &store())?;
        twice.insert(&value, &selectors, &store())?;

        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn json_round_trip_preserves_structure() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(
            &json!({ "hosts": { "alpha": "10.0.0.1" }, "count": 2, "tags": ["a", "b"] }),
            &[],
            &store(),
        )?;
        cache.insert(&json!({}), &parse_selector("meta.?missing.name")?, &store())?;

        let reloaded = CacheEntry::from_json(&cache.as_json())?;
        assert_eq!(reloaded, cache);
        Ok(())
    }

    #[test]
    fn access_marks_hit_only_leaves() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(
            &json!({ "level1": { "level2": { "leaf": "value" } } }),
            &[],
            &store(),
        )?;

        let selectors = parse_selector("level1.level2.leaf")?;
        assert!(cache.is_unaccessed(&selectors));

        cache.mark_accessed(&selectors);
        assert!(!cache.is_unaccessed(&selectors));

        assert_eq!(cache.num_accessed(), 0);
        assert_eq!(entry_at(&cache, &["level1"]).num_accessed(), 0);
        assert_eq!(entry_at(&cache, &["level1", "level2"]).num_accessed(), 0);
        assert_eq!(
            entry_at(&cache, &["level1", "level2", "leaf"]).num_accessed(),
            1,
        );
        Ok(())
    }

    #[test]
    fn access_marks_fan_out_through_sets_and_all() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(
            &json!({
                "apps": { "web": "web-app", "api": "api-service", "db": "database" },
                "items": ["item0", "item1", "item2"],
            }),
            &[],
            &store(),
        )?;

        cache.mark_accessed(&parse_selector("apps.{web,api}")?);
        assert!(!cache.is_unaccessed(&parse_selector("apps.web")?));
        assert!(!cache.is_unaccessed(&parse_selector("apps.api")?));
        assert!(cache.is_unaccessed(&parse_selector("apps.db")?));
        assert_eq!(entry_at(&cache, &["apps"]).num_accessed(), 0);

        cache.mark_accessed(&parse_selector("apps.*")?);
        assert_eq!(entry_at(&cache, &["apps", "web"]).num_accessed(), 2);
        assert_eq!(entry_at(&cache, &["apps", "db"]).num_accessed(), 1);

        cache.mark_accessed(&parse_selector("items.1")?);
        assert!(cache.is_unaccessed(&parse_selector("items.0")?));
        assert!(!cache.is_unaccessed(&parse_selector("items.1")?));
        Ok(())
    }

    #[test]
    fn access_marks_skip_missing_paths() -> anyhow::Result<()> {
        let mut cache = CacheEntry::default();
        cache.insert(&json!({ "exists": "value" }), &[], &store())?;

        assert!(cache.is_unaccessed(&parse_selector("does.not.exist")?));
        cache.mark_accessed(&parse_selector("does.not.exist")?);
        assert!(cache.is_unaccessed(&parse_selector("does.not.exist")?));

        // A set selection is accessed as soon as any member is.
        cache.mark_accessed(&parse_selector("exists")?);
        assert!(!cache.is_unaccessed(&parse_selector("{exists,missing}")?));
        Ok(())
    }
}
