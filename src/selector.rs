// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Selector path-query micro-language.
//!
//! A __selector__ addresses one or more positions inside the attribute tree
//! exported by a fleet source. Selectors are written as dot-separated path
//! steps, e.g. `machines.*.config.networking.hostName`. Each step is one of:
//!
//! - `name` — a plain key lookup.
//! - `*` — every key at the current level.
//! - `?name` — a key lookup that tolerates absence.
//! - `{a,?b,c}` — a multi-key lookup whose items are plain or tolerant.
//!
//! Keys containing special characters can be quoted with double quotes, and
//! `\` escapes the next character anywhere a key body is being read. The
//! parsed form also has a canonical JSON encoding used to hand selectors to
//! the external evaluator, see [`selectors_as_json`].

use serde_json::{json, Value};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// One step of a selector path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Select every key at this level (`*`).
    All,

    /// Select one key by name.
    Str(String),

    /// Select one key by name, tolerating its absence (`?name`).
    Maybe(String),

    /// Select a set of keys in one step (`{a,?b}`).
    Set(Vec<SetSelector>),
}

/// One item inside a [`Selector::Set`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSelector {
    /// Plain item, must exist.
    Str(String),

    /// Tolerant item, may be absent (`?name`).
    Maybe(String),
}

impl SetSelector {
    /// Key name addressed by this item.
    pub fn value(&self) -> &str {
        match self {
            Self::Str(value) | Self::Maybe(value) => value,
        }
    }

    fn as_json(&self) -> Value {
        match self {
            Self::Str(value) => json!({ "type": "str", "value": value }),
            Self::Maybe(value) => json!({ "type": "maybe", "value": value }),
        }
    }
}

impl Selector {
    /// Canonical JSON form of this step for the evaluator boundary.
    pub fn as_json(&self) -> Value {
        match self {
            Self::All => json!({ "type": "all" }),
            Self::Str(value) => json!({ "type": "str", "value": value }),
            Self::Maybe(value) => json!({ "type": "maybe", "value": value }),
            Self::Set(items) => json!({
                "type": "set",
                "value": items.iter().map(SetSelector::as_json).collect::<Vec<_>>(),
            }),
        }
    }
}

impl Display for Selector {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::All => fmt.write_str("*"),
            Self::Str(value) => fmt.write_str(quote_key(value).as_str()),
            Self::Maybe(value) => write!(fmt, "?{}", quote_key(value)),
            Self::Set(items) => {
                let rendered = items
                    .iter()
                    .map(|item| match item {
                        SetSelector::Str(value) => quote_key(value),
                        SetSelector::Maybe(value) => format!("?{}", quote_key(value)),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                write!(fmt, "{{{rendered}}}")
            }
        }
    }
}

/// Canonical JSON form of a full selector path.
///
/// The wire form is an ordered array of `{type, value?}` objects. It is the
/// only representation the evaluator boundary accepts.
pub fn selectors_as_json(selectors: &[Selector]) -> Value {
    Value::Array(selectors.iter().map(Selector::as_json).collect())
}

/// Quote a key for embedding into selector source text.
///
/// Plain keys pass through untouched. Keys containing grammar metacharacters
/// come back wrapped in double quotes with embedded quotes and backslashes
/// escaped.
pub fn quote_key(key: &str) -> String {
    let plain = !key.is_empty()
        && !key
            .chars()
            .any(|c| matches!(c, '.' | '*' | '?' | '"' | '{' | '}' | ',' | '\\'));
    if plain {
        return key.to_owned();
    }

    let mut quoted = String::with_capacity(key.len() + 2);
    quoted.push('"');
    for c in key.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Parser state for one position in the input.
///
/// The parser is a single pass over the input characters with a small state
/// stack: quoting and escaping nest inside bare bodies, maybe bodies, and set
/// items, so the current state alone is not enough to know where a closing
/// quote or escaped character should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Unquoted key body.
    Bare,

    /// Key body after a leading `?`.
    MaybeBody,

    /// Inside a double-quoted key body.
    Quote,

    /// Immediately after a `\`.
    Escape,

    /// Inside a `{...}` set.
    Set,

    /// Step complete, only `.` or end of input may follow.
    End,
}

/// Parse selector source text into its path steps.
///
/// An empty input parses to an empty path, which addresses the whole tree.
///
/// # Errors
///
/// - Return [`SelectorError::UnbalancedQuote`] if a quoted body never closes.
/// - Return [`SelectorError::UnbalancedSet`] if a `{` never closes.
/// - Return [`SelectorError::TrailingEscape`] if the input ends on `\`.
/// - Return [`SelectorError::ExpectedDot`] if a completed step is followed by
///   anything other than `.` or end of input.
/// - Return [`SelectorError::ExpectedSeparator`] if a quoted set item is
///   followed by anything other than `,` or `}`.
/// - Return [`SelectorError::ReservedSetItem`] if a set names `outPath`.
///   Multiselecting it would silently collapse to the default-attribute
///   scalar and break any further selection on the result.
pub fn parse_selector(text: &str) -> Result<Vec<Selector>> {
    let mut stack: Vec<State> = Vec::new();
    let mut selectors: Vec<Selector> = Vec::new();
    let mut acc = String::new();

    // Bookkeeping local to the current set item.
    let mut items: Vec<SetSelector> = Vec::new();
    let mut item_maybe = false;
    let mut item_started = false;
    let mut item_quoted = false;

    fn finish_item(acc: &mut String, item_maybe: &mut bool, items: &mut Vec<SetSelector>) {
        let value = std::mem::take(acc);
        items.push(if *item_maybe {
            SetSelector::Maybe(value)
        } else {
            SetSelector::Str(value)
        });
        *item_maybe = false;
    }

    for (at, c) in text.char_indices() {
        match stack.last().copied() {
            // Start of a new path step.
            None => match c {
                '*' => {
                    selectors.push(Selector::All);
                    stack.push(State::End);
                }
                '?' => stack.push(State::MaybeBody),
                '"' => {
                    stack.push(State::Bare);
                    stack.push(State::Quote);
                }
                '{' => stack.push(State::Set),
                '.' => selectors.push(Selector::Str(String::new())),
                _ => {
                    stack.push(State::Bare);
                    acc.push(c);
                }
            },
            Some(State::End) => {
                if c != '.' {
                    return Err(SelectorError::ExpectedDot {
                        found: c,
                        at,
                        selector: text.to_owned(),
                    });
                }
                stack.pop();
            }
            Some(State::Bare | State::MaybeBody) => match c {
                '.' => {
                    let state = stack.pop();
                    let value = std::mem::take(&mut acc);
                    selectors.push(match state {
                        Some(State::MaybeBody) => Selector::Maybe(value),
                        _ => Selector::Str(value),
                    });
                }
                '\\' => stack.push(State::Escape),
                _ => acc.push(c),
            },
            Some(State::Quote) => match c {
                '"' => {
                    stack.pop();
                    if stack.last() == Some(&State::Bare) {
                        // INVARIANT: A top-level quoted key is a whole step.
                        stack.pop();
                        selectors.push(Selector::Str(std::mem::take(&mut acc)));
                        stack.push(State::End);
                    } else {
                        item_quoted = true;
                    }
                }
                '\\' => stack.push(State::Escape),
                _ => acc.push(c),
            },
            Some(State::Escape) => {
                stack.pop();
                acc.push(c);
            }
            Some(State::Set) => {
                if item_quoted && c != ',' && c != '}' {
                    return Err(SelectorError::ExpectedSeparator {
                        found: c,
                        at,
                        selector: text.to_owned(),
                    });
                }

                match c {
                    '?' if !item_started => {
                        item_maybe = true;
                        item_started = true;
                    }
                    '\\' => {
                        stack.push(State::Escape);
                        item_started = true;
                    }
                    '"' => {
                        stack.push(State::Quote);
                        item_started = true;
                    }
                    ',' => {
                        finish_item(&mut acc, &mut item_maybe, &mut items);
                        item_started = false;
                        item_quoted = false;
                    }
                    '}' => {
                        finish_item(&mut acc, &mut item_maybe, &mut items);
                        item_started = false;
                        item_quoted = false;

                        if items.iter().any(|item| item.value() == "outPath") {
                            return Err(SelectorError::ReservedSetItem {
                                selector: text.to_owned(),
                            });
                        }

                        selectors.push(Selector::Set(std::mem::take(&mut items)));
                        stack.pop();
                        stack.push(State::End);
                    }
                    _ => {
                        acc.push(c);
                        item_started = true;
                    }
                }
            }
        }
    }

    match stack.pop() {
        None | Some(State::End) => {}
        Some(State::Bare) => selectors.push(Selector::Str(acc)),
        Some(State::MaybeBody) => selectors.push(Selector::Maybe(acc)),
        Some(State::Quote) => {
            return Err(SelectorError::UnbalancedQuote {
                selector: text.to_owned(),
            })
        }
        Some(State::Escape) => {
            return Err(SelectorError::TrailingEscape {
                selector: text.to_owned(),
            })
        }
        Some(State::Set) => {
            return Err(SelectorError::UnbalancedSet {
                selector: text.to_owned(),
            })
        }
    }

    Ok(selectors)
}

/// Selector grammar error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    /// Quoted key body never closed.
    #[error("unbalanced quote in selector {selector:?}")]
    UnbalancedQuote { selector: String },

    /// Set opened with `{` but never closed.
    #[error("unbalanced brace in selector {selector:?}")]
    UnbalancedSet { selector: String },

    /// Input ended in the middle of an escape sequence.
    #[error("trailing escape at end of selector {selector:?}")]
    TrailingEscape { selector: String },

    /// Completed step followed by something other than `.` or end of input.
    #[error("expected '.' but found {found:?} at byte {at} in selector {selector:?}")]
    ExpectedDot { found: char, at: usize, selector: String },

    /// Quoted set item followed by something other than `,` or `}`.
    #[error("expected ',' or '}}' but found {found:?} at byte {at} in selector {selector:?}")]
    ExpectedSeparator { found: char, at: usize, selector: String },

    /// Sets cannot multiselect the default-attribute key.
    #[error("selector {selector:?} uses the reserved name \"outPath\" inside a set")]
    ReservedSetItem { selector: String },
}

/// Friendly result alias :3
pub type Result<T, E = SelectorError> = std::result::Result<T, E>;
