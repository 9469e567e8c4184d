//! Subscription filters: parsing, validation, and event matching.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::event::{is_hex, Event, Tag};

/// Largest kind number an event or filter may carry.
pub const MAX_KIND: i64 = 65535;

/// A conjunction of optional predicates over events. Absent fields are
/// unconstrained; clients combine several filters disjunctively per
/// subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    /// Single-letter tag queries, keyed by the letter of the `#X` field.
    pub tags: Option<BTreeMap<char, Vec<String>>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter must be a json object")]
    NotAnObject,
    #[error("{0} must be an array of strings")]
    ExpectedStringArray(&'static str),
    #[error("{0} contains a non-hex entry")]
    NotHex(&'static str),
    #[error("kinds must be an array of integers")]
    ExpectedKindArray,
    #[error("kind out of range: {0}")]
    KindOutOfRange(i64),
    #[error("{0} must be a non-negative integer")]
    ExpectedNonNegative(&'static str),
    #[error("since is after until")]
    InvertedWindow,
    #[error("unknown filter field: {0}")]
    UnknownField(String),
    #[error("too short {what} prefix: min prefix should be {min} or more")]
    ShortPrefix { what: String, min: usize },
}

/// Letter of a `#X` tag query key, for `X` in `[A-Za-z]`.
fn tag_key(key: &str) -> Option<char> {
    let bytes = key.as_bytes();
    if bytes.len() == 2 && bytes[0] == b'#' && bytes[1].is_ascii_alphabetic() {
        Some(bytes[1] as char)
    } else {
        None
    }
}

fn string_list(v: &Value, what: &'static str) -> Result<Vec<String>, FilterError> {
    let arr = v.as_array().ok_or(FilterError::ExpectedStringArray(what))?;
    arr.iter()
        .map(|e| {
            e.as_str()
                .map(str::to_string)
                .ok_or(FilterError::ExpectedStringArray(what))
        })
        .collect()
}

fn hex_list(v: &Value, what: &'static str) -> Result<Vec<String>, FilterError> {
    let entries = string_list(v, what)?;
    if entries.iter().any(|e| !is_hex(e)) {
        return Err(FilterError::NotHex(what));
    }
    Ok(entries)
}

fn non_negative(v: &Value, what: &'static str) -> Result<i64, FilterError> {
    v.as_i64()
        .filter(|n| *n >= 0)
        .ok_or(FilterError::ExpectedNonNegative(what))
}

impl Filter {
    /// Strict structural parse of a filter object. Unknown fields and
    /// type mismatches fail fast.
    pub fn from_value(val: &Value) -> Result<Filter, FilterError> {
        let obj = val.as_object().ok_or(FilterError::NotAnObject)?;
        let mut filter = Filter::default();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(hex_list(v, "ids")?),
                "authors" => filter.authors = Some(hex_list(v, "authors")?),
                "kinds" => {
                    let arr = v.as_array().ok_or(FilterError::ExpectedKindArray)?;
                    let mut kinds = Vec::with_capacity(arr.len());
                    for k in arr {
                        let k = k.as_i64().ok_or(FilterError::ExpectedKindArray)?;
                        if !(0..=MAX_KIND).contains(&k) {
                            return Err(FilterError::KindOutOfRange(k));
                        }
                        kinds.push(k as u16);
                    }
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(non_negative(v, "since")?),
                "until" => filter.until = Some(non_negative(v, "until")?),
                "limit" => filter.limit = Some(non_negative(v, "limit")? as u64),
                other => match tag_key(other) {
                    Some(letter) => {
                        let values = string_list(v, "tag query")?;
                        filter
                            .tags
                            .get_or_insert_with(BTreeMap::new)
                            .insert(letter, values);
                    }
                    None => return Err(FilterError::UnknownField(other.to_string())),
                },
            }
        }
        if let (Some(since), Some(until)) = (filter.since, filter.until) {
            if since > until {
                return Err(FilterError::InvertedWindow);
            }
        }
        Ok(filter)
    }

    /// Enforce the configured minimum prefix length on `ids`, `authors`,
    /// and `#e`/`#p` tag values.
    pub fn check_min_prefix(&self, min: usize) -> Result<(), FilterError> {
        if min == 0 {
            return Ok(());
        }
        for (what, entries) in [("ids", &self.ids), ("authors", &self.authors)] {
            if let Some(entries) = entries {
                if entries.iter().any(|e| e.len() < min) {
                    return Err(FilterError::ShortPrefix {
                        what: what.into(),
                        min,
                    });
                }
            }
        }
        if let Some(tags) = &self.tags {
            for letter in ['e', 'p'] {
                if let Some(values) = tags.get(&letter) {
                    if values.iter().any(|v| v.len() < min) {
                        return Err(FilterError::ShortPrefix {
                            what: format!("#{letter}"),
                            min,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Pure conjunction of all present predicates.
    pub fn matches(&self, event: &Event) -> bool {
        self.match_ids(event)
            && self.match_authors(event)
            && self.match_kinds(event)
            && self.match_tags(event)
            && self.match_since(event)
            && self.match_until(event)
    }

    fn match_ids(&self, event: &Event) -> bool {
        self.ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|p| event.id.starts_with(p)))
    }

    fn match_authors(&self, event: &Event) -> bool {
        self.authors.as_ref().map_or(true, |authors| {
            authors.iter().any(|p| event.pubkey.starts_with(p))
        })
    }

    fn match_kinds(&self, event: &Event) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&event.kind))
    }

    fn match_tags(&self, event: &Event) -> bool {
        self.tags.as_ref().map_or(true, |tags| {
            tags.iter().all(|(letter, prefixes)| {
                prefixes.iter().any(|prefix| {
                    event.tags.iter().any(|Tag(fields)| match fields.as_slice() {
                        [name, value, ..] => {
                            name.len() == 1
                                && name.starts_with(*letter)
                                && value.starts_with(prefix)
                        }
                        _ => false,
                    })
                })
            })
        })
    }

    fn match_since(&self, event: &Event) -> bool {
        self.since.map_or(true, |since| since <= event.created_at)
    }

    fn match_until(&self, event: &Event) -> bool {
        self.until.map_or(true, |until| event.created_at <= until)
    }
}

/// A matcher that records how many events it has accepted and refuses
/// further matches once its filter's limit is reached.
#[derive(Debug, Clone)]
pub struct CountedMatcher {
    filter: Filter,
    count: u64,
}

impl CountedMatcher {
    pub fn new(filter: Filter) -> Self {
        Self { filter, count: 0 }
    }

    /// Side-effect-free predicate, shared with historical scans.
    pub fn matches(&self, event: &Event) -> bool {
        self.filter.matches(event)
    }

    /// Counting predicate: a successful match advances the counter. A
    /// matcher that has reached its limit no longer matches.
    pub fn count_match(&mut self, event: &Event) -> bool {
        if self.done() {
            return false;
        }
        if self.filter.matches(event) {
            self.count += 1;
            return true;
        }
        false
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn done(&self) -> bool {
        self.filter.limit.is_some_and(|limit| self.count >= limit)
    }
}

/// Disjunction over one subscription's filters.
#[derive(Debug, Clone)]
pub struct MatcherSet {
    matchers: Vec<CountedMatcher>,
}

impl MatcherSet {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self {
            matchers: filters.into_iter().map(CountedMatcher::new).collect(),
        }
    }

    /// Side-effect-free disjunction.
    pub fn matches(&self, event: &Event) -> bool {
        self.matchers.iter().any(|m| m.matches(event))
    }

    /// Counting disjunction. Every inner matcher is evaluated so each
    /// counter advances; there is no short-circuit.
    pub fn count_match(&mut self, event: &Event) -> bool {
        let mut matched = false;
        for m in &mut self.matchers {
            matched = m.count_match(event) || matched;
        }
        matched
    }

    /// Maximum of the inner counts, the value reported for COUNT.
    pub fn count(&self) -> u64 {
        self.matchers.iter().map(CountedMatcher::count).max().unwrap_or(0)
    }

    pub fn done(&self) -> bool {
        self.matchers.iter().all(CountedMatcher::done)
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}
