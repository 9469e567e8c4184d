//! Bounded in-memory event store backing historical replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::collections::{OrderedMap, RandCache, RingBuffer};
use crate::event::{Event, KindClass};
use crate::filter::{Filter, MatcherSet};

/// Timeline key ordering events newest first, ties broken by id ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimelineKey {
    created_at: i64,
    id: String,
}

impl TimelineKey {
    fn for_event(event: &Event) -> Self {
        Self {
            created_at: event.created_at,
            id: event.id.clone(),
        }
    }
}

impl Ord for TimelineKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for TimelineKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Identity under which replaceable events supersede each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReplaceKey {
    pubkey: String,
    kind: u16,
    d: Option<String>,
}

impl ReplaceKey {
    fn for_event(event: &Event) -> Option<Self> {
        match event.kind_class() {
            KindClass::Replaceable => Some(Self {
                pubkey: event.pubkey.clone(),
                kind: event.kind,
                d: None,
            }),
            KindClass::ParamReplaceable => Some(Self {
                pubkey: event.pubkey.clone(),
                kind: event.kind,
                d: Some(event.tag_value("d").unwrap_or_default().to_string()),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Newly retained; queryable from the timeline.
    Stored,
    /// Already seen, or superseded by a newer replaceable version.
    Duplicate,
    /// Ephemeral kinds are fanned out but never retained.
    Ephemeral,
}

struct Inner {
    rings: HashMap<KindClass, RingBuffer<Arc<Event>>>,
    seen: RandCache<String, ()>,
    latest: HashMap<ReplaceKey, Arc<Event>>,
}

/// Bounded store of recently seen events: one FIFO ring per kind class
/// plus a shared timeline index scanned newest first.
pub struct Cache {
    capacity: usize,
    inner: Mutex<Inner>,
    timeline: OrderedMap<TimelineKey, Arc<Event>>,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                rings: HashMap::new(),
                // the seen set spans all kind-class rings
                seen: RandCache::new(capacity * 4),
                latest: HashMap::new(),
            }),
            timeline: OrderedMap::new(),
        }
    }

    /// Retain `event`. Idempotent on the event id; assumes the event has
    /// already been verified.
    pub fn save(&self, event: Arc<Event>) -> SaveOutcome {
        let class = event.kind_class();
        if class == KindClass::Ephemeral {
            return SaveOutcome::Ephemeral;
        }
        let mut inner = self.inner.lock().expect("cache lock");
        if !inner.seen.insert(event.id.clone(), ()) {
            return SaveOutcome::Duplicate;
        }
        if let Some(key) = ReplaceKey::for_event(&event) {
            if let Some(prev) = inner.latest.get(&key) {
                if prev.created_at >= event.created_at {
                    return SaveOutcome::Duplicate;
                }
                self.timeline.remove(&TimelineKey::for_event(prev));
            }
            inner.latest.insert(key, event.clone());
        }
        let capacity = self.capacity;
        let evicted = inner
            .rings
            .entry(class)
            .or_insert_with(|| RingBuffer::new(capacity))
            .push(event.clone());
        if let Some(evicted) = evicted {
            self.timeline.remove(&TimelineKey::for_event(&evicted));
            if let Some(key) = ReplaceKey::for_event(&evicted) {
                if inner
                    .latest
                    .get(&key)
                    .is_some_and(|cur| Arc::ptr_eq(cur, &evicted))
                {
                    inner.latest.remove(&key);
                }
            }
        }
        self.timeline.insert(TimelineKey::for_event(&event), event);
        SaveOutcome::Stored
    }

    /// Events accepted by `matchers`, newest first, with per-filter limits
    /// honored cumulatively.
    ///
    /// The caller keeps the matcher set: a subscription that replays
    /// history through it carries the same counters into live delivery.
    pub fn find_all(&self, matchers: &mut MatcherSet) -> Vec<Arc<Event>> {
        let mut found = Vec::new();
        self.timeline.scan(|_, event| {
            if matchers.done() {
                return false;
            }
            if matchers.count_match(event) {
                found.push(event.clone());
            }
            true
        });
        found
    }

    /// Number of retained events matching the disjunction of `filters`.
    pub fn count(&self, filters: &[Filter]) -> u64 {
        let mut set = MatcherSet::new(filters.to_vec());
        self.timeline.scan(|_, event| {
            if set.done() {
                return false;
            }
            set.count_match(event);
            true
        });
        set.count()
    }

    pub fn len(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty()
    }
}
