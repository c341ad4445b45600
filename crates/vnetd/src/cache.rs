//! Last-observed counter values.
//!
//! Two independent maps are kept: one for change detection on the slow
//! path and one for delta computation on the fast path. A key absent from
//! a map has never been seen, so its first observation always counts as a
//! change. Nothing is evicted; the key space is bounded by the fixed set of
//! interfaces and counter names.

use crate::counter::is_counter_like;
use crate::platform::EntityId;
use std::collections::HashMap;

/// (entity, normalized counter name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub entity: EntityId,
    pub counter: String,
}

impl CounterKey {
    pub fn new(entity: EntityId, counter: impl Into<String>) -> Self {
        Self {
            entity,
            counter: counter.into(),
        }
    }
}

/// Counter cache owned by the scheduler thread.
#[derive(Debug, Default)]
pub struct CounterCache {
    last: HashMap<CounterKey, u64>,
    last_delta: HashMap<CounterKey, u64>,
}

impl CounterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value`; true when the key is new or the value differs.
    pub fn update(&mut self, key: CounterKey, value: u64) -> bool {
        match self.last.insert(key, value) {
            Some(previous) => previous != value,
            None => true,
        }
    }

    /// Records `value` in the delta map and returns `(delta, changed)`.
    ///
    /// Counter-like keys yield the increase since the previous sample; a
    /// first sample or a counter that went backwards yields 0. Other keys
    /// yield the value itself when it changed and 0 otherwise.
    pub fn update_delta(&mut self, key: CounterKey, value: u64) -> (u64, bool) {
        let counter_like = is_counter_like(&key.counter);
        let previous = self.last_delta.insert(key, value);
        let changed = previous != Some(value);
        let delta = if counter_like {
            previous.map_or(0, |p| value.saturating_sub(p))
        } else if changed {
            value
        } else {
            0
        };
        (delta, changed)
    }

    /// Entries in the slow-path map.
    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
