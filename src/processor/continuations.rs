//! In-memory fast path for partitions with more work than one pass covers.
//!
//! A continuation re-visits a partition on the next tick without waiting for
//! its durable pointer to come due. Entries are per process and bounded; a
//! partition continued too many times in a row is put on cooldown.

use std::collections::HashMap;

use parking_lot::Mutex;

/// What `Continuations::add` did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueEvent {
    Added,
    /// An entry with the same or a higher count already exists.
    Unchanged,
    /// The map is at capacity.
    Full,
    /// The partition is cooling down.
    Cooling,
    /// The count passed the maximum; the entry was replaced by a cooldown.
    CooledDown,
}

impl ContinueEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinueEvent::Added => "added",
            ContinueEvent::Unchanged => "unchanged",
            ContinueEvent::Full => "full",
            ContinueEvent::Cooling => "cooling",
            ContinueEvent::CooledDown => "cooled_down",
        }
    }
}

/// True once a partition has been continued more than `max_count` times in a row.
pub fn exceeds_limit(count: u32, max_count: u32) -> bool {
    count > max_count
}

struct Entry<T> {
    count: u32,
    value: T,
}

struct State<T> {
    entries: HashMap<String, Entry<T>>,
    cooldowns: HashMap<String, i64>,
}

pub struct Continuations<T> {
    state: Mutex<State<T>>,
    limit: usize,
    max_count: u32,
    cooldown_ms: i64,
}

impl<T: Clone> Continuations<T> {
    pub fn new(limit: usize, max_count: u32, cooldown_ms: i64) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                cooldowns: HashMap::new(),
            }),
            limit,
            max_count,
            cooldown_ms,
        }
    }

    /// Record that `id` should be visited again. `count` is how many times in
    /// a row it has been continued, including this one.
    pub fn add(&self, id: &str, value: T, count: u32, now_ms: i64) -> ContinueEvent {
        let mut state = self.state.lock();
        if let Some(until) = state.cooldowns.get(id).copied() {
            if until > now_ms {
                return ContinueEvent::Cooling;
            }
            state.cooldowns.remove(id);
        }

        if exceeds_limit(count, self.max_count) {
            state.entries.remove(id);
            state
                .cooldowns
                .insert(id.to_string(), now_ms + self.cooldown_ms);
            return ContinueEvent::CooledDown;
        }

        if let Some(entry) = state.entries.get_mut(id) {
            if entry.count >= count {
                return ContinueEvent::Unchanged;
            }
            entry.count = count;
            entry.value = value;
            return ContinueEvent::Added;
        }
        if state.entries.len() >= self.limit {
            return ContinueEvent::Full;
        }
        state
            .entries
            .insert(id.to_string(), Entry { count, value });
        ContinueEvent::Added
    }

    pub fn remove(&self, id: &str) -> bool {
        self.state.lock().entries.remove(id).is_some()
    }

    /// Current count for `id`, zero if it is not continued.
    pub fn count(&self, id: &str) -> u32 {
        self.state
            .lock()
            .entries
            .get(id)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    pub fn is_cooling(&self, id: &str, now_ms: i64) -> bool {
        self.state
            .lock()
            .cooldowns
            .get(id)
            .is_some_and(|until| *until > now_ms)
    }

    /// Entries to visit this tick, with their counts.
    pub fn snapshot(&self) -> Vec<(String, u32, T)> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.count, e.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired cooldowns.
    pub fn prune(&self, now_ms: i64) {
        self.state.lock().cooldowns.retain(|_, until| *until > now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_capacity() {
        let c = Continuations::new(2, 5, 10_000);
        assert_eq!(c.add("a", (), 1, 0), ContinueEvent::Added);
        assert_eq!(c.add("b", (), 1, 0), ContinueEvent::Added);
        assert_eq!(c.add("c", (), 1, 0), ContinueEvent::Full);
        // existing entries can still move forward when full
        assert_eq!(c.add("a", (), 2, 0), ContinueEvent::Added);
        assert_eq!(c.count("a"), 2);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn stale_counts_are_ignored() {
        let c = Continuations::new(8, 5, 10_000);
        c.add("a", (), 3, 0);
        assert_eq!(c.add("a", (), 2, 0), ContinueEvent::Unchanged);
        assert_eq!(c.count("a"), 3);
    }

    #[test]
    fn cooldown_after_max_count() {
        let c = Continuations::new(8, 5, 10_000);
        for n in 1..=5 {
            assert_eq!(c.add("a", (), n, 0), ContinueEvent::Added);
        }
        assert_eq!(c.add("a", (), 6, 0), ContinueEvent::CooledDown);
        assert_eq!(c.count("a"), 0);
        assert!(c.is_cooling("a", 9_999));
        assert_eq!(c.add("a", (), 1, 5_000), ContinueEvent::Cooling);
        assert_eq!(c.add("a", (), 1, 10_000), ContinueEvent::Added);
    }

    #[test]
    fn newer_counts_replace_the_value() {
        let c = Continuations::new(1, 5, 10_000);
        assert_eq!(c.add("a", "first", 1, 0), ContinueEvent::Added);
        assert_eq!(c.add("a", "second", 2, 0), ContinueEvent::Added);
        assert_eq!(c.snapshot(), vec![("a".to_string(), 2, "second")]);
    }

    #[test]
    fn expired_cooldowns_are_cleared_on_add() {
        let c = Continuations::new(8, 1, 1_000);
        assert_eq!(c.add("a", (), 2, 0), ContinueEvent::CooledDown);
        assert_eq!(c.add("a", (), 1, 1_000), ContinueEvent::Added);
        assert!(!c.is_cooling("a", 0));
    }

    #[test]
    fn limit_is_exclusive() {
        assert!(!exceeds_limit(5, 5));
        assert!(exceeds_limit(6, 5));
    }
}
