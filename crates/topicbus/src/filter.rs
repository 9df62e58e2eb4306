//! Topic filter set.
//!
//! A topic matches when any registered filter is a prefix of it; the empty
//! filter is a prefix of every topic. No precedence between overlapping
//! filters. Reads and writes go through one lock so each match sees a
//! consistent snapshot, even while a dispatch loop is consuming.

use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct FilterSet {
    filters: RwLock<BTreeSet<String>>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the filter was already registered.
    pub fn insert(&self, filter: &str) -> bool {
        self.write().insert(filter.to_string())
    }

    /// Returns false if the filter was not registered.
    pub fn remove(&self, filter: &str) -> bool {
        self.write().remove(filter)
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.read().iter().any(|f| topic.starts_with(f.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Sorted copy of the registered filters.
    pub fn snapshot(&self) -> Vec<String> {
        self.read().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeSet<String>> {
        // A panic while holding the lock cannot leave a BTreeSet half-updated.
        self.filters.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Filter set lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeSet<String>> {
        self.filters.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Filter set lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_set_matches_nothing() {
        let filters = FilterSet::new();
        assert!(!filters.matches(""));
        assert!(!filters.matches("anything"));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filters = FilterSet::new();
        filters.insert("");
        for topic in ["", "user", "sensor/temp", "x"] {
            assert!(filters.matches(topic), "{topic}");
        }
    }

    #[test]
    fn prefix_rule() {
        let filters = FilterSet::new();
        filters.insert("sensor");

        assert!(filters.matches("sensor"));
        assert!(filters.matches("sensor/temp"));
        assert!(filters.matches("sensors"));
        assert!(!filters.matches("user"));
        assert!(!filters.matches("sens"));
        assert!(!filters.matches(""));
        assert!(!filters.matches("Sensor"));
    }

    #[test]
    fn any_filter_wins() {
        let filters = FilterSet::new();
        filters.insert("a");
        filters.insert("b/");
        assert!(filters.matches("alpha"));
        assert!(filters.matches("b/1"));
        assert!(!filters.matches("beta"));
    }

    #[test]
    fn duplicates_are_noops() {
        let filters = FilterSet::new();
        assert!(filters.insert("t"));
        assert!(!filters.insert("t"));
        assert_eq!(filters.len(), 1);

        assert!(filters.remove("t"));
        assert!(!filters.remove("t"));
        assert!(filters.is_empty());
    }

    #[test]
    fn clear_drops_every_filter() {
        let filters = FilterSet::new();
        filters.insert("");
        filters.insert("a");
        filters.clear();

        assert!(filters.is_empty());
        assert!(!filters.matches("a"));
        assert!(filters.insert("a"));
    }

    #[test]
    fn unsubscribe_keeps_other_filters() {
        let filters = FilterSet::new();
        filters.insert("sensor");
        filters.insert("sensor/temp");
        filters.remove("sensor");

        assert!(filters.matches("sensor/temp/1"));
        assert!(!filters.matches("sensor/humidity"));
        assert_eq!(filters.snapshot(), vec!["sensor/temp".to_string()]);
    }

    #[test]
    fn concurrent_mutation_and_matching() {
        let filters = Arc::new(FilterSet::new());
        filters.insert("stable");

        let writer = {
            let filters = Arc::clone(&filters);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    let f = format!("f{}", i % 10);
                    filters.insert(&f);
                    filters.remove(&f);
                }
            })
        };

        for _ in 0..1000 {
            assert!(filters.matches("stable/topic"));
        }
        writer.join().unwrap();
        assert_eq!(filters.snapshot(), vec!["stable".to_string()]);
    }
}
