//! Ordered, deduplicated, capacity-bounded entry store.

use std::collections::HashSet;

use smol_str::SmolStr;

use crate::logscope_core::{LogEntry, Timestamp};

pub const MAX_ENTRIES: usize = 10_000;

/// Result of one [`EntryStore::merge`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entries that were new; zero means the batch carried nothing new.
    pub inserted: usize,
    /// Entries dropped from the tail by the capacity cap.
    pub evicted: usize,
    /// Oldest timestamp among the inserted entries.
    pub oldest_inserted: Option<Timestamp>,
}

#[derive(Debug)]
pub struct EntryStore {
    entries: Vec<LogEntry>,
    ids: HashSet<SmolStr>,
    max_entries: usize,
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl EntryStore {
    pub fn new(max_entries: usize) -> Self {
        Self { entries: Vec::new(), ids: HashSet::new(), max_entries: max_entries.max(1) }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(MAX_ENTRIES)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }

    /// Inserts the entries whose ids are not present yet, keeps the set
    /// sorted newest first and, when `at_top`, trims the tail to the cap.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = LogEntry>, at_top: bool) -> MergeReport {
        let mut inserted = 0usize;
        let mut oldest_inserted: Option<Timestamp> = None;

        for entry in batch {
            if !self.ids.insert(entry.id.clone()) {
                continue;
            }
            if oldest_inserted.as_ref().map_or(true, |oldest| entry.timestamp < *oldest) {
                oldest_inserted = Some(entry.timestamp.clone());
            }
            self.entries.push(entry);
            inserted += 1;
        }

        if inserted > 0 {
            // Stable: equal timestamps keep arrival order.
            self.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }

        let evicted = if at_top { self.evict_overflow() } else { 0 };

        MergeReport { inserted, evicted, oldest_inserted }
    }

    /// Drops the oldest entries beyond the cap. Returns how many were dropped.
    pub fn evict_overflow(&mut self) -> usize {
        if self.entries.len() <= self.max_entries {
            return 0;
        }
        let evicted: Vec<LogEntry> = self.entries.drain(self.max_entries..).collect();
        for entry in &evicted {
            self.ids.remove(&entry.id);
        }
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    pub fn oldest_timestamp(&self) -> Option<&Timestamp> {
        self.entries.last().map(|entry| &entry.timestamp)
    }

    pub fn newest_timestamp(&self) -> Option<&Timestamp> {
        self.entries.first().map(|entry| &entry.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logscope_core::LogLevel;
    use rstest::{fixture, rstest};

    fn entry(id: &str, ts: &str) -> LogEntry {
        LogEntry::new(id, Timestamp::new(ts), LogLevel::Info, format!("msg {id}"))
    }

    fn ids(store: &EntryStore) -> Vec<&str> {
        store.entries().iter().map(|entry| entry.id.as_str()).collect()
    }

    #[fixture]
    fn seeded() -> EntryStore {
        let mut store = EntryStore::new(2);
        store.merge(
            vec![entry("a", "2024-01-01T00:00:02Z"), entry("b", "2024-01-01T00:00:01Z")],
            true,
        );
        store
    }

    #[test]
    fn merge_sorts_newest_first_and_counts_inserted() {
        let mut store = EntryStore::new(10);
        let report = store.merge(
            vec![entry("b", "2024-01-01T00:00:01Z"), entry("a", "2024-01-01T00:00:02Z")],
            true,
        );
        assert_eq!(report.inserted, 2);
        assert_eq!(report.oldest_inserted, Some(Timestamp::new("2024-01-01T00:00:01Z")));
        assert_eq!(ids(&store), vec!["a", "b"]);
        assert_eq!(store.len(), 2);
    }

    #[rstest]
    fn merging_known_id_inserts_nothing(mut seeded: EntryStore) {
        let report = seeded.merge(vec![entry("a", "2024-01-01T00:00:02Z")], true);
        assert_eq!(report.inserted, 0);
        assert_eq!(report.oldest_inserted, None);
        assert_eq!(seeded.len(), 2);
        assert_eq!(ids(&seeded), vec!["a", "b"]);
    }

    #[test]
    fn merging_same_batch_twice_is_idempotent() {
        let batch = vec![
            entry("x", "2024-01-01T00:00:05Z"),
            entry("y", "2024-01-01T00:00:03Z"),
            entry("z", "2024-01-01T00:00:04Z"),
        ];
        let mut store = EntryStore::new(100);
        assert_eq!(store.merge(batch.clone(), true).inserted, 3);
        let first: Vec<LogEntry> = store.entries().to_vec();
        assert_eq!(store.merge(batch, true).inserted, 0);
        assert_eq!(store.entries(), first.as_slice());
    }

    #[test]
    fn duplicate_ids_inside_one_batch_count_once() {
        let mut store = EntryStore::new(10);
        let report = store.merge(
            vec![entry("a", "2024-01-01T00:00:02Z"), entry("a", "2024-01-01T00:00:09Z")],
            true,
        );
        assert_eq!(report.inserted, 1);
        assert_eq!(store.entries()[0].timestamp.as_str(), "2024-01-01T00:00:02Z");
    }

    #[rstest]
    fn cap_evicts_oldest_and_forgets_its_id(mut seeded: EntryStore) {
        let report = seeded.merge(vec![entry("c", "2024-01-01T00:00:03Z")], true);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(ids(&seeded), vec!["c", "a"]);
        assert!(!seeded.contains("b"));

        // Once evicted, the id counts as new again; the cap then drops it at once.
        let report = seeded.merge(vec![entry("b", "2024-01-01T00:00:01Z")], true);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(ids(&seeded), vec!["c", "a"]);
    }

    #[rstest]
    fn eviction_waits_until_view_is_at_top(mut seeded: EntryStore) {
        let report = seeded.merge(vec![entry("c", "2024-01-01T00:00:03Z")], false);
        assert_eq!(report.evicted, 0);
        assert_eq!(seeded.len(), 3);
        assert!(seeded.contains("b"));

        assert_eq!(seeded.evict_overflow(), 1);
        assert_eq!(ids(&seeded), vec!["c", "a"]);
        assert!(!seeded.contains("b"));
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut store = EntryStore::new(10);
        store.merge(vec![entry("first", "2024-01-01T00:00:01Z")], true);
        store.merge(
            vec![entry("second", "2024-01-01T00:00:01Z"), entry("third", "2024-01-01T00:00:01Z")],
            true,
        );
        assert_eq!(ids(&store), vec!["first", "second", "third"]);
    }

    #[test]
    fn sort_invariant_holds_across_interleaved_merges() {
        let mut store = EntryStore::new(50);
        for round in 0..10u32 {
            let batch: Vec<LogEntry> = (0..7u32)
                .map(|idx| {
                    let second = (round * 13 + idx * 7) % 60;
                    entry(&format!("e-{round}-{idx}"), &format!("2024-01-01T00:00:{second:02}Z"))
                })
                .collect();
            store.merge(batch, round % 2 == 0);
            for pair in store.entries().windows(2) {
                assert!(pair[0].timestamp >= pair[1].timestamp);
            }
            if round % 2 == 0 {
                assert!(store.len() <= store.max_entries());
            }
        }
    }

    #[rstest]
    fn clear_resets_entries_and_ids(mut seeded: EntryStore) {
        seeded.clear();
        assert!(seeded.is_empty());
        assert!(seeded.oldest_timestamp().is_none());
        assert_eq!(seeded.merge(vec![entry("a", "2024-01-01T00:00:02Z")], true).inserted, 1);
    }

    #[rstest]
    fn accessors_report_bounds(seeded: EntryStore) {
        assert_eq!(seeded.oldest_timestamp().map(Timestamp::as_str), Some("2024-01-01T00:00:01Z"));
        assert_eq!(seeded.newest_timestamp().map(Timestamp::as_str), Some("2024-01-01T00:00:02Z"));
        assert_eq!(seeded.get(1).map(|entry| entry.id.as_str()), Some("b"));
    }
}
