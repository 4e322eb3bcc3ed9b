//! Commit watermark tracking for partitioned consumers.
//!
//! Kafka commits are positional: committing offset `n` marks everything below
//! `n` as processed. With several envelopes of one partition in flight, the
//! committed position may only advance to the lowest offset still in flight.
//!
//! Negative acknowledgement rewinds the whole partition, so the consumer reads
//! again offsets that are still being worked on or already finished. Only the
//! offsets that were actually nacked are handed out again.

use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Default)]
struct PartitionState {
    in_flight: BTreeSet<i64>,
    nacked: HashSet<i64>,
    /// Finished offsets at or above the committed position
    completed: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: Option<i64>,
    attempts: HashMap<i64, u32>,
}

/// Per-partition in-flight offsets, completion watermark and delivery attempts
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was read. Returns the 1-based delivery attempt,
    /// or `None` when the read is a replay of an offset that is still in
    /// flight or already finished and must not be delivered again.
    pub fn begin(&mut self, topic: &str, partition: i32, offset: i64) -> Option<u32> {
        let state = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();

        if state.committed.map_or(false, |c| offset < c) || state.completed.contains(&offset) {
            return None;
        }

        if state.in_flight.contains(&offset) {
            if !state.nacked.remove(&offset) {
                return None;
            }
            let attempt = state.attempts.entry(offset).or_insert(1);
            *attempt += 1;
            return Some(*attempt);
        }

        state.in_flight.insert(offset);
        state.attempts.insert(offset, 1);
        Some(1)
    }

    /// Mark `offset` for redelivery on its next read
    pub fn nack(&mut self, topic: &str, partition: i32, offset: i64) {
        if let Some(state) = self.partitions.get_mut(&(topic.to_string(), partition)) {
            if state.in_flight.contains(&offset) {
                state.nacked.insert(offset);
            }
        }
    }

    /// Mark `offset` processed. Returns the position to commit when the
    /// contiguous watermark moved forward.
    pub fn complete(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !state.in_flight.remove(&offset) {
            return None;
        }
        state.nacked.remove(&offset);
        state.attempts.remove(&offset);
        state.completed.insert(offset);
        state.highest_done = Some(state.highest_done.map_or(offset, |h| h.max(offset)));

        let position = match state.in_flight.first() {
            Some(lowest) => *lowest,
            None => state.highest_done? + 1,
        };

        if state.committed.map_or(true, |c| position > c) {
            state.committed = Some(position);
            state.completed = state.completed.split_off(&position);
            Some(position)
        } else {
            None
        }
    }

    /// Offsets still awaiting an outcome on a partition
    pub fn in_flight(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .get(&(topic.to_string(), partition))
            .map_or(0, |s| s.in_flight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_completion_commits_next_position() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.begin("in", 0, 10), Some(1));
        assert_eq!(tracker.complete("in", 0, 10), Some(11));
    }

    #[test]
    fn test_out_of_order_completion_holds_watermark() {
        let mut tracker = OffsetTracker::new();
        tracker.begin("in", 0, 5);
        tracker.begin("in", 0, 6);
        tracker.begin("in", 0, 7);

        // 7 finishes first: 5 is still in flight, position stays at 5
        assert_eq!(tracker.complete("in", 0, 7), Some(5));
        assert_eq!(tracker.complete("in", 0, 6), None);
        assert_eq!(tracker.complete("in", 0, 5), Some(8));
        assert_eq!(tracker.in_flight("in", 0), 0);
    }

    #[test]
    fn test_nacked_offset_is_redelivered_with_next_attempt() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.begin("in", 1, 3), Some(1));
        tracker.nack("in", 1, 3);
        assert_eq!(tracker.begin("in", 1, 3), Some(2));
        tracker.nack("in", 1, 3);
        assert_eq!(tracker.begin("in", 1, 3), Some(3));
        assert_eq!(tracker.in_flight("in", 1), 1);
        assert_eq!(tracker.complete("in", 1, 3), Some(4));
    }

    #[test]
    fn test_replay_of_in_flight_neighbour_keeps_its_attempt() {
        let mut tracker = OffsetTracker::new();
        tracker.begin("in", 0, 5);
        tracker.begin("in", 0, 6);

        // 5 fails three times; every rewind replays 6 as well
        for expected in 2..=4 {
            tracker.nack("in", 0, 5);
            assert_eq!(tracker.begin("in", 0, 5), Some(expected));
            assert_eq!(tracker.begin("in", 0, 6), None);
        }

        tracker.nack("in", 0, 6);
        assert_eq!(tracker.begin("in", 0, 6), Some(2));
    }

    #[test]
    fn test_replay_of_finished_offsets_is_skipped() {
        let mut tracker = OffsetTracker::new();
        tracker.begin("in", 0, 5);
        tracker.begin("in", 0, 6);
        tracker.begin("in", 0, 7);
        tracker.complete("in", 0, 6);
        tracker.complete("in", 0, 7);

        tracker.nack("in", 0, 5);
        assert_eq!(tracker.begin("in", 0, 5), Some(2));
        assert_eq!(tracker.begin("in", 0, 6), None);
        assert_eq!(tracker.begin("in", 0, 7), None);

        assert_eq!(tracker.complete("in", 0, 5), Some(8));
        // below the committed position now
        assert_eq!(tracker.begin("in", 0, 6), None);
        assert_eq!(tracker.begin("in", 0, 8), Some(1));
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.begin("in", 0, 1);
        tracker.begin("in", 1, 100);
        assert_eq!(tracker.complete("in", 1, 100), Some(101));
        assert_eq!(tracker.in_flight("in", 0), 1);
    }

    #[test]
    fn test_unknown_offsets_are_ignored() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.complete("in", 9, 1), None);
        tracker.nack("in", 9, 1);
        tracker.begin("in", 0, 1);
        assert_eq!(tracker.complete("in", 0, 2), None);
        assert_eq!(tracker.in_flight("in", 0), 1);
    }
}
