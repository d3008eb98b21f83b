//! Rolling record of recent detections.

use std::collections::VecDeque;

use wakelink_core::DetectionEvent;

pub struct DetectionHistory {
    entries: VecDeque<DetectionEvent>,
    capacity: usize,
    total: usize,
}

impl DetectionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, event: DetectionEvent) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
        self.total += 1;
    }

    /// Newest first.
    pub fn recent(&self) -> impl Iterator<Item = &DetectionEvent> {
        self.entries.iter().rev()
    }

    /// Detections seen since start, including evicted ones.
    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(seq: u64) -> DetectionEvent {
        DetectionEvent {
            seq,
            keyword: "hey link".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn keeps_only_the_newest_entries() {
        let mut history = DetectionHistory::new(20);
        for seq in 0..25 {
            history.push(event(seq));
        }
        assert_eq!(history.recent().count(), 20);
        assert_eq!(history.total(), 25);
        let seqs: Vec<u64> = history.recent().map(|e| e.seq).collect();
        assert_eq!(seqs.first(), Some(&24));
        assert_eq!(seqs.last(), Some(&5));
    }
}
