//! Bounded FIFO of published snapshots.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::snapshot::Snapshot;

pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    while dq.len() >= cap.max(1) {
        dq.pop_front();
    }
    dq.push_back(v);
}

// Oldest first; only the aggregator holds a mutable History.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<Arc<Snapshot>>,
    cap: usize,
}

impl History {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            entries: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, snapshot: Arc<Snapshot>) {
        push_capped(&mut self.entries, snapshot, self.cap);
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&Arc<Snapshot>> {
        self.entries.back()
    }

    /// Immutable copy for publication.
    pub fn to_series(&self) -> Arc<[Arc<Snapshot>]> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::blank;

    #[test]
    fn push_capped_drops_oldest() {
        let mut dq = VecDeque::new();
        for v in 0..5 {
            push_capped(&mut dq, v, 3);
        }
        assert_eq!(dq.into_iter().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn capacity_three_keeps_last_three_in_order() {
        let mut h = History::new(3);
        for seq in 1..=4 {
            h.push(Arc::new(blank(seq)));
        }
        let seqs: Vec<u64> = h.to_series().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(h.latest().map(|s| s.seq), Some(4));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut h = History::new(50);
        for seq in 1..=120 {
            h.push(Arc::new(blank(seq)));
            assert!(h.len() <= h.capacity());
        }
        assert_eq!(h.len(), 50);
        assert_eq!(h.to_series()[0].seq, 71);
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let mut h = History::new(0);
        h.push(Arc::new(blank(1)));
        h.push(Arc::new(blank(2)));
        assert_eq!(h.len(), 1);
        assert_eq!(h.latest().map(|s| s.seq), Some(2));
    }
}
