/*
Time-queue for the coherence engine.

The controller itself never advances time: every inbound message is handed to it together with the
current simulated cycle, and every outbound message leaves with the cycle at which it should be
delivered.  This module holds the small amount of time bookkeeping shared by both sides:

    - `delivery_at` computes a send time from a line's serialization timestamp, which is how
      back-to-back accesses to the same line are kept in order
    - `DeliveryQueue` is a minimal discrete-event scheduler that hands payloads back in
      non-decreasing time order (FIFO among equal times), used by the replay driver and the tests
*/

use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub type Cycle = u64;

// max(line timestamp, now) + latency
pub fn delivery_at(line_ts: Cycle, now: Cycle, latency: Cycle) -> Cycle {
    line_ts.max(now).saturating_add(latency)
}

#[derive(Debug)]
struct Pending<T> {
    at: Cycle,
    seq: u64,
    payload: T,
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Pending<T> {
    // BinaryHeap is a max-heap, so invert to pop the earliest (then oldest) entry first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
pub struct DeliveryQueue<T> {
    heap: BinaryHeap<Pending<T>>,
    next_seq: u64,
}

impl<T> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeliveryQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, at: Cycle, payload: T) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Pending { at, seq, payload });
    }

    // Pop the earliest payload if it is due at or before `now`.
    pub fn pop_ready(&mut self, now: Cycle) -> Option<(Cycle, T)> {
        if self.heap.peek()?.at > now {
            return None;
        }
        self.heap.pop().map(|pending| (pending.at, pending.payload))
    }

    // Cycle of the earliest pending payload.
    pub fn next_at(&self) -> Option<Cycle> {
        self.heap.peek().map(|pending| pending.at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{delivery_at, DeliveryQueue};

    #[test]
    fn delivery_respects_line_timestamp() {
        assert_eq!(delivery_at(0, 10, 3), 13);
        assert_eq!(delivery_at(20, 10, 3), 23);
        assert_eq!(delivery_at(u64::MAX, 0, 1), u64::MAX);
    }

    #[test]
    fn pops_in_time_order() {
        let mut q = DeliveryQueue::new();
        q.push(5, "c");
        q.push(1, "a");
        q.push(3, "b");
        assert_eq!(q.next_at(), Some(1));
        assert_eq!(q.pop_ready(10), Some((1, "a")));
        assert_eq!(q.pop_ready(10), Some((3, "b")));
        assert_eq!(q.pop_ready(10), Some((5, "c")));
        assert!(q.is_empty());
    }

    #[test]
    fn equal_times_are_fifo() {
        let mut q = DeliveryQueue::new();
        for i in 0..8 {
            q.push(7, i);
        }
        let order: Vec<_> = std::iter::from_fn(|| q.pop_ready(7).map(|(_, v)| v)).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn not_ready_before_due() {
        let mut q = DeliveryQueue::new();
        q.push(4, ());
        assert!(q.pop_ready(3).is_none());
        assert_eq!(q.len(), 1);
        assert!(q.pop_ready(4).is_some());
    }
}
