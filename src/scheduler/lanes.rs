//! Priority lane queue.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tokio::time::Instant;
use uuid::Uuid;

/// Heap entry: priority rank, submission sequence, push token, job.
type Slot = Reverse<(u32, u64, u64, Uuid)>;

#[derive(Debug, Clone, Copy)]
struct Live {
    token: u64,
    enqueued_at: Instant,
}

/// Ready jobs of one lane, ordered by priority rank then submission order.
///
/// Removal is lazy: the live map is authoritative and heap entries whose
/// push token no longer matches are skipped on pop.
#[derive(Debug, Default)]
pub struct LaneQueue {
    heap: BinaryHeap<Slot>,
    live: HashMap<Uuid, Live>,
    next_token: u64,
}

impl LaneQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job. `seq` is its submission sequence, reused on re-enqueue so
    /// a job keeps its FIFO position within its priority rank.
    pub fn push(&mut self, job_id: Uuid, priority: u32, seq: u64, now: Instant) {
        self.next_token += 1;
        let token = self.next_token;
        self.live.insert(
            job_id,
            Live {
                token,
                enqueued_at: now,
            },
        );
        self.heap.push(Reverse((priority, seq, token, job_id)));
    }

    /// Removes a job if present.
    pub fn remove(&mut self, job_id: Uuid) -> bool {
        let removed = self.live.remove(&job_id).is_some();
        if removed {
            self.compact();
        }
        removed
    }

    /// Pops the best job.
    pub fn pop(&mut self) -> Option<Uuid> {
        while let Some(Reverse((_, _, token, job_id))) = self.heap.pop() {
            if self.live.get(&job_id).is_some_and(|l| l.token == token) {
                self.live.remove(&job_id);
                return Some(job_id);
            }
        }
        None
    }

    /// The job that has waited longest, with its enqueue time.
    pub fn oldest(&self) -> Option<(Uuid, Instant)> {
        self.live
            .iter()
            .min_by_key(|(_, live)| (live.enqueued_at, live.token))
            .map(|(id, live)| (*id, live.enqueued_at))
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.live.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Drops stale heap entries once they dominate the heap.
    fn compact(&mut self) {
        if self.heap.len() <= 64 || self.heap.len() <= self.live.len() * 2 {
            return;
        }
        let live = &self.live;
        self.heap
            .retain(|Reverse((_, _, token, id))| live.get(id).is_some_and(|l| l.token == *token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_priority_then_fifo() {
        let mut lane = LaneQueue::new();
        let now = Instant::now();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        lane.push(a, 100, 1, now);
        lane.push(b, 100, 2, now);
        lane.push(c, 10, 3, now);

        assert_eq!(lane.pop(), Some(c));
        assert_eq!(lane.pop(), Some(a));
        assert_eq!(lane.pop(), Some(b));
        assert_eq!(lane.pop(), None);
    }

    #[test]
    fn test_lazy_removal() {
        let mut lane = LaneQueue::new();
        let now = Instant::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        lane.push(a, 1, 1, now);
        lane.push(b, 1, 2, now);
        assert!(lane.remove(a));
        assert!(!lane.remove(a));
        assert_eq!(lane.len(), 1);
        assert_eq!(lane.pop(), Some(b));
        assert!(lane.is_empty());
    }

    #[test]
    fn test_reinsert_keeps_position_without_duplicates() {
        let mut lane = LaneQueue::new();
        let now = Instant::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        lane.push(a, 1, 1, now);
        lane.push(b, 1, 2, now);
        lane.remove(a);
        lane.push(a, 1, 1, now);

        assert_eq!(lane.pop(), Some(a));
        assert_eq!(lane.pop(), Some(b));
        assert_eq!(lane.pop(), None);
    }

    #[test]
    fn test_oldest() {
        let mut lane = LaneQueue::new();
        let now = Instant::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        lane.push(a, 1, 2, now + Duration::from_millis(5));
        lane.push(b, 50, 1, now);

        assert_eq!(lane.oldest().map(|(id, _)| id), Some(b));
        assert!(lane.contains(a));
    }

    #[test]
    fn test_compaction_keeps_live_entries() {
        let mut lane = LaneQueue::new();
        let now = Instant::now();
        let keep = Uuid::new_v4();
        lane.push(keep, 1, 0, now);

        for seq in 1..200 {
            let id = Uuid::new_v4();
            lane.push(id, 1, seq, now);
            lane.remove(id);
        }

        assert_eq!(lane.len(), 1);
        assert_eq!(lane.pop(), Some(keep));
    }
}
