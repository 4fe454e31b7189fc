//! Queue selection for submitted tasks

use multipool_ipc::QueueId;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Load of a queue that still has live workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLoad {
    pub queue_id: QueueId,
    /// Tasks submitted to the queue whose result is not yet available
    pub outstanding: usize,
}

/// Picks the queue a new task is placed on
pub trait Scheduler: Send + Sync {
    /// `None` only when there are no candidates
    fn select(&self, candidates: &[QueueLoad]) -> Option<QueueId>;

    fn name(&self) -> &'static str;
}

/// Cycles through the candidates, one step per call
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobin {
    fn select(&self, candidates: &[QueueLoad]) -> Option<QueueId> {
        if candidates.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].queue_id)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Picks the queue with the fewest outstanding tasks, lowest id on ties
#[derive(Debug, Default)]
pub struct LeastPending;

impl Scheduler for LeastPending {
    fn select(&self, candidates: &[QueueLoad]) -> Option<QueueId> {
        let best = candidates
            .iter()
            .min_by_key(|load| (load.outstanding, load.queue_id))?;
        debug!(
            "Selected queue {} with {} outstanding tasks",
            best.queue_id, best.outstanding
        );
        Some(best.queue_id)
    }

    fn name(&self) -> &'static str {
        "least_pending"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loads(outstanding: &[usize]) -> Vec<QueueLoad> {
        outstanding
            .iter()
            .enumerate()
            .map(|(queue_id, outstanding)| QueueLoad {
                queue_id,
                outstanding: *outstanding,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_spreads_evenly() {
        let scheduler = RoundRobin::new();
        let candidates = loads(&[0, 0, 0]);

        let mut counts = [0usize; 3];
        for _ in 0..10 {
            counts[scheduler.select(&candidates).unwrap()] += 1;
        }

        // 10 tasks over 3 queues: every queue gets 3 or 4
        assert_eq!(counts, [4, 3, 3]);
    }

    #[test]
    fn test_round_robin_is_deterministic() {
        let a = RoundRobin::new();
        let b = RoundRobin::new();
        let candidates = loads(&[5, 1]);

        let picks_a: Vec<_> = (0..6).map(|_| a.select(&candidates)).collect();
        let picks_b: Vec<_> = (0..6).map(|_| b.select(&candidates)).collect();
        assert_eq!(picks_a, picks_b);
        assert_eq!(picks_a[..2], [Some(0), Some(1)]);
    }

    #[test]
    fn test_round_robin_skips_missing_queues() {
        let scheduler = RoundRobin::new();
        let candidates = vec![
            QueueLoad { queue_id: 0, outstanding: 0 },
            QueueLoad { queue_id: 2, outstanding: 0 },
        ];

        let picks: Vec<_> = (0..4).filter_map(|_| scheduler.select(&candidates)).collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
        assert_eq!(scheduler.select(&[]), None);
    }

    #[test]
    fn test_single_queue_always_selected() {
        let scheduler = RoundRobin::new();
        let candidates = loads(&[7]);
        assert!((0..5).all(|_| scheduler.select(&candidates) == Some(0)));
        assert_eq!(scheduler.name(), "round_robin");
    }

    #[test]
    fn test_least_pending() {
        let scheduler = LeastPending;
        assert_eq!(scheduler.select(&loads(&[3, 1, 2])), Some(1));
        assert_eq!(scheduler.select(&loads(&[2, 1, 1])), Some(1));
        assert_eq!(scheduler.select(&[]), None);
        assert_eq!(scheduler.name(), "least_pending");
    }
}
