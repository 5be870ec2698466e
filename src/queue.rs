// ============================================================================
// DISPATCH QUEUE
// ============================================================================
// Unbounded lock-free hand-off between target loops (producers) and the
// sender (single consumer).
// ============================================================================

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::types::EmittedPoint;

// ----------------------------------------------------------------------------
// Queue Statistics
// ----------------------------------------------------------------------------

/// Counters updated on every push and pop.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: CachePadded<AtomicU64>,
    dequeued: CachePadded<AtomicU64>,
    high_water_mark: AtomicUsize,
}

impl QueueStats {
    fn record_push(&self, depth: usize) {
        self.enqueued.fetch_add(1, AtomicOrdering::Relaxed);

        let mut hwm = self.high_water_mark.load(AtomicOrdering::Relaxed);
        while depth > hwm {
            match self.high_water_mark.compare_exchange_weak(
                hwm,
                depth,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => hwm = h,
            }
        }
    }

    fn record_pop(&self) {
        self.dequeued.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(AtomicOrdering::Relaxed),
            dequeued: self.dequeued.load(AtomicOrdering::Relaxed),
            high_water_mark: self.high_water_mark.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub high_water_mark: usize,
}

// ----------------------------------------------------------------------------
// Dispatch Queue
// ----------------------------------------------------------------------------

/// Multi-producer queue of points waiting for the sender.
#[derive(Default)]
pub struct DispatchQueue {
    points: SegQueue<EmittedPoint>,
    stats: QueueStats,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, point: EmittedPoint) {
        self.points.push(point);
        self.stats.record_push(self.points.len());
    }

    pub fn pop(&self) -> Option<EmittedPoint> {
        let point = self.points.pop();
        if point.is_some() {
            self.stats.record_pop();
        }
        point
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Debug for DispatchQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("depth", &self.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
