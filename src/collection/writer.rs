//! Hot-path writers, one per processor type.
//!
//! A writer touches only the calling thread's user buffers. Every operation
//! is O(1) and allocation free; a busy or full cell drops the sample.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

use crate::metric::ProcessorType;
use crate::node::{
    monotonic_ns, CountSlot, LatencyCell, NodeCells, NodeSlots, PerformanceSlot, QueueCell,
    UtilizationSlot,
};

/// Sampling rates below this sample the last call of every window.
const DETERMINISTIC_RATE: u32 = 10;

/// Picks one call per `rate` calls for queue-depth sampling.
///
/// Owned by a single writer thread; the atomics only make the cell shareable
/// with the scheduler, which never touches them.
#[derive(Debug, Default)]
pub struct Sampler {
    rate: AtomicU32,
    num_called: AtomicU32,
    logging_point: AtomicU32,
}

impl Sampler {
    /// Counts one call and returns whether it is the sampled one.
    ///
    /// `num_called` holds the 1-based position of the current call inside
    /// its window. A rate change starts a fresh window at position 1.
    #[inline]
    pub fn sample(&self, rate: u32) -> bool {
        let rate = rate.max(1);
        if self.rate.load(Ordering::Relaxed) != rate {
            self.rate.store(rate, Ordering::Relaxed);
            self.num_called.store(1, Ordering::Relaxed);
            self.logging_point
                .store(next_logging_point(rate), Ordering::Relaxed);
        }

        let mut num_called = self.num_called.load(Ordering::Relaxed);
        let sampled = num_called == self.logging_point.load(Ordering::Relaxed);

        if num_called >= rate {
            num_called = 0;
            self.logging_point
                .store(next_logging_point(rate), Ordering::Relaxed);
        }
        self.num_called.store(num_called + 1, Ordering::Relaxed);

        sampled
    }
}

/// Position of the next sample inside a window of `rate` calls. Large rates
/// land inside the middle 80% of the window.
fn next_logging_point(rate: u32) -> u32 {
    if rate < DETERMINISTIC_RATE {
        return rate;
    }
    let draw = rand::thread_rng().gen_range(0..=rate);
    (draw as f64 * 0.8 + rate as f64 * 0.1) as u32
}

/// Writer selected by processor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    Performance,
    Latency,
    Queue,
    Utilization,
    Count,
}

impl Writer {
    pub fn for_type(ptype: ProcessorType) -> Self {
        match ptype {
            ProcessorType::Performance => Self::Performance,
            ProcessorType::Latency => Self::Latency,
            ProcessorType::Queue => Self::Queue,
            ProcessorType::Utilization => Self::Utilization,
            ProcessorType::Count => Self::Count,
        }
    }

    /// Records `value` into cell `(index, filter)` of `slots`. Returns false
    /// when the sample was not taken.
    #[inline]
    pub fn log(
        self,
        slots: &NodeSlots,
        index: usize,
        filter: usize,
        value: u64,
        sampling_rate: u32,
    ) -> bool {
        let cell = slots.cell_index(index, filter);
        match (self, slots.cells()) {
            (Self::Performance, NodeCells::Performance(cells)) => {
                cells.get(cell).is_some_and(|slot| log_performance(slot, value))
            }
            (Self::Latency, NodeCells::Latency(cells)) => {
                log_latency(cells, cell, filter, slots.filter_size(), value)
            }
            (Self::Queue, NodeCells::Queue(cells)) => cells
                .get(cell)
                .is_some_and(|queue| log_queue(queue, value, sampling_rate)),
            (Self::Utilization, NodeCells::Utilization(cells)) => {
                cells.get(cell).is_some_and(|slot| log_utilization(slot, value))
            }
            (Self::Count, NodeCells::Count(cells)) => {
                cells.get(cell).is_some_and(|slot| log_count(slot, value))
            }
            _ => false,
        }
    }
}

/// One I/O of `size` bytes.
#[inline]
fn log_performance(slot: &PerformanceSlot, size: u64) -> bool {
    slot.write(|data| {
        data.access = true;
        data.iops += 1;
        data.bandwidth = data.bandwidth.saturating_add(size);
        data.packet_cnt.add(size);
    })
    .is_some()
}

/// A stage boundary for correlation `key`.
///
/// Stage `f` starts the `f -> f+1` pair and ends the `f-1 -> f` pair, so the
/// event goes to the start window of cell `f` (unless `f` is the last stage)
/// and the end window of cell `f` (unless `f` is the first stage).
#[inline]
fn log_latency(
    cells: &[LatencyCell],
    cell: usize,
    stage: usize,
    stages: usize,
    key: u64,
) -> bool {
    let Some(cell) = cells.get(cell) else {
        return false;
    };
    let timestamp = monotonic_ns();
    let mut recorded = false;
    if stage + 1 < stages {
        recorded |= cell.start.record(key, timestamp);
    }
    if stage > 0 {
        recorded |= cell.end.record(key, timestamp);
    }
    recorded
}

#[inline]
fn log_queue(queue: &QueueCell, depth: u64, sampling_rate: u32) -> bool {
    if !queue.sampler.sample(sampling_rate) {
        return false;
    }
    queue
        .slot
        .write(|data| {
            data.access = true;
            data.num_req += 1;
            data.sum_depth = data.sum_depth.saturating_add(depth);
            data.depth_period_max = data.depth_period_max.max(depth);
            data.size = depth;
        })
        .is_some()
}

#[inline]
fn log_utilization(slot: &UtilizationSlot, usage: u64) -> bool {
    slot.write(|data| {
        data.access = true;
        data.usage = data.usage.saturating_add(usage);
    })
    .is_some()
}

/// Signed delta encoded as two's complement.
#[inline]
fn log_count(slot: &CountSlot, value: u64) -> bool {
    slot.write(|data| {
        data.access = true;
        if value > i64::MAX as u64 {
            data.count_negative = data.count_negative.saturating_add(value.wrapping_neg());
            data.num_req_negative += 1;
        } else {
            data.count_positive = data.count_positive.saturating_add(value);
            data.num_req_positive += 1;
        }
    })
    .is_some()
}
