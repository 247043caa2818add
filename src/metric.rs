//! Per-slot metric data for each processor type.
//!
//! `*Data` structs are the period buffers written by application threads
//! through a [`MetricSlot`](crate::node::slot::MetricSlot). `Acc*` structs hold
//! the lifetime accumulation that only the scheduler thread touches.

use serde::{Deserialize, Serialize};

use crate::node::slot::SlotData;

/// Maximum number of distinct I/O sizes tracked per performance slot.
pub const MAX_PACKET_CNT_SIZE: usize = 5;

/// Metric family of a node, selecting its writer and processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorType {
    #[serde(alias = "PERFORMANCE", alias = "Performance")]
    Performance,
    #[serde(alias = "LATENCY", alias = "Latency")]
    Latency,
    #[serde(alias = "QUEUE", alias = "Queue")]
    Queue,
    #[serde(alias = "UTILIZATION", alias = "Utilization")]
    Utilization,
    #[serde(alias = "COUNT", alias = "Count")]
    Count,
}

impl ProcessorType {
    /// Returns the canonical string representation for export.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Latency => "latency",
            Self::Queue => "queue",
            Self::Utilization => "utilization",
            Self::Count => "count",
        }
    }
}

impl std::fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-capacity size histogram. Sizes beyond capacity are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCounts {
    entries: [(u64, u64); MAX_PACKET_CNT_SIZE],
    len: usize,
}

impl PacketCounts {
    /// Counts one I/O of `size` bytes. Returns false when the size is new and
    /// the table is already full.
    #[inline]
    pub fn add(&mut self, size: u64) -> bool {
        let len = self.len;
        for entry in &mut self.entries[..len] {
            if entry.0 == size {
                entry.1 += 1;
                return true;
            }
        }
        if len == MAX_PACKET_CNT_SIZE {
            return false;
        }
        self.entries[len] = (size, 1);
        self.len = len + 1;
        true
    }

    /// Returns the count recorded for `size`.
    pub fn get(&self, size: u64) -> Option<u64> {
        self.iter().find(|(s, _)| *s == size).map(|(_, c)| c)
    }

    /// Number of distinct sizes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates `(size, count)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries[..self.len].iter().copied()
    }
}

/// Period I/O counters.
#[derive(Debug, Clone, Default)]
pub struct PerformanceData {
    pub access: bool,
    pub iops: u64,
    pub bandwidth: u64,
    pub packet_cnt: PacketCounts,
}

/// Lifetime time-weighted averages.
#[derive(Debug, Clone, Default)]
pub struct AccPerformanceData {
    pub need_erase: bool,
    pub iops_avg: f64,
    pub bandwidth_avg: f64,
    /// Seconds already folded into the averages.
    pub time_spent: u64,
}

/// Period queue-depth samples.
#[derive(Debug, Clone, Default)]
pub struct QueueData {
    pub access: bool,
    pub num_req: u64,
    pub sum_depth: u64,
    pub depth_period_max: u64,
    /// Depth reported by the last sampled call.
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AccQueueData {
    pub need_erase: bool,
    pub depth_total_avg: f64,
    pub depth_total_max: u64,
    pub time_spent: u64,
}

#[derive(Debug, Clone, Default)]
pub struct UtilizationData {
    pub access: bool,
    pub usage: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AccUtilizationData {
    pub need_erase: bool,
    pub total_usage: u64,
}

/// Period signed counters, split by sign.
#[derive(Debug, Clone, Default)]
pub struct CountData {
    pub access: bool,
    pub count_positive: u64,
    pub num_req_positive: u64,
    pub count_negative: u64,
    pub num_req_negative: u64,
}

/// Lifetime signed counter stored as sign plus magnitude.
#[derive(Debug, Clone, Default)]
pub struct AccCountData {
    pub need_erase: bool,
    pub negative: bool,
    pub total_count: u64,
    pub total_num_req_positive: u64,
    pub total_num_req_negative: u64,
}

impl SlotData for PerformanceData {
    fn accessed(&self) -> bool {
        self.access
    }
}

impl SlotData for QueueData {
    fn accessed(&self) -> bool {
        self.access
    }
}

impl SlotData for UtilizationData {
    fn accessed(&self) -> bool {
        self.access
    }
}

impl SlotData for CountData {
    fn accessed(&self) -> bool {
        self.access
    }
}
