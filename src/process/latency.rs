//! Bucketed latency statistics.
//!
//! Matched time lags land in fixed-size buckets. At each analysis tick every
//! bucket is sorted, summarized by mean and quartiles, and the per-bucket
//! summaries are averaged into the period statistics. Period statistics are
//! then folded into lifetime statistics weighted by sample count.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::meta::NodeMeta;
use crate::metric::ProcessorType;

/// Lags per bucket.
pub const TIME_LAG_SIZE: usize = 100;
/// Buckets per period. Lags beyond `TIME_LAG_SIZE * MAX_BUCKET_COUNT` are
/// dropped until the next tick.
pub const MAX_BUCKET_COUNT: usize = 100;
/// Lifetime sample ceiling. Merges that would reach it are skipped.
pub const OVERFLOW_THRESHOLD: u64 = 1 << 40;

/// Summary of a set of lags, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LagSummary {
    pub mean: u64,
    pub min: u64,
    pub max: u64,
    pub median: u64,
    pub low_qt: u64,
    pub up_qt: u64,
}

/// Period and lifetime statistics of one (node, app id, stage pair).
#[derive(Debug, Default)]
pub struct AccLatencySeqData {
    pub need_erase: bool,
    pub overflow_warning: bool,

    pub period: LagSummary,
    pub sample_count: u64,

    pub total: LagSummary,
    pub total_sample_count: u64,

    buckets: Vec<Vec<u64>>,
    bucket_count: usize,
}

impl AccLatencySeqData {
    /// Records one lag. Returns false when every bucket is full.
    pub fn add_timelag(&mut self, lag: u64) -> bool {
        let room = self
            .bucket_count
            .checked_sub(1)
            .is_some_and(|last| self.buckets[last].len() < TIME_LAG_SIZE);
        if !room {
            if self.bucket_count == MAX_BUCKET_COUNT {
                return false;
            }
            if self.buckets.len() == self.bucket_count {
                self.buckets.push(Vec::with_capacity(TIME_LAG_SIZE));
            }
            self.buckets[self.bucket_count].clear();
            self.bucket_count += 1;
        }
        self.buckets[self.bucket_count - 1].push(lag);

        self.sample_count += 1;
        self.period.max = self.period.max.max(lag);
        if self.period.min == 0 || lag < self.period.min {
            self.period.min = lag;
        }
        true
    }

    /// Buckets filled this period.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Computes period statistics from the buckets and merges them into the
    /// lifetime statistics.
    pub fn calculate(&mut self) {
        if self.need_erase {
            self.reset_lifetime();
            self.need_erase = false;
        }
        if self.bucket_count == 0 {
            return;
        }

        let mut sum = LagSummary::default();
        for bucket in &mut self.buckets[..self.bucket_count] {
            bucket.sort_unstable();
            let n = bucket.len();
            if n == 0 {
                continue;
            }
            sum.mean += bucket.iter().sum::<u64>() / n as u64;
            sum.median += bucket[n / 2];
            sum.low_qt += bucket[n / 4];
            sum.up_qt += bucket[(n - n / 4).min(n - 1)];
        }

        let buckets = self.bucket_count as u64;
        self.period.mean = sum.mean / buckets;
        self.period.median = sum.median / buckets;
        self.period.low_qt = sum.low_qt / buckets;
        self.period.up_qt = sum.up_qt / buckets;

        self.merge();
    }

    /// Folds the period into the lifetime statistics.
    pub fn merge(&mut self) {
        if self.sample_count < 1 {
            return;
        }
        if self.total_sample_count + self.sample_count >= OVERFLOW_THRESHOLD {
            self.overflow_warning = true;
            return;
        }

        if self.total_sample_count > 0 {
            let all = (self.total_sample_count + self.sample_count) as f64;
            let old_frac = self.total_sample_count as f64 / all;
            let new_frac = self.sample_count as f64 / all;
            let blend = |total: u64, period: u64| {
                (total as f64 * old_frac + period as f64 * new_frac) as u64
            };
            self.total.mean = blend(self.total.mean, self.period.mean);
            self.total.median = blend(self.total.median, self.period.median);
            self.total.low_qt = blend(self.total.low_qt, self.period.low_qt);
            self.total.up_qt = blend(self.total.up_qt, self.period.up_qt);
        } else {
            self.total.mean = self.period.mean;
            self.total.median = self.period.median;
            self.total.low_qt = self.period.low_qt;
            self.total.up_qt = self.period.up_qt;
        }

        self.total.max = self.total.max.max(self.period.max);
        if self.period.min != 0 && (self.total.min == 0 || self.period.min < self.total.min) {
            self.total.min = self.period.min;
        }
        self.total_sample_count += self.sample_count;
    }

    /// Clears period state for the next tick. An overflowed lifetime starts
    /// over.
    pub fn init_period(&mut self) {
        self.period = LagSummary::default();
        self.sample_count = 0;
        for bucket in &mut self.buckets[..self.bucket_count] {
            bucket.clear();
        }
        self.bucket_count = 0;

        if self.overflow_warning {
            tracing::warn!(
                total_samples = self.total_sample_count,
                "latency lifetime statistics overflowed, restarting"
            );
            self.reset_lifetime();
            self.overflow_warning = false;
        }
    }

    fn reset_lifetime(&mut self) {
        self.total = LagSummary::default();
        self.total_sample_count = 0;
    }
}

/// Statistics of one latency node, keyed by app id.
#[derive(Debug)]
pub struct NodeLatencyAcc {
    stages: usize,
    aid_capacity: usize,
    by_aid: BTreeMap<u64, Vec<AccLatencySeqData>>,
}

impl NodeLatencyAcc {
    fn new(stages: usize, aid_capacity: usize) -> Self {
        Self {
            stages,
            aid_capacity,
            by_aid: BTreeMap::new(),
        }
    }

    /// Stage pairs per app id (filter size minus one).
    pub fn stages(&self) -> usize {
        self.stages
    }

    fn entry(&mut self, aid: u64) -> Option<&mut Vec<AccLatencySeqData>> {
        if !self.by_aid.contains_key(&aid) && self.by_aid.len() >= self.aid_capacity {
            return None;
        }
        let stages = self.stages;
        Some(
            self.by_aid
                .entry(aid)
                .or_insert_with(|| (0..stages).map(|_| AccLatencySeqData::default()).collect()),
        )
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut [AccLatencySeqData])> {
        self.by_aid
            .iter_mut()
            .map(|(aid, stages)| (*aid, stages.as_mut_slice()))
    }

    pub fn get(&self, aid: u64, stage: usize) -> Option<&AccLatencySeqData> {
        self.by_aid.get(&aid)?.get(stage)
    }
}

/// Latency statistics of every built latency node.
#[derive(Debug, Default)]
pub struct LatencyAccTable {
    nodes: BTreeMap<u32, NodeLatencyAcc>,
}

/// Table shared by the preprocess, process and collection stages. All of
/// them run on the scheduler thread.
pub type SharedLatencyTable = Arc<Mutex<LatencyAccTable>>;

impl LatencyAccTable {
    pub fn new(meta: &NodeMeta) -> Self {
        let nodes = meta
            .nodes()
            .iter()
            .filter(|node| node.build && node.ptype == ProcessorType::Latency)
            .map(|node| {
                (
                    node.nid,
                    NodeLatencyAcc::new(node.filter_size.saturating_sub(1), meta.aid_size()),
                )
            })
            .collect();
        Self { nodes }
    }

    pub fn shared(meta: &NodeMeta) -> SharedLatencyTable {
        Arc::new(Mutex::new(Self::new(meta)))
    }

    /// Records one lag of stage pair `stage -> stage + 1`.
    pub fn add_timelag(&mut self, nid: u32, aid: u64, stage: usize, lag: u64) -> bool {
        let Some(node) = self.nodes.get_mut(&nid) else {
            return false;
        };
        if stage >= node.stages {
            return false;
        }
        match node.entry(aid) {
            Some(stages) => stages[stage].add_timelag(lag),
            None => false,
        }
    }

    /// Schedules a lifetime reset for every app id of `nid`.
    pub fn mark_erase(&mut self, nid: u32) {
        if let Some(node) = self.nodes.get_mut(&nid) {
            for (_, stages) in node.iter_mut() {
                for data in stages {
                    data.need_erase = true;
                }
            }
        }
    }

    pub fn node(&self, nid: u32) -> Option<&NodeLatencyAcc> {
        self.nodes.get(&nid)
    }

    pub fn node_mut(&mut self, nid: u32) -> Option<&mut NodeLatencyAcc> {
        self.nodes.get_mut(&nid)
    }
}
