//! Exported view of one analysis tick.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metric::ProcessorType;

/// Everything produced by one analysis tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    /// Streaming interval in seconds the period covered.
    pub interval: u32,
    pub play: bool,
    /// Group name to member node names.
    pub group: BTreeMap<String, Vec<String>>,
    pub node: BTreeMap<String, NodeReport>,
}

impl Snapshot {
    /// Objects of `node`, empty when the node is unknown.
    pub fn objs(&self, node: &str) -> &[ObjReport] {
        self.node.get(node).map_or(&[], |report| report.objs.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: u32,
    #[serde(rename = "type")]
    pub ptype: ProcessorType,
    pub build: bool,
    pub run: bool,
    pub group: Option<String>,
    pub filter: Vec<String>,
    pub objs: Vec<ObjReport>,
}

/// One exported object: a (thread, app id, filter item) for most types, a
/// (app id, stage pair) for latency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjReport {
    pub target_id: Option<u32>,
    pub target_name: String,
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(flatten)]
    pub fields: ObjFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjFields {
    Performance(PerformanceObj),
    Latency(LatencyObj),
    Queue(QueueObj),
    Utilization(UtilizationObj),
    Count(CountObj),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceObj {
    /// Per second when the period is longer than one second.
    pub iops: u64,
    pub bw: u64,
    pub iops_avg: f64,
    pub bw_avg: f64,
    pub time_spent: u64,
    /// I/O size in bytes to count.
    pub packet_cnt: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueObj {
    pub size: u64,
    pub num_req: u64,
    pub depth_period_avg: f64,
    pub depth_period_max: u64,
    pub depth_total_avg: f64,
    pub depth_total_max: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtilizationObj {
    pub usage: u64,
    pub total_usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountObj {
    pub count_positive: u64,
    pub num_req_positive: u64,
    pub count_negative: u64,
    pub num_req_negative: u64,
    pub total_count: i64,
    pub total_num_req_positive: u64,
    pub total_num_req_negative: u64,
}

/// Lag statistics in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyObj {
    pub mean: u64,
    pub min: u64,
    pub max: u64,
    pub median: u64,
    pub low_qt: u64,
    pub up_qt: u64,
    pub sample_cnt: u64,
    pub bucket_cnt: u64,
    pub total_mean: u64,
    pub total_min: u64,
    pub total_max: u64,
    pub total_median: u64,
    pub total_low_qt: u64,
    pub total_up_qt: u64,
    pub total_sample_cnt: u64,
}
