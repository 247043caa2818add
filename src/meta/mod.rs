//! Node and engine metadata shared by the hot path and the scheduler.
//!
//! Static settings come from the configuration. The few fields the control
//! plane may change at runtime (run flag, sampling ratio, play switch,
//! streaming interval) are atomics so the logging path reads them lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::Result;

use crate::config::Config;
use crate::metric::ProcessorType;

/// Read-only view of per-node settings.
pub trait NodeMetaGetter {
    fn processor_type(&self, nid: u32) -> Option<ProcessorType>;
    fn run(&self, nid: u32) -> bool;
    fn group_id(&self, nid: u32) -> Option<u32>;
    fn index_size(&self, nid: u32) -> usize;
    fn filter_size(&self, nid: u32) -> usize;
    fn sample_ratio(&self, nid: u32) -> u32;
}

/// Read-only view of engine-wide settings.
pub trait GlobalMetaGetter {
    fn air_play(&self) -> bool;
    /// Analysis period in seconds.
    fn streaming_interval(&self) -> u32;
    /// True when the interval changed since the scheduler last looked.
    fn streaming_update(&self) -> bool;
    fn cpu_num(&self) -> u32;
}

/// Settings of one node.
#[derive(Debug)]
pub struct NodeMetaData {
    pub nid: u32,
    pub name: String,
    pub ptype: ProcessorType,
    /// Slots exist only for built nodes. Fixed at startup.
    pub build: bool,
    pub group_id: Option<u32>,
    pub index_size: usize,
    pub filter_name: String,
    pub filter_items: Vec<String>,
    pub filter_size: usize,
    run: AtomicBool,
    sample_ratio: AtomicU32,
}

impl NodeMetaData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nid: u32,
        name: impl Into<String>,
        ptype: ProcessorType,
        build: bool,
        run: bool,
        group_id: Option<u32>,
        index_size: usize,
        filter_name: impl Into<String>,
        filter_items: Vec<String>,
        sample_ratio: u32,
    ) -> Self {
        Self {
            nid,
            name: name.into(),
            ptype,
            build,
            group_id,
            index_size,
            filter_name: filter_name.into(),
            filter_size: filter_items.len(),
            filter_items,
            run: AtomicBool::new(run),
            sample_ratio: AtomicU32::new(sample_ratio),
        }
    }

    #[inline]
    pub fn run(&self) -> bool {
        self.run.load(Ordering::Relaxed)
    }

    pub fn set_run(&self, run: bool) {
        self.run.store(run, Ordering::Relaxed);
    }

    #[inline]
    pub fn sample_ratio(&self) -> u32 {
        self.sample_ratio.load(Ordering::Relaxed)
    }

    pub fn set_sample_ratio(&self, ratio: u32) {
        self.sample_ratio.store(ratio, Ordering::Relaxed);
    }
}

/// All node settings, indexed by node id.
#[derive(Debug, Default)]
pub struct NodeMeta {
    nodes: Vec<NodeMetaData>,
    groups: Vec<String>,
    by_name: HashMap<String, u32>,
    aid_size: usize,
}

impl NodeMeta {
    pub fn new(nodes: Vec<NodeMetaData>, groups: Vec<String>, aid_size: usize) -> Self {
        let by_name = nodes
            .iter()
            .map(|node| (node.name.clone(), node.nid))
            .collect();
        Self {
            nodes,
            groups,
            by_name,
            aid_size,
        }
    }

    /// Builds the table from a validated configuration. Node ids follow
    /// declaration order, group ids likewise.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let groups: Vec<String> = cfg.groups.iter().map(|g| g.name.clone()).collect();
        let nodes = cfg
            .resolved_nodes()?
            .into_iter()
            .enumerate()
            .map(|(nid, node)| {
                let group_id = node
                    .group
                    .as_ref()
                    .and_then(|name| groups.iter().position(|g| g == name))
                    .map(|gid| gid as u32);
                NodeMetaData::new(
                    nid as u32,
                    node.name,
                    node.ptype,
                    node.build,
                    node.run,
                    group_id,
                    node.index_size,
                    node.filter_name,
                    node.filter_items,
                    node.sampling_ratio,
                )
            })
            .collect();

        Ok(Self::new(nodes, groups, cfg.defaults.aid_size))
    }

    pub fn nodes(&self) -> &[NodeMetaData] {
        &self.nodes
    }

    #[inline]
    pub fn node(&self, nid: u32) -> Option<&NodeMetaData> {
        self.nodes.get(nid as usize)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_name(&self, gid: u32) -> Option<&str> {
        self.groups.get(gid as usize).map(String::as_str)
    }

    /// App ids tracked per latency node in the statistics table.
    pub fn aid_size(&self) -> usize {
        self.aid_size
    }

    pub fn node_id(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Position of `item` in the filter of node `nid`.
    pub fn filter_index(&self, nid: u32, item: &str) -> Option<u32> {
        self.node(nid)?
            .filter_items
            .iter()
            .position(|candidate| candidate == item)
            .map(|index| index as u32)
    }

    /// Node ids belonging to group `gid`.
    pub fn group_members(&self, gid: u32) -> impl Iterator<Item = u32> + '_ {
        self.nodes
            .iter()
            .filter(move |node| node.group_id == Some(gid))
            .map(|node| node.nid)
    }
}

impl NodeMetaGetter for NodeMeta {
    fn processor_type(&self, nid: u32) -> Option<ProcessorType> {
        self.node(nid).map(|node| node.ptype)
    }

    fn run(&self, nid: u32) -> bool {
        self.node(nid).is_some_and(NodeMetaData::run)
    }

    fn group_id(&self, nid: u32) -> Option<u32> {
        self.node(nid)?.group_id
    }

    fn index_size(&self, nid: u32) -> usize {
        self.node(nid).map_or(0, |node| node.index_size)
    }

    fn filter_size(&self, nid: u32) -> usize {
        self.node(nid).map_or(0, |node| node.filter_size)
    }

    fn sample_ratio(&self, nid: u32) -> u32 {
        self.node(nid).map_or(0, NodeMetaData::sample_ratio)
    }
}

/// Engine-wide switches.
#[derive(Debug)]
pub struct GlobalMeta {
    air_build: bool,
    air_play: AtomicBool,
    streaming_interval: AtomicU32,
    streaming_update: AtomicBool,
    cpu_num: u32,
}

impl GlobalMeta {
    pub fn new(air_build: bool, streaming_interval: u32) -> Self {
        let cpu_num = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            air_build,
            air_play: AtomicBool::new(air_build),
            streaming_interval: AtomicU32::new(streaming_interval),
            streaming_update: AtomicBool::new(false),
            cpu_num,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.defaults.air_build, cfg.streaming_interval_secs())
    }

    pub fn air_build(&self) -> bool {
        self.air_build
    }

    pub fn set_air_play(&self, play: bool) {
        self.air_play.store(play && self.air_build, Ordering::Relaxed);
    }

    /// Stores a new analysis period and flags it for the scheduler.
    pub fn set_streaming_interval(&self, secs: u32) {
        self.streaming_interval.store(secs, Ordering::Relaxed);
        self.streaming_update.store(true, Ordering::Release);
    }

    /// Consumes the update flag.
    pub fn take_streaming_update(&self) -> bool {
        self.streaming_update.swap(false, Ordering::Acquire)
    }
}

impl GlobalMetaGetter for GlobalMeta {
    #[inline]
    fn air_play(&self) -> bool {
        self.air_play.load(Ordering::Relaxed)
    }

    fn streaming_interval(&self) -> u32 {
        self.streaming_interval.load(Ordering::Relaxed)
    }

    fn streaming_update(&self) -> bool {
        self.streaming_update.load(Ordering::Acquire)
    }

    fn cpu_num(&self) -> u32 {
        self.cpu_num
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn items(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Six nodes, one per processor type plus an unbuilt count node:
    /// 0 PERF_IO, 1 LAT_IO, 2 Q_SUBMIT, 3 UTIL_CPU, 4 CNT_OFF, 5 CNT_REF.
    pub(crate) fn sample_meta() -> NodeMeta {
        let nodes = vec![
            NodeMetaData::new(
                0,
                "PERF_IO",
                ProcessorType::Performance,
                true,
                true,
                Some(0),
                4,
                "RW",
                items(&["READ", "WRITE"]),
                1000,
            ),
            NodeMetaData::new(
                1,
                "LAT_IO",
                ProcessorType::Latency,
                true,
                true,
                Some(0),
                4,
                "STAGE",
                items(&["AIR_0", "AIR_1", "AIR_2"]),
                1000,
            ),
            NodeMetaData::new(
                2,
                "Q_SUBMIT",
                ProcessorType::Queue,
                true,
                true,
                Some(1),
                4,
                "AIR_BASE",
                items(&["AIR_BASE"]),
                1,
            ),
            NodeMetaData::new(
                3,
                "UTIL_CPU",
                ProcessorType::Utilization,
                true,
                true,
                Some(1),
                4,
                "AIR_BASE",
                items(&["AIR_BASE"]),
                1000,
            ),
            NodeMetaData::new(
                4,
                "CNT_OFF",
                ProcessorType::Count,
                false,
                true,
                None,
                4,
                "AIR_BASE",
                items(&["AIR_BASE"]),
                1000,
            ),
            NodeMetaData::new(
                5,
                "CNT_REF",
                ProcessorType::Count,
                true,
                true,
                None,
                4,
                "AIR_BASE",
                items(&["AIR_BASE"]),
                1000,
            ),
        ];
        NodeMeta::new(nodes, items(&["IO", "BACKEND"]), 8)
    }

    #[test]
    fn test_lookup_by_name() {
        let meta = sample_meta();
        assert_eq!(meta.node_id("Q_SUBMIT"), Some(2));
        assert_eq!(meta.node_id("nope"), None);
        assert_eq!(meta.filter_index(0, "WRITE"), Some(1));
        assert_eq!(meta.filter_index(0, "AIR_BASE"), None);
        assert_eq!(meta.filter_index(42, "READ"), None);
        assert_eq!(meta.group_name(1), Some("BACKEND"));
    }

    #[test]
    fn test_getters() {
        let meta = sample_meta();
        assert_eq!(meta.processor_type(1), Some(ProcessorType::Latency));
        assert_eq!(meta.filter_size(1), 3);
        assert_eq!(meta.index_size(1), 4);
        assert_eq!(meta.group_id(4), None);
        assert_eq!(meta.group_id(2), Some(1));
        assert!(!meta.run(99));

        meta.nodes()[2].set_sample_ratio(77);
        assert_eq!(meta.sample_ratio(2), 77);
        meta.nodes()[2].set_run(false);
        assert!(!meta.run(2));

        let members: Vec<_> = meta.group_members(0).collect();
        assert_eq!(members, vec![0, 1]);
    }

    #[test]
    fn test_from_config() {
        let cfg = Config::from_yaml(
            r#"
groups:
  - name: G
filters:
  - name: S
    items: ["S_0 ... S_1"]
nodes:
  - name: A
    type: count
  - name: B
    type: latency
    filter: S
    group: G
"#,
        )
        .expect("config");
        let meta = NodeMeta::from_config(&cfg).expect("meta");
        assert_eq!(meta.node_count(), 2);
        assert_eq!(meta.node(1).map(|n| n.group_id), Some(Some(0)));
        assert_eq!(meta.filter_size(1), 2);
        assert_eq!(meta.filter_size(0), 1);
        assert_eq!(meta.aid_size(), 32);
    }

    #[test]
    fn test_global_meta_update_flag() {
        let global = GlobalMeta::new(true, 1);
        assert!(global.air_play());
        assert!(!global.streaming_update());
        global.set_streaming_interval(5);
        assert!(global.streaming_update());
        assert_eq!(global.streaming_interval(), 5);
        assert!(global.take_streaming_update());
        assert!(!global.streaming_update());
        assert!(global.cpu_num() >= 1);
    }

    #[test]
    fn test_play_requires_build() {
        let global = GlobalMeta::new(false, 1);
        assert!(!global.air_play());
        global.set_air_play(true);
        assert!(!global.air_play());
    }
}
