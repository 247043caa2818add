//! Analysis tick: aggregation of closed periods into a [`Snapshot`].

pub mod latency;
pub mod preprocessor;
pub mod processor;
pub mod snapshot;
pub mod timing;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use self::latency::SharedLatencyTable;
use self::processor::Processor;
use self::snapshot::{NodeReport, ObjFields, ObjReport, Snapshot};
use self::timing::TimingDistributor;
use crate::chain::ChainHandler;
use crate::meta::{GlobalMeta, GlobalMetaGetter, NodeMeta, NodeMetaData};
use crate::metric::ProcessorType;
use crate::node::{NodeManager, NodeSlots, ThreadSlots};

/// Hand-off point between the process and stream stages.
pub type Outbox = Arc<Mutex<Option<Snapshot>>>;

/// Slots of node `nid` grouped by app id across threads, as
/// `(slots, app index)` pairs.
pub(crate) fn aid_groups(
    threads: &[Arc<ThreadSlots>],
    nid: usize,
) -> BTreeMap<u64, Vec<(&NodeSlots, usize)>> {
    let mut groups: BTreeMap<u64, Vec<(&NodeSlots, usize)>> = BTreeMap::new();
    for thread in threads {
        let Some(slots) = thread.node(nid) else {
            continue;
        };
        for (index, aid) in slots.aids.iter() {
            groups.entry(aid).or_default().push((slots, index));
        }
    }
    groups
}

pub struct ProcessManager {
    meta: Arc<NodeMeta>,
    global: Arc<GlobalMeta>,
    nodes: Arc<NodeManager>,
    latency: SharedLatencyTable,
    timing: TimingDistributor,
    outbox: Outbox,
}

impl ProcessManager {
    pub fn new(
        meta: Arc<NodeMeta>,
        global: Arc<GlobalMeta>,
        nodes: Arc<NodeManager>,
        latency: SharedLatencyTable,
        timing: TimingDistributor,
    ) -> Self {
        Self {
            meta,
            global,
            nodes,
            latency,
            timing,
            outbox: Arc::new(Mutex::new(None)),
        }
    }

    pub fn outbox(&self) -> Outbox {
        Arc::clone(&self.outbox)
    }

    /// Aggregates the period that just closed and redistributes latency
    /// window deadlines over the next `interval` seconds.
    pub fn stream_data(&mut self, interval: u32) -> Snapshot {
        let threads = self.nodes.snapshot();
        let mut node = BTreeMap::new();
        for meta in self.meta.nodes() {
            let objs = if !meta.build {
                Vec::new()
            } else if meta.ptype == ProcessorType::Latency {
                self.latency_objs(meta)
            } else {
                slot_objs(meta, &threads, interval)
            };
            node.insert(meta.name.clone(), self.report(meta, objs));
        }

        let group = self
            .meta
            .groups()
            .iter()
            .enumerate()
            .map(|(gid, name)| {
                let members = self
                    .meta
                    .group_members(gid as u32)
                    .filter_map(|nid| self.meta.node(nid))
                    .map(|node| node.name.clone())
                    .collect();
                (name.clone(), members)
            })
            .collect();

        let distributed = self.timing.distribute(&threads, interval);
        debug!(
            nodes = node.len(),
            threads = threads.len(),
            windows = distributed,
            "analysis period closed"
        );

        Snapshot {
            timestamp: Utc::now(),
            interval,
            play: self.global.air_play(),
            group,
            node,
        }
    }

    fn report(&self, meta: &NodeMetaData, objs: Vec<ObjReport>) -> NodeReport {
        NodeReport {
            node_id: meta.nid,
            ptype: meta.ptype,
            build: meta.build,
            run: meta.run(),
            group: meta
                .group_id
                .and_then(|gid| self.meta.group_name(gid))
                .map(str::to_string),
            filter: meta.filter_items.clone(),
            objs,
        }
    }

    fn latency_objs(&self, meta: &NodeMetaData) -> Vec<ObjReport> {
        let mut table = self.latency.lock();
        let Some(acc) = table.node_mut(meta.nid) else {
            return Vec::new();
        };
        let mut objs = Vec::new();
        for (aid, stages) in acc.iter_mut() {
            for (stage, data) in stages.iter_mut().enumerate() {
                if let Some(obj) = processor::latency(data) {
                    objs.push(ObjReport {
                        target_id: None,
                        target_name: format!("{}-{}", stage, stage + 1),
                        index: aid,
                        filter: None,
                        fields: ObjFields::Latency(obj),
                    });
                }
            }
        }
        objs
    }
}

fn slot_objs(meta: &NodeMetaData, threads: &[Arc<ThreadSlots>], interval: u32) -> Vec<ObjReport> {
    let processor = Processor::for_type(meta.ptype);
    let mut objs = Vec::new();
    for thread in threads {
        let Some(slots) = thread.node(meta.nid as usize) else {
            continue;
        };
        processor.stream(slots, interval, |index, filter, fields| {
            let Some(aid) = slots.aids.key_of(index) else {
                return;
            };
            objs.push(ObjReport {
                target_id: Some(thread.tid()),
                target_name: thread.name().to_string(),
                index: aid,
                filter: meta.filter_items.get(filter).cloned(),
                fields,
            });
        });
    }
    objs
}

impl ChainHandler for ProcessManager {
    fn handle_request(&mut self, option: u32) {
        let snapshot = self.stream_data(option);
        *self.outbox.lock() = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::sample_meta;
    use crate::node::NodeCells;
    use crate::process::latency::LatencyAccTable;
    use crate::process::snapshot::CountObj;

    fn manager() -> (ProcessManager, Arc<NodeManager>, SharedLatencyTable) {
        let meta = Arc::new(sample_meta());
        let global = Arc::new(GlobalMeta::new(true, 1));
        let nodes = Arc::new(NodeManager::new(Arc::clone(&meta)));
        let latency = LatencyAccTable::shared(&meta);
        let timing = TimingDistributor::with_seed(Arc::clone(&meta), 3);
        (
            ProcessManager::new(meta, global, Arc::clone(&nodes), Arc::clone(&latency), timing),
            nodes,
            latency,
        )
    }

    #[test]
    fn test_snapshot_layout() {
        let (mut manager, _, _) = manager();
        let snapshot = manager.stream_data(1);
        assert_eq!(snapshot.node.len(), 6);
        assert_eq!(snapshot.group["IO"], vec!["PERF_IO", "LAT_IO"]);
        assert_eq!(snapshot.group["BACKEND"], vec!["Q_SUBMIT", "UTIL_CPU"]);

        let off = &snapshot.node["CNT_OFF"];
        assert!(!off.build);
        assert_eq!(off.group, None);
        let perf = &snapshot.node["PERF_IO"];
        assert_eq!(perf.group.as_deref(), Some("IO"));
        assert_eq!(perf.filter, vec!["READ", "WRITE"]);
    }

    #[test]
    fn test_count_objects_lag_one_period() {
        let (mut manager, nodes, _) = manager();
        let thread = nodes.thread_slots(21, "worker");
        let slots = thread.node(5).expect("count");
        let index = slots.aids.insert(1234).expect("aid");
        let NodeCells::Count(cells) = slots.cells() else {
            panic!("count cells");
        };
        cells[slots.cell_index(index, 0)].write(|d| {
            d.access = true;
            d.count_positive = 3;
            d.num_req_positive = 1;
        });

        assert!(manager.stream_data(1).objs("CNT_REF").is_empty());
        let snapshot = manager.stream_data(1);
        let objs = snapshot.objs("CNT_REF");
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].target_id, Some(21));
        assert_eq!(objs[0].target_name, "worker");
        assert_eq!(objs[0].index, 1234);
        assert_eq!(objs[0].filter.as_deref(), Some("AIR_BASE"));
        assert!(matches!(
            objs[0].fields,
            ObjFields::Count(CountObj { total_count: 3, .. })
        ));
    }

    #[test]
    fn test_latency_objects_named_by_stage_pair() {
        let (mut manager, _, latency) = manager();
        latency.lock().add_timelag(1, 77, 1, 500);

        let snapshot = manager.stream_data(1);
        let objs = snapshot.objs("LAT_IO");
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].target_name, "1-2");
        assert_eq!(objs[0].target_id, None);
        assert_eq!(objs[0].index, 77);

        // Lifetime samples keep the object alive in later periods.
        assert_eq!(manager.stream_data(1).objs("LAT_IO").len(), 1);
    }

    #[test]
    fn test_handler_fills_outbox() {
        let (mut manager, _, _) = manager();
        let outbox = manager.outbox();
        manager.handle_request(4);
        let snapshot = outbox.lock().take().expect("snapshot");
        assert_eq!(snapshot.interval, 4);
        assert!(snapshot.play);
    }
}
