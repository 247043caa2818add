//! Routing of log calls to writers, and control commands that change what
//! is collected.

pub mod collector;
pub mod switch_gear;
pub mod writer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use self::collector::{Collector, SAMPLING_RATE_RANGE};
use crate::chain::ChainHandler;
use crate::control::observer::{Notice, NoticeQueue, Route, Subject};
use crate::control::{Command, NodeSelector};
use crate::error::ControlError;
use crate::export::health::HealthMetrics;
use crate::meta::{GlobalMeta, GlobalMetaGetter, NodeMeta};
use crate::metric::ProcessorType;
use crate::node::{NodeCells, NodeManager, ThreadSlots};
use crate::process::latency::SharedLatencyTable;

pub struct CollectionManager {
    node_meta: Arc<NodeMeta>,
    global: Arc<GlobalMeta>,
    nodes: Arc<NodeManager>,
    latency: SharedLatencyTable,
    collectors: Box<[Collector]>,
    dropped: AtomicU64,
}

impl CollectionManager {
    pub fn new(
        node_meta: Arc<NodeMeta>,
        global: Arc<GlobalMeta>,
        nodes: Arc<NodeManager>,
        latency: SharedLatencyTable,
    ) -> Self {
        let collectors = node_meta.nodes().iter().map(Collector::new).collect();
        Self {
            node_meta,
            global,
            nodes,
            latency,
            collectors,
            dropped: AtomicU64::new(0),
        }
    }

    /// Hot-path entry: records `value` for app id `aid` under `filter` of
    /// node `nid` in the calling thread's slots.
    ///
    /// Returns false when nothing was recorded. A full app-id table or an
    /// out-of-range filter also counts as a dropped sample.
    #[inline]
    pub fn log_data(
        &self,
        thread: &ThreadSlots,
        nid: u32,
        aid: u64,
        filter: u32,
        value: u64,
    ) -> bool {
        if !self.global.air_play() {
            return false;
        }
        let Some(node) = self.node_meta.node(nid) else {
            return false;
        };
        if !node.run() {
            return false;
        }
        let Some(slots) = thread.node(nid as usize) else {
            return false;
        };

        let filter = filter as usize;
        if filter >= slots.filter_size() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(index) = slots.aids.insert(aid) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        self.collectors[nid as usize].log(node, slots, index, filter, value)
    }

    /// Samples dropped for lack of room since startup.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Applies one validated command. Multi-node commands stop at the first
    /// node that fails.
    pub fn update_collection(&self, command: Command) -> Result<(), ControlError> {
        match command {
            Command::EnableAir(play) => {
                self.global.set_air_play(play);
                Ok(())
            }
            Command::SetStreamingInterval(secs) => {
                if !crate::control::ruler::STREAMING_INTERVAL_RANGE.contains(&secs) {
                    return Err(ControlError::InvalidInterval { secs });
                }
                self.global.set_streaming_interval(secs);
                Ok(())
            }
            Command::EnableNode { selector, on } => {
                for nid in self.select(selector)? {
                    let node = self
                        .node_meta
                        .node(nid)
                        .ok_or(ControlError::InvalidNode { nid })?;
                    node.set_run(on);
                    debug!(node = %node.name, run = on, "node switched");
                }
                Ok(())
            }
            Command::InitializeNode { selector } => {
                for nid in self.select(selector)? {
                    self.init_node(nid)?;
                }
                Ok(())
            }
            Command::SetSamplingRate { selector, rate } => {
                if !SAMPLING_RATE_RANGE.contains(&rate) {
                    return Err(ControlError::SamplingRateOutOfRange { rate });
                }
                for nid in self.select(selector)? {
                    let node = self
                        .node_meta
                        .node(nid)
                        .ok_or(ControlError::InvalidNode { nid })?;
                    self.collectors[nid as usize].set_sampling_rate(node, rate)?;
                }
                Ok(())
            }
        }
    }

    /// Node ids named by `selector`, in ascending order. Ids past the last
    /// node are kept so the caller fails on them in order.
    fn select(&self, selector: NodeSelector) -> Result<Vec<u32>, ControlError> {
        match selector {
            NodeSelector::Node(nid) => Ok(vec![nid]),
            NodeSelector::Range { start, end } if start > end => {
                Err(ControlError::InvalidRange { start, end })
            }
            NodeSelector::Range { start, end } => Ok((start..=end).collect()),
            NodeSelector::Group(gid) if gid as usize >= self.node_meta.group_count() => {
                Err(ControlError::InvalidGroup { gid })
            }
            NodeSelector::Group(gid) => Ok(self.node_meta.group_members(gid).collect()),
            NodeSelector::All => Ok((0..self.node_meta.node_count() as u32).collect()),
        }
    }

    /// Schedules a lifetime reset of every accumulator of `nid`. The reset
    /// happens at the next analysis tick.
    fn init_node(&self, nid: u32) -> Result<(), ControlError> {
        let node = self
            .node_meta
            .node(nid)
            .ok_or(ControlError::InvalidNode { nid })?;
        if !node.build {
            return Ok(());
        }

        if node.ptype == ProcessorType::Latency {
            self.latency.lock().mark_erase(nid);
            return Ok(());
        }

        self.nodes.for_each(|thread| {
            let Some(slots) = thread.node(nid as usize) else {
                return;
            };
            match slots.cells() {
                NodeCells::Performance(cells) => {
                    for slot in cells.iter() {
                        if let Some(mut reader) = slot.reader() {
                            reader.acc().need_erase = true;
                        }
                    }
                }
                NodeCells::Queue(cells) => {
                    for cell in cells.iter() {
                        if let Some(mut reader) = cell.slot.reader() {
                            reader.acc().need_erase = true;
                        }
                    }
                }
                NodeCells::Utilization(cells) => {
                    for slot in cells.iter() {
                        if let Some(mut reader) = slot.reader() {
                            reader.acc().need_erase = true;
                        }
                    }
                }
                NodeCells::Count(cells) => {
                    for slot in cells.iter() {
                        if let Some(mut reader) = slot.reader() {
                            reader.acc().need_erase = true;
                        }
                    }
                }
                NodeCells::Latency(_) => {}
            }
        });
        debug!(node = %node.name, "node accumulators scheduled for reset");
        Ok(())
    }
}

/// Collection stage of the control chain: applies queued commands and
/// forwards their result to the output stage.
pub struct CollectionStage {
    manager: Arc<CollectionManager>,
    inbox: NoticeQueue,
    subject: Arc<Subject>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl CollectionStage {
    pub fn new(
        manager: Arc<CollectionManager>,
        inbox: NoticeQueue,
        subject: Arc<Subject>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            manager,
            inbox,
            subject,
            metrics,
        }
    }

    pub fn handle_msg(&self) {
        for notice in self.inbox.drain() {
            let result =
                Command::decode(&notice.msg).and_then(|cmd| self.manager.update_collection(cmd));
            let code = match result {
                Ok(()) => 0,
                Err(e) => {
                    warn!(type2 = notice.msg.type2, error = %e, "control command failed");
                    e.code()
                }
            };
            if let Err(e) = self.subject.notify(
                Route::Output,
                Notice {
                    msg: notice.msg,
                    code,
                },
            ) {
                warn!(error = %e, "forwarding control result");
            }
        }
    }
}

impl ChainHandler for CollectionStage {
    fn handle_request(&mut self, _option: u32) {
        self.handle_msg();
        if let Some(metrics) = &self.metrics {
            metrics
                .samples_dropped
                .set(self.manager.dropped_samples() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::sample_meta;
    use crate::meta::NodeMetaGetter;
    use crate::process::latency::LatencyAccTable;

    fn manager() -> (CollectionManager, Arc<NodeMeta>, Arc<NodeManager>, Arc<GlobalMeta>) {
        let meta = Arc::new(sample_meta());
        let global = Arc::new(GlobalMeta::new(true, 1));
        let nodes = Arc::new(NodeManager::new(Arc::clone(&meta)));
        let latency = LatencyAccTable::shared(&meta);
        (
            CollectionManager::new(
                Arc::clone(&meta),
                Arc::clone(&global),
                Arc::clone(&nodes),
                latency,
            ),
            meta,
            nodes,
            global,
        )
    }

    #[test]
    fn test_log_data_gates() {
        let (manager, meta, nodes, global) = manager();
        let thread = nodes.thread_slots(1, "t");

        assert!(manager.log_data(&thread, 3, 9, 0, 40));
        // Unknown node, unbuilt node.
        assert!(!manager.log_data(&thread, 42, 9, 0, 40));
        assert!(!manager.log_data(&thread, 4, 9, 0, 40));

        meta.nodes()[3].set_run(false);
        assert!(!manager.log_data(&thread, 3, 9, 0, 40));
        meta.nodes()[3].set_run(true);

        global.set_air_play(false);
        assert!(!manager.log_data(&thread, 3, 9, 0, 40));
        global.set_air_play(true);
        assert_eq!(manager.dropped_samples(), 0);
    }

    #[test]
    fn test_log_data_counts_drops() {
        let (manager, _, nodes, _) = manager();
        let thread = nodes.thread_slots(1, "t");

        // Filter 2 is out of range for a two-item filter.
        assert!(!manager.log_data(&thread, 0, 1, 2, 512));
        assert_eq!(manager.dropped_samples(), 1);

        // Index size is 4: a fifth app id does not fit.
        for aid in 100..104 {
            assert!(manager.log_data(&thread, 0, aid, 0, 512));
        }
        assert!(!manager.log_data(&thread, 0, 104, 0, 512));
        assert_eq!(manager.dropped_samples(), 2);
    }

    #[test]
    fn test_enable_range_stops_at_first_bad_node() {
        let (manager, meta, _, _) = manager();
        let result = manager.update_collection(Command::EnableNode {
            selector: NodeSelector::Range { start: 4, end: 7 },
            on: false,
        });
        assert_eq!(result, Err(ControlError::InvalidNode { nid: 6 }));
        assert!(!meta.run(4));
        assert!(!meta.run(5));
        assert!(meta.run(3));
    }

    #[test]
    fn test_enable_group_and_all() {
        let (manager, meta, _, _) = manager();
        manager
            .update_collection(Command::EnableNode {
                selector: NodeSelector::Group(1),
                on: false,
            })
            .expect("group");
        assert!(!meta.run(2));
        assert!(!meta.run(3));
        assert!(meta.run(0));

        manager
            .update_collection(Command::EnableNode {
                selector: NodeSelector::All,
                on: true,
            })
            .expect("all");
        assert!((0..6).all(|nid| meta.run(nid)));

        assert_eq!(
            manager.update_collection(Command::EnableNode {
                selector: NodeSelector::Group(9),
                on: true,
            }),
            Err(ControlError::InvalidGroup { gid: 9 })
        );
    }

    #[test]
    fn test_sampling_rate_out_of_range_changes_nothing() {
        let (manager, meta, _, _) = manager();
        let before: Vec<_> = (0..6).map(|nid| meta.sample_ratio(nid)).collect();
        for rate in [0, 10_001] {
            let result = manager.update_collection(Command::SetSamplingRate {
                selector: NodeSelector::All,
                rate,
            });
            assert_eq!(result.map_err(|e| e.code()), Err(-2));
        }
        let after: Vec<_> = (0..6).map(|nid| meta.sample_ratio(nid)).collect();
        assert_eq!(before, after);

        manager
            .update_collection(Command::SetSamplingRate {
                selector: NodeSelector::Node(2),
                rate: 10_000,
            })
            .expect("in range");
        assert_eq!(meta.sample_ratio(2), 10_000);
    }

    #[test]
    fn test_init_node_marks_accumulators() {
        let (manager, _, nodes, _) = manager();
        let thread = nodes.thread_slots(1, "t");
        manager.log_data(&thread, 5, 1, 0, 3);

        manager
            .update_collection(Command::InitializeNode {
                selector: NodeSelector::Node(5),
            })
            .expect("init");

        let NodeCells::Count(cells) = thread.node(5).expect("count").cells() else {
            panic!("count cells");
        };
        let mut reader = cells[0].reader().expect("reader");
        assert!(reader.acc().need_erase);

        assert_eq!(
            manager.update_collection(Command::InitializeNode {
                selector: NodeSelector::Node(6),
            }),
            Err(ControlError::InvalidNode { nid: 6 })
        );
    }

    #[test]
    fn test_collection_stage_replies_through_output() {
        use crate::control::observer::queue;
        use crate::control::{kind, ControlMsg};

        let (manager, meta, _, _) = manager();
        let (collection_observer, inbox) = queue();
        let (output_observer, output_queue) = queue();
        let mut subject = Subject::new();
        subject.attach(Route::Collection, Arc::new(collection_observer));
        subject.attach(Route::Output, Arc::new(output_observer));
        let subject = Arc::new(subject);

        let mut stage = CollectionStage::new(Arc::new(manager), inbox, Arc::clone(&subject), None);
        let ok = ControlMsg::new(kind::ENABLE_NODE, 0, 1);
        let bad = ControlMsg::new(kind::SET_SAMPLING_RATE, 0, 1);
        subject.notify(Route::Collection, Notice { msg: ok, code: 0 }).expect("notify");
        subject.notify(Route::Collection, Notice { msg: bad, code: 0 }).expect("notify");

        stage.handle_request(0);
        let replies = output_queue.drain();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].code, 0);
        assert_eq!(replies[1].code, -2);
        assert!(!meta.run(1));
    }
}
