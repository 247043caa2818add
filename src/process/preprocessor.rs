//! Correlation of start and end latency events.
//!
//! For every stage pair `(s, s + 1)` the start events logged at stage `s`
//! are matched by correlation key against the end events logged at stage
//! `s + 1`, across every thread that used the same app id. Each match
//! yields one time lag for the statistics table.

use std::sync::Arc;

use tracing::trace;

use super::aid_groups;
use super::latency::SharedLatencyTable;
use crate::chain::ChainHandler;
use crate::export::health::HealthMetrics;
use crate::meta::NodeMeta;
use crate::metric::ProcessorType;
use crate::node::latency::WindowGuard;
use crate::node::{NodeCells, NodeManager};

/// Lags at or above this ceiling are discarded as stale pairs.
pub const MAX_TIME_LAG_NS: u64 = 900_000_000;

pub struct Preprocessor {
    meta: Arc<NodeMeta>,
    nodes: Arc<NodeManager>,
    latency: SharedLatencyTable,
    metrics: Option<Arc<HealthMetrics>>,
}

impl Preprocessor {
    pub fn new(
        meta: Arc<NodeMeta>,
        nodes: Arc<NodeManager>,
        latency: SharedLatencyTable,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            meta,
            nodes,
            latency,
            metrics,
        }
    }

    /// Matches every closed window pair and returns the number of lags
    /// recorded.
    pub fn run(&self) -> u64 {
        let threads = self.nodes.snapshot();
        let mut table = self.latency.lock();
        let mut recorded = 0;

        for node in self.meta.nodes() {
            if !node.build || !node.run() || node.ptype != ProcessorType::Latency {
                continue;
            }
            let stages = node.filter_size.saturating_sub(1);
            for (aid, members) in aid_groups(&threads, node.nid as usize) {
                for stage in 0..stages {
                    let mut starts = Vec::with_capacity(members.len());
                    let mut ends = Vec::with_capacity(members.len());
                    let mut ready = true;
                    for &(slots, index) in &members {
                        let NodeCells::Latency(cells) = slots.cells() else {
                            continue;
                        };
                        let start = &cells[slots.cell_index(index, stage)].start;
                        let end = &cells[slots.cell_index(index, stage + 1)].end;
                        match (start.claim(), end.claim()) {
                            (Some(s), Some(e)) => {
                                starts.push(s);
                                ends.push(e);
                            }
                            _ => {
                                ready = false;
                                break;
                            }
                        }
                    }
                    if !ready {
                        continue;
                    }

                    for lag in correlate(&mut starts, &mut ends) {
                        if table.add_timelag(node.nid, aid, stage, lag) {
                            recorded += 1;
                        }
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.latency_matches.inc_by(recorded as f64);
        }
        recorded
    }
}

/// Removes every start/end pair sharing a key and returns the valid lags.
/// Pairs whose end precedes the start or whose lag reaches the ceiling are
/// dropped without a lag.
pub fn correlate(starts: &mut [WindowGuard<'_>], ends: &mut [WindowGuard<'_>]) -> Vec<u64> {
    let mut lags = Vec::new();
    for start in starts.iter_mut() {
        let start_data = start.data();
        let mut i = 0;
        while i < start_data.events.len() {
            let key = start_data.events[i].key;
            let found = ends.iter_mut().find_map(|end| {
                let data = end.data();
                let pos = data.events.iter().position(|event| event.key == key)?;
                data.match_count += 1;
                Some(data.events.remove(pos))
            });
            let Some(end_event) = found else {
                i += 1;
                continue;
            };

            let start_event = start_data.events.remove(i);
            start_data.match_count += 1;
            if let Some(lag) = end_event.timestamp_ns.checked_sub(start_event.timestamp_ns) {
                if lag < MAX_TIME_LAG_NS {
                    lags.push(lag);
                }
            }
        }
    }
    lags
}

impl ChainHandler for Preprocessor {
    fn handle_request(&mut self, option: u32) {
        let recorded = self.run();
        if recorded > 0 {
            trace!(recorded, forced = option == 1, "latency events correlated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::sample_meta;
    use crate::node::latency::LatencyWindow;
    use crate::process::latency::LatencyAccTable;

    fn open(window: &LatencyWindow) {
        window.claim().expect("claim").open(10);
    }

    fn close(window: &LatencyWindow) {
        window.abandon();
    }

    #[test]
    fn test_single_pair_records_one_lag() {
        let start = LatencyWindow::default();
        let end = LatencyWindow::default();
        open(&start);
        open(&end);
        start.record(42, 1_000);
        start.record(43, 1_500);
        end.record(42, 4_000);
        close(&start);
        close(&end);

        let mut starts = vec![start.claim().expect("start")];
        let mut ends = vec![end.claim().expect("end")];
        assert_eq!(correlate(&mut starts, &mut ends), vec![3_000]);
        assert_eq!(starts[0].data().match_count, 1);
        assert_eq!(ends[0].data().match_count, 1);
        // The unmatched start stays for the next round.
        assert_eq!(starts[0].data().events.len(), 1);
        assert!(ends[0].data().events.is_empty());
    }

    #[test]
    fn test_invalid_lags_are_consumed_without_samples() {
        let start = LatencyWindow::default();
        let end = LatencyWindow::default();
        open(&start);
        open(&end);
        start.record(1, 5_000);
        end.record(1, 4_000);
        start.record(2, 0);
        end.record(2, MAX_TIME_LAG_NS);
        close(&start);
        close(&end);

        let mut starts = vec![start.claim().expect("start")];
        let mut ends = vec![end.claim().expect("end")];
        assert!(correlate(&mut starts, &mut ends).is_empty());
        assert!(starts[0].data().events.is_empty());
        assert!(ends[0].data().events.is_empty());
    }

    #[test]
    fn test_disjoint_keys_match_nothing() {
        let start = LatencyWindow::default();
        let end = LatencyWindow::default();
        open(&start);
        open(&end);
        start.record(1, 10);
        end.record(2, 20);
        close(&start);
        close(&end);

        let mut starts = vec![start.claim().expect("start")];
        let mut ends = vec![end.claim().expect("end")];
        assert!(correlate(&mut starts, &mut ends).is_empty());
        assert_eq!(starts[0].data().match_count, 0);
        assert_eq!(ends[0].data().match_count, 0);
    }

    #[test]
    fn test_run_matches_across_threads_and_skips_open_windows() {
        let meta = Arc::new(sample_meta());
        let nodes = Arc::new(NodeManager::new(Arc::clone(&meta)));
        let table = LatencyAccTable::shared(&meta);
        let pre = Preprocessor::new(Arc::clone(&meta), Arc::clone(&nodes), Arc::clone(&table), None);

        // Stage 0 logged on thread 1, stage 1 on thread 2, same app id.
        let submit = nodes.thread_slots(1, "submit");
        let complete = nodes.thread_slots(2, "complete");
        let slots_a = submit.node(1).expect("latency");
        let slots_b = complete.node(1).expect("latency");
        let ia = slots_a.aids.insert(77).expect("aid");
        let ib = slots_b.aids.insert(77).expect("aid");
        let (NodeCells::Latency(a), NodeCells::Latency(b)) = (slots_a.cells(), slots_b.cells()) else {
            panic!("latency cells");
        };
        let start = &a[slots_a.cell_index(ia, 0)].start;
        let end = &b[slots_b.cell_index(ib, 1)].end;
        open(start);
        open(end);
        start.record(5, 100);
        end.record(5, 350);

        // Still running: nothing is drained.
        assert_eq!(pre.run(), 0);

        close(start);
        close(end);
        assert_eq!(pre.run(), 1);
        let table = table.lock();
        let acc = table.node(1).expect("node").get(77, 0).expect("stage");
        assert_eq!(acc.sample_count, 1);
        assert_eq!(acc.period.max, 250);
    }
}
