use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use super::NodeManager;
use crate::chain::ChainHandler;
use crate::export::health::HealthMetrics;

/// Lists threads of the current process that are still running.
pub trait ThreadDiscovery: Send + Sync {
    /// Live task ids, or `None` when liveness cannot be observed and every
    /// thread must be treated as alive.
    fn live_tids(&self) -> Result<Option<HashSet<u32>>>;
}

/// Reads `/proc/self/task`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcTaskDiscovery;

impl ThreadDiscovery for ProcTaskDiscovery {
    #[cfg(target_os = "linux")]
    fn live_tids(&self) -> Result<Option<HashSet<u32>>> {
        use anyhow::Context;
        use std::fs;

        let entries = fs::read_dir("/proc/self/task").context("reading /proc/self/task")?;
        let mut tids = HashSet::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if let Ok(tid) = entry.file_name().to_string_lossy().parse() {
                tids.insert(tid);
            }
        }
        Ok(Some(tids))
    }

    #[cfg(not(target_os = "linux"))]
    fn live_tids(&self) -> Result<Option<HashSet<u32>>> {
        Ok(None)
    }
}

/// Drops slot sets of exited threads once nothing in them is pending.
pub struct Detector {
    nodes: Arc<NodeManager>,
    discovery: Box<dyn ThreadDiscovery>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl Detector {
    pub fn new(
        nodes: Arc<NodeManager>,
        discovery: Box<dyn ThreadDiscovery>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            nodes,
            discovery,
            metrics,
        }
    }

    /// Removes reclaimable threads and returns how many went away.
    pub fn detect(&self) -> usize {
        let live = match self.discovery.live_tids() {
            Ok(Some(live)) => live,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "listing live threads");
                return 0;
            }
        };

        let mut removed = 0;
        for thread in self.nodes.snapshot() {
            if live.contains(&thread.tid()) {
                continue;
            }
            if !thread.quiescent() {
                debug!(tid = thread.tid(), "exited thread still has pending data");
                continue;
            }
            if self.nodes.remove(thread.tid()) {
                debug!(tid = thread.tid(), thread = thread.name(), "released exited thread");
                removed += 1;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.threads_tracked.set(self.nodes.len() as f64);
        }

        removed
    }
}

impl ChainHandler for Detector {
    fn handle_request(&mut self, _option: u32) {
        self.detect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::sample_meta;
    use crate::node::NodeCells;

    struct Fixed(Option<Vec<u32>>);

    impl ThreadDiscovery for Fixed {
        fn live_tids(&self) -> Result<Option<HashSet<u32>>> {
            Ok(self.0.as_ref().map(|tids| tids.iter().copied().collect()))
        }
    }

    #[test]
    fn test_removes_only_quiescent_exited_threads() {
        let nodes = Arc::new(NodeManager::new(Arc::new(sample_meta())));
        nodes.thread_slots(1, "alive");
        nodes.thread_slots(2, "gone-clean");
        let busy = nodes.thread_slots(3, "gone-busy");
        let NodeCells::Utilization(slots) = busy.node(3).expect("util").cells() else {
            panic!("utilization cells");
        };
        slots[0].write(|d| d.access = true);

        let detector = Detector::new(Arc::clone(&nodes), Box::new(Fixed(Some(vec![1]))), None);
        assert_eq!(detector.detect(), 1);
        let mut tids = nodes.tids();
        tids.sort_unstable();
        assert_eq!(tids, vec![1, 3]);
    }

    #[test]
    fn test_unknown_liveness_keeps_everything() {
        let nodes = Arc::new(NodeManager::new(Arc::new(sample_meta())));
        nodes.thread_slots(9, "t");
        let detector = Detector::new(Arc::clone(&nodes), Box::new(Fixed(None)), None);
        assert_eq!(detector.detect(), 0);
        assert_eq!(nodes.len(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_discovery_sees_current_thread() {
        let live = ProcTaskDiscovery
            .live_tids()
            .expect("read /proc")
            .expect("linux reports liveness");
        assert!(live.contains(&crate::node::current_tid()));
    }
}
