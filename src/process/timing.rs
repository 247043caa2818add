use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::aid_groups;
use crate::meta::NodeMeta;
use crate::metric::ProcessorType;
use crate::node::{NodeCells, ThreadSlots};

/// Scheduler ticks per second.
const TICKS_PER_SEC: u32 = 100;

/// Spreads latency window openings over the next period.
///
/// Every app id of a latency node gets one random deadline, shared by all
/// of its closed windows in every thread, so the stages of one request open
/// together.
pub struct TimingDistributor {
    meta: Arc<NodeMeta>,
    rng: StdRng,
}

impl TimingDistributor {
    pub fn new(meta: Arc<NodeMeta>) -> Self {
        Self {
            meta,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(meta: Arc<NodeMeta>, seed: u64) -> Self {
        Self {
            meta,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws new deadlines in `[1, interval_secs * 100]` ticks. Returns the
    /// number of windows that got one.
    pub fn distribute(&mut self, threads: &[Arc<ThreadSlots>], interval_secs: u32) -> usize {
        let max_ticks = interval_secs.max(1).saturating_mul(TICKS_PER_SEC);
        let max_ticks = i32::try_from(max_ticks).unwrap_or(i32::MAX);
        let mut assigned = 0;

        for node in self.meta.nodes() {
            if !node.build || node.ptype != ProcessorType::Latency {
                continue;
            }
            for (_, members) in aid_groups(threads, node.nid as usize) {
                let deadline = self.rng.gen_range(1..=max_ticks);
                for (slots, index) in members {
                    let NodeCells::Latency(cells) = slots.cells() else {
                        continue;
                    };
                    for filter in 0..slots.filter_size() {
                        let cell = &cells[slots.cell_index(index, filter)];
                        for window in [&cell.start, &cell.end] {
                            if !window.is_open() {
                                window.set_deadline(deadline);
                                assigned += 1;
                            }
                        }
                    }
                }
            }
        }
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::sample_meta;
    use crate::node::NodeManager;

    #[test]
    fn test_same_app_id_shares_deadline_across_threads() {
        let meta = Arc::new(sample_meta());
        let nodes = NodeManager::new(Arc::clone(&meta));
        let a = nodes.thread_slots(1, "a");
        let b = nodes.thread_slots(2, "b");
        let ia = a.node(1).expect("latency").aids.insert(9).expect("aid");
        let ib = b.node(1).expect("latency").aids.insert(9).expect("aid");
        b.node(1).expect("latency").aids.insert(10).expect("aid");

        let mut timing = TimingDistributor::with_seed(Arc::clone(&meta), 7);
        // Two app ids: 9 spans both threads, 10 only thread b. Three cells
        // per app id, two windows each.
        assert_eq!(timing.distribute(&nodes.snapshot(), 2), 18);

        let deadline = |thread: &ThreadSlots, index: usize, filter: usize| {
            let slots = thread.node(1).expect("latency");
            let NodeCells::Latency(cells) = slots.cells() else {
                panic!("latency cells");
            };
            let cell = &cells[slots.cell_index(index, filter)];
            (cell.start.deadline(), cell.end.deadline())
        };
        let (d, e) = deadline(&a, ia, 0);
        assert_eq!(d, e);
        assert!((1..=200).contains(&d));
        assert_eq!(deadline(&b, ib, 2), (d, d));
    }

    #[test]
    fn test_open_windows_keep_their_deadline() {
        let meta = Arc::new(sample_meta());
        let nodes = NodeManager::new(Arc::clone(&meta));
        let thread = nodes.thread_slots(1, "a");
        let slots = thread.node(1).expect("latency");
        let index = slots.aids.insert(3).expect("aid");
        let NodeCells::Latency(cells) = slots.cells() else {
            panic!("latency cells");
        };
        let running = &cells[slots.cell_index(index, 0)].start;
        running.claim().expect("claim").open(4);
        running.set_deadline(-3);

        let mut timing = TimingDistributor::with_seed(meta, 1);
        assert_eq!(timing.distribute(&nodes.snapshot(), 1), 5);
        assert_eq!(running.deadline(), -3);
    }
}
