use std::sync::Arc;

use crate::chain::ChainHandler;
use crate::meta::{GlobalMeta, GlobalMetaGetter, NodeMeta};
use crate::metric::ProcessorType;
use crate::node::latency::{LatencyWindow, LATENCY_WINDOW_SIZE};
use crate::node::{NodeCells, NodeManager};

/// Ticks past its deadline after which a running window is abandoned.
pub const ABANDON_BELOW: i32 = -45;

/// Opens and closes latency windows as their deadlines run out.
pub struct SwitchGear {
    meta: Arc<NodeMeta>,
    global: Arc<GlobalMeta>,
    nodes: Arc<NodeManager>,
    window_size: u32,
    /// Running latency node ids, refilled every tick.
    latency_nodes: Vec<usize>,
}

/// What one tick did to the windows it visited.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GearStats {
    pub opened: usize,
    pub stopped: usize,
}

impl SwitchGear {
    pub fn new(meta: Arc<NodeMeta>, global: Arc<GlobalMeta>, nodes: Arc<NodeManager>) -> Self {
        let latency_nodes = Vec::with_capacity(meta.node_count());
        Self {
            meta,
            global,
            nodes,
            window_size: LATENCY_WINDOW_SIZE,
            latency_nodes,
        }
    }

    pub fn run(&mut self) -> GearStats {
        let mut stats = GearStats::default();
        if !self.global.air_play() {
            return stats;
        }

        self.latency_nodes.clear();
        self.latency_nodes.extend(
            self.meta
                .nodes()
                .iter()
                .filter(|node| node.build && node.run() && node.ptype == ProcessorType::Latency)
                .map(|node| node.nid as usize),
        );
        if self.latency_nodes.is_empty() {
            return stats;
        }

        let latency_nodes = &self.latency_nodes;
        self.nodes.for_each(|thread| {
            for &nid in latency_nodes {
                let Some(slots) = thread.node(nid) else {
                    continue;
                };
                let NodeCells::Latency(cells) = slots.cells() else {
                    continue;
                };
                for cell in cells.iter() {
                    step(&cell.start, self.window_size, &mut stats);
                    step(&cell.end, self.window_size, &mut stats);
                }
            }
        });
        stats
    }
}

fn step(window: &LatencyWindow, window_size: u32, stats: &mut GearStats) {
    let deadline = window.tick_deadline();
    if deadline < ABANDON_BELOW {
        if window.abandon() {
            stats.stopped += 1;
        }
    } else if deadline == 0 {
        if let Some(guard) = window.claim() {
            guard.open(window_size);
            stats.opened += 1;
        }
    }
}

impl ChainHandler for SwitchGear {
    fn handle_request(&mut self, _option: u32) {
        let stats = self.run();
        if stats.opened + stats.stopped > 0 {
            tracing::trace!(
                opened = stats.opened,
                stopped = stats.stopped,
                "latency windows switched"
            );
        }
    }
}
