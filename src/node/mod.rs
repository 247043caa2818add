//! Per-thread metric storage.
//!
//! Every OS thread that logs gets one [`ThreadSlots`]: for each built node an
//! app-id [`IndexMap`] and a dense array of cells addressed by
//! `(app index, filter)`. Cells are created up front so the logging path
//! never allocates after the first call on a thread.

pub mod detector;
pub mod index_map;
pub mod latency;
pub mod slot;

use std::sync::Arc;

use dashmap::DashMap;

use crate::collection::writer::Sampler;
use crate::meta::{NodeMeta, NodeMetaData};
use crate::metric::{
    AccCountData, AccPerformanceData, AccQueueData, AccUtilizationData, CountData,
    PerformanceData, ProcessorType, QueueData, UtilizationData,
};

pub use self::index_map::IndexMap;
pub use self::latency::{LatencyCell, LatencyEvent, LatencyWindow, WindowState};
pub use self::slot::{MetricSlot, SlotData, SlotReader};

pub type PerformanceSlot = MetricSlot<PerformanceData, AccPerformanceData>;
pub type QueueSlot = MetricSlot<QueueData, AccQueueData>;
pub type UtilizationSlot = MetricSlot<UtilizationData, AccUtilizationData>;
pub type CountSlot = MetricSlot<CountData, AccCountData>;

/// Queue cell: the sampling state lives beside the double buffer because it
/// belongs to the writer, not to a period.
#[derive(Default)]
pub struct QueueCell {
    pub slot: QueueSlot,
    pub sampler: Sampler,
}

/// Cell storage of one node, one variant per processor type.
pub enum NodeCells {
    Performance(Box<[PerformanceSlot]>),
    Latency(Box<[LatencyCell]>),
    Queue(Box<[QueueCell]>),
    Utilization(Box<[UtilizationSlot]>),
    Count(Box<[CountSlot]>),
}

fn cells<T: Default>(len: usize) -> Box<[T]> {
    (0..len).map(|_| T::default()).collect()
}

impl NodeCells {
    fn new(ptype: ProcessorType, len: usize) -> Self {
        match ptype {
            ProcessorType::Performance => Self::Performance(cells(len)),
            ProcessorType::Latency => Self::Latency(cells(len)),
            ProcessorType::Queue => Self::Queue(cells(len)),
            ProcessorType::Utilization => Self::Utilization(cells(len)),
            ProcessorType::Count => Self::Count(cells(len)),
        }
    }

    pub fn processor_type(&self) -> ProcessorType {
        match self {
            Self::Performance(_) => ProcessorType::Performance,
            Self::Latency(_) => ProcessorType::Latency,
            Self::Queue(_) => ProcessorType::Queue,
            Self::Utilization(_) => ProcessorType::Utilization,
            Self::Count(_) => ProcessorType::Count,
        }
    }
}

/// Slots of one node inside one thread.
pub struct NodeSlots {
    pub aids: IndexMap,
    filter_size: usize,
    cells: NodeCells,
}

impl NodeSlots {
    pub fn new(ptype: ProcessorType, index_size: usize, filter_size: usize) -> Self {
        let index_size = index_size.max(1);
        let filter_size = filter_size.max(1);
        Self {
            aids: IndexMap::new(index_size),
            filter_size,
            cells: NodeCells::new(ptype, index_size * filter_size),
        }
    }

    pub fn filter_size(&self) -> usize {
        self.filter_size
    }

    /// Flat position of `(index, filter)` in the cell array.
    #[inline]
    pub fn cell_index(&self, index: usize, filter: usize) -> usize {
        index * self.filter_size + filter
    }

    pub fn cells(&self) -> &NodeCells {
        &self.cells
    }

    /// True when no cell holds unconsumed data, an open latency window or
    /// unmatched latency events.
    pub fn quiescent(&self) -> bool {
        fn idle<D: SlotData, A: Default + Send>(slot: &MetricSlot<D, A>) -> bool {
            // A held reader means the scheduler is mid-read; treat as busy.
            slot.reader().is_some_and(|mut reader| !reader.pending())
        }

        match &self.cells {
            NodeCells::Performance(slots) => slots.iter().all(idle),
            NodeCells::Latency(cells) => cells.iter().all(LatencyCell::drained),
            NodeCells::Queue(cells) => cells.iter().all(|cell| idle(&cell.slot)),
            NodeCells::Utilization(slots) => slots.iter().all(idle),
            NodeCells::Count(slots) => slots.iter().all(idle),
        }
    }
}

/// Every node's slots for one OS thread.
pub struct ThreadSlots {
    tid: u32,
    name: String,
    nodes: Box<[Option<NodeSlots>]>,
}

impl ThreadSlots {
    pub fn new(tid: u32, name: impl Into<String>, meta: &NodeMeta) -> Self {
        let nodes = meta
            .nodes()
            .iter()
            .map(|node: &NodeMetaData| {
                node.build
                    .then(|| NodeSlots::new(node.ptype, node.index_size, node.filter_size))
            })
            .collect();

        Self {
            tid,
            name: name.into(),
            nodes,
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slots of node `nid`, if that node is built.
    #[inline]
    pub fn node(&self, nid: usize) -> Option<&NodeSlots> {
        self.nodes.get(nid)?.as_ref()
    }

    pub fn quiescent(&self) -> bool {
        self.nodes.iter().flatten().all(NodeSlots::quiescent)
    }
}

/// Registry of live thread slot sets, keyed by OS thread id.
pub struct NodeManager {
    meta: Arc<NodeMeta>,
    threads: DashMap<u32, Arc<ThreadSlots>>,
}

impl NodeManager {
    pub fn new(meta: Arc<NodeMeta>) -> Self {
        Self {
            meta,
            threads: DashMap::new(),
        }
    }

    /// Returns the slot set of `tid`, creating it on first use.
    pub fn thread_slots(&self, tid: u32, name: &str) -> Arc<ThreadSlots> {
        if let Some(existing) = self.threads.get(&tid) {
            return Arc::clone(existing.value());
        }

        let entry = self.threads.entry(tid).or_insert_with(|| {
            tracing::debug!(tid, thread = name, "tracking new thread");
            Arc::new(ThreadSlots::new(tid, name, &self.meta))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, tid: u32) -> Option<Arc<ThreadSlots>> {
        self.threads.get(&tid).map(|entry| Arc::clone(entry.value()))
    }

    /// Visits every tracked thread. Holds shard read locks while visiting, so
    /// `f` must not register threads.
    pub fn for_each(&self, mut f: impl FnMut(&ThreadSlots)) {
        for entry in self.threads.iter() {
            f(entry.value());
        }
    }

    /// Tracked threads ordered by tid.
    pub fn snapshot(&self) -> Vec<Arc<ThreadSlots>> {
        let mut threads: Vec<_> = self
            .threads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        threads.sort_by_key(|thread| thread.tid());
        threads
    }

    pub fn remove(&self, tid: u32) -> bool {
        self.threads.remove(&tid).is_some()
    }

    pub fn tids(&self) -> Vec<u32> {
        self.threads.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn meta(&self) -> &Arc<NodeMeta> {
        &self.meta
    }
}

/// Returns current monotonic clock value in nanoseconds.
#[inline]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and only
    // needs a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}

/// Kernel thread id of the caller.
#[cfg(target_os = "linux")]
pub fn current_tid() -> u32 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Process-unique thread number where no kernel thread id is exposed.
#[cfg(not(target_os = "linux"))]
pub fn current_tid() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static TID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|tid| *tid)
}
