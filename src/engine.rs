//! The `Air` engine: wiring of collection, control, processing and export
//! around one scheduler.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::info;

use crate::chain::scheduler::Scheduler;
use crate::chain::{ChainManager, Fired, HandlerKind};
use crate::collection::switch_gear::SwitchGear;
use crate::collection::{CollectionManager, CollectionStage};
use crate::config::Config;
use crate::control::observer::{queue, Route, Subject};
use crate::control::ruler::Ruler;
use crate::control::stages::{InputStage, OutputStage, PolicyStage};
use crate::control::{ControlMsg, ControlReply};
use crate::export::health::HealthMetrics;
use crate::export::{Exporter, LatestSnapshot, SnapshotSender, StreamStage};
use crate::meta::{GlobalMeta, NodeMeta};
use crate::node::detector::{Detector, ProcTaskDiscovery};
use crate::node::{current_tid, NodeManager, ThreadSlots};
use crate::process::latency::LatencyAccTable;
use crate::process::preprocessor::Preprocessor;
use crate::process::snapshot::Snapshot;
use crate::process::timing::TimingDistributor;
use crate::process::ProcessManager;

/// In-process telemetry engine.
///
/// Application threads log through a [`ThreadLogger`]; everything else runs
/// on the scheduler thread started by [`start`](Self::start), or one tick at
/// a time through [`run_once`](Self::run_once).
pub struct Air {
    node_meta: Arc<NodeMeta>,
    global: Arc<GlobalMeta>,
    nodes: Arc<NodeManager>,
    collection: Arc<CollectionManager>,
    control: UnboundedSender<ControlMsg>,
    replies: Mutex<UnboundedReceiver<ControlReply>>,
    latest: LatestSnapshot,
    snapshots: SnapshotSender,
    chains: Mutex<Option<ChainManager>>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Air {
    /// Builds every stage from a validated configuration. Nothing runs until
    /// [`start`](Self::start) or [`run_once`](Self::run_once).
    pub fn new(cfg: &Config, metrics: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let node_meta = Arc::new(NodeMeta::from_config(cfg).context("building node table")?);
        let global = Arc::new(GlobalMeta::from_config(cfg));
        let nodes = Arc::new(NodeManager::new(Arc::clone(&node_meta)));
        let latency = LatencyAccTable::shared(&node_meta);
        let collection = Arc::new(CollectionManager::new(
            Arc::clone(&node_meta),
            Arc::clone(&global),
            Arc::clone(&nodes),
            Arc::clone(&latency),
        ));

        let (policy_observer, policy_inbox) = queue();
        let (collection_observer, collection_inbox) = queue();
        let (output_observer, output_inbox) = queue();
        let mut subject = Subject::new();
        subject.attach(Route::Policy, Arc::new(policy_observer));
        subject.attach(Route::Collection, Arc::new(collection_observer));
        subject.attach(Route::Output, Arc::new(output_observer));
        let subject = Arc::new(subject);

        let (control, control_rx) = mpsc::unbounded_channel();
        let (reply_tx, replies) = mpsc::unbounded_channel();

        let latest: LatestSnapshot = Arc::new(ArcSwapOption::empty());
        let (snapshot_tx, _) = watch::channel(None);
        let snapshots: SnapshotSender = Arc::new(snapshot_tx);

        let process = ProcessManager::new(
            Arc::clone(&node_meta),
            Arc::clone(&global),
            Arc::clone(&nodes),
            Arc::clone(&latency),
            TimingDistributor::new(Arc::clone(&node_meta)),
        );
        let mut exporters = Vec::new();
        if let Some(path) = &cfg.output.file {
            exporters.push(Exporter::File(path.clone()));
        }
        exporters.push(Exporter::Latest(Arc::clone(&latest)));
        exporters.push(Exporter::Channel(Arc::clone(&snapshots)));
        let stream = StreamStage::new(process.outbox(), exporters, metrics.clone());

        let mut chains = ChainManager::new(Arc::clone(&global), metrics.clone());
        chains.register(
            HandlerKind::SwitchGear,
            Box::new(SwitchGear::new(
                Arc::clone(&node_meta),
                Arc::clone(&global),
                Arc::clone(&nodes),
            )),
        );
        chains.register(
            HandlerKind::Preprocess,
            Box::new(Preprocessor::new(
                Arc::clone(&node_meta),
                Arc::clone(&nodes),
                Arc::clone(&latency),
                metrics.clone(),
            )),
        );
        chains.register(
            HandlerKind::Input,
            Box::new(InputStage::new(control_rx, Arc::clone(&subject))),
        );
        chains.register(
            HandlerKind::Policy,
            Box::new(PolicyStage::new(
                Ruler::new(Arc::clone(&node_meta), Arc::clone(&global)),
                policy_inbox,
                Arc::clone(&subject),
            )),
        );
        chains.register(
            HandlerKind::Collection,
            Box::new(CollectionStage::new(
                Arc::clone(&collection),
                collection_inbox,
                Arc::clone(&subject),
                metrics.clone(),
            )),
        );
        chains.register(
            HandlerKind::Output,
            Box::new(OutputStage::new(output_inbox, reply_tx, metrics.clone())),
        );
        chains.register(HandlerKind::Process, Box::new(process));
        chains.register(HandlerKind::Stream, Box::new(stream));
        chains.register(
            HandlerKind::Detect,
            Box::new(Detector::new(
                Arc::clone(&nodes),
                Box::new(ProcTaskDiscovery),
                metrics,
            )),
        );

        info!(
            nodes = node_meta.node_count(),
            groups = node_meta.group_count(),
            air_build = global.air_build(),
            "air engine initialized"
        );

        Ok(Self {
            node_meta,
            global,
            nodes,
            collection,
            control,
            replies: Mutex::new(replies),
            latest,
            snapshots,
            chains: Mutex::new(Some(chains)),
            scheduler: Mutex::new(None),
        })
    }

    /// Starts the scheduler thread.
    pub fn start(&self) -> Result<()> {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            bail!("scheduler already running");
        }
        let chains = self
            .chains
            .lock()
            .take()
            .context("chain manager unavailable")?;
        *scheduler = Some(Scheduler::spawn(chains)?);
        info!("air scheduler started");
        Ok(())
    }

    /// Stops the scheduler thread after its current tick. The engine can be
    /// started again or driven by [`run_once`](Self::run_once) afterwards.
    pub fn stop(&self) -> Result<()> {
        let Some(scheduler) = self.scheduler.lock().take() else {
            return Ok(());
        };
        let chains = scheduler.stop()?;
        *self.chains.lock() = Some(chains);
        info!("air scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    /// Runs one scheduler tick on the calling thread.
    pub fn run_once(&self, delayed: u32) -> Result<Fired> {
        let mut chains = self.chains.lock();
        let Some(chains) = chains.as_mut() else {
            bail!("scheduler thread is running");
        };
        Ok(chains.run_thread(delayed))
    }

    /// Logging handle of the calling thread. Creates the thread's slots on
    /// first use.
    pub fn logger(&self) -> ThreadLogger<'_> {
        let current = std::thread::current();
        let slots = self
            .nodes
            .thread_slots(current_tid(), current.name().unwrap_or("unnamed"));
        ThreadLogger {
            collection: &self.collection,
            slots,
            _not_send: PhantomData,
        }
    }

    pub fn node_id(&self, name: &str) -> Option<u32> {
        self.node_meta.node_id(name)
    }

    pub fn filter_index(&self, nid: u32, item: &str) -> Option<u32> {
        self.node_meta.filter_index(nid, item)
    }

    pub fn node_meta(&self) -> &Arc<NodeMeta> {
        &self.node_meta
    }

    pub fn global(&self) -> &Arc<GlobalMeta> {
        &self.global
    }

    /// Queues a control message. It is applied on the next control tick and
    /// answered through [`take_replies`](Self::take_replies).
    pub fn send(&self, msg: ControlMsg) -> Result<()> {
        self.control
            .send(msg)
            .map_err(|_| anyhow::anyhow!("control input stage is gone"))
    }

    /// Replies produced since the last call.
    pub fn take_replies(&self) -> Vec<ControlReply> {
        let mut replies = self.replies.lock();
        std::iter::from_fn(|| replies.try_recv().ok()).collect()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.latest.load_full()
    }

    /// Shared handle to the newest snapshot, for the health server.
    pub fn latest_handle(&self) -> LatestSnapshot {
        Arc::clone(&self.latest)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshots.subscribe()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.collection.dropped_samples()
    }

    /// Threads that currently own slots.
    pub fn thread_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Drop for Air {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "stopping air scheduler");
        }
    }
}

/// Per-thread logging handle. Bound to the thread that created it.
pub struct ThreadLogger<'a> {
    collection: &'a CollectionManager,
    slots: Arc<ThreadSlots>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadLogger<'_> {
    /// Records `value` for app id `aid` under filter item `filter` of node
    /// `nid`. Never blocks and never allocates; returns false when the
    /// sample was not recorded.
    #[inline]
    pub fn log(&self, nid: u32, filter: u32, aid: u64, value: u64) -> bool {
        self.collection.log_data(&self.slots, nid, aid, filter, value)
    }

    pub fn tid(&self) -> u32 {
        self.slots.tid()
    }
}
