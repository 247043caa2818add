//! Delivery of analysis snapshots.

pub mod health;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use tokio::sync::watch;

use self::health::HealthMetrics;
use crate::chain::ChainHandler;
use crate::process::snapshot::Snapshot;
use crate::process::Outbox;

/// Newest snapshot, readable from any thread.
pub type LatestSnapshot = Arc<ArcSwapOption<Snapshot>>;

/// Watch channel carrying every snapshot to subscribers.
pub type SnapshotSender = Arc<watch::Sender<Option<Arc<Snapshot>>>>;

/// Destination of a snapshot.
pub enum Exporter {
    /// Pretty JSON file, replaced atomically on every tick.
    File(PathBuf),
    Latest(LatestSnapshot),
    Channel(SnapshotSender),
}

impl Exporter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Latest(_) => "latest",
            Self::Channel(_) => "channel",
        }
    }

    pub fn export(&self, snapshot: &Arc<Snapshot>) -> Result<()> {
        match self {
            Self::File(path) => write_file(path, snapshot),
            Self::Latest(latest) => {
                latest.store(Some(Arc::clone(snapshot)));
                Ok(())
            }
            Self::Channel(tx) => {
                // Succeeds with or without subscribers.
                tx.send_replace(Some(Arc::clone(snapshot)));
                Ok(())
            }
        }
    }
}

/// Writes to a sibling temp file, then renames it over `path`.
fn write_file(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let body = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Stream stage: hands the snapshot of the last analysis tick to every
/// exporter. A failing exporter does not stop the others.
pub struct StreamStage {
    outbox: Outbox,
    exporters: Vec<Exporter>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl StreamStage {
    pub fn new(
        outbox: Outbox,
        exporters: Vec<Exporter>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            outbox,
            exporters,
            metrics,
        }
    }

    /// Exports the pending snapshot, if any. Returns the number of exporters
    /// that succeeded.
    pub fn flush(&self) -> usize {
        let Some(snapshot) = self.outbox.lock().take() else {
            return 0;
        };
        let snapshot = Arc::new(snapshot);

        let mut delivered = 0;
        for exporter in &self.exporters {
            match exporter.export(&snapshot) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(exporter = exporter.name(), error = %e, "exporting snapshot");
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .export_errors
                            .with_label_values(&[exporter.name()])
                            .inc();
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.snapshots_exported.inc();
        }
        delivered
    }
}

impl ChainHandler for StreamStage {
    fn handle_request(&mut self, _option: u32) {
        self.flush();
    }
}
