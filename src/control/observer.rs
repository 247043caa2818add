//! Subject/observer routing between control stages.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use super::ControlMsg;
use crate::error::ControlError;

/// Downstream stage a notice is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Route {
    Policy,
    Collection,
    Output,
}

impl Route {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Collection => "collection",
            Self::Output => "output",
        }
    }
}

/// A control message plus the result code accumulated so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notice {
    pub msg: ControlMsg,
    pub code: i32,
}

pub trait Observer: Send + Sync {
    fn update(&self, notice: Notice);
}

/// Observer that queues notices for a stage to drain on its next tick.
pub struct QueueObserver {
    tx: UnboundedSender<Notice>,
}

impl Observer for QueueObserver {
    fn update(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            tracing::warn!(type2 = notice.msg.type2, "control stage gone, dropping notice");
        }
    }
}

/// Receiving end of a [`QueueObserver`].
pub struct NoticeQueue {
    rx: Mutex<UnboundedReceiver<Notice>>,
}

impl NoticeQueue {
    /// Removes and returns everything queued so far.
    pub fn drain(&self) -> Vec<Notice> {
        let mut rx = self.rx.lock();
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(notice) => out.push(notice),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

/// Creates a connected observer and queue.
pub fn queue() -> (QueueObserver, NoticeQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueObserver { tx }, NoticeQueue { rx: Mutex::new(rx) })
}

/// Fan-out point holding one observer per route.
#[derive(Default)]
pub struct Subject {
    observers: BTreeMap<Route, Arc<dyn Observer>>,
}

impl Subject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, route: Route, observer: Arc<dyn Observer>) {
        self.observers.insert(route, observer);
    }

    pub fn notify(&self, route: Route, notice: Notice) -> Result<(), ControlError> {
        let observer = self.observers.get(&route).ok_or(ControlError::Detached {
            route: route.as_str(),
        })?;
        observer.update(notice);
        Ok(())
    }
}
