//! Input, policy and output stages of the control chain. The collection
//! stage lives next to the collection manager it drives.

use std::sync::Arc;

use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::observer::{Notice, NoticeQueue, Route, Subject};
use super::ruler::Ruler;
use super::{ControlMsg, ControlReply};
use crate::chain::ChainHandler;
use crate::export::health::HealthMetrics;

fn forward(subject: &Subject, route: Route, notice: Notice) {
    if let Err(e) = subject.notify(route, notice) {
        warn!(route = route.as_str(), error = %e, "forwarding control message");
    }
}

/// Drains messages sent through [`Air::send`](crate::engine::Air::send).
pub struct InputStage {
    rx: UnboundedReceiver<ControlMsg>,
    subject: Arc<Subject>,
}

impl InputStage {
    pub fn new(rx: UnboundedReceiver<ControlMsg>, subject: Arc<Subject>) -> Self {
        Self { rx, subject }
    }

    pub fn poll(&mut self) -> usize {
        let mut received = 0;
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    received += 1;
                    forward(&self.subject, Route::Policy, Notice { msg, code: 0 });
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        received
    }
}

impl ChainHandler for InputStage {
    fn handle_request(&mut self, _option: u32) {
        self.poll();
    }
}

/// Validates messages and applies engine-wide rules. Node commands move on
/// to the collection stage; everything else is answered directly.
pub struct PolicyStage {
    ruler: Ruler,
    inbox: NoticeQueue,
    subject: Arc<Subject>,
}

impl PolicyStage {
    pub fn new(ruler: Ruler, inbox: NoticeQueue, subject: Arc<Subject>) -> Self {
        Self {
            ruler,
            inbox,
            subject,
        }
    }

    pub fn handle_msg(&self) {
        for notice in self.inbox.drain() {
            let (route, code) = match self.ruler.check_rule(&notice.msg) {
                Err(e) => {
                    debug!(type2 = notice.msg.type2, error = %e, "control message rejected");
                    (Route::Output, e.code())
                }
                Ok(command) if self.ruler.set_rule(&command) => (Route::Output, 0),
                Ok(_) => (Route::Collection, 0),
            };
            forward(
                &self.subject,
                route,
                Notice {
                    msg: notice.msg,
                    code,
                },
            );
        }
    }
}

impl ChainHandler for PolicyStage {
    fn handle_request(&mut self, _option: u32) {
        self.handle_msg();
    }
}

/// Replies to the issuer of each message with its result code.
pub struct OutputStage {
    inbox: NoticeQueue,
    replies: UnboundedSender<ControlReply>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl OutputStage {
    pub fn new(
        inbox: NoticeQueue,
        replies: UnboundedSender<ControlReply>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            inbox,
            replies,
            metrics,
        }
    }

    pub fn handle_msg(&self) {
        for notice in self.inbox.drain() {
            if let Some(metrics) = &self.metrics {
                let result = if notice.code == 0 { "ok" } else { "error" };
                metrics.control_commands.with_label_values(&[result]).inc();
            }
            if self.replies.send(notice.msg.reply(notice.code)).is_err() {
                debug!(pid = notice.msg.pid, "reply receiver gone");
            }
        }
    }
}

impl ChainHandler for OutputStage {
    fn handle_request(&mut self, _option: u32) {
        self.handle_msg();
    }
}
