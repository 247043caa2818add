use std::sync::Arc;

use super::{Command, ControlMsg, NodeSelector};
use crate::error::ControlError;
use crate::meta::{GlobalMeta, NodeMeta};

/// Accepted streaming interval, in seconds.
pub const STREAMING_INTERVAL_RANGE: std::ops::RangeInclusive<u32> = 1..=30;

/// Validates control messages and applies engine-wide rules.
pub struct Ruler {
    node_meta: Arc<NodeMeta>,
    global: Arc<GlobalMeta>,
}

impl Ruler {
    pub fn new(node_meta: Arc<NodeMeta>, global: Arc<GlobalMeta>) -> Self {
        Self { node_meta, global }
    }

    /// Decodes `msg` and checks everything that does not depend on per-node
    /// state. Node ids are checked while the command is applied so that a
    /// range stops at its first bad node.
    pub fn check_rule(&self, msg: &ControlMsg) -> Result<Command, ControlError> {
        let command = Command::decode(msg)?;
        match command {
            Command::SetStreamingInterval(secs) if !STREAMING_INTERVAL_RANGE.contains(&secs) => {
                return Err(ControlError::InvalidInterval { secs });
            }
            Command::EnableNode { selector, .. }
            | Command::InitializeNode { selector }
            | Command::SetSamplingRate { selector, .. } => self.check_selector(selector)?,
            _ => {}
        }
        Ok(command)
    }

    fn check_selector(&self, selector: NodeSelector) -> Result<(), ControlError> {
        match selector {
            NodeSelector::Range { start, end } if start > end => {
                Err(ControlError::InvalidRange { start, end })
            }
            NodeSelector::Group(gid) if gid as usize >= self.node_meta.group_count() => {
                Err(ControlError::InvalidGroup { gid })
            }
            _ => Ok(()),
        }
    }

    /// Applies engine-wide commands. Returns false for commands that belong
    /// to the collection stage.
    pub fn set_rule(&self, command: &Command) -> bool {
        match *command {
            Command::EnableAir(play) => {
                self.global.set_air_play(play);
                tracing::info!(play, "air play switched");
                true
            }
            Command::SetStreamingInterval(secs) => {
                self.global.set_streaming_interval(secs);
                tracing::info!(secs, "streaming interval changed");
                true
            }
            _ => false,
        }
    }
}
