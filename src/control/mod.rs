//! Control plane: commands that enable nodes, reset accumulators and change
//! sampling rates or the streaming interval at runtime.
//!
//! Messages travel Input -> Policy -> Collection -> Output through
//! [`Subject`](observer::Subject) routes and are drained only by the
//! scheduler thread, never by the logging path.

pub mod observer;
pub mod ruler;
pub mod stages;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// `type2` command codes.
pub mod kind {
    pub const ENABLE_AIR: u32 = 0;
    pub const SET_STREAMING_INTERVAL: u32 = 1;
    pub const ENABLE_NODE: u32 = 2;
    pub const ENABLE_NODE_RANGE: u32 = 3;
    pub const ENABLE_NODE_GROUP: u32 = 4;
    pub const ENABLE_NODE_ALL: u32 = 5;
    pub const INIT_NODE: u32 = 6;
    pub const INIT_NODE_RANGE: u32 = 7;
    pub const INIT_NODE_GROUP: u32 = 8;
    pub const INIT_NODE_ALL: u32 = 9;
    pub const SET_SAMPLING_RATE: u32 = 10;
    pub const SET_SAMPLING_RATE_RANGE: u32 = 11;
    pub const SET_SAMPLING_RATE_GROUP: u32 = 12;
    pub const SET_SAMPLING_RATE_ALL: u32 = 13;
}

/// Raw control message as received from a command issuer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMsg {
    pub type1: u32,
    pub type2: u32,
    pub value1: u32,
    pub value2: u32,
    pub pid: u32,
    pub cmd_type: u32,
    pub cmd_order: u32,
}

impl ControlMsg {
    pub fn new(type2: u32, value1: u32, value2: u32) -> Self {
        Self {
            type2,
            value1,
            value2,
            ..Default::default()
        }
    }

    /// Tags the message with the issuer so the reply can be matched.
    pub fn with_origin(mut self, pid: u32, cmd_type: u32, cmd_order: u32) -> Self {
        self.pid = pid;
        self.cmd_type = cmd_type;
        self.cmd_order = cmd_order;
        self
    }

    pub fn reply(&self, code: i32) -> ControlReply {
        ControlReply {
            pid: self.pid,
            cmd_type: self.cmd_type,
            cmd_order: self.cmd_order,
            code,
        }
    }
}

/// Result of one control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub pid: u32,
    pub cmd_type: u32,
    pub cmd_order: u32,
    /// 0 on success, otherwise a negative [`ControlError::code`].
    pub code: i32,
}

/// Packs an inclusive node id range into a selector value.
pub const fn pack_range(start: u16, end: u16) -> u32 {
    ((start as u32) << 16) | end as u32
}

/// Nodes a command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelector {
    Node(u32),
    /// Inclusive on both ends.
    Range { start: u32, end: u32 },
    Group(u32),
    All,
}

impl NodeSelector {
    /// `form` is 0 node, 1 range, 2 group, 3 all.
    fn decode(form: u32, value: u32) -> Self {
        match form {
            0 => Self::Node(value),
            1 => Self::Range {
                start: value >> 16,
                end: value & 0xffff,
            },
            2 => Self::Group(value),
            _ => Self::All,
        }
    }
}

/// Decoded control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EnableAir(bool),
    SetStreamingInterval(u32),
    EnableNode { selector: NodeSelector, on: bool },
    InitializeNode { selector: NodeSelector },
    SetSamplingRate { selector: NodeSelector, rate: u32 },
}

impl Command {
    /// Decodes `type2` and the packed values without range checks.
    pub fn decode(msg: &ControlMsg) -> Result<Self, ControlError> {
        let switch = |value: u32| match value {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ControlError::InvalidSwitch { value }),
        };

        match msg.type2 {
            kind::ENABLE_AIR => Ok(Self::EnableAir(switch(msg.value1)?)),
            kind::SET_STREAMING_INTERVAL => Ok(Self::SetStreamingInterval(msg.value1)),
            kind::ENABLE_NODE..=kind::ENABLE_NODE_ALL => Ok(Self::EnableNode {
                selector: NodeSelector::decode(msg.type2 - kind::ENABLE_NODE, msg.value2),
                on: switch(msg.value1)?,
            }),
            kind::INIT_NODE..=kind::INIT_NODE_ALL => Ok(Self::InitializeNode {
                selector: NodeSelector::decode(msg.type2 - kind::INIT_NODE, msg.value2),
            }),
            kind::SET_SAMPLING_RATE..=kind::SET_SAMPLING_RATE_ALL => Ok(Self::SetSamplingRate {
                selector: NodeSelector::decode(msg.type2 - kind::SET_SAMPLING_RATE, msg.value2),
                rate: msg.value1,
            }),
            type2 => Err(ControlError::UnknownCommand { type2 }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::EnableAir(_) => "enable_air",
            Self::SetStreamingInterval(_) => "set_streaming_interval",
            Self::EnableNode { .. } => "enable_node",
            Self::InitializeNode { .. } => "initialize_node",
            Self::SetSamplingRate { .. } => "set_sampling_rate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_selectors() {
        let msg = ControlMsg::new(kind::ENABLE_NODE_RANGE, 1, pack_range(2, 5));
        assert_eq!(
            Command::decode(&msg),
            Ok(Command::EnableNode {
                selector: NodeSelector::Range { start: 2, end: 5 },
                on: true,
            })
        );

        let msg = ControlMsg::new(kind::INIT_NODE_GROUP, 0, 3);
        assert_eq!(
            Command::decode(&msg),
            Ok(Command::InitializeNode {
                selector: NodeSelector::Group(3)
            })
        );

        let msg = ControlMsg::new(kind::SET_SAMPLING_RATE_ALL, 50, 0);
        assert_eq!(
            Command::decode(&msg),
            Ok(Command::SetSamplingRate {
                selector: NodeSelector::All,
                rate: 50,
            })
        );
    }

    #[test]
    fn test_decode_errors() {
        let unknown = ControlMsg::new(14, 0, 0);
        assert_eq!(
            Command::decode(&unknown),
            Err(ControlError::UnknownCommand { type2: 14 })
        );
        let bad_switch = ControlMsg::new(kind::ENABLE_AIR, 2, 0);
        assert_eq!(
            Command::decode(&bad_switch).map_err(|e| e.code()),
            Err(-1)
        );
    }

    #[test]
    fn test_reply_carries_origin() {
        let msg = ControlMsg::new(kind::ENABLE_AIR, 1, 0).with_origin(4242, 7, 3);
        assert_eq!(
            msg.reply(-2),
            ControlReply {
                pid: 4242,
                cmd_type: 7,
                cmd_order: 3,
                code: -2,
            }
        );
    }

    #[test]
    fn test_pack_range() {
        assert_eq!(pack_range(1, 2), 0x0001_0002);
        assert_eq!(pack_range(u16::MAX, 0), 0xffff_0000);
    }
}
