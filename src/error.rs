use thiserror::Error;

/// Control-plane failures. Each variant maps to the negative result code
/// replied to the command issuer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown control command {type2}")]
    UnknownCommand { type2: u32 },

    #[error("invalid on/off value {value}")]
    InvalidSwitch { value: u32 },

    #[error("sampling rate {rate} outside [1, 10000]")]
    SamplingRateOutOfRange { rate: u32 },

    #[error("node id {nid} out of range")]
    InvalidNode { nid: u32 },

    #[error("node range {start}..={end} is invalid")]
    InvalidRange { start: u32, end: u32 },

    #[error("group id {gid} out of range")]
    InvalidGroup { gid: u32 },

    #[error("streaming interval {secs}s outside 1..=30")]
    InvalidInterval { secs: u32 },

    #[error("no observer attached for route {route}")]
    Detached { route: &'static str },
}

impl ControlError {
    /// Result code reported to the control-plane caller.
    pub const fn code(&self) -> i32 {
        match self {
            Self::UnknownCommand { .. } | Self::InvalidSwitch { .. } | Self::Detached { .. } => -1,
            Self::SamplingRateOutOfRange { .. } => -2,
            Self::InvalidNode { .. } | Self::InvalidRange { .. } | Self::InvalidGroup { .. } => -11,
            Self::InvalidInterval { .. } => -12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ControlError::UnknownCommand { type2: 99 }.code(), -1);
        assert_eq!(ControlError::InvalidSwitch { value: 2 }.code(), -1);
        assert_eq!(ControlError::SamplingRateOutOfRange { rate: 0 }.code(), -2);
        assert_eq!(ControlError::InvalidNode { nid: 7 }.code(), -11);
        assert_eq!(ControlError::InvalidRange { start: 3, end: 1 }.code(), -11);
        assert_eq!(ControlError::InvalidGroup { gid: 4 }.code(), -11);
        assert_eq!(ControlError::InvalidInterval { secs: 31 }.code(), -12);
    }

    #[test]
    fn test_display() {
        let err = ControlError::SamplingRateOutOfRange { rate: 10_001 };
        assert_eq!(err.to_string(), "sampling rate 10001 outside [1, 10000]");
    }
}
