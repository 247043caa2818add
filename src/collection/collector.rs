use super::writer::Writer;
use crate::error::ControlError;
use crate::meta::NodeMetaData;
use crate::node::NodeSlots;

/// Accepted sampling rates: one sample per N calls.
pub const SAMPLING_RATE_RANGE: std::ops::RangeInclusive<u32> = 1..=10_000;

/// Pairs a node's writer with its sampling-rate control.
#[derive(Debug, Clone, Copy)]
pub struct Collector {
    writer: Writer,
}

impl Collector {
    pub fn new(node: &NodeMetaData) -> Self {
        Self {
            writer: Writer::for_type(node.ptype),
        }
    }

    pub fn writer(&self) -> Writer {
        self.writer
    }

    #[inline]
    pub fn log(
        &self,
        node: &NodeMetaData,
        slots: &NodeSlots,
        index: usize,
        filter: usize,
        value: u64,
    ) -> bool {
        self.writer
            .log(slots, index, filter, value, node.sample_ratio())
    }

    /// Changes the node's sampling rate. Writers pick it up on their next
    /// call and restart their sampling window.
    pub fn set_sampling_rate(&self, node: &NodeMetaData, rate: u32) -> Result<(), ControlError> {
        if !SAMPLING_RATE_RANGE.contains(&rate) {
            return Err(ControlError::SamplingRateOutOfRange { rate });
        }
        node.set_sample_ratio(rate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::sample_meta;

    #[test]
    fn test_sampling_rate_bounds() {
        let meta = sample_meta();
        let node = &meta.nodes()[2];
        let collector = Collector::new(node);
        assert_eq!(collector.writer(), Writer::Queue);

        for rate in [1, 10_000, 500] {
            collector.set_sampling_rate(node, rate).expect("in range");
            assert_eq!(node.sample_ratio(), rate);
        }
        for rate in [0, 10_001, u32::MAX] {
            assert_eq!(
                collector.set_sampling_rate(node, rate),
                Err(ControlError::SamplingRateOutOfRange { rate })
            );
            assert_eq!(node.sample_ratio(), 500);
        }
    }
}
