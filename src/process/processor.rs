//! Per-type period statistics and their lifetime merge.
//!
//! Every function first honours a pending `need_erase`, then returns the
//! exported object only when the period saw at least one write.

use super::latency::AccLatencySeqData;
use super::snapshot::{CountObj, LatencyObj, ObjFields, PerformanceObj, QueueObj, UtilizationObj};
use crate::metric::{
    AccCountData, AccPerformanceData, AccQueueData, AccUtilizationData, CountData,
    PerformanceData, ProcessorType, QueueData, UtilizationData,
};
use crate::node::{MetricSlot, NodeCells, NodeSlots, SlotData};

/// Aggregation strategy of a node, chosen by its processor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Performance,
    Latency,
    Queue,
    Utilization,
    Count,
}

impl Processor {
    pub fn for_type(ptype: ProcessorType) -> Self {
        match ptype {
            ProcessorType::Performance => Self::Performance,
            ProcessorType::Latency => Self::Latency,
            ProcessorType::Queue => Self::Queue,
            ProcessorType::Utilization => Self::Utilization,
            ProcessorType::Count => Self::Count,
        }
    }

    /// Aggregates the closed period of every cell, resets it and swaps the
    /// buffers. `emit` receives `(app index, filter, object)` for each cell
    /// that was written. Latency cells are drained by the preprocessor
    /// instead and are skipped here.
    ///
    /// A cell whose reader is held elsewhere is left for the next tick.
    pub fn stream(
        self,
        slots: &NodeSlots,
        time: u32,
        mut emit: impl FnMut(usize, usize, ObjFields),
    ) {
        let time = u64::from(time.max(1));
        let filter_size = slots.filter_size();
        let mut emit_at = |pos: usize, fields| emit(pos / filter_size, pos % filter_size, fields);

        match (self, slots.cells()) {
            (Self::Performance, NodeCells::Performance(cells)) => {
                for (pos, slot) in cells.iter().enumerate() {
                    if let Some(obj) = stream_slot(slot, |d, a| performance(d, a, time)) {
                        emit_at(pos, ObjFields::Performance(obj));
                    }
                }
            }
            (Self::Queue, NodeCells::Queue(cells)) => {
                for (pos, cell) in cells.iter().enumerate() {
                    if let Some(obj) = stream_slot(&cell.slot, |d, a| queue(d, a, time)) {
                        emit_at(pos, ObjFields::Queue(obj));
                    }
                }
            }
            (Self::Utilization, NodeCells::Utilization(cells)) => {
                for (pos, slot) in cells.iter().enumerate() {
                    if let Some(obj) = stream_slot(slot, utilization) {
                        emit_at(pos, ObjFields::Utilization(obj));
                    }
                }
            }
            (Self::Count, NodeCells::Count(cells)) => {
                for (pos, slot) in cells.iter().enumerate() {
                    if let Some(obj) = stream_slot(slot, count) {
                        emit_at(pos, ObjFields::Count(obj));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Reads the air side, clears it for reuse and flips the buffers.
fn stream_slot<D, A, O>(
    slot: &MetricSlot<D, A>,
    aggregate: impl FnOnce(&D, &mut A) -> Option<O>,
) -> Option<O>
where
    D: SlotData,
    A: Default + Send,
{
    let mut reader = slot.reader()?;
    let (air, acc) = reader.parts();
    let obj = aggregate(&*air, acc);
    *air = D::default();
    reader.swap();
    obj
}

fn per_second(value: u64, time: u64) -> u64 {
    if time > 1 {
        value / time
    } else {
        value
    }
}

/// Time-weighted running mean over `time_spent + time` seconds.
fn time_weighted(avg: f64, time_spent: u64, period: f64, time: u64) -> f64 {
    let all = (time_spent + time) as f64;
    avg / all * time_spent as f64 + period / all * time as f64
}

pub fn performance(
    data: &PerformanceData,
    acc: &mut AccPerformanceData,
    time: u64,
) -> Option<PerformanceObj> {
    if acc.need_erase {
        *acc = AccPerformanceData::default();
    }
    if !data.access {
        return None;
    }

    let iops = per_second(data.iops, time);
    let bw = per_second(data.bandwidth, time);
    acc.iops_avg = time_weighted(acc.iops_avg, acc.time_spent, iops as f64, time);
    acc.bandwidth_avg = time_weighted(acc.bandwidth_avg, acc.time_spent, bw as f64, time);
    acc.time_spent += time;

    Some(PerformanceObj {
        iops,
        bw,
        iops_avg: acc.iops_avg,
        bw_avg: acc.bandwidth_avg,
        time_spent: acc.time_spent,
        packet_cnt: data.packet_cnt.iter().collect(),
    })
}

pub fn queue(data: &QueueData, acc: &mut AccQueueData, time: u64) -> Option<QueueObj> {
    if acc.need_erase {
        *acc = AccQueueData::default();
    }
    if !data.access {
        return None;
    }

    let depth_period_avg = if data.num_req == 0 {
        0.0
    } else {
        data.sum_depth as f64 / data.num_req as f64
    };
    acc.depth_total_max = acc.depth_total_max.max(data.depth_period_max);
    acc.depth_total_avg =
        time_weighted(acc.depth_total_avg, acc.time_spent, depth_period_avg, time);
    acc.time_spent += time;

    Some(QueueObj {
        size: data.size,
        num_req: data.num_req,
        depth_period_avg,
        depth_period_max: data.depth_period_max,
        depth_total_avg: acc.depth_total_avg,
        depth_total_max: acc.depth_total_max,
    })
}

pub fn utilization(data: &UtilizationData, acc: &mut AccUtilizationData) -> Option<UtilizationObj> {
    if acc.need_erase {
        *acc = AccUtilizationData::default();
    }
    if !data.access {
        return None;
    }

    acc.total_usage = acc.total_usage.saturating_add(data.usage);
    Some(UtilizationObj {
        usage: data.usage,
        total_usage: acc.total_usage,
    })
}

pub fn count(data: &CountData, acc: &mut AccCountData) -> Option<CountObj> {
    if acc.need_erase {
        *acc = AccCountData::default();
    }
    if !data.access {
        return None;
    }

    let total = i128::from(acc.total_count);
    let signed = if acc.negative { -total } else { total };
    let combined = signed + i128::from(data.count_positive) - i128::from(data.count_negative);
    acc.negative = combined < 0;
    acc.total_count = u64::try_from(combined.unsigned_abs()).unwrap_or(u64::MAX);
    acc.total_num_req_positive += data.num_req_positive;
    acc.total_num_req_negative += data.num_req_negative;

    let magnitude = i64::try_from(acc.total_count).unwrap_or(i64::MAX);
    Some(CountObj {
        count_positive: data.count_positive,
        num_req_positive: data.num_req_positive,
        count_negative: data.count_negative,
        num_req_negative: data.num_req_negative,
        total_count: if acc.negative { -magnitude } else { magnitude },
        total_num_req_positive: acc.total_num_req_positive,
        total_num_req_negative: acc.total_num_req_negative,
    })
}

/// Runs the period calculation of one stage pair. Returns the object when
/// the lifetime has samples, then clears the period.
pub fn latency(data: &mut AccLatencySeqData) -> Option<LatencyObj> {
    data.calculate();
    let obj = (data.total_sample_count != 0).then(|| LatencyObj {
        mean: data.period.mean,
        min: data.period.min,
        max: data.period.max,
        median: data.period.median,
        low_qt: data.period.low_qt,
        up_qt: data.period.up_qt,
        sample_cnt: data.sample_count,
        bucket_cnt: data.bucket_count() as u64,
        total_mean: data.total.mean,
        total_min: data.total.min,
        total_max: data.total.max,
        total_median: data.total.median,
        total_low_qt: data.total.low_qt,
        total_up_qt: data.total.up_qt,
        total_sample_cnt: data.total_sample_count,
    });
    data.init_period();
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::PacketCounts;

    fn perf(iops: u64, bandwidth: u64) -> PerformanceData {
        let mut packet_cnt = PacketCounts::default();
        packet_cnt.add(4096);
        PerformanceData {
            access: true,
            iops,
            bandwidth,
            packet_cnt,
        }
    }

    #[test]
    fn test_performance_time_weighted_average() {
        let mut acc = AccPerformanceData::default();
        let first = performance(&perf(100, 409_600), &mut acc, 1).expect("obj");
        assert_eq!(first.iops, 100);
        assert_eq!(first.iops_avg, 100.0);
        assert_eq!(first.packet_cnt.get(&4096), Some(&1));

        // A three second period is reported per second and weighs three
        // times as much as the first one.
        let second = performance(&perf(600, 0), &mut acc, 3).expect("obj");
        assert_eq!(second.iops, 200);
        assert!((second.iops_avg - 175.0).abs() < 1e-9);
        assert_eq!(second.time_spent, 4);
    }

    #[test]
    fn test_untouched_period_emits_nothing_but_honours_erase() {
        let mut acc = AccPerformanceData {
            need_erase: true,
            iops_avg: 50.0,
            bandwidth_avg: 1.0,
            time_spent: 9,
        };
        assert!(performance(&PerformanceData::default(), &mut acc, 1).is_none());
        assert_eq!(acc.time_spent, 0);
        assert!(!acc.need_erase);
    }

    #[test]
    fn test_queue_averages_and_max() {
        let mut acc = AccQueueData::default();
        let data = QueueData {
            access: true,
            num_req: 4,
            sum_depth: 10,
            depth_period_max: 6,
            size: 2,
        };
        let obj = queue(&data, &mut acc, 1).expect("obj");
        assert_eq!(obj.size, 2);
        assert_eq!(obj.num_req, 4);
        assert_eq!(obj.depth_period_avg, 2.5);
        assert_eq!(obj.depth_total_avg, 2.5);

        let data = QueueData {
            access: true,
            num_req: 1,
            sum_depth: 1,
            depth_period_max: 1,
            size: 1,
        };
        let obj = queue(&data, &mut acc, 1).expect("obj");
        assert_eq!(obj.size, 1);
        assert_eq!(obj.depth_total_avg, 1.75);
        assert_eq!(obj.depth_total_max, 6);
    }

    #[test]
    fn test_count_signed_combine() {
        let mut acc = AccCountData::default();
        let down = CountData {
            access: true,
            count_positive: 2,
            num_req_positive: 1,
            count_negative: 5,
            num_req_negative: 2,
        };
        let obj = count(&down, &mut acc).expect("obj");
        assert_eq!(obj.total_count, -3);
        assert!(acc.negative);
        assert_eq!(acc.total_count, 3);

        let up = CountData {
            access: true,
            count_positive: 10,
            num_req_positive: 1,
            ..Default::default()
        };
        let obj = count(&up, &mut acc).expect("obj");
        assert_eq!(obj.total_count, 7);
        assert!(!acc.negative);
        assert_eq!(obj.total_num_req_positive, 2);
        assert_eq!(obj.total_num_req_negative, 2);
    }

    #[test]
    fn test_utilization_accumulates() {
        let mut acc = AccUtilizationData::default();
        let data = UtilizationData {
            access: true,
            usage: 30,
        };
        utilization(&data, &mut acc);
        let obj = utilization(&data, &mut acc).expect("obj");
        assert_eq!(obj.total_usage, 60);
    }

    #[test]
    fn test_latency_emits_only_with_lifetime_samples() {
        let mut data = AccLatencySeqData::default();
        assert!(latency(&mut data).is_none());

        data.add_timelag(100);
        data.add_timelag(300);
        let obj = latency(&mut data).expect("obj");
        assert_eq!(obj.sample_cnt, 2);
        assert_eq!(obj.bucket_cnt, 1);
        assert_eq!(obj.total_sample_cnt, 2);
        assert_eq!(obj.min, 100);
        assert_eq!(obj.max, 300);

        // The next empty period still reports the lifetime.
        let obj = latency(&mut data).expect("obj");
        assert_eq!(obj.sample_cnt, 0);
        assert_eq!(obj.total_sample_cnt, 2);
    }

    #[test]
    fn test_stream_swaps_and_reports_cells() {
        let slots = NodeSlots::new(ProcessorType::Utilization, 2, 2);
        let NodeCells::Utilization(cells) = slots.cells() else {
            panic!("utilization cells");
        };
        cells[slots.cell_index(1, 1)].write(|d| {
            d.access = true;
            d.usage = 8;
        });

        let mut seen = Vec::new();
        // First pass only closes the period that held the write.
        Processor::Utilization.stream(&slots, 1, |i, f, obj| seen.push((i, f, obj)));
        assert!(seen.is_empty());
        Processor::Utilization.stream(&slots, 1, |i, f, obj| seen.push((i, f, obj)));
        assert_eq!(seen.len(), 1);
        let (index, filter, ObjFields::Utilization(obj)) = &seen[0] else {
            panic!("utilization object");
        };
        assert_eq!((*index, *filter), (1, 1));
        assert_eq!(obj.usage, 8);

        seen.clear();
        Processor::Utilization.stream(&slots, 1, |i, f, obj| seen.push((i, f, obj)));
        assert!(seen.is_empty());
    }
}
