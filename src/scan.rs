//! Partition Scan
//!
//! One scan reads one partition front to back, offering every record to the
//! partition's sampler and running admitted records through the filter stage
//! into a partition-local aggregator. Records that are not admitted are never
//! decoded.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::aggregate::{Estimator, SumAggregator};
use crate::calibrate::PilotStatistic;
use crate::error::{ApproxError, Result};
use crate::extract::{Extracted, FilterExtract};
use crate::parallel::CancellationToken;
use crate::sampler::{PartitionSampler, PartitionSampling};
use crate::source::{PartitionId, PartitionSource};

/// Records read between two cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Statistics for a single partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionStats {
    /// Partition identifier
    pub partition: PartitionId,
    /// Records read
    pub records_seen: u64,
    /// Records admitted into the sample
    pub records_admitted: u64,
    /// Admitted records that passed the filter
    pub records_matched: u64,
    /// Admitted records that did not decode
    pub records_malformed: u64,
    /// Sum of matched measures, before any scaling
    pub sum_of_matched: f64,
    /// Sum of squared matched measures
    pub sum_of_squares: f64,
    /// Probability a record of this partition was admitted
    pub inclusion_probability: f64,
    /// Wall time of the successful attempt
    pub elapsed: Duration,
}

impl PartitionStats {
    /// Create empty stats.
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            records_seen: 0,
            records_admitted: 0,
            records_matched: 0,
            records_malformed: 0,
            sum_of_matched: 0.0,
            sum_of_squares: 0.0,
            inclusion_probability: 0.0,
            elapsed: Duration::ZERO,
        }
    }

    /// Records read but left out of the sample.
    pub fn records_skipped(&self) -> u64 {
        self.records_seen - self.records_admitted
    }
}

impl From<&PartitionStats> for PilotStatistic {
    fn from(stats: &PartitionStats) -> Self {
        PilotStatistic {
            partition: stats.partition,
            records_seen: stats.records_seen,
            records_admitted: stats.records_admitted,
            records_matched: stats.records_matched,
            sum_of_matched: stats.sum_of_matched,
            sum_of_squares: stats.sum_of_squares,
        }
    }
}

/// Result of scanning one partition.
#[derive(Debug, Clone)]
pub struct PartitionOutput {
    /// Counters of the scan
    pub stats: PartitionStats,
    /// Partition-local sums, already expanded when an estimator was applied
    pub partial: SumAggregator,
}

/// Scans partitions of one source with one filter stage.
#[derive(Debug)]
pub struct PartitionScan<'a> {
    source: &'a dyn PartitionSource,
    extract: &'a FilterExtract,
    seed: u64,
    estimator: Option<Estimator>,
    cancellation: &'a CancellationToken,
}

impl<'a> PartitionScan<'a> {
    /// Create a scan. Partial sums are left unscaled until an estimator is set.
    pub fn new(
        source: &'a dyn PartitionSource,
        extract: &'a FilterExtract,
        seed: u64,
        cancellation: &'a CancellationToken,
    ) -> Self {
        Self {
            source,
            extract,
            seed,
            estimator: None,
            cancellation,
        }
    }

    /// Expand each partition's partial sums with `estimator`.
    pub fn with_estimator(mut self, estimator: Estimator) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Scan one partition.
    ///
    /// Identical calls produce identical outputs, so a failed attempt can be
    /// rerun.
    pub fn run(&self, partition: PartitionId, sampling: PartitionSampling) -> Result<PartitionOutput> {
        let start = Instant::now();
        let mut stats = PartitionStats::new(partition);
        let mut partial = SumAggregator::new();

        let mut sampler = PartitionSampler::new(self.seed, partition, sampling);
        if sampler.is_skip() {
            debug!(%partition, "partition skipped");
            return Ok(PartitionOutput { stats, partial });
        }

        let mut reader = self.source.open(partition)?;
        let mut line = Vec::new();

        loop {
            if stats.records_seen % CANCEL_CHECK_INTERVAL == 0 && self.cancellation.is_cancelled() {
                return Err(ApproxError::Cancelled);
            }

            if !reader.next_record(&mut line)? {
                break;
            }
            stats.records_seen += 1;

            if !sampler.admit(reader.remaining_hint()) {
                continue;
            }
            stats.records_admitted += 1;

            match self.extract.process(&line) {
                Extracted::Matched { key, measure } => {
                    stats.records_matched += 1;
                    stats.sum_of_matched += measure;
                    stats.sum_of_squares += measure * measure;
                    partial.accumulate(&key, measure);
                }
                Extracted::Unmatched => {}
                Extracted::Malformed => {
                    stats.records_malformed += 1;
                    trace!(
                        %partition,
                        record = stats.records_seen,
                        line = %String::from_utf8_lossy(&line),
                        "skipping malformed record"
                    );
                }
            }
        }

        stats.inclusion_probability = sampler.inclusion_probability();
        if let Some(estimator) = self.estimator {
            partial.scale(estimator.expansion_factor(stats.inclusion_probability));
        }
        stats.elapsed = start.elapsed();

        debug!(
            %partition,
            mode = ?sampler.mode(),
            seen = stats.records_seen,
            admitted = stats.records_admitted,
            matched = stats.records_matched,
            malformed = stats.records_malformed,
            inclusion_probability = stats.inclusion_probability,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "partition scanned"
        );

        Ok(PartitionOutput { stats, partial })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::KeySum;
    use crate::query::GroupBy;
    use crate::record::FieldPath;
    use crate::source::MemorySource;

    fn event(kind: &str, size: i64) -> String {
        format!(r#"{{"type":"{}","payload":{{"size":{}}}}}"#, kind, size)
    }

    fn filter(value: &str) -> FilterExtract {
        FilterExtract::new(
            FieldPath::parse("type"),
            value,
            GroupBy::FilterValue,
            FieldPath::parse("payload.size"),
        )
    }

    fn source() -> MemorySource {
        MemorySource::new(
            "scan",
            vec![vec![
                event("A", 10),
                event("B", 5),
                "{not json".to_string(),
                event("A", 20),
                String::new(),
                event("A", 30),
            ]],
        )
    }

    #[test]
    fn test_full_scan() {
        let source = source();
        let extract = filter("A");
        let token = CancellationToken::new();
        let scan = PartitionScan::new(&source, &extract, 1, &token);

        let output = scan
            .run(PartitionId::new(0), PartitionSampling::Ratio(1.0))
            .unwrap();
        assert_eq!(output.stats.records_seen, 6);
        assert_eq!(output.stats.records_admitted, 6);
        assert_eq!(output.stats.records_matched, 3);
        assert_eq!(output.stats.records_malformed, 2);
        assert_eq!(output.stats.sum_of_matched, 60.0);
        assert_eq!(output.stats.sum_of_squares, 1400.0);
        assert_eq!(output.stats.inclusion_probability, 1.0);
        assert_eq!(output.partial.get("A"), Some(&KeySum { sum: 60.0, count: 3 }));
    }

    #[test]
    fn test_skip_does_not_read() {
        let source = source();
        let extract = filter("A");
        let token = CancellationToken::new();
        let scan = PartitionScan::new(&source, &extract, 1, &token);

        // Partition 7 does not exist, so opening it would fail
        let output = scan.run(PartitionId::new(7), PartitionSampling::Skip).unwrap();
        assert_eq!(output.stats.records_seen, 0);
        assert!(output.partial.is_empty());
    }

    #[test]
    fn test_fixed_size_scan_is_scaled() {
        let lines: Vec<String> = (0..100).map(|_| event("A", 2)).collect();
        let source = MemorySource::new("fixed", vec![lines]);
        let extract = filter("A");
        let token = CancellationToken::new();
        let scan = PartitionScan::new(&source, &extract, 9, &token)
            .with_estimator(Estimator::HorvitzThompson);

        let output = scan
            .run(PartitionId::new(0), PartitionSampling::FixedSize(25))
            .unwrap();
        assert_eq!(output.stats.records_admitted, 25);
        assert_eq!(output.stats.inclusion_probability, 0.25);
        // 25 sampled values of 2, expanded by 4
        assert_eq!(output.partial.get("A").unwrap().sum, 200.0);
        assert_eq!(output.partial.get("A").unwrap().count, 25);
    }

    #[test]
    fn test_rerun_is_identical() {
        let lines: Vec<String> = (0..500).map(|i| event("A", i)).collect();
        let source = MemorySource::new("rerun", vec![lines]);
        let extract = filter("A");
        let token = CancellationToken::new();
        let scan = PartitionScan::new(&source, &extract, 3, &token);

        let first = scan.run(PartitionId::new(0), PartitionSampling::Ratio(0.3)).unwrap();
        let second = scan.run(PartitionId::new(0), PartitionSampling::Ratio(0.3)).unwrap();
        assert_eq!(first.stats.records_admitted, second.stats.records_admitted);
        assert_eq!(first.partial, second.partial);
    }

    #[test]
    fn test_cancelled_scan() {
        let source = source();
        let extract = filter("A");
        let token = CancellationToken::new();
        token.cancel();
        let scan = PartitionScan::new(&source, &extract, 1, &token);

        let result = scan.run(PartitionId::new(0), PartitionSampling::Ratio(1.0));
        assert!(matches!(result, Err(ApproxError::Cancelled)));
    }

    #[test]
    fn test_pilot_statistic_from_stats() {
        let mut stats = PartitionStats::new(PartitionId::new(4));
        stats.records_seen = 10;
        stats.records_admitted = 4;
        stats.records_matched = 2;
        stats.sum_of_matched = 6.0;
        stats.sum_of_squares = 20.0;

        let pilot = PilotStatistic::from(&stats);
        assert_eq!(pilot.partition, PartitionId::new(4));
        assert_eq!(pilot.records_admitted, 4);
        assert_eq!(pilot.sum_of_squares, 20.0);
        assert_eq!(stats.records_skipped(), 6);
    }
}
