//! Aggregate metric computation over collections of probe records. All
//! functions here are pure; the monitor and the CLI summary both feed them.

use serde::Serialize;

use crate::orchestrator::round2;

/// Flattened per-probe measurements, one record per completed probe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeRecord {
    pub response_time_ms: f64,
    /// `None` means the probe never reported either way; only an explicit
    /// `Some(false)` counts as a failure.
    pub success: Option<bool>,
    pub token_count: u64,
    pub total_time_ms: f64,
    pub ttfb_ms: f64,
}

/// Mean response time over records with a positive response time, rounded
/// to two decimals. Zero when no record qualifies.
pub fn average_response_time(records: &[ProbeRecord]) -> f64 {
    let times: Vec<f64> = records
        .iter()
        .map(|r| r.response_time_ms)
        .filter(|&t| t > 0.0)
        .collect();
    if times.is_empty() {
        return 0.0;
    }
    round2(times.iter().sum::<f64>() / times.len() as f64)
}

/// Percentage of records not explicitly marked failed. Zero for no records.
pub fn success_rate(records: &[ProbeRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let successes = records.iter().filter(|r| r.success != Some(false)).count();
    round2(successes as f64 * 100.0 / records.len() as f64)
}

/// Mean of per-record throughput rates. Records without both a positive
/// token count and a positive duration are skipped entirely rather than
/// dragging the mean toward zero.
pub fn tokens_per_second(records: &[ProbeRecord]) -> f64 {
    let rates: Vec<f64> = records
        .iter()
        .filter(|r| r.token_count > 0 && r.total_time_ms > 0.0)
        .map(|r| r.token_count as f64 / (r.total_time_ms / 1000.0))
        .collect();
    if rates.is_empty() {
        return 0.0;
    }
    round2(rates.iter().sum::<f64>() / rates.len() as f64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyDistribution {
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Nearest-rank latency distribution over positive time-to-first-byte
/// samples. All fields are zero when no sample qualifies.
pub fn latency_distribution(records: &[ProbeRecord]) -> LatencyDistribution {
    let mut samples: Vec<f64> = records
        .iter()
        .map(|r| r.ttfb_ms)
        .filter(|&t| t > 0.0)
        .collect();
    if samples.is_empty() {
        return LatencyDistribution::default();
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = samples.len();
    LatencyDistribution {
        min: samples[0],
        max: samples[n - 1],
        median: samples[n / 2],
        p95: samples[(n as f64 * 0.95) as usize],
        p99: samples[(n as f64 * 0.99) as usize],
    }
}

/// Inputs for the composite score; taken from the aggregates above.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput {
    pub average_response_time_ms: f64,
    pub success_rate: f64,
    pub tokens_per_second: f64,
}

/// Composite 0-100 health score. Starts at 100 and subtracts banded
/// penalties for slow responses, failures, and low throughput.
pub fn performance_score(input: ScoreInput) -> u32 {
    let mut score = 100.0;

    score -= match input.average_response_time_ms {
        t if t > 5000.0 => 20.0,
        t if t > 3000.0 => 15.0,
        t if t > 1000.0 => 10.0,
        t if t > 500.0 => 5.0,
        _ => 0.0,
    };

    score -= (100.0 - input.success_rate) * 0.3;

    score -= match input.tokens_per_second {
        r if r < 10.0 => 30.0,
        r if r < 20.0 => 20.0,
        r if r < 50.0 => 10.0,
        r if r < 100.0 => 5.0,
        _ => 0.0,
    };

    score.clamp(0.0, 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(response_time_ms: f64, success: Option<bool>) -> ProbeRecord {
        ProbeRecord {
            response_time_ms,
            success,
            ..Default::default()
        }
    }

    #[test]
    fn test_average_response_time_skips_nonpositive() {
        let records = vec![
            record(100.0, Some(true)),
            record(0.0, Some(true)),
            record(200.0, Some(true)),
        ];
        assert_eq!(average_response_time(&records), 150.0);
    }

    #[test]
    fn test_average_response_time_empty() {
        assert_eq!(average_response_time(&[]), 0.0);
        assert_eq!(average_response_time(&[record(0.0, None)]), 0.0);
    }

    #[test]
    fn test_success_rate_counts_unknown_as_success() {
        let records = vec![
            record(1.0, Some(true)),
            record(1.0, None),
            record(1.0, Some(false)),
            record(1.0, Some(false)),
        ];
        assert_eq!(success_rate(&records), 50.0);
        assert_eq!(success_rate(&[]), 0.0);
    }

    #[test]
    fn test_tokens_per_second_skips_incomplete_records() {
        let records = vec![
            ProbeRecord {
                token_count: 100,
                total_time_ms: 1000.0,
                ..Default::default()
            },
            ProbeRecord {
                token_count: 0,
                total_time_ms: 1000.0,
                ..Default::default()
            },
            ProbeRecord {
                token_count: 50,
                total_time_ms: 250.0,
                ..Default::default()
            },
        ];
        // Mean of 100 and 200
        assert_eq!(tokens_per_second(&records), 150.0);
        assert_eq!(tokens_per_second(&[]), 0.0);
    }

    #[test]
    fn test_latency_distribution_nearest_rank() {
        let records: Vec<ProbeRecord> = [10.0, 20.0, 30.0, 40.0, 50.0]
            .iter()
            .map(|&t| ProbeRecord {
                ttfb_ms: t,
                ..Default::default()
            })
            .collect();
        let dist = latency_distribution(&records);
        assert_eq!(dist.min, 10.0);
        assert_eq!(dist.max, 50.0);
        assert_eq!(dist.median, 30.0);
        assert_eq!(dist.p95, 50.0);
        assert_eq!(dist.p99, 50.0);
    }

    #[test]
    fn test_latency_distribution_empty_and_unsorted_input() {
        assert_eq!(latency_distribution(&[]), LatencyDistribution::default());

        let records: Vec<ProbeRecord> = [50.0, 10.0, 0.0, 30.0]
            .iter()
            .map(|&t| ProbeRecord {
                ttfb_ms: t,
                ..Default::default()
            })
            .collect();
        let dist = latency_distribution(&records);
        assert_eq!(dist.min, 10.0);
        assert_eq!(dist.median, 30.0);
    }

    #[test]
    fn test_performance_score_perfect() {
        let score = performance_score(ScoreInput {
            average_response_time_ms: 200.0,
            success_rate: 100.0,
            tokens_per_second: 150.0,
        });
        assert_eq!(score, 100);
    }

    #[test]
    fn test_performance_score_band_edges() {
        // 5001ms -> -20, 90% success -> -3, 9 tok/s -> -30 = 47
        let score = performance_score(ScoreInput {
            average_response_time_ms: 5001.0,
            success_rate: 90.0,
            tokens_per_second: 9.0,
        });
        assert_eq!(score, 47);
    }

    #[test]
    fn test_performance_score_clamps_to_zero() {
        let score = performance_score(ScoreInput {
            average_response_time_ms: 10_000.0,
            success_rate: 0.0,
            tokens_per_second: 0.0,
        });
        assert_eq!(score, 20); // 100 - 20 - 30 - 30
        let score = performance_score(ScoreInput {
            average_response_time_ms: 10_000.0,
            success_rate: -200.0,
            tokens_per_second: 0.0,
        });
        assert_eq!(score, 0);
    }
}
