//! Run report: classification buckets for one probe run plus the terminal
//! summary and the bridge into the aggregate metrics.

use serde::Serialize;

use crate::metrics::{self, ProbeRecord, ScoreInput};
use crate::orchestrator::{
    InconsistentOutcome, InvalidOutcome, ProbeOutcome, StreamEmptyOutcome, ValidOutcome,
};

#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub valid: Vec<ValidOutcome>,
    pub inconsistent: Vec<InconsistentOutcome>,
    pub invalid: Vec<InvalidOutcome>,
    pub stream_empty: Vec<StreamEmptyOutcome>,
}

impl RunReport {
    pub fn push(&mut self, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Valid(o) => self.valid.push(o),
            ProbeOutcome::Inconsistent(o) => self.inconsistent.push(o),
            ProbeOutcome::Invalid(o) => self.invalid.push(o),
            ProbeOutcome::StreamEmpty(o) => self.stream_empty.push(o),
        }
    }

    pub fn total(&self) -> usize {
        self.valid.len() + self.inconsistent.len() + self.invalid.len() + self.stream_empty.len()
    }

    /// Flatten every bucket into metric records. Failures contribute to the
    /// success rate but not to the timing aggregates.
    pub fn records_for_metrics(&self) -> Vec<ProbeRecord> {
        let mut records = Vec::with_capacity(self.total());
        for o in &self.valid {
            records.push(ProbeRecord {
                response_time_ms: o.response_time_ms as f64,
                success: Some(true),
                token_count: o.token_count,
                total_time_ms: o.response_time_ms as f64,
                ttfb_ms: o.ttfb_ms.unwrap_or(0) as f64,
            });
        }
        for o in &self.inconsistent {
            records.push(ProbeRecord {
                response_time_ms: o.response_time_ms as f64,
                success: Some(true),
                token_count: o.token_count,
                total_time_ms: o.response_time_ms as f64,
                ttfb_ms: o.ttfb_ms.unwrap_or(0) as f64,
            });
        }
        for _ in &self.invalid {
            records.push(ProbeRecord {
                success: Some(false),
                ..Default::default()
            });
        }
        for o in &self.stream_empty {
            records.push(ProbeRecord {
                response_time_ms: o.metrics.total_time_ms as f64,
                success: Some(false),
                token_count: 0,
                total_time_ms: o.metrics.total_time_ms as f64,
                ttfb_ms: o.metrics.ttfb_ms.unwrap_or(0) as f64,
            });
        }
        records
    }

    /// Print the run summary to stdout.
    pub fn print_summary(&self) {
        println!();
        println!("==================== Probe Summary ====================");
        println!(
            "  total: {}  valid: {}  inconsistent: {}  invalid: {}  stream-empty: {}",
            self.total(),
            self.valid.len(),
            self.inconsistent.len(),
            self.invalid.len(),
            self.stream_empty.len()
        );

        if !self.valid.is_empty() {
            println!();
            println!("  Valid:");
            for o in &self.valid {
                let reason = if o.has_o1_reason { "  [reasoning]" } else { "" };
                println!(
                    "    {:<40} {:>7} ms  {:>8.2} tok/s{}",
                    o.model, o.response_time_ms, o.tokens_per_second, reason
                );
            }
        }

        if !self.inconsistent.is_empty() {
            println!();
            println!("  Inconsistent (endpoint answered with a different model):");
            for o in &self.inconsistent {
                println!(
                    "    {:<40} -> {:<30} {:>7} ms",
                    o.model, o.returned_model, o.response_time_ms
                );
            }
        }

        if !self.invalid.is_empty() {
            println!();
            println!("  Invalid:");
            for o in &self.invalid {
                println!("    {:<40} {}", o.model, o.message);
            }
        }

        if !self.stream_empty.is_empty() {
            println!();
            println!("  Stream empty:");
            for o in &self.stream_empty {
                println!("    {:<40} {}", o.model, o.warning);
            }
        }

        let records = self.records_for_metrics();
        if !records.is_empty() {
            let average = metrics::average_response_time(&records);
            let rate = metrics::success_rate(&records);
            let throughput = metrics::tokens_per_second(&records);
            let score = metrics::performance_score(ScoreInput {
                average_response_time_ms: average,
                success_rate: rate,
                tokens_per_second: throughput,
            });
            let latency = metrics::latency_distribution(&records);
            println!();
            println!("  Aggregates:");
            println!("    avg response time: {:.2} ms", average);
            println!("    success rate:      {:.2} %", rate);
            println!("    throughput:        {:.2} tok/s", throughput);
            println!(
                "    ttfb p50/p95/p99:  {:.0}/{:.0}/{:.0} ms",
                latency.median, latency.p95, latency.p99
            );
            println!("    performance score: {}/100", score);
        }
        println!("=======================================================");
    }
}
