//! Long-running performance monitoring on top of single probes: session
//! lifecycle, bounded realtime/alert logs, and stream vs non-stream
//! comparison runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventBus, ProbeEvent};
use crate::metrics::{self, ProbeRecord};
use crate::orchestrator::{
    effective_timeout_ms, non_stream_probe, stream_probe, ProbeConfig, ProbeMode, ProbeOutcome,
};
use crate::tokenizer::{CharCountEstimator, TokenEstimator};
use crate::transport::ChatTransport;

/// Realtime log keeps at most this many entries, oldest evicted first.
pub const REALTIME_LOG_CAPACITY: usize = 1000;
/// Alert log keeps at most this many entries, oldest evicted first.
pub const ALERT_LOG_CAPACITY: usize = 50;
/// Completed sessions retained for export.
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    #[default]
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
}

/// One entry of the realtime metrics feed.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMetric {
    pub model: String,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Flat per-probe record kept inside a session.
#[derive(Debug, Clone, Serialize)]
pub struct ModelProbeRecord {
    pub model: String,
    pub mode: ProbeMode,
    pub success: bool,
    pub response_time_ms: f64,
    pub ttfb_ms: f64,
    pub token_count: u64,
    pub tokens_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ModelProbeRecord {
    fn from_outcome(mode: ProbeMode, outcome: &ProbeOutcome) -> Self {
        let timestamp = Utc::now();
        match outcome {
            ProbeOutcome::Valid(o) => Self {
                model: o.model.clone(),
                mode,
                success: true,
                response_time_ms: o.response_time_ms as f64,
                ttfb_ms: o.ttfb_ms.unwrap_or(0) as f64,
                token_count: o.token_count,
                tokens_per_second: o.tokens_per_second,
                error: None,
                timestamp,
            },
            ProbeOutcome::Inconsistent(o) => Self {
                model: o.model.clone(),
                mode,
                success: true,
                response_time_ms: o.response_time_ms as f64,
                ttfb_ms: o.ttfb_ms.unwrap_or(0) as f64,
                token_count: o.token_count,
                tokens_per_second: o.tokens_per_second,
                error: None,
                timestamp,
            },
            ProbeOutcome::Invalid(o) => Self {
                model: o.model.clone(),
                mode,
                success: false,
                response_time_ms: 0.0,
                ttfb_ms: 0.0,
                token_count: 0,
                tokens_per_second: 0.0,
                error: Some(o.message.clone()),
                timestamp,
            },
            ProbeOutcome::StreamEmpty(o) => Self {
                model: o.model.clone(),
                mode,
                success: false,
                response_time_ms: o.metrics.total_time_ms as f64,
                ttfb_ms: o.metrics.ttfb_ms.unwrap_or(0) as f64,
                token_count: 0,
                tokens_per_second: 0.0,
                error: Some(o.warning.clone()),
                timestamp,
            },
        }
    }

    fn as_metric_record(&self) -> ProbeRecord {
        ProbeRecord {
            response_time_ms: self.response_time_ms,
            success: Some(self.success),
            token_count: self.token_count,
            total_time_ms: self.response_time_ms,
            ttfb_ms: self.ttfb_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSession {
    pub id: Uuid,
    pub config: Value,
    pub started_at: DateTime<Utc>,
    pub probes: Vec<ModelProbeRecord>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Per-mode aggregates of a comparison run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModeSummary {
    pub average_response_time_ms: f64,
    pub success_rate: f64,
    pub average_tokens_per_second: f64,
}

fn mode_summary(records: &[ProbeRecord]) -> ModeSummary {
    ModeSummary {
        average_response_time_ms: metrics::average_response_time(records),
        success_rate: metrics::success_rate(records),
        average_tokens_per_second: metrics::tokens_per_second(records),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonSummary {
    pub model: String,
    pub iterations: u32,
    pub stream: ModeSummary,
    pub non_stream: ModeSummary,
    pub recommendation: String,
}

fn recommendation(stream: &ModeSummary, non_stream: &ModeSummary) -> String {
    if stream.success_rate < non_stream.success_rate {
        return "streaming is less reliable for this model; prefer non-streaming".to_string();
    }
    if non_stream.success_rate < stream.success_rate {
        return "non-streaming is less reliable for this model; prefer streaming".to_string();
    }
    if stream.average_tokens_per_second > non_stream.average_tokens_per_second {
        "both modes are reliable; streaming delivers tokens faster and improves perceived latency"
            .to_string()
    } else {
        "both modes are reliable; throughput is comparable, pick the mode your client prefers"
            .to_string()
    }
}

/// Stateful monitor. Probes always land in the realtime log and may raise
/// alerts; they are attached to a session only while one is active.
pub struct PerformanceMonitor<T: ChatTransport> {
    transport: Arc<T>,
    estimator: Arc<dyn TokenEstimator>,
    bus: EventBus,
    session: Option<MonitoringSession>,
    history: VecDeque<MonitoringSession>,
    realtime: VecDeque<RealtimeMetric>,
    alerts: VecDeque<Alert>,
}

impl<T: ChatTransport> PerformanceMonitor<T> {
    pub fn new(transport: T) -> Self {
        Self::with_estimator(transport, Arc::new(CharCountEstimator))
    }

    pub fn with_estimator(transport: T, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            transport: Arc::new(transport),
            estimator,
            bus: EventBus::new(),
            session: None,
            history: VecDeque::new(),
            realtime: VecDeque::new(),
            alerts: VecDeque::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Begin a session. When one is already active this is a no-op that
    /// returns the active session id; the caller must stop it first.
    pub fn start_monitoring(&mut self, config: Value) -> Uuid {
        if let Some(active) = &self.session {
            warn!(session = %active.id, "monitoring already active, start ignored");
            return active.id;
        }
        let session = MonitoringSession {
            id: Uuid::new_v4(),
            config,
            started_at: Utc::now(),
            probes: Vec::new(),
            ended_at: None,
            duration_ms: None,
        };
        let id = session.id;
        info!(session = %id, "monitoring session started");
        self.session = Some(session);
        id
    }

    /// End the active session, archive it, and return it. `None` when no
    /// session is active.
    pub fn stop_monitoring(&mut self) -> Option<MonitoringSession> {
        let mut session = self.session.take()?;
        let ended = Utc::now();
        session.duration_ms = Some((ended - session.started_at).num_milliseconds());
        session.ended_at = Some(ended);
        info!(
            session = %session.id,
            probes = session.probes.len(),
            duration_ms = session.duration_ms,
            "monitoring session stopped"
        );
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(session.clone());
        Some(session)
    }

    pub async fn monitor_non_stream_model(
        &mut self,
        model: &str,
        config: &ProbeConfig,
    ) -> ModelProbeRecord {
        let timeout_ms = effective_timeout_ms(model, config.base_timeout_ms);
        let outcome =
            non_stream_probe(&*self.transport, &*self.estimator, model, config, timeout_ms).await;
        self.record_outcome(ProbeMode::NonStream, &outcome)
    }

    pub async fn monitor_stream_model(
        &mut self,
        model: &str,
        config: &ProbeConfig,
    ) -> ModelProbeRecord {
        let timeout_ms = effective_timeout_ms(model, config.base_timeout_ms);
        let outcome = stream_probe(&*self.transport, model, config, timeout_ms).await;
        self.record_outcome(ProbeMode::Stream, &outcome)
    }

    /// Alternate stream and non-stream probes against one model and compare
    /// the two modes.
    pub async fn compare_model_performance(
        &mut self,
        model: &str,
        config: &ProbeConfig,
        iterations: u32,
        delay: Duration,
    ) -> ComparisonSummary {
        self.bus.publish(&ProbeEvent::ComparisonStarted {
            model: model.to_string(),
        });
        info!(model, iterations, "comparison run started");

        let mut stream_records = Vec::new();
        let mut non_stream_records = Vec::new();

        for iteration in 0..iterations {
            let record = self.monitor_stream_model(model, config).await;
            stream_records.push(record.as_metric_record());

            tokio::time::sleep(delay / 2).await;

            let record = self.monitor_non_stream_model(model, config).await;
            non_stream_records.push(record.as_metric_record());

            if iteration + 1 < iterations {
                tokio::time::sleep(delay).await;
            }
        }

        let stream = mode_summary(&stream_records);
        let non_stream = mode_summary(&non_stream_records);
        let recommendation = recommendation(&stream, &non_stream);
        ComparisonSummary {
            model: model.to_string(),
            iterations,
            stream,
            non_stream,
            recommendation,
        }
    }

    fn record_outcome(&mut self, mode: ProbeMode, outcome: &ProbeOutcome) -> ModelProbeRecord {
        let record = ModelProbeRecord::from_outcome(mode, outcome);

        let event_type = match outcome {
            ProbeOutcome::Valid(_) => "valid",
            ProbeOutcome::Inconsistent(_) => "inconsistent",
            ProbeOutcome::Invalid(_) => "invalid",
            ProbeOutcome::StreamEmpty(_) => "stream_empty",
        };
        self.push_realtime(RealtimeMetric {
            model: record.model.clone(),
            event_type: event_type.to_string(),
            payload: serde_json::to_value(outcome).unwrap_or(Value::Null),
            timestamp: record.timestamp,
        });

        if !record.success {
            let message = record
                .error
                .clone()
                .unwrap_or_else(|| "probe failed".to_string());
            self.add_alert("probe_failure", &message, AlertSeverity::Warning);
        }

        if let Some(session) = &mut self.session {
            session.probes.push(record.clone());
        }
        record
    }

    fn push_realtime(&mut self, metric: RealtimeMetric) {
        if self.realtime.len() == REALTIME_LOG_CAPACITY {
            self.realtime.pop_front();
        }
        self.realtime.push_back(metric.clone());
        self.bus.publish(&ProbeEvent::MetricsUpdate(metric));
    }

    pub fn add_alert(&mut self, kind: &str, message: &str, severity: AlertSeverity) -> Uuid {
        let alert = Alert {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            message: message.to_string(),
            severity,
            timestamp: Utc::now(),
        };
        warn!(kind, "{}", message);
        if self.alerts.len() == ALERT_LOG_CAPACITY {
            self.alerts.pop_front();
        }
        let id = alert.id;
        self.alerts.push_back(alert.clone());
        self.bus.publish(&ProbeEvent::Alert(alert));
        id
    }

    pub fn active_session(&self) -> Option<&MonitoringSession> {
        self.session.as_ref()
    }

    pub fn history(&self) -> &VecDeque<MonitoringSession> {
        &self.history
    }

    pub fn realtime_log(&self) -> &VecDeque<RealtimeMetric> {
        &self.realtime
    }

    pub fn alerts(&self) -> &VecDeque<Alert> {
        &self.alerts
    }

    pub fn clear_alerts(&mut self) {
        self.alerts.clear();
    }

    /// Everything the monitor holds, as one JSON document.
    pub fn export_data(&self) -> Value {
        json!({
            "active_session": self.session,
            "history": self.history,
            "realtime": self.realtime,
            "alerts": self.alerts,
            "exported_at": Utc::now(),
        })
    }
}
