//! In-process publish/subscribe for probe progress.
//!
//! Each orchestrator or monitor instance owns its own `EventBus`; there is no
//! ambient global listener state. Zero subscribers is a valid configuration.

use std::sync::{Arc, Mutex};

use crate::monitor::{Alert, RealtimeMetric};
use crate::orchestrator::{
    InconsistentOutcome, InvalidOutcome, StreamEmptyOutcome, ValidOutcome,
};

/// Discrete progress events, tagged by kind, fanned out to observers.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    /// Non-streaming probe succeeded with a matching model identifier
    Valid(ValidOutcome),
    /// Probe failed with a classified error
    Invalid(InvalidOutcome),
    /// Endpoint answered with a different model identifier
    Inconsistent(InconsistentOutcome),
    /// Streaming probe produced at least one token
    StreamValid(ValidOutcome),
    /// Streaming returned HTTP 200 but no usable content
    StreamEmpty(StreamEmptyOutcome),
    /// Streaming probe failed with a classified error
    StreamInvalid(InvalidOutcome),
    /// A probe task failed outside its own recovery path
    Error { model: String, message: String },
    /// A stream-vs-non-stream comparison run began
    ComparisonStarted { model: String },
    /// Monitor raised an alert
    Alert(Alert),
    /// Monitor appended a realtime metric entry
    MetricsUpdate(RealtimeMetric),
}

type Subscriber = Box<dyn Fn(&ProbeEvent) + Send + Sync>;

/// Observer registry. Cloning shares the same subscriber set, so a bus can be
/// handed to spawned probe tasks.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for every subsequent event.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&ProbeEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Box::new(callback));
    }

    /// Deliver an event to every observer, in registration order.
    pub fn publish(&self, event: &ProbeEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            subscriber(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
