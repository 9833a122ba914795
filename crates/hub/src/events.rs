//! Event recorders: a tracing-backed one for the controller and an in-memory one for tests.

use std::sync::Mutex;

use fleethub_core::EventRecorder;
use tracing::{info, warn};

/// Emits each event as a structured log line.
#[derive(Debug, Clone)]
pub struct LogRecorder {
    component: String,
}

impl LogRecorder {
    pub fn new(component: impl Into<String>) -> Self {
        Self { component: component.into() }
    }
}

impl EventRecorder for LogRecorder {
    fn record(&self, reason: &str, message: &str) {
        info!(component = %self.component, reason, "{}", message);
    }

    fn warning(&self, reason: &str, message: &str) {
        warn!(component = %self.component, reason, "{}", message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub reason: String,
    pub message: String,
    pub warning: bool,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    fn push(&self, reason: &str, message: &str, warning: bool) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedEvent { reason: reason.to_string(), message: message.to_string(), warning });
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, reason: &str, message: &str) {
        self.push(reason, message, false);
    }

    fn warning(&self, reason: &str, message: &str) {
        self.push(reason, message, true);
    }
}
