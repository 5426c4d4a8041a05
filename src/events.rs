//! Cross-component notifications.
//!
//! Components publish [`EngineEvent`]s on a shared broadcast channel; the
//! orchestrator (and any test) subscribes. Publishing with no live
//! subscriber is not an error.

use serde::Serialize;
use tokio::sync::broadcast;

/// Number of events buffered per subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RecordStored {
        suite_name: String,
        record_id: String,
        tests: usize,
    },
    RetentionCompleted {
        removed_suites: usize,
        removed_tests: usize,
    },
    ModelsRetrained {
        metrics: Vec<String>,
        samples: usize,
    },
    InsightsReady {
        count: usize,
    },
    RecommendationsReady {
        count: usize,
    },
    AnalysisFailed {
        stage: String,
        message: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::debug!(?event, "publishing engine event");
        // Err only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
