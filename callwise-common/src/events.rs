//! Event types for the Callwise event system
//!
//! Provides shared event definitions and the EventBus used by the ingest
//! service to broadcast pipeline progress (SSE stream, alert fan-out).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Callwise event types
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CallwiseEvent {
    /// A CDR delivery was accepted by the webhook gateway
    CdrReceived {
        tenant_id: Uuid,
        call_id: Uuid,
        uniqueid: String,
        /// False for duplicate / merge deliveries
        created: bool,
        timestamp: DateTime<Utc>,
    },

    /// Recording fetch reached a terminal state
    RecordingFetchFinished {
        tenant_id: Uuid,
        call_id: Uuid,
        /// `fetched`, `failed` or `unavailable`
        state: String,
        timestamp: DateTime<Utc>,
    },

    /// One enrichment stage changed state
    StageStateChanged {
        tenant_id: Uuid,
        call_id: Uuid,
        stage: String,
        state: String,
        timestamp: DateTime<Utc>,
    },

    /// All stages of a call are terminal (partial enrichment included)
    CallEnrichmentFinished {
        tenant_id: Uuid,
        call_id: Uuid,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        timestamp: DateTime<Utc>,
    },

    /// Operator alert raised by the alerting component
    AlertRaised {
        alert_id: i64,
        tenant_id: Option<Uuid>,
        kind: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl CallwiseEvent {
    /// Event type name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            CallwiseEvent::CdrReceived { .. } => "CdrReceived",
            CallwiseEvent::RecordingFetchFinished { .. } => "RecordingFetchFinished",
            CallwiseEvent::StageStateChanged { .. } => "StageStateChanged",
            CallwiseEvent::CallEnrichmentFinished { .. } => "CallEnrichmentFinished",
            CallwiseEvent::AlertRaised { .. } => "AlertRaised",
        }
    }
}

/// Broadcast bus for CallwiseEvent
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallwiseEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before slow subscribers lag
    ///
    /// # Examples
    ///
    /// ```
    /// use callwise_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CallwiseEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CallwiseEvent,
    ) -> Result<usize, broadcast::error::SendError<CallwiseEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CallwiseEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
