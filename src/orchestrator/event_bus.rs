//! Internal Event Bus for Monitor Coordination
//!
//! Process-wide pub/sub for detection, risk and narrative events. Nothing in
//! the detection path depends on a subscriber being present.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::model::{RiskBand, Severity, ViolationKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MonitorEvent {
    /// A new excursion was persisted
    ExcursionDetected {
        shipment_id: String,
        excursion_id: String,
        kind: ViolationKind,
        severity: Severity,
    },
    /// A violation matched an excursion already on record
    DuplicateSkipped { shipment_id: String, start_time: i64 },
    /// The shipment's current risk row was overwritten
    RiskRecomputed {
        shipment_id: String,
        score: RiskBand,
        score_value: u8,
    },
    NarrativeAttached { audit_id: String },
    ReadingsIngested { shipment_id: String, count: usize },
}

pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish to all current subscribers. Dropped if there are none.
    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    /// Global singleton instance of the EventBus
    pub static ref MONITOR_EVENT_BUS: Arc<EventBus> = Arc::new(EventBus::new());
}

/// Publish an event on the global bus.
#[macro_export]
macro_rules! emit_event {
    ($event:expr) => {
        $crate::orchestrator::event_bus::MONITOR_EVENT_BUS.publish($event);
    };
}
