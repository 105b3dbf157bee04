//! Detection Orchestration
//!
//! The detection pass, the durable queue that carries its triggers and
//! follow-up work, the worker that drains it, and the ingestion entry point.

pub mod detect;
pub mod event_bus;
pub mod ingest;
pub mod locks;
pub mod queue;
pub mod worker;

pub use detect::{DetectionOrchestrator, DetectionReport, SkipReason, IDEMPOTENCY_WINDOW_MS};
pub use event_bus::{EventBus, MonitorEvent, MONITOR_EVENT_BUS};
pub use ingest::{IngestRow, IngestSummary, IngestTarget, Ingestor};
pub use locks::ShipmentLocks;
pub use queue::{Job, SqliteTaskQueue, Task, TaskQueue, TaskStatus};
pub use worker::Worker;
