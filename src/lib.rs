//! Sentinel Core
//!
//! Endpoint telemetry ingestion and detection pipeline: collector
//! records flow into a SQLite-backed event store, through a registry of
//! detection rules, and out as explained, deduplicated anomalies with
//! retention-driven archival behind them.

pub mod archive;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod explain;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod retention;
pub mod rules;
pub mod store;
pub mod trackers;

pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use model::{Anomaly, AnomalyStatus, IncomingRecord, LogEvent, LogType, Severity};
pub use pipeline::Pipeline;
pub use store::Store;
