//! Scan Module
//!
//! Streaming PII scanning: per-request configuration, the coordinator and
//! session driving chunked analysis, findings with cross-pass
//! deduplication, and result aggregation.

mod config;
mod coordinator;
mod findings;
mod report;

pub use config::ScanConfig;
pub use coordinator::{ByteSource, ScanCoordinator, ScanSession, ScanState};
pub use findings::{dedupe, Finding, FindingSet};
pub use report::{EntityTypeStats, ScanReport};
