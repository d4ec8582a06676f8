//! Scan result aggregation
//!
//! Rolls a stream of per-unit finding sets up into the summary the result
//! storage layer persists: per-type counts, running average confidence,
//! and a capped handful of sample texts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::findings::FindingSet;
use crate::memory::MemoryGuard;

/// Samples retained per entity type.
const MAX_SAMPLES: usize = 5;

/// Sets processed between memory checks when aggregating with a guard.
const GUARD_CHECK_INTERVAL: usize = 100;

/// Aggregated statistics for one entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityTypeStats {
    pub count: u64,
    pub avg_confidence: f64,
    pub samples: Vec<String>,
}

/// Summary of a completed scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub total_entities: u64,
    pub unique_entity_types: usize,
    pub units_scanned: usize,
    pub total_bytes: u64,
    pub entity_stats: HashMap<String, EntityTypeStats>,
    pub generated_at: DateTime<Utc>,
}

impl ScanReport {
    /// Aggregate finding sets into a report.
    pub fn from_sets(sets: &[FindingSet]) -> Self {
        Self::build(sets, None)
    }

    /// Aggregate while cooperating with the global memory budget: every
    /// hundred sets the guard's pressure check runs, so a large result
    /// stream cannot silently blow past the ceiling.
    pub fn from_sets_with_guard(sets: &[FindingSet], guard: &MemoryGuard) -> Self {
        Self::build(sets, Some(guard))
    }

    fn build(sets: &[FindingSet], guard: Option<&MemoryGuard>) -> Self {
        let mut entity_stats: HashMap<String, EntityTypeStats> = HashMap::new();
        let mut total_entities = 0u64;
        let mut total_bytes = 0u64;

        for (processed, set) in sets.iter().enumerate() {
            if processed > 0 && processed % GUARD_CHECK_INTERVAL == 0 {
                if let Some(guard) = guard {
                    guard.check_pressure();
                }
            }

            total_bytes += set.unit_bytes as u64;
            for finding in &set.findings {
                total_entities += 1;
                let stats = entity_stats.entry(finding.entity_type.clone()).or_default();
                stats.count += 1;
                stats.avg_confidence += (finding.score - stats.avg_confidence) / stats.count as f64;
                if stats.samples.len() < MAX_SAMPLES {
                    stats.samples.push(finding.text.clone());
                }
            }
        }

        Self {
            total_entities,
            unique_entity_types: entity_stats.len(),
            units_scanned: sets.len(),
            total_bytes,
            entity_stats,
            generated_at: Utc::now(),
        }
    }
}
