//! Findings and per-unit result sets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::engine::Detection;

/// One detected sensitive-entity occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub entity_type: String,
    pub text: String,
    /// Confidence in [0, 1]
    pub score: f64,
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl From<Detection> for Finding {
    fn from(detection: Detection) -> Self {
        Self {
            entity_type: detection.label,
            text: detection.text,
            score: detection.score.clamp(0.0, 1.0),
            start: detection.start,
            end: detection.end,
        }
    }
}

/// Ordered findings for one scanned unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingSet {
    pub findings: Vec<Finding>,
    /// Position of the unit within its stream
    pub unit_index: u64,
    /// Size of the scanned unit in bytes
    pub unit_bytes: usize,
    pub scanned_at: DateTime<Utc>,
}

impl FindingSet {
    /// Build a set from raw findings, deduplicating across model passes.
    pub fn new(findings: Vec<Finding>, unit_index: u64, unit_bytes: usize) -> Self {
        Self {
            findings: dedupe(findings),
            unit_index,
            unit_bytes,
            scanned_at: Utc::now(),
        }
    }

    /// Empty set for a unit that produced no usable result.
    pub fn empty(unit_index: u64, unit_bytes: usize) -> Self {
        Self::new(Vec::new(), unit_index, unit_bytes)
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Collapse duplicate findings by (entity type, matched text), keeping the
/// occurrence with the higher confidence. First-occurrence order is kept.
pub fn dedupe(findings: Vec<Finding>) -> Vec<Finding> {
    let mut deduped: Vec<Finding> = Vec::with_capacity(findings.len());
    let mut seen: HashMap<(String, String), usize> = HashMap::new();

    for finding in findings {
        let key = (finding.entity_type.clone(), finding.text.clone());
        match seen.get(&key) {
            Some(&at) => {
                if finding.score > deduped[at].score {
                    deduped[at] = finding;
                }
            }
            None => {
                seen.insert(key, deduped.len());
                deduped.push(finding);
            }
        }
    }
    deduped
}
