//! Integration test: end-to-end streaming scan flow
//! Tests: byte stream → chunked units → pooled engines → deduped findings
//! → report → health snapshot, plus saturation behavior under contention.

use pii_scanner::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct FixedProbe(u64);

impl MemoryProbe for FixedProbe {
    fn usage_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}

/// Detects every occurrence of a fixed needle with a fixed score.
struct SubstringAnalyzer {
    needle: &'static str,
    label: &'static str,
    score: f64,
}

impl Analyzer for SubstringAnalyzer {
    fn analyze(&self, text: &str) -> Result<Vec<Detection>> {
        let mut detections = Vec::new();
        let mut from = 0;
        while let Some(pos) = text[from..].find(self.needle) {
            let start = from + pos;
            detections.push(Detection {
                label: self.label.into(),
                text: self.needle.into(),
                score: self.score,
                start: Some(start),
                end: Some(start + self.needle.len()),
            });
            from = start + self.needle.len();
        }
        Ok(detections)
    }
}

fn substring_pool(
    guard: Arc<MemoryGuard>,
    pool_config: PoolConfig,
    needles: &'static [(&'static str, &'static str, f64)],
) -> ResourcePool<BoxedAnalyzer> {
    ResourcePool::new(pool_config, guard, move || {
        // A single engine instance handles one needle set; compose per pool.
        Ok(Box::new(MultiAnalyzer { needles }) as BoxedAnalyzer)
    })
}

struct MultiAnalyzer {
    needles: &'static [(&'static str, &'static str, f64)],
}

impl Analyzer for MultiAnalyzer {
    fn analyze(&self, text: &str) -> Result<Vec<Detection>> {
        let mut detections = Vec::new();
        for (needle, label, score) in self.needles.iter().copied() {
            let inner = SubstringAnalyzer { needle, label, score };
            detections.extend(inner.analyze(text)?);
        }
        Ok(detections)
    }
}

fn test_guard(usage: u64) -> Arc<MemoryGuard> {
    MemoryGuard::with_probe(
        100,
        MemoryThresholds::default(),
        BreakerConfig::default(),
        Arc::new(FixedProbe(usage)),
    )
}

fn byte_source(text: &str, piece: usize) -> VecDeque<Vec<u8>> {
    text.as_bytes()
        .chunks(piece)
        .map(|chunk| chunk.to_vec())
        .collect()
}

const SPACY_NEEDLES: &[(&str, &str, f64)] = &[("a@b.com", "EMAIL", 0.7)];
const GLINER_NEEDLES: &[(&str, &str, f64)] = &[
    ("a@b.com", "EMAIL", 0.95),
    ("555-0100", "PHONE", 0.9),
];

fn full_stack(
    guard: Arc<MemoryGuard>,
    pool_config: PoolConfig,
) -> (ScanCoordinator, Arc<EngineManager>) {
    let mut manager = EngineManager::new(guard.clone());
    manager.register_pool(
        "spacy",
        substring_pool(guard.clone(), pool_config.clone(), SPACY_NEEDLES),
    );
    manager.register_pool(
        "gliner",
        substring_pool(guard.clone(), pool_config, GLINER_NEEDLES),
    );
    let manager = Arc::new(manager);
    let coordinator = ScanCoordinator::new(
        manager.clone(),
        guard,
        vec!["spacy".to_string(), "gliner".to_string()],
    );
    (coordinator, manager)
}

#[tokio::test]
async fn test_end_to_end_scan_dedup_and_report() {
    let guard = test_guard(50);
    let (coordinator, manager) = full_stack(guard.clone(), PoolConfig::default());

    let text = "please call 555-0100 or mail a@b.com today";
    let config = ScanConfig {
        chunk_size: text.len(),
        ..Default::default()
    };
    let session = coordinator
        .scan(byte_source(text, 7), config)
        .await
        .unwrap();
    let sets = session.collect().await.unwrap();

    assert_eq!(sets.len(), 1);
    let findings = &sets[0].findings;
    assert_eq!(findings.len(), 2);

    // Both engines saw the email; the higher-confidence pass wins.
    let email = findings.iter().find(|f| f.entity_type == "EMAIL").unwrap();
    assert_eq!(email.score, 0.95);
    let phone = findings.iter().find(|f| f.entity_type == "PHONE").unwrap();
    assert_eq!(phone.text, "555-0100");

    let report = ScanReport::from_sets(&sets);
    assert_eq!(report.total_entities, 2);
    assert_eq!(report.unique_entity_types, 2);
    assert_eq!(report.units_scanned, 1);

    // Session is gone: every engine is back in its pool.
    let snapshot = HealthSnapshot::collect(&guard, &manager);
    assert!(snapshot.healthy);
    assert_eq!(snapshot.pools["spacy"].available, 2);
    assert_eq!(snapshot.pools["gliner"].available, 2);
}

#[tokio::test]
async fn test_multi_unit_stream_keeps_order() {
    let guard = test_guard(50);
    let (coordinator, _) = full_stack(guard, PoolConfig::default());

    // Three units: the needle text lands entirely inside the second unit.
    let text = "................a@b.com.........";
    let config = ScanConfig {
        chunk_size: 13,
        ..Default::default()
    };
    let session = coordinator
        .scan(byte_source(text, 5), config)
        .await
        .unwrap();
    let sets = session.collect().await.unwrap();

    assert_eq!(sets.len(), 3);
    assert_eq!(sets[0].unit_index, 0);
    assert_eq!(sets[2].unit_bytes, text.len() - 2 * 13);
    assert!(sets[0].is_empty());
    assert_eq!(sets[1].findings.len(), 1);
    assert!(sets[2].is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_saturated_service_fails_after_one_retry() {
    let guard = test_guard(50);
    let cleanups = Arc::new(AtomicUsize::new(0));
    let cleanups_clone = cleanups.clone();
    guard.register_cleanup_hook("count", move || {
        cleanups_clone.fetch_add(1, Ordering::SeqCst);
    });

    let pool_config = PoolConfig {
        max_size: 1,
        acquire_timeout_ms: 200,
    };
    let (coordinator, _) = full_stack(guard.clone(), pool_config);

    let holder = coordinator
        .scan(byte_source("held stream", 4), ScanConfig::default())
        .await
        .unwrap();

    // Both engine slots are lent to the first session; the second scan
    // cleans up, retries once, then reports saturation.
    let err = coordinator
        .scan(byte_source("rejected", 4), ScanConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::PoolExhausted { .. }));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    // Releasing the first session restores service.
    drop(holder);
    let session = coordinator
        .scan(byte_source("now fine a@b.com", 4), ScanConfig::default())
        .await
        .unwrap();
    let sets = session.collect().await.unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].findings.len(), 1);
}

#[tokio::test]
async fn test_scan_after_shutdown_is_unavailable() {
    let guard = test_guard(50);
    let (coordinator, manager) = full_stack(guard, PoolConfig::default());
    manager.initialize_all().await.unwrap();
    manager.shutdown_all().await;

    let err = coordinator
        .scan(byte_source("too late", 4), ScanConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::PoolUnavailable));
}
