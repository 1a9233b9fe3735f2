use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::crosspage::splitter::SplitPath;
use crate::quality::gate::{GateDecision, RegionGateOutcome};

/// Counters for merging, seam pairing, carryover, translation calls and the
/// quality gate.
///
/// Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Merger
    merges_applied: AtomicUsize,
    merges_aborted: AtomicUsize,

    // Seam pairing
    crosspage_pairs: AtomicUsize,
    split_paths: DashMap<&'static str, AtomicUsize>,

    // Carryover
    carryover_puts: AtomicUsize,
    carryover_consumed: AtomicUsize,
    carryover_flush_failures: AtomicUsize,

    // Translation
    translation_calls_total: AtomicUsize,
    translation_calls_failed: AtomicUsize,
    translation_latency_ms: RwLock<Vec<u64>>,
    memo_hits: AtomicUsize,
    memo_misses: AtomicUsize,

    // Quality gate
    regions_scored: AtomicUsize,
    score_sum_micros: AtomicUsize,
    recommendation_counts: DashMap<String, AtomicUsize>,
    gate_accepted: AtomicUsize,
    gate_gave_up: AtomicUsize,
    gate_same_model_retries: AtomicUsize,
    gate_fallback_retries: AtomicUsize,
    gate_fallback_unavailable: AtomicUsize,

    pages_processed: AtomicUsize,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                merges_applied: AtomicUsize::new(0),
                merges_aborted: AtomicUsize::new(0),
                crosspage_pairs: AtomicUsize::new(0),
                split_paths: DashMap::new(),
                carryover_puts: AtomicUsize::new(0),
                carryover_consumed: AtomicUsize::new(0),
                carryover_flush_failures: AtomicUsize::new(0),
                translation_calls_total: AtomicUsize::new(0),
                translation_calls_failed: AtomicUsize::new(0),
                translation_latency_ms: RwLock::new(Vec::new()),
                memo_hits: AtomicUsize::new(0),
                memo_misses: AtomicUsize::new(0),
                regions_scored: AtomicUsize::new(0),
                score_sum_micros: AtomicUsize::new(0),
                recommendation_counts: DashMap::new(),
                gate_accepted: AtomicUsize::new(0),
                gate_gave_up: AtomicUsize::new(0),
                gate_same_model_retries: AtomicUsize::new(0),
                gate_fallback_retries: AtomicUsize::new(0),
                gate_fallback_unavailable: AtomicUsize::new(0),
                pages_processed: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_merge(&self, merged: bool) {
        if merged {
            self.inner.merges_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.merges_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_crosspage_pairs(&self, count: usize) {
        self.inner.crosspage_pairs.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_split(&self, path: SplitPath) {
        self.inner
            .split_paths
            .entry(path.as_str())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_carryover_put(&self) {
        self.inner.carryover_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_carryover_consume(&self) {
        self.inner.carryover_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_carryover_flush_failure(&self) {
        self.inner.carryover_flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_translation_call(&self, success: bool, duration: Duration) {
        self.inner.translation_calls_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.translation_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .translation_latency_ms
            .write()
            .push(duration.as_millis() as u64);
    }

    pub fn record_memo_hit(&self) {
        self.inner.memo_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memo_miss(&self) {
        self.inner.memo_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// One scorer run: its score and the tags it emitted
    pub fn record_quality_score(&self, score: f32, recommendations: &[String]) {
        self.inner.regions_scored.fetch_add(1, Ordering::Relaxed);
        let micros = (score.clamp(0.0, 1.0) * 1_000_000.0).round() as usize;
        self.inner.score_sum_micros.fetch_add(micros, Ordering::Relaxed);
        for tag in recommendations {
            self.inner
                .recommendation_counts
                .entry(tag.clone())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_gate_outcome(&self, outcome: &RegionGateOutcome, fallback_unavailable: bool) {
        match outcome.decision {
            GateDecision::Accepted => self.inner.gate_accepted.fetch_add(1, Ordering::Relaxed),
            GateDecision::GaveUp => self.inner.gate_gave_up.fetch_add(1, Ordering::Relaxed),
        };
        self.inner
            .gate_same_model_retries
            .fetch_add(outcome.attempts_same_model as usize, Ordering::Relaxed);
        self.inner
            .gate_fallback_retries
            .fetch_add(outcome.attempts_fallback as usize, Ordering::Relaxed);
        if fallback_unavailable {
            self.inner.gate_fallback_unavailable.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_page_processed(&self) {
        self.inner.pages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.translation_latency_ms.read();
        let translation_latency_avg_ms = avg(&latency);
        let translation_latency_p95_ms = percentile(&latency, 0.95);
        drop(latency);

        let memo_hits = self.inner.memo_hits.load(Ordering::Relaxed);
        let memo_misses = self.inner.memo_misses.load(Ordering::Relaxed);
        let memo_total = memo_hits + memo_misses;
        let memo_hit_rate = if memo_total > 0 {
            memo_hits as f64 / memo_total as f64
        } else {
            0.0
        };

        let regions_scored = self.inner.regions_scored.load(Ordering::Relaxed);
        let average_quality_score = if regions_scored > 0 {
            self.inner.score_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0 / regions_scored as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            merges_applied: self.inner.merges_applied.load(Ordering::Relaxed),
            merges_aborted: self.inner.merges_aborted.load(Ordering::Relaxed),
            crosspage_pairs: self.inner.crosspage_pairs.load(Ordering::Relaxed),
            split_paths: counts(&self.inner.split_paths),
            carryover_puts: self.inner.carryover_puts.load(Ordering::Relaxed),
            carryover_consumed: self.inner.carryover_consumed.load(Ordering::Relaxed),
            carryover_flush_failures: self.inner.carryover_flush_failures.load(Ordering::Relaxed),
            translation_calls_total: self.inner.translation_calls_total.load(Ordering::Relaxed),
            translation_calls_failed: self.inner.translation_calls_failed.load(Ordering::Relaxed),
            translation_latency_avg_ms,
            translation_latency_p95_ms,
            memo_hits,
            memo_misses,
            memo_hit_rate,
            regions_scored,
            average_quality_score,
            recommendations: counts(&self.inner.recommendation_counts),
            gate_accepted: self.inner.gate_accepted.load(Ordering::Relaxed),
            gate_gave_up: self.inner.gate_gave_up.load(Ordering::Relaxed),
            gate_same_model_retries: self.inner.gate_same_model_retries.load(Ordering::Relaxed),
            gate_fallback_retries: self.inner.gate_fallback_retries.load(Ordering::Relaxed),
            gate_fallback_unavailable: self.inner.gate_fallback_unavailable.load(Ordering::Relaxed),
            pages_processed: self.inner.pages_processed.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP region_merges_total Fragment groups merged or left unmerged
# TYPE region_merges_total counter
region_merges_total {{outcome="merged"}} {}
region_merges_total {{outcome="aborted"}} {}

# HELP crosspage_pairs_total Bottom/top groups paired across a page seam
# TYPE crosspage_pairs_total counter
crosspage_pairs_total {{}} {}

# HELP carryover_entries_total Carryover entries stored and consumed
# TYPE carryover_entries_total counter
carryover_entries_total {{op="put"}} {}
carryover_entries_total {{op="consume"}} {}

# HELP carryover_flush_failures_total Carryover flushes that could not be written
# TYPE carryover_flush_failures_total counter
carryover_flush_failures_total {{}} {}

# HELP translation_calls_total Translation API calls
# TYPE translation_calls_total counter
translation_calls_total {{}} {}
translation_calls_failed_total {{}} {}

# HELP translation_latency_avg_ms Average translation latency in milliseconds
# TYPE translation_latency_avg_ms gauge
translation_latency_avg_ms {{}} {}

# HELP memo_hit_rate Translation memo hit rate (0.0 to 1.0)
# TYPE memo_hit_rate gauge
memo_hit_rate {{}} {}

# HELP quality_score_avg Average quality score over all scorer runs
# TYPE quality_score_avg gauge
quality_score_avg {{}} {}

# HELP quality_gate_regions_total Gate decisions per region
# TYPE quality_gate_regions_total counter
quality_gate_regions_total {{decision="accepted"}} {}
quality_gate_regions_total {{decision="gave_up"}} {}

# HELP quality_gate_retries_total Retry attempts by kind
# TYPE quality_gate_retries_total counter
quality_gate_retries_total {{kind="same_model"}} {}
quality_gate_retries_total {{kind="fallback"}} {}

# HELP quality_gate_fallback_unavailable_total Regions that wanted a fallback model but had none
# TYPE quality_gate_fallback_unavailable_total counter
quality_gate_fallback_unavailable_total {{}} {}

# HELP pages_processed_total Pages run through the sequencer
# TYPE pages_processed_total counter
pages_processed_total {{}} {}

# HELP uptime_seconds Uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.merges_applied,
            snapshot.merges_aborted,
            snapshot.crosspage_pairs,
            snapshot.carryover_puts,
            snapshot.carryover_consumed,
            snapshot.carryover_flush_failures,
            snapshot.translation_calls_total,
            snapshot.translation_calls_failed,
            snapshot.translation_latency_avg_ms,
            snapshot.memo_hit_rate,
            snapshot.average_quality_score,
            snapshot.gate_accepted,
            snapshot.gate_gave_up,
            snapshot.gate_same_model_retries,
            snapshot.gate_fallback_retries,
            snapshot.gate_fallback_unavailable,
            snapshot.pages_processed,
            snapshot.uptime_seconds,
        );

        out.push_str("\n# HELP crosspage_splits_total Seam splits by path\n# TYPE crosspage_splits_total counter\n");
        for (path, count) in &snapshot.split_paths {
            out.push_str(&format!("crosspage_splits_total {{path=\"{}\"}} {}\n", path, count));
        }
        out.push_str("\n# HELP quality_recommendations_total Recommendation tags emitted\n# TYPE quality_recommendations_total counter\n");
        for (tag, count) in &snapshot.recommendations {
            out.push_str(&format!("quality_recommendations_total {{tag=\"{}\"}} {}\n", tag, count));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub merges_applied: usize,
    pub merges_aborted: usize,
    pub crosspage_pairs: usize,
    pub split_paths: BTreeMap<String, usize>,
    pub carryover_puts: usize,
    pub carryover_consumed: usize,
    pub carryover_flush_failures: usize,
    pub translation_calls_total: usize,
    pub translation_calls_failed: usize,
    pub translation_latency_avg_ms: u64,
    pub translation_latency_p95_ms: u64,
    pub memo_hits: usize,
    pub memo_misses: usize,
    pub memo_hit_rate: f64,
    pub regions_scored: usize,
    pub average_quality_score: f64,
    pub recommendations: BTreeMap<String, usize>,
    pub gate_accepted: usize,
    pub gate_gave_up: usize,
    pub gate_same_model_retries: usize,
    pub gate_fallback_retries: usize,
    pub gate_fallback_unavailable: usize,
    pub pages_processed: usize,
    pub uptime_seconds: u64,
}

fn counts<K: ToString + Eq + std::hash::Hash>(map: &DashMap<K, AtomicUsize>) -> BTreeMap<String, usize> {
    map.iter()
        .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
        .collect()
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::gate::GateState;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_merge(true);
        metrics.record_merge(false);
        metrics.record_translation_call(true, Duration::from_millis(100));
        metrics.record_translation_call(false, Duration::from_millis(50));
        metrics.record_memo_hit();
        metrics.record_memo_miss();
        metrics.record_split(SplitPath::Punctuation);
        metrics.record_split(SplitPath::Punctuation);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.merges_applied, 1);
        assert_eq!(snapshot.merges_aborted, 1);
        assert_eq!(snapshot.translation_calls_total, 2);
        assert_eq!(snapshot.translation_calls_failed, 1);
        assert_eq!(snapshot.translation_latency_avg_ms, 75);
        assert_eq!(snapshot.memo_hit_rate, 0.5);
        assert_eq!(snapshot.split_paths.get("punctuation"), Some(&2));
    }

    #[test]
    fn test_quality_counters() {
        let metrics = Metrics::new();
        metrics.record_quality_score(0.5, &["retry_translation".to_string()]);
        metrics.record_quality_score(1.0, &[]);

        let outcome = RegionGateOutcome {
            region_id: "r".to_string(),
            transitions: vec![GateState::New, GateState::Scored, GateState::GaveUp],
            decision: GateDecision::GaveUp,
            attempts_same_model: 1,
            attempts_fallback: 0,
            initial_score: 0.5,
            final_score: 0.5,
        };
        metrics.record_gate_outcome(&outcome, true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.regions_scored, 2);
        assert!((snapshot.average_quality_score - 0.75).abs() < 1e-9);
        assert_eq!(snapshot.recommendations.get("retry_translation"), Some(&1));
        assert_eq!(snapshot.gate_gave_up, 1);
        assert_eq!(snapshot.gate_same_model_retries, 1);
        assert_eq!(snapshot.gate_fallback_unavailable, 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_carryover_put();
        metrics.record_quality_score(0.4, &["check_overflow".to_string()]);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("carryover_entries_total {op=\"put\"} 1"));
        assert!(prometheus.contains("quality_recommendations_total {tag=\"check_overflow\"} 1"));
    }
}
