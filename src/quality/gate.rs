// Quality gate: bounded same-model retry and fallback-model retry for
// low-scoring translations, under one shared per-image budget.
//
// Per region:
//   NEW -> SCORED -> ACCEPTED
//                 -> RETRIED -> RESCORED -> ACCEPTED
//                                        -> FALLBACK -> RESCORED -> ACCEPTED | GAVE_UP
//
// Same-model and fallback attempts draw from the same budget. A failed or
// timed-out call still spends its attempt. The gate never fails the page.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::core::config::QualityConfig;
use crate::core::errors::PromptResult;
use crate::core::types::{QualityRecord, Region};
use crate::quality::prompt::PromptTemplate;
use crate::quality::scorer::QualityScorer;
use crate::services::translation::translator::{Translation, Translator};
use crate::utils::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    New,
    Scored,
    Accepted,
    Retried,
    Rescored,
    Fallback,
    GaveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Accepted,
    GaveUp,
}

/// Per-region record of what the gate did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionGateOutcome {
    pub region_id: String,
    pub transitions: Vec<GateState>,
    pub decision: GateDecision,
    pub attempts_same_model: u8,
    pub attempts_fallback: u8,
    pub initial_score: f32,
    pub final_score: f32,
}

impl RegionGateOutcome {
    pub fn was_retried(&self) -> bool {
        self.attempts_same_model > 0 || self.attempts_fallback > 0
    }
}

/// Page-level gate summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct GateReport {
    pub outcomes: Vec<RegionGateOutcome>,
    pub budget_remaining: usize,
    pub retried: usize,
    pub gave_up: usize,
    pub fallback_unavailable: usize,
}

impl GateReport {
    pub fn outcome(&self, region_id: &str) -> Option<&RegionGateOutcome> {
        self.outcomes.iter().find(|o| o.region_id == region_id)
    }
}

/// Retry attempts shared by every region of one image
#[derive(Debug)]
pub struct RetryBudget {
    remaining: AtomicUsize,
}

impl RetryBudget {
    pub fn new(attempts: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(attempts),
        }
    }

    /// Take one attempt; `false` once the budget is spent
    pub fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub enabled: bool,
    pub retry_threshold: f32,
    pub retry_budget_per_image: usize,
    pub translate_timeout: Duration,
    pub retry_prompt: PromptTemplate,
}

impl From<&QualityConfig> for GateConfig {
    fn from(config: &QualityConfig) -> Self {
        Self {
            enabled: config.enabled,
            retry_threshold: config.retry_threshold,
            retry_budget_per_image: config.retry_budget_per_image,
            translate_timeout: config.translate_timeout,
            retry_prompt: config.retry_prompt.clone(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from(&QualityConfig::default())
    }
}

/// Best translation seen so far for a region
struct Candidate {
    text: String,
    model_confidence: Option<f32>,
    record: QualityRecord,
}

pub struct QualityGate {
    scorer: QualityScorer,
    config: GateConfig,
    primary: Arc<dyn Translator>,
    fallback: Option<Arc<dyn Translator>>,
    metrics: Option<Metrics>,
}

impl QualityGate {
    pub fn new(
        scorer: QualityScorer,
        config: GateConfig,
        primary: Arc<dyn Translator>,
        fallback: Option<Arc<dyn Translator>>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            scorer,
            config,
            primary,
            fallback,
            metrics,
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn scorer(&self) -> &QualityScorer {
        &self.scorer
    }

    pub fn new_budget(&self) -> RetryBudget {
        RetryBudget::new(self.config.retry_budget_per_image)
    }

    fn is_gated(region: &Region) -> bool {
        !region.is_watermark && !region.skip_translation && !region.source_text.trim().is_empty()
    }

    /// Score every translatable region of one image and retry low scorers.
    ///
    /// `locked` ids are scored but never retried (their text must stay
    /// consistent with the other half of a cross-page bubble).
    #[instrument(skip(self, regions, locked), fields(regions = regions.len()))]
    pub async fn evaluate_page(&self, regions: &mut [Region], locked: &HashSet<String>) -> GateReport {
        let budget = self.new_budget();
        let mut report = GateReport::default();
        let mut budget_logged = false;

        for region in regions.iter_mut().filter(|r| Self::is_gated(r)) {
            let locked_region = locked.contains(&region.id);
            let (outcome, fallback_missing) = self.evaluate_region(region, locked_region, &budget).await;

            if outcome.was_retried() {
                report.retried += 1;
            }
            if fallback_missing {
                report.fallback_unavailable += 1;
            }
            if outcome.decision == GateDecision::GaveUp {
                report.gave_up += 1;
                if budget.remaining() == 0 && !budget_logged {
                    info!("Retry budget exhausted, remaining low-score regions accepted as-is");
                    budget_logged = true;
                }
            }
            if let Some(ref m) = self.metrics {
                m.record_gate_outcome(&outcome, fallback_missing);
            }
            report.outcomes.push(outcome);
        }

        report.budget_remaining = budget.remaining();
        debug!(
            "Quality gate: {} regions, {} retried, {} gave up, budget left {}",
            report.outcomes.len(),
            report.retried,
            report.gave_up,
            report.budget_remaining
        );
        report
    }

    /// Run one region through the state machine.
    ///
    /// Returns the outcome and whether a fallback was wanted but unavailable.
    pub async fn evaluate_region(
        &self,
        region: &mut Region,
        locked: bool,
        budget: &RetryBudget,
    ) -> (RegionGateOutcome, bool) {
        let mut transitions = vec![GateState::New];
        let record = self.scorer.score(region);
        let initial_score = record.quality_score;
        self.observe(&record);
        region.quality = Some(record);
        transitions.push(GateState::Scored);

        let mut outcome = RegionGateOutcome {
            region_id: region.id.clone(),
            transitions: Vec::new(),
            decision: GateDecision::Accepted,
            attempts_same_model: 0,
            attempts_fallback: 0,
            initial_score,
            final_score: initial_score,
        };

        let exempt = region.is_sfx || locked || !self.config.enabled;
        if exempt || initial_score >= self.config.retry_threshold {
            transitions.push(GateState::Accepted);
            outcome.transitions = transitions;
            return (outcome, false);
        }

        // Same-model retry
        if !budget.try_take() {
            debug!("Region {} below threshold ({:.2}) with no budget left", region.id, initial_score);
            transitions.push(GateState::GaveUp);
            outcome.decision = GateDecision::GaveUp;
            outcome.transitions = transitions;
            return (outcome, false);
        }
        transitions.push(GateState::Retried);
        outcome.attempts_same_model = 1;
        self.attempt(region, self.primary.as_ref()).await;
        transitions.push(GateState::Rescored);
        outcome.final_score = current_score(region);

        if outcome.final_score >= self.config.retry_threshold {
            transitions.push(GateState::Accepted);
            outcome.transitions = transitions;
            return (outcome, false);
        }

        // Fallback model retry
        let Some(fallback) = self.fallback.as_ref().map(Arc::clone) else {
            warn!(
                "Region {} still below threshold ({:.2}) and no fallback model is configured, keeping best result",
                region.id, outcome.final_score
            );
            transitions.push(GateState::GaveUp);
            outcome.decision = GateDecision::GaveUp;
            outcome.transitions = transitions;
            return (outcome, true);
        };

        if !budget.try_take() {
            debug!("Region {} has no budget left for a fallback attempt", region.id);
            transitions.push(GateState::GaveUp);
            outcome.decision = GateDecision::GaveUp;
            outcome.transitions = transitions;
            return (outcome, false);
        }
        transitions.push(GateState::Fallback);
        outcome.attempts_fallback = 1;
        self.attempt(region, fallback.as_ref()).await;
        transitions.push(GateState::Rescored);
        outcome.final_score = current_score(region);

        if outcome.final_score >= self.config.retry_threshold {
            transitions.push(GateState::Accepted);
        } else {
            transitions.push(GateState::GaveUp);
            outcome.decision = GateDecision::GaveUp;
        }
        outcome.transitions = transitions;
        (outcome, false)
    }

    /// One translation attempt; the region keeps whichever result scores higher
    async fn attempt(&self, region: &mut Region, translator: &dyn Translator) {
        let prompt = match self.render_prompt(region) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Retry prompt for region {} could not be rendered: {}", region.id, e);
                return;
            }
        };

        let source = region.source_text.clone();
        let translation = match tokio::time::timeout(
            self.config.translate_timeout,
            translator.translate_with_prompt(&prompt, &source),
        )
        .await
        {
            Ok(Ok(translation)) => translation,
            Ok(Err(e)) => {
                warn!("Retry with {} failed for region {}: {}", translator.name(), region.id, e);
                return;
            }
            Err(_) => {
                warn!(
                    "Retry with {} timed out after {:?} for region {}",
                    translator.name(),
                    self.config.translate_timeout,
                    region.id
                );
                return;
            }
        };

        let best = self.pick_best(region, translation);
        debug!(
            "Region {} retried with {}: score {:.2}",
            region.id,
            translator.name(),
            best.record.quality_score
        );
        region.target_text = best.text;
        region.model_confidence = best.model_confidence;
        region.quality = Some(best.record);
    }

    fn pick_best(&self, region: &Region, translation: Translation) -> Candidate {
        let mut trial = region.clone();
        trial.target_text = translation.text.trim().to_string();
        trial.model_confidence = translation.model_confidence;
        let trial_record = self.scorer.score(&trial);
        self.observe(&trial_record);

        let current = region
            .quality
            .clone()
            .unwrap_or_else(|| self.scorer.score(region));

        if trial_record.quality_score > current.quality_score {
            Candidate {
                text: trial.target_text,
                model_confidence: trial.model_confidence,
                record: trial_record,
            }
        } else {
            Candidate {
                text: region.target_text.clone(),
                model_confidence: region.model_confidence,
                record: current,
            }
        }
    }

    fn render_prompt(&self, region: &Region) -> PromptResult<String> {
        let mut values: HashMap<&str, String> = HashMap::new();
        values.insert("source_text", region.source_text.trim().to_string());
        if let Some(max_chars) = self.scorer.target_length_estimate(region) {
            values.insert("max_chars", max_chars.to_string());
        }
        let glossary_terms = self
            .scorer
            .glossary()
            .map(|g| g.prompt_terms(&region.source_text))
            .unwrap_or_else(|| "(none)".to_string());
        values.insert("glossary_terms", glossary_terms);
        self.config.retry_prompt.render(&values)
    }

    fn observe(&self, record: &QualityRecord) {
        if let Some(ref m) = self.metrics {
            m.record_quality_score(record.quality_score, &record.recommendations);
        }
    }
}

fn current_score(region: &Region) -> f32 {
    region.quality.as_ref().map(|q| q.quality_score).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{TranslationError, TranslationResult};
    use crate::core::types::BBox;
    use crate::quality::scorer::{ScorerConfig, RETRY_TRANSLATION};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Replies with a fixed text and records each input
    struct Scripted {
        name: &'static str,
        reply: Option<String>,
        delay: Option<Duration>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn replying(name: &'static str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: Some(reply.to_string()),
                delay: None,
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply: None,
                delay: None,
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().len()
        }

        async fn reply_to(&self, input: &str) -> TranslationResult<Translation> {
            self.prompts.lock().push(input.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.reply {
                Some(reply) => Ok(Translation {
                    text: reply.clone(),
                    model_confidence: Some(0.9),
                }),
                None => Err(TranslationError::InvalidResponse("scripted failure".to_string())),
            }
        }
    }

    #[async_trait]
    impl Translator for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn translate(&self, text: &str) -> TranslationResult<Translation> {
            self.reply_to(text).await
        }

        async fn translate_with_prompt(&self, prompt: &str, _source_text: &str) -> TranslationResult<Translation> {
            self.reply_to(prompt).await
        }
    }

    /// Low score: low OCR confidence and a one-character output for a six-character source
    fn low_region(id: &str) -> Region {
        Region::new(id, BBox::new(0.0, 0.0, 100.0, 40.0), "정말 고마워")
            .with_confidence(0.4)
            .with_target("H")
    }

    fn gate(primary: Arc<dyn Translator>, fallback: Option<Arc<dyn Translator>>, budget: usize) -> QualityGate {
        let config = GateConfig {
            retry_budget_per_image: budget,
            ..GateConfig::default()
        };
        QualityGate::new(QualityScorer::new(ScorerConfig::default(), None), config, primary, fallback, None)
    }

    #[tokio::test]
    async fn test_budget_limits_retried_regions() {
        let primary = Scripted::replying("primary", "Thanks!");
        let gate = gate(primary.clone(), None, 2);
        let mut regions = vec![low_region("a"), low_region("b"), low_region("c")];

        let report = gate.evaluate_page(&mut regions, &HashSet::new()).await;

        assert_eq!(report.retried, 2);
        assert_eq!(report.gave_up, 1);
        assert_eq!(report.budget_remaining, 0);
        assert_eq!(primary.calls(), 2);
        assert_eq!(report.outcome("a").unwrap().decision, GateDecision::Accepted);
        assert_eq!(report.outcome("b").unwrap().decision, GateDecision::Accepted);
        let c = report.outcome("c").unwrap();
        assert_eq!(c.decision, GateDecision::GaveUp);
        assert!(!c.was_retried());
        assert_eq!(regions[2].target_text, "H");
        assert_eq!(regions[0].target_text, "Thanks!");
    }

    #[tokio::test]
    async fn test_sfx_accepted_without_retry() {
        let primary = Scripted::replying("primary", "Thanks!");
        let gate = gate(primary.clone(), None, 2);
        let mut regions = vec![low_region("boom").sfx()];

        let report = gate.evaluate_page(&mut regions, &HashSet::new()).await;

        let outcome = report.outcome("boom").unwrap();
        assert_eq!(outcome.decision, GateDecision::Accepted);
        assert_eq!(
            outcome.transitions,
            vec![GateState::New, GateState::Scored, GateState::Accepted]
        );
        assert_eq!(primary.calls(), 0);
        assert!(regions[0].quality.is_some());
    }

    #[tokio::test]
    async fn test_locked_region_not_retried() {
        let primary = Scripted::replying("primary", "Thanks!");
        let gate = gate(primary.clone(), None, 2);
        let mut regions = vec![low_region("seam")];
        let locked = HashSet::from(["seam".to_string()]);

        let report = gate.evaluate_page(&mut regions, &locked).await;
        assert_eq!(report.outcome("seam").unwrap().decision, GateDecision::Accepted);
        assert_eq!(primary.calls(), 0);
        assert_eq!(report.budget_remaining, 2);
    }

    #[tokio::test]
    async fn test_fallback_after_failed_retry_shares_budget() {
        let primary = Scripted::failing("primary");
        let fallback = Scripted::replying("fallback", "Thank you!");
        let gate = gate(primary.clone(), Some(fallback.clone()), 2);
        let mut regions = vec![low_region("a"), low_region("b")];

        let report = gate.evaluate_page(&mut regions, &HashSet::new()).await;

        let a = report.outcome("a").unwrap();
        assert_eq!(
            a.transitions,
            vec![
                GateState::New,
                GateState::Scored,
                GateState::Retried,
                GateState::Rescored,
                GateState::Fallback,
                GateState::Rescored,
                GateState::Accepted,
            ]
        );
        assert_eq!(a.attempts_same_model, 1);
        assert_eq!(a.attempts_fallback, 1);
        assert_eq!(regions[0].target_text, "Thank you!");

        // Region a spent both attempts
        assert_eq!(report.outcome("b").unwrap().decision, GateDecision::GaveUp);
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_fallback_keeps_best_result() {
        // A lone unbalanced bracket scores worse than the original
        let primary = Scripted::replying("primary", "(");
        let gate = gate(primary.clone(), None, 2);
        let mut regions = vec![low_region("a")];

        let report = gate.evaluate_page(&mut regions, &HashSet::new()).await;

        let a = report.outcome("a").unwrap();
        assert_eq!(a.decision, GateDecision::GaveUp);
        assert_eq!(report.fallback_unavailable, 1);
        // Only the same-model attempt was spent
        assert_eq!(report.budget_remaining, 1);
        assert_eq!(regions[0].target_text, "H");
        let record = regions[0].quality.as_ref().unwrap();
        assert_eq!(record.recommendations[0], RETRY_TRANSLATION);
    }

    #[tokio::test]
    async fn test_per_region_cap_of_one_retry_each() {
        let primary = Scripted::failing("primary");
        let fallback = Scripted::failing("fallback");
        let gate = gate(primary.clone(), Some(fallback.clone()), 10);
        let mut regions = vec![low_region("a")];

        let report = gate.evaluate_page(&mut regions, &HashSet::new()).await;

        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
        assert_eq!(report.budget_remaining, 8);
        assert_eq!(report.outcome("a").unwrap().decision, GateDecision::GaveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_consumes_attempt() {
        let slow = Arc::new(Scripted {
            name: "slow",
            reply: Some("Thanks!".to_string()),
            delay: Some(Duration::from_secs(120)),
            prompts: Mutex::new(Vec::new()),
        });
        let gate = gate(slow.clone(), None, 1);
        let mut regions = vec![low_region("a"), low_region("b")];

        let report = gate.evaluate_page(&mut regions, &HashSet::new()).await;

        assert_eq!(slow.calls(), 1);
        assert_eq!(report.budget_remaining, 0);
        assert_eq!(regions[0].target_text, "H");
        assert_eq!(report.gave_up, 2);
    }

    #[tokio::test]
    async fn test_retry_prompt_contains_source_and_limit() {
        let primary = Scripted::replying("primary", "Thanks!");
        let gate = gate(primary.clone(), None, 1);
        let mut regions = vec![low_region("a")];

        gate.evaluate_page(&mut regions, &HashSet::new()).await;

        let prompts = primary.prompts.lock();
        assert!(prompts[0].contains("정말 고마워"));
        assert!(prompts[0].contains("at most 6 characters"));
    }

    #[test]
    fn test_retry_budget_never_underflows() {
        let budget = RetryBudget::new(1);
        assert!(budget.try_take());
        assert!(!budget.try_take());
        assert_eq!(budget.remaining(), 0);
    }
}
