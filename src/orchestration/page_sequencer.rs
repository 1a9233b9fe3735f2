// Page sequencer: drives merging, seam pairing, carryover handoff, translation
// and the quality gate over consecutive pages, strictly in order

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::core::config::{Config, CrosspageConfig};
use crate::core::errors::{PipelineError, PipelineResult, TranslationError, TranslationResult};
use crate::core::types::{CrosspageRole, Glossary, Region};
use crate::crosspage::carryover::CarryoverStore;
use crate::crosspage::edge_band::{find_edge_groups, match_crosspage_pairs, Edge};
use crate::crosspage::grouping::{BubbleGrouper, BubbleIdGrouper, Group};
use crate::crosspage::merger::{join_tokens, RegionMerger};
use crate::crosspage::splitter::{parse_split_json, resolve_split, SplitPath, SplitResult};
use crate::quality::gate::{GateConfig, GateDecision, GateReport, QualityGate};
use crate::quality::scorer::{QualityScorer, ScorerConfig};
use crate::services::translation::{ChatTranslator, TranslationMemo, Translator};
use crate::utils::Metrics;

/// One page image's detected regions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInput {
    pub page_id: String,
    pub width: u32,
    pub height: u32,
    pub regions: Vec<Region>,
}

/// Enriched regions for the rendering stage, plus what happened on the way
#[derive(Debug, Clone, Serialize)]
pub struct PageOutput {
    pub page_id: String,
    pub index: usize,
    pub regions: Vec<Region>,
    pub gate: GateReport,
    pub pairs_with_prev: usize,
    pub carryover_consumed: usize,
    pub pairs_with_next: usize,
    pub split_paths: Vec<SplitPath>,
    /// Set when the carryover flush failed; the page itself still succeeded
    pub persistence_error: Option<String>,
    pub elapsed_ms: u64,
}

impl PageOutput {
    pub fn region(&self, id: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }
}

/// Runs pages one at a time.
///
/// Cross-page mode is a single-writer/single-reader handoff per pair id, so
/// page N must finish (including its carryover flush) before page N+1
/// starts. `process_page` enforces consecutive indices and serializes callers.
pub struct PageSequencer {
    crosspage: CrosspageConfig,
    merger: RegionMerger,
    // Re-merges neighbour pages without counting them twice in metrics
    neighbor_merger: RegionMerger,
    grouper: Box<dyn BubbleGrouper>,
    translator: Arc<dyn Translator>,
    translate_timeout: Duration,
    gate: QualityGate,
    carryover: CarryoverStore,
    memo: TranslationMemo,
    cursor: Mutex<Option<usize>>,
    metrics: Option<Metrics>,
}

impl PageSequencer {
    pub fn new(
        config: &Config,
        translator: Arc<dyn Translator>,
        fallback: Option<Arc<dyn Translator>>,
        carryover: CarryoverStore,
        glossary: Option<Glossary>,
        metrics: Option<Metrics>,
    ) -> Self {
        let scorer = QualityScorer::new(
            ScorerConfig {
                retry_threshold: config.quality.retry_threshold,
                length_ratio: config.quality.length_ratio,
                ..ScorerConfig::default()
            },
            glossary,
        );
        let gate = QualityGate::new(
            scorer,
            GateConfig::from(&config.quality),
            Arc::clone(&translator),
            fallback,
            metrics.clone(),
        );

        Self {
            crosspage: config.crosspage.clone(),
            merger: RegionMerger::new(config.merge.clone(), metrics.clone()),
            neighbor_merger: RegionMerger::new(config.merge.clone(), None),
            grouper: Box::new(BubbleIdGrouper),
            translator,
            translate_timeout: config.quality.translate_timeout,
            gate,
            carryover,
            memo: TranslationMemo::new(None, metrics.clone()),
            cursor: Mutex::new(None),
            metrics,
        }
    }

    /// Build hosted translators and the carryover store from configuration.
    ///
    /// The fallback translator is optional; the primary one is not.
    pub async fn from_config(
        config: &Config,
        glossary: Option<Glossary>,
        metrics: Option<Metrics>,
    ) -> PipelineResult<Self> {
        let primary = ChatTranslator::from_config(&config.translator, metrics.clone()).ok_or_else(|| {
            PipelineError::TranslatorUnavailable(format!(
                "{} has no API key configured",
                config.translator.model
            ))
        })?;

        let fallback = if config.fallback_available() {
            ChatTranslator::from_config(&config.fallback_translator, metrics.clone())
                .map(|t| Arc::new(t) as Arc<dyn Translator>)
        } else {
            None
        };
        if fallback.is_none() {
            info!("No fallback translator configured, low-score regions get one same-model retry at most");
        }

        let carryover = if config.crosspage.enabled {
            CarryoverStore::open(&config.crosspage.carryover_path, metrics.clone()).await?
        } else {
            CarryoverStore::in_memory(metrics.clone())
        };

        info!(
            "Page sequencer ready (crosspage: {}, quality gate: {}, retry budget: {})",
            if config.crosspage.enabled { "ON" } else { "OFF" },
            if config.quality.enabled { "ON" } else { "OFF" },
            config.quality.retry_budget_per_image
        );

        Ok(Self::new(config, Arc::new(primary), fallback, carryover, glossary, metrics))
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn with_grouper(mut self, grouper: Box<dyn BubbleGrouper>) -> Self {
        self.grouper = grouper;
        self
    }

    pub fn with_memo(mut self, memo: TranslationMemo) -> Self {
        self.memo = memo;
        self
    }

    pub fn carryover(&self) -> &CarryoverStore {
        &self.carryover
    }

    pub fn memo(&self) -> &TranslationMemo {
        &self.memo
    }

    /// Forget the last processed index so a new chapter can start anywhere
    pub async fn reset(&self) {
        *self.cursor.lock().await = None;
    }

    /// Process a whole chapter, one page after another
    pub async fn process_pages_in_order(&self, pages: &[PageInput]) -> PipelineResult<Vec<PageOutput>> {
        self.reset().await;
        let mut outputs = Vec::with_capacity(pages.len());
        for (index, page) in pages.iter().enumerate() {
            let prev = index.checked_sub(1).and_then(|i| pages.get(i));
            let next = pages.get(index + 1);
            outputs.push(self.process_page(index, prev, page, next).await?);
        }
        Ok(outputs)
    }

    /// Process one page given its neighbours.
    ///
    /// `index` must be exactly one past the previous call's; the first call
    /// may start at any index so an interrupted chapter can resume.
    #[instrument(skip(self, prev, page, next), fields(page = %page.page_id))]
    pub async fn process_page(
        &self,
        index: usize,
        prev: Option<&PageInput>,
        page: &PageInput,
        next: Option<&PageInput>,
    ) -> PipelineResult<PageOutput> {
        let mut cursor = self.cursor.lock().await;
        if let Some(last) = *cursor {
            if index != last + 1 {
                return Err(PipelineError::OutOfOrderPage {
                    expected: last + 1,
                    got: index,
                });
            }
        }

        let start = Instant::now();
        let mut regions = self.merger.merge_all(self.grouper.group(&page.regions));
        let mut locked: HashSet<String> = HashSet::new();

        let mut pairs_with_prev = 0;
        let mut carryover_consumed = 0;
        let mut pairs_with_next = 0;
        let mut split_paths = Vec::new();

        if self.crosspage.enabled {
            if let Some(prev) = prev {
                (pairs_with_prev, carryover_consumed) =
                    self.receive_from_prev(prev, page, &mut regions, &mut locked);
            }
            if let Some(next) = next {
                (pairs_with_next, split_paths) =
                    self.send_to_next(page, next, &mut regions, &mut locked).await;
            }
        }

        self.translate_remaining(&mut regions, &locked).await;

        let gate = self.gate.evaluate_page(&mut regions, &locked).await;
        self.remember_accepted(&regions, &gate, &locked);

        let persistence_error = if self.crosspage.enabled {
            match self.carryover.flush().await {
                Ok(_) => None,
                Err(e) => {
                    warn!("Page {} finished but its carryover was not persisted: {}", page.page_id, e);
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        *cursor = Some(index);
        if let Some(ref m) = self.metrics {
            m.record_page_processed();
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            "Page {} done in {}ms: {} regions, {} seam pairs, {} retried, {} gave up",
            page.page_id,
            elapsed_ms,
            regions.len(),
            pairs_with_prev + pairs_with_next,
            gate.retried,
            gate.gave_up
        );

        Ok(PageOutput {
            page_id: page.page_id.clone(),
            index,
            regions,
            gate,
            pairs_with_prev,
            carryover_consumed,
            pairs_with_next,
            split_paths,
            persistence_error,
            elapsed_ms,
        })
    }

    fn neighbor_regions(&self, page: &PageInput) -> Vec<Region> {
        self.neighbor_merger.merge_all(self.grouper.group(&page.regions))
    }

    fn edge_groups(&self, regions: &[Region], height: u32, edge: Edge) -> Vec<Group> {
        find_edge_groups(self.grouper.as_ref(), regions, height, edge, self.crosspage.edge_ratio)
    }

    /// Pair the previous page's bottom band with this page's top band and
    /// take over any carried bottom halves. Returns (pairs, consumed).
    fn receive_from_prev(
        &self,
        prev: &PageInput,
        page: &PageInput,
        regions: &mut [Region],
        locked: &mut HashSet<String>,
    ) -> (usize, usize) {
        let prev_regions = self.neighbor_regions(prev);
        let bottom = self.edge_groups(&prev_regions, prev.height, Edge::Bottom);
        let top = self.edge_groups(regions, page.height, Edge::Top);
        let pairs = match_crosspage_pairs(&bottom, &top, self.crosspage.min_overlap);

        let mut consumed = 0;
        for pair in &pairs {
            let ids = owned_ids(&top[pair.top_index]);
            tag_pair(regions, &ids, &pair.pair_id, CrosspageRole::NextTop);

            match self.carryover.consume(&pair.pair_id) {
                Some(text) => {
                    if let Some(first) = prefill(regions, &ids, &text) {
                        locked.insert(first);
                    }
                    consumed += 1;
                }
                None => {
                    debug!(
                        "No carryover for pair {} from page {}, translating locally",
                        pair.pair_id, prev.page_id
                    );
                }
            }
        }
        (pairs.len(), consumed)
    }

    /// Pair this page's bottom band with the next page's top band, translate
    /// each pair as one bubble and carry the bottom half forward.
    async fn send_to_next(
        &self,
        page: &PageInput,
        next: &PageInput,
        regions: &mut [Region],
        locked: &mut HashSet<String>,
    ) -> (usize, Vec<SplitPath>) {
        let next_regions = self.neighbor_regions(next);
        let bottom = self.edge_groups(regions, page.height, Edge::Bottom);
        let top = self.edge_groups(&next_regions, next.height, Edge::Top);
        let pairs = match_crosspage_pairs(&bottom, &top, self.crosspage.min_overlap);
        if let Some(ref m) = self.metrics {
            m.record_crosspage_pairs(pairs.len());
        }

        let mut paths = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            let ids = owned_ids(&bottom[pair.bottom_index]);
            if ids.iter().any(|id| locked.contains(id)) {
                debug!("Group for pair {} already holds carried text, not splitting", pair.pair_id);
                continue;
            }
            tag_pair(regions, &ids, &pair.pair_id, CrosspageRole::CurrentBottom);

            let top_source = bottom[pair.bottom_index].text();
            let bottom_source = top[pair.top_index].text();
            let Some(split) = self.split_translate(&top_source, &bottom_source).await else {
                warn!(
                    "Could not translate cross-page pair {}, both halves translate separately",
                    pair.pair_id
                );
                continue;
            };

            if let Some(ref m) = self.metrics {
                m.record_split(split.path);
            }
            if let Some(first) = prefill(regions, &ids, &split.top) {
                locked.insert(first);
            }
            self.carryover
                .put(&pair.pair_id, &split.bottom, &page.page_id, &next.page_id);
            paths.push(split.path);
        }
        (pairs.len(), paths)
    }

    /// Strict-JSON split first; otherwise translate the joined text and split it locally
    async fn split_translate(&self, top_source: &str, bottom_source: &str) -> Option<SplitResult> {
        let raw = match self
            .timed(self.translator.translate_split(top_source, bottom_source))
            .await
        {
            Ok(raw) => {
                if let Some((top, bottom)) = parse_split_json(&raw) {
                    return Some(SplitResult {
                        top,
                        bottom,
                        path: SplitPath::Json,
                    });
                }
                Some(raw)
            }
            Err(TranslationError::SplitModeUnsupported(name)) => {
                debug!("{} has no split mode, splitting locally", name);
                None
            }
            Err(e) => {
                warn!("Split translation failed, splitting locally: {}", e);
                None
            }
        };

        let full_source = join_tokens(&[top_source, bottom_source]);
        match self.timed(self.translator.translate(&full_source)).await {
            Ok(translation) => Some(resolve_split(raw.as_deref(), &translation.text)),
            Err(e) => {
                warn!("Translation of joined cross-page text failed: {}", e);
                None
            }
        }
    }

    /// Memo first, then one batch call; per-region calls if the batch fails
    async fn translate_remaining(&self, regions: &mut [Region], locked: &HashSet<String>) {
        let mut pending: Vec<usize> = Vec::new();
        for (i, region) in regions.iter_mut().enumerate() {
            if !region.needs_translation() || locked.contains(&region.id) || !region.target_text.is_empty() {
                continue;
            }
            match self.memo.get(&region.source_text) {
                Some(text) => region.target_text = text,
                None => pending.push(i),
            }
        }
        if pending.is_empty() {
            return;
        }

        let texts: Vec<String> = pending
            .iter()
            .map(|&i| regions[i].source_text.trim().to_string())
            .collect();

        match self.timed(self.translator.translate_batch(&texts)).await {
            Ok(translations) if translations.len() == texts.len() => {
                for (&i, translation) in pending.iter().zip(translations) {
                    regions[i].target_text = translation.text.trim().to_string();
                    regions[i].model_confidence = translation.model_confidence;
                }
                return;
            }
            Ok(translations) => {
                warn!(
                    "Batch translation returned {} results for {} texts, retrying one by one",
                    translations.len(),
                    texts.len()
                );
            }
            Err(e) => {
                warn!("Batch translation failed, retrying {} regions one by one: {}", texts.len(), e);
            }
        }

        for (&i, text) in pending.iter().zip(&texts) {
            match self.timed(self.translator.translate(text)).await {
                Ok(translation) => {
                    regions[i].target_text = translation.text.trim().to_string();
                    regions[i].model_confidence = translation.model_confidence;
                }
                Err(e) => warn!("Translation failed for region {}: {}", regions[i].id, e),
            }
        }
    }

    fn remember_accepted(&self, regions: &[Region], gate: &GateReport, locked: &HashSet<String>) {
        for outcome in gate
            .outcomes
            .iter()
            .filter(|o| o.decision == GateDecision::Accepted && !locked.contains(&o.region_id))
        {
            if let Some(region) = regions.iter().find(|r| r.id == outcome.region_id) {
                self.memo.put(&region.source_text, &region.target_text);
            }
        }
    }

    async fn timed<T, F>(&self, call: F) -> TranslationResult<T>
    where
        F: Future<Output = TranslationResult<T>>,
    {
        match tokio::time::timeout(self.translate_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TranslationError::Timeout(self.translate_timeout.as_secs())),
        }
    }
}

fn owned_ids(group: &Group) -> Vec<String> {
    group.region_ids().into_iter().map(str::to_string).collect()
}

fn tag_pair(regions: &mut [Region], ids: &[String], pair_id: &str, role: CrosspageRole) {
    for region in regions.iter_mut().filter(|r| ids.contains(&r.id)) {
        region.crosspage_pair_id = Some(pair_id.to_string());
        region.crosspage_role = Some(role);
    }
}

/// Put `text` on the group's first region in reading order and blank the
/// others. Returns the id that received the text.
fn prefill(regions: &mut [Region], ids: &[String], text: &str) -> Option<String> {
    let first = regions
        .iter()
        .filter(|r| ids.contains(&r.id) && !r.is_watermark)
        .min_by(|a, b| {
            a.bbox
                .y1
                .total_cmp(&b.bbox.y1)
                .then(a.bbox.x1.total_cmp(&b.bbox.x1))
        })?
        .id
        .clone();

    for region in regions
        .iter_mut()
        .filter(|r| ids.contains(&r.id) && !r.is_watermark)
    {
        if region.id == first {
            region.target_text = text.to_string();
            region.skip_translation = false;
        } else {
            region.target_text.clear();
            region.skip_translation = true;
        }
    }
    Some(first)
}
