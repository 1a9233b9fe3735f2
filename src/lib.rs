// Library exports for cross-page continuity and translation quality gating
//
// Per page: merge OCR fragments, pair edge bubbles with the neighbouring
// pages, hand split translations forward through the carryover store, then
// score and retry low-quality translations under a shared per-image budget.

pub mod core;
pub mod crosspage;
pub mod orchestration;
pub mod quality;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{CarryoverError, ConfigError, PipelineError, PromptError, TranslationError},
    types::{BBox, CrosspageRole, Glossary, QualityRecord, Region},
};

pub use crate::crosspage::{
    BubbleGrouper, BubbleIdGrouper, CarryoverStore, CrosspagePair, Group, RegionMerger, SplitPath,
    SplitResult,
};

pub use crate::orchestration::{PageInput, PageOutput, PageSequencer};

pub use crate::quality::{GateReport, PromptTemplate, QualityGate, QualityScorer};

pub use crate::services::{ChatTranslator, Translation, TranslationMemo, Translator};

pub use crate::utils::{init_tracing, Metrics};
