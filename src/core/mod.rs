pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{Config, CrosspageConfig, MergeConfig, QualityConfig, TranslatorConfig};
pub use errors::{
    CarryoverError, ConfigError, PipelineError, PromptError, TranslationError,
};
pub use types::{BBox, CrosspageRole, Glossary, QualityRecord, Region};
