// Custom error types for the cross-page and quality subsystems
//
// Using thiserror for ergonomic error definitions with:
// - Context preservation
// - Type-safe error matching
// - Source error chaining
//
// Ambiguous merges, unparseable split output and exhausted retry budgets are
// not errors here: they are reported through outcome types and logs.

use thiserror::Error;

/// Translation capability errors
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("API request failed: {0}")]
    ApiRequestFailed(#[from] reqwest::Error),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Rate limit exceeded (retry after {0}s)")]
    RateLimited(u64),

    #[error("Translation timed out after {0}s")]
    Timeout(u64),

    #[error("Translator '{0}' does not support the two-part split mode")]
    SplitModeUnsupported(String),

    #[error("Batch size mismatch: sent {sent} texts, received {received}")]
    BatchMismatch { sent: usize, received: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Carryover store persistence errors
#[derive(Debug, Error)]
pub enum CarryoverError {
    #[error("Failed to load carryover file {path}: {source}")]
    LoadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write carryover file {path}: {source}")]
    WriteFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Carryover serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("Carryover directory creation failed: {0}")]
    DirectoryCreationFailed(std::io::Error),
}

/// Retry prompt template errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    #[error("Template is missing required placeholder {{{0}}}")]
    MissingRequired(&'static str),

    #[error("No value supplied for placeholder {{{0}}}")]
    MissingValue(String),

    #[error("Unclosed placeholder starting at byte {0}")]
    Unclosed(usize),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid merge config: {0}")]
    InvalidMergeConfig(String),

    #[error("Invalid crosspage config: {0}")]
    InvalidCrosspageConfig(String),

    #[error("Invalid quality config: {0}")]
    InvalidQualityConfig(String),

    #[error("Invalid carryover path: {0}")]
    InvalidCarryoverPath(String),

    #[error("Invalid retry prompt: {0}")]
    InvalidPrompt(#[from] PromptError),
}

/// Page sequencing errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pages must be processed in order: expected page {expected}, got {got}")]
    OutOfOrderPage { expected: usize, got: usize },

    #[error("Carryover operation failed: {0}")]
    CarryoverFailed(#[from] CarryoverError),

    #[error("No translator available: {0}")]
    TranslatorUnavailable(String),
}

// Convenience type aliases for Results
pub type TranslationResult<T> = Result<T, TranslationError>;
pub type CarryoverResult<T> = Result<T, CarryoverError>;
pub type PromptResult<T> = Result<T, PromptError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_error_display_keeps_braces() {
        let err = PromptError::MissingRequired("max_chars");
        assert_eq!(err.to_string(), "Template is missing required placeholder {max_chars}");
    }

    #[test]
    fn test_out_of_order_display() {
        let err = PipelineError::OutOfOrderPage { expected: 3, got: 5 };
        assert!(err.to_string().contains("expected page 3, got 5"));
    }
}
