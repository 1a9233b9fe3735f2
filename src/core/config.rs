use crate::core::errors::ConfigError;
use crate::quality::prompt::PromptTemplate;
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Fragment merge configuration
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Fragments below this OCR confidence are never merged
    pub min_confidence: f32,
    /// Row membership tolerance, as a multiple of the median fragment height
    pub row_tolerance: f32,
    /// Largest allowed horizontal gap, as a multiple of the median fragment height
    pub max_gap: f32,
    /// Largest allowed tallest/shortest fragment height ratio
    pub max_height_ratio: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.4,
            row_tolerance: 0.6,
            max_gap: 0.8,
            max_height_ratio: 2.0,
        }
    }
}

/// Cross-page pairing configuration
#[derive(Debug, Clone)]
pub struct CrosspageConfig {
    pub enabled: bool,
    /// Fraction of the page height treated as the top/bottom edge band
    pub edge_ratio: f32,
    /// Minimum horizontal overlap ratio for a bottom/top pair
    pub min_overlap: f32,
    pub carryover_path: String,
}

impl Default for CrosspageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            edge_ratio: 0.12,
            min_overlap: 0.2,
            carryover_path: ".cache/carryover.jsonl".to_string(),
        }
    }
}

/// Quality gate configuration
#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub enabled: bool,
    /// Regions scoring below this are retried
    pub retry_threshold: f32,
    /// Shared same-model + fallback retry attempts per image
    pub retry_budget_per_image: usize,
    /// Expected target/source character ratio for the length estimate
    pub length_ratio: f32,
    pub translate_timeout: Duration,
    pub retry_prompt: PromptTemplate,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_threshold: 0.55,
            retry_budget_per_image: 2,
            length_ratio: 1.0,
            translate_timeout: Duration::from_secs(60),
            retry_prompt: PromptTemplate::default_retry(),
        }
    }
}

/// Hosted translation model configuration
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub target_language: String,
    pub max_retries: u32,
    pub timeout: Duration,
}

/// Main subsystem configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: Level,
    pub merge: MergeConfig,
    pub crosspage: CrosspageConfig,
    pub quality: QualityConfig,
    pub translator: TranslatorConfig,
    pub fallback_translator: TranslatorConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let merge_defaults = MergeConfig::default();
        let crosspage_defaults = CrosspageConfig::default();
        let quality_defaults = QualityConfig::default();

        let retry_prompt = match env_nonempty("QUALITY_RETRY_PROMPT") {
            Some(template) => PromptTemplate::parse(&template)?,
            None => quality_defaults.retry_prompt,
        };

        let target_language =
            env_nonempty("TARGET_LANGUAGE").unwrap_or_else(|| "English".to_string());
        let max_retries = env_parse("MAX_RETRIES").unwrap_or(3);
        let timeout = Duration::from_secs(env_parse("API_TIMEOUT_SECONDS").unwrap_or(60));

        Ok(Self {
            log_level,
            merge: MergeConfig {
                min_confidence: env_parse("MERGE_MIN_CONFIDENCE")
                    .unwrap_or(merge_defaults.min_confidence),
                row_tolerance: env_parse("MERGE_ROW_TOLERANCE")
                    .unwrap_or(merge_defaults.row_tolerance),
                max_gap: env_parse("MERGE_MAX_GAP").unwrap_or(merge_defaults.max_gap),
                max_height_ratio: env_parse("MERGE_MAX_HEIGHT_RATIO")
                    .unwrap_or(merge_defaults.max_height_ratio),
            },
            crosspage: CrosspageConfig {
                enabled: env_parse("CROSSPAGE_ENABLED").unwrap_or(crosspage_defaults.enabled),
                edge_ratio: env_parse("CROSSPAGE_EDGE_RATIO")
                    .unwrap_or(crosspage_defaults.edge_ratio),
                min_overlap: env_parse("CROSSPAGE_MIN_OVERLAP")
                    .unwrap_or(crosspage_defaults.min_overlap),
                carryover_path: env_nonempty("CARRYOVER_PATH")
                    .unwrap_or(crosspage_defaults.carryover_path),
            },
            quality: QualityConfig {
                enabled: env_parse("QUALITY_GATE_ENABLED").unwrap_or(quality_defaults.enabled),
                retry_threshold: env_parse("QUALITY_RETRY_THRESHOLD")
                    .unwrap_or(quality_defaults.retry_threshold),
                retry_budget_per_image: env_parse("QUALITY_RETRY_BUDGET")
                    .unwrap_or(quality_defaults.retry_budget_per_image),
                length_ratio: env_parse("QUALITY_LENGTH_RATIO")
                    .unwrap_or(quality_defaults.length_ratio),
                translate_timeout: env_parse("QUALITY_TRANSLATE_TIMEOUT_SECONDS")
                    .map(Duration::from_secs)
                    .unwrap_or(quality_defaults.translate_timeout),
                retry_prompt,
            },
            translator: TranslatorConfig {
                api_url: env_nonempty("TRANSLATOR_API_URL")
                    .unwrap_or_else(|| "https://api.cerebras.ai/v1/chat/completions".to_string()),
                api_key: env_nonempty("TRANSLATOR_API_KEY"),
                model: env_nonempty("TRANSLATOR_MODEL").unwrap_or_else(|| "gpt-oss-120b".to_string()),
                target_language: target_language.clone(),
                max_retries,
                timeout,
            },
            fallback_translator: TranslatorConfig {
                api_url: env_nonempty("FALLBACK_TRANSLATOR_API_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
                api_key: env_nonempty("FALLBACK_TRANSLATOR_API_KEY"),
                model: env_nonempty("FALLBACK_TRANSLATOR_MODEL")
                    .unwrap_or_else(|| "gpt-4o".to_string()),
                target_language,
                max_retries,
                timeout,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.merge.min_confidence) {
            return Err(ConfigError::InvalidMergeConfig(format!(
                "min_confidence must be between 0.0 and 1.0, got {}",
                self.merge.min_confidence
            )));
        }
        if self.merge.row_tolerance <= 0.0 || self.merge.max_gap < 0.0 {
            return Err(ConfigError::InvalidMergeConfig(format!(
                "row_tolerance must be > 0 and max_gap >= 0, got {} and {}",
                self.merge.row_tolerance, self.merge.max_gap
            )));
        }
        if self.merge.max_height_ratio < 1.0 {
            return Err(ConfigError::InvalidMergeConfig(format!(
                "max_height_ratio must be >= 1.0, got {}",
                self.merge.max_height_ratio
            )));
        }

        if !(self.crosspage.edge_ratio > 0.0 && self.crosspage.edge_ratio < 0.5) {
            return Err(ConfigError::InvalidCrosspageConfig(format!(
                "edge_ratio must be in (0.0, 0.5), got {}",
                self.crosspage.edge_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.crosspage.min_overlap) {
            return Err(ConfigError::InvalidCrosspageConfig(format!(
                "min_overlap must be between 0.0 and 1.0, got {}",
                self.crosspage.min_overlap
            )));
        }

        // Validate carryover directory parent exists
        let carryover_path = Path::new(&self.crosspage.carryover_path);
        if carryover_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidCarryoverPath("path is empty".to_string()));
        }
        if let Some(parent) = carryover_path.parent().and_then(Path::parent) {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidCarryoverPath(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.quality.retry_threshold) {
            return Err(ConfigError::InvalidQualityConfig(format!(
                "retry_threshold must be between 0.0 and 1.0, got {}",
                self.quality.retry_threshold
            )));
        }
        if self.quality.length_ratio <= 0.0 {
            return Err(ConfigError::InvalidQualityConfig(format!(
                "length_ratio must be > 0, got {}",
                self.quality.length_ratio
            )));
        }
        if self.quality.translate_timeout.is_zero() {
            return Err(ConfigError::InvalidQualityConfig(
                "translate_timeout must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// A fallback model counts as available only with a configured key
    pub fn fallback_available(&self) -> bool {
        self.fallback_translator
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        let translator = TranslatorConfig {
            api_url: "https://api.cerebras.ai/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-oss-120b".to_string(),
            target_language: "English".to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(60),
        };
        let fallback_translator = TranslatorConfig {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            ..translator.clone()
        };
        Self {
            log_level: Level::INFO,
            merge: MergeConfig::default(),
            crosspage: CrosspageConfig::default(),
            quality: QualityConfig::default(),
            translator,
            fallback_translator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.fallback_available());
        assert_eq!(config.quality.retry_budget_per_image, 2);
    }

    #[test]
    fn test_rejects_edge_ratio_out_of_range() {
        let mut config = Config::default();
        config.crosspage.edge_ratio = 0.6;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCrosspageConfig(_))
        ));
    }

    #[test]
    fn test_rejects_bad_retry_threshold() {
        let mut config = Config::default();
        config.quality.retry_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQualityConfig(_))
        ));
    }

    #[test]
    fn test_fallback_available_with_key() {
        let mut config = Config::default();
        config.fallback_translator.api_key = Some("sk-test".to_string());
        assert!(config.fallback_available());

        config.fallback_translator.api_key = Some("  ".to_string());
        assert!(!config.fallback_available());
    }
}
