// Translation capability seam consumed by the page sequencer and quality gate

use async_trait::async_trait;

use crate::core::errors::{TranslationError, TranslationResult};

/// One translated string plus the model's own confidence, when it reports one
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    pub model_confidence: Option<f32>,
}

impl Translation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_confidence: None,
        }
    }
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Model or provider name used in logs
    fn name(&self) -> &str;

    /// Translate one source text
    async fn translate(&self, text: &str) -> TranslationResult<Translation>;

    /// Retry with a fully rendered instruction prompt; the reply is the translation.
    ///
    /// Translators that cannot follow instructions keep the default, which
    /// re-translates `source_text` alone. Prompt-aware models override it.
    async fn translate_with_prompt(&self, prompt: &str, source_text: &str) -> TranslationResult<Translation> {
        let _ = prompt;
        self.translate(source_text).await
    }

    /// Translate several texts, preserving order
    async fn translate_batch(&self, texts: &[String]) -> TranslationResult<Vec<Translation>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.translate(text).await?);
        }
        Ok(out)
    }

    /// Translate a bubble split across a page seam, returning the raw model
    /// output which should be strict JSON `{"top": "...", "bottom": "..."}`
    async fn translate_split(&self, top_source: &str, bottom_source: &str) -> TranslationResult<String> {
        let _ = (top_source, bottom_source);
        Err(TranslationError::SplitModeUnsupported(self.name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Translator for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn translate(&self, text: &str) -> TranslationResult<Translation> {
            Ok(Translation::new(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_default_batch_preserves_order() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let out = Upper.translate_batch(&texts).await.unwrap();
        assert_eq!(out[0].text, "A");
        assert_eq!(out[1].text, "B");
    }

    #[tokio::test]
    async fn test_prompt_retry_defaults_to_source_text() {
        let out = Upper
            .translate_with_prompt("Translate again in at most 3 characters:\nabc", "abc")
            .await
            .unwrap();
        assert_eq!(out.text, "ABC");
    }

    #[tokio::test]
    async fn test_split_unsupported_by_default() {
        let err = Upper.translate_split("a", "b").await.unwrap_err();
        assert!(matches!(err, TranslationError::SplitModeUnsupported(name) if name == "upper"));
    }
}
