pub mod translation;

// Re-export commonly used services
pub use translation::{ChatTranslator, Translation, TranslationMemo, Translator};
