pub mod chat_client;
pub mod memo;
pub mod translator;

pub use chat_client::ChatTranslator;
pub use memo::TranslationMemo;
pub use translator::{Translation, Translator};
