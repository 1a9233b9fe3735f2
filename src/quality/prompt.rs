// Retry prompt templates with named `{placeholder}` substitution

use std::collections::HashMap;

use crate::core::errors::{PromptError, PromptResult};

/// Placeholders every retry template must contain
pub const REQUIRED_PLACEHOLDERS: [&str; 3] = ["max_chars", "source_text", "glossary_terms"];

const DEFAULT_RETRY_TEMPLATE: &str = "The previous translation of this manga speech bubble was rejected by a quality check. \
Translate the source text again. The result must fit in at most {max_chars} characters, \
read naturally as spoken dialogue, and keep punctuation balanced. \
Use these glossary terms where they apply:\n{glossary_terms}\n\n\
Only output the translation, nothing else.\n\nSource text:\n{source_text}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template; `{{` and `}}` produce literal braces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    /// Parse a template, requiring all of [`REQUIRED_PLACEHOLDERS`]
    pub fn parse(template: &str) -> PromptResult<Self> {
        let segments = tokenize(template)?;
        for required in REQUIRED_PLACEHOLDERS {
            let present = segments
                .iter()
                .any(|s| matches!(s, Segment::Placeholder(name) if name == required));
            if !present {
                return Err(PromptError::MissingRequired(required));
            }
        }
        Ok(Self { segments })
    }

    pub fn default_retry() -> Self {
        Self {
            segments: tokenize(DEFAULT_RETRY_TEMPLATE).unwrap_or_default(),
        }
    }

    /// Substitute every placeholder; any placeholder without a value is an error
    pub fn render(&self, values: &HashMap<&str, String>) -> PromptResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = values
                        .get(name.as_str())
                        .ok_or_else(|| PromptError::MissingValue(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }
}

fn tokenize(template: &str) -> PromptResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                literal.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, nc) in chars.by_ref() {
                    if nc == '}' {
                        closed = true;
                        break;
                    }
                    name.push(nc);
                }
                if !closed {
                    return Err(PromptError::Unclosed(pos));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(name.trim().to_string()));
            }
            _ => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> HashMap<&'static str, String> {
        HashMap::from([
            ("max_chars", "12".to_string()),
            ("source_text", "너무 좋아".to_string()),
            ("glossary_terms", "(none)".to_string()),
        ])
    }

    #[test]
    fn test_default_template_renders() {
        let template = PromptTemplate::default_retry();
        let prompt = template.render(&values()).unwrap();
        assert!(prompt.contains("at most 12 characters"));
        assert!(prompt.ends_with("너무 좋아"));
        let mut names: Vec<&str> = template.placeholders().collect();
        names.sort();
        assert_eq!(names, vec!["glossary_terms", "max_chars", "source_text"]);
    }

    #[test]
    fn test_missing_required_placeholder() {
        let err = PromptTemplate::parse("Translate {source_text} in {max_chars}").unwrap_err();
        assert_eq!(err, PromptError::MissingRequired("glossary_terms"));
    }

    #[test]
    fn test_missing_value_is_error() {
        let template = PromptTemplate::parse("{source_text}|{max_chars}|{glossary_terms}").unwrap();
        let mut partial = values();
        partial.remove("max_chars");
        assert_eq!(
            template.render(&partial).unwrap_err(),
            PromptError::MissingValue("max_chars".to_string())
        );
    }

    #[test]
    fn test_escaped_braces() {
        let template =
            PromptTemplate::parse("{{\"text\": \"{source_text}\"}} {max_chars} {glossary_terms}").unwrap();
        let prompt = template.render(&values()).unwrap();
        assert!(prompt.starts_with("{\"text\": \"너무 좋아\"}"));
    }

    #[test]
    fn test_unclosed_placeholder() {
        assert_eq!(
            PromptTemplate::parse("{source_text").unwrap_err(),
            PromptError::Unclosed(0)
        );
    }
}
