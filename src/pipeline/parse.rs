//! Extraction of the structured answer from raw generated text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// The JSON shape the augmented prompt asks the engine to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredAnswer {
    #[serde(alias = "Accuracy")]
    pub accuracy: String,
    #[serde(alias = "Text")]
    pub text: Vec<String>,
}

/// The answer did not contain a usable payload. These are the only errors worth regenerating for.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("answer contains no JSON object")]
    NoJsonObject,
    #[error("answer JSON has the wrong shape: {0}")]
    Shape(#[from] serde_json::Error),
}

fn object_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    // Shortest span from the first `{` to the next `}`, across newlines.
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{.*?\}").ok()).as_ref()
}

pub fn parse_answer(answer: &str) -> Result<StructuredAnswer, FormatError> {
    let object = object_pattern()
        .and_then(|pattern| pattern.find(answer))
        .ok_or(FormatError::NoJsonObject)?;
    Ok(serde_json::from_str(object.as_str())?)
}
