use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::PipelineError;

/// How a model response was decoded. Callers can tell a clean structured answer apart
/// from one salvaged out of free text.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Strict(T),
    Tolerant(T),
}

impl<T> Decoded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Strict(value) | Self::Tolerant(value) => value,
        }
    }

    pub fn is_tolerant(&self) -> bool {
        matches!(self, Self::Tolerant(_))
    }
}

/// Fenced ```json block, then any fenced block that looks like JSON, then the span from
/// the first `{` to the last `}` (or `[` to `]`).
pub fn extract_json_block(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Some(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') || block.starts_with('[') {
                return Some(block);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && start < end
        {
            return Some(&trimmed[start..=end]);
        }
    }

    None
}

/// Strict decode of a structured payload first; tolerant extraction from text second.
pub fn decode_response<T: DeserializeOwned>(
    structured: Option<&Value>,
    text: &str,
) -> Result<Decoded<T>, PipelineError> {
    if let Some(value) = structured
        && let Ok(parsed) = serde_json::from_value::<T>(value.clone())
    {
        return Ok(Decoded::Strict(parsed));
    }

    if let Ok(parsed) = serde_json::from_str::<T>(text.trim()) {
        return Ok(Decoded::Strict(parsed));
    }

    let Some(block) = extract_json_block(text) else {
        return Err(PipelineError::Schema(
            "no JSON object found in model response".to_string(),
        ));
    };

    serde_json::from_str::<T>(block)
        .map(Decoded::Tolerant)
        .map_err(|err| PipelineError::Schema(format!("model response JSON did not decode: {err}")))
}
