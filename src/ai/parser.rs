//! Structured response parsing — pulls a JSON object out of free-form model
//! output (fenced or bare) and decodes it into a typed structure.

use serde::de::DeserializeOwned;

use crate::error::AiError;

/// Extract and decode a JSON object from raw completion text.
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, AiError> {
    let json = extract_json_object(raw);
    serde_json::from_str(&json).map_err(|e| AiError::InvalidResponse {
        reason: format!("JSON decode failed: {e}"),
    })
}

/// Extract a JSON object from model output.
///
/// Handles, in order: a bare object, a ```json fenced block, a generic
/// fenced block containing an object, and an object embedded in prose.
/// Returns the input trimmed when nothing object-shaped is found (the
/// decode step then produces the error).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(inner) = fenced_block(trimmed, "```json") {
        return inner;
    }
    if let Some(inner) = fenced_block(trimmed, "```")
        && inner.starts_with('{')
    {
        return inner;
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Contents of the first fenced block opened by `fence`, if closed.
fn fenced_block(text: &str, fence: &str) -> Option<String> {
    let start = text.find(fence)?;
    let after = &text[start + fence.len()..];
    let end = after.find("```")?;
    Some(after[..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        value: i64,
    }

    #[test]
    fn extract_bare_object() {
        let input = r#"{"value": 1}"#;
        assert_eq!(extract_json_object(input), input);
    }

    #[test]
    fn extract_json_fenced_block() {
        let input = "Here you go:\n```json\n{\"value\": 2}\n```\nDone.";
        assert_eq!(extract_json_object(input), r#"{"value": 2}"#);
    }

    #[test]
    fn extract_generic_fenced_block() {
        let input = "```\n{\"value\": 3}\n```";
        assert_eq!(extract_json_object(input), r#"{"value": 3}"#);
    }

    #[test]
    fn extract_object_embedded_in_prose() {
        let input = "My answer is {\"value\": 4} as requested.";
        assert_eq!(extract_json_object(input), r#"{"value": 4}"#);
    }

    #[test]
    fn decode_typed_value() {
        let sample: Sample = decode_json("```json\n{\"value\": 5}\n```").unwrap();
        assert_eq!(sample.value, 5);
    }

    #[test]
    fn decode_rejects_non_json() {
        let result: Result<Sample, _> = decode_json("no structure here at all");
        assert!(matches!(
            result,
            Err(AiError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let result: Result<Sample, _> = decode_json(r#"{"value": "not a number"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unclosed_fence_falls_back_to_object_bounds() {
        let input = "```json\n{\"value\": 6}";
        let extracted = extract_json_object(input);
        assert!(extracted.starts_with('{'));
        assert!(extracted.ends_with('}'));
    }
}
