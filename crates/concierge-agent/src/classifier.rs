//! Natural-language-to-structured-data seam

use async_trait::async_trait;
use concierge_core::Usage;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Structured arguments returned by a classification call
#[derive(Debug, Clone)]
pub struct Classification {
    pub value: serde_json::Value,
    pub usage: Usage,
}

/// Produces structured arguments from natural language.
///
/// Provider and prompt format are the implementor's concern.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, system_context: &str, user_context: &str) -> Result<Classification>;
}

/// Type alias for a shared classifier
pub type BoxedClassifier = Arc<dyn Classifier>;

/// Parse a JSON object out of model text, tolerating code fences and prose around it
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => Ok(serde_json::from_str(&trimmed[s..=e])?),
        _ => Err(Error::Classifier("no JSON object in response".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        let v = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_extract_json_fenced() {
        let v = extract_json("Sure!\n```json\n{\"steps\": []}\n```").unwrap();
        assert!(v["steps"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_extract_json_missing() {
        assert!(matches!(extract_json("no idea"), Err(Error::Classifier(_))));
    }
}
