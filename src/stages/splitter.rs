//! Splitter stages, thin wrappers over [`ingest_relay_core::chunk`].

use async_trait::async_trait;
use ingest_relay_core::chunk::{paragraph_chunks, window_chunks};
use ingest_relay_core::error::StageError;
use ingest_relay_core::models::{Content, TextChunk};
use ingest_relay_core::stage::{PipelineStageDescriptor, Splitter};
use serde_json::{json, Value};

pub fn paragraph() -> PipelineStageDescriptor {
    PipelineStageDescriptor::splitter("paragraph", ParagraphSplitter)
        .with_description("Packs paragraphs into chunks of at most max_tokens")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "max_tokens": { "type": "integer", "default": 700, "minimum": 1 }
            }
        }))
}

pub fn token() -> PipelineStageDescriptor {
    PipelineStageDescriptor::splitter("token", TokenSplitter)
        .with_description("Fixed windows of words; overlap is clamped below units")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "units": { "type": "integer", "default": 250, "minimum": 1 },
                "overlap": { "type": "integer", "default": 50, "minimum": 0 }
            }
        }))
}

pub struct ParagraphSplitter;

#[async_trait]
impl Splitter for ParagraphSplitter {
    async fn split(&self, content: &Content, config: &Value) -> Result<Vec<TextChunk>, StageError> {
        let max_tokens = config["max_tokens"].as_u64().unwrap_or(700) as usize;
        Ok(paragraph_chunks(&content.text, max_tokens))
    }
}

pub struct TokenSplitter;

#[async_trait]
impl Splitter for TokenSplitter {
    async fn split(&self, content: &Content, config: &Value) -> Result<Vec<TextChunk>, StageError> {
        let units = config["units"].as_u64().unwrap_or(250) as usize;
        let overlap = config["overlap"].as_u64().unwrap_or(50) as usize;
        Ok(window_chunks(&content.text, units, overlap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> Content {
        Content {
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_token_windows_follow_config() {
        let desc = token();
        let cfg = desc.prepare_config(&json!({ "units": 4, "overlap": 1 })).unwrap();
        let words = (0..10).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let chunks = TokenSplitter.split(&content(&words), &cfg).await.unwrap();
        assert_eq!(chunks[0].text, "w0 w1 w2 w3");
        assert_eq!(chunks[1].text, "w3 w4 w5 w6");
    }

    #[tokio::test]
    async fn test_paragraph_defaults() {
        let cfg = paragraph().prepare_config(&Value::Null).unwrap();
        assert_eq!(cfg["max_tokens"], 700);
        let chunks = ParagraphSplitter
            .split(&content("One.\n\nTwo."), &cfg)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(token().prepare_config(&json!({ "units": 0 })).is_err());
        assert!(paragraph().prepare_config(&json!({ "max_tokens": "big" })).is_err());
    }
}
