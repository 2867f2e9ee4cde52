//! Loader stages.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use ingest_relay_core::error::StageError;
use ingest_relay_core::models::{Content, ContentEncoding, FileTransfer};
use ingest_relay_core::stage::{Loader, PipelineStageDescriptor};
use serde_json::{json, Value};
use tracing::debug;

pub fn basic() -> PipelineStageDescriptor {
    PipelineStageDescriptor::loader("basic", BasicLoader)
        .with_description("Reads inline text or base64-encoded UTF-8 content")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "max_bytes": {
                    "type": "integer",
                    "default": 10 * 1024 * 1024,
                    "minimum": 1,
                    "description": "Reject decoded content larger than this"
                }
            }
        }))
}

pub fn url() -> PipelineStageDescriptor {
    PipelineStageDescriptor::loader("url", UrlLoader)
        .with_description("Fetches the URL given as content; the page continues as a derived file")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "timeout_secs": { "type": "integer", "default": 20, "minimum": 1 },
                "strip_html": { "type": "boolean", "default": true }
            }
        }))
}

pub struct BasicLoader;

#[async_trait]
impl Loader for BasicLoader {
    async fn load(&self, raw: &FileTransfer, config: &Value) -> Result<Content, StageError> {
        let max_bytes = config["max_bytes"].as_u64().unwrap_or(u64::MAX);
        let text = decode_content(raw)?;
        if text.len() as u64 > max_bytes {
            return Err(StageError::Load(format!(
                "{} is {} bytes, limit is {}",
                raw.filename,
                text.len(),
                max_bytes
            )));
        }

        Ok(Content {
            title: Some(title_from_filename(&raw.filename)),
            metadata: json!({
                "extension": raw.extension,
                "file_size": raw.file_size,
            }),
            text,
            derived_name: None,
        })
    }
}

pub struct UrlLoader;

#[async_trait]
impl Loader for UrlLoader {
    async fn load(&self, raw: &FileTransfer, config: &Value) -> Result<Content, StageError> {
        let url = decode_content(raw)?.trim().to_string();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StageError::Load(format!("'{}' is not an http(s) URL", url)));
        }
        let timeout = Duration::from_secs(config["timeout_secs"].as_u64().unwrap_or(20));
        let strip = config["strip_html"].as_bool().unwrap_or(true);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::Load(e.to_string()))?;
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| StageError::Load(format!("fetching {}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StageError::Load(format!("fetching {}: HTTP {}", url, status)));
        }
        let body = response
            .text()
            .await
            .map_err(|e| StageError::Load(format!("reading {}: {}", url, e)))?;
        debug!(url = %url, bytes = body.len(), "page fetched");

        let title = html_title(&body);
        let text = if strip { strip_tags(&body) } else { body };
        Ok(Content {
            derived_name: Some(title.clone().unwrap_or_else(|| url.clone())),
            title,
            metadata: json!({ "url": url }),
            text,
        })
    }
}

fn decode_content(raw: &FileTransfer) -> Result<String, StageError> {
    match raw.content_encoding {
        ContentEncoding::Text => Ok(raw.content.clone()),
        ContentEncoding::Base64 => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(raw.content.trim())
                .map_err(|e| StageError::Load(format!("invalid base64 content: {}", e)))?;
            String::from_utf8(bytes)
                .map_err(|_| StageError::Load(format!("{} is not UTF-8 text", raw.filename)))
        }
    }
}

fn title_from_filename(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => filename.to_string(),
    }
}

fn is_block(tag: &str) -> bool {
    let name = tag
        .trim_start_matches('/')
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or_default();
    matches!(
        name,
        "p" | "br" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "section" | "article"
    )
}

fn html_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title>")?;
    let title = html[start..end].split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

/// Drop markup, `<script>` and `<style>` bodies included, and collapse
/// blank runs.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tag_and_after = &rest[open..];
        let Some(close) = tag_and_after.find('>') else {
            rest = "";
            break;
        };
        let tag = tag_and_after[1..close].to_ascii_lowercase();
        rest = &tag_and_after[close + 1..];
        for skipped in ["script", "style"] {
            if tag.starts_with(skipped) {
                let end_tag = format!("</{}", skipped);
                match rest.to_ascii_lowercase().find(&end_tag) {
                    Some(pos) => rest = &rest[pos..],
                    None => rest = "",
                }
            }
        }
        if is_block(&tag) {
            out.push('\n');
        }
    }
    out.push_str(rest);

    let mut text = String::with_capacity(out.len());
    for para in out
        .split('\n')
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
    {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&para);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(content: &str, encoding: ContentEncoding) -> FileTransfer {
        FileTransfer {
            file_id: "f1".to_string(),
            filename: "notes.md".to_string(),
            extension: "md".to_string(),
            source: String::new(),
            labels: vec![],
            content: content.to_string(),
            content_encoding: encoding,
            file_size: content.len() as u64,
            overwrite: false,
            pipeline: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_basic_text_and_base64() {
        let cfg = basic().prepare_config(&Value::Null).unwrap();
        let out = BasicLoader
            .load(&transfer("hello", ContentEncoding::Text), &cfg)
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(out.title.as_deref(), Some("notes"));
        assert!(out.derived_name.is_none());

        let encoded = base64::engine::general_purpose::STANDARD.encode("héllo");
        let out = BasicLoader
            .load(&transfer(&encoded, ContentEncoding::Base64), &cfg)
            .await
            .unwrap();
        assert_eq!(out.text, "héllo");
    }

    #[tokio::test]
    async fn test_basic_rejects_bad_input() {
        let cfg = basic().prepare_config(&json!({ "max_bytes": 3 })).unwrap();
        let err = BasicLoader
            .load(&transfer("hello", ContentEncoding::Text), &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Load(_)));

        let cfg = basic().prepare_config(&Value::Null).unwrap();
        let err = BasicLoader
            .load(&transfer("%%%", ContentEncoding::Base64), &cfg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[tokio::test]
    async fn test_url_rejects_non_http() {
        let cfg = url().prepare_config(&Value::Null).unwrap();
        let err = UrlLoader
            .load(&transfer("ftp://example.com", ContentEncoding::Text), &cfg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not an http(s) URL"));
    }

    #[test]
    fn test_html_helpers() {
        let html = "<html><head><title> Relay\n Docs </title><style>p{}</style></head>\
                    <body><h1>Intro</h1><p>First   para.</p><script>var x = 1;</script><p>Second.</p></body></html>";
        assert_eq!(html_title(html).as_deref(), Some("Relay Docs"));
        let text = strip_tags(html);
        assert!(text.contains("First para."));
        assert!(text.contains("Second."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("p{}"));
        assert_eq!(html_title("<p>no title</p>"), None);
    }
}
