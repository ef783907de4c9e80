//! Document parsing tool (PDF, DOCX, PPTX).
//!
//! The tool downloads the document and hands the bytes to the injected
//! [`DocumentParser`](crate::clients::DocumentParser); the parsers themselves
//! live outside this crate.

use serde::Deserialize;
use serde_json::json;

use super::{Caller, ResearchTool, ToolContext, ToolOutput};
use crate::config::{timeouts, ttl};
use crate::error::{FetchError, ToolError, ToolResult};
use crate::text::truncate_at_paragraph;

/// Content types routed to the parser contract.
const DOCUMENT_TYPES: &[(&str, &str)] = &[
    ("application/pdf", "pdf"),
    ("application/vnd.openxmlformats-officedocument.wordprocessingml.document", "docx"),
    ("application/vnd.openxmlformats-officedocument.presentationml.presentation", "pptx"),
];

/// Hard cap on downloaded document size (20 MB).
const MAX_DOCUMENT_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ParseDocumentInput {
    /// Document URL.
    pub url: String,

    /// Maximum characters of extracted text to return.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_max_length() -> usize {
    50_000
}

/// Download and extract text from a binary document.
pub struct ParseDocumentTool;

#[async_trait::async_trait]
impl ResearchTool for ParseDocumentTool {
    fn name(&self) -> &'static str {
        "parse_document"
    }

    fn title(&self) -> &'static str {
        "Parse Document"
    }

    fn description(&self) -> &'static str {
        "Download a PDF, DOCX, or PPTX document and extract its text content."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Document URL (http or https)"
                },
                "max_length": {
                    "type": "integer",
                    "minimum": 100,
                    "default": 50000
                }
            },
            "required": ["url"]
        })
    }

    fn cache_ttl(&self) -> Option<std::time::Duration> {
        Some(ttl::DOCUMENT)
    }

    fn timeout(&self) -> std::time::Duration {
        timeouts::DOCUMENT
    }

    fn dependency(&self) -> &'static str {
        "document_parse"
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _caller: &Caller,
        input: serde_json::Value,
    ) -> ToolResult<ToolOutput> {
        let params: ParseDocumentInput = serde_json::from_value(input)
            .map_err(|e| ToolError::validation("arguments", e.to_string()))?;

        let Some(parser) = &ctx.documents else {
            return Err(ToolError::internal("document parsing is not configured"));
        };

        let url = ctx
            .url_policy
            .validate(&params.url)
            .await
            .map_err(|rejection| ToolError::url_rejected(&params.url, rejection.rule))?;

        let response = ctx.http.get(url.clone()).send().await.map_err(FetchError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::UnexpectedStatus {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }
            .into());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .split(';')
            .next()
            .unwrap_or_default()
            .to_owned();

        let content_type = resolve_type(&content_type, url.path()).ok_or_else(|| {
            ToolError::validation("url", format!("unsupported document type '{content_type}'"))
        })?;

        let bytes = response.bytes().await.map_err(FetchError::from)?;
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(ToolError::validation(
                "url",
                format!("document exceeds {MAX_DOCUMENT_BYTES} bytes"),
            ));
        }

        let document = parser.parse(content_type, &bytes).await?;
        let (content, truncated) = truncate_at_paragraph(&document.content, params.max_length);

        Ok(ToolOutput::text(
            format!("# Document: {}\n\n{content}", url),
            json!({
                "url": url.to_string(),
                "contentType": content_type,
                "format": document.format,
                "content": content,
                "pageCount": document.page_count,
                "truncated": truncated,
                "originalLength": document.content.len(),
            }),
        ))
    }
}

/// Resolve the parser content type from the response header, falling back to
/// the URL extension when the server lies with `octet-stream`.
fn resolve_type(header: &str, path: &str) -> Option<&'static str> {
    for (mime, _) in DOCUMENT_TYPES {
        if header.eq_ignore_ascii_case(mime) {
            return Some(mime);
        }
    }

    let extension = path.rsplit('.').next()?.to_ascii_lowercase();
    match extension.as_str() {
        "pdf" => Some(DOCUMENT_TYPES[0].0),
        "docx" => Some(DOCUMENT_TYPES[1].0),
        "pptx" => Some(DOCUMENT_TYPES[2].0),
        _ => None,
    }
}
