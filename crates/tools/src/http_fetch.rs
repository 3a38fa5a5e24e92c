//! HTTP fetch tool: GET a URL and return a bounded prefix of the body.
//!
//! Reports download progress as `tool-update` events and stops as soon as
//! the owning job is cancelled.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use weft_core::error::ToolError;
use weft_core::tool::{Tool, ToolContext, ToolResult};

const DEFAULT_MAX_BYTES: usize = 64 * 1024;
const HARD_MAX_BYTES: usize = 1024 * 1024;

pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

struct FetchArgs {
    url: String,
    max_bytes: usize,
}

fn parse_args(arguments: &serde_json::Value) -> Result<FetchArgs, ToolError> {
    let url = arguments["url"]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments("Missing 'url' argument".into()))?;

    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ToolError::InvalidArguments(
            "URL must start with http:// or https://".into(),
        ));
    }

    let max_bytes = arguments["max_bytes"]
        .as_u64()
        .map(|n| (n as usize).min(HARD_MAX_BYTES))
        .unwrap_or(DEFAULT_MAX_BYTES);

    Ok(FetchArgs {
        url: url.to_string(),
        max_bytes,
    })
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page or API endpoint with HTTP GET. Returns the status code and the \
         beginning of the response body."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Maximum body bytes to return (default 65536)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let args = parse_args(&arguments)?;
        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "http_fetch".into(),
            reason,
        };

        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled("http_fetch".into())),
            r = self.client.get(&args.url).send() => r.map_err(|e| failed(e.to_string()))?,
        };

        let status = response.status().as_u16();
        let mut body = Vec::new();
        let mut truncated = false;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled("http_fetch".into())),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;

            let room = args.max_bytes - body.len();
            if chunk.len() >= room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
            ctx.report(serde_json::json!({ "bytes": body.len() })).await;
        }

        Ok(ToolResult {
            call_id: ctx.call_id.clone(),
            success: (200..400).contains(&status),
            output: format!("HTTP {status}\n\n{}", String::from_utf8_lossy(&body)),
            data: Some(serde_json::json!({
                "status": status,
                "bytes": body.len(),
                "truncated": truncated,
            })),
        })
    }
}
