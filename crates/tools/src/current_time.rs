//! Clock tool: reports the current date and time.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use weft_core::error::ToolError;
use weft_core::tool::{Tool, ToolContext, ToolResult};

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time, optionally in a fixed UTC offset."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "description": "Offset from UTC in minutes, e.g. 330 for India, -300 for US Eastern",
                    "default": 0
                }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let minutes = match arguments.get("utc_offset_minutes") {
            None | Some(serde_json::Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                ToolError::InvalidArguments("'utc_offset_minutes' must be an integer".into())
            })?,
        };

        let offset = i32::try_from(minutes * 60)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ToolError::InvalidArguments(format!("UTC offset out of range: {minutes} minutes")))?;

        let now = Utc::now().with_timezone(&offset);
        Ok(ToolResult {
            call_id: ctx.call_id.clone(),
            success: true,
            output: now.to_rfc3339(),
            data: Some(serde_json::json!({
                "unix": now.timestamp(),
                "weekday": now.format("%A").to_string(),
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolContext {
        ToolContext::new("t1", CancellationToken::new())
    }

    #[tokio::test]
    async fn defaults_to_utc() {
        let result = CurrentTimeTool.execute(serde_json::json!({}), &ctx()).await.unwrap();
        assert!(result.success);
        assert!(result.output.ends_with("+00:00"));
        assert_eq!(result.call_id, "t1");
    }

    #[tokio::test]
    async fn applies_offset() {
        let result = CurrentTimeTool
            .execute(serde_json::json!({"utc_offset_minutes": 330}), &ctx())
            .await
            .unwrap();
        assert!(result.output.ends_with("+05:30"));
    }

    #[tokio::test]
    async fn rejects_bad_offsets() {
        let err = CurrentTimeTool
            .execute(serde_json::json!({"utc_offset_minutes": 100000}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let err = CurrentTimeTool
            .execute(serde_json::json!({"utc_offset_minutes": "soon"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
