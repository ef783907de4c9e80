//! Tool dispatch: lookup, validation, scope enforcement, caching, deadline,
//! and circuit breaking around every `tools/call`.

use std::sync::Arc;

use crate::cache::CacheOptions;
use crate::error::{ErrorKind, ToolError, ToolResult};
use crate::protocol::JsonRpcResponse;
use crate::security::scopes_cover;

use super::{Caller, ResearchTool, ToolContext, schema};

/// Routes `tools/*` requests to registered tools.
pub struct Dispatcher {
    tools: Vec<Arc<dyn ResearchTool>>,
    ctx: Arc<ToolContext>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(tools: Vec<Arc<dyn ResearchTool>>, ctx: Arc<ToolContext>) -> Self {
        Self { tools, ctx }
    }

    /// Registered tools.
    #[must_use]
    pub fn tools(&self) -> &[Arc<dyn ResearchTool>] {
        &self.tools
    }

    /// Shared tool context.
    #[must_use]
    pub fn context(&self) -> &Arc<ToolContext> {
        &self.ctx
    }

    /// Find a tool by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<dyn ResearchTool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Scope a tool requires, for transport-level pre-checks.
    #[must_use]
    pub fn required_scope(&self, name: &str) -> Option<String> {
        self.find(name).map(|t| t.required_scope())
    }

    /// `tools/list` payload.
    #[must_use]
    pub fn tool_list(&self) -> serde_json::Value {
        let tools: Vec<serde_json::Value> = self
            .tools
            .iter()
            .map(|t| {
                let mut entry = serde_json::json!({
                    "name": t.name(),
                    "title": t.title(),
                    "description": t.description(),
                    "inputSchema": t.input_schema(),
                });
                if let Some(output) = t.output_schema() {
                    entry["outputSchema"] = output;
                }
                entry
            })
            .collect();
        serde_json::json!({"tools": tools})
    }

    /// Handle a `tools/call` request end to end.
    pub async fn call_tool(
        &self,
        id: Option<serde_json::Value>,
        params: &serde_json::Value,
        caller: &Caller,
    ) -> JsonRpcResponse {
        let Some(tool_name) = params.get("name").and_then(|v| v.as_str()) else {
            return JsonRpcResponse::error_kind(
                id,
                ErrorKind::InvalidParams,
                "Missing 'name' parameter",
                None,
            );
        };

        let Some(tool) = self.find(tool_name) else {
            return JsonRpcResponse::error_kind(
                id,
                ErrorKind::MethodNotFound,
                format!("Tool not found: {tool_name}"),
                None,
            );
        };

        let arguments = params.get("arguments").cloned().unwrap_or(serde_json::json!({}));
        if let Err(detail) = schema::require_object(&arguments) {
            return JsonRpcResponse::error_kind(id, ErrorKind::InvalidParams, detail, None);
        }

        if let Some(scopes) = &caller.scopes {
            let required = tool.required_scope();
            if !scopes_cover(scopes, &required) {
                return JsonRpcResponse::error_kind(
                    id,
                    ErrorKind::InsufficientScope,
                    format!("Missing required scope: {required}"),
                    Some(serde_json::json!({"requiredScope": required})),
                );
            }
        }

        tracing::info!(tool = %tool_name, session = ?caller.session_id, "Executing tool");

        let result = match tool.cache_ttl() {
            Some(ttl) => {
                let opts = CacheOptions {
                    ttl: Some(ttl),
                    stale_while_revalidate: true,
                    ..Default::default()
                };
                let tool = Arc::clone(&tool);
                let ctx = Arc::clone(&self.ctx);
                let caller = caller.clone();
                let args = arguments.clone();
                self.ctx
                    .cache
                    .get_or_compute(tool_name, &arguments, opts, move || async move {
                        execute_guarded(&tool, &ctx, &caller, args).await
                    })
                    .await
            }
            None => execute_guarded(&tool, &self.ctx, caller, arguments).await,
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                tracing::warn!(tool = %tool_name, error = %e, "Tool execution failed");
                error_response(id, &e)
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("tools", &self.tools.len()).finish()
    }
}

/// Run one tool under its deadline and circuit breaker, returning the
/// assembled MCP result value.
async fn execute_guarded(
    tool: &Arc<dyn ResearchTool>,
    ctx: &Arc<ToolContext>,
    caller: &Caller,
    args: serde_json::Value,
) -> ToolResult<serde_json::Value> {
    let breaker = ctx.breakers.get(tool.dependency());
    if let Err(retry_after) = breaker.try_acquire() {
        return Err(ToolError::CircuitOpen {
            dependency: tool.dependency().to_owned(),
            retry_after,
        });
    }

    let deadline = tool.timeout();
    let outcome = tokio::time::timeout(deadline, tool.execute(ctx, caller, args)).await;

    let output = match outcome {
        Err(_elapsed) => {
            breaker.record_failure();
            return Err(ToolError::Timeout(deadline));
        }
        Ok(Err(e)) => {
            if counts_as_dependency_failure(&e) {
                breaker.record_failure();
            }
            return Err(e);
        }
        Ok(Ok(output)) => {
            breaker.record_success();
            output
        }
    };

    if let Some(schema) = tool.output_schema() {
        if let Err(detail) = schema::validate_output(&schema, &output.structured) {
            return Err(ToolError::internal(format!("output contract violation: {detail}")));
        }
    }

    // MCP content annotations on every block.
    let annotated: Vec<serde_json::Value> = output
        .content
        .into_iter()
        .map(|mut block| {
            if block.get("annotations").is_none() {
                block["annotations"] = serde_json::json!({
                    "audience": ["assistant"],
                    "priority": 0.8,
                    "lastModified": chrono::Utc::now().to_rfc3339(),
                });
            }
            block
        })
        .collect();

    Ok(serde_json::json!({
        "content": annotated,
        "structuredContent": output.structured,
    }))
}

fn counts_as_dependency_failure(error: &ToolError) -> bool {
    matches!(error.kind(), ErrorKind::UpstreamFailure | ErrorKind::UpstreamTimeout)
}

/// Map a tool error onto the wire with typed data.
fn error_response(id: Option<serde_json::Value>, error: &ToolError) -> JsonRpcResponse {
    let kind = error.kind();
    let mut data = serde_json::json!({"retryable": kind.is_retryable()});

    match error {
        ToolError::UrlRejected { rule, .. } => {
            data["rule"] = serde_json::json!(rule);
        }
        ToolError::CircuitOpen { dependency, retry_after } => {
            data["dependency"] = serde_json::json!(dependency);
            data["retryAfterMs"] = serde_json::json!(retry_after.as_millis());
        }
        ToolError::Transcript { kind: transcript_kind, .. } => {
            data["transcriptError"] = serde_json::json!(transcript_kind);
        }
        ToolError::Validation { field, .. } => {
            data["field"] = serde_json::json!(field);
        }
        _ => {}
    }

    JsonRpcResponse::error_kind(id, kind, error.to_user_message(), Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutput;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait::async_trait]
    impl ResearchTool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn title(&self) -> &'static str {
            "Echo"
        }
        fn description(&self) -> &'static str {
            "Echoes input back"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn cache_ttl(&self) -> Option<Duration> {
            None
        }
        async fn execute(
            &self,
            _ctx: &ToolContext,
            _caller: &Caller,
            input: serde_json::Value,
        ) -> ToolResult<ToolOutput> {
            Ok(ToolOutput::text("ok", input))
        }
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl ResearchTool for SlowTool {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn title(&self) -> &'static str {
            "Slow"
        }
        fn description(&self) -> &'static str {
            "Never finishes in time"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn cache_ttl(&self) -> Option<Duration> {
            None
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
        async fn execute(
            &self,
            _ctx: &ToolContext,
            _caller: &Caller,
            _input: serde_json::Value,
        ) -> ToolResult<ToolOutput> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::text("late", serde_json::json!({})))
        }
    }

    async fn test_dispatcher(tools: Vec<Arc<dyn ResearchTool>>) -> Dispatcher {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::server::build_tool_context(
            &crate::config::Config::for_testing(dir.path()),
        )
        .await
        .unwrap();
        // Leak the tempdir: cache files outlive this guard in tests.
        std::mem::forget(dir);
        Dispatcher::new(tools, ctx)
    }

    #[tokio::test]
    async fn test_unknown_tool_is_method_not_found() {
        let dispatcher = test_dispatcher(vec![Arc::new(EchoTool)]).await;
        let response = dispatcher
            .call_tool(
                Some(serde_json::json!(1)),
                &serde_json::json!({"name": "nope", "arguments": {}}),
                &Caller::default(),
            )
            .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_non_object_arguments_rejected() {
        let dispatcher = test_dispatcher(vec![Arc::new(EchoTool)]).await;
        let response = dispatcher
            .call_tool(
                Some(serde_json::json!(1)),
                &serde_json::json!({"name": "echo", "arguments": [1, 2]}),
                &Caller::default(),
            )
            .await;
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_scope_enforced_when_present() {
        let dispatcher = test_dispatcher(vec![Arc::new(EchoTool)]).await;

        let caller = Caller {
            scopes: Some(vec!["mcp:tool:other:execute".to_owned()]),
            ..Default::default()
        };
        let response = dispatcher
            .call_tool(
                Some(serde_json::json!(1)),
                &serde_json::json!({"name": "echo", "arguments": {}}),
                &caller,
            )
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorKind::InsufficientScope.code());

        // Composite scope covers it.
        let caller = Caller { scopes: Some(vec!["mcp:tool".to_owned()]), ..Default::default() };
        let response = dispatcher
            .call_tool(
                Some(serde_json::json!(2)),
                &serde_json::json!({"name": "echo", "arguments": {}}),
                &caller,
            )
            .await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_success_carries_annotations() {
        let dispatcher = test_dispatcher(vec![Arc::new(EchoTool)]).await;
        let response = dispatcher
            .call_tool(
                Some(serde_json::json!(1)),
                &serde_json::json!({"name": "echo", "arguments": {"q": 1}}),
                &Caller::default(),
            )
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["structuredContent"]["q"], 1);
        assert!(result["content"][0]["annotations"]["audience"].is_array());
    }

    #[tokio::test]
    async fn test_timeout_yields_typed_error() {
        let dispatcher = test_dispatcher(vec![Arc::new(SlowTool)]).await;
        let response = dispatcher
            .call_tool(
                Some(serde_json::json!(1)),
                &serde_json::json!({"name": "slow", "arguments": {}}),
                &Caller::default(),
            )
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorKind::UpstreamTimeout.code());
        assert_eq!(error.data.unwrap()["kind"], "UpstreamTimeout");
    }
}
