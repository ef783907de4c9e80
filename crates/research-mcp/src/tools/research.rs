//! Sequential research tracker.
//!
//! The server records multi-step research state per session and exposes it
//! as the `search://session/current` resource. The reasoning stays with the
//! caller; this tool only tracks steps, revisions, and branches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use super::{Caller, ResearchTool, ToolContext, ToolOutput};
use crate::error::{ToolError, ToolResult};

/// Resource URI for the current session's research state.
pub const SESSION_RESOURCE_URI: &str = "search://session/current";

/// One recorded research step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchStep {
    pub step_number: u32,
    pub total_steps_estimate: u32,
    pub search_step: String,
    pub next_step_needed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_gap: Option<String>,
    #[serde(default)]
    pub is_revision: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revises_step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub recorded_at: String,
}

/// Per-session research state.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchState {
    pub steps: Vec<ResearchStep>,
    /// Step numbers grouped by branch.
    pub branches: HashMap<String, Vec<u32>>,
    pub updated_at: String,
}

impl ResearchState {
    fn record(&mut self, step: ResearchStep) {
        if let Some(branch) = &step.branch_id {
            self.branches.entry(branch.clone()).or_default().push(step.step_number);
        }
        self.steps.push(step);
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// Session-keyed research state store.
#[derive(Debug, Default)]
pub struct ResearchTracker {
    sessions: RwLock<HashMap<String, ResearchState>>,
}

impl ResearchTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step and return the updated state snapshot.
    pub async fn record(&self, session_id: &str, step: ResearchStep) -> ResearchState {
        let mut sessions = self.sessions.write().await;
        let state = sessions.entry(session_id.to_owned()).or_default();
        state.record(step);
        state.clone()
    }

    /// Current state for a session.
    pub async fn get(&self, session_id: &str) -> Option<ResearchState> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Drop a session's state (session teardown).
    pub async fn clear(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}

/// Stateful research step tracker.
pub struct SequentialSearchTool;

#[async_trait::async_trait]
impl ResearchTool for SequentialSearchTool {
    fn name(&self) -> &'static str {
        "sequential_search"
    }

    fn title(&self) -> &'static str {
        "Sequential Search"
    }

    fn description(&self) -> &'static str {
        "Track a multi-step research process: record search steps, knowledge \
         gaps, revisions, and branches. The session's accumulated state is \
         exposed as the search://session/current resource."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "stepNumber": {"type": "integer", "minimum": 1},
                "totalStepsEstimate": {"type": "integer", "minimum": 1},
                "searchStep": {"type": "string", "description": "What this step investigates"},
                "nextStepNeeded": {"type": "boolean"},
                "source": {"type": "string", "description": "Source consulted in this step"},
                "knowledgeGap": {"type": "string", "description": "What is still unknown"},
                "isRevision": {"type": "boolean", "default": false},
                "revisesStep": {"type": "integer", "minimum": 1},
                "branchId": {"type": "string"}
            },
            "required": ["stepNumber", "totalStepsEstimate", "searchStep", "nextStepNeeded"]
        })
    }

    /// Stateful: never cached.
    fn cache_ttl(&self) -> Option<std::time::Duration> {
        None
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(5)
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        caller: &Caller,
        input: serde_json::Value,
    ) -> ToolResult<ToolOutput> {
        let mut step: ResearchStep = serde_json::from_value(input)
            .map_err(|e| ToolError::validation("arguments", e.to_string()))?;

        if step.step_number == 0 {
            return Err(ToolError::validation("stepNumber", "must be at least 1"));
        }
        if step.search_step.trim().is_empty() {
            return Err(ToolError::validation("searchStep", "cannot be empty"));
        }
        if step.is_revision && step.revises_step.is_none() {
            return Err(ToolError::validation(
                "revisesStep",
                "required when isRevision is true",
            ));
        }
        step.recorded_at = chrono::Utc::now().to_rfc3339();

        let session_id = caller.session_id.clone().unwrap_or_else(|| "stdio".to_owned());
        let next_step_needed = step.next_step_needed;
        let state = ctx.research.record(&session_id, step).await;

        let summary = format!(
            "Recorded step {} of ~{} ({} steps so far{})",
            state.steps.last().map_or(0, |s| s.step_number),
            state.steps.last().map_or(0, |s| s.total_steps_estimate),
            state.steps.len(),
            if state.branches.is_empty() {
                String::new()
            } else {
                format!(", {} branches", state.branches.len())
            }
        );

        Ok(ToolOutput::text(
            summary,
            json!({
                "sessionState": state,
                "nextStepNeeded": next_step_needed,
            }),
        )
        .with_resource(SESSION_RESOURCE_URI, "Current research session"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: u32, branch: Option<&str>) -> ResearchStep {
        ResearchStep {
            step_number: n,
            total_steps_estimate: 5,
            search_step: format!("step {n}"),
            next_step_needed: true,
            source: None,
            knowledge_gap: None,
            is_revision: false,
            revises_step: None,
            branch_id: branch.map(str::to_owned),
            recorded_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_steps_accumulate_per_session() {
        let tracker = ResearchTracker::new();

        tracker.record("s1", step(1, None)).await;
        let state = tracker.record("s1", step(2, None)).await;
        assert_eq!(state.steps.len(), 2);

        let other = tracker.record("s2", step(1, None)).await;
        assert_eq!(other.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_branches_tracked() {
        let tracker = ResearchTracker::new();
        tracker.record("s1", step(1, None)).await;
        tracker.record("s1", step(2, Some("alt"))).await;
        let state = tracker.record("s1", step(3, Some("alt"))).await;

        assert_eq!(state.branches["alt"], vec![2, 3]);
    }

    #[tokio::test]
    async fn test_clear_drops_state() {
        let tracker = ResearchTracker::new();
        tracker.record("s1", step(1, None)).await;
        tracker.clear("s1").await;
        assert!(tracker.get("s1").await.is_none());
    }

    #[test]
    fn test_input_parses_camel_case() {
        let step: ResearchStep = serde_json::from_value(json!({
            "stepNumber": 2,
            "totalStepsEstimate": 4,
            "searchStep": "check primary sources",
            "nextStepNeeded": true,
            "isRevision": true,
            "revisesStep": 1
        }))
        .unwrap();
        assert_eq!(step.step_number, 2);
        assert!(step.is_revision);
        assert_eq!(step.revises_step, Some(1));
    }
}
