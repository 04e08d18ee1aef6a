use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::run::RunId;
use crate::step::StepId;

/// Identity and scope for a tool execution: who is running what, where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContext {
    pub tenant_id: String,
    pub run_id: RunId,
    pub step_id: StepId,
}

/// Raw payload a backend returns. The router wraps this into a
/// [`ToolExecutionResult`] with call metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    pub output: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<ProducedArtifact>,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Metered credits this call consumed, as reported by the backend.
    #[serde(default)]
    pub credits_used: i64,
}

impl BackendResponse {
    pub fn from_output(output: serde_json::Value) -> Self {
        Self {
            output,
            artifacts: Vec::new(),
            logs: Vec::new(),
            credits_used: 0,
        }
    }
}

/// Bytes produced by a tool call, destined for the artifact store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducedArtifact {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Uniform result shape returned by the router regardless of backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolExecutionResult {
    pub output: serde_json::Value,
    pub artifacts: Vec<ProducedArtifact>,
    pub logs: Vec<String>,
    pub credits_used: i64,
    pub metadata: ToolCallMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallMetadata {
    pub duration_ms: u64,
    pub backend: String,
    pub retry_count: u32,
    pub idempotency_key: String,
}

/// One execution backend (sandboxed runner, delegated internal capability,
/// ...). Deadlines are enforced by the router, not the backend.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Stable backend label recorded in call metadata.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<BackendResponse, ToolError>;
}
