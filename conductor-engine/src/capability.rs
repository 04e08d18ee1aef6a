use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::error::ToolError;
use conductor_core::tool::{BackendResponse, ToolBackend, ToolContext};
use tracing::debug;

/// One in-process capability: a named handler the engine can delegate a tool
/// call to without leaving the process.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        input: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<BackendResponse, ToolError>;
}

/// `ToolBackend` over a registry of in-process capabilities. The sandboxed
/// execution backend is an external implementor of `ToolBackend`; this one
/// covers the delegated-internal-capability kind.
#[derive(Default)]
pub struct CapabilityBackend {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }
}

#[async_trait]
impl ToolBackend for CapabilityBackend {
    fn name(&self) -> &str {
        "capability"
    }

    async fn execute(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<BackendResponse, ToolError> {
        let capability = self
            .capabilities
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound {
                tool_name: tool_name.to_string(),
            })?;
        debug!(tool_name, run_id = %ctx.run_id, "delegating to in-process capability");
        capability.invoke(input, ctx).await
    }
}
