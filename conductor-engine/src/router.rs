use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor_core::config::EngineConfig;
use conductor_core::error::{ConductorError, ToolError};
use conductor_core::tool::{ToolBackend, ToolCallMetadata, ToolContext, ToolExecutionResult};
use conductor_store::IdempotencyCache;
use tracing::{info, warn};

/// Routing entry for one tool name: which backend serves it and how hard the
/// router may push on failure.
#[derive(Clone)]
pub struct ToolRoute {
    pub backend: Arc<dyn ToolBackend>,
    pub retryable: bool,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl ToolRoute {
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            backend,
            retryable: true,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Router output: the uniform result plus whether it came from the
/// idempotency cache (a cache hit already paid for itself).
#[derive(Debug, Clone)]
pub struct RoutedCall {
    pub result: ToolExecutionResult,
    pub cache_hit: bool,
}

/// Dispatches tool calls to backends with per-route deadlines, bounded
/// retries with exponential backoff, and an idempotency cache in front.
pub struct ToolRouter {
    routes: HashMap<String, ToolRoute>,
    cache: IdempotencyCache,
    config: EngineConfig,
    // Base of the exponential backoff. Tests shrink this to zero so retry
    // paths run on the real clock without waiting out the schedule.
    backoff_base_ms: u64,
}

impl ToolRouter {
    pub fn new(cache: IdempotencyCache, config: EngineConfig) -> Self {
        Self {
            routes: HashMap::new(),
            cache,
            config,
            backoff_base_ms: 1_000,
        }
    }

    pub fn register(&mut self, tool_name: impl Into<String>, route: ToolRoute) {
        self.routes.insert(tool_name.into(), route);
    }

    pub fn cache(&self) -> &IdempotencyCache {
        &self.cache
    }

    /// Execute `tool_name` under `idempotency_key`. The same key always
    /// yields the same result without re-invoking the backend, for as long
    /// as the cache entry lives.
    pub async fn execute(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        ctx: &ToolContext,
        idempotency_key: &str,
    ) -> Result<RoutedCall, ConductorError> {
        if let Some(cached) = self.cache.get(idempotency_key).await? {
            info!(tool_name, idempotency_key, "idempotency cache hit");
            return Ok(RoutedCall {
                result: cached,
                cache_hit: true,
            });
        }

        let route = self.routes.get(tool_name).ok_or(ToolError::NotFound {
            tool_name: tool_name.to_string(),
        })?;
        let deadline = route.timeout.unwrap_or(self.config.default_tool_timeout);
        let max_retries = if route.retryable {
            route.max_retries.unwrap_or(self.config.max_tool_retries)
        } else {
            0
        };

        let started = Instant::now();
        let mut attempt: u32 = 0;
        let response = loop {
            let call = route.backend.execute(tool_name, input, ctx);
            let outcome = match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout {
                    tool_name: tool_name.to_string(),
                    elapsed: deadline,
                }),
            };

            match outcome {
                Ok(response) => break response,
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    let backoff = backoff_ms(self.backoff_base_ms, attempt);
                    warn!(
                        tool_name,
                        attempt,
                        backoff_ms = backoff,
                        error = %err,
                        "tool call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let result = ToolExecutionResult {
            output: response.output,
            artifacts: response.artifacts,
            logs: response.logs,
            credits_used: response.credits_used,
            metadata: ToolCallMetadata {
                duration_ms: started.elapsed().as_millis() as u64,
                backend: route.backend.name().to_string(),
                retry_count: attempt,
                idempotency_key: idempotency_key.to_string(),
            },
        };

        self.cache
            .put(idempotency_key, &result, self.config.idempotency_ttl)
            .await?;
        info!(
            tool_name,
            backend = result.metadata.backend,
            duration_ms = result.metadata.duration_ms,
            retries = attempt,
            "tool call completed"
        );

        Ok(RoutedCall {
            result,
            cache_hit: false,
        })
    }
}

fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    (base_ms << attempt.min(4)).min(base_ms.saturating_mul(10))
}
