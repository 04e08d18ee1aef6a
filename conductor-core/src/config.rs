use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the engine. Defaults are safe for a single worker against
/// a local SQLite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on supervisor decide-act iterations per entry into the loop.
    pub max_iterations: u32,
    /// Estimated-token budget for the decision prompt; exceeding it triggers
    /// history compression.
    pub context_token_budget: u32,
    /// Generative planning attempts before the run fails with
    /// `planning_failed`.
    pub planning_attempts: u32,
    /// Per-call deadline for tool backends unless the route overrides it.
    #[serde(with = "duration_secs")]
    pub default_tool_timeout: Duration,
    /// Per-call deadline for the decision source.
    #[serde(with = "duration_secs")]
    pub decision_timeout: Duration,
    /// Retry budget for retryable routes.
    pub max_tool_retries: u32,
    /// Lifetime of idempotency-cache entries.
    #[serde(with = "duration_secs")]
    pub idempotency_ttl: Duration,
    /// Lifetime of a credit reservation.
    #[serde(with = "duration_secs")]
    pub reservation_ttl: Duration,
    /// Credits reserved up front when a run starts.
    pub initial_reserve: i64,
    /// Hard spend cap per run.
    pub max_reserve: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            context_token_budget: 64_000,
            planning_attempts: 3,
            default_tool_timeout: Duration::from_secs(60),
            decision_timeout: Duration::from_secs(120),
            max_tool_retries: 3,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            reservation_ttl: Duration::from_secs(60 * 60),
            initial_reserve: 100,
            max_reserve: 1_000,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let config = EngineConfig::default();
        let encoded = serde_json::to_string(&config).expect("serialize");
        let decoded: EngineConfig = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded.max_iterations, config.max_iterations);
        assert_eq!(decoded.default_tool_timeout, config.default_tool_timeout);
        assert_eq!(decoded.decision_timeout, config.decision_timeout);
    }
}
