//! Executor configuration

use serde::Deserialize;

use crate::dataloaders::CachePolicy;
use crate::{GraphQLError, Result};

/// Limits applied to connection fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    /// Largest accepted `first`/`last`. Unlimited when unset.
    pub max_page_size: Option<usize>,
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Reject operations nested deeper than this before executing them.
    pub max_depth: Option<usize>,
    /// Upper bound on drain rounds for one operation.
    pub max_drain_rounds: usize,
    /// Cache policy for loaders created through the request's registry.
    pub cache_policy: CachePolicy,
    pub pagination: PaginationConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            max_drain_rounds: 1000,
            cache_policy: CachePolicy::PerRound,
            pagination: PaginationConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Parse a JSON configuration document. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GraphQLError::Schema(format!("invalid executor config: {e}")))
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn max_page_size(mut self, size: usize) -> Self {
        self.pagination.max_page_size = Some(size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_partial_json() {
        let config = ExecutorConfig::from_json(
            r#"{"max_depth": 7, "cache_policy": "per_request", "pagination": {"max_page_size": 50}}"#,
        )
        .unwrap();
        assert_eq!(config.max_depth, Some(7));
        assert_eq!(config.cache_policy, CachePolicy::PerRequest);
        assert_eq!(config.pagination.max_page_size, Some(50));
        assert_eq!(config.max_drain_rounds, 1000);
    }

    #[test]
    fn test_config_rejects_unknown_policy() {
        assert!(ExecutorConfig::from_json(r#"{"cache_policy": "forever"}"#).is_err());
    }
}
