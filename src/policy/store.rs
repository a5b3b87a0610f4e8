//! Regional policy model and store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Minimum multi-factor authentication level a region demands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum MfaLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Per-region configuration governing verifier selection and acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionalPolicy {
    /// Trust score at or above which a decision can be approved
    pub min_required_score: u8,
    /// Width of the manual-review band below `min_required_score`
    pub review_band: u8,
    /// Categories whose absence from the registry is fatal, in declared order
    #[serde(default)]
    pub required_categories: Vec<String>,
    /// Categories run when available, skipped silently when not
    #[serde(default)]
    pub optional_categories: Vec<String>,
    /// Per-category weight overrides
    #[serde(default)]
    pub weight_overrides: HashMap<String, u32>,
    /// Per-category deadline overrides
    #[serde(default)]
    pub timeout_overrides: HashMap<String, Duration>,
    /// When absent, the compliance table's level applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_mfa_level: Option<MfaLevel>,
    /// When absent, the compliance table's retention applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_years: Option<u32>,
    #[serde(default)]
    pub requires_dual_approval: bool,
}

impl Default for RegionalPolicy {
    fn default() -> Self {
        Self {
            min_required_score: 60,
            review_band: 10,
            required_categories: Vec::new(),
            optional_categories: Vec::new(),
            weight_overrides: HashMap::new(),
            timeout_overrides: HashMap::new(),
            min_mfa_level: None,
            retention_years: None,
            requires_dual_approval: false,
        }
    }
}

impl RegionalPolicy {
    pub fn new(min_required_score: u8) -> Self {
        Self {
            min_required_score,
            ..Self::default()
        }
    }

    pub fn require(mut self, category: impl Into<String>) -> Self {
        self.required_categories.push(category.into());
        self
    }

    pub fn optional(mut self, category: impl Into<String>) -> Self {
        self.optional_categories.push(category.into());
        self
    }

    pub fn with_weight(mut self, category: impl Into<String>, weight: u32) -> Self {
        self.weight_overrides.insert(category.into(), weight);
        self
    }

    pub fn with_timeout(mut self, category: impl Into<String>, timeout: Duration) -> Self {
        self.timeout_overrides.insert(category.into(), timeout);
        self
    }

    pub fn with_review_band(mut self, band: u8) -> Self {
        self.review_band = band;
        self
    }

    pub fn with_min_mfa_level(mut self, level: MfaLevel) -> Self {
        self.min_mfa_level = Some(level);
        self
    }

    pub fn with_dual_approval(mut self) -> Self {
        self.requires_dual_approval = true;
        self
    }

    /// Reject malformed policies at registration time.
    pub fn validate(&self) -> Result<()> {
        if self.min_required_score > 100 {
            return Err(Error::config(format!(
                "min_required_score {} exceeds 100",
                self.min_required_score
            )));
        }
        if self.weight_overrides.values().any(|w| *w == 0) {
            return Err(Error::config("weight overrides must be positive"));
        }
        if self.timeout_overrides.values().any(|t| t.is_zero()) {
            return Err(Error::config("timeout overrides must be non-zero"));
        }
        Ok(())
    }

    /// The score below which the decision is denied outright.
    pub fn deny_threshold(&self) -> u8 {
        self.min_required_score.saturating_sub(self.review_band)
    }
}

/// Per-region policy store with copy-on-write updates.
///
/// A region with no explicit entry falls through to the default policy;
/// the fall-through is logged so unknown regions are visible in operations.
pub struct PolicyStore {
    policies: RwLock<Arc<HashMap<String, Arc<RegionalPolicy>>>>,
    default_policy: Arc<RegionalPolicy>,
}

impl PolicyStore {
    pub fn new(default_policy: RegionalPolicy) -> Self {
        Self {
            policies: RwLock::new(Arc::new(HashMap::new())),
            default_policy: Arc::new(default_policy),
        }
    }

    /// Register or replace the policy for a region.
    pub async fn register(&self, region: impl Into<String>, policy: RegionalPolicy) -> Result<()> {
        policy.validate()?;
        let region = region.into();

        let mut guard = self.policies.write().await;
        let mut next = HashMap::clone(&guard);
        info!(region = %region, min_required_score = policy.min_required_score, "policy registered");
        next.insert(region, Arc::new(policy));
        *guard = Arc::new(next);
        Ok(())
    }

    /// Policy for a region, falling through to the default.
    ///
    /// In-flight decisions keep the `Arc` they captured; later updates
    /// publish a new map and never mutate a policy in place.
    pub async fn get(&self, region: &str) -> Arc<RegionalPolicy> {
        let guard = self.policies.read().await;
        match guard.get(region) {
            Some(policy) => Arc::clone(policy),
            None => {
                warn!(region, "no policy for region, using default");
                Arc::clone(&self.default_policy)
            }
        }
    }

    /// Whether a region has an explicit policy.
    pub async fn contains(&self, region: &str) -> bool {
        self.policies.read().await.contains_key(region)
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(RegionalPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_policy_values() {
        let policy = RegionalPolicy::default();
        assert_eq!(policy.min_required_score, 60);
        assert_eq!(policy.review_band, 10);
        assert!(policy.required_categories.is_empty());
        assert_eq!(policy.deny_threshold(), 50);
    }

    #[test]
    fn test_validate_rejects_bad_policies() {
        assert!(RegionalPolicy::new(101).validate().is_err());
        assert!(RegionalPolicy::default()
            .with_weight("identity", 0)
            .validate()
            .is_err());
        assert!(RegionalPolicy::default()
            .with_timeout("identity", Duration::ZERO)
            .validate()
            .is_err());
        assert!(RegionalPolicy::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_region_falls_through() {
        let store = PolicyStore::new(RegionalPolicy::new(42));
        let policy = store.get("ZZ").await;
        assert_eq!(policy.min_required_score, 42);
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let store = PolicyStore::default();
        store
            .register("BR", RegionalPolicy::new(70).require("identity"))
            .await
            .unwrap();

        let policy = store.get("BR").await;
        assert_eq!(policy.min_required_score, 70);
        assert_eq!(policy.required_categories, vec!["identity"]);
        assert!(store.contains("BR").await);
        assert!(!store.contains("US").await);
    }

    #[tokio::test]
    async fn test_inflight_policy_survives_replacement() {
        let store = PolicyStore::default();
        store.register("BR", RegionalPolicy::new(70)).await.unwrap();

        let captured = store.get("BR").await;
        store.register("BR", RegionalPolicy::new(90)).await.unwrap();

        assert_eq!(captured.min_required_score, 70);
        assert_eq!(store.get("BR").await.min_required_score, 90);
    }
}
