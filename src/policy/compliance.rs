//! Compliance metadata table.
//!
//! Per-region regulatory dossier. Consulted by scoring (MFA-level
//! fallback when the policy omits one), the history writer (retention),
//! and the engine façade (dual-approval marking in the decision audit map).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::MfaLevel;
use crate::error::{Error, Result};

/// Regulatory metadata for one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceMetadata {
    /// Framework name, e.g. "LGPD" or "GDPR"
    pub framework: String,
    pub requires_dual_approval: bool,
    pub min_mfa_level: MfaLevel,
    pub retention_years: u32,
}

impl ComplianceMetadata {
    pub fn new(framework: impl Into<String>, retention_years: u32) -> Self {
        Self {
            framework: framework.into(),
            requires_dual_approval: false,
            min_mfa_level: MfaLevel::Low,
            retention_years,
        }
    }

    pub fn with_min_mfa_level(mut self, level: MfaLevel) -> Self {
        self.min_mfa_level = level;
        self
    }

    pub fn with_dual_approval(mut self) -> Self {
        self.requires_dual_approval = true;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.framework.is_empty() {
            return Err(Error::config("compliance framework name is empty"));
        }
        if self.retention_years == 0 {
            return Err(Error::config("retention_years must be positive"));
        }
        Ok(())
    }
}

/// Per-region compliance table with copy-on-write updates.
#[derive(Default)]
pub struct ComplianceTable {
    entries: RwLock<Arc<HashMap<String, Arc<ComplianceMetadata>>>>,
}

impl ComplianceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the dossier for a region.
    pub async fn register(
        &self,
        region: impl Into<String>,
        metadata: ComplianceMetadata,
    ) -> Result<()> {
        metadata.validate()?;
        let region = region.into();

        let mut guard = self.entries.write().await;
        let mut next = HashMap::clone(&guard);
        info!(region = %region, framework = %metadata.framework, "compliance metadata registered");
        next.insert(region, Arc::new(metadata));
        *guard = Arc::new(next);
        Ok(())
    }

    /// Dossier for a region, if registered.
    pub async fn get(&self, region: &str) -> Option<Arc<ComplianceMetadata>> {
        self.entries.read().await.get(region).map(Arc::clone)
    }
}
