//! Decision history: the append-only audit stream.
//!
//! Every decision is serialized into a [`DecisionRecord`] and handed to a
//! pluggable [`HistorySink`]. Sinks are at-least-once durable: duplicate
//! records with the same `decision_id` may appear under retry and
//! consumers must be idempotent. Reads are optional; sinks without them
//! return [`Error::HistoryQueryUnavailable`].

mod file;
mod sqlite;
mod writer;

pub use file::FileHistorySink;
pub use sqlite::SqliteHistorySink;
pub use writer::{HistoryWriter, WriterConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::decision::{
    Anomaly, Decision, DecisionStatus, RecommendedAction, TrustLevel, VerifierResult,
};
use crate::error::{Error, Result};
use crate::request::VerificationRequest;

/// Default bound for the in-memory sink.
const DEFAULT_MAX_RECORDS: usize = 100_000;

/// Stable record format for sink consumers. Field order is unspecified;
/// consumers parse by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: Uuid,
    pub request_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub region: String,
    pub status: DecisionStatus,
    pub trust_score: u8,
    pub trust_level: TrustLevel,
    /// Keyed by category
    pub verifier_results: BTreeMap<String, VerifierResult>,
    pub anomalies: Vec<Anomaly>,
    pub recommended_action: RecommendedAction,
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: u64,
    /// Request context with sensitive values masked
    pub decision_context: HashMap<String, Value>,
    /// Retention demanded by the region's compliance dossier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_years: Option<u32>,
}

impl DecisionRecord {
    /// Build the record for a decision.
    pub fn new(
        decision: &Decision,
        request: &VerificationRequest,
        retention_years: Option<u32>,
    ) -> Self {
        Self {
            decision_id: decision.decision_id,
            request_id: decision.request_id.clone(),
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            region: request.region_code.clone(),
            status: decision.status,
            trust_score: decision.trust_score,
            trust_level: decision.trust_level,
            verifier_results: decision.verifier_results.clone(),
            anomalies: decision.anomalies.clone(),
            recommended_action: decision.recommended_action,
            timestamp: decision.timestamp,
            processing_time_ms: decision.processing_time_ms,
            decision_context: request.masked_context(),
            retention_years,
        }
    }
}

/// A pluggable destination for the audit stream.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Append one record. Must tolerate duplicate `decision_id`s.
    async fn append(&self, record: &DecisionRecord) -> Result<()>;

    /// Most recent records for a user within a tenant, newest first.
    async fn query(
        &self,
        user_id: &str,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let _ = (user_id, tenant_id, limit);
        Err(Error::HistoryQueryUnavailable)
    }

    /// Flush buffered records to durable storage.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Bounded in-memory sink; older records are pruned at capacity.
pub struct MemoryHistorySink {
    records: RwLock<VecDeque<DecisionRecord>>,
    max_records: usize,
}

impl MemoryHistorySink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }

    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            max_records: max_records.max(1),
        }
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for MemoryHistorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistorySink for MemoryHistorySink {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.push_back(record.clone());
        while records.len() > self.max_records {
            records.pop_front();
        }
        Ok(())
    }

    async fn query(
        &self,
        user_id: &str,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id && r.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
