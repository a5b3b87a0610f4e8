//! Decision model: per-verifier results, anomalies, and the synthesized
//! decision returned to callers and appended to the history sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Outcome of a single verifier invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierStatus {
    /// All inspected fields verified
    Ok,
    /// Some fields verified, some did not
    Partial,
    /// The verifier ran and rejected one or more fields
    Failed,
    /// The verifier could not run to completion
    Error,
    /// The verifier exceeded its deadline
    Timeout,
}

impl VerifierStatus {
    /// Whether this status satisfies a required-category check.
    pub fn is_acceptable(self) -> bool {
        matches!(self, Self::Ok | Self::Partial)
    }
}

impl std::fmt::Display for VerifierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Result produced by exactly one verifier invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierResult {
    /// Category, unique within a decision
    pub category: String,
    /// Invocation outcome
    pub status: VerifierStatus,
    /// Score in [0, 100]
    pub score: u8,
    /// Fields that did not verify; empty for `ok`
    #[serde(default)]
    pub failed_fields: Vec<String>,
    /// Short diagnostic; never contains unmasked PII
    pub description: String,
    /// Wall time spent in the verifier
    pub processing_time_ms: u64,
}

impl VerifierResult {
    /// Create a passing result.
    pub fn ok(category: impl Into<String>, score: u8) -> Self {
        Self {
            category: category.into(),
            status: VerifierStatus::Ok,
            score: score.min(100),
            failed_fields: Vec::new(),
            description: String::new(),
            processing_time_ms: 0,
        }
    }

    /// Create a result with an explicit status and failed fields.
    pub fn with_status(
        category: impl Into<String>,
        status: VerifierStatus,
        score: u8,
        failed_fields: Vec<String>,
    ) -> Self {
        Self {
            category: category.into(),
            status,
            score: score.min(100),
            failed_fields,
            description: String::new(),
            processing_time_ms: 0,
        }
    }

    /// Set the diagnostic description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the processing time.
    pub fn with_processing_time(mut self, ms: u64) -> Self {
        self.processing_time_ms = ms;
        self
    }
}

/// Severity of an anomaly, derived from the originating result's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    /// Severity bucket for a result score.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=19 => Self::Critical,
            20..=39 => Self::High,
            40..=59 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// A failed-field report promoted to decision level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// `"<category>_anomaly"` for verifier-originated anomalies
    pub kind: String,
    pub severity: AnomalySeverity,
    pub description: String,
    /// How the anomaly was detected
    pub detection_method: String,
    /// Fields the anomaly concerns
    #[serde(default)]
    pub affected_fields: Vec<String>,
    /// `(100 − score) / 100` of the originating result
    pub confidence: f64,
}

/// Decision status returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Approved,
    Review,
    Denied,
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::Review => "review",
            Self::Denied => "denied",
        };
        write!(f, "{}", s)
    }
}

/// Coarse bucket over the trust score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl TrustLevel {
    /// Bucket for a trust score.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=19 => Self::VeryLow,
            20..=39 => Self::Low,
            40..=59 => Self::Medium,
            60..=79 => Self::High,
            _ => Self::VeryHigh,
        }
    }
}

/// Action recommended to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Approve,
    StepUpMfa,
    ManualReview,
    Deny,
}

/// The engine's authoritative outcome for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Request this decision answers
    pub request_id: String,
    /// Fresh UUID per decision build
    pub decision_id: Uuid,
    pub status: DecisionStatus,
    /// Weighted floor-mean of verifier scores, in [0, 100]
    pub trust_score: u8,
    pub trust_level: TrustLevel,
    /// Keyed by category; iteration order is category ascending
    pub verifier_results: BTreeMap<String, VerifierResult>,
    /// Insertion order follows category-ascending result iteration
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
    pub recommended_action: RecommendedAction,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Compliance metadata: decision_timestamp, engine_version,
    /// verifiers_executed, anomaly_count, requires_dual_approval
    #[serde(default)]
    pub audit: HashMap<String, Value>,
}

impl Decision {
    /// Count of anomalies at or above a severity.
    pub fn anomalies_at_least(&self, severity: AnomalySeverity) -> usize {
        self.anomalies
            .iter()
            .filter(|a| a.severity >= severity)
            .count()
    }
}
