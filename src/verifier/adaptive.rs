//! Adaptive authentication verifier.
//!
//! Maps the request's risk level to a set of required authentication
//! factors and scores the request by how many of those factors have been
//! completed. Missing factors become failed fields, so the generic anomaly
//! and scoring machinery applies to step-up decisions unchanged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::{Verifier, VerifyContext};
use crate::decision::{VerifierResult, VerifierStatus};
use crate::error::VerifierError;
use crate::request::VerificationRequest;

/// Context key carrying an explicit risk level.
pub const RISK_LEVEL_KEY: &str = "risk_level";
/// Context key carrying the factors the user has completed.
pub const COMPLETED_FACTORS_KEY: &str = "completed_factors";

/// Risk bucket driving the factor requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Parse a risk level name; `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Risk implied by a verification level when the context does not
    /// carry an explicit `risk_level`.
    pub fn from_verification_level(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "basic" => Self::Low,
            "standard" => Self::Medium,
            "enhanced" => Self::High,
            "maximum" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

/// Required factors per risk level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorMatrix {
    requirements: HashMap<RiskLevel, Vec<String>>,
}

impl FactorMatrix {
    /// Matrix with no requirements; populate with [`FactorMatrix::require`].
    pub fn empty() -> Self {
        Self {
            requirements: HashMap::new(),
        }
    }

    /// Set the required factors for a risk level.
    pub fn require(
        mut self,
        level: RiskLevel,
        factors: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.requirements
            .insert(level, factors.into_iter().map(Into::into).collect());
        self
    }

    /// Required factors for a level; empty when none are configured.
    pub fn required_for(&self, level: RiskLevel) -> &[String] {
        self.requirements
            .get(&level)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for FactorMatrix {
    fn default() -> Self {
        Self::empty()
            .require(RiskLevel::Low, ["password"])
            .require(RiskLevel::Medium, ["password", "otp"])
            .require(RiskLevel::High, ["password", "otp", "device_binding"])
            .require(
                RiskLevel::Critical,
                ["password", "otp", "device_binding", "biometric"],
            )
    }
}

/// The adaptive authentication decision as a pluggable verifier.
pub struct AdaptiveAuthVerifier {
    weight: u32,
    matrix: FactorMatrix,
}

impl AdaptiveAuthVerifier {
    pub const CATEGORY: &'static str = "adaptive_auth";

    pub fn new() -> Self {
        Self {
            weight: 1,
            matrix: FactorMatrix::default(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_matrix(mut self, matrix: FactorMatrix) -> Self {
        self.matrix = matrix;
        self
    }

    fn risk_level(&self, request: &VerificationRequest) -> RiskLevel {
        request
            .context
            .get(RISK_LEVEL_KEY)
            .and_then(|v| v.value.as_str())
            .and_then(RiskLevel::parse)
            .unwrap_or_else(|| RiskLevel::from_verification_level(&request.verification_level))
    }

    fn completed_factors(&self, request: &VerificationRequest) -> Vec<String> {
        request
            .context
            .get(COMPLETED_FACTORS_KEY)
            .and_then(|v| v.value.as_array())
            .map(|factors| {
                factors
                    .iter()
                    .filter_map(|f| f.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for AdaptiveAuthVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Verifier for AdaptiveAuthVerifier {
    fn category(&self) -> &str {
        Self::CATEGORY
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    async fn verify(
        &self,
        ctx: &VerifyContext,
        request: &VerificationRequest,
    ) -> Result<VerifierResult, VerifierError> {
        let risk = self.risk_level(request);
        let required = self.matrix.required_for(risk);
        let completed = self.completed_factors(request);

        let missing: Vec<String> = required
            .iter()
            .filter(|factor| !completed.contains(factor))
            .map(|factor| format!("factor:{}", factor))
            .collect();

        debug!(
            risk = ?risk,
            required = required.len(),
            missing = missing.len(),
            "adaptive auth evaluated"
        );

        let (status, score) = if required.is_empty() || missing.is_empty() {
            (VerifierStatus::Ok, 100)
        } else {
            let satisfied = required.len() - missing.len();
            let score = (satisfied * 100 / required.len()) as u8;
            if satisfied * 2 >= required.len() {
                (VerifierStatus::Partial, score)
            } else {
                (VerifierStatus::Failed, score)
            }
        };

        let description = match status {
            VerifierStatus::Ok => format!("all factors satisfied for {:?} risk", risk),
            _ => format!(
                "{} of {} required factors missing for {:?} risk",
                missing.len(),
                required.len(),
                risk
            ),
        };

        Ok(
            VerifierResult::with_status(Self::CATEGORY, status, score, missing)
                .with_description(description)
                .with_processing_time(ctx.elapsed_ms()),
        )
    }
}
