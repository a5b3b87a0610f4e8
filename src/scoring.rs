//! Score composition and anomaly synthesis.
//!
//! Deterministic given the same inputs: anomaly order follows the
//! category-ascending iteration of the results map, and the weighted-mean
//! summation is commutative under the final integer division.

use std::collections::{BTreeMap, HashSet};

use crate::decision::{
    Anomaly, AnomalySeverity, DecisionStatus, RecommendedAction, TrustLevel, VerifierResult,
    VerifierStatus,
};
use crate::plan::ExecutionPlan;
use crate::policy::{MfaLevel, RegionalPolicy};
use crate::registry::RegistrySnapshot;

/// Width of the step-up band above the acceptance threshold.
const STEP_UP_BAND: u8 = 10;

/// Synthesized decision components.
#[derive(Debug)]
pub struct Synthesis {
    pub trust_score: u8,
    pub trust_level: TrustLevel,
    pub anomalies: Vec<Anomaly>,
    pub status: DecisionStatus,
    pub recommended_action: RecommendedAction,
}

/// Weighted floor-mean over `(score, weight)` pairs; 0 when no weight.
pub fn weighted_trust_score(scores: impl IntoIterator<Item = (u8, u32)>) -> u8 {
    let mut weighted_sum: u64 = 0;
    let mut total_weight: u64 = 0;
    for (score, weight) in scores {
        weighted_sum += u64::from(score) * u64::from(weight);
        total_weight += u64::from(weight);
    }
    if total_weight == 0 {
        0
    } else {
        (weighted_sum / total_weight) as u8
    }
}

/// Effective weight for a category: policy override, else the registered
/// handle's declared weight, else 1.
pub fn weight_for(category: &str, policy: &RegionalPolicy, snapshot: &RegistrySnapshot) -> u32 {
    policy
        .weight_overrides
        .get(category)
        .copied()
        .or_else(|| snapshot.get(category).map(|h| h.weight()))
        .unwrap_or(1)
}

/// Combine per-verifier outcomes into the decision components.
pub fn synthesize(
    results: &BTreeMap<String, VerifierResult>,
    plan: &ExecutionPlan,
    policy: &RegionalPolicy,
    snapshot: &RegistrySnapshot,
    effective_mfa: MfaLevel,
    cancelled: bool,
) -> Synthesis {
    // Results synthesized for unregistered required categories are part of
    // the decision record but carry no verifier execution, so they stay
    // out of the score.
    let unexecuted: HashSet<&str> = plan
        .synthetic_results
        .iter()
        .map(|r| r.category.as_str())
        .collect();

    let trust_score = weighted_trust_score(results.iter().filter_map(|(category, result)| {
        if unexecuted.contains(category.as_str()) {
            None
        } else {
            Some((result.score, weight_for(category, policy, snapshot)))
        }
    }));
    let trust_level = TrustLevel::from_score(trust_score);

    let mut anomalies = Vec::new();
    for (category, result) in results {
        if result.status == VerifierStatus::Ok {
            continue;
        }
        for field in &result.failed_fields {
            anomalies.push(Anomaly {
                kind: format!("{}_anomaly", category),
                severity: AnomalySeverity::from_score(result.score),
                description: if result.description.is_empty() {
                    format!("{} verification flagged {}", category, field)
                } else {
                    result.description.clone()
                },
                detection_method: detection_method(result.status).to_string(),
                affected_fields: vec![field.clone()],
                confidence: f64::from(100 - result.score.min(100)) / 100.0,
            });
        }
    }

    if cancelled {
        anomalies.push(Anomaly {
            kind: "engine_cancelled".to_string(),
            severity: AnomalySeverity::Critical,
            description: "request cancelled while verifications were in flight".to_string(),
            detection_method: "engine".to_string(),
            affected_fields: Vec::new(),
            confidence: 1.0,
        });
    }

    let required_error = results
        .iter()
        .any(|(c, r)| plan.is_required(c) && r.status == VerifierStatus::Error);
    // A required category absent from the registry (synthesized result)
    // forces denial outright. A required verifier that ran and errored
    // only blocks approval and falls through the threshold/band rule.
    let missing_required = !unexecuted.is_empty();
    let all_required_acceptable = plan.required_categories.iter().all(|category| {
        results
            .get(category)
            .map(|r| r.status.is_acceptable())
            .unwrap_or(false)
    });

    let status = if cancelled || missing_required {
        DecisionStatus::Denied
    } else if trust_score >= policy.min_required_score && all_required_acceptable {
        DecisionStatus::Approved
    } else if trust_score >= policy.deny_threshold() {
        DecisionStatus::Review
    } else {
        DecisionStatus::Denied
    };

    let recommended_action = recommend(
        trust_score,
        policy,
        effective_mfa,
        &anomalies,
        required_error,
        cancelled,
    );

    Synthesis {
        trust_score,
        trust_level,
        anomalies,
        status,
        recommended_action,
    }
}

fn detection_method(status: VerifierStatus) -> &'static str {
    match status {
        VerifierStatus::Timeout => "deadline_monitor",
        VerifierStatus::Error => "execution_monitor",
        _ => "field_verification",
    }
}

/// The recommended-action decision table, first match wins.
fn recommend(
    trust_score: u8,
    policy: &RegionalPolicy,
    effective_mfa: MfaLevel,
    anomalies: &[Anomaly],
    required_error: bool,
    cancelled: bool,
) -> RecommendedAction {
    if cancelled || required_error {
        return RecommendedAction::Deny;
    }
    if trust_score < policy.deny_threshold() {
        return RecommendedAction::Deny;
    }

    let has_critical = anomalies
        .iter()
        .any(|a| a.severity == AnomalySeverity::Critical);
    if trust_score < policy.min_required_score || anomalies.len() >= 3 || has_critical {
        return RecommendedAction::ManualReview;
    }

    if effective_mfa == MfaLevel::High
        && trust_score >= policy.min_required_score
        && trust_score < policy.min_required_score.saturating_add(STEP_UP_BAND)
    {
        return RecommendedAction::StepUpMfa;
    }

    RecommendedAction::Approve
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::VerifierResult as VR;
    use crate::error::VerifierError;
    use crate::plan::build_plan;
    use crate::registry::VerifierRegistry;
    use crate::request::VerificationRequest;
    use crate::verifier::{Verifier, VerifierHandle, VerifyContext};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedVerifier {
        category: &'static str,
        weight: u32,
    }

    #[async_trait]
    impl Verifier for FixedVerifier {
        fn category(&self) -> &str {
            self.category
        }

        fn weight(&self) -> u32 {
            self.weight
        }

        async fn verify(
            &self,
            _ctx: &VerifyContext,
            _request: &VerificationRequest,
        ) -> Result<VR, VerifierError> {
            Ok(VR::ok(self.category, 100))
        }
    }

    async fn snapshot(verifiers: &[(&'static str, u32)]) -> RegistrySnapshot {
        let registry = VerifierRegistry::new();
        for (category, weight) in verifiers {
            registry
                .register(VerifierHandle::new(Arc::new(FixedVerifier {
                    category,
                    weight: *weight,
                })))
                .await
                .unwrap();
        }
        registry.snapshot().await
    }

    fn results(entries: &[VR]) -> BTreeMap<String, VR> {
        entries
            .iter()
            .map(|r| (r.category.clone(), r.clone()))
            .collect()
    }

    const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_happy_path_weighted_score() {
        let snapshot = snapshot(&[("identity", 2), ("device", 1)]).await;
        let policy = RegionalPolicy::new(60).require("identity").optional("device");
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let synthesis = synthesize(
            &results(&[VR::ok("identity", 90), VR::ok("device", 70)]),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::Medium,
            false,
        );

        assert_eq!(synthesis.trust_score, 83);
        assert_eq!(synthesis.trust_level, TrustLevel::VeryHigh);
        assert_eq!(synthesis.status, DecisionStatus::Approved);
        assert_eq!(synthesis.recommended_action, RecommendedAction::Approve);
        assert!(synthesis.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_missing_required_denies_and_scores_over_executed_only() {
        let snapshot = snapshot(&[("device", 1)]).await;
        let policy = RegionalPolicy::new(60).require("identity").optional("device");
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let mut all = results(&[VR::ok("device", 80)]);
        for synthetic in &plan.synthetic_results {
            all.insert(synthetic.category.clone(), synthetic.clone());
        }

        let synthesis = synthesize(&all, &plan, &policy, &snapshot, MfaLevel::Medium, false);

        // Trust over the executed verifier alone.
        assert_eq!(synthesis.trust_score, 80);
        assert_eq!(synthesis.status, DecisionStatus::Denied);
        assert_eq!(synthesis.recommended_action, RecommendedAction::Deny);
        assert_eq!(synthesis.anomalies.len(), 1);
        let anomaly = &synthesis.anomalies[0];
        assert_eq!(anomaly.kind, "identity_anomaly");
        assert_eq!(
            anomaly.affected_fields,
            vec!["missing_required_verifier:identity"]
        );
        assert_eq!(anomaly.severity, AnomalySeverity::Critical);
    }

    #[tokio::test]
    async fn test_executed_required_error_falls_through_review_band() {
        let snapshot = snapshot(&[("identity", 1), ("device", 1)]).await;
        let policy = RegionalPolicy::new(60).require("identity").optional("device");
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        // identity is registered and ran, but its upstream failed.
        let synthesis = synthesize(
            &results(&[
                VR::with_status(
                    "identity",
                    VerifierStatus::Error,
                    0,
                    vec!["upstream_unavailable".to_string()],
                ),
                VR::ok("device", 100),
            ]),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::Medium,
            false,
        );

        // The score clears the deny threshold, so the status lands in the
        // review band rather than being denied outright.
        assert_eq!(synthesis.trust_score, 50);
        assert_eq!(synthesis.status, DecisionStatus::Review);
        // The action table still denies on any required-verifier error.
        assert_eq!(synthesis.recommended_action, RecommendedAction::Deny);

        let below_band = synthesize(
            &results(&[
                VR::with_status(
                    "identity",
                    VerifierStatus::Error,
                    0,
                    vec!["upstream_unavailable".to_string()],
                ),
                VR::ok("device", 80),
            ]),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::Medium,
            false,
        );
        assert_eq!(below_band.trust_score, 40);
        assert_eq!(below_band.status, DecisionStatus::Denied);
    }

    #[tokio::test]
    async fn test_timeout_drags_score_below_threshold() {
        let snapshot = snapshot(&[("a", 1), ("b", 1)]).await;
        let policy = RegionalPolicy::default().optional("a").optional("b");
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let synthesis = synthesize(
            &results(&[
                VR::ok("a", 80),
                VR::with_status(
                    "b",
                    VerifierStatus::Timeout,
                    0,
                    vec!["deadline_exceeded".to_string()],
                ),
            ]),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::Medium,
            false,
        );

        assert_eq!(synthesis.trust_score, 40);
        assert_eq!(synthesis.status, DecisionStatus::Denied);
        assert_eq!(synthesis.anomalies.len(), 1);
        assert_eq!(synthesis.anomalies[0].kind, "b_anomaly");
        assert_eq!(synthesis.anomalies[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_step_up_band_with_high_mfa() {
        let snapshot = snapshot(&[("a", 1), ("b", 1)]).await;
        let policy = RegionalPolicy::new(60).optional("a").optional("b");
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let synthesis = synthesize(
            &results(&[VR::ok("a", 65), VR::ok("b", 65)]),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::High,
            false,
        );

        assert_eq!(synthesis.trust_score, 65);
        assert_eq!(synthesis.status, DecisionStatus::Approved);
        assert_eq!(synthesis.recommended_action, RecommendedAction::StepUpMfa);
    }

    #[tokio::test]
    async fn test_cancellation_forces_denied_with_critical_anomaly() {
        let snapshot = snapshot(&[("a", 1)]).await;
        let policy = RegionalPolicy::default().optional("a");
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let synthesis = synthesize(
            &results(&[VR::ok("a", 95)]),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::Medium,
            true,
        );

        assert_eq!(synthesis.status, DecisionStatus::Denied);
        assert_eq!(synthesis.recommended_action, RecommendedAction::Deny);
        let cancelled = synthesis
            .anomalies
            .iter()
            .find(|a| a.kind == "engine_cancelled")
            .expect("engine_cancelled anomaly present");
        assert_eq!(cancelled.severity, AnomalySeverity::Critical);
    }

    #[tokio::test]
    async fn test_status_boundaries() {
        let snapshot = snapshot(&[("a", 1)]).await;
        let policy = RegionalPolicy::new(60);
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let at = |score: u8| {
            synthesize(
                &results(&[VR::ok("a", score)]),
                &plan,
                &policy,
                &snapshot,
                MfaLevel::Medium,
                false,
            )
        };

        assert_eq!(at(0).status, DecisionStatus::Denied);
        assert_eq!(at(49).status, DecisionStatus::Denied);
        assert_eq!(at(50).status, DecisionStatus::Review);
        assert_eq!(at(59).status, DecisionStatus::Review);
        assert_eq!(at(60).status, DecisionStatus::Approved);
        assert_eq!(at(100).status, DecisionStatus::Approved);
        // Below threshold but inside the band: review, not deny.
        assert_eq!(at(59).recommended_action, RecommendedAction::ManualReview);
    }

    #[tokio::test]
    async fn test_three_anomalies_trigger_manual_review() {
        let snapshot = snapshot(&[("a", 1), ("b", 1)]).await;
        let policy = RegionalPolicy::new(60).optional("a").optional("b");
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let synthesis = synthesize(
            &results(&[
                VR::ok("a", 100),
                VR::with_status(
                    "b",
                    VerifierStatus::Partial,
                    70,
                    vec!["f1".into(), "f2".into(), "f3".into()],
                ),
            ]),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::Medium,
            false,
        );

        assert_eq!(synthesis.trust_score, 85);
        assert_eq!(synthesis.anomalies.len(), 3);
        assert!(synthesis
            .anomalies
            .iter()
            .all(|a| a.severity == AnomalySeverity::Low));
        assert_eq!(synthesis.recommended_action, RecommendedAction::ManualReview);
    }

    #[tokio::test]
    async fn test_empty_results_score_zero() {
        let snapshot = snapshot(&[]).await;
        let policy = RegionalPolicy::default();
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let synthesis = synthesize(
            &BTreeMap::new(),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::Medium,
            false,
        );

        assert_eq!(synthesis.trust_score, 0);
        assert_eq!(synthesis.trust_level, TrustLevel::VeryLow);
        assert_eq!(synthesis.status, DecisionStatus::Denied);
    }

    #[tokio::test]
    async fn test_anomaly_order_follows_category_order() {
        let snapshot = snapshot(&[("alpha", 1), ("beta", 1)]).await;
        let policy = RegionalPolicy::default().optional("alpha").optional("beta");
        let plan = build_plan(&snapshot, &policy, DEFAULT_TIMEOUT);

        let synthesis = synthesize(
            &results(&[
                VR::with_status("beta", VerifierStatus::Failed, 30, vec!["x".into()]),
                VR::with_status(
                    "alpha",
                    VerifierStatus::Failed,
                    30,
                    vec!["a".into(), "b".into()],
                ),
            ]),
            &plan,
            &policy,
            &snapshot,
            MfaLevel::Medium,
            false,
        );

        let kinds: Vec<&str> = synthesis.anomalies.iter().map(|a| a.kind.as_str()).collect();
        assert_eq!(kinds, vec!["alpha_anomaly", "alpha_anomaly", "beta_anomaly"]);
        assert_eq!(synthesis.anomalies[0].affected_fields, vec!["a"]);
        assert_eq!(synthesis.anomalies[1].affected_fields, vec!["b"]);
    }

    proptest! {
        #[test]
        fn prop_weighted_mean_matches_formula(
            entries in proptest::collection::vec((0u8..=100, 1u32..=50), 0..12)
        ) {
            let score = weighted_trust_score(entries.iter().copied());
            let weighted: u64 = entries.iter().map(|(s, w)| u64::from(*s) * u64::from(*w)).sum();
            let total: u64 = entries.iter().map(|(_, w)| u64::from(*w)).sum();
            let expected = if total == 0 { 0 } else { (weighted / total) as u8 };
            prop_assert_eq!(score, expected);
            prop_assert!(score <= 100);
        }
    }
}
