//! Execution planning: registry snapshot × regional policy → ordered plan.

use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::decision::{VerifierResult, VerifierStatus};
use crate::policy::RegionalPolicy;
use crate::registry::RegistrySnapshot;
use crate::verifier::VerifierHandle;

/// One verifier scheduled for execution.
#[derive(Clone, Debug)]
pub struct PlanStep {
    pub category: String,
    pub handle: VerifierHandle,
    pub required: bool,
    /// Resolved deadline: policy override, else handle default, else engine default
    pub timeout: Duration,
}

/// Ordered execution plan for one decision.
#[derive(Clone, Debug, Default)]
pub struct ExecutionPlan {
    /// Steps in dispatch order: required categories first (declared order),
    /// then optional ones
    pub steps: Vec<PlanStep>,
    /// Synthetic results for required categories absent from the registry
    pub synthetic_results: Vec<VerifierResult>,
    /// Every required category, present or not
    pub required_categories: HashSet<String>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.synthetic_results.is_empty()
    }

    /// Whether a category must pass for the decision to be approved.
    pub fn is_required(&self, category: &str) -> bool {
        self.required_categories.contains(category)
    }
}

/// Materialize the execution plan for a request.
///
/// Required categories are planned in declared order; a required category
/// missing from the registry becomes a synthetic `error` result rather
/// than a planning failure. Missing optional categories are skipped
/// silently. When the policy names no categories at all, every registered
/// verifier runs as optional.
pub fn build_plan(
    snapshot: &RegistrySnapshot,
    policy: &RegionalPolicy,
    default_timeout: Duration,
) -> ExecutionPlan {
    let mut plan = ExecutionPlan::default();
    let mut seen: HashSet<String> = HashSet::new();

    for category in &policy.required_categories {
        plan.required_categories.insert(category.clone());
        if !seen.insert(category.clone()) {
            continue;
        }
        match snapshot.get(category) {
            Some(handle) => plan.steps.push(step(category, handle, true, policy, default_timeout)),
            None => {
                debug!(category, "required verifier missing from registry");
                plan.synthetic_results.push(missing_required(category));
            }
        }
    }

    for category in &policy.optional_categories {
        if !seen.insert(category.clone()) {
            continue;
        }
        if let Some(handle) = snapshot.get(category) {
            plan.steps.push(step(category, handle, false, policy, default_timeout));
        }
    }

    // No categories named at all: run everything registered.
    if policy.required_categories.is_empty() && policy.optional_categories.is_empty() {
        for category in snapshot.categories() {
            if !seen.insert(category.clone()) {
                continue;
            }
            if let Some(handle) = snapshot.get(&category) {
                plan.steps.push(step(&category, handle, false, policy, default_timeout));
            }
        }
    }

    plan
}

fn step(
    category: &str,
    handle: &VerifierHandle,
    required: bool,
    policy: &RegionalPolicy,
    default_timeout: Duration,
) -> PlanStep {
    let timeout = policy
        .timeout_overrides
        .get(category)
        .copied()
        .or_else(|| handle.default_timeout())
        .unwrap_or(default_timeout);
    PlanStep {
        category: category.to_string(),
        handle: handle.clone(),
        required,
        timeout,
    }
}

fn missing_required(category: &str) -> VerifierResult {
    VerifierResult::with_status(
        category,
        VerifierStatus::Error,
        0,
        vec![format!("missing_required_verifier:{}", category)],
    )
    .with_description(format!("required verifier {} is not registered", category))
}
