//! Plan execution with per-verifier deadlines and structured failure
//! capture.
//!
//! Every failure mode a verifier can exhibit (typed error, deadline
//! overrun, panic, caller cancellation) is caught here and mapped into a
//! `VerifierResult`, so the scoring stage always sees a complete result
//! set and the engine never surfaces verifier failures as errors.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::decision::{VerifierResult, VerifierStatus};
use crate::plan::{ExecutionPlan, PlanStep};
use crate::request::VerificationRequest;
use crate::verifier::{CancelToken, VerifyContext};

/// Slack after a deadline during which a verifier's own shutdown may
/// still deliver a result; beyond it the synthetic timeout is installed.
pub const GRACE: Duration = Duration::from_millis(50);

/// Outcome of running one execution plan.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// One result per planned verifier, keyed by category
    pub results: BTreeMap<String, VerifierResult>,
    /// Whether the caller cancelled while the plan was in flight
    pub cancelled: bool,
}

/// Runs execution plans in parallel or sequential mode.
pub struct Executor {
    parallel: bool,
    skip_optional_after_required_failure: bool,
}

impl Executor {
    pub fn new(parallel: bool) -> Self {
        Self {
            parallel,
            skip_optional_after_required_failure: false,
        }
    }

    /// Sequential mode only: skip optional steps once a required step has
    /// failed. Defaults to off, so optional verifiers still run and the
    /// audit record stays complete.
    pub fn with_skip_optional_after_required_failure(mut self, skip: bool) -> Self {
        self.skip_optional_after_required_failure = skip;
        self
    }

    /// Run the plan. The returned outcome carries exactly one result per
    /// planned verifier plus the plan's synthetic results.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        request: Arc<VerificationRequest>,
        cancel: &CancelToken,
    ) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();
        for synthetic in &plan.synthetic_results {
            outcome
                .results
                .insert(synthetic.category.clone(), synthetic.clone());
        }

        if self.parallel {
            self.execute_parallel(plan, request, cancel, &mut outcome).await;
        } else {
            self.execute_sequential(plan, request, cancel, &mut outcome).await;
        }

        outcome.cancelled = cancel.is_cancelled();
        outcome
    }

    async fn execute_parallel(
        &self,
        plan: &ExecutionPlan,
        request: Arc<VerificationRequest>,
        cancel: &CancelToken,
        outcome: &mut ExecutionOutcome,
    ) {
        let handles: Vec<(String, tokio::task::JoinHandle<VerifierResult>)> = plan
            .steps
            .iter()
            .map(|step| {
                let step = step.clone();
                let request = Arc::clone(&request);
                let cancel = cancel.clone();
                let category = step.category.clone();
                let span = info_span!("verifier", category = %category);
                let handle = tokio::spawn(run_step(step, request, cancel).instrument(span));
                (category, handle)
            })
            .collect();

        let categories: Vec<String> = handles.iter().map(|(c, _)| c.clone()).collect();
        let joined = join_all(handles.into_iter().map(|(_, h)| h)).await;

        for (category, joined) in categories.into_iter().zip(joined) {
            let result = joined.unwrap_or_else(|err| {
                warn!(category = %category, "verifier task failed: {}", err);
                VerifierResult::with_status(
                    &category,
                    VerifierStatus::Error,
                    0,
                    vec!["task_failure".to_string()],
                )
                .with_description("verifier task did not complete")
            });
            outcome.results.insert(category, result);
        }
    }

    async fn execute_sequential(
        &self,
        plan: &ExecutionPlan,
        request: Arc<VerificationRequest>,
        cancel: &CancelToken,
        outcome: &mut ExecutionOutcome,
    ) {
        let mut required_failure = false;

        for step in &plan.steps {
            if cancel.is_cancelled() {
                outcome
                    .results
                    .insert(step.category.clone(), cancelled_result(&step.category, 0));
                continue;
            }

            if required_failure && !step.required && self.skip_optional_after_required_failure {
                debug!(category = %step.category, "optional verifier skipped after required failure");
                outcome.results.insert(
                    step.category.clone(),
                    VerifierResult::with_status(&step.category, VerifierStatus::Error, 0, vec![])
                        .with_description("skipped after required verifier failure"),
                );
                continue;
            }

            let category = step.category.clone();
            let span = info_span!("verifier", category = %category);
            let handle = tokio::spawn(
                run_step(step.clone(), Arc::clone(&request), cancel.clone()).instrument(span),
            );
            let result = handle.await.unwrap_or_else(|err| {
                warn!(category = %category, "verifier task failed: {}", err);
                VerifierResult::with_status(
                    &category,
                    VerifierStatus::Error,
                    0,
                    vec!["task_failure".to_string()],
                )
                .with_description("verifier task did not complete")
            });

            if step.required && !result.status.is_acceptable() {
                required_failure = true;
            }
            outcome.results.insert(category, result);
        }
    }
}

/// Invoke one verifier under its deadline, mapping every failure mode to
/// a result.
async fn run_step(
    step: PlanStep,
    request: Arc<VerificationRequest>,
    cancel: CancelToken,
) -> VerifierResult {
    let started = Instant::now();

    for field in &step.handle.capabilities().requires_context_fields {
        if !request.context.contains_key(field.as_str()) {
            debug!(category = %step.category, field = %field, "required context field absent");
            return VerifierResult::with_status(
                &step.category,
                VerifierStatus::Error,
                0,
                vec![format!("missing_context:{}", field)],
            )
            .with_description("required context field absent")
            .with_processing_time(elapsed_ms(started));
        }
    }

    let ctx = VerifyContext::new(step.timeout, cancel.clone());
    let verifier = step.handle.verifier();
    let invocation = verifier.verify(&ctx, &request);

    tokio::select! {
        outcome = tokio::time::timeout(step.timeout + GRACE, invocation) => match outcome {
            Ok(Ok(mut result)) => {
                result.category = step.category.clone();
                if result.processing_time_ms == 0 {
                    result.processing_time_ms = elapsed_ms(started);
                }
                result
            }
            Ok(Err(err)) => {
                debug!(category = %step.category, "verifier returned error: {}", err);
                VerifierResult::with_status(
                    &step.category,
                    VerifierStatus::Error,
                    0,
                    err.failed_fields(),
                )
                .with_description(err.to_string())
                .with_processing_time(elapsed_ms(started))
            }
            Err(_) => {
                debug!(category = %step.category, timeout_ms = step.timeout.as_millis() as u64,
                    "verifier exceeded deadline");
                let cap = (step.timeout + GRACE).as_millis() as u64;
                VerifierResult::with_status(
                    &step.category,
                    VerifierStatus::Timeout,
                    0,
                    vec!["deadline_exceeded".to_string()],
                )
                .with_description("deadline exceeded")
                .with_processing_time(elapsed_ms(started).min(cap))
            }
        },
        _ = cancel.cancelled() => cancelled_result(&step.category, elapsed_ms(started)),
    }
}

fn cancelled_result(category: &str, elapsed_ms: u64) -> VerifierResult {
    VerifierResult::with_status(
        category,
        VerifierStatus::Timeout,
        0,
        vec!["cancelled".to_string()],
    )
    .with_description("cancelled before completion")
    .with_processing_time(elapsed_ms)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
