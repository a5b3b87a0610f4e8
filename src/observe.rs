//! Observability facade.
//!
//! Metric emission sits behind [`DecisionObserver`] so the core stays
//! testable without exporters: the default observer is a no-op, the
//! recording observer backs tests and introspection, and the metrics
//! observer forwards to whatever recorder the embedding process installs.
//! Trace spans and structured logs are emitted inline via `tracing`;
//! user identifiers are hashed before they reach a log field and raw
//! context values never do.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::decision::{DecisionStatus, VerifierStatus};

/// Stable hash of a user identifier for log fields.
pub fn hashed_subject(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}

/// Signals emitted per decision and per verifier.
pub trait DecisionObserver: Send + Sync {
    /// A verification request arrived (cache hits included).
    fn on_request(&self, tenant: &str, region: &str) {
        let _ = (tenant, region);
    }

    /// A request was answered from the decision cache.
    fn on_cache_hit(&self, region: &str) {
        let _ = region;
    }

    /// A decision was synthesized.
    fn on_decision(
        &self,
        region: &str,
        status: DecisionStatus,
        trust_score: u8,
        duration: Duration,
    ) {
        let _ = (region, status, trust_score, duration);
    }

    /// One verifier produced a result.
    fn on_verifier(&self, category: &str, status: VerifierStatus, duration_ms: u64) {
        let _ = (category, status, duration_ms);
    }

    /// A verifier result carried `status=error`.
    fn on_verifier_error(&self, category: &str) {
        let _ = category;
    }
}

/// Default observer: emits nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl DecisionObserver for NoopObserver {}

/// Counters captured by the recording observer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservedCounts {
    pub requests: u64,
    pub cache_hits: u64,
    pub decisions: u64,
    pub verifier_runs: u64,
    pub verifier_errors: HashMap<String, u64>,
    pub trust_scores: Vec<u8>,
}

/// In-memory observer for tests and introspection.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    counts: Mutex<ObservedCounts>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ObservedCounts {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with<F: FnOnce(&mut ObservedCounts)>(&self, f: F) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut counts);
    }
}

impl DecisionObserver for RecordingObserver {
    fn on_request(&self, _tenant: &str, _region: &str) {
        self.with(|c| c.requests += 1);
    }

    fn on_cache_hit(&self, _region: &str) {
        self.with(|c| c.cache_hits += 1);
    }

    fn on_decision(
        &self,
        _region: &str,
        _status: DecisionStatus,
        trust_score: u8,
        _duration: Duration,
    ) {
        self.with(|c| {
            c.decisions += 1;
            c.trust_scores.push(trust_score);
        });
    }

    fn on_verifier(&self, _category: &str, _status: VerifierStatus, _duration_ms: u64) {
        self.with(|c| c.verifier_runs += 1);
    }

    fn on_verifier_error(&self, category: &str) {
        self.with(|c| {
            *c.verifier_errors.entry(category.to_string()).or_default() += 1;
        });
    }
}

/// Observer forwarding to the `metrics` recorder installed by the host
/// process. Without a recorder every emission is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl MetricsObserver {
    pub fn new() -> Self {
        Self
    }
}

impl DecisionObserver for MetricsObserver {
    fn on_request(&self, tenant: &str, region: &str) {
        metrics::counter!(
            "cross_verification_requests_total",
            "tenant" => tenant.to_string(),
            "region" => region.to_string(),
        )
        .increment(1);
    }

    fn on_cache_hit(&self, region: &str) {
        metrics::counter!(
            "cross_verification_cache_hits_total",
            "region" => region.to_string(),
        )
        .increment(1);
    }

    fn on_decision(
        &self,
        region: &str,
        status: DecisionStatus,
        trust_score: u8,
        duration: Duration,
    ) {
        metrics::histogram!(
            "cross_verification_duration_ms",
            "region" => region.to_string(),
            "status" => status.to_string(),
        )
        .record(duration.as_millis() as f64);
        metrics::histogram!(
            "cross_verification_trust_score",
            "region" => region.to_string(),
        )
        .record(f64::from(trust_score));
    }

    fn on_verifier(&self, category: &str, status: VerifierStatus, duration_ms: u64) {
        metrics::histogram!(
            "verifier_duration_ms",
            "category" => category.to_string(),
            "status" => status.to_string(),
        )
        .record(duration_ms as f64);
    }

    fn on_verifier_error(&self, category: &str) {
        metrics::counter!(
            "verifier_errors",
            "category" => category.to_string(),
        )
        .increment(1);
    }
}
