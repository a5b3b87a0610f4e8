//! Engine façade: the single public entry point for cross-verification.
//!
//! A verification moves through a linear pipeline:
//! plan → execute → score → log → cache → return. Scoring always runs,
//! even under total verifier failure, so every request that reaches
//! planning produces a well-formed decision.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, DecisionCache, Lookup};
use crate::decision::{Anomaly, AnomalySeverity, Decision, VerifierStatus};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::history::{
    DecisionRecord, HistorySink, HistoryWriter, MemoryHistorySink, WriterConfig,
};
use crate::observe::{hashed_subject, DecisionObserver, NoopObserver};
use crate::plan::build_plan;
use crate::policy::{ComplianceMetadata, ComplianceTable, PolicyStore, RegionalPolicy};
use crate::registry::VerifierRegistry;
use crate::request::VerificationRequest;
use crate::scoring;
use crate::verifier::{CancelToken, VerifierHandle};

/// Version stamped into every decision's audit map.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fallback per-verifier deadline when neither handle nor policy
    /// specify one
    pub default_timeout: Duration,
    /// Parallel (true) or sequential (false) plan execution
    pub parallel: bool,
    /// Sequential mode only: skip optional verifiers after a required
    /// failure
    pub skip_optional_after_required_failure: bool,
    pub cache_enabled: bool,
    /// TTL for cached decisions; eviction runs at half this interval
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    /// Enables the decision history stream
    pub audit_enabled: bool,
    pub audit_queue_capacity: usize,
    /// Overflow spill destination for the history queue
    pub audit_spill_path: Option<PathBuf>,
    /// Bound on `close()` waiting for in-flight verifications and the
    /// history drain
    pub shutdown_timeout: Duration,
    /// Policy applied to regions with no explicit entry
    pub default_policy: RegionalPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            parallel: true,
            skip_optional_after_required_failure: false,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(3600),
            cache_max_entries: 10_000,
            audit_enabled: true,
            audit_queue_capacity: 1024,
            audit_spill_path: None,
            shutdown_timeout: Duration::from_secs(5),
            default_policy: RegionalPolicy::default(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(Error::config("default_timeout must be non-zero"));
        }
        if self.cache_enabled && self.cache_ttl.is_zero() {
            return Err(Error::config("cache_ttl must be non-zero when caching"));
        }
        self.default_policy.validate()
    }
}

/// Builder for [`VerificationEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    history_sink: Option<Arc<dyn HistorySink>>,
    observer: Option<Arc<dyn DecisionObserver>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            history_sink: None,
            observer: None,
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    pub fn skip_optional_after_required_failure(mut self, skip: bool) -> Self {
        self.config.skip_optional_after_required_failure = skip;
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache_enabled = enabled;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn audit_enabled(mut self, enabled: bool) -> Self {
        self.config.audit_enabled = enabled;
        self
    }

    pub fn audit_spill_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.audit_spill_path = Some(path.into());
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn default_policy(mut self, policy: RegionalPolicy) -> Self {
        self.config.default_policy = policy;
        self
    }

    /// Destination for the decision history stream. Defaults to a
    /// bounded in-memory sink.
    pub fn history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history_sink = Some(sink);
        self
    }

    /// Metrics observer. Defaults to the no-op observer.
    pub fn observer(mut self, observer: Arc<dyn DecisionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<VerificationEngine> {
        VerificationEngine::with_parts(
            self.config,
            self.history_sink
                .unwrap_or_else(|| Arc::new(MemoryHistorySink::new())),
            self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
        )
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The cross-verification engine.
pub struct VerificationEngine {
    config: EngineConfig,
    registry: VerifierRegistry,
    policies: PolicyStore,
    compliance: ComplianceTable,
    cache: DecisionCache,
    executor: Executor,
    history: Option<HistoryWriter>,
    history_sink: Arc<dyn HistorySink>,
    observer: Arc<dyn DecisionObserver>,
    eviction: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    closed: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for VerificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationEngine")
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl VerificationEngine {
    /// Build an engine with the default in-memory sink and no-op
    /// observer.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(MemoryHistorySink::new()),
            Arc::new(NoopObserver),
        )
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn with_parts(
        config: EngineConfig,
        history_sink: Arc<dyn HistorySink>,
        observer: Arc<dyn DecisionObserver>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = DecisionCache::new(
            config.cache_ttl,
            config.cache_max_entries,
            config.cache_enabled,
        );
        let executor = Executor::new(config.parallel)
            .with_skip_optional_after_required_failure(
                config.skip_optional_after_required_failure,
            );
        let history = config.audit_enabled.then(|| {
            HistoryWriter::spawn(
                Arc::clone(&history_sink),
                WriterConfig {
                    queue_capacity: config.audit_queue_capacity,
                    spill_path: config.audit_spill_path.clone(),
                    ..WriterConfig::default()
                },
            )
        });

        let engine = Self {
            policies: PolicyStore::new(config.default_policy.clone()),
            compliance: ComplianceTable::new(),
            registry: VerifierRegistry::new(),
            cache,
            executor,
            history,
            history_sink,
            observer,
            eviction: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            config,
        };
        engine.spawn_eviction();
        Ok(engine)
    }

    fn spawn_eviction(&self) {
        if !self.config.cache_enabled {
            return;
        }
        let interval = (self.config.cache_ttl / 2).max(Duration::from_millis(10));
        let cache = self.cache.clone_handle();
        let shutdown = Arc::clone(&self.shutdown);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => cache.evict_expired(),
                    _ = shutdown.notified() => break,
                }
            }
        });
        // Called once from with_parts, before the engine is shared.
        if let Ok(mut guard) = self.eviction.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Register a verifier handle.
    pub async fn register_verifier(&self, handle: VerifierHandle) -> Result<()> {
        self.registry.register(handle).await
    }

    /// Remove a verifier category.
    pub async fn deregister_verifier(&self, category: &str) -> bool {
        self.registry.deregister(category).await
    }

    /// Register the policy for a region.
    pub async fn register_policy(
        &self,
        region: impl Into<String>,
        policy: RegionalPolicy,
    ) -> Result<()> {
        self.policies.register(region, policy).await
    }

    /// Register compliance metadata for a region.
    pub async fn register_compliance(
        &self,
        region: impl Into<String>,
        metadata: ComplianceMetadata,
    ) -> Result<()> {
        self.compliance.register(region, metadata).await
    }

    /// Verify a request, returning its decision.
    ///
    /// Verifier failures never surface as errors; the only error paths
    /// are a closed engine and cancellation before a plan exists.
    #[instrument(
        name = "verify",
        skip(self, cancel, request),
        fields(request_id = %request.request_id, region = %request.region_code)
    )]
    pub async fn verify(
        &self,
        cancel: &CancelToken,
        mut request: VerificationRequest,
    ) -> Result<Decision> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::EngineClosed);
        }
        let _in_flight = InFlightGuard::enter(&self.in_flight);

        if request.timestamp.is_none() {
            request.timestamp = Some(Utc::now());
        }
        self.observer
            .on_request(&request.tenant_id, &request.region_code);
        info!(
            tenant_id = %request.tenant_id,
            user = %hashed_subject(&request.user_id),
            "verification requested"
        );

        loop {
            match self.cache.begin(&request.request_id) {
                Lookup::Hit(decision) => {
                    self.observer.on_cache_hit(&request.region_code);
                    return Ok((*decision).clone());
                }
                Lookup::Wait(mut rx) => {
                    debug!("awaiting in-flight build for request");
                    loop {
                        if let Some(decision) = rx.borrow().clone() {
                            return Ok((*decision).clone());
                        }
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    // Builder abandoned; race for the build slot.
                    continue;
                }
                Lookup::Build(guard) => {
                    let built = self.verify_uncached(cancel, &request).await;
                    return match (built, guard) {
                        (Ok(decision), Some(guard)) => {
                            guard.complete(Arc::new(decision.clone()));
                            debug!(decision_id = %decision.decision_id, "decision cached");
                            Ok(decision)
                        }
                        (Ok(decision), None) => Ok(decision),
                        (Err(err), _guard) => Err(err),
                    };
                }
            }
        }
    }

    async fn verify_uncached(
        &self,
        cancel: &CancelToken,
        request: &VerificationRequest,
    ) -> Result<Decision> {
        let started = tokio::time::Instant::now();

        let snapshot = self.registry.snapshot().await;
        let policy = self.policies.get(&request.region_code).await;
        let compliance = self.compliance.get(&request.region_code).await;

        // Cancellation before a plan exists is the one cancellation case
        // surfaced as an error rather than a denied decision.
        if cancel.is_cancelled() {
            return Err(Error::cancelled(&request.request_id));
        }

        let plan = build_plan(&snapshot, &policy, self.config.default_timeout);
        debug!(
            planned = plan.steps.len(),
            missing_required = plan.synthetic_results.len(),
            "execution plan materialized"
        );

        let outcome = self
            .executor
            .execute(&plan, Arc::new(request.clone()), cancel)
            .await;
        debug!(results = outcome.results.len(), cancelled = outcome.cancelled, "plan executed");

        for result in outcome.results.values() {
            self.observer
                .on_verifier(&result.category, result.status, result.processing_time_ms);
            if result.status == VerifierStatus::Error {
                self.observer.on_verifier_error(&result.category);
            }
        }

        let effective_mfa = policy
            .min_mfa_level
            .or(compliance.as_ref().map(|c| c.min_mfa_level))
            .unwrap_or_default();
        let mut synthesis = scoring::synthesize(
            &outcome.results,
            &plan,
            &policy,
            &snapshot,
            effective_mfa,
            outcome.cancelled,
        );

        if self
            .history
            .as_ref()
            .map(|h| h.is_backlogged())
            .unwrap_or(false)
        {
            synthesis.anomalies.push(audit_backlog_anomaly());
        }

        let requires_dual_approval = policy.requires_dual_approval
            || compliance
                .as_ref()
                .map(|c| c.requires_dual_approval)
                .unwrap_or(false);
        let now = Utc::now();
        let mut audit: HashMap<String, serde_json::Value> = HashMap::new();
        audit.insert("decision_timestamp".to_string(), json!(now.to_rfc3339()));
        audit.insert("engine_version".to_string(), json!(ENGINE_VERSION));
        audit.insert(
            "request_fingerprint".to_string(),
            json!(request.fingerprint()),
        );
        audit.insert("verifiers_executed".to_string(), json!(plan.steps.len()));
        audit.insert(
            "anomaly_count".to_string(),
            json!(synthesis.anomalies.len()),
        );
        audit.insert(
            "requires_dual_approval".to_string(),
            json!(requires_dual_approval),
        );

        let decision = Decision {
            request_id: request.request_id.clone(),
            decision_id: Uuid::new_v4(),
            status: synthesis.status,
            trust_score: synthesis.trust_score,
            trust_level: synthesis.trust_level,
            verifier_results: outcome.results,
            anomalies: synthesis.anomalies,
            recommended_action: synthesis.recommended_action,
            processing_time_ms: started.elapsed().as_millis() as u64,
            timestamp: now,
            audit,
        };

        self.observer.on_decision(
            &request.region_code,
            decision.status,
            decision.trust_score,
            started.elapsed(),
        );
        info!(
            decision_id = %decision.decision_id,
            status = %decision.status,
            trust_score = decision.trust_score,
            user = %hashed_subject(&request.user_id),
            "decision synthesized"
        );

        if let Some(history) = &self.history {
            let retention = policy
                .retention_years
                .or(compliance.as_ref().map(|c| c.retention_years));
            let record = DecisionRecord::new(&decision, request, retention);
            if let Err(err) = history.append(record).await {
                warn!(decision_id = %decision.decision_id, "history append rejected: {}", err);
            }
            debug!(decision_id = %decision.decision_id, "decision logged");
        }

        Ok(decision)
    }

    /// Most recent decisions for a user within a tenant, newest first.
    /// Fails with [`Error::HistoryQueryUnavailable`] when the sink does
    /// not implement reads.
    pub async fn history(
        &self,
        user_id: &str,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        self.history_sink.query(user_id, tenant_id, limit).await
    }

    /// Decision cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop background eviction, await in-flight verifications, and
    /// flush the history stream, all bounded by the shutdown timeout.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("engine closing");
        // notify_one stores a permit, so the eviction task observes the
        // shutdown even if it is mid-sweep rather than parked.
        self.shutdown.notify_one();
        if let Some(handle) = self.eviction.lock().await.take() {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.in_flight.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.in_flight.load(Ordering::Acquire) > 0 {
            warn!("closing with verifications still in flight");
        }

        if let Some(history) = &self.history {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::from_millis(100));
            if !history.close(remaining).await {
                warn!("history drain did not finish before shutdown deadline");
            }
        }
        Ok(())
    }
}

fn audit_backlog_anomaly() -> Anomaly {
    Anomaly {
        kind: "audit_backlog_anomaly".to_string(),
        severity: AnomalySeverity::Critical,
        description: "decision history backlog is spilled and not yet drained".to_string(),
        detection_method: "history_writer".to_string(),
        affected_fields: Vec::new(),
        confidence: 1.0,
    }
}

struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionStatus, RecommendedAction, TrustLevel, VerifierResult};
    use crate::error::VerifierError;
    use crate::history::testing::FlakySink;
    use crate::observe::RecordingObserver;
    use crate::policy::MfaLevel;
    use crate::verifier::{Verifier, VerifyContext};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct ScriptedVerifier {
        category: &'static str,
        delay: Duration,
        score: u8,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedVerifier {
        fn new(category: &'static str, score: u8) -> Self {
            Self {
                category,
                delay: Duration::from_millis(20),
                score,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn slow(category: &'static str, delay: Duration) -> Self {
            Self {
                category,
                delay,
                score: 80,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn calls(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait]
    impl Verifier for ScriptedVerifier {
        fn category(&self) -> &str {
            self.category
        }

        async fn verify(
            &self,
            ctx: &VerifyContext,
            _request: &VerificationRequest,
        ) -> std::result::Result<VerifierResult, VerifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(VerifierResult::ok(self.category, self.score)
                .with_processing_time(ctx.elapsed_ms()))
        }
    }

    fn request(request_id: &str) -> VerificationRequest {
        VerificationRequest::new(request_id, "tenant-a", "user-1", "BR")
    }

    fn handle(verifier: ScriptedVerifier, weight: u32, timeout: Duration) -> VerifierHandle {
        VerifierHandle::new(Arc::new(verifier))
            .with_weight(weight)
            .with_default_timeout(timeout)
    }

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_weighted_approval() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("identity", 90), 2, TIMEOUT))
            .await
            .unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("device", 70), 1, TIMEOUT))
            .await
            .unwrap();
        engine
            .register_policy(
                "BR",
                RegionalPolicy::new(60)
                    .require("identity")
                    .optional("device")
                    .with_min_mfa_level(MfaLevel::Medium),
            )
            .await
            .unwrap();

        let decision = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();

        assert_eq!(decision.trust_score, 83);
        assert_eq!(decision.trust_level, TrustLevel::VeryHigh);
        assert_eq!(decision.status, DecisionStatus::Approved);
        assert_eq!(decision.recommended_action, RecommendedAction::Approve);
        assert!(decision.anomalies.is_empty());
        assert_eq!(decision.verifier_results.len(), 2);
        assert_eq!(decision.audit["engine_version"], json!(ENGINE_VERSION));
        assert_eq!(decision.audit["verifiers_executed"], json!(2));
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_required_verifier_denies() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("device", 80), 1, TIMEOUT))
            .await
            .unwrap();
        engine
            .register_policy("BR", RegionalPolicy::new(60).require("identity").optional("device"))
            .await
            .unwrap();

        let decision = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();

        assert_eq!(decision.status, DecisionStatus::Denied);
        assert_eq!(decision.recommended_action, RecommendedAction::Deny);
        assert_eq!(decision.trust_score, 80);
        assert_eq!(decision.anomalies.len(), 1);
        assert_eq!(
            decision.anomalies[0].affected_fields,
            vec!["missing_required_verifier:identity"]
        );
        assert!(decision.verifier_results.contains_key("identity"));
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_on_optional_verifier() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("a", 80), 1, TIMEOUT))
            .await
            .unwrap();
        engine
            .register_verifier(handle(
                ScriptedVerifier::slow("b", Duration::from_millis(500)),
                1,
                TIMEOUT,
            ))
            .await
            .unwrap();
        engine
            .register_policy("BR", RegionalPolicy::new(60).optional("a").optional("b"))
            .await
            .unwrap();

        let decision = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();

        let b = &decision.verifier_results["b"];
        assert_eq!(b.status, VerifierStatus::Timeout);
        assert_eq!(b.score, 0);
        assert_eq!(decision.trust_score, 40);
        assert_eq!(decision.status, DecisionStatus::Denied);
        assert_eq!(decision.anomalies.len(), 1);
        assert_eq!(decision.anomalies[0].kind, "b_anomaly");
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_up_band_with_high_mfa() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("a", 65), 1, TIMEOUT))
            .await
            .unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("b", 65), 1, TIMEOUT))
            .await
            .unwrap();
        engine
            .register_policy(
                "BR",
                RegionalPolicy::new(60)
                    .optional("a")
                    .optional("b")
                    .with_min_mfa_level(MfaLevel::High),
            )
            .await
            .unwrap();

        let decision = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();

        assert_eq!(decision.trust_score, 65);
        assert_eq!(decision.status, DecisionStatus::Approved);
        assert_eq!(decision.recommended_action, RecommendedAction::StepUpMfa);
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_verifier_execution() {
        let observer = Arc::new(RecordingObserver::new());
        let engine = VerificationEngine::builder()
            .cache_ttl(Duration::from_secs(3600))
            .observer(Arc::clone(&observer) as _)
            .build()
            .unwrap();
        let verifier = ScriptedVerifier::new("identity", 90);
        let calls = verifier.calls();
        engine
            .register_verifier(handle(verifier, 1, TIMEOUT))
            .await
            .unwrap();

        let first = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();
        let second = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counts = observer.snapshot();
        assert_eq!(counts.requests, 2);
        assert_eq!(counts.cache_hits, 1);
        assert_eq!(counts.verifier_runs, 1);
        assert_eq!(engine.cache_stats().hits, 1);
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_flight_produces_denied_decision() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        for category in ["a", "b", "c"] {
            engine
                .register_verifier(handle(
                    ScriptedVerifier::slow(category, Duration::from_secs(1)),
                    1,
                    Duration::from_secs(2),
                ))
                .await
                .unwrap();
        }

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let decision = engine.verify(&cancel, request("req-1")).await.unwrap();

        assert_eq!(decision.status, DecisionStatus::Denied);
        assert_eq!(decision.recommended_action, RecommendedAction::Deny);
        assert_eq!(decision.verifier_results.len(), 3);
        assert!(decision
            .anomalies
            .iter()
            .any(|a| a.kind == "engine_cancelled" && a.severity == AnomalySeverity::Critical));
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_before_plan_is_an_error() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = engine.verify(&cancel, request("req-1")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_request_single_flight() {
        let engine = Arc::new(VerificationEngine::new(EngineConfig::default()).unwrap());
        let verifier = ScriptedVerifier::slow("identity", Duration::from_millis(50));
        let calls = verifier.calls();
        engine
            .register_verifier(handle(verifier, 1, Duration::from_millis(200)))
            .await
            .unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .verify(&CancelToken::new(), request("req-shared"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut decisions = Vec::new();
        for task in tasks {
            decisions.push(task.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for decision in &decisions[1..] {
            assert_eq!(decision, &decisions[0]);
        }
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_records_decisions() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("identity", 90), 1, TIMEOUT))
            .await
            .unwrap();

        let decision = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();

        // The history stream drains asynchronously.
        let records = loop {
            let records = engine.history("user-1", "tenant-a", 10).await.unwrap();
            if !records.is_empty() {
                break records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision_id, decision.decision_id);
        assert_eq!(records[0].trust_score, decision.trust_score);
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_audit_backlog_raises_anomaly() {
        let dir = tempfile::tempdir().unwrap();
        let engine = VerificationEngine::builder()
            .history_sink(Arc::new(FlakySink::failing(10_000)))
            .audit_spill_path(dir.path().join("spill.jsonl"))
            .cache_enabled(false)
            .build()
            .unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("identity", 90), 1, TIMEOUT))
            .await
            .unwrap();

        engine
            .verify(&CancelToken::new(), request("req-0"))
            .await
            .unwrap();

        let mut backlog_seen = false;
        for i in 1..50 {
            let decision = engine
                .verify(&CancelToken::new(), request(&format!("req-{}", i)))
                .await
                .unwrap();
            if decision
                .anomalies
                .iter()
                .any(|a| a.kind == "audit_backlog_anomaly")
            {
                backlog_seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(backlog_seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_new_requests() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        engine.close().await.unwrap();

        let err = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EngineClosed));
        // Idempotent.
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_region_uses_default_policy() {
        let engine = VerificationEngine::builder()
            .default_policy(RegionalPolicy::new(95))
            .build()
            .unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("identity", 90), 1, TIMEOUT))
            .await
            .unwrap();

        let decision = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();

        // 90 is below the default policy's 95 threshold but inside the band.
        assert_eq!(decision.status, DecisionStatus::Review);
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_compliance_supplies_mfa_and_dual_approval() {
        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("identity", 65), 1, TIMEOUT))
            .await
            .unwrap();
        engine
            .register_policy("BR", RegionalPolicy::new(60).require("identity"))
            .await
            .unwrap();
        engine
            .register_compliance(
                "BR",
                ComplianceMetadata::new("LGPD", 5)
                    .with_min_mfa_level(MfaLevel::High)
                    .with_dual_approval(),
            )
            .await
            .unwrap();

        let decision = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();

        // Policy omits the MFA level, so compliance's high level applies.
        assert_eq!(decision.recommended_action, RecommendedAction::StepUpMfa);
        assert_eq!(decision.audit["requires_dual_approval"], json!(true));
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected_at_construction() {
        let err = VerificationEngine::builder()
            .default_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = VerificationEngine::builder()
            .default_policy(RegionalPolicy::new(200))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_auth_verifier_end_to_end() {
        use crate::request::ContextValue;
        use crate::verifier::{AdaptiveAuthVerifier, COMPLETED_FACTORS_KEY};

        let engine = VerificationEngine::new(EngineConfig::default()).unwrap();
        engine
            .register_verifier(
                VerifierHandle::new(Arc::new(AdaptiveAuthVerifier::new()))
                    .with_default_timeout(TIMEOUT),
            )
            .await
            .unwrap();
        engine
            .register_policy("BR", RegionalPolicy::new(60).require("adaptive_auth"))
            .await
            .unwrap();

        let complete = request("req-1").with_level("standard").with_context(
            COMPLETED_FACTORS_KEY,
            ContextValue::public(serde_json::json!(["password", "otp"])),
        );
        let decision = engine.verify(&CancelToken::new(), complete).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Approved);
        assert_eq!(decision.trust_score, 100);

        let missing = request("req-2").with_level("enhanced").with_context(
            COMPLETED_FACTORS_KEY,
            ContextValue::public(serde_json::json!(["password"])),
        );
        let decision = engine.verify(&CancelToken::new(), missing).await.unwrap();
        assert_eq!(decision.trust_score, 33);
        assert_eq!(decision.status, DecisionStatus::Denied);
        assert_eq!(decision.anomalies.len(), 2);
        engine.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_mode_end_to_end() {
        let engine = VerificationEngine::builder().parallel(false).build().unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("identity", 90), 1, TIMEOUT))
            .await
            .unwrap();
        engine
            .register_verifier(handle(ScriptedVerifier::new("device", 70), 1, TIMEOUT))
            .await
            .unwrap();

        let decision = engine
            .verify(&CancelToken::new(), request("req-1"))
            .await
            .unwrap();
        assert_eq!(decision.trust_score, 80);
        assert_eq!(decision.status, DecisionStatus::Approved);
        engine.close().await.unwrap();
    }
}
