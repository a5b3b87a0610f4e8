//! # xverify-core
//!
//! Cross-verification orchestration core for identity and access
//! decisions. Given a verification request, the engine selects pluggable
//! verifiers under a regional policy, runs them concurrently with
//! per-verifier deadlines, composes a weighted trust score and anomaly
//! set, derives a status and recommended action, appends the decision to
//! an audit stream, and memoizes it.
//!
//! ## Core Components
//!
//! - **Registry**: category → verifier handle, snapshotted per decision
//! - **Policy**: per-region requirements, weights, and thresholds
//! - **Executor**: deadline-bounded fan-out with cancellation propagation
//! - **Scoring**: trust score, anomalies, and recommended action
//! - **History**: pluggable append-only decision stream
//! - **Engine**: the `verify(request) → decision` façade
//!
//! ## Example
//!
//! ```rust,ignore
//! use xverify_core::{
//!     CancelToken, EngineConfig, RegionalPolicy, VerificationEngine,
//!     VerificationRequest, VerifierHandle,
//! };
//!
//! let engine = VerificationEngine::new(EngineConfig::default())?;
//! engine.register_verifier(VerifierHandle::new(identity_verifier)).await?;
//! engine.register_policy("BR", RegionalPolicy::new(60).require("identity")).await?;
//!
//! let request = VerificationRequest::new("req-1", "tenant-a", "user-1", "BR");
//! let decision = engine.verify(&CancelToken::new(), request).await?;
//! println!("{}: trust {}", decision.status, decision.trust_score);
//! ```

pub mod cache;
pub mod decision;
pub mod engine;
pub mod error;
pub mod executor;
pub mod history;
pub mod observe;
pub mod plan;
pub mod policy;
pub mod registry;
pub mod request;
pub mod scoring;
pub mod verifier;

// Re-exports for convenience
pub use cache::{CacheStats, DecisionCache};
pub use decision::{
    Anomaly, AnomalySeverity, Decision, DecisionStatus, RecommendedAction, TrustLevel,
    VerifierResult, VerifierStatus,
};
pub use engine::{EngineBuilder, EngineConfig, VerificationEngine, ENGINE_VERSION};
pub use error::{Error, Result, VerifierError};
pub use executor::{ExecutionOutcome, Executor, GRACE};
pub use history::{
    DecisionRecord, FileHistorySink, HistorySink, HistoryWriter, MemoryHistorySink,
    SqliteHistorySink, WriterConfig,
};
pub use observe::{
    hashed_subject, DecisionObserver, MetricsObserver, NoopObserver, ObservedCounts,
    RecordingObserver,
};
pub use plan::{build_plan, ExecutionPlan, PlanStep};
pub use policy::{ComplianceMetadata, ComplianceTable, MfaLevel, PolicyStore, RegionalPolicy};
pub use registry::{RegistrySnapshot, VerifierRegistry};
pub use request::{ContextValue, VerificationRequest};
pub use scoring::{weight_for, weighted_trust_score, Synthesis};
pub use verifier::{
    AdaptiveAuthVerifier, CancelToken, FactorMatrix, RiskLevel, Verifier, VerifierCapabilities,
    VerifierHandle, VerifyContext,
};
