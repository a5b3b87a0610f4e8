//! Verifier contract: the boundary between the engine and pluggable
//! verification backends.
//!
//! A verifier is any entity exposing `category`, `weight`, and a
//! deadline-bounded `verify`. Variants are registered, not subclassed;
//! the engine interacts with them only through [`Verifier`] and the
//! [`VerifierHandle`] registered for their category.

mod adaptive;

pub use adaptive::{
    AdaptiveAuthVerifier, FactorMatrix, RiskLevel, COMPLETED_FACTORS_KEY, RISK_LEVEL_KEY,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::decision::VerifierResult;
use crate::error::VerifierError;
use crate::request::VerificationRequest;

/// Cooperative cancellation signal shared between a caller and the
/// verifier tasks fanned out for its request.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after arming: cancel() may have landed in between.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Deadline-bounded context handed to each verifier invocation.
#[derive(Clone, Debug)]
pub struct VerifyContext {
    deadline: Duration,
    started: Instant,
    cancel: CancelToken,
}

impl VerifyContext {
    pub fn new(deadline: Duration, cancel: CancelToken) -> Self {
        Self {
            deadline,
            started: Instant::now(),
            cancel,
        }
    }

    /// The per-verifier deadline for this invocation.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.started.elapsed())
    }

    /// Milliseconds elapsed since the invocation started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Whether the caller has cancelled the request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once the caller cancels the request.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A pluggable verification backend.
///
/// Implementations must respect cancellation via the context, must not
/// mutate the request, and report their own timing in the returned result.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Category this verifier covers; unique within a registry.
    fn category(&self) -> &str;

    /// Declared default weight for score composition.
    fn weight(&self) -> u32 {
        1
    }

    /// Inspect the request and produce a result or a typed error.
    async fn verify(
        &self,
        ctx: &VerifyContext,
        request: &VerificationRequest,
    ) -> Result<VerifierResult, VerifierError>;
}

/// Capability flags declared at registration.
#[derive(Clone, Debug, Default)]
pub struct VerifierCapabilities {
    /// Context fields that must be present for the verifier to run.
    /// Missing fields short-circuit to an `error` result without invoking
    /// the verifier.
    pub requires_context_fields: Vec<String>,
}

impl VerifierCapabilities {
    pub fn requires_context(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            requires_context_fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Registry entry: a verifier plus its declared weight, default timeout,
/// and capability flags. Immutable after registration.
#[derive(Clone)]
pub struct VerifierHandle {
    verifier: Arc<dyn Verifier>,
    category: String,
    weight: u32,
    default_timeout: Option<Duration>,
    capabilities: VerifierCapabilities,
}

impl VerifierHandle {
    /// Wrap a verifier, taking category and weight from its contract.
    pub fn new(verifier: Arc<dyn Verifier>) -> Self {
        let category = verifier.category().to_string();
        let weight = verifier.weight();
        Self {
            verifier,
            category,
            weight,
            default_timeout: None,
            capabilities: VerifierCapabilities::default(),
        }
    }

    /// Override the declared weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the default per-invocation deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Declare capability flags.
    pub fn with_capabilities(mut self, capabilities: VerifierCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn capabilities(&self) -> &VerifierCapabilities {
        &self.capabilities
    }

    pub fn verifier(&self) -> Arc<dyn Verifier> {
        Arc::clone(&self.verifier)
    }
}

impl std::fmt::Debug for VerifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierHandle")
            .field("category", &self.category)
            .field("weight", &self.weight)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
