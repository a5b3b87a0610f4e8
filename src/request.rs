//! Verification request model.
//!
//! A request is immutable once it enters the engine. Context values are
//! forwarded to verifiers as-is; values carrying PII must be tagged
//! sensitive so the history record and structured logs can mask them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// An opaque context value forwarded to verifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextValue {
    /// The payload, opaque to the engine
    pub value: Value,
    /// Whether the value must be masked outside the verifier boundary
    #[serde(default)]
    pub sensitive: bool,
}

impl ContextValue {
    /// A value safe to appear in logs and history records.
    pub fn public(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            sensitive: false,
        }
    }

    /// A value that is masked everywhere except the verifier call.
    pub fn sensitive(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            sensitive: true,
        }
    }

    /// The value as seen by history records and logs.
    pub fn masked(&self) -> Value {
        if self.sensitive {
            Value::String("***".to_string())
        } else {
            self.value.clone()
        }
    }
}

/// A cross-verification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    /// Unique request ID; idempotency key for the decision cache
    pub request_id: String,
    /// Tenant the request belongs to
    pub tenant_id: String,
    /// Subject of the verification
    pub user_id: String,
    /// Region whose policy governs this request
    pub region_code: String,
    /// Requested verification level (e.g. "basic", "standard", "enhanced")
    pub verification_level: String,
    /// Downstream offerings this decision gates
    #[serde(default)]
    pub products: Vec<String>,
    /// Optional transaction correlation ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Opaque context forwarded to verifiers
    #[serde(default)]
    pub context: HashMap<String, ContextValue>,
    /// Set by the engine at entry when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl VerificationRequest {
    /// Create a request with the mandatory identifiers.
    pub fn new(
        request_id: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        region_code: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            region_code: region_code.into(),
            verification_level: "standard".to_string(),
            products: Vec::new(),
            transaction_id: None,
            context: HashMap::new(),
            timestamp: None,
        }
    }

    /// Set the verification level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.verification_level = level.into();
        self
    }

    /// Add a gated product.
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.products.push(product.into());
        self
    }

    /// Set the transaction ID.
    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// Add a context value.
    pub fn with_context(mut self, key: impl Into<String>, value: ContextValue) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Content fingerprint for audit correlation.
    ///
    /// Unlike `request_id` (caller-chosen idempotency key) this digests the
    /// fields that determine the decision, so replays with altered content
    /// are distinguishable in the audit stream.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tenant_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.user_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.region_code.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.verification_level.as_bytes());
        hasher.update(b"\n");
        for product in &self.products {
            hasher.update(product.as_bytes());
            hasher.update(b",");
        }
        let mut keys: Vec<&String> = self.context.keys().collect();
        keys.sort();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(self.context[key].value.to_string().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Context with sensitive values masked, for logs and history records.
    pub fn masked_context(&self) -> HashMap<String, Value> {
        self.context
            .iter()
            .map(|(k, v)| (k.clone(), v.masked()))
            .collect()
    }
}
