//! Regional policies and compliance metadata.
//!
//! Policies govern which verifiers a region requires, how results are
//! weighted, and the acceptance threshold. Compliance metadata carries the
//! per-region regulatory dossier consulted for MFA fallback, retention,
//! and dual-approval marking.

mod compliance;
mod store;

pub use compliance::{ComplianceMetadata, ComplianceTable};
pub use store::{MfaLevel, PolicyStore, RegionalPolicy};
