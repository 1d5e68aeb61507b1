//! Attestation Module
//!
//! Per-claim protocol: error taxonomy, attestation aggregation and the
//! submit/evaluate phase driver.

// Submodules
pub mod attestation_collector;
pub mod attestation_errors;
pub mod submission_coordinator;

// Re-exports for convenience
pub use attestation_collector::{AttestationCollector, CollectionOutcome};
pub use attestation_errors::{
    classify, classify_code, oracle_rejection_reason, ErrorClass, ErrorCode, TypedError,
};
pub use submission_coordinator::{SubmissionContext, SubmissionCoordinator};
