//! Rewards attester library
//!
//! Drives reward claims from an undisbursed backlog through oracle and
//! validator attestation to on-ledger disbursement.

pub mod attestation;
pub mod attester;
pub mod clients;
pub mod config;
pub mod endpoints;
pub mod metrics;
pub mod observability;
pub mod progress;
pub mod reporting;
pub mod test_utils;
pub mod types;

// Re-export commonly used types
pub use attestation::{AttestationCollector, ErrorCode, SubmissionCoordinator, TypedError};
pub use attester::{AttesterOptions, ConfigUpdate, RewardsAttester};
pub use config::Config;
pub use types::{AttesterCursor, RewardClaim, SubmissionOutcome};
