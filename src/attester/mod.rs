//! Attester: backlog loop, retry policy and operational state

// Submodules
pub mod attester_backoff;
pub mod attester_delay;
pub mod attester_state;
pub mod rewards_attester;

// Re-exports for convenience
pub use attester_backoff::BackoffScheduler;
pub use attester_delay::AttestationDelayCalculator;
pub use attester_state::{AttesterPhase, AttesterState, StateSink, StateTracker, ValidatorBlocklist};
pub use rewards_attester::{AttesterOptions, ClaimFailure, ConfigUpdate, RewardsAttester};
