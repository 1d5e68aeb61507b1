//! Common types used throughout the attester

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::attestation::TypedError;

/// Wrapped token precision used when scaling reward amounts for the ledger.
pub const WRAPPED_TOKEN_DECIMALS: u32 = 8;

/// One unit of payable work tied to a completed challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardClaim {
    pub challenge_id: String,
    /// Unique instance key of the challenge for this user
    pub specifier: String,
    pub user_id: String,
    pub handle: String,
    /// Eth wallet the reward is disbursed to
    pub recipient_address: String,
    /// Whole-token amount, before decimal scaling. Kept as received so the
    /// sanity checks can reject non-integral values.
    pub amount: f64,
    pub oracle_address: String,
    pub quorum_size: usize,
    pub completed_block_number: u64,
}

impl RewardClaim {
    /// Ledger-side dedupe key for this disbursement
    pub fn transfer_id(&self) -> String {
        format!("{}:{}", self.challenge_id, self.specifier)
    }

    pub fn key(&self) -> ClaimKey {
        ClaimKey {
            challenge_id: self.challenge_id.clone(),
            user_id: self.user_id.clone(),
            specifier: self.specifier.clone(),
        }
    }

    /// Integral amount scaled to wrapped token precision.
    ///
    /// Returns `None` for negative, non-integral or overflowing amounts.
    pub fn token_amount(&self) -> Option<u64> {
        if !self.amount.is_finite() || self.amount < 0.0 || self.amount.fract() != 0.0 {
            return None;
        }
        if self.amount > u64::MAX as f64 {
            return None;
        }
        (self.amount as u64).checked_mul(10u64.pow(WRAPPED_TOKEN_DECIMALS))
    }
}

/// Identity of a claim in the backlog, used for dedupe between batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimKey {
    pub challenge_id: String,
    pub user_id: String,
    pub specifier: String,
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.challenge_id, self.user_id, self.specifier)
    }
}

/// A signed statement from a validator or the oracle about a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub signer_address: String,
    pub signature: String,
}

/// The single fraud-oracle attestation gating a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleAttestation(pub Attestation);

/// One member of the validator quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorAttestation(pub Attestation);

/// Everything the ledger needs to verify a disbursement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationBundle {
    pub validators: Vec<ValidatorAttestation>,
    pub oracle: OracleAttestation,
}

/// Processing phase of a single claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttestationPhase {
    SanityChecks,
    AggregateAttestations,
    SubmitAttestations,
    EvaluateAttestations,
}

impl fmt::Display for AttestationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttestationPhase::SanityChecks => "SANITY_CHECKS",
            AttestationPhase::AggregateAttestations => "AGGREGATE_ATTESTATIONS",
            AttestationPhase::SubmitAttestations => "SUBMIT_ATTESTATIONS",
            AttestationPhase::EvaluateAttestations => "EVALUATE_ATTESTATIONS",
        };
        f.write_str(s)
    }
}

/// Result of one `submit_and_evaluate` run. Never an `Err`: failures carry the
/// phase they happened in.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub success: bool,
    pub error: Option<TypedError>,
    pub phase: Option<AttestationPhase>,
    /// Validator endpoints that returned a final error during aggregation
    pub nodes_to_reselect: Vec<String>,
    /// Numeric hint from the oracle explaining a rejection
    pub oracle_error_code: Option<i64>,
}

impl SubmissionOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            error: None,
            phase: None,
            nodes_to_reselect: Vec::new(),
            oracle_error_code: None,
        }
    }

    pub fn failed(phase: AttestationPhase, error: TypedError) -> Self {
        Self {
            success: false,
            error: Some(error),
            phase: Some(phase),
            nodes_to_reselect: Vec::new(),
            oracle_error_code: None,
        }
    }
}

/// Resumable pagination position into the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttesterCursor {
    pub starting_block: u64,
    pub offset: u64,
}

impl AttesterCursor {
    pub fn new(starting_block: u64, offset: u64) -> Self {
        Self {
            starting_block,
            offset,
        }
    }

    /// Fold one resolved batch into the cursor.
    ///
    /// The batch offset accumulates while the starting block stays put and
    /// replaces the offset once the block moves. `highest_block` of `None`
    /// leaves `starting_block` unchanged and replaces the offset.
    pub fn advance(&mut self, highest_block: Option<u64>, batch_offset: u64) {
        match highest_block {
            Some(highest) => {
                // Never move backwards without a restart
                let next_start = highest.saturating_sub(1).max(self.starting_block);
                if next_start == self.starting_block {
                    self.offset += batch_offset;
                } else {
                    self.offset = batch_offset;
                }
                self.starting_block = next_start;
            }
            None => {
                self.offset = batch_offset;
            }
        }
    }
}
