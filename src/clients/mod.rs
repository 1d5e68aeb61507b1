//! External collaborators of the attester
//!
//! Every network dependency sits behind an async trait so the pipeline can be
//! driven by in-memory doubles in tests and by the HTTP/RPC adapters below in
//! production.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

use crate::attestation::TypedError;
use crate::types::{Attestation, AttestationBundle, RewardClaim};

pub mod directory;
pub mod http_clients;
pub mod ledger_relay;
pub mod solana;

pub use directory::StaticValidatorDirectory;
pub use http_clients::{DiscoveryBacklogSource, DiscoveryValidatorClient, EvmBlockHeight, OracleHttpClient};
pub use ledger_relay::{DryRunLedgerClient, RelayLedgerClient};
pub use solana::{SolanaFeePayer, SolanaSlotHeight};

/// One validator's attestation endpoint
#[async_trait]
pub trait ValidatorClient: Send + Sync {
    /// Ask the validator at `endpoint` to attest that `claim` is complete.
    async fn get_attestation(
        &self,
        claim: &RewardClaim,
        endpoint: &str,
    ) -> Result<Attestation, TypedError>;
}

/// Response from the fraud oracle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleResponse {
    /// Present when the oracle approved the claim
    pub signature: Option<String>,
    /// Oracle-specific hint describing a denial
    pub error_code: Option<i64>,
}

/// Fraud/abuse oracle whose single attestation gates all others
#[async_trait]
pub trait OracleClient: Send + Sync {
    async fn get_attestation(
        &self,
        claim: &RewardClaim,
        endpoint: &str,
    ) -> Result<OracleResponse, TypedError>;
}

/// Submission and evaluation against the ledger program.
///
/// Implementations must be safe to call concurrently: one batch issues many
/// submissions at once against the same fee payer.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn submit(
        &self,
        bundle: &AttestationBundle,
        claim: &RewardClaim,
        token_amount: u64,
        instructions_per_transaction: usize,
    ) -> Result<(), TypedError>;

    async fn evaluate(&self, claim: &RewardClaim, token_amount: u64) -> Result<(), TypedError>;
}

/// Backlog entry as listed by the backlog source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndisbursedChallenge {
    pub challenge_id: String,
    pub user_id: String,
    pub specifier: String,
    #[serde(deserialize_with = "amount_from_string_or_number")]
    pub amount: f64,
    pub handle: String,
    pub wallet: String,
    #[serde(rename = "completed_blocknumber")]
    pub completed_block_number: u64,
}

impl UndisbursedChallenge {
    pub fn into_claim(self, oracle_address: &str, quorum_size: usize) -> RewardClaim {
        RewardClaim {
            challenge_id: self.challenge_id,
            specifier: self.specifier,
            user_id: self.user_id,
            handle: self.handle,
            recipient_address: self.wallet,
            amount: self.amount,
            oracle_address: oracle_address.to_string(),
            quorum_size,
            completed_block_number: self.completed_block_number,
        }
    }
}

fn amount_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(f64),
        Text(String),
    }

    match Amount::deserialize(deserializer)? {
        Amount::Number(n) => Ok(n),
        Amount::Text(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom),
    }
}

/// Paged source of rewards that have not been disbursed yet
#[async_trait]
pub trait BacklogSource: Send + Sync {
    async fn list_undisbursed(
        &self,
        offset: u64,
        completed_block_number: u64,
    ) -> Result<Vec<UndisbursedChallenge>>;
}

/// Picks the validator endpoints attestations are requested from
#[async_trait]
pub trait ValidatorDirectory: Send + Sync {
    /// Draw a fresh random set of endpoints, skipping `exclude`.
    async fn select_endpoints(
        &self,
        quorum_size: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<String>>;
}

/// Fee payer funds check
#[async_trait]
pub trait FeePayerBalance: Send + Sync {
    async fn has_usable_balance(&self) -> Result<bool>;
}

/// Latest block (or slot) height of one block-numbering space
#[async_trait]
pub trait BlockHeightSource: Send + Sync {
    async fn current_height(&self) -> Result<u64>;
}

/// Operator escape hatch for repositioning the cursor
#[async_trait]
pub trait StartingBlockOverride: Send + Sync {
    async fn starting_block_override(&self) -> Option<u64>;
}

/// Override provider that never overrides
pub struct NoOverride;

#[async_trait]
impl StartingBlockOverride for NoOverride {
    async fn starting_block_override(&self) -> Option<u64> {
        None
    }
}
