//! Solana RPC probes: fee payer funds and current slot

use anyhow::{Context, Result};
use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BlockHeightSource, FeePayerBalance};

/// Checks the fee payer can cover submission fees
pub struct SolanaFeePayer {
    client: Arc<RpcClient>,
    fee_payer: Pubkey,
    min_balance_lamports: u64,
}

impl SolanaFeePayer {
    pub fn new(rpc_url: &str, fee_payer: &str, min_balance_lamports: u64) -> Result<Self> {
        let fee_payer = Pubkey::from_str(fee_payer)
            .with_context(|| format!("Invalid fee payer pubkey: {}", fee_payer))?;
        Ok(Self {
            client: Arc::new(RpcClient::new_with_commitment(
                rpc_url.to_string(),
                CommitmentConfig::confirmed(),
            )),
            fee_payer,
            min_balance_lamports,
        })
    }

    pub fn fee_payer(&self) -> &Pubkey {
        &self.fee_payer
    }
}

#[async_trait]
impl FeePayerBalance for SolanaFeePayer {
    async fn has_usable_balance(&self) -> Result<bool> {
        let lamports = self
            .client
            .get_balance(&self.fee_payer)
            .await
            .context("getBalance failed for fee payer")?;

        let usable = lamports >= self.min_balance_lamports;
        if usable {
            debug!(fee_payer = %self.fee_payer, lamports, "Fee payer balance ok");
        } else {
            warn!(
                fee_payer = %self.fee_payer,
                lamports,
                min_balance_lamports = self.min_balance_lamports,
                "Fee payer balance below minimum"
            );
        }
        Ok(usable)
    }
}

/// Current Solana slot, used as the block height for Solana-side challenges
pub struct SolanaSlotHeight {
    client: Arc<RpcClient>,
}

impl SolanaSlotHeight {
    pub fn new(rpc_url: &str) -> Self {
        Self {
            client: Arc::new(RpcClient::new(rpc_url.to_string())),
        }
    }
}

#[async_trait]
impl BlockHeightSource for SolanaSlotHeight {
    async fn current_height(&self) -> Result<u64> {
        self.client.get_slot().await.context("getSlot failed")
    }
}
