//! Holds back claims that completed too recently to attest safely
//!
//! Validators index at different speeds, so claims newer than `run_behind`
//! are left in the backlog until every validator has likely caught up. Each
//! block-numbering space gets its own threshold; heights are cached briefly to
//! spare the RPC.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::clients::BlockHeightSource;
use crate::types::RewardClaim;

/// Seconds per block on the primary chain
pub const PRIMARY_SECS_PER_BLOCK: f64 = 1.0;

/// Estimated seconds per Solana slot
pub const ALT_SECS_PER_SLOT: f64 = 0.5;

/// How long a fetched height stays valid
pub const DEFAULT_ALLOWED_STALENESS: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct CachedThreshold {
    threshold: u64,
    at: Instant,
}

struct HeightSpace {
    source: Arc<dyn BlockHeightSource>,
    secs_per_block: f64,
    cached: Mutex<Option<CachedThreshold>>,
}

impl HeightSpace {
    fn new(source: Arc<dyn BlockHeightSource>, secs_per_block: f64) -> Self {
        Self {
            source,
            secs_per_block,
            cached: Mutex::new(None),
        }
    }

    async fn threshold(&self, run_behind: Duration, staleness: Duration) -> Result<u64> {
        let cached = *self.cached.lock();
        if let Some(cached) = cached {
            if cached.at.elapsed() < staleness {
                return Ok(cached.threshold);
            }
        }

        let height = self.source.current_height().await?;
        let behind_blocks = (run_behind.as_secs_f64() / self.secs_per_block) as u64;
        let threshold = height.saturating_sub(behind_blocks);
        *self.cached.lock() = Some(CachedThreshold {
            threshold,
            at: Instant::now(),
        });
        Ok(threshold)
    }
}

pub struct AttestationDelayCalculator {
    primary: HeightSpace,
    alt: HeightSpace,
    run_behind: Duration,
    allowed_staleness: Duration,
}

impl AttestationDelayCalculator {
    pub fn new(
        primary: Arc<dyn BlockHeightSource>,
        alt: Arc<dyn BlockHeightSource>,
        run_behind: Duration,
    ) -> Self {
        Self {
            primary: HeightSpace::new(primary, PRIMARY_SECS_PER_BLOCK),
            alt: HeightSpace::new(alt, ALT_SECS_PER_SLOT),
            run_behind,
            allowed_staleness: DEFAULT_ALLOWED_STALENESS,
        }
    }

    pub fn with_allowed_staleness(mut self, staleness: Duration) -> Self {
        self.allowed_staleness = staleness;
        self
    }

    pub async fn primary_threshold(&self) -> Result<u64> {
        self.primary.threshold(self.run_behind, self.allowed_staleness).await
    }

    pub async fn alt_threshold(&self) -> Result<u64> {
        self.alt.threshold(self.run_behind, self.allowed_staleness).await
    }

    /// Keep only claims at or below their space's threshold.
    ///
    /// Only spaces present in `claims` are queried.
    pub async fn filter_recently_completed(
        &self,
        claims: Vec<RewardClaim>,
        alt_chain_challenge_ids: &HashSet<String>,
    ) -> Result<Vec<RewardClaim>> {
        let on_alt = |claim: &RewardClaim| alt_chain_challenge_ids.contains(&claim.challenge_id);

        let primary = if claims.iter().any(|c| !on_alt(c)) {
            Some(self.primary_threshold().await?)
        } else {
            None
        };
        let alt = if claims.iter().any(|c| on_alt(c)) {
            Some(self.alt_threshold().await?)
        } else {
            None
        };

        let before = claims.len();
        let kept: Vec<RewardClaim> = claims
            .into_iter()
            .filter(|claim| {
                let threshold = if on_alt(claim) { alt } else { primary };
                threshold.is_some_and(|t| claim.completed_block_number <= t)
            })
            .collect();

        if kept.len() < before {
            info!(
                primary_threshold = ?primary,
                alt_threshold = ?alt,
                filtered = before - kept.len(),
                "Filtered out recently completed claims"
            );
        }
        Ok(kept)
    }
}
