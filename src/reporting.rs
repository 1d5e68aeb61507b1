//! Side-channel notifications about claim outcomes
//!
//! Reporting never affects control flow. Calls are spawned as detached tasks
//! and their failures only logged.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use tracing::{info, warn};

use crate::types::{AttestationPhase, RewardClaim, SubmissionOutcome};

/// What a reporter learns about one claim attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimReport {
    pub challenge_id: String,
    pub user_id: String,
    pub specifier: String,
    pub amount: f64,
    pub error: Option<String>,
    pub phase: Option<AttestationPhase>,
    /// Oracle rejection reason: `hcaptcha`, `cognito`, `rejection` or `unknown`
    pub reason: Option<String>,
}

impl ClaimReport {
    pub fn new(claim: &RewardClaim, outcome: &SubmissionOutcome) -> Self {
        Self {
            challenge_id: claim.challenge_id.clone(),
            user_id: claim.user_id.clone(),
            specifier: claim.specifier.clone(),
            amount: claim.amount,
            error: outcome.error.as_ref().map(|e| e.to_string()),
            phase: outcome.phase,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report_success(&self, report: ClaimReport) -> Result<()>;

    /// A retryable failure that will be attempted again in this batch
    async fn report_retry(&self, report: ClaimReport) -> Result<()>;

    /// A failure the attester gave up on
    async fn report_failure(&self, report: ClaimReport) -> Result<()>;

    async fn report_oracle_rejection(&self, report: ClaimReport) -> Result<()>;
}

/// Reporter that drops everything
pub struct NoopReporter;

#[async_trait]
impl Reporter for NoopReporter {
    async fn report_success(&self, _report: ClaimReport) -> Result<()> {
        Ok(())
    }

    async fn report_retry(&self, _report: ClaimReport) -> Result<()> {
        Ok(())
    }

    async fn report_failure(&self, _report: ClaimReport) -> Result<()> {
        Ok(())
    }

    async fn report_oracle_rejection(&self, _report: ClaimReport) -> Result<()> {
        Ok(())
    }
}

/// Reporter that writes each notification to the log
pub struct LoggingReporter;

#[async_trait]
impl Reporter for LoggingReporter {
    async fn report_success(&self, report: ClaimReport) -> Result<()> {
        info!(
            challenge_id = %report.challenge_id,
            user_id = %report.user_id,
            specifier = %report.specifier,
            amount = report.amount,
            "Reward disbursed"
        );
        Ok(())
    }

    async fn report_retry(&self, report: ClaimReport) -> Result<()> {
        info!(
            challenge_id = %report.challenge_id,
            user_id = %report.user_id,
            error = ?report.error,
            phase = ?report.phase,
            "Reward will be retried"
        );
        Ok(())
    }

    async fn report_failure(&self, report: ClaimReport) -> Result<()> {
        warn!(
            challenge_id = %report.challenge_id,
            user_id = %report.user_id,
            amount = report.amount,
            error = ?report.error,
            phase = ?report.phase,
            "Reward attestation failed"
        );
        Ok(())
    }

    async fn report_oracle_rejection(&self, report: ClaimReport) -> Result<()> {
        info!(
            challenge_id = %report.challenge_id,
            user_id = %report.user_id,
            reason = ?report.reason,
            "Reward rejected by oracle"
        );
        Ok(())
    }
}

/// Run a side effect in the background, logging any failure.
pub fn spawn_best_effort<F>(label: &'static str, side_effect: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = side_effect.await {
            warn!(side_effect = label, error = %e, "Best-effort side effect failed");
        }
    });
}
