//! Ledger submission adapters
//!
//! Signing and broadcasting live behind a relay service; the attester only
//! hands it the attestation bundle and reads back the program error, if any.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::LedgerClient;
use crate::attestation::TypedError;
use crate::types::{AttestationBundle, OracleAttestation, RewardClaim, ValidatorAttestation};

const RELAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    transfer_id: String,
    challenge_id: &'a str,
    specifier: &'a str,
    recipient_eth_address: &'a str,
    token_amount: u64,
    instructions_per_transaction: usize,
    attestations: &'a [ValidatorAttestation],
    oracle_attestation: &'a OracleAttestation,
    #[serde(skip_serializing_if = "Option::is_none")]
    fee_payer: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateRequest<'a> {
    transfer_id: String,
    challenge_id: &'a str,
    specifier: &'a str,
    recipient_eth_address: &'a str,
    oracle_eth_address: &'a str,
    token_amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    fee_payer: Option<&'a str>,
}

/// Relay reply. Unparseable program errors only carry `error`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayResponse {
    error_code: Option<String>,
    error: Option<String>,
}

impl RelayResponse {
    fn into_result(self) -> Result<(), TypedError> {
        match TypedError::from_parts(self.error_code.as_deref(), self.error.as_deref()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Posts submissions and evaluations to a ledger relay over HTTP
pub struct RelayLedgerClient {
    http: Client,
    endpoint: String,
    fee_payer: Option<String>,
}

impl RelayLedgerClient {
    pub fn new(endpoint: impl Into<String>, fee_payer: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(RELAY_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build relay HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            fee_payer,
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), TypedError> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TypedError::Raw(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TypedError::Raw(e.to_string()))?;

        let parsed: RelayResponse = if text.trim().is_empty() {
            RelayResponse::default()
        } else {
            serde_json::from_str(&text).map_err(|_| TypedError::Raw(text.clone()))?
        };

        if !status.is_success() && parsed.error_code.is_none() && parsed.error.is_none() {
            return Err(TypedError::Raw(format!("relay returned HTTP {}", status)));
        }
        parsed.into_result()
    }
}

#[async_trait]
impl LedgerClient for RelayLedgerClient {
    async fn submit(
        &self,
        bundle: &AttestationBundle,
        claim: &RewardClaim,
        token_amount: u64,
        instructions_per_transaction: usize,
    ) -> Result<(), TypedError> {
        let request = SubmitRequest {
            transfer_id: claim.transfer_id(),
            challenge_id: &claim.challenge_id,
            specifier: &claim.specifier,
            recipient_eth_address: &claim.recipient_address,
            token_amount,
            instructions_per_transaction,
            attestations: &bundle.validators,
            oracle_attestation: &bundle.oracle,
            fee_payer: self.fee_payer.as_deref(),
        };
        debug!(transfer_id = %request.transfer_id, instructions_per_transaction, "Submitting attestations");
        self.post("attestations/submit", &request).await
    }

    async fn evaluate(&self, claim: &RewardClaim, token_amount: u64) -> Result<(), TypedError> {
        let request = EvaluateRequest {
            transfer_id: claim.transfer_id(),
            challenge_id: &claim.challenge_id,
            specifier: &claim.specifier,
            recipient_eth_address: &claim.recipient_address,
            oracle_eth_address: &claim.oracle_address,
            token_amount,
            fee_payer: self.fee_payer.as_deref(),
        };
        debug!(transfer_id = %request.transfer_id, "Evaluating attestations");
        self.post("attestations/evaluate", &request).await
    }
}

/// Ledger client for simulation mode: logs what would be sent and succeeds
#[derive(Debug, Default)]
pub struct DryRunLedgerClient {
    submissions: AtomicU64,
    evaluations: AtomicU64,
}

impl DryRunLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LedgerClient for DryRunLedgerClient {
    async fn submit(
        &self,
        bundle: &AttestationBundle,
        claim: &RewardClaim,
        token_amount: u64,
        instructions_per_transaction: usize,
    ) -> Result<(), TypedError> {
        self.submissions.fetch_add(1, Ordering::Relaxed);
        info!(
            transfer_id = %claim.transfer_id(),
            recipient = %claim.recipient_address,
            token_amount,
            validators = bundle.validators.len(),
            instructions_per_transaction,
            "[DRY RUN] Would submit attestations"
        );
        Ok(())
    }

    async fn evaluate(&self, claim: &RewardClaim, token_amount: u64) -> Result<(), TypedError> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        info!(
            transfer_id = %claim.transfer_id(),
            token_amount,
            "[DRY RUN] Would evaluate attestations"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::ErrorCode;

    #[test]
    fn test_relay_response_code_takes_precedence() {
        let response: RelayResponse =
            serde_json::from_str(r#"{"errorCode":"REPEATED_SENDERS","error":"custom program error: 0x5"}"#)
                .unwrap();
        assert_eq!(
            response.into_result(),
            Err(TypedError::Code(ErrorCode::RepeatedSenders))
        );
    }

    #[test]
    fn test_relay_response_raw_message() {
        let response: RelayResponse =
            serde_json::from_str(r#"{"error":"blockhash not found"}"#).unwrap();
        assert_eq!(
            response.into_result(),
            Err(TypedError::Raw("blockhash not found".to_string()))
        );
    }

    #[test]
    fn test_relay_response_empty_is_success() {
        let response: RelayResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response.into_result(), Ok(()));
    }
}
