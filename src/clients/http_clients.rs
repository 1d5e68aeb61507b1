//! HTTP adapters for validators, the oracle, the backlog and an EVM-style
//! block height source

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{BacklogSource, BlockHeightSource, OracleClient, OracleResponse, UndisbursedChallenge, ValidatorClient};
use crate::attestation::TypedError;
use crate::types::{Attestation, RewardClaim};

/// Oracle requests are abandoned after this long
pub const ORACLE_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Pull the error identifier out of a non-success response body.
async fn error_from_response(response: Response) -> TypedError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.error.or(b.message))
        .unwrap_or(body);
    let message = message.trim();

    if message.is_empty() {
        TypedError::Raw(format!("HTTP {}", status))
    } else {
        TypedError::parse(message)
    }
}

// -- Validators ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ValidatorEnvelope {
    data: ValidatorAttestationBody,
}

#[derive(Debug, Deserialize)]
struct ValidatorAttestationBody {
    owner_wallet: String,
    attestation: String,
}

/// Validator attestation endpoint client
pub struct DiscoveryValidatorClient {
    http: Client,
}

impl DiscoveryValidatorClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_client(DEFAULT_REQUEST_TIMEOUT)?,
        })
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl ValidatorClient for DiscoveryValidatorClient {
    async fn get_attestation(
        &self,
        claim: &RewardClaim,
        endpoint: &str,
    ) -> Result<Attestation, TypedError> {
        let url = format!(
            "{}/v1/challenges/{}/attest",
            endpoint.trim_end_matches('/'),
            claim.challenge_id
        );
        debug!(url = %url, user_id = %claim.user_id, "Requesting validator attestation");

        let response = self
            .http
            .get(&url)
            .query(&[
                ("user_id", claim.user_id.as_str()),
                ("oracle", claim.oracle_address.as_str()),
                ("specifier", claim.specifier.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TypedError::Raw(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let envelope: ValidatorEnvelope = response
            .json()
            .await
            .map_err(|e| TypedError::Raw(e.to_string()))?;

        Ok(Attestation {
            signer_address: envelope.data.owner_wallet,
            signature: envelope.data.attestation,
        })
    }
}

// -- Oracle -------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OracleRequest<'a> {
    challenge_id: &'a str,
    challenge_specifier: &'a str,
    amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OracleBody {
    /// Signature on approval, `false` on denial
    result: serde_json::Value,
    error_code: Option<i64>,
}

/// Fraud oracle client
pub struct OracleHttpClient {
    http: Client,
}

impl OracleHttpClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_client(ORACLE_REQUEST_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl OracleClient for OracleHttpClient {
    async fn get_attestation(
        &self,
        claim: &RewardClaim,
        endpoint: &str,
    ) -> Result<OracleResponse, TypedError> {
        let url = format!("{}/attestation/{}", endpoint.trim_end_matches('/'), claim.handle);
        let body = OracleRequest {
            challenge_id: &claim.challenge_id,
            challenge_specifier: &claim.specifier,
            amount: claim.amount,
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TypedError::Raw(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: OracleBody = response
            .json()
            .await
            .map_err(|e| TypedError::Raw(e.to_string()))?;

        let signature = match body.result {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        };

        Ok(OracleResponse {
            signature,
            error_code: body.error_code,
        })
    }
}

// -- Backlog ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BacklogEnvelope {
    data: Vec<UndisbursedChallenge>,
}

/// Pages through undisbursed challenges on one discovery node
pub struct DiscoveryBacklogSource {
    http: Client,
    endpoint: String,
    page_limit: usize,
}

impl DiscoveryBacklogSource {
    pub fn new(endpoint: impl Into<String>, page_limit: usize) -> Result<Self> {
        Ok(Self {
            http: build_client(DEFAULT_REQUEST_TIMEOUT)?,
            endpoint: endpoint.into(),
            page_limit,
        })
    }
}

#[async_trait]
impl BacklogSource for DiscoveryBacklogSource {
    async fn list_undisbursed(
        &self,
        offset: u64,
        completed_block_number: u64,
    ) -> Result<Vec<UndisbursedChallenge>> {
        let url = format!(
            "{}/v1/challenges/undisbursed",
            self.endpoint.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .query(&[
                ("offset", offset.to_string()),
                ("completed_blocknumber", completed_block_number.to_string()),
                ("limit", self.page_limit.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("Backlog request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Backlog source returned {}: {}", status, body));
        }

        let envelope: BacklogEnvelope = response
            .json()
            .await
            .context("Malformed backlog response")?;
        Ok(envelope.data)
    }
}

// -- Block height ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

/// Current block number of an EVM-style chain via `eth_blockNumber`
pub struct EvmBlockHeight {
    http: Client,
    rpc_url: String,
}

impl EvmBlockHeight {
    pub fn new(rpc_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: build_client(DEFAULT_REQUEST_TIMEOUT)?,
            rpc_url: rpc_url.into(),
        })
    }
}

#[async_trait]
impl BlockHeightSource for EvmBlockHeight {
    async fn current_height(&self) -> Result<u64> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_blockNumber",
            "params": [],
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .context("eth_blockNumber request failed")?;

        if response.status() != StatusCode::OK {
            return Err(anyhow!("eth_blockNumber returned {}", response.status()));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .context("Malformed eth_blockNumber response")?;

        if let Some(error) = body.error {
            return Err(anyhow!("eth_blockNumber error: {}", error));
        }

        let hex_height = body
            .result
            .ok_or_else(|| anyhow!("eth_blockNumber returned no result"))?;
        u64::from_str_radix(hex_height.trim_start_matches("0x"), 16)
            .with_context(|| format!("Invalid block number {}", hex_height))
    }
}
