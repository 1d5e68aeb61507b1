//! Configuration module for the rewards attester
//!
//! This module handles configuration loading from TOML files, `.env` files
//! and environment variables, and validates the result before startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Batch loop tunables
    #[serde(default)]
    pub attester: AttesterConfig,

    /// Fraud oracle
    pub oracle: OracleConfig,

    /// Validator endpoints attestations are requested from
    #[serde(default)]
    pub validators: ValidatorsConfig,

    /// Undisbursed backlog source
    pub backlog: BacklogConfig,

    /// Ledger relay and fee payer
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttesterConfig {
    /// Claims attested concurrently per batch
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Validator attestations required per claim
    #[serde(default = "default_quorum_size")]
    pub quorum_size: usize,

    /// Attempts per batch, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Validator polling rounds per claim before giving up on lagging nodes
    #[serde(default = "default_max_aggregation_attempts")]
    pub max_aggregation_attempts: u32,

    #[serde(default = "default_cooldown_base_ms")]
    pub cooldown_base_ms: u64,

    #[serde(default = "default_backoff_exponent")]
    pub backoff_exponent: f64,

    #[serde(default = "default_cooldown_max_ms")]
    pub cooldown_max_ms: u64,

    /// Challenges never attested
    #[serde(default)]
    pub challenge_ids_deny_list: Vec<String>,

    /// Challenges whose completion blocks are slots of the alternate chain
    #[serde(default)]
    pub alt_chain_challenge_ids: Vec<String>,

    /// Hold back claims completed less than this many seconds ago. 0 disables.
    #[serde(default)]
    pub run_behind_secs: u64,

    /// JSON-RPC endpoint of the primary chain, used when `run_behind_secs` > 0
    #[serde(default)]
    pub eth_rpc_url: Option<String>,

    /// Initial cursor when no progress has been persisted
    #[serde(default)]
    pub starting_block: u64,

    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub endpoint: String,

    /// Eth address the oracle signs with
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorsConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    pub endpoint: String,

    /// Max entries per backlog page
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Relay that builds and sends ledger transactions
    pub relay_endpoint: String,

    #[serde(default = "default_instructions_per_transaction")]
    pub instructions_per_transaction: usize,

    /// Solana RPC used for the fee payer balance and slot height
    pub rpc_url: String,

    /// Base58 fee payer pubkey
    pub fee_payer: String,

    #[serde(default = "default_min_balance_lamports")]
    pub min_balance_lamports: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_progress_db_path")]
    pub progress_db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Configuration rejected by [`Config::validate`]
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("backoff_exponent must be at least 1.0, got {0}")]
    BackoffExponent(f64),

    #[error("cooldown_max_ms ({max}) is below cooldown_base_ms ({base})")]
    CooldownRange { base: u64, max: u64 },

    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("quorum_size {quorum} exceeds the {available} configured validator endpoints")]
    QuorumTooLarge { quorum: usize, available: usize },

    #[error("run_behind_secs is set but attester.eth_rpc_url is missing")]
    MissingEthRpc,
}

// Default value functions
fn default_parallelism() -> usize { 2 }
fn default_quorum_size() -> usize { 3 }
fn default_max_retries() -> u32 { 5 }
fn default_max_aggregation_attempts() -> u32 { 20 }
fn default_cooldown_base_ms() -> u64 { 2_000 }
fn default_backoff_exponent() -> f64 { 1.8 }
fn default_cooldown_max_ms() -> u64 { 15_000 }
fn default_page_limit() -> usize { 500 }
fn default_instructions_per_transaction() -> usize { 4 }
fn default_min_balance_lamports() -> u64 { 5_000_000 }
fn default_progress_db_path() -> PathBuf { PathBuf::from("attester_progress.db") }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for AttesterConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            quorum_size: default_quorum_size(),
            max_retries: default_max_retries(),
            max_aggregation_attempts: default_max_aggregation_attempts(),
            cooldown_base_ms: default_cooldown_base_ms(),
            backoff_exponent: default_backoff_exponent(),
            cooldown_max_ms: default_cooldown_max_ms(),
            challenge_ids_deny_list: Vec::new(),
            alt_chain_challenge_ids: Vec::new(),
            run_behind_secs: 0,
            eth_rpc_url: None,
            starting_block: 0,
            offset: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            progress_db_path: default_progress_db_path(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with `.env` and environment variable overrides
    pub fn from_file_with_env(path: &str) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override selected fields from `ATTESTER_*` variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ATTESTER_ORACLE_ENDPOINT") {
            self.oracle.endpoint = v;
        }
        if let Some(v) = var("ATTESTER_ORACLE_ADDRESS") {
            self.oracle.address = v;
        }
        if let Some(v) = var("ATTESTER_FEE_PAYER") {
            self.ledger.fee_payer = v;
        }
        if let Some(v) = var("ATTESTER_RPC_URL") {
            self.ledger.rpc_url = v;
        }
        if let Some(v) = var("ATTESTER_BACKLOG_ENDPOINT") {
            self.backlog.endpoint = v;
        }
    }

    /// Reject configurations the attester cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let attester = &self.attester;
        if attester.parallelism == 0 {
            return Err(ConfigError::Zero("attester.parallelism"));
        }
        if attester.quorum_size == 0 {
            return Err(ConfigError::Zero("attester.quorum_size"));
        }
        if attester.max_retries == 0 {
            return Err(ConfigError::Zero("attester.max_retries"));
        }
        if attester.backoff_exponent.is_nan() || attester.backoff_exponent < 1.0 {
            return Err(ConfigError::BackoffExponent(attester.backoff_exponent));
        }
        if attester.cooldown_max_ms < attester.cooldown_base_ms {
            return Err(ConfigError::CooldownRange {
                base: attester.cooldown_base_ms,
                max: attester.cooldown_max_ms,
            });
        }
        if self.backlog.page_limit == 0 {
            return Err(ConfigError::Zero("backlog.page_limit"));
        }
        if self.ledger.instructions_per_transaction == 0 {
            return Err(ConfigError::Zero("ledger.instructions_per_transaction"));
        }
        if self.oracle.endpoint.is_empty() {
            return Err(ConfigError::Missing("oracle.endpoint"));
        }
        if self.oracle.address.is_empty() {
            return Err(ConfigError::Missing("oracle.address"));
        }
        if !self.backlog.endpoint.is_empty() {
            if self.validators.endpoints.is_empty() {
                return Err(ConfigError::Missing("validators.endpoints"));
            }
            if self.validators.endpoints.len() < attester.quorum_size {
                return Err(ConfigError::QuorumTooLarge {
                    quorum: attester.quorum_size,
                    available: self.validators.endpoints.len(),
                });
            }
        }
        if attester.run_behind_secs > 0 && attester.eth_rpc_url.is_none() {
            return Err(ConfigError::MissingEthRpc);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            attester: AttesterConfig::default(),
            oracle: OracleConfig {
                endpoint: "http://localhost:8000".to_string(),
                address: "0x0000000000000000000000000000000000000000".to_string(),
            },
            validators: ValidatorsConfig {
                endpoints: vec![
                    "http://localhost:5001".to_string(),
                    "http://localhost:5002".to_string(),
                    "http://localhost:5003".to_string(),
                ],
            },
            backlog: BacklogConfig {
                endpoint: "http://localhost:5001".to_string(),
                page_limit: default_page_limit(),
            },
            ledger: LedgerConfig {
                relay_endpoint: "http://localhost:7000".to_string(),
                instructions_per_transaction: default_instructions_per_transaction(),
                rpc_url: "http://localhost:8899".to_string(),
                fee_payer: "11111111111111111111111111111111".to_string(),
                min_balance_lamports: default_min_balance_lamports(),
            },
            storage: StorageConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}
