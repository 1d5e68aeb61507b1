//! Test Utilities Module
//!
//! In-memory doubles for every collaborator the attester talks to, plus claim
//! fixtures. All doubles are deterministic and record how they were called.
//!
//! These utilities are only compiled when running tests or when the
//! `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::attestation::{ErrorCode, TypedError};
use crate::clients::{
    BacklogSource, BlockHeightSource, FeePayerBalance, LedgerClient, OracleClient, OracleResponse,
    StartingBlockOverride, UndisbursedChallenge, ValidatorClient, ValidatorDirectory,
};
use crate::progress::ProgressSink;
use crate::reporting::{ClaimReport, Reporter};
use crate::types::{Attestation, AttestationBundle, AttesterCursor, RewardClaim};

pub const TEST_ORACLE_ADDRESS: &str = "0x00000000000000000000000000000000000000aa";

/// Claim for user `user-1` with a specifier unique per challenge and block
pub fn claim_fixture(challenge_id: &str, amount: f64, quorum_size: usize, block: u64) -> RewardClaim {
    RewardClaim {
        challenge_id: challenge_id.to_string(),
        specifier: format!("{}-{}", challenge_id, block),
        user_id: "user-1".to_string(),
        handle: "user1".to_string(),
        recipient_address: "0x0000000000000000000000000000000000000001".to_string(),
        amount,
        oracle_address: TEST_ORACLE_ADDRESS.to_string(),
        quorum_size,
        completed_block_number: block,
    }
}

/// Backlog entry worth one token
pub fn undisbursed(challenge_id: &str, user_id: &str, block: u64) -> UndisbursedChallenge {
    UndisbursedChallenge {
        challenge_id: challenge_id.to_string(),
        user_id: user_id.to_string(),
        specifier: format!("{}:{}", user_id, block),
        amount: 1.0,
        handle: format!("handle-{}", user_id),
        wallet: "0x0000000000000000000000000000000000000002".to_string(),
        completed_block_number: block,
    }
}

/// Well-formed 65 byte hex signature
pub fn valid_signature(seed: u8) -> String {
    format!("0x{}", hex::encode([seed; 65]))
}

/// Let spawned best-effort tasks run to completion
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Validator client answering from in-memory scripts
#[derive(Default)]
pub struct MockValidators {
    calls: Mutex<HashMap<String, usize>>,
    lagging: Mutex<HashMap<String, u32>>,
    failures: Mutex<HashMap<String, TypedError>>,
    responses: Mutex<HashMap<String, Attestation>>,
}

impl MockValidators {
    /// Every endpoint attests on the first call
    pub fn approving() -> Self {
        Self::default()
    }

    /// Answer `CHALLENGE_INCOMPLETE` for the next `calls` requests.
    /// `u32::MAX` lags forever.
    pub fn lag_for(&self, endpoint: &str, calls: u32) {
        self.lagging.lock().insert(endpoint.to_string(), calls);
    }

    pub fn fail_with(&self, endpoint: &str, error: TypedError) {
        self.failures.lock().insert(endpoint.to_string(), error);
    }

    pub fn respond_with(&self, endpoint: &str, attestation: Attestation) {
        self.responses.lock().insert(endpoint.to_string(), attestation);
    }

    pub fn calls_for(&self, endpoint: &str) -> usize {
        self.calls.lock().get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl ValidatorClient for MockValidators {
    async fn get_attestation(&self, _claim: &RewardClaim, endpoint: &str) -> Result<Attestation, TypedError> {
        *self.calls.lock().entry(endpoint.to_string()).or_insert(0) += 1;

        if let Some(error) = self.failures.lock().get(endpoint) {
            return Err(error.clone());
        }
        {
            let mut lagging = self.lagging.lock();
            if let Some(remaining) = lagging.get_mut(endpoint) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(ErrorCode::ChallengeIncomplete.into());
                }
            }
        }
        if let Some(attestation) = self.responses.lock().get(endpoint) {
            return Ok(attestation.clone());
        }

        let seed = endpoint.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        Ok(Attestation {
            signer_address: format!("signer:{}", endpoint),
            signature: valid_signature(seed),
        })
    }
}

#[derive(Clone)]
enum OracleMode {
    Approve,
    Reject(Option<i64>),
    Fail(TypedError),
}

/// Fraud oracle double
pub struct MockOracle {
    mode: Mutex<OracleMode>,
    rejected_users: Mutex<HashMap<String, Option<i64>>>,
    calls: AtomicUsize,
}

impl MockOracle {
    fn with_mode(mode: OracleMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            rejected_users: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn approving() -> Self {
        Self::with_mode(OracleMode::Approve)
    }

    /// Deny every claim with an optional hint code
    pub fn rejecting(error_code: Option<i64>) -> Self {
        Self::with_mode(OracleMode::Reject(error_code))
    }

    pub fn failing(error: TypedError) -> Self {
        Self::with_mode(OracleMode::Fail(error))
    }

    /// Deny claims of one user only
    pub fn reject_user(&self, user_id: &str, error_code: Option<i64>) {
        self.rejected_users.lock().insert(user_id.to_string(), error_code);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OracleClient for MockOracle {
    async fn get_attestation(&self, claim: &RewardClaim, _endpoint: &str) -> Result<OracleResponse, TypedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error_code) = self.rejected_users.lock().get(&claim.user_id) {
            return Ok(OracleResponse {
                signature: None,
                error_code: *error_code,
            });
        }

        let mode = self.mode.lock().clone();
        match mode {
            OracleMode::Approve => Ok(OracleResponse {
                signature: Some(valid_signature(0xaa)),
                error_code: None,
            }),
            OracleMode::Reject(error_code) => Ok(OracleResponse {
                signature: None,
                error_code,
            }),
            OracleMode::Fail(error) => Err(error),
        }
    }
}

/// One recorded `LedgerClient::submit`
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitCall {
    pub transfer_id: String,
    pub instructions_per_transaction: usize,
    pub token_amount: u64,
    pub validators: usize,
}

type Script = HashMap<String, VecDeque<Result<(), TypedError>>>;

/// Ledger double. Successful evaluations mark the claim disbursed, and
/// overlapping submissions of the same claim are flagged.
#[derive(Default)]
pub struct MockLedger {
    submits: Mutex<Vec<SubmitCall>>,
    evaluations: Mutex<Vec<String>>,
    submit_scripts: Mutex<Script>,
    evaluate_scripts: Mutex<Script>,
    submit_always: Mutex<HashMap<String, TypedError>>,
    disbursed: Mutex<HashSet<String>>,
    in_flight: Mutex<HashSet<String>>,
    concurrent_duplicate: AtomicBool,
    panic_on_evaluate: AtomicBool,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results for the next submits of `claim`, in order
    pub fn script_submit(&self, claim: &RewardClaim, results: Vec<Result<(), TypedError>>) {
        self.submit_scripts.lock().insert(claim.transfer_id(), results.into());
    }

    pub fn script_evaluate(&self, claim: &RewardClaim, results: Vec<Result<(), TypedError>>) {
        self.evaluate_scripts.lock().insert(claim.transfer_id(), results.into());
    }

    /// Fail every submit of `claim` once its script is used up
    pub fn fail_submit_always(&self, claim: &RewardClaim, error: TypedError) {
        self.submit_always.lock().insert(claim.transfer_id(), error);
    }

    pub fn panic_on_evaluate(&self) {
        self.panic_on_evaluate.store(true, Ordering::SeqCst);
    }

    pub fn submit_calls(&self) -> Vec<SubmitCall> {
        self.submits.lock().clone()
    }

    pub fn submits_for(&self, claim: &RewardClaim) -> usize {
        let transfer_id = claim.transfer_id();
        self.submits.lock().iter().filter(|c| c.transfer_id == transfer_id).count()
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluations.lock().len()
    }

    pub fn is_disbursed(&self, transfer_id: &str) -> bool {
        self.disbursed.lock().contains(transfer_id)
    }

    pub fn disbursed_count(&self) -> usize {
        self.disbursed.lock().len()
    }

    /// Whether two submissions for the same claim ever overlapped
    pub fn saw_concurrent_duplicate(&self) -> bool {
        self.concurrent_duplicate.load(Ordering::SeqCst)
    }

    fn next_result(script: &Mutex<Script>, transfer_id: &str) -> Option<Result<(), TypedError>> {
        script.lock().get_mut(transfer_id).and_then(|results| results.pop_front())
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn submit(
        &self,
        bundle: &AttestationBundle,
        claim: &RewardClaim,
        token_amount: u64,
        instructions_per_transaction: usize,
    ) -> Result<(), TypedError> {
        let transfer_id = claim.transfer_id();
        if !self.in_flight.lock().insert(transfer_id.clone()) {
            self.concurrent_duplicate.store(true, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;
        self.in_flight.lock().remove(&transfer_id);

        self.submits.lock().push(SubmitCall {
            transfer_id: transfer_id.clone(),
            instructions_per_transaction,
            token_amount,
            validators: bundle.validators.len(),
        });

        if self.disbursed.lock().contains(&transfer_id) {
            return Err(ErrorCode::AlreadyDisbursed.into());
        }
        if let Some(result) = Self::next_result(&self.submit_scripts, &transfer_id) {
            return result;
        }
        match self.submit_always.lock().get(&transfer_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn evaluate(&self, claim: &RewardClaim, _token_amount: u64) -> Result<(), TypedError> {
        if self.panic_on_evaluate.load(Ordering::SeqCst) {
            panic!("ledger evaluation exploded");
        }
        let transfer_id = claim.transfer_id();
        self.evaluations.lock().push(transfer_id.clone());

        let result = Self::next_result(&self.evaluate_scripts, &transfer_id).unwrap_or(Ok(()));
        if result.is_ok() {
            self.disbursed.lock().insert(transfer_id);
        }
        result
    }
}

/// Backlog double paging like the discovery endpoint: entries at or above
/// the starting block, ordered by block, skipping `offset`.
pub struct MockBacklog {
    entries: Mutex<Vec<UndisbursedChallenge>>,
    ledger: Option<Arc<MockLedger>>,
    page_limit: usize,
    calls: Mutex<Vec<(u64, u64)>>,
    failures: AtomicUsize,
}

impl MockBacklog {
    pub fn new(entries: Vec<UndisbursedChallenge>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ledger: None,
            page_limit: 500,
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
        }
    }

    /// Hide entries the ledger has disbursed
    pub fn with_ledger(mut self, ledger: Arc<MockLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit;
        self
    }

    pub fn push(&self, entry: UndisbursedChallenge) {
        self.entries.lock().push(entry);
    }

    /// Fail the next `n` listings
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// `(offset, completed_block_number)` of every listing
    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BacklogSource for MockBacklog {
    async fn list_undisbursed(&self, offset: u64, completed_block_number: u64) -> Result<Vec<UndisbursedChallenge>> {
        self.calls.lock().push((offset, completed_block_number));

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("backlog unavailable");
        }

        let mut page: Vec<UndisbursedChallenge> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.completed_block_number >= completed_block_number)
            .filter(|e| {
                let transfer_id = format!("{}:{}", e.challenge_id, e.specifier);
                !self.ledger.as_ref().is_some_and(|l| l.is_disbursed(&transfer_id))
            })
            .cloned()
            .collect();
        page.sort_by_key(|e| e.completed_block_number);

        Ok(page
            .into_iter()
            .skip(offset as usize)
            .take(self.page_limit)
            .collect())
    }
}

/// Directory with `dn0..dnN` endpoints, picked in order for determinism
pub struct MockDirectory {
    endpoints: Vec<String>,
    excluded: Mutex<Vec<HashSet<String>>>,
}

impl MockDirectory {
    pub fn with_endpoints(count: usize) -> Self {
        Self {
            endpoints: (0..count).map(|i| format!("https://dn{}.test", i)).collect(),
            excluded: Mutex::new(Vec::new()),
        }
    }

    pub fn selections(&self) -> usize {
        self.excluded.lock().len()
    }

    /// Exclude set passed on each selection
    pub fn excluded_history(&self) -> Vec<HashSet<String>> {
        self.excluded.lock().clone()
    }
}

#[async_trait]
impl ValidatorDirectory for MockDirectory {
    async fn select_endpoints(&self, quorum_size: usize, exclude: &HashSet<String>) -> Result<Vec<String>> {
        self.excluded.lock().push(exclude.clone());
        Ok(self
            .endpoints
            .iter()
            .filter(|e| !exclude.contains(*e))
            .take(quorum_size)
            .cloned()
            .collect())
    }
}

pub struct MockFeePayer {
    funded: AtomicBool,
    checks: AtomicUsize,
}

impl MockFeePayer {
    pub fn funded() -> Self {
        Self {
            funded: AtomicBool::new(true),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn unfunded() -> Self {
        Self {
            funded: AtomicBool::new(false),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn set_funded(&self, funded: bool) {
        self.funded.store(funded, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeePayerBalance for MockFeePayer {
    async fn has_usable_balance(&self) -> Result<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.funded.load(Ordering::SeqCst))
    }
}

pub struct MockHeight {
    height: AtomicU64,
    calls: AtomicUsize,
}

impl MockHeight {
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockHeightSource for MockHeight {
    async fn current_height(&self) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.height.load(Ordering::SeqCst))
    }
}

/// Override provider returning scripted values, then `None`
pub struct ScriptedOverride {
    values: Mutex<VecDeque<Option<u64>>>,
}

impl ScriptedOverride {
    pub fn new(values: Vec<Option<u64>>) -> Self {
        Self {
            values: Mutex::new(values.into()),
        }
    }
}

#[async_trait]
impl StartingBlockOverride for ScriptedOverride {
    async fn starting_block_override(&self) -> Option<u64> {
        self.values.lock().pop_front().flatten()
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<(&'static str, ClaimReport)>>,
}

impl RecordingReporter {
    fn of_kind(&self, kind: &str) -> Vec<ClaimReport> {
        self.events
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn successes(&self) -> Vec<ClaimReport> {
        self.of_kind("success")
    }

    pub fn retries(&self) -> Vec<ClaimReport> {
        self.of_kind("retry")
    }

    pub fn failures(&self) -> Vec<ClaimReport> {
        self.of_kind("failure")
    }

    pub fn oracle_rejections(&self) -> Vec<ClaimReport> {
        self.of_kind("oracle_rejection")
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn report_success(&self, report: ClaimReport) -> Result<()> {
        self.events.lock().push(("success", report));
        Ok(())
    }

    async fn report_retry(&self, report: ClaimReport) -> Result<()> {
        self.events.lock().push(("retry", report));
        Ok(())
    }

    async fn report_failure(&self, report: ClaimReport) -> Result<()> {
        self.events.lock().push(("failure", report));
        Ok(())
    }

    async fn report_oracle_rejection(&self, report: ClaimReport) -> Result<()> {
        self.events.lock().push(("oracle_rejection", report));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    persisted: Mutex<Vec<(AttesterCursor, usize)>>,
}

impl RecordingProgress {
    pub fn persisted(&self) -> Vec<(AttesterCursor, usize)> {
        self.persisted.lock().clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingProgress {
    async fn persist(&self, cursor: AttesterCursor, success_count: usize) -> Result<()> {
        self.persisted.lock().push((cursor, success_count));
        Ok(())
    }
}
