//! Long-running attestation loop over the undisbursed backlog
//!
//! One task owns all attester state. Each cycle pages a batch out of the
//! backlog, runs every claim concurrently, retries what is retryable with
//! backoff, then folds the batch into the cursor. The cursor only moves after
//! the whole batch has resolved, so a shutdown is honoured between batches
//! and never mid-batch.

use anyhow::{Context, Result};
use futures::future::join_all;
use itertools::Itertools;
use std::collections::{HashSet, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::attester_backoff::BackoffScheduler;
use super::attester_delay::AttestationDelayCalculator;
use super::attester_state::{AttesterPhase, AttesterState, StateSink, StateTracker, ValidatorBlocklist};
use crate::attestation::{
    classify, oracle_rejection_reason, ErrorClass, SubmissionContext, SubmissionCoordinator, TypedError,
};
use crate::clients::{BacklogSource, FeePayerBalance, NoOverride, StartingBlockOverride, ValidatorDirectory};
use crate::config::Config;
use crate::metrics::{metrics, Timer};
use crate::progress::{LoggingProgressSink, ProgressSink, ProgressWriter};
use crate::reporting::{spawn_best_effort, ClaimReport, NoopReporter, Reporter};
use crate::types::{AttestationPhase, AttesterCursor, ClaimKey, RewardClaim, SubmissionOutcome};

/// Poll interval while the fee payer is unfunded
pub const FEE_PAYER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Sleep when the backlog is empty
pub const IDLE_DELAY: Duration = Duration::from_secs(1);

/// Sleep after a failed cycle
pub const ERROR_DELAY: Duration = Duration::from_secs(1);

/// Attester tunables
#[derive(Debug, Clone)]
pub struct AttesterOptions {
    pub parallelism: usize,
    pub quorum_size: usize,
    /// Attempts per batch, including the first
    pub max_retries: u32,
    pub max_aggregation_attempts: u32,
    pub backoff: BackoffScheduler,
    pub oracle_endpoint: String,
    pub oracle_address: String,
    pub challenge_ids_deny_list: HashSet<String>,
    /// Challenges numbered in another chain's block space; excluded from the
    /// batch's highest block
    pub alt_chain_challenge_ids: HashSet<String>,
    pub fee_payer_poll_interval: Duration,
    pub idle_delay: Duration,
    pub error_delay: Duration,
}

impl Default for AttesterOptions {
    fn default() -> Self {
        Self {
            parallelism: 2,
            quorum_size: 3,
            max_retries: 5,
            max_aggregation_attempts: 20,
            backoff: BackoffScheduler::default(),
            oracle_endpoint: String::new(),
            oracle_address: String::new(),
            challenge_ids_deny_list: HashSet::new(),
            alt_chain_challenge_ids: HashSet::new(),
            fee_payer_poll_interval: FEE_PAYER_POLL_INTERVAL,
            idle_delay: IDLE_DELAY,
            error_delay: ERROR_DELAY,
        }
    }
}

impl AttesterOptions {
    pub fn from_config(config: &Config) -> Self {
        let attester = &config.attester;
        Self {
            parallelism: attester.parallelism,
            quorum_size: attester.quorum_size,
            max_retries: attester.max_retries,
            max_aggregation_attempts: attester.max_aggregation_attempts,
            backoff: BackoffScheduler::new(
                attester.cooldown_base_ms,
                attester.backoff_exponent,
                attester.cooldown_max_ms,
            ),
            oracle_endpoint: config.oracle.endpoint.clone(),
            oracle_address: config.oracle.address.clone(),
            challenge_ids_deny_list: attester.challenge_ids_deny_list.iter().cloned().collect(),
            alt_chain_challenge_ids: attester.alt_chain_challenge_ids.iter().cloned().collect(),
            ..Self::default()
        }
    }
}

/// Hot update applied between batches. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigUpdate {
    pub oracle_endpoint: Option<String>,
    pub oracle_address: Option<String>,
    pub endpoints: Option<Vec<String>>,
    pub challenge_ids_deny_list: Option<Vec<String>>,
    pub parallelism: Option<usize>,
}

/// A claim the attester stopped working on without disbursing it
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimFailure {
    pub claim: RewardClaim,
    pub error: TypedError,
    pub phase: Option<AttestationPhase>,
}

#[derive(Debug, Default)]
struct BatchResult {
    failures: Vec<ClaimFailure>,
    highest_block: Option<u64>,
    offset: u64,
    success_count: usize,
}

#[derive(Debug, Default)]
struct SortedOutcomes {
    successful: usize,
    /// Skipped for good: already paid, or denied by the oracle
    no_retry: Vec<ClaimFailure>,
    /// Retryable failures on the last attempt
    exhausted: Vec<ClaimFailure>,
    needs_retry: Vec<RewardClaim>,
    should_reselect: bool,
    failing_nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum ReportKind {
    Success,
    Retry,
    Failure,
    OracleRejection,
}

pub struct RewardsAttester {
    options: AttesterOptions,
    cursor: AttesterCursor,
    queue: VecDeque<RewardClaim>,
    recently_processed: HashSet<ClaimKey>,
    endpoints: Vec<String>,
    blocklist: ValidatorBlocklist,
    state: StateTracker,

    coordinator: SubmissionCoordinator,
    backlog: Arc<dyn BacklogSource>,
    directory: Arc<dyn ValidatorDirectory>,
    fee_payer: Arc<dyn FeePayerBalance>,
    reporter: Arc<dyn Reporter>,
    progress: Arc<dyn ProgressSink>,
    progress_writer: Option<ProgressWriter>,
    starting_block_override: Arc<dyn StartingBlockOverride>,
    delay: Option<AttestationDelayCalculator>,
    config_updates: Option<mpsc::UnboundedReceiver<ConfigUpdate>>,
}

impl RewardsAttester {
    pub fn new(
        options: AttesterOptions,
        cursor: AttesterCursor,
        coordinator: SubmissionCoordinator,
        backlog: Arc<dyn BacklogSource>,
        directory: Arc<dyn ValidatorDirectory>,
        fee_payer: Arc<dyn FeePayerBalance>,
    ) -> Self {
        Self {
            options,
            cursor,
            queue: VecDeque::new(),
            recently_processed: HashSet::new(),
            endpoints: Vec::new(),
            blocklist: ValidatorBlocklist::default(),
            state: StateTracker::new(None),
            coordinator,
            backlog,
            directory,
            fee_payer,
            reporter: Arc::new(NoopReporter),
            progress: Arc::new(LoggingProgressSink),
            progress_writer: None,
            starting_block_override: Arc::new(NoOverride),
            delay: None,
            config_updates: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self.progress_writer = None;
        self
    }

    pub fn with_starting_block_override(mut self, provider: Arc<dyn StartingBlockOverride>) -> Self {
        self.starting_block_override = provider;
        self
    }

    pub fn with_state_sink(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.state.set_sink(sink);
        self
    }

    pub fn with_delay_calculator(mut self, delay: AttestationDelayCalculator) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Receive [`ConfigUpdate`]s while running; they apply between batches
    pub fn with_config_updates(mut self, updates: mpsc::UnboundedReceiver<ConfigUpdate>) -> Self {
        self.config_updates = Some(updates);
        self
    }

    pub fn cursor(&self) -> AttesterCursor {
        self.cursor
    }

    pub fn state(&self) -> &AttesterState {
        self.state.state()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn options(&self) -> &AttesterOptions {
        &self.options
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn blocklist(&self) -> &ValidatorBlocklist {
        &self.blocklist
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn start(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            quorum_size = self.options.quorum_size,
            parallelism = self.options.parallelism,
            oracle_endpoint = %self.options.oracle_endpoint,
            oracle_address = %self.options.oracle_address,
            starting_block = self.cursor.starting_block,
            offset = self.cursor.offset,
            "Starting attester"
        );

        self.select_validators().await;

        while !shutdown_requested(&shutdown) {
            match self.run_cycle(&mut shutdown).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => {
                    metrics().cycle_errors.inc();
                    error!(error = %format!("{:#}", e), "Attester cycle failed, sleeping");
                    if wait_or_shutdown(self.options.error_delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.state.set_phase(AttesterPhase::Halted).await;
        info!(
            starting_block = self.cursor.starting_block,
            offset = self.cursor.offset,
            "Attester stopped"
        );
        Ok(())
    }

    /// Attest an explicit list of claims without touching the cursor.
    ///
    /// Returns every claim that ended without a disbursement.
    pub async fn process_claims(&mut self, claims: Vec<RewardClaim>) -> Vec<ClaimFailure> {
        self.select_validators().await;

        let mut to_process: VecDeque<RewardClaim> = claims.into();
        let mut failures = Vec::new();
        while !to_process.is_empty() {
            info!(remaining = to_process.len(), "Processing claims");
            let take = self.options.parallelism.max(1).min(to_process.len());
            let batch: Vec<RewardClaim> = to_process.drain(..take).collect();
            let result = self.attest_batch(batch).await;
            failures.extend(result.failures);
        }

        if !failures.is_empty() {
            error!(failures = failures.len(), "Claims failed during processing");
        }
        failures
    }

    /// Apply a configuration change. Empty values are ignored.
    pub fn update_config(&mut self, update: ConfigUpdate) {
        info!(?update, "Updating attester config");

        if let Some(endpoint) = update.oracle_endpoint.filter(|e| !e.is_empty()) {
            self.options.oracle_endpoint = endpoint;
        }
        if let Some(address) = update.oracle_address.filter(|a| !a.is_empty()) {
            for claim in self.queue.iter_mut() {
                claim.oracle_address = address.clone();
            }
            self.options.oracle_address = address;
        }
        if let Some(endpoints) = update.endpoints.filter(|e| !e.is_empty()) {
            self.endpoints = endpoints;
        }
        if let Some(deny_list) = update.challenge_ids_deny_list {
            self.options.challenge_ids_deny_list = deny_list.into_iter().collect();
        }
        if let Some(parallelism) = update.parallelism.filter(|p| *p > 0) {
            self.options.parallelism = parallelism;
        }
    }

    /// One pass of the loop. `Break` means shutdown was seen while waiting.
    async fn run_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<ControlFlow<()>> {
        self.apply_config_updates();

        if !self.await_fee_payer_balance(shutdown).await? {
            return Ok(ControlFlow::Break(()));
        }
        self.check_starting_block_override().await;
        self.refill_queue_if_needed().await?;

        if self.queue.is_empty() {
            info!("No undisbursed claims, sleeping");
            self.state.set_phase(AttesterPhase::Sleeping).await;
            if wait_or_shutdown(self.options.idle_delay, shutdown).await {
                return Ok(ControlFlow::Break(()));
            }
            return Ok(ControlFlow::Continue(()));
        }

        let take = self.options.parallelism.max(1).min(self.queue.len());
        let batch: Vec<RewardClaim> = self.queue.drain(..take).collect();
        let attempted: HashSet<ClaimKey> = batch.iter().map(|c| c.key()).collect();
        metrics().backlog_queue_len.set(self.queue.len() as i64);

        let result = self.attest_batch(batch).await;

        self.cursor.advance(result.highest_block, result.offset);
        info!(
            starting_block = self.cursor.starting_block,
            offset = self.cursor.offset,
            success_count = result.success_count,
            failures = result.failures.len(),
            "Updated cursor"
        );
        metrics().cursor_starting_block.set(self.cursor.starting_block as i64);
        metrics().cursor_offset.set(self.cursor.offset as i64);

        self.recently_processed = attempted;

        let progress = &self.progress;
        self.progress_writer
            .get_or_insert_with(|| ProgressWriter::spawn(Arc::clone(progress)))
            .submit(self.cursor, result.success_count);

        Ok(ControlFlow::Continue(()))
    }

    fn apply_config_updates(&mut self) {
        let mut pending = Vec::new();
        if let Some(updates) = self.config_updates.as_mut() {
            while let Ok(update) = updates.try_recv() {
                pending.push(update);
            }
        }
        for update in pending {
            self.update_config(update);
        }
    }

    /// Returns `false` if shutdown was requested while waiting.
    async fn await_fee_payer_balance(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        loop {
            if self
                .fee_payer
                .has_usable_balance()
                .await
                .context("Failed to check fee payer balance")?
            {
                return Ok(true);
            }
            warn!("No usable fee payer balance, waiting");
            if wait_or_shutdown(self.options.fee_payer_poll_interval, shutdown).await {
                return Ok(false);
            }
        }
    }

    async fn check_starting_block_override(&mut self) {
        let Some(starting_block) = self.starting_block_override.starting_block_override().await else {
            return;
        };
        info!(
            starting_block,
            "Applying starting block override, clearing queue and recent claims"
        );
        self.cursor = AttesterCursor::new(starting_block, 0);
        self.queue.clear();
        self.recently_processed.clear();
        self.blocklist.clear();
    }

    async fn refill_queue_if_needed(&mut self) -> Result<()> {
        if !self.queue.is_empty() {
            return Ok(());
        }

        info!(
            starting_block = self.cursor.starting_block,
            offset = self.cursor.offset,
            recently_processed = self.recently_processed.len(),
            "Refilling queue"
        );
        self.state.set_phase(AttesterPhase::RefillingQueue).await;

        let entries = self
            .backlog
            .list_undisbursed(self.cursor.offset, self.cursor.starting_block)
            .await
            .context("Failed to fetch undisbursed claims")?;
        let fetched = entries.len();

        let claims: Vec<RewardClaim> = entries
            .into_iter()
            .map(|entry| entry.into_claim(&self.options.oracle_address, self.options.quorum_size))
            .filter(|claim| {
                !self.options.challenge_ids_deny_list.contains(&claim.challenge_id)
                    && !self.recently_processed.contains(&claim.key())
            })
            .collect();

        let claims = match &self.delay {
            Some(delay) if !claims.is_empty() => delay
                .filter_recently_completed(claims, &self.options.alt_chain_challenge_ids)
                .await
                .context("Failed to compute attestation delay thresholds")?,
            _ => claims,
        };

        info!(
            fetched,
            queued = claims.len(),
            filtered = fetched - claims.len(),
            "Refilled queue"
        );
        self.queue = claims.into();
        metrics().backlog_queue_len.set(self.queue.len() as i64);
        Ok(())
    }

    async fn select_validators(&mut self) {
        self.state.set_phase(AttesterPhase::SelectingNodes).await;
        let exclude = self.blocklist.to_set();
        match self
            .directory
            .select_endpoints(self.options.quorum_size, &exclude)
            .await
        {
            Ok(endpoints) => {
                info!(?endpoints, blocklisted = exclude.len(), "Selected validators");
                self.endpoints = endpoints;
                metrics().validator_reselections.inc();
            }
            Err(e) => {
                warn!(error = %e, "Validator selection failed, keeping previous set");
            }
        }
    }

    /// Run one batch to completion, retrying retryable failures with backoff.
    async fn attest_batch(&mut self, batch: Vec<RewardClaim>) -> BatchResult {
        let timer = Timer::new();
        self.state.set_phase(AttesterPhase::Attesting).await;

        let highest_block = batch
            .iter()
            .filter(|claim| !self.options.alt_chain_challenge_ids.contains(&claim.challenge_id))
            .map(|claim| claim.completed_block_number)
            .max();

        info!(
            starting_block = self.cursor.starting_block,
            offset = self.cursor.offset,
            batch = batch.len(),
            highest_block = ?highest_block,
            "Attesting batch"
        );

        let max_attempts = self.options.max_retries.max(1);
        let mut result = BatchResult {
            highest_block,
            ..Default::default()
        };
        let mut pending = batch;
        let mut should_reselect = false;
        let mut attempt: u32 = 0;

        while !pending.is_empty() && attempt < max_attempts {
            if attempt > 0 {
                let delay = self.options.backoff.delay_for(attempt);
                info!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                self.state.set_phase(AttesterPhase::RetryBackoff).await;
                sleep(delay).await;
                self.state.set_phase(AttesterPhase::Attesting).await;
            }
            if should_reselect {
                self.select_validators().await;
            }

            debug!(attempt = attempt + 1, max_attempts, pending = pending.len(), "Attestation attempt");
            let results = self.attempt_round(&pending).await;
            let sorted = self.sort_outcomes(results, attempt + 1 == max_attempts).await;

            if !sorted.failing_nodes.is_empty() {
                info!(failing_nodes = ?sorted.failing_nodes, "Blocklisting failing validators");
                self.blocklist.extend(sorted.failing_nodes);
            }

            result.success_count += sorted.successful;
            result.offset += sorted
                .no_retry
                .iter()
                .filter(|f| Some(f.claim.completed_block_number) == highest_block)
                .count() as u64;
            if !sorted.exhausted.is_empty() {
                error!(
                    gave_up = sorted.exhausted.len(),
                    attempts = attempt + 1,
                    "Gave up on claims after max retries"
                );
            }
            result.failures.extend(sorted.no_retry);
            result.failures.extend(sorted.exhausted);

            pending = sorted.needs_retry;
            should_reselect = sorted.should_reselect;
            attempt += 1;
        }

        timer.observe_duration(&metrics().batch_latency);
        result
    }

    async fn attempt_round(&self, claims: &[RewardClaim]) -> Vec<(RewardClaim, SubmissionOutcome)> {
        let ctx = SubmissionContext {
            endpoints: self.endpoints.clone(),
            oracle_endpoint: self.options.oracle_endpoint.clone(),
            max_aggregation_attempts: self.options.max_aggregation_attempts,
        };
        let ctx = &ctx;

        join_all(claims.iter().map(|claim| async move {
            metrics().attestations_total.inc();
            let timer = Timer::new();
            let outcome = self.coordinator.submit_and_evaluate(claim, ctx).await;
            timer.observe_duration(&metrics().claim_latency);
            (claim.clone(), outcome)
        }))
        .await
    }

    /// Bucket one round of outcomes and fire the matching reports.
    async fn sort_outcomes(
        &mut self,
        results: Vec<(RewardClaim, SubmissionOutcome)>,
        final_attempt: bool,
    ) -> SortedOutcomes {
        let mut sorted = SortedOutcomes::default();
        let mut retry_nodes: Vec<String> = Vec::new();

        for (claim, outcome) in results {
            if outcome.success {
                info!(
                    challenge_id = %claim.challenge_id,
                    user_id = %claim.user_id,
                    amount = claim.amount,
                    "Attested claim"
                );
                metrics().attestations_success.inc();
                sorted.successful += 1;
                self.report(ReportKind::Success, ClaimReport::new(&claim, &outcome));
                continue;
            }

            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| TypedError::Raw("failed without error".to_string()));
            let class = classify(&error);
            let report = ClaimReport::new(&claim, &outcome);

            match class {
                ErrorClass::NoRetry => {
                    info!(
                        challenge_id = %claim.challenge_id,
                        user_id = %claim.user_id,
                        error = %error,
                        "Claim already disbursed, skipping"
                    );
                }
                ErrorClass::OracleRejection => {
                    metrics().oracle_rejections.inc();
                    let reason = oracle_rejection_reason(&error);
                    self.report(ReportKind::OracleRejection, report.with_reason(reason));
                }
                ErrorClass::Retryable | ErrorClass::NeedsReselect if final_attempt => {
                    metrics().attestations_failed.inc();
                    self.report(ReportKind::Failure, report);
                }
                ErrorClass::Retryable | ErrorClass::NeedsReselect => {
                    metrics().attestations_retried.inc();
                    self.report(ReportKind::Retry, report);
                    if class == ErrorClass::NeedsReselect {
                        sorted.should_reselect = true;
                    }
                    retry_nodes.extend(outcome.nodes_to_reselect);
                    sorted.needs_retry.push(claim);
                    continue;
                }
            }

            let failure = ClaimFailure {
                claim,
                error,
                phase: outcome.phase,
            };
            if class.is_terminal() {
                sorted.no_retry.push(failure);
            } else {
                sorted.exhausted.push(failure);
            }
        }

        if sorted.should_reselect {
            sorted.failing_nodes = retry_nodes.into_iter().unique().collect();
        }
        if !sorted.needs_retry.is_empty() {
            info!(
                needs_retry = sorted.needs_retry.len(),
                should_reselect = sorted.should_reselect,
                "Handling retryable failures"
            );
        }

        self.state.record_round(sorted.successful > 0).await;
        sorted
    }

    fn report(&self, kind: ReportKind, report: ClaimReport) {
        let reporter = Arc::clone(&self.reporter);
        let label = match kind {
            ReportKind::Success => "report_success",
            ReportKind::Retry => "report_retry",
            ReportKind::Failure => "report_failure",
            ReportKind::OracleRejection => "report_oracle_rejection",
        };
        spawn_best_effort(label, async move {
            match kind {
                ReportKind::Success => reporter.report_success(report).await,
                ReportKind::Retry => reporter.report_retry(report).await,
                ReportKind::Failure => reporter.report_failure(report).await,
                ReportKind::OracleRejection => reporter.report_oracle_rejection(report).await,
            }
        });
    }
}

/// A closed channel counts as a shutdown request.
fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `delay` unless shutdown is requested first.
/// Returns `true` when the caller should stop.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if shutdown_requested(shutdown) {
        return true;
    }
    tokio::select! {
        _ = sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{AttestationCollector, ErrorCode};
    use crate::test_utils::{
        claim_fixture, settle, undisbursed, MockBacklog, MockDirectory, MockFeePayer, MockLedger,
        MockOracle, MockValidators, RecordingReporter,
    };

    struct Harness {
        validators: Arc<MockValidators>,
        ledger: Arc<MockLedger>,
        directory: Arc<MockDirectory>,
        reporter: Arc<RecordingReporter>,
    }

    fn attester(options: AttesterOptions, backlog: Arc<MockBacklog>) -> (RewardsAttester, Harness) {
        let validators = Arc::new(MockValidators::approving());
        let ledger = Arc::new(MockLedger::new());
        let directory = Arc::new(MockDirectory::with_endpoints(6));
        let reporter = Arc::new(RecordingReporter::default());

        let collector = AttestationCollector::new(validators.clone(), Arc::new(MockOracle::approving()))
            .with_retry_delay(Duration::from_millis(1));
        let coordinator = SubmissionCoordinator::new(collector, ledger.clone());
        let attester = RewardsAttester::new(
            options,
            AttesterCursor::new(0, 0),
            coordinator,
            backlog,
            directory.clone(),
            Arc::new(MockFeePayer::funded()),
        )
        .with_reporter(reporter.clone());

        (
            attester,
            Harness {
                validators,
                ledger,
                directory,
                reporter,
            },
        )
    }

    fn options() -> AttesterOptions {
        AttesterOptions {
            parallelism: 4,
            quorum_size: 2,
            max_retries: 3,
            max_aggregation_attempts: 1,
            backoff: BackoffScheduler::new(1, 1.0, 1),
            ..AttesterOptions::default()
        }
    }

    #[tokio::test]
    async fn test_highest_block_ignores_alt_chain_claims() {
        let mut opts = options();
        opts.alt_chain_challenge_ids.insert("listen-streak".to_string());
        let (mut attester, _h) = attester(opts, Arc::new(MockBacklog::new(vec![])));

        let result = attester
            .attest_batch(vec![
                claim_fixture("profile", 1.0, 2, 40),
                claim_fixture("listen-streak", 1.0, 2, 9_000),
            ])
            .await;

        assert_eq!(result.highest_block, Some(40));
        assert_eq!(result.success_count, 2);
    }

    #[tokio::test]
    async fn test_no_retry_failures_count_only_at_highest_block() {
        let (mut attester, h) = attester(options(), Arc::new(MockBacklog::new(vec![])));
        let at_top = claim_fixture("a", 1.0, 2, 50);
        let below = claim_fixture("b", 1.0, 2, 49);
        h.ledger.fail_submit_always(&at_top, ErrorCode::AlreadySent.into());
        h.ledger.fail_submit_always(&below, ErrorCode::AlreadySent.into());

        let result = attester
            .attest_batch(vec![at_top, below, claim_fixture("c", 1.0, 2, 50)])
            .await;

        assert_eq!(result.offset, 1);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_reported_and_do_not_move_offset() {
        let (mut attester, h) = attester(options(), Arc::new(MockBacklog::new(vec![])));
        let claim = claim_fixture("a", 1.0, 2, 50);
        h.ledger.fail_submit_always(&claim, TypedError::Raw("blockhash expired".into()));

        let result = attester.attest_batch(vec![claim.clone()]).await;
        settle().await;

        assert_eq!(result.offset, 0);
        assert_eq!(h.ledger.submits_for(&claim), 3);
        assert_eq!(h.reporter.retries().len(), 2);
        assert_eq!(h.reporter.failures().len(), 1);
        assert_eq!(result.failures[0].phase, Some(AttestationPhase::SubmitAttestations));
    }

    #[tokio::test]
    async fn test_reselect_blocklists_failing_validators() {
        let (mut attester, h) = attester(options(), Arc::new(MockBacklog::new(vec![])));
        attester.select_validators().await;
        let bad = attester.endpoints()[0].clone();
        h.validators.lag_for(&bad, u32::MAX);

        let claim = claim_fixture("a", 1.0, 2, 50);
        let result = attester.attest_batch(vec![claim]).await;

        assert_eq!(result.success_count, 1);
        assert!(attester.blocklist().to_set().contains(&bad));
        assert!(!attester.endpoints().contains(&bad));
        // Initial selection plus one reselect
        assert_eq!(h.directory.selections(), 2);
    }

    #[tokio::test]
    async fn test_process_claims_returns_terminal_failures() {
        let (mut attester, h) = attester(options(), Arc::new(MockBacklog::new(vec![])));
        let paid = claim_fixture("a", 1.0, 2, 10);
        h.ledger.fail_submit_always(&paid, ErrorCode::AlreadyDisbursed.into());
        let claims = vec![paid, claim_fixture("b", 1.0, 2, 11), claim_fixture("c", 2.5, 2, 12)];

        let failures = attester.process_claims(claims).await;

        let codes: Vec<_> = failures.iter().map(|f| f.error.clone()).collect();
        assert!(codes.contains(&TypedError::Code(ErrorCode::AlreadyDisbursed)));
        assert_eq!(attester.cursor(), AttesterCursor::new(0, 0));
    }

    #[tokio::test]
    async fn test_update_config_ignores_empty_values() {
        let (mut attester, _h) = attester(options(), Arc::new(MockBacklog::new(vec![])));
        attester.update_config(ConfigUpdate {
            oracle_endpoint: Some("https://oracle2.test".to_string()),
            oracle_address: Some(String::new()),
            parallelism: Some(0),
            challenge_ids_deny_list: Some(vec!["x".to_string()]),
            ..Default::default()
        });

        assert_eq!(attester.options().oracle_endpoint, "https://oracle2.test");
        assert_eq!(attester.options().oracle_address, "");
        assert_eq!(attester.options().parallelism, 4);
        assert!(attester.options().challenge_ids_deny_list.contains("x"));
    }

    #[tokio::test]
    async fn test_refill_filters_deny_list_and_recent() {
        let backlog = Arc::new(MockBacklog::new(vec![
            undisbursed("denied", "u1", 5),
            undisbursed("profile", "u1", 5),
            undisbursed("profile", "u2", 6),
        ]));
        let mut opts = options();
        opts.challenge_ids_deny_list.insert("denied".to_string());
        let (mut attester, _h) = attester(opts, backlog);
        attester
            .recently_processed
            .insert(undisbursed("profile", "u1", 5).into_claim("", 2).key());

        attester.refill_queue_if_needed().await.unwrap();

        assert_eq!(attester.queue_len(), 1);
        assert_eq!(attester.queue[0].user_id, "u2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_or_shutdown_wakes_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_or_shutdown(Duration::from_secs(3600), &mut rx).await });
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());

        let (_tx, mut rx) = watch::channel(false);
        assert!(!wait_or_shutdown(Duration::from_millis(10), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!shutdown_requested(&rx));
        drop(tx);
        assert!(shutdown_requested(&rx));
        assert!(wait_or_shutdown(Duration::from_secs(3600), &mut rx).await);
    }
}
