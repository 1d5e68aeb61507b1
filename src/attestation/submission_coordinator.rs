//! Drives one claim through sanity checks, aggregation, submission and
//! evaluation

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

use super::attestation_collector::AttestationCollector;
use super::attestation_errors::{ErrorCode, TypedError};
use crate::clients::LedgerClient;
use crate::observability::CorrelationId;
use crate::types::{AttestationBundle, AttestationPhase, RewardClaim, SubmissionOutcome};

/// Instructions per transaction used by default when submitting
pub const DEFAULT_INSTRUCTIONS_PER_TRANSACTION: usize = 4;

/// Secp verification plus one attestation, for signer collision resubmits
pub const COLLISION_INSTRUCTIONS_PER_TRANSACTION: usize = 2;

/// Per-run inputs that change between batches
#[derive(Debug, Clone)]
pub struct SubmissionContext {
    pub endpoints: Vec<String>,
    pub oracle_endpoint: String,
    pub max_aggregation_attempts: u32,
}

pub struct SubmissionCoordinator {
    collector: AttestationCollector,
    ledger: Arc<dyn LedgerClient>,
    instructions_per_transaction: usize,
}

impl SubmissionCoordinator {
    pub fn new(collector: AttestationCollector, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            collector,
            ledger,
            instructions_per_transaction: DEFAULT_INSTRUCTIONS_PER_TRANSACTION,
        }
    }

    pub fn with_instructions_per_transaction(mut self, instructions: usize) -> Self {
        self.instructions_per_transaction = instructions;
        self
    }

    /// Run the full phase sequence for `claim`.
    ///
    /// Never fails: every error, including a panic inside a collaborator,
    /// comes back as an outcome naming the phase it happened in.
    pub async fn submit_and_evaluate(
        &self,
        claim: &RewardClaim,
        ctx: &SubmissionContext,
    ) -> SubmissionOutcome {
        let correlation_id = CorrelationId::new();
        let span = info_span!(
            "submit_and_evaluate",
            correlation_id = %correlation_id,
            challenge_id = %claim.challenge_id,
            user_id = %claim.user_id,
            specifier = %claim.specifier,
        );

        let phase = Mutex::new(AttestationPhase::SanityChecks);
        let run = AssertUnwindSafe(self.run(claim, ctx, &phase))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(panic) => SubmissionOutcome::failed(*phase.lock(), TypedError::Raw(panic_message(&*panic))),
        };

        let _entered = span.enter();
        if let (Some(err), Some(phase)) = (&outcome.error, outcome.phase) {
            if err.code().is_some_and(|c| c.is_user_facing_denial()) {
                info!(phase = %phase, error = %err, "submit_and_evaluate failed");
            } else {
                error!(phase = %phase, error = %err, "submit_and_evaluate failed");
            }
        }
        outcome
    }

    async fn run(
        &self,
        claim: &RewardClaim,
        ctx: &SubmissionContext,
        phase: &Mutex<AttestationPhase>,
    ) -> SubmissionOutcome {
        let Some(token_amount) = claim.token_amount() else {
            return SubmissionOutcome::failed(AttestationPhase::SanityChecks, ErrorCode::InvalidAmount.into());
        };

        // Aggregate
        *phase.lock() = AttestationPhase::AggregateAttestations;
        info!("Aggregating attestations");
        let collected = self
            .collector
            .collect(claim, &ctx.endpoints, &ctx.oracle_endpoint, ctx.max_aggregation_attempts)
            .await;

        let oracle = match (collected.error, collected.oracle_attestation) {
            (None, Some(oracle)) => oracle,
            (error, _) => {
                let mut outcome = SubmissionOutcome::failed(
                    AttestationPhase::AggregateAttestations,
                    error.unwrap_or_else(|| ErrorCode::AaoAttestationError.into()),
                );
                outcome.nodes_to_reselect = collected.failing_endpoints;
                outcome.oracle_error_code = collected.oracle_error_code;
                return outcome;
            }
        };
        let bundle = AttestationBundle {
            validators: collected.validator_attestations,
            oracle,
        };

        // Submit
        *phase.lock() = AttestationPhase::SubmitAttestations;
        info!(
            validators = bundle.validators.len(),
            token_amount, "Submitting attestations"
        );
        if let Err(err) = self
            .ledger
            .submit(&bundle, claim, token_amount, self.instructions_per_transaction)
            .await
        {
            if !err.code().is_some_and(|c| c.is_signer_collision()) {
                return SubmissionOutcome::failed(AttestationPhase::SubmitAttestations, err);
            }
            warn!(error = %err, "Signer collision, resubmitting one attestation per transaction");
            // Evaluation reports whether the split resubmit landed
            if let Err(retry_err) = self
                .ledger
                .submit(&bundle, claim, token_amount, COLLISION_INSTRUCTIONS_PER_TRANSACTION)
                .await
            {
                warn!(error = %retry_err, "Split resubmit failed");
            }
        }

        // Evaluate
        *phase.lock() = AttestationPhase::EvaluateAttestations;
        info!("Evaluating attestations");
        if let Err(err) = self.ledger.evaluate(claim, token_amount).await {
            return SubmissionOutcome::failed(AttestationPhase::EvaluateAttestations, err);
        }

        SubmissionOutcome::succeeded()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "collaborator panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{claim_fixture, MockLedger, MockOracle, MockValidators};
    use std::time::Duration;

    fn ctx(n: usize) -> SubmissionContext {
        SubmissionContext {
            endpoints: (0..n).map(|i| format!("https://dn{}.test", i)).collect(),
            oracle_endpoint: "https://oracle.test".to_string(),
            max_aggregation_attempts: 2,
        }
    }

    fn coordinator(
        validators: Arc<MockValidators>,
        oracle: Arc<MockOracle>,
        ledger: Arc<MockLedger>,
    ) -> SubmissionCoordinator {
        let collector =
            AttestationCollector::new(validators, oracle).with_retry_delay(Duration::from_millis(1));
        SubmissionCoordinator::new(collector, ledger)
    }

    #[tokio::test]
    async fn test_happy_path() {
        let ledger = Arc::new(MockLedger::new());
        let coordinator = coordinator(
            Arc::new(MockValidators::approving()),
            Arc::new(MockOracle::approving()),
            ledger.clone(),
        );
        let claim = claim_fixture("listen-streak", 5.0, 2, 100);

        let outcome = coordinator.submit_and_evaluate(&claim, &ctx(3)).await;

        assert_eq!(outcome, SubmissionOutcome::succeeded());
        let submits = ledger.submit_calls();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].instructions_per_transaction, DEFAULT_INSTRUCTIONS_PER_TRANSACTION);
        assert_eq!(submits[0].token_amount, 500_000_000);
        assert_eq!(submits[0].validators, 2);
        assert_eq!(ledger.evaluate_calls(), 1);
    }

    #[tokio::test]
    async fn test_fractional_amount_fails_sanity_checks() {
        let ledger = Arc::new(MockLedger::new());
        let oracle = Arc::new(MockOracle::approving());
        let coordinator = coordinator(Arc::new(MockValidators::approving()), oracle.clone(), ledger.clone());
        let claim = claim_fixture("c", 1.5, 2, 100);

        let outcome = coordinator.submit_and_evaluate(&claim, &ctx(3)).await;

        assert_eq!(outcome.phase, Some(AttestationPhase::SanityChecks));
        assert_eq!(outcome.error, Some(TypedError::Code(ErrorCode::InvalidAmount)));
        assert_eq!(oracle.calls(), 0);
        assert!(ledger.submit_calls().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_validators_fails_in_aggregation() {
        let ledger = Arc::new(MockLedger::new());
        let coordinator = coordinator(
            Arc::new(MockValidators::approving()),
            Arc::new(MockOracle::approving()),
            ledger.clone(),
        );
        let claim = claim_fixture("c", 1.0, 3, 100);

        let outcome = coordinator.submit_and_evaluate(&claim, &ctx(2)).await;

        assert!(!outcome.success);
        assert_eq!(outcome.phase, Some(AttestationPhase::AggregateAttestations));
        assert_eq!(
            outcome.error,
            Some(TypedError::Code(ErrorCode::InsufficientDiscoveryNodeCount))
        );
        assert!(ledger.submit_calls().is_empty());
    }

    #[tokio::test]
    async fn test_validator_failure_lists_nodes_to_reselect() {
        let context = ctx(1);
        let validators = Arc::new(MockValidators::approving());
        validators.fail_with(&context.endpoints[0], ErrorCode::InvalidOracle.into());
        let coordinator = coordinator(validators, Arc::new(MockOracle::approving()), Arc::new(MockLedger::new()));
        let claim = claim_fixture("c", 1.0, 1, 100);

        let outcome = coordinator.submit_and_evaluate(&claim, &context).await;

        assert_eq!(outcome.phase, Some(AttestationPhase::AggregateAttestations));
        assert_eq!(outcome.nodes_to_reselect, context.endpoints);
    }

    #[tokio::test]
    async fn test_oracle_rejection_carries_error_code() {
        let coordinator = coordinator(
            Arc::new(MockValidators::approving()),
            Arc::new(MockOracle::rejecting(Some(3))),
            Arc::new(MockLedger::new()),
        );
        let claim = claim_fixture("c", 1.0, 1, 100);

        let outcome = coordinator.submit_and_evaluate(&claim, &ctx(1)).await;

        assert_eq!(outcome.phase, Some(AttestationPhase::AggregateAttestations));
        assert_eq!(
            outcome.error,
            Some(TypedError::Code(ErrorCode::AaoAttestationRejection))
        );
        assert_eq!(outcome.oracle_error_code, Some(3));
    }

    #[tokio::test]
    async fn test_signer_collision_resubmits_once_with_two_instructions() {
        for code in [
            ErrorCode::RepeatedSenders,
            ErrorCode::SignCollision,
            ErrorCode::OperatorCollision,
        ] {
            let ledger = Arc::new(MockLedger::new());
            let claim = claim_fixture("c", 2.0, 2, 100);
            ledger.script_submit(&claim, vec![Err(code.into()), Err(code.into())]);
            let coordinator = coordinator(
                Arc::new(MockValidators::approving()),
                Arc::new(MockOracle::approving()),
                ledger.clone(),
            );

            let outcome = coordinator.submit_and_evaluate(&claim, &ctx(2)).await;

            // Evaluation still runs after a failed resubmit
            assert!(outcome.success, "{:?}", code);
            let submits = ledger.submit_calls();
            assert_eq!(submits.len(), 2);
            assert_eq!(submits[0].instructions_per_transaction, DEFAULT_INSTRUCTIONS_PER_TRANSACTION);
            assert_eq!(submits[1].instructions_per_transaction, COLLISION_INSTRUCTIONS_PER_TRANSACTION);
            assert_eq!(ledger.evaluate_calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_other_submit_error_is_terminal() {
        let ledger = Arc::new(MockLedger::new());
        let claim = claim_fixture("c", 2.0, 1, 100);
        ledger.script_submit(&claim, vec![Err(ErrorCode::AlreadySent.into())]);
        let coordinator = coordinator(
            Arc::new(MockValidators::approving()),
            Arc::new(MockOracle::approving()),
            ledger.clone(),
        );

        let outcome = coordinator.submit_and_evaluate(&claim, &ctx(1)).await;

        assert_eq!(outcome.phase, Some(AttestationPhase::SubmitAttestations));
        assert_eq!(outcome.error, Some(TypedError::Code(ErrorCode::AlreadySent)));
        assert_eq!(ledger.submit_calls().len(), 1);
        assert_eq!(ledger.evaluate_calls(), 0);
    }

    #[tokio::test]
    async fn test_evaluate_error_is_reported_in_evaluate_phase() {
        let ledger = Arc::new(MockLedger::new());
        let claim = claim_fixture("c", 2.0, 1, 100);
        ledger.script_evaluate(&claim, vec![Err(TypedError::Raw("timeout".into()))]);
        let coordinator = coordinator(
            Arc::new(MockValidators::approving()),
            Arc::new(MockOracle::approving()),
            ledger,
        );

        let outcome = coordinator.submit_and_evaluate(&claim, &ctx(1)).await;

        assert_eq!(outcome.phase, Some(AttestationPhase::EvaluateAttestations));
        assert_eq!(outcome.error, Some(TypedError::Raw("timeout".into())));
    }

    #[tokio::test]
    async fn test_collaborator_panic_is_contained() {
        let ledger = Arc::new(MockLedger::new());
        ledger.panic_on_evaluate();
        let coordinator = coordinator(
            Arc::new(MockValidators::approving()),
            Arc::new(MockOracle::approving()),
            ledger,
        );
        let claim = claim_fixture("c", 2.0, 1, 100);

        let outcome = coordinator.submit_and_evaluate(&claim, &ctx(1)).await;

        assert!(!outcome.success);
        assert_eq!(outcome.phase, Some(AttestationPhase::EvaluateAttestations));
        assert!(matches!(outcome.error, Some(TypedError::Raw(_))));
    }
}
