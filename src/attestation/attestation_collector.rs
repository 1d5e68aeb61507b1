//! Oracle-first attestation aggregation with bounded validator polling
//!
//! The oracle is asked first because it is the cheaper check and a denial makes
//! validator attestations moot. Validators are then fanned out in parallel.
//! Validators that have not yet seen the challenge complete are polled again,
//! only the still-pending subset, for a bounded number of rounds.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::attestation_errors::{ErrorCode, TypedError};
use crate::clients::directory::sample_endpoints;
use crate::clients::{OracleClient, ValidatorClient};
use crate::types::{Attestation, OracleAttestation, RewardClaim, ValidatorAttestation};

/// Fixed pause between validator polling rounds
pub const DEFAULT_AGGREGATION_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Length in bytes of an `r || s || v` recoverable signature
const RECOVERABLE_SIGNATURE_LEN: usize = 65;

/// Everything gathered for one claim
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionOutcome {
    pub validator_attestations: Vec<ValidatorAttestation>,
    pub oracle_attestation: Option<OracleAttestation>,
    pub error: Option<TypedError>,
    /// Validator endpoints that returned a final error
    pub failing_endpoints: Vec<String>,
    /// Oracle denial hint, when the oracle rejected the claim
    pub oracle_error_code: Option<i64>,
}

impl CollectionOutcome {
    fn failure(error: impl Into<TypedError>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Gathers the oracle attestation and a quorum of validator attestations
pub struct AttestationCollector {
    validators: Arc<dyn ValidatorClient>,
    oracle: Arc<dyn OracleClient>,
    retry_delay: Duration,
}

impl AttestationCollector {
    pub fn new(validators: Arc<dyn ValidatorClient>, oracle: Arc<dyn OracleClient>) -> Self {
        Self {
            validators,
            oracle,
            retry_delay: DEFAULT_AGGREGATION_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Collect attestations for `claim`.
    ///
    /// `max_attempts` bounds the extra polling rounds for lagging validators,
    /// so at most `max_attempts + 1` rounds of validator requests are issued.
    pub async fn collect(
        &self,
        claim: &RewardClaim,
        endpoints: &[String],
        oracle_endpoint: &str,
        max_attempts: u32,
    ) -> CollectionOutcome {
        let selected = sample_endpoints(endpoints, claim.quorum_size);
        if selected.len() < claim.quorum_size {
            warn!(
                challenge_id = %claim.challenge_id,
                quorum_size = claim.quorum_size,
                available = selected.len(),
                "Not enough validator endpoints for quorum"
            );
            return CollectionOutcome::failure(ErrorCode::InsufficientDiscoveryNodeCount);
        }

        let oracle_attestation = match self.request_oracle(claim, oracle_endpoint).await {
            Ok(attestation) => attestation,
            Err(outcome) => return outcome,
        };

        let finals = self.poll_validators(claim, selected, max_attempts).await;

        let failing: Vec<(String, TypedError)> = finals
            .iter()
            .filter_map(|(endpoint, result)| {
                result
                    .as_ref()
                    .err()
                    .map(|e| (endpoint.clone(), e.clone()))
            })
            .collect();

        if let Some((_, first_error)) = failing.first() {
            info!(
                challenge_id = %claim.challenge_id,
                user_id = %claim.user_id,
                error = %first_error,
                failing = failing.len(),
                "Failed to aggregate validator attestations"
            );
            return CollectionOutcome {
                error: Some(first_error.clone()),
                failing_endpoints: failing.into_iter().map(|(endpoint, _)| endpoint).collect(),
                ..Default::default()
            };
        }

        let validator_attestations: Vec<ValidatorAttestation> = finals
            .into_iter()
            .filter_map(|(_, result)| result.ok().map(ValidatorAttestation))
            .collect();

        if validator_attestations.len() < claim.quorum_size {
            return CollectionOutcome::failure(ErrorCode::InsufficientDiscoveryNodeCount);
        }

        info!(
            challenge_id = %claim.challenge_id,
            user_id = %claim.user_id,
            attestations = validator_attestations.len(),
            "Aggregated attestations"
        );

        CollectionOutcome {
            validator_attestations,
            oracle_attestation: Some(oracle_attestation),
            ..Default::default()
        }
    }

    async fn request_oracle(
        &self,
        claim: &RewardClaim,
        oracle_endpoint: &str,
    ) -> Result<OracleAttestation, CollectionOutcome> {
        match self.oracle.get_attestation(claim, oracle_endpoint).await {
            Ok(response) => match response.signature.filter(|s| !s.is_empty()) {
                Some(signature) => Ok(OracleAttestation(Attestation {
                    signer_address: claim.oracle_address.clone(),
                    signature,
                })),
                None => {
                    info!(
                        challenge_id = %claim.challenge_id,
                        user_id = %claim.user_id,
                        oracle_error_code = ?response.error_code,
                        "Oracle rejected attestation"
                    );
                    Err(CollectionOutcome {
                        error: Some(ErrorCode::AaoAttestationRejection.into()),
                        oracle_error_code: response.error_code,
                        ..Default::default()
                    })
                }
            },
            Err(err) => {
                warn!(
                    challenge_id = %claim.challenge_id,
                    user_id = %claim.user_id,
                    error = %err,
                    "Failed to get oracle attestation"
                );
                // Known oracle denials pass through; transport faults collapse
                let error = match err {
                    TypedError::Code(code) => TypedError::Code(code),
                    TypedError::Raw(_) => ErrorCode::AaoAttestationError.into(),
                };
                Err(CollectionOutcome::failure(error))
            }
        }
    }

    /// Poll `endpoints` until every one has a final answer or the round
    /// budget runs out. On the last round lagging answers are kept as final.
    async fn poll_validators(
        &self,
        claim: &RewardClaim,
        endpoints: Vec<String>,
        max_attempts: u32,
    ) -> Vec<(String, Result<Attestation, TypedError>)> {
        let mut finals = Vec::with_capacity(endpoints.len());
        let mut pending = endpoints;
        let mut round: u32 = 0;

        loop {
            if round > 0 {
                sleep(self.retry_delay).await;
            }
            debug!(
                challenge_id = %claim.challenge_id,
                round,
                pending = pending.len(),
                "Requesting validator attestations"
            );

            let responses = join_all(pending.iter().map(|endpoint| async move {
                let result = self.request_validator(claim, endpoint).await;
                (endpoint.clone(), result)
            }))
            .await;

            let final_round = round >= max_attempts;
            let mut still_pending = Vec::new();
            for (endpoint, result) in responses {
                let lagging = matches!(&result, Err(e) if e.code().is_some_and(|c| c.is_validator_lag()));
                if lagging && !final_round {
                    info!(
                        challenge_id = %claim.challenge_id,
                        endpoint = %endpoint,
                        "Validator has not seen challenge complete yet"
                    );
                    still_pending.push(endpoint);
                } else {
                    finals.push((endpoint, result));
                }
            }

            pending = still_pending;
            round += 1;
            if pending.is_empty() {
                break;
            }
        }

        finals
    }

    async fn request_validator(
        &self,
        claim: &RewardClaim,
        endpoint: &str,
    ) -> Result<Attestation, TypedError> {
        match self.validators.get_attestation(claim, endpoint).await {
            Ok(attestation) if is_recoverable_signature(&attestation.signature) => Ok(attestation),
            Ok(_) => {
                warn!(endpoint, "Validator returned a malformed signature");
                Err(ErrorCode::DiscoveryNodeUnknownResponse.into())
            }
            Err(TypedError::Code(code)) => Err(TypedError::Code(code)),
            Err(TypedError::Raw(message)) => {
                warn!(endpoint, error = %message, "Unrecognised validator response");
                Err(ErrorCode::DiscoveryNodeUnknownResponse.into())
            }
        }
    }
}

/// `0x`-prefixed hex encoding of a 65 byte recoverable signature
fn is_recoverable_signature(signature: &str) -> bool {
    let stripped = signature.strip_prefix("0x").unwrap_or(signature);
    hex::decode(stripped)
        .map(|bytes| bytes.len() == RECOVERABLE_SIGNATURE_LEN)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{claim_fixture, valid_signature, MockOracle, MockValidators};

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://dn{}.test", i)).collect()
    }

    fn collector(validators: Arc<MockValidators>, oracle: Arc<MockOracle>) -> AttestationCollector {
        AttestationCollector::new(validators, oracle).with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_happy_path_returns_exact_quorum() {
        let validators = Arc::new(MockValidators::approving());
        let oracle = Arc::new(MockOracle::approving());
        let claim = claim_fixture("c1", 5.0, 2, 100);

        let outcome = collector(validators.clone(), oracle)
            .collect(&claim, &endpoints(4), "https://oracle.test", 3)
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.validator_attestations.len(), 2);
        assert!(outcome.oracle_attestation.is_some());
        assert_eq!(validators.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_endpoints_fails_before_network() {
        let validators = Arc::new(MockValidators::approving());
        let oracle = Arc::new(MockOracle::approving());
        let claim = claim_fixture("c1", 5.0, 3, 100);

        let outcome = collector(validators.clone(), oracle.clone())
            .collect(&claim, &endpoints(2), "https://oracle.test", 3)
            .await;

        assert_eq!(
            outcome.error,
            Some(TypedError::Code(ErrorCode::InsufficientDiscoveryNodeCount))
        );
        assert_eq!(oracle.calls(), 0);
        assert_eq!(validators.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_oracle_rejection_skips_validators() {
        let validators = Arc::new(MockValidators::approving());
        let oracle = Arc::new(MockOracle::rejecting(Some(7)));
        let claim = claim_fixture("c1", 5.0, 2, 100);

        let outcome = collector(validators.clone(), oracle)
            .collect(&claim, &endpoints(2), "https://oracle.test", 3)
            .await;

        assert_eq!(
            outcome.error,
            Some(TypedError::Code(ErrorCode::AaoAttestationRejection))
        );
        assert_eq!(outcome.oracle_error_code, Some(7));
        assert_eq!(validators.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_oracle_transport_error_maps_to_oracle_error() {
        let validators = Arc::new(MockValidators::approving());
        let oracle = Arc::new(MockOracle::failing(TypedError::Raw("connection reset".into())));
        let claim = claim_fixture("c1", 5.0, 2, 100);

        let outcome = collector(validators, oracle)
            .collect(&claim, &endpoints(2), "https://oracle.test", 3)
            .await;

        assert_eq!(
            outcome.error,
            Some(TypedError::Code(ErrorCode::AaoAttestationError))
        );
    }

    #[tokio::test]
    async fn test_lagging_validator_is_polled_until_complete() {
        let eps = endpoints(2);
        let validators = Arc::new(MockValidators::approving());
        validators.lag_for(&eps[0], 2);
        let oracle = Arc::new(MockOracle::approving());
        let claim = claim_fixture("c1", 5.0, 2, 100);

        let outcome = collector(validators.clone(), oracle)
            .collect(&claim, &eps, "https://oracle.test", 5)
            .await;

        assert!(outcome.is_success());
        assert_eq!(validators.calls_for(&eps[0]), 3);
        // Completed validators are not asked again
        assert_eq!(validators.calls_for(&eps[1]), 1);
    }

    #[tokio::test]
    async fn test_bounded_rounds_for_permanently_lagging_validator() {
        let eps = endpoints(3);
        let validators = Arc::new(MockValidators::approving());
        for endpoint in &eps {
            validators.lag_for(endpoint, u32::MAX);
        }
        let oracle = Arc::new(MockOracle::approving());
        let claim = claim_fixture("c1", 5.0, 3, 100);

        let max_attempts = 4;
        let outcome = collector(validators.clone(), oracle)
            .collect(&claim, &eps, "https://oracle.test", max_attempts)
            .await;

        for endpoint in &eps {
            assert_eq!(validators.calls_for(endpoint), (max_attempts + 1) as usize);
        }
        assert_eq!(
            outcome.error,
            Some(TypedError::Code(ErrorCode::ChallengeIncomplete))
        );
        assert_eq!(outcome.failing_endpoints.len(), 3);
        assert!(outcome.validator_attestations.is_empty());
    }

    #[tokio::test]
    async fn test_final_validator_error_surfaces_failing_endpoint() {
        let eps = endpoints(3);
        let validators = Arc::new(MockValidators::approving());
        validators.fail_with(&eps[1], ErrorCode::InvalidOracle.into());
        let oracle = Arc::new(MockOracle::approving());
        let claim = claim_fixture("c1", 5.0, 3, 100);

        let outcome = collector(validators.clone(), oracle)
            .collect(&claim, &eps, "https://oracle.test", 3)
            .await;

        assert_eq!(outcome.error, Some(TypedError::Code(ErrorCode::InvalidOracle)));
        assert_eq!(outcome.failing_endpoints, vec![eps[1].clone()]);
        // Final errors are not polled again
        assert_eq!(validators.calls_for(&eps[1]), 1);
    }

    #[tokio::test]
    async fn test_malformed_signature_is_unknown_response() {
        let eps = endpoints(1);
        let validators = Arc::new(MockValidators::approving());
        validators.respond_with(
            &eps[0],
            Attestation {
                signer_address: "0xdn".to_string(),
                signature: "0x1234".to_string(),
            },
        );
        let oracle = Arc::new(MockOracle::approving());
        let claim = claim_fixture("c1", 5.0, 1, 100);

        let outcome = collector(validators, oracle)
            .collect(&claim, &eps, "https://oracle.test", 1)
            .await;

        assert_eq!(
            outcome.error,
            Some(TypedError::Code(ErrorCode::DiscoveryNodeUnknownResponse))
        );
    }

    #[test]
    fn test_recoverable_signature_check() {
        assert!(is_recoverable_signature(&valid_signature(1)));
        assert!(!is_recoverable_signature("0xzz"));
        assert!(!is_recoverable_signature("0x00"));
    }
}
