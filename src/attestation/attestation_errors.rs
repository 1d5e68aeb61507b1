use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Symbolic error identifiers returned by validators, the oracle and the
/// ledger program, plus the few raised locally.
///
/// The string form is the wire identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validator / oracle attestation
    ChallengeIncomplete,
    AlreadyDisbursed,
    InvalidOracle,
    MissingChallenges,
    InvalidInput,
    UserNotFound,
    Hcaptcha,
    CognitoFlow,
    DiscoveryNodeAttestationError,
    DiscoveryNodeUnknownResponse,
    AaoAttestationError,
    AaoAttestationRejection,
    AaoAttestationUnknownResponse,
    WaitForCooldown,
    UnknownError,

    // Aggregation
    InsufficientDiscoveryNodeCount,

    // Ledger program
    AlreadySent,
    RepeatedSenders,
    SignCollision,
    OperatorCollision,
    NotEnoughSigners,
    WrongSigner,
    SignatureVerificationFailed,
    IncorrectMessages,
    InsufficientFunds,

    // Local
    InvalidAmount,
    UserbankCreation,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 27] = [
        ErrorCode::ChallengeIncomplete,
        ErrorCode::AlreadyDisbursed,
        ErrorCode::InvalidOracle,
        ErrorCode::MissingChallenges,
        ErrorCode::InvalidInput,
        ErrorCode::UserNotFound,
        ErrorCode::Hcaptcha,
        ErrorCode::CognitoFlow,
        ErrorCode::DiscoveryNodeAttestationError,
        ErrorCode::DiscoveryNodeUnknownResponse,
        ErrorCode::AaoAttestationError,
        ErrorCode::AaoAttestationRejection,
        ErrorCode::AaoAttestationUnknownResponse,
        ErrorCode::WaitForCooldown,
        ErrorCode::UnknownError,
        ErrorCode::InsufficientDiscoveryNodeCount,
        ErrorCode::AlreadySent,
        ErrorCode::RepeatedSenders,
        ErrorCode::SignCollision,
        ErrorCode::OperatorCollision,
        ErrorCode::NotEnoughSigners,
        ErrorCode::WrongSigner,
        ErrorCode::SignatureVerificationFailed,
        ErrorCode::IncorrectMessages,
        ErrorCode::InsufficientFunds,
        ErrorCode::InvalidAmount,
        ErrorCode::UserbankCreation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ChallengeIncomplete => "CHALLENGE_INCOMPLETE",
            ErrorCode::AlreadyDisbursed => "ALREADY_DISBURSED",
            ErrorCode::InvalidOracle => "INVALID_ORACLE",
            ErrorCode::MissingChallenges => "MISSING_CHALLENGES",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::Hcaptcha => "HCAPTCHA",
            ErrorCode::CognitoFlow => "COGNITO_FLOW",
            ErrorCode::DiscoveryNodeAttestationError => "DISCOVERY_NODE_ATTESTATION_ERROR",
            ErrorCode::DiscoveryNodeUnknownResponse => "DISCOVERY_NODE_UNKNOWN_RESPONSE",
            ErrorCode::AaoAttestationError => "AAO_ATTESTATION_ERROR",
            ErrorCode::AaoAttestationRejection => "AAO_ATTESTATION_REJECTION",
            ErrorCode::AaoAttestationUnknownResponse => "AAO_ATTESTATION_UNKNOWN_RESPONSE",
            ErrorCode::WaitForCooldown => "WAIT_FOR_COOLDOWN",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::InsufficientDiscoveryNodeCount => "INSUFFICIENT_DISCOVERY_NODE_COUNT",
            ErrorCode::AlreadySent => "ALREADY_SENT",
            ErrorCode::RepeatedSenders => "REPEATED_SENDERS",
            ErrorCode::SignCollision => "SIGN_COLLISION",
            ErrorCode::OperatorCollision => "OPERATOR_COLLISION",
            ErrorCode::NotEnoughSigners => "NOT_ENOUGH_SIGNERS",
            ErrorCode::WrongSigner => "WRONG_SIGNER",
            ErrorCode::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            ErrorCode::IncorrectMessages => "INCORRECT_MESSAGES",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::InvalidAmount => "INVALID_AMOUNT",
            ErrorCode::UserbankCreation => "USERBANK_CREATION",
        }
    }

    /// Submission errors caused by batching several attestations into one
    /// transaction. Resolved by resubmitting one attestation per transaction.
    pub fn is_signer_collision(&self) -> bool {
        matches!(
            self,
            ErrorCode::RepeatedSenders | ErrorCode::SignCollision | ErrorCode::OperatorCollision
        )
    }

    /// Validator has not yet observed the challenge as complete
    pub fn is_validator_lag(&self) -> bool {
        matches!(
            self,
            ErrorCode::ChallengeIncomplete | ErrorCode::MissingChallenges
        )
    }

    /// Expected user-facing denials, logged at info rather than error
    pub fn is_user_facing_denial(&self) -> bool {
        matches!(
            self,
            ErrorCode::Hcaptcha | ErrorCode::CognitoFlow | ErrorCode::AaoAttestationRejection
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown error code: {0}")]
pub struct UnknownErrorCode(pub String);

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == trimmed)
            .ok_or_else(|| UnknownErrorCode(trimmed.to_string()))
    }
}

/// Failure of one claim: a known code, or a free-text message from a
/// collaborator that could not be mapped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum TypedError {
    #[error("{0}")]
    Code(ErrorCode),
    #[error("{0}")]
    Raw(String),
}

impl TypedError {
    /// Parse a wire identifier, falling back to the raw message.
    pub fn parse(message: &str) -> Self {
        match message.parse::<ErrorCode>() {
            Ok(code) => TypedError::Code(code),
            Err(_) => TypedError::Raw(message.to_string()),
        }
    }

    /// Collapse a ledger response carrying an optional code and an optional
    /// message. The code wins when both are present.
    pub fn from_parts(code: Option<&str>, message: Option<&str>) -> Option<Self> {
        match (code.filter(|c| !c.is_empty()), message.filter(|m| !m.is_empty())) {
            (Some(code), _) => Some(TypedError::parse(code)),
            (None, Some(message)) => Some(TypedError::parse(message)),
            (None, None) => None,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TypedError::Code(code) => Some(*code),
            TypedError::Raw(_) => None,
        }
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }
}

impl From<ErrorCode> for TypedError {
    fn from(code: ErrorCode) -> Self {
        TypedError::Code(code)
    }
}

/// What the attester does with a failed claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Try again after backoff, on the same validator set
    Retryable,
    /// Already paid by a previous or concurrent run; skip and advance
    NoRetry,
    /// The selected validators are unusable; draw a fresh set then retry
    NeedsReselect,
    /// Oracle denied the claim; skip and report on the rejection channel
    OracleRejection,
}

impl ErrorClass {
    /// Terminal classes never re-enter the retry loop
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorClass::NoRetry | ErrorClass::OracleRejection)
    }
}

/// Map an error to its handling class. Unknown codes and raw messages are
/// retryable, bounded by the attester's retry limit.
pub fn classify(error: &TypedError) -> ErrorClass {
    match error {
        TypedError::Code(code) => classify_code(*code),
        TypedError::Raw(_) => ErrorClass::Retryable,
    }
}

pub fn classify_code(code: ErrorCode) -> ErrorClass {
    match code {
        ErrorCode::AlreadyDisbursed | ErrorCode::AlreadySent => ErrorClass::NoRetry,

        // Reaching the attester with a lag error means the collector's own
        // polling already gave up on this validator set
        ErrorCode::InsufficientDiscoveryNodeCount
        | ErrorCode::ChallengeIncomplete
        | ErrorCode::MissingChallenges => ErrorClass::NeedsReselect,

        ErrorCode::AaoAttestationRejection
        | ErrorCode::AaoAttestationUnknownResponse
        | ErrorCode::Hcaptcha
        | ErrorCode::CognitoFlow => ErrorClass::OracleRejection,

        _ => ErrorClass::Retryable,
    }
}

/// Short reason attached to oracle rejection reports
pub fn oracle_rejection_reason(error: &TypedError) -> &'static str {
    match error.code() {
        Some(ErrorCode::Hcaptcha) => "hcaptcha",
        Some(ErrorCode::CognitoFlow) => "cognito",
        Some(ErrorCode::AaoAttestationRejection) => "rejection",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_error_code_round_trips_wire_form() {
        for code in ErrorCode::ALL {
            assert_eq!(code.as_str().parse::<ErrorCode>(), Ok(code));
        }
        assert!("NOT_A_CODE".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn test_error_code_serde_matches_wire_form() {
        let json = serde_json::to_string(&ErrorCode::InsufficientDiscoveryNodeCount).unwrap();
        assert_eq!(json, "\"INSUFFICIENT_DISCOVERY_NODE_COUNT\"");
    }

    #[test]
    fn test_no_retry_classification() {
        assert_eq!(classify_code(ErrorCode::AlreadyDisbursed), ErrorClass::NoRetry);
        assert_eq!(classify_code(ErrorCode::AlreadySent), ErrorClass::NoRetry);
    }

    #[test]
    fn test_reselect_classification() {
        assert_eq!(
            classify_code(ErrorCode::InsufficientDiscoveryNodeCount),
            ErrorClass::NeedsReselect
        );
        assert_eq!(
            classify_code(ErrorCode::ChallengeIncomplete),
            ErrorClass::NeedsReselect
        );
    }

    #[test]
    fn test_oracle_rejection_classification() {
        for code in [
            ErrorCode::AaoAttestationRejection,
            ErrorCode::AaoAttestationUnknownResponse,
            ErrorCode::Hcaptcha,
            ErrorCode::CognitoFlow,
        ] {
            assert_eq!(classify_code(code), ErrorClass::OracleRejection);
            assert!(classify_code(code).is_terminal());
        }
    }

    #[test]
    fn test_raw_errors_default_to_retryable() {
        assert_eq!(
            classify(&TypedError::Raw("socket hang up".to_string())),
            ErrorClass::Retryable
        );
        assert_eq!(classify_code(ErrorCode::SignCollision), ErrorClass::Retryable);
    }

    #[test]
    fn test_from_parts_prefers_code() {
        assert_eq!(
            TypedError::from_parts(Some("ALREADY_SENT"), Some("custom program error: 0x5")),
            Some(TypedError::Code(ErrorCode::AlreadySent))
        );
        assert_eq!(
            TypedError::from_parts(None, Some("blockhash not found")),
            Some(TypedError::Raw("blockhash not found".to_string()))
        );
        assert_eq!(TypedError::from_parts(Some(""), None), None);
    }

    #[test]
    fn test_signer_collision_codes() {
        assert!(ErrorCode::RepeatedSenders.is_signer_collision());
        assert!(ErrorCode::SignCollision.is_signer_collision());
        assert!(ErrorCode::OperatorCollision.is_signer_collision());
        assert!(!ErrorCode::AlreadySent.is_signer_collision());
    }

    #[test]
    fn test_rejection_reasons() {
        assert_eq!(oracle_rejection_reason(&ErrorCode::Hcaptcha.into()), "hcaptcha");
        assert_eq!(oracle_rejection_reason(&ErrorCode::CognitoFlow.into()), "cognito");
        assert_eq!(
            oracle_rejection_reason(&ErrorCode::AaoAttestationUnknownResponse.into()),
            "unknown"
        );
    }

    proptest! {
        #[test]
        fn prop_classify_is_total_and_deterministic(message in ".*") {
            let error = TypedError::parse(&message);
            prop_assert_eq!(classify(&error), classify(&error));
        }
    }
}
