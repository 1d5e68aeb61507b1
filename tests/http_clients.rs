//! HTTP adapter tests against mockito servers

use attester::attestation::{ErrorCode, TypedError};
use attester::clients::{
    BacklogSource, BlockHeightSource, DiscoveryBacklogSource, DiscoveryValidatorClient, EvmBlockHeight,
    LedgerClient, OracleClient, OracleHttpClient, RelayLedgerClient, UndisbursedChallenge, ValidatorClient,
};
use attester::types::{Attestation, AttestationBundle, OracleAttestation, RewardClaim, ValidatorAttestation};
use mockito::Matcher;

fn claim() -> RewardClaim {
    UndisbursedChallenge {
        challenge_id: "listen-streak".to_string(),
        user_id: "7eP5n".to_string(),
        specifier: "7eP5n:1200".to_string(),
        amount: 5.0,
        handle: "someone".to_string(),
        wallet: "0x0000000000000000000000000000000000000001".to_string(),
        completed_block_number: 1200,
    }
    .into_claim("0x00000000000000000000000000000000000000aa", 2)
}

#[tokio::test]
async fn test_validator_attestation_success() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v1/challenges/listen-streak/attest")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("user_id".into(), "7eP5n".into()),
            Matcher::UrlEncoded("oracle".into(), "0x00000000000000000000000000000000000000aa".into()),
            Matcher::UrlEncoded("specifier".into(), "7eP5n:1200".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":{"owner_wallet":"0xdn1","attestation":"0xsig"}}"#)
        .create_async()
        .await;

    let client = DiscoveryValidatorClient::new().unwrap();
    let attestation = client.get_attestation(&claim(), &server.url()).await.unwrap();

    assert_eq!(
        attestation,
        Attestation {
            signer_address: "0xdn1".to_string(),
            signature: "0xsig".to_string(),
        }
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_validator_error_body_maps_to_code() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", Matcher::Regex("^/v1/challenges/listen-streak/attest".into()))
        .with_status(400)
        .with_body(r#"{"error":"CHALLENGE_INCOMPLETE"}"#)
        .create_async()
        .await;

    let client = DiscoveryValidatorClient::new().unwrap();
    let err = client.get_attestation(&claim(), &server.url()).await.unwrap_err();

    assert_eq!(err, TypedError::Code(ErrorCode::ChallengeIncomplete));
}

#[tokio::test]
async fn test_oracle_approval_and_denial() {
    let mut server = mockito::Server::new_async().await;
    let approve = server
        .mock("POST", "/attestation/someone")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "challengeId": "listen-streak",
            "challengeSpecifier": "7eP5n:1200",
            "amount": 5.0,
        })))
        .with_status(200)
        .with_body(r#"{"result":"0xoracle"}"#)
        .expect(1)
        .create_async()
        .await;

    let client = OracleHttpClient::new().unwrap();
    let response = client.get_attestation(&claim(), &server.url()).await.unwrap();
    assert_eq!(response.signature.as_deref(), Some("0xoracle"));
    approve.assert_async().await;

    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/attestation/someone")
        .with_status(200)
        .with_body(r#"{"result":false,"errorCode":3}"#)
        .create_async()
        .await;

    let response = client.get_attestation(&claim(), &server.url()).await.unwrap();
    assert_eq!(response.signature, None);
    assert_eq!(response.error_code, Some(3));
}

#[tokio::test]
async fn test_oracle_denial_status_carries_code() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/attestation/someone")
        .with_status(400)
        .with_body(r#"{"error":"HCAPTCHA"}"#)
        .create_async()
        .await;

    let client = OracleHttpClient::new().unwrap();
    let err = client.get_attestation(&claim(), &server.url()).await.unwrap_err();
    assert_eq!(err, TypedError::Code(ErrorCode::Hcaptcha));
}

#[tokio::test]
async fn test_backlog_pages_with_cursor_query() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v1/challenges/undisbursed")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("offset".into(), "3".into()),
            Matcher::UrlEncoded("completed_blocknumber".into(), "1199".into()),
            Matcher::UrlEncoded("limit".into(), "50".into()),
        ]))
        .with_status(200)
        .with_body(
            r#"{"data":[{"challenge_id":"listen-streak","user_id":"7eP5n","specifier":"7eP5n:1200",
                "amount":"5","handle":"someone","wallet":"0x01","completed_blocknumber":1200}]}"#,
        )
        .create_async()
        .await;

    let backlog = DiscoveryBacklogSource::new(server.url(), 50).unwrap();
    let page = backlog.list_undisbursed(3, 1199).await.unwrap();

    assert_eq!(page.len(), 1);
    assert_eq!(page[0].amount, 5.0);
    assert_eq!(page[0].completed_block_number, 1200);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_backlog_error_status_is_err() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", Matcher::Regex("^/v1/challenges/undisbursed".into()))
        .with_status(503)
        .with_body("overloaded")
        .create_async()
        .await;

    let backlog = DiscoveryBacklogSource::new(server.url(), 50).unwrap();
    let err = backlog.list_undisbursed(0, 0).await.unwrap_err();
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn test_relay_submit_and_evaluate() {
    let mut server = mockito::Server::new_async().await;
    let submit = server
        .mock("POST", "/attestations/submit")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "transferId": "listen-streak:7eP5n:1200",
            "tokenAmount": 500_000_000u64,
            "instructionsPerTransaction": 2,
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let evaluate = server
        .mock("POST", "/attestations/evaluate")
        .with_status(400)
        .with_body(r#"{"errorCode":"ALREADY_SENT","error":"custom program error: 0x2"}"#)
        .create_async()
        .await;

    let relay = RelayLedgerClient::new(server.url(), Some("payer".to_string())).unwrap();
    let bundle = AttestationBundle {
        validators: vec![ValidatorAttestation(Attestation {
            signer_address: "0xdn1".to_string(),
            signature: "0xsig".to_string(),
        })],
        oracle: OracleAttestation(Attestation {
            signer_address: "0xoracle".to_string(),
            signature: "0xosig".to_string(),
        }),
    };

    relay.submit(&bundle, &claim(), 500_000_000, 2).await.unwrap();
    let err = relay.evaluate(&claim(), 500_000_000).await.unwrap_err();

    assert_eq!(err, TypedError::Code(ErrorCode::AlreadySent));
    submit.assert_async().await;
    evaluate.assert_async().await;
}

#[tokio::test]
async fn test_relay_bare_failure_is_raw() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/attestations/evaluate")
        .with_status(502)
        .create_async()
        .await;

    let relay = RelayLedgerClient::new(server.url(), None).unwrap();
    let err = relay.evaluate(&claim(), 1).await.unwrap_err();
    assert!(matches!(err, TypedError::Raw(_)));
}

#[tokio::test]
async fn test_eth_block_number_parses_hex() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .match_body(Matcher::PartialJson(serde_json::json!({"method": "eth_blockNumber"})))
        .with_status(200)
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x4b0"}"#)
        .create_async()
        .await;

    let height = EvmBlockHeight::new(server.url()).unwrap();
    assert_eq!(height.current_height().await.unwrap(), 1200);
}
