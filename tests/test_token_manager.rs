//! Claims-based security token grants against the mock broker

use hubclient::config::TokenSection;
use hubclient::testing::{MockBroker, MockConnector};
use hubclient::{EventHubClient, HubError, SasCredentials, TokenManager};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const AUDIENCE: &str = "sb://ns.example.net/telemetry";

async fn manager() -> (Arc<MockBroker>, EventHubClient, TokenManager) {
    let connector = MockConnector::new();
    let client = EventHubClient::dial(&connector, "ns.example.net", TokenSection::default())
        .await
        .unwrap();
    let manager = client
        .token_manager()
        .unwrap()
        .with_renewal_interval(Duration::from_millis(20));
    (connector.broker(), client, manager)
}

async fn wait_for_grants(broker: &MockBroker, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.granted_tokens().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("grants not observed in time");
}

#[tokio::test]
async fn test_put_token_grants_once() {
    let (broker, client, _manager) = manager().await;

    client
        .put_token(&CancellationToken::new(), AUDIENCE, "token-1")
        .await
        .unwrap();

    assert_eq!(
        broker.granted_tokens(),
        vec![(AUDIENCE.to_string(), "token-1".to_string())]
    );
    assert_eq!(broker.open_links(), 0);
    assert_eq!(broker.accepted(), 1);
}

#[tokio::test]
async fn test_rejected_token_surfaces_status() {
    let (broker, _client, manager) = manager().await;
    broker.set_cbs_status(401, "unauthorized");

    let result = manager
        .put_token(&CancellationToken::new(), AUDIENCE, "bad")
        .await;

    assert_eq!(
        result,
        Err(HubError::Status {
            code: 401,
            description: "unauthorized".to_string()
        })
    );
    assert!(broker.granted_tokens().is_empty());
    assert_eq!(broker.open_links(), 0);
}

#[tokio::test]
async fn test_not_found_status_names_the_code() {
    let (broker, _client, manager) = manager().await;
    broker.set_cbs_status(404, "entity not found");

    let err = manager
        .put_token(&CancellationToken::new(), AUDIENCE, "token")
        .await
        .unwrap_err();

    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_mismatched_correlation_is_rejected() {
    let (broker, _client, manager) = manager().await;
    broker.answer_with_wrong_correlation(true);

    let result = manager
        .put_token(&CancellationToken::new(), AUDIENCE, "token")
        .await;

    assert!(matches!(result, Err(HubError::CorrelationMismatch { .. })));
    assert_eq!(broker.accepted(), 0);
}

#[tokio::test]
async fn test_continuous_grants_until_stopped() {
    let (broker, _client, manager) = manager().await;
    let stop = CancellationToken::new();

    let renewals = manager
        .put_token_continuously(&CancellationToken::new(), AUDIENCE, "token", stop.clone())
        .await
        .unwrap();
    // the first grant completes before the call returns
    assert!(!broker.granted_tokens().is_empty());

    wait_for_grants(&broker, 3).await;
    stop.cancel();
    tokio::time::timeout(Duration::from_secs(1), renewals)
        .await
        .expect("renewal task did not stop")
        .unwrap();

    let granted = broker.granted_tokens().len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(broker.granted_tokens().len(), granted);
    assert!(broker
        .granted_tokens()
        .iter()
        .all(|(audience, token)| audience == AUDIENCE && token == "token"));
}

#[tokio::test]
async fn test_first_grant_failure_is_returned() {
    let (broker, _client, manager) = manager().await;
    broker.set_cbs_status(403, "forbidden");

    let result = manager
        .put_token_continuously(
            &CancellationToken::new(),
            AUDIENCE,
            "token",
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(HubError::Status { code: 403, .. })));
}

#[tokio::test]
async fn test_failed_renewal_ends_the_task() {
    let (broker, _client, manager) = manager().await;
    let stop = CancellationToken::new();

    let renewals = manager
        .put_token_continuously(&CancellationToken::new(), AUDIENCE, "token", stop.clone())
        .await
        .unwrap();
    broker.set_cbs_status(500, "internal error");

    tokio::time::timeout(Duration::from_secs(1), renewals)
        .await
        .expect("renewal task kept running after a failure")
        .unwrap();
    assert!(!stop.is_cancelled());
}

#[tokio::test]
async fn test_credentials_mint_a_fresh_signature_per_grant() {
    let (broker, _client, manager) = manager().await;
    let credentials = Arc::new(
        SasCredentials::parse(
            "Endpoint=sb://ns.example.net/;SharedAccessKeyName=listen;SharedAccessKey=c2VjcmV0",
        )
        .unwrap(),
    );
    let stop = CancellationToken::new();

    let renewals = manager
        .put_credentials_continuously(
            &CancellationToken::new(),
            credentials,
            AUDIENCE,
            Duration::from_secs(3600),
            stop.clone(),
        )
        .await
        .unwrap();
    wait_for_grants(&broker, 2).await;
    stop.cancel();
    renewals.await.unwrap();

    let granted = broker.granted_tokens();
    assert!(granted
        .iter()
        .all(|(_, token)| token.starts_with("SharedAccessSignature sr=")
            && token.contains("&skn=listen")));
}
