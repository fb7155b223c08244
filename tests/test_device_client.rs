//! Device client behavior against the mock transport
//!
//! Covers readiness gating, close semantics, lazy link setup and the three conversation
//! multiplexers.

use hubclient::config::{ClientOptions, SendOptions};
use hubclient::device::{Client, DirectMethodHandler};
use hubclient::protocol::{Event, Mapping, Value};
use hubclient::testing::MockDeviceTransport;
use hubclient::{ConnectionState, HubError, SasCredentials, TwinState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONNECTION_STRING: &str =
    "HostName=hub.example.net;DeviceId=dev-1;SharedAccessKey=c2VjcmV0";

fn client_with(transport: Arc<MockDeviceTransport>) -> Arc<Client> {
    let credentials = Arc::new(SasCredentials::parse(CONNECTION_STRING).unwrap());
    Arc::new(Client::new(transport, ClientOptions::with_credentials(credentials)).unwrap())
}

async fn connected() -> (Arc<MockDeviceTransport>, Arc<Client>) {
    let transport = Arc::new(MockDeviceTransport::new());
    let client = client_with(transport.clone());
    client.connect(&CancellationToken::new()).await.unwrap();
    (transport, client)
}

fn echo() -> DirectMethodHandler {
    Arc::new(|payload: Mapping| Ok(payload))
}

#[tokio::test]
async fn test_second_connect_fails_with_already_connected() {
    let (transport, client) = connected().await;

    let second = client.connect(&CancellationToken::new()).await;

    assert_eq!(second, Err(HubError::AlreadyConnected));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(client.device_id(), "dev-1");
}

#[tokio::test]
async fn test_failed_connect_leaves_client_unready() {
    let transport = Arc::new(MockDeviceTransport::with_connect_failure());
    let client = client_with(transport.clone());

    let result = client.connect(&CancellationToken::new()).await;

    assert!(matches!(result, Err(HubError::Transport { .. })));
    assert_eq!(client.state(), ConnectionState::Unready);

    // retry is allowed and reaches the transport again
    let _ = client.connect(&CancellationToken::new()).await;
    assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_send_waits_until_connected() {
    let transport = Arc::new(MockDeviceTransport::new());
    let client = client_with(transport.clone());

    let sender = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_event(&CancellationToken::new(), "queued", SendOptions::default())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.sent_events().is_empty());

    client.connect(&CancellationToken::new()).await.unwrap();
    sender.await.unwrap().unwrap();

    let sent = transport.sent_events();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload_text(), "queued");
}

#[tokio::test]
async fn test_waiting_operation_observes_cancellation() {
    let transport = Arc::new(MockDeviceTransport::new());
    let client = client_with(transport);
    let cancel = CancellationToken::new();

    let waiter = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.retrieve_twin_state(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    assert_eq!(waiter.await.unwrap(), Err(HubError::Cancelled));
}

#[tokio::test]
async fn test_close_wakes_waiting_operations() {
    let transport = Arc::new(MockDeviceTransport::new());
    let client = client_with(transport);

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe_events(&CancellationToken::new()).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    client.close().await.unwrap();

    assert!(matches!(waiter.await.unwrap(), Err(HubError::Closed)));
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let (transport, client) = connected().await;

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(
        client.connect(&CancellationToken::new()).await,
        Err(HubError::Closed)
    );
    assert_eq!(
        client
            .send_event(&CancellationToken::new(), "late", SendOptions::default())
            .await,
        Err(HubError::Closed)
    );

    let cancel = CancellationToken::new();
    assert!(matches!(
        client.subscribe_events(&cancel).await,
        Err(HubError::Closed)
    ));
    assert_eq!(
        client.register_method(&cancel, "reboot", echo()).await,
        Err(HubError::Closed)
    );
    assert!(matches!(
        client.retrieve_twin_state(&cancel).await,
        Err(HubError::Closed)
    ));
    assert_eq!(
        client
            .update_twin_state(&cancel, &TwinState::default())
            .await,
        Err(HubError::Closed)
    );
    assert!(matches!(
        client.subscribe_twin_updates(&cancel).await,
        Err(HubError::Closed)
    ));
}

#[tokio::test]
async fn test_send_event_carries_options() {
    let (transport, client) = connected().await;
    let cancel = CancellationToken::new();

    client
        .send_event(
            &cancel,
            "reading",
            SendOptions::default()
                .with_message_id("m-1")
                .with_property("unit", "celsius"),
        )
        .await
        .unwrap();

    let sent = transport.sent_events();
    assert_eq!(sent[0].message_id.as_deref(), Some("m-1"));
    assert_eq!(sent[0].properties.get("unit").map(String::as_str), Some("celsius"));
}

#[tokio::test]
async fn test_send_event_rejects_empty_payload_and_bad_options() {
    let (transport, client) = connected().await;
    let cancel = CancellationToken::new();

    let empty = client.send_event(&cancel, "", SendOptions::default()).await;
    assert!(matches!(empty, Err(HubError::InvalidInput { .. })));

    let reserved = client
        .send_event(&cancel, "x", SendOptions::default().with_property("$.mid", "1"))
        .await;
    assert!(matches!(reserved, Err(HubError::InvalidInput { .. })));

    assert!(transport.sent_events().is_empty());
}

#[tokio::test]
async fn test_event_subscription_setup_runs_once() {
    let (transport, client) = connected().await;
    let cancel = CancellationToken::new();

    let mut first = client.subscribe_events(&cancel).await.unwrap();
    let mut second = client.subscribe_events(&cancel).await.unwrap();
    assert_eq!(transport.event_setups.load(Ordering::SeqCst), 1);

    assert!(transport.inject_event(Event::new("ping")));

    assert_eq!(first.recv().await.unwrap().payload_text(), "ping");
    assert_eq!(second.recv().await.unwrap().payload_text(), "ping");
}

#[tokio::test]
async fn test_concurrent_subscribers_share_one_setup() {
    let transport = Arc::new(MockDeviceTransport::with_setup_delay(Duration::from_millis(30)));
    let client = client_with(transport.clone());
    client.connect(&CancellationToken::new()).await.unwrap();

    let mut subscribers = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        subscribers.push(tokio::spawn(async move {
            client.subscribe_twin_updates(&CancellationToken::new()).await
        }));
    }
    for subscriber in subscribers {
        assert!(subscriber.await.unwrap().is_ok());
    }

    assert_eq!(transport.twin_setups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_setup_is_retried_by_next_caller() {
    let (transport, client) = connected().await;
    let cancel = CancellationToken::new();

    transport.fail_setups(true);
    let failed = client.subscribe_events(&cancel).await;
    assert!(matches!(failed, Err(HubError::LinkSetup { .. })));

    transport.fail_setups(false);
    assert!(client.subscribe_events(&cancel).await.is_ok());
    assert_eq!(transport.event_setups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unsubscribed_receiver_stops_getting_events() {
    let (transport, client) = connected().await;
    let cancel = CancellationToken::new();

    let mut kept = client.subscribe_events(&cancel).await.unwrap();
    let mut dropped = client.subscribe_events(&cancel).await.unwrap();
    client.unsubscribe_events(&dropped);
    client.unsubscribe_events(&dropped);

    transport.inject_event(Event::new("after"));

    assert_eq!(kept.recv().await.unwrap().payload_text(), "after");
    assert_eq!(dropped.recv().await, Err(HubError::Closed));
}

#[tokio::test]
async fn test_close_terminates_subscriptions() {
    let (_transport, client) = connected().await;
    let cancel = CancellationToken::new();
    let mut events = client.subscribe_events(&cancel).await.unwrap();

    client.close().await.unwrap();

    assert_eq!(events.recv().await, Err(HubError::Closed));
    assert_eq!(events.recv().await, Err(HubError::Closed));
}

#[tokio::test]
async fn test_direct_methods() {
    let (transport, client) = connected().await;
    let cancel = CancellationToken::new();

    client.register_method(&cancel, "echo", echo()).await.unwrap();
    let failing: DirectMethodHandler =
        Arc::new(|_: Mapping| Err(HubError::invalid_input("sensor offline")));
    client.register_method(&cancel, "fail", failing).await.unwrap();
    assert_eq!(transport.method_setups.load(Ordering::SeqCst), 1);

    let duplicate = client.register_method(&cancel, "echo", echo()).await;
    assert_eq!(
        duplicate,
        Err(HubError::DuplicateMethod {
            name: "echo".to_string()
        })
    );
    let blank = client.register_method(&cancel, "", echo()).await;
    assert!(matches!(blank, Err(HubError::InvalidInput { .. })));

    let (status, body) = transport.call_method("echo", br#"{"n": 1}"#).unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, br#"{"n":1}"#);

    let (status, _) = transport.call_method("fail", b"{}").unwrap();
    assert_eq!(status, 500);

    let (status, _) = transport.call_method("missing", b"{}").unwrap();
    assert_eq!(status, 404);

    client.unregister_method("echo");
    let (status, _) = transport.call_method("echo", b"{}").unwrap();
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_twin_round_trip() {
    let (transport, client) = connected().await;
    let cancel = CancellationToken::new();

    let mut desired = Mapping::new();
    desired.insert("fan".into(), Value::Bool(true));
    desired.insert("$version".into(), Value::Int(7));
    transport.set_desired(desired);

    let v1 = client
        .update_twin_state(&cancel, &TwinState::default().with("temp", 21))
        .await
        .unwrap();
    let v2 = client
        .update_twin_state(&cancel, &TwinState::default().with("humidity", 40))
        .await
        .unwrap();
    assert!(v2 > v1);

    let (desired, reported) = client.retrieve_twin_state(&cancel).await.unwrap();
    assert_eq!(desired.version(), Ok(7));
    assert_eq!(desired.get("fan"), Some(&Value::Bool(true)));
    assert_eq!(reported.version(), Ok(v2));
    assert_eq!(reported.get("temp"), Some(&Value::Int(21)));
}

#[tokio::test]
async fn test_twin_update_bumps_current_version() {
    let (transport, client) = connected().await;
    let mut reported = Mapping::new();
    reported.insert("$version".into(), Value::Int(3));
    transport.set_reported(reported);

    let version = client
        .update_twin_state(&CancellationToken::new(), &TwinState::default().with("temp", 21))
        .await
        .unwrap();

    assert_eq!(version, 4);
}

#[tokio::test]
async fn test_twin_updates_reach_subscribers() {
    let (transport, client) = connected().await;
    let mut updates = client
        .subscribe_twin_updates(&CancellationToken::new())
        .await
        .unwrap();

    assert!(transport.inject_twin_update(br#"{"fan": false, "$version": 9}"#));
    // undecodable documents are dropped rather than delivered
    assert!(transport.inject_twin_update(b"not json"));

    let update = updates.recv().await.unwrap();
    assert_eq!(update.version(), Ok(9));
    assert_eq!(update.get("fan"), Some(&Value::Bool(false)));
    assert!(updates.try_recv().is_none());
}
