//! End-to-end scenarios against two real `DtlsConnector`s talking over real UDP
//! sockets on localhost, per `spec.md` 8.

use dtls::record::alert::{AlertDescription, AlertLevel};
use dtls::{Config, DtlsConnector};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn loopback_connector() -> DtlsConnector {
    let connector = DtlsConnector::new(Config::new("127.0.0.1:0".parse().unwrap()));
    connector.start().await.unwrap();
    connector
}

async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// S1 (cookie round trip) + S3 (ordinary send): a `send()` with no existing
/// connection kicks off a client handshake, the server's `HelloVerifyRequest`
/// cookie exchange completes it, and the data queued behind the original `send()`
/// is delivered once the session establishes.
#[tokio::test]
async fn full_handshake_delivers_deferred_application_data() {
    let client = loopback_connector().await;
    let server = loopback_connector().await;
    let server_addr = server.get_address().await.unwrap();

    let received: Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    server.set_data_receiver(move |peer, bytes| {
        received_clone.lock().unwrap().push((peer, bytes.to_vec()));
    });

    client
        .send(server_addr, b"hello".to_vec(), None)
        .await
        .unwrap();

    let delivered = wait_until(
        || async { !received.lock().unwrap().is_empty() },
        Duration::from_secs(5),
    )
    .await;
    assert!(delivered, "server never received the deferred application data");

    let got = received.lock().unwrap().clone();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, b"hello");

    let client_addr = client.get_address().await.unwrap();
    assert_eq!(got[0].0, client_addr);

    let established = wait_until(
        || async { client.get_max_fragment_length(server_addr).await.is_some() },
        Duration::from_secs(1),
    )
    .await;
    assert!(established, "client never promoted to an established session");
}

/// A subsequent `send()` once the session is already established goes straight
/// out as `ApplicationData` without re-running the handshake.
#[tokio::test]
async fn established_session_carries_further_sends_without_rehandshake() {
    let client = loopback_connector().await;
    let server = loopback_connector().await;
    let server_addr = server.get_address().await.unwrap();

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    server.set_data_receiver(move |_peer, bytes| {
        received_clone.lock().unwrap().push(bytes.to_vec());
    });

    client.send(server_addr, b"first".to_vec(), None).await.unwrap();
    assert!(
        wait_until(
            || async { received.lock().unwrap().len() >= 1 },
            Duration::from_secs(5)
        )
        .await
    );

    client.send(server_addr, b"second".to_vec(), None).await.unwrap();
    assert!(
        wait_until(
            || async { received.lock().unwrap().len() >= 2 },
            Duration::from_secs(2)
        )
        .await
    );

    let got = received.lock().unwrap().clone();
    assert_eq!(got[0], b"first");
    assert_eq!(got[1], b"second");
}

/// S6: `close()` on one side exchanges a `warning/close_notify` round trip, both
/// connectors' error handlers observe it, and the connection disappears from both
/// stores afterwards (a subsequent `close()` on either side is a harmless no-op).
#[tokio::test]
async fn close_round_trip_removes_connection_on_both_sides() {
    let client = loopback_connector().await;
    let server = loopback_connector().await;
    let server_addr = server.get_address().await.unwrap();

    server.set_data_receiver(|_peer, _bytes| {});

    client.send(server_addr, b"hi".to_vec(), None).await.unwrap();
    assert!(
        wait_until(
            || async { client.get_max_fragment_length(server_addr).await.is_some() },
            Duration::from_secs(5)
        )
        .await
    );

    let client_addr = client.get_address().await.unwrap();

    let server_alerts: Arc<Mutex<Vec<AlertDescription>>> = Arc::new(Mutex::new(Vec::new()));
    let server_alerts_clone = server_alerts.clone();
    server.set_error_handler(move |level, description, _peer| {
        assert_eq!(level, AlertLevel::Warning);
        server_alerts_clone.lock().unwrap().push(description);
    });

    let client_alerts: Arc<Mutex<Vec<AlertDescription>>> = Arc::new(Mutex::new(Vec::new()));
    let client_alerts_clone = client_alerts.clone();
    client.set_error_handler(move |level, description, _peer| {
        assert_eq!(level, AlertLevel::Warning);
        client_alerts_clone.lock().unwrap().push(description);
    });

    client.close(server_addr).await.unwrap();

    let both_notified = wait_until(
        || async {
            !server_alerts.lock().unwrap().is_empty() && !client_alerts.lock().unwrap().is_empty()
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(both_notified);

    assert_eq!(server_alerts.lock().unwrap()[0], AlertDescription::CloseNotify);
    assert_eq!(client_alerts.lock().unwrap()[0], AlertDescription::CloseNotify);

    assert!(
        wait_until(
            || async { client.get_max_fragment_length(server_addr).await.is_none() },
            Duration::from_secs(1)
        )
        .await
    );
    assert!(
        wait_until(
            || async { server.get_max_fragment_length(client_addr).await.is_none() },
            Duration::from_secs(1)
        )
        .await
    );

    // Closing again has nothing left to do and must not panic or hang.
    client.close(server_addr).await.unwrap();
}
