//! S2 (retransmission timing) and S4 (session resumption across an address change),
//! per `spec.md` 8.

use bytes::BytesMut;
use dtls::handshake::{HandshakeHeader, HandshakeType, HANDSHAKE_HEADER_LENGTH};
use dtls::record::{ContentType, Record, RecordLayerHeader, PROTOCOL_VERSION_1_2};
use dtls::{Config, DtlsConnector};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;

/// A minimal, `ClientHelloSummary::parse`-conformant `ClientHello` body, built the
/// same way `dtls::handshaker`'s private `encode_client_hello_body` does, so a bare
/// `UdpSocket` can stand in for a peer that never acks a flight.
fn client_hello_body(cookie: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(PROTOCOL_VERSION_1_2.major);
    body.push(PROTOCOL_VERSION_1_2.minor);
    body.extend_from_slice(&[0u8; 32]); // client_random, arbitrary for this test
    body.push(0); // session_id length
    body.push(cookie.len() as u8);
    body.extend_from_slice(cookie);
    body.extend_from_slice(&0u16.to_be_bytes()); // cipher_suites length
    body.push(1); // compression_methods length
    body.push(0); // null compression
    body
}

fn client_hello_datagram(message_seq: u16, cookie: &[u8]) -> BytesMut {
    let body = client_hello_body(cookie);
    let handshake_header = HandshakeHeader {
        handshake_type: HandshakeType::ClientHello,
        length: body.len() as u32,
        message_seq,
        fragment_offset: 0,
        fragment_length: body.len() as u32,
    };
    let mut handshake_raw = BytesMut::new();
    handshake_header.marshal(&mut handshake_raw);
    handshake_raw.extend_from_slice(&body);

    let record = Record {
        header: RecordLayerHeader {
            content_type: ContentType::Handshake,
            protocol_version: PROTOCOL_VERSION_1_2,
            epoch: 0,
            sequence_number: 0,
            content_len: handshake_raw.len() as u16,
        },
        payload: handshake_raw,
    };
    record.marshal()
}

/// Pulls the cookie out of a `HelloVerifyRequest` datagram: record header (13
/// bytes) + handshake header (12 bytes) + `[major, minor, cookie_len, cookie...]`.
fn extract_cookie(datagram: &[u8]) -> Vec<u8> {
    let mut rest = datagram;
    RecordLayerHeader::unmarshal(&mut rest).unwrap();
    let mut hs_rest: &[u8] = rest;
    HandshakeHeader::unmarshal(&mut hs_rest).unwrap();
    let body = &rest[HANDSHAKE_HEADER_LENGTH..];
    let cookie_len = body[2] as usize;
    body[3..3 + cookie_len].to_vec()
}

async fn loopback_connector() -> DtlsConnector {
    let connector = DtlsConnector::new(Config::new("127.0.0.1:0".parse().unwrap()));
    connector.start().await.unwrap();
    connector
}

/// S2: a server that never receives a `ClientKeyExchange`/`Finished` back
/// retransmits its `ServerHello`/`ServerHelloDone` flight with exponentially
/// growing gaps (~200ms, ~400ms, per invariant 3 in `spec.md` 8).
#[tokio::test]
async fn server_retransmits_unacked_flight_with_backoff() {
    let server = loopback_connector().await;
    let server_addr = server.get_address().await.unwrap();

    let fake_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    fake_client
        .send_to(&client_hello_datagram(0, &[]), server_addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), fake_client.recv_from(&mut buf))
        .await
        .expect("no HelloVerifyRequest received")
        .unwrap();
    let cookie = extract_cookie(&buf[..n]);
    assert!(!cookie.is_empty());

    fake_client
        .send_to(&client_hello_datagram(1, &cookie), server_addr)
        .await
        .unwrap();

    let mut receipts = Vec::new();
    for _ in 0..3 {
        let (n, _) =
            tokio::time::timeout(Duration::from_secs(2), fake_client.recv_from(&mut buf))
                .await
                .expect("server stopped retransmitting its flight")
                .unwrap();
        assert!(n > 0);
        receipts.push(tokio::time::Instant::now());
    }

    let gap1 = receipts[1].duration_since(receipts[0]);
    let gap2 = receipts[2].duration_since(receipts[1]);
    assert!(
        gap1 >= Duration::from_millis(150) && gap1 <= Duration::from_millis(600),
        "first retransmit gap {gap1:?} outside expected ~200ms window"
    );
    assert!(
        gap2 >= Duration::from_millis(300) && gap2 <= Duration::from_millis(1100),
        "second retransmit gap {gap2:?} outside expected ~400ms backoff window"
    );
}

/// S4: after a full handshake establishes a session, marking the connection for
/// resumption and resuming from a *different* local address (simulating a NAT
/// rebind) re-establishes the same logical session without a fresh full handshake,
/// and the original per-address connection is cleaned up once the new one is up.
#[tokio::test]
async fn resumption_survives_an_address_change() {
    let client = loopback_connector().await;
    let server = loopback_connector().await;
    let server_addr = server.get_address().await.unwrap();

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    server.set_data_receiver(move |_peer, bytes| {
        received_clone.lock().unwrap().push(bytes.to_vec());
    });

    client.send(server_addr, b"before".to_vec(), None).await.unwrap();
    let established = wait_until(
        || async { client.get_max_fragment_length(server_addr).await.is_some() },
        Duration::from_secs(5),
    )
    .await;
    assert!(established, "initial handshake never completed");
    assert!(wait_until(
        || async { !received.lock().unwrap().is_empty() },
        Duration::from_secs(2)
    )
    .await);

    let original_client_addr = client.get_address().await.unwrap();

    client.force_resume(server_addr);
    // `force_resume` flips the flag on a spawned task; give it a turn before relying
    // on it below.
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Rebind the client socket to a fresh ephemeral port, simulating a NAT rebind:
    // `stop`/`start` preserve the connection store but `bind_address`'s port 0
    // resolves to a new port on each bind.
    client.restart().await.unwrap();
    let new_client_addr = client.get_address().await.unwrap();
    assert_ne!(original_client_addr, new_client_addr);

    client.send(server_addr, b"after".to_vec(), None).await.unwrap();

    let resumed_delivered = wait_until(
        || async { received.lock().unwrap().iter().any(|b| b == b"after") },
        Duration::from_secs(5),
    )
    .await;
    assert!(resumed_delivered, "resumed session never delivered data to the server");

    // The server should have migrated the session to the new address and cleaned
    // up the stale one.
    assert!(wait_until(
        || async { server.get_max_fragment_length(new_client_addr).await.is_some() },
        Duration::from_secs(2)
    )
    .await);
    assert!(wait_until(
        || async { server.get_max_fragment_length(original_client_addr).await.is_none() },
        Duration::from_secs(2)
    )
    .await);
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
