//! Handshaker: the external collaborator named in `spec.md` 4.4. Consumed as a trait
//! with four variants (`Client`, `Server`, `ResumingClient`, `ResumingServer`); the
//! connector does not inspect handshake-message internals except for `ClientHello`
//! (handled upstream, before a `Handshaker` even exists) and `HelloRequest`.
//!
//! The state progression below is grounded on the teacher's own FSM
//! (`dtls/src/handshaker.rs`: `PREPARING -> SENDING -> WAITING -> FINISHED`), adapted
//! so the *connector* owns flight sending and retransmission timing (per `spec.md`
//! 4.3) while the handshaker only decides, given an inbound message, what the next
//! flight should contain. Per `spec.md` 1's Non-goals, no real key-schedule or AEAD is
//! implemented here — see `cipher_suite::PlaceholderCipherSuite`.

use crate::cipher_suite::PlaceholderCipherSuite;
use crate::flight::{Flight, FlightRecord};
use crate::handshake::handshake_cache::HandshakeCache;
use crate::handshake::{HandshakeHeader, HandshakeType};
use crate::record::{ContentType, PROTOCOL_VERSION_1_2};
use crate::session::Session;
use bytes::BytesMut;
use shared::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakerKind {
    Client,
    Server,
    ResumingClient,
    ResumingServer,
}

impl HandshakerKind {
    pub fn is_client(&self) -> bool {
        matches!(self, HandshakerKind::Client | HandshakerKind::ResumingClient)
    }

    pub fn is_resuming(&self) -> bool {
        matches!(
            self,
            HandshakerKind::ResumingClient | HandshakerKind::ResumingServer
        )
    }
}

pub type SessionEstablishedListener = Box<dyn FnMut(&Session) + Send>;

/// Inbound handshake content handed to the handshaker, already reassembled and
/// session-bound by the connector.
pub enum HandshakeInput {
    Message { handshake_type: HandshakeType, message_seq: u16, body: BytesMut },
    ChangeCipherSpec,
}

/// A tagged variant over the four roles named in `spec.md` 4.4, rather than an
/// inheritance hierarchy, per the design note in `spec.md` 9.
pub struct Handshaker {
    kind: HandshakerKind,
    session: Session,
    step: u8,
    next_send_message_seq: u16,
    started_by_message_seq: Option<u16>,
    listeners: Vec<SessionEstablishedListener>,
    finished: bool,
    /// Cookie echoed back from the server's `HelloVerifyRequest`, carried into the
    /// retried `ClientHello`. Empty until a `HelloVerifyRequest` is seen.
    client_cookie: Vec<u8>,
    /// Initial per-flight retransmission timeout, taken from `Config::retransmission_
    /// timeout` (`spec.md` 6). `Flight::backoff` doubles it from here on.
    retransmission_timeout_ms: u64,
}

impl Handshaker {
    pub fn new(
        kind: HandshakerKind,
        mut session: Session,
        started_by_message_seq: Option<u16>,
        retransmission_timeout_ms: u64,
    ) -> Self {
        session.cipher_suite = Some(Arc::new(PlaceholderCipherSuite::new()));
        Handshaker {
            kind,
            session,
            step: 0,
            next_send_message_seq: 0,
            started_by_message_seq,
            listeners: Vec::new(),
            finished: false,
            client_cookie: Vec::new(),
            retransmission_timeout_ms,
        }
    }

    pub fn kind(&self) -> HandshakerKind {
        self.kind
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Consumes the handshaker, handing its session to the connection as the
    /// established session once `is_finished()` is true.
    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn add_listener(&mut self, listener: SessionEstablishedListener) {
        self.listeners.push(listener);
    }

    /// `spec.md` 4.4: detects a `ClientHello` retransmission that should be answered
    /// by resending the current flight rather than restarting the handshake.
    pub fn has_been_started_by(&self, client_hello_message_seq: u16) -> bool {
        self.started_by_message_seq == Some(client_hello_message_seq)
    }

    fn alloc_message_seq(&mut self) -> u16 {
        let seq = self.next_send_message_seq;
        self.next_send_message_seq += 1;
        seq
    }

    fn record(
        &self,
        content_type: ContentType,
        epoch: u16,
        message_seq: Option<u16>,
        body: BytesMut,
    ) -> FlightRecord {
        FlightRecord {
            epoch,
            content_type,
            plaintext: body,
            message_seq,
        }
    }

    /// A bare `ChangeCipherSpec` record (RFC 6347 4.2.2: a single byte, value 1),
    /// sent at the pre-bump epoch so the peer can bump its own read epoch in step
    /// with our write epoch before the following record arrives at the new one.
    fn change_cipher_spec_record(&self, epoch: u16) -> FlightRecord {
        self.record(ContentType::ChangeCipherSpec, epoch, None, BytesMut::from(&[1u8][..]))
    }

    fn handshake_record(
        &self,
        handshake_type: HandshakeType,
        message_seq: u16,
        body: &[u8],
        epoch: u16,
    ) -> FlightRecord {
        let header = HandshakeHeader {
            handshake_type,
            length: body.len() as u32,
            message_seq,
            fragment_offset: 0,
            fragment_length: body.len() as u32,
        };
        let mut raw = BytesMut::new();
        header.marshal(&mut raw);
        raw.extend_from_slice(body);
        self.record(ContentType::Handshake, epoch, Some(message_seq), raw)
    }

    fn emit_established(&mut self) {
        self.finished = true;
        for listener in &mut self.listeners {
            listener(&self.session);
        }
    }

    /// Produces the handshaker's very first outbound flight. For a client role this is
    /// `ClientHello`; server roles don't call this — their first flight is produced by
    /// `process_message` in reaction to the triggering `ClientHello`, per `spec.md`
    /// 4.3 "Starting a new server handshake".
    ///
    /// Application data deferred behind a `send()` that had no existing connection is
    /// not carried in the `ClientHello` body (it must stay a conformant,
    /// `ClientHelloSummary`-parseable structure for the cookie exchange) — the
    /// connector queues it on the `Connection` instead and flushes it once the
    /// handshake establishes.
    pub fn start_handshake_message(&mut self, peer_addr: SocketAddr, cache: &mut HandshakeCache) -> Result<Flight> {
        debug_assert!(self.kind.is_client());
        let message_seq = self.alloc_message_seq();
        let body = encode_client_hello_body(&self.client_cookie, &self.session.session_id);
        let record = self.handshake_record(HandshakeType::ClientHello, message_seq, &body, 0);
        cache.push(
            record.plaintext.to_vec(),
            0,
            message_seq,
            HandshakeType::ClientHello,
            true,
        );
        self.step = 1;
        Ok(Flight::new(peer_addr, vec![record], self.retransmission_timeout_ms))
    }

    /// Advances the handshake given one inbound message, returning the next flight to
    /// send (if any). Returns `Ok(None)` when the message was consumed but produces no
    /// new flight (e.g. a bare `ChangeCipherSpec` ahead of its `Finished`).
    pub fn process_message(
        &mut self,
        peer_addr: SocketAddr,
        input: HandshakeInput,
        cache: &mut HandshakeCache,
    ) -> Result<Option<Flight>> {
        match input {
            HandshakeInput::ChangeCipherSpec => {
                self.session.bump_read_epoch(self.session.read_epoch() + 1);
                Ok(None)
            }
            HandshakeInput::Message {
                handshake_type,
                message_seq,
                body,
            } => self.advance(peer_addr, handshake_type, message_seq, &body, cache),
        }
    }

    fn advance(
        &mut self,
        peer_addr: SocketAddr,
        handshake_type: HandshakeType,
        message_seq: u16,
        body: &[u8],
        cache: &mut HandshakeCache,
    ) -> Result<Option<Flight>> {
        cache.push(
            body.to_vec(),
            self.session.read_epoch(),
            message_seq,
            handshake_type,
            !self.kind.is_client(),
        );

        match self.kind {
            HandshakerKind::Server if self.step == 0 => {
                // triggering ClientHello already consumed by the connector's cookie
                // path; this is the first call into a freshly-created server
                // handshaker, so build ServerHello + ServerHelloDone.
                self.started_by_message_seq.get_or_insert(message_seq);
                let hello_seq = self.alloc_message_seq();
                let hello = self.handshake_record(
                    HandshakeType::ServerHello,
                    hello_seq,
                    &encode_placeholder_body(None),
                    0,
                );
                let done_seq = self.alloc_message_seq();
                let done = self.handshake_record(HandshakeType::ServerHelloDone, done_seq, &[], 0);
                self.step = 1;
                Ok(Some(Flight::new(peer_addr, vec![hello, done], self.retransmission_timeout_ms)))
            }
            _ if self.kind.is_client()
                && self.step == 1
                && handshake_type == HandshakeType::HelloVerifyRequest =>
            {
                // body: client_version(2) || cookie<0..2^8-1>
                if body.len() >= 3 {
                    let cookie_len = body[2] as usize;
                    if body.len() >= 3 + cookie_len {
                        self.client_cookie = body[3..3 + cookie_len].to_vec();
                    }
                }
                let message_seq = self.alloc_message_seq();
                let hello_body =
                    encode_client_hello_body(&self.client_cookie, &self.session.session_id);
                let record =
                    self.handshake_record(HandshakeType::ClientHello, message_seq, &hello_body, 0);
                cache.push(
                    record.plaintext.to_vec(),
                    0,
                    message_seq,
                    HandshakeType::ClientHello,
                    true,
                );
                Ok(Some(Flight::new(peer_addr, vec![record], self.retransmission_timeout_ms)))
            }
            HandshakerKind::Client if self.step == 1 && handshake_type == HandshakeType::ServerHelloDone => {
                let kex_seq = self.alloc_message_seq();
                let kex = self.handshake_record(
                    HandshakeType::ClientKeyExchange,
                    kex_seq,
                    &encode_placeholder_body(None),
                    0,
                );
                self.session.bump_write_epoch(1);
                let ccs = self.change_cipher_spec_record(0);
                let finished_seq = self.alloc_message_seq();
                let finished =
                    self.handshake_record(HandshakeType::Finished, finished_seq, &verify_data(cache), 1);
                self.step = 2;
                Ok(Some(Flight::new(peer_addr, vec![kex, ccs, finished], self.retransmission_timeout_ms)))
            }
            HandshakerKind::Server
                if self.step == 1 && handshake_type == HandshakeType::Finished =>
            {
                self.session.bump_write_epoch(1);
                let ccs = self.change_cipher_spec_record(0);
                let finished_seq = self.alloc_message_seq();
                let finished =
                    self.handshake_record(HandshakeType::Finished, finished_seq, &verify_data(cache), 1);
                self.step = 2;
                self.emit_established();
                Ok(Some(Flight::new(peer_addr, vec![ccs, finished], self.retransmission_timeout_ms)))
            }
            HandshakerKind::Client
                if self.step == 2 && handshake_type == HandshakeType::Finished =>
            {
                self.emit_established();
                Ok(None)
            }
            HandshakerKind::ResumingServer if self.step == 0 => {
                self.started_by_message_seq.get_or_insert(message_seq);
                self.session.bump_write_epoch(1);
                let hello_seq = self.alloc_message_seq();
                let hello = self.handshake_record(
                    HandshakeType::ServerHello,
                    hello_seq,
                    &encode_placeholder_body(None),
                    0,
                );
                let ccs = self.change_cipher_spec_record(0);
                let finished_seq = self.alloc_message_seq();
                let finished =
                    self.handshake_record(HandshakeType::Finished, finished_seq, &verify_data(cache), 1);
                self.step = 1;
                Ok(Some(Flight::new(peer_addr, vec![hello, ccs, finished], self.retransmission_timeout_ms)))
            }
            HandshakerKind::ResumingClient
                if self.step == 1 && handshake_type == HandshakeType::Finished =>
            {
                self.session.bump_write_epoch(1);
                let ccs = self.change_cipher_spec_record(0);
                let finished_seq = self.alloc_message_seq();
                let finished =
                    self.handshake_record(HandshakeType::Finished, finished_seq, &verify_data(cache), 1);
                self.emit_established();
                Ok(Some(Flight::new(peer_addr, vec![ccs, finished], self.retransmission_timeout_ms)))
            }
            HandshakerKind::ResumingServer
                if self.step == 1 && handshake_type == HandshakeType::Finished =>
            {
                self.emit_established();
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

fn encode_placeholder_body(deferred: Option<&[u8]>) -> Vec<u8> {
    deferred.map(|d| d.to_vec()).unwrap_or_default()
}

/// A minimal but `ClientHelloSummary::parse`-conformant body: protocol version,
/// client_random, the given session_id (non-empty only for a `ResumingClient`
/// handshaker, signaling resumption per `spec.md` 4.3 "Resumption"), the given
/// cookie, an empty cipher_suites list, and the null compression method. Real
/// cipher suite negotiation is out of scope (`spec.md` 1); this only needs to
/// satisfy the connector's cookie-verification parser.
fn encode_client_hello_body(cookie: &[u8], session_id: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(34 + 1 + session_id.len() + 3 + cookie.len() + 5);
    body.push(PROTOCOL_VERSION_1_2.major);
    body.push(PROTOCOL_VERSION_1_2.minor);
    let random: [u8; 32] = rand::random();
    body.extend_from_slice(&random);
    body.push(session_id.len() as u8);
    body.extend_from_slice(session_id);
    body.push(cookie.len() as u8);
    body.extend_from_slice(cookie);
    body.extend_from_slice(&0u16.to_be_bytes()); // cipher_suites length
    body.push(1); // compression_methods length
    body.push(0); // null compression
    body
}

fn verify_data(cache: &HandshakeCache) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(cache.full_pull());
    hasher.finalize()[..12].to_vec()
}

#[cfg(test)]
mod handshaker_test {
    use super::*;
    use crate::session::Session;

    fn addr() -> SocketAddr {
        "127.0.0.1:6000".parse().unwrap()
    }

    #[test]
    fn full_client_server_handshake_establishes_session() {
        let mut cache = HandshakeCache::new();
        let mut client = Handshaker::new(
            HandshakerKind::Client,
            Session::new(vec![], true),
            None,
            crate::config::DEFAULT_RETRANSMISSION_TIMEOUT_MS,
        );
        let mut server = Handshaker::new(
            HandshakerKind::Server,
            Session::new(vec![], false),
            None,
            crate::config::DEFAULT_RETRANSMISSION_TIMEOUT_MS,
        );

        let established = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = established.clone();
        client.add_listener(Box::new(move |_s| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        let client_hello_flight = client.start_handshake_message(addr(), &mut cache).unwrap();
        let client_hello = &client_hello_flight.records[0];

        let server_flight = server
            .process_message(
                addr(),
                HandshakeInput::Message {
                    handshake_type: HandshakeType::ClientHello,
                    message_seq: 0,
                    body: client_hello.plaintext.clone(),
                },
                &mut cache,
            )
            .unwrap()
            .expect("server produces ServerHello/ServerHelloDone flight");
        assert_eq!(server_flight.records.len(), 2);

        let client_flight2 = client
            .process_message(
                addr(),
                HandshakeInput::Message {
                    handshake_type: HandshakeType::ServerHelloDone,
                    message_seq: 2,
                    body: BytesMut::new(),
                },
                &mut cache,
            )
            .unwrap()
            .expect("client produces ClientKeyExchange/ChangeCipherSpec/Finished flight");
        assert_eq!(client_flight2.records.len(), 3);

        let server_finished = server
            .process_message(
                addr(),
                HandshakeInput::Message {
                    handshake_type: HandshakeType::Finished,
                    message_seq: 4,
                    body: BytesMut::new(),
                },
                &mut cache,
            )
            .unwrap()
            .expect("server produces ChangeCipherSpec/Finished flight");
        assert!(server.is_finished());
        assert_eq!(server_finished.records.len(), 2);

        client
            .process_message(
                addr(),
                HandshakeInput::Message {
                    handshake_type: HandshakeType::Finished,
                    message_seq: 5,
                    body: BytesMut::new(),
                },
                &mut cache,
            )
            .unwrap();

        assert!(client.is_finished());
        assert!(established.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn has_been_started_by_detects_retransmission() {
        let handshaker = Handshaker::new(
            HandshakerKind::Server,
            Session::new(vec![], false),
            Some(3),
            crate::config::DEFAULT_RETRANSMISSION_TIMEOUT_MS,
        );
        assert!(handshaker.has_been_started_by(3));
        assert!(!handshaker.has_been_started_by(4));
    }
}
