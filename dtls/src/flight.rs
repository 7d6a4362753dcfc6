//! `Flight`: an ordered group of records sent together and retransmitted as a unit,
//! per `spec.md` 3. Built by the handshaker (or the alert path) and owned by the
//! connection while awaiting the peer's next flight (which acts as an implicit ack).

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FlightRecord {
    pub epoch: u16,
    pub content_type: crate::record::ContentType,
    /// Fully-marshaled plaintext record (header + handshake/alert body), not yet
    /// stamped with a sequence number or encrypted — that happens at send time so
    /// retransmissions can re-stamp without mutating the handshaker's view of the
    /// flight, per `spec.md` 4.3 "Flight send and fragmentation into datagrams".
    pub plaintext: BytesMut,
    pub message_seq: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Flight {
    pub peer_addr: SocketAddr,
    pub records: Vec<FlightRecord>,
    pub tries: u32,
    pub timeout_ms: u64,
    pub retransmit_needed: bool,
    /// `None` for flights not bound to an established/ongoing session (e.g. the
    /// very first server flight, which is plaintext epoch 0).
    pub session_epoch: Option<u16>,
}

impl Flight {
    pub fn new(peer_addr: SocketAddr, records: Vec<FlightRecord>, initial_timeout_ms: u64) -> Self {
        Flight {
            peer_addr,
            records,
            tries: 0,
            timeout_ms: initial_timeout_ms,
            retransmit_needed: true,
            session_epoch: None,
        }
    }

    /// Exponential backoff on each retransmit, per `spec.md` 4.3 "Retransmission
    /// timing".
    pub fn backoff(&mut self) {
        self.tries += 1;
        self.timeout_ms = self.timeout_ms.saturating_mul(2);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
