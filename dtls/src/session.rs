//! The `Session` security context described in `spec.md` 3: session-id, epochs,
//! per-epoch write sequence numbers, the read-epoch replay window, negotiated cipher
//! suite/keys, `max_fragment_length`, and peer identity.

use crate::cipher_suite::CipherSuite;
use shared::error::{Error, Result};
use shared::replay_detector::{ReplayDetector, SlidingWindowDetector};
use std::sync::Arc;

pub const DEFAULT_REPLAY_PROTECTION_WINDOW: usize = 64;
pub const DEFAULT_MAX_PLAINTEXT_FRAGMENT_LENGTH: usize = 16384;

pub type SessionId = Vec<u8>;

/// The credential a peer authenticated with, once the handshake completes.
#[derive(Debug, Clone)]
pub enum PeerIdentity {
    Psk(Vec<u8>),
    Certificate(String), // principal name / subject, not the chain itself
    RawPublicKey(Vec<u8>),
    None,
}

pub struct Session {
    pub session_id: SessionId,
    pub is_client: bool,
    read_epoch: u16,
    write_epoch: u16,
    // per-epoch next write sequence number
    write_sequence_numbers: Vec<u64>,
    replay_detector: Box<dyn ReplayDetector + Send>,
    pub cipher_suite: Option<Arc<dyn CipherSuite>>,
    pub max_fragment_length: usize,
    pub max_datagram_size: usize,
    pub peer_identity: PeerIdentity,
}

impl Session {
    pub fn new(session_id: SessionId, is_client: bool) -> Self {
        Session {
            session_id,
            is_client,
            read_epoch: 0,
            write_epoch: 0,
            write_sequence_numbers: vec![0],
            replay_detector: Box::new(SlidingWindowDetector::new(
                DEFAULT_REPLAY_PROTECTION_WINDOW,
                crate::record::MAX_SEQUENCE_NUMBER,
            )),
            cipher_suite: None,
            max_fragment_length: DEFAULT_MAX_PLAINTEXT_FRAGMENT_LENGTH,
            max_datagram_size: crate::connector::DEFAULT_MTU,
            peer_identity: PeerIdentity::None,
        }
    }

    /// Builds a resuming session derived from a previously-established one: same
    /// session-id, negotiated parameters, and peer identity, but a fresh epoch/sequence
    /// state (the resuming handshake still runs its own abbreviated flight and
    /// installs new keys under epoch 1), per `spec.md` 4.3 "Resumption".
    pub fn derive_for_resumption(prior: &Session, is_client: bool) -> Self {
        let mut s = Session::new(prior.session_id.clone(), is_client);
        s.max_fragment_length = prior.max_fragment_length;
        s.max_datagram_size = prior.max_datagram_size;
        s.peer_identity = prior.peer_identity.clone();
        s
    }

    pub fn read_epoch(&self) -> u16 {
        self.read_epoch
    }

    pub fn write_epoch(&self) -> u16 {
        self.write_epoch
    }

    /// Monotonic non-decreasing, per the Session invariant in `spec.md` 3.
    pub fn bump_read_epoch(&mut self, new_epoch: u16) {
        if new_epoch > self.read_epoch {
            self.read_epoch = new_epoch;
            self.replay_detector = Box::new(SlidingWindowDetector::new(
                DEFAULT_REPLAY_PROTECTION_WINDOW,
                crate::record::MAX_SEQUENCE_NUMBER,
            ));
        }
    }

    pub fn bump_write_epoch(&mut self, new_epoch: u16) {
        if new_epoch > self.write_epoch {
            self.write_epoch = new_epoch;
            while self.write_sequence_numbers.len() <= new_epoch as usize {
                self.write_sequence_numbers.push(0);
            }
        }
    }

    /// Allocates the next write sequence number for `epoch`. Strictly increasing
    /// within an epoch, including across retransmissions (a retransmit re-stamps
    /// from here rather than reusing the original number), per `spec.md` 4.3 and
    /// invariant 3 in `spec.md` 8.
    pub fn next_write_sequence_number(&mut self, epoch: u16) -> Result<u64> {
        while self.write_sequence_numbers.len() <= epoch as usize {
            self.write_sequence_numbers.push(0);
        }
        let seq = self.write_sequence_numbers[epoch as usize];
        if seq > crate::record::MAX_SEQUENCE_NUMBER {
            return Err(Error::ErrSequenceNumberOverflow);
        }
        self.write_sequence_numbers[epoch as usize] += 1;
        Ok(seq)
    }

    /// Seeds epoch 0's outbound sequence number so that a freshly-created server
    /// handshaker's first record continues from the triggering ClientHello record's
    /// sequence number, per RFC 6347 4.2.1 and `spec.md` 4.3 "Starting a new server
    /// handshake".
    pub fn seed_write_sequence_number(&mut self, epoch: u16, start_at: u64) {
        while self.write_sequence_numbers.len() <= epoch as usize {
            self.write_sequence_numbers.push(0);
        }
        self.write_sequence_numbers[epoch as usize] = start_at;
    }

    /// Replay check: must be called before any decrypt/MAC work, per invariant 2 in
    /// `spec.md` 8.
    pub fn check_replay(&mut self, seq: u64) -> bool {
        self.replay_detector.check(seq)
    }

    /// Only called once a record has been verified, per `spec.md` 4.3
    /// "APPLICATION_DATA" ("the window is updated only after successful decrypt").
    pub fn accept_replay(&mut self, seq: u64) {
        self.replay_detector.accept(seq)
    }

    pub fn has_keys(&self) -> bool {
        self.write_epoch > 0 && self.cipher_suite.is_some()
    }
}

#[cfg(test)]
mod session_test {
    use super::*;

    #[test]
    fn write_sequence_numbers_are_strictly_increasing_per_epoch() {
        let mut s = Session::new(vec![1], true);
        assert_eq!(s.next_write_sequence_number(0).unwrap(), 0);
        assert_eq!(s.next_write_sequence_number(0).unwrap(), 1);
        assert_eq!(s.next_write_sequence_number(1).unwrap(), 0);
        assert_eq!(s.next_write_sequence_number(0).unwrap(), 2);
    }

    #[test]
    fn seeding_continues_from_triggering_record() {
        let mut s = Session::new(vec![], false);
        s.seed_write_sequence_number(0, 7);
        assert_eq!(s.next_write_sequence_number(0).unwrap(), 7);
        assert_eq!(s.next_write_sequence_number(0).unwrap(), 8);
    }

    #[test]
    fn epoch_zero_session_has_no_keys() {
        let s = Session::new(vec![], true);
        assert!(!s.has_keys());
    }
}
