//! Caches the raw bytes of every handshake message sent and received on a connection,
//! in message_seq order, for `Finished` verify-data generation. Grounded on the
//! teacher's `HandshakeCache` (`dtls/src/handshake/handshake_cache.rs`, referenced from
//! `dtls/src/conn/mod.rs`), scoped per-connection here rather than process-wide.

use super::HandshakeType;

#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub epoch: u16,
    pub message_seq: u16,
    pub handshake_type: HandshakeType,
    pub is_client: bool,
    pub raw: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct HandshakeCache {
    messages: Vec<CachedMessage>,
}

impl HandshakeCache {
    pub fn new() -> Self {
        HandshakeCache::default()
    }

    pub fn push(
        &mut self,
        raw: Vec<u8>,
        epoch: u16,
        message_seq: u16,
        handshake_type: HandshakeType,
        is_client: bool,
    ) {
        self.messages.push(CachedMessage {
            epoch,
            message_seq,
            handshake_type,
            is_client,
            raw,
        });
    }

    /// Concatenates every cached message's raw bytes in the order pushed, the input to
    /// `Finished.verify_data`. The handshaker owns the actual hash/HMAC computation.
    pub fn full_pull(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for m in &self.messages {
            out.extend_from_slice(&m.raw);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod handshake_cache_test {
    use super::*;

    #[test]
    fn pull_preserves_push_order() {
        let mut cache = HandshakeCache::new();
        cache.push(vec![1, 2], 0, 0, HandshakeType::ClientHello, true);
        cache.push(vec![3, 4], 0, 1, HandshakeType::ServerHello, false);
        assert_eq!(cache.full_pull(), vec![1, 2, 3, 4]);
    }
}
