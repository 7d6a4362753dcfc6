//! Configuration surface (`spec.md` 6): `bind_address` is the only required option;
//! everything else has a sensible default, mirroring the teacher's `HandshakeConfig`
//! (`dtls/src/handshaker.rs`) shape of "one struct with `Default`, built with field
//! assignment rather than a file-format config crate".

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_MAX_RETRANSMISSIONS: u32 = 3;
pub const DEFAULT_RETRANSMISSION_TIMEOUT_MS: u64 = 200;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Credentials {
    Psk {
        identity_hint: Vec<u8>,
    },
    Certificate {
        certificate_der: Vec<u8>,
        private_key_der: Vec<u8>,
    },
    RawPublicKey {
        public_key: Vec<u8>,
        private_key_der: Vec<u8>,
    },
}

/// RFC 6066 `max_fragment_length` extension codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxFragmentLengthCode {
    Bytes512 = 1,
    Bytes1024 = 2,
    Bytes2048 = 3,
    Bytes4096 = 4,
}

impl MaxFragmentLengthCode {
    pub fn to_len(self) -> usize {
        match self {
            MaxFragmentLengthCode::Bytes512 => 512,
            MaxFragmentLengthCode::Bytes1024 => 1024,
            MaxFragmentLengthCode::Bytes2048 => 2048,
            MaxFragmentLengthCode::Bytes4096 => 4096,
        }
    }
}

pub struct Config {
    pub bind_address: SocketAddr,
    pub outbound_queue_capacity: usize,
    pub max_retransmissions: u32,
    pub retransmission_timeout: Duration,
    pub max_fragment_length_code: Option<MaxFragmentLengthCode>,
    pub credentials: Option<Credentials>,
    pub trust_anchors: Vec<Vec<u8>>, // DER-encoded root certificates
    pub cipher_suites: Vec<u16>,
}

impl Config {
    pub fn new(bind_address: SocketAddr) -> Self {
        Config {
            bind_address,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_retransmissions: DEFAULT_MAX_RETRANSMISSIONS,
            retransmission_timeout: Duration::from_millis(DEFAULT_RETRANSMISSION_TIMEOUT_MS),
            max_fragment_length_code: None,
            credentials: None,
            trust_anchors: Vec::new(),
            cipher_suites: Vec::new(),
        }
    }

    pub fn max_plaintext_fragment_length(&self) -> usize {
        self.max_fragment_length_code
            .map(|c| c.to_len())
            .unwrap_or(crate::session::DEFAULT_MAX_PLAINTEXT_FRAGMENT_LENGTH)
    }

    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    pub fn with_max_retransmissions(mut self, max: u32) -> Self {
        self.max_retransmissions = max;
        self
    }

    pub fn with_retransmission_timeout(mut self, timeout: Duration) -> Self {
        self.retransmission_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}
