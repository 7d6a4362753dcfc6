//! A multi-peer DTLS 1.2 connector: one UDP socket serving many peers concurrently,
//! with record-layer codec, fragment reassembly, stateless-cookie anti-amplification,
//! flight retransmission, and session resumption, per RFC 6347.
//!
//! Cipher suite key-schedules and AEAD are out of scope (`cipher_suite` defines the
//! boundary trait and a placeholder); so is certificate validation and PKI trust-chain
//! verification beyond carrying the configured trust anchors through to the
//! handshaker.

pub mod cipher_suite;
pub mod config;
pub mod connection;
pub mod connector;
pub mod cookie;
pub mod flight;
pub mod fragment_buffer;
pub mod handshake;
pub mod handshaker;
pub mod record;
pub mod session;
pub mod store;

pub use config::{Config, Credentials, MaxFragmentLengthCode};
pub use connector::{DataReceiver, DtlsConnector, ErrorHandler, DEFAULT_MTU};
pub use record::alert::{Alert, AlertDescription, AlertLevel};
pub use session::PeerIdentity;
pub use shared::error::{Error, Result};
