use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the record codec, fragment reassembler, connection store, and
/// connector core. Malformed or malicious inbound records are logged and discarded at
/// the point they're detected rather than propagated as an `Error` (`spec.md` 7); this
/// enum only carries conditions a caller can act on through the public API.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("sequence number wrapped, re-handshake required")]
    ErrSequenceNumberOverflow,

    #[error("no connection for peer address")]
    ErrNoConnectionForPeer,

    #[error("application payload of {0} bytes exceeds the 16384 byte limit")]
    ErrMessageTooLarge(usize),

    #[error("outbound queue is full, message dropped")]
    ErrOutboundQueueFull,

    #[error("connector is not running")]
    ErrNotRunning,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
