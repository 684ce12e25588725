use thiserror::Error;

/// Errors returned by [`Terminal`](crate::Terminal) operations.
///
/// Malformed inbound datagrams never produce an error; they are logged and discarded.
#[derive(Debug, Error)]
pub enum Error {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("datagram truncated on send ({sent} of {expected} bytes)")]
    ShortSend { sent: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
