use thiserror::Error;

/// Failure decoding an inbound board message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unrecognized message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("message tag {tag:#04x} expects {expected} bytes, got {got}")]
    BadLength { tag: u8, expected: usize, got: usize },
    #[error("empty payload")]
    Empty,
}
