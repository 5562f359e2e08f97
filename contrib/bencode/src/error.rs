use thiserror::Error;

/// Errors raised while decoding bencoded bytes.
///
/// Every variant carries the byte offset at which decoding failed so that
/// callers can point at the offending input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BencodeParseError {
    #[error("invalid byte found at {pos}")]
    InvalidByte { pos: usize },

    #[error("input ended early at {pos}")]
    BytesEmpty { pos: usize },

    #[error("unexpected trailing bytes at {pos}")]
    TrailingBytes { pos: usize },

    #[error("integer starting at {pos} has no 'e' terminator")]
    InvalidIntNoDelimiter { pos: usize },

    #[error("integer at {pos} is negative zero")]
    InvalidIntNegativeZero { pos: usize },

    #[error("integer at {pos} is zero padded")]
    InvalidIntZeroPadding { pos: usize },

    #[error("integer at {pos} could not be parsed")]
    InvalidIntParseError { pos: usize },

    #[error("byte string length at {pos} is negative")]
    InvalidLengthNegative { pos: usize },

    #[error("byte string length at {pos} overflows the input")]
    InvalidLengthOverflow { pos: usize },

    #[error("dictionary key {key:?} at {pos} is a duplicate")]
    InvalidKeyDuplicates { pos: usize, key: Vec<u8> },

    #[error("nesting depth {max} reached at {pos}")]
    InvalidRecursionExceeded { pos: usize, max: usize },
}

pub type BencodeParseResult<T> = Result<T, BencodeParseError>;
