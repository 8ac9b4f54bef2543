use thiserror::Error;

/// Errors produced while decoding or encoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("truncated bencode input")]
    Truncated,

    /// Integer body is empty, has a forbidden leading zero, or overflows i64.
    #[error("malformed bencode integer")]
    BadInteger,

    /// Byte string length prefix is not a decimal number.
    #[error("malformed string length prefix")]
    BadLength,

    /// Dictionary key is not a byte string.
    #[error("dictionary key is not a byte string")]
    BadDictKey,

    /// A byte that cannot start a bencode value.
    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    /// Bytes remain after the single top-level value.
    #[error("trailing data after value")]
    TrailingData,

    /// Nesting exceeds the 64-level recursion cap.
    #[error("nesting too deep")]
    TooDeep,

    /// I/O error while writing encoded output.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
