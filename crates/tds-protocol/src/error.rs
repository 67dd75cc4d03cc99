//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while encoding or decoding TDS structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Fewer bytes are available than the structure requires.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The input ended in the middle of a value.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unknown packet type byte in a header.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Status byte carries undefined bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Unknown token type in a response stream.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Unknown or malformed PRELOGIN option.
    #[error("invalid prelogin option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// Column metadata names a type this reader does not know.
    #[error("Unrecognised data type 0x{0:02X}")]
    UnrecognisedDataType(u8),

    /// Temporal scale outside 0..=7.
    #[error("invalid scale: {0}")]
    InvalidScale(u8),

    /// A value cannot be represented in its wire width.
    #[error("value out of range for {0}")]
    ValueOutOfRange(&'static str),

    /// UTF-16 data could not be decoded.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// A string or payload is too long for its length prefix.
    #[error("{field} too long: {len} exceeds {max}")]
    TooLong {
        /// Field being encoded.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}
