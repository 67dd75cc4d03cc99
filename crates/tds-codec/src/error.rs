//! Codec error types.

use std::io;

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while framing packets.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Transport I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A packet header could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The length field is smaller than a header.
    #[error("invalid packet header")]
    InvalidHeader,

    /// A packet exceeds the allowed size.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge {
        /// Declared size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The peer closed the stream in the middle of a message.
    #[error("connection closed")]
    ConnectionClosed,
}

impl CodecError {
    /// Whether the error came from the transport rather than the data.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed)
    }
}
