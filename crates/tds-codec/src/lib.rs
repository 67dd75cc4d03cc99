//! # tds-codec
//!
//! Async framing layer for TDS packets.
//!
//! ```text
//! byte stream → TdsCodec (packet framing) → MessageAssembler → Connection
//! ```
//!
//! [`Connection`] splits its transport into read and write halves so that
//! an attention packet can be written while a response is half read, and
//! can put the transport back together for an in-place TLS upgrade.
//! Outgoing messages are split into packets no larger than the negotiated
//! packet size; a send can be aborted between packets, in which case the
//! message is terminated with the IGNORE bit so the server discards it.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod framed;
pub mod message;
pub mod packet_codec;

pub use connection::{Connection, SendOutcome};
pub use error::CodecError;
pub use framed::{PacketReader, PacketWriter};
pub use message::{Message, MessageAssembler};
pub use packet_codec::{Packet, TdsCodec};
