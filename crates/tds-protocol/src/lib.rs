//! # tds-protocol
//!
//! Wire structures of the MS-TDS (Tabular Data Stream) protocol.
//!
//! This crate is IO-agnostic: it turns requests into packet payloads and
//! response payloads into tokens. Framing onto a transport lives in
//! `tds-codec`, and connection management in `tds-client`.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{PacketHeader, PacketStatus, PacketType};
//!
//! let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 100);
//! assert_eq!(header.payload_length(), 92);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod collation;
pub mod error;
pub mod login7;
pub mod metadata;
pub mod packet;
pub mod prelogin;
pub mod rpc;
pub mod sql_batch;
pub mod temporal;
pub mod token;
pub mod transaction;
pub mod types;
pub mod value;
pub mod version;

pub use collation::Collation;
pub use error::ProtocolError;
pub use login7::{FeatureExtension, FeatureId, Login7, OptionFlags1, OptionFlags2, OptionFlags3, TypeFlags};
pub use metadata::{ColumnFlags, Metadata, read_metadata, read_type_info};
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};
pub use prelogin::{EncryptionLevel, PreLogin, PreLoginOption, ServerVersion};
pub use rpc::{ParamFlags, ProcId, ProcedureRef, RpcOptionFlags, RpcParam, RpcRequest, RpcValue};
pub use sql_batch::{encode_sql_batch, write_all_headers};
pub use token::{
    ColMetaData, Column, Done, DoneStatus, EnvChange, FeatureAck, FedAuthInfo, LoginAck,
    ReturnValue, Row, ServerMessage, Token, TokenParser, TokenType,
};
pub use transaction::{IsolationLevel, TransactionRequest};
pub use types::TypeId;
pub use value::read_value;
pub use version::TdsVersion;
