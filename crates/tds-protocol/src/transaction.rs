//! Transaction manager requests (packet type 0x0E).
//!
//! Used from TDS 7.2 on instead of `BEGIN TRANSACTION` batches, so that the
//! server hands back a descriptor in a BeginTransaction ENVCHANGE.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_b_varchar;
use crate::error::ProtocolError;
use crate::sql_batch::{ALL_HEADERS_LEN, write_all_headers};
use crate::version::TdsVersion;

/// Isolation level byte sent with a begin request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum IsolationLevel {
    /// Keep the session's current level.
    NoChange = 0x00,
    /// READ UNCOMMITTED.
    ReadUncommitted = 0x01,
    /// READ COMMITTED.
    #[default]
    ReadCommitted = 0x02,
    /// REPEATABLE READ.
    RepeatableRead = 0x03,
    /// SERIALIZABLE.
    Serializable = 0x04,
    /// SNAPSHOT.
    Snapshot = 0x05,
}

impl IsolationLevel {
    /// T-SQL spelling, as used in `SET TRANSACTION ISOLATION LEVEL`.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::NoChange | Self::ReadCommitted => "READ COMMITTED",
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

/// A transaction manager request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionRequest {
    /// Begin a transaction.
    Begin {
        /// Isolation level.
        isolation: IsolationLevel,
        /// Optional transaction name.
        name: String,
    },
    /// Commit the current transaction.
    Commit {
        /// Transaction name.
        name: String,
    },
    /// Roll back the current transaction or to a savepoint.
    Rollback {
        /// Transaction or savepoint name.
        name: String,
    },
    /// Create a savepoint.
    Save {
        /// Savepoint name.
        name: String,
    },
}

impl TransactionRequest {
    fn request_type(&self) -> u16 {
        match self {
            Self::Begin { .. } => 5,
            Self::Commit { .. } => 7,
            Self::Rollback { .. } => 8,
            Self::Save { .. } => 9,
        }
    }

    /// Encode the payload, prefixed by ALL_HEADERS for `descriptor`.
    pub fn encode(&self, descriptor: u64, version: TdsVersion) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + 64);
        write_all_headers(&mut buf, descriptor, version);
        buf.put_u16_le(self.request_type());
        match self {
            Self::Begin { isolation, name } => {
                buf.put_u8(*isolation as u8);
                write_b_varchar(&mut buf, name)?;
            }
            Self::Commit { name } | Self::Rollback { name } => {
                write_b_varchar(&mut buf, name)?;
                // No fBeginXact: do not start a new transaction afterwards.
                buf.put_u8(0);
            }
            Self::Save { name } => write_b_varchar(&mut buf, name)?,
        }
        Ok(buf.freeze())
    }
}
