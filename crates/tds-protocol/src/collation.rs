//! Five-byte SQL Server collation.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Mask for the locale ID inside the packed collation word.
pub const LCID_MASK: u32 = 0x000F_FFFF;

/// Flag set on UTF-8 collations.
pub const COLLATION_FLAG_UTF8: u32 = 0x0800_0000;

/// Collation as carried in metadata and `SQLCOLLATION` ENVCHANGE.
///
/// The first four bytes pack the LCID (20 bits), comparison flags
/// (8 bits) and version (4 bits); the fifth byte is the SQL sort ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Collation {
    /// Packed LCID, flags and version.
    pub info: u32,
    /// SQL sort ID, zero for Windows collations.
    pub sort_id: u8,
}

impl Collation {
    /// Size on the wire.
    pub const SIZE: usize = 5;

    /// Read a collation.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < Self::SIZE {
            return Err(ProtocolError::UnexpectedEof);
        }
        Ok(Self {
            info: src.get_u32_le(),
            sort_id: src.get_u8(),
        })
    }

    /// Parse from a byte slice, as found in ENVCHANGE values.
    pub fn from_slice(mut bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(&mut bytes)
    }

    /// Write the collation.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.info);
        dst.put_u8(self.sort_id);
    }

    /// Locale ID.
    #[must_use]
    pub const fn lcid(&self) -> u32 {
        self.info & LCID_MASK
    }

    /// Whether character data uses UTF-8.
    #[must_use]
    pub const fn is_utf8(&self) -> bool {
        self.info & COLLATION_FLAG_UTF8 != 0
    }
}
