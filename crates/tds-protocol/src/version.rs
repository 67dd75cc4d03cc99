//! TDS protocol version definitions.

use std::fmt;

/// TDS protocol version as carried in LOGIN7 and LOGINACK.
///
/// The raw value is the big-endian interpretation used on the wire, so
/// versions order numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.0 (SQL Server 7.0)
    pub const V7_0: Self = Self(0x7000_0000);

    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x7100_0001);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x7209_0002);

    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A_0003);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B_0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x7400_0004);

    /// Create a version from its raw value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether the server acknowledges transactions with descriptors.
    ///
    /// From TDS 7.2 every request carries the current transaction
    /// descriptor in ALL_HEADERS and transactions are driven through
    /// TRANSACTION_MANAGER requests. Older versions emulate them with SQL.
    #[must_use]
    pub const fn supports_transaction_descriptors(self) -> bool {
        self.0 >= Self::V7_2.0
    }

    /// Whether column metadata carries a 32-bit user type.
    #[must_use]
    pub const fn has_wide_user_type(self) -> bool {
        self.0 >= Self::V7_2.0
    }

    /// Whether DATE, TIME, DATETIME2 and DATETIMEOFFSET are available.
    #[must_use]
    pub const fn supports_date_time_types(self) -> bool {
        self.0 >= Self::V7_3A.0
    }

    /// Whether this version predates 7.2.
    #[must_use]
    pub const fn is_legacy(self) -> bool {
        self.0 < Self::V7_2.0
    }

    /// Lower of two versions, as agreed during login.
    #[must_use]
    pub const fn min(self, other: Self) -> Self {
        if self.0 <= other.0 { self } else { other }
    }

    /// Parse a configuration value such as `"7.4"` or `"7_3_B"`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', ".").as_str() {
            "7.0" => Some(Self::V7_0),
            "7.1" => Some(Self::V7_1),
            "7.2" => Some(Self::V7_2),
            "7.3" | "7.3a" | "7.3.a" => Some(Self::V7_3A),
            "7.3b" | "7.3.b" => Some(Self::V7_3B),
            "7.4" => Some(Self::V7_4),
            _ => None,
        }
    }

    const fn minor(self) -> u8 {
        ((self.0 >> 24) & 0x0F) as u8
    }

    const fn revision_suffix(self) -> Option<char> {
        match self.0 {
            0x730A_0003 => Some('A'),
            0x730B_0003 => Some('B'),
            _ => None,
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TDS 7.{}", self.minor())?;
        if let Some(suffix) = self.revision_suffix() {
            write!(f, "{suffix}")?;
        }
        Ok(())
    }
}

impl From<u32> for TdsVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert!(TdsVersion::V7_4 > TdsVersion::V7_3B);
        assert!(TdsVersion::V7_3B > TdsVersion::V7_3A);
        assert!(TdsVersion::V7_2 > TdsVersion::V7_1);
        assert_eq!(TdsVersion::V7_4.min(TdsVersion::V7_2), TdsVersion::V7_2);
    }

    #[test]
    fn test_transaction_descriptor_support() {
        assert!(!TdsVersion::V7_1.supports_transaction_descriptors());
        assert!(TdsVersion::V7_1.is_legacy());
        assert!(TdsVersion::V7_2.supports_transaction_descriptors());
        assert!(TdsVersion::V7_4.has_wide_user_type());
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(TdsVersion::parse("7_3_B"), Some(TdsVersion::V7_3B));
        assert_eq!(TdsVersion::parse(" 7.4 "), Some(TdsVersion::V7_4));
        assert_eq!(TdsVersion::parse("6.5"), None);
        assert_eq!(TdsVersion::V7_3A.to_string(), "TDS 7.3A");
        assert_eq!(TdsVersion::V7_4.to_string(), "TDS 7.4");
    }
}
