//! TDS data type identifiers.

/// Type byte as it appears in column metadata and RPC parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// NULL.
    Null = 0x1F,
    /// TINYINT.
    TinyInt = 0x30,
    /// BIT.
    Bit = 0x32,
    /// SMALLINT.
    SmallInt = 0x34,
    /// INT.
    Int = 0x38,
    /// SMALLDATETIME.
    SmallDateTime = 0x3A,
    /// REAL.
    Real = 0x3B,
    /// MONEY.
    Money = 0x3C,
    /// DATETIME.
    DateTime = 0x3D,
    /// FLOAT.
    Float = 0x3E,
    /// SMALLMONEY.
    SmallMoney = 0x7A,
    /// BIGINT.
    BigInt = 0x7F,
    /// UNIQUEIDENTIFIER.
    UniqueIdentifier = 0x24,
    /// Nullable integer of 1, 2, 4 or 8 bytes.
    IntN = 0x26,
    /// Nullable DECIMAL.
    DecimalN = 0x6A,
    /// Nullable NUMERIC.
    NumericN = 0x6C,
    /// Nullable BIT.
    BitN = 0x68,
    /// Nullable REAL / FLOAT.
    FloatN = 0x6D,
    /// Nullable MONEY / SMALLMONEY.
    MoneyN = 0x6E,
    /// Nullable DATETIME / SMALLDATETIME.
    DateTimeN = 0x6F,
    /// IMAGE.
    Image = 0x22,
    /// TEXT.
    Text = 0x23,
    /// VARBINARY.
    VarBinary = 0xA5,
    /// VARCHAR.
    VarChar = 0xA7,
    /// BINARY.
    Binary = 0xAD,
    /// CHAR.
    Char = 0xAF,
    /// NVARCHAR.
    NVarChar = 0xE7,
    /// NCHAR.
    NChar = 0xEF,
    /// XML.
    Xml = 0xF1,
    /// CLR user-defined type.
    Udt = 0xF0,
    /// NTEXT.
    NText = 0x63,
    /// SQL_VARIANT.
    Variant = 0x62,
    /// DATE.
    Date = 0x28,
    /// TIME.
    Time = 0x29,
    /// DATETIME2.
    DateTime2 = 0x2A,
    /// DATETIMEOFFSET.
    DateTimeOffset = 0x2B,
}

impl TypeId {
    /// Look up a type byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x1F => Self::Null,
            0x30 => Self::TinyInt,
            0x32 => Self::Bit,
            0x34 => Self::SmallInt,
            0x38 => Self::Int,
            0x3A => Self::SmallDateTime,
            0x3B => Self::Real,
            0x3C => Self::Money,
            0x3D => Self::DateTime,
            0x3E => Self::Float,
            0x7A => Self::SmallMoney,
            0x7F => Self::BigInt,
            0x24 => Self::UniqueIdentifier,
            0x26 => Self::IntN,
            0x6A => Self::DecimalN,
            0x6C => Self::NumericN,
            0x68 => Self::BitN,
            0x6D => Self::FloatN,
            0x6E => Self::MoneyN,
            0x6F => Self::DateTimeN,
            0x22 => Self::Image,
            0x23 => Self::Text,
            0xA5 => Self::VarBinary,
            0xA7 => Self::VarChar,
            0xAD => Self::Binary,
            0xAF => Self::Char,
            0xE7 => Self::NVarChar,
            0xEF => Self::NChar,
            0xF1 => Self::Xml,
            0xF0 => Self::Udt,
            0x63 => Self::NText,
            0x62 => Self::Variant,
            0x28 => Self::Date,
            0x29 => Self::Time,
            0x2A => Self::DateTime2,
            0x2B => Self::DateTimeOffset,
            _ => return None,
        })
    }

    /// Size of a value of this type when it carries no length prefix.
    #[must_use]
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::TinyInt | Self::Bit => Some(1),
            Self::SmallInt => Some(2),
            Self::Int | Self::Real | Self::SmallMoney | Self::SmallDateTime => Some(4),
            Self::BigInt | Self::Float | Self::Money | Self::DateTime => Some(8),
            _ => None,
        }
    }

    /// Whether the metadata carries a collation.
    #[must_use]
    pub const fn has_collation(self) -> bool {
        matches!(
            self,
            Self::VarChar | Self::Char | Self::NVarChar | Self::NChar | Self::Text | Self::NText
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8() {
        assert_eq!(TypeId::from_u8(0x29), Some(TypeId::Time));
        assert_eq!(TypeId::from_u8(0x2A), Some(TypeId::DateTime2));
        assert_eq!(TypeId::from_u8(0x00), None);
    }

    #[test]
    fn test_fixed_size() {
        assert_eq!(TypeId::Int.fixed_size(), Some(4));
        assert_eq!(TypeId::IntN.fixed_size(), None);
        assert!(TypeId::NText.has_collation());
        assert!(!TypeId::VarBinary.has_collation());
    }
}
