//! Column type metadata reader.
//!
//! Reads the TYPE_INFO block shared by COLMETADATA, RETURNVALUE and the
//! bulk-load column description: user type, flags, type byte and whatever
//! extra fields that type carries (length, collation, precision/scale,
//! XML schema or UDT description).

use bitflags::bitflags;
use bytes::Buf;

use crate::codec::{read_b_varchar, read_u8, read_u16_le, read_u32_le, read_us_varchar};
use crate::collation::Collation;
use crate::error::ProtocolError;
use crate::types::TypeId;
use crate::version::TdsVersion;

bitflags! {
    /// Column flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ColumnFlags: u16 {
        /// Column accepts NULL.
        const NULLABLE = 0x0001;
        /// Case-sensitive comparisons.
        const CASE_SENSITIVE = 0x0002;
        /// Read/write column.
        const UPDATEABLE = 0x0004;
        /// Updateability unknown.
        const UPDATEABLE_UNKNOWN = 0x0008;
        /// Identity column.
        const IDENTITY = 0x0010;
        /// Computed column.
        const COMPUTED = 0x0020;
        /// Fixed-length CLR type.
        const FIXED_LEN_CLR_TYPE = 0x0100;
        /// Sparse column set.
        const SPARSE_COLUMN_SET = 0x0400;
        /// Encrypted column.
        const ENCRYPTED = 0x0800;
        /// Hidden column.
        const HIDDEN = 0x2000;
        /// Part of the key.
        const KEY = 0x4000;
        /// Nullable but unknown.
        const NULLABLE_UNKNOWN = 0x8000;
    }
}

/// XML schema description attached to an XML column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlSchema {
    /// Database holding the schema collection.
    pub dbname: String,
    /// Owning schema.
    pub owning_schema: String,
    /// Schema collection name.
    pub xml_schema_collection: String,
}

/// CLR user-defined type description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdtInfo {
    /// Maximum serialized size.
    pub max_byte_size: u16,
    /// Database name.
    pub dbname: String,
    /// Owning schema.
    pub owning_schema: String,
    /// Type name.
    pub type_name: String,
    /// Assembly qualified name.
    pub assembly_name: String,
}

/// Decoded TYPE_INFO of one column or parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// User type ID.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Data type.
    pub type_id: TypeId,
    /// Collation of character types.
    pub collation: Option<Collation>,
    /// Precision of DECIMAL / NUMERIC.
    pub precision: Option<u8>,
    /// Scale of DECIMAL / NUMERIC and of the temporal types.
    pub scale: Option<u8>,
    /// Declared maximum length.
    pub data_length: Option<u32>,
    /// XML schema.
    pub schema: Option<XmlSchema>,
    /// UDT description.
    pub udt_info: Option<UdtInfo>,
}

impl Metadata {
    fn new(user_type: u32, flags: ColumnFlags, type_id: TypeId) -> Self {
        Self {
            user_type,
            flags,
            type_id,
            collation: None,
            precision: None,
            scale: None,
            data_length: None,
            schema: None,
            udt_info: None,
        }
    }

    /// Whether the column accepts NULL.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }

    /// Whether values are sent as partially length-prefixed chunks.
    #[must_use]
    pub fn is_plp(&self) -> bool {
        match self.type_id {
            TypeId::Xml | TypeId::Udt => true,
            TypeId::VarChar | TypeId::NVarChar | TypeId::VarBinary => {
                self.data_length == Some(0xFFFF)
            }
            _ => false,
        }
    }
}

/// Read a TYPE_INFO block.
///
/// The user type is 16 bits wide before TDS 7.2 and 32 bits from 7.2 on.
pub fn read_metadata(src: &mut impl Buf, version: TdsVersion) -> Result<Metadata, ProtocolError> {
    let user_type = if version.has_wide_user_type() {
        read_u32_le(src)?
    } else {
        u32::from(read_u16_le(src)?)
    };
    let flags = ColumnFlags::from_bits_retain(read_u16_le(src)?);
    let type_byte = read_u8(src)?;
    let type_id = TypeId::from_u8(type_byte).ok_or(ProtocolError::UnrecognisedDataType(type_byte))?;

    let mut metadata = Metadata::new(user_type, flags, type_id);
    read_type_info(src, &mut metadata)?;
    Ok(metadata)
}

/// Read the type-specific part that follows the type byte.
pub fn read_type_info(src: &mut impl Buf, metadata: &mut Metadata) -> Result<(), ProtocolError> {
    match metadata.type_id {
        TypeId::Null
        | TypeId::TinyInt
        | TypeId::SmallInt
        | TypeId::Int
        | TypeId::BigInt
        | TypeId::Real
        | TypeId::Float
        | TypeId::SmallMoney
        | TypeId::Money
        | TypeId::Bit
        | TypeId::SmallDateTime
        | TypeId::DateTime
        | TypeId::Date => {}

        TypeId::IntN
        | TypeId::FloatN
        | TypeId::MoneyN
        | TypeId::BitN
        | TypeId::UniqueIdentifier
        | TypeId::DateTimeN => {
            metadata.data_length = Some(u32::from(read_u8(src)?));
        }

        TypeId::Variant => {
            metadata.data_length = Some(read_u32_le(src)?);
        }

        TypeId::VarChar | TypeId::Char | TypeId::NVarChar | TypeId::NChar => {
            metadata.data_length = Some(u32::from(read_u16_le(src)?));
            metadata.collation = Some(Collation::decode(src)?);
        }

        TypeId::Text | TypeId::NText => {
            metadata.data_length = Some(read_u32_le(src)?);
            metadata.collation = Some(Collation::decode(src)?);
        }

        TypeId::VarBinary | TypeId::Binary => {
            metadata.data_length = Some(u32::from(read_u16_le(src)?));
        }

        TypeId::Image => {
            metadata.data_length = Some(read_u32_le(src)?);
        }

        TypeId::Xml => {
            if read_u8(src)? == 0x01 {
                metadata.schema = Some(XmlSchema {
                    dbname: read_b_varchar(src)?,
                    owning_schema: read_b_varchar(src)?,
                    xml_schema_collection: read_us_varchar(src)?,
                });
            }
        }

        TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
            metadata.scale = Some(read_u8(src)?);
        }

        TypeId::NumericN | TypeId::DecimalN => {
            metadata.data_length = Some(u32::from(read_u8(src)?));
            metadata.precision = Some(read_u8(src)?);
            metadata.scale = Some(read_u8(src)?);
        }

        TypeId::Udt => {
            metadata.udt_info = Some(UdtInfo {
                max_byte_size: read_u16_le(src)?,
                dbname: read_b_varchar(src)?,
                owning_schema: read_b_varchar(src)?,
                type_name: read_b_varchar(src)?,
                assembly_name: read_us_varchar(src)?,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::codec::{write_b_varchar, write_us_varchar};
    use bytes::{BufMut, BytesMut};

    fn header(buf: &mut BytesMut, type_byte: u8) {
        buf.put_u32_le(0);
        buf.put_u16_le(ColumnFlags::NULLABLE.bits());
        buf.put_u8(type_byte);
    }

    #[test]
    fn test_fixed_type_has_no_extras() {
        let mut buf = BytesMut::new();
        header(&mut buf, TypeId::Int as u8);
        buf.put_u8(0xEE);

        let mut cursor = buf.freeze();
        let metadata = read_metadata(&mut cursor, TdsVersion::V7_4).unwrap();
        assert_eq!(metadata.type_id, TypeId::Int);
        assert!(metadata.is_nullable());
        assert_eq!(metadata.data_length, None);
        assert_eq!(cursor.remaining(), 1);
    }

    #[test]
    fn test_narrow_user_type_before_7_2() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(7);
        buf.put_u16_le(0);
        buf.put_u8(TypeId::IntN as u8);
        buf.put_u8(4);

        let metadata = read_metadata(&mut buf.freeze(), TdsVersion::V7_1).unwrap();
        assert_eq!(metadata.user_type, 7);
        assert_eq!(metadata.data_length, Some(4));
    }

    #[test]
    fn test_nvarchar_with_collation() {
        let mut buf = BytesMut::new();
        header(&mut buf, TypeId::NVarChar as u8);
        buf.put_u16_le(100);
        buf.put_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);

        let metadata = read_metadata(&mut buf.freeze(), TdsVersion::V7_4).unwrap();
        assert_eq!(metadata.data_length, Some(100));
        assert_eq!(metadata.collation.unwrap().lcid(), 0x0409);
        assert!(!metadata.is_plp());
    }

    #[test]
    fn test_varbinary_max_is_plp() {
        let mut buf = BytesMut::new();
        header(&mut buf, TypeId::VarBinary as u8);
        buf.put_u16_le(0xFFFF);

        let metadata = read_metadata(&mut buf.freeze(), TdsVersion::V7_4).unwrap();
        assert!(metadata.is_plp());
    }

    #[test]
    fn test_decimal_precision_scale() {
        let mut buf = BytesMut::new();
        header(&mut buf, TypeId::DecimalN as u8);
        buf.put_slice(&[17, 38, 4]);

        let metadata = read_metadata(&mut buf.freeze(), TdsVersion::V7_4).unwrap();
        assert_eq!(metadata.data_length, Some(17));
        assert_eq!(metadata.precision, Some(38));
        assert_eq!(metadata.scale, Some(4));
    }

    #[test]
    fn test_xml_schema() {
        let mut buf = BytesMut::new();
        header(&mut buf, TypeId::Xml as u8);
        buf.put_u8(0x01);
        write_b_varchar(&mut buf, "db").unwrap();
        write_b_varchar(&mut buf, "dbo").unwrap();
        write_us_varchar(&mut buf, "coll").unwrap();

        let metadata = read_metadata(&mut buf.freeze(), TdsVersion::V7_4).unwrap();
        let schema = metadata.schema.unwrap();
        assert_eq!(schema.owning_schema, "dbo");
        assert_eq!(schema.xml_schema_collection, "coll");
    }

    #[test]
    fn test_udt_info() {
        let mut buf = BytesMut::new();
        header(&mut buf, TypeId::Udt as u8);
        buf.put_u16_le(892);
        write_b_varchar(&mut buf, "master").unwrap();
        write_b_varchar(&mut buf, "sys").unwrap();
        write_b_varchar(&mut buf, "geography").unwrap();
        write_us_varchar(&mut buf, "Microsoft.SqlServer.Types").unwrap();

        let metadata = read_metadata(&mut buf.freeze(), TdsVersion::V7_4).unwrap();
        let udt = metadata.udt_info.unwrap();
        assert_eq!(udt.max_byte_size, 892);
        assert_eq!(udt.type_name, "geography");
    }

    #[test]
    fn test_unrecognised_type() {
        let mut buf = BytesMut::new();
        header(&mut buf, 0x01);

        let err = read_metadata(&mut buf.freeze(), TdsVersion::V7_4).unwrap_err();
        assert_eq!(err.to_string(), "Unrecognised data type 0x01");
    }
}
