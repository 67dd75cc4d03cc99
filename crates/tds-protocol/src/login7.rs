//! LOGIN7 record construction.
//!
//! A fixed 94-byte header followed by a variable data section. The header
//! holds offset/length pairs (in UTF-16 code units for strings, bytes for
//! SSPI) pointing into the data section. When a feature extension block is
//! present, the "extension" slot holds a 4-byte pointer to it instead of the
//! unused string.
//!
//! The password is obfuscated, not encrypted. It must only travel over TLS.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Fixed header size of a LOGIN7 record.
pub const LOGIN7_HEADER_SIZE: usize = 94;

bitflags! {
    /// OptionFlags1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags1: u8 {
        /// Big-endian byte order.
        const BYTE_ORDER_BE = 0x01;
        /// EBCDIC character set.
        const CHAR_EBCDIC = 0x02;
        /// Dump/load off.
        const DUMP_LOAD_OFF = 0x10;
        /// Warn on database change.
        const USE_DB_NOTIFY = 0x20;
        /// Failure to switch to the initial database is fatal.
        const INIT_DB_FATAL = 0x40;
        /// Warn on language change.
        const SET_LANG_NOTIFY = 0x80;
    }
}

bitflags! {
    /// OptionFlags2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags2: u8 {
        /// Failure to set the initial language is fatal.
        const INIT_LANG_FATAL = 0x01;
        /// ODBC client.
        const ODBC = 0x02;
        /// Integrated security (SSPI / NTLM).
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags! {
    /// TypeFlags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// T-SQL dialect.
        const SQL_TSQL = 0x01;
        /// OLE DB client.
        const OLEDB = 0x10;
        /// Read-only application intent.
        const READ_ONLY_INTENT = 0x20;
    }
}

bitflags! {
    /// OptionFlags3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags3: u8 {
        /// Change password request.
        const CHANGE_PASSWORD = 0x01;
        /// User instance.
        const USER_INSTANCE = 0x02;
        /// Binary XML.
        const SEND_YUKON_BINARY_XML = 0x04;
        /// Accept unknown collations.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
        /// Feature extension block present.
        const EXTENSION = 0x10;
    }
}

/// Feature extension identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery.
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// UTF-8 support.
    Utf8Support = 0x0A,
    /// End of feature list.
    Terminator = 0xFF,
}

/// One feature extension entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureExtension {
    /// Feature ID.
    pub feature_id: FeatureId,
    /// Feature data.
    pub data: Bytes,
}

/// LOGIN7 record builder.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// TDS version to request.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client program version.
    pub client_prog_version: u32,
    /// Client process ID.
    pub client_pid: u32,
    /// OptionFlags1.
    pub option_flags1: OptionFlags1,
    /// OptionFlags2.
    pub option_flags2: OptionFlags2,
    /// TypeFlags.
    pub type_flags: TypeFlags,
    /// OptionFlags3.
    pub option_flags3: OptionFlags3,
    /// Client timezone offset in minutes.
    pub client_timezone: i32,
    /// Client LCID.
    pub client_lcid: u32,
    /// Client machine name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// SQL login password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// Client MAC address.
    pub client_id: [u8; 6],
    /// SSPI / NTLM negotiate message.
    pub sspi: Vec<u8>,
    /// Database file to attach.
    pub attach_db_file: String,
    /// Feature extensions.
    pub features: Vec<FeatureExtension>,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: 4096,
            client_prog_version: 0,
            client_pid: std::process::id(),
            option_flags1: OptionFlags1::USE_DB_NOTIFY | OptionFlags1::INIT_DB_FATAL,
            option_flags2: OptionFlags2::INIT_LANG_FATAL | OptionFlags2::ODBC,
            type_flags: TypeFlags::empty(),
            option_flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            client_timezone: 0,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: String::from("tds-client"),
            language: String::new(),
            database: String::new(),
            client_id: [0u8; 6],
            sspi: Vec::new(),
            attach_db_file: String::new(),
            features: Vec::new(),
        }
    }
}

impl Login7 {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TDS version.
    #[must_use]
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Use SQL authentication.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.option_flags2.remove(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Use integrated security with an initial SSPI/NTLM token.
    #[must_use]
    pub fn with_integrated_auth(mut self, sspi: Vec<u8>) -> Self {
        self.sspi = sspi;
        self.option_flags2.insert(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the initial language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Set read-only application intent.
    #[must_use]
    pub fn with_read_only_intent(mut self, read_only: bool) -> Self {
        self.type_flags.set(TypeFlags::READ_ONLY_INTENT, read_only);
        self
    }

    /// Append a feature extension.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureExtension) -> Self {
        self.option_flags3.insert(OptionFlags3::EXTENSION);
        self.features.push(feature);
        self
    }

    /// Encode the record.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let has_extension = !self.features.is_empty();
        let mut data = BytesMut::with_capacity(256);
        let mut slots: Vec<(u16, u16)> = Vec::with_capacity(12);

        let offset = |data: &BytesMut| -> Result<u16, ProtocolError> {
            u16::try_from(LOGIN7_HEADER_SIZE + data.len()).map_err(|_| ProtocolError::TooLong {
                field: "LOGIN7",
                len: LOGIN7_HEADER_SIZE + data.len(),
                max: u16::MAX as usize,
            })
        };
        let chars = |s: &str| s.encode_utf16().count() as u16;

        for s in [&self.hostname, &self.username] {
            slots.push((offset(&data)?, chars(s)));
            write_utf16_string(&mut data, s);
        }

        slots.push((offset(&data)?, chars(&self.password)));
        write_obfuscated_password(&mut data, &self.password);

        for s in [&self.app_name, &self.server_name] {
            slots.push((offset(&data)?, chars(s)));
            write_utf16_string(&mut data, s);
        }

        // extension pointer, patched once the feature block position is known
        let extension_pointer_at = data.len();
        if has_extension {
            slots.push((offset(&data)?, 4));
            data.put_u32_le(0);
        } else {
            slots.push((offset(&data)?, 0));
        }

        for s in [&self.library_name, &self.language, &self.database] {
            slots.push((offset(&data)?, chars(s)));
            write_utf16_string(&mut data, s);
        }

        let sspi_offset = offset(&data)?;
        let sspi_len = self.sspi.len();
        data.put_slice(&self.sspi);

        slots.push((offset(&data)?, chars(&self.attach_db_file)));
        write_utf16_string(&mut data, &self.attach_db_file);

        // change-password slot, never used by this client
        slots.push((offset(&data)?, 0));

        if has_extension {
            let feature_offset = (LOGIN7_HEADER_SIZE + data.len()) as u32;
            data[extension_pointer_at..extension_pointer_at + 4]
                .copy_from_slice(&feature_offset.to_le_bytes());
            for feature in &self.features {
                data.put_u8(feature.feature_id as u8);
                data.put_u32_le(feature.data.len() as u32);
                data.put_slice(&feature.data);
            }
            data.put_u8(FeatureId::Terminator as u8);
        }

        let mut buf = BytesMut::with_capacity(LOGIN7_HEADER_SIZE + data.len());
        buf.put_u32_le((LOGIN7_HEADER_SIZE + data.len()) as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(0); // connection id
        buf.put_u8(self.option_flags1.bits());
        buf.put_u8(self.option_flags2.bits());
        buf.put_u8(self.type_flags.bits());
        buf.put_u8(self.option_flags3.bits());
        buf.put_i32_le(self.client_timezone);
        buf.put_u32_le(self.client_lcid);

        // hostname, username, password, app name, server name, extension,
        // library, language, database
        for (off, len) in &slots[..9] {
            buf.put_u16_le(*off);
            buf.put_u16_le(*len);
        }
        buf.put_slice(&self.client_id);

        buf.put_u16_le(sspi_offset);
        buf.put_u16_le(u16::try_from(sspi_len).unwrap_or(u16::MAX));

        // attach db file, change password
        for (off, len) in &slots[9..] {
            buf.put_u16_le(*off);
            buf.put_u16_le(*len);
        }
        // cbSSPILong, only used when the token does not fit in 16 bits
        buf.put_u32_le(if sspi_len > u16::MAX as usize { sspi_len as u32 } else { 0 });

        buf.put_slice(&data);
        Ok(buf.freeze())
    }
}

/// Write a password using the LOGIN7 obfuscation: swap nibbles, then XOR 0xA5.
pub fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for unit in password.encode_utf16() {
        for byte in unit.to_le_bytes() {
            dst.put_u8(byte.rotate_right(4) ^ 0xA5);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn slot(encoded: &[u8], at: usize) -> (u16, u16) {
        (
            u16::from_le_bytes([encoded[at], encoded[at + 1]]),
            u16::from_le_bytes([encoded[at + 2], encoded[at + 3]]),
        )
    }

    #[test]
    fn test_header_fields() {
        let encoded = Login7::new()
            .with_hostname("HOST")
            .with_sql_auth("sa", "secret")
            .with_database("master")
            .with_app_name("app")
            .encode()
            .unwrap();

        let total = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(total as usize, encoded.len());
        assert_eq!(
            u32::from_le_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]),
            TdsVersion::V7_4.raw()
        );

        // hostname at the start of the data section
        assert_eq!(slot(&encoded, 36), (94, 4));
        // username follows the 8 hostname bytes
        assert_eq!(slot(&encoded, 40), (102, 2));
        assert_eq!(&encoded[102..106], &[b's', 0, b'a', 0]);
        // password length in characters
        assert_eq!(slot(&encoded, 44).1, 6);
    }

    #[test]
    fn test_feature_extension_pointer() {
        let feature = FeatureExtension {
            feature_id: FeatureId::FedAuth,
            data: Bytes::from_static(&[0x04, 0x00]),
        };
        let login = Login7::new().with_feature(feature);
        assert!(login.option_flags3.contains(OptionFlags3::EXTENSION));

        let encoded = login.encode().unwrap();
        let (ext_off, ext_len) = slot(&encoded, 56);
        assert_eq!(ext_len, 4);

        let ext_off = ext_off as usize;
        let pointer = u32::from_le_bytes([
            encoded[ext_off],
            encoded[ext_off + 1],
            encoded[ext_off + 2],
            encoded[ext_off + 3],
        ]) as usize;
        assert_eq!(encoded[pointer], FeatureId::FedAuth as u8);
        assert_eq!(&encoded[pointer + 5..pointer + 7], &[0x04, 0x00]);
        assert_eq!(encoded[encoded.len() - 1], FeatureId::Terminator as u8);
    }

    #[test]
    fn test_integrated_auth_flag() {
        let login = Login7::new().with_integrated_auth(vec![1, 2, 3]);
        assert!(login.option_flags2.contains(OptionFlags2::INTEGRATED_SECURITY));
        let encoded = login.encode().unwrap();
        assert_eq!(encoded[25] & 0x80, 0x80);
        let (sspi_off, sspi_len) = slot(&encoded, 78);
        assert_eq!(sspi_len, 3);
        assert_eq!(&encoded[sspi_off as usize..sspi_off as usize + 3], &[1, 2, 3]);
    }

    #[test]
    fn test_password_obfuscation() {
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");
        assert_eq!(&buf[..], &[0xB3, 0xA5]);
    }
}
