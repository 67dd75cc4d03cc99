//! Response token stream.
//!
//! A tabular response is a sequence of tokens, each starting with a type
//! byte. [`TokenParser`] walks one reassembled response message and yields
//! [`Token`]s. It keeps the most recent COLMETADATA so that the rows that
//! follow can be split into column values.
//!
//! ```rust,ignore
//! let mut parser = TokenParser::new(payload, TdsVersion::V7_4);
//! while let Some(token) = parser.next_token()? {
//!     match token {
//!         Token::Done(done) => println!("rows: {}", done.row_count),
//!         Token::Error(err) => eprintln!("{}: {}", err.number, err.message),
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    read_b_varbyte, read_b_varchar, read_bytes, read_i32_le, read_u8, read_u16_le, read_u32_le,
    read_u64_le, read_us_varchar, read_utf16_string, write_b_varchar, write_us_varchar,
    write_utf16_string,
};
use crate::collation::Collation;
use crate::error::ProtocolError;
use crate::metadata::{Metadata, read_metadata};
use crate::types::TypeId;
use crate::value::read_value;
use crate::version::TdsVersion;

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// COLMETADATA.
    ColMetaData = 0x81,
    /// ERROR.
    Error = 0xAA,
    /// INFO.
    Info = 0xAB,
    /// LOGINACK.
    LoginAck = 0xAD,
    /// ROW.
    Row = 0xD1,
    /// NBCROW.
    NbcRow = 0xD2,
    /// ENVCHANGE.
    EnvChange = 0xE3,
    /// SSPI.
    Sspi = 0xED,
    /// DONE.
    Done = 0xFD,
    /// DONEINPROC.
    DoneInProc = 0xFF,
    /// DONEPROC.
    DoneProc = 0xFE,
    /// RETURNSTATUS.
    ReturnStatus = 0x79,
    /// RETURNVALUE.
    ReturnValue = 0xAC,
    /// ORDER.
    Order = 0xA9,
    /// FEATUREEXTACK.
    FeatureExtAck = 0xAE,
    /// SESSIONSTATE.
    SessionState = 0xE4,
    /// FEDAUTHINFO.
    FedAuthInfo = 0xEE,
    /// COLINFO.
    ColInfo = 0xA5,
    /// TABNAME.
    TabName = 0xA4,
    /// DATACLASSIFICATION.
    DataClassification = 0xA3,
}

impl TokenType {
    /// Look up a token byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x81 => Self::ColMetaData,
            0xAA => Self::Error,
            0xAB => Self::Info,
            0xAD => Self::LoginAck,
            0xD1 => Self::Row,
            0xD2 => Self::NbcRow,
            0xE3 => Self::EnvChange,
            0xED => Self::Sspi,
            0xFD => Self::Done,
            0xFF => Self::DoneInProc,
            0xFE => Self::DoneProc,
            0x79 => Self::ReturnStatus,
            0xAC => Self::ReturnValue,
            0xA9 => Self::Order,
            0xAE => Self::FeatureExtAck,
            0xE4 => Self::SessionState,
            0xEE => Self::FedAuthInfo,
            0xA5 => Self::ColInfo,
            0xA4 => Self::TabName,
            0xA3 => Self::DataClassification,
            _ => return None,
        })
    }
}

bitflags! {
    /// DONE status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention.
        const ATTN = 0x0020;
        /// A severe server error occurred.
        const SERVER_ERROR = 0x0100;
    }
}

/// DONE, DONEPROC and DONEINPROC body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Current command token.
    pub cur_cmd: u16,
    /// Affected row count, valid when [`DoneStatus::COUNT`] is set.
    pub row_count: u64,
}

impl Done {
    /// Decode the body; the row count is 32 bits wide before TDS 7.2.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let status = DoneStatus::from_bits_retain(read_u16_le(src)?);
        let cur_cmd = read_u16_le(src)?;
        let row_count = if version.is_legacy() {
            u64::from(read_u32_le(src)?)
        } else {
            read_u64_le(src)?
        };
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode the body (TDS 7.2+ layout).
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Whether more results follow.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Whether this token acknowledges an attention.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    /// Row count when it is valid.
    #[must_use]
    pub const fn count(&self) -> Option<u64> {
        if self.status.contains(DoneStatus::COUNT) {
            Some(self.row_count)
        } else {
            None
        }
    }
}

/// ERROR or INFO message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

impl ServerMessage {
    /// Decode the body.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let _length = read_u16_le(src)?;
        let number = read_i32_le(src)?;
        let state = read_u8(src)?;
        let class = read_u8(src)?;
        let message = read_us_varchar(src)?;
        let server = read_b_varchar(src)?;
        let procedure = read_b_varchar(src)?;
        let line = if version.is_legacy() {
            i32::from(read_u16_le(src)?)
        } else {
            read_i32_le(src)?
        };
        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode the body including its length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        write_us_varchar(&mut body, &self.message)?;
        write_b_varchar(&mut body, &self.server)?;
        write_b_varchar(&mut body, &self.procedure)?;
        body.put_i32_le(self.line);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}

/// LOGINACK body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface (1 = T-SQL).
    pub interface: u8,
    /// Negotiated TDS version.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode the body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let _length = read_u16_le(src)?;
        let interface = read_u8(src)?;
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let tds_version = TdsVersion::new(src.get_u32());
        let prog_name = read_b_varchar(src)?;
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let prog_version = src.get_u32();
        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Encode the body including its length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version.raw());
        write_b_varchar(&mut body, &self.prog_name)?;
        body.put_u32(self.prog_version);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}

/// Environment change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    /// Current database changed.
    Database(String),
    /// Session language changed.
    Language(String),
    /// Character set changed.
    CharacterSet(String),
    /// Packet size changed.
    PacketSize(u32),
    /// Default collation changed.
    SqlCollation(Option<Collation>),
    /// Transaction started; carries the new descriptor.
    BeginTransaction(u64),
    /// Transaction committed.
    CommitTransaction,
    /// Transaction rolled back.
    RollbackTransaction,
    /// Distributed transaction enlisted; carries the descriptor.
    EnlistDtcTransaction(u64),
    /// Transaction defected.
    DefectTransaction,
    /// Transaction ended by the server.
    TransactionEnded,
    /// RESET_CONNECTION acknowledged.
    ResetConnectionAck,
    /// Client must reconnect to another server.
    Routing {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
    /// A type this client does not act on.
    Other(u8),
}

fn descriptor(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let len = bytes.len().min(8);
    raw[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(raw)
}

impl EnvChange {
    /// Decode the body. The declared length bounds parsing, so unknown
    /// types and trailing fields are skipped safely.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let length = read_u16_le(src)? as usize;
        let mut body = Bytes::from(read_bytes(src, length)?);
        let env_type = read_u8(&mut body)?;

        Ok(match env_type {
            1 => Self::Database(read_b_varchar(&mut body)?),
            2 => Self::Language(read_b_varchar(&mut body)?),
            3 => Self::CharacterSet(read_b_varchar(&mut body)?),
            4 => {
                let size = read_b_varchar(&mut body)?;
                Self::PacketSize(
                    size.parse()
                        .map_err(|_| ProtocolError::StringEncoding(format!("packet size {size:?}")))?,
                )
            }
            7 => {
                let new = read_b_varbyte(&mut body)?;
                Self::SqlCollation(if new.is_empty() {
                    None
                } else {
                    Some(Collation::from_slice(&new)?)
                })
            }
            8 => Self::BeginTransaction(descriptor(&read_b_varbyte(&mut body)?)),
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction(descriptor(&read_b_varbyte(&mut body)?)),
            12 => Self::DefectTransaction,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionAck,
            20 => {
                let _value_len = read_u16_le(&mut body)?;
                let _protocol = read_u8(&mut body)?;
                let port = read_u16_le(&mut body)?;
                let host_len = read_u16_le(&mut body)? as usize;
                let host = read_utf16_string(&mut body, host_len)?;
                Self::Routing { host, port }
            }
            other => Self::Other(other),
        })
    }

    /// Encode the body including its length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        match self {
            Self::Database(name) => string_change(&mut body, 1, name)?,
            Self::Language(name) => string_change(&mut body, 2, name)?,
            Self::CharacterSet(name) => string_change(&mut body, 3, name)?,
            Self::PacketSize(size) => string_change(&mut body, 4, &size.to_string())?,
            Self::SqlCollation(collation) => {
                body.put_u8(7);
                match collation {
                    Some(c) => {
                        body.put_u8(Collation::SIZE as u8);
                        c.encode(&mut body);
                    }
                    None => body.put_u8(0),
                }
                body.put_u8(0);
            }
            Self::BeginTransaction(d) => {
                body.put_u8(8);
                body.put_u8(8);
                body.put_u64_le(*d);
                body.put_u8(0);
            }
            Self::CommitTransaction | Self::RollbackTransaction => {
                body.put_u8(if matches!(self, Self::CommitTransaction) { 9 } else { 10 });
                body.put_u8(0);
                body.put_u8(0);
            }
            Self::EnlistDtcTransaction(d) => {
                body.put_u8(11);
                body.put_u8(8);
                body.put_u64_le(*d);
                body.put_u8(0);
            }
            Self::DefectTransaction | Self::TransactionEnded | Self::ResetConnectionAck => {
                body.put_u8(match self {
                    Self::DefectTransaction => 12,
                    Self::TransactionEnded => 17,
                    _ => 18,
                });
                body.put_u8(0);
                body.put_u8(0);
            }
            Self::Routing { host, port } => {
                let host_units = host.encode_utf16().count();
                body.put_u8(20);
                body.put_u16_le((5 + host_units * 2) as u16);
                body.put_u8(0); // TCP
                body.put_u16_le(*port);
                body.put_u16_le(host_units as u16);
                write_utf16_string(&mut body, host);
                body.put_u16_le(0);
            }
            Self::Other(env_type) => {
                body.put_u8(*env_type);
                body.put_u8(0);
                body.put_u8(0);
            }
        }
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}

fn string_change(body: &mut BytesMut, env_type: u8, value: &str) -> Result<(), ProtocolError> {
    body.put_u8(env_type);
    write_b_varchar(body, value)?;
    body.put_u8(0);
    Ok(())
}

/// FEDAUTHINFO body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FedAuthInfo {
    /// Security token service URL.
    pub sts_url: Option<String>,
    /// Service principal name of the server.
    pub spn: Option<String>,
}

impl FedAuthInfo {
    const STS_URL: u8 = 0x01;
    const SPN: u8 = 0x02;

    /// Decode the body. Option data offsets are relative to the start of
    /// the token data, after the length field.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let length = read_u32_le(src)? as usize;
        let data = read_bytes(src, length)?;
        let mut options = data.as_slice();
        let count = read_u32_le(&mut options)?;

        let mut info = Self::default();
        for _ in 0..count {
            let id = read_u8(&mut options)?;
            let len = read_u32_le(&mut options)? as usize;
            let offset = read_u32_le(&mut options)? as usize;
            let mut value = data.get(offset..offset + len).ok_or(ProtocolError::IncompletePacket {
                expected: offset + len,
                actual: data.len(),
            })?;
            let text = read_utf16_string(&mut value, len / 2)?;
            match id {
                Self::STS_URL => info.sts_url = Some(text),
                Self::SPN => info.spn = Some(text),
                _ => {}
            }
        }
        Ok(info)
    }

    /// Encode the body including its length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let options: Vec<(u8, &String)> = [(Self::STS_URL, &self.sts_url), (Self::SPN, &self.spn)]
            .into_iter()
            .filter_map(|(id, v)| v.as_ref().map(|v| (id, v)))
            .collect();
        let mut header = BytesMut::new();
        let mut values = BytesMut::new();
        let data_start = 4 + options.len() * 9;
        header.put_u32_le(options.len() as u32);
        for (id, value) in options {
            let before = values.len();
            write_utf16_string(&mut values, value);
            header.put_u8(id);
            header.put_u32_le((values.len() - before) as u32);
            header.put_u32_le((data_start + before) as u32);
        }
        dst.put_u32_le((header.len() + values.len()) as u32);
        dst.put_slice(&header);
        dst.put_slice(&values);
    }
}

/// One FEATUREEXTACK entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAck {
    /// Feature ID.
    pub feature_id: u8,
    /// Acknowledgement data.
    pub data: Bytes,
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Type metadata.
    pub metadata: Metadata,
    /// Table name parts for TEXT / NTEXT / IMAGE columns.
    pub table_name: Option<Vec<String>>,
}

/// COLMETADATA body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColMetaData {
    /// Columns in order.
    pub columns: Vec<Column>,
}

impl ColMetaData {
    const NO_METADATA: u16 = 0xFFFF;

    /// Decode the body.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let count = read_u16_le(src)?;
        if count == Self::NO_METADATA {
            return Ok(Self::default());
        }
        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let metadata = read_metadata(src, version)?;
            let table_name = if matches!(
                metadata.type_id,
                TypeId::Text | TypeId::NText | TypeId::Image
            ) {
                let parts = if version.is_legacy() { 1 } else { read_u8(src)? };
                Some(
                    (0..parts)
                        .map(|_| read_us_varchar(src))
                        .collect::<Result<Vec<_>, _>>()?,
                )
            } else {
                None
            };
            let name = read_b_varchar(src)?;
            columns.push(Column {
                name,
                metadata,
                table_name,
            });
        }
        Ok(Self { columns })
    }
}

/// One row; `None` entries are NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Result set description shared by all rows of the set.
    pub columns: Arc<ColMetaData>,
    /// Raw column values.
    pub values: Vec<Option<Bytes>>,
}

impl Row {
    /// Value of column `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.values.get(index).and_then(Option::as_ref)
    }

    /// Value of the column called `name`.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&Bytes> {
        let index = self.columns.columns.iter().position(|c| c.name == name)?;
        self.get(index)
    }
}

/// RETURNVALUE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name.
    pub name: String,
    /// Status (1 = output parameter, 2 = UDF return value).
    pub status: u8,
    /// Type metadata.
    pub metadata: Metadata,
    /// Raw value.
    pub value: Option<Bytes>,
}

/// A decoded token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Start of a result set.
    ColMetaData(Arc<ColMetaData>),
    /// A row (ROW or NBCROW).
    Row(Row),
    /// End of a statement.
    Done(Done),
    /// End of a statement inside a procedure.
    DoneInProc(Done),
    /// End of a procedure.
    DoneProc(Done),
    /// Error message.
    Error(ServerMessage),
    /// Informational message.
    Info(ServerMessage),
    /// Login acknowledged.
    LoginAck(LoginAck),
    /// Environment change.
    EnvChange(EnvChange),
    /// Procedure return status.
    ReturnStatus(i32),
    /// Output parameter.
    ReturnValue(ReturnValue),
    /// ORDER BY columns.
    Order(Vec<u16>),
    /// Feature extension acknowledgements.
    FeatureExtAck(Vec<FeatureAck>),
    /// SSPI / NTLM challenge.
    Sspi(Bytes),
    /// Federated authentication information.
    FedAuthInfo(FedAuthInfo),
}

/// Parser over one response message.
#[derive(Debug)]
pub struct TokenParser {
    data: Bytes,
    version: TdsVersion,
    columns: Option<Arc<ColMetaData>>,
}

impl TokenParser {
    /// Create a parser.
    #[must_use]
    pub fn new(data: Bytes, version: TdsVersion) -> Self {
        Self {
            data,
            version,
            columns: None,
        }
    }

    /// Parse the rest of the stream as `version`; a LOGINACK can lower the
    /// version mid-message.
    pub fn set_version(&mut self, version: TdsVersion) {
        self.version = version;
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    /// Current result set description, if any.
    #[must_use]
    pub fn columns(&self) -> Option<&Arc<ColMetaData>> {
        self.columns.as_ref()
    }

    /// Parse the next token, or `None` at end of message.
    pub fn next_token(&mut self) -> Result<Option<Token>, ProtocolError> {
        loop {
            if !self.data.has_remaining() {
                return Ok(None);
            }
            let byte = self.data.get_u8();
            let token_type = TokenType::from_u8(byte).ok_or(ProtocolError::InvalidTokenType(byte))?;
            if let Some(token) = self.parse(token_type)? {
                return Ok(Some(token));
            }
        }
    }

    fn parse(&mut self, token_type: TokenType) -> Result<Option<Token>, ProtocolError> {
        let src = &mut self.data;
        let version = self.version;
        let token = match token_type {
            TokenType::ColMetaData => {
                let columns = Arc::new(ColMetaData::decode(src, version)?);
                self.columns = Some(Arc::clone(&columns));
                Token::ColMetaData(columns)
            }
            TokenType::Row | TokenType::NbcRow => {
                let columns = self
                    .columns
                    .clone()
                    .ok_or(ProtocolError::InvalidTokenType(token_type as u8))?;
                let values = if token_type == TokenType::NbcRow {
                    read_nbc_row(src, &columns)?
                } else {
                    columns
                        .columns
                        .iter()
                        .map(|c| read_value(src, &c.metadata))
                        .collect::<Result<Vec<_>, _>>()?
                };
                Token::Row(Row { columns, values })
            }
            TokenType::Done => Token::Done(Done::decode(src, version)?),
            TokenType::DoneInProc => Token::DoneInProc(Done::decode(src, version)?),
            TokenType::DoneProc => Token::DoneProc(Done::decode(src, version)?),
            TokenType::Error => Token::Error(ServerMessage::decode(src, version)?),
            TokenType::Info => Token::Info(ServerMessage::decode(src, version)?),
            TokenType::LoginAck => Token::LoginAck(LoginAck::decode(src)?),
            TokenType::EnvChange => Token::EnvChange(EnvChange::decode(src)?),
            TokenType::ReturnStatus => Token::ReturnStatus(read_i32_le(src)?),
            TokenType::ReturnValue => {
                let ordinal = read_u16_le(src)?;
                let name = read_b_varchar(src)?;
                let status = read_u8(src)?;
                let metadata = read_metadata(src, version)?;
                let value = read_value(src, &metadata)?;
                Token::ReturnValue(ReturnValue {
                    ordinal,
                    name,
                    status,
                    metadata,
                    value,
                })
            }
            TokenType::Order => {
                let len = read_u16_le(src)? as usize;
                let mut body = Bytes::from(read_bytes(src, len)?);
                let mut columns = Vec::with_capacity(len / 2);
                while body.remaining() >= 2 {
                    columns.push(body.get_u16_le());
                }
                Token::Order(columns)
            }
            TokenType::FeatureExtAck => {
                let mut acks = Vec::new();
                loop {
                    let feature_id = read_u8(src)?;
                    if feature_id == 0xFF {
                        break;
                    }
                    let len = read_u32_le(src)? as usize;
                    acks.push(FeatureAck {
                        feature_id,
                        data: Bytes::from(read_bytes(src, len)?),
                    });
                }
                Token::FeatureExtAck(acks)
            }
            TokenType::Sspi => {
                let len = read_u16_le(src)? as usize;
                Token::Sspi(Bytes::from(read_bytes(src, len)?))
            }
            TokenType::FedAuthInfo => Token::FedAuthInfo(FedAuthInfo::decode(src)?),
            TokenType::SessionState => {
                let len = read_u32_le(src)? as usize;
                read_bytes(src, len)?;
                return Ok(None);
            }
            TokenType::ColInfo | TokenType::TabName | TokenType::DataClassification => {
                let len = read_u16_le(src)? as usize;
                read_bytes(src, len)?;
                return Ok(None);
            }
        };
        Ok(Some(token))
    }
}

fn read_nbc_row(src: &mut impl Buf, columns: &ColMetaData) -> Result<Vec<Option<Bytes>>, ProtocolError> {
    let bitmap = read_bytes(src, columns.columns.len().div_ceil(8))?;
    columns
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                Ok(None)
            } else {
                read_value(src, &c.metadata)
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse_all(bytes: BytesMut) -> Vec<Token> {
        let mut parser = TokenParser::new(bytes.freeze(), TdsVersion::V7_4);
        let mut tokens = Vec::new();
        while let Some(token) = parser.next_token().unwrap() {
            tokens.push(token);
        }
        tokens
    }

    #[test]
    fn test_done_layout() {
        let done = Done {
            status: DoneStatus::COUNT | DoneStatus::MORE,
            cur_cmd: 0xC1,
            row_count: 7,
        };
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::Done as u8);
        done.encode(&mut buf);
        assert_eq!(buf.len(), 13);

        let tokens = parse_all(buf);
        assert_eq!(tokens, vec![Token::Done(done)]);
        assert_eq!(done.count(), Some(7));
        assert!(done.has_more());
    }

    #[test]
    fn test_attention_ack() {
        let done = Done {
            status: DoneStatus::ATTN,
            cur_cmd: 0,
            row_count: 0,
        };
        assert!(done.is_attention_ack());
        assert_eq!(done.count(), None);
    }

    #[test]
    fn test_error_message() {
        let message = ServerMessage {
            number: 18456,
            state: 1,
            class: 14,
            message: "Login failed for user 'sa'.".into(),
            server: "db".into(),
            procedure: String::new(),
            line: 1,
        };
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::Error as u8);
        message.encode(&mut buf).unwrap();

        assert_eq!(parse_all(buf), vec![Token::Error(message)]);
    }

    #[test]
    fn test_login_ack_version_is_big_endian() {
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::LoginAck as u8);
        LoginAck {
            interface: 1,
            tds_version: TdsVersion::V7_4,
            prog_name: "Microsoft SQL Server".into(),
            prog_version: 0x1000_0FA0,
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(&buf[4..8], &[0x74, 0x00, 0x00, 0x04]);

        match &parse_all(buf)[0] {
            Token::LoginAck(ack) => assert_eq!(ack.tds_version, TdsVersion::V7_4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_env_changes() {
        let changes = vec![
            EnvChange::Database("master".into()),
            EnvChange::PacketSize(8000),
            EnvChange::BeginTransaction(0x0102_0304_0506_0708),
            EnvChange::CommitTransaction,
            EnvChange::ResetConnectionAck,
            EnvChange::Routing {
                host: "replica.internal".into(),
                port: 11000,
            },
        ];
        let mut buf = BytesMut::new();
        for change in &changes {
            buf.put_u8(TokenType::EnvChange as u8);
            change.encode(&mut buf).unwrap();
        }

        let parsed: Vec<EnvChange> = parse_all(buf)
            .into_iter()
            .map(|t| match t {
                Token::EnvChange(e) => e,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(parsed, changes);
    }

    #[test]
    fn test_unknown_env_change_is_skipped_by_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::EnvChange as u8);
        buf.put_u16_le(4);
        buf.put_slice(&[19, 1, 2, 3]);
        buf.put_u8(TokenType::ReturnStatus as u8);
        buf.put_i32_le(5);

        let tokens = parse_all(buf);
        assert_eq!(tokens[0], Token::EnvChange(EnvChange::Other(19)));
        assert_eq!(tokens[1], Token::ReturnStatus(5));
    }

    #[test]
    fn test_fed_auth_info() {
        let info = FedAuthInfo {
            sts_url: Some("https://login.example/tenant".into()),
            spn: Some("https://database.example/".into()),
        };
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::FedAuthInfo as u8);
        info.encode(&mut buf);

        assert_eq!(parse_all(buf), vec![Token::FedAuthInfo(info)]);
    }

    #[test]
    fn test_rows_follow_metadata() {
        let mut buf = BytesMut::new();
        buf.put_u8(TokenType::ColMetaData as u8);
        buf.put_u16_le(2);
        // id INT NOT NULL
        buf.put_u32_le(0);
        buf.put_u16_le(0);
        buf.put_u8(TypeId::Int as u8);
        write_b_varchar(&mut buf, "id").unwrap();
        // name NVARCHAR(10) NULL
        buf.put_u32_le(0);
        buf.put_u16_le(1);
        buf.put_u8(TypeId::NVarChar as u8);
        buf.put_u16_le(20);
        buf.put_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
        write_b_varchar(&mut buf, "name").unwrap();

        buf.put_u8(TokenType::Row as u8);
        buf.put_i32_le(1);
        buf.put_u16_le(2);
        buf.put_slice(&[b'x', 0]);

        buf.put_u8(TokenType::NbcRow as u8);
        buf.put_u8(0b10);
        buf.put_i32_le(2);

        let tokens = parse_all(buf);
        assert_eq!(tokens.len(), 3);
        let Token::Row(first) = &tokens[1] else {
            panic!("expected row")
        };
        assert_eq!(first.get(0).unwrap().as_ref(), &[1, 0, 0, 0]);
        assert_eq!(first.get_by_name("name").unwrap().as_ref(), &[b'x', 0]);

        let Token::Row(second) = &tokens[2] else {
            panic!("expected row")
        };
        assert_eq!(second.get(0).unwrap().as_ref(), &[2, 0, 0, 0]);
        assert!(second.get(1).is_none());
    }

    #[test]
    fn test_row_without_metadata() {
        let mut parser = TokenParser::new(Bytes::from_static(&[0xD1, 0x01]), TdsVersion::V7_4);
        assert!(parser.next_token().is_err());
    }

    #[test]
    fn test_invalid_token() {
        let mut parser = TokenParser::new(Bytes::from_static(&[0x02]), TdsVersion::V7_4);
        assert_eq!(parser.next_token(), Err(ProtocolError::InvalidTokenType(0x02)));
    }
}
