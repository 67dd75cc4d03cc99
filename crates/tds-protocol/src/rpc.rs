//! RPC request encoding (packet type 0x03).
//!
//! ```text
//! ALL_HEADERS | ProcName or 0xFFFF ProcID | OptionFlags | ParameterData*
//! ```
//!
//! Parameters carry their TYPE_INFO inline. [`RpcValue`] covers the types
//! the client binds itself; everything else should be sent as a batch.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{NaiveDateTime, NaiveTime};

use crate::codec::{utf16_byte_len, write_b_varchar, write_us_varchar, write_utf16_string};
use crate::error::ProtocolError;
use crate::sql_batch::{ALL_HEADERS_LEN, write_all_headers};
use crate::temporal::{datetime2_type_info, time_type_info, write_datetime2_param, write_time_param};
use crate::types::TypeId;
use crate::version::TdsVersion;

/// Collation sent with string parameters (Latin1_General_CI_AS).
pub const DEFAULT_COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

const MAX_SHORT_LEN: usize = 8000;

/// Well-known procedures addressed by ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_executesql
    ExecuteSql = 0x000A,
    /// sp_prepare
    Prepare = 0x000B,
    /// sp_execute
    Execute = 0x000C,
    /// sp_unprepare
    Unprepare = 0x000F,
}

bitflags! {
    /// RPC option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RpcOptionFlags: u16 {
        /// Recompile the procedure.
        const WITH_RECOMPILE = 0x0001;
        /// Suppress COLMETADATA in the response.
        const NO_METADATA = 0x0002;
        /// Reuse metadata from the previous call.
        const REUSE_METADATA = 0x0004;
    }
}

bitflags! {
    /// Parameter status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamFlags: u8 {
        /// OUTPUT parameter.
        const BY_REF = 0x01;
        /// Use the parameter's default value.
        const DEFAULT = 0x02;
    }
}

/// A parameter value together with its SQL type.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    /// BIT.
    Bit(Option<bool>),
    /// INT.
    Int(Option<i32>),
    /// BIGINT.
    BigInt(Option<i64>),
    /// FLOAT.
    Float(Option<f64>),
    /// NVARCHAR(n) or NVARCHAR(MAX) for long values.
    NVarChar(Option<String>),
    /// VARBINARY(n) or VARBINARY(MAX) for long values.
    VarBinary(Option<Bytes>),
    /// TIME(scale).
    Time(Option<NaiveTime>, u8),
    /// DATETIME2(scale).
    DateTime2(Option<NaiveDateTime>, u8),
}

impl RpcValue {
    /// Declaration for a `sp_executesql` / `sp_prepare` parameter list.
    #[must_use]
    pub fn sql_type(&self) -> String {
        match self {
            Self::Bit(_) => "bit".into(),
            Self::Int(_) => "int".into(),
            Self::BigInt(_) => "bigint".into(),
            Self::Float(_) => "float".into(),
            Self::NVarChar(v) => match v {
                Some(s) if utf16_byte_len(s) > MAX_SHORT_LEN => "nvarchar(max)".into(),
                _ => "nvarchar(4000)".into(),
            },
            Self::VarBinary(v) => match v {
                Some(b) if b.len() > MAX_SHORT_LEN => "varbinary(max)".into(),
                _ => "varbinary(8000)".into(),
            },
            Self::Time(_, scale) => format!("time({scale})"),
            Self::DateTime2(_, scale) => format!("datetime2({scale})"),
        }
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Self::Bit(v) => {
                dst.put_slice(&[TypeId::BitN as u8, 1]);
                match v {
                    Some(b) => dst.put_slice(&[1, u8::from(*b)]),
                    None => dst.put_u8(0),
                }
            }
            Self::Int(v) => {
                dst.put_slice(&[TypeId::IntN as u8, 4]);
                match v {
                    Some(n) => {
                        dst.put_u8(4);
                        dst.put_i32_le(*n);
                    }
                    None => dst.put_u8(0),
                }
            }
            Self::BigInt(v) => {
                dst.put_slice(&[TypeId::IntN as u8, 8]);
                match v {
                    Some(n) => {
                        dst.put_u8(8);
                        dst.put_i64_le(*n);
                    }
                    None => dst.put_u8(0),
                }
            }
            Self::Float(v) => {
                dst.put_slice(&[TypeId::FloatN as u8, 8]);
                match v {
                    Some(n) => {
                        dst.put_u8(8);
                        dst.put_f64_le(*n);
                    }
                    None => dst.put_u8(0),
                }
            }
            Self::NVarChar(v) => {
                let len = v.as_deref().map_or(0, utf16_byte_len);
                let plp = len > MAX_SHORT_LEN;
                dst.put_u8(TypeId::NVarChar as u8);
                dst.put_u16_le(if plp { 0xFFFF } else { MAX_SHORT_LEN as u16 });
                dst.put_slice(&DEFAULT_COLLATION);
                match v {
                    None => dst.put_u16_le(0xFFFF),
                    Some(s) if plp => {
                        dst.put_u64_le(len as u64);
                        dst.put_u32_le(len as u32);
                        write_utf16_string(dst, s);
                        dst.put_u32_le(0);
                    }
                    Some(s) => {
                        dst.put_u16_le(len as u16);
                        write_utf16_string(dst, s);
                    }
                }
            }
            Self::VarBinary(v) => {
                let len = v.as_ref().map_or(0, Bytes::len);
                let plp = len > MAX_SHORT_LEN;
                dst.put_u8(TypeId::VarBinary as u8);
                dst.put_u16_le(if plp { 0xFFFF } else { MAX_SHORT_LEN as u16 });
                match v {
                    None => dst.put_u16_le(0xFFFF),
                    Some(b) if plp => {
                        dst.put_u64_le(len as u64);
                        dst.put_u32_le(len as u32);
                        dst.put_slice(b);
                        dst.put_u32_le(0);
                    }
                    Some(b) => {
                        dst.put_u16_le(len as u16);
                        dst.put_slice(b);
                    }
                }
            }
            Self::Time(v, scale) => {
                dst.put_slice(&time_type_info(*scale));
                write_time_param(v.as_ref(), *scale, dst)?;
            }
            Self::DateTime2(v, scale) => {
                dst.put_slice(&datetime2_type_info(*scale));
                write_datetime2_param(v.as_ref(), *scale, dst)?;
            }
        }
        Ok(())
    }
}

/// One RPC parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcParam {
    /// Name including the leading `@`, or empty for positional.
    pub name: String,
    /// Status flags.
    pub flags: ParamFlags,
    /// Typed value.
    pub value: RpcValue,
}

impl RpcParam {
    /// An input parameter.
    pub fn new(name: impl Into<String>, value: RpcValue) -> Self {
        Self {
            name: name.into(),
            flags: ParamFlags::empty(),
            value,
        }
    }

    /// Mark as OUTPUT.
    #[must_use]
    pub fn output(mut self) -> Self {
        self.flags |= ParamFlags::BY_REF;
        self
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        write_b_varchar(dst, &self.name)?;
        dst.put_u8(self.flags.bits());
        self.value.encode(dst)
    }
}

/// Procedure being called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureRef {
    /// By name.
    Name(String),
    /// By well-known ID.
    Id(ProcId),
}

/// An RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Procedure to call.
    pub procedure: ProcedureRef,
    /// Option flags.
    pub options: RpcOptionFlags,
    /// Parameters in order.
    pub params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Call a procedure by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            procedure: ProcedureRef::Name(name.into()),
            options: RpcOptionFlags::empty(),
            params: Vec::new(),
        }
    }

    /// Call a well-known procedure.
    #[must_use]
    pub fn by_id(id: ProcId) -> Self {
        Self {
            procedure: ProcedureRef::Id(id),
            options: RpcOptionFlags::empty(),
            params: Vec::new(),
        }
    }

    /// Append a parameter.
    #[must_use]
    pub fn param(mut self, param: RpcParam) -> Self {
        self.params.push(param);
        self
    }

    /// `sp_executesql` with typed parameters.
    #[must_use]
    pub fn execute_sql(sql: &str, params: Vec<RpcParam>) -> Self {
        let mut request = Self::by_id(ProcId::ExecuteSql)
            .param(RpcParam::new("", RpcValue::NVarChar(Some(sql.to_owned()))));
        if !params.is_empty() {
            request = request.param(RpcParam::new(
                "",
                RpcValue::NVarChar(Some(declarations(&params))),
            ));
        }
        request.params.extend(params);
        request
    }

    /// `sp_prepare`; the handle comes back as the first OUTPUT parameter.
    #[must_use]
    pub fn prepare(sql: &str, params: &[RpcParam]) -> Self {
        Self::by_id(ProcId::Prepare)
            .param(RpcParam::new("@handle", RpcValue::Int(None)).output())
            .param(RpcParam::new(
                "@params",
                RpcValue::NVarChar(Some(declarations(params))),
            ))
            .param(RpcParam::new("@stmt", RpcValue::NVarChar(Some(sql.to_owned()))))
            .param(RpcParam::new("@options", RpcValue::Int(Some(1))))
    }

    /// `sp_execute` for a prepared handle.
    #[must_use]
    pub fn execute(handle: i32, params: Vec<RpcParam>) -> Self {
        let mut request =
            Self::by_id(ProcId::Execute).param(RpcParam::new("@handle", RpcValue::Int(Some(handle))));
        request.params.extend(params);
        request
    }

    /// `sp_unprepare` for a prepared handle.
    #[must_use]
    pub fn unprepare(handle: i32) -> Self {
        Self::by_id(ProcId::Unprepare).param(RpcParam::new("@handle", RpcValue::Int(Some(handle))))
    }

    /// Encode the payload.
    pub fn encode(&self, descriptor: u64, version: TdsVersion) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + 64);
        write_all_headers(&mut buf, descriptor, version);
        match &self.procedure {
            ProcedureRef::Name(name) => write_us_varchar(&mut buf, name)?,
            ProcedureRef::Id(id) => {
                buf.put_u16_le(0xFFFF);
                buf.put_u16_le(*id as u16);
            }
        }
        buf.put_u16_le(self.options.bits());
        for param in &self.params {
            param.encode(&mut buf)?;
        }
        Ok(buf.freeze())
    }
}

/// `@a int, @b nvarchar(4000) output` style declaration list.
#[must_use]
pub fn declarations(params: &[RpcParam]) -> String {
    params
        .iter()
        .map(|p| {
            let mut decl = format!("{} {}", p.name, p.value.sql_type());
            if p.flags.contains(ParamFlags::BY_REF) {
                decl.push_str(" output");
            }
            decl
        })
        .collect::<Vec<_>>()
        .join(", ")
}
