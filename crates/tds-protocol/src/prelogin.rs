//! PRELOGIN handshake message.
//!
//! The first message a client sends. It advertises the client version and
//! encryption preference and learns the server's; the answer decides whether
//! the connection upgrades to TLS before LOGIN7.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Pre-login option tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name.
    Instance = 0x02,
    /// Client thread ID.
    ThreadId = 0x03,
    /// MARS support.
    Mars = 0x04,
    /// Trace ID for distributed tracing.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Nonce for federated authentication.
    Nonce = 0x07,
    /// End of option list.
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Version),
            0x01 => Ok(Self::Encryption),
            0x02 => Ok(Self::Instance),
            0x03 => Ok(Self::ThreadId),
            0x04 => Ok(Self::Mars),
            0x05 => Ok(Self::TraceId),
            0x06 => Ok(Self::FedAuthRequired),
            0x07 => Ok(Self::Nonce),
            0xFF => Ok(Self::Terminator),
            _ => Err(ProtocolError::InvalidPreloginOption(value)),
        }
    }
}

/// Encryption setting exchanged in PRELOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login packet only.
    Off = 0x00,
    /// Encrypt the whole session.
    On = 0x01,
    /// No TLS available.
    NotSupported = 0x02,
    /// Encryption demanded by this side.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::On),
            0x02 => Ok(Self::NotSupported),
            0x03 => Ok(Self::Required),
            other => Err(ProtocolError::InvalidPreloginOption(other)),
        }
    }

    /// Whether the whole session must be encrypted.
    #[must_use]
    pub const fn is_required(self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

/// Product version reported by the server in its PRELOGIN answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerVersion {
    /// Major version (e.g. 16 for SQL Server 2022).
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
    /// Sub-build number.
    pub sub_build: u16,
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.sub_build)
    }
}

/// PRELOGIN payload, used for both the request and the server's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreLogin {
    /// Version field: the client's driver version, or the server's product version.
    pub version: ServerVersion,
    /// Encryption setting.
    pub encryption: EncryptionLevel,
    /// Instance name to validate against.
    pub instance: Option<String>,
    /// Client thread ID.
    pub thread_id: Option<u32>,
    /// MARS enabled.
    pub mars: bool,
    /// Client connection activity ID and sequence.
    pub trace_id: Option<([u8; 16], u32)>,
    /// Federated authentication requested (client) or required (server).
    pub fed_auth_required: bool,
}

impl Default for PreLogin {
    fn default() -> Self {
        Self {
            version: ServerVersion {
                major: 0,
                minor: 0,
                build: 0,
                sub_build: 0,
            },
            encryption: EncryptionLevel::Off,
            instance: None,
            thread_id: None,
            mars: false,
            trace_id: None,
            fed_auth_required: false,
        }
    }
}

impl PreLogin {
    /// Create a request with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the encryption setting.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Ask the server whether federated authentication is required.
    #[must_use]
    pub fn with_fed_auth_required(mut self, required: bool) -> Self {
        self.fed_auth_required = required;
        self
    }

    /// Set the trace activity ID.
    #[must_use]
    pub fn with_trace_id(mut self, activity_id: [u8; 16], sequence: u32) -> Self {
        self.trace_id = Some((activity_id, sequence));
        self
    }

    /// Encode the message payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut options: Vec<(PreLoginOption, Vec<u8>)> = Vec::with_capacity(7);

        let mut version = Vec::with_capacity(6);
        version.extend_from_slice(&[self.version.major, self.version.minor]);
        version.extend_from_slice(&self.version.build.to_be_bytes());
        version.extend_from_slice(&self.version.sub_build.to_le_bytes());
        options.push((PreLoginOption::Version, version));
        options.push((PreLoginOption::Encryption, vec![self.encryption as u8]));

        let mut instance = self.instance.clone().unwrap_or_default().into_bytes();
        instance.push(0);
        options.push((PreLoginOption::Instance, instance));

        options.push((
            PreLoginOption::ThreadId,
            self.thread_id.unwrap_or(0).to_be_bytes().to_vec(),
        ));
        options.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));

        if let Some((activity_id, sequence)) = self.trace_id {
            let mut trace = Vec::with_capacity(36);
            trace.extend_from_slice(&activity_id);
            trace.extend_from_slice(&sequence.to_le_bytes());
            trace.extend_from_slice(&[0u8; 16]);
            options.push((PreLoginOption::TraceId, trace));
        }
        if self.fed_auth_required {
            options.push((PreLoginOption::FedAuthRequired, vec![0x01]));
        }

        let header_len = options.len() * 5 + 1;
        let data_len: usize = options.iter().map(|(_, d)| d.len()).sum();
        let mut buf = BytesMut::with_capacity(header_len + data_len);

        let mut offset = header_len;
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset as u16);
            buf.put_u16(data.len() as u16);
            offset += data.len();
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            buf.put_slice(data);
        }

        buf.freeze()
    }

    /// Decode a PRELOGIN payload.
    ///
    /// Option offsets are absolute from the start of the payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut headers = payload;
        let mut entries = Vec::new();
        loop {
            if !headers.has_remaining() {
                return Err(ProtocolError::UnexpectedEof);
            }
            let token = headers.get_u8();
            if token == PreLoginOption::Terminator as u8 {
                break;
            }
            if headers.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let offset = headers.get_u16() as usize;
            let length = headers.get_u16() as usize;
            entries.push((token, offset, length));
        }

        let mut prelogin = Self::default();
        for (token, offset, length) in entries {
            let data = payload
                .get(offset..offset + length)
                .ok_or(ProtocolError::IncompletePacket {
                    expected: offset + length,
                    actual: payload.len(),
                })?;

            // Unknown option tokens are skipped, newer servers may send more.
            let Ok(option) = PreLoginOption::from_u8(token) else {
                continue;
            };

            match option {
                PreLoginOption::Version if data.len() >= 6 => {
                    prelogin.version = ServerVersion {
                        major: data[0],
                        minor: data[1],
                        build: u16::from_be_bytes([data[2], data[3]]),
                        sub_build: u16::from_le_bytes([data[4], data[5]]),
                    };
                }
                PreLoginOption::Encryption if !data.is_empty() => {
                    prelogin.encryption = EncryptionLevel::from_u8(data[0])?;
                }
                PreLoginOption::Instance => {
                    let name = data.split(|&b| b == 0).next().unwrap_or_default();
                    if !name.is_empty() {
                        prelogin.instance = Some(String::from_utf8_lossy(name).into_owned());
                    }
                }
                PreLoginOption::ThreadId if data.len() >= 4 => {
                    prelogin.thread_id = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                PreLoginOption::Mars if !data.is_empty() => {
                    prelogin.mars = data[0] != 0;
                }
                PreLoginOption::FedAuthRequired if !data.is_empty() => {
                    prelogin.fed_auth_required = data[0] != 0;
                }
                _ => {}
            }
        }

        Ok(prelogin)
    }
}
