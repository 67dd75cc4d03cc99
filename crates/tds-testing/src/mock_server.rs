//! Mock TDS server for client tests.
//!
//! The server speaks just enough TDS to drive a client through every state of
//! its connection state machine over loopback TCP: PRELOGIN, LOGIN7 with
//! standard, NTLM or federated authentication, routing, transient login
//! failures, SQL batches, RPC, transaction manager requests, bulk load,
//! attention and IGNORE handling. Encryption is never negotiated; the server
//! can only claim to require it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::{MockResponse, MockTdsServer};
//!
//! #[tokio::test]
//! async fn test_query() {
//!     let server = MockTdsServer::builder()
//!         .with_response("select 1", MockResponse::ints("n", [1]))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Connect a client to server.host() / server.port() with encrypt = false.
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tds_codec::{CodecError, Connection, Message};
use tds_protocol::codec::{read_b_varchar, read_u8, read_u16_le, read_u32_le, read_us_varchar};
use tds_protocol::{
    DoneStatus, EncryptionLevel, EnvChange, PacketStatus, PacketType, PreLogin, ProcId,
    ProtocolError, TdsVersion, TokenType,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::tokens;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed client message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client sent something out of order.
    #[error("unexpected message: {0}")]
    Unexpected(String),
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// Transient error number used by [`LoginBehavior::TransientFailures`].
pub const TRANSIENT_LOGIN_ERROR: i32 = 40613;

/// How the server answers LOGIN7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginBehavior {
    /// Acknowledge the login.
    Accept,
    /// Acknowledge and redirect the client.
    Route {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
    /// Reject every login with a non-transient error.
    Fail {
        /// Error number.
        number: i32,
    },
    /// Reject the first `n` logins (across connections) with a transient
    /// error, then accept.
    TransientFailures(usize),
    /// Answer with an NTLM challenge and accept the NTLM response.
    Ntlm,
    /// Answer with FEDAUTHINFO and accept the FEDAUTH token.
    FedAuth {
        /// Security token service URL.
        sts_url: String,
        /// Service principal name.
        spn: String,
    },
}

/// Mock response to a request.
#[derive(Clone)]
pub enum MockResponse {
    /// A bare DONE.
    Empty,
    /// DONE with a row count.
    Affected(u64),
    /// A request-level server error.
    Error {
        /// Error number.
        number: i32,
        /// Message text.
        message: String,
    },
    /// One result set of INT columns.
    Ints {
        /// Column names.
        columns: Vec<String>,
        /// Row values.
        rows: Vec<Vec<i32>>,
    },
    /// Pre-encoded tokens.
    Raw(Bytes),
    /// Answer after a delay; an attention during the delay drops the answer.
    Delayed(Duration, Box<MockResponse>),
    /// Close the socket instead of answering.
    Disconnect,
    /// Compute the response from the SQL text.
    Custom(Arc<dyn Fn(&str) -> MockResponse + Send + Sync>),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Affected(n) => f.debug_tuple("Affected").field(n).finish(),
            Self::Error { number, message } => f
                .debug_struct("Error")
                .field("number", number)
                .field("message", message)
                .finish(),
            Self::Ints { columns, rows } => f
                .debug_struct("Ints")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
            Self::Delayed(delay, inner) => f.debug_tuple("Delayed").field(delay).field(inner).finish(),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// A single INT column.
    pub fn ints(column: impl Into<String>, values: impl IntoIterator<Item = i32>) -> Self {
        Self::Ints {
            columns: vec![column.into()],
            rows: values.into_iter().map(|v| vec![v]).collect(),
        }
    }

    /// A request-level error.
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
        }
    }

    /// This response, after `delay`.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }

    fn resolve(self, sql: &str) -> Self {
        match self {
            Self::Custom(f) => f(sql),
            other => other,
        }
    }
}

/// What the server has seen, shared across connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observed {
    /// Accepted TCP connections.
    pub connections: usize,
    /// LOGIN7 messages.
    pub logins: usize,
    /// Whether any PRELOGIN asked for federated authentication.
    pub fed_auth_requested: bool,
    /// NTLM AUTHENTICATE messages.
    pub ntlm_responses: usize,
    /// Tokens received in FEDAUTH_TOKEN messages.
    pub fedauth_tokens: Vec<String>,
    /// SQL batches, in order.
    pub batches: Vec<String>,
    /// RPC procedure ids, in order (0 for calls by name).
    pub rpcs: Vec<u16>,
    /// Transaction manager requests, as `"begin name"`, `"commit name"`...
    pub transactions: Vec<String>,
    /// Attention messages.
    pub attentions: usize,
    /// Messages the client closed with IGNORE.
    pub ignored: usize,
    /// Messages carrying RESET_CONNECTION.
    pub resets: usize,
    /// BULK_LOAD messages.
    pub bulk_loads: usize,
}

/// Configuration for the mock TDS server.
#[derive(Debug)]
pub struct MockServerConfig {
    responses: HashMap<String, MockResponse>,
    default_response: MockResponse,
    bulk_response: MockResponse,
    login: LoginBehavior,
    encryption: EncryptionLevel,
    server_name: String,
    tds_version: TdsVersion,
    database: String,
    packet_size: Option<u32>,
    attention_ack: bool,
    read_limit: Option<usize>,
}

/// Builder for [`MockTdsServer`].
#[derive(Debug)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: MockServerConfig {
                responses: HashMap::new(),
                default_response: MockResponse::Empty,
                bulk_response: MockResponse::Affected(0),
                login: LoginBehavior::Accept,
                encryption: EncryptionLevel::NotSupported,
                server_name: "MockSQLServer".to_string(),
                tds_version: TdsVersion::V7_4,
                database: "master".to_string(),
                packet_size: None,
                attention_ack: true,
                read_limit: None,
            },
        }
    }

    /// Answer the SQL batch `sql` with `response`.
    #[must_use]
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.config.responses.insert(sql.into(), response);
        self
    }

    /// Answer unmatched batches and RPCs with `response`.
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Answer BULK_LOAD messages with `response`.
    #[must_use]
    pub fn with_bulk_load_response(mut self, response: MockResponse) -> Self {
        self.config.bulk_response = response;
        self
    }

    /// How LOGIN7 is answered.
    #[must_use]
    pub fn with_login(mut self, login: LoginBehavior) -> Self {
        self.config.login = login;
        self
    }

    /// Encryption level reported in the PRELOGIN response.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.config.encryption = level;
        self
    }

    /// TDS version acknowledged at login and used for every response.
    #[must_use]
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.config.tds_version = version;
        self
    }

    /// Server name reported in LOGINACK.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Database reported at login.
    #[must_use]
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Packet size announced at login.
    #[must_use]
    pub fn with_packet_size(mut self, size: u32) -> Self {
        self.config.packet_size = Some(size);
        self
    }

    /// Whether attentions are acknowledged.
    #[must_use]
    pub fn with_attention_ack(mut self, ack: bool) -> Self {
        self.config.attention_ack = ack;
        self
    }

    /// Stop reading after serving `requests` messages past login, so the
    /// client's next large write backs up. The initial SQL batch counts.
    #[must_use]
    pub fn with_read_limit(mut self, requests: usize) -> Self {
        self.config.read_limit = Some(requests);
        self
    }

    /// Build and start the mock server.
    pub async fn build(self) -> Result<MockTdsServer> {
        MockTdsServer::start(self.config).await
    }
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A mock TDS server on a loopback port.
///
/// Each accepted connection is served by its own task. The server stops
/// accepting when dropped; open connections finish on their own.
pub struct MockTdsServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    observed: Arc<Mutex<Observed>>,
}

impl fmt::Debug for MockTdsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTdsServer").field("addr", &self.addr).finish()
    }
}

impl MockTdsServer {
    /// Create a builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = Arc::new(config);
        let observed = Arc::new(Mutex::new(Observed::default()));

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            observed: Arc::clone(&observed),
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "mock server accepted a connection");
                            observed.lock().connections += 1;
                            let session = Session {
                                config: Arc::clone(&config),
                                observed: Arc::clone(&observed),
                                transaction: TransactionState::default(),
                            };
                            tokio::spawn(async move {
                                if let Err(e) = session.run(stream).await {
                                    tracing::debug!(error = %e, "mock connection ended with an error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "mock server accept failed");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(server)
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host string for client configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Snapshot of what the server has seen.
    pub fn observed(&self) -> Observed {
        self.observed.lock().clone()
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Server side of the transaction descriptor protocol.
#[derive(Debug, Default)]
struct TransactionState {
    next_descriptor: u64,
    active: bool,
    savepoints: Vec<String>,
}

/// One client connection.
struct Session {
    config: Arc<MockServerConfig>,
    observed: Arc<Mutex<Observed>>,
    transaction: TransactionState,
}

type Conn = Connection<TcpStream>;

impl Session {
    fn version(&self) -> TdsVersion {
        self.config.tds_version
    }

    async fn run(mut self, stream: TcpStream) -> Result<()> {
        let mut conn = Connection::new(stream);

        let Some(prelogin) = conn.read_message().await? else {
            return Ok(());
        };
        expect(&prelogin, PacketType::PreLogin)?;
        let request = PreLogin::decode(&prelogin.payload)?;
        if request.fed_auth_required {
            self.observed.lock().fed_auth_requested = true;
        }
        let reply = PreLogin::new()
            .with_encryption(self.config.encryption)
            .with_fed_auth_required(request.fed_auth_required);
        conn.send_message(PacketType::TabularResult, reply.encode()).await?;

        let Some(login) = conn.read_message().await? else {
            return Ok(());
        };
        expect(&login, PacketType::Login7)?;
        let attempt = {
            let mut observed = self.observed.lock();
            observed.logins += 1;
            observed.logins
        };

        if !self.login(&mut conn, attempt).await? {
            // The client is expected to hang up.
            while conn.read_message().await?.is_some() {}
            return Ok(());
        }

        let mut served = 0;
        while let Some(message) = conn.read_message().await? {
            if !self.serve(&mut conn, message).await? {
                break;
            }
            served += 1;
            if self.config.read_limit.is_some_and(|limit| served >= limit) {
                tracing::debug!(served, "mock server stops reading");
                // The socket stays open until the runtime drops this task.
                std::future::pending::<()>().await;
            }
        }
        Ok(())
    }

    /// Returns whether the session continues to the request loop.
    async fn login(&mut self, conn: &mut Conn, attempt: usize) -> Result<bool> {
        let version = self.version();
        let mut out = BytesMut::new();
        match self.config.login.clone() {
            LoginBehavior::Accept => {}
            LoginBehavior::Route { host, port } => {
                tokens::login_ack(&mut out, version, &self.config.server_name)?;
                tokens::env_change(&mut out, &EnvChange::Routing { host, port })?;
                tokens::done(&mut out, TokenType::Done, DoneStatus::empty(), 0, version);
                conn.send_message(PacketType::TabularResult, out.freeze()).await?;
                return Ok(false);
            }
            LoginBehavior::Fail { number } => {
                self.reject_login(conn, number).await?;
                return Ok(false);
            }
            LoginBehavior::TransientFailures(failures) => {
                if attempt <= failures {
                    self.reject_login(conn, TRANSIENT_LOGIN_ERROR).await?;
                    return Ok(false);
                }
            }
            LoginBehavior::Ntlm => {
                tokens::ntlm_challenge(&mut out, *b"mockchal");
                conn.send_message(PacketType::TabularResult, out.split().freeze())
                    .await?;
                let Some(response) = conn.read_message().await? else {
                    return Ok(false);
                };
                expect(&response, PacketType::Ntlm)?;
                self.observed.lock().ntlm_responses += 1;
            }
            LoginBehavior::FedAuth { sts_url, spn } => {
                tokens::fedauth_info(&mut out, &sts_url, &spn);
                conn.send_message(PacketType::TabularResult, out.split().freeze())
                    .await?;
                let Some(token) = conn.read_message().await? else {
                    return Ok(false);
                };
                expect(&token, PacketType::FedAuthToken)?;
                let token = decode_fedauth_token(token.payload)?;
                self.observed.lock().fedauth_tokens.push(token);
            }
        }

        tokens::login_ack(&mut out, version, &self.config.server_name)?;
        tokens::env_change(&mut out, &EnvChange::Database(self.config.database.clone()))?;
        if let Some(size) = self.config.packet_size {
            tokens::env_change(&mut out, &EnvChange::PacketSize(size))?;
        }
        tokens::done(&mut out, TokenType::Done, DoneStatus::empty(), 0, version);
        conn.send_message(PacketType::TabularResult, out.freeze()).await?;
        Ok(true)
    }

    async fn reject_login(&self, conn: &mut Conn, number: i32) -> Result<()> {
        let mut out = BytesMut::new();
        tokens::error(&mut out, number, 14, "Login failed.")?;
        tokens::done(&mut out, TokenType::Done, DoneStatus::ERROR, 0, self.version());
        conn.send_message(PacketType::TabularResult, out.freeze()).await?;
        Ok(())
    }

    /// Answer one client message; returns whether to keep serving.
    async fn serve(&mut self, conn: &mut Conn, message: Message) -> Result<bool> {
        let version = self.version();

        if message.status.contains(PacketStatus::IGNORE) {
            self.observed.lock().ignored += 1;
            let mut out = BytesMut::new();
            tokens::done(&mut out, TokenType::Done, DoneStatus::empty(), 0, version);
            conn.send_message(PacketType::TabularResult, out.freeze()).await?;
            return Ok(true);
        }

        let mut prefix = BytesMut::new();
        if message.status.contains(PacketStatus::RESET_CONNECTION) {
            self.observed.lock().resets += 1;
            self.transaction = TransactionState {
                next_descriptor: self.transaction.next_descriptor,
                ..TransactionState::default()
            };
            tokens::env_change(&mut prefix, &EnvChange::ResetConnectionAck)?;
        }

        let response = match message.packet_type {
            PacketType::SqlBatch => {
                let sql = decode_sql_batch(message.payload, version)?;
                tracing::debug!(sql = %sql, "mock server received a batch");
                self.observed.lock().batches.push(sql.clone());
                self.config
                    .responses
                    .get(&sql)
                    .cloned()
                    .unwrap_or_else(|| self.config.default_response.clone())
                    .resolve(&sql)
            }
            PacketType::Rpc => {
                let proc_id = decode_rpc_proc_id(message.payload, version)?;
                self.observed.lock().rpcs.push(proc_id);
                if proc_id == ProcId::Prepare as u16 {
                    let mut out = BytesMut::new();
                    tokens::int_return_value(&mut out, "@handle", 1, version)?;
                    tokens::done(&mut out, TokenType::DoneProc, DoneStatus::empty(), 0, version);
                    MockResponse::Raw(out.freeze())
                } else {
                    self.config.default_response.clone().resolve("")
                }
            }
            PacketType::TransactionManager => {
                MockResponse::Raw(self.transaction_request(message.payload)?)
            }
            PacketType::BulkLoad => {
                self.observed.lock().bulk_loads += 1;
                self.config.bulk_response.clone()
            }
            PacketType::Attention => {
                self.observed.lock().attentions += 1;
                if self.config.attention_ack {
                    send_attention_ack(conn, version).await?;
                }
                return Ok(true);
            }
            other => {
                return Err(MockServerError::Unexpected(format!("{other} after login")));
            }
        };

        self.respond(conn, prefix, response).await
    }

    async fn respond(&self, conn: &mut Conn, mut out: BytesMut, response: MockResponse) -> Result<bool> {
        let version = self.version();
        let response = match response {
            MockResponse::Delayed(delay, inner) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => *inner,
                    message = conn.read_message() => {
                        let Some(message) = message? else {
                            return Ok(false);
                        };
                        expect(&message, PacketType::Attention)?;
                        self.observed.lock().attentions += 1;
                        if self.config.attention_ack {
                            send_attention_ack(conn, version).await?;
                        }
                        return Ok(true);
                    }
                }
            }
            other => other,
        };

        match response {
            MockResponse::Empty => {
                tokens::done(&mut out, TokenType::Done, DoneStatus::empty(), 0, version);
            }
            MockResponse::Affected(rows) => tokens::done_count(&mut out, rows, version),
            MockResponse::Error { number, message } => {
                tokens::error(&mut out, number, 16, &message)?;
                tokens::done(&mut out, TokenType::Done, DoneStatus::ERROR, 0, version);
            }
            MockResponse::Ints { columns, rows } => tokens::int_rows(&mut out, &columns, &rows, version)?,
            MockResponse::Raw(raw) => out.extend_from_slice(&raw),
            MockResponse::Disconnect => {
                conn.shutdown().await?;
                return Ok(false);
            }
            MockResponse::Delayed(..) | MockResponse::Custom(_) => {
                return Err(MockServerError::Unexpected("nested mock response".into()));
            }
        }
        conn.send_message(PacketType::TabularResult, out.freeze()).await?;
        Ok(true)
    }

    fn transaction_request(&mut self, payload: Bytes) -> Result<Bytes> {
        let version = self.version();
        let mut src = skip_all_headers(payload, version)?;
        let request_type = read_u16_le(&mut src)?;
        let mut out = BytesMut::new();
        let record = match request_type {
            5 => {
                let _isolation = read_u8(&mut src)?;
                let name = read_b_varchar(&mut src)?;
                self.transaction.next_descriptor += 1;
                let descriptor = 0x0100 + self.transaction.next_descriptor;
                self.transaction.active = true;
                tokens::env_change(&mut out, &EnvChange::BeginTransaction(descriptor))?;
                format!("begin {name}")
            }
            7 => {
                let name = read_b_varchar(&mut src)?;
                self.end_transaction(&mut out, EnvChange::CommitTransaction)?;
                format!("commit {name}")
            }
            8 => {
                let name = read_b_varchar(&mut src)?;
                match self.transaction.savepoints.iter().position(|s| *s == name) {
                    Some(index) => self.transaction.savepoints.truncate(index + 1),
                    None => self.end_transaction(&mut out, EnvChange::RollbackTransaction)?,
                }
                format!("rollback {name}")
            }
            9 => {
                let name = read_b_varchar(&mut src)?;
                self.transaction.savepoints.push(name.clone());
                format!("save {name}")
            }
            other => {
                return Err(MockServerError::Unexpected(format!(
                    "transaction request type {other}"
                )));
            }
        };
        tracing::debug!(request = %record, "mock server transaction request");
        self.observed.lock().transactions.push(record);
        tokens::done(&mut out, TokenType::Done, DoneStatus::empty(), 0, version);
        Ok(out.freeze())
    }

    fn end_transaction(&mut self, out: &mut BytesMut, change: EnvChange) -> Result<()> {
        if self.transaction.active {
            self.transaction.active = false;
            self.transaction.savepoints.clear();
            tokens::env_change(out, &change)?;
        }
        Ok(())
    }
}

fn expect(message: &Message, packet_type: PacketType) -> Result<()> {
    if message.packet_type == packet_type {
        Ok(())
    } else {
        Err(MockServerError::Unexpected(format!(
            "expected {packet_type}, got {}",
            message.packet_type
        )))
    }
}

async fn send_attention_ack(conn: &mut Conn, version: TdsVersion) -> Result<()> {
    let mut out = BytesMut::new();
    tokens::done(&mut out, TokenType::Done, DoneStatus::ATTN, 0, version);
    conn.send_message(PacketType::TabularResult, out.freeze()).await?;
    Ok(())
}

fn skip_all_headers(mut payload: Bytes, version: TdsVersion) -> Result<Bytes> {
    if version.supports_transaction_descriptors() {
        let total = read_u32_le(&mut payload.clone())? as usize;
        if payload.remaining() < total {
            return Err(ProtocolError::UnexpectedEof.into());
        }
        payload.advance(total);
    }
    Ok(payload)
}

fn decode_sql_batch(payload: Bytes, version: TdsVersion) -> Result<String> {
    let text = skip_all_headers(payload, version)?;
    let units: Vec<u16> = text
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

fn decode_rpc_proc_id(payload: Bytes, version: TdsVersion) -> Result<u16> {
    let mut src = skip_all_headers(payload, version)?;
    let marker = read_u16_le(&mut src.clone())?;
    if marker == 0xFFFF {
        src.advance(2);
        Ok(read_u16_le(&mut src)?)
    } else {
        let name = read_us_varchar(&mut src)?;
        tracing::debug!(procedure = %name, "mock server received a named RPC");
        Ok(0)
    }
}

fn decode_fedauth_token(mut payload: Bytes) -> Result<String> {
    let _data_len = read_u32_le(&mut payload)?;
    let token_len = read_u32_le(&mut payload)? as usize;
    if payload.remaining() < token_len {
        return Err(ProtocolError::UnexpectedEof.into());
    }
    let units: Vec<u16> = payload[..token_len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{Token, TokenParser, encode_sql_batch};

    async fn client(server: &MockTdsServer) -> Connection<TcpStream> {
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        Connection::new(stream)
    }

    async fn handshake(conn: &mut Connection<TcpStream>) -> Bytes {
        let prelogin = PreLogin::new().with_encryption(EncryptionLevel::NotSupported);
        conn.send_message(PacketType::PreLogin, prelogin.encode())
            .await
            .unwrap();
        let reply = conn.read_message().await.unwrap().unwrap();
        let reply = PreLogin::decode(&reply.payload).unwrap();
        assert_eq!(reply.encryption, EncryptionLevel::NotSupported);

        let login = tds_protocol::Login7::new().with_sql_auth("sa", "pw");
        conn.send_message(PacketType::Login7, login.encode().unwrap())
            .await
            .unwrap();
        conn.read_message().await.unwrap().unwrap().payload
    }

    fn tokens_of(payload: Bytes) -> Vec<Token> {
        let mut parser = TokenParser::new(payload, TdsVersion::V7_4);
        let mut out = Vec::new();
        while let Some(token) = parser.next_token().unwrap() {
            out.push(token);
        }
        out
    }

    #[tokio::test]
    async fn test_login_and_batch() {
        let server = MockTdsServer::builder()
            .with_response("select 1", MockResponse::ints("n", [1]))
            .build()
            .await
            .unwrap();
        let mut conn = client(&server).await;

        let login = tokens_of(handshake(&mut conn).await);
        assert!(matches!(login[0], Token::LoginAck(_)));

        conn.send_message(PacketType::SqlBatch, encode_sql_batch("select 1", 0, TdsVersion::V7_4))
            .await
            .unwrap();
        let reply = tokens_of(conn.read_message().await.unwrap().unwrap().payload);
        assert!(matches!(reply[0], Token::ColMetaData(_)));
        assert!(matches!(reply[1], Token::Row(_)));

        let observed = server.observed();
        assert_eq!(observed.logins, 1);
        assert_eq!(observed.batches, vec!["select 1".to_string()]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_counted_across_connections() {
        let server = MockTdsServer::builder()
            .with_login(LoginBehavior::TransientFailures(1))
            .build()
            .await
            .unwrap();

        let mut first = client(&server).await;
        let reply = tokens_of(handshake(&mut first).await);
        assert!(matches!(&reply[0], Token::Error(e) if e.number == TRANSIENT_LOGIN_ERROR));
        drop(first);

        let mut second = client(&server).await;
        let reply = tokens_of(handshake(&mut second).await);
        assert!(matches!(reply[0], Token::LoginAck(_)));
        assert_eq!(server.observed().logins, 2);
    }

    #[tokio::test]
    async fn test_attention_during_delay_drops_the_response() {
        let server = MockTdsServer::builder()
            .with_default_response(MockResponse::Affected(1).delayed(Duration::from_secs(30)))
            .build()
            .await
            .unwrap();
        let mut conn = client(&server).await;
        handshake(&mut conn).await;

        conn.send_message(PacketType::SqlBatch, encode_sql_batch("waitfor", 0, TdsVersion::V7_4))
            .await
            .unwrap();
        conn.send_attention().await.unwrap();
        let reply = tokens_of(conn.read_message().await.unwrap().unwrap().payload);
        assert!(matches!(&reply[0], Token::Done(d) if d.is_attention_ack()));
        assert_eq!(server.observed().attentions, 1);
    }

    #[test]
    fn test_decode_fedauth_token() {
        let mut payload = BytesMut::new();
        let token = tokens::utf16("abc");
        payload.extend_from_slice(&(token.len() as u32 + 4).to_le_bytes());
        payload.extend_from_slice(&(token.len() as u32).to_le_bytes());
        payload.extend_from_slice(&token);
        assert_eq!(decode_fedauth_token(payload.freeze()).unwrap(), "abc");
    }
}
