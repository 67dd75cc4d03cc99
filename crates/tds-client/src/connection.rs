//! The public connection handle.
//!
//! A [`Connection`] is a cheap, cloneable handle to a driver task spawned on
//! the current Tokio runtime. Handles send [`Command`]s; the driver owns the
//! socket and all protocol state. Dropping the last handle stops the driver.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use parking_lot::Mutex;
use tds_auth::TokenProvider;
use tds_protocol::{IsolationLevel, RpcParam, RpcRequest, TdsVersion, TransactionRequest};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::Config;
use crate::connector::{SocketConnector, TcpConnector};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, Events};
use crate::request::{CancelHandle, Operation, PendingRequest, Request, Response, ResponseFuture};
use crate::state::State;
use crate::transaction::generated_name;

/// Messages from handles to the driver.
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Submit(PendingRequest),
    /// Cancel one request, or whatever is in flight when `None`.
    Cancel {
        request: Option<Arc<AtomicBool>>,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// State shared by every handle of one connection.
#[derive(Debug)]
pub(crate) struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<State>,
    events: Events,
    status: Arc<Mutex<SessionStatus>>,
    config: Arc<Config>,
}

impl Shared {
    pub(crate) fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::trace!("connection driver has stopped");
        }
    }
}

/// Negotiated session values, updated by the driver as responses arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Protocol version in use.
    pub tds_version: TdsVersion,
    /// Packet size in use.
    pub packet_size: u32,
    /// Current database.
    pub database: Option<String>,
    /// Whether a transaction is open.
    pub in_transaction: bool,
    /// Nesting depth of open transactions.
    pub transaction_depth: u32,
}

impl SessionStatus {
    fn initial(config: &Config) -> Self {
        Self {
            tds_version: config.tds_version,
            packet_size: config.packet_size,
            database: config.database.clone(),
            in_transaction: false,
            transaction_depth: 0,
        }
    }
}

/// Handle returned by [`Connection::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    handle: i32,
}

impl PreparedStatement {
    /// Server-side handle.
    #[must_use]
    pub fn handle(&self) -> i32 {
        self.handle
    }
}

/// A connection to SQL Server.
///
/// # Example
///
/// ```rust,ignore
/// use tds_client::{Config, Connection};
///
/// let config = Config::from_connection_string(
///     "Server=localhost;Database=master;User Id=sa;Password=secret;TrustServerCertificate=true",
/// )?;
/// let conn = Connection::new(config)?;
/// conn.connect().await?;
///
/// let response = conn.execute_batch("select 1").await?;
/// println!("{} rows", response.rows().count());
/// conn.close().await;
/// ```
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Validate `config` and start the connection driver.
    ///
    /// Nothing touches the network until [`Connection::connect`]. Must be
    /// called from within a Tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let connector = TcpConnector::new(config.local_address, config.multi_subnet_failover);
        Self::with_connector(config, Arc::new(connector))
    }

    /// Like [`Connection::new`] with a custom socket connector.
    pub fn with_connector(config: Config, connector: Arc<dyn SocketConnector>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidState("a connection must be created inside a Tokio runtime".into())
        })?;

        let tokens = config
            .token_provider
            .clone()
            .unwrap_or_else(default_token_provider);
        let config = Arc::new(config);
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(State::Initialized);
        let events = Events::new(config.debug_events);
        let status = Arc::new(Mutex::new(SessionStatus::initial(&config)));

        let driver = Driver::new(
            Arc::clone(&config),
            connector,
            tokens,
            rx,
            state_tx,
            Arc::clone(&status),
            events.clone(),
        );
        runtime.spawn(driver.run());
        tracing::debug!(server = %config.server, "connection created");

        Ok(Self {
            shared: Arc::new(Shared {
                commands,
                state,
                events,
                status,
                config,
            }),
        })
    }

    /// Connect and log in.
    ///
    /// Only allowed once, from [`State::Initialized`]; later calls fail with
    /// [`Error::InvalidState`] and leave the connection untouched.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.shared.send(Command::Connect { reply });
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Close the connection and wait for the driver to release the socket.
    ///
    /// Idempotent. A pending request fails with [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        self.shared.send(Command::Close { reply: Some(reply) });
        let _ = rx.await;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.shared.state.borrow()
    }

    /// Wait until the connection reaches `target` or `Final`.
    pub async fn wait_for_state(&self, target: State) -> State {
        let mut rx = self.shared.state.clone();
        match rx
            .wait_for(|state| *state == target || *state == State::Final)
            .await
        {
            Ok(state) => *state,
            Err(_) => State::Final,
        }
    }

    /// Subscribe to connection notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Negotiated session values.
    #[must_use]
    pub fn session(&self) -> SessionStatus {
        self.shared.status.lock().clone()
    }

    /// Whether a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.shared.status.lock().in_transaction
    }

    /// Submit a request.
    ///
    /// One request runs at a time; submitting while another is outstanding
    /// fails the new request with [`Error::InvalidState`].
    pub fn submit(&self, request: Request) -> ResponseFuture {
        let (reply, rx) = oneshot::channel();
        let cancel = CancelHandle::new(request.cancel_flag(), Arc::downgrade(&self.shared));
        self.shared
            .send(Command::Submit(PendingRequest::new(request, reply)));
        ResponseFuture::new(rx, cancel)
    }

    /// Run a SQL batch.
    pub async fn execute_batch(&self, sql: impl Into<String>) -> Result<Response> {
        self.submit(Request::batch(sql)).await
    }

    /// Run parameterized SQL through `sp_executesql`.
    pub async fn execute_sql(&self, sql: &str, params: Vec<RpcParam>) -> Result<Response> {
        self.submit(Request::rpc(RpcRequest::execute_sql(sql, params)))
            .await
    }

    /// Call a stored procedure.
    pub async fn execute_procedure(&self, procedure: RpcRequest) -> Result<Response> {
        self.submit(Request::rpc(procedure)).await
    }

    /// Prepare `sql` with `sp_prepare`.
    pub async fn prepare(&self, sql: &str, params: &[RpcParam]) -> Result<PreparedStatement> {
        let response = self
            .submit(Request::rpc(RpcRequest::prepare(sql, params)))
            .await?;
        let handle = response
            .output("handle")
            .and_then(|param| param.value.as_deref())
            .and_then(|raw| <[u8; 4]>::try_from(raw).ok())
            .map(i32::from_le_bytes)
            .ok_or_else(|| Error::InvalidState("sp_prepare returned no handle".into()))?;
        tracing::debug!(handle, "statement prepared");
        Ok(PreparedStatement { handle })
    }

    /// Execute a prepared statement with `sp_execute`.
    pub async fn execute_prepared(
        &self,
        statement: &PreparedStatement,
        params: Vec<RpcParam>,
    ) -> Result<Response> {
        self.submit(Request::rpc(RpcRequest::execute(statement.handle, params)))
            .await
    }

    /// Release a prepared statement with `sp_unprepare`.
    pub async fn unprepare(&self, statement: PreparedStatement) -> Result<()> {
        self.submit(Request::rpc(RpcRequest::unprepare(statement.handle)))
            .await
            .map(drop)
    }

    /// Bulk insert into `table`.
    ///
    /// `columns` is the column list of the `INSERT BULK` statement
    /// (`"id int, name nvarchar(50)"`); `rows` holds the COLMETADATA and ROW
    /// tokens matching it. Returns the number of rows inserted.
    pub async fn bulk_load(&self, table: &str, columns: &str, rows: Bytes) -> Result<u64> {
        self.execute_batch(format!("insert bulk {table} ({columns})"))
            .await?;
        let response = self
            .submit(Request::new(Operation::BulkLoad(rows)))
            .await?;
        Ok(response.row_count.unwrap_or(0))
    }

    /// Begin a transaction. [`IsolationLevel::NoChange`] keeps the session's level.
    pub async fn begin_transaction(&self, name: Option<&str>, isolation: IsolationLevel) -> Result<()> {
        self.transaction_request(TransactionRequest::Begin {
            isolation,
            name: name.unwrap_or_default().to_owned(),
        })
        .await
    }

    /// Commit the current transaction.
    pub async fn commit_transaction(&self, name: Option<&str>) -> Result<()> {
        self.transaction_request(TransactionRequest::Commit {
            name: name.unwrap_or_default().to_owned(),
        })
        .await
    }

    /// Roll back the current transaction, or to the savepoint `name`.
    pub async fn rollback_transaction(&self, name: Option<&str>) -> Result<()> {
        self.transaction_request(TransactionRequest::Rollback {
            name: name.unwrap_or_default().to_owned(),
        })
        .await
    }

    /// Create a savepoint.
    pub async fn save_transaction(&self, name: &str) -> Result<()> {
        self.transaction_request(TransactionRequest::Save {
            name: name.to_owned(),
        })
        .await
    }

    async fn transaction_request(&self, request: TransactionRequest) -> Result<()> {
        self.submit(Request::new(Operation::Transaction(request)))
            .await
            .map(drop)
    }

    /// Run `work` inside a transaction.
    ///
    /// Outside a transaction this begins one, commits it when `work`
    /// succeeds and rolls it back when it fails. Inside a transaction it
    /// takes a savepoint instead and only rolls back to it on failure, so
    /// nested calls compose and the outermost scope decides.
    pub async fn transaction<T, F, Fut>(&self, isolation: IsolationLevel, work: F) -> Result<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = generated_name();
        let savepoint = self.in_transaction();
        if savepoint {
            self.save_transaction(&name).await?;
        } else {
            self.begin_transaction(Some(&name), isolation).await?;
        }

        match work(self.clone()).await {
            Ok(value) => {
                if !savepoint {
                    self.commit_transaction(Some(&name)).await?;
                }
                Ok(value)
            }
            Err(error) => {
                if self.in_transaction() && self.state() == State::LoggedIn {
                    if let Err(rollback) = self.rollback_transaction(Some(&name)).await {
                        tracing::debug!(error = %rollback, "rollback after failed transaction body failed");
                    }
                }
                Err(error)
            }
        }
    }

    /// Cancel whatever request is in flight.
    pub fn cancel(&self) {
        self.shared.send(Command::Cancel { request: None });
    }

    /// Reset the session on the server.
    ///
    /// The session options are sent again with the reset flag set on the
    /// first packet; [`ConnectionEvent::SessionReset`] follows the
    /// server's acknowledgement.
    pub async fn reset(&self) -> Result<()> {
        let request = Request::batch(self.shared.config.initial_sql()).reset_connection();
        self.submit(request).await.map(drop)
    }
}

#[cfg(feature = "azure-identity")]
fn default_token_provider() -> Arc<dyn TokenProvider> {
    Arc::new(tds_auth::AzureIdentityProvider::new())
}

#[cfg(not(feature = "azure-identity"))]
fn default_token_provider() -> Arc<dyn TokenProvider> {
    Arc::new(tds_auth::NoTokenProvider)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_outside_runtime() {
        let err = Connection::new(Config::new("localhost")).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_new_validates_first() {
        let config = Config::new("localhost").with_port(1433).with_instance_name("X");
        let err = Connection::new(config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_requests_before_connect_are_rejected() {
        let conn = Connection::new(Config::new("localhost")).unwrap();
        assert_eq!(conn.state(), State::Initialized);
        let err = conn.execute_batch("select 1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(ref m) if m.contains("Initialized")));
        assert_eq!(conn.state(), State::Initialized);
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let conn = Connection::new(Config::new("localhost")).unwrap();
        let mut events = conn.subscribe();
        conn.close().await;
        assert_eq!(conn.wait_for_state(State::Final).await, State::Final);
        conn.close().await;

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        // Never logged in, so nothing to report.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_defaults() {
        let conn = Connection::new(Config::new("localhost").with_packet_size(8192)).unwrap();
        let status = conn.session();
        assert_eq!(status.packet_size, 8192);
        assert_eq!(status.tds_version, TdsVersion::V7_4);
        assert!(!conn.in_transaction());
    }
}
