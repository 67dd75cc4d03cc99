//! Requests, responses and cancellation.
//!
//! A [`Request`] is handed to the connection driver, which owns it until its
//! response has been consumed. The caller keeps a [`ResponseFuture`] for the
//! outcome and can cancel through a [`CancelHandle`], which only holds a weak
//! reference back to the connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::{
    ColMetaData, Done, DoneStatus, PacketType, ProtocolError, ReturnValue, Row, RpcRequest,
    ServerMessage, TdsVersion, TokenType, TransactionRequest, encode_sql_batch,
};
use tokio::sync::oneshot;

use crate::connection::{Command, Shared};
use crate::error::{Error, Result};
use crate::transaction::{DepthChange, legacy_sql};

/// One result set.
#[derive(Debug, Clone)]
pub struct ResultSet {
    /// Column descriptions.
    pub columns: Arc<ColMetaData>,
    /// Rows in arrival order.
    pub rows: Vec<Row>,
}

/// Everything a request produced.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Result sets in order.
    pub result_sets: Vec<ResultSet>,
    /// Sum of the row counts reported by DONE tokens.
    pub row_count: Option<u64>,
    /// RETURNSTATUS of a procedure call.
    pub return_status: Option<i32>,
    /// Output parameters.
    pub output_params: Vec<ReturnValue>,
    /// INFO messages.
    pub messages: Vec<ServerMessage>,
}

impl Response {
    /// All rows of all result sets.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.result_sets.iter().flat_map(|set| set.rows.iter())
    }

    /// Output parameter by name, with or without the leading `@`.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&ReturnValue> {
        let name = name.trim_start_matches('@');
        self.output_params
            .iter()
            .find(|p| p.name.trim_start_matches('@') == name)
    }

    pub(crate) fn add_row_count(&mut self, count: u64) {
        self.row_count = Some(self.row_count.unwrap_or(0) + count);
    }
}

/// What a request sends.
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Batch(String),
    Rpc(RpcRequest),
    Transaction(TransactionRequest),
    /// COLMETADATA and ROW tokens for an `INSERT BULK` already accepted.
    BulkLoad(Bytes),
}

impl Operation {
    /// Packet type, payload and legacy depth change for this operation.
    pub(crate) fn encode(
        &self,
        descriptor: u64,
        version: TdsVersion,
    ) -> std::result::Result<(PacketType, Bytes, DepthChange), ProtocolError> {
        Ok(match self {
            Self::Batch(sql) => (
                PacketType::SqlBatch,
                encode_sql_batch(sql, descriptor, version),
                DepthChange::None,
            ),
            Self::Rpc(rpc) => (PacketType::Rpc, rpc.encode(descriptor, version)?, DepthChange::None),
            Self::Transaction(request) if version.supports_transaction_descriptors() => (
                PacketType::TransactionManager,
                request.encode(descriptor, version)?,
                DepthChange::None,
            ),
            Self::Transaction(request) => {
                let (sql, change) = legacy_sql(request);
                (PacketType::SqlBatch, encode_sql_batch(&sql, descriptor, version), change)
            }
            Self::BulkLoad(rows) => {
                let mut buf = BytesMut::with_capacity(rows.len() + 13);
                buf.put_slice(rows);
                buf.put_u8(TokenType::Done as u8);
                Done {
                    status: DoneStatus::empty(),
                    cur_cmd: 0,
                    row_count: 0,
                }
                .encode(&mut buf);
                (PacketType::BulkLoad, buf.freeze(), DepthChange::None)
            }
        })
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Self::Batch(_) => "batch",
            Self::Rpc(_) => "rpc",
            Self::Transaction(_) => "transaction",
            Self::BulkLoad(_) => "bulk load",
        }
    }
}

/// A request ready to submit.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) operation: Operation,
    pub(crate) timeout: Option<Duration>,
    pub(crate) reset_connection: bool,
    cancel: Arc<AtomicBool>,
}

impl Request {
    pub(crate) fn new(operation: Operation) -> Self {
        Self {
            operation,
            timeout: None,
            reset_connection: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A SQL batch.
    pub fn batch(sql: impl Into<String>) -> Self {
        Self::new(Operation::Batch(sql.into()))
    }

    /// A remote procedure call.
    #[must_use]
    pub fn rpc(rpc: RpcRequest) -> Self {
        Self::new(Operation::Rpc(rpc))
    }

    /// Override the connection's request timeout; zero disables it.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn reset_connection(mut self) -> Self {
        self.reset_connection = true;
        self
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

/// A request owned by the driver.
pub(crate) struct PendingRequest {
    pub(crate) request: Request,
    pub(crate) response: Response,
    /// First server error; it fails the request once the response ends.
    pub(crate) error: Option<Error>,
    /// Outcome reported if an attention ends the request.
    pub(crate) cancel_error: Option<Error>,
    reply: Option<oneshot::Sender<Result<Response>>>,
}

impl PendingRequest {
    pub(crate) fn new(request: Request, reply: oneshot::Sender<Result<Response>>) -> Self {
        Self {
            request,
            response: Response::default(),
            error: None,
            cancel_error: None,
            reply: Some(reply),
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.request.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_flag(&self) -> &Arc<AtomicBool> {
        &self.request.cancel
    }

    pub(crate) fn record_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Error for a request ended by cancellation or timeout.
    pub(crate) fn take_cancel_error(&mut self) -> Error {
        self.cancel_error.take().unwrap_or(Error::Canceled)
    }

    /// Deliver the accumulated response, or the recorded error.
    pub(crate) fn finish(mut self) {
        let outcome = match self.error.take() {
            Some(err) => Err(err),
            None => Ok(std::mem::take(&mut self.response)),
        };
        self.complete(outcome);
    }

    /// Deliver `outcome` to the caller. Runs at most once.
    pub(crate) fn complete(mut self, outcome: Result<Response>) {
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("operation", &self.request.operation.describe())
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

/// Cancels one submitted request.
///
/// Cheap to clone; canceling after the request finished does nothing.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    connection: Weak<Shared>,
}

impl CancelHandle {
    pub(crate) fn new(flag: Arc<AtomicBool>, connection: Weak<Shared>) -> Self {
        Self { flag, connection }
    }

    /// Ask the server to stop the request.
    ///
    /// A request that has not been written yet is dropped without reaching
    /// the server; one in flight is interrupted with an attention.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        if let Some(shared) = self.connection.upgrade() {
            shared.send(Command::Cancel {
                request: Some(Arc::clone(&self.flag)),
            });
        }
    }

    /// Whether [`CancelHandle::cancel`] was called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Outcome of a submitted request.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response>>,
    cancel: CancelHandle,
}

impl ResponseFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Response>>, cancel: CancelHandle) -> Self {
        Self { rx, cancel }
    }

    /// Handle to cancel this request.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(Error::ConnectionClosed)))
    }
}
