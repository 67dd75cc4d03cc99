//! Token handlers.
//!
//! Each response message is run through a [`TokenParser`] and the tokens are
//! folded into either a [`LoginOutcome`] during login or the pending
//! request's [`Response`](crate::Response) afterwards. Session state that
//! the server changes through ENVCHANGE tokens is reported back as
//! [`SessionChanges`] so the driver can apply it to the socket and ledger.

use bytes::Bytes;
use tds_protocol::{
    EnvChange, FedAuthInfo, LoginAck, ProtocolError, TdsVersion, Token, TokenParser,
};

use crate::error::{Error, ServerError};
use crate::request::{PendingRequest, ResultSet};
use crate::transaction::TransactionLedger;

/// Server redirect target, consumed by the next connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoutingData {
    pub(crate) server: String,
    pub(crate) port: u16,
}

/// Everything a login response can carry.
#[derive(Debug, Default)]
pub(crate) struct LoginOutcome {
    pub(crate) login_ack: Option<LoginAck>,
    pub(crate) routing: Option<RoutingData>,
    pub(crate) error: Option<ServerError>,
    pub(crate) sspi: Option<Bytes>,
    pub(crate) fedauth_info: Option<FedAuthInfo>,
    pub(crate) packet_size: Option<u32>,
    pub(crate) database: Option<String>,
}

impl LoginOutcome {
    /// Fold one login response message into the outcome.
    pub(crate) fn absorb(&mut self, payload: Bytes, version: TdsVersion) -> Result<(), ProtocolError> {
        let mut parser = TokenParser::new(payload, version);
        while let Some(token) = parser.next_token()? {
            match token {
                Token::LoginAck(ack) => {
                    parser.set_version(ack.tds_version.min(version));
                    tracing::debug!(
                        tds_version = %ack.tds_version,
                        server = %ack.prog_name,
                        "login acknowledged"
                    );
                    self.login_ack = Some(ack);
                }
                Token::EnvChange(EnvChange::Routing { host, port }) => {
                    self.routing = Some(RoutingData { server: host, port });
                }
                Token::EnvChange(EnvChange::PacketSize(size)) => self.packet_size = Some(size),
                Token::EnvChange(EnvChange::Database(name)) => self.database = Some(name),
                Token::Error(msg) => {
                    if self.error.is_none() {
                        self.error = Some(msg.into());
                    }
                }
                Token::Info(msg) => tracing::debug!(number = msg.number, message = %msg.message, "login info"),
                Token::Sspi(challenge) => self.sspi = Some(challenge),
                Token::FedAuthInfo(info) => self.fedauth_info = Some(info),
                Token::FeatureExtAck(acks) => {
                    tracing::debug!(features = acks.len(), "feature extensions acknowledged");
                }
                Token::Done(_) | Token::EnvChange(_) => {}
                other => tracing::warn!(token = ?other, "unexpected token during login"),
            }
        }
        Ok(())
    }
}

/// Session state changed by a response.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SessionChanges {
    pub(crate) packet_size: Option<u32>,
    pub(crate) database: Option<String>,
    pub(crate) session_reset: bool,
    pub(crate) attention_ack: bool,
}

/// Fold one response message into `pending` (when there is one to fill)
/// and apply transaction changes to `ledger`.
pub(crate) fn absorb_response(
    payload: Bytes,
    version: TdsVersion,
    mut pending: Option<&mut PendingRequest>,
    ledger: &mut TransactionLedger,
) -> Result<SessionChanges, ProtocolError> {
    let mut changes = SessionChanges::default();
    let mut parser = TokenParser::new(payload, version);

    while let Some(token) = parser.next_token()? {
        match token {
            Token::Done(done) | Token::DoneInProc(done) | Token::DoneProc(done) => {
                if done.is_attention_ack() {
                    changes.attention_ack = true;
                }
                if let (Some(count), Some(p)) = (done.count(), pending.as_deref_mut()) {
                    p.response.add_row_count(count);
                }
            }
            Token::EnvChange(change) => apply_env_change(change, ledger, &mut changes),
            Token::Error(msg) => {
                tracing::debug!(number = msg.number, class = msg.class, "server error");
                match pending.as_deref_mut() {
                    Some(p) => p.record_error(Error::Server(msg.into())),
                    None => tracing::warn!(number = msg.number, message = %msg.message, "server error outside a request"),
                }
            }
            Token::Info(msg) => {
                if let Some(p) = pending.as_deref_mut() {
                    p.response.messages.push(msg);
                }
            }
            Token::ColMetaData(columns) => {
                if let Some(p) = pending.as_deref_mut().filter(|_| !columns.columns.is_empty()) {
                    p.response.result_sets.push(ResultSet {
                        columns,
                        rows: Vec::new(),
                    });
                }
            }
            Token::Row(row) => {
                if let Some(set) = pending
                    .as_deref_mut()
                    .and_then(|p| p.response.result_sets.last_mut())
                {
                    set.rows.push(row);
                }
            }
            Token::ReturnStatus(status) => {
                if let Some(p) = pending.as_deref_mut() {
                    p.response.return_status = Some(status);
                }
            }
            Token::ReturnValue(value) => {
                if let Some(p) = pending.as_deref_mut() {
                    p.response.output_params.push(value);
                }
            }
            Token::Order(_) => {}
            other => tracing::warn!(token = ?other, "unexpected token in response"),
        }
    }
    Ok(changes)
}

fn apply_env_change(change: EnvChange, ledger: &mut TransactionLedger, changes: &mut SessionChanges) {
    match change {
        EnvChange::BeginTransaction(descriptor) | EnvChange::EnlistDtcTransaction(descriptor) => {
            tracing::debug!(descriptor, "transaction started");
            ledger.begin(descriptor);
        }
        EnvChange::CommitTransaction
        | EnvChange::RollbackTransaction
        | EnvChange::DefectTransaction
        | EnvChange::TransactionEnded => {
            tracing::debug!(change = ?change, "transaction ended");
            ledger.end();
        }
        EnvChange::PacketSize(size) => changes.packet_size = Some(size),
        EnvChange::Database(name) => changes.database = Some(name),
        EnvChange::ResetConnectionAck => {
            ledger.reset();
            changes.session_reset = true;
        }
        other => tracing::trace!(change = ?other, "environment change ignored"),
    }
}
