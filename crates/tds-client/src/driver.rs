//! The task that owns one connection.
//!
//! The driver holds the socket, the timers, the transaction ledger and the
//! pending request slot; nothing else touches them. Callers talk to it
//! through [`Command`]s. The main loop applies an event to the
//! [`StateMachine`], runs the entry work of the state it lands in, and feeds
//! the outcome of that work back as the next event until `Final`.
//!
//! Every await inside a state is raced against the commands channel and,
//! where one applies, the state's timer. `read_message` is cancel safe, so
//! losing such a race never drops buffered bytes.

use std::fmt;
use std::future::{Future, pending};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tds_auth::{Authentication, NtlmCredentials, TokenProvider, TokenRequest, fedauth, ntlm};
use tds_codec::{CodecError, Message, SendOutcome};
use tds_protocol::{
    EncryptionLevel, FeatureExtension, FeatureId, FedAuthInfo, Login7, PacketStatus, PacketType,
    PreLogin, TdsVersion, encode_sql_batch,
};
use tds_tls::{TlsConfig, TlsConnector};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::Config;
use crate::connection::{Command, SessionStatus};
use crate::connector::SocketConnector;
use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, Events};
use crate::handler::{LoginOutcome, RoutingData, SessionChanges, absorb_response};
use crate::instance;
use crate::request::PendingRequest;
use crate::state::{Event, ExitAction, State, StateMachine, TransitionError};
use crate::timers::Timers;
use crate::transaction::{DepthChange, TransactionLedger};
use crate::transport::Transport;

type Framed = tds_codec::Connection<Transport>;

/// Why a guarded await stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// The state's timer fired.
    Deadline,
    /// The caller closed the connection.
    Closed,
}

/// Timer a guarded await is bounded by.
#[derive(Debug, Clone, Copy)]
enum Deadline {
    Connect,
    Cancel,
    Request,
    Retry,
}

/// Command intake plus the timers, split from the socket so both can be
/// borrowed inside one `select!`.
struct Control {
    commands: mpsc::UnboundedReceiver<Command>,
    timers: Timers,
    close_waiters: Vec<oneshot::Sender<()>>,
}

/// Wait for `which` to fire; never resolves without a deadline.
async fn deadline_of(timers: &mut Timers, which: Option<Deadline>) {
    match which {
        Some(Deadline::Connect) => timers.connect.fired().await,
        Some(Deadline::Cancel) => timers.cancel.fired().await,
        Some(Deadline::Request) => timers.request.fired().await,
        Some(Deadline::Retry) => timers.retry.fired().await,
        None => pending::<()>().await,
    }
}

/// Run `fut` to completion unless the deadline fires or the connection is
/// closed. Other commands are answered while waiting; a cancel for `cancel`
/// only raises the flag.
async fn guarded<F: Future>(
    ctl: &mut Control,
    state: State,
    deadline: Option<Deadline>,
    cancel: Option<&Arc<AtomicBool>>,
    fut: F,
) -> std::result::Result<F::Output, Interrupt> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return Ok(out),
            () = deadline_of(&mut ctl.timers, deadline) => return Err(Interrupt::Deadline),
            cmd = ctl.commands.recv() => match cmd {
                None => return Err(Interrupt::Closed),
                Some(Command::Close { reply }) => {
                    ctl.close_waiters.extend(reply);
                    return Err(Interrupt::Closed);
                }
                Some(Command::Cancel { request }) => {
                    if let Some(flag) = cancel.filter(|f| targets(request.as_ref(), f)) {
                        flag.store(true, Ordering::Release);
                    }
                }
                Some(other) => reject(other, state),
            },
        }
    }
}

/// Whether a cancel command is meant for the request owning `flag`.
fn targets(request: Option<&Arc<AtomicBool>>, flag: &Arc<AtomicBool>) -> bool {
    request.is_none_or(|r| Arc::ptr_eq(r, flag))
}

/// Answer a command the current state does not accept.
fn reject(command: Command, state: State) {
    match command {
        Command::Submit(pending) => {
            tracing::debug!(state = %state, "request rejected");
            pending.complete(Err(Error::InvalidState(format!(
                "Requests can only be made in the {} state, not the {} state",
                State::LoggedIn.name(),
                state.name()
            ))));
        }
        Command::Connect { reply } => {
            let _ = reply.send(Err(Error::InvalidState(
                TransitionError::ConnectNotAllowed(state).to_string(),
            )));
        }
        Command::Close { reply } => {
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        }
        Command::Cancel { .. } => {}
    }
}

/// Where the current attempt connects to.
#[derive(Debug, Clone, Default)]
struct Target {
    host: String,
    port: Option<u16>,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

/// Everything besides the socket and the command intake.
struct Session {
    events: Events,
    state_tx: watch::Sender<State>,
    status: Arc<Mutex<SessionStatus>>,
    ledger: TransactionLedger,
    version: TdsVersion,
    packet_size: u32,
    database: Option<String>,
    target: Target,
    routing: Option<RoutingData>,
    fedauth_echo: bool,
    pending: Option<PendingRequest>,
    /// Finished request, delivered once the state machine has moved on.
    completed: Option<PendingRequest>,
    legacy_change: DepthChange,
    connect_reply: Option<oneshot::Sender<Result<()>>>,
    error: Option<Error>,
    logged_in: bool,
    closed: bool,
}

impl Session {
    fn record(&mut self, error: Error) {
        tracing::debug!(error = %error, "connection error recorded");
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn running_failure(&mut self, error: Error) {
        if self.logged_in {
            self.events
                .emit(ConnectionEvent::RunningError(Arc::new(error.replicate())));
        }
        self.record(error);
    }

    fn publish_status(&self) {
        let mut status = self.status.lock();
        status.tds_version = self.version;
        status.packet_size = self.packet_size;
        status.database.clone_from(&self.database);
        status.in_transaction = self.ledger.in_transaction();
        status.transaction_depth = self.ledger.depth();
    }

    /// Move the pending request to the delivery slot, failing it with
    /// `error` when given.
    fn complete_pending(&mut self, error: Option<Error>) {
        if let Some(mut pending) = self.pending.take() {
            if let Some(error) = error {
                pending.error = Some(error);
            } else if pending.error.is_none() {
                self.ledger
                    .apply_legacy(std::mem::replace(&mut self.legacy_change, DepthChange::None));
            }
            self.completed = Some(pending);
        }
        self.legacy_change = DepthChange::None;
        self.publish_status();
    }

    fn deliver(&mut self) {
        if let Some(pending) = self.completed.take() {
            pending.finish();
        }
    }
}

/// The connection task.
pub(crate) struct Driver {
    config: Arc<Config>,
    connector: Arc<dyn SocketConnector>,
    tokens: Arc<dyn TokenProvider>,
    machine: StateMachine,
    io: Option<Framed>,
    ctl: Control,
    session: Session,
}

impl Driver {
    pub(crate) fn new(
        config: Arc<Config>,
        connector: Arc<dyn SocketConnector>,
        tokens: Arc<dyn TokenProvider>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<State>,
        status: Arc<Mutex<SessionStatus>>,
        events: Events,
    ) -> Self {
        Self {
            machine: StateMachine::new(config.max_retries_on_transient_errors),
            io: None,
            ctl: Control {
                commands,
                timers: Timers::new(),
                close_waiters: Vec::new(),
            },
            session: Session {
                events,
                state_tx,
                status,
                ledger: TransactionLedger::new(),
                version: config.tds_version,
                packet_size: config.packet_size,
                database: config.database.clone(),
                target: Target::default(),
                routing: None,
                fedauth_echo: false,
                pending: None,
                completed: None,
                legacy_change: DepthChange::None,
                connect_reply: None,
                error: None,
                logged_in: false,
                closed: false,
            },
            config,
            connector,
            tokens,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut event = self.wait_for_connect().await;
        loop {
            self.transition(&event);
            self.session.deliver();
            event = match self.machine.state() {
                State::Connecting => self.connecting().await,
                State::SentPrelogin => self.sent_prelogin().await,
                State::SentTlsNegotiation => self.tls_negotiation().await,
                state @ (State::SentLoginStandard | State::SentLoginNtlm | State::SentLoginFedAuth) => {
                    self.logging_in(state).await
                }
                State::Rerouting => self.rerouting().await,
                State::TransientFailureRetry => self.retry_wait().await,
                State::LoggedInSendingInitialSql => self.initial_sql().await,
                State::LoggedIn => self.logged_in().await,
                State::SentClientRequest => self.client_request().await,
                State::SentAttention => self.attention().await,
                State::Initialized | State::Final => break,
            };
        }
        self.finish().await;
    }

    fn transition(&mut self, event: &Event) {
        match self.machine.apply(event) {
            Ok(t) => {
                if t.exit == Some(ExitAction::ClearRequestTimer) {
                    self.ctl.timers.request.clear();
                }
                if t.changed() {
                    tracing::debug!(from = %t.from, to = %t.to, event = event.name(), "state change");
                    self.session
                        .events
                        .debug(|| format!("State change: {} -> {}", t.from, t.to));
                    self.session.state_tx.send_replace(t.to);
                }
            }
            Err(err) => {
                self.session.running_failure(Error::Fatal(err.to_string()));
                self.session.state_tx.send_replace(self.machine.state());
            }
        }
    }

    async fn wait_for_connect(&mut self) -> Event {
        loop {
            match self.ctl.commands.recv().await {
                Some(Command::Connect { reply }) => {
                    self.session.connect_reply = Some(reply);
                    return Event::Connect;
                }
                Some(Command::Close { reply }) => {
                    self.ctl.close_waiters.extend(reply);
                    return Event::Close;
                }
                None => return Event::Close,
                Some(other) => reject(other, State::Initialized),
            }
        }
    }

    fn interrupted(&mut self, interrupt: Interrupt) -> Event {
        match interrupt {
            Interrupt::Deadline => {
                self.session.record(Error::Timeout(format!(
                    "Failed to connect to {} in {}ms",
                    self.session.target,
                    self.config.connect_timeout.as_millis()
                )));
                Event::ConnectTimeout
            }
            Interrupt::Closed => {
                self.session
                    .record(Error::Connect("Connection closed before login completed.".into()));
                Event::Close
            }
        }
    }

    async fn teardown_socket(&mut self) {
        if let Some(mut io) = self.io.take() {
            if let Err(e) = io.shutdown().await {
                tracing::trace!(error = %e, "socket shutdown failed");
            }
        }
    }

    fn apply_changes(&mut self, changes: SessionChanges) {
        if let Some(size) = changes.packet_size {
            self.apply_packet_size(size);
        }
        if let Some(database) = changes.database {
            tracing::debug!(database = %database, "database changed");
            self.session.database = Some(database);
        }
        if changes.session_reset {
            tracing::debug!("session reset acknowledged");
            self.session.events.emit(ConnectionEvent::SessionReset);
        }
        self.session.publish_status();
    }

    fn apply_packet_size(&mut self, size: u32) {
        self.session.packet_size = size;
        if let Some(io) = self.io.as_mut() {
            io.set_packet_size(size as usize);
        }
    }

    // Connection phase

    async fn send_during_connect(
        &mut self,
        state: State,
        packet_type: PacketType,
        payload: Bytes,
    ) -> std::result::Result<(), Event> {
        let Some(io) = self.io.as_mut() else {
            self.session.record(Error::Connect("socket is not open".into()));
            return Err(Event::ConnectFailed);
        };
        self.session
            .events
            .debug(|| format!("Sent {packet_type} message ({} bytes)", payload.len()));
        let send = io.send_message(packet_type, payload);
        match guarded(&mut self.ctl, state, Some(Deadline::Connect), None, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.session.record(lost(&e));
                Err(Event::ConnectFailed)
            }
            Err(interrupt) => Err(self.interrupted(interrupt)),
        }
    }

    async fn read_during_connect(&mut self, state: State) -> std::result::Result<Message, Event> {
        let Some(io) = self.io.as_mut() else {
            self.session.record(Error::Connect("socket is not open".into()));
            return Err(Event::ConnectFailed);
        };
        match guarded(&mut self.ctl, state, Some(Deadline::Connect), None, io.read_message()).await {
            Ok(Ok(Some(message))) => {
                self.session.events.debug(|| {
                    format!("Received {} message ({} bytes)", message.packet_type, message.len())
                });
                Ok(message)
            }
            Ok(Ok(None)) => {
                self.session.record(Error::Connect(format!(
                    "Connection lost - {} closed the connection during login",
                    self.session.target
                )));
                Err(Event::ConnectFailed)
            }
            Ok(Err(e)) => {
                self.session.record(lost(&e));
                Err(Event::ConnectFailed)
            }
            Err(interrupt) => Err(self.interrupted(interrupt)),
        }
    }

    async fn connecting(&mut self) -> Event {
        let config = Arc::clone(&self.config);
        self.ctl.timers.connect.arm(config.connect_timeout);
        self.session.version = config.tds_version;
        self.session.packet_size = config.packet_size;
        self.session.fedauth_echo = false;
        self.session.ledger.reset();

        let target = match self.session.routing.take() {
            Some(routing) => Target {
                host: routing.server,
                port: Some(routing.port),
            },
            None => Target {
                host: config.server.clone(),
                port: config.effective_port(),
            },
        };
        self.session.target = target.clone();

        let connector = Arc::clone(&self.connector);
        let open = async move {
            let port = match (target.port, config.instance_name.as_deref()) {
                (Some(port), _) => port,
                (None, instance) => instance::lookup_port(
                    &target.host,
                    config.instance_lookup_port,
                    instance.unwrap_or_default(),
                    config.instance_lookup_timeout,
                )
                .await
                .map_err(|e| match e {
                    e @ Error::Connect(_) => e,
                    other => Error::Connect(format!("Instance lookup failed - {other}")),
                })?,
            };
            let stream = connector.connect(&target.host, port).await.map_err(|e| {
                Error::Connect(format!("Failed to connect to {}:{port} - {e}", target.host))
            })?;
            Ok::<_, Error>((stream, port))
        };

        match guarded(&mut self.ctl, State::Connecting, Some(Deadline::Connect), None, open).await {
            Ok(Ok((stream, port))) => {
                self.session.target.port = Some(port);
                tracing::debug!(target = %self.session.target, "socket connected");
                self.io = Some(Framed::new(Transport::Plain(stream)));
                self.send_prelogin().await
            }
            Ok(Err(e)) => {
                self.session.record(e);
                Event::ConnectFailed
            }
            Err(interrupt) => self.interrupted(interrupt),
        }
    }

    async fn send_prelogin(&mut self) -> Event {
        let encryption = if self.config.encrypt {
            EncryptionLevel::On
        } else {
            EncryptionLevel::NotSupported
        };
        let prelogin = PreLogin::new()
            .with_encryption(encryption)
            .with_fed_auth_required(self.config.authentication.uses_fedauth_feature());
        match self
            .send_during_connect(State::Connecting, PacketType::PreLogin, prelogin.encode())
            .await
        {
            Ok(()) => Event::SocketConnected,
            Err(event) => event,
        }
    }

    async fn sent_prelogin(&mut self) -> Event {
        let message = match self.read_during_connect(State::SentPrelogin).await {
            Ok(message) => message,
            Err(event) => return event,
        };
        let reply = match PreLogin::decode(&message.payload) {
            Ok(reply) => reply,
            Err(e) => {
                self.session.record(e.into());
                return Event::ConnectFailed;
            }
        };
        tracing::debug!(
            server_version = %reply.version,
            encryption = ?reply.encryption,
            fed_auth_required = reply.fed_auth_required,
            "prelogin response"
        );
        self.session.fedauth_echo = reply.fed_auth_required;

        match (reply.encryption.is_required(), self.config.encrypt) {
            (true, true) => Event::TlsRequired,
            (true, false) => {
                self.session.record(Error::Connect(
                    "Server requires encryption, set 'encrypt' config option to true.".into(),
                ));
                Event::ConnectFailed
            }
            (false, true) => {
                tracing::warn!(
                    encryption = ?reply.encryption,
                    "server does not offer encryption, continuing without TLS"
                );
                self.send_login(State::SentPrelogin).await
            }
            (false, false) => self.send_login(State::SentPrelogin).await,
        }
    }

    async fn tls_negotiation(&mut self) -> Event {
        let Some(io) = self.io.take() else {
            self.session.record(Error::Connect("socket is not open".into()));
            return Event::ConnectFailed;
        };
        let packet_size = io.packet_size();
        let Transport::Plain(tcp) = io.into_inner() else {
            self.session.record(Error::Connect("TLS is already installed".into()));
            return Event::ConnectFailed;
        };
        let tls_config =
            TlsConfig::new().trust_server_certificate(self.config.trust_server_certificate);
        let connector = match TlsConnector::new(tls_config) {
            Ok(connector) => connector,
            Err(e) => {
                self.session.record(e.into());
                return Event::ConnectFailed;
            }
        };
        let host = self.session.target.host.clone();
        let upgrade = connector.upgrade(tcp, &host);
        match guarded(
            &mut self.ctl,
            State::SentTlsNegotiation,
            Some(Deadline::Connect),
            None,
            upgrade,
        )
        .await
        {
            Ok(Ok(tls)) => {
                let mut io = Framed::new(Transport::Tls(Box::new(tls)));
                io.set_packet_size(packet_size);
                self.io = Some(io);
                tracing::debug!(host = %host, "secure channel established");
                self.session
                    .events
                    .emit(ConnectionEvent::SecureChannelEstablished);
                self.send_login(State::SentTlsNegotiation).await
            }
            Ok(Err(e)) => {
                self.session.record(e.into());
                Event::ConnectFailed
            }
            Err(interrupt) => self.interrupted(interrupt),
        }
    }

    fn workstation(&self) -> String {
        self.config.workstation_id.clone().unwrap_or_default()
    }

    async fn send_login(&mut self, state: State) -> Event {
        let config = Arc::clone(&self.config);
        let workstation = self.workstation();
        let mut login = Login7::new()
            .with_tds_version(config.tds_version)
            .with_packet_size(config.packet_size)
            .with_app_name(config.application_name.as_str())
            .with_language(config.language.as_str())
            .with_hostname(workstation.as_str())
            .with_server_name(self.session.target.host.as_str())
            .with_read_only_intent(config.read_only_intent);
        if let Some(database) = &config.database {
            login = login.with_database(database.as_str());
        }

        login = match &config.authentication {
            Authentication::Default { username, password } => login.with_sql_auth(
                username.as_deref().unwrap_or_default(),
                password.as_deref().unwrap_or_default(),
            ),
            Authentication::Ntlm { domain, .. } => {
                login.with_integrated_auth(ntlm::negotiate(domain, &workstation).to_vec())
            }
            other => match fedauth::feature_data(other, self.session.fedauth_echo) {
                Some(data) => login.with_feature(FeatureExtension {
                    feature_id: FeatureId::FedAuth,
                    data,
                }),
                None => login,
            },
        };

        let payload = match login.encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.session.record(e.into());
                return Event::ConnectFailed;
            }
        };
        if let Err(event) = self.send_during_connect(state, PacketType::Login7, payload).await {
            return event;
        }
        tracing::debug!(auth = %config.authentication.auth_type(), "login sent");
        Event::LoginSent(config.authentication.login_flow())
    }

    async fn logging_in(&mut self, mut state: State) -> Event {
        loop {
            let message = match self.read_during_connect(state).await {
                Ok(message) => message,
                Err(event) => return event,
            };
            let mut outcome = LoginOutcome::default();
            if let Err(e) = outcome.absorb(message.payload, self.session.version) {
                self.session.record(e.into());
                return Event::ConnectFailed;
            }
            if let Some(size) = outcome.packet_size {
                self.apply_packet_size(size);
            }
            if let Some(database) = outcome.database.take() {
                self.session.database = Some(database);
            }

            if let Some(ack) = outcome.login_ack {
                self.session.version = ack.tds_version.min(self.config.tds_version);
                self.session.publish_status();
                tracing::info!(
                    target = %self.session.target,
                    tds_version = %self.session.version,
                    "login acknowledged"
                );
                return match outcome.routing {
                    Some(routing) => {
                        self.session.routing = Some(routing);
                        Event::LoggedIn { routed: true }
                    }
                    None => Event::LoggedIn { routed: false },
                };
            }

            if let Some(error) = outcome.error {
                let transient = error.is_transient();
                tracing::debug!(number = error.number, transient, "login failed");
                self.session.error = Some(Error::Login(error));
                return Event::LoginFailed { transient };
            }

            if let (State::SentLoginNtlm, Some(challenge)) = (state, outcome.sspi.as_ref()) {
                let payload = match self.ntlm_response(challenge) {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.session.record(e);
                        return Event::ConnectFailed;
                    }
                };
                if let Err(event) = self.send_during_connect(state, PacketType::Ntlm, payload).await {
                    return event;
                }
                self.transition(&Event::NtlmChallengeResponded);
                state = self.machine.state();
                if state == State::Final {
                    return Event::Close;
                }
                continue;
            }

            if let (State::SentLoginFedAuth, Some(info)) = (state, outcome.fedauth_info) {
                return self.send_fedauth_token(info).await;
            }

            self.session.record(Error::Connect(
                "Login failed; the server sent no acknowledgement".into(),
            ));
            return Event::LoginFailed { transient: false };
        }
    }

    fn ntlm_response(&self, challenge: &[u8]) -> Result<Bytes> {
        let Authentication::Ntlm {
            username,
            password,
            domain,
        } = &self.config.authentication
        else {
            return Err(Error::Connect("unexpected NTLM challenge".into()));
        };
        let challenge = ntlm::Challenge::parse(challenge)?;
        let workstation = self.workstation();
        let credentials = NtlmCredentials {
            username: username.as_deref().unwrap_or_default(),
            password: password.as_deref().unwrap_or_default(),
            domain,
            workstation: &workstation,
        };
        Ok(ntlm::authenticate(&credentials, &challenge)?)
    }

    async fn send_fedauth_token(&mut self, info: FedAuthInfo) -> Event {
        let request = TokenRequest {
            sts_url: info.sts_url.unwrap_or_default(),
            spn: info.spn.unwrap_or_default(),
        };
        tracing::debug!(spn = %request.spn, "requesting federated authentication token");
        let tokens = Arc::clone(&self.tokens);
        let config = Arc::clone(&self.config);
        let fetch = async move { tokens.token(&config.authentication, &request).await };

        match guarded(&mut self.ctl, State::SentLoginFedAuth, Some(Deadline::Connect), None, fetch).await {
            Ok(Ok(token)) => {
                let payload = fedauth::token_message(&token);
                match self
                    .send_during_connect(State::SentLoginFedAuth, PacketType::FedAuthToken, payload)
                    .await
                {
                    Ok(()) => Event::FedAuthTokenSent,
                    Err(event) => event,
                }
            }
            Ok(Err(e)) => {
                self.session.record(e.into());
                Event::ConnectFailed
            }
            Err(interrupt) => self.interrupted(interrupt),
        }
    }

    async fn rerouting(&mut self) -> Event {
        if let Some(routing) = &self.session.routing {
            tracing::info!(host = %routing.server, port = routing.port, "server redirected the connection");
            self.session.events.emit(ConnectionEvent::Rerouting {
                host: routing.server.clone(),
                port: routing.port,
            });
        }
        self.teardown_socket().await;
        Event::SocketClosed
    }

    async fn retry_wait(&mut self) -> Event {
        self.ctl.timers.connect.clear();
        self.teardown_socket().await;
        self.transition(&Event::SocketClosed);

        let attempt = self.machine.retries();
        let interval = self.config.connection_retry_interval;
        tracing::info!(
            attempt,
            max = self.config.max_retries_on_transient_errors,
            delay_ms = interval.as_millis() as u64,
            "transient login failure, retrying"
        );
        self.session.error = None;
        self.ctl.timers.retry.arm(interval);

        let wait = pending::<()>();
        match guarded(&mut self.ctl, State::TransientFailureRetry, Some(Deadline::Retry), None, wait).await {
            Ok(()) | Err(Interrupt::Deadline) => {
                self.session
                    .events
                    .emit(ConnectionEvent::Retrying { attempt });
                Event::RetryTimerFired
            }
            Err(Interrupt::Closed) => self.interrupted(Interrupt::Closed),
        }
    }

    async fn initial_sql(&mut self) -> Event {
        let sql = self.config.initial_sql();
        let payload = encode_sql_batch(&sql, self.session.ledger.current(), self.session.version);
        if let Err(event) = self
            .send_during_connect(State::LoggedInSendingInitialSql, PacketType::SqlBatch, payload)
            .await
        {
            return event;
        }
        let message = match self.read_during_connect(State::LoggedInSendingInitialSql).await {
            Ok(message) => message,
            Err(event) => return event,
        };
        let version = self.session.version;
        match absorb_response(message.payload, version, None, &mut self.session.ledger) {
            Ok(changes) => self.apply_changes(changes),
            Err(e) => {
                self.session.record(e.into());
                return Event::ConnectFailed;
            }
        }
        self.ctl.timers.connect.clear();
        self.session.logged_in = true;
        Event::InitialSqlDone
    }

    // Logged in

    async fn logged_in(&mut self) -> Event {
        if let Some(reply) = self.session.connect_reply.take() {
            tracing::info!(target = %self.session.target, "connection established");
            let _ = reply.send(Ok(()));
            self.session
                .events
                .emit(ConnectionEvent::Connected { error: None });
        }
        let Some(io) = self.io.as_mut() else {
            self.session
                .running_failure(Error::Fatal("socket is not open".into()));
            return Event::SocketError;
        };

        loop {
            tokio::select! {
                cmd = self.ctl.commands.recv() => match cmd {
                    None => return Event::Close,
                    Some(Command::Close { reply }) => {
                        self.ctl.close_waiters.extend(reply);
                        return Event::Close;
                    }
                    Some(Command::Submit(pending)) => {
                        if pending.is_canceled() {
                            pending.complete(Err(Error::Canceled));
                            continue;
                        }
                        self.session.pending = Some(pending);
                        return Event::RequestSubmitted;
                    }
                    Some(other) => reject(other, State::LoggedIn),
                },
                message = io.read_message() => {
                    let error = match message {
                        Ok(Some(message)) => {
                            tracing::warn!(packet_type = %message.packet_type, "unsolicited message while idle");
                            continue;
                        }
                        Ok(None) => Error::Fatal(format!(
                            "Connection lost - {} closed the connection",
                            self.session.target
                        )),
                        Err(e) => lost_running(&e),
                    };
                    self.session.running_failure(error);
                    return Event::SocketError;
                }
            }
        }
    }

    fn request_timeout(&self) -> Duration {
        self.session
            .pending
            .as_ref()
            .and_then(|p| p.request.timeout)
            .unwrap_or(self.config.request_timeout)
    }

    fn abort_error(&self, flag: &AtomicBool) -> Error {
        if flag.load(Ordering::Acquire) {
            Error::Canceled
        } else {
            timed_out(self.request_timeout())
        }
    }

    async fn client_request(&mut self) -> Event {
        let version = self.session.version;
        let descriptor = self.session.ledger.current();
        let Some(pending) = self.session.pending.as_ref() else {
            return Event::ResponseComplete;
        };
        let flag = Arc::clone(pending.cancel_flag());
        let first_status = if pending.request.reset_connection {
            PacketStatus::RESET_CONNECTION
        } else {
            PacketStatus::NORMAL
        };
        let (packet_type, payload, change) = match pending.request.operation.encode(descriptor, version) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.session.complete_pending(Some(e.into()));
                return Event::ResponseComplete;
            }
        };
        self.session.legacy_change = change;

        let timeout = self.request_timeout();
        if !timeout.is_zero() {
            self.ctl.timers.request.arm(timeout);
        }
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let abort = {
            let flag = Arc::clone(&flag);
            move || flag.load(Ordering::Acquire) || deadline.is_some_and(|d| Instant::now() >= d)
        };

        let Some(io) = self.io.as_mut() else {
            self.session
                .running_failure(Error::Fatal("socket is not open".into()));
            return Event::SocketError;
        };
        self.session
            .events
            .debug(|| format!("Sending {packet_type} request ({} bytes)", payload.len()));
        let send = io.send_message_with(packet_type, payload, first_status, abort);
        let deadline = (!timeout.is_zero()).then_some(Deadline::Request);
        let outcome = match guarded(&mut self.ctl, State::SentClientRequest, deadline, Some(&flag), send).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.session.running_failure(lost_running(&e));
                return Event::SocketError;
            }
            Err(Interrupt::Deadline) => {
                // A write cut off mid-packet leaves the stream unusable.
                tracing::debug!(timeout_ms = timeout.as_millis() as u64, "request timed out while sending");
                self.session.running_failure(timed_out(timeout));
                return Event::SocketError;
            }
            Err(Interrupt::Closed) => return Event::Close,
        };

        match outcome {
            SendOutcome::Sent => {}
            SendOutcome::NotSent => {
                let error = self.abort_error(&flag);
                self.session.complete_pending(Some(error));
                return Event::ResponseComplete;
            }
            SendOutcome::Ignored => return self.drain_ignored(&flag).await,
        }

        if flag.load(Ordering::Acquire) {
            return self.send_attention().await;
        }
        self.await_response(&flag).await
    }

    /// The server answers a message closed with IGNORE by a bare DONE.
    async fn drain_ignored(&mut self, flag: &Arc<AtomicBool>) -> Event {
        let error = self.abort_error(flag);
        let Some(io) = self.io.as_mut() else {
            return Event::SocketError;
        };
        match guarded(&mut self.ctl, State::SentClientRequest, None, None, io.read_message()).await {
            Ok(Ok(Some(_))) => {
                self.session.complete_pending(Some(error));
                Event::ResponseComplete
            }
            Ok(Ok(None)) => {
                self.session.running_failure(Error::Fatal(
                    "Connection lost - closed while discarding a canceled request".into(),
                ));
                Event::SocketError
            }
            Ok(Err(e)) => {
                self.session.running_failure(lost_running(&e));
                Event::SocketError
            }
            Err(_) => Event::Close,
        }
    }

    async fn await_response(&mut self, flag: &Arc<AtomicBool>) -> Event {
        let Some(io) = self.io.as_mut() else {
            return Event::SocketError;
        };
        loop {
            tokio::select! {
                message = io.read_message() => {
                    let message = match message {
                        Ok(Some(message)) => message,
                        Ok(None) => {
                            self.session.running_failure(Error::Fatal(format!(
                                "Connection lost - {} closed the connection",
                                self.session.target
                            )));
                            return Event::SocketError;
                        }
                        Err(e) => {
                            self.session.running_failure(lost_running(&e));
                            return Event::SocketError;
                        }
                    };
                    let version = self.session.version;
                    let absorbed = absorb_response(
                        message.payload,
                        version,
                        self.session.pending.as_mut(),
                        &mut self.session.ledger,
                    );
                    return match absorbed {
                        Ok(changes) => {
                            self.apply_changes(changes);
                            self.session.complete_pending(None);
                            Event::ResponseComplete
                        }
                        Err(e) => {
                            self.session.running_failure(e.into());
                            Event::SocketError
                        }
                    };
                }
                () = self.ctl.timers.request.fired() => {
                    let timeout = self.request_timeout();
                    tracing::debug!(timeout_ms = timeout.as_millis() as u64, "request timed out");
                    if let Some(pending) = self.session.pending.as_mut() {
                        pending.cancel_error = Some(timed_out(timeout));
                    }
                    return self.send_attention().await;
                }
                cmd = self.ctl.commands.recv() => match cmd {
                    None => return Event::Close,
                    Some(Command::Close { reply }) => {
                        self.ctl.close_waiters.extend(reply);
                        return Event::Close;
                    }
                    Some(Command::Cancel { request }) => {
                        if targets(request.as_ref(), flag) {
                            flag.store(true, Ordering::Release);
                            return self.send_attention().await;
                        }
                    }
                    Some(other) => reject(other, State::SentClientRequest),
                },
            }
        }
    }

    async fn send_attention(&mut self) -> Event {
        self.ctl.timers.request.clear();
        let Some(io) = self.io.as_mut() else {
            return Event::SocketError;
        };
        match io.send_attention().await {
            Ok(()) => {
                self.session.events.debug(|| "Sent attention".into());
                self.ctl.timers.cancel.arm(self.config.cancel_timeout);
                Event::AttentionSent
            }
            Err(e) => {
                self.session.running_failure(lost_running(&e));
                Event::SocketError
            }
        }
    }

    async fn attention(&mut self) -> Event {
        loop {
            let Some(io) = self.io.as_mut() else {
                return Event::SocketError;
            };
            let read = guarded(
                &mut self.ctl,
                State::SentAttention,
                Some(Deadline::Cancel),
                None,
                io.read_message(),
            )
            .await;
            let message = match read {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => {
                    self.session.running_failure(Error::Fatal(
                        "Connection lost - closed while waiting for the attention acknowledgement"
                            .into(),
                    ));
                    return Event::SocketError;
                }
                Ok(Err(e)) => {
                    self.session.running_failure(lost_running(&e));
                    return Event::SocketError;
                }
                Err(Interrupt::Deadline) => {
                    self.session.running_failure(Error::Timeout(format!(
                        "Failed to cancel request in {}ms",
                        self.config.cancel_timeout.as_millis()
                    )));
                    return Event::SocketError;
                }
                Err(Interrupt::Closed) => return Event::Close,
            };

            let version = self.session.version;
            match absorb_response(message.payload, version, None, &mut self.session.ledger) {
                Ok(changes) => {
                    let acknowledged = changes.attention_ack;
                    self.apply_changes(changes);
                    if acknowledged {
                        self.ctl.timers.cancel.clear();
                        let error = self
                            .session
                            .pending
                            .as_mut()
                            .map_or(Error::Canceled, PendingRequest::take_cancel_error);
                        self.session.complete_pending(Some(error));
                        return Event::AttentionAcknowledged;
                    }
                }
                Err(e) => {
                    self.session.running_failure(e.into());
                    return Event::SocketError;
                }
            }
        }
    }

    // Final

    async fn finish(&mut self) {
        self.ctl.timers.clear_all();
        self.teardown_socket().await;

        let session = &mut self.session;
        if !session.closed {
            session.closed = true;
            let mut error = session.error.take();
            if let Some(reply) = session.connect_reply.take() {
                let error = error
                    .take()
                    .unwrap_or_else(|| Error::Connect("Connection closed before login completed.".into()));
                tracing::debug!(error = %error, "connection attempt failed");
                session.events.emit(ConnectionEvent::Connected {
                    error: Some(Arc::new(error.replicate())),
                });
                let _ = reply.send(Err(error));
            } else if session.logged_in {
                tracing::debug!("connection closed");
                session.events.emit(ConnectionEvent::Disconnected);
            }
            // A request cut off by a running failure reports that failure.
            if let Some(pending) = session.pending.take() {
                pending.complete(Err(error.unwrap_or(Error::ConnectionClosed)));
            }
            session.deliver();
            session.publish_status();
        }

        for waiter in self.ctl.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        while let Some(command) = self.ctl.commands.recv().await {
            reject(command, State::Final);
        }
        tracing::trace!("connection driver stopped");
    }
}

fn lost(error: &CodecError) -> Error {
    Error::Connect(format!("Connection lost - {error}"))
}

fn lost_running(error: &CodecError) -> Error {
    Error::Fatal(format!("Connection lost - {error}"))
}

fn timed_out(timeout: Duration) -> Error {
    Error::Timeout(format!(
        "Timeout: Request failed to complete in {}ms",
        timeout.as_millis()
    ))
}
