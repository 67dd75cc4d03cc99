//! The connection state machine.
//!
//! ```text
//! Initialized -> Connecting -> SentPrelogin -> [SentTlsNegotiation]
//!   -> SentLoginStandard | SentLoginNtlm | SentLoginFedAuth
//!   -> LoggedInSendingInitialSql -> LoggedIn <-> SentClientRequest <-> SentAttention
//!
//! Rerouting, TransientFailureRetry -> Connecting
//! any -> Final
//! ```
//!
//! [`StateMachine`] only decides where an event leads. The connection driver
//! runs the entry work of each state and feeds the outcome back as the next
//! [`Event`].

use std::fmt;

use tds_auth::LoginFlow;
use thiserror::Error;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Constructed, `connect` not called yet.
    Initialized,
    /// Resolving the target and opening the socket.
    Connecting,
    /// PRELOGIN sent, waiting for the answer.
    SentPrelogin,
    /// TLS handshake in progress.
    SentTlsNegotiation,
    /// LOGIN7 with credentials or an access token sent.
    SentLoginStandard,
    /// NTLM exchange in progress.
    SentLoginNtlm,
    /// Waiting for FEDAUTHINFO.
    SentLoginFedAuth,
    /// Session configuration batch sent.
    LoggedInSendingInitialSql,
    /// Idle, accepting requests.
    LoggedIn,
    /// A request is in flight.
    SentClientRequest,
    /// Attention sent, waiting for the acknowledgement.
    SentAttention,
    /// Tearing down before connecting to the routed server.
    Rerouting,
    /// Waiting to retry after a transient login failure.
    TransientFailureRetry,
    /// Closed.
    Final,
}

impl State {
    /// Name used in logs and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Connecting => "Connecting",
            Self::SentPrelogin => "SentPrelogin",
            Self::SentTlsNegotiation => "SentTLSSSLNegotiation",
            Self::SentLoginStandard => "SentLogin7WithStandardLogin",
            Self::SentLoginNtlm => "SentLogin7WithNTLMLogin",
            Self::SentLoginFedAuth => "SentLogin7WithFedauth",
            Self::LoggedInSendingInitialSql => "LoggedInSendingInitialSql",
            Self::LoggedIn => "LoggedIn",
            Self::SentClientRequest => "SentClientRequest",
            Self::SentAttention => "SentAttention",
            Self::Rerouting => "ReRouting",
            Self::TransientFailureRetry => "TransientFailureRetry",
            Self::Final => "Final",
        }
    }

    /// States between `connect` and the end of the initial SQL batch.
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::SentPrelogin
                | Self::SentTlsNegotiation
                | Self::SentLoginStandard
                | Self::SentLoginNtlm
                | Self::SentLoginFedAuth
                | Self::LoggedInSendingInitialSql
                | Self::Rerouting
                | Self::TransientFailureRetry
        )
    }

    const fn is_login(self) -> bool {
        matches!(
            self,
            Self::SentLoginStandard | Self::SentLoginNtlm | Self::SentLoginFedAuth
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something that happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The caller asked to connect.
    Connect,
    /// Socket open and PRELOGIN written.
    SocketConnected,
    /// PRELOGIN answer demands TLS.
    TlsRequired,
    /// LOGIN7 written.
    LoginSent(LoginFlow),
    /// NTLM challenge answered.
    NtlmChallengeResponded,
    /// Federated auth token written.
    FedAuthTokenSent,
    /// LOGINACK received.
    LoggedIn {
        /// The server asked the client to reconnect elsewhere.
        routed: bool,
    },
    /// Login rejected.
    LoginFailed {
        /// The server error is retryable.
        transient: bool,
    },
    /// Connection attempt failed for a non-socket reason.
    ConnectFailed,
    /// Socket torn down on purpose.
    SocketClosed,
    /// Retry delay elapsed.
    RetryTimerFired,
    /// Initial SQL batch answered.
    InitialSqlDone,
    /// A request was accepted.
    RequestSubmitted,
    /// Attention written.
    AttentionSent,
    /// Request response fully consumed.
    ResponseComplete,
    /// Attention acknowledged.
    AttentionAcknowledged,
    /// Socket failure.
    SocketError,
    /// Connect timer expired.
    ConnectTimeout,
    /// The caller closed the connection.
    Close,
}

impl Event {
    /// Name used in logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::SocketConnected => "socketConnected",
            Self::TlsRequired => "tlsRequired",
            Self::LoginSent(_) => "loginSent",
            Self::NtlmChallengeResponded => "ntlmChallengeResponded",
            Self::FedAuthTokenSent => "fedAuthTokenSent",
            Self::LoggedIn { .. } => "loggedIn",
            Self::LoginFailed { .. } => "loginFailed",
            Self::ConnectFailed => "connectFailed",
            Self::SocketClosed => "socketClosed",
            Self::RetryTimerFired => "retryTimerFired",
            Self::InitialSqlDone => "initialSqlDone",
            Self::RequestSubmitted => "requestSubmitted",
            Self::AttentionSent => "attentionSent",
            Self::ResponseComplete => "responseComplete",
            Self::AttentionAcknowledged => "attentionAcknowledged",
            Self::SocketError => "socketError",
            Self::ConnectTimeout => "connectTimeout",
            Self::Close => "close",
        }
    }
}

/// Work to run when leaving a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Disarm the per-request timer.
    ClearRequestTimer,
}

/// Result of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the event.
    pub from: State,
    /// State after the event.
    pub to: State,
    /// Exit action of `from`, if it was left.
    pub exit: Option<ExitAction>,
}

impl Transition {
    /// Whether the state actually changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Rejected events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// `connect` outside `Initialized`; the state is left untouched.
    #[error("`.connect` can not be called on a Connection in `{0}` state.")]
    ConnectNotAllowed(State),
    /// An event the current state does not accept; the machine is now `Final`.
    #[error("No event '{event}' in state '{state}'")]
    Violation {
        /// Rejected event.
        event: &'static str,
        /// State that rejected it.
        state: State,
    },
}

/// Transition table plus the transient retry counter.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: State,
    retries: u32,
    max_retries: u32,
}

impl StateMachine {
    /// New machine in `Initialized`, allowing `max_retries` transient retries.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: State::Initialized,
            retries: 0,
            max_retries,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Transient retries taken so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Apply `event`.
    pub fn apply(&mut self, event: &Event) -> Result<Transition, TransitionError> {
        if self.state == State::Final {
            tracing::trace!(event = event.name(), "event ignored in final state");
            return Ok(self.move_to(State::Final));
        }

        match self.target(event) {
            Some(to) => Ok(self.move_to(to)),
            None if matches!(event, Event::Connect) => {
                Err(TransitionError::ConnectNotAllowed(self.state))
            }
            None => {
                let err = TransitionError::Violation {
                    event: event.name(),
                    state: self.state,
                };
                tracing::debug!(error = %err, "illegal event");
                self.move_to(State::Final);
                Err(err)
            }
        }
    }

    fn target(&self, event: &Event) -> Option<State> {
        use State::*;

        let from = self.state;
        let to = match (from, event) {
            (Initialized, Event::Connect) => Connecting,
            (Connecting, Event::SocketConnected) => SentPrelogin,
            (SentPrelogin, Event::TlsRequired) => SentTlsNegotiation,
            (SentPrelogin | SentTlsNegotiation, Event::LoginSent(flow)) => match flow {
                LoginFlow::Standard => SentLoginStandard,
                LoginFlow::Ntlm => SentLoginNtlm,
                LoginFlow::FedAuth => SentLoginFedAuth,
            },
            (SentLoginNtlm, Event::NtlmChallengeResponded) => SentLoginNtlm,
            (SentLoginFedAuth, Event::FedAuthTokenSent) => SentLoginStandard,
            (s, Event::LoggedIn { routed }) if s.is_login() => {
                if *routed {
                    Rerouting
                } else {
                    LoggedInSendingInitialSql
                }
            }
            (s, Event::LoginFailed { transient }) if s.is_login() => {
                if *transient && self.retries < self.max_retries {
                    TransientFailureRetry
                } else {
                    Final
                }
            }
            (Rerouting, Event::SocketClosed) => Connecting,
            (TransientFailureRetry, Event::SocketClosed) => TransientFailureRetry,
            (TransientFailureRetry, Event::RetryTimerFired) => Connecting,
            (LoggedInSendingInitialSql, Event::InitialSqlDone) => LoggedIn,
            (LoggedIn, Event::RequestSubmitted) => SentClientRequest,
            (SentClientRequest, Event::AttentionSent) => SentAttention,
            (SentClientRequest, Event::ResponseComplete) => LoggedIn,
            (SentAttention, Event::AttentionAcknowledged) => LoggedIn,
            (s, Event::ConnectFailed | Event::ConnectTimeout) if s.is_connecting() => Final,
            (_, Event::SocketError | Event::Close) => Final,
            _ => return None,
        };
        Some(to)
    }

    fn move_to(&mut self, to: State) -> Transition {
        let from = self.state;
        if from == to {
            tracing::debug!(state = %from, "already in state, not re-entering");
            return Transition {
                from,
                to,
                exit: None,
            };
        }

        let exit = match from {
            State::SentClientRequest => Some(ExitAction::ClearRequestTimer),
            _ => None,
        };
        if to == State::TransientFailureRetry {
            self.retries += 1;
        }
        self.state = to;
        tracing::debug!(from = %from, to = %to, "state transition");
        Transition { from, to, exit }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn logged_in() -> StateMachine {
        let mut m = StateMachine::new(3);
        for event in [
            Event::Connect,
            Event::SocketConnected,
            Event::LoginSent(LoginFlow::Standard),
            Event::LoggedIn { routed: false },
            Event::InitialSqlDone,
        ] {
            m.apply(&event).unwrap();
        }
        m
    }

    #[test]
    fn test_happy_path() {
        let m = logged_in();
        assert_eq!(m.state(), State::LoggedIn);
    }

    #[test]
    fn test_tls_path() {
        let mut m = StateMachine::new(0);
        m.apply(&Event::Connect).unwrap();
        m.apply(&Event::SocketConnected).unwrap();
        m.apply(&Event::TlsRequired).unwrap();
        assert_eq!(m.state(), State::SentTlsNegotiation);
        m.apply(&Event::LoginSent(LoginFlow::Ntlm)).unwrap();
        assert_eq!(m.state(), State::SentLoginNtlm);
    }

    #[test]
    fn test_connect_only_from_initialized() {
        let mut m = logged_in();
        let err = m.apply(&Event::Connect).unwrap_err();
        assert_eq!(err, TransitionError::ConnectNotAllowed(State::LoggedIn));
        assert_eq!(m.state(), State::LoggedIn);
        assert!(err.to_string().contains("LoggedIn"));
    }

    #[test]
    fn test_illegal_event_goes_final() {
        let mut m = logged_in();
        let err = m.apply(&Event::AttentionAcknowledged).unwrap_err();
        assert!(matches!(err, TransitionError::Violation { .. }));
        assert_eq!(m.state(), State::Final);
    }

    #[test]
    fn test_same_state_is_not_reentered() {
        let mut m = StateMachine::new(0);
        m.apply(&Event::Connect).unwrap();
        m.apply(&Event::SocketConnected).unwrap();
        m.apply(&Event::LoginSent(LoginFlow::Ntlm)).unwrap();
        let t = m.apply(&Event::NtlmChallengeResponded).unwrap();
        assert!(!t.changed());
        assert_eq!(t.exit, None);
        assert_eq!(m.state(), State::SentLoginNtlm);
    }

    #[test]
    fn test_fedauth_continues_as_standard() {
        let mut m = StateMachine::new(0);
        m.apply(&Event::Connect).unwrap();
        m.apply(&Event::SocketConnected).unwrap();
        m.apply(&Event::LoginSent(LoginFlow::FedAuth)).unwrap();
        m.apply(&Event::FedAuthTokenSent).unwrap();
        assert_eq!(m.state(), State::SentLoginStandard);
    }

    #[test]
    fn test_request_exit_clears_timer() {
        let mut m = logged_in();
        m.apply(&Event::RequestSubmitted).unwrap();
        let t = m.apply(&Event::AttentionSent).unwrap();
        assert_eq!(t.exit, Some(ExitAction::ClearRequestTimer));
        let t = m.apply(&Event::AttentionAcknowledged).unwrap();
        assert_eq!(t.exit, None);
        assert_eq!(m.state(), State::LoggedIn);
    }

    #[test]
    fn test_transient_retries_are_bounded() {
        let mut m = StateMachine::new(2);
        m.apply(&Event::Connect).unwrap();
        for attempt in 1..=2 {
            m.apply(&Event::SocketConnected).unwrap();
            m.apply(&Event::LoginSent(LoginFlow::Standard)).unwrap();
            m.apply(&Event::LoginFailed { transient: true }).unwrap();
            assert_eq!(m.state(), State::TransientFailureRetry);
            assert_eq!(m.retries(), attempt);
            assert!(!m.apply(&Event::SocketClosed).unwrap().changed());
            m.apply(&Event::RetryTimerFired).unwrap();
            assert_eq!(m.state(), State::Connecting);
        }
        m.apply(&Event::SocketConnected).unwrap();
        m.apply(&Event::LoginSent(LoginFlow::Standard)).unwrap();
        m.apply(&Event::LoginFailed { transient: true }).unwrap();
        assert_eq!(m.state(), State::Final);
    }

    #[test]
    fn test_non_transient_login_failure_is_final() {
        let mut m = StateMachine::new(5);
        m.apply(&Event::Connect).unwrap();
        m.apply(&Event::SocketConnected).unwrap();
        m.apply(&Event::LoginSent(LoginFlow::Standard)).unwrap();
        m.apply(&Event::LoginFailed { transient: false }).unwrap();
        assert_eq!(m.state(), State::Final);
        assert_eq!(m.retries(), 0);
    }

    #[test]
    fn test_rerouting_loops_to_connecting() {
        let mut m = StateMachine::new(0);
        m.apply(&Event::Connect).unwrap();
        m.apply(&Event::SocketConnected).unwrap();
        m.apply(&Event::LoginSent(LoginFlow::Standard)).unwrap();
        m.apply(&Event::LoggedIn { routed: true }).unwrap();
        assert_eq!(m.state(), State::Rerouting);
        m.apply(&Event::SocketClosed).unwrap();
        assert_eq!(m.state(), State::Connecting);
    }

    #[test]
    fn test_connect_timeout_not_legal_when_logged_in() {
        let mut m = logged_in();
        assert!(m.apply(&Event::ConnectTimeout).is_err());
        assert_eq!(m.state(), State::Final);
    }

    #[test]
    fn test_final_absorbs_events() {
        let mut m = logged_in();
        m.apply(&Event::Close).unwrap();
        let t = m.apply(&Event::Close).unwrap();
        assert!(!t.changed());
        assert!(m.apply(&Event::SocketError).is_ok());
        assert_eq!(m.state(), State::Final);
    }
}
