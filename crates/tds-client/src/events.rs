//! Connection lifecycle notifications.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::Error;

/// Capacity of the notification channel. Slow subscribers observe
/// `RecvError::Lagged` rather than stalling the connection.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// A notification published by a [`Connection`](crate::Connection).
///
/// A connection publishes exactly one of `Connected` (possibly carrying the
/// connect error) or, after a successful login, `Disconnected` as its
/// terminal notification.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// The connect attempt finished.
    Connected {
        /// Why the attempt failed, if it did.
        error: Option<Arc<Error>>,
    },
    /// A logged-in connection ended.
    Disconnected,
    /// The running connection failed; `Disconnected` follows.
    RunningError(Arc<Error>),
    /// Protocol trace, published when debug events are enabled.
    DebugTrace(String),
    /// TLS is up.
    SecureChannelEstablished,
    /// The server acknowledged a session reset.
    SessionReset,
    /// The server redirected the login.
    Rerouting {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
    /// A transient login failure is being retried.
    Retrying {
        /// Retry number, starting at 1.
        attempt: u32,
    },
}

/// Publisher side of the notification channel.
#[derive(Debug, Clone)]
pub(crate) struct Events {
    tx: broadcast::Sender<ConnectionEvent>,
    debug: bool,
}

impl Events {
    pub(crate) fn new(debug: bool) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx, debug }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        tracing::trace!(?event, "connection event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Publish a trace line; the message is only built when enabled.
    pub(crate) fn debug(&self, message: impl FnOnce() -> String) {
        if self.debug {
            self.emit(ConnectionEvent::DebugTrace(message()));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_debug_only_when_enabled() {
        let quiet = Events::new(false);
        let mut rx = quiet.subscribe();
        quiet.debug(|| "hidden".into());
        quiet.emit(ConnectionEvent::SessionReset);
        assert!(matches!(rx.recv().await.unwrap(), ConnectionEvent::SessionReset));

        let chatty = Events::new(true);
        let mut rx = chatty.subscribe();
        chatty.debug(|| "State change: Initialized -> Connecting".into());
        assert!(matches!(
            rx.recv().await.unwrap(),
            ConnectionEvent::DebugTrace(line) if line.contains("Connecting")
        ));
    }

    #[test]
    fn test_emit_without_subscribers() {
        Events::new(true).emit(ConnectionEvent::Disconnected);
    }
}
