//! Helpers shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use tds_client::{Authentication, Config, ConnectionEvent};
use tds_testing::MockTdsServer;
use tokio::sync::broadcast;

/// Plain-text SQL login against `server`.
pub fn config_for(server: &MockTdsServer) -> Config {
    init_tracing();
    Config::new(server.host())
        .with_port(server.port())
        .with_encrypt(false)
        .with_authentication(Authentication::sql("sa", "secret"))
        .with_connect_timeout(Duration::from_secs(5))
        .with_request_timeout(Duration::from_secs(5))
        .with_connection_retry_interval(Duration::from_millis(20))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait for the first event matching `pred`, failing after five seconds.
pub async fn expect_event<F>(rx: &mut broadcast::Receiver<ConnectionEvent>, pred: F) -> ConnectionEvent
where
    F: Fn(&ConnectionEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for an event")
}

/// Everything published so far.
pub fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
