//! Connection lifecycle against the mock server: login variants, routing,
//! retries, timeouts and teardown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config_for, drain, expect_event};
use tds_client::{
    Authentication, AuthenticationBuilder, AuthenticationType, Config, Connection, ConnectionEvent,
    Error, State, StaticTokenProvider, TdsVersion,
};
use tds_protocol::EncryptionLevel;
use tds_testing::{LoginBehavior, MockBrowser, MockTdsServer, TRANSIENT_LOGIN_ERROR};
use tokio::net::TcpListener;

#[tokio::test]
async fn test_connect_and_close() {
    let server = MockTdsServer::builder()
        .with_database("appdb")
        .build()
        .await
        .unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();
    let mut events = conn.subscribe();
    assert_eq!(conn.state(), State::Initialized);

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), State::LoggedIn);
    expect_event(&mut events, |e| matches!(e, ConnectionEvent::Connected { error: None })).await;

    let session = conn.session();
    assert_eq!(session.database.as_deref(), Some("appdb"));
    assert_eq!(session.tds_version, TdsVersion::V7_4);
    assert!(!session.in_transaction);

    let observed = server.observed();
    assert_eq!(observed.logins, 1);
    // The session options went out right after login.
    assert!(observed.batches[0].contains("set textsize -1"));

    conn.close().await;
    assert_eq!(conn.state(), State::Final);
    expect_event(&mut events, |e| matches!(e, ConnectionEvent::Disconnected)).await;
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();

    conn.close().await;
    conn.close().await;
    conn.clone().close().await;

    let disconnects = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ConnectionEvent::Disconnected))
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_connect_only_from_initialized() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();
    conn.connect().await.unwrap();

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "{err}");
    // The live connection is untouched.
    assert_eq!(conn.state(), State::LoggedIn);
    conn.execute_batch("select 1").await.unwrap();

    conn.close().await;
    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "{err}");
    assert_eq!(server.observed().logins, 1);
}

#[tokio::test]
async fn test_close_during_connect_fails_the_attempt() {
    // Accepts but never answers PRELOGIN.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _hold = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });

    let config = Config::new("127.0.0.1").with_port(port).with_encrypt(false);
    let conn = Connection::new(config).unwrap();
    let connecting = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.connect().await })
    };
    conn.wait_for_state(State::SentPrelogin).await;
    conn.close().await;

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Connect(_)), "{err}");
    assert_eq!(conn.state(), State::Final);
}

#[tokio::test]
async fn test_connect_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _hold = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });

    let config = Config::new("127.0.0.1")
        .with_port(port)
        .with_encrypt(false)
        .with_connect_timeout(Duration::from_millis(200));
    let conn = Connection::new(config).unwrap();
    let mut events = conn.subscribe();

    let err = conn.connect().await.unwrap_err();
    match &err {
        Error::Timeout(message) => assert!(message.contains("in 200ms"), "{message}"),
        other => panic!("expected a timeout, got {other}"),
    }
    let event = expect_event(&mut events, |e| matches!(e, ConnectionEvent::Connected { .. })).await;
    assert!(matches!(event, ConnectionEvent::Connected { error: Some(_) }));
    assert_eq!(conn.state(), State::Final);
}

#[tokio::test]
async fn test_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let conn = Connection::new(Config::new("127.0.0.1").with_port(port)).unwrap();
    let err = conn.connect().await.unwrap_err();
    match err {
        Error::Connect(message) => {
            assert!(message.starts_with(&format!("Failed to connect to 127.0.0.1:{port}")));
        }
        other => panic!("expected a connect error, got {other}"),
    }
}

#[tokio::test]
async fn test_login_failure_is_not_retried() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::Fail { number: 18456 })
        .build()
        .await
        .unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();

    let err = conn.connect().await.unwrap_err();
    assert_eq!(err.server_error().unwrap().number, 18456);
    assert!(matches!(err, Error::Login(_)));
    assert_eq!(server.observed().logins, 1);
    assert_eq!(conn.state(), State::Final);
}

#[tokio::test]
async fn test_transient_login_failures_are_retried_up_to_the_limit() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::TransientFailures(usize::MAX))
        .build()
        .await
        .unwrap();
    let config = config_for(&server).with_max_retries_on_transient_errors(3);
    let conn = Connection::new(config).unwrap();
    let mut events = conn.subscribe();

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::Login(ref e) if e.number == TRANSIENT_LOGIN_ERROR), "{err}");
    // One initial attempt plus three retries.
    assert_eq!(server.observed().logins, 4);

    let attempts: Vec<u32> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ConnectionEvent::Retrying { attempt } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_transient_login_failure_then_success() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::TransientFailures(2))
        .build()
        .await
        .unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), State::LoggedIn);
    let observed = server.observed();
    assert_eq!(observed.logins, 3);
    assert_eq!(observed.connections, 3);
}

#[tokio::test]
async fn test_routing_reconnects_to_the_target() {
    let target = MockTdsServer::builder()
        .with_database("replica")
        .build()
        .await
        .unwrap();
    let gateway = MockTdsServer::builder()
        .with_login(LoginBehavior::Route {
            host: target.host(),
            port: target.port(),
        })
        .build()
        .await
        .unwrap();
    let conn = Connection::new(config_for(&gateway)).unwrap();
    let mut events = conn.subscribe();

    conn.connect().await.unwrap();
    let event = expect_event(&mut events, |e| matches!(e, ConnectionEvent::Rerouting { .. })).await;
    match event {
        ConnectionEvent::Rerouting { host, port } => {
            assert_eq!(host, target.host());
            assert_eq!(port, target.port());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(gateway.observed().logins, 1);
    assert_eq!(target.observed().logins, 1);
    assert_eq!(conn.session().database.as_deref(), Some("replica"));

    conn.execute_batch("select 1").await.unwrap();
    assert!(target.observed().batches.iter().any(|b| b == "select 1"));
}

#[tokio::test]
async fn test_server_requiring_encryption() {
    let server = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::Required)
        .build()
        .await
        .unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();
    let err = conn.connect().await.unwrap_err();
    match err {
        Error::Connect(message) => assert!(message.contains("requires encryption"), "{message}"),
        other => panic!("expected a connect error, got {other}"),
    }
    assert_eq!(server.observed().logins, 0);
}

#[tokio::test]
async fn test_server_without_encryption_still_logs_in() {
    let server = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::NotSupported)
        .build()
        .await
        .unwrap();
    let conn = Connection::new(config_for(&server).with_encrypt(true)).unwrap();
    let mut events = conn.subscribe();

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), State::LoggedIn);
    assert_eq!(server.observed().logins, 1);
    assert!(
        !drain(&mut events)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::SecureChannelEstablished))
    );
}

#[tokio::test]
async fn test_ntlm_login() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::Ntlm)
        .build()
        .await
        .unwrap();
    let auth = AuthenticationBuilder::new(AuthenticationType::Ntlm)
        .domain("corp")
        .username("alice")
        .password("pw")
        .build()
        .unwrap();
    let conn = Connection::new(config_for(&server).with_authentication(auth)).unwrap();

    conn.connect().await.unwrap();
    assert_eq!(server.observed().ntlm_responses, 1);
}

#[tokio::test]
async fn test_federated_login_fetches_a_token() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::FedAuth {
            sts_url: "https://login.example.com/tenant".into(),
            spn: "https://database.example.net/".into(),
        })
        .build()
        .await
        .unwrap();
    let auth = Authentication::builder(AuthenticationType::AzureAdServicePrincipalSecret)
        .client_id("app")
        .client_secret("secret")
        .tenant_id("tenant")
        .build()
        .unwrap();
    let config = config_for(&server)
        .with_authentication(auth)
        .with_token_provider(Arc::new(StaticTokenProvider::new("eyJ0b2tlbiI")));
    let conn = Connection::new(config).unwrap();

    conn.connect().await.unwrap();
    let observed = server.observed();
    assert!(observed.fed_auth_requested);
    assert_eq!(observed.fedauth_tokens, vec!["eyJ0b2tlbiI".to_string()]);
}

#[tokio::test]
async fn test_access_token_login_uses_the_standard_flow() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let config = config_for(&server).with_authentication(Authentication::access_token("tok"));
    let conn = Connection::new(config).unwrap();

    conn.connect().await.unwrap();
    let observed = server.observed();
    assert!(observed.fed_auth_requested);
    assert!(observed.fedauth_tokens.is_empty());
}

#[tokio::test]
async fn test_named_instance_lookup() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let browser = MockBrowser::start(vec![("SQLEXPRESS".into(), server.port())])
        .await
        .unwrap();
    let config = Config::from_connection_string(
        "Server=127.0.0.1\\sqlexpress;User Id=sa;Password=secret;Encrypt=false",
    )
    .unwrap()
    .with_instance_lookup_port(browser.port());
    assert_eq!(config.effective_port(), None);

    let conn = Connection::new(config).unwrap();
    conn.connect().await.unwrap();
    assert_eq!(browser.queries(), 1);
    assert_eq!(server.observed().logins, 1);
}

#[tokio::test]
async fn test_unknown_instance_fails_to_connect() {
    let browser = MockBrowser::start(Vec::new()).await.unwrap();
    let config = Config::new("127.0.0.1")
        .with_instance_name("MISSING")
        .with_instance_lookup_port(browser.port())
        .with_instance_lookup_timeout(Duration::from_millis(300));
    let conn = Connection::new(config).unwrap();

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)), "{err}");
    assert_eq!(browser.queries(), 3);
}

#[tokio::test]
async fn test_packet_size_from_server() {
    let server = MockTdsServer::builder()
        .with_packet_size(8000)
        .build()
        .await
        .unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();
    conn.connect().await.unwrap();
    assert_eq!(conn.session().packet_size, 8000);
}

#[tokio::test]
async fn test_older_server_lowers_the_version() {
    let server = MockTdsServer::builder()
        .with_tds_version(TdsVersion::V7_1)
        .build()
        .await
        .unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();
    conn.connect().await.unwrap();
    assert_eq!(conn.session().tds_version, TdsVersion::V7_1);

    let response = conn.execute_batch("select 1").await.unwrap();
    assert!(response.result_sets.is_empty());
}

#[tokio::test]
async fn test_dropping_every_handle_stops_the_driver() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let conn = Connection::new(config_for(&server)).unwrap();
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();
    drop(conn);

    expect_event(&mut events, |e| matches!(e, ConnectionEvent::Disconnected)).await;
}
