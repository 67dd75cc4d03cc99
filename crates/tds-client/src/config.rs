//! Connection configuration.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tds_auth::{Authentication, AuthenticationBuilder, AuthenticationType, TokenProvider};
use tds_protocol::{IsolationLevel, TdsVersion};

use crate::error::Error;

/// Port used when neither a port nor an instance name is configured.
pub const DEFAULT_PORT: u16 = 1433;

/// SQL Browser UDP port.
pub const SQL_BROWSER_PORT: u16 = 1434;

const DATE_FORMATS: [&str; 6] = ["mdy", "dmy", "ymd", "ydm", "myd", "dym"];

/// Configuration for a [`Connection`](crate::Connection).
///
/// Read-only once the connection has been created.
#[derive(Clone)]
pub struct Config {
    /// Server host name or address.
    pub server: String,
    /// TCP port. Mutually exclusive with `instance_name`.
    pub port: Option<u16>,
    /// Named instance, resolved through SQL Browser.
    pub instance_name: Option<String>,
    /// Initial database.
    pub database: Option<String>,
    /// Credentials.
    pub authentication: Authentication,
    /// Bearer token source for Azure AD logins.
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Application name reported to the server.
    pub application_name: String,
    /// Workstation name reported to the server.
    pub workstation_id: Option<String>,
    /// Session language.
    pub language: String,
    /// `SET DATEFORMAT` value.
    pub date_format: String,
    /// `SET DATEFIRST` value (1-7).
    pub date_first: u8,
    /// Session isolation level.
    pub isolation_level: IsolationLevel,
    /// `SET TEXTSIZE` value; -1 means unlimited.
    pub text_size: i64,
    /// Requested packet size.
    pub packet_size: u32,
    /// Requested TDS version.
    pub tds_version: TdsVersion,
    /// Require TLS.
    pub encrypt: bool,
    /// Skip certificate validation.
    pub trust_server_certificate: bool,
    /// Bound on one connection attempt, up to the end of the initial SQL.
    pub connect_timeout: Duration,
    /// Default per-request timeout; zero disables it.
    pub request_timeout: Duration,
    /// Bound on waiting for an attention acknowledgement.
    pub cancel_timeout: Duration,
    /// Delay before retrying a transient login failure.
    pub connection_retry_interval: Duration,
    /// Retries allowed after transient login failures.
    pub max_retries_on_transient_errors: u32,
    /// Race all resolved addresses instead of trying them in order.
    pub multi_subnet_failover: bool,
    /// Bound on SQL Browser instance discovery.
    pub instance_lookup_timeout: Duration,
    /// UDP port of the SQL Browser service.
    pub instance_lookup_port: u16,
    /// Local address to bind before connecting.
    pub local_address: Option<IpAddr>,
    /// `SET XACT_ABORT`; unset leaves the server default.
    pub abort_transaction_on_error: Option<bool>,
    /// `SET ANSI_NULLS`.
    pub enable_ansi_null: bool,
    /// `SET ANSI_NULL_DFLT_ON`.
    pub enable_ansi_null_default: bool,
    /// `SET ANSI_PADDING`.
    pub enable_ansi_padding: bool,
    /// `SET ANSI_WARNINGS`.
    pub enable_ansi_warnings: bool,
    /// `SET CONCAT_NULL_YIELDS_NULL`.
    pub enable_concat_null_yields_null: bool,
    /// `SET CURSOR_CLOSE_ON_COMMIT`; unset leaves the server default.
    pub enable_cursor_close_on_commit: Option<bool>,
    /// `SET IMPLICIT_TRANSACTIONS`.
    pub enable_implicit_transactions: bool,
    /// `SET NUMERIC_ROUNDABORT`.
    pub enable_numeric_roundabort: bool,
    /// `SET QUOTED_IDENTIFIER`.
    pub enable_quoted_identifier: bool,
    /// `SET ARITHABORT`.
    pub enable_arith_abort: bool,
    /// Declare a read-only workload to availability groups.
    pub read_only_intent: bool,
    /// Publish [`ConnectionEvent::DebugTrace`](crate::ConnectionEvent) notifications.
    pub debug_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: None,
            instance_name: None,
            database: None,
            authentication: Authentication::default(),
            token_provider: None,
            application_name: "tds-client".into(),
            workstation_id: None,
            language: "us_english".into(),
            date_format: "mdy".into(),
            date_first: 7,
            isolation_level: IsolationLevel::ReadCommitted,
            text_size: -1,
            packet_size: 4096,
            tds_version: TdsVersion::V7_4,
            encrypt: true,
            trust_server_certificate: false,
            connect_timeout: Duration::from_millis(15_000),
            request_timeout: Duration::from_millis(15_000),
            cancel_timeout: Duration::from_millis(5_000),
            connection_retry_interval: Duration::from_millis(500),
            max_retries_on_transient_errors: 3,
            multi_subnet_failover: false,
            instance_lookup_timeout: Duration::from_millis(10_000),
            instance_lookup_port: SQL_BROWSER_PORT,
            local_address: None,
            abort_transaction_on_error: None,
            enable_ansi_null: true,
            enable_ansi_null_default: true,
            enable_ansi_padding: true,
            enable_ansi_warnings: true,
            enable_concat_null_yields_null: true,
            enable_cursor_close_on_commit: None,
            enable_implicit_transactions: false,
            enable_numeric_roundabort: false,
            enable_quoted_identifier: true,
            enable_arith_abort: true,
            read_only_intent: false,
            debug_events: false,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("instance_name", &self.instance_name)
            .field("database", &self.database)
            .field("authentication", &self.authentication)
            .field("token_provider", &self.token_provider.as_ref().map(|_| "..."))
            .field("encrypt", &self.encrypt)
            .field("tds_version", &self.tds_version)
            .field("packet_size", &self.packet_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Configuration for `server` with every option at its default.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    /// Parse an ADO.NET style connection string.
    ///
    /// ```text
    /// Server=db01,1433;Database=app;User Id=sa;Password=secret;Encrypt=true
    /// ```
    ///
    /// `Server=host\instance` selects a named instance. Timeouts are in
    /// seconds. The result is validated.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        let mut username = None;
        let mut password = None;
        let mut domain = None;

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "server" | "data source" | "address" => {
                    let value = value.strip_prefix("tcp:").unwrap_or(value);
                    if let Some((host, port)) = value.split_once(',') {
                        config.server = host.trim().to_string();
                        config.port = Some(parse_port(port.trim())?);
                    } else if let Some((host, instance)) = value.split_once('\\') {
                        config.server = host.to_string();
                        config.instance_name = Some(instance.to_string());
                    } else {
                        config.server = value.to_string();
                    }
                }
                "port" => config.port = Some(parse_port(value)?),
                "database" | "initial catalog" => config.database = Some(value.to_string()),
                "user id" | "uid" | "user" => username = Some(value.to_string()),
                "password" | "pwd" => password = Some(value.to_string()),
                "domain" => domain = Some(value.to_string()),
                "application name" | "app" => config.application_name = value.to_string(),
                "workstation id" | "wsid" => config.workstation_id = Some(value.to_string()),
                "language" | "current language" => config.language = value.to_string(),
                "connect timeout" | "connection timeout" | "timeout" => {
                    config.connect_timeout = parse_seconds(value)?;
                }
                "command timeout" | "request timeout" => {
                    config.request_timeout = parse_seconds(value)?;
                }
                "encrypt" => config.encrypt = parse_bool(&key, value)?,
                "trustservercertificate" | "trust server certificate" => {
                    config.trust_server_certificate = parse_bool(&key, value)?;
                }
                "multisubnetfailover" | "multi subnet failover" => {
                    config.multi_subnet_failover = parse_bool(&key, value)?;
                }
                "applicationintent" | "application intent" => {
                    config.read_only_intent = value.eq_ignore_ascii_case("readonly");
                }
                "packet size" => {
                    config.packet_size = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid packet size: {value}")))?;
                }
                "connectretrycount" | "connect retry count" => {
                    config.max_retries_on_transient_errors = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid retry count: {value}")))?;
                }
                "connectretryinterval" | "connect retry interval" => {
                    config.connection_retry_interval = parse_seconds(value)?;
                }
                "tds version" => {
                    config.tds_version = TdsVersion::parse(value)
                        .ok_or_else(|| Error::Config(format!("unsupported TDS version: {value}")))?;
                }
                _ => {
                    tracing::debug!(key = %key, "ignoring unknown connection string key");
                }
            }
        }

        config.authentication = match domain {
            Some(domain) => {
                let mut builder = AuthenticationBuilder::new(AuthenticationType::Ntlm).domain(domain);
                if let Some(username) = username {
                    builder = builder.username(username);
                }
                if let Some(password) = password {
                    builder = builder.password(password);
                }
                builder.build()?
            }
            None => Authentication::Default { username, password },
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the server.
    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    /// Set the TCP port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Connect to a named instance.
    #[must_use]
    pub fn with_instance_name(mut self, instance: impl Into<String>) -> Self {
        self.instance_name = Some(instance.into());
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    /// Set the bearer token source for Azure AD logins.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the workstation name.
    #[must_use]
    pub fn with_workstation_id(mut self, id: impl Into<String>) -> Self {
        self.workstation_id = Some(id.into());
        self
    }

    /// Set the session language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set `DATEFORMAT`.
    #[must_use]
    pub fn with_date_format(mut self, format: impl Into<String>) -> Self {
        self.date_format = format.into();
        self
    }

    /// Set `DATEFIRST`.
    #[must_use]
    pub fn with_date_first(mut self, day: u8) -> Self {
        self.date_first = day;
        self
    }

    /// Set the session isolation level.
    #[must_use]
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Set `TEXTSIZE`.
    #[must_use]
    pub fn with_text_size(mut self, size: i64) -> Self {
        self.text_size = size;
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, size: u32) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the requested TDS version.
    #[must_use]
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Require or disable TLS.
    #[must_use]
    pub fn with_encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Skip certificate validation.
    #[must_use]
    pub fn with_trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the cancel timeout.
    #[must_use]
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Set the delay between transient retries.
    #[must_use]
    pub fn with_connection_retry_interval(mut self, interval: Duration) -> Self {
        self.connection_retry_interval = interval;
        self
    }

    /// Set the number of transient retries.
    #[must_use]
    pub fn with_max_retries_on_transient_errors(mut self, retries: u32) -> Self {
        self.max_retries_on_transient_errors = retries;
        self
    }

    /// Race all resolved addresses.
    #[must_use]
    pub fn with_multi_subnet_failover(mut self, enabled: bool) -> Self {
        self.multi_subnet_failover = enabled;
        self
    }

    /// Set the instance discovery timeout.
    #[must_use]
    pub fn with_instance_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.instance_lookup_timeout = timeout;
        self
    }

    /// Set the SQL Browser port.
    #[must_use]
    pub fn with_instance_lookup_port(mut self, port: u16) -> Self {
        self.instance_lookup_port = port;
        self
    }

    /// Bind to a local address before connecting.
    #[must_use]
    pub fn with_local_address(mut self, address: IpAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    /// Set `XACT_ABORT`.
    #[must_use]
    pub fn with_abort_transaction_on_error(mut self, abort: bool) -> Self {
        self.abort_transaction_on_error = Some(abort);
        self
    }

    /// Set `CURSOR_CLOSE_ON_COMMIT`.
    #[must_use]
    pub fn with_cursor_close_on_commit(mut self, enabled: bool) -> Self {
        self.enable_cursor_close_on_commit = Some(enabled);
        self
    }

    /// Set `IMPLICIT_TRANSACTIONS`.
    #[must_use]
    pub fn with_implicit_transactions(mut self, enabled: bool) -> Self {
        self.enable_implicit_transactions = enabled;
        self
    }

    /// Set `QUOTED_IDENTIFIER`.
    #[must_use]
    pub fn with_quoted_identifier(mut self, enabled: bool) -> Self {
        self.enable_quoted_identifier = enabled;
        self
    }

    /// Declare a read-only workload.
    #[must_use]
    pub fn with_read_only_intent(mut self, read_only: bool) -> Self {
        self.read_only_intent = read_only;
        self
    }

    /// Publish debug trace notifications.
    #[must_use]
    pub fn with_debug_events(mut self, enabled: bool) -> Self {
        self.debug_events = enabled;
        self
    }

    /// Check every option before any I/O.
    pub fn validate(&self) -> Result<(), Error> {
        if self.server.trim().is_empty() {
            return Err(Error::Config("server must not be empty".into()));
        }
        if let (Some(port), Some(instance)) = (self.port, &self.instance_name) {
            return Err(Error::Config(format!(
                "port and instance name are mutually exclusive, but {port} and {instance} provided"
            )));
        }
        if self.port == Some(0) {
            return Err(Error::Config("port must be between 1 and 65535".into()));
        }
        if self.instance_name.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Config("instance name must not be empty".into()));
        }
        if !(512..=32767).contains(&self.packet_size) {
            return Err(Error::Config(format!(
                "packet size {} is outside 512..=32767",
                self.packet_size
            )));
        }
        if !(-1..=i64::from(i32::MAX)).contains(&self.text_size) {
            return Err(Error::Config(format!(
                "text size {} is outside -1..=2147483647",
                self.text_size
            )));
        }
        if !(1..=7).contains(&self.date_first) {
            return Err(Error::Config(format!(
                "date first {} is outside 1..=7",
                self.date_first
            )));
        }
        if !DATE_FORMATS.contains(&self.date_format.as_str()) {
            return Err(Error::Config(format!(
                "date format {:?} is not one of {}",
                self.date_format,
                DATE_FORMATS.join(", ")
            )));
        }
        if self.language.trim().is_empty() {
            return Err(Error::Config("language must not be empty".into()));
        }
        Ok(())
    }

    /// Port to connect to when no instance lookup is needed.
    #[must_use]
    pub fn effective_port(&self) -> Option<u16> {
        match (self.port, &self.instance_name) {
            (Some(port), _) => Some(port),
            (None, None) => Some(DEFAULT_PORT),
            (None, Some(_)) => None,
        }
    }

    /// Session settings sent right after login.
    #[must_use]
    pub fn initial_sql(&self) -> String {
        let on_off = |enabled: bool| if enabled { "on" } else { "off" };
        let mut statements = vec![
            format!("set textsize {}", self.text_size),
            format!("set quoted_identifier {}", on_off(self.enable_quoted_identifier)),
            format!("set arithabort {}", on_off(self.enable_arith_abort)),
            format!("set numeric_roundabort {}", on_off(self.enable_numeric_roundabort)),
            format!("set ansi_null_dflt_on {}", on_off(self.enable_ansi_null_default)),
            format!("set ansi_nulls {}", on_off(self.enable_ansi_null)),
            format!("set ansi_padding {}", on_off(self.enable_ansi_padding)),
            format!("set ansi_warnings {}", on_off(self.enable_ansi_warnings)),
            format!(
                "set concat_null_yields_null {}",
                on_off(self.enable_concat_null_yields_null)
            ),
        ];
        if let Some(enabled) = self.enable_cursor_close_on_commit {
            statements.push(format!("set cursor_close_on_commit {}", on_off(enabled)));
        }
        statements.push(format!("set datefirst {}", self.date_first));
        statements.push(format!("set dateformat {}", self.date_format));
        statements.push(format!(
            "set implicit_transactions {}",
            on_off(self.enable_implicit_transactions)
        ));
        statements.push(format!("set language {}", self.language));
        statements.push(format!(
            "set transaction isolation level {}",
            self.isolation_level.as_sql().to_lowercase()
        ));
        if let Some(abort) = self.abort_transaction_on_error {
            statements.push(format!("set xact_abort {}", on_off(abort)));
        }
        statements.join("\n")
    }
}

fn parse_port(value: &str) -> Result<u16, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid port: {value}")))
}

fn parse_seconds(value: &str) -> Result<Duration, Error> {
    value
        .parse()
        .map(Duration::from_secs)
        .map_err(|_| Error::Config(format!("invalid timeout: {value}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "strict" | "mandatory" => Ok(true),
        "false" | "no" | "0" | "optional" => Ok(false),
        _ => Err(Error::Config(format!("invalid value for {key}: {value}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("db01");
        assert_eq!(config.effective_port(), Some(DEFAULT_PORT));
        assert!(config.encrypt);
        assert_eq!(config.request_timeout, Duration::from_millis(15_000));
        assert_eq!(config.cancel_timeout, Duration::from_millis(5_000));
        assert_eq!(config.connect_timeout, Duration::from_millis(15_000));
        assert_eq!(config.packet_size, 4096);
        assert_eq!(config.max_retries_on_transient_errors, 3);
        assert_eq!(config.text_size, -1);
        assert_eq!(config.tds_version, TdsVersion::V7_4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_and_instance_conflict() {
        let err = Config::new("db01")
            .with_port(1433)
            .with_instance_name("X")
            .validate()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("1433"));
        assert!(message.contains('X'));
    }

    #[test]
    fn test_text_size_range() {
        for ok in [-1, 0, 2_147_483_647] {
            assert!(Config::new("h").with_text_size(ok).validate().is_ok());
        }
        for bad in [-2, 2_147_483_648] {
            assert!(matches!(
                Config::new("h").with_text_size(bad).validate(),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn test_range_checks() {
        assert!(Config::new("h").with_packet_size(511).validate().is_err());
        assert!(Config::new("h").with_packet_size(32768).validate().is_err());
        assert!(Config::new("h").with_port(0).validate().is_err());
        assert!(Config::new("h").with_date_first(0).validate().is_err());
        assert!(Config::new("h").with_date_first(8).validate().is_err());
        assert!(Config::new("h").with_date_format("mmm").validate().is_err());
        assert!(Config::new("  ").validate().is_err());
    }

    #[test]
    fn test_instance_needs_discovery() {
        let config = Config::new("db01").with_instance_name("SQLEXPRESS");
        assert_eq!(config.effective_port(), None);
    }

    #[test]
    fn test_connection_string() {
        let config = Config::from_connection_string(
            "Server=tcp:db01,1444;Database=app;User Id=sa;Password=secret;\
             Encrypt=false;TrustServerCertificate=yes;Application Name=svc;Connect Timeout=5",
        )
        .unwrap();
        assert_eq!(config.server, "db01");
        assert_eq!(config.port, Some(1444));
        assert_eq!(config.database.as_deref(), Some("app"));
        assert!(!config.encrypt);
        assert!(config.trust_server_certificate);
        assert_eq!(config.application_name, "svc");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(matches!(
            config.authentication,
            Authentication::Default { username: Some(ref u), .. } if u == "sa"
        ));
    }

    #[test]
    fn test_connection_string_instance_and_ntlm() {
        let config = Config::from_connection_string(
            "Data Source=db01\\SQLEXPRESS;User Id=alice;Password=pw;Domain=corp",
        )
        .unwrap();
        assert_eq!(config.instance_name.as_deref(), Some("SQLEXPRESS"));
        assert_eq!(config.port, None);
        assert_eq!(config.authentication.auth_type(), AuthenticationType::Ntlm);
    }

    #[test]
    fn test_connection_string_errors() {
        assert!(Config::from_connection_string("Server=db01;Port=abc").is_err());
        assert!(Config::from_connection_string("Server=db01;garbage").is_err());
        assert!(Config::from_connection_string("Server=db01;Encrypt=maybe").is_err());
        assert!(Config::from_connection_string("Server=db01\\X;Port=1433").is_err());
    }

    #[test]
    fn test_initial_sql() {
        let sql = Config::new("h")
            .with_abort_transaction_on_error(true)
            .with_isolation_level(IsolationLevel::Snapshot)
            .initial_sql();
        assert!(sql.starts_with("set textsize -1\n"));
        assert!(sql.contains("set ansi_nulls on"));
        assert!(sql.contains("set dateformat mdy"));
        assert!(sql.contains("set transaction isolation level snapshot"));
        assert!(sql.ends_with("set xact_abort on"));
        assert!(!sql.contains("cursor_close_on_commit"));
    }
}
