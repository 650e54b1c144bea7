//! PostgreSQL connection implementation.
//!
//! This module provides the connection type that handles:
//! - TCP connection establishment (with optional timeout)
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256)
//! - Simple query protocol for scripts and transaction control
//! - Extended query protocol with text-format parameters

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use super::error::{PgError, PgResult};
use super::protocol::*;
use super::scram::ScramClient;
use super::types::{decode_text, encode_text, Oid};
use crate::config::ClientConfig;
use crate::driver::DriverKind;
use crate::value::{Row, Value};

// ============================================================================
// Connection Configuration
// ============================================================================

/// PostgreSQL connection configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    /// Extra startup parameters
    pub parameters: Vec<(String, String)>,
    pub connect_timeout: Option<Duration>,
}

impl PgConfig {
    /// Derive the wire-level config from a client config.
    ///
    /// `database` overrides the configured database (used to reach the
    /// maintenance database for CREATE/DROP DATABASE).
    pub fn from_client(config: &ClientConfig, database: Option<&str>) -> Self {
        let mut parameters = vec![
            ("client_encoding".to_string(), client_encoding(&config.charset)),
            ("application_name".to_string(), "connkit".to_string()),
        ];
        for (key, value) in &config.options {
            // client-side knobs, not server GUCs
            if matches!(key.as_str(), "maintenance_db" | "sslmode") {
                continue;
            }
            match parameters.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.clone(),
                None => parameters.push((key.clone(), value.clone())),
            }
        }

        Self {
            host: config.host.clone(),
            port: config.resolved_port(DriverKind::Postgres).unwrap_or(5432),
            database: database.unwrap_or(&config.database).to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            parameters,
            connect_timeout: config.connect_timeout_duration(),
        }
    }
}

/// Map a MySQL-style charset name onto a PostgreSQL client encoding.
fn client_encoding(charset: &str) -> String {
    match charset.to_ascii_lowercase().as_str() {
        "utf8mb4" | "utf8" | "utf-8" => "UTF8".to_string(),
        "latin1" => "LATIN1".to_string(),
        other => other.to_uppercase(),
    }
}

// ============================================================================
// Query Result
// ============================================================================

/// Result of one statement.
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Column names, in result order
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    /// Rows affected, from the command tag.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    /// Generated key of an INSERT: the first column of the first row its
    /// RETURNING clause produced, when that column is an integer.
    pub fn returned_id(&self) -> Option<i64> {
        if !self.command_tag.starts_with("INSERT") {
            return None;
        }
        match self.rows.first()?.first()? {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    config: PgConfig,
    transaction_status: TransactionStatus,
    backend_pid: i32,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    closed: bool,
    read_buffer: BytesMut,
}

impl PgConnection {
    /// Connect and authenticate, honoring the configured connect timeout.
    pub async fn connect(config: PgConfig) -> PgResult<Self> {
        match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, Self::connect_inner(config))
                .await
                .map_err(|_| PgError::Timeout)?,
            None => Self::connect_inner(config).await,
        }
    }

    async fn connect_inner(config: PgConfig) -> PgResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            config,
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            parameters: HashMap::new(),
            closed: false,
            read_buffer: BytesMut::with_capacity(16384),
        };

        conn.startup().await?;
        tracing::debug!(host = %conn.config.host, database = %conn.config.database, pid = conn.backend_pid, "postgres connection established");
        Ok(conn)
    }

    fn password(&self) -> PgResult<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self) -> PgResult<()> {
        let startup = StartupMessage {
            user: self.config.user.clone(),
            database: Some(self.config.database.clone()),
            parameters: self.config.parameters.clone(),
        };
        self.send_message(&startup).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self.password()?.to_string();
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let password = md5_password(&self.config.user, self.password()?, &salt);
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(PgError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    self.authenticate_scram().await?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(error_from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    async fn authenticate_scram(&mut self) -> PgResult<()> {
        let mut scram = ScramClient::new(&self.config.user, self.password()?);
        let initial = SaslInitialResponseMessage {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: scram.client_first_message(),
        };
        self.send_message(&initial).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client_final = scram
                        .process_server_first(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    self.send_message(&SaslResponseMessage { data: client_final })
                        .await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    return scram
                        .verify_server_final(&data)
                        .map_err(|e| PgError::Auth(e.to_string()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(error_from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    /// Execute one or more statements with the simple query protocol.
    ///
    /// Used for scripts and transaction control. Values come back in text
    /// format and are decoded per column type.
    pub async fn simple_query(&mut self, query: &str) -> PgResult<Vec<QueryResult>> {
        self.ensure_open()?;
        self.send_message(&QueryMessage {
            query: query.to_string(),
        })
        .await?;

        let mut results = Vec::new();
        let mut current = QueryResult::default();
        let mut oids: Vec<Oid> = Vec::new();
        let mut failed: Option<PgError> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    oids = fields.iter().map(|f| f.type_oid).collect();
                    current.columns = fields.into_iter().map(|f| f.name).collect();
                }
                BackendMessage::DataRow { values } => {
                    collect_row(&mut current.rows, &values, &oids, &mut failed);
                }
                BackendMessage::CommandComplete { tag } => {
                    current.command_tag = tag;
                    results.push(std::mem::take(&mut current));
                    oids.clear();
                }
                BackendMessage::EmptyQueryResponse => {
                    results.push(QueryResult::default());
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match failed {
                        Some(e) => Err(e),
                        None => Ok(results),
                    };
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(error_from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    /// Execute a single parameterized statement with the extended protocol.
    ///
    /// Parse, Bind, Describe, Execute and Sync are pipelined in one flush on
    /// the unnamed statement and portal.
    pub async fn query(&mut self, query: &str, params: &[Value]) -> PgResult<QueryResult> {
        self.ensure_open()?;
        if params.len() > MAX_BIND_PARAMS {
            return Err(PgError::Protocol(format!(
                "{} parameters exceed the limit of {} per statement",
                params.len(),
                MAX_BIND_PARAMS
            )));
        }

        self.buffer_message(&ParseMessage {
            query: query.to_string(),
        })
        .await?;
        self.buffer_message(&BindMessage {
            params: params.iter().map(encode_text).collect(),
        })
        .await?;
        self.buffer_message(&DescribePortalMessage).await?;
        self.buffer_message(&ExecuteMessage).await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        let mut result = QueryResult::default();
        let mut oids: Vec<Oid> = Vec::new();
        let mut failed: Option<PgError> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::NoData => {}
                BackendMessage::RowDescription { fields } => {
                    oids = fields.iter().map(|f| f.type_oid).collect();
                    result.columns = fields.into_iter().map(|f| f.name).collect();
                }
                BackendMessage::DataRow { values } => {
                    collect_row(&mut result.rows, &values, &oids, &mut failed);
                }
                BackendMessage::CommandComplete { tag } => {
                    result.command_tag = tag;
                }
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match failed {
                        Some(e) => Err(e),
                        None => Ok(result),
                    };
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(error_from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    pub async fn begin(&mut self) -> PgResult<()> {
        self.simple_query("BEGIN").await?;
        Ok(())
    }

    pub async fn commit(&mut self) -> PgResult<()> {
        self.simple_query("COMMIT").await?;
        Ok(())
    }

    pub async fn rollback(&mut self) -> PgResult<()> {
        self.simple_query("ROLLBACK").await?;
        Ok(())
    }

    /// `CREATE DATABASE`; must run outside a transaction block, so callers
    /// connect to the maintenance database first.
    pub async fn create_database(&mut self, name: &str) -> PgResult<()> {
        self.simple_query(&format!("CREATE DATABASE {}", quote_ident(name)))
            .await?;
        Ok(())
    }

    pub async fn drop_database(&mut self, name: &str) -> PgResult<()> {
        self.simple_query(&format!("DROP DATABASE {}", quote_ident(name)))
            .await?;
        Ok(())
    }

    /// Close the connection.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send_message(&TerminateMessage).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn ensure_open(&self) -> PgResult<()> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        Ok(())
    }

    /// Send a frontend message (with flush).
    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.buffer_message(msg).await?;
        self.flush().await
    }

    /// Buffer a frontend message without flushing (for pipelining).
    async fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        let encoded = msg.encode();
        if let Err(e) = self.writer.write_all(&encoded).await {
            self.closed = true;
            return Err(PgError::Io(e));
        }
        Ok(())
    }

    async fn flush(&mut self) -> PgResult<()> {
        if let Err(e) = self.writer.flush().await {
            self.closed = true;
            return Err(PgError::Io(e));
        }
        Ok(())
    }

    /// Receive one backend message, reading more from the socket as needed.
    async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if self.read_buffer.len() >= 5 {
                let length = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]);
                if length < 4 {
                    self.closed = true;
                    return Err(PgError::Protocol(format!("Invalid message length: {}", length)));
                }
                // type byte + length (the length counts itself)
                let total_len = 1 + length as usize;
                if self.read_buffer.len() >= total_len {
                    let msg_bytes = self.read_buffer.split_to(total_len);
                    return BackendMessage::decode(&mut Bytes::from(msg_bytes));
                }
            }

            let mut buf = [0u8; 4096];
            let n = match self.reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.closed = true;
                    return Err(PgError::Io(e));
                }
            };
            if n == 0 {
                self.closed = true;
                return Err(PgError::ConnectionClosed);
            }
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }

    /// Drain messages until ReadyForQuery (after error).
    async fn drain_until_ready(&mut self) -> PgResult<()> {
        loop {
            if let BackendMessage::ReadyForQuery { status } = self.receive_message().await? {
                self.transaction_status = status;
                return Ok(());
            }
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn decode_row(values: &[Option<Bytes>], oids: &[Oid]) -> PgResult<Row> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| match value {
            Some(data) => decode_text(oids.get(i).copied().unwrap_or(Oid::TEXT), data),
            None => Ok(Value::Null),
        })
        .collect()
}

/// Decode a data row into `rows`. After the first failure the remaining
/// rows are skipped but still consumed, so the connection stays in step
/// with the server.
fn collect_row(rows: &mut Vec<Row>, values: &[Option<Bytes>], oids: &[Oid], failed: &mut Option<PgError>) {
    if failed.is_some() {
        return;
    }
    match decode_row(values, oids) {
        Ok(row) => rows.push(row),
        Err(e) => *failed = Some(e),
    }
}

/// Quote an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Compute MD5 password hash: `md5` + MD5(MD5(password + user) + salt).
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner_hex = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer_input = inner_hex.into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}

/// Parse the affected-row count from a command tag.
///
/// `INSERT 0 5` -> 5, `UPDATE 3` -> 3, `SELECT 7` -> 7, `CREATE TABLE` -> 0.
pub(crate) fn parse_rows_affected(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|last| last.parse().ok())
        .unwrap_or(0)
}
