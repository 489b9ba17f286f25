//! The capability interface between the connection engine and whatever
//! executes queries behind it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::conn::{PrepareData, Session};
use crate::error::SqlError;
use crate::protocol::{BinlogDumpGtidRequest, BinlogDumpRequest, Field, RegisterReplicaRequest, Value};

/// One batch of a statement's result.
///
/// The first batch of a statement carries the field list. An empty field
/// list marks a write-only statement, answered with an OK packet built from
/// `rows_affected`, `insert_id`, `info` and `session_state_changes`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    pub insert_id: u64,
    pub info: String,
    /// GTID set reported back through session tracking
    pub session_state_changes: String,
}

impl QueryResult {
    /// Result of a write-only statement
    pub fn affected(rows_affected: u64, insert_id: u64) -> Self {
        Self {
            rows_affected,
            insert_id,
            ..Default::default()
        }
    }

    pub fn with_rows(fields: Vec<Field>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            fields,
            rows,
            ..Default::default()
        }
    }
}

/// Receives the result batches of one statement.
///
/// An error from `send` means the connection can no longer carry the
/// result; the handler should stop and return it.
#[async_trait]
pub trait ResultSink: Send {
    async fn send(&mut self, result: QueryResult) -> Result<(), SqlError>;
}

/// Receives the results of a multi-statement query as one stream.
///
/// `first_packet` marks the first batch of each statement and `more` tells
/// whether further statements follow it. An `Err` response reports the
/// failure of the current statement; nothing after it is sent.
#[async_trait]
pub trait MultiResultSink: Send {
    async fn send(
        &mut self,
        response: Result<QueryResult, SqlError>,
        more: bool,
        first_packet: bool,
    ) -> Result<(), SqlError>;
}

/// Receives binlog events for a replication stream
#[async_trait]
pub trait BinlogStream: Send {
    /// Send one raw event, without the leading OK marker
    async fn send_event(&mut self, event: &[u8]) -> Result<(), SqlError>;

    async fn flush(&mut self) -> Result<(), SqlError>;
}

/// Credentials presented during the handshake
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub user: String,
    pub auth_method: String,
    pub auth_response: Vec<u8>,
    /// The challenge sent to the client
    pub salt: Vec<u8>,
    pub database: Option<String>,
}

/// What a successful COM_STMT_PREPARE reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrepareResult {
    pub param_count: u16,
    /// Result columns, empty for statements without a result set
    pub fields: Vec<Field>,
}

/// Query execution behind the connection engine.
///
/// One handler instance serves every connection of a listener; per-connection
/// data belongs in [`Session::set_client_data`]. Only `com_query` is required.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// A socket was accepted, before the handshake
    fn new_connection(&self, _session: &Arc<Session>) {}

    /// The handshake succeeded and the command loop is about to start
    fn connection_ready(&self, _session: &Arc<Session>) {}

    /// The connection is gone; called exactly once per `new_connection`
    fn connection_closed(&self, _session: &Arc<Session>) {}

    async fn authenticate(&self, _session: &Session, _request: &AuthRequest) -> Result<(), SqlError> {
        Ok(())
    }

    /// Switch the default schema (COM_INIT_DB or the handshake database)
    async fn com_init_db(&self, _session: &Session, _schema: &str) -> Result<(), SqlError> {
        Ok(())
    }

    async fn com_query(&self, session: &Session, sql: &str, sink: &mut dyn ResultSink) -> Result<(), SqlError>;

    /// Run a whole multi-statement query. Used instead of splitting when
    /// the listener is configured for multi-query streaming.
    async fn com_query_multi(
        &self,
        _session: &Session,
        _sql: &str,
        _sink: &mut dyn MultiResultSink,
    ) -> Result<(), SqlError> {
        Err(SqlError::unknown_command("multi-statement streaming is not supported"))
    }

    async fn com_prepare(&self, _session: &Session, _sql: &str) -> Result<PrepareResult, SqlError> {
        Err(SqlError::unknown_command("prepared statements are not supported"))
    }

    async fn com_stmt_execute(
        &self,
        _session: &Session,
        _stmt: &PrepareData,
        _sink: &mut dyn ResultSink,
    ) -> Result<(), SqlError> {
        Err(SqlError::unknown_command("prepared statements are not supported"))
    }

    async fn com_reset_connection(&self, _session: &Session) -> Result<(), SqlError> {
        Ok(())
    }

    async fn com_binlog_dump(
        &self,
        _session: &Session,
        _request: &BinlogDumpRequest,
        _stream: &mut dyn BinlogStream,
    ) -> Result<(), SqlError> {
        Err(SqlError::unknown_command("binlog dump is not supported"))
    }

    async fn com_binlog_dump_gtid(
        &self,
        _session: &Session,
        _request: &BinlogDumpGtidRequest,
        _stream: &mut dyn BinlogStream,
    ) -> Result<(), SqlError> {
        Err(SqlError::unknown_command("binlog dump is not supported"))
    }

    async fn com_register_replica(&self, _session: &Session, _request: &RegisterReplicaRequest) -> Result<(), SqlError> {
        Err(SqlError::unknown_command("replica registration is not supported"))
    }

    /// Warnings reported in the terminal packet of a result set
    fn warning_count(&self, _session: &Session) -> u16 {
        0
    }

    /// Split a multi-statement query into its statements
    fn split_statements(&self, sql: &str) -> Vec<String> {
        split_statements(sql)
    }
}

/// Split `sql` on top-level semicolons.
///
/// Quoted strings, quoted identifiers and comments are skipped over.
/// Pieces are trimmed and empty ones dropped, so a blank query yields no
/// statements at all.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;

    let mut push = |piece: &str| {
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b';' => {
                push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < sql.len() {
        push(&sql[start..]);
    }
    pieces
}
