//! The command loop: one command packet per iteration, one response shape
//! per opcode.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BufMut;
use tracing::{debug, error, warn};

use crate::error::{codes, states, ConnError, SqlError};
use crate::handler::{BinlogStream, Handler, MultiResultSink, QueryResult, ResultSink};
use crate::metrics::metrics;
use crate::protocol::packet::capabilities::CLIENT_MULTI_STATEMENTS;
use crate::protocol::packet::status::{SERVER_MORE_RESULTS_EXISTS, SERVER_SESSION_STATE_CHANGED};
use crate::protocol::{
    BinlogDumpGtidRequest, BinlogDumpRequest, ClientCommand, Command, Field, OkPacket, PayloadReader,
    RegisterReplicaRequest,
};

use super::{Conn, ConnPhase, PrepareData};

/// How a query-class command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecResult {
    Success,
    /// An ERR packet was sent; the connection stays usable
    Failed,
    /// The connection has to go
    ConnErr,
}

impl Conn {
    /// Serve commands until the client quits, the connection breaks, or it
    /// was marked for close
    pub(crate) async fn run(&mut self, handler: &Arc<dyn Handler>) {
        while self.handle_next_command(handler).await {
            self.session.set_phase(ConnPhase::Idle);
        }
    }

    /// Returns false when the command loop should stop
    async fn handle_next_command(&mut self, handler: &Arc<dyn Handler>) -> bool {
        self.framer.reset_sequence();
        self.session.set_phase(ConnPhase::Reading);

        let data = match self.read_ephemeral_packet().await {
            Ok(data) => data,
            Err(e) => {
                // Disconnects are routine
                if !e.is_eof() {
                    error!(conn_id = self.id(), error = %e, "Error reading packet");
                    metrics().record_connection_error(e.kind());
                }
                return false;
            }
        };

        if self.session.is_marked_for_close() || data.is_empty() {
            self.recycle_read_packet(data);
            return false;
        }

        let opcode = data[0];
        let command = ClientCommand::parse(&data);
        self.recycle_read_packet(data);

        let name = Command::from(opcode).name();
        metrics().record_command(name);
        debug!(conn_id = self.id(), command = name, "Dispatching command");
        self.session.set_phase(ConnPhase::Dispatching);

        match command {
            ClientCommand::Quit => false,
            ClientCommand::InitDb(schema) => self.handle_init_db(handler, &schema).await,
            ClientCommand::Query(sql) => self.handle_query(handler, &sql).await,
            ClientCommand::Ping => self.handle_ping().await,
            ClientCommand::SetOption(operation) => self.handle_set_option(operation).await,
            ClientCommand::StmtPrepare(sql) => self.handle_prepare(handler, sql).await,
            ClientCommand::StmtExecute(payload) => self.handle_stmt_execute(handler, &payload).await,
            ClientCommand::StmtSendLongData(args) => self.handle_send_long_data(args).await,
            ClientCommand::StmtClose(stmt_id) => {
                if let Some(stmt_id) = stmt_id {
                    self.prepared.remove(&stmt_id);
                }
                true
            }
            ClientCommand::StmtReset(stmt_id) => self.handle_stmt_reset(opcode, stmt_id).await,
            ClientCommand::ResetConnection => self.handle_reset_connection(handler).await,
            ClientCommand::FieldList => self.write_err_and_log(unimplemented(opcode)).await,
            ClientCommand::BinlogDump(request) => match request {
                Some(request) => self.handle_binlog_dump(handler, BinlogRequest::Position(request)).await,
                None => {
                    error!(conn_id = self.id(), "Malformed COM_BINLOG_DUMP");
                    false
                }
            },
            ClientCommand::BinlogDumpGtid(request) => match request {
                Some(request) => self.handle_binlog_dump(handler, BinlogRequest::Gtid(request)).await,
                None => {
                    error!(conn_id = self.id(), "Malformed COM_BINLOG_DUMP_GTID");
                    false
                }
            },
            ClientCommand::RegisterReplica(request) => self.handle_register_replica(handler, request).await,
            ClientCommand::Unknown(opcode) => {
                warn!(conn_id = self.id(), opcode = opcode, "Got unhandled packet");
                self.write_err_and_log(unimplemented(opcode)).await
            }
        }
    }

    /// Send `err` to the client. Returns false if that failed.
    async fn write_err_and_log(&mut self, err: SqlError) -> bool {
        match self.write_err(&err).await {
            Ok(()) => true,
            Err(e) => {
                error!(conn_id = self.id(), error = %e, sql_error = %err, "Error writing error packet");
                false
            }
        }
    }

    /// Send an OK packet. Returns false if that failed.
    async fn write_ok_and_log(&mut self) -> bool {
        match self.write_ok().await {
            Ok(()) => true,
            Err(e) => {
                error!(conn_id = self.id(), error = %e, "Error writing OK packet");
                false
            }
        }
    }

    async fn handle_init_db(&mut self, handler: &Arc<dyn Handler>, schema: &str) -> bool {
        let session = self.session.clone();
        match handler.com_init_db(&session, schema).await {
            Ok(()) => {
                session.set_schema(schema);
                self.write_ok_and_log().await
            }
            Err(e) => self.write_err_and_log(e).await,
        }
    }

    async fn handle_ping(&mut self) -> bool {
        if self.ctx.shutdown.load(Ordering::Acquire) {
            self.write_err_and_log(SqlError::new(
                codes::ER_SERVER_SHUTDOWN,
                states::NET_ERROR,
                "Server shutdown in progress",
            ))
            .await
        } else {
            self.write_ok_and_log().await
        }
    }

    async fn handle_set_option(&mut self, operation: Option<u16>) -> bool {
        match operation {
            Some(0) => self.session.set_multi_statements(true),
            Some(1) => self.session.set_multi_statements(false),
            other => {
                error!(conn_id = self.id(), operation = ?other, "Got unhandled COM_SET_OPTION");
                return self
                    .write_err_and_log(SqlError::unknown_command(format!(
                        "error handling packet: COM_SET_OPTION {:?}",
                        other
                    )))
                    .await;
            }
        }
        match self.write_end_result(false, 0, 0, 0).await {
            Ok(()) => true,
            Err(e) => {
                error!(conn_id = self.id(), error = %e, "Error writing COM_SET_OPTION response");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // COM_QUERY
    // ------------------------------------------------------------------

    async fn handle_query(&mut self, handler: &Arc<dyn Handler>, sql: &str) -> bool {
        self.start_writer_buffering().await;
        let keep_going = self.dispatch_query(handler, sql).await;
        self.finish_buffering(keep_going).await
    }

    /// Close a buffered-write session opened by a command
    async fn finish_buffering(&mut self, keep_going: bool) -> bool {
        match self.end_writer_buffering().await {
            Ok(()) => keep_going,
            Err(e) => {
                if !e.is_eof() {
                    error!(conn_id = self.id(), error = %e, "Error flushing buffered writes");
                }
                false
            }
        }
    }

    async fn dispatch_query(&mut self, handler: &Arc<dyn Handler>, sql: &str) -> bool {
        if self.ctx.options.multi_query {
            return self.exec_query_multi(handler, sql).await != ExecResult::ConnErr;
        }

        let statements = if self.session.has_capability(CLIENT_MULTI_STATEMENTS) {
            let statements = handler.split_statements(sql);
            if statements.is_empty() {
                return self
                    .write_err_and_log(SqlError::new(
                        codes::ER_EMPTY_QUERY,
                        states::SYNTAX_OR_ACCESS,
                        "Query was empty",
                    ))
                    .await;
            }
            statements
        } else {
            vec![sql.to_string()]
        };

        let last = statements.len() - 1;
        for (index, statement) in statements.iter().enumerate() {
            match self.exec_query(handler, statement, index < last).await {
                ExecResult::Success => {}
                ExecResult::Failed => return true,
                ExecResult::ConnErr => return false,
            }
        }
        true
    }

    /// Run one statement through `Handler::com_query`
    async fn exec_query(&mut self, handler: &Arc<dyn Handler>, sql: &str, more: bool) -> ExecResult {
        let session = self.session.clone();
        let mut sink = QuerySink::new(self, more, RowFormat::Text);
        let result = handler.com_query(&session, sql, &mut sink).await;
        let warnings = handler.warning_count(&session);
        sink.finish(result, warnings).await
    }

    /// Run a whole multi-statement query through `Handler::com_query_multi`
    async fn exec_query_multi(&mut self, handler: &Arc<dyn Handler>, sql: &str) -> ExecResult {
        let session = self.session.clone();
        let mut sink = MultiQuerySink {
            conn: self,
            handler,
            callback_called: false,
            send_finished: false,
            needs_end_packet: false,
            fields: Vec::new(),
            errored: None,
            failed: None,
        };
        let result = handler.com_query_multi(&session, sql, &mut sink).await;
        sink.finish(result).await
    }

    // ------------------------------------------------------------------
    // Prepared statements
    // ------------------------------------------------------------------

    async fn handle_prepare(&mut self, handler: &Arc<dyn Handler>, sql: String) -> bool {
        let sql = if self.session.has_capability(CLIENT_MULTI_STATEMENTS) {
            let mut statements = handler.split_statements(&sql);
            if statements.len() != 1 {
                error!(conn_id = self.id(), "Can not prepare multiple statements");
                return self
                    .write_err_and_log(SqlError::unknown("can not prepare multiple statements"))
                    .await;
            }
            statements.remove(0)
        } else {
            sql
        };

        // Ids are consumed even when the prepare fails
        self.statement_id += 1;
        let statement_id = self.statement_id;

        let session = self.session.clone();
        let prepared = match handler.com_prepare(&session, &sql).await {
            Ok(prepared) => prepared,
            Err(e) => return self.write_err_and_log(e).await,
        };

        let mut prepare = PrepareData::new(statement_id, sql, prepared.param_count);
        if let Err(e) = self.write_prepare(&prepared.fields, &mut prepare).await {
            error!(conn_id = self.id(), error = %e, "Error writing prepare response");
            return false;
        }
        self.prepared.insert(statement_id, prepare);
        true
    }

    async fn handle_stmt_execute(&mut self, handler: &Arc<dyn Handler>, payload: &[u8]) -> bool {
        let Some(stmt_id) = PayloadReader::at(payload, 1).read_u32() else {
            return self
                .write_err_and_log(SqlError::new(
                    codes::ER_MALFORMED_PACKET,
                    states::UNKNOWN,
                    "reading statement ID failed",
                ))
                .await;
        };
        // Taken out of the table while the handler runs and put back with
        // a fresh bind-variable map
        let Some(mut prepare) = self.prepared.remove(&stmt_id) else {
            return self
                .write_err_and_log(SqlError::new(
                    codes::ER_UNKNOWN_STMT_HANDLER,
                    states::UNKNOWN,
                    format!("Unknown prepared statement handler ({}) given to mysqld_stmt_execute", stmt_id),
                ))
                .await;
        };

        let keep_going = match prepare.bind_execute(payload) {
            Ok(()) => {
                self.start_writer_buffering().await;
                let session = self.session.clone();
                let mut sink = QuerySink::new(self, false, RowFormat::Binary);
                let result = handler.com_stmt_execute(&session, &prepare, &mut sink).await;
                let warnings = handler.warning_count(&session);
                let exec = sink.finish(result, warnings).await;
                self.finish_buffering(exec != ExecResult::ConnErr).await
            }
            Err(e) => self.write_err_and_log(e).await,
        };

        prepare.renew_bind_vars();
        self.prepared.insert(stmt_id, prepare);
        keep_going
    }

    async fn handle_send_long_data(&mut self, args: Option<(u32, u16, Vec<u8>)>) -> bool {
        let Some((stmt_id, param_id, chunk)) = args else {
            return self
                .write_err_and_log(SqlError::unknown(format!(
                    "error parsing statement send long data from client {}",
                    self.id()
                )))
                .await;
        };
        let result = match self.prepared.get_mut(&stmt_id) {
            Some(prepare) => prepare.append_long_data(param_id, &chunk),
            None => Err(SqlError::unknown(format!(
                "got wrong statement id from client {}, statement ID({}) is not found from record",
                self.id(),
                stmt_id
            ))),
        };
        // No response on success
        match result {
            Ok(()) => true,
            Err(e) => self.write_err_and_log(e).await,
        }
    }

    async fn handle_stmt_reset(&mut self, opcode: u8, stmt_id: Option<u32>) -> bool {
        let Some(stmt_id) = stmt_id else {
            error!(conn_id = self.id(), "Got malformed COM_STMT_RESET");
            return self
                .write_err_and_log(SqlError::unknown_command(format!("error handling packet: {}", opcode)))
                .await;
        };
        match self.prepared.get_mut(&stmt_id) {
            Some(prepare) => {
                prepare.reset();
                self.write_ok_and_log().await
            }
            None => {
                self.write_err_and_log(SqlError::new(
                    codes::CR_COMMANDS_OUT_OF_SYNC,
                    states::UNKNOWN,
                    format!("commands were executed in an improper order: statement {}", stmt_id),
                ))
                .await
            }
        }
    }

    async fn handle_reset_connection(&mut self, handler: &Arc<dyn Handler>) -> bool {
        let session = self.session.clone();
        if let Err(e) = handler.com_reset_connection(&session).await {
            return self.write_err_and_log(e).await;
        }
        // The id counter keeps running
        self.prepared.clear();
        self.write_ok_and_log().await
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Stream a binlog dump inside a buffered-write session. A dump that
    /// fails cannot be reported in-band, so any error ends the connection.
    async fn handle_binlog_dump(&mut self, handler: &Arc<dyn Handler>, request: BinlogRequest) -> bool {
        self.start_writer_buffering().await;
        let session = self.session.clone();

        let mut stream = BinlogSink { conn: self, failed: None };
        let result = match &request {
            BinlogRequest::Position(request) => handler.com_binlog_dump(&session, request, &mut stream).await,
            BinlogRequest::Gtid(request) => handler.com_binlog_dump_gtid(&session, request, &mut stream).await,
        };
        let failed = stream.failed.take();

        let keep_going = match (result, failed) {
            (_, Some(e)) => {
                if !e.is_eof() {
                    error!(conn_id = self.id(), error = %e, "Error streaming binlog events");
                }
                false
            }
            (Err(e), None) => {
                error!(conn_id = self.id(), error = %e, "Binlog dump failed");
                false
            }
            (Ok(()), None) => true,
        };
        self.finish_buffering(keep_going).await
    }

    async fn handle_register_replica(
        &mut self,
        handler: &Arc<dyn Handler>,
        request: Option<RegisterReplicaRequest>,
    ) -> bool {
        let Some(request) = request else {
            error!(conn_id = self.id(), "Malformed COM_REGISTER_SLAVE");
            return false;
        };
        let session = self.session.clone();
        if let Err(e) = handler.com_register_replica(&session, &request).await {
            self.write_err_and_log(e).await;
            return false;
        }
        self.write_ok_and_log().await
    }
}

fn unimplemented(opcode: u8) -> SqlError {
    SqlError::unknown_command(format!("command handling not implemented yet: {}", opcode))
}

enum BinlogRequest {
    Position(BinlogDumpRequest),
    Gtid(BinlogDumpGtidRequest),
}

/// OK packet answering a write-only statement
fn ok_packet(result: &QueryResult, status_flags: u16, more: bool) -> OkPacket {
    let mut ok = OkPacket::new(status_flags);
    if more {
        ok.status_flags |= SERVER_MORE_RESULTS_EXISTS;
    }
    if !result.session_state_changes.is_empty() {
        ok.status_flags |= SERVER_SESSION_STATE_CHANGED;
    }
    ok.affected_rows = result.rows_affected;
    ok.last_insert_id = result.insert_id;
    ok.info = result.info.clone();
    ok.session_state_data = result.session_state_changes.clone();
    ok
}

/// Remember the first connection failure of a sink and turn it into the
/// error handed back to the handler
fn capture(failed: &mut Option<ConnError>, result: Result<(), ConnError>) -> Result<(), SqlError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            let err = match &e {
                ConnError::Sql(err) => err.clone(),
                _ => SqlError::server_lost(),
            };
            *failed = Some(e);
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RowFormat {
    Text,
    Binary,
}

/// Result sink for one statement of COM_QUERY or COM_STMT_EXECUTE
struct QuerySink<'a> {
    conn: &'a mut Conn,
    more: bool,
    format: RowFormat,
    fields: Vec<Field>,
    callback_called: bool,
    /// An OK packet already ended the statement
    send_finished: bool,
    failed: Option<ConnError>,
}

impl<'a> QuerySink<'a> {
    fn new(conn: &'a mut Conn, more: bool, format: RowFormat) -> Self {
        Self {
            conn,
            more,
            format,
            fields: Vec::new(),
            callback_called: false,
            send_finished: false,
            failed: None,
        }
    }

    async fn write_result(&mut self, result: QueryResult) -> Result<(), ConnError> {
        if self.send_finished {
            return Err(ConnError::Protocol("result sent after the statement finished".into()));
        }
        self.conn.session.set_phase(ConnPhase::Writing);

        if !self.callback_called {
            self.callback_called = true;
            if result.fields.is_empty() {
                self.send_finished = true;
                let ok = ok_packet(&result, self.conn.session.status_flags(), self.more);
                return self.conn.write_ok_packet(&ok).await;
            }
            self.conn.write_fields(&result.fields).await?;
            self.fields = result.fields;
        }

        match self.format {
            RowFormat::Text => self.conn.write_rows(&self.fields, &result.rows).await,
            RowFormat::Binary => self.conn.write_binary_rows(&self.fields, &result.rows).await,
        }
    }

    /// Settle the statement once the handler returned
    async fn finish(self, result: Result<(), SqlError>, warnings: u16) -> ExecResult {
        let conn = self.conn;
        if let Some(e) = self.failed {
            if !e.is_eof() {
                error!(conn_id = conn.id(), error = %e, "Error writing query results");
            }
            return ExecResult::ConnErr;
        }

        if !self.callback_called {
            let err = match result {
                Err(e) => e,
                Ok(()) => SqlError::unknown("unexpected: query ended without no results and no error"),
            };
            return if conn.write_err_and_log(err).await {
                ExecResult::Failed
            } else {
                ExecResult::ConnErr
            };
        }

        if let Err(e) = result {
            // No ERR can follow partial results; the client sees a lost connection
            error!(conn_id = conn.id(), error = %e, "Error in the middle of a stream");
            return ExecResult::ConnErr;
        }

        if !self.send_finished {
            if let Err(e) = conn.write_end_result(self.more, 0, 0, warnings).await {
                error!(conn_id = conn.id(), error = %e, "Error writing end of result set");
                return ExecResult::ConnErr;
            }
        }
        ExecResult::Success
    }
}

#[async_trait]
impl<'a> ResultSink for QuerySink<'a> {
    async fn send(&mut self, result: QueryResult) -> Result<(), SqlError> {
        if self.failed.is_some() {
            return Err(SqlError::server_lost());
        }
        let written = self.write_result(result).await;
        capture(&mut self.failed, written)
    }
}

/// Result sink spanning every statement of a multi-statement query
struct MultiQuerySink<'a> {
    conn: &'a mut Conn,
    /// Asked for the warning count whenever a result set ends
    handler: &'a Arc<dyn Handler>,
    callback_called: bool,
    send_finished: bool,
    /// The current statement streamed rows and still owes its end packet
    needs_end_packet: bool,
    fields: Vec<Field>,
    /// A statement failed and its ERR packet went out
    errored: Option<SqlError>,
    failed: Option<ConnError>,
}

impl<'a> MultiQuerySink<'a> {
    async fn write_response(
        &mut self,
        response: Result<QueryResult, SqlError>,
        more: bool,
        first_packet: bool,
    ) -> Result<(), ConnError> {
        self.callback_called = true;
        self.conn.session.set_phase(ConnPhase::Writing);

        if first_packet {
            if self.needs_end_packet {
                let warnings = self.handler.warning_count(&self.conn.session);
                self.conn.write_end_result(true, 0, 0, warnings).await?;
                self.needs_end_packet = false;
            }
            self.send_finished = false;
        }

        let result = match response {
            Ok(result) => result,
            Err(e) => {
                self.conn.write_err(&e).await?;
                self.errored = Some(e);
                return Ok(());
            }
        };

        if self.send_finished {
            return Err(ConnError::Protocol("result sent after the statement finished".into()));
        }

        if first_packet {
            if result.fields.is_empty() {
                self.send_finished = true;
                let ok = ok_packet(&result, self.conn.session.status_flags(), more);
                return self.conn.write_ok_packet(&ok).await;
            }
            self.conn.write_fields(&result.fields).await?;
            self.fields = result.fields;
        }

        self.needs_end_packet = true;
        self.conn.write_rows(&self.fields, &result.rows).await
    }

    async fn finish(self, result: Result<(), SqlError>) -> ExecResult {
        let conn = self.conn;
        if let Some(e) = self.failed {
            if !e.is_eof() {
                error!(conn_id = conn.id(), error = %e, "Error writing query results");
            }
            return ExecResult::ConnErr;
        }
        if self.errored.is_some() {
            return ExecResult::Failed;
        }

        if !self.callback_called {
            let err = match result {
                Err(e) => e,
                Ok(()) => SqlError::unknown("unexpected: query ended without no results and no error"),
            };
            return if conn.write_err_and_log(err).await {
                ExecResult::Failed
            } else {
                ExecResult::ConnErr
            };
        }

        if let Err(e) = result {
            if self.needs_end_packet {
                error!(conn_id = conn.id(), error = %e, "Error in the middle of a stream");
                return ExecResult::ConnErr;
            }
            return if conn.write_err_and_log(e).await {
                ExecResult::Failed
            } else {
                ExecResult::ConnErr
            };
        }

        if self.needs_end_packet {
            let warnings = self.handler.warning_count(&conn.session);
            if let Err(e) = conn.write_end_result(false, 0, 0, warnings).await {
                error!(conn_id = conn.id(), error = %e, "Error writing end of result set");
                return ExecResult::ConnErr;
            }
        }
        ExecResult::Success
    }
}

#[async_trait]
impl<'a> MultiResultSink for MultiQuerySink<'a> {
    async fn send(
        &mut self,
        response: Result<QueryResult, SqlError>,
        more: bool,
        first_packet: bool,
    ) -> Result<(), SqlError> {
        if self.failed.is_some() {
            return Err(SqlError::server_lost());
        }
        if let Some(e) = &self.errored {
            return Err(e.clone());
        }
        let written = self.write_response(response, more, first_packet).await;
        capture(&mut self.failed, written)?;
        match &self.errored {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Binlog event sink; every event goes out behind a 0x00 marker
struct BinlogSink<'a> {
    conn: &'a mut Conn,
    failed: Option<ConnError>,
}

#[async_trait]
impl<'a> BinlogStream for BinlogSink<'a> {
    async fn send_event(&mut self, event: &[u8]) -> Result<(), SqlError> {
        if self.failed.is_some() {
            return Err(SqlError::server_lost());
        }
        let written = self
            .conn
            .write_encoded(1 + event.len(), |dst| {
                dst.put_u8(0x00);
                dst.put_slice(event);
            })
            .await;
        capture(&mut self.failed, written)
    }

    async fn flush(&mut self) -> Result<(), SqlError> {
        if self.failed.is_some() {
            return Err(SqlError::server_lost());
        }
        let flushed = self.conn.flush().await;
        capture(&mut self.failed, flushed)
    }
}
