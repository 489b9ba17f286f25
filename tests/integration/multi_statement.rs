//! Multi-statement queries through both dispatcher variants

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use mysqlwire::config::Config;
use mysqlwire::protocol::status::SERVER_MORE_RESULTS_EXISTS;
use mysqlwire::protocol::{is_eof_packet, ColumnType, Field, PayloadReader, Value};
use mysqlwire::{Handler, MultiResultSink, QueryResult, ResultSink, Session, SqlError};

use crate::{listener, listener_with, ScriptedHandler, TestClient, CLIENT_CAPABILITIES};

const THREE_STATEMENTS: &str = "select 1; insert into t values (1); select 1";

fn multi_query_config() -> Config {
    let mut config = Config::default();
    config.server.multi_query = true;
    config
}

async fn assert_three_results(client: &mut TestClient) {
    let first = client.query(THREE_STATEMENTS).await.unwrap_rows();
    assert_eq!(first.rows.len(), 1);
    assert_ne!(first.status_flags & SERVER_MORE_RESULTS_EXISTS, 0);

    let ok = client.read_response().await.unwrap_ok();
    assert_eq!(ok.affected_rows, 1);
    assert_ne!(ok.status_flags & SERVER_MORE_RESULTS_EXISTS, 0);

    let last = client.read_response().await.unwrap_rows();
    assert_eq!(last.rows.len(), 1);
    assert_eq!(last.status_flags & SERVER_MORE_RESULTS_EXISTS, 0);

    // one sequence across all three: 5 packets, 1 OK, 5 packets
    assert_eq!(client.sequences, (1..=11).collect::<Vec<u8>>());
}

#[tokio::test]
async fn test_split_statements_each_get_a_result() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    assert_three_results(&mut client).await;
    client.ping().await.unwrap_ok();
}

#[tokio::test]
async fn test_split_statements_stop_at_first_error() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let first = client.query("select 1; fail; select 1").await.unwrap_rows();
    assert_ne!(first.status_flags & SERVER_MORE_RESULTS_EXISTS, 0);
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1146);

    // nothing from the third statement
    client.ping().await.unwrap_ok();
    assert_eq!(client.sequences, vec![1]);
}

#[tokio::test]
async fn test_streaming_multi_query() {
    let handler = ScriptedHandler::new();
    let listener = listener_with(handler, multi_query_config());
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    assert_three_results(&mut client).await;
    client.ping().await.unwrap_ok();
}

#[tokio::test]
async fn test_streaming_multi_query_error() {
    let handler = ScriptedHandler::new();
    let listener = listener_with(handler, multi_query_config());
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let first = client.query("select 1; fail; select 1").await.unwrap_rows();
    assert_ne!(first.status_flags & SERVER_MORE_RESULTS_EXISTS, 0);
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1146);

    client.ping().await.unwrap_ok();
}

#[tokio::test]
async fn test_streaming_multi_query_without_results() {
    let handler = ScriptedHandler::new();
    let listener = listener_with(handler, multi_query_config());
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let err = client.query("silent").await.unwrap_err();
    assert_eq!(err.error_code, 1105);
}

/// Raises its warning count while a multi-statement query runs
#[derive(Default)]
struct WarningHandler {
    warnings: AtomicU16,
}

#[async_trait]
impl Handler for WarningHandler {
    async fn com_query(&self, _session: &Session, _sql: &str, _sink: &mut dyn ResultSink) -> Result<(), SqlError> {
        Err(SqlError::unknown("only multi-query is served"))
    }

    async fn com_query_multi(
        &self,
        _session: &Session,
        _sql: &str,
        sink: &mut dyn MultiResultSink,
    ) -> Result<(), SqlError> {
        self.warnings.store(3, Ordering::SeqCst);
        let fields = vec![Field::new("n", ColumnType::LongLong)];
        sink.send(Ok(QueryResult::with_rows(fields, vec![vec![Value::Int(1)]])), false, true)
            .await
    }

    fn warning_count(&self, _session: &Session) -> u16 {
        self.warnings.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_streaming_multi_query_reports_current_warnings() {
    let handler = Arc::new(WarningHandler::default());
    let listener = listener_with(handler, multi_query_config());
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(b"\x03select n").await;
    // column count, definition, EOF, row, EOF
    let packets = [
        client.read_packet().await,
        client.read_packet().await,
        client.read_packet().await,
        client.read_packet().await,
        client.read_packet().await,
    ];
    let end = &packets[4];
    assert!(is_eof_packet(end, client.capabilities));
    assert_eq!(PayloadReader::at(end, 1).read_u16().unwrap(), 3);
}
