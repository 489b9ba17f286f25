//! COM_QUERY and the simple commands around it

use mysqlwire::protocol::capabilities::CLIENT_DEPRECATE_EOF;
use mysqlwire::protocol::status::SERVER_MORE_RESULTS_EXISTS;
use mysqlwire::protocol::{is_eof_packet, ColumnType};

use crate::{listener, Response, ScriptedHandler, TestClient, CLIENT_CAPABILITIES};

#[tokio::test]
async fn test_select_one_with_eof_packets() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let rs = client.query("select 1").await.unwrap_rows();
    assert_eq!(rs.fields.len(), 1);
    assert_eq!(rs.fields[0].name, "1");
    assert_eq!(rs.fields[0].column_type, ColumnType::LongLong);
    assert_eq!(rs.text_rows(), vec![vec![Some("1".to_string())]]);

    // count, column, EOF, row, EOF
    assert_eq!(client.sequences, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_select_one_with_deprecate_eof() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES | CLIENT_DEPRECATE_EOF).await;

    let rs = client.query("select 1").await.unwrap_rows();
    assert_eq!(rs.text_rows(), vec![vec![Some("1".to_string())]]);

    // count, column, row, OK
    assert_eq!(client.sequences, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_write_statement_gets_ok() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let ok = client.query("insert into t values (1)").await.unwrap_ok();
    assert_eq!(ok.affected_rows, 1);
    assert_eq!(ok.last_insert_id, 42);
    assert_eq!(client.sequences, vec![1]);
}

#[tokio::test]
async fn test_handler_error_keeps_connection() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let err = client.query("fail").await.unwrap_err();
    assert_eq!(err.error_code, 1146);
    assert_eq!(err.sql_state, "42S02");

    client.ping().await.unwrap_ok();
    let rs = client.query("select 1").await.unwrap_rows();
    assert_eq!(rs.rows.len(), 1);
}

#[tokio::test]
async fn test_query_without_results_is_an_error() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let err = client.query("silent").await.unwrap_err();
    assert_eq!(err.error_code, 1105);
    assert_eq!(
        err.error_message,
        "unexpected: query ended without no results and no error"
    );
}

#[tokio::test]
async fn test_rows_streamed_in_batches() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let rs = client.query("select rows 3").await.unwrap_rows();
    let values: Vec<_> = rs.text_rows().into_iter().map(|mut row| row.remove(0)).collect();
    assert_eq!(
        values,
        vec![Some("0".to_string()), Some("1".to_string()), Some("2".to_string())]
    );
}

#[tokio::test]
async fn test_error_after_rows_drops_connection() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(b"\x03fail after rows").await;
    client.read_packet().await; // column count
    client.read_packet().await; // column definition
    let eof = client.read_packet().await;
    assert!(is_eof_packet(&eof, client.capabilities));
    client.read_packet().await; // the one row

    assert!(client.is_closed().await);
    task.await.unwrap();
    assert_eq!(handler.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_init_db() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;
    let id = client.greeting.connection_id;

    client.command(b"\x02missing").await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1049);

    client.command(b"\x02shop").await;
    client.read_response().await.unwrap_ok();
    assert_eq!(listener.session(id).unwrap().schema(), "shop");
}

#[tokio::test]
async fn test_unsupported_command() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    // COM_FIELD_LIST
    client.command(b"\x04t\x00").await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1047);
    assert_eq!(err.sql_state, "08S01");

    client.ping().await.unwrap_ok();
}

#[tokio::test]
async fn test_empty_query() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let err = client.query(" ; ").await.unwrap_err();
    assert_eq!(err.error_code, 1065);
    assert_eq!(err.sql_state, "42000");
}

#[tokio::test]
async fn test_set_option_toggles_multi_statements() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    // MYSQL_OPTION_MULTI_STATEMENTS_OFF
    client.command(&[0x1b, 0x01, 0x00]).await;
    let eof = client.read_packet().await;
    assert!(is_eof_packet(&eof, client.capabilities));

    // the whole text now reaches the handler as one statement
    let err = client.query("select 1; select 1").await.unwrap_err();
    assert_eq!(err.error_code, 1064);

    client.command(&[0x1b, 0x00, 0x00]).await;
    client.read_packet().await;
    match client.query("select 1; select 1").await {
        Response::ResultSet(rs) => assert_ne!(rs.status_flags & SERVER_MORE_RESULTS_EXISTS, 0),
        other => panic!("unexpected response {:?}", other),
    }
    let rs = client.read_response().await.unwrap_rows();
    assert_eq!(rs.status_flags & SERVER_MORE_RESULTS_EXISTS, 0);

    client.command(&[0x1b, 0x07, 0x00]).await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1047);
}

#[tokio::test]
async fn test_packet_buffers_are_reused() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    for _ in 0..3 {
        client.query("select 1").await.unwrap_rows();
    }
    let stats = listener.pool().stats();
    assert!(stats.hits > 0, "pool never reused a buffer: {:?}", stats);
    assert_eq!(stats.oversized, 0);
}
