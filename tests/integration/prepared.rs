//! Prepared statements over the binary protocol

use bytes::BufMut;

use mysqlwire::protocol::codec::PayloadReader;
use mysqlwire::protocol::{is_eof_packet, is_ok_packet, Field};

use crate::{listener, ScriptedHandler, TestClient, CLIENT_CAPABILITIES};

struct Prepared {
    statement_id: u32,
    params: Vec<Field>,
    columns: Vec<Field>,
}

async fn prepare(client: &mut TestClient, sql: &str) -> Prepared {
    let mut payload = vec![0x16];
    payload.extend_from_slice(sql.as_bytes());
    client.command(&payload).await;

    let header = client.read_packet().await;
    assert!(is_ok_packet(&header), "prepare failed: {:?}", header);
    assert_eq!(header.len(), 12);
    let mut r = PayloadReader::at(&header, 1);
    let statement_id = r.read_u32().unwrap();
    let column_count = r.read_u16().unwrap();
    let param_count = r.read_u16().unwrap();

    let mut params = Vec::new();
    for _ in 0..param_count {
        params.push(Field::parse(&client.read_packet().await).unwrap());
    }
    if param_count > 0 {
        assert!(is_eof_packet(&client.read_packet().await, client.capabilities));
    }
    let mut columns = Vec::new();
    for _ in 0..column_count {
        columns.push(Field::parse(&client.read_packet().await).unwrap());
    }
    if column_count > 0 {
        assert!(is_eof_packet(&client.read_packet().await, client.capabilities));
    }

    Prepared { statement_id, params, columns }
}

/// COM_STMT_EXECUTE with every parameter bound as (type, value bytes)
fn execute_payload(statement_id: u32, params: &[(u8, &[u8])]) -> Vec<u8> {
    let mut buf = vec![0x17];
    buf.put_u32_le(statement_id);
    buf.put_u8(0);
    buf.put_u32_le(1);
    if !params.is_empty() {
        buf.put_bytes(0, (params.len() + 7) / 8);
        buf.put_u8(1);
        for (ty, _) in params {
            buf.put_u8(*ty);
            buf.put_u8(0);
        }
        for (_, value) in params {
            buf.put_slice(value);
        }
    }
    buf
}

fn lenenc_str(s: &[u8]) -> Vec<u8> {
    let mut buf = vec![s.len() as u8];
    buf.extend_from_slice(s);
    buf
}

#[tokio::test]
async fn test_prepare_response() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let stmt = prepare(&mut client, "select ?, ?").await;
    assert_eq!(stmt.statement_id, 1);
    assert_eq!(stmt.params.len(), 2);
    assert_eq!(stmt.params[0].name, "?");
    assert_eq!(stmt.params[0].charset, 63);
    let names: Vec<_> = stmt.columns.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["?0", "?1"]);

    let second = prepare(&mut client, "select ?").await;
    assert_eq!(second.statement_id, 2);
}

#[tokio::test]
async fn test_execute_returns_binary_rows() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let stmt = prepare(&mut client, "select ?, ?").await;
    let payload = execute_payload(
        stmt.statement_id,
        &[(0x08, &(-7i64).to_le_bytes()), (0xfd, &lenenc_str(b"abc"))],
    );
    client.command(&payload).await;
    let rs = client.read_response().await.unwrap_rows();
    assert_eq!(rs.rows.len(), 1);

    let row = &rs.rows[0];
    let mut r = PayloadReader::new(row);
    assert_eq!(r.read_u8(), Some(0x00));
    assert_eq!(r.read_u8(), Some(0x00)); // no NULLs
    assert_eq!(r.read_u64(), Some((-7i64) as u64));
    assert_eq!(r.read_lenenc_bytes(), Some(&b"abc"[..]));
    assert!(r.is_empty());

    // the statement stays prepared
    client.command(&payload).await;
    client.read_response().await.unwrap_rows();
}

#[tokio::test]
async fn test_execute_null_parameter() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let stmt = prepare(&mut client, "select ?").await;
    let mut payload = vec![0x17];
    payload.put_u32_le(stmt.statement_id);
    payload.put_u8(0);
    payload.put_u32_le(1);
    payload.put_u8(0b1); // NULL bitmap
    payload.put_u8(1);
    payload.put_slice(&[0x06, 0x00]);
    client.command(&payload).await;

    let rs = client.read_response().await.unwrap_rows();
    // NULL bitmap starts at bit 2
    assert_eq!(rs.rows[0], vec![0x00, 0b100]);
}

#[tokio::test]
async fn test_long_data_then_execute() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let stmt = prepare(&mut client, "select ?").await;
    for chunk in [&b"long "[..], &b"value"[..]] {
        let mut payload = vec![0x18];
        payload.put_u32_le(stmt.statement_id);
        payload.put_u16_le(0);
        payload.put_slice(chunk);
        client.command(&payload).await;
    }

    // long data is answered with nothing; the parameter value is skipped
    client.command(&execute_payload(stmt.statement_id, &[(0xfc, &[])])).await;
    let rs = client.read_response().await.unwrap_rows();
    let mut r = PayloadReader::at(&rs.rows[0], 2);
    assert_eq!(r.read_lenenc_bytes(), Some(&b"long value"[..]));

    // a bad parameter number is reported
    let mut payload = vec![0x18];
    payload.put_u32_le(stmt.statement_id);
    payload.put_u16_le(5);
    payload.put_slice(b"x");
    client.command(&payload).await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1105);
}

#[tokio::test]
async fn test_execute_write_statement() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let stmt = prepare(&mut client, "insert into t values (?)").await;
    assert!(stmt.columns.is_empty());
    client
        .command(&execute_payload(stmt.statement_id, &[(0x03, &5i32.to_le_bytes())]))
        .await;
    let ok = client.read_response().await.unwrap_ok();
    assert_eq!(ok.affected_rows, 1);
    assert_eq!(ok.last_insert_id, 7);
}

#[tokio::test]
async fn test_unknown_and_closed_statements() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(&execute_payload(99, &[])).await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1243);

    let mut reset = vec![0x1a];
    reset.put_u32_le(99);
    client.command(&reset).await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 2014);

    let stmt = prepare(&mut client, "select ?").await;
    let mut reset = vec![0x1a];
    reset.put_u32_le(stmt.statement_id);
    client.command(&reset).await;
    client.read_response().await.unwrap_ok();

    // COM_STMT_CLOSE has no response
    let mut close = vec![0x19];
    close.put_u32_le(stmt.statement_id);
    client.command(&close).await;

    client.command(&execute_payload(stmt.statement_id, &[(0x03, &1i32.to_le_bytes())])).await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1243);
}

#[tokio::test]
async fn test_prepare_multiple_statements_rejected() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(b"\x16select ?; select ?").await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_message, "can not prepare multiple statements");

    // the failed prepare did not consume an id
    let stmt = prepare(&mut client, "select ?").await;
    assert_eq!(stmt.statement_id, 1);
}

#[tokio::test]
async fn test_reset_connection_drops_statements() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let stmt = prepare(&mut client, "select ?").await;
    client.command(&[0x1f]).await;
    client.read_response().await.unwrap_ok();

    client.command(&execute_payload(stmt.statement_id, &[(0x03, &1i32.to_le_bytes())])).await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1243);

    // ids keep counting after a reset
    let next = prepare(&mut client, "select ?").await;
    assert_eq!(next.statement_id, 2);
}
