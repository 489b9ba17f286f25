//! COM_BINLOG_DUMP, COM_BINLOG_DUMP_GTID and COM_REGISTER_SLAVE

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mysqlwire::protocol::command::BINLOG_THROUGH_GTID;
use mysqlwire::protocol::{BinlogDumpGtidRequest, BinlogDumpRequest, RegisterReplicaRequest};
use mysqlwire::{BinlogStream, Handler, ResultSink, Session, SqlError};

use crate::{listener, TestClient, CLIENT_CAPABILITIES};

/// Streams two events per dump. A dump of file `broken` fails after the
/// first event; registering server id 0 is refused.
#[derive(Default)]
struct ReplicationHandler {
    dumps: Mutex<Vec<BinlogDumpRequest>>,
    gtid_dumps: Mutex<Vec<BinlogDumpGtidRequest>>,
    replicas: Mutex<Vec<RegisterReplicaRequest>>,
}

#[async_trait]
impl Handler for ReplicationHandler {
    async fn com_query(&self, _session: &Session, _sql: &str, _sink: &mut dyn ResultSink) -> Result<(), SqlError> {
        Err(SqlError::unknown("queries are not served here"))
    }

    async fn com_binlog_dump(
        &self,
        _session: &Session,
        request: &BinlogDumpRequest,
        stream: &mut dyn BinlogStream,
    ) -> Result<(), SqlError> {
        self.dumps.lock().unwrap().push(request.clone());
        stream.send_event(b"ev1").await?;
        if request.file_name == "broken" {
            return Err(SqlError::unknown("binlog file vanished"));
        }
        stream.flush().await?;
        stream.send_event(b"ev2").await
    }

    async fn com_binlog_dump_gtid(
        &self,
        _session: &Session,
        request: &BinlogDumpGtidRequest,
        stream: &mut dyn BinlogStream,
    ) -> Result<(), SqlError> {
        self.gtid_dumps.lock().unwrap().push(request.clone());
        let gtid = request.gtid_set.clone().unwrap_or_default();
        stream.send_event(gtid.as_bytes()).await
    }

    async fn com_register_replica(&self, _session: &Session, request: &RegisterReplicaRequest) -> Result<(), SqlError> {
        self.replicas.lock().unwrap().push(request.clone());
        if request.server_id == 0 {
            return Err(SqlError::unknown("server id 0 cannot replicate"));
        }
        Ok(())
    }
}

fn binlog_dump(file_name: &str) -> Vec<u8> {
    let mut payload = vec![0x12];
    payload.extend_from_slice(&4u32.to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(&11u32.to_le_bytes());
    payload.extend_from_slice(file_name.as_bytes());
    payload
}

fn binlog_dump_gtid(gtid: &str) -> Vec<u8> {
    let mut payload = vec![0x1e];
    payload.extend_from_slice(&BINLOG_THROUGH_GTID.to_le_bytes());
    payload.extend_from_slice(&12u32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&4u64.to_le_bytes());
    payload.extend_from_slice(&(gtid.len() as u32).to_le_bytes());
    payload.extend_from_slice(gtid.as_bytes());
    payload
}

fn register_replica(server_id: u32) -> Vec<u8> {
    let mut payload = vec![0x15];
    payload.extend_from_slice(&server_id.to_le_bytes());
    payload.extend_from_slice(&[7, b'r', b'e', b'p', b'l', b'i', b'c', b'a', 4, b'r', b'e', b'p', b'l', 0]);
    payload.extend_from_slice(&3307u16.to_le_bytes());
    payload
}

#[tokio::test]
async fn test_binlog_dump_streams_marked_events() {
    let handler = Arc::new(ReplicationHandler::default());
    let listener = listener(handler.clone());
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(&binlog_dump("binlog.000002")).await;
    assert_eq!(client.read_packet().await, b"\x00ev1");
    assert_eq!(client.read_packet().await, b"\x00ev2");
    assert_eq!(client.sequences, vec![1, 2]);

    {
        let dumps = handler.dumps.lock().unwrap();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].position, 4);
        assert_eq!(dumps[0].server_id, 11);
        assert_eq!(dumps[0].file_name, "binlog.000002");
    }

    // a finished dump leaves the connection usable
    client.ping().await.unwrap_ok();
}

#[tokio::test]
async fn test_binlog_dump_gtid() {
    let handler = Arc::new(ReplicationHandler::default());
    let listener = listener(handler.clone());
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    let gtid = "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5";
    client.command(&binlog_dump_gtid(gtid)).await;
    let event = client.read_packet().await;
    assert_eq!(event[0], 0x00);
    assert_eq!(&event[1..], gtid.as_bytes());

    let dumps = handler.gtid_dumps.lock().unwrap();
    assert_eq!(dumps[0].server_id, 12);
    assert_eq!(dumps[0].gtid_set.as_deref(), Some(gtid));
}

#[tokio::test]
async fn test_failed_binlog_dump_closes_connection() {
    let handler = Arc::new(ReplicationHandler::default());
    let listener = listener(handler);
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(&binlog_dump("broken")).await;
    // events sent before the failure still arrive, with no ERR after them
    assert_eq!(client.read_packet().await, b"\x00ev1");
    assert!(client.is_closed().await);
    task.await.unwrap();
}

#[tokio::test]
async fn test_malformed_binlog_dump_closes_without_reply() {
    let handler = Arc::new(ReplicationHandler::default());
    let listener = listener(handler.clone());

    for payload in [vec![0x12, 1, 2], vec![0x1e, 4, 0]] {
        let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;
        client.command(&payload).await;
        assert!(client.is_closed().await);
        task.await.unwrap();
    }

    assert!(handler.dumps.lock().unwrap().is_empty());
    assert!(handler.gtid_dumps.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_register_replica() {
    let handler = Arc::new(ReplicationHandler::default());
    let listener = listener(handler.clone());
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(&register_replica(21)).await;
    client.read_response().await.unwrap_ok();

    {
        let replicas = handler.replicas.lock().unwrap();
        assert_eq!(replicas[0].server_id, 21);
        assert_eq!(replicas[0].host, "replica");
        assert_eq!(replicas[0].user, "repl");
        assert_eq!(replicas[0].port, 3307);
    }

    client.ping().await.unwrap_ok();
}

#[tokio::test]
async fn test_rejected_replica_gets_error_then_close() {
    let handler = Arc::new(ReplicationHandler::default());
    let listener = listener(handler);
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(&register_replica(0)).await;
    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1105);
    assert!(client.is_closed().await);
    task.await.unwrap();
}

#[tokio::test]
async fn test_malformed_register_replica_closes_without_reply() {
    let handler = Arc::new(ReplicationHandler::default());
    let listener = listener(handler.clone());
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(&[0x15, 1, 0]).await;
    assert!(client.is_closed().await);
    task.await.unwrap();
    assert!(handler.replicas.lock().unwrap().is_empty());
}
