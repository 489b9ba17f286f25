//! Handshake, shutdown and connection control from the listener

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BufMut;

use mysqlwire::config::Config;
use mysqlwire::conn::ConnPhase;
use mysqlwire::protocol::capabilities::{CLIENT_PLUGIN_AUTH, CLIENT_SSL};
use mysqlwire::protocol::packet::MYSQL_NATIVE_PASSWORD;
use mysqlwire::protocol::{is_ok_packet, ErrPacket, HandshakeResponse};
use mysqlwire::{Listener, TlsAcceptor, Transport};

use crate::{listener, ScriptedHandler, TestClient, CLIENT_CAPABILITIES};

#[tokio::test]
async fn test_greeting() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (client, _task) = TestClient::open(&listener).await;

    let greeting = &client.greeting;
    assert_eq!(greeting.protocol_version, 10);
    assert_eq!(greeting.server_version, "8.0.30-mysqlwire");
    assert_eq!(greeting.connection_id, 1);
    assert_eq!(greeting.salt.len(), 20);
    assert!(greeting.salt.iter().all(|&b| b != 0 && b != b'$' && b < 0x80));
    assert_eq!(greeting.auth_plugin_name, MYSQL_NATIVE_PASSWORD);
    // no TLS hook configured
    assert_eq!(greeting.capability_flags & CLIENT_SSL, 0);
}

#[tokio::test]
async fn test_connection_ids_are_unique() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (first, _t1) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;
    let (second, _t2) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    assert_eq!(first.greeting.connection_id, 1);
    assert_eq!(second.greeting.connection_id, 2);
    assert_eq!(listener.connection_count(), 2);
}

#[tokio::test]
async fn test_login_sets_session_state() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, _task) = TestClient::open(&listener).await;

    let reply = client.handshake(CLIENT_CAPABILITIES, "app", Some("shop")).await;
    assert!(is_ok_packet(&reply));

    client.ping().await.unwrap_ok();

    let session = listener.session(client.greeting.connection_id).unwrap();
    assert_eq!(session.user(), "app");
    assert_eq!(session.schema(), "shop");
    assert_ne!(session.phase(), ConnPhase::Closed);
    assert_eq!(handler.ready.load(Ordering::SeqCst), 1);

    let auth = handler.last_auth.lock().unwrap().clone().unwrap();
    assert_eq!(auth.auth_method, MYSQL_NATIVE_PASSWORD);
    assert_eq!(auth.salt, client.greeting.salt);
}

#[tokio::test]
async fn test_auth_failure() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, task) = TestClient::open(&listener).await;

    let reply = client.handshake(CLIENT_CAPABILITIES, "bad", None).await;
    let err = ErrPacket::parse(&reply, client.capabilities).unwrap();
    assert_eq!(err.error_code, 1045);
    assert_eq!(err.sql_state, "28000");

    assert!(client.is_closed().await);
    task.await.unwrap();
    assert_eq!(handler.ready.load(Ordering::SeqCst), 0);
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    assert_eq!(listener.connection_count(), 0);
}

#[tokio::test]
async fn test_unknown_initial_schema() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, task) = TestClient::open(&listener).await;

    let reply = client.handshake(CLIENT_CAPABILITIES, "app", Some("missing")).await;
    let err = ErrPacket::parse(&reply, client.capabilities).unwrap();
    assert_eq!(err.error_code, 1049);
    task.await.unwrap();
}

#[tokio::test]
async fn test_auth_switch() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, _task) = TestClient::open(&listener).await;

    let response = HandshakeResponse {
        capability_flags: CLIENT_CAPABILITIES | CLIENT_PLUGIN_AUTH,
        max_packet_size: 1 << 24,
        character_set: 0x21,
        username: "app".to_string(),
        auth_response: vec![1; 32],
        auth_plugin_name: "caching_sha2_password".to_string(),
        ..Default::default()
    };
    client.capabilities = response.capability_flags;
    client.write(&response.encode()).await;

    let switch = client.read_packet().await;
    assert_eq!(switch[0], 0xfe);
    let plugin_end = 1 + MYSQL_NATIVE_PASSWORD.len();
    assert_eq!(&switch[1..plugin_end], MYSQL_NATIVE_PASSWORD.as_bytes());

    client.write(&[7u8; 20]).await;
    let ok = client.read_packet().await;
    assert!(is_ok_packet(&ok));
    // greeting 0, response 1, switch 2, auth data 3, OK 4
    assert_eq!(client.sequences, vec![2, 4]);

    let auth = handler.last_auth.lock().unwrap().clone().unwrap();
    assert_eq!(auth.auth_method, MYSQL_NATIVE_PASSWORD);
    assert_eq!(auth.auth_response, vec![7u8; 20]);
}

/// Hands the stream back unchanged and counts upgrades
#[derive(Default)]
struct PassthroughTls {
    upgrades: AtomicUsize,
}

#[async_trait]
impl TlsAcceptor for PassthroughTls {
    async fn accept(&self, stream: Box<dyn Transport>) -> io::Result<Box<dyn Transport>> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }
}

#[tokio::test]
async fn test_ssl_request_upgrades_stream() {
    let handler = ScriptedHandler::new();
    let tls = Arc::new(PassthroughTls::default());
    let listener = Arc::new(Listener::new(&Config::default(), handler).with_tls(tls.clone()));
    let (mut client, _task) = TestClient::open(&listener).await;
    assert_ne!(client.greeting.capability_flags & CLIENT_SSL, 0);

    let capabilities = CLIENT_CAPABILITIES | CLIENT_SSL;
    let mut ssl_request = Vec::new();
    ssl_request.put_u32_le(capabilities);
    ssl_request.put_u32_le(1 << 24);
    ssl_request.put_u8(0x21);
    ssl_request.put_bytes(0, 23);
    client.write(&ssl_request).await;

    let reply = client.handshake(capabilities, "app", None).await;
    assert!(is_ok_packet(&reply));
    assert_eq!(tls.upgrades.load(Ordering::SeqCst), 1);

    client.query("select 1").await.unwrap_rows();
}

#[tokio::test]
async fn test_ssl_request_without_tls_is_rejected() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, task) = TestClient::open(&listener).await;

    let mut ssl_request = Vec::new();
    ssl_request.put_u32_le(CLIENT_CAPABILITIES | CLIENT_SSL);
    ssl_request.put_u32_le(1 << 24);
    ssl_request.put_u8(0x21);
    ssl_request.put_bytes(0, 23);
    client.write(&ssl_request).await;

    assert!(client.is_closed().await);
    task.await.unwrap();
}

#[tokio::test]
async fn test_quit() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.quit().await;
    task.await.unwrap();
    assert!(client.is_closed().await);
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    assert_eq!(listener.connection_count(), 0);
}

#[tokio::test]
async fn test_ping_after_shutdown() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.ping().await.unwrap_ok();
    listener.shutdown();
    assert!(listener.is_shutdown());

    let err = client.ping().await.unwrap_err();
    assert_eq!(err.error_code, 1053);
    assert_eq!(err.sql_state, "08S01");

    // other commands keep working
    client.query("select 1").await.unwrap_rows();
}

#[tokio::test]
async fn test_kill_connection() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;
    let id = client.greeting.connection_id;

    assert!(listener.kill_connection(id));
    task.await.unwrap();
    assert!(client.is_closed().await);
    assert!(!listener.kill_connection(id));
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_kill_connection_while_client_stops_reading() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;
    let id = client.greeting.connection_id;

    // Far more rows than the stream can hold; the client never reads them
    client.command(b"\x03select rows 200000").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(listener.kill_connection(id));
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("connection task ends after kill")
        .unwrap();
    assert!(listener.session(id).is_none());
    assert_eq!(listener.connection_count(), 0);
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_kill_query() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, _task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;
    let id = client.greeting.connection_id;

    // nothing running yet
    assert!(!listener.kill_query(id));

    client.command(b"\x03wait").await;
    handler.wait_started.notified().await;
    assert!(listener.kill_query(id));

    let err = client.read_response().await.unwrap_err();
    assert_eq!(err.error_code, 1317);
    assert_eq!(err.sql_state, "70100");
    client.ping().await.unwrap_ok();
}

#[tokio::test]
async fn test_mark_all_for_close() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler);
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    listener.mark_all_for_close();
    // the next command is not answered
    client.command(&[0x0e]).await;
    task.await.unwrap();
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_handler_panic_closes_connection() {
    let handler = ScriptedHandler::new();
    let listener = listener(handler.clone());
    let (mut client, task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;
    let (mut other, _other_task) = TestClient::connect(&listener, CLIENT_CAPABILITIES).await;

    client.command(b"\x03panic").await;
    task.await.unwrap();
    assert!(client.is_closed().await);
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);

    // the rest of the server is unaffected
    other.query("select 1").await.unwrap_rows();
}
