//! Server side of the connection phase: greeting, optional TLS upgrade,
//! handshake response, auth switch, and the final OK.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{ConnError, SqlError};
use crate::handler::{AuthRequest, Handler};
use crate::metrics::metrics;
use crate::protocol::handshake::{encode_auth_switch_request, generate_salt, is_ssl_request};
use crate::protocol::packet::{
    capabilities::{CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SSL, SERVER_CAPABILITIES},
    MYSQL_NATIVE_PASSWORD,
};
use crate::protocol::{ErrPacket, Framer, HandshakeResponse, InitialHandshake, OkPacket};

use super::{ConnContext, Session, Transport};

/// Upgrades a connection to TLS when the client sends an SSLRequest
#[async_trait]
pub trait TlsAcceptor: Send + Sync {
    async fn accept(&self, stream: Box<dyn Transport>) -> io::Result<Box<dyn Transport>>;
}

async fn send(framer: &mut Framer, stream: &mut Box<dyn Transport>, payload: &[u8]) -> Result<(), ConnError> {
    framer.write_payload(stream, payload).await?;
    stream.flush().await.map_err(|e| ConnError::io("flush", e))
}

async fn send_err(framer: &mut Framer, stream: &mut Box<dyn Transport>, err: &SqlError) -> Result<(), ConnError> {
    let packet = ErrPacket::from(err);
    let mut payload = Vec::with_capacity(packet.encoded_len());
    packet.encode_into(&mut payload);
    send(framer, stream, &payload).await
}

/// Run the connection phase on `stream`.
///
/// Returns the stream to run commands on, which is a new one if the client
/// upgraded to TLS. A rejected login is answered with an ERR packet and
/// reported as [`ConnError::Sql`].
pub(crate) async fn handshake(
    mut stream: Box<dyn Transport>,
    session: &Arc<Session>,
    ctx: &ConnContext,
    handler: &Arc<dyn Handler>,
    accepted_at: Instant,
) -> Result<Box<dyn Transport>, ConnError> {
    let mut framer = Framer::new();
    let salt = generate_salt();

    let mut server_capabilities = SERVER_CAPABILITIES;
    if ctx.tls.is_some() {
        server_capabilities |= CLIENT_SSL;
    }

    let greeting = InitialHandshake::new(
        session.id(),
        &ctx.options.server_version,
        server_capabilities,
        &salt,
    );
    send(&mut framer, &mut stream, &greeting.encode()).await?;

    let mut payload = framer.read_full(&mut stream).await?;
    if is_ssl_request(&payload) {
        let Some(tls) = &ctx.tls else {
            return Err(ConnError::Protocol("client requested TLS, which is not configured".into()));
        };
        stream = tls
            .accept(stream)
            .await
            .map_err(|e| ConnError::io("TLS handshake", e))?;
        debug!(conn_id = session.id(), "Upgraded connection to TLS");
        payload = framer.read_full(&mut stream).await?;
    }

    let response = HandshakeResponse::parse(&payload)
        .ok_or_else(|| ConnError::Protocol("invalid handshake response".into()))?;
    if response.capability_flags & CLIENT_PROTOCOL_41 == 0 {
        return Err(ConnError::Protocol("client does not support protocol 4.1".into()));
    }

    debug!(
        conn_id = session.id(),
        username = %response.username,
        database = ?response.database,
        "Received handshake response"
    );

    let capabilities = response.capability_flags & server_capabilities;
    session.set_capabilities(capabilities);
    session.set_user(&response.username);
    session.set_character_set(response.character_set);
    session.set_connect_attrs(response.connect_attrs.clone());

    let mut auth_method = response.auth_plugin_name.clone();
    let mut auth_response = response.auth_response.clone();
    if capabilities & CLIENT_PLUGIN_AUTH != 0 && auth_method != MYSQL_NATIVE_PASSWORD {
        debug!(
            conn_id = session.id(),
            client_plugin = %auth_method,
            "Switching auth method"
        );
        send(
            &mut framer,
            &mut stream,
            &encode_auth_switch_request(MYSQL_NATIVE_PASSWORD, &salt),
        )
        .await?;
        auth_response = framer.read_full(&mut stream).await?;
        auth_method = MYSQL_NATIVE_PASSWORD.to_string();
    }

    let request = AuthRequest {
        user: response.username.clone(),
        auth_method,
        auth_response,
        salt: salt.to_vec(),
        database: response.database.clone(),
    };
    if let Err(e) = handler.authenticate(session, &request).await {
        send_err(&mut framer, &mut stream, &e).await?;
        return Err(ConnError::Sql(e));
    }

    if let Some(database) = &response.database {
        if let Err(e) = handler.com_init_db(session, database).await {
            send_err(&mut framer, &mut stream, &e).await?;
            return Err(ConnError::Sql(e));
        }
        session.set_schema(database);
    }

    let ok = OkPacket::new(session.status_flags());
    let mut payload = Vec::with_capacity(ok.encoded_len(capabilities));
    ok.encode_into(&mut payload, capabilities);
    send(&mut framer, &mut stream, &payload).await?;

    let elapsed = accepted_at.elapsed();
    if let Some(threshold) = ctx.options.slow_connect_warn_threshold {
        if elapsed > threshold {
            metrics().record_slow_connection();
            warn!(
                conn_id = session.id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow connection from {}",
                session
            );
        }
    }

    Ok(stream)
}
