//! Accepts client sockets and runs one connection task per socket.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::conn::{handshake, Conn, ConnContext, ConnOptions, Session, TlsAcceptor, Transport};
use crate::error::ConnError;
use crate::handler::Handler;
use crate::metrics::metrics;
use crate::pool::BufferPool;

/// MySQL protocol listener.
///
/// Connection ids are unique for the life of the listener. Every live
/// connection is registered so it can be killed or marked for close from
/// outside its task.
pub struct Listener {
    ctx: Arc<ConnContext>,
    handler: Arc<dyn Handler>,
    sessions: DashMap<u32, Arc<Session>>,
    next_id: AtomicU32,
    shutdown: Arc<AtomicBool>,
    stop_accepting: CancellationToken,
    nodelay: bool,
}

impl Listener {
    pub fn new(config: &Config, handler: Arc<dyn Handler>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = ConnContext {
            options: ConnOptions::from_config(&config.server),
            pool: Arc::new(BufferPool::new(&config.buffer_pool)),
            shutdown: shutdown.clone(),
            tls: None,
        };
        Self {
            ctx: Arc::new(ctx),
            handler,
            sessions: DashMap::new(),
            next_id: AtomicU32::new(1),
            shutdown,
            stop_accepting: CancellationToken::new(),
            nodelay: config.server.nodelay,
        }
    }

    /// Offer TLS to clients; `acceptor` performs the upgrade
    pub fn with_tls(mut self, acceptor: Arc<dyn TlsAcceptor>) -> Self {
        self.ctx = Arc::new(ConnContext {
            options: self.ctx.options.clone(),
            pool: self.ctx.pool.clone(),
            shutdown: self.shutdown.clone(),
            tls: Some(acceptor),
        });
        self
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.ctx.pool
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "MySQL listener accepting connections");
        }

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.stop_accepting.cancelled() => {
                    info!("Listener stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(self.nodelay) {
                warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }

            let this = self.clone();
            tokio::spawn(async move {
                this.handle(stream, Some(peer_addr)).await;
            });
        }
    }

    /// Run one client connection to completion: handshake, command loop,
    /// and cleanup. A panic inside the connection is caught and closes it.
    pub async fn handle<S: Transport>(&self, stream: S, remote_addr: Option<SocketAddr>) {
        let accepted_at = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, remote_addr));

        self.sessions.insert(id, session.clone());
        metrics().record_connection_accepted();
        info!(conn_id = id, peer = ?remote_addr, "New connection");
        self.handler.new_connection(&session);

        let result = AssertUnwindSafe(self.run_connection(Box::new(stream), &session, accepted_at))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(ConnError::Sql(e))) => {
                info!(conn_id = id, user = %session.user(), error = %e, "Connection rejected");
                metrics().record_connection_error("auth");
            }
            Ok(Err(e)) if e.is_eof() => {}
            Ok(Err(e)) => {
                warn!(conn_id = id, error = %e, "Connection ended with error");
                metrics().record_connection_error(e.kind());
            }
            Err(panic) => {
                error!(conn_id = id, panic = %panic_message(&*panic), "Connection task panicked");
                metrics().record_panic();
            }
        }

        session.close();
        self.sessions.remove(&id);
        self.handler.connection_closed(&session);
        metrics().record_connection_closed();
        info!(conn_id = id, "Connection closed");
    }

    async fn run_connection(
        &self,
        stream: Box<dyn Transport>,
        session: &Arc<Session>,
        accepted_at: Instant,
    ) -> Result<(), ConnError> {
        let stream = tokio::select! {
            biased;
            _ = session.close_token().cancelled() => return Err(ConnError::Closed),
            result = handshake(stream, session, &self.ctx, &self.handler, accepted_at) => result?,
        };
        self.handler.connection_ready(session);

        let mut conn = Conn::new(stream, session.clone(), self.ctx.clone());
        conn.run(&self.handler).await;
        conn.shutdown().await;
        Ok(())
    }

    /// Interrupt the running query of connection `id` through its cancel
    /// hook. Returns false if there is no such connection or no hook.
    pub fn kill_query(&self, id: u32) -> bool {
        match self.sessions.get(&id) {
            Some(session) => session.cancel(),
            None => false,
        }
    }

    /// Close connection `id`, failing its pending I/O
    pub fn kill_connection(&self, id: u32) -> bool {
        match self.sessions.get(&id) {
            Some(session) => {
                info!(conn_id = id, "Killing connection");
                session.close();
                true
            }
            None => false,
        }
    }

    /// Ask every live connection to stop after its current command
    pub fn mark_all_for_close(&self) {
        for entry in self.sessions.iter() {
            entry.value().mark_for_close();
        }
    }

    /// Stop accepting connections. Live connections keep running but
    /// answer COM_PING with ER_SERVER_SHUTDOWN.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("Listener shutting down");
            self.stop_accepting.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn session(&self, id: u32) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
