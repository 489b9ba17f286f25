use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mysqlwire::config::{self, DEFAULT_CONFIG_PATHS};
use mysqlwire::metrics::start_metrics_server;
use mysqlwire::protocol::{ColumnType, Field, Value};
use mysqlwire::{Handler, Listener, QueryResult, ResultSink, Session, SqlError};

/// Answers every statement with a one-row result holding its text
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn com_query(&self, session: &Session, sql: &str, sink: &mut dyn ResultSink) -> Result<(), SqlError> {
        info!(conn_id = session.id(), user = %session.user(), sql = %sql, "Echoing query");
        let fields = vec![Field::new("query", ColumnType::VarString)];
        let rows = vec![vec![Value::Bytes(sql.as_bytes().to_vec())]];
        sink.send(QueryResult::with_rows(fields, rows)).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = config::load_first(&DEFAULT_CONFIG_PATHS)?;

    if config.metrics.enabled {
        let addr = config.metrics.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let listener = Arc::new(Listener::new(&config, Arc::new(EchoHandler)));
    let socket = TcpListener::bind(config.server.addr()).await?;

    let shutdown = listener.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
            shutdown.mark_all_for_close();
        }
    });

    listener.serve(socket).await?;
    info!("mysqlwire stopped");
    Ok(())
}
