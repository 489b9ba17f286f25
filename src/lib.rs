//! Server side of the MySQL client/server protocol.
//!
//! A [`Listener`] accepts client sockets, runs the handshake, and hands every
//! command to a [`Handler`]. Result sets are streamed back through the sink
//! traits in [`handler`], using pooled packet buffers.

pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod protocol;

pub use config::Config;
pub use conn::{ConnOptions, ConnPhase, PrepareData, Session, TlsAcceptor, Transport};
pub use error::{ConnError, SqlError};
pub use handler::{split_statements, AuthRequest, BinlogStream, Handler, MultiResultSink, PrepareResult, QueryResult, ResultSink};
pub use listener::Listener;
