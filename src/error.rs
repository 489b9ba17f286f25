use std::fmt;
use std::io;

use thiserror::Error;

/// MySQL server error codes emitted by the connection engine
#[allow(dead_code)]
pub mod codes {
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const ER_SERVER_SHUTDOWN: u16 = 1053;
    pub const ER_EMPTY_QUERY: u16 = 1065;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_NET_PACKETS_OUT_OF_ORDER: u16 = 1156;
    pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const ER_MALFORMED_PACKET: u16 = 1835;
    pub const CR_SERVER_LOST: u16 = 2013;
    pub const CR_COMMANDS_OUT_OF_SYNC: u16 = 2014;
}

/// SQL states paired with the error codes above
pub mod states {
    pub const UNKNOWN: &str = "HY000";
    pub const ACCESS_DENIED: &str = "28000";
    pub const NET_ERROR: &str = "08S01";
    pub const SYNTAX_OR_ACCESS: &str = "42000";
    pub const QUERY_INTERRUPTED: &str = "70100";
}

/// An error that is reported to the client as an ERR packet.
///
/// Handlers return these; the dispatcher converts each one into exactly one
/// ERR packet, and the connection stays usable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl SqlError {
    pub fn new(code: u16, state: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            state: state.to_string(),
            message: message.into(),
        }
    }

    /// Generic error with ER_UNKNOWN_ERROR / HY000
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(codes::ER_UNKNOWN_ERROR, states::UNKNOWN, message)
    }

    pub fn unknown_command(message: impl Into<String>) -> Self {
        Self::new(codes::ER_UNKNOWN_COM_ERROR, states::NET_ERROR, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(codes::ER_ACCESS_DENIED_ERROR, states::ACCESS_DENIED, message)
    }

    pub fn interrupted() -> Self {
        Self::new(
            codes::ER_QUERY_INTERRUPTED,
            states::QUERY_INTERRUPTED,
            "Query execution was interrupted",
        )
    }

    /// Returned to a handler when the connection failed underneath it
    pub fn server_lost() -> Self {
        Self::new(
            codes::CR_SERVER_LOST,
            states::UNKNOWN,
            "Lost connection to MySQL server during query",
        )
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (errno {}) (sqlstate {})",
            self.message, self.code, self.state
        )
    }
}

impl std::error::Error for SqlError {}

/// Connection-level errors.
///
/// Any of these ends the command loop. `Eof` marks an ordinary client
/// disconnect and is kept out of the error logs.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection closed by peer")]
    Eof,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid sequence, expected {expected} got {got}")]
    Sequence { expected: u8, got: u8 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Sql(#[from] SqlError),
}

impl ConnError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ConnError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for the disconnect cases that should not be logged
    pub fn is_eof(&self) -> bool {
        matches!(self, ConnError::Eof | ConnError::Closed)
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConnError::Eof => "eof",
            ConnError::Io { .. } => "io",
            ConnError::Sequence { .. } => "sequence",
            ConnError::Protocol(_) => "protocol",
            ConnError::Closed => "closed",
            ConnError::Sql(_) => "sql",
        }
    }
}
