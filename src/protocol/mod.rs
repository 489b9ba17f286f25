pub mod codec;
pub mod command;
pub mod framer;
pub mod handshake;
pub mod packet;
pub mod result;
pub mod value;

pub use codec::PayloadReader;
pub use command::{BinlogDumpGtidRequest, BinlogDumpRequest, ClientCommand, RegisterReplicaRequest};
pub use framer::Framer;
pub use handshake::{HandshakeResponse, InitialHandshake};
pub use packet::{capabilities, status, Command};
pub use result::{is_eof_packet, is_err_packet, is_ok_packet, EofPacket, ErrPacket, OkPacket};
pub use value::{column_flags, BinaryValue, ColumnType, DateTime, Field, Time, Value};
