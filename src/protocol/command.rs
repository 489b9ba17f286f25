use super::codec::PayloadReader;
use super::packet::Command;

/// COM_BINLOG_DUMP_GTID flag: a GTID set follows the position
pub const BINLOG_THROUGH_GTID: u16 = 0x04;

/// COM_BINLOG_DUMP arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogDumpRequest {
    pub position: u32,
    pub flags: u16,
    pub server_id: u32,
    pub file_name: String,
}

/// COM_BINLOG_DUMP_GTID arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogDumpGtidRequest {
    pub flags: u16,
    pub server_id: u32,
    pub file_name: String,
    pub position: u64,
    /// Present only with BINLOG_THROUGH_GTID and a non-empty set
    pub gtid_set: Option<String>,
}

/// COM_REGISTER_SLAVE arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReplicaRequest {
    pub server_id: u32,
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
}

/// Parsed command from client.
///
/// Everything a branch needs is copied out of the packet so the read
/// buffer can go back to the pool before the handler runs. `None` in a
/// variant means the payload was malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Quit,
    InitDb(String),
    Query(String),
    Ping,
    SetOption(Option<u16>),
    StmtPrepare(String),
    /// Raw payload; decoding needs the statement's parameter count
    StmtExecute(Vec<u8>),
    StmtSendLongData(Option<(u32, u16, Vec<u8>)>),
    StmtClose(Option<u32>),
    StmtReset(Option<u32>),
    ResetConnection,
    FieldList,
    BinlogDump(Option<BinlogDumpRequest>),
    BinlogDumpGtid(Option<BinlogDumpGtidRequest>),
    RegisterReplica(Option<RegisterReplicaRequest>),
    Unknown(u8),
}

impl ClientCommand {
    /// Parse command from a non-empty packet payload
    pub fn parse(payload: &[u8]) -> Self {
        let opcode = payload[0];
        let data = &payload[1..];

        match Command::from(opcode) {
            Command::Quit => ClientCommand::Quit,
            Command::InitDb => ClientCommand::InitDb(lossy(data)),
            Command::Query => ClientCommand::Query(lossy(data)),
            Command::Ping => ClientCommand::Ping,
            Command::SetOption => ClientCommand::SetOption(PayloadReader::at(payload, 1).read_u16()),
            Command::StmtPrepare => ClientCommand::StmtPrepare(lossy(data)),
            Command::StmtExecute => ClientCommand::StmtExecute(payload.to_vec()),
            Command::StmtSendLongData => ClientCommand::StmtSendLongData(parse_send_long_data(payload)),
            Command::StmtClose => ClientCommand::StmtClose(PayloadReader::at(payload, 1).read_u32()),
            Command::StmtReset => ClientCommand::StmtReset(PayloadReader::at(payload, 1).read_u32()),
            Command::ResetConnection => ClientCommand::ResetConnection,
            Command::FieldList => ClientCommand::FieldList,
            Command::BinlogDump => ClientCommand::BinlogDump(parse_binlog_dump(payload)),
            Command::BinlogDumpGtid => ClientCommand::BinlogDumpGtid(parse_binlog_dump_gtid(payload)),
            Command::RegisterSlave => ClientCommand::RegisterReplica(parse_register_replica(payload)),
            _ => ClientCommand::Unknown(opcode),
        }
    }
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).to_string()
}

fn parse_send_long_data(payload: &[u8]) -> Option<(u32, u16, Vec<u8>)> {
    let mut r = PayloadReader::at(payload, 1);
    let stmt_id = r.read_u32()?;
    let param_id = r.read_u16()?;
    Some((stmt_id, param_id, r.read_rest().to_vec()))
}

fn parse_binlog_dump(payload: &[u8]) -> Option<BinlogDumpRequest> {
    let mut r = PayloadReader::at(payload, 1);
    Some(BinlogDumpRequest {
        position: r.read_u32()?,
        flags: r.read_u16()?,
        server_id: r.read_u32()?,
        file_name: lossy(r.read_rest()),
    })
}

fn parse_binlog_dump_gtid(payload: &[u8]) -> Option<BinlogDumpGtidRequest> {
    let mut r = PayloadReader::at(payload, 1);
    let flags = r.read_u16()?;
    let server_id = r.read_u32()?;
    let name_len = r.read_u32()? as usize;
    let file_name = lossy(r.read_bytes(name_len)?);
    let position = r.read_u64()?;

    let mut gtid_set = None;
    if flags & BINLOG_THROUGH_GTID != 0 {
        let size = r.read_u32()? as usize;
        let gtid = r.read_bytes(size)?;
        if !gtid.is_empty() {
            gtid_set = Some(lossy(gtid));
        }
    }

    Some(BinlogDumpGtidRequest {
        flags,
        server_id,
        file_name,
        position,
        gtid_set,
    })
}

fn parse_register_replica(payload: &[u8]) -> Option<RegisterReplicaRequest> {
    let mut r = PayloadReader::at(payload, 1);
    let server_id = r.read_u32()?;
    let mut short_string = || -> Option<String> {
        let len = r.read_u8()? as usize;
        Some(lossy(r.read_bytes(len)?))
    };
    let host = short_string()?;
    let user = short_string()?;
    let password = short_string()?;
    Some(RegisterReplicaRequest {
        server_id,
        host,
        user,
        password,
        port: r.read_u16()?,
    })
}
