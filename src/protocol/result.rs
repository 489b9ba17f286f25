//! OK, ERR and EOF packets.
//!
//! Encoders work length-first: `encoded_len` tells the caller how large a
//! buffer to borrow, and `encode_into` must fill exactly that many bytes.

use bytes::BufMut;

use crate::error::{states, SqlError};

use super::codec::{lenenc_int_size, lenenc_str_size, put_lenenc_bytes, put_lenenc_int, PayloadReader};
use super::packet::{
    capabilities::{CLIENT_DEPRECATE_EOF, CLIENT_PROTOCOL_41, CLIENT_SESSION_TRACK},
    status::SERVER_SESSION_STATE_CHANGED,
    EOF_PACKET, ERR_PACKET, MAX_PACKET_SIZE, OK_PACKET, SESSION_TRACK_GTIDS,
};

/// OK packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// OK_PACKET, or EOF_PACKET when it terminates a result set under
    /// CLIENT_DEPRECATE_EOF
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    /// GTID set reported through the session-state-change extension
    pub session_state_data: String,
}

impl OkPacket {
    pub fn new(status_flags: u16) -> Self {
        Self {
            header: OK_PACKET,
            status_flags,
            ..Default::default()
        }
    }

    fn tracks_session(&self, capabilities: u32) -> bool {
        capabilities & CLIENT_SESSION_TRACK != 0
    }

    fn carries_session_state(&self, capabilities: u32) -> bool {
        self.tracks_session(capabilities) && self.status_flags & SERVER_SESSION_STATE_CHANGED != 0
    }

    /// (GTID entry body length, whole session-state entry length)
    fn session_state_lengths(&self) -> (usize, usize) {
        let gtid_entry = 1 + lenenc_str_size(self.session_state_data.len());
        let entry = 1 + lenenc_int_size(gtid_entry as u64) + gtid_entry;
        (gtid_entry, entry)
    }

    pub fn encoded_len(&self, capabilities: u32) -> usize {
        let mut length = 1
            + lenenc_int_size(self.affected_rows)
            + lenenc_int_size(self.last_insert_id)
            + 2
            + 2;
        if self.tracks_session(capabilities) {
            length += lenenc_str_size(self.info.len());
            if self.carries_session_state(capabilities) {
                let (_, entry) = self.session_state_lengths();
                length += lenenc_int_size(entry as u64) + entry;
            }
        } else {
            length += self.info.len();
        }
        length
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B, capabilities: u32) {
        buf.put_u8(self.header);
        put_lenenc_int(buf, self.affected_rows);
        put_lenenc_int(buf, self.last_insert_id);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(self.warnings);

        if self.tracks_session(capabilities) {
            put_lenenc_bytes(buf, self.info.as_bytes());
            if self.carries_session_state(capabilities) {
                let (gtid_entry, entry) = self.session_state_lengths();
                put_lenenc_int(buf, entry as u64);
                buf.put_u8(SESSION_TRACK_GTIDS);
                put_lenenc_int(buf, gtid_entry as u64);
                // GTID encoding: 0 = string
                buf.put_u8(0x00);
                put_lenenc_bytes(buf, self.session_state_data.as_bytes());
            }
        } else {
            buf.put_slice(self.info.as_bytes());
        }
    }

    /// Parse an OK packet (or an OK packet with the EOF header)
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        let header = r.read_u8()?;
        if header != OK_PACKET && header != EOF_PACKET {
            return None;
        }

        let mut ok = OkPacket {
            header,
            affected_rows: r.read_lenenc_int()?,
            last_insert_id: r.read_lenenc_int()?,
            status_flags: r.read_u16()?,
            warnings: r.read_u16()?,
            ..Default::default()
        };

        if !ok.tracks_session(capabilities) {
            ok.info = String::from_utf8_lossy(r.read_rest()).to_string();
            return Some(ok);
        }

        if !r.is_empty() {
            ok.info = String::from_utf8_lossy(r.read_lenenc_bytes()?).to_string();
        }

        if ok.status_flags & SERVER_SESSION_STATE_CHANGED != 0 && !r.is_empty() {
            let changes = r.read_lenenc_bytes()?;
            let mut entries = PayloadReader::new(changes);
            while !entries.is_empty() {
                let entry_type = entries.read_u8()?;
                let data = entries.read_lenenc_bytes()?;
                // other entry types are skipped
                if entry_type == SESSION_TRACK_GTIDS {
                    let mut gtid = PayloadReader::new(data);
                    gtid.skip(1)?;
                    ok.session_state_data = String::from_utf8_lossy(gtid.read_lenenc_bytes()?).to_string();
                }
            }
        }

        Some(ok)
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    /// Build an ERR packet. An empty SQL state becomes HY000.
    ///
    /// # Panics
    ///
    /// A SQL state that is not exactly 5 bytes is a programming error.
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        let sql_state = if sql_state.is_empty() {
            states::UNKNOWN
        } else {
            sql_state
        };
        assert!(
            sql_state.len() == 5,
            "sql state {:?} has to be 5 characters long",
            sql_state
        );
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + 2 + 1 + 5 + self.error_message.len()
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(ERR_PACKET);
        buf.put_u16_le(self.error_code);
        buf.put_u8(b'#');
        buf.put_slice(self.sql_state.as_bytes());
        buf.put_slice(self.error_message.as_bytes());
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        if r.read_u8()? != ERR_PACKET {
            return None;
        }
        let error_code = r.read_u16()?;

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && payload.get(3) == Some(&b'#') {
                r.skip(1)?;
                match r.read_bytes(5) {
                    Some(state) => (
                        String::from_utf8_lossy(state).to_string(),
                        String::from_utf8_lossy(r.read_rest()).to_string(),
                    ),
                    None => (
                        states::UNKNOWN.to_string(),
                        String::from_utf8_lossy(r.read_rest()).to_string(),
                    ),
                }
            } else {
                (
                    states::UNKNOWN.to_string(),
                    String::from_utf8_lossy(r.read_rest()).to_string(),
                )
            };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

impl From<&SqlError> for ErrPacket {
    fn from(err: &SqlError) -> Self {
        ErrPacket::new(err.code, &err.state, &err.message)
    }
}

impl From<ErrPacket> for SqlError {
    fn from(packet: ErrPacket) -> Self {
        SqlError::new(packet.error_code, &packet.sql_state, packet.error_message)
    }
}

/// Legacy EOF packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub const LEN: usize = 5;

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(EOF_PACKET);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        if r.read_u8()? != EOF_PACKET {
            return None;
        }
        Some(Self {
            warnings: r.read_u16()?,
            status_flags: r.read_u16()?,
        })
    }
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == OK_PACKET
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == ERR_PACKET
}

/// Check if packet terminates a result set.
///
/// Without CLIENT_DEPRECATE_EOF only short 0xFE packets are EOFs; longer
/// ones are rows whose first value has a 0xFE length prefix. With it, the
/// terminator is an OK packet carrying the 0xFE header.
pub fn is_eof_packet(payload: &[u8], capabilities: u32) -> bool {
    if payload.is_empty() || payload[0] != EOF_PACKET {
        return false;
    }
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        payload.len() < MAX_PACKET_SIZE
    } else {
        payload.len() < 9
    }
}
