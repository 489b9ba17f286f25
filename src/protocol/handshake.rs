use bytes::BufMut;
use rand::RngCore;

use super::codec::{put_lenenc_bytes, put_lenenc_int, put_null_terminated, PayloadReader};
use super::packet::{capabilities::*, AUTH_SWITCH_REQUEST, DEFAULT_CHARSET, MYSQL_NATIVE_PASSWORD};
use super::packet::status::SERVER_STATUS_AUTOCOMMIT;

/// Length of the scramble sent in the greeting
pub const SALT_LENGTH: usize = 20;

/// Length of an SSLRequest payload
pub const SSL_REQUEST_LENGTH: usize = 32;

/// Generate a scramble. Every byte is 7-bit and never `\0` or `$`, so it
/// survives NUL-terminated and plugin-specific encodings.
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    for b in salt.iter_mut() {
        *b &= 0x7f;
        if *b == b'\0' || *b == b'$' {
            *b += 1;
        }
    }
    salt
}

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub salt: Vec<u8>,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    pub fn new(connection_id: u32, server_version: &str, capability_flags: u32, salt: &[u8]) -> Self {
        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            salt: salt.to_vec(),
            capability_flags,
            character_set: DEFAULT_CHARSET,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: MYSQL_NATIVE_PASSWORD.to_string(),
        }
    }

    /// Encode the packet payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.server_version.len());

        buf.put_u8(self.protocol_version);
        put_null_terminated(&mut buf, self.server_version.as_bytes());
        buf.put_u32_le(self.connection_id);

        // First 8 bytes of the scramble, then a filler
        let split = self.salt.len().min(8);
        buf.put_slice(&self.salt[..split]);
        buf.put_bytes(0, 8 - split);
        buf.put_u8(0);

        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        // Scramble length including the trailing NUL
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((self.salt.len() + 1) as u8);
        } else {
            buf.put_u8(0);
        }

        // Reserved
        buf.put_bytes(0, 10);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            put_null_terminated(&mut buf, &self.salt[split..]);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            put_null_terminated(&mut buf, self.auth_plugin_name.as_bytes());
        }

        buf
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);

        let protocol_version = r.read_u8()?;
        let server_version = String::from_utf8_lossy(r.read_null_terminated()?).to_string();
        let connection_id = r.read_u32()?;
        let mut salt = r.read_bytes(8)?.to_vec();
        r.skip(1)?;

        let capability_flags_lower = r.read_u16()? as u32;
        let character_set = r.read_u8()?;
        let status_flags = r.read_u16()?;
        let capability_flags_upper = r.read_u16()? as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = r.read_u8()? as usize;
        r.skip(10)?;

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = 13.max(auth_plugin_data_len.saturating_sub(8));
            let part2 = r.read_bytes(len.min(r.remaining()))?;
            let data_len = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
            salt.extend_from_slice(&part2[..data_len]);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            let rest = r.read_rest();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            String::from_utf8_lossy(&rest[..end]).to_string()
        } else {
            MYSQL_NATIVE_PASSWORD.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            salt,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// True if a client's first reply is an SSLRequest rather than a full
/// handshake response
pub fn is_ssl_request(payload: &[u8]) -> bool {
    if payload.len() != SSL_REQUEST_LENGTH {
        return false;
    }
    let flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    flags & CLIENT_SSL != 0
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
    pub connect_attrs: Vec<(String, String)>,
}

impl HandshakeResponse {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);

        let capability_flags = r.read_u32()?;
        let max_packet_size = r.read_u32()?;
        let character_set = r.read_u8()?;
        r.skip(23)?;

        let username = String::from_utf8_lossy(r.read_null_terminated()?).to_string();

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.read_lenenc_bytes()?.to_vec()
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.read_u8()? as usize;
            r.read_bytes(len)?.to_vec()
        } else {
            r.read_null_terminated()?.to_vec()
        };

        let mut database = None;
        if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
            let db = r.read_null_terminated()?;
            if !db.is_empty() {
                database = Some(String::from_utf8_lossy(db).to_string());
            }
        }

        let mut auth_plugin_name = MYSQL_NATIVE_PASSWORD.to_string();
        if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            auth_plugin_name = String::from_utf8_lossy(r.read_null_terminated()?).to_string();
        }

        let mut connect_attrs = Vec::new();
        if capability_flags & CLIENT_CONNECT_ATTRS != 0 && !r.is_empty() {
            let mut attrs = PayloadReader::new(r.read_lenenc_bytes()?);
            while !attrs.is_empty() {
                let key = String::from_utf8_lossy(attrs.read_lenenc_bytes()?).to_string();
                let value = String::from_utf8_lossy(attrs.read_lenenc_bytes()?).to_string();
                connect_attrs.push((key, value));
            }
        }

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            connect_attrs,
        })
    }

    /// Encode the packet payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.username.len() + self.auth_response.len());

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.put_bytes(0, 23);

        put_null_terminated(&mut buf, self.username.as_bytes());

        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            put_lenenc_bytes(&mut buf, &self.auth_response);
        } else if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.put_slice(&self.auth_response);
        } else {
            put_null_terminated(&mut buf, &self.auth_response);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            put_null_terminated(&mut buf, self.database.as_deref().unwrap_or("").as_bytes());
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            put_null_terminated(&mut buf, self.auth_plugin_name.as_bytes());
        }

        if self.capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = Vec::new();
            for (key, value) in &self.connect_attrs {
                put_lenenc_bytes(&mut attrs, key.as_bytes());
                put_lenenc_bytes(&mut attrs, value.as_bytes());
            }
            put_lenenc_int(&mut buf, attrs.len() as u64);
            buf.put_slice(&attrs);
        }

        buf
    }
}

/// AuthSwitchRequest payload asking the client to redo auth with `plugin`
pub fn encode_auth_switch_request(plugin: &str, salt: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + plugin.len() + salt.len() + 1);
    buf.put_u8(AUTH_SWITCH_REQUEST);
    put_null_terminated(&mut buf, plugin.as_bytes());
    put_null_terminated(&mut buf, salt);
    buf
}
