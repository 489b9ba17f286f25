//! Server-side prepared statements: COM_STMT_PREPARE responses,
//! COM_STMT_EXECUTE parameter decoding and long-data accumulation.

use std::collections::HashMap;

use bytes::BufMut;

use crate::error::{codes, states, ConnError, SqlError};
use crate::protocol::packet::BINARY_CHARSET;
use crate::protocol::{column_flags, ColumnType, Field, PayloadReader, Value};

use super::Conn;

/// A statement prepared on one connection.
///
/// Bound parameters are keyed `v1`, `v2`, ... by position. The map is
/// replaced by a fresh one after every execute, so a handler may keep
/// what it was given.
#[derive(Debug, Clone)]
pub struct PrepareData {
    pub statement_id: u32,
    pub prepare_stmt: String,
    pub param_count: u16,
    /// Type and unsigned flag of each parameter, as last bound by the client
    pub param_types: Vec<(ColumnType, bool)>,
    pub bind_vars: HashMap<String, Value>,
    pub column_names: Vec<String>,
}

impl PrepareData {
    pub(crate) fn new(statement_id: u32, prepare_stmt: String, param_count: u16) -> Self {
        Self {
            statement_id,
            prepare_stmt,
            param_count,
            param_types: vec![(ColumnType::Null, false); param_count as usize],
            bind_vars: HashMap::with_capacity(param_count as usize),
            column_names: Vec::new(),
        }
    }

    /// Bind-variable name of the zero-based parameter `index`
    pub fn param_name(index: usize) -> String {
        format!("v{}", index + 1)
    }

    /// Bound value of the zero-based parameter `index`
    pub fn param(&self, index: usize) -> Option<&Value> {
        self.bind_vars.get(&Self::param_name(index))
    }

    /// Append a COM_STMT_SEND_LONG_DATA chunk to parameter `param_id`
    pub(crate) fn append_long_data(&mut self, param_id: u16, chunk: &[u8]) -> Result<(), SqlError> {
        if self.param_count == 0 || param_id >= self.param_count {
            return Err(SqlError::unknown(format!(
                "invalid parameter number {} for statement: {}",
                param_id, self.prepare_stmt
            )));
        }
        let value = self
            .bind_vars
            .entry(Self::param_name(param_id as usize))
            .or_insert_with(|| Value::Bytes(Vec::new()));
        match value {
            Value::Bytes(data) => data.extend_from_slice(chunk),
            other => *other = Value::Bytes(chunk.to_vec()),
        }
        Ok(())
    }

    /// COM_STMT_RESET: forget bound values and long data
    pub(crate) fn reset(&mut self) {
        self.bind_vars.clear();
    }

    /// Decode the parameters of a COM_STMT_EXECUTE payload (opcode
    /// included) into `bind_vars`. Parameters already filled by long data
    /// are left alone.
    pub(crate) fn bind_execute(&mut self, payload: &[u8]) -> Result<(), SqlError> {
        let mut r = PayloadReader::at(payload, 1);
        r.read_u32().ok_or_else(|| malformed("reading statement ID failed"))?;
        r.read_u8().ok_or_else(|| malformed("reading cursor type flags failed"))?;
        let iterations = r
            .read_u32()
            .ok_or_else(|| malformed("reading iteration count failed"))?;
        if iterations != 1 {
            return Err(malformed("iteration count is not equal to 1"));
        }

        let mut null_bitmap: &[u8] = &[];
        if self.param_count > 0 {
            null_bitmap = r
                .read_bytes((self.param_count as usize + 7) / 8)
                .ok_or_else(|| malformed("reading NULL-bitmap failed"))?;
        }

        if r.read_u8() == Some(0x01) {
            for i in 0..self.param_count as usize {
                let ty = r
                    .read_u8()
                    .ok_or_else(|| malformed("reading parameter type failed"))?;
                let flags = r
                    .read_u8()
                    .ok_or_else(|| malformed("reading parameter flags failed"))?;
                let column_type = ColumnType::from_u8(ty)
                    .ok_or_else(|| malformed(&format!("unknown parameter type {:#04x}", ty)))?;
                self.param_types[i] = (column_type, flags & 0x80 != 0);
            }
        }

        for (i, &(column_type, unsigned)) in self.param_types.iter().enumerate() {
            let name = Self::param_name(i);
            if self.bind_vars.contains_key(&name) {
                continue;
            }
            let value = if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
                Value::Null
            } else {
                Value::read_binary(&mut r, column_type, unsigned)
                    .ok_or_else(|| malformed(&format!("decoding parameter value {} failed", i + 1)))?
            };
            self.bind_vars.insert(name, value);
        }
        Ok(())
    }

    /// Start over with an empty bind-variable map
    pub(crate) fn renew_bind_vars(&mut self) {
        self.bind_vars = HashMap::with_capacity(self.param_count as usize);
    }
}

fn malformed(message: &str) -> SqlError {
    SqlError::new(codes::ER_MALFORMED_PACKET, states::UNKNOWN, message)
}

/// Column definition announced for every `?` placeholder
fn placeholder_field() -> Field {
    let mut field = Field::new("?", ColumnType::VarString);
    field.charset = BINARY_CHARSET;
    field.flags |= column_flags::BINARY_FLAG;
    field
}

impl Conn {
    /// Answer COM_STMT_PREPARE: the statement header, the parameter
    /// definitions and the column definitions, each list closed by an EOF
    /// unless the client deprecated it
    pub(crate) async fn write_prepare(&mut self, fields: &[Field], prepare: &mut PrepareData) -> Result<(), ConnError> {
        let param_count = prepare.param_count;
        let column_count = fields.len() as u16;
        prepare.column_names = fields.iter().map(|f| f.name.replace("'?'", "?")).collect();

        let statement_id = prepare.statement_id;
        self.write_encoded(12, |dst| {
            dst.put_u8(0x00);
            dst.put_u32_le(statement_id);
            dst.put_u16_le(column_count);
            dst.put_u16_le(param_count);
            dst.put_u8(0x00);
            dst.put_u16_le(0);
        })
        .await?;

        if param_count > 0 {
            let placeholder = placeholder_field();
            for _ in 0..param_count {
                self.write_column_definition(&placeholder).await?;
            }
            if !self.deprecate_eof() {
                self.write_eof_packet(self.session.status_flags(), 0).await?;
            }
        }

        if column_count > 0 {
            for (field, name) in fields.iter().zip(&prepare.column_names) {
                if field.name == *name {
                    self.write_column_definition(field).await?;
                } else {
                    let mut field = field.clone();
                    field.name = name.clone();
                    self.write_column_definition(&field).await?;
                }
            }
            if !self.deprecate_eof() {
                self.write_eof_packet(self.session.status_flags(), 0).await?;
            }
        }

        self.flush().await
    }
}
