//! Column definitions and typed values for text and binary rows.

use std::borrow::Cow;
use std::fmt::Write as _;

use bytes::BufMut;

use crate::error::{codes, states, SqlError};

use super::codec::{lenenc_int_size, lenenc_str_size, put_lenenc_bytes, PayloadReader};
use super::packet::{BINARY_CHARSET, DEFAULT_CHARSET};

/// MySQL column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    DateTime = 0x0c,
    Year = 0x0d,
    NewDate = 0x0e,
    VarChar = 0x0f,
    Bit = 0x10,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    TinyBlob = 0xf9,
    MediumBlob = 0xfa,
    LongBlob = 0xfb,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let ty = match value {
            0x00 => Self::Decimal,
            0x01 => Self::Tiny,
            0x02 => Self::Short,
            0x03 => Self::Long,
            0x04 => Self::Float,
            0x05 => Self::Double,
            0x06 => Self::Null,
            0x07 => Self::Timestamp,
            0x08 => Self::LongLong,
            0x09 => Self::Int24,
            0x0a => Self::Date,
            0x0b => Self::Time,
            0x0c => Self::DateTime,
            0x0d => Self::Year,
            0x0e => Self::NewDate,
            0x0f => Self::VarChar,
            0x10 => Self::Bit,
            0xf5 => Self::Json,
            0xf6 => Self::NewDecimal,
            0xf7 => Self::Enum,
            0xf8 => Self::Set,
            0xf9 => Self::TinyBlob,
            0xfa => Self::MediumBlob,
            0xfb => Self::LongBlob,
            0xfc => Self::Blob,
            0xfd => Self::VarString,
            0xfe => Self::String,
            0xff => Self::Geometry,
            _ => return None,
        };
        Some(ty)
    }

    /// Numeric and temporal types use the binary charset in column definitions
    pub fn is_binary_charset(self) -> bool {
        matches!(
            self,
            Self::Tiny
                | Self::Short
                | Self::Long
                | Self::Float
                | Self::Double
                | Self::Null
                | Self::Timestamp
                | Self::LongLong
                | Self::Int24
                | Self::Date
                | Self::Time
                | Self::DateTime
                | Self::Year
                | Self::NewDate
                | Self::Bit
        )
    }
}

/// Column definition flags
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL_FLAG: u16 = 0x0001;
    pub const PRI_KEY_FLAG: u16 = 0x0002;
    pub const UNIQUE_KEY_FLAG: u16 = 0x0004;
    pub const MULTIPLE_KEY_FLAG: u16 = 0x0008;
    pub const BLOB_FLAG: u16 = 0x0010;
    pub const UNSIGNED_FLAG: u16 = 0x0020;
    pub const ZEROFILL_FLAG: u16 = 0x0040;
    pub const BINARY_FLAG: u16 = 0x0080;
    pub const ENUM_FLAG: u16 = 0x0100;
    pub const AUTO_INCREMENT_FLAG: u16 = 0x0200;
    pub const TIMESTAMP_FLAG: u16 = 0x0400;
    pub const SET_FLAG: u16 = 0x0800;
    pub const NUM_FLAG: u16 = 0x8000;
}

/// Column definition (Protocol::ColumnDefinition41)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub org_name: String,
    pub table: String,
    pub org_table: String,
    pub database: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: u16,
    pub decimals: u8,
}

impl Field {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let charset = if column_type.is_binary_charset() {
            BINARY_CHARSET
        } else {
            DEFAULT_CHARSET as u16
        };
        let mut flags = 0;
        if column_type.is_binary_charset() {
            flags |= column_flags::BINARY_FLAG;
        }
        Self {
            name: name.into(),
            org_name: String::new(),
            table: String::new(),
            org_table: String::new(),
            database: String::new(),
            charset,
            column_length: 0,
            column_type,
            flags,
            decimals: 0,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED_FLAG != 0
    }

    pub fn encoded_len(&self) -> usize {
        lenenc_str_size(3) // "def"
            + lenenc_str_size(self.database.len())
            + lenenc_str_size(self.table.len())
            + lenenc_str_size(self.org_table.len())
            + lenenc_str_size(self.name.len())
            + lenenc_str_size(self.org_name.len())
            + 1 // length of fixed fields
            + 2
            + 4
            + 1
            + 2
            + 1
            + 2 // filler
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        put_lenenc_bytes(buf, b"def");
        put_lenenc_bytes(buf, self.database.as_bytes());
        put_lenenc_bytes(buf, self.table.as_bytes());
        put_lenenc_bytes(buf, self.org_table.as_bytes());
        put_lenenc_bytes(buf, self.name.as_bytes());
        put_lenenc_bytes(buf, self.org_name.as_bytes());
        buf.put_u8(0x0c);
        buf.put_u16_le(self.charset);
        buf.put_u32_le(self.column_length);
        buf.put_u8(self.column_type as u8);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_u16(0);
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        let mut text = || -> Option<String> {
            Some(String::from_utf8_lossy(r.read_lenenc_bytes()?).to_string())
        };
        let _catalog = text()?;
        let database = text()?;
        let table = text()?;
        let org_table = text()?;
        let name = text()?;
        let org_name = text()?;

        r.skip(1)?;
        Some(Self {
            name,
            org_name,
            table,
            org_table,
            database,
            charset: r.read_u16()?,
            column_length: r.read_u32()?,
            column_type: ColumnType::from_u8(r.read_u8()?)?,
            flags: r.read_u16()?,
            decimals: r.read_u8()?,
        })
    }
}

/// DATE / DATETIME / TIMESTAMP value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

impl DateTime {
    fn has_time(&self) -> bool {
        self.hour != 0 || self.minute != 0 || self.second != 0 || self.micros != 0
    }

    fn is_zero(&self) -> bool {
        self.year == 0 && self.month == 0 && self.day == 0 && !self.has_time()
    }

    /// Parse `YYYY-MM-DD[ HH:MM:SS[.ffffff]]`
    pub fn parse(s: &str) -> Option<Self> {
        let (date, time) = match s.split_once(' ') {
            Some((d, t)) => (d, Some(t)),
            None => (s, None),
        };
        let mut parts = date.splitn(3, '-');
        let mut dt = DateTime {
            year: parts.next()?.parse().ok()?,
            month: parts.next()?.parse().ok()?,
            day: parts.next()?.parse().ok()?,
            ..Default::default()
        };
        if let Some(time) = time {
            let (hms, micros) = split_fraction(time)?;
            let mut parts = hms.splitn(3, ':');
            dt.hour = parts.next()?.parse().ok()?;
            dt.minute = parts.next()?.parse().ok()?;
            dt.second = parts.next()?.parse().ok()?;
            dt.micros = micros;
        }
        Some(dt)
    }

    fn format(&self, date_only: bool) -> String {
        let mut s = format!("{:04}-{:02}-{:02}", self.year, self.month, self.day);
        if !date_only {
            let _ = write!(s, " {:02}:{:02}:{:02}", self.hour, self.minute, self.second);
            if self.micros != 0 {
                let _ = write!(s, ".{:06}", self.micros);
            }
        }
        s
    }
}

/// TIME value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Time {
    pub negative: bool,
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

impl Time {
    fn is_zero(&self) -> bool {
        self.days == 0 && self.hours == 0 && self.minutes == 0 && self.seconds == 0 && self.micros == 0
    }

    /// Parse `[-]H:MM:SS[.ffffff]`, hours may exceed 24
    pub fn parse(s: &str) -> Option<Self> {
        let (negative, s) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (hms, micros) = split_fraction(s)?;
        let mut parts = hms.splitn(3, ':');
        let total_hours: u32 = parts.next()?.parse().ok()?;
        Some(Time {
            negative,
            days: total_hours / 24,
            hours: (total_hours % 24) as u8,
            minutes: parts.next()?.parse().ok()?,
            seconds: parts.next()?.parse().ok()?,
            micros,
        })
    }

    fn format(&self) -> String {
        let mut s = String::new();
        if self.negative {
            s.push('-');
        }
        let hours = self.days * 24 + self.hours as u32;
        let _ = write!(s, "{:02}:{:02}:{:02}", hours, self.minutes, self.seconds);
        if self.micros != 0 {
            let _ = write!(s, ".{:06}", self.micros);
        }
        s
    }
}

fn split_fraction(s: &str) -> Option<(&str, u32)> {
    match s.split_once('.') {
        Some((hms, frac)) => {
            if frac.is_empty() || frac.len() > 6 {
                return None;
            }
            let digits: u32 = frac.parse().ok()?;
            Some((hms, digits * 10u32.pow(6 - frac.len() as u32)))
        }
        None => Some((s, 0)),
    }
}

/// A single column value in a row or a bound statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    DateTime(DateTime),
    Time(Time),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text-protocol representation. `None` is SQL NULL.
    pub fn to_text(&self, column_type: ColumnType) -> Option<Cow<'_, [u8]>> {
        let text = match self {
            Value::Null => return None,
            Value::Bytes(b) => return Some(Cow::Borrowed(b.as_slice())),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Double(d) => d.to_string(),
            Value::DateTime(dt) => dt.format(matches!(column_type, ColumnType::Date | ColumnType::NewDate)),
            Value::Time(t) => t.format(),
        };
        Some(Cow::Owned(text.into_bytes()))
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => Some(*u as i64),
            Value::Float(f) => Some(*f as i64),
            Value::Double(d) => Some(*d as i64),
            Value::Bytes(_) => {
                let s = self.as_text()?.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<u64>().ok().map(|u| u as i64))
            }
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f as f64),
            Value::Double(d) => Some(*d),
            Value::Bytes(_) => self.as_text()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert to the binary-protocol shape of `column_type`. `None` is SQL NULL.
    pub fn to_binary(&self, column_type: ColumnType) -> Result<Option<BinaryValue<'_>>, SqlError> {
        if self.is_null() {
            return Ok(None);
        }
        let conversion_error = || {
            SqlError::new(
                codes::ER_UNKNOWN_ERROR,
                states::UNKNOWN,
                format!("cannot encode {:?} as {:?}", self, column_type),
            )
        };

        let binary = match column_type {
            ColumnType::Tiny => BinaryValue::Int(self.as_i64().ok_or_else(conversion_error)? as u64, 1),
            ColumnType::Short | ColumnType::Year => {
                BinaryValue::Int(self.as_i64().ok_or_else(conversion_error)? as u64, 2)
            }
            ColumnType::Long | ColumnType::Int24 => {
                BinaryValue::Int(self.as_i64().ok_or_else(conversion_error)? as u64, 4)
            }
            ColumnType::LongLong => BinaryValue::Int(self.as_i64().ok_or_else(conversion_error)? as u64, 8),
            ColumnType::Float => BinaryValue::Float(self.as_f64().ok_or_else(conversion_error)? as f32),
            ColumnType::Double => BinaryValue::Double(self.as_f64().ok_or_else(conversion_error)?),
            ColumnType::Date | ColumnType::NewDate | ColumnType::DateTime | ColumnType::Timestamp => {
                let dt = match self {
                    Value::DateTime(dt) => *dt,
                    _ => self
                        .as_text()
                        .and_then(DateTime::parse)
                        .ok_or_else(conversion_error)?,
                };
                BinaryValue::DateTime(dt, matches!(column_type, ColumnType::Date | ColumnType::NewDate))
            }
            ColumnType::Time => {
                let t = match self {
                    Value::Time(t) => *t,
                    _ => self.as_text().and_then(Time::parse).ok_or_else(conversion_error)?,
                };
                BinaryValue::Time(t)
            }
            _ => BinaryValue::Bytes(self.to_text(column_type).unwrap_or(Cow::Borrowed(&[][..]))),
        };
        Ok(Some(binary))
    }

    /// Read a bound parameter of `column_type` from a COM_STMT_EXECUTE payload
    pub fn read_binary(r: &mut PayloadReader<'_>, column_type: ColumnType, unsigned: bool) -> Option<Value> {
        let value = match column_type {
            ColumnType::Null => Value::Null,
            ColumnType::Tiny => {
                let v = r.read_u8()?;
                if unsigned {
                    Value::UInt(v as u64)
                } else {
                    Value::Int(v as i8 as i64)
                }
            }
            ColumnType::Short | ColumnType::Year => {
                let v = r.read_u16()?;
                if unsigned {
                    Value::UInt(v as u64)
                } else {
                    Value::Int(v as i16 as i64)
                }
            }
            ColumnType::Long | ColumnType::Int24 => {
                let v = r.read_u32()?;
                if unsigned {
                    Value::UInt(v as u64)
                } else {
                    Value::Int(v as i32 as i64)
                }
            }
            ColumnType::LongLong => {
                let v = r.read_u64()?;
                if unsigned {
                    Value::UInt(v)
                } else {
                    Value::Int(v as i64)
                }
            }
            ColumnType::Float => Value::Float(f32::from_bits(r.read_u32()?)),
            ColumnType::Double => Value::Double(f64::from_bits(r.read_u64()?)),
            ColumnType::Date | ColumnType::NewDate | ColumnType::DateTime | ColumnType::Timestamp => {
                let len = r.read_u8()?;
                let mut dt = DateTime::default();
                if len >= 4 {
                    dt.year = r.read_u16()?;
                    dt.month = r.read_u8()?;
                    dt.day = r.read_u8()?;
                }
                if len >= 7 {
                    dt.hour = r.read_u8()?;
                    dt.minute = r.read_u8()?;
                    dt.second = r.read_u8()?;
                }
                if len >= 11 {
                    dt.micros = r.read_u32()?;
                }
                if !matches!(len, 0 | 4 | 7 | 11) {
                    return None;
                }
                Value::DateTime(dt)
            }
            ColumnType::Time => {
                let len = r.read_u8()?;
                let mut t = Time::default();
                if len >= 8 {
                    t.negative = r.read_u8()? == 1;
                    t.days = r.read_u32()?;
                    t.hours = r.read_u8()?;
                    t.minutes = r.read_u8()?;
                    t.seconds = r.read_u8()?;
                }
                if len >= 12 {
                    t.micros = r.read_u32()?;
                }
                if !matches!(len, 0 | 8 | 12) {
                    return None;
                }
                Value::Time(t)
            }
            _ => Value::Bytes(r.read_lenenc_bytes()?.to_vec()),
        };
        Some(value)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Bytes(v.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A value already shaped for a binary-protocol row
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryValue<'a> {
    /// little-endian integer of the given byte width
    Int(u64, usize),
    Float(f32),
    Double(f64),
    /// the flag selects the date-only encoding
    DateTime(DateTime, bool),
    Time(Time),
    Bytes(Cow<'a, [u8]>),
}

impl BinaryValue<'_> {
    pub fn encoded_len(&self) -> usize {
        match self {
            BinaryValue::Int(_, width) => *width,
            BinaryValue::Float(_) => 4,
            BinaryValue::Double(_) => 8,
            BinaryValue::DateTime(dt, date_only) => 1 + datetime_len(dt, *date_only),
            BinaryValue::Time(t) => 1 + time_len(t),
            BinaryValue::Bytes(b) => lenenc_int_size(b.len() as u64) + b.len(),
        }
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        match self {
            BinaryValue::Int(v, width) => buf.put_uint_le(*v & width_mask(*width), *width),
            BinaryValue::Float(f) => buf.put_f32_le(*f),
            BinaryValue::Double(d) => buf.put_f64_le(*d),
            BinaryValue::DateTime(dt, date_only) => {
                let len = datetime_len(dt, *date_only);
                buf.put_u8(len as u8);
                if len >= 4 {
                    buf.put_u16_le(dt.year);
                    buf.put_u8(dt.month);
                    buf.put_u8(dt.day);
                }
                if len >= 7 {
                    buf.put_u8(dt.hour);
                    buf.put_u8(dt.minute);
                    buf.put_u8(dt.second);
                }
                if len >= 11 {
                    buf.put_u32_le(dt.micros);
                }
            }
            BinaryValue::Time(t) => {
                let len = time_len(t);
                buf.put_u8(len as u8);
                if len >= 8 {
                    buf.put_u8(t.negative as u8);
                    buf.put_u32_le(t.days);
                    buf.put_u8(t.hours);
                    buf.put_u8(t.minutes);
                    buf.put_u8(t.seconds);
                }
                if len >= 12 {
                    buf.put_u32_le(t.micros);
                }
            }
            BinaryValue::Bytes(b) => put_lenenc_bytes(buf, b),
        }
    }
}

fn width_mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

fn datetime_len(dt: &DateTime, date_only: bool) -> usize {
    if dt.is_zero() {
        0
    } else if date_only || !dt.has_time() {
        4
    } else if dt.micros == 0 {
        7
    } else {
        11
    }
}

fn time_len(t: &Time) -> usize {
    if t.is_zero() {
        0
    } else if t.micros == 0 {
        8
    } else {
        12
    }
}
