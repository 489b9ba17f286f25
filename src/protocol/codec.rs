//! Length-encoded integers and strings plus a bounds-checked payload reader.

use bytes::BufMut;

/// Number of bytes `value` takes as a length-encoded integer
pub fn lenenc_int_size(value: u64) -> usize {
    if value < 251 {
        1
    } else if value < 1 << 16 {
        3
    } else if value < 1 << 24 {
        4
    } else {
        9
    }
}

/// Number of bytes a length-encoded string of `len` bytes takes
pub fn lenenc_str_size(len: usize) -> usize {
    lenenc_int_size(len as u64) + len
}

/// Encode a length-encoded integer
pub fn put_lenenc_int<B: BufMut>(buf: &mut B, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 1 << 16 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 1 << 24 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded string
pub fn put_lenenc_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    put_lenenc_int(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Encode a NUL-terminated string
pub fn put_null_terminated<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_slice(data);
    buf.put_u8(0);
}

/// Cursor over a packet payload. Every read returns `None` instead of
/// panicking when the payload is too short.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at `pos`, e.g. after the command byte
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let b = self.read_bytes(2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> Option<u32> {
        let b = self.read_bytes(3)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let b = self.read_bytes(4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Some(u64::from_le_bytes(raw))
    }

    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Everything left in the payload
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data.get(self.pos..).unwrap_or(&[]);
        self.pos = self.data.len();
        rest
    }

    /// Read up to (and consume) the next NUL byte
    pub fn read_null_terminated(&mut self) -> Option<&'a [u8]> {
        let rest = self.data.get(self.pos..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }

    /// Length-encoded integer. The NULL marker (0xFB) and 0xFF are not
    /// integers and yield `None`.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_u8()? {
            b @ 0..=0xFA => Some(b as u64),
            0xFC => self.read_u16().map(u64::from),
            0xFD => self.read_u24().map(u64::from),
            0xFE => self.read_u64(),
            _ => None,
        }
    }

    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }
}
