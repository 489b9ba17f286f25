//! Packet framing: 4-byte headers, sequence tracking, and splitting/joining
//! payloads at the 16MiB segment boundary.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ConnError;

use super::packet::{header_length, write_header, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Per-connection framing state.
///
/// The sequence counter is reset to 0 at the start of every command and
/// advanced once per physical packet read or written.
#[derive(Debug, Default)]
pub struct Framer {
    sequence: u8,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Read a packet header and return the declared body length.
    ///
    /// A stream that ends before the first header byte, or a connection
    /// reset by the peer, is reported as [`ConnError::Eof`].
    pub async fn read_header<R>(&mut self, r: &mut R) -> Result<usize, ConnError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        let mut filled = 0;
        while filled < PACKET_HEADER_SIZE {
            match r.read(&mut header[filled..]).await {
                Ok(0) if filled == 0 => return Err(ConnError::Eof),
                Ok(0) => {
                    return Err(ConnError::io(
                        "read packet header",
                        io::ErrorKind::UnexpectedEof.into(),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Err(ConnError::Eof),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnError::io("read packet header", e)),
            }
        }

        let sequence = header[3];
        if sequence != self.sequence {
            return Err(ConnError::Sequence {
                expected: self.sequence,
                got: sequence,
            });
        }
        self.sequence = self.sequence.wrapping_add(1);

        Ok(header_length(&header))
    }

    /// Fill `buf` with exactly `buf.len()` body bytes
    pub async fn read_body<R>(&mut self, r: &mut R, buf: &mut [u8]) -> Result<(), ConnError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let length = buf.len();
        r.read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|e| ConnError::io(format!("read packet body of length {}", length), e))
    }

    /// Read exactly one physical packet. A zero-length packet yields an empty body.
    pub async fn read_one_packet<R>(&mut self, r: &mut R) -> Result<Vec<u8>, ConnError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let length = self.read_header(r).await?;
        let mut data = vec![0u8; length];
        if length > 0 {
            self.read_body(r, &mut data).await?;
        }
        Ok(data)
    }

    /// Append continuation segments to `data` until a segment shorter than
    /// the maximum arrives. A trailing empty segment only terminates.
    pub async fn read_continuation<R>(&mut self, r: &mut R, data: &mut Vec<u8>) -> Result<(), ConnError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            let next = self.read_one_packet(r).await?;
            if next.is_empty() {
                return Ok(());
            }
            data.extend_from_slice(&next);
            if next.len() < MAX_PACKET_SIZE {
                return Ok(());
            }
        }
    }

    /// Read one logical payload, joining multi-segment packets
    pub async fn read_full<R>(&mut self, r: &mut R) -> Result<Vec<u8>, ConnError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut data = self.read_one_packet(r).await?;
        if data.len() == MAX_PACKET_SIZE {
            self.read_continuation(r, &mut data).await?;
        }
        Ok(data)
    }

    /// Write one logical payload.
    ///
    /// `data[..PACKET_HEADER_SIZE]` is scratch space for the first header and
    /// the payload follows it. Each segment's header is written over the 4
    /// bytes in front of it and those bytes are restored afterwards. A
    /// payload ending on an exact segment boundary is followed by an empty
    /// packet.
    pub async fn write_packet<W>(&mut self, w: &mut W, data: &mut [u8]) -> Result<(), ConnError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        assert!(
            data.len() >= PACKET_HEADER_SIZE,
            "write_packet: buffer of {} bytes has no header space",
            data.len()
        );

        let mut index = 0;
        let mut remaining = data.len() - PACKET_HEADER_SIZE;
        loop {
            let to_send = remaining.min(MAX_PACKET_SIZE);

            let mut saved = [0u8; PACKET_HEADER_SIZE];
            saved.copy_from_slice(&data[index..index + PACKET_HEADER_SIZE]);
            write_header(&mut data[index..], to_send, self.sequence);

            let result = w
                .write_all(&data[index..index + PACKET_HEADER_SIZE + to_send])
                .await;
            data[index..index + PACKET_HEADER_SIZE].copy_from_slice(&saved);
            result.map_err(write_error)?;

            self.sequence = self.sequence.wrapping_add(1);
            remaining -= to_send;
            if remaining == 0 {
                if to_send == MAX_PACKET_SIZE {
                    let mut header = [0u8; PACKET_HEADER_SIZE];
                    write_header(&mut header, 0, self.sequence);
                    w.write_all(&header).await.map_err(write_error)?;
                    self.sequence = self.sequence.wrapping_add(1);
                }
                return Ok(());
            }
            index += to_send;
        }
    }

    /// Write a payload that was built without header space
    pub async fn write_payload<W>(&mut self, w: &mut W, payload: &[u8]) -> Result<(), ConnError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut data = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        data.extend_from_slice(&[0u8; PACKET_HEADER_SIZE]);
        data.extend_from_slice(payload);
        self.write_packet(w, &mut data).await
    }
}

fn write_error(e: io::Error) -> ConnError {
    if e.kind() == io::ErrorKind::WriteZero {
        ConnError::Protocol(format!("Write(packet) returned a short write: {}", e))
    } else {
        ConnError::io("Write(packet) failed", e)
    }
}
