//! One client connection: framing state, pooled packet buffers, buffered
//! output, prepared statements, and the packet encoders used to answer
//! commands.

mod accept;
mod dispatch;
mod ephemeral;
mod prepare;
mod state;
mod writer;

pub use accept::TlsAcceptor;
pub use prepare::PrepareData;
pub use state::{ConnPhase, Session};

pub(crate) use accept::handshake;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{ConnError, SqlError};
use crate::pool::BufferPool;
use crate::protocol::codec::{lenenc_int_size, lenenc_str_size, put_lenenc_bytes, put_lenenc_int};
use crate::protocol::packet::{
    capabilities::CLIENT_DEPRECATE_EOF, status::SERVER_MORE_RESULTS_EXISTS, EOF_PACKET, MAX_PACKET_SIZE, NULL_VALUE,
};
use crate::protocol::{ColumnType, EofPacket, ErrPacket, Field, Framer, OkPacket, Value};

use ephemeral::EphemeralTracker;
use writer::ConnWriter;

/// A bidirectional byte stream a connection can run on
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Per-connection knobs, taken from `[server]`
#[derive(Debug, Clone)]
pub struct ConnOptions {
    pub server_version: String,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub flush_delay: Duration,
    pub multi_query: bool,
    pub slow_connect_warn_threshold: Option<Duration>,
}

impl ConnOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            server_version: config.server_version.clone(),
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            flush_delay: config.flush_delay(),
            multi_query: config.multi_query,
            slow_connect_warn_threshold: config.slow_connect_warn_threshold(),
        }
    }
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// What every connection of one listener shares
pub(crate) struct ConnContext {
    pub(crate) options: ConnOptions,
    pub(crate) pool: Arc<BufferPool>,
    /// Set once the listener stops accepting
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) tls: Option<Arc<dyn TlsAcceptor>>,
}

/// A client connection after the handshake
pub(crate) struct Conn {
    pub(crate) session: Arc<Session>,
    pub(crate) framer: Framer,
    reader: BoxedRead,
    pub(crate) writer: ConnWriter,
    pub(crate) ephemeral: EphemeralTracker,
    pub(crate) prepared: HashMap<u32, PrepareData>,
    /// Last statement id handed out; ids are never reused
    pub(crate) statement_id: u32,
    pub(crate) ctx: Arc<ConnContext>,
}

/// Run `fut` unless the connection is closed first
async fn interruptible<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, ConnError>>,
) -> Result<T, ConnError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ConnError::Closed),
        result = fut => result,
    }
}

impl Conn {
    pub(crate) fn new(stream: Box<dyn Transport>, session: Arc<Session>, ctx: Arc<ConnContext>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let options = &ctx.options;

        let reader: BoxedRead = if options.read_buffer_size > 0 {
            Box::new(BufReader::with_capacity(options.read_buffer_size, read_half))
        } else {
            Box::new(read_half)
        };
        let writer = ConnWriter::new(
            session.id(),
            session.close_token().clone(),
            Box::new(write_half),
            ctx.pool.clone(),
            options.write_buffer_size,
            options.flush_delay,
        );

        Self {
            ephemeral: EphemeralTracker::new(session.id(), ctx.pool.clone()),
            session,
            framer: Framer::new(),
            reader,
            writer,
            prepared: HashMap::new(),
            statement_id: 0,
            ctx,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.session.id()
    }

    fn deprecate_eof(&self) -> bool {
        self.session.has_capability(CLIENT_DEPRECATE_EOF)
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Read one command packet into an ephemeral buffer. The caller must
    /// hand the buffer back with `recycle_read_packet`.
    pub(crate) async fn read_ephemeral_packet(&mut self) -> Result<Vec<u8>, ConnError> {
        let session = self.session.clone();
        interruptible(session.close_token(), self.read_ephemeral_inner()).await
    }

    async fn read_ephemeral_inner(&mut self) -> Result<Vec<u8>, ConnError> {
        let length = self.framer.read_header(&mut self.reader).await?;
        let mut data = self.ephemeral.start_read(length);
        if length == 0 {
            return Ok(data);
        }

        if let Err(e) = self.framer.read_body(&mut self.reader, &mut data).await {
            self.ephemeral.recycle_read(data);
            return Err(e);
        }
        if length == MAX_PACKET_SIZE {
            if let Err(e) = self.framer.read_continuation(&mut self.reader, &mut data).await {
                self.ephemeral.recycle_read(data);
                return Err(e);
            }
        }
        Ok(data)
    }

    pub(crate) fn recycle_read_packet(&mut self, data: Vec<u8>) {
        self.ephemeral.recycle_read(data);
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Borrow a buffer for a `length`-byte payload, starting at the
    /// returned offset
    pub(crate) fn start_ephemeral_packet(&mut self, length: usize) -> (Vec<u8>, usize) {
        self.ephemeral.start_write(length)
    }

    /// Send a buffer from `start_ephemeral_packet` and return it to the pool
    pub(crate) async fn write_ephemeral_packet(&mut self, mut data: Vec<u8>) -> Result<(), ConnError> {
        let session = self.session.clone();
        let result = interruptible(
            session.close_token(),
            self.writer.write_packet(&mut self.framer, &mut data),
        )
        .await;
        self.ephemeral.recycle_write(data);
        result
    }

    /// Build a `length`-byte payload with `encode` and send it
    async fn write_encoded<F>(&mut self, length: usize, encode: F) -> Result<(), ConnError>
    where
        F: FnOnce(&mut &mut [u8]),
    {
        let (mut data, pos) = self.start_ephemeral_packet(length);
        let mut dst = &mut data[pos..];
        encode(&mut dst);
        if !dst.is_empty() {
            panic!(
                "conn {}: packet encoding left {} of {} bytes unwritten",
                self.id(),
                dst.len(),
                length
            );
        }
        self.write_ephemeral_packet(data).await
    }

    pub(crate) async fn flush(&mut self) -> Result<(), ConnError> {
        let session = self.session.clone();
        interruptible(session.close_token(), self.writer.flush()).await
    }

    pub(crate) async fn start_writer_buffering(&mut self) {
        self.writer.start_buffering().await;
    }

    pub(crate) async fn end_writer_buffering(&mut self) -> Result<(), ConnError> {
        self.writer.end_buffering().await
    }

    /// Flush and close the write half
    pub(crate) async fn shutdown(&mut self) {
        let session = self.session.clone();
        let _ = interruptible(session.close_token(), async {
            self.writer.shutdown().await;
            Ok(())
        })
        .await;
    }

    // ------------------------------------------------------------------
    // Result encoder
    // ------------------------------------------------------------------

    pub(crate) async fn write_ok_packet(&mut self, ok: &OkPacket) -> Result<(), ConnError> {
        let capabilities = self.session.capabilities();
        let length = ok.encoded_len(capabilities);
        self.write_encoded(length, |dst| ok.encode_into(dst, capabilities)).await
    }

    /// OK with the session's status flags and nothing else
    pub(crate) async fn write_ok(&mut self) -> Result<(), ConnError> {
        self.write_ok_packet(&OkPacket::new(self.session.status_flags())).await
    }

    pub(crate) async fn write_err(&mut self, err: &SqlError) -> Result<(), ConnError> {
        let packet = ErrPacket::from(err);
        self.write_encoded(packet.encoded_len(), |dst| packet.encode_into(dst)).await
    }

    pub(crate) async fn write_eof_packet(&mut self, status_flags: u16, warnings: u16) -> Result<(), ConnError> {
        let packet = EofPacket { warnings, status_flags };
        self.write_encoded(EofPacket::LEN, |dst| packet.encode_into(dst)).await
    }

    /// Terminate a result set: an EOF packet, or under CLIENT_DEPRECATE_EOF
    /// an OK packet carrying the EOF header
    pub(crate) async fn write_end_result(
        &mut self,
        more: bool,
        affected_rows: u64,
        last_insert_id: u64,
        warnings: u16,
    ) -> Result<(), ConnError> {
        let mut flags = self.session.status_flags();
        if more {
            flags |= SERVER_MORE_RESULTS_EXISTS;
        }

        if self.deprecate_eof() {
            let ok = OkPacket {
                header: EOF_PACKET,
                affected_rows,
                last_insert_id,
                status_flags: flags,
                warnings,
                ..Default::default()
            };
            self.write_ok_packet(&ok).await
        } else {
            self.write_eof_packet(flags, warnings).await
        }
    }

    pub(crate) async fn write_column_definition(&mut self, field: &Field) -> Result<(), ConnError> {
        self.write_encoded(field.encoded_len(), |dst| field.encode_into(dst)).await
    }

    /// Column count, one definition per column, then EOF unless the client
    /// deprecated it
    pub(crate) async fn write_fields(&mut self, fields: &[Field]) -> Result<(), ConnError> {
        let count = fields.len() as u64;
        self.write_encoded(lenenc_int_size(count), |dst| put_lenenc_int(dst, count))
            .await?;

        for field in fields {
            self.write_column_definition(field).await?;
        }

        if !self.deprecate_eof() {
            self.write_eof_packet(self.session.status_flags(), 0).await?;
        }
        Ok(())
    }

    /// Text-protocol rows
    pub(crate) async fn write_rows(&mut self, fields: &[Field], rows: &[Vec<Value>]) -> Result<(), ConnError> {
        for row in rows {
            let texts: Vec<Option<_>> = row
                .iter()
                .enumerate()
                .map(|(i, value)| value.to_text(column_type(fields, i)))
                .collect();

            let length = texts
                .iter()
                .map(|text| match text {
                    None => 1,
                    Some(bytes) => lenenc_str_size(bytes.len()),
                })
                .sum();

            self.write_encoded(length, |dst| {
                for text in &texts {
                    match text {
                        None => dst.put_u8(NULL_VALUE),
                        Some(bytes) => put_lenenc_bytes(dst, bytes),
                    }
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Binary-protocol rows: a 0x00 header, a NULL bitmap offset by two
    /// bits, then the non-NULL values in column order
    pub(crate) async fn write_binary_rows(&mut self, fields: &[Field], rows: &[Vec<Value>]) -> Result<(), ConnError> {
        for row in rows {
            let mut values = Vec::with_capacity(row.len());
            for (i, value) in row.iter().enumerate() {
                values.push(value.to_binary(column_type(fields, i))?);
            }

            let bitmap_len = (values.len() + 7 + 2) / 8;
            let length = 1 + bitmap_len
                + values
                    .iter()
                    .flatten()
                    .map(|value| value.encoded_len())
                    .sum::<usize>();

            self.write_encoded(length, |dst| {
                dst.put_u8(0x00);
                let mut bitmap = vec![0u8; bitmap_len];
                for (i, value) in values.iter().enumerate() {
                    if value.is_none() {
                        let bit = i + 2;
                        bitmap[bit / 8] |= 1 << (bit % 8);
                    }
                }
                dst.put_slice(&bitmap);
                for value in values.iter().flatten() {
                    value.encode_into(dst);
                }
            })
            .await?;
        }
        Ok(())
    }
}

fn column_type(fields: &[Field], index: usize) -> ColumnType {
    fields
        .get(index)
        .map_or(ColumnType::VarString, |field| field.column_type)
}
