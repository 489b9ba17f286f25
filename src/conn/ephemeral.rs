//! Single-owner discipline for pooled packet buffers.
//!
//! A connection borrows at most one ephemeral buffer at a time, either to
//! read a command into or to build a response packet in place. Every
//! `start_*` must be paired with the matching recycle before the next
//! one; breaking that pairing is a bug in the dispatcher and panics.

use std::sync::Arc;

use crate::pool::BufferPool;
use crate::protocol::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EphemeralPolicy {
    Unused,
    Read,
    Write,
}

#[derive(Debug)]
pub(crate) struct EphemeralTracker {
    conn_id: u32,
    policy: EphemeralPolicy,
    pooled: bool,
    pool: Arc<BufferPool>,
}

impl EphemeralTracker {
    pub(crate) fn new(conn_id: u32, pool: Arc<BufferPool>) -> Self {
        Self {
            conn_id,
            policy: EphemeralPolicy::Unused,
            pooled: false,
            pool,
        }
    }

    #[cfg(test)]
    pub(crate) fn policy(&self) -> EphemeralPolicy {
        self.policy
    }

    fn transition(&mut self, op: &str, from: EphemeralPolicy, to: EphemeralPolicy) {
        if self.policy != from {
            panic!(
                "{}: conn {} ephemeral buffer is {:?}, expected {:?}",
                op, self.conn_id, self.policy, from
            );
        }
        self.policy = to;
    }

    /// Borrow a buffer for a packet body of `length` bytes. Multi-segment
    /// payloads are allocated directly since they grow during reassembly.
    pub(crate) fn start_read(&mut self, length: usize) -> Vec<u8> {
        self.transition("start_ephemeral_read()", EphemeralPolicy::Unused, EphemeralPolicy::Read);
        self.pooled = length < MAX_PACKET_SIZE;
        if self.pooled {
            self.pool.get(length)
        } else {
            vec![0; length]
        }
    }

    pub(crate) fn recycle_read(&mut self, buf: Vec<u8>) {
        self.transition("recycle_read()", EphemeralPolicy::Read, EphemeralPolicy::Unused);
        if self.pooled {
            self.pool.put(buf);
        }
    }

    /// Borrow a buffer for a `length`-byte payload. Returns the buffer and
    /// the offset where the payload starts; the bytes before it are
    /// reserved for the packet header.
    pub(crate) fn start_write(&mut self, length: usize) -> (Vec<u8>, usize) {
        self.transition("start_ephemeral_write()", EphemeralPolicy::Unused, EphemeralPolicy::Write);
        (self.pool.get(length + PACKET_HEADER_SIZE), PACKET_HEADER_SIZE)
    }

    pub(crate) fn recycle_write(&mut self, buf: Vec<u8>) {
        self.transition("recycle_write()", EphemeralPolicy::Write, EphemeralPolicy::Unused);
        self.pool.put(buf);
    }
}
