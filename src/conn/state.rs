use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::protocol::packet::{capabilities::CLIENT_MULTI_STATEMENTS, status, DEFAULT_CHARSET};

/// Where a connection is in its command loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnPhase {
    /// Handshake in progress or between commands
    Idle = 0,
    /// Command packet in flight
    Reading = 1,
    /// Handler invoked
    Dispatching = 2,
    /// Response streaming
    Writing = 3,
    Closed = 4,
}

impl ConnPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnPhase::Reading,
            2 => ConnPhase::Dispatching,
            3 => ConnPhase::Writing,
            4 => ConnPhase::Closed,
            _ => ConnPhase::Idle,
        }
    }
}

type CancelFn = Arc<dyn Fn() + Send + Sync>;
type ClientData = Box<dyn Any + Send + Sync>;

/// Per-connection state shared between the connection task, its handler
/// and the listener.
///
/// Everything here may be touched from another task (kill requests,
/// close marking, introspection), so it lives behind atomics and locks.
pub struct Session {
    id: u32,
    remote_addr: Option<SocketAddr>,
    user: RwLock<String>,
    schema: RwLock<String>,
    connect_attrs: RwLock<Vec<(String, String)>>,
    capabilities: AtomicU32,
    character_set: AtomicU8,
    status_flags: AtomicU16,
    phase: AtomicU8,
    closed: AtomicBool,
    closing: Mutex<bool>,
    cancel: Mutex<Option<CancelFn>>,
    client_data: Mutex<Option<ClientData>>,
    close_token: CancellationToken,
}

impl Session {
    pub fn new(id: u32, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            remote_addr,
            user: RwLock::new(String::new()),
            schema: RwLock::new(String::new()),
            connect_attrs: RwLock::new(Vec::new()),
            capabilities: AtomicU32::new(0),
            character_set: AtomicU8::new(DEFAULT_CHARSET),
            status_flags: AtomicU16::new(status::SERVER_STATUS_AUTOCOMMIT),
            phase: AtomicU8::new(ConnPhase::Idle as u8),
            closed: AtomicBool::new(false),
            closing: Mutex::new(false),
            cancel: Mutex::new(None),
            client_data: Mutex::new(None),
            close_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn user(&self) -> String {
        self.user.read().clone()
    }

    pub(crate) fn set_user(&self, user: &str) {
        *self.user.write() = user.to_string();
    }

    /// Currently selected schema, empty if none
    pub fn schema(&self) -> String {
        self.schema.read().clone()
    }

    pub fn set_schema(&self, schema: &str) {
        *self.schema.write() = schema.to_string();
    }

    pub fn connect_attrs(&self) -> Vec<(String, String)> {
        self.connect_attrs.read().clone()
    }

    pub(crate) fn set_connect_attrs(&self, attrs: Vec<(String, String)>) {
        *self.connect_attrs.write() = attrs;
    }

    /// Negotiated capability flags
    pub fn capabilities(&self) -> u32 {
        self.capabilities.load(Ordering::Acquire)
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities() & flag != 0
    }

    pub(crate) fn set_capabilities(&self, capabilities: u32) {
        self.capabilities.store(capabilities, Ordering::Release);
    }

    /// COM_SET_OPTION toggles multi-statement support mid-connection
    pub(crate) fn set_multi_statements(&self, enabled: bool) {
        if enabled {
            self.capabilities.fetch_or(CLIENT_MULTI_STATEMENTS, Ordering::AcqRel);
        } else {
            self.capabilities.fetch_and(!CLIENT_MULTI_STATEMENTS, Ordering::AcqRel);
        }
    }

    pub fn character_set(&self) -> u8 {
        self.character_set.load(Ordering::Relaxed)
    }

    pub(crate) fn set_character_set(&self, charset: u8) {
        self.character_set.store(charset, Ordering::Relaxed);
    }

    /// Status flags reported in OK and EOF packets
    pub fn status_flags(&self) -> u16 {
        self.status_flags.load(Ordering::Acquire)
    }

    pub fn set_status_flag(&self, flag: u16, on: bool) {
        if on {
            self.status_flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.status_flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags() & status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn set_in_transaction(&self, on: bool) {
        self.set_status_flag(status::SERVER_STATUS_IN_TRANS, on);
    }

    pub fn phase(&self) -> ConnPhase {
        ConnPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: ConnPhase) {
        // Closed is terminal
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnPhase::Closed as u8).then_some(phase as u8)
            });
    }

    /// Close the connection. Pending reads and writes on it fail with
    /// [`ConnError::Closed`](crate::error::ConnError::Closed). Returns
    /// false if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.phase.store(ConnPhase::Closed as u8, Ordering::Release);
        self.close_token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    /// Ask the connection to wind down after the current command
    pub fn mark_for_close(&self) {
        *self.closing.lock() = true;
    }

    pub fn is_marked_for_close(&self) -> bool {
        *self.closing.lock()
    }

    /// Install the function that interrupts the handler's in-flight work
    pub fn set_cancel(&self, cancel: impl Fn() + Send + Sync + 'static) {
        *self.cancel.lock() = Some(Arc::new(cancel));
    }

    pub fn clear_cancel(&self) {
        *self.cancel.lock() = None;
    }

    /// Run the installed cancel function, if any. Returns whether one ran.
    /// The function runs without the lock held, so it may replace or
    /// clear itself.
    pub fn cancel(&self) -> bool {
        let cancel = self.cancel.lock().clone();
        match cancel {
            Some(cancel) => {
                cancel();
                true
            }
            None => false,
        }
    }

    /// Attach handler-owned data to this connection
    pub fn set_client_data<T: Any + Send + Sync>(&self, data: T) {
        *self.client_data.lock() = Some(Box::new(data));
    }

    /// Access handler-owned data of type `T`
    pub fn with_client_data<T: Any + Send + Sync, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.client_data.lock();
        f(guard.as_mut().and_then(|data| (**data).downcast_mut::<T>()))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("user", &*self.user.read())
            .field("schema", &*self.schema.read())
            .field("phase", &self.phase())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr {
            Some(addr) => write!(f, "client {} ({})", self.id, addr),
            None => write!(f, "client {}", self.id),
        }
    }
}
