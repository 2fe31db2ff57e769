//! Active connections and their registry
//!
//! Every call the system knows about, whether observed on the router's call
//! monitor or placed by the [`CallDialer`](crate::dialer::CallDialer), is a
//! [`Connection`] held by the [`ConnectionRegistry`].
//!
//! # Lifecycle
//!
//! ```text
//!   add(INCOMING|OUTGOING) ──► set_type(CONNECT) ──► set_type(DISCONNECT) ──► remove
//! ```
//!
//! Type bits only accumulate. A connection that saw `INCOMING` and then
//! `DISCONNECT` without `CONNECT` is a missed call.
//!
//! Call monitor ids and transport bearer ids are separate number ranges,
//! so each connection is keyed by its [`ConnectionOrigin`] as well as its id.
//!
//! The registry does not emit events itself; callers notify collaborators
//! after mutating it.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::{TelephonyError, TelephonyResult};
use crate::fax::FaxJob;
use crate::number::scramble_number;
use crate::transport::BearerConnection;

/// Connection type bit mask
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConnectionType(u8);

impl ConnectionType {
    pub const NONE: ConnectionType = ConnectionType(0x00);
    pub const INCOMING: ConnectionType = ConnectionType(0x01);
    pub const OUTGOING: ConnectionType = ConnectionType(0x02);
    pub const CONNECT: ConnectionType = ConnectionType(0x04);
    pub const DISCONNECT: ConnectionType = ConnectionType(0x08);
    pub const MISSED: ConnectionType = ConnectionType(0x01 | 0x08);

    pub const fn from_bits(bits: u8) -> Self {
        ConnectionType(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set in `self`
    pub const fn contains(self, other: ConnectionType) -> bool {
        self.0 & other.0 == other.0
    }

    /// Incoming call that ended without being answered
    pub const fn is_missed(self) -> bool {
        self.contains(Self::MISSED) && !self.contains(Self::CONNECT)
    }
}

impl BitOr for ConnectionType {
    type Output = ConnectionType;

    fn bitor(self, rhs: ConnectionType) -> ConnectionType {
        ConnectionType(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConnectionType {
    fn bitor_assign(&mut self, rhs: ConnectionType) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::INCOMING, "INCOMING"),
            (Self::OUTGOING, "OUTGOING"),
            (Self::CONNECT, "CONNECT"),
            (Self::DISCONNECT, "DISCONNECT"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        if names.is_empty() {
            write!(f, "ConnectionType(NONE)")
        } else {
            write!(f, "ConnectionType({})", names.join("|"))
        }
    }
}

/// Which number range a connection id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionOrigin {
    /// Id reported on the router's call monitor port
    CallMonitor,
    /// Bearer id assigned by the call transport
    Transport,
}

#[derive(Debug, Default)]
struct DurationTimer {
    started: Option<Instant>,
    stopped: Option<Duration>,
}

/// One active call
pub struct Connection {
    id: u32,
    origin: ConnectionOrigin,
    device: Device,
    local_number: String,
    remote_number: String,
    kind: AtomicU8,
    created_at: DateTime<Utc>,
    timer: Mutex<DurationTimer>,
    bearer: Mutex<Option<Arc<BearerConnection>>>,
    fax_job: Mutex<Option<Arc<FaxJob>>>,
}

impl Connection {
    fn new(
        origin: ConnectionOrigin,
        device: Device,
        id: u32,
        kind: ConnectionType,
        local_number: &str,
        remote_number: &str,
    ) -> Self {
        Self {
            id,
            origin,
            device,
            local_number: local_number.to_string(),
            remote_number: remote_number.to_string(),
            kind: AtomicU8::new(kind.bits()),
            created_at: Utc::now(),
            timer: Mutex::new(DurationTimer::default()),
            bearer: Mutex::new(None),
            fax_job: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn local_number(&self) -> &str {
        &self.local_number
    }

    pub fn remote_number(&self) -> &str {
        &self.remote_number
    }

    pub fn kind(&self) -> ConnectionType {
        ConnectionType::from_bits(self.kind.load(Ordering::Acquire))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn add_kind(&self, kind: ConnectionType) -> ConnectionType {
        let previous = self.kind.fetch_or(kind.bits(), Ordering::AcqRel);
        ConnectionType::from_bits(previous | kind.bits())
    }

    /// Start the duration timer when the call is established
    pub fn start_duration_timer(&self) {
        let mut timer = self.timer.lock();
        if timer.started.is_some() {
            warn!("Connection {}: skip duration timer setup, already active", self.id);
            return;
        }
        timer.started = Some(Instant::now());
        timer.stopped = None;
    }

    /// Stop the duration timer, freezing the elapsed time
    pub fn stop_duration_timer(&self) {
        let mut timer = self.timer.lock();
        if let Some(started) = timer.started.take() {
            timer.stopped = Some(started.elapsed());
        }
    }

    /// Time the call has been connected, zero if the timer never ran
    pub fn duration(&self) -> Duration {
        let timer = self.timer.lock();
        match (timer.started, timer.stopped) {
            (Some(started), _) => started.elapsed(),
            (None, Some(stopped)) => stopped,
            (None, None) => Duration::ZERO,
        }
    }

    /// Duration formatted as `HH:MM:SS`
    pub fn duration_string(&self) -> String {
        format_duration(self.duration())
    }

    /// Transport private bearer handle, if one is attached
    pub fn bearer(&self) -> Option<Arc<BearerConnection>> {
        self.bearer.lock().clone()
    }

    pub fn attach_bearer(&self, bearer: Arc<BearerConnection>) {
        *self.bearer.lock() = Some(bearer);
    }

    pub fn fax_job(&self) -> Option<Arc<FaxJob>> {
        self.fax_job.lock().clone()
    }

    pub fn attach_fax_job(&self, job: Arc<FaxJob>) {
        *self.fax_job.lock() = Some(job);
    }

    fn release(&self) {
        self.bearer.lock().take();
        self.fax_job.lock().take();
        self.stop_duration_timer();
    }

    /// Read-only copy handed to event consumers
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            origin: self.origin,
            kind: self.kind(),
            device: self.device,
            local_number: self.local_number.clone(),
            remote_number: self.remote_number.clone(),
            duration: self.duration(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("kind", &self.kind())
            .field("device", &self.device)
            .field("local_number", &scramble_number(&self.local_number))
            .field("remote_number", &scramble_number(&self.remote_number))
            .finish()
    }
}

/// Immutable view of a connection at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub id: u32,
    pub origin: ConnectionOrigin,
    pub kind: ConnectionType,
    pub device: Device,
    pub local_number: String,
    pub remote_number: String,
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
}

fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

/// Registry of all active connections, in insertion order
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<Vec<Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection reported by the call monitor.
    ///
    /// Fails if a call monitor connection with the same id is already
    /// registered.
    pub fn add(
        &self,
        device: Device,
        id: u32,
        kind: ConnectionType,
        local_number: &str,
        remote_number: &str,
    ) -> TelephonyResult<Arc<Connection>> {
        self.insert(ConnectionOrigin::CallMonitor, device, id, kind, local_number, remote_number)
    }

    /// Register a connection placed on the transport bearer `bearer_id`
    pub fn add_bearer(
        &self,
        device: Device,
        bearer_id: u32,
        kind: ConnectionType,
        local_number: &str,
        remote_number: &str,
    ) -> TelephonyResult<Arc<Connection>> {
        self.insert(ConnectionOrigin::Transport, device, bearer_id, kind, local_number, remote_number)
    }

    fn insert(
        &self,
        origin: ConnectionOrigin,
        device: Device,
        id: u32,
        kind: ConnectionType,
        local_number: &str,
        remote_number: &str,
    ) -> TelephonyResult<Arc<Connection>> {
        let mut connections = self.connections.write();

        if connections.iter().any(|c| c.origin == origin && c.id == id) {
            return Err(TelephonyError::ConnectionAlreadyExists { id });
        }

        let connection = Arc::new(Connection::new(origin, device, id, kind, local_number, remote_number));
        connections.push(connection.clone());

        debug!(
            "Adding connection {} ({:?}): type {:?}, local {}, remote {}",
            id,
            origin,
            kind,
            scramble_number(local_number),
            scramble_number(remote_number)
        );

        Ok(connection)
    }

    /// Call monitor connection with router id `id`
    pub fn find_by_id(&self, id: u32) -> Option<Arc<Connection>> {
        self.find(ConnectionOrigin::CallMonitor, id)
    }

    /// Connection placed on the transport bearer `bearer_id`
    pub fn find_by_bearer_id(&self, bearer_id: u32) -> Option<Arc<Connection>> {
        self.find(ConnectionOrigin::Transport, bearer_id)
    }

    /// Connection carried by `bearer`: the one placed on it, otherwise the
    /// monitored call it was attached to on ring
    pub fn find_by_bearer(&self, bearer: &Arc<BearerConnection>) -> Option<Arc<Connection>> {
        self.find_by_bearer_id(bearer.id()).or_else(|| {
            self.connections
                .read()
                .iter()
                .find(|c| c.bearer().is_some_and(|attached| Arc::ptr_eq(&attached, bearer)))
                .cloned()
        })
    }

    fn find(&self, origin: ConnectionOrigin, id: u32) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.origin == origin && c.id == id)
            .cloned()
    }

    pub fn find_by_remote_number(&self, remote_number: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.remote_number == remote_number)
            .cloned()
    }

    /// OR `kind` into the connection's type mask, returning the new mask
    pub fn set_type(&self, connection: &Connection, kind: ConnectionType) -> ConnectionType {
        connection.add_kind(kind)
    }

    /// Remove a connection, releasing its bearer handle and fax job
    pub fn remove(&self, connection: &Arc<Connection>) -> TelephonyResult<()> {
        let mut connections = self.connections.write();

        if connections.is_empty() {
            return Err(TelephonyError::RegistryEmpty);
        }

        let index = connections
            .iter()
            .position(|c| Arc::ptr_eq(c, connection))
            .ok_or(TelephonyError::ConnectionNotFound { id: connection.id })?;

        let removed = connections.remove(index);
        removed.release();

        debug!("Removed connection {}", removed.id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// All connections in insertion order
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.connections.read().iter().map(|c| c.snapshot()).collect()
    }
}
