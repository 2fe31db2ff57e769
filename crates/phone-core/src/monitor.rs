//! Router call monitor client
//!
//! The router publishes its line activity as plain text on a TCP port,
//! one event per line with `;` separated fields:
//!
//! ```text
//! 20:01:02;CALL;3;10;030123;0176555;SIP0;
//! 20:01:03;RING;7;0176555;030123;SIP0;
//! 20:01:09;CONNECT;7;10;0176555;
//! 20:01:42;DISCONNECT;7;33;
//! ```
//!
//! Each event becomes a [`ConnectionRegistry`] operation plus a
//! [`TelephonyEvent`]. Lines that do not parse are dropped; CONNECT and
//! DISCONNECT for an unknown id are ignored and counted.
//!
//! A single spawned reader task owns the socket. Connection failures are
//! retried once after asking the router to enable its call monitor port.
//! A connection that breaks later is only re-established by the next online
//! transition of the [`NetworkEventBus`](crate::net_monitor::NetworkEventBus).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ConnectionRegistry, ConnectionType};
use crate::device::Device;
use crate::error::{TelephonyError, TelephonyResult};
use crate::events::{EventEmitter, TelephonyEvent};
use crate::net_monitor::NetEventHandler;
use crate::number::scramble_number;
use crate::profile::ProfileManager;
use crate::recovery::retry_once_after;
use crate::router::{DialPort, RouterControl};

/// Router call monitor port
pub const DEFAULT_MONITOR_PORT: u16 = 1012;
/// Keepalive idle time before the first probe
pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(600);
/// Wait between enabling the port and the second connect attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Router service code enabling the call monitor port
pub const DEFAULT_MONITOR_ENABLE_CODE: &str = "#96*5*";

const READ_BUFFER_SIZE: usize = 1024;
/// Longest line buffered while waiting for its terminator
pub const MAX_LINE_LENGTH: usize = 4096;

/// Devices a RING may be routed to, in priority order
const RING_DEVICES: [Device; 2] = [Device::Phone, Device::Fax];

/// Call monitor socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Disconnected,
    Connecting,
    Connected,
}

/// One parsed call monitor line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Outbound call started
    Call { id: u32, local: String, remote: String },
    /// Inbound call started
    Ring { id: u32, remote: String, local: String },
    /// Call answered
    Connect { id: u32 },
    /// Call ended
    Disconnect { id: u32 },
}

impl MonitorEvent {
    /// Parse a single line, without its terminator
    pub fn parse(line: &str) -> TelephonyResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split(';').collect();

        if fields.len() < 3 {
            return Err(TelephonyError::malformed_line(format!("{} fields", fields.len())));
        }

        let keyword = fields[1];
        let required = match keyword {
            "CALL" => 6,
            "RING" => 5,
            "CONNECT" | "DISCONNECT" => 3,
            other => return Err(TelephonyError::malformed_line(format!("unknown keyword '{}'", other))),
        };

        if fields.len() < required {
            return Err(TelephonyError::malformed_line(format!(
                "{} needs {} fields, got {}",
                keyword,
                required,
                fields.len()
            )));
        }

        let id = fields[2]
            .trim()
            .parse::<u32>()
            .map_err(|_| TelephonyError::malformed_line(format!("invalid connection id '{}'", fields[2])))?;

        let event = match keyword {
            "CALL" => MonitorEvent::Call {
                id,
                local: fields[4].to_string(),
                remote: fields[5].to_string(),
            },
            "RING" => MonitorEvent::Ring {
                id,
                remote: fields[3].to_string(),
                local: fields[4].to_string(),
            },
            "CONNECT" => MonitorEvent::Connect { id },
            _ => MonitorEvent::Disconnect { id },
        };

        Ok(event)
    }

    pub fn id(&self) -> u32 {
        match self {
            MonitorEvent::Call { id, .. }
            | MonitorEvent::Ring { id, .. }
            | MonitorEvent::Connect { id }
            | MonitorEvent::Disconnect { id } => *id,
        }
    }
}

/// Splits a byte stream into lines
///
/// A line longer than the limit is dropped as a whole, including the part
/// that arrives after the limit was hit.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: BytesMut,
    max_line: usize,
    skipping: bool,
    oversized: u64,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_LENGTH)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_line,
            skipping: false,
            oversized: 0,
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete, non-empty line. Partial lines stay buffered.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(end) = self.buffer.iter().position(|b| *b == b'\n') else {
                if self.skipping || self.buffer.len() > self.max_line {
                    if !self.skipping {
                        debug!("Discarding call monitor line longer than {} bytes", self.max_line);
                        self.oversized += 1;
                        self.skipping = true;
                    }
                    self.buffer.clear();
                }
                return None;
            };

            let raw = self.buffer.split_to(end);
            self.buffer.advance(1);

            if std::mem::take(&mut self.skipping) {
                continue;
            }
            if raw.len() > self.max_line {
                debug!("Discarding call monitor line of {} bytes", raw.len());
                self.oversized += 1;
                continue;
            }

            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }

    /// Oversized lines discarded since the last call
    pub fn take_oversized(&mut self) -> u64 {
        std::mem::take(&mut self.oversized)
    }
}

/// Line counters
#[derive(Debug, Default)]
pub struct MonitorStats {
    lines: AtomicU64,
    dropped: AtomicU64,
    unknown_id: AtomicU64,
}

impl MonitorStats {
    /// Lines applied to the registry
    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    /// Malformed lines dropped
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// CONNECT/DISCONNECT lines referencing an id not in the registry
    pub fn unknown_id(&self) -> u64 {
        self.unknown_id.load(Ordering::Relaxed)
    }
}

/// Call monitor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMonitorConfig {
    pub port: u16,
    pub keepalive_idle: Duration,
    pub reconnect_delay: Duration,
    pub enable_code: String,
}

impl Default for CallMonitorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_MONITOR_PORT,
            keepalive_idle: DEFAULT_KEEPALIVE_IDLE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            enable_code: DEFAULT_MONITOR_ENABLE_CODE.to_string(),
        }
    }
}

struct Reader {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct MonitorInner {
    config: CallMonitorConfig,
    profiles: Arc<ProfileManager>,
    registry: Arc<ConnectionRegistry>,
    events: EventEmitter,
    router: Arc<dyn RouterControl>,
    state: RwLock<MonitorState>,
    stats: MonitorStats,
}

/// Client for the router's call monitor port
pub struct CallMonitorClient {
    inner: Arc<MonitorInner>,
    reader: Mutex<Option<Reader>>,
}

impl CallMonitorClient {
    pub fn new(
        config: CallMonitorConfig,
        profiles: Arc<ProfileManager>,
        registry: Arc<ConnectionRegistry>,
        events: EventEmitter,
        router: Arc<dyn RouterControl>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                profiles,
                registry,
                events,
                router,
                state: RwLock::new(MonitorState::Disconnected),
                stats: MonitorStats::default(),
            }),
            reader: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.inner.state.read()
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.inner.stats
    }

    /// Connect to the active profile's router and start reading events
    pub async fn connect(&self) -> TelephonyResult<()> {
        if self.state() == MonitorState::Connected {
            debug!("Call monitor already connected");
            return Ok(());
        }

        let profile = self.inner.profiles.active().ok_or(TelephonyError::NoActiveProfile)?;
        let host = profile.router_host().to_string();
        let port = self.inner.config.port;

        self.inner.set_state(MonitorState::Connecting, None);

        let result = retry_once_after(
            "call monitor connect",
            || open_stream(&host, port),
            || async {
                info!("Call monitor not reachable, enabling it on the router");
                if let Err(e) = self
                    .inner
                    .router
                    .dial_number(&profile, DialPort::Auto, &self.inner.config.enable_code)
                    .await
                {
                    warn!("Could not request call monitor activation: {}", e);
                }
            },
            self.inner.config.reconnect_delay,
        )
        .await;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                error!("Call monitor not connected: {}", e);
                self.inner.set_state(MonitorState::Disconnected, Some(e.to_string()));
                return Err(e);
            }
        };

        let keepalive = TcpKeepalive::new().with_time(self.inner.config.keepalive_idle);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("Could not enable keepalive on call monitor socket: {}", e);
        }

        info!("Call monitor connected to {}:{}", host, port);
        self.inner.set_state(MonitorState::Connected, None);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(read_loop(self.inner.clone(), stream, shutdown_rx));

        if let Some(previous) = self.reader.lock().replace(Reader {
            shutdown: shutdown_tx,
            task,
        }) {
            let _ = previous.shutdown.send(());
        }

        Ok(())
    }

    /// Stop reading and close the socket
    pub async fn disconnect(&self) {
        let reader = self.reader.lock().take();

        if let Some(reader) = reader {
            let _ = reader.shutdown.send(());
            if let Err(e) = reader.task.await {
                warn!("Call monitor reader ended abnormally: {}", e);
            }
        }

        if self.state() != MonitorState::Disconnected {
            self.inner.set_state(MonitorState::Disconnected, None);
        }
    }

    /// Apply one call monitor line
    pub fn handle_line(&self, line: &str) {
        self.inner.handle_line(line);
    }
}

impl fmt::Debug for CallMonitorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallMonitorClient")
            .field("port", &self.inner.config.port)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl NetEventHandler for CallMonitorClient {
    async fn connect(&self) -> bool {
        CallMonitorClient::connect(self).await.is_ok()
    }

    async fn disconnect(&self) -> bool {
        CallMonitorClient::disconnect(self).await;
        true
    }

    fn is_connected(&self) -> Option<bool> {
        Some(self.state() == MonitorState::Connected)
    }
}

impl MonitorInner {
    fn set_state(&self, state: MonitorState, reason: Option<String>) {
        *self.state.write() = state;
        self.events.emit(TelephonyEvent::MonitorStateChanged { state, reason });
    }

    fn handle_line(&self, line: &str) {
        trace!("Call monitor line: {}", line);

        let event = match MonitorEvent::parse(line) {
            Ok(event) => event,
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping call monitor line: {}", e);
                return;
            }
        };

        self.stats.lines.fetch_add(1, Ordering::Relaxed);
        self.apply(event);
    }

    fn apply(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Call { id, local, remote } => {
                debug!(
                    "Outgoing call {}: {} -> {}",
                    id,
                    scramble_number(&local),
                    scramble_number(&remote)
                );
                match self
                    .registry
                    .add(Device::CallMonitor, id, ConnectionType::OUTGOING, &local, &remote)
                {
                    Ok(connection) => {
                        let snapshot = connection.snapshot();
                        self.events.emit(TelephonyEvent::ConnectionOutgoing {
                            connection: snapshot.clone(),
                        });
                        self.events.emit(TelephonyEvent::ConnectionNotify { connection: snapshot });
                    }
                    Err(e) => warn!("Ignoring CALL: {}", e),
                }
            }
            MonitorEvent::Ring { id, remote, local } => {
                debug!(
                    "Incoming call {}: {} -> {}",
                    id,
                    scramble_number(&remote),
                    scramble_number(&local)
                );
                let device = self
                    .profiles
                    .active()
                    .and_then(|profile| Device::route(&RING_DEVICES, &profile, &local).copied())
                    .unwrap_or(Device::CallMonitor);

                match self
                    .registry
                    .add(device, id, ConnectionType::INCOMING, &local, &remote)
                {
                    Ok(connection) => {
                        let snapshot = connection.snapshot();
                        self.events.emit(TelephonyEvent::ConnectionIncoming {
                            connection: snapshot.clone(),
                        });
                        self.events.emit(TelephonyEvent::ConnectionNotify { connection: snapshot });
                    }
                    Err(e) => warn!("Ignoring RING: {}", e),
                }
            }
            MonitorEvent::Connect { id } => {
                let Some(connection) = self.registry.find_by_id(id) else {
                    self.unknown_id("CONNECT", id);
                    return;
                };

                self.registry.set_type(&connection, ConnectionType::CONNECT);
                connection.start_duration_timer();

                let snapshot = connection.snapshot();
                self.events.emit(TelephonyEvent::ConnectionConnect {
                    connection: snapshot.clone(),
                });
                self.events.emit(TelephonyEvent::ConnectionNotify { connection: snapshot });
            }
            MonitorEvent::Disconnect { id } => {
                let Some(connection) = self.registry.find_by_id(id) else {
                    self.unknown_id("DISCONNECT", id);
                    return;
                };

                self.registry.set_type(&connection, ConnectionType::DISCONNECT);
                connection.stop_duration_timer();

                let snapshot = connection.snapshot();
                self.events.emit(TelephonyEvent::ConnectionDisconnect {
                    connection: snapshot.clone(),
                });
                self.events.emit(TelephonyEvent::ConnectionNotify { connection: snapshot });

                if let Err(e) = self.registry.remove(&connection) {
                    warn!("Could not remove connection {}: {}", id, e);
                }
            }
        }
    }

    fn unknown_id(&self, keyword: &str, id: u32) {
        self.stats.unknown_id.fetch_add(1, Ordering::Relaxed);
        debug!("{} for unknown connection {}, ignoring", keyword, id);
    }
}

/// Resolve `host` to its first IPv4 address and connect
async fn open_stream(host: &str, port: u16) -> TelephonyResult<TcpStream> {
    let addresses: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| TelephonyError::ResolutionFailed {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let address = addresses
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TelephonyError::NoIpv4Address { host: host.to_string() })?;

    debug!("Connecting call monitor to {}", address);

    TcpStream::connect(address)
        .await
        .map_err(|e| TelephonyError::ConnectFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

async fn read_loop(inner: Arc<MonitorInner>, mut stream: TcpStream, mut shutdown: oneshot::Receiver<()>) {
    let mut decoder = LineDecoder::new();
    decoder.buffer_mut().reserve(READ_BUFFER_SIZE);

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Call monitor reader shutting down");
                return;
            }
            read = stream.read_buf(decoder.buffer_mut()) => match read {
                Ok(0) => break "closed by router".to_string(),
                Ok(n) => {
                    trace!("Call monitor read {} bytes", n);
                    while let Some(line) = decoder.next_line() {
                        inner.handle_line(&line);
                    }
                    let oversized = decoder.take_oversized();
                    if oversized > 0 {
                        inner.stats.dropped.fetch_add(oversized, Ordering::Relaxed);
                    }
                    decoder.buffer_mut().reserve(READ_BUFFER_SIZE);
                }
                Err(e) => break e.to_string(),
            },
        }
    };

    warn!("Call monitor disconnected: {}", reason);
    inner.set_state(MonitorState::Disconnected, Some(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Profile, ProfileSettings};

    struct NoRouter;

    #[async_trait]
    impl RouterControl for NoRouter {
        async fn dial_number(&self, _: &crate::profile::Profile, _: DialPort, _: &str) -> TelephonyResult<()> {
            Ok(())
        }
    }

    fn client() -> (CallMonitorClient, Arc<ConnectionRegistry>, EventEmitter) {
        let settings = ProfileSettings {
            phone_numbers: vec!["030123".to_string()],
            ..Default::default()
        };
        let profiles = Arc::new(ProfileManager::new(vec![Profile::new("home", settings)]));
        profiles.set_active(profiles.detect());

        let registry = Arc::new(ConnectionRegistry::new());
        let events = EventEmitter::new(64);
        let client = CallMonitorClient::new(
            CallMonitorConfig::default(),
            profiles,
            registry.clone(),
            events.clone(),
            Arc::new(NoRouter),
        );
        (client, registry, events)
    }

    #[test]
    fn test_parse_ring() {
        let event = MonitorEvent::parse("20:01:02;RING;7;0176555;030123").unwrap();
        assert_eq!(
            event,
            MonitorEvent::Ring {
                id: 7,
                remote: "0176555".to_string(),
                local: "030123".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_call_uses_local_and_remote_fields() {
        let event = MonitorEvent::parse("20:01:02;CALL;3;10;030123;0176555;SIP0;").unwrap();
        assert_eq!(
            event,
            MonitorEvent::Call {
                id: 3,
                local: "030123".to_string(),
                remote: "0176555".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(MonitorEvent::parse("").is_err());
        assert!(MonitorEvent::parse("20:01:02;HOLD;7;").is_err());
        assert!(MonitorEvent::parse("20:01:02;RING;7;0176555").is_err());
        assert!(MonitorEvent::parse("20:01:02;CALL;3;10;030123").is_err());
        assert!(MonitorEvent::parse("20:01:02;CONNECT;x;").is_err());
        assert_eq!(
            MonitorEvent::parse("20:01:09;CONNECT;7;10;0176555;\r").unwrap(),
            MonitorEvent::Connect { id: 7 }
        );
    }

    #[test]
    fn test_decoder_splits_and_buffers() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"a;b\r\n\nc;d\ne;");
        assert_eq!(decoder.next_line().as_deref(), Some("a;b"));
        assert_eq!(decoder.next_line().as_deref(), Some("c;d"));
        assert_eq!(decoder.next_line(), None);

        decoder.extend(b"f\n");
        assert_eq!(decoder.next_line().as_deref(), Some("e;f"));
    }

    #[test]
    fn test_decoder_discards_oversized_lines() {
        let mut decoder = LineDecoder::with_max_line(8);

        decoder.extend(b"0123456789");
        assert_eq!(decoder.next_line(), None);
        assert!(decoder.buffer_mut().is_empty());

        decoder.extend(b"tail;x\nok\n");
        assert_eq!(decoder.next_line().as_deref(), Some("ok"));

        decoder.extend(b"0123456789abc\nnext\n");
        assert_eq!(decoder.next_line().as_deref(), Some("next"));
        assert_eq!(decoder.next_line(), None);
        assert_eq!(decoder.take_oversized(), 2);
        assert_eq!(decoder.take_oversized(), 0);
    }

    #[test]
    fn test_ring_creates_incoming_connection() {
        let (client, registry, _) = client();
        client.handle_line("20:01:02;RING;7;0176555;030123");

        let connection = registry.find_by_id(7).unwrap();
        assert_eq!(connection.kind(), ConnectionType::INCOMING);
        assert_eq!(connection.local_number(), "030123");
        assert_eq!(connection.remote_number(), "0176555");
        assert_eq!(connection.device(), Device::Phone);
    }

    #[test]
    fn test_full_call_lifecycle() {
        let (client, registry, events) = client();
        let mut rx = events.subscribe();

        client.handle_line("20:01:02;CALL;3;10;030123;0176555;SIP0;");
        client.handle_line("20:01:09;CONNECT;3;10;0176555;");
        assert_eq!(
            registry.find_by_id(3).unwrap().kind(),
            ConnectionType::OUTGOING | ConnectionType::CONNECT
        );

        client.handle_line("20:01:42;DISCONNECT;3;33;");
        assert!(registry.is_empty());

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TelephonyEvent::ConnectionDisconnect { connection } = &event {
                assert!(connection.kind.contains(ConnectionType::DISCONNECT));
            }
            kinds.push(event);
        }
        assert_eq!(kinds.len(), 6);
        assert_eq!(client.stats().lines(), 3);
    }

    #[test]
    fn test_unknown_and_duplicate_ids_are_ignored() {
        let (client, registry, _) = client();
        client.handle_line("20:01:02;RING;7;0176555;030123");
        client.handle_line("20:01:42;DISCONNECT;7;0;");
        client.handle_line("20:01:42;DISCONNECT;7;0;");
        client.handle_line("20:01:43;CONNECT;99;10;0176555;");
        client.handle_line("garbage");

        assert!(registry.is_empty());
        assert_eq!(client.stats().unknown_id(), 2);
        assert_eq!(client.stats().dropped(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_profile_fails() {
        let client = CallMonitorClient::new(
            CallMonitorConfig::default(),
            Arc::new(ProfileManager::new(Vec::new())),
            Arc::new(ConnectionRegistry::new()),
            EventEmitter::new(4),
            Arc::new(NoRouter),
        );
        assert_eq!(client.connect().await.unwrap_err(), TelephonyError::NoActiveProfile);
        assert_eq!(client.state(), MonitorState::Disconnected);
    }
}
