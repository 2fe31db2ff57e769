//! Call-control transport boundary
//!
//! The vendor call-control stack is external. This module defines what the
//! rest of the crate needs from it:
//!
//! - [`CallTransport`] - open/close the stack, place calls, send bearer data, hang up
//! - [`TransportListener`] - callbacks the stack delivers back (established,
//!   terminated, ring, status, fax phase)
//! - [`BearerConnection`] - one data carrying call leg, with its state and
//!   the [`InFlightWindow`] bounding unacknowledged chunks
//! - [`SerializedTransport`] - the single process-wide lock every transport
//!   call goes through, since the stack is not reentrant
//! - [`TransportSession`] - opens the stack on online transitions

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{TelephonyError, TelephonyResult};
use crate::fax::{FaxPageHeader, FaxPhase};
use crate::net_monitor::NetEventHandler;
use crate::number::scramble_number;
use crate::profile::ProfileManager;
use crate::recovery::retry_once_after;
use crate::router::{DialPort, RouterControl};

/// Service indicator negotiated at call setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceIndicator {
    /// Speech, used for voice and analog fax paths
    Speech,
    /// ISDN fax group 3
    FaxGroup3,
}

impl ServiceIndicator {
    pub fn cip(self) -> u16 {
        match self {
            ServiceIndicator::Speech => 0x04,
            ServiceIndicator::FaxGroup3 => 0x11,
        }
    }
}

/// How the fax payload is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaxMode {
    /// Structured fax file streamed as is
    Structured,
    /// Page data modulated by the transport's modem
    Modem,
}

/// What the call carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallService {
    Voice,
    Fax {
        mode: FaxMode,
        modem: u8,
        ecm: bool,
        header: FaxPageHeader,
    },
}

/// Outbound call request handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    /// One based controller number
    pub controller: u8,
    pub source: String,
    pub target: String,
    pub anonymous: bool,
    pub indicator: ServiceIndicator,
    pub service: CallService,
}

/// Bearer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BearerState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Bounded count of sent but unacknowledged chunks
pub struct InFlightWindow {
    capacity: usize,
    slots: Semaphore,
    in_flight: watch::Sender<usize>,
}

impl InFlightWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (in_flight, _) = watch::channel(0);
        Self {
            capacity,
            slots: Semaphore::new(capacity),
            in_flight,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait for a free slot and count one more chunk in flight
    pub async fn acquire(&self) -> TelephonyResult<()> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| TelephonyError::internal_error("in-flight window closed"))?;
        permit.forget();
        self.in_flight.send_modify(|n| *n += 1);
        Ok(())
    }

    /// Release one slot. Returns false for a spurious acknowledgment.
    pub fn acknowledge(&self) -> bool {
        let released = self.in_flight.send_if_modified(|n| {
            if *n == 0 {
                return false;
            }
            *n -= 1;
            true
        });
        if released {
            self.slots.add_permits(1);
        }
        released
    }

    /// Resolves once nothing is in flight
    pub async fn drained(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl fmt::Debug for InFlightWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightWindow")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// One data carrying call leg owned by the transport
pub struct BearerConnection {
    id: u32,
    source: String,
    target: String,
    state: watch::Sender<BearerState>,
    window: InFlightWindow,
}

impl BearerConnection {
    pub fn new(id: u32, source: impl Into<String>, target: impl Into<String>, max_in_flight: usize) -> Self {
        let (state, _) = watch::channel(BearerState::Idle);
        Self {
            id,
            source: source.into(),
            target: target.into(),
            state,
            window: InFlightWindow::new(max_in_flight),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> BearerState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BearerState::Connected
    }

    /// Called by the transport on every state change
    pub fn set_state(&self, state: BearerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Bearer {}: {:?} -> {:?}", self.id, previous, state);
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BearerState> {
        self.state.subscribe()
    }

    pub fn window(&self) -> &InFlightWindow {
        &self.window
    }

    /// Called by the transport when the far end confirmed one data chunk
    pub fn acknowledge_data(&self) {
        if !self.window.acknowledge() {
            warn!("Bearer {}: acknowledgment without data in flight", self.id);
        }
    }

    /// Wait until the bearer left the setup states, returning where it landed
    pub async fn wait_settled(&self) -> BearerState {
        let mut rx = self.state.subscribe();
        let result = rx
            .wait_for(|s| !matches!(s, BearerState::Idle | BearerState::Connecting))
            .await
            .map(|s| *s);
        result.unwrap_or(BearerState::Disconnected)
    }

    pub async fn wait_disconnected(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == BearerState::Disconnected).await;
    }
}

impl fmt::Debug for BearerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerConnection")
            .field("id", &self.id)
            .field("source", &scramble_number(&self.source))
            .field("target", &scramble_number(&self.target))
            .field("state", &self.state())
            .field("window", &self.window)
            .finish()
    }
}

/// Callbacks delivered by the transport
pub trait TransportListener: Send + Sync {
    fn established(&self, bearer: &Arc<BearerConnection>);
    fn terminated(&self, bearer: &Arc<BearerConnection>);
    fn ring(&self, bearer: &Arc<BearerConnection>);
    fn status(&self, bearer: &Arc<BearerConnection>, code: i32);
    fn fax_phase(&self, bearer: &Arc<BearerConnection>, phase: FaxPhase);
}

/// The external call-control stack
#[async_trait]
pub trait CallTransport: Send + Sync {
    /// Open the stack against `host` on the one based `controller`
    async fn open(&self, host: &str, controller: u8, listener: Arc<dyn TransportListener>) -> TelephonyResult<()>;

    async fn close(&self) -> TelephonyResult<()>;

    /// Place a call. The returned bearer starts in `Connecting`.
    async fn call(&self, request: &CallRequest) -> TelephonyResult<Arc<BearerConnection>>;

    /// Hand one chunk to the bearer; acknowledged later via
    /// [`BearerConnection::acknowledge_data`]
    async fn send_data(&self, bearer: &BearerConnection, data: Bytes) -> TelephonyResult<()>;

    async fn hangup(&self, bearer: &BearerConnection) -> TelephonyResult<()>;
}

/// Transport wrapper serializing every call through one lock
#[derive(Clone)]
pub struct SerializedTransport {
    inner: Arc<dyn CallTransport>,
    lock: Arc<Mutex<()>>,
}

impl SerializedTransport {
    pub fn new(inner: Arc<dyn CallTransport>) -> Self {
        Self {
            inner,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn open(&self, host: &str, controller: u8, listener: Arc<dyn TransportListener>) -> TelephonyResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.open(host, controller, listener).await
    }

    pub async fn close(&self) -> TelephonyResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.close().await
    }

    pub async fn call(&self, request: &CallRequest) -> TelephonyResult<Arc<BearerConnection>> {
        let _guard = self.lock.lock().await;
        self.inner.call(request).await
    }

    pub async fn send_data(&self, bearer: &BearerConnection, data: Bytes) -> TelephonyResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.send_data(bearer, data).await
    }

    pub async fn hangup(&self, bearer: &BearerConnection) -> TelephonyResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.hangup(bearer).await
    }
}

impl fmt::Debug for SerializedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerializedTransport")
    }
}

/// Keeps the call-control transport open while the network is online
pub struct TransportSession {
    transport: SerializedTransport,
    profiles: Arc<ProfileManager>,
    router: Arc<dyn RouterControl>,
    listener: Arc<dyn TransportListener>,
    enable_code: String,
    retry_delay: Duration,
}

impl TransportSession {
    pub fn new(
        transport: SerializedTransport,
        profiles: Arc<ProfileManager>,
        router: Arc<dyn RouterControl>,
        listener: Arc<dyn TransportListener>,
        enable_code: impl Into<String>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            profiles,
            router,
            listener,
            enable_code: enable_code.into(),
            retry_delay,
        }
    }

    pub async fn open(&self) -> TelephonyResult<()> {
        let profile = self.profiles.active().ok_or(TelephonyError::NoActiveProfile)?;
        let host = profile.router_host().to_string();
        let controller = profile.settings.phone_controller + 1;

        retry_once_after(
            "open transport",
            || self.transport.open(&host, controller, self.listener.clone()),
            || async {
                // The transport port may be closed; ask the router to enable it
                if let Err(e) = self.router.dial_number(&profile, DialPort::Isdn1, &self.enable_code).await {
                    warn!("Could not request transport port activation: {}", e);
                }
            },
            self.retry_delay,
        )
        .await?;

        info!("Transport open on {} (controller {})", host, controller);
        Ok(())
    }
}

#[async_trait]
impl NetEventHandler for TransportSession {
    async fn connect(&self) -> bool {
        match self.open().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Transport not connected: {}", e);
                false
            }
        }
    }

    async fn disconnect(&self) -> bool {
        match self.transport.close().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not close transport: {}", e);
                false
            }
        }
    }
}
