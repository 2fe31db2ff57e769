//! Top level wiring
//!
//! [`PhoneManager`] owns the registry, the event bus and the components
//! built on them. It registers the transport session and the call monitor
//! as network events, so an online transition opens both.
//!
//! ```text
//! set_online(true)
//!     └─ NetworkEventBus ──┬─ TransportSession ── CallTransport::open
//!                          └─ CallMonitorClient ── TCP :1012 ── ConnectionRegistry
//!
//! dial(target) ── CallDialer ── SerializedTransport::call ── ConnectionRegistry
//!                        └───── FaxTransferEngine (fax only)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::TelephonyConfig;
use crate::connection::{Connection, ConnectionRegistry};
use crate::dialer::{CallDialer, DialKind};
use crate::error::{TelephonyError, TelephonyResult};
use crate::events::{EventEmitter, TelephonyEvent};
use crate::fax::FaxTransferEngine;
use crate::monitor::CallMonitorClient;
use crate::net_monitor::{NetEventId, NetworkEventBus};
use crate::profile::ProfileManager;
use crate::router::RouterControl;
use crate::transport::{CallTransport, SerializedTransport, TransportSession};

/// Name of the transport session network event
pub const TRANSPORT_EVENT_NAME: &str = "Transport";
/// Name of the call monitor network event
pub const MONITOR_EVENT_NAME: &str = "Call Monitor";

/// Owns and wires all telephony components
pub struct PhoneManager {
    config: TelephonyConfig,
    events: EventEmitter,
    profiles: Arc<ProfileManager>,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<NetworkEventBus>,
    monitor: Arc<CallMonitorClient>,
    dialer: Arc<CallDialer>,
    session: Arc<TransportSession>,
    registrations: Mutex<Vec<NetEventId>>,
}

impl PhoneManager {
    pub fn new(
        config: TelephonyConfig,
        transport: Arc<dyn CallTransport>,
        router: Arc<dyn RouterControl>,
    ) -> TelephonyResult<Self> {
        config.validate()?;

        let events = EventEmitter::new(config.event_channel_capacity);
        let profiles = Arc::new(ProfileManager::new(config.profiles.clone()));
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(NetworkEventBus::new(profiles.clone(), events.clone()));
        let transport = SerializedTransport::new(transport);

        let engine = FaxTransferEngine::new(transport.clone(), events.clone(), config.fax_config());
        let dialer = Arc::new(CallDialer::new(
            transport.clone(),
            registry.clone(),
            events.clone(),
            engine,
        ));

        let session = Arc::new(TransportSession::new(
            transport,
            profiles.clone(),
            router.clone(),
            dialer.clone(),
            config.transport_enable_code.clone(),
            config.reconnect_delay(),
        ));

        let monitor = Arc::new(CallMonitorClient::new(
            config.monitor_config(),
            profiles.clone(),
            registry.clone(),
            events.clone(),
            router,
        ));

        Ok(Self {
            config,
            events,
            profiles,
            registry,
            bus,
            monitor,
            dialer,
            session,
            registrations: Mutex::new(Vec::new()),
        })
    }

    /// Register the transport session and the call monitor with the bus
    pub async fn start(&self) {
        if !self.registrations.lock().is_empty() {
            debug!("Phone manager already started");
            return;
        }

        let transport = self.bus.add_event(TRANSPORT_EVENT_NAME, self.session.clone()).await;
        let monitor = self.bus.add_event(MONITOR_EVENT_NAME, self.monitor.clone()).await;
        self.registrations.lock().extend([transport, monitor]);

        info!("Phone manager started with {} profile(s)", self.profiles.profiles().len());
    }

    /// Unregister all network events, disconnecting them
    pub async fn shutdown(&self) {
        let registrations: Vec<NetEventId> = self.registrations.lock().drain(..).collect();
        for id in registrations {
            self.bus.remove_event(id).await;
        }
        info!("Phone manager stopped");
    }

    pub async fn set_online(&self, online: bool) {
        self.bus.set_online(online).await;
    }

    pub async fn reconnect(&self) {
        self.bus.reconnect().await;
    }

    pub fn is_online(&self) -> bool {
        self.bus.is_online()
    }

    /// Dial `target` with the active profile
    pub async fn dial(&self, target: &str, anonymous: bool, kind: DialKind) -> TelephonyResult<Arc<Connection>> {
        let profile = self.profiles.active().ok_or(TelephonyError::NoActiveProfile)?;
        self.dialer.dial(&profile, target, anonymous, &kind).await
    }

    pub async fn hangup(&self, connection: &Connection) -> TelephonyResult<()> {
        self.dialer.hangup(connection).await
    }

    /// Bus registrations made by `start`: transport session, then call monitor
    pub fn registrations(&self) -> Vec<NetEventId> {
        self.registrations.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelephonyEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &TelephonyConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn profiles(&self) -> &Arc<ProfileManager> {
        &self.profiles
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<NetworkEventBus> {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<CallMonitorClient> {
        &self.monitor
    }

    pub fn dialer(&self) -> &Arc<CallDialer> {
        &self.dialer
    }
}

impl std::fmt::Debug for PhoneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoneManager")
            .field("online", &self.is_online())
            .field("connections", &self.registry.len())
            .finish()
    }
}
