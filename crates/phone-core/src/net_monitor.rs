//! Online/offline dispatch to registered network events
//!
//! Subsystems that need the network (call monitor, transport session)
//! register a [`NetEventHandler`] here. The bus tracks the global online
//! state and calls `connect`/`disconnect` on transitions, in registration
//! order.
//!
//! Going online first selects an active profile; without one no handler is
//! connected. Going offline disconnects every connected handler and then
//! clears the active profile.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as TransitionLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventEmitter, TelephonyEvent};
use crate::profile::ProfileManager;

/// A subsystem driven by network transitions
#[async_trait]
pub trait NetEventHandler: Send + Sync {
    /// Bring the subsystem up. Returns whether it is now connected.
    async fn connect(&self) -> bool;

    /// Take the subsystem down. Returns whether it disconnected cleanly.
    async fn disconnect(&self) -> bool;

    /// Live connection state, for subsystems that can lose their link
    /// between transitions. `None` leaves the bus's own record in charge.
    fn is_connected(&self) -> Option<bool> {
        None
    }
}

/// Handle identifying a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetEventId(Uuid);

impl NetEventId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NetEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct NetEvent {
    id: NetEventId,
    name: String,
    handler: Arc<dyn NetEventHandler>,
    connected: bool,
}

#[derive(Default)]
struct BusState {
    online: bool,
    events: Vec<NetEvent>,
}

/// Global online state plus the registered network events
pub struct NetworkEventBus {
    state: Mutex<BusState>,
    // Held across handler calls so transitions and (un)registrations do
    // not interleave
    transition: TransitionLock<()>,
    profiles: Arc<ProfileManager>,
    events: EventEmitter,
}

impl NetworkEventBus {
    pub fn new(profiles: Arc<ProfileManager>, events: EventEmitter) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            transition: TransitionLock::new(()),
            profiles,
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    /// Names of the registered events, in registration order
    pub fn registered_names(&self) -> Vec<String> {
        self.state.lock().events.iter().map(|e| e.name.clone()).collect()
    }

    /// Whether the event `id` is currently connected
    pub fn is_connected(&self, id: NetEventId) -> Option<bool> {
        let (connected, handler) = {
            let state = self.state.lock();
            let event = state.events.iter().find(|e| e.id == id)?;
            (event.connected, event.handler.clone())
        };

        Some(connected && handler.is_connected().unwrap_or(true))
    }

    /// Register `handler`. When the bus is online it is connected right away.
    pub async fn add_event(&self, name: impl Into<String>, handler: Arc<dyn NetEventHandler>) -> NetEventId {
        let _transition = self.transition.lock().await;
        let name = name.into();
        let id = NetEventId::new();

        let online = {
            let mut state = self.state.lock();
            state.events.push(NetEvent {
                id,
                name: name.clone(),
                handler: handler.clone(),
                connected: false,
            });
            state.online
        };

        debug!("Registered network event '{}'", name);

        if online {
            let connected = handler.connect().await;
            self.mark(id, connected);
            debug!("Network event '{}' connected on registration: {}", name, connected);
        }

        id
    }

    /// Unregister the event `id`, disconnecting it first if connected.
    /// Returns false if no such event is registered.
    pub async fn remove_event(&self, id: NetEventId) -> bool {
        let _transition = self.transition.lock().await;

        let entry = {
            let state = self.state.lock();
            state
                .events
                .iter()
                .find(|e| e.id == id)
                .map(|e| (e.name.clone(), e.handler.clone(), e.connected))
        };

        let Some((name, handler, connected)) = entry else {
            return false;
        };

        if connected && !handler.disconnect().await {
            warn!("Network event '{}' did not disconnect cleanly", name);
        }

        self.state.lock().events.retain(|e| e.id != id);
        debug!("Removed network event '{}'", name);
        true
    }

    /// Apply a global online/offline transition. Repeating the current
    /// state does nothing.
    pub async fn set_online(&self, online: bool) {
        let _transition = self.transition.lock().await;

        if self.state.lock().online == online {
            debug!("Network already {}", if online { "online" } else { "offline" });
            return;
        }

        self.transition(online).await;
    }

    /// Go offline and back online so profile dependent events re-run
    pub async fn reconnect(&self) {
        let _transition = self.transition.lock().await;

        if self.state.lock().online {
            self.transition(false).await;
        }
        self.transition(true).await;
    }

    async fn transition(&self, online: bool) {
        info!("Network is {}", if online { "online" } else { "offline" });
        self.state.lock().online = online;
        self.events.emit(TelephonyEvent::NetworkStateChanged { online });

        if online {
            self.go_online().await;
        } else {
            self.go_offline().await;
        }
    }

    async fn go_online(&self) {
        let Some(profile) = self.profiles.detect() else {
            warn!("No usable profile, network events stay disconnected");
            return;
        };
        self.profiles.set_active(Some(profile));

        for (id, name, handler) in self.snapshot(false) {
            let connected = handler.connect().await;
            self.mark(id, connected);
            debug!("Network event '{}' connected: {}", name, connected);
        }
    }

    async fn go_offline(&self) {
        for (id, name, handler) in self.snapshot(true) {
            let disconnected = handler.disconnect().await;
            self.mark(id, !disconnected);
            debug!("Network event '{}' disconnected: {}", name, disconnected);
        }

        self.profiles.set_active(None);
    }

    /// Events whose connected flag equals `connected`, in registration order
    fn snapshot(&self, connected: bool) -> Vec<(NetEventId, String, Arc<dyn NetEventHandler>)> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.connected == connected)
            .map(|e| (e.id, e.name.clone(), e.handler.clone()))
            .collect()
    }

    fn mark(&self, id: NetEventId, connected: bool) {
        if let Some(event) = self.state.lock().events.iter_mut().find(|e| e.id == id) {
            event.connected = connected;
        }
    }
}

impl fmt::Debug for NetworkEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NetworkEventBus")
            .field("online", &state.online)
            .field("events", &state.events.iter().map(|e| e.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}
