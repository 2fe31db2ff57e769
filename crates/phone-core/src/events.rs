//! Events emitted toward UI, address book and journal consumers
//!
//! All status flows through one broadcast channel. Connection events carry a
//! [`ConnectionSnapshot`] so receivers never touch the live registry entry.
//!
//! # Event Types
//!
//! - **Connection Events** - incoming/outgoing/connect/disconnect from the
//!   call monitor, established/terminated/status from the transport
//! - **Fax Events** - transfer phase and byte progress
//! - **Message Events** - user visible conditions such as a missing source number
//! - **Network Events** - online/offline and call monitor state changes
//!
//! # Usage
//!
//! ```rust
//! use routerphone_core::events::{EventEmitter, TelephonyEvent};
//!
//! # async fn example() {
//! let emitter = EventEmitter::new(16);
//! let mut rx = emitter.subscribe();
//!
//! emitter.message(0, "Source MSN not set, cannot dial");
//!
//! if let Ok(TelephonyEvent::Message { text, .. }) = rx.recv().await {
//!     println!("{}", text);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::ConnectionSnapshot;
use crate::fax::FaxPhase;
use crate::monitor::MonitorState;

/// Event priority levels for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventPriority {
    /// Progress updates
    Low,
    /// Connection state changes
    Normal,
    /// Incoming calls and user visible messages
    High,
}

/// Telephony event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelephonyEvent {
    /// RING seen on the call monitor
    ConnectionIncoming { connection: ConnectionSnapshot },
    /// CALL seen on the call monitor
    ConnectionOutgoing { connection: ConnectionSnapshot },
    /// CONNECT seen on the call monitor
    ConnectionConnect { connection: ConnectionSnapshot },
    /// DISCONNECT seen on the call monitor, emitted before removal
    ConnectionDisconnect { connection: ConnectionSnapshot },
    /// Generic "connection changed" notification
    ConnectionNotify { connection: ConnectionSnapshot },

    /// Bearer connection established by the transport
    ConnectionEstablished {
        connection_id: u32,
        connection: Option<ConnectionSnapshot>,
    },
    /// Bearer connection terminated by the transport
    ConnectionTerminated {
        connection_id: u32,
        connection: Option<ConnectionSnapshot>,
    },
    /// Status code reported by the transport or the fax engine
    ConnectionStatus { code: i32, connection_id: u32 },

    /// Fax transfer progress
    FaxProgress {
        connection_id: u32,
        phase: FaxPhase,
        bytes_sent: usize,
        bytes_total: usize,
    },

    /// User visible message
    Message { code: i32, text: String },

    /// Global online/offline transition
    NetworkStateChanged { online: bool },
    /// Call monitor socket state change
    MonitorStateChanged {
        state: MonitorState,
        reason: Option<String>,
    },
}

impl TelephonyEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            TelephonyEvent::ConnectionIncoming { .. } | TelephonyEvent::Message { .. } => EventPriority::High,
            TelephonyEvent::FaxProgress { .. } => EventPriority::Low,
            _ => EventPriority::Normal,
        }
    }

    /// Connection id this event refers to, if any
    pub fn connection_id(&self) -> Option<u32> {
        match self {
            TelephonyEvent::ConnectionIncoming { connection }
            | TelephonyEvent::ConnectionOutgoing { connection }
            | TelephonyEvent::ConnectionConnect { connection }
            | TelephonyEvent::ConnectionDisconnect { connection }
            | TelephonyEvent::ConnectionNotify { connection } => Some(connection.id),
            TelephonyEvent::ConnectionEstablished { connection_id, .. }
            | TelephonyEvent::ConnectionTerminated { connection_id, .. }
            | TelephonyEvent::ConnectionStatus { connection_id, .. }
            | TelephonyEvent::FaxProgress { connection_id, .. } => Some(*connection_id),
            _ => None,
        }
    }
}

/// Broadcast publisher shared by all components
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<TelephonyEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: TelephonyEvent) {
        trace!("Emitting {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn message(&self, code: i32, text: impl Into<String>) {
        self.emit(TelephonyEvent::Message { code, text: text.into() });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelephonyEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
