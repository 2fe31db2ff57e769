//! Router telephony core: connection lifecycle and fax transfer
//!
//! This crate tracks the calls a home router reports, places voice and fax
//! calls through an external call-control transport and streams fax pages
//! over the resulting bearer connection.
//!
//! ## Data flow
//! ```text
//! NetworkEventBus (online) -> CallMonitorClient -> ConnectionRegistry -> TelephonyEvent
//! CallDialer -> SerializedTransport -> ConnectionRegistry
//!            -> FaxTransferEngine -> FaxProgress events
//! ```
//!
//! The vendor call-control stack stays behind the [`CallTransport`] trait and
//! router side actions behind [`RouterControl`]; everything else lives here:
//! - Connection registry with monotonic type masks
//! - Router call monitor client with one-shot port enable retry
//! - Fax transfer with a bounded in-flight window
//! - Online/offline dispatch to network dependent subsystems

pub mod config;
pub mod connection;
pub mod device;
pub mod dialer;
pub mod error;
pub mod events;
pub mod fax;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod net_monitor;
pub mod number;
pub mod profile;
pub mod recovery;
pub mod router;
pub mod transport;

pub use config::TelephonyConfig;
pub use connection::{Connection, ConnectionOrigin, ConnectionRegistry, ConnectionSnapshot, ConnectionType};
pub use device::Device;
pub use dialer::{CallDialer, DialKind};
pub use error::{TelephonyError, TelephonyResult};
pub use events::{EventEmitter, EventPriority, TelephonyEvent};
pub use fax::{FaxDocument, FaxJob, FaxPageHeader, FaxPhase, FaxStatus, FaxTransferConfig, FaxTransferEngine};
pub use manager::PhoneManager;
pub use monitor::{CallMonitorClient, CallMonitorConfig, MonitorEvent, MonitorState, MonitorStats};
pub use net_monitor::{NetEventHandler, NetEventId, NetworkEventBus};
pub use profile::{Profile, ProfileManager, ProfileSettings};
pub use router::{DialPort, RouterControl};
pub use transport::{
    BearerConnection, BearerState, CallRequest, CallService, CallTransport, SerializedTransport, TransportListener,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
