//! Error types for router telephony operations
//!
//! Errors are grouped so callers can pick a recovery strategy:
//!
//! - **Configuration Errors** - missing source number, no active profile.
//!   The operation is aborted and nothing is left half-created.
//! - **Network Errors** - name resolution, missing IPv4 address, connect
//!   failures. Retried on the next online transition of the
//!   [`NetworkEventBus`](crate::net_monitor::NetworkEventBus).
//! - **Transport Errors** - the bearer dropped or the call-control transport
//!   refused a request.
//! - **Protocol Errors** - malformed monitor lines or fax headers.
//! - **Registry Errors** - lookups and removals of unknown connections.
//!
//! # Handling pattern
//!
//! ```rust,no_run
//! # use routerphone_core::{PhoneManager, TelephonyError, DialKind};
//! # async fn example(manager: PhoneManager) {
//! match manager.dial("0301234567", false, DialKind::Phone).await {
//!     Ok(connection) => println!("dialing, connection {}", connection.id()),
//!     Err(TelephonyError::SourceNotConfigured { .. }) => {
//!         // already reported through the message channel
//!     }
//!     Err(e) if e.is_recoverable() => eprintln!("try again later: {}", e),
//!     Err(e) => eprintln!("dial failed: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for telephony operations
pub type TelephonyResult<T> = Result<T, TelephonyError>;

/// Error types for connection, monitor, dialer and fax operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelephonyError {
    /// Configuration errors
    #[error("Source number not configured for {service}")]
    SourceNotConfigured { service: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("No active profile")]
    NoActiveProfile,

    /// Network errors
    #[error("Cannot resolve host {host}: {reason}")]
    ResolutionFailed { host: String, reason: String },

    #[error("No IPv4 address available for {host}")]
    NoIpv4Address { host: String },

    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Network error: {reason}")]
    NetworkError { reason: String },

    /// Transport errors
    #[error("Transport failed: {reason}")]
    TransportFailed { reason: String },

    #[error("Transport not connected")]
    TransportNotConnected,

    #[error("Bearer {bearer_id} dropped after {bytes_sent} of {bytes_total} bytes")]
    BearerDropped {
        bearer_id: u32,
        bytes_sent: usize,
        bytes_total: usize,
    },

    /// Protocol errors
    #[error("Malformed call monitor line: {reason}")]
    MalformedLine { reason: String },

    #[error("Fax header field {field} is {length} bytes, limit is 255")]
    HeaderFieldTooLong { field: &'static str, length: usize },

    #[error("Invalid fax header: {reason}")]
    InvalidHeader { reason: String },

    /// Registry errors
    #[error("Connection not found: {id}")]
    ConnectionNotFound { id: u32 },

    #[error("Connection already exists: {id}")]
    ConnectionAlreadyExists { id: u32 },

    #[error("Connection registry is empty")]
    RegistryEmpty,

    /// Generic errors
    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl TelephonyError {
    /// Create a source-not-configured error
    pub fn source_not_configured(service: impl Into<String>) -> Self {
        Self::SourceNotConfigured { service: service.into() }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a network error
    pub fn network_error(reason: impl Into<String>) -> Self {
        Self::NetworkError { reason: reason.into() }
    }

    /// Create a transport error
    pub fn transport_failed(reason: impl Into<String>) -> Self {
        Self::TransportFailed { reason: reason.into() }
    }

    /// Create a malformed line error
    pub fn malformed_line(reason: impl Into<String>) -> Self {
        Self::MalformedLine { reason: reason.into() }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Check if retrying later (e.g. on the next online transition) can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            TelephonyError::ResolutionFailed { .. }
            | TelephonyError::NoIpv4Address { .. }
            | TelephonyError::ConnectFailed { .. }
            | TelephonyError::NetworkError { .. }
            | TelephonyError::TransportFailed { .. }
            | TelephonyError::TransportNotConnected
            | TelephonyError::BearerDropped { .. }
            | TelephonyError::SourceNotConfigured { .. }
            | TelephonyError::NoActiveProfile => true,

            TelephonyError::InvalidConfiguration { .. }
            | TelephonyError::HeaderFieldTooLong { .. }
            | TelephonyError::InvalidHeader { .. }
            | TelephonyError::InternalError { .. } => false,

            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TelephonyError::SourceNotConfigured { .. }
            | TelephonyError::InvalidConfiguration { .. }
            | TelephonyError::NoActiveProfile => "configuration",

            TelephonyError::ResolutionFailed { .. }
            | TelephonyError::NoIpv4Address { .. }
            | TelephonyError::ConnectFailed { .. }
            | TelephonyError::NetworkError { .. } => "network",

            TelephonyError::TransportFailed { .. }
            | TelephonyError::TransportNotConnected
            | TelephonyError::BearerDropped { .. } => "transport",

            TelephonyError::MalformedLine { .. }
            | TelephonyError::HeaderFieldTooLong { .. }
            | TelephonyError::InvalidHeader { .. } => "protocol",

            TelephonyError::ConnectionNotFound { .. }
            | TelephonyError::ConnectionAlreadyExists { .. }
            | TelephonyError::RegistryEmpty => "registry",

            TelephonyError::Io { .. } | TelephonyError::InternalError { .. } => "system",
        }
    }
}

impl From<std::io::Error> for TelephonyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io { reason: err.to_string() }
    }
}

impl From<serde_json::Error> for TelephonyError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfiguration {
            field: "json".to_string(),
            reason: err.to_string(),
        }
    }
}
