//! Router control boundary

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TelephonyResult;
use crate::profile::Profile;

/// Port the router places a control dial on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialPort {
    /// Whatever port the router picks
    Auto,
    /// First ISDN port
    Isdn1,
}

/// Operations performed through the router's own interface
#[async_trait]
pub trait RouterControl: Send + Sync {
    /// Have the router dial `number` itself. Used for service codes such
    /// as the ones enabling the call monitor or transport ports.
    async fn dial_number(&self, profile: &Profile, port: DialPort, number: &str) -> TelephonyResult<()>;
}
