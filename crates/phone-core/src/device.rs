//! Devices owning connections
//!
//! A device is the capability that handles a call: the voice phone, the fax
//! sender/receiver, or the router's call monitor which only observes calls.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::profile::Profile;

/// The capabilities a connection can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Voice calls over the call-control transport
    Phone,
    /// Fax calls over the call-control transport
    Fax,
    /// Calls observed on the router's call monitor port
    CallMonitor,
}

impl Device {
    pub fn name(&self) -> &'static str {
        match self {
            Device::Phone => "Phone",
            Device::Fax => "Fax",
            Device::CallMonitor => "Call Monitor",
        }
    }

    /// Check whether this device answers calls for `number` in `profile`.
    ///
    /// The call monitor only observes and never handles a number.
    pub fn handles_number(&self, profile: &Profile, number: &str) -> bool {
        let numbers = match self {
            Device::Phone => &profile.settings.phone_numbers,
            Device::Fax => &profile.settings.fax_numbers,
            Device::CallMonitor => return false,
        };

        numbers.iter().any(|n| n == number)
    }

    /// First device of `devices` that handles `number`
    pub fn route<'a>(devices: &'a [Device], profile: &Profile, number: &str) -> Option<&'a Device> {
        devices.iter().find(|d| d.handles_number(profile, number))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
