//! Router profiles and the active-profile selection
//!
//! A profile bundles the router host and the per-service settings the
//! dialer and the network events read. Only one profile is active at a
//! time; the [`NetworkEventBus`](crate::net_monitor::NetworkEventBus)
//! selects it on an online transition and clears it when going offline.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Service indicator value selecting ISDN fax group 3 signalling
pub const FAX_CIP_PREFERENCE_ISDN: u8 = 1;

/// Settings consumed by the dialer and the network events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Host name or address of the router
    pub router_host: String,
    /// Prefix replacing a leading `+` when canonicalizing numbers
    pub international_prefix: String,

    /// Source number (MSN) for voice calls
    pub phone_number: String,
    /// Zero based controller index for voice calls
    pub phone_controller: u8,
    /// Numbers the phone device answers for
    pub phone_numbers: Vec<String>,

    /// Source number (MSN) for fax calls
    pub fax_number: String,
    /// Zero based controller index for fax calls
    pub fax_controller: u8,
    /// Modem rate selector, 0-3 (2400-14400 bit/s)
    pub fax_bitrate: u8,
    /// Error correction mode
    pub fax_ecm: bool,
    /// Signal indicator preference, 1 selects ISDN fax
    pub fax_cip: u8,
    /// Send pages in the structured fax format
    pub fax_sff: bool,
    /// Station identifier sent to the remote side
    pub fax_ident: String,
    /// Header line printed on each page
    pub fax_header: String,
    /// Numbers the fax device answers for
    pub fax_numbers: Vec<String>,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            router_host: "fritz.box".to_string(),
            international_prefix: "00".to_string(),
            phone_number: String::new(),
            phone_controller: 0,
            phone_numbers: Vec::new(),
            fax_number: String::new(),
            fax_controller: 0,
            fax_bitrate: 3,
            fax_ecm: true,
            fax_cip: FAX_CIP_PREFERENCE_ISDN,
            fax_sff: true,
            fax_ident: String::new(),
            fax_header: String::new(),
            fax_numbers: Vec::new(),
        }
    }
}

/// A named router profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub settings: ProfileSettings,
}

impl Profile {
    pub fn new(name: impl Into<String>, settings: ProfileSettings) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }

    pub fn router_host(&self) -> &str {
        &self.settings.router_host
    }
}

/// Holds the configured profiles and the active selection
#[derive(Debug, Default)]
pub struct ProfileManager {
    profiles: Vec<Arc<Profile>>,
    active: RwLock<Option<Arc<Profile>>>,
}

impl ProfileManager {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
            active: RwLock::new(None),
        }
    }

    pub fn profiles(&self) -> &[Arc<Profile>] {
        &self.profiles
    }

    pub fn active(&self) -> Option<Arc<Profile>> {
        self.active.read().clone()
    }

    /// Set or clear the active profile
    pub fn set_active(&self, profile: Option<Arc<Profile>>) {
        match &profile {
            Some(p) => info!("Active profile: '{}'", p.name),
            None => debug!("Active profile cleared"),
        }
        *self.active.write() = profile;
    }

    /// Detect the profile to activate.
    ///
    /// An already active profile is kept (online -> online). Otherwise the
    /// first configured profile with a router host is chosen.
    pub fn detect(&self) -> Option<Arc<Profile>> {
        if let Some(active) = self.active() {
            return Some(active);
        }

        self.profiles
            .iter()
            .find(|p| !p.router_host().is_empty())
            .cloned()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Profile>> {
        self.profiles.iter().find(|p| p.name == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, host: &str) -> Profile {
        Profile::new(
            name,
            ProfileSettings {
                router_host: host.to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_detect_prefers_active_profile() {
        let manager = ProfileManager::new(vec![profile("home", "fritz.box"), profile("office", "10.0.0.1")]);
        assert_eq!(manager.detect().map(|p| p.name.clone()), Some("home".to_string()));

        manager.set_active(manager.find("office"));
        assert_eq!(manager.detect().map(|p| p.name.clone()), Some("office".to_string()));
    }

    #[test]
    fn test_detect_skips_profiles_without_host() {
        let manager = ProfileManager::new(vec![profile("empty", ""), profile("office", "10.0.0.1")]);
        assert_eq!(manager.detect().map(|p| p.name.clone()), Some("office".to_string()));

        let none = ProfileManager::new(vec![profile("empty", "")]);
        assert!(none.detect().is_none());
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: ProfileSettings = serde_json::from_str(r#"{"fax_number": "030111"}"#).unwrap();
        assert_eq!(settings.fax_number, "030111");
        assert_eq!(settings.international_prefix, "00");
        assert_eq!(settings.fax_cip, FAX_CIP_PREFERENCE_ISDN);
    }
}
