//! Engine configuration and the debug verbosity mask.

use crate::bridge::SelectionStrategy;
use crate::error::ConfigError;

/// Diagnostic scopes, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugScope {
    Error = 1,
    Startup = 2,
    Connection = 4,
    Sync = 8,
    Communication = 16,
    General = 32,
    MsgTypes = 64,
    Remote = 128,
}

/// Bitfield over [`DebugScope`]. Emissions outside the mask are suppressed
/// before they reach the `log` facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugMask(pub u8);

impl DebugMask {
    pub const NONE: DebugMask = DebugMask(0);
    pub const ALL: DebugMask = DebugMask(0xff);

    pub fn allows(self, scope: DebugScope) -> bool {
        self.0 & scope as u8 != 0
    }

    pub fn with(self, scope: DebugScope) -> Self {
        DebugMask(self.0 | scope as u8)
    }
}

impl Default for DebugMask {
    fn default() -> Self {
        DebugMask(DebugScope::Error as u8 | DebugScope::Startup as u8)
    }
}

/// All tunables of the engine. Setters validate and are idempotent;
/// applying the same value twice has no effect.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshConfig {
    pub mesh_ssid: String,
    pub mesh_password: String,
    pub channel: u8,
    pub port: u16,

    pub enable_bridge_failover: bool,
    pub enable_multi_bridge: bool,
    pub enable_message_queue: bool,
    pub enable_rtc: bool,

    pub router_ssid: String,
    pub router_password: String,

    pub election_timeout_ms: u64,
    pub max_bridges: u8,
    pub selection_strategy: SelectionStrategy,

    pub queue_capacity: usize,
    pub queue_persistence: bool,
    pub queue_max_attempts: u32,

    pub status_interval_ms: u64,
    pub coordination_interval_ms: u64,
    pub ntp_broadcast_interval_ms: u64,
    pub time_sync_interval_ms: u64,
    pub node_sync_interval_ms: u64,
    pub connection_timeout_ms: u64,

    pub debug: DebugMask,
}

/// Largest accepted `max_bridges`.
pub const MAX_BRIDGES_CAP: u8 = 5;

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_ssid: String::new(),
            mesh_password: String::new(),
            channel: 0,
            port: 5555,
            enable_bridge_failover: false,
            enable_multi_bridge: false,
            enable_message_queue: false,
            enable_rtc: false,
            router_ssid: String::new(),
            router_password: String::new(),
            election_timeout_ms: 5_000,
            max_bridges: 2,
            selection_strategy: SelectionStrategy::PriorityBased,
            queue_capacity: 500,
            queue_persistence: false,
            queue_max_attempts: 3,
            status_interval_ms: 10_000,
            coordination_interval_ms: 30_000,
            ntp_broadcast_interval_ms: 300_000,
            time_sync_interval_ms: 10_000,
            node_sync_interval_ms: 10_000,
            connection_timeout_ms: 30_000,
            debug: DebugMask::default(),
        }
    }
}

impl MeshConfig {
    /// Mesh network identity. Channel 0 means the radio driver picks one.
    pub fn set_mesh_credentials(
        &mut self,
        ssid: &str,
        password: &str,
        channel: u8,
        port: u16,
    ) -> Result<(), ConfigError> {
        if ssid.is_empty() {
            return Err(ConfigError::InvalidValue("mesh_ssid"));
        }
        if channel > 14 {
            return Err(ConfigError::InvalidValue("channel"));
        }
        if port == 0 {
            return Err(ConfigError::InvalidValue("port"));
        }
        self.mesh_ssid = ssid.to_string();
        self.mesh_password = password.to_string();
        self.channel = channel;
        self.port = port;
        Ok(())
    }

    /// Uplink router credentials; required before bridge failover can run.
    pub fn set_router_credentials(&mut self, ssid: &str, password: &str) -> Result<(), ConfigError> {
        if ssid.is_empty() {
            return Err(ConfigError::InvalidValue("router_ssid"));
        }
        self.router_ssid = ssid.to_string();
        self.router_password = password.to_string();
        Ok(())
    }

    pub fn has_router_credentials(&self) -> bool {
        !self.router_ssid.is_empty()
    }

    pub fn set_election_timeout_ms(&mut self, timeout_ms: u64) -> Result<(), ConfigError> {
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("election_timeout_ms"));
        }
        self.election_timeout_ms = timeout_ms;
        Ok(())
    }

    pub fn set_max_bridges(&mut self, max: u8) -> Result<(), ConfigError> {
        if max == 0 || max > MAX_BRIDGES_CAP {
            return Err(ConfigError::InvalidValue("max_bridges"));
        }
        self.max_bridges = max;
        Ok(())
    }

    pub fn set_selection_strategy(&mut self, strategy: SelectionStrategy) {
        self.selection_strategy = strategy;
    }

    pub fn set_queue_capacity(&mut self, capacity: usize) -> Result<(), ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidValue("queue_capacity"));
        }
        self.queue_capacity = capacity;
        Ok(())
    }

    pub fn set_queue_max_attempts(&mut self, attempts: u32) -> Result<(), ConfigError> {
        if attempts == 0 {
            return Err(ConfigError::InvalidValue("queue_max_attempts"));
        }
        self.queue_max_attempts = attempts;
        Ok(())
    }

    pub fn set_connection_timeout_ms(&mut self, timeout_ms: u64) -> Result<(), ConfigError> {
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("connection_timeout_ms"));
        }
        self.connection_timeout_ms = timeout_ms;
        Ok(())
    }

    pub fn set_debug_mask(&mut self, mask: DebugMask) {
        self.debug = mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_are_idempotent() {
        let mut config = MeshConfig::default();
        config.set_mesh_credentials("mesh", "pw", 6, 5555).expect("set");
        let snapshot = config.clone();
        config.set_mesh_credentials("mesh", "pw", 6, 5555).expect("set again");
        assert_eq!(config, snapshot);
    }

    #[test]
    fn rejected_setter_leaves_state_unchanged() {
        let mut config = MeshConfig::default();
        config.set_max_bridges(3).expect("valid");
        assert!(matches!(
            config.set_max_bridges(6),
            Err(ConfigError::InvalidValue("max_bridges"))
        ));
        assert_eq!(config.max_bridges, 3);
    }

    #[test]
    fn channel_zero_means_auto_and_is_accepted() {
        let mut config = MeshConfig::default();
        config.set_mesh_credentials("mesh", "pw", 0, 5555).expect("set");
        assert_eq!(config.channel, 0);
    }

    #[test]
    fn election_needs_router_credentials() {
        let mut config = MeshConfig::default();
        assert!(!config.has_router_credentials());
        assert!(config.set_router_credentials("", "pw").is_err());
        config.set_router_credentials("upstream", "pw").expect("set");
        assert!(config.has_router_credentials());
    }

    #[test]
    fn debug_mask_filters_scopes() {
        let mask = DebugMask::NONE.with(DebugScope::Sync).with(DebugScope::Error);
        assert!(mask.allows(DebugScope::Sync));
        assert!(mask.allows(DebugScope::Error));
        assert!(!mask.allows(DebugScope::Connection));
        assert!(DebugMask::ALL.allows(DebugScope::Remote));
        assert!(!DebugMask::NONE.allows(DebugScope::Error));
    }
}
