//! Bridge subsystem: status heartbeats, failover election, multi-bridge
//! coordination, NTP time distribution.
//!
//! The manager owns the local bridge role and the view of every other
//! bridge; the mesh facade drives it from inbound packets and scheduler
//! ticks.

pub mod coordination;
pub mod election;
pub mod table;

pub use coordination::{BridgeSelector, SelectionStrategy};
pub use election::{pick_winner, ElectionManager, ElectionState, ROLE_CHANGE_COOLDOWN_MS};
pub use table::{BridgeInfo, BridgeTable, StatusChange, BRIDGE_FRESHNESS_MS};

use lattice_proto::{BridgeCoordination, BridgeRole, BridgeStatus, NodeId};

pub struct BridgeManager {
    is_bridge: bool,
    bridge_since_ms: u64,
    priority: u8,
    internet_connected: bool,
    router_rssi: i8,
    router_channel: u8,
    gateway_ip: String,
    load: u8,
    /// Set on promotion; the mesh registers the broadcast tasks on its next
    /// update pass, never from inside the promotion path itself.
    tasks_pending: bool,
    pub(crate) table: BridgeTable,
    pub(crate) election: ElectionManager,
    pub(crate) selector: BridgeSelector,
}

impl BridgeManager {
    pub fn new(strategy: SelectionStrategy, max_bridges: u8) -> Self {
        Self {
            is_bridge: false,
            bridge_since_ms: 0,
            priority: 5,
            internet_connected: false,
            router_rssi: 0,
            router_channel: 0,
            gateway_ip: String::new(),
            load: 0,
            tasks_pending: false,
            table: BridgeTable::new(),
            election: ElectionManager::new(),
            selector: BridgeSelector::new(strategy, max_bridges),
        }
    }

    pub fn is_bridge(&self) -> bool {
        self.is_bridge
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.clamp(1, 10);
    }

    /// Take the bridge role. Broadcast tasks are deferred to the next
    /// update pass.
    pub fn init_bridge(&mut self, now_ms: u64) {
        if self.is_bridge {
            return;
        }
        self.is_bridge = true;
        self.bridge_since_ms = now_ms;
        self.tasks_pending = true;
        self.election.record_role_change(now_ms);
        log::info!("bridge: node is now a bridge");
    }

    /// Give the bridge role up.
    pub fn retire_bridge(&mut self, now_ms: u64) {
        if !self.is_bridge {
            return;
        }
        self.is_bridge = false;
        self.internet_connected = false;
        self.election.record_role_change(now_ms);
        log::info!("bridge: node is no longer a bridge");
    }

    /// One-time signal that the broadcast tasks still need registering.
    pub fn take_tasks_pending(&mut self) -> bool {
        std::mem::take(&mut self.tasks_pending)
    }

    /// Feed the local uplink observations; returns whether the Internet
    /// flag flipped.
    pub fn set_local_status(
        &mut self,
        internet_connected: bool,
        router_rssi: i8,
        router_channel: u8,
        gateway_ip: &str,
    ) -> bool {
        let flipped = self.internet_connected != internet_connected;
        self.internet_connected = internet_connected;
        self.router_rssi = router_rssi;
        self.router_channel = router_channel;
        if self.gateway_ip != gateway_ip {
            self.gateway_ip = gateway_ip.to_string();
        }
        flipped
    }

    pub fn set_load(&mut self, load: u8) {
        self.load = load.min(100);
    }

    pub fn local_internet(&self) -> bool {
        self.is_bridge && self.internet_connected
    }

    /// Any Internet path, local uplink or a healthy remote bridge.
    pub fn has_internet(&self, now_ms: u64) -> bool {
        self.local_internet() || self.table.has_internet(now_ms)
    }

    pub fn status_package(&self, now_ms: u64, mesh_time_micros: u64) -> BridgeStatus {
        BridgeStatus {
            internet_connected: self.internet_connected,
            router_rssi: self.router_rssi,
            router_channel: self.router_channel,
            uptime_ms: now_ms.saturating_sub(self.bridge_since_ms),
            gateway_ip: self.gateway_ip.clone(),
            timestamp: mesh_time_micros,
        }
    }

    pub fn coordination_package(&self, mesh_time_micros: u64) -> BridgeCoordination {
        BridgeCoordination {
            priority: self.priority,
            role: BridgeRole::from_priority(self.priority),
            peer_bridges: self.table.ids(),
            load: self.load,
            timestamp: mesh_time_micros,
        }
    }

    pub fn table(&self) -> &BridgeTable {
        &self.table
    }

    pub fn primary(&self, now_ms: u64) -> Option<NodeId> {
        self.table.primary(now_ms).map(|b| b.node_id)
    }
}
