//! Known-bridges table, fed by status and coordination broadcasts.

use std::collections::BTreeMap;

use lattice_proto::{BridgeCoordination, BridgeRole, BridgeStatus, NodeId};

/// A bridge is healthy while its last status is younger than this and it
/// reports an Internet uplink.
pub const BRIDGE_FRESHNESS_MS: u64 = 60_000;

/// Entries older than this are forgotten entirely.
const BRIDGE_RETENTION_MS: u64 = 300_000;

/// Default priority for a bridge that has only ever sent status packets.
const DEFAULT_PRIORITY: u8 = 5;

/// Everything known about one bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    pub node_id: NodeId,
    pub internet_connected: bool,
    pub router_rssi: i8,
    pub router_channel: u8,
    pub uptime_ms: u64,
    pub gateway_ip: String,
    pub last_seen_ms: u64,
    pub priority: u8,
    pub role: BridgeRole,
    pub load: u8,
    pub peer_bridges: Vec<NodeId>,
}

impl BridgeInfo {
    pub fn is_healthy(&self, now_ms: u64) -> bool {
        self.internet_connected && now_ms.saturating_sub(self.last_seen_ms) < BRIDGE_FRESHNESS_MS
    }
}

/// What a status update changed, for callback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub is_new: bool,
    /// `Some(new_value)` when `internet_connected` flipped.
    pub internet_flipped: Option<bool>,
}

#[derive(Default)]
pub struct BridgeTable {
    map: BTreeMap<NodeId, BridgeInfo>,
}

impl BridgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_status(&mut self, from: NodeId, status: &BridgeStatus, now_ms: u64) -> StatusChange {
        match self.map.get_mut(&from) {
            Some(entry) => {
                let flipped = (entry.internet_connected != status.internet_connected)
                    .then_some(status.internet_connected);
                entry.internet_connected = status.internet_connected;
                entry.router_rssi = status.router_rssi;
                entry.router_channel = status.router_channel;
                entry.uptime_ms = status.uptime_ms;
                entry.gateway_ip = status.gateway_ip.clone();
                entry.last_seen_ms = now_ms;
                StatusChange { is_new: false, internet_flipped: flipped }
            }
            None => {
                self.map.insert(
                    from,
                    BridgeInfo {
                        node_id: from,
                        internet_connected: status.internet_connected,
                        router_rssi: status.router_rssi,
                        router_channel: status.router_channel,
                        uptime_ms: status.uptime_ms,
                        gateway_ip: status.gateway_ip.clone(),
                        last_seen_ms: now_ms,
                        priority: DEFAULT_PRIORITY,
                        role: BridgeRole::from_priority(DEFAULT_PRIORITY),
                        load: 0,
                        peer_bridges: Vec::new(),
                    },
                );
                StatusChange { is_new: true, internet_flipped: None }
            }
        }
    }

    pub fn update_coordination(&mut self, from: NodeId, pkg: &BridgeCoordination, now_ms: u64) {
        let entry = self.map.entry(from).or_insert_with(|| BridgeInfo {
            node_id: from,
            internet_connected: false,
            router_rssi: 0,
            router_channel: 0,
            uptime_ms: 0,
            gateway_ip: String::new(),
            last_seen_ms: now_ms,
            priority: DEFAULT_PRIORITY,
            role: BridgeRole::from_priority(DEFAULT_PRIORITY),
            load: 0,
            peer_bridges: Vec::new(),
        });
        entry.priority = pkg.priority;
        entry.role = BridgeRole::from_priority(pkg.priority);
        entry.load = pkg.load;
        entry.peer_bridges = pkg.peer_bridges.clone();
        entry.last_seen_ms = now_ms;
    }

    pub fn remove(&mut self, node_id: NodeId) -> bool {
        self.map.remove(&node_id).is_some()
    }

    pub fn get(&self, node_id: NodeId) -> Option<&BridgeInfo> {
        self.map.get(&node_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Node ids of every known bridge.
    pub fn ids(&self) -> Vec<NodeId> {
        self.map.keys().copied().collect()
    }

    pub fn healthy(&self, now_ms: u64) -> Vec<&BridgeInfo> {
        self.map.values().filter(|b| b.is_healthy(now_ms)).collect()
    }

    pub fn has_internet(&self, now_ms: u64) -> bool {
        self.map.values().any(|b| b.is_healthy(now_ms))
    }

    /// The healthy bridge with the highest priority; ties break by best
    /// RSSI, then longest uptime, then smallest node id.
    pub fn primary(&self, now_ms: u64) -> Option<&BridgeInfo> {
        self.map.values().filter(|b| b.is_healthy(now_ms)).max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.router_rssi.cmp(&b.router_rssi))
                .then(a.uptime_ms.cmp(&b.uptime_ms))
                .then(b.node_id.cmp(&a.node_id))
        })
    }

    /// Forget bridges not heard from for a long time.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let before = self.map.len();
        self.map.retain(|_, b| now_ms.saturating_sub(b.last_seen_ms) < BRIDGE_RETENTION_MS);
        before - self.map.len()
    }
}
