//! Typed bodies for every internal protocol package.
//!
//! Field names follow the wire's camelCase convention. Absent optional
//! fields decode to their zero values so older peers stay readable.

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Advertised subtree as seen over one link.
///
/// `subs` never contains the tree's own `node_id`; at most one node in any
/// tree carries `root = true`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTree {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "is_false")]
    pub root: bool,
    #[serde(rename = "containsRoot", default, skip_serializing_if = "is_false")]
    pub contains_root: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<NodeTree>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl NodeTree {
    pub fn leaf(node_id: NodeId) -> Self {
        Self { node_id, ..Self::default() }
    }

    /// Whether `node_id` appears anywhere in this tree.
    pub fn contains(&self, node_id: NodeId) -> bool {
        if self.node_id == node_id {
            return true;
        }
        self.subs.iter().any(|sub| sub.contains(node_id))
    }

    /// Total number of nodes in the tree.
    pub fn size(&self) -> u32 {
        1 + self.subs.iter().map(NodeTree::size).sum::<u32>()
    }

    /// Whether any node in the tree claims to be, or to contain, the root.
    pub fn is_rooted(&self) -> bool {
        self.root || self.contains_root || self.subs.iter().any(NodeTree::is_rooted)
    }

    /// Every node id in the tree, depth-first.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut out = vec![self.node_id];
        for sub in &self.subs {
            out.extend(sub.node_ids());
        }
        out
    }
}

/// One-link round-trip delay measurement (type 3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeDelay {
    #[serde(default)]
    pub step: u8,
    #[serde(default)]
    pub t0: u64,
    #[serde(default)]
    pub t1: u64,
}

/// Three-step pairwise offset negotiation (type 4).
///
/// Step 0 carries `t0`; step 1 adds the responder's `t1`/`t2`; step 2
/// mirrors all four stamps back so the responder can apply the correction
/// from its side. `authority` is the sender's time-authority flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSync {
    #[serde(default)]
    pub step: u8,
    #[serde(default)]
    pub t0: u64,
    #[serde(default)]
    pub t1: u64,
    #[serde(default)]
    pub t2: u64,
    #[serde(default)]
    pub t3: u64,
    #[serde(default)]
    pub authority: bool,
}

/// User payload addressed to one node (type 9).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinglePayload {
    pub msg: String,
}

/// User payload flooded to the whole mesh (type 8).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub msg: String,
}

/// Bridge role, derived from priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeRole {
    Primary,
    Secondary,
    #[default]
    Standby,
}

impl BridgeRole {
    pub fn from_priority(priority: u8) -> Self {
        match priority {
            p if p >= 8 => Self::Primary,
            p if p >= 5 => Self::Secondary,
            _ => Self::Standby,
        }
    }
}

/// Periodic bridge heartbeat (type 610).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    #[serde(rename = "internetConnected", default)]
    pub internet_connected: bool,
    #[serde(rename = "routerRSSI", default)]
    pub router_rssi: i8,
    #[serde(rename = "routerChannel", default)]
    pub router_channel: u8,
    #[serde(rename = "uptimeMs", default)]
    pub uptime_ms: u64,
    #[serde(rename = "gatewayIp", default)]
    pub gateway_ip: String,
    #[serde(default)]
    pub timestamp: u64,
}

/// Candidacy announcement during a bridge election (type 611).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeElection {
    #[serde(rename = "routerRSSI", default)]
    pub router_rssi: i8,
    #[serde(rename = "uptimeMs", default)]
    pub uptime_ms: u64,
    #[serde(rename = "freeMemory", default)]
    pub free_memory: u32,
    #[serde(rename = "routerSSID", default)]
    pub router_ssid: String,
}

/// Announcement that the sender has taken over as bridge (type 612).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTakeover {
    #[serde(rename = "previousBridge", default)]
    pub previous_bridge: NodeId,
    #[serde(default)]
    pub reason: String,
}

/// Periodic multi-bridge coordination broadcast (type 613).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeCoordination {
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub role: BridgeRole,
    #[serde(rename = "peerBridges", default)]
    pub peer_bridges: Vec<NodeId>,
    #[serde(default)]
    pub load: u8,
    #[serde(default)]
    pub timestamp: u64,
}

/// Bridge-originated NTP timestamp distribution (type 614).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpTimeSync {
    #[serde(rename = "ntpTime", default)]
    pub ntp_time: u64,
    #[serde(rename = "accuracyMs", default)]
    pub accuracy_ms: u32,
    #[serde(rename = "sourceName", default)]
    pub source_name: String,
}

/// A node's claim during an election, keyed by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeCandidate {
    pub node_id: NodeId,
    pub router_rssi: i8,
    pub uptime_ms: u64,
    pub free_memory: u32,
}

impl BridgeCandidate {
    pub fn from_election(node_id: NodeId, package: &BridgeElection) -> Self {
        Self {
            node_id,
            router_rssi: package.router_rssi,
            uptime_ms: package.uptime_ms,
            free_memory: package.free_memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_level_tree() -> NodeTree {
        NodeTree {
            node_id: 10,
            root: true,
            contains_root: false,
            subs: vec![
                NodeTree { node_id: 20, subs: vec![NodeTree::leaf(30)], ..NodeTree::default() },
                NodeTree::leaf(40),
            ],
        }
    }

    #[test]
    fn tree_contains_and_size() {
        let tree = three_level_tree();
        assert!(tree.contains(10));
        assert!(tree.contains(30));
        assert!(!tree.contains(99));
        assert_eq!(tree.size(), 4);
        assert_eq!(tree.node_ids(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn tree_serde_uses_wire_names() {
        let json = serde_json::to_value(three_level_tree()).expect("encode");
        assert_eq!(json["nodeId"], 10);
        assert_eq!(json["root"], true);
        assert!(json.get("containsRoot").is_none());
        assert_eq!(json["subs"][0]["nodeId"], 20);
        // leaves omit empty subs
        assert!(json["subs"][1].get("subs").is_none());
    }

    #[test]
    fn tree_decodes_with_absent_flags() {
        let tree: NodeTree = serde_json::from_str(r#"{"nodeId":7}"#).expect("decode");
        assert_eq!(tree.node_id, 7);
        assert!(!tree.root);
        assert!(!tree.contains_root);
        assert!(tree.subs.is_empty());
    }

    #[test]
    fn is_rooted_sees_nested_claims() {
        let mut tree = NodeTree::leaf(1);
        assert!(!tree.is_rooted());
        tree.subs.push(NodeTree { node_id: 2, contains_root: true, ..NodeTree::default() });
        assert!(tree.is_rooted());
    }

    #[test]
    fn role_derives_from_priority() {
        assert_eq!(BridgeRole::from_priority(10), BridgeRole::Primary);
        assert_eq!(BridgeRole::from_priority(8), BridgeRole::Primary);
        assert_eq!(BridgeRole::from_priority(7), BridgeRole::Secondary);
        assert_eq!(BridgeRole::from_priority(5), BridgeRole::Secondary);
        assert_eq!(BridgeRole::from_priority(4), BridgeRole::Standby);
        assert_eq!(BridgeRole::from_priority(1), BridgeRole::Standby);
    }

    #[test]
    fn bridge_status_wire_names() {
        let status = BridgeStatus {
            internet_connected: true,
            router_rssi: -55,
            router_channel: 6,
            uptime_ms: 1000,
            gateway_ip: "192.168.1.1".into(),
            timestamp: 42,
        };
        let json = serde_json::to_value(&status).expect("encode");
        assert_eq!(json["internetConnected"], true);
        assert_eq!(json["routerRSSI"], -55);
        assert_eq!(json["gatewayIp"], "192.168.1.1");
        let back: BridgeStatus = serde_json::from_value(json).expect("decode");
        assert_eq!(back, status);
    }

    #[test]
    fn coordination_roundtrip() {
        let pkg = BridgeCoordination {
            priority: 9,
            role: BridgeRole::Primary,
            peer_bridges: vec![11, 12],
            load: 40,
            timestamp: 5,
        };
        let json = serde_json::to_value(&pkg).expect("encode");
        assert_eq!(json["role"], "primary");
        assert_eq!(json["peerBridges"][1], 12);
        let back: BridgeCoordination = serde_json::from_value(json).expect("decode");
        assert_eq!(back, pkg);
    }
}
