//! Outbound bridge selection for multi-bridge meshes.

use lattice_proto::NodeId;

use super::table::{BridgeInfo, BridgeTable};

/// How `select` picks among healthy bridges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionStrategy {
    #[default]
    PriorityBased,
    RoundRobin,
    BestSignal,
}

pub struct BridgeSelector {
    strategy: SelectionStrategy,
    max_bridges: u8,
    manual_override: Option<NodeId>,
    last_round_robin: Option<NodeId>,
}

impl BridgeSelector {
    pub fn new(strategy: SelectionStrategy, max_bridges: u8) -> Self {
        Self { strategy, max_bridges, manual_override: None, last_round_robin: None }
    }

    pub fn set_strategy(&mut self, strategy: SelectionStrategy) {
        self.strategy = strategy;
    }

    pub fn set_max_bridges(&mut self, max_bridges: u8) {
        self.max_bridges = max_bridges;
    }

    /// Force the next single selection to `node_id`, superseding the
    /// strategy once.
    pub fn select_override(&mut self, node_id: NodeId) {
        self.manual_override = Some(node_id);
    }

    /// Pick the outbound bridge. Only the `max_bridges` best-priority
    /// healthy bridges are considered.
    pub fn select(&mut self, table: &BridgeTable, now_ms: u64) -> Option<NodeId> {
        if let Some(forced) = self.manual_override.take() {
            if table.get(forced).map(|b| b.is_healthy(now_ms)).unwrap_or(false) {
                return Some(forced);
            }
            log::debug!("bridge: manual override {} is not healthy, falling back", forced);
        }

        let mut pool: Vec<&BridgeInfo> = table.healthy(now_ms);
        pool.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.router_rssi.cmp(&a.router_rssi))
                .then(b.uptime_ms.cmp(&a.uptime_ms))
                .then(a.node_id.cmp(&b.node_id))
        });
        pool.truncate(self.max_bridges as usize);
        if pool.is_empty() {
            return None;
        }

        match self.strategy {
            SelectionStrategy::PriorityBased => pool.first().map(|b| b.node_id),
            SelectionStrategy::RoundRobin => {
                let mut ids: Vec<NodeId> = pool.iter().map(|b| b.node_id).collect();
                ids.sort_unstable();
                let next = match self.last_round_robin {
                    Some(last) => ids.iter().copied().find(|&id| id > last).or(ids.first().copied()),
                    None => ids.first().copied(),
                };
                self.last_round_robin = next;
                next
            }
            SelectionStrategy::BestSignal => pool
                .iter()
                .max_by(|a, b| {
                    a.router_rssi.cmp(&b.router_rssi).then(b.node_id.cmp(&a.node_id))
                })
                .map(|b| b.node_id),
        }
    }
}
