//! Bridge failover election.
//!
//! One bounded round per trigger: scan for the router, announce candidacy,
//! collect competing claims until the deadline, pick the winner by a fixed
//! key order. All paths end back in Idle.

use lattice_proto::BridgeCandidate;

use crate::error::ElectionError;

/// A node refuses to start an election this soon after its own role
/// changed.
pub const ROLE_CHANGE_COOLDOWN_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Scanning { since_ms: u64 },
    Collecting { deadline_ms: u64 },
}

pub struct ElectionManager {
    state: ElectionState,
    candidates: Vec<BridgeCandidate>,
    last_role_change_ms: Option<u64>,
}

impl Default for ElectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ElectionManager {
    pub fn new() -> Self {
        Self { state: ElectionState::Idle, candidates: Vec::new(), last_role_change_ms: None }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.state, ElectionState::Collecting { .. })
    }

    pub fn record_role_change(&mut self, now_ms: u64) {
        self.last_role_change_ms = Some(now_ms);
    }

    /// Move Idle → Scanning. Fails when a round is already running or the
    /// node changed roles too recently.
    pub fn begin_scan(&mut self, now_ms: u64) -> Result<(), ElectionError> {
        if self.state != ElectionState::Idle {
            return Err(ElectionError::NotEligible);
        }
        if let Some(changed) = self.last_role_change_ms {
            if now_ms.saturating_sub(changed) < ROLE_CHANGE_COOLDOWN_MS {
                return Err(ElectionError::RateLimited);
            }
        }
        self.state = ElectionState::Scanning { since_ms: now_ms };
        Ok(())
    }

    /// The router scan came back empty; the round is over before it began.
    pub fn scan_failed(&mut self) {
        self.state = ElectionState::Idle;
        self.candidates.clear();
    }

    /// Scanning → Collecting with our own candidacy seeded.
    pub fn open_collection(&mut self, own: BridgeCandidate, now_ms: u64, timeout_ms: u64) {
        self.candidates.clear();
        self.candidates.push(own);
        self.state = ElectionState::Collecting { deadline_ms: now_ms + timeout_ms };
    }

    /// Record a competing claim. First-seen wins per node id; claims
    /// outside a Collecting window are dropped.
    pub fn add_candidate(&mut self, candidate: BridgeCandidate) -> bool {
        if !self.is_collecting() {
            return false;
        }
        if self.candidates.iter().any(|c| c.node_id == candidate.node_id) {
            return false;
        }
        self.candidates.push(candidate);
        true
    }

    /// At the deadline, close the round and hand back the candidate set.
    pub fn poll_deadline(&mut self, now_ms: u64) -> Option<Vec<BridgeCandidate>> {
        let ElectionState::Collecting { deadline_ms } = self.state else {
            return None;
        };
        if now_ms < deadline_ms {
            return None;
        }
        self.state = ElectionState::Idle;
        Some(std::mem::take(&mut self.candidates))
    }

    /// Abort from any state. Returns whether a collection round was in
    /// flight (a lost election, if triggered by a takeover packet).
    pub fn abort(&mut self) -> bool {
        let was_collecting = self.is_collecting();
        self.state = ElectionState::Idle;
        self.candidates.clear();
        was_collecting
    }
}

/// Winner ordering: best RSSI, then longest uptime, then most free memory,
/// then smallest node id. A pure function of the candidate set.
pub fn pick_winner(candidates: &[BridgeCandidate]) -> Option<BridgeCandidate> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.router_rssi
                .cmp(&b.router_rssi)
                .then(a.uptime_ms.cmp(&b.uptime_ms))
                .then(a.free_memory.cmp(&b.free_memory))
                .then(b.node_id.cmp(&a.node_id))
        })
        .copied()
}
