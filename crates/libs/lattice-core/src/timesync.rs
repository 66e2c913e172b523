//! Pairwise time synchronization.
//!
//! Mesh time is the local monotonic clock plus a signed offset. A
//! three-step stamp exchange measures the pairwise offset; whether a side
//! applies the correction is decided by the authority rule: an
//! authoritative node never takes time from a non-authoritative one, and
//! between equals the larger subnet wins, then the smaller node id.

use lattice_proto::{NodeId, TimeSync};

use crate::registry::ConnectionId;

/// How long an unanswered step-0 probe is kept before the exchange is
/// abandoned. No retry is scheduled; the next periodic tick tries again.
pub const SYNC_ABANDON_MS: u64 = 10_000;

/// Snapshot of the local clock discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeState {
    pub node_offset_micros: i64,
    pub drift: i32,
    pub has_authority: bool,
    pub last_sync_ms: u64,
    pub subnet_size: u32,
}

/// One adoption decision, per spec rule.
pub fn should_adopt(
    self_authority: bool,
    peer_authority: bool,
    self_subnet: u32,
    peer_subnet: u32,
    local_id: NodeId,
    peer_id: NodeId,
) -> bool {
    match (self_authority, peer_authority) {
        (true, false) => false,
        (false, true) => true,
        _ => peer_subnet > self_subnet || (peer_subnet == self_subnet && peer_id < local_id),
    }
}

struct PendingSync {
    conn: ConnectionId,
    peer: NodeId,
    t0: u64,
    started_ms: u64,
}

/// Result of feeding one TIME_SYNC package through the keeper.
#[derive(Default)]
pub struct SyncOutcome {
    /// Package to send back on the same link, if any.
    pub reply: Option<TimeSync>,
    /// Offset correction applied locally, in microseconds.
    pub adjusted: Option<i64>,
    /// The exchange this node initiated completed (success signal for the
    /// link's stability score).
    pub completed: bool,
}

pub struct TimeKeeper {
    offset_micros: i64,
    drift: i32,
    has_authority: bool,
    last_sync_ms: u64,
    pending: Option<PendingSync>,
}

impl Default for TimeKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeKeeper {
    pub fn new() -> Self {
        Self {
            offset_micros: 0,
            drift: 0,
            has_authority: false,
            last_sync_ms: 0,
            pending: None,
        }
    }

    /// Mesh time in microseconds.
    pub fn mesh_micros(&self, now_ms: u64) -> u64 {
        (now_ms as i64)
            .saturating_mul(1000)
            .saturating_add(self.offset_micros)
            .max(0) as u64
    }

    pub fn has_authority(&self) -> bool {
        self.has_authority
    }

    pub fn set_authority(&mut self, authority: bool) {
        self.has_authority = authority;
    }

    pub fn state(&self, subnet_size: u32) -> TimeState {
        TimeState {
            node_offset_micros: self.offset_micros,
            drift: self.drift,
            has_authority: self.has_authority,
            last_sync_ms: self.last_sync_ms,
            subnet_size,
        }
    }

    /// Start an exchange toward `peer`. Returns `None` while a previous
    /// exchange is still in flight.
    pub fn begin(&mut self, conn: ConnectionId, peer: NodeId, now_ms: u64) -> Option<TimeSync> {
        if self.pending.is_some() {
            return None;
        }
        let t0 = self.mesh_micros(now_ms);
        self.pending = Some(PendingSync { conn, peer, t0, started_ms: now_ms });
        Some(TimeSync { step: 0, t0, authority: self.has_authority, ..TimeSync::default() })
    }

    /// Feed one received TIME_SYNC package through the state machine.
    ///
    /// `self_subnet` is the local subnet size as seen from the peer's
    /// direction; `peer_subnet` is the size of the subtree the peer
    /// advertises on this link.
    #[allow(clippy::too_many_arguments)]
    pub fn handle(
        &mut self,
        conn: ConnectionId,
        peer: NodeId,
        package: &TimeSync,
        now_ms: u64,
        local_id: NodeId,
        self_subnet: u32,
        peer_subnet: u32,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        match package.step {
            0 => {
                let now = self.mesh_micros(now_ms);
                outcome.reply = Some(TimeSync {
                    step: 1,
                    t0: package.t0,
                    t1: now,
                    t2: now,
                    t3: 0,
                    authority: self.has_authority,
                });
            }
            1 => {
                let Some(pending) = self.pending.as_ref() else {
                    return outcome;
                };
                if pending.conn != conn || pending.t0 != package.t0 {
                    return outcome;
                }
                self.pending = None;
                outcome.completed = true;

                let t3 = self.mesh_micros(now_ms);
                let delta = ((package.t1 as i64 - package.t0 as i64)
                    + (package.t2 as i64 - t3 as i64))
                    / 2;
                if should_adopt(
                    self.has_authority,
                    package.authority,
                    self_subnet,
                    peer_subnet,
                    local_id,
                    peer,
                ) {
                    self.apply(delta, now_ms);
                    outcome.adjusted = Some(delta);
                }
                outcome.reply = Some(TimeSync {
                    step: 2,
                    t0: package.t0,
                    t1: package.t1,
                    t2: package.t2,
                    t3,
                    authority: self.has_authority,
                });
            }
            2 => {
                // mirror of the initiator's correction, seen from this side
                let delta = ((package.t0 as i64 - package.t1 as i64)
                    + (package.t3 as i64 - package.t2 as i64))
                    / 2;
                if should_adopt(
                    self.has_authority,
                    package.authority,
                    self_subnet,
                    peer_subnet,
                    local_id,
                    peer,
                ) {
                    self.apply(delta, now_ms);
                    outcome.adjusted = Some(delta);
                }
            }
            other => {
                log::debug!("timesync: ignoring unknown step {} from {}", other, peer);
            }
        }
        outcome
    }

    /// Jump mesh time to an absolute value (NTP distribution). Grants
    /// authority. Returns the applied delta.
    pub fn adopt_absolute(&mut self, target_micros: u64, now_ms: u64) -> i64 {
        let delta = target_micros as i64 - self.mesh_micros(now_ms) as i64;
        self.apply(delta, now_ms);
        self.has_authority = true;
        delta
    }

    /// Abandon an exchange whose peer never answered. Returns the link to
    /// penalize.
    pub fn poll_timeout(&mut self, now_ms: u64) -> Option<ConnectionId> {
        let expired = self
            .pending
            .as_ref()
            .map(|p| now_ms.saturating_sub(p.started_ms) >= SYNC_ABANDON_MS)
            .unwrap_or(false);
        if expired {
            let pending = self.pending.take()?;
            log::debug!("timesync: abandoning exchange with {}", pending.peer);
            return Some(pending.conn);
        }
        None
    }

    pub fn in_flight(&self) -> bool {
        self.pending.is_some()
    }

    fn apply(&mut self, delta_micros: i64, now_ms: u64) {
        self.offset_micros = self.offset_micros.saturating_add(delta_micros);
        let clamped = delta_micros.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        self.drift = ((self.drift as i64 + clamped as i64) / 2) as i32;
        self.last_sync_ms = now_ms;
    }
}
