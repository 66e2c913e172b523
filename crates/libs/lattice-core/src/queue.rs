//! Priority message queue for offline durability.
//!
//! Bounded, priority-preserving, with an eviction order that never touches
//! Critical messages: when full, the oldest Low is evicted first, then the
//! oldest Normal, then the oldest High. An all-Critical queue rejects new
//! work instead of dropping.

use crate::error::QueueError;

/// Message priority, lowest discriminant first in flush order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn as_index(self) -> usize {
        self as usize
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            _ => None,
        }
    }
}

/// One queued payload. Ids are monotonically assigned per process and
/// never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: u64,
    pub priority: Priority,
    pub enqueued_at_ms: u64,
    pub attempts: u32,
    pub payload: Vec<u8>,
    pub destination: String,
}

/// Observable fill level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Empty,
    Normal,
    SeventyFivePercent,
    Full,
}

/// Cumulative counters; never reset by `clear`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_queued: u64,
    pub total_sent: u64,
    pub total_dropped: u64,
    pub per_priority_dropped: [u64; 4],
}

pub struct MessageQueue {
    items: Vec<QueuedMessage>,
    capacity: usize,
    next_id: u64,
    max_attempts: u32,
    enabled: bool,
    stats: QueueStats,
    last_reported: QueueState,
    dirty: bool,
}

impl MessageQueue {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            items: Vec::new(),
            capacity: capacity.max(1),
            next_id: 1,
            max_attempts: max_attempts.max(1),
            enabled: false,
            stats: QueueStats::default(),
            last_reported: QueueState::Empty,
            dirty: false,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn state(&self) -> QueueState {
        let count = self.items.len();
        if count == 0 {
            QueueState::Empty
        } else if count == self.capacity {
            QueueState::Full
        } else if count * 4 >= self.capacity * 3 {
            QueueState::SeventyFivePercent
        } else {
            QueueState::Normal
        }
    }

    /// State transition since the last call, for the state-change callback.
    pub fn take_state_change(&mut self) -> Option<(QueueState, usize)> {
        let state = self.state();
        if state == self.last_reported {
            return None;
        }
        self.last_reported = state;
        Some((state, self.items.len()))
    }

    /// Whether the contents changed since the last persistence snapshot.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Add a message, evicting per policy when full.
    pub fn enqueue(
        &mut self,
        payload: Vec<u8>,
        destination: String,
        priority: Priority,
        now_ms: u64,
    ) -> Result<u64, QueueError> {
        if !self.enabled {
            return Err(QueueError::NotEnabled);
        }
        if self.items.len() >= self.capacity {
            let victim = self.find_victim().ok_or(QueueError::Saturated)?;
            let evicted = self.items.remove(victim);
            self.stats.total_dropped += 1;
            self.stats.per_priority_dropped[evicted.priority.as_index()] += 1;
            log::debug!(
                "queue: evicted message {} ({:?}) to make room",
                evicted.id,
                evicted.priority
            );
        }
        let id = self.next_id;
        self.next_id += 1;
        self.items.push(QueuedMessage {
            id,
            priority,
            enqueued_at_ms: now_ms,
            attempts: 0,
            payload,
            destination,
        });
        self.stats.total_queued += 1;
        self.dirty = true;
        Ok(id)
    }

    /// Oldest message of the lowest evictable class. Critical is never a
    /// victim.
    fn find_victim(&self) -> Option<usize> {
        for class in [Priority::Low, Priority::Normal, Priority::High] {
            let victim = self
                .items
                .iter()
                .enumerate()
                .filter(|(_, m)| m.priority == class)
                .min_by_key(|(_, m)| (m.enqueued_at_ms, m.id));
            if let Some((index, _)) = victim {
                return Some(index);
            }
        }
        None
    }

    /// Attempt delivery in priority order, lower id first within a
    /// priority. A successful send removes the message; a failure counts an
    /// attempt and removes the message once `max_attempts` is reached.
    /// Returns the number sent.
    pub fn flush(&mut self, mut send: impl FnMut(&QueuedMessage) -> bool) -> usize {
        let mut order: Vec<(Priority, u64)> = self.items.iter().map(|m| (m.priority, m.id)).collect();
        order.sort_unstable();

        let mut sent = 0;
        for (_, id) in order {
            let Some(index) = self.items.iter().position(|m| m.id == id) else {
                continue;
            };
            if send(&self.items[index]) {
                self.items.remove(index);
                self.stats.total_sent += 1;
                sent += 1;
                self.dirty = true;
            } else {
                let message = &mut self.items[index];
                message.attempts += 1;
                self.dirty = true;
                if message.attempts >= self.max_attempts {
                    let dropped = self.items.remove(index);
                    self.stats.total_dropped += 1;
                    self.stats.per_priority_dropped[dropped.priority.as_index()] += 1;
                    log::debug!("queue: message {} dropped after {} attempts", dropped.id, dropped.attempts);
                }
            }
        }
        sent
    }

    /// Drop messages older than `max_age_ms`. Returns how many.
    pub fn prune_by_age(&mut self, now_ms: u64, max_age_ms: u64) -> usize {
        let before = self.items.len();
        let stats = &mut self.stats;
        self.items.retain(|m| {
            let keep = now_ms.saturating_sub(m.enqueued_at_ms) <= max_age_ms;
            if !keep {
                stats.total_dropped += 1;
                stats.per_priority_dropped[m.priority.as_index()] += 1;
            }
            keep
        });
        let removed = before - self.items.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Remove one message by id.
    pub fn cancel(&mut self, id: u64) -> Result<(), QueueError> {
        let index = self.items.iter().position(|m| m.id == id).ok_or(QueueError::NotFound)?;
        self.items.remove(index);
        self.dirty = true;
        Ok(())
    }

    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            self.dirty = true;
        }
        self.items.clear();
    }

    /// Messages in flush order, for inspection.
    pub fn snapshot(&self) -> Vec<&QueuedMessage> {
        let mut out: Vec<&QueuedMessage> = self.items.iter().collect();
        out.sort_by_key(|m| (m.priority, m.id));
        out
    }

    /// Serialize the contents for host-side persistence.
    pub fn save(&mut self) -> Vec<u8> {
        self.dirty = false;
        persist::encode(&self.items)
    }

    /// Replace the contents from a persisted blob. Corrupt tails are
    /// discarded; the id counter resumes past the highest restored id.
    pub fn load(&mut self, blob: &[u8]) {
        self.items = persist::decode(blob);
        if self.items.len() > self.capacity {
            self.items.truncate(self.capacity);
        }
        self.next_id = self.items.iter().map(|m| m.id).max().map(|id| id + 1).unwrap_or(1).max(self.next_id);
        self.dirty = false;
    }
}

/// Length-prefixed little-endian record framing for the persistence blob.
pub mod persist {
    use super::{Priority, QueuedMessage};

    const MAGIC: &[u8; 8] = b"LTCQUE0\0";
    const VERSION: u8 = 1;

    pub fn encode(items: &[QueuedMessage]) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + items.len() * 64);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        for m in items {
            out.extend_from_slice(&m.id.to_le_bytes());
            out.push(m.priority as u8);
            out.extend_from_slice(&m.enqueued_at_ms.to_le_bytes());
            out.extend_from_slice(&m.attempts.to_le_bytes());
            out.extend_from_slice(&(m.destination.len() as u32).to_le_bytes());
            out.extend_from_slice(m.destination.as_bytes());
            out.extend_from_slice(&(m.payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&m.payload);
        }
        out
    }

    pub fn decode(blob: &[u8]) -> Vec<QueuedMessage> {
        if blob.len() < MAGIC.len() + 1 || &blob[..MAGIC.len()] != MAGIC || blob[MAGIC.len()] != VERSION {
            log::debug!("queue: persistence blob rejected (bad header)");
            return Vec::new();
        }
        let mut cursor = &blob[MAGIC.len() + 1..];
        let mut out = Vec::new();
        loop {
            match decode_record(cursor) {
                Some((message, rest)) => {
                    out.push(message);
                    cursor = rest;
                    if cursor.is_empty() {
                        break;
                    }
                }
                None => {
                    if !cursor.is_empty() {
                        log::debug!("queue: discarding corrupt persistence tail ({} bytes)", cursor.len());
                    }
                    break;
                }
            }
        }
        out
    }

    fn decode_record(input: &[u8]) -> Option<(QueuedMessage, &[u8])> {
        let (id, input) = take_u64(input)?;
        let (&prio, input) = input.split_first()?;
        let priority = Priority::from_u8(prio)?;
        let (enqueued_at_ms, input) = take_u64(input)?;
        let (attempts, input) = take_u32(input)?;
        let (dest_len, input) = take_u32(input)?;
        let (dest, input) = take_bytes(input, dest_len as usize)?;
        let destination = String::from_utf8(dest.to_vec()).ok()?;
        let (payload_len, input) = take_u32(input)?;
        let (payload, input) = take_bytes(input, payload_len as usize)?;
        Some((
            QueuedMessage {
                id,
                priority,
                enqueued_at_ms,
                attempts,
                payload: payload.to_vec(),
                destination,
            },
            input,
        ))
    }

    fn take_u64(input: &[u8]) -> Option<(u64, &[u8])> {
        if input.len() < 8 {
            return None;
        }
        let (bytes, rest) = input.split_at(8);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some((u64::from_le_bytes(buf), rest))
    }

    fn take_u32(input: &[u8]) -> Option<(u32, &[u8])> {
        if input.len() < 4 {
            return None;
        }
        let (bytes, rest) = input.split_at(4);
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Some((u32::from_le_bytes(buf), rest))
    }

    fn take_bytes(input: &[u8], len: usize) -> Option<(&[u8], &[u8])> {
        if input.len() < len {
            return None;
        }
        Some(input.split_at(len))
    }
}
