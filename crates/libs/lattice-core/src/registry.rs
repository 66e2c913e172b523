//! Connection registry: single owner of every active link.
//!
//! Other subsystems refer to links by [`ConnectionId`] or peer [`NodeId`]
//! only; the link object itself, including its transport sink, never leaves
//! this module.

use std::collections::BTreeMap;
use std::fmt;

use lattice_proto::{NodeId, NodeTree, NODE_NONE};

use crate::error::TransportError;

/// Why an advertisement was rejected. Either way the offending link gets
/// dropped; the variants pick the drop reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseError {
    /// The advertised subtree contains the local node.
    Loop,
    /// An older link already owns this peer id.
    DuplicatePeer,
}

/// Stable identifier for one link, unique for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Outbound half of a link, provided by the transport layer.
///
/// `send_frame` queues best-effort and must not block; `close` tears the
/// transport down and must be idempotent.
pub trait LinkSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;
    fn close(&mut self);
}

/// Why a link was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    LoopDetected,
    DuplicatePeer,
    Timeout,
    TransportClosed,
    DecodeError,
    Requested,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LoopDetected => "loop detected",
            Self::DuplicatePeer => "duplicate peer",
            Self::Timeout => "timeout",
            Self::TransportClosed => "transport closed",
            Self::DecodeError => "undecodable frame",
            Self::Requested => "requested",
        };
        f.write_str(s)
    }
}

/// Read-only per-link counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub last_heard_ms: u64,
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub stability: u32,
}

const STABILITY_START: u32 = 500;
const STABILITY_MAX: u32 = 1000;

pub struct Connection {
    id: ConnectionId,
    peer: NodeId,
    subtree: NodeTree,
    station: bool,
    last_heard_ms: u64,
    tx_frames: u64,
    rx_frames: u64,
    stability: u32,
    sink: Box<dyn LinkSink>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer node id; [`NODE_NONE`] until the first node-sync arrives.
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn subtree(&self) -> &NodeTree {
        &self.subtree
    }

    pub fn is_station(&self) -> bool {
        self.station
    }

    pub fn is_handshaked(&self) -> bool {
        self.peer != NODE_NONE
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            last_heard_ms: self.last_heard_ms,
            tx_frames: self.tx_frames,
            rx_frames: self.rx_frames,
            stability: self.stability,
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    links: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh link. The peer id stays unknown until the first
    /// node-sync handshake.
    pub fn insert(&mut self, sink: Box<dyn LinkSink>, station: bool, now_ms: u64) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.links.insert(
            id,
            Connection {
                id,
                peer: NODE_NONE,
                subtree: NodeTree::default(),
                station,
                last_heard_ms: now_ms,
                tx_frames: 0,
                rx_frames: 0,
                stability: STABILITY_START,
                sink,
            },
        );
        log::debug!("registry: {} added (station={})", id, station);
        id
    }

    /// Close the transport and remove the link. Returns `(peer, station)`
    /// for the dropped-connection callback.
    pub fn remove(&mut self, id: ConnectionId, reason: DropReason) -> Option<(NodeId, bool)> {
        let mut conn = self.links.remove(&id)?;
        conn.sink.close();
        log::debug!("registry: {} dropped, peer={}, reason: {}", id, conn.peer, reason);
        Some((conn.peer, conn.station))
    }

    /// Record a peer's advertised identity and subtree.
    ///
    /// Rejects a subtree containing the local node (a cycle) and a peer id
    /// already owned by an older link; in both cases the caller is expected
    /// to drop the offending link. Returns whether the advertisement
    /// changed anything.
    pub fn advertise(
        &mut self,
        id: ConnectionId,
        local_id: NodeId,
        peer: NodeId,
        subtree: NodeTree,
    ) -> Result<bool, AdvertiseError> {
        if subtree.contains(local_id) {
            return Err(AdvertiseError::Loop);
        }
        if self.links.values().any(|c| c.id != id && c.peer == peer) {
            return Err(AdvertiseError::DuplicatePeer);
        }
        let Some(conn) = self.links.get_mut(&id) else {
            return Ok(false);
        };
        let changed = conn.peer != peer || conn.subtree != subtree;
        conn.peer = peer;
        conn.subtree = subtree;
        Ok(changed)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.links.get(&id)
    }

    pub fn peer_of(&self, id: ConnectionId) -> Option<NodeId> {
        self.links.get(&id).map(|c| c.peer).filter(|&p| p != NODE_NONE)
    }

    pub fn find_by_peer(&self, peer: NodeId) -> Option<ConnectionId> {
        self.links.values().find(|c| c.peer == peer).map(|c| c.id)
    }

    /// Send one frame on one link.
    pub fn send_to(&mut self, id: ConnectionId, frame: &[u8]) -> Result<(), TransportError> {
        let conn = self.links.get_mut(&id).ok_or(TransportError::Closed)?;
        conn.sink.send_frame(frame)?;
        conn.tx_frames += 1;
        Ok(())
    }

    /// Send one frame on every handshaked link except `except`. Returns the
    /// number of links written.
    pub fn broadcast_frame(&mut self, frame: &[u8], except: Option<ConnectionId>) -> usize {
        let mut sent = 0;
        let mut failed = Vec::new();
        for conn in self.links.values_mut() {
            if !conn.is_handshaked() || Some(conn.id) == except {
                continue;
            }
            match conn.sink.send_frame(frame) {
                Ok(()) => {
                    conn.tx_frames += 1;
                    sent += 1;
                }
                Err(err) => {
                    log::debug!("registry: send on {} failed: {}", conn.id, err);
                    failed.push(conn.id);
                }
            }
        }
        for id in failed {
            self.remove(id, DropReason::TransportClosed);
        }
        sent
    }

    /// Record inbound traffic on a link.
    pub fn touch(&mut self, id: ConnectionId, now_ms: u64) {
        if let Some(conn) = self.links.get_mut(&id) {
            conn.last_heard_ms = now_ms;
            conn.rx_frames += 1;
        }
    }

    /// Nudge the stability score; positive on completed sync round-trips,
    /// negative on timeouts.
    pub fn adjust_stability(&mut self, id: ConnectionId, delta: i32) {
        if let Some(conn) = self.links.get_mut(&id) {
            conn.stability = conn.stability.saturating_add_signed(delta).min(STABILITY_MAX);
        }
    }

    /// Links silent for longer than `timeout_ms`.
    pub fn stale(&self, now_ms: u64, timeout_ms: u64) -> Vec<ConnectionId> {
        self.links
            .values()
            .filter(|c| now_ms.saturating_sub(c.last_heard_ms) > timeout_ms)
            .map(|c| c.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.links.values()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.links.keys().copied().collect()
    }

    /// Peer ids of every handshaked link.
    pub fn peers(&self) -> Vec<NodeId> {
        self.links.values().filter(|c| c.is_handshaked()).map(|c| c.peer).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Size of the local subnet as seen from `from`'s side of the mesh:
    /// this node plus every subtree except the one advertised by `from`.
    pub fn subnet_size_excluding(&self, from: Option<ConnectionId>) -> u32 {
        1 + self
            .links
            .values()
            .filter(|c| c.is_handshaked() && Some(c.id) != from)
            .map(|c| c.subtree().size())
            .sum::<u32>()
    }
}

#[cfg(test)]
pub(crate) mod test_sink {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Sink that records every frame, shared with the test body.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub frames: Rc<RefCell<Vec<Vec<u8>>>>,
        pub closed: Rc<RefCell<bool>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl LinkSink for RecordingSink {
        fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            if *self.closed.borrow() {
                return Err(TransportError::Closed);
            }
            self.frames.borrow_mut().push(frame.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.borrow_mut() = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_sink::RecordingSink;
    use super::*;

    const LOCAL: NodeId = 1;

    fn registry_with_peer(peer: NodeId) -> (ConnectionRegistry, ConnectionId, RecordingSink) {
        let mut registry = ConnectionRegistry::new();
        let sink = RecordingSink::new();
        let id = registry.insert(Box::new(sink.clone()), false, 0);
        registry.advertise(id, LOCAL, peer, NodeTree::leaf(peer)).expect("advertise");
        (registry, id, sink)
    }

    #[test]
    fn advertise_assigns_peer_and_reports_change() {
        let (mut registry, id, _sink) = registry_with_peer(2);
        assert_eq!(registry.peer_of(id), Some(2));
        // identical advertisement is a no-op
        let changed = registry.advertise(id, LOCAL, 2, NodeTree::leaf(2)).expect("advertise");
        assert!(!changed);
        // grown subtree is a change
        let mut tree = NodeTree::leaf(2);
        tree.subs.push(NodeTree::leaf(3));
        assert!(registry.advertise(id, LOCAL, 2, tree).expect("advertise"));
    }

    #[test]
    fn subtree_containing_local_node_is_a_loop() {
        let mut registry = ConnectionRegistry::new();
        let id = registry.insert(Box::new(RecordingSink::new()), false, 0);
        let mut tree = NodeTree::leaf(2);
        tree.subs.push(NodeTree::leaf(LOCAL));
        assert_eq!(registry.advertise(id, LOCAL, 2, tree), Err(AdvertiseError::Loop));
    }

    #[test]
    fn duplicate_peer_keeps_older_link() {
        let (mut registry, older, _sink) = registry_with_peer(2);
        let newer = registry.insert(Box::new(RecordingSink::new()), false, 0);
        assert_eq!(
            registry.advertise(newer, LOCAL, 2, NodeTree::leaf(2)),
            Err(AdvertiseError::DuplicatePeer)
        );
        assert_eq!(registry.find_by_peer(2), Some(older));
    }

    #[test]
    fn broadcast_skips_pending_and_excluded_links() {
        let (mut registry, handshaked, sink) = registry_with_peer(2);
        let pending_sink = RecordingSink::new();
        registry.insert(Box::new(pending_sink.clone()), false, 0);

        let sent = registry.broadcast_frame(b"x", None);
        assert_eq!(sent, 1);
        assert_eq!(sink.frames.borrow().len(), 1);
        assert!(pending_sink.frames.borrow().is_empty());

        let sent = registry.broadcast_frame(b"y", Some(handshaked));
        assert_eq!(sent, 0);
    }

    #[test]
    fn broadcast_drops_links_whose_sink_fails() {
        let (mut registry, id, sink) = registry_with_peer(2);
        *sink.closed.borrow_mut() = true;
        let sent = registry.broadcast_frame(b"x", None);
        assert_eq!(sent, 0);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn remove_closes_sink_and_reports_peer() {
        let (mut registry, id, sink) = registry_with_peer(2);
        let dropped = registry.remove(id, DropReason::Requested);
        assert_eq!(dropped, Some((2, false)));
        assert!(*sink.closed.borrow());
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_links_are_reported_after_timeout() {
        let (mut registry, id, _sink) = registry_with_peer(2);
        registry.touch(id, 1_000);
        assert!(registry.stale(10_000, 30_000).is_empty());
        assert_eq!(registry.stale(31_001, 30_000), vec![id]);
    }

    #[test]
    fn subnet_size_excludes_the_asking_link() {
        let (mut registry, to_peer2, _sink) = registry_with_peer(2);
        let sink3 = RecordingSink::new();
        let to_peer3 = registry.insert(Box::new(sink3), false, 0);
        let mut tree3 = NodeTree::leaf(3);
        tree3.subs.push(NodeTree::leaf(4));
        registry.advertise(to_peer3, LOCAL, 3, tree3).expect("advertise");

        // whole mesh from nowhere: self + {2} + {3,4}
        assert_eq!(registry.subnet_size_excluding(None), 4);
        // as seen from peer 2: self + {3,4}
        assert_eq!(registry.subnet_size_excluding(Some(to_peer2)), 3);
        // as seen from peer 3: self + {2}
        assert_eq!(registry.subnet_size_excluding(Some(to_peer3)), 2);
    }
}
