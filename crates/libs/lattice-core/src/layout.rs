//! Local topology: the tree this node advertises and the change detector
//! behind the changed-connections callback.
//!
//! The layout holds node ids only. Link objects stay in the registry; the
//! tree is recomputed from the registry's advertised subtrees on demand.

use lattice_proto::{NodeId, NodeTree};

use crate::registry::{ConnectionId, ConnectionRegistry};

#[derive(Default)]
pub struct Layout {
    root: bool,
    contains_root: bool,
    last_tree: NodeTree,
}

impl Layout {
    pub fn new(local_id: NodeId) -> Self {
        Self { root: false, contains_root: false, last_tree: NodeTree::leaf(local_id) }
    }

    /// Claim (or drop) the root flag for this node. Idempotent.
    pub fn set_root(&mut self, root: bool) -> bool {
        let changed = self.root != root;
        self.root = root;
        changed
    }

    /// Mark that the root lives somewhere behind this node. Idempotent.
    pub fn set_contains_root(&mut self, contains_root: bool) -> bool {
        let changed = self.contains_root != contains_root;
        self.contains_root = contains_root;
        changed
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Whether any node in the known mesh claims or contains the root.
    pub fn is_rooted(&self) -> bool {
        self.last_tree.is_rooted()
    }

    /// The tree advertised toward one neighbor: everything this node can
    /// reach except the neighbor's own branch, so the view is never
    /// reflected back to its source.
    pub fn tree_for(
        &self,
        local_id: NodeId,
        registry: &ConnectionRegistry,
        toward: Option<ConnectionId>,
    ) -> NodeTree {
        NodeTree {
            node_id: local_id,
            root: self.root,
            contains_root: self.contains_root,
            subs: registry
                .iter()
                .filter(|c| c.is_handshaked() && Some(c.id()) != toward)
                .map(|c| c.subtree().clone())
                .collect(),
        }
    }

    /// Recompute the full local tree; returns whether it differs from the
    /// previous computation (the changed-connections condition).
    pub fn refresh(&mut self, local_id: NodeId, registry: &ConnectionRegistry) -> bool {
        let tree = self.tree_for(local_id, registry, None);
        let changed = tree != self.last_tree;
        if changed {
            log::debug!(
                "layout: tree changed, {} nodes reachable",
                tree.size().saturating_sub(1)
            );
            self.last_tree = tree;
        }
        changed
    }

    /// The most recently computed full tree.
    pub fn tree(&self) -> &NodeTree {
        &self.last_tree
    }

    /// Every known node id, excluding this node.
    pub fn node_list(&self) -> Vec<NodeId> {
        let mut ids = self.last_tree.node_ids();
        ids.retain(|&id| id != self.last_tree.node_id);
        ids
    }

    /// Number of nodes reachable through this node's links.
    pub fn sub_connection_count(&self) -> u32 {
        self.last_tree.size().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_sink::RecordingSink;

    const LOCAL: NodeId = 1;

    fn registry_with_two_branches() -> (ConnectionRegistry, ConnectionId, ConnectionId) {
        let mut registry = ConnectionRegistry::new();
        let a = registry.insert(Box::new(RecordingSink::new()), false, 0);
        let b = registry.insert(Box::new(RecordingSink::new()), false, 0);
        registry.advertise(a, LOCAL, 2, NodeTree::leaf(2)).expect("advertise");
        let mut tree3 = NodeTree::leaf(3);
        tree3.subs.push(NodeTree::leaf(4));
        registry.advertise(b, LOCAL, 3, tree3).expect("advertise");
        (registry, a, b)
    }

    #[test]
    fn tree_for_excludes_the_target_branch() {
        let (registry, a, _b) = registry_with_two_branches();
        let layout = Layout::new(LOCAL);

        let toward_2 = layout.tree_for(LOCAL, &registry, Some(a));
        assert!(!toward_2.contains(2));
        assert!(toward_2.contains(3));
        assert!(toward_2.contains(4));

        let full = layout.tree_for(LOCAL, &registry, None);
        assert_eq!(full.size(), 4);
        assert!(!full.subs.iter().any(|s| s.contains(LOCAL)));
    }

    #[test]
    fn refresh_detects_changes_once() {
        let (registry, _a, _b) = registry_with_two_branches();
        let mut layout = Layout::new(LOCAL);

        assert!(layout.refresh(LOCAL, &registry));
        assert!(!layout.refresh(LOCAL, &registry));
        assert_eq!(layout.sub_connection_count(), 3);
        let mut nodes = layout.node_list();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![2, 3, 4]);
    }

    #[test]
    fn refresh_detects_subtree_growth_with_same_peers() {
        let (mut registry, a, _b) = registry_with_two_branches();
        let mut layout = Layout::new(LOCAL);
        layout.refresh(LOCAL, &registry);

        let mut grown = NodeTree::leaf(2);
        grown.subs.push(NodeTree::leaf(5));
        registry.advertise(a, LOCAL, 2, grown).expect("advertise");
        assert!(layout.refresh(LOCAL, &registry));
        assert_eq!(layout.sub_connection_count(), 4);
    }

    #[test]
    fn root_flags_are_idempotent() {
        let mut layout = Layout::new(LOCAL);
        assert!(layout.set_root(true));
        assert!(!layout.set_root(true));
        assert!(layout.set_contains_root(true));
        assert!(!layout.set_contains_root(true));
    }

    #[test]
    fn rooted_via_peer_claim() {
        let (mut registry, a, _b) = registry_with_two_branches();
        let mut layout = Layout::new(LOCAL);
        layout.refresh(LOCAL, &registry);
        assert!(!layout.is_rooted());

        let rooted = NodeTree { node_id: 2, root: true, ..NodeTree::default() };
        registry.advertise(a, LOCAL, 2, rooted).expect("advertise");
        layout.refresh(LOCAL, &registry);
        assert!(layout.is_rooted());
    }
}
