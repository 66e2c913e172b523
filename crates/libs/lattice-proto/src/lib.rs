//! # lattice-proto
//!
//! Wire protocol envelope and typed packet bodies for the Lattice mesh.
//!
//! Every packet on the wire is one JSON document with a fixed envelope
//! (`type`, `from`, `dest`, `routing`, plus a `message_type` mirror kept for
//! older peers) and a type-specific body flattened into the same object.
//! This crate owns the envelope, the packet-type space, and the serde types
//! for every protocol body; it knows nothing about sockets or routing
//! decisions.
//!
//! ## Packet-type space
//!
//! - `1–99`: internal protocol (time sync, node sync, user payload carriers)
//! - `100–599`: user/extension packages
//! - `610–619`: bridge subsystem

pub mod packages;
pub mod variant;

pub use packages::{
    BridgeCandidate, BridgeCoordination, BridgeElection, BridgeRole, BridgeStatus, BridgeTakeover,
    BroadcastPayload, NodeTree, NtpTimeSync, SinglePayload, TimeDelay, TimeSync,
};
pub use variant::{Routing, Variant, WireError};

/// Node identifier, derived from a stable hardware address.
pub type NodeId = u32;

/// Reserved "none/unspecified" node id.
pub const NODE_NONE: NodeId = 0;

/// Known protocol packet types.
///
/// User/extension packages live in `100..=599` and are dispatched through
/// the package table by raw value; they have no entry here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PackageType {
    TimeDelay = 3,
    TimeSync = 4,
    NodeSyncRequest = 5,
    NodeSyncReply = 6,
    Broadcast = 8,
    Single = 9,
    BridgeStatus = 610,
    BridgeElection = 611,
    BridgeTakeover = 612,
    BridgeCoordination = 613,
    NtpTimeSync = 614,
}

impl PackageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            3 => Some(Self::TimeDelay),
            4 => Some(Self::TimeSync),
            5 => Some(Self::NodeSyncRequest),
            6 => Some(Self::NodeSyncReply),
            8 => Some(Self::Broadcast),
            9 => Some(Self::Single),
            610 => Some(Self::BridgeStatus),
            611 => Some(Self::BridgeElection),
            612 => Some(Self::BridgeTakeover),
            613 => Some(Self::BridgeCoordination),
            614 => Some(Self::NtpTimeSync),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// First packet type reserved for user/extension packages.
pub const USER_TYPE_MIN: u16 = 100;
/// Last packet type reserved for user/extension packages.
pub const USER_TYPE_MAX: u16 = 599;
