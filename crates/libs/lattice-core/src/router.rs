//! Routing decisions and the package-type handler table.
//!
//! The router is pure: it looks at an envelope and the registry and says
//! what to do. Executing the decision (handler dispatch, serialization,
//! writes) is the mesh facade's job.

use std::collections::HashMap;

use lattice_proto::{NodeId, PackageType, Routing, Variant, USER_TYPE_MAX, USER_TYPE_MIN};

use crate::error::{ConfigError, RouteError};
use crate::registry::{ConnectionId, ConnectionRegistry};

/// What to do with an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Invoke handlers; do not forward.
    DeliverLocal,
    /// Pass through untouched toward the destination.
    Forward(ConnectionId),
    /// Invoke handlers and forward on every link except the arrival link.
    DeliverAndFlood,
    /// Discard; debug log only.
    Drop(RouteError),
}

/// Decide consume/forward for a packet arriving on `arrival` (or
/// originated locally when `arrival` is `None`).
pub fn decide(
    variant: &Variant,
    arrival: Option<ConnectionId>,
    local_id: NodeId,
    registry: &ConnectionRegistry,
) -> RouteAction {
    if arrival.is_some() && variant.from == local_id {
        return RouteAction::Drop(RouteError::SelfEcho);
    }
    match variant.routing {
        Routing::Neighbour => RouteAction::DeliverLocal,
        Routing::Single => {
            if variant.dest == local_id {
                RouteAction::DeliverLocal
            } else {
                match next_hop(registry, variant.dest) {
                    Some(link) => RouteAction::Forward(link),
                    None => RouteAction::Drop(RouteError::NoRoute),
                }
            }
        }
        Routing::Broadcast => RouteAction::DeliverAndFlood,
    }
}

/// The unique neighbor whose subtree contains `dest`. When two neighbor
/// subtrees claim the destination (transient, mid-convergence), the link
/// with the smaller peer id wins so the choice is deterministic.
pub fn next_hop(registry: &ConnectionRegistry, dest: NodeId) -> Option<ConnectionId> {
    registry
        .iter()
        .filter(|c| c.is_handshaked() && (c.peer() == dest || c.subtree().contains(dest)))
        .min_by_key(|c| c.peer())
        .map(|c| c.id())
}

/// Handler invoked when a packet of a registered type is delivered locally.
/// Returns the consume flag.
pub type PackageHandler = Box<dyn FnMut(&Variant, ConnectionId, NodeId) -> bool>;

struct Registration {
    propagates: bool,
    handler: PackageHandler,
}

/// User/extension package dispatch, keyed by packet type.
#[derive(Default)]
pub struct PackageTable {
    handlers: HashMap<u16, Registration>,
    catch_all: Option<PackageHandler>,
}

impl PackageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a user/extension type (100–599). `propagates`
    /// controls whether a consumed BROADCAST of this type still floods.
    pub fn register(
        &mut self,
        package_type: u16,
        propagates: bool,
        handler: PackageHandler,
    ) -> Result<(), ConfigError> {
        if !(USER_TYPE_MIN..=USER_TYPE_MAX).contains(&package_type) {
            return Err(ConfigError::InvalidValue("package_type"));
        }
        self.handlers.insert(package_type, Registration { propagates, handler });
        Ok(())
    }

    /// Handler for any type nothing else claims.
    pub fn register_catch_all(&mut self, handler: PackageHandler) {
        self.catch_all = Some(handler);
    }

    pub fn has_handler(&self, package_type: u16) -> bool {
        self.handlers.contains_key(&package_type) || self.catch_all.is_some()
    }

    /// Invoke the handler; `None` when no handler exists for the type.
    pub fn dispatch(
        &mut self,
        variant: &Variant,
        source: ConnectionId,
        origin: NodeId,
    ) -> Option<bool> {
        if let Some(reg) = self.handlers.get_mut(&variant.package_type) {
            return Some((reg.handler)(variant, source, origin));
        }
        self.catch_all.as_mut().map(|cb| cb(variant, source, origin))
    }

    /// Whether a consumed BROADCAST of this type keeps flooding.
    pub fn propagates(&self, package_type: u16) -> bool {
        if let Some(internal) = PackageType::from_u16(package_type) {
            return internal_propagates(internal);
        }
        self.handlers.get(&package_type).map(|r| r.propagates).unwrap_or(true)
    }
}

/// Internal types that are unicast- or neighbour-only never keep flooding
/// once consumed.
fn internal_propagates(package_type: PackageType) -> bool {
    !matches!(
        package_type,
        PackageType::TimeDelay
            | PackageType::TimeSync
            | PackageType::NodeSyncRequest
            | PackageType::NodeSyncReply
    )
}
