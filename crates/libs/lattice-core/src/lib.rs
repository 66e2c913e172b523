//! # lattice-core
//!
//! The Lattice mesh protocol and coordination engine: connection registry,
//! typed packet routing, subtree topology, pairwise time sync, bridge
//! failover and multi-bridge coordination, and a priority message queue.
//!
//! The engine is sans-I/O and single-threaded. It never opens a socket or
//! reads a clock; transports hand it frames through [`Mesh::handle_frame`]
//! and outbound bytes leave through [`registry::LinkSink`] objects the
//! transport provides. All periodic work runs from [`Mesh::update`], which
//! the host calls once per event-loop turn.
//!
//! ```no_run
//! use lattice_core::{Mesh, MeshConfig, SystemPlatform};
//!
//! let mut mesh = Mesh::new(0xA11CE, MeshConfig::default(), SystemPlatform::new());
//! mesh.on_receive(Box::new(|from, msg| {
//!     println!("{from}: {msg}");
//! }));
//! loop {
//!     // feed transport frames ...
//!     mesh.update();
//! }
//! ```

pub mod bridge;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod layout;
pub mod mesh;
pub mod platform;
pub mod queue;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod timesync;

pub use bridge::{BridgeInfo, ElectionState, SelectionStrategy};
pub use config::{DebugMask, DebugScope, MeshConfig};
pub use error::{
    ConfigError, ElectionError, ProtocolError, QueueError, RouteError, TransportError,
};
pub use mesh::Mesh;
pub use platform::{Platform, SystemPlatform};
pub use queue::{Priority, QueueState, QueueStats, QueuedMessage};
pub use registry::{ConnectionId, ConnectionStats, DropReason, LinkSink};
pub use router::PackageHandler;
pub use scheduler::{Iterations, Scheduler, TaskHandle};
pub use timesync::TimeState;
