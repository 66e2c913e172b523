//! # lattice-net
//!
//! TCP transport for the Lattice mesh engine.
//!
//! The engine in `lattice-core` is sans-I/O; this crate owns the sockets.
//! A [`TcpTransport`] accepts and dials peers, frames the byte streams, and
//! surfaces [`TransportEvent`]s the host feeds into the engine:
//!
//! ```no_run
//! use lattice_core::{Mesh, MeshConfig, SystemPlatform};
//! use lattice_net::{TcpTransport, TransportEvent};
//! use std::collections::HashMap;
//!
//! # async fn run() -> std::io::Result<()> {
//! let mut mesh = Mesh::new(0xA11CE, MeshConfig::default(), SystemPlatform::new());
//! let mut transport = TcpTransport::new();
//! transport.listen("0.0.0.0:5555".parse().expect("addr")).await?;
//!
//! let mut links = HashMap::new();
//! loop {
//!     while let Some(event) = transport.try_next_event() {
//!         match event {
//!             TransportEvent::Opened { link, station, sink } => {
//!                 links.insert(link, mesh.add_connection(Box::new(sink), station));
//!             }
//!             TransportEvent::Frame { link, bytes } => {
//!                 if let Some(&conn) = links.get(&link) {
//!                     let _ = mesh.handle_frame(conn, &bytes);
//!                 }
//!             }
//!             TransportEvent::Closed { link } => {
//!                 if let Some(conn) = links.remove(&link) {
//!                     mesh.connection_closed(conn);
//!                 }
//!             }
//!         }
//!     }
//!     mesh.update();
//!     tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//! }
//! # }
//! ```

pub mod framing;
pub mod tcp;

pub use framing::{encode_frame, FrameBuffer, FrameError, DEFAULT_MAX_FRAME};
pub use tcp::{LinkId, TcpLinkSink, TcpTransport, TransportEvent};
