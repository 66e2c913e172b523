//! Application callback registry.
//!
//! Callbacks receive plain values, never engine references; anything a
//! callback wants to do to the mesh happens on the application's next turn
//! of the event loop. Callbacks must not panic — the engine has no way to
//! recover a callback's state.

use lattice_proto::NodeId;

use crate::queue::QueueState;

pub type ReceiveCallback = Box<dyn FnMut(NodeId, &str)>;
pub type NewConnectionCallback = Box<dyn FnMut(NodeId)>;
pub type DroppedConnectionCallback = Box<dyn FnMut(NodeId, bool)>;
pub type ChangedConnectionsCallback = Box<dyn FnMut()>;
pub type TimeAdjustedCallback = Box<dyn FnMut(i64)>;
pub type NodeDelayCallback = Box<dyn FnMut(NodeId, i64)>;
pub type BridgeStatusChangedCallback = Box<dyn FnMut(NodeId, bool)>;
pub type BridgeRoleChangedCallback = Box<dyn FnMut(bool, &str)>;
pub type QueueStateChangedCallback = Box<dyn FnMut(QueueState, usize)>;

#[derive(Default)]
pub struct Callbacks {
    pub(crate) on_receive: Option<ReceiveCallback>,
    pub(crate) on_new_connection: Option<NewConnectionCallback>,
    pub(crate) on_dropped_connection: Option<DroppedConnectionCallback>,
    pub(crate) on_changed_connections: Option<ChangedConnectionsCallback>,
    pub(crate) on_node_time_adjusted: Option<TimeAdjustedCallback>,
    pub(crate) on_node_delay_received: Option<NodeDelayCallback>,
    pub(crate) on_bridge_status_changed: Option<BridgeStatusChangedCallback>,
    pub(crate) on_bridge_role_changed: Option<BridgeRoleChangedCallback>,
    pub(crate) on_queue_state_changed: Option<QueueStateChangedCallback>,
}
