//! The mesh facade: one owned value wiring every subsystem together.
//!
//! The engine is single-threaded and event-driven. The host alternates
//! feeding inbound frames (`handle_frame`) and ticking the engine
//! (`update`); nothing here blocks, and the only outbound side effect is
//! `LinkSink::send_frame`.

use lattice_proto::{
    BridgeCandidate, BridgeElection, BridgeStatus, BridgeTakeover, BroadcastPayload, NodeId,
    NodeTree, NtpTimeSync, PackageType, Routing, SinglePayload, TimeDelay, TimeSync as TimeSyncPkg,
    Variant, WireError, NODE_NONE,
};
use serde::Serialize;

use crate::bridge::{pick_winner, BridgeManager, ElectionState, SelectionStrategy};
use crate::callbacks::{
    BridgeRoleChangedCallback, BridgeStatusChangedCallback, Callbacks, ChangedConnectionsCallback,
    DroppedConnectionCallback, NewConnectionCallback, NodeDelayCallback, QueueStateChangedCallback,
    ReceiveCallback, TimeAdjustedCallback,
};
use crate::config::{DebugMask, DebugScope, MeshConfig};
use crate::error::{
    ConfigError, ElectionError, ProtocolError, QueueError, RouteError, TransportError,
};
use crate::layout::Layout;
use crate::platform::Platform;
use crate::queue::{MessageQueue, Priority, QueueStats, QueuedMessage};
use crate::registry::{
    AdvertiseError, ConnectionId, ConnectionRegistry, ConnectionStats, DropReason, LinkSink,
};
use crate::router::{self, PackageHandler, PackageTable, RouteAction};
use crate::scheduler::{Iterations, Scheduler, TaskHandle};
use crate::timesync::{TimeKeeper, TimeState};

/// Minimum pause between election attempts from the aging trigger.
const ELECTION_RETRY_PAUSE_MS: u64 = 10_000;

type QueueSender = Box<dyn FnMut(&QueuedMessage) -> bool>;

pub struct Mesh<P: Platform> {
    node_id: NodeId,
    config: MeshConfig,
    platform: P,
    registry: ConnectionRegistry,
    layout: Layout,
    packages: PackageTable,
    time: TimeKeeper,
    bridge: BridgeManager,
    queue: MessageQueue,
    scheduler: Scheduler<Mesh<P>>,
    callbacks: Callbacks,
    queue_sender: Option<QueueSender>,
    last_primary: Option<NodeId>,
    had_internet: bool,
    last_election_attempt_ms: u64,
    last_sync_peer: Option<ConnectionId>,
    status_task: Option<TaskHandle>,
    coordination_task: Option<TaskHandle>,
    ntp_task: Option<TaskHandle>,
}

impl<P: Platform> Mesh<P> {
    pub fn new(node_id: NodeId, config: MeshConfig, platform: P) -> Self {
        let now = platform.now_millis();
        let mut queue = MessageQueue::new(config.queue_capacity, config.queue_max_attempts);
        queue.set_enabled(config.enable_message_queue);
        let bridge = BridgeManager::new(config.selection_strategy, config.max_bridges);

        let mut scheduler: Scheduler<Mesh<P>> = Scheduler::new();
        scheduler.add_task(
            now,
            config.time_sync_interval_ms,
            Iterations::Forever,
            Box::new(|mesh| mesh.time_sync_tick()),
        );
        scheduler.add_task(
            now,
            config.node_sync_interval_ms,
            Iterations::Forever,
            Box::new(|mesh| mesh.send_node_sync_requests(None)),
        );

        if config.debug.allows(DebugScope::Startup) {
            log::info!("mesh: node {} starting on port {}", node_id, config.port);
        }

        Self {
            node_id,
            config,
            platform,
            registry: ConnectionRegistry::new(),
            layout: Layout::new(node_id),
            packages: PackageTable::new(),
            time: TimeKeeper::new(),
            bridge,
            queue,
            scheduler,
            callbacks: Callbacks::default(),
            queue_sender: None,
            last_primary: None,
            had_internet: false,
            last_election_attempt_ms: 0,
            last_sync_peer: None,
            status_task: None,
            coordination_task: None,
            ntp_task: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    // ---- event loop -----------------------------------------------------

    /// Run due scheduler tasks and housekeeping. Call once per event-loop
    /// turn.
    pub fn update(&mut self) {
        let now = self.platform.now_millis();
        for handle in self.scheduler.due(now) {
            if let Some(mut callback) = self.scheduler.begin(handle) {
                callback(self);
                self.scheduler.finish(handle, callback, now);
            }
        }
        self.housekeeping(now);
    }

    fn housekeeping(&mut self, now: u64) {
        for id in self.registry.stale(now, self.config.connection_timeout_ms) {
            self.drop_connection(id, DropReason::Timeout);
        }

        if let Some(conn) = self.time.poll_timeout(now) {
            self.registry.adjust_stability(conn, -50);
        }

        if let Some(candidates) = self.bridge.election.poll_deadline(now) {
            self.finish_election(&candidates, now);
        }

        // deferred from promotion: broadcast tasks go on the scheduler only
        // once the promotion path has fully unwound
        if self.bridge.take_tasks_pending() {
            self.register_bridge_tasks(now);
        }

        self.check_failover_trigger(now);

        let has_internet = self.bridge.has_internet(now);
        if has_internet && !self.had_internet && self.queue.is_enabled() && !self.queue.is_empty() {
            if self.config.debug.allows(DebugScope::General) {
                log::debug!("mesh: uplink restored, flushing {} queued messages", self.queue.len());
            }
            self.flush_queue();
        }
        self.had_internet = has_internet;

        self.bridge.table.prune(now);
        self.emit_queue_state();
    }

    // ---- link lifecycle -------------------------------------------------

    /// Register a freshly opened transport link and start the node-sync
    /// handshake on it.
    pub fn add_connection(&mut self, sink: Box<dyn LinkSink>, station: bool) -> ConnectionId {
        let now = self.platform.now_millis();
        let id = self.registry.insert(sink, station, now);
        if self.config.debug.allows(DebugScope::Connection) {
            log::debug!("mesh: {} opened, requesting node sync", id);
        }
        self.send_node_sync(id, true);
        id
    }

    /// Tear a link down and tell the application.
    pub fn drop_connection(&mut self, id: ConnectionId, reason: DropReason) {
        let Some((peer, station)) = self.registry.remove(id, reason) else {
            return;
        };
        if peer != NODE_NONE {
            if let Some(cb) = self.callbacks.on_dropped_connection.as_mut() {
                cb(peer, station);
            }
            self.after_topology_change(None);
        }
    }

    /// Transport-side close notification.
    pub fn connection_closed(&mut self, id: ConnectionId) {
        self.drop_connection(id, DropReason::TransportClosed);
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_stats(&self, peer: NodeId) -> Option<ConnectionStats> {
        let id = self.registry.find_by_peer(peer)?;
        self.registry.get(id).map(|c| c.stats())
    }

    // ---- inbound --------------------------------------------------------

    /// Feed one received frame. A frame that fails envelope decoding closes
    /// the link; per-packet protocol problems only discard the frame.
    pub fn handle_frame(&mut self, conn: ConnectionId, bytes: &[u8]) -> Result<(), TransportError> {
        if self.registry.get(conn).is_none() {
            return Err(TransportError::Closed);
        }
        let now = self.platform.now_millis();
        self.registry.touch(conn, now);

        let variant = match Variant::decode(bytes) {
            Ok(variant) => variant,
            Err(WireError::MissingField(field)) | Err(WireError::BadField(field)) => {
                let err = ProtocolError::BadField(field.to_string());
                log::debug!("mesh: discarding frame on {}: {}", conn, err);
                return Ok(());
            }
            Err(WireError::BadRouting(value)) => {
                let err = ProtocolError::BadField(format!("routing={value}"));
                log::debug!("mesh: discarding frame on {}: {}", conn, err);
                return Ok(());
            }
            Err(err) => {
                log::debug!("mesh: undecodable frame on {}: {}", conn, err);
                self.drop_connection(conn, DropReason::DecodeError);
                return Err(TransportError::Decode);
            }
        };

        if self.config.debug.allows(DebugScope::MsgTypes) {
            log::trace!(
                "mesh: << {} type={} from={} dest={} routing={:?}",
                conn,
                variant.package_type,
                variant.from,
                variant.dest,
                variant.routing
            );
        }

        self.dispatch(conn, variant, bytes, now);
        Ok(())
    }

    fn dispatch(&mut self, conn: ConnectionId, variant: Variant, bytes: &[u8], now: u64) {
        match router::decide(&variant, Some(conn), self.node_id, &self.registry) {
            RouteAction::Drop(err) => {
                if self.config.debug.allows(DebugScope::Communication) {
                    log::debug!("mesh: dropping packet from {}: {}", variant.from, err);
                }
            }
            RouteAction::DeliverLocal => {
                self.deliver_local(conn, &variant, now);
            }
            RouteAction::Forward(next) => {
                if let Err(err) = self.registry.send_to(next, bytes) {
                    log::debug!("mesh: forward to {} failed: {}", next, err);
                    self.drop_connection(next, DropReason::TransportClosed);
                }
            }
            RouteAction::DeliverAndFlood => {
                let consume = self.deliver_local(conn, &variant, now);
                if !(consume && !self.packages.propagates(variant.package_type)) {
                    self.registry.broadcast_frame(bytes, Some(conn));
                }
            }
        }
    }

    /// Invoke the local handler for a delivered packet; returns the consume
    /// flag.
    fn deliver_local(&mut self, conn: ConnectionId, variant: &Variant, now: u64) -> bool {
        match PackageType::from_u16(variant.package_type) {
            Some(PackageType::NodeSyncRequest) => {
                self.handle_node_sync(conn, variant, now, true);
                true
            }
            Some(PackageType::NodeSyncReply) => {
                self.handle_node_sync(conn, variant, now, false);
                true
            }
            Some(PackageType::TimeSync) => {
                self.handle_time_sync(conn, variant, now);
                true
            }
            Some(PackageType::TimeDelay) => {
                self.handle_time_delay(conn, variant, now);
                true
            }
            Some(PackageType::Single) => {
                if let Ok(payload) = self.decode_body::<SinglePayload>(variant) {
                    if let Some(cb) = self.callbacks.on_receive.as_mut() {
                        cb(variant.from, &payload.msg);
                    }
                }
                true
            }
            Some(PackageType::Broadcast) => {
                if let Ok(payload) = self.decode_body::<BroadcastPayload>(variant) {
                    if let Some(cb) = self.callbacks.on_receive.as_mut() {
                        cb(variant.from, &payload.msg);
                    }
                }
                false
            }
            Some(PackageType::BridgeStatus) => {
                self.handle_bridge_status(variant, now);
                false
            }
            Some(PackageType::BridgeElection) => {
                self.handle_bridge_election(variant, now);
                false
            }
            Some(PackageType::BridgeTakeover) => {
                self.handle_bridge_takeover(variant, now);
                false
            }
            Some(PackageType::BridgeCoordination) => {
                if let Ok(pkg) = self.decode_body(variant) {
                    self.bridge.table.update_coordination(variant.from, &pkg, now);
                }
                false
            }
            Some(PackageType::NtpTimeSync) => {
                self.handle_ntp(variant, now);
                false
            }
            None => match self.packages.dispatch(variant, conn, variant.from) {
                Some(consume) => consume,
                None => {
                    let err = ProtocolError::UnknownType(variant.package_type);
                    log::debug!("mesh: {} from {}, frame discarded", err, variant.from);
                    false
                }
            },
        }
    }

    fn decode_body<T: serde::de::DeserializeOwned>(&self, variant: &Variant) -> Result<T, WireError> {
        variant.body().map_err(|err| {
            log::debug!(
                "mesh: bad body for packet type {} from {}: {}",
                variant.package_type,
                variant.from,
                err
            );
            err
        })
    }

    // ---- node sync / topology -------------------------------------------

    fn handle_node_sync(&mut self, conn: ConnectionId, variant: &Variant, now: u64, request: bool) {
        let Ok(tree) = self.decode_body::<NodeTree>(variant) else {
            return;
        };
        let was_handshaked =
            self.registry.get(conn).map(|c| c.is_handshaked()).unwrap_or(false);

        let changed = match self.registry.advertise(conn, self.node_id, variant.from, tree) {
            Ok(changed) => changed,
            Err(AdvertiseError::Loop) => {
                log::warn!("mesh: {} advertises a loop, dropping", conn);
                self.drop_connection(conn, DropReason::LoopDetected);
                return;
            }
            Err(AdvertiseError::DuplicatePeer) => {
                if self.config.debug.allows(DebugScope::Connection) {
                    log::debug!("mesh: {} duplicates peer {}, keeping older link", conn, variant.from);
                }
                self.drop_connection(conn, DropReason::DuplicatePeer);
                return;
            }
        };

        if request {
            self.send_node_sync(conn, false);
        } else {
            self.registry.adjust_stability(conn, 10);
        }

        if !was_handshaked {
            if self.config.debug.allows(DebugScope::Connection) {
                log::debug!("mesh: {} handshaked as node {}", conn, variant.from);
            }
            if let Some(cb) = self.callbacks.on_new_connection.as_mut() {
                cb(variant.from);
            }
            // time sync runs on every new connection
            self.initiate_time_sync(conn, now);
        }

        if changed {
            self.after_topology_change(Some(conn));
        }
    }

    /// Recompute the layout after any link change; on a real change, notify
    /// the application and push fresh subtrees to every other neighbor.
    fn after_topology_change(&mut self, source: Option<ConnectionId>) {
        if !self.layout.refresh(self.node_id, &self.registry) {
            return;
        }
        if let Some(cb) = self.callbacks.on_changed_connections.as_mut() {
            cb();
        }
        self.send_node_sync_requests(source);
    }

    /// Send our subtree (as seen from each neighbor's direction) to every
    /// handshaked neighbor except `except`.
    fn send_node_sync_requests(&mut self, except: Option<ConnectionId>) {
        let targets: Vec<ConnectionId> = self
            .registry
            .iter()
            .filter(|c| c.is_handshaked() && Some(c.id()) != except)
            .map(|c| c.id())
            .collect();
        for id in targets {
            self.send_node_sync(id, true);
        }
    }

    fn send_node_sync(&mut self, conn: ConnectionId, request: bool) {
        let tree = self.layout.tree_for(self.node_id, &self.registry, Some(conn));
        let package_type =
            if request { PackageType::NodeSyncRequest } else { PackageType::NodeSyncReply };
        let dest = self.registry.peer_of(conn).unwrap_or(NODE_NONE);
        self.send_package_on(conn, package_type.as_u16(), dest, Routing::Neighbour, &tree);
    }

    // ---- time sync ------------------------------------------------------

    fn time_sync_tick(&mut self) {
        let now = self.platform.now_millis();
        if self.time.in_flight() {
            return;
        }
        // rotate through handshaked links so a busy mesh disciplines every
        // pairwise offset eventually
        let mut ids: Vec<ConnectionId> = self
            .registry
            .iter()
            .filter(|c| c.is_handshaked())
            .map(|c| c.id())
            .collect();
        ids.sort_unstable();
        let next = match self.last_sync_peer {
            Some(last) => ids.iter().copied().find(|&id| id > last).or(ids.first().copied()),
            None => ids.first().copied(),
        };
        if let Some(conn) = next {
            self.last_sync_peer = Some(conn);
            self.initiate_time_sync(conn, now);
        }
    }

    fn initiate_time_sync(&mut self, conn: ConnectionId, now: u64) {
        let Some(peer) = self.registry.peer_of(conn) else {
            return;
        };
        if let Some(probe) = self.time.begin(conn, peer, now) {
            if self.config.debug.allows(DebugScope::Sync) {
                log::debug!("mesh: time sync probe to {}", peer);
            }
            self.send_package_on(conn, PackageType::TimeSync.as_u16(), peer, Routing::Single, &probe);
        }
    }

    fn handle_time_sync(&mut self, conn: ConnectionId, variant: &Variant, now: u64) {
        let Ok(pkg) = self.decode_body::<TimeSyncPkg>(variant) else {
            return;
        };
        let peer = variant.from;
        let self_subnet = self.registry.subnet_size_excluding(Some(conn));
        let peer_subnet =
            self.registry.get(conn).map(|c| c.subtree().size()).unwrap_or(1).max(1);

        let outcome =
            self.time.handle(conn, peer, &pkg, now, self.node_id, self_subnet, peer_subnet);
        if outcome.completed {
            self.registry.adjust_stability(conn, 10);
        }
        if let Some(delta) = outcome.adjusted {
            if self.config.debug.allows(DebugScope::Sync) {
                log::debug!("mesh: adjusted mesh time by {}µs toward {}", delta, peer);
            }
            if let Some(cb) = self.callbacks.on_node_time_adjusted.as_mut() {
                cb(delta);
            }
        }
        if let Some(reply) = outcome.reply {
            self.send_package_on(conn, PackageType::TimeSync.as_u16(), peer, Routing::Single, &reply);
        }
    }

    fn handle_time_delay(&mut self, conn: ConnectionId, variant: &Variant, now: u64) {
        let Ok(pkg) = self.decode_body::<TimeDelay>(variant) else {
            return;
        };
        match pkg.step {
            0 => {
                let reply =
                    TimeDelay { step: 1, t0: pkg.t0, t1: self.time.mesh_micros(now) };
                self.send_package_on(
                    conn,
                    PackageType::TimeDelay.as_u16(),
                    variant.from,
                    Routing::Single,
                    &reply,
                );
            }
            1 => {
                let delay = (self.time.mesh_micros(now) as i64 - pkg.t0 as i64) / 2;
                if let Some(cb) = self.callbacks.on_node_delay_received.as_mut() {
                    cb(variant.from, delay);
                }
            }
            other => {
                log::debug!("mesh: ignoring time delay step {}", other);
            }
        }
    }

    /// Measure the round-trip delay to `node`.
    pub fn start_delay_measurement(&mut self, node: NodeId) -> Result<(), RouteError> {
        let now = self.platform.now_millis();
        let probe = TimeDelay { step: 0, t0: self.time.mesh_micros(now), t1: 0 };
        self.send_package_routed(PackageType::TimeDelay.as_u16(), node, Routing::Single, &probe)
    }

    // ---- bridge ---------------------------------------------------------

    fn handle_bridge_status(&mut self, variant: &Variant, now: u64) {
        let Ok(pkg) = self.decode_body::<BridgeStatus>(variant) else {
            return;
        };
        let primary_before = self.bridge.primary(now).or(self.last_primary);
        let change = self.bridge.table.update_status(variant.from, &pkg, now);

        if primary_before == Some(variant.from) {
            if let Some(flipped) = change.internet_flipped {
                if let Some(cb) = self.callbacks.on_bridge_status_changed.as_mut() {
                    cb(variant.from, flipped);
                }
            }
            // the primary lost its uplink: first failover trigger
            if !pkg.internet_connected {
                let _ = self.try_start_election(now);
            }
        }

        self.last_primary = self.bridge.primary(now).or(self.last_primary);
    }

    fn handle_bridge_election(&mut self, variant: &Variant, now: u64) {
        let Ok(pkg) = self.decode_body::<BridgeElection>(variant) else {
            return;
        };
        // a competing candidacy also serves as our trigger to join
        if !self.bridge.election.is_collecting() {
            let _ = self.try_start_election(now);
        }
        let candidate = BridgeCandidate::from_election(variant.from, &pkg);
        self.bridge.election.add_candidate(candidate);
    }

    fn handle_bridge_takeover(&mut self, variant: &Variant, now: u64) {
        let Ok(pkg) = self.decode_body::<BridgeTakeover>(variant) else {
            return;
        };
        log::info!(
            "mesh: node {} took over from bridge {} ({})",
            variant.from,
            pkg.previous_bridge,
            pkg.reason
        );
        self.bridge.table.remove(pkg.previous_bridge);
        self.last_primary = Some(variant.from);

        if pkg.previous_bridge == self.node_id && self.bridge.is_bridge() {
            self.bridge.retire_bridge(now);
            self.fire_role_changed(false, "Displaced by takeover");
        } else if self.bridge.election.abort() {
            self.fire_role_changed(false, "Another node won election");
        }
    }

    fn handle_ntp(&mut self, variant: &Variant, now: u64) {
        let Ok(pkg) = self.decode_body::<NtpTimeSync>(variant) else {
            return;
        };
        // only a known bridge is an acceptable time source, and an already
        // authoritative clock never steps backwards
        if self.bridge.table.get(variant.from).is_none() {
            return;
        }
        let delta = pkg.ntp_time as i64 - self.time.mesh_micros(now) as i64;
        if self.time.has_authority() && delta <= 0 {
            return;
        }
        let applied = self.time.adopt_absolute(pkg.ntp_time, now);
        if self.config.enable_rtc {
            self.platform.set_rtc_unix_time(pkg.ntp_time / 1_000_000);
        }
        if self.config.debug.allows(DebugScope::Sync) {
            log::debug!("mesh: NTP from {} ({}), applied {}µs", variant.from, pkg.source_name, applied);
        }
        if let Some(cb) = self.callbacks.on_node_time_adjusted.as_mut() {
            cb(applied);
        }
    }

    /// Start an election round if every precondition holds.
    pub fn try_start_election(&mut self, now: u64) -> Result<(), ElectionError> {
        if !self.config.enable_bridge_failover || !self.config.has_router_credentials() {
            return Err(ElectionError::NotEligible);
        }
        if self.bridge.has_internet(now) {
            return Err(ElectionError::NotEligible);
        }
        self.bridge.election.begin_scan(now)?;
        self.last_election_attempt_ms = now;

        let rssi = self.platform.router_scan(&self.config.router_ssid);
        if rssi == 0 {
            if self.config.debug.allows(DebugScope::General) {
                log::debug!("mesh: router `{}` not visible, aborting election", self.config.router_ssid);
            }
            self.bridge.election.scan_failed();
            return Err(ElectionError::RouterNotVisible);
        }

        let own = BridgeCandidate {
            node_id: self.node_id,
            router_rssi: rssi,
            uptime_ms: now,
            free_memory: self.platform.free_memory(),
        };
        let pkg = BridgeElection {
            router_rssi: rssi,
            uptime_ms: now,
            free_memory: own.free_memory,
            router_ssid: self.config.router_ssid.clone(),
        };
        self.broadcast_package(PackageType::BridgeElection.as_u16(), &pkg);
        self.bridge.election.open_collection(own, now, self.config.election_timeout_ms);
        log::info!("mesh: bridge election started (rssi={})", rssi);
        Ok(())
    }

    fn finish_election(&mut self, candidates: &[BridgeCandidate], now: u64) {
        let Some(winner) = pick_winner(candidates) else {
            return;
        };
        log::info!(
            "mesh: election closed with {} candidates, winner {}",
            candidates.len(),
            winner.node_id
        );
        if winner.node_id == self.node_id {
            let previous = self.last_primary.unwrap_or(NODE_NONE);
            self.promote_to_bridge(now, previous, winner.router_rssi, "Won bridge election");
        }
    }

    /// Become the bridge: leave the mesh uplink, associate with the router,
    /// announce the takeover. Broadcast task registration is deliberately
    /// NOT done here — see `housekeeping`.
    fn promote_to_bridge(&mut self, now: u64, previous: NodeId, rssi: i8, reason: &str) {
        self.platform.station_disconnect();
        let connected = self
            .platform
            .station_connect(&self.config.router_ssid, &self.config.router_password);
        self.bridge.init_bridge(now);
        self.bridge.set_local_status(connected, rssi, self.config.channel, "");
        self.last_primary = Some(self.node_id);

        let pkg = BridgeTakeover { previous_bridge: previous, reason: reason.to_string() };
        self.broadcast_package(PackageType::BridgeTakeover.as_u16(), &pkg);
        self.fire_role_changed(true, reason);
    }

    fn register_bridge_tasks(&mut self, now: u64) {
        if self.status_task.is_none() {
            self.status_task = Some(self.scheduler.add_task(
                now,
                self.config.status_interval_ms,
                Iterations::Forever,
                Box::new(|mesh| mesh.broadcast_bridge_status()),
            ));
        }
        if self.config.enable_multi_bridge && self.coordination_task.is_none() {
            self.coordination_task = Some(self.scheduler.add_task(
                now,
                self.config.coordination_interval_ms,
                Iterations::Forever,
                Box::new(|mesh| mesh.broadcast_bridge_coordination()),
            ));
        }
        if self.ntp_task.is_none() {
            self.ntp_task = Some(self.scheduler.add_task(
                now,
                self.config.ntp_broadcast_interval_ms,
                Iterations::Forever,
                Box::new(|mesh| mesh.broadcast_ntp_time()),
            ));
        }
        // the first heartbeat goes out right away
        self.broadcast_bridge_status();
    }

    fn broadcast_bridge_status(&mut self) {
        if !self.bridge.is_bridge() {
            return;
        }
        let now = self.platform.now_millis();
        let pkg = self.bridge.status_package(now, self.time.mesh_micros(now));
        self.broadcast_package(PackageType::BridgeStatus.as_u16(), &pkg);
    }

    fn broadcast_bridge_coordination(&mut self) {
        if !self.bridge.is_bridge() || !self.config.enable_multi_bridge {
            return;
        }
        let now = self.platform.now_millis();
        let pkg = self.bridge.coordination_package(self.time.mesh_micros(now));
        self.broadcast_package(PackageType::BridgeCoordination.as_u16(), &pkg);
    }

    fn broadcast_ntp_time(&mut self) {
        if !self.bridge.is_bridge() || !self.time.has_authority() {
            return;
        }
        let now = self.platform.now_millis();
        let pkg = NtpTimeSync {
            ntp_time: self.time.mesh_micros(now),
            accuracy_ms: 50,
            source_name: "bridge".to_string(),
        };
        self.broadcast_package(PackageType::NtpTimeSync.as_u16(), &pkg);
    }

    /// Second failover trigger: the primary aged out of the freshness
    /// horizon entirely.
    fn check_failover_trigger(&mut self, now: u64) {
        let Some(primary) = self.last_primary else {
            return;
        };
        if primary == self.node_id || self.bridge.has_internet(now) {
            return;
        }
        let aged = match self.bridge.table.get(primary) {
            Some(info) => !info.is_healthy(now),
            None => true,
        };
        if aged && now.saturating_sub(self.last_election_attempt_ms) >= ELECTION_RETRY_PAUSE_MS {
            let _ = self.try_start_election(now);
        }
    }

    /// Declare this node a bridge from the start (a configured gateway
    /// rather than an election winner).
    pub fn become_bridge(&mut self) {
        let now = self.platform.now_millis();
        self.bridge.init_bridge(now);
        self.last_primary = Some(self.node_id);
    }

    /// Feed the host's uplink observations into the bridge state. A flip of
    /// the Internet flag broadcasts a status immediately.
    pub fn set_bridge_status(
        &mut self,
        internet_connected: bool,
        router_rssi: i8,
        router_channel: u8,
        gateway_ip: &str,
    ) {
        let flipped =
            self.bridge.set_local_status(internet_connected, router_rssi, router_channel, gateway_ip);
        if flipped && self.bridge.is_bridge() {
            self.broadcast_bridge_status();
        }
    }

    pub fn set_bridge_priority(&mut self, priority: u8) {
        self.bridge.set_priority(priority);
    }

    pub fn set_bridge_load(&mut self, load: u8) {
        self.bridge.set_load(load);
    }

    pub fn is_bridge(&self) -> bool {
        self.bridge.is_bridge()
    }

    pub fn has_internet_connection(&self) -> bool {
        self.bridge.has_internet(self.platform.now_millis())
    }

    pub fn get_primary_bridge(&self) -> Option<NodeId> {
        self.bridge.primary(self.platform.now_millis())
    }

    /// Pick the outbound bridge per the configured strategy.
    pub fn select_bridge(&mut self) -> Option<NodeId> {
        let now = self.platform.now_millis();
        self.bridge.selector.select(&self.bridge.table, now)
    }

    /// Force the next `select_bridge` to a specific node, once.
    pub fn select_bridge_override(&mut self, node: NodeId) {
        self.bridge.selector.select_override(node);
    }

    pub fn bridge_info(&self, node: NodeId) -> Option<&crate::bridge::BridgeInfo> {
        self.bridge.table().get(node)
    }

    pub fn election_state(&self) -> ElectionState {
        self.bridge.election.state()
    }

    // ---- user traffic ---------------------------------------------------

    /// Send a payload to one node.
    pub fn send_single(&mut self, dest: NodeId, msg: &str) -> Result<(), RouteError> {
        if dest == self.node_id || dest == NODE_NONE {
            return Err(RouteError::NoRoute);
        }
        let payload = SinglePayload { msg: msg.to_string() };
        self.send_package_routed(PackageType::Single.as_u16(), dest, Routing::Single, &payload)
    }

    /// Flood a payload to every node. Returns the number of links written.
    pub fn send_broadcast(&mut self, msg: &str, include_self: bool) -> usize {
        let payload = BroadcastPayload { msg: msg.to_string() };
        let sent = self.broadcast_package(PackageType::Broadcast.as_u16(), &payload);
        if include_self {
            if let Some(cb) = self.callbacks.on_receive.as_mut() {
                cb(self.node_id, msg);
            }
        }
        sent
    }

    /// Register a handler for a user package type (100–599).
    pub fn register_package(
        &mut self,
        package_type: u16,
        propagates: bool,
        handler: PackageHandler,
    ) -> Result<(), ConfigError> {
        self.packages.register(package_type, propagates, handler)
    }

    /// Register a handler for any type nothing else claims.
    pub fn register_catch_all(&mut self, handler: PackageHandler) {
        self.packages.register_catch_all(handler);
    }

    /// Send a user package to one node.
    pub fn send_package<T: Serialize>(
        &mut self,
        package_type: u16,
        dest: NodeId,
        body: &T,
    ) -> Result<(), RouteError> {
        self.send_package_routed(package_type, dest, Routing::Single, body)
    }

    /// Flood a user package.
    pub fn broadcast_user_package<T: Serialize>(&mut self, package_type: u16, body: &T) -> usize {
        self.broadcast_package(package_type, body)
    }

    // ---- outbound plumbing ----------------------------------------------

    fn encode<T: Serialize>(
        &self,
        package_type: u16,
        dest: NodeId,
        routing: Routing,
        body: &T,
    ) -> Option<Vec<u8>> {
        let variant = match Variant::from_body(package_type, self.node_id, dest, routing, body) {
            Ok(variant) => variant,
            Err(err) => {
                log::error!("mesh: could not build packet type {}: {}", package_type, err);
                return None;
            }
        };
        match variant.encode() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                log::error!("mesh: could not encode packet type {}: {}", package_type, err);
                None
            }
        }
    }

    fn send_package_on<T: Serialize>(
        &mut self,
        conn: ConnectionId,
        package_type: u16,
        dest: NodeId,
        routing: Routing,
        body: &T,
    ) {
        if let Some(bytes) = self.encode(package_type, dest, routing, body) {
            if let Err(err) = self.registry.send_to(conn, &bytes) {
                log::debug!("mesh: send on {} failed: {}", conn, err);
                self.drop_connection(conn, DropReason::TransportClosed);
            }
        }
    }

    fn send_package_routed<T: Serialize>(
        &mut self,
        package_type: u16,
        dest: NodeId,
        routing: Routing,
        body: &T,
    ) -> Result<(), RouteError> {
        let next = router::next_hop(&self.registry, dest).ok_or(RouteError::NoRoute)?;
        self.send_package_on(next, package_type, dest, routing, body);
        Ok(())
    }

    fn broadcast_package<T: Serialize>(&mut self, package_type: u16, body: &T) -> usize {
        match self.encode(package_type, NODE_NONE, Routing::Broadcast, body) {
            Some(bytes) => self.registry.broadcast_frame(&bytes, None),
            None => 0,
        }
    }

    // ---- message queue --------------------------------------------------

    /// Queue a payload for a destination outside the mesh.
    pub fn queue_message(
        &mut self,
        payload: Vec<u8>,
        destination: &str,
        priority: Priority,
    ) -> Result<u64, QueueError> {
        let now = self.platform.now_millis();
        let id = self.queue.enqueue(payload, destination.to_string(), priority, now)?;
        self.emit_queue_state();
        Ok(id)
    }

    /// Attempt delivery of everything queued through the configured sender.
    /// Returns the number sent.
    pub fn flush_queue(&mut self) -> usize {
        let Some(mut sender) = self.queue_sender.take() else {
            return 0;
        };
        let sent = self.queue.flush(|message| sender(message));
        self.queue_sender = Some(sender);
        self.emit_queue_state();
        sent
    }

    /// Install the delivery hook used by `flush_queue` and the
    /// uplink-restored flush.
    pub fn set_queue_sender(&mut self, sender: QueueSender) {
        self.queue_sender = Some(sender);
    }

    pub fn prune_queue_by_age(&mut self, max_age_ms: u64) -> usize {
        let now = self.platform.now_millis();
        let removed = self.queue.prune_by_age(now, max_age_ms);
        self.emit_queue_state();
        removed
    }

    pub fn cancel_queued_message(&mut self, id: u64) -> Result<(), QueueError> {
        let result = self.queue.cancel(id);
        self.emit_queue_state();
        result
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
        self.emit_queue_state();
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Serialize the queue for host persistence; also clears the dirty
    /// flag.
    pub fn save_queue(&mut self) -> Vec<u8> {
        self.queue.save()
    }

    /// Restore the queue from a persisted blob.
    pub fn load_queue(&mut self, blob: &[u8]) {
        self.queue.load(blob);
        self.emit_queue_state();
    }

    /// Whether the queue changed since the last save; the host polls this
    /// to schedule persistence.
    pub fn queue_needs_save(&mut self) -> bool {
        self.config.queue_persistence && self.queue.take_dirty()
    }

    fn emit_queue_state(&mut self) {
        if let Some((state, count)) = self.queue.take_state_change() {
            if let Some(cb) = self.callbacks.on_queue_state_changed.as_mut() {
                cb(state, count);
            }
        }
    }

    // ---- time -----------------------------------------------------------

    /// Mesh time in microseconds.
    pub fn get_node_time(&self) -> u64 {
        self.time.mesh_micros(self.platform.now_millis())
    }

    pub fn time_state(&self) -> TimeState {
        self.time.state(self.registry.subnet_size_excluding(None))
    }

    /// Mark this node's clock as trusted (RTC or gateway signal).
    pub fn set_time_authority(&mut self, authority: bool) {
        self.time.set_authority(authority);
    }

    // ---- topology queries -----------------------------------------------

    pub fn set_root(&mut self, root: bool) {
        if self.layout.set_root(root) {
            self.after_topology_change(None);
        }
    }

    pub fn set_contains_root(&mut self, contains_root: bool) {
        if self.layout.set_contains_root(contains_root) {
            self.after_topology_change(None);
        }
    }

    pub fn is_root(&self) -> bool {
        self.layout.is_root()
    }

    pub fn is_rooted(&self) -> bool {
        self.layout.is_rooted()
    }

    pub fn get_node_list(&self) -> Vec<NodeId> {
        self.layout.node_list()
    }

    pub fn sub_connection_count(&self) -> u32 {
        self.layout.sub_connection_count()
    }

    pub fn is_connected_to(&self, node: NodeId) -> bool {
        self.layout.tree().contains(node) && node != self.node_id
    }

    pub fn topology(&self) -> &NodeTree {
        self.layout.tree()
    }

    // ---- configuration --------------------------------------------------

    pub fn set_router_credentials(&mut self, ssid: &str, password: &str) -> Result<(), ConfigError> {
        self.config.set_router_credentials(ssid, password)
    }

    pub fn set_bridge_failover_enabled(&mut self, enabled: bool) {
        self.config.enable_bridge_failover = enabled;
    }

    pub fn set_multi_bridge_enabled(&mut self, enabled: bool) {
        self.config.enable_multi_bridge = enabled;
    }

    pub fn set_message_queue_enabled(&mut self, enabled: bool) {
        self.config.enable_message_queue = enabled;
        self.queue.set_enabled(enabled);
    }

    pub fn set_rtc_enabled(&mut self, enabled: bool) {
        self.config.enable_rtc = enabled;
    }

    pub fn set_queue_persistence(&mut self, enabled: bool) {
        self.config.queue_persistence = enabled;
    }

    pub fn set_selection_strategy(&mut self, strategy: SelectionStrategy) {
        self.config.set_selection_strategy(strategy);
        self.bridge.selector.set_strategy(strategy);
    }

    pub fn set_max_bridges(&mut self, max: u8) -> Result<(), ConfigError> {
        self.config.set_max_bridges(max)?;
        self.bridge.selector.set_max_bridges(max);
        Ok(())
    }

    pub fn set_election_timeout_ms(&mut self, timeout_ms: u64) -> Result<(), ConfigError> {
        self.config.set_election_timeout_ms(timeout_ms)
    }

    pub fn set_debug_mask(&mut self, mask: DebugMask) {
        self.config.set_debug_mask(mask);
    }

    // ---- callbacks ------------------------------------------------------

    pub fn on_receive(&mut self, cb: ReceiveCallback) {
        self.callbacks.on_receive = Some(cb);
    }

    pub fn on_new_connection(&mut self, cb: NewConnectionCallback) {
        self.callbacks.on_new_connection = Some(cb);
    }

    pub fn on_dropped_connection(&mut self, cb: DroppedConnectionCallback) {
        self.callbacks.on_dropped_connection = Some(cb);
    }

    pub fn on_changed_connections(&mut self, cb: ChangedConnectionsCallback) {
        self.callbacks.on_changed_connections = Some(cb);
    }

    pub fn on_node_time_adjusted(&mut self, cb: TimeAdjustedCallback) {
        self.callbacks.on_node_time_adjusted = Some(cb);
    }

    pub fn on_node_delay_received(&mut self, cb: NodeDelayCallback) {
        self.callbacks.on_node_delay_received = Some(cb);
    }

    pub fn on_bridge_status_changed(&mut self, cb: BridgeStatusChangedCallback) {
        self.callbacks.on_bridge_status_changed = Some(cb);
    }

    pub fn on_bridge_role_changed(&mut self, cb: BridgeRoleChangedCallback) {
        self.callbacks.on_bridge_role_changed = Some(cb);
    }

    pub fn on_queue_state_changed(&mut self, cb: QueueStateChangedCallback) {
        self.callbacks.on_queue_state_changed = Some(cb);
    }

    fn fire_role_changed(&mut self, is_bridge: bool, reason: &str) {
        if let Some(cb) = self.callbacks.on_bridge_role_changed.as_mut() {
            cb(is_bridge, reason);
        }
    }
}
