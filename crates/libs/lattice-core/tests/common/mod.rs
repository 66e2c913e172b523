//! In-memory multi-node harness shared by the scenario suites.
//!
//! Nodes are real engines; links are queue pairs the test pumps until the
//! mesh goes quiet. The platform clock is shared and scripted, so tests
//! control time exactly.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use lattice_core::registry::LinkSink;
use lattice_core::{ConnectionId, Mesh, MeshConfig, Platform, TransportError};

/// Scripted platform: a shared test clock plus per-node radio answers.
pub struct ManualPlatform {
    pub clock: Rc<Cell<u64>>,
    pub rssi: i8,
    pub memory: u32,
    pub station_ok: bool,
}

impl ManualPlatform {
    pub fn new(clock: Rc<Cell<u64>>) -> Self {
        Self { clock, rssi: 0, memory: 0, station_ok: false }
    }

    pub fn with_radio(clock: Rc<Cell<u64>>, rssi: i8, memory: u32) -> Self {
        Self { clock, rssi, memory, station_ok: true }
    }
}

impl Platform for ManualPlatform {
    fn now_millis(&self) -> u64 {
        self.clock.get()
    }

    fn free_memory(&self) -> u32 {
        self.memory
    }

    fn router_scan(&mut self, _ssid: &str) -> i8 {
        self.rssi
    }

    fn station_connect(&mut self, _ssid: &str, _password: &str) -> bool {
        self.station_ok
    }
}

#[derive(Clone)]
pub struct MemorySink {
    pub queue: Rc<RefCell<VecDeque<Vec<u8>>>>,
    pub closed: Rc<Cell<bool>>,
}

impl MemorySink {
    pub fn pair() -> (MemorySink, Rc<RefCell<VecDeque<Vec<u8>>>>, Rc<Cell<bool>>) {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let closed = Rc::new(Cell::new(false));
        (MemorySink { queue: queue.clone(), closed: closed.clone() }, queue, closed)
    }
}

impl LinkSink for MemorySink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed);
        }
        self.queue.borrow_mut().push_back(frame.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.set(true);
    }
}

pub struct Pipe {
    pub from: usize,
    pub to: usize,
    pub to_conn: ConnectionId,
    pub queue: Rc<RefCell<VecDeque<Vec<u8>>>>,
    pub closed: Rc<Cell<bool>>,
}

pub struct Net {
    pub clock: Rc<Cell<u64>>,
    pub nodes: Vec<Mesh<ManualPlatform>>,
    pub pipes: Vec<Pipe>,
}

impl Net {
    pub fn new(node_ids: &[u32]) -> Self {
        let clock = Rc::new(Cell::new(0));
        let nodes = node_ids
            .iter()
            .map(|&id| Mesh::new(id, MeshConfig::default(), ManualPlatform::new(clock.clone())))
            .collect();
        Self { clock, nodes, pipes: Vec::new() }
    }

    pub fn empty() -> Self {
        Self { clock: Rc::new(Cell::new(0)), nodes: Vec::new(), pipes: Vec::new() }
    }

    /// Add a node with a custom config and platform. Returns its index.
    pub fn push_node(&mut self, node_id: u32, config: MeshConfig, platform: ManualPlatform) -> usize {
        self.nodes.push(Mesh::new(node_id, config, platform));
        self.nodes.len() - 1
    }

    pub fn node(&mut self, index: usize) -> &mut Mesh<ManualPlatform> {
        &mut self.nodes[index]
    }

    /// Wire two nodes together with a duplex queue pair.
    pub fn link(&mut self, a: usize, b: usize) {
        let (sink_ab, queue_ab, closed_ab) = MemorySink::pair();
        let (sink_ba, queue_ba, closed_ba) = MemorySink::pair();
        let a_conn = self.nodes[a].add_connection(Box::new(sink_ab), false);
        let b_conn = self.nodes[b].add_connection(Box::new(sink_ba), true);
        self.pipes.push(Pipe { from: a, to: b, to_conn: b_conn, queue: queue_ab, closed: closed_ab });
        self.pipes.push(Pipe { from: b, to: a, to_conn: a_conn, queue: queue_ba, closed: closed_ba });
    }

    /// Deliver frames until the mesh goes quiet.
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            let mut moved = false;
            for pipe_index in 0..self.pipes.len() {
                let frame = {
                    let pipe = &self.pipes[pipe_index];
                    if pipe.closed.get() {
                        pipe.queue.borrow_mut().clear();
                        continue;
                    }
                    pipe.queue.borrow_mut().pop_front()
                };
                if let Some(frame) = frame {
                    moved = true;
                    let (to, to_conn) = (self.pipes[pipe_index].to, self.pipes[pipe_index].to_conn);
                    let _ = self.nodes[to].handle_frame(to_conn, &frame);
                }
            }
            if !moved {
                return;
            }
        }
        panic!("mesh did not go quiet");
    }

    pub fn advance(&mut self, delta_ms: u64) {
        self.clock.set(self.clock.get() + delta_ms);
    }

    pub fn update_all(&mut self) {
        for node in &mut self.nodes {
            node.update();
        }
    }

    /// Walk the clock forward in steps small enough that keep-alive traffic
    /// holds every link open.
    pub fn run_for(&mut self, total_ms: u64, step_ms: u64) {
        let mut elapsed = 0;
        while elapsed < total_ms {
            let step = step_ms.min(total_ms - elapsed);
            self.advance(step);
            self.update_all();
            self.pump();
            elapsed += step;
        }
    }

    /// Collect user payloads into a per-node inbox.
    pub fn attach_inbox(&mut self, index: usize) -> Rc<RefCell<Vec<(u32, String)>>> {
        let inbox: Rc<RefCell<Vec<(u32, String)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = inbox.clone();
        self.nodes[index].on_receive(Box::new(move |from, msg| {
            sink.borrow_mut().push((from, msg.to_string()));
        }));
        inbox
    }
}
