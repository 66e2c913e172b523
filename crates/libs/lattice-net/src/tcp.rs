//! Tokio TCP transport.
//!
//! Each link runs a split read/write task pair under a cancellation token.
//! Inbound frames and lifecycle changes surface as [`TransportEvent`]s on
//! one channel the host's event loop drains between engine passes; outbound
//! frames enter through a [`TcpLinkSink`] handed to the engine's registry.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lattice_core::{LinkSink, TransportError};

use crate::framing::{encode_frame, FrameBuffer, DEFAULT_MAX_FRAME};

const READ_BUFFER: usize = 2048;
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// Transport-scoped link identifier; the host maps it to the engine's
/// `ConnectionId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// What the transport tells the host.
pub enum TransportEvent {
    /// A link came up. `station` is true on the side that dialed out.
    Opened { link: LinkId, station: bool, sink: TcpLinkSink },
    /// One complete frame arrived.
    Frame { link: LinkId, bytes: Vec<u8> },
    /// The link is gone; the engine side should drop its connection.
    Closed { link: LinkId },
}

/// Outbound half of one TCP link, owned by the engine's registry.
pub struct TcpLinkSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    max_frame: usize,
}

impl LinkSink for TcpLinkSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame {
            return Err(TransportError::Oversize);
        }
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.send(encode_frame(frame)).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

pub struct TcpTransport {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
    next_link: Arc<AtomicU64>,
    max_frame: usize,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            next_link: Arc::new(AtomicU64::new(1)),
            max_frame,
        }
    }

    /// Bind and start accepting mesh peers. Returns the bound address (useful
    /// with port 0).
    pub async fn listen(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        log::info!("tcp: listening on {}", local);

        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let next_link = self.next_link.clone();
        let max_frame = self.max_frame;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let link = LinkId(next_link.fetch_add(1, Ordering::Relaxed));
                                log::debug!("tcp: {} accepted from {}", link, peer);
                                spawn_link(stream, link, false, events_tx.clone(), &cancel, max_frame);
                            }
                            Err(err) => {
                                log::warn!("tcp: accept failed: {}", err);
                            }
                        }
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dial a peer, reconnecting with a pause for as long as the transport
    /// lives.
    pub fn connect(&self, addr: SocketAddr) {
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let next_link = self.next_link.clone();
        let max_frame = self.max_frame;

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        let link = LinkId(next_link.fetch_add(1, Ordering::Relaxed));
                        log::info!("tcp: {} connected to {}", link, addr);
                        let link_cancel =
                            spawn_link(stream, link, true, events_tx.clone(), &cancel, max_frame);
                        link_cancel.cancelled().await;
                        log::info!("tcp: {} to {} closed", link, addr);
                    }
                    Err(err) => {
                        log::debug!("tcp: couldn't connect to {}: {}", addr, err);
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
            }
        });
    }

    /// Await the next transport event.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Drain one event without waiting, for interleaved event loops.
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Stop every task and link.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Start the read/write task pair for one established stream. Returns the
/// link's cancellation token.
fn spawn_link(
    stream: TcpStream,
    link: LinkId,
    station: bool,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    parent: &CancellationToken,
    max_frame: usize,
) -> CancellationToken {
    let cancel = parent.child_token();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (mut read_half, mut write_half) = stream.into_split();

    let sink = TcpLinkSink { tx: frames_tx, cancel: cancel.clone(), max_frame };
    if events_tx.send(TransportEvent::Opened { link, station, sink }).is_err() {
        cancel.cancel();
        return cancel;
    }

    // receive task: raw reads through the frame buffer, one event per frame
    {
        let cancel = cancel.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut tcp_buffer = [0u8; READ_BUFFER];
            let mut frames = FrameBuffer::new(max_frame);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = read_half.read(&mut tcp_buffer) => {
                        match result {
                            Ok(0) => {
                                log::debug!("tcp: {} peer closed", link);
                                break;
                            }
                            Ok(n) => {
                                frames.push(&tcp_buffer[..n]);
                                loop {
                                    match frames.next_frame() {
                                        Ok(Some(frame)) => {
                                            let _ = events_tx.send(TransportEvent::Frame { link, bytes: frame });
                                        }
                                        Ok(None) => break,
                                        Err(err) => {
                                            log::warn!("tcp: {} framing error: {}", link, err);
                                            cancel.cancel();
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(err) => {
                                log::debug!("tcp: {} read error: {}", link, err);
                                break;
                            }
                        }
                    }
                }
            }
            cancel.cancel();
            let _ = events_tx.send(TransportEvent::Closed { link });
        });
    }

    // transmit task: order-preserving writes off the sink channel
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    queued = frames_rx.recv() => {
                        let Some(bytes) = queued else { break };
                        if let Err(err) = write_half.write_all(&bytes).await {
                            log::debug!("tcp: {} write failed: {}", link, err);
                            break;
                        }
                        if let Err(err) = write_half.flush().await {
                            log::debug!("tcp: {} flush failed: {}", link, err);
                            break;
                        }
                    }
                }
            }
            cancel.cancel();
        });
    }

    cancel
}
