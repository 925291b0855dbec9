//! Per-peer connection: the handshake/ping/disconnect state machine, framed
//! I/O over a `TcpStream`, and inbound message routing. Each peer runs as
//! its own tokio task; state visible to the rest of the node (negotiated
//! version, best height, outstanding pings) lives behind a `parking_lot`
//! mutex so the owning task and the network thread can both read it without
//! awaiting a lock across I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, instrument, warn};

use crate::config::NetworkParameters;
use crate::network::messages::{
    NetworkMessage, PingMessage, PongMessage, VerackMessage, VersionMessage, NODE_NETWORK,
    PROTOCOL_VERSION,
};
use crate::network::wire::{self, WireError};

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("ping timed out")]
    PingTimeout,
    #[error("peer closed the connection")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn next() -> Self {
        PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// `Pending -> Connecting -> VersionExchange -> Ready`, or `Disconnected`
/// from any state. Transitions are monotonic: once `Disconnected`, a peer
/// is never reused, only replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Pending,
    Connecting,
    VersionExchange,
    Ready,
    Disconnected,
}

#[derive(Debug, Default)]
struct SharedState {
    state: Option<PeerState>,
    negotiated_version: Option<u32>,
    services: u64,
    best_height: i32,
    last_ping_sent: Option<Instant>,
    outstanding_pings: HashMap<u64, Instant>,
    score: i32,
}

/// The handle the rest of the node holds for a connected peer: an outbound
/// command channel plus a snapshot of negotiated state.
#[derive(Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<NetworkMessage>,
    shared: Arc<Mutex<SharedState>>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        self.shared.lock().state.unwrap_or(PeerState::Pending)
    }

    pub fn best_height(&self) -> i32 {
        self.shared.lock().best_height
    }

    /// Record a new advertised tip height for this peer, learned from
    /// inventory traffic after the handshake (the handshake `Version`
    /// message only sets the initial value).
    pub fn set_best_height(&self, height: i32) {
        let mut s = self.shared.lock();
        if height > s.best_height {
            s.best_height = height;
        }
    }

    pub fn negotiated_version(&self) -> Option<u32> {
        self.shared.lock().negotiated_version
    }

    pub fn score(&self) -> i32 {
        self.shared.lock().score
    }

    /// Penalize a peer for protocol misbehaviour (bad PMT, PoW failure,
    /// unknown-prev header). Callers disconnect once the score crosses a
    /// configured threshold.
    pub fn score_down(&self, amount: i32) -> i32 {
        let mut s = self.shared.lock();
        s.score -= amount;
        s.score
    }

    pub async fn send(&self, msg: NetworkMessage) -> bool {
        self.outbound.send(msg).await.is_ok()
    }

    /// Build a detached handle for unit tests elsewhere in `network` that
    /// need a `PeerHandle` without driving a real connection. The returned
    /// receiver should be drained (or dropped) by the caller.
    #[cfg(test)]
    pub(crate) fn new_for_test(addr: SocketAddr) -> (Self, mpsc::Receiver<NetworkMessage>) {
        let (outbound, rx) = mpsc::channel(256);
        let handle = PeerHandle {
            id: PeerId::next(),
            addr,
            outbound,
            shared: Arc::new(Mutex::new(SharedState {
                state: Some(PeerState::Ready),
                ..Default::default()
            })),
        };
        (handle, rx)
    }
}

/// Events a peer's connection task emits for the owning `PeerGroup`'s
/// command queue to fold into its state. Never mutates `PeerGroup` state
/// directly (see the concurrency model: only the network thread touches
/// peer-table/chain-store state).
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Ready { id: PeerId, best_height: i32, services: u64 },
    Message { id: PeerId, message: NetworkMessage },
    Disconnected { id: PeerId, error: Option<String> },
}

/// Drive one peer connection end to end: version/verack handshake, ping
/// keepalive, inbound dispatch. Returns once the connection is torn down;
/// the caller should treat a returned handle's state as authoritative only
/// while the task is alive (the `Disconnected` event marks the end).
#[instrument(skip(stream, params, events_tx), fields(%addr))]
pub async fn run_peer(
    mut stream: TcpStream,
    addr: SocketAddr,
    params: NetworkParameters,
    my_best_height: i32,
    connect_timeout: Duration,
    ping_interval: Option<Duration>,
    events_tx: mpsc::Sender<PeerEvent>,
) -> (PeerHandle, tokio::task::JoinHandle<()>) {
    let id = PeerId::next();
    let shared = Arc::new(Mutex::new(SharedState {
        state: Some(PeerState::Connecting),
        ..Default::default()
    }));
    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    let handle = PeerHandle {
        id,
        addr,
        outbound: outbound_tx,
        shared: shared.clone(),
    };

    let join = tokio::spawn(async move {
        let result = drive_connection(
            &mut stream,
            id,
            addr,
            &params,
            my_best_height,
            connect_timeout,
            ping_interval,
            outbound_rx,
            events_tx.clone(),
            &shared,
        )
        .await;

        shared.lock().state = Some(PeerState::Disconnected);
        let error = result.err().map(|e| e.to_string());
        let _ = events_tx.send(PeerEvent::Disconnected { id, error }).await;
    });

    (handle, join)
}

#[allow(clippy::too_many_arguments)]
async fn drive_connection(
    stream: &mut TcpStream,
    id: PeerId,
    addr: SocketAddr,
    params: &NetworkParameters,
    my_best_height: i32,
    connect_timeout: Duration,
    ping_interval: Option<Duration>,
    mut outbound_rx: mpsc::Receiver<NetworkMessage>,
    events_tx: mpsc::Sender<PeerEvent>,
    shared: &Arc<Mutex<SharedState>>,
) -> Result<(), PeerError> {
    shared.lock().state = Some(PeerState::VersionExchange);
    let (their_version, their_best_height) =
        timeout(connect_timeout, handshake(stream, addr, params, my_best_height))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;

    {
        let mut s = shared.lock();
        s.state = Some(PeerState::Ready);
        s.negotiated_version = Some(their_version.version);
        s.services = their_version.services;
        s.best_height = their_best_height;
    }
    let _ = events_tx
        .send(PeerEvent::Ready {
            id,
            best_height: their_best_height,
            services: their_version.services,
        })
        .await;

    let mut ping_ticker = ping_interval.map(tokio::time::interval);

    loop {
        tokio::select! {
            biased;

            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(msg) => send_message(stream, params.magic, &msg).await?,
                    None => return Ok(()),
                }
            }

            _ = async {
                match ping_ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending().await,
                }
            } => {
                // A ping still unanswered when the next interval elapses has
                // exceeded its timeout (the interval doubles as the
                // keepalive deadline; there is no separate ping-timeout
                // config option).
                if !shared.lock().outstanding_pings.is_empty() {
                    return Err(PeerError::PingTimeout);
                }
                let nonce = rand::thread_rng().next_u64();
                shared.lock().outstanding_pings.insert(nonce, Instant::now());
                shared.lock().last_ping_sent = Some(Instant::now());
                send_message(stream, params.magic, &NetworkMessage::Ping(PingMessage { nonce })).await?;
            }

            framed = wire::read_framed(stream, params.magic) => {
                let (command, payload) = framed?;
                match NetworkMessage::decode(&command, &payload) {
                    Ok(Some(message)) => {
                        if !handle_inbound(&message, stream, params.magic, shared).await? {
                            let _ = events_tx.send(PeerEvent::Message { id, message }).await;
                        }
                    }
                    Ok(None) => debug!(%command, "ignoring unknown command"),
                    Err(e) => {
                        warn!(%command, error = %e, "dropping malformed message, disconnecting peer");
                        return Err(e.into());
                    }
                }
            }
        }
    }
}

/// Handle messages the peer task answers itself (ping/pong keepalive)
/// without bothering the rest of the node. Returns `true` if the message
/// was fully handled here and should not be forwarded as a `PeerEvent`.
async fn handle_inbound(
    message: &NetworkMessage,
    stream: &mut TcpStream,
    magic: u32,
    shared: &Arc<Mutex<SharedState>>,
) -> Result<bool, PeerError> {
    match message {
        NetworkMessage::Ping(PingMessage { nonce }) => {
            send_message(stream, magic, &NetworkMessage::Pong(PongMessage { nonce: *nonce })).await?;
            Ok(true)
        }
        NetworkMessage::Pong(PongMessage { nonce }) => {
            shared.lock().outstanding_pings.remove(nonce);
            Ok(true)
        }
        _ => Ok(false),
    }
}

async fn handshake(
    stream: &mut TcpStream,
    addr: SocketAddr,
    params: &NetworkParameters,
    my_best_height: i32,
) -> Result<(VersionMessage, i32), PeerError> {
    let my_version = VersionMessage {
        version: PROTOCOL_VERSION,
        services: NODE_NETWORK,
        timestamp: unix_now(),
        receiver_addr: addr,
        sender_addr: "0.0.0.0:0".parse().unwrap(),
        nonce: rand::thread_rng().next_u64(),
        user_agent: "/btpc-header-node:0.1/".to_string(),
        start_height: my_best_height,
        relay: true,
    };
    send_message(stream, params.magic, &NetworkMessage::Version(my_version)).await?;

    let mut their_version = None;
    let mut verack_sent = false;
    let mut verack_received = false;

    while their_version.is_none() || !verack_received {
        let (command, payload) = wire::read_framed(stream, params.magic).await?;
        match NetworkMessage::decode(&command, &payload)? {
            Some(NetworkMessage::Version(v)) => {
                their_version = Some(v);
                if !verack_sent {
                    send_message(stream, params.magic, &NetworkMessage::Verack(VerackMessage)).await?;
                    verack_sent = true;
                }
            }
            Some(NetworkMessage::Verack(_)) => verack_received = true,
            _ => continue,
        }
    }

    let version = their_version.expect("loop only exits once version is set");
    let best_height = version.start_height;
    Ok((version, best_height))
}

async fn send_message(stream: &mut TcpStream, magic: u32, msg: &NetworkMessage) -> Result<(), PeerError> {
    let payload = msg.encode_payload();
    wire::write_framed(stream, magic, msg.command(), &payload).await?;
    Ok(())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_are_unique_and_increasing() {
        let a = PeerId::next();
        let b = PeerId::next();
        assert!(b.0 > a.0);
    }

    #[test]
    fn fresh_peer_state_is_pending_before_connect() {
        let shared = Arc::new(Mutex::new(SharedState::default()));
        let handle = PeerHandle {
            id: PeerId::next(),
            addr: "127.0.0.1:8333".parse().unwrap(),
            outbound: mpsc::channel(1).0,
            shared,
        };
        assert_eq!(handle.state(), PeerState::Pending);
    }

    #[test]
    fn score_down_is_monotone_decreasing() {
        let shared = Arc::new(Mutex::new(SharedState::default()));
        let handle = PeerHandle {
            id: PeerId::next(),
            addr: "127.0.0.1:8333".parse().unwrap(),
            outbound: mpsc::channel(1).0,
            shared,
        };
        let after_first = handle.score_down(10);
        let after_second = handle.score_down(5);
        assert_eq!(after_first, -10);
        assert_eq!(after_second, -15);
    }
}
