//! Fleet manager: the single "network thread" actor that owns peer-table
//! state, discovery, connection scheduling, download-peer election,
//! inventory/confidence tracking, and Bloom-filter distribution. All
//! mutation is routed through `GroupCommand`s processed one at a time;
//! worker tasks (PoW check, PMT verify) never touch this state directly.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{info, warn};

use crate::chain::header::{Hash256, Transaction};
use crate::config::NodeConfig;
use crate::events::NodeEvent;
use crate::network::bloom::BloomFilter;
use crate::network::discovery::{discover_all, DnsSeedSource};
use crate::network::messages::{
    FilterLoadMessage, InventoryItem, InventoryKind, MemPoolMessage, NetworkMessage,
};
use crate::network::peer::{run_peer, PeerError, PeerEvent, PeerHandle, PeerId, PeerState};

const SCORE_DISCONNECT_THRESHOLD: i32 = -100;
const MAX_OUTSTANDING_GETDATA_PER_PEER: usize = 128;
const BROADCAST_ECHO_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum BroadcastOutcome {
    Relayed,
    Timeout,
    NoPeers,
}

enum GroupCommand {
    PeerDiscovered(Vec<SocketAddr>),
    PeerEvent(PeerEvent),
    Broadcast {
        tx: Transaction,
        reply: oneshot::Sender<BroadcastOutcome>,
    },
    RecomputeFilter {
        filter: BloomFilter,
        rebroadcast: bool,
    },
    SendToDownloadPeer {
        msg: NetworkMessage,
        reply: oneshot::Sender<bool>,
    },
    QueryDownloadPeer {
        reply: oneshot::Sender<Option<PeerId>>,
    },
    ScoreDownPeer {
        id: PeerId,
        amount: i32,
    },
    LocalhostReachable(SocketAddr),
    Tick,
}

/// Per-address connection backoff, doubled on failure and reset on success,
/// used by the connection scheduler to rank candidate addresses.
struct AddrBackoff {
    interval: Duration,
    next_attempt: Instant,
}

impl AddrBackoff {
    fn fresh() -> Self {
        Self {
            interval: Duration::from_secs(1),
            next_attempt: Instant::now(),
        }
    }
    fn on_success(&mut self) {
        self.interval = Duration::from_secs(1);
        self.next_attempt = Instant::now();
    }
    fn on_failure(&mut self) {
        self.interval = (self.interval * 2).min(Duration::from_secs(900));
        self.next_attempt = Instant::now() + self.interval;
    }
}

struct ConnectedPeer {
    handle: PeerHandle,
    connected_at: Instant,
    pending_getdata: usize,
}

/// A `broadcast(tx)` call awaiting relay confirmation: resolved the moment
/// any peer echoes the txid back via `Inv(Tx)` or `Tx`, or timed out if none
/// does before `deadline`.
struct PendingBroadcast {
    reply: oneshot::Sender<BroadcastOutcome>,
    deadline: Instant,
}

struct GroupState {
    params: crate::config::NetworkParameters,
    config: NodeConfig,
    peers: HashMap<PeerId, ConnectedPeer>,
    addr_backoff: HashMap<SocketAddr, AddrBackoff>,
    download_peer: Option<PeerId>,
    highest_best_height_seen: i32,
    pending_tx: HashMap<Hash256, PeerId>,
    confidence: HashMap<Hash256, HashSet<PeerId>>,
    pending_broadcasts: HashMap<Hash256, PendingBroadcast>,
    current_filter: Option<BloomFilter>,
    events_tx: tokio::sync::broadcast::Sender<NodeEvent>,
    downloader_tx: mpsc::Sender<PeerEvent>,
    command_tx: mpsc::Sender<GroupCommand>,
    my_best_height: i32,
    /// Set once a `localhost:default_port` peer answers a connect probe.
    /// While true, newly discovered addresses are ignored and the scheduler
    /// is pinned to that single peer.
    localhost_only: bool,
}

/// Public handle to a running `PeerGroup` actor.
#[derive(Clone)]
pub struct PeerGroupHandle {
    command_tx: mpsc::Sender<GroupCommand>,
}

impl PeerGroupHandle {
    pub async fn report_discovered(&self, addrs: Vec<SocketAddr>) {
        let _ = self.command_tx.send(GroupCommand::PeerDiscovered(addrs)).await;
    }

    pub async fn broadcast(&self, tx: Transaction) -> BroadcastOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(GroupCommand::Broadcast { tx, reply })
            .await
            .is_err()
        {
            return BroadcastOutcome::NoPeers;
        }
        rx.await.unwrap_or(BroadcastOutcome::NoPeers)
    }

    pub async fn recompute_filter(&self, filter: BloomFilter, rebroadcast: bool) {
        let _ = self
            .command_tx
            .send(GroupCommand::RecomputeFilter { filter, rebroadcast })
            .await;
    }

    /// Send a message to the currently-elected download peer. Returns `false`
    /// if there is none or the send failed.
    pub async fn send_to_download_peer(&self, msg: NetworkMessage) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(GroupCommand::SendToDownloadPeer { msg, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn download_peer_id(&self) -> Option<PeerId> {
        let (reply, rx) = oneshot::channel();
        if self.command_tx.send(GroupCommand::QueryDownloadPeer { reply }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Penalize a peer for protocol misbehaviour observed by the downloader
    /// (bad PMT, PoW failure, unknown-prev header).
    pub async fn score_down_peer(&self, id: PeerId, amount: i32) {
        let _ = self.command_tx.send(GroupCommand::ScoreDownPeer { id, amount }).await;
    }
}

/// Spawn the actor task. `dns_hosts` seeds the discovery sources; `events_tx`
/// is the embedder-facing broadcast channel described in the events module.
pub fn spawn(
    params: crate::config::NetworkParameters,
    config: NodeConfig,
    my_best_height: i32,
    events_tx: tokio::sync::broadcast::Sender<NodeEvent>,
) -> (PeerGroupHandle, mpsc::Receiver<PeerEvent>) {
    let (command_tx, command_rx) = mpsc::channel(1024);
    // The downloader wants to see Block/MerkleBlock/Tx/Headers traffic too;
    // since an mpsc channel has one consumer, the actor re-publishes the
    // peer events it receives onto this second channel after folding them
    // into its own state (see `handle_peer_event`).
    let (downloader_tx, downloader_rx) = mpsc::channel(1024);

    let dns_hosts = params.dns_seeds.clone();
    let default_port = params.default_port;

    let state = GroupState {
        peers: HashMap::new(),
        addr_backoff: HashMap::new(),
        download_peer: None,
        highest_best_height_seen: my_best_height,
        pending_tx: HashMap::new(),
        confidence: HashMap::new(),
        pending_broadcasts: HashMap::new(),
        current_filter: None,
        events_tx,
        downloader_tx,
        command_tx: command_tx.clone(),
        params,
        config: config.clone(),
        my_best_height,
        localhost_only: false,
    };

    tokio::spawn(run_actor(state, command_rx));
    tokio::spawn(run_discovery_loop(dns_hosts, default_port, command_tx.clone()));
    tokio::spawn(run_ticker(command_tx.clone()));
    if config.use_localhost_peer_when_possible {
        tokio::spawn(run_localhost_probe(default_port, command_tx.clone()));
    }

    (PeerGroupHandle { command_tx }, downloader_rx)
}

/// One-shot reachability probe for a locally-running peer. If
/// `127.0.0.1:default_port` accepts a connection within the probe timeout,
/// the node prefers it exclusively (spec's single-trusted-peer shortcut)
/// instead of fanning out to the wider network.
async fn run_localhost_probe(default_port: u16, command_tx: mpsc::Sender<GroupCommand>) {
    let addr: SocketAddr = ([127, 0, 0, 1], default_port).into();
    if tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr))
        .await
        .is_ok()
    {
        let _ = command_tx.send(GroupCommand::LocalhostReachable(addr)).await;
    }
}

async fn run_discovery_loop(
    hosts: Vec<String>,
    default_port: u16,
    command_tx: mpsc::Sender<GroupCommand>,
) {
    let mut sources: Vec<DnsSeedSource> = hosts
        .into_iter()
        .map(|h| DnsSeedSource::new(h, default_port))
        .collect();

    let mut ticker = interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let found = discover_all(&mut sources).await;
        if !found.is_empty() && command_tx.send(GroupCommand::PeerDiscovered(found)).await.is_err() {
            return;
        }
    }
}

async fn run_ticker(command_tx: mpsc::Sender<GroupCommand>) {
    let mut ticker = interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        if command_tx.send(GroupCommand::Tick).await.is_err() {
            return;
        }
    }
}

async fn run_actor(mut state: GroupState, mut command_rx: mpsc::Receiver<GroupCommand>) {
    while let Some(command) = command_rx.recv().await {
        match command {
            GroupCommand::PeerDiscovered(addrs) => {
                if state.localhost_only {
                    continue;
                }
                let _ = state.events_tx.send(NodeEvent::PeersDiscovered { addrs: addrs.clone() });
                for addr in addrs {
                    state.addr_backoff.entry(addr).or_insert_with(AddrBackoff::fresh);
                }
            }
            GroupCommand::PeerEvent(event) => handle_peer_event(&mut state, event).await,
            GroupCommand::Broadcast { tx, reply } => handle_broadcast(&mut state, tx, reply).await,
            GroupCommand::RecomputeFilter { filter, rebroadcast } => {
                handle_recompute_filter(&mut state, filter, rebroadcast).await;
            }
            GroupCommand::SendToDownloadPeer { msg, reply } => {
                let sent = match state.download_peer.and_then(|id| state.peers.get(&id)) {
                    Some(peer) => peer.handle.send(msg).await,
                    None => false,
                };
                let _ = reply.send(sent);
            }
            GroupCommand::QueryDownloadPeer { reply } => {
                let _ = reply.send(state.download_peer);
            }
            GroupCommand::ScoreDownPeer { id, amount } => {
                if let Some(peer) = state.peers.get(&id) {
                    peer.handle.score_down(amount);
                }
            }
            GroupCommand::LocalhostReachable(addr) => {
                info!(%addr, "localhost peer reachable, pinning connections to it");
                state.localhost_only = true;
                state.config.max_connections = 1;
                state.addr_backoff.clear();
                state.addr_backoff.insert(addr, AddrBackoff::fresh());
            }
            GroupCommand::Tick => {
                run_connection_scheduler(&mut state).await;
                expire_broadcasts(&mut state);
            }
        }
    }
}

async fn handle_peer_event(state: &mut GroupState, event: PeerEvent) {
    match &event {
        PeerEvent::Ready { id, best_height, services } => {
            let _ = services;
            info!(peer = id.0, best_height, "peer ready");
            maybe_elect_download_peer(state, *id, *best_height);
            let count = state.peers.len();
            if let Some(peer) = state.peers.get(id) {
                let _ = state.events_tx.send(NodeEvent::PeerConnected {
                    addr: peer.handle.addr,
                    peer_count: count,
                });
                if let Some(filter) = &state.current_filter {
                    let handle = peer.handle.clone();
                    let msg = filter_load_message(filter);
                    tokio::spawn(async move {
                        handle.send(msg).await;
                        handle.send(NetworkMessage::MemPool(MemPoolMessage)).await;
                    });
                }
            }
        }
        PeerEvent::Message { id, message } => handle_inventory_message(state, *id, message.clone()),
        PeerEvent::Disconnected { id, error } => {
            if let Some(peer) = state.peers.remove(id) {
                if let Some(err) = error {
                    warn!(peer = id.0, %err, "peer disconnected");
                }
                let count = state.peers.len();
                let _ = state.events_tx.send(NodeEvent::PeerDisconnected {
                    addr: peer.handle.addr,
                    peer_count: count,
                });
            }
            if state.download_peer == Some(*id) {
                state.download_peer = None;
                re_elect_download_peer(state);
            }
        }
    }
    let _ = state.downloader_tx.send(event).await;
}

fn maybe_elect_download_peer(state: &mut GroupState, id: PeerId, best_height: i32) {
    if state.download_peer.is_none() || best_height > state.highest_best_height_seen {
        state.highest_best_height_seen = state.highest_best_height_seen.max(best_height);
        state.download_peer = Some(id);
    }
}

fn re_elect_download_peer(state: &mut GroupState) {
    // First-connected among peers at the highest known best_height.
    let best = state
        .peers
        .iter()
        .filter(|(_, p)| p.handle.best_height() >= state.highest_best_height_seen)
        .min_by_key(|(_, p)| p.connected_at);
    state.download_peer = best.map(|(id, _)| *id);
}

fn handle_inventory_message(state: &mut GroupState, from: PeerId, message: NetworkMessage) {
    match message {
        NetworkMessage::Inv(inv) => {
            for item in inv.items {
                match item.kind {
                    InventoryKind::Tx | InventoryKind::WitnessTx => {
                        bump_confidence(state, from, item.hash);
                        resolve_broadcast(state, item.hash);
                        if !state.pending_tx.contains_key(&item.hash) {
                            state.pending_tx.insert(item.hash, from);
                            request_item(state, from, item);
                        }
                    }
                    InventoryKind::Block | InventoryKind::WitnessBlock | InventoryKind::FilteredBlock => {
                        if Some(from) == state.download_peer {
                            request_item(state, from, item);
                        } else {
                            // Not acted on (no GetData), but the announcement
                            // still means this peer's tip has advanced past
                            // whatever height we last recorded for it; fold
                            // that into best_height and let election re-run.
                            if let Some(peer) = state.peers.get(&from) {
                                let advanced = peer.handle.best_height() + 1;
                                peer.handle.set_best_height(advanced);
                                maybe_elect_download_peer(state, from, advanced);
                            }
                        }
                    }
                }
                // Block/FilteredBlock outstanding-count is the downloader's
                // concern (it tracks a bounded `pending` queue per round);
                // the group only tracks and caps its own tx GetData fetches.
            }
        }
        NetworkMessage::Tx(tx_msg) => {
            let txid = tx_msg.tx.txid();
            bump_confidence(state, from, txid);
            resolve_broadcast(state, txid);
            if let Some(owner) = state.pending_tx.remove(&txid) {
                release_getdata_slot(state, owner);
            }
            if let Some(peer) = state.peers.get(&from) {
                let _ = state.events_tx.send(NodeEvent::TransactionSeen {
                    peer: peer.handle.addr,
                    tx: Box::new(tx_msg.tx),
                });
            }
        }
        NetworkMessage::NotFound(nf) => {
            for item in nf.items {
                if let Some(owner) = state.pending_tx.remove(&item.hash) {
                    release_getdata_slot(state, owner);
                }
            }
        }
        _ => {}
    }
}

fn bump_confidence(state: &mut GroupState, from: PeerId, txid: Hash256) {
    let announcers = state.confidence.entry(txid).or_default();
    let before = announcers.len();
    announcers.insert(from);
    if announcers.len() > before {
        let _ = state.events_tx.send(NodeEvent::ConfidenceChanged {
            txid,
            broadcast_peers: announcers.len(),
        });
    }
}

fn request_item(state: &mut GroupState, from: PeerId, item: InventoryItem) {
    if let Some(peer) = state.peers.get_mut(&from) {
        if peer.pending_getdata >= MAX_OUTSTANDING_GETDATA_PER_PEER {
            return;
        }
        peer.pending_getdata += 1;
        let handle = peer.handle.clone();
        tokio::spawn(async move {
            handle
                .send(NetworkMessage::GetData(crate::network::messages::GetDataMessage {
                    items: vec![item],
                }))
                .await;
        });
    }
}

/// Release one outstanding-`GetData` slot for `peer`, e.g. once its reply
/// (`Tx` or `NotFound`) has arrived.
fn release_getdata_slot(state: &mut GroupState, peer: PeerId) {
    if let Some(p) = state.peers.get_mut(&peer) {
        p.pending_getdata = p.pending_getdata.saturating_sub(1);
    }
}

async fn handle_broadcast(state: &mut GroupState, tx: Transaction, reply: oneshot::Sender<BroadcastOutcome>) {
    if state.peers.is_empty() {
        let _ = reply.send(BroadcastOutcome::NoPeers);
        return;
    }
    let target = (state.peers.len() + 1) / 2;
    let txid = tx.txid();
    let mut sent = 0;
    for peer in state.peers.values().take(target) {
        let handle = peer.handle.clone();
        let msg = NetworkMessage::Tx(crate::network::messages::TxMessage { tx: tx.clone() });
        handle.send(msg).await;
        sent += 1;
    }
    if sent == 0 {
        let _ = reply.send(BroadcastOutcome::NoPeers);
        return;
    }
    // Resolved later: `Relayed` from `resolve_broadcast` once any peer echoes
    // the txid back via `Inv(Tx)`/`Tx`, or `Timeout` from `expire_broadcasts`.
    state.pending_broadcasts.insert(
        txid,
        PendingBroadcast {
            reply,
            deadline: Instant::now() + BROADCAST_ECHO_TIMEOUT,
        },
    );
}

/// Resolve a pending `broadcast(tx)` as `Relayed` once `txid` is echoed back
/// by any peer. A no-op if nothing is broadcasting that txid.
fn resolve_broadcast(state: &mut GroupState, txid: Hash256) {
    if let Some(pending) = state.pending_broadcasts.remove(&txid) {
        let _ = pending.reply.send(BroadcastOutcome::Relayed);
    }
}

/// Fail any pending broadcasts whose echo deadline has passed.
fn expire_broadcasts(state: &mut GroupState) {
    let now = Instant::now();
    let expired: Vec<Hash256> = state
        .pending_broadcasts
        .iter()
        .filter(|(_, pending)| pending.deadline <= now)
        .map(|(txid, _)| *txid)
        .collect();
    for txid in expired {
        if let Some(pending) = state.pending_broadcasts.remove(&txid) {
            let _ = pending.reply.send(BroadcastOutcome::Timeout);
        }
    }
}

async fn handle_recompute_filter(state: &mut GroupState, filter: BloomFilter, rebroadcast: bool) {
    state.current_filter = Some(filter.clone());
    let _ = state.events_tx.send(NodeEvent::FilterRecomputed { rebroadcast });
    if !rebroadcast {
        return;
    }
    let msg = filter_load_message(&filter);
    for peer in state.peers.values() {
        let handle = peer.handle.clone();
        let msg = msg.clone();
        tokio::spawn(async move {
            handle.send(msg).await;
            handle.send(NetworkMessage::MemPool(MemPoolMessage)).await;
        });
    }
}

fn filter_load_message(filter: &BloomFilter) -> NetworkMessage {
    NetworkMessage::FilterLoad(FilterLoadMessage {
        filter: filter.bits().to_vec(),
        hash_funcs: filter.hash_funcs(),
        tweak: filter.tweak(),
        flags: filter.update_flag().to_byte(),
    })
}

async fn run_connection_scheduler(state: &mut GroupState) {
    if state.localhost_only {
        let pinned_addr = state.addr_backoff.keys().next().copied();
        let stray: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, p)| Some(p.handle.addr) != pinned_addr)
            .map(|(id, _)| *id)
            .collect();
        for id in stray {
            // Dropping the handle drops its outbound sender; the peer task's
            // `outbound_rx.recv()` then observes channel closure and exits,
            // tearing down the TCP connection.
            state.peers.remove(&id);
        }
    }

    for (id, peer) in state.peers.iter() {
        if peer.handle.state() == PeerState::Disconnected {
            let _ = state.command_tx.send(GroupCommand::PeerEvent(PeerEvent::Disconnected {
                id: *id,
                error: None,
            })).await;
        }
        if peer.handle.score() <= SCORE_DISCONNECT_THRESHOLD {
            warn!(peer = id.0, "peer score below threshold, disconnecting");
        }
    }

    if state.peers.len() >= state.config.max_connections {
        return;
    }

    let now = Instant::now();
    let candidate = state
        .addr_backoff
        .iter()
        .filter(|(addr, b)| b.next_attempt <= now && !is_connected(state, addr))
        .min_by_key(|(_, b)| b.next_attempt)
        .map(|(addr, _)| *addr);

    if let Some(addr) = candidate {
        attempt_connect(state, addr).await;
    }
}

fn is_connected(state: &GroupState, addr: &SocketAddr) -> bool {
    state.peers.values().any(|p| p.handle.addr == *addr)
}

async fn attempt_connect(state: &mut GroupState, addr: SocketAddr) {
    let backoff = state.addr_backoff.entry(addr).or_insert_with(AddrBackoff::fresh);
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            backoff.on_success();
            let (peer_events_tx, mut peer_events_rx) = mpsc::channel(64);
            let (handle, _join) = run_peer(
                stream,
                addr,
                state.params.clone(),
                state.my_best_height,
                state.config.connect_timeout(),
                state.config.ping_interval(),
                peer_events_tx,
            )
            .await;

            state.peers.insert(
                handle.id,
                ConnectedPeer {
                    handle,
                    connected_at: Instant::now(),
                    pending_getdata: 0,
                },
            );

            let command_tx = state.command_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = peer_events_rx.recv().await {
                    if command_tx.send(GroupCommand::PeerEvent(event)).await.is_err() {
                        break;
                    }
                }
            });
        }
        Err(error) => {
            backoff.on_failure();
            warn!(%addr, %error, "connection attempt failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> GroupState {
        let (events_tx, _) = tokio::sync::broadcast::channel(16);
        let (downloader_tx, _) = mpsc::channel(16);
        let (command_tx, _) = mpsc::channel(16);
        GroupState {
            params: crate::config::NetworkParameters::mainnet(),
            config: crate::config::NodeConfig::default(),
            peers: HashMap::new(),
            addr_backoff: HashMap::new(),
            download_peer: None,
            highest_best_height_seen: 0,
            pending_tx: HashMap::new(),
            confidence: HashMap::new(),
            pending_broadcasts: HashMap::new(),
            current_filter: None,
            events_tx,
            downloader_tx,
            command_tx,
            my_best_height: 0,
            localhost_only: false,
        }
    }

    fn insert_test_peer(state: &mut GroupState) -> PeerId {
        let (handle, mut outbound_rx) = PeerHandle::new_for_test("127.0.0.1:8333".parse().unwrap());
        let id = handle.id;
        // Drain the channel so `send` doesn't block the test on a full buffer.
        tokio::spawn(async move { while outbound_rx.recv().await.is_some() {} });
        state.peers.insert(
            id,
            ConnectedPeer {
                handle,
                connected_at: Instant::now(),
                pending_getdata: 0,
            },
        );
        id
    }

    #[tokio::test]
    async fn request_item_increments_and_caps_pending_getdata() {
        let mut state = test_state();
        let id = insert_test_peer(&mut state);
        for _ in 0..MAX_OUTSTANDING_GETDATA_PER_PEER + 5 {
            request_item(&mut state, id, InventoryItem { kind: InventoryKind::Tx, hash: Hash256([1u8; 32]) });
        }
        assert_eq!(state.peers[&id].pending_getdata, MAX_OUTSTANDING_GETDATA_PER_PEER);
    }

    #[tokio::test]
    async fn tx_arrival_clears_pending_tx_and_releases_slot() {
        let mut state = test_state();
        let id = insert_test_peer(&mut state);
        let tx = Transaction { payload: vec![9, 9, 9] };
        let txid = tx.txid();

        handle_inventory_message(
            &mut state,
            id,
            NetworkMessage::Inv(crate::network::messages::InvMessage {
                items: vec![InventoryItem { kind: InventoryKind::Tx, hash: txid }],
            }),
        );
        assert_eq!(state.peers[&id].pending_getdata, 1);
        assert!(state.pending_tx.contains_key(&txid));

        handle_inventory_message(
            &mut state,
            id,
            NetworkMessage::Tx(crate::network::messages::TxMessage { tx }),
        );
        assert_eq!(state.peers[&id].pending_getdata, 0);
        assert!(!state.pending_tx.contains_key(&txid));
    }

    #[test]
    fn addr_backoff_doubles_and_caps() {
        let mut b = AddrBackoff::fresh();
        let first = b.interval;
        b.on_failure();
        assert!(b.interval > first);
        for _ in 0..20 {
            b.on_failure();
        }
        assert!(b.interval <= Duration::from_secs(900));
    }

    #[tokio::test]
    async fn localhost_only_drops_non_pinned_peers() {
        let mut state = test_state();
        let pinned_addr: SocketAddr = "127.0.0.1:8333".parse().unwrap();
        let stray_addr: SocketAddr = "203.0.113.5:8333".parse().unwrap();

        let stray_id = {
            let (handle, mut rx) = PeerHandle::new_for_test(stray_addr);
            let id = handle.id;
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
            state.peers.insert(id, ConnectedPeer { handle, connected_at: Instant::now(), pending_getdata: 0 });
            id
        };
        let pinned_id = {
            let (handle, mut rx) = PeerHandle::new_for_test(pinned_addr);
            let id = handle.id;
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
            state.peers.insert(id, ConnectedPeer { handle, connected_at: Instant::now(), pending_getdata: 0 });
            id
        };

        state.localhost_only = true;
        state.addr_backoff.insert(pinned_addr, AddrBackoff::fresh());
        state.config.max_connections = 1;

        run_connection_scheduler(&mut state).await;

        assert!(!state.peers.contains_key(&stray_id));
        assert!(state.peers.contains_key(&pinned_id));
    }

    #[tokio::test]
    async fn non_download_peer_block_inv_advances_best_height_and_can_elect() {
        let mut state = test_state();
        let download_id = insert_test_peer(&mut state);
        let other_id = insert_test_peer(&mut state);
        state.download_peer = Some(download_id);
        state.highest_best_height_seen = 0;

        assert_eq!(state.peers[&other_id].handle.best_height(), 0);

        handle_inventory_message(
            &mut state,
            other_id,
            NetworkMessage::Inv(crate::network::messages::InvMessage {
                items: vec![InventoryItem { kind: InventoryKind::Block, hash: Hash256([7u8; 32]) }],
            }),
        );

        assert_eq!(state.peers[&other_id].handle.best_height(), 1);
        assert_eq!(state.download_peer, Some(other_id));
    }

    #[tokio::test]
    async fn broadcast_resolves_relayed_when_a_peer_echoes_the_tx() {
        let mut state = test_state();
        let _sender_id = insert_test_peer(&mut state);
        let echoer_id = insert_test_peer(&mut state);
        let tx = Transaction { payload: vec![4, 2] };
        let txid = tx.txid();

        let (reply, reply_rx) = oneshot::channel();
        handle_broadcast(&mut state, tx.clone(), reply).await;
        assert!(state.pending_broadcasts.contains_key(&txid));

        handle_inventory_message(
            &mut state,
            echoer_id,
            NetworkMessage::Tx(crate::network::messages::TxMessage { tx }),
        );

        assert!(!state.pending_broadcasts.contains_key(&txid));
        assert!(matches!(reply_rx.await.unwrap(), BroadcastOutcome::Relayed));
    }

    #[tokio::test]
    async fn broadcast_times_out_without_an_echo() {
        let mut state = test_state();
        insert_test_peer(&mut state);
        let tx = Transaction { payload: vec![1, 3, 5] };
        let txid = tx.txid();

        let (reply, reply_rx) = oneshot::channel();
        handle_broadcast(&mut state, tx, reply).await;
        // Force the deadline into the past instead of sleeping in the test.
        state.pending_broadcasts.get_mut(&txid).unwrap().deadline =
            Instant::now() - Duration::from_secs(1);

        expire_broadcasts(&mut state);

        assert!(!state.pending_broadcasts.contains_key(&txid));
        assert!(matches!(reply_rx.await.unwrap(), BroadcastOutcome::Timeout));
    }
}
