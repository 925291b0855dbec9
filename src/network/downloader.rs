//! Chain downloader: drives the elected download peer through
//! `GetBlocks` -> `Inv` -> `GetData` -> `Block`/`MerkleBlock` exchanges,
//! assembling filtered blocks from their matched-transaction stream and
//! recovering from Bloom-filter key exhaustion by discarding the stale
//! batch and restarting one block earlier.
//!
//! Wallet key management is out of scope here; the "lookahead threshold
//! crossed" signal the sync algorithm reacts to is abstracted behind
//! `FilterWatcher` so this module stays decoupled from wallet internals.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::chain::header::{BlockHeader, Hash256, Transaction};
use crate::chain::merkle::merkle_root;
use crate::chain::store::ChainStore;
use crate::chain::validator::{accept_header, build_locator};
use crate::config::NetworkParameters;
use crate::events::NodeEvent;
use crate::network::bloom::BloomFilter;
use crate::network::group::PeerGroupHandle;
use crate::network::messages::{
    GetBlocksMessage, GetDataMessage, InventoryItem, InventoryKind, NetworkMessage,
};
use crate::network::peer::{PeerEvent, PeerId};

const GETBLOCKS_PROTOCOL_VERSION: u32 = crate::network::messages::PROTOCOL_VERSION;
const MISBEHAVIOR_SCORE: i32 = 20;

/// Decouples the downloader's key-exhaustion recovery path from wallet
/// internals: the wallet (or, in tests, a stub) observes each matched
/// transaction and decides when the current filter has gone stale.
pub trait FilterWatcher: Send + Sync {
    fn observe_match(&self, tx: &Transaction);
    fn lookahead_exhausted(&self) -> bool;
    fn recompute(&self) -> BloomFilter;
}

/// A watcher for nodes that never install a Bloom filter (full-block sync):
/// matches never happen and exhaustion never fires.
pub struct NullFilterWatcher;

impl FilterWatcher for NullFilterWatcher {
    fn observe_match(&self, _tx: &Transaction) {}
    fn lookahead_exhausted(&self) -> bool {
        false
    }
    fn recompute(&self) -> BloomFilter {
        BloomFilter::new(0, 0.0001, 0, crate::network::bloom::BloomUpdateFlag::None)
    }
}

struct PendingBlock {
    hash: Hash256,
    header: Option<BlockHeader>,
    matched_remaining: HashSet<Hash256>,
    collected: Vec<Transaction>,
}

impl PendingBlock {
    fn new(hash: Hash256) -> Self {
        Self {
            hash,
            header: None,
            matched_remaining: HashSet::new(),
            collected: Vec::new(),
        }
    }
}

/// Outcome of driving one `GetBlocks` round to completion, telling the
/// caller where to resume.
enum RoundOutcome {
    /// The peer's latest `Inv` contained nothing new: sync is caught up.
    CaughtUp,
    /// The batch finished; resume from the new chain head.
    Advance,
    /// A stale filter forced a discard; resume from this block's parent.
    Exhausted(Hash256),
    /// The download peer went away or misbehaved; resume from current head
    /// once a new one is elected.
    PeerLost,
}

pub struct Downloader<S: ChainStore + ?Sized> {
    store: Arc<S>,
    params: NetworkParameters,
    group: PeerGroupHandle,
    watcher: Arc<dyn FilterWatcher>,
    events_tx: broadcast::Sender<NodeEvent>,
    spv_mode: bool,
    /// Earliest wallet-key creation time minus a lookback margin (`config`'s
    /// `fast_catchup_time_secs`): headers older than this are fetched
    /// header-only (`GetHeaders`), since no wallet key could have received a
    /// payment before it existed. Once a round's parent crosses this time,
    /// the downloader switches to fetching full/filtered blocks.
    fast_catchup_time: u32,
}

impl<S: ChainStore + ?Sized + 'static> Downloader<S> {
    pub fn new(
        store: Arc<S>,
        params: NetworkParameters,
        group: PeerGroupHandle,
        watcher: Arc<dyn FilterWatcher>,
        events_tx: broadcast::Sender<NodeEvent>,
        spv_mode: bool,
        fast_catchup_time: u32,
    ) -> Self {
        Self {
            store,
            params,
            group,
            watcher,
            events_tx,
            spv_mode,
            fast_catchup_time,
        }
    }

    /// Run the sync loop until `peer_events_rx` closes (the node is
    /// shutting down). Never returns an error: peer misbehaviour and store
    /// errors are handled by scoring the peer down and retrying, not by
    /// tearing down the downloader.
    pub async fn run(mut self, mut peer_events_rx: mpsc::Receiver<PeerEvent>) {
        let mut from = self.store.head().hash();
        loop {
            match self.run_round(&mut peer_events_rx, from).await {
                // Caught up: the next round's GetBlocks will simply confirm
                // it again, gated on whatever event wakes the loop next
                // (new block inv, tx relay, peer churn); cheap enough that
                // no separate idle-wait state is needed.
                Some(RoundOutcome::CaughtUp) => {
                    debug!("chain download caught up with peer");
                    from = self.store.head().hash();
                }
                Some(RoundOutcome::Advance) => from = self.store.head().hash(),
                Some(RoundOutcome::Exhausted(restart_from)) => from = restart_from,
                Some(RoundOutcome::PeerLost) => from = self.store.head().hash(),
                None => return,
            }
        }
    }

    async fn run_round(
        &mut self,
        peer_events_rx: &mut mpsc::Receiver<PeerEvent>,
        from: Hash256,
    ) -> Option<RoundOutcome> {
        let before_catchup = self.fast_catchup_time > 0
            && self
                .store
                .get(&from)
                .map(|sb| sb.header.time < self.fast_catchup_time)
                .unwrap_or(false);
        if before_catchup {
            return self.run_headers_round(peer_events_rx, from).await;
        }

        let locator = match build_locator(self.store.as_ref(), &from) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "could not build locator, retrying from store head");
                vec![self.store.head().hash()]
            }
        };

        let download_peer = self.group.download_peer_id().await?;
        self.group
            .send_to_download_peer(NetworkMessage::GetBlocks(GetBlocksMessage {
                version: GETBLOCKS_PROTOCOL_VERSION,
                locator_hashes: locator,
                stop_hash: Hash256::ZERO,
            }))
            .await;
        let _ = self.events_tx.send(NodeEvent::ChainDownloadStarted {
            peer: "0.0.0.0:0".parse().unwrap(),
            height: self.store.head().height,
        });

        let mut pending: VecDeque<PendingBlock> = VecDeque::new();
        let mut requested_any = false;

        loop {
            let event = peer_events_rx.recv().await?;
            match event {
                PeerEvent::Message { id, message } if id == download_peer => {
                    match message {
                        NetworkMessage::Inv(inv) => {
                            let new_hashes: Vec<Hash256> = inv
                                .items
                                .iter()
                                .filter(|it| {
                                    matches!(
                                        it.kind,
                                        InventoryKind::Block
                                            | InventoryKind::WitnessBlock
                                            | InventoryKind::FilteredBlock
                                    )
                                })
                                .map(|it| it.hash)
                                .filter(|h| !self.store.contains(h))
                                .collect();

                            if new_hashes.is_empty() && !requested_any {
                                return Some(RoundOutcome::CaughtUp);
                            }
                            if new_hashes.is_empty() {
                                continue;
                            }
                            requested_any = true;
                            let kind = if self.spv_mode {
                                InventoryKind::FilteredBlock
                            } else {
                                InventoryKind::Block
                            };
                            for hash in &new_hashes {
                                pending.push_back(PendingBlock::new(*hash));
                            }
                            let items = new_hashes.into_iter().map(|hash| InventoryItem { kind, hash }).collect();
                            self.group
                                .send_to_download_peer(NetworkMessage::GetData(GetDataMessage { items }))
                                .await;
                        }

                        NetworkMessage::MerkleBlock(mb) => {
                            let hash = mb.header.block_hash();
                            let Some(slot) = pending.iter_mut().find(|p| p.hash == hash) else {
                                continue;
                            };
                            match mb.partial_tree.extract_matches() {
                                Ok((root, matched)) if root == mb.header.merkle_root => {
                                    slot.header = Some(mb.header);
                                    slot.matched_remaining = matched.into_iter().collect();
                                    if slot.matched_remaining.is_empty() {
                                        if let Some(outcome) = self.drain_and_finalize(&mut pending, download_peer).await {
                                            return Some(outcome);
                                        }
                                    }
                                }
                                Ok(_) => {
                                    warn!(peer = download_peer.0, "partial merkle tree root does not match header");
                                    self.group.score_down_peer(download_peer, MISBEHAVIOR_SCORE).await;
                                    return Some(RoundOutcome::PeerLost);
                                }
                                Err(e) => {
                                    warn!(peer = download_peer.0, error = %e, "invalid partial merkle tree");
                                    self.group.score_down_peer(download_peer, MISBEHAVIOR_SCORE).await;
                                    return Some(RoundOutcome::PeerLost);
                                }
                            }
                        }

                        NetworkMessage::Tx(txm) => {
                            let txid = txm.tx.txid();
                            let Some(slot) = pending.front_mut() else { continue };
                            if !slot.matched_remaining.remove(&txid) {
                                continue;
                            }
                            self.watcher.observe_match(&txm.tx);
                            slot.collected.push(txm.tx);

                            if self.watcher.lookahead_exhausted() {
                                let restart_from = slot.header.map(|h| h.prev_hash).unwrap_or(from);
                                return Some(self.handle_exhaustion(restart_from).await);
                            }
                            if slot.matched_remaining.is_empty() {
                                if let Some(outcome) = self.drain_and_finalize(&mut pending, download_peer).await {
                                    return Some(outcome);
                                }
                            }
                        }

                        NetworkMessage::Block(bm) => {
                            let hash = bm.header.block_hash();
                            if pending.front().map(|p| p.hash) != Some(hash) {
                                continue;
                            }
                            let txids: Vec<Hash256> = bm.transactions.iter().map(|tx| tx.txid()).collect();
                            let computed = merkle_root(&txids);
                            if computed != Ok(bm.header.merkle_root) {
                                warn!(peer = download_peer.0, "block merkle root does not match transactions");
                                self.group.score_down_peer(download_peer, MISBEHAVIOR_SCORE).await;
                                return Some(RoundOutcome::PeerLost);
                            }
                            pending.pop_front();
                            match self.finalize_header(&bm.header, download_peer).await {
                                Ok(true) => {}
                                Ok(false) => continue,
                                Err(outcome) => return Some(outcome),
                            }
                        }

                        NetworkMessage::NotFound(nf) => {
                            let missing: HashSet<Hash256> = nf.items.iter().map(|i| i.hash).collect();
                            pending.retain(|p| !missing.contains(&p.hash));
                        }

                        _ => {}
                    }

                    if requested_any && pending.is_empty() {
                        return Some(RoundOutcome::Advance);
                    }
                }

                PeerEvent::Disconnected { id, .. } if id == download_peer => {
                    return Some(RoundOutcome::PeerLost);
                }

                _ => {}
            }
        }
    }

    /// Before `fast_catchup_time`, no wallet key could have received a
    /// payment yet, so there is nothing a filtered or full block could match:
    /// fetch bare headers with `GetHeaders` instead of paying for block
    /// bodies. Each returned header is validated and stored exactly as a
    /// block header would be; once any of them crosses the catchup boundary,
    /// the next round switches to the normal block-fetch path.
    async fn run_headers_round(
        &mut self,
        peer_events_rx: &mut mpsc::Receiver<PeerEvent>,
        from: Hash256,
    ) -> Option<RoundOutcome> {
        let locator = match build_locator(self.store.as_ref(), &from) {
            Ok(l) => l,
            Err(_) => vec![self.store.head().hash()],
        };
        let download_peer = self.group.download_peer_id().await?;
        self.group
            .send_to_download_peer(NetworkMessage::GetHeaders(
                crate::network::messages::GetHeadersMessage {
                    version: GETBLOCKS_PROTOCOL_VERSION,
                    locator_hashes: locator,
                    stop_hash: Hash256::ZERO,
                },
            ))
            .await;

        loop {
            let event = peer_events_rx.recv().await?;
            match event {
                PeerEvent::Message { id, message } if id == download_peer => match message {
                    NetworkMessage::Headers(headers) => {
                        if headers.headers.is_empty() {
                            return Some(RoundOutcome::CaughtUp);
                        }
                        for header in &headers.headers {
                            match self.finalize_header(header, download_peer).await {
                                Ok(_) => {}
                                Err(outcome) => return Some(outcome),
                            }
                        }
                        return Some(RoundOutcome::Advance);
                    }
                    _ => {}
                },
                PeerEvent::Disconnected { id, .. } if id == download_peer => {
                    return Some(RoundOutcome::PeerLost);
                }
                _ => {}
            }
        }
    }

    /// Once a filtered block's matched-tx stream is complete, validate and
    /// store its header and check for key exhaustion one more time (a block
    /// with zero matches can still cross the threshold via an earlier tx in
    /// the same batch).
    async fn drain_and_finalize(
        &mut self,
        pending: &mut VecDeque<PendingBlock>,
        download_peer: PeerId,
    ) -> Option<RoundOutcome> {
        let slot = pending.pop_front()?;
        let header = slot.header?;
        match self.finalize_header(&header, download_peer).await {
            Ok(_) => None,
            Err(outcome) => Some(outcome),
        }
    }

    async fn handle_exhaustion(&mut self, restart_from: Hash256) -> RoundOutcome {
        info!("bloom filter lookahead exhausted, discarding batch and recomputing");
        let filter = self.watcher.recompute();
        self.group.recompute_filter(filter, true).await;
        RoundOutcome::Exhausted(restart_from)
    }

    /// Validate `header` against its stored parent, persist it, and advance
    /// the head if its chain work exceeds the current tip's. Returns
    /// `Ok(true)` on success, `Ok(false)` if the header was a duplicate
    /// (benign, e.g. a block seen twice), or `Err(RoundOutcome::PeerLost)` on
    /// a validation failure that scores the peer down.
    async fn finalize_header(&mut self, header: &BlockHeader, from: PeerId) -> Result<bool, RoundOutcome> {
        if self.store.contains(&header.block_hash()) {
            return Ok(false);
        }
        let prev = match self.store.get(&header.prev_hash) {
            Ok(prev) => prev,
            Err(e) => {
                warn!(peer = from.0, error = %e, "header's parent is unknown");
                self.group.score_down_peer(from, MISBEHAVIOR_SCORE).await;
                return Err(RoundOutcome::PeerLost);
            }
        };

        let stored = match accept_header(self.store.as_ref(), &self.params, &prev, header) {
            Ok(sb) => sb,
            Err(e) => {
                warn!(peer = from.0, error = %e, "header rejected by validator");
                self.group.score_down_peer(from, MISBEHAVIOR_SCORE).await;
                return Err(RoundOutcome::PeerLost);
            }
        };

        let old_head = self.store.head();
        let hash = stored.hash();
        let work = stored.cumulative_work.clone();
        if let Err(e) = self.store.put(stored) {
            warn!(error = %e, "failed to store accepted header");
            return Err(RoundOutcome::PeerLost);
        }

        if work > old_head.cumulative_work {
            let common_ancestor = self
                .store
                .find_fork_point(&old_head.hash(), &hash)
                .unwrap_or(old_head.clone());
            let _ = self.store.set_head(&hash);
            if common_ancestor.hash() != old_head.hash() {
                let _ = self.events_tx.send(NodeEvent::ReorgOccurred {
                    old_head: old_head.hash(),
                    new_head: hash,
                    common_ancestor: common_ancestor.hash(),
                });
            }
        }

        let _ = self.events_tx.send(NodeEvent::BlockDownloaded {
            peer: "0.0.0.0:0".parse().unwrap(),
            block: Box::new(self.store.get(&hash).expect("just stored")),
            blocks_left: 0,
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysExhaustedWatcher;
    impl FilterWatcher for AlwaysExhaustedWatcher {
        fn observe_match(&self, _tx: &Transaction) {}
        fn lookahead_exhausted(&self) -> bool {
            true
        }
        fn recompute(&self) -> BloomFilter {
            BloomFilter::new(10, 0.001, 1, crate::network::bloom::BloomUpdateFlag::All)
        }
    }

    #[test]
    fn null_watcher_never_exhausts() {
        let w = NullFilterWatcher;
        w.observe_match(&Transaction { payload: vec![] });
        assert!(!w.lookahead_exhausted());
    }

    #[test]
    fn stub_watcher_reports_exhaustion_immediately() {
        let w = AlwaysExhaustedWatcher;
        assert!(w.lookahead_exhausted());
        let f = w.recompute();
        assert_eq!(f.hash_funcs() > 0, true);
    }
}
