//! End-to-end sync scenarios against in-memory collaborators.
//!
//! Each test drives a [`SyncManager`] through the events a real node would
//! see and checks the requests, disconnects and chain state that result.
//!
//! [`SyncManager`]: tarn_netsync::SyncManager

use std::time::Duration;

use tarn_core::chaincfg::{ChainParams, Checkpoint};
use tarn_core::types::{Block, InvType, InvVect};
use tarn_netsync::{BlockVerdict, SyncAction, SyncConfig, SyncEvent, SyncMode};
use tarn_tests::helpers::*;

// ---------------------------------------------------------------------------
// Headers-first sync and checkpoints
// ---------------------------------------------------------------------------

fn forged_fork(real: &[Block], fork_height: u64, len: usize) -> Vec<Block> {
    let keep = (fork_height - 1) as usize;
    let mut forged = real[..keep].to_vec();
    forged.extend(build_chain(real[keep - 1].hash(), fork_height, len, 0xF0));
    forged
}

/// A sync peer presenting a forged header at a checkpoint height is
/// rejected; a new peer is selected and sync restarts from genesis.
#[test]
fn checkpoint_forgery_rejects_sync_peer_and_resumes_from_genesis() {
    let base = ChainParams::regtest();
    let real = build_chain(base.genesis_hash(), 1, 500, 1);
    let forged = forged_fork(&real, 100, 401);
    assert_eq!(forged.len(), 500);
    assert_ne!(forged[99].hash(), real[99].hash());

    let params = base
        .with_checkpoints(vec![Checkpoint { height: 100, hash: real[99].hash() }])
        .unwrap()
        .with_max_headers_per_msg(200);
    let mut node = TestNode::new(params, SyncConfig::regtest());
    let genesis = node.genesis();

    let (liar, actions) = node.connect(500, true);
    assert_eq!(header_requests(&actions), vec![(liar, vec![genesis])]);
    let (honest, actions) = node.connect(500, true);
    assert!(actions.is_empty());
    assert_eq!(node.manager.sync_peer(), Some(liar));

    // The forged page carries valid proof of work but the wrong hash at 100.
    let actions = node.send(SyncEvent::Headers { peer: liar, headers: headers_of(&forged[..200]) });
    assert_eq!(disconnects(&actions), vec![(liar, "bad_headers")]);
    assert_eq!(header_requests(&actions), vec![(honest, vec![genesis])]);
    assert!(node.manager.is_rejected(&liar));
    assert_eq!(node.manager.header_sync().tip().height, 0);
    assert_eq!(node.manager.best().height, 0);

    // Honest peer pages through the real chain.
    let actions = node.send(SyncEvent::Headers { peer: honest, headers: headers_of(&real[..200]) });
    assert_eq!(header_requests(&actions), vec![(honest, vec![real[199].hash()])]);
    let actions = node.send(SyncEvent::Headers { peer: honest, headers: headers_of(&real[200..400]) });
    assert_eq!(header_requests(&actions), vec![(honest, vec![real[399].hash()])]);
    let actions = node.send(SyncEvent::Headers { peer: honest, headers: headers_of(&real[400..]) });
    assert_eq!(node.manager.mode(), SyncMode::BlocksSync);
    assert!(node.manager.header_sync().next_checkpoint().is_none());

    let rest = node.serve_blocks(honest, &real, actions);
    assert!(disconnects(&rest).is_empty());
    assert_eq!(node.manager.mode(), SyncMode::Synced);
    assert_eq!(node.manager.best().height, 500);
    assert_eq!(node.deps.chain.connected_heights(), (1..=500).collect::<Vec<_>>());

    let stats = node.manager.stats();
    assert_eq!(stats.disconnects_for("bad_headers"), 1);
    assert_eq!(stats.headers_accepted, 500);
    assert_eq!(stats.blocks_accepted, 500);
}

/// With checkpoints disabled the same forged chain is accepted as headers.
#[test]
fn disabled_checkpoints_accept_any_valid_chain() {
    let base = ChainParams::regtest();
    let real = build_chain(base.genesis_hash(), 1, 120, 1);
    let forged = forged_fork(&real, 100, 21);
    let params = base
        .with_checkpoints(vec![Checkpoint { height: 100, hash: real[99].hash() }])
        .unwrap();
    let config = SyncConfig { disable_checkpoints: true, ..SyncConfig::regtest() };
    let mut node = TestNode::new(params, config);

    let (peer, _) = node.connect(120, true);
    let actions = node.send(SyncEvent::Headers { peer, headers: headers_of(&forged) });
    assert!(disconnects(&actions).is_empty());
    assert_eq!(node.manager.header_sync().tip().hash, forged[119].hash());
}

/// Headers that reach the checkpoint exactly are accepted and the
/// checkpoint pointer advances.
#[test]
fn checkpoint_hit_advances_to_next() {
    let base = ChainParams::regtest();
    let real = build_chain(base.genesis_hash(), 1, 30, 1);
    let params = base
        .with_checkpoints(vec![
            Checkpoint { height: 10, hash: real[9].hash() },
            Checkpoint { height: 25, hash: real[24].hash() },
        ])
        .unwrap()
        .with_max_headers_per_msg(15);
    let mut node = TestNode::new(params, SyncConfig::regtest());
    let (peer, _) = node.connect(30, true);

    node.send(SyncEvent::Headers { peer, headers: headers_of(&real[..15]) });
    assert_eq!(node.manager.header_sync().next_checkpoint().map(|c| c.height), Some(25));
    node.send(SyncEvent::Headers { peer, headers: headers_of(&real[15..30]) });
    assert!(node.manager.header_sync().next_checkpoint().is_none());
    assert_eq!(node.manager.header_sync().tip().height, 30);
}

/// A peer that announces a tall chain but serves no headers loses the sync
/// slot to an honest, shorter peer, which then carries the node to its tip.
#[test]
fn overclaiming_peer_yields_to_honest_peer() {
    let mut node = TestNode::regtest();
    let real = build_chain(node.genesis(), 1, 30, 1);
    let genesis = node.genesis();
    let (liar, _) = node.connect(500, true);
    node.advance(Duration::from_millis(1));
    let (honest, _) = node.connect(30, true);
    assert_eq!(node.manager.sync_peer(), Some(liar));

    let actions = node.send(SyncEvent::Headers { peer: liar, headers: vec![] });
    assert_eq!(header_requests(&actions), vec![(honest, vec![genesis])]);

    let actions = node.send(SyncEvent::Headers { peer: honest, headers: headers_of(&real) });
    assert_eq!(block_requests(&actions).iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![honest]);
    let rest = node.serve_blocks(honest, &real, actions);
    assert!(header_requests(&rest).is_empty());
    assert_eq!(node.manager.mode(), SyncMode::Synced);
    assert_eq!(node.manager.best().height, 30);

    // Nothing left to chase: the liar is never reselected or timed out.
    for _ in 0..30 {
        node.advance(Duration::from_secs(1));
        assert!(node.send(SyncEvent::StallTick).is_empty());
    }
    assert_eq!(node.manager.sync_peer(), None);
}

// ---------------------------------------------------------------------------
// Orphans
// ---------------------------------------------------------------------------

/// B2 arrives before its parent B1; it waits in the orphan pool and is
/// connected when B1 is, without another fetch.
#[test]
fn orphan_promoted_when_parent_arrives() {
    let mut node = TestNode::regtest();
    let (peer, _) = node.connect(0, true);
    assert!(node.manager.is_current());
    let blocks = build_chain(node.genesis(), 1, 2, 1);
    let (b1, b2) = (&blocks[0], &blocks[1]);

    let actions = node.send(SyncEvent::Inv { peer, inventory: vec![InvVect::block(b2.hash())] });
    assert_eq!(block_requests(&actions), vec![(peer, vec![b2.hash()])]);
    let actions = node.send(SyncEvent::Block { peer, block: b2.clone() });
    assert_eq!(
        actions,
        vec![SyncAction::RequestBlockInventory {
            peer,
            locator: vec![node.genesis()],
            stop_hash: b2.hash(),
        }]
    );
    assert!(node.manager.orphans().contains(&b2.hash()));
    assert_eq!(node.manager.best().height, 0);

    node.send(SyncEvent::Inv { peer, inventory: vec![InvVect::block(b1.hash())] });
    let actions = node.send(SyncEvent::Block { peer, block: b1.clone() });
    assert!(block_requests(&actions).is_empty());
    assert_eq!(node.manager.best().height, 2);
    assert_eq!(node.deps.chain.connected_heights(), vec![1, 2]);
    assert!(node.manager.orphans().is_empty());
    assert_eq!(node.manager.stats().orphans_connected, 1);
}

/// A pooled chain of orphans connects transitively once its root's parent
/// is accepted.
#[test]
fn orphan_chain_connects_transitively() {
    let mut node = TestNode::regtest();
    let blocks = build_chain(node.genesis(), 1, 4, 1);

    for block in blocks[1..].iter().rev() {
        let (verdict, actions) = node.manager.process_local_block(block.clone(), node.now);
        assert_eq!(verdict, BlockVerdict::Orphan);
        assert!(actions.is_empty());
    }
    assert_eq!(node.manager.orphans().orphan_root(&blocks[3].hash()), blocks[1].hash());

    let (verdict, _) = node.manager.process_local_block(blocks[0].clone(), node.now);
    assert_eq!(verdict, BlockVerdict::Accepted { height: 1 });
    assert_eq!(node.manager.best().height, 4);
    assert_eq!(node.deps.chain.connected_heights(), vec![1, 2, 3, 4]);
    assert_eq!(*node.deps.fees.blocks.lock(), vec![1, 2, 3, 4]);
}

/// Orphans that never find a parent expire on the sweep.
#[test]
fn stale_orphans_expire() {
    let mut node = TestNode::regtest();
    let blocks = build_chain(node.genesis(), 1, 3, 1);
    node.manager.process_local_block(blocks[2].clone(), node.now);
    node.advance(Duration::from_secs(30));
    node.manager.process_local_block(blocks[1].clone(), node.now);

    node.advance(Duration::from_secs(31));
    node.send(SyncEvent::OrphanSweep);
    assert!(!node.manager.orphans().contains(&blocks[2].hash()));
    assert!(node.manager.orphans().contains(&blocks[1].hash()));
    assert_eq!(node.manager.stats().orphans_expired, 1);
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Two peers announce the same transaction before either fetch completes:
/// only one request goes out.
#[test]
fn duplicate_announcement_fetched_once() {
    let mut node = TestNode::regtest();
    let (a, _) = node.connect(0, true);
    let (b, _) = node.connect(0, true);
    let tx = make_tx(7);
    let inv = InvVect::tx(tx.txid());

    let actions = node.send(SyncEvent::Inv { peer: a, inventory: vec![inv] });
    assert_eq!(tx_requests(&actions), vec![(a, vec![inv.hash])]);
    let actions = node.send(SyncEvent::Inv { peer: b, inventory: vec![inv] });
    assert!(actions.is_empty());
    assert_eq!(node.manager.stats().inv_suppressed, 1);
    assert_eq!(node.manager.peers().owner(InvType::Tx, &inv.hash).map(|e| e.peer), Some(a));

    node.send(SyncEvent::Tx { peer: a, tx: tx.clone() });
    assert_eq!(node.deps.mempool.submissions(), vec![inv.hash]);
    assert_eq!(*node.deps.notifier.announced.lock(), vec![inv.hash]);
    // Both peers already know it: nobody to relay to.
    assert!(node.deps.notifier.relays.lock().is_empty());

    // Now in the mempool; later announcements are ignored.
    assert!(node.send(SyncEvent::Inv { peer: b, inventory: vec![inv] }).is_empty());
    // The second peer never got a request, so its delivery is unsolicited.
    node.send(SyncEvent::Tx { peer: b, tx });
    assert_eq!(node.manager.peers().get(&b).map(|s| s.misbehavior), Some(10));
    assert_eq!(node.deps.mempool.submissions().len(), 1);
}

/// A not-found reply frees the hash for another announcer.
#[test]
fn not_found_lets_another_peer_serve() {
    let mut node = TestNode::regtest();
    let (a, _) = node.connect(0, true);
    let (b, _) = node.connect(0, false);
    let inv = InvVect::tx(make_tx(8).txid());

    node.send(SyncEvent::Inv { peer: a, inventory: vec![inv] });
    node.send(SyncEvent::Inv { peer: b, inventory: vec![inv] });
    node.send(SyncEvent::NotFound { peer: a, inventory: vec![inv] });
    let actions = node.send(SyncEvent::Inv { peer: b, inventory: vec![inv] });
    assert_eq!(tx_requests(&actions), vec![(b, vec![inv.hash])]);
}

/// Rejected transactions are remembered and never fetched again.
#[test]
fn rejected_transaction_not_retried() {
    let mut node = TestNode::regtest();
    let (a, _) = node.connect(0, true);
    let (b, _) = node.connect(0, true);
    let tx = make_tx(9);
    node.deps.mempool.reject(tx.txid());

    node.send(SyncEvent::Inv { peer: a, inventory: vec![InvVect::tx(tx.txid())] });
    node.send(SyncEvent::Tx { peer: a, tx: tx.clone() });
    assert_eq!(node.manager.stats().txns_rejected, 1);

    let actions = node.send(SyncEvent::Inv { peer: b, inventory: vec![InvVect::tx(tx.txid())] });
    assert!(actions.is_empty());
    assert_eq!(node.deps.mempool.submissions().len(), 1);
}

// ---------------------------------------------------------------------------
// Stalls and timeouts
// ---------------------------------------------------------------------------

/// The sync peer stops delivering mid-download; after the stall timeout it
/// is dropped and another candidate resumes from the blocks already
/// connected.
#[test]
fn stalled_sync_peer_replaced_without_losing_height() {
    let config = SyncConfig { request_timeout: Duration::from_secs(60), ..SyncConfig::regtest() };
    let mut node = TestNode::new(ChainParams::regtest(), config);
    let blocks = build_chain(node.genesis(), 1, 100, 1);

    let (slow, _) = node.connect(100, true);
    let actions = node.send(SyncEvent::Headers { peer: slow, headers: headers_of(&blocks) });
    let first_batch = block_requests(&actions);
    assert_eq!(first_batch.len(), 1);
    assert_eq!(first_batch[0].1, hashes_of(&blocks[..16]));
    for block in &blocks[..16] {
        node.send(SyncEvent::Block { peer: slow, block: block.clone() });
    }
    assert_eq!(node.manager.best().height, 16);
    assert_eq!(node.manager.peers().requests_of(&slow, InvType::Block), 16);

    let (fresh, actions) = node.connect(100, true);
    assert!(actions.is_empty());

    node.advance(Duration::from_secs(5));
    assert!(node.send(SyncEvent::StallTick).is_empty());
    node.advance(Duration::from_secs(6));
    let actions = node.send(SyncEvent::StallTick);
    assert_eq!(disconnects(&actions), vec![(slow, "stalled")]);
    assert_eq!(node.manager.sync_peer(), Some(fresh));
    assert!(!node.manager.is_rejected(&slow));
    assert_eq!(node.manager.best().height, 16);
    let requests = header_requests(&actions);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.first(), Some(&blocks[15].hash()));

    let actions = node.send(SyncEvent::Headers { peer: fresh, headers: headers_of(&blocks[16..]) });
    node.serve_blocks(fresh, &blocks, actions);
    assert_eq!(node.manager.best().height, 100);
    assert_eq!(node.manager.mode(), SyncMode::Synced);
    assert_eq!(node.deps.chain.connected_heights(), (1..=100).collect::<Vec<_>>());
    assert_eq!(node.manager.stats().disconnects_for("stalled"), 1);
}

/// An unanswered block request outside initial sync disconnects its owner.
#[test]
fn request_timeout_disconnects_owner() {
    let mut node = TestNode::regtest();
    let (a, _) = node.connect(0, true);
    let block = build_chain(node.genesis(), 1, 1, 1).remove(0);
    node.send(SyncEvent::Inv { peer: a, inventory: vec![InvVect::block(block.hash())] });

    node.advance(Duration::from_secs(6));
    let actions = node.send(SyncEvent::StallTick);
    assert_eq!(disconnects(&actions), vec![(a, "request_timeout")]);
    assert!(!node.manager.peers().is_requested(InvType::Block, &block.hash()));
}

// ---------------------------------------------------------------------------
// Invalid data
// ---------------------------------------------------------------------------

/// A block body that does not match its header is rejected; the sync peer
/// that supplied the headers is barred and a new peer takes over.
#[test]
fn tampered_block_rejects_sync_peer() {
    let mut node = TestNode::regtest();
    let blocks = build_chain(node.genesis(), 1, 5, 1);
    let (bad, _) = node.connect(5, true);
    let actions = node.send(SyncEvent::Headers { peer: bad, headers: headers_of(&blocks) });
    assert_eq!(block_requests(&actions)[0].1[0], blocks[0].hash());

    let mut tampered = blocks[0].clone();
    tampered.transactions.push(make_tx(1));
    assert_eq!(tampered.hash(), blocks[0].hash());
    let actions = node.send(SyncEvent::Block { peer: bad, block: tampered });
    assert_eq!(disconnects(&actions), vec![(bad, "invalid_block")]);
    assert!(node.manager.is_rejected(&bad));
    assert_eq!(node.manager.mode(), SyncMode::Idle);
    assert_eq!(node.manager.stats().blocks_rejected, 1);

    let (good, actions) = node.connect(5, true);
    assert_eq!(header_requests(&actions), vec![(good, vec![node.genesis()])]);
    let actions = node.send(SyncEvent::Headers { peer: good, headers: headers_of(&blocks) });
    node.serve_blocks(good, &blocks, actions);
    assert_eq!(node.manager.best().height, 5);
}

/// Headers from anyone but the sync peer are a protocol violation.
#[test]
fn headers_from_non_sync_peer_disconnect() {
    let mut node = TestNode::regtest();
    let blocks = build_chain(node.genesis(), 1, 3, 1);
    let (sync, _) = node.connect(3, true);
    let (other, _) = node.connect(3, true);
    let actions = node.send(SyncEvent::Headers { peer: other, headers: headers_of(&blocks) });
    assert_eq!(disconnects(&actions), vec![(other, "unsolicited_headers")]);
    assert_eq!(node.manager.sync_peer(), Some(sync));
}

// ---------------------------------------------------------------------------
// Steady-state relay
// ---------------------------------------------------------------------------

/// A new block in steady state reaches every other peer, confirms its
/// transactions, updates peer heights and feeds the fee estimator.
#[test]
fn synced_block_relayed_and_hooks_fired() {
    let mut node = TestNode::regtest();
    let (a, _) = node.connect(0, true);
    let (b, _) = node.connect(0, true);
    let (c, _) = node.connect(0, false);
    let spend = make_tx(3);
    let block = make_block(node.genesis(), 1, 1, vec![spend.clone()]);
    let unlocked = make_tx(4);
    node.deps.mempool.unlock_on_next_block(vec![unlocked.clone()]);

    node.send(SyncEvent::Inv { peer: a, inventory: vec![InvVect::block(block.hash())] });
    node.send(SyncEvent::Block { peer: a, block: block.clone() });

    assert_eq!(*node.deps.notifier.confirmed.lock(), vec![spend.txid()]);
    assert_eq!(*node.deps.notifier.heights.lock(), vec![(block.hash(), 1)]);
    assert_eq!(*node.deps.fees.blocks.lock(), vec![1]);
    assert_eq!(*node.deps.fees.observed.lock(), vec![unlocked.txid()]);
    assert_eq!(*node.deps.notifier.announced.lock(), vec![unlocked.txid()]);

    let relays = node.deps.notifier.relays.lock().clone();
    assert!(relays.contains(&(InvVect::block(block.hash()), vec![b, c])));
    assert!(relays.contains(&(InvVect::tx(unlocked.txid()), vec![a, b, c])));
    assert_eq!(node.manager.peers().get(&a).map(|s| s.height), Some(1));
}

/// Once the peer limit is reached further peers are turned away.
#[test]
fn peer_limit_enforced() {
    let config = SyncConfig { max_peers: 2, ..SyncConfig::regtest() };
    let mut node = TestNode::new(ChainParams::regtest(), config);
    node.connect(0, true);
    node.connect(0, false);
    let (third, actions) = node.connect(0, true);
    assert_eq!(disconnects(&actions), vec![(third, "too_many_peers")]);
    assert_eq!(node.manager.peers().len(), 2);
}
