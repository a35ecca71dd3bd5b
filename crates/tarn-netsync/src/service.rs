//! Async runner for the [`SyncManager`].
//!
//! Uses a command-channel architecture: the [`SyncHandle`] sends commands
//! over a bounded mpsc channel to a background tokio task that owns the
//! manager. The task feeds every command and timer tick through
//! [`SyncManager::handle`] and passes the resulting actions to a
//! [`PeerDispatcher`]. Nothing else touches sync state, so events are
//! applied strictly in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use libp2p::PeerId;
use tarn_core::types::{Block, BlockHeader, InvVect, Transaction};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::SyncContext;
use crate::error::SyncError;
use crate::manager::{SyncAction, SyncEvent, SyncManager, SyncMode, SyncStats};
use crate::peer::PeerInfo;
use crate::traits::{BlockVerdict, ChainTip, PeerDispatcher};

/// Commands sent from [`SyncHandle`] to the background task.
enum Command {
    Event(SyncEvent),
    /// Submit a locally produced block and report the verdict.
    ProcessBlock { block: Block, reply: oneshot::Sender<BlockVerdict> },
    Snapshot(oneshot::Sender<SyncSnapshot>),
    Shutdown,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub mode: SyncMode,
    pub sync_peer: Option<PeerId>,
    pub best: ChainTip,
    pub peers: usize,
    pub orphans: usize,
    pub stats: SyncStats,
}

impl SyncSnapshot {
    fn of(manager: &SyncManager) -> Self {
        Self {
            mode: manager.mode(),
            sync_peer: manager.sync_peer(),
            best: manager.best(),
            peers: manager.peers().len(),
            orphans: manager.orphans().len(),
            stats: manager.stats().clone(),
        }
    }
}

/// Shared atomic state between the handle and the manager task.
struct SharedState {
    running: AtomicBool,
    current: AtomicBool,
}

/// Handle to a running sync manager.
///
/// Created via [`SyncHandle::start`]. Cheap to clone; every clone talks to
/// the same task.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<Command>,
    state: Arc<SharedState>,
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("running", &self.state.running.load(Ordering::Relaxed))
            .field("current", &self.state.current.load(Ordering::Relaxed))
            .finish()
    }
}

impl SyncHandle {
    /// Start the sync manager on the current tokio runtime.
    ///
    /// Returns the handle and the task's join handle. The task exits after
    /// [`shutdown`](Self::shutdown) or once every handle is dropped.
    pub fn start(
        ctx: SyncContext,
        dispatcher: Arc<dyn PeerDispatcher>,
    ) -> Result<(Self, JoinHandle<()>), SyncError> {
        ctx.config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(ctx.config.event_queue_capacity);
        let timers = Timers {
            stall_check: ctx.config.stall_check_interval,
            orphan_sweep: ctx.config.orphan_sweep_interval,
        };
        let manager = SyncManager::new(ctx, clock());
        let state = Arc::new(SharedState {
            running: AtomicBool::new(true),
            current: AtomicBool::new(manager.is_current()),
        });
        info!(mode = %manager.mode(), height = manager.best().height, "sync: starting manager");

        let state_clone = Arc::clone(&state);
        let task = tokio::spawn(async move {
            sync_event_loop(manager, command_rx, dispatcher, timers, state_clone).await;
        });
        Ok((Self { command_tx, state }, task))
    }

    /// Whether the manager task is still running.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Relaxed)
    }

    /// Whether the manager believes the chain is caught up, as of the last
    /// processed command.
    pub fn is_current(&self) -> bool {
        self.state.current.load(Ordering::Relaxed)
    }

    async fn send(&self, command: Command) -> Result<(), SyncError> {
        self.command_tx.send(command).await.map_err(|_| SyncError::Stopped)
    }

    async fn event(&self, event: SyncEvent) -> Result<(), SyncError> {
        self.send(Command::Event(event)).await
    }

    pub async fn new_peer(&self, info: PeerInfo) -> Result<(), SyncError> {
        self.event(SyncEvent::NewPeer(info)).await
    }

    pub async fn done_peer(&self, peer: PeerId) -> Result<(), SyncError> {
        self.event(SyncEvent::DonePeer(peer)).await
    }

    pub async fn queue_headers(&self, peer: PeerId, headers: Vec<BlockHeader>) -> Result<(), SyncError> {
        self.event(SyncEvent::Headers { peer, headers }).await
    }

    pub async fn queue_block(&self, peer: PeerId, block: Block) -> Result<(), SyncError> {
        self.event(SyncEvent::Block { peer, block }).await
    }

    pub async fn queue_tx(&self, peer: PeerId, tx: Transaction) -> Result<(), SyncError> {
        self.event(SyncEvent::Tx { peer, tx }).await
    }

    pub async fn queue_inv(&self, peer: PeerId, inventory: Vec<InvVect>) -> Result<(), SyncError> {
        self.event(SyncEvent::Inv { peer, inventory }).await
    }

    pub async fn queue_not_found(&self, peer: PeerId, inventory: Vec<InvVect>) -> Result<(), SyncError> {
        self.event(SyncEvent::NotFound { peer, inventory }).await
    }

    /// Submit a locally produced block and wait for the chain's verdict.
    pub async fn process_block(&self, block: Block) -> Result<BlockVerdict, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ProcessBlock { block, reply }).await?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Current manager state. Every command sent before this one has been
    /// applied by the time it returns.
    pub async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    pub async fn sync_peer_id(&self) -> Result<Option<PeerId>, SyncError> {
        Ok(self.snapshot().await?.sync_peer)
    }

    pub async fn mode(&self) -> Result<SyncMode, SyncError> {
        Ok(self.snapshot().await?.mode)
    }

    pub async fn stats(&self) -> Result<SyncStats, SyncError> {
        Ok(self.snapshot().await?.stats)
    }

    /// Ask the manager to stop. Commands already queued are discarded.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
    }
}

struct Timers {
    stall_check: Duration,
    orphan_sweep: Duration,
}

/// Time source for the manager. Follows tokio's clock so paused-time tests
/// drive the timers deterministically.
fn clock() -> Instant {
    time::Instant::now().into_std()
}

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Background task owning the manager.
async fn sync_event_loop(
    mut manager: SyncManager,
    mut command_rx: mpsc::Receiver<Command>,
    dispatcher: Arc<dyn PeerDispatcher>,
    timers: Timers,
    state: Arc<SharedState>,
) {
    let mut stall_check = ticker(timers.stall_check);
    let mut orphan_sweep = ticker(timers.orphan_sweep);
    let dispatch = |actions: Vec<SyncAction>| {
        for action in actions {
            dispatcher.dispatch(action);
        }
    };

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Event(event)) => dispatch(manager.handle(event, clock())),
                    Some(Command::ProcessBlock { block, reply }) => {
                        let (verdict, actions) = manager.process_local_block(block, clock());
                        dispatch(actions);
                        let _ = reply.send(verdict);
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(SyncSnapshot::of(&manager));
                    }
                    Some(Command::Shutdown) | None => {
                        info!("sync: shutting down manager");
                        break;
                    }
                }
            }
            _ = stall_check.tick() => dispatch(manager.handle(SyncEvent::StallTick, clock())),
            _ = orphan_sweep.tick() => dispatch(manager.handle(SyncEvent::OrphanSweep, clock())),
        }
        state.current.store(manager.is_current(), Ordering::Relaxed);
    }

    command_rx.close();
    let mut dropped = 0usize;
    while command_rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "sync: discarded queued commands");
    }
    manager.shutdown();
    state.current.store(false, Ordering::Relaxed);
    state.running.store(false, Ordering::Relaxed);
    info!("sync: manager stopped");
}
