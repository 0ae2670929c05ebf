//! Failover coordinator: moves the coordinator role between peers.
//!
//! The former coordinator runs `ACTIVE -> FREEZING -> FROZEN` and is demoted
//! to a client; the new one runs `ACTIVE -> FREEZING -> FROZEN -> RESYNCING
//! -> ACTIVE`. The path is the same whether an administrator asked for the
//! hand-off or a liveness monitor declared the coordinator dead.
//!
//! Role and coordinator fields live under one short-lived lock that is never
//! held across I/O. Whole hand-off procedures are serialized by a separate
//! async lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use sharefs_transport::message::STATUS_MOUNTED;
use sharefs_transport::{Command, FixedName, MountOp, MountPayload, Originator, Payload, WireMessage};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::collab::{CacheInvalidator, InvalidateMode, PersistStore, PhaseMarker};
use crate::config::MetaConfig;
use crate::lease::LeaseManager;
use crate::messenger::Messenger;
use crate::registry::ClientRegistry;
use crate::types::{ControlKind, Epoch, MetaError, PeerOrdinal, Phase, Role};

/// Counters drained by a freeze.
#[derive(Debug, Default)]
struct Gauges {
    active_ops: AtomicUsize,
    in_flight: AtomicUsize,
    flushing: AtomicUsize,
    flush_blocked: AtomicBool,
    changed: Notify,
}

impl Gauges {
    fn release(&self, counter: &AtomicUsize) {
        counter.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

/// An active client operation. The count drops when the guard does.
#[must_use]
pub struct OpGuard {
    gauges: Arc<Gauges>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.gauges.release(&self.gauges.active_ops);
    }
}

/// A message queued or being handled.
#[must_use]
pub struct InFlightGuard {
    gauges: Arc<Gauges>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauges.release(&self.gauges.in_flight);
    }
}

/// A flush of dirty state in progress.
#[must_use]
pub struct FlushGuard {
    gauges: Arc<Gauges>,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.gauges.release(&self.gauges.flushing);
    }
}

#[derive(Debug)]
struct CoordinatorState {
    role: Role,
    coordinator: PeerOrdinal,
    previous: Option<PeerOrdinal>,
    max_ordinal: u32,
    failover_pending: bool,
    candidate: Option<PeerOrdinal>,
}

/// Point-in-time view of the hand-off state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverStatus {
    /// Local role.
    pub role: Role,
    /// Hand-off phase.
    pub phase: Phase,
    /// Coordinator as known locally.
    pub coordinator: PeerOrdinal,
    /// Coordinator before the last hand-off.
    pub previous: Option<PeerOrdinal>,
    /// Highest ordinal in the cluster.
    pub max_ordinal: u32,
    /// Coordinator generation.
    pub generation: u32,
    /// A hand-off was announced and has not finished.
    pub failover_pending: bool,
    /// Client operations in progress.
    pub active_ops: usize,
    /// Messages queued or being handled.
    pub in_flight: usize,
}

/// Components the coordinator drives.
pub struct FailoverDeps {
    /// Peer sessions.
    pub registry: Arc<ClientRegistry>,
    /// Lease table.
    pub leases: Arc<LeaseManager>,
    /// Outgoing messages.
    pub messenger: Messenger,
    /// Control block storage.
    pub store: Arc<dyn PersistStore>,
    /// Local cache.
    pub invalidator: Arc<dyn CacheInvalidator>,
    /// Coordinator generation.
    pub epoch: Arc<Epoch>,
}

/// Orchestrates coordinator hand-offs for one filesystem instance.
pub struct FailoverCoordinator {
    local: PeerOrdinal,
    fs_name: String,
    host_name: String,
    state: Mutex<CoordinatorState>,
    phase: watch::Sender<Phase>,
    role: watch::Sender<Role>,
    mounted: AtomicBool,
    gauges: Arc<Gauges>,
    space: Notify,
    handoff: tokio::sync::Mutex<()>,
    control_cache: Mutex<HashMap<ControlKind, Bytes>>,
    freeze_poll: Duration,
    progress_every: Duration,
    resync_window: Duration,
    registry: Arc<ClientRegistry>,
    leases: Arc<LeaseManager>,
    messenger: Messenger,
    store: Arc<dyn PersistStore>,
    invalidator: Arc<dyn CacheInvalidator>,
    epoch: Arc<Epoch>,
}

impl FailoverCoordinator {
    /// Creates the coordinator in `ACTIVE`, with the role the configuration
    /// assigns.
    pub fn new(config: &MetaConfig, deps: FailoverDeps) -> Self {
        let local = config.local_ordinal();
        let coordinator = PeerOrdinal::new(config.coordinator);
        let role = if coordinator == local {
            Role::Server
        } else {
            Role::Client
        };
        let longest = config.lease.longest();
        Self {
            local,
            fs_name: config.fs_name.clone(),
            host_name: config.host_name.clone(),
            state: Mutex::new(CoordinatorState {
                role,
                coordinator,
                previous: None,
                max_ordinal: config.max_ordinal(),
                failover_pending: false,
                candidate: None,
            }),
            phase: watch::Sender::new(Phase::Active),
            role: watch::Sender::new(role),
            mounted: AtomicBool::new(true),
            gauges: Arc::new(Gauges::default()),
            space: Notify::new(),
            handoff: tokio::sync::Mutex::new(()),
            control_cache: Mutex::new(HashMap::new()),
            freeze_poll: config.freeze_poll(),
            progress_every: longest,
            resync_window: longest,
            registry: deps.registry,
            leases: deps.leases,
            messenger: deps.messenger,
            store: deps.store,
            invalidator: deps.invalidator,
            epoch: deps.epoch,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    /// True if this node is the coordinator.
    pub fn is_server(&self) -> bool {
        self.role() == Role::Server
    }

    /// Coordinator as known locally.
    pub fn coordinator(&self) -> PeerOrdinal {
        self.state.lock().unwrap().coordinator
    }

    /// Highest ordinal in the cluster.
    pub fn max_ordinal(&self) -> u32 {
        self.state.lock().unwrap().max_ordinal
    }

    /// Coordinator generation.
    pub fn generation(&self) -> u32 {
        self.epoch.current()
    }

    /// Subscribes to phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Subscribes to role changes.
    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    /// True if the filesystem is mounted locally.
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Records the local mount status.
    pub fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::SeqCst);
    }

    /// True if a hand-off was announced and has not finished.
    pub fn failover_pending(&self) -> bool {
        self.state.lock().unwrap().failover_pending
    }

    /// Marks a hand-off announced by the coordinator.
    pub fn mark_failover_pending(&self) {
        self.state.lock().unwrap().failover_pending = true;
    }

    /// Snapshot of the hand-off state.
    pub fn status(&self) -> FailoverStatus {
        let state = self.state.lock().unwrap();
        FailoverStatus {
            role: state.role,
            phase: self.phase(),
            coordinator: state.coordinator,
            previous: state.previous,
            max_ordinal: state.max_ordinal,
            generation: self.epoch.current(),
            failover_pending: state.failover_pending,
            active_ops: self.gauges.active_ops.load(Ordering::SeqCst),
            in_flight: self.gauges.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Client operations in progress.
    pub fn active_ops(&self) -> usize {
        self.gauges.active_ops.load(Ordering::SeqCst)
    }

    /// Messages queued or being handled.
    pub fn in_flight(&self) -> usize {
        self.gauges.in_flight.load(Ordering::SeqCst)
    }

    /// Serializes a whole hand-off procedure.
    pub async fn lock_handoff(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.handoff.lock().await
    }

    /// Starts a client operation, waiting out any freeze.
    pub async fn begin_op(&self) -> OpGuard {
        let mut phase = self.phase.subscribe();
        loop {
            let frozen = phase.borrow_and_update().is_frozen_or_freezing();
            if !frozen {
                if let Some(guard) = self.try_begin_op() {
                    return guard;
                }
            }
            // The sender lives as long as `self`.
            let _ = phase.changed().await;
        }
    }

    /// Starts a client operation unless a freeze is under way.
    pub fn try_begin_op(&self) -> Option<OpGuard> {
        if self.phase().is_frozen_or_freezing() {
            return None;
        }
        self.gauges.active_ops.fetch_add(1, Ordering::SeqCst);
        let guard = OpGuard {
            gauges: self.gauges.clone(),
        };
        // A freeze that started in between must not count this operation.
        if self.phase().is_frozen_or_freezing() {
            drop(guard);
            return None;
        }
        Some(guard)
    }

    /// Counts one message until the guard is dropped.
    pub fn track_message(&self) -> InFlightGuard {
        self.gauges.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            gauges: self.gauges.clone(),
        }
    }

    /// Starts a flush. Returns `None` once a freeze has blocked flushing.
    pub fn begin_flush(&self) -> Option<FlushGuard> {
        if self.gauges.flush_blocked.load(Ordering::SeqCst) {
            return None;
        }
        self.gauges.flushing.fetch_add(1, Ordering::SeqCst);
        Some(FlushGuard {
            gauges: self.gauges.clone(),
        })
    }

    /// Waits for free space. Returns early when a freeze starts.
    ///
    /// The file-operation layer parks allocating writers here; a freeze must
    /// not wait behind them.
    pub async fn wait_for_space(&self) {
        let notified = self.space.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.phase().is_frozen_or_freezing() {
            return;
        }
        notified.await;
    }

    /// Wakes tasks waiting for free space.
    pub fn release_space(&self) {
        self.space.notify_waiters();
    }

    async fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        self.gauges.changed.notify_waiters();
        let marker = {
            let state = self.state.lock().unwrap();
            PhaseMarker {
                phase,
                role: state.role,
                coordinator: state.coordinator,
                generation: self.epoch.current(),
            }
        };
        if let Err(e) = self.store.record_phase(marker).await {
            warn!(error = %e, ?phase, "failed to persist phase marker");
        }
        if previous != phase {
            info!(from = ?previous, to = ?phase, generation = marker.generation, "phase changed");
        }
    }

    /// Holds the instance in `FROZEN` after finding an interrupted hand-off on
    /// restart.
    pub async fn hold_frozen(&self) {
        self.gauges.flush_blocked.store(true, Ordering::SeqCst);
        self.set_phase(Phase::Frozen).await;
    }

    /// Starts a voluntary hand-off to `name`. Only the coordinator may call
    /// this.
    ///
    /// Checks the candidate, announces the hand-off to every connected peer
    /// and moves to `FREEZING`. Nothing changes if a check fails.
    pub async fn request_voluntary_failover(&self, name: &str) -> Result<PeerOrdinal, MetaError> {
        let (target, max_ordinal) = {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Server {
                return Err(MetaError::NotCoordinator {
                    coordinator: state.coordinator,
                });
            }
            if !self.is_mounted() {
                return Err(MetaError::NotMounted);
            }
            if state.failover_pending || self.phase() != Phase::Active {
                return Err(MetaError::AlreadyInProgress);
            }
            let target = self.registry.check_candidate(name)?;
            state.failover_pending = true;
            state.candidate = Some(target);
            (target, state.max_ordinal)
        };

        info!(candidate = name, ordinal = %target, "voluntary failover requested");
        let notice = self.mount_message(MountOp::Failover, target, max_ordinal, self.epoch.current());
        for (ordinal, e) in self.messenger.broadcast(&notice, None).await {
            warn!(ordinal = %ordinal, error = %e, "failover notice not delivered");
        }
        self.set_phase(Phase::Freezing).await;
        Ok(target)
    }

    /// Drains the instance and enters `FROZEN`.
    ///
    /// Returns false if the freeze was called off, which happens when a
    /// coordinator announcement thaws the instance first.
    pub async fn enter_freeze(&self) -> bool {
        match self.phase() {
            Phase::Frozen => return true,
            Phase::Freezing => {}
            _ => self.set_phase(Phase::Freezing).await,
        }
        self.space.notify_waiters();
        let started = Instant::now();
        let gauges = self.gauges.clone();

        if !self.drain("flush", || gauges.flushing.load(Ordering::SeqCst) == 0).await {
            return false;
        }
        gauges.flush_blocked.store(true, Ordering::SeqCst);
        // A flush may have slipped in before the block.
        if !self.drain("flush", || gauges.flushing.load(Ordering::SeqCst) == 0).await {
            return false;
        }
        if !self.drain("operations", || gauges.active_ops.load(Ordering::SeqCst) == 0).await {
            return false;
        }
        if !self.drain("messages", || gauges.in_flight.load(Ordering::SeqCst) == 0).await {
            return false;
        }
        if self.phase() != Phase::Freezing {
            return self.phase() == Phase::Frozen;
        }
        self.set_phase(Phase::Frozen).await;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "instance frozen");
        true
    }

    async fn drain(&self, what: &str, done: impl Fn() -> bool) -> bool {
        let mut logged = Instant::now();
        loop {
            let notified = self.gauges.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.phase().is_frozen_or_freezing() {
                debug!(waiting_for = what, "freeze called off");
                return false;
            }
            if let Some(candidate) = self.abandoned_candidate() {
                warn!(candidate = %candidate, waiting_for = what, "hand-off can no longer complete, freeze called off");
                return false;
            }
            if done() {
                return true;
            }
            let _ = tokio::time::timeout(self.freeze_poll, notified).await;
            if logged.elapsed() >= self.progress_every {
                info!(
                    waiting_for = what,
                    active_ops = self.active_ops(),
                    in_flight = self.in_flight(),
                    flushing = self.gauges.flushing.load(Ordering::SeqCst),
                    "freeze still draining"
                );
                logged = Instant::now();
            }
        }
    }

    /// The candidate of a voluntary hand-off that lost its connection, or
    /// whose hand-off was overtaken by a newer coordinator.
    fn abandoned_candidate(&self) -> Option<PeerOrdinal> {
        let (candidate, role) = {
            let state = self.state.lock().unwrap();
            (state.candidate?, state.role)
        };
        (role != Role::Server || !self.registry.is_connected(candidate)).then_some(candidate)
    }

    /// Thaws after [`enter_freeze`](Self::enter_freeze) reported the freeze
    /// called off, and clears the pending hand-off.
    ///
    /// Returns the reason to report for the abandoned hand-off.
    pub async fn call_off_freeze(&self) -> MetaError {
        let candidate = {
            let mut state = self.state.lock().unwrap();
            state.failover_pending = false;
            state.candidate.take()
        };
        self.gauges.flush_blocked.store(false, Ordering::SeqCst);
        if self.phase().is_frozen_or_freezing() {
            self.set_phase(Phase::Active).await;
        }
        match (self.role(), candidate) {
            (Role::Client, _) => MetaError::NotCoordinator {
                coordinator: self.coordinator(),
            },
            (Role::Server, Some(candidate)) => MetaError::CandidateNotReady(
                self.registry
                    .get(candidate, false)
                    .map(|s| s.name())
                    .unwrap_or_else(|| candidate.to_string()),
            ),
            (Role::Server, None) => MetaError::NotFrozen,
        }
    }

    /// Demotes the frozen former coordinator to a client of `coordinator`.
    pub async fn demote_to_client(
        &self,
        coordinator: PeerOrdinal,
        max_ordinal: u32,
        generation: Option<u32>,
    ) -> Result<u32, MetaError> {
        if self.phase() != Phase::Frozen {
            return Err(MetaError::NotFrozen);
        }
        let registry = &self.registry;
        let locks = self
            .leases
            .release_record_locks(|ordinal| !registry.is_connected(ordinal));
        self.invalidator.purge_name_cache();

        let cached: Vec<(ControlKind, Bytes)> = self.control_cache.lock().unwrap().drain().collect();
        for (kind, data) in cached {
            if let Err(e) = self.store.write_control_block(kind, &data).await {
                warn!(%kind, error = %e, "control block write-back failed");
            }
        }
        for kind in ControlKind::ALL {
            self.invalidator.invalidate(kind.resource(), InvalidateMode::Stale);
        }

        let generation = self.adopt(coordinator, max_ordinal, generation);
        self.leases.reset_epoch();
        {
            let mut state = self.state.lock().unwrap();
            state.previous = Some(self.local);
            state.role = Role::Client;
            state.failover_pending = false;
            state.candidate = None;
        }
        self.role.send_replace(Role::Client);
        self.gauges.flush_blocked.store(false, Ordering::SeqCst);
        self.set_phase(Phase::Active).await;
        info!(coordinator = %coordinator, generation, record_locks = locks, "demoted to client");
        Ok(generation)
    }

    /// Re-reads the control blocks and caches them, discarding what the
    /// local cache held.
    pub async fn load_control_blocks(&self) -> Result<(), MetaError> {
        let mut loaded = Vec::with_capacity(ControlKind::ALL.len());
        for kind in ControlKind::ALL {
            match self.store.read_control_block(kind).await {
                Ok(data) => loaded.push((kind, data)),
                Err(e) => {
                    return Err(match e {
                        MetaError::ControlBlockUnreadable { .. } => e,
                        other => MetaError::ControlBlockUnreadable {
                            kind,
                            reason: other.to_string(),
                        },
                    })
                }
            }
        }
        for (kind, _) in &loaded {
            self.invalidator.invalidate(kind.resource(), InvalidateMode::Stale);
        }
        *self.control_cache.lock().unwrap() = loaded.into_iter().collect();
        Ok(())
    }

    /// Promotes the frozen local node to coordinator and starts the lease
    /// resync pass.
    ///
    /// The role change restarts the sweep task. Message workers keep running:
    /// they carry no role state, every message is gated on the role when it
    /// is handled, and the freeze has already drained their queue.
    ///
    /// An unreadable control block aborts the promotion and leaves the
    /// instance `FROZEN`.
    pub async fn promote_to_coordinator(
        self: &Arc<Self>,
        max_ordinal: u32,
        generation: Option<u32>,
    ) -> Result<u32, MetaError> {
        if self.phase() != Phase::Frozen {
            return Err(MetaError::NotFrozen);
        }
        if let Err(e) = self.load_control_blocks().await {
            error!(error = %e, "promotion aborted, instance stays frozen");
            return Err(e);
        }

        let previous = self.coordinator();
        let generation = self.adopt(self.local, max_ordinal, generation);
        self.leases.reset_epoch();
        {
            let mut state = self.state.lock().unwrap();
            state.previous = (previous != self.local).then_some(previous);
            state.role = Role::Server;
            state.failover_pending = false;
            state.candidate = None;
        }
        self.role.send_replace(Role::Server);
        self.registry.begin_resync();
        self.gauges.flush_blocked.store(false, Ordering::SeqCst);
        self.set_phase(Phase::Resyncing).await;
        info!(previous = %previous, generation, "promoted to coordinator");

        let this = self.clone();
        tokio::spawn(async move { this.run_resync(generation).await });
        Ok(generation)
    }

    async fn run_resync(self: Arc<Self>, generation: u32) {
        let deadline = Instant::now() + self.resync_window;
        let max_ordinal = self.max_ordinal();
        let peers: Vec<PeerOrdinal> = self
            .registry
            .connected()
            .iter()
            .map(|s| s.ordinal())
            .filter(|o| *o != self.local)
            .collect();

        let mut set = JoinSet::new();
        for ordinal in peers {
            let messenger = self.messenger.clone();
            let registry = self.registry.clone();
            let msg = self.mount_message(MountOp::Resync, self.local, max_ordinal, generation);
            set.spawn(async move {
                match tokio::time::timeout_at(deadline, messenger.request(ordinal, msg)).await {
                    Ok(Ok(_)) => {
                        registry.set_resynced(ordinal);
                        debug!(ordinal = %ordinal, "peer resynced");
                    }
                    Ok(Err(e)) => warn!(ordinal = %ordinal, error = %e, "resync failed"),
                    Err(_) => warn!(ordinal = %ordinal, "resync timed out"),
                }
            });
        }
        let _ = tokio::time::timeout_at(deadline, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        set.abort_all();

        if self.epoch.current() != generation || self.phase() != Phase::Resyncing {
            debug!(generation, "resync superseded");
            return;
        }
        let complete = self.registry.all_resynced();
        self.set_phase(Phase::Active).await;
        info!(generation, complete, "resync finished");

        let done = self.mount_message(MountOp::FailDone, self.local, max_ordinal, generation);
        for (ordinal, e) in self.messenger.broadcast(&done, None).await {
            debug!(ordinal = %ordinal, error = %e, "faildone not delivered");
        }
    }

    /// Handles an announcement that `coordinator` is now the coordinator.
    ///
    /// Promotes the local node if it is named, demotes it if it was the
    /// coordinator, and otherwise adopts the new coordinator and thaws.
    /// `generation` is `None` for involuntary hand-offs driven by a liveness
    /// monitor; the generation then advances locally.
    pub async fn on_set_coordinator(
        self: &Arc<Self>,
        coordinator: PeerOrdinal,
        max_ordinal: u32,
        generation: Option<u32>,
    ) -> Result<u32, MetaError> {
        let _handoff = self.handoff.lock().await;
        let current = self.epoch.current();
        if let Some(g) = generation {
            if g < current {
                debug!(coordinator = %coordinator, generation = g, current, "stale coordinator announcement");
                return Ok(current);
            }
        }

        let role = self.role();
        if coordinator == self.local {
            if role == Role::Server {
                let generation = self.adopt(coordinator, max_ordinal, generation);
                self.thaw().await;
                return Ok(generation);
            }
            if !self.enter_freeze().await {
                return Err(self.call_off_freeze().await);
            }
            return self.promote_to_coordinator(max_ordinal, generation).await;
        }
        if role == Role::Server {
            if !self.enter_freeze().await {
                return Err(self.call_off_freeze().await);
            }
            return self.demote_to_client(coordinator, max_ordinal, generation).await;
        }

        let generation = self.adopt(coordinator, max_ordinal, generation);
        self.thaw().await;
        info!(coordinator = %coordinator, generation, "coordinator changed");
        Ok(generation)
    }

    /// Adopts a coordinator learned from a peer if `generation` is newer than
    /// the local one. A superseded coordinator steps down to client.
    pub fn learn_coordinator(&self, coordinator: PeerOrdinal, max_ordinal: u32, generation: u32) -> bool {
        if !self.epoch.observe(generation) {
            return false;
        }
        let stepped_down = {
            let mut state = self.state.lock().unwrap();
            state.max_ordinal = state.max_ordinal.max(max_ordinal);
            let previous = state.coordinator;
            state.coordinator = coordinator;
            if previous != coordinator {
                state.previous = Some(previous);
            }
            if state.role == Role::Server && coordinator != self.local {
                state.role = Role::Client;
                true
            } else {
                false
            }
        };
        if stepped_down {
            warn!(coordinator = %coordinator, generation, "superseded as coordinator");
            self.leases.reset_epoch();
            self.role.send_replace(Role::Client);
        }
        info!(coordinator = %coordinator, generation, "learned coordinator");
        true
    }

    fn adopt(&self, coordinator: PeerOrdinal, max_ordinal: u32, generation: Option<u32>) -> u32 {
        let mut state = self.state.lock().unwrap();
        let generation = match generation {
            Some(g) => {
                self.epoch.observe(g);
                self.epoch.current()
            }
            None if coordinator == state.coordinator => self.epoch.current(),
            None => self.epoch.advance(),
        };
        if state.coordinator != coordinator {
            state.previous = Some(state.coordinator);
            state.coordinator = coordinator;
        }
        state.max_ordinal = state.max_ordinal.max(max_ordinal);
        generation
    }

    async fn thaw(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.failover_pending = false;
            state.candidate = None;
        }
        self.gauges.flush_blocked.store(false, Ordering::SeqCst);
        if self.phase() != Phase::Active {
            self.set_phase(Phase::Active).await;
        }
    }

    /// Builds a MOUNT message carrying the coordinator view.
    pub fn mount_message(
        &self,
        op: MountOp,
        coordinator: PeerOrdinal,
        max_ordinal: u32,
        generation: u32,
    ) -> WireMessage {
        let payload = MountPayload {
            host_name: FixedName::new(&self.host_name),
            fs_name: FixedName::new(&self.fs_name),
            status: if self.is_mounted() { STATUS_MOUNTED } else { 0 },
            config: 0,
            coordinator: coordinator.as_u32(),
            max_ordinal,
            generation,
        };
        WireMessage::new(Command::Mount(op), self.originator(), Payload::Mount(payload))
    }

    /// Originator stamped on messages sent in the current role.
    pub fn originator(&self) -> Originator {
        match self.role() {
            Role::Server => Originator::Server,
            Role::Client => Originator::Client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{CacheLog, MemoryStore};
    use crate::lease::{CalloutRequest, CalloutSink};
    use crate::messenger::LocalIdentity;
    use crate::types::ResourceId;
    use async_trait::async_trait;
    use sharefs_transport::SendRetryConfig;

    struct NoCallouts;

    #[async_trait]
    impl CalloutSink for NoCallouts {
        async fn callout(
            &self,
            _ordinal: PeerOrdinal,
            _resource: ResourceId,
            _request: CalloutRequest,
        ) -> Result<(), MetaError> {
            Ok(())
        }
    }

    struct Fixture {
        coordinator: Arc<FailoverCoordinator>,
        store: Arc<MemoryStore>,
        cache: Arc<CacheLog>,
        epoch: Arc<Epoch>,
    }

    fn fixture(ordinal: u32, coordinator: u32) -> Fixture {
        let config = MetaConfig {
            ordinal,
            coordinator,
            ..Default::default()
        };
        let epoch = Arc::new(Epoch::new(1));
        let registry = Arc::new(ClientRegistry::new());
        let messenger = Messenger::new(
            registry.clone(),
            LocalIdentity {
                ordinal: config.local_ordinal(),
                fs_id: 1,
                fs_generation: 1,
            },
            epoch.clone(),
            SendRetryConfig::default(),
            Duration::from_secs(1),
        );
        let leases = Arc::new(LeaseManager::new(
            config.lease.clone(),
            epoch.clone(),
            Arc::new(NoCallouts),
        ));
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheLog::new());
        let deps = FailoverDeps {
            registry,
            leases,
            messenger,
            store: store.clone(),
            invalidator: cache.clone(),
            epoch: epoch.clone(),
        };
        Fixture {
            coordinator: Arc::new(FailoverCoordinator::new(&config, deps)),
            store,
            cache,
            epoch,
        }
    }

    #[tokio::test]
    async fn test_initial_role_from_config() {
        let server = fixture(1, 1);
        assert!(server.coordinator.is_server());
        let client = fixture(2, 1);
        assert_eq!(client.coordinator.role(), Role::Client);
        assert_eq!(client.coordinator.coordinator(), PeerOrdinal::new(1));
        assert_eq!(client.coordinator.phase(), Phase::Active);
    }

    #[tokio::test]
    async fn test_voluntary_failover_preconditions() {
        let client = fixture(2, 1);
        let err = client.coordinator.request_voluntary_failover("node3").await.unwrap_err();
        assert!(matches!(err, MetaError::NotCoordinator { .. }));

        let server = fixture(1, 1);
        server.coordinator.set_mounted(false);
        let err = server.coordinator.request_voluntary_failover("node3").await.unwrap_err();
        assert!(matches!(err, MetaError::NotMounted));

        server.coordinator.set_mounted(true);
        let err = server.coordinator.request_voluntary_failover("node3").await.unwrap_err();
        assert!(matches!(err, MetaError::CandidateNotReady(_)));
        assert_eq!(server.coordinator.phase(), Phase::Active);
        assert!(!server.coordinator.failover_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_waits_for_operations() {
        let f = fixture(2, 1);
        let op = f.coordinator.begin_op().await;
        let message = f.coordinator.track_message();

        let freezing = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.enter_freeze().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.coordinator.phase(), Phase::Freezing);
        assert!(f.coordinator.try_begin_op().is_none());
        assert!(f.coordinator.begin_flush().is_none());

        drop(op);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.coordinator.phase(), Phase::Freezing);
        drop(message);
        assert!(freezing.await.unwrap());
        assert_eq!(f.coordinator.phase(), Phase::Frozen);
        assert_eq!(f.store.phases().last().map(|m| m.phase), Some(Phase::Frozen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_waits_for_flush() {
        let f = fixture(2, 1);
        let flush = f.coordinator.begin_flush().unwrap();
        let freezing = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.enter_freeze().await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.coordinator.phase(), Phase::Freezing);
        drop(flush);
        assert!(freezing.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_wakes_space_waiters() {
        let f = fixture(2, 1);
        let waiter = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.wait_for_space().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        assert!(f.coordinator.enter_freeze().await);
        waiter.await.unwrap();
        // Already frozen: no wait at all.
        f.coordinator.wait_for_space().await;
    }

    #[tokio::test]
    async fn test_release_space_wakes_waiter() {
        let f = fixture(2, 1);
        let waiter = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.wait_for_space().await })
        };
        while !waiter.is_finished() {
            f.coordinator.release_space();
            tokio::task::yield_now().await;
        }
        waiter.await.unwrap();
        assert_eq!(f.coordinator.phase(), Phase::Active);
    }

    #[tokio::test]
    async fn test_call_off_freeze_thaws_and_clears_pending() {
        let f = fixture(2, 1);
        f.coordinator.mark_failover_pending();
        assert!(f.coordinator.enter_freeze().await);
        assert!(f.coordinator.begin_flush().is_none());

        let err = f.coordinator.call_off_freeze().await;
        assert!(matches!(err, MetaError::NotCoordinator { coordinator } if coordinator == PeerOrdinal::new(1)));
        assert_eq!(f.coordinator.phase(), Phase::Active);
        assert!(!f.coordinator.failover_pending());
        assert!(f.coordinator.begin_flush().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_op_waits_for_thaw() {
        let f = fixture(2, 1);
        assert!(f.coordinator.enter_freeze().await);
        let waiting = {
            let c = f.coordinator.clone();
            tokio::spawn(async move {
                let _op = c.begin_op().await;
            })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!waiting.is_finished());

        f.coordinator
            .on_set_coordinator(PeerOrdinal::new(3), 3, Some(2))
            .await
            .unwrap();
        waiting.await.unwrap();
        assert_eq!(f.coordinator.coordinator(), PeerOrdinal::new(3));
        assert_eq!(f.epoch.current(), 2);
        assert_eq!(f.coordinator.phase(), Phase::Active);
    }

    #[tokio::test]
    async fn test_demote_requires_frozen() {
        let f = fixture(1, 1);
        let err = f
            .coordinator
            .demote_to_client(PeerOrdinal::new(2), 2, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NotFrozen));
        assert!(f.coordinator.is_server());
    }

    #[tokio::test]
    async fn test_demote_writes_back_and_purges() {
        let f = fixture(1, 1);
        f.coordinator.load_control_blocks().await.unwrap();
        assert!(f.coordinator.enter_freeze().await);

        let generation = f
            .coordinator
            .demote_to_client(PeerOrdinal::new(2), 2, None)
            .await
            .unwrap();
        assert_eq!(generation, 2);
        assert_eq!(f.coordinator.role(), Role::Client);
        assert_eq!(f.coordinator.coordinator(), PeerOrdinal::new(2));
        assert_eq!(f.coordinator.phase(), Phase::Active);
        assert_eq!(f.cache.purges(), 1);
        for kind in ControlKind::ALL {
            assert!(f.cache.modes_for(kind.resource()).contains(&InvalidateMode::Stale));
        }
    }

    #[tokio::test]
    async fn test_promote_stays_frozen_on_unreadable_block() {
        let f = fixture(2, 1);
        f.store.corrupt(ControlKind::BlockMap);
        let err = f
            .coordinator
            .on_set_coordinator(PeerOrdinal::new(2), 2, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MetaError::ControlBlockUnreadable {
                kind: ControlKind::BlockMap,
                ..
            }
        ));
        assert_eq!(f.coordinator.phase(), Phase::Frozen);
        assert_eq!(f.coordinator.role(), Role::Client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_without_peers_returns_active() {
        let f = fixture(2, 1);
        let generation = f
            .coordinator
            .on_set_coordinator(PeerOrdinal::new(2), 2, None)
            .await
            .unwrap();
        assert_eq!(generation, 2);
        assert!(f.coordinator.is_server());
        assert_eq!(f.coordinator.status().previous, Some(PeerOrdinal::new(1)));

        let mut phase = f.coordinator.watch_phase();
        while *phase.borrow_and_update() != Phase::Active {
            phase.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stale_announcement_ignored() {
        let f = fixture(2, 1);
        f.epoch.observe(5);
        let generation = f
            .coordinator
            .on_set_coordinator(PeerOrdinal::new(3), 3, Some(4))
            .await
            .unwrap();
        assert_eq!(generation, 5);
        assert_eq!(f.coordinator.coordinator(), PeerOrdinal::new(1));
    }

    #[tokio::test]
    async fn test_learn_coordinator_steps_down() {
        let f = fixture(1, 1);
        assert!(!f.coordinator.learn_coordinator(PeerOrdinal::new(2), 2, 1));
        assert!(f.coordinator.is_server());
        assert!(f.coordinator.learn_coordinator(PeerOrdinal::new(2), 4, 3));
        assert_eq!(f.coordinator.role(), Role::Client);
        assert_eq!(f.coordinator.max_ordinal(), 4);
        assert_eq!(f.epoch.current(), 3);
    }
}
