//! One mounted filesystem instance: the registry, lease table and failover
//! coordinator of that filesystem, plus the message handlers that drive them.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use sharefs_transport::message::STATUS_MOUNTED;
use sharefs_transport::{
    BlockOp, CalloutOp, CalloutPayload, Command, InodeOp, LeaseOp, LeasePayload, MountOp,
    NotifyOp, NotifyPayload, Payload, ProtocolError, WaitFlag, WireMessage,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collab::{invalidate_modes, CacheInvalidator, InvalidateMode, LivenessMonitor, PersistStore};
use crate::config::MetaConfig;
use crate::failover::{FailoverCoordinator, FailoverDeps, FailoverStatus, InFlightGuard};
use crate::lease::{CalloutRequest, CalloutSink, LeaseGrant, LeaseManager, StageInfo, WaitMode};
use crate::messenger::{error_reply, LocalIdentity, Messenger};
use crate::registry::{AdminState, ClientRegistry};
use crate::service::WorkerPool;
use crate::types::{
    DirectedActions, Epoch, LeaseKind, LeaseMask, MetaError, PeerInfo, PeerOrdinal, Phase,
    ResourceId,
};

/// `LeasePayload::flags` bit: answer at once instead of waiting on holders.
pub const LEASE_FLAG_NOWAIT: u16 = 0x1;

/// Error code carried by a cancelled staging notice.
const STAGE_CANCELLED: i32 = 125;

/// Routes lease callouts: local ones are applied in place, remote ones are
/// sent one-way.
struct CalloutRouter {
    instance: Weak<Instance>,
}

#[async_trait]
impl CalloutSink for CalloutRouter {
    async fn callout(
        &self,
        ordinal: PeerOrdinal,
        resource: ResourceId,
        request: CalloutRequest,
    ) -> Result<(), MetaError> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(MetaError::NotConnected(ordinal))?;
        if ordinal == instance.local {
            instance.apply_callout(resource, &request).await;
            return Ok(());
        }
        let mut msg = callout_message(resource, &request);
        msg.header.wait_flag = WaitFlag::OneWay;
        instance.messenger.send(ordinal, msg).await.map(|_| ())
    }
}

/// A mounted filesystem instance.
pub struct Instance {
    config: MetaConfig,
    local: PeerOrdinal,
    epoch: Arc<Epoch>,
    registry: Arc<ClientRegistry>,
    messenger: Messenger,
    leases: Arc<LeaseManager>,
    failover: Arc<FailoverCoordinator>,
    store: Arc<dyn PersistStore>,
    invalidator: Arc<dyn CacheInvalidator>,
    /// Leases this node holds, as the coordinator last reported them.
    held: DashMap<ResourceId, HeldLease>,
    /// Highest coordinator generation seen per resource.
    seen: DashMap<ResourceId, u32>,
    workers: OnceLock<WorkerPool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct HeldLease {
    mask: LeaseMask,
    size: u64,
}

impl Instance {
    /// Builds an instance from `config`. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: MetaConfig,
        store: Arc<dyn PersistStore>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Result<Arc<Self>, MetaError> {
        config.validate()?;
        let local = config.local_ordinal();
        let epoch = Arc::new(Epoch::new(1));
        let registry = Arc::new(ClientRegistry::new());
        let messenger = Messenger::new(
            registry.clone(),
            LocalIdentity {
                ordinal: local,
                fs_id: config.fs_id,
                fs_generation: config.fs_generation,
            },
            epoch.clone(),
            config.send.retry(),
            config.request_timeout(),
        );

        Ok(Arc::new_cyclic(|weak: &Weak<Instance>| {
            let router = Arc::new(CalloutRouter {
                instance: weak.clone(),
            });
            let leases = Arc::new(LeaseManager::new(config.lease.clone(), epoch.clone(), router));
            let failover = Arc::new(FailoverCoordinator::new(
                &config,
                FailoverDeps {
                    registry: registry.clone(),
                    leases: leases.clone(),
                    messenger: messenger.clone(),
                    store: store.clone(),
                    invalidator: invalidator.clone(),
                    epoch: epoch.clone(),
                },
            ));
            Instance {
                config,
                local,
                epoch,
                registry,
                messenger,
                leases,
                failover,
                store,
                invalidator,
                held: DashMap::new(),
                seen: DashMap::new(),
                workers: OnceLock::new(),
                tasks: Mutex::new(Vec::new()),
            }
        }))
    }

    /// Restores the persisted generation and starts the background tasks.
    ///
    /// An instance that stopped in the middle of a hand-off comes back
    /// `FROZEN` and stays there until a coordinator announcement arrives.
    pub async fn start(self: &Arc<Self>) -> Result<(), MetaError> {
        let marker = self.store.last_phase().await?;
        if let Some(marker) = marker {
            self.epoch.observe(marker.generation);
        }
        match marker {
            Some(marker) if marker.interrupted() => {
                error!(
                    phase = ?marker.phase,
                    generation = marker.generation,
                    coordinator = %marker.coordinator,
                    "previous run stopped during a coordinator hand-off, holding frozen until a new coordinator is announced"
                );
                self.failover.hold_frozen().await;
            }
            _ if self.failover.is_server() => self.failover.load_control_blocks().await?,
            _ => {}
        }

        let pool = WorkerPool::spawn(self, self.config.worker_threads, self.config.worker_queue_depth);
        if self.workers.set(pool).is_err() {
            return Err(MetaError::AlreadyInProgress);
        }
        let background = crate::service::spawn_background(self);
        self.tasks.lock().unwrap().extend(background);
        info!(
            fs = %self.config.fs_name,
            ordinal = %self.local,
            role = ?self.failover.role(),
            coordinator = %self.failover.coordinator(),
            generation = self.epoch.current(),
            "instance started"
        );
        Ok(())
    }

    /// Stops background tasks and drops every peer connection.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(pool) = self.workers.get() {
            pool.abort();
        }
        for session in self.registry.connected() {
            session.abort_reader();
            self.registry.clear(session.ordinal()).await;
        }
        info!(ordinal = %self.local, "instance stopped");
    }

    /// Configuration in force.
    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    /// Local ordinal.
    pub fn local(&self) -> PeerOrdinal {
        self.local
    }

    /// Peer sessions.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Outgoing messages.
    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    /// Lease table. Only meaningful on the coordinator.
    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// Hand-off state machine.
    pub fn failover(&self) -> &Arc<FailoverCoordinator> {
        &self.failover
    }

    pub(crate) fn workers(&self) -> Option<&WorkerPool> {
        self.workers.get()
    }

    /// Coordinator as known locally.
    pub fn current_coordinator(&self) -> PeerOrdinal {
        self.failover.coordinator()
    }

    /// True if this node is the coordinator.
    pub fn is_server(&self) -> bool {
        self.failover.is_server()
    }

    /// Every known peer.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.registry.peer_infos()
    }

    /// Hand-off state.
    pub fn status(&self) -> FailoverStatus {
        self.failover.status()
    }

    /// Leases this node holds on `resource`.
    pub fn held_leases(&self, resource: ResourceId) -> LeaseMask {
        self.held.get(&resource).map(|h| h.mask).unwrap_or_default()
    }

    /// True if the last persisted phase shows an interrupted hand-off.
    pub async fn recovery_required(&self) -> Result<bool, MetaError> {
        Ok(self
            .store
            .last_phase()
            .await?
            .map(|m| m.interrupted())
            .unwrap_or(false))
    }

    /// Acquires `kind` on `resource`, waiting for conflicting holders.
    ///
    /// The grant's directed actions are for the caller to apply before it
    /// uses cached data.
    pub async fn request_lease(&self, resource: ResourceId, kind: LeaseKind) -> Result<LeaseGrant, MetaError> {
        self.request_lease_with(resource, kind, WaitMode::Block).await
    }

    /// Like [`request_lease`](Self::request_lease), with an explicit wait mode.
    pub async fn request_lease_with(
        &self,
        resource: ResourceId,
        kind: LeaseKind,
        mode: WaitMode,
    ) -> Result<LeaseGrant, MetaError> {
        let _op = self.failover.begin_op().await;
        let grant = if self.failover.is_server() {
            self.leases
                .acquire(resource, self.local, kind, self.epoch.current(), mode)
                .await?
        } else {
            let coordinator = self.failover.coordinator();
            let mut msg = self.lease_message(LeaseOp::Get, resource, kind.mask(), 0);
            if let Payload::Lease(p) = &mut msg.payload {
                p.kind = kind.index() as u16;
                if mode == WaitMode::NoWait {
                    p.flags |= LEASE_FLAG_NOWAIT;
                }
            }
            let reply = self.messenger.request(coordinator, msg).await?;
            grant_from_reply(&reply, kind)?
        };
        self.held.insert(
            resource,
            HeldLease {
                mask: grant.leases,
                size: grant.size,
            },
        );
        self.note_generation(resource, grant.generation);
        debug!(resource = %resource, %kind, actions = %grant.actions, "lease acquired");
        Ok(grant)
    }

    /// Gives up `mask` on `resource`.
    pub async fn release_lease(&self, resource: ResourceId, mask: LeaseMask) -> Result<(), MetaError> {
        self.drop_held(resource, mask);
        if self.failover.is_server() {
            self.leases.release(resource, self.local, mask);
            return Ok(());
        }
        let mut msg = self.lease_message(LeaseOp::Remove, resource, mask, 0);
        msg.header.wait_flag = WaitFlag::OneWay;
        self.messenger
            .send(self.failover.coordinator(), msg)
            .await
            .map(|_| ())
    }

    /// Hands the coordinator role to the peer named `name`.
    ///
    /// Runs the whole voluntary path on the current coordinator: candidate
    /// checks, announcement, freeze, demotion, and the announcement of the
    /// new coordinator. If the candidate disconnects while the freeze drains,
    /// the hand-off is called off and this node stays coordinator.
    pub async fn request_voluntary_failover(&self, name: &str) -> Result<PeerOrdinal, MetaError> {
        let _handoff = self.failover.lock_handoff().await;
        let target = self.failover.request_voluntary_failover(name).await?;
        let max_ordinal = self.failover.max_ordinal();
        if !self.failover.enter_freeze().await {
            let reason = self.failover.call_off_freeze().await;
            // Peers froze on the hand-off notice; the current view thaws them.
            let config = self.failover.mount_message(
                MountOp::Config,
                self.failover.coordinator(),
                max_ordinal,
                self.epoch.current(),
            );
            for (ordinal, e) in self.messenger.broadcast(&config, None).await {
                debug!(ordinal = %ordinal, error = %e, "hand-off cancellation not delivered");
            }
            warn!(candidate = %target, error = %reason, "voluntary failover called off");
            return Err(reason);
        }
        let generation = self
            .failover
            .demote_to_client(target, max_ordinal, None)
            .await?;

        let config = self
            .failover
            .mount_message(MountOp::Config, target, max_ordinal, generation);
        for (ordinal, e) in self.messenger.broadcast(&config, None).await {
            warn!(ordinal = %ordinal, error = %e, "coordinator announcement not delivered");
        }
        info!(coordinator = %target, generation, "voluntary failover complete");
        Ok(target)
    }

    /// Handles an involuntary hand-off: `coordinator` now owns the role.
    pub async fn set_coordinator(
        self: &Arc<Self>,
        coordinator: PeerOrdinal,
        max_ordinal: u32,
    ) -> Result<u32, MetaError> {
        self.failover
            .on_set_coordinator(coordinator, max_ordinal, None)
            .await
    }

    /// Enables or disables a peer. Disabling is not immediate: the peer is
    /// told to unmount and forced off by the sweep if it does not.
    pub async fn set_admin_state(&self, ordinal: PeerOrdinal, state: AdminState) -> Result<(), MetaError> {
        if !self.failover.is_server() {
            return Err(MetaError::NotCoordinator {
                coordinator: self.failover.coordinator(),
            });
        }
        if self.failover.phase() != Phase::Active || self.failover.failover_pending() {
            return Err(MetaError::AlreadyInProgress);
        }
        self.registry.set_admin_state(ordinal, state)?;
        if state == AdminState::Off && self.registry.is_connected(ordinal) {
            let mut msg = WireMessage::new(
                Command::Notify(NotifyOp::HostOff),
                self.failover.originator(),
                Payload::Notify(NotifyPayload {
                    host: ordinal.as_u32(),
                    ..Default::default()
                }),
            );
            msg.header.wait_flag = WaitFlag::OneWay;
            if let Err(e) = self.messenger.send(ordinal, msg).await {
                debug!(ordinal = %ordinal, error = %e, "host off notice not delivered");
            }
        }
        Ok(())
    }

    /// Records the local mount status and reports it to the coordinator.
    pub async fn set_mounted(&self, mounted: bool) {
        self.failover.set_mounted(mounted);
        if self.failover.is_server() {
            return;
        }
        let coordinator = self.failover.coordinator();
        let mut msg = self.failover.mount_message(
            MountOp::Status,
            coordinator,
            self.failover.max_ordinal(),
            self.epoch.current(),
        );
        msg.header.wait_flag = WaitFlag::OneWay;
        if let Err(e) = self.messenger.send(coordinator, msg).await {
            debug!(error = %e, "mount status not delivered");
        }
    }

    /// Reacts to a liveness report that `ordinal` is down.
    pub async fn on_peer_down(self: &Arc<Self>, ordinal: PeerOrdinal) {
        warn!(ordinal = %ordinal, "peer declared down");
        self.registry.mark_inop(ordinal);
        if let Some(session) = self.registry.get(ordinal, false) {
            session.abort_reader();
        }
        self.registry.clear(ordinal).await;
        self.messenger.fail_pending(ordinal);

        if self.failover.is_server() {
            self.leases.release_peer(ordinal);
        } else if ordinal == self.failover.coordinator() {
            self.failover.mark_failover_pending();
            self.spawn_pending_freeze();
        }
    }

    /// Subscribes to `monitor` for involuntary hand-off triggers.
    pub fn attach_liveness(self: &Arc<Self>, monitor: &dyn LivenessMonitor) {
        let weak = Arc::downgrade(self);
        let handle = tokio::runtime::Handle::current();
        monitor.subscribe(Box::new(move |ordinal| {
            if let Some(instance) = weak.upgrade() {
                handle.spawn(async move { instance.on_peer_down(ordinal).await });
            }
        }));
    }

    fn spawn_pending_freeze(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let _handoff = this.failover.lock_handoff().await;
            if this.failover.failover_pending() {
                this.failover.enter_freeze().await;
            }
        });
    }

    /// Handles one decoded, non-reply message from `from`.
    pub async fn dispatch(self: &Arc<Self>, from: PeerOrdinal, msg: WireMessage, guard: InFlightGuard) {
        let blocking_get = matches!(msg.command(), Command::Lease(LeaseOp::Get))
            && self.failover.is_server()
            && msg.header.wait_flag != WaitFlag::NoWait;
        if blocking_get {
            // Lease waits can be long; keep the worker free.
            let this = self.clone();
            tokio::spawn(async move {
                this.handle(from, msg).await;
                drop(guard);
            });
            return;
        }
        self.handle(from, msg).await;
        drop(guard);
    }

    async fn handle(self: &Arc<Self>, from: PeerOrdinal, msg: WireMessage) {
        let command = msg.command();
        let reply = match command {
            Command::Mount(op) => self.handle_mount(from, op, &msg).await,
            Command::Lease(_) | Command::Inode(_) | Command::Block(_) => {
                Some(self.process_request(from, &msg).await)
            }
            Command::Callout(op) => {
                self.handle_callout(from, op, &msg).await;
                None
            }
            Command::Notify(op) => {
                self.handle_notify(from, op, &msg).await;
                None
            }
        };
        if msg.header.wait_flag == WaitFlag::OneWay {
            return;
        }
        let reply = reply.unwrap_or_else(|| {
            WireMessage::reply_to(&msg.header, self.local, Payload::empty_for(command))
        });
        if let Err(e) = self.messenger.reply(from, reply).await {
            debug!(ordinal = %from, %command, error = %e, "reply not delivered");
        }
    }

    /// Serves a coordinator request and builds its reply.
    pub async fn process_request(&self, from: PeerOrdinal, msg: &WireMessage) -> WireMessage {
        match self.serve(from, msg).await {
            Ok(payload) => WireMessage::reply_to(&msg.header, self.local, payload),
            Err(e) => {
                debug!(ordinal = %from, command = %msg.command(), error = %e, "request refused");
                error_reply(msg, self.local, &e)
            }
        }
    }

    async fn serve(&self, from: PeerOrdinal, msg: &WireMessage) -> Result<Payload, MetaError> {
        let command = msg.command();
        let current = self.epoch.current();
        if command.is_lease_affecting() && msg.header.coord_generation < current {
            return Err(MetaError::StaleGeneration {
                got: msg.header.coord_generation,
                current,
            });
        }
        if !self.failover.is_server() {
            return Err(MetaError::NotCoordinator {
                coordinator: self.failover.coordinator(),
            });
        }
        let resource = msg.payload.resource().unwrap_or_default();
        let phase = self.failover.phase();
        let allowed = match phase {
            Phase::Active => true,
            Phase::Resyncing => matches!(command, Command::Lease(LeaseOp::Reset)),
            Phase::Freezing | Phase::Frozen => matches!(
                command,
                Command::Lease(LeaseOp::Remove | LeaseOp::Relinquish | LeaseOp::Reset)
            ),
        };
        if !allowed {
            return Err(MetaError::WouldBlock(resource));
        }

        match (command, &msg.payload) {
            (Command::Lease(LeaseOp::Get), Payload::Lease(p)) => {
                let kind = LeaseKind::from_index(p.kind)
                    .ok_or_else(|| MetaError::Unsupported(format!("lease kind {}", p.kind)))?;
                let _op = self
                    .failover
                    .try_begin_op()
                    .ok_or(MetaError::WouldBlock(p.resource))?;
                let mode = if msg.header.wait_flag == WaitFlag::NoWait
                    || p.flags & LEASE_FLAG_NOWAIT != 0
                {
                    WaitMode::NoWait
                } else {
                    WaitMode::Block
                };
                let grant = self
                    .leases
                    .acquire(p.resource, from, kind, msg.header.coord_generation, mode)
                    .await?;
                Ok(Payload::Lease(grant_payload(&grant)))
            }
            (Command::Lease(LeaseOp::Remove | LeaseOp::Relinquish), Payload::Lease(p)) => {
                let remaining = self
                    .leases
                    .release(p.resource, from, LeaseMask::from_bits(p.mask));
                Ok(Payload::Lease(LeasePayload {
                    resource: p.resource,
                    mask: remaining.bits(),
                    generation: current,
                    ..Default::default()
                }))
            }
            (Command::Lease(LeaseOp::Reset), Payload::Lease(p)) => {
                self.leases
                    .reinstate(p.resource, from, LeaseMask::from_bits(p.mask), p.size);
                Ok(Payload::Lease(LeasePayload {
                    resource: p.resource,
                    mask: p.mask,
                    generation: current,
                    ..Default::default()
                }))
            }
            (Command::Inode(op @ (InodeOp::Stage | InodeOp::CancelStage)), Payload::Inode(p)) => {
                let info = StageInfo {
                    copy: p.stage_copy,
                    flags: p.flags as u16,
                    size: p.size,
                    error: if op == InodeOp::CancelStage { STAGE_CANCELLED } else { 0 },
                };
                let told = self.leases.notify_staging_clients(p.resource, from, info).await;
                debug!(resource = %p.resource, told = told.len(), "staging notice forwarded");
                Ok(Payload::empty_for(command))
            }
            (Command::Inode(InodeOp::SetAbr), Payload::Inode(p)) => {
                self.leases.set_abr(p.resource).await;
                Ok(Payload::empty_for(command))
            }
            (Command::Block(BlockOp::Wakeup), Payload::Block(p)) => {
                self.leases.wake(p.resource);
                Ok(Payload::empty_for(command))
            }
            (Command::Lease(_), _) | (Command::Inode(_), _) | (Command::Block(_), _)
                if !msg.payload.matches(command) =>
            {
                Err(ProtocolError::LayoutMismatch { what: "payload" }.into())
            }
            _ => Err(MetaError::Unsupported(command.to_string())),
        }
    }

    async fn handle_mount(self: &Arc<Self>, from: PeerOrdinal, op: MountOp, msg: &WireMessage) -> Option<WireMessage> {
        let Payload::Mount(p) = &msg.payload else {
            return Some(error_reply(msg, self.local, &ProtocolError::LayoutMismatch { what: "payload" }.into()));
        };
        match op {
            MountOp::Init => Some(error_reply(msg, self.local, &MetaError::AlreadyConnected(from))),
            MountOp::Status => {
                self.registry.set_mounted(from, p.status & STATUS_MOUNTED != 0);
                None
            }
            MountOp::FailInit => {
                warn!(ordinal = %from, "peer reports failed handshake");
                None
            }
            MountOp::Failover => {
                if msg.header.coord_generation < self.epoch.current() {
                    debug!(ordinal = %from, "stale failover notice ignored");
                    return None;
                }
                info!(from = %from, candidate = p.coordinator, "coordinator hand-off announced");
                self.failover.mark_failover_pending();
                self.spawn_pending_freeze();
                None
            }
            MountOp::Config => {
                let this = self.clone();
                let (coordinator, max_ordinal, generation) =
                    (PeerOrdinal::new(p.coordinator), p.max_ordinal, p.generation);
                tokio::spawn(async move {
                    if let Err(e) = this
                        .failover
                        .on_set_coordinator(coordinator, max_ordinal, Some(generation))
                        .await
                    {
                        error!(coordinator = %coordinator, generation, error = %e, "coordinator change failed");
                    }
                });
                None
            }
            MountOp::Resync => {
                self.failover.learn_coordinator(from, p.max_ordinal, p.generation);
                let reported = self.report_leases(from).await;
                info!(coordinator = %from, reported, "leases re-reported");
                None
            }
            MountOp::FailDone => {
                self.failover.learn_coordinator(from, p.max_ordinal, p.generation);
                debug!(coordinator = %from, generation = p.generation, "hand-off finished");
                None
            }
        }
    }

    /// Re-reports every held lease to `coordinator`. Returns how many were
    /// accepted.
    async fn report_leases(&self, coordinator: PeerOrdinal) -> usize {
        let held: Vec<(ResourceId, HeldLease)> = self
            .held
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .filter(|(_, h)| !h.mask.is_empty())
            .collect();
        let mut reported = 0;
        for (resource, lease) in held {
            let msg = self.lease_message(LeaseOp::Reset, resource, lease.mask, lease.size);
            match self.messenger.request(coordinator, msg).await {
                Ok(_) => {
                    self.note_generation(resource, self.epoch.current());
                    reported += 1;
                }
                Err(e) => warn!(resource = %resource, error = %e, "lease re-report failed"),
            }
        }
        reported
    }

    async fn handle_callout(&self, from: PeerOrdinal, op: CalloutOp, msg: &WireMessage) {
        let Payload::Callout(p) = &msg.payload else {
            return;
        };
        if !self.accept_generation(p.resource, msg.header.coord_generation) {
            warn!(
                resource = %p.resource,
                generation = msg.header.coord_generation,
                "stale callout, re-reporting lease"
            );
            self.report_lease(from, p.resource).await;
            return;
        }
        let request = CalloutRequest {
            op,
            actions: DirectedActions::from_bits(p.actions),
            mask: LeaseMask::from_bits(p.mask),
            size: p.size,
            stale_offset: p.stale_offset,
            stage_copy: p.stage_copy,
            stage_flags: p.stage_flags,
            error: p.error,
        };
        self.apply_callout(p.resource, &request).await;
    }

    async fn report_lease(&self, coordinator: PeerOrdinal, resource: ResourceId) {
        let lease = self.held.get(&resource).map(|h| *h).unwrap_or_default();
        let mut msg = self.lease_message(LeaseOp::Reset, resource, lease.mask, lease.size);
        msg.header.wait_flag = WaitFlag::OneWay;
        if let Err(e) = self.messenger.send(coordinator, msg).await {
            debug!(resource = %resource, error = %e, "lease re-report not delivered");
        }
    }

    /// Executes a callout against the local cache.
    async fn apply_callout(&self, resource: ResourceId, request: &CalloutRequest) {
        match request.op {
            CalloutOp::RelinquishLease => {
                self.invalidator.invalidate(resource, InvalidateMode::SyncPages);
                self.invalidator.invalidate(resource, InvalidateMode::DropPages);
                self.drop_held(resource, request.mask);
                debug!(resource = %resource, mask = %request.mask, "relinquishing lease");
                if self.failover.is_server() {
                    self.leases.release(resource, self.local, request.mask);
                    return;
                }
                let mut msg = self.lease_message(LeaseOp::Relinquish, resource, request.mask, 0);
                msg.header.wait_flag = WaitFlag::OneWay;
                if let Err(e) = self.messenger.send(self.failover.coordinator(), msg).await {
                    warn!(resource = %resource, error = %e, "relinquish not delivered");
                }
            }
            CalloutOp::Action | CalloutOp::Flags | CalloutOp::Stage => {
                if request.op == CalloutOp::Stage && request.error != 0 {
                    debug!(resource = %resource, error = request.error, "staging failed elsewhere");
                }
                for mode in invalidate_modes(request.actions, request.size, request.stale_offset) {
                    self.invalidator.invalidate(resource, mode);
                }
                if let Some(mut held) = self.held.get_mut(&resource) {
                    if request.actions.contains(DirectedActions::SET_SIZE)
                        || request.actions.contains(DirectedActions::FORCE_SIZE)
                    {
                        held.size = request.size;
                    }
                }
            }
        }
    }

    async fn handle_notify(&self, from: PeerOrdinal, op: NotifyOp, msg: &WireMessage) {
        let Payload::Notify(p) = &msg.payload else {
            return;
        };
        if op == NotifyOp::Lease || op == NotifyOp::LeaseExpire {
            if !self.accept_generation(p.resource, msg.header.coord_generation) {
                self.report_lease(from, p.resource).await;
                return;
            }
        }
        match op {
            NotifyOp::Lease => {
                self.held
                    .entry(p.resource)
                    .or_default()
                    .mask = LeaseMask::from_bits(p.mask);
            }
            NotifyOp::LeaseExpire => {
                let mask = LeaseMask::from_bits(p.mask);
                self.drop_held(p.resource, mask);
                self.invalidator.invalidate(p.resource, InvalidateMode::DropPages);
                debug!(resource = %p.resource, %mask, "leases expired");
            }
            NotifyOp::Dnlc => self.invalidator.purge_name_cache(),
            NotifyOp::HostOff => {
                warn!(coordinator = %from, "host disabled by coordinator, unmounting");
                self.set_mounted(false).await;
            }
        }
    }

    /// Accepts a lease-affecting message generation for `resource` unless an
    /// older one than already seen.
    fn accept_generation(&self, resource: ResourceId, generation: u32) -> bool {
        if generation < self.epoch.current() {
            return false;
        }
        let mut seen = self.seen.entry(resource).or_insert(0);
        if generation < *seen {
            return false;
        }
        *seen = generation;
        true
    }

    fn note_generation(&self, resource: ResourceId, generation: u32) {
        let mut seen = self.seen.entry(resource).or_insert(0);
        *seen = (*seen).max(generation);
    }

    fn drop_held(&self, resource: ResourceId, mask: LeaseMask) {
        let now_empty = match self.held.get_mut(&resource) {
            Some(mut held) => {
                held.mask = held.mask.without(mask);
                held.mask.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.held.remove_if(&resource, |_, h| h.mask.is_empty());
        }
    }

    fn lease_message(&self, op: LeaseOp, resource: ResourceId, mask: LeaseMask, size: u64) -> WireMessage {
        WireMessage::new(
            Command::Lease(op),
            self.failover.originator(),
            Payload::Lease(LeasePayload {
                resource,
                mask: mask.bits(),
                size,
                generation: self.epoch.current(),
                ..Default::default()
            }),
        )
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("fs_name", &self.config.fs_name)
            .field("local", &self.local)
            .field("role", &self.failover.role())
            .field("phase", &self.failover.phase())
            .finish()
    }
}

fn callout_message(resource: ResourceId, request: &CalloutRequest) -> WireMessage {
    WireMessage::new(
        Command::Callout(request.op),
        sharefs_transport::Originator::Server,
        Payload::Callout(CalloutPayload {
            resource,
            actions: request.actions.bits(),
            mask: request.mask.bits(),
            stage_copy: request.stage_copy,
            stage_flags: request.stage_flags,
            size: request.size,
            stale_offset: request.stale_offset,
            error: request.error,
        }),
    )
}

fn grant_payload(grant: &LeaseGrant) -> LeasePayload {
    LeasePayload {
        resource: grant.resource,
        kind: grant.kind.index() as u16,
        mask: grant.leases.bits(),
        actions: grant.actions.bits(),
        flags: 0,
        offset: 0,
        length: 0,
        size: grant.size,
        stale_offset: grant.stale_offset,
        expires_ms: grant
            .expires_in
            .map(|d| d.as_millis().min(u128::from(u32::MAX)) as u32)
            .unwrap_or(0),
        generation: grant.generation,
    }
}

fn grant_from_reply(reply: &WireMessage, kind: LeaseKind) -> Result<LeaseGrant, MetaError> {
    let Payload::Lease(p) = &reply.payload else {
        return Err(ProtocolError::LayoutMismatch { what: "lease reply" }.into());
    };
    Ok(LeaseGrant {
        resource: p.resource,
        kind,
        leases: LeaseMask::from_bits(p.mask),
        actions: DirectedActions::from_bits(p.actions),
        size: p.size,
        stale_offset: p.stale_offset,
        expires_in: (p.expires_ms > 0)
            .then(|| std::time::Duration::from_millis(u64::from(p.expires_ms))),
        generation: p.generation,
    })
}
