//! Lease manager: per-resource lease table owned by the coordinator.
//!
//! Each resource has one record guarded by its own mutex; the map only hands
//! out records. A request that conflicts with another peer's lease marks
//! itself waiting, sends relinquish callouts to the holders and sleeps until a
//! release wakes it, re-evaluating from scratch each time. Callouts are always
//! sent with no record lock held.
//!
//! Grants carry the directed actions the requester must apply before using
//! its cache:
//!
//! - a peer that has not seen the latest write gets `INVAL_PAGES` and
//!   `STALE_INDIRECT`, plus `SYNC_PAGES` for a grant that can write
//! - the first `APPEND` grant to a peer that is not the size owner gets
//!   `FORCE_SIZE`; sharing with an `APPEND` elsewhere gets `SET_SIZE`
//! - concurrent read/write sharing under multi-host-write gets `DIRECTIO_ON`
//! - resources flagged for application based buffering hand out `ABR_ON`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sharefs_transport::CalloutOp;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::types::{DirectedActions, Epoch, LeaseKind, LeaseMask, MetaError, PeerOrdinal, ResourceId};

/// A directed action addressed to one lease holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalloutRequest {
    /// Callout operation.
    pub op: CalloutOp,
    /// Actions to apply.
    pub actions: DirectedActions,
    /// Leases concerned.
    pub mask: LeaseMask,
    /// Authoritative size.
    pub size: u64,
    /// First stale block-map offset.
    pub stale_offset: u64,
    /// Archive copy staged.
    pub stage_copy: u16,
    /// Staging flags.
    pub stage_flags: u16,
    /// Staging error code.
    pub error: i32,
}

impl CalloutRequest {
    /// Asks the holder to give up `mask`.
    pub fn relinquish(mask: LeaseMask) -> Self {
        Self::action(CalloutOp::RelinquishLease, DirectedActions::NONE, mask)
    }

    /// Tells the holder to apply `actions`.
    pub fn action(op: CalloutOp, actions: DirectedActions, mask: LeaseMask) -> Self {
        Self {
            op,
            actions,
            mask,
            size: 0,
            stale_offset: 0,
            stage_copy: 0,
            stage_flags: 0,
            error: 0,
        }
    }
}

/// Delivers callouts to lease holders.
#[async_trait]
pub trait CalloutSink: Send + Sync {
    /// Sends `request` about `resource` to `ordinal`. Must not wait for the
    /// holder to act on it.
    async fn callout(
        &self,
        ordinal: PeerOrdinal,
        resource: ResourceId,
        request: CalloutRequest,
    ) -> Result<(), MetaError>;
}

/// How `acquire` behaves on a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Wait for the holders to relinquish.
    Block,
    /// Return `WouldBlock` at once.
    NoWait,
}

/// Result of a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    /// Leased resource.
    pub resource: ResourceId,
    /// Kind granted.
    pub kind: LeaseKind,
    /// Every lease the requester now holds on the resource.
    pub leases: LeaseMask,
    /// Actions the requester must apply.
    pub actions: DirectedActions,
    /// Authoritative size.
    pub size: u64,
    /// First stale block-map offset.
    pub stale_offset: u64,
    /// Lifetime of the granted kind, `None` if it does not expire.
    pub expires_in: Option<Duration>,
    /// Lease epoch of the grant.
    pub generation: u32,
}

/// Staging details forwarded to the other holders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageInfo {
    /// Archive copy used.
    pub copy: u16,
    /// Staging flags.
    pub flags: u16,
    /// New authoritative size.
    pub size: u64,
    /// Staging error code, 0 on success.
    pub error: i32,
}

#[derive(Debug, Clone)]
struct PeerLease {
    ordinal: PeerOrdinal,
    leases: LeaseMask,
    waiting: LeaseMask,
    waiting_since: Option<Instant>,
    actions: DirectedActions,
    expiry: [Option<Instant>; 8],
    write_seq: u64,
    directio: bool,
    abr: bool,
}

impl PeerLease {
    fn new(ordinal: PeerOrdinal) -> Self {
        Self {
            ordinal,
            leases: LeaseMask::EMPTY,
            waiting: LeaseMask::EMPTY,
            waiting_since: None,
            actions: DirectedActions::NONE,
            expiry: [None; 8],
            write_seq: 0,
            directio: false,
            abr: false,
        }
    }

    /// Leases still in force at `now`.
    fn live(&self, now: Instant) -> LeaseMask {
        let mut live = LeaseMask::EMPTY;
        for kind in self.leases.kinds() {
            match self.expiry[kind.index()] {
                Some(at) if at <= now => {}
                _ => live |= kind.mask(),
            }
        }
        live
    }

    fn drop_leases(&mut self, mask: LeaseMask) {
        self.leases = self.leases.without(mask);
        for kind in mask.kinds() {
            self.expiry[kind.index()] = None;
        }
        if self.leases.is_empty() {
            self.directio = false;
            self.abr = false;
            self.actions = DirectedActions::NONE;
        }
    }

    fn is_idle(&self) -> bool {
        self.leases.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Debug)]
struct LeaseRecord {
    write_seq: u64,
    size_owner: Option<PeerOrdinal>,
    size: u64,
    abr: bool,
    retired: bool,
    peers: Vec<PeerLease>,
}

impl LeaseRecord {
    fn new() -> Self {
        // A peer new to the record must not trust what it cached before.
        Self {
            write_seq: 1,
            size_owner: None,
            size: 0,
            abr: false,
            retired: false,
            peers: Vec::new(),
        }
    }

    fn peer(&self, ordinal: PeerOrdinal) -> Option<&PeerLease> {
        self.peers.iter().find(|p| p.ordinal == ordinal)
    }

    fn peer_mut(&mut self, ordinal: PeerOrdinal) -> &mut PeerLease {
        let idx = match self.peers.iter().position(|p| p.ordinal == ordinal) {
            Some(idx) => idx,
            None => {
                self.peers.push(PeerLease::new(ordinal));
                self.peers.len() - 1
            }
        };
        &mut self.peers[idx]
    }

    fn prune(&mut self) {
        self.peers.retain(|p| !p.is_idle());
    }

    fn is_empty(&self) -> bool {
        self.peers.iter().all(|p| p.is_idle())
    }

    fn others_hold(&self, ordinal: PeerOrdinal, mask: LeaseMask, now: Instant) -> bool {
        self.peers
            .iter()
            .any(|p| p.ordinal != ordinal && p.live(now).intersects(mask))
    }
}

struct LeaseSlot {
    record: Mutex<LeaseRecord>,
    released: Notify,
}

enum Decision {
    Granted {
        grant: LeaseGrant,
        notices: Vec<(PeerOrdinal, CalloutRequest)>,
    },
    Blocked {
        relinquish: Vec<(PeerOrdinal, CalloutRequest)>,
    },
}

/// Grants, tracks and revokes leases.
pub struct LeaseManager {
    records: DashMap<ResourceId, Arc<LeaseSlot>>,
    epoch: Arc<Epoch>,
    config: LeaseConfig,
    sink: Arc<dyn CalloutSink>,
}

const WAIT_TICK: Duration = Duration::from_secs(1);

impl LeaseManager {
    /// Creates an empty lease table.
    pub fn new(config: LeaseConfig, epoch: Arc<Epoch>, sink: Arc<dyn CalloutSink>) -> Self {
        Self {
            records: DashMap::new(),
            epoch,
            config,
            sink,
        }
    }

    /// Lease policy in force.
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn slot(&self, resource: ResourceId) -> Arc<LeaseSlot> {
        self.records
            .entry(resource)
            .or_insert_with(|| {
                Arc::new(LeaseSlot {
                    record: Mutex::new(LeaseRecord::new()),
                    released: Notify::new(),
                })
            })
            .clone()
    }

    fn slots(&self) -> Vec<(ResourceId, Arc<LeaseSlot>)> {
        self.records
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Removes the record if it is empty. Called with the record locked.
    fn retire_if_empty(&self, resource: ResourceId, slot: &Arc<LeaseSlot>, record: &mut LeaseRecord) {
        record.prune();
        if record.is_empty() && !record.retired {
            record.retired = true;
            self.records
                .remove_if(&resource, |_, current| Arc::ptr_eq(current, slot));
        }
    }

    /// Grants `kind` on `resource` to `ordinal`.
    ///
    /// A request carrying a generation older than the current epoch fails
    /// with `StaleGeneration`. On conflict the holders are asked to
    /// relinquish; with [`WaitMode::NoWait`] the call then returns
    /// `WouldBlock`, otherwise it waits in one-second steps up to the longest
    /// lease interval before giving up with `PeerUnreachable`.
    pub async fn acquire(
        &self,
        resource: ResourceId,
        ordinal: PeerOrdinal,
        kind: LeaseKind,
        generation: u32,
        mode: WaitMode,
    ) -> Result<LeaseGrant, MetaError> {
        let started_epoch = self.epoch.current();
        if generation < started_epoch {
            return Err(MetaError::StaleGeneration {
                got: generation,
                current: started_epoch,
            });
        }
        let deadline = Instant::now() + self.config.longest();
        let mut resend = true;

        loop {
            let current = self.epoch.current();
            if current != started_epoch {
                return Err(MetaError::StaleGeneration {
                    got: generation,
                    current,
                });
            }

            let slot = self.slot(resource);
            let released = slot.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let decision = {
                let mut record = slot.record.lock().unwrap();
                if record.retired {
                    None
                } else {
                    Some(self.decide(&mut record, resource, ordinal, kind, Instant::now()))
                }
            };

            match decision {
                None => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Some(Decision::Granted { grant, notices }) => {
                    for (peer, request) in notices {
                        self.deliver(peer, resource, request).await;
                    }
                    debug!(resource = %resource, ordinal = %ordinal, %kind, actions = %grant.actions, "lease granted");
                    return Ok(grant);
                }
                Some(Decision::Blocked { relinquish }) => {
                    if resend {
                        for (peer, request) in relinquish {
                            self.deliver(peer, resource, request).await;
                        }
                    }
                    if mode == WaitMode::NoWait {
                        self.stop_waiting(resource, ordinal, kind);
                        return Err(MetaError::WouldBlock(resource));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        self.stop_waiting(resource, ordinal, kind);
                        warn!(resource = %resource, ordinal = %ordinal, %kind, "holders did not relinquish in time");
                        return Err(MetaError::PeerUnreachable(resource));
                    }
                    let step = WAIT_TICK.min(deadline - now);
                    resend = tokio::time::timeout(step, released).await.is_err();
                }
            }
        }
    }

    async fn deliver(&self, peer: PeerOrdinal, resource: ResourceId, request: CalloutRequest) {
        if let Err(e) = self.sink.callout(peer, resource, request).await {
            debug!(resource = %resource, ordinal = %peer, op = ?request.op, error = %e, "callout not delivered");
        }
    }

    fn stop_waiting(&self, resource: ResourceId, ordinal: PeerOrdinal, kind: LeaseKind) {
        if let Some(slot) = self.records.get(&resource).map(|s| s.clone()) {
            let mut record = slot.record.lock().unwrap();
            let peer = record.peer_mut(ordinal);
            peer.waiting = peer.waiting.without(kind.mask());
            if peer.waiting.is_empty() {
                peer.waiting_since = None;
            }
            self.retire_if_empty(resource, &slot, &mut record);
        }
    }

    fn decide(
        &self,
        record: &mut LeaseRecord,
        resource: ResourceId,
        ordinal: PeerOrdinal,
        kind: LeaseKind,
        now: Instant,
    ) -> Decision {
        let multi = self.config.multi_host_write;
        let mmap_elsewhere = record.others_hold(ordinal, LeaseMask::MMAP, now);
        let mut blocked = false;
        let mut directio = false;
        let mut relinquish = Vec::new();

        for other in record.peers.iter().filter(|p| p.ordinal != ordinal) {
            let held = other.live(now);
            if held.is_empty() {
                continue;
            }
            let mut revoke = LeaseMask::EMPTY;
            match kind {
                LeaseKind::Read | LeaseKind::Mmap => {
                    if held.intersects(LeaseMask::TRUNCATE) {
                        blocked = true;
                    }
                    if held.intersects(LeaseMask::EXCLUSIVE) {
                        if multi && kind == LeaseKind::Read {
                            directio = true;
                        } else {
                            blocked = true;
                            revoke |= held & LeaseMask::EXCLUSIVE;
                        }
                    }
                }
                LeaseKind::Write | LeaseKind::Append => {
                    if held.intersects(LeaseMask::TRUNCATE | LeaseMask::STAGE) {
                        blocked = true;
                    }
                    if held.intersects(LeaseMask::EXCLUSIVE) {
                        blocked = true;
                        revoke |= held & LeaseMask::EXCLUSIVE;
                    }
                    let readers = held & (LeaseMask::READ | LeaseMask::MMAP);
                    if !readers.is_empty() {
                        if multi && !mmap_elsewhere {
                            directio = true;
                        } else {
                            blocked = true;
                            revoke |= readers;
                        }
                    }
                }
                LeaseKind::Truncate => {
                    let conflicting = held
                        .without(LeaseMask::STAGE | LeaseMask::OPEN | LeaseMask::RECORD_LOCK);
                    if !conflicting.is_empty() {
                        blocked = true;
                        revoke |= conflicting.without(LeaseMask::TRUNCATE);
                    }
                }
                LeaseKind::RecordLock | LeaseKind::Stage | LeaseKind::Open => {}
            }
            if !revoke.is_empty() {
                relinquish.push((other.ordinal, CalloutRequest::relinquish(revoke)));
            }
        }

        if blocked {
            let peer = record.peer_mut(ordinal);
            peer.waiting |= kind.mask();
            peer.waiting_since.get_or_insert(now);
            return Decision::Blocked { relinquish };
        }
        self.grant(record, resource, ordinal, kind, directio, now)
    }

    fn grant(
        &self,
        record: &mut LeaseRecord,
        resource: ResourceId,
        ordinal: PeerOrdinal,
        kind: LeaseKind,
        directio: bool,
        now: Instant,
    ) -> Decision {
        let append_elsewhere = record.others_hold(ordinal, LeaseMask::APPEND, now);
        let record_write_seq = record.write_seq;
        let size_owner = record.size_owner;
        let abr = record.abr;

        let mut actions = DirectedActions::NONE;
        let peer_seq = record.peer(ordinal).map(|p| p.write_seq).unwrap_or(0);
        if peer_seq < record_write_seq {
            actions |= DirectedActions::INVAL_PAGES | DirectedActions::STALE_INDIRECT;
            if kind.can_write() {
                actions |= DirectedActions::SYNC_PAGES;
            }
        }
        let mut write_seq = record_write_seq;
        if kind.can_write() {
            write_seq += 1;
        }
        if kind == LeaseKind::Append && size_owner != Some(ordinal) {
            actions |= DirectedActions::FORCE_SIZE;
        }
        if append_elsewhere {
            actions |= DirectedActions::SET_SIZE;
        }

        let mut notices = Vec::new();
        if directio {
            actions |= DirectedActions::DIRECTIO_ON;
            for other in record.peers.iter_mut().filter(|p| p.ordinal != ordinal) {
                if !other.directio && !other.live(now).is_empty() {
                    other.directio = true;
                    notices.push((
                        other.ordinal,
                        CalloutRequest::action(
                            CalloutOp::Flags,
                            DirectedActions::DIRECTIO_ON,
                            other.leases,
                        ),
                    ));
                }
            }
        }

        record.write_seq = write_seq;
        if kind == LeaseKind::Append {
            record.size_owner = Some(ordinal);
        }
        let size = record.size;
        let interval = self.config.interval(kind);

        let peer = record.peer_mut(ordinal);
        if abr && !peer.abr {
            peer.abr = true;
            actions |= DirectedActions::ABR_ON;
        }
        peer.directio |= directio;
        peer.write_seq = write_seq;
        peer.leases |= kind.mask();
        peer.expiry[kind.index()] = interval.map(|d| now + d);
        peer.waiting = peer.waiting.without(kind.mask());
        if peer.waiting.is_empty() {
            peer.waiting_since = None;
        }
        peer.actions = actions;

        Decision::Granted {
            grant: LeaseGrant {
                resource,
                kind,
                leases: peer.leases,
                actions,
                size,
                stale_offset: size,
                expires_in: interval,
                generation: self.epoch.current(),
            },
            notices,
        }
    }

    /// Drops `mask` held by `ordinal` on `resource` and wakes waiters.
    /// Returns the leases the peer still holds.
    pub fn release(&self, resource: ResourceId, ordinal: PeerOrdinal, mask: LeaseMask) -> LeaseMask {
        let Some(slot) = self.records.get(&resource).map(|s| s.clone()) else {
            return LeaseMask::EMPTY;
        };
        let remaining = {
            let mut record = slot.record.lock().unwrap();
            let remaining = match record.peers.iter_mut().find(|p| p.ordinal == ordinal) {
                Some(peer) => {
                    peer.drop_leases(mask);
                    peer.leases
                }
                None => LeaseMask::EMPTY,
            };
            self.retire_if_empty(resource, &slot, &mut record);
            remaining
        };
        slot.released.notify_waiters();
        debug!(resource = %resource, ordinal = %ordinal, released = %mask, %remaining, "lease released");
        remaining
    }

    /// Tells every holder other than `origin` that staging changed the size.
    pub async fn notify_staging_clients(
        &self,
        resource: ResourceId,
        origin: PeerOrdinal,
        info: StageInfo,
    ) -> Vec<PeerOrdinal> {
        let Some(slot) = self.records.get(&resource).map(|s| s.clone()) else {
            return Vec::new();
        };
        let now = Instant::now();
        let targets: Vec<(PeerOrdinal, LeaseMask)> = {
            let mut record = slot.record.lock().unwrap();
            if info.error == 0 {
                record.size = info.size;
            }
            record
                .peers
                .iter()
                .filter(|p| p.ordinal != origin)
                .map(|p| (p.ordinal, p.live(now)))
                .filter(|(_, m)| !m.is_empty())
                .collect()
        };
        for (peer, mask) in &targets {
            let mut request =
                CalloutRequest::action(CalloutOp::Stage, DirectedActions::FORCE_SIZE, *mask);
            request.size = info.size;
            request.stage_copy = info.copy;
            request.stage_flags = info.flags;
            request.error = info.error;
            self.deliver(*peer, resource, request).await;
        }
        targets.into_iter().map(|(p, _)| p).collect()
    }

    /// Reinstates leases a peer re-reports to a new coordinator. No conflict
    /// checks are made.
    pub fn reinstate(&self, resource: ResourceId, ordinal: PeerOrdinal, mask: LeaseMask, size: u64) {
        if mask.is_empty() {
            return;
        }
        let now = Instant::now();
        let slot = self.slot(resource);
        let mut record = slot.record.lock().unwrap();
        record.size = record.size.max(size);
        if mask.contains(LeaseMask::APPEND) && record.size_owner.is_none() {
            record.size_owner = Some(ordinal);
        }
        let write_seq = record.write_seq;
        let peer = record.peer_mut(ordinal);
        peer.write_seq = write_seq;
        for kind in mask.kinds() {
            peer.leases |= kind.mask();
            peer.expiry[kind.index()] = self.config.interval(kind).map(|d| now + d);
        }
        debug!(resource = %resource, ordinal = %ordinal, %mask, "lease reinstated");
    }

    /// Flags `resource` for application based buffering and tells the current
    /// holders. Returns the peers told.
    pub async fn set_abr(&self, resource: ResourceId) -> Vec<PeerOrdinal> {
        let now = Instant::now();
        let slot = self.slot(resource);
        let targets: Vec<(PeerOrdinal, LeaseMask)> = {
            let mut record = slot.record.lock().unwrap();
            record.abr = true;
            let mut targets = Vec::new();
            for peer in record.peers.iter_mut() {
                let live = peer.live(now);
                if !live.is_empty() && !peer.abr {
                    peer.abr = true;
                    targets.push((peer.ordinal, live));
                }
            }
            targets
        };
        for (peer, mask) in &targets {
            let request = CalloutRequest::action(CalloutOp::Flags, DirectedActions::ABR_ON, *mask);
            self.deliver(*peer, resource, request).await;
        }
        targets.into_iter().map(|(p, _)| p).collect()
    }

    /// Wakes requests waiting on `resource`.
    pub fn wake(&self, resource: ResourceId) {
        if let Some(slot) = self.records.get(&resource).map(|s| s.clone()) {
            slot.released.notify_waiters();
        }
    }

    /// Drops expired leases and waiter marks older than twice the longest
    /// interval, destroying records left empty. Returns the leases dropped.
    pub fn expire(&self, now: Instant) -> usize {
        let stale_wait = self.config.longest() * 2;
        let mut dropped = 0;
        for (resource, slot) in self.slots() {
            let changed = {
                let mut record = slot.record.lock().unwrap();
                let mut changed = false;
                for peer in record.peers.iter_mut() {
                    let expired = peer.leases.without(peer.live(now));
                    if !expired.is_empty() {
                        debug!(resource = %resource, ordinal = %peer.ordinal, %expired, "lease expired");
                        dropped += expired.kinds().count();
                        peer.drop_leases(expired);
                        changed = true;
                    }
                    if let Some(since) = peer.waiting_since {
                        if now.duration_since(since) >= stale_wait {
                            peer.waiting = LeaseMask::EMPTY;
                            peer.waiting_since = None;
                            changed = true;
                        }
                    }
                }
                self.retire_if_empty(resource, &slot, &mut record);
                changed
            };
            if changed {
                slot.released.notify_waiters();
            }
        }
        dropped
    }

    /// Drops the whole table. Waiters started before the reset see the new
    /// epoch and fail with `StaleGeneration`.
    pub fn reset_epoch(&self) {
        let slots = self.slots();
        self.records.clear();
        for (_, slot) in &slots {
            slot.record.lock().unwrap().retired = true;
            slot.released.notify_waiters();
        }
        info!(records = slots.len(), generation = self.epoch.current(), "lease table reset");
    }

    /// Releases record locks held by peers `disconnected` reports as gone.
    pub fn release_record_locks(&self, disconnected: impl Fn(PeerOrdinal) -> bool) -> usize {
        let mut released = 0;
        for (resource, slot) in self.slots() {
            {
                let mut record = slot.record.lock().unwrap();
                for peer in record.peers.iter_mut() {
                    if peer.leases.contains(LeaseMask::RECORD_LOCK) && disconnected(peer.ordinal) {
                        peer.drop_leases(LeaseMask::RECORD_LOCK);
                        released += 1;
                    }
                }
                self.retire_if_empty(resource, &slot, &mut record);
            }
            slot.released.notify_waiters();
        }
        released
    }

    /// Drops every lease and waiter mark of `ordinal`.
    pub fn release_peer(&self, ordinal: PeerOrdinal) -> usize {
        let mut released = 0;
        for (resource, slot) in self.slots() {
            let touched = {
                let mut record = slot.record.lock().unwrap();
                let touched = match record.peers.iter_mut().find(|p| p.ordinal == ordinal) {
                    Some(peer) => {
                        released += peer.leases.kinds().count();
                        peer.drop_leases(LeaseMask::ALL);
                        peer.waiting = LeaseMask::EMPTY;
                        peer.waiting_since = None;
                        true
                    }
                    None => false,
                };
                self.retire_if_empty(resource, &slot, &mut record);
                touched
            };
            if touched {
                slot.released.notify_waiters();
            }
        }
        if released > 0 {
            info!(ordinal = %ordinal, released, "revoked leases of lost peer");
        }
        released
    }

    /// Live leases on `resource`, per holder.
    pub fn holders(&self, resource: ResourceId) -> Vec<(PeerOrdinal, LeaseMask)> {
        let Some(slot) = self.records.get(&resource).map(|s| s.clone()) else {
            return Vec::new();
        };
        let now = Instant::now();
        let record = slot.record.lock().unwrap();
        record
            .peers
            .iter()
            .map(|p| (p.ordinal, p.live(now)))
            .filter(|(_, m)| !m.is_empty())
            .collect()
    }

    /// Number of lease records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<(PeerOrdinal, ResourceId, CalloutRequest)>);

    #[async_trait]
    impl CalloutSink for ChannelSink {
        async fn callout(
            &self,
            ordinal: PeerOrdinal,
            resource: ResourceId,
            request: CalloutRequest,
        ) -> Result<(), MetaError> {
            let _ = self.0.send((ordinal, resource, request));
            Ok(())
        }
    }

    type Callouts = mpsc::UnboundedReceiver<(PeerOrdinal, ResourceId, CalloutRequest)>;

    fn manager(config: LeaseConfig) -> (Arc<LeaseManager>, Callouts) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = LeaseManager::new(config, Arc::new(Epoch::new(1)), Arc::new(ChannelSink(tx)));
        (Arc::new(manager), rx)
    }

    fn short_leases() -> LeaseConfig {
        LeaseConfig {
            read_secs: 2,
            write_secs: 2,
            append_secs: 2,
            stage_secs: 2,
            multi_host_write: false,
        }
    }

    const F: ResourceId = ResourceId::new(100, 1);
    const A: PeerOrdinal = PeerOrdinal::new(1);
    const B: PeerOrdinal = PeerOrdinal::new(2);
    const C: PeerOrdinal = PeerOrdinal::new(3);

    #[tokio::test]
    async fn test_readers_share() {
        let (leases, mut callouts) = manager(LeaseConfig::default());
        let a = leases.acquire(F, A, LeaseKind::Read, 1, WaitMode::NoWait).await.unwrap();
        let b = leases.acquire(F, B, LeaseKind::Read, 1, WaitMode::NoWait).await.unwrap();
        assert_eq!(a.leases, LeaseMask::READ);
        assert_eq!(
            b.actions,
            DirectedActions::INVAL_PAGES | DirectedActions::STALE_INDIRECT
        );
        assert_eq!(b.expires_in, Some(Duration::from_secs(30)));
        assert_eq!(leases.holders(F).len(), 2);
        assert!(callouts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_waits_for_relinquish() {
        let (leases, mut callouts) = manager(LeaseConfig::default());
        let first = leases.acquire(F, A, LeaseKind::Write, 1, WaitMode::Block).await.unwrap();
        assert!(first.actions.contains(DirectedActions::SYNC_PAGES));

        let waiter = {
            let leases = leases.clone();
            tokio::spawn(async move { leases.acquire(F, B, LeaseKind::Write, 1, WaitMode::Block).await })
        };

        let (to, resource, request) = callouts.recv().await.unwrap();
        assert_eq!((to, resource), (A, F));
        assert_eq!(request.op, CalloutOp::RelinquishLease);
        assert_eq!(request.mask, LeaseMask::WRITE);

        assert_eq!(leases.release(F, A, LeaseMask::WRITE), LeaseMask::EMPTY);
        let grant = waiter.await.unwrap().unwrap();
        assert!(grant.actions.contains(DirectedActions::SYNC_PAGES));
        assert!(grant.actions.contains(DirectedActions::INVAL_PAGES));
        assert_eq!(leases.holders(F), vec![(B, LeaseMask::WRITE)]);
    }

    #[tokio::test]
    async fn test_nowait_returns_would_block() {
        let (leases, mut callouts) = manager(LeaseConfig::default());
        leases.acquire(F, A, LeaseKind::Append, 1, WaitMode::NoWait).await.unwrap();
        let err = leases
            .acquire(F, B, LeaseKind::Read, 1, WaitMode::NoWait)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::WouldBlock(r) if r == F));
        assert!(err.is_retryable());
        let (to, _, request) = callouts.try_recv().unwrap();
        assert_eq!(to, A);
        assert_eq!(request.mask, LeaseMask::APPEND);

        // The refused request leaves nothing waiting behind it.
        assert_eq!(leases.release(F, A, LeaseMask::APPEND), LeaseMask::EMPTY);
        assert_eq!(leases.record_count(), 0);
        assert!(leases.holders(F).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_holder_is_unreachable() {
        let (leases, mut callouts) = manager(short_leases());
        leases.acquire(F, A, LeaseKind::Truncate, 1, WaitMode::Block).await.unwrap();
        let started = Instant::now();
        let err = leases
            .acquire(F, B, LeaseKind::Write, 1, WaitMode::Block)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::PeerUnreachable(r) if r == F));
        assert!(started.elapsed() >= Duration::from_secs(2));
        // truncate is waited out, never revoked
        assert!(callouts.try_recv().is_err());
        assert_eq!(leases.holders(F), vec![(A, LeaseMask::TRUNCATE)]);
    }

    #[tokio::test]
    async fn test_stale_generation_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let leases = LeaseManager::new(
            LeaseConfig::default(),
            Arc::new(Epoch::new(5)),
            Arc::new(ChannelSink(tx)),
        );
        let err = leases
            .acquire(F, A, LeaseKind::Read, 4, WaitMode::Block)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::StaleGeneration { got: 4, current: 5 }));
        assert_eq!(leases.record_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_epoch_fails_waiters() {
        let (tx, mut callouts) = mpsc::unbounded_channel();
        let epoch = Arc::new(Epoch::new(1));
        let leases = Arc::new(LeaseManager::new(
            LeaseConfig::default(),
            epoch.clone(),
            Arc::new(ChannelSink(tx)),
        ));
        leases.acquire(F, A, LeaseKind::Write, 1, WaitMode::Block).await.unwrap();
        let waiter = {
            let leases = leases.clone();
            tokio::spawn(async move { leases.acquire(F, B, LeaseKind::Read, 1, WaitMode::Block).await })
        };
        callouts.recv().await.unwrap();

        epoch.advance();
        leases.reset_epoch();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, MetaError::StaleGeneration { got: 1, current: 2 }));
        assert_eq!(leases.record_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_host_write_goes_direct() {
        let config = LeaseConfig {
            multi_host_write: true,
            ..Default::default()
        };
        let (leases, mut callouts) = manager(config);
        leases.acquire(F, A, LeaseKind::Append, 1, WaitMode::NoWait).await.unwrap();
        let grant = leases
            .acquire(F, B, LeaseKind::Read, 1, WaitMode::NoWait)
            .await
            .unwrap();
        assert!(grant.actions.contains(DirectedActions::DIRECTIO_ON));
        assert!(grant.actions.contains(DirectedActions::SET_SIZE));

        let (to, _, request) = callouts.try_recv().unwrap();
        assert_eq!(to, A);
        assert_eq!(request.op, CalloutOp::Flags);
        assert_eq!(request.actions, DirectedActions::DIRECTIO_ON);

        // mmap never shares through direct I/O
        let err = leases
            .acquire(F, C, LeaseKind::Mmap, 1, WaitMode::NoWait)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::WouldBlock(_)));
    }

    #[tokio::test]
    async fn test_append_forces_size_once() {
        let (leases, _callouts) = manager(LeaseConfig::default());
        let first = leases.acquire(F, A, LeaseKind::Append, 1, WaitMode::NoWait).await.unwrap();
        assert!(first.actions.contains(DirectedActions::FORCE_SIZE));
        let again = leases.acquire(F, A, LeaseKind::Append, 1, WaitMode::NoWait).await.unwrap();
        assert!(!again.actions.contains(DirectedActions::FORCE_SIZE));
        assert!(again.actions.is_empty());
    }

    #[tokio::test]
    async fn test_truncate_ignores_open_and_record_locks() {
        let (leases, _callouts) = manager(LeaseConfig::default());
        leases.acquire(F, A, LeaseKind::Open, 1, WaitMode::NoWait).await.unwrap();
        leases.acquire(F, A, LeaseKind::RecordLock, 1, WaitMode::NoWait).await.unwrap();
        let grant = leases
            .acquire(F, B, LeaseKind::Truncate, 1, WaitMode::NoWait)
            .await
            .unwrap();
        assert_eq!(grant.expires_in, None);

        let err = leases
            .acquire(F, C, LeaseKind::Read, 1, WaitMode::NoWait)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::WouldBlock(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_leases_are_swept() {
        let (leases, _callouts) = manager(short_leases());
        leases.acquire(F, A, LeaseKind::Write, 1, WaitMode::NoWait).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        // expired leases no longer conflict
        leases.acquire(F, B, LeaseKind::Write, 1, WaitMode::NoWait).await.unwrap();
        assert_eq!(leases.holders(F), vec![(B, LeaseMask::WRITE)]);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(leases.expire(Instant::now()), 2);
        assert_eq!(leases.record_count(), 0);
    }

    #[tokio::test]
    async fn test_staging_notifies_other_holders() {
        let (leases, mut callouts) = manager(LeaseConfig::default());
        leases.acquire(F, A, LeaseKind::Read, 1, WaitMode::NoWait).await.unwrap();
        leases.acquire(F, B, LeaseKind::Stage, 1, WaitMode::NoWait).await.unwrap();
        leases.acquire(F, C, LeaseKind::Read, 1, WaitMode::NoWait).await.unwrap();

        let info = StageInfo {
            copy: 2,
            size: 8192,
            ..Default::default()
        };
        let mut told = leases.notify_staging_clients(F, B, info).await;
        told.sort();
        assert_eq!(told, vec![A, C]);
        while let Ok((to, _, request)) = callouts.try_recv() {
            assert_ne!(to, B);
            assert_eq!(request.op, CalloutOp::Stage);
            assert_eq!(request.actions, DirectedActions::FORCE_SIZE);
            assert_eq!(request.size, 8192);
            assert_eq!(request.stage_copy, 2);
        }
        let later = leases.acquire(F, A, LeaseKind::Open, 1, WaitMode::NoWait).await.unwrap();
        assert_eq!(later.size, 8192);
    }

    #[tokio::test]
    async fn test_release_record_locks_and_peer() {
        let (leases, _callouts) = manager(LeaseConfig::default());
        let g = ResourceId::new(200, 1);
        leases.acquire(F, A, LeaseKind::RecordLock, 1, WaitMode::NoWait).await.unwrap();
        leases.acquire(F, B, LeaseKind::RecordLock, 1, WaitMode::NoWait).await.unwrap();
        leases.acquire(g, B, LeaseKind::Read, 1, WaitMode::NoWait).await.unwrap();

        assert_eq!(leases.release_record_locks(|o| o == B), 1);
        assert_eq!(leases.holders(F), vec![(A, LeaseMask::RECORD_LOCK)]);

        assert_eq!(leases.release_peer(B), 1);
        assert!(leases.holders(g).is_empty());
        assert_eq!(leases.record_count(), 1);
    }

    #[tokio::test]
    async fn test_reinstate_and_abr() {
        let (leases, mut callouts) = manager(LeaseConfig::default());
        leases.reinstate(F, A, LeaseMask::APPEND | LeaseMask::OPEN, 4096);
        assert_eq!(leases.holders(F), vec![(A, LeaseMask::APPEND | LeaseMask::OPEN)]);

        assert_eq!(leases.set_abr(F).await, vec![A]);
        let (_, _, request) = callouts.try_recv().unwrap();
        assert_eq!(request.actions, DirectedActions::ABR_ON);

        let grant = leases.acquire(F, A, LeaseKind::Append, 1, WaitMode::NoWait).await.unwrap();
        assert!(!grant.actions.contains(DirectedActions::FORCE_SIZE));
        assert!(!grant.actions.contains(DirectedActions::ABR_ON));
        assert_eq!(grant.size, 4096);

        let open = leases.acquire(F, B, LeaseKind::Open, 1, WaitMode::NoWait).await.unwrap();
        assert!(open.actions.contains(DirectedActions::ABR_ON));
        assert!(open.actions.contains(DirectedActions::SET_SIZE));
    }
}
