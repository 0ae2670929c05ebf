//! Contracts of the collaborators outside the coordination core, with the
//! implementations the daemon and the tests plug in.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ControlKind, DirectedActions, MetaError, PeerOrdinal, Phase, ResourceId, Role};

/// Hand-off phase as last persisted by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseMarker {
    /// Phase entered.
    pub phase: Phase,
    /// Local role at the time.
    pub role: Role,
    /// Coordinator ordinal at the time.
    pub coordinator: PeerOrdinal,
    /// Coordinator generation at the time.
    pub generation: u32,
}

impl PhaseMarker {
    /// True if the instance stopped in the middle of a hand-off.
    pub fn interrupted(&self) -> bool {
        self.phase.is_frozen_or_freezing()
    }
}

/// Authoritative storage of the control resources.
#[async_trait]
pub trait PersistStore: Send + Sync {
    /// Reads a control resource.
    async fn read_control_block(&self, kind: ControlKind) -> Result<Bytes, MetaError>;

    /// Writes a control resource back.
    async fn write_control_block(&self, kind: ControlKind, data: &[u8]) -> Result<(), MetaError>;

    /// Persists the phase marker.
    async fn record_phase(&self, marker: PhaseMarker) -> Result<(), MetaError>;

    /// Last persisted phase marker, if any.
    async fn last_phase(&self) -> Result<Option<PhaseMarker>, MetaError>;
}

/// Local cache operations a directed action translates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMode {
    /// Write back dirty pages.
    SyncPages,
    /// Drop cached pages.
    DropPages,
    /// Bypass the cache.
    DirectIo,
    /// Drop cached block-map entries beyond `offset`.
    StaleIndirect {
        /// First stale byte.
        offset: u64,
    },
    /// Adopt the authoritative size.
    SetSize {
        /// New size.
        size: u64,
    },
    /// Switch to application based buffering.
    Abr,
    /// Treat every cached copy of the resource as stale.
    Stale,
}

/// Applies directed actions to the local cache.
pub trait CacheInvalidator: Send + Sync {
    /// Executes one cache operation on `resource`.
    fn invalidate(&self, resource: ResourceId, mode: InvalidateMode);

    /// Drops every cached name lookup of the filesystem.
    fn purge_name_cache(&self);
}

/// Cache operations for a set of directed actions, in execution order.
///
/// Pages are synced before they are dropped.
pub fn invalidate_modes(actions: DirectedActions, size: u64, stale_offset: u64) -> Vec<InvalidateMode> {
    let mut modes = Vec::new();
    if actions.contains(DirectedActions::SYNC_PAGES) {
        modes.push(InvalidateMode::SyncPages);
    }
    if actions.contains(DirectedActions::INVAL_PAGES) {
        modes.push(InvalidateMode::DropPages);
    }
    if actions.contains(DirectedActions::STALE_INDIRECT) {
        modes.push(InvalidateMode::StaleIndirect {
            offset: stale_offset,
        });
    }
    if actions.contains(DirectedActions::SET_SIZE) || actions.contains(DirectedActions::FORCE_SIZE) {
        modes.push(InvalidateMode::SetSize { size });
    }
    if actions.contains(DirectedActions::DIRECTIO_ON) {
        modes.push(InvalidateMode::DirectIo);
    }
    if actions.contains(DirectedActions::ABR_ON) {
        modes.push(InvalidateMode::Abr);
    }
    modes
}

/// Callback invoked when a peer is declared down.
pub type PeerDownFn = Box<dyn Fn(PeerOrdinal) + Send + Sync>;

/// Source of involuntary failover triggers.
pub trait LivenessMonitor: Send + Sync {
    /// Registers `on_peer_down`.
    fn subscribe(&self, on_peer_down: PeerDownFn);
}

/// In-memory control block store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<HashMap<ControlKind, Bytes>>,
    corrupt: Mutex<HashSet<ControlKind>>,
    phases: Mutex<Vec<PhaseMarker>>,
}

impl MemoryStore {
    /// A store holding a small block for every control resource.
    pub fn new() -> Self {
        let store = Self::default();
        {
            let mut blocks = store.blocks.lock().unwrap();
            for kind in ControlKind::ALL {
                blocks.insert(kind, Bytes::from(format!("{kind}:0")));
            }
        }
        store
    }

    /// Makes reads of `kind` fail.
    pub fn corrupt(&self, kind: ControlKind) {
        self.corrupt.lock().unwrap().insert(kind);
    }

    /// Makes reads of `kind` succeed again.
    pub fn repair(&self, kind: ControlKind) {
        self.corrupt.lock().unwrap().remove(&kind);
    }

    /// Every phase marker recorded so far.
    pub fn phases(&self) -> Vec<PhaseMarker> {
        self.phases.lock().unwrap().clone()
    }

    /// Current contents of a block.
    pub fn block(&self, kind: ControlKind) -> Option<Bytes> {
        self.blocks.lock().unwrap().get(&kind).cloned()
    }
}

#[async_trait]
impl PersistStore for MemoryStore {
    async fn read_control_block(&self, kind: ControlKind) -> Result<Bytes, MetaError> {
        if self.corrupt.lock().unwrap().contains(&kind) {
            return Err(MetaError::ControlBlockUnreadable {
                kind,
                reason: "checksum mismatch".to_string(),
            });
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .ok_or_else(|| MetaError::ControlBlockUnreadable {
                kind,
                reason: "missing".to_string(),
            })
    }

    async fn write_control_block(&self, kind: ControlKind, data: &[u8]) -> Result<(), MetaError> {
        self.blocks
            .lock()
            .unwrap()
            .insert(kind, Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn record_phase(&self, marker: PhaseMarker) -> Result<(), MetaError> {
        self.phases.lock().unwrap().push(marker);
        Ok(())
    }

    async fn last_phase(&self) -> Result<Option<PhaseMarker>, MetaError> {
        Ok(self.phases.lock().unwrap().last().copied())
    }
}

/// Control blocks and phase marker kept as files in one directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

const PHASE_FILE: &str = "phase.json";

impl DirStore {
    /// Opens `dir`, creating it and empty control blocks if missing.
    pub async fn open(dir: &Path) -> Result<Self, MetaError> {
        tokio::fs::create_dir_all(dir).await?;
        let store = Self {
            dir: dir.to_path_buf(),
        };
        for kind in ControlKind::ALL {
            let path = store.block_path(kind);
            if !tokio::fs::try_exists(&path).await? {
                debug!(path = %path.display(), "creating control block");
                store.write_control_block(kind, &[]).await?;
            }
        }
        Ok(store)
    }

    fn block_path(&self, kind: ControlKind) -> PathBuf {
        self.dir.join(format!("{}.blk", kind.name()))
    }

    async fn replace(&self, name: &str, data: &[u8]) -> Result<(), MetaError> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.dir.join(name)).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistStore for DirStore {
    async fn read_control_block(&self, kind: ControlKind) -> Result<Bytes, MetaError> {
        tokio::fs::read(self.block_path(kind))
            .await
            .map(Bytes::from)
            .map_err(|e| MetaError::ControlBlockUnreadable {
                kind,
                reason: e.to_string(),
            })
    }

    async fn write_control_block(&self, kind: ControlKind, data: &[u8]) -> Result<(), MetaError> {
        self.replace(&format!("{}.blk", kind.name()), data).await
    }

    async fn record_phase(&self, marker: PhaseMarker) -> Result<(), MetaError> {
        let json = serde_json::to_vec(&marker)
            .map_err(|e| MetaError::Io(std::io::Error::other(e)))?;
        self.replace(PHASE_FILE, &json).await
    }

    async fn last_phase(&self) -> Result<Option<PhaseMarker>, MetaError> {
        match tokio::fs::read(self.dir.join(PHASE_FILE)).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| MetaError::Io(std::io::Error::other(e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Invalidator that records every request.
#[derive(Debug, Default)]
pub struct CacheLog {
    entries: Mutex<Vec<(ResourceId, InvalidateMode)>>,
    purges: AtomicUsize,
}

impl CacheLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invalidation so far.
    pub fn entries(&self) -> Vec<(ResourceId, InvalidateMode)> {
        self.entries.lock().unwrap().clone()
    }

    /// Invalidations of one resource.
    pub fn modes_for(&self, resource: ResourceId) -> Vec<InvalidateMode> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == resource)
            .map(|(_, m)| *m)
            .collect()
    }

    /// Name cache purges so far.
    pub fn purges(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }
}

impl CacheInvalidator for CacheLog {
    fn invalidate(&self, resource: ResourceId, mode: InvalidateMode) {
        debug!(resource = %resource, ?mode, "invalidate");
        self.entries.lock().unwrap().push((resource, mode));
    }

    fn purge_name_cache(&self) {
        self.purges.fetch_add(1, Ordering::SeqCst);
    }
}

/// Liveness monitor driven by explicit reports.
#[derive(Default)]
pub struct ManualLiveness {
    subscribers: Mutex<Vec<Arc<PeerDownFn>>>,
}

impl ManualLiveness {
    /// Creates a monitor with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `ordinal` down to every subscriber.
    pub fn report_down(&self, ordinal: PeerOrdinal) {
        let subscribers: Vec<Arc<PeerDownFn>> = self.subscribers.lock().unwrap().clone();
        for on_down in subscribers {
            on_down(ordinal);
        }
    }
}

impl LivenessMonitor for ManualLiveness {
    fn subscribe(&self, on_peer_down: PeerDownFn) {
        self.subscribers.lock().unwrap().push(Arc::new(on_peer_down));
    }
}
