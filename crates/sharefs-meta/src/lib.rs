#![warn(missing_docs)]

//! ShareFS metadata subsystem: client registry, lease manager, coordinator
//! failover and the per-filesystem instance tying them to the peer transport

pub mod collab;
pub mod config;
pub mod failover;
pub mod instance;
pub mod lease;
pub mod messenger;
pub mod registry;
pub mod service;
pub mod session;
pub mod types;

pub use collab::{
    CacheInvalidator, CacheLog, DirStore, InvalidateMode, LivenessMonitor, ManualLiveness,
    MemoryStore, PersistStore, PhaseMarker,
};
pub use config::{LeaseConfig, MetaConfig, PeerConfig, SendConfig};
pub use failover::{FailoverCoordinator, FailoverStatus};
pub use instance::Instance;
pub use lease::{CalloutRequest, CalloutSink, LeaseGrant, LeaseManager, StageInfo, WaitMode};
pub use messenger::Messenger;
pub use registry::{AdminState, ClientRegistry};
pub use service::{accept_peer, join_peer};
pub use session::{ClientSession, SessionFlags};
pub use types::{
    ControlKind, DirectedActions, Epoch, LeaseKind, LeaseMask, MetaError, PeerInfo, PeerOrdinal,
    Phase, ResourceId, Role,
};
