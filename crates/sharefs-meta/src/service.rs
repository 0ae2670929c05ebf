//! Connection handling and background tasks: the handshake, one reader per
//! peer, the worker pool that runs message handlers and the periodic sweep.

use std::sync::{Arc, Weak};
use std::time::Duration;

use sharefs_transport::message::STATUS_MOUNTED;
use sharefs_transport::{codec, Command, MountOp, Payload, PeerLink, TransportError, WireMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::failover::InFlightGuard;
use crate::instance::Instance;
use crate::messenger::error_reply;
use crate::session::{ClientSession, PeerTags};
use crate::types::{MetaError, PeerOrdinal, ReplyContext};

/// A decoded message waiting for a worker.
pub(crate) struct Job {
    from: PeerOrdinal,
    msg: WireMessage,
    guard: InFlightGuard,
}

/// Bounded pool of tasks running message handlers.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(instance: &Arc<Instance>, workers: usize, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let instance = Arc::downgrade(instance);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        let Some(instance) = instance.upgrade() else { break };
                        instance.dispatch(job.from, job.msg, job.guard).await;
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self { tx, handles }
    }

    async fn submit(&self, job: Job) -> bool {
        self.tx.send(job).await.is_ok()
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub(crate) fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn link_error(ordinal: PeerOrdinal, error: TransportError) -> MetaError {
    match error {
        TransportError::Protocol(e) => MetaError::Protocol(e),
        _ => MetaError::NotConnected(ordinal),
    }
}

/// Runs the accepting side of the handshake on a new connection.
///
/// Reads MOUNT/init, registers the peer and answers with the current
/// coordinator view. A refused peer gets an error reply and the link is
/// closed.
pub async fn accept_peer(instance: &Arc<Instance>, link: Arc<dyn PeerLink>) -> Result<PeerOrdinal, MetaError> {
    let frame = link
        .recv_frame()
        .await
        .map_err(|e| link_error(PeerOrdinal::COORDINATOR, e))?;
    let order = codec::sender_order(&frame)?;
    let init = codec::decode(&frame)?;
    let ordinal = init.header.origin;

    let session = match admit(instance, &init, PeerTags { byte_order: order, capabilities: 0 }, &link) {
        Ok(session) => session,
        Err(e) => {
            warn!(ordinal = %ordinal, addr = %link.peer_addr(), error = %e, "handshake refused");
            let mut reply = error_reply(&init, instance.local(), &e);
            instance.messenger().stamp(&mut reply, ordinal, 0);
            if let Ok(frame) = codec::encode(&reply) {
                let _ = link.send_frame(&frame).await;
            }
            link.close().await;
            return Err(e);
        }
    };

    let failover = instance.failover();
    let view = failover.mount_message(
        MountOp::Init,
        failover.coordinator(),
        failover.max_ordinal(),
        failover.generation(),
    );
    let reply = WireMessage::reply_to(&init.header, instance.local(), view.payload);
    spawn_reader(instance, session);
    instance.messenger().reply(ordinal, reply).await?;
    info!(ordinal = %ordinal, addr = %link.peer_addr(), ?order, "peer accepted");
    Ok(ordinal)
}

fn admit(
    instance: &Arc<Instance>,
    init: &WireMessage,
    mut tags: PeerTags,
    link: &Arc<dyn PeerLink>,
) -> Result<Arc<ClientSession>, MetaError> {
    let config = instance.config();
    let Payload::Mount(p) = &init.payload else {
        return Err(MetaError::Unsupported(format!("{} before handshake", init.command())));
    };
    if init.command() != Command::Mount(MountOp::Init) || init.header.is_reply() {
        return Err(MetaError::Unsupported(format!("{} before handshake", init.command())));
    }
    if p.fs_name.as_str() != config.fs_name || init.header.fs_id != config.fs_id {
        return Err(MetaError::Config(format!(
            "peer mounts '{}' ({}), local filesystem is '{}' ({})",
            p.fs_name.as_str(),
            init.header.fs_id,
            config.fs_name,
            config.fs_id
        )));
    }
    tags.capabilities = p.config;
    let ordinal = init.header.origin;
    let session = instance
        .registry()
        .add_client(ordinal, &p.host_name.as_str(), tags, link.clone())?;
    instance
        .registry()
        .set_mounted(ordinal, p.status & STATUS_MOUNTED != 0);
    if p.coordinator != 0 {
        instance.failover().learn_coordinator(
            PeerOrdinal::new(p.coordinator),
            p.max_ordinal,
            p.generation,
        );
    }
    Ok(session)
}

/// Runs the joining side of the handshake over `link`.
///
/// Adopts the acceptor's coordinator view if its generation is newer.
pub async fn join_peer(instance: &Arc<Instance>, link: Arc<dyn PeerLink>) -> Result<PeerOrdinal, MetaError> {
    let failover = instance.failover();
    let mut init = failover.mount_message(
        MountOp::Init,
        failover.coordinator(),
        failover.max_ordinal(),
        failover.generation(),
    );
    instance
        .messenger()
        .stamp(&mut init, PeerOrdinal::COORDINATOR, 0);
    let frame = codec::encode(&init)?;
    link.send_frame(&frame)
        .await
        .map_err(|e| link_error(PeerOrdinal::COORDINATOR, e))?;

    let frame = link
        .recv_frame()
        .await
        .map_err(|e| link_error(PeerOrdinal::COORDINATOR, e))?;
    let order = codec::sender_order(&frame)?;
    let reply = codec::decode(&frame)?;
    let ordinal = reply.header.origin;
    if reply.header.error != 0 {
        link.close().await;
        let ctx = ReplyContext {
            local: instance.local(),
            peer: ordinal,
            resource: Default::default(),
            sent_generation: init.header.coord_generation,
            reply_generation: reply.header.coord_generation,
        };
        let e = MetaError::from_wire(reply.header.error, &ctx);
        warn!(ordinal = %ordinal, addr = %link.peer_addr(), error = %e, "handshake rejected");
        return Err(e);
    }
    let Payload::Mount(p) = &reply.payload else {
        link.close().await;
        return Err(MetaError::Unsupported(format!("{} as handshake reply", reply.command())));
    };

    let tags = PeerTags {
        byte_order: order,
        capabilities: p.config,
    };
    let session = instance
        .registry()
        .add_client(ordinal, &p.host_name.as_str(), tags, link.clone())?;
    instance
        .registry()
        .set_mounted(ordinal, p.status & STATUS_MOUNTED != 0);
    failover.learn_coordinator(PeerOrdinal::new(p.coordinator), p.max_ordinal, p.generation);
    spawn_reader(instance, session);
    info!(ordinal = %ordinal, addr = %link.peer_addr(), coordinator = p.coordinator, "joined peer");
    Ok(ordinal)
}

/// Starts the reader task of `session`.
///
/// Replies are handed to their waiting requests; everything else goes to
/// the worker pool. Malformed messages are dropped until too many arrive in
/// a row. On exit the session is cleared unless a newer link replaced it.
pub fn spawn_reader(instance: &Arc<Instance>, session: Arc<ClientSession>) {
    let ordinal = session.ordinal();
    let Some(link) = session.link() else {
        return;
    };
    let weak: Weak<Instance> = Arc::downgrade(instance);
    let messenger = instance.messenger().clone();
    let max_errors = instance.config().max_protocol_errors.max(1);

    let handle = tokio::spawn(async move {
        let mut errors = 0u32;
        loop {
            let msg = match messenger.receive(&session).await {
                Ok(msg) => msg,
                Err(MetaError::Protocol(e)) => {
                    errors += 1;
                    warn!(ordinal = %ordinal, error = %e, errors, "dropping malformed message");
                    if errors >= max_errors {
                        warn!(ordinal = %ordinal, "too many malformed messages, closing connection");
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(ordinal = %ordinal, error = %e, "reader stopped");
                    break;
                }
            };
            errors = 0;
            let Some(msg) = messenger.complete(ordinal, msg) else {
                continue;
            };
            let Some(instance) = weak.upgrade() else {
                break;
            };
            let guard = instance.failover().track_message();
            let Some(workers) = instance.workers() else {
                debug!(ordinal = %ordinal, command = %msg.command(), "no workers, message dropped");
                continue;
            };
            let job = Job {
                from: ordinal,
                msg,
                guard,
            };
            if !workers.submit(job).await {
                break;
            }
        }

        if let Some(instance) = weak.upgrade() {
            if instance.registry().clear_link(ordinal, &link).await {
                info!(ordinal = %ordinal, "peer disconnected");
            }
            instance.messenger().fail_pending(ordinal);
        }
    });
    instance.registry().set_reader(ordinal, handle.abort_handle());
}

/// Starts the periodic sweep. The sweep restarts whenever the local role
/// changes.
pub(crate) fn spawn_background(instance: &Arc<Instance>) -> Vec<JoinHandle<()>> {
    let weak = Arc::downgrade(instance);
    let mut roles = instance.failover().watch_role();
    let interval = instance.config().sweep_interval();
    let ticks = instance.config().off_pending_ticks();

    let sweeper = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sweep(weak.clone(), interval, ticks) => break,
                changed = roles.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let role = *roles.borrow_and_update();
                    info!(?role, "role changed, restarting sweep");
                }
            }
        }
    });
    vec![sweeper]
}

async fn sweep(instance: Weak<Instance>, interval: Duration, off_ticks: u32) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(instance) = instance.upgrade() else {
            return;
        };
        sweep_once(&instance, off_ticks).await;
    }
}

/// One pass of the sweep: `OFF_PENDING` expiry, then lease expiry on the
/// coordinator.
pub async fn sweep_once(instance: &Instance, off_ticks: u32) {
    let server = instance.is_server();
    for ordinal in instance.registry().sweep_off_pending(off_ticks).await {
        instance.messenger().fail_pending(ordinal);
        if server {
            instance.leases().release_peer(ordinal);
        }
    }
    if server {
        let expired = instance.leases().expire(Instant::now());
        if expired > 0 {
            debug!(expired, "expired leases swept");
        }
    }
}
