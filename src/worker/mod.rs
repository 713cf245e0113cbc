//! Simulation worker – owns the physics world on a dedicated thread.
//!
//! ## Threading model
//!
//! ```text
//! Host thread                 │  Worker thread
//! ─────────────────────────── │ ───────────────────────────────
//! Coordinator::post(msg)      │ run()
//!   → inbox.send(Envelope)    │   inbox.recv()
//!                             │   → SimulationWorker::handle()
//!                             │   → outbox.send(HostMessage)
//! Coordinator::poll()         │
//!   → outbox.try_recv()       │
//! ```
//!
//! Nothing is shared: the worker's body table lives on its thread and the
//! transform buffers travel by move inside `Step` and `Frame`.
//!
//! [`SimulationWorker`] itself is a plain state machine with no thread of
//! its own, so it can be driven synchronously.

pub mod shape;
pub mod world;

pub use world::{Outcome, PhysicsWorld, SOLVER_SUBSTEPS};

use crate::buffers::TransformBuffers;
use crate::error::{Error, Result};
use crate::protocol::{
    Attribute, Envelope, FrameReport, HostMessage, Observation, ProtocolError, SubscriptionId,
    WorkerMessage,
};
use crate::types::{Broadphase, PhysicsConfig};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::thread;
use std::time::Instant;

/// Simulated time of the first tick, in seconds.
pub const NOMINAL_FIRST_TICK: f32 = 1.0 / 60.0;

/// Upper bound on the simulated time of one tick, in seconds. A host that
/// stalls (debugger, backgrounded tab) resumes with one short tick instead
/// of a tunnelling jump.
pub const MAX_TICK_SECONDS: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Initializing,
    Ready,
    /// Backend initialisation failed. Terminal.
    Failed,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub struct SimulationWorker {
    state: WorkerState,
    world: Option<PhysicsWorld>,
    /// Messages received before `Ready`, replayed in arrival order.
    pending: VecDeque<WorkerMessage>,
    /// Ordered by id so observations come out in subscription order.
    subscriptions: BTreeMap<SubscriptionId, (String, Attribute)>,
    /// Subscriptions refused or pruned since the last frame.
    dropped: Vec<SubscriptionId>,
    bodies_changed: bool,
    last_tick: Option<Instant>,
    tick: u64,
}

impl Default for SimulationWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationWorker {
    pub fn new() -> Self {
        Self {
            state: WorkerState::Uninitialized,
            world: None,
            pending: VecDeque::new(),
            subscriptions: BTreeMap::new(),
            dropped: Vec::new(),
            bodies_changed: false,
            last_tick: None,
            tick: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Messages waiting for initialisation to finish.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn world(&self) -> Option<&PhysicsWorld> {
        self.world.as_ref()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Process one envelope and return the replies it produced.
    ///
    /// An encoded envelope that fails to decode is an error; the caller is
    /// expected to stop the worker.
    pub fn handle(
        &mut self,
        envelope: Envelope,
    ) -> std::result::Result<Vec<HostMessage>, ProtocolError> {
        let message = match envelope {
            Envelope::Message(message) => message,
            Envelope::Encoded(bytes) => WorkerMessage::decode(&bytes)?,
        };

        let mut out = Vec::new();
        self.receive(message, &mut out);
        Ok(out)
    }

    fn receive(&mut self, message: WorkerMessage, out: &mut Vec<HostMessage>) {
        match (self.state, message) {
            (WorkerState::Uninitialized, WorkerMessage::Init(config)) => self.init(config, out),
            (WorkerState::Ready, message @ WorkerMessage::Init(_)) => {
                warn!("Ignoring `{}`: worker already initialised", message.kind());
            }
            (WorkerState::Ready, message) => self.dispatch(message, out),
            (WorkerState::Failed, message) => {
                debug!("Worker failed; dropping `{}`", message.kind());
            }
            (_, message) => {
                debug!("Queueing `{}` until ready", message.kind());
                self.pending.push_back(message);
            }
        }
    }

    fn init(&mut self, config: PhysicsConfig, out: &mut Vec<HostMessage>) {
        self.state = WorkerState::Initializing;
        info!(
            "Initialising physics: gravity={} dynamics={:?} broadphase={:?}",
            config.gravity, config.dynamics, config.broadphase
        );

        if let Err(reason) = validate(&config) {
            error!("Physics initialisation failed: {}", reason);
            self.state = WorkerState::Failed;
            if !self.pending.is_empty() {
                warn!("{} queued message(s) will never be applied", self.pending.len());
            }
            self.pending.clear();
            out.push(HostMessage::InitFailed { reason });
            return;
        }

        self.world = Some(PhysicsWorld::new(&config));
        self.state = WorkerState::Ready;
        out.push(HostMessage::Ready);

        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            debug!("Replaying {} queued message(s)", pending.len());
        }
        for message in pending {
            self.receive(message, out);
        }
    }

    fn dispatch(&mut self, message: WorkerMessage, out: &mut Vec<HostMessage>) {
        let Some(world) = self.world.as_mut() else {
            return;
        };

        match message {
            WorkerMessage::Init(_) => {}
            WorkerMessage::AddBodies {
                shape,
                uuids,
                props,
            } => {
                for (uuid, props) in uuids.iter().zip(&props) {
                    if let Err(e) = world.add_body(uuid, shape, props) {
                        warn!("Cannot create body {}: {}", uuid, e);
                    }
                }
                // The host registered every uuid of the batch; report the
                // real list even if some bodies were rejected.
                self.bodies_changed = true;
            }
            WorkerMessage::RemoveBodies { uuids } => {
                for uuid in &uuids {
                    if world.remove_body(uuid) == Outcome::Applied {
                        self.bodies_changed = true;
                        let dropped = &mut self.dropped;
                        self.subscriptions.retain(|&id, (owner, _)| {
                            let keep = owner != uuid;
                            if !keep {
                                dropped.push(id);
                            }
                            keep
                        });
                    } else {
                        debug!("removeBodies: no body {}", uuid);
                    }
                }
            }
            WorkerMessage::Step { buffers } => self.tick(buffers, out),
            WorkerMessage::Set { uuid, value } => {
                if world.set(&uuid, value) == Outcome::Stale {
                    debug!("{}: no body {}", value.attribute().set_kind(), uuid);
                }
            }
            WorkerMessage::Subscribe {
                id,
                uuid,
                attribute,
            } => {
                if world.contains(&uuid) {
                    self.subscriptions.insert(id, (uuid, attribute));
                } else {
                    debug!("subscribe {}: no body {}", id, uuid);
                    self.dropped.push(id);
                }
            }
            WorkerMessage::Unsubscribe { id } => {
                self.subscriptions.remove(&id);
            }
            WorkerMessage::Apply {
                uuid,
                kind,
                vector,
                world_point,
            } => {
                if world.apply(&uuid, kind, vector, world_point) == Outcome::Stale {
                    debug!("{}: no body {}", kind.kind(), uuid);
                }
            }
        }
    }

    fn tick(&mut self, mut buffers: TransformBuffers, out: &mut Vec<HostMessage>) {
        let Some(world) = self.world.as_mut() else {
            return;
        };
        self.tick += 1;
        let _span = tracing::trace_span!("tick", tick = self.tick, bodies = world.len()).entered();

        let now = Instant::now();
        let dt = match self.last_tick {
            None => NOMINAL_FIRST_TICK,
            Some(last) => now.duration_since(last).as_secs_f32().min(MAX_TICK_SECONDS),
        };
        self.last_tick = Some(now);

        let collisions = world.step(dt);
        world.write_transforms(&mut buffers);

        let observations = self
            .subscriptions
            .iter()
            .filter_map(|(&id, (uuid, attribute))| {
                world
                    .get(uuid, *attribute)
                    .map(|value| Observation { id, value })
            })
            .collect();

        let bodies = std::mem::take(&mut self.bodies_changed).then(|| world.uuids());

        out.extend(collisions.into_iter().map(HostMessage::Collision));
        out.push(HostMessage::Frame(FrameReport {
            tick: self.tick,
            buffers,
            observations,
            active: !world.is_empty(),
            bodies,
            dropped: std::mem::take(&mut self.dropped),
        }));
    }
}

/// Reject configurations the backend cannot start with.
fn validate(config: &PhysicsConfig) -> std::result::Result<(), String> {
    if let Some(path) = &config.backend_path {
        if !Path::new(path).exists() {
            return Err(format!("backend resource not found: {}", path));
        }
    }
    if !config.gravity.is_finite() {
        return Err(format!("gravity must be finite, got {}", config.gravity));
    }
    if let Broadphase::SweepAndPrune { aabb_min, aabb_max } = config.broadphase {
        if !(aabb_min.x < aabb_max.x && aabb_min.y < aabb_max.y && aabb_min.z < aabb_max.z) {
            return Err(format!(
                "broadphase bounds are empty: min={} max={}",
                aabb_min, aabb_max
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handle (owned by the coordinator)
// ---------------------------------------------------------------------------

pub struct WorkerHandle {
    inbox: Sender<Envelope>,
    outbox: Receiver<HostMessage>,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Send an envelope. Blocks only if the inbox is full.
    pub fn send(&self, envelope: impl Into<Envelope>) -> Result<()> {
        self.inbox
            .send(envelope.into())
            .map_err(|_| Error::WorkerTerminated)
    }

    /// Drain every pending reply without blocking. Returns the replies
    /// received so far together with `WorkerTerminated` once the worker
    /// thread is gone and its outbox is empty.
    pub fn poll(&self) -> (Vec<HostMessage>, Option<Error>) {
        let mut out = Vec::new();
        loop {
            match self.outbox.try_recv() {
                Ok(message) => out.push(message),
                Err(TryRecvError::Empty) => return (out, None),
                Err(TryRecvError::Disconnected) => return (out, Some(Error::WorkerTerminated)),
            }
        }
    }

    /// Block until the next reply arrives or `timeout` elapses.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Option<HostMessage>> {
        match self.outbox.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Error::WorkerTerminated),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }
}

// ---------------------------------------------------------------------------
// Spawning the worker thread
// ---------------------------------------------------------------------------

/// Spawn a worker thread in the `Uninitialized` state.
pub fn spawn(inbox_capacity: usize, outbox_capacity: usize) -> Result<WorkerHandle> {
    let (inbox_tx, inbox_rx) = crossbeam_channel::bounded::<Envelope>(inbox_capacity);
    let (outbox_tx, outbox_rx) = crossbeam_channel::bounded::<HostMessage>(outbox_capacity);

    let thread = thread::Builder::new()
        .name("physics-worker".into())
        .spawn(move || run(inbox_rx, outbox_tx))
        .map_err(Error::WorkerSpawn)?;

    Ok(WorkerHandle {
        inbox: inbox_tx,
        outbox: outbox_rx,
        thread,
    })
}

fn run(inbox: Receiver<Envelope>, outbox: Sender<HostMessage>) {
    let mut worker = SimulationWorker::new();
    debug!("[worker] Started");

    for envelope in inbox.iter() {
        let replies = match worker.handle(envelope) {
            Ok(replies) => replies,
            Err(e) => {
                error!("[worker] Fatal protocol error: {}", e);
                return;
            }
        };
        for reply in replies {
            if outbox.send(reply).is_err() {
                debug!("[worker] Host gone, stopping");
                return;
            }
        }
    }

    debug!("[worker] Inbox closed, stopping");
}
