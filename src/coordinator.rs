//! Host coordinator – the host-side owner of the physics worker.
//!
//! ## Threading model
//!
//! The coordinator is single-threaded and cheap to clone (`Rc<RefCell<…>>`
//! inside), so body handles can keep a reference to it. It never blocks in
//! the frame loop:
//!
//! ```text
//! host frame
//! ─────────────────────────────────────────────────────────
//! Coordinator::poll()
//!   drain worker replies
//!   Frame     → rebuild registry, take buffers back,
//!               dispatch observations, request redraw
//!   Collision → fire the target's collision callback
//! render (reads transforms while the buffers are home)
//! Coordinator::frame(source)
//!   → Step { buffers } if this source owns the pending request
//! ```
//!
//! Callbacks run with no internal borrow held, so they may call back into
//! the coordinator.

use crate::buffers::TransformBuffers;
use crate::error::{Error, Result};
use crate::protocol::{
    Attribute, AttributeValue, CollisionReport, Envelope, ForceKind, FrameReport, HostMessage,
    SubscriptionId, WorkerMessage,
};
use crate::schedule::{FrameScheduler, FrameSource};
use crate::types::{BodyProps, PhysicsConfig, PhysicsStats, Quat, ShapeKind, Vec3};
use crate::worker::{self, WorkerHandle};
use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// What the host's collision callbacks receive.
pub type CollisionEvent = CollisionReport;

type Subscriber = Rc<RefCell<dyn FnMut(AttributeValue)>>;
type CollisionHandler = Rc<dyn Fn(&CollisionEvent)>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How many host → worker messages may queue before `post` blocks.
    pub inbox_capacity: usize,
    /// How many worker → host replies may queue before the worker blocks.
    pub outbox_capacity: usize,
    /// Body slots to reserve in the initial transform buffers.
    pub initial_bodies: usize,
    /// How long to wait for `Ready` before reporting `NotReady`.
    pub ready_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            outbox_capacity: 1024,
            initial_bodies: 64,
            ready_timeout_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Host-side hooks
// ---------------------------------------------------------------------------

/// The surface the host renders into.
pub trait RenderSurface {
    fn request_redraw(&self);
}

impl<F: Fn()> RenderSurface for F {
    fn request_redraw(&self) {
        self()
    }
}

/// Who holds the transform buffers right now.
#[derive(Debug)]
pub enum BufferState {
    Host(TransformBuffers),
    /// Moved to the worker by a `Step`; comes back with the next `Frame`.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Starting(Instant),
    Ready,
    InitFailed(String),
    Terminated,
}

// ---------------------------------------------------------------------------
// Shared state (single-threaded, Rc/RefCell)
// ---------------------------------------------------------------------------

struct State {
    config: CoordinatorConfig,
    physics: PhysicsConfig,
    worker: WorkerHandle,
    status: Status,
    buffers: BufferState,
    /// uuid → transform buffer slot.
    registry: HashMap<String, usize>,
    /// Next optimistic slot. Only the worker's `bodies` list lowers it, so
    /// a slot freed by a removal is never handed out twice.
    next_slot: usize,
    subscriptions: HashMap<SubscriptionId, Subscriber>,
    /// Never reset, not even by `restart`, so stale handles cannot hit new ids.
    next_subscription: SubscriptionId,
    next_body: u64,
    collision_handlers: HashMap<String, CollisionHandler>,
    scheduler: FrameScheduler,
    surface: Option<Rc<dyn RenderSurface>>,
    stats: PhysicsStats,
}

impl State {
    fn post(&self, message: WorkerMessage) -> Result<()> {
        self.worker.send(message)
    }

    fn send_step(&mut self) -> Result<bool> {
        if self.status != Status::Ready {
            return Ok(false);
        }
        match std::mem::replace(&mut self.buffers, BufferState::InFlight) {
            BufferState::Host(buffers) => {
                self.post(WorkerMessage::Step { buffers })?;
                Ok(true)
            }
            BufferState::InFlight => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Coordinator {
    shared: Rc<RefCell<State>>,
}

impl Coordinator {
    /// Spawn a worker and send it `Init(physics)`.
    pub fn new(physics: PhysicsConfig, config: CoordinatorConfig) -> Result<Self> {
        let worker = start_worker(&physics, &config)?;
        Ok(Self::with_worker(worker, physics, config))
    }

    fn with_worker(
        worker: WorkerHandle,
        physics: PhysicsConfig,
        config: CoordinatorConfig,
    ) -> Self {
        let buffers = BufferState::Host(TransformBuffers::with_capacity(config.initial_bodies));

        Self {
            shared: Rc::new(RefCell::new(State {
                config,
                physics,
                worker,
                status: Status::Starting(Instant::now()),
                buffers,
                registry: HashMap::new(),
                next_slot: 0,
                subscriptions: HashMap::new(),
                next_subscription: 0,
                next_body: 0,
                collision_handlers: HashMap::new(),
                scheduler: FrameScheduler::new(),
                surface: None,
                stats: PhysicsStats::default(),
            })),
        }
    }

    pub fn set_render_surface(&self, surface: impl RenderSurface + 'static) {
        let surface: Rc<dyn RenderSurface> = Rc::new(surface);
        self.shared.borrow_mut().surface = Some(surface);
    }

    pub fn is_ready(&self) -> bool {
        self.shared.borrow().status == Status::Ready
    }

    /// True while a `Step` is waiting for its `Frame`.
    pub fn step_in_flight(&self) -> bool {
        matches!(self.shared.borrow().buffers, BufferState::InFlight)
    }

    pub fn stats(&self) -> PhysicsStats {
        let st = self.shared.borrow();
        PhysicsStats {
            registered_bodies: st.registry.len(),
            live_subscriptions: st.subscriptions.len(),
            ..st.stats
        }
    }

    // -----------------------------------------------------------------------
    // Bodies
    // -----------------------------------------------------------------------

    /// Register bodies and ask the worker to create them. Slots are
    /// assigned optimistically and corrected by the next `bodies` list.
    pub fn add_bodies(
        &self,
        shape: ShapeKind,
        uuids: Vec<String>,
        props: Vec<BodyProps>,
    ) -> Result<()> {
        let mut st = self.shared.borrow_mut();
        for uuid in &uuids {
            if !st.registry.contains_key(uuid) {
                let slot = st.next_slot;
                st.next_slot += 1;
                st.registry.insert(uuid.clone(), slot);
            }
        }
        st.post(WorkerMessage::AddBodies {
            shape,
            uuids,
            props,
        })
    }

    /// Unregister bodies and ask the worker to remove them. Unknown uuids
    /// are fine.
    pub fn remove_bodies(&self, uuids: Vec<String>) -> Result<()> {
        let mut st = self.shared.borrow_mut();
        for uuid in &uuids {
            st.registry.remove(uuid);
            st.collision_handlers.remove(uuid);
        }
        st.post(WorkerMessage::RemoveBodies { uuids })
    }

    /// Fresh body uuid, unique for the life of this coordinator.
    pub fn allocate_uuid(&self) -> String {
        let mut st = self.shared.borrow_mut();
        st.next_body += 1;
        format!("body-{}", st.next_body)
    }

    pub fn slot(&self, uuid: &str) -> Option<usize> {
        self.shared.borrow().registry.get(uuid).copied()
    }

    /// Latest transform of `uuid`. `None` while the buffers are with the
    /// worker, or before the body's first frame.
    pub fn transform(&self, uuid: &str) -> Option<(Vec3, Quat)> {
        let st = self.shared.borrow();
        let slot = *st.registry.get(uuid)?;
        match &st.buffers {
            BufferState::Host(buffers) => {
                Some((buffers.position(slot)?, buffers.rotation(slot)?))
            }
            BufferState::InFlight => None,
        }
    }

    /// Fire `handler` whenever the worker reports a collision targeting
    /// `uuid`. Replaces any earlier handler.
    pub fn on_collide(&self, uuid: &str, handler: impl Fn(&CollisionEvent) + 'static) {
        self.shared
            .borrow_mut()
            .collision_handlers
            .insert(uuid.to_string(), Rc::new(handler));
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    pub fn set(&self, uuid: &str, value: AttributeValue) -> Result<()> {
        self.shared.borrow().post(WorkerMessage::Set {
            uuid: uuid.to_string(),
            value,
        })
    }

    /// Observe `attribute` of `uuid` once per frame. Ids increase
    /// monotonically for the life of the coordinator.
    pub fn subscribe(
        &self,
        uuid: &str,
        attribute: Attribute,
        callback: impl FnMut(AttributeValue) + 'static,
    ) -> Result<SubscriptionId> {
        let mut st = self.shared.borrow_mut();
        let id = st.next_subscription;
        st.next_subscription += 1;
        st.post(WorkerMessage::Subscribe {
            id,
            uuid: uuid.to_string(),
            attribute,
        })?;
        st.subscriptions.insert(id, Rc::new(RefCell::new(callback)));
        Ok(id)
    }

    /// Stop a subscription. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut st = self.shared.borrow_mut();
        if st.subscriptions.remove(&id).is_none() {
            return Ok(());
        }
        st.post(WorkerMessage::Unsubscribe { id })
    }

    pub fn apply(
        &self,
        uuid: &str,
        kind: ForceKind,
        vector: Vec3,
        world_point: Vec3,
    ) -> Result<()> {
        self.shared.borrow().post(WorkerMessage::Apply {
            uuid: uuid.to_string(),
            kind,
            vector,
            world_point,
        })
    }

    /// Forward a wire-encoded message as-is. The worker decodes it; an
    /// unknown kind stops the worker.
    pub fn post_encoded(&self, payload: Bytes) -> Result<()> {
        self.shared.borrow().worker.send(Envelope::Encoded(payload))
    }

    // -----------------------------------------------------------------------
    // Frame loop
    // -----------------------------------------------------------------------

    /// A frame callback from `source` fired. Sends the next `Step` if this
    /// source owns the pending request and the buffers are home.
    pub fn frame(&self, source: FrameSource) -> Result<bool> {
        let mut st = self.shared.borrow_mut();
        if !st.scheduler.on_frame(source) {
            return Ok(false);
        }
        st.send_step()
    }

    /// Which callback should drive the loop right now.
    pub fn frame_source(&self) -> FrameSource {
        self.shared.borrow().scheduler.source()
    }

    /// XR presentation started (`true`) or ended (`false`).
    pub fn set_xr_presenting(&self, presenting: bool) {
        let mut st = self.shared.borrow_mut();
        st.scheduler.set_presenting(presenting);
        debug!("Frame source is now {:?}", st.scheduler.source());
    }

    /// Drain worker replies without blocking and dispatch them.
    ///
    /// Fails with `InitFailed` or `WorkerTerminated` once the worker is
    /// unusable, and with `NotReady` while `Ready` is overdue.
    pub fn poll(&self) -> Result<()> {
        let (messages, failure) = self.shared.borrow().worker.poll();
        for message in messages {
            self.dispatch(message)?;
        }
        if let Some(e) = failure {
            self.mark_terminated();
            return Err(e);
        }
        self.check_status()
    }

    /// Send a `Step` now (if the buffers are home) and block until the next
    /// `Frame` has been dispatched. Meant for headless drivers and tests.
    pub fn wait_for_frame(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let posted = {
            let mut st = self.shared.borrow_mut();
            match &st.status {
                Status::InitFailed(reason) => return Err(Error::InitFailed(reason.clone())),
                Status::Terminated => return Err(Error::WorkerTerminated),
                _ => {}
            }
            st.scheduler.cancel();
            match std::mem::replace(&mut st.buffers, BufferState::InFlight) {
                BufferState::Host(buffers) => st.post(WorkerMessage::Step { buffers }),
                BufferState::InFlight => Ok(()),
            }
        };
        if let Err(e) = posted {
            self.mark_terminated();
            return Err(e);
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reply = self.shared.borrow().worker.recv_timeout(remaining);
            let message = match reply {
                Ok(Some(message)) => message,
                Ok(None) => return Err(Error::NotReady(timeout)),
                Err(e) => {
                    self.mark_terminated();
                    return Err(e);
                }
            };
            let is_frame = matches!(message, HostMessage::Frame(_));
            self.dispatch(message)?;
            if is_frame {
                return Ok(());
            }
        }
    }

    /// Replace a dead or failed worker with a fresh one. Physics state is
    /// not recovered: registry, subscriptions and collision handlers are
    /// cleared, and the buffers start empty.
    pub fn restart(&self) -> Result<()> {
        let mut st = self.shared.borrow_mut();
        warn!("Restarting physics worker");

        st.worker = start_worker(&st.physics, &st.config)?;
        st.status = Status::Starting(Instant::now());
        let capacity = st.config.initial_bodies;
        st.buffers = BufferState::Host(TransformBuffers::with_capacity(capacity));
        st.registry.clear();
        st.next_slot = 0;
        st.subscriptions.clear();
        st.collision_handlers.clear();
        st.scheduler.cancel();
        st.stats = PhysicsStats::default();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&self, message: HostMessage) -> Result<()> {
        match message {
            HostMessage::Ready => {
                let mut st = self.shared.borrow_mut();
                info!("Physics worker ready");
                st.status = Status::Ready;
                st.scheduler.request();
                Ok(())
            }
            HostMessage::InitFailed { reason } => {
                error!("Physics worker failed to initialise: {}", reason);
                self.shared.borrow_mut().status = Status::InitFailed(reason.clone());
                Err(Error::InitFailed(reason))
            }
            HostMessage::Frame(report) => {
                self.on_frame(report);
                Ok(())
            }
            HostMessage::Collision(event) => {
                let handler = self
                    .shared
                    .borrow()
                    .collision_handlers
                    .get(&event.target)
                    .cloned();
                if let Some(handler) = handler {
                    (*handler)(&event);
                }
                Ok(())
            }
        }
    }

    fn on_frame(&self, report: FrameReport) {
        let FrameReport {
            tick,
            buffers,
            observations,
            active,
            bodies,
            dropped,
        } = report;

        let (calls, surface) = {
            let mut st = self.shared.borrow_mut();
            st.stats.frames_received += 1;
            st.stats.last_worker_tick = tick;

            if let Some(bodies) = bodies {
                debug!("Reindexing {} bodies", bodies.len());
                st.registry = bodies
                    .into_iter()
                    .enumerate()
                    .map(|(slot, uuid)| (uuid, slot))
                    .collect();
                st.next_slot = st.registry.len();
            }
            for id in dropped {
                if st.subscriptions.remove(&id).is_some() {
                    debug!("Subscription {} dropped by the worker", id);
                }
            }
            st.buffers = BufferState::Host(buffers);
            st.scheduler.request();

            // Observations for ids unsubscribed while the frame was in
            // flight are dropped here.
            let calls: Vec<_> = observations
                .into_iter()
                .filter_map(|o| st.subscriptions.get(&o.id).map(|cb| (cb.clone(), o.value)))
                .collect();
            let surface = if active { st.surface.clone() } else { None };
            (calls, surface)
        };

        for (callback, value) in calls {
            let mut callback = callback.borrow_mut();
            (&mut *callback)(value);
        }
        if let Some(surface) = surface {
            surface.request_redraw();
        }
    }

    fn mark_terminated(&self) {
        let mut st = self.shared.borrow_mut();
        if st.status != Status::Terminated {
            error!("Physics worker terminated");
            st.status = Status::Terminated;
        }
    }

    fn check_status(&self) -> Result<()> {
        let st = self.shared.borrow();
        match &st.status {
            Status::Ready => Ok(()),
            Status::InitFailed(reason) => Err(Error::InitFailed(reason.clone())),
            Status::Terminated => Err(Error::WorkerTerminated),
            Status::Starting(since) => {
                let waited = since.elapsed();
                if waited > st.config.ready_timeout() {
                    Err(Error::NotReady(waited))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn start_worker(physics: &PhysicsConfig, config: &CoordinatorConfig) -> Result<WorkerHandle> {
    let worker = worker::spawn(config.inbox_capacity, config.outbox_capacity)?;
    worker.send(WorkerMessage::Init(physics.clone()))?;
    Ok(worker)
}
