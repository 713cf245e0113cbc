//! Physics Offload
//!
//! Rigid-body simulation on a dedicated worker thread, synchronised with a
//! single-threaded render host once per frame.
//!
//! ## Architecture
//!
//! ```text
//! Body / BodyApi  (body.rs)          ← per-body handles used by rendering code
//!   └── Coordinator  (coordinator.rs) ← registry, subscriptions, frame loop
//!         ├── FrameScheduler  (schedule.rs)   ← display vs XR callbacks
//!         └── WorkerHandle ═══ channel ═══ SimulationWorker  (worker/)
//!                                            └── PhysicsWorld (rapier3d)
//! ```
//!
//! Host and worker share no memory. [`TransformBuffers`] are moved to the
//! worker by each `Step` and moved back by the matching `Frame`, so at most
//! one step is ever in flight.

// Protocol types are always available (no host feature needed).
pub mod buffers;
pub mod error;
pub mod protocol;
pub mod types;

// Worker, coordinator and facade require the `host` feature.
#[cfg(feature = "host")]
pub mod body;
#[cfg(feature = "host")]
pub mod coordinator;
#[cfg(feature = "host")]
pub mod schedule;
#[cfg(feature = "host")]
pub mod worker;

// Convenience re-exports (host only)
#[cfg(feature = "host")]
pub use body::{AttributeApi, Body, BodyApi, Subscription, TransformSink};
#[cfg(feature = "host")]
pub use coordinator::{CollisionEvent, Coordinator, CoordinatorConfig, RenderSurface};
#[cfg(feature = "host")]
pub use schedule::{FrameScheduler, FrameSource};
#[cfg(feature = "host")]
pub use worker::{Outcome, SimulationWorker, WorkerState};

pub use buffers::TransformBuffers;
pub use error::{Error, Result, ShapeError};
pub use protocol::{
    Attribute, AttributeValue, ForceKind, HostMessage, SubscriptionId, WorkerMessage,
};
pub use types::{BodyProps, BodyType, PhysicsConfig, PhysicsStats, Quat, ShapeKind, Vec3};
