//! Body handles – the per-body API used by rendering code.
//!
//! A [`Body`] registers its physics bodies on creation and removes them when
//! dropped. Attribute access goes through [`AttributeApi`], one generic type
//! instantiated once per entry of [`BodyApi`]; adding an attribute means
//! adding one field there and one variant in the protocol.
//!
//! ```no_run
//! use physics_offload::{Body, Coordinator, CoordinatorConfig, PhysicsConfig, ShapeKind, BodyProps, Vec3};
//!
//! let coordinator = Coordinator::new(PhysicsConfig::default(), CoordinatorConfig::default())?;
//! let ball = Body::create(&coordinator, ShapeKind::Sphere, || BodyProps {
//!     position: Vec3::new(0.0, 5.0, 0.0),
//!     ..Default::default()
//! })?;
//! ball.api().friction.set(0.3)?;
//! let _watch = ball.api().position.subscribe(|p| println!("ball at {}", p))?;
//! # Ok::<(), physics_offload::Error>(())
//! ```

use crate::coordinator::{CollisionEvent, Coordinator};
use crate::error::{Error, Result};
use crate::protocol::{Attribute, AttributeValue, ForceKind, SubscriptionId, Value, ValueKind};
use crate::types::{BodyProps, Quat, ShapeKind, Vec3};
use log::warn;
use nalgebra::{UnitQuaternion, Vector3};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Attribute accessors
// ---------------------------------------------------------------------------

/// A Rust type an attribute value can be read as and written from.
pub trait AttributeType: Into<Value> + TryFrom<Value> + 'static {
    const KIND: ValueKind;
}

impl AttributeType for f32 {
    const KIND: ValueKind = ValueKind::Scalar;
}

impl AttributeType for Vec3 {
    const KIND: ValueKind = ValueKind::Vector;
}

impl AttributeType for Quat {
    const KIND: ValueKind = ValueKind::Quaternion;
}

/// `get` / `set` / `subscribe` for one attribute of one body.
pub struct AttributeApi<T> {
    coordinator: Coordinator,
    uuid: Rc<str>,
    attribute: Attribute,
    _value: PhantomData<T>,
}

impl<T: AttributeType> AttributeApi<T> {
    fn new(coordinator: &Coordinator, uuid: &Rc<str>, attribute: Attribute) -> Self {
        debug_assert_eq!(attribute.value_kind(), T::KIND);
        Self {
            coordinator: coordinator.clone(),
            uuid: uuid.clone(),
            attribute,
            _value: PhantomData,
        }
    }

    pub fn attribute(&self) -> Attribute {
        self.attribute
    }

    pub fn set(&self, value: T) -> Result<()> {
        let value = AttributeValue::from_parts(self.attribute, value.into())
            .ok_or(Error::AttributeMismatch(self.attribute))?;
        self.coordinator.set(&self.uuid, value)
    }

    /// Call `callback` with the value observed on every frame until the
    /// returned [`Subscription`] is dropped.
    pub fn subscribe(&self, mut callback: impl FnMut(T) + 'static) -> Result<Subscription> {
        let id = self
            .coordinator
            .subscribe(&self.uuid, self.attribute, move |observed| {
                if let Ok(value) = T::try_from(observed.value()) {
                    callback(value);
                }
            })?;
        Ok(Subscription {
            coordinator: self.coordinator.clone(),
            id,
        })
    }

    /// Call `callback` once, with the value observed on the next frame.
    pub fn get(&self, callback: impl FnOnce(T) + 'static) -> Result<()> {
        let coordinator = self.coordinator.clone();
        let own_id: Rc<Cell<Option<SubscriptionId>>> = Rc::new(Cell::new(None));
        let id_slot = own_id.clone();
        let mut callback = Some(callback);

        let id = self
            .coordinator
            .subscribe(&self.uuid, self.attribute, move |observed| {
                if let Some(callback) = callback.take() {
                    if let Ok(value) = T::try_from(observed.value()) {
                        callback(value);
                    }
                }
                if let Some(id) = id_slot.get() {
                    let _ = coordinator.unsubscribe(id);
                }
            })?;
        own_id.set(Some(id));
        Ok(())
    }
}

impl AttributeApi<Vec3> {
    pub fn set_xyz(&self, x: f32, y: f32, z: f32) -> Result<()> {
        self.set(Vec3::new(x, y, z))
    }

    /// Write a vector taken from elsewhere (e.g. a scene node).
    pub fn copy(&self, v: impl Into<Vec3>) -> Result<()> {
        self.set(v.into())
    }
}

impl AttributeApi<Quat> {
    pub fn copy(&self, q: impl Into<Quat>) -> Result<()> {
        self.set(q.into())
    }

    /// Set from Euler angles in radians, applied in `XYZ` order.
    pub fn set_euler(&self, x: f32, y: f32, z: f32) -> Result<()> {
        self.set(quat_from_euler(x, y, z))
    }
}

pub fn quat_from_euler(x: f32, y: f32, z: f32) -> Quat {
    let q = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), x)
        * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), y)
        * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), z);
    Quat::new(q.i, q.j, q.k, q.w)
}

/// Live subscription; unsubscribes when dropped.
pub struct Subscription {
    coordinator: Coordinator,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop observing. Calling it again is a no-op.
    pub fn unsubscribe(&self) -> Result<()> {
        self.coordinator.unsubscribe(self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// Per-body API
// ---------------------------------------------------------------------------

pub struct BodyApi {
    uuid: Rc<str>,
    coordinator: Coordinator,
    pub position: AttributeApi<Vec3>,
    pub rotation: AttributeApi<Quat>,
    pub velocity: AttributeApi<Vec3>,
    pub angular_velocity: AttributeApi<Vec3>,
    pub linear_factor: AttributeApi<Vec3>,
    pub angular_factor: AttributeApi<Vec3>,
    pub mass: AttributeApi<f32>,
    pub friction: AttributeApi<f32>,
    pub restitution: AttributeApi<f32>,
    pub linear_damping: AttributeApi<f32>,
    pub angular_damping: AttributeApi<f32>,
    pub margin: AttributeApi<f32>,
}

impl BodyApi {
    fn new(coordinator: &Coordinator, uuid: &str) -> Self {
        let uuid: Rc<str> = Rc::from(uuid);
        Self {
            position: AttributeApi::new(coordinator, &uuid, Attribute::Position),
            rotation: AttributeApi::new(coordinator, &uuid, Attribute::Rotation),
            velocity: AttributeApi::new(coordinator, &uuid, Attribute::LinearVelocity),
            angular_velocity: AttributeApi::new(coordinator, &uuid, Attribute::AngularVelocity),
            linear_factor: AttributeApi::new(coordinator, &uuid, Attribute::LinearFactor),
            angular_factor: AttributeApi::new(coordinator, &uuid, Attribute::AngularFactor),
            mass: AttributeApi::new(coordinator, &uuid, Attribute::Mass),
            friction: AttributeApi::new(coordinator, &uuid, Attribute::Friction),
            restitution: AttributeApi::new(coordinator, &uuid, Attribute::Restitution),
            linear_damping: AttributeApi::new(coordinator, &uuid, Attribute::LinearDamping),
            angular_damping: AttributeApi::new(coordinator, &uuid, Attribute::AngularDamping),
            margin: AttributeApi::new(coordinator, &uuid, Attribute::Margin),
            coordinator: coordinator.clone(),
            uuid,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Latest transform, read from the host's copy of the buffers.
    pub fn transform(&self) -> Option<(Vec3, Quat)> {
        self.coordinator.transform(&self.uuid)
    }

    pub fn apply_force(&self, force: Vec3, world_point: Vec3) -> Result<()> {
        self.coordinator
            .apply(&self.uuid, ForceKind::Force, force, world_point)
    }

    pub fn apply_impulse(&self, impulse: Vec3, world_point: Vec3) -> Result<()> {
        self.coordinator
            .apply(&self.uuid, ForceKind::Impulse, impulse, world_point)
    }

    /// Force through the centre of mass, in body-local axes.
    pub fn apply_local_force(&self, force: Vec3) -> Result<()> {
        self.coordinator
            .apply(&self.uuid, ForceKind::CentralLocalForce, force, Vec3::zero())
    }

    pub fn apply_central_impulse(&self, impulse: Vec3) -> Result<()> {
        self.coordinator
            .apply(&self.uuid, ForceKind::CentralImpulse, impulse, Vec3::zero())
    }
}

// ---------------------------------------------------------------------------
// Bodies and instanced groups
// ---------------------------------------------------------------------------

/// Receives per-member transforms, e.g. the instance matrices of one
/// instanced mesh.
pub trait TransformSink {
    fn set_transform(&mut self, index: usize, position: Vec3, rotation: Quat);
}

impl TransformSink for Vec<(Vec3, Quat)> {
    fn set_transform(&mut self, index: usize, position: Vec3, rotation: Quat) {
        if index >= self.len() {
            self.resize(index + 1, (Vec3::zero(), Quat::IDENTITY));
        }
        self[index] = (position, rotation);
    }
}

/// One body, or a group of bodies sharing one visual representation.
/// The bodies are removed from the simulation when the `Body` is dropped.
pub struct Body {
    coordinator: Coordinator,
    uuid: String,
    members: Vec<String>,
    instanced: bool,
    /// Whether the members were created with `on_collide`.
    reports_collisions: bool,
    handles: RefCell<HashMap<usize, Rc<BodyApi>>>,
    removed: Cell<bool>,
}

type Handler = Rc<dyn Fn(&CollisionEvent)>;

impl Body {
    /// Create one body with a coordinator-assigned uuid.
    pub fn create(
        coordinator: &Coordinator,
        shape: ShapeKind,
        props: impl FnOnce() -> BodyProps,
    ) -> Result<Body> {
        let uuid = coordinator.allocate_uuid();
        Self::create_with_uuid(coordinator, uuid, shape, props())
    }

    pub fn create_with_uuid(
        coordinator: &Coordinator,
        uuid: impl Into<String>,
        shape: ShapeKind,
        props: BodyProps,
    ) -> Result<Body> {
        let uuid = uuid.into();
        Self::spawn(coordinator, uuid.clone(), vec![uuid], shape, vec![props], false, None)
    }

    /// Create one body that reports its collisions to `handler`. The body is
    /// created with `on_collide` set regardless of what `props` says, and the
    /// handler is in place before the worker sees the body.
    pub fn create_with_collide(
        coordinator: &Coordinator,
        shape: ShapeKind,
        props: impl FnOnce() -> BodyProps,
        handler: impl Fn(&CollisionEvent) + 'static,
    ) -> Result<Body> {
        let uuid = coordinator.allocate_uuid();
        Self::spawn(
            coordinator,
            uuid.clone(),
            vec![uuid],
            shape,
            vec![props()],
            false,
            Some(Rc::new(handler)),
        )
    }

    /// Create `count` bodies that share one visual representation. Member
    /// `i` is created from `props(i)` and identified as `"{uuid}/{i}"`.
    pub fn instanced(
        coordinator: &Coordinator,
        shape: ShapeKind,
        count: usize,
        mut props: impl FnMut(usize) -> BodyProps,
    ) -> Result<Body> {
        let uuid = coordinator.allocate_uuid();
        let members: Vec<String> = (0..count).map(|i| member_uuid(&uuid, i)).collect();
        let props = (0..count).map(&mut props).collect();
        Self::spawn(coordinator, uuid, members, shape, props, true, None)
    }

    /// [`Body::instanced`] with every member reporting collisions to
    /// `handler`.
    pub fn instanced_with_collide(
        coordinator: &Coordinator,
        shape: ShapeKind,
        count: usize,
        mut props: impl FnMut(usize) -> BodyProps,
        handler: impl Fn(&CollisionEvent) + 'static,
    ) -> Result<Body> {
        let uuid = coordinator.allocate_uuid();
        let members: Vec<String> = (0..count).map(|i| member_uuid(&uuid, i)).collect();
        let props = (0..count).map(&mut props).collect();
        Self::spawn(
            coordinator,
            uuid,
            members,
            shape,
            props,
            true,
            Some(Rc::new(handler)),
        )
    }

    fn spawn(
        coordinator: &Coordinator,
        uuid: String,
        members: Vec<String>,
        shape: ShapeKind,
        mut props: Vec<BodyProps>,
        instanced: bool,
        handler: Option<Handler>,
    ) -> Result<Body> {
        if let Some(handler) = &handler {
            for p in props.iter_mut() {
                p.on_collide = true;
            }
            for member in &members {
                let handler = handler.clone();
                coordinator.on_collide(member, move |event| (*handler)(event));
            }
        }
        let reports_collisions = props.iter().any(|p| p.on_collide);
        coordinator.add_bodies(shape, members.clone(), props)?;

        Ok(Self {
            coordinator: coordinator.clone(),
            uuid,
            members,
            instanced,
            reports_collisions,
            handles: RefCell::new(HashMap::new()),
            removed: Cell::new(false),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_instanced(&self) -> bool {
        self.instanced
    }

    /// Member uuids; a single body has exactly one.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// API of the body, or of member 0 for a group.
    pub fn api(&self) -> Rc<BodyApi> {
        match self.at(0) {
            Some(api) => api,
            None => Rc::new(BodyApi::new(&self.coordinator, &self.uuid)),
        }
    }

    /// API of member `index`. Repeated calls return the same handle.
    pub fn at(&self, index: usize) -> Option<Rc<BodyApi>> {
        let uuid = self.members.get(index)?;
        let api = self
            .handles
            .borrow_mut()
            .entry(index)
            .or_insert_with(|| Rc::new(BodyApi::new(&self.coordinator, uuid)))
            .clone();
        Some(api)
    }

    /// Replace the collision callback of every member. The worker only
    /// reports collisions for bodies created with `on_collide: true`; use
    /// [`Body::create_with_collide`] to set both at once.
    pub fn on_collide(&self, handler: impl Fn(&CollisionEvent) + 'static) {
        if !self.reports_collisions {
            warn!(
                "Collision handler on {} will never fire: created without on_collide",
                self.uuid
            );
        }
        let handler = Rc::new(handler);
        for uuid in &self.members {
            let handler = handler.clone();
            self.coordinator.on_collide(uuid, move |event| (*handler)(event));
        }
    }

    /// Write each member's latest transform into `sink` at its member
    /// index. Members without a transform yet are skipped.
    pub fn apply_transforms(&self, sink: &mut impl TransformSink) -> usize {
        let mut written = 0;
        for (index, uuid) in self.members.iter().enumerate() {
            if let Some((position, rotation)) = self.coordinator.transform(uuid) {
                sink.set_transform(index, position, rotation);
                written += 1;
            }
        }
        written
    }

    /// Remove the bodies now instead of on drop. Idempotent.
    pub fn destroy(&self) -> Result<()> {
        if self.removed.replace(true) {
            return Ok(());
        }
        self.coordinator.remove_bodies(self.members.clone())
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

pub fn member_uuid(group: &str, index: usize) -> String {
    format!("{}/{}", group, index)
}
