//! Rapier-backed physics world owned by the simulation worker.
//!
//! Bodies are kept in slot order (the order the host indexes the transform
//! buffers by). Removing a body shifts every later slot down by one; the
//! worker reports the new order to the host on the next frame.

use crate::buffers::TransformBuffers;
use crate::error::ShapeError;
use crate::protocol::{Attribute, AttributeValue, CollisionReport, ForceKind};
use crate::types::{
    BodyProps, BodyType, Broadphase, CollisionFilters, ContactInfo, Dynamics, PhysicsConfig,
    Quat, ShapeKind, Vec3,
};
use crate::worker::shape::collider_for;
use log::{debug, info, warn};
use rapier3d::na::{Point3, Quaternion, UnitQuaternion, Vector3};
use rapier3d::prelude::*;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};

/// Constraint-solver substeps per tick.
pub const SOLVER_SUBSTEPS: usize = 2;

/// Result of an operation addressed to a body by uuid.
///
/// Messages race with disposal: a body may be removed while writes for it
/// are still queued. Those writes resolve to `Stale` and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Stale,
}

struct BodyRecord {
    uuid: String,
    body: RigidBodyHandle,
    collider: ColliderHandle,
    body_type: BodyType,
    linear_factor: Vector3<f32>,
    angular_factor: Vector3<f32>,
    /// Angular damping as requested; rolling friction is added on top.
    angular_damping: f32,
    rolling_friction: f32,
    filter_group: u32,
    filter_mask: u32,
    on_collide: bool,
}

struct FactorSnapshot {
    slot: usize,
    translation: Vector3<f32>,
    linvel: Vector3<f32>,
    angvel: Vector3<f32>,
}

impl BodyRecord {
    fn has_factors(&self) -> bool {
        self.body_type == BodyType::Dynamic
            && (self.linear_factor != Vector3::repeat(1.0)
                || self.angular_factor != Vector3::repeat(1.0))
    }
}

pub struct PhysicsWorld {
    gravity: Vector3<f32>,
    integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    islands: IslandManager,
    broad_phase: BroadPhaseBvh,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    events: ChannelEventCollector,
    collision_events: Receiver<CollisionEvent>,
    contact_force_events: Receiver<ContactForceEvent>,
    bounds: Option<(Vec3, Vec3)>,

    records: Vec<BodyRecord>,
    slots: HashMap<String, usize>,
    collider_owners: HashMap<ColliderHandle, String>,
}

impl PhysicsWorld {
    pub fn new(config: &PhysicsConfig) -> Self {
        let (collision_send, collision_events) = mpsc::channel();
        let (contact_force_send, contact_force_events) = mpsc::channel();

        if config.dynamics == Dynamics::Soft {
            info!("Soft dynamics requested; rigid bodies only, soft-body solver not available");
        }
        let bounds = match config.broadphase {
            Broadphase::Naive => None,
            Broadphase::SweepAndPrune { aabb_min, aabb_max } => Some((aabb_min, aabb_max)),
        };

        Self {
            gravity: to_vector(config.gravity),
            integration_parameters: IntegrationParameters::default(),
            pipeline: PhysicsPipeline::new(),
            islands: IslandManager::new(),
            broad_phase: BroadPhaseBvh::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            events: ChannelEventCollector::new(collision_send, contact_force_send),
            collision_events,
            contact_force_events,
            bounds,
            records: Vec::new(),
            slots: HashMap::new(),
            collider_owners: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.slots.contains_key(uuid)
    }

    /// Live uuids in slot order.
    pub fn uuids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.uuid.clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn add_body(
        &mut self,
        uuid: &str,
        kind: ShapeKind,
        props: &BodyProps,
    ) -> Result<Outcome, ShapeError> {
        if self.contains(uuid) {
            warn!("Body {} already exists; ignoring duplicate add", uuid);
            return Ok(Outcome::Stale);
        }

        let args = props.args.clone().unwrap_or_else(|| kind.default_args());
        let mut collider = collider_for(kind, &args)?.contact_skin(props.margin.max(0.0));

        let builder = match props.body_type {
            BodyType::Dynamic => RigidBodyBuilder::dynamic().can_sleep(false),
            BodyType::Kinematic => RigidBodyBuilder::kinematic_position_based().can_sleep(false),
            BodyType::Static => RigidBodyBuilder::fixed(),
        };
        let mut body = builder
            .translation(to_vector(props.position))
            .linvel(to_vector(props.linear_velocity))
            .angvel(to_vector(props.angular_velocity))
            .linear_damping(props.linear_damping)
            .angular_damping(props.angular_damping + props.rolling_friction)
            .build();
        body.set_rotation(to_rotation(props.rotation), false);

        collider = if props.body_type == BodyType::Static {
            collider.density(0.0)
        } else {
            // A zero mass means "default", never "immovable".
            collider.mass(if props.mass > 0.0 { props.mass } else { 1.0 })
        };
        if let Some(friction) = props.friction {
            collider = collider.friction(friction);
        }
        if let Some(restitution) = props.restitution {
            collider = collider.restitution(restitution);
        }
        if props.on_collide {
            collider = collider.active_events(ActiveEvents::COLLISION_EVENTS);
        }

        if let Some((min, max)) = self.bounds {
            let p = props.position;
            if p.x < min.x || p.y < min.y || p.z < min.z || p.x > max.x || p.y > max.y || p.z > max.z
            {
                warn!("Body {} created at {} outside broadphase bounds", uuid, p);
            }
        }

        let body = self.bodies.insert(body);
        let collider = self
            .colliders
            .insert_with_parent(collider.build(), body, &mut self.bodies);

        self.slots.insert(uuid.to_string(), self.records.len());
        self.collider_owners.insert(collider, uuid.to_string());
        self.records.push(BodyRecord {
            uuid: uuid.to_string(),
            body,
            collider,
            body_type: props.body_type,
            linear_factor: to_vector(props.linear_factor),
            angular_factor: to_vector(props.angular_factor),
            angular_damping: props.angular_damping,
            rolling_friction: props.rolling_friction,
            filter_group: props.collision_filter_group,
            filter_mask: props.collision_filter_mask,
            on_collide: props.on_collide,
        });

        debug!("Added {} body {} ({:?})", kind, uuid, props.body_type);
        Ok(Outcome::Applied)
    }

    pub fn remove_body(&mut self, uuid: &str) -> Outcome {
        let Some(slot) = self.slots.remove(uuid) else {
            return Outcome::Stale;
        };

        let record = self.records.remove(slot);
        self.collider_owners.remove(&record.collider);
        self.bodies.remove(
            record.body,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );

        for (i, r) in self.records.iter().enumerate().skip(slot) {
            self.slots.insert(r.uuid.clone(), i);
        }

        debug!("Removed body {} from slot {}", uuid, slot);
        Outcome::Applied
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Advance the world by `dt` seconds in [`SOLVER_SUBSTEPS`] equal
    /// substeps, returning the collisions that started during the tick.
    pub fn step(&mut self, dt: f32) -> Vec<CollisionReport> {
        let sub_dt = dt / SOLVER_SUBSTEPS as f32;
        self.integration_parameters.dt = sub_dt;
        let mut reports = Vec::new();

        for _ in 0..SOLVER_SUBSTEPS {
            let before = self.factored_bodies();
            let approach = self.velocities();

            self.pipeline.step(
                &self.gravity,
                &self.integration_parameters,
                &mut self.islands,
                &mut self.broad_phase,
                &mut self.narrow_phase,
                &mut self.bodies,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                &mut self.ccd_solver,
                &(),
                &self.events,
            );

            self.apply_factors(before, sub_dt);
            reports.extend(self.drain_collisions(&approach));
        }

        reports
    }

    /// Linear velocity of every body by slot. Contacts started during a
    /// substep are resolved by the time its events are read, so impact
    /// speeds come from these pre-step values.
    fn velocities(&self) -> Vec<Vector3<f32>> {
        self.records
            .iter()
            .map(|r| {
                self.bodies
                    .get(r.body)
                    .map(|rb| vector(rb.linvel()))
                    .unwrap_or_else(Vector3::zeros)
            })
            .collect()
    }

    /// Motion state of bodies with non-unit factors, captured before a
    /// substep.
    fn factored_bodies(&self) -> Vec<FactorSnapshot> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.has_factors())
            .filter_map(|(slot, r)| {
                let rb = self.bodies.get(r.body)?;
                Some(FactorSnapshot {
                    slot,
                    translation: vector(rb.translation()),
                    linvel: vector(rb.linvel()),
                    angvel: vector(rb.angvel()),
                })
            })
            .collect()
    }

    /// Scale, per axis, the part of the substep's motion that came from
    /// forces rather than the velocity the body already had.
    fn apply_factors(&mut self, before: Vec<FactorSnapshot>, sub_dt: f32) {
        for snapshot in before {
            let record = &self.records[snapshot.slot];
            let Some(rb) = self.bodies.get_mut(record.body) else {
                continue;
            };

            let lin_change = vector(rb.linvel()) - snapshot.linvel;
            let ang_change = vector(rb.angvel()) - snapshot.angvel;
            let coasting = snapshot.linvel * sub_dt;
            let pushed = vector(rb.translation()) - snapshot.translation - coasting;

            let translation =
                snapshot.translation + coasting + pushed.component_mul(&record.linear_factor);
            rb.set_translation(translation, false);
            rb.set_linvel(
                snapshot.linvel + lin_change.component_mul(&record.linear_factor),
                false,
            );
            rb.set_angvel(
                snapshot.angvel + ang_change.component_mul(&record.angular_factor),
                false,
            );
        }
    }

    fn drain_collisions(&mut self, approach: &[Vector3<f32>]) -> Vec<CollisionReport> {
        let mut reports = Vec::new();

        while let Ok(event) = self.collision_events.try_recv() {
            let CollisionEvent::Started(a, b, _) = event else {
                continue;
            };
            let (Some(a), Some(b)) = (self.owner_slot(a), self.owner_slot(b)) else {
                continue;
            };
            reports.extend(self.collision_report(a, b, approach));
            reports.extend(self.collision_report(b, a, approach));
        }
        while self.contact_force_events.try_recv().is_ok() {}

        reports
    }

    fn owner_slot(&self, collider: ColliderHandle) -> Option<usize> {
        let uuid = self.collider_owners.get(&collider)?;
        self.slots.get(uuid).copied()
    }

    fn collision_report(
        &self,
        target: usize,
        other: usize,
        approach: &[Vector3<f32>],
    ) -> Option<CollisionReport> {
        let t = &self.records[target];
        let o = &self.records[other];
        if !t.on_collide || t.filter_mask & o.filter_group == 0 || o.filter_mask & t.filter_group == 0
        {
            return None;
        }

        let t_body = self.bodies.get(t.body)?;
        let o_body = self.bodies.get(o.body)?;
        let impact_velocity = (approach[target] - approach[other]).norm();
        let distance = (vector(t_body.translation()) - vector(o_body.translation())).norm();

        Some(CollisionReport {
            target: t.uuid.clone(),
            body: o.uuid.clone(),
            contact: ContactInfo {
                impact_velocity,
                distance,
            },
            filters: CollisionFilters {
                body_filter_group: o.filter_group,
                body_filter_mask: o.filter_mask,
                target_filter_group: t.filter_group,
                target_filter_mask: t.filter_mask,
            },
        })
    }

    /// Write every live body's transform into its slot, resizing the
    /// buffers to the live count.
    pub fn write_transforms(&self, buffers: &mut TransformBuffers) {
        buffers.resize(self.records.len());
        for (slot, record) in self.records.iter().enumerate() {
            if let Some(rb) = self.bodies.get(record.body) {
                buffers.write(slot, to_vec3(rb.translation()), to_quat(rb.rotation()));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    fn record(&self, uuid: &str) -> Option<&BodyRecord> {
        self.slots.get(uuid).map(|&slot| &self.records[slot])
    }

    /// Current value of `attribute`, or `None` for an unknown uuid.
    pub fn get(&self, uuid: &str, attribute: Attribute) -> Option<AttributeValue> {
        let record = self.record(uuid)?;
        let rb = self.bodies.get(record.body)?;
        let collider = self.colliders.get(record.collider)?;

        let value = match attribute {
            Attribute::Position => AttributeValue::Position(to_vec3(rb.translation())),
            Attribute::Rotation => AttributeValue::Rotation(to_quat(rb.rotation())),
            Attribute::LinearVelocity => AttributeValue::LinearVelocity(to_vec3(rb.linvel())),
            Attribute::AngularVelocity => AttributeValue::AngularVelocity(to_vec3(rb.angvel())),
            Attribute::LinearFactor => AttributeValue::LinearFactor(to_vec3(record.linear_factor)),
            Attribute::AngularFactor => {
                AttributeValue::AngularFactor(to_vec3(record.angular_factor))
            }
            Attribute::Mass => match record.body_type {
                BodyType::Static => AttributeValue::Mass(0.0),
                _ => AttributeValue::Mass(rb.mass()),
            },
            Attribute::Friction => AttributeValue::Friction(collider.friction()),
            Attribute::Restitution => AttributeValue::Restitution(collider.restitution()),
            Attribute::LinearDamping => AttributeValue::LinearDamping(rb.linear_damping()),
            Attribute::AngularDamping => AttributeValue::AngularDamping(record.angular_damping),
            Attribute::Margin => AttributeValue::Margin(collider.contact_skin()),
        };
        Some(value)
    }

    pub fn set(&mut self, uuid: &str, value: AttributeValue) -> Outcome {
        let Some(&slot) = self.slots.get(uuid) else {
            return Outcome::Stale;
        };
        let record = &mut self.records[slot];
        let (Some(rb), Some(collider)) = (
            self.bodies.get_mut(record.body),
            self.colliders.get_mut(record.collider),
        ) else {
            return Outcome::Stale;
        };

        match value {
            AttributeValue::Position(p) => rb.set_translation(to_vector(p), true),
            AttributeValue::Rotation(q) => rb.set_rotation(to_rotation(q), true),
            AttributeValue::LinearVelocity(v) => rb.set_linvel(to_vector(v), true),
            AttributeValue::AngularVelocity(v) => rb.set_angvel(to_vector(v), true),
            AttributeValue::LinearFactor(v) => record.linear_factor = to_vector(v),
            AttributeValue::AngularFactor(v) => record.angular_factor = to_vector(v),
            AttributeValue::Mass(m) => {
                if record.body_type != BodyType::Static && m > 0.0 {
                    collider.set_mass(m);
                }
            }
            AttributeValue::Friction(f) => collider.set_friction(f),
            AttributeValue::Restitution(r) => collider.set_restitution(r),
            AttributeValue::LinearDamping(d) => rb.set_linear_damping(d),
            AttributeValue::AngularDamping(d) => {
                record.angular_damping = d;
                rb.set_angular_damping(d + record.rolling_friction);
            }
            AttributeValue::Margin(m) => collider.set_contact_skin(m.max(0.0)),
        }
        Outcome::Applied
    }

    pub fn apply(&mut self, uuid: &str, kind: ForceKind, v: Vec3, world_point: Vec3) -> Outcome {
        let Some(record) = self.record(uuid) else {
            return Outcome::Stale;
        };
        let handle = record.body;
        let Some(rb) = self.bodies.get_mut(handle) else {
            return Outcome::Stale;
        };

        let v = to_vector(v);
        let point = Point3::from(to_vector(world_point));
        match kind {
            ForceKind::Force => rb.add_force_at_point(v, point, true),
            ForceKind::Impulse => rb.apply_impulse_at_point(v, point, true),
            ForceKind::CentralLocalForce => {
                let world = rotation(rb.rotation()) * v;
                rb.add_force(world, true);
            }
            ForceKind::CentralImpulse => rb.apply_impulse(v, true),
        }
        Outcome::Applied
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn vector(v: impl Borrow<Vector3<f32>>) -> Vector3<f32> {
    *v.borrow()
}

fn to_vector(v: Vec3) -> Vector3<f32> {
    Vector3::new(v.x, v.y, v.z)
}

fn to_vec3(v: impl Borrow<Vector3<f32>>) -> Vec3 {
    let v = v.borrow();
    Vec3::new(v.x, v.y, v.z)
}

fn rotation(q: impl Borrow<UnitQuaternion<f32>>) -> UnitQuaternion<f32> {
    *q.borrow()
}

fn to_rotation(q: Quat) -> UnitQuaternion<f32> {
    UnitQuaternion::from_quaternion(Quaternion::new(q.w, q.x, q.y, q.z))
}

fn to_quat(q: impl Borrow<UnitQuaternion<f32>>) -> Quat {
    let q = q.borrow();
    Quat::new(q.i, q.j, q.k, q.w)
}
