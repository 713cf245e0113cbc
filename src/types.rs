//! Core value types shared by the host, the worker and the wire protocol.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub const fn splat(v: f32) -> Self {
        Self::new(v, v, v)
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl From<[f32; 3]> for Vec3 {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl From<Vec3> for [f32; 3] {
    fn from(v: Vec3) -> Self {
        v.to_array()
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Unit quaternion, `xyzw` order (the order used in the transform buffers).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<[f32; 4]> for Quat {
    fn from([x, y, z, w]: [f32; 4]) -> Self {
        Self::new(x, y, z, w)
    }
}

impl std::fmt::Display for Quat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.3}, {:.3}, {:.3}, {:.3})",
            self.x, self.y, self.z, self.w
        )
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Collision shape family. The per-body dimensions travel in
/// [`BodyProps::args`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Box,
    Sphere,
    Plane,
    Cylinder,
    /// Any kind this build does not know. Creation of such bodies fails
    /// one body at a time instead of rejecting the whole message.
    #[serde(other)]
    Unsupported,
}

impl ShapeKind {
    /// Arguments used when a body is created without explicit `args`.
    pub fn default_args(self) -> Vec<f32> {
        match self {
            ShapeKind::Box | ShapeKind::Cylinder => vec![1.0, 1.0, 1.0],
            ShapeKind::Sphere => vec![1.0],
            ShapeKind::Plane => vec![0.0, 1.0, 0.0],
            ShapeKind::Unsupported => Vec::new(),
        }
    }
}

impl std::fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShapeKind::Box => "Box",
            ShapeKind::Sphere => "Sphere",
            ShapeKind::Plane => "Plane",
            ShapeKind::Cylinder => "Cylinder",
            ShapeKind::Unsupported => "Unsupported",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BodyType {
    #[default]
    Dynamic,
    Static,
    Kinematic,
}

/// Creation-time description of one body.
///
/// Every field has a default so callers only spell out what they care about:
///
/// ```
/// use physics_offload::types::{BodyProps, Vec3};
///
/// let props = BodyProps {
///     position: Vec3::new(0.0, 5.0, 0.0),
///     args: Some(vec![0.5]),
///     ..Default::default()
/// };
/// assert_eq!(props.mass, 1.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BodyProps {
    /// Shape dimensions; `None` means [`ShapeKind::default_args`].
    pub args: Option<Vec<f32>>,
    #[serde(rename = "type")]
    pub body_type: BodyType,
    /// Ignored for static bodies, which always have zero mass.
    pub mass: f32,
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub linear_factor: Vec3,
    pub angular_factor: Vec3,
    pub friction: Option<f32>,
    pub restitution: Option<f32>,
    pub rolling_friction: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub collision_filter_group: u32,
    pub collision_filter_mask: u32,
    /// Collision envelope padding.
    pub margin: f32,
    /// Ask the worker to report collisions targeting this body. Needed for
    /// `Body::on_collide` callbacks to fire.
    pub on_collide: bool,
}

impl Default for BodyProps {
    fn default() -> Self {
        Self {
            args: None,
            body_type: BodyType::Dynamic,
            mass: 1.0,
            position: Vec3::zero(),
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::zero(),
            angular_velocity: Vec3::zero(),
            linear_factor: Vec3::splat(1.0),
            angular_factor: Vec3::splat(1.0),
            friction: None,
            restitution: None,
            rolling_friction: 0.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            collision_filter_group: 1,
            collision_filter_mask: u32::MAX,
            margin: 0.0,
            on_collide: false,
        }
    }
}

// ---------------------------------------------------------------------------
// World configuration (the `init` payload)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Dynamics {
    #[default]
    Discrete,
    Soft,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type")]
pub enum Broadphase {
    #[default]
    Naive,
    /// Spatially partitioned broadphase bounded by an axis-aligned box.
    SweepAndPrune {
        #[serde(rename = "aabbmin")]
        aabb_min: Vec3,
        #[serde(rename = "aabbmax")]
        aabb_max: Vec3,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PhysicsConfig {
    /// Location of backend resources the worker must find before it can
    /// become ready. `None` means the linked-in backend needs nothing.
    pub backend_path: Option<String>,
    pub dynamics: Dynamics,
    pub gravity: Vec3,
    pub broadphase: Broadphase,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            backend_path: None,
            dynamics: Dynamics::Discrete,
            gravity: Vec3::new(0.0, -9.81, 0.0),
            broadphase: Broadphase::Naive,
        }
    }
}

// ---------------------------------------------------------------------------
// Collisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    /// Magnitude of the relative linear velocity when contact started.
    pub impact_velocity: f32,
    /// Distance between the two body origins when contact started.
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CollisionFilters {
    pub body_filter_group: u32,
    pub body_filter_mask: u32,
    pub target_filter_group: u32,
    pub target_filter_mask: u32,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicsStats {
    pub frames_received: u64,
    /// Tick counter reported by the worker in its latest frame.
    pub last_worker_tick: u64,
    pub registered_bodies: usize,
    pub live_subscriptions: usize,
}
