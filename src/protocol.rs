//! Host ↔ worker message protocol.
//!
//! This module owns **every message that crosses the thread boundary**
//! between the host coordinator and the simulation worker.
//!
//! ## Directions
//!
//! | Type            | Direction       | Carried by                          |
//! |-----------------|-----------------|-------------------------------------|
//! | `WorkerMessage` | host → worker   | [`Envelope::Message`] (in-process)  |
//! | encoded bytes   | host → worker   | [`Envelope::Encoded`] (wire form)   |
//! | `HostMessage`   | worker → host   | in-process channel                  |
//!
//! ## Design rules
//!
//! 1. Every payload is a value type; nothing on either side is shared.
//! 2. [`TransformBuffers`] is moved, never cloned: `Step` takes it from the
//!    host and `Frame` hands it back.
//! 3. Attribute writes are one tagged variant per attribute. The wire kind
//!    (`setPosition`, `setFriction`, …) comes from a static table, so an
//!    unknown kind is detected on decode instead of at dispatch.
//! 4. The wire form is a JSON `{ "type": …, "props": … }` envelope.

use crate::buffers::TransformBuffers;
use crate::types::{
    BodyProps, CollisionFilters, ContactInfo, PhysicsConfig, Quat, ShapeKind, Vec3,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub type SubscriptionId = u64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("malformed `{kind}` message: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("message cannot be encoded: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Every per-body attribute that can be written, read or observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Attribute {
    Position,
    Rotation,
    LinearVelocity,
    AngularVelocity,
    LinearFactor,
    AngularFactor,
    Mass,
    Friction,
    Restitution,
    LinearDamping,
    AngularDamping,
    Margin,
}

/// Shape of the value an attribute carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Scalar,
    Vector,
    Quaternion,
}

impl Attribute {
    pub const ALL: [Attribute; 12] = [
        Attribute::Position,
        Attribute::Rotation,
        Attribute::LinearVelocity,
        Attribute::AngularVelocity,
        Attribute::LinearFactor,
        Attribute::AngularFactor,
        Attribute::Mass,
        Attribute::Friction,
        Attribute::Restitution,
        Attribute::LinearDamping,
        Attribute::AngularDamping,
        Attribute::Margin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Attribute::Position => "position",
            Attribute::Rotation => "rotation",
            Attribute::LinearVelocity => "linearVelocity",
            Attribute::AngularVelocity => "angularVelocity",
            Attribute::LinearFactor => "linearFactor",
            Attribute::AngularFactor => "angularFactor",
            Attribute::Mass => "mass",
            Attribute::Friction => "friction",
            Attribute::Restitution => "restitution",
            Attribute::LinearDamping => "linearDamping",
            Attribute::AngularDamping => "angularDamping",
            Attribute::Margin => "margin",
        }
    }

    /// Wire kind of the message that writes this attribute.
    pub fn set_kind(self) -> &'static str {
        match self {
            Attribute::Position => "setPosition",
            Attribute::Rotation => "setRotation",
            Attribute::LinearVelocity => "setLinearVelocity",
            Attribute::AngularVelocity => "setAngularVelocity",
            Attribute::LinearFactor => "setLinearFactor",
            Attribute::AngularFactor => "setAngularFactor",
            Attribute::Mass => "setMass",
            Attribute::Friction => "setFriction",
            Attribute::Restitution => "setRestitution",
            Attribute::LinearDamping => "setLinearDamping",
            Attribute::AngularDamping => "setAngularDamping",
            Attribute::Margin => "setMargin",
        }
    }

    pub fn from_set_kind(kind: &str) -> Option<Attribute> {
        Attribute::ALL.into_iter().find(|a| a.set_kind() == kind)
    }

    pub fn value_kind(self) -> ValueKind {
        match self {
            Attribute::Rotation => ValueKind::Quaternion,
            Attribute::Position
            | Attribute::LinearVelocity
            | Attribute::AngularVelocity
            | Attribute::LinearFactor
            | Attribute::AngularFactor => ValueKind::Vector,
            Attribute::Mass
            | Attribute::Friction
            | Attribute::Restitution
            | Attribute::LinearDamping
            | Attribute::AngularDamping
            | Attribute::Margin => ValueKind::Scalar,
        }
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Untyped attribute payload, used where the attribute is carried
/// separately (the wire form and the generic body accessors).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    // Quaternion before Vector: an `{x,y,z,w}` object also parses as Vec3.
    Quaternion(Quat),
    Vector(Vec3),
    Scalar(f32),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Quaternion(_) => ValueKind::Quaternion,
            Value::Vector(_) => ValueKind::Vector,
            Value::Scalar(_) => ValueKind::Scalar,
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Scalar(v)
    }
}

impl From<Vec3> for Value {
    fn from(v: Vec3) -> Self {
        Value::Vector(v)
    }
}

impl From<Quat> for Value {
    fn from(q: Quat) -> Self {
        Value::Quaternion(q)
    }
}

impl TryFrom<Value> for f32 {
    type Error = Value;
    fn try_from(v: Value) -> Result<Self, Value> {
        match v {
            Value::Scalar(s) => Ok(s),
            other => Err(other),
        }
    }
}

impl TryFrom<Value> for Vec3 {
    type Error = Value;
    fn try_from(v: Value) -> Result<Self, Value> {
        match v {
            Value::Vector(s) => Ok(s),
            other => Err(other),
        }
    }
}

impl TryFrom<Value> for Quat {
    type Error = Value;
    fn try_from(v: Value) -> Result<Self, Value> {
        match v {
            Value::Quaternion(s) => Ok(s),
            other => Err(other),
        }
    }
}

/// A typed attribute value: one variant per attribute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "attribute", content = "value", rename_all = "camelCase")]
pub enum AttributeValue {
    Position(Vec3),
    Rotation(Quat),
    LinearVelocity(Vec3),
    AngularVelocity(Vec3),
    LinearFactor(Vec3),
    AngularFactor(Vec3),
    Mass(f32),
    Friction(f32),
    Restitution(f32),
    LinearDamping(f32),
    AngularDamping(f32),
    Margin(f32),
}

impl AttributeValue {
    pub fn attribute(&self) -> Attribute {
        match self {
            AttributeValue::Position(_) => Attribute::Position,
            AttributeValue::Rotation(_) => Attribute::Rotation,
            AttributeValue::LinearVelocity(_) => Attribute::LinearVelocity,
            AttributeValue::AngularVelocity(_) => Attribute::AngularVelocity,
            AttributeValue::LinearFactor(_) => Attribute::LinearFactor,
            AttributeValue::AngularFactor(_) => Attribute::AngularFactor,
            AttributeValue::Mass(_) => Attribute::Mass,
            AttributeValue::Friction(_) => Attribute::Friction,
            AttributeValue::Restitution(_) => Attribute::Restitution,
            AttributeValue::LinearDamping(_) => Attribute::LinearDamping,
            AttributeValue::AngularDamping(_) => Attribute::AngularDamping,
            AttributeValue::Margin(_) => Attribute::Margin,
        }
    }

    pub fn value(&self) -> Value {
        match *self {
            AttributeValue::Rotation(q) => Value::Quaternion(q),
            AttributeValue::Position(v)
            | AttributeValue::LinearVelocity(v)
            | AttributeValue::AngularVelocity(v)
            | AttributeValue::LinearFactor(v)
            | AttributeValue::AngularFactor(v) => Value::Vector(v),
            AttributeValue::Mass(s)
            | AttributeValue::Friction(s)
            | AttributeValue::Restitution(s)
            | AttributeValue::LinearDamping(s)
            | AttributeValue::AngularDamping(s)
            | AttributeValue::Margin(s) => Value::Scalar(s),
        }
    }

    /// Pair an attribute with an untyped value. `None` when the value does
    /// not have the attribute's [`ValueKind`].
    pub fn from_parts(attribute: Attribute, value: Value) -> Option<Self> {
        let typed = match (attribute, value) {
            (Attribute::Position, Value::Vector(v)) => AttributeValue::Position(v),
            (Attribute::Rotation, Value::Quaternion(q)) => AttributeValue::Rotation(q),
            (Attribute::LinearVelocity, Value::Vector(v)) => AttributeValue::LinearVelocity(v),
            (Attribute::AngularVelocity, Value::Vector(v)) => AttributeValue::AngularVelocity(v),
            (Attribute::LinearFactor, Value::Vector(v)) => AttributeValue::LinearFactor(v),
            (Attribute::AngularFactor, Value::Vector(v)) => AttributeValue::AngularFactor(v),
            (Attribute::Mass, Value::Scalar(s)) => AttributeValue::Mass(s),
            (Attribute::Friction, Value::Scalar(s)) => AttributeValue::Friction(s),
            (Attribute::Restitution, Value::Scalar(s)) => AttributeValue::Restitution(s),
            (Attribute::LinearDamping, Value::Scalar(s)) => AttributeValue::LinearDamping(s),
            (Attribute::AngularDamping, Value::Scalar(s)) => AttributeValue::AngularDamping(s),
            (Attribute::Margin, Value::Scalar(s)) => AttributeValue::Margin(s),
            _ => return None,
        };
        Some(typed)
    }
}

// ---------------------------------------------------------------------------
// Forces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForceKind {
    /// Force applied at a world-space point.
    Force,
    /// Impulse applied at a world-space point.
    Impulse,
    /// Force through the centre of mass, expressed in body-local axes.
    CentralLocalForce,
    /// Impulse through the centre of mass.
    CentralImpulse,
}

impl ForceKind {
    pub const ALL: [ForceKind; 4] = [
        ForceKind::Force,
        ForceKind::Impulse,
        ForceKind::CentralLocalForce,
        ForceKind::CentralImpulse,
    ];

    pub fn kind(self) -> &'static str {
        match self {
            ForceKind::Force => "applyForce",
            ForceKind::Impulse => "applyImpulse",
            ForceKind::CentralLocalForce => "applyCentralLocalForce",
            ForceKind::CentralImpulse => "applyCentralImpulse",
        }
    }

    pub fn from_kind(kind: &str) -> Option<ForceKind> {
        ForceKind::ALL.into_iter().find(|f| f.kind() == kind)
    }
}

// ---------------------------------------------------------------------------
// Host → worker
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum WorkerMessage {
    /// One-time world setup. Everything else is queued until it completes.
    Init(PhysicsConfig),
    /// Batch creation; `uuids[i]` is created from `props[i]`.
    AddBodies {
        shape: ShapeKind,
        uuids: Vec<String>,
        props: Vec<BodyProps>,
    },
    RemoveBodies { uuids: Vec<String> },
    /// Request one tick. The buffer pair now belongs to the worker.
    Step { buffers: TransformBuffers },
    Set { uuid: String, value: AttributeValue },
    Subscribe {
        id: SubscriptionId,
        uuid: String,
        attribute: Attribute,
    },
    Unsubscribe { id: SubscriptionId },
    Apply {
        uuid: String,
        kind: ForceKind,
        vector: Vec3,
        /// Ignored by the central variants.
        world_point: Vec3,
    },
}

impl WorkerMessage {
    /// Wire kind of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Init(_) => "init",
            WorkerMessage::AddBodies { .. } => "addBodies",
            WorkerMessage::RemoveBodies { .. } => "removeBodies",
            WorkerMessage::Step { .. } => "step",
            WorkerMessage::Set { value, .. } => value.attribute().set_kind(),
            WorkerMessage::Subscribe { .. } => "subscribe",
            WorkerMessage::Unsubscribe { .. } => "unsubscribe",
            WorkerMessage::Apply { kind, .. } => kind.kind(),
        }
    }

    /// Encode into the JSON wire envelope.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let props = match self {
            WorkerMessage::Init(config) => serde_json::to_value(config)?,
            WorkerMessage::AddBodies {
                shape,
                uuids,
                props,
            } => json!({ "type": shape, "uuids": uuids, "props": props }),
            WorkerMessage::RemoveBodies { uuids } => json!({ "uuids": uuids }),
            WorkerMessage::Step { buffers } => json!({
                "positions": buffers.positions(),
                "quaternions": buffers.quaternions(),
            }),
            WorkerMessage::Set { uuid, value } => {
                json!({ "uuid": uuid, "value": value.value() })
            }
            WorkerMessage::Subscribe {
                id,
                uuid,
                attribute,
            } => json!({ "id": id, "uuid": uuid, "name": attribute }),
            WorkerMessage::Unsubscribe { id } => json!({ "id": id }),
            WorkerMessage::Apply {
                uuid,
                vector,
                world_point,
                ..
            } => json!({ "uuid": uuid, "value": [vector, world_point] }),
        };

        let envelope = json!({ "type": self.kind(), "props": props });
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    /// Decode a JSON wire envelope.
    pub fn decode(payload: &[u8]) -> Result<WorkerMessage, ProtocolError> {
        let envelope: WireEnvelope = serde_json::from_slice(payload)?;
        let kind = envelope.kind;
        let props = envelope.props;

        let malformed = |e: serde_json::Error| ProtocolError::Malformed {
            kind: kind.clone(),
            reason: e.to_string(),
        };

        let message = match kind.as_str() {
            "init" => WorkerMessage::Init(serde_json::from_value(props).map_err(malformed)?),
            "addBodies" => {
                let p: AddBodiesProps = serde_json::from_value(props).map_err(malformed)?;
                if p.uuids.len() != p.props.len() {
                    return Err(ProtocolError::Malformed {
                        kind: kind.clone(),
                        reason: format!("{} uuids but {} props", p.uuids.len(), p.props.len()),
                    });
                }
                WorkerMessage::AddBodies {
                    shape: p.shape,
                    uuids: p.uuids,
                    props: p.props,
                }
            }
            "removeBodies" => {
                let p: UuidsProps = serde_json::from_value(props).map_err(malformed)?;
                WorkerMessage::RemoveBodies { uuids: p.uuids }
            }
            "step" => {
                let buffers: TransformBuffers =
                    serde_json::from_value(props).map_err(malformed)?;
                WorkerMessage::Step { buffers }
            }
            "subscribe" => {
                let p: SubscribeProps = serde_json::from_value(props).map_err(malformed)?;
                WorkerMessage::Subscribe {
                    id: p.id,
                    uuid: p.uuid,
                    attribute: p.name,
                }
            }
            "unsubscribe" => {
                let p: UnsubscribeProps = serde_json::from_value(props).map_err(malformed)?;
                WorkerMessage::Unsubscribe { id: p.id }
            }
            other => {
                if let Some(attribute) = Attribute::from_set_kind(other) {
                    let p: SetProps = serde_json::from_value(props).map_err(malformed)?;
                    let value = AttributeValue::from_parts(attribute, p.value).ok_or_else(|| {
                        ProtocolError::Malformed {
                            kind: kind.clone(),
                            reason: format!("value does not fit `{}`", attribute),
                        }
                    })?;
                    WorkerMessage::Set {
                        uuid: p.uuid,
                        value,
                    }
                } else if let Some(force) = ForceKind::from_kind(other) {
                    let p: ApplyProps = serde_json::from_value(props).map_err(malformed)?;
                    let [vector, world_point] = p.value;
                    WorkerMessage::Apply {
                        uuid: p.uuid,
                        kind: force,
                        vector,
                        world_point,
                    }
                } else {
                    return Err(ProtocolError::UnknownKind(other.to_string()));
                }
            }
        };

        Ok(message)
    }
}

// Wire-form payloads (decode side only).

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    props: serde_json::Value,
}

#[derive(Deserialize)]
struct AddBodiesProps {
    #[serde(rename = "type")]
    shape: ShapeKind,
    uuids: Vec<String>,
    props: Vec<BodyProps>,
}

#[derive(Deserialize)]
struct UuidsProps {
    uuids: Vec<String>,
}

#[derive(Deserialize)]
struct SubscribeProps {
    id: SubscriptionId,
    uuid: String,
    name: Attribute,
}

#[derive(Deserialize)]
struct UnsubscribeProps {
    id: SubscriptionId,
}

#[derive(Deserialize)]
struct SetProps {
    uuid: String,
    value: Value,
}

#[derive(Deserialize)]
struct ApplyProps {
    uuid: String,
    value: [Vec3; 2],
}

/// What travels on the host → worker channel.
#[derive(Debug)]
pub enum Envelope {
    Message(WorkerMessage),
    /// Wire-form message from a foreign producer; decoded by the worker.
    Encoded(Bytes),
}

impl From<WorkerMessage> for Envelope {
    fn from(message: WorkerMessage) -> Self {
        Envelope::Message(message)
    }
}

// ---------------------------------------------------------------------------
// Worker → host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: SubscriptionId,
    pub value: AttributeValue,
}

/// Reply to one `Step`. The buffer pair now belongs to the host again.
#[derive(Debug, Serialize, Deserialize)]
pub struct FrameReport {
    /// Worker tick counter, starting at 1.
    pub tick: u64,
    pub buffers: TransformBuffers,
    pub observations: Vec<Observation>,
    /// True while at least one body is live.
    pub active: bool,
    /// Live uuids in slot order; present only when the set changed since
    /// the previous frame.
    pub bodies: Option<Vec<String>>,
    /// Subscriptions the worker no longer evaluates: their body was removed
    /// or never existed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<SubscriptionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionReport {
    /// Body whose collision callback should fire.
    pub target: String,
    /// The other body in the contact.
    pub body: String,
    pub contact: ContactInfo,
    pub filters: CollisionFilters,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "props", rename_all = "camelCase")]
pub enum HostMessage {
    Ready,
    InitFailed { reason: String },
    Frame(FrameReport),
    Collision(CollisionReport),
}
