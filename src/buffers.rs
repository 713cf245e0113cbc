//! The transform buffer pair exchanged between host and worker.
//!
//! `TransformBuffers` is deliberately not `Clone`: a `Step` message moves it
//! to the worker and a `Frame` message moves it back, so at any instant
//! exactly one side can write to it.

use crate::types::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Positions (3 floats per body) and orientations (4 floats per body,
/// `xyzw`) indexed by registry slot.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformBuffers {
    positions: Vec<f32>,
    quaternions: Vec<f32>,
}

impl TransformBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty pair with room for `bodies` slots before reallocating.
    pub fn with_capacity(bodies: usize) -> Self {
        Self {
            positions: Vec::with_capacity(bodies * 3),
            quaternions: Vec::with_capacity(bodies * 4),
        }
    }

    /// Number of body slots currently held.
    pub fn len(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn quaternions(&self) -> &[f32] {
        &self.quaternions
    }

    /// Resize to exactly `bodies` slots, keeping the existing allocation.
    /// New slots start at the origin with identity rotation.
    pub fn resize(&mut self, bodies: usize) {
        self.positions.resize(bodies * 3, 0.0);
        let old = self.quaternions.len() / 4;
        self.quaternions.resize(bodies * 4, 0.0);
        for slot in old..bodies {
            self.quaternions[slot * 4 + 3] = 1.0;
        }
    }

    pub fn position(&self, slot: usize) -> Option<Vec3> {
        let p = self.positions.get(slot * 3..slot * 3 + 3)?;
        Some(Vec3::new(p[0], p[1], p[2]))
    }

    pub fn rotation(&self, slot: usize) -> Option<Quat> {
        let q = self.quaternions.get(slot * 4..slot * 4 + 4)?;
        Some(Quat::new(q[0], q[1], q[2], q[3]))
    }

    /// Write one slot. Out-of-range slots are ignored.
    pub fn write(&mut self, slot: usize, position: Vec3, rotation: Quat) {
        if slot >= self.len() {
            return;
        }
        self.positions[slot * 3..slot * 3 + 3].copy_from_slice(&position.to_array());
        self.quaternions[slot * 4..slot * 4 + 4].copy_from_slice(&rotation.to_array());
    }
}
