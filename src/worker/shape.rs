//! Shape dispatch: `(ShapeKind, args)` → rapier collider builder.

use crate::error::ShapeError;
use crate::types::ShapeKind;
use rapier3d::na::{Unit, Vector3};
use rapier3d::prelude::*;

/// Build the collider for one body. Box and Cylinder take half-extents,
/// Sphere a radius, Plane the outward normal of its surface (the solid lies
/// behind it, through the origin).
pub fn collider_for(kind: ShapeKind, args: &[f32]) -> Result<ColliderBuilder, ShapeError> {
    match kind {
        ShapeKind::Box => {
            let [hx, hy, hz] = dimensions::<3>("Box", args)?;
            Ok(ColliderBuilder::cuboid(hx, hy, hz))
        }
        ShapeKind::Cylinder => {
            let [rx, half_height, rz] = dimensions::<3>("Cylinder", args)?;
            Ok(ColliderBuilder::cylinder(half_height, rx.max(rz)))
        }
        ShapeKind::Sphere => {
            let [radius] = dimensions::<1>("Sphere", args)?;
            Ok(ColliderBuilder::ball(radius))
        }
        ShapeKind::Plane => {
            let [x, y, z] = fixed::<3>("Plane", args)?;
            let normal = Vector3::new(x, y, z);
            if !(normal.norm() > f32::EPSILON && normal.iter().all(|c| c.is_finite())) {
                return Err(ShapeError::InvalidDimensions {
                    shape: "Plane",
                    args: args.to_vec(),
                });
            }
            Ok(ColliderBuilder::halfspace(Unit::new_normalize(normal)))
        }
        ShapeKind::Unsupported => Err(ShapeError::Unsupported),
    }
}

fn fixed<const N: usize>(shape: &'static str, args: &[f32]) -> Result<[f32; N], ShapeError> {
    <[f32; N]>::try_from(args).map_err(|_| ShapeError::ArgCount {
        shape,
        expected: N,
        got: args.len(),
    })
}

fn dimensions<const N: usize>(
    shape: &'static str,
    args: &[f32],
) -> Result<[f32; N], ShapeError> {
    let dims = fixed::<N>(shape, args)?;
    if dims.iter().all(|d| d.is_finite() && *d > 0.0) {
        Ok(dims)
    } else {
        Err(ShapeError::InvalidDimensions {
            shape,
            args: args.to_vec(),
        })
    }
}
