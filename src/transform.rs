//! Cell transforms and bounding volumes
//!
//! ## Table of Contents
//! - **CellTransform**: Translation / rotation / scale of a cell relative to its parent
//! - **CellBounds**: Axis-aligned box or sphere bounding volume

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Translation, rotation and scale of a cell.
///
/// Composition follows the usual scene-graph rule: `parent.mul(&local)` applies
/// `local` first, then `parent`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellTransform {
    /// Translation
    pub translation: Vec3,
    /// Rotation
    pub rotation: Quat,
    /// Per-axis scale
    pub scale: Vec3,
}

impl CellTransform {
    /// The identity transform
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    /// Create a transform from its parts
    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
        }
    }

    /// Pure translation
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }

    /// Pure rotation
    pub fn from_rotation(rotation: Quat) -> Self {
        Self {
            rotation,
            ..Self::IDENTITY
        }
    }

    /// Set the scale
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Compose `self` (outer) with `local` (inner)
    pub fn mul(&self, local: &CellTransform) -> CellTransform {
        CellTransform {
            translation: self.transform_point(local.translation),
            rotation: self.rotation * local.rotation,
            scale: self.scale * local.scale,
        }
    }

    /// Map a point from this transform's local frame into its parent frame
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * (self.scale * point) + self.translation
    }

    /// Approximate equality, for comparing composed results
    pub fn abs_diff_eq(&self, other: &CellTransform, max_abs_diff: f32) -> bool {
        self.translation.abs_diff_eq(other.translation, max_abs_diff)
            && self.scale.abs_diff_eq(other.scale, max_abs_diff)
            && (self.rotation.abs_diff_eq(other.rotation, max_abs_diff)
                || self.rotation.abs_diff_eq(-other.rotation, max_abs_diff))
    }
}

impl Default for CellTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Bounding volume of a cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum CellBounds {
    /// Axis-aligned box
    Box {
        /// Box centre
        center: Vec3,
        /// Half size along each axis
        half_extents: Vec3,
    },
    /// Sphere
    Sphere {
        /// Sphere centre
        center: Vec3,
        /// Radius
        radius: f32,
    },
}

impl CellBounds {
    /// Box centred at `center`
    pub fn cuboid(center: Vec3, half_extents: Vec3) -> Self {
        Self::Box {
            center,
            half_extents: half_extents.abs(),
        }
    }

    /// Sphere centred at `center`
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::Sphere {
            center,
            radius: radius.abs(),
        }
    }

    /// Centre of the volume
    pub fn center(&self) -> Vec3 {
        match *self {
            Self::Box { center, .. } | Self::Sphere { center, .. } => center,
        }
    }

    /// Minimum and maximum corners of the enclosing axis-aligned box
    pub fn min_max(&self) -> (Vec3, Vec3) {
        match *self {
            Self::Box { center, half_extents } => (center - half_extents, center + half_extents),
            Self::Sphere { center, radius } => (center - Vec3::splat(radius), center + Vec3::splat(radius)),
        }
    }

    /// Whether the point lies inside the volume
    pub fn contains(&self, point: Vec3) -> bool {
        match *self {
            Self::Box { center, half_extents } => {
                let d = (point - center).abs();
                d.cmple(half_extents).all()
            }
            Self::Sphere { center, radius } => point.distance_squared(center) <= radius * radius,
        }
    }

    /// Map the volume through `transform`.
    ///
    /// Spheres stay spheres (radius scaled by the largest axis scale); boxes
    /// become the axis-aligned box enclosing the eight transformed corners.
    pub fn transformed(&self, transform: &CellTransform) -> CellBounds {
        match *self {
            Self::Sphere { center, radius } => Self::Sphere {
                center: transform.transform_point(center),
                radius: radius * transform.scale.abs().max_element(),
            },
            Self::Box { center, half_extents } => {
                let mut min = Vec3::splat(f32::INFINITY);
                let mut max = Vec3::splat(f32::NEG_INFINITY);
                for i in 0..8u8 {
                    let sign = Vec3::new(
                        if i & 1 == 0 { -1.0 } else { 1.0 },
                        if i & 2 == 0 { -1.0 } else { 1.0 },
                        if i & 4 == 0 { -1.0 } else { 1.0 },
                    );
                    let corner = transform.transform_point(center + sign * half_extents);
                    min = min.min(corner);
                    max = max.max(corner);
                }
                Self::Box {
                    center: (min + max) * 0.5,
                    half_extents: (max - min) * 0.5,
                }
            }
        }
    }

    /// Smallest volume enclosing both `self` and `other`.
    ///
    /// Two spheres merge into a sphere; anything involving a box merges into a box.
    pub fn merge(&self, other: &CellBounds) -> CellBounds {
        match (*self, *other) {
            (Self::Sphere { center: c1, radius: r1 }, Self::Sphere { center: c2, radius: r2 }) => {
                let dist = c1.distance(c2);
                if dist + r2 <= r1 {
                    return *self;
                }
                if dist + r1 <= r2 {
                    return *other;
                }
                let radius = (dist + r1 + r2) * 0.5;
                let center = c1 + (c2 - c1).normalize_or_zero() * (radius - r1);
                Self::Sphere { center, radius }
            }
            _ => {
                let (min_a, max_a) = self.min_max();
                let (min_b, max_b) = other.min_max();
                let min = min_a.min(min_b);
                let max = max_a.max(max_b);
                Self::Box {
                    center: (min + max) * 0.5,
                    half_extents: (max - min) * 0.5,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_identity_composition() {
        let t = CellTransform::from_translation(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(CellTransform::IDENTITY.mul(&t), t);
        assert_eq!(t.mul(&CellTransform::IDENTITY), t);
    }

    #[test]
    fn test_parent_applies_after_child() {
        let parent = CellTransform::from_rotation(Quat::from_rotation_y(FRAC_PI_2))
            .with_scale(Vec3::splat(2.0));
        let child = CellTransform::from_translation(Vec3::X);

        let world = parent.mul(&child);
        // X rotated a quarter turn about Y lands on -Z, then scaled by 2
        assert!(world.translation.abs_diff_eq(Vec3::new(0.0, 0.0, -2.0), 1e-5));
        assert_eq!(world.scale, Vec3::splat(2.0));
    }

    #[test]
    fn test_box_bounds_transformed() {
        let bounds = CellBounds::cuboid(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0));
        let moved = bounds.transformed(&CellTransform::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        let (min, max) = moved.min_max();
        assert!(min.abs_diff_eq(Vec3::new(9.0, -2.0, -3.0), 1e-5));
        assert!(max.abs_diff_eq(Vec3::new(11.0, 2.0, 3.0), 1e-5));
    }

    #[test]
    fn test_sphere_bounds_scaled() {
        let bounds = CellBounds::sphere(Vec3::ZERO, 1.0);
        let t = CellTransform::from_translation(Vec3::Y).with_scale(Vec3::new(1.0, 3.0, 2.0));
        match bounds.transformed(&t) {
            CellBounds::Sphere { center, radius } => {
                assert_eq!(center, Vec3::Y);
                assert_eq!(radius, 3.0);
            }
            other => panic!("expected sphere, got {other:?}"),
        }
    }

    #[test]
    fn test_merge() {
        let a = CellBounds::sphere(Vec3::ZERO, 1.0);
        let b = CellBounds::sphere(Vec3::new(4.0, 0.0, 0.0), 1.0);
        let merged = a.merge(&b);
        assert!(merged.contains(Vec3::new(-1.0, 0.0, 0.0)));
        assert!(merged.contains(Vec3::new(5.0, 0.0, 0.0)));

        let inner = CellBounds::sphere(Vec3::ZERO, 0.5);
        assert_eq!(a.merge(&inner), a);

        let cube = CellBounds::cuboid(Vec3::new(0.0, 5.0, 0.0), Vec3::ONE);
        let mixed = a.merge(&cube);
        assert!(matches!(mixed, CellBounds::Box { .. }));
        let (min, max) = mixed.min_max();
        assert!(min.abs_diff_eq(Vec3::new(-1.0, -1.0, -1.0), 1e-5));
        assert!(max.abs_diff_eq(Vec3::new(1.0, 6.0, 1.0), 1e-5));
    }
}
