//! Transform math for guides: euler conversion, look-at and reflection
//!
//! Rotations are stored as XYZ euler angles in degrees (x applied first),
//! positions and scales as plain arrays so definitions stay readable on disk.

use glam::{DAffine3, DMat3, DQuat, DVec3, EulerRot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default tolerance used when comparing transforms
pub const EPSILON: f64 = 1e-6;

/// World-space transform (translate, rotate in degrees, scale)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default)]
    pub translate: [f64; 3],
    #[serde(default)]
    pub rotate: [f64; 3],
    #[serde(default = "unit_scale")]
    pub scale: [f64; 3],
}

fn unit_scale() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        translate: [0.0, 0.0, 0.0],
        rotate: [0.0, 0.0, 0.0],
        scale: [1.0, 1.0, 1.0],
    };

    pub fn from_translation(translate: [f64; 3]) -> Self {
        Self {
            translate,
            ..Self::IDENTITY
        }
    }

    pub fn new(translate: [f64; 3], rotate: [f64; 3]) -> Self {
        Self {
            translate,
            rotate,
            scale: unit_scale(),
        }
    }

    pub fn translation(&self) -> DVec3 {
        DVec3::from_array(self.translate)
    }

    pub fn rotation(&self) -> DQuat {
        euler_to_quat(self.rotate)
    }

    pub fn rotation_matrix(&self) -> DMat3 {
        DMat3::from_quat(self.rotation())
    }

    pub fn set_rotation(&mut self, rotation: DQuat) {
        self.rotate = quat_to_euler(rotation);
    }

    pub fn to_affine(&self) -> DAffine3 {
        DAffine3::from_scale_rotation_translation(
            DVec3::from_array(self.scale),
            self.rotation(),
            self.translation(),
        )
    }

    pub fn from_affine(affine: &DAffine3) -> Self {
        let (scale, rotation, translation) = affine.to_scale_rotation_translation();
        Self {
            translate: translation.to_array(),
            rotate: quat_to_euler(rotation),
            scale: scale.to_array(),
        }
    }

    /// Compare two transforms, treating rotations as orientations rather than angle triples
    pub fn approx_eq(&self, other: &Transform, eps: f64) -> bool {
        let close = |a: [f64; 3], b: [f64; 3]| a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= eps);
        close(self.translate, other.translate)
            && close(self.scale, other.scale)
            && self.rotation().dot(other.rotation()).abs() >= 1.0 - eps
    }
}

/// XYZ euler degrees (x applied first) to quaternion
pub fn euler_to_quat(rotate: [f64; 3]) -> DQuat {
    DQuat::from_euler(
        EulerRot::ZYX,
        rotate[2].to_radians(),
        rotate[1].to_radians(),
        rotate[0].to_radians(),
    )
}

/// Quaternion to XYZ euler degrees (x applied first)
pub fn quat_to_euler(rotation: DQuat) -> [f64; 3] {
    let (z, y, x) = rotation.normalize().to_euler(EulerRot::ZYX);
    [x.to_degrees(), y.to_degrees(), z.to_degrees()]
}

/// Cartesian axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn unit(self) -> DVec3 {
        match self {
            Axis::X => DVec3::X,
            Axis::Y => DVec3::Y,
            Axis::Z => DVec3::Z,
        }
    }

    /// Parse a list like "x" or "xz" into axes
    pub fn parse_list(s: &str) -> Option<Vec<Axis>> {
        s.chars()
            .filter(|c| !c.is_whitespace() && *c != ',')
            .map(|c| match c.to_ascii_lowercase() {
                'x' => Some(Axis::X),
                'y' => Some(Axis::Y),
                'z' => Some(Axis::Z),
                _ => None,
            })
            .collect()
    }
}

/// Largest component of a vector, with its sign
pub fn dominant_axis(v: DVec3) -> (Axis, f64) {
    let abs = v.abs();
    let (axis, value) = if abs.x >= abs.y && abs.x >= abs.z {
        (Axis::X, v.x)
    } else if abs.y >= abs.z {
        (Axis::Y, v.y)
    } else {
        (Axis::Z, v.z)
    };
    (axis, if value < 0.0 { -1.0 } else { 1.0 })
}

/// Plane used to reflect rotations when mirroring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorPlane {
    Xy,
    Yz,
    Xz,
}

impl MirrorPlane {
    pub fn normal(self) -> DVec3 {
        match self {
            MirrorPlane::Xy => DVec3::Z,
            MirrorPlane::Yz => DVec3::X,
            MirrorPlane::Xz => DVec3::Y,
        }
    }

    /// Axis perpendicular to the plane, the one negated by a matching translate mirror
    pub fn normal_axis(self) -> Axis {
        match self {
            MirrorPlane::Xy => Axis::Z,
            MirrorPlane::Yz => Axis::X,
            MirrorPlane::Xz => Axis::Y,
        }
    }

    pub fn reflection(self) -> DMat3 {
        reflection_matrix(self.normal())
    }
}

impl fmt::Display for MirrorPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MirrorPlane::Xy => "xy",
            MirrorPlane::Yz => "yz",
            MirrorPlane::Xz => "xz",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MirrorPlane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xy" | "yx" => Ok(MirrorPlane::Xy),
            "yz" | "zy" => Ok(MirrorPlane::Yz),
            "xz" | "zx" => Ok(MirrorPlane::Xz),
            other => Err(format!("unknown mirror plane '{}'", other)),
        }
    }
}

/// Householder reflection `I - 2nn^T` for a unit normal
pub fn reflection_matrix(normal: DVec3) -> DMat3 {
    let n = normal.normalize_or_zero();
    DMat3::from_cols(
        DVec3::X - 2.0 * n.x * n,
        DVec3::Y - 2.0 * n.y * n,
        DVec3::Z - 2.0 * n.z * n,
    )
}

/// Negate the requested translate components
pub fn mirror_translation(translate: [f64; 3], axes: &[Axis]) -> [f64; 3] {
    let mut out = translate;
    for axis in axes {
        out[axis.index()] = -translate[axis.index()];
    }
    out
}

/// Literal reflection: conjugates the rotation by the plane reflection.
///
/// In euler terms this negates the two rotation components whose axes lie
/// in the plane.
pub fn mirror_rotation_relative(rotation: DMat3, plane: MirrorPlane) -> DMat3 {
    let m = plane.reflection();
    m * rotation * m
}

/// Functional reflection: the orientation that re-aiming the mirrored aim and
/// up directions would produce.
///
/// The aim and up axes are reflected through the plane and the remaining
/// axis is flipped to keep the frame right handed. Falls back to the literal
/// reflection when aim and up are parallel.
pub fn mirror_rotation_behaviour(
    rotation: DMat3,
    plane: MirrorPlane,
    aim: DVec3,
    up: DVec3,
) -> DMat3 {
    let cross = aim.cross(up).normalize_or_zero();
    if cross.length_squared() < EPSILON {
        return mirror_rotation_relative(rotation, plane);
    }
    plane.reflection() * rotation * reflection_matrix(cross)
}

/// Orientation whose local `aim` axis points at `target` and whose local `up`
/// axis leans towards `world_up`.
///
/// Returns `None` when source and target coincide or the local vectors are parallel.
pub fn look_at(
    source: DVec3,
    target: DVec3,
    aim: DVec3,
    up: DVec3,
    world_up: DVec3,
) -> Option<DQuat> {
    let world_aim = (target - source).normalize_or_zero();
    if world_aim.length_squared() < EPSILON {
        return None;
    }
    let local = orthonormal_frame(aim, up)?;
    let world = orthonormal_frame(world_aim, world_up).or_else(|| {
        // world up parallel to the aim: lean on whichever world axis is least aligned
        let (axis, _) = dominant_axis(world_aim);
        let fallback = match axis {
            Axis::X => DVec3::Y,
            Axis::Y => DVec3::Z,
            Axis::Z => DVec3::Y,
        };
        orthonormal_frame(world_aim, fallback)
    })?;
    Some(DQuat::from_mat3(&(world * local.transpose())))
}

/// Frame with columns (aim, up orthogonalised against aim, aim x up)
fn orthonormal_frame(aim: DVec3, up: DVec3) -> Option<DMat3> {
    let a = aim.normalize_or_zero();
    if a.length_squared() < EPSILON {
        return None;
    }
    let u = (up - a * up.dot(a)).normalize_or_zero();
    if u.length_squared() < EPSILON {
        return None;
    }
    Some(DMat3::from_cols(a, u, a.cross(u)))
}
