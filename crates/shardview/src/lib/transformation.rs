//! Rigid transformations: a translation plus a unit quaternion
//!
//! Quaternions are scalar first (`w, x, y, z`). Every operation returns a new
//! value; nothing is renormalized after composition, so long chains can drift
//! slightly off unit length.

use nalgebra::{Quaternion, Vector3};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hamilton product `q1 * q2`. Not commutative.
pub fn multiply_quaternions(q1: &Quaternion<f64>, q2: &Quaternion<f64>) -> Quaternion<f64> {
    q1 * q2
}

/// Rotate `v` by `q` through conjugation `q * (0, v) * q⁻¹`.
///
/// The conjugate stands in for the inverse, so `q` must be unit length.
pub fn rotate_vector(q: &Quaternion<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    let pure = Quaternion::from_imag(*v);
    multiply_quaternions(&multiply_quaternions(q, &pure), &q.conjugate()).imag()
}

/// A 3D pose of one fragment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transformation {
    translation: Vector3<f64>,
    quaternion: Quaternion<f64>,
}

impl Default for Transformation {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transformation {
    /// `([0, 0, 0], [1, 0, 0, 0])`
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            quaternion: Quaternion::identity(),
        }
    }

    pub fn new(translation: Vector3<f64>, quaternion: Quaternion<f64>) -> Self {
        Self {
            translation,
            quaternion,
        }
    }

    /// Build from wire arrays: translation `[x, y, z]`, rotation `[w, x, y, z]`
    pub fn from_arrays(translation: [f64; 3], rotation: [f64; 4]) -> Self {
        let [w, x, y, z] = rotation;
        Self {
            translation: Vector3::from(translation),
            quaternion: Quaternion::new(w, x, y, z),
        }
    }

    /// Build from the flat `[tx, ty, tz, qw, qx, qy, qz]` layout
    pub fn from_array(values: [f64; 7]) -> Self {
        let [tx, ty, tz, qw, qx, qy, qz] = values;
        Self::from_arrays([tx, ty, tz], [qw, qx, qy, qz])
    }

    /// Flatten to `[tx, ty, tz, qw, qx, qy, qz]`
    pub fn to_array(&self) -> [f64; 7] {
        let t = &self.translation;
        let q = &self.quaternion;
        [t.x, t.y, t.z, q.w, q.i, q.j, q.k]
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn quaternion(&self) -> &Quaternion<f64> {
        &self.quaternion
    }

    /// Inverse pose: conjugate rotation, translation `-rotate(conjugate, t)`
    pub fn inverse(&self) -> Self {
        let conjugate = self.quaternion.conjugate();
        Self {
            translation: -rotate_vector(&conjugate, &self.translation),
            quaternion: conjugate,
        }
    }

    /// Pose equivalent to applying `self` first, then `other` in `self`'s frame.
    ///
    /// Rotation is `self.q * other.q`, translation is
    /// `self.t + rotate(self.q, other.t)`. Operand order matters.
    pub fn apply_transformation(&self, other: &Transformation) -> Self {
        Self {
            translation: self.translation + rotate_vector(&self.quaternion, &other.translation),
            quaternion: multiply_quaternions(&self.quaternion, &other.quaternion),
        }
    }

    /// Place a point with this pose (rotate, then translate)
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        rotate_vector(&self.quaternion, point) + self.translation
    }

    /// Component-wise comparison within `tolerance`
    pub fn approx_eq(&self, other: &Transformation, tolerance: f64) -> bool {
        self.to_array()
            .iter()
            .zip(other.to_array().iter())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl Serialize for Transformation {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_array().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Transformation {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        <[f64; 7]>::deserialize(d).map(Self::from_array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    const TOLERANCE: f64 = 1e-6;

    fn axis_angle(axis: [f64; 3], angle: f64) -> [f64; 4] {
        let n = Vector3::from(axis).normalize();
        let (s, c) = (angle / 2.0).sin_cos();
        [c, n.x * s, n.y * s, n.z * s]
    }

    fn samples() -> Vec<Transformation> {
        vec![
            Transformation::identity(),
            Transformation::from_arrays([1.0, -2.0, 3.5], [1.0, 0.0, 0.0, 0.0]),
            Transformation::from_arrays([0.0, 0.0, 0.0], axis_angle([0.0, 0.0, 1.0], FRAC_PI_2)),
            Transformation::from_arrays([0.3, 4.0, -1.2], axis_angle([1.0, 2.0, -0.5], 2.1)),
            Transformation::from_arrays([-7.0, 0.25, 9.0], axis_angle([-0.3, 0.1, 0.9], -0.7)),
        ]
    }

    #[test]
    fn test_hamilton_product_basis() {
        let i = Quaternion::new(0.0, 1.0, 0.0, 0.0);
        let j = Quaternion::new(0.0, 0.0, 1.0, 0.0);
        let k = Quaternion::new(0.0, 0.0, 0.0, 1.0);

        assert_eq!(multiply_quaternions(&i, &j), k);
        assert_eq!(multiply_quaternions(&j, &i), -k);
        assert_eq!(multiply_quaternions(&i, &i), Quaternion::new(-1.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_rotate_vector_quarter_turn() {
        let q = Transformation::from_arrays([0.0; 3], axis_angle([0.0, 0.0, 1.0], FRAC_PI_2));
        let rotated = rotate_vector(q.quaternion(), &Vector3::new(1.0, 0.0, 0.0));

        assert_relative_eq!(rotated.x, 0.0, epsilon = TOLERANCE);
        assert_relative_eq!(rotated.y, 1.0, epsilon = TOLERANCE);
        assert_relative_eq!(rotated.z, 0.0, epsilon = TOLERANCE);
    }

    #[test]
    fn test_inverse_cancels_on_both_sides() {
        for t in samples() {
            let left = t.inverse().apply_transformation(&t);
            let right = t.apply_transformation(&t.inverse());
            assert!(left.approx_eq(&Transformation::identity(), TOLERANCE), "{left:?}");
            assert!(right.approx_eq(&Transformation::identity(), TOLERANCE), "{right:?}");
        }
    }

    #[test]
    fn test_composition_is_associative() {
        let s = samples();
        let (a, b, c) = (s[2], s[3], s[4]);
        let lhs = a.apply_transformation(&b).apply_transformation(&c);
        let rhs = a.apply_transformation(&b.apply_transformation(&c));
        assert!(lhs.approx_eq(&rhs, TOLERANCE));
    }

    #[test]
    fn test_operand_order_matters() {
        let s = samples();
        let ab = s[2].apply_transformation(&s[3]);
        let ba = s[3].apply_transformation(&s[2]);
        assert!(!ab.approx_eq(&ba, TOLERANCE));
    }

    #[test]
    fn test_apply_uses_frame_of_self() {
        // Quarter turn about z, then a unit step along x expressed in the turned frame
        let turn = Transformation::from_arrays([0.0; 3], axis_angle([0.0, 0.0, 1.0], FRAC_PI_2));
        let step = Transformation::from_arrays([1.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0]);
        let composed = turn.apply_transformation(&step);

        assert_relative_eq!(composed.translation().x, 0.0, epsilon = TOLERANCE);
        assert_relative_eq!(composed.translation().y, 1.0, epsilon = TOLERANCE);
        assert_eq!(composed.quaternion(), turn.quaternion());
    }

    #[test]
    fn test_transform_point_matches_composition() {
        let t = samples()[3];
        let p = Vector3::new(0.5, -1.0, 2.0);
        let as_pose = t.apply_transformation(&Transformation::from_arrays(
            [p.x, p.y, p.z],
            [1.0, 0.0, 0.0, 0.0],
        ));
        let placed = t.transform_point(&p);

        assert_relative_eq!(placed.x, as_pose.translation().x, epsilon = TOLERANCE);
        assert_relative_eq!(placed.y, as_pose.translation().y, epsilon = TOLERANCE);
        assert_relative_eq!(placed.z, as_pose.translation().z, epsilon = TOLERANCE);
    }

    #[test]
    fn test_flat_array_layout() {
        let t = Transformation::from_arrays([1.0, 2.0, 3.0], [0.5, 0.5, -0.5, 0.5]);
        assert_eq!(t.to_array(), [1.0, 2.0, 3.0, 0.5, 0.5, -0.5, 0.5]);
        assert_eq!(Transformation::from_array(t.to_array()), t);

        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,0.5,0.5,-0.5,0.5]");
        let parsed: Transformation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, t);
    }
}
