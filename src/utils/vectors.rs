use auto_ops::{impl_op_ex, impl_op_ex_commutative};
use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::Float;

/// A three-vector (position or three-momentum).
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3(Vector3<Float>);
impl From<[Float; 3]> for Vec3 {
    fn from(value: [Float; 3]) -> Self {
        Self(Vector3::new(value[0], value[1], value[2]))
    }
}
impl From<Vector3<Float>> for Vec3 {
    fn from(value: Vector3<Float>) -> Self {
        Self(value)
    }
}
impl Vec3 {
    pub fn new(x: Float, y: Float, z: Float) -> Self {
        Self(Vector3::new(x, y, z))
    }
    pub fn x(&self) -> Float {
        self.0[0]
    }
    pub fn y(&self) -> Float {
        self.0[1]
    }
    pub fn z(&self) -> Float {
        self.0[2]
    }
    pub fn inner(&self) -> &Vector3<Float> {
        &self.0
    }

    /// Promote to a four-vector with the given invariant mass.
    pub fn with_mass(&self, mass: Float) -> Vec4 {
        let e = (mass * mass + self.mag2()).sqrt();
        Vec4::new(self.x(), self.y(), self.z(), e)
    }

    /// Promote to a four-vector with the given energy.
    pub fn with_energy(&self, energy: Float) -> Vec4 {
        Vec4::new(self.x(), self.y(), self.z(), energy)
    }

    pub fn dot(&self, other: &Self) -> Float {
        self.0.dot(&other.0)
    }
    pub fn cross(&self, other: &Self) -> Self {
        Self(self.0.cross(&other.0))
    }
    pub fn mag2(&self) -> Float {
        self.dot(self)
    }
    pub fn mag(&self) -> Float {
        self.mag2().sqrt()
    }
    /// Transverse magnitude in the bending plane.
    pub fn perp(&self) -> Float {
        self.x().hypot(self.y())
    }
    pub fn costheta(&self) -> Float {
        self.z() / self.mag()
    }
    pub fn theta(&self) -> Float {
        self.costheta().acos()
    }
    pub fn phi(&self) -> Float {
        self.y().atan2(self.x())
    }
    pub fn unit(&self) -> Self {
        Self(self.0 / self.mag())
    }
    pub fn add(&self, other: &Self) -> Self {
        Self(self.0 + other.0)
    }
    pub fn sub(&self, other: &Self) -> Self {
        Self(self.0 - other.0)
    }
    pub fn mul(&self, other: Float) -> Self {
        Self(self.0 * other)
    }
    pub fn div(&self, other: Float) -> Self {
        Self(self.0 / other)
    }
    pub fn neg(&self) -> Self {
        Self(-self.0)
    }
}

impl_op_ex!(+ |a: &Vec3, b: &Vec3| -> Vec3 { a.add(b) });
impl_op_ex!(-|a: &Vec3, b: &Vec3| -> Vec3 { a.sub(b) });
impl_op_ex!(-|a: &Vec3| -> Vec3 { a.neg() });
impl_op_ex_commutative!(*|a: &Vec3, b: &Float| -> Vec3 { a.mul(*b) });
impl_op_ex!(/ |a: &Vec3, b: &Float| -> Vec3 { a.div(*b) });

/// A four-momentum, stored as `(px, py, pz, e)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4(Vector4<Float>);
impl From<[Float; 4]> for Vec4 {
    fn from(value: [Float; 4]) -> Self {
        Self(Vector4::new(value[0], value[1], value[2], value[3]))
    }
}
impl Vec4 {
    pub fn new(px: Float, py: Float, pz: Float, e: Float) -> Self {
        Self(Vector4::new(px, py, pz, e))
    }
    pub fn px(&self) -> Float {
        self.0[0]
    }
    pub fn py(&self) -> Float {
        self.0[1]
    }
    pub fn pz(&self) -> Float {
        self.0[2]
    }
    pub fn e(&self) -> Float {
        self.0[3]
    }
    pub fn vec3(&self) -> Vec3 {
        Vec3::new(self.px(), self.py(), self.pz())
    }
    /// Invariant mass squared. Negative for unphysical inputs; callers that
    /// need a mass should check the sign first.
    pub fn mag2(&self) -> Float {
        self.e() * self.e() - self.vec3().mag2()
    }
    pub fn mag(&self) -> Float {
        self.mag2().sqrt()
    }
    pub fn perp(&self) -> Float {
        self.vec3().perp()
    }
    pub fn add(&self, other: &Self) -> Self {
        Self(self.0 + other.0)
    }
    pub fn sub(&self, other: &Self) -> Self {
        Self(self.0 - other.0)
    }
    pub fn neg(&self) -> Self {
        Self(-self.0)
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 { a.add(b) });
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 { a.sub(b) });
impl_op_ex!(-|a: &Vec4| -> Vec4 { a.neg() });

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn three_vector_algebra() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(-1.0, 0.5, 2.0);
        assert_relative_eq!(a.dot(&b), 6.0);
        let c = a.cross(&b);
        assert_relative_eq!(c.dot(&a), 0.0, epsilon = 1e-12);
        assert_relative_eq!(c.dot(&b), 0.0, epsilon = 1e-12);
        assert_relative_eq!((a + b).x(), 0.0);
        assert_relative_eq!((2.0 * a).y(), 4.0);
        assert_relative_eq!(a.unit().mag(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn four_vector_mass() {
        let p = Vec3::new(0.3, -0.4, 1.2).with_mass(0.13957);
        assert_relative_eq!(p.mag(), 0.13957, epsilon = 1e-12);
        assert_relative_eq!(p.perp(), 0.5, epsilon = 1e-12);
        let q = Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!((p + q).e(), p.e() + 1.0);
    }

    #[test]
    fn angles() {
        let a = Vec3::new(0.0, 1.0, 0.0);
        assert_relative_eq!(a.phi(), std::f64::consts::FRAC_PI_2);
        assert_relative_eq!(a.theta(), std::f64::consts::FRAC_PI_2);
    }
}
