use nalgebra::{Vector3, Vector4};

/// Extension methods for a [`Vector4`] holding a four-momentum in the particle parameter
/// ordering `(px, py, pz, E)`.
pub trait FourMomentum {
    /// The x-component of the momentum.
    fn px(&self) -> f64;
    /// The y-component of the momentum.
    fn py(&self) -> f64;
    /// The z-component of the momentum.
    fn pz(&self) -> f64;
    /// The energy.
    fn e(&self) -> f64;
    /// The three-momentum.
    fn momentum(&self) -> Vector3<f64>;
    /// The velocity `p / E`.
    fn beta(&self) -> Vector3<f64>;
    /// The Lorentz factor `E / m`.
    fn gamma(&self) -> f64;
    /// The invariant mass squared `E² - p²`.
    fn m2(&self) -> f64;
    /// The invariant mass (the square root of [`FourMomentum::m2`]).
    fn m(&self) -> f64;
    /// Boost the four-momentum by the velocity `beta`.
    fn boost(&self, beta: &Vector3<f64>) -> Vector4<f64>;
}

impl FourMomentum for Vector4<f64> {
    fn px(&self) -> f64 {
        self[0]
    }
    fn py(&self) -> f64 {
        self[1]
    }
    fn pz(&self) -> f64 {
        self[2]
    }
    fn e(&self) -> f64 {
        self[3]
    }
    fn momentum(&self) -> Vector3<f64> {
        Vector3::new(self[0], self[1], self[2])
    }
    fn beta(&self) -> Vector3<f64> {
        self.momentum() / self.e()
    }
    fn gamma(&self) -> f64 {
        self.e() / self.m()
    }
    fn m2(&self) -> f64 {
        self.e() * self.e() - self.momentum().norm_squared()
    }
    fn m(&self) -> f64 {
        self.m2().sqrt()
    }
    fn boost(&self, beta: &Vector3<f64>) -> Vector4<f64> {
        let b2 = beta.norm_squared();
        let gamma = 1.0 / (1.0 - b2).sqrt();
        let p3 = self.momentum()
            + beta * ((gamma - 1.0) * self.momentum().dot(beta) / b2 + gamma * self.e());
        Vector4::new(
            p3.x,
            p3.y,
            p3.z,
            gamma * (self.e() + beta.dot(&self.momentum())),
        )
    }
}

/// Extension methods for a [`Vector3`] holding a three-momentum.
pub trait ThreeMomentum {
    /// The cosine of the polar angle.
    fn costheta(&self) -> f64;
    /// The polar angle.
    fn theta(&self) -> f64;
    /// The azimuthal angle.
    fn phi(&self) -> f64;
    /// Build a four-momentum with the given mass.
    fn with_mass(&self, mass: f64) -> Vector4<f64>;
    /// Build a four-momentum with the given energy.
    fn with_energy(&self, energy: f64) -> Vector4<f64>;
}

impl ThreeMomentum for Vector3<f64> {
    fn costheta(&self) -> f64 {
        self.z / self.norm()
    }
    fn theta(&self) -> f64 {
        self.costheta().acos()
    }
    fn phi(&self) -> f64 {
        self.y.atan2(self.x)
    }
    fn with_mass(&self, mass: f64) -> Vector4<f64> {
        let e = (mass * mass + self.norm_squared()).sqrt();
        self.with_energy(e)
    }
    fn with_energy(&self, energy: f64) -> Vector4<f64> {
        Vector4::new(self.x, self.y, self.z, energy)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_three_to_four_momentum_conversion() {
        let p3 = Vector3::new(1.0, 2.0, 3.0);
        let target = Vector4::new(1.0, 2.0, 3.0, 10.0);
        let from_mass = p3.with_mass(target.m());
        let from_energy = p3.with_energy(target.e());
        assert_relative_eq!(from_mass, target, epsilon = 1e-12);
        assert_eq!(from_energy, target);
    }

    #[test]
    fn test_four_momentum_basics() {
        let p = Vector4::new(3.0, 4.0, 5.0, 10.0);
        assert_eq!(p.e(), 10.0);
        assert_eq!(p.px(), 3.0);
        assert_eq!(p.py(), 4.0);
        assert_eq!(p.pz(), 5.0);
        assert_relative_eq!(p.beta(), Vector3::new(0.3, 0.4, 0.5));
        assert_relative_eq!(p.m(), 50.0_f64.sqrt());
        assert_relative_eq!(p.m2(), 50.0);
        assert_relative_eq!(p.gamma(), 2.0_f64.sqrt());
    }

    #[test]
    fn test_three_momentum_basics() {
        let p = Vector3::new(3.0, 4.0, 5.0);
        assert_relative_eq!(p.costheta(), 5.0 / 50.0_f64.sqrt());
        assert_relative_eq!(p.theta(), (5.0 / 50.0_f64.sqrt()).acos());
        assert_relative_eq!(p.phi(), 4.0_f64.atan2(3.0));
    }

    #[test]
    fn test_boost_com() {
        let p = Vector4::new(3.0, 4.0, 5.0, 10.0);
        let zero = p.boost(&-p.beta());
        assert_relative_eq!(zero.momentum(), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_boost() {
        let pa = Vector4::new(3.0, 4.0, 5.0, 10.0);
        let pb = Vector4::new(3.4, 2.3, 1.2, 9.0);
        let boosted = pa.boost(&-pb.beta());
        assert_relative_eq!(boosted.e(), 8.157632144622882, epsilon = 1e-12);
        assert_relative_eq!(boosted.px(), -0.6489200627053444, epsilon = 1e-12);
        assert_relative_eq!(boosted.py(), 1.5316128987581492, epsilon = 1e-12);
        assert_relative_eq!(boosted.pz(), 3.712145860221643, epsilon = 1e-12);
    }
}
