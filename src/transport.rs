use nalgebra::SVector;

use crate::{
    field::{MagneticField, Propagation, C_LIGHT},
    particle::KFParticle,
    utils::{enums::Representation, ij, mult_qsqt, Matrix8},
};

/// Parameters and packed covariance after a transport.
pub type Propagated = ([f64; 8], [f64; 36]);

/// Simpson-like weights of the field-sample products entering the second-order coefficients of
/// [`transport_general`].
const C2: [[f64; 3]; 3] = [[5.0, -4.0, -1.0], [44.0, 80.0, -4.0], [11.0, 44.0, 5.0]];
const CC2: [[f64; 3]; 3] = [[38.0, 8.0, -4.0], [148.0, 208.0, -20.0], [3.0, 36.0, 3.0]];

/// Every transport model is linear in the parameters for a fixed path length, so both the
/// parameters and the covariance are propagated by the same Jacobian.
fn apply_jacobian(j: &Matrix8, state: &[f64; 8], covariance: &[f64; 36]) -> Propagated {
    let p = j * SVector::<f64, 8>::from_column_slice(state);
    let mut out = [0.0; 8];
    out.copy_from_slice(p.as_slice());
    (out, mult_qsqt(j, covariance))
}

/// Straight-line transport by `ds` (path length over momentum).
pub fn transport_line(state: &[f64; 8], covariance: &[f64; 36], ds: f64) -> Propagated {
    let mut j = Matrix8::identity();
    j[(0, 3)] = ds;
    j[(1, 4)] = ds;
    j[(2, 5)] = ds;
    apply_jacobian(&j, state, covariance)
}

/// Exact helix transport by `ds` in a homogeneous field of `bz` kGauss along `z`.
pub fn transport_bz(
    state: &[f64; 8],
    covariance: &[f64; 36],
    charge: i32,
    bz: f64,
    ds: f64,
) -> Propagated {
    let b = bz * charge as f64 * C_LIGHT;
    let bs = b * ds;
    let (s, c) = bs.sin_cos();
    let (sb, cb) = if bs.abs() > 1e-10 {
        (s / b, (1.0 - c) / b)
    } else {
        let sb = (1.0 - bs * bs / 6.0) * ds;
        (sb, 0.5 * sb * bs)
    };
    let mut j = Matrix8::identity();
    j[(0, 3)] = sb;
    j[(0, 4)] = cb;
    j[(1, 3)] = -cb;
    j[(1, 4)] = sb;
    j[(2, 5)] = ds;
    j[(3, 3)] = c;
    j[(3, 4)] = s;
    j[(4, 3)] = -s;
    j[(4, 4)] = c;
    apply_jacobian(&j, state, covariance)
}

/// Transport by `ds` through an arbitrary field.
///
/// The field is sampled at the start, the middle and the end of the step, with the two later
/// points corrected for the first-order bending, and the trajectory is expanded in powers of
/// the field integrals up to third order in the dominant (`y`) component. Neutral particles
/// travel along straight lines.
pub fn transport_general(
    state: &[f64; 8],
    covariance: &[f64; 36],
    charge: i32,
    field: &dyn MagneticField,
    ds: f64,
) -> Propagated {
    if charge == 0 {
        return transport_line(state, covariance, ds);
    }
    let c = charge as f64 * C_LIGHT;
    let [px, py, pz] = [state[3], state[4], state[5]];

    let p0 = [state[0], state[1], state[2]];
    let mut p1 = [
        p0[0] + 0.5 * px * ds,
        p0[1] + 0.5 * py * ds,
        p0[2] + 0.5 * pz * ds,
    ];
    let mut p2 = [p0[0] + px * ds, p0[1] + py * ds, p0[2] + pz * ds];

    let f0 = field.field_value(&p0);
    let f1 = field.field_value(&p1);
    let f2 = field.field_value(&p2);

    let ds2 = ds * ds;
    let ssy1 = (7.0 * f0[1] + 6.0 * f1[1] - f2[1]) * c * ds2 / 96.0;
    let ssy2 = (f0[1] + 2.0 * f1[1]) * c * ds2 / 6.0;
    p1[0] -= ssy1 * pz;
    p1[2] += ssy1 * px;
    p2[0] -= ssy2 * pz;
    p2[2] += ssy2 * px;

    let f = [f0, field.field_value(&p1), field.field_value(&p2)];

    let integral = |k: usize| c * (f[0][k] + 4.0 * f[1][k] + f[2][k]) * ds / 6.0;
    let double_integral = |k: usize| c * (f[0][k] + 2.0 * f[1][k]) * ds2 / 6.0;
    let [sx, sy, sz] = [integral(0), integral(1), integral(2)];
    let [ssx, ssy, ssz] = [double_integral(0), double_integral(1), double_integral(2)];

    let (mut syz, mut ssyz) = (0.0, 0.0);
    for n in 0..3 {
        for m in 0..3 {
            syz += C2[n][m] * f[n][1] * f[m][2];
            ssyz += CC2[n][m] * f[n][1] * f[m][2];
        }
    }
    let c2 = c * c;
    syz *= c2 * ds2 / 360.0;
    ssyz *= c2 * ds2 * ds / 2520.0;

    let [f0y, f1y, f2y] = [f[0][1], f[1][1], f[2][1]];
    let syy0 = c * (f0y + 4.0 * f1y + f2y) * ds;
    let syy = syy0 * syy0 / 72.0;
    let syyy = syy0 * syy0 * syy0 / 1296.0;
    let ssyy = (f0y * (38.0 * f0y + 156.0 * f1y - f2y)
        + f1y * (208.0 * f1y + 16.0 * f2y)
        + f2y * (3.0 * f2y))
        * ds2
        * ds
        * c2
        / 2520.0;
    let ssyyy = (f0y * (f0y * (85.0 * f0y + 526.0 * f1y - 7.0 * f2y)
        + f1y * (1376.0 * f1y + 84.0 * f2y)
        + f2y * (19.0 * f2y))
        + f1y * (f1y * (1376.0 * f1y + 256.0 * f2y) + f2y * (62.0 * f2y))
        + f2y * f2y * (3.0 * f2y))
        * ds2
        * ds2
        * c2
        * c
        / 90720.0;

    let mut j = Matrix8::identity();
    j[(0, 3)] = ds - ssyy;
    j[(0, 4)] = ssz;
    j[(0, 5)] = ssyyy - ssy;
    j[(1, 3)] = -ssz;
    j[(1, 4)] = ds;
    j[(1, 5)] = ssx + ssyz;
    j[(2, 3)] = ssy - ssyyy;
    j[(2, 4)] = -ssx;
    j[(2, 5)] = ds - ssyy;
    j[(3, 3)] = 1.0 - syy;
    j[(3, 4)] = sz;
    j[(3, 5)] = syyy - sy;
    j[(4, 3)] = -sz;
    j[(4, 5)] = sx + syz;
    j[(5, 3)] = sy - syyy;
    j[(5, 4)] = -sx;
    j[(5, 5)] = 1.0 - syy;
    apply_jacobian(&j, state, covariance)
}

/// Transport by `ds` with the model selected by [`MagneticField::propagation`].
pub fn transport(
    state: &[f64; 8],
    covariance: &[f64; 36],
    charge: i32,
    field: &dyn MagneticField,
    ds: f64,
) -> Propagated {
    match field.propagation() {
        Propagation::Line => transport_line(state, covariance, ds),
        Propagation::Bz(bz) => transport_bz(state, covariance, charge, bz, ds),
        Propagation::General => transport_general(state, covariance, charge, field, ds),
    }
}

/// Re-express a covariance between the decay-vertex and production-vertex bases.
///
/// Moving the reference point by the flight parameter `s` shifts every parameter by its
/// derivative along the trajectory, so the covariance picks up the correlation with `s`
/// through `h = ∂(x, p)/∂s` (negated towards the production vertex). The parameters
/// themselves are unchanged, and converting back and forth is the identity.
pub fn convert(
    state: &[f64; 8],
    covariance: &[f64; 36],
    charge: i32,
    field: &dyn MagneticField,
    to_production: bool,
) -> [f64; 36] {
    let q = charge as f64 * C_LIGHT;
    let b = field
        .field_value(&[state[0], state[1], state[2]])
        .map(|v| v * q);
    let sign = if to_production { -1.0 } else { 1.0 };
    let mut h = [0.0; 8];
    h[0] = sign * state[3];
    h[1] = sign * state[4];
    h[2] = sign * state[5];
    h[3] = h[1] * b[2] - h[2] * b[1];
    h[4] = h[2] * b[0] - h[0] * b[2];
    h[5] = h[0] * b[1] - h[1] * b[0];

    let c7: [f64; 8] = std::array::from_fn(|k| covariance[ij(7, k)]);
    let mut out = *covariance;
    for i in 0..8 {
        for j in 0..=i {
            out[ij(i, j)] += h[i] * c7[j] + h[j] * c7[i] + h[i] * h[j] * c7[7];
        }
    }
    out
}

impl KFParticle {
    /// The parameters and covariance this particle would have after moving by `ds`, leaving
    /// the particle itself untouched.
    pub fn transported(&self, ds: f64) -> Propagated {
        transport(
            &self.state,
            &self.covariance,
            self.charge,
            self.field.as_ref(),
            ds,
        )
    }

    fn accept(&mut self, (state, covariance): Propagated, ds: f64) {
        self.state = state;
        self.covariance = covariance;
        self.s_from_decay += ds;
    }

    /// Move the particle by `ds` along its trajectory with the model appropriate for its field.
    pub fn transport_to_ds(&mut self, ds: f64) {
        let propagated = self.transported(ds);
        self.accept(propagated, ds);
    }

    /// Move the particle by `ds` along a straight line regardless of its field.
    pub fn transport_line(&mut self, ds: f64) {
        let propagated = transport_line(&self.state, &self.covariance, ds);
        self.accept(propagated, ds);
    }

    /// Move the particle by `ds` along a helix in a homogeneous field of `bz` kGauss.
    pub fn transport_bz(&mut self, bz: f64, ds: f64) {
        let propagated = transport_bz(&self.state, &self.covariance, self.charge, bz, ds);
        self.accept(propagated, ds);
    }

    /// Move the particle by `ds` through its field with the general (sampled) model.
    pub fn transport_cbm(&mut self, ds: f64) {
        let propagated = transport_general(
            &self.state,
            &self.covariance,
            self.charge,
            self.field.as_ref(),
            ds,
        );
        self.accept(propagated, ds);
    }

    /// Switch the covariance basis between the decay and production vertex representations.
    ///
    /// This only changes the covariance; [`KFParticle::transport_to_decay_vertex`] and
    /// [`KFParticle::transport_to_production_vertex`] also move the parameters.
    pub fn convert(&mut self, to_production: bool) {
        self.covariance = convert(
            &self.state,
            &self.covariance,
            self.charge,
            self.field.as_ref(),
            to_production,
        );
    }

    /// Express the particle at its decay vertex.
    pub fn transport_to_decay_vertex(&mut self) {
        if self.s_from_decay != 0.0 {
            self.transport_to_ds(-self.s_from_decay);
        }
        if self.at_production_vertex {
            self.convert(false);
        }
        self.at_production_vertex = false;
    }

    /// Express the particle at its production vertex, a flight parameter `s` before its decay.
    pub fn transport_to_production_vertex(&mut self) {
        if self.s_from_decay != -self.state[7] {
            self.transport_to_ds(-self.s_from_decay - self.state[7]);
        }
        if !self.at_production_vertex {
            self.convert(true);
        }
        self.at_production_vertex = true;
    }

    /// Move to the requested [`Representation`].
    pub fn transport_to(&mut self, representation: Representation) {
        match representation {
            Representation::DecayVertex => self.transport_to_decay_vertex(),
            Representation::ProductionVertex => self.transport_to_production_vertex(),
        }
    }
}
