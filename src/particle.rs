use std::{fmt::Display, sync::Arc};

use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{
    field::{FieldHandle, MagneticField},
    settings::FitSettings,
    utils::{enums::Representation, ij},
    KFError, KFResult,
};

/// Kalman-filter updates: daughters, constraints and vertex subtraction.
pub mod fit;
/// Path-length solvers and distance queries.
pub mod geometry;

/// The error attached to a [`Measurement`] which could not be determined.
pub const UNDEFINED_ERROR: f64 = 1e20;

/// Relative size of a negative variance, compared to the terms it was summed from, which is
/// still attributed to round-off.
const ROUND_OFF: f64 = 1e-12;

/// Clamp a propagated variance which cancels to zero up to round-off, and reject one which is
/// clearly negative.
fn settle_round_off(
    quantity: &'static str,
    value: f64,
    variance: f64,
    scale: f64,
) -> KFResult<f64> {
    if variance >= 0.0 {
        Ok(variance)
    } else if -variance <= ROUND_OFF * scale {
        Ok(0.0)
    } else {
        Err(KFError::NegativeVariance {
            quantity,
            value,
            variance,
        })
    }
}

/// A derived quantity together with its propagated uncertainty.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// The central value.
    pub value: f64,
    /// The one-sigma uncertainty.
    pub error: f64,
}

impl Measurement {
    /// Construct a [`Measurement`].
    pub fn new(value: f64, error: f64) -> Self {
        Self { value, error }
    }
    /// A value whose uncertainty could not be determined, marked by [`UNDEFINED_ERROR`].
    pub fn undefined(value: f64) -> Self {
        Self {
            value,
            error: UNDEFINED_ERROR,
        }
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ± {}", self.value, self.error)
    }
}

/// A particle (a single track or a reconstructed decay) described by the parameters
/// `[x, y, z, px, py, pz, E, s]` at a point of its trajectory, where `s` is the decay length
/// divided by the momentum, together with their covariance.
///
/// The covariance is stored as the packed lower triangle of the symmetric 8x8 matrix (see
/// [`ij`](crate::utils::ij)). Lengths are in cm, momenta and energies in GeV.
///
/// A particle is either built from a track with [`KFParticle::from_track`] or started empty with
/// [`KFParticle::new`] and filled with daughters through [`KFParticle::add_daughter`] (or `+=`),
/// optionally followed by [`KFParticle::set_mass_constraint`],
/// [`KFParticle::set_production_vertex`] or [`KFParticle::set_no_decay_length`].
#[derive(Clone, Debug)]
pub struct KFParticle {
    pub(crate) state: [f64; 8],
    pub(crate) covariance: [f64; 36],
    pub(crate) charge: i32,
    pub(crate) ndf: i32,
    pub(crate) chi2: f64,
    pub(crate) s_from_decay: f64,
    pub(crate) at_production_vertex: bool,
    pub(crate) is_linearized: bool,
    pub(crate) vtx_guess: [f64; 3],
    pub(crate) settings: FitSettings,
    pub(crate) field: FieldHandle,
}

impl KFParticle {
    /// Construct an empty particle, ready to accept daughters.
    ///
    /// The position variances are set to 100 cm² and the variance of `s` to 1, the number of
    /// degrees of freedom is `-3`.
    pub fn new(field: FieldHandle) -> Self {
        let mut covariance = [0.0; 36];
        covariance[0] = 100.0;
        covariance[2] = 100.0;
        covariance[5] = 100.0;
        covariance[35] = 1.0;
        Self {
            state: [0.0; 8],
            covariance,
            charge: 0,
            ndf: -3,
            chi2: 0.0,
            s_from_decay: 0.0,
            at_production_vertex: false,
            is_linearized: false,
            vtx_guess: [0.0; 3],
            settings: FitSettings::default(),
            field,
        }
    }

    /// Construct a particle from a track with Cartesian parameters `[x, y, z, px, py, pz]`,
    /// their packed 21-entry covariance, a charge and a mass hypothesis.
    ///
    /// The energy is computed from the mass hypothesis and its covariance follows from the
    /// Jacobian `∂E/∂p = p/E`. The decay parameter `s` starts at zero with unit variance.
    pub fn from_track(
        parameters: [f64; 6],
        covariance: [f64; 21],
        charge: i32,
        mass: f64,
        field: FieldHandle,
    ) -> Self {
        let mut state = [0.0; 8];
        state[..6].copy_from_slice(&parameters);
        let energy = (mass * mass
            + parameters[3] * parameters[3]
            + parameters[4] * parameters[4]
            + parameters[5] * parameters[5])
            .sqrt();
        state[6] = energy;

        let mut c = [0.0; 36];
        c[..21].copy_from_slice(&covariance);
        let inv_e = 1.0 / energy;
        let h = [
            parameters[3] * inv_e,
            parameters[4] * inv_e,
            parameters[5] * inv_e,
        ];
        // Cov(E, q_k) = Σ_i h_i Cov(p_i, q_k)
        for k in 0..6 {
            c[ij(6, k)] = h[0] * covariance[ij(3, k)]
                + h[1] * covariance[ij(4, k)]
                + h[2] * covariance[ij(5, k)];
        }
        c[27] = h[0] * h[0] * c[9]
            + h[1] * h[1] * c[14]
            + h[2] * h[2] * c[20]
            + 2.0 * (h[0] * h[1] * c[13] + h[0] * h[2] * c[18] + h[1] * h[2] * c[19]);
        c[35] = 1.0;

        Self {
            state,
            covariance: c,
            charge,
            ndf: 0,
            chi2: 0.0,
            s_from_decay: 0.0,
            at_production_vertex: false,
            is_linearized: false,
            vtx_guess: [0.0; 3],
            settings: FitSettings::default(),
            field,
        }
    }

    /// Construct a vertex from a fitted position, its packed 3x3 covariance
    /// `[xx, xy, yy, xz, yz, zz]`, and the fit quality.
    ///
    /// The result carries no momentum and can be passed to
    /// [`KFParticle::set_production_vertex`] or used as a seed for track subtraction.
    pub fn vertex(
        position: [f64; 3],
        covariance: [f64; 6],
        chi2: f64,
        ndf: i32,
        field: FieldHandle,
    ) -> Self {
        let mut vertex = Self::new(field);
        vertex.state[..3].copy_from_slice(&position);
        vertex.covariance = [0.0; 36];
        vertex.covariance[..6].copy_from_slice(&covariance);
        vertex.chi2 = chi2;
        vertex.ndf = ndf;
        vertex
    }

    /// Supply an estimate of the decay vertex. Subsequent fits of this particle linearize
    /// around the guess and run [`FitSettings::linearized_iterations`] passes.
    pub fn set_vtx_guess(&mut self, guess: [f64; 3]) {
        self.vtx_guess = guess;
        self.is_linearized = true;
    }

    /// Replace the [`FitSettings`] used by the fits this particle takes part in.
    pub fn with_settings(mut self, settings: FitSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Reset this particle to the empty state of [`KFParticle::new`], keeping its field,
    /// settings and vertex guess.
    pub fn clear(&mut self) {
        let guess = (self.vtx_guess, self.is_linearized);
        *self = Self::new(self.field.clone()).with_settings(self.settings);
        (self.vtx_guess, self.is_linearized) = guess;
    }

    /// The parameters `[x, y, z, px, py, pz, E, s]`.
    pub fn state(&self) -> &[f64; 8] {
        &self.state
    }
    /// The packed covariance of [`KFParticle::state`].
    pub fn covariance(&self) -> &[f64; 36] {
        &self.covariance
    }
    /// A single covariance element.
    pub fn cov(&self, i: usize, j: usize) -> f64 {
        self.covariance[ij(i, j)]
    }
    /// The x-coordinate.
    pub fn x(&self) -> f64 {
        self.state[0]
    }
    /// The y-coordinate.
    pub fn y(&self) -> f64 {
        self.state[1]
    }
    /// The z-coordinate.
    pub fn z(&self) -> f64 {
        self.state[2]
    }
    /// The x-component of the momentum.
    pub fn px(&self) -> f64 {
        self.state[3]
    }
    /// The y-component of the momentum.
    pub fn py(&self) -> f64 {
        self.state[4]
    }
    /// The z-component of the momentum.
    pub fn pz(&self) -> f64 {
        self.state[5]
    }
    /// The energy.
    pub fn e(&self) -> f64 {
        self.state[6]
    }
    /// The decay length divided by the momentum.
    pub fn s(&self) -> f64 {
        self.state[7]
    }
    /// The position as a vector.
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.state[0], self.state[1], self.state[2])
    }
    /// The position as an array, the form taken by the point queries.
    pub fn xyz(&self) -> [f64; 3] {
        [self.state[0], self.state[1], self.state[2]]
    }
    /// The position block `[xx, xy, yy, xz, yz, zz]` of the covariance.
    pub fn position_covariance(&self) -> [f64; 6] {
        let mut c = [0.0; 6];
        c.copy_from_slice(&self.covariance[..6]);
        c
    }
    /// The three-momentum.
    pub fn p3(&self) -> Vector3<f64> {
        Vector3::new(self.state[3], self.state[4], self.state[5])
    }
    /// The four-momentum `(px, py, pz, E)`, see
    /// [`FourMomentum`](crate::utils::vectors::FourMomentum).
    pub fn p4(&self) -> Vector4<f64> {
        Vector4::new(self.state[3], self.state[4], self.state[5], self.state[6])
    }
    /// The electric charge in units of the elementary charge.
    pub fn charge(&self) -> i32 {
        self.charge
    }
    /// The number of degrees of freedom of the fit; `-3` for an empty particle and `-1` after
    /// the first daughter.
    pub fn ndf(&self) -> i32 {
        self.ndf
    }
    /// The accumulated χ² of the fit.
    pub fn chi2(&self) -> f64 {
        self.chi2
    }
    /// The signed path (in units of `s`) travelled from the decay vertex.
    pub fn s_from_decay(&self) -> f64 {
        self.s_from_decay
    }
    /// Which vertex the parameters currently describe.
    pub fn representation(&self) -> Representation {
        if self.at_production_vertex {
            Representation::ProductionVertex
        } else {
            Representation::DecayVertex
        }
    }
    /// Whether a vertex guess was supplied with [`KFParticle::set_vtx_guess`].
    pub fn is_linearized(&self) -> bool {
        self.is_linearized
    }
    /// The current vertex guess.
    pub fn vtx_guess(&self) -> &[f64; 3] {
        &self.vtx_guess
    }
    /// The settings used by fits involving this particle.
    pub fn settings(&self) -> &FitSettings {
        &self.settings
    }
    /// The magnetic field this particle is propagated through.
    pub fn field(&self) -> &dyn MagneticField {
        self.field.as_ref()
    }
    /// A shared handle to the magnetic field, for building related particles.
    pub fn field_handle(&self) -> FieldHandle {
        Arc::clone(&self.field)
    }

    /// The absolute momentum.
    pub fn momentum(&self) -> KFResult<Measurement> {
        let [x, y, z] = [self.state[3], self.state[4], self.state[5]];
        let c = &self.covariance;
        let p = (x * x + y * y + z * z).sqrt();
        let variance = x * x * c[9]
            + y * y * c[14]
            + z * z * c[20]
            + 2.0 * (x * y * c[13] + x * z * c[18] + y * z * c[19]);
        if p <= 1e-4 {
            return Err(KFError::Degenerate {
                quantity: "momentum",
                value: p,
            });
        }
        if variance < 0.0 {
            return Err(KFError::NegativeVariance {
                quantity: "momentum",
                value: p,
                variance,
            });
        }
        Ok(Measurement::new(p, variance.sqrt() / p))
    }

    /// The transverse momentum.
    pub fn pt(&self) -> KFResult<Measurement> {
        let [x, y] = [self.state[3], self.state[4]];
        let c = &self.covariance;
        let pt = (x * x + y * y).sqrt();
        let variance = x * x * c[9] + y * y * c[14] + 2.0 * x * y * c[13];
        if pt <= 1e-4 {
            return Err(KFError::Degenerate {
                quantity: "transverse momentum",
                value: pt,
            });
        }
        if variance < 0.0 {
            return Err(KFError::NegativeVariance {
                quantity: "transverse momentum",
                value: pt,
                variance,
            });
        }
        Ok(Measurement::new(pt, variance.sqrt() / pt))
    }

    /// The pseudorapidity `½ ln((p + pz) / (p - pz))`.
    pub fn eta(&self) -> KFResult<Measurement> {
        let [px, py, pz] = [self.state[3], self.state[4], self.state[5]];
        let pt2 = px * px + py * py;
        let p = (pt2 + pz * pz).sqrt();
        if pt2 <= 1e-8 || p - pz <= 1e-8 {
            return Err(KFError::Degenerate {
                quantity: "pseudorapidity",
                value: pt2.sqrt(),
            });
        }
        let eta = 0.5 * ((p + pz) / (p - pz)).ln();
        let h = [-px * pz / (p * pt2), -py * pz / (p * pt2), 1.0 / p];
        let variance = self.momentum_variance(&h);
        if variance < 0.0 {
            return Err(KFError::NegativeVariance {
                quantity: "pseudorapidity",
                value: eta,
                variance,
            });
        }
        Ok(Measurement::new(eta, variance.sqrt()))
    }

    /// The azimuthal angle of the momentum.
    pub fn phi(&self) -> KFResult<Measurement> {
        let [px, py] = [self.state[3], self.state[4]];
        let pt2 = px * px + py * py;
        let phi = py.atan2(px);
        if pt2 <= 1e-8 {
            return Err(KFError::Degenerate {
                quantity: "azimuth",
                value: phi,
            });
        }
        let c = &self.covariance;
        let variance = py * py * c[9] + px * px * c[14] - 2.0 * px * py * c[13];
        if variance < 0.0 {
            return Err(KFError::NegativeVariance {
                quantity: "azimuth",
                value: phi,
                variance,
            });
        }
        Ok(Measurement::new(phi, variance.sqrt() / pt2))
    }

    /// The transverse distance from the beam axis.
    pub fn r(&self) -> KFResult<Measurement> {
        let [x, y] = [self.state[0], self.state[1]];
        let c = &self.covariance;
        let r = (x * x + y * y).sqrt();
        if r <= 1e-8 {
            return Err(KFError::Degenerate {
                quantity: "radius",
                value: r,
            });
        }
        let variance = x * x * c[0] + y * y * c[2] + 2.0 * x * y * c[1];
        Ok(Measurement::new(r, variance.abs().sqrt() / r))
    }

    /// The invariant mass.
    ///
    /// Fails when `E² - p²` is not positive, which happens for unphysical combinations and
    /// through round-off for nearly massless particles.
    pub fn mass(&self) -> KFResult<Measurement> {
        let [px, py, pz, e] = [self.state[3], self.state[4], self.state[5], self.state[6]];
        let c = &self.covariance;
        let m2 = e * e - px * px - py * py - pz * pz;
        if m2 <= 0.0 {
            return Err(KFError::UnphysicalMass { mass_squared: m2 });
        }
        let m = m2.sqrt();
        let variance = px * px * c[9]
            + py * py * c[14]
            + pz * pz * c[20]
            + e * e * c[27]
            + 2.0
                * (px * py * c[13] + pz * (px * c[18] + py * c[19])
                    - e * (px * c[24] + py * c[25] + pz * c[26]));
        let scale = px * px * c[9].abs()
            + py * py * c[14].abs()
            + pz * pz * c[20].abs()
            + e * e * c[27].abs();
        let variance = settle_round_off("mass", m, variance, scale)?;
        Ok(Measurement::new(m, variance.sqrt() / m))
    }

    /// The decay length `s·p`.
    pub fn decay_length(&self) -> KFResult<Measurement> {
        let [x, y, z, t] = [self.state[3], self.state[4], self.state[5], self.state[7]];
        let c = &self.covariance;
        let p2 = x * x + y * y + z * z;
        let l = t * p2.sqrt();
        if p2 <= 1e-4 {
            return Err(KFError::Degenerate {
                quantity: "decay length",
                value: l,
            });
        }
        let variance = p2 * c[35]
            + t * t / p2
                * (x * x * c[9]
                    + y * y * c[14]
                    + z * z * c[20]
                    + 2.0 * (x * y * c[13] + x * z * c[18] + y * z * c[19]))
            + 2.0 * t * (x * c[31] + y * c[32] + z * c[33]);
        Ok(Measurement::new(l, variance.abs().sqrt()))
    }

    /// The decay length projected onto the transverse plane.
    pub fn decay_length_xy(&self) -> KFResult<Measurement> {
        let [x, y, t] = [self.state[3], self.state[4], self.state[7]];
        let c = &self.covariance;
        let pt2 = x * x + y * y;
        let l = t * pt2.sqrt();
        if pt2 <= 1e-4 {
            return Err(KFError::Degenerate {
                quantity: "transverse decay length",
                value: l,
            });
        }
        let variance = pt2 * c[35]
            + t * t / pt2 * (x * x * c[9] + y * y * c[14] + 2.0 * x * y * c[13])
            + 2.0 * t * (x * c[31] + y * c[32]);
        Ok(Measurement::new(l, variance.abs().sqrt()))
    }

    /// The proper decay length `c·τ = s·m`.
    pub fn lifetime(&self) -> KFResult<Measurement> {
        let mass = self.mass()?;
        let [px, py, pz, e, t] = [
            self.state[3],
            self.state[4],
            self.state[5],
            self.state[6],
            self.state[7],
        ];
        let c = &self.covariance;
        let c_tm = -px * c[31] - py * c[32] - pz * c[33] + e * c[34];
        let ctau = t * mass.value;
        let variance =
            mass.value * mass.value * c[35] + 2.0 * t * c_tm + t * t * mass.error * mass.error;
        let scale = mass.value * mass.value * c[35].abs()
            + (2.0 * t * c_tm).abs()
            + t * t * mass.error * mass.error;
        let variance = settle_round_off("lifetime", ctau, variance, scale)?;
        Ok(Measurement::new(ctau, variance.sqrt()))
    }

    /// `hᵗ C h` over the momentum block for a gradient `h = ∂f/∂(px, py, pz)`.
    fn momentum_variance(&self, h: &[f64; 3]) -> f64 {
        let mut variance = 0.0;
        for i in 0..3 {
            for j in 0..3 {
                variance += h[i] * h[j] * self.covariance[ij(3 + i, 3 + j)];
            }
        }
        variance
    }

    /// A serializable snapshot of this particle's numerical state.
    pub fn record(&self) -> ParticleRecord {
        ParticleRecord {
            state: self.state,
            covariance: self.covariance,
            charge: self.charge,
            ndf: self.ndf,
            chi2: self.chi2,
            s_from_decay: self.s_from_decay,
            representation: self.representation(),
            settings: self.settings,
        }
    }

    /// Restore a particle from a [`ParticleRecord`].
    pub fn from_record(record: &ParticleRecord, field: FieldHandle) -> Self {
        let mut particle = Self::new(field).with_settings(record.settings);
        particle.state = record.state;
        particle.covariance = record.covariance;
        particle.charge = record.charge;
        particle.ndf = record.ndf;
        particle.chi2 = record.chi2;
        particle.s_from_decay = record.s_from_decay;
        particle.at_production_vertex = record.representation == Representation::ProductionVertex;
        particle
    }
}

/// The numerical state of a [`KFParticle`] without its field provider, for storage alongside
/// reconstructed candidates.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleRecord {
    /// See [`KFParticle::state`].
    pub state: [f64; 8],
    /// See [`KFParticle::covariance`].
    #[serde_as(as = "[_; 36]")]
    pub covariance: [f64; 36],
    /// See [`KFParticle::charge`].
    pub charge: i32,
    /// See [`KFParticle::ndf`].
    pub ndf: i32,
    /// See [`KFParticle::chi2`].
    pub chi2: f64,
    /// See [`KFParticle::s_from_decay`].
    pub s_from_decay: f64,
    /// See [`KFParticle::representation`].
    pub representation: Representation,
    /// See [`KFParticle::settings`].
    pub settings: FitSettings,
}

/// Build the diagonal packed covariance of a track from the standard deviations of
/// `[x, y, z, px, py, pz]`.
pub fn diagonal_covariance(sigmas: [f64; 6]) -> [f64; 21] {
    let mut c = [0.0; 21];
    for (i, sigma) in sigmas.iter().enumerate() {
        c[ij(i, i)] = sigma * sigma;
    }
    c
}

/// The two pion daughters of a neutral kaon candidate which can be used to test fits.
/// Both tracks start at the origin with energies of 1 GeV and 10 µm / 1 MeV resolution.
#[cfg(test)]
pub(crate) fn test_daughters(field: FieldHandle) -> [KFParticle; 2] {
    let covariance = diagonal_covariance([1e-3; 6]);
    let daughter = |p: [f64; 6], charge: i32, field: FieldHandle| {
        let mass = (1.0 - p[3] * p[3] - p[4] * p[4] - p[5] * p[5]).sqrt();
        KFParticle::from_track(p, covariance, charge, mass, field)
    };
    [
        daughter([0.0, 0.0, 0.0, 0.3, 0.0, 0.0], 1, field.clone()),
        daughter([0.0, 0.0, 0.0, -0.25, 0.05, 0.0], -1, field),
    ]
}

#[cfg(test)]
mod tests {
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;
    use crate::{
        field::{UniformField, ZeroField},
        utils::vectors::FourMomentum,
    };

    fn track(parameters: [f64; 6], charge: i32, mass: f64) -> KFParticle {
        KFParticle::from_track(
            parameters,
            diagonal_covariance([0.01, 0.02, 0.03, 0.001, 0.002, 0.003]),
            charge,
            mass,
            Arc::new(UniformField::new(5.0)),
        )
    }

    #[test]
    fn test_empty_particle() {
        let p = KFParticle::new(Arc::new(ZeroField));
        assert_eq!(p.ndf(), -3);
        assert_eq!(p.chi2(), 0.0);
        assert_eq!(p.charge(), 0);
        assert_eq!(p.state(), &[0.0; 8]);
        assert_eq!(p.cov(0, 0), 100.0);
        assert_eq!(p.cov(1, 1), 100.0);
        assert_eq!(p.cov(2, 2), 100.0);
        assert_eq!(p.cov(7, 7), 1.0);
        assert_eq!(p.cov(3, 3), 0.0);
        assert_eq!(p.representation(), Representation::DecayVertex);
    }

    #[test]
    fn test_track_energy_momentum_consistency() {
        let mut rng = fastrand::Rng::with_seed(11);
        for _ in 0..100 {
            let mass = rng.f64() * 2.0;
            let p = [
                rng.f64(),
                rng.f64(),
                rng.f64(),
                rng.f64() * 4.0 - 2.0,
                rng.f64() * 4.0 - 2.0,
                rng.f64() * 4.0 - 2.0,
            ];
            let t = track(p, 1, mass);
            assert_relative_eq!(t.p4().m2(), mass * mass, epsilon = 1e-12, max_relative = 1e-9);
            assert_eq!(t.s(), 0.0);
            assert_eq!(t.ndf(), 0);
        }
    }

    #[test]
    fn test_track_energy_covariance() {
        let t = track([0.0, 0.0, 0.0, 0.3, 0.4, 1.2], 1, 0.13957);
        let e = t.e();
        let h = [0.3 / e, 0.4 / e, 1.2 / e];
        let var_p = [0.001_f64.powi(2), 0.002_f64.powi(2), 0.003_f64.powi(2)];
        assert_relative_eq!(t.cov(6, 3), h[0] * var_p[0]);
        assert_relative_eq!(t.cov(6, 4), h[1] * var_p[1]);
        assert_relative_eq!(t.cov(6, 5), h[2] * var_p[2]);
        assert_eq!(t.cov(6, 0), 0.0);
        assert_relative_eq!(
            t.cov(6, 6),
            h[0] * h[0] * var_p[0] + h[1] * h[1] * var_p[1] + h[2] * h[2] * var_p[2]
        );
        assert_eq!(t.cov(7, 7), 1.0);
        for k in 0..7 {
            assert_eq!(t.cov(7, k), 0.0);
        }
    }

    #[test]
    fn test_momentum() {
        let t = track([0.0, 0.0, 0.0, 3.0, 4.0, 0.0], 1, 0.0);
        let p = t.momentum().unwrap();
        assert_relative_eq!(p.value, 5.0);
        let expected = ((9.0 * 1e-6 + 16.0 * 4e-6) as f64).sqrt() / 5.0;
        assert_relative_eq!(p.error, expected);
        let pt = t.pt().unwrap();
        assert_relative_eq!(pt.value, 5.0);
        assert_relative_eq!(pt.error, expected);
    }

    #[test]
    fn test_degenerate_momentum() {
        let t = track([1.0, 2.0, 3.0, 0.0, 0.0, 0.0], 0, 0.5);
        let err = t.momentum().unwrap_err();
        assert!(matches!(err, KFError::Degenerate { .. }));
        let fallback = err.fallback();
        assert_eq!(fallback.error, UNDEFINED_ERROR);
        assert!(!fallback.value.is_nan());
        assert!(t.pt().is_err());
        assert!(t.eta().is_err());
        assert!(t.phi().is_err());
        assert!(t.decay_length().is_err());
    }

    #[test]
    fn test_mass() {
        let t = track([0.0, 0.0, 0.0, 0.3, -0.2, 0.7], 1, 0.493677);
        let m = t.mass().unwrap();
        assert_relative_eq!(m.value, 0.493677, max_relative = 1e-12);
        // E is built from the mass hypothesis, so the mass carries no uncertainty
        assert_abs_diff_eq!(m.error, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_track_mass_survives_round_off() {
        let mut rng = fastrand::Rng::with_seed(12);
        for _ in 0..1000 {
            let p = [
                rng.f64(),
                rng.f64(),
                rng.f64(),
                rng.f64() * 4.0 - 2.0,
                rng.f64() * 4.0 - 2.0,
                rng.f64() * 4.0 - 2.0,
            ];
            let t = KFParticle::from_track(
                p,
                diagonal_covariance([0.01, 0.01, 0.01, 1e-3, 1e-3, 1e-3]),
                1,
                0.13957,
                Arc::new(ZeroField),
            );
            let m = t.mass().unwrap();
            assert_relative_eq!(m.value, 0.13957, max_relative = 1e-6);
            assert_abs_diff_eq!(m.error, 0.0, epsilon = 1e-6);
            let ctau = t.lifetime().unwrap();
            assert_eq!(ctau.value, 0.0);
            assert_relative_eq!(ctau.error, 0.13957, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_clearly_negative_mass_variance() {
        let mut t = track([0.0, 0.0, 0.0, 0.3, -0.2, 0.7], 1, 0.493677);
        t.covariance[27] = -1e-3;
        let err = t.mass().unwrap_err();
        assert!(matches!(err, KFError::NegativeVariance { quantity: "mass", .. }));
        assert_relative_eq!(err.fallback().value, 0.493677, max_relative = 1e-12);
    }

    #[test]
    fn test_unphysical_mass() {
        let mut t = track([0.0, 0.0, 0.0, 0.3, 0.0, 0.0], 1, 0.1);
        t.state[6] = 0.2;
        let err = t.mass().unwrap_err();
        assert!(matches!(err, KFError::UnphysicalMass { mass_squared } if mass_squared < 0.0));
        assert_eq!(err.fallback(), Measurement::undefined(0.0));
        assert!(t.lifetime().is_err());
    }

    #[test]
    fn test_angles() {
        let t = track([0.0, 0.0, 0.0, 1.0, 1.0, 2.0_f64.sqrt()], -1, 0.1);
        assert_relative_eq!(t.phi().unwrap().value, std::f64::consts::FRAC_PI_4);
        let p = 2.0;
        let pz = 2.0_f64.sqrt();
        assert_relative_eq!(t.eta().unwrap().value, 0.5 * ((p + pz) / (p - pz)).ln());
        // var(phi) = (py² var(px) + px² var(py)) / pt⁴
        assert_relative_eq!(t.phi().unwrap().error, (1e-6_f64 + 4e-6).sqrt() / 2.0);
    }

    #[test]
    fn test_radius() {
        let t = track([3.0, 4.0, 1.0, 0.1, 0.0, 0.0], 1, 0.1);
        let r = t.r().unwrap();
        assert_relative_eq!(r.value, 5.0);
        let expected = ((9.0 * 1e-4 + 16.0 * 4e-4) as f64).sqrt() / 5.0;
        assert_relative_eq!(r.error, expected);
    }

    #[test]
    fn test_decay_length_and_lifetime() {
        let mut t = track([0.0, 0.0, 0.0, 0.6, 0.8, 0.0], 0, 0.497611);
        t.state[7] = 2.0;
        let l = t.decay_length().unwrap();
        assert_relative_eq!(l.value, 2.0);
        assert_abs_diff_eq!(l.error, 1.0, epsilon = 1e-3);
        let lxy = t.decay_length_xy().unwrap();
        assert_relative_eq!(lxy.value, 2.0);
        let ctau = t.lifetime().unwrap();
        assert_relative_eq!(ctau.value, 2.0 * 0.497611, max_relative = 1e-9);
    }

    #[test]
    fn test_vertex_constructor() {
        let v = KFParticle::vertex(
            [0.1, 0.2, 0.3],
            [1e-4, 0.0, 1e-4, 0.0, 0.0, 4e-4],
            3.5,
            5,
            Arc::new(ZeroField),
        );
        assert_eq!(v.x(), 0.1);
        assert_eq!(v.z(), 0.3);
        assert_eq!(v.cov(2, 2), 4e-4);
        assert_eq!(v.cov(7, 7), 0.0);
        assert_eq!(v.ndf(), 5);
        assert_eq!(v.chi2(), 3.5);
        assert_eq!(v.charge(), 0);
    }

    #[test]
    fn test_record_restores_particle() {
        let mut t = track([1.0, 2.0, 3.0, 0.6, 0.8, 0.1], 1, 0.13957);
        t.transport_to_ds(1.5);
        let record = t.record();
        let encoded = bincode::serialize(&record).unwrap();
        let decoded: ParticleRecord = bincode::deserialize(&encoded).unwrap();
        let restored = KFParticle::from_record(&decoded, t.field_handle());
        assert_eq!(restored.state(), t.state());
        assert_eq!(restored.covariance(), t.covariance());
        assert_eq!(restored.s_from_decay(), 1.5);
        assert_eq!(restored.charge(), 1);
    }

    #[test]
    fn test_clear_keeps_guess() {
        let mut t = track([1.0, 2.0, 3.0, 0.6, 0.8, 0.1], 1, 0.13957);
        t.set_vtx_guess([1.0, 1.0, 1.0]);
        t.clear();
        assert_eq!(t.ndf(), -3);
        assert!(t.is_linearized());
        assert_eq!(t.vtx_guess(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_test_daughters_have_unit_energy() {
        let [plus, minus] = test_daughters(Arc::new(ZeroField));
        assert_relative_eq!(plus.e(), 1.0, max_relative = 1e-12);
        assert_relative_eq!(minus.e(), 1.0, max_relative = 1e-12);
        assert_eq!(plus.charge() + minus.charge(), 0);
    }

    #[test]
    fn test_measurement_display() {
        assert_eq!(format!("{}", Measurement::new(1.5, 0.25)), "1.5 ± 0.25");
    }
}
