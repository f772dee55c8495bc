use auto_ops::impl_op_ex;
use tracing::debug;

use crate::{
    utils::{enums::ConstraintStatus, ij, invert_sym3, sym3_mul, sym3_quadratic},
    KFError, KFResult,
};

use super::KFParticle;

fn dot3(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

impl KFParticle {
    /// Add a daughter to this particle with a Kalman-filter vertex fit.
    ///
    /// The first daughter is copied. Every further daughter is fitted to a common vertex
    /// with the accumulated state: the position is pulled to the fitted vertex, the momenta
    /// and energies are summed, `chi2` grows by the vertex residual and `ndf` by two.
    ///
    /// Without a vertex guess (see [`KFParticle::set_vtx_guess`]) the fit is relinearized
    /// [`FitSettings::unlinearized_iterations`](crate::FitSettings::unlinearized_iterations)
    /// times, starting from the point of closest approach of the first two daughters.
    pub fn add_daughter(&mut self, daughter: &KFParticle) {
        if self.ndf < -1 {
            self.state[..7].copy_from_slice(&daughter.state[..7]);
            self.covariance[..28].copy_from_slice(&daughter.covariance[..28]);
            self.charge = daughter.charge;
            self.ndf = -1;
            self.s_from_decay = 0.0;
            return;
        }

        self.transport_to_decay_vertex();

        if !self.is_linearized {
            self.vtx_guess = if self.ndf == -1 {
                let (ds, ds1) = self.ds_to_particle(daughter);
                self.transport_to_ds(ds);
                let (m, _) = daughter.transported(ds1);
                [
                    0.5 * (self.state[0] + m[0]),
                    0.5 * (self.state[1] + m[1]),
                    0.5 * (self.state[2] + m[2]),
                ]
            } else {
                self.xyz()
            };
        }

        let iterations = self.settings.iterations(self.is_linearized);
        for iteration in 0..iterations {
            let guess = self.vtx_guess;
            let (ff_p, ff_c) = if self.ndf == -1 {
                self.measurement(&guess)
            } else {
                (self.state, self.covariance)
            };
            let (m, mv) = if daughter.covariance[35] > 0.0 {
                daughter.measurement(&guess)
            } else {
                (daughter.state, daughter.covariance)
            };

            let sum: [f64; 6] = std::array::from_fn(|k| ff_c[k] + mv[k]);
            let s = invert_sym3(&sum, self.settings.singular_threshold).unwrap_or_else(|| {
                debug!(?guess, "singular vertex covariance while adding a daughter");
                [0.0; 6]
            });
            let zeta = [m[0] - ff_p[0], m[1] - ff_p[1], m[2] - ff_p[2]];

            let cht: [[f64; 3]; 7] = std::array::from_fn(|i| {
                std::array::from_fn(|j| {
                    if i < 3 {
                        ff_c[ij(i, j)]
                    } else {
                        ff_c[ij(i, j)] - mv[ij(i, j)]
                    }
                })
            });
            let k: [[f64; 3]; 7] = std::array::from_fn(|i| sym3_mul(&s, &cht[i]));

            if iteration + 1 < iterations {
                self.vtx_guess = std::array::from_fn(|i| ff_p[i] + dot3(&k[i], &zeta));
                continue;
            }

            let mut p = ff_p;
            let mut c = ff_c;
            for i in 3..7 {
                p[i] += m[i];
                for j in 3..=i {
                    c[ij(i, j)] += mv[ij(i, j)];
                }
            }
            for i in 0..7 {
                self.state[i] = p[i] + dot3(&k[i], &zeta);
                for j in 0..=i {
                    self.covariance[ij(i, j)] = c[ij(i, j)] - dot3(&k[i], &cht[j]);
                }
            }
            self.chi2 += sym3_quadratic(&s, &zeta);
        }
        self.ndf += 2;
        self.charge += daughter.charge;
        self.s_from_decay = 0.0;
    }

    /// Reset this particle and build it from `daughters`, optionally constraining its mass and
    /// attaching it to a production vertex (in that order).
    ///
    /// Returns the status of the mass constraint, which is [`ConstraintStatus::Applied`] when no
    /// mass is requested.
    pub fn construct(
        &mut self,
        daughters: &[KFParticle],
        production_vertex: Option<&KFParticle>,
        mass: Option<f64>,
    ) -> KFResult<ConstraintStatus> {
        if daughters.is_empty() {
            return Err(KFError::TooFewDaughters { count: 0 });
        }
        self.at_production_vertex = false;
        self.s_from_decay = 0.0;
        self.state = [0.0; 8];
        self.covariance = [0.0; 36];
        self.covariance[35] = 1.0;
        self.ndf = -3;
        self.chi2 = 0.0;
        self.charge = 0;
        for daughter in daughters {
            self.add_daughter(daughter);
        }
        let status = match mass {
            Some(mass) => self.set_mass_constraint(mass, 0.0),
            None => ConstraintStatus::Applied,
        };
        if let Some(vertex) = production_vertex {
            self.set_production_vertex(vertex);
        }
        Ok(status)
    }

    /// Build a new particle from `daughters`, sharing the field and settings of the first one.
    pub fn from_daughters(daughters: &[KFParticle]) -> KFResult<Self> {
        let first = daughters
            .first()
            .ok_or(KFError::TooFewDaughters { count: 0 })?;
        let mut particle = KFParticle::new(first.field_handle()).with_settings(first.settings);
        let _ = particle.construct(daughters, None, None)?;
        Ok(particle)
    }

    /// Constrain the invariant mass to `mass` with a resolution of `sigma` (zero for an exact
    /// constraint).
    ///
    /// The update is skipped, leaving the particle untouched, when the variance of the
    /// constraint vanishes.
    pub fn set_mass_constraint(&mut self, mass: f64, sigma: f64) -> ConstraintStatus {
        let [px, py, pz, e] = [self.state[3], self.state[4], self.state[5], self.state[6]];
        let h = [0.0, 0.0, 0.0, -2.0 * px, -2.0 * py, -2.0 * pz, 2.0 * e, 0.0];
        let zeta = mass * mass - (e * e - px * px - py * py - pz * pz);
        let mut cht = [0.0; 8];
        for (i, c) in cht.iter_mut().enumerate() {
            *c = (0..8).map(|j| self.covariance[ij(i, j)] * h[j]).sum();
        }
        let hcht: f64 = h.iter().zip(&cht).map(|(h, c)| h * c).sum();
        let s = 4.0 * mass * mass * sigma * sigma + hcht;
        if s < self.settings.singular_threshold {
            debug!(mass, sigma, variance = s, "mass constraint skipped");
            return ConstraintStatus::Skipped;
        }
        let inv = 1.0 / s;
        for i in 0..8 {
            let ki = cht[i] * inv;
            self.state[i] += ki * zeta;
            for j in 0..=i {
                self.covariance[ij(i, j)] -= ki * cht[j];
            }
        }
        self.chi2 += zeta * zeta * inv;
        self.ndf += 1;
        ConstraintStatus::Applied
    }

    /// Constrain the decay length to zero, for resonances which decay where they are produced.
    ///
    /// The flight parameter and its covariance are zeroed even when the constraint itself is
    /// skipped.
    pub fn set_no_decay_length(&mut self) -> ConstraintStatus {
        self.transport_to_decay_vertex();
        let zeta = -self.state[7];
        let s = self.covariance[35];
        let status = if s > self.settings.singular_threshold {
            let inv = 1.0 / s;
            self.chi2 += zeta * zeta * inv;
            self.ndf += 1;
            for i in 0..7 {
                let ki = self.covariance[28 + i] * inv;
                self.state[i] += ki * zeta;
                for j in 0..=i {
                    self.covariance[ij(i, j)] -= ki * self.covariance[28 + j];
                }
            }
            ConstraintStatus::Applied
        } else {
            debug!(variance = s, "decay length constraint skipped");
            ConstraintStatus::Skipped
        };
        self.state[7] = 0.0;
        self.covariance[28..36].fill(0.0);
        status
    }

    /// Attach this particle to the production vertex `vertex`.
    ///
    /// The particle's trajectory is pulled through the vertex, which fixes the flight
    /// parameter `s`; the parameters are then expressed at the decay vertex again. `chi2`
    /// grows by the distance of the trajectory from the vertex and `ndf` by two (three
    /// position equations less the new free decay length).
    ///
    /// A particle without decay-length freedom (zero variance of `s`, see
    /// [`KFParticle::set_no_decay_length`]) is moved to the vertex instead.
    pub fn set_production_vertex(&mut self, vertex: &KFParticle) {
        let m = vertex.xyz();
        let v = vertex.position_covariance();
        let no_s = self.covariance[35] <= 0.0;
        self.transport_to_decay_vertex();
        if no_s {
            self.state[7] = 0.0;
            self.covariance[28..36].fill(0.0);
        } else {
            self.transport_to_ds(self.ds_to_point(&m));
            self.state[7] = -self.s_from_decay;
            self.convert(true);
        }

        let threshold = self.settings.singular_threshold;
        let ai = invert_sym3(&self.position_covariance(), threshold).unwrap_or_else(|| {
            debug!("singular position covariance while attaching a production vertex");
            [0.0; 6]
        });
        let b: [[f64; 3]; 5] = std::array::from_fn(|r| {
            let row = [
                self.covariance[ij(3 + r, 0)],
                self.covariance[ij(3 + r, 1)],
                self.covariance[ij(3 + r, 2)],
            ];
            sym3_mul(&ai, &row)
        });

        let z: [f64; 3] = std::array::from_fn(|k| m[k] - self.state[k]);
        let av: [f64; 6] = std::array::from_fn(|k| self.covariance[k] - v[k]);
        if let Some(avi) = invert_sym3(&av, threshold) {
            self.chi2 += sym3_quadratic(&avi, &z).abs();
        }
        self.ndf += 2;

        self.state[..3].copy_from_slice(&m);
        for r in 0..5 {
            self.state[3 + r] += dot3(&b[r], &z);
        }

        self.covariance[..6].copy_from_slice(&v);
        for r in 0..5 {
            let row = 3 + r;
            let bv = sym3_mul(&v, &b[r]);
            let d: [f64; 3] = std::array::from_fn(|k| bv[k] - self.covariance[ij(row, k)]);
            for k in 0..3 {
                self.covariance[ij(row, k)] += d[k];
            }
            for j in 0..=r {
                self.covariance[ij(row, 3 + j)] += dot3(&d, &b[j]);
            }
        }

        if no_s {
            self.state[7] = 0.0;
            self.covariance[28..36].fill(0.0);
        } else {
            self.transport_to_ds(self.state[7]);
            self.convert(false);
        }
        self.s_from_decay = 0.0;
    }

    /// Remove this particle's contribution from a fitted vertex, the inverse of adding it.
    ///
    /// The vertex position moves away from this particle's trajectory, its covariance grows,
    /// `ndf` drops by two and `chi2` by the residual of this particle. A vertex linearized
    /// with a guess measures this particle at the guess, otherwise at the vertex position.
    /// Returns [`ConstraintStatus::Skipped`] without touching the vertex when the vertex
    /// covariance cannot be unfolded from the particle's.
    pub fn subtract_from_vertex(&self, vertex: &mut KFParticle) -> ConstraintStatus {
        let target = if vertex.is_linearized {
            vertex.vtx_guess
        } else {
            vertex.xyz()
        };
        let (m, mc) = self.measurement(&target);
        let cv = vertex.position_covariance();
        let difference: [f64; 6] = std::array::from_fn(|k| mc[k] - cv[k]);
        let Some(s) = invert_sym3(&difference, vertex.settings.singular_threshold) else {
            debug!(?target, "track subtraction skipped, covariance not separable");
            return ConstraintStatus::Skipped;
        };
        let zeta: [f64; 3] = std::array::from_fn(|k| m[k] - vertex.state[k]);
        let cht = [
            [cv[0], cv[1], cv[3]],
            [cv[1], cv[2], cv[4]],
            [cv[3], cv[4], cv[5]],
        ];
        let k: [[f64; 3]; 3] = std::array::from_fn(|i| sym3_mul(&s, &cht[i]));

        for i in 0..3 {
            vertex.state[i] -= dot3(&k[i], &zeta);
            for j in 0..=i {
                vertex.covariance[ij(i, j)] += dot3(&k[i], &cht[j]);
            }
        }
        let chi2 = vertex.chi2 - sym3_quadratic(&s, &zeta);
        if chi2 < 0.0 {
            debug!(chi2, "clamping negative chi2 after subtraction");
        }
        vertex.chi2 = chi2.max(0.0);
        vertex.ndf -= 2;
        ConstraintStatus::Applied
    }
}

impl_op_ex!(+= |a: &mut KFParticle, b: &KFParticle| { a.add_daughter(b); });
impl_op_ex!(-= |a: &mut KFParticle, b: &KFParticle| {
    let _ = b.subtract_from_vertex(a);
});
impl_op_ex!(+ |a: &KFParticle, b: &KFParticle| -> KFParticle {
    let mut mother = KFParticle::new(a.field_handle()).with_settings(a.settings);
    mother.add_daughter(a);
    mother.add_daughter(b);
    mother
});
impl_op_ex!(-|a: &KFParticle, b: &KFParticle| -> KFParticle {
    let mut vertex = a.clone();
    let _ = b.subtract_from_vertex(&mut vertex);
    vertex
});
