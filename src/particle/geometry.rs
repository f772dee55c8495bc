use tracing::trace;

use crate::{
    field::{Propagation, C_LIGHT},
    transport::{transport_bz, Propagated},
    utils::{ij, invert_sym3, sym3_quadratic},
};

use super::KFParticle;

/// Path length to the point of the transverse trajectory closest to `point`, for a particle
/// bending with curvature `bq` (zero for a straight line).
fn transverse_ds(state: &[f64; 8], bq: f64, point: [f64; 2]) -> f64 {
    let [px, py] = [state[3], state[4]];
    let pt2 = px * px + py * py;
    if pt2 < 1e-4 {
        return 0.0;
    }
    let dx = point[0] - state[0];
    let dy = point[1] - state[1];
    let a = dx * px + dy * py;
    if bq.abs() < 1e-8 {
        a / pt2
    } else {
        (bq * a).atan2(pt2 + bq * (dy * px - dx * py)) / bq
    }
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn distance2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let d = [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
    dot(&d, &d)
}

/// The transverse circle `(center, radius)` of a charged particle, or [`None`] if it travels
/// along a straight line in the transverse plane.
fn circle(state: &[f64; 8], bq: f64) -> Option<([f64; 2], f64)> {
    let pt2 = state[3] * state[3] + state[4] * state[4];
    if bq.abs() < 1e-8 || pt2 < 1e-4 {
        return None;
    }
    Some((
        [state[0] + state[4] / bq, state[1] - state[3] / bq],
        pt2.sqrt() / bq.abs(),
    ))
}

/// Transverse points at which two circles meet, or the midpoint of their closest points if
/// they do not.
fn circle_circle(c1: [f64; 2], r1: f64, c2: [f64; 2], r2: f64) -> Vec<[f64; 2]> {
    let delta = [c2[0] - c1[0], c2[1] - c1[1]];
    let d = (delta[0] * delta[0] + delta[1] * delta[1]).sqrt();
    if d < 1e-8 {
        // concentric, every direction is equally close
        return vec![[c1[0] + r1, c1[1]]];
    }
    let e = [delta[0] / d, delta[1] / d];
    let offsets = if d > r1 + r2 {
        Some((r1, -r2))
    } else if d < (r1 - r2).abs() {
        let sign = if r1 > r2 { 1.0 } else { -1.0 };
        Some((sign * r1, sign * r2))
    } else {
        None
    };
    if let Some((s1, s2)) = offsets {
        return vec![[
            0.5 * (c1[0] + c2[0] + (s1 + s2) * e[0]),
            0.5 * (c1[1] + c2[1] + (s1 + s2) * e[1]),
        ]];
    }
    let a = (d * d + r1 * r1 - r2 * r2) / (2.0 * d);
    let h = (r1 * r1 - a * a).max(0.0).sqrt();
    let base = [c1[0] + a * e[0], c1[1] + a * e[1]];
    vec![
        [base[0] - h * e[1], base[1] + h * e[0]],
        [base[0] + h * e[1], base[1] - h * e[0]],
    ]
}

/// Transverse points at which a straight track crosses a circle, or its point of closest
/// approach to the circle's center if it misses.
fn line_circle(state: &[f64; 8], center: [f64; 2], radius: f64) -> Vec<[f64; 2]> {
    let origin = [state[0], state[1]];
    let u = [state[3], state[4]];
    let uu = u[0] * u[0] + u[1] * u[1];
    if uu < 1e-4 {
        return vec![origin];
    }
    let w = [origin[0] - center[0], origin[1] - center[1]];
    let half_b = u[0] * w[0] + u[1] * w[1];
    let c = w[0] * w[0] + w[1] * w[1] - radius * radius;
    let discriminant = half_b * half_b - uu * c;
    let roots = if discriminant >= 0.0 {
        let root = discriminant.sqrt();
        vec![(-half_b - root) / uu, (-half_b + root) / uu]
    } else {
        vec![-half_b / uu]
    };
    roots
        .into_iter()
        .map(|t| [origin[0] + u[0] * t, origin[1] + u[1] * t])
        .collect()
}

impl KFParticle {
    fn bq(&self, bz: f64) -> f64 {
        bz * self.charge as f64 * C_LIGHT
    }

    /// Parameters after moving by `ds` on the helix of a homogeneous field `bz`, without the
    /// covariance.
    fn helix_state(&self, bz: f64, ds: f64) -> [f64; 8] {
        transport_bz(&self.state, &[0.0; 36], self.charge, bz, ds).0
    }

    /// The path length to the point of the trajectory closest to `xyz`.
    ///
    /// Homogeneous fields use the exact helix solution in the transverse plane; general maps
    /// use it with the local `z` component of the field.
    pub fn ds_to_point(&self, xyz: &[f64; 3]) -> f64 {
        match self.field.propagation() {
            Propagation::Line => self.ds_to_point_line(xyz),
            Propagation::Bz(bz) => self.ds_to_point_bz(bz, xyz),
            Propagation::General => {
                let bz = self.field.field_value(&self.xyz())[2];
                self.ds_to_point_bz(bz, xyz)
            }
        }
    }

    /// The path length to the point of a straight trajectory closest to `xyz`.
    pub fn ds_to_point_line(&self, xyz: &[f64; 3]) -> f64 {
        let p = [self.state[3], self.state[4], self.state[5]];
        let mut p2 = dot(&p, &p);
        if p2 < 1e-4 {
            p2 = 1.0;
        }
        let d = [
            xyz[0] - self.state[0],
            xyz[1] - self.state[1],
            xyz[2] - self.state[2],
        ];
        dot(&p, &d) / p2
    }

    /// The path length to the point of a helix in a homogeneous field of `bz` kGauss closest
    /// to `xyz` in the transverse plane.
    pub fn ds_to_point_bz(&self, bz: f64, xyz: &[f64; 3]) -> f64 {
        transverse_ds(&self.state, self.bq(bz), [xyz[0], xyz[1]])
    }

    /// Path lengths `(ds, ds_other)` which bring this particle and `other` to their points of
    /// closest approach.
    pub fn ds_to_particle(&self, other: &KFParticle) -> (f64, f64) {
        match self.field.propagation() {
            Propagation::Line => self.ds_to_particle_line(other),
            Propagation::Bz(bz) => self.ds_to_particle_bz(bz, other),
            Propagation::General => {
                let midpoint = [
                    0.5 * (self.state[0] + other.state[0]),
                    0.5 * (self.state[1] + other.state[1]),
                    0.5 * (self.state[2] + other.state[2]),
                ];
                let bz = self.field.field_value(&midpoint)[2];
                self.ds_to_particle_bz(bz, other)
            }
        }
    }

    /// Closest approach of two straight lines.
    ///
    /// Parallel lines have no unique solution; this particle then stays where it is and
    /// `other` moves to the point closest to it.
    pub fn ds_to_particle_line(&self, other: &KFParticle) -> (f64, f64) {
        let p1 = [self.state[3], self.state[4], self.state[5]];
        let p2 = [other.state[3], other.state[4], other.state[5]];
        let dr = [
            other.state[0] - self.state[0],
            other.state[1] - self.state[1],
            other.state[2] - self.state[2],
        ];
        let p12 = dot(&p1, &p1);
        let p22 = dot(&p2, &p2);
        let p1p2 = dot(&p1, &p2);
        let drp1 = dot(&p1, &dr);
        let drp2 = dot(&p2, &dr);
        let detp = p1p2 * p1p2 - p12 * p22;
        if detp.abs() < 1e-4 * (p12 * p22).max(1e-8) {
            let ds1 = if p22 > 1e-8 { -drp2 / p22 } else { 0.0 };
            return (0.0, ds1);
        }
        (
            (drp2 * p1p2 - drp1 * p22) / detp,
            (drp2 * p12 - drp1 * p1p2) / detp,
        )
    }

    /// Closest approach of two helices in a homogeneous field of `bz` kGauss.
    ///
    /// The transverse projections are intersected exactly (circle with circle, or circle with
    /// line for a neutral particle), the candidate pair with the smallest 3-D separation is
    /// kept, and a final linear step along both trajectories resolves the longitudinal
    /// separation.
    pub fn ds_to_particle_bz(&self, bz: f64, other: &KFParticle) -> (f64, f64) {
        let bq1 = self.bq(bz);
        let bq2 = other.bq(bz);
        let candidates = match (circle(&self.state, bq1), circle(&other.state, bq2)) {
            (None, None) => return self.ds_to_particle_line(other),
            (Some((c1, r1)), Some((c2, r2))) => circle_circle(c1, r1, c2, r2),
            (Some((c1, r1)), None) => line_circle(&other.state, c1, r1),
            (None, Some((c2, r2))) => line_circle(&self.state, c2, r2),
        };

        let mut best: Option<(f64, f64, f64)> = None;
        for point in candidates {
            let ds = transverse_ds(&self.state, bq1, point);
            let ds1 = transverse_ds(&other.state, bq2, point);
            let a = self.helix_state(bz, ds);
            let b = other.helix_state(bz, ds1);
            let d2 = distance2(&[a[0], a[1], a[2]], &[b[0], b[1], b[2]]);
            let better = match best {
                None => true,
                Some((best_ds, best_ds1, best_d2)) => {
                    if (d2 - best_d2).abs() <= 1e-12 * d2.max(best_d2).max(1e-12) {
                        ds.abs() + ds1.abs() < best_ds.abs() + best_ds1.abs()
                    } else {
                        d2 < best_d2
                    }
                }
            };
            if better {
                best = Some((ds, ds1, d2));
            }
        }
        let Some((ds, ds1, _)) = best else {
            return (0.0, 0.0);
        };

        let a = self.helix_state(bz, ds);
        let b = other.helix_state(bz, ds1);
        let p = [a[3], a[4], a[5]];
        let p1 = [b[3], b[4], b[5]];
        let d = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
        let pp2 = dot(&p, &p);
        let pp21 = dot(&p1, &p1);
        let a_ = dot(&p, &p1);
        let b_ = dot(&d, &p1);
        let c_ = dot(&d, &p);
        let det = pp2 * pp21 - a_ * a_;
        if det.abs() > 1e-8 {
            (
                ds + (pp21 * c_ - a_ * b_) / det,
                ds1 + (a_ * c_ - pp2 * b_) / det,
            )
        } else {
            (ds, ds1)
        }
    }

    /// This particle transported to the point of its trajectory closest to `xyz`, with the
    /// position and momentum covariance inflated by the uncertainty of the path length to the
    /// true vertex.
    pub fn measurement(&self, xyz: &[f64; 3]) -> Propagated {
        let (m, mut v) = self.transported(self.ds_to_point(xyz));
        let d = [xyz[0] - m[0], xyz[1] - m[1], xyz[2] - m[2]];
        let p = [m[3], m[4], m[5]];
        let sigma_s = self.settings.path_sigma(dot(&d, &d), dot(&p, &p));

        let q = self.charge as f64;
        let b = self.field.field_value(xyz).map(|v| v * C_LIGHT);
        let mut h = [0.0; 6];
        h[0] = m[3] * sigma_s;
        h[1] = m[4] * sigma_s;
        h[2] = m[5] * sigma_s;
        h[3] = (h[1] * b[2] - h[2] * b[1]) * q;
        h[4] = (h[2] * b[0] - h[0] * b[2]) * q;
        h[5] = (h[0] * b[1] - h[1] * b[0]) * q;
        for i in 0..6 {
            for j in 0..=i {
                v[ij(i, j)] += h[i] * h[j];
            }
        }
        (m, v)
    }

    /// Euclidean distance between `xyz` and the closest point of the trajectory.
    pub fn distance_from_vertex(&self, xyz: &[f64; 3]) -> f64 {
        let (m, _) = self.transported(self.ds_to_point(xyz));
        distance2(&[m[0], m[1], m[2]], xyz).sqrt()
    }

    /// Distance between `xyz` and the trajectory in units of the combined uncertainty of the
    /// particle (inflated as in [`KFParticle::measurement`]) and, if given, the vertex
    /// covariance `[xx, xy, yy, xz, yz, zz]`.
    ///
    /// A singular combined covariance gives zero.
    pub fn deviation_from_vertex(&self, xyz: &[f64; 3], covariance: Option<&[f64; 6]>) -> f64 {
        let (m, v) = self.measurement(xyz);
        let d = [xyz[0] - m[0], xyz[1] - m[1], xyz[2] - m[2]];
        let mut s = [0.0; 6];
        s.copy_from_slice(&v[..6]);
        if let Some(c) = covariance {
            s.iter_mut().zip(c).for_each(|(s, c)| *s += c);
        }
        let si = invert_sym3(&s, self.settings.singular_threshold).unwrap_or_else(|| {
            trace!(?xyz, "singular covariance in vertex deviation");
            [0.0; 6]
        });
        (0.5 * sym3_quadratic(&si, &d)).abs().sqrt()
    }

    /// [`KFParticle::deviation_from_vertex`] for a fitted vertex, using its position
    /// covariance.
    pub fn deviation_from_fitted_vertex(&self, vertex: &KFParticle) -> f64 {
        self.deviation_from_vertex(&vertex.xyz(), Some(&vertex.position_covariance()))
    }

    /// Euclidean distance between the points of closest approach of two particles.
    pub fn distance_from_particle(&self, other: &KFParticle) -> f64 {
        let (ds, ds1) = self.ds_to_particle(other);
        let (a, _) = self.transported(ds);
        let (b, _) = other.transported(ds1);
        distance2(&[a[0], a[1], a[2]], &[b[0], b[1], b[2]]).sqrt()
    }

    /// Separation of two particles at their closest approach in units of their combined
    /// uncertainty.
    pub fn deviation_from_particle(&self, other: &KFParticle) -> f64 {
        let (_, ds1) = self.ds_to_particle(other);
        let (m, mut v) = other.transported(ds1);
        let d = [
            self.state[0] - m[0],
            self.state[1] - m[1],
            self.state[2] - m[2],
        ];
        let p = [m[3], m[4], m[5]];
        let sigma_s = other.settings.path_sigma(dot(&d, &d), dot(&p, &p));
        let h = p.map(|v| v * sigma_s);
        for i in 0..3 {
            for j in 0..=i {
                v[ij(i, j)] += h[i] * h[j];
            }
        }
        let mut position_covariance = [0.0; 6];
        position_covariance.copy_from_slice(&v[..6]);
        let xyz = [m[0], m[1], m[2]];
        2.0_f64.sqrt() * self.deviation_from_vertex(&xyz, Some(&position_covariance))
    }
}
