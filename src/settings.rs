use serde::{Deserialize, Serialize};

/// Tunable constants of the vertex fit.
///
/// None of these are physical constants. The defaults reproduce the standard behavior of the
/// KF-particle formalism and should only be changed when tuning against a specific detector.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSettings {
    /// Linearization passes of a vertex fit when a vertex guess was supplied with
    /// [`KFParticle::set_vtx_guess`](crate::KFParticle::set_vtx_guess).
    pub linearized_iterations: usize,
    /// Linearization passes of a vertex fit without a supplied guess. All passes but the last
    /// only refine the guess.
    pub unlinearized_iterations: usize,
    /// Constant term of the path-length uncertainty (in cm) used to inflate a track measurement
    /// transported to an approximate vertex.
    pub path_sigma_offset: f64,
    /// Scale of the distance-dependent term of the path-length uncertainty.
    pub path_sigma_scale: f64,
    /// Determinants and constraint variances at or below this value are treated as singular.
    pub singular_threshold: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            linearized_iterations: 1,
            unlinearized_iterations: 3,
            path_sigma_offset: 0.1,
            path_sigma_scale: 10.0,
            singular_threshold: 1e-20,
        }
    }
}

impl FitSettings {
    /// The number of linearization passes for a fit with or without a vertex guess.
    pub fn iterations(&self, linearized: bool) -> usize {
        let n = if linearized {
            self.linearized_iterations
        } else {
            self.unlinearized_iterations
        };
        n.max(1)
    }

    /// Path-length uncertainty (in units of cm/(GeV/c)) for a track which was transported to
    /// the point of closest approach, a squared distance `dr2` away from the target point, with
    /// squared momentum `p2`.
    pub fn path_sigma(&self, dr2: f64, p2: f64) -> f64 {
        if p2 <= self.singular_threshold {
            return self.path_sigma_offset;
        }
        self.path_sigma_offset + self.path_sigma_scale * (dr2 / p2).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_iterations() {
        let settings = FitSettings::default();
        assert_eq!(settings.iterations(true), 1);
        assert_eq!(settings.iterations(false), 3);
        let zero = FitSettings {
            linearized_iterations: 0,
            ..Default::default()
        };
        assert_eq!(zero.iterations(true), 1);
    }

    #[test]
    fn test_path_sigma() {
        let settings = FitSettings::default();
        assert_relative_eq!(settings.path_sigma(0.0, 1.0), 0.1);
        assert_relative_eq!(settings.path_sigma(4.0, 1.0), 20.1);
        assert_relative_eq!(settings.path_sigma(4.0, 4.0), 10.1);
        assert_relative_eq!(settings.path_sigma(4.0, 0.0), 0.1);
    }
}
