use tracing::{debug, trace};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{
    execution_context::ExecutionContext, particle::KFParticle, utils::enums::ConstraintStatus,
    KFError, KFResult,
};

/// A primary vertex together with the tracks which were kept in its fit.
#[derive(Clone, Debug)]
pub struct PrimaryVertex {
    /// The fitted vertex. Its momentum is the sum of the used tracks and carries no meaning.
    pub vertex: KFParticle,
    /// For each input track, whether it contributes to [`PrimaryVertex::vertex`].
    pub used: Vec<bool>,
}

impl PrimaryVertex {
    /// The number of tracks kept in the fit.
    pub fn n_used(&self) -> usize {
        self.used.iter().filter(|&&u| u).count()
    }
}

/// Fit a primary vertex to `tracks` and iteratively reject outliers.
///
/// While more than two tracks remain, the track with the largest deviation from the vertex
/// refitted without it is removed if that deviation exceeds `chi_cut`. The survivors are then
/// refitted around the current vertex. If only two tracks are left and the fit quality is
/// still worse than `chi_cut² · ndf`, no vertex is found: every track is marked unused and the
/// vertex is left empty (`ndf == -3`).
pub fn construct_primary_vertex(tracks: &[KFParticle], chi_cut: f64) -> KFResult<PrimaryVertex> {
    if tracks.len() < 2 {
        return Err(KFError::TooFewDaughters {
            count: tracks.len(),
        });
    }
    let mut vertex = KFParticle::new(tracks[0].field_handle()).with_settings(tracks[0].settings);
    let _ = vertex.construct(tracks, None, None)?;
    vertex.set_vtx_guess(vertex.vtx_guess);

    let mut used = vec![true; tracks.len()];
    let mut n_rest = tracks.len();
    while n_rest > 2 {
        let mut worst: Option<(usize, f64)> = None;
        for (i, track) in tracks.iter().enumerate().filter(|(i, _)| used[*i]) {
            let without = &vertex - track;
            let chi = track.deviation_from_fitted_vertex(&without);
            trace!(track = i, chi, "primary vertex track deviation");
            if worst.map_or(true, |(_, worst_chi)| worst_chi < chi) {
                worst = Some((i, chi));
            }
        }
        let Some((index, chi)) = worst else {
            break;
        };
        if chi < chi_cut {
            break;
        }
        debug!(track = index, chi, "removing primary vertex outlier");
        used[index] = false;
        n_rest -= 1;
        // the survivors are refitted below, so a failed subtraction only ends the search
        if tracks[index].subtract_from_vertex(&mut vertex) == ConstraintStatus::Skipped {
            break;
        }
    }

    if n_rest >= 2 {
        vertex.set_vtx_guess(vertex.xyz());
        let survivors: Vec<KFParticle> = tracks
            .iter()
            .zip(&used)
            .filter(|(_, &u)| u)
            .map(|(t, _)| t.clone())
            .collect();
        let _ = vertex.construct(&survivors, None, None)?;
    }
    if n_rest <= 2 && vertex.chi2 > chi_cut * chi_cut * vertex.ndf as f64 {
        debug!(chi2 = vertex.chi2, ndf = vertex.ndf, "no primary vertex found");
        used.fill(false);
        vertex.ndf = -3;
        vertex.chi2 = 0.0;
    }
    Ok(PrimaryVertex { vertex, used })
}

/// Fit one candidate decay per entry of `candidates`, optionally constraining each to a mass
/// hypothesis `(mass, sigma)`.
///
/// Candidates are independent, so they are distributed over threads according to the
/// [`ExecutionContext`]. Each result keeps the field and settings of its first daughter.
pub fn fit_candidates(
    ctx: &ExecutionContext,
    candidates: &[Vec<KFParticle>],
    mass: Option<(f64, f64)>,
) -> KFResult<Vec<KFParticle>> {
    let fit = |(index, daughters): (usize, &Vec<KFParticle>)| -> KFResult<KFParticle> {
        let mut mother = KFParticle::from_daughters(daughters)?;
        if let Some((mass, sigma)) = mass {
            if mother.set_mass_constraint(mass, sigma) == ConstraintStatus::Skipped {
                debug!(candidate = index, "candidate left without mass constraint");
            }
        }
        Ok(mother)
    };
    #[cfg(feature = "rayon")]
    {
        if ctx.is_parallel() {
            return ctx.install(|| candidates.par_iter().enumerate().map(fit).collect());
        }
    }
    ctx.install(|| candidates.iter().enumerate().map(fit).collect())
}
