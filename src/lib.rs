//! # kfparticle
//!
//! `kfparticle` reconstructs decays of short-lived particles with a Kalman filter. Every
//! particle carries an eight-component state `[x, y, z, px, py, pz, E, s]` together with its
//! symmetric covariance, where `s` is the decay length divided by the momentum. Particles can
//! be transported along their trajectory in a magnetic field, combined into mother particles
//! at a common vertex, constrained to a mass or a production vertex, and queried for derived
//! quantities with propagated uncertainties.
//!
//! Units are centimeters, GeV and kilogauss throughout.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use kfparticle::{diagonal_covariance, FieldHandle, KFParticle, UniformField};
//!
//! let field: FieldHandle = Arc::new(UniformField::new(5.0));
//! let covariance = diagonal_covariance([1e-2, 1e-2, 1e-2, 1e-3, 1e-3, 1e-3]);
//! let pi_plus = KFParticle::from_track(
//!     [1.0, 0.5, 0.2, 0.4, 0.3, 0.1],
//!     covariance,
//!     1,
//!     0.13957,
//!     field.clone(),
//! );
//! let pi_minus = KFParticle::from_track(
//!     [1.0, 0.5, 0.2, 0.2, 0.5, 0.2],
//!     covariance,
//!     -1,
//!     0.13957,
//!     field.clone(),
//! );
//!
//! let mut kaon = KFParticle::from_daughters(&[pi_plus, pi_minus])?;
//! println!("mass = {}", kaon.mass()?);
//!
//! let primary = KFParticle::vertex([0.0; 3], [1e-4, 0.0, 1e-4, 0.0, 0.0, 1e-4], 0.0, 0, field);
//! kaon.set_production_vertex(&primary);
//! println!("decay length = {}", kaon.decay_length()?);
//! # Ok::<(), kfparticle::KFError>(())
//! ```
//!
//! # Magnetic fields
//!
//! Fields are supplied through the [`MagneticField`] trait and shared between particles as a
//! [`FieldHandle`]. [`ZeroField`] propagates along straight lines, [`UniformField`] along
//! exact helices around the `z` axis, and any other field (for instance a [`FieldMap`]) with
//! a second-order expansion of the equations of motion.
//!
//! # Batches
//!
//! Independent candidates can be fitted in parallel with [`fit_candidates`] under an
//! [`ExecutionContext`], and primary vertices are found with [`construct_primary_vertex`].
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// Thread policies for batch fits.
pub mod execution_context;
/// Magnetic field providers.
pub mod field;
/// The [`KFParticle`] state, its fits and its derived quantities.
pub mod particle;
/// Tunable fit parameters.
pub mod settings;
/// Propagation of particle states along their trajectory.
pub mod transport;
/// Packed covariance helpers, enums and momentum traits.
pub mod utils;
/// Primary vertex finding and batch fitting of candidates.
pub mod vertex;

/// Useful traits for all crate structs
pub mod traits {
    pub use crate::field::MagneticField;
    pub use crate::utils::vectors::{FourMomentum, ThreeMomentum};
}

pub use crate::execution_context::{ExecutionContext, ThreadPolicy};
pub use crate::field::{
    FieldHandle, FieldMap, MagneticField, Propagation, UniformField, ZeroField, C_LIGHT,
};
pub use crate::particle::{
    diagonal_covariance, KFParticle, Measurement, ParticleRecord, UNDEFINED_ERROR,
};
pub use crate::settings::FitSettings;
pub use crate::utils::enums::{ConstraintStatus, Representation};
pub use crate::vertex::{construct_primary_vertex, fit_candidates, PrimaryVertex};

/// A [`Result`] type alias for [`KFError`]s.
pub type KFResult<T> = Result<T, KFError>;

/// The error type used by all `kfparticle` internal methods
#[derive(Error, Debug)]
pub enum KFError {
    /// A derived quantity whose defining denominator vanishes, such as the azimuth of a
    /// particle without transverse momentum.
    #[error("The {quantity} is undefined (value {value})!")]
    Degenerate {
        /// The name of the quantity
        quantity: &'static str,
        /// The best available estimate of the quantity
        value: f64,
    },
    /// A mass was requested for a state with `E² - p² <= 0`.
    #[error("Unphysical mass: m² = {mass_squared}")]
    UnphysicalMass {
        /// The squared mass computed from the state
        mass_squared: f64,
    },
    /// Error propagation produced a variance more negative than round-off can account for,
    /// which means the covariance is no longer positive semi-definite.
    #[error("Negative variance {variance} for the {quantity} (value {value})")]
    NegativeVariance {
        /// The name of the quantity
        quantity: &'static str,
        /// The value of the quantity, which is still meaningful
        value: f64,
        /// The variance computed for the quantity
        variance: f64,
    },
    /// A fit was requested with too few input particles.
    #[error("Too few daughters for a fit: {count}")]
    TooFewDaughters {
        /// The number of particles which were supplied
        count: usize,
    },
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// An error returned when an [`ExecutionContext`] cannot be built.
    #[error("Invalid execution context: {reason}")]
    ExecutionContextError {
        /// A description of the problem
        reason: String,
    },
    /// An error returned by the Rust thread pool constructor
    #[cfg(feature = "rayon")]
    #[error("Error building thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
}

impl KFError {
    /// The [`Measurement`] to report when a derived quantity could not be computed: the best
    /// available value with [`UNDEFINED_ERROR`] as its uncertainty.
    pub fn fallback(&self) -> Measurement {
        match self {
            KFError::Degenerate { value, .. } | KFError::NegativeVariance { value, .. } => {
                Measurement::undefined(*value)
            }
            _ => Measurement::undefined(0.0),
        }
    }
}
