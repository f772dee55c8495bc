use std::{fmt::Debug, sync::Arc};

/// Conversion factor from `kGauss * cm` to `GeV/c`: a particle of unit charge in a field of
/// `B` kGauss bends with curvature `C_LIGHT * B / p` per centimeter.
pub const C_LIGHT: f64 = 0.000299792458;

/// A shared handle to a field provider. Every [`KFParticle`](crate::KFParticle) holds one.
pub type FieldHandle = Arc<dyn MagneticField>;

/// The trajectory model used to propagate particles through a [`MagneticField`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Propagation {
    /// Straight lines, no field.
    Line,
    /// Exact helices in a homogeneous field along `z` with the given strength in kGauss.
    Bz(f64),
    /// Second-order trajectories through an arbitrary, slowly varying field which is sampled
    /// along the path.
    General,
}

/// A source of magnetic field values.
///
/// The provider is shared between all particles of a fit (and across threads when fitting in
/// parallel), so it must be safe for concurrent reads. Field values are in kGauss and
/// positions in cm.
pub trait MagneticField: Debug + Send + Sync {
    /// The field vector `(Bx, By, Bz)` at the given point.
    fn field_value(&self, xyz: &[f64; 3]) -> [f64; 3];
    /// The trajectory model appropriate for this field. The default samples the field along
    /// the path, which is valid for any provider.
    fn propagation(&self) -> Propagation {
        Propagation::General
    }
}

/// A region without magnetic field, where particles travel along straight lines.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ZeroField;

impl MagneticField for ZeroField {
    fn field_value(&self, _xyz: &[f64; 3]) -> [f64; 3] {
        [0.0; 3]
    }
    fn propagation(&self) -> Propagation {
        Propagation::Line
    }
}

/// A homogeneous solenoidal field along `z`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UniformField {
    /// Field strength in kGauss.
    pub bz: f64,
}

impl UniformField {
    /// Construct a [`UniformField`] with the given strength in kGauss.
    pub fn new(bz: f64) -> Self {
        Self { bz }
    }
}

impl MagneticField for UniformField {
    fn field_value(&self, _xyz: &[f64; 3]) -> [f64; 3] {
        [0.0, 0.0, self.bz]
    }
    fn propagation(&self) -> Propagation {
        Propagation::Bz(self.bz)
    }
}

/// An arbitrary field map given as a closure from position to field vector.
///
/// ```
/// use kfparticle::FieldMap;
///
/// // a dipole which falls off along z
/// let map = FieldMap::new(|xyz: &[f64; 3]| [0.0, 10.0 / (1.0 + 1e-4 * xyz[2] * xyz[2]), 0.0]);
/// ```
#[derive(Clone)]
pub struct FieldMap<F> {
    map: F,
}

impl<F> FieldMap<F>
where
    F: Fn(&[f64; 3]) -> [f64; 3] + Send + Sync,
{
    /// Wrap a closure as a [`MagneticField`].
    pub fn new(map: F) -> Self {
        Self { map }
    }
}

impl<F> Debug for FieldMap<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldMap").finish_non_exhaustive()
    }
}

impl<F> MagneticField for FieldMap<F>
where
    F: Fn(&[f64; 3]) -> [f64; 3] + Send + Sync,
{
    fn field_value(&self, xyz: &[f64; 3]) -> [f64; 3] {
        (self.map)(xyz)
    }
}
