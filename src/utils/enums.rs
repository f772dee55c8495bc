use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::KFError;

/// The point along its trajectory at which a particle's parameters are expressed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Representation {
    /// Parameters (and covariance) describe the particle at its decay vertex.
    DecayVertex,
    /// Parameters (and covariance) describe the particle at its production vertex.
    ProductionVertex,
}
impl Display for Representation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Representation::DecayVertex => write!(f, "Decay Vertex"),
            Representation::ProductionVertex => write!(f, "Production Vertex"),
        }
    }
}
impl FromStr for Representation {
    type Err = KFError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "decay" | "decay vertex" | "decay-vertex" | "decayvertex" => Ok(Self::DecayVertex),
            "production" | "production vertex" | "production-vertex" | "productionvertex"
            | "prod" => Ok(Self::ProductionVertex),
            _ => Err(KFError::ParseError {
                name: s.to_string(),
                object: "Representation".to_string(),
            }),
        }
    }
}

/// Outcome of a scalar constraint or of removing a track from a vertex.
///
/// A constraint whose variance denominator is degenerate leaves the particle untouched and
/// reports [`ConstraintStatus::Skipped`].
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintStatus {
    /// The update was applied to the state, covariance, `chi2` and `ndf`.
    Applied,
    /// The update was numerically degenerate and nothing was changed.
    Skipped,
}
impl ConstraintStatus {
    /// Returns `true` for [`ConstraintStatus::Applied`].
    pub fn is_applied(&self) -> bool {
        matches!(self, ConstraintStatus::Applied)
    }
}
impl Display for ConstraintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintStatus::Applied => write!(f, "applied"),
            ConstraintStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_displays() {
        assert_eq!(format!("{}", Representation::DecayVertex), "Decay Vertex");
        assert_eq!(
            format!("{}", Representation::ProductionVertex),
            "Production Vertex"
        );
        assert_eq!(format!("{}", ConstraintStatus::Applied), "applied");
        assert_eq!(format!("{}", ConstraintStatus::Skipped), "skipped");
    }

    #[test]
    fn enum_from_str() {
        assert_eq!(
            Representation::from_str("Decay").unwrap(),
            Representation::DecayVertex
        );
        assert_eq!(
            Representation::from_str("decay-vertex").unwrap(),
            Representation::DecayVertex
        );
        assert_eq!(
            Representation::from_str("PROD").unwrap(),
            Representation::ProductionVertex
        );
        assert_eq!(
            Representation::from_str("Production Vertex").unwrap(),
            Representation::ProductionVertex
        );
        assert!(matches!(
            Representation::from_str("primary"),
            Err(KFError::ParseError { .. })
        ));
    }
}
