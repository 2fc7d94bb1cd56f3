//! Configuration (component B): inversion mode, truncation, step-length
//! schedule, A-projection flag, log path.

use serde::{Deserialize, Serialize};

use crate::error::IesError;

/// ==============================================================================================
/// ================================ Inversion Mode & Truncation =================================
/// ==============================================================================================

/// The four W-update equations (component E). Dispatched with a single
/// `match` in the orchestrator; never behind a trait object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IesInversion {
    Exact,
    SubspaceExactR,
    SubspaceEeR,
    SubspaceRe,
}

impl IesInversion {
    pub fn from_key(v: i64) -> Result<Self, IesError> {
        match v {
            0 => Ok(Self::Exact),
            1 => Ok(Self::SubspaceExactR),
            2 => Ok(Self::SubspaceEeR),
            3 => Ok(Self::SubspaceRe),
            other => Err(IesError::config(format!(
                "IES_INVERSION: unknown inversion tag {other}"
            ))),
        }
    }

    pub fn to_key(self) -> i64 {
        match self {
            Self::Exact => 0,
            Self::SubspaceExactR => 1,
            Self::SubspaceEeR => 2,
            Self::SubspaceRe => 3,
        }
    }
}

/// The three subspace variants of [`IesInversion`], with the already-handled
/// `Exact` branch unrepresentable rather than merely asserted unreachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubspaceInversion {
    ExactR,
    EeR,
    Re,
}

impl TryFrom<IesInversion> for SubspaceInversion {
    type Error = IesError;

    fn try_from(mode: IesInversion) -> Result<Self, Self::Error> {
        match mode {
            IesInversion::Exact => Err(IesError::config(
                "SubspaceInversion: EXACT is handled by a separate code path and never reaches the subspace dispatcher",
            )),
            IesInversion::SubspaceExactR => Ok(Self::ExactR),
            IesInversion::SubspaceEeR => Ok(Self::EeR),
            IesInversion::SubspaceRe => Ok(Self::Re),
        }
    }
}

/// SVD truncation: either an energy fraction in `(0, 1]` or an integer
/// subspace dimension `>= 1`. Tagged explicitly so querying the "other"
/// branch returns a sentinel instead of silently converting.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Truncation {
    Fraction(f64),
    Dimension(usize),
}

/// Sentinel returned by `Config::truncation_dimension`/`truncation_fraction`
/// when the wrong branch of the tagged value is queried.
pub const TRUNCATION_SENTINEL_INT: i64 = -1;
pub const TRUNCATION_SENTINEL_DOUBLE: f64 = -1.0;

impl Truncation {
    pub fn fraction(f: f64) -> Result<Self, IesError> {
        if f > 0.0 && f <= 1.0 {
            Ok(Self::Fraction(f))
        } else {
            Err(IesError::config(format!(
                "ENKF_TRUNCATION: fraction must be in (0, 1], got {f}"
            )))
        }
    }

    pub fn dimension(k: usize) -> Result<Self, IesError> {
        if k >= 1 {
            Ok(Self::Dimension(k))
        } else {
            Err(IesError::config(
                "ENKF_SUBSPACE_DIMENSION: dimension must be >= 1",
            ))
        }
    }

    /// Number of leading singular values to retain, given the full
    /// (non-increasing) singular-value spectrum.
    ///
    /// Fraction: retain the smallest leading count whose cumulative
    /// squared-energy ratio is `>=` the fraction (floor of the threshold,
    /// i.e. never retain fewer than needed to cross it). Dimension: retain
    /// exactly `min(k, rank)`.
    pub fn rank(&self, singular_values: &[f64]) -> usize {
        let rank = singular_values.iter().filter(|s| **s > 0.0).count();
        match self {
            Truncation::Dimension(k) => (*k).min(rank),
            Truncation::Fraction(f) => {
                if rank == 0 {
                    return 0;
                }
                let total: f64 = singular_values[..rank].iter().map(|s| s * s).sum();
                if total <= 0.0 {
                    return rank;
                }
                let mut cum = 0.0;
                for (i, s) in singular_values[..rank].iter().enumerate() {
                    cum += s * s;
                    if cum / total >= *f {
                        return i + 1;
                    }
                }
                rank
            }
        }
    }
}

/// Holds inversion mode, truncation, step-length schedule, A-projection
/// flag, and an optional log path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub inversion: IesInversion,   // which of the four W-update equations to run
    pub truncation: Truncation,    // SVD rank/energy cutoff, fraction or dimension
    steplength_max: f64,           // gamma_max
    steplength_min: f64,           // gamma_min, also the schedule's limit as iter -> inf
    steplength_decay: f64,         // decay base in the steplength formula
    pub use_projection: bool,      // IES_AAPROJECTION
    pub log_path: Option<String>,  // IES_LOGFILE, mirrored in Module's FileLogSink
    /// `IES_DEBUG`: accepted, has no effect, logs a warning once per call.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inversion: IesInversion::SubspaceExactR,
            truncation: Truncation::Fraction(0.99),
            steplength_max: 0.6,
            steplength_min: 0.3,
            steplength_decay: 2.5,
            use_projection: false,
            log_path: None,
            debug: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steplength_max(&self) -> f64 {
        self.steplength_max
    }

    pub fn steplength_min(&self) -> f64 {
        self.steplength_min
    }

    pub fn steplength_decay(&self) -> f64 {
        self.steplength_decay
    }

    pub fn with_steplength(
        mut self,
        max: f64,
        min: f64,
        decay: f64,
    ) -> Result<Self, IesError> {
        Self::validate_steplength(max, min, decay)?;
        self.steplength_max = max;
        self.steplength_min = min;
        self.steplength_decay = decay;
        Ok(self)
    }

    pub fn set_steplength_max(&mut self, max: f64) -> Result<(), IesError> {
        Self::validate_steplength(max, self.steplength_min, self.steplength_decay)?;
        self.steplength_max = max;
        Ok(())
    }

    pub fn set_steplength_min(&mut self, min: f64) -> Result<(), IesError> {
        Self::validate_steplength(self.steplength_max, min, self.steplength_decay)?;
        self.steplength_min = min;
        Ok(())
    }

    pub fn set_steplength_decay(&mut self, decay: f64) -> Result<(), IesError> {
        Self::validate_steplength(self.steplength_max, self.steplength_min, decay)?;
        self.steplength_decay = decay;
        Ok(())
    }

    fn validate_steplength(max: f64, min: f64, decay: f64) -> Result<(), IesError> {
        if max < min {
            return Err(IesError::config(format!(
                "IES_MAX_STEPLENGTH ({max}) must be >= IES_MIN_STEPLENGTH ({min})"
            )));
        }
        if min <= 0.0 {
            return Err(IesError::config("IES_MIN_STEPLENGTH must be > 0"));
        }
        if decay <= 1.0 {
            return Err(IesError::config("IES_DEC_STEPLENGTH must be > 1"));
        }
        Ok(())
    }

    /// `γ = γ_min + (γ_max − γ_min) · pow(2, −(iter − 1) / (decay − 1))`, `iter` starting at 1.
    pub fn calculate_steplength(&self, iter: u32) -> f64 {
        debug_assert!(iter >= 1, "iteration numbering starts at 1");
        let exponent = -((iter as f64) - 1.0) / (self.steplength_decay - 1.0);
        self.steplength_min + (self.steplength_max - self.steplength_min) * 2f64.powf(exponent)
    }

    pub fn truncation_dimension(&self) -> i64 {
        match self.truncation {
            Truncation::Dimension(k) => k as i64,
            Truncation::Fraction(_) => TRUNCATION_SENTINEL_INT,
        }
    }

    pub fn truncation_fraction(&self) -> f64 {
        match self.truncation {
            Truncation::Fraction(f) => f,
            Truncation::Dimension(_) => TRUNCATION_SENTINEL_DOUBLE,
        }
    }

    pub fn set_truncation_dimension(&mut self, k: usize) -> Result<(), IesError> {
        self.truncation = Truncation::dimension(k)?;
        Ok(())
    }

    pub fn set_truncation_fraction(&mut self, f: f64) -> Result<(), IesError> {
        self.truncation = Truncation::fraction(f)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn steplength_monotone_decreasing_and_converges_to_min() {
        let cfg = Config::default()
            .with_steplength(0.6, 0.3, 2.5)
            .unwrap();
        let g1 = cfg.calculate_steplength(1);
        let g2 = cfg.calculate_steplength(2);
        let g100 = cfg.calculate_steplength(100);
        assert_relative_eq!(g1, 0.6, epsilon = 1e-12);
        assert!(g2 < g1);
        assert!(g100 < g2);
        assert_relative_eq!(g100, 0.3, epsilon = 1e-3);
    }

    #[test]
    fn steplength_schedule_matches_literal_scenario() {
        let cfg = Config::default()
            .with_steplength(0.6, 0.3, 2.5)
            .unwrap();
        let g2 = cfg.calculate_steplength(2);
        assert_relative_eq!(g2, 0.3 + 0.3 * 2f64.powf(-1.0 / 1.5), epsilon = 1e-9);
    }

    #[test]
    fn steplength_rejects_invalid_parameters() {
        assert!(Config::default().with_steplength(0.2, 0.3, 2.5).is_err());
        assert!(Config::default().with_steplength(0.6, 0.0, 2.5).is_err());
        assert!(Config::default().with_steplength(0.6, 0.3, 1.0).is_err());
    }

    #[test]
    fn truncation_sentinels_on_wrong_branch() {
        let mut cfg = Config::default();
        cfg.set_truncation_fraction(0.97).unwrap();
        assert_eq!(cfg.truncation_dimension(), TRUNCATION_SENTINEL_INT);

        cfg.set_truncation_dimension(5).unwrap();
        assert_eq!(cfg.truncation_dimension(), 5);
        assert_eq!(cfg.truncation_fraction(), TRUNCATION_SENTINEL_DOUBLE);
    }

    #[test]
    fn truncation_rank_by_fraction_and_dimension() {
        let values = [4.0, 3.0, 2.0, 1.0];
        let by_dim = Truncation::Dimension(2);
        assert_eq!(by_dim.rank(&values), 2);

        let by_frac = Truncation::Fraction(1.0);
        assert_eq!(by_frac.rank(&values), 4);

        let by_frac_small = Truncation::Fraction(0.01);
        assert_eq!(by_frac_small.rank(&values), 1);
    }

    #[test]
    fn subspace_inversion_rejects_exact() {
        let err = SubspaceInversion::try_from(IesInversion::Exact).unwrap_err();
        assert!(matches!(err, IesError::Config(_)));
    }
}
