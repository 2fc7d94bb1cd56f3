//! External interface: the `IES_ENKF` dispatch table (component G). This is
//! the surface the host driver is expected to consume -- `alloc`/`free`,
//! `init_update`/`updateA`, the stateless `initX`, and the typed
//! `set_*`/`get_*` accessors keyed by the recognized configuration strings.
//!
//! The legacy source threaded a raw `handle` pointer through every call and
//! read/wrote a process-wide logger singleton. Here the state and the log
//! sink are both owned by [`Module`] directly; there is no global to close
//! over and no pointer to free.

use ndarray::Array2;

use crate::config::{Config, IesInversion};
use crate::error::IesError;
use crate::logsink::{FileLogSink, LogSink, NullLogSink};
use crate::mask::Mask;
use crate::state::IterationState;
use crate::update;

/// Bit set by [`Module::get_options`] when `IES_AAPROJECTION` is enabled.
pub const OPT_AAPROJECTION: u32 = 1 << 0;
/// Bit set by [`Module::get_options`] when `IES_DEBUG` is enabled.
pub const OPT_DEBUG: u32 = 1 << 1;

/// ==============================================================================================
/// ======================================= Dispatch Table =======================================
/// ==============================================================================================

/// `IES_ENKF`: the update core bound to one configuration, one persistent
/// [`IterationState`], and one log sink.
#[derive(Debug)]
pub struct Module {
    config: Config,             // inversion mode, truncation, steplength schedule, flags
    state: IterationState,      // W, E, A0, masks, iteration counter
    log_sink: Box<dyn LogSink>, // NullLogSink until IES_LOGFILE is set
    log_path: Option<String>,   // mirrors log_sink for get_ptr("IES_LOGFILE")
    last_cost: Option<f64>,     // cost function from the most recent update_a
}

impl Module {
    pub const NAME: &'static str = "IES_ENKF";

    /// `Module::new(config)`: a fresh module bound to `config`, with an
    /// empty iteration state and no log sink.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: IterationState::allocate(),
            log_sink: Box::new(NullLogSink),
            log_path: None,
            last_cost: None,
        }
    }

    /// `alloc()`: a fresh module with default configuration. Equivalent to
    /// `Module::new(Config::default())`.
    pub fn alloc() -> Self {
        Self::new(Config::default())
    }

    /// Cost-function value recorded by the most recent [`Module::update_a`]
    /// call, if any.
    pub fn last_cost(&self) -> Option<f64> {
        self.last_cost
    }

    /// `freef(state*)`: releases the module. Ordinary `Drop` already does
    /// this; the method exists so call sites mirroring the C dispatch table
    /// read the same way.
    pub fn free(self) {}

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &IterationState {
        &self.state
    }

    /// `init_update(state*, ens_mask, obs_mask, S, R, dObs, E, D, rng)`.
    /// `S`, `R`, `dObs`, `E`, `D`, and `rng` are part of the dispatch-table
    /// signature but are not consumed at this point in the iteration (see
    /// [`crate::update::init_update`]); they are supplied again, and used,
    /// in [`Module::update_a`].
    #[allow(clippy::too_many_arguments)]
    pub fn init_update(
        &mut self,
        ens_mask: Mask,
        obs_mask: Mask,
        _s: &Array2<f64>,
        _r: &Array2<f64>,
        _dobs: &Array2<f64>,
        _e: &Array2<f64>,
        _d: &Array2<f64>,
    ) -> Result<(), IesError> {
        update::init_update(&mut self.state, ens_mask, obs_mask)
    }

    /// `updateA(state*, A, Y, R, dObs, E, D, rng)`. The iteration's
    /// cost-function value is recorded and retrievable via
    /// [`Module::last_cost`]; this mirrors the dispatch table, which
    /// surfaces it only through the log sink, not through the call's
    /// return value.
    #[allow(clippy::too_many_arguments)]
    pub fn update_a(
        &mut self,
        a: &mut Array2<f64>,
        y: &Array2<f64>,
        r: &Array2<f64>,
        dobs: &Array2<f64>,
        e: &Array2<f64>,
        d: &Array2<f64>,
    ) -> Result<(), IesError> {
        let cost = update::update_a(
            &mut self.state,
            &self.config,
            self.log_sink.as_mut(),
            a,
            y,
            r,
            dobs,
            e,
            d,
        )?;
        self.last_cost = Some(cost);
        Ok(())
    }

    /// `initX(cfg, Y, R, E, D, X)`: stateless convenience, independent of
    /// any [`Module`] instance. Writes the result into the caller-owned
    /// `x` buffer, resizing it if needed.
    pub fn init_x(
        config: &Config,
        y: &Array2<f64>,
        r: &Array2<f64>,
        e: &Array2<f64>,
        d: &Array2<f64>,
        x: &mut Array2<f64>,
    ) -> Result<(), IesError> {
        *x = update::init_x(config, y, r, e, d)?;
        Ok(())
    }

    pub fn has_var(name: &str) -> bool {
        matches!(
            name,
            "ENKF_SUBSPACE_DIMENSION"
                | "ENKF_TRUNCATION"
                | "IES_MAX_STEPLENGTH"
                | "IES_MIN_STEPLENGTH"
                | "IES_DEC_STEPLENGTH"
                | "ITER"
                | "IES_INVERSION"
                | "IES_AAPROJECTION"
                | "IES_LOGFILE"
                | "IES_DEBUG"
        )
    }

    /// Flag bits reflecting the boolean configuration keys: see
    /// [`OPT_AAPROJECTION`] and [`OPT_DEBUG`].
    pub fn get_options(&self) -> u32 {
        let mut bits = 0;
        if self.config.use_projection {
            bits |= OPT_AAPROJECTION;
        }
        if self.config.debug {
            bits |= OPT_DEBUG;
        }
        bits
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> Result<(), IesError> {
        match name {
            "ENKF_SUBSPACE_DIMENSION" => {
                if value < 1 {
                    return Err(IesError::config(
                        "ENKF_SUBSPACE_DIMENSION: dimension must be >= 1",
                    ));
                }
                self.config.set_truncation_dimension(value as usize)
            }
            "ITER" => {
                if value < 0 {
                    return Err(IesError::config("ITER: must be >= 0"));
                }
                self.state.set_iteration_nr(value as u32);
                Ok(())
            }
            "IES_INVERSION" => {
                self.config.inversion = IesInversion::from_key(value)?;
                Ok(())
            }
            other => Err(IesError::config(format!("set_int: unknown key {other}"))),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<i64, IesError> {
        match name {
            "ENKF_SUBSPACE_DIMENSION" => Ok(self.config.truncation_dimension()),
            "ITER" => Ok(self.state.iteration_nr() as i64),
            "IES_INVERSION" => Ok(self.config.inversion.to_key()),
            other => Err(IesError::config(format!("get_int: unknown key {other}"))),
        }
    }

    pub fn set_double(&mut self, name: &str, value: f64) -> Result<(), IesError> {
        match name {
            "ENKF_TRUNCATION" => self.config.set_truncation_fraction(value),
            "IES_MAX_STEPLENGTH" => self.config.set_steplength_max(value),
            "IES_MIN_STEPLENGTH" => self.config.set_steplength_min(value),
            "IES_DEC_STEPLENGTH" => self.config.set_steplength_decay(value),
            other => Err(IesError::config(format!("set_double: unknown key {other}"))),
        }
    }

    pub fn get_double(&self, name: &str) -> Result<f64, IesError> {
        match name {
            "ENKF_TRUNCATION" => Ok(self.config.truncation_fraction()),
            "IES_MAX_STEPLENGTH" => Ok(self.config.steplength_max()),
            "IES_MIN_STEPLENGTH" => Ok(self.config.steplength_min()),
            "IES_DEC_STEPLENGTH" => Ok(self.config.steplength_decay()),
            other => Err(IesError::config(format!("get_double: unknown key {other}"))),
        }
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<(), IesError> {
        match name {
            "IES_AAPROJECTION" => {
                self.config.use_projection = value;
                Ok(())
            }
            "IES_DEBUG" => {
                self.config.debug = value;
                if value {
                    log::warn!("IES_DEBUG is accepted but has no effect in this build");
                }
                Ok(())
            }
            other => Err(IesError::config(format!("set_bool: unknown key {other}"))),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, IesError> {
        match name {
            "IES_AAPROJECTION" => Ok(self.config.use_projection),
            "IES_DEBUG" => Ok(self.config.debug),
            other => Err(IesError::config(format!("get_bool: unknown key {other}"))),
        }
    }

    /// `set_string(state*, "IES_LOGFILE", path)`: opens (creating if
    /// absent) a [`FileLogSink`] at `path` in append mode and installs it.
    pub fn set_string(&mut self, name: &str, value: &str) -> Result<(), IesError> {
        match name {
            "IES_LOGFILE" => {
                let sink = FileLogSink::open(value).map_err(|e| {
                    IesError::config(format!("IES_LOGFILE: failed to open {value}: {e}"))
                })?;
                self.log_sink = Box::new(sink);
                self.log_path = Some(value.to_string());
                Ok(())
            }
            other => Err(IesError::config(format!("set_string: unknown key {other}"))),
        }
    }

    /// `get_ptr(state*, "IES_LOGFILE")`: returns the configured log path, if
    /// any. Rust has no use for the raw pointer the C signature names; a
    /// borrow of the path owned by `self` is the faithful equivalent.
    pub fn get_ptr(&self, name: &str) -> Result<Option<&str>, IesError> {
        match name {
            "IES_LOGFILE" => Ok(self.log_path.as_deref()),
            other => Err(IesError::config(format!("get_ptr: unknown key {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keys_replace_each_other() {
        let mut module = Module::alloc();
        module.set_double("ENKF_TRUNCATION", 0.97).unwrap();
        module.set_int("ENKF_SUBSPACE_DIMENSION", 5).unwrap();

        assert_eq!(module.get_int("ENKF_SUBSPACE_DIMENSION").unwrap(), 5);
        assert_eq!(
            module.get_double("ENKF_TRUNCATION").unwrap(),
            crate::config::TRUNCATION_SENTINEL_DOUBLE
        );
    }

    #[test]
    fn unknown_key_is_config_error() {
        let module = Module::alloc();
        let err = module.get_int("NOT_A_KEY").unwrap_err();
        assert!(matches!(err, IesError::Config(_)));
        assert!(!Module::has_var("NOT_A_KEY"));
        assert!(Module::has_var("IES_INVERSION"));
    }

    #[test]
    fn options_bits_reflect_bool_keys() {
        let mut module = Module::alloc();
        assert_eq!(module.get_options(), 0);
        module.set_bool("IES_AAPROJECTION", true).unwrap();
        module.set_bool("IES_DEBUG", true).unwrap();
        assert_eq!(module.get_options(), OPT_AAPROJECTION | OPT_DEBUG);
    }

    #[test]
    fn inversion_round_trips_through_int_key() {
        let mut module = Module::alloc();
        module.set_int("IES_INVERSION", 3).unwrap();
        assert_eq!(module.get_int("IES_INVERSION").unwrap(), 3);
        assert_eq!(module.config().inversion, IesInversion::SubspaceRe);
    }

    #[test]
    fn iter_key_reads_and_writes_iteration_counter() {
        let mut module = Module::alloc();
        module.set_int("ITER", 7).unwrap();
        assert_eq!(module.get_int("ITER").unwrap(), 7);
        assert_eq!(module.state().iteration_nr(), 7);
    }

    #[test]
    fn init_x_writes_into_caller_buffer() {
        use ndarray::Array2;
        let config = Config::default();
        let y = Array2::<f64>::zeros((2, 4));
        let r = Array2::<f64>::eye(2);
        let e = Array2::<f64>::zeros((2, 4));
        let d = Array2::<f64>::zeros((2, 4));
        let mut x = Array2::<f64>::zeros((0, 0));

        Module::init_x(&config, &y, &r, &e, &d, &mut x).unwrap();
        assert_eq!(x.dim(), (4, 4));
    }
}
