//! Update orchestrator (component F): `init_update` refreshes the masks
//! carried in [`IterationState`] at the start of an iteration; `updateA`
//! runs the full `ies_initX` pipeline and applies `A <- A0 * X` in place.
//! Both glue components B-E together; neither owns any numerical logic of
//! its own beyond the assembly the design doc calls out.

use ndarray::{s, Array1, Array2};

use crate::config::{Config, IesInversion, SubspaceInversion};
use crate::error::IesError;
use crate::inversion;
use crate::linalg;
use crate::logsink::LogSink;
use crate::mask::Mask;
use crate::state::{demeaned_columns, IterationState};

/// ==============================================================================================
/// ==================================== Update Orchestrator =====================================
/// ==============================================================================================

/// Refreshes the masks carried in `state` at the start of an iteration.
/// `S`, `R`, `dObs`, `E`, `D` are part of the dispatch-table signature (see
/// [`crate::module::Module::init_update`]) but are not consumed here; they
/// are supplied again, and actually used, in [`update_a`].
pub fn init_update(
    state: &mut IterationState,
    ens_mask: Mask,
    obs_mask: Mask,
) -> Result<(), IesError> {
    state.update_ens_mask(ens_mask)?;
    state.allocate_w()?;
    state.store_initial_obs_mask(&obs_mask);
    state.update_obs_mask(obs_mask);
    Ok(())
}

/// Runs one iteration: updates `state` (W, E, A0, iteration counter) and
/// writes the new ensemble into `a`. Returns the cost-function value for
/// this iteration (`(1/N) * sum_i(||W_col_i||^2 + ||D_col_i||^2)`, evaluated
/// against the pre-update W), which the caller logs.
///
/// `y_in`, `r_in`, `e_in`, `d_in` are the active (masked) matrices for this
/// iteration, shaped `m x N`/`m x m` as appropriate, where `m` and `N` are
/// the current active observation and ensemble counts. `dobs` is accepted
/// for signature fidelity with the dispatch table (the perturbed residual
/// `D` already encodes it) and is only shape-checked here.
#[allow(clippy::too_many_arguments)]
pub fn update_a(
    state: &mut IterationState,
    config: &Config,
    log_sink: &mut dyn LogSink,
    a: &mut Array2<f64>,
    y_in: &Array2<f64>,
    r_in: &Array2<f64>,
    dobs: &Array2<f64>,
    e_in: &Array2<f64>,
    d_in: &Array2<f64>,
) -> Result<f64, IesError> {
    if state.ens_mask().is_none() || state.obs_mask().is_none() {
        return Err(IesError::state(
            "updateA: init_update must be called before updateA",
        ));
    }

    let n = y_in.ncols();
    let m = y_in.nrows();
    let n_rows_a = a.nrows();

    if n == 0 {
        return Err(IesError::shape("updateA: ensemble size is zero"));
    }
    if a.ncols() != n {
        return Err(IesError::shape(format!(
            "updateA: A has {} columns, Y has {n} columns",
            a.ncols()
        )));
    }
    if r_in.dim() != (m, m) {
        return Err(IesError::shape(format!(
            "updateA: R is {:?}, expected {:?} from Y's row count",
            r_in.dim(),
            (m, m)
        )));
    }
    if e_in.dim() != (m, n) {
        return Err(IesError::shape(format!(
            "updateA: E is {:?}, expected {:?}",
            e_in.dim(),
            (m, n)
        )));
    }
    if d_in.dim() != (m, n) {
        return Err(IesError::shape(format!(
            "updateA: D is {:?}, expected {:?}",
            d_in.dim(),
            (m, n)
        )));
    }
    if dobs.nrows() != m {
        return Err(IesError::shape(format!(
            "updateA: dObs has {} rows, expected {m}",
            dobs.nrows()
        )));
    }

    let k = state.inc_iteration_nr();
    let gamma = config.calculate_steplength(k);

    state.update_state_size(n_rows_a);
    if k == 1 {
        state.store_initial_e(e_in)?;
        state.store_initial_a(a);
    } else {
        state.augment_initial_e(e_in)?;
    }

    let a0_active = state.alloc_active_a0()?;
    if a0_active.nrows() != n_rows_a {
        return Err(IesError::shape(format!(
            "updateA: A0 has {} rows, current A has {n_rows_a} (parameter count changed mid-chain)",
            a0_active.nrows()
        )));
    }

    let e_active = state.alloc_active_e()?;
    let d_active: Array2<f64> = d_in - e_in + &e_active;

    let w0 = state.alloc_active_w()?;
    if w0.dim() != (n, n) {
        return Err(IesError::shape(format!(
            "updateA: active W is {:?}, expected {:?} from the active ensemble size",
            w0.dim(),
            (n, n)
        )));
    }

    let projection_source = if config.use_projection && n_rows_a <= n.saturating_sub(1) {
        Some(&*a)
    } else {
        None
    };

    let outcome = compute_x(
        config,
        projection_source,
        y_in,
        r_in,
        &e_active,
        &d_active,
        w0,
        gamma,
    )?;

    state.store_active_w(&outcome.w_updated)?;

    let _ = log_sink.write_record(k, outcome.costf);

    let a_new = a0_active.dot(&outcome.x);
    a.assign(&a_new);

    Ok(outcome.costf)
}

/// Count of singular values distinguishable from zero at working precision,
/// relative to the largest one. Used by the AA-projection step to restrict
/// `Vt` to the rows actually spanning demeaned `A`'s column space -- demeaned
/// `A` has rank at most `N-1` regardless of how many columns it has.
fn numerical_rank(sigma: &Array1<f64>) -> usize {
    match sigma.iter().cloned().fold(0.0_f64, f64::max) {
        sigma_max if sigma_max > 0.0 => {
            let tol = sigma_max * (sigma.len().max(1) as f64) * f64::EPSILON;
            sigma.iter().filter(|s| **s > tol).count()
        }
        _ => 0,
    }
}

/// Orthogonal projector (`N x N`, `V*V^T`) onto the column space of demeaned
/// `a`, restricted to the leading `rank` right-singular vectors. Demeaned `a`
/// has rank at most `N-1` regardless of its row count, so the *full* `Vt`
/// returned by `svd` always squares back to the identity -- `None` signals a
/// (numerically) zero column space, which the caller projects onto by
/// zeroing `Y` outright rather than leaving it untouched.
fn aa_projection(a: &Array2<f64>) -> Result<Option<Array2<f64>>, IesError> {
    let demeaned = demeaned_columns(a);
    let (_u, sigma, vt) = linalg::svd(&demeaned)?;
    let rank = numerical_rank(&sigma);
    if rank == 0 {
        return Ok(None);
    }
    let vr = vt.slice(s![0..rank, ..]);
    Ok(Some(vr.t().dot(&vr)))
}

/// Result of the `ies_initX` computation: the new active `X`, the updated
/// active `W` (to be written back by the caller), and the cost-function
/// value (evaluated against the pre-update `W`).
pub(crate) struct InitXOutcome {
    pub x: Array2<f64>,
    pub w_updated: Array2<f64>,
    pub costf: f64,
}

/// `ies_initX`: the numerical core shared by [`update_a`] (which supplies a
/// carried-over `w0` and commits the result to state) and the stateless
/// `initX` convenience entry point (which starts from `w0 = 0` and discards
/// the result after reading `x`).
///
/// `projection_source`, when `Some`, is the current (pre-update) `A` used
/// for the AA-projection step; it is only ever `Some` when the caller has
/// already checked `use_projection && n <= N - 1`.
pub(crate) fn compute_x(
    config: &Config,
    projection_source: Option<&Array2<f64>>,
    y_in: &Array2<f64>,
    r_active: &Array2<f64>,
    e_active: &Array2<f64>,
    d_active: &Array2<f64>,
    mut w0: Array2<f64>,
    gamma: f64,
) -> Result<InitXOutcome, IesError> {
    let n = y_in.ncols();
    let nm1 = n as f64 - 1.0;
    if nm1 <= 0.0 {
        return Err(IesError::shape(
            "compute_x: need at least 2 active realizations",
        ));
    }
    let nsc = 1.0 / nm1.sqrt();

    let mut y = y_in.clone();
    linalg::subtract_row_mean(&mut y);
    linalg::scale(&mut y, nsc);

    if let Some(a) = projection_source {
        match aa_projection(a)? {
            Some(projection) => y = y.dot(&projection),
            None => y.fill(0.0),
        }
    }

    let mut omega = w0.clone();
    linalg::subtract_row_mean(&mut omega);
    linalg::scale(&mut omega, nsc);
    linalg::add_scalar_to_diag(&mut omega, 1.0);

    let omega_t = omega.t().to_owned();
    let y_t = y.t().to_owned();
    let s_t = linalg::solve(&omega_t, &y_t)?;
    let s = s_t.t().to_owned();

    let w_before = w0.clone();
    let h = s.dot(&w_before) + d_active;

    match config.inversion {
        IesInversion::Exact => {
            inversion::exact(&mut w0, &s, &h, gamma)?;
        }
        other => {
            let mode = SubspaceInversion::try_from(other)?;
            match mode {
                SubspaceInversion::ExactR => {
                    // Pinned to SUBSPACE_RE's 1/sqrt(N-1) perturbation scaling
                    // (SS^T + EE^T/(N-1)): R must be divided by (N-1), not (N-1)^2,
                    // or SUBSPACE_EXACT_R/SUBSPACE_EE_R disagree with SUBSPACE_RE.
                    let r_scaled = r_active / nm1;
                    inversion::subspace(
                        mode,
                        &mut w0,
                        &s,
                        &r_scaled,
                        e_active,
                        &h,
                        &config.truncation,
                        gamma,
                    )?;
                }
                SubspaceInversion::EeR => {
                    let cee = e_active.dot(&e_active.t()) / nm1;
                    inversion::subspace(
                        mode,
                        &mut w0,
                        &s,
                        &cee,
                        e_active,
                        &h,
                        &config.truncation,
                        gamma,
                    )?;
                }
                SubspaceInversion::Re => {
                    let e_scaled = e_active / nm1.sqrt();
                    inversion::subspace(
                        mode,
                        &mut w0,
                        &s,
                        &e_scaled,
                        &e_scaled,
                        &h,
                        &config.truncation,
                        gamma,
                    )?;
                }
            }
        }
    }

    let mut x = w0.clone();
    linalg::scale(&mut x, nsc);
    linalg::add_scalar_to_diag(&mut x, 1.0);

    let costf = (0..n)
        .map(|i| {
            let w_col = w_before.column(i);
            let d_col = d_active.column(i);
            w_col.dot(&w_col) + d_col.dot(&d_col)
        })
        .sum::<f64>()
        / n as f64;

    Ok(InitXOutcome {
        x,
        w_updated: w0,
        costf,
    })
}

/// Stateless convenience entry point: `initX(cfg, Y, R, E, D, X)`. Computes
/// `X` for a single iteration starting from `W = 0` and `gamma =
/// calculate_steplength(1)`, without touching any [`IterationState`] and
/// without AA-projection (there is no `A` in this entry point's signature).
pub fn init_x(
    config: &Config,
    y: &Array2<f64>,
    r: &Array2<f64>,
    e: &Array2<f64>,
    d: &Array2<f64>,
) -> Result<Array2<f64>, IesError> {
    let n = y.ncols();
    let m = y.nrows();
    if r.dim() != (m, m) {
        return Err(IesError::shape(format!(
            "initX: R is {:?}, expected {:?}",
            r.dim(),
            (m, m)
        )));
    }
    if e.dim() != (m, n) || d.dim() != (m, n) {
        return Err(IesError::shape("initX: E/D must match Y's shape"));
    }

    let w0 = Array2::<f64>::zeros((n, n));
    let gamma = config.calculate_steplength(1);
    let outcome = compute_x(config, None, y, r, e, d, w0, gamma)?;
    Ok(outcome.x)
}
