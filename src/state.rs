//! Iteration state (component C): the persistent object carried across
//! `init_update`/`updateA` calls. Owns `W`, `E`, `A0`, and both masks.

use ndarray::{s, Array2};

use crate::error::IesError;
use crate::mask::Mask;

/// ==============================================================================================
/// ====================================== Iteration State =======================================
/// ==============================================================================================

/// Persistent state across iterations of one assimilation chain.
#[derive(Clone, Debug)]
pub struct IterationState {
    w: Option<Array2<f64>>,       // N0 x N0 coefficient matrix, zero-padded for inactive realizations
    e: Option<Array2<f64>>,       // augmented initial-perturbation rows, grows as observations activate
    a0: Option<Array2<f64>>,      // n x N0, fixed at iteration 1
    ens_mask: Option<Mask>,       // length N0, true -> false only
    obs_mask: Option<Mask>,       // this iteration's active observations
    obs_mask0: Option<Mask>,      // frozen at iteration 1
    /// For each position in `obs_mask0`, the row of `E` holding that
    /// observation's perturbation, once it has been activated at least
    /// once. `None` until the observation first becomes active.
    obs_row_of: Vec<Option<usize>>,
    iteration_nr: u32,  // monotone, pre-incremented from zero
    state_size: usize,  // last n (parameter count) seen
}

impl IterationState {
    /// Fresh state with `iteration_nr = 0` and no matrices allocated.
    pub fn allocate() -> Self {
        Self {
            w: None,
            e: None,
            a0: None,
            ens_mask: None,
            obs_mask: None,
            obs_mask0: None,
            obs_row_of: Vec::new(),
            iteration_nr: 0,
            state_size: 0,
        }
    }

    pub fn iteration_nr(&self) -> u32 {
        self.iteration_nr
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    pub fn w(&self) -> Option<&Array2<f64>> {
        self.w.as_ref()
    }

    pub fn e(&self) -> Option<&Array2<f64>> {
        self.e.as_ref()
    }

    pub fn a0(&self) -> Option<&Array2<f64>> {
        self.a0.as_ref()
    }

    pub fn ens_mask(&self) -> Option<&Mask> {
        self.ens_mask.as_ref()
    }

    pub fn obs_mask(&self) -> Option<&Mask> {
        self.obs_mask.as_ref()
    }

    pub fn obs_mask0(&self) -> Option<&Mask> {
        self.obs_mask0.as_ref()
    }

    /// Copies `mask` in. On the first call this fixes `W`'s size (N0 x N0,
    /// zero-filled). On later calls, the mask length must match and no
    /// formerly-inactive realization may reappear.
    pub fn update_ens_mask(&mut self, mask: Mask) -> Result<(), IesError> {
        match &self.ens_mask {
            None => {
                self.w = Some(Array2::zeros((mask.len(), mask.len())));
                self.ens_mask = Some(mask);
            }
            Some(old) => {
                if old.len() != mask.len() {
                    return Err(IesError::mask(format!(
                        "ens_mask size changed: had {}, got {}",
                        old.len(),
                        mask.len()
                    )));
                }
                if !old.shrinks_from(&mask) {
                    return Err(IesError::mask(
                        "ens_mask may only transition true -> false across iterations",
                    ));
                }
                self.ens_mask = Some(mask);
            }
        }
        Ok(())
    }

    /// First-call-wins for `obs_mask0`; no-op on later calls. Also sizes the
    /// position -> E-row lookup table on first call.
    pub fn store_initial_obs_mask(&mut self, mask: &Mask) {
        if self.obs_mask0.is_none() {
            self.obs_row_of = vec![None; mask.len()];
            self.obs_mask0 = Some(mask.clone());
        }
    }

    /// `obs_mask` is replaced on every call.
    pub fn update_obs_mask(&mut self, mask: Mask) {
        self.obs_mask = Some(mask);
    }

    /// Ensures `W` is allocated (N0 x N0, zero-filled) if it is not already.
    pub fn allocate_w(&mut self) -> Result<(), IesError> {
        if self.w.is_none() {
            let n0 = self
                .ens_mask
                .as_ref()
                .ok_or_else(|| {
                    IesError::state("allocate_w: ens_mask must be set before W can be sized")
                })?
                .len();
            self.w = Some(Array2::zeros((n0, n0)));
        }
        Ok(())
    }

    pub fn update_state_size(&mut self, n: usize) {
        self.state_size = n;
    }

    /// On the first iteration, copies in the rows of `e_in` for every
    /// currently-active observation (`e_in`'s rows are ordered like
    /// `obs_mask`'s active positions, ascending). Equivalent to calling
    /// [`Self::augment_initial_e`] against an empty `E`; kept as a distinct
    /// entry point because the orchestrator only calls it on iteration 1.
    pub fn store_initial_e(&mut self, e_in: &Array2<f64>) -> Result<(), IesError> {
        if self.e.is_none() {
            self.e = Some(Array2::zeros((0, e_in.ncols())));
        }
        self.augment_initial_e(e_in)
    }

    /// Appends rows of `e_in` for observations that are active now but have
    /// never been active before (per `obs_mask0`-relative position, tracked
    /// in `obs_row_of`). `e_in`'s rows are ordered like `obs_mask`'s active
    /// positions, ascending. Existing rows of `E` are never rewritten or
    /// reordered, so a position that deactivates and later reactivates keeps
    /// its original row.
    pub fn augment_initial_e(&mut self, e_in: &Array2<f64>) -> Result<(), IesError> {
        let obs_mask = self
            .obs_mask
            .as_ref()
            .ok_or_else(|| IesError::state("augment_initial_e: obs_mask not set"))?
            .clone();
        let e = self
            .e
            .as_mut()
            .ok_or_else(|| IesError::state("augment_initial_e: E not initialized"))?;

        let active_positions: Vec<usize> = obs_mask.active_indices().collect();
        if e_in.nrows() < active_positions.len() {
            return Err(IesError::shape(format!(
                "augment_initial_e: e_in has {} rows, obs_mask needs {}",
                e_in.nrows(),
                active_positions.len()
            )));
        }

        let new_count = active_positions
            .iter()
            .filter(|&&pos| self.obs_row_of[pos].is_none())
            .count();
        if new_count == 0 {
            return Ok(());
        }

        let old_rows = e.nrows();
        let mut grown = Array2::<f64>::zeros((old_rows + new_count, e.ncols()));
        grown.slice_mut(s![0..old_rows, ..]).assign(e);

        let mut next_row = old_rows;
        for (rank, &pos) in active_positions.iter().enumerate() {
            if self.obs_row_of[pos].is_none() {
                grown.row_mut(next_row).assign(&e_in.row(rank));
                self.obs_row_of[pos] = Some(next_row);
                next_row += 1;
            }
        }
        debug_assert_eq!(next_row, old_rows + new_count);
        *e = grown;
        Ok(())
    }

    /// First-call-wins for `A0`.
    pub fn store_initial_a(&mut self, a: &Array2<f64>) {
        if self.a0.is_none() {
            self.a0 = Some(a.clone());
        }
    }

    /// Pre-increment from zero; the first call returns 1.
    pub fn inc_iteration_nr(&mut self) -> u32 {
        self.iteration_nr += 1;
        self.iteration_nr
    }

    /// Active slice of `E`: rows selected by `obs_mask` (looked up through
    /// `obs_row_of`, since `E`'s physical row order reflects first-activation
    /// order, not `obs_mask0` position), columns by `ens_mask`.
    pub fn alloc_active_e(&self) -> Result<Array2<f64>, IesError> {
        let e = self
            .e
            .as_ref()
            .ok_or_else(|| IesError::state("alloc_active_e: E not initialized"))?;
        let obs_mask = self
            .obs_mask
            .as_ref()
            .ok_or_else(|| IesError::state("alloc_active_e: obs_mask not set"))?;
        let ens_mask = self
            .ens_mask
            .as_ref()
            .ok_or_else(|| IesError::state("alloc_active_e: ens_mask not set"))?;

        let mut out = Array2::<f64>::zeros((obs_mask.active_count(), ens_mask.active_count()));
        for (out_i, pos) in obs_mask.active_indices().enumerate() {
            let row = self.obs_row_of[pos].ok_or_else(|| {
                IesError::state(format!(
                    "alloc_active_e: observation at position {pos} is active but was never stored in E"
                ))
            })?;
            for (out_j, j) in ens_mask.active_indices().enumerate() {
                out[(out_i, out_j)] = e[(row, j)];
            }
        }
        Ok(out)
    }

    /// Active slice of `W`, selected by `ens_mask` on both axes.
    pub fn alloc_active_w(&self) -> Result<Array2<f64>, IesError> {
        let w = self
            .w
            .as_ref()
            .ok_or_else(|| IesError::state("alloc_active_w: W not initialized"))?;
        let ens_mask = self
            .ens_mask
            .as_ref()
            .ok_or_else(|| IesError::state("alloc_active_w: ens_mask not set"))?;
        Ok(crate::mask::alloc_active(w, ens_mask, ens_mask))
    }

    /// Write an updated active `W` slice back into the full `W`, zeroing
    /// inactive rows/columns implicitly (they were never touched since
    /// `W` starts zero-filled and inactive positions are never selected).
    pub fn store_active_w(&mut self, active: &Array2<f64>) -> Result<(), IesError> {
        let ens_mask = self
            .ens_mask
            .clone()
            .ok_or_else(|| IesError::state("store_active_w: ens_mask not set"))?;
        let w = self
            .w
            .as_mut()
            .ok_or_else(|| IesError::state("store_active_w: W not initialized"))?;
        crate::mask::store_active(
            w,
            active,
            &ens_mask,
            &ens_mask,
            crate::mask::OutOfRangePolicy::Reject,
        )
    }

    /// Rows of `E` as of now (used by the `E growth monotone` property).
    pub fn e_rows(&self) -> usize {
        self.e.as_ref().map_or(0, Array2::nrows)
    }

    /// Active columns of `A0`, selected by `ens_mask` (all rows kept: the
    /// parameter axis is never masked, only the ensemble axis).
    pub fn alloc_active_a0(&self) -> Result<Array2<f64>, IesError> {
        let a0 = self
            .a0
            .as_ref()
            .ok_or_else(|| IesError::state("alloc_active_a0: A0 not set"))?;
        let ens_mask = self
            .ens_mask
            .as_ref()
            .ok_or_else(|| IesError::state("alloc_active_a0: ens_mask not set"))?;
        let all_rows = Mask::all_true(a0.nrows());
        Ok(crate::mask::alloc_active(a0, &all_rows, ens_mask))
    }

    /// Overwrites the iteration counter directly; exposed for the `ITER`
    /// configuration key, which the dispatch table documents as read/write.
    pub fn set_iteration_nr(&mut self, v: u32) {
        self.iteration_nr = v;
    }
}

/// Demean `a` along its ensemble axis (columns) and return the unchanged
/// number of rows/columns, used by the AA-projection step. Kept here rather
/// than in `linalg` because it is only ever applied to `A`/`A0`-shaped
/// matrices in this crate.
pub fn demeaned_columns(a: &Array2<f64>) -> Array2<f64> {
    let mut out = a.clone();
    crate::linalg::subtract_row_mean(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_ens_mask_sizes_w_on_first_call() {
        let mut state = IterationState::allocate();
        state.update_ens_mask(Mask::all_true(4)).unwrap();
        assert_eq!(state.w().unwrap().dim(), (4, 4));
    }

    #[test]
    fn update_ens_mask_rejects_growth() {
        let mut state = IterationState::allocate();
        state
            .update_ens_mask(Mask::new(vec![true, false, true]))
            .unwrap();
        let err = state
            .update_ens_mask(Mask::new(vec![true, true, true]))
            .unwrap_err();
        assert!(matches!(err, IesError::Mask(_)));
    }

    #[test]
    fn update_ens_mask_rejects_size_change() {
        let mut state = IterationState::allocate();
        state.update_ens_mask(Mask::all_true(3)).unwrap();
        let err = state.update_ens_mask(Mask::all_true(4)).unwrap_err();
        assert!(matches!(err, IesError::Mask(_)));
    }

    #[test]
    fn augment_initial_e_appends_without_rewriting() {
        let mut state = IterationState::allocate();
        state.update_ens_mask(Mask::all_true(2)).unwrap();

        let obs_mask_iter1 = Mask::new(vec![true, false, false]);
        state.store_initial_obs_mask(&obs_mask_iter1);
        state.update_obs_mask(obs_mask_iter1);
        let e0 = Array2::from_shape_vec((1, 2), vec![0.1, -0.1]).unwrap();
        state.store_initial_e(&e0).unwrap();
        assert_eq!(state.e_rows(), 1);

        state.update_obs_mask(Mask::new(vec![true, true, false]));
        let e1 = Array2::from_shape_vec((2, 2), vec![0.1, -0.1, 0.5, 0.6]).unwrap();
        state.augment_initial_e(&e1).unwrap();

        assert_eq!(state.e_rows(), 2);
        assert_eq!(state.e().unwrap().row(0).to_vec(), vec![0.1, -0.1]);
        assert_eq!(state.e().unwrap().row(1).to_vec(), vec![0.5, 0.6]);
    }

    #[test]
    fn inc_iteration_nr_starts_at_one() {
        let mut state = IterationState::allocate();
        assert_eq!(state.inc_iteration_nr(), 1);
        assert_eq!(state.inc_iteration_nr(), 2);
    }

    #[test]
    fn a0_is_fixed_after_first_store() {
        let mut state = IterationState::allocate();
        let a1 = Array2::from_shape_vec((1, 2), vec![1.0, 2.0]).unwrap();
        let a2 = Array2::from_shape_vec((1, 2), vec![9.0, 9.0]).unwrap();
        state.store_initial_a(&a1);
        state.store_initial_a(&a2);
        assert_eq!(state.a0().unwrap(), &a1);
    }
}
