//! Mask & active-slice algebra (component D).
//!
//! A [`Mask`] is an ordered sequence of booleans with a precomputed active
//! count, so rebuilding an active sub-matrix never needs a second scan.
//! `alloc_active` / `store_active` are the only operations that touch both
//! masks of a 2-D selection at once.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::IesError;

/// ==============================================================================================
/// ================================ Mask & Active-Slice Algebra =================================
/// ==============================================================================================

/// An ordered sequence of booleans paired with the number of `true` entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    bits: Vec<bool>,       // one entry per realization/observation, ordered
    active_count: usize,   // precomputed, avoids rescanning bits on every active-slice build
}

impl Mask {
    pub fn new(bits: Vec<bool>) -> Self {
        let active_count = bits.iter().filter(|b| **b).count();
        Self { bits, active_count }
    }

    pub fn all_true(len: usize) -> Self {
        Self::new(vec![true; len])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        self.bits[i]
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.bits
    }

    /// Indices (in ascending order) of the `true` entries.
    pub fn active_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
    }

    /// `true` iff every bit that was `true` in `self` is still `true` in `other`,
    /// i.e. `other` only shrinks relative to `self` (ensemble-mask invariant).
    pub fn shrinks_from(&self, other: &Mask) -> bool {
        self.len() == other.len()
            && self
                .bits
                .iter()
                .zip(other.bits.iter())
                .all(|(old, new)| !*new || *old)
    }
}

/// What to do when `store_active` is asked to write outside the masked grid.
///
/// The legacy source silently no-opped such writes, which can mask bugs
/// (see DESIGN.md, resolved open question). This implementation always
/// requires the caller to pick a policy explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutOfRangePolicy {
    /// `debug_assert!` in debug builds; silently ignored in release builds.
    Assert,
    /// Always returns `Err(IesError::Shape(_))`.
    Reject,
}

/// Build a new `(row_mask.active_count() x col_mask.active_count())` matrix
/// containing `m[i, j]` for every `(i, j)` where both masks are `true`,
/// preserving the row/column order of `m`.
pub fn alloc_active(m: &Array2<f64>, row_mask: &Mask, col_mask: &Mask) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((row_mask.active_count(), col_mask.active_count()));
    let row_idx: Vec<usize> = row_mask.active_indices().collect();
    let col_idx: Vec<usize> = col_mask.active_indices().collect();
    for (out_i, &i) in row_idx.iter().enumerate() {
        for (out_j, &j) in col_idx.iter().enumerate() {
            out[(out_i, out_j)] = m[(i, j)];
        }
    }
    out
}

/// Write `active` (sized `row_mask.active_count() x col_mask.active_count()`)
/// back into `dest`'s masked coordinates. Positions where either mask is
/// `false` are left untouched (callers are expected to have zero-filled
/// `dest` beforehand where that matters, e.g. `IterationState::W`).
pub fn store_active(
    dest: &mut Array2<f64>,
    active: &Array2<f64>,
    row_mask: &Mask,
    col_mask: &Mask,
    policy: OutOfRangePolicy,
) -> Result<(), IesError> {
    let expected = (row_mask.active_count(), col_mask.active_count());
    if active.dim() != expected {
        let msg = format!(
            "store_active: active matrix is {:?}, expected {:?} from masks",
            active.dim(),
            expected
        );
        return match policy {
            OutOfRangePolicy::Assert => {
                debug_assert!(false, "{msg}");
                Ok(())
            }
            OutOfRangePolicy::Reject => Err(IesError::shape(msg)),
        };
    }

    let row_idx: Vec<usize> = row_mask.active_indices().collect();
    let col_idx: Vec<usize> = col_mask.active_indices().collect();
    for (out_i, &i) in row_idx.iter().enumerate() {
        for (out_j, &j) in col_idx.iter().enumerate() {
            dest[(i, j)] = active[(out_i, out_j)];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrinks_from_allows_only_true_to_false() {
        let old = Mask::new(vec![true, true, false]);
        let shrunk = Mask::new(vec![true, false, false]);
        let grown = Mask::new(vec![true, true, true]);
        assert!(old.shrinks_from(&shrunk));
        assert!(!old.shrinks_from(&grown));
    }

    #[test]
    fn active_round_trip_preserves_active_and_zeros_inactive() {
        let mask = Mask::new(vec![true, false, true]);
        let mut w = Array2::<f64>::zeros((3, 3));
        for i in 0..3 {
            for j in 0..3 {
                w[(i, j)] = (i * 3 + j) as f64;
            }
        }
        let active = alloc_active(&w, &mask, &mask);
        assert_eq!(active.dim(), (2, 2));

        let mut dest = Array2::<f64>::zeros((3, 3));
        store_active(&mut dest, &active, &mask, &mask, OutOfRangePolicy::Reject).unwrap();

        for i in 0..3 {
            for j in 0..3 {
                if mask.get(i) && mask.get(j) {
                    assert_eq!(dest[(i, j)], w[(i, j)]);
                } else {
                    assert_eq!(dest[(i, j)], 0.0);
                }
            }
        }
    }

    #[test]
    fn store_active_rejects_wrong_shape() {
        let mask = Mask::new(vec![true, true]);
        let mut dest = Array2::<f64>::zeros((2, 2));
        let wrong = Array2::<f64>::zeros((1, 1));
        let err = store_active(&mut dest, &wrong, &mask, &mask, OutOfRangePolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, IesError::Shape(_)));
    }
}
