//! Runs a handful of IES iterations against a synthetic linear forward
//! model (`Y = H * A`) and prints the cost-function trace. Exercises the
//! same `Module` surface a real assimilation driver would use: `alloc`,
//! `init_update`/`update_a` once per iteration, masks held constant.

use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use ies_update_core::{Mask, Module};

const N_PARAMS: usize = 3;
const N_ENS: usize = 12;
const N_OBS: usize = 2;
const N_ITER: u32 = 4;

fn main() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    // Observation operator: sum of the first two parameters, and the third
    // parameter alone.
    let h = Array2::from_shape_vec((N_OBS, N_PARAMS), vec![1.0, 1.0, 0.0, 0.0, 0.0, 1.0]).unwrap();
    let d_obs = Array1::from_vec(vec![2.0, 1.0]);

    let mut a = Array2::from_shape_fn((N_PARAMS, N_ENS), |_| rng.random_range(-1.0..1.0));

    let mut module = Module::alloc();

    let ens_mask = Mask::all_true(N_ENS);
    let obs_mask = Mask::all_true(N_OBS);

    for _ in 1..=N_ITER {
        let y = h.dot(&a);
        let r = Array2::<f64>::eye(N_OBS);
        let e = Array2::from_shape_fn((N_OBS, N_ENS), |_| rng.random_range(-0.05..0.05));
        let dobs_col = d_obs.clone().insert_axis(ndarray::Axis(1));
        let d = &dobs_col.broadcast((N_OBS, N_ENS)).unwrap().to_owned() + &e - &y;

        module
            .init_update(ens_mask.clone(), obs_mask.clone(), &y, &r, &dobs_col, &e, &d)
            .expect("init_update");
        module
            .update_a(&mut a, &y, &r, &dobs_col, &e, &d)
            .expect("update_a");
        let cost = module.last_cost().unwrap_or(f64::NAN);
        println!("iter {}: cost = {cost:.6}", module.state().iteration_nr());
    }

    let final_y = h.dot(&a);
    println!("final mean simulated observations: {:?}", final_y.mean_axis(ndarray::Axis(1)).unwrap());
}
