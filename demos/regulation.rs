/// Regulation example
///
/// Two-state, two-input plant discretised at 1 s, driven to the origin from
/// `x0 = [0.1, 0]`. The first input is bounded below, which makes the
/// constraint active during the first few steps and forces the ADMM path.
///
/// Every step plans a full sequence but only applies its first move, as a
/// controller behind a lossless network would.
use horizon_mpc::{GaussianBelief, PredictiveController};
use log::debug;
use nalgebra::{DMatrix, DVector, dvector};

const NU: usize = 2;
const NX: usize = 2;
const SEQ: usize = 10;
const NH: usize = 15;
const STEPS: usize = 30;

fn main() {
    env_logger::init();
    let a = DMatrix::from_vec(NX, NX, A.to_vec()).transpose();
    let b = DMatrix::from_vec(NU, NX, B.to_vec()).transpose();
    let q = DMatrix::from_diagonal(&DVector::from_vec(Q.to_vec()));
    let r = DMatrix::from_diagonal(&DVector::from_vec(R.to_vec()));

    // -u1 <= 0.005, state left unbounded
    let mut mpc = match PredictiveController::for_regulation(
        a.clone(),
        b.clone(),
        q,
        r,
        SEQ,
        dvector![0.0, 0.0],
        1.0,
        dvector![-1.0, 0.0],
        0.005,
    ) {
        Ok(mpc) => mpc,
        Err(e) => {
            eprintln!("invalid controller setup: {e}");
            return;
        }
    };

    // Configure horizon and settings
    if let Err(e) = mpc.change_horizon_length(NH) {
        eprintln!("{e}");
        return;
    }
    mpc.settings_mut().max_iter = 2000;

    let mut x = dvector![0.1, 0.0];
    let mut total_cost = 0.0;
    for k in 1..=STEPS {
        let belief = GaussianBelief::dirac(x.clone());
        let seq = match mpc.compute_control_sequence(&belief, 0, k) {
            Ok(seq) => seq,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        };
        let u = seq.input_at(0);
        debug!(
            "At step {k:3} ({:?}), |x| = {:.6}, u = [{:.6}, {:.6}]",
            mpc.last_status(),
            x.norm(),
            u[0],
            u[1],
        );

        total_cost += mpc.compute_stage_costs(&x, &u, k).unwrap_or(f64::NAN);

        // Iterate simulation
        x = &a * x + &b * &u;
    }

    println!("Final state: [{:.3e}, {:.3e}]", x[0], x[1]);
    println!("Accumulated stage cost: {total_cost:.6}");
}

#[rustfmt::skip]
const A: [f64; 4] = [
    0.9512, 0.0,
    0.0,    0.9048,
];

#[rustfmt::skip]
const B: [f64; 4] = [
     4.877,  4.877,
    -1.1895, 3.569,
];

#[rustfmt::skip]
const Q: [f64; NX] = [0.005, 0.02];

#[rustfmt::skip]
const R: [f64; NU] = [1.0 / 3.0, 3.0];
