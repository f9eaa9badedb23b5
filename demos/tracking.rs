/// Tracking example
///
/// Double integrator (position, velocity) sampled at 10 Hz whose position
/// follows a sine reference. The velocity is capped, so the plant cannot
/// keep up with the steep parts of the reference and the ADMM path kicks in.
///
///     States: p (m), v (m/s)
///     Inputs: a (m/s^2)
///     Tracked output: p
use horizon_mpc::{GaussianBelief, PredictiveController};
use log::debug;
use nalgebra::{DMatrix, DVector, dmatrix, dvector};

const NU: usize = 1;
const NX: usize = 2;
const SEQ: usize = 5;
const NH: usize = 20;
const STEPS: usize = 150;
const VMAX: f64 = 0.8;

fn main() {
    env_logger::init();
    let a = DMatrix::from_vec(NX, NX, A.to_vec()).transpose();
    let b = DMatrix::from_vec(NU, NX, B.to_vec()).transpose();
    let z = dmatrix![1.0, 0.0];

    // Reference covers the simulation plus one horizon
    let t = STEPS + NH + 1;
    let reference = DMatrix::from_fn(1, t, |_, k| (k as f64 * DT * 0.5).sin() * 2.0);

    let mut mpc = match PredictiveController::for_tracking(
        a.clone(),
        b.clone(),
        dmatrix![QREF],
        dmatrix![R],
        z,
        reference.clone(),
        SEQ,
        dvector![0.0, 1.0],
        VMAX,
        dvector![1.0],
        5.0,
    ) {
        Ok(mpc) => mpc,
        Err(e) => {
            eprintln!("invalid controller setup: {e}");
            return;
        }
    };

    if let Err(e) = mpc.change_horizon_length(NH) {
        eprintln!("{e}");
        return;
    }

    let mut x = DVector::from_vec(vec![0.0, 0.0]);
    let mut states = DMatrix::zeros(NX, STEPS + 1);
    let mut inputs = DMatrix::zeros(NU, STEPS);
    states.set_column(0, &x);

    let mut infeasible = 0;
    for k in 1..=STEPS {
        let belief = GaussianBelief::dirac(x.clone());
        let seq = match mpc.compute_control_sequence(&belief, 0, k) {
            Ok(seq) => seq,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        };
        if !seq.is_feasible() {
            infeasible += 1;
        }

        let u = seq.input_at(0);
        if let Ok(e) = mpc.deviation_from_ref_for_state(&x, k) {
            debug!(
                "At step {k:3} ({:?}), tracking error {:+.4}, v = {:+.4}",
                mpc.last_status(),
                e[0],
                x[1],
            );
        }

        // Iterate simulation
        x = &a * x + &b * &u;
        states.set_column(k, &x);
        inputs.set_column(k - 1, &u);
    }

    match mpc.compute_costs(&states, &inputs) {
        Ok(cost) => println!("Closed-loop cost over {STEPS} steps: {cost:.4}"),
        Err(e) => eprintln!("{e}"),
    }
    println!("Infeasible steps: {infeasible}");
}

const DT: f64 = 0.1;

#[rustfmt::skip]
const A: [f64; 4] = [
    1.0, DT,
    0.0, 1.0,
];

#[rustfmt::skip]
const B: [f64; 2] = [
    0.5 * DT * DT,
    DT,
];

const QREF: f64 = 10.0;
const R: f64 = 0.1;
