#![allow(non_snake_case)]

//! Backward Riccati recursion for finite-horizon tracking on Markov jump
//! linear systems.
//!
//! The cost-to-go of mode `i` at stage `k` is kept as `x'K x - 2 sigma'x`.
//! Each stage mixes the per-mode quantities of stage `k+1` through the
//! transition matrix row of the current mode, so the resulting law
//! `u = L x + feedforward` is optimal in expectation over the next mode.

use log::debug;
use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField, convert};

use crate::error::{ControlError, ControlResult};
use crate::system::{LinearSystem, all_finite, symmetrize};

/// Row sums of the transition matrix must be within this of one.
const STOCHASTIC_TOL: f64 = 1e-9;

/// Everything one backward pass consumes.
#[derive(Debug, Clone)]
pub struct JumpModel<F: Scalar> {
    systems: Vec<LinearSystem<F>>,
    Q: Vec<DMatrix<F>>,          // Nx * Nx per mode
    R: Vec<DMatrix<F>>,          // Nu * Nu per mode
    transition: DMatrix<F>,      // modes * modes, row-stochastic
    terminal: DMatrix<F>,        // Nx * Nx, shared by all modes
    ref_weightings: DMatrix<F>,  // Nx * (N + 1)
}

impl<F> JumpModel<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Checks shapes, finiteness and that the transition matrix is row-stochastic.
    ///
    /// Input costs only need to be square: singular blocks are handled by the
    /// pseudoinverse during the recursion.
    pub fn new(
        systems: Vec<LinearSystem<F>>,
        Q: Vec<DMatrix<F>>,
        R: Vec<DMatrix<F>>,
        transition: DMatrix<F>,
        terminal: DMatrix<F>,
        ref_weightings: DMatrix<F>,
    ) -> ControlResult<Self> {
        let invalid = |msg: String| Err(ControlError::InvalidJumpModel(msg));

        let modes = systems.len();
        let Some(first) = systems.first() else {
            return invalid("at least one mode is required".into());
        };
        let (Nx, Nu) = (first.dim_state(), first.dim_input());

        if Q.len() != modes || R.len() != modes {
            return invalid(format!(
                "{} state costs and {} input costs for {modes} modes",
                Q.len(),
                R.len()
            ));
        }
        for i in 0..modes {
            if systems[i].dim_state() != Nx || systems[i].dim_input() != Nu {
                return invalid(format!("mode {i} does not match the dimensions of mode 0"));
            }
            if Q[i].shape() != (Nx, Nx) || !all_finite(&Q[i]) {
                return invalid(format!("state cost of mode {i} must be a finite {Nx}x{Nx} matrix"));
            }
            if R[i].shape() != (Nu, Nu) || !all_finite(&R[i]) {
                return invalid(format!("input cost of mode {i} must be a finite {Nu}x{Nu} matrix"));
            }
        }

        if transition.shape() != (modes, modes) || !all_finite(&transition) {
            return invalid(format!("transition matrix must be a finite {modes}x{modes} matrix"));
        }
        for (j, row) in transition.row_iter().enumerate() {
            if row.iter().any(|p| *p < F::zero())
                || (row.sum() - F::one()).abs() > convert(STOCHASTIC_TOL)
            {
                return invalid(format!("transition matrix row {j} is not a distribution"));
            }
        }

        if terminal.shape() != (Nx, Nx) || !all_finite(&terminal) {
            return invalid(format!("terminal cost must be a finite {Nx}x{Nx} matrix"));
        }
        if ref_weightings.nrows() != Nx || ref_weightings.ncols() == 0 || !all_finite(&ref_weightings)
        {
            return invalid(format!(
                "reference weightings must be finite with {Nx} rows and one column per stage"
            ));
        }

        Ok(Self {
            systems,
            Q,
            R,
            transition,
            terminal,
            ref_weightings,
        })
    }

    pub fn num_modes(&self) -> usize {
        self.systems.len()
    }

    pub fn dim_state(&self) -> usize {
        self.systems[0].dim_state()
    }

    pub fn dim_input(&self) -> usize {
        self.systems[0].dim_input()
    }

    /// Horizon implied by the reference weightings (one column per stage plus terminal).
    pub fn horizon(&self) -> usize {
        self.ref_weightings.ncols() - 1
    }
}

/// Optimal affine law of one mode at one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeGains<F: Scalar> {
    pub L: DMatrix<F>,              // Nu * Nx
    pub feedforward: DVector<F>,    // Nu
}

/// Cost-to-go slot carried from stage `k+1` to stage `k`.
#[derive(Debug, Clone)]
struct CostToGo<F: Scalar> {
    K: DMatrix<F>,
    sigma: DVector<F>,
}

/// Quantities of one candidate next mode, before transition mixing.
struct Propagated<F: Scalar> {
    QAKA: DMatrix<F>,
    RBKB: DMatrix<F>,
    BKA: DMatrix<F>,
    Asigma: DVector<F>,
    Bsigma: DVector<F>,
}

/// Gains and feed-forward terms for every stage and mode.
#[derive(Debug, Clone)]
pub struct RiccatiTables<F: Scalar> {
    stages: Vec<Vec<ModeGains<F>>>, // [stage][mode]
}

impl<F> RiccatiTables<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn horizon(&self) -> usize {
        self.stages.len()
    }

    pub fn num_modes(&self) -> usize {
        self.stages.first().map_or(0, Vec::len)
    }

    /// All modes of one stage, `None` past the horizon.
    pub fn stage(&self, k: usize) -> Option<&[ModeGains<F>]> {
        self.stages.get(k).map(Vec::as_slice)
    }

    /// # Panics
    /// If `k >= horizon()` or `mode >= num_modes()`.
    pub fn gain(&self, k: usize, mode: usize) -> &DMatrix<F> {
        &self.stages[k][mode].L
    }

    /// # Panics
    /// If `k >= horizon()` or `mode >= num_modes()`.
    pub fn feedforward(&self, k: usize, mode: usize) -> &DVector<F> {
        &self.stages[k][mode].feedforward
    }

    /// `u = L_{k,mode} x + feedforward_{k,mode}`
    ///
    /// # Panics
    /// If `k >= horizon()` or `mode >= num_modes()`, or if `x` has the wrong length.
    pub fn control_input(&self, k: usize, mode: usize, x: &DVector<F>) -> DVector<F> {
        let gains = &self.stages[k][mode];
        &gains.L * x + &gains.feedforward
    }
}

fn pinv<F>(m: DMatrix<F>) -> ControlResult<DMatrix<F>>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    // Same cut-off as the usual max(rows, cols) * sigma_max * eps rule.
    let dim: F = convert(m.nrows().max(m.ncols()) as f64);
    let svd = m.svd(true, true);
    let sigma_max = if svd.singular_values.is_empty() {
        F::zero()
    } else {
        svd.singular_values.max()
    };
    svd.pseudo_inverse(dim * sigma_max * convert(f64::EPSILON))
        .map_err(|e| ControlError::LinAlg(e.into()))
}

/// Run the backward recursion over `horizon` stages.
///
/// Stages are processed strictly from `horizon - 1` down to `0`; within a
/// stage every mode is independent.
pub fn backward_pass<F>(model: &JumpModel<F>, horizon: usize) -> ControlResult<RiccatiTables<F>>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    if horizon == 0 {
        return Err(ControlError::InvalidJumpModel("horizon must be positive".into()));
    }
    if model.ref_weightings.ncols() != horizon + 1 {
        return Err(ControlError::InvalidJumpModel(format!(
            "expected {} reference weighting columns for horizon {horizon}, got {}",
            horizon + 1,
            model.ref_weightings.ncols()
        )));
    }

    let modes = model.num_modes();
    let (Nx, Nu) = (model.dim_state(), model.dim_input());

    // K_N and sigma_N are the same for every mode
    let mut next: Vec<CostToGo<F>> = vec![
        CostToGo {
            K: model.terminal.clone(),
            sigma: model.ref_weightings.column(horizon).into(),
        };
        modes
    ];

    let mut stages = Vec::with_capacity(horizon);
    for k in (0..horizon).rev() {
        let propagated: Vec<Propagated<F>> = model
            .systems
            .iter()
            .zip(next.iter())
            .enumerate()
            .map(|(i, (sys, ctg))| {
                let At = sys.A.transpose();
                let Bt = sys.B.transpose();
                let BtK = &Bt * &ctg.K;
                Propagated {
                    QAKA: &model.Q[i] + symmetrize(&(&At * &ctg.K * &sys.A)),
                    RBKB: &model.R[i] + symmetrize(&(&BtK * &sys.B)),
                    BKA: &BtK * &sys.A,
                    Asigma: &At * &ctg.sigma,
                    Bsigma: &Bt * &ctg.sigma,
                }
            })
            .collect();

        let mut current = Vec::with_capacity(modes);
        let mut gains = Vec::with_capacity(modes);
        for j in 0..modes {
            let mut P1 = DMatrix::zeros(Nx, Nx);
            let mut P2 = DMatrix::zeros(Nu, Nx);
            let mut P3 = DMatrix::zeros(Nu, Nu);
            let mut s1 = DVector::zeros(Nx);
            let mut s2 = DVector::zeros(Nu);

            for (m, p) in propagated.iter().enumerate() {
                let w = model.transition[(j, m)];
                if w == F::zero() {
                    continue;
                }
                P1 += p.QAKA.scale(w);
                P2 += p.BKA.scale(w);
                P3 += p.RBKB.scale(w);
                s1 += p.Asigma.scale(w);
                s2 += p.Bsigma.scale(w);
            }

            let P3_pinv = pinv(P3)?;
            let P2t = P2.transpose();
            let ff = &P3_pinv * &s2;

            current.push(CostToGo {
                K: P1 - symmetrize(&(&P2t * &P3_pinv * &P2)),
                sigma: model.ref_weightings.column(k) + s1 - &P2t * &ff,
            });
            gains.push(ModeGains {
                L: -(&P3_pinv * &P2),
                feedforward: ff,
            });
        }

        stages.push(gains);
        next = current;
    }
    stages.reverse();

    debug!("Riccati backward pass finished: {horizon} stages, {modes} modes");

    Ok(RiccatiTables { stages })
}
