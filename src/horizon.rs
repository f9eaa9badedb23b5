#![allow(non_snake_case)]

use log::debug;
use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField, convert};

use crate::constraint::LinearConstraint;
use crate::error::{ControlError, ControlResult};
use crate::riccati::{JumpModel, backward_pass};
use crate::system::{LinearSystem, symmetrize};

// Default settings
const DEFAULT_RHO: f64 = 1.0;
const DEFAULT_ABS_PRI_TOL: f64 = 1e-6;
const DEFAULT_ABS_DUA_TOL: f64 = 1e-6;
const DEFAULT_MAX_ITER: usize = 5000;
const DEFAULT_CHECK_TERMINATION: usize = 1;
const DEFAULT_EN_STATE_BOUND: bool = true;
const DEFAULT_EN_INPUT_BOUND: bool = true;
const DEFAULT_FEASIBILITY_TOL: f64 = 1e-9;

/// Finite-horizon QP over `N` input moves with one linear state and one
/// linear input inequality per stage.
///
/// Solved either in closed form (when the unconstrained optimum already
/// satisfies every inequality) or by ADMM, see [`crate::admm`].
#[derive(Debug)]
pub struct HorizonSolver<F: Scalar> {
    pub solution: HorizonSolution<F>,
    pub settings: HorizonSettings<F>,
    pub(crate) cache: Option<HorizonCache<F>>,
    pub(crate) work: HorizonWorkspace<F>,
}

/// How the last solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// No solve has run yet
    Unsolved,
    /// The unconstrained optimum was feasible and returned directly
    Unconstrained,
    /// ADMM residuals dropped below tolerance
    Converged,
    /// ADMM hit `max_iter`; treated like infeasibility
    MaxIterations,
    /// The initial state already violates the state constraint
    InfeasibleInitialState,
    /// A constraint with zero weighting and negative bound
    EmptyConstraint,
    /// A factorisation failed
    NumericalFailure,
}

impl SolveStatus {
    pub fn is_solved(self) -> bool {
        matches!(self, SolveStatus::Unconstrained | SolveStatus::Converged)
    }
}

/// Solution
#[derive(Debug)]
pub struct HorizonSolution<F: Scalar> {
    pub iter: usize,
    pub status: SolveStatus,
    pub x: DMatrix<F>, // Nx * N+1
    pub u: DMatrix<F>, // Nu * N
}

/// Time-varying Riccati factorisation of the rho-augmented costs.
///
/// Depends only on the dynamics, costs, horizon and rho; constraints and
/// references enter through the linear terms and never dirty it.
#[derive(Debug)]
pub struct HorizonCache<F: Scalar> {
    pub rho: F,
    /// Stage gains `K_k`
    pub K: Vec<DMatrix<F>>, // N x (Nu * Nx)

    /// `(R + rho I + B' P_{k+1} B)^-1`
    pub Quu_inv: Vec<DMatrix<F>>, // N x (Nu * Nu)

    /// Precomputed `(A - B * K_k)^T`
    pub AmBKt: Vec<DMatrix<F>>, // N x (Nx * Nx)
}

impl<F> HorizonCache<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// `None` when an input Hessian block is not invertible.
    pub fn new(
        Adyn: &DMatrix<F>, // Nx * Nx
        Bdyn: &DMatrix<F>, // Nx * Nu
        Q: &DMatrix<F>,    // Nx * Nx
        R: &DMatrix<F>,    // Nu * Nu
        N: usize,
        rho: F,
    ) -> Option<Self> {
        let Nx = Adyn.nrows();
        let Nu = Bdyn.ncols();

        // Update by adding rho * identity matrix to Q, R
        let Q1 = Q + DMatrix::<F>::identity(Nx, Nx).scale(rho);
        let R1 = R + DMatrix::<F>::identity(Nu, Nu).scale(rho);

        debug!("A = {}", Adyn);
        debug!("B = {}", Bdyn);
        debug!("Q = {}", Q1);
        debug!("R = {}", R1);
        debug!("rho = {} ", rho);

        let At = Adyn.transpose();
        let Bt = Bdyn.transpose();

        let mut K = Vec::with_capacity(N);
        let mut Quu_inv = Vec::with_capacity(N);
        let mut AmBKt = Vec::with_capacity(N);

        // terminal cost uses the stage state cost
        let mut Ptp1 = Q1.clone();
        for _ in (0..N).rev() {
            let Quu_inv_k = symmetrize(&(&R1 + &Bt * &Ptp1 * Bdyn)).try_inverse()?;
            let K_k = &Quu_inv_k * &Bt * &Ptp1 * Adyn;
            let AmBK = Adyn - Bdyn * &K_k;
            let P_k = symmetrize(&(&Q1 + &At * &Ptp1 * &AmBK));

            AmBKt.push(AmBK.transpose());
            K.push(K_k);
            Quu_inv.push(Quu_inv_k);
            Ptp1 = P_k;
        }
        K.reverse();
        Quu_inv.reverse();
        AmBKt.reverse();

        if let Some(K0) = K.first() {
            debug!("K_0 = {}", K0);
        }
        debug!("Precomputation finished!");

        Some(Self {
            rho,
            K,
            Quu_inv,
            AmBKt,
        })
    }
}

/// User settings
///
/// The residual tolerances are absolute. With the defaults a constrained plan
/// usually lands within about `10 * abs_pri_tol` of the exact QP optimum;
/// badly scaled problems (tiny `Q`, `R` against `rho`) need tighter values.
#[derive(Debug, Clone)]
pub struct HorizonSettings<F> {
    pub rho: F,
    pub abs_pri_tol: F,
    pub abs_dua_tol: F,
    pub max_iter: usize,
    pub check_termination: usize,
    pub en_state_bound: bool,
    pub en_input_bound: bool,
    /// Slack granted when checking the initial state and the unconstrained optimum
    pub feasibility_tol: F,
}

impl<F> Default for HorizonSettings<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn default() -> Self {
        Self {
            rho: convert(DEFAULT_RHO),
            abs_pri_tol: convert(DEFAULT_ABS_PRI_TOL),
            abs_dua_tol: convert(DEFAULT_ABS_DUA_TOL),
            max_iter: DEFAULT_MAX_ITER,
            check_termination: DEFAULT_CHECK_TERMINATION,
            en_state_bound: DEFAULT_EN_STATE_BOUND,
            en_input_bound: DEFAULT_EN_INPUT_BOUND,
            feasibility_tol: convert(DEFAULT_FEASIBILITY_TOL),
        }
    }
}

/// Problem variables
#[derive(Debug)]
pub struct HorizonWorkspace<F: Scalar> {
    pub(crate) Nx: usize, // Number of states
    pub(crate) Nu: usize, // Number of control inputs
    pub(crate) N: usize,  // Number of input moves in the horizon

    // State and inputs
    pub(crate) x: DMatrix<F>, // Nx * N+1
    pub(crate) u: DMatrix<F>, // Nu * N

    // Linear cost terms
    pub(crate) q: DMatrix<F>, // Nx * N+1
    pub(crate) r: DMatrix<F>, // Nu * N

    // Riccati backward pass terms
    pub(crate) p: DMatrix<F>, // Nx * N+1
    pub(crate) d: DMatrix<F>, // Nu * N

    // Auxiliary variables
    pub(crate) v: DMatrix<F>,    // Nx * N+1
    pub(crate) vnew: DMatrix<F>, // Nx * N+1
    pub(crate) z: DMatrix<F>,    // Nu * N
    pub(crate) znew: DMatrix<F>, // Nu * N

    // Dual variables
    pub(crate) g: DMatrix<F>, // Nx * N+1
    pub(crate) y: DMatrix<F>, // Nu * N

    // Q, R, A, B given by user
    pub(crate) Q: DMatrix<F>,    // Nx * Nx
    pub(crate) R: DMatrix<F>,    // Nu * Nu
    pub(crate) Adyn: DMatrix<F>, // Nx * Nx
    pub(crate) Bdyn: DMatrix<F>, // Nx * Nu

    // One half-space per stage, shared by all stages
    pub(crate) x_con: LinearConstraint<F>,
    pub(crate) u_con: LinearConstraint<F>,

    /// Linear state weightings `x'Q x - 2 w_k' x` for one horizon, zero when regulating
    pub(crate) ref_weightings: DMatrix<F>, // Nx * N+1

    /// Variables for keeping track of solve status
    pub(crate) primal_residual_state: F,
    pub(crate) primal_residual_input: F,
    pub(crate) dual_residual_state: F,
    pub(crate) dual_residual_input: F,
    pub(crate) iter: usize,
}

impl<F> HorizonWorkspace<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn resize(&mut self, N: usize) {
        let (Nx, Nu) = (self.Nx, self.Nu);
        self.N = N;
        self.x = DMatrix::zeros(Nx, N + 1);
        self.u = DMatrix::zeros(Nu, N);
        self.q = DMatrix::zeros(Nx, N + 1);
        self.r = DMatrix::zeros(Nu, N);
        self.p = DMatrix::zeros(Nx, N + 1);
        self.d = DMatrix::zeros(Nu, N);
        self.v = DMatrix::zeros(Nx, N + 1);
        self.vnew = DMatrix::zeros(Nx, N + 1);
        self.z = DMatrix::zeros(Nu, N);
        self.znew = DMatrix::zeros(Nu, N);
        self.g = DMatrix::zeros(Nx, N + 1);
        self.y = DMatrix::zeros(Nu, N);
        self.ref_weightings = DMatrix::zeros(Nx, N + 1);
    }
}

impl<F> HorizonSolver<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Creates a new [`HorizonSolver<F>`].
    ///
    /// ## Arguments
    /// - `system`: state space model `A`, `B`
    /// - `Q`: state penalty, already mapped to the full state when tracking an output
    /// - `R`: input penalty
    /// - `N`: number of input moves in the horizon
    ///
    /// Both constraints start out unbounded.
    #[must_use]
    pub fn new(system: &LinearSystem<F>, Q: DMatrix<F>, R: DMatrix<F>, N: usize) -> Self {
        let Nx = system.dim_state();
        let Nu = system.dim_input();

        let mut work = HorizonWorkspace::<F> {
            Nx,
            Nu,
            N,
            x: DMatrix::zeros(0, 0),
            u: DMatrix::zeros(0, 0),
            q: DMatrix::zeros(0, 0),
            r: DMatrix::zeros(0, 0),
            p: DMatrix::zeros(0, 0),
            d: DMatrix::zeros(0, 0),
            v: DMatrix::zeros(0, 0),
            vnew: DMatrix::zeros(0, 0),
            z: DMatrix::zeros(0, 0),
            znew: DMatrix::zeros(0, 0),
            g: DMatrix::zeros(0, 0),
            y: DMatrix::zeros(0, 0),
            Q,
            R,
            Adyn: system.A.clone(),
            Bdyn: system.B.clone(),
            x_con: LinearConstraint::unbounded(Nx),
            u_con: LinearConstraint::unbounded(Nu),
            ref_weightings: DMatrix::zeros(0, 0),
            primal_residual_state: F::zero(),
            primal_residual_input: F::zero(),
            dual_residual_state: F::zero(),
            dual_residual_input: F::zero(),
            iter: 0,
        };
        work.resize(N);

        Self {
            solution: HorizonSolution {
                iter: 0,
                status: SolveStatus::Unsolved,
                x: DMatrix::zeros(Nx, N + 1),
                u: DMatrix::zeros(Nu, N),
            },
            settings: HorizonSettings::default(),
            cache: None,
            work,
        }
    }

    pub fn horizon(&self) -> usize {
        self.work.N
    }

    /// Change the number of input moves; drops the cached factorisation.
    pub fn set_horizon(&mut self, N: usize) {
        if N == self.work.N {
            return;
        }
        self.work.resize(N);
        self.solution.x = DMatrix::zeros(self.work.Nx, N + 1);
        self.solution.u = DMatrix::zeros(self.work.Nu, N);
        self.invalidate_cache();
    }

    pub fn invalidate_cache(&mut self) {
        if self.cache.take().is_some() {
            debug!("Horizon cache invalidated");
        }
    }

    pub fn is_cache_valid(&self) -> bool {
        self.cache
            .as_ref()
            .is_some_and(|c| c.rho == self.settings.rho && c.K.len() == self.work.N)
    }

    pub fn set_state_constraint(&mut self, con: LinearConstraint<F>) {
        self.work.x_con = con;
    }

    pub fn set_input_constraint(&mut self, con: LinearConstraint<F>) {
        self.work.u_con = con;
    }

    pub fn state_constraint(&self) -> &LinearConstraint<F> {
        &self.work.x_con
    }

    pub fn input_constraint(&self) -> &LinearConstraint<F> {
        &self.work.u_con
    }

    /// Linear state weightings for stages `0..=N`; zero drives the state to the origin.
    pub fn set_ref_weightings(&mut self, ref_weightings: DMatrix<F>) -> ControlResult<()> {
        let expected = (self.work.Nx, self.work.N + 1);
        if ref_weightings.shape() != expected {
            return Err(ControlError::InvalidReferenceTrajectory(format!(
                "expected {}x{} weightings, got {}x{}",
                expected.0,
                expected.1,
                ref_weightings.nrows(),
                ref_weightings.ncols()
            )));
        }
        self.work.ref_weightings = ref_weightings;
        Ok(())
    }

    pub fn get_num_iters(&self) -> usize {
        self.work.iter
    }

    /// Get the predicted state `x` at stage `i`
    pub fn get_x_at(&self, i: usize) -> DVector<F> {
        self.solution.x.column(i).into()
    }

    /// Get the planned input `u` at stage `i`
    pub fn get_u_at(&self, i: usize) -> DVector<F> {
        self.solution.u.column(i).into()
    }

    /// Get reference to matrix containing input predictions
    pub fn get_u_matrix(&self) -> &DMatrix<F> {
        &self.solution.u
    }

    fn x_satisfied(&self, x: &DVector<F>) -> bool {
        !self.settings.en_state_bound
            || self.work.x_con.is_satisfied(x, self.settings.feasibility_tol)
    }

    fn u_satisfied(&self, u: &DVector<F>) -> bool {
        !self.settings.en_input_bound
            || self.work.u_con.is_satisfied(u, self.settings.feasibility_tol)
    }

    /// Closed-form optimum without inequalities, from the Riccati kernel.
    fn unconstrained_rollout(&self, x0: &DVector<F>) -> Option<(DMatrix<F>, DMatrix<F>)> {
        let w = &self.work;
        let system = LinearSystem {
            A: w.Adyn.clone(),
            B: w.Bdyn.clone(),
        };
        let model = JumpModel::new(
            vec![system],
            vec![w.Q.clone()],
            vec![w.R.clone()],
            DMatrix::identity(1, 1),
            w.Q.clone(),
            w.ref_weightings.clone(),
        )
        .ok()?;
        let tables = backward_pass(&model, w.N).ok()?;

        let mut x = DMatrix::zeros(w.Nx, w.N + 1);
        let mut u = DMatrix::zeros(w.Nu, w.N);
        x.set_column(0, x0);
        for k in 0..w.N {
            let xk: DVector<F> = x.column(k).into();
            let uk = tables.control_input(k, 0, &xk);
            x.set_column(k + 1, &(&w.Adyn * &xk + &w.Bdyn * &uk));
            u.set_column(k, &uk);
        }
        Some((x, u))
    }

    fn finish(&mut self, status: SolveStatus) -> SolveStatus {
        self.solution.status = status;
        self.solution.iter = self.work.iter;
        status
    }

    /// # Solve the finite-horizon problem from `x0`
    ///
    /// Never fails: infeasibility and non-convergence are reported through
    /// the returned [`SolveStatus`], and the planned inputs are only
    /// meaningful when [`SolveStatus::is_solved`] holds.
    pub fn solve(&mut self, x0: &DVector<F>) -> SolveStatus {
        self.work.iter = 0;

        let con_empty = (self.settings.en_state_bound && self.work.x_con.is_empty())
            || (self.settings.en_input_bound && self.work.u_con.is_empty());
        if con_empty {
            return self.finish(SolveStatus::EmptyConstraint);
        }
        if !self.x_satisfied(x0) {
            debug!(
                "Initial state violates the state constraint by {}",
                self.work.x_con.violation(x0)
            );
            return self.finish(SolveStatus::InfeasibleInitialState);
        }

        let Some((x, u)) = self.unconstrained_rollout(x0) else {
            return self.finish(SolveStatus::NumericalFailure);
        };

        let feasible = x.column_iter().all(|xk| self.x_satisfied(&xk.into_owned()))
            && u.column_iter().all(|uk| self.u_satisfied(&uk.into_owned()));
        if feasible {
            debug!("Unconstrained optimum is feasible, skipping ADMM");
            self.solution.x = x;
            self.solution.u = u;
            return self.finish(SolveStatus::Unconstrained);
        }

        if !self.is_cache_valid() {
            let w = &self.work;
            self.cache =
                HorizonCache::new(&w.Adyn, &w.Bdyn, &w.Q, &w.R, w.N, self.settings.rho);
            if self.cache.is_none() {
                return self.finish(SolveStatus::NumericalFailure);
            }
        }

        // warm start from the unconstrained optimum
        self.work.x = x;
        self.work.u = u;
        let status = if self.admm_solve() {
            SolveStatus::Converged
        } else {
            SolveStatus::MaxIterations
        };
        self.finish(status)
    }
}
