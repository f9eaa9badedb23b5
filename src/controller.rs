#![allow(non_snake_case)]

//! Predictive controller facade used by the simulation loop.
//!
//! Two named constructors replace the positional overloads of a tracking and
//! a regulation controller:
//! - [`PredictiveController::for_regulation`] drives the state to the origin
//!   under `Q`,
//! - [`PredictiveController::for_tracking`] drives `Z x` along a reference
//!   trajectory under `Qref`.
//!
//! Every open-loop plan covers `horizon_length` steps, of which only the first
//! `sequence_length` moves are handed back for transmission.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField};

use crate::constraint::LinearConstraint;
use crate::error::{ControlError, ControlResult};
use crate::horizon::{HorizonSettings, HorizonSolver, SolveStatus};
use crate::system::{CostSpec, LinearSystem, all_finite};

/// Probabilistic estimate of the current state, supplied by an external estimator.
pub trait StateBelief<F: Scalar> {
    fn mean(&self) -> DVector<F>;

    /// Not used by the mean-value solve.
    fn covariance(&self) -> DMatrix<F>;
}

/// Belief summarised by mean and covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianBelief<F: Scalar> {
    mean: DVector<F>,
    covariance: DMatrix<F>,
}

impl<F> GaussianBelief<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(mean: DVector<F>, covariance: DMatrix<F>) -> ControlResult<Self> {
        let n = mean.len();
        if covariance.shape() != (n, n) {
            return Err(ControlError::InvalidStateDimension {
                expected: n,
                got: covariance.nrows(),
            });
        }
        Ok(Self { mean, covariance })
    }

    /// Point mass at `mean`.
    pub fn dirac(mean: DVector<F>) -> Self {
        let n = mean.len();
        Self {
            mean,
            covariance: DMatrix::zeros(n, n),
        }
    }
}

impl<F> StateBelief<F> for GaussianBelief<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn mean(&self) -> DVector<F> {
        self.mean.clone()
    }

    fn covariance(&self) -> DMatrix<F> {
        self.covariance.clone()
    }
}

/// Outcome of one planning cycle.
///
/// Both variants carry `dim_u * sequence_length` stacked inputs, ordered
/// input block by stage. The infeasible fallback is all zeros.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSequence<F: Scalar> {
    Solved { inputs: DVector<F>, dim_u: usize },
    Infeasible { fallback: DVector<F>, dim_u: usize },
}

impl<F> ControlSequence<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn infeasible(dim_u: usize, sequence_length: usize) -> Self {
        ControlSequence::Infeasible {
            fallback: DVector::zeros(dim_u * sequence_length),
            dim_u,
        }
    }

    pub fn is_feasible(&self) -> bool {
        matches!(self, ControlSequence::Solved { .. })
    }

    /// The stacked inputs, whichever variant this is.
    pub fn inputs(&self) -> &DVector<F> {
        match self {
            ControlSequence::Solved { inputs, .. } => inputs,
            ControlSequence::Infeasible { fallback, .. } => fallback,
        }
    }

    /// Consume the sequence, keeping only the stacked inputs.
    pub fn into_inputs(self) -> DVector<F> {
        match self {
            ControlSequence::Solved { inputs, .. } => inputs,
            ControlSequence::Infeasible { fallback, .. } => fallback,
        }
    }

    fn dim_u(&self) -> usize {
        match self {
            ControlSequence::Solved { dim_u, .. } | ControlSequence::Infeasible { dim_u, .. } => {
                *dim_u
            }
        }
    }

    /// Number of moves in the sequence.
    pub fn len(&self) -> usize {
        self.inputs().len() / self.dim_u()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k`-th move.
    ///
    /// # Panics
    /// If `k >= self.len()`.
    pub fn input_at(&self, k: usize) -> DVector<F> {
        let dim_u = self.dim_u();
        self.inputs().rows(k * dim_u, dim_u).into_owned()
    }
}

#[derive(Debug, Clone)]
enum Objective<F: Scalar> {
    /// Implicit reference is the origin
    Regulation,
    /// `Z x` follows `reference`, one column per time step
    Tracking {
        Z: DMatrix<F>,         // p * Nx
        reference: DMatrix<F>, // p * T
    },
}

#[derive(Clone, Copy)]
enum ConstraintKind {
    State,
    Input,
}

fn validate_constraint<F>(
    weighting: DVector<F>,
    bound: F,
    dim: usize,
    kind: ConstraintKind,
) -> ControlResult<LinearConstraint<F>>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    let weighting_err = |msg: String| match kind {
        ConstraintKind::State => ControlError::InvalidStateWeightings(msg),
        ConstraintKind::Input => ControlError::InvalidInputWeightings(msg),
    };
    if weighting.len() != dim {
        return Err(weighting_err(format!(
            "expected a vector of length {dim}, got {}",
            weighting.len()
        )));
    }
    if !weighting.iter().all(|w| w.is_finite()) {
        return Err(weighting_err("entries must be finite".into()));
    }
    LinearConstraint::new(weighting, bound).ok_or(match kind {
        ConstraintKind::State => ControlError::InvalidStateConstraints,
        ConstraintKind::Input => ControlError::InvalidInputConstraints,
    })
}

/// Finite-horizon predictive controller with one linear state and one linear
/// input constraint, replicated over the horizon.
#[derive(Debug)]
pub struct PredictiveController<F: Scalar> {
    system: LinearSystem<F>,
    cost: CostSpec<F>,
    objective: Objective<F>,
    sequence_length: usize,
    horizon_length: usize,
    solver: HorizonSolver<F>,
}

impl<F> PredictiveController<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Controller driving the state to the origin.
    ///
    /// The horizon starts out equal to `sequence_length`.
    #[allow(clippy::too_many_arguments)]
    pub fn for_regulation(
        A: DMatrix<F>,
        B: DMatrix<F>,
        Q: DMatrix<F>,
        R: DMatrix<F>,
        sequence_length: usize,
        state_weighting: DVector<F>,
        state_bound: F,
        input_weighting: DVector<F>,
        input_bound: F,
    ) -> ControlResult<Self> {
        let system = LinearSystem::new(A, B)?;
        let (Nx, Nu) = (system.dim_state(), system.dim_input());
        let cost = CostSpec::new(Q, R, Nx, Nu)?;
        let x_con = validate_constraint(state_weighting, state_bound, Nx, ConstraintKind::State)?;
        let u_con = validate_constraint(input_weighting, input_bound, Nu, ConstraintKind::Input)?;
        if sequence_length == 0 {
            return Err(ControlError::InvalidSequenceLength {
                got: sequence_length,
                max: usize::MAX,
            });
        }

        let Qx = cost.Q.clone();
        Ok(Self::assemble(
            system,
            cost,
            Objective::Regulation,
            Qx,
            sequence_length,
            x_con,
            u_con,
        ))
    }

    /// Controller steering `Z x` along `reference` (one column per time step,
    /// at least `sequence_length + 1` columns).
    #[allow(clippy::too_many_arguments)]
    pub fn for_tracking(
        A: DMatrix<F>,
        B: DMatrix<F>,
        Qref: DMatrix<F>,
        R: DMatrix<F>,
        Z: DMatrix<F>,
        reference: DMatrix<F>,
        sequence_length: usize,
        state_weighting: DVector<F>,
        state_bound: F,
        input_weighting: DVector<F>,
        input_bound: F,
    ) -> ControlResult<Self> {
        let system = LinearSystem::new(A, B)?;
        let (Nx, Nu) = (system.dim_state(), system.dim_input());
        if Z.ncols() != Nx || Z.nrows() == 0 || !all_finite(&Z) {
            return Err(ControlError::InvalidOutputMatrix(format!(
                "expected a finite p x {Nx} matrix, got {}x{}",
                Z.nrows(),
                Z.ncols()
            )));
        }
        let cost = CostSpec::new(Qref, R, Z.nrows(), Nu)?;
        let x_con = validate_constraint(state_weighting, state_bound, Nx, ConstraintKind::State)?;
        let u_con = validate_constraint(input_weighting, input_bound, Nu, ConstraintKind::Input)?;
        if sequence_length == 0 {
            return Err(ControlError::InvalidSequenceLength {
                got: sequence_length,
                max: usize::MAX,
            });
        }
        if reference.nrows() != Z.nrows() || !all_finite(&reference) {
            return Err(ControlError::InvalidReferenceTrajectory(format!(
                "expected finite columns of length {}, got {} rows",
                Z.nrows(),
                reference.nrows()
            )));
        }
        if reference.ncols() < sequence_length + 1 {
            return Err(ControlError::InvalidReferenceTrajectory(format!(
                "need at least {} time steps, got {}",
                sequence_length + 1,
                reference.ncols()
            )));
        }

        // Zt Qref Z puts the output cost on the full state
        let Qx = Z.transpose() * &cost.Q * &Z;
        Ok(Self::assemble(
            system,
            cost,
            Objective::Tracking { Z, reference },
            Qx,
            sequence_length,
            x_con,
            u_con,
        ))
    }

    fn assemble(
        system: LinearSystem<F>,
        cost: CostSpec<F>,
        objective: Objective<F>,
        Qx: DMatrix<F>,
        sequence_length: usize,
        x_con: LinearConstraint<F>,
        u_con: LinearConstraint<F>,
    ) -> Self {
        let mut solver = HorizonSolver::new(&system, Qx, cost.R.clone(), sequence_length);
        solver.set_state_constraint(x_con);
        solver.set_input_constraint(u_con);
        Self {
            system,
            cost,
            objective,
            sequence_length,
            horizon_length: sequence_length,
            solver,
        }
    }

    /// Always true: the controller consumes a belief, not a measurement.
    pub fn requires_external_state_estimate(&self) -> bool {
        true
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.objective, Objective::Tracking { .. })
    }

    pub fn dim_state(&self) -> usize {
        self.system.dim_state()
    }

    pub fn dim_input(&self) -> usize {
        self.system.dim_input()
    }

    pub fn horizon_length(&self) -> usize {
        self.horizon_length
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn settings(&self) -> &HorizonSettings<F> {
        &self.solver.settings
    }

    /// Changing `rho` invalidates the cached factorisation on the next solve.
    pub fn settings_mut(&mut self) -> &mut HorizonSettings<F> {
        &mut self.solver.settings
    }

    /// Status of the most recent solve.
    pub fn last_status(&self) -> SolveStatus {
        self.solver.solution.status
    }

    /// `(bound, weighting)` of the state constraint.
    pub fn state_constraints(&self) -> (F, &DVector<F>) {
        let con = self.solver.state_constraint();
        (con.bound(), con.weighting())
    }

    /// `(bound, weighting)` of the input constraint.
    pub fn input_constraints(&self) -> (F, &DVector<F>) {
        let con = self.solver.input_constraint();
        (con.bound(), con.weighting())
    }

    pub fn change_state_constraints(&mut self, weighting: DVector<F>, bound: F) -> ControlResult<()> {
        let con = validate_constraint(weighting, bound, self.dim_state(), ConstraintKind::State)?;
        self.solver.set_state_constraint(con);
        Ok(())
    }

    pub fn change_input_constraints(&mut self, weighting: DVector<F>, bound: F) -> ControlResult<()> {
        let con = validate_constraint(weighting, bound, self.dim_input(), ConstraintKind::Input)?;
        self.solver.set_input_constraint(con);
        Ok(())
    }

    /// Takes effect at the next control sequence request.
    pub fn change_sequence_length(&mut self, sequence_length: usize) -> ControlResult<()> {
        if sequence_length == 0 || sequence_length > self.horizon_length {
            return Err(ControlError::InvalidSequenceLength {
                got: sequence_length,
                max: self.horizon_length,
            });
        }
        self.sequence_length = sequence_length;
        Ok(())
    }

    /// The horizon may not drop below the sequence length, and when tracking
    /// the reference must cover `horizon_length + 1` time steps.
    pub fn change_horizon_length(&mut self, horizon_length: usize) -> ControlResult<()> {
        let invalid = |reason: String| ControlError::InvalidHorizonLength {
            got: horizon_length,
            reason,
        };
        if horizon_length == 0 {
            return Err(invalid("must be positive".into()));
        }
        if horizon_length < self.sequence_length {
            return Err(invalid(format!(
                "must not be shorter than the sequence length {}",
                self.sequence_length
            )));
        }
        if let Objective::Tracking { reference, .. } = &self.objective {
            if reference.ncols() < horizon_length + 1 {
                return Err(invalid(format!(
                    "reference trajectory covers only {} time steps",
                    reference.ncols()
                )));
            }
        }
        self.horizon_length = horizon_length;
        self.solver.set_horizon(horizon_length);
        Ok(())
    }

    fn check_timestep(&self, timestep: usize) -> ControlResult<()> {
        if timestep == 0 {
            return Err(ControlError::InvalidTimestep {
                got: timestep,
                reason: "time steps start at 1".into(),
            });
        }
        if let Objective::Tracking { reference, .. } = &self.objective {
            if timestep > reference.ncols() {
                return Err(ControlError::InvalidTimestep {
                    got: timestep,
                    reason: format!(
                        "reference trajectory has {} time steps",
                        reference.ncols()
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_state(&self, state: &DVector<F>) -> ControlResult<()> {
        if state.len() != self.dim_state() {
            return Err(ControlError::InvalidStateDimension {
                expected: self.dim_state(),
                got: state.len(),
            });
        }
        Ok(())
    }

    /// Linear state weightings `Z' Qref r` for the window starting at `timestep`;
    /// the last reference value is held past the end of the trajectory.
    fn ref_weightings(&self, timestep: usize) -> DMatrix<F> {
        let N = self.horizon_length;
        match &self.objective {
            Objective::Regulation => DMatrix::zeros(self.dim_state(), N + 1),
            Objective::Tracking { Z, reference } => {
                let ZtQ = Z.transpose() * &self.cost.Q;
                let last = reference.ncols() - 1;
                let mut weightings = DMatrix::zeros(self.dim_state(), N + 1);
                for k in 0..=N {
                    let col = (timestep - 1 + k).min(last);
                    weightings.set_column(k, &(&ZtQ * reference.column(col)));
                }
                weightings
            }
        }
    }

    /// Plan the next `sequence_length` moves from the mean of `belief`.
    ///
    /// `mode` is accepted for uniformity with jump-linear controllers and is
    /// not used. Infeasibility is not an error: it yields
    /// [`ControlSequence::Infeasible`] and a warning.
    pub fn compute_control_sequence(
        &mut self,
        belief: &impl StateBelief<F>,
        mode: usize,
        timestep: usize,
    ) -> ControlResult<ControlSequence<F>> {
        self.check_timestep(timestep)?;
        let x0 = belief.mean();
        self.check_state(&x0)?;

        let weightings = self.ref_weightings(timestep);
        self.solver.set_ref_weightings(weightings)?;

        let status = self.solver.solve(&x0);
        let Nu = self.dim_input();
        if !status.is_solved() {
            warn!("ProblemInfeasible: no feasible control sequence at timestep {timestep} ({status:?}), applying zero inputs");
            return Ok(ControlSequence::infeasible(Nu, self.sequence_length));
        }

        debug!(
            "Control sequence for timestep {timestep} (mode {mode}) solved: {status:?}, {} iterations",
            self.solver.get_num_iters()
        );
        let moves = self.solver.get_u_matrix().columns(0, self.sequence_length);
        Ok(ControlSequence::Solved {
            inputs: DVector::from_iterator(Nu * self.sequence_length, moves.iter().copied()),
            dim_u: Nu,
        })
    }

    /// `x` itself when regulating, `Z x - r(timestep)` when tracking.
    pub fn deviation_from_ref_for_state(
        &self,
        state: &DVector<F>,
        timestep: usize,
    ) -> ControlResult<DVector<F>> {
        self.check_timestep(timestep)?;
        self.check_state(state)?;
        Ok(match &self.objective {
            Objective::Regulation => state.clone(),
            Objective::Tracking { Z, reference } => Z * state - reference.column(timestep - 1),
        })
    }

    /// Quadratic cost of one stage.
    pub fn compute_stage_costs(
        &self,
        state: &DVector<F>,
        input: &DVector<F>,
        timestep: usize,
    ) -> ControlResult<F> {
        if input.len() != self.dim_input() {
            return Err(ControlError::InvalidInputDimension {
                expected: self.dim_input(),
                got: input.len(),
            });
        }
        let e = match &self.objective {
            Objective::Regulation => {
                self.check_state(state)?;
                state.clone()
            }
            Objective::Tracking { .. } => self.deviation_from_ref_for_state(state, timestep)?,
        };
        Ok(self.cost.evaluate(&e, input))
    }

    /// Stage costs over the trajectory plus a terminal state cost.
    ///
    /// Column `k` of the state trajectory is time step `k + 1`; the state
    /// trajectory must be exactly one column longer than the input trajectory.
    pub fn compute_costs(
        &self,
        state_trajectory: &DMatrix<F>,
        input_trajectory: &DMatrix<F>,
    ) -> ControlResult<F> {
        if state_trajectory.ncols() != input_trajectory.ncols() + 1 {
            return Err(ControlError::InvalidStateTrajectory {
                states: state_trajectory.ncols(),
                inputs: input_trajectory.ncols(),
            });
        }
        let mut total = F::zero();
        for (k, (x, u)) in state_trajectory
            .column_iter()
            .zip(input_trajectory.column_iter())
            .enumerate()
        {
            total += self.compute_stage_costs(&x.into_owned(), &u.into_owned(), k + 1)?;
        }

        let last = state_trajectory.ncols() - 1;
        let e = self.deviation_from_ref_for_state(
            &state_trajectory.column(last).into_owned(),
            last + 1,
        )?;
        Ok(total + e.dot(&(&self.cost.Q * &e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    fn regulation(sequence_length: usize) -> PredictiveController<f64> {
        PredictiveController::for_regulation(
            dmatrix![1.0, 0.1; 0.0, 1.0],
            dmatrix![0.0; 0.1],
            dmatrix![1.0, 0.0; 0.0, 0.5],
            dmatrix![0.1],
            sequence_length,
            dvector![1.0, 0.0],
            10.0,
            dvector![1.0],
            10.0,
        )
        .unwrap()
    }

    fn tracking(reference: DMatrix<f64>) -> PredictiveController<f64> {
        PredictiveController::for_tracking(
            DMatrix::identity(2, 2),
            dmatrix![1.0, 0.0; 0.0, 1.0],
            dmatrix![2.0],
            dmatrix![1.0, 0.0; 0.0, 1.0],
            dmatrix![1.0, 0.0],
            reference,
            3,
            dvector![0.0, 0.0],
            1.0,
            dvector![0.0, 0.0],
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn test_construction_defaults() {
        let ctrl = regulation(4);
        assert_eq!(ctrl.horizon_length(), 4);
        assert_eq!(ctrl.sequence_length(), 4);
        assert!(ctrl.requires_external_state_estimate());
        assert!(!ctrl.is_tracking());
        assert_eq!(ctrl.state_constraints(), (10.0, &dvector![1.0, 0.0]));
        assert_eq!(ctrl.input_constraints(), (10.0, &dvector![1.0]));
        assert_eq!(ctrl.last_status(), SolveStatus::Unsolved);
    }

    #[test]
    fn test_construction_validation_order() {
        let ok_q = dmatrix![1.0, 0.0; 0.0, 1.0];
        let build = |a: DMatrix<f64>,
                     b: DMatrix<f64>,
                     q: DMatrix<f64>,
                     r: DMatrix<f64>,
                     xw: DVector<f64>,
                     xc: f64,
                     uw: DVector<f64>,
                     uc: f64| {
            PredictiveController::for_regulation(a, b, q, r, 2, xw, xc, uw, uc).unwrap_err()
        };
        let eye = DMatrix::<f64>::identity(2, 2);
        let b = dmatrix![0.0; 1.0];

        // A is checked before anything else, even with a broken B
        let err = build(
            DMatrix::zeros(2, 3),
            DMatrix::zeros(5, 1),
            ok_q.clone(),
            dmatrix![1.0],
            dvector![1.0, 0.0],
            1.0,
            dvector![1.0],
            1.0,
        );
        assert!(matches!(err, ControlError::InvalidSystemMatrix(_)));

        let err = build(
            eye.clone(),
            dmatrix![1.0; 1.0; 1.0],
            ok_q.clone(),
            dmatrix![1.0],
            dvector![1.0, 0.0],
            1.0,
            dvector![1.0],
            1.0,
        );
        assert!(matches!(err, ControlError::InvalidInputMatrix(_)));

        let err = build(
            eye.clone(),
            b.clone(),
            dmatrix![1.0],
            dmatrix![1.0],
            dvector![1.0, 0.0],
            1.0,
            dvector![1.0],
            1.0,
        );
        assert!(matches!(err, ControlError::InvalidQMatrix(_)));

        let err = build(
            eye.clone(),
            b.clone(),
            dmatrix![-1.0, 0.0; 0.0, 1.0],
            dmatrix![1.0],
            dvector![1.0, 0.0],
            1.0,
            dvector![1.0],
            1.0,
        );
        assert!(matches!(err, ControlError::InvalidQMatrixPSD(_)));

        let err = build(
            eye.clone(),
            b.clone(),
            ok_q.clone(),
            dmatrix![f64::NAN],
            dvector![1.0, 0.0],
            1.0,
            dvector![1.0],
            1.0,
        );
        assert!(matches!(err, ControlError::InvalidRMatrix(_)));

        let err = build(
            eye.clone(),
            b.clone(),
            ok_q.clone(),
            dmatrix![-1.0],
            dvector![1.0, 0.0],
            1.0,
            dvector![1.0],
            1.0,
        );
        assert!(matches!(err, ControlError::InvalidRMatrixPD(_)));

        let err = build(
            eye.clone(),
            b.clone(),
            ok_q.clone(),
            dmatrix![1.0],
            dvector![1.0],
            1.0,
            dvector![1.0],
            1.0,
        );
        assert!(matches!(err, ControlError::InvalidStateWeightings(_)));

        let err = build(
            eye.clone(),
            b.clone(),
            ok_q.clone(),
            dmatrix![1.0],
            dvector![1.0, 0.0],
            1.0,
            dvector![1.0, 2.0],
            1.0,
        );
        assert!(matches!(err, ControlError::InvalidInputWeightings(_)));

        let err = build(
            eye.clone(),
            b.clone(),
            ok_q.clone(),
            dmatrix![1.0],
            dvector![1.0, 0.0],
            f64::NAN,
            dvector![1.0],
            1.0,
        );
        assert_eq!(err, ControlError::InvalidStateConstraints);

        let err = build(
            eye,
            b,
            ok_q,
            dmatrix![1.0],
            dvector![1.0, 0.0],
            1.0,
            dvector![1.0],
            f64::NAN,
        );
        assert_eq!(err, ControlError::InvalidInputConstraints);
    }

    #[test]
    fn test_tracking_validation() {
        let err = PredictiveController::for_tracking(
            DMatrix::<f64>::identity(2, 2),
            DMatrix::identity(2, 2),
            dmatrix![1.0],
            DMatrix::identity(2, 2),
            dmatrix![1.0, 0.0, 0.0],
            DMatrix::zeros(1, 4),
            3,
            dvector![0.0, 0.0],
            1.0,
            dvector![0.0, 0.0],
            1.0,
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::InvalidOutputMatrix(_)));

        // Qref is sized by the output, not the state
        let err = PredictiveController::for_tracking(
            DMatrix::<f64>::identity(2, 2),
            DMatrix::identity(2, 2),
            DMatrix::identity(2, 2),
            DMatrix::identity(2, 2),
            dmatrix![1.0, 0.0],
            DMatrix::zeros(1, 4),
            3,
            dvector![0.0, 0.0],
            1.0,
            dvector![0.0, 0.0],
            1.0,
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::InvalidQMatrix(_)));

        let err = PredictiveController::for_tracking(
            DMatrix::<f64>::identity(2, 2),
            DMatrix::identity(2, 2),
            dmatrix![1.0],
            DMatrix::identity(2, 2),
            dmatrix![1.0, 0.0],
            DMatrix::zeros(1, 3),
            3,
            dvector![0.0, 0.0],
            1.0,
            dvector![0.0, 0.0],
            1.0,
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::InvalidReferenceTrajectory(_)));
    }

    #[test]
    fn test_change_constraints() {
        let mut ctrl = regulation(3);
        ctrl.change_state_constraints(dvector![0.0, 1.0], 0.5).unwrap();
        assert_eq!(ctrl.state_constraints(), (0.5, &dvector![0.0, 1.0]));

        let err = ctrl.change_state_constraints(dvector![1.0], 0.5).unwrap_err();
        assert!(matches!(err, ControlError::InvalidStateWeightings(_)));
        // failed update leaves the previous constraint in place
        assert_eq!(ctrl.state_constraints(), (0.5, &dvector![0.0, 1.0]));

        ctrl.change_input_constraints(dvector![-1.0], 2.0).unwrap();
        assert_eq!(ctrl.input_constraints(), (2.0, &dvector![-1.0]));
        assert_eq!(
            ctrl.change_input_constraints(dvector![1.0], f64::NAN),
            Err(ControlError::InvalidInputConstraints)
        );
    }

    #[test]
    fn test_sequence_and_horizon_length() {
        let mut ctrl = regulation(3);
        assert!(matches!(
            ctrl.change_sequence_length(4),
            Err(ControlError::InvalidSequenceLength { got: 4, max: 3 })
        ));
        assert!(ctrl.change_sequence_length(0).is_err());

        ctrl.change_horizon_length(8).unwrap();
        assert_eq!(ctrl.horizon_length(), 8);
        assert_eq!(ctrl.sequence_length(), 3);

        for n in 1..=8 {
            ctrl.change_sequence_length(n).unwrap();
            assert_eq!(ctrl.state_constraints(), (10.0, &dvector![1.0, 0.0]));
            assert_eq!(ctrl.input_constraints(), (10.0, &dvector![1.0]));
        }
        assert!(ctrl.change_sequence_length(9).is_err());

        assert!(matches!(
            ctrl.change_horizon_length(5),
            Err(ControlError::InvalidHorizonLength { got: 5, .. })
        ));
        assert!(ctrl.change_horizon_length(0).is_err());
    }

    #[test]
    fn test_tracking_horizon_bounded_by_reference() {
        let mut ctrl = tracking(DMatrix::zeros(1, 6));
        ctrl.change_horizon_length(5).unwrap();
        assert!(matches!(
            ctrl.change_horizon_length(6),
            Err(ControlError::InvalidHorizonLength { got: 6, .. })
        ));
    }

    #[test]
    fn test_zero_state_gives_zero_sequence() {
        let mut ctrl = regulation(4);
        ctrl.change_horizon_length(7).unwrap();
        let belief = GaussianBelief::dirac(dvector![0.0, 0.0]);
        let seq = ctrl.compute_control_sequence(&belief, 0, 1).unwrap();
        assert!(seq.is_feasible());
        assert_eq!(seq.len(), 4);
        assert_eq!(seq.inputs().len(), 4);
        assert!(seq.inputs().iter().all(|u| u.abs() < 1e-12));
    }

    #[test]
    fn test_sequence_is_prefix_of_plan() {
        let mut ctrl = regulation(2);
        ctrl.change_horizon_length(6).unwrap();
        let belief = GaussianBelief::dirac(dvector![1.0, 0.0]);
        let short = ctrl.compute_control_sequence(&belief, 0, 1).unwrap();

        ctrl.change_sequence_length(6).unwrap();
        let full = ctrl.compute_control_sequence(&belief, 0, 1).unwrap();
        assert_eq!(short.len(), 2);
        assert_eq!(full.len(), 6);
        assert_relative_eq!(short.input_at(0), full.input_at(0), epsilon = 1e-12);
        assert_relative_eq!(short.input_at(1), full.input_at(1), epsilon = 1e-12);
    }

    #[test]
    fn test_infeasible_initial_state_falls_back_to_zero() {
        let mut ctrl = regulation(3);
        ctrl.change_state_constraints(dvector![1.0, 0.0], 0.5).unwrap();
        let belief = GaussianBelief::dirac(dvector![1.0, 0.0]);
        let seq = ctrl.compute_control_sequence(&belief, 0, 1).unwrap();
        assert!(!seq.is_feasible());
        assert_eq!(seq.inputs(), &DVector::zeros(3));
        assert_eq!(ctrl.last_status(), SolveStatus::InfeasibleInitialState);
    }

    #[test]
    fn test_invalid_timestep_and_belief() {
        let mut ctrl = regulation(3);
        let belief = GaussianBelief::dirac(dvector![1.0, 0.0]);
        assert!(matches!(
            ctrl.compute_control_sequence(&belief, 0, 0),
            Err(ControlError::InvalidTimestep { got: 0, .. })
        ));
        let wrong = GaussianBelief::dirac(dvector![1.0, 0.0, 0.0]);
        assert!(matches!(
            ctrl.compute_control_sequence(&wrong, 0, 1),
            Err(ControlError::InvalidStateDimension { expected: 2, got: 3 })
        ));
        assert!(GaussianBelief::new(dvector![1.0], DMatrix::zeros(2, 2)).is_err());
    }

    #[test]
    fn test_tracking_at_reference_gives_zero_sequence() {
        let mut ctrl = tracking(DMatrix::from_element(1, 10, 0.7));
        let belief = GaussianBelief::new(dvector![0.7, -3.0], DMatrix::identity(2, 2)).unwrap();
        let seq = ctrl.compute_control_sequence(&belief, 1, 2).unwrap();
        assert!(seq.is_feasible());
        assert!(seq.inputs().iter().all(|u| u.abs() < 1e-12));
    }

    #[test]
    fn test_deviation_from_reference() {
        let reg = regulation(3);
        let x = dvector![0.3, -0.2];
        assert_eq!(reg.deviation_from_ref_for_state(&x, 17).unwrap(), x);

        let trk = tracking(dmatrix![1.0, 2.0, 3.0, 4.0]);
        assert_relative_eq!(
            trk.deviation_from_ref_for_state(&x, 3).unwrap(),
            dvector![0.3 - 3.0],
            epsilon = 1e-12
        );
        for t in [0, 5] {
            assert!(matches!(
                trk.deviation_from_ref_for_state(&x, t),
                Err(ControlError::InvalidTimestep { .. })
            ));
        }
    }

    #[test]
    fn test_stage_costs() {
        let reg = regulation(3);
        let cost = reg
            .compute_stage_costs(&dvector![1.0, 2.0], &dvector![3.0], 1)
            .unwrap();
        assert_relative_eq!(cost, 1.0 + 0.5 * 4.0 + 0.1 * 9.0, epsilon = 1e-12);

        let trk = tracking(dmatrix![1.0, 2.0, 3.0, 4.0]);
        let cost = trk
            .compute_stage_costs(&dvector![1.5, 9.0], &dvector![1.0, -1.0], 2)
            .unwrap();
        assert_relative_eq!(cost, 2.0 * 0.25 + 2.0, epsilon = 1e-12);

        assert!(matches!(
            reg.compute_stage_costs(&dvector![1.0, 2.0], &dvector![3.0, 0.0], 1),
            Err(ControlError::InvalidInputDimension { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn test_costs_sum_stages_and_terminal() {
        let reg = regulation(3);
        let states = dmatrix![1.0, 0.5, 0.0; 2.0, 1.0, -1.0];
        let inputs = dmatrix![1.0, -2.0];
        let expected = (1.0 + 0.5 * 4.0 + 0.1)
            + (0.25 + 0.5 * 1.0 + 0.1 * 4.0)
            + (0.0 + 0.5 * 1.0);
        assert_relative_eq!(reg.compute_costs(&states, &inputs).unwrap(), expected, epsilon = 1e-12);

        assert!(matches!(
            reg.compute_costs(&states, &dmatrix![1.0, -2.0, 0.0]),
            Err(ControlError::InvalidStateTrajectory { states: 3, inputs: 3 })
        ));
    }
}
