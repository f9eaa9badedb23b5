#![allow(non_snake_case)]

use nalgebra::{DMatrix, DVector, RealField, Scalar, SimdRealField, convert};

use crate::error::{ControlError, ControlResult};
use crate::riccati::JumpModel;

/// Relative tolerance for symmetry and definiteness checks.
const SYMMETRY_TOL: f64 = 1e-9;
const EIGEN_TOL: f64 = 1e-10;

pub(crate) fn all_finite<F>(m: &DMatrix<F>) -> bool
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    m.iter().all(|v| v.is_finite())
}

/// Average `m` with its transpose to cancel rounding asymmetry.
pub(crate) fn symmetrize<F>(m: &DMatrix<F>) -> DMatrix<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    (m + m.transpose()).scale(convert(0.5))
}

fn scale_of<F>(m: &DMatrix<F>) -> F
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    if m.is_empty() {
        F::one()
    } else {
        m.abs().max().max(F::one())
    }
}

pub(crate) fn is_symmetric<F>(m: &DMatrix<F>) -> bool
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    m.is_square() && (m - m.transpose()).abs().max() <= scale_of(m) * convert(SYMMETRY_TOL)
}

/// Smallest eigenvalue of the symmetric part of a square matrix.
pub(crate) fn min_eigenvalue<F>(m: &DMatrix<F>) -> F
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    if m.is_empty() {
        return F::zero();
    }
    symmetrize(m).symmetric_eigenvalues().min()
}

pub(crate) fn is_psd<F>(m: &DMatrix<F>) -> bool
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    is_symmetric(m) && min_eigenvalue(m) >= -(scale_of(m) * convert(EIGEN_TOL))
}

pub(crate) fn is_pd<F>(m: &DMatrix<F>) -> bool
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    is_symmetric(m) && min_eigenvalue(m) > scale_of(m) * convert(EIGEN_TOL)
}

/// Discrete-time linear dynamics `x_{k+1} = A x_k + B u_k`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSystem<F: Scalar> {
    pub(crate) A: DMatrix<F>, // Nx * Nx
    pub(crate) B: DMatrix<F>, // Nx * Nu
}

impl<F> LinearSystem<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(A: DMatrix<F>, B: DMatrix<F>) -> ControlResult<Self> {
        if !A.is_square() || A.is_empty() {
            return Err(ControlError::InvalidSystemMatrix(format!(
                "expected a non-empty square matrix, got {}x{}",
                A.nrows(),
                A.ncols()
            )));
        }
        if !all_finite(&A) {
            return Err(ControlError::InvalidSystemMatrix(
                "entries must be finite".into(),
            ));
        }
        if B.nrows() != A.nrows() || B.ncols() == 0 {
            return Err(ControlError::InvalidInputMatrix(format!(
                "expected {} rows and at least one column, got {}x{}",
                A.nrows(),
                B.nrows(),
                B.ncols()
            )));
        }
        if !all_finite(&B) {
            return Err(ControlError::InvalidInputMatrix(
                "entries must be finite".into(),
            ));
        }
        Ok(Self { A, B })
    }

    pub fn dim_state(&self) -> usize {
        self.A.nrows()
    }

    pub fn dim_input(&self) -> usize {
        self.B.ncols()
    }

    pub fn state_matrix(&self) -> &DMatrix<F> {
        &self.A
    }

    pub fn input_matrix(&self) -> &DMatrix<F> {
        &self.B
    }

    /// Propagate one step.
    pub fn step(&self, x: &DVector<F>, u: &DVector<F>) -> DVector<F> {
        &self.A * x + &self.B * u
    }
}

/// Quadratic stage cost `x'Qx + u'Ru`.
///
/// `Q` is positive semi-definite, `R` positive definite. `Q` may act on a
/// projected output rather than the full state, so its dimension is given
/// explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct CostSpec<F: Scalar> {
    pub(crate) Q: DMatrix<F>,
    pub(crate) R: DMatrix<F>,
}

impl<F> CostSpec<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(Q: DMatrix<F>, R: DMatrix<F>, dim_q: usize, dim_u: usize) -> ControlResult<Self> {
        if Q.nrows() != dim_q || Q.ncols() != dim_q {
            return Err(ControlError::InvalidQMatrix(format!(
                "expected {dim_q}x{dim_q}, got {}x{}",
                Q.nrows(),
                Q.ncols()
            )));
        }
        if !all_finite(&Q) {
            return Err(ControlError::InvalidQMatrix("entries must be finite".into()));
        }
        if !is_psd(&Q) {
            return Err(ControlError::InvalidQMatrixPSD(format!(
                "smallest eigenvalue {}",
                min_eigenvalue(&Q)
            )));
        }
        if R.nrows() != dim_u || R.ncols() != dim_u {
            return Err(ControlError::InvalidRMatrix(format!(
                "expected {dim_u}x{dim_u}, got {}x{}",
                R.nrows(),
                R.ncols()
            )));
        }
        if !all_finite(&R) {
            return Err(ControlError::InvalidRMatrix("entries must be finite".into()));
        }
        if !is_pd(&R) {
            return Err(ControlError::InvalidRMatrixPD(format!(
                "smallest eigenvalue {}",
                min_eigenvalue(&R)
            )));
        }
        Ok(Self { Q, R })
    }

    pub fn state_cost(&self) -> &DMatrix<F> {
        &self.Q
    }

    pub fn input_cost(&self) -> &DMatrix<F> {
        &self.R
    }

    /// `e'Qe + u'Ru` for an already projected state error `e`.
    pub fn evaluate(&self, e: &DVector<F>, u: &DVector<F>) -> F {
        e.dot(&(&self.Q * e)) + u.dot(&(&self.R * u))
    }
}

/// Per-mode dynamics of a Markov jump linear system, plus the currently active mode.
#[derive(Debug, Clone)]
pub struct ModeSet<F: Scalar> {
    systems: Vec<LinearSystem<F>>,
    active: usize,
}

impl<F> ModeSet<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// All modes must share state and input dimensions. The first mode starts active.
    pub fn new(systems: Vec<LinearSystem<F>>) -> ControlResult<Self> {
        let Some(first) = systems.first() else {
            return Err(ControlError::InvalidJumpModel(
                "at least one mode is required".into(),
            ));
        };
        let (nx, nu) = (first.dim_state(), first.dim_input());
        if let Some(i) = systems
            .iter()
            .position(|s| s.dim_state() != nx || s.dim_input() != nu)
        {
            return Err(ControlError::InvalidJumpModel(format!(
                "mode {i} has dimensions {}x{}, expected {nx}x{nu}",
                systems[i].dim_state(),
                systems[i].dim_input()
            )));
        }
        Ok(Self { systems, active: 0 })
    }

    pub fn num_modes(&self) -> usize {
        self.systems.len()
    }

    pub fn mode(&self, i: usize) -> Option<&LinearSystem<F>> {
        self.systems.get(i)
    }

    pub fn active_mode(&self) -> usize {
        self.active
    }

    pub fn active_system(&self) -> &LinearSystem<F> {
        &self.systems[self.active]
    }

    pub fn set_active_mode(&mut self, mode: usize) -> ControlResult<()> {
        if mode >= self.systems.len() {
            return Err(ControlError::InvalidJumpModel(format!(
                "mode {mode} out of range for {} modes",
                self.systems.len()
            )));
        }
        self.active = mode;
        Ok(())
    }

    /// Replace the dynamics of one mode; dimensions must not change.
    pub fn set_mode_system(&mut self, mode: usize, system: LinearSystem<F>) -> ControlResult<()> {
        let current = self.systems.get(mode).ok_or_else(|| {
            ControlError::InvalidJumpModel(format!("mode {mode} out of range"))
        })?;
        if current.dim_state() != system.dim_state() || current.dim_input() != system.dim_input()
        {
            return Err(ControlError::InvalidJumpModel(format!(
                "mode {mode} dimensions cannot change"
            )));
        }
        self.systems[mode] = system;
        Ok(())
    }

    /// Assemble the kernel input from these dynamics and per-mode cost matrices.
    ///
    /// Unlike [`CostSpec`], the input costs may be singular here (e.g. a mode
    /// whose inputs never reach the plant).
    pub fn jump_model(
        &self,
        state_costs: Vec<DMatrix<F>>,
        input_costs: Vec<DMatrix<F>>,
        transition: DMatrix<F>,
        terminal: DMatrix<F>,
        ref_weightings: DMatrix<F>,
    ) -> ControlResult<JumpModel<F>> {
        JumpModel::new(
            self.systems.clone(),
            state_costs,
            input_costs,
            transition,
            terminal,
            ref_weightings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_linear_system_rejects_non_square_a() {
        let err = LinearSystem::new(DMatrix::<f64>::zeros(2, 3), DMatrix::zeros(2, 1)).unwrap_err();
        assert!(matches!(err, ControlError::InvalidSystemMatrix(_)));
    }

    #[test]
    fn test_linear_system_rejects_nan() {
        let a = dmatrix![1.0, f64::NAN; 0.0, 1.0];
        let err = LinearSystem::new(a, DMatrix::zeros(2, 1)).unwrap_err();
        assert!(matches!(err, ControlError::InvalidSystemMatrix(_)));

        let b = dmatrix![1.0; f64::INFINITY];
        let err = LinearSystem::new(DMatrix::identity(2, 2), b).unwrap_err();
        assert!(matches!(err, ControlError::InvalidInputMatrix(_)));
    }

    #[test]
    fn test_linear_system_rejects_row_mismatch() {
        let err = LinearSystem::new(DMatrix::<f64>::identity(2, 2), DMatrix::zeros(3, 1)).unwrap_err();
        assert!(matches!(err, ControlError::InvalidInputMatrix(_)));
    }

    #[test]
    fn test_step() {
        let sys = LinearSystem::new(dmatrix![1.0, 1.0; 0.0, 1.0], dmatrix![0.0; 1.0]).unwrap();
        let x = sys.step(&dvector![1.0, 2.0], &dvector![0.5]);
        assert_eq!(x, dvector![3.0, 2.5]);
        assert_eq!(sys.state_matrix(), &dmatrix![1.0, 1.0; 0.0, 1.0]);
        assert_eq!(sys.input_matrix(), &dmatrix![0.0; 1.0]);
    }

    #[test]
    fn test_cost_spec_definiteness() {
        let q_indef = dmatrix![1.0, 0.0; 0.0, -1.0];
        let err = CostSpec::new(q_indef, DMatrix::identity(1, 1), 2, 1).unwrap_err();
        assert!(matches!(err, ControlError::InvalidQMatrixPSD(_)));

        let q_asym = dmatrix![1.0, 0.5; 0.0, 1.0];
        let err = CostSpec::new(q_asym, DMatrix::identity(1, 1), 2, 1).unwrap_err();
        assert!(matches!(err, ControlError::InvalidQMatrixPSD(_)));

        // Q may be singular, R may not
        let q_singular = dmatrix![1.0, 1.0; 1.0, 1.0];
        assert!(CostSpec::new(q_singular, DMatrix::identity(1, 1), 2, 1).is_ok());

        let err = CostSpec::new(DMatrix::identity(2, 2), dmatrix![0.0], 2, 1).unwrap_err();
        assert!(matches!(err, ControlError::InvalidRMatrixPD(_)));

        let err = CostSpec::new(DMatrix::identity(3, 3), dmatrix![1.0], 2, 1).unwrap_err();
        assert!(matches!(err, ControlError::InvalidQMatrix(_)));

        let err = CostSpec::<f64>::new(DMatrix::identity(2, 2), DMatrix::identity(2, 2), 2, 1)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidRMatrix(_)));
    }

    #[test]
    fn test_mode_set_active_mode() {
        let s0 = LinearSystem::new(DMatrix::<f64>::identity(2, 2), DMatrix::zeros(2, 1)).unwrap();
        let s1 = LinearSystem::new(DMatrix::<f64>::zeros(2, 2), DMatrix::zeros(2, 1)).unwrap();
        let mut modes = ModeSet::new(vec![s0, s1.clone()]).unwrap();
        assert_eq!(modes.num_modes(), 2);
        assert_eq!(modes.active_mode(), 0);
        modes.set_active_mode(1).unwrap();
        assert_eq!(modes.active_system(), &s1);
        assert!(modes.set_active_mode(2).is_err());
    }

    #[test]
    fn test_mode_set_replace_system() {
        let s0 = LinearSystem::new(DMatrix::<f64>::identity(2, 2), dmatrix![0.0; 1.0]).unwrap();
        let mut modes = ModeSet::new(vec![s0.clone(), s0]).unwrap();

        // packet loss: inputs no longer reach the plant in mode 1
        let lossy = LinearSystem::new(DMatrix::<f64>::identity(2, 2), DMatrix::zeros(2, 1)).unwrap();
        modes.set_mode_system(1, lossy.clone()).unwrap();
        assert_eq!(modes.mode(1), Some(&lossy));
        modes.set_active_mode(1).unwrap();
        assert_eq!(modes.active_system().input_matrix(), &DMatrix::zeros(2, 1));

        let wider = LinearSystem::new(DMatrix::<f64>::identity(2, 2), DMatrix::zeros(2, 2)).unwrap();
        assert!(matches!(
            modes.set_mode_system(0, wider),
            Err(ControlError::InvalidJumpModel(_))
        ));
        assert!(matches!(
            modes.set_mode_system(2, lossy),
            Err(ControlError::InvalidJumpModel(_))
        ));
        assert_eq!(modes.mode(0).map(LinearSystem::dim_input), Some(1));
        assert_eq!(modes.mode(2), None);
    }

    #[test]
    fn test_mode_set_rejects_mixed_dimensions() {
        let s0 = LinearSystem::new(DMatrix::<f64>::identity(2, 2), DMatrix::zeros(2, 1)).unwrap();
        let s1 = LinearSystem::new(DMatrix::<f64>::identity(2, 2), DMatrix::zeros(2, 2)).unwrap();
        assert!(matches!(
            ModeSet::new(vec![s0, s1]),
            Err(ControlError::InvalidJumpModel(_))
        ));
        assert!(ModeSet::<f64>::new(vec![]).is_err());
    }
}
