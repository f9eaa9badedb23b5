use nalgebra::{DVector, RealField, Scalar, SimdRealField};

/// Single linear inequality `w · x <= c` on a state or input vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint<F: Scalar> {
    weighting: DVector<F>,
    bound: F,
    norm_sq: F,
}

impl<F> LinearConstraint<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    /// Callers validate dimensions; a NaN bound is the only thing refused here.
    pub(crate) fn new(weighting: DVector<F>, bound: F) -> Option<Self> {
        if bound.partial_cmp(&bound).is_none() || !weighting.iter().all(|w| w.is_finite()) {
            return None;
        }
        let norm_sq = weighting.norm_squared();
        Some(Self {
            weighting,
            bound,
            norm_sq,
        })
    }

    /// Constraint that every vector of length `dim` satisfies.
    pub fn unbounded(dim: usize) -> Self {
        Self {
            weighting: DVector::zeros(dim),
            bound: F::max_value().unwrap_or_else(F::one),
            norm_sq: F::zero(),
        }
    }

    pub fn weighting(&self) -> &DVector<F> {
        &self.weighting
    }

    pub fn bound(&self) -> F {
        self.bound
    }

    pub fn dim(&self) -> usize {
        self.weighting.len()
    }

    /// `w · x - c`; positive means violated.
    pub fn violation(&self, x: &DVector<F>) -> F {
        self.weighting.dot(x) - self.bound
    }

    pub fn is_satisfied(&self, x: &DVector<F>, tol: F) -> bool {
        self.violation(x) <= tol
    }

    /// A zero weighting with a negative bound admits nothing.
    pub fn is_empty(&self) -> bool {
        self.norm_sq == F::zero() && self.bound < F::zero()
    }

    /// Euclidean projection onto the half-space.
    pub fn project(&self, x: &mut DVector<F>) {
        if self.norm_sq == F::zero() {
            return;
        }
        let excess = self.violation(x);
        if excess > F::zero() {
            x.axpy(-(excess / self.norm_sq), &self.weighting, F::one());
        }
    }
}
