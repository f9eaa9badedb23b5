use thiserror::Error;

/// Configuration and validation failures.
///
/// Solver infeasibility is deliberately absent: it is reported through
/// [`ControlSequence::Infeasible`](crate::ControlSequence::Infeasible).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("A must be a square matrix with finite entries: {0}")]
    InvalidSystemMatrix(String),

    #[error("B must have as many rows as A and finite entries: {0}")]
    InvalidInputMatrix(String),

    #[error("Q must be a square matrix of matching dimension with finite entries: {0}")]
    InvalidQMatrix(String),

    #[error("Q must be symmetric positive semi-definite: {0}")]
    InvalidQMatrixPSD(String),

    #[error("R must be a square matrix of matching dimension with finite entries: {0}")]
    InvalidRMatrix(String),

    #[error("R must be symmetric positive definite: {0}")]
    InvalidRMatrixPD(String),

    #[error("Z must map the state onto the tracked output with finite entries: {0}")]
    InvalidOutputMatrix(String),

    #[error("Invalid reference trajectory: {0}")]
    InvalidReferenceTrajectory(String),

    #[error("Invalid state constraint weighting: {0}")]
    InvalidStateWeightings(String),

    #[error("Invalid input constraint weighting: {0}")]
    InvalidInputWeightings(String),

    #[error("State constraint bound must be a number")]
    InvalidStateConstraints,

    #[error("Input constraint bound must be a number")]
    InvalidInputConstraints,

    #[error("Sequence length must be in [1, {max}], got {got}")]
    InvalidSequenceLength { got: usize, max: usize },

    #[error("Invalid horizon length {got}: {reason}")]
    InvalidHorizonLength { got: usize, reason: String },

    #[error("Invalid timestep {got}: {reason}")]
    InvalidTimestep { got: usize, reason: String },

    #[error("State trajectory must have exactly one more column than the input trajectory ({states} vs {inputs})")]
    InvalidStateTrajectory { states: usize, inputs: usize },

    #[error("Invalid state dimension: expected {expected}, got {got}")]
    InvalidStateDimension { expected: usize, got: usize },

    #[error("Invalid input dimension: expected {expected}, got {got}")]
    InvalidInputDimension { expected: usize, got: usize },

    #[error("Invalid jump model: {0}")]
    InvalidJumpModel(String),

    #[error("Linear algebra error: {0}")]
    LinAlg(String),
}

pub type ControlResult<T> = Result<T, ControlError>;
