//! Finite-horizon constrained predictive control for networked control loops.
//!
//! [`PredictiveController`] plans a sequence of input moves from a state
//! belief, either regulating the state to the origin or tracking an output
//! reference. The underlying QP is solved by [`HorizonSolver`] with ADMM, and
//! [`riccati::backward_pass`] provides the Markov-jump Riccati recursion used
//! for the closed-form unconstrained optimum.

pub mod admm;
pub mod constraint;
pub mod controller;
pub mod error;
pub mod horizon;
pub mod riccati;
pub mod system;

pub use constraint::LinearConstraint;
pub use controller::{ControlSequence, GaussianBelief, PredictiveController, StateBelief};
pub use error::{ControlError, ControlResult};
pub use horizon::{HorizonSettings, HorizonSolver, SolveStatus};
pub use riccati::{JumpModel, ModeGains, RiccatiTables, backward_pass};
pub use system::{CostSpec, LinearSystem, ModeSet};
