#![allow(non_snake_case)]

use log::debug;
use nalgebra::{DMatrix, RealField, Scalar, SimdRealField};

use crate::{HorizonSolver, constraint::LinearConstraint};

/// Project every column of `m` onto the half-space.
fn project_columns<F>(m: &mut DMatrix<F>, con: &LinearConstraint<F>)
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    for mut col in m.column_iter_mut() {
        let mut c = col.clone_owned();
        con.project(&mut c);
        col.copy_from(&c);
    }
}

impl<F> HorizonSolver<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    fn rho(&self) -> F {
        self.cache.as_ref().map_or(self.settings.rho, |c| c.rho)
    }

    /// Update linear terms from Riccati backward pass
    pub(crate) fn backward_pass_grad(&mut self) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let w = &mut self.work;
        let N = w.N;
        w.p.set_column(N, &w.q.column(N));
        for i in (0..N).rev() {
            w.d.set_column(
                i,
                &(&cache.Quu_inv[i] * (w.Bdyn.transpose() * w.p.column(i + 1) + w.r.column(i))),
            );
            w.p.set_column(
                i,
                &(w.q.column(i) + &cache.AmBKt[i] * w.p.column(i + 1)
                    - (cache.K[i].transpose() * w.r.column(i))),
            );
        }
    }

    /// Use the stage feedback policy to roll out trajectory
    pub(crate) fn forward_pass(&mut self) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let w = &mut self.work;
        for i in 0..w.N {
            w.u.set_column(i, &(-&cache.K[i] * w.x.column(i) - w.d.column(i)));
            w.x.set_column(
                i + 1,
                &(&w.Adyn * w.x.column(i) + &w.Bdyn * w.u.column(i)),
            );
        }
    }

    /// Project slack (auxiliary) variables onto the state and input half-spaces
    pub(crate) fn update_slack(&mut self) {
        let w = &mut self.work;
        w.znew = &w.u + &w.y;
        w.vnew = &w.x + &w.g;

        if self.settings.en_input_bound {
            project_columns(&mut w.znew, &w.u_con);
        }
        if self.settings.en_state_bound {
            project_columns(&mut w.vnew, &w.x_con);
        }
    }

    /// Update next iteration of dual variables by performing the augmented lagrangian multiplier update
    pub(crate) fn update_dual(&mut self) {
        // Gradient ascent
        self.work.y = &self.work.y + &self.work.u - &self.work.znew;
        self.work.g = &self.work.g + &self.work.x - &self.work.vnew;
    }

    /// Update linear control cost terms in the Riccati feedback using the changing slack and dual variables from ADMM
    pub(crate) fn update_linear_cost(&mut self) {
        let rho = self.rho();
        let w = &mut self.work;

        // r
        w.r = -(&w.znew - &w.y).scale(rho);

        // q, including the terminal stage
        w.q = -&w.ref_weightings - (&w.vnew - &w.g).scale(rho);
    }

    /// Check for termination condition by evaluating whether the largest absolute primal and dual residuals for states and inputs are below threhold.
    pub(crate) fn termination_condition(&mut self) -> bool {
        if self.work.iter.is_multiple_of(self.settings.check_termination.max(1)) {
            let rho = self.rho();
            let w = &mut self.work;

            // Calculate residuals on slack variables
            w.primal_residual_state = (&w.x - &w.vnew).abs().max();
            w.dual_residual_state = (&w.v - &w.vnew).abs().max() * rho;
            w.primal_residual_input = (&w.u - &w.znew).abs().max();
            w.dual_residual_input = (&w.z - &w.znew).abs().max() * rho;

            // If all residuals are below tolerance, we terminate
            w.primal_residual_state < self.settings.abs_pri_tol
                && w.primal_residual_input < self.settings.abs_pri_tol
                && w.dual_residual_state < self.settings.abs_dua_tol
                && w.dual_residual_input < self.settings.abs_dua_tol
        } else {
            false
        }
    }

    /// Iterate from the trajectory already in the workspace.
    ///
    /// Returns `false` when `max_iter` is reached without convergence.
    pub(crate) fn admm_solve(&mut self) -> bool {
        self.work.iter = 0;

        // Slack starts at the warm start, duals at zero
        self.work.vnew = self.work.x.clone();
        self.work.znew = self.work.u.clone();
        self.work.v = self.work.vnew.clone();
        self.work.z = self.work.znew.clone();
        self.work.g.fill(F::zero());
        self.work.y.fill(F::zero());

        self.update_linear_cost();
        self.backward_pass_grad();

        for _ in 0..self.settings.max_iter {
            // Solve linear system with Riccati and roll out to get new trajectory
            self.forward_pass();

            // Project slack variables into feasible domain
            self.update_slack();

            // Compute next iteration of dual variables
            self.update_dual();

            // Update linear control cost terms using reference trajectory, duals, and slack variables
            self.update_linear_cost();

            self.work.iter += 1;

            // Check for whether cost is minimized by calculating residuals
            if self.termination_condition() {
                // Save solution
                self.solution.x = self.work.vnew.clone();
                self.solution.u = self.work.znew.clone();

                debug!("Solver converged in {} iterations", self.work.iter);
                return true;
            }

            // Save previous slack variables
            self.work.v = self.work.vnew.clone();
            self.work.z = self.work.znew.clone();

            self.backward_pass_grad();
        }

        debug!(
            "Solver stopped after {} iterations, primal residuals {} / {}",
            self.work.iter, self.work.primal_residual_state, self.work.primal_residual_input
        );
        self.solution.x = self.work.vnew.clone();
        self.solution.u = self.work.znew.clone();
        false
    }
}
