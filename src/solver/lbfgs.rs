use argmin::{
    core::{
        observers::ObserverMode, CostFunction, Error, Executor, Gradient, State, TerminationReason,
    },
    solver::{linesearch::MoreThuenteLineSearch, quasinewton::LBFGS},
};
use argmin_observer_slog::SlogLogger;
use nalgebra::DVector;
use slog::{debug, warn, Logger};

use crate::{
    config::LbfgsConfig,
    datatypes::DIM,
    error::RuffleError,
    mesh::ElasticMesh,
    solver::{refresh_masses, PhysicsSolver, SolveReport},
};

/// Mesh energy restricted to the free coordinates, with the bounds enforced
/// by a quadratic penalty on how far a coordinate lies outside them.
struct PenalizedEnergy<'a> {
    mesh: &'a ElasticMesh,
    free: &'a [usize],
    base: &'a DVector<f64>,
    penalty: f64,
}

impl PenalizedEnergy<'_> {
    fn scatter(&self, param: &[f64]) -> DVector<f64> {
        let mut x = self.base.clone();
        for (k, c) in self.free.iter().enumerate() {
            x[*c] = param[k];
        }
        x
    }

    /// Signed distance outside the bounds, positive above `ub`
    fn excess(&self, coordinate: usize, value: f64) -> f64 {
        let axis = coordinate % DIM;
        let ub = self.mesh.ub(axis);
        let lb = self.mesh.lb(axis);
        if value > ub {
            value - ub
        } else if value < lb {
            value - lb
        } else {
            0.0
        }
    }
}

impl CostFunction for PenalizedEnergy<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        let x = self.scatter(param);
        let mut cost = self.mesh.energy(&x, None);
        for (k, c) in self.free.iter().enumerate() {
            let excess = self.excess(*c, param[k]);
            cost += 0.5 * self.penalty * excess * excess;
        }

        if !cost.is_finite() {
            return Err(Error::msg("energy is not finite"));
        }
        Ok(cost)
    }
}

impl Gradient for PenalizedEnergy<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, Error> {
        let x = self.scatter(param);
        let mut grad = DVector::zeros(self.mesh.dof());
        self.mesh.energy(&x, Some(&mut grad));

        Ok(self
            .free
            .iter()
            .enumerate()
            .map(|(k, c)| grad[*c] + self.penalty * self.excess(*c, param[k]))
            .collect())
    }
}

/// Quasi-Newton minimisation of the potential energy with argmin's L-BFGS.
///
/// The result is clamped onto the bounds afterwards, so the mesh always
/// leaves a call feasible even though the bounds are soft during the search.
/// Velocities are cleared: the state returned is static.
pub struct Lbfgs {
    config: LbfgsConfig,
    logger: Logger,
    /// Free coordinates of the topology revision in `cached_revision`
    free: Vec<usize>,
    cached_revision: Option<(u64, usize)>,
    report: SolveReport,
}

impl Lbfgs {
    pub fn new(config: LbfgsConfig, logger: Logger) -> Lbfgs {
        Lbfgs {
            config,
            logger,
            free: Vec::new(),
            cached_revision: None,
            report: SolveReport::default(),
        }
    }

    fn refresh_free_coordinates(&mut self, mesh: &ElasticMesh) {
        let key = (mesh.revision(), mesh.dof());
        if self.cached_revision != Some(key) {
            self.free = mesh.free_coordinates();
            self.cached_revision = Some(key);
            debug!(self.logger, "rebuilt free coordinate map";
                "revision" => key.0, "free" => self.free.len());
        }
    }

    /// Runs the minimiser from the current state
    ///
    /// # Returns
    ///
    /// The best free coordinates found, the iteration count and whether argmin
    /// stopped on its own convergence test.
    fn minimize(&self, mesh: &ElasticMesh) -> Result<(Vec<f64>, u64, bool), RuffleError> {
        let base = mesh.x.clone();
        let init: Vec<f64> = self.free.iter().map(|c| base[*c]).collect();
        let problem = PenalizedEnergy {
            mesh,
            free: &self.free,
            base: &base,
            penalty: self.config.penalty,
        };

        let linesearch: MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64> =
            MoreThuenteLineSearch::new();
        let solver: LBFGS<_, Vec<f64>, Vec<f64>, f64> =
            LBFGS::new(linesearch, self.config.memory).with_tolerance_grad(self.config.tolerance)?;

        let max_iters = self.config.max_iters;
        let mut executor = Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(max_iters));
        if self.config.trace {
            executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
        }

        let result = executor.run()?;
        let state = result.state();
        let best = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| RuffleError::Solver("L-BFGS returned no parameters".to_owned()))?;
        let converged = matches!(
            state.get_termination_reason(),
            Some(TerminationReason::SolverConverged)
        );

        Ok((best, state.get_iter(), converged))
    }
}

impl PhysicsSolver for Lbfgs {
    fn physics_solve(&mut self, mesh: &mut ElasticMesh) -> SolveReport {
        if !refresh_masses(mesh, &self.logger) {
            self.report = SolveReport {
                residual: f64::INFINITY,
                ..Default::default()
            };
            return self.report.clone();
        }
        self.refresh_free_coordinates(mesh);
        mesh.project();

        let mut iterations = 0;
        let mut max_step: f64 = 0.0;
        let mut solver_converged = self.free.is_empty();
        if !self.free.is_empty() {
            match self.minimize(mesh) {
                Ok((best, iters, converged)) => {
                    for (k, c) in self.free.iter().enumerate() {
                        max_step = max_step.max((best[k] - mesh.x[*c]).abs());
                        mesh.x[*c] = best[k];
                    }
                    mesh.project();
                    mesh.v.fill(0.0);
                    iterations = iters as usize;
                    solver_converged = converged;
                }
                Err(err) => {
                    warn!(self.logger, "L-BFGS failed, state left unchanged"; "error" => %err);
                }
            }
        }

        let grad = mesh.gradient();
        let residual = mesh.projected_residual(&grad);
        self.report = SolveReport {
            iterations,
            residual,
            max_step,
            converged: solver_converged || residual < self.config.tolerance,
        };
        debug!(self.logger, "lbfgs minimisation";
            "iterations" => iterations, "residual" => residual, "max_step" => max_step);

        self.report.clone()
    }

    fn name(&self) -> &str {
        "lbfgs"
    }

    fn last_report(&self) -> &SolveReport {
        &self.report
    }
}
