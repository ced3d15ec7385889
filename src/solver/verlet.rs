use nalgebra::DVector;
use slog::{debug, Logger};

use crate::{
    config::VerletConfig,
    datatypes::DIM,
    mesh::ElasticMesh,
    solver::{refresh_masses, PhysicsSolver, SolveReport},
};

/// Fraction of the explicit stability limit `2/ω` a time step may use
pub const STABILITY_SAFETY: f64 = 0.5;

/// Damped symplectic-Euler relaxation with hard projection onto the bounds.
///
/// Each call integrates `steps` steps. The time step is the configured one
/// unless that would break the explicit stability condition, in which case
/// the largest stable step is used.
pub struct Verlet {
    config: VerletConfig,
    logger: Logger,
    grad: DVector<f64>,
    report: SolveReport,
}

impl Verlet {
    pub fn new(config: VerletConfig, logger: Logger) -> Verlet {
        Verlet {
            config,
            logger,
            grad: DVector::zeros(0),
            report: SolveReport::default(),
        }
    }

    /// Largest time step that keeps `ω·Δt` within the safety margin for
    /// every free vertex, where `ω²` is bounded by stiffness over mass.
    pub fn stable_timestep(mesh: &ElasticMesh) -> f64 {
        let bounds = mesh.stiffness_bounds();
        let mut omega_sq: f64 = 0.0;
        for (i, vertex) in mesh.vertices().iter().enumerate() {
            if vertex.fixed.iter().all(|f| *f) || vertex.mass <= 0.0 {
                continue;
            }
            omega_sq = omega_sq.max(bounds[i] / vertex.mass);
        }

        if omega_sq <= 0.0 {
            return f64::INFINITY;
        }
        STABILITY_SAFETY * 2.0 / omega_sq.sqrt()
    }

    pub fn timestep(&self, mesh: &ElasticMesh) -> f64 {
        self.config.timestep.min(Self::stable_timestep(mesh))
    }
}

impl PhysicsSolver for Verlet {
    fn physics_solve(&mut self, mesh: &mut ElasticMesh) -> SolveReport {
        if !refresh_masses(mesh, &self.logger) {
            self.report = SolveReport {
                residual: f64::INFINITY,
                ..Default::default()
            };
            return self.report.clone();
        }

        let dof = mesh.dof();
        if self.grad.len() != dof {
            self.grad = DVector::zeros(dof);
        }

        let inverse_mass: Vec<f64> = (0..dof)
            .map(|c| {
                let vertex = &mesh.vertices()[c / DIM];
                if vertex.fixed[c % DIM] || vertex.mass <= 0.0 {
                    0.0
                } else {
                    1.0 / vertex.mass
                }
            })
            .collect();

        let dt = self.timestep(mesh);
        if dt < self.config.timestep {
            debug!(self.logger, "time step limited by stiffness";
                "configured" => self.config.timestep, "stable" => dt);
        }
        let keep = 1.0 - self.config.damping;

        // the bounds may have moved since the last call
        mesh.project();

        let mut max_step = 0.0;
        for _ in 0..self.config.steps {
            mesh.energy(&mesh.x, Some(&mut self.grad));

            max_step = 0.0;
            for c in 0..dof {
                if inverse_mass[c] == 0.0 {
                    continue;
                }
                mesh.v[c] = keep * (mesh.v[c] - dt * self.grad[c] * inverse_mass[c]);
                let dx = dt * mesh.v[c];
                mesh.x[c] += dx;
                max_step = f64::max(max_step, dx.abs());
            }
            mesh.project();
        }

        mesh.energy(&mesh.x, Some(&mut self.grad));
        let residual = mesh.projected_residual(&self.grad);

        self.report = SolveReport {
            iterations: self.config.steps,
            residual,
            max_step,
            converged: residual < self.config.tolerance,
        };
        debug!(self.logger, "verlet relaxation";
            "steps" => self.config.steps, "dt" => dt,
            "residual" => residual, "max_step" => max_step);

        self.report.clone()
    }

    fn name(&self) -> &str {
        "verlet"
    }

    fn last_report(&self) -> &SolveReport {
        &self.report
    }
}
