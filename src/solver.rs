use slog::{warn, Logger};

use crate::{
    config::{SolverConfig, SolverKind},
    mesh::ElasticMesh,
};

pub mod combination;
pub mod lbfgs;
pub mod verlet;

/// Diagnostics of one `physics_solve` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveReport {
    /// Internal iterations performed (integration steps or L-BFGS iterations)
    pub iterations: usize,
    /// Gradient norm over free coordinates, bound-blocked components removed
    pub residual: f64,
    /// Largest coordinate change in the final internal iteration
    pub max_step: f64,
    /// Whether the solver met its own residual target
    pub converged: bool,
}

/// Advances a mesh toward equilibrium under its current bounds.
///
/// Implementations never fail: trouble is reported through the returned
/// [`SolveReport`] and the mesh is always left within its bounds.
pub trait PhysicsSolver {
    fn physics_solve(&mut self, mesh: &mut ElasticMesh) -> SolveReport;

    fn name(&self) -> &str;

    fn last_report(&self) -> &SolveReport;
}

/// Creates the solver selected in the configuration
pub fn from_config(config: &SolverConfig, logger: &Logger) -> Box<dyn PhysicsSolver> {
    match config.kind {
        SolverKind::Verlet => Box::new(verlet::Verlet::new(config.verlet.clone(), logger.clone())),
        SolverKind::Lbfgs => Box::new(lbfgs::Lbfgs::new(config.lbfgs.clone(), logger.clone())),
        SolverKind::Combination => Box::new(combination::Combination::new(
            verlet::Verlet::new(config.verlet.clone(), logger.clone()),
            lbfgs::Lbfgs::new(config.lbfgs.clone(), logger.clone()),
            config.switch_threshold,
            logger.clone(),
        )),
    }
}

/// Recomputes masses left stale by a material change. Returns false when the
/// material is invalid and the mesh must not be integrated.
pub(crate) fn refresh_masses(mesh: &mut ElasticMesh, logger: &Logger) -> bool {
    if !mesh.masses_stale() {
        return true;
    }
    match mesh.update_vertex_mass() {
        Ok(()) => true,
        Err(err) => {
            warn!(logger, "cannot refresh vertex masses"; "error" => %err);
            false
        }
    }
}
