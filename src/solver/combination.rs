use slog::{debug, Logger};

use crate::{
    mesh::ElasticMesh,
    solver::{lbfgs::Lbfgs, verlet::Verlet, PhysicsSolver, SolveReport},
};

/// Verlet relaxation that hands over to L-BFGS once motion has died down.
///
/// Explicit integration is robust far from equilibrium but slow to settle;
/// the quasi-Newton step finishes the job near it.
pub struct Combination {
    verlet: Verlet,
    lbfgs: Lbfgs,
    switch_threshold: f64,
    logger: Logger,
    refinements: usize,
    report: SolveReport,
}

impl Combination {
    pub fn new(verlet: Verlet, lbfgs: Lbfgs, switch_threshold: f64, logger: Logger) -> Combination {
        Combination {
            verlet,
            lbfgs,
            switch_threshold,
            logger,
            refinements: 0,
            report: SolveReport::default(),
        }
    }

    /// Number of calls that ended with an L-BFGS refinement
    pub fn refinements(&self) -> usize {
        self.refinements
    }
}

impl PhysicsSolver for Combination {
    fn physics_solve(&mut self, mesh: &mut ElasticMesh) -> SolveReport {
        let relaxed = self.verlet.physics_solve(mesh);

        self.report = if relaxed.residual.is_finite() && relaxed.max_step < self.switch_threshold {
            let refined = self.lbfgs.physics_solve(mesh);
            self.refinements += 1;
            debug!(self.logger, "switched to L-BFGS";
                "verlet_step" => relaxed.max_step, "residual" => refined.residual);
            SolveReport {
                iterations: relaxed.iterations + refined.iterations,
                ..refined
            }
        } else {
            relaxed
        };

        self.report.clone()
    }

    fn name(&self) -> &str {
        "combination"
    }

    fn last_report(&self) -> &SolveReport {
        &self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::create_ruffle_stack,
        config::{LbfgsConfig, VerletConfig},
        datatypes::Y_AXIS,
        logging,
    };

    fn solver(switch_threshold: f64) -> Combination {
        let logger = logging::discard();
        Combination::new(
            Verlet::new(VerletConfig::default(), logger.clone()),
            Lbfgs::new(LbfgsConfig::default(), logger.clone()),
            switch_threshold,
            logger,
        )
    }

    #[test]
    fn refines_once_motion_settles() {
        let mut mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        let top = mesh.get_vertex_position(8).y;
        *mesh.ub_mut(Y_AXIS) = top - 1.0;
        let mut combination = solver(1e-4);

        for _ in 0..200 {
            combination.physics_solve(&mut mesh);
            assert!(mesh.max_violation() <= 1e-12);
            if combination.refinements() > 0 {
                break;
            }
        }

        assert!(combination.refinements() > 0);
        assert_eq!(mesh.kinetic_energy(), 0.0);
        assert!(combination.last_report().residual < 1.0);
    }

    #[test]
    fn stays_explicit_while_moving() {
        let mut mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        let mut combination = solver(0.0);
        for _ in 0..3 {
            combination.physics_solve(&mut mesh);
        }
        assert_eq!(combination.refinements(), 0);
        assert_eq!(combination.last_report().iterations, VerletConfig::default().steps);
    }
}
