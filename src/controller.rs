use indicatif::ProgressBar;
use nalgebra::Vector2;
use slog::{debug, info, warn, Logger};

use crate::{
    config::LoadingConfig,
    datatypes::{CurvePoint, DIM, Y_AXIS},
    mesh::ElasticMesh,
    solver::{PhysicsSolver, SolveReport},
};

/// Outcome of one [`LoadingController::tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    /// Not running; nothing was solved
    Paused,
    /// Solved once, the current increment has not settled yet
    Solving,
    /// The increment settled and the plate moved on to the next one
    StepConverged,
    /// The plate reached the target and the state settled there
    Converged,
    /// The increment did not settle within the tick budget; loading stopped
    Stuck,
}

/// Relative slack under which the remaining distance counts as one step
const STEP_SNAP: f64 = 1e-9;

/// Moves `from` by `step` toward `to`, landing exactly on `to` once it is
/// within one step
fn step_toward(from: f64, to: f64, step: f64) -> f64 {
    if (to - from).abs() <= step * (1.0 + STEP_SNAP) {
        to
    } else if from > to {
        from - step
    } else {
        from + step
    }
}

/// Drives a mesh through displacement-controlled loading.
///
/// A rigid plate (the mesh's upper y bound) is walked toward a target height
/// in fixed increments. Every tick runs the solver once; an increment ends
/// when displacement and reaction force stop changing between ticks, at which
/// point a curve point is recorded and the plate advances.
pub struct LoadingController {
    pub mesh: ElasticMesh,
    solver: Box<dyn PhysicsSolver>,
    config: LoadingConfig,
    logger: Logger,

    running: bool,
    converged: bool,
    ticks_in_step: usize,

    force: f64,
    force_prev: f64,
    displacement: f64,
    displacement_prev: f64,

    /// Height the plate is walked toward
    target: f64,
    /// Current plate height
    plate: f64,

    curve: Vec<CurvePoint>,
}

impl LoadingController {
    pub fn new(
        mesh: ElasticMesh,
        solver: Box<dyn PhysicsSolver>,
        config: LoadingConfig,
        logger: Logger,
    ) -> LoadingController {
        let plate = mesh.ub(Y_AXIS);
        let mut controller = LoadingController {
            mesh,
            solver,
            config,
            logger,
            running: false,
            converged: true,
            ticks_in_step: 0,
            force: 0.0,
            force_prev: 0.0,
            displacement: 0.0,
            displacement_prev: 0.0,
            target: plate,
            plate,
            curve: Vec::new(),
        };
        controller.displacement = controller.get_displacement();
        controller.displacement_prev = controller.displacement;
        controller.force = controller.reaction_force();
        controller.force_prev = controller.force;
        controller
    }

    /// Highest vertex of the structure
    pub fn get_displacement(&self) -> f64 {
        (0..self.mesh.vertex_count())
            .map(|i| self.mesh.x[DIM * i + Y_AXIS])
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Total force the structure pushes up on the plate with.
    ///
    /// Sums `-∂E/∂y` over free vertices within `contact_tolerance` of the
    /// plate. Vertices pulling away from the plate contribute nothing.
    pub fn reaction_force(&self) -> f64 {
        let plate = self.mesh.ub(Y_AXIS);
        if !plate.is_finite() {
            return 0.0;
        }

        let grad = self.mesh.gradient();
        let mut force = 0.0;
        for i in 0..self.mesh.vertex_count() {
            let c = DIM * i + Y_AXIS;
            if !self.mesh.is_free_coordinate(c) {
                continue;
            }
            if self.mesh.x[c] > plate - self.config.contact_tolerance {
                if grad[c] > 0.0 {
                    debug!(self.logger, "vertex at plate pulls away"; "vertex" => i, "grad" => grad[c]);
                    continue;
                }
                force -= grad[c];
            }
        }
        force
    }

    fn apply_plate(&mut self) {
        *self.mesh.ub_mut(Y_AXIS) = self.plate;
        self.ticks_in_step = 0;
        self.converged = false;
    }

    /// Puts the plate at `height` and makes it the target as well
    pub fn place_plate(&mut self, height: f64) {
        self.plate = height;
        self.target = height;
        self.apply_plate();
    }

    /// Sets a new target height and moves the plate one increment toward it
    pub fn set_target(&mut self, target: f64) {
        let start = if self.plate.is_finite() {
            self.plate
        } else {
            self.displacement
        };
        self.target = target;
        self.plate = step_toward(start, target, self.config.step);
        self.apply_plate();
        info!(self.logger, "new loading target"; "target" => target, "plate" => self.plate);
    }

    /// Shifts target and plate together by `offset`
    pub fn nudge_target(&mut self, offset: f64) {
        let base = if self.plate.is_finite() {
            self.plate
        } else {
            self.displacement
        };
        self.target = base + offset;
        self.plate = self.target;
        self.apply_plate();
    }

    /// Solves once and refreshes the readouts, regardless of the running flag
    pub fn step_once(&mut self) -> SolveReport {
        let report = self.solver.physics_solve(&mut self.mesh);

        self.displacement_prev = self.displacement;
        self.displacement = self.get_displacement();
        self.force_prev = self.force;
        self.force = self.reaction_force();

        report
    }

    /// Runs `ticks` solves without touching the plate
    pub fn settle(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.step_once();
        }
    }

    /// Solves until the unloaded structure is at rest: the residual is below
    /// `settle_tolerance` and the displacement stopped changing.
    ///
    /// # Returns
    /// `Converged` once at rest, `Stuck` if `max_ticks` run out first
    pub fn settle_until_still(&mut self, max_ticks: usize) -> TickStatus {
        let mut residual = f64::INFINITY;
        for tick in 1..=max_ticks {
            residual = self.step_once().residual;
            if residual < self.config.settle_tolerance
                && (self.displacement - self.displacement_prev).abs()
                    < self.config.displacement_threshold
            {
                debug!(self.logger, "structure at rest"; "ticks" => tick, "residual" => residual);
                return TickStatus::Converged;
            }
        }

        warn!(self.logger, "structure did not come to rest";
            "ticks" => max_ticks, "residual" => residual, "solver" => self.solver.name());
        TickStatus::Stuck
    }

    /// Whether the current increment has settled
    pub fn has_step_converged(&self) -> bool {
        self.ticks_in_step > 0
            && (self.displacement - self.displacement_prev).abs() < self.config.displacement_threshold
            && (self.force - self.force_prev).abs() < self.config.force_threshold
    }

    pub fn has_converged(&self) -> bool {
        self.converged
    }

    /// One solver invocation of the loading loop
    pub fn tick(&mut self) -> TickStatus {
        if !self.running {
            return TickStatus::Paused;
        }
        if self.converged {
            return TickStatus::Converged;
        }

        let report = self.step_once();
        self.ticks_in_step += 1;

        if self.has_step_converged() {
            let point = CurvePoint {
                plate: self.plate,
                displacement: self.displacement,
                force: self.force,
            };
            self.curve.push(point);
            info!(self.logger, "step converged";
                "plate" => point.plate, "displacement" => point.displacement,
                "force" => point.force, "ticks" => self.ticks_in_step);

            if self.plate == self.target {
                self.converged = true;
                return TickStatus::Converged;
            }
            self.plate = step_toward(self.plate, self.target, self.config.step);
            self.apply_plate();
            return TickStatus::StepConverged;
        }

        if self.ticks_in_step >= self.config.max_ticks_per_step {
            warn!(self.logger, "increment did not settle, loading stopped";
                "plate" => self.plate, "ticks" => self.ticks_in_step,
                "residual" => report.residual, "solver" => self.solver.name());
            self.running = false;
            return TickStatus::Stuck;
        }

        TickStatus::Solving
    }

    /// Ticks until the target is reached, loading gets stuck or `max_ticks`
    /// run out. Settled increments advance `progress`.
    ///
    /// # Returns
    /// The status of the last tick
    pub fn run(&mut self, max_ticks: usize, progress: &ProgressBar) -> TickStatus {
        self.running = true;
        let mut status = self.tick();
        let mut ticks = 1;
        loop {
            match status {
                TickStatus::StepConverged => progress.inc(1),
                TickStatus::Converged => {
                    progress.inc(1);
                    return status;
                }
                TickStatus::Stuck | TickStatus::Paused => return status,
                TickStatus::Solving => {}
            }
            if ticks >= max_ticks {
                return status;
            }
            status = self.tick();
            ticks += 1;
        }
    }

    /// Per-vertex arrows from each position along the negative gradient,
    /// scaled by `scale / k_global`
    pub fn force_arrows(&self, scale: f64) -> Vec<(Vector2<f64>, Vector2<f64>)> {
        let grad = self.mesh.gradient();
        let factor = scale / self.mesh.params().k_global;
        (0..self.mesh.vertex_count())
            .map(|i| {
                let p = self.mesh.get_vertex_position(i);
                let g = Vector2::new(grad[DIM * i], grad[DIM * i + 1]);
                (p, p - g * factor)
            })
            .collect()
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn force(&self) -> f64 {
        self.force
    }

    pub fn displacement(&self) -> f64 {
        self.displacement
    }

    pub fn plate(&self) -> f64 {
        self.plate
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn curve(&self) -> &[CurvePoint] {
        &self.curve
    }

    pub fn solver_name(&self) -> &str {
        self.solver.name()
    }

    pub fn last_report(&self) -> &SolveReport {
        self.solver.last_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::create_ruffle_stack,
        config::{SolverConfig, SolverKind},
        logging, solver,
    };
    use approx::assert_abs_diff_eq;

    fn controller(kind: SolverKind) -> LoadingController {
        let logger = logging::discard();
        let mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        let solver_config = SolverConfig {
            kind,
            ..Default::default()
        };
        let solver = solver::from_config(&solver_config, &logger);
        let mut controller =
            LoadingController::new(mesh, solver, LoadingConfig::default(), logger);
        controller.settle(10);
        assert_eq!(controller.settle_until_still(2000), TickStatus::Converged);
        let natural = controller.displacement();
        controller.place_plate(natural);
        controller
    }

    fn drive(controller: &mut LoadingController, target: f64) -> TickStatus {
        controller.set_target(target);
        controller.run(100_000, &ProgressBar::hidden())
    }

    #[test]
    fn step_toward_never_overshoots() {
        assert_eq!(step_toward(1.0, 0.0, 0.25), 0.75);
        assert_eq!(step_toward(0.1, 0.0, 0.25), 0.0);
        assert_eq!(step_toward(0.0, 1.0, 0.25), 0.25);
        assert_eq!(step_toward(0.9, 1.0, 0.25), 1.0);
        // accumulated rounding does not cost an extra increment
        assert_eq!(step_toward(0.1 + 0.2, 0.0, 0.3), 0.0);
    }

    #[test]
    fn paused_controller_does_nothing() {
        let mut controller = controller(SolverKind::Verlet);
        controller.set_target(controller.plate() - 0.25);
        let before = controller.mesh.x.clone();

        assert!(!controller.is_running());
        assert_eq!(controller.tick(), TickStatus::Paused);
        assert_eq!(controller.mesh.x, before);

        controller.step_once();
        assert_ne!(controller.mesh.x, before);
    }

    fn assert_compression_then_release(kind: SolverKind) {
        let mut controller = controller(kind);
        let natural = controller.displacement();
        assert_abs_diff_eq!(controller.plate(), natural);

        assert_eq!(drive(&mut controller, natural - 1.0), TickStatus::Converged);
        let compression: Vec<CurvePoint> = controller.curve().to_vec();
        assert_eq!(compression.len(), 4);
        for pair in compression.windows(2) {
            assert!(pair[1].plate < pair[0].plate);
            assert!(
                pair[1].force > pair[0].force,
                "{kind:?}: force dropped from {} to {}",
                pair[0].force,
                pair[1].force
            );
        }
        for point in &compression {
            assert!(point.force >= 0.0);
            assert!(point.displacement <= point.plate + 1e-12);
        }
        // the plate starts on the settled structure, so the first increment
        // already pushes on it
        assert!(compression[0].force > 0.0, "{kind:?}: first increment out of contact");
        assert_abs_diff_eq!(controller.displacement(), natural - 1.0, epsilon = 1e-9);
        assert!(controller.mesh.max_violation() <= 1e-12);

        let above = natural + 0.25;
        assert_eq!(drive(&mut controller, above), TickStatus::Converged);
        let released = controller.curve().last().unwrap();
        assert_eq!(released.plate, above);
        assert_abs_diff_eq!(released.force, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(controller.displacement(), natural, epsilon = 5e-2);
    }

    #[test]
    fn compression_then_release_verlet() {
        assert_compression_then_release(SolverKind::Verlet);
    }

    #[test]
    fn compression_then_release_lbfgs() {
        assert_compression_then_release(SolverKind::Lbfgs);
    }

    #[test]
    fn compression_then_release_combination() {
        assert_compression_then_release(SolverKind::Combination);
    }

    #[test]
    fn settled_structure_is_at_rest() {
        for kind in [SolverKind::Verlet, SolverKind::Lbfgs, SolverKind::Combination] {
            let mut controller = controller(kind);
            let config = LoadingConfig::default();
            assert!(controller.last_report().residual < config.settle_tolerance);

            // one more solve barely moves the top of the structure
            let before = controller.get_displacement();
            controller.step_once();
            assert_abs_diff_eq!(
                controller.get_displacement(),
                before,
                epsilon = config.displacement_threshold
            );
        }
    }

    #[test]
    fn settle_budget_reports_stuck() {
        let logger = logging::discard();
        let mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        let solver = solver::from_config(&SolverConfig::default(), &logger);
        let mut controller =
            LoadingController::new(mesh, solver, LoadingConfig::default(), logger);

        // the built structure still has to sag under gravity
        assert_eq!(controller.settle_until_still(1), TickStatus::Stuck);
        assert!(!controller.plate().is_finite());
    }

    fn assert_converged_state_is_idempotent(kind: SolverKind) {
        let mut controller = controller(kind);
        let natural = controller.displacement();
        assert_eq!(drive(&mut controller, natural - 0.5), TickStatus::Converged);

        let config = LoadingConfig::default();
        let x = controller.mesh.x.clone();
        let force = controller.force();
        let points = controller.curve().len();

        // the loading loop stays put once converged
        assert_eq!(controller.tick(), TickStatus::Converged);
        assert_eq!(controller.mesh.x, x);

        // and another solve from the converged state changes nothing material
        controller.step_once();
        let moved = (&controller.mesh.x - &x).amax();
        assert!(
            moved < config.displacement_threshold,
            "{kind:?}: converged state moved by {moved}"
        );
        assert!(
            (controller.force() - force).abs() < config.force_threshold,
            "{kind:?}: force changed from {force} to {}",
            controller.force()
        );
        assert_eq!(controller.curve().len(), points);
    }

    #[test]
    fn converged_state_is_idempotent_verlet() {
        assert_converged_state_is_idempotent(SolverKind::Verlet);
    }

    #[test]
    fn converged_state_is_idempotent_lbfgs() {
        assert_converged_state_is_idempotent(SolverKind::Lbfgs);
    }

    #[test]
    fn converged_state_is_idempotent_combination() {
        assert_converged_state_is_idempotent(SolverKind::Combination);
    }

    #[test]
    fn nudge_moves_plate_and_target_together() {
        let mut controller = controller(SolverKind::Verlet);
        let plate = controller.plate();
        controller.nudge_target(-0.1);
        assert_abs_diff_eq!(controller.plate(), plate - 0.1);
        assert_eq!(controller.plate(), controller.target());
        assert_eq!(controller.mesh.ub(Y_AXIS), controller.plate());
        assert!(!controller.has_converged());
    }

    #[test]
    fn tick_budget_stops_loading() {
        let logger = logging::discard();
        let mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        let solver = solver::from_config(&SolverConfig::default(), &logger);
        let config = LoadingConfig {
            max_ticks_per_step: 1,
            ..Default::default()
        };
        let mut controller = LoadingController::new(mesh, solver, config, logger);
        let natural = controller.displacement();
        controller.place_plate(natural);
        controller.set_target(natural - 1.0);
        controller.set_running(true);

        // the first tick after a plate move always sees it move
        assert_eq!(controller.tick(), TickStatus::Stuck);
        assert!(!controller.is_running());
    }

    #[test]
    fn arrows_follow_negative_gradient() {
        let controller = controller(SolverKind::Verlet);
        let arrows = controller.force_arrows(1000.0);
        let grad = controller.mesh.gradient();
        assert_eq!(arrows.len(), controller.mesh.vertex_count());
        for (i, (start, end)) in arrows.iter().enumerate() {
            assert_eq!(*start, controller.mesh.get_vertex_position(i));
            assert_abs_diff_eq!(end.y - start.y, -grad[DIM * i + 1], epsilon = 1e-12);
        }
    }
}
