use indicatif::{ProgressBar, ProgressStyle};
use slog::{info, warn, Logger};

use crate::{
    builder::{build_horizontal_stack, build_ruffle_stack, densify},
    config::{Layout, RuffleConfig},
    controller::{LoadingController, TickStatus},
    datatypes::CurvePoint,
    error::RuffleError,
    mesh::ElasticMesh,
    solver,
};

/// Result of a full compression experiment
pub struct ExperimentOutcome {
    pub curve: Vec<CurvePoint>,
    /// Height of the settled structure before the plate touched it
    pub natural_height: f64,
    pub status: TickStatus,
    pub controller: LoadingController,
}

/// Builds the configured structure and applies the requested refinements
pub fn build_mesh(config: &RuffleConfig) -> Result<ElasticMesh, RuffleError> {
    let structure = &config.structure;
    let mut mesh = match structure.layout {
        Layout::Stack => build_ruffle_stack(
            structure.fold_count,
            structure.fold_width,
            structure.fold_length,
            structure.thickness,
            structure.segments_per_fold,
            config.material.clone(),
        )?,
        Layout::Horizontal => build_horizontal_stack(
            structure.fold_count,
            structure.fold_width,
            structure.fold_height,
            structure.thickness,
            structure.segments_per_fold,
            config.material.clone(),
        )?,
    };

    for section in &structure.densify {
        densify(&mut mesh, *section)?;
    }

    Ok(mesh)
}

/// Builds the structure, lets it settle under gravity (before and after the
/// air mesh is taken) until it is at rest, and lowers the plate onto it.
pub fn prepare(config: &RuffleConfig, logger: &Logger) -> Result<LoadingController, RuffleError> {
    let mut mesh = build_mesh(config)?;
    mesh.update_vertex_mass()?;
    info!(logger, "built structure";
        "vertices" => mesh.vertex_count(), "segments" => mesh.segments().len(),
        "sections" => mesh.sections().len());

    let solver = solver::from_config(&config.solver, logger);
    let mut controller =
        LoadingController::new(mesh, solver, config.loading.clone(), logger.clone());

    controller.settle(config.loading.settle_ticks);
    if config.structure.air_mesh {
        if let Err(err) = controller.mesh.generate_air_mesh() {
            warn!(logger, "continuing without air mesh"; "error" => %err);
        }
    }
    controller.settle(config.loading.settle_ticks);
    if controller.settle_until_still(config.loading.max_ticks_per_step) == TickStatus::Stuck {
        warn!(logger, "placing the plate on a structure that is still moving";
            "residual" => controller.last_report().residual);
    }

    let natural = controller.get_displacement();
    controller.place_plate(natural);
    info!(logger, "structure settled";
        "height" => natural, "solver" => controller.solver_name());

    Ok(controller)
}

fn progress_bar(config: &RuffleConfig) -> Result<ProgressBar, RuffleError> {
    if !config.loading.progress {
        return Ok(ProgressBar::hidden());
    }

    let step = config.loading.step;
    let mut increments = (config.loading.compression / step).ceil() as u64;
    if config.loading.release {
        increments += ((config.loading.compression + step) / step).ceil() as u64;
    }

    let bar = ProgressBar::new(increments);
    let style = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} increments")
        .map_err(|err| RuffleError::Config(format!("Bad progress template: {err}")))?;
    bar.set_style(style);
    bar.set_message("loading");
    Ok(bar)
}

/// Compresses the settled structure by `compression` and, if configured,
/// walks the plate back up until it clears the structure.
pub fn run(config: &RuffleConfig, logger: &Logger) -> Result<ExperimentOutcome, RuffleError> {
    let mut controller = prepare(config, logger)?;
    let natural_height = controller.displacement();
    let bar = progress_bar(config)?;

    // every increment is bounded by max_ticks_per_step
    let tick_budget = usize::MAX;

    let mut status = TickStatus::Converged;
    if config.loading.compression > 0.0 {
        controller.set_target(natural_height - config.loading.compression);
        status = controller.run(tick_budget, &bar);
    }
    if config.loading.release && status == TickStatus::Converged {
        controller.set_target(natural_height + config.loading.step);
        status = controller.run(tick_budget, &bar);
    }
    bar.finish_with_message("done");

    match status {
        TickStatus::Converged => info!(logger, "loading finished";
            "points" => controller.curve().len()),
        _ => warn!(logger, "loading ended early";
            "status" => ?status, "plate" => controller.plate()),
    }

    Ok(ExperimentOutcome {
        curve: controller.curve().to_vec(),
        natural_height,
        status,
        controller,
    })
}
