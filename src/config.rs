use json::JsonValue;

use crate::{builder::DEFAULT_SEGMENTS_PER_FOLD, datatypes::MaterialParams, error::RuffleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Folds rise vertically, pressed from above at the top vertex
    Stack,
    /// Folds run along the floor, pressed at every upper corner
    Horizontal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureConfig {
    pub layout: Layout,
    pub fold_count: usize,
    pub fold_width: f64,
    /// Strip length per fold, used by [`Layout::Stack`]
    pub fold_length: f64,
    /// Corner height, used by [`Layout::Horizontal`]
    pub fold_height: f64,
    pub thickness: f64,
    pub segments_per_fold: usize,
    /// Sections to refine by halving, applied in order
    pub densify: Vec<usize>,
    pub air_mesh: bool,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            layout: Layout::Stack,
            fold_count: 2,
            fold_width: 3.0,
            fold_length: 5.28,
            fold_height: 2.0,
            thickness: 0.5,
            segments_per_fold: DEFAULT_SEGMENTS_PER_FOLD,
            densify: Vec::new(),
            air_mesh: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerletConfig {
    /// Requested time step; shortened when the mesh is too stiff for it
    pub timestep: f64,
    /// Fraction of velocity removed every step
    pub damping: f64,
    /// Integration steps per solve
    pub steps: usize,
    pub tolerance: f64,
}

impl Default for VerletConfig {
    fn default() -> Self {
        Self {
            timestep: 0.01,
            damping: 0.1,
            steps: 100,
            tolerance: 1e-6,
        }
    }
}

impl VerletConfig {
    pub fn validate(&self) -> Result<(), RuffleError> {
        positive("timestep", self.timestep)?;
        positive("verlet tolerance", self.tolerance)?;
        if !(0.0..1.0).contains(&self.damping) {
            return Err(RuffleError::Config(format!(
                "damping must lie in [0, 1), got {}",
                self.damping
            )));
        }
        if self.steps == 0 {
            return Err(RuffleError::Config("steps must be positive".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LbfgsConfig {
    pub max_iters: u64,
    /// Number of correction pairs kept by L-BFGS
    pub memory: usize,
    /// Gradient norm at which argmin stops
    pub tolerance: f64,
    /// Weight of the quadratic bound penalty
    pub penalty: f64,
    /// Log every argmin iteration to the terminal
    pub trace: bool,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            max_iters: 200,
            memory: 7,
            tolerance: 1e-6,
            penalty: 1e6,
            trace: false,
        }
    }
}

impl LbfgsConfig {
    pub fn validate(&self) -> Result<(), RuffleError> {
        positive("lbfgs tolerance", self.tolerance)?;
        positive("penalty", self.penalty)?;
        if self.max_iters == 0 || self.memory == 0 {
            return Err(RuffleError::Config(
                "max_iters and memory must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    Verlet,
    Lbfgs,
    Combination,
}

impl SolverKind {
    pub fn parse(name: &str) -> Result<SolverKind, RuffleError> {
        match name {
            "verlet" => Ok(SolverKind::Verlet),
            "lbfgs" => Ok(SolverKind::Lbfgs),
            "combination" => Ok(SolverKind::Combination),
            other => Err(RuffleError::Input(format!(
                "Unknown solver kind '{other}'; expected verlet, lbfgs or combination"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub kind: SolverKind,
    pub verlet: VerletConfig,
    pub lbfgs: LbfgsConfig,
    /// Verlet step size below which the hybrid refines with L-BFGS
    pub switch_threshold: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            kind: SolverKind::Verlet,
            verlet: VerletConfig::default(),
            lbfgs: LbfgsConfig::default(),
            switch_threshold: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadingConfig {
    /// Plate travel per increment
    pub step: f64,
    /// Total plate travel below the natural height
    pub compression: f64,
    /// Walk the plate back above the natural height afterwards
    pub release: bool,
    /// Solves run before the air mesh is built, and again after
    pub settle_ticks: usize,
    /// Residual under which the unloaded structure counts as at rest
    pub settle_tolerance: f64,
    pub displacement_threshold: f64,
    pub force_threshold: f64,
    /// Vertices closer than this to the plate count as touching it
    pub contact_tolerance: f64,
    pub max_ticks_per_step: usize,
    pub progress: bool,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            step: 0.25,
            compression: 1.0,
            release: true,
            settle_ticks: 10,
            settle_tolerance: 1e-3,
            displacement_threshold: 1e-3,
            force_threshold: 1e-2,
            contact_tolerance: 1e-3,
            max_ticks_per_step: 2000,
            progress: true,
        }
    }
}

impl LoadingConfig {
    pub fn validate(&self) -> Result<(), RuffleError> {
        positive("step", self.step)?;
        positive("settle_tolerance", self.settle_tolerance)?;
        positive("displacement_threshold", self.displacement_threshold)?;
        positive("force_threshold", self.force_threshold)?;
        positive("contact_tolerance", self.contact_tolerance)?;
        if !(self.compression >= 0.0) || !self.compression.is_finite() {
            return Err(RuffleError::Config(format!(
                "compression must be non-negative, got {}",
                self.compression
            )));
        }
        if self.max_ticks_per_step == 0 {
            return Err(RuffleError::Config(
                "max_ticks_per_step must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Everything one experiment run needs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuffleConfig {
    pub structure: StructureConfig,
    pub material: MaterialParams,
    pub solver: SolverConfig,
    pub loading: LoadingConfig,
}

impl RuffleConfig {
    pub fn validate(&self) -> Result<(), RuffleError> {
        let structure = &self.structure;
        if structure.fold_count == 0 || structure.segments_per_fold == 0 {
            return Err(RuffleError::Config(
                "fold_count and segments_per_fold must be positive".to_owned(),
            ));
        }
        positive("fold_width", structure.fold_width)?;
        positive("thickness", structure.thickness)?;
        match structure.layout {
            Layout::Stack => positive("fold_length", structure.fold_length)?,
            Layout::Horizontal => positive("fold_height", structure.fold_height)?,
        }

        self.material.validate()?;
        self.solver.verlet.validate()?;
        self.solver.lbfgs.validate()?;
        if !(self.solver.switch_threshold >= 0.0) {
            return Err(RuffleError::Config(
                "switch_threshold must be non-negative".to_owned(),
            ));
        }
        self.loading.validate()
    }
}

fn positive(name: &str, value: f64) -> Result<(), RuffleError> {
    if !(value > 0.0) || !value.is_finite() {
        return Err(RuffleError::Config(format!(
            "{name} must be positive, got {value}"
        )));
    }
    Ok(())
}

/// Parses the input json into a JsonValue object
///
/// # Arguments
/// * `input_file` - Path to the input json
fn load_input_file(input_file: &str) -> Result<JsonValue, RuffleError> {
    let file_string = match std::fs::read_to_string(input_file) {
        Ok(s) => s,
        Err(err) => {
            return Err(RuffleError::Input(format!(
                "Unable to read input file {input_file}: {err}"
            )));
        }
    };

    let input_json = match json::parse(&file_string) {
        Ok(v) => v,
        Err(err) => {
            return Err(RuffleError::Input(format!(
                "Error in input file json: {err}"
            )));
        }
    };

    Ok(input_json)
}

fn read_f64(section: &JsonValue, key: &str, default: f64) -> Result<f64, RuffleError> {
    if !section.has_key(key) {
        return Ok(default);
    }
    section[key]
        .as_f64()
        .ok_or_else(|| RuffleError::Input(format!("Field {key} must be a number")))
}

fn read_usize(section: &JsonValue, key: &str, default: usize) -> Result<usize, RuffleError> {
    if !section.has_key(key) {
        return Ok(default);
    }
    section[key]
        .as_usize()
        .ok_or_else(|| RuffleError::Input(format!("Field {key} must be a non-negative integer")))
}

fn read_bool(section: &JsonValue, key: &str, default: bool) -> Result<bool, RuffleError> {
    if !section.has_key(key) {
        return Ok(default);
    }
    section[key]
        .as_bool()
        .ok_or_else(|| RuffleError::Input(format!("Field {key} must be true or false")))
}

fn require_f64(section: &JsonValue, key: &str, section_name: &str) -> Result<f64, RuffleError> {
    if !section.has_key(key) {
        return Err(RuffleError::Input(format!(
            "Input json missing {key} field in {section_name} section"
        )));
    }
    read_f64(section, key, 0.0)
}

fn parse_structure(input_json: &JsonValue) -> Result<StructureConfig, RuffleError> {
    let section = &input_json["structure"];
    let defaults = StructureConfig::default();

    let layout = if section.has_key("layout") {
        match section["layout"].as_str() {
            Some("stack") => Layout::Stack,
            Some("horizontal") => Layout::Horizontal,
            _ => {
                return Err(RuffleError::Input(
                    "Field layout must be \"stack\" or \"horizontal\"".to_owned(),
                ))
            }
        }
    } else {
        Layout::Stack
    };

    if !section.has_key("fold_count") {
        return Err(RuffleError::Input(
            "Input json missing fold_count field in structure section".to_owned(),
        ));
    }
    let fold_count = read_usize(section, "fold_count", 0)?;
    let fold_width = require_f64(section, "fold_width", "structure")?;
    let thickness = require_f64(section, "thickness", "structure")?;
    let (fold_length, fold_height) = match layout {
        Layout::Stack => (require_f64(section, "fold_length", "structure")?, 0.0),
        Layout::Horizontal => (0.0, require_f64(section, "fold_height", "structure")?),
    };

    let mut densify = Vec::new();
    if section.has_key("densify") {
        if !section["densify"].is_array() {
            return Err(RuffleError::Input(
                "Field densify must be an array of section indices".to_owned(),
            ));
        }
        for member in section["densify"].members() {
            match member.as_usize() {
                Some(index) => densify.push(index),
                None => {
                    return Err(RuffleError::Input(format!(
                        "Bad section index in densify: {member}"
                    )))
                }
            }
        }
    }

    Ok(StructureConfig {
        layout,
        fold_count,
        fold_width,
        fold_length,
        fold_height,
        thickness,
        segments_per_fold: read_usize(section, "segments_per_fold", defaults.segments_per_fold)?,
        densify,
        air_mesh: read_bool(section, "air_mesh", defaults.air_mesh)?,
    })
}

fn parse_material(input_json: &JsonValue, thickness: f64) -> Result<MaterialParams, RuffleError> {
    let section = &input_json["material"];
    let defaults = MaterialParams::default();

    Ok(MaterialParams {
        density: read_f64(section, "density", defaults.density)?,
        thickness,
        k_global: read_f64(section, "k_global", defaults.k_global)?,
        k_bend: read_f64(section, "k_bend", defaults.k_bend)?,
        k_air: read_f64(section, "k_air", defaults.k_air)?,
        gravity: read_f64(section, "gravity", defaults.gravity)?,
    })
}

fn parse_solver(input_json: &JsonValue) -> Result<SolverConfig, RuffleError> {
    let section = &input_json["solver"];
    let defaults = SolverConfig::default();

    let kind = if section.has_key("kind") {
        match section["kind"].as_str() {
            Some(name) => SolverKind::parse(name)?,
            None => {
                return Err(RuffleError::Input(
                    "Field kind must be a string".to_owned(),
                ))
            }
        }
    } else {
        defaults.kind
    };

    let verlet = VerletConfig {
        timestep: read_f64(section, "timestep", defaults.verlet.timestep)?,
        damping: read_f64(section, "damping", defaults.verlet.damping)?,
        steps: read_usize(section, "steps", defaults.verlet.steps)?,
        tolerance: read_f64(section, "verlet_tolerance", defaults.verlet.tolerance)?,
    };
    let lbfgs = LbfgsConfig {
        max_iters: read_usize(section, "max_iters", defaults.lbfgs.max_iters as usize)? as u64,
        memory: read_usize(section, "memory", defaults.lbfgs.memory)?,
        tolerance: read_f64(section, "lbfgs_tolerance", defaults.lbfgs.tolerance)?,
        penalty: read_f64(section, "penalty", defaults.lbfgs.penalty)?,
        trace: read_bool(section, "trace", defaults.lbfgs.trace)?,
    };

    Ok(SolverConfig {
        kind,
        verlet,
        lbfgs,
        switch_threshold: read_f64(section, "switch_threshold", defaults.switch_threshold)?,
    })
}

fn parse_loading(input_json: &JsonValue) -> Result<LoadingConfig, RuffleError> {
    let section = &input_json["loading"];
    let defaults = LoadingConfig::default();

    Ok(LoadingConfig {
        step: read_f64(section, "step", defaults.step)?,
        compression: read_f64(section, "compression", defaults.compression)?,
        release: read_bool(section, "release", defaults.release)?,
        settle_ticks: read_usize(section, "settle_ticks", defaults.settle_ticks)?,
        settle_tolerance: read_f64(section, "settle_tolerance", defaults.settle_tolerance)?,
        displacement_threshold: read_f64(
            section,
            "displacement_threshold",
            defaults.displacement_threshold,
        )?,
        force_threshold: read_f64(section, "force_threshold", defaults.force_threshold)?,
        contact_tolerance: read_f64(section, "contact_tolerance", defaults.contact_tolerance)?,
        max_ticks_per_step: read_usize(
            section,
            "max_ticks_per_step",
            defaults.max_ticks_per_step,
        )?,
        progress: read_bool(section, "progress", defaults.progress)?,
    })
}

/// Builds a validated configuration from parsed input json
///
/// # Arguments
/// * `input_json` - The input file as a JsonValue object
pub fn parse_config(input_json: &JsonValue) -> Result<RuffleConfig, RuffleError> {
    if !input_json.has_key("structure") {
        return Err(RuffleError::Input(
            "Input json missing structure field".to_owned(),
        ));
    }

    let structure = parse_structure(input_json)?;
    let config = RuffleConfig {
        material: parse_material(input_json, structure.thickness)?,
        structure,
        solver: parse_solver(input_json)?,
        loading: parse_loading(input_json)?,
    };
    config.validate()?;

    Ok(config)
}

/// Reads, parses and validates an input file
pub fn load(input_file: &str) -> Result<RuffleConfig, RuffleError> {
    let input_json = load_input_file(input_file)?;
    parse_config(&input_json)
}
