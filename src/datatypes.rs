use crate::error::RuffleError;

/// Number of coordinates per vertex
pub const DIM: usize = 2;

/// Index of the vertical axis, the one the plate bounds
pub const Y_AXIS: usize = 1;

/// A point mass. Its position lives in the mesh's state vector.
#[derive(Debug, Clone)]
pub struct Vertex {
    pub fixed: [bool; DIM],
    pub mass: f64,
}

impl Vertex {
    pub fn pinned(fixed: [bool; DIM]) -> Vertex {
        Vertex { fixed, mass: 0.0 }
    }
}

/// A stretch spring between two vertices
#[derive(Debug, Clone)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub rest_length: f64,
    /// Multiplier on the global stretch stiffness
    pub stiffness_scale: f64,
}

/// One fold of the ruffle: an ordered run of connected segments
#[derive(Debug, Clone, Default)]
pub struct Section {
    pub segments: Vec<usize>,
}

/// Bending triple `a -> b -> c` around the shared vertex `b`.
///
/// Derived from segment adjacency; rebuilt whenever sections change.
#[derive(Debug, Clone)]
pub struct Bend {
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub rest_angle: f64,
    /// Sum of the rest lengths of both segments
    pub rest_span: f64,
}

/// Global physical parameters of a mesh
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialParams {
    /// Areal density of the sheet
    pub density: f64,
    /// Sheet thickness; with density gives mass per unit length
    pub thickness: f64,
    pub k_global: f64,
    pub k_bend: f64,
    /// Stiffness of the enclosed-air term, zero disables it
    pub k_air: f64,
    pub gravity: f64,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            density: 0.160,
            thickness: 0.5,
            k_global: 1000.0,
            k_bend: 100.0,
            k_air: 0.0,
            gravity: 9.81,
        }
    }
}

impl MaterialParams {
    /// Rejects parameters that would produce meaningless energies
    pub fn validate(&self) -> Result<(), RuffleError> {
        let positive = [
            ("density", self.density),
            ("thickness", self.thickness),
            ("k_global", self.k_global),
            ("k_bend", self.k_bend),
        ];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(RuffleError::Config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(self.k_air >= 0.0) || !self.k_air.is_finite() {
            return Err(RuffleError::Config(format!(
                "k_air must be non-negative, got {}",
                self.k_air
            )));
        }
        if !self.gravity.is_finite() {
            return Err(RuffleError::Config("gravity must be finite".to_owned()));
        }
        Ok(())
    }
}

/// One step-converged sample of the force-displacement curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    pub plate: f64,
    pub displacement: f64,
    pub force: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_material_is_valid() {
        assert!(MaterialParams::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_parameters() {
        let params = MaterialParams {
            density: 0.0,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(RuffleError::Config(_))));

        let params = MaterialParams {
            k_bend: -1.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = MaterialParams {
            k_global: f64::NAN,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = MaterialParams {
            k_air: -0.5,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }
}
