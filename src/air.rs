use nalgebra::{DVector, Vector2};

/// Smallest enclosed area an air polygon may have
pub const MIN_AIR_AREA: f64 = 1e-9;

/// Closed polygon over the vertex chain that models the air trapped inside
/// the ruffle. Its energy penalises changes of the enclosed area.
#[derive(Debug, Clone)]
pub struct AirMesh {
    /// Polygon vertices in order; the last one connects back to the first
    pub loop_vertices: Vec<usize>,
    pub rest_area: f64,
    /// Sign that makes the enclosed area positive
    orientation: f64,
    /// Topology revision the loop was built for
    pub revision: u64,
}

fn point(x: &DVector<f64>, i: usize) -> Vector2<f64> {
    Vector2::new(x[2 * i], x[2 * i + 1])
}

/// Shoelace area of the polygon, positive for counter-clockwise loops
pub fn signed_area(loop_vertices: &[usize], x: &DVector<f64>) -> f64 {
    let n = loop_vertices.len();
    let mut area = 0.0;
    for k in 0..n {
        let p = point(x, loop_vertices[k]);
        let q = point(x, loop_vertices[(k + 1) % n]);
        area += p.x * q.y - q.x * p.y;
    }
    0.5 * area
}

impl AirMesh {
    /// Builds the polygon and takes the current enclosed area as rest area.
    ///
    /// Returns `None` when the loop encloses no area.
    pub fn from_loop(loop_vertices: Vec<usize>, x: &DVector<f64>, revision: u64) -> Option<AirMesh> {
        if loop_vertices.len() < 3 {
            return None;
        }
        let area = signed_area(&loop_vertices, x);
        if area.abs() < MIN_AIR_AREA {
            return None;
        }

        Some(AirMesh {
            loop_vertices,
            rest_area: area.abs(),
            orientation: area.signum(),
            revision,
        })
    }

    /// Replaces the polygon after a topology change, keeping the rest area
    pub fn relink(&mut self, loop_vertices: Vec<usize>, revision: u64) {
        self.loop_vertices = loop_vertices;
        self.revision = revision;
    }

    pub fn area(&self, x: &DVector<f64>) -> f64 {
        self.orientation * signed_area(&self.loop_vertices, x)
    }

    /// Energy `½·k·(A−A₀)²/A₀`, accumulating its gradient into `grad`
    pub fn energy(&self, x: &DVector<f64>, k_air: f64, grad: Option<&mut DVector<f64>>) -> f64 {
        if k_air == 0.0 {
            return 0.0;
        }
        let delta = self.area(x) - self.rest_area;
        let energy = 0.5 * k_air * delta * delta / self.rest_area;

        if let Some(grad) = grad {
            let scale = k_air * delta / self.rest_area * self.orientation;
            let n = self.loop_vertices.len();
            for k in 0..n {
                let i = self.loop_vertices[k];
                let prev = point(x, self.loop_vertices[(k + n - 1) % n]);
                let next = point(x, self.loop_vertices[(k + 1) % n]);
                grad[2 * i] += scale * 0.5 * (next.y - prev.y);
                grad[2 * i + 1] += scale * 0.5 * (prev.x - next.x);
            }
        }

        energy
    }

    /// Upper bound of the Hessian's largest eigenvalue, used for time step limits
    pub fn stiffness_bound(&self, x: &DVector<f64>, k_air: f64) -> f64 {
        let n = self.loop_vertices.len();
        let mut grad_sq = 0.0;
        for k in 0..n {
            let prev = point(x, self.loop_vertices[(k + n - 1) % n]);
            let next = point(x, self.loop_vertices[(k + 1) % n]);
            grad_sq += 0.25 * (next - prev).norm_squared();
        }
        k_air / self.rest_area * grad_sq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_square() -> DVector<f64> {
        DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0])
    }

    #[test]
    fn shoelace_area() {
        let x = unit_square();
        assert_relative_eq!(signed_area(&[0, 1, 2, 3], &x), 1.0);
        assert_relative_eq!(signed_area(&[3, 2, 1, 0], &x), -1.0);
    }

    #[test]
    fn clockwise_loop_has_positive_area() {
        let x = unit_square();
        let air = AirMesh::from_loop(vec![3, 2, 1, 0], &x, 0).unwrap();
        assert_relative_eq!(air.area(&x), 1.0);
        assert_relative_eq!(air.energy(&x, 5.0, None), 0.0);
    }

    #[test]
    fn degenerate_loop_is_rejected() {
        let x = DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0]);
        assert!(AirMesh::from_loop(vec![0, 1, 2], &x, 0).is_none());
        assert!(AirMesh::from_loop(vec![0, 1], &x, 0).is_none());
    }

    #[test]
    fn compression_pushes_back() {
        let x = unit_square();
        let air = AirMesh::from_loop(vec![0, 1, 2, 3], &x, 0).unwrap();

        let mut squeezed = x.clone();
        squeezed[5] = 0.5;
        squeezed[7] = 0.5;
        let mut grad = DVector::zeros(8);
        let energy = air.energy(&squeezed, 2.0, Some(&mut grad));

        assert!(energy > 0.0);
        // lowering the top edge further would raise the energy
        assert!(grad[5] < 0.0);
        assert!(grad[7] < 0.0);
    }
}
