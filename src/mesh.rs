use std::f64::consts::{PI, TAU};

use nalgebra::{DVector, Vector2};

use crate::{
    air::AirMesh,
    datatypes::{Bend, MaterialParams, Section, Segment, Vertex, DIM},
    error::RuffleError,
};

/// Segments and edges shorter than this are treated as degenerate
pub const EPSILON_LENGTH: f64 = 1e-12;

/// Reads the position of vertex `i` out of a state vector
pub fn point(x: &DVector<f64>, i: usize) -> Vector2<f64> {
    Vector2::new(x[DIM * i], x[DIM * i + 1])
}

fn add_to(grad: &mut DVector<f64>, i: usize, value: Vector2<f64>) {
    grad[DIM * i] += value.x;
    grad[DIM * i + 1] += value.y;
}

/// Signed angle that rotates `e1` onto `e2`, in (-π, π]
pub fn turning_angle(e1: &Vector2<f64>, e2: &Vector2<f64>) -> f64 {
    (e1.x * e2.y - e1.y * e2.x).atan2(e1.dot(e2))
}

fn wrap_angle(angle: f64) -> f64 {
    let mut angle = angle;
    while angle > PI {
        angle -= TAU;
    }
    while angle <= -PI {
        angle += TAU;
    }
    angle
}

/// Discretized elastic strip: point masses joined by stretch springs, with
/// bending resistance at every vertex shared by two consecutive segments.
///
/// Vertices, segments and sections live in index arenas. Indices are stable:
/// refinement only appends.
#[derive(Debug, Clone)]
pub struct ElasticMesh {
    params: MaterialParams,
    vertices: Vec<Vertex>,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    bends: Vec<Bend>,
    /// Interleaved vertex coordinates `[x0, y0, x1, y1, ...]`
    pub x: DVector<f64>,
    /// Vertex velocities, same layout as `x`
    pub v: DVector<f64>,
    /// As-built geometry, the source of rest lengths and rest angles
    rest: DVector<f64>,
    lb: [f64; DIM],
    ub: [f64; DIM],
    air: Option<AirMesh>,
    revision: u64,
    masses_stale: bool,
}

impl ElasticMesh {
    pub fn new(params: MaterialParams) -> Result<ElasticMesh, RuffleError> {
        params.validate()?;

        Ok(ElasticMesh {
            params,
            vertices: Vec::new(),
            segments: Vec::new(),
            sections: Vec::new(),
            bends: Vec::new(),
            x: DVector::zeros(0),
            v: DVector::zeros(0),
            rest: DVector::zeros(0),
            lb: [f64::NEG_INFINITY; DIM],
            ub: [f64::INFINITY; DIM],
            air: None,
            revision: 0,
            masses_stale: true,
        })
    }

    /// Number of scalar coordinates in the state vector
    pub fn dof(&self) -> usize {
        DIM * self.vertices.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn bends(&self) -> &[Bend] {
        &self.bends
    }

    pub fn params(&self) -> &MaterialParams {
        &self.params
    }

    /// Mutable access to the material. Masses are stale until
    /// [`ElasticMesh::update_vertex_mass`] runs again.
    pub fn params_mut(&mut self) -> &mut MaterialParams {
        self.masses_stale = true;
        &mut self.params
    }

    /// Counter bumped on every topology change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn air_mesh(&self) -> Option<&AirMesh> {
        self.air.as_ref()
    }

    pub fn get_vertex_position(&self, vertex: usize) -> Vector2<f64> {
        point(&self.x, vertex)
    }

    pub fn rest_position(&self, vertex: usize) -> Vector2<f64> {
        point(&self.rest, vertex)
    }

    pub fn ub(&self, axis: usize) -> f64 {
        self.ub[axis]
    }

    pub fn ub_mut(&mut self, axis: usize) -> &mut f64 {
        &mut self.ub[axis]
    }

    pub fn lb(&self, axis: usize) -> f64 {
        self.lb[axis]
    }

    pub fn lb_mut(&mut self, axis: usize) -> &mut f64 {
        &mut self.lb[axis]
    }

    pub fn is_free_coordinate(&self, coordinate: usize) -> bool {
        !self.vertices[coordinate / DIM].fixed[coordinate % DIM]
    }

    /// Indices into `x` of every coordinate a solver may move
    pub fn free_coordinates(&self) -> Vec<usize> {
        (0..self.dof())
            .filter(|c| self.is_free_coordinate(*c))
            .collect()
    }

    /// Adds a vertex at `position`, which is also its rest position
    pub fn add_vertex(&mut self, position: Vector2<f64>, fixed: [bool; DIM]) -> usize {
        self.insert_vertex(position, position, Vector2::zeros(), fixed);
        self.after_topology_change();
        self.vertices.len() - 1
    }

    pub(crate) fn insert_vertex(
        &mut self,
        position: Vector2<f64>,
        rest_position: Vector2<f64>,
        velocity: Vector2<f64>,
        fixed: [bool; DIM],
    ) -> usize {
        let n = self.dof();
        for (state, value) in [
            (&mut self.x, position),
            (&mut self.v, velocity),
            (&mut self.rest, rest_position),
        ] {
            // grows in place, earlier entries are kept
            state.resize_vertically_mut(n + DIM, 0.0);
            state.fixed_rows_mut::<DIM>(n).copy_from(&value);
        }
        self.vertices.push(Vertex::pinned(fixed));
        self.masses_stale = true;

        self.vertices.len() - 1
    }

    /// Connects `chain` with segments and registers them as one section.
    ///
    /// Rest lengths come from the rest geometry and must be positive.
    pub fn add_section(&mut self, chain: &[usize]) -> Result<usize, RuffleError> {
        if chain.len() < 2 {
            return Err(RuffleError::Config(
                "A section needs at least two vertices".to_owned(),
            ));
        }
        if let Some(bad) = chain.iter().find(|i| **i >= self.vertices.len()) {
            return Err(RuffleError::Topology(format!(
                "Section references missing vertex {bad}"
            )));
        }

        let mut section = Section::default();
        for pair in chain.windows(2) {
            let rest_length = (self.rest_position(pair[1]) - self.rest_position(pair[0])).norm();
            if !(rest_length > EPSILON_LENGTH) {
                return Err(RuffleError::Config(format!(
                    "Segment {} -> {} has non-positive rest length",
                    pair[0], pair[1]
                )));
            }
            section.segments.push(self.segments.len());
            self.segments.push(Segment {
                start: pair[0],
                end: pair[1],
                rest_length,
                stiffness_scale: 1.0,
            });
        }
        self.sections.push(section);
        self.after_topology_change();

        Ok(self.sections.len() - 1)
    }

    pub(crate) fn segments_mut(&mut self) -> &mut Vec<Segment> {
        &mut self.segments
    }

    pub(crate) fn sections_mut(&mut self) -> &mut Vec<Section> {
        &mut self.sections
    }

    /// Finishes a batch of topology edits: bends, air loop and masses are
    /// brought back in line with the new connectivity.
    pub(crate) fn commit_topology(&mut self) -> Result<(), RuffleError> {
        self.after_topology_change();
        self.update_vertex_mass()
    }

    fn after_topology_change(&mut self) {
        self.revision += 1;
        self.masses_stale = true;
        self.rebuild_bends();

        let order = self.chain_order();
        let revision = self.revision;
        if let Some(air) = self.air.as_mut() {
            air.relink(order, revision);
        }
    }

    /// Regenerates bending triples from segment adjacency
    fn rebuild_bends(&mut self) {
        let n = self.vertices.len();
        let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, seg) in self.segments.iter().enumerate() {
            incoming[seg.end].push(i);
            outgoing[seg.start].push(i);
        }

        let mut bends = Vec::new();
        for b in 0..n {
            for s_in in &incoming[b] {
                for s_out in &outgoing[b] {
                    let seg_in = &self.segments[*s_in];
                    let seg_out = &self.segments[*s_out];
                    let e1 = self.rest_position(b) - self.rest_position(seg_in.start);
                    let e2 = self.rest_position(seg_out.end) - self.rest_position(b);

                    bends.push(Bend {
                        a: seg_in.start,
                        b,
                        c: seg_out.end,
                        rest_angle: turning_angle(&e1, &e2),
                        rest_span: seg_in.rest_length + seg_out.rest_length,
                    });
                }
            }
        }
        self.bends = bends;
    }

    /// Vertices in the order the sections traverse them
    pub fn chain_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = Vec::with_capacity(self.vertices.len());
        for section in &self.sections {
            for s in &section.segments {
                let seg = &self.segments[*s];
                if order.last() != Some(&seg.start) {
                    order.push(seg.start);
                }
                order.push(seg.end);
            }
        }
        order
    }

    /// Recomputes vertex masses from density and each vertex's half share of
    /// the adjacent segments' rest lengths.
    pub fn update_vertex_mass(&mut self) -> Result<(), RuffleError> {
        self.params.validate()?;

        let linear_density = self.params.density * self.params.thickness;
        for vertex in self.vertices.iter_mut() {
            vertex.mass = 0.0;
        }
        for seg in &self.segments {
            let share = 0.5 * linear_density * seg.rest_length;
            self.vertices[seg.start].mass += share;
            self.vertices[seg.end].mass += share;
        }
        self.masses_stale = false;

        Ok(())
    }

    pub fn masses_stale(&self) -> bool {
        self.masses_stale
    }

    /// Builds the enclosed-air polygon over the current chain, taking the
    /// present enclosed area as its rest area.
    pub fn generate_air_mesh(&mut self) -> Result<(), RuffleError> {
        let order = self.chain_order();
        match AirMesh::from_loop(order, &self.x, self.revision) {
            Some(air) => {
                self.air = Some(air);
                Ok(())
            }
            None => Err(RuffleError::Topology(
                "Air mesh encloses no area".to_owned(),
            )),
        }
    }

    /// Total potential energy at state `x`.
    ///
    /// When `grad` is given it is overwritten with the exact gradient in the
    /// layout of `x`, fixed coordinates included.
    pub fn energy(&self, x: &DVector<f64>, mut grad: Option<&mut DVector<f64>>) -> f64 {
        if let Some(g) = grad.as_deref_mut() {
            assert_eq!(g.len(), self.dof(), "gradient buffer sized for another topology");
            g.fill(0.0);
        }
        let params = &self.params;
        let mut energy = 0.0;

        // stretch
        for seg in &self.segments {
            let d = point(x, seg.end) - point(x, seg.start);
            let length = d.norm();
            let k = params.k_global * seg.stiffness_scale;
            let strain = length - seg.rest_length;
            energy += 0.5 * k * strain * strain / seg.rest_length;

            if let Some(g) = grad.as_deref_mut() {
                if length > EPSILON_LENGTH {
                    let f = d * (k * strain / (seg.rest_length * length));
                    add_to(g, seg.start, -f);
                    add_to(g, seg.end, f);
                }
            }
        }

        // bending
        for bend in &self.bends {
            let e1 = point(x, bend.b) - point(x, bend.a);
            let e2 = point(x, bend.c) - point(x, bend.b);
            let l1 = e1.norm_squared();
            let l2 = e2.norm_squared();
            if l1 < EPSILON_LENGTH * EPSILON_LENGTH || l2 < EPSILON_LENGTH * EPSILON_LENGTH {
                continue;
            }

            let dtheta = wrap_angle(turning_angle(&e1, &e2) - bend.rest_angle);
            energy += params.k_bend * dtheta * dtheta / bend.rest_span;

            if let Some(g) = grad.as_deref_mut() {
                let de = 2.0 * params.k_bend * dtheta / bend.rest_span;
                let d1 = Vector2::new(-e1.y, e1.x) / l1;
                let d2 = Vector2::new(-e2.y, e2.x) / l2;
                add_to(g, bend.a, d1 * de);
                add_to(g, bend.c, d2 * de);
                add_to(g, bend.b, -(d1 + d2) * de);
            }
        }

        // gravity
        if params.gravity != 0.0 {
            for (i, vertex) in self.vertices.iter().enumerate() {
                let weight = vertex.mass * params.gravity;
                energy += weight * x[DIM * i + 1];
                if let Some(g) = grad.as_deref_mut() {
                    g[DIM * i + 1] += weight;
                }
            }
        }

        if let Some(air) = &self.air {
            debug_assert_eq!(air.revision, self.revision, "stale air mesh");
            if air.revision == self.revision {
                energy += air.energy(x, params.k_air, grad.as_deref_mut());
            }
        }

        energy
    }

    /// Gradient of the energy at the current state
    pub fn gradient(&self) -> DVector<f64> {
        let mut grad = DVector::zeros(self.dof());
        self.energy(&self.x, Some(&mut grad));
        grad
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, vertex)| {
                0.5 * vertex.mass * (point(&self.v, i)).norm_squared()
            })
            .sum()
    }

    /// Clamps free coordinates into `[lb, ub]` and stops any velocity pointing
    /// further out. Returns how many coordinates were clamped.
    pub fn project(&mut self) -> usize {
        let mut clamped = 0;
        for (i, vertex) in self.vertices.iter().enumerate() {
            for axis in 0..DIM {
                if vertex.fixed[axis] {
                    continue;
                }
                let c = DIM * i + axis;
                if self.x[c] > self.ub[axis] {
                    self.x[c] = self.ub[axis];
                    self.v[c] = self.v[c].min(0.0);
                    clamped += 1;
                } else if self.x[c] < self.lb[axis] {
                    self.x[c] = self.lb[axis];
                    self.v[c] = self.v[c].max(0.0);
                    clamped += 1;
                }
            }
        }
        clamped
    }

    /// Largest distance any free coordinate lies outside its bounds
    pub fn max_violation(&self) -> f64 {
        let mut violation: f64 = 0.0;
        for c in self.free_coordinates() {
            let axis = c % DIM;
            violation = violation
                .max(self.x[c] - self.ub[axis])
                .max(self.lb[axis] - self.x[c]);
        }
        violation
    }

    /// Norm of the gradient over free coordinates, ignoring components that
    /// push a coordinate sitting on a bound further outward.
    pub fn projected_residual(&self, grad: &DVector<f64>) -> f64 {
        let mut sum = 0.0;
        for c in self.free_coordinates() {
            let axis = c % DIM;
            let g = grad[c];
            let blocked_above = self.x[c] >= self.ub[axis] && g < 0.0;
            let blocked_below = self.x[c] <= self.lb[axis] && g > 0.0;
            if !blocked_above && !blocked_below {
                sum += g * g;
            }
        }
        sum.sqrt()
    }

    /// Per-vertex bound on the energy Hessian, summed over every element the
    /// vertex belongs to. Divided by the vertex mass it bounds ω².
    pub fn stiffness_bounds(&self) -> Vec<f64> {
        let params = &self.params;
        let mut load = vec![0.0; self.vertices.len()];

        for seg in &self.segments {
            let lambda = 2.0 * params.k_global * seg.stiffness_scale / seg.rest_length;
            load[seg.start] += lambda;
            load[seg.end] += lambda;
        }

        for bend in &self.bends {
            let short = |a: usize, b: usize| {
                let current = (point(&self.x, b) - point(&self.x, a)).norm();
                let rest = (point(&self.rest, b) - point(&self.rest, a)).norm();
                current.min(rest).max(EPSILON_LENGTH)
            };
            let l1 = short(bend.a, bend.b);
            let l2 = short(bend.b, bend.c);
            let inv = 1.0 / (l1 * l1) + 1.0 / (l2 * l2);
            let e1 = point(&self.x, bend.b) - point(&self.x, bend.a);
            let e2 = point(&self.x, bend.c) - point(&self.x, bend.b);
            let dtheta = wrap_angle(turning_angle(&e1, &e2) - bend.rest_angle).abs();

            let lambda = 2.0 * params.k_bend / bend.rest_span * (3.0 + 2.0 * dtheta) * inv;
            load[bend.a] += lambda;
            load[bend.b] += lambda;
            load[bend.c] += lambda;
        }

        if let Some(air) = &self.air {
            if params.k_air > 0.0 {
                let delta = (air.area(&self.x) - air.rest_area).abs();
                let lambda = air.stiffness_bound(&self.x, params.k_air)
                    + params.k_air * delta / air.rest_area;
                for i in &air.loop_vertices {
                    load[*i] += lambda;
                }
            }
        }

        load
    }
}
