use nalgebra::Vector2;

use crate::{
    datatypes::{MaterialParams, Segment, DIM, Y_AXIS},
    error::RuffleError,
    mesh::{point, ElasticMesh},
};

pub const DEFAULT_SEGMENTS_PER_FOLD: usize = 4;

fn validate_shape(
    fold_count: usize,
    fold_width: f64,
    thickness: f64,
    segments_per_fold: usize,
) -> Result<(), RuffleError> {
    if fold_count == 0 {
        return Err(RuffleError::Config(
            "Ruffle needs at least one fold".to_owned(),
        ));
    }
    if segments_per_fold == 0 {
        return Err(RuffleError::Config(
            "Each fold needs at least one segment".to_owned(),
        ));
    }
    if !(fold_width > 0.0) || !fold_width.is_finite() {
        return Err(RuffleError::Config(format!(
            "Fold width must be positive, got {fold_width}"
        )));
    }
    if !(thickness > 0.0) || !thickness.is_finite() {
        return Err(RuffleError::Config(format!(
            "Thickness must be positive, got {thickness}"
        )));
    }
    Ok(())
}

/// Lays out the zig-zag through `corners`, one section per fold, with
/// `segments_per_fold` evenly spaced segments in each.
///
/// # Arguments
/// * `corners` - Fold corners in chain order
/// * `fixed` - Fixed axes of the vertex at each corner
/// * `segments_per_fold` - Resolution of each fold
/// * `params` - Material of the strip
fn build_zigzag(
    corners: &[Vector2<f64>],
    fixed: &[[bool; DIM]],
    segments_per_fold: usize,
    params: MaterialParams,
) -> Result<ElasticMesh, RuffleError> {
    let mut mesh = ElasticMesh::new(params)?;

    let mut corner_vertex = mesh.add_vertex(corners[0], fixed[0]);
    for k in 1..corners.len() {
        let start = corners[k - 1];
        let end = corners[k];
        let mut chain = vec![corner_vertex];

        for j in 1..segments_per_fold {
            let t = j as f64 / segments_per_fold as f64;
            chain.push(mesh.add_vertex(start + (end - start) * t, [false; DIM]));
        }
        corner_vertex = mesh.add_vertex(end, fixed[k]);
        chain.push(corner_vertex);

        mesh.add_section(&chain)?;
    }

    *mesh.lb_mut(Y_AXIS) = 0.0;
    mesh.update_vertex_mass()?;

    Ok(mesh)
}

/// Creates a vertical accordion with default material and resolution
pub fn create_ruffle_stack(
    fold_count: usize,
    fold_width: f64,
    fold_length: f64,
    thickness: f64,
) -> Result<ElasticMesh, RuffleError> {
    build_ruffle_stack(
        fold_count,
        fold_width,
        fold_length,
        thickness,
        DEFAULT_SEGMENTS_PER_FOLD,
        MaterialParams::default(),
    )
}

/// Builds a vertical accordion standing on the floor.
///
/// Fold corners alternate between `x = 0` and `x = fold_width` while rising,
/// so each fold is a straight run of length `fold_length`. The bottom vertex
/// is anchored; the top vertex may only move vertically, guided by the plate.
///
/// # Arguments
/// * `fold_count` - Number of folds (sections)
/// * `fold_width` - Horizontal extent of a fold
/// * `fold_length` - Length of the strip in one fold
/// * `thickness` - Sheet thickness
/// * `segments_per_fold` - Segments each fold is split into
/// * `params` - Material of the strip; `thickness` overrides its thickness
///
/// # Returns
/// A mesh with masses computed, in its rest configuration
pub fn build_ruffle_stack(
    fold_count: usize,
    fold_width: f64,
    fold_length: f64,
    thickness: f64,
    segments_per_fold: usize,
    params: MaterialParams,
) -> Result<ElasticMesh, RuffleError> {
    validate_shape(fold_count, fold_width, thickness, segments_per_fold)?;
    if !(fold_length > fold_width) || !fold_length.is_finite() {
        return Err(RuffleError::Config(format!(
            "Fold length {fold_length} must exceed fold width {fold_width}"
        )));
    }

    let rise = (fold_length * fold_length - fold_width * fold_width).sqrt();
    let corners: Vec<Vector2<f64>> = (0..=fold_count)
        .map(|k| {
            let x = if k % 2 == 0 { 0.0 } else { fold_width };
            Vector2::new(x, k as f64 * rise)
        })
        .collect();

    let mut fixed = vec![[false; DIM]; corners.len()];
    fixed[0] = [true, true];
    fixed[fold_count][0] = true;

    let params = MaterialParams { thickness, ..params };
    build_zigzag(&corners, &fixed, segments_per_fold, params)
}

/// Creates a horizontal accordion with default material and resolution
pub fn create_horizontal_stack(
    fold_count: usize,
    fold_width: f64,
    fold_height: f64,
    thickness: f64,
) -> Result<ElasticMesh, RuffleError> {
    build_horizontal_stack(
        fold_count,
        fold_width,
        fold_height,
        thickness,
        DEFAULT_SEGMENTS_PER_FOLD,
        MaterialParams::default(),
    )
}

/// Builds an accordion lying along the x axis.
///
/// Lower corners rest on the floor and cannot move vertically; the first one
/// is anchored. Upper corners sit at `fold_height` and meet the plate.
pub fn build_horizontal_stack(
    fold_count: usize,
    fold_width: f64,
    fold_height: f64,
    thickness: f64,
    segments_per_fold: usize,
    params: MaterialParams,
) -> Result<ElasticMesh, RuffleError> {
    validate_shape(fold_count, fold_width, thickness, segments_per_fold)?;
    if !(fold_height > 0.0) || !fold_height.is_finite() {
        return Err(RuffleError::Config(format!(
            "Fold height must be positive, got {fold_height}"
        )));
    }

    let corners: Vec<Vector2<f64>> = (0..=fold_count)
        .map(|k| {
            let y = if k % 2 == 0 { 0.0 } else { fold_height };
            Vector2::new(k as f64 * fold_width, y)
        })
        .collect();

    let fixed: Vec<[bool; DIM]> = (0..=fold_count)
        .map(|k| match k {
            0 => [true, true],
            k if k % 2 == 0 => [false, true],
            _ => [false, false],
        })
        .collect();

    let params = MaterialParams { thickness, ..params };
    build_zigzag(&corners, &fixed, segments_per_fold, params)
}

/// Halves every segment of `section`
pub fn densify(mesh: &mut ElasticMesh, section: usize) -> Result<usize, RuffleError> {
    densify_by(mesh, section, 2)
}

/// Splits every segment of `section` into `pieces` shorter segments.
///
/// New vertices are interpolated along the current geometry for their
/// position and velocity, and along the rest geometry for their rest
/// position, so the rest length of the section is unchanged and no other
/// vertex moves. Bends, masses and the air loop are regenerated.
///
/// # Returns
/// The number of vertices added
pub fn densify_by(
    mesh: &mut ElasticMesh,
    section: usize,
    pieces: usize,
) -> Result<usize, RuffleError> {
    if section >= mesh.sections().len() {
        return Err(RuffleError::Topology(format!(
            "Section {section} does not exist; mesh has {}",
            mesh.sections().len()
        )));
    }
    if pieces < 2 {
        return Err(RuffleError::Config(format!(
            "Densify needs at least two pieces per segment, got {pieces}"
        )));
    }

    let old_segments = mesh.sections()[section].segments.clone();
    let mut new_segments: Vec<usize> = Vec::with_capacity(old_segments.len() * pieces);
    let mut added = 0;

    for s in old_segments {
        let seg = mesh.segments()[s].clone();
        let (pa, pb) = (point(&mesh.x, seg.start), point(&mesh.x, seg.end));
        let (va, vb) = (point(&mesh.v, seg.start), point(&mesh.v, seg.end));
        let (ra, rb) = (mesh.rest_position(seg.start), mesh.rest_position(seg.end));
        let piece_length = seg.rest_length / pieces as f64;

        // the split segment keeps its index and becomes the first piece
        new_segments.push(s);
        let mut previous = seg.start;
        for k in 1..pieces {
            let t = k as f64 / pieces as f64;
            let vertex = mesh.insert_vertex(
                pa + (pb - pa) * t,
                ra + (rb - ra) * t,
                va + (vb - va) * t,
                [false; DIM],
            );
            added += 1;

            if k == 1 {
                let first = &mut mesh.segments_mut()[s];
                first.end = vertex;
                first.rest_length = piece_length;
            } else {
                new_segments.push(mesh.segments().len());
                mesh.segments_mut().push(Segment {
                    start: previous,
                    end: vertex,
                    rest_length: piece_length,
                    stiffness_scale: seg.stiffness_scale,
                });
            }
            previous = vertex;
        }

        new_segments.push(mesh.segments().len());
        mesh.segments_mut().push(Segment {
            start: previous,
            end: seg.end,
            rest_length: piece_length,
            stiffness_scale: seg.stiffness_scale,
        });
    }

    mesh.sections_mut()[section].segments = new_segments;
    mesh.commit_topology()?;

    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn section_rest_length(mesh: &ElasticMesh, section: usize) -> f64 {
        mesh.sections()[section]
            .segments
            .iter()
            .map(|s| mesh.segments()[*s].rest_length)
            .sum()
    }

    #[test]
    fn stack_layout() {
        let mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        let rise = (5.28_f64 * 5.28 - 9.0).sqrt();

        assert_eq!(mesh.vertex_count(), 9);
        assert_eq!(mesh.dof(), 18);
        assert_eq!(mesh.segments().len(), 8);
        assert_eq!(mesh.sections().len(), 2);
        assert_eq!(mesh.bends().len(), 7);

        assert_eq!(mesh.get_vertex_position(0), Vector2::new(0.0, 0.0));
        assert_relative_eq!(mesh.get_vertex_position(4), Vector2::new(3.0, rise));
        assert_relative_eq!(mesh.get_vertex_position(8), Vector2::new(0.0, 2.0 * rise));

        assert_eq!(mesh.vertices()[0].fixed, [true, true]);
        assert_eq!(mesh.vertices()[8].fixed, [true, false]);
        assert_eq!(mesh.vertices()[4].fixed, [false, false]);
        assert_eq!(mesh.lb(Y_AXIS), 0.0);
        assert_eq!(mesh.ub(Y_AXIS), f64::INFINITY);
        assert_eq!(mesh.params().thickness, 0.5);

        for section in 0..2 {
            assert_relative_eq!(section_rest_length(&mesh, section), 5.28, epsilon = 1e-12);
        }
        assert!(!mesh.masses_stale());
    }

    #[test]
    fn stack_rejects_bad_shapes() {
        assert!(matches!(
            create_ruffle_stack(0, 3.0, 5.28, 0.5),
            Err(RuffleError::Config(_))
        ));
        assert!(create_ruffle_stack(2, 6.0, 5.28, 0.5).is_err());
        assert!(create_ruffle_stack(2, 0.0, 5.28, 0.5).is_err());
        assert!(create_ruffle_stack(2, 3.0, 5.28, 0.0).is_err());
        assert!(build_ruffle_stack(2, 3.0, 5.28, 0.5, 0, MaterialParams::default()).is_err());

        let params = MaterialParams {
            k_global: 0.0,
            ..Default::default()
        };
        assert!(build_ruffle_stack(2, 3.0, 5.28, 0.5, 4, params).is_err());
    }

    #[test]
    fn horizontal_layout() {
        let mesh = create_horizontal_stack(3, 2.0, 1.5, 0.2).unwrap();

        assert_eq!(mesh.vertex_count(), 13);
        assert_eq!(mesh.sections().len(), 3);
        assert_eq!(mesh.get_vertex_position(4), Vector2::new(2.0, 1.5));
        assert_eq!(mesh.get_vertex_position(8), Vector2::new(4.0, 0.0));
        assert_eq!(mesh.vertices()[0].fixed, [true, true]);
        assert_eq!(mesh.vertices()[8].fixed, [false, true]);
        assert_eq!(mesh.vertices()[12].fixed, [false, false]);
        assert!(create_horizontal_stack(3, 2.0, 0.0, 0.2).is_err());
    }

    #[test]
    fn as_built_stack_is_at_rest_without_gravity() {
        let params = MaterialParams {
            gravity: 0.0,
            ..Default::default()
        };
        let mesh = build_ruffle_stack(2, 3.0, 5.28, 0.5, 4, params).unwrap();
        let grad = mesh.gradient();
        assert!(grad.norm() < 1e-9, "gradient norm {}", grad.norm());
    }

    #[test]
    fn densify_keeps_rest_length_and_neighbours() {
        let mut mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        let untouched: Vec<Vector2<f64>> =
            (4..9).map(|i| mesh.get_vertex_position(i)).collect();
        let dof_before = mesh.dof();
        let revision = mesh.revision();

        let added = densify(&mut mesh, 0).unwrap();

        assert_eq!(added, 4);
        assert_eq!(mesh.vertex_count(), 13);
        assert_eq!(mesh.dof(), dof_before + 2 * added);
        assert_eq!(mesh.sections()[0].segments.len(), 8);
        assert_eq!(mesh.segments().len(), 12);
        assert_eq!(mesh.bends().len(), 11);
        assert!(mesh.revision() > revision);
        assert_relative_eq!(section_rest_length(&mesh, 0), 5.28, epsilon = 1e-12);
        assert_relative_eq!(section_rest_length(&mesh, 1), 5.28, epsilon = 1e-12);

        for (k, i) in (4..9).enumerate() {
            assert_eq!(mesh.get_vertex_position(i), untouched[k]);
        }

        // the first new vertex halves the first segment
        let midpoint = (mesh.get_vertex_position(0) + mesh.get_vertex_position(1)) * 0.5;
        assert_relative_eq!(mesh.get_vertex_position(9), midpoint, epsilon = 1e-12);
        assert_eq!(mesh.chain_order().len(), 13);
        assert_eq!(mesh.chain_order()[1], 9);

        let total: f64 = mesh.vertices().iter().map(|v| v.mass).sum();
        assert_relative_eq!(total, 0.160 * 0.5 * 2.0 * 5.28, epsilon = 1e-12);
    }

    #[test]
    fn densify_keeps_rest_state_stationary() {
        let params = MaterialParams {
            gravity: 0.0,
            ..Default::default()
        };
        let mut mesh = build_ruffle_stack(2, 3.0, 5.28, 0.5, 2, params).unwrap();
        densify_by(&mut mesh, 1, 3).unwrap();

        assert_eq!(mesh.sections()[1].segments.len(), 6);
        let grad = mesh.gradient();
        assert!(grad.norm() < 1e-9, "gradient norm {}", grad.norm());
    }

    #[test]
    fn densify_relinks_air_mesh() {
        let params = MaterialParams {
            k_air: 20.0,
            ..Default::default()
        };
        let mut mesh = build_ruffle_stack(2, 3.0, 5.28, 0.5, 4, params).unwrap();
        mesh.generate_air_mesh().unwrap();
        let area = mesh.air_mesh().unwrap().area(&mesh.x);

        densify(&mut mesh, 1).unwrap();

        let air = mesh.air_mesh().unwrap();
        assert_eq!(air.revision, mesh.revision());
        assert_eq!(air.loop_vertices.len(), mesh.vertex_count());
        assert_relative_eq!(air.area(&mesh.x), area, epsilon = 1e-9);

        let mut grad = DVector::zeros(mesh.dof());
        let energy = mesh.energy(&mesh.x, Some(&mut grad));
        assert!(energy.is_finite());
    }

    #[test]
    fn densify_rejects_bad_requests() {
        let mut mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        assert!(matches!(densify(&mut mesh, 2), Err(RuffleError::Topology(_))));
        assert!(matches!(densify_by(&mut mesh, 0, 1), Err(RuffleError::Config(_))));
        assert_eq!(mesh.vertex_count(), 9);
    }

    #[test]
    fn stack_gradient_matches_finite_differences() {
        let mut mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        mesh.params_mut().k_air = 15.0;
        mesh.update_vertex_mass().unwrap();
        mesh.generate_air_mesh().unwrap();
        densify(&mut mesh, 0).unwrap();

        let mut x = mesh.x.clone();
        for (c, value) in x.iter_mut().enumerate() {
            *value += 0.04 * ((c * 5 + 1) as f64).cos();
        }

        let mut grad = DVector::zeros(mesh.dof());
        mesh.energy(&x, Some(&mut grad));
        let h = 1e-6;
        for c in 0..mesh.dof() {
            let mut forward = x.clone();
            let mut backward = x.clone();
            forward[c] += h;
            backward[c] -= h;
            let fd = (mesh.energy(&forward, None) - mesh.energy(&backward, None)) / (2.0 * h);
            assert!(
                (fd - grad[c]).abs() <= 1e-4 * grad[c].abs().max(1.0),
                "coordinate {c}: finite difference {fd}, analytic {}",
                grad[c]
            );
        }
    }
}
