use std::{fs::File, io::Write};

use crate::{controller::LoadingController, datatypes::CurvePoint, error::RuffleError};

/// Length scale of the force arrows written next to each vertex
pub const ARROW_SCALE: f64 = 1.0;

fn create(path: &str) -> Result<File, RuffleError> {
    File::create(path)
        .map_err(|err| RuffleError::PostProcessor(format!("Failed to create {path}: {err}")))
}

fn write_line(file: &mut File, path: &str, line: String) -> Result<(), RuffleError> {
    writeln!(file, "{line}")
        .map_err(|err| RuffleError::PostProcessor(format!("Failed to write {path}: {err}")))
}

/// Writes the force-displacement curve, one settled increment per row
///
/// # Arguments
/// * `curve` - Recorded curve points in loading order
/// * `curve_output` - The filename of the output curve csv
pub fn curve_csv(curve: &[CurvePoint], curve_output: &str) -> Result<(), RuffleError> {
    let mut file = create(curve_output)?;

    write_line(&mut file, curve_output, "step,plate,displacement,force".to_owned())?;
    for (step, point) in curve.iter().enumerate() {
        write_line(
            &mut file,
            curve_output,
            format!(
                "{step},{plate},{displacement},{force}",
                plate = point.plate,
                displacement = point.displacement,
                force = point.force
            ),
        )?;
    }

    Ok(())
}

/// Writes the final geometry to two CSV files
///
/// # Arguments
/// * `controller` - Controller holding the loaded mesh
/// * `nodes_output` - The filename of the output nodes csv
/// * `segments_output` - The filename of the output segments csv
pub fn geometry_csv(
    controller: &LoadingController,
    nodes_output: &str,
    segments_output: &str,
) -> Result<(), RuffleError> {
    let mesh = &controller.mesh;
    let mut nodes_file = create(nodes_output)?;
    let mut segments_file = create(segments_output)?;

    write_line(
        &mut nodes_file,
        nodes_output,
        "x,y,fixed_x,fixed_y,mass,arrow_x,arrow_y".to_owned(),
    )?;
    let arrows = controller.force_arrows(ARROW_SCALE);
    for (vertex, (position, arrow)) in mesh.vertices().iter().zip(arrows) {
        write_line(
            &mut nodes_file,
            nodes_output,
            format!(
                "{x},{y},{fx},{fy},{mass},{ax},{ay}",
                x = position.x,
                y = position.y,
                fx = vertex.fixed[0] as u8,
                fy = vertex.fixed[1] as u8,
                mass = vertex.mass,
                ax = arrow.x,
                ay = arrow.y
            ),
        )?;
    }

    write_line(
        &mut segments_file,
        segments_output,
        "section,start,end,rest_length,length".to_owned(),
    )?;
    for (s, section) in mesh.sections().iter().enumerate() {
        for index in &section.segments {
            let segment = &mesh.segments()[*index];
            let length = (mesh.get_vertex_position(segment.end)
                - mesh.get_vertex_position(segment.start))
            .norm();
            write_line(
                &mut segments_file,
                segments_output,
                format!(
                    "{s},{start},{end},{rest},{length}",
                    start = segment.start,
                    end = segment.end,
                    rest = segment.rest_length
                ),
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::create_ruffle_stack, config::LoadingConfig, logging, solver::verlet::Verlet,
    };

    fn scratch(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("ruffle-{}-{name}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn curve_rows_follow_points() {
        let path = scratch("curve.csv");
        let curve = vec![
            CurvePoint {
                plate: 8.0,
                displacement: 8.0,
                force: 1.5,
            },
            CurvePoint {
                plate: 7.75,
                displacement: 7.75,
                force: 3.0,
            },
        ];
        curve_csv(&curve, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "step,plate,displacement,force");
        assert_eq!(lines[1], "0,8,8,1.5");
        assert_eq!(lines[2], "1,7.75,7.75,3");
    }

    #[test]
    fn geometry_lists_every_vertex_and_segment() {
        let logger = logging::discard();
        let mesh = create_ruffle_stack(2, 3.0, 5.28, 0.5).unwrap();
        let solver = Box::new(Verlet::new(Default::default(), logger.clone()));
        let controller = LoadingController::new(mesh, solver, LoadingConfig::default(), logger);

        let nodes = scratch("nodes.csv");
        let segments = scratch("segments.csv");
        geometry_csv(&controller, &nodes, &segments).unwrap();

        let node_text = std::fs::read_to_string(&nodes).unwrap();
        let segment_text = std::fs::read_to_string(&segments).unwrap();
        std::fs::remove_file(&nodes).unwrap();
        std::fs::remove_file(&segments).unwrap();

        assert_eq!(node_text.lines().count(), 1 + 9);
        assert!(node_text.lines().nth(1).unwrap().starts_with("0,0,1,1,"));
        assert_eq!(segment_text.lines().count(), 1 + 8);
        assert!(segment_text.lines().nth(5).unwrap().starts_with("1,4,5,"));
    }

    #[test]
    fn unwritable_path_is_reported() {
        let err = curve_csv(&[], "/nonexistent/dir/curve.csv").unwrap_err();
        assert!(matches!(err, RuffleError::PostProcessor(_)));
    }
}
