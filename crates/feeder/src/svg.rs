use std::path::Path;

use svg::{
    node::element::{path::Data, Circle, Path as SvgPath},
    Document,
};
use vplot_geom::{Calibration, Point};
use vplot_pipeline::TracePoint;

// Multiply all dimensions by 10 because firefox doesn't like to see small svgs.
const SCALE: f64 = 10.0;

fn stroke(points: &[Point], pen_down: bool) -> SvgPath {
    let mut data = Data::new().move_to((points[0].x * SCALE, points[0].y * SCALE));
    for p in &points[1..] {
        data = data.line_to((p.x * SCALE, p.y * SCALE));
    }
    let path = SvgPath::new().set("fill", "none").set("d", data);
    if pen_down {
        path.set("stroke", "black").set("stroke-width", 2)
    } else {
        path.set("stroke", "red")
            .set("stroke-width", 1)
            .set("stroke-dasharray", "4 4")
    }
}

fn marker(p: Point, color: &str) -> Circle {
    Circle::new()
        .set("cx", p.x * SCALE)
        .set("cy", p.y * SCALE)
        .set("r", 4.0)
        .set("fill", color)
}

/// Draws a simulated trace, in the coordinates of the anchors: the left anchor
/// is at the top left corner and the right one at the top right. Drawn strokes
/// are black, travel moves are dashed red.
pub fn to_document(trace: &[TracePoint], calib: &Calibration) -> Document {
    let offset = calib.origin.to_vector();
    let width = calib.anchor_separation.get();

    let mut document = Document::new();
    let mut height = calib.origin.y;

    // Each run of points with the same pen state becomes one path. Consecutive
    // runs share their boundary point so that there are no gaps.
    let mut run: Vec<Point> = Vec::new();
    let mut run_pen = None;
    for tp in trace {
        let p = tp.position + offset;
        height = height.max(p.y);
        if run_pen != Some(tp.pen_down) {
            if run.len() > 1 {
                document = document.add(stroke(&run, run_pen == Some(true)));
            }
            run = run.last().copied().into_iter().collect();
            run_pen = Some(tp.pen_down);
        }
        run.push(p);
    }
    if run.len() > 1 {
        document = document.add(stroke(&run, run_pen == Some(true)));
    }

    document = document
        .add(marker(Point::new(0.0, 0.0), "green"))
        .add(marker(Point::new(width, 0.0), "green"))
        .add(marker(calib.origin, "blue"));

    let margin = 20.0;
    document.set(
        "viewBox",
        (
            -margin * SCALE,
            -margin * SCALE,
            (width + 2.0 * margin) * SCALE,
            (height + 2.0 * margin) * SCALE,
        ),
    )
}

pub fn write_trace(path: &Path, trace: &[TracePoint], calib: &Calibration) -> anyhow::Result<()> {
    svg::save(path, &to_document(trace, calib))?;
    log::info!("wrote {} trace points to {}", trace.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vplot_geom::{CalibrationBuilder, CordLengths, LenExt as _, TriangleModel};

    fn tp(x: f64, y: f64, pen_down: bool) -> TracePoint {
        TracePoint {
            position: Point::new(x, y),
            pen_down,
        }
    }

    #[test]
    fn strokes_and_travel() {
        let calib = CalibrationBuilder::default()
            .with_anchor_separation(1000.0.mm())
            .build::<TriangleModel>(&CordLengths::from_mm(500.0, 700.0))
            .unwrap();
        let trace = [
            tp(0.0, 0.0, false),
            tp(5.0, 0.0, false),
            tp(5.0, 0.0, true),
            tp(5.0, 5.0, true),
            tp(0.0, 5.0, true),
            tp(0.0, 5.0, false),
        ];
        let out = to_document(&trace, &calib).to_string();
        assert_eq!(out.matches("<path").count(), 3);
        assert_eq!(out.matches("stroke=\"black\"").count(), 1);
        assert_eq!(out.matches("<circle").count(), 3);
    }
}
