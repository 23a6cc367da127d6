//! Turns motion commands into motor-level primitive moves.
//!
//! Straight moves are walked in drawing space in steps of the calibrated
//! resolution. At every point of the walk, we compute the cord lengths,
//! round the change in cord length to whole motor steps, and emit that as a
//! [`PrimitiveMove::StepperDelta`]. The rounded length (not the ideal one)
//! becomes the reference for the next point, so rounding errors never
//! accumulate.
//!
//! The planner does not check whether targets are reachable: some geometries
//! have no hard boundary, so range checks are left to whoever drives the
//! planner.

use std::{convert::Infallible, fmt};

use kurbo::Shape as _;
use vplot_geom::{CordLengths, KinematicModel, LenExt as _, Point};
use vplot_protocol::{Angle, MotionCommand, PrimitiveMove};

mod walk;

pub use walk::BresenhamWalk;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlannerConfig {
    /// The speed used until a command sets one.
    pub default_speed: f64,
    /// Servo duty cycle (in percent) that lifts the pen.
    pub pen_up_duty: f64,
    /// Servo duty cycle (in percent) that lowers the pen.
    pub pen_down_duty: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_speed: 10000.0,
            pen_up_duty: 8.7,
            pen_down_duty: 7.5,
        }
    }
}

/// Where the plotter is, as far as the planner knows.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct PlotterState {
    pub current_position: Point,
    /// The cord lengths that the emitted steps add up to. This differs from the
    /// ideal cord lengths at `current_position` by less than half a step.
    pub current_cord_lengths: CordLengths,
    pub pen_down: bool,
    pub speed: f64,
}

impl fmt::Display for PlotterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------------ State ------------")?;
        writeln!(
            f,
            "Current position: ({:.3}, {:.3})",
            self.current_position.x, self.current_position.y
        )?;
        writeln!(
            f,
            "Current lengths:  ({:.3}, {:.3})",
            self.current_cord_lengths.left.get(),
            self.current_cord_lengths.right.get()
        )?;
        writeln!(
            f,
            "Pen:              {}",
            if self.pen_down { "DOWN" } else { "UP" }
        )?;
        writeln!(f, "Current speed:    {}", self.speed)?;
        write!(f, "-------------------------------")
    }
}

pub struct MotionPlanner<M> {
    model: M,
    config: PlannerConfig,
    state: PlotterState,
}

impl<M: KinematicModel> MotionPlanner<M> {
    /// Creates a planner with the pen up, at the origin.
    pub fn new(model: M, config: PlannerConfig) -> Self {
        let current_cord_lengths = model.point_to_cord_lengths(&Point::origin());
        Self {
            model,
            config,
            state: PlotterState {
                current_position: Point::origin(),
                current_cord_lengths,
                pen_down: false,
                speed: config.default_speed,
            },
        }
    }

    pub fn state(&self) -> &PlotterState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Plans a single command, handing each primitive move to `emit` as soon
    /// as it's ready.
    ///
    /// If `emit` fails, planning stops and the error is returned. The planner
    /// state still reflects everything that was emitted up to that point.
    pub fn execute<E>(
        &mut self,
        cmd: &MotionCommand,
        emit: &mut impl FnMut(PrimitiveMove) -> Result<(), E>,
    ) -> Result<(), E> {
        if let Some(speed) = cmd.speed() {
            self.state.speed = speed;
        }

        match cmd {
            MotionCommand::MoveTo { x, y, .. } => {
                let cur = self.state.current_position;
                let target = Point::new(x.unwrap_or(cur.x), y.unwrap_or(cur.y));
                self.walk_to(target, emit)
            }
            MotionCommand::Home => self.walk_to(Point::origin(), emit),
            MotionCommand::MoveArc {
                center,
                radius,
                start_angle,
                end_angle,
                ..
            } => {
                for p in self.flatten_arc(*center, radius.get(), *start_angle, *end_angle) {
                    self.walk_to(p, emit)?;
                }
                Ok(())
            }
            MotionCommand::PenUp => {
                self.state.pen_down = false;
                emit(PrimitiveMove::PenTarget {
                    duty_cycle: self.config.pen_up_duty,
                })
            }
            MotionCommand::PenDown => {
                self.state.pen_down = true;
                emit(PrimitiveMove::PenTarget {
                    duty_cycle: self.config.pen_down_duty,
                })
            }
        }
    }

    /// Plans a single command, collecting all of its primitive moves.
    pub fn plan(&mut self, cmd: &MotionCommand) -> Vec<PrimitiveMove> {
        let mut ret = Vec::new();
        let _ = self.execute(cmd, &mut |m| {
            ret.push(m);
            Ok::<(), Infallible>(())
        });
        ret
    }

    fn walk_to<E>(
        &mut self,
        target: Point,
        emit: &mut impl FnMut(PrimitiveMove) -> Result<(), E>,
    ) -> Result<(), E> {
        let calib = *self.model.calibration();
        let steps_per_mm = calib.steps_per_mm;
        let walk = BresenhamWalk::new(self.state.current_position, target, calib.resolution.get());

        for p in walk {
            let cords = self.model.point_to_cord_lengths(&p);
            let last = self.state.current_cord_lengths;
            let steps = [
                ((cords.left - last.left).get() * steps_per_mm).round() as i32,
                ((cords.right - last.right).get() * steps_per_mm).round() as i32,
            ];

            self.state.current_position = p;
            self.state.current_cord_lengths = CordLengths {
                left: last.left + (steps[0] as f64 / steps_per_mm).mm(),
                right: last.right + (steps[1] as f64 / steps_per_mm).mm(),
            };

            if steps != [0, 0] {
                emit(PrimitiveMove::StepperDelta {
                    steps,
                    speed: self.state.speed,
                })?;
            }
        }
        Ok(())
    }

    // The points along an arc, spaced so that the chords stay close to the
    // arc at our resolution. The first point is the start of the arc.
    fn flatten_arc(&self, center: Point, radius: f64, start: Angle, end: Angle) -> Vec<Point> {
        let arc = kurbo::Arc {
            center: kurbo::Point::new(center.x, center.y),
            radii: kurbo::Vec2::new(radius, radius),
            start_angle: start.radians,
            sweep_angle: end.radians - start.radians,
            x_rotation: 0.0,
        };
        let tolerance = self.model.calibration().resolution.get() / 4.0;

        let mut ret = Vec::new();
        kurbo::flatten(arc.path_elements(tolerance), tolerance, |el| match el {
            kurbo::PathEl::MoveTo(p) | kurbo::PathEl::LineTo(p) => ret.push(Point::new(p.x, p.y)),
            _ => {}
        });
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vplot_geom::{CalibrationBuilder, TriangleModel};

    fn model(separation: f64, left: f64, right: f64, resolution: f64) -> TriangleModel {
        let calib = CalibrationBuilder::default()
            .with_anchor_separation(separation.mm())
            .with_resolution(resolution.mm())
            .build::<TriangleModel>(&CordLengths::from_mm(left, right))
            .unwrap();
        TriangleModel::new(calib)
    }

    fn planner() -> MotionPlanner<TriangleModel> {
        MotionPlanner::new(model(1000.0, 500.0, 700.0, 1.0), PlannerConfig::default())
    }

    fn total_steps(moves: &[PrimitiveMove]) -> [i64; 2] {
        let mut ret = [0i64; 2];
        for m in moves {
            if let PrimitiveMove::StepperDelta { steps, .. } = m {
                ret[0] += steps[0] as i64;
                ret[1] += steps[1] as i64;
            }
        }
        ret
    }

    // Replays the emitted steps, returning the pen position after each move.
    fn replay(planner: &MotionPlanner<TriangleModel>, moves: &[PrimitiveMove]) -> Vec<Point> {
        let m = planner.model();
        let spm = m.calibration().steps_per_mm;
        let mut cords = m.point_to_cord_lengths(&Point::origin());
        let mut ret = vec![Point::origin()];
        for mv in moves {
            if let PrimitiveMove::StepperDelta { steps, .. } = mv {
                cords.left += (steps[0] as f64 / spm).mm();
                cords.right += (steps[1] as f64 / spm).mm();
                ret.push(m.cord_lengths_to_point(&cords));
            }
        }
        ret
    }

    #[test]
    fn move_from_origin() {
        let mut p = planner();
        let cmd = vplot_protocol::decode("G0 X300 Y400").unwrap();
        let moves = p.plan(&cmd);

        let target = Point::new(300.0, 400.0);
        assert!((target - p.state().current_position).length() < 1.0);
        assert!(!moves.is_empty());
        assert!(moves
            .iter()
            .all(|m| matches!(m, PrimitiveMove::StepperDelta { speed, .. } if *speed == 10000.0)));

        // The emitted steps add up to (almost exactly) the change in cord length.
        let spm = p.model().calibration().steps_per_mm;
        let start = p.model().point_to_cord_lengths(&Point::origin());
        let end = p.model().point_to_cord_lengths(&p.state().current_position);
        let [left, right] = total_steps(&moves);
        assert!(((end.left - start.left).get() * spm - left as f64).abs() <= 0.5);
        assert!(((end.right - start.right).get() * spm - right as f64).abs() <= 0.5);

        let trace = replay(&p, &moves);
        assert!((*trace.last().unwrap() - target).length() < 1.1);
    }

    #[test]
    fn reference_tracks_rounded_lengths() {
        let mut p = planner();
        let start = p.state().current_cord_lengths;
        let moves = p.plan(&MotionCommand::move_to(12.3, -45.6));
        let [left, right] = total_steps(&moves);
        let spm = p.model().calibration().steps_per_mm;
        let now = p.state().current_cord_lengths;
        assert!(((now.left - start.left).get() - left as f64 / spm).abs() < 1e-9);
        assert!(((now.right - start.right).get() - right as f64 / spm).abs() < 1e-9);
    }

    #[test]
    fn partial_target_keeps_other_axis() {
        let mut p = planner();
        p.plan(&MotionCommand::move_to(20.0, 30.0));
        let y = p.state().current_position.y;
        p.plan(&vplot_protocol::decode("G0 X-10").unwrap());
        assert!((p.state().current_position.x + 10.0).abs() < 1.0);
        assert_eq!(p.state().current_position.y, y);
    }

    #[test]
    fn pen_moves() {
        let mut p = planner();
        assert_eq!(
            p.plan(&MotionCommand::PenDown),
            vec![PrimitiveMove::PenTarget { duty_cycle: 7.5 }]
        );
        assert!(p.state().pen_down);
        assert_eq!(
            p.plan(&MotionCommand::PenUp),
            vec![PrimitiveMove::PenTarget { duty_cycle: 8.7 }]
        );
        assert!(!p.state().pen_down);
    }

    #[test]
    fn speed_persists() {
        let mut p = planner();
        p.plan(&vplot_protocol::decode("G0 X10 Y0 S500").unwrap());
        assert_eq!(p.state().speed, 500.0);
        let moves = p.plan(&MotionCommand::move_to(20.0, 0.0));
        assert!(moves
            .iter()
            .all(|m| matches!(m, PrimitiveMove::StepperDelta { speed, .. } if *speed == 500.0)));
    }

    #[test]
    fn home() {
        let mut p = planner();
        p.plan(&MotionCommand::move_to(-40.0, 25.0));
        let moves = p.plan(&MotionCommand::Home);
        assert!(!moves.is_empty());
        assert!(p.state().current_position.to_vector().length() < 1.0);
    }

    #[test]
    fn full_circle() {
        let mut p = planner();
        let cmd = vplot_protocol::decode("G2 X0 Y0 R50").unwrap();
        let moves = p.plan(&cmd);
        assert!(!moves.is_empty());

        // A full circle starts and ends at angle zero.
        let end = p.state().current_position;
        assert!((end - Point::new(50.0, 0.0)).length() < 1.0);

        // Every point we pass through is (roughly) on the circle, except for the
        // initial move out to it.
        let trace = replay(&p, &moves);
        let on_circle = trace
            .iter()
            .skip_while(|pt| (pt.to_vector().length() - 50.0).abs() > 1.5)
            .all(|pt| (pt.to_vector().length() - 50.0).abs() < 1.5);
        assert!(on_circle);
    }

    #[test]
    fn quarter_arc() {
        let mut p = planner();
        p.plan(&vplot_protocol::decode("G2 X10 Y10 R20 A0 B90").unwrap());
        let end = p.state().current_position;
        assert!((end - Point::new(10.0, 30.0)).length() < 1.0);
    }

    #[test]
    fn emit_errors_stop_planning() {
        let mut p = planner();
        let mut count = 0;
        let res = p.execute(&MotionCommand::move_to(100.0, 100.0), &mut |_| {
            count += 1;
            if count == 3 {
                Err("driver fault")
            } else {
                Ok(())
            }
        });
        assert_eq!(res, Err("driver fault"));
        assert_eq!(count, 3);
    }

    proptest! {
        #[test]
        fn every_move_ends_near_target(
            targets in prop::collection::vec((-150.0..150.0f64, -150.0..250.0f64), 1..6),
            res in 0.25..3.0f64,
        ) {
            let mut p = MotionPlanner::new(
                model(1000.0, 500.0, 700.0, res),
                PlannerConfig::default(),
            );
            for (x, y) in targets {
                let target = Point::new(x, y);
                let moves = p.plan(&MotionCommand::move_to(x, y));
                prop_assert!((target - p.state().current_position).length() < res);

                // A resolution step changes each cord by at most sqrt(2) * res,
                // plus a step or so of rounding.
                let spm = p.model().calibration().steps_per_mm;
                let max = (2.0f64.sqrt() * res * spm).ceil() as i32 + 2;
                for m in &moves {
                    if let PrimitiveMove::StepperDelta { steps, .. } = m {
                        prop_assert!(steps[0].abs() <= max);
                        prop_assert!(steps[1].abs() <= max);
                    }
                }
            }
        }
    }
}
