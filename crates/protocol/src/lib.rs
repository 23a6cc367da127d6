use serde::{Deserialize, Serialize};
use vplot_geom::{Len, Point};

mod gcode;
pub mod postprocess;

pub use gcode::{decode, encode, DecodeError};
pub use postprocess::{post_process, post_process_lines, PostProcessed};

pub type Angle = euclid::Angle<f64>;

/// One line of the textual motion protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MotionCommand {
    /// `G0`. An axis that isn't given stays where it is.
    MoveTo {
        x: Option<f64>,
        y: Option<f64>,
        speed: Option<f64>,
    },
    /// `G2`. Sweeps from `start_angle` to `end_angle` around `center`.
    MoveArc {
        center: Point,
        radius: Len,
        start_angle: Angle,
        end_angle: Angle,
        speed: Option<f64>,
    },
    /// `G28`, which moves back to the origin.
    Home,
    /// `M4`
    PenUp,
    /// `M3`
    PenDown,
}

impl MotionCommand {
    pub fn move_to(x: f64, y: f64) -> Self {
        MotionCommand::MoveTo {
            x: Some(x),
            y: Some(y),
            speed: None,
        }
    }

    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            MotionCommand::MoveTo { .. } | MotionCommand::MoveArc { .. } | MotionCommand::Home
        )
    }

    pub fn speed(&self) -> Option<f64> {
        match self {
            MotionCommand::MoveTo { speed, .. } | MotionCommand::MoveArc { speed, .. } => *speed,
            _ => None,
        }
    }
}

/// The end point of an arc with the given parameters.
pub fn arc_end(center: Point, radius: Len, end_angle: Angle) -> Point {
    let (sin, cos) = end_angle.radians.sin_cos();
    Point::new(
        center.x + radius.get() * cos,
        center.y + radius.get() * sin,
    )
}

/// A single motor-level instruction, produced by the planner and consumed by
/// the motor stage.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveMove {
    /// Lengthen (positive) or shorten (negative) each cord by a number of
    /// steps. `speed` is the commanded speed that was active when the move
    /// was planned.
    StepperDelta { steps: [i32; 2], speed: f64 },
    /// Move the pen servo to the given PWM duty cycle, in percent.
    PenTarget { duty_cycle: f64 },
}

impl PrimitiveMove {
    pub fn is_noop(&self) -> bool {
        matches!(self, PrimitiveMove::StepperDelta { steps: [0, 0], .. })
    }
}
