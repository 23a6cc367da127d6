use serde::{Deserialize, Serialize};
use vplot_geom::{BoundingBox, Point, Vector};
use vplot_protocol::MotionCommand;

/// What to do with a move whose target is outside the drawing area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePolicy {
    #[default]
    Ignore,
    Reject,
    Clamp,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeCheck {
    pub area: BoundingBox,
    pub policy: RangePolicy,
}

fn inside(area: &BoundingBox, p: Point) -> bool {
    area.min.x <= p.x && p.x <= area.max.x && area.min.y <= p.y && p.y <= area.max.y
}

impl RangeCheck {
    /// Checks a command against the drawing area, given the current position.
    ///
    /// Returns the command to run, or `None` if it should be dropped. Arcs
    /// can't be clamped sensibly, so an arc that leaves the area is dropped
    /// under both `Reject` and `Clamp`.
    pub fn apply(&self, cmd: MotionCommand, current: Point) -> Option<MotionCommand> {
        if self.policy == RangePolicy::Ignore {
            return Some(cmd);
        }

        match cmd {
            MotionCommand::MoveTo { x, y, speed } => {
                let target = Point::new(x.unwrap_or(current.x), y.unwrap_or(current.y));
                if inside(&self.area, target) {
                    return Some(cmd);
                }
                if self.policy == RangePolicy::Clamp {
                    let p = target.clamp(self.area.min, self.area.max);
                    log::warn!(
                        "clamping target ({}, {}) to ({}, {})",
                        target.x,
                        target.y,
                        p.x,
                        p.y
                    );
                    Some(MotionCommand::MoveTo {
                        x: Some(p.x),
                        y: Some(p.y),
                        speed,
                    })
                } else {
                    log::warn!("rejecting out-of-range target ({}, {})", target.x, target.y);
                    None
                }
            }
            MotionCommand::MoveArc {
                center, radius, ..
            } => {
                let r = Vector::new(radius.get(), radius.get());
                if inside(&self.area, center - r) && inside(&self.area, center + r) {
                    Some(cmd)
                } else {
                    log::warn!(
                        "rejecting arc around ({}, {}) that leaves the drawing area",
                        center.x,
                        center.y
                    );
                    None
                }
            }
            MotionCommand::Home | MotionCommand::PenUp | MotionCommand::PenDown => Some(cmd),
        }
    }
}
