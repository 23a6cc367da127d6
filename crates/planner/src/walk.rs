use vplot_geom::Point;

/// Walks a straight line in drawing space with Bresenham's algorithm, in
/// steps of `resolution` along one or both axes.
///
/// The first item is the starting point. The walk stops at the first point
/// that is closer than `resolution` to the target, which is the last item.
#[derive(Debug)]
pub struct BresenhamWalk {
    pos: Point,
    target: Point,
    resolution: f64,

    // Distance to travel along each axis, in units of the resolution. The y
    // component is negated, as in the usual integer formulation.
    dx: f64,
    dy: f64,
    // Direction of travel along each axis.
    sx: f64,
    sy: f64,
    err: f64,

    // An upper bound on the number of decisions, in case floating point
    // rounding conspires against us.
    steps_left: usize,
    finished: bool,
}

impl BresenhamWalk {
    pub fn new(start: Point, target: Point, resolution: f64) -> Self {
        let dx = (target.x - start.x).abs() / resolution;
        let dy = -(target.y - start.y).abs() / resolution;
        let sx = if start.x >= target.x { -1.0 } else { 1.0 };
        let sy = if start.y >= target.y { -1.0 } else { 1.0 };
        // The cast saturates for huge moves, so the arithmetic has to as well.
        let steps_left = ((dx - dy).ceil() as usize).saturating_mul(2).saturating_add(8);

        BresenhamWalk {
            pos: start,
            target,
            resolution,
            dx,
            dy,
            sx,
            sy,
            err: dx + dy,
            steps_left,
            finished: false,
        }
    }

    // One Bresenham decision. A step never goes past the target on its axis,
    // which is what guarantees that the walk ends. Returns whether we moved.
    fn step(&mut self) -> bool {
        let before = self.pos;
        let e2 = 2.0 * self.err;
        if e2 > self.dy {
            self.err += self.dy;
            let remaining = (self.target.x - self.pos.x).abs();
            self.pos.x += self.sx * self.resolution.min(remaining);
        }
        if e2 < self.dx {
            self.err += self.dx;
            let remaining = (self.target.y - self.pos.y).abs();
            self.pos.y += self.sy * self.resolution.min(remaining);
        }
        self.pos != before
    }
}

impl Iterator for BresenhamWalk {
    type Item = Point;

    fn next(&mut self) -> Option<Point> {
        if self.finished {
            return None;
        }

        let ret = self.pos;
        if (self.target - self.pos).length() < self.resolution {
            self.finished = true;
            return Some(ret);
        }

        loop {
            if self.steps_left == 0 {
                log::warn!(
                    "line walk towards ({}, {}) did not converge, stopping at ({}, {})",
                    self.target.x,
                    self.target.y,
                    ret.x,
                    ret.y
                );
                self.finished = true;
                break;
            }
            self.steps_left -= 1;
            if self.step() {
                break;
            }
        }
        Some(ret)
    }
}
