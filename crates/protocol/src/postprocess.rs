//! Clean-up for a complete command sequence, before it's handed to the plotter.
//!
//! Generators tend to emit lots of tiny segments and redundant pen toggles.
//! Post-processing drops the segments that are too short to matter and
//! only toggles the pen when its state actually needs to change.

use vplot_geom::{BoundingBox, Point};

use crate::{arc_end, decode, DecodeError, MotionCommand};

#[derive(Clone, Debug, PartialEq)]
pub struct PostProcessed {
    pub commands: Vec<MotionCommand>,
    /// The extent of all the retained `G0` targets, if there were any.
    pub bounding_box: Option<BoundingBox>,
    pub original_len: usize,
}

impl PostProcessed {
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.commands.iter().map(|c| c.to_string())
    }
}

fn resolve_target(x: Option<f64>, y: Option<f64>, pos: Option<Point>) -> Point {
    let base = pos.unwrap_or_else(Point::origin);
    Point::new(x.unwrap_or(base.x), y.unwrap_or(base.y))
}

// Drops every move that ends closer than `min_segment_len` to the last
// retained position.
fn coalesce_segments(commands: &[MotionCommand], min_segment_len: f64) -> Vec<MotionCommand> {
    let mut ret = Vec::with_capacity(commands.len());
    let mut pos: Option<Point> = None;

    for cmd in commands {
        match cmd {
            MotionCommand::MoveTo { x, y, .. } => {
                let target = resolve_target(*x, *y, pos);
                if let Some(p) = pos {
                    if (target - p).length() < min_segment_len {
                        log::trace!("skipping segment of length {}", (target - p).length());
                        continue;
                    }
                }
                pos = Some(target);
            }
            MotionCommand::MoveArc {
                center,
                radius,
                end_angle,
                ..
            } => {
                pos = Some(arc_end(*center, *radius, *end_angle));
            }
            MotionCommand::Home => {
                pos = Some(Point::origin());
            }
            MotionCommand::PenUp | MotionCommand::PenDown => {}
        }
        ret.push(cmd.clone());
    }
    ret
}

fn toggle(pen_down: bool) -> MotionCommand {
    if pen_down {
        MotionCommand::PenDown
    } else {
        MotionCommand::PenUp
    }
}

struct PenTracker {
    // What the emitted stream has the pen doing.
    current: Option<bool>,
    // What the input stream wants the pen to be doing.
    intent: Option<bool>,
}

impl PenTracker {
    fn flush(&mut self, out: &mut Vec<MotionCommand>) {
        match (self.current, self.intent) {
            (None, None) => {
                log::warn!("initial pen position unknown, assuming the pen is up");
                self.current = Some(false);
                self.intent = Some(false);
            }
            (current, Some(intent)) if current != Some(intent) => {
                out.push(toggle(intent));
                self.current = Some(intent);
            }
            _ => {}
        }
    }
}

/// Runs the full post-processing pass over a complete command sequence.
pub fn post_process(commands: &[MotionCommand], min_segment_len: f64) -> PostProcessed {
    let coalesced = coalesce_segments(commands, min_segment_len);

    let mut out = Vec::with_capacity(coalesced.len());
    let mut pen = PenTracker {
        current: None,
        intent: None,
    };
    let mut bbox: Option<BoundingBox> = None;
    let mut pos: Option<Point> = None;

    for cmd in coalesced {
        match &cmd {
            MotionCommand::PenDown => pen.intent = Some(true),
            MotionCommand::PenUp => pen.intent = Some(false),
            MotionCommand::MoveTo { x, y, .. } => {
                pen.flush(&mut out);
                let target = resolve_target(*x, *y, pos);
                bbox = Some(match bbox {
                    Some(b) => BoundingBox::new(b.min.min(target), b.max.max(target)),
                    None => BoundingBox::new(target, target),
                });
                pos = Some(target);
                out.push(cmd);
            }
            MotionCommand::MoveArc {
                center,
                radius,
                end_angle,
                ..
            } => {
                pen.flush(&mut out);
                pos = Some(arc_end(*center, *radius, *end_angle));
                out.push(cmd);
            }
            MotionCommand::Home => {
                pen.flush(&mut out);
                pos = Some(Point::origin());
                out.push(cmd);
            }
        }
    }

    // A pen change at the very end still has to happen, even though no move
    // follows it.
    if let Some(intent) = pen.intent {
        if pen.current != Some(intent) {
            out.push(toggle(intent));
        }
    }

    log::info!(
        "reduced command stream from {} to {} commands",
        commands.len(),
        out.len()
    );
    if let Some(b) = &bbox {
        log::info!(
            "bounding box is ({}, {}) x ({}, {}) mm",
            b.min.x,
            b.min.y,
            b.max.x,
            b.max.y
        );
    }

    PostProcessed {
        commands: out,
        bounding_box: bbox,
        original_len: commands.len(),
    }
}

/// Decodes and post-processes a sequence of protocol lines. Lines that don't
/// decode are skipped with a warning; blank lines are skipped silently.
pub fn post_process_lines<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    min_segment_len: f64,
) -> PostProcessed {
    let mut commands = Vec::new();
    let mut line_count = 0;
    for (idx, line) in lines.into_iter().enumerate() {
        line_count += 1;
        match decode(line) {
            Ok(cmd) => commands.push(cmd),
            Err(DecodeError::Empty) => {}
            Err(e) => log::warn!("skipping line {}: {e}", idx + 1),
        }
    }
    let mut ret = post_process(&commands, min_segment_len);
    ret.original_len = line_count;
    ret
}
