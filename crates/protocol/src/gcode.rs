//! The line-oriented motion protocol, a tiny subset of G-code.
//!
//! Each line is an opcode followed by whitespace-separated `<letter><float>`
//! parameters. The opcode is matched by prefix, so `G01` is a `G0`.

use std::{fmt, str::FromStr};

use thiserror::Error;
use vplot_geom::{LenExt as _, Point};

use crate::{Angle, MotionCommand};

#[derive(Clone, Debug, PartialEq, Error)]
pub enum DecodeError {
    #[error("empty command")]
    Empty,

    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),

    #[error("malformed parameter '{0}'")]
    MalformedParameter(String),

    #[error("parameter '{0}' is not a finite number")]
    NonFinite(String),

    #[error("speed must be positive, got {0}")]
    InvalidSpeed(f64),

    #[error("arc is missing its '{0}' parameter")]
    MissingArcParameter(char),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Opcode {
    Move,
    Home,
    Arc,
    PenDown,
    PenUp,
}

impl Opcode {
    fn from_token(tok: &str) -> Option<Opcode> {
        // G28 has to be checked before G2.
        if tok.starts_with("G0") {
            Some(Opcode::Move)
        } else if tok.starts_with("G28") {
            Some(Opcode::Home)
        } else if tok.starts_with("G2") {
            Some(Opcode::Arc)
        } else if tok.starts_with("M3") {
            Some(Opcode::PenDown)
        } else if tok.starts_with("M4") {
            Some(Opcode::PenUp)
        } else {
            None
        }
    }
}

struct Params {
    values: Vec<(char, f64)>,
}

impl Params {
    fn parse<'a>(tokens: impl Iterator<Item = &'a str>) -> Result<Params, DecodeError> {
        let mut values = Vec::new();
        for tok in tokens {
            let mut chars = tok.chars();
            let key = chars
                .next()
                .filter(|c| c.is_ascii_alphabetic())
                .ok_or_else(|| DecodeError::MalformedParameter(tok.to_owned()))?;
            let val: f64 = chars
                .as_str()
                .parse()
                .map_err(|_| DecodeError::MalformedParameter(tok.to_owned()))?;
            if !val.is_finite() {
                return Err(DecodeError::NonFinite(tok.to_owned()));
            }
            values.push((key.to_ascii_uppercase(), val));
        }
        Ok(Params { values })
    }

    // Later values win over earlier ones.
    fn get(&self, key: char) -> Option<f64> {
        self.values
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn speed(&self) -> Result<Option<f64>, DecodeError> {
        match self.get('S') {
            Some(s) if s <= 0.0 => Err(DecodeError::InvalidSpeed(s)),
            s => Ok(s),
        }
    }
}

/// Decodes one line of the protocol.
pub fn decode(line: &str) -> Result<MotionCommand, DecodeError> {
    let mut tokens = line.split_whitespace();
    let op = tokens.next().ok_or(DecodeError::Empty)?;
    let opcode = Opcode::from_token(op).ok_or_else(|| DecodeError::UnknownOpcode(op.to_owned()))?;
    let params = Params::parse(tokens)?;

    Ok(match opcode {
        Opcode::Move => MotionCommand::MoveTo {
            x: params.get('X'),
            y: params.get('Y'),
            speed: params.speed()?,
        },
        Opcode::Home => MotionCommand::Home,
        Opcode::Arc => {
            let require = |key| {
                params
                    .get(key)
                    .ok_or(DecodeError::MissingArcParameter(key))
            };
            let x = require('X')?;
            let y = require('Y')?;
            let radius = require('R')?;
            MotionCommand::MoveArc {
                center: Point::new(x, y),
                radius: radius.mm(),
                start_angle: Angle::degrees(params.get('A').unwrap_or(0.0)),
                end_angle: Angle::degrees(params.get('B').unwrap_or(360.0)),
                speed: params.speed()?,
            }
        }
        Opcode::PenDown => MotionCommand::PenDown,
        Opcode::PenUp => MotionCommand::PenUp,
    })
}

/// Encodes a command as one protocol line (without a line terminator).
pub fn encode(cmd: &MotionCommand) -> String {
    cmd.to_string()
}

impl fmt::Display for MotionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let speed = |f: &mut fmt::Formatter<'_>, s: &Option<f64>| match s {
            Some(s) => write!(f, " S{s}"),
            None => Ok(()),
        };

        match self {
            MotionCommand::MoveTo { x, y, speed: s } => {
                f.write_str("G0")?;
                if let Some(x) = x {
                    write!(f, " X{x}")?;
                }
                if let Some(y) = y {
                    write!(f, " Y{y}")?;
                }
                speed(f, s)
            }
            MotionCommand::MoveArc {
                center,
                radius,
                start_angle,
                end_angle,
                speed: s,
            } => {
                write!(
                    f,
                    "G2 X{} Y{} R{} A{} B{}",
                    center.x,
                    center.y,
                    radius.get(),
                    start_angle.to_degrees(),
                    end_angle.to_degrees()
                )?;
                speed(f, s)
            }
            MotionCommand::Home => f.write_str("G28"),
            MotionCommand::PenDown => f.write_str("M3"),
            MotionCommand::PenUp => f.write_str("M4"),
        }
    }
}

impl FromStr for MotionCommand {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves() {
        assert_eq!(
            decode("G0 X300 Y400").unwrap(),
            MotionCommand::move_to(300.0, 400.0)
        );
        assert_eq!(
            decode("  G0 X1.5 Y-2 S250 ").unwrap(),
            MotionCommand::MoveTo {
                x: Some(1.5),
                y: Some(-2.0),
                speed: Some(250.0)
            }
        );
        assert_eq!(
            decode("G0 Y7").unwrap(),
            MotionCommand::MoveTo {
                x: None,
                y: Some(7.0),
                speed: None
            }
        );
        // Opcodes match by prefix.
        assert_eq!(
            decode("G01 X1 Y2").unwrap(),
            MotionCommand::move_to(1.0, 2.0)
        );
    }

    #[test]
    fn simple_opcodes() {
        assert_eq!(decode("G28").unwrap(), MotionCommand::Home);
        assert_eq!(decode("M3").unwrap(), MotionCommand::PenDown);
        assert_eq!(decode("M4").unwrap(), MotionCommand::PenUp);
    }

    #[test]
    fn arcs() {
        let cmd = decode("G2 X10 Y20 R5 A90 B180 S100").unwrap();
        let MotionCommand::MoveArc {
            center,
            radius,
            start_angle,
            end_angle,
            speed,
        } = cmd
        else {
            panic!("expected an arc, got {cmd:?}");
        };
        assert_eq!(center, Point::new(10.0, 20.0));
        assert_eq!(radius.get(), 5.0);
        assert!((start_angle.to_degrees() - 90.0).abs() < 1e-9);
        assert!((end_angle.to_degrees() - 180.0).abs() < 1e-9);
        assert_eq!(speed, Some(100.0));

        // Angles default to a full circle.
        let MotionCommand::MoveArc {
            start_angle,
            end_angle,
            ..
        } = decode("G2 X0 Y0 R1").unwrap()
        else {
            panic!("expected an arc");
        };
        assert_eq!(start_angle.to_degrees(), 0.0);
        assert!((end_angle.to_degrees() - 360.0).abs() < 1e-9);
    }

    #[test]
    fn errors() {
        assert_eq!(decode(""), Err(DecodeError::Empty));
        assert_eq!(decode("   "), Err(DecodeError::Empty));
        assert_eq!(
            decode("G9 X1"),
            Err(DecodeError::UnknownOpcode("G9".to_owned()))
        );
        assert_eq!(
            decode("G0 Xabc Y1"),
            Err(DecodeError::MalformedParameter("Xabc".to_owned()))
        );
        assert_eq!(
            decode("G0 12 Y1"),
            Err(DecodeError::MalformedParameter("12".to_owned()))
        );
        assert_eq!(
            decode("G0 Xinf"),
            Err(DecodeError::NonFinite("Xinf".to_owned()))
        );
        assert_eq!(decode("G0 X1 S0"), Err(DecodeError::InvalidSpeed(0.0)));
        assert_eq!(decode("G2"), Err(DecodeError::MissingArcParameter('X')));
        assert_eq!(
            decode("G2 X1 Y1"),
            Err(DecodeError::MissingArcParameter('R'))
        );
    }

    #[test]
    fn encoding() {
        assert_eq!(encode(&MotionCommand::move_to(10.0, 10.0)), "G0 X10 Y10");
        assert_eq!(
            encode(&MotionCommand::MoveTo {
                x: Some(1.25),
                y: None,
                speed: Some(3000.0)
            }),
            "G0 X1.25 S3000"
        );
        assert_eq!(encode(&MotionCommand::Home), "G28");
        assert_eq!(encode(&MotionCommand::PenDown), "M3");
        assert_eq!(encode(&MotionCommand::PenUp), "M4");
    }

    #[test]
    fn arcs_survive_encoding() {
        let cmd = decode("G2 X10 Y20 R5 A90 B180").unwrap();
        let again = decode(&encode(&cmd)).unwrap();
        let (
            MotionCommand::MoveArc {
                center: c0,
                radius: r0,
                end_angle: e0,
                ..
            },
            MotionCommand::MoveArc {
                center: c1,
                radius: r1,
                end_angle: e1,
                ..
            },
        ) = (cmd, again)
        else {
            panic!("expected arcs");
        };
        assert_eq!(c0, c1);
        assert_eq!(r0, r1);
        assert!((e0.radians - e1.radians).abs() < 1e-12);
    }
}
