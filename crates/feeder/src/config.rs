use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context as _};
use serde::{Deserialize, Serialize};
use vplot_geom::{
    BoundingBox, Calibration, CalibrationBuilder, CordLengths, LenExt as _, Point, TriangleModel,
};
use vplot_motors::{Microstepping, StepperPins};
use vplot_pipeline::{HardwareConfig, MotorBackend, PipelineConfig, RangeCheck, RangePolicy};
use vplot_planner::PlannerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DrawingArea {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

/// Everything about the plotter that doesn't change between drawings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlotterConfig {
    pub backend: MotorBackend,
    /// The distance between the two cord anchors, in mm.
    pub base_width: f64,
    /// The measured cord lengths (left, right) at the starting position.
    pub initial_cords: Option<[f64; 2]>,
    pub steps_per_mm: f64,
    /// The sampling resolution for step computation, in mm.
    pub movement_resolution: f64,
    pub default_speed: f64,

    pub dir_pins: [u8; 2],
    pub step_pins: [u8; 2],
    pub res_pins: [u8; 3],
    pub invert_step_dir: [bool; 2],
    pub micro_stepping: Microstepping,

    pub servo_pin: u8,
    pub servo_frequency_hz: f64,
    /// Servo duty cycles, in percent.
    pub servo_pos_up: f64,
    pub servo_pos_down: f64,
    pub servo_settle_ms: u64,

    pub command_queue_capacity: usize,
    pub move_queue_capacity: usize,
    pub progress_interval: usize,

    pub drawing_area: Option<DrawingArea>,
    pub range_policy: RangePolicy,
}

impl Default for PlotterConfig {
    fn default() -> Self {
        PlotterConfig {
            backend: MotorBackend::Simulated,
            base_width: 620.0,
            initial_cords: None,
            steps_per_mm: 80.0,
            movement_resolution: 1.0,
            default_speed: 10000.0,
            dir_pins: [22, 24],
            step_pins: [25, 23],
            res_pins: [19, 13, 6],
            invert_step_dir: [false, false],
            micro_stepping: Microstepping::Sixteenth,
            servo_pin: 17,
            servo_frequency_hz: 50.0,
            servo_pos_up: 8.7,
            servo_pos_down: 7.5,
            servo_settle_ms: 300,
            command_queue_capacity: 1000,
            move_queue_capacity: 100,
            progress_interval: 1000,
            drawing_area: None,
            range_policy: RangePolicy::Ignore,
        }
    }
}

impl PlotterConfig {
    /// Loads the configuration at `path`, or the defaults if there's no path.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(PlotterConfig::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> anyhow::Result<Self> {
        let config: PlotterConfig = toml::from_str(content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(self.default_speed.is_finite() && self.default_speed > 0.0) {
            return Err(anyhow!(
                "default_speed must be positive, got {}",
                self.default_speed
            ));
        }
        for (name, duty) in [
            ("servo_pos_up", self.servo_pos_up),
            ("servo_pos_down", self.servo_pos_down),
        ] {
            if !(0.0..=100.0).contains(&duty) {
                return Err(anyhow!("{name} must be a percentage, got {duty}"));
            }
        }
        if self.range_policy != RangePolicy::Ignore && self.drawing_area.is_none() {
            return Err(anyhow!(
                "range_policy {:?} needs a drawing_area",
                self.range_policy
            ));
        }
        Ok(())
    }

    /// Builds the calibration from the configured constants and the initial
    /// cord lengths. `cords` overrides the configured lengths.
    pub fn calibration(&self, cords: Option<[f64; 2]>) -> anyhow::Result<Calibration> {
        let [left, right] = cords.or(self.initial_cords).ok_or_else(|| {
            anyhow!("initial cord lengths are required (set initial_cords or pass --left/--right)")
        })?;
        let calib = CalibrationBuilder::default()
            .with_anchor_separation(self.base_width.mm())
            .with_steps_per_mm(self.steps_per_mm)
            .with_resolution(self.movement_resolution.mm())
            .build::<TriangleModel>(&CordLengths::from_mm(left, right))?;
        Ok(calib)
    }

    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            default_speed: self.default_speed,
            pen_up_duty: self.servo_pos_up,
            pen_down_duty: self.servo_pos_down,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            command_queue_capacity: self.command_queue_capacity,
            move_queue_capacity: self.move_queue_capacity,
            progress_interval: self.progress_interval,
            planner: self.planner(),
            range_check: self.drawing_area.map(|area| RangeCheck {
                area: BoundingBox::new(
                    Point::new(area.min[0], area.min[1]),
                    Point::new(area.max[0], area.max[1]),
                ),
                policy: self.range_policy,
            }),
        }
    }

    pub fn hardware(&self) -> HardwareConfig {
        HardwareConfig {
            stepper_pins: StepperPins {
                dir: self.dir_pins,
                step: self.step_pins,
                mode: self.res_pins,
            },
            microstepping: self.micro_stepping,
            invert_dir: self.invert_step_dir,
            servo_pin: self.servo_pin,
            servo_frequency_hz: self.servo_frequency_hz,
            initial_duty: self.servo_pos_up,
            servo_settle: Duration::from_millis(self.servo_settle_ms),
        }
    }
}

pub fn default_path() -> PathBuf {
    PathBuf::from("vplot.toml")
}
