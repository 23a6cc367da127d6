use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use thiserror::Error;
use vplot_geom::{CordLengths, KinematicModel, LenExt as _, Point};
use vplot_motors::{GpioError, GpioPort, Microstepping, ServoDriver, StepperDriver, StepperPins};
use vplot_protocol::PrimitiveMove;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Gpio(#[from] GpioError),

    #[error("speed must be positive, got {0}")]
    InvalidSpeed(f64),

    #[error("sink used before it was started")]
    NotStarted,

    #[error("{0}")]
    Other(String),
}

/// Where the motor stage sends primitive moves.
///
/// All three methods are called from the motor stage's thread: `start` once
/// before the first move, `finish` once after the last one (also when the
/// stage exits early).
pub trait MotionSink: Send + 'static {
    fn start(&mut self) -> Result<(), SinkError>;

    fn apply(&mut self, mv: &PrimitiveMove) -> Result<(), SinkError>;

    fn finish(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HardwareConfig {
    pub stepper_pins: StepperPins,
    pub microstepping: Microstepping,
    pub invert_dir: [bool; 2],
    pub servo_pin: u8,
    pub servo_frequency_hz: f64,
    /// The servo starts out here, with the pen up.
    pub initial_duty: f64,
    pub servo_settle: Duration,
}

struct Drivers {
    steppers: StepperDriver,
    servo: ServoDriver,
}

type OpenGpio<G> = Box<dyn FnOnce() -> Result<G, GpioError> + Send>;

/// Runs primitive moves on real motors.
pub struct HardwareSink<G: GpioPort> {
    gpio: Option<G>,
    open: Option<OpenGpio<G>>,
    config: HardwareConfig,
    drivers: Option<Drivers>,
    released: bool,
}

impl<G: GpioPort + 'static> HardwareSink<G> {
    /// A sink on a port that is already open.
    pub fn new(gpio: G, config: HardwareConfig) -> Self {
        HardwareSink {
            gpio: Some(gpio),
            open: None,
            config,
            drivers: None,
            released: false,
        }
    }

    /// A sink that opens its port when it starts, on the motor stage's thread.
    pub fn connect(
        open: impl FnOnce() -> Result<G, GpioError> + Send + 'static,
        config: HardwareConfig,
    ) -> Self {
        HardwareSink {
            gpio: None,
            open: Some(Box::new(open)),
            config,
            drivers: None,
            released: false,
        }
    }

    /// The direction line levels for a signed step pair. The two motors are
    /// mounted mirrored, so lengthening the right cord is the opposite level.
    fn directions(&self, steps: [i32; 2]) -> [bool; 2] {
        [
            (steps[0] > 0) != self.config.invert_dir[0],
            (steps[1] < 0) != self.config.invert_dir[1],
        ]
    }

    /// How long a move of `steps` takes at `speed`.
    ///
    /// Each microstep takes `microstepping / speed` seconds, so the speed is
    /// in full steps per second.
    pub fn step_window(&self, steps: [i32; 2], speed: f64) -> Result<Duration, SinkError> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(SinkError::InvalidSpeed(speed));
        }
        let delay = self.config.microstepping.factor() as f64 / speed;
        let max = steps[0].unsigned_abs().max(steps[1].unsigned_abs());
        // A tiny enough speed doesn't fit in a `Duration`.
        Duration::try_from_secs_f64(delay * max as f64)
            .map_err(|_| SinkError::InvalidSpeed(speed))
    }
}

impl<G: GpioPort + 'static> MotionSink for HardwareSink<G> {
    fn start(&mut self) -> Result<(), SinkError> {
        if let Some(open) = self.open.take() {
            self.gpio = Some(open()?);
        }
        let gpio = self.gpio.as_mut().ok_or(SinkError::NotStarted)?;
        let steppers = StepperDriver::init(
            &mut *gpio,
            self.config.stepper_pins,
            self.config.microstepping,
        )?;
        let servo = ServoDriver::init(
            gpio,
            self.config.servo_pin,
            self.config.servo_frequency_hz,
            self.config.initial_duty,
        )?;
        self.drivers = Some(Drivers { steppers, servo });
        log::info!("motors ready");
        Ok(())
    }

    fn apply(&mut self, mv: &PrimitiveMove) -> Result<(), SinkError> {
        match *mv {
            PrimitiveMove::StepperDelta { steps, speed } => {
                let window = self.step_window(steps, speed)?;
                let directions = self.directions(steps);
                let drivers = self.drivers.as_ref().ok_or(SinkError::NotStarted)?;
                let gpio = self.gpio.as_mut().ok_or(SinkError::NotStarted)?;
                drivers.steppers.do_steps(
                    gpio,
                    directions,
                    [steps[0].unsigned_abs(), steps[1].unsigned_abs()],
                    window,
                )?;
            }
            PrimitiveMove::PenTarget { duty_cycle } => {
                let drivers = self.drivers.as_mut().ok_or(SinkError::NotStarted)?;
                let gpio = self.gpio.as_mut().ok_or(SinkError::NotStarted)?;
                drivers.servo.move_to(gpio, duty_cycle, self.config.servo_settle)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        if !self.released {
            self.released = true;
            self.drivers = None;
            if let Some(gpio) = self.gpio.as_mut() {
                gpio.cleanup();
                log::info!("gpio released");
            }
        }
    }
}

impl<G: GpioPort> Drop for HardwareSink<G> {
    fn drop(&mut self) {
        if self.drivers.is_some() && !self.released {
            log::warn!("hardware sink dropped while running, releasing gpio");
            self.released = true;
            if let Some(gpio) = self.gpio.as_mut() {
                gpio.cleanup();
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct TracePoint {
    pub position: Point,
    pub pen_down: bool,
}

/// A shared view of a simulated trace, for sampling it while the pipeline runs.
#[derive(Clone, Debug, Default)]
pub struct TraceHandle {
    points: Arc<Mutex<Vec<TracePoint>>>,
}

impl TraceHandle {
    fn lock(&self) -> MutexGuard<'_, Vec<TracePoint>> {
        self.points.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Vec<TracePoint> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<TracePoint> {
        self.lock().last().copied()
    }
}

/// Replays primitive moves against the kinematic model instead of motors.
///
/// After every move, the pen position is reconstructed from the accumulated
/// cord lengths and recorded, so the trace shows what the hardware would
/// have drawn.
pub struct SimulatedSink<M> {
    model: M,
    pen_up_duty: f64,
    pen_down_duty: f64,
    cords: CordLengths,
    pen_down: bool,
    trace: TraceHandle,
}

impl<M: KinematicModel> SimulatedSink<M> {
    pub fn new(model: M, pen_up_duty: f64, pen_down_duty: f64) -> Self {
        let cords = model.point_to_cord_lengths(&Point::origin());
        SimulatedSink {
            model,
            pen_up_duty,
            pen_down_duty,
            cords,
            pen_down: false,
            trace: TraceHandle::default(),
        }
    }

    pub fn trace(&self) -> TraceHandle {
        self.trace.clone()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn position(&self) -> Point {
        self.model.cord_lengths_to_point(&self.cords)
    }

    pub fn pen_down(&self) -> bool {
        self.pen_down
    }

    fn record(&self) {
        self.trace.lock().push(TracePoint {
            position: self.position(),
            pen_down: self.pen_down,
        });
    }
}

impl<M: KinematicModel> MotionSink for SimulatedSink<M> {
    fn start(&mut self) -> Result<(), SinkError> {
        self.record();
        Ok(())
    }

    fn apply(&mut self, mv: &PrimitiveMove) -> Result<(), SinkError> {
        match *mv {
            PrimitiveMove::StepperDelta { steps, .. } => {
                let spm = self.model.calibration().steps_per_mm;
                self.cords.left += (steps[0] as f64 / spm).mm();
                self.cords.right += (steps[1] as f64 / spm).mm();
            }
            PrimitiveMove::PenTarget { duty_cycle } => {
                self.pen_down = (duty_cycle - self.pen_down_duty).abs()
                    < (duty_cycle - self.pen_up_duty).abs();
            }
        }
        self.record();
        Ok(())
    }

    fn finish(&mut self) {
        log::info!("simulation recorded {} trace points", self.trace.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vplot_geom::{CalibrationBuilder, TriangleModel};
    use vplot_motors::mock::MockGpio;

    const CONFIG: HardwareConfig = HardwareConfig {
        stepper_pins: StepperPins {
            dir: [22, 24],
            step: [25, 23],
            mode: [19, 13, 6],
        },
        microstepping: Microstepping::Sixteenth,
        invert_dir: [false, false],
        servo_pin: 17,
        servo_frequency_hz: 50.0,
        initial_duty: 8.7,
        servo_settle: Duration::ZERO,
    };

    fn model() -> TriangleModel {
        let calib = CalibrationBuilder::default()
            .with_anchor_separation(1000.0.mm())
            .build::<TriangleModel>(&CordLengths::from_mm(500.0, 700.0))
            .unwrap();
        TriangleModel::new(calib)
    }

    #[test]
    fn step_timing() {
        let sink = HardwareSink::new(MockGpio::new(), CONFIG);
        let window = sink.step_window([100, -40], 16000.0).unwrap();
        assert!((window.as_secs_f64() - 0.1).abs() < 1e-6);
        assert!(matches!(
            sink.step_window([1, 1], 0.0),
            Err(SinkError::InvalidSpeed(_))
        ));
        // Positive, but far too slow to represent.
        assert!(matches!(
            sink.step_window([10, 3], 1e-300),
            Err(SinkError::InvalidSpeed(_))
        ));
    }

    #[test]
    fn opens_the_port_on_start() {
        let gpio = MockGpio::new();
        let port = gpio.clone();
        let mut sink = HardwareSink::connect(move || Ok(port), CONFIG);
        assert!(gpio.events().is_empty());
        sink.start().unwrap();
        assert!(!gpio.events().is_empty());
        sink.finish();
        assert_eq!(gpio.cleanups(), 1);
    }

    #[test]
    fn failed_open() {
        let mut sink = HardwareSink::<MockGpio>::connect(
            || Err(GpioError::Unavailable("no gpio".to_owned())),
            CONFIG,
        );
        assert!(matches!(sink.start(), Err(SinkError::Gpio(_))));
        sink.finish();
    }

    #[test]
    fn direction_levels() {
        let sink = HardwareSink::new(MockGpio::new(), CONFIG);
        assert_eq!(sink.directions([5, 5]), [true, false]);
        assert_eq!(sink.directions([-5, -5]), [false, true]);

        let inverted = HardwareSink::new(
            MockGpio::new(),
            HardwareConfig {
                invert_dir: [true, false],
                ..CONFIG
            },
        );
        assert_eq!(inverted.directions([5, 5]), [false, false]);
    }

    #[test]
    fn hardware_moves() {
        let gpio = MockGpio::new();
        let mut sink = HardwareSink::new(gpio.clone(), CONFIG);
        sink.start().unwrap();
        sink.apply(&PrimitiveMove::StepperDelta {
            steps: [3, -2],
            speed: 1e6,
        })
        .unwrap();
        sink.apply(&PrimitiveMove::PenTarget { duty_cycle: 7.5 })
            .unwrap();
        assert_eq!(gpio.pulses(25), 3);
        assert_eq!(gpio.pulses(23), 2);
        assert_eq!(gpio.level(22), Some(true));
        assert_eq!(gpio.level(24), Some(true));

        sink.finish();
        sink.finish();
        drop(sink);
        assert_eq!(gpio.cleanups(), 1);
    }

    #[test]
    fn moves_before_start_fail() {
        let mut sink = HardwareSink::new(MockGpio::new(), CONFIG);
        assert!(matches!(
            sink.apply(&PrimitiveMove::PenTarget { duty_cycle: 7.5 }),
            Err(SinkError::NotStarted)
        ));
        sink.finish();
    }

    #[test]
    fn simulated_trace() {
        let mut sink = SimulatedSink::new(model(), 8.7, 7.5);
        let trace = sink.trace();
        sink.start().unwrap();
        sink.apply(&PrimitiveMove::PenTarget { duty_cycle: 7.5 })
            .unwrap();

        // Lengthening both cords by the same amount moves the pen straight-ish
        // down, away from the anchors.
        sink.apply(&PrimitiveMove::StepperDelta {
            steps: [80, 80],
            speed: 1000.0,
        })
        .unwrap();
        sink.finish();

        let points = trace.snapshot();
        assert_eq!(points.len(), 3);
        assert!(points[0].position.to_vector().length() < 1e-6);
        assert!(!points[0].pen_down);
        assert!(points[1].pen_down);
        assert!(points[2].position.y > 0.5);
    }
}
