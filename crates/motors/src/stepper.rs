use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{GpioError, GpioPort};

/// The microstepping modes of a DRV8825-style driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Microstepping {
    Full,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
}

impl Microstepping {
    /// How many microsteps make up one full step.
    pub fn factor(self) -> u32 {
        match self {
            Microstepping::Full => 1,
            Microstepping::Half => 2,
            Microstepping::Quarter => 4,
            Microstepping::Eighth => 8,
            Microstepping::Sixteenth => 16,
            Microstepping::ThirtySecond => 32,
        }
    }

    /// Levels for the three mode pins (M0, M1, M2).
    pub fn pattern(self) -> [bool; 3] {
        match self {
            Microstepping::Full => [false, false, false],
            Microstepping::Half => [true, false, false],
            Microstepping::Quarter => [false, true, false],
            Microstepping::Eighth => [true, true, false],
            Microstepping::Sixteenth => [false, false, true],
            Microstepping::ThirtySecond => [true, false, true],
        }
    }
}

impl TryFrom<u32> for Microstepping {
    type Error = GpioError;

    fn try_from(factor: u32) -> Result<Self, GpioError> {
        Ok(match factor {
            1 => Microstepping::Full,
            2 => Microstepping::Half,
            4 => Microstepping::Quarter,
            8 => Microstepping::Eighth,
            16 => Microstepping::Sixteenth,
            32 => Microstepping::ThirtySecond,
            _ => return Err(GpioError::UnsupportedMicrostepping(factor)),
        })
    }
}

impl From<Microstepping> for u32 {
    fn from(m: Microstepping) -> u32 {
        m.factor()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tick {
    pub left: bool,
    pub right: bool,
}

/// Spreads two step counts over the same number of scheduling ticks.
///
/// There are `max(counts)` ticks. The pulses of an axis with `n` steps sit at
/// evenly spaced positions from tick 0 to the last tick, and each one fires on
/// the first tick that comes within half a tick of its position. An axis
/// never fires more than once per tick.
#[derive(Debug)]
pub struct PulseSchedule {
    counts: [u32; 2],
    fired: [u32; 2],
    ticks: u32,
    tick: u32,
}

impl PulseSchedule {
    pub fn new(counts: [u32; 2]) -> Self {
        PulseSchedule {
            counts,
            fired: [0, 0],
            ticks: counts[0].max(counts[1]),
            tick: 0,
        }
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    // Pulse `i` of `n` is at position i * (ticks - 1) / (n - 1), and it's due
    // once that's at most tick + 1/2. We compare in integers to keep the last
    // pulse exactly on the last tick.
    fn due(&self, axis: usize) -> bool {
        let n = self.counts[axis] as u64;
        let i = self.fired[axis] as u64;
        if i >= n {
            return false;
        }
        if n == 1 {
            return true;
        }
        let span = self.ticks as u64 - 1;
        2 * i * span <= (2 * self.tick as u64 + 1) * (n - 1)
    }
}

impl Iterator for PulseSchedule {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        if self.tick >= self.ticks {
            return None;
        }
        let ret = Tick {
            left: self.due(0),
            right: self.due(1),
        };
        self.fired[0] += u32::from(ret.left);
        self.fired[1] += u32::from(ret.right);
        self.tick += 1;
        Some(ret)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepperPins {
    pub dir: [u8; 2],
    pub step: [u8; 2],
    /// The mode pins, shared by both drivers.
    pub mode: [u8; 3],
}

/// Two stepper drivers, moved in lockstep.
#[derive(Debug)]
pub struct StepperDriver {
    pins: StepperPins,
    microstepping: Microstepping,
}

impl StepperDriver {
    /// Sets up all the stepper pins as outputs and selects the microstepping mode.
    pub fn init(
        gpio: &mut impl GpioPort,
        pins: StepperPins,
        microstepping: Microstepping,
    ) -> Result<Self, GpioError> {
        for pin in pins.dir.iter().chain(&pins.step).chain(&pins.mode) {
            gpio.setup_output(*pin)?;
        }
        let mut ret = StepperDriver {
            pins,
            microstepping,
        };
        ret.set_microstepping(gpio, microstepping)?;
        Ok(ret)
    }

    pub fn microstepping(&self) -> Microstepping {
        self.microstepping
    }

    pub fn set_microstepping(
        &mut self,
        gpio: &mut impl GpioPort,
        microstepping: Microstepping,
    ) -> Result<(), GpioError> {
        for (pin, level) in self.pins.mode.iter().zip(microstepping.pattern()) {
            gpio.write(*pin, level)?;
        }
        self.microstepping = microstepping;
        log::debug!("microstepping set to 1/{}", microstepping.factor());
        Ok(())
    }

    /// Steps both motors so that they finish together, after about
    /// `total_window`.
    ///
    /// The direction lines are set once, before the first pulse. Ticks are
    /// spaced evenly over the window, and we sleep until each tick's deadline
    /// rather than for a fixed delay, so time spent toggling pins doesn't add
    /// up.
    pub fn do_steps(
        &self,
        gpio: &mut impl GpioPort,
        directions: [bool; 2],
        step_counts: [u32; 2],
        total_window: Duration,
    ) -> Result<(), GpioError> {
        let schedule = PulseSchedule::new(step_counts);
        let ticks = schedule.ticks();
        if ticks == 0 {
            return Ok(());
        }

        gpio.write(self.pins.dir[0], directions[0])?;
        gpio.write(self.pins.dir[1], directions[1])?;

        let start = Instant::now();
        let per_tick = total_window / ticks;
        for (idx, tick) in (1..).zip(schedule) {
            if tick.left {
                gpio.pulse(self.pins.step[0])?;
            }
            if tick.right {
                gpio.pulse(self.pins.step[1])?;
            }
            let deadline = start + per_tick * idx;
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }
        Ok(())
    }
}
