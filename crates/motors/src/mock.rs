//! A fake GPIO port that records what was done to it.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{gpio::check_duty_cycle, GpioError, GpioPort};

#[derive(Clone, Debug, PartialEq)]
pub enum GpioEvent {
    Setup(u8),
    Write { pin: u8, high: bool },
    StartPwm { pin: u8, frequency_hz: f64, duty_cycle: f64 },
    DutyCycle { pin: u8, duty_cycle: f64 },
    Cleanup,
}

#[derive(Debug, Default)]
struct MockState {
    outputs: HashSet<u8>,
    pwm: HashSet<u8>,
    faulty: HashSet<u8>,
    events: Vec<GpioEvent>,
}

/// Clones share the same recording, so a test can keep one handle while the
/// motor stage owns another.
#[derive(Clone, Debug, Default)]
pub struct MockGpio {
    state: Arc<Mutex<MockState>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Vec<GpioEvent> {
        self.state().events.clone()
    }

    /// The number of pulses (rising edges) on `pin`.
    pub fn pulses(&self, pin: u8) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| matches!(e, GpioEvent::Write { pin: p, high: true } if *p == pin))
            .count()
    }

    /// The last level written to `pin`, if any.
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.state().events.iter().rev().find_map(|e| match e {
            GpioEvent::Write { pin: p, high } if *p == pin => Some(*high),
            _ => None,
        })
    }

    pub fn cleanups(&self) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| matches!(e, GpioEvent::Cleanup))
            .count()
    }

    /// Makes every subsequent write to `pin` fail.
    pub fn inject_fault(&self, pin: u8) {
        self.state().faulty.insert(pin);
    }

    pub fn clear_faults(&self) {
        self.state().faulty.clear();
    }
}

impl GpioPort for MockGpio {
    fn setup_output(&mut self, pin: u8) -> Result<(), GpioError> {
        let mut state = self.state();
        state.outputs.insert(pin);
        state.events.push(GpioEvent::Setup(pin));
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<(), GpioError> {
        let mut state = self.state();
        if !state.outputs.contains(&pin) {
            return Err(GpioError::NotConfigured(pin));
        }
        if state.faulty.contains(&pin) {
            return Err(GpioError::Pin {
                pin,
                reason: "injected fault".to_owned(),
            });
        }
        state.events.push(GpioEvent::Write { pin, high });
        Ok(())
    }

    fn start_pwm(
        &mut self,
        pin: u8,
        frequency_hz: f64,
        duty_cycle: f64,
    ) -> Result<(), GpioError> {
        check_duty_cycle(duty_cycle)?;
        let mut state = self.state();
        if !state.outputs.contains(&pin) {
            return Err(GpioError::NotConfigured(pin));
        }
        state.pwm.insert(pin);
        state.events.push(GpioEvent::StartPwm {
            pin,
            frequency_hz,
            duty_cycle,
        });
        Ok(())
    }

    fn set_duty_cycle(&mut self, pin: u8, duty_cycle: f64) -> Result<(), GpioError> {
        check_duty_cycle(duty_cycle)?;
        let mut state = self.state();
        if !state.pwm.contains(&pin) {
            return Err(GpioError::NotConfigured(pin));
        }
        state.events.push(GpioEvent::DutyCycle { pin, duty_cycle });
        Ok(())
    }

    fn cleanup(&mut self) {
        let mut state = self.state();
        state.outputs.clear();
        state.pwm.clear();
        state.events.push(GpioEvent::Cleanup);
    }
}
