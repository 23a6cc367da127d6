//! GPIO on a Raspberry Pi, through `rppal`.

use std::collections::HashMap;

use rppal::gpio::{Gpio, OutputPin};

use crate::{gpio::check_duty_cycle, GpioError, GpioPort};

pub struct RpiGpio {
    gpio: Gpio,
    outputs: HashMap<u8, OutputPin>,
    pwm_frequency: HashMap<u8, f64>,
}

impl RpiGpio {
    pub fn new() -> Result<Self, GpioError> {
        let gpio = Gpio::new().map_err(|e| GpioError::Unavailable(e.to_string()))?;
        Ok(RpiGpio {
            gpio,
            outputs: HashMap::new(),
            pwm_frequency: HashMap::new(),
        })
    }

    fn output(&mut self, pin: u8) -> Result<&mut OutputPin, GpioError> {
        self.outputs
            .get_mut(&pin)
            .ok_or(GpioError::NotConfigured(pin))
    }
}

fn pin_error(pin: u8) -> impl FnOnce(rppal::gpio::Error) -> GpioError {
    move |e| GpioError::Pin {
        pin,
        reason: e.to_string(),
    }
}

impl GpioPort for RpiGpio {
    fn setup_output(&mut self, pin: u8) -> Result<(), GpioError> {
        let out = self.gpio.get(pin).map_err(pin_error(pin))?.into_output_low();
        self.outputs.insert(pin, out);
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<(), GpioError> {
        let out = self.output(pin)?;
        if high {
            out.set_high();
        } else {
            out.set_low();
        }
        Ok(())
    }

    // Software PWM: rppal only offers hardware PWM on the PWM channels, and
    // the servo pin isn't necessarily one of them.
    fn start_pwm(
        &mut self,
        pin: u8,
        frequency_hz: f64,
        duty_cycle: f64,
    ) -> Result<(), GpioError> {
        check_duty_cycle(duty_cycle)?;
        self.output(pin)?
            .set_pwm_frequency(frequency_hz, duty_cycle / 100.0)
            .map_err(pin_error(pin))?;
        self.pwm_frequency.insert(pin, frequency_hz);
        Ok(())
    }

    fn set_duty_cycle(&mut self, pin: u8, duty_cycle: f64) -> Result<(), GpioError> {
        check_duty_cycle(duty_cycle)?;
        let frequency_hz = *self
            .pwm_frequency
            .get(&pin)
            .ok_or(GpioError::NotConfigured(pin))?;
        self.output(pin)?
            .set_pwm_frequency(frequency_hz, duty_cycle / 100.0)
            .map_err(pin_error(pin))
    }

    fn cleanup(&mut self) {
        for (pin, mut out) in self.outputs.drain() {
            if self.pwm_frequency.contains_key(&pin) {
                if let Err(e) = out.clear_pwm() {
                    log::warn!("failed to stop pwm on pin {pin}: {e}");
                }
            }
            out.set_low();
        }
        self.pwm_frequency.clear();
    }
}
