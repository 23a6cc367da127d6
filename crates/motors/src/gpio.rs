use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GpioError {
    #[error("pin {0} is not set up as an output")]
    NotConfigured(u8),

    #[error("duty cycle must be between 0 and 100 percent, got {0}")]
    InvalidDutyCycle(f64),

    #[error("unsupported microstepping factor {0}")]
    UnsupportedMicrostepping(u32),

    #[error("gpio failure on pin {pin}: {reason}")]
    Pin { pin: u8, reason: String },

    #[error("gpio unavailable: {0}")]
    Unavailable(String),
}

/// Digital outputs and PWM, as much of them as the motor drivers need.
///
/// Pins are numbered the way the underlying hardware numbers them (BCM numbers
/// on a Raspberry Pi). Duty cycles are in percent.
pub trait GpioPort: Send {
    fn setup_output(&mut self, pin: u8) -> Result<(), GpioError>;

    fn write(&mut self, pin: u8, high: bool) -> Result<(), GpioError>;

    /// A single high-then-low pulse, as used on a stepper driver's step line.
    fn pulse(&mut self, pin: u8) -> Result<(), GpioError> {
        self.write(pin, true)?;
        self.write(pin, false)
    }

    fn start_pwm(&mut self, pin: u8, frequency_hz: f64, duty_cycle: f64)
        -> Result<(), GpioError>;

    fn set_duty_cycle(&mut self, pin: u8, duty_cycle: f64) -> Result<(), GpioError>;

    /// Releases every pin. Called once, when the motors are done.
    fn cleanup(&mut self);
}

pub(crate) fn check_duty_cycle(duty_cycle: f64) -> Result<(), GpioError> {
    if (0.0..=100.0).contains(&duty_cycle) {
        Ok(())
    } else {
        Err(GpioError::InvalidDutyCycle(duty_cycle))
    }
}
