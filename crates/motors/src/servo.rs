use std::time::Duration;

use crate::{gpio::check_duty_cycle, GpioError, GpioPort};

/// The pen servo, driven by PWM.
#[derive(Debug)]
pub struct ServoDriver {
    pin: u8,
    duty_cycle: f64,
}

impl ServoDriver {
    /// Sets up the servo pin and starts PWM at `initial_duty`.
    pub fn init(
        gpio: &mut impl GpioPort,
        pin: u8,
        frequency_hz: f64,
        initial_duty: f64,
    ) -> Result<Self, GpioError> {
        check_duty_cycle(initial_duty)?;
        gpio.setup_output(pin)?;
        gpio.start_pwm(pin, frequency_hz, initial_duty)?;
        Ok(ServoDriver {
            pin,
            duty_cycle: initial_duty,
        })
    }

    pub fn duty_cycle(&self) -> f64 {
        self.duty_cycle
    }

    /// Changes the duty cycle, then blocks for `settle` while the servo moves.
    pub fn move_to(
        &mut self,
        gpio: &mut impl GpioPort,
        duty_cycle: f64,
        settle: Duration,
    ) -> Result<(), GpioError> {
        check_duty_cycle(duty_cycle)?;
        gpio.set_duty_cycle(self.pin, duty_cycle)?;
        self.duty_cycle = duty_cycle;
        std::thread::sleep(settle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{GpioEvent, MockGpio};

    #[test]
    fn starts_and_moves() {
        let mut gpio = MockGpio::new();
        let mut servo = ServoDriver::init(&mut gpio, 17, 50.0, 8.7).unwrap();
        servo.move_to(&mut gpio, 7.5, Duration::ZERO).unwrap();
        assert_eq!(servo.duty_cycle(), 7.5);
        assert_eq!(
            gpio.events(),
            vec![
                GpioEvent::Setup(17),
                GpioEvent::StartPwm {
                    pin: 17,
                    frequency_hz: 50.0,
                    duty_cycle: 8.7
                },
                GpioEvent::DutyCycle {
                    pin: 17,
                    duty_cycle: 7.5
                },
            ]
        );
    }

    #[test]
    fn rejects_bad_duty() {
        let mut gpio = MockGpio::new();
        let mut servo = ServoDriver::init(&mut gpio, 17, 50.0, 8.7).unwrap();
        assert_eq!(
            servo.move_to(&mut gpio, 120.0, Duration::ZERO),
            Err(GpioError::InvalidDutyCycle(120.0))
        );
        assert_eq!(servo.duty_cycle(), 8.7);
    }
}
