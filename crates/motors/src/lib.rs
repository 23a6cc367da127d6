//! Stepper and servo drivers for the plotter, on top of a small GPIO
//! abstraction.
//!
//! The drivers don't own the GPIO port; every operation borrows it. Whoever
//! runs the motors owns the port and is responsible for calling
//! [`GpioPort::cleanup`] when done.

mod gpio;
pub mod mock;
#[cfg(feature = "rpi")]
pub mod rpi;
mod servo;
mod stepper;

pub use gpio::{GpioError, GpioPort};
pub use servo::ServoDriver;
pub use stepper::{Microstepping, PulseSchedule, StepperDriver, StepperPins, Tick};
