//! Relay-board access: a trait covering what the rest of the kernel needs
//! from a GPIO bank, a real `rppal`-backed implementation behind the `gpio`
//! feature, and a mock used everywhere else (dev machines, CI, unit tests).
//!
//! Relays on this board are active-low: driving the pin low energizes the
//! relay coil. `set_pin` takes the *logical* on/off state and does the
//! inversion itself, so callers never have to think about polarity.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{KernelError, KernelResult};

pub trait GpioDriver: Send + Sync {
    /// Drive `pin` to the logical `on` state (true = energized).
    fn set_pin(&self, pin: u8, on: bool) -> KernelResult<()>;

    /// Last logical state written to `pin`, or `false` if never written.
    fn get_pin(&self, pin: u8) -> bool;
}

#[cfg(feature = "gpio")]
pub mod real {
    use super::*;
    use rppal::gpio::{Gpio, OutputPin};
    use std::collections::HashMap as StdHashMap;

    pub struct RppalGpio {
        pins: Mutex<StdHashMap<u8, OutputPin>>,
    }

    impl RppalGpio {
        pub fn new() -> KernelResult<Self> {
            Ok(Self {
                pins: Mutex::new(StdHashMap::new()),
            })
        }

        fn with_pin<R>(&self, pin: u8, f: impl FnOnce(&mut OutputPin) -> R) -> KernelResult<R> {
            let mut pins = self.pins.lock().expect("gpio pin map poisoned");
            if !pins.contains_key(&pin) {
                let output = Gpio::new()
                    .map_err(|e| KernelError::hardware(format!("gpio init: {e}")))?
                    .get(pin)
                    .map_err(|e| KernelError::hardware(format!("gpio get pin {pin}: {e}")))?
                    .into_output_high(); // active-low: idle high = relay off
                pins.insert(pin, output);
            }
            Ok(f(pins.get_mut(&pin).expect("pin was just inserted")))
        }
    }

    impl GpioDriver for RppalGpio {
        fn set_pin(&self, pin: u8, on: bool) -> KernelResult<()> {
            debug!(pin, on, "driving relay pin");
            self.with_pin(pin, |p| {
                if on {
                    p.set_low();
                } else {
                    p.set_high();
                }
            })
        }

        fn get_pin(&self, pin: u8) -> bool {
            self.with_pin(pin, |p| p.is_set_low()).unwrap_or(false)
        }
    }
}

/// In-memory relay bank used on dev machines and in tests. Tracks logical
/// on/off state per pin; never touches real hardware.
#[derive(Default)]
pub struct MockGpio {
    state: Mutex<HashMap<u8, bool>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GpioDriver for MockGpio {
    fn set_pin(&self, pin: u8, on: bool) -> KernelResult<()> {
        debug!(pin, on, "driving relay pin (mock)");
        self.state.lock().expect("mock gpio state poisoned").insert(pin, on);
        Ok(())
    }

    fn get_pin(&self, pin: u8) -> bool {
        *self
            .state
            .lock()
            .expect("mock gpio state poisoned")
            .get(&pin)
            .unwrap_or(&false)
    }
}
