//! Device drivers and the driver registry.

pub mod ata;
pub mod keyboard;
pub mod pci;
pub mod pcnet;
pub mod serial;
pub mod timer;
pub mod vga_buffer;

use alloc::sync::Arc;
use alloc::vec::Vec;

/// Minimal driver lifecycle. `activate` runs once interrupts are set up;
/// `reset` puts the hardware back into a known state.
pub trait Driver: Send + Sync {
    fn activate(&self) {}
    fn reset(&self) {}
    fn deactivate(&self) {}
}

/// Holds every registered driver and activates them in registration
/// order during boot.
pub struct DriverManager {
    drivers: Vec<Arc<dyn Driver>>,
}

impl DriverManager {
    pub const fn new() -> DriverManager {
        DriverManager {
            drivers: Vec::new(),
        }
    }

    pub fn add_driver(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.push(driver);
    }

    pub fn activate_all(&self) {
        for driver in &self.drivers {
            driver.activate();
        }
    }
}
