//! Programmable Interval Timer (PIT).
//!
//! Channel 0 as a rate generator at 100 Hz. The tick itself is counted
//! from the interrupt dispatch path; the scheduler runs off the same
//! interrupt.

use crate::arch::x86::port::Port8;
use core::sync::atomic::{AtomicU64, Ordering};

const PIT_FREQUENCY: u32 = 1193182;
const TARGET_HZ: u32 = 100;

static JIFFIES: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    let divisor = (PIT_FREQUENCY / TARGET_HZ) as u16;

    unsafe {
        // Channel 0, lobyte/hibyte access, rate generator.
        Port8::new(0x43).write(0x36);
        let mut data = Port8::new(0x40);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
}

/// Called on every timer interrupt.
pub fn tick() {
    JIFFIES.fetch_add(1, Ordering::Relaxed);
}

pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

pub fn uptime_ms() -> u64 {
    jiffies() * (1000 / TARGET_HZ as u64)
}
