//! ATA PIO driver (28-bit LBA).
//!
//! Polling-mode access to one drive on an IDE channel. Out-of-range
//! requests (sector beyond 28 bits, write larger than one sector) return
//! silently; that is the error contract for this device class.

use crate::arch::x86::port::{Port16, Port8};
use crate::println;

const SECTOR_SIZE: usize = 512;
const MAX_LBA28: u32 = 0x0FFF_FFFF;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_FLUSH_CACHE: u8 = 0xE7;

pub struct AtaDrive {
    master: bool,
    data: Port16,
    error: Port8,
    sector_count: Port8,
    lba_low: Port8,
    lba_mid: Port8,
    lba_high: Port8,
    device: Port8,
    command: Port8,
    control: Port8,
}

impl AtaDrive {
    /// `port_base` is 0x1F0 for the primary channel, 0x170 for the
    /// secondary; `master` selects the drive on the cable.
    pub const fn new(master: bool, port_base: u16) -> AtaDrive {
        AtaDrive {
            master,
            data: Port16::new(port_base),
            error: Port8::new(port_base + 1),
            sector_count: Port8::new(port_base + 2),
            lba_low: Port8::new(port_base + 3),
            lba_mid: Port8::new(port_base + 4),
            lba_high: Port8::new(port_base + 5),
            device: Port8::new(port_base + 6),
            command: Port8::new(port_base + 7),
            control: Port8::new(port_base + 0x206),
        }
    }

    fn select(&mut self) -> u8 {
        if self.master {
            0xE0
        } else {
            0xF0
        }
    }

    fn wait_ready(&mut self) -> Result<(), ()> {
        let mut status = unsafe { self.command.read() };
        while status & 0x80 == 0x80 && status & 0x01 != 0x01 {
            status = unsafe { self.command.read() };
        }
        if status & 0x01 != 0 {
            return Err(());
        }
        Ok(())
    }

    /// Probe the drive. Prints a diagnostic and returns `false` when no
    /// device answers.
    pub fn identify(&mut self) -> bool {
        unsafe {
            self.device.write(if self.master { 0xA0 } else { 0xB0 });
            self.control.write(0);

            self.device.write(0xA0);
            let status = self.command.read();
            if status == 0xFF {
                return false;
            }

            self.device.write(if self.master { 0xA0 } else { 0xB0 });
            self.sector_count.write(0);
            self.lba_low.write(0);
            self.lba_mid.write(0);
            self.lba_high.write(0);
            self.command.write(CMD_IDENTIFY);

            let status = self.command.read();
            if status == 0x00 {
                return false;
            }
        }

        if self.wait_ready().is_err() {
            println!("ATA ERROR");
            return false;
        }

        // Drain the identification block.
        for _ in 0..256 {
            unsafe {
                self.data.read();
            }
        }
        true
    }

    /// Read one sector into `buffer` (up to 512 bytes).
    pub fn read28(&mut self, sector: u32, buffer: &mut [u8]) {
        if sector > MAX_LBA28 || buffer.len() > SECTOR_SIZE {
            return;
        }

        unsafe {
            self.device
                .write(self.select() | ((sector >> 24) & 0x0F) as u8);
            self.error.write(0);
            self.sector_count.write(1);
            self.lba_low.write((sector & 0xFF) as u8);
            self.lba_mid.write(((sector >> 8) & 0xFF) as u8);
            self.lba_high.write(((sector >> 16) & 0xFF) as u8);
            self.command.write(CMD_READ_SECTORS);
        }

        if self.wait_ready().is_err() {
            println!("ATA READ ERROR");
            return;
        }

        for i in (0..SECTOR_SIZE).step_by(2) {
            let word = unsafe { self.data.read() };
            if i < buffer.len() {
                buffer[i] = (word & 0xFF) as u8;
            }
            if i + 1 < buffer.len() {
                buffer[i + 1] = (word >> 8) as u8;
            }
        }
    }

    /// Write at most one sector; the remainder of the sector is zeroed.
    pub fn write28(&mut self, sector: u32, data: &[u8]) {
        if sector > MAX_LBA28 || data.len() > SECTOR_SIZE {
            return;
        }

        unsafe {
            self.device
                .write(self.select() | ((sector >> 24) & 0x0F) as u8);
            self.error.write(0);
            self.sector_count.write(1);
            self.lba_low.write((sector & 0xFF) as u8);
            self.lba_mid.write(((sector >> 8) & 0xFF) as u8);
            self.lba_high.write(((sector >> 16) & 0xFF) as u8);
            self.command.write(CMD_WRITE_SECTORS);
        }

        for i in (0..SECTOR_SIZE).step_by(2) {
            let low = data.get(i).copied().unwrap_or(0) as u16;
            let high = data.get(i + 1).copied().unwrap_or(0) as u16;
            unsafe {
                self.data.write((high << 8) | low);
            }
        }
    }

    /// Ask the drive to commit its write cache.
    pub fn flush(&mut self) {
        unsafe {
            self.device.write(self.select());
            self.command.write(CMD_FLUSH_CACHE);
        }
        if self.wait_ready().is_err() {
            println!("ATA FLUSH ERROR");
        }
    }
}
