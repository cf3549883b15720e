//! Serial port (COM1) driver.
//!
//! Diagnostics channel: kernel logging and the test harness both write
//! here, so output survives on machines where the screen does not.

use crate::arch::x86::port::Port8;
use core::fmt::{self, Write};
use spin::Mutex;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    data: Port8,
    line_status: Port8,
}

impl SerialPort {
    const fn new() -> SerialPort {
        SerialPort {
            data: Port8::new(COM1),
            line_status: Port8::new(COM1 + 5),
        }
    }

    fn init(&mut self) {
        unsafe {
            // Disable UART interrupts.
            Port8::new(COM1 + 1).write(0x00);
            // DLAB on, divisor 3 (38400 baud), DLAB off with 8N1.
            Port8::new(COM1 + 3).write(0x80);
            Port8::new(COM1).write(0x03);
            Port8::new(COM1 + 1).write(0x00);
            Port8::new(COM1 + 3).write(0x03);
            // FIFO on, cleared, 14-byte threshold.
            Port8::new(COM1 + 2).write(0xC7);
            // DTR + RTS.
            Port8::new(COM1 + 4).write(0x0B);
        }
    }

    fn is_transmit_empty(&mut self) -> bool {
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    fn send_byte(&mut self, byte: u8) {
        for _ in 0..10000 {
            if self.is_transmit_empty() {
                break;
            }
        }
        unsafe {
            self.data.write(byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send_byte(b'\r');
            }
            self.send_byte(byte);
        }
        Ok(())
    }
}

static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new());

pub fn init() {
    SERIAL.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    crate::arch::x86::without_interrupts(|| {
        SERIAL.lock().write_fmt(args).ok();
    });
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::drivers::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
