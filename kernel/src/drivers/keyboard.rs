//! PS/2 keyboard driver.
//!
//! IRQ 1 handler: reads scancodes from port 0x60, decodes them with
//! `pc_keyboard` and echoes printable characters to the console.

use crate::arch::x86::port::Port8;
use crate::interrupts::{InterruptHandler, InterruptManager, HARDWARE_INTERRUPT_OFFSET};
use crate::print;
use alloc::sync::Arc;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

const KEYBOARD_IRQ: u8 = 1;
const DATA_PORT: u16 = 0x60;
const COMMAND_PORT: u16 = 0x64;

pub struct KeyboardDriver {
    decoder: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>>,
    data: Mutex<Port8>,
    command: Mutex<Port8>,
}

impl KeyboardDriver {
    pub fn new() -> KeyboardDriver {
        KeyboardDriver {
            decoder: Mutex::new(Keyboard::new(
                ScancodeSet1::new(),
                layouts::Us104Key,
                HandleControl::Ignore,
            )),
            data: Mutex::new(Port8::new(DATA_PORT)),
            command: Mutex::new(Port8::new(COMMAND_PORT)),
        }
    }

    /// Register for IRQ 1.
    pub fn attach(interrupts: &Arc<InterruptManager>) -> Arc<KeyboardDriver> {
        let driver = Arc::new(KeyboardDriver::new());
        let handler: Arc<dyn InterruptHandler> = driver.clone();
        interrupts.set_handler(HARDWARE_INTERRUPT_OFFSET as u8 + KEYBOARD_IRQ, &handler);
        driver
    }
}

impl crate::drivers::Driver for KeyboardDriver {
    fn activate(&self) {
        let mut command = self.command.lock();
        let mut data = self.data.lock();
        unsafe {
            // Drain whatever the controller buffered during boot.
            while command.read() & 0x1 != 0 {
                data.read();
            }
            // Enable the first port, then interrupts in the config byte.
            command.write(0xAE);
            command.write(0x20);
            let status = (data.read() | 1) & !0x10;
            command.write(0x60);
            data.write(status);
            // Enable scanning.
            data.write(0xF4);
        }
    }
}

impl InterruptHandler for KeyboardDriver {
    fn handle_interrupt(&self, esp: u32) -> u32 {
        let scancode = unsafe { self.data.lock().read() };

        let mut decoder = self.decoder.lock();
        if let Ok(Some(event)) = decoder.add_byte(scancode) {
            if let Some(DecodedKey::Unicode(character)) = decoder.process_keyevent(event) {
                print!("{}", character);
            }
        }

        esp
    }
}
