//! AMD PCnet (Am79C973) network driver.
//!
//! The card is programmed through a register-address/register-data port
//! pair (RAP/RDP for the CSRs, RAP/BDP for the bus-control registers)
//! and works off an initialization block plus two rings of eight
//! descriptors. Ownership of a descriptor toggles on bit 31 of its flags
//! word: set means the card owns it, clear means the driver does.

use crate::arch::x86;
use crate::arch::x86::port::Port16;
use crate::interrupts::{InterruptHandler, InterruptManager, HARDWARE_INTERRUPT_OFFSET};
use crate::net::device::{NicDevice, RawDataHandler};
use crate::net::{Ipv4Address, MacAddress};
use crate::println;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use spin::Mutex;

pub const VENDOR_AMD: u16 = 0x1022;
pub const DEVICE_PCNET: u16 = 0x2000;

/// log2 of the descriptor count; both rings have eight entries.
const BUFFER_COUNT_LOG: u8 = 3;
const BUFFER_COUNT: usize = 1 << BUFFER_COUNT_LOG;
const BUFFER_SIZE: usize = 2048;
const MAX_FRAME_SIZE: usize = 1518;

const DESC_OWN: u32 = 0x8000_0000;
const DESC_ERROR: u32 = 0x4000_0000;
const DESC_START_END: u32 = 0x0300_0000;

const CSR0_STOP: u16 = 0x04;
const CSR0_START: u16 = 0x41;
const CSR0_INIT: u16 = 0x42;
const CSR0_TRANSMIT_DEMAND: u16 = 0x48;

/// Configuration block the card fetches via CSR1/CSR2.
#[repr(C, packed)]
struct InitializationBlock {
    mode: u16,
    send_buffer_log: u8,
    recv_buffer_log: u8,
    physical_address: [u8; 6],
    reserved: u16,
    logical_address: u64,
    recv_descriptor_address: u32,
    send_descriptor_address: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct BufferDescriptor {
    address: u32,
    flags: u32,
    flags2: u32,
    avail: u32,
}

const ZERO_DESCRIPTOR: BufferDescriptor = BufferDescriptor {
    address: 0,
    flags: 0,
    flags2: 0,
    avail: 0,
};

/// Descriptor rings and their backing buffers. The card requires the
/// descriptor addresses to be 16-byte aligned; the layout keeps every
/// member on a 16-byte boundary.
#[repr(C, align(16))]
struct DescriptorRings {
    send: [BufferDescriptor; BUFFER_COUNT],
    recv: [BufferDescriptor; BUFFER_COUNT],
    send_buffers: [[u8; BUFFER_SIZE]; BUFFER_COUNT],
    recv_buffers: [[u8; BUFFER_SIZE]; BUFFER_COUNT],
}

struct Ports {
    register_data: Port16,
    register_address: Port16,
    reset: Port16,
    bus_control_data: Port16,
}

impl Ports {
    fn write_csr(&mut self, index: u16, value: u16) {
        unsafe {
            self.register_address.write(index);
            self.register_data.write(value);
        }
    }

    fn read_csr(&mut self, index: u16) -> u16 {
        unsafe {
            self.register_address.write(index);
            self.register_data.read()
        }
    }

    fn write_bcr(&mut self, index: u16, value: u16) {
        unsafe {
            self.register_address.write(index);
            self.bus_control_data.write(value);
        }
    }
}

struct PcnetState {
    init_block: Box<InitializationBlock>,
    rings: Box<DescriptorRings>,
    current_send: usize,
    current_recv: usize,
}

pub struct PcnetDriver {
    mac: MacAddress,
    ip: Mutex<Ipv4Address>,
    ports: Mutex<Ports>,
    state: Mutex<PcnetState>,
    rx_frame: Mutex<[u8; BUFFER_SIZE]>,
    handler: Mutex<Option<Weak<dyn RawDataHandler>>>,
}

impl PcnetDriver {
    /// Bring the card to a stopped, fully configured state and register
    /// its interrupt handler. [`Driver::activate`] starts it.
    ///
    /// [`Driver::activate`]: crate::drivers::Driver::activate
    pub fn attach(
        descriptor: &crate::drivers::pci::DeviceDescriptor,
        interrupts: &Arc<InterruptManager>,
    ) -> Arc<PcnetDriver> {
        let base = descriptor.port_base;
        let mut ports = Ports {
            register_data: Port16::new(base + 0x10),
            register_address: Port16::new(base + 0x12),
            reset: Port16::new(base + 0x14),
            bus_control_data: Port16::new(base + 0x16),
        };

        let mac = unsafe {
            let word0 = Port16::new(base).read();
            let word2 = Port16::new(base + 0x02).read();
            let word4 = Port16::new(base + 0x04).read();
            MacAddress::new([
                (word0 & 0xFF) as u8,
                (word0 >> 8) as u8,
                (word2 & 0xFF) as u8,
                (word2 >> 8) as u8,
                (word4 & 0xFF) as u8,
                (word4 >> 8) as u8,
            ])
        };

        // 32-bit bus mode, then stop the card for configuration.
        ports.write_bcr(20, 0x102);
        ports.write_csr(0, CSR0_STOP);

        let mut rings = Box::new(DescriptorRings {
            send: [ZERO_DESCRIPTOR; BUFFER_COUNT],
            recv: [ZERO_DESCRIPTOR; BUFFER_COUNT],
            send_buffers: [[0; BUFFER_SIZE]; BUFFER_COUNT],
            recv_buffers: [[0; BUFFER_SIZE]; BUFFER_COUNT],
        });

        for i in 0..BUFFER_COUNT {
            rings.send[i] = BufferDescriptor {
                address: rings.send_buffers[i].as_ptr() as u32,
                flags: 0x7FF | 0xF000,
                flags2: 0,
                avail: 0,
            };
            rings.recv[i] = BufferDescriptor {
                address: rings.recv_buffers[i].as_ptr() as u32,
                flags: 0xF7FF | DESC_OWN,
                flags2: 0,
                avail: 0,
            };
        }

        let init_block = Box::new(InitializationBlock {
            mode: 0,
            send_buffer_log: BUFFER_COUNT_LOG << 4,
            recv_buffer_log: BUFFER_COUNT_LOG << 4,
            physical_address: *mac.bytes(),
            reserved: 0,
            logical_address: 0,
            recv_descriptor_address: rings.recv.as_ptr() as u32,
            send_descriptor_address: rings.send.as_ptr() as u32,
        });

        let init_address = &*init_block as *const InitializationBlock as u32;
        ports.write_csr(1, (init_address & 0xFFFF) as u16);
        ports.write_csr(2, (init_address >> 16) as u16);

        let driver = Arc::new(PcnetDriver {
            mac,
            ip: Mutex::new(Ipv4Address::new(0, 0, 0, 0)),
            ports: Mutex::new(ports),
            state: Mutex::new(PcnetState {
                init_block,
                rings,
                current_send: 0,
                current_recv: 0,
            }),
            rx_frame: Mutex::new([0; BUFFER_SIZE]),
            handler: Mutex::new(None),
        });

        let handler: Arc<dyn InterruptHandler> = driver.clone();
        interrupts.set_handler(
            HARDWARE_INTERRUPT_OFFSET as u8 + descriptor.interrupt_line,
            &handler,
        );

        driver
    }

    /// Walk the receive ring and deliver every driver-owned frame.
    fn receive(&self) {
        loop {
            let mut frame = self.rx_frame.lock();
            let size;
            {
                let mut state = self.state.lock();
                let index = state.current_recv;
                let descriptor = state.rings.recv[index];

                if descriptor.flags & DESC_OWN != 0 {
                    break;
                }

                if descriptor.flags & DESC_ERROR == 0
                    && descriptor.flags & DESC_START_END == DESC_START_END
                {
                    let mut length = (descriptor.flags & 0xFFF) as usize;
                    if length > 64 {
                        // Drop the trailing CRC.
                        length -= 4;
                    }
                    frame[..length].copy_from_slice(&state.rings.recv_buffers[index][..length]);
                    size = length;
                } else {
                    size = 0;
                }

                // Hand the descriptor back to the card. The payload has
                // been copied out, so the card may refill it while the
                // stack is still parsing.
                state.rings.recv[index].flags2 = 0;
                state.rings.recv[index].flags = 0x8000F7FF;
                state.current_recv = (index + 1) % BUFFER_COUNT;
            }

            if size > 0 {
                let handler = self
                    .handler
                    .lock()
                    .as_ref()
                    .and_then(Weak::upgrade);
                if let Some(handler) = handler {
                    if handler.on_raw_data(&mut frame[..size]) {
                        self.send(&frame[..size]);
                    }
                }
            }
        }
    }
}

impl crate::drivers::Driver for PcnetDriver {
    fn activate(&self) {
        let mut ports = self.ports.lock();
        ports.write_csr(0, CSR0_START);

        let csr4 = ports.read_csr(4);
        ports.write_csr(4, csr4 | 0xC00);

        ports.write_csr(0, CSR0_INIT);
    }

    fn reset(&self) {
        let mut ports = self.ports.lock();
        unsafe {
            ports.reset.read();
            ports.reset.write(0);
        }
        for _ in 0..10000 {
            core::hint::spin_loop();
        }
    }
}

impl NicDevice for PcnetDriver {
    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn ip_address(&self) -> Ipv4Address {
        *self.ip.lock()
    }

    fn set_ip_address(&self, ip: Ipv4Address) {
        *self.ip.lock() = ip;
        let mut state = self.state.lock();
        state.init_block.logical_address = ip.to_network_u32() as u64;
    }

    fn send(&self, buffer: &[u8]) {
        x86::without_interrupts(|| {
            let length = buffer.len().min(MAX_FRAME_SIZE);

            let mut state = self.state.lock();
            let index = state.current_send;
            state.current_send = (index + 1) % BUFFER_COUNT;

            state.rings.send_buffers[index][..length].copy_from_slice(&buffer[..length]);
            state.rings.send[index].avail = 0;
            state.rings.send[index].flags2 = 0;
            state.rings.send[index].flags =
                0x8300F000 | ((length as u32).wrapping_neg() & 0xFFF);
            drop(state);

            self.ports.lock().write_csr(0, CSR0_TRANSMIT_DEMAND);
        });
    }

    fn set_raw_data_handler(&self, handler: &Arc<dyn RawDataHandler>) {
        *self.handler.lock() = Some(Arc::downgrade(handler));
    }
}

impl InterruptHandler for PcnetDriver {
    fn handle_interrupt(&self, esp: u32) -> u32 {
        let status = self.ports.lock().read_csr(0);

        if status & 0x8000 != 0 {
            println!("PCNET ERROR");
        }
        if status & 0x2000 != 0 {
            println!("PCNET COLLISION ERROR");
        }
        if status & 0x1000 != 0 {
            println!("PCNET MISSED FRAME");
        }
        if status & 0x0800 != 0 {
            println!("PCNET MEMORY ERROR");
        }
        if status & 0x0400 != 0 {
            self.receive();
        }

        // Writing the bits back acknowledges them.
        self.ports.lock().write_csr(0, status);

        if status & 0x0100 != 0 {
            println!("PCNET INIT DONE");
        }

        esp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, offset_of, size_of};

    #[test_case]
    fn initialization_block_layout_is_pinned() {
        assert_eq!(size_of::<InitializationBlock>(), 28);
        assert_eq!(offset_of!(InitializationBlock, physical_address), 4);
        assert_eq!(offset_of!(InitializationBlock, logical_address), 12);
        assert_eq!(offset_of!(InitializationBlock, recv_descriptor_address), 20);
        assert_eq!(offset_of!(InitializationBlock, send_descriptor_address), 24);
    }

    #[test_case]
    fn descriptor_ring_is_sixteen_byte_aligned() {
        assert_eq!(size_of::<BufferDescriptor>(), 16);
        assert_eq!(align_of::<DescriptorRings>(), 16);
        assert_eq!(offset_of!(DescriptorRings, recv) % 16, 0);
        assert_eq!(offset_of!(DescriptorRings, send_buffers) % 16, 0);
    }

    #[test_case]
    fn transmit_flags_encode_size_complement() {
        let flags = 0x8300F000u32 | (64u32.wrapping_neg() & 0xFFF);
        assert_eq!(flags, 0x8300FFC0);
    }
}
