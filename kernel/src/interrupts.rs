//! Interrupt descriptor table, PIC remapping and interrupt dispatch.
//!
//! Every vector points at a small assembly stub that records the vector
//! number and jumps to a common trampoline. The trampoline pushes the
//! general-purpose registers so the stack holds a complete [`CpuState`]
//! frame, then calls [`interrupt_dispatch`] with the vector and the frame
//! address. Whatever frame address comes back is loaded into `esp` before
//! `iret` — returning a different task's saved frame is the entire
//! context-switch mechanism.
//!
//! [`CpuState`]: crate::task::CpuState

#![allow(static_mut_refs)]

use crate::arch::x86;
use crate::arch::x86::port::Port8Slow;
use crate::println;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::arch::{asm, global_asm};
use spin::Mutex;

/// Base vector the hardware IRQs are remapped to.
pub const HARDWARE_INTERRUPT_OFFSET: u16 = 0x20;
/// Software-interrupt vector of the syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

const IDT_ENTRIES: usize = 256;
const PIC_EOI: u8 = 0x20;

/// Something that consumes interrupts for one vector.
///
/// The handler receives the address of the stacked [`CpuState`] frame and
/// returns the frame address to resume from; returning the input leaves
/// the interrupted context untouched.
///
/// [`CpuState`]: crate::task::CpuState
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self, esp: u32) -> u32;
}

/// One 8-byte interrupt gate, laid out exactly as the CPU reads it.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GateDescriptor {
    handler_low: u16,
    selector: u16,
    reserved: u8,
    access: u8,
    handler_high: u16,
}

const GATE_PRESENT: u8 = 0x80;
const GATE_INTERRUPT_32: u8 = 0xE;

impl GateDescriptor {
    const fn missing() -> GateDescriptor {
        GateDescriptor {
            handler_low: 0,
            selector: 0,
            reserved: 0,
            access: 0,
            handler_high: 0,
        }
    }

    fn new(handler: u32, selector: u16, dpl: u8) -> GateDescriptor {
        GateDescriptor {
            handler_low: (handler & 0xFFFF) as u16,
            selector,
            reserved: 0,
            access: GATE_PRESENT | ((dpl & 3) << 5) | GATE_INTERRUPT_32,
            handler_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }

    fn is_present(&self) -> bool {
        self.access & GATE_PRESENT != 0
    }
}

static mut IDT: [GateDescriptor; IDT_ENTRIES] = [GateDescriptor::missing(); IDT_ENTRIES];

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

// Stub farm. Each stub leaves the stack holding a complete frame:
// vectors whose exception pushes a CPU error code keep it, every other
// stub pushes a dummy word so the `error` slot always exists. The vector
// itself goes into a byte variable instead of the stack so the frame
// matches `CpuState` exactly; interrupt gates run with interrupts
// disabled on a single CPU, so the byte cannot be clobbered mid-flight.
global_asm!(
    r#"
    .section .data
    interrupt_vector: .byte 0

    .section .text

    .macro stub_noerr name, vec
    .global \name
    \name:
        push 0
        mov byte ptr [interrupt_vector], \vec
        jmp interrupt_common
    .endm

    .macro stub_err name, vec
    .global \name
    \name:
        mov byte ptr [interrupt_vector], \vec
        jmp interrupt_common
    .endm

    .global interrupt_ignore
    interrupt_ignore:
        iret

    stub_noerr exception_stub_0x00, 0x00
    stub_noerr exception_stub_0x01, 0x01
    stub_noerr exception_stub_0x02, 0x02
    stub_noerr exception_stub_0x03, 0x03
    stub_noerr exception_stub_0x04, 0x04
    stub_noerr exception_stub_0x05, 0x05
    stub_noerr exception_stub_0x06, 0x06
    stub_noerr exception_stub_0x07, 0x07
    stub_err   exception_stub_0x08, 0x08
    stub_noerr exception_stub_0x09, 0x09
    stub_err   exception_stub_0x0a, 0x0a
    stub_err   exception_stub_0x0b, 0x0b
    stub_err   exception_stub_0x0c, 0x0c
    stub_err   exception_stub_0x0d, 0x0d
    stub_err   exception_stub_0x0e, 0x0e
    stub_noerr exception_stub_0x0f, 0x0f
    stub_noerr exception_stub_0x10, 0x10
    stub_err   exception_stub_0x11, 0x11
    stub_noerr exception_stub_0x12, 0x12
    stub_noerr exception_stub_0x13, 0x13

    stub_noerr irq_stub_0x00, 0x20
    stub_noerr irq_stub_0x01, 0x21
    stub_noerr irq_stub_0x02, 0x22
    stub_noerr irq_stub_0x03, 0x23
    stub_noerr irq_stub_0x04, 0x24
    stub_noerr irq_stub_0x05, 0x25
    stub_noerr irq_stub_0x06, 0x26
    stub_noerr irq_stub_0x07, 0x27
    stub_noerr irq_stub_0x08, 0x28
    stub_noerr irq_stub_0x09, 0x29
    stub_noerr irq_stub_0x0a, 0x2a
    stub_noerr irq_stub_0x0b, 0x2b
    stub_noerr irq_stub_0x0c, 0x2c
    stub_noerr irq_stub_0x0d, 0x2d
    stub_noerr irq_stub_0x0e, 0x2e
    stub_noerr irq_stub_0x0f, 0x2f

    stub_noerr syscall_stub_0x80, 0x80

    interrupt_common:
        push ebp
        push edi
        push esi
        push edx
        push ecx
        push ebx
        push eax

        mov eax, esp
        push eax
        movzx eax, byte ptr [interrupt_vector]
        push eax
        call interrupt_dispatch
        add esp, 8

        mov esp, eax

        pop eax
        pop ebx
        pop ecx
        pop edx
        pop esi
        pop edi
        pop ebp
        add esp, 4
        iret
    "#
);

extern "C" {
    fn interrupt_ignore();
    fn exception_stub_0x00();
    fn exception_stub_0x01();
    fn exception_stub_0x02();
    fn exception_stub_0x03();
    fn exception_stub_0x04();
    fn exception_stub_0x05();
    fn exception_stub_0x06();
    fn exception_stub_0x07();
    fn exception_stub_0x08();
    fn exception_stub_0x09();
    fn exception_stub_0x0a();
    fn exception_stub_0x0b();
    fn exception_stub_0x0c();
    fn exception_stub_0x0d();
    fn exception_stub_0x0e();
    fn exception_stub_0x0f();
    fn exception_stub_0x10();
    fn exception_stub_0x11();
    fn exception_stub_0x12();
    fn exception_stub_0x13();
    fn irq_stub_0x00();
    fn irq_stub_0x01();
    fn irq_stub_0x02();
    fn irq_stub_0x03();
    fn irq_stub_0x04();
    fn irq_stub_0x05();
    fn irq_stub_0x06();
    fn irq_stub_0x07();
    fn irq_stub_0x08();
    fn irq_stub_0x09();
    fn irq_stub_0x0a();
    fn irq_stub_0x0b();
    fn irq_stub_0x0c();
    fn irq_stub_0x0d();
    fn irq_stub_0x0e();
    fn irq_stub_0x0f();
    fn syscall_stub_0x80();
}

const EXCEPTION_STUBS: [unsafe extern "C" fn(); 20] = [
    exception_stub_0x00,
    exception_stub_0x01,
    exception_stub_0x02,
    exception_stub_0x03,
    exception_stub_0x04,
    exception_stub_0x05,
    exception_stub_0x06,
    exception_stub_0x07,
    exception_stub_0x08,
    exception_stub_0x09,
    exception_stub_0x0a,
    exception_stub_0x0b,
    exception_stub_0x0c,
    exception_stub_0x0d,
    exception_stub_0x0e,
    exception_stub_0x0f,
    exception_stub_0x10,
    exception_stub_0x11,
    exception_stub_0x12,
    exception_stub_0x13,
];

const IRQ_STUBS: [unsafe extern "C" fn(); 16] = [
    irq_stub_0x00,
    irq_stub_0x01,
    irq_stub_0x02,
    irq_stub_0x03,
    irq_stub_0x04,
    irq_stub_0x05,
    irq_stub_0x06,
    irq_stub_0x07,
    irq_stub_0x08,
    irq_stub_0x09,
    irq_stub_0x0a,
    irq_stub_0x0b,
    irq_stub_0x0c,
    irq_stub_0x0d,
    irq_stub_0x0e,
    irq_stub_0x0f,
];

/// Owns the IDT, the PIC pair and the per-vector handler table.
pub struct InterruptManager {
    self_ref: Weak<InterruptManager>,
    hardware_offset: u16,
    pic_master_command: Mutex<Port8Slow>,
    pic_master_data: Mutex<Port8Slow>,
    pic_slave_command: Mutex<Port8Slow>,
    pic_slave_data: Mutex<Port8Slow>,
    handlers: Mutex<BTreeMap<u8, Weak<dyn InterruptHandler>>>,
}

static ACTIVE_MANAGER: Mutex<Option<Arc<InterruptManager>>> = Mutex::new(None);

impl InterruptManager {
    /// Build the IDT, remap both PICs to `hardware_offset` and load the
    /// IDT register. Interrupts stay disabled until [`activate`].
    ///
    /// [`activate`]: InterruptManager::activate
    pub fn new(hardware_offset: u16) -> Arc<InterruptManager> {
        let selector = crate::gdt::kernel_code_selector();

        unsafe {
            for entry in IDT.iter_mut() {
                *entry = GateDescriptor::new(interrupt_ignore as usize as u32, selector, 0);
            }
            for (i, stub) in EXCEPTION_STUBS.iter().enumerate() {
                IDT[i] = GateDescriptor::new(*stub as usize as u32, selector, 0);
            }
            for (i, stub) in IRQ_STUBS.iter().enumerate() {
                IDT[hardware_offset as usize + i] =
                    GateDescriptor::new(*stub as usize as u32, selector, 0);
            }
            IDT[SYSCALL_VECTOR as usize] =
                GateDescriptor::new(syscall_stub_0x80 as usize as u32, selector, 0);
        }

        let manager = Arc::new_cyclic(|self_ref| InterruptManager {
            self_ref: self_ref.clone(),
            hardware_offset,
            pic_master_command: Mutex::new(Port8Slow::new(0x20)),
            pic_master_data: Mutex::new(Port8Slow::new(0x21)),
            pic_slave_command: Mutex::new(Port8Slow::new(0xA0)),
            pic_slave_data: Mutex::new(Port8Slow::new(0xA1)),
            handlers: Mutex::new(BTreeMap::new()),
        });

        manager.remap_pics();
        load_idt();

        manager
    }

    fn remap_pics(&self) {
        let mut master_command = self.pic_master_command.lock();
        let mut master_data = self.pic_master_data.lock();
        let mut slave_command = self.pic_slave_command.lock();
        let mut slave_data = self.pic_slave_data.lock();

        unsafe {
            // ICW1: begin initialization, expect ICW4.
            master_command.write(0x11);
            slave_command.write(0x11);

            // ICW2: vector offsets.
            master_data.write(self.hardware_offset as u8);
            slave_data.write(self.hardware_offset as u8 + 8);

            // ICW3: slave on line 2, slave identity 2.
            master_data.write(0x04);
            slave_data.write(0x02);

            // ICW4: 8086 mode.
            master_data.write(0x01);
            slave_data.write(0x01);

            // Unmask everything.
            master_data.write(0x00);
            slave_data.write(0x00);
        }
    }

    pub fn hardware_interrupt_offset(&self) -> u16 {
        self.hardware_offset
    }

    /// Make this manager the active one and enable interrupts. Refuses
    /// when a different manager is already active.
    pub fn activate(&self) -> bool {
        let installed = x86::without_interrupts(|| {
            let mut active = ACTIVE_MANAGER.lock();
            match active.as_ref() {
                Some(current) if !core::ptr::eq(Arc::as_ptr(current), self) => false,
                _ => {
                    *active = self.self_ref.upgrade();
                    true
                }
            }
        });
        if installed {
            x86::enable_interrupts();
        }
        installed
    }

    /// Disable interrupts and clear the active slot if it is ours.
    pub fn deactivate(&self) {
        let ours = x86::without_interrupts(|| {
            let mut active = ACTIVE_MANAGER.lock();
            match active.as_ref() {
                Some(current) if core::ptr::eq(Arc::as_ptr(current), self) => {
                    *active = None;
                    true
                }
                _ => false,
            }
        });
        if ours {
            x86::disable_interrupts();
        }
    }

    /// Route `vector` to `handler`. Replaces any previous registration.
    pub fn set_handler(&self, vector: u8, handler: &Arc<dyn InterruptHandler>) {
        x86::without_interrupts(|| {
            self.handlers.lock().insert(vector, Arc::downgrade(handler));
        });
    }

    /// Remove the registration for `vector`, but only when the slot still
    /// refers to `handler`; a replacement installed in the meantime is
    /// left alone.
    pub fn clear_handler(&self, vector: u8, handler: &Arc<dyn InterruptHandler>) {
        x86::without_interrupts(|| {
            let mut handlers = self.handlers.lock();
            if let Some(slot) = handlers.get(&vector) {
                if slot.ptr_eq(&Arc::downgrade(handler)) {
                    handlers.remove(&vector);
                }
            }
        });
    }

    fn handle_interrupt(&self, vector: u8, esp: u32) -> u32 {
        let mut esp = esp;

        let handler = self.handlers.lock().get(&vector).and_then(Weak::upgrade);
        if let Some(handler) = handler {
            esp = handler.handle_interrupt(esp);
        } else if vector as u16 != self.hardware_offset {
            println!("UNHANDLED INTERRUPT 0x{:02X}", vector);
        }

        if vector as u16 == self.hardware_offset {
            crate::drivers::timer::tick();
            esp = crate::task::schedule(esp);
        }

        let vector = vector as u16;
        if self.hardware_offset <= vector && vector < self.hardware_offset + 16 {
            unsafe {
                self.pic_master_command.lock().write(PIC_EOI);
                if self.hardware_offset + 8 <= vector {
                    self.pic_slave_command.lock().write(PIC_EOI);
                }
            }
        }

        esp
    }
}

fn load_idt() {
    let pointer = DescriptorTablePointer {
        limit: (IDT_ENTRIES * core::mem::size_of::<GateDescriptor>() - 1) as u16,
        base: unsafe { IDT.as_ptr() } as u32,
    };
    unsafe {
        asm!("lidt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
    }
}

/// Called from the assembly trampoline with the vector and the address of
/// the stacked [`CpuState`] frame; returns the frame to resume from.
///
/// [`CpuState`]: crate::task::CpuState
#[no_mangle]
extern "C" fn interrupt_dispatch(vector: u32, esp: u32) -> u32 {
    let manager = ACTIVE_MANAGER.lock().clone();
    match manager {
        Some(manager) => manager.handle_interrupt(vector as u8, esp),
        None => esp,
    }
}
