//! Kernel tasks: the saved register frame and the task object.

pub mod scheduler;

pub use scheduler::{add_task, schedule, spawn};

use alloc::boxed::Box;
use core::mem::size_of;
use core::ptr;

pub const STACK_SIZE: usize = 4096;

/// Register frame materialized by the interrupt trampoline.
///
/// The field order is the trampoline's push order reversed: the
/// general-purpose registers pushed by the common stub, the error slot
/// (CPU-supplied or a stub dummy), then the `iret` frame the CPU pushed.
/// `esp`/`ss` are only present on a privilege change and are never popped
/// by a same-privilege `iret`. This layout is binary ABI with the
/// assembly in `interrupts.rs`; neither side can change alone.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct CpuState {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub error: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Interrupts enabled plus the always-one reserved bit.
const INITIAL_EFLAGS: u32 = 0x202;

/// One kernel task: a 4 KiB stack owned inline and a pointer to the most
/// recently saved frame inside it.
pub struct Task {
    stack: [u8; STACK_SIZE],
    cpu_state: *mut CpuState,
}

unsafe impl Send for Task {}

impl Task {
    /// Build a runnable task whose first dispatch enters `entrypoint`.
    /// The initial frame sits at the top of the fresh stack with zeroed
    /// general-purpose registers.
    pub fn new(entrypoint: extern "C" fn() -> !) -> Box<Task> {
        let mut task = Box::new(Task {
            stack: [0; STACK_SIZE],
            cpu_state: ptr::null_mut(),
        });

        let frame =
            unsafe { task.stack.as_mut_ptr().add(STACK_SIZE - size_of::<CpuState>()) } as *mut CpuState;
        unsafe {
            frame.write(CpuState {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
                esi: 0,
                edi: 0,
                ebp: 0,
                error: 0,
                eip: entrypoint as usize as u32,
                cs: crate::gdt::kernel_code_selector() as u32,
                eflags: INITIAL_EFLAGS,
                esp: 0,
                ss: 0,
            });
        }
        task.cpu_state = frame;

        task
    }

    pub(crate) fn saved_frame(&self) -> *mut CpuState {
        self.cpu_state
    }

    pub(crate) fn set_saved_frame(&mut self, frame: *mut CpuState) {
        debug_assert!(self.frame_in_stack(frame));
        self.cpu_state = frame;
    }

    /// The saved-frame pointer must always lie inside the owned stack.
    fn frame_in_stack(&self, frame: *mut CpuState) -> bool {
        let start = self.stack.as_ptr() as usize;
        let frame = frame as usize;
        start <= frame && frame + size_of::<CpuState>() <= start + STACK_SIZE
    }
}
