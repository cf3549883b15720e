//! Round-robin task scheduler.
//!
//! Driven exclusively by the timer interrupt: the dispatcher hands the
//! current frame to [`schedule`], which files it with the outgoing task
//! and returns the next task's saved frame. That returned pointer becomes
//! the stack pointer the trampoline `iret`s from. There are no
//! priorities and no other suspension points.

use super::{CpuState, Task};
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

const MAX_TASKS: usize = 256;

pub struct TaskManager {
    tasks: Vec<Box<Task>>,
    current: Option<usize>,
}

impl TaskManager {
    pub const fn new() -> TaskManager {
        TaskManager {
            tasks: Vec::new(),
            current: None,
        }
    }

    /// Queue a task. Fails once the queue holds 256 tasks.
    pub fn add_task(&mut self, task: Box<Task>) -> bool {
        if self.tasks.len() >= MAX_TASKS {
            return false;
        }
        self.tasks.push(task);
        true
    }

    /// Store `cpu_state` with the task the cursor designates, advance the
    /// cursor round-robin and return the newly designated task's frame.
    /// With an empty queue the incoming frame is returned untouched.
    pub fn schedule(&mut self, cpu_state: *mut CpuState) -> *mut CpuState {
        if self.tasks.is_empty() {
            return cpu_state;
        }

        if let Some(current) = self.current {
            self.tasks[current].set_saved_frame(cpu_state);
        }

        let next = match self.current {
            Some(current) => (current + 1) % self.tasks.len(),
            None => 0,
        };
        self.current = Some(next);

        self.tasks[next].saved_frame()
    }
}

static TASK_MANAGER: Mutex<TaskManager> = Mutex::new(TaskManager::new());

/// Queue a prebuilt task.
pub fn add_task(task: Box<Task>) -> bool {
    crate::arch::x86::without_interrupts(|| TASK_MANAGER.lock().add_task(task))
}

/// Create and queue a task entering `entrypoint`.
pub fn spawn(entrypoint: extern "C" fn() -> !) -> bool {
    add_task(Task::new(entrypoint))
}

/// Timer-interrupt entry: exchange the current frame for the next one.
pub fn schedule(esp: u32) -> u32 {
    TASK_MANAGER.lock().schedule(esp as *mut CpuState) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn idle_entry() -> ! {
        crate::arch::x86::halt_loop();
    }

    #[test_case]
    fn empty_queue_returns_incoming_frame() {
        let mut manager = TaskManager::new();
        let frame = 0x1234 as *mut CpuState;
        assert_eq!(manager.schedule(frame), frame);
    }

    #[test_case]
    fn rotation_is_strict_round_robin() {
        crate::gdt::init();
        let mut manager = TaskManager::new();
        let task_a = Task::new(idle_entry);
        let task_b = Task::new(idle_entry);
        let task_c = Task::new(idle_entry);
        let frames = [
            task_a.saved_frame(),
            task_b.saved_frame(),
            task_c.saved_frame(),
        ];
        manager.add_task(task_a);
        manager.add_task(task_b);
        manager.add_task(task_c);

        // Boot context enters; each task is then visited exactly once
        // per three ticks, in order.
        let mut frame = manager.schedule(frames[2]);
        for round in 0..3 {
            for expected in frames {
                assert_eq!(frame, expected, "round {}", round);
                frame = manager.schedule(frame);
            }
        }
    }

    #[test_case]
    fn queue_is_bounded() {
        crate::gdt::init();
        let mut manager = TaskManager::new();
        for _ in 0..MAX_TASKS {
            assert!(manager.add_task(Task::new(idle_entry)));
        }
        assert!(!manager.add_task(Task::new(idle_entry)));
    }
}
