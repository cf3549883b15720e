//! Global Descriptor Table.
//!
//! Four descriptors (null, unused, kernel code, kernel data), all flat
//! over the first 64 MiB. Selector values are the byte offsets of the
//! descriptors inside the table, which is what the CPU expects in the
//! segment registers and what the IDT entries reference.

use core::arch::asm;
use core::mem::{offset_of, size_of};
use spin::Once;

const SEGMENT_LIMIT: u32 = 64 * 1024 * 1024;
const CODE_SEGMENT_TYPE: u8 = 0x9a;
const DATA_SEGMENT_TYPE: u8 = 0x92;

/// One 8-byte segment descriptor, laid out exactly as the CPU reads it.
#[repr(C, packed)]
pub struct SegmentDescriptor {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    limit_high_flags: u8,
    base_high: u8,
}

impl SegmentDescriptor {
    /// Encode `base`/`limit`/`access`. Limits above 64 KiB switch to
    /// 4 KiB granularity; a limit whose low 12 bits are not all ones is
    /// rounded down by storing `(limit >> 12) - 1`.
    pub const fn new(base: u32, limit: u32, access: u8) -> SegmentDescriptor {
        let (stored_limit, flags) = if limit > 0xFFFF {
            let stored = if limit & 0xFFF != 0xFFF {
                (limit >> 12) - 1
            } else {
                limit >> 12
            };
            (stored, 0xC0u8)
        } else {
            (limit, 0x40u8)
        };

        SegmentDescriptor {
            limit_low: (stored_limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            limit_high_flags: flags | ((stored_limit >> 16) & 0xF) as u8,
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }

    pub fn base(&self) -> u32 {
        (self.base_low as u32) | ((self.base_mid as u32) << 16) | ((self.base_high as u32) << 24)
    }

    pub fn limit(&self) -> u32 {
        let stored =
            (self.limit_low as u32) | (((self.limit_high_flags & 0xF) as u32) << 16);
        if self.limit_high_flags & 0xC0 == 0xC0 {
            (stored << 12) | 0xFFF
        } else {
            stored
        }
    }
}

#[repr(C)]
pub struct GlobalDescriptorTable {
    null: SegmentDescriptor,
    unused: SegmentDescriptor,
    code: SegmentDescriptor,
    data: SegmentDescriptor,
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

impl GlobalDescriptorTable {
    pub const fn new() -> GlobalDescriptorTable {
        GlobalDescriptorTable {
            null: SegmentDescriptor::new(0, 0, 0),
            unused: SegmentDescriptor::new(0, 0, 0),
            code: SegmentDescriptor::new(0, SEGMENT_LIMIT, CODE_SEGMENT_TYPE),
            data: SegmentDescriptor::new(0, SEGMENT_LIMIT, DATA_SEGMENT_TYPE),
        }
    }

    fn load(&'static self) {
        let pointer = DescriptorTablePointer {
            limit: (size_of::<GlobalDescriptorTable>() - 1) as u16,
            base: self as *const GlobalDescriptorTable as u32,
        };
        unsafe {
            asm!("lgdt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
        }
    }
}

static GDT: Once<GlobalDescriptorTable> = Once::new();

/// Build the table and load the descriptor-table register. The loader
/// already runs us with flat segments, so the segment registers are not
/// reloaded here.
pub fn init() {
    GDT.call_once(GlobalDescriptorTable::new).load();
}

/// Selector of the kernel code descriptor (its byte offset in the table).
pub fn kernel_code_selector() -> u16 {
    offset_of!(GlobalDescriptorTable, code) as u16
}

/// Selector of the kernel data descriptor.
pub fn kernel_data_selector() -> u16 {
    offset_of!(GlobalDescriptorTable, data) as u16
}
