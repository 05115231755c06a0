//! Raw perf_event ABI: attribute struct, mmap control page, record headers
//! and the ioctl request numbers used for counter control.

// perf_event constants (from linux/perf_event.h)
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;

// Record types
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_SAMPLE: u32 = 9;

// ioctl requests ('$' magic, see linux/perf_event.h)
pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
pub const PERF_EVENT_IOC_PERIOD: libc::c_ulong = 0x4008_2404;
pub const PERF_EVENT_IOC_ID: libc::c_ulong = 0x8008_2407;

/// perf_event_attr structure
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl PerfEventAttr {
    // Flag bit positions
    const DISABLED_BIT: u64 = 1 << 0;
    const EXCLUDE_KERNEL_BIT: u64 = 1 << 5;
    const EXCLUDE_HV_BIT: u64 = 1 << 6;
    // precise_ip is a two-bit field at bits 15..17
    const PRECISE_IP_SHIFT: u64 = 15;
    const PRECISE_IP_MASK: u64 = 0b11 << Self::PRECISE_IP_SHIFT;

    pub fn new() -> Self {
        PerfEventAttr {
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            ..Default::default()
        }
    }

    pub fn set_disabled(&mut self, val: bool) {
        if val {
            self.flags |= Self::DISABLED_BIT;
        } else {
            self.flags &= !Self::DISABLED_BIT;
        }
    }

    pub fn set_exclude_kernel(&mut self, val: bool) {
        if val {
            self.flags |= Self::EXCLUDE_KERNEL_BIT;
        } else {
            self.flags &= !Self::EXCLUDE_KERNEL_BIT;
        }
    }

    pub fn set_exclude_hv(&mut self, val: bool) {
        if val {
            self.flags |= Self::EXCLUDE_HV_BIT;
        } else {
            self.flags &= !Self::EXCLUDE_HV_BIT;
        }
    }

    /// Precise-sampling level (0..=3). Non-zero enables PEBS so that the
    /// faulting data address is attributed to the triggering instruction.
    pub fn set_precise_ip(&mut self, level: u64) {
        self.flags = (self.flags & !Self::PRECISE_IP_MASK)
            | ((level << Self::PRECISE_IP_SHIFT) & Self::PRECISE_IP_MASK);
    }

    pub fn precise_ip(&self) -> u64 {
        (self.flags & Self::PRECISE_IP_MASK) >> Self::PRECISE_IP_SHIFT
    }
}

/// perf_event_mmap_page header structure
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// perf_event_header for records in the ring buffer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}
