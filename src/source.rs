//! Seam to the kernel performance-monitoring facility: opening a counter,
//! issuing control requests against it, and mapping its sample region.
//! Channels talk to a [`CounterSource`] so tests can substitute a mock.

use crate::buffer::SampleBuffer;
use crate::error::{Error, Result};
use crate::perf::{
    PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE, PERF_EVENT_IOC_ID, PERF_EVENT_IOC_PERIOD,
    PERF_EVENT_IOC_RESET, PerfEventAttr,
};
use libc::{SYS_perf_event_open, c_int, c_ulong, pid_t, syscall};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Control request against an open counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Enable,
    Disable,
    Reset,
    SetPeriod(u64),
}

impl ControlRequest {
    fn op(&self) -> &'static str {
        match self {
            ControlRequest::Enable => "enable",
            ControlRequest::Disable => "disable",
            ControlRequest::Reset => "reset",
            ControlRequest::SetPeriod(_) => "period",
        }
    }
}

/// Kernel performance-monitoring facility, as seen by a Channel.
pub trait CounterSource: Send + Sync {
    /// Open a counter resource scoped to `pid` with the given attributes.
    fn open(&self, pid: pid_t, attr: &PerfEventAttr) -> Result<OwnedFd>;

    /// Map the counter's shared sample region.
    fn map_buffer(&self, fd: BorrowedFd<'_>, data_pages: usize) -> Result<SampleBuffer>;

    /// Kernel-assigned stream identifier embedded in this counter's samples.
    fn stream_id(&self, fd: BorrowedFd<'_>) -> Result<u64>;

    /// Issue a control request against the open counter.
    fn control(&self, fd: BorrowedFd<'_>, req: ControlRequest) -> Result<()>;
}

/// Production implementation backed by perf_event_open/ioctl/mmap.
pub struct KernelCounterSource;

impl CounterSource for KernelCounterSource {
    fn open(&self, pid: pid_t, attr: &PerfEventAttr) -> Result<OwnedFd> {
        let fd = unsafe {
            syscall(
                SYS_perf_event_open,
                attr as *const PerfEventAttr,
                pid,
                -1 as c_int, // any CPU
                -1 as c_int, // no group
                0 as c_ulong,
            )
        };

        if fd < 0 {
            let err = std::io::Error::last_os_error();
            let err = match err.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EPERM) => std::io::Error::new(
                    err.kind(),
                    format!(
                        "{err}; cannot attach to PID {pid}, \
                         try: sudo sysctl kernel.perf_event_paranoid=1"
                    ),
                ),
                _ => err,
            };
            return Err(Error::ResourceOpenFailed(err));
        }

        Ok(unsafe { OwnedFd::from_raw_fd(fd as c_int) })
    }

    fn map_buffer(&self, fd: BorrowedFd<'_>, data_pages: usize) -> Result<SampleBuffer> {
        SampleBuffer::map(fd, data_pages)
    }

    fn stream_id(&self, fd: BorrowedFd<'_>) -> Result<u64> {
        let mut id: u64 = 0;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_ID, &mut id) };
        if ret < 0 {
            return Err(Error::ControlRequestFailed {
                op: "id",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(id)
    }

    fn control(&self, fd: BorrowedFd<'_>, req: ControlRequest) -> Result<()> {
        let ret = match req {
            ControlRequest::Enable => unsafe {
                libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE, 0)
            },
            ControlRequest::Disable => unsafe {
                libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_DISABLE, 0)
            },
            ControlRequest::Reset => unsafe { libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_RESET, 0) },
            ControlRequest::SetPeriod(period) => unsafe {
                libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_PERIOD, &period)
            },
        };

        if ret < 0 {
            return Err(Error::ControlRequestFailed {
                op: req.op(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}
