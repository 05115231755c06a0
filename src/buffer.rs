//! The shared sample region backing one channel: a control page followed by a
//! power-of-two number of data pages. The kernel produces records into the
//! data region and publishes `data_head`; we consume and publish `data_tail`.
//!
//! The region is mutated by the kernel concurrently with our reads, so no
//! references into it may be held across operations. All cursor access goes
//! through atomic views of the control page and all record bytes are copied
//! out (see `ring`).

use crate::error::{Error, Result};
use crate::perf::PerfEventMmapPage;
use memmap2::{MmapOptions, MmapRaw};
use std::alloc::{self, Layout};
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const HEAD_OFFSET: usize = std::mem::offset_of!(PerfEventMmapPage, data_head);
const TAIL_OFFSET: usize = std::mem::offset_of!(PerfEventMmapPage, data_tail);

/// Mapped (or, in tests, heap-backed) perf sample buffer.
pub struct SampleBuffer {
    backing: Backing,
    data_offset: usize,
    data_size: usize,
}

enum Backing {
    Mapped(MmapRaw),
    Owned(Arc<OwnedRegion>),
}

/// Page-aligned anonymous region standing in for a kernel mapping, used to
/// build synthetic ring buffers.
struct OwnedRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is a plain byte buffer; all cursor access is atomic and
// record bytes are copied out under the acquire/release protocol.
unsafe impl Send for OwnedRegion {}
unsafe impl Sync for OwnedRegion {}

impl Drop for OwnedRegion {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the mmap pointer is only dereferenced through the single-consumer
// cursor protocol; the buffer is owned by exactly one Channel.
unsafe impl Send for SampleBuffer {}

impl SampleBuffer {
    /// Map the shared region of an open perf fd: one control page plus
    /// `data_pages` data pages. `data_pages` must be a power of two.
    pub fn map(fd: BorrowedFd<'_>, data_pages: usize) -> Result<Self> {
        if data_pages == 0 || !data_pages.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "data_pages must be a power of two, got {data_pages}"
            )));
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let map = MmapOptions::new()
            .len((1 + data_pages) * page_size)
            .map_raw(fd.as_raw_fd())
            .map_err(Error::MappingFailed)?;

        Ok(SampleBuffer {
            backing: Backing::Mapped(map),
            data_offset: page_size,
            data_size: data_pages * page_size,
        })
    }

    /// Heap-backed buffer with the same layout as a kernel mapping. Used to
    /// construct synthetic record streams in tests and mocks.
    pub fn in_memory(data_pages: usize) -> Self {
        let page_size = 4096;
        let len = (1 + data_pages) * page_size;
        let layout = Layout::from_size_align(len, page_size).expect("valid buffer layout");
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));

        SampleBuffer {
            backing: Backing::Owned(Arc::new(OwnedRegion { ptr, layout })),
            data_offset: page_size,
            data_size: data_pages * page_size,
        }
    }

    /// Second handle onto an in-memory buffer, so a producer can append
    /// records while a Channel owns the consumer side. Mapped buffers have a
    /// single owner and cannot be shared.
    pub fn share(&self) -> Option<SampleBuffer> {
        match &self.backing {
            Backing::Mapped(_) => None,
            Backing::Owned(region) => Some(SampleBuffer {
                backing: Backing::Owned(Arc::clone(region)),
                data_offset: self.data_offset,
                data_size: self.data_size,
            }),
        }
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    fn base(&self) -> *mut u8 {
        match &self.backing {
            Backing::Mapped(map) => map.as_mut_ptr(),
            Backing::Owned(region) => region.ptr.as_ptr(),
        }
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base().add(self.data_offset) }
    }

    fn cursor(&self, offset: usize) -> &AtomicU64 {
        // The control page outlives all uses of the returned reference and
        // the cursor words are 8-byte aligned per the kernel ABI.
        unsafe { AtomicU64::from_ptr(self.base().add(offset) as *mut u64) }
    }

    /// Producer-published head, acquire-ordered so record bytes written
    /// before the head update are visible.
    pub(crate) fn load_head(&self) -> u64 {
        self.cursor(HEAD_OFFSET).load(Ordering::Acquire)
    }

    pub(crate) fn load_tail(&self) -> u64 {
        self.cursor(TAIL_OFFSET).load(Ordering::Relaxed)
    }

    /// Publish the consumer tail, release-ordered so the kernel may reuse the
    /// space only after our reads complete.
    pub(crate) fn store_tail(&self, tail: u64) {
        self.cursor(TAIL_OFFSET).store(tail, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn store_head(&self, head: u64) {
        self.cursor(HEAD_OFFSET).store(head, Ordering::Release);
    }

    /// Wrap-aware raw write into the data region, for synthetic producers.
    #[cfg(test)]
    pub(crate) fn write_at(&self, pos: u64, bytes: &[u8]) {
        let off = (pos % self.data_size as u64) as usize;
        let first = bytes.len().min(self.data_size - off);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr().add(off), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    self.data_ptr(),
                    bytes.len() - first,
                );
            }
        }
    }
}
