//! Lock-free consumer for one kernel-filled sample ring.
//!
//! The kernel appends variable-size records and advances `data_head`; we walk
//! from `data_tail`, copy fields out, and publish the new tail once done. The
//! data region is logically circular, so records may span the physical end.

use crate::buffer::SampleBuffer;
use crate::error::{Error, Result};
use crate::perf::{
    PERF_RECORD_LOST, PERF_RECORD_SAMPLE, PERF_RECORD_THROTTLE, PERF_RECORD_UNTHROTTLE,
    PerfEventHeader,
};
use tracing::{trace, warn};

const HEADER_SIZE: u64 = std::mem::size_of::<PerfEventHeader>() as u64;

/// Decoded body of a PERF_RECORD_SAMPLE with sample_type
/// IDENTIFIER | TID | ADDR | CPU, in kernel layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRecord {
    pub id: u64,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub cpu: u32,
}

const SAMPLE_BODY_SIZE: u64 = 32;

/// Outcome of one decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    /// A complete sample record was decoded.
    Sample(SampleRecord),
    /// A record of another kind was skipped by its declared length.
    Skipped { kind: u32 },
    /// The consumer caught up with the producer.
    Exhausted,
}

/// Single-pass reader over a sample buffer. Holds a local tail; nothing is
/// visible to the producer until [`RingBufferReader::commit`].
pub struct RingBufferReader<'a> {
    buf: &'a SampleBuffer,
    head: u64,
    tail: u64,
}

impl<'a> RingBufferReader<'a> {
    pub fn new(buf: &'a SampleBuffer) -> Self {
        RingBufferReader {
            head: buf.load_head(),
            tail: buf.load_tail(),
            buf,
        }
    }

    /// True iff undrained bytes remain. Reloads the producer head (acquire)
    /// when the local snapshot looks empty, so progress by the kernel after
    /// construction is observed.
    pub fn has_pending(&mut self) -> bool {
        if self.tail == self.head {
            self.head = self.buf.load_head();
        }
        self.tail != self.head
    }

    /// Decode the record at the tail and advance past it.
    ///
    /// A header whose declared size is smaller than the header itself or
    /// larger than the remaining head-tail distance cannot be stepped over
    /// and is reported as [`Error::Corrupted`]; the tail is left unmoved.
    pub fn next_record(&mut self) -> Result<Record> {
        if !self.has_pending() {
            return Ok(Record::Exhausted);
        }

        let header: [u8; 8] = self.read_bytes(self.tail);
        let kind = u32::from_ne_bytes(header[0..4].try_into().unwrap());
        let size = u16::from_ne_bytes(header[6..8].try_into().unwrap()) as u64;
        trace!(tail = self.tail, head = self.head, kind, size, "ring record");

        if size < HEADER_SIZE {
            return Err(Error::Corrupted(format!(
                "record declares size {size}, below the {HEADER_SIZE}-byte header"
            )));
        }
        if size > self.head - self.tail {
            return Err(Error::Corrupted(format!(
                "record declares size {size} with only {} bytes pending",
                self.head - self.tail
            )));
        }

        let record = if kind == PERF_RECORD_SAMPLE {
            if size < HEADER_SIZE + SAMPLE_BODY_SIZE {
                return Err(Error::Corrupted(format!(
                    "sample record declares size {size}, below the {} bytes of its body",
                    HEADER_SIZE + SAMPLE_BODY_SIZE
                )));
            }
            let body: [u8; 32] = self.read_bytes(self.tail + HEADER_SIZE);
            Record::Sample(SampleRecord {
                id: u64::from_ne_bytes(body[0..8].try_into().unwrap()),
                pid: u32::from_ne_bytes(body[8..12].try_into().unwrap()),
                tid: u32::from_ne_bytes(body[12..16].try_into().unwrap()),
                addr: u64::from_ne_bytes(body[16..24].try_into().unwrap()),
                cpu: u32::from_ne_bytes(body[24..28].try_into().unwrap()),
            })
        } else {
            if kind == PERF_RECORD_LOST && size >= HEADER_SIZE + 16 {
                let body: [u8; 16] = self.read_bytes(self.tail + HEADER_SIZE);
                let lost = u64::from_ne_bytes(body[8..16].try_into().unwrap());
                warn!(lost, "kernel dropped samples");
            } else if kind == PERF_RECORD_THROTTLE {
                warn!("counter throttled, samples are being rate-limited");
            } else if kind == PERF_RECORD_UNTHROTTLE {
                trace!("counter unthrottled");
            }
            Record::Skipped { kind }
        };

        self.tail += size;
        Ok(record)
    }

    /// Publish the consumed tail back to the shared cursor (release), letting
    /// the kernel reuse the space.
    pub fn commit(self) {
        self.buf.store_tail(self.tail);
    }

    /// Copy `N` bytes starting at logical position `pos`, splitting the copy
    /// when the record wraps past the physical end of the region.
    fn read_bytes<const N: usize>(&self, pos: u64) -> [u8; N] {
        let size = self.buf.data_size();
        let off = (pos % size as u64) as usize;
        let first = N.min(size - off);
        let mut out = [0u8; N];
        unsafe {
            std::ptr::copy_nonoverlapping(self.buf.data_ptr().add(off), out.as_mut_ptr(), first);
            if first < N {
                std::ptr::copy_nonoverlapping(
                    self.buf.data_ptr(),
                    out.as_mut_ptr().add(first),
                    N - first,
                );
            }
        }
        out
    }
}
