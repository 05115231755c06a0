//! One bound (process, hardware event) pair: the open counter, its mapped
//! sample buffer, and single-sample retrieval with stream filtering.

use crate::buffer::SampleBuffer;
use crate::error::{Error, Result};
use crate::perf::{
    PERF_SAMPLE_ADDR, PERF_SAMPLE_CPU, PERF_SAMPLE_IDENTIFIER, PERF_SAMPLE_TID, PERF_TYPE_RAW,
    PerfEventAttr,
};
use crate::ring::{Record, RingBufferReader};
use crate::source::{ControlRequest, CounterSource};
use libc::pid_t;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use tracing::debug;

/// Report readiness after a single buffered record, to bound latency.
const WAKEUP_EVENTS: u32 = 1;
/// Precise-sampling level requesting an exact data address (PEBS).
const PRECISE_IP: u64 = 3;
/// Data pages per channel ring buffer.
pub const RING_BUFFER_PAGES: usize = 4;

/// Raw PEBS-capable event selectors, umask in the high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// MEM_LOAD_L3_MISS_RETIRED.LOCAL_DRAM
    LlcMiss,
    /// MEM_INST_RETIRED.ALL_LOADS
    AllLoads,
    /// MEM_INST_RETIRED.ALL_STORES
    AllStores,
}

impl EventKind {
    pub fn raw_config(self) -> u64 {
        match self {
            EventKind::LlcMiss => 0x01d3,
            EventKind::AllLoads => 0x81d0,
            EventKind::AllStores => 0x82d0,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::LlcMiss => "llc-miss",
            EventKind::AllLoads => "all-loads",
            EventKind::AllStores => "all-stores",
        };
        f.write_str(name)
    }
}

/// One decoded hardware-event observation. Plain value, copied out of the
/// ring buffer before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub kind: EventKind,
    pub cpu: u32,
    pub pid: u32,
    pub tid: u32,
    pub address: u64,
}

// Declaration order matters: the mapping is released before the fd.
struct BoundState {
    pid: pid_t,
    kind: EventKind,
    stream_id: u64,
    period: u64,
    buf: SampleBuffer,
    fd: OwnedFd,
}

/// A channel is either fully unbound or fully bound; no partial state is
/// representable.
pub struct Channel {
    source: Arc<dyn CounterSource>,
    bound: Option<BoundState>,
}

impl Channel {
    pub fn new(source: Arc<dyn CounterSource>) -> Self {
        Channel {
            source,
            bound: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn pid(&self) -> Option<pid_t> {
        self.bound.as_ref().map(|b| b.pid)
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.bound.as_ref().map(|b| b.kind)
    }

    pub fn stream_id(&self) -> Option<u64> {
        self.bound.as_ref().map(|b| b.stream_id)
    }

    /// The open counter fd, for wait-set registration.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.bound.as_ref().map(|b| b.fd.as_fd())
    }

    /// Acquire the counter, mapping, and stream identifier for `(pid, kind)`
    /// at the given sampling period, all-or-nothing. On any failure the
    /// already-acquired pieces are released before returning (they are plain
    /// locals dropped on the error path) and the channel stays unbound.
    pub fn bind(&mut self, pid: pid_t, kind: EventKind, period: u64) -> Result<()> {
        if self.bound.is_some() {
            return Err(Error::AlreadyBound);
        }

        let mut attr = PerfEventAttr::new();
        attr.type_ = PERF_TYPE_RAW;
        attr.config = kind.raw_config();
        attr.sample_period_or_freq = period;
        attr.sample_type =
            PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_TID | PERF_SAMPLE_ADDR | PERF_SAMPLE_CPU;
        attr.set_disabled(true);
        attr.set_exclude_kernel(true);
        attr.set_precise_ip(PRECISE_IP);
        attr.wakeup_events_or_watermark = WAKEUP_EVENTS;

        let fd = self.source.open(pid, &attr)?;
        let buf = self.source.map_buffer(fd.as_fd(), RING_BUFFER_PAGES)?;
        let stream_id = self.source.stream_id(fd.as_fd())?;
        self.source.control(fd.as_fd(), ControlRequest::Reset)?;
        self.source.control(fd.as_fd(), ControlRequest::Enable)?;

        debug!(pid, %kind, stream_id, period, "channel bound");
        self.bound = Some(BoundState {
            pid,
            kind,
            stream_id,
            period,
            buf,
            fd,
        });
        Ok(())
    }

    /// Release the mapping and the counter. Idempotent.
    pub fn unbind(&mut self) {
        if let Some(b) = self.bound.take() {
            // Best effort: the fd is closed right after regardless
            let _ = self.source.control(b.fd.as_fd(), ControlRequest::Disable);
            debug!(pid = b.pid, kind = %b.kind, "channel unbound");
        }
    }

    /// Reconfigure the sampling period on the live counter. No control
    /// request is issued when the period is unchanged.
    pub fn set_period(&mut self, period: u64) -> Result<()> {
        let b = self.bound.as_mut().ok_or(Error::NotBound)?;
        if b.period == period {
            return Ok(());
        }
        self.source
            .control(b.fd.as_fd(), ControlRequest::SetPeriod(period))?;
        b.period = period;
        Ok(())
    }

    /// Drain the ring until a record matching this channel's stream id and
    /// pid is found. Returns `Ok(None)` when the buffer is exhausted without
    /// a match ("try later", not an error); foreign records are skipped
    /// without being surfaced. The consumed tail is published either way.
    pub fn read_sample(&mut self) -> Result<Option<Sample>> {
        let b = self.bound.as_ref().ok_or(Error::NotBound)?;

        let mut reader = RingBufferReader::new(&b.buf);
        let mut found = None;
        while found.is_none() {
            match reader.next_record()? {
                Record::Sample(rec) if rec.id == b.stream_id && rec.pid == b.pid as u32 => {
                    found = Some(Sample {
                        kind: b.kind,
                        cpu: rec.cpu,
                        pid: rec.pid,
                        tid: rec.tid,
                        address: rec.addr,
                    });
                }
                Record::Sample(_) | Record::Skipped { .. } => continue,
                Record::Exhausted => break,
            }
        }
        reader.commit();
        Ok(found)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.unbind();
    }
}
