//! Mock kernel facility and synthetic record producers shared by the unit
//! tests. Counter fds are pipe read ends so epoll readiness can be driven by
//! writing a byte; sample buffers are in-memory regions the tests append
//! records to.

use crate::buffer::SampleBuffer;
use crate::error::{Error, Result};
use crate::perf::{PERF_RECORD_SAMPLE, PerfEventAttr};
use crate::source::{ControlRequest, CounterSource};
use libc::pid_t;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

pub(crate) struct MockSource {
    inner: Mutex<MockInner>,
}

#[derive(Default)]
struct MockInner {
    channels: Vec<MockChannel>,
    control_log: Vec<(RawFd, ControlRequest)>,
    next_stream_id: u64,
    opens: usize,
    fail_open_at: Option<usize>,
    fail_stream_id: bool,
}

struct MockChannel {
    #[allow(dead_code)]
    pid: pid_t,
    #[allow(dead_code)]
    config: u64,
    raw: RawFd,
    trigger: OwnedFd,
    buf: Option<SampleBuffer>,
    stream_id: Option<u64>,
}

impl MockSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockSource {
            inner: Mutex::new(MockInner {
                next_stream_id: 1,
                ..Default::default()
            }),
        })
    }

    /// Fail the next `open` call with EACCES.
    pub(crate) fn fail_next_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_open_at = Some(inner.opens);
    }

    pub(crate) fn fail_stream_id(&self, fail: bool) {
        self.inner.lock().unwrap().fail_stream_id = fail;
    }

    /// Shared handle onto the `idx`-th opened channel's sample buffer.
    pub(crate) fn buffer(&self, idx: usize) -> SampleBuffer {
        let inner = self.inner.lock().unwrap();
        inner.channels[idx]
            .buf
            .as_ref()
            .expect("channel has a mapped buffer")
            .share()
            .expect("in-memory buffers are shareable")
    }

    pub(crate) fn stream_id_of(&self, idx: usize) -> u64 {
        self.inner.lock().unwrap().channels[idx]
            .stream_id
            .expect("stream id was queried")
    }

    /// Make the `idx`-th channel's fd readable.
    pub(crate) fn trigger(&self, idx: usize) {
        let inner = self.inner.lock().unwrap();
        nix::unistd::write(&inner.channels[idx].trigger, &[1u8]).expect("pipe write");
    }

    pub(crate) fn open_count(&self) -> usize {
        self.inner.lock().unwrap().opens
    }

    pub(crate) fn period_requests(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .control_log
            .iter()
            .filter(|(_, req)| matches!(req, ControlRequest::SetPeriod(_)))
            .count()
    }
}

impl CounterSource for MockSource {
    fn open(&self, pid: pid_t, attr: &PerfEventAttr) -> Result<OwnedFd> {
        let mut inner = self.inner.lock().unwrap();
        let turn = inner.opens;
        inner.opens += 1;
        if inner.fail_open_at == Some(turn) {
            inner.fail_open_at = None;
            return Err(Error::ResourceOpenFailed(
                std::io::Error::from_raw_os_error(libc::EACCES),
            ));
        }

        let (read, write) = nix::unistd::pipe().expect("pipe");
        inner.channels.push(MockChannel {
            pid,
            config: attr.config,
            raw: read.as_raw_fd(),
            trigger: write,
            buf: None,
            stream_id: None,
        });
        Ok(read)
    }

    fn map_buffer(&self, fd: BorrowedFd<'_>, data_pages: usize) -> Result<SampleBuffer> {
        let buf = SampleBuffer::in_memory(data_pages);
        let shared = buf.share().expect("in-memory buffers are shareable");
        let mut inner = self.inner.lock().unwrap();
        let channel = inner
            .channels
            .iter_mut()
            .find(|c| c.raw == fd.as_raw_fd())
            .expect("map_buffer on an opened fd");
        channel.buf = Some(shared);
        Ok(buf)
    }

    fn stream_id(&self, fd: BorrowedFd<'_>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_stream_id {
            return Err(Error::ControlRequestFailed {
                op: "id",
                source: std::io::Error::from_raw_os_error(libc::ENOTTY),
            });
        }
        let id = inner.next_stream_id;
        inner.next_stream_id += 1;
        let channel = inner
            .channels
            .iter_mut()
            .find(|c| c.raw == fd.as_raw_fd())
            .expect("stream_id on an opened fd");
        channel.stream_id = Some(id);
        Ok(id)
    }

    fn control(&self, fd: BorrowedFd<'_>, req: ControlRequest) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .control_log
            .push((fd.as_raw_fd(), req));
        Ok(())
    }
}

/// Append one record (header + body) at the producer head and publish it.
pub(crate) fn push_raw(buf: &SampleBuffer, kind: u32, body: &[u8]) {
    let size = (8 + body.len()) as u16;
    let head = buf.load_head();

    let mut record = Vec::with_capacity(size as usize);
    record.extend_from_slice(&kind.to_ne_bytes());
    record.extend_from_slice(&0u16.to_ne_bytes()); // misc
    record.extend_from_slice(&size.to_ne_bytes());
    record.extend_from_slice(body);

    buf.write_at(head, &record);
    buf.store_head(head + size as u64);
}

/// Append a PERF_RECORD_SAMPLE with the IDENTIFIER | TID | ADDR | CPU body.
pub(crate) fn push_sample(buf: &SampleBuffer, id: u64, pid: u32, tid: u32, addr: u64, cpu: u32) {
    let mut body = Vec::with_capacity(32);
    body.extend_from_slice(&id.to_ne_bytes());
    body.extend_from_slice(&pid.to_ne_bytes());
    body.extend_from_slice(&tid.to_ne_bytes());
    body.extend_from_slice(&addr.to_ne_bytes());
    body.extend_from_slice(&cpu.to_ne_bytes());
    body.extend_from_slice(&0u32.to_ne_bytes()); // res
    push_raw(buf, PERF_RECORD_SAMPLE, &body);
}
