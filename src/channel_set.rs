//! Multiplexer over all monitored processes: one Entry per pid, one Channel
//! per (pid, event kind), and an epoll wait across every open counter fd.

use crate::channel::{Channel, EventKind, Sample};
use crate::error::{Error, Result};
use crate::source::{CounterSource, KernelCounterSource};
use libc::pid_t;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Period used for channels bound before the caller picks one.
pub const DEFAULT_SAMPLE_PERIOD: u64 = 100_000;

const MAX_WAIT_EVENTS: usize = 64;

fn errno_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// All channels belonging to one monitored process, one per configured event
/// kind, sharing bind/unbind lifecycle.
struct Entry {
    pid: pid_t,
    channels: Vec<Channel>,
}

struct Inner {
    epoll: Epoll,
    kinds: Vec<EventKind>,
    entries: Vec<Entry>,
    period: u64,
}

enum State {
    Idle,
    Ready(Inner),
    Closed,
}

/// Owns the monitored-process Entries and the wait set.
///
/// Lifecycle: `Idle` → (`init`, exactly once) → `Ready` → (`deinit`) →
/// `Closed`. Single-threaded by contract: `remove`/`deinit` must not race an
/// in-progress `poll_samples`, and a set is never shared across threads.
pub struct ChannelSet {
    source: Arc<dyn CounterSource>,
    state: State,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::with_source(Arc::new(KernelCounterSource))
    }

    /// Construct against an alternative kernel facility (used by tests).
    pub fn with_source(source: Arc<dyn CounterSource>) -> Self {
        ChannelSet {
            source,
            state: State::Idle,
        }
    }

    fn inner_mut(&mut self) -> Result<&mut Inner> {
        match &mut self.state {
            State::Ready(inner) => Ok(inner),
            _ => Err(Error::NotInitialized),
        }
    }

    /// Allocate the wait set and fix the event-kind list for the lifetime of
    /// this instance. Runs at most once; duplicate kinds are collapsed.
    pub fn init(&mut self, kinds: &[EventKind]) -> Result<()> {
        match self.state {
            State::Idle => {}
            _ => return Err(Error::AlreadyInitialized),
        }
        if kinds.is_empty() {
            return Err(Error::InvalidArgument("no event kinds specified".into()));
        }

        let mut unique: Vec<EventKind> = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            if !unique.contains(&kind) {
                unique.push(kind);
            }
        }

        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| Error::WaitFailed(errno_io(e)))?;

        self.state = State::Ready(Inner {
            epoll,
            kinds: unique,
            entries: Vec::new(),
            period: DEFAULT_SAMPLE_PERIOD,
        });
        Ok(())
    }

    /// Unbind every channel and release the wait set. Idempotent; implied by
    /// drop. The instance cannot be re-initialized afterwards.
    pub fn deinit(&mut self) {
        self.state = State::Closed;
    }

    /// Start monitoring `pid` on every configured event kind. Success if the
    /// pid is already monitored.
    ///
    /// Policy: partial coverage is treated as worse than none, so the first
    /// bind or registration failure tears down the entire set (the error is
    /// surfaced and every other operation fails `NotInitialized` thereafter).
    pub fn add(&mut self, pid: pid_t) -> Result<()> {
        let (kinds, period) = {
            let inner = self.inner_mut()?;
            if inner.entries.iter().any(|e| e.pid == pid) {
                return Ok(());
            }
            (inner.kinds.clone(), inner.period)
        };

        let mut channels = Vec::with_capacity(kinds.len());
        for &kind in &kinds {
            let mut channel = Channel::new(Arc::clone(&self.source));
            if let Err(e) = channel.bind(pid, kind, period) {
                self.deinit();
                return Err(e);
            }
            channels.push(channel);
        }

        let mut register_err = None;
        {
            let inner = self.inner_mut()?;
            for (idx, channel) in channels.iter().enumerate() {
                let fd = channel.fd().expect("bound channel has an fd");
                let token = ((pid as u64) << 32) | idx as u64;
                let event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP, token);
                if let Err(e) = inner.epoll.add(fd, event) {
                    register_err = Some(Error::WaitFailed(errno_io(e)));
                    break;
                }
            }
            if register_err.is_none() {
                debug!(pid, channels = channels.len(), "monitoring process");
                inner.entries.push(Entry { pid, channels });
            }
        }

        match register_err {
            Some(e) => {
                self.deinit();
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Stop monitoring `pid`. Success if it was not monitored.
    pub fn remove(&mut self, pid: pid_t) -> Result<()> {
        let inner = self.inner_mut()?;
        let Some(pos) = inner.entries.iter().position(|e| e.pid == pid) else {
            return Ok(());
        };

        let entry = inner.entries.remove(pos);
        for channel in &entry.channels {
            if let Some(fd) = channel.fd() {
                // Closing the fd would drop the registration anyway
                let _ = inner.epoll.delete(fd);
            }
        }
        debug!(pid, "stopped monitoring process");
        Ok(())
    }

    /// Apply `period` to every channel of every entry. The first error is
    /// returned; channels already reconfigured keep the new period (period
    /// changes are idempotent and re-appliable). The stored set period is
    /// updated up front so later `add` calls bind at the requested rate.
    pub fn set_period(&mut self, period: u64) -> Result<()> {
        let inner = self.inner_mut()?;
        inner.period = period;
        for entry in &mut inner.entries {
            for channel in &mut entry.channels {
                channel.set_period(period)?;
            }
        }
        Ok(())
    }

    /// Wait for readiness across all open counters, then drain every ready
    /// channel, invoking `on_sample` synchronously per matched sample.
    ///
    /// Timeout convention: `None` blocks indefinitely, `Some(Duration::ZERO)`
    /// is an immediate poll, anything else waits up to that long. Returns the
    /// number of callback invocations.
    pub fn poll_samples<F>(&mut self, timeout: Option<Duration>, mut on_sample: F) -> Result<usize>
    where
        F: FnMut(&Sample),
    {
        let inner = self.inner_mut()?;

        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => EpollTimeout::try_from(d)
                .map_err(|_| Error::InvalidArgument(format!("timeout {d:?} out of range")))?,
        };

        let mut events = [EpollEvent::empty(); MAX_WAIT_EVENTS];
        let ready = inner
            .epoll
            .wait(&mut events, timeout)
            .map_err(|e| Error::WaitFailed(errno_io(e)))?;
        debug!(ready, "poll woke");

        let mut count = 0;
        for event in &events[..ready] {
            let token = event.data();
            let pid = (token >> 32) as pid_t;
            let idx = (token & 0xffff_ffff) as usize;

            let Some(entry) = inner.entries.iter_mut().find(|e| e.pid == pid) else {
                continue;
            };
            let Some(channel) = entry.channels.get_mut(idx) else {
                continue;
            };

            while let Some(sample) = channel.read_sample()? {
                on_sample(&sample);
                count += 1;
            }
        }

        Ok(count)
    }

    /// Currently monitored pids, in insertion order.
    pub fn pids(&self) -> Vec<pid_t> {
        match &self.state {
            State::Ready(inner) => inner.entries.iter().map(|e| e.pid).collect(),
            _ => Vec::new(),
        }
    }

    pub fn kinds(&self) -> &[EventKind] {
        match &self.state {
            State::Ready(inner) => &inner.kinds,
            _ => &[],
        }
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChannelSet {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockSource, push_sample};

    const POLL_NOW: Option<Duration> = Some(Duration::ZERO);

    fn ready_set(source: &Arc<MockSource>) -> ChannelSet {
        let mut set = ChannelSet::with_source(source.clone());
        set.init(&[EventKind::LlcMiss]).unwrap();
        set
    }

    #[test]
    fn init_runs_exactly_once() {
        let source = MockSource::new();
        let mut set = ChannelSet::with_source(source);
        assert!(matches!(set.add(1), Err(Error::NotInitialized)));

        set.init(&[EventKind::LlcMiss]).unwrap();
        assert!(matches!(
            set.init(&[EventKind::LlcMiss]),
            Err(Error::AlreadyInitialized)
        ));

        set.deinit();
        assert!(matches!(set.add(1), Err(Error::NotInitialized)));
        assert!(matches!(
            set.init(&[EventKind::LlcMiss]),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn init_rejects_an_empty_kind_set() {
        let source = MockSource::new();
        let mut set = ChannelSet::with_source(source);
        assert!(matches!(set.init(&[]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn init_collapses_duplicate_kinds() {
        let source = MockSource::new();
        let mut set = ChannelSet::with_source(source);
        set.init(&[
            EventKind::LlcMiss,
            EventKind::AllStores,
            EventKind::LlcMiss,
        ])
        .unwrap();
        assert_eq!(set.kinds(), &[EventKind::LlcMiss, EventKind::AllStores]);
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let source = MockSource::new();
        let mut set = ready_set(&source);

        set.add(100).unwrap();
        set.add(100).unwrap();
        set.add(200).unwrap();
        assert_eq!(set.pids(), vec![100, 200]);

        set.remove(100).unwrap();
        set.remove(100).unwrap();
        assert_eq!(set.pids(), vec![200]);

        set.remove(200).unwrap();
        assert_eq!(set.pids(), Vec::<pid_t>::new());
    }

    #[test]
    fn one_channel_per_kind_per_entry() {
        let source = MockSource::new();
        let mut set = ChannelSet::with_source(source.clone());
        set.init(&[EventKind::LlcMiss, EventKind::AllStores]).unwrap();
        set.add(100).unwrap();
        set.add(200).unwrap();
        assert_eq!(source.open_count(), 4);
    }

    #[test]
    fn bind_failure_tears_down_the_whole_set() {
        let source = MockSource::new();
        let mut set = ChannelSet::with_source(source.clone());
        set.init(&[EventKind::LlcMiss]).unwrap();
        set.add(100).unwrap();

        source.fail_next_open();
        assert!(matches!(set.add(200), Err(Error::ResourceOpenFailed(_))));

        // Conservative policy: the previously healthy entry is gone too
        assert!(matches!(set.add(300), Err(Error::NotInitialized)));
        assert!(set.pids().is_empty());
    }

    #[test]
    fn set_period_reaches_every_channel() {
        let source = MockSource::new();
        let mut set = ChannelSet::with_source(source.clone());
        set.init(&[EventKind::LlcMiss, EventKind::AllStores]).unwrap();
        set.add(100).unwrap();
        set.add(200).unwrap();

        set.set_period(4096).unwrap();
        assert_eq!(source.period_requests(), 4);

        // Unchanged period is a no-op on every channel
        set.set_period(4096).unwrap();
        assert_eq!(source.period_requests(), 4);
    }

    #[test]
    fn new_entries_bind_at_the_configured_period() {
        let source = MockSource::new();
        let mut set = ready_set(&source);
        set.set_period(8192).unwrap();
        set.add(100).unwrap();

        // Already at the set period, so no reconfiguration request
        set.set_period(8192).unwrap();
        assert_eq!(source.period_requests(), 0);
    }

    #[test]
    fn immediate_poll_on_an_idle_set_returns_zero() {
        let source = MockSource::new();
        let mut set = ready_set(&source);
        set.add(100).unwrap();
        let count = set.poll_samples(POLL_NOW, |_| {}).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn poll_delivers_matching_samples_and_counts_them() {
        let source = MockSource::new();
        let mut set = ready_set(&source);
        set.add(100).unwrap();

        let id = source.stream_id_of(0);
        let buf = source.buffer(0);
        push_sample(&buf, id, 100, 100, 0x1000, 0);
        push_sample(&buf, id, 100, 100, 0x2000, 0);
        push_sample(&buf, id, 100, 100, 0x3000, 1);
        push_sample(&buf, id + 5, 999, 999, 0xffff, 1); // foreign, never surfaced
        source.trigger(0);

        let mut addresses = Vec::new();
        let count = set
            .poll_samples(Some(Duration::from_millis(100)), |s| {
                assert_eq!(s.pid, 100);
                assert_eq!(s.kind, EventKind::LlcMiss);
                addresses.push(s.address);
            })
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(addresses, vec![0x1000, 0x2000, 0x3000]);

        // Drained: nothing more to deliver
        let count = set.poll_samples(POLL_NOW, |_| {}).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn corruption_surfaces_through_poll() {
        let source = MockSource::new();
        let mut set = ready_set(&source);
        set.add(100).unwrap();

        // Header declaring more bytes than the producer published
        let buf = source.buffer(0);
        let mut header = Vec::new();
        header.extend_from_slice(&crate::perf::PERF_RECORD_SAMPLE.to_ne_bytes());
        header.extend_from_slice(&0u16.to_ne_bytes());
        header.extend_from_slice(&512u16.to_ne_bytes());
        buf.write_at(0, &header);
        buf.store_head(40);
        source.trigger(0);

        assert!(matches!(
            set.poll_samples(Some(Duration::from_millis(100)), |_| {}),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn removed_pid_is_not_polled() {
        let source = MockSource::new();
        let mut set = ready_set(&source);
        set.add(100).unwrap();

        let id = source.stream_id_of(0);
        let buf = source.buffer(0);
        push_sample(&buf, id, 100, 100, 0x1000, 0);
        source.trigger(0);
        set.remove(100).unwrap();

        let count = set.poll_samples(POLL_NOW, |_| {}).unwrap();
        assert_eq!(count, 0);
    }
}
