//! Descriptor table over a readiness backend.
//!
//! Interest changes are recorded per descriptor and pushed to the OS in one
//! [`Multiplexer::commit`] per loop iteration. Poll results are dispatched
//! only for descriptors that are still [`FdState::Ready`] at that moment.

#[cfg(target_os = "linux")]
pub mod epoll;

use std::{
    fmt, io, mem,
    ops::{BitAnd, BitOr, BitOrAssign},
    os::fd::RawFd,
    time::{Duration, Instant},
};

use crate::{
    error::MuxError,
    session::{SessionId, Side},
};

type EventsBitframe = u32;

/// Readiness / interest bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Events(EventsBitframe);

impl Events {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    /// Only ever reported, never requested.
    pub const ERROR: Self = Self(1 << 2);
    /// Only ever reported, never requested.
    pub const HUP: Self = Self(1 << 3);

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Events {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.intersects(Self::READ) {
            parts.push("R");
        }
        if self.intersects(Self::WRITE) {
            parts.push("W");
        }
        if self.intersects(Self::ERROR) {
            parts.push("E");
        }
        if self.intersects(Self::HUP) {
            parts.push("H");
        }
        write!(f, "Events({})", parts.join("|"))
    }
}

/// What a ready descriptor is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    /// Listening socket of the policy at this index.
    Accept(usize),
    /// One side of a session.
    Relay(SessionId, Side),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FdState {
    #[default]
    Closed,
    Ready,
    /// Registered but temporarily excluded from dispatch and commit.
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct FdItem {
    /// Interest to apply on the next commit.
    pub events: Events,
    /// Interest last committed to the OS.
    pub applied: Events,
    pub state: FdState,
    pub callback: Option<Callback>,
    pub pending_update: bool,
    pub pending_retry: bool,
    pub retry_since: Option<Instant>,
}

/// OS operation needed to move a descriptor from `applied` to `events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlOp {
    Add,
    Modify,
    Delete,
}

impl CtlOp {
    pub fn between(applied: Events, events: Events) -> Option<Self> {
        if applied == events {
            None
        } else if applied.is_empty() {
            Some(Self::Add)
        } else if events.is_empty() {
            Some(Self::Delete)
        } else {
            Some(Self::Modify)
        }
    }
}

/// Readiness backend. Implemented by epoll in production and by scripted
/// fakes in tests.
pub trait Poller {
    fn add(&mut self, fd: RawFd, events: Events) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, events: Events) -> io::Result<()>;
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;
    /// Replaces `ready` with the descriptors that became ready, blocking at
    /// most `timeout` (`None` blocks indefinitely).
    fn wait(&mut self, ready: &mut Vec<(RawFd, Events)>, timeout: Option<Duration>)
        -> io::Result<()>;
}

/// A descriptor selected for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub fd: RawFd,
    pub callback: Callback,
    /// Reported bits.
    pub ready: Events,
    /// Interest at dispatch time.
    pub interest: Events,
}

/// A commit that the OS refused.
#[derive(Debug)]
pub struct CommitFailure {
    pub fd: RawFd,
    pub callback: Option<Callback>,
    pub error: MuxError,
}

pub struct Multiplexer<P> {
    poller: P,
    items: Vec<FdItem>,
    ready: Vec<(RawFd, Events)>,
    updates: Vec<RawFd>,
    retries: Vec<RawFd>,
    flushing: Vec<RawFd>,
}

impl<P: Poller> Multiplexer<P> {
    pub fn new(poller: P, max_fds: usize) -> Self {
        Self {
            poller,
            items: vec![FdItem::default(); max_fds],
            ready: Vec::new(),
            updates: Vec::with_capacity(max_fds.min(4096)),
            retries: Vec::with_capacity(max_fds),
            flushing: Vec::with_capacity(max_fds),
        }
    }

    pub fn max_fds(&self) -> usize {
        self.items.len()
    }

    pub fn poller(&self) -> &P {
        &self.poller
    }

    pub fn poller_mut(&mut self) -> &mut P {
        &mut self.poller
    }

    fn slot(&self, fd: RawFd) -> Result<usize, MuxError> {
        usize::try_from(fd)
            .ok()
            .filter(|&i| i < self.items.len())
            .ok_or(MuxError::FdOutOfRange {
                fd,
                max: self.items.len(),
            })
    }

    pub fn item(&self, fd: RawFd) -> Option<&FdItem> {
        self.slot(fd).ok().map(|i| &self.items[i])
    }

    pub fn state(&self, fd: RawFd) -> FdState {
        self.item(fd).map(|item| item.state).unwrap_or_default()
    }

    /// Opens `fd` for dispatch to `callback` with `events` as its interest.
    /// Nothing reaches the OS before the next commit.
    pub fn register(
        &mut self,
        fd: RawFd,
        events: Events,
        callback: Callback,
    ) -> Result<(), MuxError> {
        let i = self.slot(fd)?;
        let item = &mut self.items[i];
        item.state = FdState::Ready;
        item.callback = Some(callback);
        self.set_events(fd, events)
    }

    pub fn set_events(&mut self, fd: RawFd, events: Events) -> Result<(), MuxError> {
        let i = self.slot(fd)?;
        let item = &mut self.items[i];
        if item.state == FdState::Closed {
            return Err(MuxError::NotRegistered(fd));
        }
        item.events = events & (Events::READ | Events::WRITE);
        if item.events != item.applied && !item.pending_update {
            item.pending_update = true;
            self.updates.push(fd);
        }
        Ok(())
    }

    /// Excludes `fd` from dispatch and commit until it is removed.
    pub fn stop(&mut self, fd: RawFd) {
        if let Ok(i) = self.slot(fd) {
            if self.items[i].state == FdState::Ready {
                self.items[i].state = FdState::Stopped;
            }
        }
    }

    /// Drops `fd` from the OS set (if anything was applied) and zeroes its
    /// item. The socket itself is left for the caller to close.
    pub fn remove(&mut self, fd: RawFd) -> Result<(), MuxError> {
        let i = self.slot(fd)?;
        let applied = self.items[i].applied;
        self.items[i] = FdItem::default();
        if !applied.is_empty() {
            self.poller
                .delete(fd)
                .map_err(|source| MuxError::Os { fd, source })?;
        }
        Ok(())
    }

    /// Pushes every pending interest change to the OS.
    pub fn commit(&mut self) -> Vec<CommitFailure> {
        let mut failures = Vec::new();
        let updates = mem::take(&mut self.updates);
        for fd in updates {
            let Ok(i) = self.slot(fd) else { continue };
            let item = &mut self.items[i];
            if !item.pending_update {
                continue;
            }
            match item.state {
                FdState::Closed => {
                    item.pending_update = false;
                    continue;
                }
                FdState::Stopped => {
                    self.updates.push(fd);
                    continue;
                }
                FdState::Ready => {}
            }
            item.pending_update = false;
            let events = item.events;
            let result = match CtlOp::between(item.applied, events) {
                None => continue,
                Some(CtlOp::Add) => self.poller.add(fd, events),
                Some(CtlOp::Modify) => self.poller.modify(fd, events),
                Some(CtlOp::Delete) => self.poller.delete(fd),
            };
            let item = &mut self.items[i];
            match result {
                Ok(()) => item.applied = events,
                Err(source) => failures.push(CommitFailure {
                    fd,
                    callback: item.callback,
                    error: MuxError::Os { fd, source },
                }),
            }
        }
        failures
    }

    /// Descriptors with uncommitted interest changes.
    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    /// Waits for readiness. Returns how many entries [`Self::dispatchable`]
    /// can be asked about.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poller.wait(&mut self.ready, timeout) {
            Ok(()) => Ok(self.ready.len()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                self.ready.clear();
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    /// The `n`th polled descriptor, if it is still open for dispatch.
    /// Checked lazily so that a descriptor stopped by an earlier dispatch in
    /// the same batch is skipped.
    pub fn dispatchable(&self, n: usize) -> Option<Dispatch> {
        let &(fd, ready) = self.ready.get(n)?;
        let item = self.item(fd)?;
        if item.state != FdState::Ready {
            return None;
        }
        Some(Dispatch {
            fd,
            callback: item.callback?,
            ready,
            interest: item.events,
        })
    }

    /// Queues `fd` for a retry dispatch on the next flush.
    pub fn schedule_retry(&mut self, fd: RawFd, since: Instant) -> Result<(), MuxError> {
        let i = self.slot(fd)?;
        let item = &mut self.items[i];
        if item.state == FdState::Closed {
            return Err(MuxError::NotRegistered(fd));
        }
        item.retry_since = Some(since);
        if !item.pending_retry {
            item.pending_retry = true;
            self.retries.push(fd);
        }
        Ok(())
    }

    pub fn has_retries(&self) -> bool {
        !self.retries.is_empty()
    }

    /// Swaps the retry lists; retries scheduled from here on belong to the
    /// next flush.
    pub fn begin_retry_flush(&mut self) {
        debug_assert!(self.flushing.is_empty());
        mem::swap(&mut self.retries, &mut self.flushing);
        self.flushing.reverse();
    }

    /// Next retry of the current flush that is due at `now`.
    pub fn next_retry(&mut self, now: Instant) -> Option<Dispatch> {
        while let Some(fd) = self.flushing.pop() {
            let Ok(i) = self.slot(fd) else { continue };
            let item = &mut self.items[i];
            if !item.pending_retry {
                continue;
            }
            if item.retry_since.is_some_and(|since| since > now) {
                self.retries.push(fd);
                continue;
            }
            item.pending_retry = false;
            item.retry_since = None;
            if item.state != FdState::Ready {
                continue;
            }
            let Some(callback) = item.callback else { continue };
            return Some(Dispatch {
                fd,
                callback,
                ready: item.events,
                interest: item.events,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::pool::SessionPool;

    #[derive(Default)]
    struct RecordingPoller {
        ops: Vec<(CtlOp, RawFd, Events)>,
        registered: HashMap<RawFd, Events>,
        next_ready: Vec<(RawFd, Events)>,
        fail: Option<RawFd>,
    }

    impl Poller for RecordingPoller {
        fn add(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
            if self.fail == Some(fd) {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            assert!(self.registered.insert(fd, events).is_none(), "double add");
            self.ops.push((CtlOp::Add, fd, events));
            Ok(())
        }

        fn modify(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
            assert!(self.registered.insert(fd, events).is_some(), "modify unknown");
            self.ops.push((CtlOp::Modify, fd, events));
            Ok(())
        }

        fn delete(&mut self, fd: RawFd) -> io::Result<()> {
            assert!(self.registered.remove(&fd).is_some(), "delete unknown");
            self.ops.push((CtlOp::Delete, fd, Events::NONE));
            Ok(())
        }

        fn wait(
            &mut self,
            ready: &mut Vec<(RawFd, Events)>,
            _timeout: Option<Duration>,
        ) -> io::Result<()> {
            ready.clear();
            ready.append(&mut self.next_ready);
            Ok(())
        }
    }

    fn mux() -> Multiplexer<RecordingPoller> {
        Multiplexer::new(RecordingPoller::default(), 16)
    }

    fn relay() -> Callback {
        let mut pool = SessionPool::with_capacity(1);
        Callback::Relay(pool.insert(()).unwrap(), Side::Client)
    }

    #[test]
    fn register_does_not_touch_the_os_until_commit() {
        let mut mux = mux();
        mux.register(3, Events::READ, Callback::Accept(0)).unwrap();
        assert!(mux.poller().ops.is_empty());
        assert!(mux.commit().is_empty());
        assert_eq!(mux.poller().ops, vec![(CtlOp::Add, 3, Events::READ)]);
        assert_eq!(mux.item(3).unwrap().applied, Events::READ);
    }

    #[test]
    fn commit_picks_add_modify_delete() {
        let mut mux = mux();
        mux.register(4, Events::READ, relay()).unwrap();
        mux.commit();
        mux.set_events(4, Events::READ | Events::WRITE).unwrap();
        mux.commit();
        mux.set_events(4, Events::NONE).unwrap();
        mux.commit();
        mux.set_events(4, Events::READ).unwrap();
        mux.commit();
        let ops: Vec<CtlOp> = mux.poller().ops.iter().map(|op| op.0).collect();
        assert_eq!(
            ops,
            vec![CtlOp::Add, CtlOp::Modify, CtlOp::Delete, CtlOp::Add]
        );
    }

    #[test]
    fn unchanged_interest_is_not_committed() {
        let mut mux = mux();
        mux.register(4, Events::READ, relay()).unwrap();
        mux.commit();
        mux.set_events(4, Events::READ | Events::WRITE).unwrap();
        mux.set_events(4, Events::READ).unwrap();
        mux.commit();
        assert_eq!(mux.poller().ops.len(), 1);
    }

    #[test]
    fn out_of_range_descriptors_are_rejected() {
        let mut mux = mux();
        assert!(matches!(
            mux.register(16, Events::READ, relay()),
            Err(MuxError::FdOutOfRange { fd: 16, max: 16 })
        ));
        assert!(mux.register(-1, Events::READ, relay()).is_err());
        assert!(matches!(
            mux.set_events(2, Events::READ),
            Err(MuxError::NotRegistered(2))
        ));
        assert!(mux.commit().is_empty());
        assert!(mux.poller().ops.is_empty());
    }

    #[test]
    fn stopped_descriptors_stay_pending() {
        let mut mux = mux();
        mux.register(5, Events::READ, relay()).unwrap();
        mux.stop(5);
        mux.commit();
        assert!(mux.poller().ops.is_empty());
        assert_eq!(mux.pending_updates(), 1);

        mux.remove(5).unwrap();
        mux.commit();
        assert_eq!(mux.pending_updates(), 0);
        assert_eq!(mux.state(5), FdState::Closed);
    }

    #[test]
    fn failed_commit_is_reported_and_leaves_applied_alone() {
        let mut mux = mux();
        mux.poller_mut().fail = Some(6);
        mux.register(6, Events::READ, Callback::Accept(1)).unwrap();
        let failures = mux.commit();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].fd, 6);
        assert_eq!(failures[0].callback, Some(Callback::Accept(1)));
        assert!(mux.item(6).unwrap().applied.is_empty());
    }

    #[test]
    fn dispatch_skips_descriptors_stopped_in_the_same_batch() {
        let mut mux = mux();
        mux.register(7, Events::READ, relay()).unwrap();
        mux.register(8, Events::READ, relay()).unwrap();
        mux.commit();
        mux.poller_mut().next_ready = vec![(7, Events::READ), (8, Events::READ), (9, Events::READ)];
        assert_eq!(mux.poll(None).unwrap(), 3);

        assert_eq!(mux.dispatchable(0).unwrap().fd, 7);
        mux.stop(8);
        assert!(mux.dispatchable(1).is_none());
        // never registered
        assert!(mux.dispatchable(2).is_none());
    }

    #[test]
    fn remove_deletes_only_applied_interest() {
        let mut mux = mux();
        mux.register(3, Events::READ, relay()).unwrap();
        mux.remove(3).unwrap();
        mux.register(4, Events::READ, relay()).unwrap();
        mux.commit();
        mux.remove(4).unwrap();
        assert_eq!(
            mux.poller().ops,
            vec![(CtlOp::Add, 4, Events::READ), (CtlOp::Delete, 4, Events::NONE)]
        );
        assert!(mux.poller().registered.is_empty());
    }

    #[test]
    fn retries_scheduled_during_a_flush_wait_for_the_next_one() {
        let mut mux = mux();
        let now = Instant::now();
        mux.register(3, Events::READ, relay()).unwrap();
        mux.register(4, Events::READ, relay()).unwrap();
        mux.schedule_retry(3, now).unwrap();
        mux.schedule_retry(3, now).unwrap();
        mux.schedule_retry(4, now).unwrap();

        mux.begin_retry_flush();
        let first = mux.next_retry(now).unwrap();
        assert_eq!(first.fd, 3);
        assert_eq!(first.ready, Events::READ);
        mux.schedule_retry(3, now).unwrap();
        assert_eq!(mux.next_retry(now).unwrap().fd, 4);
        assert!(mux.next_retry(now).is_none());

        mux.begin_retry_flush();
        assert_eq!(mux.next_retry(now).unwrap().fd, 3);
        assert!(mux.next_retry(now).is_none());
        assert!(!mux.has_retries());
    }

    #[test]
    fn future_retries_are_carried_over() {
        let mut mux = mux();
        let now = Instant::now();
        mux.register(3, Events::READ, relay()).unwrap();
        mux.schedule_retry(3, now + Duration::from_secs(60)).unwrap();
        mux.begin_retry_flush();
        assert!(mux.next_retry(now).is_none());
        assert!(mux.has_retries());
    }
}
