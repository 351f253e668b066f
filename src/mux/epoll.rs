use std::{io, os::fd::RawFd, time::Duration};

use libc::{
    c_int, epoll_event, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, EPOLL_CLOEXEC,
    EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

use super::{Events, Poller};

/// Level-triggered epoll instance.
pub struct EpollPoller {
    epfd: RawFd,
    buf: Vec<epoll_event>,
}

impl EpollPoller {
    /// `max_events` bounds how many ready descriptors one wait returns.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            buf: vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    fn ctl(&mut self, op: c_int, fd: RawFd, events: Events) -> io::Result<()> {
        let mut event = epoll_event {
            events: to_epoll(events),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn to_epoll(events: Events) -> u32 {
    let mut bits = 0;
    if events.intersects(Events::READ) {
        bits |= (EPOLLIN | EPOLLRDHUP) as u32;
    }
    if events.intersects(Events::WRITE) {
        bits |= EPOLLOUT as u32;
    }
    bits
}

fn from_epoll(bits: u32) -> Events {
    let mut events = Events::NONE;
    if bits & (EPOLLIN | EPOLLRDHUP) as u32 != 0 {
        events |= Events::READ;
    }
    if bits & EPOLLOUT as u32 != 0 {
        events |= Events::WRITE;
    }
    if bits & EPOLLERR as u32 != 0 {
        events |= Events::ERROR;
    }
    if bits & EPOLLHUP as u32 != 0 {
        events |= Events::HUP;
    }
    events
}

impl Poller for EpollPoller {
    fn add(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, events)
    }

    fn modify(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, events)
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(EPOLL_CTL_DEL, fd, Events::NONE)
    }

    fn wait(
        &mut self,
        ready: &mut Vec<(RawFd, Events)>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        ready.clear();
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(c_int::MAX as u128) as c_int,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.buf.as_mut_ptr(),
                self.buf.len() as c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        ready.extend(
            self.buf[..n as usize]
                .iter()
                .map(|event| (event.u64 as RawFd, from_epoll(event.events))),
        );
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}
