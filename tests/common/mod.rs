//! Scripted sockets and readiness for driving a worker deterministically.
//!
//! One [`World`] plays both the kernel and the remote peers. Every stream is
//! known by the descriptor the worker sees; tests push bytes into it, read
//! what the worker wrote and flip end-of-stream or reset conditions.
#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    os::fd::RawFd,
    rc::Rc,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use sluice::{
    mux::{Events, Poller},
    policy::Policy,
    sock::{Connect, Net},
    worker::{Worker, WorkerOptions},
};

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    /// `connect` fails synchronously.
    Refuse,
    /// `connect` is in progress and later reports `ECONNREFUSED`.
    FailHandshake,
    /// Accepts the connection, taking at most `write_chunk` bytes per send.
    Accept { handshake: bool, write_chunk: usize },
}

impl Backend {
    pub fn ok() -> Self {
        Self::Accept {
            handshake: true,
            write_chunk: usize::MAX,
        }
    }

    pub fn chunked(write_chunk: usize) -> Self {
        Self::Accept {
            handshake: true,
            write_chunk,
        }
    }
}

#[derive(Debug, Default)]
pub struct Stream {
    pub peer: Option<SocketAddr>,
    /// Bytes the worker has yet to receive.
    pub rx: VecDeque<u8>,
    /// Remote end shut its write half; reported after `rx` drains.
    pub eof: bool,
    pub reset: bool,
    /// Everything the worker sent.
    pub tx: Vec<u8>,
    pub write_chunk: Option<usize>,
    /// Worker shut its write half.
    pub shut_wr: bool,
    pub closed: bool,
    connect_error: Option<i32>,
}

#[derive(Default)]
struct State {
    next_fd: RawFd,
    next_port: u16,
    listeners: HashMap<RawFd, (SocketAddr, VecDeque<RawFd>)>,
    streams: HashMap<RawFd, Stream>,
    backends: HashMap<SocketAddr, Backend>,
    in_use: Vec<SocketAddr>,
    registered: HashMap<RawFd, Events>,
    connections: Vec<(SocketAddr, RawFd)>,
    closed_while_registered: Vec<RawFd>,
    reverse: bool,
}

impl State {
    fn alloc_fd(&mut self) -> RawFd {
        self.next_fd += 1;
        self.next_fd
    }

    fn stream(&mut self, fd: RawFd) -> io::Result<&mut Stream> {
        match self.streams.get_mut(&fd) {
            Some(stream) if !stream.closed => Ok(stream),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    fn readiness(&self, fd: RawFd, interest: Events) -> Events {
        let mut ready = Events::NONE;
        if let Some((_, pending)) = self.listeners.get(&fd) {
            if interest.intersects(Events::READ) && !pending.is_empty() {
                ready |= Events::READ;
            }
            return ready;
        }
        let Some(stream) = self.streams.get(&fd) else {
            return ready;
        };
        if stream.reset {
            ready |= Events::ERROR | Events::HUP;
        }
        if interest.intersects(Events::READ) && (!stream.rx.is_empty() || stream.eof || stream.reset)
        {
            ready |= Events::READ;
        }
        if interest.intersects(Events::WRITE) {
            ready |= Events::WRITE;
        }
        ready
    }
}

#[derive(Clone, Default)]
pub struct World {
    state: Rc<RefCell<State>>,
}

impl World {
    pub fn new() -> Self {
        let world = Self::default();
        {
            let mut state = world.state.borrow_mut();
            state.next_fd = 2;
            state.next_port = 40000;
        }
        world
    }

    pub fn set_backend(&self, addr: SocketAddr, backend: Backend) {
        self.state.borrow_mut().backends.insert(addr, backend);
    }

    /// Makes `listen` on `addr` fail with `EADDRINUSE`.
    pub fn occupy(&self, addr: SocketAddr) {
        self.state.borrow_mut().in_use.push(addr);
    }

    /// Reports ready descriptors in descending order.
    pub fn set_reverse(&self, reverse: bool) {
        self.state.borrow_mut().reverse = reverse;
    }

    /// Queues a client on the listener bound to `listen`, returning the
    /// descriptor the worker will accept it as.
    pub fn connect_client(&self, listen: SocketAddr) -> RawFd {
        let mut state = self.state.borrow_mut();
        let fd = state.alloc_fd();
        state.next_port += 1;
        let peer = SocketAddr::from(([10, 0, 0, 1], state.next_port));
        state.streams.insert(
            fd,
            Stream {
                peer: Some(peer),
                ..Default::default()
            },
        );
        let listener = state
            .listeners
            .values_mut()
            .find(|(addr, _)| *addr == listen)
            .expect("no listener on that address");
        listener.1.push_back(fd);
        fd
    }

    /// Remote end of `fd` sends `data`.
    pub fn send(&self, fd: RawFd, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        state.streams.get_mut(&fd).expect("unknown stream").rx.extend(data);
    }

    /// Remote end of `fd` shuts its write half.
    pub fn shutdown(&self, fd: RawFd) {
        self.state.borrow_mut().streams.get_mut(&fd).expect("unknown stream").eof = true;
    }

    pub fn reset(&self, fd: RawFd) {
        self.state.borrow_mut().streams.get_mut(&fd).expect("unknown stream").reset = true;
    }

    pub fn tx(&self, fd: RawFd) -> Vec<u8> {
        self.state.borrow().streams[&fd].tx.clone()
    }

    pub fn is_shut_wr(&self, fd: RawFd) -> bool {
        self.state.borrow().streams[&fd].shut_wr
    }

    pub fn is_closed(&self, fd: RawFd) -> bool {
        let state = self.state.borrow();
        match state.streams.get(&fd) {
            Some(stream) => stream.closed,
            None => !state.listeners.contains_key(&fd),
        }
    }

    /// Backend connections in the order the worker opened them.
    pub fn connections(&self) -> Vec<(SocketAddr, RawFd)> {
        self.state.borrow().connections.clone()
    }

    pub fn backend_fd(&self, n: usize) -> RawFd {
        self.state.borrow().connections[n].1
    }

    pub fn registered(&self, fd: RawFd) -> Option<Events> {
        self.state.borrow().registered.get(&fd).copied()
    }

    pub fn closed_while_registered(&self) -> Vec<RawFd> {
        self.state.borrow().closed_while_registered.clone()
    }

    pub fn listeners(&self) -> usize {
        self.state.borrow().listeners.len()
    }

    pub fn open_streams(&self) -> usize {
        self.state.borrow().streams.values().filter(|s| !s.closed).count()
    }
}

impl Net for World {
    fn listen(&mut self, addr: SocketAddr, _backlog: i32) -> io::Result<RawFd> {
        let mut state = self.state.borrow_mut();
        if state.in_use.contains(&addr) {
            return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
        }
        let fd = state.alloc_fd();
        state.listeners.insert(fd, (addr, VecDeque::new()));
        Ok(fd)
    }

    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr> {
        let state = self.state.borrow();
        if let Some((addr, _)) = state.listeners.get(&fd) {
            return Ok(*addr);
        }
        Err(io::Error::from_raw_os_error(libc::EBADF))
    }

    fn accept(&mut self, listener: RawFd) -> io::Result<(RawFd, SocketAddr)> {
        let mut state = self.state.borrow_mut();
        let (_, pending) = state
            .listeners
            .get_mut(&listener)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let fd = pending
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let peer = state.streams[&fd].peer.expect("client without address");
        Ok((fd, peer))
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<(RawFd, Connect)> {
        let mut state = self.state.borrow_mut();
        let backend = state.backends.get(&addr).copied().unwrap_or(Backend::ok());
        let (stream, outcome) = match backend {
            Backend::Refuse => return Err(io::Error::from_raw_os_error(libc::ECONNREFUSED)),
            Backend::FailHandshake => (
                Stream {
                    connect_error: Some(libc::ECONNREFUSED),
                    ..Default::default()
                },
                Connect::InProgress,
            ),
            Backend::Accept {
                handshake,
                write_chunk,
            } => (
                Stream {
                    write_chunk: Some(write_chunk),
                    ..Default::default()
                },
                if handshake {
                    Connect::InProgress
                } else {
                    Connect::Established
                },
            ),
        };
        let fd = state.alloc_fd();
        state.streams.insert(
            fd,
            Stream {
                peer: Some(addr),
                ..stream
            },
        );
        state.connections.push((addr, fd));
        Ok((fd, outcome))
    }

    fn connect_result(&mut self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        match state.stream(fd)?.connect_error.take() {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        let stream = state.stream(fd)?;
        if stream.reset {
            return Err(io::Error::from_raw_os_error(libc::ECONNRESET));
        }
        if stream.rx.is_empty() {
            if stream.eof {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = buf.len().min(stream.rx.len());
        for (slot, byte) in buf.iter_mut().zip(stream.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        let stream = state.stream(fd)?;
        if stream.reset || stream.shut_wr {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        let n = buf.len().min(stream.write_chunk.unwrap_or(usize::MAX));
        stream.tx.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn shutdown_write(&mut self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.stream(fd)?.shut_wr = true;
        Ok(())
    }

    fn close(&mut self, fd: RawFd) {
        let mut state = self.state.borrow_mut();
        if state.registered.contains_key(&fd) {
            state.closed_while_registered.push(fd);
        }
        if state.listeners.remove(&fd).is_some() {
            return;
        }
        if let Some(stream) = state.streams.get_mut(&fd) {
            stream.closed = true;
        }
    }
}

impl Poller for World {
    fn add(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.registered.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        state.registered.insert(fd, events);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        match state.registered.get_mut(&fd) {
            Some(current) => {
                *current = events;
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .registered
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn wait(
        &mut self,
        ready: &mut Vec<(RawFd, Events)>,
        _timeout: Option<Duration>,
    ) -> io::Result<()> {
        let state = self.state.borrow();
        ready.clear();
        ready.extend(
            state
                .registered
                .iter()
                .map(|(&fd, &interest)| (fd, state.readiness(fd, interest)))
                .filter(|(_, events)| !events.is_empty()),
        );
        ready.sort_by_key(|(fd, _)| *fd);
        if state.reverse {
            ready.reverse();
        }
        Ok(())
    }
}

pub type TestWorker = Worker<World, World>;

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn options() -> WorkerOptions {
    WorkerOptions {
        id: 0,
        max_sessions: 8,
        max_fds: 128,
        packet_size: 16,
        packet_pool: 64,
        queue_limit: 4,
        backlog: 16,
        poll_timeout: Duration::ZERO,
        report_interval: Duration::ZERO,
        accept_budget: 8,
        read_budget: 4,
    }
}

pub fn worker(world: &World, options: WorkerOptions, policies: Vec<Policy>) -> TestWorker {
    Worker::new(
        options,
        world.clone(),
        world.clone(),
        policies,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap()
}

/// Runs `n` loop iterations.
pub fn turns(worker: &mut TestWorker, n: usize) {
    for _ in 0..n {
        worker.turn().unwrap();
    }
}

/// Turns until `done` holds, panicking after `limit` iterations.
pub fn turn_until(worker: &mut TestWorker, limit: usize, mut done: impl FnMut(&TestWorker) -> bool) {
    for _ in 0..limit {
        if done(worker) {
            return;
        }
        worker.turn().unwrap();
    }
    assert!(done(worker), "condition not reached after {limit} turns");
}
