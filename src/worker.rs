//! One event loop: listeners, sessions and the relay state machine.
//!
//! Readiness callbacks only touch the side they were raised for and queue
//! tasks. Relaying, sending and teardown run from [`Worker::run_all`] once
//! dispatch is over.

use std::{
    fmt::Display,
    io,
    net::SocketAddr,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    config::SluiceConfig,
    error::{is_would_block, WorkerError},
    logging::SluiceLogger,
    metrics::{ProxyMetrics, WorkerStats},
    mux::{Callback, Dispatch, Events, Multiplexer, Poller},
    policy::Policy,
    pool::{Packet, PacketPool, SessionPool},
    session::{Session, SessionId, SessionSide, Side, SideFlags, SideLife},
    sock::{Connect, Net},
    task::{Task, TaskKind, TaskQueue},
    telemetry::get_meter,
    utils::Ticker,
};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub id: usize,
    pub max_sessions: usize,
    pub max_fds: usize,
    pub packet_size: usize,
    pub packet_pool: usize,
    pub queue_limit: usize,
    pub backlog: i32,
    pub poll_timeout: Duration,
    pub report_interval: Duration,
    /// Connections accepted per listener readiness before yielding.
    pub accept_budget: usize,
    /// Successful reads per side readiness before yielding.
    pub read_budget: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(0, &SluiceConfig::default())
    }
}

impl WorkerOptions {
    pub fn from_config(id: usize, config: &SluiceConfig) -> Self {
        Self {
            id,
            max_sessions: config.max_sessions,
            max_fds: config.max_fds,
            packet_size: config.packet_size,
            packet_pool: config.packet_pool,
            queue_limit: config.queue_limit,
            backlog: config.backlog,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            report_interval: Duration::from_millis(config.report_interval_ms),
            accept_budget: 64,
            read_budget: 16,
        }
    }
}

enum Recv {
    Idle,
    Budget,
    Starved,
    Eof,
    Failed(io::Error),
}

pub struct Worker<N, P> {
    options: WorkerOptions,
    net: N,
    mux: Multiplexer<P>,
    tasks: TaskQueue,
    packets: PacketPool,
    sessions: SessionPool<Session>,
    policies: Vec<Policy>,
    listeners: Vec<RawFd>,
    starved: Vec<(SessionId, Side)>,
    stats: WorkerStats,
    metrics: ProxyMetrics,
    ticker: Ticker,
    stop: Arc<AtomicBool>,
}

#[cfg(target_os = "linux")]
impl Worker<crate::sock::sys::SysNet, crate::mux::epoll::EpollPoller> {
    /// Worker over kernel sockets and epoll.
    pub fn bind(
        options: WorkerOptions,
        nodelay: bool,
        policies: Vec<Policy>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, WorkerError> {
        let poller = crate::mux::epoll::EpollPoller::new(options.max_fds.min(1024))?;
        Self::new(
            options,
            crate::sock::sys::SysNet::new(nodelay),
            poller,
            policies,
            stop,
        )
    }
}

impl<N: Net, P: Poller> Worker<N, P> {
    /// Binds one listener per policy and registers it for accept.
    pub fn new(
        options: WorkerOptions,
        mut net: N,
        poller: P,
        policies: Vec<Policy>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, WorkerError> {
        let mut mux = Multiplexer::new(poller, options.max_fds);
        let mut listeners = Vec::with_capacity(policies.len());
        for (index, policy) in policies.iter().enumerate() {
            SluiceLogger::preparing_socket(options.id, &policy.listen);
            let bound = net
                .listen(policy.listen, options.backlog)
                .map_err(WorkerError::from)
                .and_then(|fd| {
                    listeners.push(fd);
                    mux.register(fd, Events::READ, Callback::Accept(index))
                        .map_err(WorkerError::from)
                });
            if let Err(err) = bound {
                for fd in listeners {
                    net.close(fd);
                }
                return Err(err);
            }
        }

        Ok(Self {
            tasks: TaskQueue::new(),
            packets: PacketPool::new(options.packet_pool, options.packet_size),
            sessions: SessionPool::with_capacity(options.max_sessions),
            starved: Vec::new(),
            stats: WorkerStats::default(),
            metrics: ProxyMetrics::new(&get_meter(), options.id),
            ticker: Ticker::new(options.report_interval),
            net,
            mux,
            policies,
            listeners,
            stop,
            options,
        })
    }

    pub fn id(&self) -> usize {
        self.options.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Packets currently held by sessions.
    pub fn outstanding_packets(&self) -> usize {
        self.packets.outstanding()
    }

    pub fn multiplexer(&self) -> &Multiplexer<P> {
        &self.mux
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Actual listening addresses, in policy order.
    pub fn listen_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|&fd| self.net.local_addr(fd))
            .collect()
    }

    /// Loops until the stop flag is raised, then closes everything.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        let result = loop {
            if self.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(err) = self.turn() {
                break Err(err);
            }
        };
        self.shutdown();
        result
    }

    /// One loop iteration.
    pub fn turn(&mut self) -> Result<(), WorkerError> {
        self.commit();

        let timeout = if !self.tasks.is_empty() || self.mux.has_retries() {
            Duration::ZERO
        } else {
            self.options.poll_timeout
        };
        let ready = match self.mux.poll(Some(timeout)) {
            Ok(n) => n,
            Err(err) => {
                SluiceLogger::poll_failed(&err);
                return Err(err.into());
            }
        };
        for n in 0..ready {
            if let Some(dispatch) = self.mux.dispatchable(n) {
                self.dispatch(dispatch);
            }
        }

        self.flush_retries();
        self.run_all();
        self.resume_starved();

        if self.ticker.ready(Instant::now()) {
            self.metrics.publish(&self.stats);
        }
        Ok(())
    }

    /// Closes every socket without propagating anything to peers.
    pub fn shutdown(&mut self) {
        SluiceLogger::worker_stopped(self.options.id, self.sessions.len());
        for id in self.sessions.ids() {
            let Some(mut session) = self.sessions.remove(id) else {
                continue;
            };
            for side in [Side::Client, Side::Backend] {
                let fd = session.side(side).fd;
                self.close_fd(fd);
                let this = session.side_mut(side);
                this.fd = -1;
                this.life = SideLife::Deleted;
            }
            session.release_packets(&mut self.packets);
        }
        debug_assert!(self.sessions.is_empty());
        for fd in std::mem::take(&mut self.listeners) {
            self.close_fd(fd);
        }
        self.starved.clear();
        self.stats.live = 0;
        self.metrics.publish(&self.stats);
    }

    fn close_fd(&mut self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        if let Err(err) = self.mux.remove(fd) {
            log::debug!("fd {fd} not removed from multiplexer: {err}");
        }
        self.net.close(fd);
    }

    fn commit(&mut self) {
        for failure in self.mux.commit() {
            SluiceLogger::commit_failed(failure.fd, &failure.error);
            if let Some(Callback::Relay(id, side)) = failure.callback {
                self.fail_side(id, side, &failure.error);
            }
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        let (id, side) = match dispatch.callback {
            Callback::Accept(policy) => return self.accept_ready(dispatch.fd, policy),
            Callback::Relay(id, side) => (id, side),
        };
        let Some(session) = self.sessions.get(id) else {
            SluiceLogger::invariant_violation("readiness for a freed session");
            debug_assert!(false, "readiness for freed session {id}");
            return;
        };
        if session.side(side).has(SideFlags::HANDSHAKE) {
            return self.handshake_ready(id);
        }

        let failed = dispatch.ready.intersects(Events::ERROR | Events::HUP);
        let readable = dispatch.ready.intersects(Events::READ)
            || (failed && dispatch.interest.intersects(Events::READ));
        if readable {
            self.recv_ready(id, side);
        }
        let writable = dispatch.ready.intersects(Events::WRITE)
            || (failed && !readable && dispatch.interest.intersects(Events::WRITE));
        if writable {
            self.tasks.enqueue(Task::new(TaskKind::Send, id, side));
        }
    }

    fn flush_retries(&mut self) {
        if !self.mux.has_retries() {
            return;
        }
        self.mux.begin_retry_flush();
        let now = Instant::now();
        while let Some(dispatch) = self.mux.next_retry(now) {
            self.dispatch(dispatch);
        }
    }

    /// Runs the tasks queued before this call. Tasks queued meanwhile wait
    /// for the next iteration.
    pub fn run_all(&mut self) {
        let pass = self.tasks.begin_pass();
        for _ in 0..pass {
            let Some(task) = self.tasks.next() else { break };
            let Some(session) = self.sessions.get(task.session) else {
                continue;
            };
            let active = session.side(task.side).is_active();
            match task.kind {
                TaskKind::Delete => self.delete_task(task.session),
                _ if !active => {}
                TaskKind::Parse => self.parse_task(task.session, task.side),
                TaskKind::Send => self.send_side(task.session, task.side),
            }
        }
    }

    fn accept_ready(&mut self, listener: RawFd, policy: usize) {
        for _ in 0..self.options.accept_budget {
            match self.net.accept(listener) {
                Ok((fd, addr)) => {
                    if let Err(err) = self.admit(fd, addr, policy) {
                        self.net.close(fd);
                        self.stats.rejected += 1;
                        SluiceLogger::session_rejected(&addr, &err.to_string());
                    }
                }
                Err(err) if is_would_block(&err) => return,
                Err(err) => {
                    SluiceLogger::accept_failed(&err);
                    return;
                }
            }
        }
        if let Err(err) = self.mux.schedule_retry(listener, Instant::now()) {
            log::debug!("accept retry for fd {listener} not scheduled: {err}");
        }
    }

    fn admit(&mut self, fd: RawFd, addr: SocketAddr, policy: usize) -> Result<(), WorkerError> {
        if usize::try_from(fd).map_or(true, |fd| fd >= self.mux.max_fds()) {
            return Err(WorkerError::ResourceExhausted("descriptor table"));
        }
        if self.sessions.is_full() {
            return Err(WorkerError::ResourceExhausted("session pool"));
        }
        let backend = self
            .policies
            .get_mut(policy)
            .and_then(Policy::select_backend)
            .ok_or(WorkerError::ResourceExhausted("backends"))?;
        let id = self
            .sessions
            .insert(Session::new(SessionSide::connected(fd, addr), policy, backend))
            .map_err(|_| WorkerError::ResourceExhausted("session pool"))?;
        if let Err(err) = self
            .mux
            .register(fd, Events::READ, Callback::Relay(id, Side::Client))
        {
            self.sessions.remove(id);
            return Err(err.into());
        }

        self.stats.accepted += 1;
        self.stats.live += 1;
        SluiceLogger::session_accepted(id, &addr, &backend);
        self.connect_backend(id, backend);
        Ok(())
    }

    fn connect_backend(&mut self, id: SessionId, backend: SocketAddr) {
        let (fd, state) = match self.net.connect(backend) {
            Ok(connected) => connected,
            Err(err) => {
                SluiceLogger::backend_connect_failed(id, &backend, &err);
                return self.fail_side(id, Side::Backend, &err);
            }
        };
        let Some(session) = self.sessions.get_mut(id) else {
            self.net.close(fd);
            return;
        };
        session.backend = SessionSide::connected(fd, backend);
        let events = match state {
            Connect::Established => Events::READ,
            Connect::InProgress => {
                session.backend.flags.insert(SideFlags::HANDSHAKE);
                Events::WRITE
            }
        };
        if let Err(err) = self
            .mux
            .register(fd, events, Callback::Relay(id, Side::Backend))
        {
            SluiceLogger::backend_connect_failed(id, &backend, &err);
            self.fail_side(id, Side::Backend, &err);
        }
    }

    fn handshake_ready(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let (fd, backend) = (session.backend.fd, session.backend_addr);
        match self.net.connect_result(fd) {
            Ok(()) => {
                if let Some(session) = self.sessions.get_mut(id) {
                    session.backend.flags.remove(SideFlags::HANDSHAKE);
                }
                self.refresh_interest(id, Side::Backend);
                self.tasks.enqueue(Task::new(TaskKind::Send, id, Side::Backend));
            }
            Err(err) if is_would_block(&err) => {}
            Err(err) => {
                SluiceLogger::backend_connect_failed(id, &backend, &err);
                self.fail_side(id, Side::Backend, &err);
            }
        }
    }

    fn recv_ready(&mut self, id: SessionId, side: Side) {
        let mut reads = 0;
        let outcome = loop {
            let Some(session) = self.sessions.get_mut(id) else {
                return;
            };
            let this = session.side(side);
            if this.has(SideFlags::SHUT_RD)
                || this.has(SideFlags::ERROR)
                || this.has(SideFlags::STARVED)
                || this.has(SideFlags::READ_SUSPENDED)
            {
                break Recv::Idle;
            }
            if reads == self.options.read_budget {
                break Recv::Budget;
            }
            let fd = this.fd;
            if this.input.back().map_or(true, Packet::is_full) {
                match session.alloc_packet(&mut self.packets) {
                    Some(packet) => session.side_mut(side).input.push_back(packet),
                    None => break Recv::Starved,
                }
            }
            let Some(packet) = session.side_mut(side).input.back_mut() else {
                break Recv::Idle;
            };
            match self.net.recv(fd, packet.spare_mut()) {
                Ok(0) => break Recv::Eof,
                Ok(n) => {
                    packet.commit(n);
                    self.stats.record_bytes(side, n);
                    reads += 1;
                }
                Err(err) if is_would_block(&err) => break Recv::Idle,
                Err(err) => break Recv::Failed(err),
            }
        };

        match outcome {
            Recv::Idle => {}
            Recv::Budget => {
                if let Some(session) = self.sessions.get(id) {
                    let fd = session.side(side).fd;
                    if let Err(err) = self.mux.schedule_retry(fd, Instant::now()) {
                        log::debug!("read retry for fd {fd} not scheduled: {err}");
                    }
                }
            }
            Recv::Starved => self.starve(id, side),
            Recv::Eof => {
                if let Some(session) = self.sessions.get_mut(id) {
                    session.side_mut(side).flags.insert(SideFlags::SHUT_RD);
                }
                self.stats.record_close(side);
                self.refresh_interest(id, side);
            }
            Recv::Failed(err) => return self.fail_side(id, side, &err),
        }
        self.tasks.enqueue(Task::new(TaskKind::Parse, id, side));
    }

    /// Moves `side`'s input to the peer's output unchanged, then sends it.
    fn parse_task(&mut self, id: SessionId, side: Side) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let (this, peer) = session.pair_mut(side);
        let mut empty = Vec::new();
        while let Some(packet) = this.input.pop_front() {
            if packet.is_empty() {
                empty.push(packet);
            } else {
                peer.output.push_back(packet);
            }
        }
        let over_limit = peer.output.len() >= self.options.queue_limit;
        for packet in empty {
            session.free_packet(&mut self.packets, packet);
        }

        if over_limit {
            self.suspend_read(id, side);
        }
        self.send_side(id, side.peer());
    }

    /// Writes `side`'s output queue and settles backpressure and half-close.
    fn send_side(&mut self, id: SessionId, side: Side) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let this = session.side(side);
        if this.fd < 0
            || !this.is_active()
            || this.has(SideFlags::HANDSHAKE)
            || this.has(SideFlags::ERROR)
        {
            return;
        }
        let fd = this.fd;

        let mut blocked = false;
        let mut failure = None;
        loop {
            let Some(front) = session.side_mut(side).output.front_mut() else {
                break;
            };
            if front.is_drained() {
                if let Some(packet) = session.side_mut(side).output.pop_front() {
                    session.free_packet(&mut self.packets, packet);
                }
                continue;
            }
            match self.net.send(fd, front.unsent()) {
                Ok(n) => {
                    front.advance(n);
                    if !front.is_drained() {
                        blocked = true;
                        break;
                    }
                }
                Err(err) if is_would_block(&err) => {
                    blocked = true;
                    break;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            return self.fail_side(id, side, &err);
        }
        if blocked {
            session.side_mut(side).flags.insert(SideFlags::BLOCKED);
            self.refresh_interest(id, side);
            self.suspend_read(id, side.peer());
            return;
        }

        session.side_mut(side).flags.remove(SideFlags::BLOCKED);
        self.refresh_interest(id, side);
        self.resume_read(id, side.peer());
        self.half_close(id, side);
    }

    /// Shuts down `side`'s write half once its peer reached end of stream
    /// and everything the peer sent has been written out.
    fn half_close(&mut self, id: SessionId, side: Side) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let (this, peer) = session.pair_mut(side);
        let done = peer.has(SideFlags::SHUT_RD)
            && peer.input.is_empty()
            && this.output.is_empty()
            && !this.has(SideFlags::SHUT_WR);
        if done {
            if let Err(err) = self.net.shutdown_write(this.fd) {
                return self.fail_side(id, side, &err);
            }
            this.flags.insert(SideFlags::SHUT_WR);
        }
        if session.is_finished() {
            self.request_delete(id);
        }
    }

    fn delete_task(&mut self, id: SessionId) {
        let pending = self.tasks.is_pending(id, Side::Client)
            || self.tasks.is_pending(id, Side::Backend);
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };

        if pending {
            if session.client.life == SideLife::Active {
                self.stats.deferred_deletes += 1;
            }
            for side in [Side::Client, Side::Backend] {
                let this = session.side_mut(side);
                this.life = SideLife::PendingDelete;
                if this.fd >= 0 {
                    self.mux.stop(this.fd);
                }
            }
            self.request_delete(id);
            return;
        }

        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };
        for side in [Side::Client, Side::Backend] {
            let fd = session.side(side).fd;
            self.close_fd(fd);
            let this = session.side_mut(side);
            this.fd = -1;
            this.life = SideLife::Deleted;
        }
        session.release_packets(&mut self.packets);
        if session.packets != 0 {
            SluiceLogger::invariant_violation("session freed with packets outstanding");
            debug_assert_eq!(session.packets, 0, "session {id} leaked packets");
        }
        self.stats.live = self.stats.live.saturating_sub(1);
        self.stats.deleted += 1;
        SluiceLogger::session_closed(id, session.created.elapsed());
    }

    fn request_delete(&mut self, id: SessionId) {
        self.tasks
            .enqueue(Task::new(TaskKind::Delete, id, Side::Client));
    }

    /// Marks `side` failed, drops its interest and schedules the teardown.
    fn fail_side(&mut self, id: SessionId, side: Side, err: &dyn Display) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let this = session.side_mut(side);
        if !this.has(SideFlags::ERROR) {
            this.flags.insert(SideFlags::ERROR);
            self.stats.record_error(side);
            SluiceLogger::side_error(id, side, err);
        }
        self.refresh_interest(id, side);
        self.request_delete(id);
    }

    fn suspend_read(&mut self, id: SessionId, side: Side) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let this = session.side_mut(side);
        if this.has(SideFlags::READ_SUSPENDED) || this.has(SideFlags::SHUT_RD) {
            return;
        }
        this.flags.insert(SideFlags::READ_SUSPENDED);
        self.stats.read_suspends += 1;
        self.refresh_interest(id, side);
    }

    fn resume_read(&mut self, id: SessionId, side: Side) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let this = session.side_mut(side);
        if !this.has(SideFlags::READ_SUSPENDED) {
            return;
        }
        this.flags.remove(SideFlags::READ_SUSPENDED);
        self.stats.read_resumes += 1;
        self.refresh_interest(id, side);
    }

    fn starve(&mut self, id: SessionId, side: Side) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let this = session.side_mut(side);
        if this.has(SideFlags::STARVED) {
            return;
        }
        this.flags.insert(SideFlags::STARVED);
        self.starved.push((id, side));
        self.refresh_interest(id, side);
    }

    fn resume_starved(&mut self) {
        if self.starved.is_empty() || self.packets.available() == 0 {
            return;
        }
        for (id, side) in std::mem::take(&mut self.starved) {
            let Some(session) = self.sessions.get_mut(id) else {
                continue;
            };
            session.side_mut(side).flags.remove(SideFlags::STARVED);
            self.refresh_interest(id, side);
        }
    }

    /// Recomputes the interest of `side` from its flags.
    fn refresh_interest(&mut self, id: SessionId, side: Side) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let this = session.side(side);
        if this.fd < 0 {
            return;
        }
        let _ = self.mux.set_events(this.fd, interest_of(this));
    }
}

fn interest_of(side: &SessionSide) -> Events {
    if side.has(SideFlags::ERROR) || !side.is_active() {
        return Events::NONE;
    }
    if side.has(SideFlags::HANDSHAKE) {
        return Events::WRITE;
    }
    let mut events = Events::NONE;
    let paused = side.has(SideFlags::SHUT_RD)
        || side.has(SideFlags::READ_SUSPENDED)
        || side.has(SideFlags::STARVED);
    if !paused {
        events |= Events::READ;
    }
    if side.has(SideFlags::BLOCKED) {
        events |= Events::WRITE;
    }
    events
}
