use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    os::fd::RawFd,
    time::Instant,
};

use crate::pool::{Packet, PacketPool};

pub use crate::pool::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    #[inline]
    pub const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Backend,
            Self::Backend => Self::Client,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Client => 0,
            Self::Backend => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Backend => "backend",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type SideFlagsBitframe = u8;

/// Per-side state bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SideFlags(SideFlagsBitframe);

impl SideFlags {
    /// Non-blocking connect issued, outcome not yet known.
    pub const HANDSHAKE: Self = Self(1 << 0);
    /// Last send could not drain the output queue.
    pub const BLOCKED: Self = Self(1 << 1);
    /// End of stream seen on this socket.
    pub const SHUT_RD: Self = Self(1 << 2);
    /// Write half of this socket shut down.
    pub const SHUT_WR: Self = Self(1 << 3);
    /// Unrecoverable I/O error.
    pub const ERROR: Self = Self(1 << 4);
    /// Reading paused until the peer's output queue drains.
    pub const READ_SUSPENDED: Self = Self(1 << 5);
    /// Reading paused until the packet pool has room again.
    pub const STARVED: Self = Self(1 << 6);

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::fmt::Debug for SideFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [&str; 7] = [
            "HANDSHAKE",
            "BLOCKED",
            "SHUT_RD",
            "SHUT_WR",
            "ERROR",
            "READ_SUSPENDED",
            "STARVED",
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "SideFlags({})", set.join("|"))
    }
}

/// Teardown progress of one side, checked by the task runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideLife {
    #[default]
    Active,
    /// Delete requested while tasks for the session were still queued.
    PendingDelete,
    Deleted,
}

#[derive(Debug)]
pub struct SessionSide {
    pub fd: RawFd,
    pub addr: Option<SocketAddr>,
    /// Received, not yet relayed.
    pub input: VecDeque<Packet>,
    /// Relayed from the peer, not yet sent.
    pub output: VecDeque<Packet>,
    pub flags: SideFlags,
    pub life: SideLife,
}

impl SessionSide {
    pub fn new() -> Self {
        Self {
            fd: -1,
            addr: None,
            input: VecDeque::new(),
            output: VecDeque::new(),
            flags: SideFlags::empty(),
            life: SideLife::Active,
        }
    }

    pub fn connected(fd: RawFd, addr: SocketAddr) -> Self {
        Self {
            fd,
            addr: Some(addr),
            ..Self::new()
        }
    }

    #[inline]
    pub fn has(&self, flag: SideFlags) -> bool {
        self.flags.contains(flag)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.life == SideLife::Active
    }
}

impl Default for SessionSide {
    fn default() -> Self {
        Self::new()
    }
}

/// One proxied flow: a client socket and the backend socket opened for it.
#[derive(Debug)]
pub struct Session {
    pub client: SessionSide,
    pub backend: SessionSide,
    pub policy: usize,
    pub backend_addr: SocketAddr,
    /// Packets taken from the pool on behalf of this session.
    pub packets: usize,
    pub created: Instant,
}

impl Session {
    pub fn new(client: SessionSide, policy: usize, backend_addr: SocketAddr) -> Self {
        Self {
            client,
            backend: SessionSide::new(),
            policy,
            backend_addr,
            packets: 0,
            created: Instant::now(),
        }
    }

    pub fn side(&self, side: Side) -> &SessionSide {
        match side {
            Side::Client => &self.client,
            Side::Backend => &self.backend,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SessionSide {
        match side {
            Side::Client => &mut self.client,
            Side::Backend => &mut self.backend,
        }
    }

    /// `(side, peer)` borrowed together.
    pub fn pair_mut(&mut self, side: Side) -> (&mut SessionSide, &mut SessionSide) {
        match side {
            Side::Client => (&mut self.client, &mut self.backend),
            Side::Backend => (&mut self.backend, &mut self.client),
        }
    }

    /// Both write halves shut down, or either side failed.
    pub fn is_finished(&self) -> bool {
        let errored = self.client.has(SideFlags::ERROR) || self.backend.has(SideFlags::ERROR);
        let closed = self.client.has(SideFlags::SHUT_WR) && self.backend.has(SideFlags::SHUT_WR);
        errored || closed
    }

    pub fn alloc_packet(&mut self, pool: &mut PacketPool) -> Option<Packet> {
        let packet = pool.alloc()?;
        self.packets += 1;
        Some(packet)
    }

    pub fn free_packet(&mut self, pool: &mut PacketPool, packet: Packet) {
        debug_assert!(self.packets > 0);
        self.packets = self.packets.saturating_sub(1);
        pool.free(packet);
    }

    /// Returns every queued packet of both sides to `pool`.
    pub fn release_packets(&mut self, pool: &mut PacketPool) {
        let queued: Vec<Packet> = [Side::Client, Side::Backend]
            .into_iter()
            .flat_map(|side| {
                let side = self.side_mut(side);
                let mut drained: Vec<Packet> = side.input.drain(..).collect();
                drained.extend(side.output.drain(..));
                drained
            })
            .collect();
        for packet in queued {
            self.free_packet(pool, packet);
        }
    }
}
