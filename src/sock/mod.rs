//! Non-blocking socket operations the worker drives.
//!
//! Descriptors are plain `RawFd`s so that they can index the multiplexer's
//! table directly. [`sys::SysNet`] is the real implementation; tests supply
//! scripted ones.

#[cfg(target_os = "linux")]
pub mod sys;

use std::{io, net::SocketAddr, os::fd::RawFd};

/// Outcome of a non-blocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    Established,
    InProgress,
}

pub trait Net {
    /// Binds a non-blocking listening socket.
    fn listen(&mut self, addr: SocketAddr, backlog: i32) -> io::Result<RawFd>;

    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr>;

    /// Accepts one pending connection as a non-blocking socket.
    /// `WouldBlock` when none is pending.
    fn accept(&mut self, listener: RawFd) -> io::Result<(RawFd, SocketAddr)>;

    /// Starts a non-blocking connect to `addr`.
    fn connect(&mut self, addr: SocketAddr) -> io::Result<(RawFd, Connect)>;

    /// Result of a connect that reported [`Connect::InProgress`], read once
    /// the socket turned writable.
    fn connect_result(&mut self, fd: RawFd) -> io::Result<()>;

    /// `Ok(0)` is end of stream.
    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;

    fn shutdown_write(&mut self, fd: RawFd) -> io::Result<()>;

    fn close(&mut self, fd: RawFd);
}
