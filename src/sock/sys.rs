use std::{
    io::{self, Read},
    mem::ManuallyDrop,
    net::{Shutdown, SocketAddr},
    os::fd::{FromRawFd, IntoRawFd, RawFd},
};

use socket2::{Domain, Protocol, Socket, Type};

use super::{Connect, Net};

/// Kernel sockets through `socket2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysNet {
    pub nodelay: bool,
}

impl SysNet {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }
}

fn domain(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Borrows `fd` as a [`Socket`] without taking ownership of it.
fn borrow(fd: RawFd) -> ManuallyDrop<Socket> {
    ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) })
}

impl Net for SysNet {
    fn listen(&mut self, addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
        let socket = Socket::new(domain(&addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        // one listener per worker on the same address
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.set_cloexec(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        Ok(socket.into_raw_fd())
    }

    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr> {
        borrow(fd)
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"))
    }

    fn accept(&mut self, listener: RawFd) -> io::Result<(RawFd, SocketAddr)> {
        // accept4 with SOCK_CLOEXEC on linux
        let (socket, addr) = borrow(listener).accept()?;
        socket.set_nonblocking(true)?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer"))?;
        if self.nodelay {
            if let Err(err) = socket.set_nodelay(true) {
                log::debug!("Failed to set TCP_NODELAY: {err}");
            }
        }
        Ok((socket.into_raw_fd(), addr))
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<(RawFd, Connect)> {
        let socket = Socket::new(domain(&addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_cloexec(true)?;
        if self.nodelay {
            socket.set_nodelay(true)?;
        }
        let state = match socket.connect(&addr.into()) {
            Ok(()) => Connect::Established,
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Connect::InProgress,
            Err(err) => return Err(err),
        };
        Ok((socket.into_raw_fd(), state))
    }

    fn connect_result(&mut self, fd: RawFd) -> io::Result<()> {
        match borrow(fd).take_error()? {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let socket = borrow(fd);
        let mut socket: &Socket = &socket;
        socket.read(buf)
    }

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        borrow(fd).send_with_flags(buf, libc::MSG_NOSIGNAL)
    }

    fn shutdown_write(&mut self, fd: RawFd) -> io::Result<()> {
        borrow(fd).shutdown(Shutdown::Write)
    }

    fn close(&mut self, fd: RawFd) {
        if fd >= 0 {
            drop(unsafe { Socket::from_raw_fd(fd) });
        }
    }
}
