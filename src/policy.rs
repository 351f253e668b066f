use std::net::SocketAddr;

/// A listening address and the backends its sessions are spread over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub listen: SocketAddr,
    pub backends: Vec<SocketAddr>,
    next_backend: usize,
}

impl Policy {
    pub fn new(listen: SocketAddr, backends: Vec<SocketAddr>) -> Self {
        Self {
            listen,
            backends,
            next_backend: 0,
        }
    }

    /// Round robin: hands out `backends[next_backend]` and advances the
    /// cursor. `None` only for a policy without backends.
    pub fn select_backend(&mut self) -> Option<SocketAddr> {
        let backend = *self.backends.get(self.next_backend)?;
        self.next_backend = (self.next_backend + 1) % self.backends.len();
        Some(backend)
    }

    pub fn next_backend(&self) -> usize {
        self.next_backend
    }
}
