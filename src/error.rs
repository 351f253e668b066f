use std::{io, os::fd::RawFd};

/// Failures of the descriptor table and the readiness backend.
#[derive(thiserror::Error, Debug)]
pub enum MuxError {
    #[error("descriptor {fd} outside table of {max} (mx::range)")]
    FdOutOfRange { fd: RawFd, max: usize },
    #[error("descriptor {0} is not registered (mx::closed)")]
    NotRegistered(RawFd),
    #[error("poller error on descriptor {fd} - {source} (mx::os)")]
    Os {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

/// Errors a worker surfaces to whoever runs it.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("Networking error - {0} (wk::ne)")]
    Io(#[from] io::Error),
    #[error("Multiplexer error - {0} (wk::mx)")]
    Mux(#[from] MuxError),
    #[error("Resource exhausted: {0} (wk::re)")]
    ResourceExhausted(&'static str),
}

/// `true` for the "try again later" family of errors, which are not failures.
#[inline]
pub fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
