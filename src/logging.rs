use std::{fmt::Display, net::SocketAddr, os::fd::RawFd, time::Duration};

use log::{debug, error, info, warn};

use crate::session::{SessionId, Side};

pub struct SluiceLogger;

impl SluiceLogger {
    pub fn preparing_socket(worker: usize, address: &SocketAddr) {
        info!("[w{worker}] Preparing socket {address}");
    }

    pub fn worker_started(worker: usize, cpus: &[usize]) {
        if cpus.is_empty() {
            info!("[w{worker}] Worker started");
        } else {
            info!("[w{worker}] Worker started on cpus {cpus:?}");
        }
    }

    pub fn pin_failed(worker: usize, err: &std::io::Error) {
        warn!("[w{worker}] Failed to set CPU affinity: {err}");
    }

    pub fn worker_stopped(worker: usize, live: usize) {
        info!("[w{worker}] Worker stopped, closing {live} live sessions");
    }

    pub fn worker_failed(worker: usize, err: &dyn Display) {
        error!("[w{worker}] Worker failed: {err}");
    }

    pub fn session_accepted(id: SessionId, client: &SocketAddr, backend: &SocketAddr) {
        debug!("Session {id}: {client} -> {backend}");
    }

    pub fn session_rejected(client: &SocketAddr, reason: &str) {
        if dotenvy::var("DO_NOT_LOG_CONNECTION_ERROR").is_ok() {
            return;
        }
        warn!("Rejected connection {client}: {reason}");
    }

    pub fn accept_failed(err: &std::io::Error) {
        warn!("Accept failed: {err}");
    }

    pub fn backend_connect_failed(id: SessionId, backend: &SocketAddr, err: &dyn Display) {
        if dotenvy::var("DO_NOT_LOG_CONNECTION_ERROR").is_ok() {
            return;
        }
        error!("Session {id}: backend {backend} unreachable: {err}");
    }

    pub fn side_error(id: SessionId, side: Side, err: &dyn Display) {
        debug!("Session {id}: {side} error: {err}");
    }

    pub fn session_closed(id: SessionId, lifetime: Duration) {
        debug!("Session {id} closed after {}ms", lifetime.as_millis());
    }

    pub fn commit_failed(fd: RawFd, err: &dyn Display) {
        warn!("Interest commit failed for fd {fd}: {err}");
    }

    pub fn poll_failed(err: &std::io::Error) {
        error!("Poll failed: {err}");
    }

    pub fn invariant_violation(what: &str) {
        error!("Invariant violated: {what}");
    }
}
