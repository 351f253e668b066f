//! Deferred work, drained once per loop iteration after readiness dispatch.
//!
//! Readiness callbacks only record what happened and enqueue a task; relay,
//! send and teardown run from here, so no session is mutated while the
//! dispatch loop still holds descriptors that refer to it.

use std::collections::{HashSet, VecDeque};

use crate::session::{SessionId, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Relay this side's input queue to the peer.
    Parse,
    /// Write this side's output queue.
    Send,
    /// Tear the session down.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task {
    pub kind: TaskKind,
    pub session: SessionId,
    pub side: Side,
}

impl Task {
    pub const fn new(kind: TaskKind, session: SessionId, side: Side) -> Self {
        Self {
            kind,
            session,
            side,
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    queue: VecDeque<Task>,
    queued: HashSet<Task>,
    pass: usize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` unless an identical one is already waiting.
    pub fn enqueue(&mut self, task: Task) -> bool {
        if !self.queued.insert(task) {
            return false;
        }
        self.queue.push_back(task);
        true
    }

    /// Fixes the number of tasks the current pass will run. Anything
    /// enqueued from here on waits for the next pass.
    pub fn begin_pass(&mut self) -> usize {
        self.pass = self.queue.len();
        self.pass
    }

    /// Next task of the current pass. Membership is released on pop, so the
    /// task may enqueue itself again for a later pass.
    pub fn next(&mut self) -> Option<Task> {
        if self.pass == 0 {
            return None;
        }
        self.pass -= 1;
        let task = self.queue.pop_front()?;
        self.queued.remove(&task);
        Some(task)
    }

    /// Whether any task for `(session, side)` is waiting.
    pub fn is_pending(&self, session: SessionId, side: Side) -> bool {
        [TaskKind::Parse, TaskKind::Send, TaskKind::Delete]
            .into_iter()
            .any(|kind| self.queued.contains(&Task::new(kind, session, side)))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
