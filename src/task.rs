// Copyright 2025 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Tasks: the execution contexts completion events are delivered to.
//!
//! A [`Task`] is little more than a private, ordered event queue behind
//! its own lock. The socket layer posts completion events to it; the
//! task's run loop (which this crate does not prescribe) dequeues them
//! with [`Task::next`] or [`Task::wait_next`] and acts on them.
//!
//! Callers must not hold anything that serializes a task's run loop
//! while invoking socket operations bound to that task; the dispatcher
//! acquires socket state first and the task queue second when posting,
//! and the reverse order can deadlock. See the crate documentation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::event::{Event, SocketId};
use crate::socket::ShutdownHow;

/// Identifies a [`Task`]. Unique for the lifetime of the process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// An execution context with a private, ordered event queue.
pub struct Task {
    id: TaskId,
    records: Mutex<TaskRecords>,

    /// Wakes threads blocked in [`Task::wait_next`]. Used with the
    /// `records` mutex. Waiters are notified when an event is posted
    /// and when shutdown is initiated.
    wakeup: Condvar,
}

/// The internal records of a [`Task`].
struct TaskRecords {
    queue: VecDeque<Event>,
    shutting_down: bool,
}

impl Task {
    /// Creates a new task.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            records: Mutex::new(TaskRecords {
                queue: VecDeque::new(),
                shutting_down: false,
            }),
            wakeup: Condvar::new(),
        })
    }

    /// Returns the task's identity.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Appends an event to the task's queue. Events posted to a task
    /// that is shutting down are dropped.
    pub fn post(&self, event: Event) {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            return;
        }
        records.queue.push_back(event);
        self.wakeup.notify_one();
    }

    /// Dequeues the next event, if one is immediately available.
    pub fn next(&self) -> Option<Event> {
        self.records.lock().unwrap().queue.pop_front()
    }

    /// Dequeues the next event, blocking up to `timeout` for one to
    /// arrive. Returns [`None`] on timeout or if the task is shut down
    /// with an empty queue.
    pub fn wait_next(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        let mut records = self.records.lock().unwrap();
        loop {
            if let Some(event) = records.queue.pop_front() {
                return Some(event);
            }
            if records.shutting_down {
                return None;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return None,
            };
            records = self.wakeup.wait_timeout(records, remaining).unwrap().0;
        }
    }

    /// Initiates task shutdown: undelivered events are dropped, further
    /// posts are ignored, and blocked waiters are woken.
    pub fn shut_down(&self) {
        let mut records = self.records.lock().unwrap();
        records.shutting_down = true;
        records.queue.clear();
        self.wakeup.notify_all();
    }

    /// Returns whether the task is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().shutting_down
    }

    /// Removes every queued-but-undelivered event that falls within
    /// the given cancellation scope. Called by the socket layer during
    /// shutdown and teardown, always with the socket's own lock already
    /// held (socket before task, never the reverse).
    pub(crate) fn purge(&self, socket: SocketId, how: ShutdownHow) {
        let mut records = self.records.lock().unwrap();
        records.queue.retain(|event| !event.matches_scope(socket, how));
    }

    /// The number of undelivered events.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.records.lock().unwrap().queue.len()
    }
}
