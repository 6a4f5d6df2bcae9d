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

//! The socket manager and its dispatcher thread.
//!
//! A [`SocketManager`] owns the bookkeeping for a set of sockets and a
//! dedicated dispatcher thread that multiplexes readiness across all of
//! them with `poll(2)`. Socket operations queue work and then nudge the
//! dispatcher through a self-pipe; the dispatcher performs the actual
//! transfers and posts completion events.
//!
//! The manager never destroys a socket itself: destruction happens when
//! the last [`Socket`] handle is dropped. [`SocketManager::destroy`]
//! therefore *blocks* until every socket created through the manager
//! has been released, then stops the dispatcher.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::error;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{close, pipe, read, write};
use slab::Slab;

use crate::error::Error;
use crate::event::SocketId;
use crate::socket::{Socket, SocketInner, SocketKind};

/// How long the dispatcher sleeps in `poll(2)` before re-checking for
/// shutdown, in milliseconds. Interest changes arrive sooner via the
/// self-pipe.
const POLL_TIMEOUT_MS: i32 = 1000;

/// Manager state shared with every socket and with the dispatcher
/// thread. This is the last lock in the acquisition order: it is taken
/// with no socket or task lock held, or after a socket's own lock,
/// never before one.
pub(crate) struct Shared {
    pub(crate) records: Mutex<Records>,

    /// Wakes a thread blocked in [`SocketManager::destroy`]. Notified
    /// when the socket table becomes empty.
    destroy_wakeup: Condvar,

    /// Write end of the dispatcher's self-pipe.
    wake_write: RawFd,
}

/// The manager's bookkeeping records.
pub(crate) struct Records {
    pub(crate) sockets: Slab<Weak<SocketInner>>,
    pub(crate) shutting_down: bool,
}

impl Shared {
    /// Nudges the dispatcher out of `poll(2)` so that it re-reads
    /// socket interest. A full pipe is fine; the dispatcher is already
    /// due to wake.
    pub(crate) fn wake(&self) {
        let _ = write(self.wake_write, &[0]);
    }

    /// Removes a destroyed socket from the bookkeeping. Called from
    /// [`SocketInner`]'s drop, with no other lock of ours held.
    pub(crate) fn deregister(&self, id: SocketId) {
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.sockets.remove(id.0);
        let empty = records.sockets.is_empty();
        drop(records);
        if empty {
            self.destroy_wakeup.notify_all();
        }
        self.wake();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = close(self.wake_write);
    }
}

/// Creates sockets and runs the dispatcher thread that serves their
/// I/O.
pub struct SocketManager {
    shared: Arc<Shared>,
    poller: Option<thread::JoinHandle<()>>,
}

impl SocketManager {
    /// Creates a manager and starts its dispatcher thread.
    pub fn new() -> Result<Self, Error> {
        let (wake_read, wake_write) = pipe()?;
        for fd in [wake_read, wake_write] {
            if let Err(errno) = fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
                let _ = close(wake_read);
                let _ = close(wake_write);
                return Err(errno.into());
            }
        }
        let shared = Arc::new(Shared {
            records: Mutex::new(Records {
                sockets: Slab::new(),
                shutting_down: false,
            }),
            destroy_wakeup: Condvar::new(),
            wake_write,
        });
        let poller_shared = shared.clone();
        let poller = thread::Builder::new()
            .name("sockevent dispatcher".to_owned())
            .spawn(move || poll_loop(&poller_shared, wake_read))
            .map_err(|e| {
                let _ = close(wake_read);
                Error::from(e)
            })?;
        Ok(Self {
            shared,
            poller: Some(poller),
        })
    }

    /// Creates a new, unbound socket of the given kind. Fails with
    /// [`Error::ShuttingDown`] once [`SocketManager::destroy`] has
    /// begun.
    pub fn create(&self, kind: SocketKind) -> Result<Socket, Error> {
        Socket::unbound(&self.shared, kind)
    }

    /// Shuts the manager down. Blocks until every socket created
    /// through this manager has released its last handle, then stops
    /// the dispatcher thread. Dropping the manager does the same.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let poller = match self.poller.take() {
            Some(poller) => poller,
            None => return,
        };
        let mut records = self.shared.records.lock().unwrap();
        records.shutting_down = true;
        self.shared.wake();
        let records = self
            .shared
            .destroy_wakeup
            .wait_while(records, |records| !records.sockets.is_empty())
            .unwrap();
        drop(records);
        self.shared.wake();
        if poller.join().is_err() {
            error!("dispatcher thread panicked");
        }
    }

    /// The number of sockets currently registered.
    #[cfg(test)]
    fn live_sockets(&self) -> usize {
        self.shared.records.lock().unwrap().sockets.len()
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The dispatcher: polls every socket with registered interest plus
/// the self-pipe, then services whichever descriptors signalled.
fn poll_loop(shared: &Arc<Shared>, wake_read: RawFd) {
    let mut live: Vec<Arc<SocketInner>> = Vec::new();
    loop {
        // Snapshot the live sockets. Holding strong references for the
        // rest of the iteration keeps descriptors valid while we poll
        // and dispatch; a socket whose last outside handle drops
        // mid-iteration is then destroyed here, at the snapshot
        // refresh.
        live.clear();
        {
            let records = shared.records.lock().unwrap();
            if records.shutting_down && records.sockets.is_empty() {
                break;
            }
            for (_, weak) in records.sockets.iter() {
                if let Some(inner) = weak.upgrade() {
                    live.push(inner);
                }
            }
        }

        let mut poll_fds = Vec::with_capacity(live.len() + 1);
        poll_fds.push(PollFd::new(wake_read, PollFlags::POLLIN));
        let mut watched = Vec::with_capacity(live.len());
        for (index, inner) in live.iter().enumerate() {
            if let Some((fd, flags)) = inner.poll_interest() {
                poll_fds.push(PollFd::new(fd, flags));
                watched.push(index);
            }
        }

        match poll(&mut poll_fds, POLL_TIMEOUT_MS) {
            Ok(_) => (),
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                error!("dispatcher poll failed: {}", errno);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        }

        if let Some(revents) = poll_fds[0].revents() {
            if revents.contains(PollFlags::POLLIN) {
                drain_wake_pipe(wake_read);
            }
        }
        for (poll_fd, &index) in poll_fds[1..].iter().zip(watched.iter()) {
            if let Some(revents) = poll_fd.revents() {
                if !revents.is_empty() {
                    live[index].dispatch(revents);
                }
            }
        }
    }
    let _ = close(wake_read);
}

fn drain_wake_pipe(fd: RawFd) {
    let mut buf = [0; 32];
    while let Ok(n) = read(fd, &mut buf) {
        if n < buf.len() {
            break;
        }
    }
}
