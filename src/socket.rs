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

//! TCP and UDP sockets as event sources.
//!
//! A [`Socket`] is one TCP or UDP endpoint, created through a
//! [`SocketManager`](crate::SocketManager). None of its operations
//! block awaiting I/O: receive, send, and connect requests are queued
//! against the socket together with a target [`Task`] and a completion
//! tag, and the manager's dispatcher performs the actual transfer once
//! the underlying descriptor is ready, posting exactly one completion
//! event per accepted request (untagged sends excepted).
//!
//! A TCP socket moves through `unbound → bound → {listening,
//! connecting} → connected`; a UDP socket stops at `bound`. The
//! transitions are monotonic. Destruction is reached only by dropping
//! the last handle, never through a direct call.
//!
//! Each socket serializes its state behind its own mutex, acquired
//! *before* any task lock on every dispatch path. Callers must follow
//! the same order; see the crate documentation.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::error;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::PollFlags;
use nix::sys::socket::{
    accept, bind as sock_bind, connect as sock_connect, getpeername, getsockname, getsockopt,
    listen as sock_listen, recv as sock_recv, recvfrom, send as sock_send, sendto, setsockopt,
    shutdown as sock_shutdown, socket as sock_new, sockopt, AddressFamily, MsgFlags, Shutdown,
    SockFlag, SockProtocol, SockType, SockaddrStorage,
};
use nix::unistd::close;

use crate::error::Error;
use crate::event::{Connected, Event, IoCompletion, NewConnection, SocketId, Tag};
use crate::manager::Shared;
use crate::region::Region;
use crate::task::Task;

/// The transport kind of a [`Socket`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketKind {
    /// A fixed-endpoint datagram socket.
    Udp,

    /// A connection-oriented stream socket.
    Tcp,
}

/// The direction(s) affected by [`Socket::shutdown`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownHow {
    Reading,
    Writing,
    All,
}

impl ShutdownHow {
    pub(crate) fn covers_reading(self) -> bool {
        matches!(self, Self::Reading | Self::All)
    }

    pub(crate) fn covers_writing(self) -> bool {
        matches!(self, Self::Writing | Self::All)
    }
}

////////////////////////////////////////////////////////////////////////
// SOCKET HANDLES                                                     //
////////////////////////////////////////////////////////////////////////

/// A shared-ownership handle to one TCP or UDP endpoint.
///
/// Cloning the handle attaches a new reference to the same socket;
/// dropping a handle detaches one. When the last handle drops, the
/// socket is shut down in both directions for all tasks and every
/// resource it owns is released, exactly once, even under concurrent
/// drops. Dropping the last handle while I/O is still pending silently
/// cancels that I/O: requests that can no longer be satisfied produce
/// no completion event.
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Clone for Socket {
    /// Attaches a new reference to the socket.
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Socket({})", self.inner.id)
    }
}

impl Socket {
    /// Creates a socket and registers it with the manager's
    /// bookkeeping. On failure no partially constructed socket remains
    /// visible.
    pub(crate) fn register(
        manager: &Arc<Shared>,
        kind: SocketKind,
        state: SocketState,
    ) -> Result<Self, Error> {
        let mut records = manager.records.lock().unwrap();
        if records.shutting_down {
            return Err(Error::ShuttingDown);
        }
        let entry = records.sockets.vacant_entry();
        let id = SocketId(entry.key());
        let inner = Arc::new(SocketInner {
            manager: manager.clone(),
            id,
            kind,
            state: Mutex::new(state),
        });
        entry.insert(Arc::downgrade(&inner));
        drop(records);
        manager.wake();
        Ok(Self { inner })
    }

    /// Creates an unbound socket of the given kind.
    pub(crate) fn unbound(manager: &Arc<Shared>, kind: SocketKind) -> Result<Self, Error> {
        Self::register(manager, kind, SocketState::new())
    }

    /// The socket's identity, as carried in completion events.
    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    /// The socket's transport kind.
    pub fn kind(&self) -> SocketKind {
        self.inner.kind
    }

    /// Binds the socket to a local address. The socket must not
    /// already be bound. On failure there is no observable effect.
    pub fn bind(&self, addr: SocketAddr) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            matches!(state.phase, Phase::Unbound),
            "bind on a socket that is already bound"
        );
        let fd = create_fd(self.inner.kind, addr)?;
        let result = (|| {
            if self.inner.kind == SocketKind::Tcp {
                setsockopt(fd, sockopt::ReuseAddr, &true)?;
            }
            sock_bind(fd, &SockaddrStorage::from(addr))
        })();
        match result {
            Ok(()) => {
                state.fd = Some(fd);
                state.phase = Phase::Bound;
                Ok(())
            }
            Err(errno) => {
                let _ = close(fd);
                Err(errno.into())
            }
        }
    }

    /// Starts listening on a bound TCP socket. Every connection
    /// accepted thereafter is posted to `task` as a
    /// [`NewConnection`] event carrying `tag`.
    pub fn listen(&self, backlog: usize, task: &Arc<Task>, tag: Tag) -> Result<(), Error> {
        assert_eq!(
            self.inner.kind,
            SocketKind::Tcp,
            "listen on a non-TCP socket"
        );
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            matches!(state.phase, Phase::Bound),
            "listen on a socket that is not bound"
        );
        sock_listen(state.fd.unwrap(), backlog)?;
        state.phase = Phase::Listening;
        state.listener = Some(Listener {
            task: task.clone(),
            tag,
        });
        self.inner.manager.wake();
        Ok(())
    }

    /// Suppresses new-connection delivery on a listening socket
    /// without closing it. The OS transport still queues or drops
    /// incoming attempts per its backlog policy. The socket must be
    /// listening and not already held.
    pub fn hold(&self) {
        let mut state = self.inner.state.lock().unwrap();
        assert!(state.listener.is_some(), "hold on a socket with no listener");
        assert!(!state.held, "hold on a socket that is already held");
        state.held = true;
    }

    /// Restores new-connection delivery. Connections accepted by the
    /// OS while held become visible. The socket must be held.
    pub fn unhold(&self) {
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            state.listener.is_some(),
            "unhold on a socket with no listener"
        );
        assert!(state.held, "unhold on a socket that is not held");
        state.held = false;
        self.inner.manager.wake();
    }

    /// Pulls one completed connection off a listening TCP socket,
    /// returning a new, already-connected socket.
    pub fn accept(&self) -> Result<Socket, Error> {
        assert_eq!(
            self.inner.kind,
            SocketKind::Tcp,
            "accept on a non-TCP socket"
        );
        let state = self.inner.state.lock().unwrap();
        assert!(
            matches!(state.phase, Phase::Listening),
            "accept on a socket that is not listening"
        );
        match accept_one(state.fd.unwrap()) {
            Ok(fd) => adopt(&self.inner.manager, fd),
            Err(Errno::EAGAIN) => Err(Error::NoPendingConnections),
            Err(errno) => Err(errno.into()),
        }
    }

    /// Initiates an asynchronous TCP connect. Completion, successful
    /// or not, is delivered as exactly one [`Connected`] event to
    /// `task`. Only immediately detectable conditions are returned
    /// synchronously; [`Error::HostUnreachable`],
    /// [`Error::NetworkUnreachable`], and [`Error::ConnectionRefused`]
    /// always arrive via the event's result field.
    pub fn connect(&self, addr: SocketAddr, task: &Arc<Task>, tag: Tag) -> Result<(), Error> {
        assert_eq!(
            self.inner.kind,
            SocketKind::Tcp,
            "connect on a non-TCP socket"
        );
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            !matches!(state.phase, Phase::Listening | Phase::Connected),
            "connect on a listening or connected socket"
        );
        assert!(
            state.connecting.is_none(),
            "connect with a connect already outstanding"
        );
        let (fd, created_here) = match state.fd {
            Some(fd) => (fd, false),
            None => {
                let fd = create_fd(self.inner.kind, addr)?;
                state.fd = Some(fd);
                (fd, true)
            }
        };
        match sock_connect(fd, &SockaddrStorage::from(addr)) {
            Ok(()) => {
                state.phase = Phase::Connected;
                self.inner.post_event(
                    &mut state,
                    task,
                    Event::Connected(Connected {
                        socket: self.inner.id,
                        tag,
                        result: Ok(()),
                    }),
                );
                Ok(())
            }
            Err(Errno::EINPROGRESS) => {
                state.phase = Phase::Connecting;
                state.connecting = Some(ConnectReq {
                    task: task.clone(),
                    tag,
                });
                self.inner.manager.wake();
                Ok(())
            }
            Err(errno @ (Errno::ECONNREFUSED | Errno::EHOSTUNREACH | Errno::ENETUNREACH)) => {
                // Outcomes in the asynchronous taxonomy are delivered
                // through the Connected event even when the OS reports
                // them at call time.
                state.phase = Phase::Connecting;
                self.inner.post_event(
                    &mut state,
                    task,
                    Event::Connected(Connected {
                        socket: self.inner.id,
                        tag,
                        result: Err(errno.into()),
                    }),
                );
                Ok(())
            }
            Err(errno) => {
                if created_here {
                    let _ = close(fd);
                    state.fd = None;
                }
                Err(errno.into())
            }
        }
    }

    /// Requests up to `region.len()` bytes. With `partial` set, the
    /// request completes as soon as at least one byte is available;
    /// otherwise only once the region is full, at end of input, or on
    /// error. UDP is the exception to the fill-the-region rule:
    /// datagrams are indivisible, so a request completes with exactly
    /// one datagram even when it is shorter than the region. Receives
    /// on one socket complete in issue order.
    pub fn recv(
        &self,
        region: Region,
        partial: bool,
        task: &Arc<Task>,
        tag: Tag,
    ) -> Result<(), Error> {
        assert!(!region.is_empty(), "recv with an empty region");
        let mut state = self.inner.state.lock().unwrap();
        match self.inner.kind {
            SocketKind::Udp => assert!(
                matches!(state.phase, Phase::Bound),
                "recv on an unbound UDP socket"
            ),
            SocketKind::Tcp => assert!(
                matches!(state.phase, Phase::Connecting | Phase::Connected),
                "recv on an unconnected TCP socket"
            ),
        }
        if state.read_shut_all
            || state.read_shut_tasks.contains(&task.id())
            || task.is_shutting_down()
        {
            return Err(Error::ShuttingDown);
        }
        state.recv_queue.push_back(RecvReq {
            task: task.clone(),
            tag,
            region,
            partial,
            filled: 0,
        });
        self.inner.manager.wake();
        Ok(())
    }

    /// Queues the entire region for transmission to the connected
    /// peer. With a tag of `None` no completion event is posted; such
    /// a send is also dropped, not flushed, if the last handle to the
    /// socket is released while it is still queued. Sends on one
    /// socket reach the wire in issue order.
    pub fn send(&self, region: Region, task: &Arc<Task>, tag: Option<Tag>) -> Result<(), Error> {
        assert_eq!(
            self.inner.kind,
            SocketKind::Tcp,
            "send with no destination on a UDP socket"
        );
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            matches!(state.phase, Phase::Connecting | Phase::Connected),
            "send on an unconnected TCP socket"
        );
        self.inner.enqueue_send(&mut state, region, None, task, tag)
    }

    /// Queues a datagram for transmission to `dest` on a bound UDP
    /// socket. Completion-tag semantics are as for [`Socket::send`].
    pub fn send_to(
        &self,
        region: Region,
        dest: SocketAddr,
        task: &Arc<Task>,
        tag: Option<Tag>,
    ) -> Result<(), Error> {
        assert_eq!(self.inner.kind, SocketKind::Udp, "send_to on a TCP socket");
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            matches!(state.phase, Phase::Bound),
            "send_to on an unbound UDP socket"
        );
        self.inner
            .enqueue_send(&mut state, region, Some(dest), task, tag)
    }

    /// The socket's local address.
    pub fn local_address(&self) -> Result<SocketAddr, Error> {
        let state = self.inner.state.lock().unwrap();
        let fd = state.fd.ok_or(Error::AddressNotAvailable)?;
        let storage = getsockname::<SockaddrStorage>(fd)?;
        storage_to_addr(&storage)
    }

    /// The address of the connected peer.
    pub fn peer_address(&self) -> Result<SocketAddr, Error> {
        let state = self.inner.state.lock().unwrap();
        let fd = state.fd.ok_or(Error::AddressNotAvailable)?;
        let storage = getpeername::<SockaddrStorage>(fd)?;
        storage_to_addr(&storage)
    }

    /// Shuts down the socket for one task (if `task` is given) or for
    /// every task using it.
    ///
    /// Shutting down reading purges the affected scope's pending
    /// receive requests and its queued-but-undelivered receive-done
    /// and new-connection events, rejects further receive requests
    /// from that scope, and silences a listener registered to an
    /// affected task. Shutting down writing suppresses the affected
    /// scope's send completions, abandons an in-scope in-flight
    /// connect, and rejects further sends; queued data still drains on
    /// the wire. On TCP, once a write shutdown leaves no scope still
    /// writing (whole-socket, or per-task with no other task's sends
    /// or connect outstanding), FIN is emitted after the queued data
    /// drains, not before.
    pub fn shutdown(&self, task: Option<&Arc<Task>>, how: ShutdownHow) {
        let mut state = self.inner.state.lock().unwrap();
        if how.covers_reading() {
            self.inner.shut_reading(&mut state, task);
        }
        if how.covers_writing() {
            self.inner.shut_writing(&mut state, task);
        }
    }
}

////////////////////////////////////////////////////////////////////////
// SOCKET STATE                                                       //
////////////////////////////////////////////////////////////////////////

/// The lifecycle phase of a socket. Transitions are monotonic; no
/// phase is ever re-entered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
}

/// A registered listener: the task and tag new-connection events are
/// posted with.
struct Listener {
    task: Arc<Task>,
    tag: Tag,
}

/// An in-flight asynchronous connect.
struct ConnectReq {
    task: Arc<Task>,
    tag: Tag,
}

/// An outstanding receive request.
struct RecvReq {
    task: Arc<Task>,
    tag: Tag,
    region: Region,
    partial: bool,
    filled: usize,
}

/// An outstanding send request. `tag` is stripped (suppressing the
/// completion event) when the issuing scope is shut down for writing
/// while the request is still queued.
struct SendReq {
    task: Arc<Task>,
    tag: Option<Tag>,
    region: Region,
    sent: usize,
    dest: Option<SocketAddr>,
}

/// The mutable state of a socket, behind the socket's own mutex.
pub(crate) struct SocketState {
    fd: Option<RawFd>,
    phase: Phase,
    held: bool,

    /// A whole-socket TCP write shutdown was requested while sends
    /// were still queued; emit FIN as soon as the queue drains.
    fin_pending: bool,

    read_shut_all: bool,
    write_shut_all: bool,
    read_shut_tasks: HashSet<crate::task::TaskId>,
    write_shut_tasks: HashSet<crate::task::TaskId>,
    listener: Option<Listener>,
    connecting: Option<ConnectReq>,
    recv_queue: VecDeque<RecvReq>,
    send_queue: VecDeque<SendReq>,
}

impl SocketState {
    fn new() -> Self {
        Self {
            fd: None,
            phase: Phase::Unbound,
            held: false,
            fin_pending: false,
            read_shut_all: false,
            write_shut_all: false,
            read_shut_tasks: HashSet::new(),
            write_shut_tasks: HashSet::new(),
            listener: None,
            connecting: None,
            recv_queue: VecDeque::new(),
            send_queue: VecDeque::new(),
        }
    }
}

/// The shared state behind every handle to one socket.
pub(crate) struct SocketInner {
    manager: Arc<Shared>,
    id: SocketId,
    kind: SocketKind,
    state: Mutex<SocketState>,
}

impl Drop for SocketInner {
    /// The last handle has been released: shut down both directions
    /// for all tasks, then release everything. Queued requests,
    /// including untagged sends, are dropped, not flushed.
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut affected: Vec<Arc<Task>> = Vec::new();
        for req in state.recv_queue.drain(..) {
            affected.push(req.task);
        }
        for req in state.send_queue.drain(..) {
            affected.push(req.task);
        }
        if let Some(listener) = state.listener.take() {
            affected.push(listener.task);
        }
        if let Some(connecting) = state.connecting.take() {
            affected.push(connecting.task);
        }
        dedup_tasks(&mut affected);
        for task in &affected {
            task.purge(self.id, ShutdownHow::All);
        }
        if let Some(fd) = state.fd.take() {
            let _ = close(fd);
        }
        self.manager.deregister(self.id);
    }
}

////////////////////////////////////////////////////////////////////////
// DISPATCH                                                           //
////////////////////////////////////////////////////////////////////////

/// The decision from attempting one receive.
enum RecvOutcome {
    /// Complete the front request with this result.
    Complete {
        result: Result<(), Error>,
        n: usize,
        address: Option<SocketAddr>,
    },

    /// Progress was made (or the call should simply be retried); try
    /// again immediately.
    Progress,

    /// The descriptor has nothing more to offer right now.
    WouldBlock,
}

/// The decision from attempting one send.
enum SendOutcome {
    Complete(Result<(), Error>),
    Progress,
    WouldBlock,
}

impl SocketInner {
    /// Computes the poll flags the dispatcher should watch this socket
    /// with, or [`None`] if it has no interest at the moment.
    pub(crate) fn poll_interest(&self) -> Option<(RawFd, PollFlags)> {
        let state = self.state.lock().unwrap();
        let fd = state.fd?;
        let mut flags = PollFlags::empty();
        if !state.read_shut_all {
            if !state.recv_queue.is_empty() {
                flags |= PollFlags::POLLIN;
            }
            if let Some(listener) = &state.listener {
                if !state.held && !state.read_shut_tasks.contains(&listener.task.id()) {
                    flags |= PollFlags::POLLIN;
                }
            }
        }
        if !state.send_queue.is_empty() || state.connecting.is_some() {
            flags |= PollFlags::POLLOUT;
        }
        if flags.is_empty() {
            None
        } else {
            Some((fd, flags))
        }
    }

    /// Services the socket after the dispatcher observed readiness.
    pub(crate) fn dispatch(&self, revents: PollFlags) {
        let mut state = self.state.lock().unwrap();
        let error_like =
            revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL);
        if revents.contains(PollFlags::POLLOUT) || error_like {
            self.connect_step(&mut state);
            self.send_step(&mut state);
        }
        if revents.contains(PollFlags::POLLIN) || error_like {
            self.accept_step(&mut state);
            self.recv_step(&mut state);
        }
    }

    /// Posts an event to `task`'s queue. The caller holds the socket
    /// state lock (witnessed by `_state`); the task lock is acquired
    /// inside. Every path that delivers an event goes through here, so
    /// the socket-before-task acquisition order cannot be inverted by
    /// a dispatch path.
    fn post_event(&self, _state: &mut SocketState, task: &Task, event: Event) {
        task.post(event);
    }

    /// Resolves an in-flight asynchronous connect once the descriptor
    /// signals writability.
    fn connect_step(&self, state: &mut SocketState) {
        let pending = match state.connecting.take() {
            Some(pending) => pending,
            None => return,
        };
        let fd = state.fd.unwrap();
        let result = match getsockopt(fd, sockopt::SocketError) {
            Ok(0) => {
                state.phase = Phase::Connected;
                Ok(())
            }
            Ok(code) => Err(Errno::from_i32(code).into()),
            Err(errno) => Err(errno.into()),
        };
        self.post_event(
            state,
            &pending.task,
            Event::Connected(Connected {
                socket: self.id,
                tag: pending.tag,
                result,
            }),
        );
    }

    /// Accepts as many completed connections as are available and
    /// posts a new-connection event for each.
    fn accept_step(&self, state: &mut SocketState) {
        if state.held || state.read_shut_all {
            return;
        }
        let (task, tag) = match &state.listener {
            Some(listener) => (listener.task.clone(), listener.tag),
            None => return,
        };
        // New-connection events are read-direction completions; a
        // per-task read shutdown of the listener task silences them
        // too.
        if state.read_shut_tasks.contains(&task.id()) {
            return;
        }
        let fd = match state.fd {
            Some(fd) => fd,
            None => return,
        };
        loop {
            match accept_one(fd) {
                Ok(newfd) => match adopt(&self.manager, newfd) {
                    Ok(socket) => self.post_event(
                        state,
                        &task,
                        Event::NewConnection(NewConnection {
                            listener: self.id,
                            tag,
                            socket,
                        }),
                    ),
                    Err(e) => {
                        error!("socket {}: cannot adopt accepted connection: {}", self.id, e);
                        return;
                    }
                },
                Err(Errno::EAGAIN) => return,
                Err(errno) => {
                    error!("socket {}: accept failed: {}", self.id, errno);
                    return;
                }
            }
        }
    }

    /// Services the receive queue while the descriptor is readable.
    fn recv_step(&self, state: &mut SocketState) {
        let fd = match state.fd {
            Some(fd) => fd,
            None => return,
        };
        loop {
            let outcome = match state.recv_queue.front_mut() {
                Some(req) => recv_once(self.kind, fd, req),
                None => return,
            };
            match outcome {
                RecvOutcome::Complete { result, n, address } => {
                    let req = state.recv_queue.pop_front().unwrap();
                    let task = req.task.clone();
                    self.post_event(
                        state,
                        &task,
                        Event::RecvDone(IoCompletion {
                            socket: self.id,
                            tag: req.tag,
                            result,
                            n,
                            region: req.region,
                            address,
                        }),
                    );
                }
                RecvOutcome::Progress => (),
                RecvOutcome::WouldBlock => return,
            }
        }
    }

    /// Services the send queue while the descriptor is writable, then
    /// emits a deferred FIN if a whole-socket write shutdown has
    /// drained.
    fn send_step(&self, state: &mut SocketState) {
        let fd = match state.fd {
            Some(fd) => fd,
            None => return,
        };
        while !state.send_queue.is_empty() {
            let outcome = send_once(fd, state.send_queue.front_mut().unwrap());
            match outcome {
                SendOutcome::Complete(result) => {
                    let req = state.send_queue.pop_front().unwrap();
                    if let Some(tag) = req.tag {
                        let task = req.task.clone();
                        self.post_event(
                            state,
                            &task,
                            Event::SendDone(IoCompletion {
                                socket: self.id,
                                tag,
                                result,
                                n: req.sent,
                                region: req.region,
                                address: None,
                            }),
                        );
                    }
                }
                SendOutcome::Progress => (),
                SendOutcome::WouldBlock => return,
            }
        }
        if state.fin_pending {
            state.fin_pending = false;
            let _ = sock_shutdown(fd, Shutdown::Write);
        }
    }

    /// Validates and queues a send request.
    fn enqueue_send(
        &self,
        state: &mut SocketState,
        region: Region,
        dest: Option<SocketAddr>,
        task: &Arc<Task>,
        tag: Option<Tag>,
    ) -> Result<(), Error> {
        assert!(!region.is_empty(), "send with an empty region");
        if state.write_shut_all
            || state.write_shut_tasks.contains(&task.id())
            || task.is_shutting_down()
        {
            return Err(Error::ShuttingDown);
        }
        state.send_queue.push_back(SendReq {
            task: task.clone(),
            tag,
            region,
            sent: 0,
            dest,
        });
        self.manager.wake();
        Ok(())
    }

    /// Shuts down the read direction for one task or for all.
    fn shut_reading(&self, state: &mut SocketState, task: Option<&Arc<Task>>) {
        let scope = task.map(|t| t.id());
        let mut affected: Vec<Arc<Task>> = Vec::new();
        state.recv_queue.retain(|req| {
            let in_scope = scope.map_or(true, |id| req.task.id() == id);
            if in_scope {
                affected.push(req.task.clone());
            }
            !in_scope
        });
        match task {
            Some(task) => {
                state.read_shut_tasks.insert(task.id());
                task.purge(self.id, ShutdownHow::Reading);
            }
            None => {
                state.read_shut_all = true;
                if let Some(listener) = &state.listener {
                    affected.push(listener.task.clone());
                }
                dedup_tasks(&mut affected);
                for task in &affected {
                    task.purge(self.id, ShutdownHow::Reading);
                }
            }
        }
    }

    /// Shuts down the write direction for one task or for all. Queued
    /// data still drains; only the completions are suppressed. An
    /// in-flight connect whose task falls in scope is abandoned: its
    /// Connected event is never posted.
    fn shut_writing(&self, state: &mut SocketState, task: Option<&Arc<Task>>) {
        let scope = task.map(|t| t.id());
        let mut affected: Vec<Arc<Task>> = Vec::new();
        for req in state.send_queue.iter_mut() {
            let in_scope = scope.map_or(true, |id| req.task.id() == id);
            if in_scope {
                req.tag = None;
                affected.push(req.task.clone());
            }
        }
        if state
            .connecting
            .as_ref()
            .map_or(false, |pending| {
                scope.map_or(true, |id| pending.task.id() == id)
            })
        {
            state.connecting = None;
        }
        match task {
            Some(task) => {
                state.write_shut_tasks.insert(task.id());
                task.purge(self.id, ShutdownHow::Writing);
            }
            None => {
                state.write_shut_all = true;
                dedup_tasks(&mut affected);
                for task in &affected {
                    task.purge(self.id, ShutdownHow::Writing);
                }
            }
        }
        // FIN once no scope is still writing: whole-socket shutdown,
        // or a per-task shutdown that leaves no other task's sends or
        // connect outstanding. Emitted only after queued data drains.
        if self.kind == SocketKind::Tcp && state.connecting.is_none() {
            let other_writers = !state.write_shut_all
                && state
                    .send_queue
                    .iter()
                    .any(|req| !state.write_shut_tasks.contains(&req.task.id()));
            if !other_writers {
                if state.send_queue.is_empty() {
                    if let Some(fd) = state.fd {
                        let _ = sock_shutdown(fd, Shutdown::Write);
                    }
                } else {
                    state.fin_pending = true;
                }
            }
        }
    }
}

impl fmt::Debug for SocketInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SocketInner({})", self.id)
    }
}

////////////////////////////////////////////////////////////////////////
// HELPERS                                                            //
////////////////////////////////////////////////////////////////////////

/// Creates a non-blocking, close-on-exec descriptor for the given kind
/// and address family.
fn create_fd(kind: SocketKind, addr: SocketAddr) -> Result<RawFd, Error> {
    let family = if addr.is_ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let (ty, protocol) = match kind {
        SocketKind::Udp => (SockType::Datagram, SockProtocol::Udp),
        SocketKind::Tcp => (SockType::Stream, SockProtocol::Tcp),
    };
    let fd = sock_new(family, ty, SockFlag::SOCK_CLOEXEC, protocol)?;
    if let Err(errno) = fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
        let _ = close(fd);
        return Err(errno.into());
    }
    Ok(fd)
}

/// Accepts one connection, retrying on interruption and on
/// connections aborted before we got to them, and marks the new
/// descriptor non-blocking.
fn accept_one(fd: RawFd) -> nix::Result<RawFd> {
    loop {
        match accept(fd) {
            Ok(newfd) => {
                if let Err(errno) = fcntl(newfd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
                    let _ = close(newfd);
                    return Err(errno);
                }
                return Ok(newfd);
            }
            Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
            Err(errno) => return Err(errno),
        }
    }
}

/// Wraps an accepted descriptor in a fully connected socket
/// registered with the manager. The descriptor is closed if
/// registration fails.
fn adopt(manager: &Arc<Shared>, fd: RawFd) -> Result<Socket, Error> {
    let mut state = SocketState::new();
    state.fd = Some(fd);
    state.phase = Phase::Connected;
    Socket::register(manager, SocketKind::Tcp, state).map_err(|e| {
        let _ = close(fd);
        e
    })
}

/// Attempts one receive against the front request.
fn recv_once(kind: SocketKind, fd: RawFd, req: &mut RecvReq) -> RecvOutcome {
    match kind {
        SocketKind::Udp => match recvfrom::<SockaddrStorage>(fd, req.region.as_mut_slice()) {
            Ok((n, src)) => RecvOutcome::Complete {
                result: Ok(()),
                n,
                address: src.as_ref().and_then(|storage| storage_to_addr(storage).ok()),
            },
            Err(Errno::EAGAIN) => RecvOutcome::WouldBlock,
            Err(Errno::EINTR) => RecvOutcome::Progress,
            Err(errno) => RecvOutcome::Complete {
                result: Err(errno.into()),
                n: 0,
                address: None,
            },
        },
        SocketKind::Tcp => {
            let filled = req.filled;
            match sock_recv(fd, &mut req.region.as_mut_slice()[filled..], MsgFlags::empty()) {
                Ok(0) => RecvOutcome::Complete {
                    result: Err(Error::EndOfFile),
                    n: filled,
                    address: None,
                },
                Ok(n) => {
                    req.filled += n;
                    if req.partial || req.filled == req.region.len() {
                        RecvOutcome::Complete {
                            result: Ok(()),
                            n: req.filled,
                            address: None,
                        }
                    } else {
                        RecvOutcome::Progress
                    }
                }
                Err(Errno::EAGAIN) => RecvOutcome::WouldBlock,
                Err(Errno::EINTR) => RecvOutcome::Progress,
                Err(errno) => RecvOutcome::Complete {
                    result: Err(errno.into()),
                    n: filled,
                    address: None,
                },
            }
        }
    }
}

/// Attempts one send against the front request.
fn send_once(fd: RawFd, req: &mut SendReq) -> SendOutcome {
    let sent = req.sent;
    let result = match req.dest {
        Some(dest) => sendto(
            fd,
            &req.region.as_slice()[sent..],
            &SockaddrStorage::from(dest),
            MsgFlags::MSG_NOSIGNAL,
        ),
        None => sock_send(fd, &req.region.as_slice()[sent..], MsgFlags::MSG_NOSIGNAL),
    };
    match result {
        Ok(n) => {
            req.sent += n;
            if req.sent == req.region.len() {
                SendOutcome::Complete(Ok(()))
            } else {
                SendOutcome::Progress
            }
        }
        Err(Errno::EAGAIN) => SendOutcome::WouldBlock,
        Err(Errno::EINTR) => SendOutcome::Progress,
        Err(errno) => SendOutcome::Complete(Err(errno.into())),
    }
}

/// Converts an OS-reported address into the supported representation.
fn storage_to_addr(storage: &SockaddrStorage) -> Result<SocketAddr, Error> {
    if let Some(sin) = storage.as_sockaddr_in() {
        Ok(SocketAddr::V4(std::net::SocketAddrV4::from(*sin)))
    } else if let Some(sin6) = storage.as_sockaddr_in6() {
        Ok(SocketAddr::V6(std::net::SocketAddrV6::from(*sin6)))
    } else {
        Err(Error::BufferTooSmall)
    }
}

/// Deduplicates a scratch list of tasks by identity.
fn dedup_tasks(tasks: &mut Vec<Arc<Task>>) {
    tasks.sort_by_key(|task| task.id());
    tasks.dedup_by_key(|task| task.id());
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::manager::SocketManager;

    const LOOPBACK_ANY: &str = "127.0.0.1:0";

    fn loopback() -> SocketAddr {
        LOOPBACK_ANY.parse().unwrap()
    }

    fn expect_event(task: &Arc<Task>, what: &str) -> Event {
        task.wait_next(Duration::from_secs(5))
            .unwrap_or_else(|| panic!("timed out waiting for {what}"))
    }

    /// Establishes a connected TCP pair through a temporary listener,
    /// returning (server side, client side).
    fn connected_pair(
        manager: &SocketManager,
        server_task: &Arc<Task>,
        client_task: &Arc<Task>,
    ) -> (Socket, Socket) {
        let listener = manager.create(SocketKind::Tcp).unwrap();
        listener.bind(loopback()).unwrap();
        listener.listen(8, server_task, 100).unwrap();
        let addr = listener.local_address().unwrap();

        let client = manager.create(SocketKind::Tcp).unwrap();
        client.connect(addr, client_task, 101).unwrap();

        let server_side = match expect_event(server_task, "new connection") {
            Event::NewConnection(n) => {
                assert_eq!(n.tag, 100);
                n.socket
            }
            other => panic!("unexpected event: {other:?}"),
        };
        match expect_event(client_task, "connected event") {
            Event::Connected(c) => assert_eq!(c.result, Ok(())),
            other => panic!("unexpected event: {other:?}"),
        }
        (server_side, client)
    }

    #[test]
    fn udp_datagram_round_trip_to_self() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();
        let socket = manager.create(SocketKind::Udp).unwrap();
        socket.bind(loopback()).unwrap();
        let addr = socket.local_address().unwrap();

        socket.recv(Region::new(10), false, &task, 1).unwrap();
        socket
            .send_to(Region::from(&b"0123456789"[..]), addr, &task, Some(2))
            .unwrap();

        let mut seen_recv = false;
        let mut seen_send = false;
        while !(seen_recv && seen_send) {
            match expect_event(&task, "datagram completion") {
                Event::RecvDone(c) => {
                    assert_eq!(c.tag, 1);
                    assert_eq!(c.result, Ok(()));
                    assert_eq!(c.n, 10);
                    assert_eq!(&c.region.as_slice()[..c.n], b"0123456789");
                    assert_eq!(c.address, Some(addr));
                    seen_recv = true;
                }
                Event::SendDone(c) => {
                    assert_eq!(c.tag, 2);
                    assert_eq!(c.result, Ok(()));
                    assert_eq!(c.n, 10);
                    seen_send = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        drop(socket);
        manager.destroy();
    }

    #[test]
    fn connect_refusal_arrives_in_the_connected_event() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();

        // Find a port with nothing listening behind it.
        let dead = {
            let placeholder = std::net::TcpListener::bind(LOOPBACK_ANY).unwrap();
            placeholder.local_addr().unwrap()
        };

        let socket = manager.create(SocketKind::Tcp).unwrap();
        socket.connect(dead, &task, 9).unwrap();
        match expect_event(&task, "connected event") {
            Event::Connected(c) => {
                assert_eq!(c.tag, 9);
                assert_eq!(c.result, Err(Error::ConnectionRefused));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(socket);
        manager.destroy();
    }

    #[test]
    fn tcp_establishment_addresses_and_transfer() {
        let manager = SocketManager::new().unwrap();
        let server_task = Task::new();
        let client_task = Task::new();
        let (server_side, client) = connected_pair(&manager, &server_task, &client_task);

        assert_eq!(
            server_side.peer_address().unwrap(),
            client.local_address().unwrap()
        );
        assert_eq!(
            client.peer_address().unwrap(),
            server_side.local_address().unwrap()
        );

        server_side
            .recv(Region::new(16), true, &server_task, 3)
            .unwrap();
        client
            .send(Region::from(&b"hello"[..]), &client_task, Some(2))
            .unwrap();

        match expect_event(&server_task, "receive completion") {
            Event::RecvDone(c) => {
                assert_eq!(c.tag, 3);
                assert_eq!(c.result, Ok(()));
                assert_eq!(&c.region.as_slice()[..c.n], b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match expect_event(&client_task, "send completion") {
            Event::SendDone(c) => {
                assert_eq!(c.tag, 2);
                assert_eq!(c.result, Ok(()));
                assert_eq!(c.n, 5);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(server_side);
        drop(client);
        manager.destroy();
    }

    #[test]
    fn receives_complete_in_issue_order() {
        let manager = SocketManager::new().unwrap();
        let server_task = Task::new();
        let client_task = Task::new();
        let (server_side, client) = connected_pair(&manager, &server_task, &client_task);

        for tag in 0..4 {
            server_side
                .recv(Region::new(4), false, &server_task, tag)
                .unwrap();
        }
        client
            .send(Region::from(vec![7u8; 16]), &client_task, Some(50))
            .unwrap();

        for expected in 0..4 {
            match expect_event(&server_task, "receive completion") {
                Event::RecvDone(c) => {
                    assert_eq!(c.tag, expected);
                    assert_eq!(c.result, Ok(()));
                    assert_eq!(c.n, 4);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        drop(server_side);
        drop(client);
        manager.destroy();
    }

    #[test]
    fn exact_receive_waits_for_a_full_region() {
        let manager = SocketManager::new().unwrap();
        let server_task = Task::new();
        let client_task = Task::new();
        let (server_side, client) = connected_pair(&manager, &server_task, &client_task);

        server_side
            .recv(Region::new(10), false, &server_task, 1)
            .unwrap();
        client
            .send(Region::from(&b"0123"[..]), &client_task, None)
            .unwrap();
        assert!(
            server_task.wait_next(Duration::from_millis(200)).is_none(),
            "exact receive completed before the region was full"
        );

        client
            .send(Region::from(&b"456789"[..]), &client_task, None)
            .unwrap();
        match expect_event(&server_task, "receive completion") {
            Event::RecvDone(c) => {
                assert_eq!(c.result, Ok(()));
                assert_eq!(c.n, 10);
                assert_eq!(c.region.as_slice(), b"0123456789");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(server_side);
        drop(client);
        manager.destroy();
    }

    #[test]
    fn peer_close_completes_receive_with_end_of_file() {
        let manager = SocketManager::new().unwrap();
        let server_task = Task::new();
        let client_task = Task::new();
        let (server_side, client) = connected_pair(&manager, &server_task, &client_task);

        server_side
            .recv(Region::new(8), false, &server_task, 1)
            .unwrap();
        client
            .send(Region::from(&b"abc"[..]), &client_task, Some(2))
            .unwrap();
        match expect_event(&client_task, "send completion") {
            Event::SendDone(c) => assert_eq!(c.result, Ok(())),
            other => panic!("unexpected event: {other:?}"),
        }
        drop(client);

        match expect_event(&server_task, "receive completion") {
            Event::RecvDone(c) => {
                assert_eq!(c.result, Err(Error::EndOfFile));
                assert_eq!(c.n, 3);
                assert_eq!(&c.region.as_slice()[..c.n], b"abc");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(server_side);
        manager.destroy();
    }

    #[test]
    fn read_shutdown_cancels_pending_and_rejects_new_receives() {
        let manager = SocketManager::new().unwrap();
        let server_task = Task::new();
        let client_task = Task::new();
        let (server_side, client) = connected_pair(&manager, &server_task, &client_task);

        server_side
            .recv(Region::new(4), true, &server_task, 1)
            .unwrap();
        server_side.shutdown(Some(&server_task), ShutdownHow::Reading);

        // Data arriving after the shutdown must produce no event for
        // the shut-down scope.
        client
            .send(Region::from(&b"data"[..]), &client_task, None)
            .unwrap();
        assert!(server_task.wait_next(Duration::from_millis(200)).is_none());

        assert_eq!(
            server_side.recv(Region::new(4), true, &server_task, 2),
            Err(Error::ShuttingDown)
        );

        drop(server_side);
        drop(client);
        manager.destroy();
    }

    #[test]
    fn held_listener_posts_no_new_connection_events() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();

        let listener = manager.create(SocketKind::Tcp).unwrap();
        listener.bind(loopback()).unwrap();
        listener.listen(8, &task, 0).unwrap();
        listener.hold();
        let addr = listener.local_address().unwrap();

        let stream = std::net::TcpStream::connect(addr).unwrap();
        assert!(
            task.wait_next(Duration::from_millis(300)).is_none(),
            "held listener delivered a new-connection event"
        );

        listener.unhold();
        match expect_event(&task, "new connection") {
            Event::NewConnection(n) => assert_eq!(n.listener, listener.id()),
            other => panic!("unexpected event: {other:?}"),
        }

        drop(stream);
        drop(listener);
        manager.destroy();
    }

    #[test]
    fn synchronous_accept_pulls_a_pending_connection() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();

        let listener = manager.create(SocketKind::Tcp).unwrap();
        listener.bind(loopback()).unwrap();
        listener.listen(8, &task, 0).unwrap();
        // Keep the dispatcher from winning the race for the pending
        // connection.
        listener.hold();
        let addr = listener.local_address().unwrap();

        assert_eq!(
            listener.accept().unwrap_err(),
            Error::NoPendingConnections
        );

        let stream = std::net::TcpStream::connect(addr).unwrap();
        let accepted = loop {
            match listener.accept() {
                Ok(socket) => break socket,
                Err(Error::NoPendingConnections) => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        assert_eq!(accepted.kind(), SocketKind::Tcp);
        assert_eq!(accepted.peer_address().unwrap(), stream.local_addr().unwrap());

        drop(stream);
        drop(accepted);
        listener.unhold();
        drop(listener);
        manager.destroy();
    }

    #[test]
    fn write_shutdown_half_closes_after_queued_sends_drain() {
        use std::io::Read;

        let manager = SocketManager::new().unwrap();
        let client_task = Task::new();

        let listener = std::net::TcpListener::bind(LOOPBACK_ANY).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = manager.create(SocketKind::Tcp).unwrap();
        client.connect(addr, &client_task, 0).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        match expect_event(&client_task, "connected event") {
            Event::Connected(c) => assert_eq!(c.result, Ok(())),
            other => panic!("unexpected event: {other:?}"),
        }

        client
            .send(Region::from(&b"fin after drain"[..]), &client_task, Some(1))
            .unwrap();
        client.shutdown(None, ShutdownHow::Writing);

        // read_to_end returns only once FIN arrives, and the queued
        // data must precede it.
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"fin after drain");

        // The write shutdown suppressed the completion event.
        assert!(client_task.wait_next(Duration::from_millis(200)).is_none());

        drop(client);
        manager.destroy();
    }

    #[test]
    fn untagged_sends_post_no_completion() {
        let manager = SocketManager::new().unwrap();
        let server_task = Task::new();
        let client_task = Task::new();
        let (server_side, client) = connected_pair(&manager, &server_task, &client_task);

        server_side
            .recv(Region::new(16), true, &server_task, 1)
            .unwrap();
        client
            .send(Region::from(&b"quiet"[..]), &client_task, None)
            .unwrap();

        match expect_event(&server_task, "receive completion") {
            Event::RecvDone(c) => assert_eq!(&c.region.as_slice()[..c.n], b"quiet"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(client_task.wait_next(Duration::from_millis(200)).is_none());

        drop(server_side);
        drop(client);
        manager.destroy();
    }

    #[test]
    fn per_task_read_shutdown_silences_the_listener() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();

        let listener = manager.create(SocketKind::Tcp).unwrap();
        listener.bind(loopback()).unwrap();
        listener.listen(8, &task, 0).unwrap();
        let addr = listener.local_address().unwrap();

        listener.shutdown(Some(&task), ShutdownHow::Reading);

        // The OS backlog still completes the handshake, but no event
        // may reach the shut-down task.
        let stream = std::net::TcpStream::connect(addr).unwrap();
        assert!(
            task.wait_next(Duration::from_millis(300)).is_none(),
            "new-connection event delivered after per-task read shutdown"
        );

        drop(stream);
        drop(listener);
        manager.destroy();
    }

    #[test]
    fn write_shutdown_suppresses_the_connected_event() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();

        let listener = std::net::TcpListener::bind(LOOPBACK_ANY).unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = manager.create(SocketKind::Tcp).unwrap();
        socket.connect(addr, &task, 1).unwrap();
        socket.shutdown(Some(&task), ShutdownHow::Writing);

        // Whether the connect was still in flight (registration
        // abandoned) or its event was already queued (purged), the
        // task must observe nothing.
        assert!(
            task.wait_next(Duration::from_millis(300)).is_none(),
            "connected event delivered after write shutdown"
        );

        drop(socket);
        manager.destroy();
    }

    #[test]
    fn per_task_write_shutdown_half_closes_when_no_writer_remains() {
        use std::io::Read;

        let manager = SocketManager::new().unwrap();
        let task = Task::new();

        let listener = std::net::TcpListener::bind(LOOPBACK_ANY).unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = manager.create(SocketKind::Tcp).unwrap();
        socket.connect(addr, &task, 0).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        match expect_event(&task, "connected event") {
            Event::Connected(c) => assert_eq!(c.result, Ok(())),
            other => panic!("unexpected event: {other:?}"),
        }

        socket
            .send(Region::from(&b"last words"[..]), &task, Some(1))
            .unwrap();
        match expect_event(&task, "send completion") {
            Event::SendDone(c) => assert_eq!(c.result, Ok(())),
            other => panic!("unexpected event: {other:?}"),
        }

        // The shut task was the only writer, so the per-task shutdown
        // half-closes the connection.
        socket.shutdown(Some(&task), ShutdownHow::Writing);
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"last words");

        drop(socket);
        manager.destroy();
    }

    #[test]
    fn udp_exact_receive_completes_with_a_short_datagram() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();
        let socket = manager.create(SocketKind::Udp).unwrap();
        socket.bind(loopback()).unwrap();
        let addr = socket.local_address().unwrap();

        socket.recv(Region::new(32), false, &task, 1).unwrap();
        socket
            .send_to(Region::from(&b"short"[..]), addr, &task, None)
            .unwrap();

        match expect_event(&task, "receive completion") {
            Event::RecvDone(c) => {
                assert_eq!(c.result, Ok(()));
                assert_eq!(c.n, 5);
                assert_eq!(&c.region.as_slice()[..c.n], b"short");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(socket);
        manager.destroy();
    }

    #[test]
    fn bind_to_an_address_in_use_has_no_observable_effect() {
        let manager = SocketManager::new().unwrap();
        let holder = std::net::UdpSocket::bind(LOOPBACK_ANY).unwrap();
        let addr = holder.local_addr().unwrap();

        let socket = manager.create(SocketKind::Udp).unwrap();
        assert_eq!(socket.bind(addr), Err(Error::AddressInUse));
        // The failed bind left the socket unbound, so binding again
        // works.
        socket.bind(loopback()).unwrap();

        drop(socket);
        drop(holder);
        manager.destroy();
    }

    #[test]
    #[should_panic(expected = "listen on a non-TCP socket")]
    fn listening_on_a_udp_socket_is_a_contract_violation() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();
        let socket = manager.create(SocketKind::Udp).unwrap();
        let _ = socket.listen(8, &task, 0);
    }

    #[test]
    #[should_panic(expected = "hold on a socket with no listener")]
    fn holding_without_a_listener_is_a_contract_violation() {
        let manager = SocketManager::new().unwrap();
        let socket = manager.create(SocketKind::Tcp).unwrap();
        socket.hold();
    }

    #[test]
    #[should_panic(expected = "hold on a socket that is already held")]
    fn double_hold_is_a_contract_violation() {
        let manager = SocketManager::new().unwrap();
        let task = Task::new();
        let socket = manager.create(SocketKind::Tcp).unwrap();
        socket.bind(loopback()).unwrap();
        socket.listen(8, &task, 0).unwrap();
        socket.hold();
        socket.hold();
    }
}
