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

//! Completion events posted to task event queues.

use std::fmt;
use std::net::SocketAddr;

use crate::error::Error;
use crate::region::Region;
use crate::socket::{ShutdownHow, Socket};

/// An opaque completion tag chosen by the caller when issuing a
/// request and carried unchanged in the matching completion event.
pub type Tag = u64;

/// Identifies the socket that produced an event. Informational: the
/// identity is stable for the life of the socket, but may be reused
/// after the socket is destroyed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SocketId(pub(crate) usize);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A completion event.
///
/// Exactly one event is posted per satisfied or failed request (except
/// for untagged sends, which post none), and events are never mutated
/// after posting. Requests of the same kind on one socket complete in
/// the order they were issued; no order is guaranteed between receive
/// and send completions, nor across sockets.
#[derive(Debug)]
pub enum Event {
    /// A receive request finished.
    RecvDone(IoCompletion),

    /// A send request finished.
    SendDone(IoCompletion),

    /// A listening socket accepted a new connection.
    NewConnection(NewConnection),

    /// An asynchronous connect finished, successfully or not.
    Connected(Connected),
}

impl Event {
    /// The socket that produced this event.
    pub fn socket(&self) -> SocketId {
        match self {
            Self::RecvDone(c) | Self::SendDone(c) => c.socket,
            Self::NewConnection(n) => n.listener,
            Self::Connected(c) => c.socket,
        }
    }

    /// Whether this event falls within the cancellation scope of a
    /// shutdown of `socket` in direction `how`. Receive and
    /// new-connection events belong to the read direction; send and
    /// connected events to the write direction.
    pub(crate) fn matches_scope(&self, socket: SocketId, how: ShutdownHow) -> bool {
        if self.socket() != socket {
            return false;
        }
        match self {
            Self::RecvDone(_) | Self::NewConnection(_) => how.covers_reading(),
            Self::SendDone(_) | Self::Connected(_) => how.covers_writing(),
        }
    }
}

/// The payload of a receive-done or send-done event.
#[derive(Debug)]
pub struct IoCompletion {
    /// The socket the request was issued against.
    pub socket: SocketId,

    /// The caller's completion tag.
    pub tag: Tag,

    /// `Ok(())` on success; [`Error::EndOfFile`] when the transport
    /// reached end of input, possibly after a partial transfer; any
    /// other error if the operation failed outright.
    pub result: Result<(), Error>,

    /// The number of bytes actually transferred.
    pub n: usize,

    /// The region supplied with the request, returned to the caller.
    pub region: Region,

    /// The source address, for receives on unconnected (UDP) sockets.
    pub address: Option<SocketAddr>,
}

/// The payload of a new-connection event.
pub struct NewConnection {
    /// The listening socket that accepted the connection.
    pub listener: SocketId,

    /// The tag registered with [`Socket::listen`](crate::Socket::listen).
    pub tag: Tag,

    /// The freshly created, already-connected socket. The recipient
    /// owns this reference.
    pub socket: Socket,
}

impl fmt::Debug for NewConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NewConnection")
            .field("listener", &self.listener)
            .field("tag", &self.tag)
            .field("socket", &self.socket.id())
            .finish()
    }
}

/// The payload of a connected event.
#[derive(Debug)]
pub struct Connected {
    /// The socket the connect was issued against.
    pub socket: SocketId,

    /// The caller's completion tag.
    pub tag: Tag,

    /// The outcome of the connection attempt. Asynchronously detected
    /// failures ([`Error::HostUnreachable`], [`Error::NetworkUnreachable`],
    /// [`Error::ConnectionRefused`]) are only ever reported here, never
    /// as a synchronous return value of `connect`.
    pub result: Result<(), Error>,
}
