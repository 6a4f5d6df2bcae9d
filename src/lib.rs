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

//! An event-driven, non-blocking socket layer.
//!
//! This crate treats sockets as *event sources*: instead of blocking in
//! read or write calls, a caller queues receive, send, connect, and
//! listen requests against a [`Socket`], naming the [`Task`] that
//! should learn the outcome. A [`SocketManager`]'s dispatcher thread
//! multiplexes readiness across every socket and posts exactly one
//! completion [`Event`] per request (untagged sends excepted) to the
//! requesting task's queue. This is the I/O architecture of a
//! single-process, event-driven network server: many endpoints, a
//! handful of threads, and no thread ever parked inside the kernel on
//! one connection's behalf.
//!
//! # Requests, regions, and completions
//!
//! I/O buffers travel as [`Region`]s: a region is moved *into* a
//! request and moved *back out* inside the completion event, so the
//! issuer cannot touch a buffer while the kernel-facing side may be
//! filling or draining it. Each request carries a caller-chosen
//! [`Tag`] that returns unchanged in its completion, letting one task
//! multiplex many outstanding requests.
//!
//! Receives come in two flavors: a *partial* receive completes as soon
//! as any data is available, while an *exact* receive completes only
//! once its whole region is filled (or input ends, or an error
//! occurs). On UDP, where datagrams are indivisible, a receive of
//! either flavor completes with exactly one datagram. Requests of the
//! same kind on one socket complete strictly in issue order.
//!
//! # Ownership and destruction
//!
//! [`Socket`] handles are reference counted: cloning attaches, dropping
//! detaches, and the drop of the last handle destroys the socket,
//! cancelling whatever I/O is still pending. There is no explicit
//! close. [`SocketManager::destroy`] blocks until every socket it
//! created has been released, so tearing down a server cannot race
//! in-flight I/O.
//!
//! # Locking
//!
//! Internally, each socket and each task serializes its state behind
//! its own lock, and every delivery path acquires them in one order:
//! socket first, then task, then the manager's records. Callers have
//! one obligation: do not invoke socket operations naming task T while
//! holding a lock that T's event-processing loop also takes, or
//! delivery to T can deadlock against the call.
//!
//! Only IPv4 and IPv6 endpoints (TCP and UDP) are supported, and only
//! on Unix platforms.

#![cfg(unix)]

pub mod error;
pub mod event;
pub mod manager;
pub mod region;
pub mod socket;
pub mod task;

pub use error::Error;
pub use event::{Connected, Event, IoCompletion, NewConnection, SocketId, Tag};
pub use manager::SocketManager;
pub use region::Region;
pub use socket::{ShutdownHow, Socket, SocketKind};
pub use task::{Task, TaskId};
