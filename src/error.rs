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

//! The result taxonomy surfaced across the socket layer's boundary.

use std::fmt;
use std::io;

use nix::errno::Errno;

/// An error reported by the socket layer.
///
/// Errors travel through two channels: as synchronous return values for
/// conditions detectable at call time, and inside the `result` field of
/// completion events for conditions only knowable once the operation
/// was attempted (see [`IoCompletion`](crate::IoCompletion) and
/// [`Connected`](crate::Connected)). Transport-level failures are
/// always reported through this type; they never panic. Precondition
/// violations (wrong socket kind, double hold, and the like) are caller
/// contract violations and *do* panic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The operating system could not allocate the needed resources.
    NoMemory,

    /// An OS-level error with no more specific mapping. The underlying
    /// errno is preserved.
    UnexpectedError(Errno),

    /// The requested address is not available on this host.
    AddressNotAvailable,

    /// The requested address is already in use.
    AddressInUse,

    /// The caller lacks permission for the requested binding.
    PermissionDenied,

    /// No completed connection was waiting to be accepted.
    NoPendingConnections,

    /// The remote host is unreachable.
    HostUnreachable,

    /// The remote network is unreachable.
    NetworkUnreachable,

    /// The peer refused the connection.
    ConnectionRefused,

    /// End of input. Receive completions carry this together with the
    /// number of bytes that *were* transferred before the end.
    EndOfFile,

    /// An address did not fit the supported address representation.
    BufferTooSmall,

    /// The request was refused because the matching scope (task,
    /// direction, or the whole manager) has been shut down.
    ShuttingDown,
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ENOMEM | Errno::ENOBUFS => Self::NoMemory,
            Errno::EADDRNOTAVAIL => Self::AddressNotAvailable,
            Errno::EADDRINUSE => Self::AddressInUse,
            Errno::EACCES | Errno::EPERM => Self::PermissionDenied,
            Errno::EHOSTUNREACH => Self::HostUnreachable,
            Errno::ENETUNREACH => Self::NetworkUnreachable,
            Errno::ECONNREFUSED => Self::ConnectionRefused,
            other => Self::UnexpectedError(other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Errno::from_i32(code).into(),
            None => Self::UnexpectedError(Errno::UnknownErrno),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoMemory => f.write_str("out of memory"),
            Self::UnexpectedError(errno) => write!(f, "unexpected error: {errno}"),
            Self::AddressNotAvailable => f.write_str("address not available"),
            Self::AddressInUse => f.write_str("address in use"),
            Self::PermissionDenied => f.write_str("permission denied"),
            Self::NoPendingConnections => f.write_str("no pending connections"),
            Self::HostUnreachable => f.write_str("host unreachable"),
            Self::NetworkUnreachable => f.write_str("network unreachable"),
            Self::ConnectionRefused => f.write_str("connection refused"),
            Self::EndOfFile => f.write_str("end of file"),
            Self::BufferTooSmall => f.write_str("address buffer too small"),
            Self::ShuttingDown => f.write_str("shutting down"),
        }
    }
}

impl std::error::Error for Error {}
