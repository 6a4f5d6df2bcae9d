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

//! Byte-buffer regions used as I/O request and completion payloads.

use std::fmt;

/// An owned byte buffer handed to the socket layer with a request and
/// handed back inside the matching completion event.
///
/// A `Region` is moved into [`Socket::recv`](crate::Socket::recv) and
/// [`Socket::send`](crate::Socket::send) calls and moved back out in
/// the [`IoCompletion`](crate::IoCompletion) posted when the request
/// finishes. The transfer may be performed by a different thread than
/// the one that issued the request, so the issuer must not touch the
/// buffer while the request is outstanding; moving ownership makes
/// that impossible rather than merely forbidden.
pub struct Region {
    bytes: Box<[u8]>,
}

impl Region {
    /// Creates a zero-filled region of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len].into_boxed_slice(),
        }
    }

    /// The length of the region in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The region's bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The region's bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Consumes the region, returning the underlying buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.into_vec()
    }
}

impl From<Vec<u8>> for Region {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }
}

impl From<&[u8]> for Region {
    fn from(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Region({} bytes)", self.bytes.len())
    }
}
