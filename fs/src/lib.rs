// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Filesystem-agnostic boundary trait.
//!
//! The core exposes a `path → entry` resolver plus byte-level file I/O
//! that an adapter wraps. Anything above this trait (a VFS layer, a FUSE
//! binding, a CLI) is out of scope for `fatrs_fat`; this crate only
//! defines the shape such an adapter is written against, indexed by
//! directory-entry index rather than by path so the adapter owns path
//! resolution and caching policy.

pub use fatrs_err::*;

use zerocopy::{FromBytes, Immutable, KnownLayout};

pub trait FileSystem {
    /// Lists the children of the directory at `index`, starting at `offset`
    /// entries in, packing as many [`Entry`] records as fit into `buffer`.
    /// Returns the number of bytes written.
    fn stat(&self, index: u64, offset: u64, buffer: &mut [u8]) -> Result<u64>;

    /// Reads up to `buffer.len()` bytes of the file at `index`, starting at
    /// byte `offset` within the file.
    fn read(&self, index: u64, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes `buffer` to the file at `index`, starting at byte `offset`.
    fn write(&self, index: u64, offset: u64, buffer: &[u8]) -> Result<()>;
}

/// One directory listing record, as packed into `stat`'s output buffer.
/// `name` is a variable-length trailing field; `name_length` gives its
/// valid prefix. Entries are padded to `u64` alignment so a buffer of
/// them can be walked without re-parsing a length-prefixed stream byte by
/// byte.
#[repr(C)]
#[derive(Debug, FromBytes, Immutable, KnownLayout)]
pub struct Entry {
    pub index: u64,
    pub data_length: u64,
    pub name_length: u8,
    pub name: [u8],
}
