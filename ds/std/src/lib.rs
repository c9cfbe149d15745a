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

//! `std::fs::File`-backed [`DataStorage`], for mounting a raw disk image or
//! a block device node that is already visible as a file.
//!
//! Uses positional I/O (`pread`/`pwrite` via [`FileExt`]) rather than
//! seek-then-read/write, so `&self` is enough: no interior-mutability lock
//! is needed at this layer, the file's cursor is never shared state. The
//! [`fatrs_fat::Volume`](../fatrs_fat/struct.Volume.html) built on top
//! still serialises logically-related operations with its own lock; this
//! type only needs to make individual reads/writes safe to issue
//! concurrently, which positional I/O already guarantees.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use fatrs_ds::{DataStorage, Result};

pub struct FileDataStorage {
    file: File,
    /// Byte offset into the file where the FAT volume begins -- lets a
    /// single image file hold the volume at a partition offset rather
    /// than at byte 0.
    base_offset: u64,
}

impl FileDataStorage {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        Self::open_at(path, read_only, 0)
    }

    pub fn open_at(path: impl AsRef<Path>, read_only: bool, base_offset: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self { file, base_offset })
    }

    pub fn create(path: impl AsRef<Path>, size_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size_bytes)?;
        Ok(Self {
            file,
            base_offset: 0,
        })
    }
}

impl DataStorage for FileDataStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buffer, self.base_offset + offset)?;
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buffer, self.base_offset + offset)?;
        Ok(())
    }

    fn size(&self) -> Result<Option<u64>> {
        let len = self.file.metadata()?.len();
        Ok(Some(len.saturating_sub(self.base_offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let storage = FileDataStorage::create(&path, 4096).unwrap();

        storage.write(512, b"hello").unwrap();
        let mut buf = [0u8; 5];
        storage.read(512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(storage.size().unwrap(), Some(4096));
    }

    #[test]
    fn honours_a_nonzero_base_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        {
            let storage = FileDataStorage::create(&path, 8192).unwrap();
            storage.write(0, &[0xAAu8; 8192]).unwrap();
        }
        let storage = FileDataStorage::open_at(&path, false, 4096).unwrap();
        storage.write(0, b"partition").unwrap();

        let direct = FileDataStorage::open(&path, true).unwrap();
        let mut buf = [0u8; 9];
        direct.read(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"partition");
    }

    #[test]
    fn read_only_storage_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        FileDataStorage::create(&path, 512).unwrap();

        let storage = FileDataStorage::open(&path, true).unwrap();
        assert!(storage.write(0, b"x").is_err());
    }
}
