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

//! A read/write FAT12/16/32 engine with VFAT long-file-name support.
//!
//! [`volume::Volume`] mounts a [`fatrs_ds::DataStorage`]-backed device and
//! exposes a directory arena plus cluster-chain bookkeeping; [`file::FileHandle`]
//! layers byte-range read/write/seek/truncate over that on top; [`format::format_volume`]
//! lays down a fresh FAT12/16/32 filesystem on a blank device.

pub mod boot_sector;
pub mod datetime;
pub mod dir_entry;
pub mod fat_table;
pub mod file;
pub mod format;
pub mod short_name;
pub mod types;
pub mod volume;

pub use fatrs_err::{Error, FatError, Result};

pub use boot_sector::{BootSector, SECTOR_SIZE};
pub use datetime::{DosDate, DosDateTime, DosTime, Tz};
pub use dir_entry::EntryId;
pub use fat_table::FatTable;
pub use file::{FileHandle, OpenOptions};
pub use format::{format_volume, FormatOptions};
pub use short_name::{Encoding, ShortName};
pub use types::{ClusterIdx, FatType};
pub use volume::{open_fs, OpenedVolume, ReadOnly, ReadWrite, Volume, VolumeConfig, VolumeMode};
