//! The mounted volume: geometry, the directory arena, and a single
//! mutual-exclusion discipline -- one lock guarding the FAT and the arena
//! together, so a reader never observes a chain update half-applied
//! against a stale directory listing.
//!
//! `Volume<DS, ReadOnly>` and `Volume<DS, ReadWrite>` are the same struct
//! under a sealed capability marker: mutating methods are only ever
//! implemented on the `ReadWrite` instantiation, so opening a volume
//! read-only makes misuse of e.g. `create_file` a compile error instead of
//! a runtime one.

use std::sync::Mutex;

use log::warn;

use fatrs_ds::DataStorage;
use fatrs_err::{Error, FatError, Result};

use crate::boot_sector::{determine_fat_type, BootSector, BootSectorExt, SECTOR_SIZE};
use crate::datetime::{DosDateTime, Tz};
use crate::dir_entry::{attr, scan_directory_records, DirEntryNode, EntryId};
use crate::fat_table::FatTable;
use crate::short_name::{Encoding, ShortName};
use crate::types::FatType;

mod sealed {
    pub trait Sealed {}
}

pub trait VolumeMode: sealed::Sealed {}

#[derive(Debug)]
pub struct ReadOnly;
#[derive(Debug)]
pub struct ReadWrite;

impl sealed::Sealed for ReadOnly {}
impl sealed::Sealed for ReadWrite {}
impl VolumeMode for ReadOnly {}
impl VolumeMode for ReadWrite {}

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub encoding: Encoding,
    /// Byte offset of the volume within the backing device.
    pub offset: u64,
    pub preserve_case: bool,
    pub lazy_load: bool,
    pub tz: Tz,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Ibm437,
            offset: 0,
            preserve_case: false,
            lazy_load: true,
            tz: Tz::Utc,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    bytes_per_cluster: u32,
    first_data_sector: u32,
    root_dir_sector: u32,
    root_dir_sectors: u32,
    fat_offset_bytes: u64,
    fat_size_sectors: u32,
    num_fats: u8,
}

struct VolumeState {
    fat: FatTable,
    arena: Vec<DirEntryNode>,
    root_id: EntryId,
    dirty: bool,
    bpb_reserved1: u8,
}

pub struct Volume<DS: DataStorage, M: VolumeMode = ReadOnly> {
    device: DS,
    config: VolumeConfig,
    boot_sector: BootSector,
    fat_type: FatType,
    geometry: Geometry,
    state: Mutex<VolumeState>,
    _mode: std::marker::PhantomData<M>,
}

/// Dispatches to the right capability at runtime, for callers (CLI tools,
/// mount shims) that only know at runtime whether the volume should be
/// writable.
pub enum OpenedVolume<DS: DataStorage> {
    ReadOnly(Volume<DS, ReadOnly>),
    ReadWrite(Volume<DS, ReadWrite>),
}

pub fn open_fs<DS: DataStorage>(
    device: DS,
    config: VolumeConfig,
    read_only: bool,
) -> Result<OpenedVolume<DS>> {
    if read_only {
        Ok(OpenedVolume::ReadOnly(Volume::<DS, ReadOnly>::open(
            device, config,
        )?))
    } else {
        Ok(OpenedVolume::ReadWrite(Volume::<DS, ReadWrite>::open(
            device, config,
        )?))
    }
}

struct OpenCommon {
    boot_sector: BootSector,
    fat_type: FatType,
    geometry: Geometry,
    fat: FatTable,
    arena: Vec<DirEntryNode>,
    root_id: EntryId,
    bpb_reserved1: u8,
}

fn open_common<DS: DataStorage>(device: &DS, config: &VolumeConfig) -> Result<OpenCommon> {
    let mut sector = [0u8; SECTOR_SIZE];
    device.read(config.offset, &mut sector)?;
    let boot_sector = BootSector::parse(&sector)?;
    let fat_type = determine_fat_type(&boot_sector);

    let bytes_per_sector = boot_sector.common.bpb_bytspersec.get() as u32;
    let sectors_per_cluster = boot_sector.common.bpb_secperclus as u32;
    let rsvd = boot_sector.common.bpb_rsvdseccnt.get() as u32;
    let num_fats = boot_sector.common.bpb_numfats;
    let root_entry_cnt = boot_sector.common.bpb_rootentcnt.get() as u32;
    let fat_size_sectors = boot_sector.fat_size_sectors();

    let root_dir_sectors = (root_entry_cnt * 32).div_ceil(bytes_per_sector);
    let root_dir_sector = rsvd + num_fats as u32 * fat_size_sectors;
    let first_data_sector = root_dir_sector + root_dir_sectors;
    let bytes_per_cluster = bytes_per_sector * sectors_per_cluster;
    let fat_offset_bytes = config.offset + rsvd as u64 * bytes_per_sector as u64;

    let geometry = Geometry {
        bytes_per_sector,
        sectors_per_cluster,
        bytes_per_cluster,
        first_data_sector,
        root_dir_sector,
        root_dir_sectors,
        fat_offset_bytes,
        fat_size_sectors,
        num_fats,
    };

    let fat_bytes_len = fat_size_sectors as u64 * bytes_per_sector as u64;
    let mut copies = Vec::with_capacity(num_fats as usize);
    for i in 0..num_fats as u64 {
        let mut buf = vec![0u8; fat_bytes_len as usize];
        device.read(fat_offset_bytes + i * fat_bytes_len, &mut buf)?;
        copies.push(buf);
    }
    if copies.windows(2).any(|w| w[0] != w[1]) {
        warn!("the volume's {num_fats} FAT copies disagree; trusting copy 0");
    }
    let fat = FatTable::parse(&copies[0], fat_type)?;

    let bpb_reserved1_offset = config.offset + boot_sector.bs_reserved1_offset() as u64;
    let mut reserved1_buf = [0u8; 1];
    device.read(bpb_reserved1_offset, &mut reserved1_buf)?;
    let bpb_reserved1 = reserved1_buf[0];

    let (root_records, root_cluster) = match &boot_sector.ext {
        BootSectorExt::Fat32(e) => {
            let root_cluster = e.bpb_rootclus.get();
            let mut records = Vec::new();
            for c in fat.follow_chain(root_cluster) {
                let c = c?;
                let addr = cluster_address(c, &geometry, config.offset);
                let mut buf = vec![0u8; bytes_per_cluster as usize];
                device.read(addr, &mut buf)?;
                for chunk in buf.chunks_exact(32) {
                    records.push(<[u8; 32]>::try_from(chunk).unwrap());
                }
            }
            (records, root_cluster)
        }
        BootSectorExt::Fat1216(_) => {
            let addr = config.offset + root_dir_sector as u64 * bytes_per_sector as u64;
            let mut buf = vec![0u8; (root_dir_sectors * bytes_per_sector) as usize];
            device.read(addr, &mut buf)?;
            let mut records = Vec::new();
            for chunk in buf.chunks_exact(32) {
                records.push(<[u8; 32]>::try_from(chunk).unwrap());
            }
            (records, 0)
        }
    };

    let mut arena = vec![DirEntryNode::new_root()];
    let root_id = EntryId(0);
    arena[0].cluster = root_cluster;
    arena[0].materialised = true;

    let children: Vec<DirEntryNode> = scan_directory_records(&root_records)?
        .into_iter()
        .filter(|c| !c.is_special())
        .collect();
    for mut child in children {
        let id = EntryId(arena.len() as u32);
        child.parent = Some(root_id);
        arena.push(child);
        arena[0].children.push(id);
    }

    Ok(OpenCommon {
        boot_sector,
        fat_type,
        geometry,
        fat,
        arena,
        root_id,
        bpb_reserved1,
    })
}

fn cluster_address(cluster: u32, geometry: &Geometry, base_offset: u64) -> u64 {
    base_offset
        + ((cluster - 2) as u64 * geometry.sectors_per_cluster as u64
            + geometry.first_data_sector as u64)
            * geometry.bytes_per_sector as u64
}

impl<DS: DataStorage> Volume<DS, ReadOnly> {
    pub fn open(device: DS, config: VolumeConfig) -> Result<Self> {
        open_as(device, config)
    }
}

impl<DS: DataStorage> Volume<DS, ReadWrite> {
    pub fn open(device: DS, config: VolumeConfig) -> Result<Self> {
        open_as(device, config)
    }
}

fn open_as<DS: DataStorage, M: VolumeMode>(
    device: DS,
    config: VolumeConfig,
) -> Result<Volume<DS, M>> {
    let common = open_common(&device, &config)?;
    let mut volume = Volume {
        device,
        config,
        boot_sector: common.boot_sector,
        fat_type: common.fat_type,
        geometry: common.geometry,
        state: Mutex::new(VolumeState {
            fat: common.fat,
            arena: common.arena,
            root_id: common.root_id,
            dirty: false,
            bpb_reserved1: common.bpb_reserved1,
        }),
        _mode: std::marker::PhantomData,
    };
    if !volume.config.lazy_load {
        let root = volume.state.get_mut().unwrap().root_id;
        volume.materialise_all(root)?;
    }
    Ok(volume)
}

impl<DS: DataStorage, M: VolumeMode> Volume<DS, M> {
    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn root(&self) -> EntryId {
        self.state.lock().unwrap().root_id
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.geometry.bytes_per_cluster
    }

    fn cluster_address(&self, cluster: u32) -> u64 {
        cluster_address(cluster, &self.geometry, self.config.offset)
    }

    pub fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.geometry.bytes_per_cluster as usize];
        self.device.read(self.cluster_address(cluster), &mut buf)?;
        Ok(buf)
    }

    pub fn chain_of(&self, first_cluster: u32) -> Result<Vec<u32>> {
        if first_cluster == 0 {
            return Ok(Vec::new());
        }
        let state = self.state.lock().unwrap();
        state.fat.follow_chain(first_cluster).collect()
    }

    pub fn is_directory(&self, id: EntryId) -> bool {
        self.state.lock().unwrap().arena[id.0 as usize].is_directory()
    }

    pub fn is_volume_id(&self, id: EntryId) -> bool {
        self.state.lock().unwrap().arena[id.0 as usize].is_volume_id()
    }

    pub fn is_read_only_entry(&self, id: EntryId) -> bool {
        self.state.lock().unwrap().arena[id.0 as usize].is_read_only()
    }

    pub fn file_meta(&self, id: EntryId) -> Result<(u32, u64)> {
        let mut state = self.state.lock().unwrap();
        self.ensure_materialised(&mut state, id)?;
        let node = &state.arena[id.0 as usize];
        Ok((node.cluster, node.size()))
    }

    pub fn display_name(&self, id: EntryId) -> String {
        self.state.lock().unwrap().arena[id.0 as usize].display_name()
    }

    pub fn label(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let root = state.root_id;
        self.ensure_materialised(&mut state, root).ok()?;
        state.arena[root.0 as usize]
            .children
            .iter()
            .map(|&c| &state.arena[c.0 as usize])
            .find(|n| n.is_volume_id())
            .map(|n| n.get_short_name())
    }

    pub fn get_entry(&self, path: &str) -> Result<EntryId> {
        let mut state = self.state.lock().unwrap();
        let root = state.root_id;
        self.resolve(&mut state, root, path)
    }

    fn resolve(&self, state: &mut VolumeState, start: EntryId, path: &str) -> Result<EntryId> {
        let mut current = start;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.ensure_materialised(state, current)?;
            if !state.arena[current.0 as usize].is_directory() {
                return Err(Error::Fs(FatError::NotADir(
                    state.arena[current.0 as usize].get_short_name(),
                )));
            }
            let children = state.arena[current.0 as usize].children.clone();
            let mut found = children.iter().copied().find(|&c| {
                state.arena[c.0 as usize]
                    .long_name
                    .as_deref()
                    .map(|n| n.eq_ignore_ascii_case(segment))
                    .unwrap_or(false)
            });
            if found.is_none() {
                found = children
                    .iter()
                    .copied()
                    .find(|&c| state.arena[c.0 as usize].get_short_name().eq_ignore_ascii_case(segment));
            }
            current = found.ok_or_else(|| Error::Fs(FatError::NotFound(segment.to_string())))?;
        }
        Ok(current)
    }

    fn ensure_materialised(&self, state: &mut VolumeState, id: EntryId) -> Result<()> {
        if state.arena[id.0 as usize].materialised {
            return Ok(());
        }
        if !state.arena[id.0 as usize].is_directory() {
            state.arena[id.0 as usize].materialised = true;
            return Ok(());
        }
        let cluster = state.arena[id.0 as usize].cluster;
        let is_fixed_root =
            id == state.root_id && matches!(self.boot_sector.ext, BootSectorExt::Fat1216(_));

        let mut records = Vec::new();
        if is_fixed_root {
            let addr = self.config.offset
                + self.geometry.root_dir_sector as u64 * self.geometry.bytes_per_sector as u64;
            let mut buf =
                vec![0u8; (self.geometry.root_dir_sectors * self.geometry.bytes_per_sector) as usize];
            self.device.read(addr, &mut buf)?;
            for chunk in buf.chunks_exact(32) {
                records.push(<[u8; 32]>::try_from(chunk).unwrap());
            }
        } else {
            let chain: Vec<u32> = state.fat.follow_chain(cluster).collect::<Result<Vec<_>>>()?;
            for c in chain {
                let addr = self.cluster_address(c);
                let mut buf = vec![0u8; self.geometry.bytes_per_cluster as usize];
                self.device.read(addr, &mut buf)?;
                for chunk in buf.chunks_exact(32) {
                    records.push(<[u8; 32]>::try_from(chunk).unwrap());
                }
            }
        }

        let children: Vec<DirEntryNode> = scan_directory_records(&records)?
            .into_iter()
            .filter(|c| !c.is_special())
            .collect();
        for mut child in children {
            let child_id = EntryId(state.arena.len() as u32);
            child.parent = Some(id);
            state.arena.push(child);
            state.arena[id.0 as usize].children.push(child_id);
        }
        state.arena[id.0 as usize].materialised = true;
        Ok(())
    }

    fn materialise_all(&self, id: EntryId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.ensure_materialised(&mut state, id)?;
        let children = state.arena[id.0 as usize].children.clone();
        drop(state);
        for c in children {
            if self.is_directory(c) {
                self.materialise_all(c)?;
            }
        }
        Ok(())
    }

    pub fn walk(&self, start: EntryId) -> Result<Vec<(String, Vec<EntryId>, Vec<EntryId>)>> {
        let mut out = Vec::new();
        self.walk_rec(start, String::new(), &mut out)?;
        Ok(out)
    }

    fn walk_rec(
        &self,
        dir: EntryId,
        prefix: String,
        out: &mut Vec<(String, Vec<EntryId>, Vec<EntryId>)>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.ensure_materialised(&mut state, dir)?;
        let children = state.arena[dir.0 as usize].children.clone();
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for c in &children {
            let node = &state.arena[c.0 as usize];
            if node.is_special() || node.is_volume_id() {
                continue;
            }
            if node.is_directory() {
                dirs.push(*c);
            } else {
                files.push(*c);
            }
        }
        drop(state);
        out.push((prefix.clone(), dirs.clone(), files));
        for d in dirs {
            let name = self.display_name(d);
            self.walk_rec(d, format!("{prefix}/{name}"), out)?;
        }
        Ok(())
    }
}

impl<DS: DataStorage> Volume<DS, ReadWrite> {
    fn bpb_reserved1_addr(&self) -> u64 {
        self.config.offset + self.boot_sector.bs_reserved1_offset() as u64
    }

    fn mark_dirty_locked(&self, state: &mut VolumeState) -> Result<()> {
        if !state.dirty {
            state.fat.mark_dirty(&mut state.bpb_reserved1);
            self.device.write(self.bpb_reserved1_addr(), &[state.bpb_reserved1])?;
        }
        state.dirty = true;
        Ok(())
    }

    pub fn flush_fat(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        let bytes = state.fat.serialise();
        for i in 0..self.geometry.num_fats as u64 {
            let addr = self.geometry.fat_offset_bytes + i * bytes.len() as u64;
            self.device.write(addr, &bytes)?;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.dirty || state.fat.is_dirty(state.bpb_reserved1)
    }

    /// Flushes the FAT and marks the filesystem clean. Idempotent: a
    /// second call on an already-clean volume is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dirty && !state.fat.is_dirty(state.bpb_reserved1) {
            return Ok(());
        }
        let bytes = state.fat.serialise();
        for i in 0..self.geometry.num_fats as u64 {
            let addr = self.geometry.fat_offset_bytes + i * bytes.len() as u64;
            self.device.write(addr, &bytes)?;
        }
        {
            let VolumeState { fat, bpb_reserved1, .. } = &mut *state;
            fat.mark_clean(bpb_reserved1);
        }
        self.device
            .write(self.bpb_reserved1_addr(), &[state.bpb_reserved1])?;
        state.dirty = false;
        Ok(())
    }

    pub fn write_cluster(&self, cluster: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.geometry.bytes_per_cluster as usize {
            return Err(Error::Fs(FatError::InvalidArg));
        }
        self.device.write(self.cluster_address(cluster), data)?;
        Ok(())
    }

    pub fn allocate_bytes(&self, size: u64, erase: bool) -> Result<Vec<u32>> {
        let bpc = self.geometry.bytes_per_cluster as u64;
        let n = size.div_ceil(bpc).max(1) as usize;
        let mut state = self.state.lock().unwrap();
        let chain = state.fat.allocate(n)?;
        self.mark_dirty_locked(&mut state)?;
        drop(state);
        if erase {
            let zero = vec![0u8; bpc as usize];
            for &c in &chain {
                self.write_cluster(c, &zero)?;
            }
        }
        Ok(chain)
    }

    pub fn free_cluster_chain(&self, first: u32) -> Result<()> {
        if first == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        state.fat.free_chain(first)?;
        self.mark_dirty_locked(&mut state)
    }

    pub fn set_chain_eoc(&self, cluster: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let eoc = state.fat.fat_type().cluster_range().eoc_max;
        state.fat.set(cluster, eoc);
        self.mark_dirty_locked(&mut state)
    }

    /// Writes `data` to the chain starting at `first_cluster` (or a fresh
    /// chain, if `first_cluster == 0`), growing the chain when `extend` is
    /// set and `data` outgrows its current capacity. Returns the (possibly
    /// new) first cluster. Ported from `PyFat.py`'s `write_data_to_cluster`.
    pub fn write_data_to_cluster(
        &self,
        data: &[u8],
        first_cluster: u32,
        extend: bool,
        erase: bool,
    ) -> Result<u32> {
        let bpc = self.geometry.bytes_per_cluster as u64;
        let first_cluster = if first_cluster == 0 {
            let chain = self.allocate_bytes(data.len() as u64, false)?;
            chain[0]
        } else {
            first_cluster
        };

        let chain = self.chain_of(first_cluster)?;
        let capacity = chain.len() as u64 * bpc;
        if data.len() as u64 > capacity {
            if !extend {
                return Err(Error::Fs(FatError::NoSpace));
            }
            let extra = data.len() as u64 - capacity;
            let mut state = self.state.lock().unwrap();
            let new_clusters = state.fat.allocate(extra.div_ceil(bpc) as usize)?;
            let last = *chain.last().unwrap_or(&first_cluster);
            state.fat.set(last, new_clusters[0]);
            self.mark_dirty_locked(&mut state)?;
        }

        let mut payload = data.to_vec();
        if erase {
            let total_clusters = (payload.len() as u64).div_ceil(bpc).max(1) as usize;
            payload.resize(total_clusters * bpc as usize, 0);
        }

        let full_chain = self.chain_of(first_cluster)?;
        for (i, &c) in full_chain.iter().enumerate() {
            let start = i * bpc as usize;
            if start >= payload.len() {
                break;
            }
            let end = (start + bpc as usize).min(payload.len());
            let mut buf = vec![0u8; bpc as usize];
            buf[..end - start].copy_from_slice(&payload[start..end]);
            self.write_cluster(c, &buf)?;
        }
        Ok(first_cluster)
    }

    /// Serialises a directory's entries (synthesising `.`/`..` first, for
    /// any directory but the root) and writes them back to its storage.
    pub fn update_directory_entry(&self, dir_id: EntryId) -> Result<()> {
        let (is_root_fixed, cluster, bytes) = {
            let state = self.state.lock().unwrap();
            let node = &state.arena[dir_id.0 as usize];
            let mut bytes = Vec::new();
            if node.is_directory() && dir_id != state.root_id {
                let parent_cluster = node
                    .parent
                    .map(|p| state.arena[p.0 as usize].cluster)
                    .unwrap_or(0);
                bytes.extend_from_slice(&DirEntryNode::dot_record(node.cluster));
                bytes.extend_from_slice(&DirEntryNode::dotdot_record(parent_cluster));
            }
            for &child_id in &node.children {
                bytes.extend(state.arena[child_id.0 as usize].byte_repr()?);
            }
            let is_root_fixed = dir_id == state.root_id
                && matches!(self.boot_sector.ext, BootSectorExt::Fat1216(_));
            (is_root_fixed, node.cluster, bytes)
        };

        if is_root_fixed {
            let span = (self.geometry.root_dir_sectors * self.geometry.bytes_per_sector) as usize;
            if bytes.len() > span {
                return Err(Error::Fs(FatError::NoSpace));
            }
            let mut padded = bytes;
            padded.resize(span, 0);
            let addr = self.config.offset
                + self.geometry.root_dir_sector as u64 * self.geometry.bytes_per_sector as u64;
            self.device.write(addr, &padded)?;
        } else {
            self.write_data_to_cluster(&bytes, cluster, true, true)?;
        }

        let mut state = self.state.lock().unwrap();
        self.mark_dirty_locked(&mut state)
    }

    pub fn set_file_size(&self, id: EntryId, cluster: u32, size: u64) -> Result<()> {
        let parent = {
            let mut state = self.state.lock().unwrap();
            state.dirty = true;
            let node = &mut state.arena[id.0 as usize];
            node.cluster = cluster;
            node.size = size.min(crate::types::MAX_FILE_SIZE) as u32;
            node.wrt = DosDateTime::now(self.config.tz);
            node.parent
        };
        if let Some(parent) = parent {
            self.update_directory_entry(parent)?;
        }
        Ok(())
    }

    /// Picks the on-disk short name and, if needed, an attached long name
    /// for `name`. A name whose only divergence from its 8.3 form is case
    /// gets folded to uppercase with no long name unless `preserve_case`
    /// is set; any other divergence (length, characters, dot placement)
    /// always attaches a long name.
    fn derive_short_name(&self, name: &str, existing_short: &[String]) -> Result<(String, Option<String>)> {
        let upper = name.to_ascii_uppercase();
        if ShortName::is_8dot3_conformant(&upper) {
            let long_name = if self.config.preserve_case && name != upper {
                Some(name.to_string())
            } else {
                None
            };
            Ok((upper, long_name))
        } else {
            Ok((
                ShortName::make_8dot3_name(name, existing_short)?,
                Some(name.to_string()),
            ))
        }
    }

    fn create_entry(&self, parent: EntryId, name: &str, attr_bits: u8) -> Result<EntryId> {
        let mut state = self.state.lock().unwrap();
        self.ensure_materialised(&mut state, parent)?;
        if !state.arena[parent.0 as usize].is_directory() {
            return Err(Error::Fs(FatError::NotADir(
                state.arena[parent.0 as usize].get_short_name(),
            )));
        }
        for &c in &state.arena[parent.0 as usize].children {
            let node = &state.arena[c.0 as usize];
            let matches = node.get_short_name().eq_ignore_ascii_case(name)
                || node
                    .long_name
                    .as_deref()
                    .map(|n| n.eq_ignore_ascii_case(name))
                    .unwrap_or(false);
            if matches {
                return Err(Error::Fs(FatError::AlreadyExists(name.to_string())));
            }
        }

        let existing_short: Vec<String> = state.arena[parent.0 as usize]
            .children
            .iter()
            .map(|&c| state.arena[c.0 as usize].get_short_name())
            .collect();

        let (short_str, long_name) = self.derive_short_name(name, &existing_short)?;
        let short_name = ShortName::from_str(&short_str, self.config.encoding)?;
        let now = DosDateTime::now(self.config.tz);
        let mut node = DirEntryNode::new_named(short_name, long_name, attr_bits, now);
        node.parent = Some(parent);

        let id = EntryId(state.arena.len() as u32);
        state.arena.push(node);
        state.arena[parent.0 as usize].children.push(id);
        drop(state);
        self.update_directory_entry(parent)?;
        Ok(id)
    }

    pub fn create_file(&self, parent: EntryId, name: &str) -> Result<EntryId> {
        self.create_entry(parent, name, attr::ARCHIVE)
    }

    pub fn create_dir(&self, parent: EntryId, name: &str) -> Result<EntryId> {
        let id = self.create_entry(parent, name, attr::DIRECTORY)?;
        let chain = self.allocate_bytes(self.geometry.bytes_per_cluster as u64, true)?;
        let cluster = chain[0];
        {
            let mut state = self.state.lock().unwrap();
            state.arena[id.0 as usize].cluster = cluster;
            state.arena[id.0 as usize].materialised = true;
        }
        self.update_directory_entry(id)?;
        self.update_directory_entry(parent)?;
        Ok(id)
    }

    pub fn remove(&self, id: EntryId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if id == state.root_id {
            return Err(Error::Fs(FatError::RemoveRoot));
        }
        self.ensure_materialised(&mut state, id)?;
        if state.arena[id.0 as usize].is_directory() && !state.arena[id.0 as usize].children.is_empty()
        {
            return Err(Error::Fs(FatError::NotEmpty(
                state.arena[id.0 as usize].get_short_name(),
            )));
        }
        let parent = state.arena[id.0 as usize]
            .parent
            .expect("a non-root entry always has a parent");
        let cluster = state.arena[id.0 as usize].cluster;
        state.arena[parent.0 as usize].children.retain(|&c| c != id);
        drop(state);
        if cluster != 0 {
            self.free_cluster_chain(cluster)?;
        }
        self.update_directory_entry(parent)
    }

    pub fn rename(&self, id: EntryId, new_parent: EntryId, new_name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if id == state.root_id {
            return Err(Error::Fs(FatError::RemoveRoot));
        }
        self.ensure_materialised(&mut state, new_parent)?;
        let old_parent = state.arena[id.0 as usize]
            .parent
            .expect("a non-root entry always has a parent");

        let existing_short: Vec<String> = state.arena[new_parent.0 as usize]
            .children
            .iter()
            .filter(|&&c| c != id)
            .map(|&c| state.arena[c.0 as usize].get_short_name())
            .collect();
        let (short_str, long_name) = self.derive_short_name(new_name, &existing_short)?;

        state.arena[old_parent.0 as usize].children.retain(|&c| c != id);
        state.arena[id.0 as usize].short_name = ShortName::from_str(&short_str, self.config.encoding)?;
        state.arena[id.0 as usize].long_name = long_name;
        state.arena[id.0 as usize].parent = Some(new_parent);
        state.arena[new_parent.0 as usize].children.push(id);
        drop(state);

        self.update_directory_entry(old_parent)?;
        if new_parent != old_parent {
            self.update_directory_entry(new_parent)?;
        }
        Ok(())
    }
}

impl<DS: DataStorage> Drop for Volume<DS, ReadWrite> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to flush volume on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatrs_ds_std::FileDataStorage;

    fn format_small_fat12(path: &std::path::Path) {
        crate::format::format_volume(
            &FileDataStorage::create(path, 1_474_560).unwrap(),
            crate::format::FormatOptions {
                fat_type: Some(FatType::Fat12),
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn opens_a_freshly_formatted_volume_and_finds_an_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        format_small_fat12(&path);

        let storage = FileDataStorage::open(&path, true).unwrap();
        let volume = Volume::<_, ReadOnly>::open(storage, VolumeConfig::default()).unwrap();
        let root = volume.root();
        let listing = volume.walk(root).unwrap();
        assert_eq!(listing[0].1.len(), 0);
        assert_eq!(listing[0].2.len(), 0);
    }

    #[test]
    fn create_file_then_remove_round_trips_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        format_small_fat12(&path);

        let storage = FileDataStorage::open(&path, false).unwrap();
        let volume = Volume::<_, ReadWrite>::open(storage, VolumeConfig::default()).unwrap();
        let root = volume.root();
        let file = volume.create_file(root, "HELLO.TXT").unwrap();
        assert!(volume.get_entry("HELLO.TXT").is_ok());
        volume.remove(file).unwrap();
        assert!(volume.get_entry("HELLO.TXT").is_err());
    }

    #[test]
    fn long_names_get_a_generated_short_name_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        format_small_fat12(&path);

        let storage = FileDataStorage::open(&path, false).unwrap();
        let volume = Volume::<_, ReadWrite>::open(storage, VolumeConfig::default()).unwrap();
        let root = volume.root();
        let id = volume.create_file(root, "a long file name.txt").unwrap();
        assert_eq!(volume.display_name(id), "a long file name.txt");
        let found = volume.get_entry("a long file name.txt").unwrap();
        assert_eq!(found, id);
    }

    #[test]
    fn nonempty_directory_refuses_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        format_small_fat12(&path);

        let storage = FileDataStorage::open(&path, false).unwrap();
        let volume = Volume::<_, ReadWrite>::open(storage, VolumeConfig::default()).unwrap();
        let root = volume.root();
        let subdir = volume.create_dir(root, "SUB").unwrap();
        volume.create_file(subdir, "A.TXT").unwrap();
        assert!(matches!(
            volume.remove(subdir),
            Err(Error::Fs(FatError::NotEmpty(_)))
        ));
    }
}
