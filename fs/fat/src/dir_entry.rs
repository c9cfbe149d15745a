//! On-disk directory records, the VFAT long-name sub-protocol, and the
//! in-memory arena directory tree: cyclic parent/child references are
//! replaced with index handles into a flat arena.
//!
//! The LFN chain-assembly state machine and the 0xE5/0x05 kanji handling
//! are grounded on `pyfatfs/FATDirectoryEntry.py`'s directory scan; its
//! exception-driven control flow is replaced here with a tagged enum.

use zerocopy::{little_endian::U16, little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use fatrs_err::{Error, FatError, Result};

use crate::datetime::{DosDate, DosDateTime, DosTime};
use crate::short_name::{checksum_bytes, ShortName};

pub mod attr {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;
    pub const LONG_NAME: u8 = READ_ONLY | HIDDEN | SYSTEM | VOLUME_ID;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawDirEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub ntres: u8,
    pub crttimetenth: u8,
    pub crttime: U16,
    pub crtdate: U16,
    pub lstaccdate: U16,
    pub fstclushi: U16,
    pub wrttime: U16,
    pub wrtdate: U16,
    pub fstcluslo: U16,
    pub filesize: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawLongDirEntry {
    pub ord: u8,
    pub name1: [U16; 5],
    pub attr: u8,
    pub entry_type: u8,
    pub chksum: u8,
    pub name2: [U16; 6],
    pub fstcluslo: U16,
    pub name3: [U16; 2],
}

/// What a freshly-read 32-byte directory slot turned out to be, replacing
/// the exception-based dispatch the Python source uses to tell these
/// apart.
pub enum RawRecord {
    Entry(RawDirEntry),
    FreeSlot,
    LastSlot,
    LfnFragment(RawLongDirEntry),
}

pub fn parse_raw_record(bytes: &[u8; 32]) -> Result<RawRecord> {
    match bytes[0] {
        0x00 => Ok(RawRecord::LastSlot),
        0xE5 => Ok(RawRecord::FreeSlot),
        _ => {
            let attr = bytes[11];
            if attr == attr::LONG_NAME {
                RawLongDirEntry::read_from_bytes(bytes)
                    .map(RawRecord::LfnFragment)
                    .map_err(|_| Error::Fs(FatError::Corrupt("truncated LFN record".into())))
            } else {
                RawDirEntry::read_from_bytes(bytes)
                    .map(RawRecord::Entry)
                    .map_err(|_| Error::Fs(FatError::Corrupt("truncated directory entry".into())))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub u32);

/// One directory entry, materialised in the arena. `children`/`parent`
/// form the tree via [`EntryId`] handles rather than owned/`Rc` pointers,
/// so the arena (`Vec<DirEntryNode>`) can be grown and indexed freely
/// without any interior-mutability plumbing of its own -- that's left to
/// the [`crate::volume::Volume`] that owns the arena under its lock.
#[derive(Debug, Clone)]
pub struct DirEntryNode {
    pub short_name: ShortName,
    pub long_name: Option<String>,
    pub attr: u8,
    pub ntres: u8,
    pub crt_time_tenth: u8,
    pub crt: DosDateTime,
    pub lst_acc_date: DosDate,
    pub wrt: DosDateTime,
    pub cluster: u32,
    pub size: u32,
    pub parent: Option<EntryId>,
    pub children: Vec<EntryId>,
    /// Whether this directory's children have been read from disk yet;
    /// always `true` for files.
    pub materialised: bool,
}

impl DirEntryNode {
    pub fn from_raw(raw: RawDirEntry, long_name: Option<String>) -> Self {
        let short_name = unsafe_short_name_from_raw(raw.name);

        let cluster = ((raw.fstclushi.get() as u32) << 16) | raw.fstcluslo.get() as u32;
        Self {
            short_name,
            long_name,
            attr: raw.attr,
            ntres: raw.ntres,
            crt_time_tenth: raw.crttimetenth,
            crt: DosDateTime {
                date: DosDate(raw.crtdate.get()),
                time: DosTime(raw.crttime.get()),
                time_tenth: raw.crttimetenth,
            },
            lst_acc_date: DosDate(raw.lstaccdate.get()),
            wrt: DosDateTime {
                date: DosDate(raw.wrtdate.get()),
                time: DosTime(raw.wrttime.get()),
                time_tenth: 0,
            },
            cluster,
            size: raw.filesize.get(),
            parent: None,
            children: Vec::new(),
            materialised: false,
        }
    }

    pub fn new_root() -> Self {
        Self {
            short_name: unsafe_short_name_from_raw([b' '; 11]),
            long_name: None,
            attr: attr::DIRECTORY,
            ntres: 0,
            crt_time_tenth: 0,
            crt: DosDateTime::epoch(),
            lst_acc_date: DosDate(0x0021),
            wrt: DosDateTime::epoch(),
            cluster: 0,
            size: 0,
            parent: None,
            children: Vec::new(),
            materialised: false,
        }
    }

    pub fn new_named(name: ShortName, long_name: Option<String>, attr: u8, when: DosDateTime) -> Self {
        Self {
            short_name: name,
            long_name,
            attr,
            ntres: 0,
            crt_time_tenth: when.time_tenth,
            crt: when,
            lst_acc_date: when.date,
            wrt: when,
            cluster: 0,
            size: 0,
            parent: None,
            children: Vec::new(),
            materialised: true,
        }
    }

    pub fn to_raw(&self) -> RawDirEntry {
        RawDirEntry {
            name: self.short_name.byte_repr(),
            attr: self.attr,
            ntres: self.ntres,
            crttimetenth: self.crt_time_tenth,
            crttime: U16::new(self.crt.time.0),
            crtdate: U16::new(self.crt.date.0),
            lstaccdate: U16::new(self.lst_acc_date.0),
            fstclushi: U16::new((self.cluster >> 16) as u16),
            wrttime: U16::new(self.wrt.time.0),
            wrtdate: U16::new(self.wrt.date.0),
            fstcluslo: U16::new(self.cluster as u16),
            filesize: U32::new(self.size),
        }
    }

    /// The full on-disk byte sequence for this entry: its LFN chain (if
    /// any), highest-ordinal record first, followed by the 32-byte short
    /// entry.
    pub fn byte_repr(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(long_name) = &self.long_name {
            for record in encode_lfn(long_name, &self.short_name)? {
                out.extend_from_slice(record.as_bytes());
            }
        }
        out.extend_from_slice(self.to_raw().as_bytes());
        Ok(out)
    }

    pub fn dot_record(cluster: u32) -> [u8; 32] {
        Self::special_record(".", cluster)
    }

    pub fn dotdot_record(cluster: u32) -> [u8; 32] {
        Self::special_record("..", cluster)
    }

    fn special_record(name: &str, cluster: u32) -> [u8; 32] {
        let mut name_bytes = [b' '; 11];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        let raw = RawDirEntry {
            name: name_bytes,
            attr: attr::DIRECTORY,
            ntres: 0,
            crttimetenth: 0,
            crttime: U16::new(0),
            crtdate: U16::new(0),
            lstaccdate: U16::new(0),
            fstclushi: U16::new((cluster >> 16) as u16),
            wrttime: U16::new(0),
            wrtdate: U16::new(0),
            fstcluslo: U16::new(cluster as u16),
            filesize: U32::new(0),
        };
        let mut out = [0u8; 32];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn is_read_only(&self) -> bool {
        self.attr & attr::READ_ONLY != 0
    }
    pub fn is_hidden(&self) -> bool {
        self.attr & attr::HIDDEN != 0
    }
    pub fn is_system(&self) -> bool {
        self.attr & attr::SYSTEM != 0
    }
    pub fn is_volume_id(&self) -> bool {
        self.attr & attr::VOLUME_ID != 0
    }
    pub fn is_directory(&self) -> bool {
        self.attr & attr::DIRECTORY != 0
    }
    pub fn is_archive(&self) -> bool {
        self.attr & attr::ARCHIVE != 0
    }

    pub fn is_special(&self) -> bool {
        let n = self.short_name.unpadded();
        n == "." || n == ".."
    }

    pub fn get_short_name(&self) -> String {
        self.short_name.unpadded()
    }

    pub fn get_long_name(&self) -> Result<&str> {
        self.long_name
            .as_deref()
            .ok_or(Error::Fs(FatError::NoLongName))
    }

    /// The name to display: the long name when present, else the short
    /// name.
    pub fn display_name(&self) -> String {
        self.long_name.clone().unwrap_or_else(|| self.get_short_name())
    }

    /// File size in bytes, or a synthetic size (32 bytes per directory
    /// entry) for directories, which don't carry a meaningful
    /// `DIR_FileSize` of their own.
    pub fn size(&self) -> u64 {
        if self.is_directory() {
            self.children.len() as u64 * 32
        } else {
            self.size as u64
        }
    }
}

/// `ShortName` has no public all-bytes constructor -- every other caller
/// goes through validation -- but the directory scanner needs one for
/// bytes it has already read off disk. Kept as a crate-local escape hatch
/// rather than widening `ShortName`'s public API for one caller.
fn unsafe_short_name_from_raw(bytes: [u8; 11]) -> ShortName {
    match ShortName::from_bytes(&bytes) {
        Ok(crate::short_name::SlotKind::Entry(name)) => name,
        _ => {
            // bytes[0] is never 0x00/0xE5 here since the caller already
            // dispatched on that in `parse_raw_record`/`special_record`.
            unreachable!("raw directory bytes were not a short-name entry")
        }
    }
}

/// Encodes `long_name` as a chain of [`RawLongDirEntry`] records bound to
/// `short`'s checksum, highest ordinal first (on-disk order).
pub fn encode_lfn(long_name: &str, short: &ShortName) -> Result<Vec<RawLongDirEntry>> {
    let units: Vec<u16> = long_name.encode_utf16().collect();
    if units.len() > 255 {
        return Err(Error::Fs(FatError::NameTooLong));
    }
    let mut padded = units;
    if !padded.is_empty() && padded.len() % 13 != 0 {
        padded.push(0x0000);
        while padded.len() % 13 != 0 {
            padded.push(0xFFFF);
        }
    } else if padded.is_empty() {
        padded.push(0x0000);
        padded.resize(13, 0xFFFF);
    }

    let checksum = checksum_bytes(&short.byte_repr());
    let n_records = padded.len() / 13;
    let mut records = Vec::with_capacity(n_records);
    for i in 0..n_records {
        let group = &padded[i * 13..(i + 1) * 13];
        let mut ord = (i as u8) + 1;
        if i == n_records - 1 {
            ord |= 0x40;
        }
        records.push(RawLongDirEntry {
            ord,
            name1: [
                U16::new(group[0]),
                U16::new(group[1]),
                U16::new(group[2]),
                U16::new(group[3]),
                U16::new(group[4]),
            ],
            attr: attr::LONG_NAME,
            entry_type: 0,
            chksum: checksum,
            name2: [
                U16::new(group[5]),
                U16::new(group[6]),
                U16::new(group[7]),
                U16::new(group[8]),
                U16::new(group[9]),
                U16::new(group[10]),
            ],
            fstcluslo: U16::new(0),
            name3: [U16::new(group[11]), U16::new(group[12])],
        });
    }
    records.reverse();
    Ok(records)
}

/// Reconstructs a long name from its chain, given highest-ordinal-first
/// (on-disk) order.
pub fn decode_lfn(records_disk_order: &[RawLongDirEntry]) -> Result<String> {
    let mut units: Vec<u16> = Vec::new();
    for rec in records_disk_order.iter().rev() {
        units.extend(rec.name1.iter().map(|u| u.get()));
        units.extend(rec.name2.iter().map(|u| u.get()));
        units.extend(rec.name3.iter().map(|u| u.get()));
    }
    if let Some(pos) = units.iter().position(|&u| u == 0x0000) {
        units.truncate(pos);
    } else {
        while units.last() == Some(&0xFFFF) {
            units.pop();
        }
    }
    String::from_utf16(&units)
        .map_err(|_| Error::Fs(FatError::Corrupt("long name is not valid UTF-16".into())))
}

/// Scans a flat run of 32-byte directory records, assembling LFN chains
/// and emitting one [`DirEntryNode`] per short entry. Stops at the first
/// `LastSlot`. `"."`/`".."` are filtered by the caller, not here, since
/// some callers (disk formatting) want to see them.
pub fn scan_directory_records(records: &[[u8; 32]]) -> Result<Vec<DirEntryNode>> {
    let mut out = Vec::new();
    let mut chain: Vec<RawLongDirEntry> = Vec::new();
    for raw in records {
        match parse_raw_record(raw)? {
            RawRecord::LastSlot => break,
            RawRecord::FreeSlot => {
                chain.clear();
            }
            RawRecord::LfnFragment(l) => {
                if l.fstcluslo.get() != 0 {
                    return Err(Error::Fs(FatError::Corrupt(
                        "LFN fragment carries a nonzero cluster".into(),
                    )));
                }
                let ord = l.ord & 0x3F;
                if chain.iter().any(|c| c.ord & 0x3F == ord) {
                    return Err(Error::Fs(FatError::Corrupt("duplicate LFN ordinal".into())));
                }
                chain.push(l);
            }
            RawRecord::Entry(raw_entry) => {
                let long_name = if chain.is_empty() {
                    None
                } else if !chain.iter().any(|c| c.ord & 0x40 != 0) {
                    // an incomplete chain (missing its "last" fragment);
                    // discard it silently rather than fail the whole scan
                    chain.clear();
                    None
                } else {
                    let checksum = checksum_bytes(&raw_entry.name);
                    if chain.iter().any(|c| c.chksum != checksum) {
                        return Err(Error::Fs(FatError::BrokenLfn));
                    }
                    Some(decode_lfn(&chain)?)
                };
                chain.clear();
                out.push(DirEntryNode::from_raw(raw_entry, long_name));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lfn_round_trips_through_encode_decode() {
        let short = ShortName::from_str("LONGFI~1.TXT", Encoding::Ibm437).unwrap();
        let long = "a quite long filename indeed.txt";
        let records = encode_lfn(long, &short).unwrap();
        assert!(records.len() > 1);
        let back = decode_lfn(&records).unwrap();
        assert_eq!(back, long);
    }

    #[test]
    fn lfn_exact_multiple_of_thirteen_has_no_terminator_record() {
        let short = ShortName::from_str("X.TXT", Encoding::Ibm437).unwrap();
        let long: String = "a".repeat(26); // exactly 2 * 13
        let records = encode_lfn(&long, &short).unwrap();
        assert_eq!(records.len(), 2);
        let back = decode_lfn(&records).unwrap();
        assert_eq!(back, long);
    }

    #[test]
    fn scan_rejects_a_chain_whose_checksum_does_not_match_its_short_entry() {
        let short = ShortName::from_str("REAL~1.TXT", Encoding::Ibm437).unwrap();
        let mut records = encode_lfn("real name.txt", &short).unwrap();
        for r in &mut records {
            r.chksum = r.chksum.wrapping_add(1);
        }
        let mut raw_records = Vec::new();
        for r in &records {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(r.as_bytes());
            raw_records.push(buf);
        }
        let mut entry_buf = [0u8; 32];
        entry_buf[0..11].copy_from_slice(&short.byte_repr());
        raw_records.push(entry_buf);

        let result = scan_directory_records(&raw_records);
        assert!(matches!(result, Err(Error::Fs(FatError::BrokenLfn))));
    }

    #[test]
    fn scan_discards_chain_invalidated_by_a_free_slot() {
        let short = ShortName::from_str("REAL~1.TXT", Encoding::Ibm437).unwrap();
        let records = encode_lfn("real name.txt", &short).unwrap();
        let mut raw_records = Vec::new();
        for r in &records {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(r.as_bytes());
            raw_records.push(buf);
        }
        raw_records.push([0xE5u8; 32]); // a free slot lands between chain and entry
        let mut entry_buf = [0u8; 32];
        entry_buf[0..11].copy_from_slice(&short.byte_repr());
        raw_records.push(entry_buf);

        let nodes = scan_directory_records(&raw_records).unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].long_name.is_none());
    }

    #[test]
    fn kanji_lead_byte_round_trips_through_a_full_scan() {
        let mut entry_buf = [0u8; 32];
        entry_buf[0..11].copy_from_slice(b"\x05ANJI   TXT");
        let nodes = scan_directory_records(&[entry_buf]).unwrap();
        assert_eq!(nodes[0].short_name.byte_repr()[0], 0x05);
        assert_eq!(nodes[0].to_raw().name[0], 0x05);
        assert!(nodes[0].get_short_name().ends_with("ANJI.TXT"));
    }
}
