//! The boot sector / BIOS Parameter Block.
//!
//! Grounded on `pyfatfs/FATHeader.py`'s `FATHeader`/`FAT12/16Header`/
//! `FAT32Header` field layouts for the FAT32-extension split and the
//! FAT-type cross-check.

use log::warn;
use zerocopy::{little_endian::U16, little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use fatrs_err::{Error, FatError, Result};

use crate::types::FatType;

pub const SECTOR_SIZE: usize = 512;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorCommon {
    pub bs_jmpboot: [u8; 3],
    pub bs_oemname: [u8; 8],
    pub bpb_bytspersec: U16,
    pub bpb_secperclus: u8,
    pub bpb_rsvdseccnt: U16,
    pub bpb_numfats: u8,
    pub bpb_rootentcnt: U16,
    pub bpb_totsec16: U16,
    pub bpb_media: u8,
    pub bpb_fatsz16: U16,
    pub bpb_secpertrk: U16,
    pub bpb_numheads: U16,
    pub bpb_hiddsec: U32,
    pub bpb_totsec32: U32,
}

/// The extension that follows [`BootSectorCommon`] on FAT12/FAT16 volumes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorFat1216Ext {
    pub bs_drvnum: u8,
    pub bs_reserved1: u8,
    pub bs_bootsig: u8,
    pub bs_volid: U32,
    pub bs_vollab: [u8; 11],
    pub bs_filsystype: [u8; 8],
}

/// The extension that follows [`BootSectorCommon`] on FAT32 volumes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorFat32Ext {
    pub bpb_fatsz32: U32,
    pub bpb_extflags: U16,
    pub bpb_fsver: U16,
    pub bpb_rootclus: U32,
    pub bpb_fsinfo: U16,
    pub bpb_bkbootsec: U16,
    pub bpb_reserved: [u8; 12],
    pub bs_drvnum: u8,
    pub bs_reserved1: u8,
    pub bs_bootsig: u8,
    pub bs_volid: U32,
    pub bs_vollab: [u8; 11],
    pub bs_filsystype: [u8; 8],
}

#[derive(Debug, Clone)]
pub enum BootSectorExt {
    Fat1216(BootSectorFat1216Ext),
    Fat32(BootSectorFat32Ext),
}

/// A parsed 512-byte boot sector. `boot_code` retains the unmodelled
/// bootstrap-code region verbatim so [`BootSector::serialise`] round-trips
/// byte for byte, not just field for field.
#[derive(Debug, Clone)]
pub struct BootSector {
    pub common: BootSectorCommon,
    pub ext: BootSectorExt,
    pub boot_code: Vec<u8>,
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::Fs(FatError::Corrupt(msg.into()))
}

impl BootSector {
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Result<Self> {
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(corrupt("missing 0x55AA boot sector signature"));
        }

        let common = BootSectorCommon::read_from_bytes(&sector[0..36])
            .map_err(|_| corrupt("truncated BPB common header"))?;

        let valid_jmp = (common.bs_jmpboot[0] == 0xEB && common.bs_jmpboot[2] == 0x90)
            || common.bs_jmpboot[0] == 0xE9;
        if !valid_jmp {
            return Err(corrupt("BS_jmpBoot is neither a short nor a near jump"));
        }

        let bytes_per_sector = common.bpb_bytspersec.get();
        if ![512u16, 1024, 2048, 4096].contains(&bytes_per_sector) {
            return Err(corrupt(format!(
                "BPB_BytsPerSec {bytes_per_sector} is not a valid power of two"
            )));
        }
        let sec_per_clus = common.bpb_secperclus;
        if !sec_per_clus.is_power_of_two() {
            return Err(corrupt(format!(
                "BPB_SecPerClus {sec_per_clus} is not a power of two"
            )));
        }
        if bytes_per_sector as u32 * sec_per_clus as u32 > 32 * 1024 {
            warn!(
                "cluster size {} exceeds the 32 KiB Microsoft recommends",
                bytes_per_sector as u32 * sec_per_clus as u32
            );
        }
        if common.bpb_rsvdseccnt.get() < 1 {
            return Err(corrupt("BPB_RsvdSecCnt must be at least 1"));
        }
        if common.bpb_numfats < 1 {
            return Err(corrupt("BPB_NumFATs must be at least 1"));
        }
        if !(common.bpb_media == 0xF0 || common.bpb_media >= 0xF8) {
            return Err(corrupt(format!(
                "BPB_Media {:#X} is not a recognised media descriptor",
                common.bpb_media
            )));
        }
        if (common.bpb_rootentcnt.get() as u32 * 32) % bytes_per_sector as u32 != 0 {
            return Err(corrupt(
                "BPB_RootEntCnt does not pack evenly into whole sectors",
            ));
        }
        let (tot16, tot32) = (common.bpb_totsec16.get(), common.bpb_totsec32.get());
        if (tot16 != 0) == (tot32 != 0) {
            return Err(corrupt(
                "exactly one of BPB_TotSec16/BPB_TotSec32 must be nonzero",
            ));
        }

        let ext = if common.bpb_fatsz16.get() != 0 {
            BootSectorExt::Fat1216(
                BootSectorFat1216Ext::read_from_bytes(&sector[36..62])
                    .map_err(|_| corrupt("truncated FAT12/16 BPB extension"))?,
            )
        } else {
            let e = BootSectorFat32Ext::read_from_bytes(&sector[36..90])
                .map_err(|_| corrupt("truncated FAT32 BPB extension"))?;
            if e.bpb_fatsz32.get() == 0 {
                return Err(corrupt("BPB_FATSz16 and BPB_FATSz32 are both zero"));
            }
            if e.bpb_rootclus.get() < 2 {
                return Err(corrupt("BPB_RootClus must be >= 2"));
            }
            BootSectorExt::Fat32(e)
        };

        let ext_len = match &ext {
            BootSectorExt::Fat1216(_) => 26,
            BootSectorExt::Fat32(_) => 54,
        };
        let boot_code = sector[36 + ext_len..510].to_vec();

        Ok(Self {
            common,
            ext,
            boot_code,
        })
    }

    pub fn serialise(&self) -> [u8; SECTOR_SIZE] {
        let mut out = [0u8; SECTOR_SIZE];
        out[0..36].copy_from_slice(self.common.as_bytes());
        match &self.ext {
            BootSectorExt::Fat1216(e) => out[36..62].copy_from_slice(e.as_bytes()),
            BootSectorExt::Fat32(e) => out[36..90].copy_from_slice(e.as_bytes()),
        }
        let ext_len = match &self.ext {
            BootSectorExt::Fat1216(_) => 26,
            BootSectorExt::Fat32(_) => 54,
        };
        let code_start = 36 + ext_len;
        out[code_start..510].copy_from_slice(&self.boot_code);
        out[510] = 0x55;
        out[511] = 0xAA;
        out
    }

    pub fn fat_size_sectors(&self) -> u32 {
        match &self.ext {
            BootSectorExt::Fat1216(_) => self.common.bpb_fatsz16.get() as u32,
            BootSectorExt::Fat32(e) => e.bpb_fatsz32.get(),
        }
    }

    pub fn total_sectors(&self) -> u32 {
        if self.common.bpb_totsec16.get() != 0 {
            self.common.bpb_totsec16.get() as u32
        } else {
            self.common.bpb_totsec32.get()
        }
    }

    /// Offset, within the FAT32 extension, of `BS_Reserved1` -- the dirty
    /// bit alternative used on volumes where the FAT's own high bits
    /// aren't available, which on FAT32 they are; FAT32 still carries this
    /// byte and this engine keeps both copies synchronised.
    pub fn bs_reserved1_offset(&self) -> usize {
        match &self.ext {
            BootSectorExt::Fat1216(_) => 36 + 1,
            BootSectorExt::Fat32(_) => 36 + 4 + 2 + 2 + 4 + 2 + 2 + 12 + 1,
        }
    }
}

/// Microsoft's cluster-count formula, cross-checked against which BPB
/// extension shape was actually present on disk. If the formula and the
/// header evidence disagree, the header-consistent type wins and a
/// warning is logged.
pub fn determine_fat_type(bs: &BootSector) -> FatType {
    let bytes_per_sector = bs.common.bpb_bytspersec.get() as u32;
    let sec_per_clus = bs.common.bpb_secperclus as u32;
    let rsvd = bs.common.bpb_rsvdseccnt.get() as u32;
    let num_fats = bs.common.bpb_numfats as u32;
    let root_entry_cnt = bs.common.bpb_rootentcnt.get() as u32;
    let fat_sz = bs.fat_size_sectors();
    let tot_sec = bs.total_sectors();

    let root_dir_sectors = (root_entry_cnt * 32).div_ceil(bytes_per_sector);
    let data_sec = tot_sec.saturating_sub(rsvd + num_fats * fat_sz + root_dir_sectors);
    let cluster_count = data_sec / sec_per_clus;

    let by_formula = FatType::from_cluster_count(cluster_count);
    let by_header = match &bs.ext {
        BootSectorExt::Fat32(_) => FatType::Fat32,
        BootSectorExt::Fat1216(_) => {
            if by_formula == FatType::Fat32 {
                FatType::Fat16
            } else {
                by_formula
            }
        }
    };

    if by_formula != by_header {
        warn!(
            "FAT type by cluster count ({by_formula:?}) disagrees with the BPB extension shape \
             ({by_header:?}); trusting the header"
        );
    }
    by_header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_fat16_sector() -> [u8; SECTOR_SIZE] {
        let mut s = [0u8; SECTOR_SIZE];
        s[0] = 0xEB;
        s[1] = 0x3C;
        s[2] = 0x90;
        s[11..13].copy_from_slice(&512u16.to_le_bytes());
        s[13] = 1; // sec per clus
        s[14..16].copy_from_slice(&1u16.to_le_bytes()); // rsvd
        s[16] = 2; // num fats
        s[17..19].copy_from_slice(&512u16.to_le_bytes()); // root ent cnt -> 16 sectors
        s[19..21].copy_from_slice(&20000u16.to_le_bytes()); // tot sec 16
        s[21] = 0xF8;
        s[22..24].copy_from_slice(&32u16.to_le_bytes()); // fat sz 16
        s[36] = 0x80; // drvnum
        s[38] = 0x29; // bootsig
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn round_trips_a_fat16_boot_sector() {
        let raw = minimal_fat16_sector();
        let parsed = BootSector::parse(&raw).unwrap();
        assert_eq!(parsed.serialise(), raw);
    }

    #[test]
    fn rejects_a_missing_signature() {
        let mut raw = minimal_fat16_sector();
        raw[510] = 0;
        assert!(BootSector::parse(&raw).is_err());
    }

    #[test]
    fn determines_fat16_from_cluster_count() {
        let raw = minimal_fat16_sector();
        let parsed = BootSector::parse(&raw).unwrap();
        assert_eq!(determine_fat_type(&parsed), FatType::Fat16);
    }
}
