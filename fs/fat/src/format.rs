//! Formatting a blank device as a new FAT volume.
//!
//! Geometry sizing follows the same reserved/FAT/root-dir/data layout
//! `open_common` in `volume.rs` parses back out, picking a FAT variant
//! from the requested capacity via [`FatType::from_cluster_count`] unless
//! the caller pins one explicitly.

use fatrs_ds::DataStorage;
use fatrs_err::{Error, FatError, Result};

use crate::boot_sector::{
    BootSector, BootSectorCommon, BootSectorExt, BootSectorFat1216Ext, BootSectorFat32Ext,
    SECTOR_SIZE,
};
use crate::fat_table::FatTable;
use crate::types::FatType;
use zerocopy::little_endian::{U16, U32};

#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub fat_type: Option<FatType>,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: Option<u8>,
    pub num_fats: u8,
    pub volume_label: Option<String>,
    pub oem_name: [u8; 8],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            fat_type: None,
            bytes_per_sector: 512,
            sectors_per_cluster: None,
            num_fats: 2,
            volume_label: None,
            oem_name: *b"FATRS1  ",
        }
    }
}

fn default_sectors_per_cluster(fat_type: FatType, total_sectors: u32) -> u8 {
    // A coarse but standard-compatible table: bigger volumes get bigger
    // clusters, bounded by what each FAT variant's 12/16-bit entry space
    // can address.
    match fat_type {
        FatType::Fat12 => 1,
        FatType::Fat16 => {
            if total_sectors < 32_680 {
                2
            } else if total_sectors < 262_144 {
                4
            } else if total_sectors < 524_288 {
                8
            } else {
                16
            }
        }
        FatType::Fat32 => {
            if total_sectors < 532_480 {
                1
            } else if total_sectors < 16_777_216 {
                8
            } else {
                16
            }
        }
    }
}

pub fn format_volume<DS: DataStorage>(device: &DS, options: FormatOptions) -> Result<()> {
    let size = device
        .size()?
        .ok_or_else(|| Error::Fs(FatError::InvalidArg))?;
    let bytes_per_sector = options.bytes_per_sector as u32;
    let total_sectors = (size / bytes_per_sector as u64) as u32;
    if total_sectors < 64 {
        return Err(Error::Fs(FatError::Corrupt(
            "device is too small to hold a FAT volume".into(),
        )));
    }

    // Guess the FAT type from capacity if the caller didn't pin one, then
    // recompute geometry to match; small devices default to FAT12/16,
    // larger ones to FAT32, mirroring common `mkfs.fat` behaviour.
    let fat_type = options.fat_type.unwrap_or(if total_sectors < 8400 {
        FatType::Fat12
    } else if size < 512 * 1024 * 1024 {
        FatType::Fat16
    } else {
        FatType::Fat32
    });

    let sectors_per_cluster = options
        .sectors_per_cluster
        .unwrap_or_else(|| default_sectors_per_cluster(fat_type, total_sectors));
    let num_fats = options.num_fats;
    let root_entry_cnt: u32 = match fat_type {
        FatType::Fat32 => 0,
        _ => 512,
    };
    let root_dir_sectors = (root_entry_cnt * 32).div_ceil(bytes_per_sector);

    // Converge on a FAT size: clusters depend on data sectors, which
    // depend on FAT size, which depends on cluster count. A couple of
    // fixed-point iterations settle this without solving the closed form.
    let reserved_sectors: u32 = if fat_type == FatType::Fat32 { 32 } else { 1 };
    let mut fat_size_sectors: u32 = 1;
    for _ in 0..8 {
        let data_sectors = total_sectors
            .saturating_sub(reserved_sectors + num_fats as u32 * fat_size_sectors + root_dir_sectors);
        let cluster_count = data_sectors / sectors_per_cluster as u32;
        let bits_per_entry = match fat_type {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        };
        let fat_bytes = (cluster_count as u64 + 2) * bits_per_entry as u64 / 8;
        fat_size_sectors = (fat_bytes as u32).div_ceil(bytes_per_sector).max(1);
    }

    let data_sectors = total_sectors
        .saturating_sub(reserved_sectors + num_fats as u32 * fat_size_sectors + root_dir_sectors);
    let cluster_count = data_sectors / sectors_per_cluster as u32;
    if FatType::from_cluster_count(cluster_count) != fat_type && options.fat_type.is_some() {
        log::warn!(
            "requested {fat_type:?} but the resulting geometry has a cluster count \
             Microsoft's formula would classify as a different FAT type"
        );
    }

    let root_cluster = 2u32;
    let common = BootSectorCommon {
        bs_jmpboot: [0xEB, 0x00, 0x90],
        bs_oemname: options.oem_name,
        bpb_bytspersec: U16::new(options.bytes_per_sector),
        bpb_secperclus: sectors_per_cluster,
        bpb_rsvdseccnt: U16::new(reserved_sectors as u16),
        bpb_numfats: num_fats,
        bpb_rootentcnt: U16::new(root_entry_cnt as u16),
        bpb_totsec16: if total_sectors <= 0xFFFF {
            U16::new(total_sectors as u16)
        } else {
            U16::new(0)
        },
        bpb_media: 0xF8,
        bpb_fatsz16: if fat_type == FatType::Fat32 {
            U16::new(0)
        } else {
            U16::new(fat_size_sectors as u16)
        },
        bpb_secpertrk: U16::new(63),
        bpb_numheads: U16::new(255),
        bpb_hiddsec: U32::new(0),
        bpb_totsec32: if total_sectors > 0xFFFF {
            U32::new(total_sectors)
        } else {
            U32::new(0)
        },
    };

    let mut vollab = [b' '; 11];
    if let Some(label) = &options.volume_label {
        let bytes = label.to_ascii_uppercase();
        let n = bytes.len().min(11);
        vollab[..n].copy_from_slice(&bytes.as_bytes()[..n]);
    } else {
        vollab.copy_from_slice(b"NO NAME    ");
    }

    let ext = if fat_type == FatType::Fat32 {
        BootSectorExt::Fat32(BootSectorFat32Ext {
            bpb_fatsz32: U32::new(fat_size_sectors),
            bpb_extflags: U16::new(0),
            bpb_fsver: U16::new(0),
            bpb_rootclus: U32::new(root_cluster),
            bpb_fsinfo: U16::new(1),
            bpb_bkbootsec: U16::new(6),
            bpb_reserved: [0u8; 12],
            bs_drvnum: 0x80,
            bs_reserved1: 0,
            bs_bootsig: 0x29,
            bs_volid: U32::new(0x1234_5678),
            bs_vollab: vollab,
            bs_filsystype: *b"FAT32   ",
        })
    } else {
        BootSectorExt::Fat1216(BootSectorFat1216Ext {
            bs_drvnum: 0x80,
            bs_reserved1: 0,
            bs_bootsig: 0x29,
            bs_volid: U32::new(0x1234_5678),
            bs_vollab: vollab,
            bs_filsystype: if fat_type == FatType::Fat12 {
                *b"FAT12   "
            } else {
                *b"FAT16   "
            },
        })
    };

    let ext_len = match &ext {
        BootSectorExt::Fat1216(_) => 26,
        BootSectorExt::Fat32(_) => 54,
    };
    let boot_sector = BootSector {
        common,
        ext,
        boot_code: vec![0u8; SECTOR_SIZE - 36 - ext_len - 2],
    };
    device.write(0, &boot_sector.serialise())?;

    let mut fat = FatTable::parse(
        &vec![0u8; (fat_size_sectors * bytes_per_sector) as usize],
        fat_type,
    )?;
    let range = fat_type.cluster_range();
    let media_mask: u32 = match fat_type {
        FatType::Fat12 => 0xF00,
        FatType::Fat16 => 0xFF00,
        FatType::Fat32 => 0x0FFF_FF00,
    };
    fat.set(0, media_mask | 0xF8);
    fat.set(1, range.eoc_max);
    if fat_type == FatType::Fat32 {
        fat.set(root_cluster, range.eoc_max);
    }

    let fat_bytes = fat.serialise();
    for i in 0..num_fats as u64 {
        let addr = reserved_sectors as u64 * bytes_per_sector as u64 + i * fat_bytes.len() as u64;
        device.write(addr, &fat_bytes)?;
    }

    if fat_type == FatType::Fat32 {
        let cluster_addr = |c: u32| -> u64 {
            let first_data_sector =
                reserved_sectors + num_fats as u32 * fat_size_sectors + root_dir_sectors;
            ((c - 2) as u64 * sectors_per_cluster as u64 + first_data_sector as u64)
                * bytes_per_sector as u64
        };
        let zero = vec![0u8; sectors_per_cluster as usize * bytes_per_sector as usize];
        device.write(cluster_addr(root_cluster), &zero)?;
    } else {
        let root_addr = (reserved_sectors + num_fats as u32 * fat_size_sectors) as u64
            * bytes_per_sector as u64;
        let zero = vec![0u8; (root_dir_sectors * bytes_per_sector) as usize];
        device.write(root_addr, &zero)?;
    }

    if let Some(label) = &options.volume_label {
        write_volume_label(
            device,
            fat_type,
            label,
            reserved_sectors,
            num_fats,
            fat_size_sectors,
            root_dir_sectors,
            bytes_per_sector,
            sectors_per_cluster,
            root_cluster,
        )?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_volume_label<DS: DataStorage>(
    device: &DS,
    fat_type: FatType,
    label: &str,
    reserved_sectors: u32,
    num_fats: u8,
    fat_size_sectors: u32,
    root_dir_sectors: u32,
    bytes_per_sector: u32,
    sectors_per_cluster: u8,
    root_cluster: u32,
) -> Result<()> {
    // A volume-label directory entry is a flat 11-byte field, not a
    // base.ext short name, so its bytes are built directly rather than
    // through `ShortName::from_str`'s base/ext conformance rules.
    let upper = label.to_ascii_uppercase();
    let mut name = [b' '; 11];
    let n = upper.len().min(11);
    name[..n].copy_from_slice(&upper.as_bytes()[..n]);
    let mut record = crate::dir_entry::RawDirEntry {
        name,
        attr: crate::dir_entry::attr::VOLUME_ID,
        ntres: 0,
        crttimetenth: 0,
        crttime: U16::new(0),
        crtdate: U16::new(0),
        lstaccdate: U16::new(0),
        fstclushi: U16::new(0),
        wrttime: U16::new(0),
        wrtdate: U16::new(0),
        fstcluslo: U16::new(0),
        filesize: U32::new(0),
    };
    let bytes = {
        use zerocopy::IntoBytes;
        let mut buf = [0u8; 32];
        buf.copy_from_slice(record.as_mut_bytes());
        buf
    };

    let addr = if fat_type == FatType::Fat32 {
        let first_data_sector = reserved_sectors + num_fats as u32 * fat_size_sectors + root_dir_sectors;
        ((root_cluster - 2) as u64 * sectors_per_cluster as u64 + first_data_sector as u64)
            * bytes_per_sector as u64
    } else {
        (reserved_sectors + num_fats as u32 * fat_size_sectors) as u64 * bytes_per_sector as u64
    };
    device.write(addr, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatrs_ds_std::FileDataStorage;

    #[test]
    fn formats_a_fat12_floppy_sized_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let storage = FileDataStorage::create(&path, 1_474_560).unwrap();
        format_volume(
            &storage,
            FormatOptions {
                fat_type: Some(FatType::Fat12),
                volume_label: Some("TESTDISK".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let mut sector = [0u8; SECTOR_SIZE];
        storage.read(0, &mut sector).unwrap();
        let parsed = BootSector::parse(&sector).unwrap();
        assert_eq!(parsed.common.bpb_media, 0xF8);
        assert_eq!(crate::boot_sector::determine_fat_type(&parsed), FatType::Fat12);
    }
}
