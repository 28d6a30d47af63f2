//! NTFS boot sector parsing and geometry derivation.

use crate::error::{FsckError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Boot sector signature "NTFS    "
pub const NTFS_OEM_ID: [u8; 8] = *b"NTFS    ";

pub const BOOT_SECTOR_SIZE: usize = 512;

/// Parsed BIOS parameter block of an NTFS boot sector.
#[derive(Debug, Clone)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub media_descriptor: u8,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
    pub clusters_per_mft_record: i8,
    pub clusters_per_index_block: i8,
    pub volume_serial: u64,
}

impl BootSector {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(FsckError::InvalidBootSector(
                "boot sector shorter than 512 bytes".into(),
            ));
        }
        if data[3..11] != NTFS_OEM_ID {
            return Err(FsckError::InvalidBootSector("OEM id is not \"NTFS\"".into()));
        }

        let bs = Self {
            bytes_per_sector: LittleEndian::read_u16(&data[11..13]),
            sectors_per_cluster: data[13],
            media_descriptor: data[21],
            total_sectors: LittleEndian::read_u64(&data[40..48]),
            mft_lcn: LittleEndian::read_u64(&data[48..56]),
            mftmirr_lcn: LittleEndian::read_u64(&data[56..64]),
            clusters_per_mft_record: data[64] as i8,
            clusters_per_index_block: data[68] as i8,
            volume_serial: LittleEndian::read_u64(&data[72..80]),
        };

        bs.validate()?;
        Ok(bs)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(FsckError::InvalidBootSector(format!(
                "bytes per sector {} not in 512..4096",
                self.bytes_per_sector
            )));
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(FsckError::InvalidBootSector(format!(
                "sectors per cluster {} is not a power of two",
                self.sectors_per_cluster
            )));
        }
        if self.total_sectors == 0 {
            return Err(FsckError::InvalidBootSector("zero total sectors".into()));
        }
        Ok(())
    }

    /// Quick signature probe used for the backup boot sector.
    pub fn is_ntfs(data: &[u8]) -> bool {
        data.len() >= BOOT_SECTOR_SIZE && data[3..11] == NTFS_OEM_ID
    }

    #[inline]
    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// Negative encodings mean `1 << -value` bytes.
    pub fn mft_record_size(&self) -> u32 {
        if self.clusters_per_mft_record > 0 {
            self.cluster_size() * self.clusters_per_mft_record as u32
        } else {
            1u32 << (-self.clusters_per_mft_record as u32)
        }
    }

    pub fn index_block_size(&self) -> u32 {
        if self.clusters_per_index_block > 0 {
            self.cluster_size() * self.clusters_per_index_block as u32
        } else {
            1u32 << (-self.clusters_per_index_block as u32)
        }
    }

    #[inline]
    pub fn nr_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }

    #[inline]
    pub fn mft_offset(&self) -> u64 {
        self.mft_lcn * self.cluster_size() as u64
    }

    #[inline]
    pub fn mftmirr_offset(&self) -> u64 {
        self.mftmirr_lcn * self.cluster_size() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_boot_sector() -> Vec<u8> {
        let mut bs = vec![0u8; 512];
        bs[3..11].copy_from_slice(b"NTFS    ");
        LittleEndian::write_u16(&mut bs[11..13], 512);
        bs[13] = 8; // 4 KiB clusters
        bs[21] = 0xf8;
        LittleEndian::write_u64(&mut bs[40..48], 131072);
        LittleEndian::write_u64(&mut bs[48..56], 4);
        LittleEndian::write_u64(&mut bs[56..64], 8192);
        bs[64] = (-10i8) as u8; // 1 KiB MFT records
        bs[68] = 1; // one-cluster index blocks
        LittleEndian::write_u64(&mut bs[72..80], 0xdeadbeef);
        bs
    }

    #[test]
    fn test_parse_valid() {
        let bs = BootSector::parse(&sample_boot_sector()).unwrap();
        assert_eq!(bs.cluster_size(), 4096);
        assert_eq!(bs.mft_record_size(), 1024);
        assert_eq!(bs.index_block_size(), 4096);
        assert_eq!(bs.nr_clusters(), 16384);
        assert_eq!(bs.mft_offset(), 4 * 4096);
    }

    #[test]
    fn test_reject_bad_oem() {
        let mut data = sample_boot_sector();
        data[3] = b'X';
        assert!(BootSector::parse(&data).is_err());
    }

    #[test]
    fn test_reject_bad_sector_size() {
        let mut data = sample_boot_sector();
        LittleEndian::write_u16(&mut data[11..13], 256);
        assert!(BootSector::parse(&data).is_err());
    }

    #[test]
    fn test_reject_non_pow2_cluster() {
        let mut data = sample_boot_sector();
        data[13] = 3;
        assert!(BootSector::parse(&data).is_err());
    }
}
