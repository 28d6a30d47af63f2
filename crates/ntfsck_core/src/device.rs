//! Volume device abstraction.
//!
//! The engine never touches a file descriptor directly; every read and write
//! goes through [`VolumeDevice`], so the same pass code runs on a block
//! device, an image file, or an in-memory buffer in tests.

use crate::error::{FsckError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub trait VolumeDevice {
    /// Reads exactly `buf.len()` bytes at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes exactly `buf.len()` bytes at `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Total size of the device in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the device was opened without write access.
    fn read_only(&self) -> bool;
}

/// A block device or volume image on disk.
pub struct FileDevice {
    file: File,
    size: u64,
    read_only: bool,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{fadvise, Advice};
            let _ = fadvise(&file, 0, None, Advice::Sequential);
        }

        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        Ok(Self {
            file,
            size,
            read_only,
        })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64).unwrap_or(u64::MAX);
        if end > self.size {
            return Err(FsckError::OutOfBounds {
                offset: end,
                max: self.size,
            });
        }
        Ok(())
    }
}

impl VolumeDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FsckError::Refused(
                "write attempted on a read-only device".into(),
            ));
        }
        self.check_bounds(offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    #[inline]
    fn len(&self) -> u64 {
        self.size
    }

    #[inline]
    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// In-memory device backing the integration tests.
pub struct MemDevice {
    data: Vec<u8>,
    read_only: bool,
}

impl MemDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            read_only: false,
        }
    }

    pub fn new_read_only(data: Vec<u8>) -> Self {
        Self {
            data,
            read_only: true,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl VolumeDevice for MemDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start.checked_add(buf.len()).unwrap_or(usize::MAX);
        if end > self.data.len() {
            return Err(FsckError::OutOfBounds {
                offset: end as u64,
                max: self.data.len() as u64,
            });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FsckError::Refused(
                "write attempted on a read-only device".into(),
            ));
        }
        let start = offset as usize;
        let end = start.checked_add(buf.len()).unwrap_or(usize::MAX);
        if end > self.data.len() {
            return Err(FsckError::OutOfBounds {
                offset: end as u64,
                max: self.data.len() as u64,
            });
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    #[inline]
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    fn read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_device_round_trip() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[0u8; 4096]).unwrap();
        temp.flush().unwrap();

        let mut dev = FileDevice::open(temp.path(), false).unwrap();
        assert_eq!(dev.len(), 4096);

        dev.write_at(512, b"NTFS").unwrap();
        let mut buf = [0u8; 4];
        dev.read_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"NTFS");
    }

    #[test]
    fn test_file_device_read_only_refuses_write() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[0u8; 1024]).unwrap();
        temp.flush().unwrap();

        let mut dev = FileDevice::open(temp.path(), true).unwrap();
        assert!(dev.write_at(0, b"x").is_err());
    }

    #[test]
    fn test_mem_device_bounds() {
        let mut dev = MemDevice::new(vec![0u8; 100]);
        let mut buf = [0u8; 10];
        assert!(dev.read_at(95, &mut buf).is_err());
        assert!(dev.read_at(90, &mut buf).is_ok());
    }
}
