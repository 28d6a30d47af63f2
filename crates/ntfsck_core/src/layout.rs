//! Zero-copy views over on-disk NTFS records.
//!
//! Every view wraps a byte slice and validates offsets before handing out
//! sub-slices; callers never do pointer arithmetic on raw buffers. Setter
//! helpers mutate the fixed header fields the repair paths need.

use crate::error::{FsckError, Result};
use crate::types::MftRef;
use byteorder::{ByteOrder, LittleEndian};

pub const MFT_MAGIC: &[u8; 4] = b"FILE";
pub const MFT_MAGIC_BAAD: &[u8; 4] = b"BAAD";
pub const INDX_MAGIC: &[u8; 4] = b"INDX";

/// End-of-attributes marker.
pub const AT_END: u32 = 0xffff_ffff;

/// Attribute type codes. A closed set; anything else is a corruption.
pub mod attr_type {
    pub const STANDARD_INFORMATION: u32 = 0x10;
    pub const ATTRIBUTE_LIST: u32 = 0x20;
    pub const FILE_NAME: u32 = 0x30;
    pub const OBJECT_ID: u32 = 0x40;
    pub const SECURITY_DESCRIPTOR: u32 = 0x50;
    pub const VOLUME_NAME: u32 = 0x60;
    pub const VOLUME_INFORMATION: u32 = 0x70;
    pub const DATA: u32 = 0x80;
    pub const INDEX_ROOT: u32 = 0x90;
    pub const INDEX_ALLOCATION: u32 = 0xa0;
    pub const BITMAP: u32 = 0xb0;
    pub const REPARSE_POINT: u32 = 0xc0;
    pub const EA_INFORMATION: u32 = 0xd0;
    pub const EA: u32 = 0xe0;
    pub const PROPERTY_SET: u32 = 0xf0;
    pub const LOGGED_UTILITY_STREAM: u32 = 0x100;
    pub const FIRST_USER_DEFINED: u32 = 0x1000;

    pub fn is_known(t: u32) -> bool {
        matches!(
            t,
            STANDARD_INFORMATION
                | ATTRIBUTE_LIST
                | FILE_NAME
                | OBJECT_ID
                | SECURITY_DESCRIPTOR
                | VOLUME_NAME
                | VOLUME_INFORMATION
                | DATA
                | INDEX_ROOT
                | INDEX_ALLOCATION
                | BITMAP
                | REPARSE_POINT
                | EA_INFORMATION
                | EA
                | PROPERTY_SET
                | LOGGED_UTILITY_STREAM
        ) || t >= FIRST_USER_DEFINED
    }
}

/// MFT record header flags.
pub mod record_flags {
    pub const IN_USE: u16 = 0x0001;
    pub const IS_DIRECTORY: u16 = 0x0002;
    pub const IS_4: u16 = 0x0004;
    pub const IS_VIEW_INDEX: u16 = 0x0008;
}

/// `$FILE_NAME.file_attributes` flags.
pub mod file_attr {
    pub const READONLY: u32 = 0x0001;
    pub const SPARSE_FILE: u32 = 0x0200;
    pub const REPARSE_POINT: u32 = 0x0400;
    pub const COMPRESSED: u32 = 0x0800;
    pub const ENCRYPTED: u32 = 0x4000;
    pub const I30_INDEX_PRESENT: u32 = 0x1000_0000;
    pub const VIEW_INDEX_PRESENT: u32 = 0x2000_0000;
}

/// Attribute record flags.
pub mod attr_flags {
    pub const IS_COMPRESSED: u16 = 0x0001;
    pub const COMPRESSION_MASK: u16 = 0x00ff;
    pub const IS_ENCRYPTED: u16 = 0x4000;
    pub const IS_SPARSE: u16 = 0x8000;
}

/// Index entry flags.
pub mod ie_flags {
    pub const NODE: u16 = 0x0001;
    pub const END: u16 = 0x0002;
}

/// Index header flags.
pub const SMALL_INDEX: u8 = 0;
pub const LARGE_INDEX: u8 = 1;
pub const LEAF_NODE: u8 = 0;
pub const INDEX_NODE: u8 = 1;

/// `$VOLUME_INFORMATION` flags.
pub const VOLUME_IS_DIRTY: u16 = 0x0001;

pub const MFT_RECORD_HEADER_SIZE: usize = 42;
pub const ATTR_RESIDENT_HEADER_SIZE: usize = 24;
pub const ATTR_NON_RESIDENT_HEADER_SIZE: usize = 64;
pub const FILE_NAME_HEADER_SIZE: usize = 66;
pub const INDEX_ROOT_HEADER_SIZE: usize = 16;
pub const INDEX_HEADER_SIZE: usize = 16;
pub const INDEX_ENTRY_HEADER_SIZE: usize = 16;
pub const INDEX_BLOCK_HEADER_SIZE: usize = 24;

/// Value length of an `$INDEX_ROOT` that holds only the END entry.
pub const EMPTY_INDEX_ROOT_SIZE: u32 =
    (INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE + INDEX_ENTRY_HEADER_SIZE) as u32;

// ---------------------------------------------------------------------------
// Multi-sector fixups
// ---------------------------------------------------------------------------

/// Undoes the update-sequence-array transfer on a freshly read record.
///
/// Verifies the sentinel at the end of every sector and restores the saved
/// bytes. Fails with [`FsckError::FixupMismatch`] on a torn write.
pub fn apply_fixups(buf: &mut [u8]) -> Result<()> {
    if buf.len() < 8 {
        return Err(FsckError::FixupMismatch { sector: 0 });
    }
    let usa_ofs = LittleEndian::read_u16(&buf[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&buf[6..8]) as usize;
    if usa_count < 2 || usa_ofs + usa_count * 2 > buf.len() {
        return Err(FsckError::FixupMismatch { sector: 0 });
    }
    let usn = LittleEndian::read_u16(&buf[usa_ofs..usa_ofs + 2]);
    for i in 1..usa_count {
        let sector_end = i * 512;
        if sector_end > buf.len() {
            return Err(FsckError::FixupMismatch { sector: i });
        }
        if LittleEndian::read_u16(&buf[sector_end - 2..sector_end]) != usn {
            return Err(FsckError::FixupMismatch { sector: i });
        }
        let saved = LittleEndian::read_u16(&buf[usa_ofs + i * 2..usa_ofs + i * 2 + 2]);
        LittleEndian::write_u16(&mut buf[sector_end - 2..sector_end], saved);
    }
    Ok(())
}

/// Re-applies the update-sequence transfer before writing a record back,
/// bumping the sequence sentinel.
pub fn write_fixups(buf: &mut [u8]) -> Result<()> {
    if buf.len() < 8 {
        return Err(FsckError::FixupMismatch { sector: 0 });
    }
    let usa_ofs = LittleEndian::read_u16(&buf[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&buf[6..8]) as usize;
    if usa_count < 2 || usa_ofs + usa_count * 2 > buf.len() {
        return Err(FsckError::FixupMismatch { sector: 0 });
    }
    let mut usn = LittleEndian::read_u16(&buf[usa_ofs..usa_ofs + 2]).wrapping_add(1);
    if usn == 0 || usn == 0xffff {
        usn = 1;
    }
    LittleEndian::write_u16(&mut buf[usa_ofs..usa_ofs + 2], usn);
    for i in 1..usa_count {
        let sector_end = i * 512;
        if sector_end > buf.len() {
            return Err(FsckError::FixupMismatch { sector: i });
        }
        let last = LittleEndian::read_u16(&buf[sector_end - 2..sector_end]);
        LittleEndian::write_u16(&mut buf[usa_ofs + i * 2..usa_ofs + i * 2 + 2], last);
        LittleEndian::write_u16(&mut buf[sector_end - 2..sector_end], usn);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MFT record
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct MftRecord<'a> {
    buf: &'a [u8],
}

impl<'a> MftRecord<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < MFT_RECORD_HEADER_SIZE {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "record shorter than its header",
            });
        }
        Ok(Self { buf })
    }

    #[inline]
    pub fn magic(&self) -> &[u8] {
        &self.buf[0..4]
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[16..18])
    }

    #[inline]
    pub fn link_count(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[18..20])
    }

    #[inline]
    pub fn attrs_offset(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[20..22])
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[22..24])
    }

    #[inline]
    pub fn bytes_in_use(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[24..28])
    }

    #[inline]
    pub fn bytes_allocated(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[28..32])
    }

    #[inline]
    pub fn base_mft_record(&self) -> MftRef {
        MftRef(LittleEndian::read_u64(&self.buf[32..40]))
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.flags() & record_flags::IN_USE != 0
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.flags() & record_flags::IS_DIRECTORY != 0
    }

    /// Iterator over the attribute records, bounds-checked.
    pub fn attributes(&self) -> AttrIter<'a> {
        AttrIter {
            buf: self.buf,
            pos: self.attrs_offset() as usize,
            end: (self.bytes_in_use() as usize).min(self.buf.len()),
        }
    }
}

pub mod mft_set {
    use super::*;

    pub fn set_sequence_number(buf: &mut [u8], v: u16) {
        LittleEndian::write_u16(&mut buf[16..18], v);
    }

    pub fn set_link_count(buf: &mut [u8], v: u16) {
        LittleEndian::write_u16(&mut buf[18..20], v);
    }

    pub fn set_flags(buf: &mut [u8], v: u16) {
        LittleEndian::write_u16(&mut buf[22..24], v);
    }

    pub fn set_bytes_in_use(buf: &mut [u8], v: u32) {
        LittleEndian::write_u32(&mut buf[24..28], v);
    }
}

pub struct AttrIter<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Iterator for AttrIter<'a> {
    /// `(offset_in_record, view)`
    type Item = (usize, AttrRecord<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 8 > self.end {
            return None;
        }
        let ty = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        if ty == AT_END {
            return None;
        }
        let len = LittleEndian::read_u32(&self.buf[self.pos + 4..self.pos + 8]) as usize;
        if len < ATTR_RESIDENT_HEADER_SIZE || self.pos + len > self.end {
            // The walker validated the chain already; a bad length here just
            // terminates iteration.
            return None;
        }
        let at = self.pos;
        let rec = AttrRecord {
            buf: &self.buf[at..at + len],
        };
        self.pos += len;
        Some((at, rec))
    }
}

// ---------------------------------------------------------------------------
// Attribute record
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct AttrRecord<'a> {
    buf: &'a [u8],
}

impl<'a> AttrRecord<'a> {
    /// Wraps an attribute record slice. The slice must be exactly the
    /// record (its `length` field bytes); `AttrIter` guarantees this.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    #[inline]
    pub fn type_code(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[0..4])
    }

    #[inline]
    pub fn length(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[4..8])
    }

    #[inline]
    pub fn is_non_resident(&self) -> bool {
        self.buf[8] != 0
    }

    #[inline]
    pub fn name_length(&self) -> u8 {
        self.buf[9]
    }

    #[inline]
    pub fn name_offset(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[10..12])
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[12..14])
    }

    #[inline]
    pub fn instance(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[14..16])
    }

    /// The attribute's UTF-16 name, bounds-checked.
    pub fn name(&self) -> Result<Vec<u16>> {
        let ofs = self.name_offset() as usize;
        let len = self.name_length() as usize;
        if ofs + len * 2 > self.buf.len() {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "attribute name escapes the record",
            });
        }
        Ok((0..len)
            .map(|i| LittleEndian::read_u16(&self.buf[ofs + i * 2..ofs + i * 2 + 2]))
            .collect())
    }

    // Resident fields.

    #[inline]
    pub fn value_length(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[16..20])
    }

    #[inline]
    pub fn value_offset(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[20..22])
    }

    /// The resident value, bounds-checked.
    pub fn value(&self) -> Result<&'a [u8]> {
        let ofs = self.value_offset() as usize;
        let len = self.value_length() as usize;
        if self.is_non_resident() || ofs + len > self.buf.len() {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "resident value escapes the attribute",
            });
        }
        Ok(&self.buf[ofs..ofs + len])
    }

    // Non-resident fields.

    #[inline]
    pub fn lowest_vcn(&self) -> i64 {
        LittleEndian::read_i64(&self.buf[16..24])
    }

    #[inline]
    pub fn highest_vcn(&self) -> i64 {
        LittleEndian::read_i64(&self.buf[24..32])
    }

    #[inline]
    pub fn mapping_pairs_offset(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[32..34])
    }

    #[inline]
    pub fn compression_unit(&self) -> u8 {
        self.buf[34]
    }

    #[inline]
    pub fn allocated_size(&self) -> i64 {
        LittleEndian::read_i64(&self.buf[40..48])
    }

    #[inline]
    pub fn data_size(&self) -> i64 {
        LittleEndian::read_i64(&self.buf[48..56])
    }

    #[inline]
    pub fn initialized_size(&self) -> i64 {
        LittleEndian::read_i64(&self.buf[56..64])
    }

    pub fn compressed_size(&self) -> i64 {
        if self.buf.len() >= 72 && self.flags() & attr_flags::COMPRESSION_MASK != 0 {
            LittleEndian::read_i64(&self.buf[64..72])
        } else {
            0
        }
    }

    /// The mapping-pairs bytes, bounds-checked.
    pub fn mapping_pairs(&self) -> Result<&'a [u8]> {
        let ofs = self.mapping_pairs_offset() as usize;
        if !self.is_non_resident() || ofs >= self.buf.len() {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "mapping pairs offset escapes the attribute",
            });
        }
        Ok(&self.buf[ofs..])
    }
}

pub mod attr_set {
    use super::*;

    pub fn set_length(buf: &mut [u8], at: usize, v: u32) {
        LittleEndian::write_u32(&mut buf[at + 4..at + 8], v);
    }

    pub fn set_value_length(buf: &mut [u8], at: usize, v: u32) {
        LittleEndian::write_u32(&mut buf[at + 16..at + 20], v);
    }

    pub fn set_lowest_vcn(buf: &mut [u8], at: usize, v: i64) {
        LittleEndian::write_i64(&mut buf[at + 16..at + 24], v);
    }

    pub fn set_highest_vcn(buf: &mut [u8], at: usize, v: i64) {
        LittleEndian::write_i64(&mut buf[at + 24..at + 32], v);
    }

    pub fn set_allocated_size(buf: &mut [u8], at: usize, v: i64) {
        LittleEndian::write_i64(&mut buf[at + 40..at + 48], v);
    }

    pub fn set_data_size(buf: &mut [u8], at: usize, v: i64) {
        LittleEndian::write_i64(&mut buf[at + 48..at + 56], v);
    }

    pub fn set_initialized_size(buf: &mut [u8], at: usize, v: i64) {
        LittleEndian::write_i64(&mut buf[at + 56..at + 64], v);
    }
}

// ---------------------------------------------------------------------------
// $FILE_NAME value
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct FileName<'a> {
    buf: &'a [u8],
}

impl<'a> FileName<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < FILE_NAME_HEADER_SIZE {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "$FILE_NAME value shorter than its header",
            });
        }
        let fn_view = Self { buf };
        if FILE_NAME_HEADER_SIZE + fn_view.name_length() as usize * 2 > buf.len() {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "$FILE_NAME name escapes the value",
            });
        }
        Ok(fn_view)
    }

    #[inline]
    pub fn parent_directory(&self) -> MftRef {
        MftRef(LittleEndian::read_u64(&self.buf[0..8]))
    }

    #[inline]
    pub fn allocated_size(&self) -> i64 {
        LittleEndian::read_i64(&self.buf[40..48])
    }

    #[inline]
    pub fn data_size(&self) -> i64 {
        LittleEndian::read_i64(&self.buf[48..56])
    }

    #[inline]
    pub fn file_attributes(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[56..60])
    }

    /// Reparse tag / EA packed field.
    #[inline]
    pub fn reparse_point_tag(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[60..64])
    }

    #[inline]
    pub fn name_length(&self) -> u8 {
        self.buf[64]
    }

    #[inline]
    pub fn name_type(&self) -> u8 {
        self.buf[65]
    }

    pub fn name(&self) -> Vec<u16> {
        let len = self.name_length() as usize;
        (0..len)
            .map(|i| LittleEndian::read_u16(&self.buf[66 + i * 2..68 + i * 2]))
            .collect()
    }

    pub fn name_string(&self) -> String {
        String::from_utf16_lossy(&self.name())
    }

    /// Total size of this value in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        FILE_NAME_HEADER_SIZE + self.name_length() as usize * 2
    }
}

pub mod fn_set {
    use super::*;

    pub fn set_parent_directory(buf: &mut [u8], v: MftRef) {
        LittleEndian::write_u64(&mut buf[0..8], v.0);
    }

    pub fn set_allocated_size(buf: &mut [u8], v: i64) {
        LittleEndian::write_i64(&mut buf[40..48], v);
    }

    pub fn set_data_size(buf: &mut [u8], v: i64) {
        LittleEndian::write_i64(&mut buf[48..56], v);
    }

    pub fn set_file_attributes(buf: &mut [u8], v: u32) {
        LittleEndian::write_u32(&mut buf[56..60], v);
    }
}

/// Builds a `$FILE_NAME` value from parts, zero timestamps.
pub fn build_file_name(
    parent: MftRef,
    allocated_size: i64,
    data_size: i64,
    file_attributes: u32,
    name: &[u16],
    name_type: u8,
) -> Vec<u8> {
    let mut v = vec![0u8; FILE_NAME_HEADER_SIZE + name.len() * 2];
    LittleEndian::write_u64(&mut v[0..8], parent.0);
    LittleEndian::write_i64(&mut v[40..48], allocated_size);
    LittleEndian::write_i64(&mut v[48..56], data_size);
    LittleEndian::write_u32(&mut v[56..60], file_attributes);
    v[64] = name.len() as u8;
    v[65] = name_type;
    for (i, ch) in name.iter().enumerate() {
        LittleEndian::write_u16(&mut v[66 + i * 2..68 + i * 2], *ch);
    }
    v
}

// ---------------------------------------------------------------------------
// Index structures
// ---------------------------------------------------------------------------

/// The fixed header of an `$INDEX_ROOT` value. The embedded index header
/// and entries follow at offset 16.
#[derive(Clone, Copy)]
pub struct IndexRoot<'a> {
    buf: &'a [u8],
}

impl<'a> IndexRoot<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "$INDEX_ROOT value shorter than its headers",
            });
        }
        Ok(Self { buf })
    }

    #[inline]
    pub fn indexed_attr_type(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[0..4])
    }

    #[inline]
    pub fn collation_rule(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[4..8])
    }

    #[inline]
    pub fn index_block_size(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[8..12])
    }

    pub fn header(&self) -> IndexHeader<'a> {
        IndexHeader {
            buf: &self.buf[INDEX_ROOT_HEADER_SIZE..],
        }
    }
}

/// An INDEX_HEADER plus the entry area that follows it.
#[derive(Clone, Copy)]
pub struct IndexHeader<'a> {
    buf: &'a [u8],
}

impl<'a> IndexHeader<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < INDEX_HEADER_SIZE {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "index header truncated",
            });
        }
        Ok(Self { buf })
    }

    #[inline]
    pub fn entries_offset(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[0..4])
    }

    #[inline]
    pub fn index_length(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[4..8])
    }

    #[inline]
    pub fn allocated_size(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[8..12])
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.buf[12]
    }

    /// The entry area `[entries_offset, index_length)`, bounds-checked.
    pub fn entries(&self) -> Result<&'a [u8]> {
        let ofs = self.entries_offset() as usize;
        let end = self.index_length() as usize;
        if ofs < INDEX_HEADER_SIZE || end < ofs || end > self.buf.len() {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "index entry area escapes its container",
            });
        }
        Ok(&self.buf[ofs..end])
    }
}

pub mod ih_set {
    use super::*;

    pub fn set_entries_offset(buf: &mut [u8], v: u32) {
        LittleEndian::write_u32(&mut buf[0..4], v);
    }

    pub fn set_index_length(buf: &mut [u8], v: u32) {
        LittleEndian::write_u32(&mut buf[4..8], v);
    }

    pub fn set_allocated_size(buf: &mut [u8], v: u32) {
        LittleEndian::write_u32(&mut buf[8..12], v);
    }

    pub fn set_flags(buf: &mut [u8], v: u8) {
        buf[12] = v;
    }
}

#[derive(Clone, Copy)]
pub struct IndexEntry<'a> {
    buf: &'a [u8],
}

impl<'a> IndexEntry<'a> {
    /// Wraps the entry starting at the head of `buf`. Checks only that the
    /// entry's declared length fits; key validation is the walker's job.
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < INDEX_ENTRY_HEADER_SIZE {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "index entry truncated",
            });
        }
        let len = LittleEndian::read_u16(&buf[8..10]) as usize;
        if len < INDEX_ENTRY_HEADER_SIZE || len > buf.len() {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "index entry length out of bounds",
            });
        }
        Ok(Self { buf: &buf[..len] })
    }

    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    #[inline]
    pub fn indexed_file(&self) -> MftRef {
        MftRef(LittleEndian::read_u64(&self.buf[0..8]))
    }

    #[inline]
    pub fn length(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[8..10])
    }

    #[inline]
    pub fn key_length(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[10..12])
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[12..14])
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.flags() & ie_flags::END != 0
    }

    #[inline]
    pub fn has_sub_node(&self) -> bool {
        self.flags() & ie_flags::NODE != 0
    }

    /// The `$FILE_NAME` key, bounds-checked.
    pub fn file_name(&self) -> Result<FileName<'a>> {
        let klen = self.key_length() as usize;
        if INDEX_ENTRY_HEADER_SIZE + klen > self.buf.len() {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "index key escapes the entry",
            });
        }
        FileName::new(&self.buf[INDEX_ENTRY_HEADER_SIZE..INDEX_ENTRY_HEADER_SIZE + klen])
    }

    /// The sub-node VCN stored in the last eight bytes of a NODE entry.
    pub fn sub_node_vcn(&self) -> Result<i64> {
        if !self.has_sub_node() || self.buf.len() < INDEX_ENTRY_HEADER_SIZE + 8 {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "entry has no sub-node vcn",
            });
        }
        let at = self.buf.len() - 8;
        Ok(LittleEndian::read_i64(&self.buf[at..at + 8]))
    }
}

/// Builds an index entry for a `$FILE_NAME` key, leaf form.
pub fn build_index_entry(indexed_file: MftRef, file_name_value: &[u8]) -> Vec<u8> {
    let len = (INDEX_ENTRY_HEADER_SIZE + file_name_value.len() + 7) & !7;
    let mut e = vec![0u8; len];
    LittleEndian::write_u64(&mut e[0..8], indexed_file.0);
    LittleEndian::write_u16(&mut e[8..10], len as u16);
    LittleEndian::write_u16(&mut e[10..12], file_name_value.len() as u16);
    e[INDEX_ENTRY_HEADER_SIZE..INDEX_ENTRY_HEADER_SIZE + file_name_value.len()]
        .copy_from_slice(file_name_value);
    e
}

/// Builds the END entry that terminates every index node.
pub fn build_end_entry(sub_node_vcn: Option<i64>) -> Vec<u8> {
    match sub_node_vcn {
        None => {
            let mut e = vec![0u8; INDEX_ENTRY_HEADER_SIZE];
            LittleEndian::write_u16(&mut e[8..10], INDEX_ENTRY_HEADER_SIZE as u16);
            LittleEndian::write_u16(&mut e[12..14], ie_flags::END);
            e
        }
        Some(vcn) => {
            let mut e = vec![0u8; INDEX_ENTRY_HEADER_SIZE + 8];
            LittleEndian::write_u16(&mut e[8..10], (INDEX_ENTRY_HEADER_SIZE + 8) as u16);
            LittleEndian::write_u16(&mut e[12..14], ie_flags::END | ie_flags::NODE);
            LittleEndian::write_i64(&mut e[16..24], vcn);
            e
        }
    }
}

/// An INDX block header. Entries follow the embedded index header at 24.
#[derive(Clone, Copy)]
pub struct IndexBlock<'a> {
    buf: &'a [u8],
}

impl<'a> IndexBlock<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < INDEX_BLOCK_HEADER_SIZE + INDEX_HEADER_SIZE {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "index block shorter than its headers",
            });
        }
        Ok(Self { buf })
    }

    #[inline]
    pub fn magic(&self) -> &[u8] {
        &self.buf[0..4]
    }

    #[inline]
    pub fn index_block_vcn(&self) -> i64 {
        LittleEndian::read_i64(&self.buf[16..24])
    }

    pub fn header(&self) -> IndexHeader<'a> {
        IndexHeader {
            buf: &self.buf[INDEX_BLOCK_HEADER_SIZE..],
        }
    }
}

/// Reads the volume flags out of a `$VOLUME_INFORMATION` value.
pub fn volume_info_flags(value: &[u8]) -> Result<u16> {
    if value.len() < 12 {
        return Err(FsckError::CorruptRecord {
            mft_no: 3,
            reason: "$VOLUME_INFORMATION truncated",
        });
    }
    Ok(LittleEndian::read_u16(&value[10..12]))
}

/// NTFS major/minor version from a `$VOLUME_INFORMATION` value.
pub fn volume_info_version(value: &[u8]) -> Result<(u8, u8)> {
    if value.len() < 12 {
        return Err(FsckError::CorruptRecord {
            mft_no: 3,
            reason: "$VOLUME_INFORMATION truncated",
        });
    }
    Ok((value[8], value[9]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_attrs() -> Vec<u8> {
        let mut rec = vec![0u8; 1024];
        rec[0..4].copy_from_slice(b"FILE");
        LittleEndian::write_u16(&mut rec[4..6], 42); // usa_ofs
        LittleEndian::write_u16(&mut rec[6..8], 3); // usa_count (2 sectors)
        LittleEndian::write_u16(&mut rec[16..18], 1); // seq
        LittleEndian::write_u16(&mut rec[20..22], 56); // attrs_offset
        LittleEndian::write_u16(&mut rec[22..24], record_flags::IN_USE);
        LittleEndian::write_u32(&mut rec[28..32], 1024);

        // One resident $DATA attribute, then AT_END.
        let at = 56;
        LittleEndian::write_u32(&mut rec[at..at + 4], attr_type::DATA);
        LittleEndian::write_u32(&mut rec[at + 4..at + 8], 32);
        LittleEndian::write_u32(&mut rec[at + 16..at + 20], 4); // value_length
        LittleEndian::write_u16(&mut rec[at + 20..at + 22], 24); // value_offset
        rec[at + 24..at + 28].copy_from_slice(b"data");
        LittleEndian::write_u32(&mut rec[at + 32..at + 36], AT_END);
        LittleEndian::write_u32(&mut rec[24..28], (at + 40) as u32); // bytes_in_use
        rec
    }

    #[test]
    fn test_attr_iteration() {
        let rec = record_with_attrs();
        let view = MftRecord::new(&rec).unwrap();
        let attrs: Vec<_> = view.attributes().collect();
        assert_eq!(attrs.len(), 1);
        let (ofs, a) = attrs[0];
        assert_eq!(ofs, 56);
        assert_eq!(a.type_code(), attr_type::DATA);
        assert_eq!(a.value().unwrap(), b"data");
    }

    #[test]
    fn test_fixup_round_trip() {
        let mut rec = record_with_attrs();
        LittleEndian::write_u16(&mut rec[42..44], 7); // usn
        rec[510] = 0xaa;
        rec[511] = 0xbb;
        rec[1022] = 0xcc;
        rec[1023] = 0xdd;
        let orig = rec.clone();

        write_fixups(&mut rec).unwrap();
        assert_eq!(LittleEndian::read_u16(&rec[510..512]), 8);
        assert_eq!(LittleEndian::read_u16(&rec[1022..1024]), 8);

        apply_fixups(&mut rec).unwrap();
        assert_eq!(&rec[508..512], &orig[508..512]);
        assert_eq!(&rec[1020..1024], &orig[1020..1024]);
    }

    #[test]
    fn test_fixup_detects_torn_write() {
        let mut rec = record_with_attrs();
        LittleEndian::write_u16(&mut rec[42..44], 7);
        write_fixups(&mut rec).unwrap();
        rec[510] = 0x00; // clobber one sentinel
        rec[511] = 0x00;
        assert!(matches!(
            apply_fixups(&mut rec),
            Err(FsckError::FixupMismatch { sector: 1 })
        ));
    }

    #[test]
    fn test_file_name_build_and_view() {
        let name: Vec<u16> = "hello.txt".encode_utf16().collect();
        let v = build_file_name(MftRef::new(5, 2), 4096, 100, 0, &name, 3);
        let fname = FileName::new(&v).unwrap();
        assert_eq!(fname.parent_directory().mft_no(), 5);
        assert_eq!(fname.parent_directory().seq_no(), 2);
        assert_eq!(fname.allocated_size(), 4096);
        assert_eq!(fname.data_size(), 100);
        assert_eq!(fname.name_string(), "hello.txt");
    }

    #[test]
    fn test_index_entry_build() {
        let name: Vec<u16> = "a".encode_utf16().collect();
        let fnv = build_file_name(MftRef::new(5, 1), 0, 0, 0, &name, 3);
        let e = build_index_entry(MftRef::new(42, 3), &fnv);
        let ie = IndexEntry::new(&e).unwrap();
        assert_eq!(ie.indexed_file().mft_no(), 42);
        assert!(!ie.is_end());
        assert_eq!(ie.length() % 8, 0);
        assert_eq!(ie.file_name().unwrap().name_string(), "a");
    }

    #[test]
    fn test_end_entry_node_vcn() {
        let e = build_end_entry(Some(9));
        let ie = IndexEntry::new(&e).unwrap();
        assert!(ie.is_end());
        assert!(ie.has_sub_node());
        assert_eq!(ie.sub_node_vcn().unwrap(), 9);
    }

    #[test]
    fn test_zero_length_entry_rejected() {
        let mut e = build_end_entry(None);
        LittleEndian::write_u16(&mut e[8..10], 0);
        assert!(IndexEntry::new(&e).is_err());
    }
}
