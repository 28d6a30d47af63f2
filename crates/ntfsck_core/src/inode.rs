//! Inode: one base MFT record, its extent records, and the checks that
//! decide whether a record is what its index entry claims it is.

use crate::attr;
use crate::error::{FsckError, Result};
use crate::layout::{
    self, attr_flags, attr_type, file_attr, fn_set, record_flags, FileName, MftRecord,
    MFT_RECORD_HEADER_SIZE,
};
use crate::problem::{InodeCtx, ProblemCode, ProblemCtx, ProblemEngine};
use crate::volume::Volume;
use tracing::{debug, warn};

/// Which record of an inode an attribute instance lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecSlot {
    Base,
    Extent(usize),
}

/// An opened inode. Owns its record buffers; a dirty inode writes them
/// back on [`Inode::sync`]. Extent records are held as `(mft_no, buf)`
/// pairs, resolved through the owner rather than back pointers.
pub struct Inode {
    pub mft_no: u64,
    pub rec: Vec<u8>,
    pub extents: Vec<(u64, Vec<u8>)>,
    pub attr_list: Option<Vec<u8>>,
    /// Sizes the unnamed `$DATA` attribute declares (directories keep 0).
    pub allocated_size: i64,
    pub data_size: i64,
    /// Expected index bitmap accumulated while walking this directory.
    pub fsck_ibm: Option<Vec<u8>>,
    dirty: bool,
}

impl Inode {
    pub fn base(&self) -> MftRecord<'_> {
        MftRecord::new(&self.rec).expect("base record was validated at open")
    }

    pub fn record(&self, slot: RecSlot) -> &[u8] {
        match slot {
            RecSlot::Base => &self.rec,
            RecSlot::Extent(i) => &self.extents[i].1,
        }
    }

    pub fn record_mut(&mut self, slot: RecSlot) -> &mut Vec<u8> {
        self.dirty = true;
        match slot {
            RecSlot::Base => &mut self.rec,
            RecSlot::Extent(i) => &mut self.extents[i].1,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn sequence_number(&self) -> u16 {
        self.base().sequence_number()
    }

    pub fn is_directory(&self) -> bool {
        self.base().is_directory()
    }

    /// First attribute matching type and (exact) name, base record first.
    /// `name = Some(&[])` selects the unnamed instance, `None` any name.
    pub fn find_attr(&self, ty: u32, name: Option<&[u16]>) -> Option<(RecSlot, usize)> {
        let slots = std::iter::once(RecSlot::Base)
            .chain((0..self.extents.len()).map(RecSlot::Extent));
        for slot in slots {
            if let Some(ofs) = attr::find_attr_in_record(self.record(slot), ty, name) {
                return Some((slot, ofs));
            }
        }
        None
    }

    pub fn has_attr(&self, ty: u32, name: Option<&[u16]>) -> bool {
        self.find_attr(ty, name).is_some()
    }

    pub fn attr_view<'a>(&'a self, slot: RecSlot, ofs: usize) -> layout::AttrRecord<'a> {
        let rec = self.record(slot);
        let len = byteorder::LittleEndian::read_u32(&rec[ofs + 4..ofs + 8]) as usize;
        layout::AttrRecord::from_slice(&rec[ofs..ofs + len])
    }

    /// Writes back every record of a dirty inode. A no-op on a read-only
    /// volume: in-memory edits made before a refused fix stay in memory.
    pub fn sync(&mut self, vol: &mut Volume) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if vol.read_only() {
            self.dirty = false;
            return Ok(());
        }
        vol.write_mft_record(self.mft_no, &self.rec)?;
        for (mft_no, rec) in &self.extents {
            vol.write_mft_record(*mft_no, rec)?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn problem_ctx(&self, name: Option<String>) -> InodeCtx {
        InodeCtx {
            mft_no: self.mft_no,
            name,
            allocated_size: self.allocated_size,
            data_size: self.data_size,
        }
    }
}

use byteorder::ByteOrder;

/// Opens and structurally validates a base MFT record.
///
/// Violations are printed through the problem engine but not counted here;
/// the pass that decides what to do with the broken record does the
/// accounting at its fix site.
pub fn open_inode(vol: &mut Volume, mft_no: u64, problems: &mut ProblemEngine) -> Result<Inode> {
    let rec = vol.read_mft_record(mft_no)?;
    let view = MftRecord::new(&rec)?;
    let ctx = ProblemCtx::Inode(InodeCtx::num(mft_no));

    if view.magic() != layout::MFT_MAGIC {
        if view.magic() == layout::MFT_MAGIC_BAAD {
            debug!(mft_no, "record marked BAAD by a previous writer");
        }
        problems.print(ProblemCode::MftMagicCorrupted, &ctx);
        return Err(FsckError::CorruptRecord {
            mft_no,
            reason: "record magic is not FILE",
        });
    }
    if !view.is_in_use() {
        return Err(FsckError::NotFound(format!("record {mft_no} not in use")));
    }
    if view.bytes_allocated() != vol.mft_record_size {
        problems.print(ProblemCode::MftSizeCorrupted, &ctx);
        return Err(FsckError::CorruptRecord {
            mft_no,
            reason: "bytes_allocated differs from the volume record size",
        });
    }
    let biu = view.bytes_in_use();
    if biu & 7 != 0 || biu < MFT_RECORD_HEADER_SIZE as u32 || biu > view.bytes_allocated() {
        problems.print(ProblemCode::MftBiuCorrupted, &ctx);
        return Err(FsckError::CorruptRecord {
            mft_no,
            reason: "bytes_in_use out of range",
        });
    }
    let ao = view.attrs_offset() as u32;
    if ao & 7 != 0 || ao < MFT_RECORD_HEADER_SIZE as u32 || ao > biu {
        problems.print(ProblemCode::MftAttrOffsetCorrupted, &ctx);
        return Err(FsckError::CorruptRecord {
            mft_no,
            reason: "attribute offset out of range",
        });
    }
    if view.sequence_number() == 0 {
        return Err(FsckError::CorruptRecord {
            mft_no,
            reason: "zero sequence number",
        });
    }
    if view.base_mft_record().mft_no() != 0 {
        return Err(FsckError::CorruptRecord {
            mft_no,
            reason: "extent record opened as a base inode",
        });
    }

    attr::check_record_attributes(mft_no, &rec, problems)?;

    let mut ino = Inode {
        mft_no,
        rec,
        extents: Vec::new(),
        attr_list: None,
        allocated_size: 0,
        data_size: 0,
        fsck_ibm: None,
        dirty: false,
    };

    if let Some(ofs) = attr::find_attr_in_record(&ino.rec, attr_type::ATTRIBUTE_LIST, None) {
        let value = attr::read_attr_value(vol, &ino.rec, ofs)?;
        ino.attr_list = Some(value);
        load_extents(vol, &mut ino, problems)?;
    }

    load_sizes(&mut ino);
    Ok(ino)
}

/// Loads every extent record the attribute list references.
fn load_extents(vol: &mut Volume, ino: &mut Inode, problems: &mut ProblemEngine) -> Result<()> {
    let list = ino.attr_list.clone().unwrap_or_default();
    let mut seen = Vec::new();
    for entry in attr::attr_list_entries(&list) {
        let ext_no = entry.mft_ref.mft_no();
        if ext_no == ino.mft_no || seen.contains(&ext_no) {
            continue;
        }
        seen.push(ext_no);

        let rec = vol.read_mft_record(ext_no)?;
        let view = MftRecord::new(&rec)?;
        if view.magic() != layout::MFT_MAGIC
            || view.base_mft_record().mft_no() != ino.mft_no
        {
            warn!(
                base = ino.mft_no,
                extent = ext_no,
                "extent record does not reference its base"
            );
            return Err(FsckError::CorruptRecord {
                mft_no: ext_no,
                reason: "extent record does not reference its base",
            });
        }
        attr::check_record_attributes(ext_no, &rec, problems)?;
        ino.extents.push((ext_no, rec));
    }
    Ok(())
}

fn load_sizes(ino: &mut Inode) {
    if let Some((slot, ofs)) = ino.find_attr(attr_type::DATA, Some(&[])) {
        let a = ino.attr_view(slot, ofs);
        if a.is_non_resident() {
            if a.lowest_vcn() == 0 {
                let allocated_size = if a.flags() & attr_flags::COMPRESSION_MASK != 0 {
                    a.compressed_size()
                } else {
                    a.allocated_size()
                };
                let data_size = a.data_size();
                ino.allocated_size = allocated_size;
                ino.data_size = data_size;
            }
        } else {
            let len = a.value_length() as i64;
            ino.allocated_size = (len + 7) & !7;
            ino.data_size = len;
        }
    }
}

/// Marks the inode and its extents in the FMB; optionally also in the
/// on-disk MFT bitmap.
pub fn set_mft_record_bitmap(vol: &mut Volume, ino: &Inode, ondisk: bool) -> Result<()> {
    vol.bitmaps.fmb_set(ino.mft_no)?;
    if ondisk {
        vol.ondisk_mftbmp_set_value(ino.mft_no, true)?;
    }
    for (ext_no, _) in &ino.extents {
        vol.bitmaps.fmb_set(*ext_no)?;
        if ondisk {
            vol.ondisk_mftbmp_set_value(*ext_no, true)?;
        }
    }
    Ok(())
}

/// A regular file must carry `$DATA` with coherent compression and
/// encryption flags.
pub fn check_file(vol: &Volume, ino: &Inode, _problems: &mut ProblemEngine) -> Result<()> {
    let (slot, ofs) = ino
        .find_attr(attr_type::DATA, None)
        .ok_or(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "file has no $DATA attribute",
        })?;
    let a = ino.attr_view(slot, ofs);
    let flags = a.flags();

    if flags & attr_flags::COMPRESSION_MASK != 0 {
        if vol.cluster_size > 4096 {
            debug!(mft_no = ino.mft_no, "compressed data with >4k clusters");
            return Err(FsckError::CorruptRecord {
                mft_no: ino.mft_no,
                reason: "compressed data on a volume with clusters over 4 KiB",
            });
        }
        if flags & attr_flags::COMPRESSION_MASK != attr_flags::IS_COMPRESSED {
            return Err(FsckError::CorruptRecord {
                mft_no: ino.mft_no,
                reason: "unknown compression method",
            });
        }
        if flags & attr_flags::IS_ENCRYPTED != 0 {
            return Err(FsckError::CorruptRecord {
                mft_no: ino.mft_no,
                reason: "attribute both compressed and encrypted",
            });
        }
    }
    Ok(())
}

/// What [`check_directory`] found.
#[derive(Debug, PartialEq, Eq)]
pub enum DirVerdict {
    Ok,
    /// The index attributes are beyond repair in place; reset the index.
    NeedsIndexInit,
    Corrupt,
}

/// Directory shape check: `$INDEX_ROOT:$I30` must exist, `$INDEX_ALLOCATION`
/// must be non-resident, a `$BITMAP` must accompany it, and an empty
/// allocation drops both.
pub fn check_directory(
    _vol: &mut Volume,
    ino: &mut Inode,
    problems: &mut ProblemEngine,
) -> Result<DirVerdict> {
    let i30 = attr::I30;
    if !ino.has_attr(attr_type::INDEX_ROOT, Some(i30)) {
        debug!(mft_no = ino.mft_no, "$INDEX_ROOT missing");
        return Ok(DirVerdict::Corrupt);
    }

    let ia = ino.find_attr(attr_type::INDEX_ALLOCATION, Some(i30));
    let bmp = ino.find_attr(attr_type::BITMAP, Some(i30));

    let Some((ia_slot, ia_ofs)) = ia else {
        // Only $BITMAP present is stale metadata; drop it.
        if let Some((slot, ofs)) = bmp {
            let rec = ino.record_mut(slot);
            attr::remove_attr(rec, ofs)?;
        }
        return Ok(DirVerdict::Ok);
    };

    let a = ino.attr_view(ia_slot, ia_ofs);
    if !a.is_non_resident() {
        let ctx = ProblemCtx::Inode(ino.problem_ctx(None));
        problems.error_found();
        if problems.fix(ProblemCode::DirHaveResidentIa, &ctx) {
            problems.error_fixed();
            return Ok(DirVerdict::NeedsIndexInit);
        }
        return Ok(DirVerdict::Corrupt);
    }
    let ia_alloc = a.allocated_size();

    if bmp.is_none() {
        // $INDEX_ALLOCATION without its bitmap: seed an empty 8-byte one.
        let zero = [0u8; 8];
        attr::insert_resident_attr(
            ino.record_mut(RecSlot::Base),
            attr_type::BITMAP,
            i30,
            &zero,
        )?;
    }

    if ia_alloc == 0 {
        let (slot, ofs) = ino.find_attr(attr_type::INDEX_ALLOCATION, Some(i30)).unwrap();
        attr::remove_attr(ino.record_mut(slot), ofs)?;
        if let Some((slot, ofs)) = ino.find_attr(attr_type::BITMAP, Some(i30)) {
            attr::remove_attr(ino.record_mut(slot), ofs)?;
        }
    }

    Ok(DirVerdict::Ok)
}

/// Finds the `$FILE_NAME` attribute in the MFT record matching an index
/// key: same parent reference, same name under the collation the name
/// type demands. Returns the slot and attribute offset.
pub fn find_file_name_attr(
    vol: &Volume,
    ino: &Inode,
    ie_fn: &FileName<'_>,
) -> Option<(RecSlot, usize)> {
    let slots =
        std::iter::once(RecSlot::Base).chain((0..ino.extents.len()).map(RecSlot::Extent));
    for slot in slots {
        let rec = ino.record(slot);
        let view = MftRecord::new(rec).ok()?;
        for (ofs, a) in view.attributes() {
            if a.type_code() != attr_type::FILE_NAME || a.is_non_resident() {
                continue;
            }
            let Ok(value) = a.value() else { continue };
            let Ok(mft_fn) = FileName::new(value) else {
                continue;
            };
            // Hard links from other directories don't match.
            if mft_fn.parent_directory().0 != ie_fn.parent_directory().0 {
                continue;
            }
            // POSIX names compare exactly, the rest case-fold.
            let case_sensitive = mft_fn.name_type() == 0;
            if vol.names_equal(&mft_fn.name(), &ie_fn.name(), case_sensitive) {
                return Some((slot, ofs));
            }
        }
    }
    None
}

/// Outcome of the `$FILE_NAME` reconciliation: whether either side was
/// rewritten.
#[derive(Debug, Default)]
pub struct FnCheckOutcome {
    pub index_dirty: bool,
}

/// Reconciles the index entry's `$FILE_NAME` key against the MFT-side
/// attribute: parent reference, directory flags, and the size pair. The
/// MFT is canonical for flags, the inode sizes for the index key.
///
/// `ie_fn_buf` is the key's bytes inside the caller's index node buffer.
pub fn check_file_name_attr(
    vol: &mut Volume,
    ino: &mut Inode,
    ie_fn_buf: &mut [u8],
    parent_mft_no: u64,
    problems: &mut ProblemEngine,
) -> Result<FnCheckOutcome> {
    let mut out = FnCheckOutcome::default();

    let ie_fn = FileName::new(ie_fn_buf)?;
    let ie_name = ie_fn.name_string();
    let ie_parent = ie_fn.parent_directory();
    let ie_attrs = ie_fn.file_attributes();
    let ie_alloc = ie_fn.allocated_size();
    let ie_data = ie_fn.data_size();

    let (slot, ofs) = find_file_name_attr(vol, ino, &ie_fn).ok_or_else(|| {
        debug!(
            mft_no = ino.mft_no,
            name = %ie_name,
            "index key has no matching $FILE_NAME"
        );
        FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "index key has no matching $FILE_NAME",
        }
    })?;

    let mft_fn_range = {
        let a = ino.attr_view(slot, ofs);
        let vofs = ofs + a.value_offset() as usize;
        vofs..vofs + a.value_length() as usize
    };
    let mft_parent = FileName::new(&ino.record(slot)[mft_fn_range.clone()])?.parent_directory();

    // Parent MFT reference must agree on both sides and with the walker.
    if ie_parent.0 != mft_parent.0 || mft_parent.mft_no() != parent_mft_no {
        debug!(
            mft_no = ino.mft_no,
            idx_parent = %ie_parent,
            mft_parent = %mft_parent,
            walker_parent = parent_mft_no,
            "parent reference mismatch"
        );
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "parent MFT reference mismatch",
        });
    }

    let ictx = ProblemCtx::Index(crate::problem::IndexCtx {
        inode: InodeCtx {
            mft_no: ino.mft_no,
            name: Some(ie_name),
            allocated_size: ino.allocated_size,
            data_size: ino.data_size,
        },
        parent_mft_no,
        vcn: 0,
        fn_allocated_size: ie_alloc,
        fn_data_size: ie_data,
    });

    if ino.base().is_directory() {
        if ie_attrs & file_attr::I30_INDEX_PRESENT == 0 {
            problems.error_found();
            if problems.fix(ProblemCode::MftFlagMismatch, &ictx) {
                let new_attrs = ie_attrs | file_attr::I30_INDEX_PRESENT;
                fn_set::set_file_attributes(ie_fn_buf, new_attrs);
                fn_set::set_file_attributes(
                    &mut ino.record_mut(slot)[mft_fn_range.clone()],
                    new_attrs,
                );
                out.index_dirty = true;
                problems.error_fixed();
            }
        }

        if ie_alloc != 0 || ie_data != 0 || ino.allocated_size != 0 || ino.data_size != 0 {
            problems.error_found();
            if problems.fix(ProblemCode::DirNonzeroSize, &ictx) {
                ino.allocated_size = 0;
                ino.data_size = 0;
                fn_set::set_allocated_size(ie_fn_buf, 0);
                fn_set::set_data_size(ie_fn_buf, 0);
                let mft_buf = &mut ino.record_mut(slot)[mft_fn_range.clone()];
                fn_set::set_allocated_size(mft_buf, 0);
                fn_set::set_data_size(mft_buf, 0);
                out.index_dirty = true;
                problems.error_fixed();
            }
        }
        return Ok(out);
    }

    // Regular file: the index key's sizes must track the $DATA sizes.
    let alloc_mismatch = ino.allocated_size != ie_alloc;
    let data_mismatch = ino.data_size != ie_data;
    if alloc_mismatch {
        problems.error_found();
        problems.print(ProblemCode::MftAllocatedSizeMismatch, &ictx);
    }
    if data_mismatch {
        problems.error_found();
        problems.print(ProblemCode::MftDataSizeMismatch, &ictx);
    }
    if (alloc_mismatch || data_mismatch)
        && problems.fix(ProblemCode::MftAllocatedSizeMismatch, &ictx)
    {
        fn_set::set_allocated_size(ie_fn_buf, ino.allocated_size);
        fn_set::set_data_size(ie_fn_buf, ino.data_size);
        ino.mark_dirty();
        out.index_dirty = true;
        if alloc_mismatch {
            problems.error_fixed();
        }
        if data_mismatch {
            problems.error_fixed();
        }
    }

    Ok(out)
}

/// Reconciles the record's directory flag, the index key's directory flag,
/// and the presence of `$INDEX_ROOT`/`$DATA`. Returns the (possibly
/// corrected) index-key attribute flags.
pub fn check_file_type(
    _vol: &mut Volume,
    ino: &mut Inode,
    ie_fn_buf: &mut [u8],
    problems: &mut ProblemEngine,
) -> Result<(u32, bool)> {
    let ie_fn = FileName::new(ie_fn_buf)?;
    let mut ie_attrs = ie_fn.file_attributes();
    let name = ie_fn.name_string();
    let mut index_dirty = false;

    if ie_attrs & file_attr::VIEW_INDEX_PRESENT != 0 {
        return Ok((ie_attrs, false));
    }

    let ictx = ProblemCtx::Inode(ino.problem_ctx(Some(name)));
    let is_dir_record = ino.base().is_directory();
    let has_ir = ino.has_attr(attr_type::INDEX_ROOT, Some(attr::I30));
    let has_data = ino.has_attr(attr_type::DATA, Some(&[]));

    if is_dir_record {
        if has_ir {
            if ie_attrs & file_attr::I30_INDEX_PRESENT == 0 {
                ie_attrs |= file_attr::I30_INDEX_PRESENT;
                problems.error_found();
                if problems.fix(ProblemCode::DirFlagMismatchIdxFn, &ictx) {
                    fn_set::set_file_attributes(ie_fn_buf, ie_attrs);
                    index_dirty = true;
                    problems.error_fixed();
                }
            }
        } else {
            // Directory flag with no $INDEX_ROOT is unrepairable in place.
            return Err(FsckError::CorruptRecord {
                mft_no: ino.mft_no,
                reason: "directory record without $INDEX_ROOT",
            });
        }
    } else if has_data {
        if ie_attrs & file_attr::I30_INDEX_PRESENT != 0 {
            ie_attrs &= !file_attr::I30_INDEX_PRESENT;
            problems.error_found();
            if problems.fix(ProblemCode::MftFlagMismatchIdxFn, &ictx) {
                fn_set::set_file_attributes(ie_fn_buf, ie_attrs);
                index_dirty = true;
                problems.error_fixed();
            }
        }
    } else if !has_ir {
        // Neither $DATA nor $INDEX_ROOT.
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "record carries neither $DATA nor $INDEX_ROOT",
        });
    } else {
        // File-flagged record with an index root: trust the index root.
        ie_attrs |= file_attr::I30_INDEX_PRESENT;
        problems.error_found();
        if problems.fix(ProblemCode::FileHaveIr, &ictx) {
            fn_set::set_file_attributes(ie_fn_buf, ie_attrs);
            index_dirty = true;
            problems.error_fixed();
        }
    }

    Ok((ie_attrs, index_dirty))
}

/// Rewrites a stale reparse tag in the index key from the record's
/// `$REPARSE_POINT` attribute, the way Windows does silently. Only called
/// when the session's opt-in knob enables it. Returns whether the key
/// changed.
pub fn fixup_reparse_tag(ino: &Inode, ie_fn_buf: &mut [u8]) -> Result<bool> {
    let ie_fn = FileName::new(ie_fn_buf)?;
    if ie_fn.file_attributes() & file_attr::REPARSE_POINT == 0 {
        return Ok(false);
    }
    let ie_tag = ie_fn.reparse_point_tag();
    let Some((slot, ofs)) = ino.find_attr(attr_type::REPARSE_POINT, None) else {
        return Ok(false);
    };
    let a = ino.attr_view(slot, ofs);
    if a.is_non_resident() {
        return Ok(false);
    }
    let value = a.value()?;
    if value.len() < 4 {
        return Ok(false);
    }
    let tag = byteorder::LittleEndian::read_u32(&value[0..4]);
    if tag != ie_tag {
        byteorder::LittleEndian::write_u32(&mut ie_fn_buf[60..64], tag);
        return Ok(true);
    }
    Ok(false)
}

/// The entry-vs-record identity checks done before any deep validation:
/// positive link count, base record, and matching sequence numbers.
pub fn check_inode_fields(ino: &Inode, indexed_file: crate::types::MftRef) -> Result<()> {
    let view = ino.base();
    if view.link_count() == 0 {
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "in-use record with zero link count",
        });
    }
    if view.base_mft_record().mft_no() != 0 {
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "index entry references an extent record",
        });
    }
    if indexed_file.seq_no() != view.sequence_number() {
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "index entry sequence number is stale",
        });
    }
    Ok(())
}

/// Clears the IN_USE flag of a record directly on disk and bumps its
/// sequence number, without opening it as an inode.
pub fn mark_record_unused(vol: &mut Volume, mft_no: u64) -> Result<()> {
    let mut rec = vol.read_mft_record_raw(mft_no)?;
    let Ok(view) = MftRecord::new(&rec) else {
        return Ok(());
    };
    if view.magic() != layout::MFT_MAGIC || !view.is_in_use() {
        debug!(mft_no, "record already unused");
        return Ok(());
    }
    let flags = view.flags() & !record_flags::IN_USE;
    let seq = match view.sequence_number() {
        0xffff => 1,
        0 => 0,
        s => s + 1,
    };
    layout::mft_set::set_flags(&mut rec, flags);
    layout::mft_set::set_sequence_number(&mut rec, seq);
    vol.write_mft_record_raw(mft_no, &rec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index;
    use crate::types::{MftRef, RepairMode};

    #[test]
    fn test_dir_verdict_eq() {
        assert_eq!(DirVerdict::Ok, DirVerdict::Ok);
        assert_ne!(DirVerdict::Ok, DirVerdict::Corrupt);
    }

    fn minimal_inode(rec: Vec<u8>) -> Inode {
        Inode {
            mft_no: 42,
            rec,
            extents: Vec::new(),
            attr_list: None,
            allocated_size: 0,
            data_size: 0,
            fsck_ibm: None,
            dirty: false,
        }
    }

    fn bare_record(seq: u16, link_count: u16) -> Vec<u8> {
        let mut rec = vec![0u8; 1024];
        rec[0..4].copy_from_slice(b"FILE");
        byteorder::LittleEndian::write_u16(&mut rec[16..18], seq);
        byteorder::LittleEndian::write_u16(&mut rec[18..20], link_count);
        byteorder::LittleEndian::write_u16(&mut rec[20..22], 56);
        byteorder::LittleEndian::write_u16(&mut rec[22..24], record_flags::IN_USE);
        byteorder::LittleEndian::write_u32(&mut rec[24..28], 64);
        byteorder::LittleEndian::write_u32(&mut rec[28..32], 1024);
        byteorder::LittleEndian::write_u32(&mut rec[56..60], layout::AT_END);
        rec
    }

    #[test]
    fn test_check_inode_fields() {
        let ino = minimal_inode(bare_record(7, 1));
        assert!(check_inode_fields(&ino, MftRef::new(42, 7)).is_ok());
        // stale sequence
        assert!(check_inode_fields(&ino, MftRef::new(42, 6)).is_err());
        // zero link count
        let ino = minimal_inode(bare_record(7, 0));
        assert!(check_inode_fields(&ino, MftRef::new(42, 7)).is_err());
    }

    #[test]
    fn test_dirty_tracking() {
        let mut ino = minimal_inode(bare_record(1, 1));
        assert!(!ino.is_dirty());
        ino.record_mut(RecSlot::Base);
        assert!(ino.is_dirty());
    }

    #[test]
    fn test_empty_root_value_length_fixed_to_48() {
        // An END-only $INDEX_ROOT whose value is padded past 48 bytes.
        let mut rec = attr::build_empty_record(
            1024,
            1,
            record_flags::IN_USE | record_flags::IS_DIRECTORY,
        );
        let mut value = index::build_empty_root_value(4096, 4096);
        value.extend_from_slice(&[0u8; 8]);
        attr::insert_resident_attr(&mut rec, attr_type::INDEX_ROOT, attr::I30, &value).unwrap();

        let mut ino = minimal_inode(rec);
        let mut problems = ProblemEngine::new(RepairMode::Yes);
        index::check_empty_root_length(&mut ino, &mut problems).unwrap();

        let (slot, ofs) = ino.find_attr(attr_type::INDEX_ROOT, Some(attr::I30)).unwrap();
        assert_eq!(
            ino.attr_view(slot, ofs).value_length(),
            layout::EMPTY_INDEX_ROOT_SIZE
        );
        assert_eq!(problems.fixes(), 1);
    }

    #[test]
    fn test_zero_length_index_entry_condemns_index() {
        let vol = crate::volume::test_support::bare_volume();
        let mut value = index::build_empty_root_value(4096, 4096);
        // The END entry's length field sits 8 bytes into the entry area.
        byteorder::LittleEndian::write_u16(&mut value[40..42], 0);
        let idx = index::LoadedIndex {
            geometry: index::IndexGeometry {
                block_size: 4096,
                vcn_size_bits: 12,
            },
            root_value: value,
            blocks: Default::default(),
            ia_runlist: None,
            bitmap: Vec::new(),
            root_dirty: false,
            dirty_blocks: Vec::new(),
        };
        let ino = minimal_inode(bare_record(1, 1));
        let mut problems = ProblemEngine::new(RepairMode::No);
        assert!(!index::prevalidate_index(&vol, &ino, &idx, &mut problems));
    }
}
