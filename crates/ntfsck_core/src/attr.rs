//! Attribute decoding and validation: walking attribute records within a
//! base MFT record and its extents, structural checks, attribute-list
//! reconciliation, and whole-attribute runlist decomposition.

use crate::error::{FsckError, Result};
use crate::inode::{Inode, RecSlot};
use crate::layout::{
    attr_set, attr_type, mft_set, AttrRecord, MftRecord, AT_END, MFT_RECORD_HEADER_SIZE,
};
use crate::problem::{AttrCtx, InodeCtx, ProblemCode, ProblemCtx, ProblemEngine};
use crate::runlist::Runlist;
use crate::types::{LcnValue, MftRef, Vcn};
use crate::volume::Volume;
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

/// UTF-16 "$I30", the name of the file-name directory index.
pub const I30: &[u16] = &[0x0024, 0x0049, 0x0033, 0x0030];

/// Finds an attribute by type and name in one record. `Some(&[])` matches
/// only the unnamed instance, `None` matches regardless of name. Only
/// instances with `lowest_vcn == 0` (or resident ones) are returned.
pub fn find_attr_in_record(rec: &[u8], ty: u32, name: Option<&[u16]>) -> Option<usize> {
    let view = MftRecord::new(rec).ok()?;
    for (ofs, a) in view.attributes() {
        if a.type_code() != ty {
            continue;
        }
        if a.is_non_resident() && a.lowest_vcn() != 0 {
            continue;
        }
        if let Some(want) = name {
            let got = a.name().ok()?;
            if got.as_slice() != want {
                continue;
            }
        }
        return Some(ofs);
    }
    None
}

/// Structural validation of every attribute record in one MFT record.
/// The first violation is printed and fails the record; repair of a
/// record with an unwalkable attribute chain happens at the call sites
/// that decide to drop it.
pub fn check_record_attributes(
    mft_no: u64,
    rec: &[u8],
    problems: &mut ProblemEngine,
) -> Result<()> {
    let view = MftRecord::new(rec)?;
    let end = (view.bytes_in_use() as usize).min(rec.len());
    let mut pos = view.attrs_offset() as usize;

    let attr_ctx = |ty: u32| {
        ProblemCtx::Attr(AttrCtx {
            inode: InodeCtx::num(mft_no),
            attr_type: ty,
            ..Default::default()
        })
    };

    loop {
        if pos + 8 > end {
            problems.print(ProblemCode::AttrLengthCorrupted, &attr_ctx(0));
            return Err(FsckError::CorruptRecord {
                mft_no,
                reason: "attribute chain has no terminator",
            });
        }
        let ty = LittleEndian::read_u32(&rec[pos..pos + 4]);
        if ty == AT_END {
            return Ok(());
        }
        if !attr_type::is_known(ty) {
            problems.print(ProblemCode::AttrLengthCorrupted, &attr_ctx(ty));
            return Err(FsckError::CorruptRecord {
                mft_no,
                reason: "attribute type outside the closed set",
            });
        }

        let len = LittleEndian::read_u32(&rec[pos + 4..pos + 8]) as usize;
        if len < 24 || len & 7 != 0 || pos + len > end {
            problems.print(ProblemCode::AttrLengthCorrupted, &attr_ctx(ty));
            return Err(FsckError::CorruptRecord {
                mft_no,
                reason: "attribute length escapes bytes_in_use",
            });
        }
        let a = AttrRecord::from_slice(&rec[pos..pos + len]);

        let name_end = a.name_offset() as usize + a.name_length() as usize * 2;
        if a.name_length() != 0 && name_end > len {
            problems.print(ProblemCode::AttrNameOffsetCorrupted, &attr_ctx(ty));
            return Err(FsckError::CorruptRecord {
                mft_no,
                reason: "attribute name escapes the record",
            });
        }

        if !a.is_non_resident() {
            let vofs = a.value_offset() as usize;
            if vofs & 7 != 0 {
                problems.print(ProblemCode::AttrValueOffsetBadlyAligned, &attr_ctx(ty));
                return Err(FsckError::CorruptRecord {
                    mft_no,
                    reason: "resident value offset not 8-aligned",
                });
            }
            if vofs + a.value_length() as usize > len {
                problems.print(ProblemCode::AttrValueOffsetCorrupted, &attr_ctx(ty));
                return Err(FsckError::CorruptRecord {
                    mft_no,
                    reason: "resident value escapes the attribute",
                });
            }
        } else {
            if len < crate::layout::ATTR_NON_RESIDENT_HEADER_SIZE {
                problems.print(ProblemCode::AttrLengthCorrupted, &attr_ctx(ty));
                return Err(FsckError::CorruptRecord {
                    mft_no,
                    reason: "non-resident attribute shorter than its header",
                });
            }
            if a.mapping_pairs_offset() as usize >= len {
                problems.print(ProblemCode::AttrValueOffsetCorrupted, &attr_ctx(ty));
                return Err(FsckError::CorruptRecord {
                    mft_no,
                    reason: "mapping pairs offset escapes the attribute",
                });
            }
            if a.lowest_vcn() > a.highest_vcn() + 1 {
                problems.print(ProblemCode::AttrNonResidentSizesMismatch, &attr_ctx(ty));
                return Err(FsckError::CorruptRecord {
                    mft_no,
                    reason: "lowest_vcn above highest_vcn",
                });
            }
        }

        pos += len;
    }
}

/// Reads an attribute's full value, resident or not.
pub fn read_attr_value(vol: &mut Volume, rec: &[u8], ofs: usize) -> Result<Vec<u8>> {
    let len = LittleEndian::read_u32(&rec[ofs + 4..ofs + 8]) as usize;
    let a = AttrRecord::from_slice(&rec[ofs..ofs + len]);
    if !a.is_non_resident() {
        return Ok(a.value()?.to_vec());
    }
    let d = Runlist::decode(a.mapping_pairs()?, Vcn(a.lowest_vcn()))?;
    let mut buf = vec![0u8; a.data_size().max(0) as usize];
    vol.attr_pread(&d.runlist, 0, &mut buf)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Attribute list
// ---------------------------------------------------------------------------

pub struct AttrListEntry {
    pub ty: u32,
    pub length: u16,
    pub lowest_vcn: i64,
    pub mft_ref: MftRef,
    pub instance: u16,
}

/// Iterates an `$ATTRIBUTE_LIST` value, stopping at the first entry that
/// escapes the buffer.
pub fn attr_list_entries(list: &[u8]) -> impl Iterator<Item = AttrListEntry> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + 26 > list.len() {
            return None;
        }
        let length = LittleEndian::read_u16(&list[pos + 4..pos + 6]);
        if length == 0 || length & 7 != 0 || pos + length as usize > list.len() {
            return None;
        }
        let e = AttrListEntry {
            ty: LittleEndian::read_u32(&list[pos..pos + 4]),
            length,
            lowest_vcn: LittleEndian::read_i64(&list[pos + 8..pos + 16]),
            mft_ref: MftRef(LittleEndian::read_u64(&list[pos + 16..pos + 24])),
            instance: LittleEndian::read_u16(&list[pos + 24..pos + 26]),
        };
        pos += length as usize;
        Some(e)
    })
}

fn attr_list_type_ok(ty: u32) -> bool {
    attr_type::is_known(ty) && ty < attr_type::FIRST_USER_DEFINED
}

/// Validates the attribute list: every entry must carry a known type and a
/// sane length, and the declared total size must equal the walkable
/// length. A short walkable length is corrected.
pub fn check_attr_list(ino: &mut Inode, problems: &mut ProblemEngine) -> Result<()> {
    let Some(list) = ino.attr_list.clone() else {
        return Err(FsckError::NotFound("attribute list".into()));
    };

    let mut real_len = 0usize;
    let mut bad_type = false;
    let mut pos = 0usize;
    while pos + 26 <= list.len() {
        let ty = LittleEndian::read_u32(&list[pos..pos + 4]);
        let length = LittleEndian::read_u16(&list[pos + 4..pos + 6]) as usize;
        if length == 0 || length & 7 != 0 {
            bad_type = true;
            break;
        }
        if !attr_list_type_ok(ty) {
            bad_type = true;
            break;
        }
        if pos + length > list.len() {
            break;
        }
        real_len += length;
        pos += length;
    }

    if real_len != list.len() {
        let ctx = ProblemCtx::Attr(AttrCtx {
            inode: InodeCtx::num(ino.mft_no),
            attr_type: attr_type::ATTRIBUTE_LIST,
            ..Default::default()
        });
        problems.error_found();
        if problems.fix(ProblemCode::AttrlistLengthCorrupted, &ctx) {
            if let Some(ofs) = find_attr_in_record(&ino.rec, attr_type::ATTRIBUTE_LIST, None) {
                let a = ino.attr_view(RecSlot::Base, ofs);
                if !a.is_non_resident() {
                    resize_resident_value(ino.record_mut(RecSlot::Base), ofs, real_len as u32)?;
                    ino.attr_list = Some(list[..real_len].to_vec());
                    problems.error_fixed();
                } else {
                    // Shrinking a non-resident list stream is out of scope;
                    // truncate the in-memory copy the walk uses.
                    warn!(mft_no = ino.mft_no, "non-resident attribute list left long");
                    ino.attr_list = Some(list[..real_len].to_vec());
                }
            }
        }
    }

    if bad_type {
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "attribute list entry is corrupt",
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Record surgery
// ---------------------------------------------------------------------------

fn record_bounds(rec: &[u8], ofs: usize) -> Result<(usize, usize)> {
    let view = MftRecord::new(rec)?;
    let biu = view.bytes_in_use() as usize;
    let len = LittleEndian::read_u32(&rec[ofs + 4..ofs + 8]) as usize;
    if ofs + len > biu {
        return Err(FsckError::CorruptRecord {
            mft_no: 0,
            reason: "attribute escapes bytes_in_use",
        });
    }
    Ok((biu, len))
}

/// Removes the attribute record at `ofs`, closing the gap.
pub fn remove_attr(rec: &mut [u8], ofs: usize) -> Result<()> {
    let (biu, len) = record_bounds(rec, ofs)?;
    rec.copy_within(ofs + len..biu, ofs);
    let new_biu = (biu - len) as u32;
    mft_set::set_bytes_in_use(rec, new_biu);
    rec[new_biu as usize..biu].fill(0);
    Ok(())
}

/// Resizes a resident attribute's value in place, moving the tail of the
/// record and refreshing the attribute and record lengths.
pub fn resize_resident_value(rec: &mut [u8], ofs: usize, new_value_len: u32) -> Result<()> {
    let (biu, old_len) = record_bounds(rec, ofs)?;
    let a = AttrRecord::from_slice(&rec[ofs..ofs + old_len]);
    if a.is_non_resident() {
        return Err(FsckError::CorruptRecord {
            mft_no: 0,
            reason: "resize of a non-resident value",
        });
    }
    let vofs = a.value_offset() as usize;
    let new_len = (vofs + new_value_len as usize + 7) & !7;
    let alloc = MftRecord::new(rec)?.bytes_allocated() as usize;
    if biu - old_len + new_len > alloc {
        return Err(FsckError::RecordFull {
            mft_no: 0,
            attr_type: a.type_code(),
        });
    }

    if new_len != old_len {
        rec.copy_within(ofs + old_len..biu, ofs + new_len);
    }
    let new_biu = biu - old_len + new_len;
    if new_len > old_len {
        // Zero the grown span inside the attribute.
        let grow_from = ofs + old_len.min(new_len);
        rec[grow_from..ofs + new_len].fill(0);
    } else {
        rec[new_biu..biu].fill(0);
    }
    attr_set::set_length(rec, ofs, new_len as u32);
    attr_set::set_value_length(rec, ofs, new_value_len);
    mft_set::set_bytes_in_use(rec, new_biu as u32);
    Ok(())
}

/// Splices a fully built attribute record into an MFT record in type
/// order, bumping the instance counter. Returns its offset.
fn insert_attr_bytes(rec: &mut [u8], ty: u32, attr_bytes: &mut [u8]) -> Result<usize> {
    let view = MftRecord::new(rec)?;
    let biu = view.bytes_in_use() as usize;
    let alloc = view.bytes_allocated() as usize;
    let attr_len = attr_bytes.len();
    if biu + attr_len > alloc {
        return Err(FsckError::RecordFull {
            mft_no: 0,
            attr_type: ty,
        });
    }

    // Insertion point: before the first attribute of a higher type.
    let mut at = view.attrs_offset() as usize;
    loop {
        if at + 8 > biu {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "attribute chain has no terminator",
            });
        }
        let cur_ty = LittleEndian::read_u32(&rec[at..at + 4]);
        if cur_ty == AT_END || cur_ty > ty {
            break;
        }
        at += LittleEndian::read_u32(&rec[at + 4..at + 8]) as usize;
    }

    let next_instance = LittleEndian::read_u16(&rec[40..42]);
    LittleEndian::write_u16(&mut attr_bytes[14..16], next_instance);
    rec.copy_within(at..biu, at + attr_len);
    rec[at..at + attr_len].copy_from_slice(attr_bytes);
    LittleEndian::write_u16(&mut rec[40..42], next_instance.wrapping_add(1));
    mft_set::set_bytes_in_use(rec, (biu + attr_len) as u32);
    Ok(at)
}

/// Inserts a resident attribute in type order. Returns its offset.
pub fn insert_resident_attr(
    rec: &mut [u8],
    ty: u32,
    name: &[u16],
    value: &[u8],
) -> Result<usize> {
    let name_bytes = name.len() * 2;
    let vofs = (24 + name_bytes + 7) & !7;
    let attr_len = (vofs + value.len() + 7) & !7;

    let mut a = vec![0u8; attr_len];
    LittleEndian::write_u32(&mut a[0..4], ty);
    LittleEndian::write_u32(&mut a[4..8], attr_len as u32);
    a[9] = name.len() as u8;
    LittleEndian::write_u16(&mut a[10..12], 24);
    LittleEndian::write_u32(&mut a[16..20], value.len() as u32);
    LittleEndian::write_u16(&mut a[20..22], vofs as u16);
    for (i, ch) in name.iter().enumerate() {
        LittleEndian::write_u16(&mut a[24 + i * 2..26 + i * 2], *ch);
    }
    a[vofs..vofs + value.len()].copy_from_slice(value);

    insert_attr_bytes(rec, ty, &mut a)
}

/// Inserts a non-resident attribute in type order, encoding the runlist
/// into mapping pairs. Returns its offset.
pub fn insert_non_resident_attr(
    rec: &mut [u8],
    ty: u32,
    name: &[u16],
    rl: &Runlist,
    data_size: i64,
    cluster_size_bits: u32,
    ntfs_v3: bool,
) -> Result<usize> {
    let mp = rl.encode(Vcn(0), usize::MAX, ntfs_v3)?;
    let name_bytes = name.len() * 2;
    let mp_ofs = (64 + name_bytes + 7) & !7;
    let attr_len = (mp_ofs + mp.len() + 7) & !7;

    let mut a = vec![0u8; attr_len];
    LittleEndian::write_u32(&mut a[0..4], ty);
    LittleEndian::write_u32(&mut a[4..8], attr_len as u32);
    a[8] = 1; // non-resident
    a[9] = name.len() as u8;
    LittleEndian::write_u16(&mut a[10..12], 64);
    LittleEndian::write_i64(&mut a[16..24], 0); // lowest_vcn
    LittleEndian::write_i64(&mut a[24..32], rl.end_vcn() - 1);
    LittleEndian::write_u16(&mut a[32..34], mp_ofs as u16);
    let alloc = rl.allocated_clusters() << cluster_size_bits;
    LittleEndian::write_i64(&mut a[40..48], alloc);
    LittleEndian::write_i64(&mut a[48..56], data_size);
    LittleEndian::write_i64(&mut a[56..64], data_size);
    for (i, ch) in name.iter().enumerate() {
        LittleEndian::write_u16(&mut a[64 + i * 2..66 + i * 2], *ch);
    }
    a[mp_ofs..mp_ofs + mp.len()].copy_from_slice(&mp);

    insert_attr_bytes(rec, ty, &mut a)
}

/// Builds an empty base MFT record with the usual header shape.
pub fn build_empty_record(record_size: u32, seq: u16, flags: u16) -> Vec<u8> {
    let mut rec = vec![0u8; record_size as usize];
    rec[0..4].copy_from_slice(b"FILE");
    let usa_count = (record_size / 512) as u16 + 1;
    LittleEndian::write_u16(&mut rec[4..6], MFT_RECORD_HEADER_SIZE as u16);
    LittleEndian::write_u16(&mut rec[6..8], usa_count);
    LittleEndian::write_u16(&mut rec[16..18], seq);
    LittleEndian::write_u16(&mut rec[18..20], 1); // link_count
    let attrs_offset = ((MFT_RECORD_HEADER_SIZE + usa_count as usize * 2) + 7) & !7;
    LittleEndian::write_u16(&mut rec[20..22], attrs_offset as u16);
    LittleEndian::write_u16(&mut rec[22..24], flags);
    LittleEndian::write_u32(&mut rec[24..28], (attrs_offset + 8) as u32);
    LittleEndian::write_u32(&mut rec[28..32], record_size);
    LittleEndian::write_u16(&mut rec[40..42], 1);
    LittleEndian::write_u32(&mut rec[attrs_offset..attrs_offset + 4], AT_END);
    rec
}

// ---------------------------------------------------------------------------
// Runlist decomposition
// ---------------------------------------------------------------------------

/// Byte totals of a decomposed runlist.
#[derive(Debug, Default, Clone, Copy)]
pub struct RlSize {
    /// Holes included.
    pub alloc_size: i64,
    /// Real clusters only.
    pub real_size: i64,
}

/// Decomposes every instance of `(ty, name)` across the base and extent
/// records into one runlist. Returns the runlist and whether the caller
/// must rewrite the mapping pairs (a corrupt tail was truncated, the
/// instance chain is broken, or an out-of-range lcn was clamped).
pub fn decompose_full_runlist(
    vol: &mut Volume,
    ino: &mut Inode,
    ty: u32,
    name: &[u16],
    problems: &mut ProblemEngine,
) -> Result<(Runlist, bool)> {
    struct Instance {
        slot: RecSlot,
        ofs: usize,
        lowest: i64,
        highest: i64,
        alloc_size: i64,
    }

    let mut instances = Vec::new();
    let slots =
        std::iter::once(RecSlot::Base).chain((0..ino.extents.len()).map(RecSlot::Extent));
    for slot in slots {
        let rec = ino.record(slot);
        let Ok(view) = MftRecord::new(rec) else { continue };
        for (ofs, a) in view.attributes() {
            if a.type_code() != ty || !a.is_non_resident() {
                continue;
            }
            match a.name() {
                Ok(n) if n.as_slice() == name => {}
                _ => continue,
            }
            instances.push(Instance {
                slot,
                ofs,
                lowest: a.lowest_vcn(),
                highest: a.highest_vcn(),
                alloc_size: a.allocated_size(),
            });
        }
    }
    if instances.is_empty() {
        return Err(FsckError::NotFound(format!(
            "non-resident attribute 0x{ty:x} of record {}",
            ino.mft_no
        )));
    }
    instances.sort_by_key(|i| i.lowest);

    let mut need_fix = false;

    // The first instance must start at VCN zero.
    if instances[0].lowest != 0 {
        let ctx = ProblemCtx::Attr(AttrCtx {
            inode: InodeCtx::num(ino.mft_no),
            attr_type: ty,
            vcn: instances[0].lowest,
            ..Default::default()
        });
        problems.error_found();
        if problems.fix(ProblemCode::AttrLowestVcnIsNotZero, &ctx) {
            let Instance { slot, ofs, .. } = instances[0];
            attr_set::set_lowest_vcn(ino.record_mut(slot), ofs, 0);
            problems.error_fixed();
            instances[0].lowest = 0;
        } else {
            need_fix = true;
        }
    }

    let last_vcn = instances[0].alloc_size >> vol.cluster_size_bits;
    let mut rl = Runlist::new();
    let mut next_vcn = 0i64;
    let mut final_highest = -1i64;

    for inst in &instances {
        if inst.lowest != next_vcn {
            debug!(
                mft_no = ino.mft_no,
                expected = next_vcn,
                got = inst.lowest,
                "attribute instance chain broken"
            );
            need_fix = true;
            break;
        }
        let a = ino.attr_view(inst.slot, inst.ofs);
        let d = Runlist::decode(a.mapping_pairs()?, Vcn(inst.lowest))?;
        if d.truncated {
            need_fix = true;
        }
        let mut part = d.runlist;
        // The decoded part carries an unmapped head up to lowest_vcn; the
        // previous instances cover that range.
        part.drop_leading_unmapped();
        match Runlist::merge(rl.clone(), part) {
            Ok(merged) => rl = merged,
            Err(_) => {
                need_fix = true;
                break;
            }
        }
        final_highest = inst.highest;
        next_vcn = inst.highest + 1;
        if next_vcn <= 0 {
            break;
        }
    }

    if final_highest != last_vcn - 1 {
        debug!(
            mft_no = ino.mft_no,
            final_highest, last_vcn, "highest_vcn does not close the allocation"
        );
        need_fix = true;
    }

    if clamp_runlist(&mut rl, vol.nr_clusters) {
        need_fix = true;
    }

    Ok((rl, need_fix))
}

/// Clamps runs against the cluster count: a run starting past the end is
/// dropped with everything after it, a run overrunning the end is
/// shortened. Returns whether anything changed.
pub fn clamp_runlist(rl: &mut Runlist, nr_clusters: i64) -> bool {
    let mut changed = false;
    let mut cut_from: Option<i64> = None;
    for run in rl.runs() {
        if let LcnValue::Real(l) = run.lcn {
            if l.0 >= nr_clusters {
                cut_from = Some(run.vcn.0);
                changed = true;
                break;
            }
            if l.0 + run.length > nr_clusters {
                cut_from = Some(run.vcn.0 + (nr_clusters - l.0));
                changed = true;
                break;
            }
        }
    }
    if let Some(vcn) = cut_from {
        rl.truncate(Vcn(vcn));
    }
    changed
}

/// Sets (or clears) the FCB for one attribute's runlist, resolving any
/// cluster duplication found while setting. Returns the byte totals.
pub fn check_non_resident_attr(
    vol: &mut Volume,
    ino: &mut Inode,
    ty: u32,
    name: &[u16],
    set_bit: bool,
    problems: &mut ProblemEngine,
) -> Result<RlSize> {
    if !set_bit {
        // Rollback only: the record was already reported on the way in.
        let mut silent = ProblemEngine::silent();
        let (rl, _) = decompose_full_runlist(vol, ino, ty, name, &mut silent)?;
        for run in rl.runs() {
            if let LcnValue::Real(l) = run.lcn {
                vol.bitmaps.fcb_set_range(l, run.length, false)?;
            }
        }
        return Ok(RlSize {
            alloc_size: rl.allocated_clusters() << vol.cluster_size_bits,
            real_size: rl.real_clusters() << vol.cluster_size_bits,
        });
    }

    let (mut rl, mut need_fix) = decompose_full_runlist(vol, ino, ty, name, problems)?;

    let mut dup_all: Option<Runlist> = None;
    for run in rl.runs() {
        if let Some(dup) = vol.bitmaps.fcb_check_and_set_run(run, true)? {
            for d in dup.runs() {
                dup_all.get_or_insert_with(Runlist::new).push(*d);
            }
        }
    }

    let size = RlSize {
        alloc_size: rl.allocated_clusters() << vol.cluster_size_bits,
        real_size: rl.real_clusters() << vol.cluster_size_bits,
    };

    if let Some(dup) = dup_all {
        let ctx = ProblemCtx::Attr(AttrCtx {
            inode: InodeCtx::num(ino.mft_no),
            attr_type: ty,
            ..Default::default()
        });
        if problems.fix(ProblemCode::ClusterDuplicationFound, &ctx) {
            rl = repair_cluster_dup(vol, rl, &dup)?;
        }
        need_fix = true;
    }

    // Declared sizes must agree with what the runs actually cover.
    if ino.mft_no >= crate::types::system_file::FIRST_USER {
        if let Some((slot, ofs)) = ino.find_attr(ty, Some(name)) {
            let a = ino.attr_view(slot, ofs);
            if a.is_non_resident() && a.lowest_vcn() == 0 {
                let declared_alloc = a.allocated_size();
                let declared_data = a.data_size();
                if declared_alloc != size.alloc_size || declared_data > declared_alloc {
                    let ctx = ProblemCtx::Attr(AttrCtx {
                        inode: InodeCtx::num(ino.mft_no),
                        attr_type: ty,
                        allocated_size: declared_alloc,
                        data_size: declared_data,
                        ..Default::default()
                    });
                    problems.error_found();
                    if problems.fix(ProblemCode::AttrNonResidentSizesMismatch, &ctx) {
                        let rec = ino.record_mut(slot);
                        attr_set::set_allocated_size(rec, ofs, size.alloc_size);
                        if declared_data > size.alloc_size {
                            attr_set::set_data_size(rec, ofs, size.alloc_size);
                            attr_set::set_initialized_size(rec, ofs, size.alloc_size);
                        }
                        problems.error_fixed();
                    }
                }
            }
        }
    }

    if need_fix {
        let ctx = ProblemCtx::Attr(AttrCtx {
            inode: InodeCtx::num(ino.mft_no),
            attr_type: ty,
            ..Default::default()
        });
        problems.error_found();
        if problems.fix(ProblemCode::LogApplyRunlistToDisk, &ctx) {
            match update_mapping_pairs(vol, ino, ty, name, &rl) {
                Ok(()) => problems.error_fixed(),
                Err(e) => warn!(mft_no = ino.mft_no, error = %e, "mapping pair rewrite failed"),
            }
        }
    }

    Ok(size)
}

/// Relocates every duplicated extent of `rl` onto freshly allocated
/// clusters, copying content, and returns the repaired runlist.
pub fn repair_cluster_dup(vol: &mut Volume, rl: Runlist, dup: &Runlist) -> Result<Runlist> {
    let mut current = rl;
    for d in dup.runs() {
        let hint = match d.lcn {
            LcnValue::Real(l) => crate::types::Lcn(l.0 + d.length),
            _ => continue,
        };
        let punched = current.punch(d.vcn, d.length);
        let fresh = vol.relocate_clusters(&punched, hint)?;
        current = Runlist::merge(current, fresh)?;
    }
    Ok(current)
}

/// Rewrites the mapping pairs of a single-record attribute in place and
/// refreshes its vcn and size fields. Attributes spanning extent records
/// are left for a later run.
pub fn update_mapping_pairs(
    vol: &mut Volume,
    ino: &mut Inode,
    ty: u32,
    name: &[u16],
    rl: &Runlist,
) -> Result<()> {
    // Count instances first: rewriting a chain that spans extent records
    // is not attempted, the next run picks it up once the chain is whole.
    let mut instances = 0;
    let slots =
        std::iter::once(RecSlot::Base).chain((0..ino.extents.len()).map(RecSlot::Extent));
    for slot in slots {
        if let Ok(view) = MftRecord::new(ino.record(slot)) {
            for (_, a) in view.attributes() {
                if a.type_code() == ty
                    && a.is_non_resident()
                    && a.name().map(|n| n.as_slice() == name).unwrap_or(false)
                {
                    instances += 1;
                }
            }
        }
    }
    if instances != 1 {
        return Err(FsckError::RecordFull {
            mft_no: ino.mft_no,
            attr_type: ty,
        });
    }

    let (slot, ofs) = ino
        .find_attr(ty, Some(name))
        .ok_or_else(|| FsckError::NotFound(format!("attribute 0x{ty:x}")))?;

    let ntfs_v3 = vol.major_ver >= 3;
    let a = ino.attr_view(slot, ofs);
    let attr_len = a.length() as usize;
    let mp_ofs = a.mapping_pairs_offset() as usize;
    let max = attr_len - mp_ofs;
    let bytes = rl.encode(Vcn(0), max, ntfs_v3)?;

    let end_vcn = rl.end_vcn();
    let alloc = rl.allocated_clusters() << vol.cluster_size_bits;
    let rec = ino.record_mut(slot);
    rec[ofs + mp_ofs..ofs + mp_ofs + bytes.len()].copy_from_slice(&bytes);
    rec[ofs + mp_ofs + bytes.len()..ofs + attr_len].fill(0);
    attr_set::set_highest_vcn(rec, ofs, end_vcn - 1);
    attr_set::set_allocated_size(rec, ofs, alloc);
    Ok(())
}

/// Walks every non-resident attribute of the inode, setting or clearing
/// its clusters in the FCB. Per-type streams are visited once via their
/// `lowest_vcn == 0` instance.
pub fn check_inode_non_resident(
    vol: &mut Volume,
    ino: &mut Inode,
    set_bit: bool,
    problems: &mut ProblemEngine,
) -> Result<()> {
    // Collect (type, name) pairs first; the checks mutate the records.
    let mut targets: Vec<(u32, Vec<u16>)> = Vec::new();
    let slots =
        std::iter::once(RecSlot::Base).chain((0..ino.extents.len()).map(RecSlot::Extent));
    for slot in slots {
        let Ok(view) = MftRecord::new(ino.record(slot)) else {
            continue;
        };
        for (_, a) in view.attributes() {
            if !a.is_non_resident() || a.lowest_vcn() != 0 {
                continue;
            }
            if a.type_code() >= attr_type::FIRST_USER_DEFINED {
                continue;
            }
            let Ok(name) = a.name() else { continue };
            let key = (a.type_code(), name);
            if !targets.contains(&key) {
                targets.push(key);
            }
        }
    }

    for (ty, name) in targets {
        check_non_resident_attr(vol, ino, ty, &name, set_bit, problems)?;
    }
    Ok(())
}

/// Reads the complete data of an attribute, resident or decomposed.
pub fn read_full_attr_data(
    vol: &mut Volume,
    ino: &mut Inode,
    ty: u32,
    name: &[u16],
    problems: &mut ProblemEngine,
) -> Result<Vec<u8>> {
    let (slot, ofs) = ino
        .find_attr(ty, Some(name))
        .ok_or_else(|| FsckError::NotFound(format!("attribute 0x{ty:x}")))?;
    let a = ino.attr_view(slot, ofs);
    if !a.is_non_resident() {
        return Ok(a.value()?.to_vec());
    }
    let data_size = a.data_size().max(0) as usize;
    let (rl, _) = decompose_full_runlist(vol, ino, ty, name, problems)?;
    let mut buf = vec![0u8; data_size];
    vol.attr_pread(&rl, 0, &mut buf)?;
    Ok(buf)
}

/// Writes the complete data of an attribute back, size unchanged.
pub fn write_full_attr_data(
    vol: &mut Volume,
    ino: &mut Inode,
    ty: u32,
    name: &[u16],
    data: &[u8],
    problems: &mut ProblemEngine,
) -> Result<()> {
    let (slot, ofs) = ino
        .find_attr(ty, Some(name))
        .ok_or_else(|| FsckError::NotFound(format!("attribute 0x{ty:x}")))?;
    let a = ino.attr_view(slot, ofs);
    if !a.is_non_resident() {
        let vofs = ofs + a.value_offset() as usize;
        let len = (a.value_length() as usize).min(data.len());
        ino.record_mut(slot)[vofs..vofs + len].copy_from_slice(&data[..len]);
        return Ok(());
    }
    let (rl, _) = decompose_full_runlist(vol, ino, ty, name, problems)?;
    vol.attr_pwrite(&rl, 0, data)
}
