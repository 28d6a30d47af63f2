//! Orphan reconciliation: MFT records that are in use but unreachable
//! through any directory index get relinked under their recorded parent,
//! or under `lost+found`, or unlinked entirely.

use crate::attr;
use crate::error::{FsckError, Result};
use crate::index;
use crate::inode::{self, Inode, RecSlot};
use crate::layout::{
    attr_type, build_file_name, file_attr, mft_set, record_flags, FileName, MftRecord,
};
use crate::problem::{InodeCtx, ProblemCode, ProblemCtx, ProblemEngine};
use crate::types::{system_file, MftRef};
use crate::volume::Volume;
use tracing::{debug, info, warn};

pub const LOST_FOUND_NAME: &str = "lost+found";
pub const LOST_FOUND_PREFIX: &str = "FSCK_#";

/// File name namespace used for names this tool fabricates.
const FILE_NAME_WIN32_AND_DOS: u8 = 3;

fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Every `$FILE_NAME` value in the inode, with its location.
fn file_name_values(ino: &Inode) -> Vec<(RecSlot, usize, Vec<u8>)> {
    let mut out = Vec::new();
    let slots =
        std::iter::once(RecSlot::Base).chain((0..ino.extents.len()).map(RecSlot::Extent));
    for slot in slots {
        let Ok(view) = MftRecord::new(ino.record(slot)) else {
            continue;
        };
        for (ofs, a) in view.attributes() {
            if a.type_code() != attr_type::FILE_NAME || a.is_non_resident() {
                continue;
            }
            if let Ok(v) = a.value() {
                out.push((slot, ofs, v.to_vec()));
            }
        }
    }
    out
}

/// Removes one `$FILE_NAME` attribute and drops the link count.
fn remove_file_name(ino: &mut Inode, slot: RecSlot, ofs: usize) -> Result<()> {
    attr::remove_attr(ino.record_mut(slot), ofs)?;
    let links = ino.base().link_count().saturating_sub(1);
    mft_set::set_link_count(ino.record_mut(RecSlot::Base), links);
    Ok(())
}

/// Marks a record unused on disk and clears it out of both MFT bitmaps.
pub fn delete_orphaned_mft(vol: &mut Volume, mft_no: u64, problems: &ProblemEngine) -> Result<()> {
    if mft_no < system_file::FIRST_USER {
        return Ok(());
    }
    if problems.mode().allows_write() {
        inode::mark_record_unused(vol, mft_no)?;
        vol.ondisk_mftbmp_set_value(mft_no, false)?;
    }
    vol.bitmaps.fmb_clear(mft_no)?;
    Ok(())
}

/// Pass-4 collection: every in-use base record whose FMB bit is still
/// clear after the index walk becomes an orphan candidate. Records that
/// cannot even be opened are cleaned up immediately.
pub fn collect_candidates(
    vol: &mut Volume,
    problems: &mut ProblemEngine,
    orphans: &mut Vec<u64>,
) -> Result<u64> {
    let mut cleared = 0u64;
    for mft_no in system_file::MFT..vol.nr_mft_records {
        if vol.bitmaps.fmb_get(mft_no) {
            continue;
        }
        match vol.ondisk_mftbmp_get(mft_no) {
            Ok(true) => {}
            _ => continue,
        }

        let ctx = ProblemCtx::Inode(InodeCtx::num(mft_no));
        match inode::open_inode(vol, mft_no, problems) {
            Ok(mut ino) => {
                if ino.attr_list.is_some() && attr::check_attr_list(&mut ino, problems).is_err() {
                    if problems.fix(ProblemCode::OrphanedMftCheckFailure, &ctx) {
                        delete_orphaned_mft(vol, mft_no, problems)?;
                        cleared += 1;
                    }
                    continue;
                }
                if mft_no < system_file::FIRST_USER {
                    info!(mft_no, "system record found as orphan");
                }
                orphans.push(mft_no);
            }
            Err(_) => {
                // An extent record is reachable through its base; skip it.
                if let Ok(raw) = vol.read_mft_record_raw(mft_no) {
                    if let Ok(view) = MftRecord::new(&raw) {
                        if view.base_mft_record().mft_no() != 0 {
                            continue;
                        }
                    }
                }
                if problems.fix(ProblemCode::OrphanedMftOpenFailure, &ctx) {
                    delete_orphaned_mft(vol, mft_no, problems)?;
                    cleared += 1;
                }
            }
        }
    }
    Ok(cleared)
}

/// Light orphan sanity: the record must be a base record with links, and
/// its shape must match its kind.
fn check_orphan_inode(
    vol: &mut Volume,
    ino: &mut Inode,
    problems: &mut ProblemEngine,
) -> Result<()> {
    if ino.base().link_count() == 0 {
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "orphan with zero link count",
        });
    }
    if ino.base().base_mft_record().mft_no() != 0 {
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "orphan is an extent record",
        });
    }
    if ino.is_directory() {
        if inode::check_directory(vol, ino, problems)? == inode::DirVerdict::Corrupt {
            return Err(FsckError::CorruptRecord {
                mft_no: ino.mft_no,
                reason: "orphan directory shape is corrupt",
            });
        }
    } else {
        inode::check_file(vol, ino, problems)?;
    }
    Ok(())
}

/// Adds one `$FILE_NAME` link of `child` into the directory `parent_no`.
/// Returns `Ok(true)` when the entry ends up present and pointing at the
/// child (including when it already was).
fn add_inode_to_parent(
    vol: &mut Volume,
    parent_no: u64,
    child: &mut Inode,
    fn_value: &[u8],
    problems: &mut ProblemEngine,
) -> Result<bool> {
    let fname = FileName::new(fn_value)?;
    let mut parent = inode::open_inode(vol, parent_no, problems)?;
    if !parent.is_directory() {
        return Ok(false);
    }

    // A stale parent generation means this link predates the directory.
    if fname.parent_directory().seq_no() != parent.sequence_number() {
        debug!(
            child = child.mft_no,
            parent = parent_no,
            "parent sequence number is stale"
        );
        return Ok(false);
    }

    let mut idx = index::load_index(vol, &mut parent, problems)?;
    let child_ref = MftRef::new(child.mft_no, child.sequence_number());

    if let Some((node, pos)) = idx.lookup(vol, &fname.name())? {
        let e = crate::layout::IndexEntry::new(idx.entry_bytes(node, pos))?;
        return Ok(e.indexed_file().0 == child_ref.0);
    }

    // An orphan directory's own tree was never validated; reset it and
    // let its children resurface as orphans.
    let mut value = fn_value.to_vec();
    if child.is_directory() {
        index::initialize_index(vol, child)?;
        crate::layout::fn_set::set_allocated_size(&mut value, 0);
        crate::layout::fn_set::set_data_size(&mut value, 0);
        let attrs = FileName::new(&value)?.file_attributes() | file_attr::I30_INDEX_PRESENT;
        crate::layout::fn_set::set_file_attributes(&mut value, attrs);
    }
    crate::layout::fn_set::set_parent_directory(
        &mut value,
        MftRef::new(parent_no, parent.sequence_number()),
    );

    index::insert_file_name_entry(vol, &mut idx, parent_no, child_ref, &value)?;
    index::store_index(vol, &mut parent, &mut idx)?;

    // Keep the MFT-side link's parent reference in step with the entry.
    if let Some((slot, ofs, _)) = file_name_values(child)
        .into_iter()
        .find(|(_, _, v)| v.as_slice() == fn_value)
    {
        let a = child.attr_view(slot, ofs);
        let vofs = ofs + a.value_offset() as usize;
        let vlen = a.value_length() as usize;
        child.record_mut(slot)[vofs..vofs + vlen.min(value.len())]
            .copy_from_slice(&value[..vlen.min(value.len())]);
    }

    inode::set_mft_record_bitmap(vol, &parent, true)?;
    parent.mark_dirty();
    parent.sync(vol)?;
    Ok(true)
}

/// Relinks into `lost+found`, renaming to `FSCK_#<mft_no>` when the
/// original name collides with something else.
fn add_inode_to_lostfound(
    vol: &mut Volume,
    lost_found: u64,
    child: &mut Inode,
    fn_value: &[u8],
    problems: &mut ProblemEngine,
) -> Result<bool> {
    if lost_found == 0 {
        return Ok(false);
    }

    let mut value = fn_value.to_vec();
    crate::layout::fn_set::set_parent_directory(
        &mut value,
        MftRef::new(lost_found, lookup_sequence(vol, lost_found, problems)?),
    );
    match add_inode_to_parent(vol, lost_found, child, &value, problems) {
        Ok(true) => return Ok(true),
        Ok(false) | Err(FsckError::Refused(_)) => {}
        Err(e) => return Err(e),
    }

    // Name collision (or stale link): retry under a synthetic name.
    let fname = FileName::new(fn_value)?;
    let new_name = utf16(&format!("{LOST_FOUND_PREFIX}{}", child.mft_no));
    let new_value = build_file_name(
        MftRef::new(lost_found, lookup_sequence(vol, lost_found, problems)?),
        fname.allocated_size(),
        fname.data_size(),
        fname.file_attributes(),
        &new_name,
        FILE_NAME_WIN32_AND_DOS,
    );

    // Swap the $FILE_NAME attribute on the child for the renamed one. The
    // attribute is re-found by value: earlier repair steps may have moved
    // it within the record.
    if let Some((slot, ofs, _)) = file_name_values(child)
        .into_iter()
        .find(|(_, _, v)| v.as_slice() == fn_value)
    {
        attr::remove_attr(child.record_mut(slot), ofs)?;
    }
    attr::insert_resident_attr(
        child.record_mut(RecSlot::Base),
        attr_type::FILE_NAME,
        &[],
        &new_value,
    )?;

    match add_inode_to_parent(vol, lost_found, child, &new_value, problems) {
        Ok(linked) => Ok(linked),
        Err(FsckError::Refused(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn lookup_sequence(vol: &mut Volume, mft_no: u64, _problems: &mut ProblemEngine) -> Result<u16> {
    let rec = vol.read_mft_record(mft_no)?;
    Ok(MftRecord::new(&rec)?.sequence_number())
}

/// Pass-5 drain: resolves each candidate, climbing broken parent chains
/// depth-first so a parent is reattached before its children retry.
pub fn process_orphans(
    vol: &mut Volume,
    orphans: &mut Vec<u64>,
    lost_found: &mut u64,
    problems: &mut ProblemEngine,
) -> Result<()> {
    while let Some(first) = orphans.first().copied() {
        orphans.remove(0);
        let ctx = ProblemCtx::Inode(InodeCtx::num(first));
        problems.error_found();
        if !problems.fix(ProblemCode::OrphanedMftRepair, &ctx) {
            continue;
        }
        relink_orphan_tree(vol, orphans, lost_found, first, problems)?;
        problems.error_fixed();
    }
    Ok(())
}

fn relink_orphan_tree(
    vol: &mut Volume,
    orphans: &mut Vec<u64>,
    lost_found: &mut u64,
    start: u64,
    problems: &mut ProblemEngine,
) -> Result<()> {
    let mut stack: Vec<u64> = vec![start];

    'outer: while let Some(cur) = stack.last().copied() {
        if stack.len() > 64 {
            warn!(mft_no = cur, "orphan parent chain too deep, cutting to lost+found");
        }

        let mut ino = match inode::open_inode(vol, cur, problems) {
            Ok(i) => i,
            Err(_) => {
                delete_orphaned_mft(vol, cur, problems)?;
                stack.pop();
                continue;
            }
        };

        if check_orphan_inode(vol, &mut ino, problems).is_err() {
            let ctx = ProblemCtx::Inode(InodeCtx::num(cur));
            if problems.fix(ProblemCode::OrphanedMftCheckFailure, &ctx) {
                attr::check_inode_non_resident(vol, &mut ino, false, problems).ok();
                delete_orphaned_mft(vol, cur, problems)?;
            }
            stack.pop();
            continue;
        }

        let mut nlink: u16 = 0;
        let names = file_name_values(&ino);
        for (_, _, fn_value) in &names {
            let Ok(fname) = FileName::new(fn_value) else {
                continue;
            };
            let parent_no = fname.parent_directory().mft_no();

            if !vol.bitmaps.fmb_get(parent_no) && stack.len() <= 64 {
                if let Some(at) = orphans.iter().position(|&o| o == parent_no) {
                    // The parent is an orphan too: resolve it first, then
                    // come back to this record.
                    orphans.remove(at);
                    ino.clear_dirty();
                    stack.push(parent_no);
                    continue 'outer;
                }
            }

            let linked = if vol.bitmaps.fmb_get(parent_no)
                && matches!(
                    add_inode_to_parent(vol, parent_no, &mut ino, fn_value, problems),
                    Ok(true)
                ) {
                true
            } else {
                ensure_lost_found(vol, lost_found, problems)?;
                add_inode_to_lostfound(vol, *lost_found, &mut ino, fn_value, problems)
                    .unwrap_or(false)
            };

            if linked {
                nlink += 1;
            } else {
                warn!(mft_no = cur, "dropping unlinkable $FILE_NAME");
                if let Some((s, o, _)) = file_name_values(&ino)
                    .into_iter()
                    .find(|(_, _, v)| v == fn_value)
                {
                    remove_file_name(&mut ino, s, o).ok();
                }
            }
        }

        if nlink == 0 {
            attr::check_inode_non_resident(vol, &mut ino, false, problems).ok();
            drop(ino);
            delete_orphaned_mft(vol, cur, problems)?;
        } else {
            if nlink != ino.base().link_count() {
                mft_set::set_link_count(ino.record_mut(RecSlot::Base), nlink);
            }
            inode::set_mft_record_bitmap(vol, &ino, true)?;
            ino.mark_dirty();
            ino.sync(vol)?;
        }
        stack.pop();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// lost+found
// ---------------------------------------------------------------------------

/// Verifies the `lost+found` entry found in the root index. A healthy one
/// sets the session's record number; a corrupt one is removed so a fresh
/// directory can be created later.
pub fn check_lost_found(
    vol: &mut Volume,
    root: &mut Inode,
    lost_found: &mut u64,
    problems: &mut ProblemEngine,
) -> Result<()> {
    let name = utf16(LOST_FOUND_NAME);
    let idx = index::load_index(vol, root, problems)?;
    let Some((node, pos)) = idx.lookup(vol, &name)? else {
        return Ok(());
    };
    let lf_ref = crate::layout::IndexEntry::new(idx.entry_bytes(node, pos))?.indexed_file();

    match inode::open_inode(vol, lf_ref.mft_no(), problems) {
        Ok(mut lf) => {
            // The directory's own $FILE_NAME must point back at root.
            let mut healthy = false;
            for (slot, ofs, v) in file_name_values(&lf) {
                let Ok(fname) = FileName::new(&v) else { continue };
                if fname.name_string() == LOST_FOUND_NAME {
                    if fname.parent_directory().mft_no() != system_file::ROOT {
                        let a = lf.attr_view(slot, ofs);
                        let vofs = ofs + a.value_offset() as usize;
                        let root_ref = MftRef::new(system_file::ROOT, root.sequence_number());
                        crate::layout::fn_set::set_parent_directory(
                            &mut lf.record_mut(slot)[vofs..],
                            root_ref,
                        );
                        lf.sync(vol)?;
                    }
                    healthy = true;
                    break;
                }
            }
            if healthy {
                *lost_found = lf.mft_no;
            }
        }
        Err(_) => {
            debug!(mft_no = lf_ref.mft_no(), "removing corrupt lost+found entry");
            let mut idx = index::load_index(vol, root, problems)?;
            if let Some((node, pos)) = idx.lookup(vol, &name)? {
                idx.remove_entry(node, pos)?;
                index::store_index(vol, root, &mut idx)?;
                root.sync(vol)?;
            }
            *lost_found = 0;
        }
    }
    Ok(())
}

/// Creates `lost+found` under the root directory if the session has none.
pub fn ensure_lost_found(
    vol: &mut Volume,
    lost_found: &mut u64,
    problems: &mut ProblemEngine,
) -> Result<()> {
    if *lost_found != 0 || !problems.mode().allows_write() {
        return Ok(());
    }

    // A free record: clear on disk and in the FMB.
    let mut free = None;
    for mft_no in system_file::FIRST_USER..vol.nr_mft_records {
        if !vol.bitmaps.fmb_get(mft_no) && !vol.ondisk_mftbmp_get(mft_no)? {
            free = Some(mft_no);
            break;
        }
    }
    let Some(mft_no) = free else {
        return Err(FsckError::NoSpace { count: 1 });
    };

    let old_seq = vol
        .read_mft_record_raw(mft_no)
        .ok()
        .and_then(|r| MftRecord::new(&r).ok().map(|v| v.sequence_number()))
        .unwrap_or(0);
    let seq = if old_seq == 0 || old_seq == 0xffff {
        1
    } else {
        old_seq
    };

    let mut root = inode::open_inode(vol, system_file::ROOT, problems)?;
    let root_ref = MftRef::new(system_file::ROOT, root.sequence_number());

    let mut rec = attr::build_empty_record(
        vol.mft_record_size,
        seq,
        record_flags::IN_USE | record_flags::IS_DIRECTORY,
    );
    let std_info = vec![0u8; 72];
    attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &std_info)?;
    let fn_value = build_file_name(
        root_ref,
        0,
        0,
        file_attr::I30_INDEX_PRESENT,
        &utf16(LOST_FOUND_NAME),
        FILE_NAME_WIN32_AND_DOS,
    );
    attr::insert_resident_attr(&mut rec, attr_type::FILE_NAME, &[], &fn_value)?;
    let root_value = index::build_empty_root_value(vol.index_block_size, vol.cluster_size);
    attr::insert_resident_attr(&mut rec, attr_type::INDEX_ROOT, attr::I30, &root_value)?;
    vol.write_mft_record(mft_no, &rec)?;
    vol.bitmaps.fmb_set(mft_no)?;
    vol.ondisk_mftbmp_set_value(mft_no, true)?;

    // Hook it into the root index.
    let mut idx = index::load_index(vol, &mut root, problems)?;
    index::insert_file_name_entry(vol, &mut idx, system_file::ROOT, MftRef::new(mft_no, seq), &fn_value)?;
    index::store_index(vol, &mut root, &mut idx)?;
    root.sync(vol)?;

    info!(mft_no, "created lost+found");
    *lost_found = mft_no;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_found_names() {
        assert_eq!(LOST_FOUND_NAME, "lost+found");
        assert_eq!(format!("{LOST_FOUND_PREFIX}{}", 42u64), "FSCK_#42");
    }

    #[test]
    fn test_utf16_round_trip() {
        let n = utf16(LOST_FOUND_NAME);
        assert_eq!(String::from_utf16_lossy(&n), LOST_FOUND_NAME);
    }
}
