//! The check session: all mutable run state in one place, threaded through
//! the five passes.
//!
//! Pass order is fixed: 1 MFT linear scan (FCB fill + duplicate
//! detection), 2 system files and log reset, 3 directory tree walk,
//! 4 orphan collection, 5 bitmap reconciliation and orphan relink.

use crate::attr;
use crate::error::Result;
use crate::index::{self, NodeId};
use crate::inode::{self, DirVerdict, Inode};
use crate::layout::{attr_type, FileName, IndexEntry, MftRecord};
use crate::orphan;
use crate::problem::{AttrCtx, InodeCtx, IndexCtx, ProblemCode, ProblemCtx, ProblemEngine};
use crate::types::{system_file, CheckOptions, PageIdx, NTFS_BUF_SIZE};
use crate::volume::{check_backup_boot, Volume};
use byteorder::ByteOrder;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Pass progress sink. The CLI hangs a progress bar off this; the library
/// default is silent.
pub trait Progress {
    fn pass_start(&mut self, _name: &str, _total: u64) {}
    fn update(&mut self, _done: u64) {}
    fn pass_end(&mut self) {}
}

pub struct NoProgress;

impl Progress for NoProgress {}

/// Final accounting of a run.
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub errors: u64,
    pub fixes: u64,
    pub checked_mft_records: u64,
}

impl Report {
    pub fn errors_left(&self) -> u64 {
        self.errors.saturating_sub(self.fixes)
    }

    pub fn exit_code(&self) -> i32 {
        use crate::types::exit_code;
        if self.errors_left() > 0 {
            exit_code::ERRORS_LEFT_UNCORRECTED
        } else if self.fixes > 0 {
            exit_code::ERRORS_CORRECTED
        } else {
            exit_code::NO_ERRORS
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BitmapKind {
    Cluster,
    Mft,
}

/// All state the passes share, gathered explicitly instead of process-wide
/// globals: the fsck bitmaps live in the volume, everything else here.
pub struct CheckSession {
    pub vol: Volume,
    pub problems: ProblemEngine,
    pub options: CheckOptions,
    dirs: VecDeque<u64>,
    orphans: Vec<u64>,
    lost_found: u64,
    total_valid_mft: u64,
}

impl CheckSession {
    pub fn new(vol: Volume, problems: ProblemEngine, options: CheckOptions) -> Self {
        Self {
            vol,
            problems,
            options,
            dirs: VecDeque::new(),
            orphans: Vec::new(),
            lost_found: 0,
            total_valid_mft: 0,
        }
    }

    /// Runs the whole pipeline and reports the final accounting. The dirty
    /// flag is cleared on a zero-error run.
    pub fn run(&mut self, progress: &mut dyn Progress) -> Result<Report> {
        check_backup_boot(&mut self.vol)?;

        self.pass1_scan_mft(progress)?;
        self.pass2_system_files(progress)?;
        self.pass3_index_walk(progress)?;
        self.pass4_collect_orphans(progress)?;
        self.pass5_reconcile(progress)?;

        let report = Report {
            errors: self.problems.errors(),
            fixes: self.problems.fixes(),
            checked_mft_records: self.total_valid_mft,
        };

        if report.errors_left() == 0 && self.problems.mode().allows_write() {
            self.vol.reset_dirty()?;
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Pass 1
    // ------------------------------------------------------------------

    /// Linear scan of every in-use MFT record: structural checks, FCB
    /// accumulation, duplicate-cluster detection and relocation.
    fn pass1_scan_mft(&mut self, progress: &mut dyn Progress) -> Result<()> {
        let nr = self.vol.nr_mft_records;
        progress.pass_start("Scan mft entries in volume...", nr);
        self.problems.fix(ProblemCode::PreScanMft, &ProblemCtx::None);

        for mft_no in system_file::MFT..nr {
            progress.update(mft_no + 1);
            match self.vol.ondisk_mftbmp_get(mft_no) {
                Ok(true) => {}
                _ => continue,
            }

            let mut ino = match inode::open_inode(&mut self.vol, mft_no, &mut self.problems) {
                Ok(i) => i,
                // Extent records and broken records surface in later passes.
                Err(_) => continue,
            };

            if ino.attr_list.is_some()
                && attr::check_attr_list(&mut ino, &mut self.problems).is_err()
            {
                debug!(mft_no, "attribute list unusable, record left for pass 4");
                continue;
            }

            if attr::check_inode_non_resident(&mut self.vol, &mut ino, true, &mut self.problems)
                .is_err()
            {
                // Roll back whatever bits this record managed to claim.
                let _ = attr::check_inode_non_resident(
                    &mut self.vol,
                    &mut ino,
                    false,
                    &mut self.problems,
                );
                continue;
            }

            if ino.is_dirty() && self.problems.mode().allows_write() {
                ino.sync(&mut self.vol)?;
            }
            self.total_valid_mft += 1;
        }

        progress.pass_end();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pass 2
    // ------------------------------------------------------------------

    fn pass2_system_files(&mut self, progress: &mut dyn Progress) -> Result<()> {
        progress.pass_start("Check system files...", system_file::FIRST_USER);

        let mut root = inode::open_inode(&mut self.vol, system_file::ROOT, &mut self.problems)?;
        if root.attr_list.is_some() {
            attr::check_attr_list(&mut root, &mut self.problems)?;
        }
        if inode::check_directory(&mut self.vol, &mut root, &mut self.problems)?
            != DirVerdict::Ok
        {
            warn!("root directory shape is corrupt, pass 3 will reinitialize it");
        }
        inode::set_mft_record_bitmap(&mut self.vol, &root, false)?;
        if let Err(e) = orphan::check_lost_found(
            &mut self.vol,
            &mut root,
            &mut self.lost_found,
            &mut self.problems,
        ) {
            debug!(error = %e, "lost+found lookup deferred to pass 5");
        }
        root.sync(&mut self.vol)?;
        drop(root);

        for mft_no in [
            system_file::MFT,
            system_file::MFT_MIRR,
            system_file::VOLUME,
            system_file::BITMAP,
            system_file::SECURE,
        ] {
            progress.update(mft_no + 1);
            let Ok(ino) = inode::open_inode(&mut self.vol, mft_no, &mut self.problems) else {
                warn!(mft_no, "failed to open system file");
                continue;
            };
            inode::set_mft_record_bitmap(&mut self.vol, &ino, false)?;
        }
        self.check_bitmap_size()?;

        // Reserved records are accounted but never inspected further.
        for mft_no in system_file::RESERVED12..system_file::FIRST_USER {
            progress.update(mft_no + 1);
            if let Ok(rec) = self.vol.read_mft_record(mft_no) {
                if MftRecord::new(&rec)?.is_in_use() {
                    self.vol.bitmaps.fmb_set(mft_no)?;
                }
            }
        }

        // The journal is not replayed, only reset to a clean state.
        if self
            .problems
            .fix(ProblemCode::ResetLogFile, &ProblemCtx::None)
            && self.problems.mode().allows_write()
        {
            if let Err(e) = self.vol.logfile_reset() {
                warn!(error = %e, "logfile reset failed");
            }
        }

        progress.pass_end();
        Ok(())
    }

    /// `$Bitmap` must span every cluster; a short one is zero-extended.
    fn check_bitmap_size(&mut self) -> Result<()> {
        let max_lcnbmp_size = (self.vol.nr_clusters + 7) >> 3;
        let data_size = self.vol.lcnbmp_size;
        if max_lcnbmp_size <= data_size {
            return Ok(());
        }
        let ctx = ProblemCtx::Attr(AttrCtx {
            inode: InodeCtx::num(system_file::BITMAP),
            attr_type: attr_type::DATA,
            data_size,
            specific: max_lcnbmp_size,
            ..Default::default()
        });
        self.problems.error_found();
        if !self
            .problems
            .fix(ProblemCode::BitmapMftSizeMismatch, &ctx)
        {
            return Ok(());
        }

        let allocated_bytes =
            self.vol.lcnbmp_runlist().allocated_clusters() << self.vol.cluster_size_bits;
        if allocated_bytes < max_lcnbmp_size {
            warn!("cluster bitmap allocation too small to extend");
            return Ok(());
        }
        let rl = self.vol.lcnbmp_runlist().clone();
        let zeros = vec![0u8; (max_lcnbmp_size - data_size) as usize];
        self.vol.attr_pwrite(&rl, data_size as u64, &zeros)?;

        // Refresh the size fields in $Bitmap's record.
        let mut ino = inode::open_inode(&mut self.vol, system_file::BITMAP, &mut self.problems)?;
        if let Some((slot, ofs)) = ino.find_attr(attr_type::DATA, Some(&[])) {
            let rec = ino.record_mut(slot);
            crate::layout::attr_set::set_data_size(rec, ofs, max_lcnbmp_size);
            crate::layout::attr_set::set_initialized_size(rec, ofs, max_lcnbmp_size);
        }
        ino.sync(&mut self.vol)?;
        self.vol.lcnbmp_size = max_lcnbmp_size;
        self.problems.error_fixed();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pass 3
    // ------------------------------------------------------------------

    fn pass3_index_walk(&mut self, progress: &mut dyn Progress) -> Result<()> {
        progress.pass_start("Check index entries in volume...", self.total_valid_mft);
        let mut checked = 0u64;

        self.dirs.clear();
        self.dirs.push_back(system_file::ROOT);

        while let Some(dir_no) = self.dirs.pop_front() {
            let mut dir = match inode::open_inode(&mut self.vol, dir_no, &mut self.problems) {
                Ok(d) => d,
                Err(e) => {
                    warn!(dir_no, error = %e, "failed to open queued directory");
                    continue;
                }
            };
            self.walk_one_directory(&mut dir, &mut checked, progress)?;
            dir.sync(&mut self.vol)?;
        }

        progress.pass_end();
        Ok(())
    }

    fn walk_one_directory(
        &mut self,
        dir: &mut Inode,
        checked: &mut u64,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        index::check_empty_root_length(dir, &mut self.problems)?;

        let mut idx = match index::load_index(&mut self.vol, dir, &mut self.problems) {
            Ok(idx) => idx,
            Err(e) => {
                debug!(dir = dir.mft_no, error = %e, "index unreadable");
                return self.initialize_dir_index(dir);
            }
        };

        if !index::prevalidate_index(&self.vol, dir, &idx, &mut self.problems) {
            return self.initialize_dir_index(dir);
        }

        let entries = match idx.collect_in_order() {
            Ok(e) => e,
            Err(_) => return self.initialize_dir_index(dir),
        };

        let mut removals: Vec<(NodeId, usize)> = Vec::new();
        for (node, pos) in entries {
            *checked += 1;
            progress.update(*checked);
            let (child_ref, key_ofs, key_len) = {
                let e = IndexEntry::new(idx.entry_bytes(node, pos))?;
                (
                    e.indexed_file(),
                    pos + crate::layout::INDEX_ENTRY_HEADER_SIZE,
                    e.key_length() as usize,
                )
            };
            let child_no = child_ref.mft_no();
            if child_no == dir.mft_no {
                continue;
            }

            // System records were or will be validated by pass 2; their
            // entries are kept regardless.
            if child_no < system_file::FIRST_USER {
                if let Ok(sys) = inode::open_inode(&mut self.vol, child_no, &mut self.problems) {
                    inode::set_mft_record_bitmap(&mut self.vol, &sys, false)?;
                }
                continue;
            }

            let mut key = idx.entry_bytes(node, key_ofs)[..key_len].to_vec();
            let orig_key = key.clone();
            let keep = self.check_one_entry(dir.mft_no, child_ref, &mut key);
            if key != orig_key {
                idx.patch_entry(node, key_ofs, &key);
            }
            if !keep {
                let name = FileName::new(&orig_key)
                    .map(|f| f.name_string())
                    .unwrap_or_default();
                let ctx = ProblemCtx::Index(IndexCtx {
                    inode: InodeCtx {
                        mft_no: child_no,
                        name: Some(name),
                        ..Default::default()
                    },
                    parent_mft_no: dir.mft_no,
                    ..Default::default()
                });
                self.problems.error_found();
                if self.problems.fix(ProblemCode::IdxEntryCorrupted, &ctx) {
                    removals.push((node, pos));
                    self.problems.error_fixed();
                }
            }
        }

        // Apply removals back to front so earlier offsets stay valid.
        removals.sort_by(|a, b| b.1.cmp(&a.1));
        for (node, pos) in removals {
            if idx.remove_entry(node, pos).is_err() {
                // Internal entry: resetting the whole index is the fallback.
                return self.initialize_dir_index(dir);
            }
        }

        if self.problems.mode().allows_write() {
            index::store_index(&mut self.vol, dir, &mut idx)?;
        }

        if idx.ia_runlist.is_some() {
            dir.fsck_ibm = Some(index::expected_index_bitmap(&idx));
            if let Some(expected) = dir.fsck_ibm.take() {
                index::check_index_bitmap(&mut self.vol, dir, &expected, &mut self.problems)?;
            }
        }
        Ok(())
    }

    /// Validates one index entry's target inode. Returns whether the entry
    /// survives; the key may be rewritten in place.
    fn check_one_entry(
        &mut self,
        parent_no: u64,
        child_ref: crate::types::MftRef,
        key: &mut [u8],
    ) -> bool {
        let child_no = child_ref.mft_no();
        let mut child = match inode::open_inode(&mut self.vol, child_no, &mut self.problems) {
            Ok(c) => c,
            Err(e) => {
                debug!(child_no, error = %e, "index entry target unopenable");
                return false;
            }
        };

        let already_checked = self.vol.bitmaps.fmb_get(child_no);
        let ok = if already_checked {
            self.revalidate_entry(parent_no, &mut child, key)
        } else {
            self.validate_entry(parent_no, child_ref, &mut child, key)
        };

        if !ok {
            if !already_checked {
                let _ = attr::check_inode_non_resident(
                    &mut self.vol,
                    &mut child,
                    false,
                    &mut self.problems,
                );
            }
            return false;
        }

        if self.options.reparse_tag_fixup {
            let _ = inode::fixup_reparse_tag(&child, key);
        }

        if !already_checked {
            if inode::set_mft_record_bitmap(&mut self.vol, &child, false).is_err() {
                return false;
            }
            if child.is_directory() {
                self.dirs.push_back(child_no);
            }
        }
        if child.is_dirty() && self.problems.mode().allows_write() {
            let _ = child.sync(&mut self.vol);
        }
        true
    }

    fn revalidate_entry(&mut self, parent_no: u64, child: &mut Inode, key: &mut [u8]) -> bool {
        if inode::check_file_type(&mut self.vol, child, key, &mut self.problems).is_err() {
            return false;
        }
        inode::check_file_name_attr(&mut self.vol, child, key, parent_no, &mut self.problems)
            .is_ok()
    }

    fn validate_entry(
        &mut self,
        parent_no: u64,
        child_ref: crate::types::MftRef,
        child: &mut Inode,
        key: &mut [u8],
    ) -> bool {
        if inode::check_inode_fields(child, child_ref).is_err() {
            return false;
        }
        if child.attr_list.is_some()
            && attr::check_attr_list(child, &mut self.problems).is_err()
        {
            return false;
        }
        let Ok((flags, _)) =
            inode::check_file_type(&mut self.vol, child, key, &mut self.problems)
        else {
            return false;
        };

        use crate::layout::file_attr;
        if flags & file_attr::I30_INDEX_PRESENT != 0 {
            match inode::check_directory(&mut self.vol, child, &mut self.problems) {
                Ok(DirVerdict::Ok) => {}
                Ok(DirVerdict::NeedsIndexInit) => {
                    if index::initialize_index(&mut self.vol, child).is_err() {
                        return false;
                    }
                }
                _ => return false,
            }
        } else if flags & file_attr::VIEW_INDEX_PRESENT != 0 {
            // View indexes are left to their owners.
        } else if inode::check_file(&self.vol, child, &mut self.problems).is_err() {
            return false;
        }

        if self.options.unmapped_data_size_check {
            self.check_unmapped_data_size(child);
        }

        inode::check_file_name_attr(&mut self.vol, child, key, parent_no, &mut self.problems)
            .is_ok()
    }

    /// Opt-in: a non-resident `$DATA` whose mapping decodes to nothing at
    /// all must also declare a zero data size.
    fn check_unmapped_data_size(&mut self, child: &mut Inode) {
        let Some((slot, ofs)) = child.find_attr(attr_type::DATA, Some(&[])) else {
            return;
        };
        let a = child.attr_view(slot, ofs);
        if !a.is_non_resident() {
            return;
        }
        let Ok(mp) = a.mapping_pairs() else { return };
        let Ok(d) = crate::runlist::Runlist::decode(mp, crate::types::Vcn(a.lowest_vcn()))
        else {
            return;
        };
        if d.runlist.allocated_clusters() == 0 && a.data_size() > 0 {
            let ctx = ProblemCtx::Attr(AttrCtx {
                inode: InodeCtx::num(child.mft_no),
                attr_type: attr_type::DATA,
                data_size: a.data_size(),
                ..Default::default()
            });
            self.problems.print(ProblemCode::AttrNonResidentSizesMismatch, &ctx);
        }
    }

    fn initialize_dir_index(&mut self, dir: &mut Inode) -> Result<()> {
        let ctx = ProblemCtx::Inode(InodeCtx::num(dir.mft_no));
        self.problems.error_found();
        if !self.problems.fix(ProblemCode::DirIdxInitialize, &ctx) {
            return Ok(());
        }
        if dir.mft_no == system_file::ROOT {
            index::initialize_root_index(&mut self.vol, dir)?;
            self.reseed_root_index(dir)?;
        } else {
            index::initialize_index(&mut self.vol, dir)?;
        }
        dir.sync(&mut self.vol)?;
        self.problems.error_fixed();
        info!(mft_no = dir.mft_no, "directory index initialized");
        Ok(())
    }

    /// After the root index is reset, the system files' entries are
    /// re-inserted so pass 2's accounting stays truthful.
    fn reseed_root_index(&mut self, root: &mut Inode) -> Result<()> {
        let mut idx = index::load_index(&mut self.vol, root, &mut self.problems)?;
        for mft_no in system_file::MFT..system_file::FIRST_USER {
            let Ok(rec) = self.vol.read_mft_record(mft_no) else {
                continue;
            };
            let view = MftRecord::new(&rec)?;
            if !view.is_in_use() {
                continue;
            }
            let seq = view.sequence_number();
            let Some(ofs) = attr::find_attr_in_record(&rec, attr_type::FILE_NAME, None) else {
                continue;
            };
            let a = crate::layout::AttrRecord::from_slice(&rec[ofs..ofs + a_len(&rec, ofs)]);
            let Ok(value) = a.value() else { continue };
            let Ok(fname) = FileName::new(value) else {
                continue;
            };
            if fname.parent_directory().mft_no() != system_file::ROOT {
                continue;
            }
            let _ = index::insert_file_name_entry(
                &self.vol,
                &mut idx,
                system_file::ROOT,
                crate::types::MftRef::new(mft_no, seq),
                value,
            );
        }
        index::store_index(&mut self.vol, root, &mut idx)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Passes 4 and 5
    // ------------------------------------------------------------------

    fn pass4_collect_orphans(&mut self, progress: &mut dyn Progress) -> Result<()> {
        progress.pass_start("Scan orphaned MFT candidates...", self.vol.nr_mft_records);
        let cleared =
            orphan::collect_candidates(&mut self.vol, &mut self.problems, &mut self.orphans)?;
        if cleared > 0 {
            info!(cleared, "cleared unreadable MFT records");
        }
        progress.pass_end();
        Ok(())
    }

    fn pass5_reconcile(&mut self, progress: &mut dyn Progress) -> Result<()> {
        progress.pass_start("Check orphaned mft...", self.orphans.len() as u64 + 1);

        self.apply_bitmap(BitmapKind::Cluster, true)?;
        self.apply_bitmap(BitmapKind::Mft, true)?;

        if !self.orphans.is_empty() {
            orphan::process_orphans(
                &mut self.vol,
                &mut self.orphans,
                &mut self.lost_found,
                &mut self.problems,
            )?;
        }

        self.apply_bitmap(BitmapKind::Cluster, false)?;
        self.apply_bitmap(BitmapKind::Mft, false)?;

        progress.pass_end();
        Ok(())
    }

    /// Compares one on-disk bitmap against its fsck counterpart page by
    /// page. The initial application unions the two (so nothing allocated
    /// is freed while repairs are still running); the final application
    /// makes the disk byte-equal to the fsck bitmap.
    fn apply_bitmap(&mut self, kind: BitmapKind, initial: bool) -> Result<()> {
        let (rl, total, owner) = match kind {
            BitmapKind::Cluster => (
                self.vol.lcnbmp_runlist().clone(),
                self.vol.lcnbmp_size,
                system_file::BITMAP,
            ),
            BitmapKind::Mft => (
                self.vol.mftbmp_runlist().clone(),
                self.vol.mftbmp_size,
                system_file::MFT,
            ),
        };

        let mut pos = 0i64;
        let mut page = 0u32;
        while pos < total {
            let count = ((total - pos) as usize).min(NTFS_BUF_SIZE);
            let mut disk = vec![0u8; count];
            self.vol.attr_pread(&rl, pos as u64, &mut disk)?;
            let fsck_page = match kind {
                BitmapKind::Cluster => self.vol.bitmaps.fcb_page(PageIdx(page)),
                BitmapKind::Mft => self.vol.bitmaps.fmb_page(PageIdx(page)),
            };
            let fsck = &fsck_page[..count];

            if fsck != disk.as_slice() {
                let ctx = ProblemCtx::Attr(AttrCtx {
                    inode: InodeCtx::num(owner),
                    attr_type: if kind == BitmapKind::Mft {
                        attr_type::BITMAP
                    } else {
                        attr_type::DATA
                    },
                    ..Default::default()
                });
                if !initial {
                    self.problems.error_found();
                }
                if self
                    .problems
                    .fix(ProblemCode::ClusterBitmapMismatch, &ctx)
                {
                    if initial {
                        let union: Vec<u8> =
                            disk.iter().zip(fsck).map(|(d, f)| d | f).collect();
                        self.vol.attr_pwrite(&rl, pos as u64, &union)?;
                    } else {
                        self.vol.attr_pwrite(&rl, pos as u64, fsck)?;
                        self.problems.error_fixed();
                    }
                }
            }

            pos += count as i64;
            page += 1;
        }
        Ok(())
    }
}

fn a_len(rec: &[u8], ofs: usize) -> usize {
    byteorder::LittleEndian::read_u32(&rec[ofs + 4..ofs + 8]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_exit_codes() {
        use crate::types::exit_code;
        let clean = Report {
            errors: 0,
            fixes: 0,
            checked_mft_records: 10,
        };
        assert_eq!(clean.exit_code(), exit_code::NO_ERRORS);

        let fixed = Report {
            errors: 3,
            fixes: 3,
            checked_mft_records: 10,
        };
        assert_eq!(fixed.exit_code(), exit_code::ERRORS_CORRECTED);

        let left = Report {
            errors: 3,
            fixes: 1,
            checked_mft_records: 10,
        };
        assert_eq!(left.exit_code(), exit_code::ERRORS_LEFT_UNCORRECTED);
        assert_eq!(left.errors_left(), 2);
    }
}
