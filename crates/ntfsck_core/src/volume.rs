//! The mounted volume: geometry, cached system-file runlists, and every
//! byte-level operation the passes perform on the device.
//!
//! The hot system-file state every pass depends on (the $MFT data and
//! bitmap runlists, the $Bitmap runlist, the $UpCase table, the volume
//! flags) is loaded once at mount time, and all record access flows
//! through those caches.

use crate::bitmap::FsckBitmaps;
use crate::boot::{BootSector, BOOT_SECTOR_SIZE};
use crate::device::VolumeDevice;
use crate::error::{FsckError, Result};
use crate::layout::{self, apply_fixups, attr_type, write_fixups, MftRecord, VOLUME_IS_DIRTY};
use crate::problem::{ProblemCode, ProblemCtx, ProblemEngine};
use crate::runlist::{Runlist, Run};
use crate::types::{system_file, Lcn, LcnValue, Vcn};
use tracing::{debug, info, warn};

pub struct Volume {
    dev: Box<dyn VolumeDevice>,
    pub sector_size: u32,
    pub cluster_size: u32,
    pub cluster_size_bits: u32,
    pub mft_record_size: u32,
    pub mft_record_size_bits: u32,
    pub index_block_size: u32,
    pub nr_clusters: i64,
    pub nr_sectors: u64,
    pub nr_mft_records: u64,
    pub major_ver: u8,
    pub minor_ver: u8,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
    vol_flags: u16,

    mft_runlist: Runlist,
    mftbmp_runlist: Runlist,
    pub mftbmp_size: i64,
    lcnbmp_runlist: Runlist,
    pub lcnbmp_size: i64,
    logfile_runlist: Option<Runlist>,
    logfile_size: i64,
    upcase: Vec<u16>,

    pub bitmaps: FsckBitmaps,
}

impl Volume {
    /// Mounts the volume: parses the boot sector, bootstraps $MFT, compares
    /// it against $MFTMirr, and loads the cached system runlists.
    pub fn mount(
        mut dev: Box<dyn VolumeDevice>,
        problems: &mut ProblemEngine,
    ) -> Result<Volume> {
        let mut bs_buf = vec![0u8; BOOT_SECTOR_SIZE];
        dev.read_at(0, &mut bs_buf)?;
        let bs = match BootSector::parse(&bs_buf) {
            Ok(bs) => bs,
            Err(e) => {
                problems.print(ProblemCode::BootSectorInvalid, &ProblemCtx::None);
                return Err(e);
            }
        };

        let cluster_size = bs.cluster_size();
        let nr_clusters = bs.nr_clusters() as i64;
        if nr_clusters as u64 * cluster_size as u64 > dev.len() {
            return Err(FsckError::InvalidBootSector(format!(
                "{} clusters of {} bytes exceed the device size {}",
                nr_clusters,
                cluster_size,
                dev.len()
            )));
        }
        let mft_record_size = bs.mft_record_size();

        let mut vol = Volume {
            dev,
            sector_size: bs.bytes_per_sector as u32,
            cluster_size,
            cluster_size_bits: cluster_size.trailing_zeros(),
            mft_record_size,
            mft_record_size_bits: mft_record_size.trailing_zeros(),
            index_block_size: bs.index_block_size(),
            nr_clusters,
            nr_sectors: bs.total_sectors,
            nr_mft_records: 0,
            major_ver: 0,
            minor_ver: 0,
            mft_lcn: bs.mft_lcn,
            mftmirr_lcn: bs.mftmirr_lcn,
            vol_flags: 0,
            mft_runlist: Runlist::new(),
            mftbmp_runlist: Runlist::new(),
            mftbmp_size: 0,
            lcnbmp_runlist: Runlist::new(),
            lcnbmp_size: 0,
            logfile_runlist: None,
            logfile_size: 0,
            upcase: Vec::new(),
            bitmaps: FsckBitmaps::new(1, 1),
        };

        vol.load_mft(problems)?;
        vol.compare_mftmirr(problems)?;
        vol.load_system_runlists()?;

        vol.bitmaps = FsckBitmaps::new(vol.nr_clusters as u64, vol.nr_mft_records);
        info!(
            nr_clusters = vol.nr_clusters,
            nr_mft_records = vol.nr_mft_records,
            cluster_size = vol.cluster_size,
            "volume mounted"
        );
        Ok(vol)
    }

    /// Reads MFT record zero directly from `mft_lcn` and decodes the $MFT
    /// runlists the rest of the engine depends on. Falls back to the mirror
    /// when the primary record is unreadable.
    fn load_mft(&mut self, problems: &mut ProblemEngine) -> Result<()> {
        let primary = self.mft_lcn * self.cluster_size as u64;
        let mut rec = vec![0u8; self.mft_record_size as usize];
        self.dev.read_at(primary, &mut rec)?;

        if apply_fixups(&mut rec).is_err() || &rec[0..4] != layout::MFT_MAGIC {
            problems.print(ProblemCode::MountLoadMftFailure, &ProblemCtx::None);
            let mirror = self.mftmirr_lcn * self.cluster_size as u64;
            self.dev.read_at(mirror, &mut rec)?;
            if apply_fixups(&mut rec).is_err() || &rec[0..4] != layout::MFT_MAGIC {
                problems.print(ProblemCode::MountLoadMftmirrFailure, &ProblemCtx::None);
                return Err(FsckError::CorruptRecord {
                    mft_no: 0,
                    reason: "$MFT and $MFTMirr are both unreadable",
                });
            }
            if problems.fix(ProblemCode::MountRepairedMftmirrCorrupted, &ProblemCtx::None)
                && problems.mode().allows_write()
            {
                let mut out = rec.clone();
                write_fixups(&mut out)?;
                self.dev.write_at(primary, &out)?;
            }
        }

        let view = MftRecord::new(&rec)?;
        let mut data_rl = None;
        let mut data_init_size = 0i64;
        let mut bmp_rl = None;
        let mut bmp_size = 0i64;
        for (_, a) in view.attributes() {
            if !a.is_non_resident() {
                continue;
            }
            match a.type_code() {
                attr_type::DATA => {
                    let d = Runlist::decode(a.mapping_pairs()?, Vcn(a.lowest_vcn()))?;
                    data_init_size = a.initialized_size();
                    data_rl = Some(d.runlist);
                }
                attr_type::BITMAP => {
                    let d = Runlist::decode(a.mapping_pairs()?, Vcn(a.lowest_vcn()))?;
                    bmp_size = a.data_size();
                    bmp_rl = Some(d.runlist);
                }
                _ => {}
            }
        }

        self.mft_runlist = data_rl.ok_or(FsckError::CorruptRecord {
            mft_no: 0,
            reason: "$MFT has no non-resident $DATA",
        })?;
        self.mftbmp_runlist = bmp_rl.ok_or(FsckError::CorruptRecord {
            mft_no: 0,
            reason: "$MFT has no $BITMAP",
        })?;
        self.mftbmp_size = bmp_size;
        self.nr_mft_records = (data_init_size >> self.mft_record_size_bits) as u64;
        if self.nr_mft_records < system_file::FIRST_USER {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "$MFT holds fewer records than the reserved set",
            });
        }
        Ok(())
    }

    /// The first four records of $MFT and $MFTMirr must match; the mirror
    /// is repaired from the primary when they don't.
    fn compare_mftmirr(&mut self, problems: &mut ProblemEngine) -> Result<()> {
        let count = 4.min(self.nr_mft_records);
        let len = count as usize * self.mft_record_size as usize;
        let mut mft = vec![0u8; len];
        self.attr_pread(&self.mft_runlist.clone(), 0, &mut mft)?;
        let mirror_pos = self.mftmirr_lcn * self.cluster_size as u64;
        let mut mirr = vec![0u8; len];
        self.dev.read_at(mirror_pos, &mut mirr)?;

        if mft != mirr {
            problems.error_found();
            if problems.fix(ProblemCode::MountMftMftmirrMismatch, &ProblemCtx::None)
                && problems.mode().allows_write()
            {
                self.dev.write_at(mirror_pos, &mft)?;
                problems.error_fixed();
            }
        }
        Ok(())
    }

    fn load_system_runlists(&mut self) -> Result<()> {
        // $Volume: version and dirty flag.
        let rec = self.read_mft_record(system_file::VOLUME)?;
        let view = MftRecord::new(&rec)?;
        for (_, a) in view.attributes() {
            if a.type_code() == attr_type::VOLUME_INFORMATION && !a.is_non_resident() {
                let value = a.value()?;
                self.vol_flags = layout::volume_info_flags(value)?;
                let (major, minor) = layout::volume_info_version(value)?;
                self.major_ver = major;
                self.minor_ver = minor;
            }
        }

        // $Bitmap: the on-disk cluster bitmap stream.
        let rec = self.read_mft_record(system_file::BITMAP)?;
        let view = MftRecord::new(&rec)?;
        for (_, a) in view.attributes() {
            if a.type_code() == attr_type::DATA && a.is_non_resident() {
                let d = Runlist::decode(a.mapping_pairs()?, Vcn(a.lowest_vcn()))?;
                self.lcnbmp_runlist = d.runlist;
                self.lcnbmp_size = a.data_size();
            }
        }
        if self.lcnbmp_runlist.is_empty() {
            return Err(FsckError::CorruptRecord {
                mft_no: system_file::BITMAP,
                reason: "$Bitmap has no non-resident $DATA",
            });
        }

        // $LogFile, if decodable; its absence only disables the reset fix.
        if let Ok(rec) = self.read_mft_record(system_file::LOG_FILE) {
            let view = MftRecord::new(&rec)?;
            for (_, a) in view.attributes() {
                if a.type_code() == attr_type::DATA && a.is_non_resident() {
                    if let Ok(d) = Runlist::decode(a.mapping_pairs()?, Vcn(a.lowest_vcn())) {
                        self.logfile_runlist = Some(d.runlist);
                        self.logfile_size = a.data_size();
                    }
                }
            }
        }

        // $UpCase drives case-insensitive name comparison. A missing or
        // truncated table falls back to ASCII folding.
        self.upcase = self.load_upcase().unwrap_or_else(|_| {
            warn!("$UpCase unreadable, falling back to ASCII case folding");
            default_upcase()
        });
        Ok(())
    }

    fn load_upcase(&mut self) -> Result<Vec<u16>> {
        let rec = self.read_mft_record(system_file::UPCASE)?;
        let view = MftRecord::new(&rec)?;
        for (_, a) in view.attributes() {
            if a.type_code() == attr_type::DATA && a.is_non_resident() {
                let d = Runlist::decode(a.mapping_pairs()?, Vcn(a.lowest_vcn()))?;
                let size = a.data_size().clamp(0, 2 * 65536) as usize;
                let mut buf = vec![0u8; size];
                self.attr_pread(&d.runlist, 0, &mut buf)?;
                let table: Vec<u16> = buf
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                if table.len() == 65536 {
                    return Ok(table);
                }
            }
        }
        Err(FsckError::NotFound("$UpCase table".into()))
    }

    // ------------------------------------------------------------------
    // Raw device access
    // ------------------------------------------------------------------

    pub fn device_len(&self) -> u64 {
        self.dev.len()
    }

    pub fn read_only(&self) -> bool {
        self.dev.read_only()
    }

    pub fn read_sector(&mut self, sector: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.sector_size as usize];
        self.dev.read_at(sector * self.sector_size as u64, &mut buf)?;
        Ok(buf)
    }

    pub fn read_clusters(&mut self, lcn: Lcn, count: i64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (count as usize) << self.cluster_size_bits];
        self.dev
            .read_at((lcn.0 as u64) << self.cluster_size_bits, &mut buf)?;
        Ok(buf)
    }

    pub fn write_clusters(&mut self, lcn: Lcn, data: &[u8]) -> Result<()> {
        self.dev
            .write_at((lcn.0 as u64) << self.cluster_size_bits, data)
    }

    // ------------------------------------------------------------------
    // Attribute streams
    // ------------------------------------------------------------------

    /// Reads `buf.len()` bytes at byte position `pos` of a non-resident
    /// stream described by `rl`. Holes read as zeros.
    pub fn attr_pread(&mut self, rl: &Runlist, pos: u64, buf: &mut [u8]) -> Result<()> {
        let csb = self.cluster_size_bits;
        let mut done = 0usize;
        while done < buf.len() {
            let at = pos + done as u64;
            let vcn = (at >> csb) as i64;
            let in_cluster = (at & ((1u64 << csb) - 1)) as usize;
            let chunk = ((1usize << csb) - in_cluster).min(buf.len() - done);
            match rl.vcn_to_lcn(Vcn(vcn)) {
                LcnValue::Real(l) => {
                    let dev_pos = ((l.0 as u64) << csb) + in_cluster as u64;
                    self.dev.read_at(dev_pos, &mut buf[done..done + chunk])?;
                }
                LcnValue::Hole => {
                    buf[done..done + chunk].fill(0);
                }
                _ => {
                    return Err(FsckError::CorruptRunlist(
                        "read through an unmapped stream region",
                    ))
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Writes through a non-resident stream. Writing into a hole is an
    /// error; the repair paths never shrink holes implicitly.
    pub fn attr_pwrite(&mut self, rl: &Runlist, pos: u64, buf: &[u8]) -> Result<()> {
        let csb = self.cluster_size_bits;
        let mut done = 0usize;
        while done < buf.len() {
            let at = pos + done as u64;
            let vcn = (at >> csb) as i64;
            let in_cluster = (at & ((1u64 << csb) - 1)) as usize;
            let chunk = ((1usize << csb) - in_cluster).min(buf.len() - done);
            match rl.vcn_to_lcn(Vcn(vcn)) {
                LcnValue::Real(l) => {
                    let dev_pos = ((l.0 as u64) << csb) + in_cluster as u64;
                    self.dev.write_at(dev_pos, &buf[done..done + chunk])?;
                }
                _ => {
                    return Err(FsckError::CorruptRunlist(
                        "write through an unmapped stream region",
                    ))
                }
            }
            done += chunk;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // MFT records
    // ------------------------------------------------------------------

    /// Reads and fixup-corrects one MFT record.
    pub fn read_mft_record(&mut self, mft_no: u64) -> Result<Vec<u8>> {
        if mft_no >= self.nr_mft_records {
            return Err(FsckError::OutOfBounds {
                offset: mft_no,
                max: self.nr_mft_records,
            });
        }
        let mut buf = vec![0u8; self.mft_record_size as usize];
        let rl = self.mft_runlist.clone();
        self.attr_pread(&rl, mft_no << self.mft_record_size_bits, &mut buf)?;
        apply_fixups(&mut buf).map_err(|_| FsckError::CorruptRecord {
            mft_no,
            reason: "multi-sector fixup mismatch",
        })?;
        Ok(buf)
    }

    /// Reads one record without undoing fixups. Used by the paths that only
    /// inspect or patch header fields in the first sector.
    pub fn read_mft_record_raw(&mut self, mft_no: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.mft_record_size as usize];
        let rl = self.mft_runlist.clone();
        self.attr_pread(&rl, mft_no << self.mft_record_size_bits, &mut buf)?;
        Ok(buf)
    }

    pub fn write_mft_record_raw(&mut self, mft_no: u64, buf: &[u8]) -> Result<()> {
        let rl = self.mft_runlist.clone();
        self.attr_pwrite(&rl, mft_no << self.mft_record_size_bits, buf)?;
        // $MFTMirr shadows the first records; keep it in step.
        if mft_no < 4.min(self.nr_mft_records) {
            let pos = (self.mftmirr_lcn << self.cluster_size_bits)
                + (mft_no << self.mft_record_size_bits);
            self.dev.write_at(pos, buf)?;
        }
        Ok(())
    }

    /// Regenerates fixups and writes a record back.
    pub fn write_mft_record(&mut self, mft_no: u64, record: &[u8]) -> Result<()> {
        let mut out = record.to_vec();
        write_fixups(&mut out)?;
        self.write_mft_record_raw(mft_no, &out)
    }

    // ------------------------------------------------------------------
    // On-disk bitmaps
    // ------------------------------------------------------------------

    pub fn ondisk_mftbmp_get(&mut self, mft_no: u64) -> Result<bool> {
        let mut byte = [0u8; 1];
        let rl = self.mftbmp_runlist.clone();
        self.attr_pread(&rl, mft_no >> 3, &mut byte)?;
        Ok(byte[0] & (1 << (mft_no & 7)) != 0)
    }

    pub fn ondisk_mftbmp_set_value(&mut self, mft_no: u64, value: bool) -> Result<()> {
        let mut byte = [0u8; 1];
        let rl = self.mftbmp_runlist.clone();
        self.attr_pread(&rl, mft_no >> 3, &mut byte)?;
        if value {
            byte[0] |= 1 << (mft_no & 7);
        } else {
            byte[0] &= !(1 << (mft_no & 7));
        }
        self.attr_pwrite(&rl, mft_no >> 3, &byte)
    }

    pub fn mftbmp_runlist(&self) -> &Runlist {
        &self.mftbmp_runlist
    }

    pub fn lcnbmp_runlist(&self) -> &Runlist {
        &self.lcnbmp_runlist
    }

    pub fn mft_runlist(&self) -> &Runlist {
        &self.mft_runlist
    }

    // ------------------------------------------------------------------
    // Volume flags and the log file
    // ------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.vol_flags & VOLUME_IS_DIRTY != 0
    }

    /// Clears the DIRTY flag in $Volume's $VOLUME_INFORMATION.
    pub fn reset_dirty(&mut self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        debug!("resetting dirty flag");
        let new_flags = self.vol_flags & !VOLUME_IS_DIRTY;
        let mut rec = self.read_mft_record(system_file::VOLUME)?;
        let view = MftRecord::new(&rec)?;
        let mut patch = None;
        for (ofs, a) in view.attributes() {
            if a.type_code() == attr_type::VOLUME_INFORMATION && !a.is_non_resident() {
                patch = Some(ofs + a.value_offset() as usize + 10);
            }
        }
        let at = patch.ok_or(FsckError::NotFound("$VOLUME_INFORMATION".into()))?;
        rec[at] = new_flags as u8;
        rec[at + 1] = (new_flags >> 8) as u8;
        self.write_mft_record(system_file::VOLUME, &rec)?;
        self.vol_flags = new_flags;
        Ok(())
    }

    /// Resets $LogFile to its pristine state by filling the stream with
    /// 0xff, the way a freshly formatted volume carries it.
    pub fn logfile_reset(&mut self) -> Result<()> {
        let rl = self
            .logfile_runlist
            .clone()
            .ok_or_else(|| FsckError::NotFound("$LogFile".into()))?;
        let mut remaining = self.logfile_size;
        let fill = vec![0xffu8; self.cluster_size as usize];
        'runs: for run in rl.runs() {
            if let LcnValue::Real(l) = run.lcn {
                for i in 0..run.length {
                    if remaining <= 0 {
                        break 'runs;
                    }
                    self.write_clusters(Lcn(l.0 + i), &fill)?;
                    remaining -= self.cluster_size as i64;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates `count` fresh clusters near `hint` out of the FCB and
    /// copies the content of `from` into them. Returns the new runlist,
    /// re-based to `from`'s VCN range.
    pub fn relocate_clusters(&mut self, from: &Runlist, hint: Lcn) -> Result<Runlist> {
        let count = from.real_clusters();
        let alloc = self.bitmaps.fcb_allocate(count, hint)?;

        // Copy cluster by cluster; both lists address `count` real clusters.
        let src: Vec<Lcn> = from
            .runs()
            .iter()
            .filter_map(|r| r.lcn.lcn().map(|l| (l, r.length)))
            .flat_map(|(l, len)| (0..len).map(move |i| Lcn(l.0 + i)))
            .collect();
        let dst: Vec<Lcn> = alloc
            .runs()
            .iter()
            .filter_map(|r| r.lcn.lcn().map(|l| (l, r.length)))
            .flat_map(|(l, len)| (0..len).map(move |i| Lcn(l.0 + i)))
            .collect();
        for (s, d) in src.iter().zip(dst.iter()) {
            let data = self.read_clusters(*s, 1)?;
            self.write_clusters(*d, &data)?;
        }

        // Re-base the allocation onto the punched VCN range.
        let vcns: Vec<i64> = from
            .runs()
            .iter()
            .filter(|r| r.lcn.is_real())
            .flat_map(|r| (0..r.length).map(move |i| r.vcn.0 + i))
            .collect();
        let mut rebased = Runlist::new();
        for (vcn, d) in vcns.iter().zip(dst.iter()) {
            rebased.push(Run {
                vcn: Vcn(*vcn),
                lcn: LcnValue::Real(*d),
                length: 1,
            });
        }
        Ok(rebased)
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    pub fn upcase(&self, c: u16) -> u16 {
        self.upcase.get(c as usize).copied().unwrap_or(c)
    }

    /// Case-insensitive name equality through the $UpCase table.
    pub fn names_equal(&self, a: &[u16], b: &[u16], case_sensitive: bool) -> bool {
        if a.len() != b.len() {
            return false;
        }
        if case_sensitive {
            return a == b;
        }
        a.iter()
            .zip(b.iter())
            .all(|(x, y)| self.upcase(*x) == self.upcase(*y))
    }

    /// $I30 collation: case-folded comparison, shorter name first on a tie.
    pub fn collate_names(&self, a: &[u16], b: &[u16]) -> std::cmp::Ordering {
        let folded = |s: &[u16]| -> Vec<u16> { s.iter().map(|c| self.upcase(*c)).collect() };
        folded(a).cmp(&folded(b))
    }
}

fn default_upcase() -> Vec<u16> {
    let mut t: Vec<u16> = (0..=u16::MAX).collect();
    for c in b'a'..=b'z' {
        t[c as usize] = (c as u16) - 32;
    }
    t
}

/// Checks the backup boot sector (last sector, then the middle cluster)
/// and accounts its cluster in the FCB so reconciliation keeps it.
pub fn check_backup_boot(vol: &mut Volume) -> Result<()> {
    let spc_bits = vol.cluster_size_bits - vol.sector_size.trailing_zeros();

    let last = vol.nr_sectors;
    if let Ok(buf) = vol.read_sector(last) {
        if BootSector::is_ntfs(&buf) {
            // The backup sector usually sits one past the counted clusters;
            // the trailing-slack fill covers it there, so a miss is fine.
            let _ = vol
                .bitmaps
                .fcb_set_range(Lcn((last >> spc_bits) as i64), 1, true);
            return Ok(());
        }
    }

    let middle = ((vol.nr_clusters as u64) / 2) << spc_bits;
    if let Ok(buf) = vol.read_sector(middle) {
        if BootSector::is_ntfs(&buf) {
            debug!(sector = middle, "backup boot sector found mid-volume");
            vol.bitmaps
                .fcb_set_range(Lcn((middle >> spc_bits) as i64), 1, true)?;
            return Ok(());
        }
    }

    warn!("no backup boot sector found");
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::device::MemDevice;
    use crate::runlist::Run;

    pub fn rl_single(lcn: i64, len: i64) -> Runlist {
        Runlist::from_runs(vec![Run {
            vcn: Vcn(0),
            lcn: LcnValue::Real(Lcn(lcn)),
            length: len,
        }])
    }

    /// A hand-rolled 1 MiB volume with enough structure for stream,
    /// record, and name-comparison tests. No filesystem image behind it.
    pub fn bare_volume() -> Volume {
        Volume {
            dev: Box::new(MemDevice::new(vec![0u8; 1 << 20])),
            sector_size: 512,
            cluster_size: 4096,
            cluster_size_bits: 12,
            mft_record_size: 1024,
            mft_record_size_bits: 10,
            index_block_size: 4096,
            nr_clusters: 256,
            nr_sectors: 2048,
            nr_mft_records: 64,
            major_ver: 3,
            minor_ver: 1,
            mft_lcn: 4,
            mftmirr_lcn: 128,
            vol_flags: 0,
            mft_runlist: rl_single(4, 16),
            mftbmp_runlist: rl_single(30, 1),
            mftbmp_size: 8,
            lcnbmp_runlist: rl_single(31, 1),
            lcnbmp_size: 32,
            logfile_runlist: Some(rl_single(40, 2)),
            logfile_size: 8192,
            upcase: default_upcase(),
            bitmaps: FsckBitmaps::new(256, 64),
        }
    }
}
