//! Builds small synthetic NTFS images for end-to-end checker tests.
//!
//! Geometry: 512-byte sectors, 4 KiB clusters, 1 KiB MFT records, 4 KiB
//! index blocks, 2048 clusters, 64 MFT records. The root directory is a
//! one-block large index so it can hold the system-file entries plus a
//! handful of test files.

use byteorder::{ByteOrder, LittleEndian};
use ntfsck_core::layout::{self, attr_type, file_attr, record_flags};
use ntfsck_core::runlist::{Run, Runlist};
use ntfsck_core::types::{Lcn, LcnValue, MftRef, Vcn};
use ntfsck_core::{attr, index, VolumeDevice};
use std::sync::{Arc, Mutex};

pub const SECTOR: usize = 512;
pub const CLUSTER: usize = 4096;
pub const RECORD: usize = 1024;
pub const NR_CLUSTERS: u64 = 2048;
pub const TOTAL_SECTORS: u64 = NR_CLUSTERS * 8;
pub const NR_RECORDS: u64 = 64;

pub const MFT_LCN: u64 = 4;
pub const MFTMIRR_LCN: u64 = 2;
pub const LOGFILE_LCN: u64 = 24;
pub const LCNBMP_LCN: u64 = 30;
pub const MFTBMP_LCN: u64 = 31;
pub const UPCASE_LCN: u64 = 32;
pub const ROOT_BLOCK_LCN: u64 = 64;

pub const ROOT_BLOCK_OFFSET: usize = ROOT_BLOCK_LCN as usize * CLUSTER;

const SEQ: u16 = 1;

fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn rl_from(runs: &[(i64, i64)]) -> Runlist {
    let mut vcn = 0i64;
    let mut out = Vec::new();
    for (lcn, len) in runs {
        out.push(Run {
            vcn: Vcn(vcn),
            lcn: LcnValue::Real(Lcn(*lcn)),
            length: *len,
        });
        vcn += len;
    }
    Runlist::from_runs(out)
}

fn root_ref() -> MftRef {
    MftRef::new(5, SEQ)
}

pub struct VolumeBuilder {
    records: Vec<Vec<u8>>,
    root_entries: Vec<(u64, Vec<u8>)>,
    lcn_bitmap: Vec<u8>,
    mft_bitmap: Vec<u8>,
    data_fills: Vec<(i64, i64)>,
    dirty: bool,
}

impl VolumeBuilder {
    pub fn new() -> Self {
        let mut b = Self {
            records: vec![vec![0u8; RECORD]; NR_RECORDS as usize],
            root_entries: Vec::new(),
            lcn_bitmap: vec![0u8; (NR_CLUSTERS / 8) as usize],
            mft_bitmap: vec![0u8; (NR_RECORDS / 8) as usize],
            data_fills: Vec::new(),
            dirty: false,
        };
        b.seed_system_files();
        b
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    fn mark_clusters(&mut self, lcn: u64, len: u64) {
        for c in lcn..lcn + len {
            self.lcn_bitmap[(c / 8) as usize] |= 1 << (c % 8);
        }
    }

    fn mark_record(&mut self, mft_no: u64) {
        self.mft_bitmap[(mft_no / 8) as usize] |= 1 << (mft_no % 8);
    }

    fn new_record(&mut self, mft_no: u64, flags: u16) -> Vec<u8> {
        self.mark_record(mft_no);
        attr::build_empty_record(RECORD as u32, SEQ, flags)
    }

    fn si_value() -> Vec<u8> {
        vec![0u8; 72]
    }

    fn add_fn_and_entry(
        &mut self,
        rec: &mut Vec<u8>,
        mft_no: u64,
        name: &str,
        alloc: i64,
        data: i64,
        fa: u32,
        with_entry: bool,
    ) {
        let value = layout::build_file_name(root_ref(), alloc, data, fa, &utf16(name), 3);
        attr::insert_resident_attr(rec, attr_type::FILE_NAME, &[], &value).unwrap();
        if with_entry {
            self.root_entries.push((mft_no, value));
        }
    }

    fn seed_system_files(&mut self) {
        // 0: $MFT
        let mut rec = self.new_record(0, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 0, "$MFT", 65536, 65536, 0, true);
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::DATA,
            &[],
            &rl_from(&[(MFT_LCN as i64, 16)]),
            65536,
            12,
            true,
        )
        .unwrap();
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::BITMAP,
            &[],
            &rl_from(&[(MFTBMP_LCN as i64, 1)]),
            8,
            12,
            true,
        )
        .unwrap();
        self.records[0] = rec;
        self.mark_clusters(MFT_LCN, 16);
        self.mark_clusters(MFTBMP_LCN, 1);

        // 1: $MFTMirr
        let mut rec = self.new_record(1, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 1, "$MFTMirr", 4096, 4096, 0, true);
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::DATA,
            &[],
            &rl_from(&[(MFTMIRR_LCN as i64, 1)]),
            4096,
            12,
            true,
        )
        .unwrap();
        self.records[1] = rec;
        self.mark_clusters(MFTMIRR_LCN, 1);

        // 2: $LogFile
        let mut rec = self.new_record(2, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 2, "$LogFile", 16384, 16384, 0, true);
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::DATA,
            &[],
            &rl_from(&[(LOGFILE_LCN as i64, 4)]),
            16384,
            12,
            true,
        )
        .unwrap();
        self.records[2] = rec;
        self.mark_clusters(LOGFILE_LCN, 4);

        // 3: $Volume
        let mut rec = self.new_record(3, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 3, "$Volume", 0, 0, 0, true);
        attr::insert_resident_attr(&mut rec, attr_type::VOLUME_NAME, &[], &[]).unwrap();
        // flags patched at build() when the dirty bit is requested
        let mut vi = vec![0u8; 12];
        vi[8] = 3; // major
        vi[9] = 1; // minor
        attr::insert_resident_attr(&mut rec, attr_type::VOLUME_INFORMATION, &[], &vi).unwrap();
        self.records[3] = rec;

        // 4: $AttrDef
        let mut rec = self.new_record(4, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 4, "$AttrDef", 0, 0, 0, true);
        attr::insert_resident_attr(&mut rec, attr_type::DATA, &[], &[]).unwrap();
        self.records[4] = rec;

        // 5: root directory, large index with one block
        let mut rec = self.new_record(5, record_flags::IN_USE | record_flags::IS_DIRECTORY);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 5, ".", 0, 0, file_attr::I30_INDEX_PRESENT, true);
        let ir = index::build_large_root_value(CLUSTER as u32, CLUSTER as u32);
        attr::insert_resident_attr(&mut rec, attr_type::INDEX_ROOT, attr::I30, &ir).unwrap();
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::INDEX_ALLOCATION,
            attr::I30,
            &rl_from(&[(ROOT_BLOCK_LCN as i64, 1)]),
            CLUSTER as i64,
            12,
            true,
        )
        .unwrap();
        let mut bmp = [0u8; 8];
        bmp[0] = 0x01;
        attr::insert_resident_attr(&mut rec, attr_type::BITMAP, attr::I30, &bmp).unwrap();
        self.records[5] = rec;
        self.mark_clusters(ROOT_BLOCK_LCN, 1);

        // 6: $Bitmap
        let mut rec = self.new_record(6, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 6, "$Bitmap", 4096, 256, 0, true);
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::DATA,
            &[],
            &rl_from(&[(LCNBMP_LCN as i64, 1)]),
            256,
            12,
            true,
        )
        .unwrap();
        self.records[6] = rec;
        self.mark_clusters(LCNBMP_LCN, 1);

        // 7: $Boot
        let mut rec = self.new_record(7, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 7, "$Boot", 8192, 8192, 0, true);
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::DATA,
            &[],
            &rl_from(&[(0, 2)]),
            8192,
            12,
            true,
        )
        .unwrap();
        self.records[7] = rec;
        self.mark_clusters(0, 2);

        // 8, 9: $BadClus, $Secure with empty resident data
        for (mft_no, name) in [(8u64, "$BadClus"), (9, "$Secure")] {
            let mut rec = self.new_record(mft_no, record_flags::IN_USE);
            attr::insert_resident_attr(
                &mut rec,
                attr_type::STANDARD_INFORMATION,
                &[],
                &Self::si_value(),
            )
            .unwrap();
            self.add_fn_and_entry(&mut rec, mft_no, name, 0, 0, 0, true);
            attr::insert_resident_attr(&mut rec, attr_type::DATA, &[], &[]).unwrap();
            self.records[mft_no as usize] = rec;
        }

        // 10: $UpCase
        let mut rec = self.new_record(10, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 10, "$UpCase", 131072, 131072, 0, true);
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::DATA,
            &[],
            &rl_from(&[(UPCASE_LCN as i64, 32)]),
            131072,
            12,
            true,
        )
        .unwrap();
        self.records[10] = rec;
        self.mark_clusters(UPCASE_LCN, 32);

        // 11: $Extend, an empty directory
        let mut rec = self.new_record(11, record_flags::IN_USE | record_flags::IS_DIRECTORY);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, 11, "$Extend", 0, 0, file_attr::I30_INDEX_PRESENT, true);
        let ir = index::build_empty_root_value(CLUSTER as u32, CLUSTER as u32);
        attr::insert_resident_attr(&mut rec, attr_type::INDEX_ROOT, attr::I30, &ir).unwrap();
        self.records[11] = rec;

        // 12..16: reserved, in use, header only
        for mft_no in 12u64..16 {
            let rec = self.new_record(mft_no, record_flags::IN_USE);
            self.records[mft_no as usize] = rec;
        }
    }

    /// A regular file whose unnamed `$DATA` covers `runs`, indexed in the
    /// root directory.
    pub fn add_regular_file(&mut self, mft_no: u64, name: &str, runs: &[(i64, i64)], data: i64) {
        self.add_file_inner(mft_no, name, runs, data, true);
    }

    /// Same record shape, but no root index entry: an orphan.
    pub fn add_orphan_file(&mut self, mft_no: u64, name: &str, runs: &[(i64, i64)], data: i64) {
        self.add_file_inner(mft_no, name, runs, data, false);
    }

    fn add_file_inner(
        &mut self,
        mft_no: u64,
        name: &str,
        runs: &[(i64, i64)],
        data: i64,
        with_entry: bool,
    ) {
        let total: i64 = runs.iter().map(|(_, l)| l).sum();
        let alloc = total * CLUSTER as i64;
        let mut rec = self.new_record(mft_no, record_flags::IN_USE);
        attr::insert_resident_attr(&mut rec, attr_type::STANDARD_INFORMATION, &[], &Self::si_value())
            .unwrap();
        self.add_fn_and_entry(&mut rec, mft_no, name, alloc, data, 0, with_entry);
        attr::insert_non_resident_attr(
            &mut rec,
            attr_type::DATA,
            &[],
            &rl_from(runs),
            data,
            12,
            true,
        )
        .unwrap();
        self.records[mft_no as usize] = rec;
        for (lcn, len) in runs {
            self.mark_clusters(*lcn as u64, *len as u64);
            self.data_fills.push((*lcn, *len));
        }
    }

    /// Blows the declared length of the unnamed `$DATA` attribute past
    /// `bytes_in_use`.
    pub fn corrupt_attr_length(&mut self, mft_no: u64) {
        let rec = &mut self.records[mft_no as usize];
        let ofs = attr::find_attr_in_record(rec, attr_type::DATA, Some(&[])).unwrap();
        LittleEndian::write_u32(&mut rec[ofs + 4..ofs + 8], RECORD as u32);
    }

    pub fn build(self) -> Vec<u8> {
        let mut image = vec![0u8; TOTAL_SECTORS as usize * SECTOR + SECTOR];

        // Boot sector, and its backup in the final sector.
        let mut bs = vec![0u8; SECTOR];
        bs[3..11].copy_from_slice(b"NTFS    ");
        LittleEndian::write_u16(&mut bs[11..13], SECTOR as u16);
        bs[13] = (CLUSTER / SECTOR) as u8;
        bs[21] = 0xf8;
        LittleEndian::write_u64(&mut bs[40..48], TOTAL_SECTORS);
        LittleEndian::write_u64(&mut bs[48..56], MFT_LCN);
        LittleEndian::write_u64(&mut bs[56..64], MFTMIRR_LCN);
        bs[64] = (-10i8) as u8; // 1 KiB records
        bs[68] = 1; // one cluster per index block
        LittleEndian::write_u64(&mut bs[72..80], 0x1020_3040_5060_7080);
        image[..SECTOR].copy_from_slice(&bs);
        let backup_at = TOTAL_SECTORS as usize * SECTOR;
        image[backup_at..backup_at + SECTOR].copy_from_slice(&bs);

        // $Volume dirty flag.
        let mut records = self.records;
        if self.dirty {
            let rec = &mut records[3];
            let ofs =
                attr::find_attr_in_record(rec, attr_type::VOLUME_INFORMATION, None).unwrap();
            let vofs = ofs + LittleEndian::read_u16(&rec[ofs + 20..ofs + 22]) as usize;
            LittleEndian::write_u16(&mut rec[vofs + 10..vofs + 12], layout::VOLUME_IS_DIRTY);
        }

        // MFT records and the mirror of the first four.
        let mft_at = MFT_LCN as usize * CLUSTER;
        for (i, rec) in records.iter().enumerate() {
            image[mft_at + i * RECORD..mft_at + (i + 1) * RECORD].copy_from_slice(rec);
        }
        let mirr_at = MFTMIRR_LCN as usize * CLUSTER;
        image.copy_within(mft_at..mft_at + 4 * RECORD, mirr_at);

        // Bitmaps.
        let lcnbmp_at = LCNBMP_LCN as usize * CLUSTER;
        image[lcnbmp_at..lcnbmp_at + self.lcn_bitmap.len()].copy_from_slice(&self.lcn_bitmap);
        let mftbmp_at = MFTBMP_LCN as usize * CLUSTER;
        image[mftbmp_at..mftbmp_at + self.mft_bitmap.len()].copy_from_slice(&self.mft_bitmap);

        // $UpCase: identity with ASCII folding.
        let upcase_at = UPCASE_LCN as usize * CLUSTER;
        for c in 0..65536usize {
            let up = if (b'a' as usize..=b'z' as usize).contains(&c) {
                c - 32
            } else {
                c
            };
            LittleEndian::write_u16(
                &mut image[upcase_at + c * 2..upcase_at + c * 2 + 2],
                up as u16,
            );
        }

        // Root index block with the collected entries in collation order.
        let mut block = index::build_empty_index_block(CLUSTER as u32, 0);
        let mut entries = self.root_entries;
        entries.sort_by_key(|(_, fnv)| {
            let f = layout::FileName::new(fnv).unwrap();
            f.name()
                .iter()
                .map(|c| {
                    if (b'a' as u16..=b'z' as u16).contains(c) {
                        c - 32
                    } else {
                        *c
                    }
                })
                .collect::<Vec<u16>>()
        });
        let hofs = layout::INDEX_BLOCK_HEADER_SIZE;
        let mut pos = hofs + 40;
        for (mft_no, fnv) in &entries {
            let e = layout::build_index_entry(MftRef::new(*mft_no, SEQ), fnv);
            block[pos..pos + e.len()].copy_from_slice(&e);
            pos += e.len();
        }
        let end = layout::build_end_entry(None);
        block[pos..pos + end.len()].copy_from_slice(&end);
        pos += end.len();
        LittleEndian::write_u32(&mut block[hofs + 4..hofs + 8], (pos - hofs) as u32);
        layout::write_fixups(&mut block).unwrap();
        image[ROOT_BLOCK_OFFSET..ROOT_BLOCK_OFFSET + CLUSTER].copy_from_slice(&block);

        // Recognizable content in test-file clusters.
        for (lcn, len) in &self.data_fills {
            let at = *lcn as usize * CLUSTER;
            image[at..at + *len as usize * CLUSTER].fill(0xab);
        }

        image
    }
}

/// A `MemDevice` variant whose backing store outlives the volume, so a
/// test can run the checker twice over the same image.
pub struct SharedDevice {
    data: Arc<Mutex<Vec<u8>>>,
    read_only: bool,
}

impl SharedDevice {
    pub fn new(data: Arc<Mutex<Vec<u8>>>, read_only: bool) -> Self {
        Self { data, read_only }
    }
}

impl VolumeDevice for SharedDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> ntfsck_core::Result<()> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(ntfsck_core::FsckError::OutOfBounds {
                offset: end as u64,
                max: data.len() as u64,
            });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> ntfsck_core::Result<()> {
        if self.read_only {
            return Err(ntfsck_core::FsckError::Refused(
                "write attempted on a read-only device".into(),
            ));
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(ntfsck_core::FsckError::OutOfBounds {
                offset: end as u64,
                max: data.len() as u64,
            });
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
