//! The fsck bitmaps: one bit per cluster (FCB) and one bit per MFT record
//! (FMB), kept as sparse arrays of 8 KiB pages. A page is allocated zeroed
//! the first time any bit inside it is set.

use crate::error::{FsckError, Result};
use crate::runlist::{Run, Runlist};
use crate::types::{BitPos, Lcn, LcnValue, PageIdx, Vcn, NTFS_BUF_SIZE};
use tracing::error;

const PAGE_BITS: u64 = (NTFS_BUF_SIZE as u64) * 8;

pub struct SparseBitmap {
    pages: Vec<Option<Box<[u8]>>>,
    nbits: u64,
}

impl SparseBitmap {
    /// A bitmap able to hold `nbits` bits.
    pub fn new(nbits: u64) -> Self {
        let npages = (nbits.div_ceil(PAGE_BITS)).max(1) as usize;
        Self {
            pages: vec![None; npages],
            nbits,
        }
    }

    #[inline]
    pub fn nbits(&self) -> u64 {
        self.nbits
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_mut(&mut self, idx: PageIdx) -> Result<&mut [u8]> {
        let i = idx.0 as usize;
        if i >= self.pages.len() {
            return Err(FsckError::OutOfBounds {
                offset: i as u64,
                max: self.pages.len() as u64,
            });
        }
        let slot = &mut self.pages[i];
        if slot.is_none() {
            *slot = Some(vec![0u8; NTFS_BUF_SIZE].into_boxed_slice());
        }
        Ok(slot.as_mut().unwrap())
    }

    pub fn get(&self, pos: BitPos) -> bool {
        let page = pos.page().0 as usize;
        match self.pages.get(page).and_then(|p| p.as_ref()) {
            Some(p) => {
                let bit = pos.offset_in_page();
                p[(bit >> 3) as usize] & (1 << (bit & 7)) != 0
            }
            None => false,
        }
    }

    pub fn set_value(&mut self, pos: BitPos, value: bool) -> Result<()> {
        if pos.0 >= self.pages.len() as u64 * PAGE_BITS {
            return Err(FsckError::OutOfBounds {
                offset: pos.0,
                max: self.pages.len() as u64 * PAGE_BITS,
            });
        }
        let bit = pos.offset_in_page();
        let page = self.page_mut(pos.page())?;
        let byte = &mut page[(bit >> 3) as usize];
        if value {
            *byte |= 1 << (bit & 7);
        } else {
            *byte &= !(1 << (bit & 7));
        }
        Ok(())
    }

    /// Sets the bit and returns its previous value.
    pub fn get_and_set(&mut self, pos: BitPos, value: bool) -> Result<bool> {
        let old = self.get(pos);
        self.set_value(pos, value)?;
        Ok(old)
    }

    pub fn set_range(&mut self, start: BitPos, length: u64, value: bool) -> Result<()> {
        for i in 0..length {
            self.set_value(BitPos(start.0 + i), value)?;
        }
        Ok(())
    }

    /// A copy of one page for diffing against the on-disk bitmap. Unallocated
    /// pages read as zeros. With `fill_past_end`, bits at and beyond
    /// `nbits` in the page holding the last valid bit are returned as ones,
    /// matching the NTFS convention for the cluster bitmap's trailing slack.
    pub fn page_snapshot(&self, idx: PageIdx, fill_past_end: bool) -> Vec<u8> {
        let mut out = vec![0u8; NTFS_BUF_SIZE];
        if let Some(Some(p)) = self.pages.get(idx.0 as usize) {
            out.copy_from_slice(p);
        }
        if fill_past_end {
            let last_page = ((self.nbits.saturating_sub(1)) / PAGE_BITS) as u32;
            if idx.0 >= last_page {
                let first_invalid = if idx.0 == last_page {
                    self.nbits - idx.0 as u64 * PAGE_BITS
                } else {
                    0
                };
                let byte = (first_invalid >> 3) as usize;
                let bit = (first_invalid & 7) as u32;
                if bit != 0 && byte < out.len() {
                    out[byte] |= 0xffu8 << bit;
                }
                let from = if bit != 0 { byte + 1 } else { byte };
                for b in out.iter_mut().skip(from) {
                    *b = 0xff;
                }
            }
        }
        out
    }
}

/// Both fsck bitmaps, write-shared by every pass. All mutation goes through
/// these operations; direct page access is read-only snapshots.
pub struct FsckBitmaps {
    fcb: SparseBitmap,
    fmb: SparseBitmap,
}

impl FsckBitmaps {
    pub fn new(nr_clusters: u64, nr_mft_records: u64) -> Self {
        Self {
            fcb: SparseBitmap::new(nr_clusters),
            fmb: SparseBitmap::new(nr_mft_records),
        }
    }

    // FMB -------------------------------------------------------------

    pub fn fmb_set(&mut self, mft_no: u64) -> Result<()> {
        self.fmb.set_value(BitPos(mft_no), true)
    }

    pub fn fmb_clear(&mut self, mft_no: u64) -> Result<()> {
        self.fmb.set_value(BitPos(mft_no), false)
    }

    pub fn fmb_get(&self, mft_no: u64) -> bool {
        self.fmb.get(BitPos(mft_no))
    }

    pub fn fmb_page(&self, idx: PageIdx) -> Vec<u8> {
        self.fmb.page_snapshot(idx, false)
    }

    // FCB -------------------------------------------------------------

    pub fn fcb_get(&self, lcn: Lcn) -> bool {
        self.fcb.get(lcn.bit())
    }

    pub fn fcb_set_range(&mut self, lcn: Lcn, length: i64, value: bool) -> Result<()> {
        if length <= 0 {
            return Err(FsckError::CorruptRunlist("non-positive bitmap range"));
        }
        self.fcb.set_range(lcn.bit(), length as u64, value)
    }

    pub fn fcb_page(&self, idx: PageIdx) -> Vec<u8> {
        self.fcb.page_snapshot(idx, true)
    }

    pub fn fcb_page_count(&self) -> usize {
        self.fcb.page_count()
    }

    pub fn fmb_page_count(&self) -> usize {
        self.fmb.page_count()
    }

    /// Test-and-set over one runlist entry. While setting, a bit found
    /// already set is a duplicated cluster; the collisions are returned as
    /// a runlist whose VCNs locate the duplicate within the attribute.
    /// Returns `None` when there was no collision.
    pub fn fcb_check_and_set_run(&mut self, run: &Run, value: bool) -> Result<Option<Runlist>> {
        let lcn = match run.lcn {
            LcnValue::Real(l) => l,
            _ => return Ok(None),
        };
        if run.length <= 0 {
            return Ok(None);
        }

        let mut dup: Option<Runlist> = None;
        let mut pending: Option<Run> = None;

        for i in 0..run.length {
            let pos = BitPos((lcn.0 + i) as u64);
            let was_set = self.fcb.get_and_set(pos, value)?;
            if !(was_set && value) {
                continue;
            }
            error!(cluster = lcn.0 + i, "cluster duplication");
            let at_lcn = lcn.0 + i;
            let at_vcn = run.vcn.0 + i;
            match pending {
                Some(ref mut p) if p.lcn.lcn().map(|l| l.0 + p.length) == Some(at_lcn) => {
                    p.length += 1;
                }
                Some(p) => {
                    dup.get_or_insert_with(Runlist::new).push(p);
                    pending = Some(Run {
                        vcn: Vcn(at_vcn),
                        lcn: LcnValue::Real(Lcn(at_lcn)),
                        length: 1,
                    });
                }
                None => {
                    pending = Some(Run {
                        vcn: Vcn(at_vcn),
                        lcn: LcnValue::Real(Lcn(at_lcn)),
                        length: 1,
                    });
                }
            }
        }

        if let Some(p) = pending {
            dup.get_or_insert_with(Runlist::new).push(p);
        }
        Ok(dup)
    }

    /// Scans the FCB for `count` clear bits starting near `hint`, setting
    /// them. Used to source fresh clusters for duplicate relocation.
    pub fn fcb_allocate(&mut self, count: i64, hint: Lcn) -> Result<Runlist> {
        let nbits = self.fcb.nbits() as i64;
        let start = hint.0.clamp(0, nbits - 1);
        let mut found: Vec<i64> = Vec::with_capacity(count as usize);

        let mut scan = |range: std::ops::Range<i64>, found: &mut Vec<i64>| {
            for c in range {
                if found.len() as i64 == count {
                    break;
                }
                if !self.fcb.get(BitPos(c as u64)) {
                    found.push(c);
                }
            }
        };
        scan(start..nbits, &mut found);
        if (found.len() as i64) < count {
            scan(0..start, &mut found);
        }
        if (found.len() as i64) < count {
            return Err(FsckError::NoSpace { count });
        }

        let mut rl = Runlist::new();
        let mut vcn = 0i64;
        for &c in &found {
            self.fcb.set_value(BitPos(c as u64), true)?;
            rl.push(Run {
                vcn: Vcn(vcn),
                lcn: LcnValue::Real(Lcn(c)),
                length: 1,
            });
            vcn += 1;
        }
        Ok(rl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_pages() {
        let mut bm = SparseBitmap::new(1 << 20);
        assert!(!bm.get(BitPos(70000)));
        bm.set_value(BitPos(70000), true).unwrap();
        assert!(bm.get(BitPos(70000)));
        assert!(!bm.get(BitPos(69999)));
    }

    #[test]
    fn test_out_of_bounds_set() {
        let mut bm = SparseBitmap::new(100);
        // capacity rounds up to one page
        assert!(bm.set_value(BitPos(PAGE_BITS), true).is_err());
    }

    #[test]
    fn test_fmb_ops() {
        let mut b = FsckBitmaps::new(1000, 64);
        assert!(!b.fmb_get(42));
        b.fmb_set(42).unwrap();
        assert!(b.fmb_get(42));
        b.fmb_clear(42).unwrap();
        assert!(!b.fmb_get(42));
    }

    #[test]
    fn test_fcb_tail_fill() {
        // 100 clusters: bits 100.. of the snapshot page must read as ones
        let b = FsckBitmaps::new(100, 16);
        let page = b.fcb_page(PageIdx(0));
        assert_eq!(page[11], 0x00); // bits 88..95 valid, clear
        assert_eq!(page[12], 0xf0); // bits 96..99 valid, 100..103 filled
        assert_eq!(page[13], 0xff);
        assert_eq!(page[NTFS_BUF_SIZE - 1], 0xff);
    }

    fn real_run(vcn: i64, lcn: i64, len: i64) -> Run {
        Run {
            vcn: Vcn(vcn),
            lcn: LcnValue::Real(Lcn(lcn)),
            length: len,
        }
    }

    #[test]
    fn test_check_and_set_no_collision() {
        let mut b = FsckBitmaps::new(1000, 16);
        let dup = b.fcb_check_and_set_run(&real_run(0, 10, 5), true).unwrap();
        assert!(dup.is_none());
        assert!(b.fcb_get(Lcn(10)));
        assert!(b.fcb_get(Lcn(14)));
    }

    #[test]
    fn test_check_and_set_reports_duplicates() {
        let mut b = FsckBitmaps::new(1000, 16);
        b.fcb_set_range(Lcn(12), 2, true).unwrap();
        // 10..15 collides on 12,13 — one contiguous duplicate run
        let dup = b
            .fcb_check_and_set_run(&real_run(100, 10, 5), true)
            .unwrap()
            .unwrap();
        assert_eq!(dup.runs().len(), 1);
        assert_eq!(dup.runs()[0].lcn, LcnValue::Real(Lcn(12)));
        assert_eq!(dup.runs()[0].vcn, Vcn(102));
        assert_eq!(dup.runs()[0].length, 2);
    }

    #[test]
    fn test_check_and_set_non_contiguous_duplicates() {
        let mut b = FsckBitmaps::new(1000, 16);
        b.fcb_set_range(Lcn(11), 1, true).unwrap();
        b.fcb_set_range(Lcn(13), 1, true).unwrap();
        let dup = b
            .fcb_check_and_set_run(&real_run(0, 10, 5), true)
            .unwrap()
            .unwrap();
        assert_eq!(dup.runs().len(), 2);
        assert_eq!(dup.runs()[0].lcn, LcnValue::Real(Lcn(11)));
        assert_eq!(dup.runs()[1].lcn, LcnValue::Real(Lcn(13)));
    }

    #[test]
    fn test_hole_runs_are_ignored() {
        let mut b = FsckBitmaps::new(1000, 16);
        let run = Run {
            vcn: Vcn(0),
            lcn: LcnValue::Hole,
            length: 5,
        };
        assert!(b.fcb_check_and_set_run(&run, true).unwrap().is_none());
    }

    #[test]
    fn test_allocate_skips_used() {
        let mut b = FsckBitmaps::new(64, 16);
        b.fcb_set_range(Lcn(0), 60, true).unwrap();
        let rl = b.fcb_allocate(3, Lcn(50)).unwrap();
        assert_eq!(rl.real_clusters(), 3);
        for run in rl.runs() {
            let l = run.lcn.lcn().unwrap();
            assert!(l.0 >= 60);
        }
        assert!(b.fcb_allocate(2, Lcn(0)).is_err());
    }
}
