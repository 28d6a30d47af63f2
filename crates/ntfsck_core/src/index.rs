//! Directory index ($I30 B+ tree) validation, traversal, and editing.
//!
//! A directory's tree is pre-validated as a whole (root entries, every
//! `$BITMAP`-allocated INDX block, sub-node bits, terminators) before any
//! entry is trusted. Validation failure resets the index: the allocation
//! and bitmap attributes are dropped, the root is rewritten empty, and the
//! directory's former subtree surfaces later as orphans.

use crate::attr;
use crate::error::{FsckError, Result};
use crate::inode::{Inode, RecSlot};
use crate::layout::{
    self, apply_fixups, attr_type, build_end_entry, build_index_entry, ih_set, write_fixups,
    IndexBlock, IndexEntry, IndexHeader, IndexRoot, INDEX_BLOCK_HEADER_SIZE,
    INDEX_ENTRY_HEADER_SIZE, INDEX_HEADER_SIZE, INDEX_ROOT_HEADER_SIZE, LARGE_INDEX, LEAF_NODE,
    SMALL_INDEX,
};
use crate::problem::{InodeCtx, IndexCtx, ProblemCode, ProblemCtx, ProblemEngine};
use crate::runlist::Runlist;
use crate::types::{MftRef, NTFS_BLOCK_SIZE};
use crate::volume::Volume;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const MAX_INDEX_DEPTH: usize = 16;

/// $I30 collation.
pub const COLLATION_FILE_NAME: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeId {
    Root,
    Block(i64),
}

#[derive(Debug, Clone, Copy)]
pub struct IndexGeometry {
    pub block_size: u32,
    pub vcn_size_bits: u32,
}

impl IndexGeometry {
    pub fn bitmap_bit_for_vcn(&self, vcn: i64) -> u64 {
        ((vcn << self.vcn_size_bits) / self.block_size as i64) as u64
    }

    pub fn byte_pos_for_vcn(&self, vcn: i64) -> u64 {
        (vcn as u64) << self.vcn_size_bits
    }
}

/// Reads the directory's index geometry out of `$INDEX_ROOT:$I30`.
pub fn dir_index_geometry(vol: &Volume, ino: &Inode) -> Result<IndexGeometry> {
    let (slot, ofs) = ino
        .find_attr(attr_type::INDEX_ROOT, Some(attr::I30))
        .ok_or(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "directory without $INDEX_ROOT",
        })?;
    let a = ino.attr_view(slot, ofs);
    let ir = IndexRoot::new(a.value()?)?;
    let block_size = ir.index_block_size();
    if block_size < NTFS_BLOCK_SIZE || block_size % NTFS_BLOCK_SIZE != 0 {
        return Err(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "index block size is not a multiple of 512",
        });
    }
    let vcn_size_bits = if vol.cluster_size <= block_size {
        vol.cluster_size_bits
    } else {
        NTFS_BLOCK_SIZE.trailing_zeros()
    };
    Ok(IndexGeometry {
        block_size,
        vcn_size_bits,
    })
}

/// One directory's index loaded into memory: the root value plus every
/// allocated block, fixup-corrected, ready to traverse and edit.
pub struct LoadedIndex {
    pub geometry: IndexGeometry,
    pub root_value: Vec<u8>,
    pub blocks: BTreeMap<i64, Vec<u8>>,
    pub ia_runlist: Option<Runlist>,
    pub bitmap: Vec<u8>,
    pub root_dirty: bool,
    pub dirty_blocks: Vec<i64>,
}

impl LoadedIndex {
    fn node_buf(&self, id: NodeId) -> &[u8] {
        match id {
            NodeId::Root => &self.root_value,
            NodeId::Block(vcn) => &self.blocks[&vcn],
        }
    }

    /// The bytes of a node from `pos` on, for re-parsing one entry.
    pub fn entry_bytes(&self, id: NodeId, pos: usize) -> &[u8] {
        &self.node_buf(id)[pos..]
    }

    /// Overwrites `len` bytes of a node in place (same-length edits only),
    /// marking it dirty.
    pub fn patch_entry(&mut self, id: NodeId, pos: usize, bytes: &[u8]) {
        let buf = self.node_buf_mut(id);
        buf[pos..pos + bytes.len()].copy_from_slice(bytes);
    }

    fn node_buf_mut(&mut self, id: NodeId) -> &mut Vec<u8> {
        match id {
            NodeId::Root => {
                self.root_dirty = true;
                &mut self.root_value
            }
            NodeId::Block(vcn) => {
                if !self.dirty_blocks.contains(&vcn) {
                    self.dirty_blocks.push(vcn);
                }
                self.blocks.get_mut(&vcn).unwrap()
            }
        }
    }

    fn header_offset(id: NodeId) -> usize {
        match id {
            NodeId::Root => INDEX_ROOT_HEADER_SIZE,
            NodeId::Block(_) => INDEX_BLOCK_HEADER_SIZE,
        }
    }

    fn header<'a>(&'a self, id: NodeId) -> Result<IndexHeader<'a>> {
        IndexHeader::new(&self.node_buf(id)[Self::header_offset(id)..])
    }

    /// In-order traversal: every sub-tree is visited before its key.
    /// Returns the visited key entries as `(node, offset_in_node)`.
    pub fn collect_in_order(&self) -> Result<Vec<(NodeId, usize)>> {
        let mut out = Vec::new();
        self.visit(NodeId::Root, 0, &mut out)?;
        Ok(out)
    }

    fn visit(&self, id: NodeId, depth: usize, out: &mut Vec<(NodeId, usize)>) -> Result<()> {
        if depth > MAX_INDEX_DEPTH {
            return Err(FsckError::CorruptRecord {
                mft_no: 0,
                reason: "index tree deeper than any valid $I30",
            });
        }
        let buf = self.node_buf(id);
        let hofs = Self::header_offset(id);
        let h = self.header(id)?;
        let mut pos = hofs + h.entries_offset() as usize;
        let end = hofs + h.index_length() as usize;
        loop {
            if pos + INDEX_ENTRY_HEADER_SIZE > buf.len() {
                return Err(FsckError::CorruptRecord {
                    mft_no: 0,
                    reason: "index entry chain escapes the node",
                });
            }
            let e = IndexEntry::new(&buf[pos..])?;
            if e.has_sub_node() {
                let vcn = e.sub_node_vcn()?;
                if self.blocks.contains_key(&vcn) {
                    self.visit(NodeId::Block(vcn), depth + 1, out)?;
                }
            }
            if e.is_end() {
                break;
            }
            out.push((id, pos));
            pos += e.length() as usize;
            if pos > end {
                return Err(FsckError::CorruptRecord {
                    mft_no: 0,
                    reason: "index entry chain overran index_length",
                });
            }
        }
        Ok(())
    }

    /// Removes the entry at `(id, pos)`, shifting the rest of the node.
    pub fn remove_entry(&mut self, id: NodeId, pos: usize) -> Result<()> {
        let hofs = Self::header_offset(id);
        let (old_len, entry_len) = {
            let h = self.header(id)?;
            let e = IndexEntry::new(&self.node_buf(id)[pos..])?;
            if e.has_sub_node() {
                // Promoting a successor is a rebalancing operation; the
                // caller falls back to initializing the whole index.
                return Err(FsckError::CorruptRecord {
                    mft_no: 0,
                    reason: "removal of an internal index entry",
                });
            }
            (h.index_length() as usize, e.length() as usize)
        };
        let end = hofs + old_len;
        let buf = self.node_buf_mut(id);
        buf.copy_within(pos + entry_len..end, pos);
        buf[end - entry_len..end].fill(0);
        ih_set::set_index_length(&mut buf[hofs..], (old_len - entry_len) as u32);
        Ok(())
    }

    /// Inserts a leaf entry into the node that owns `name`'s position.
    /// Fails with [`FsckError::IndexFull`] when the target node has no
    /// room; splits are not performed.
    pub fn insert_entry(
        &mut self,
        vol: &Volume,
        mft_no: u64,
        entry_bytes: &[u8],
    ) -> Result<()> {
        let new_entry = IndexEntry::new(entry_bytes)?;
        let name = new_entry.file_name()?.name();

        // Descend to the leaf position.
        let mut id = NodeId::Root;
        let mut depth = 0;
        let (target_id, target_pos) = loop {
            if depth > MAX_INDEX_DEPTH {
                return Err(FsckError::CorruptRecord {
                    mft_no,
                    reason: "index tree deeper than any valid $I30",
                });
            }
            let hofs = Self::header_offset(id);
            let buf = self.node_buf(id);
            let h = self.header(id)?;
            let mut pos = hofs + h.entries_offset() as usize;
            let mut descend = None;
            loop {
                if pos >= buf.len() {
                    return Err(FsckError::CorruptRecord {
                        mft_no,
                        reason: "index entry chain escapes the node",
                    });
                }
                let e = IndexEntry::new(&buf[pos..])?;
                let here = if e.is_end() {
                    true
                } else {
                    let key = e.file_name()?.name();
                    match vol.collate_names(&name, &key) {
                        std::cmp::Ordering::Less => true,
                        std::cmp::Ordering::Equal => {
                            return Err(FsckError::Refused(format!(
                                "index of inode {mft_no} already holds that name"
                            )))
                        }
                        std::cmp::Ordering::Greater => false,
                    }
                };
                if here {
                    if e.has_sub_node() {
                        let vcn = e.sub_node_vcn()?;
                        if self.blocks.contains_key(&vcn) {
                            descend = Some(vcn);
                            break;
                        }
                    }
                    break;
                }
                pos += e.length() as usize;
            }
            match descend {
                Some(vcn) => {
                    id = NodeId::Block(vcn);
                    depth += 1;
                }
                None => break (id, pos),
            }
        };

        let hofs = Self::header_offset(target_id);
        let need = entry_bytes.len();
        let (index_length, allocated) = {
            let h = self.header(target_id)?;
            (h.index_length() as usize, h.allocated_size() as usize)
        };

        match target_id {
            NodeId::Root => {
                // The root value grows; the caller resizes the attribute.
                let buf = self.node_buf_mut(target_id);
                let end = hofs + index_length;
                let mut grown = Vec::with_capacity(buf.len() + need);
                grown.extend_from_slice(&buf[..target_pos]);
                grown.extend_from_slice(entry_bytes);
                grown.extend_from_slice(&buf[target_pos..end]);
                *buf = grown;
                ih_set::set_index_length(&mut buf[hofs..], (index_length + need) as u32);
                ih_set::set_allocated_size(&mut buf[hofs..], (index_length + need) as u32);
            }
            NodeId::Block(_) => {
                if index_length + need > allocated {
                    return Err(FsckError::IndexFull { mft_no });
                }
                let end = hofs + index_length;
                let buf = self.node_buf_mut(target_id);
                buf.copy_within(target_pos..end, target_pos + need);
                buf[target_pos..target_pos + need].copy_from_slice(entry_bytes);
                ih_set::set_index_length(&mut buf[hofs..], (index_length + need) as u32);
            }
        }
        Ok(())
    }

    /// Finds an entry by name, descending the tree.
    pub fn lookup(&self, vol: &Volume, name: &[u16]) -> Result<Option<(NodeId, usize)>> {
        let mut id = NodeId::Root;
        let mut depth = 0;
        loop {
            if depth > MAX_INDEX_DEPTH {
                return Ok(None);
            }
            let hofs = Self::header_offset(id);
            let buf = self.node_buf(id);
            let h = self.header(id)?;
            let mut pos = hofs + h.entries_offset() as usize;
            let mut descend = None;
            loop {
                if pos >= buf.len() {
                    return Ok(None);
                }
                let e = IndexEntry::new(&buf[pos..])?;
                let past = if e.is_end() {
                    true
                } else {
                    let key = e.file_name()?.name();
                    match vol.collate_names(name, &key) {
                        std::cmp::Ordering::Less => true,
                        std::cmp::Ordering::Equal => return Ok(Some((id, pos))),
                        std::cmp::Ordering::Greater => false,
                    }
                };
                if past {
                    if e.has_sub_node() {
                        let vcn = e.sub_node_vcn()?;
                        if self.blocks.contains_key(&vcn) {
                            descend = Some(vcn);
                        }
                    }
                    break;
                }
                pos += e.length() as usize;
            }
            match descend {
                Some(vcn) => {
                    id = NodeId::Block(vcn);
                    depth += 1;
                }
                None => return Ok(None),
            }
        }
    }
}

/// Loads a directory's index, without trusting it yet.
pub fn load_index(
    vol: &mut Volume,
    ino: &mut Inode,
    problems: &mut ProblemEngine,
) -> Result<LoadedIndex> {
    let geometry = dir_index_geometry(vol, ino)?;

    let (slot, ofs) = ino
        .find_attr(attr_type::INDEX_ROOT, Some(attr::I30))
        .ok_or(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "directory without $INDEX_ROOT",
        })?;
    let root_value = ino.attr_view(slot, ofs).value()?.to_vec();

    let mut index = LoadedIndex {
        geometry,
        root_value,
        blocks: BTreeMap::new(),
        ia_runlist: None,
        bitmap: Vec::new(),
        root_dirty: false,
        dirty_blocks: Vec::new(),
    };

    if ino
        .find_attr(attr_type::INDEX_ALLOCATION, Some(attr::I30))
        .is_none()
    {
        return Ok(index);
    }

    let (ia_rl, _) =
        attr::decompose_full_runlist(vol, ino, attr_type::INDEX_ALLOCATION, attr::I30, problems)?;
    index.bitmap = attr::read_full_attr_data(vol, ino, attr_type::BITMAP, attr::I30, problems)?;

    let max_bits = (index.bitmap.len() * 8) as u64;
    let ia_bytes = (ia_rl.end_vcn() as u64) << vol.cluster_size_bits;
    let max_vcn = (ia_bytes >> geometry.vcn_size_bits) as i64;
    let vcn_per_block = (geometry.block_size as i64) >> geometry.vcn_size_bits;

    let mut vcn = 0i64;
    while vcn < max_vcn {
        let bit = geometry.bitmap_bit_for_vcn(vcn);
        if bit >= max_bits {
            break;
        }
        if index.bitmap[(bit >> 3) as usize] & (1 << (bit & 7)) == 0 {
            vcn += vcn_per_block;
            continue;
        }
        let mut buf = vec![0u8; geometry.block_size as usize];
        vol.attr_pread(&ia_rl, geometry.byte_pos_for_vcn(vcn), &mut buf)?;
        if apply_fixups(&mut buf).is_err() {
            return Err(FsckError::CorruptRecord {
                mft_no: ino.mft_no,
                reason: "index block fixup mismatch",
            });
        }
        index.blocks.insert(vcn, buf);
        vcn += vcn_per_block;
    }
    index.ia_runlist = Some(ia_rl);
    Ok(index)
}

/// Pre-validates every loaded node: magic, block VCN, entry bounds,
/// sub-node bitmap bits, and terminators. Any failure condemns the whole
/// index.
pub fn prevalidate_index(
    vol: &Volume,
    ino: &Inode,
    index: &LoadedIndex,
    problems: &mut ProblemEngine,
) -> bool {
    let ictx = |vcn: i64| {
        ProblemCtx::Index(IndexCtx {
            inode: InodeCtx::num(ino.mft_no),
            parent_mft_no: 0,
            vcn,
            ..Default::default()
        })
    };

    for (vcn, buf) in &index.blocks {
        let Ok(block) = IndexBlock::new(buf) else {
            return false;
        };
        if block.magic() != layout::INDX_MAGIC {
            problems.print(ProblemCode::IaMagicCorrupted, &ictx(*vcn));
            return false;
        }
        if block.index_block_vcn() != *vcn {
            problems.print(ProblemCode::IaMagicCorrupted, &ictx(*vcn));
            return false;
        }
    }

    let nodes = std::iter::once(NodeId::Root)
        .chain(index.blocks.keys().map(|v| NodeId::Block(*v)));
    for id in nodes {
        if !prevalidate_node(vol, ino, index, id, problems) {
            return false;
        }
    }
    true
}

fn prevalidate_node(
    vol: &Volume,
    ino: &Inode,
    index: &LoadedIndex,
    id: NodeId,
    problems: &mut ProblemEngine,
) -> bool {
    let buf = index.node_buf(id);
    let hofs = LoadedIndex::header_offset(id);
    let Ok(h) = IndexHeader::new(&buf[hofs..]) else {
        return false;
    };
    let end = hofs + h.index_length() as usize;
    if end > buf.len() || (h.entries_offset() as usize) < INDEX_HEADER_SIZE {
        debug!(mft_no = ino.mft_no, "index header bounds corrupt");
        return false;
    }
    let max_bits = (index.bitmap.len() * 8) as u64;

    let mut pos = hofs + h.entries_offset() as usize;
    loop {
        if pos + INDEX_ENTRY_HEADER_SIZE > end {
            debug!(mft_no = ino.mft_no, "index node lacks a terminator");
            return false;
        }
        let raw_len = LittleEndian::read_u16(&buf[pos + 8..pos + 10]);
        if raw_len == 0 {
            problems.print(
                ProblemCode::IeZeroLength,
                &ProblemCtx::Inode(InodeCtx::num(ino.mft_no)),
            );
            return false;
        }
        let Ok(e) = IndexEntry::new(&buf[pos..end.min(buf.len())]) else {
            debug!(mft_no = ino.mft_no, "index entry out of bounds");
            return false;
        };
        if e.has_sub_node() {
            let Ok(vcn) = e.sub_node_vcn() else {
                return false;
            };
            let bit = index.geometry.bitmap_bit_for_vcn(vcn);
            if bit >= max_bits || index.bitmap[(bit >> 3) as usize] & (1 << (bit & 7)) == 0 {
                debug!(
                    mft_no = ino.mft_no,
                    vcn, "sub-node block not allocated in $BITMAP"
                );
                return false;
            }
        }
        if e.is_end() {
            // The END entry never carries a key.
            if e.key_length() != 0 {
                debug!(mft_no = ino.mft_no, "END entry carries a key");
                return false;
            }
            return true;
        }
        // A key entry must parse as a $FILE_NAME and point inside the MFT.
        let Ok(fname) = e.file_name() else {
            debug!(mft_no = ino.mft_no, "index key is not a valid $FILE_NAME");
            return false;
        };
        if fname.name_length() == 0 {
            return false;
        }
        if e.indexed_file().mft_no() >= vol.nr_mft_records {
            return false;
        }
        pos += e.length() as usize;
    }
}

/// Rewrites `$INDEX_ROOT:$I30` to hold only the END entry and removes
/// `$INDEX_ALLOCATION` and `$BITMAP`, releasing their clusters from the
/// FCB. The directory's subtree becomes orphans for pass 4.
pub fn initialize_index(vol: &mut Volume, ino: &mut Inode) -> Result<()> {
    release_index_clusters(vol, ino)?;
    for ty in [attr_type::INDEX_ALLOCATION, attr_type::BITMAP] {
        while let Some((slot, ofs)) = ino.find_attr(ty, Some(attr::I30)) {
            attr::remove_attr(ino.record_mut(slot), ofs)?;
        }
    }

    let value = build_empty_root_value(vol.index_block_size, vol.cluster_size);
    let (slot, ofs) = ino
        .find_attr(attr_type::INDEX_ROOT, Some(attr::I30))
        .ok_or(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "directory without $INDEX_ROOT",
        })?;
    attr::resize_resident_value(ino.record_mut(slot), ofs, value.len() as u32)?;
    write_root_value(ino, slot, ofs, &value);
    ino.allocated_size = 0;
    ino.data_size = 0;
    Ok(())
}

/// Resets the root directory's index to a one-block large index: the old
/// allocation is released from the FCB, a fresh block is allocated and
/// written empty, and `$INDEX_ROOT` points its END entry at it. The root
/// keeps a block so reseeding the system-file entries cannot overflow the
/// MFT record.
pub fn initialize_root_index(vol: &mut Volume, ino: &mut Inode) -> Result<()> {
    release_index_clusters(vol, ino)?;
    for ty in [attr_type::INDEX_ALLOCATION, attr_type::BITMAP] {
        while let Some((slot, ofs)) = ino.find_attr(ty, Some(attr::I30)) {
            attr::remove_attr(ino.record_mut(slot), ofs)?;
        }
    }

    let block_size = vol.index_block_size;
    let clusters = ((block_size + vol.cluster_size - 1) >> vol.cluster_size_bits).max(1) as i64;
    let hint = crate::types::Lcn((vol.mft_lcn as i64) + 1);
    let block_rl = vol.bitmaps.fcb_allocate(clusters, hint)?;

    let ntfs_v3 = vol.major_ver >= 3;
    attr::insert_non_resident_attr(
        ino.record_mut(RecSlot::Base),
        attr_type::INDEX_ALLOCATION,
        attr::I30,
        &block_rl,
        block_size as i64,
        vol.cluster_size_bits,
        ntfs_v3,
    )?;
    let mut bmp = [0u8; 8];
    bmp[0] = 0x01;
    attr::insert_resident_attr(
        ino.record_mut(RecSlot::Base),
        attr_type::BITMAP,
        attr::I30,
        &bmp,
    )?;

    let value = build_large_root_value(block_size, vol.cluster_size);
    let (slot, ofs) = ino
        .find_attr(attr_type::INDEX_ROOT, Some(attr::I30))
        .ok_or(FsckError::CorruptRecord {
            mft_no: ino.mft_no,
            reason: "root directory without $INDEX_ROOT",
        })?;
    attr::resize_resident_value(ino.record_mut(slot), ofs, value.len() as u32)?;
    write_root_value(ino, slot, ofs, &value);

    let mut block = build_empty_index_block(block_size, 0);
    write_fixups(&mut block)?;
    vol.attr_pwrite(&block_rl, 0, &block)?;

    ino.allocated_size = 0;
    ino.data_size = 0;
    Ok(())
}

/// Clears the FCB bits claimed by the directory's non-resident index
/// attributes, so a reset index does not leak its old clusters.
fn release_index_clusters(vol: &mut Volume, ino: &mut Inode) -> Result<()> {
    for ty in [attr_type::INDEX_ALLOCATION, attr_type::BITMAP] {
        let Some((slot, ofs)) = ino.find_attr(ty, Some(attr::I30)) else {
            continue;
        };
        if !ino.attr_view(slot, ofs).is_non_resident() {
            continue;
        }
        let mut silent = ProblemEngine::silent();
        if let Ok((old_rl, _)) =
            attr::decompose_full_runlist(vol, ino, ty, attr::I30, &mut silent)
        {
            for run in old_rl.runs() {
                if let crate::types::LcnValue::Real(l) = run.lcn {
                    vol.bitmaps.fcb_set_range(l, run.length, false)?;
                }
            }
        }
    }
    Ok(())
}

/// A one-block `$INDEX_ROOT:$I30` value: LARGE flag, END entry pointing
/// at VCN zero.
pub fn build_large_root_value(index_block_size: u32, cluster_size: u32) -> Vec<u8> {
    let mut v = vec![0u8; INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE];
    LittleEndian::write_u32(&mut v[0..4], attr_type::FILE_NAME);
    LittleEndian::write_u32(&mut v[4..8], COLLATION_FILE_NAME);
    LittleEndian::write_u32(&mut v[8..12], index_block_size);
    v[12] = if index_block_size >= cluster_size {
        (index_block_size / cluster_size) as u8
    } else {
        1
    };
    let hofs = INDEX_ROOT_HEADER_SIZE;
    ih_set::set_entries_offset(&mut v[hofs..], INDEX_HEADER_SIZE as u32);
    let end = build_end_entry(Some(0));
    ih_set::set_index_length(&mut v[hofs..], (INDEX_HEADER_SIZE + end.len()) as u32);
    ih_set::set_allocated_size(&mut v[hofs..], (INDEX_HEADER_SIZE + end.len()) as u32);
    ih_set::set_flags(&mut v[hofs..], LARGE_INDEX);
    v.extend_from_slice(&end);
    v
}

/// An empty INDX block: fixup area, LEAF header, END entry.
pub fn build_empty_index_block(block_size: u32, vcn: i64) -> Vec<u8> {
    let mut b = vec![0u8; block_size as usize];
    b[0..4].copy_from_slice(layout::INDX_MAGIC);
    let usa_count = (block_size / 512) as u16 + 1;
    LittleEndian::write_u16(&mut b[4..6], 40);
    LittleEndian::write_u16(&mut b[6..8], usa_count);
    LittleEndian::write_i64(&mut b[16..24], vcn);
    let hofs = INDEX_BLOCK_HEADER_SIZE;
    let usa_end = 40 + usa_count as usize * 2;
    let entries_offset = ((usa_end - hofs) + 7) & !7;
    ih_set::set_entries_offset(&mut b[hofs..], entries_offset as u32);
    let end = build_end_entry(None);
    ih_set::set_index_length(&mut b[hofs..], (entries_offset + end.len()) as u32);
    ih_set::set_allocated_size(&mut b[hofs..], block_size - hofs as u32);
    ih_set::set_flags(&mut b[hofs..], LEAF_NODE);
    b[hofs + entries_offset..hofs + entries_offset + end.len()].copy_from_slice(&end);
    b
}

/// An empty `$INDEX_ROOT:$I30` value: headers plus the END entry, 48 bytes.
pub fn build_empty_root_value(index_block_size: u32, cluster_size: u32) -> Vec<u8> {
    let mut v = vec![0u8; INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE];
    LittleEndian::write_u32(&mut v[0..4], attr_type::FILE_NAME);
    LittleEndian::write_u32(&mut v[4..8], COLLATION_FILE_NAME);
    LittleEndian::write_u32(&mut v[8..12], index_block_size);
    v[12] = if index_block_size >= cluster_size {
        (index_block_size / cluster_size) as u8
    } else {
        1
    };
    let hofs = INDEX_ROOT_HEADER_SIZE;
    ih_set::set_entries_offset(&mut v[hofs..], INDEX_HEADER_SIZE as u32);
    let end = build_end_entry(None);
    ih_set::set_index_length(&mut v[hofs..], (INDEX_HEADER_SIZE + end.len()) as u32);
    ih_set::set_allocated_size(&mut v[hofs..], (INDEX_HEADER_SIZE + end.len()) as u32);
    ih_set::set_flags(&mut v[hofs..], SMALL_INDEX);
    v.extend_from_slice(&end);
    v
}

fn write_root_value(ino: &mut Inode, slot: RecSlot, ofs: usize, value: &[u8]) {
    let vofs = {
        let a = ino.attr_view(slot, ofs);
        ofs + a.value_offset() as usize
    };
    ino.record_mut(slot)[vofs..vofs + value.len()].copy_from_slice(value);
}

/// Flushes edits back: the root value into the record (resizing the
/// attribute when it grew or shrank) and dirty blocks through the
/// allocation runlist with fresh fixups.
pub fn store_index(vol: &mut Volume, ino: &mut Inode, index: &mut LoadedIndex) -> Result<()> {
    if index.root_dirty {
        let (slot, ofs) = ino
            .find_attr(attr_type::INDEX_ROOT, Some(attr::I30))
            .ok_or(FsckError::CorruptRecord {
                mft_no: ino.mft_no,
                reason: "directory without $INDEX_ROOT",
            })?;
        attr::resize_resident_value(ino.record_mut(slot), ofs, index.root_value.len() as u32)?;
        write_root_value(ino, slot, ofs, &index.root_value);
        index.root_dirty = false;
    }

    if let Some(ia_rl) = index.ia_runlist.clone() {
        for vcn in std::mem::take(&mut index.dirty_blocks) {
            let mut buf = index.blocks[&vcn].clone();
            write_fixups(&mut buf)?;
            vol.attr_pwrite(&ia_rl, index.geometry.byte_pos_for_vcn(vcn), &buf)?;
        }
    }
    Ok(())
}

/// The expected index bitmap for a walked directory: one bit per loaded
/// block, sized like the on-disk `$BITMAP`.
pub fn expected_index_bitmap(index: &LoadedIndex) -> Vec<u8> {
    let mut ibm = vec![0u8; index.bitmap.len()];
    for vcn in index.blocks.keys() {
        let bit = index.geometry.bitmap_bit_for_vcn(*vcn);
        if ((bit >> 3) as usize) < ibm.len() {
            ibm[(bit >> 3) as usize] |= 1 << (bit & 7);
        }
    }
    ibm
}

/// Compares the accumulated index bitmap against the on-disk `$BITMAP`
/// and rewrites the on-disk copy when they differ.
pub fn check_index_bitmap(
    vol: &mut Volume,
    ino: &mut Inode,
    expected: &[u8],
    problems: &mut ProblemEngine,
) -> Result<()> {
    let ondisk = attr::read_full_attr_data(vol, ino, attr_type::BITMAP, attr::I30, problems)?;
    let ctx = ProblemCtx::Inode(InodeCtx::num(ino.mft_no));

    if ondisk.len() != expected.len() {
        problems.error_found();
        if problems.fix(ProblemCode::IdxBitmapSizeMismatch, &ctx) {
            if let Some((slot, ofs)) = ino.find_attr(attr_type::BITMAP, Some(attr::I30)) {
                let a = ino.attr_view(slot, ofs);
                if !a.is_non_resident() {
                    attr::resize_resident_value(
                        ino.record_mut(slot),
                        ofs,
                        expected.len() as u32,
                    )?;
                    attr::write_full_attr_data(
                        vol,
                        ino,
                        attr_type::BITMAP,
                        attr::I30,
                        expected,
                        problems,
                    )?;
                    problems.error_fixed();
                } else {
                    let n = ondisk.len().min(expected.len());
                    attr::write_full_attr_data(
                        vol,
                        ino,
                        attr_type::BITMAP,
                        attr::I30,
                        &expected[..n],
                        problems,
                    )?;
                    warn!(mft_no = ino.mft_no, "index bitmap left at its old size");
                    problems.error_fixed();
                }
            }
        }
        return Ok(());
    }

    if ondisk != expected {
        problems.error_found();
        if problems.fix(ProblemCode::IdxBitmapMismatch, &ctx) {
            attr::write_full_attr_data(
                vol,
                ino,
                attr_type::BITMAP,
                attr::I30,
                expected,
                problems,
            )?;
            problems.error_fixed();
        }
    }
    Ok(())
}

/// A directory whose root holds only the END entry must declare exactly
/// the empty-root value length.
pub fn check_empty_root_length(
    ino: &mut Inode,
    problems: &mut ProblemEngine,
) -> Result<()> {
    let Some((slot, ofs)) = ino.find_attr(attr_type::INDEX_ROOT, Some(attr::I30)) else {
        return Ok(());
    };
    let (value_length, plain_end) = {
        let a = ino.attr_view(slot, ofs);
        let Ok(value) = a.value() else {
            return Ok(());
        };
        let Ok(ir) = IndexRoot::new(value) else {
            return Ok(());
        };
        let Ok(entries) = ir.header().entries() else {
            return Ok(());
        };
        let Ok(first) = IndexEntry::new(entries) else {
            return Ok(());
        };
        (a.value_length(), first.is_end() && !first.has_sub_node())
    };
    if !plain_end {
        return Ok(());
    }
    if value_length != layout::EMPTY_INDEX_ROOT_SIZE {
        problems.error_found();
        let ctx = ProblemCtx::Inode(InodeCtx::num(ino.mft_no));
        if problems.fix(ProblemCode::DirEmptyIeLengthCorrupted, &ctx) {
            attr::resize_resident_value(
                ino.record_mut(slot),
                ofs,
                layout::EMPTY_INDEX_ROOT_SIZE,
            )?;
            problems.error_fixed();
        }
    }
    Ok(())
}

/// Builds and inserts a `$FILE_NAME` index entry for `child` into a
/// loaded parent index.
pub fn insert_file_name_entry(
    vol: &Volume,
    index: &mut LoadedIndex,
    parent_mft_no: u64,
    child_ref: MftRef,
    file_name_value: &[u8],
) -> Result<()> {
    let entry = build_index_entry(child_ref, file_name_value);
    index.insert_entry(vol, parent_mft_no, &entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::build_file_name;

    fn test_geometry() -> IndexGeometry {
        IndexGeometry {
            block_size: 4096,
            vcn_size_bits: 12,
        }
    }

    fn name16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn entry_for(name: &str, mft_no: u64) -> Vec<u8> {
        let fnv = build_file_name(MftRef::new(5, 1), 0, 0, 0, &name16(name), 3);
        build_index_entry(MftRef::new(mft_no, 1), &fnv)
    }

    fn empty_index() -> LoadedIndex {
        LoadedIndex {
            geometry: test_geometry(),
            root_value: build_empty_root_value(4096, 4096),
            blocks: BTreeMap::new(),
            ia_runlist: None,
            bitmap: Vec::new(),
            root_dirty: false,
            dirty_blocks: Vec::new(),
        }
    }

    fn test_volume_stub() -> Volume {
        // Only collate_names/names_equal are exercised by these tests.
        crate::volume::test_support::bare_volume()
    }

    #[test]
    fn test_empty_root_value_shape() {
        let v = build_empty_root_value(4096, 4096);
        assert_eq!(v.len(), layout::EMPTY_INDEX_ROOT_SIZE as usize);
        let ir = IndexRoot::new(&v).unwrap();
        assert_eq!(ir.collation_rule(), COLLATION_FILE_NAME);
        let first = IndexEntry::new(ir.header().entries().unwrap()).unwrap();
        assert!(first.is_end());
    }

    #[test]
    fn test_insert_lookup_remove_in_root() {
        let vol = test_volume_stub();
        let mut idx = empty_index();

        idx.insert_entry(&vol, 5, &entry_for("banana", 42)).unwrap();
        idx.insert_entry(&vol, 5, &entry_for("apple", 41)).unwrap();
        idx.insert_entry(&vol, 5, &entry_for("cherry", 43)).unwrap();

        // In-order traversal yields collation order.
        let order: Vec<String> = idx
            .collect_in_order()
            .unwrap()
            .iter()
            .map(|(id, pos)| {
                IndexEntry::new(&idx.node_buf(*id)[*pos..])
                    .unwrap()
                    .file_name()
                    .unwrap()
                    .name_string()
            })
            .collect();
        assert_eq!(order, ["apple", "banana", "cherry"]);

        let (id, pos) = idx.lookup(&vol, &name16("banana")).unwrap().unwrap();
        let e = IndexEntry::new(&idx.node_buf(id)[pos..]).unwrap();
        assert_eq!(e.indexed_file().mft_no(), 42);

        idx.remove_entry(id, pos).unwrap();
        assert!(idx.lookup(&vol, &name16("banana")).unwrap().is_none());
        assert!(idx.lookup(&vol, &name16("APPLE")).unwrap().is_some());
    }

    #[test]
    fn test_duplicate_insert_refused() {
        let vol = test_volume_stub();
        let mut idx = empty_index();
        idx.insert_entry(&vol, 5, &entry_for("same", 42)).unwrap();
        assert!(matches!(
            idx.insert_entry(&vol, 5, &entry_for("same", 43)),
            Err(FsckError::Refused(_))
        ));
    }
}
