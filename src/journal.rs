//! Journal parsing and the replay index.
//!
//! All journal integer fields are big-endian on disk; the accessors here
//! do the conversion once at parse time.

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use log::{info, warn};
use serde_json::{json, Value};

use crate::inode::{Inode, EXT3_DIND_BLOCK, EXT3_IND_BLOCK, EXT3_TIND_BLOCK};
use crate::{get_bitmap_mask, Ext3Error, Ext3Fs, Result, WalkSelector};

pub const JFS_MAGIC_NUMBER: u32 = 0xC03B_3998;

pub const JFS_DESCRIPTOR_BLOCK: u32 = 1;
pub const JFS_COMMIT_BLOCK: u32 = 2;
pub const JFS_SUPERBLOCK_V1: u32 = 3;
pub const JFS_SUPERBLOCK_V2: u32 = 4;
pub const JFS_REVOKE_BLOCK: u32 = 5;

pub const JFS_FLAG_ESCAPE: u32 = 1;
pub const JFS_FLAG_SAME_UUID: u32 = 2;
pub const JFS_FLAG_DELETED: u32 = 4;
pub const JFS_FLAG_LAST_TAG: u32 = 8;

const JOURNAL_HEADER_SIZE: usize = 12;
const REVOKE_HEADER_SIZE: usize = 16;
const TAG_SIZE: usize = 8;
const TAG_UUID_SIZE: usize = 16;

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Common 12-byte header of every journal metadata block.
#[derive(Debug, Clone, Copy)]
pub struct JournalHeader {
    pub h_magic: u32,
    pub h_blocktype: u32,
    pub h_sequence: u32,
}

impl JournalHeader {
    pub fn from_bytes(data: &[u8]) -> Self {
        JournalHeader {
            h_magic: be_u32(data, 0),
            h_blocktype: be_u32(data, 4),
            h_sequence: be_u32(data, 8),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.h_magic == JFS_MAGIC_NUMBER
    }

    pub fn blocktype_str(&self) -> &'static str {
        match self.h_blocktype {
            JFS_DESCRIPTOR_BLOCK => "descriptor block",
            JFS_COMMIT_BLOCK => "commit block",
            JFS_SUPERBLOCK_V1 => "superblock version 1",
            JFS_SUPERBLOCK_V2 => "superblock version 2",
            JFS_REVOKE_BLOCK => "revoke block",
            _ => "*UNKNOWN*",
        }
    }
}

/// The journal's own superblock, stored in its first block.
#[derive(Debug, Clone)]
pub struct JournalSuperblock {
    pub header: JournalHeader,
    pub s_blocksize: u32,
    pub s_maxlen: u32,
    pub s_first: u32,
    pub s_sequence: u32,
    pub s_start: u32,
    pub s_errno: u32,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_nr_users: u32,
}

impl JournalSuperblock {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = JournalHeader::from_bytes(data);
        if !header.is_valid() {
            return Err(Ext3Error::Unsupported(format!(
                "bad journal superblock magic 0x{:08x}",
                header.h_magic
            )));
        }
        if header.h_blocktype != JFS_SUPERBLOCK_V1 && header.h_blocktype != JFS_SUPERBLOCK_V2 {
            return Err(Ext3Error::Unsupported(format!(
                "journal block type {} is not a superblock",
                header.h_blocktype
            )));
        }
        Ok(JournalSuperblock {
            header,
            s_blocksize: be_u32(data, 12),
            s_maxlen: be_u32(data, 16),
            s_first: be_u32(data, 20),
            s_sequence: be_u32(data, 24),
            s_start: be_u32(data, 28),
            s_errno: be_u32(data, 32),
            s_feature_compat: be_u32(data, 36),
            s_feature_incompat: be_u32(data, 40),
            s_feature_ro_compat: be_u32(data, 44),
            s_uuid: data[48..64].try_into().unwrap(),
            s_nr_users: be_u32(data, 64),
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "blocktype": self.header.blocktype_str(),
            "sequence": self.header.h_sequence,
            "blocksize": self.s_blocksize,
            "maxlen": self.s_maxlen,
            "first": self.s_first,
            "start": self.s_start,
            "errno": self.s_errno,
            "nr_users": self.s_nr_users,
        })
    }
}

/// The three journal descriptor kinds, as a sum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorKind {
    /// The journal block at `Descriptor::jblock` is a copy of filesystem
    /// block `fs_block`.
    Tag { fs_block: u32, flags: u32 },
    /// Earlier log entries for these filesystem blocks are invalid.
    Revoke { blocks: Vec<u32> },
    Commit,
}

#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Filesystem block number inside the journal where this descriptor's
    /// payload lives: the copied data block for a tag, the descriptor
    /// block itself for revoke and commit.
    pub jblock: u32,
    pub sequence: u32,
    pub kind: DescriptorKind,
}

/// One journal transaction: the descriptors sharing a sequence number.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub block: u32,
    pub sequence: u32,
    pub committed: bool,
    /// Indices into `JournalIndex::descriptors`.
    pub descriptors: Vec<usize>,
}

/// The built journal index: block maps keyed by filesystem block numbers,
/// transactions keyed by sequence, and the journal-owned block bitmaps.
pub struct JournalIndex {
    journal_inode: Inode,
    pub superblock: JournalSuperblock,
    pub min_journal_block: u32,
    /// One past the largest block belonging to the journal.
    pub max_journal_block: u32,
    journal_block_bitmap: Vec<u64>,
    indirect_block_bitmap: Vec<u64>,
    /// All descriptors, sorted by ascending sequence number.
    pub descriptors: Vec<Descriptor>,
    pub sequence_to_transaction: BTreeMap<u32, Transaction>,
    /// Filesystem block -> descriptors that wrote it, ascending sequence.
    block_to_descriptors: BTreeMap<u32, Vec<usize>>,
    /// Block within the journal -> the descriptor living there.
    journal_block_to_descriptor: BTreeMap<u32, usize>,
    /// Directory block -> inode most recently known to own it.
    pub block_to_dir_inode: BTreeMap<u32, u32>,
    pub wrapped_sequence: u32,
    pub min_sequence: u32,
    pub max_sequence: u32,
}

impl JournalIndex {
    /// Build the index: map the journal inode's blocks, scan the log for
    /// descriptors, assemble transactions, and learn directory-block
    /// ownership from inode-table copies.
    pub fn build<T: Read + Seek>(fs: &mut Ext3Fs<T>) -> Result<JournalIndex> {
        let jinum = fs.superblock.journal_inum();
        if jinum == 0 || !fs.superblock.has_journal() {
            return Err(Ext3Error::Unsupported(
                "filesystem has no journal".to_string(),
            ));
        }
        if !fs.is_inode_allocated(jinum)? {
            return Err(Ext3Error::Unsupported(
                "journal inode is not allocated".to_string(),
            ));
        }
        let journal_inode = fs.get_inode(jinum)?;
        let first_block = journal_inode.block_pointers()[0];
        if first_block == 0 {
            return Err(Ext3Error::Unsupported(
                "journal inode references no blocks".to_string(),
            ));
        }

        let sb_buf = fs.read_block(first_block)?;
        let superblock = JournalSuperblock::from_bytes(&sb_buf)?;
        if superblock.s_blocksize as usize != fs.superblock.block_size() {
            return Err(Ext3Error::Unsupported(format!(
                "journal block size {} differs from filesystem block size {}",
                superblock.s_blocksize,
                fs.superblock.block_size()
            )));
        }

        // Map the block range owned by the journal inode.
        let full_walk = fs.collect_blocks(&journal_inode, WalkSelector::ALL)?;
        if full_walk.reused_or_corrupt || full_walk.blocks.is_empty() {
            return Err(Ext3Error::Unsupported(
                "journal inode block list is corrupt".to_string(),
            ));
        }
        let min_journal_block = *full_walk.blocks.iter().min().unwrap();
        let max_journal_block = *full_walk.blocks.iter().max().unwrap() + 1;
        info!(
            "minimum / maximum journal block: {} / {}",
            min_journal_block, max_journal_block
        );

        let words = ((max_journal_block - min_journal_block) as usize + 63) / 64;
        let mut journal_block_bitmap = vec![0u64; words];
        for &b in &full_walk.blocks {
            let bmp = get_bitmap_mask(b - min_journal_block);
            journal_block_bitmap[bmp.index] |= bmp.mask;
        }
        let indirect_walk = fs.collect_blocks(&journal_inode, WalkSelector::INDIRECT_ONLY)?;
        let mut indirect_block_bitmap = vec![0u64; words];
        for &b in &indirect_walk.blocks {
            let bmp = get_bitmap_mask(b - min_journal_block);
            indirect_block_bitmap[bmp.index] |= bmp.mask;
        }

        let mut index = JournalIndex {
            journal_inode,
            superblock,
            min_journal_block,
            max_journal_block,
            journal_block_bitmap,
            indirect_block_bitmap,
            descriptors: Vec::new(),
            sequence_to_transaction: BTreeMap::new(),
            block_to_descriptors: BTreeMap::new(),
            journal_block_to_descriptor: BTreeMap::new(),
            block_to_dir_inode: BTreeMap::new(),
            wrapped_sequence: 0,
            min_sequence: u32::MAX,
            max_sequence: 0,
        };

        info!("loading journal descriptors...");
        index.scan_descriptors(fs)?;
        index.assemble();
        index.learn_directory_inodes(fs)?;

        if index.wrapped_sequence != 0 {
            warn!(
                "journal transaction {} wraps around, some data blocks of this \
                 transaction might have been lost",
                index.wrapped_sequence
            );
        }
        if index.descriptors.is_empty() {
            index.min_sequence = 0;
        }
        info!(
            "number of descriptors in journal: {}; min / max sequence numbers: {} / {}",
            index.descriptors.len(),
            index.min_sequence,
            index.max_sequence
        );
        Ok(index)
    }

    /// Linear scan of the log from `s_first`, collecting descriptors in
    /// journal order.
    fn scan_descriptors<T: Read + Seek>(&mut self, fs: &mut Ext3Fs<T>) -> Result<()> {
        let bs = fs.superblock.block_size();
        let maxlen = self.superblock.s_maxlen;
        let mut jbn = self.superblock.s_first;
        while jbn < maxlen {
            let bn = self.journal_block_to_fs_block(fs, jbn)?;
            let buf = fs.read_block(bn)?;
            let header = JournalHeader::from_bytes(&buf);
            if header.is_valid() {
                let sequence = header.h_sequence;
                self.min_sequence = self.min_sequence.min(sequence);
                self.max_sequence = self.max_sequence.max(sequence);
                match header.h_blocktype {
                    JFS_DESCRIPTOR_BLOCK => {
                        // Tags refer to successive journal blocks after the
                        // descriptor block.
                        let mut tag_offset = JOURNAL_HEADER_SIZE;
                        loop {
                            if tag_offset + TAG_SIZE > bs {
                                warn!(
                                    "descriptor block {} runs out of space mid-tag; \
                                     journal corrupt?",
                                    bn
                                );
                                return Ok(());
                            }
                            jbn += 1;
                            if jbn >= maxlen {
                                self.wrapped_sequence = sequence;
                                return Ok(());
                            }
                            let data_block = self.journal_block_to_fs_block(fs, jbn)?;
                            let fs_block = be_u32(&buf, tag_offset);
                            let flags = be_u32(&buf, tag_offset + 4);
                            self.descriptors.push(Descriptor {
                                jblock: data_block,
                                sequence,
                                kind: DescriptorKind::Tag { fs_block, flags },
                            });
                            if flags & JFS_FLAG_LAST_TAG != 0 {
                                break;
                            }
                            tag_offset += TAG_SIZE;
                            if flags & JFS_FLAG_SAME_UUID == 0 {
                                tag_offset += TAG_UUID_SIZE;
                            }
                        }
                    }
                    JFS_COMMIT_BLOCK => {
                        self.descriptors.push(Descriptor {
                            jblock: bn,
                            sequence,
                            kind: DescriptorKind::Commit,
                        });
                    }
                    JFS_REVOKE_BLOCK => {
                        let count = be_u32(&buf, 12) as usize;
                        if count < REVOKE_HEADER_SIZE || count > bs || (count - REVOKE_HEADER_SIZE) % 4 != 0 {
                            warn!("revoke block {} has bad byte count {}", bn, count);
                            return Ok(());
                        }
                        let blocks = (REVOKE_HEADER_SIZE..count)
                            .step_by(4)
                            .map(|o| be_u32(&buf, o))
                            .collect();
                        self.descriptors.push(Descriptor {
                            jblock: bn,
                            sequence,
                            kind: DescriptorKind::Revoke { blocks },
                        });
                    }
                    other => {
                        warn!(
                            "unexpected journal blocktype ({}) at journal block {}; \
                             journal corrupt?",
                            other, jbn
                        );
                        return Ok(());
                    }
                }
            }
            jbn += 1;
        }
        Ok(())
    }

    /// Sort by sequence and build the transaction and block maps.
    fn assemble(&mut self) {
        self.descriptors.sort_by_key(|d| d.sequence);
        for (idx, d) in self.descriptors.iter().enumerate() {
            match &d.kind {
                DescriptorKind::Tag { fs_block, .. } => {
                    let txn = self
                        .sequence_to_transaction
                        .entry(d.sequence)
                        .or_insert_with(|| Transaction {
                            block: d.jblock,
                            sequence: d.sequence,
                            committed: false,
                            descriptors: Vec::new(),
                        });
                    txn.descriptors.push(idx);
                    self.block_to_descriptors
                        .entry(*fs_block)
                        .or_default()
                        .push(idx);
                    if self
                        .journal_block_to_descriptor
                        .insert(d.jblock, idx)
                        .is_some()
                    {
                        warn!("journal block {} claimed by two descriptors", d.jblock);
                    }
                }
                DescriptorKind::Revoke { blocks } => {
                    let txn = self
                        .sequence_to_transaction
                        .entry(d.sequence)
                        .or_insert_with(|| Transaction {
                            block: d.jblock,
                            sequence: d.sequence,
                            committed: false,
                            descriptors: Vec::new(),
                        });
                    txn.descriptors.push(idx);
                    for &b in blocks {
                        self.block_to_descriptors.entry(b).or_default().push(idx);
                    }
                    if self
                        .journal_block_to_descriptor
                        .insert(d.jblock, idx)
                        .is_some()
                    {
                        warn!("journal block {} claimed by two descriptors", d.jblock);
                    }
                }
                DescriptorKind::Commit => {
                    // A commit with no tag or revoke is of no interest
                    // (possibly the tail of a wrapped transaction).
                    if let Some(txn) = self.sequence_to_transaction.get_mut(&d.sequence) {
                        txn.committed = true;
                    }
                }
            }
        }
    }

    /// Inspect every inode-table copy in the journal; live directory
    /// inodes teach us which blocks belong to which directory inode. Tags
    /// are processed in ascending sequence, so the last write wins.
    fn learn_directory_inodes<T: Read + Seek>(&mut self, fs: &mut Ext3Fs<T>) -> Result<()> {
        let isz = fs.superblock.inode_size();
        let per_block = fs.superblock.block_size() / isz;
        let tags: Vec<(u32, u32)> = self
            .descriptors
            .iter()
            .filter_map(|d| match d.kind {
                DescriptorKind::Tag { fs_block, .. } if fs.is_inode_block(fs_block) => {
                    Some((d.jblock, fs_block))
                }
                _ => None,
            })
            .collect();
        for (jblock, fs_block) in tags {
            let base_inode = fs.block_to_inode(fs_block);
            let buf = fs.read_block(jblock)?;
            for i in 0..per_block {
                let inode_number = base_inode + i as u32;
                let copy = Inode::from_bytes(inode_number, &buf[i * isz..(i + 1) * isz]);
                if !copy.is_dir() {
                    continue;
                }
                if copy.dtime() != 0 || copy.i_atime == 0 || copy.block_pointers()[0] == 0 {
                    continue;
                }
                let walk = fs.collect_blocks(&copy, WalkSelector::DATA)?;
                for &b in &walk.blocks {
                    self.block_to_dir_inode.insert(b, inode_number);
                }
                if walk.reused_or_corrupt {
                    info!(
                        "journal block {} holds a copy of directory inode {} whose \
                         indirect blocks are reused or corrupt",
                        jblock, inode_number
                    );
                }
            }
        }
        Ok(())
    }

    /// Translate a journal-relative block index to the filesystem block
    /// holding it, through the journal inode's pointer layers. This is the
    /// only function accepting journal block numbers.
    pub fn journal_block_to_fs_block<T: Read + Seek>(
        &self,
        fs: &mut Ext3Fs<T>,
        jblock: u32,
    ) -> Result<u32> {
        if jblock >= self.superblock.s_maxlen {
            return Err(Ext3Error::OutOfRange {
                what: "journal block",
                value: jblock as u64,
                limit: self.superblock.s_maxlen as u64,
            });
        }
        let ptrs = self.journal_inode.block_pointers();
        let mut n = jblock as usize;
        if n < 12 {
            return Ok(ptrs[n]);
        }
        n -= 12;
        let vpb = fs.superblock.block_size() / 4;
        let ptr_at = |buf: &[u8], i: usize| -> u32 {
            u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap())
        };
        if n < vpb {
            let ind = fs.read_block(ptrs[EXT3_IND_BLOCK])?;
            return Ok(ptr_at(&ind, n));
        }
        n -= vpb;
        if n < vpb * vpb {
            let dind = fs.read_block(ptrs[EXT3_DIND_BLOCK])?;
            let ind = fs.read_block(ptr_at(&dind, n / vpb))?;
            return Ok(ptr_at(&ind, n % vpb));
        }
        n -= vpb * vpb;
        if n < vpb * vpb * vpb {
            let tind = fs.read_block(ptrs[EXT3_TIND_BLOCK])?;
            let dind = fs.read_block(ptr_at(&tind, n / (vpb * vpb)))?;
            let ind = fs.read_block(ptr_at(&dind, (n / vpb) % vpb))?;
            return Ok(ptr_at(&ind, n % vpb));
        }
        Err(Ext3Error::OutOfRange {
            what: "journal block",
            value: jblock as u64,
            limit: self.superblock.s_maxlen as u64,
        })
    }

    pub fn is_in_journal(&self, block: u32) -> bool {
        block >= self.min_journal_block && block < self.max_journal_block
    }

    /// True when `block` is owned by the journal inode.
    pub fn is_journal(&self, block: u32) -> bool {
        if !self.is_in_journal(block) {
            return false;
        }
        let bmp = get_bitmap_mask(block - self.min_journal_block);
        self.journal_block_bitmap[bmp.index] & bmp.mask != 0
    }

    /// True when `block` is indirect metadata of the journal inode itself;
    /// such blocks must be skipped when interpreting journal contents.
    pub fn is_indirect_block_in_journal(&self, block: u32) -> bool {
        if !self.is_in_journal(block) {
            return false;
        }
        let bmp = get_bitmap_mask(block - self.min_journal_block);
        self.indirect_block_bitmap[bmp.index] & bmp.mask != 0
    }

    pub fn descriptor(&self, idx: usize) -> &Descriptor {
        &self.descriptors[idx]
    }

    /// Descriptors that wrote filesystem block `block`, ascending sequence.
    pub fn descriptors_for(&self, block: u32) -> &[usize] {
        self.block_to_descriptors
            .get(&block)
            .map_or(&[], |v| v.as_slice())
    }

    /// The descriptor living at journal-owned filesystem block `block`.
    pub fn descriptor_in_journal(&self, block: u32) -> Option<&Descriptor> {
        self.journal_block_to_descriptor
            .get(&block)
            .map(|&idx| &self.descriptors[idx])
    }

    /// Largest sequence number of any descriptor that wrote `block`, or 0.
    pub fn find_largest_journal_sequence_number(&self, block: u32) -> u32 {
        self.block_to_descriptors
            .get(&block)
            .and_then(|v| v.last())
            .map_or(0, |&idx| self.descriptors[idx].sequence)
    }

    /// When the journal-owned `block` is a tag holding an inode-table
    /// copy, the mirrored inode-table block.
    pub fn journal_block_contains_inodes<T: Read + Seek>(
        &self,
        fs: &Ext3Fs<T>,
        block: u32,
    ) -> Option<u32> {
        match self.descriptor_in_journal(block)?.kind {
            DescriptorKind::Tag { fs_block, .. } if fs.is_inode_block(fs_block) => Some(fs_block),
            _ => None,
        }
    }

    /// Historical copies of inode `ino` found in the journal, most recent
    /// (highest sequence) first.
    pub fn inode_copies<T: Read + Seek>(
        &self,
        fs: &mut Ext3Fs<T>,
        ino: u32,
    ) -> Result<Vec<(u32, Inode)>> {
        let table_block = fs.inode_to_block(ino);
        let isz = fs.superblock.inode_size();
        let offset = (ino - fs.block_to_inode(table_block)) as usize * isz;
        let copies: Vec<(u32, u32)> = self
            .descriptors_for(table_block)
            .iter()
            .rev()
            .filter_map(|&idx| {
                let d = &self.descriptors[idx];
                match d.kind {
                    DescriptorKind::Tag { .. } => Some((d.sequence, d.jblock)),
                    _ => None,
                }
            })
            .collect();
        let mut out = Vec::with_capacity(copies.len());
        for (sequence, jblock) in copies {
            let buf = fs.read_block(jblock)?;
            out.push((sequence, Inode::from_bytes(ino, &buf[offset..offset + isz])));
        }
        Ok(out)
    }

    /// The inode-table block that `block` represents: itself when it lies
    /// in a group's inode table, or the mirrored block when it is a
    /// journal copy of one.
    pub fn inode_table_block_for<T: Read + Seek>(
        &self,
        fs: &Ext3Fs<T>,
        block: u32,
    ) -> Option<u32> {
        if fs.is_inode_block(block) {
            return Some(block);
        }
        if !self.is_journal(block) || self.is_indirect_block_in_journal(block) {
            return None;
        }
        self.journal_block_contains_inodes(fs, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parses_big_endian() {
        let mut data = vec![0u8; 12];
        data[0..4].copy_from_slice(&JFS_MAGIC_NUMBER.to_be_bytes());
        data[4..8].copy_from_slice(&JFS_DESCRIPTOR_BLOCK.to_be_bytes());
        data[8..12].copy_from_slice(&42u32.to_be_bytes());
        let h = JournalHeader::from_bytes(&data);
        assert!(h.is_valid());
        assert_eq!(h.h_blocktype, JFS_DESCRIPTOR_BLOCK);
        assert_eq!(h.h_sequence, 42);
    }

    #[test]
    fn journal_superblock_rejects_wrong_blocktype() {
        let mut data = vec![0u8; 1024];
        data[0..4].copy_from_slice(&JFS_MAGIC_NUMBER.to_be_bytes());
        data[4..8].copy_from_slice(&JFS_COMMIT_BLOCK.to_be_bytes());
        assert!(JournalSuperblock::from_bytes(&data).is_err());
    }
}
