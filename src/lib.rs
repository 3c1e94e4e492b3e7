//! Forensic analysis and undelete for ext3 filesystem images.
//!
//! The entry point is [`Ext3Fs`], a read-only view over any `Read + Seek`
//! body containing an unmounted ext3 filesystem with its journal. On top of
//! it sit the journal index ([`journal::JournalIndex`]), the whole-device
//! directory scan ([`resolve::Stage1Scan`]), the directory resolver
//! ([`resolve::DirectoryTree`]) and the restorer ([`restore`]).
//!
//! Build order matters: the journal index is built once after the
//! filesystem is opened, the stage-1 scan consumes it, the resolver
//! consumes both, and the restorer consumes the resolver's maps.

use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom};

use log::warn;
use thiserror::Error;

pub mod direntry;
pub mod groupdescriptor;
pub mod inode;
pub mod journal;
pub mod resolve;
pub mod restore;
pub mod superblock;

use groupdescriptor::{GroupDescriptor, GROUP_DESC_SIZE};
use inode::{Inode, EXT3_DIND_BLOCK, EXT3_IND_BLOCK, EXT3_NDIR_BLOCKS, EXT3_TIND_BLOCK};
use superblock::{Superblock, SUPERBLOCK_OFFSET};

#[derive(Debug, Error)]
pub enum Ext3Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported filesystem: {0}")]
    Unsupported(String),

    #[error("{what} {value} is out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        value: u64,
        limit: u64,
    },

    #[error("corrupt structure in block {block}: {detail}")]
    Corrupt { block: u32, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad cache file {path}: {detail}")]
    Cache { path: String, detail: String },
}

pub type Result<T> = std::result::Result<T, Ext3Error>;

/// Position of one bit inside an array of 64-bit bitmap words.
///
/// The filesystem bitmap convention is byte-wise low-to-high, LSB-first
/// within each byte, which for little-endian words collapses to plain bit
/// indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapMask {
    pub index: usize,
    pub mask: u64,
}

pub fn get_bitmap_mask(bit: u32) -> BitmapMask {
    BitmapMask {
        index: (bit >> 6) as usize,
        mask: 1u64 << (bit & 63),
    }
}

fn words_from_le_bytes(data: &[u8]) -> Vec<u64> {
    data.chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Entry filters applied while decoding directory blocks. Times are the
/// raw 32-bit dtime values.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub deleted: bool,
    pub directory: bool,
    pub allocated: bool,
    pub unallocated: bool,
    pub reallocated: bool,
    pub zeroed_inodes: bool,
    pub after: Option<u32>,
    pub before: Option<u32>,
    /// Bound on directory recursion depth during reconstruction; `None`
    /// leaves only the loop-protection ceiling.
    pub depth: Option<u32>,
}

/// Selects what the block walker emits: data blocks, indirect metadata
/// blocks, or both (the latter is used when mapping the journal inode).
#[derive(Debug, Clone, Copy)]
pub struct WalkSelector {
    pub data: bool,
    pub indirect: bool,
}

impl WalkSelector {
    pub const DATA: WalkSelector = WalkSelector {
        data: true,
        indirect: false,
    };
    pub const ALL: WalkSelector = WalkSelector {
        data: true,
        indirect: true,
    };
    pub const INDIRECT_ONLY: WalkSelector = WalkSelector {
        data: false,
        indirect: true,
    };
}

/// Result of enumerating an inode's blocks. `reused_or_corrupt` is set when
/// an indirect block no longer contains a valid pointer array; the blocks
/// collected up to that point are still returned.
#[derive(Debug, Clone, Default)]
pub struct BlockWalk {
    pub blocks: Vec<u32>,
    pub reused_or_corrupt: bool,
}

/// Per-group metadata, loaded on first access: both allocation bitmaps and
/// the full inode table.
struct GroupMeta {
    block_bitmap: Vec<u64>,
    inode_bitmap: Vec<u64>,
    inode_table: Vec<u8>,
}

/// A read-only ext3 filesystem over any `Read + Seek` body.
pub struct Ext3Fs<T: Read + Seek> {
    body: T,
    pub superblock: Superblock,
    group_desc: Vec<GroupDescriptor>,
    groups: Vec<Option<GroupMeta>>,
    pub filter: Filter,
    pub accepted_filenames: BTreeSet<String>,
}

impl<T: Read + Seek> Ext3Fs<T> {
    /// Open the filesystem: parse the superblock at byte 1024, validate it,
    /// and read the group descriptor table from the following block.
    pub fn open(mut body: T) -> Result<Self> {
        body.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        let mut sb_buf = vec![0u8; 1024];
        body.read_exact(&mut sb_buf)?;
        let superblock = Superblock::from_bytes(&sb_buf)?;

        if superblock.has_external_journal() {
            return Err(Ext3Error::Unsupported(
                "external journals are not handled".to_string(),
            ));
        }
        let bs = superblock.block_size();
        if superblock.frag_size() != bs {
            return Err(Ext3Error::Unsupported(
                "fragment size differs from block size".to_string(),
            ));
        }
        if superblock.inodes_per_group() > 8 * bs {
            return Err(Ext3Error::Unsupported(
                "inode bitmap does not fit in one block".to_string(),
            ));
        }
        if bs % superblock.inode_size() != 0 {
            return Err(Ext3Error::Unsupported(
                "inodes do not pack evenly into blocks".to_string(),
            ));
        }
        if (superblock.inodes_per_group() * superblock.inode_size()) % bs != 0 {
            return Err(Ext3Error::Unsupported(
                "inode table is not a whole number of blocks".to_string(),
            ));
        }
        if superblock.s_inodes_per_group == 0
            || superblock.groups() as u32 * superblock.s_inodes_per_group
                != superblock.s_inodes_count
        {
            return Err(Ext3Error::Unsupported(
                "inode count is not a multiple of inodes per group".to_string(),
            ));
        }

        // The group descriptor table starts in the block after the one
        // holding the superblock.
        let sb_block = (SUPERBLOCK_OFFSET / bs as u64) as u32;
        let gd_block = sb_block + 1;
        let groups = superblock.groups();
        body.seek(SeekFrom::Start(gd_block as u64 * bs as u64))?;
        let mut gd_buf = vec![0u8; groups * GROUP_DESC_SIZE];
        body.read_exact(&mut gd_buf)?;
        let group_desc = gd_buf
            .chunks_exact(GROUP_DESC_SIZE)
            .map(GroupDescriptor::from_bytes)
            .collect();

        let mut group_cache = Vec::with_capacity(groups);
        group_cache.resize_with(groups, || None);

        Ok(Ext3Fs {
            body,
            superblock,
            group_desc,
            groups: group_cache,
            filter: Filter::default(),
            accepted_filenames: BTreeSet::new(),
        })
    }

    pub fn group_descriptors(&self) -> &[GroupDescriptor] {
        &self.group_desc
    }

    pub fn block_size(&self) -> usize {
        self.superblock.block_size()
    }

    fn block_to_offset(&self, block: u32) -> u64 {
        block as u64 * self.superblock.block_size() as u64
    }

    pub fn block_to_group(&self, block: u32) -> usize {
        (block.saturating_sub(self.superblock.first_data_block())
            / self.superblock.blocks_per_group()) as usize
    }

    pub fn group_to_block(&self, group: usize) -> u32 {
        self.superblock.first_data_block() + group as u32 * self.superblock.blocks_per_group()
    }

    pub fn inode_to_group(&self, inode: u32) -> usize {
        ((inode - 1) as usize) / self.superblock.inodes_per_group()
    }

    /// The inode-table block that holds inode `inode`.
    pub fn inode_to_block(&self, inode: u32) -> u32 {
        let group = self.inode_to_group(inode);
        let index = (inode - 1) as usize - group * self.superblock.inodes_per_group();
        self.group_desc[group].bg_inode_table
            + (index * self.superblock.inode_size() / self.superblock.block_size()) as u32
    }

    /// Read one block. Repeated reads of the same block return identical
    /// bytes; the device is never written.
    pub fn read_block(&mut self, block: u32) -> Result<Vec<u8>> {
        if block >= self.superblock.blocks_count() {
            return Err(Ext3Error::OutOfRange {
                what: "block",
                value: block as u64,
                limit: self.superblock.blocks_count() as u64,
            });
        }
        let bs = self.superblock.block_size();
        self.body.seek(SeekFrom::Start(self.block_to_offset(block)))?;
        let mut buf = vec![0u8; bs];
        self.body.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn load_group(&mut self, group: usize) -> Result<&GroupMeta> {
        if self.groups[group].is_none() {
            let gd = self.group_desc[group].clone();
            let block_bitmap = words_from_le_bytes(&self.read_block(gd.bg_block_bitmap)?);
            let inode_bitmap = words_from_le_bytes(&self.read_block(gd.bg_inode_bitmap)?);

            let table_bytes =
                self.superblock.inodes_per_group() * self.superblock.inode_size();
            let table_blocks = table_bytes / self.superblock.block_size();
            let mut inode_table = Vec::with_capacity(table_bytes);
            for i in 0..table_blocks as u32 {
                inode_table.extend_from_slice(&self.read_block(gd.bg_inode_table + i)?);
            }
            self.groups[group] = Some(GroupMeta {
                block_bitmap,
                inode_bitmap,
                inode_table,
            });
        }
        Ok(self.groups[group].as_ref().unwrap())
    }

    pub fn is_inode_allocated(&mut self, inode: u32) -> Result<bool> {
        if inode == 0 || inode > self.superblock.inodes_count() {
            return Err(Ext3Error::OutOfRange {
                what: "inode",
                value: inode as u64,
                limit: self.superblock.inodes_count() as u64,
            });
        }
        let group = self.inode_to_group(inode);
        let bit = (inode - 1) - (group * self.superblock.inodes_per_group()) as u32;
        let meta = self.load_group(group)?;
        let bmp = get_bitmap_mask(bit);
        Ok(meta.inode_bitmap[bmp.index] & bmp.mask != 0)
    }

    pub fn is_block_allocated(&mut self, block: u32) -> Result<bool> {
        if block < self.superblock.first_data_block() || block >= self.superblock.blocks_count() {
            return Err(Ext3Error::OutOfRange {
                what: "block",
                value: block as u64,
                limit: self.superblock.blocks_count() as u64,
            });
        }
        let group = self.block_to_group(block);
        let bit = block
            - self.superblock.first_data_block()
            - (group as u32) * self.superblock.blocks_per_group();
        let meta = self.load_group(group)?;
        let bmp = get_bitmap_mask(bit);
        Ok(meta.block_bitmap[bmp.index] & bmp.mask != 0)
    }

    /// Raw bytes of the inode table slot for `inode`.
    pub fn raw_inode(&mut self, inode: u32) -> Result<Vec<u8>> {
        if inode == 0 || inode > self.superblock.inodes_count() {
            return Err(Ext3Error::OutOfRange {
                what: "inode",
                value: inode as u64,
                limit: self.superblock.inodes_count() as u64,
            });
        }
        let group = self.inode_to_group(inode);
        let index = (inode - 1) as usize - group * self.superblock.inodes_per_group();
        let isz = self.superblock.inode_size();
        let meta = self.load_group(group)?;
        Ok(meta.inode_table[index * isz..(index + 1) * isz].to_vec())
    }

    /// Parse the on-disk inode record for `inode`.
    pub fn get_inode(&mut self, inode: u32) -> Result<Inode> {
        let raw = self.raw_inode(inode)?;
        Ok(Inode::from_bytes(inode, &raw))
    }

    /// True when `block` falls inside some group's inode table.
    pub fn is_inode_block(&self, block: u32) -> bool {
        if block < self.superblock.first_data_block() {
            return false;
        }
        let group = self.block_to_group(block);
        if group >= self.group_desc.len() {
            return false;
        }
        let (first, last) = self.group_desc[group].inode_table_span(&self.superblock);
        block >= first && block <= last
    }

    /// First inode number stored in inode-table block `block`. Only valid
    /// when `is_inode_block` returned true.
    pub fn block_to_inode(&self, block: u32) -> u32 {
        let group = self.block_to_group(block);
        let table = self.group_desc[group].bg_inode_table;
        1 + (group * self.superblock.inodes_per_group()) as u32
            + ((block - table) as usize * self.superblock.block_size()
                / self.superblock.inode_size()) as u32
    }

    /// Classifier handle for directory-block detection, bound to the
    /// filesystem geometry and the user's filename allow-list.
    pub fn dir_classifier(&self) -> direntry::DirClassifier<'_> {
        direntry::DirClassifier {
            block_size: self.superblock.block_size(),
            inode_count: self.superblock.inodes_count(),
            accepted: &self.accepted_filenames,
        }
    }

    /// Enumerate every block of `inode` through the direct and
    /// single/double/triple indirect trees, depth first.
    ///
    /// A zero pointer terminates its level; a pointer at or beyond the
    /// block count aborts the walk with `reused_or_corrupt` set. Inline
    /// symlinks own no blocks and return an empty walk.
    pub fn collect_blocks(&mut self, inode: &Inode, sel: WalkSelector) -> Result<BlockWalk> {
        let mut walk = BlockWalk::default();
        if inode.has_inline_symlink_target() {
            return Ok(walk);
        }
        let count = self.superblock.blocks_count();
        let ptrs = *inode.block_pointers();

        if sel.data {
            for &b in ptrs.iter().take(EXT3_NDIR_BLOCKS) {
                if b == 0 {
                    break;
                }
                if b >= count {
                    walk.reused_or_corrupt = true;
                    return Ok(walk);
                }
                walk.blocks.push(b);
            }
        }
        for (slot, level) in [
            (EXT3_IND_BLOCK, 1u32),
            (EXT3_DIND_BLOCK, 2),
            (EXT3_TIND_BLOCK, 3),
        ] {
            let b = ptrs[slot];
            if b == 0 {
                continue;
            }
            if b >= count {
                walk.reused_or_corrupt = true;
                return Ok(walk);
            }
            if sel.indirect {
                walk.blocks.push(b);
            }
            if self.walk_indirect(b, level, sel, &mut walk)? {
                return Ok(walk);
            }
        }
        Ok(walk)
    }

    /// Walk one indirect node whose entries sit `level` indirections above
    /// data. Returns true when the walk must abort.
    fn walk_indirect(
        &mut self,
        block: u32,
        level: u32,
        sel: WalkSelector,
        walk: &mut BlockWalk,
    ) -> Result<bool> {
        if level == 1 && !sel.data {
            return Ok(false);
        }
        let count = self.superblock.blocks_count();
        let buf = self.read_block(block)?;
        for chunk in buf.chunks_exact(4) {
            let ptr = u32::from_le_bytes(chunk.try_into().unwrap());
            if ptr == 0 {
                break;
            }
            if ptr >= count {
                walk.reused_or_corrupt = true;
                return Ok(true);
            }
            if level == 1 {
                walk.blocks.push(ptr);
            } else {
                if sel.indirect {
                    walk.blocks.push(ptr);
                }
                if self.walk_indirect(ptr, level - 1, sel, walk)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Read the symlink target of `inode`, inline or from its first data
    /// block.
    pub fn read_symlink_target(&mut self, inode: &Inode) -> Result<String> {
        if let Some(target) = inode.inline_symlink_target() {
            return Ok(target);
        }
        let first = inode.block_pointers()[0];
        if first == 0 {
            return Err(Ext3Error::NotFound(format!(
                "symlink inode {} has no data block",
                inode.i_num
            )));
        }
        let buf = self.read_block(first)?;
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..len]).to_string())
    }

    /// Stream a regular file's content: the concatenation of its data
    /// blocks truncated to the inode size. Returns the bytes and whether
    /// the enumeration hit a reused or corrupt indirect block.
    pub fn read_file_content(&mut self, inode: &Inode) -> Result<(Vec<u8>, bool)> {
        let walk = self.collect_blocks(inode, WalkSelector::DATA)?;
        let bs = self.superblock.block_size();
        let mut remaining = inode.size() as usize;
        let mut data = Vec::with_capacity(remaining.min(walk.blocks.len() * bs));
        for &b in &walk.blocks {
            if remaining == 0 {
                break;
            }
            let buf = self.read_block(b)?;
            let len = remaining.min(bs);
            data.extend_from_slice(&buf[..len]);
            remaining -= len;
        }
        Ok((data, walk.reused_or_corrupt))
    }

    /// Emit a warning for an inode that still carries block pointers after
    /// deletion; ext3 normally wipes them, symlinks excepted.
    pub(crate) fn warn_nonzero_block_list(&self, inode: &Inode) {
        if !inode.is_symlink() && inode.dtime() != 0 && inode.block_pointers()[0] != 0 {
            warn!(
                "inode {} has non-zero dtime ({}) but non-zero block list ({})",
                inode.i_num,
                inode.dtime(),
                inode.block_pointers()[0]
            );
        }
    }
}
