//! Synthetic ext3 image builder for the integration tests.
//!
//! Produces a single-group filesystem with 1 KiB blocks, 32 inodes and an
//! internal journal, over an in-memory `Cursor`.
#![allow(dead_code)]

use std::io::Cursor;

pub const BLOCK_SIZE: usize = 1024;
pub const BLOCKS_COUNT: u32 = 512;
pub const INODES_COUNT: u32 = 32;
pub const INODE_SIZE: usize = 128;

pub const EXT3_MAGIC: u16 = 0xEF53;
pub const JFS_MAGIC: u32 = 0xC03B_3998;
pub const JFS_DESCRIPTOR: u32 = 1;
pub const JFS_COMMIT: u32 = 2;
pub const JFS_SUPERBLOCK_V2: u32 = 4;
pub const JFS_REVOKE: u32 = 5;
pub const FLAG_SAME_UUID: u32 = 2;
pub const FLAG_LAST_TAG: u32 = 8;

pub const FT_REG: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_SYMLINK: u8 = 7;

// Fixed layout: block 1 superblock, block 2 group descriptors, block 3
// block bitmap, block 4 inode bitmap, blocks 5-8 inode table.
pub const BLOCK_BITMAP_BLOCK: u32 = 3;
pub const INODE_BITMAP_BLOCK: u32 = 4;
pub const INODE_TABLE_BLOCK: u32 = 5;

pub struct ImageBuilder {
    pub blocks: Vec<Vec<u8>>,
    block_bitmap: Vec<u8>,
    inode_bitmap: Vec<u8>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            blocks: vec![vec![0u8; BLOCK_SIZE]; BLOCKS_COUNT as usize],
            block_bitmap: vec![0u8; BLOCK_SIZE],
            inode_bitmap: vec![0u8; BLOCK_SIZE],
        }
    }

    pub fn set_block(&mut self, n: u32, data: Vec<u8>) {
        let mut block = data;
        block.resize(BLOCK_SIZE, 0);
        self.blocks[n as usize] = block;
    }

    pub fn block_mut(&mut self, n: u32) -> &mut [u8] {
        &mut self.blocks[n as usize]
    }

    pub fn mark_block_allocated(&mut self, block: u32) {
        let bit = block - 1; // first_data_block == 1
        self.block_bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    pub fn mark_inode_allocated(&mut self, inode: u32) {
        let bit = inode - 1;
        self.inode_bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    pub fn set_inode(&mut self, inode: u32, raw: &[u8; INODE_SIZE]) {
        let index = (inode - 1) as usize;
        let block = INODE_TABLE_BLOCK as usize + index * INODE_SIZE / BLOCK_SIZE;
        let offset = (index * INODE_SIZE) % BLOCK_SIZE;
        self.blocks[block][offset..offset + INODE_SIZE].copy_from_slice(raw);
    }

    /// Install a journal of `contents.len()` blocks at consecutive
    /// filesystem blocks starting at `first_fs_block`, owned by inode 8.
    pub fn install_journal(&mut self, first_fs_block: u32, contents: Vec<Vec<u8>>) {
        assert!(contents.len() <= 12, "direct pointers only");
        let mut ptrs = [0u32; 15];
        for (i, data) in contents.into_iter().enumerate() {
            let b = first_fs_block + i as u32;
            ptrs[i] = b;
            self.set_block(b, data);
            self.mark_block_allocated(b);
        }
        let count = ptrs.iter().filter(|&&p| p != 0).count();
        let raw = raw_inode(
            0o100600,
            (count * BLOCK_SIZE) as u32,
            0,
            1_200_000_000,
            (count * BLOCK_SIZE / 512) as u32,
            &ptrs,
        );
        self.set_inode(8, &raw);
        self.mark_inode_allocated(8);
    }

    pub fn build(mut self) -> Cursor<Vec<u8>> {
        self.set_block(1, superblock_bytes());
        self.set_block(2, group_descriptor_bytes());
        let bb = self.block_bitmap.clone();
        let ib = self.inode_bitmap.clone();
        self.set_block(BLOCK_BITMAP_BLOCK, bb);
        self.set_block(INODE_BITMAP_BLOCK, ib);
        let mut image = Vec::with_capacity(BLOCKS_COUNT as usize * BLOCK_SIZE);
        for block in &self.blocks {
            image.extend_from_slice(block);
        }
        Cursor::new(image)
    }
}

fn superblock_bytes() -> Vec<u8> {
    let mut data = vec![0u8; BLOCK_SIZE];
    data[0x00..0x04].copy_from_slice(&INODES_COUNT.to_le_bytes());
    data[0x04..0x08].copy_from_slice(&BLOCKS_COUNT.to_le_bytes());
    data[0x14..0x18].copy_from_slice(&1u32.to_le_bytes()); // first data block
    data[0x18..0x1C].copy_from_slice(&0u32.to_le_bytes()); // log block size
    data[0x1C..0x20].copy_from_slice(&0u32.to_le_bytes()); // log frag size
    data[0x20..0x24].copy_from_slice(&8192u32.to_le_bytes()); // blocks per group
    data[0x24..0x28].copy_from_slice(&8192u32.to_le_bytes()); // frags per group
    data[0x28..0x2C].copy_from_slice(&INODES_COUNT.to_le_bytes()); // inodes per group
    data[0x38..0x3A].copy_from_slice(&EXT3_MAGIC.to_le_bytes());
    data[0x4C..0x50].copy_from_slice(&1u32.to_le_bytes()); // rev level
    data[0x54..0x58].copy_from_slice(&11u32.to_le_bytes()); // first inode
    data[0x58..0x5A].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
    data[0x5C..0x60].copy_from_slice(&0x4u32.to_le_bytes()); // has journal
    data[0xE0..0xE4].copy_from_slice(&8u32.to_le_bytes()); // journal inum
    data
}

fn group_descriptor_bytes() -> Vec<u8> {
    let mut data = vec![0u8; BLOCK_SIZE];
    data[0x00..0x04].copy_from_slice(&BLOCK_BITMAP_BLOCK.to_le_bytes());
    data[0x04..0x08].copy_from_slice(&INODE_BITMAP_BLOCK.to_le_bytes());
    data[0x08..0x0C].copy_from_slice(&INODE_TABLE_BLOCK.to_le_bytes());
    data
}

/// A classic 128-byte inode record.
pub fn raw_inode(
    mode: u16,
    size: u32,
    dtime: u32,
    atime: u32,
    sectors: u32,
    ptrs: &[u32; 15],
) -> [u8; INODE_SIZE] {
    let mut data = [0u8; INODE_SIZE];
    data[0x00..0x02].copy_from_slice(&mode.to_le_bytes());
    data[0x04..0x08].copy_from_slice(&size.to_le_bytes());
    data[0x08..0x0C].copy_from_slice(&atime.to_le_bytes());
    data[0x0C..0x10].copy_from_slice(&atime.to_le_bytes()); // ctime
    data[0x10..0x14].copy_from_slice(&atime.to_le_bytes()); // mtime
    data[0x14..0x18].copy_from_slice(&dtime.to_le_bytes());
    let links: u16 = if dtime == 0 { 1 } else { 0 };
    data[0x1A..0x1C].copy_from_slice(&links.to_le_bytes());
    data[0x1C..0x20].copy_from_slice(&sectors.to_le_bytes());
    for (i, p) in ptrs.iter().enumerate() {
        data[0x28 + i * 4..0x2C + i * 4].copy_from_slice(&p.to_le_bytes());
    }
    data
}

pub fn ptrs(direct: &[u32]) -> [u32; 15] {
    let mut out = [0u32; 15];
    out[..direct.len()].copy_from_slice(direct);
    out
}

/// Write one directory entry into a block under construction.
pub fn write_dir_entry(
    buf: &mut [u8],
    offset: usize,
    inode: u32,
    rec_len: usize,
    name: &str,
    file_type: u8,
) {
    buf[offset..offset + 4].copy_from_slice(&inode.to_le_bytes());
    buf[offset + 4..offset + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
    buf[offset + 6] = name.len() as u8;
    buf[offset + 7] = file_type;
    buf[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
}

fn entry_rec_len(name: &str) -> usize {
    (8 + name.len() + 3) & !3
}

/// Build a directory block from a list of entries; the last entry's
/// rec_len extends to the end of the block.
pub fn dir_block(entries: &[(u32, &str, u8)]) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut offset = 0;
    for (i, &(inode, name, ftype)) in entries.iter().enumerate() {
        let rec_len = if i + 1 == entries.len() {
            BLOCK_SIZE - offset
        } else {
            entry_rec_len(name)
        };
        write_dir_entry(&mut buf, offset, inode, rec_len, name, ftype);
        offset += rec_len;
    }
    buf
}

// ---------------------------------------------------------------------
// Journal block builders (big-endian fields).
// ---------------------------------------------------------------------

fn be(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn journal_superblock(maxlen: u32, first: u32, sequence: u32) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    be(&mut buf, 0, JFS_MAGIC);
    be(&mut buf, 4, JFS_SUPERBLOCK_V2);
    be(&mut buf, 8, sequence);
    be(&mut buf, 12, BLOCK_SIZE as u32);
    be(&mut buf, 16, maxlen);
    be(&mut buf, 20, first);
    be(&mut buf, 24, sequence);
    be(&mut buf, 28, first);
    buf
}

/// A descriptor block whose tags are all 8 bytes (SAME_UUID set).
pub fn journal_descriptor(sequence: u32, fs_blocks: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    be(&mut buf, 0, JFS_MAGIC);
    be(&mut buf, 4, JFS_DESCRIPTOR);
    be(&mut buf, 8, sequence);
    let mut offset = 12;
    for (i, &fs_block) in fs_blocks.iter().enumerate() {
        let mut flags = FLAG_SAME_UUID;
        if i + 1 == fs_blocks.len() {
            flags |= FLAG_LAST_TAG;
        }
        be(&mut buf, offset, fs_block);
        be(&mut buf, offset + 4, flags);
        offset += 8;
    }
    buf
}

pub fn journal_commit(sequence: u32) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    be(&mut buf, 0, JFS_MAGIC);
    be(&mut buf, 4, JFS_COMMIT);
    be(&mut buf, 8, sequence);
    buf
}

pub fn journal_revoke(sequence: u32, fs_blocks: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    be(&mut buf, 0, JFS_MAGIC);
    be(&mut buf, 4, JFS_REVOKE);
    be(&mut buf, 8, sequence);
    be(&mut buf, 12, (16 + 4 * fs_blocks.len()) as u32);
    let mut offset = 16;
    for &b in fs_blocks {
        be(&mut buf, offset, b);
        offset += 4;
    }
    buf
}

/// An inode-table block (8 inodes) built from (slot, raw inode) pairs.
pub fn inode_table_block(slots: &[(usize, [u8; INODE_SIZE])]) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    for &(slot, ref raw) in slots {
        buf[slot * INODE_SIZE..(slot + 1) * INODE_SIZE].copy_from_slice(raw);
    }
    buf
}
