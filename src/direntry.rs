use std::collections::BTreeSet;
use std::io::{Read, Seek};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{Ext3Fs, Result};

pub const EXT3_FT_UNKNOWN: u8 = 0;
pub const EXT3_FT_REG_FILE: u8 = 1;
pub const EXT3_FT_DIR: u8 = 2;
pub const EXT3_FT_CHRDEV: u8 = 3;
pub const EXT3_FT_BLKDEV: u8 = 4;
pub const EXT3_FT_FIFO: u8 = 5;
pub const EXT3_FT_SOCK: u8 = 6;
pub const EXT3_FT_SYMLINK: u8 = 7;
pub const EXT3_FT_MAX: u8 = 8;

/// Directory entries are padded to 4-byte boundaries.
pub const EXT3_DIR_PAD: usize = 4;

/// On-disk record length for a name of `name_len` bytes.
pub fn rec_len_for(name_len: usize) -> usize {
    (8 + name_len + EXT3_DIR_PAD - 1) & !(EXT3_DIR_PAD - 1)
}

/// Mode nibble implied by a directory entry's file-type hint. Returned as
/// u32 so that the unknown type can never match a real mode.
pub fn mode_for_file_type(file_type: u8) -> u32 {
    match file_type & 7 {
        EXT3_FT_REG_FILE => 0x8000,
        EXT3_FT_DIR => 0x4000,
        EXT3_FT_CHRDEV => 0x2000,
        EXT3_FT_BLKDEV => 0x6000,
        EXT3_FT_FIFO => 0x1000,
        EXT3_FT_SOCK => 0xC000,
        EXT3_FT_SYMLINK => 0xA000,
        _ => 0x10000,
    }
}

/// One-letter file type used by the `ls`-style listing.
pub fn file_type_char(file_type: u8) -> char {
    match file_type & 7 {
        EXT3_FT_REG_FILE => 'r',
        EXT3_FT_DIR => 'd',
        EXT3_FT_CHRDEV => 'c',
        EXT3_FT_BLKDEV => 'b',
        EXT3_FT_FIFO => 'p',
        EXT3_FT_SOCK => 's',
        EXT3_FT_SYMLINK => 'l',
        _ => '?',
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirBlockKind {
    /// Not a directory block.
    No,
    /// First block of a directory: leads with `.` and `..`.
    Start,
    /// A directory block without the leading `.`/`..`; its owner is not
    /// determinable from the block alone.
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharKind {
    Ok,
    Illegal,
    Unlikely,
}

fn filename_char_kind(c: u8) -> CharKind {
    if c < 32 || c > 126 || c == b'/' {
        CharKind::Illegal
    } else if matches!(c, b'"' | b'*' | b';' | b'<' | b'>' | b'?' | b'\\' | b'`' | b'|') {
        CharKind::Unlikely
    } else {
        CharKind::Ok
    }
}

/// A raw view of one entry inside a directory block buffer.
struct RawEntry<'a> {
    inode: u32,
    rec_len: usize,
    name_len: usize,
    file_type: u8,
    name: &'a [u8],
}

fn raw_entry_at(buf: &[u8], offset: usize) -> Option<RawEntry<'_>> {
    if offset + 8 > buf.len() {
        return None;
    }
    let inode = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
    let rec_len = u16::from_le_bytes(buf[offset + 4..offset + 6].try_into().unwrap()) as usize;
    let name_len = buf[offset + 6] as usize;
    let file_type = buf[offset + 7];
    let name_end = (offset + 8 + name_len).min(buf.len());
    Some(RawEntry {
        inode,
        rec_len,
        name_len,
        file_type,
        name: &buf[offset + 8..name_end],
    })
}

/// Heuristic directory-block detection, bound to the filesystem geometry
/// and the user's filename allow-list.
pub struct DirClassifier<'a> {
    pub block_size: usize,
    pub inode_count: u32,
    pub accepted: &'a BTreeSet<String>,
}

impl DirClassifier<'_> {
    /// Decide whether `block` holds a chain of directory entries starting
    /// at `offset` that reaches exactly the block boundary.
    ///
    /// `certainly_linked` marks a chain reached by walking live rec_len
    /// links; zero-inode entries inside such a chain draw a warning but do
    /// not reject the block.
    pub fn classify(
        &self,
        block: &[u8],
        blocknr: u32,
        start_required: bool,
        certainly_linked: bool,
        offset: usize,
    ) -> DirBlockKind {
        let bs = self.block_size.min(block.len());

        // The first block of a directory leads with "." and "..".
        let mut is_start = false;
        if offset == 0 {
            if let (Some(dot), Some(dotdot)) = (raw_entry_at(block, 0), raw_entry_at(block, 12)) {
                is_start = dot.name_len == 1
                    && dot.name.first() == Some(&b'.')
                    && dot.rec_len == rec_len_for(1)
                    && dot.file_type == EXT3_FT_DIR
                    && dotdot.name_len == 2
                    && dotdot.name.starts_with(b"..")
                    && dotdot.file_type == EXT3_FT_DIR;
            }
        }
        if start_required && !is_start {
            return DirBlockKind::No;
        }

        let mut delayed_warnings: Vec<String> = Vec::new();
        let mut off = offset;
        loop {
            if off & (EXT3_DIR_PAD - 1) != 0 {
                return DirBlockKind::No;
            }
            if off + rec_len_for(1) > bs {
                return DirBlockKind::No;
            }
            let entry = match raw_entry_at(block, off) {
                Some(e) => e,
                None => return DirBlockKind::No,
            };

            // The inode of a deleted entry is zeroed but the name survives;
            // tolerate that, warn only inside the leading live chain.
            if entry.inode == 0 && entry.name_len > 0 {
                if entry
                    .name
                    .iter()
                    .any(|&c| filename_char_kind(c) == CharKind::Illegal)
                {
                    return DirBlockKind::No;
                }
                if certainly_linked && (off != 0 || start_required) {
                    delayed_warnings.push(format!(
                        "zero inode (name: \"{}\"; block: {}; offset 0x{:x})",
                        String::from_utf8_lossy(entry.name),
                        blocknr,
                        off
                    ));
                }
            }
            if entry.inode > self.inode_count {
                return DirBlockKind::No;
            }
            if entry.name_len == 0 {
                return DirBlockKind::No;
            }
            if entry.rec_len & (EXT3_DIR_PAD - 1) != 0
                || entry.rec_len < rec_len_for(entry.name_len)
                || off + entry.rec_len > bs
            {
                return DirBlockKind::No;
            }
            // Extra paranoia when the whole block is a single entry.
            if entry.rec_len == bs
                && (entry.file_type == EXT3_FT_UNKNOWN
                    || entry.file_type >= EXT3_FT_MAX
                    || entry.name_len == 1
                    || entry.name.starts_with(b"_Z"))
            {
                return DirBlockKind::No;
            }

            // The file name may only exist of certain characters.
            let mut unlikely = false;
            for (i, &c) in entry.name.iter().enumerate() {
                match filename_char_kind(c) {
                    CharKind::Ok => {}
                    CharKind::Illegal => return DirBlockKind::No,
                    CharKind::Unlikely => {
                        // Google Earth leaves files ending on '&nbsp;'.
                        if i + 1 == entry.name_len
                            && entry.name_len > 6
                            && entry.name.ends_with(b"&nbsp;")
                        {
                            continue;
                        }
                        unlikely = true;
                    }
                }
            }
            if unlikely {
                let name = String::from_utf8_lossy(entry.name).to_string();
                if !self.accepted.contains(&name) {
                    warn!(
                        "rejecting possible directory (block {}) because an entry contains \
                         legal but unlikely characters: '{}'. If this looks like a filename, \
                         pass --accept='{}'.",
                        blocknr, name, name
                    );
                    return DirBlockKind::No;
                }
            }

            off += entry.rec_len;
            if off == bs {
                break;
            }
        }

        for w in delayed_warnings {
            warn!("{}", w);
        }
        if is_start {
            DirBlockKind::Start
        } else {
            DirBlockKind::Extended
        }
    }
}

/// Flags attached to each decoded directory entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlags {
    /// The entry was unlinked, or its inode carries a dtime.
    pub deleted: bool,
    /// The inode bit is set in the inode bitmap.
    pub allocated: bool,
    /// The inode was reused by an incompatible object since this entry was
    /// written.
    pub reallocated: bool,
    pub zero_inode: bool,
    /// Reached through the live rec_len chain.
    pub linked: bool,
    /// Excluded by the current filter settings.
    pub filtered: bool,
}

/// A decoded directory entry, owned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: String,
    /// Byte offset of this entry inside its block; used for ordering and
    /// exact-equality comparison.
    pub offset: u16,
    pub flags: EntryFlags,
}

impl DirEntry {
    pub fn is_dot(&self) -> bool {
        self.name == "."
    }

    pub fn is_dotdot(&self) -> bool {
        self.name == ".."
    }
}

/// A decoded directory block: the live entry chain plus entries that were
/// deleted but not yet overwritten, reconstructed from the block tail.
#[derive(Debug, Clone)]
pub struct DirectoryBlock {
    pub block: u32,
    pub entries: Vec<DirEntry>,
}

impl DirectoryBlock {
    /// Two blocks are exactly equal when they decode to the same entry
    /// list, position for position.
    pub fn exactly_equal(&self, other: &DirectoryBlock) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().zip(&other.entries).all(|(a, b)| {
                a.offset == b.offset
                    && a.inode == b.inode
                    && a.name == b.name
                    && a.file_type == b.file_type
            })
    }

    /// Inode of the leading "." entry, when this is a start block.
    pub fn dot_inode(&self) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.offset == 0 && e.is_dot())
            .map(|e| e.inode)
    }

    /// Inode of the ".." entry, when present.
    pub fn dotdot_inode(&self) -> Option<u32> {
        self.entries.iter().find(|e| e.is_dotdot()).map(|e| e.inode)
    }
}

/// The set of directory blocks owned by one directory inode. The first
/// block is the canonical start block chosen by the resolver.
#[derive(Debug, Clone)]
pub struct Directory {
    pub inode: u32,
    pub blocks: Vec<DirectoryBlock>,
}

impl Directory {
    pub fn first_block(&self) -> Option<u32> {
        self.blocks.first().map(|b| b.block)
    }
}

impl<T: Read + Seek> Ext3Fs<T> {
    /// Decode the directory block at `block`, reconstructing tail-deleted
    /// entries and computing per-entry flags against the current filter.
    pub fn read_directory_block(&mut self, block: u32) -> Result<DirectoryBlock> {
        let buf = self.read_block(block)?;
        self.decode_directory_block(&buf, block)
    }

    pub fn decode_directory_block(&mut self, buf: &[u8], blocknr: u32) -> Result<DirectoryBlock> {
        let bs = self.superblock.block_size();
        let mut entries: Vec<DirEntry> = Vec::new();
        let mut live = vec![false; bs / EXT3_DIR_PAD];

        // Walk the live rec_len chain first.
        let mut offset = 0usize;
        while offset + 8 <= bs {
            let raw = match raw_entry_at(buf, offset) {
                Some(r) => r,
                None => break,
            };
            if raw.rec_len == 0
                || raw.rec_len & (EXT3_DIR_PAD - 1) != 0
                || offset + raw.rec_len > bs
            {
                break;
            }
            live[offset / EXT3_DIR_PAD] = true;
            let flags = self.entry_flags(raw.inode, raw.file_type, false, true)?;
            entries.push(DirEntry {
                inode: raw.inode,
                rec_len: raw.rec_len as u16,
                file_type: raw.file_type,
                name: String::from_utf8_lossy(raw.name).to_string(),
                offset: offset as u16,
                flags,
            });
            offset += raw.rec_len;
        }

        // Search the tail for deleted entries that were not overwritten.
        let mut deleted_offsets = Vec::new();
        {
            let classifier = self.dir_classifier();
            let mut offset = bs - rec_len_for(1);
            while offset > 0 {
                if !live[offset / EXT3_DIR_PAD]
                    && classifier.classify(buf, blocknr, false, false, offset) != DirBlockKind::No
                {
                    deleted_offsets.push(offset);
                }
                offset -= EXT3_DIR_PAD;
            }
        }
        for offset in deleted_offsets {
            if let Some(raw) = raw_entry_at(buf, offset) {
                let flags = self.entry_flags(raw.inode, raw.file_type, true, false)?;
                entries.push(DirEntry {
                    inode: raw.inode,
                    rec_len: raw.rec_len as u16,
                    file_type: raw.file_type,
                    name: String::from_utf8_lossy(raw.name).to_string(),
                    offset: offset as u16,
                    flags,
                });
            }
        }

        entries.sort_by_key(|e| e.offset);
        Ok(DirectoryBlock {
            block: blocknr,
            entries,
        })
    }

    /// Per-entry bookkeeping: allocation state, reallocation detection,
    /// deletion state and filter evaluation.
    fn entry_flags(
        &mut self,
        entry_inode: u32,
        file_type: u8,
        deleted_entry: bool,
        linked: bool,
    ) -> Result<EntryFlags> {
        let zero_inode = entry_inode == 0;
        if zero_inode {
            return Ok(EntryFlags {
                deleted: deleted_entry,
                allocated: false,
                reallocated: false,
                zero_inode: true,
                linked,
                filtered: !self.filter.zeroed_inodes,
            });
        }
        if entry_inode > self.superblock.inodes_count() {
            warn!(
                "directory entry references inode {} beyond the inode count",
                entry_inode
            );
            return Ok(EntryFlags {
                deleted: deleted_entry,
                allocated: false,
                reallocated: true,
                zero_inode: false,
                linked,
                filtered: true,
            });
        }

        let inode = self.get_inode(entry_inode)?;
        let allocated = self.is_inode_allocated(entry_inode)?;
        let reallocated = (deleted_entry && allocated)
            || (deleted_entry && inode.dtime() == 0)
            || (mode_for_file_type(file_type) != (inode.mode() & 0xf000) as u32);
        let deleted = deleted_entry || inode.dtime() != 0;
        self.warn_nonzero_block_list(&inode);

        let f = &self.filter;
        let dtime = inode.dtime();
        let time_ok = reallocated
            || (dtime == 0 && !f.deleted)
            || (f.after.map_or(true, |a| a <= dtime)
                && f.before.map_or(true, |b| dtime < b));
        let filtered = !((!f.allocated || allocated)
            && (!f.unallocated || !allocated)
            && (!f.deleted || deleted)
            && (!f.directory || (file_type & 7) == EXT3_FT_DIR)
            && (!reallocated || f.reallocated)
            && time_ok);

        Ok(EntryFlags {
            deleted,
            allocated,
            reallocated,
            zero_inode: false,
            linked,
            filtered,
        })
    }
}
