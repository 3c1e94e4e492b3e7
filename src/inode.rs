/// Reference: https://www.kernel.org/doc/html/latest/filesystems/ext4/dynamic.html#index-nodes
use chrono::{TimeZone, Utc};
use prettytable::{Cell, Row, Table};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const EXT3_NDIR_BLOCKS: usize = 12;
pub const EXT3_IND_BLOCK: usize = 12;
pub const EXT3_DIND_BLOCK: usize = 13;
pub const EXT3_TIND_BLOCK: usize = 14;
pub const EXT3_N_BLOCKS: usize = 15;

/// An inline symlink stores at most this many target bytes in the block
/// pointer area.
pub const INLINE_SYMLINK_MAX: usize = EXT3_N_BLOCKS * 4;

const S_IFMT: u16 = 0o170000;
const S_IFSOCK: u16 = 0o140000;
const S_IFLNK: u16 = 0o120000;
const S_IFREG: u16 = 0o100000;
const S_IFBLK: u16 = 0o060000;
const S_IFDIR: u16 = 0o040000;
const S_IFCHR: u16 = 0o020000;
const S_IFIFO: u16 = 0o010000;

/// On-disk inode record, classic 128-byte ext3 layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    pub i_num: u32,
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_atime_h: String,
    pub i_ctime_h: String,
    pub i_mtime_h: String,
    pub i_dtime_h: String,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_block: [u32; EXT3_N_BLOCKS],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_dir_acl: u32,
    pub i_faddr: u32,
    pub l_i_uid_high: u16,
    pub l_i_gid_high: u16,
}

/// Convert an ext-mode (includes file-type bits) into the familiar
/// 10-character string used by `ls -l`, e.g. "-rw-r--r--".
pub fn mode_to_string(mode: u16) -> String {
    const S_ISUID: u16 = 0o4000;
    const S_ISGID: u16 = 0o2000;
    const S_ISVTX: u16 = 0o1000;

    let file_ch = match mode & S_IFMT {
        S_IFSOCK => 's',
        S_IFLNK => 'l',
        S_IFREG => '-',
        S_IFBLK => 'b',
        S_IFDIR => 'd',
        S_IFCHR => 'c',
        S_IFIFO => 'p',
        _ => '?',
    };

    let mut buf = [b'-'; 9];
    if mode & 0o400 != 0 {
        buf[0] = b'r';
    }
    if mode & 0o200 != 0 {
        buf[1] = b'w';
    }
    if mode & 0o100 != 0 {
        buf[2] = b'x';
    }
    if mode & 0o040 != 0 {
        buf[3] = b'r';
    }
    if mode & 0o020 != 0 {
        buf[4] = b'w';
    }
    if mode & 0o010 != 0 {
        buf[5] = b'x';
    }
    if mode & 0o004 != 0 {
        buf[6] = b'r';
    }
    if mode & 0o002 != 0 {
        buf[7] = b'w';
    }
    if mode & 0o001 != 0 {
        buf[8] = b'x';
    }
    if mode & S_ISUID != 0 {
        buf[2] = if buf[2] == b'x' { b's' } else { b'S' };
    }
    if mode & S_ISGID != 0 {
        buf[5] = if buf[5] == b'x' { b's' } else { b'S' };
    }
    if mode & S_ISVTX != 0 {
        buf[8] = if buf[8] == b'x' { b't' } else { b'T' };
    }

    let mut s = String::with_capacity(10);
    s.push(file_ch);
    s.push_str(std::str::from_utf8(&buf).unwrap());
    s
}

/// Human-readable description of the file-type nibble of a mode.
pub fn mode_str(mode: u16) -> &'static str {
    match mode & S_IFMT {
        S_IFIFO => "FIFO",
        S_IFCHR => "character device",
        S_IFDIR => "directory",
        S_IFBLK => "block device",
        S_IFREG => "regular file",
        S_IFLNK => "symbolic link",
        S_IFSOCK => "UNIX socket",
        _ => "*UNKNOWN*",
    }
}

impl Inode {
    pub fn from_bytes(i_num: u32, data: &[u8]) -> Self {
        let le_u16 = |offset: usize| -> u16 {
            u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
        };
        let le_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
        };

        let format_time = |seconds: u32| {
            if seconds == 0 {
                return String::new();
            }
            Utc.timestamp_opt(seconds as i64, 0)
                .single()
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default()
        };

        let i_atime = le_u32(0x08);
        let i_ctime = le_u32(0x0C);
        let i_mtime = le_u32(0x10);
        let i_dtime = le_u32(0x14);

        let mut i_block = [0u32; EXT3_N_BLOCKS];
        for (i, slot) in i_block.iter_mut().enumerate() {
            *slot = le_u32(0x28 + i * 4);
        }

        Inode {
            i_num,
            i_mode: le_u16(0x00),
            i_uid: le_u16(0x02),
            i_size: le_u32(0x04),
            i_atime,
            i_ctime,
            i_mtime,
            i_dtime,
            i_atime_h: format_time(i_atime),
            i_ctime_h: format_time(i_ctime),
            i_mtime_h: format_time(i_mtime),
            i_dtime_h: format_time(i_dtime),
            i_gid: le_u16(0x18),
            i_links_count: le_u16(0x1A),
            i_blocks: le_u32(0x1C),
            i_flags: le_u32(0x20),
            i_block,
            i_generation: le_u32(0x64),
            i_file_acl: le_u32(0x68),
            i_dir_acl: le_u32(0x6C),
            i_faddr: le_u32(0x70),
            l_i_uid_high: le_u16(0x78),
            l_i_gid_high: le_u16(0x7A),
        }
    }

    pub fn mode(&self) -> u16 {
        self.i_mode
    }

    /// File size in bytes. For regular files `i_dir_acl` doubles as the
    /// high 32 bits.
    pub fn size(&self) -> u64 {
        if self.is_regular_file() {
            ((self.i_dir_acl as u64) << 32) | (self.i_size as u64)
        } else {
            self.i_size as u64
        }
    }

    /// Number of 512-byte sectors attributed to this inode.
    pub fn blocks(&self) -> u32 {
        self.i_blocks
    }

    pub fn dtime(&self) -> u32 {
        self.i_dtime
    }

    /// An inode with a non-zero dtime describes a deleted object.
    pub fn is_deleted(&self) -> bool {
        self.i_dtime != 0
    }

    pub fn is_dir(&self) -> bool {
        (self.i_mode & S_IFMT) == S_IFDIR
    }

    pub fn is_regular_file(&self) -> bool {
        (self.i_mode & S_IFMT) == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        (self.i_mode & S_IFMT) == S_IFLNK
    }

    /// True when the symlink target lives in the block pointer area rather
    /// than in a data block. Must be checked before enumerating blocks.
    pub fn has_inline_symlink_target(&self) -> bool {
        self.is_symlink() && self.i_blocks == 0
    }

    /// The inline symlink target, when there is one.
    pub fn inline_symlink_target(&self) -> Option<String> {
        if !self.has_inline_symlink_target() {
            return None;
        }
        let len = (self.size() as usize).min(INLINE_SYMLINK_MAX);
        let mut raw = Vec::with_capacity(len);
        'outer: for slot in &self.i_block {
            for byte in slot.to_le_bytes() {
                raw.push(byte);
                if raw.len() == len {
                    break 'outer;
                }
            }
        }
        Some(String::from_utf8_lossy(&raw).to_string())
    }

    pub fn block_pointers(&self) -> &[u32; EXT3_N_BLOCKS] {
        &self.i_block
    }

    /// Effective UID, combining low/high halves.
    pub fn uid(&self) -> u32 {
        ((self.l_i_uid_high as u32) << 16) | (self.i_uid as u32)
    }

    /// Effective GID, combining low/high halves.
    pub fn gid(&self) -> u32 {
        ((self.l_i_gid_high as u32) << 16) | (self.i_gid as u32)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Tabular representation using prettytable.
    pub fn to_table(&self) -> String {
        let mut inode_table = Table::new();
        inode_table.add_row(Row::new(vec![
            Cell::new("Inode"),
            Cell::new(&format!("{}", self.i_num)),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("Mode"),
            Cell::new(&mode_to_string(self.i_mode)),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("uid / gid"),
            Cell::new(&format!("{} / {}", self.uid(), self.gid())),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("Size"),
            Cell::new(&format!("{}", self.size())),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("Links Count"),
            Cell::new(&format!("{}", self.i_links_count)),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("Sectors"),
            Cell::new(&format!("{}", self.i_blocks)),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("Accessed"),
            Cell::new(&self.i_atime_h),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("File Modified"),
            Cell::new(&self.i_mtime_h),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("Inode Modified"),
            Cell::new(&self.i_ctime_h),
        ]));
        inode_table.add_row(Row::new(vec![
            Cell::new("Deletion time"),
            Cell::new(if self.i_dtime == 0 {
                "0"
            } else {
                self.i_dtime_h.as_str()
            }),
        ]));
        if self.has_inline_symlink_target() {
            inode_table.add_row(Row::new(vec![
                Cell::new("Symlink target"),
                Cell::new(&self.inline_symlink_target().unwrap_or_default()),
            ]));
        } else {
            inode_table.add_row(Row::new(vec![
                Cell::new("Block Pointers"),
                Cell::new(&format!("{:?}", self.block_pointers())),
            ]));
        }
        inode_table.add_row(Row::new(vec![
            Cell::new("Generation"),
            Cell::new(&format!("0x{:x}", self.i_generation)),
        ]));
        inode_table.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn raw_inode(mode: u16, size: u32, dtime: u32, blocks: u32) -> Vec<u8> {
        let mut data = vec![0u8; 128];
        data[0x00..0x02].copy_from_slice(&mode.to_le_bytes());
        data[0x04..0x08].copy_from_slice(&size.to_le_bytes());
        data[0x08..0x0C].copy_from_slice(&1_200_000_000u32.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&dtime.to_le_bytes());
        data[0x1A..0x1C].copy_from_slice(&1u16.to_le_bytes());
        data[0x1C..0x20].copy_from_slice(&blocks.to_le_bytes());
        data
    }

    #[test]
    fn parses_classic_fields() {
        let mut data = raw_inode(0o100644, 4096, 0, 8);
        data[0x28..0x2C].copy_from_slice(&21u32.to_le_bytes());
        let ino = Inode::from_bytes(11, &data);
        assert!(ino.is_regular_file());
        assert!(!ino.is_deleted());
        assert_eq!(ino.size(), 4096);
        assert_eq!(ino.block_pointers()[0], 21);
        assert_eq!(ino.i_links_count, 1);
    }

    #[test]
    fn deleted_inode_has_dtime() {
        let data = raw_inode(0o100644, 0, 1_200_000_500, 0);
        let ino = Inode::from_bytes(12, &data);
        assert!(ino.is_deleted());
        assert_eq!(ino.dtime(), 1_200_000_500);
    }

    #[test]
    fn inline_symlink_target_lives_in_pointer_area() {
        let mut data = raw_inode(0o120777, 11, 0, 0);
        data[0x28..0x28 + 11].copy_from_slice(b"target/path");
        let ino = Inode::from_bytes(13, &data);
        assert!(ino.has_inline_symlink_target());
        assert_eq!(ino.inline_symlink_target().unwrap(), "target/path");
    }

    #[test]
    fn symlink_with_blocks_is_not_inline() {
        let data = raw_inode(0o120777, 200, 0, 2);
        let ino = Inode::from_bytes(14, &data);
        assert!(ino.is_symlink());
        assert!(!ino.has_inline_symlink_target());
        assert!(ino.inline_symlink_target().is_none());
    }

    #[test]
    fn mode_string_matches_ls() {
        assert_eq!(mode_to_string(0o100644), "-rw-r--r--");
        assert_eq!(mode_to_string(0o040755), "drwxr-xr-x");
        assert_eq!(mode_to_string(0o120777), "lrwxrwxrwx");
    }
}
