/// Reference: https://www.kernel.org/doc/html/latest/filesystems/ext4/globals.html#super-block
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{Ext3Error, Result};

pub const EXT3_MAGIC: u16 = 0xEF53;
pub const EXT3_CREATOR_LINUX: u32 = 0;
pub const SUPERBLOCK_OFFSET: u64 = 1024;

const EXT3_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x4;

mod byte_array_64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8; 64], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        data.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<[u8; 64], D::Error> {
        let vec = Vec::<u8>::deserialize(deserializer)?;
        let array: [u8; 64] = vec
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"an array of length 64"))?;
        Ok(array)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_log_frag_size: u32,
    pub s_blocks_per_group: u32,
    pub s_frags_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    #[serde(with = "byte_array_64")]
    pub s_last_mounted: [u8; 64],
    pub s_journal_uuid: [u8; 16],
    pub s_journal_inum: u32,
    pub s_journal_dev: u32,
    pub s_last_orphan: u32,
}

impl Superblock {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 0x400 {
            return Err(Ext3Error::Unsupported(
                "not enough bytes to parse the superblock".to_string(),
            ));
        }
        let le_u16 = |offset: usize| -> u16 {
            u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
        };
        let le_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
        };

        let s_magic = le_u16(0x38);
        if s_magic != EXT3_MAGIC {
            return Err(Ext3Error::Unsupported(format!(
                "bad superblock magic 0x{:04x} (expected 0x{:04x})",
                s_magic, EXT3_MAGIC
            )));
        }
        let s_creator_os = le_u32(0x48);
        if s_creator_os != EXT3_CREATOR_LINUX {
            return Err(Ext3Error::Unsupported(format!(
                "creator OS {} is not Linux",
                s_creator_os
            )));
        }

        let s_rev_level = le_u32(0x4C);
        // Revision 0 has a fixed 128-byte inode and no s_inode_size field.
        let s_inode_size = if s_rev_level == 0 { 128 } else { le_u16(0x58) };

        Ok(Self {
            s_inodes_count: le_u32(0x00),
            s_blocks_count: le_u32(0x04),
            s_r_blocks_count: le_u32(0x08),
            s_free_blocks_count: le_u32(0x0C),
            s_free_inodes_count: le_u32(0x10),
            s_first_data_block: le_u32(0x14),
            s_log_block_size: le_u32(0x18),
            s_log_frag_size: le_u32(0x1C),
            s_blocks_per_group: le_u32(0x20),
            s_frags_per_group: le_u32(0x24),
            s_inodes_per_group: le_u32(0x28),
            s_mtime: le_u32(0x2C),
            s_wtime: le_u32(0x30),
            s_mnt_count: le_u16(0x34),
            s_max_mnt_count: le_u16(0x36),
            s_magic,
            s_state: le_u16(0x3A),
            s_errors: le_u16(0x3C),
            s_minor_rev_level: le_u16(0x3E),
            s_lastcheck: le_u32(0x40),
            s_checkinterval: le_u32(0x44),
            s_creator_os,
            s_rev_level,
            s_def_resuid: le_u16(0x50),
            s_def_resgid: le_u16(0x52),
            s_first_ino: le_u32(0x54),
            s_inode_size,
            s_block_group_nr: le_u16(0x5A),
            s_feature_compat: le_u32(0x5C),
            s_feature_incompat: le_u32(0x60),
            s_feature_ro_compat: le_u32(0x64),
            s_uuid: data[0x68..0x78].try_into().unwrap(),
            s_volume_name: data[0x78..0x88].try_into().unwrap(),
            s_last_mounted: data[0x88..0xC8].try_into().unwrap(),
            s_journal_uuid: data[0xD0..0xE0].try_into().unwrap(),
            s_journal_inum: le_u32(0xE0),
            s_journal_dev: le_u32(0xE4),
            s_last_orphan: le_u32(0xE8),
        })
    }

    pub fn block_size(&self) -> usize {
        1024usize << self.s_log_block_size
    }

    /// extX does not support fragments, so this equals `block_size` on a
    /// sane filesystem.
    pub fn frag_size(&self) -> usize {
        1024usize << self.s_log_frag_size
    }

    pub fn blocks_count(&self) -> u32 {
        self.s_blocks_count
    }

    pub fn inodes_count(&self) -> u32 {
        self.s_inodes_count
    }

    pub fn first_data_block(&self) -> u32 {
        self.s_first_data_block
    }

    pub fn blocks_per_group(&self) -> u32 {
        self.s_blocks_per_group
    }

    pub fn inodes_per_group(&self) -> usize {
        self.s_inodes_per_group as usize
    }

    pub fn inode_size(&self) -> usize {
        self.s_inode_size as usize
    }

    pub fn groups(&self) -> usize {
        (self.s_inodes_count / self.s_inodes_per_group) as usize
    }

    /// Blocks occupied by one group's inode table.
    pub fn inode_blocks_per_group(&self) -> usize {
        self.inodes_per_group() * self.inode_size() / self.block_size()
    }

    pub fn has_journal(&self) -> bool {
        (self.s_feature_compat & EXT3_FEATURE_COMPAT_HAS_JOURNAL) != 0
    }

    pub fn journal_inum(&self) -> u32 {
        self.s_journal_inum
    }

    pub fn has_external_journal(&self) -> bool {
        self.s_journal_dev != 0
    }

    pub fn print_sp_info(&self) {
        println!("{:#?}", self);
    }

    pub fn to_json(&self) -> Value {
        json!({
            "inodes_count": self.s_inodes_count,
            "blocks_count": self.s_blocks_count,
            "free_blocks_count": self.s_free_blocks_count,
            "free_inodes_count": self.s_free_inodes_count,
            "first_data_block": self.s_first_data_block,
            "log_block_size": self.s_log_block_size,
            "blocks_per_group": self.s_blocks_per_group,
            "inodes_per_group": self.s_inodes_per_group,
            "inode_size": self.s_inode_size,
            "magic": format!("0x{:04x}", self.s_magic),
            "state": self.s_state,
            "journal_inum": self.s_journal_inum,
            "journal_dev": self.s_journal_dev,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_superblock_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 0x400];
        data[0x00..0x04].copy_from_slice(&64u32.to_le_bytes());
        data[0x04..0x08].copy_from_slice(&128u32.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        data[0x20..0x24].copy_from_slice(&128u32.to_le_bytes());
        data[0x28..0x2C].copy_from_slice(&64u32.to_le_bytes());
        data[0x38..0x3A].copy_from_slice(&EXT3_MAGIC.to_le_bytes());
        data[0x4C..0x50].copy_from_slice(&1u32.to_le_bytes());
        data[0x58..0x5A].copy_from_slice(&128u16.to_le_bytes());
        data[0xE0..0xE4].copy_from_slice(&8u32.to_le_bytes());
        data
    }

    #[test]
    fn parses_geometry() {
        let sb = Superblock::from_bytes(&minimal_superblock_bytes()).unwrap();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.frag_size(), 1024);
        assert_eq!(sb.inodes_per_group(), 64);
        assert_eq!(sb.inode_size(), 128);
        assert_eq!(sb.groups(), 1);
        assert_eq!(sb.inode_blocks_per_group(), 8);
        assert_eq!(sb.journal_inum(), 8);
        assert!(!sb.has_external_journal());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = minimal_superblock_bytes();
        data[0x38] = 0x00;
        assert!(Superblock::from_bytes(&data).is_err());
    }

    #[test]
    fn rejects_non_linux_creator() {
        let mut data = minimal_superblock_bytes();
        data[0x48] = 3;
        assert!(Superblock::from_bytes(&data).is_err());
    }
}
