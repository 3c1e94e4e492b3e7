//! Select the best historical copy of an inode and stream its data out.

use std::fs;
use std::io::{Read, Seek};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use log::{info, warn};

use crate::inode::{mode_str, Inode};
use crate::journal::JournalIndex;
use crate::resolve::DirectoryTree;
use crate::{Ext3Fs, Result};

/// Restored files land here, mirroring their original paths.
pub const OUTPUT_DIR: &str = "RESTORED_FILES";

/// Where an undeleted inode view came from.
#[derive(Debug, Clone)]
pub enum UndeletedInode {
    /// The on-disk inode is not deleted.
    Live(Inode),
    /// A historical copy from the journal, with its sequence number.
    FromJournal(Inode, u32),
    /// Every candidate was deleted before the `--after` cutoff.
    TooOld,
    NotFound,
}

/// Find an inode view with a zero dtime: the on-disk record if it is
/// live, otherwise the youngest journal copy, scanning in reverse
/// sequence order.
pub fn get_undeleted_inode<T: Read + Seek>(
    fs: &mut Ext3Fs<T>,
    jindex: &JournalIndex,
    ino: u32,
) -> Result<UndeletedInode> {
    let real = fs.get_inode(ino)?;
    if real.dtime() == 0 {
        return Ok(UndeletedInode::Live(real));
    }
    let after = fs.filter.after;
    for (sequence, copy) in jindex.inode_copies(fs, ino)? {
        if copy.dtime() == 0 {
            return Ok(UndeletedInode::FromJournal(copy, sequence));
        }
        if let Some(after) = after {
            if copy.dtime() < after {
                return Ok(UndeletedInode::TooOld);
            }
        }
    }
    Ok(UndeletedInode::NotFound)
}

/// Historical copies of an inode found in the journal, youngest first,
/// de-duplicated on mtime.
pub fn journal_inode_copies<T: Read + Seek>(
    fs: &mut Ext3Fs<T>,
    jindex: &JournalIndex,
    ino: u32,
) -> Result<Vec<(u32, Inode)>> {
    let mut out: Vec<(u32, Inode)> = Vec::new();
    let mut last_mtime = None;
    for (sequence, copy) in jindex.inode_copies(fs, ino)? {
        if last_mtime == Some(copy.i_mtime) {
            continue;
        }
        last_mtime = Some(copy.i_mtime);
        out.push((sequence, copy));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    /// Written, but the inode's indirect blocks were reused or corrupt.
    Partial,
    Skipped,
}

pub struct Restorer<'a, T: Read + Seek> {
    fs: &'a mut Ext3Fs<T>,
    jindex: &'a JournalIndex,
    tree: &'a DirectoryTree,
    output_dir: PathBuf,
}

fn mkdir_mode(mode: u16) -> u32 {
    (mode & 0o7777) as u32
}

impl<'a, T: Read + Seek> Restorer<'a, T> {
    pub fn new(
        fs: &'a mut Ext3Fs<T>,
        jindex: &'a JournalIndex,
        tree: &'a DirectoryTree,
    ) -> Restorer<'a, T> {
        Restorer {
            fs,
            jindex,
            tree,
            output_dir: PathBuf::from(OUTPUT_DIR),
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Make sure the output directory itself exists and is a directory.
    pub fn prepare_output_dir(&self) -> Result<()> {
        if self.output_dir.exists() {
            if !self.output_dir.is_dir() {
                return Err(crate::Ext3Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", self.output_dir.display()),
                )));
            }
            return Ok(());
        }
        fs::create_dir_all(&self.output_dir)?;
        info!("writing output to directory {}", self.output_dir.display());
        Ok(())
    }

    /// Restore everything the resolver reconstructed, in path order.
    /// Per-file failures are reported and the run continues.
    pub fn restore_all(&mut self) -> Result<()> {
        self.prepare_output_dir()?;
        for path in self.tree.all_paths() {
            if path.is_empty() {
                continue;
            }
            if let Err(err) = self.restore_path(&path) {
                warn!("failed to restore {}: {}", path, err);
            }
        }
        Ok(())
    }

    /// Restore one path, relative to the root of the partition (no
    /// leading slash), under the output directory.
    pub fn restore_path(&mut self, path: &str) -> Result<RestoreOutcome> {
        if path.is_empty() || path.starts_with('/') {
            return Err(crate::Ext3Error::NotFound(format!(
                "restore paths are relative to the filesystem root: \"{}\"",
                path
            )));
        }
        self.prepare_output_dir()?;

        let inodenr = match self.tree.path_to_inode.get(path) {
            Some(&ino) => ino,
            None => match self.tree.directories.get(path) {
                Some(dir) => dir.inode,
                None => {
                    info!("cannot find an inode number for file \"{}\"", path);
                    return Ok(RestoreOutcome::Skipped);
                }
            },
        };

        // The parent directory must exist in the output tree first.
        if let Some(slash) = path.rfind('/') {
            let dirname = &path[..slash];
            let parent_out = self.output_dir.join(dirname);
            if !parent_out.exists() {
                self.restore_path(dirname)?;
                fs::create_dir_all(&parent_out)?;
            } else if !parent_out.is_dir() {
                return Err(crate::Ext3Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", parent_out.display()),
                )));
            }
        }

        let out_path = self.output_dir.join(path);
        let real_inode = self.fs.get_inode(inodenr)?;
        if real_inode.is_dir() {
            match fs::create_dir(&out_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            let _ = fs::set_permissions(
                &out_path,
                fs::Permissions::from_mode(mkdir_mode(real_inode.mode())),
            );
            apply_times(&out_path, &real_inode);
            return Ok(RestoreOutcome::Restored);
        }

        let inode = match get_undeleted_inode(self.fs, self.jindex, inodenr)? {
            UndeletedInode::Live(i) => i,
            UndeletedInode::FromJournal(i, sequence) => {
                info!(
                    "restoring {} from journal copy at sequence {}",
                    path, sequence
                );
                i
            }
            UndeletedInode::TooOld => {
                info!(
                    "not undeleting \"{}\": it was deleted before the --after cutoff",
                    path
                );
                return Ok(RestoreOutcome::Skipped);
            }
            UndeletedInode::NotFound => {
                info!("cannot find an undeleted inode for file \"{}\"", path);
                return Ok(RestoreOutcome::Skipped);
            }
        };

        if inode.is_regular_file() {
            if out_path.exists() {
                warn!("not overwriting existing file {}", out_path.display());
                return Ok(RestoreOutcome::Skipped);
            }
            info!("restoring {}", path);
            let (data, reused_or_corrupt) = self.fs.read_file_content(&inode)?;
            fs::write(&out_path, &data)?;
            let _ = fs::set_permissions(
                &out_path,
                fs::Permissions::from_mode(mkdir_mode(inode.mode())),
            );
            apply_times(&out_path, &inode);
            if reused_or_corrupt {
                warn!(
                    "failed to fully restore {}: encountered a reused or corrupt \
                     (double/triple) indirect block",
                    path
                );
                return Ok(RestoreOutcome::Partial);
            }
            return Ok(RestoreOutcome::Restored);
        }

        if inode.is_symlink() {
            let target = self.fs.read_symlink_target(&inode)?;
            if target.is_empty() {
                warn!("failed to recover {}: symlink has zero length", path);
                return Ok(RestoreOutcome::Skipped);
            }
            if out_path.exists() {
                warn!("not overwriting existing file {}", out_path.display());
                return Ok(RestoreOutcome::Skipped);
            }
            std::os::unix::fs::symlink(&target, &out_path)?;
            let atime = FileTime::from_unix_time(inode.i_atime as i64, 0);
            let ctime = FileTime::from_unix_time(inode.i_ctime as i64, 0);
            let _ = filetime::set_symlink_file_times(&out_path, atime, ctime);
            return Ok(RestoreOutcome::Restored);
        }

        warn!(
            "not recovering \"{}\", which is a {}",
            path,
            mode_str(inode.mode())
        );
        Ok(RestoreOutcome::Skipped)
    }
}

fn apply_times(path: &Path, inode: &Inode) {
    let atime = FileTime::from_unix_time(inode.i_atime as i64, 0);
    let ctime = FileTime::from_unix_time(inode.i_ctime as i64, 0);
    if let Err(err) = filetime::set_file_times(path, atime, ctime) {
        warn!(
            "failed to set access and modification time on {}: {}",
            path.display(),
            err
        );
    }
}
