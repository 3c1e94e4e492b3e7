//! Two-stage directory reconstruction.
//!
//! Stage 1 scans every block of every group for directory blocks. Stage 2
//! picks exactly one canonical block per directory inode, infers owners
//! for extended blocks, and assembles the path tree starting from the root
//! inode. Both stage results are persistable as text caches keyed by the
//! image's basename.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::direntry::{DirBlockKind, Directory, DirectoryBlock, EXT3_FT_DIR};
use crate::journal::JournalIndex;
use crate::{Ext3Error, Ext3Fs, Result};

/// Hooks into an external locate-style name database, consulted when the
/// reconstruction alone cannot decide. The defaults know nothing.
pub trait LocateDb {
    /// Whether `path` is known to have existed on the original system.
    fn path_exists(&self, _path: &str) -> bool {
        false
    }

    /// Guess the directory that contained a block holding `filenames`.
    fn parent_directory(&self, _block: u32, _filenames: &BTreeSet<String>) -> Option<String> {
        None
    }
}

/// The default collaborator: no external knowledge.
pub struct NoLocateDb;

impl LocateDb for NoLocateDb {}

/// A locate database fed from a text file of known paths, one per line,
/// relative to the filesystem root (a leading `/` is stripped). Every
/// ancestor of a listed path is known implicitly.
pub struct PathListDb {
    paths: BTreeSet<String>,
    /// Directory path -> names of its known children.
    children: BTreeMap<String, BTreeSet<String>>,
}

impl PathListDb {
    pub fn from_file(path: &Path) -> Result<PathListDb> {
        let mut db = PathListDb {
            paths: BTreeSet::new(),
            children: BTreeMap::new(),
        };
        for line in BufReader::new(File::open(path)?).lines() {
            let line = line?;
            let line = line.trim().trim_start_matches('/');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            db.insert(line);
        }
        Ok(db)
    }

    fn insert(&mut self, path: &str) {
        let mut parent = "";
        for (i, _) in path.match_indices('/') {
            self.paths.insert(path[..i].to_string());
            self.children
                .entry(parent.to_string())
                .or_default()
                .insert(path[parent.len()..i].trim_start_matches('/').to_string());
            parent = &path[..i];
        }
        self.paths.insert(path.to_string());
        self.children
            .entry(parent.to_string())
            .or_default()
            .insert(path[parent.len()..].trim_start_matches('/').to_string());
    }
}

impl LocateDb for PathListDb {
    fn path_exists(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// The known directory whose children cover the most of `filenames`;
    /// a tie between directories decides nothing.
    fn parent_directory(&self, _block: u32, filenames: &BTreeSet<String>) -> Option<String> {
        let mut best: Option<(&String, usize)> = None;
        let mut tied = false;
        for (dir, children) in &self.children {
            let count = filenames.iter().filter(|n| children.contains(*n)).count();
            if count == 0 {
                continue;
            }
            match best {
                Some((_, c)) if count < c => {}
                Some((_, c)) if count == c => tied = true,
                _ => {
                    best = Some((dir, count));
                    tied = false;
                }
            }
        }
        if tied {
            return None;
        }
        best.map(|(dir, _)| dir.clone())
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn cache_file(device_name: &str, suffix: &str) -> PathBuf {
    let base = Path::new(device_name)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| device_name.to_string());
    PathBuf::from(format!("{}.{}", base, suffix))
}

/// Result of the stage-1 whole-device scan: start blocks grouped by the
/// inode their `.` entry names, and extended blocks of unknown ownership.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stage1Scan {
    pub dir_inode_to_blocks: BTreeMap<u32, Vec<u32>>,
    pub extended_blocks: Vec<u32>,
}

impl Stage1Scan {
    /// Scan every block of every group. Journal blocks are included; the
    /// resolver prunes them later with better information.
    pub fn run<T: Read + Seek>(fs: &mut Ext3Fs<T>) -> Result<Stage1Scan> {
        let mut scan = Stage1Scan::default();
        info!("finding all blocks that might be directories");
        let groups = fs.superblock.groups();
        for group in 0..groups {
            info!("searching group {}", group);
            let first = fs.group_to_block(group);
            let last = (first + fs.superblock.blocks_per_group()).min(fs.superblock.blocks_count());
            for block in first..last {
                let buf = fs.read_block(block)?;
                let kind = fs.dir_classifier().classify(&buf, block, false, true, 0);
                match kind {
                    DirBlockKind::Start => {
                        // The "." entry of a wiped start block can itself
                        // carry a zero inode; such a block has no usable key.
                        let dot_inode =
                            u32::from_le_bytes(buf[0..4].try_into().unwrap());
                        if dot_inode == 0 {
                            warn!("start block {} has a zero '.' inode", block);
                            continue;
                        }
                        scan.dir_inode_to_blocks
                            .entry(dot_inode)
                            .or_default()
                            .push(block);
                    }
                    DirBlockKind::Extended => scan.extended_blocks.push(block),
                    DirBlockKind::No => {}
                }
            }
        }
        Ok(scan)
    }

    pub fn cache_path(device_name: &str) -> PathBuf {
        cache_file(device_name, "stage1")
    }

    /// Load the stage-1 cache if present, otherwise scan and write it.
    pub fn load_or_run<T: Read + Seek>(
        fs: &mut Ext3Fs<T>,
        device_name: &str,
    ) -> Result<Stage1Scan> {
        let path = Self::cache_path(device_name);
        if path.exists() {
            info!("loading {}", path.display());
            return Self::load(&path);
        }
        let scan = Self::run(fs)?;
        info!("writing analysis so far to '{}'", path.display());
        scan.save(&path, device_name)?;
        Ok(scan)
    }

    pub fn save(&self, path: &Path, device_name: &str) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# Stage 1 data for {}.", device_name)?;
        writeln!(
            out,
            "# Inodes and directory start blocks that use it for dir entry '.'."
        )?;
        writeln!(out, "# INODE : BLOCK [BLOCK ...]")?;
        for (inode, blocks) in &self.dir_inode_to_blocks {
            write!(out, "{} :", inode)?;
            for b in blocks {
                write!(out, " {}", b)?;
            }
            writeln!(out)?;
        }
        writeln!(out, "# Extended directory blocks.")?;
        for b in &self.extended_blocks {
            writeln!(out, "{}", b)?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Stage1Scan> {
        let bad = |detail: &str| Ext3Error::Cache {
            path: path.display().to_string(),
            detail: detail.to_string(),
        };
        let mut scan = Stage1Scan::default();
        for line in BufReader::new(File::open(path)?).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((inode_str, blocks_str)) = line.split_once(':') {
                let inode: u32 = inode_str
                    .trim()
                    .parse()
                    .map_err(|_| bad("bad inode number"))?;
                let mut blocks = Vec::new();
                for tok in blocks_str.split_whitespace() {
                    blocks.push(tok.parse().map_err(|_| bad("bad block number"))?);
                }
                scan.dir_inode_to_blocks.insert(inode, blocks);
            } else {
                scan.extended_blocks
                    .push(line.parse().map_err(|_| bad("bad extended block"))?);
            }
        }
        Ok(scan)
    }
}

/// The resolver's output: one canonical directory per inode, every
/// reconstructed path, and the file-path map used by the restorer.
#[derive(Default)]
pub struct DirectoryTree {
    /// Path string -> directory. The root is the empty path.
    pub directories: BTreeMap<String, Directory>,
    pub inode_to_path: BTreeMap<u32, String>,
    /// Non-directory paths -> the inode seen at the youngest journal
    /// sequence for that name slot.
    pub path_to_inode: BTreeMap<String, u32>,
    /// Candidate blocks per inode after disambiguation.
    pub dir_inode_to_blocks: BTreeMap<u32, Vec<u32>>,
    /// Inodes still ambiguous after every rule.
    pub ambiguous: Vec<u32>,
}

impl DirectoryTree {
    /// Build the tree from a stage-1 scan: disambiguate, attach extended
    /// blocks, descend from the root inode and index file paths.
    pub fn build<T: Read + Seek, L: LocateDb>(
        fs: &mut Ext3Fs<T>,
        jindex: &JournalIndex,
        stage1: &Stage1Scan,
        locate: &L,
    ) -> Result<DirectoryTree> {
        let mut tree = DirectoryTree {
            dir_inode_to_blocks: stage1.dir_inode_to_blocks.clone(),
            ..DirectoryTree::default()
        };
        tree.disambiguate(fs, jindex)?;

        let depth_limit = fs.filter.depth.map_or(10_000, |d| d as usize);
        let mut builder = TreeBuilder {
            fs,
            jindex,
            locate,
            directories: BTreeMap::new(),
            inode_to_path: BTreeMap::new(),
            candidates: &tree.dir_inode_to_blocks,
            loops_reported: BTreeSet::new(),
            depth_limit,
        };
        builder.descend_from_root()?;
        builder.attach_extended_blocks(&stage1.extended_blocks)?;
        tree.directories = builder.directories;
        tree.inode_to_path = builder.inode_to_path;

        tree.index_files(jindex)?;
        Ok(tree)
    }

    /// Pick one canonical block per directory inode.
    ///
    /// Rule order is observable: live-allocated shortcut, journal pruning,
    /// highest-journal-sequence tiebreak, exact-equality collapse.
    fn disambiguate<T: Read + Seek>(
        &mut self,
        fs: &mut Ext3Fs<T>,
        jindex: &JournalIndex,
    ) -> Result<()> {
        let inodes: Vec<u32> = self.dir_inode_to_blocks.keys().copied().collect();
        for inode in inodes {
            if inode == 0 || inode > fs.superblock.inodes_count() {
                warn!("ignoring out-of-range directory inode {}", inode);
                continue;
            }
            // An allocated directory inode still holds its first block
            // pointer, which is authoritative.
            if fs.is_inode_allocated(inode)? {
                let ino = fs.get_inode(inode)?;
                if ino.is_dir() {
                    let first_block = ino.block_pointers()[0];
                    if first_block == 0 {
                        warn!(
                            "inode {} is an allocated directory that references no block; \
                             corrupted filesystem?",
                            inode
                        );
                        continue;
                    }
                    let candidates = self.dir_inode_to_blocks.get_mut(&inode).unwrap();
                    if !candidates.contains(&first_block) {
                        warn!(
                            "allocated directory inode {} points at block {} which stage 1 \
                             never saw",
                            inode, first_block
                        );
                    }
                    *candidates = vec![first_block];
                    continue;
                }
            }

            let candidates = self.dir_inode_to_blocks.get_mut(&inode).unwrap();
            if candidates.len() <= 1 {
                continue;
            }

            // Journal copies lose to on-disk blocks; among journal copies
            // only the most recent one matters.
            let journal_count = candidates.iter().filter(|&&b| jindex.is_journal(b)).count();
            if journal_count == candidates.len() {
                let highest = candidates
                    .iter()
                    .map(|&b| {
                        jindex.descriptor_in_journal(b).map_or_else(
                            || {
                                warn!(
                                    "cannot find journal block {} in the descriptor map",
                                    b
                                );
                                0
                            },
                            |d| d.sequence,
                        )
                    })
                    .max()
                    .unwrap_or(0);
                candidates.retain(|&b| {
                    jindex.descriptor_in_journal(b).map_or(0, |d| d.sequence) == highest
                });
            } else if journal_count > 0 {
                candidates.retain(|&b| !jindex.is_journal(b));
            }
            if candidates.len() <= 1 {
                continue;
            }

            // The candidate with the youngest journal history wins.
            let mut best_blocknr: Option<u32> = None;
            let mut max_sequence = 0u32;
            for &b in candidates.iter() {
                let seq = jindex.find_largest_journal_sequence_number(b);
                if seq > max_sequence {
                    max_sequence = seq;
                    best_blocknr = Some(b);
                }
            }
            if let Some(best) = best_blocknr {
                candidates.retain(|&b| b == best);
            }
            if candidates.len() <= 1 {
                continue;
            }

            // Collapse candidates that decode to identical entry lists.
            let blocks = candidates.clone();
            let mut decoded: Vec<DirectoryBlock> = Vec::with_capacity(blocks.len());
            for b in &blocks {
                decoded.push(fs.read_directory_block(*b)?);
            }
            let mut kept: Vec<u32> = Vec::new();
            let mut kept_decoded: Vec<&DirectoryBlock> = Vec::new();
            for (i, b) in blocks.iter().enumerate() {
                if kept_decoded.iter().any(|d| d.exactly_equal(&decoded[i])) {
                    continue;
                }
                kept.push(*b);
                kept_decoded.push(&decoded[i]);
            }
            let candidates = self.dir_inode_to_blocks.get_mut(&inode).unwrap();
            *candidates = kept;
            if candidates.len() <= 1 {
                continue;
            }

            warn!(
                "inode {} is still referenced by multiple directory blocks: {:?}",
                inode, candidates
            );
            self.ambiguous.push(inode);
        }
        Ok(())
    }

    /// The canonical directory block for `inode`, when one is known.
    pub fn dir_inode_to_block(&self, inode: u32) -> Option<u32> {
        self.dir_inode_to_blocks
            .get(&inode)
            .and_then(|v| v.first())
            .copied()
    }

    /// Fill `path_to_inode`: per directory, order its blocks youngest
    /// journal sequence first and take the first inode seen for each
    /// non-directory name.
    fn index_files(&mut self, jindex: &JournalIndex) -> Result<()> {
        self.path_to_inode.clear();
        for (path, directory) in &self.directories {
            let mut ordered: Vec<(u32, &DirectoryBlock)> = directory
                .blocks
                .iter()
                .map(|b| {
                    let sequence = if jindex.is_in_journal(b.block) {
                        jindex.descriptor_in_journal(b.block).map_or(0, |d| d.sequence)
                    } else {
                        // Youngest tag that wrote this on-disk block.
                        jindex
                            .descriptors_for(b.block)
                            .iter()
                            .rev()
                            .filter_map(|&idx| {
                                let d = jindex.descriptor(idx);
                                match d.kind {
                                    crate::journal::DescriptorKind::Tag { .. } => {
                                        Some(d.sequence)
                                    }
                                    _ => None,
                                }
                            })
                            .next()
                            .unwrap_or(0)
                    };
                    (sequence, b)
                })
                .collect();
            ordered.sort_by(|a, b| b.0.cmp(&a.0));

            for (_, block) in ordered {
                for entry in &block.entries {
                    if entry.flags.zero_inode || entry.flags.reallocated {
                        continue;
                    }
                    if (entry.file_type & 7) == EXT3_FT_DIR {
                        continue;
                    }
                    let full = join_path(path, &entry.name);
                    self.path_to_inode.entry(full).or_insert(entry.inode);
                }
            }
        }
        Ok(())
    }

    /// Every reconstructed path, directories and files together, sorted.
    pub fn all_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .directories
            .keys()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();
        paths.extend(self.path_to_inode.keys().cloned());
        paths.sort();
        paths
    }

    /// Inodes referenced by two or more non-directory paths.
    pub fn hardlinks(&self) -> BTreeMap<u32, Vec<String>> {
        let mut by_inode: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for (path, &inode) in &self.path_to_inode {
            by_inode.entry(inode).or_default().push(path.clone());
        }
        by_inode.retain(|_, paths| paths.len() > 1);
        by_inode
    }

    pub fn cache_path(device_name: &str) -> PathBuf {
        cache_file(device_name, "stage2")
    }

    /// Load the stage-2 cache if present, otherwise run stage 1 (itself
    /// cached), build, and write the cache.
    pub fn load_or_build<T: Read + Seek, L: LocateDb>(
        fs: &mut Ext3Fs<T>,
        jindex: &JournalIndex,
        device_name: &str,
        locate: &L,
    ) -> Result<DirectoryTree> {
        let path = Self::cache_path(device_name);
        if path.exists() {
            info!("loading {}", path.display());
            return Self::load(fs, jindex, &path);
        }
        let stage1 = Stage1Scan::load_or_run(fs, device_name)?;
        let tree = Self::build(fs, jindex, &stage1, locate)?;
        info!("writing analysis so far to '{}'", path.display());
        tree.save(&path, device_name)?;
        Ok(tree)
    }

    pub fn save(&self, path: &Path, device_name: &str) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# Stage 2 data for {}.", device_name)?;
        writeln!(out, "# Inodes, path and directory blocks.")?;
        writeln!(out, "# INODE 'PATH' BLOCK [BLOCK ...]")?;
        for (inode, dir_path) in &self.inode_to_path {
            write!(out, "{} '{}'", inode, dir_path)?;
            if let Some(directory) = self.directories.get(dir_path) {
                for b in &directory.blocks {
                    write!(out, " {}", b.block)?;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn load<T: Read + Seek>(
        fs: &mut Ext3Fs<T>,
        jindex: &JournalIndex,
        path: &Path,
    ) -> Result<DirectoryTree> {
        let bad = |detail: String| Ext3Error::Cache {
            path: path.display().to_string(),
            detail,
        };
        let mut tree = DirectoryTree::default();
        for line in BufReader::new(File::open(path)?).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (inode_str, rest) = line
                .split_once(' ')
                .ok_or_else(|| bad(format!("bad line: {}", line)))?;
            let inode: u32 = inode_str
                .parse()
                .map_err(|_| bad(format!("bad inode: {}", inode_str)))?;
            let rest = rest.trim_start();
            if !rest.starts_with('\'') {
                return Err(bad(format!("missing quoted path: {}", line)));
            }
            let end = rest[1..]
                .find('\'')
                .ok_or_else(|| bad(format!("unterminated path: {}", line)))?;
            let dir_path = rest[1..1 + end].to_string();
            let mut blocks = Vec::new();
            for tok in rest[end + 2..].split_whitespace() {
                blocks.push(
                    tok.parse::<u32>()
                        .map_err(|_| bad(format!("bad block: {}", tok)))?,
                );
            }
            let mut decoded = Vec::with_capacity(blocks.len());
            for &b in &blocks {
                decoded.push(fs.read_directory_block(b)?);
            }
            tree.directories.insert(
                dir_path.clone(),
                Directory {
                    inode,
                    blocks: decoded,
                },
            );
            tree.inode_to_path.insert(inode, dir_path);
            tree.dir_inode_to_blocks.insert(inode, blocks);
        }
        tree.index_files(jindex)?;
        Ok(tree)
    }
}

/// State carried while descending the directory graph.
struct TreeBuilder<'a, T: Read + Seek, L: LocateDb> {
    fs: &'a mut Ext3Fs<T>,
    jindex: &'a JournalIndex,
    locate: &'a L,
    directories: BTreeMap<String, Directory>,
    inode_to_path: BTreeMap<u32, String>,
    candidates: &'a BTreeMap<u32, Vec<u32>>,
    loops_reported: BTreeSet<u32>,
    /// Maximum ancestry length a child may be added under: the user's
    /// `--depth` when given, otherwise a loop-protection ceiling.
    depth_limit: usize,
}

enum Registered {
    New,
    AlreadyProcessed,
    Conflict,
}

impl<T: Read + Seek, L: LocateDb> TreeBuilder<'_, T, L> {
    fn candidate_block(&self, inode: u32) -> Option<u32> {
        self.candidates.get(&inode).and_then(|v| v.first()).copied()
    }

    fn descend_from_root(&mut self) -> Result<()> {
        let root_inode = self.fs.get_inode(2)?;
        let root_block = self.candidate_block(2).ok_or_else(|| {
            Ext3Error::NotFound("no directory block found for the root inode".to_string())
        })?;
        // The root is always allocated; walk all of its blocks.
        let walk = self
            .fs
            .collect_blocks(&root_inode, crate::WalkSelector::DATA)?;
        let mut block_numbers = walk.blocks;
        if block_numbers.is_empty() {
            block_numbers.push(root_block);
        }
        let mut blocks = Vec::with_capacity(block_numbers.len());
        for b in &block_numbers {
            blocks.push(self.fs.read_directory_block(*b)?);
        }
        self.directories.insert(
            String::new(),
            Directory {
                inode: 2,
                blocks: blocks.clone(),
            },
        );
        self.inode_to_path.insert(2, String::new());

        let mut ancestry = vec![(2u32, 0u32)];
        for block in &blocks {
            self.process_block_entries("", 2, block, &mut ancestry)?;
        }
        Ok(())
    }

    fn process_block_entries(
        &mut self,
        parent_path: &str,
        parent_inode: u32,
        block: &DirectoryBlock,
        ancestry: &mut Vec<(u32, u32)>,
    ) -> Result<()> {
        for entry in &block.entries {
            if entry.is_dot() || entry.is_dotdot() {
                continue;
            }
            if entry.flags.zero_inode || (entry.file_type & 7) != EXT3_FT_DIR {
                continue;
            }
            self.add_child(parent_path, parent_inode, entry.clone(), ancestry)?;
        }
        Ok(())
    }

    fn add_child(
        &mut self,
        parent_path: &str,
        parent_inode: u32,
        entry: crate::direntry::DirEntry,
        ancestry: &mut Vec<(u32, u32)>,
    ) -> Result<()> {
        let child = entry.inode;
        let child_path = join_path(parent_path, &entry.name);

        if ancestry.iter().any(|&(ino, _)| ino == child) {
            if self.loops_reported.insert(child) {
                info!("detected loop for inode {} ({})", child, child_path);
            }
            return Ok(());
        }
        if ancestry.len() > self.depth_limit {
            return Ok(());
        }

        let child_inode = self.fs.get_inode(child)?;
        let live = !entry.flags.deleted && entry.flags.allocated && !entry.flags.reallocated;

        let block_numbers: Vec<u32> = if live {
            let walk = self
                .fs
                .collect_blocks(&child_inode, crate::WalkSelector::DATA)?;
            if walk.reused_or_corrupt {
                warn!(
                    "directory inode {} has reused or corrupt indirect blocks",
                    child
                );
            }
            walk.blocks
        } else {
            // Only the first block is known, but that is enough to build
            // the tree.
            let blocknr = match self.candidate_block(child) {
                Some(b) => b,
                None => {
                    info!("cannot find a directory block for inode {}", child);
                    return Ok(());
                }
            };
            // rm -rf can stamp a parent as deleted before its
            // subdirectories; allow 60 seconds of difference.
            let ancestor_dtime = ancestry
                .iter()
                .rev()
                .map(|&(_, dtime)| dtime)
                .find(|&d| d != 0)
                .unwrap_or(0);
            if ancestor_dtime != 0 && ancestor_dtime + 60 < child_inode.dtime() {
                return Ok(());
            }
            vec![blocknr]
        };
        if block_numbers.is_empty() {
            info!("cannot find a directory block for inode {}", child);
            return Ok(());
        }

        let mut blocks = Vec::with_capacity(block_numbers.len());
        for b in &block_numbers {
            blocks.push(self.fs.read_directory_block(*b)?);
        }

        if !live {
            // Before descending, the first block's ".." must agree with
            // the parent.
            match blocks[0].dotdot_inode() {
                Some(dotdot) if dotdot == parent_inode => {}
                _ => {
                    info!("the directory \"{}\" is lost", child_path);
                    return Ok(());
                }
            }
        }

        match self.register_directory(&child_path, child, blocks.clone()) {
            Registered::New => {}
            Registered::AlreadyProcessed | Registered::Conflict => return Ok(()),
        }

        ancestry.push((child, child_inode.dtime()));
        for block in &blocks {
            self.process_block_entries(&child_path, child, block, ancestry)?;
        }
        ancestry.pop();
        Ok(())
    }

    fn register_directory(
        &mut self,
        path: &str,
        inode: u32,
        blocks: Vec<DirectoryBlock>,
    ) -> Registered {
        if let Some(existing) = self.directories.get(path) {
            if existing.inode == inode
                && existing.first_block() == blocks.first().map(|b| b.block)
            {
                return Registered::AlreadyProcessed;
            }
            info!(
                "directory {} is linked to both inode/block {}/{:?} as well as {}/{:?}",
                path,
                inode,
                blocks.first().map(|b| b.block),
                existing.inode,
                existing.first_block()
            );
            return Registered::Conflict;
        }

        if let Some(old_path) = self.inode_to_path.get(&inode).cloned() {
            info!(
                "inode number {} is linked to both {} as well as {}",
                inode, path, old_path
            );
            let new_exists = self.locate.path_exists(path);
            let old_exists = self.locate.path_exists(&old_path);
            if new_exists && !old_exists {
                info!(
                    "using \"{}\" as \"{}\" doesn't exist in the locate database",
                    path, old_path
                );
                self.directories
                    .insert(path.to_string(), Directory { inode, blocks });
                self.inode_to_path.insert(inode, path.to_string());
            } else if !new_exists && old_exists {
                info!(
                    "keeping \"{}\" as \"{}\" doesn't exist in the locate database",
                    old_path, path
                );
            } else {
                info!("neither exists in the locate database; keeping \"{}\"", old_path);
            }
            return Registered::Conflict;
        }

        self.directories
            .insert(path.to_string(), Directory { inode, blocks });
        self.inode_to_path.insert(inode, path.to_string());
        Registered::New
    }

    /// Infer the owner of each extended block and attach it to that
    /// owner's directory.
    fn attach_extended_blocks(&mut self, extended_blocks: &[u32]) -> Result<()> {
        info!("processing extended directory blocks...");
        for &blocknr in extended_blocks {
            let inode_from_journal = self.jindex.block_to_dir_inode.get(&blocknr).copied();
            let decoded = self.fs.read_directory_block(blocknr)?;

            // Majority vote over the ".." entries of the sub-directories
            // this block references.
            let mut linked: BTreeMap<u32, u32> = BTreeMap::new();
            let mut unlinked: BTreeMap<u32, u32> = BTreeMap::new();
            for entry in &decoded.entries {
                if (entry.file_type & 7) != EXT3_FT_DIR || entry.flags.zero_inode {
                    continue;
                }
                let child_block = match self.candidate_block(entry.inode) {
                    Some(b) => b,
                    None => {
                        info!("cannot find a directory block for inode {}", entry.inode);
                        break;
                    }
                };
                let child_start = self.fs.read_directory_block(child_block)?;
                if child_start.dot_inode() != Some(entry.inode) {
                    warn!(
                        "block {} does not start with a '.' entry for inode {}",
                        child_block, entry.inode
                    );
                    continue;
                }
                let dotdot = match child_start.dotdot_inode() {
                    Some(i) if i != 0 => i,
                    _ => continue,
                };
                let counts = if entry.flags.linked {
                    &mut linked
                } else {
                    &mut unlinked
                };
                *counts.entry(dotdot).or_insert(0) += 1;
            }

            let use_linked = !linked.is_empty();
            let votes = if use_linked { &linked } else { &unlinked };
            if !votes.is_empty() {
                if votes.len() > 1 {
                    warn!(
                        "extended directory at {} has sub-directories pointing at \
                         different parents: {:?}",
                        blocknr, votes
                    );
                }
                let (&owner, &count) = votes.iter().max_by_key(|(_, &c)| c).unwrap();
                info!(
                    "extended directory at {} belongs to inode {} (from {} {} directories)",
                    blocknr,
                    owner,
                    count,
                    if use_linked { "linked" } else { "unlinked" }
                );
                if let Some(journal_owner) = inode_from_journal {
                    if journal_owner != owner {
                        warn!(
                            "according to the journal it should have been inode {}",
                            journal_owner
                        );
                    }
                }
                self.link_extended_block(blocknr, &decoded, owner)?;
                continue;
            }

            // No sub-directory evidence; try the journal, then filename
            // heuristics against the locate database.
            let filenames: BTreeSet<String> = decoded
                .entries
                .iter()
                .map(|e| e.name.clone())
                .filter(|n| !n.is_empty())
                .collect();
            if filenames.is_empty() {
                match inode_from_journal {
                    Some(owner) => {
                        info!(
                            "extended directory at {} belongs to inode {} (empty; from journal)",
                            blocknr, owner
                        );
                        self.link_extended_block(blocknr, &decoded, owner)?;
                    }
                    None => info!(
                        "could not find an inode for empty extended directory at {}",
                        blocknr
                    ),
                }
                continue;
            }
            match self.locate.parent_directory(blocknr, &filenames) {
                Some(dir) if self.directories.contains_key(&dir) => {
                    let owner = self.directories[&dir].inode;
                    info!("extended directory at {} belongs to inode {}", blocknr, owner);
                    if let Some(journal_owner) = inode_from_journal {
                        if journal_owner != owner {
                            warn!(
                                "according to the journal it should have been inode {}",
                                journal_owner
                            );
                        }
                    }
                    self.link_extended_block(blocknr, &decoded, owner)?;
                }
                Some(dir) => {
                    info!(
                        "extended directory at {} belongs to directory {} but that \
                         directory doesn't exist",
                        blocknr, dir
                    );
                    if let Some(owner) = inode_from_journal {
                        info!(
                            "extended directory at {} belongs to inode {} (fall back to journal)",
                            blocknr, owner
                        );
                        self.link_extended_block(blocknr, &decoded, owner)?;
                    }
                }
                None => match inode_from_journal {
                    Some(owner) => {
                        info!(
                            "extended directory at {} belongs to inode {} (from journal)",
                            blocknr, owner
                        );
                        self.link_extended_block(blocknr, &decoded, owner)?;
                    }
                    None => info!(
                        "could not find an inode for extended directory at {}, \
                         disregarding its contents",
                        blocknr
                    ),
                },
            }
        }
        Ok(())
    }

    fn link_extended_block(
        &mut self,
        blocknr: u32,
        decoded: &DirectoryBlock,
        owner: u32,
    ) -> Result<()> {
        let owner_path = match self.inode_to_path.get(&owner).cloned() {
            Some(p) => p,
            None => {
                warn!(
                    "can't link block {} to inode {} because that inode is not part \
                     of the directory tree",
                    blocknr, owner
                );
                return Ok(());
            }
        };
        if let Some(directory) = self.directories.get_mut(&owner_path) {
            if directory.blocks.iter().any(|b| b.block == blocknr) {
                return Ok(());
            }
            directory.blocks.push(decoded.clone());
        }
        // New sub-directories may be reachable through this block.
        let mut ancestry = vec![(owner, 0u32)];
        self.process_block_entries(&owner_path, owner, decoded, &mut ancestry)?;
        Ok(())
    }
}
