//! End-to-end tests over a synthetic single-group ext3 image with an
//! internal journal, deleted files, extended directory blocks, hardlinks
//! and a directory loop.

mod common;

use std::io::Cursor;

use common::*;
use ext3rescue::journal::JournalIndex;
use ext3rescue::resolve::{DirectoryTree, NoLocateDb, Stage1Scan};
use ext3rescue::restore::{
    get_undeleted_inode, journal_inode_copies, Restorer, RestoreOutcome, UndeletedInode,
};
use ext3rescue::{Ext3Fs, WalkSelector};

const T0: u32 = 1_200_000_000;

/// Root block: live chain ".", "..", "sub", "file.txt", "link",
/// "file2.txt", "old.log", "a"; plus the tail-deleted entry "gone.txt"
/// hidden under the rec_len of "a".
fn root_block() -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    write_dir_entry(&mut buf, 0, 2, 12, ".", FT_DIR);
    write_dir_entry(&mut buf, 12, 2, 12, "..", FT_DIR);
    write_dir_entry(&mut buf, 24, 13, 12, "sub", FT_DIR);
    write_dir_entry(&mut buf, 36, 12, 16, "file.txt", FT_REG);
    write_dir_entry(&mut buf, 52, 21, 12, "link", FT_SYMLINK);
    write_dir_entry(&mut buf, 64, 12, 20, "file2.txt", FT_REG);
    write_dir_entry(&mut buf, 84, 11, 16, "old.log", FT_REG);
    write_dir_entry(&mut buf, 100, 19, BLOCK_SIZE - 100, "a", FT_DIR);
    // Deleted but not overwritten.
    write_dir_entry(&mut buf, 112, 14, BLOCK_SIZE - 112, "gone.txt", FT_REG);
    buf
}

fn journal_copy_of_table_block_6(
    old_log_dtime: u32,
    gone_block: u32,
    gone_size: u32,
) -> Vec<u8> {
    inode_table_block(&[
        // inode 11 (old.log): deleted long before everything else.
        (
            2,
            raw_inode(0o100644, 7, old_log_dtime, 900_000_000, 2, &ptrs(&[28])),
        ),
        // inode 13 (sub): a live directory copy; teaches the resolver
        // that block 10 belongs to inode 13.
        (
            4,
            raw_inode(0o040755, 1024, 0, T0 + 90, 2, &ptrs(&[10])),
        ),
        // inode 14 (gone.txt): live copy with its data pointer.
        (
            5,
            raw_inode(0o100644, gone_size, 0, T0 + 90, 2, &ptrs(&[gone_block])),
        ),
        // inode 15 (notes.md): live copy.
        (
            6,
            raw_inode(0o100644, 9, 0, T0 + 90, 2, &ptrs(&[21])),
        ),
    ])
}

fn build_image() -> Cursor<Vec<u8>> {
    let mut img = ImageBuilder::new();

    // Root directory, inode 2, allocated.
    img.set_inode(2, &raw_inode(0o040755, 1024, 0, T0, 2, &ptrs(&[9])));
    img.mark_inode_allocated(1);
    img.mark_inode_allocated(2);
    img.set_block(9, root_block());

    // file.txt / file2.txt: one live regular file, two links.
    img.set_inode(12, &raw_inode(0o100644, 1500, 0, T0, 4, &ptrs(&[11, 12])));
    img.mark_inode_allocated(12);
    img.set_block(11, vec![b'A'; BLOCK_SIZE]);
    img.set_block(12, vec![b'B'; BLOCK_SIZE]);

    // sub: deleted directory, pointers wiped; stage 1 finds block 10.
    img.set_inode(13, &raw_inode(0o040755, 1024, T0 + 100, T0, 0, &ptrs(&[])));
    img.set_block(
        10,
        dir_block(&[(13, ".", FT_DIR), (2, "..", FT_DIR), (15, "notes.md", FT_REG)]),
    );
    // An identical copy of sub's block; the exact-equality rule collapses it.
    img.set_block(
        27,
        dir_block(&[(13, ".", FT_DIR), (2, "..", FT_DIR), (15, "notes.md", FT_REG)]),
    );

    // old.log (11), gone.txt (14), notes.md (15): deleted, pointers wiped.
    img.set_inode(11, &raw_inode(0o100644, 7, 1_000_000_000, T0, 0, &ptrs(&[])));
    img.set_inode(14, &raw_inode(0o100644, 11, T0 + 200, T0, 0, &ptrs(&[])));
    img.set_inode(15, &raw_inode(0o100644, 9, T0 + 150, T0, 0, &ptrs(&[])));

    // Inode 16 owns a reused/corrupt indirect block at 17.
    let mut bigfile = ptrs(&[]);
    bigfile[12] = 17;
    img.set_inode(16, &raw_inode(0o100644, 20000, 0, T0, 42, &bigfile));
    let ind = img.block_mut(17);
    ind[0..4].copy_from_slice(&42u32.to_le_bytes());
    ind[4..8].copy_from_slice(&0x7FFF_FFFFu32.to_le_bytes());
    ind[8..12].copy_from_slice(&19u32.to_le_bytes());

    // deep1/deep2: deleted directories only reachable through the
    // extended block 22.
    img.set_inode(17, &raw_inode(0o040755, 1024, T0 + 80, T0, 0, &ptrs(&[])));
    img.set_inode(18, &raw_inode(0o040755, 1024, T0 + 80, T0, 0, &ptrs(&[])));
    img.set_block(23, dir_block(&[(17, ".", FT_DIR), (13, "..", FT_DIR)]));
    img.set_block(24, dir_block(&[(18, ".", FT_DIR), (13, "..", FT_DIR)]));
    img.set_block(22, dir_block(&[(17, "deep1", FT_DIR), (18, "deep2", FT_DIR)]));

    // a/b: a directory loop (b contains an entry back to a).
    img.set_inode(19, &raw_inode(0o040755, 1024, T0 + 50, T0, 0, &ptrs(&[])));
    img.set_inode(20, &raw_inode(0o040755, 1024, T0 + 50, T0, 0, &ptrs(&[])));
    img.set_block(
        25,
        dir_block(&[(19, ".", FT_DIR), (2, "..", FT_DIR), (20, "b", FT_DIR)]),
    );
    img.set_block(
        26,
        dir_block(&[(20, ".", FT_DIR), (19, "..", FT_DIR), (19, "a", FT_DIR)]),
    );

    // link: live inline symlink.
    let mut link = raw_inode(0o120777, 11, 0, T0, 0, &ptrs(&[]));
    link[0x28..0x28 + 11].copy_from_slice(b"target/path");
    img.set_inode(21, &link);
    img.mark_inode_allocated(21);

    // Old file contents still on disk.
    let mut gone = vec![0u8; BLOCK_SIZE];
    gone[..11].copy_from_slice(b"old content");
    img.set_block(20, gone);
    let mut notes = vec![0u8; BLOCK_SIZE];
    notes[..9].copy_from_slice(b"notes old");
    img.set_block(21, notes);
    let mut stale = vec![0u8; BLOCK_SIZE];
    stale[..5].copy_from_slice(b"stale");
    img.set_block(29, stale);

    for b in 1..=12 {
        img.mark_block_allocated(b);
    }

    // Journal: two transactions touching inode-table block 6. The older
    // one (sequence 7) still points gone.txt at the stale block 29; the
    // younger one (sequence 12) points it at block 20.
    let mut journal_blocks = vec![
        journal_superblock(12, 1, 7),
        journal_descriptor(7, &[6]),
        journal_copy_of_table_block_6(950_000_000, 29, 5),
        journal_commit(7),
        journal_descriptor(12, &[6]),
        journal_copy_of_table_block_6(950_000_000, 20, 11),
        journal_commit(12),
    ];
    while journal_blocks.len() < 12 {
        journal_blocks.push(vec![0u8; BLOCK_SIZE]);
    }
    img.install_journal(30, journal_blocks);

    img.build()
}

fn open_fs() -> Ext3Fs<Cursor<Vec<u8>>> {
    Ext3Fs::open(build_image()).expect("image should open")
}

#[test]
fn geometry_and_inode_access() {
    let mut fs = open_fs();
    assert_eq!(fs.superblock.block_size(), BLOCK_SIZE);
    assert_eq!(fs.superblock.groups(), 1);

    // The parsed inode matches a manual slice of the inode table.
    let raw = fs.raw_inode(12).unwrap();
    let table_block = fs.read_block(6).unwrap();
    assert_eq!(&raw[..], &table_block[3 * INODE_SIZE..4 * INODE_SIZE]);
    let inode = fs.get_inode(12).unwrap();
    assert!(inode.is_regular_file());
    assert_eq!(inode.size(), 1500);

    assert!(fs.is_inode_allocated(2).unwrap());
    assert!(!fs.is_inode_allocated(13).unwrap());
    assert!(fs.is_block_allocated(9).unwrap());
    assert!(!fs.is_block_allocated(22).unwrap());
}

#[test]
fn inode_table_block_classification() {
    let fs = open_fs();
    // Inode table spans blocks 5..=8.
    for b in 5..=8u32 {
        assert!(fs.is_inode_block(b), "block {} should be an inode block", b);
        let first = fs.block_to_inode(b);
        assert!(first >= 1 && first <= INODES_COUNT);
        assert_eq!(first, 1 + (b - 5) * 8);
    }
    assert!(!fs.is_inode_block(4));
    assert!(!fs.is_inode_block(9));
    assert_eq!(fs.inode_to_block(12), 6);
    assert_eq!(fs.inode_to_block(1), 5);
}

#[test]
fn walker_stops_on_reused_or_corrupt_indirect_block() {
    let mut fs = open_fs();
    let inode = fs.get_inode(16).unwrap();
    let walk = fs.collect_blocks(&inode, WalkSelector::DATA).unwrap();
    assert!(walk.reused_or_corrupt);
    assert_eq!(walk.blocks, vec![42]);
}

#[test]
fn walker_emits_indirect_metadata_when_asked() {
    let mut fs = open_fs();
    let inode = fs.get_inode(16).unwrap();
    let walk = fs.collect_blocks(&inode, WalkSelector::ALL).unwrap();
    assert!(walk.reused_or_corrupt);
    // The indirect node itself, then its first data pointer.
    assert_eq!(walk.blocks, vec![17, 42]);
}

#[test]
fn walker_returns_nothing_for_inline_symlinks() {
    let mut fs = open_fs();
    let inode = fs.get_inode(21).unwrap();
    assert!(inode.has_inline_symlink_target());
    let walk = fs.collect_blocks(&inode, WalkSelector::DATA).unwrap();
    assert!(walk.blocks.is_empty());
    assert!(!walk.reused_or_corrupt);
}

#[test]
fn journal_index_maps() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();

    assert_eq!(jindex.min_journal_block, 30);
    assert_eq!(jindex.max_journal_block, 42);
    for b in 30..42 {
        assert!(jindex.is_journal(b), "block {} should be a journal block", b);
    }
    assert!(!jindex.is_journal(29));
    assert!(!jindex.is_journal(42));

    assert_eq!(jindex.min_sequence, 7);
    assert_eq!(jindex.max_sequence, 12);
    assert_eq!(jindex.find_largest_journal_sequence_number(6), 12);
    assert_eq!(jindex.find_largest_journal_sequence_number(9), 0);

    // Both transactions committed.
    assert!(jindex.sequence_to_transaction[&7].committed);
    assert!(jindex.sequence_to_transaction[&12].committed);

    // The journal copies of directory inode 13 teach block ownership.
    assert_eq!(jindex.block_to_dir_inode.get(&10), Some(&13));

    // A journal data block mirrors the inode table.
    assert_eq!(jindex.inode_table_block_for(&fs, 32), Some(6));
    assert_eq!(jindex.inode_table_block_for(&fs, 6), Some(6));
    assert_eq!(jindex.inode_table_block_for(&fs, 9), None);

    // Journal-relative translation walks the journal inode.
    assert_eq!(jindex.journal_block_to_fs_block(&mut fs, 0).unwrap(), 30);
    assert_eq!(jindex.journal_block_to_fs_block(&mut fs, 11).unwrap(), 41);
    assert!(jindex.journal_block_to_fs_block(&mut fs, 12).is_err());
}

#[test]
fn journal_inode_copies_are_youngest_first() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let copies = jindex.inode_copies(&mut fs, 14).unwrap();
    assert_eq!(copies.len(), 2);
    assert_eq!(copies[0].0, 12);
    assert_eq!(copies[1].0, 7);
    // The younger copy points at block 20, the older at the stale block.
    assert_eq!(copies[0].1.block_pointers()[0], 20);
    assert_eq!(copies[1].1.block_pointers()[0], 29);

    let deduped = journal_inode_copies(&mut fs, &jindex, 14).unwrap();
    assert_eq!(deduped.len(), 1, "identical mtimes collapse");
}

#[test]
fn stage1_finds_start_and_extended_blocks() {
    let mut fs = open_fs();
    let scan = Stage1Scan::run(&mut fs).unwrap();
    assert_eq!(scan.dir_inode_to_blocks[&2], vec![9]);
    assert_eq!(scan.dir_inode_to_blocks[&13], vec![10, 27]);
    assert_eq!(scan.dir_inode_to_blocks[&17], vec![23]);
    assert_eq!(scan.dir_inode_to_blocks[&18], vec![24]);
    assert_eq!(scan.dir_inode_to_blocks[&19], vec![25]);
    assert_eq!(scan.dir_inode_to_blocks[&20], vec![26]);
    assert_eq!(scan.extended_blocks, vec![22]);
}

#[test]
fn stage1_cache_round_trip_on_image() {
    let mut fs = open_fs();
    let scan = Stage1Scan::run(&mut fs).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.stage1");
    scan.save(&path, "image").unwrap();
    let loaded = Stage1Scan::load(&path).unwrap();
    assert_eq!(loaded, scan);
}

#[test]
fn live_allocated_shortcut_wins_disambiguation() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let mut stage1 = Stage1Scan::default();
    // Stage 1 claims three candidates for the (allocated) root inode.
    stage1.dir_inode_to_blocks.insert(2, vec![9, 10, 25]);
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();
    assert_eq!(tree.dir_inode_to_blocks[&2], vec![9]);
}

#[test]
fn journal_candidates_lose_to_on_disk_blocks() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let mut stage1 = Stage1Scan::default();
    stage1.dir_inode_to_blocks.insert(2, vec![9]);
    stage1.dir_inode_to_blocks.insert(13, vec![32, 10]);
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();
    assert_eq!(tree.dir_inode_to_blocks[&13], vec![10]);
}

#[test]
fn all_journal_candidates_keep_highest_sequence() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let mut stage1 = Stage1Scan::default();
    stage1.dir_inode_to_blocks.insert(2, vec![9]);
    // Blocks 32 (sequence 7) and 35 (sequence 12) both live in the journal.
    stage1.dir_inode_to_blocks.insert(13, vec![32, 35]);
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();
    assert_eq!(tree.dir_inode_to_blocks[&13], vec![35]);
}

#[test]
fn tree_reconstruction() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let stage1 = Stage1Scan::run(&mut fs).unwrap();
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();

    // Identical duplicate of sub's block collapsed by exact equality.
    assert_eq!(tree.dir_inode_to_blocks[&13], vec![10]);
    assert!(tree.ambiguous.is_empty());

    // Directory paths.
    assert_eq!(tree.inode_to_path[&2], "");
    assert_eq!(tree.inode_to_path[&13], "sub");
    assert_eq!(tree.inode_to_path[&19], "a");
    assert_eq!(tree.inode_to_path[&20], "a/b");
    // deep1/deep2 are only reachable through the extended block, whose
    // owner is inferred from the ".." majority vote.
    assert_eq!(tree.inode_to_path[&17], "sub/deep1");
    assert_eq!(tree.inode_to_path[&18], "sub/deep2");

    // The loop b -> a was broken: no a/b/a.
    assert!(!tree.directories.contains_key("a/b/a"));

    // The extended block was attached to sub.
    let sub_blocks: Vec<u32> = tree.directories["sub"]
        .blocks
        .iter()
        .map(|b| b.block)
        .collect();
    assert_eq!(sub_blocks, vec![10, 22]);

    // File paths, including the tail-deleted entry and the hardlink.
    assert_eq!(tree.path_to_inode["file.txt"], 12);
    assert_eq!(tree.path_to_inode["file2.txt"], 12);
    assert_eq!(tree.path_to_inode["gone.txt"], 14);
    assert_eq!(tree.path_to_inode["old.log"], 11);
    assert_eq!(tree.path_to_inode["link"], 21);
    assert_eq!(tree.path_to_inode["sub/notes.md"], 15);

    // The chosen block for a live allocated directory is inode.block[0].
    let root_inode = fs.get_inode(2).unwrap();
    assert_eq!(
        tree.dir_inode_to_blocks[&2],
        vec![root_inode.block_pointers()[0]]
    );

    let links = tree.hardlinks();
    assert_eq!(links[&12], vec!["file.txt".to_string(), "file2.txt".to_string()]);
}

#[test]
fn depth_limit_bounds_recursion() {
    let mut fs = open_fs();
    fs.filter.depth = Some(1);
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let stage1 = Stage1Scan::run(&mut fs).unwrap();
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();

    // The root's immediate children are reached, nothing deeper.
    assert!(tree.directories.contains_key("sub"));
    assert!(tree.directories.contains_key("a"));
    assert!(!tree.directories.contains_key("a/b"));
}

#[test]
fn stage2_cache_round_trip() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let stage1 = Stage1Scan::run(&mut fs).unwrap();
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.stage2");
    tree.save(&path, "image").unwrap();
    let loaded = DirectoryTree::load(&mut fs, &jindex, &path).unwrap();

    assert_eq!(loaded.path_to_inode, tree.path_to_inode);
    assert_eq!(loaded.inode_to_path, tree.inode_to_path);
    // Saving the loaded tree reproduces the same cache.
    let path2 = dir.path().join("image2.stage2");
    loaded.save(&path2, "image").unwrap();
    let a = std::fs::read_to_string(&path).unwrap();
    let b = std::fs::read_to_string(&path2).unwrap();
    assert_eq!(a, b);
}

#[test]
fn undeleted_inode_selection() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();

    match get_undeleted_inode(&mut fs, &jindex, 12).unwrap() {
        UndeletedInode::Live(inode) => assert_eq!(inode.size(), 1500),
        other => panic!("expected a live inode, got {:?}", other),
    }

    // The youngest journal copy (sequence 12) wins.
    match get_undeleted_inode(&mut fs, &jindex, 14).unwrap() {
        UndeletedInode::FromJournal(inode, sequence) => {
            assert_eq!(sequence, 12);
            assert_eq!(inode.block_pointers()[0], 20);
        }
        other => panic!("expected a journal copy, got {:?}", other),
    }

    // Every copy of old.log was deleted before the cutoff.
    fs.filter.after = Some(1_000_000_000);
    match get_undeleted_inode(&mut fs, &jindex, 11).unwrap() {
        UndeletedInode::TooOld => {}
        other => panic!("expected TooOld, got {:?}", other),
    }

    // Without a cutoff there is simply no undeleted copy.
    fs.filter.after = None;
    match get_undeleted_inode(&mut fs, &jindex, 11).unwrap() {
        UndeletedInode::NotFound => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test]
fn restore_live_file_concatenates_blocks() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let stage1 = Stage1Scan::run(&mut fs).unwrap();
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut restorer = Restorer::new(&mut fs, &jindex, &tree).with_output_dir(out.path());
    assert_eq!(
        restorer.restore_path("file.txt").unwrap(),
        RestoreOutcome::Restored
    );
    let data = std::fs::read(out.path().join("file.txt")).unwrap();
    assert_eq!(data.len(), 1500);
    assert!(data[..1024].iter().all(|&b| b == b'A'));
    assert!(data[1024..].iter().all(|&b| b == b'B'));
}

#[test]
fn restore_deleted_file_from_journal_copy() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let stage1 = Stage1Scan::run(&mut fs).unwrap();
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut restorer = Restorer::new(&mut fs, &jindex, &tree).with_output_dir(out.path());
    assert_eq!(
        restorer.restore_path("gone.txt").unwrap(),
        RestoreOutcome::Restored
    );
    let data = std::fs::read(out.path().join("gone.txt")).unwrap();
    assert_eq!(data, b"old content");

    // Restoring inside a deleted directory restores the parent first.
    assert_eq!(
        restorer.restore_path("sub/notes.md").unwrap(),
        RestoreOutcome::Restored
    );
    assert!(out.path().join("sub").is_dir());
    let notes = std::fs::read(out.path().join("sub/notes.md")).unwrap();
    assert_eq!(notes, b"notes old");
}

#[test]
fn restore_honors_after_cutoff() {
    let mut fs = open_fs();
    fs.filter.after = Some(1_000_000_000);
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let stage1 = Stage1Scan::run(&mut fs).unwrap();
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut restorer = Restorer::new(&mut fs, &jindex, &tree).with_output_dir(out.path());
    assert_eq!(
        restorer.restore_path("old.log").unwrap(),
        RestoreOutcome::Skipped
    );
    assert!(!out.path().join("old.log").exists());
}

#[test]
fn restore_symlink_and_never_overwrite() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let stage1 = Stage1Scan::run(&mut fs).unwrap();
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut restorer = Restorer::new(&mut fs, &jindex, &tree).with_output_dir(out.path());
    assert_eq!(
        restorer.restore_path("link").unwrap(),
        RestoreOutcome::Restored
    );
    let target = std::fs::read_link(out.path().join("link")).unwrap();
    assert_eq!(target.to_string_lossy(), "target/path");

    // An existing file at the destination is never overwritten.
    std::fs::write(out.path().join("file.txt"), b"precious").unwrap();
    assert_eq!(
        restorer.restore_path("file.txt").unwrap(),
        RestoreOutcome::Skipped
    );
    assert_eq!(
        std::fs::read(out.path().join("file.txt")).unwrap(),
        b"precious"
    );
}

#[test]
fn restore_all_walks_the_whole_tree() {
    let mut fs = open_fs();
    let jindex = JournalIndex::build(&mut fs).unwrap();
    let stage1 = Stage1Scan::run(&mut fs).unwrap();
    let tree = DirectoryTree::build(&mut fs, &jindex, &stage1, &NoLocateDb).unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut restorer = Restorer::new(&mut fs, &jindex, &tree).with_output_dir(out.path());
    restorer.restore_all().unwrap();

    assert!(out.path().join("file.txt").is_file());
    assert!(out.path().join("file2.txt").is_file());
    assert!(out.path().join("gone.txt").is_file());
    assert!(out.path().join("sub").is_dir());
    assert!(out.path().join("sub/notes.md").is_file());
    assert!(out.path().join("a").is_dir());
    assert!(out.path().join("a/b").is_dir());
    assert!(out.path().join("sub/deep1").is_dir());
    assert!(out.path().join("sub/deep2").is_dir());
    // No undeleted copy of old.log exists.
    assert!(!out.path().join("old.log").exists());
}
