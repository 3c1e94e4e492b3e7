use std::fs::File;

use clap::{Arg, ArgAction, Command};
use clap_num::maybe_hex;

use ext3rescue::direntry::{file_type_char, DirBlockKind, DirectoryBlock};
use ext3rescue::journal::{DescriptorKind, JournalIndex};
use ext3rescue::resolve::{DirectoryTree, NoLocateDb, PathListDb};
use ext3rescue::restore::{journal_inode_copies, Restorer};
use ext3rescue::{Ext3Fs, Filter};

fn main() {
    env_logger::init();

    let matches = Command::new("ext3rescue")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Reconstruct directory trees and recover deleted files from an ext3 image.")
        .arg(
            Arg::new("device")
                .required(true)
                .help("The unmounted device or image file to examine."),
        )
        .arg(
            Arg::new("superblock")
                .long("superblock")
                .action(ArgAction::SetTrue)
                .help("Print the contents of the superblock."),
        )
        .arg(
            Arg::new("journal")
                .long("journal")
                .action(ArgAction::SetTrue)
                .help("With --superblock, print the journal superblock instead."),
        )
        .arg(
            Arg::new("inode")
                .long("inode")
                .value_parser(maybe_hex::<u32>)
                .help("Show info on an inode; inode 2 is the root."),
        )
        .arg(
            Arg::new("block")
                .long("block")
                .value_parser(maybe_hex::<u32>)
                .help("Show info on a block."),
        )
        .arg(
            Arg::new("inode-to-block")
                .long("inode-to-block")
                .value_parser(maybe_hex::<u32>)
                .help("Print the block that contains an inode."),
        )
        .arg(
            Arg::new("journal-block")
                .long("journal-block")
                .value_parser(maybe_hex::<u32>)
                .help("Translate a journal-relative block number."),
        )
        .arg(
            Arg::new("journal-transaction")
                .long("journal-transaction")
                .value_parser(maybe_hex::<u32>)
                .help("Show info on the transaction with this sequence number."),
        )
        .arg(
            Arg::new("show-journal-inodes")
                .long("show-journal-inodes")
                .value_parser(maybe_hex::<u32>)
                .help("Show copies of an inode still in the journal."),
        )
        .arg(
            Arg::new("dump-names")
                .long("dump-names")
                .action(ArgAction::SetTrue)
                .help("Write the path of all reconstructed files to stdout."),
        )
        .arg(
            Arg::new("restore-file")
                .long("restore-file")
                .help("Restore this path (relative to the root, no leading '/')."),
        )
        .arg(
            Arg::new("restore-all")
                .long("restore-all")
                .action(ArgAction::SetTrue)
                .help("Attempt to restore everything; --after is recommended."),
        )
        .arg(
            Arg::new("show-hardlinks")
                .long("show-hardlinks")
                .action(ArgAction::SetTrue)
                .help("Show all inodes that are shared by two or more files."),
        )
        .arg(
            Arg::new("ls")
                .long("ls")
                .action(ArgAction::SetTrue)
                .help("Print directories with one line per entry."),
        )
        .arg(
            Arg::new("after")
                .long("after")
                .value_parser(maybe_hex::<u32>)
                .help("Only process entries deleted on or after this time."),
        )
        .arg(
            Arg::new("before")
                .long("before")
                .value_parser(maybe_hex::<u32>)
                .help("Only process entries deleted before this time."),
        )
        .arg(
            Arg::new("deleted")
                .long("deleted")
                .action(ArgAction::SetTrue)
                .help("Only show/process deleted entries."),
        )
        .arg(
            Arg::new("directory")
                .long("directory")
                .action(ArgAction::SetTrue)
                .help("Only process directory inodes."),
        )
        .arg(
            Arg::new("allocated")
                .long("allocated")
                .action(ArgAction::SetTrue)
                .help("Only show/process allocated inodes."),
        )
        .arg(
            Arg::new("unallocated")
                .long("unallocated")
                .action(ArgAction::SetTrue)
                .help("Only show/process unallocated inodes."),
        )
        .arg(
            Arg::new("reallocated")
                .long("reallocated")
                .action(ArgAction::SetTrue)
                .help("Do not suppress entries with reallocated inodes."),
        )
        .arg(
            Arg::new("zeroed-inodes")
                .long("zeroed-inodes")
                .action(ArgAction::SetTrue)
                .help("Do not suppress entries with zeroed inodes."),
        )
        .arg(
            Arg::new("depth")
                .long("depth")
                .value_parser(maybe_hex::<u32>)
                .help("Process directories recursively up till a depth of 'depth'."),
        )
        .arg(
            Arg::new("accept")
                .long("accept")
                .action(ArgAction::Append)
                .help("Accept a filename as legal; can be used multiple times."),
        )
        .arg(
            Arg::new("locate-db")
                .long("locate-db")
                .help("File listing paths known to have existed, one per line."),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Emit machine-readable output where supported."),
        )
        .get_matches();

    let device = matches.get_one::<String>("device").unwrap().clone();
    if matches.get_flag("allocated") && matches.get_flag("unallocated") {
        eprintln!("ext3rescue: only one of --allocated or --unallocated may be specified");
        std::process::exit(1);
    }

    let file = match File::open(&device) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("ext3rescue: {}: {}", device, err);
            std::process::exit(1);
        }
    };
    let mut fs = match Ext3Fs::open(file) {
        Ok(fs) => fs,
        Err(err) => {
            eprintln!("ext3rescue: {}: {}", device, err);
            std::process::exit(1);
        }
    };

    fs.filter = Filter {
        deleted: matches.get_flag("deleted"),
        directory: matches.get_flag("directory"),
        allocated: matches.get_flag("allocated"),
        unallocated: matches.get_flag("unallocated"),
        reallocated: matches.get_flag("reallocated"),
        zeroed_inodes: matches.get_flag("zeroed-inodes"),
        after: matches.get_one::<u32>("after").copied(),
        before: matches.get_one::<u32>("before").copied(),
        depth: matches.get_one::<u32>("depth").copied(),
    };
    if let Some(names) = matches.get_many::<String>("accept") {
        for name in names {
            fs.accepted_filenames.insert(name.clone());
        }
    }

    let jindex = match JournalIndex::build(&mut fs) {
        Ok(j) => j,
        Err(err) => {
            eprintln!("ext3rescue: {}: {}", device, err);
            std::process::exit(1);
        }
    };

    let json = matches.get_flag("json");
    if matches.get_flag("superblock") {
        if matches.get_flag("journal") {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&jindex.superblock.to_json()).unwrap()
                );
            } else {
                println!("{:#?}", jindex.superblock);
            }
        } else if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&fs.superblock.to_json()).unwrap()
            );
        } else {
            fs.superblock.print_sp_info();
        }
    }

    let mut failed = false;
    if let Err(err) = run_actions(&matches, &device, &mut fs, &jindex) {
        eprintln!("ext3rescue: {}", err);
        failed = true;
    }
    if failed {
        std::process::exit(1);
    }
}

fn run_actions(
    matches: &clap::ArgMatches,
    device: &str,
    fs: &mut Ext3Fs<File>,
    jindex: &JournalIndex,
) -> ext3rescue::Result<()> {
    let json = matches.get_flag("json");
    let ls = matches.get_flag("ls");

    if let Some(&ino) = matches.get_one::<u32>("inode") {
        let inode = fs.get_inode(ino)?;
        if fs.is_inode_allocated(ino)? {
            println!("Inode {} is Allocated", ino);
        } else {
            println!("Inode {} is Unallocated", ino);
        }
        if json {
            println!("{}", serde_json::to_string_pretty(&inode.to_json()).unwrap());
        } else {
            println!("{}", inode.to_table());
        }
        if inode.is_dir() && inode.block_pointers()[0] != 0 {
            let block = fs.read_directory_block(inode.block_pointers()[0])?;
            print_directory_block(&block, ls);
        }
    }

    if let Some(&blk) = matches.get_one::<u32>("block") {
        inspect_block(fs, jindex, blk, ls)?;
    }

    if let Some(&ino) = matches.get_one::<u32>("inode-to-block") {
        if ino == 0 || ino > fs.superblock.inodes_count() {
            println!(
                "inode {} is out of range; there are only {} inodes",
                ino,
                fs.superblock.inodes_count()
            );
        } else {
            let block = fs.inode_to_block(ino);
            let offset =
                (ino - fs.block_to_inode(block)) as usize * fs.superblock.inode_size();
            println!(
                "Inode {} resides in block {} at offset 0x{:x}.",
                ino, block, offset
            );
        }
    }

    if let Some(&jblk) = matches.get_one::<u32>("journal-block") {
        let real = jindex.journal_block_to_fs_block(fs, jblk)?;
        println!("Journal block {} is filesystem block {}.", jblk, real);
    }

    if let Some(&seq) = matches.get_one::<u32>("journal-transaction") {
        print_transaction(jindex, seq);
    }

    if let Some(&ino) = matches.get_one::<u32>("show-journal-inodes") {
        let copies = journal_inode_copies(fs, jindex, ino)?;
        println!("Copies of inode {} found in the journal:", ino);
        for (sequence, copy) in copies {
            println!("--- sequence {} ---", sequence);
            println!("{}", copy.to_table());
        }
    }

    let needs_tree = matches.get_flag("dump-names")
        || matches.get_flag("restore-all")
        || matches.get_flag("show-hardlinks")
        || matches.get_one::<String>("restore-file").is_some();
    if !needs_tree {
        return Ok(());
    }

    let tree = match matches.get_one::<String>("locate-db") {
        Some(db_path) => {
            let locate = PathListDb::from_file(std::path::Path::new(db_path))?;
            DirectoryTree::load_or_build(fs, jindex, device, &locate)?
        }
        None => DirectoryTree::load_or_build(fs, jindex, device, &NoLocateDb)?,
    };

    if matches.get_flag("dump-names") && !matches.get_flag("restore-all") {
        for path in tree.all_paths() {
            if !path.is_empty() {
                println!("{}", path);
            }
        }
    }
    if let Some(path) = matches.get_one::<String>("restore-file") {
        let mut restorer = Restorer::new(fs, jindex, &tree);
        restorer.restore_path(path)?;
    }
    if matches.get_flag("restore-all") {
        let mut restorer = Restorer::new(fs, jindex, &tree);
        restorer.restore_all()?;
    }
    if matches.get_flag("show-hardlinks") {
        for (inode, paths) in tree.hardlinks() {
            println!("Inode {}:", inode);
            for path in paths {
                println!("  {}", path);
            }
        }
    }
    Ok(())
}

fn inspect_block(
    fs: &mut Ext3Fs<File>,
    jindex: &JournalIndex,
    blk: u32,
    ls: bool,
) -> ext3rescue::Result<()> {
    let buf = fs.read_block(blk)?;
    let group = fs.block_to_group(blk);
    println!("Group: {}", group);

    let kind = fs.dir_classifier().classify(&buf, blk, false, true, 0);
    if kind != DirBlockKind::No {
        let allocated = fs.is_block_allocated(blk)?;
        let state = if jindex.is_journal(blk) {
            "a Journal block"
        } else if allocated {
            "Allocated"
        } else {
            "Unallocated"
        };
        println!("Block {} is a directory. The block is {}.", blk, state);
        let decoded = fs.decode_directory_block(&buf, blk)?;
        print_directory_block(&decoded, ls);
        return Ok(());
    }

    if fs.is_inode_block(blk) {
        let first = fs.block_to_inode(blk);
        let per_block = fs.superblock.block_size() / fs.superblock.inode_size();
        println!(
            "Block {} is inside the inode table of group {} (inodes [{} - {}>).",
            blk,
            group,
            first,
            first + per_block as u32
        );
        return Ok(());
    }
    if jindex.is_journal(blk) {
        println!("Block {} belongs to the journal.", blk);
        if let Some(real) = jindex.journal_block_contains_inodes(fs, blk) {
            println!("It contains a copy of inode table block {}.", real);
        } else if let Some(d) = jindex.descriptor_in_journal(blk) {
            match &d.kind {
                DescriptorKind::Tag { fs_block, .. } => println!(
                    "It holds a copy of filesystem block {} (sequence {}).",
                    fs_block, d.sequence
                ),
                DescriptorKind::Revoke { blocks } => println!(
                    "It is a revoke block for {} blocks (sequence {}).",
                    blocks.len(),
                    d.sequence
                ),
                DescriptorKind::Commit => {
                    println!("It is a commit block (sequence {}).", d.sequence)
                }
            }
        }
        return Ok(());
    }
    if fs.is_block_allocated(blk)? {
        println!("Block {} is Allocated.", blk);
    } else {
        println!("Block {} is Unallocated.", blk);
    }
    Ok(())
}

fn print_directory_block(block: &DirectoryBlock, ls: bool) {
    if ls {
        println!("          .-- File type in dir_entry (r=regular file, d=directory, l=symlink)");
        println!("          |          .-- D: Deleted ; R: Reallocated ; Z: Zero inode");
        println!("Offset ft |  Inode   | File name");
    }
    for entry in &block.entries {
        if entry.flags.filtered && ls {
            continue;
        }
        let marker = if entry.flags.zero_inode {
            'Z'
        } else if entry.flags.reallocated {
            'R'
        } else if entry.flags.deleted {
            'D'
        } else {
            ' '
        };
        println!(
            "{:6} {}  {:8}  {} {}",
            entry.offset,
            file_type_char(entry.file_type),
            entry.inode,
            marker,
            entry.name
        );
    }
}

fn print_transaction(jindex: &JournalIndex, seq: u32) {
    match jindex.sequence_to_transaction.get(&seq) {
        Some(txn) => {
            let prev = jindex
                .sequence_to_transaction
                .range(..seq)
                .next_back()
                .map(|(&s, _)| s);
            let next = jindex
                .sequence_to_transaction
                .range(seq + 1..)
                .next()
                .map(|(&s, _)| s);
            match (prev, next) {
                (Some(p), Some(n)) => {
                    println!("Prev / Current / Next sequence numbers: {} {} {}", p, seq, n)
                }
                (Some(p), None) => println!("Prev / Current sequence numbers: {} {}", p, seq),
                (None, Some(n)) => println!("Current / Next sequence numbers: {} {}", seq, n),
                (None, None) => println!("Sequence number: {}", seq),
            }
            if !txn.committed {
                println!("Transaction was NOT COMMITTED!");
            }
            for &idx in &txn.descriptors {
                let d = jindex.descriptor(idx);
                match &d.kind {
                    DescriptorKind::Tag { fs_block, flags } => {
                        let mut line = format!("TAG: {}={}", d.jblock, fs_block);
                        if flags & ext3rescue::journal::JFS_FLAG_ESCAPE != 0 {
                            line.push_str(" (ESCAPED)");
                        }
                        if flags & ext3rescue::journal::JFS_FLAG_DELETED != 0 {
                            line.push_str(" (DELETED)");
                        }
                        println!("{}", line);
                    }
                    DescriptorKind::Revoke { blocks } => {
                        println!("REVOKE: {:?}", blocks);
                    }
                    DescriptorKind::Commit => println!("COMMIT"),
                }
            }
        }
        None => {
            println!(
                "There is no transaction in the journal with sequence number {}",
                seq
            );
            println!(
                "The sequence numbers found are in the range [{}, {}].",
                jindex.min_sequence, jindex.max_sequence
            );
            let prev = jindex
                .sequence_to_transaction
                .range(..seq)
                .next_back()
                .map(|(&s, _)| s);
            let next = jindex
                .sequence_to_transaction
                .range(seq..)
                .next()
                .map(|(&s, _)| s);
            match (prev, next) {
                (Some(p), Some(n)) => println!("Prev / Next sequence numbers: {} {}", p, n),
                (Some(p), None) => println!("Prev sequence number: {}", p),
                (None, Some(n)) => println!("Next sequence number: {}", n),
                (None, None) => {}
            }
        }
    }
}
