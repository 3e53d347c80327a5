use std::fs;
use std::path::Path;

use crate::entry::VPK_DIR_INDEX;
use crate::pack::{EntryOptions, PackFile, PackFileOptions};
use crate::vpk::Vpk;

fn temp_dir_path(name: &str) -> std::path::PathBuf {
    let dir = tempfile::tempdir().expect("tempdir").keep();
    dir.join(name)
}

/// An empty v1 pack is 13 bytes on disk (12-byte header plus 1 tree-terminating NUL) and
/// reopens with zero entries.
#[test]
fn empty_v1_round_trip() {
    let dir_path = temp_dir_path("e_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions {
        vpk_version: 1,
        ..Default::default()
    });

    let baked = pack.bake("", None).expect("bake should succeed");
    assert!(baked);

    let metadata = fs::metadata(&dir_path).expect("baked file should exist");
    assert_eq!(metadata.len(), 13);

    let reopened = Vpk::open(dir_path.to_str().unwrap(), PackFileOptions::default(), None)
        .expect("reopen should succeed");
    assert_eq!(reopened.get_version(), 1);
    assert_eq!(reopened.get_entry_count(true), 0);
}

/// A single entry pinned to the directory file round-trips its bytes and metadata exactly.
#[test]
fn single_dir_stored_entry_round_trips() {
    let dir_path = temp_dir_path("s2_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions::default());

    pack.add_entry(
        "mat/a.txt",
        b"hello".to_vec(),
        EntryOptions {
            vpk_save_to_directory: true,
            vpk_preload_bytes: 0,
        },
    );
    assert!(pack.bake("", None).unwrap());

    let reopened = Vpk::open(dir_path.to_str().unwrap(), PackFileOptions::default(), None).unwrap();
    let entry = reopened
        .find_entry("mat/a.txt", false)
        .expect("entry should be found after reopen");

    assert_eq!(entry.length, 5);
    assert_eq!(entry.preloaded_data.len(), 0);
    assert_eq!(entry.archive_index, VPK_DIR_INDEX);
    assert_eq!(entry.crc32, crate::checksum::crc32(b"hello"));
    assert_eq!(entry.offset, 0);

    assert_eq!(reopened.read_entry(&entry).unwrap(), b"hello");
}

/// An entry whose preload window covers its whole body has no tail at all.
#[test]
fn preload_only_entry_has_no_tail() {
    let dir_path = temp_dir_path("s3_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions {
        vpk_version: 2,
        ..Default::default()
    });

    pack.add_entry(
        "mat/a.txt",
        b"hello".to_vec(),
        EntryOptions {
            vpk_save_to_directory: true,
            vpk_preload_bytes: 5,
        },
    );
    assert!(pack.bake("", None).unwrap());

    let reopened = Vpk::open(dir_path.to_str().unwrap(), PackFileOptions::default(), None).unwrap();
    let entry = reopened.find_entry("mat/a.txt", false).unwrap();

    assert_eq!(entry.preloaded_data, b"hello");
    assert_eq!(entry.length, 5);
    assert_eq!(entry.archive_index, VPK_DIR_INDEX);
    assert_eq!(reopened.read_entry(&entry).unwrap(), b"hello");
}

/// Chunked numbered archives roll over once the running tail size passes the preferred
/// chunk size, and the resulting sibling files hold the right bytes.
#[test]
fn chunk_rollover_splits_across_numbered_archives() {
    let dir_path = temp_dir_path("s4_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions {
        vpk_preferred_chunk_size: 10,
        ..Default::default()
    });

    for (name, content) in [
        ("a.bin", b"AAAAAA".to_vec()),
        ("b.bin", b"BBBBBB".to_vec()),
        ("c.bin", b"CCCCCC".to_vec()),
    ] {
        pack.add_entry(
            name,
            content,
            EntryOptions {
                vpk_save_to_directory: false,
                vpk_preload_bytes: 0,
            },
        );
    }

    assert!(pack.bake("", None).unwrap());

    let reopened = Vpk::open(dir_path.to_str().unwrap(), PackFileOptions::default(), None).unwrap();
    let a = reopened.find_entry("a.bin", false).unwrap();
    let b = reopened.find_entry("b.bin", false).unwrap();
    let c = reopened.find_entry("c.bin", false).unwrap();

    assert_eq!(a.archive_index, 0);
    assert_eq!(b.archive_index, 0);
    assert_eq!(c.archive_index, 1);

    let base_dir = dir_path.parent().unwrap();
    let stem = "s4";
    let archive_000 = base_dir.join(format!("{stem}_000.vpk"));
    let archive_001 = base_dir.join(format!("{stem}_001.vpk"));
    assert_eq!(fs::metadata(&archive_000).unwrap().len(), 12);
    assert_eq!(fs::metadata(&archive_001).unwrap().len(), 6);

    assert_eq!(reopened.read_entry(&a).unwrap(), b"AAAAAA");
    assert_eq!(reopened.read_entry(&b).unwrap(), b"BBBBBB");
    assert_eq!(reopened.read_entry(&c).unwrap(), b"CCCCCC");
}

/// v2 MD5 accounting produces one archive MD5 entry per baked entry and a matching
/// `md5EntriesChecksum` footer.
#[test]
fn v2_generates_md5_entries_and_passes_whole_file_verification() {
    let dir_path = temp_dir_path("s5_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions {
        vpk_version: 2,
        vpk_generate_md5_entries: true,
        ..Default::default()
    });

    pack.add_entry(
        "mat/a.txt",
        b"hello world".to_vec(),
        EntryOptions {
            vpk_save_to_directory: true,
            vpk_preload_bytes: 0,
        },
    );
    assert!(pack.bake("", None).unwrap());
    assert!(pack.verify_file_checksum());
    assert!(pack.verify_entry_checksums().is_empty());

    let reopened = Vpk::open(dir_path.to_str().unwrap(), PackFileOptions::default(), None).unwrap();
    assert!(reopened.verify_file_checksum());
}

/// A Respawn-family (or any other unsupported) VPK version is rejected outright.
#[test]
fn unsupported_version_is_rejected() {
    let path = temp_dir_path("respawn_dir.vpk");
    let mut header = Vec::new();
    header.extend_from_slice(&0x55AA_1234u32.to_le_bytes());
    header.extend_from_slice(&3u32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    fs::write(&path, header).unwrap();

    let result = Vpk::open(path.to_str().unwrap(), PackFileOptions::default(), None);
    assert!(result.is_err());
}

/// A bad signature is also rejected, independent of the version check.
#[test]
fn bad_signature_is_rejected() {
    let path = temp_dir_path("bad_sig_dir.vpk");
    let mut header = Vec::new();
    header.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    header.extend_from_slice(&1u32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    fs::write(&path, header).unwrap();

    let result = Vpk::open(path.to_str().unwrap(), PackFileOptions::default(), None);
    assert!(result.is_err());
}

/// Building straight from a loose-file directory tree produces one entry per file, each
/// of which reads back byte-identical after bake.
#[test]
fn create_from_directory_ingests_every_file() {
    let root = tempfile::tempdir().unwrap().keep();
    fs::create_dir_all(root.join("nested")).unwrap();
    fs::write(root.join("top.txt"), b"top level").unwrap();
    fs::write(root.join("nested/deep.txt"), b"nested file").unwrap();
    fs::write(root.join("nested/other.bin"), b"\x01\x02\x03").unwrap();

    let vpk_path = root.join("out_dir.vpk");
    let pack = Vpk::create_from_directory(
        vpk_path.to_str().unwrap(),
        root.to_str().unwrap(),
        true,
        PackFileOptions::default(),
        None,
    )
    .expect("directory ingestion should succeed");

    assert_eq!(pack.get_entry_count(true), 3);

    let reopened = Vpk::open(vpk_path.to_str().unwrap(), PackFileOptions::default(), None).unwrap();
    let top = reopened.find_entry("top.txt", false).unwrap();
    let nested = reopened.find_entry("nested/deep.txt", false).unwrap();
    let other = reopened.find_entry("nested/other.bin", false).unwrap();

    assert_eq!(reopened.read_entry(&top).unwrap(), b"top level");
    assert_eq!(reopened.read_entry(&nested).unwrap(), b"nested file");
    assert_eq!(reopened.read_entry(&other).unwrap(), b"\x01\x02\x03");
}

/// Staging isolation: an unbaked add is visible to `findEntry(.., true)` but not `(.., false)`,
/// and doesn't touch the file on disk until `bake`.
#[test]
fn staged_entry_is_isolated_until_baked() {
    let dir_path = temp_dir_path("staging_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions::default());
    assert!(pack.bake("", None).unwrap());
    let size_before = fs::metadata(&dir_path).unwrap().len();

    pack.add_entry("a.txt", b"hello".to_vec(), EntryOptions::default());

    assert!(pack.find_entry("a.txt", true).is_some());
    assert!(pack.find_entry("a.txt", false).is_none());
    assert_eq!(fs::metadata(&dir_path).unwrap().len(), size_before);
}

/// Directory-form autodiscovery: opening a missing numbered archive by name falls back to the
/// sibling `_dir.vpk`.
#[test]
fn opening_numbered_archive_falls_back_to_directory_file() {
    let dir_path = temp_dir_path("auto_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions::default());
    pack.add_entry(
        "a.txt",
        b"hello".to_vec(),
        EntryOptions {
            vpk_save_to_directory: true,
            vpk_preload_bytes: 0,
        },
    );
    assert!(pack.bake("", None).unwrap());

    let numbered_path = dir_path.with_file_name("auto_000.vpk");
    let opened = Vpk::open(numbered_path.to_str().unwrap(), PackFileOptions::default(), None)
        .expect("should fall back to the directory file");
    assert!(opened.find_entry("a.txt", false).is_some());
}

/// Sentinel handling: a root-level file with no extension lands in `entries[""]` with a path
/// that carries neither a leading slash nor a `.` suffix.
#[test]
fn root_file_without_extension_uses_sentinels() {
    let dir_path = temp_dir_path("sentinel_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions::default());
    pack.add_entry(
        "noext",
        b"data".to_vec(),
        EntryOptions {
            vpk_save_to_directory: true,
            vpk_preload_bytes: 0,
        },
    );
    assert!(pack.bake("", None).unwrap());

    let reopened = Vpk::open(dir_path.to_str().unwrap(), PackFileOptions::default(), None).unwrap();
    assert!(reopened.get_baked_entries().contains_key(""));
    let entry = reopened.find_entry("noext", false).unwrap();
    assert!(!entry.path.contains('.'));
    assert!(!entry.path.starts_with('/'));
}

/// Removal idempotence on the concrete VPK backend: the second `removeEntry` call is a no-op.
#[test]
fn remove_entry_twice_on_vpk() {
    let dir_path = temp_dir_path("remove_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions::default());
    pack.add_entry("a.txt", b"hello".to_vec(), EntryOptions::default());

    assert!(pack.remove_entry("a.txt"));
    assert!(!pack.remove_entry("a.txt"));
    assert!(pack.find_entry("a.txt", true).is_none());
}

/// Baking into a different output directory copies numbered archives alongside the new
/// directory file rather than leaving them behind.
#[test]
fn bake_to_new_directory_copies_numbered_archives() {
    let dir_path = temp_dir_path("move_dir.vpk");
    let mut pack = Vpk::create_empty(dir_path.to_str().unwrap(), PackFileOptions::default());
    pack.add_entry(
        "a.bin",
        b"AAAAAA".to_vec(),
        EntryOptions {
            vpk_save_to_directory: false,
            vpk_preload_bytes: 0,
        },
    );
    assert!(pack.bake("", None).unwrap());

    let new_output = tempfile::tempdir().unwrap().keep();
    assert!(pack.bake(new_output.to_str().unwrap(), None).unwrap());

    assert!(new_output.join("move_000.vpk").exists());
    let reopened = Vpk::open(
        Path::new(&pack.get_filepath()).to_str().unwrap(),
        PackFileOptions::default(),
        None,
    )
    .unwrap();
    let entry = reopened.find_entry("a.bin", false).unwrap();
    assert_eq!(reopened.read_entry(&entry).unwrap(), b"AAAAAA");
}
