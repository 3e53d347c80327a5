use crate::entry::Entry;
use crate::pack::{Callback, EntryOptions, PackFile, PackFileState, Result};

struct Dummy(PackFileState);

impl PackFile for Dummy {
    fn state(&self) -> &PackFileState {
        &self.0
    }
    fn state_mut(&mut self) -> &mut PackFileState {
        &mut self.0
    }
    fn read_entry(&self, _entry: &Entry) -> Option<Vec<u8>> {
        None
    }
    fn bake(&mut self, _output_dir: &str, _callback: Callback) -> Result<bool> {
        Ok(false)
    }
    fn add_entry_internal(
        &mut self,
        _filename: &str,
        _buffer: &mut Vec<u8>,
        _options: EntryOptions,
    ) -> (String, usize) {
        (String::new(), 0)
    }
}

#[test]
fn bake_output_dir_defaults_to_parent() {
    let dummy = Dummy(PackFileState {
        full_file_path: "/tmp/packs/thing_dir.vpk".to_string(),
        ..Default::default()
    });

    assert_eq!(dummy.get_bake_output_dir(""), "/tmp/packs");
    assert_eq!(dummy.get_bake_output_dir("/elsewhere"), "/elsewhere");
    assert_eq!(dummy.get_filename(), "thing_dir.vpk");
    assert_eq!(dummy.get_filestem(), "thing_dir");
}

#[test]
fn bake_output_dir_falls_back_to_dot_with_no_parent() {
    let dummy = Dummy(PackFileState {
        full_file_path: "thing_dir.vpk".to_string(),
        ..Default::default()
    });

    assert_eq!(dummy.get_bake_output_dir(""), ".");
}

#[test]
fn read_only_backend_rejects_mutation() {
    struct ReadOnlyDummy(PackFileState);
    impl PackFile for ReadOnlyDummy {
        fn state(&self) -> &PackFileState {
            &self.0
        }
        fn state_mut(&mut self) -> &mut PackFileState {
            &mut self.0
        }
        fn read_entry(&self, _entry: &Entry) -> Option<Vec<u8>> {
            None
        }
        fn bake(&mut self, _output_dir: &str, _callback: Callback) -> Result<bool> {
            Ok(false)
        }
        fn add_entry_internal(
            &mut self,
            _filename: &str,
            _buffer: &mut Vec<u8>,
            _options: EntryOptions,
        ) -> (String, usize) {
            (String::new(), 0)
        }
        fn is_read_only(&self) -> bool {
            true
        }
    }

    let mut dummy = ReadOnlyDummy(PackFileState::default());
    dummy.add_entry("a.txt", b"hello".to_vec(), EntryOptions::default());
    assert_eq!(dummy.get_entry_count(true), 0);
    assert!(!dummy.remove_entry("a.txt"));
}

#[test]
fn find_entry_respects_include_unbaked() {
    let mut dummy = Dummy(PackFileState::default());
    dummy.add_entry("mat/a.txt", b"hello".to_vec(), EntryOptions::default());

    assert!(dummy.find_entry("mat/a.txt", true).is_some());
    assert!(dummy.find_entry("mat/a.txt", false).is_none());
}

#[test]
fn remove_entry_is_idempotent() {
    let mut dummy = Dummy(PackFileState::default());
    dummy.add_entry("mat/a.txt", b"hello".to_vec(), EntryOptions::default());

    assert!(dummy.remove_entry("mat/a.txt"));
    assert!(!dummy.remove_entry("mat/a.txt"));
    assert!(dummy.find_entry("mat/a.txt", true).is_none());
}

#[test]
fn merge_unbaked_entries_clears_staging() {
    let mut dummy = Dummy(PackFileState::default());
    dummy.add_entry("mat/a.txt", b"hello".to_vec(), EntryOptions::default());
    dummy.merge_unbaked_entries();

    assert!(dummy.get_unbaked_entries().is_empty());
    let found = dummy.find_entry("mat/a.txt", false).expect("merged entry should be baked");
    assert!(!found.is_unbaked());
}
