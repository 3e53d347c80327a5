//! The format-agnostic pack-file abstraction: the entry staging discipline, the dispatch-by-
//! extension registry, and the mutation API every concrete backend (here, VPK) implements on
//! top of.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use log::{debug, warn};

pub use error::{Error, Result};

use crate::entry::{Entry, UnbakedPayload};
use crate::path as pathutil;

mod error;

/// A map from parent directory to its ordered list of entries.
pub type EntryMap = HashMap<String, Vec<Entry>>;

/// Progress hook invoked once per entry while a tree is walked (open, add, or bake).
pub type Callback<'a> = Option<&'a dyn Fn(&str, &Entry)>;

/// Pack-file-wide configuration. Fields with a `vpk_` prefix are VPK-specific; this crate ships
/// only the VPK backend, so they live here directly rather than behind a second options type.
#[derive(Debug, Clone, Copy)]
pub struct PackFileOptions {
    pub allow_uppercase_letters_in_filenames: bool,
    pub vpk_version: u32,
    pub vpk_preferred_chunk_size: u32,
    pub vpk_generate_md5_entries: bool,
}

impl Default for PackFileOptions {
    fn default() -> Self {
        Self {
            allow_uppercase_letters_in_filenames: false,
            vpk_version: 1,
            vpk_preferred_chunk_size: 0,
            vpk_generate_md5_entries: false,
        }
    }
}

/// Per-entry options passed to `addEntry`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryOptions {
    pub vpk_save_to_directory: bool,
    pub vpk_preload_bytes: u32,
}

/// The state every `PackFile` implementation shares: path, options, and the baked/unbaked
/// staging maps.
#[derive(Debug, Clone, Default)]
pub struct PackFileState {
    pub full_file_path: String,
    pub options: PackFileOptions,
    pub entries: EntryMap,
    pub unbaked_entries: EntryMap,
    pub num_archives: usize,
    pub currently_filled_chunk_size: u32,
}

/// The capability interface every concrete pack-file backend implements. Modeled after a
/// virtual base class: `state`/`state_mut` stand in for the fields a C++ base class would hold
/// directly, and every other method has a default implementation built on top of them except the
/// handful that are genuinely format-specific.
pub trait PackFile {
    fn state(&self) -> &PackFileState;
    fn state_mut(&mut self) -> &mut PackFileState;

    /// Returns the raw bytes an entry refers to, or `None` on I/O failure.
    fn read_entry(&self, entry: &Entry) -> Option<Vec<u8>>;

    /// Serializes staged and existing entries to `output_dir` (or the pack's current directory
    /// if empty), promoting unbaked entries to baked ones. Returns `false` if the backend is
    /// read-only or the bake fails.
    fn bake(&mut self, output_dir: &str, callback: Callback) -> Result<bool>;

    /// Backend-specific half of `addEntry`: assigns checksum/length/archive placement, strips
    /// any preload window from `buffer` in place, stages the entry, and returns `(dir, index)`
    /// identifying its slot in `unbaked_entries` so the caller can attach the final payload.
    fn add_entry_internal(
        &mut self,
        filename: &str,
        buffer: &mut Vec<u8>,
        options: EntryOptions,
    ) -> (String, usize);

    /// Whether this backend accepts mutation. Mutators on a read-only backend silently no-op.
    /// Default `false`; a future read-only backend overrides this instead of this crate carrying
    /// an unused `PackFileReadOnly` type for a backend that does not exist yet.
    fn is_read_only(&self) -> bool {
        false
    }

    fn verify_entry_checksums(&self) -> Vec<String> {
        Vec::new()
    }

    fn verify_file_checksum(&self) -> bool {
        true
    }

    fn get_truncated_filestem(&self) -> String {
        self.get_filestem()
    }

    fn get_filepath(&self) -> String {
        self.state().full_file_path.clone()
    }

    fn get_filename(&self) -> String {
        Path::new(&self.state().full_file_path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string()
    }

    fn get_filestem(&self) -> String {
        Path::new(&self.state().full_file_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string()
    }

    fn get_truncated_filepath(&self) -> String {
        let parent = Path::new(&self.state().full_file_path)
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or_default();
        if parent.is_empty() {
            self.get_truncated_filestem()
        } else {
            format!("{parent}/{}", self.get_truncated_filestem())
        }
    }

    fn get_truncated_filename(&self) -> String {
        let extension = Path::new(&self.state().full_file_path)
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if extension.is_empty() {
            self.get_truncated_filestem()
        } else {
            format!("{}.{extension}", self.get_truncated_filestem())
        }
    }

    /// Resolves the directory a `bake` call should write into.
    fn get_bake_output_dir(&self, output_dir: &str) -> String {
        if !output_dir.is_empty() {
            return pathutil::normalize_slashes(output_dir);
        }
        let path = &self.state().full_file_path;
        match path.rfind('/') {
            Some(i) => path[..i].to_string(),
            None => ".".to_string(),
        }
    }

    fn find_entry(&self, filename: &str, include_unbaked: bool) -> Option<Entry> {
        let normalized = pathutil::normalize(
            filename,
            self.state().options.allow_uppercase_letters_in_filenames,
        );
        let (dir, _) = pathutil::split_filename_and_parent_dir(&normalized);

        if let Some(list) = self.state().entries.get(&dir)
            && let Some(found) = list.iter().find(|e| e.path == normalized)
        {
            return Some(found.clone());
        }
        if include_unbaked {
            if let Some(list) = self.state().unbaked_entries.get(&dir)
                && let Some(found) = list.iter().find(|e| e.path == normalized)
            {
                return Some(found.clone());
            }
        }
        None
    }

    fn read_entry_text(&self, entry: &Entry) -> Option<String> {
        let bytes = self.read_entry(entry)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8(bytes[..end].to_vec()).ok()
    }

    /// Stages a new entry whose content is an owned buffer.
    fn add_entry(&mut self, filename: &str, mut buffer: Vec<u8>, options: EntryOptions) {
        if self.is_read_only() {
            warn!("addEntry({filename}) ignored: pack file is read-only");
            return;
        }
        let (dir, index) = self.add_entry_internal(filename, &mut buffer, options);
        if let Some(entry) = self
            .state_mut()
            .unbaked_entries
            .get_mut(&dir)
            .and_then(|list| list.get_mut(index))
        {
            entry.unbaked_data = Some(UnbakedPayload::Buffer(buffer));
        }
    }

    /// Stages a new entry whose content is read lazily from a filesystem path at bake time.
    /// The file is still read once eagerly here to compute its checksum/length/preload split,
    /// mirroring the source's "read now, keep only the path string" pattern.
    fn add_entry_from_file(
        &mut self,
        filename: &str,
        path_to_file: &str,
        options: EntryOptions,
    ) -> std::io::Result<()> {
        if self.is_read_only() {
            warn!("addEntry({filename}) ignored: pack file is read-only");
            return Ok(());
        }
        let mut buffer = std::fs::read(path_to_file)?;
        let (dir, index) = self.add_entry_internal(filename, &mut buffer, options);
        if let Some(entry) = self
            .state_mut()
            .unbaked_entries
            .get_mut(&dir)
            .and_then(|list| list.get_mut(index))
        {
            entry.unbaked_data = Some(UnbakedPayload::FilePath(path_to_file.into()));
        }
        Ok(())
    }

    fn remove_entry(&mut self, filename: &str) -> bool {
        if self.is_read_only() {
            return false;
        }
        let normalized = pathutil::normalize(
            filename,
            self.state().options.allow_uppercase_letters_in_filenames,
        );
        let (dir, _) = pathutil::split_filename_and_parent_dir(&normalized);

        if let Some(list) = self.state_mut().unbaked_entries.get_mut(&dir)
            && let Some(pos) = list.iter().position(|e| e.path == normalized)
        {
            list.remove(pos);
            return true;
        }
        if let Some(list) = self.state_mut().entries.get_mut(&dir)
            && let Some(pos) = list.iter().position(|e| e.path == normalized)
        {
            list.remove(pos);
            return true;
        }
        false
    }

    fn merge_unbaked_entries(&mut self) {
        let state = self.state_mut();
        for (dir, unbaked) in state.unbaked_entries.drain() {
            let target = state.entries.entry(dir).or_default();
            for mut entry in unbaked {
                entry.unbaked_data = None;
                target.push(entry);
            }
        }
    }

    fn get_baked_entries(&self) -> &EntryMap {
        &self.state().entries
    }

    fn get_unbaked_entries(&self) -> &EntryMap {
        &self.state().unbaked_entries
    }

    fn get_entry_count(&self, include_unbaked: bool) -> usize {
        let mut count: usize = self.state().entries.values().map(Vec::len).sum();
        if include_unbaked {
            count += self
                .state()
                .unbaked_entries
                .values()
                .map(Vec::len)
                .sum::<usize>();
        }
        count
    }

    /// A blank entry, as handed to `addEntryInternal` before the backend fills it in.
    fn create_new_entry(&self) -> Entry {
        Entry::new()
    }
}

type OpenFactory = fn(&str, PackFileOptions, Callback) -> Result<Box<dyn PackFile>>;

static EXTENSION_REGISTRY: OnceLock<Mutex<HashMap<String, OpenFactory>>> = OnceLock::new();
static BACKENDS_INITIALIZED: OnceLock<()> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, OpenFactory>> {
    EXTENSION_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a backend's `open` factory for a file extension (including the leading dot).
/// Later registrations for the same extension win, matching the plain-map-assignment semantics
/// of the source's static registration.
pub fn register_extension(extension: &str, factory: OpenFactory) {
    registry()
        .lock()
        .unwrap()
        .insert(extension.to_ascii_lowercase(), factory);
}

/// Registers every backend this crate ships. Idempotent and safe to call more than once or from
/// multiple threads; real registration happens exactly once.
pub fn init_backends() {
    BACKENDS_INITIALIZED.get_or_init(|| {
        register_extension(crate::vpk::VPK_EXTENSION, crate::vpk::Vpk::open_dyn);
    });
}

/// Opens `path` by dispatching on its extension through the registry. Returns
/// [`Error::NotFound`] if no backend is registered for that extension.
pub fn open(path: &str, options: PackFileOptions, callback: Callback) -> Result<Box<dyn PackFile>> {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();

    let factory = {
        let registry = registry().lock().unwrap();
        *registry
            .get(&extension)
            .ok_or_else(|| Error::NotFound(path.to_string()))?
    };

    debug!("dispatching open({path}) to backend for extension {extension:?}");
    factory(path, options, callback)
}

/// The extensions currently registered, in no particular order.
pub fn get_supported_file_types() -> Vec<String> {
    registry().lock().unwrap().keys().cloned().collect()
}
