//! The VPK v1/v2 pack-file engine: open/parse, staged `addEntry`, `readEntry`, and the `bake`
//! serializer, plus the directory-ingestion helpers that build a VPK from a loose-file tree.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::checksum::{self, Md5Accumulator};
use crate::entry::{Entry, UnbakedPayload, VPK_DIR_INDEX, VPK_MAX_PRELOAD_BYTES};
use crate::pack::{Callback, EntryMap, EntryOptions, Error, PackFile, PackFileOptions, PackFileState, Result};
use crate::path as pathutil;
use crate::util::file::{VPKFileReader, VPKFileWriter};

/// The extension this backend registers itself under.
pub const VPK_EXTENSION: &str = ".vpk";

const VPK_DIR_SUFFIX: &str = "_dir";
const VPK_SIGNATURE: u32 = 0x55AA_1234;
const VPK_ENTRY_TERMINATOR: u16 = 0xFFFF;
const HEADER1_LEN: u64 = 12;
const HEADER2_LEN: u64 = 16;
const MD5_ENTRY_LEN: u64 = 28;
const OTHER_MD5_SECTION_LEN: u32 = 48;
const CS2_BETA_SIGNATURE_SECTION_SIZE: u32 = 20;

fn wrap_util(context: &'static str) -> impl Fn(crate::util::Error) -> Error {
    move |source| Error::Util {
        source,
        context: context.to_string(),
    }
}

/// Reads a fixed 16-byte checksum, failing instead of panicking if the file is truncated and
/// `read_bytes` comes back short.
fn read_checksum16(file: &mut File, context: &'static str) -> Result<[u8; 16]> {
    let bytes = file.read_bytes(16).map_err(wrap_util(context))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| Error::InvalidMd5Section(format!("{context}: expected 16 bytes, got {len}")))
}

/// The first 12 bytes of every VPK, present in both versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header1 {
    pub signature: u32,
    pub version: u32,
    pub tree_size: u32,
}

impl Header1 {
    fn read(file: &mut File) -> Result<Self> {
        Ok(Self {
            signature: file.read_u32().map_err(wrap_util("signature"))?,
            version: file.read_u32().map_err(wrap_util("version"))?,
            tree_size: file.read_u32().map_err(wrap_util("tree size"))?,
        })
    }

    fn write(&self, file: &mut File) -> Result<()> {
        file.write_u32(self.signature).map_err(wrap_util("signature"))?;
        file.write_u32(self.version).map_err(wrap_util("version"))?;
        file.write_u32(self.tree_size).map_err(wrap_util("tree size"))?;
        Ok(())
    }

    fn to_le_bytes(self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.signature.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tree_size.to_le_bytes());
        buf
    }
}

/// The 16 bytes following `Header1` in a version-2 VPK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header2 {
    pub file_data_section_size: u32,
    pub archive_md5_section_size: u32,
    pub other_md5_section_size: u32,
    pub signature_section_size: u32,
}

impl Header2 {
    fn read(file: &mut File) -> Result<Self> {
        Ok(Self {
            file_data_section_size: file.read_u32().map_err(wrap_util("file data section size"))?,
            archive_md5_section_size: file
                .read_u32()
                .map_err(wrap_util("archive md5 section size"))?,
            other_md5_section_size: file.read_u32().map_err(wrap_util("other md5 section size"))?,
            signature_section_size: file
                .read_u32()
                .map_err(wrap_util("signature section size"))?,
        })
    }

    fn write(&self, file: &mut File) -> Result<()> {
        file.write_u32(self.file_data_section_size)
            .map_err(wrap_util("file data section size"))?;
        file.write_u32(self.archive_md5_section_size)
            .map_err(wrap_util("archive md5 section size"))?;
        file.write_u32(self.other_md5_section_size)
            .map_err(wrap_util("other md5 section size"))?;
        file.write_u32(self.signature_section_size)
            .map_err(wrap_util("signature section size"))?;
        Ok(())
    }

    fn to_le_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&self.file_data_section_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.archive_md5_section_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.other_md5_section_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.signature_section_size.to_le_bytes());
        buf
    }
}

/// The trailing checksum section of a version-2 VPK, and the optional Valve signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Footer2 {
    pub tree_checksum: [u8; 16],
    pub md5_entries_checksum: [u8; 16],
    pub whole_file_checksum: [u8; 16],
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// One record of the version-2 archive MD5 section. 28 bytes packed, not 24 (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Md5Entry {
    pub archive_index: u32,
    pub offset: u32,
    pub length: u32,
    pub checksum: [u8; 16],
}

impl Md5Entry {
    fn read(file: &mut File) -> Result<Self> {
        Ok(Self {
            archive_index: file.read_u32().map_err(wrap_util("md5 entry archive index"))?,
            offset: file.read_u32().map_err(wrap_util("md5 entry offset"))?,
            length: file.read_u32().map_err(wrap_util("md5 entry length"))?,
            checksum: read_checksum16(file, "md5 entry checksum")?,
        })
    }

    fn write(&self, file: &mut File) -> Result<()> {
        file.write_u32(self.archive_index)
            .map_err(wrap_util("md5 entry archive index"))?;
        file.write_u32(self.offset).map_err(wrap_util("md5 entry offset"))?;
        file.write_u32(self.length).map_err(wrap_util("md5 entry length"))?;
        file.write_bytes(&self.checksum)
            .map_err(wrap_util("md5 entry checksum"))?;
        Ok(())
    }

    fn to_le_bytes(self) -> [u8; 28] {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&self.archive_index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..28].copy_from_slice(&self.checksum);
        buf
    }
}

/// The VPK v1/v2 backend. One type models both versions, branching on `header1.version`, the
/// same way the format's own original implementation does.
pub struct Vpk {
    state: PackFileState,
    header1: Header1,
    header2: Header2,
    footer2: Footer2,
    md5_entries: Vec<Md5Entry>,
}

impl Vpk {
    /// Creates a fresh, empty directory VPK ready for `addEntry`/`bake`. `path` should end in
    /// `_dir.vpk`, though this is not enforced.
    #[must_use]
    pub fn create_empty(path: &str, options: PackFileOptions) -> Self {
        let version = options.vpk_version;
        Self {
            state: PackFileState {
                full_file_path: path.to_string(),
                options,
                entries: EntryMap::new(),
                unbaked_entries: EntryMap::new(),
                num_archives: 0,
                currently_filled_chunk_size: 0,
            },
            header1: Header1 {
                signature: VPK_SIGNATURE,
                version,
                tree_size: 0,
            },
            header2: Header2::default(),
            footer2: Footer2::default(),
            md5_entries: Vec::new(),
        }
    }

    /// Opens an existing directory VPK, retrying against `<stem>_dir.vpk` if `path` names a
    /// missing numbered archive directly.
    pub fn open(path: &str, options: PackFileOptions, callback: Callback) -> Result<Self> {
        let mut resolved = PathBuf::from(path);
        let mut file = match File::open(&resolved) {
            Ok(file) => file,
            Err(io_err) => match directory_form_fallback(path) {
                Some(dir_path) => {
                    resolved = PathBuf::from(&dir_path);
                    File::open(&resolved).map_err(|_| Error::NotFound(path.to_string()))?
                }
                None => return Err(Error::NotFound(format!("{path}: {io_err}"))),
            },
        };

        let header1 = Header1::read(&mut file)?;
        if header1.signature != VPK_SIGNATURE {
            return Err(Error::InvalidSignature(format!(
                "expected {VPK_SIGNATURE:#X} but found {:#X}",
                header1.signature
            )));
        }
        if header1.version != 1 && header1.version != 2 {
            return Err(Error::BadVersion(format!(
                "unsupported VPK version {} (only 1 and 2 are supported)",
                header1.version
            )));
        }

        let header2 = if header1.version == 2 {
            Header2::read(&mut file)?
        } else {
            Header2::default()
        };

        let mut vpk_options = options;
        vpk_options.vpk_version = header1.version;

        let header_length = if header1.version == 2 {
            HEADER1_LEN + HEADER2_LEN
        } else {
            HEADER1_LEN
        };

        let (entries, num_archives) = read_tree(&mut file, header1.tree_size, callback)?;

        let (footer2, md5_entries) = if header1.version == 2 {
            read_v2_tail(&mut file, &header2)?
        } else {
            (Footer2::default(), Vec::new())
        };
        let _ = header_length;

        debug!(
            "opened VPK v{} at {} ({} archives, {} dirs in tree)",
            header1.version,
            resolved.display(),
            num_archives,
            entries.len()
        );

        Ok(Self {
            state: PackFileState {
                full_file_path: resolved.to_string_lossy().into_owned(),
                options: vpk_options,
                entries,
                unbaked_entries: EntryMap::new(),
                num_archives,
                currently_filled_chunk_size: 0,
            },
            header1,
            header2,
            footer2,
            md5_entries,
        })
    }

    /// Type-erased factory registered against [`VPK_EXTENSION`] in the extension registry.
    pub fn open_dyn(path: &str, options: PackFileOptions, callback: Callback) -> Result<Box<dyn PackFile>> {
        Ok(Box::new(Self::open(path, options, callback)?))
    }

    /// Builds a fresh directory VPK from every regular file under `content_path`, one entry per
    /// file, using uniform `save_to_dir`/no-preload placement.
    pub fn create_from_directory(
        vpk_path: &str,
        content_path: &str,
        save_to_dir: bool,
        options: PackFileOptions,
        callback: Callback,
    ) -> Result<Self> {
        Self::create_from_directory_procedural(
            vpk_path,
            content_path,
            &|_| (save_to_dir, 0),
            options,
            callback,
        )
    }

    /// As [`Vpk::create_from_directory`], but `creation_callback(full_entry_path)` decides each
    /// entry's `(save_to_dir, preload_bytes)` individually.
    pub fn create_from_directory_procedural(
        vpk_path: &str,
        content_path: &str,
        creation_callback: &dyn Fn(&str) -> (bool, u32),
        options: PackFileOptions,
        callback: Callback,
    ) -> Result<Self> {
        let mut pack = Self::create_empty(vpk_path, options);
        for file_path in walk_files(Path::new(content_path))? {
            let relative = file_path.strip_prefix(content_path).unwrap_or(&file_path);
            let virtual_path = relative.to_string_lossy().replace('\\', "/");
            let (save_to_dir, preload_bytes) = creation_callback(&virtual_path);

            let file_path_str = file_path.to_str().ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{} is not valid UTF-8", file_path.display()),
                ))
            })?;

            pack.add_entry_from_file(
                &virtual_path,
                file_path_str,
                EntryOptions {
                    vpk_save_to_directory: save_to_dir,
                    vpk_preload_bytes: preload_bytes,
                },
            )
            .map_err(Error::Io)?;
        }

        pack.bake(vpk_path, callback)?;
        Ok(pack)
    }

    /// Returns 1 for v1, 2 for v2.
    #[must_use]
    pub fn get_version(&self) -> u32 {
        self.header1.version
    }

    /// Changes the version of the VPK. Valid values are 1 and 2.
    pub fn set_version(&mut self, version: u32) {
        self.header1.version = version;
        self.state.options.vpk_version = version;
    }

    fn header_length(&self) -> u64 {
        if self.header1.version == 2 {
            HEADER1_LEN + HEADER2_LEN
        } else {
            HEADER1_LEN
        }
    }

    fn find_unbaked_by_path(&self, path: &str) -> Option<&Entry> {
        self.state
            .unbaked_entries
            .values()
            .flatten()
            .find(|e| e.path == path)
    }

    fn numbered_archive_path(&self, base_dir: &str, archive_index: u16) -> PathBuf {
        Path::new(base_dir).join(format!(
            "{}_{archive_index:03}.vpk",
            self.get_truncated_filestem()
        ))
    }
}

fn directory_form_fallback(path: &str) -> Option<String> {
    let p = Path::new(path);
    let ext = p.extension()?.to_str()?;
    if ext != "vpk" {
        return None;
    }
    let stem = p.file_stem()?.to_str()?;
    if stem.len() < 4 {
        return None;
    }
    let suffix = &stem[stem.len() - 4..];
    let mut chars = suffix.chars();
    if chars.next() != Some('_') || !chars.clone().all(|c| c.is_ascii_digit()) || chars.count() != 3
    {
        return None;
    }
    let base = &stem[..stem.len() - 4];
    let dir_name = format!("{base}{VPK_DIR_SUFFIX}.vpk");
    match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            Some(parent.join(dir_name).to_string_lossy().into_owned())
        }
        _ => Some(dir_name),
    }
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn read_tree_string(file: &mut File) -> Result<String> {
    file.read_string().map_err(wrap_util("tree string"))
}

fn read_tree(file: &mut File, tree_size: u32, callback: Callback) -> Result<(EntryMap, usize)> {
    let mut entries: EntryMap = EntryMap::new();
    let mut max_archive_index: i64 = -1;
    let _ = tree_size; // loop termination is NUL-driven, per the on-disk format

    loop {
        let extension_raw = read_tree_string(file)?;
        if extension_raw.is_empty() {
            break;
        }
        let extension = if extension_raw == " " { String::new() } else { extension_raw };

        loop {
            let directory_raw = read_tree_string(file)?;
            if directory_raw.is_empty() {
                break;
            }
            let directory = if directory_raw == " " {
                String::new()
            } else {
                directory_raw
            };

            loop {
                let entry_name = read_tree_string(file)?;
                if entry_name.is_empty() {
                    break;
                }

                let crc32 = file.read_u32().map_err(wrap_util("crc"))?;
                let preload_size = file.read_u16().map_err(wrap_util("preload size"))?;
                let archive_index = file.read_u16().map_err(wrap_util("archive index"))?;
                let offset = file.read_u32().map_err(wrap_util("entry offset"))?;
                let mut length = file.read_u32().map_err(wrap_util("entry length"))?;
                let terminator = file.read_u16().map_err(wrap_util("terminator"))?;

                if terminator != VPK_ENTRY_TERMINATOR {
                    return Err(Error::InvalidTerminator(format!(
                        "expected {VPK_ENTRY_TERMINATOR:#X} but found {terminator:#X}"
                    )));
                }

                let preloaded_data = if preload_size > 0 {
                    file.read_bytes(preload_size as usize)
                        .map_err(wrap_util("preload data"))?
                } else {
                    Vec::new()
                };
                length += u32::from(preload_size);

                let path = match (directory.is_empty(), extension.is_empty()) {
                    (true, true) => entry_name.clone(),
                    (true, false) => format!("{entry_name}.{extension}"),
                    (false, true) => format!("{directory}/{entry_name}"),
                    (false, false) => format!("{directory}/{entry_name}.{extension}"),
                };

                if archive_index != VPK_DIR_INDEX {
                    max_archive_index = max_archive_index.max(i64::from(archive_index));
                }

                let entry = Entry {
                    path: path.clone(),
                    length,
                    crc32,
                    offset,
                    archive_index,
                    preloaded_data,
                    unbaked_data: None,
                };

                if let Some(cb) = callback {
                    cb(&directory, &entry);
                }

                entries.entry(directory.clone()).or_default().push(entry);
            }
        }
    }

    Ok((entries, (max_archive_index + 1) as usize))
}

fn read_v2_tail(file: &mut File, header2: &Header2) -> Result<(Footer2, Vec<Md5Entry>)> {
    file.seek(SeekFrom::Current(i64::from(header2.file_data_section_size)))
        .map_err(Error::Io)?;

    if header2.archive_md5_section_size as u64 % MD5_ENTRY_LEN != 0 {
        return Err(Error::InvalidMd5Section(format!(
            "archive MD5 section size {} is not a multiple of {MD5_ENTRY_LEN}",
            header2.archive_md5_section_size
        )));
    }
    let count = u64::from(header2.archive_md5_section_size) / MD5_ENTRY_LEN;
    let mut md5_entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        md5_entries.push(Md5Entry::read(file)?);
    }

    let mut footer2 = Footer2::default();
    if header2.other_md5_section_size != OTHER_MD5_SECTION_LEN {
        return Ok((footer2, md5_entries));
    }

    footer2.tree_checksum = read_checksum16(file, "tree checksum")?;
    footer2.md5_entries_checksum = read_checksum16(file, "md5 entries checksum")?;
    footer2.whole_file_checksum = read_checksum16(file, "whole file checksum")?;

    if header2.signature_section_size == 0 {
        return Ok((footer2, md5_entries));
    }

    let public_key_size = file.read_i32().map_err(wrap_util("public key size"))?;
    if header2.signature_section_size == CS2_BETA_SIGNATURE_SECTION_SIZE
        && public_key_size == VPK_SIGNATURE as i32
    {
        debug!("detected CS2-beta signature section variant, skipping");
        return Ok((footer2, md5_entries));
    }

    if public_key_size > 0 {
        footer2.public_key = file
            .read_bytes(public_key_size as usize)
            .map_err(wrap_util("public key"))?;
    }
    let signature_size = file.read_i32().map_err(wrap_util("signature size"))?;
    if signature_size > 0 {
        footer2.signature = file
            .read_bytes(signature_size as usize)
            .map_err(wrap_util("signature"))?;
    }

    Ok((footer2, md5_entries))
}

fn read_unbaked_tail(
    payload: Option<&UnbakedPayload>,
    preload_len: usize,
    tail_len: usize,
) -> Result<Vec<u8>> {
    match payload {
        Some(UnbakedPayload::Buffer(buf)) => Ok(buf.clone()),
        Some(UnbakedPayload::FilePath(path)) => {
            let mut file = File::open(path).map_err(Error::Io)?;
            file.seek(SeekFrom::Start(preload_len as u64)).map_err(Error::Io)?;
            file.read_bytes(tail_len).map_err(wrap_util("staged file body"))
        }
        None => Ok(Vec::new()),
    }
}

impl PackFile for Vpk {
    fn state(&self) -> &PackFileState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PackFileState {
        &mut self.state
    }

    fn read_entry(&self, entry: &Entry) -> Option<Vec<u8>> {
        let preload_len = entry.preloaded_data.len();
        let mut output = vec![0u8; entry.length as usize];
        output[..preload_len].copy_from_slice(&entry.preloaded_data);
        if entry.length as usize == preload_len {
            return Some(output);
        }

        let tail_len = entry.length as usize - preload_len;
        let base_dir = Path::new(&self.state.full_file_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(unbaked) = self.find_unbaked_by_path(&entry.path) {
            let tail = read_unbaked_tail(unbaked.unbaked_data.as_ref(), preload_len, tail_len).ok()?;
            if tail.len() != tail_len {
                return None;
            }
            output[preload_len..].copy_from_slice(&tail);
            return Some(output);
        }

        if entry.archive_index != VPK_DIR_INDEX {
            let path = self.numbered_archive_path(&base_dir, entry.archive_index);
            let mut file = File::open(path).ok()?;
            file.seek(SeekFrom::Start(u64::from(entry.offset))).ok()?;
            let tail = file.read_bytes(tail_len).ok()?;
            if tail.len() != tail_len {
                return None;
            }
            output[preload_len..].copy_from_slice(&tail);
        } else {
            let mut file = File::open(&self.state.full_file_path).ok()?;
            let base = self.header_length() + u64::from(self.header1.tree_size);
            file.seek(SeekFrom::Start(base + u64::from(entry.offset))).ok()?;
            let tail = file.read_bytes(tail_len).ok()?;
            if tail.len() != tail_len {
                return None;
            }
            output[preload_len..].copy_from_slice(&tail);
        }

        Some(output)
    }

    fn add_entry_internal(
        &mut self,
        filename: &str,
        buffer: &mut Vec<u8>,
        options: EntryOptions,
    ) -> (String, usize) {
        let normalized = pathutil::normalize(
            filename,
            self.state.options.allow_uppercase_letters_in_filenames,
        );
        let (dir, _) = pathutil::split_filename_and_parent_dir(&normalized);

        let crc32 = checksum::crc32(buffer);
        let length = buffer.len() as u32;

        let archive_index = if options.vpk_save_to_directory {
            VPK_DIR_INDEX
        } else {
            self.state.num_archives as u16
        };

        let preload_len = (options.vpk_preload_bytes as usize)
            .min(buffer.len())
            .min(VPK_MAX_PRELOAD_BYTES);
        let preloaded_data: Vec<u8> = buffer.drain(0..preload_len).collect();

        let offset = if options.vpk_save_to_directory {
            0
        } else {
            let offset = self.state.currently_filled_chunk_size;
            self.state.currently_filled_chunk_size += buffer.len() as u32;
            if self.state.options.vpk_preferred_chunk_size > 0
                && self.state.currently_filled_chunk_size > self.state.options.vpk_preferred_chunk_size
            {
                self.state.currently_filled_chunk_size = 0;
                self.state.num_archives += 1;
            }
            offset
        };

        debug!("staged entry {normalized} ({length} bytes, archive {archive_index})");

        let entry = Entry {
            path: normalized,
            length,
            crc32,
            offset,
            archive_index,
            preloaded_data,
            unbaked_data: None,
        };

        let list = self.state.unbaked_entries.entry(dir.clone()).or_default();
        list.push(entry);
        (dir, list.len() - 1)
    }

    fn bake(&mut self, output_dir: &str, callback: Callback) -> Result<bool> {
        if self.is_read_only() {
            return Ok(false);
        }

        let output_dir = self.get_bake_output_dir(output_dir);
        fs::create_dir_all(&output_dir).map_err(Error::Io)?;

        let filename = self.get_filename();
        let current_dir = Path::new(&self.state.full_file_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let is_v2 = self.header1.version == 2;
        let header_length = self.header_length();
        let truncated_filestem = self.get_truncated_filestem();

        // Step 2/3: gather every entry (baked and unbaked) into one owned working set, and
        // preserve the tail bytes of dir-stored baked entries before the directory file is
        // truncated out from under them.
        let mut all_entries: Vec<(String, bool, Entry)> = Vec::new();
        for (dir, list) in &self.state.entries {
            for entry in list {
                all_entries.push((dir.clone(), false, entry.clone()));
            }
        }
        for (dir, list) in &self.state.unbaked_entries {
            for entry in list {
                all_entries.push((dir.clone(), true, entry.clone()));
            }
        }

        let mut dir_vpk_entry_data: Vec<u8> = Vec::new();
        for (_, is_unbaked, entry) in &mut all_entries {
            if !*is_unbaked && entry.archive_index == VPK_DIR_INDEX && entry.tail_length() > 0 {
                let body = self.read_entry(entry).ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("could not re-read dir-stored entry {}", entry.path),
                    ))
                })?;
                let tail = &body[entry.preloaded_data.len()..];
                entry.offset = dir_vpk_entry_data.len() as u32;
                dir_vpk_entry_data.extend_from_slice(tail);
            }
        }

        // Step 4: copy numbered archives to the new location if it differs from the current one.
        // `num_archives` only counts chunks that have actually rolled over, so the archive
        // currently being filled (often the only one, when chunking is disabled) is not
        // reflected there; derive the real count from the entries themselves instead.
        if output_dir != current_dir {
            let archive_count = all_entries
                .iter()
                .filter(|(_, _, entry)| entry.archive_index != VPK_DIR_INDEX)
                .map(|(_, _, entry)| entry.archive_index as usize + 1)
                .max()
                .unwrap_or(0);
            for k in 0..archive_count {
                let src = self.numbered_archive_path(&current_dir, k as u16);
                let dst = self.numbered_archive_path(&output_dir, k as u16);
                if src == dst {
                    continue;
                }
                if src.exists() {
                    fs::copy(&src, &dst).map_err(Error::Io)?;
                }
            }
        }

        // Step 5: open the output directory file and write placeholder headers.
        let output_path = Path::new(&output_dir).join(&filename);
        let mut out_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&output_path)
            .map_err(Error::Io)?;

        self.header1.write(&mut out_file)?;
        if is_v2 {
            self.header2.write(&mut out_file)?;
        }

        // Step 6: write the tree, grouped extension -> directory -> entries. A BTreeMap keeps
        // the walk order deterministic across baked and staged entries alike.
        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<usize>>> = BTreeMap::new();
        for (i, (dir, _is_unbaked, entry)) in all_entries.iter().enumerate() {
            let (_, base) = pathutil::split_filename_and_parent_dir(&entry.path);
            let (_, ext) = pathutil::split_stem_and_extension(&base);
            let ext_key = if ext.is_empty() { " ".to_string() } else { ext };
            let dir_key = if dir.is_empty() { " ".to_string() } else { dir.clone() };
            grouped
                .entry(ext_key)
                .or_default()
                .entry(dir_key)
                .or_default()
                .push(i);
        }

        let mut archive_files: HashMap<u16, File> = HashMap::new();

        for (ext, dirs) in &grouped {
            out_file.write_string(ext).map_err(wrap_util("extension"))?;

            for (dir_key, indices) in dirs {
                out_file.write_string(dir_key).map_err(wrap_util("directory"))?;

                for &idx in indices {
                    {
                        let (_, is_unbaked, entry) = &mut all_entries[idx];
                        if *is_unbaked {
                            let preload_len = entry.preloaded_data.len();
                            let tail_len = entry.length as usize - preload_len;

                            if tail_len == 0 {
                                entry.archive_index = VPK_DIR_INDEX;
                                entry.offset = dir_vpk_entry_data.len() as u32;
                            } else if entry.archive_index != VPK_DIR_INDEX {
                                let tail_bytes = read_unbaked_tail(
                                    entry.unbaked_data.as_ref(),
                                    preload_len,
                                    tail_len,
                                )?;
                                let archive_index = entry.archive_index;
                                if !archive_files.contains_key(&archive_index) {
                                    let archive_path = Path::new(&output_dir).join(format!(
                                        "{truncated_filestem}_{archive_index:03}.vpk"
                                    ));
                                    let archive_file = OpenOptions::new()
                                        .create(true)
                                        .append(true)
                                        .open(&archive_path)
                                        .map_err(Error::Io)?;
                                    archive_files.insert(archive_index, archive_file);
                                }
                                let archive_file = archive_files.get_mut(&archive_index).unwrap();
                                let pre_len =
                                    archive_file.metadata().map_err(Error::Io)?.len();
                                archive_file.write_all(&tail_bytes).map_err(Error::Io)?;
                                entry.offset = pre_len as u32;
                            } else {
                                let tail_bytes = read_unbaked_tail(
                                    entry.unbaked_data.as_ref(),
                                    preload_len,
                                    tail_len,
                                )?;
                                entry.offset = dir_vpk_entry_data.len() as u32;
                                dir_vpk_entry_data.extend_from_slice(&tail_bytes);
                            }
                        }
                    }

                    let (dir, _is_unbaked, entry) = &all_entries[idx];
                    let (_, base) = pathutil::split_filename_and_parent_dir(&entry.path);
                    let (stem, _ext) = pathutil::split_stem_and_extension(&base);

                    out_file.write_string(&stem).map_err(wrap_util("entry name"))?;
                    out_file.write_u32(entry.crc32).map_err(wrap_util("crc"))?;
                    out_file
                        .write_u16(entry.preloaded_data.len() as u16)
                        .map_err(wrap_util("preload size"))?;
                    out_file
                        .write_u16(entry.archive_index)
                        .map_err(wrap_util("archive index"))?;
                    out_file.write_u32(entry.offset).map_err(wrap_util("offset"))?;
                    out_file
                        .write_u32(entry.tail_length())
                        .map_err(wrap_util("length"))?;
                    out_file
                        .write_u16(VPK_ENTRY_TERMINATOR)
                        .map_err(wrap_util("terminator"))?;
                    if !entry.preloaded_data.is_empty() {
                        out_file
                            .write_bytes(&entry.preloaded_data)
                            .map_err(wrap_util("preload data"))?;
                    }

                    if let Some(cb) = callback {
                        cb(dir, entry);
                    }
                }

                out_file.write_u8(0).map_err(wrap_util("directory terminator"))?;
            }

            out_file.write_u8(0).map_err(wrap_util("extension terminator"))?;
        }
        out_file.write_u8(0).map_err(wrap_util("tree terminator"))?;

        // Step 7: append the bytes for every dir-stored entry, contiguously.
        out_file.write_all(&dir_vpk_entry_data).map_err(Error::Io)?;

        // Step 8: merge unbaked entries into baked ones now that every offset is final.
        let mut new_entries: EntryMap = EntryMap::new();
        for (dir, _is_unbaked, mut entry) in all_entries {
            entry.unbaked_data = None;
            new_entries.entry(dir).or_default().push(entry);
        }
        self.state.entries = new_entries;
        self.state.unbaked_entries.clear();

        // Step 9: recompute the tree size now that the tree has actually been written.
        let end_pos = out_file.stream_position().map_err(Error::Io)?;
        self.header1.tree_size =
            (end_pos - dir_vpk_entry_data.len() as u64 - header_length) as u32;

        // Step 10: v2 MD5 accounting and whole-file checksum.
        if is_v2 {
            self.md5_entries.clear();
            if self.state.options.vpk_generate_md5_entries {
                for list in self.state.entries.values() {
                    for entry in list {
                        let body = self.read_entry(entry).ok_or_else(|| {
                            Error::Io(std::io::Error::new(
                                std::io::ErrorKind::NotFound,
                                format!("could not read back entry {} for MD5 accounting", entry.path),
                            ))
                        })?;
                        self.md5_entries.push(Md5Entry {
                            archive_index: u32::from(entry.archive_index),
                            offset: entry.offset,
                            length: entry.tail_length(),
                            checksum: checksum::md5(&body),
                        });
                    }
                }
            }

            self.header2 = Header2 {
                file_data_section_size: dir_vpk_entry_data.len() as u32,
                archive_md5_section_size: self.md5_entries.len() as u32 * MD5_ENTRY_LEN as u32,
                other_md5_section_size: OTHER_MD5_SECTION_LEN,
                signature_section_size: 0,
            };

            let tree_bytes = {
                let mut buf = vec![0u8; self.header1.tree_size as usize];
                out_file.seek(SeekFrom::Start(header_length)).map_err(Error::Io)?;
                out_file.read_exact(&mut buf).map_err(Error::Io)?;
                buf
            };

            let mut md5_entries_bytes =
                Vec::with_capacity(self.md5_entries.len() * MD5_ENTRY_LEN as usize);
            for entry in &self.md5_entries {
                md5_entries_bytes.extend_from_slice(&entry.to_le_bytes());
            }

            let mut whole_file = Md5Accumulator::new();
            whole_file.update(&self.header1.to_le_bytes());
            whole_file.update(&self.header2.to_le_bytes());
            whole_file.update(&tree_bytes);
            whole_file.update(&dir_vpk_entry_data);
            whole_file.update(&md5_entries_bytes);

            self.footer2 = Footer2 {
                tree_checksum: checksum::md5(&tree_bytes),
                md5_entries_checksum: checksum::md5(&md5_entries_bytes),
                whole_file_checksum: whole_file.finalize(),
                public_key: Vec::new(),
                signature: Vec::new(),
            };
        }

        // Step 11: rewrite the headers (now final) and, for v2, the MD5 section and footer.
        out_file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        self.header1.write(&mut out_file)?;
        if is_v2 {
            self.header2.write(&mut out_file)?;

            let md5_section_offset =
                header_length + u64::from(self.header1.tree_size) + dir_vpk_entry_data.len() as u64;
            out_file
                .seek(SeekFrom::Start(md5_section_offset))
                .map_err(Error::Io)?;
            for entry in &self.md5_entries {
                entry.write(&mut out_file)?;
            }
            out_file
                .write_bytes(&self.footer2.tree_checksum)
                .map_err(wrap_util("tree checksum"))?;
            out_file
                .write_bytes(&self.footer2.md5_entries_checksum)
                .map_err(wrap_util("md5 entries checksum"))?;
            out_file
                .write_bytes(&self.footer2.whole_file_checksum)
                .map_err(wrap_util("whole file checksum"))?;
        }

        // Step 12.
        self.state.full_file_path = output_path.to_string_lossy().into_owned();
        info!(
            "baked VPK v{} to {} ({} entries, {} byte tree)",
            self.header1.version,
            self.state.full_file_path,
            self.get_entry_count(false),
            self.header1.tree_size
        );

        Ok(true)
    }

    fn get_truncated_filestem(&self) -> String {
        let stem = self.get_filestem();
        stem.strip_suffix(VPK_DIR_SUFFIX).unwrap_or(&stem).to_string()
    }

    fn verify_entry_checksums(&self) -> Vec<String> {
        let mut failing = Vec::new();
        for list in self.state.entries.values() {
            for entry in list {
                match self.read_entry(entry) {
                    Some(bytes) if checksum::crc32(&bytes) == entry.crc32 => {}
                    _ => failing.push(entry.path.clone()),
                }
            }
        }
        failing
    }

    fn verify_file_checksum(&self) -> bool {
        if self.header1.version != 2 {
            return true;
        }

        let Ok(mut file) = File::open(&self.state.full_file_path) else {
            return false;
        };
        let header_length = self.header_length();

        if file.seek(SeekFrom::Start(header_length)).is_err() {
            return false;
        }
        let mut tree_bytes = vec![0u8; self.header1.tree_size as usize];
        if file.read_exact(&mut tree_bytes).is_err() {
            return false;
        }

        let mut dir_data = vec![0u8; self.header2.file_data_section_size as usize];
        if file.read_exact(&mut dir_data).is_err() {
            return false;
        }

        let mut md5_entries_bytes =
            Vec::with_capacity(self.md5_entries.len() * MD5_ENTRY_LEN as usize);
        for entry in &self.md5_entries {
            md5_entries_bytes.extend_from_slice(&entry.to_le_bytes());
        }

        let mut whole_file = Md5Accumulator::new();
        whole_file.update(&self.header1.to_le_bytes());
        whole_file.update(&self.header2.to_le_bytes());
        whole_file.update(&tree_bytes);
        whole_file.update(&dir_data);
        whole_file.update(&md5_entries_bytes);

        whole_file.finalize() == self.footer2.whole_file_checksum
    }
}
