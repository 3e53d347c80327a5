//! Virtual-path normalization shared by every entry-identifying boundary (`addEntry`,
//! `findEntry`, `removeEntry`).

/// Replaces backslashes with forward slashes. Empty path components are preserved.
#[must_use]
pub fn normalize_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// ASCII lower-cases a path.
#[must_use]
pub fn to_lower_case(path: &str) -> String {
    path.to_ascii_lowercase()
}

/// Normalizes a filename the way it must be normalized at every entry-identifying boundary:
/// slashes first, then casing per `allow_uppercase`. Centralizing this in one function is what
/// keeps `addEntry`/`findEntry`/`removeEntry` from silently drifting apart on casing.
#[must_use]
pub fn normalize(path: &str, allow_uppercase: bool) -> String {
    let slashes = normalize_slashes(path);
    if allow_uppercase {
        slashes
    } else {
        to_lower_case(&slashes)
    }
}

/// Splits a path into `(parent_dir, basename)` on the last `/`. `parent_dir` is empty when there
/// is no separator.
#[must_use]
pub fn split_filename_and_parent_dir(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(i) => (path[..i].to_string(), path[i + 1..].to_string()),
        None => (String::new(), path.to_string()),
    }
}

/// Splits a basename into `(stem, extension)`. The extension excludes the leading dot and is
/// empty if there is none. A leading dot with no other dot (e.g. `.gitignore`) counts as having
/// no extension.
#[must_use]
pub fn split_stem_and_extension(basename: &str) -> (String, String) {
    match basename.rfind('.') {
        Some(0) | None => (basename.to_string(), String::new()),
        Some(i) => (basename[..i].to_string(), basename[i + 1..].to_string()),
    }
}

