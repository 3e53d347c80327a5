//! Low-level byte I/O shared by every pack-file backend: little-endian integers and
//! NUL-terminated strings layered directly on top of [`std::fs::File`].

pub use error::{Error, Result};

pub mod file;

mod error;
