use std::fmt;

use crate::util;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    NotFound(String),
    InvalidSignature(String),
    BadVersion(String),
    InvalidTerminator(String),
    InvalidMd5Section(String),
    Io(std::io::Error),
    Util { source: util::Error, context: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", &self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io(source)
    }
}
