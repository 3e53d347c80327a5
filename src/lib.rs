//! vpk-plumber provides support for working with VPK (Valve Pak) files.
//!
//! It models a format-agnostic [`pack::PackFile`] abstraction (entries, staged/"unbaked"
//! mutation, extension-based backend dispatch), on top of which the [`vpk`] module implements
//! the VPK v1/v2 container: tree parsing, preload windows, multi-archive chunking, and the v2
//! MD5 checksum sections.
//!
//! # Supported formats
//! | Format      | Support   |
//! | ----------- | --------- |
//! | VPK v1      | &#x1F7E2; |
//! | VPK v2      | &#x1F7E2; |
//!
//! Respawn's VPK variant (Titanfall, Apex) uses a materially different tree layout and is out of
//! scope for this crate; opening one fails with [`pack::Error::BadVersion`].

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod checksum;
pub mod entry;
pub mod pack;
pub mod path;
mod util;
pub mod vpk;

#[cfg(test)]
mod tests;
