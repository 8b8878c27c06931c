//! Checksum parsing and object path mapping.
//!
//! A [`Checksum`] is a canonical 64-character lowercase hex string. No
//! normalization happens on parse: leading zeros are kept, and uppercase
//! input is rejected rather than folded.

use crate::error::{Result, SysrootError};
use camino::Utf8PathBuf;
use std::fmt;

/// A validated 64-hex-character content identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum(String);

impl Checksum {
    /// Validate `s` as a canonical checksum string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(SysrootError::Invalid(format!(
                "checksum {s:?} has length {} (expected 64)",
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(SysrootError::Invalid(format!(
                "checksum {s:?} is not lowercase hex"
            )));
        }
        Ok(Self(s.to_owned()))
    }

    /// Compute the checksum of `data` (SHA-256, lowercase hex).
    pub fn digest(data: &[u8]) -> Self {
        let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), data)
            .expect("sha256 is always available");
        Self(hex::encode(digest))
    }

    /// The string form, as stored on disk and in refs.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(&self) -> (&str, &str) {
        self.0.split_at(2)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Checksum {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The kind of object a checksum names. A closed enumeration, not an open
/// class hierarchy (see design notes on dynamic dispatch via value kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A commit: references a root dirtree/dirmeta pair plus metadata.
    Commit,
    /// A directory tree listing.
    DirTree,
    /// Directory metadata (permissions, xattrs) for one tree node.
    DirMeta,
    /// Regular file content.
    File,
}

impl ObjectKind {
    /// The on-disk filename extension for this kind.
    pub fn extension(self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::DirTree => "dirtree",
            ObjectKind::DirMeta => "dirmeta",
            ObjectKind::File => "file",
        }
    }
}

/// Compute the path (relative to a repo's `objects/` directory root, i.e.
/// including the `objects/` prefix) for `(csum, kind)`. Pure: never touches
/// the filesystem.
pub fn object_path(csum: &Checksum, kind: ObjectKind) -> Utf8PathBuf {
    let (prefix, rest) = csum.split();
    Utf8PathBuf::from("objects")
        .join(prefix)
        .join(format!("{rest}.{}", kind.extension()))
}
