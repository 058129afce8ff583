/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Archive codec state machines.  Readers are push parsers: the driver
//! feeds bytes and reacts to the returned events; a `Seek` event asks the
//! driver to re-issue its next read at the given offset.  Writers accept
//! entry metadata and raw bytes and emit framed output.

pub mod gz;
pub mod iso;
pub mod sevenz;
pub mod tar;
pub mod xz;
pub mod zip;
pub mod zst;

use std::collections::HashSet;
use std::fs;
use std::time::SystemTime;

use glob::{MatchOptions, Pattern};

use crate::core::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryKind {
    Regular,
    Dir,
    Hardlink,
    Symlink,
}

/// Uniform archive-member model shared by all codecs.
#[derive(Clone, Debug)]
pub struct ArcEntry {
    pub name: String,
    pub size: u64,
    pub compressed_size: u64,
    pub mtime: SystemTime,
    pub unix_attr: u32,
    pub win_attr: u32,
    pub kind: EntryKind,
    pub link_target: String,
    /// Offset within the archive, for random-access formats.
    pub offset: u64,
}

impl Default for ArcEntry {
    fn default() -> Self {
        ArcEntry {
            name: String::new(),
            size: 0,
            compressed_size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            unix_attr: 0o644,
            win_attr: 0,
            kind: EntryKind::Regular,
            link_target: String::new(),
            offset: 0,
        }
    }
}

impl ArcEntry {
    pub fn from_metadata(name: &str, md: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        let kind = if md.is_dir() {
            EntryKind::Dir
        } else if md.file_type().is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Regular
        };
        ArcEntry {
            name: name.to_string(),
            size: if kind == EntryKind::Regular { md.len() } else { 0 },
            mtime: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            unix_attr: md.mode(),
            kind,
            ..ArcEntry::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// One step of a reader state machine.
#[derive(Debug)]
pub enum ReadEvent {
    /// A member header was parsed; its data follows.
    FileHeader,
    /// `output` holds decoded member data.
    Data,
    /// The current member's data is complete.
    FileDone,
    /// The whole archive is complete.
    Done,
    /// All buffered input consumed; feed more.
    More,
    /// Re-issue the next read at this archive offset.
    Seek(u64),
}

/// `--member NAME` / `--members-from-file` selection: exact names go to a
/// hash set, wildcards to a pattern list.  An empty filter admits all.
pub struct Members {
    exact: HashSet<String>,
    wild: Vec<Pattern>,
}

impl Members {
    pub fn new(names: &[String], from_file: Option<&str>) -> Result<Self> {
        let mut exact = HashSet::new();
        let mut wild = Vec::new();
        let mut add = |name: &str| -> Result<()> {
            if name.contains(['*', '?']) {
                wild.push(
                    Pattern::new(name)
                        .map_err(|e| Error::argument(format!("bad member pattern '{}': {}", name, e)))?,
                );
            } else {
                exact.insert(name.to_string());
            }
            Ok(())
        };
        for n in names {
            add(n)?;
        }
        if let Some(path) = from_file {
            let data = fs::read_to_string(path)
                .map_err(|e| Error::system(format!("file read: '{}'", path), e))?;
            for line in data.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    add(line)?;
                }
            }
        }
        Ok(Members { exact, wild })
    }

    pub fn check(&self, name: &str) -> bool {
        if self.exact.is_empty() && self.wild.is_empty() {
            return true;
        }
        if self.exact.contains(name) {
            return true;
        }
        let opts = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::default()
        };
        self.wild.iter().any(|p| p.matches_with(name, opts))
    }
}

pub(crate) fn get_u16le(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

pub(crate) fn get_u32le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

pub(crate) fn get_u64le(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_members_empty_admits_all() {
        let m = Members::new(&[], None).unwrap();
        assert!(m.check("anything"));
    }

    #[test]
    fn test_members_exact_and_wildcard() {
        let m = Members::new(&["a/b.txt".to_string(), "*.log".to_string()], None).unwrap();
        assert!(m.check("a/b.txt"));
        assert!(m.check("x/y.LOG"));
        assert!(!m.check("a/c.txt"));
    }
}
