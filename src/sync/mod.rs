/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Directory-tree synchronization engine: snapshots, diffing with rename
//! detection, snapshot files and per-entry sync actions.

pub mod action;
pub mod diff;
pub mod scan;
pub mod snapfile;

use std::time::SystemTime;

use crate::core::fntree::FnTree;

/// Per-entry metadata carried by snapshot tree nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncEntry {
    pub size: u64,
    pub unix_attr: u32,
    pub win_attr: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    pub crc32: u32,
}

impl Default for SyncEntry {
    fn default() -> Self {
        SyncEntry {
            size: 0,
            unix_attr: 0,
            win_attr: 0,
            uid: 0,
            gid: 0,
            mtime: SystemTime::UNIX_EPOCH,
            crc32: 0,
        }
    }
}

impl SyncEntry {
    pub fn is_dir(&self) -> bool {
        self.unix_attr & 0o170000 == 0o040000
    }

    /// mtime in whole milliseconds since the epoch.
    pub fn mtime_ms(&self) -> u64 {
        self.mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A comparable file tree: one root node holding the scanned directory
/// path, its contents attached below.
pub struct Snapshot {
    pub tree: FnTree<SyncEntry>,
    pub root_dir: String,
    /// Entries excluding the root node itself.
    pub total: usize,
}

impl Snapshot {
    pub fn root(&self) -> crate::core::fntree::NodeId {
        self.tree.roots()[0]
    }

    /// Path of a node relative to the snapshot root.
    pub fn rel_path(&self, id: crate::core::fntree::NodeId) -> String {
        let full = self.tree.path(id);
        let root = &self.root_dir;
        full.strip_prefix(root.as_str())
            .map(|s| s.trim_start_matches('/').to_string())
            .unwrap_or(full)
    }
}
