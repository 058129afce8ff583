/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Snapshot construction by scanning a directory tree.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::SystemTime;

use log::{debug, warn};
use walkdir::WalkDir;

use crate::arc::zip::ZipReader;
use crate::arc::ReadEvent;
use crate::core::error::{Error, Result};
use crate::core::fntree::{FnTree, NodeId};
use crate::sync::{Snapshot, SyncEntry};

fn entry_from_md(md: &fs::Metadata) -> SyncEntry {
    SyncEntry {
        size: if md.is_dir() { 0 } else { md.len() },
        unix_attr: md.mode(),
        win_attr: 0,
        uid: md.uid(),
        gid: md.gid(),
        mtime: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        crc32: 0,
    }
}

/// Scan `root` recursively into a snapshot.  With `zip_expand`, `.zip`
/// files become directory entries holding their central-directory
/// contents.
pub fn scan(root: &str, zip_expand: bool) -> Result<Snapshot> {
    let root = root.trim_end_matches('/');
    let root_md = fs::metadata(root)
        .map_err(|e| Error::system(format!("file get info: '{}'", root), e))?;

    let mut tree: FnTree<SyncEntry> = FnTree::new();
    let root_id = tree.add_root(root, entry_from_md(&root_md));
    let mut by_path: HashMap<String, NodeId> = HashMap::new();
    by_path.insert(root.to_string(), root_id);
    let mut total = 0usize;

    for e in WalkDir::new(root)
        .min_depth(1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let e = e.map_err(|e| Error::format(format!("directory scan: {}", e)))?;
        let md = e
            .metadata()
            .map_err(|e| Error::format(format!("directory scan: {}", e)))?;
        let full = e.path().to_string_lossy().into_owned();
        let parent = e
            .path()
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(&pid) = by_path.get(&parent) else {
            warn!("scan: orphaned entry '{}'", full);
            continue;
        };
        let name = e.file_name().to_string_lossy().into_owned();
        let id = tree.add_child(pid, name.clone(), entry_from_md(&md));
        total += 1;
        if md.is_dir() {
            by_path.insert(full, id);
        } else if zip_expand && name.to_lowercase().ends_with(".zip") {
            total += graft_zip(&mut tree, id, e.path())?;
        }
    }

    // defensive ordering for the paired diff walk
    let ids: Vec<NodeId> = by_path.values().copied().collect();
    let mut tree = tree;
    for id in ids {
        tree.sort_children_ci(id);
    }

    debug!("scanned '{}': {} entries", root, total);
    Ok(Snapshot {
        tree,
        root_dir: root.to_string(),
        total,
    })
}

/// Read a zip central directory and graft its entries as children of the
/// zip file node.
fn graft_zip(tree: &mut FnTree<SyncEntry>, zip_node: NodeId, path: &Path) -> Result<usize> {
    use std::io::Read as _;
    use std::io::Seek as _;

    let mut f = fs::File::open(path)
        .map_err(|e| Error::system(format!("file open: '{}'", path.display()), e))?;
    let total = f
        .metadata()
        .map_err(|e| Error::system(format!("file get info: '{}'", path.display()), e))?
        .len();

    let mut r = ZipReader::new(total);
    let mut pos: Option<u64> = None;
    let mut data = Vec::new();
    loop {
        let mut chunk: &[u8] = &[];
        if let Some(p) = pos.take() {
            f.seek(std::io::SeekFrom::Start(p))
                .map_err(|e| Error::system(format!("file seek: '{}'", path.display()), e))?;
            data.clear();
            f.read_to_end(&mut data)
                .map_err(|e| Error::system(format!("file read: '{}'", path.display()), e))?;
            chunk = &data;
        }
        let mut out = Vec::new();
        match r.process(&mut chunk, &mut out, true)? {
            ReadEvent::Seek(off) => pos = Some(off),
            ReadEvent::Done => break,
            _ => return Err(Error::format("zip: unexpected state while listing")),
        }
    }

    let mut by_rel: HashMap<String, NodeId> = HashMap::new();
    let mut added = 0usize;
    for ze in r.entries() {
        let e = SyncEntry {
            size: ze.meta.size,
            unix_attr: ze.meta.unix_attr
                | if ze.meta.is_dir() { 0o040000 } else { 0 },
            mtime: ze.meta.mtime,
            crc32: ze.crc,
            ..SyncEntry::default()
        };
        let (parent_rel, base) = match ze.meta.name.rfind('/') {
            Some(i) => (&ze.meta.name[..i], &ze.meta.name[i + 1..]),
            None => ("", ze.meta.name.as_str()),
        };
        let pid = match parent_rel.is_empty() {
            true => zip_node,
            false => match by_rel.get(parent_rel) {
                Some(&id) => id,
                None => {
                    warn!("zip expand: orphaned member '{}'", ze.meta.name);
                    continue;
                }
            },
        };
        let id = tree.add_child(pid, base, e);
        added += 1;
        if ze.meta.is_dir() {
            by_rel.insert(ze.meta.name.clone(), id);
        }
    }
    debug!("zip expand: '{}': {} members", path.display(), added);
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_tree_shape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("b.txt"), b"bb").unwrap();
        fs::create_dir(root.join("a")).unwrap();
        fs::write(root.join("a/x.bin"), b"xxx").unwrap();

        let snap = scan(root.to_str().unwrap(), false).unwrap();
        assert_eq!(3, snap.total);
        let root_id = snap.root();
        let kids: Vec<&str> = snap
            .tree
            .children(root_id)
            .unwrap()
            .iter()
            .map(|&c| snap.tree.name(c))
            .collect();
        assert_eq!(vec!["a", "b.txt"], kids);
        let a = snap.tree.children(root_id).unwrap()[0];
        assert!(snap.tree.data(a).is_dir());
        let x = snap.tree.children(a).unwrap()[0];
        assert_eq!(3, snap.tree.data(x).size);
        assert_eq!("a/x.bin", snap.rel_path(x));
    }

    #[test]
    fn test_scan_missing_root() {
        assert!(scan("/nonexistent/fcom-test-root", false).is_err());
    }
}
