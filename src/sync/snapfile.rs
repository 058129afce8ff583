/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Snapshot text format:
//!
//! ```text
//! # fcom file tree snapshot
//! b "ROOT_DIR" {
//! 	v 1
//! 	f "NAME" SIZE UNIX_HEX/WIN_HEX UID:GID YYYY-MM-DD+HH:MM:SS.msc CRC32
//! 	d "DIRNAME" ...
//! }
//! b "ROOT_DIR/DIRNAME" { ... }
//! ```
//!
//! One `b` block per directory; the reader validates the version and every
//! field shape strictly.

use std::collections::HashMap;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::debug;

use crate::core::error::{Error, Result};
use crate::core::fntree::{FnTree, NodeId};
use crate::sync::{Snapshot, SyncEntry};

const TIME_FMT: &str = "%Y-%m-%d+%H:%M:%S%.3f";

fn fmt_time(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format(TIME_FMT).to_string()
}

fn parse_time(s: &str) -> Result<SystemTime> {
    let nd = NaiveDateTime::parse_from_str(s, TIME_FMT)
        .map_err(|_| Error::format(format!("bad snapshot time '{}'", s)))?;
    Ok(Utc.from_utc_datetime(&nd).into())
}

fn fmt_entry(kind: char, name: &str, d: &SyncEntry) -> String {
    format!(
        "\t{} \"{}\" {} {:x}/{:x} {}:{} {} {}\n",
        kind,
        name,
        d.size,
        d.unix_attr,
        d.win_attr,
        d.uid,
        d.gid,
        fmt_time(d.mtime),
        d.crc32,
    )
}

/// Serialize a snapshot.
pub fn write(snap: &Snapshot) -> Result<String> {
    let mut out = String::from("# fcom file tree snapshot\n");
    let mut first = true;
    // DFS over directory nodes, root first
    let mut stack = vec![snap.root()];
    while let Some(dir) = stack.pop() {
        out.push_str(&format!("b \"{}\" {{\n", snap.tree.path(dir)));
        if first {
            out.push_str("\tv 1\n");
            first = false;
        }
        let kids = snap.tree.children(dir).unwrap_or(&[]);
        let mut sub = Vec::new();
        for &c in kids {
            let d = snap.tree.data(c);
            let name = snap.tree.name(c);
            if name.contains('"') {
                return Err(Error::format(format!(
                    "snapshot: unsupported character in name '{}'",
                    name
                )));
            }
            let kind = if d.is_dir() { 'd' } else { 'f' };
            out.push_str(&fmt_entry(kind, name, d));
            if d.is_dir() {
                sub.push(c);
            }
        }
        out.push_str("}\n");
        for c in sub.into_iter().rev() {
            stack.push(c);
        }
    }
    Ok(out)
}

fn quoted(s: &str) -> Result<(&str, &str)> {
    let s = s
        .strip_prefix('"')
        .ok_or_else(|| Error::format("snapshot: name quote expected"))?;
    let end = s
        .find('"')
        .ok_or_else(|| Error::format("snapshot: unterminated name"))?;
    Ok((&s[..end], s[end + 1..].trim_start()))
}

fn parse_entry_line(rest: &str) -> Result<(String, SyncEntry)> {
    let (name, rest) = quoted(rest)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::format(format!(
            "snapshot: bad entry near '{}'",
            name
        )));
    }
    let size: u64 = fields[0]
        .parse()
        .map_err(|_| Error::format(format!("snapshot: bad size near '{}'", name)))?;
    let (ua, wa) = fields[1]
        .split_once('/')
        .ok_or_else(|| Error::format(format!("snapshot: bad attributes near '{}'", name)))?;
    let unix_attr = u32::from_str_radix(ua, 16)
        .map_err(|_| Error::format(format!("snapshot: bad attributes near '{}'", name)))?;
    let win_attr = u32::from_str_radix(wa, 16)
        .map_err(|_| Error::format(format!("snapshot: bad attributes near '{}'", name)))?;
    let (uid, gid) = fields[2]
        .split_once(':')
        .ok_or_else(|| Error::format(format!("snapshot: bad owner near '{}'", name)))?;
    let uid: u32 = uid
        .parse()
        .map_err(|_| Error::format(format!("snapshot: bad owner near '{}'", name)))?;
    let gid: u32 = gid
        .parse()
        .map_err(|_| Error::format(format!("snapshot: bad owner near '{}'", name)))?;
    let mtime = parse_time(fields[3])?;
    let crc32: u32 = fields[4]
        .parse()
        .map_err(|_| Error::format(format!("snapshot: bad checksum near '{}'", name)))?;
    Ok((
        name.to_string(),
        SyncEntry {
            size,
            unix_attr,
            win_attr,
            uid,
            gid,
            mtime,
            crc32,
        },
    ))
}

/// Parse a snapshot file.
pub fn parse(input: &str) -> Result<Snapshot> {
    let mut tree: FnTree<SyncEntry> = FnTree::new();
    let mut root: Option<NodeId> = None;
    let mut root_dir = String::new();
    let mut dirs: HashMap<String, NodeId> = HashMap::new();
    let mut cur_block: Option<(NodeId, String)> = None;
    let mut version_seen = false;
    let mut total = 0usize;

    for (lno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let err = |msg: &str| Error::format(format!("snapshot line {}: {}", lno + 1, msg));

        if let Some(rest) = line.strip_prefix("b ") {
            if cur_block.is_some() {
                return Err(err("nested block"));
            }
            let (path, rest) = quoted(rest)?;
            if rest != "{" {
                return Err(err("'{' expected"));
            }
            let id = match root {
                None => {
                    root_dir = path.to_string();
                    let id = tree.add_root(path, SyncEntry::default());
                    root = Some(id);
                    dirs.insert(path.to_string(), id);
                    id
                }
                Some(_) => *dirs
                    .get(path)
                    .ok_or_else(|| err("block for an unknown directory"))?,
            };
            cur_block = Some((id, path.to_string()));
            debug!("snapshot: added branch '{}'", path);
        } else if line == "}" {
            if cur_block.take().is_none() {
                return Err(err("unmatched '}'"));
            }
        } else if let Some(rest) = line.strip_prefix("v ") {
            if rest != "1" {
                return Err(err("unsupported snapshot version"));
            }
            version_seen = true;
        } else if let Some(rest) = line.strip_prefix("f ").or_else(|| line.strip_prefix("d ")) {
            let (block, block_path) = cur_block
                .as_ref()
                .ok_or_else(|| err("entry outside of a block"))?;
            if !version_seen {
                return Err(err("version line missing"));
            }
            let (name, mut data) = parse_entry_line(rest)?;
            if line.starts_with("d ") {
                data.unix_attr |= 0o040000;
            }
            let id = tree.add_child(*block, name.clone(), data);
            total += 1;
            if data.is_dir() {
                dirs.insert(format!("{}/{}", block_path, name), id);
            }
        } else {
            return Err(err("unrecognized line"));
        }
    }

    if cur_block.is_some() {
        return Err(Error::format("snapshot: unterminated block"));
    }
    let Some(_) = root else {
        return Err(Error::format("snapshot: no data"));
    };
    let ids: Vec<NodeId> = dirs.values().copied().collect();
    for id in ids {
        tree.sort_children_ci(id);
    }
    Ok(Snapshot {
        tree,
        root_dir,
        total,
    })
}

/// Read and parse a snapshot file from disk.
pub fn read(path: &str) -> Result<Snapshot> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::system(format!("file read: '{}'", path), e))?;
    parse(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_snapshot() -> Snapshot {
        let mut tree: FnTree<SyncEntry> = FnTree::new();
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_600_000_000_123);
        let root = tree.add_root(
            "/data",
            SyncEntry {
                unix_attr: 0o040755,
                ..SyncEntry::default()
            },
        );
        tree.add_child(
            root,
            "a.txt",
            SyncEntry {
                size: 42,
                unix_attr: 0o100644,
                uid: 1000,
                gid: 1000,
                mtime: t,
                crc32: 7,
                ..SyncEntry::default()
            },
        );
        let d = tree.add_child(
            root,
            "sub",
            SyncEntry {
                unix_attr: 0o040755,
                mtime: t,
                ..SyncEntry::default()
            },
        );
        tree.add_child(
            d,
            "inner.bin",
            SyncEntry {
                size: 5,
                unix_attr: 0o100600,
                mtime: t,
                ..SyncEntry::default()
            },
        );
        Snapshot {
            tree,
            root_dir: "/data".into(),
            total: 3,
        }
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snap = sample_snapshot();
        let text = write(&snap).unwrap();
        assert!(text.contains("b \"/data\" {"));
        assert!(text.contains("b \"/data/sub\" {"));
        assert!(text.contains("\tv 1\n"));

        let back = parse(&text).unwrap();
        assert_eq!(3, back.total);
        assert_eq!("/data", back.root_dir);
        let root = back.root();
        let kids: Vec<&str> = back
            .tree
            .children(root)
            .unwrap()
            .iter()
            .map(|&c| back.tree.name(c))
            .collect();
        assert_eq!(vec!["a.txt", "sub"], kids);
        let a = back.tree.children(root).unwrap()[0];
        let d = back.tree.data(a);
        assert_eq!(42, d.size);
        assert_eq!(0o100644, d.unix_attr);
        assert_eq!(1_600_000_000_123, d.mtime_ms());
    }

    #[test]
    fn test_snapshot_version_required() {
        let text = "b \"/x\" {\n\tf \"a\" 1 81a4/0 0:0 2020-01-01+00:00:00.000 0\n}\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_snapshot_bad_time_rejected() {
        let text =
            "b \"/x\" {\n\tv 1\n\tf \"a\" 1 81a4/0 0:0 2020-13-01+00:00:00.000 0\n}\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_snapshot_unknown_block_rejected() {
        let text = "b \"/x\" {\n\tv 1\n}\nb \"/x/missing\" {\n}\n";
        assert!(parse(text).is_err());
    }
}
