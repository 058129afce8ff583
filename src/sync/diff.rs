/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Snapshot comparison: a paired cursor walks both trees in sorted order,
//! classifying every entry; a hash index over (type, mtime, size, name)
//! signatures folds left-only/right-only pairs into moved entries.

use std::collections::HashMap;
use std::hash::Hasher as _;
use std::time::SystemTime;

use bitflags::bitflags;
use glob::{MatchOptions, Pattern};
use log::{debug, info};
use twox_hash::XxHash64;

use crate::core::fntree::NodeId;
use crate::sync::{Snapshot, SyncEntry};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DiffStatus: u32 {
        /// Exists on the left side only.
        const LEFT = 1;
        /// Exists on the right side only.
        const RIGHT = 2;
        /// Same name, different content or metadata.
        const NEQ = 4;
        /// Same file at a different path.
        const MOVE = 8;
        const EQ = 0x10;

        const NEWER = 0x0100;
        const OLDER = 0x0200;
        const LARGER = 0x0400;
        const SMALLER = 0x0800;
        const ATTR = 0x1000;

        const DIR = 0x2000;
        /// Second half of a merged moved pair; never shown.
        const SKIP = 0x8000;

        const SYNCING = 0x01_0000;
        const ERROR = 0x02_0000;
        const DONE = 0x04_0000;
    }
}

impl DiffStatus {
    pub const KIND_MASK: DiffStatus = DiffStatus::LEFT
        .union(DiffStatus::RIGHT)
        .union(DiffStatus::NEQ)
        .union(DiffStatus::MOVE)
        .union(DiffStatus::EQ);
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DiffOpts: u32 {
        /// Ignore mode/attribute differences.
        const NO_ATTR = 1;
        /// Ignore mtime differences.
        const NO_TIME = 2;
        /// Compare mtimes at 2-second granularity.
        const TIME_2SEC = 4;
        /// Match moved files by metadata only (across renamed parents).
        const MOVE_NO_NAME = 8;
    }
}

#[derive(Debug)]
pub struct DiffEntry {
    pub status: DiffStatus,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    /// Paths relative to their snapshot roots.
    pub lname: String,
    pub rname: String,
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct DiffStats {
    pub eq: u32,
    pub left: u32,
    pub right: u32,
    pub neq: u32,
    pub moved: u32,
    pub entries: u32,
    pub ltotal: u64,
    pub rtotal: u64,
}

/// View filter properties.
#[derive(Default)]
pub struct ViewProps {
    pub include: Vec<Pattern>,
    pub exclude: Vec<Pattern>,
    pub since_time: Option<SystemTime>,
    pub show_dirs: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Name,
    FileSize,
    Mtime,
}

/// The comparison result: raw entry table plus a filtered view index.
pub struct Diff {
    pub left: Snapshot,
    pub right: Snapshot,
    ents: Vec<DiffEntry>,
    view: Vec<usize>,
    pub stats: DiffStats,
    opts: DiffOpts,
}

struct MovedIndex {
    map: HashMap<u64, Vec<usize>>,
}

impl MovedIndex {
    fn new() -> Self {
        MovedIndex {
            map: HashMap::new(),
        }
    }

    fn signature(opts: DiffOpts, name: &str, d: &SyncEntry) -> u64 {
        let mut h = XxHash64::with_seed(0x789a_bcde);
        h.write_u8(if !opts.contains(DiffOpts::NO_ATTR) && d.is_dir() {
            1
        } else {
            0
        });
        let mtime = if opts.contains(DiffOpts::NO_TIME) {
            0
        } else {
            d.mtime_ms()
        };
        h.write_u64(mtime);
        h.write_u64(d.size);
        if !opts.contains(DiffOpts::MOVE_NO_NAME) {
            h.write(name.as_bytes());
        }
        h.finish()
    }

    fn matches(opts: DiffOpts, a_name: &str, a: &SyncEntry, b_name: &str, b: &SyncEntry) -> bool {
        (opts.contains(DiffOpts::MOVE_NO_NAME) || a_name == b_name)
            && a.size == b.size
            && (opts.contains(DiffOpts::NO_ATTR) || a.is_dir() == b.is_dir())
            && (opts.contains(DiffOpts::NO_TIME) || a.mtime_ms() == b.mtime_ms())
    }
}

impl Diff {
    /// Compare two snapshots.
    pub fn build(left: Snapshot, right: Snapshot, opts: DiffOpts) -> Diff {
        let mut d = Diff {
            ents: Vec::with_capacity(left.total + right.total + 2),
            view: Vec::new(),
            stats: DiffStats {
                ltotal: left.total as u64,
                rtotal: right.total as u64,
                ..DiffStats::default()
            },
            left,
            right,
            opts,
        };
        let mut moved = MovedIndex::new();
        let lroot = self_kids(&d.left, d.left.root());
        let rroot = self_kids(&d.right, d.right.root());
        d.walk(&mut moved, lroot, rroot);
        d.stats.entries = d
            .ents
            .iter()
            .filter(|e| !e.status.contains(DiffStatus::SKIP))
            .count() as u32;
        info!(
            "diff status: moved:{}  add:{}  del:{}  upd:{}  eq:{}  total:{}/{}",
            d.stats.moved,
            d.stats.left,
            d.stats.right,
            d.stats.neq,
            d.stats.eq,
            d.stats.ltotal,
            d.stats.rtotal
        );
        d
    }

    fn push(&mut self, status: DiffStatus, l: Option<NodeId>, r: Option<NodeId>) -> usize {
        let lname = l.map(|id| self.left.rel_path(id)).unwrap_or_default();
        let rname = r.map(|id| self.right.rel_path(id)).unwrap_or_default();
        debug!("{} <-> {}: {:?}", lname, rname, status);
        self.ents.push(DiffEntry {
            status,
            left: l,
            right: r,
            lname,
            rname,
        });
        self.ents.len() - 1
    }

    /// Record a one-sided entry, folding matched pairs into MOVE.
    fn one_sided(&mut self, moved: &mut MovedIndex, side: DiffStatus, id: NodeId) {
        let (snap, other_side) = if side == DiffStatus::LEFT {
            (&self.left, DiffStatus::RIGHT)
        } else {
            (&self.right, DiffStatus::LEFT)
        };
        let name = snap.tree.name(id).to_string();
        let data = *snap.tree.data(id);
        let mut status = side;
        if data.is_dir() {
            status |= DiffStatus::DIR;
        }
        if side == DiffStatus::LEFT {
            self.stats.left += 1;
        } else {
            self.stats.right += 1;
        }

        let sig = MovedIndex::signature(self.opts, &name, &data);
        let candidates = moved.map.entry(sig).or_default();
        let mut hit = None;
        for &ci in candidates.iter() {
            let ce = &self.ents[ci];
            if !ce.status.contains(other_side) {
                continue;
            }
            let (cid, csnap) = if other_side == DiffStatus::LEFT {
                (ce.left, &self.left)
            } else {
                (ce.right, &self.right)
            };
            let Some(cid) = cid else { continue };
            let cname = csnap.tree.name(cid);
            let cdata = csnap.tree.data(cid);
            if MovedIndex::matches(self.opts, &name, &data, cname, cdata) {
                hit = Some(ci);
                break;
            }
        }
        debug!("move: found:{}  hash:{:x}  '{}'", hit.is_some() as u8, sig, name);

        match hit {
            Some(ci) => {
                // fold this entry and the earlier opposite-side entry into
                // a single moved pair
                let this = self.push(DiffStatus::MOVE | DiffStatus::SKIP, None, None);
                let (ent_l, ent_r) = if side == DiffStatus::LEFT {
                    (Some(id), None)
                } else {
                    (None, Some(id))
                };
                if let Some(l) = ent_l {
                    self.ents[this].left = Some(l);
                    self.ents[this].lname = self.left.rel_path(l);
                }
                if let Some(r) = ent_r {
                    self.ents[this].right = Some(r);
                    self.ents[this].rname = self.right.rel_path(r);
                }
                let (cl, cr) = {
                    let ce = &mut self.ents[ci];
                    ce.status.remove(other_side);
                    ce.status |= DiffStatus::MOVE;
                    if side == DiffStatus::LEFT {
                        ce.left = Some(id);
                    } else {
                        ce.right = Some(id);
                    }
                    (ce.left, ce.right)
                };
                let lname = cl.map(|i| self.left.rel_path(i)).unwrap_or_default();
                let rname = cr.map(|i| self.right.rel_path(i)).unwrap_or_default();
                let ce = &mut self.ents[ci];
                ce.lname = lname;
                ce.rname = rname;
                self.stats.moved += 1;
                self.stats.left -= 1;
                self.stats.right -= 1;
            }
            None => {
                let idx = self.push(
                    status,
                    (side == DiffStatus::LEFT).then_some(id),
                    (side == DiffStatus::RIGHT).then_some(id),
                );
                moved.map.entry(sig).or_default().push(idx);
            }
        }
    }

    /// Emit a whole one-sided subtree.
    fn one_sided_rec(&mut self, moved: &mut MovedIndex, side: DiffStatus, id: NodeId) {
        self.one_sided(moved, side, id);
        let snap = if side == DiffStatus::LEFT {
            &self.left
        } else {
            &self.right
        };
        let kids: Vec<NodeId> = snap.tree.children(id).unwrap_or(&[]).to_vec();
        for c in kids {
            self.one_sided_rec(moved, side, c);
        }
    }

    fn cmp_data(&self, l: &SyncEntry, r: &SyncEntry) -> DiffStatus {
        let mut k = DiffStatus::empty();
        if l.size != r.size {
            k |= DiffStatus::NEQ
                | if l.size < r.size {
                    DiffStatus::SMALLER
                } else {
                    DiffStatus::LARGER
                };
        }
        if !self.opts.contains(DiffOpts::NO_ATTR)
            && (l.unix_attr != r.unix_attr || l.win_attr != r.win_attr)
        {
            k |= DiffStatus::NEQ | DiffStatus::ATTR;
        }
        if !self.opts.contains(DiffOpts::NO_TIME) {
            let (lm, rm) = (l.mtime_ms(), r.mtime_ms());
            let eq2s = self.opts.contains(DiffOpts::TIME_2SEC) && lm / 2000 == rm / 2000;
            if !eq2s && lm != rm {
                k |= DiffStatus::NEQ
                    | if lm < rm {
                        DiffStatus::OLDER
                    } else {
                        DiffStatus::NEWER
                    };
            }
        }
        if k.is_empty() {
            DiffStatus::EQ
        } else {
            k
        }
    }

    /// Paired walk over two sorted child lists.
    fn walk(&mut self, moved: &mut MovedIndex, lkids: Vec<NodeId>, rkids: Vec<NodeId>) {
        let mut i = 0;
        let mut j = 0;
        while i < lkids.len() || j < rkids.len() {
            if i >= lkids.len() {
                self.one_sided_rec(moved, DiffStatus::RIGHT, rkids[j]);
                j += 1;
                continue;
            }
            if j >= rkids.len() {
                self.one_sided_rec(moved, DiffStatus::LEFT, lkids[i]);
                i += 1;
                continue;
            }
            let (li, rj) = (lkids[i], rkids[j]);
            let ln = self.left.tree.name(li).to_lowercase();
            let rn = self.right.tree.name(rj).to_lowercase();
            match ln.cmp(&rn) {
                std::cmp::Ordering::Less => {
                    self.one_sided_rec(moved, DiffStatus::LEFT, li);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    self.one_sided_rec(moved, DiffStatus::RIGHT, rj);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    let ld = *self.left.tree.data(li);
                    let rd = *self.right.tree.data(rj);
                    let mut status = self.cmp_data(&ld, &rd);
                    if ld.is_dir() || rd.is_dir() {
                        status |= DiffStatus::DIR;
                    }
                    if status.contains(DiffStatus::EQ) {
                        self.stats.eq += 1;
                    } else {
                        self.stats.neq += 1;
                    }
                    self.push(status, Some(li), Some(rj));
                    if ld.is_dir() && rd.is_dir() {
                        let lk = self_kids(&self.left, li);
                        let rk = self_kids(&self.right, rj);
                        self.walk(moved, lk, rk);
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
    }

    pub fn entries(&self) -> &[DiffEntry] {
        &self.ents
    }

    /// Rebuild the filtered view.  `mask` selects entry kinds; returns the
    /// number of selected entries.
    pub fn view(&mut self, props: &ViewProps, mask: DiffStatus) -> usize {
        let opts = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::default()
        };
        self.view.clear();
        for (i, e) in self.ents.iter().enumerate() {
            if e.status.contains(DiffStatus::SKIP) {
                continue;
            }
            if (e.status & DiffStatus::KIND_MASK & mask).is_empty() {
                continue;
            }
            if !props.show_dirs && e.status.contains(DiffStatus::DIR) {
                continue;
            }
            let name_hit = |p: &Pattern| {
                (!e.lname.is_empty() && p.matches_with(&e.lname, opts))
                    || (!e.rname.is_empty() && p.matches_with(&e.rname, opts))
            };
            if !props.include.is_empty() && !props.include.iter().any(name_hit) {
                continue;
            }
            if props.exclude.iter().any(name_hit) {
                continue;
            }
            if let Some(since) = props.since_time {
                let mt = e
                    .left
                    .map(|id| self.left.tree.data(id).mtime)
                    .or_else(|| e.right.map(|id| self.right.tree.data(id).mtime));
                if mt.map(|t| t < since).unwrap_or(true) {
                    continue;
                }
            }
            self.view.push(i);
        }
        self.view.len()
    }

    pub fn sort(&mut self, by: SortBy) {
        let ents = &self.ents;
        let left = &self.left;
        let right = &self.right;
        let key_size = |i: &usize| -> u64 {
            let e = &ents[*i];
            e.left
                .map(|id| left.tree.data(id).size)
                .or_else(|| e.right.map(|id| right.tree.data(id).size))
                .unwrap_or(0)
        };
        let key_mtime = |i: &usize| -> u64 {
            let e = &ents[*i];
            e.left
                .map(|id| left.tree.data(id).mtime_ms())
                .or_else(|| e.right.map(|id| right.tree.data(id).mtime_ms()))
                .unwrap_or(0)
        };
        match by {
            SortBy::Name => self
                .view
                .sort_by(|a, b| ents[*a].lname.cmp(&ents[*b].lname)),
            SortBy::FileSize => self.view.sort_by_key(key_size),
            SortBy::Mtime => self.view.sort_by_key(key_mtime),
        }
    }

    pub fn selected(&self) -> &[usize] {
        &self.view
    }

    /// Entry as presented: with `swap`, sides and direction bits reverse.
    pub fn info(&self, idx: usize, swap: bool) -> (DiffStatus, String, String) {
        let e = &self.ents[idx];
        if !swap {
            return (e.status, e.lname.clone(), e.rname.clone());
        }
        let mut st = e.status;
        let flip = [
            (DiffStatus::LEFT, DiffStatus::RIGHT),
            (DiffStatus::NEWER, DiffStatus::OLDER),
            (DiffStatus::LARGER, DiffStatus::SMALLER),
        ];
        for (a, b) in flip {
            let has_a = st.contains(a);
            let has_b = st.contains(b);
            st.remove(a | b);
            if has_a {
                st |= b;
            }
            if has_b {
                st |= a;
            }
        }
        (st, e.rname.clone(), e.lname.clone())
    }

    /// Update user-visible status bits of one entry.
    pub fn set_status(&mut self, idx: usize, mask: DiffStatus, val: DiffStatus) -> DiffStatus {
        let e = &mut self.ents[idx];
        e.status.remove(mask);
        e.status |= val & mask;
        e.status
    }
}

fn self_kids(snap: &Snapshot, id: NodeId) -> Vec<NodeId> {
    snap.tree.children(id).unwrap_or(&[]).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fntree::FnTree;
    use std::time::Duration;

    fn file(size: u64, secs: u64) -> SyncEntry {
        SyncEntry {
            size,
            unix_attr: 0o100644,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            ..SyncEntry::default()
        }
    }

    fn dir() -> SyncEntry {
        SyncEntry {
            unix_attr: 0o040755,
            ..SyncEntry::default()
        }
    }

    /// Builds a snapshot from (path, entry) pairs; directories are created
    /// implicitly and must come before their contents.
    fn snap(root: &str, items: &[(&str, SyncEntry)]) -> Snapshot {
        let mut tree: FnTree<SyncEntry> = FnTree::new();
        let rid = tree.add_root(root, dir());
        let mut dirs = std::collections::HashMap::new();
        dirs.insert(String::new(), rid);
        let mut total = 0;
        for (path, e) in items {
            let (parent, base) = match path.rfind('/') {
                Some(i) => (path[..i].to_string(), &path[i + 1..]),
                None => (String::new(), &path[..]),
            };
            let pid = dirs[&parent];
            let id = tree.add_child(pid, base, *e);
            total += 1;
            if e.is_dir() {
                dirs.insert(path.to_string(), id);
            }
        }
        for (_, id) in dirs {
            tree.sort_children_ci(id);
        }
        Snapshot {
            tree,
            root_dir: root.to_string(),
            total,
        }
    }

    fn kinds(d: &Diff) -> Vec<(DiffStatus, String, String)> {
        d.entries()
            .iter()
            .filter(|e| !e.status.contains(DiffStatus::SKIP))
            .map(|e| {
                (
                    e.status & DiffStatus::KIND_MASK,
                    e.lname.clone(),
                    e.rname.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_diff_self_is_all_eq() {
        let items = [
            ("a.txt", file(1, 100)),
            ("d", dir()),
            ("d/b.txt", file(2, 200)),
        ];
        let l = snap("/l", &items);
        let r = snap("/r", &items);
        let d = Diff::build(l, r, DiffOpts::empty());
        assert_eq!(3, d.stats.eq);
        assert_eq!(0, d.stats.left + d.stats.right + d.stats.neq + d.stats.moved);
    }

    #[test]
    fn test_diff_left_right_and_modified() {
        let l = snap(
            "/l",
            &[("common.txt", file(5, 100)), ("only-left.txt", file(1, 100))],
        );
        let r = snap(
            "/r",
            &[("common.txt", file(6, 100)), ("only-right.txt", file(2, 300))],
        );
        let d = Diff::build(l, r, DiffOpts::empty());
        assert_eq!(1, d.stats.left);
        assert_eq!(1, d.stats.right);
        assert_eq!(1, d.stats.neq);
        let neq = d
            .entries()
            .iter()
            .find(|e| e.status.contains(DiffStatus::NEQ))
            .unwrap();
        // right side is larger
        assert!(neq.status.contains(DiffStatus::SMALLER));
    }

    #[test]
    fn test_rename_detected_as_single_move() {
        let l = snap(
            "/l",
            &[("d", dir()), ("d/new-name.txt", file(7, 1234))],
        );
        let r = snap(
            "/r",
            &[("d", dir()), ("d/new-name.txt", file(7, 1234))],
        );
        // move the file on the right to a different path, same name+meta
        let l2 = snap(
            "/l",
            &[
                ("d", dir()),
                ("e", dir()),
                ("e/moved.txt", file(7, 1234)),
            ],
        );
        let r2 = snap(
            "/r",
            &[
                ("d", dir()),
                ("d/moved.txt", file(7, 1234)),
                ("e", dir()),
            ],
        );
        // sanity: unchanged trees diff clean
        let d0 = Diff::build(l, r, DiffOpts::empty());
        assert_eq!(0, d0.stats.moved);

        let d = Diff::build(l2, r2, DiffOpts::empty());
        assert_eq!(1, d.stats.moved, "{:?}", kinds(&d));
        assert_eq!(0, d.stats.left);
        assert_eq!(0, d.stats.right);
        let mv = d
            .entries()
            .iter()
            .find(|e| {
                e.status.contains(DiffStatus::MOVE) && !e.status.contains(DiffStatus::SKIP)
            })
            .unwrap();
        assert_eq!("e/moved.txt", mv.lname);
        assert_eq!("d/moved.txt", mv.rname);
    }

    #[test]
    fn test_move_requires_name_by_default() {
        let l = snap("/l", &[("renamed.txt", file(7, 1234))]);
        let r = snap("/r", &[("original.txt", file(7, 1234))]);
        let d = Diff::build(l, r, DiffOpts::empty());
        assert_eq!(0, d.stats.moved);
        let d2 = Diff::build(
            snap("/l", &[("renamed.txt", file(7, 1234))]),
            snap("/r", &[("original.txt", file(7, 1234))]),
            DiffOpts::MOVE_NO_NAME,
        );
        assert_eq!(1, d2.stats.moved);
    }

    #[test]
    fn test_time_2sec_granularity() {
        let l = snap("/l", &[("a", file(1, 1000))]);
        let r = snap("/r", &[("a", file(1, 1001))]);
        let strict = Diff::build(l, r, DiffOpts::empty());
        assert_eq!(1, strict.stats.neq);
        let lax = Diff::build(
            snap("/l", &[("a", file(1, 1000))]),
            snap("/r", &[("a", file(1, 1001))]),
            DiffOpts::TIME_2SEC,
        );
        assert_eq!(1, lax.stats.eq);
    }

    #[test]
    fn test_view_mask_and_dirs() {
        let l = snap("/l", &[("d", dir()), ("d/x", file(1, 1)), ("y", file(2, 2))]);
        let r = snap("/r", &[]);
        let mut d = Diff::build(l, r, DiffOpts::empty());
        let n = d.view(
            &ViewProps {
                show_dirs: true,
                ..ViewProps::default()
            },
            DiffStatus::LEFT,
        );
        assert_eq!(3, n);
        let n = d.view(
            &ViewProps {
                show_dirs: false,
                ..ViewProps::default()
            },
            DiffStatus::LEFT,
        );
        assert_eq!(2, n);
    }

    #[test]
    fn test_info_swap_presentation() {
        let l = snap("/l", &[("a", file(9, 100))]);
        let r = snap("/r", &[("a", file(1, 200))]);
        let mut d = Diff::build(l, r, DiffOpts::empty());
        d.view(
            &ViewProps {
                show_dirs: true,
                ..ViewProps::default()
            },
            DiffStatus::KIND_MASK,
        );
        let idx = d.selected()[0];
        let (st, _, _) = d.info(idx, false);
        assert!(st.contains(DiffStatus::LARGER) && st.contains(DiffStatus::OLDER));
        let (st, _, _) = d.info(idx, true);
        assert!(st.contains(DiffStatus::SMALLER) && st.contains(DiffStatus::NEWER));
    }
}
