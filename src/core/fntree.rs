/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::VecDeque;

/// Arena index of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

struct Node<D> {
    name: String,
    data: D,
    parent: Option<NodeId>,
    /// Attached directory block: the node's scanned contents.
    children: Option<Vec<NodeId>>,
}

/// File-name tree with arena-allocated nodes.  Root nodes carry the literal
/// paths the user supplied; directory contents are attached on demand as
/// child blocks.
pub struct FnTree<D> {
    nodes: Vec<Node<D>>,
    roots: Vec<NodeId>,
}

impl<D> FnTree<D> {
    pub fn new() -> Self {
        FnTree {
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn add_root(&mut self, name: impl Into<String>, data: D) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.into(),
            data,
            parent: None,
            children: None,
        });
        self.roots.push(id);
        id
    }

    /// Add a child under `parent`, creating its block if necessary.
    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>, data: D) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.into(),
            data,
            parent: Some(parent),
            children: None,
        });
        self.nodes[parent.0]
            .children
            .get_or_insert_with(Vec::new)
            .push(id);
        id
    }

    /// Attach a directory block of `entries` to `parent` in one step.
    pub fn attach(&mut self, parent: NodeId, entries: Vec<(String, D)>) {
        for (name, data) in entries {
            self.add_child(parent, name, data);
        }
        if self.nodes[parent.0].children.is_none() {
            // an empty directory still counts as scanned
            self.nodes[parent.0].children = Some(Vec::new());
        }
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn data(&self, id: NodeId) -> &D {
        &self.nodes[id.0].data
    }

    pub fn children(&self, id: NodeId) -> Option<&[NodeId]> {
        self.nodes[id.0].children.as_deref()
    }

    pub fn has_block(&self, id: NodeId) -> bool {
        self.nodes[id.0].children.is_some()
    }

    /// Full path of a node: its root ancestor's literal joined with every
    /// component below it.
    pub fn path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            parts.push(self.nodes[c.0].name.as_str());
            cur = self.nodes[c.0].parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// The literal root this node descends from; `None` if it is a root.
    pub fn root_ancestor(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = id;
        loop {
            match self.nodes[cur.0].parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        (cur != id).then_some(cur)
    }

    pub fn sort_children_ci(&mut self, id: NodeId) {
        let Some(mut kids) = self.nodes[id.0].children.take() else {
            return;
        };
        kids.sort_by(|a, b| {
            let an = self.nodes[a.0].name.to_lowercase();
            let bn = self.nodes[b.0].name.to_lowercase();
            an.cmp(&bn)
        });
        self.nodes[id.0].children = Some(kids);
    }
}

/// Depth-first cursor: yields a directory entry, then (once a block is
/// attached to it) that directory's contents, then the following sibling.
pub struct DfsCursor {
    frames: Vec<Frame>,
    last: Option<NodeId>,
    started: bool,
}

struct Frame {
    owner: Option<NodeId>,
    idx: usize,
}

impl DfsCursor {
    pub fn new() -> Self {
        DfsCursor {
            frames: Vec::new(),
            last: None,
            started: false,
        }
    }

    fn items<'t, D>(tree: &'t FnTree<D>, owner: Option<NodeId>) -> &'t [NodeId] {
        match owner {
            None => tree.roots(),
            Some(id) => tree.children(id).unwrap_or(&[]),
        }
    }

    pub fn next<D>(&mut self, tree: &FnTree<D>) -> Option<NodeId> {
        if !self.started {
            self.started = true;
            self.frames.push(Frame {
                owner: None,
                idx: 0,
            });
        }
        // descend into a block attached to the last yielded entry
        if let Some(last) = self.last.take() {
            if tree.has_block(last) {
                self.frames.push(Frame {
                    owner: Some(last),
                    idx: 0,
                });
            }
        }
        loop {
            let frame = self.frames.last_mut()?;
            let items = Self::items(tree, frame.owner);
            if frame.idx >= items.len() {
                self.frames.pop();
                continue;
            }
            let id = items[frame.idx];
            frame.idx += 1;
            self.last = Some(id);
            return Some(id);
        }
    }
}

/// Directory-contents-first cursor: yields the complete contents of the
/// current block before entering any of its subdirectories.
pub struct DirFirstCursor {
    blocks: VecDeque<Option<NodeId>>,
    cur: Option<(Option<NodeId>, usize)>,
    started: bool,
}

impl DirFirstCursor {
    pub fn new() -> Self {
        DirFirstCursor {
            blocks: VecDeque::new(),
            cur: None,
            started: false,
        }
    }

    pub fn next<D>(&mut self, tree: &FnTree<D>) -> Option<NodeId> {
        if !self.started {
            self.started = true;
            self.blocks.push_back(None);
        }
        loop {
            if self.cur.is_none() {
                let owner = self.blocks.pop_front()?;
                self.cur = Some((owner, 0));
            }
            let (owner, idx) = self.cur.as_mut().unwrap();
            let items = DfsCursor::items(tree, *owner);
            if *idx < items.len() {
                let id = items[*idx];
                *idx += 1;
                return Some(id);
            }
            // block finished: queue the blocks its entries gathered
            for &id in items {
                if tree.has_block(id) {
                    self.blocks.push_back(Some(id));
                }
            }
            self.cur = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (FnTree<()>, NodeId) {
        let mut t = FnTree::new();
        let d = t.add_root("dir", ());
        t.add_root("z.txt", ());
        (t, d)
    }

    #[test]
    fn test_path_joins_components() {
        let mut t = FnTree::new();
        let d = t.add_root("/tmp/dir", ());
        let s = t.add_child(d, "sub", ());
        let f = t.add_child(s, "f.txt", ());
        assert_eq!("/tmp/dir/sub/f.txt", t.path(f));
        assert_eq!(Some(d), t.root_ancestor(f));
        assert_eq!(None, t.root_ancestor(d));
    }

    #[test]
    fn test_dfs_enters_directory_after_yield() {
        let (mut t, d) = sample();
        let mut cur = DfsCursor::new();
        assert_eq!("dir", t.name(cur.next(&t).unwrap()));
        // directory contents arrive between next() calls
        t.attach(
            d,
            vec![("a".to_string(), ()), ("b".to_string(), ())],
        );
        assert_eq!("a", t.name(cur.next(&t).unwrap()));
        assert_eq!("b", t.name(cur.next(&t).unwrap()));
        assert_eq!("z.txt", t.name(cur.next(&t).unwrap()));
        assert!(cur.next(&t).is_none());
    }

    #[test]
    fn test_dirfirst_completes_block_before_descending() {
        let mut t = FnTree::new();
        let d1 = t.add_root("d1", ());
        t.add_root("d2", ());
        let mut cur = DirFirstCursor::new();
        assert_eq!("d1", t.name(cur.next(&t).unwrap()));
        t.attach(d1, vec![("inner".to_string(), ())]);
        // d2 is yielded before d1's contents
        assert_eq!("d2", t.name(cur.next(&t).unwrap()));
        assert_eq!("inner", t.name(cur.next(&t).unwrap()));
        assert!(cur.next(&t).is_none());
    }

    #[test]
    fn test_sort_children_case_insensitive() {
        let mut t = FnTree::new();
        let d = t.add_root("d", ());
        t.add_child(d, "B", ());
        t.add_child(d, "a", ());
        t.sort_children_ci(d);
        let kids: Vec<_> = t.children(d).unwrap().iter().map(|&c| t.name(c)).collect();
        assert_eq!(vec!["a", "B"], kids);
    }
}
