/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::rc::Rc;

use glob::{MatchOptions, Pattern};
use log::{debug, error};

use crate::core::error::{Error, Result};
use crate::core::fntree::{DfsCursor, DirFirstCursor, FnTree, NodeId};
use crate::core::pipe::{PipeReader, PipeWriter};
use crate::core::scheduler::{OpId, Task};
use crate::core::Core;

/// Typed completion continuation: invoked with the operation's result code
/// (0 = success) when it finishes.
pub type OnComplete = Box<dyn FnOnce(&Rc<Core>, i32)>;

/// Stop signal delivered by `signal_all`.
pub const SIG_STOP: u32 = 1;

/// A running operation.  `run` is re-entered via posted tasks after every
/// `Async` suspension; `signal` requests early termination.
pub trait Op {
    fn run(&mut self, core: &Rc<Core>);
    fn signal(&mut self, _sig: u32) {}
}

/// Result of an operation factory: the operation, or the descriptor back
/// plus the completion code to report (used for argument errors and for
/// `--help`, which completes immediately).
pub type CreateResult = std::result::Result<Rc<RefCell<dyn Op>>, (Box<CmdInfo>, i32)>;

pub struct OpDesc {
    pub name: &'static str,
    pub create: fn(&Rc<Core>, Box<CmdInfo>, OpId) -> CreateResult,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum InputOrder {
    /// Yield a directory, then its contents.
    Default,
    /// Yield the complete directory contents before entering subdirectories.
    DirFirst,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    File,
    Dir,
    /// Detect from the file system.
    Auto,
}

#[derive(PartialEq, Eq, Debug)]
pub enum Allowed {
    Yes,
    NotIncluded,
    Excluded,
}

pub struct InputName {
    /// Full path of the entry.
    pub name: String,
    /// The user-supplied root directory this entry was found under; `None`
    /// for the literals themselves.
    pub base: Option<String>,
}

enum IterCursor {
    Dfs(DfsCursor),
    DirFirst(DirFirstCursor),
}

struct InputIter {
    tree: FnTree<()>,
    cursor: Option<IterCursor>,
    seeded: bool,
    pending_dir: bool,
    last: Option<NodeId>,
}

impl InputIter {
    fn new() -> Self {
        InputIter {
            tree: FnTree::new(),
            cursor: None,
            seeded: false,
            pending_dir: false,
            last: None,
        }
    }
}

/// Shared descriptor of one operation: parsed command-line state plus the
/// input-iteration service.
pub struct CmdInfo {
    pub operation: String,
    /// Residual argv for the operation's own parser.
    pub argv: Vec<String>,
    pub input: Vec<String>,
    pub include: Vec<Pattern>,
    pub exclude: Vec<Pattern>,
    /// `@FILE` input-list path; empty string means stdin.
    pub input_list: Option<String>,
    pub output: Option<String>,
    pub chdir: Option<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub overwrite: bool,
    pub test: bool,
    pub no_prealloc: bool,
    pub directio: bool,
    pub recursive: bool,
    pub skip_errors: bool,
    pub buffer_size: usize,
    pub fd_stdin: Option<PipeReader>,
    pub fd_stdout: Option<PipeWriter>,
    pub on_complete: Option<OnComplete>,
    iter: InputIter,
}

impl CmdInfo {
    pub fn new() -> Box<Self> {
        Box::new(CmdInfo {
            operation: String::new(),
            argv: Vec::new(),
            input: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            input_list: None,
            output: None,
            chdir: None,
            stdin: false,
            stdout: false,
            overwrite: false,
            test: false,
            no_prealloc: false,
            directio: false,
            recursive: false,
            skip_errors: false,
            buffer_size: 0,
            fd_stdin: None,
            fd_stdout: None,
            on_complete: None,
            iter: InputIter::new(),
        })
    }

    fn seed(&mut self) -> Result<()> {
        for name in &self.input {
            self.iter.tree.add_root(name.clone(), ());
        }
        if let Some(list) = self.input_list.take() {
            let mut data = String::new();
            if list.is_empty() {
                debug!("reading input names from stdin");
                std::io::stdin()
                    .read_to_string(&mut data)
                    .map_err(|e| Error::system("input names read", e))?;
            } else {
                debug!("reading input names from file '{}'", list);
                data = fs::read_to_string(&list)
                    .map_err(|e| Error::system(format!("file read: '{}'", list), e))?;
            }
            for line in data.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    self.iter.tree.add_root(line, ());
                }
            }
        }
        Ok(())
    }

    /// Get the next input file name, expanding directories attached via
    /// [`CmdInfo::input_dir`].
    pub fn input_next(&mut self, order: InputOrder) -> Result<Option<InputName>> {
        if !self.iter.seeded {
            self.iter.seeded = true;
            self.seed()?;
        }

        if self.iter.pending_dir {
            self.iter.pending_dir = false;
            let dir = self.iter.last.expect("input_dir without a current entry");
            let path = self.iter.tree.path(dir);
            let rd = fs::read_dir(&path)
                .map_err(|e| Error::system(format!("dir open: '{}'", path), e))?;
            let mut names = Vec::new();
            for e in rd {
                let e = e.map_err(|e| Error::system(format!("dir read: '{}'", path), e))?;
                names.push(e.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            debug!("scanned directory '{}': {} entries", path, names.len());
            self.iter
                .tree
                .attach(dir, names.into_iter().map(|n| (n, ())).collect());
        }

        let cursor = self.iter.cursor.get_or_insert_with(|| match order {
            InputOrder::Default => IterCursor::Dfs(DfsCursor::new()),
            InputOrder::DirFirst => IterCursor::DirFirst(DirFirstCursor::new()),
        });
        let id = match cursor {
            IterCursor::Dfs(c) => c.next(&self.iter.tree),
            IterCursor::DirFirst(c) => c.next(&self.iter.tree),
        };
        let Some(id) = id else {
            debug!("no more input files");
            return Ok(None);
        };
        self.iter.last = Some(id);

        let name = self.iter.tree.path(id);
        let base = self
            .iter
            .tree
            .root_ancestor(id)
            .map(|r| self.iter.tree.path(r));
        debug!("input file name: '{}' / '{:?}'", name, base);
        Ok(Some(InputName { name, base }))
    }

    /// The entry just returned by `input_next` is a directory: scan it and
    /// iterate its contents next.
    pub fn input_dir(&mut self) {
        self.iter.pending_dir = true;
    }

    /// Evaluate include/exclude filters for `name`.  Directories always pass
    /// the include set so that `-I '*.txt'` matches files inside them.
    pub fn input_allowed(&self, name: &str, kind: InputKind) -> Allowed {
        let opts = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::default()
        };

        let is_dir = match kind {
            InputKind::Dir => true,
            InputKind::File => false,
            InputKind::Auto => {
                !self.include.is_empty()
                    && fs::metadata(name).map(|m| m.is_dir()).unwrap_or(false)
            }
        };

        if !self.include.is_empty() && !is_dir {
            let hit = self
                .include
                .iter()
                .find(|p| p.matches_with(name, opts));
            match hit {
                Some(p) => debug!("include: '{}' by '{}'", name, p),
                None => return Allowed::NotIncluded,
            }
        }

        if let Some(p) = self.exclude.iter().find(|p| p.matches_with(name, opts)) {
            debug!("exclude: '{}' by '{}'", name, p);
            return Allowed::Excluded;
        }
        Allowed::Yes
    }
}

/// Owns the lifetime of all running operations.
pub struct Com {
    ops: RefCell<HashMap<OpId, Rc<RefCell<dyn Op>>>>,
    next_id: Cell<OpId>,
    registry: &'static [OpDesc],
}

impl Com {
    pub fn new(registry: &'static [OpDesc]) -> Self {
        Com {
            ops: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            registry,
        }
    }

    pub fn provide(&self, name: &str) -> Option<&'static OpDesc> {
        self.registry.iter().find(|d| d.name == name)
    }

    /// Create and begin an operation.  A sub-operation (descriptor carrying
    /// a completion continuation) is started via a posted task; a primary
    /// operation runs immediately.
    pub fn run(&self, core: &Rc<Core>, cmd: Box<CmdInfo>) -> std::result::Result<(), i32> {
        let Some(desc) = self.provide(&cmd.operation) else {
            error!("unknown operation: {}", cmd.operation);
            self.finish_descriptor(core, cmd, 1);
            return Err(1);
        };

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let is_sub = cmd.on_complete.is_some();
        debug!("{}: creating operation #{}", cmd.operation, id);

        match (desc.create)(core, cmd, id) {
            Ok(op) => {
                self.ops.borrow_mut().insert(id, op);
                if is_sub {
                    core.sched.post(Task::RunOp(id));
                } else {
                    self.run_op(core, id);
                }
                Ok(())
            }
            Err((cmd, code)) => {
                self.finish_descriptor(core, cmd, code);
                if code != 0 {
                    Err(code)
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn run_op(&self, core: &Rc<Core>, id: OpId) {
        let op = self.ops.borrow().get(&id).cloned();
        match op {
            Some(op) => op.borrow_mut().run(core),
            None => debug!("op #{}: already finished", id),
        }
    }

    /// Operation signals its completion.  Consumes the descriptor: runs the
    /// continuation, or stops the event loop for a primary operation.
    pub fn complete(&self, core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId, code: i32) {
        self.ops.borrow_mut().remove(&id);
        debug!("{}: operation #{} finished: {}", cmd.operation, id, code);
        self.finish_descriptor(core, cmd, code);
    }

    fn finish_descriptor(&self, core: &Rc<Core>, mut cmd: Box<CmdInfo>, code: i32) {
        match cmd.on_complete.take() {
            Some(cb) => cb(core, code),
            None => core.sched.exit(code),
        }
    }

    /// Deliver a signal to every active operation.
    pub fn signal_all(&self, sig: u32) {
        let ops: Vec<_> = self.ops.borrow().values().cloned().collect();
        for op in ops {
            if let Ok(mut op) = op.try_borrow_mut() {
                op.signal(sig);
            }
        }
    }
}

pub fn compile_patterns(raw: &[String]) -> Result<Vec<Pattern>> {
    raw.iter()
        .map(|s| Pattern::new(s).map_err(|e| Error::argument(format!("bad pattern '{}': {}", s, e))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd_with_patterns(include: &[&str], exclude: &[&str]) -> Box<CmdInfo> {
        let mut cmd = CmdInfo::new();
        cmd.include = include.iter().map(|s| Pattern::new(s).unwrap()).collect();
        cmd.exclude = exclude.iter().map(|s| Pattern::new(s).unwrap()).collect();
        cmd
    }

    #[test]
    fn test_input_allowed_include() {
        let cmd = cmd_with_patterns(&["*.txt"], &[]);
        assert_eq!(Allowed::Yes, cmd.input_allowed("a/b.TXT", InputKind::File));
        assert_eq!(
            Allowed::NotIncluded,
            cmd.input_allowed("a/b.bin", InputKind::File)
        );
        // directories pass the include filter
        assert_eq!(Allowed::Yes, cmd.input_allowed("a", InputKind::Dir));
    }

    #[test]
    fn test_input_allowed_exclude_wins() {
        let cmd = cmd_with_patterns(&["*.txt"], &["*old*"]);
        assert_eq!(
            Allowed::Excluded,
            cmd.input_allowed("old/b.txt", InputKind::File)
        );
    }

    #[test]
    fn test_input_next_literals() {
        let mut cmd = CmdInfo::new();
        cmd.input = vec!["a".into(), "b".into()];
        let n1 = cmd.input_next(InputOrder::Default).unwrap().unwrap();
        assert_eq!("a", n1.name);
        assert_eq!(None, n1.base);
        let n2 = cmd.input_next(InputOrder::Default).unwrap().unwrap();
        assert_eq!("b", n2.name);
        assert!(cmd.input_next(InputOrder::Default).unwrap().is_none());
    }

    #[test]
    fn test_input_next_recurses_into_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("top");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("f1"), b"1").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/f2"), b"2").unwrap();

        let mut cmd = CmdInfo::new();
        let root_s = root.to_str().unwrap().to_string();
        cmd.input = vec![root_s.clone()];

        let n = cmd.input_next(InputOrder::Default).unwrap().unwrap();
        assert_eq!(root_s, n.name);
        cmd.input_dir();

        let mut seen = Vec::new();
        loop {
            let Some(n) = cmd.input_next(InputOrder::Default).unwrap() else {
                break;
            };
            assert_eq!(Some(root_s.clone()), n.base);
            if n.name.ends_with("sub") {
                cmd.input_dir();
            }
            seen.push(n.name);
        }
        assert_eq!(
            vec![
                format!("{root_s}/f1"),
                format!("{root_s}/sub"),
                format!("{root_s}/sub/f2"),
            ],
            seen
        );
    }

    #[test]
    fn test_input_list_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("names.txt");
        fs::write(&list, "one\n\n  two  \n").unwrap();
        let mut cmd = CmdInfo::new();
        cmd.input_list = Some(list.to_str().unwrap().to_string());
        let mut names = Vec::new();
        while let Some(n) = cmd.input_next(InputOrder::Default).unwrap() {
            names.push(n.name);
        }
        assert_eq!(vec!["one", "two"], names);
    }
}
