/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-entry synchronization actions, dispatched as sub-operations through
//! the operation manager.

use std::rc::Rc;

use log::{debug, info};

use crate::core::com::{CmdInfo, OnComplete};
use crate::core::error::{Error, Result};
use crate::core::file;
use crate::core::Core;
use crate::sync::diff::{Diff, DiffStatus};

/// Which action classes the user enabled.
#[derive(Default, Clone, Copy)]
pub struct Enabled {
    /// Copy left-only entries to the right.
    pub add: bool,
    /// Trash right-only entries.
    pub delete: bool,
    /// Overwrite modified entries.
    pub update: bool,
    /// Rename moved entries on the right.
    pub mv: bool,
}

#[derive(Clone, Default)]
pub struct ActionOpts {
    pub replace_date: bool,
    pub write_into: bool,
    pub test: bool,
    pub buffer_size: usize,
}

pub enum Outcome {
    /// A sub-operation was started; the continuation fires on completion.
    Started,
    /// Completed synchronously.
    Done,
    /// Nothing to do for this entry.
    Skipped,
}

fn join(root: &str, rel: &str) -> String {
    if rel.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root, rel)
    }
}

/// Execute the sync action for one diff entry.  `on_complete` is consumed
/// only when a sub-operation is actually started.
pub fn sync_entry(
    core: &Rc<Core>,
    diff: &Diff,
    idx: usize,
    enabled: Enabled,
    opts: &ActionOpts,
    on_complete: OnComplete,
) -> Result<Outcome> {
    let e = &diff.entries()[idx];
    let kind = e.status & DiffStatus::KIND_MASK;
    let lsrc = join(&diff.left.root_dir, &e.lname);
    let rdst_mirror = join(&diff.right.root_dir, &e.lname);
    let rdst = join(&diff.right.root_dir, &e.rname);

    if kind.contains(DiffStatus::LEFT) && enabled.add {
        if e.status.contains(DiffStatus::DIR) {
            if !opts.test {
                file::dir_create(&rdst_mirror, true)?;
            }
            return Ok(Outcome::Done);
        }
        debug!("sync: add '{}' -> '{}'", lsrc, rdst_mirror);
        run_copy(core, opts, &lsrc, &rdst_mirror, false, on_complete)?;
        return Ok(Outcome::Started);
    }

    if kind.contains(DiffStatus::NEQ) && enabled.update {
        if e.status.contains(DiffStatus::DIR) {
            return Ok(Outcome::Skipped);
        }
        if opts.replace_date {
            if !opts.test {
                let mtime = e
                    .left
                    .map(|id| diff.left.tree.data(id).mtime)
                    .ok_or_else(|| Error::internal("modified entry without a left side"))?;
                let f = std::fs::File::options()
                    .write(true)
                    .open(&rdst)
                    .map_err(|er| Error::system(format!("file open: '{}'", rdst), er))?;
                f.set_modified(mtime)
                    .map_err(|er| Error::system(format!("file set mtime: '{}'", rdst), er))?;
            }
            info!("replace date: {}", rdst);
            return Ok(Outcome::Done);
        }
        debug!("sync: update '{}' -> '{}'", lsrc, rdst);
        run_copy(core, opts, &lsrc, &rdst, true, on_complete)?;
        return Ok(Outcome::Started);
    }

    if kind.contains(DiffStatus::RIGHT) && enabled.delete {
        debug!("sync: delete '{}'", rdst);
        let mut cmd = CmdInfo::new();
        cmd.operation = "trash".into();
        cmd.input = vec![rdst];
        cmd.test = opts.test;
        cmd.buffer_size = opts.buffer_size;
        cmd.on_complete = Some(on_complete);
        core.com
            .run(core, cmd)
            .map_err(|_| Error::format("trash sub-operation failed to start"))?;
        return Ok(Outcome::Started);
    }

    if kind.contains(DiffStatus::MOVE) && enabled.mv {
        debug!("sync: move '{}' -> '{}'", rdst, rdst_mirror);
        if !opts.test {
            file::move_file(&rdst, &rdst_mirror, true)?;
        }
        return Ok(Outcome::Done);
    }

    Ok(Outcome::Skipped)
}

fn run_copy(
    core: &Rc<Core>,
    opts: &ActionOpts,
    src: &str,
    dst: &str,
    overwrite: bool,
    on_complete: OnComplete,
) -> Result<()> {
    let mut cmd = CmdInfo::new();
    cmd.operation = "copy".into();
    cmd.input = vec![src.to_string()];
    cmd.output = Some(dst.to_string());
    cmd.overwrite = overwrite;
    cmd.test = opts.test;
    cmd.buffer_size = opts.buffer_size;
    if opts.write_into {
        cmd.argv = vec!["--write-into".into()];
    }
    cmd.on_complete = Some(on_complete);
    core.com
        .run(core, cmd)
        .map_err(|_| Error::format("copy sub-operation failed to start"))
}
