/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `move`: move and/or rename files, with name-rewriting helpers.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use log::{error, warn};

use crate::args::{self, GlobalOpts};
use crate::core::com::{CmdInfo, CreateResult, InputOrder, Op};
use crate::core::error::Result;
use crate::core::file;
use crate::core::scheduler::OpId;
use crate::core::Core;

#[derive(Parser, Debug)]
#[command(
    name = "move",
    about = "Move and/or rename files.",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Move and rename a file out of its directory structure:
    /// "./a/b/file" -> "./a - b - file"
    #[arg(short = 'u', long)]
    unbranch: bool,

    /// Move a file out of its directory structure: "./a/b/file" -> "./file"
    #[arg(long = "unbranch-flat")]
    unbranch_flat: bool,

    /// Replace SEARCH text in the file name
    #[arg(short = 's', long, value_name = "SEARCH")]
    search: Option<String>,

    /// Replacement for --search
    #[arg(short = 'r', long, value_name = "REPLACE")]
    replace: Option<String>,

    /// Replace only the first occurrence
    #[arg(long = "replace-once")]
    replace_once: bool,

    /// Preserve the directory tree under the output directory
    #[arg(short = 't', long)]
    tree: bool,
}

pub struct MoveOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    n_moved: u32,

    unbranch: bool,
    unbranch_flat: bool,
    search: Option<String>,
    replace: String,
    replace_once: bool,
    tree: bool,
}

pub fn create(core: &Rc<Core>, mut cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    let opts = match args::parse_op::<Opts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    if let Err(e) = args::apply_global(core, &mut cmd, opts.g) {
        error!("{}", e);
        return Err((cmd, 1));
    }
    if opts.search.is_some() && opts.replace.is_none() {
        error!("--search requires --replace");
        return Err((cmd, 1));
    }
    if opts.unbranch || opts.unbranch_flat {
        cmd.recursive = true;
    }
    Ok(Rc::new(RefCell::new(MoveOp {
        cmd: Some(cmd),
        id,
        stop: false,
        n_moved: 0,
        unbranch: opts.unbranch,
        unbranch_flat: opts.unbranch_flat,
        search: opts.search,
        replace: opts.replace.unwrap_or_default(),
        replace_once: opts.replace_once,
        tree: opts.tree,
    })))
}

impl MoveOp {
    /// "parent/base/a/file" -> "parent/base - a - file"
    fn name_unbranch(in_name: &str, base: &str) -> String {
        let (parent, tail) = match base.rfind('/') {
            Some(i) => (&base[..i + 1], &in_name[i + 1..]),
            None => ("", in_name),
        };
        format!("{}{}", parent, tail.replace('/', " - "))
    }

    /// "parent/base/a/file" -> "parent/file"
    fn name_unbranch_flat(in_name: &str, base: &str) -> String {
        let parent = match base.rfind('/') {
            Some(i) => &base[..i + 1],
            None => "",
        };
        let file = match in_name.rfind('/') {
            Some(i) => &in_name[i + 1..],
            None => in_name,
        };
        format!("{}{}", parent, file)
    }

    fn target_name(&self, chdir: Option<&str>, in_name: &str, base: Option<&str>) -> Result<String> {
        let mut name = if self.unbranch {
            Self::name_unbranch(in_name, base.unwrap_or(in_name))
        } else if self.unbranch_flat {
            Self::name_unbranch_flat(in_name, base.unwrap_or(in_name))
        } else if self.tree {
            let dir = chdir.ok_or_else(|| {
                crate::core::error::Error::argument("--tree requires '-C DIR'")
            })?;
            return Ok(format!("{}/{}", dir, in_name.trim_start_matches('/')));
        } else if let Some(dir) = chdir {
            let file = in_name.rsplit('/').next().unwrap_or(in_name);
            format!("{}/{}", dir, file)
        } else {
            in_name.to_string()
        };

        if let Some(s) = &self.search {
            name = if self.replace_once {
                name.replacen(s.as_str(), &self.replace, 1)
            } else {
                name.replace(s.as_str(), &self.replace)
            };
        }
        Ok(name)
    }

    fn move_one(
        &mut self,
        chdir: Option<&str>,
        test: bool,
        overwrite: bool,
        in_name: &str,
        base: Option<&str>,
    ) -> Result<()> {
        let target = self.target_name(chdir, in_name, base)?;
        if target == in_name {
            return Ok(());
        }
        if !test {
            file::move_file(in_name, &target, !overwrite)?;
        }
        self.n_moved += 1;
        Ok(())
    }
}

impl Op for MoveOp {
    fn run(&mut self, core: &Rc<Core>) {
        let mut ok = true;
        loop {
            if self.stop {
                ok = false;
                break;
            }
            let next = {
                let cmd = self.cmd.as_mut().unwrap();
                cmd.input_next(InputOrder::Default)
            };
            let n = match next {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(e) => {
                    error!("{}", e);
                    ok = false;
                    break;
                }
            };

            let recurse_dirs = self.unbranch || self.unbranch_flat;
            let is_dir = std::fs::metadata(&n.name).map(|m| m.is_dir()).unwrap_or(false);
            let cmd = self.cmd.as_mut().unwrap();
            if is_dir && recurse_dirs {
                cmd.input_dir();
                continue;
            }

            let cmd = self.cmd.as_ref().unwrap();
            let (test, overwrite, skip_errors) = (cmd.test, cmd.overwrite, cmd.skip_errors);
            let chdir = cmd.chdir.clone();
            let r = self.move_one(chdir.as_deref(), test, overwrite, &n.name, n.base.as_deref());
            if let Err(e) = r {
                if skip_errors {
                    warn!("{}", e);
                } else {
                    error!("{}", e);
                    ok = false;
                    break;
                }
            }
        }

        log::info!("moved {} files", self.n_moved);
        let cmd = self.cmd.take().unwrap();
        core.com.complete(core, cmd, self.id, if ok { 0 } else { 1 });
    }

    fn signal(&mut self, _sig: u32) {
        self.stop = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_unbranch() {
        assert_eq!(
            "par/a - b - file",
            MoveOp::name_unbranch("par/a/b/file", "par/a")
        );
        assert_eq!("a - file", MoveOp::name_unbranch("a/file", "a"));
    }

    #[test]
    fn test_name_unbranch_flat() {
        assert_eq!(
            "par/file",
            MoveOp::name_unbranch_flat("par/a/b/file", "par/a")
        );
    }

    fn run_move(args: &[&str]) -> i32 {
        let core = Core::new(crate::core::CoreConf::default(), crate::ops::REGISTRY);
        let mut cmd = CmdInfo::new();
        cmd.operation = "move".into();
        cmd.argv = args.iter().map(|s| s.to_string()).collect();
        match core.com.run(&core, cmd) {
            Err(code) => code,
            Ok(()) => core.sched.run(&core),
        }
    }

    #[test]
    fn test_move_search_replace() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("report-draft.txt");
        std::fs::write(&a, b"x").unwrap();
        assert_eq!(
            0,
            run_move(&[a.to_str().unwrap(), "-s", "draft", "-r", "final"])
        );
        assert!(dir.path().join("report-final.txt").exists());
        assert!(!a.exists());
    }

    #[test]
    fn test_move_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"y").unwrap();
        assert_eq!(1, run_move(&[a.to_str().unwrap(), "-s", "a.txt", "-r", "b.txt"]));
        assert_eq!(b"y".to_vec(), std::fs::read(&b).unwrap());
    }
}
