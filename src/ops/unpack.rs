/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `unpack`: unpack any supported archive type, detecting the reader from
//! the input extension; `.tar.gz`-style inputs run a decompressor and the
//! container reader joined by an in-memory pipe.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use log::{debug, error};

use crate::args::{self, GlobalOpts};
use crate::core::com::{CmdInfo, CreateResult, InputOrder, Op};
use crate::core::pipe::{pipe, PipeWriter};
use crate::core::scheduler::{OpId, Task};
use crate::core::Core;

/// Input extension → operation name (sorted for binary search).
const EXT_OP: &[(&str, &str)] = &[
    ("7z", "un7z"),
    ("gz", "ungz"),
    ("iso", "uniso"),
    ("tar", "untar"),
    ("xz", "unxz"),
    ("zip", "unzip"),
    ("zipx", "unzip"),
    ("zst", "unzst"),
];

fn op_find_ext(ext: &str) -> Option<&'static str> {
    let ext = ext.to_lowercase();
    EXT_OP
        .binary_search_by(|e| e.0.cmp(ext.as_str()))
        .ok()
        .map(|i| EXT_OP[i].1)
}

/// Returns (first-stage op, optional second-stage op).
pub fn unpack_detect(iname: &str) -> Option<(&'static str, Option<&'static str>)> {
    let file = iname.rsplit('/').next().unwrap_or(iname);
    let mut parts = file.rsplit('.');
    let ext1 = parts.next().unwrap_or("");
    let ext2 = parts.next();

    if ext1.eq_ignore_ascii_case("tgz") {
        return Some(("ungz", Some("untar")));
    }
    if ext1.eq_ignore_ascii_case("txz") {
        return Some(("unxz", Some("untar")));
    }

    // file.tar.gz: `ungz | untar`
    if let Some(e2) = ext2 {
        if e2.eq_ignore_ascii_case("tar") && matches!(ext1.to_lowercase().as_str(), "gz" | "xz" | "zst")
        {
            return op_find_ext(ext1).map(|op| (op, Some("untar")));
        }
    }
    op_find_ext(ext1).map(|op| (op, None))
}

#[derive(Parser, Debug)]
#[command(
    name = "unpack",
    about = "Unpack files from all supported archive types.",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Just show the file list
    #[arg(short = 'l', long)]
    list: bool,

    /// Plain file names
    #[arg(long)]
    plain: bool,

    /// Add to the output directory a subdirectory named after the archive
    #[arg(long)]
    autodir: bool,

    /// Extract only this member (repeatable; wildcards allowed)
    #[arg(short = 'm', long = "member", value_name = "NAME")]
    member: Vec<String>,

    /// Read member names from a file, one per line
    #[arg(long = "members-from-file", value_name = "FILE")]
    members_from_file: Option<String>,
}

#[derive(Default)]
struct Shared {
    r1: Option<i32>,
    r2: Option<i32>,
    pw: Option<PipeWriter>,
}

enum State {
    NextInput,
    Wait,
}

pub struct UnpackOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    state: State,
    shared: Rc<RefCell<Shared>>,
    extra_argv: Vec<String>,
    nfiles: u32,
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

    let mut extra_argv = Vec::new();
    if opts.list {
        extra_argv.push("--list".to_string());
    }
    if opts.plain {
        extra_argv.push("--plain".to_string());
    }
    if opts.autodir {
        extra_argv.push("--autodir".to_string());
    }
    for m in &opts.member {
        extra_argv.push("--member".to_string());
        extra_argv.push(m.clone());
    }
    if let Some(f) = &opts.members_from_file {
        extra_argv.push("--members-from-file".to_string());
        extra_argv.push(f.clone());
    }

    Ok(Rc::new(RefCell::new(UnpackOp {
        cmd: Some(cmd),
        id,
        stop: false,
        state: State::NextInput,
        shared: Rc::new(RefCell::new(Shared::default())),
        extra_argv,
        nfiles: 0,
    })))
}

impl UnpackOp {
    /// Final-stage child: gets output options, extras and the completion
    /// continuation that wakes this operation.
    fn wire_final(&self, core: &Rc<Core>, mut c: Box<CmdInfo>) -> Result<(), ()> {
        let cmd = self.cmd.as_ref().unwrap();
        c.output = cmd.output.clone();
        c.chdir = cmd.chdir.clone();
        c.include = cmd.include.clone();
        c.exclude = cmd.exclude.clone();
        c.argv = self.extra_argv.clone();
        let sh = self.shared.clone();
        let id = self.id;
        c.on_complete = Some(Box::new(move |core, res| {
            sh.borrow_mut().r2 = Some(res);
            core.sched.post(Task::RunOp(id));
        }));
        core.com.run(core, c).map(|_| ()).map_err(|_| ())
    }

    fn child_base(&self, op: &str) -> Box<CmdInfo> {
        let cmd = self.cmd.as_ref().unwrap();
        let mut c = CmdInfo::new();
        c.operation = op.to_string();
        c.test = cmd.test;
        c.overwrite = cmd.overwrite;
        c.skip_errors = cmd.skip_errors;
        c.buffer_size = cmd.buffer_size;
        c.directio = cmd.directio;
        c
    }

    fn begin(&mut self, core: &Rc<Core>, iname: &str) -> Result<bool, ()> {
        let Some((op1, op2)) = unpack_detect(iname) else {
            debug!("unpack: '{}': not an archive, skipping", iname);
            return Ok(false);
        };
        debug!("unpack: {} {:?} <- {}", op1, op2, iname);
        *self.shared.borrow_mut() = Shared::default();

        match op2 {
            None => {
                let mut c = self.child_base(op1);
                c.input = vec![iname.to_string()];
                self.wire_final(core, c)?;
            }
            Some(op2) => {
                let (pw, pr) = pipe();
                self.shared.borrow_mut().pw = Some(pw.clone());

                // decompressor streams the archive into the pipe
                let mut c1 = self.child_base(op1);
                c1.input = vec![iname.to_string()];
                c1.stdout = true;
                c1.fd_stdout = Some(pw);
                let sh = self.shared.clone();
                c1.on_complete = Some(Box::new(move |core, res| {
                    let mut s = sh.borrow_mut();
                    s.r1 = Some(res);
                    if let Some(pw) = s.pw.take() {
                        pw.close(core);
                    }
                }));
                if core.com.run(core, c1).is_err() {
                    return Err(());
                }

                // container reader consumes the pipe as its stdin
                let mut c2 = self.child_base(op2);
                c2.stdin = true;
                c2.fd_stdin = Some(pr);
                self.wire_final(core, c2)?;
            }
        }
        Ok(true)
    }
}

impl Op for UnpackOp {
    fn run(&mut self, core: &Rc<Core>) {
        let code = loop {
            if self.stop {
                break 1;
            }
            match self.state {
                State::NextInput => {
                    let next = {
                        let cmd = self.cmd.as_mut().unwrap();
                        cmd.input_next(InputOrder::Default)
                    };
                    match next {
                        Ok(Some(n)) => match self.begin(core, &n.name) {
                            Ok(true) => {
                                self.nfiles += 1;
                                self.state = State::Wait;
                                return;
                            }
                            Ok(false) => continue,
                            Err(()) => break 1,
                        },
                        Ok(None) => {
                            if self.nfiles == 0 {
                                error!("no input files");
                                break 1;
                            }
                            break 0;
                        }
                        Err(e) => {
                            error!("{}", e);
                            break 1;
                        }
                    }
                }
                State::Wait => {
                    let s = self.shared.borrow();
                    let Some(r2) = s.r2 else { return };
                    let r = match s.r1 {
                        Some(r1) if r1 != 0 => r1,
                        _ => r2,
                    };
                    drop(s);
                    if r != 0 {
                        break r;
                    }
                    self.state = State::NextInput;
                }
            }
        };

        let cmd = self.cmd.take().unwrap();
        core.com.complete(core, cmd, self.id, code);
    }

    fn signal(&mut self, _sig: u32) {
        self.stop = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_detect_simple() {
        assert_eq!(Some(("unzip", None)), unpack_detect("a.zip"));
        assert_eq!(Some(("un7z", None)), unpack_detect("a.7z"));
        assert_eq!(Some(("uniso", None)), unpack_detect("disk.iso"));
        assert_eq!(None, unpack_detect("file.txt"));
    }

    #[test]
    fn test_unpack_detect_two_stage() {
        assert_eq!(Some(("ungz", Some("untar"))), unpack_detect("a.tar.gz"));
        assert_eq!(Some(("ungz", Some("untar"))), unpack_detect("a.tgz"));
        assert_eq!(Some(("unxz", Some("untar"))), unpack_detect("a.txz"));
        assert_eq!(Some(("unzst", Some("untar"))), unpack_detect("a.tar.zst"));
    }
}
