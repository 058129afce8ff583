/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `pack`: pack files into any supported archive type.  The target format
//! comes from the output extension; `.tar.gz`-style names run a container
//! writer and a compressor joined by an in-memory pipe.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use log::{debug, error};

use crate::args::{self, GlobalOpts};
use crate::core::com::{CmdInfo, CreateResult, Op};
use crate::core::pipe::{pipe, PipeWriter};
use crate::core::scheduler::{OpId, Task};
use crate::core::Core;

/// Output extension → operation name (sorted for binary search).
const EXT_OP: &[(&str, &str)] = &[
    ("gz", "gz"),
    ("iso", "iso"),
    ("tar", "tar"),
    ("zip", "zip"),
    ("zipx", "zip"),
    ("zst", "zst"),
];

fn op_find_ext(ext: &str) -> Option<&'static str> {
    let ext = ext.to_lowercase();
    EXT_OP
        .binary_search_by(|e| e.0.cmp(ext.as_str()))
        .ok()
        .map(|i| EXT_OP[i].1)
}

/// Returns (container-or-only op, optional compressor op).
pub fn pack_detect(oname: &str) -> Option<(&'static str, Option<&'static str>)> {
    let file = oname.rsplit('/').next().unwrap_or(oname);
    let mut parts = file.rsplit('.');
    let ext1 = parts.next().unwrap_or("");
    let ext2 = parts.next();

    if ext1.eq_ignore_ascii_case("tgz") {
        return Some(("tar", Some("gz")));
    }

    // file.tar.gz: `tar | gz`
    if let Some(e2) = ext2 {
        if e2.eq_ignore_ascii_case("tar") {
            if let Some(op) = op_find_ext(ext1) {
                if op != "tar" && op != "iso" && op != "zip" {
                    return Some(("tar", Some(op)));
                }
            }
        }
    }
    op_find_ext(ext1).map(|op| (op, None))
}

#[derive(Parser, Debug)]
#[command(
    name = "pack",
    about = "Pack files into any supported archive type.",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,
}

#[derive(Default)]
struct Shared {
    /// Container writer result (two-stage mode).
    r1: Option<i32>,
    /// Final child result.
    r2: Option<i32>,
    pw: Option<PipeWriter>,
}

enum State {
    Begin,
    Wait,
}

pub struct PackOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    state: State,
    shared: Rc<RefCell<Shared>>,
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
    if cmd.output.is_none() && !cmd.stdout {
        error!("please specify output file name with `-o NAME`");
        return Err((cmd, 1));
    }
    Ok(Rc::new(RefCell::new(PackOp {
        cmd: Some(cmd),
        id,
        stop: false,
        state: State::Begin,
        shared: Rc::new(RefCell::new(Shared::default())),
    })))
}

impl PackOp {
    fn spawn_children(&mut self, core: &Rc<Core>) -> Result<(), ()> {
        let cmd = self.cmd.as_ref().unwrap();
        let oname = cmd.output.clone().unwrap_or_default();
        let Some((op1, op2)) = pack_detect(&oname) else {
            error!("unknown archive file extension: {}", oname);
            return Err(());
        };
        debug!("pack: {} {:?} -> {}", op1, op2, oname);

        match op2 {
            None => {
                let child = self.child_base(op1);
                self.wire_final(core, child)
            }
            Some(op2) => {
                let (pw, pr) = pipe();
                self.shared.borrow_mut().pw = Some(pw.clone());

                // container writer streams into the pipe
                let mut c1 = self.child_base(op1);
                c1.stdout = true;
                c1.fd_stdout = Some(pw);
                c1.output = None;
                c1.chdir = None;
                let sh = self.shared.clone();
                c1.on_complete = Some(Box::new(move |core, res| {
                    let mut s = sh.borrow_mut();
                    s.r1 = Some(res);
                    // EOF for the compressor's reader
                    if let Some(pw) = s.pw.take() {
                        pw.close(core);
                    }
                }));
                if core.com.run(core, c1).is_err() {
                    return Err(());
                }

                // compressor reads the pipe as its stdin
                let cmd = self.cmd.as_ref().unwrap();
                let mut c2 = CmdInfo::new();
                c2.operation = op2.to_string();
                c2.stdin = true;
                c2.fd_stdin = Some(pr);
                c2.output = cmd.output.clone();
                c2.chdir = cmd.chdir.clone();
                c2.overwrite = cmd.overwrite;
                c2.test = cmd.test;
                c2.buffer_size = cmd.buffer_size;
                self.wire_final(core, c2)
            }
        }
    }

    /// Child descriptor carrying the parent's inputs and filters.
    fn child_base(&self, op: &str) -> Box<CmdInfo> {
        let cmd = self.cmd.as_ref().unwrap();
        let mut c = CmdInfo::new();
        c.operation = op.to_string();
        c.input = cmd.input.clone();
        c.include = cmd.include.clone();
        c.exclude = cmd.exclude.clone();
        c.input_list = cmd.input_list.clone();
        c.output = cmd.output.clone();
        c.chdir = cmd.chdir.clone();
        c.recursive = cmd.recursive;
        c.overwrite = cmd.overwrite;
        c.test = cmd.test;
        c.skip_errors = cmd.skip_errors;
        c.buffer_size = cmd.buffer_size;
        c.directio = cmd.directio;
        c
    }

    fn wire_final(&self, core: &Rc<Core>, mut c: Box<CmdInfo>) -> Result<(), ()> {
        let sh = self.shared.clone();
        let id = self.id;
        c.on_complete = Some(Box::new(move |core, res| {
            sh.borrow_mut().r2 = Some(res);
            core.sched.post(Task::RunOp(id));
        }));
        core.com.run(core, c).map(|_| ()).map_err(|_| ())
    }
}

impl Op for PackOp {
    fn run(&mut self, core: &Rc<Core>) {
        loop {
            if self.stop {
                let cmd = self.cmd.take().unwrap();
                core.com.complete(core, cmd, self.id, 1);
                return;
            }
            match self.state {
                State::Begin => {
                    if self.spawn_children(core).is_err() {
                        let cmd = self.cmd.take().unwrap();
                        core.com.complete(core, cmd, self.id, 1);
                        return;
                    }
                    self.state = State::Wait;
                    return;
                }
                State::Wait => {
                    let s = self.shared.borrow();
                    let Some(r2) = s.r2 else { return };
                    let code = match s.r1 {
                        Some(r1) if r1 != 0 => r1,
                        _ => r2,
                    };
                    drop(s);
                    let cmd = self.cmd.take().unwrap();
                    core.com.complete(core, cmd, self.id, code);
                    return;
                }
            }
        }
    }

    fn signal(&mut self, _sig: u32) {
        self.stop = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::REGISTRY;
    use std::fs;

    fn run_op(op: &str, args: &[&str]) -> i32 {
        let core = Core::new(crate::core::CoreConf::default(), REGISTRY);
        let mut cmd = CmdInfo::new();
        cmd.operation = op.into();
        cmd.argv = args.iter().map(|s| s.to_string()).collect();
        match core.com.run(&core, cmd) {
            Err(code) => code,
            Ok(()) => core.sched.run(&core),
        }
    }

    /// Tests below run from inside a scratch directory; the working
    /// directory is process state, so they take turns.
    fn cwd_lock() -> &'static std::sync::Mutex<()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        &LOCK
    }

    /// Scenario: pack a tree into .tar.gz through the piped sub-operations,
    /// then unpack it and compare the result.
    #[test]
    fn test_pack_unpack_tar_gz_roundtrip() {
        let _guard = cwd_lock().lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        fs::create_dir_all("src/sub").unwrap();
        fs::write("src/a.txt", b"alpha file").unwrap();
        fs::write("src/sub/b.bin", vec![5u8; 8 * 1024]).unwrap();

        let code = run_op("pack", &["src", "-o", "out.tar.gz"]);
        assert_eq!(0, code, "pack failed");
        assert!(fs::metadata("out.tar.gz").unwrap().len() > 0);
        // a gzip stream, not a bare tar
        let head = fs::read("out.tar.gz").unwrap();
        assert_eq!(&[0x1f, 0x8b], &head[..2]);

        let code = run_op("unpack", &["out.tar.gz", "-C", "restored"]);
        assert_eq!(0, code, "unpack failed");
        assert_eq!(
            b"alpha file".to_vec(),
            fs::read("restored/src/a.txt").unwrap()
        );
        assert_eq!(
            vec![5u8; 8 * 1024],
            fs::read("restored/src/sub/b.bin").unwrap()
        );
        // mtimes survive at tar's 1-second granularity
        let orig = fs::metadata("src/a.txt").unwrap().modified().unwrap();
        let back = fs::metadata("restored/src/a.txt").unwrap().modified().unwrap();
        let d = orig
            .duration_since(back)
            .unwrap_or_else(|e| e.duration());
        assert!(d <= std::time::Duration::from_secs(1));

        std::env::set_current_dir(cwd).unwrap();
    }

    #[test]
    fn test_pack_unpack_zip_roundtrip() {
        let _guard = cwd_lock().lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        fs::create_dir("d1").unwrap();
        fs::write("d1/x.txt", b"zip me").unwrap();

        assert_eq!(0, run_op("zip", &["d1", "-o", "a.zip", "--method", "zstd"]));
        assert_eq!(0, run_op("unzip", &["a.zip", "-C", "out"]));
        assert_eq!(b"zip me".to_vec(), fs::read("out/d1/x.txt").unwrap());

        std::env::set_current_dir(cwd).unwrap();
    }

    #[test]
    fn test_pack_detect_simple() {
        assert_eq!(Some(("zip", None)), pack_detect("a/b/out.zip"));
        assert_eq!(Some(("tar", None)), pack_detect("out.tar"));
        assert_eq!(Some(("zst", None)), pack_detect("out.zst"));
        assert_eq!(None, pack_detect("out.rar"));
    }

    #[test]
    fn test_pack_detect_two_stage() {
        assert_eq!(Some(("tar", Some("gz"))), pack_detect("out.tar.gz"));
        assert_eq!(Some(("tar", Some("gz"))), pack_detect("out.tgz"));
        assert_eq!(Some(("tar", Some("zst"))), pack_detect("out.tar.zst"));
    }
}
