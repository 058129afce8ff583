/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `copy`: copy files and directories, with optional AES-CFB encryption,
//! MD5 printing, and full read-back verification.  Output goes to a shadow
//! file that is renamed over the target on success.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use clap::Parser;
use log::{debug, error, info, warn};

use crate::args::{self, GlobalOpts};
use crate::core::com::{Allowed, CmdInfo, CreateResult, InputKind, InputOrder, Op};
use crate::core::error::Result;
use crate::core::file::{self, Behaviour, FileConf, FileObj, OpenFlags, RState, WState};
use crate::core::scheduler::{OpId, Task};
use crate::core::Core;
use crate::crypto::{AesCfb, DigestLike, Direction, Md5Hash};
use crate::ops::out_name;

const BUF_LARGE: usize = 8 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "copy",
    about = "Copy files and directories, plus encryption & verification.\n\
             File properties are preserved.",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Encrypt data (AES-256-CFB, key = SHA256(password))
    #[arg(short = 'e', long = "encrypt", value_name = "PASSWORD")]
    encrypt: Option<String>,

    /// Decrypt data
    #[arg(short = 'd', long = "decrypt", value_name = "PASSWORD")]
    decrypt: Option<String>,

    /// Print MD5 checksum of each input file
    #[arg(short = '5', long = "md5")]
    print_md5: bool,

    /// Verify data consistency with MD5; implies direct I/O on the output
    #[arg(short = 'y', long = "verify")]
    verify: bool,

    /// Rename source file to *.deleted after successful operation
    #[arg(long = "rename-source")]
    rename_source: bool,

    /// Overwrite only older files
    #[arg(short = 'u', long = "update")]
    update: bool,

    /// Just copy the file date (don't overwrite content); use with --update
    #[arg(long = "replace-date")]
    replace_date: bool,

    /// Overwrite target file data in place instead of trashing the old file
    #[arg(long = "write-into")]
    write_into: bool,
}

enum State {
    Src,
    OpenOut,
    Read,
    Write,
    ReadDone,
    Verify,
    Fin,
}

pub struct CopyOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    st: State,
    stop: bool,

    input: FileObj,
    iname: String,
    base: Option<String>,
    imd: Option<fs::Metadata>,
    in_off: u64,
    nfiles: u32,
    data: Vec<u8>,

    out: FileObj,
    oname: String,
    oname_tmp: String,
    target_existed: bool,
    del_on_close: bool,
    fin_state: u32,
    total: u64,

    crypt: Option<AesCfb>,
    wr_md5: Option<Md5Hash>,
    wr_digest: Vec<u8>,
    verify_off: u64,

    encrypt: Option<String>,
    decrypt: Option<String>,
    print_md5: bool,
    verify: bool,
    rename_source: bool,
    update: bool,
    replace_date: bool,
    write_into: bool,
}

pub fn create(core: &Rc<Core>, mut cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    let opts = match args::parse_op::<Opts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    if cmd.buffer_size == 0 {
        cmd.buffer_size = BUF_LARGE;
    }
    if let Err(e) = args::apply_global(core, &mut cmd, opts.g) {
        error!("{}", e);
        return Err((cmd, 1));
    }

    if opts.encrypt.is_some() && opts.decrypt.is_some() {
        error!("--encrypt and --decrypt are mutually exclusive");
        return Err((cmd, 1));
    }
    if cmd.output.is_none() && cmd.chdir.is_none() && !cmd.stdout && !opts.print_md5 {
        error!("please use --out or --chdir to set destination");
        return Err((cmd, 1));
    }

    let mut update = opts.update;
    if cmd.stdout {
        update = false;
    }
    if update {
        cmd.overwrite = true;
    }
    cmd.recursive = true;

    let fc = FileConf {
        buffer_size: cmd.buffer_size,
        n_buffers: 1,
        ..FileConf::default()
    };
    let ofc = FileConf {
        buffer_size: cmd.buffer_size,
        n_buffers: 1,
        fd_stdout: cmd.fd_stdout.take(),
        ..FileConf::default()
    };

    let op = CopyOp {
        cmd: Some(cmd),
        id,
        st: State::Src,
        stop: false,
        input: FileObj::create(fc),
        iname: String::new(),
        base: None,
        imd: None,
        in_off: 0,
        nfiles: 0,
        data: Vec::new(),
        out: FileObj::create(ofc),
        oname: String::new(),
        oname_tmp: String::new(),
        target_existed: false,
        del_on_close: false,
        fin_state: 0,
        total: 0,
        crypt: None,
        wr_md5: None,
        wr_digest: Vec::new(),
        verify_off: 0,
        encrypt: opts.encrypt,
        decrypt: opts.decrypt,
        print_md5: opts.print_md5,
        verify: opts.verify,
        rename_source: opts.rename_source,
        update,
        replace_date: opts.replace_date,
        write_into: opts.write_into,
    };
    Ok(Rc::new(RefCell::new(op)))
}

enum NextInput {
    Ready,
    Next,
    Done,
    Failed,
}

impl CopyOp {
    fn input_next(&mut self) -> NextInput {
        let cmd = self.cmd.as_mut().unwrap();
        let stdin_input = cmd.stdin && cmd.input.is_empty() && cmd.input_list.is_none();
        if stdin_input {
            if self.nfiles > 0 {
                return NextInput::Done;
            }
            self.nfiles = 1;
            self.iname = "stdin".to_string();
            self.base = None;
            if self.input.open("", OpenFlags::READ | OpenFlags::STDIN).is_err() {
                return NextInput::Failed;
            }
            self.imd = None;
            return NextInput::Ready;
        }

        let next = match cmd.input_next(InputOrder::Default) {
            Ok(n) => n,
            Err(e) => {
                error!("{}", e);
                return NextInput::Failed;
            }
        };
        let Some(n) = next else {
            if self.nfiles == 0 {
                error!("no input files");
                return NextInput::Failed;
            }
            return NextInput::Done;
        };
        self.nfiles += 1;
        self.iname = n.name;
        self.base = n.base;

        let mut flags = OpenFlags::READ | OpenFlags::READAHEAD;
        if self.cmd.as_ref().unwrap().directio {
            flags |= OpenFlags::DIRECTIO;
        }
        if let Err(e) = self.input.open(&self.iname, flags) {
            error!("{}", e);
            return NextInput::Failed;
        }
        let md = match self.input.info() {
            Ok(m) => m,
            Err(e) => {
                error!("{}", e);
                return NextInput::Failed;
            }
        };

        let cmd = self.cmd.as_mut().unwrap();
        let kind = if md.is_dir() {
            InputKind::Dir
        } else {
            InputKind::File
        };
        if cmd.input_allowed(&self.iname, kind) != Allowed::Yes {
            return NextInput::Next;
        }
        if md.is_dir() && cmd.recursive {
            cmd.input_dir();
        }
        self.imd = Some(md);
        NextInput::Ready
    }

    /// Returns 'skip' outcomes as Next.
    fn output_open(&mut self, core: &Rc<Core>) -> Result<NextInput> {
        let cmd = self.cmd.as_ref().unwrap();
        let is_dir = self.imd.as_ref().map(|m| m.is_dir()).unwrap_or(false);

        if !cmd.stdout {
            let name = out_name(
                cmd.output.as_deref(),
                cmd.chdir.as_deref(),
                &self.iname,
                self.base.as_deref(),
            )
            .ok_or_else(|| crate::core::error::Error::argument("no output name"))?;
            debug!("output file name: {}", name);
            self.oname = name;
            self.oname_tmp = format!("{}.fcomtmp", self.oname);
        }

        if is_dir {
            if !cmd.test {
                file::dir_create(&self.oname, true)?;
            }
            return Ok(NextInput::Next);
        }

        let tmd = fs::metadata(&self.oname).ok();
        self.target_existed = tmd.is_some();
        if self.target_existed && !cmd.overwrite && !self.write_into && !cmd.stdout {
            return Err(crate::core::error::Error::Exists(self.oname.clone()));
        }
        if self.update {
            if let Some(tmd) = &tmd {
                if tmd.is_dir() {
                    return Err(crate::core::error::Error::argument(
                        "output file is an existing directory; use '-C DIR' to copy into it",
                    ));
                }
                let imt = self.imd.as_ref().and_then(|m| m.modified().ok());
                let tmt = tmd.modified().ok();
                if self.replace_date {
                    if !cmd.test {
                        let f = fs::File::options().write(true).open(&self.oname).map_err(
                            |e| {
                                crate::core::error::Error::system(
                                    format!("file open: '{}'", self.oname),
                                    e,
                                )
                            },
                        )?;
                        if let Some(t) = imt {
                            let _ = f.set_modified(t);
                        }
                    }
                    info!("replace date: {}", self.oname);
                    return Ok(NextInput::Next);
                }
                if let (Some(i), Some(t)) = (imt, tmt) {
                    if i <= t {
                        debug!("--update: target file is of the same date or newer; skipping");
                        return Ok(NextInput::Next);
                    }
                }
            }
        }

        let mut flags = OpenFlags::WRITE;
        if self.verify {
            flags = OpenFlags::READWRITE | OpenFlags::DIRECTIO;
        }
        if cmd.overwrite || self.write_into {
            flags |= OpenFlags::CREATE;
        } else {
            flags |= OpenFlags::CREATENEW;
        }
        if cmd.stdout {
            flags |= OpenFlags::STDOUT;
        }
        if cmd.test {
            flags |= OpenFlags::FAKEWRITE;
        }
        if cmd.no_prealloc {
            flags |= OpenFlags::NO_PREALLOC;
        }
        if cmd.directio {
            flags |= OpenFlags::DIRECTIO;
        }

        let open_name = if cmd.stdout || self.write_into {
            self.oname.clone()
        } else {
            self.oname_tmp.clone()
        };
        self.out.open(&open_name, flags)?;
        self.out.set_waker(self.id);
        self.del_on_close = !cmd.stdout;
        self.input.behaviour(core, Behaviour::Sequential);

        // per-file transform state
        self.crypt = match (&self.encrypt, &self.decrypt) {
            (Some(pw), _) => Some(AesCfb::new(pw, Direction::Encrypt)?),
            (_, Some(pw)) => Some(AesCfb::new(pw, Direction::Decrypt)?),
            _ => None,
        };
        self.wr_md5 = (self.verify || self.print_md5).then(Md5Hash::new);
        self.wr_digest.clear();
        self.in_off = 0;
        self.verify_off = 0;
        self.total = 0;
        self.fin_state = 0;
        Ok(NextInput::Ready)
    }

    /// Final steps for one file: attributes, old-target trash, rename.
    /// Returns true when waiting for a sub-operation.
    fn output_fin(&mut self, core: &Rc<Core>) -> Result<bool> {
        let cmd = self.cmd.as_ref().unwrap();
        if self.fin_state == 0 {
            if let Some(md) = &self.imd {
                let _ = self.out.attr_set(file::unix_mode(md));
            }
            self.out.close(core);
            self.del_on_close = false;

            if !cmd.stdout && !self.write_into && self.target_existed && !cmd.test {
                // dispatch the old target to the trash before the rename
                let mut tc = CmdInfo::new();
                tc.operation = "trash".to_string();
                tc.input = vec![self.oname.clone()];
                tc.test = cmd.test;
                tc.buffer_size = cmd.buffer_size;
                let id = self.id;
                tc.on_complete = Some(Box::new(move |core, _res| {
                    core.sched.post(Task::RunOp(id));
                }));
                debug!("copy: trash: {}", self.oname);
                self.fin_state = 1;
                if core.com.run(core, tc).is_err() {
                    return Err(crate::core::error::Error::format(
                        "trash sub-operation failed to start",
                    ));
                }
                return Ok(true);
            }
            self.fin_state = 1;
        }

        if !cmd.stdout && !self.write_into && !cmd.test {
            file::move_file(&self.oname_tmp, &self.oname, false)?;
        }
        Ok(false)
    }

    fn complete_file(&mut self) {
        if self.rename_source {
            let newname = format!("{}.deleted", self.iname);
            if let Err(e) = fs::rename(&self.iname, &newname) {
                warn!("file rename: '{}' -> '{}': {}", self.iname, newname, e);
            }
        }
        if self.print_md5 {
            let hex: String = self.wr_digest.iter().map(|b| format!("{:02x}", b)).collect();
            println!("{}  {}", hex, self.iname);
        }
        info!("'{}' -> '{}'  [{}]", self.iname, self.oname, self.total);
    }

    /// Failure cleanup: drop the partial output.
    fn reset_file(&mut self, core: &Core) {
        self.input.close(core);
        if self.del_on_close {
            self.del_on_close = false;
            self.out.close(core);
            if self.write_into {
                let _ = file::del(&self.oname);
            } else {
                let _ = file::del(&self.oname_tmp);
            }
        }
    }
}

impl Op for CopyOp {
    fn run(&mut self, core: &Rc<Core>) {
        let ok = loop {
            if self.stop {
                error!("{}", crate::core::error::Error::Cancelled);
                break false;
            }
            match self.st {
                State::Src => {
                    match self.input_next() {
                        NextInput::Ready => self.st = State::OpenOut,
                        NextInput::Next => continue,
                        NextInput::Done => break true,
                        NextInput::Failed => break false,
                    };
                }

                State::OpenOut => match self.output_open(core) {
                    Ok(NextInput::Ready) => self.st = State::Read,
                    Ok(_) => {
                        self.st = State::Src;
                    }
                    Err(e) => {
                        error!("{}", e);
                        break false;
                    }
                },

                State::Read => {
                    let mut buf = std::mem::take(&mut self.data);
                    let r = self.input.read(core, &mut buf, Some(self.in_off));
                    self.data = buf;
                    match r {
                        Ok(RState::Data) => {
                            self.in_off += self.data.len() as u64;
                            if let Some(c) = &mut self.crypt {
                                c.process(&mut self.data);
                            }
                            if let Some(h) = &mut self.wr_md5 {
                                h.update(&self.data);
                            }
                            self.st = State::Write;
                        }
                        Ok(RState::Eof) => self.st = State::ReadDone,
                        Ok(RState::Async) => return,
                        Err(e) => {
                            error!("{}", e);
                            break false;
                        }
                    }
                }

                State::Write => {
                    match self.out.write(core, &self.data, None) {
                        Ok(WState::Done) => {
                            self.total += self.data.len() as u64;
                            self.st = State::Read;
                        }
                        Ok(WState::Async) => return,
                        Err(e) => {
                            error!("{}", e);
                            break false;
                        }
                    };
                }

                State::ReadDone => {
                    if self.write_into {
                        // the old target may have been longer
                        self.out.trunc(None);
                    }
                    self.out.behaviour(core, Behaviour::TruncPrealloc);
                    if let Some(md) = &self.imd {
                        if let Ok(t) = md.modified() {
                            self.out.mtime_set(t);
                        }
                    }
                    if let Some(h) = &mut self.wr_md5 {
                        self.wr_digest = h.finish();
                    }
                    if self.verify && !self.cmd.as_ref().unwrap().test {
                        self.wr_md5 = Some(Md5Hash::new());
                        self.st = State::Verify;
                        continue;
                    }
                    self.st = State::Fin;
                }

                State::Verify => {
                    let mut buf = std::mem::take(&mut self.data);
                    let r = self.out.read(core, &mut buf, Some(self.verify_off));
                    self.data = buf;
                    match r {
                        Ok(RState::Data) => {
                            self.verify_off += self.data.len() as u64;
                            if let Some(h) = &mut self.wr_md5 {
                                h.update(&self.data);
                            }
                        }
                        Ok(RState::Eof) => {
                            let rd = self.wr_md5.as_mut().map(|h| h.finish()).unwrap_or_default();
                            if rd != self.wr_digest {
                                error!("{}: verification failed", self.oname);
                                break false;
                            }
                            info!("{}: verified", self.oname);
                            self.st = State::Fin;
                        }
                        Ok(RState::Async) => return,
                        Err(e) => {
                            error!("{}", e);
                            break false;
                        }
                    }
                }

                State::Fin => match self.output_fin(core) {
                    Ok(true) => return, // waiting for the trash sub-operation
                    Ok(false) => {
                        self.complete_file();
                        self.st = State::Src;
                    }
                    Err(e) => {
                        error!("{}", e);
                        break false;
                    }
                },
            }
        };

        self.reset_file(core);
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
    use crate::ops::REGISTRY;
    use std::time::SystemTime;

    fn run_copy(args: &[&str]) -> i32 {
        let core = Core::new(crate::core::CoreConf::default(), REGISTRY);
        let mut cmd = CmdInfo::new();
        cmd.operation = "copy".into();
        cmd.argv = args.iter().map(|s| s.to_string()).collect();
        match core.com.run(&core, cmd) {
            Err(code) => code,
            Ok(()) => core.sched.run(&core),
        }
    }

    fn mtime(p: &std::path::Path) -> SystemTime {
        fs::metadata(p).unwrap().modified().unwrap()
    }

    #[test]
    fn test_copy_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        let dst = dir.path().join("b.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(&src, &payload).unwrap();

        let code = run_copy(&[
            src.to_str().unwrap(),
            "-o",
            dst.to_str().unwrap(),
            "--verify",
        ]);
        assert_eq!(0, code);
        assert_eq!(payload, fs::read(&dst).unwrap());
        assert_eq!(mtime(&src), mtime(&dst));
        // the shadow file must not remain
        assert!(!dir.path().join("b.bin.fcomtmp").exists());
    }

    #[test]
    fn test_copy_encrypt_decrypt_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&a, b"sensitive payload, more than one block long....").unwrap();

        assert_eq!(
            0,
            run_copy(&[a.to_str().unwrap(), "-o", b.to_str().unwrap(), "-e", "pw"])
        );
        assert_ne!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
        assert_eq!(
            0,
            run_copy(&[b.to_str().unwrap(), "-o", c.to_str().unwrap(), "-d", "pw"])
        );
        assert_eq!(fs::read(&a).unwrap(), fs::read(&c).unwrap());
    }

    #[test]
    fn test_copy_refuses_existing_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"new").unwrap();
        fs::write(&b, b"old").unwrap();
        // shadow-open succeeds but the finish path must keep the target:
        // without --overwrite the old file is untouched
        let code = run_copy(&[a.to_str().unwrap(), "-o", b.to_str().unwrap()]);
        assert_eq!(1, code);
        assert_eq!(b"old".to_vec(), fs::read(&b).unwrap());
    }

    #[test]
    fn test_copy_recursive_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("f1"), b"one").unwrap();
        fs::write(src.join("sub/f2"), b"two").unwrap();
        let out = dir.path().join("out");

        let code = run_copy(&[src.to_str().unwrap(), "-C", out.to_str().unwrap()]);
        assert_eq!(0, code);
        assert_eq!(b"one".to_vec(), fs::read(out.join("tree/f1")).unwrap());
        assert_eq!(b"two".to_vec(), fs::read(out.join("tree/sub/f2")).unwrap());
    }

    #[test]
    fn test_copy_test_mode_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"data").unwrap();
        assert_eq!(
            0,
            run_copy(&[a.to_str().unwrap(), "-o", b.to_str().unwrap(), "-T"])
        );
        assert!(!b.exists());
    }
}
