/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Archive writer operations: `tar`, `zip`, `gz`, `zst` (streaming) and
//! `iso` (collect-then-write).

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use std::time::SystemTime;

use clap::Parser;
use log::{debug, error, info};

use crate::arc::gz::GzWriter;
use crate::arc::iso::IsoWriter;
use crate::arc::tar::TarWriter;
use crate::arc::zip::{ZipWriter, METHOD_DEFLATE, METHOD_STORE, METHOD_ZSTD};
use crate::arc::zst::ZstWriter;
use crate::arc::{ArcEntry, EntryKind};
use crate::args::{self, GlobalOpts};
use crate::core::com::{Allowed, CmdInfo, CreateResult, InputKind, InputOrder, Op};
use crate::core::error::{Error, Result};
use crate::core::file::{self, FileConf, FileObj, OpenFlags, RState, WState};
use crate::core::scheduler::OpId;
use crate::core::Core;

#[derive(Parser, Debug)]
#[command(name = "tar", about = "Pack files into .tar.", disable_version_flag = true)]
struct TarOpts {
    #[command(flatten)]
    g: GlobalOpts,
}

#[derive(Parser, Debug)]
#[command(
    name = "zip",
    about = "Pack files into .zip.",
    disable_version_flag = true
)]
struct ZipOpts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Compression method: store, deflate or zstd
    #[arg(long, value_name = "METHOD", default_value = "deflate")]
    method: String,

    /// Compression level
    #[arg(long, value_name = "N", default_value_t = 6)]
    level: u32,
}

#[derive(Parser, Debug)]
#[command(
    name = "gz",
    about = "Compress file into .gz.",
    disable_version_flag = true
)]
struct GzOpts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Compression level (1..9)
    #[arg(long, value_name = "N", default_value_t = 6)]
    level: u32,
}

#[derive(Parser, Debug)]
#[command(
    name = "zst",
    about = "Compress file into .zst.",
    disable_version_flag = true
)]
struct ZstOpts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Compression level (1..22)
    #[arg(long, value_name = "N", default_value_t = 3)]
    level: i32,
}

#[derive(Parser, Debug)]
#[command(
    name = "iso",
    about = "Pack files into an ISO 9660 image.",
    disable_version_flag = true
)]
struct IsoOpts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Volume label
    #[arg(long, value_name = "LABEL", default_value = "FCOM")]
    label: String,
}

enum Sink {
    Tar(TarWriter),
    Zip(ZipWriter),
    /// Writer instantiated per input file (one gzip member each).
    Gz { level: u32, cur: Option<GzWriter> },
    Zst { level: i32, cur: Option<ZstWriter> },
}

impl Sink {
    /// Multi-member formats accept directories and links.
    fn is_container(&self) -> bool {
        matches!(self, Sink::Tar(_) | Sink::Zip(_))
    }

    fn add(&mut self, core: &Core, e: &ArcEntry, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Sink::Tar(w) => w.add(e, out),
            Sink::Zip(w) => w.add(e, out),
            Sink::Gz { level, cur } => {
                let base = e.name.rsplit('/').next().unwrap_or(&e.name);
                *cur = Some(GzWriter::new(*level, base, e.mtime));
                Ok(())
            }
            Sink::Zst { level, cur } => {
                *cur = Some(ZstWriter::new(*level, core.conf.workers)?);
                Ok(())
            }
        }
    }

    fn data(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self {
            Sink::Tar(w) => w.data(input, out),
            Sink::Zip(w) => w.data(input, out),
            Sink::Gz { cur, .. } => cur
                .as_mut()
                .ok_or_else(|| Error::internal("gz: data without member"))?
                .data(input, out),
            Sink::Zst { cur, .. } => cur
                .as_mut()
                .ok_or_else(|| Error::internal("zst: data without member"))?
                .data(input, out),
        }
    }

    fn file_done(&mut self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Sink::Tar(w) => w.file_done(out),
            Sink::Zip(w) => w.file_done(out),
            Sink::Gz { cur, .. } => match cur.take() {
                Some(mut w) => w.finish(out),
                None => Ok(()),
            },
            Sink::Zst { cur, .. } => match cur.take() {
                Some(mut w) => w.finish(out),
                None => Ok(()),
            },
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Sink::Tar(w) => {
                w.finish(out);
                Ok(())
            }
            Sink::Zip(w) => {
                w.finish(out);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Archive member name from an input path.
fn entry_name(iname: &str) -> String {
    iname
        .trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

enum State {
    OpenOut,
    Next,
    /// Transient: emit this entry's header, then stream its data.
    AddHeader(ArcEntry),
    Read,
    Write(After),
    Complete,
}

#[derive(Clone, Copy)]
enum After {
    Read,
    Next,
    Complete,
}

pub struct PackStreamOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    st: State,
    sink: Sink,
    input: FileObj,
    out: FileObj,
    data: Vec<u8>,
    outbuf: Vec<u8>,
    nfiles: u32,
    stdin_done: bool,
}

fn create_stream(core: &Rc<Core>, mut cmd: Box<CmdInfo>, id: OpId, sink: Sink, g: GlobalOpts) -> CreateResult {
    if let Err(e) = args::apply_global(core, &mut cmd, g) {
        error!("{}", e);
        return Err((cmd, 1));
    }
    if cmd.output.is_none() && !cmd.stdout {
        error!("use --out to set output file name");
        return Err((cmd, 1));
    }
    if sink.is_container() {
        cmd.recursive = true;
    }
    let in_fc = FileConf {
        buffer_size: cmd.buffer_size,
        fd_stdin: cmd.fd_stdin.take(),
        ..FileConf::default()
    };
    let out_fc = FileConf {
        buffer_size: cmd.buffer_size,
        n_buffers: 1,
        fd_stdout: cmd.fd_stdout.take(),
        ..FileConf::default()
    };
    Ok(Rc::new(RefCell::new(PackStreamOp {
        cmd: Some(cmd),
        id,
        stop: false,
        st: State::OpenOut,
        sink,
        input: FileObj::create(in_fc),
        out: FileObj::create(out_fc),
        data: Vec::new(),
        outbuf: Vec::new(),
        nfiles: 0,
        stdin_done: false,
    })))
}

pub fn create_tar(core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    let opts = match args::parse_op::<TarOpts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    create_stream(core, cmd, id, Sink::Tar(TarWriter::new()), opts.g)
}

pub fn create_zip(core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    let opts = match args::parse_op::<ZipOpts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    let method = match opts.method.as_str() {
        "store" => METHOD_STORE,
        "deflate" => METHOD_DEFLATE,
        "zstd" => METHOD_ZSTD,
        m => {
            error!("--method: unknown method '{}'", m);
            return Err((cmd, 1));
        }
    };
    let w = ZipWriter::new(method, opts.level, core.conf.workers);
    create_stream(core, cmd, id, Sink::Zip(w), opts.g)
}

pub fn create_gz(core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    let opts = match args::parse_op::<GzOpts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    let sink = Sink::Gz {
        level: opts.level.clamp(1, 9),
        cur: None,
    };
    create_stream(core, cmd, id, sink, opts.g)
}

pub fn create_zst(core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    let opts = match args::parse_op::<ZstOpts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    let sink = Sink::Zst {
        level: opts.level,
        cur: None,
    };
    create_stream(core, cmd, id, sink, opts.g)
}

impl PackStreamOp {
    fn open_out(&mut self) -> Result<()> {
        let cmd = self.cmd.as_mut().unwrap();
        let mut flags = file::output_flags(cmd.stdout, cmd.overwrite, cmd.test, cmd.directio);
        if cmd.no_prealloc {
            flags |= OpenFlags::NO_PREALLOC;
        }
        let name = cmd.output.clone().unwrap_or_default();
        self.out.open(&name, flags)?;
        self.out.set_waker(self.id);
        self.input.set_waker(self.id);
        Ok(())
    }

    /// Advance to the next input entry; emits headers for special entries.
    /// Returns the follow-up state.
    fn next_input(&mut self) -> Result<State> {
        loop {
            let cmd = self.cmd.as_mut().unwrap();
            let stdin_input = cmd.stdin && cmd.input.is_empty() && cmd.input_list.is_none();
            let iname = if stdin_input {
                if self.stdin_done {
                    self.sink.finish(&mut self.outbuf)?;
                    return Ok(State::Write(After::Complete));
                }
                self.stdin_done = true;
                self.input.open("", OpenFlags::READ | OpenFlags::STDIN)?;
                // member name derived from the output stem
                let name = cmd
                    .output
                    .as_deref()
                    .map(|o| {
                        let f = o.rsplit('/').next().unwrap_or(o);
                        f.rsplit_once('.')
                            .map(|(s, _)| s.to_string())
                            .unwrap_or_else(|| f.to_string())
                    })
                    .unwrap_or_else(|| "stdin".to_string());
                let e = ArcEntry {
                    name,
                    size: 0, // unknown up front
                    mtime: SystemTime::now(),
                    ..ArcEntry::default()
                };
                match &mut self.sink {
                    // tar headers announce sizes up front
                    Sink::Tar(_) => {
                        return Err(Error::argument("tar: cannot read data from stdin"))
                    }
                    Sink::Zip(w) => {
                        w.add(&e, &mut self.outbuf)?;
                        self.nfiles += 1;
                        return Ok(State::Write(After::Read));
                    }
                    Sink::Gz { level, cur } => {
                        *cur = Some(GzWriter::new(*level, &e.name, e.mtime))
                    }
                    Sink::Zst { level, cur } => *cur = Some(ZstWriter::new(*level, 0)?),
                }
                self.nfiles += 1;
                return Ok(State::Read);
            } else {
                match cmd.input_next(InputOrder::Default)? {
                    Some(n) => n.name,
                    None => {
                        if self.nfiles == 0 {
                            return Err(Error::argument("no input files"));
                        }
                        self.sink.finish(&mut self.outbuf)?;
                        return Ok(State::Write(After::Complete));
                    }
                }
            };

            let md = fs::symlink_metadata(&iname)
                .map_err(|e| Error::system(format!("file get info: '{}'", iname), e))?;
            let cmd = self.cmd.as_mut().unwrap();
            let kind = if md.is_dir() {
                InputKind::Dir
            } else {
                InputKind::File
            };
            if cmd.input_allowed(&iname, kind) != Allowed::Yes {
                if md.is_dir() && cmd.recursive {
                    cmd.input_dir();
                }
                continue;
            }

            let mut e = ArcEntry::from_metadata(&entry_name(&iname), &md);
            if md.is_dir() {
                if cmd.recursive {
                    cmd.input_dir();
                }
                if !self.sink.is_container() {
                    continue;
                }
                e.kind = EntryKind::Dir;
                self.sink.add_noop_data(&mut self.outbuf, &e)?;
                self.nfiles += 1;
                return Ok(State::Write(After::Next));
            }
            if md.file_type().is_symlink() {
                if !matches!(self.sink, Sink::Tar(_)) {
                    debug!("skipping symlink '{}'", iname);
                    continue;
                }
                e.kind = EntryKind::Symlink;
                e.link_target = fs::read_link(&iname)
                    .map_err(|er| Error::system(format!("readlink: '{}'", iname), er))?
                    .to_string_lossy()
                    .into_owned();
                self.sink.add_noop_data(&mut self.outbuf, &e)?;
                self.nfiles += 1;
                return Ok(State::Write(After::Next));
            }

            self.input.open(&iname, OpenFlags::READ | OpenFlags::READAHEAD)?;
            self.nfiles += 1;
            debug!("adding '{}' ({} bytes)", e.name, e.size);
            return Ok(State::AddHeader(e));
        }
    }
}

impl Sink {
    /// Add a dataless entry (directory or link) and close it.
    fn add_noop_data(&mut self, out: &mut Vec<u8>, e: &ArcEntry) -> Result<()> {
        match self {
            Sink::Tar(w) => {
                w.add(e, out)?;
                w.data(&[], out)?;
                w.file_done(out)
            }
            Sink::Zip(w) => {
                w.add(e, out)?;
                w.file_done(out)
            }
            _ => Ok(()),
        }
    }
}

impl Op for PackStreamOp {
    fn run(&mut self, core: &Rc<Core>) {
        let ok = loop {
            if self.stop {
                break false;
            }
            match std::mem::replace(&mut self.st, State::Next) {
                State::OpenOut => {
                    if let Err(e) = self.open_out() {
                        error!("{}", e);
                        break false;
                    }
                    self.st = State::Next;
                }

                State::Next => match self.next_input() {
                    Ok(State::AddHeader(e)) => {
                        if let Err(er) = self.sink.add(core, &e, &mut self.outbuf) {
                            error!("{}", er);
                            break false;
                        }
                        self.st = State::Write(After::Read);
                    }
                    Ok(s) => self.st = s,
                    Err(e) => {
                        error!("{}", e);
                        break false;
                    }
                },

                State::Read => {
                    let mut buf = std::mem::take(&mut self.data);
                    let r = self.input.read(core, &mut buf, None);
                    self.data = buf;
                    match r {
                        Ok(RState::Data) => {
                            let data = std::mem::take(&mut self.data);
                            if let Err(e) = self.sink.data(&data, &mut self.outbuf) {
                                error!("{}", e);
                                break false;
                            }
                            self.data = data;
                            self.st = State::Write(After::Read);
                        }
                        Ok(RState::Eof) => {
                            if let Err(e) = self.sink.file_done(&mut self.outbuf) {
                                error!("{}", e);
                                break false;
                            }
                            self.st = State::Write(After::Next);
                        }
                        Ok(RState::Async) => {
                            self.st = State::Read;
                            return;
                        }
                        Err(e) => {
                            error!("{}", e);
                            break false;
                        }
                    }
                }

                State::Write(then) => {
                    if self.outbuf.is_empty() {
                        self.st = match then {
                            After::Read => State::Read,
                            After::Next => State::Next,
                            After::Complete => State::Complete,
                        };
                        continue;
                    }
                    match self.out.write(core, &self.outbuf, None) {
                        Ok(WState::Done) => {
                            self.outbuf.clear();
                            self.st = match then {
                                After::Read => State::Read,
                                After::Next => State::Next,
                                After::Complete => State::Complete,
                            };
                        }
                        Ok(WState::Async) => {
                            self.st = State::Write(then);
                            return;
                        }
                        Err(e) => {
                            error!("{}", e);
                            break false;
                        }
                    }
                }

                State::Complete => {
                    self.out.close(core);
                    let name = self
                        .cmd
                        .as_ref()
                        .unwrap()
                        .output
                        .clone()
                        .unwrap_or_else(|| "stdout".into());
                    info!("{}: {} entries", name, self.nfiles);
                    break true;
                }

                State::AddHeader(_) => unreachable!("transient state"),
            }
        };

        if !ok {
            // drop a partial output file
            let cmd = self.cmd.as_ref().unwrap();
            if !cmd.stdout && !cmd.test {
                if let Some(o) = cmd.output.clone() {
                    self.out.close(core);
                    let _ = fs::remove_file(&o);
                }
            }
        }
        let cmd = self.cmd.take().unwrap();
        core.com.complete(core, cmd, self.id, if ok { 0 } else { 1 });
    }

    fn signal(&mut self, _sig: u32) {
        self.stop = true;
    }
}

// ISO: collect entries, lay out the volume, then stream file contents.

enum IsoState {
    Collect,
    Header,
    NextFile,
    Read,
    Write(IsoAfter),
    Complete,
}

#[derive(Clone, Copy)]
enum IsoAfter {
    Read,
    NextFile,
    Complete,
}

pub struct IsoWriteOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    st: IsoState,
    w: IsoWriter,
    input: FileObj,
    out: FileObj,
    files: Vec<String>,
    file_idx: usize,
    /// Maps archive names back to file system paths.
    paths: std::collections::HashMap<String, String>,
    data: Vec<u8>,
    outbuf: Vec<u8>,
}

pub fn create_iso(core: &Rc<Core>, mut cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    let opts = match args::parse_op::<IsoOpts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    if let Err(e) = args::apply_global(core, &mut cmd, opts.g) {
        error!("{}", e);
        return Err((cmd, 1));
    }
    if cmd.output.is_none() {
        error!("use --out to set output file name");
        return Err((cmd, 1));
    }
    cmd.recursive = true;
    let fc = FileConf {
        buffer_size: cmd.buffer_size,
        ..FileConf::default()
    };
    let out_fc = FileConf {
        buffer_size: cmd.buffer_size,
        n_buffers: 1,
        ..FileConf::default()
    };
    Ok(Rc::new(RefCell::new(IsoWriteOp {
        cmd: Some(cmd),
        id,
        stop: false,
        st: IsoState::Collect,
        w: IsoWriter::new(&opts.label),
        input: FileObj::create(fc),
        out: FileObj::create(out_fc),
        files: Vec::new(),
        file_idx: 0,
        paths: std::collections::HashMap::new(),
        data: Vec::new(),
        outbuf: Vec::new(),
    })))
}

impl IsoWriteOp {
    fn collect(&mut self) -> Result<()> {
        loop {
            let cmd = self.cmd.as_mut().unwrap();
            // complete each directory before its subdirectories, matching
            // the volume's directory-record layout
            let Some(n) = cmd.input_next(InputOrder::DirFirst)? else {
                break;
            };
            let md = fs::metadata(&n.name)
                .map_err(|e| Error::system(format!("file get info: '{}'", n.name), e))?;
            let cmd = self.cmd.as_mut().unwrap();
            let kind = if md.is_dir() {
                InputKind::Dir
            } else {
                InputKind::File
            };
            if cmd.input_allowed(&n.name, kind) != Allowed::Yes {
                if md.is_dir() {
                    cmd.input_dir();
                }
                continue;
            }
            if md.is_dir() {
                cmd.input_dir();
            }
            let e = ArcEntry::from_metadata(&entry_name(&n.name), &md);
            self.paths.insert(e.name.clone(), n.name.clone());
            self.w.add(&e)?;
        }
        if self.paths.is_empty() {
            return Err(Error::argument("no input files"));
        }
        self.w.prepare()?;
        self.files = self.w.file_names();
        Ok(())
    }
}

impl Op for IsoWriteOp {
    fn run(&mut self, core: &Rc<Core>) {
        let ok = loop {
            if self.stop {
                break false;
            }
            match std::mem::replace(&mut self.st, IsoState::Complete) {
                IsoState::Collect => {
                    if let Err(e) = self.collect() {
                        error!("{}", e);
                        break false;
                    }
                    let cmd = self.cmd.as_mut().unwrap();
                    let mut flags =
                        file::output_flags(false, cmd.overwrite, cmd.test, cmd.directio);
                    if cmd.no_prealloc {
                        flags |= OpenFlags::NO_PREALLOC;
                    }
                    let name = cmd.output.clone().unwrap();
                    if let Err(e) = self.out.open(&name, flags) {
                        error!("{}", e);
                        break false;
                    }
                    self.st = IsoState::Header;
                }

                IsoState::Header => {
                    if let Err(e) = self.w.header(&mut self.outbuf) {
                        error!("{}", e);
                        break false;
                    }
                    self.st = IsoState::Write(IsoAfter::NextFile);
                }

                IsoState::NextFile => {
                    if self.file_idx >= self.files.len() {
                        self.st = IsoState::Complete;
                        continue;
                    }
                    let name = &self.files[self.file_idx];
                    let path = self.paths.get(name).cloned().unwrap_or_else(|| name.clone());
                    if let Err(e) = self
                        .input
                        .open(&path, OpenFlags::READ | OpenFlags::READAHEAD)
                    {
                        error!("{}", e);
                        break false;
                    }
                    self.st = IsoState::Read;
                }

                IsoState::Read => {
                    let mut buf = std::mem::take(&mut self.data);
                    let r = self.input.read(core, &mut buf, None);
                    self.data = buf;
                    match r {
                        Ok(RState::Data) => {
                            let data = std::mem::take(&mut self.data);
                            let w = self.w.data(&data, &mut self.outbuf);
                            self.data = data;
                            if let Err(e) = w {
                                error!("{}", e);
                                break false;
                            }
                            self.st = IsoState::Write(IsoAfter::Read);
                        }
                        Ok(RState::Eof) => {
                            if let Err(e) = self.w.file_done(&mut self.outbuf) {
                                error!("{}", e);
                                break false;
                            }
                            self.file_idx += 1;
                            self.st = IsoState::Write(IsoAfter::NextFile);
                        }
                        Ok(RState::Async) => {
                            self.st = IsoState::Read;
                            return;
                        }
                        Err(e) => {
                            error!("{}", e);
                            break false;
                        }
                    }
                }

                IsoState::Write(then) => {
                    if self.outbuf.is_empty() {
                        self.st = match then {
                            IsoAfter::Read => IsoState::Read,
                            IsoAfter::NextFile => IsoState::NextFile,
                            IsoAfter::Complete => IsoState::Complete,
                        };
                        continue;
                    }
                    match self.out.write(core, &self.outbuf, None) {
                        Ok(WState::Done) => {
                            self.outbuf.clear();
                            self.st = match then {
                                IsoAfter::Read => IsoState::Read,
                                IsoAfter::NextFile => IsoState::NextFile,
                                IsoAfter::Complete => IsoState::Complete,
                            };
                        }
                        Ok(WState::Async) => {
                            self.st = IsoState::Write(then);
                            return;
                        }
                        Err(e) => {
                            error!("{}", e);
                            break false;
                        }
                    }
                }

                IsoState::Complete => {
                    self.out.close(core);
                    info!(
                        "{}: {} files",
                        self.cmd.as_ref().unwrap().output.as_deref().unwrap_or(""),
                        self.files.len()
                    );
                    break true;
                }
            }
        };

        if !ok {
            let cmd = self.cmd.as_ref().unwrap();
            if !cmd.test {
                if let Some(o) = cmd.output.clone() {
                    self.out.close(core);
                    let _ = fs::remove_file(&o);
                }
            }
        }
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
    fn test_entry_name_strips_prefixes() {
        assert_eq!("a/b", entry_name("./a/b"));
        assert_eq!("tmp/x", entry_name("/tmp/x"));
        assert_eq!("plain", entry_name("plain"));
    }

    #[test]
    fn test_unknown_zip_method_rejected() {
        let core = Core::new_for_tests();
        let mut cmd = CmdInfo::new();
        cmd.operation = "zip".into();
        cmd.argv = vec!["--method".into(), "lzma".into(), "-o".into(), "x.zip".into()];
        assert!(create_zip(&core, cmd, 1).is_err());
    }
}
