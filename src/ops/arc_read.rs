/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Archive reader operations: `untar` (streaming) and `unzip`, `un7z`,
//! `uniso` (random access via Seek events).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use clap::Parser;
use log::{debug, error, info, warn};

use crate::arc::iso::IsoReader;
use crate::arc::sevenz::SevenZReader;
use crate::arc::tar::TarReader;
use crate::arc::zip::ZipReader;
use crate::arc::{ArcEntry, EntryKind, Members, ReadEvent};
use crate::args::{self, GlobalOpts};
use crate::core::com::{Allowed, CmdInfo, CreateResult, InputKind, InputOrder, Op};
use crate::core::error::{Error, Result};
use crate::core::file::{self, Behaviour, FileConf, FileObj, OpenFlags, RState, WState};
use crate::core::scheduler::OpId;
use crate::core::Core;
use crate::ops::safe_member_path;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Tar,
    Zip,
    SevenZ,
    Iso,
}

#[derive(Parser, Debug)]
#[command(disable_version_flag = true)]
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

enum Source {
    Tar(TarReader),
    Zip(ZipReader),
    SevenZ(SevenZReader),
    Iso(IsoReader),
}

impl Source {
    fn new(fmt: Format, total_size: u64) -> Result<Source> {
        Ok(match fmt {
            Format::Tar => Source::Tar(TarReader::new()),
            Format::Zip => Source::Zip(ZipReader::new(total_size)),
            Format::SevenZ => Source::SevenZ(SevenZReader::new()),
            Format::Iso => Source::Iso(IsoReader::new()),
        })
    }

    fn is_random(&self) -> bool {
        matches!(self, Source::Zip(_) | Source::SevenZ(_) | Source::Iso(_))
    }

    fn process(&mut self, input: &mut &[u8], out: &mut Vec<u8>, eof: bool) -> Result<ReadEvent> {
        match self {
            Source::Tar(r) => r.process(input, out),
            Source::Zip(r) => r.process(input, out, eof),
            Source::SevenZ(r) => r.process(input, out, eof),
            Source::Iso(r) => r.process(input, out, eof),
        }
    }

    /// Current member metadata (streaming formats).
    fn entry(&self) -> ArcEntry {
        match self {
            Source::Tar(r) => r.entry().clone(),
            Source::Zip(r) => r.entry().clone(),
            Source::SevenZ(r) => r.entry().clone(),
            Source::Iso(r) => r.entry().clone(),
        }
    }

    /// Member table (random-access formats, after the header phase).
    fn members(&self) -> Vec<ArcEntry> {
        match self {
            Source::Zip(r) => r.entries().iter().map(|e| e.meta.clone()).collect(),
            Source::SevenZ(r) => r.files().iter().map(|f| f.entry.clone()).collect(),
            Source::Iso(r) => r.entries().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Position the reader at member `idx`; returns a seek target if the
    /// driver must move its read offset.
    fn begin(&mut self, idx: usize) -> Result<Option<u64>> {
        match self {
            Source::Zip(r) => Ok(Some(r.begin_member(idx))),
            Source::SevenZ(r) => r.begin_member(idx),
            Source::Iso(r) => Ok(r.begin_member(idx)),
            _ => Err(Error::internal("begin_member on a streaming reader")),
        }
    }
}

enum State {
    NextArchive,
    /// Streaming formats and the random-access header phase.
    Drive,
    /// Random access: choose the next member.
    NextMember,
}

pub struct UnArcOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    fmt: Format,
    stop: bool,
    st: State,

    list: bool,
    plain: bool,
    autodir: bool,
    members: Members,

    input: FileObj,
    iname: String,
    in_off: u64,
    in_eof: bool,
    chunk: Vec<u8>,
    chunk_pos: usize,
    src: Option<Source>,

    out: FileObj,
    writing: bool,
    skip_member: bool,
    cur_entry: ArcEntry,
    outbuf: Vec<u8>,
    member_idx: usize,
    member_list: Vec<ArcEntry>,
    n_extracted: u32,
    nfiles: u32,
    stdin_used: bool,
}

fn create(core: &Rc<Core>, mut cmd: Box<CmdInfo>, id: OpId, fmt: Format) -> CreateResult {
    let opts = match args::parse_op::<Opts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    if let Err(e) = args::apply_global(core, &mut cmd, opts.g) {
        error!("{}", e);
        return Err((cmd, 1));
    }
    let members = match Members::new(&opts.member, opts.members_from_file.as_deref()) {
        Ok(m) => m,
        Err(e) => {
            error!("{}", e);
            return Err((cmd, 1));
        }
    };
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
    Ok(Rc::new(RefCell::new(UnArcOp {
        cmd: Some(cmd),
        id,
        fmt,
        stop: false,
        st: State::NextArchive,
        list: opts.list,
        plain: opts.plain,
        autodir: opts.autodir,
        members,
        input: FileObj::create(in_fc),
        iname: String::new(),
        in_off: 0,
        in_eof: false,
        chunk: Vec::new(),
        chunk_pos: 0,
        src: None,
        out: FileObj::create(out_fc),
        writing: false,
        skip_member: false,
        cur_entry: ArcEntry::default(),
        outbuf: Vec::new(),
        member_idx: 0,
        member_list: Vec::new(),
        n_extracted: 0,
        nfiles: 0,
        stdin_used: false,
    })))
}

macro_rules! op_factory {
    ($name:ident, $fmt:expr) => {
        pub fn $name(core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
            create(core, cmd, id, $fmt)
        }
    };
}

op_factory!(create_untar, Format::Tar);
op_factory!(create_unzip, Format::Zip);
op_factory!(create_un7z, Format::SevenZ);
op_factory!(create_uniso, Format::Iso);

enum Feed {
    Ok,
    Async,
}

impl UnArcOp {
    /// Open the next input archive.  Returns false when inputs are
    /// exhausted.
    fn next_archive(&mut self, core: &Rc<Core>) -> Result<bool> {
        let cmd = self.cmd.as_mut().unwrap();
        let stdin_input = cmd.stdin && cmd.input.is_empty() && cmd.input_list.is_none();
        let (name, total) = if stdin_input {
            if self.stdin_used {
                return Ok(false);
            }
            self.stdin_used = true;
            if self.fmt != Format::Tar {
                return Err(Error::argument(
                    "this archive format needs a seekable input file",
                ));
            }
            self.input.open("", OpenFlags::READ | OpenFlags::STDIN)?;
            self.input.set_waker(self.id);
            ("stdin".to_string(), 0)
        } else {
            let Some(n) = cmd.input_next(InputOrder::Default)? else {
                if self.nfiles == 0 {
                    return Err(Error::argument("no input files"));
                }
                return Ok(false);
            };
            self.input
                .open(&n.name, OpenFlags::READ | OpenFlags::READAHEAD)?;
            self.input.set_waker(self.id);
            let total = self.input.info()?.len();
            (n.name, total)
        };
        if self.fmt != Format::Tar {
            // member extraction hops between the directory structures and
            // the file extents
            self.input.behaviour(core, Behaviour::Random);
        }
        self.nfiles += 1;
        self.iname = name;
        self.in_off = 0;
        self.in_eof = false;
        self.chunk.clear();
        self.chunk_pos = 0;
        self.writing = false;
        self.skip_member = false;
        self.src = Some(Source::new(self.fmt, total)?);
        info!("unpacking {}", self.iname);
        Ok(true)
    }

    /// Refill the input chunk at the current offset.
    fn fill(&mut self, core: &Rc<Core>) -> Result<Feed> {
        if self.chunk_pos < self.chunk.len() || self.in_eof {
            return Ok(Feed::Ok);
        }
        let mut buf = std::mem::take(&mut self.chunk);
        let r = self.input.read(core, &mut buf, Some(self.in_off));
        self.chunk = buf;
        self.chunk_pos = 0;
        match r? {
            RState::Data => {
                self.in_off += self.chunk.len() as u64;
                Ok(Feed::Ok)
            }
            RState::Eof => {
                self.chunk.clear();
                self.in_eof = true;
                Ok(Feed::Ok)
            }
            RState::Async => Ok(Feed::Async),
        }
    }

    fn seek_to(&mut self, off: u64) {
        debug!("{}: seek to {:#x}", self.iname, off);
        self.in_off = off;
        self.in_eof = false;
        self.chunk.clear();
        self.chunk_pos = 0;
    }

    fn list_line(&self, e: &ArcEntry) {
        if self.plain {
            println!("{}", e.name);
            return;
        }
        let dt: DateTime<Utc> = e.mtime.into();
        println!(
            "{:>10}  {}  {}{}",
            e.size,
            dt.format("%Y-%m-%d %H:%M:%S"),
            e.name,
            if e.is_dir() { "/" } else { "" }
        );
    }

    /// Extraction root: `-C DIR` plus the archive-stem subdirectory when
    /// `--autodir` is set.
    fn out_dir(&self) -> String {
        let cmd = self.cmd.as_ref().unwrap();
        let mut dir = cmd.chdir.clone().unwrap_or_else(|| ".".to_string());
        if self.autodir {
            let stem = self
                .iname
                .rsplit('/')
                .next()
                .unwrap_or(&self.iname)
                .split('.')
                .next()
                .unwrap_or("archive");
            dir = format!("{}/{}", dir, stem);
        }
        dir
    }

    /// Destination path for a member; None = filtered out.
    fn member_out_name(&self, e: &ArcEntry) -> Result<Option<String>> {
        let cmd = self.cmd.as_ref().unwrap();
        let Some(clean) = safe_member_path(&e.name) else {
            return Err(Error::format(format!("'{}': unsafe member path", e.name)));
        };
        if !self.members.check(&clean) {
            return Ok(None);
        }
        let kind = if e.is_dir() {
            InputKind::Dir
        } else {
            InputKind::File
        };
        if cmd.input_allowed(&clean, kind) != Allowed::Yes {
            return Ok(None);
        }
        Ok(Some(format!("{}/{}", self.out_dir(), clean)))
    }

    /// Handle one member header: open the output (or print, or skip).
    fn on_header(&mut self) -> Result<()> {
        let e = self.cur_entry.clone();
        self.skip_member = false;
        self.writing = false;

        if self.list {
            self.list_line(&e);
            self.skip_member = true;
            return Ok(());
        }

        let oname = match self.member_out_name(&e)? {
            Some(n) => n,
            None => {
                debug!("'{}': filtered out", e.name);
                self.skip_member = true;
                return Ok(());
            }
        };

        let cmd = self.cmd.as_ref().unwrap();
        match e.kind {
            EntryKind::Dir => {
                if !cmd.test {
                    file::dir_create(&oname, true)?;
                }
                self.n_extracted += 1;
                self.skip_member = true;
                return Ok(());
            }
            EntryKind::Symlink => {
                if !cmd.test {
                    file::slink(&e.link_target, &oname, cmd.overwrite)?;
                }
                self.n_extracted += 1;
                self.skip_member = true;
                return Ok(());
            }
            EntryKind::Hardlink => {
                if !cmd.test {
                    // the target was extracted earlier under the same root
                    let clean = safe_member_path(&e.link_target).ok_or_else(|| {
                        Error::format(format!("'{}': unsafe link target", e.link_target))
                    })?;
                    let target = format!("{}/{}", self.out_dir(), clean);
                    file::hlink(&target, &oname)?;
                }
                self.n_extracted += 1;
                self.skip_member = true;
                return Ok(());
            }
            EntryKind::Regular => {}
        }

        let mut flags = file::output_flags(cmd.stdout, cmd.overwrite, cmd.test, cmd.directio);
        if cmd.no_prealloc {
            flags |= OpenFlags::NO_PREALLOC;
        }
        self.out.open(&oname, flags)?;
        self.out.set_waker(self.id);
        self.writing = true;
        debug!("extracting '{}' -> '{}'", e.name, oname);
        Ok(())
    }

    fn on_file_done(&mut self, core: &Rc<Core>) {
        if self.writing {
            let e = &self.cur_entry;
            if e.mtime > SystemTime::UNIX_EPOCH {
                self.out.mtime_set(e.mtime);
            }
            if e.unix_attr & 0o7777 != 0 {
                let _ = self.out.attr_set(e.unix_attr);
            }
            self.out.close(core);
            self.writing = false;
            self.n_extracted += 1;
        }
    }

    /// Per-entry failure policy.
    fn member_error(&mut self, e: crate::core::error::Error) -> Result<()> {
        if self.cmd.as_ref().unwrap().skip_errors {
            warn!("{}", e);
            self.skip_member = true;
            self.writing = false;
            Ok(())
        } else {
            Err(e)
        }
    }

    /// Drive the reader until it needs more input, suspends, or finishes.
    /// Returns the next driver state.
    fn drive(&mut self, core: &Rc<Core>) -> Result<State> {
        loop {
            // flush any pending output first
            if !self.outbuf.is_empty() && self.writing {
                match self.out.write(core, &self.outbuf, None)? {
                    WState::Done => self.outbuf.clear(),
                    WState::Async => return Ok(State::Drive),
                }
            } else if !self.writing {
                self.outbuf.clear();
            }

            match self.fill(core)? {
                Feed::Ok => {}
                Feed::Async => return Ok(State::Drive),
            }

            let mut slice = &self.chunk[self.chunk_pos..];
            let before = slice.len();
            let mut out = std::mem::take(&mut self.outbuf);
            let src = self.src.as_mut().expect("source");
            let ev = src.process(&mut slice, &mut out, self.in_eof);
            let consumed = before - slice.len();
            self.chunk_pos += consumed;
            self.outbuf = out;

            let ev = match ev {
                Ok(ev) => ev,
                Err(e) => {
                    // a random-access reader can abandon one member and
                    // move on; a broken stream cannot be resynchronized
                    if self.src.as_ref().unwrap().is_random()
                        && self.cmd.as_ref().unwrap().skip_errors
                    {
                        warn!("{}", e);
                        if self.writing {
                            self.out.close(core);
                            self.writing = false;
                        }
                        return Ok(State::NextMember);
                    }
                    return Err(e);
                }
            };

            match ev {
                ReadEvent::More => {
                    if self.in_eof && self.chunk_pos >= self.chunk.len() {
                        return Err(Error::format(format!(
                            "{}: unexpected end of archive",
                            self.iname
                        )));
                    }
                }
                ReadEvent::Seek(off) => self.seek_to(off),
                ReadEvent::FileHeader => {
                    self.cur_entry = self.src.as_ref().unwrap().entry();
                    if let Err(e) = self.on_header() {
                        self.member_error(e)?;
                    }
                }
                ReadEvent::Data => {
                    if self.skip_member || !self.writing {
                        self.outbuf.clear();
                    }
                }
                ReadEvent::FileDone => {
                    self.on_file_done(core);
                    if self.src.as_ref().unwrap().is_random() {
                        return Ok(State::NextMember);
                    }
                }
                ReadEvent::Done => {
                    if self.src.as_ref().unwrap().is_random() {
                        self.member_list = self.src.as_ref().unwrap().members();
                        self.member_idx = 0;
                        if self.list {
                            for e in &self.member_list {
                                self.list_line(e);
                            }
                            return Ok(State::NextArchive);
                        }
                        return Ok(State::NextMember);
                    }
                    return Ok(State::NextArchive);
                }
            }
        }
    }

    /// Pick the next member of a random-access archive.
    fn next_member(&mut self) -> Result<State> {
        loop {
            if self.member_idx >= self.member_list.len() {
                return Ok(State::NextArchive);
            }
            let idx = self.member_idx;
            self.member_idx += 1;
            let e = self.member_list[idx].clone();
            self.cur_entry = e;

            // pre-filter before seeking anywhere
            let keep = match self.member_out_name(&self.cur_entry) {
                Ok(k) => k.is_some(),
                Err(e) => {
                    self.member_error(e)?;
                    continue;
                }
            };
            if !keep {
                continue;
            }

            match self.src.as_mut().unwrap().begin(idx)? {
                Some(off) => self.seek_to(off),
                None => {}
            }
            // zip members re-announce themselves through their local
            // header; iso/7z readers go straight to the data
            if self.fmt != Format::Zip {
                if let Err(e) = self.on_header() {
                    self.member_error(e)?;
                }
            }
            return Ok(State::Drive);
        }
    }
}

impl Op for UnArcOp {
    fn run(&mut self, core: &Rc<Core>) {
        let ok = loop {
            if self.stop {
                break false;
            }
            match self.st {
                State::NextArchive => match self.next_archive(core) {
                    Ok(true) => self.st = State::Drive,
                    Ok(false) => break true,
                    Err(e) => {
                        error!("{}", e);
                        break false;
                    }
                },
                State::Drive => match self.drive(core) {
                    Ok(State::Drive) => return, // suspended
                    Ok(s) => self.st = s,
                    Err(e) => {
                        error!("{}", e);
                        break false;
                    }
                },
                State::NextMember => match self.next_member() {
                    Ok(s) => self.st = s,
                    Err(e) => {
                        error!("{}", e);
                        break false;
                    }
                },
            }
        };

        if !self.list {
            info!("{} entries extracted", self.n_extracted);
        }
        let cmd = self.cmd.take().unwrap();
        core.com.complete(core, cmd, self.id, if ok { 0 } else { 1 });
    }

    fn signal(&mut self, _sig: u32) {
        self.stop = true;
    }
}


