/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `ungz`, `unzst`, `unxz`: single-stream decompressors, run as filter
//! chains: file reader -> codec -> file writer.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use log::{debug, error, info};

use crate::arc::gz::GzReader;
use crate::arc::xz::XzReader;
use crate::arc::zst::ZstReader;
use crate::arc::{ArcEntry, ReadEvent};
use crate::args::{self, GlobalOpts};
use crate::core::com::{CmdInfo, CreateResult, InputOrder, Op};
use crate::core::error::Result;
use crate::core::file::{self, FileConf, FileObj, OpenFlags, RState, WState};
use crate::core::scheduler::OpId;
use crate::core::Core;
use crate::pipeline::{AddPos, Chain, ChainRun, OpenResult, Stage, StageCmd, StageFlags, StepResult};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gz,
    Zst,
    Xz,
}

#[derive(Parser, Debug)]
#[command(disable_version_flag = true)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Just show the archive information
    #[arg(short = 'l', long)]
    list: bool,
}

/// Output name for a decompressed stream: the embedded original name when
/// the header carries one, otherwise the archive name minus its extension.
pub fn stream_out_name(chdir: Option<&str>, iname: &str, header_name: &str) -> String {
    let base = if !header_name.is_empty() {
        header_name
            .rsplit('/')
            .next()
            .unwrap_or(header_name)
            .to_string()
    } else {
        let f = iname.rsplit('/').next().unwrap_or(iname);
        f.rsplit_once('.')
            .map(|(s, _)| s.to_string())
            .unwrap_or_else(|| format!("{}.out", f))
    };
    match chdir {
        Some(d) => format!("{}/{}", d, base),
        None => base,
    }
}

/// Producer: reads the archive file (or stdin pipe) sequentially.
struct FileInStage {
    f: FileObj,
    name: String,
    stdin: bool,
    waker: OpId,
}

impl Stage for FileInStage {
    fn open(&mut self, _core: &Rc<Core>, _cmd: &mut StageCmd) -> OpenResult {
        let flags = if self.stdin {
            OpenFlags::READ | OpenFlags::STDIN
        } else {
            OpenFlags::READ | OpenFlags::READAHEAD
        };
        if let Err(e) = self.f.open(&self.name, flags) {
            error!("{}", e);
            return OpenResult::Err;
        }
        self.f.set_waker(self.waker);
        OpenResult::Ok
    }

    fn process(&mut self, core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
        let mut buf = std::mem::take(&mut cmd.output);
        let r = self.f.read(core, &mut buf, None);
        cmd.output = buf;
        match r {
            Ok(RState::Data) => StepResult::Data,
            Ok(RState::Eof) => StepResult::Done,
            Ok(RState::Async) => StepResult::Async,
            Err(e) => {
                error!("{}", e);
                StepResult::Err
            }
        }
    }

    fn close(&mut self, core: &Rc<Core>, _cmd: &mut StageCmd) {
        self.f.close(core);
    }
}

enum Decoder {
    Gz(Box<GzReader>),
    Zst(Box<ZstReader>),
    Xz(Box<XzReader>),
}

/// Transformer: decompresses the stream; publishes the member header for
/// the writer stage.  Unconsumed compressed bytes stay in `pending` across
/// invocations.
struct CodecStage {
    dec: Decoder,
    header: Rc<RefCell<Option<ArcEntry>>>,
    list: bool,
    iname: String,
    pending: Vec<u8>,
    saw_eof: bool,
}

impl CodecStage {
    fn publish_header(&self, e: ArcEntry) {
        if self.list {
            println!(
                "{}  {}",
                self.iname,
                if e.name.is_empty() { "-" } else { &e.name }
            );
        }
        *self.header.borrow_mut() = Some(e);
    }
}

impl Stage for CodecStage {
    fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
        if cmd.flags.contains(StageFlags::FWD) {
            // an empty forward window from the first position means the
            // upstream reader finished
            if cmd.flags.contains(StageFlags::FIRST) && cmd.input.is_empty() {
                self.saw_eof = true;
            }
            self.pending.extend_from_slice(&cmd.input);
            cmd.input.clear();
        }

        if self.header.borrow().is_none() && !matches!(self.dec, Decoder::Gz(_)) {
            // zst/xz frames carry no member metadata
            self.publish_header(ArcEntry::default());
        }

        let pending = std::mem::take(&mut self.pending);
        let mut slice = &pending[..];
        let r = loop {
            let mut out = std::mem::take(&mut cmd.output);
            let ev = match &mut self.dec {
                Decoder::Gz(d) => d.process(&mut slice, &mut out, self.saw_eof),
                Decoder::Zst(d) => d.process(&mut slice, &mut out, self.saw_eof),
                Decoder::Xz(d) => d.process(&mut slice, &mut out, self.saw_eof),
            };
            cmd.output = out;
            match ev {
                Ok(ReadEvent::FileHeader) => {
                    if let Decoder::Gz(d) = &self.dec {
                        self.publish_header(d.entry().clone());
                    }
                    continue;
                }
                Ok(ReadEvent::Data) => break StepResult::Data,
                Ok(ReadEvent::More) => break StepResult::More,
                Ok(ReadEvent::FileDone) | Ok(ReadEvent::Done) => break StepResult::Done,
                Ok(ReadEvent::Seek(_)) => {
                    error!("stream decoder cannot seek");
                    break StepResult::Err;
                }
                Err(e) => {
                    error!("{}", e);
                    break StepResult::Err;
                }
            }
        };
        self.pending = slice.to_vec();
        r
    }
}

/// Consumer: writes decoded bytes, named after the member header.  In list
/// mode it discards the data instead.
struct FileOutStage {
    f: FileObj,
    header: Rc<RefCell<Option<ArcEntry>>>,
    iname: String,
    chdir: Option<String>,
    output: Option<String>,
    stdout: bool,
    overwrite: bool,
    test: bool,
    discard: bool,
    opened: bool,
    waker: OpId,
}

impl FileOutStage {
    fn open_out(&mut self) -> Result<()> {
        let e = self.header.borrow();
        let header_name = e.as_ref().map(|e| e.name.as_str()).unwrap_or("");
        let oname = if self.stdout {
            String::new()
        } else {
            match &self.output {
                Some(o) => o.clone(),
                None => stream_out_name(self.chdir.as_deref(), &self.iname, header_name),
            }
        };
        let flags = file::output_flags(self.stdout, self.overwrite, self.test, false);
        self.f.open(&oname, flags)?;
        self.f.set_waker(self.waker);
        debug!("extracting '{}' -> '{}'", self.iname, oname);
        Ok(())
    }
}

impl Stage for FileOutStage {
    fn process(&mut self, core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
        if self.discard {
            if cmd.input.is_empty() && cmd.flags.contains(StageFlags::FWD) {
                return StepResult::Fin;
            }
            cmd.input.clear();
            return StepResult::More;
        }
        if !self.opened {
            self.opened = true;
            if let Err(e) = self.open_out() {
                error!("{}", e);
                return StepResult::Err;
            }
        }
        if cmd.input.is_empty() {
            if cmd.flags.contains(StageFlags::FWD) {
                return StepResult::Fin;
            }
            return StepResult::More;
        }
        match self.f.write(core, &cmd.input, None) {
            Ok(WState::Done) => {
                cmd.input.clear();
                StepResult::More
            }
            Ok(WState::Async) => StepResult::Async,
            Err(e) => {
                error!("{}", e);
                StepResult::Err
            }
        }
    }

    fn close(&mut self, core: &Rc<Core>, _cmd: &mut StageCmd) {
        if let Some(e) = self.header.borrow().as_ref() {
            if e.mtime > std::time::SystemTime::UNIX_EPOCH {
                self.f.mtime_set(e.mtime);
            }
        }
        self.f.close(core);
    }
}

pub struct UnStreamOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    codec: Codec,
    stop: bool,
    list: bool,
    chain: Option<Chain>,
    nfiles: u32,
    stdin_used: bool,
}

fn create(core: &Rc<Core>, mut cmd: Box<CmdInfo>, id: OpId, codec: Codec) -> CreateResult {
    let opts = match args::parse_op::<Opts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    if let Err(e) = args::apply_global(core, &mut cmd, opts.g) {
        error!("{}", e);
        return Err((cmd, 1));
    }
    Ok(Rc::new(RefCell::new(UnStreamOp {
        cmd: Some(cmd),
        id,
        codec,
        stop: false,
        list: opts.list,
        chain: None,
        nfiles: 0,
        stdin_used: false,
    })))
}

pub fn create_ungz(core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    create(core, cmd, id, Codec::Gz)
}

pub fn create_unzst(core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    create(core, cmd, id, Codec::Zst)
}

pub fn create_unxz(core: &Rc<Core>, cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    create(core, cmd, id, Codec::Xz)
}

impl UnStreamOp {
    /// Build the chain for the next input archive; false = inputs done.
    fn next_chain(&mut self) -> Result<bool> {
        let cmd = self.cmd.as_mut().unwrap();
        let stdin_input = cmd.stdin && cmd.input.is_empty() && cmd.input_list.is_none();
        let (iname, use_stdin) = if stdin_input {
            if self.stdin_used {
                return Ok(false);
            }
            self.stdin_used = true;
            ("stdin".to_string(), true)
        } else {
            match cmd.input_next(InputOrder::Default)? {
                Some(n) => (n.name, false),
                None => {
                    if self.nfiles == 0 {
                        return Err(crate::core::error::Error::argument("no input files"));
                    }
                    return Ok(false);
                }
            }
        };
        self.nfiles += 1;
        info!("unpacking {}", iname);

        let dec = match self.codec {
            Codec::Gz => Decoder::Gz(Box::new(GzReader::new())),
            Codec::Zst => Decoder::Zst(Box::new(ZstReader::new()?)),
            Codec::Xz => Decoder::Xz(Box::new(XzReader::new()?)),
        };
        let header = Rc::new(RefCell::new(None));

        let cmd = self.cmd.as_mut().unwrap();
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

        let mut chain = Chain::new();
        chain.add(
            AddPos::Last,
            "file-in",
            Box::new(FileInStage {
                f: FileObj::create(in_fc),
                name: if use_stdin { String::new() } else { iname.clone() },
                stdin: use_stdin,
                waker: self.id,
            }),
        );
        let codec_name = match self.codec {
            Codec::Gz => "ungz",
            Codec::Zst => "unzst",
            Codec::Xz => "unxz",
        };
        chain.add(
            AddPos::Last,
            codec_name,
            Box::new(CodecStage {
                dec,
                header: header.clone(),
                list: self.list,
                iname: iname.clone(),
                pending: Vec::new(),
                saw_eof: false,
            }),
        );
        chain.add(
            AddPos::Last,
            "file-out",
            Box::new(FileOutStage {
                f: FileObj::create(out_fc),
                header,
                iname,
                chdir: cmd.chdir.clone(),
                output: cmd.output.clone(),
                stdout: cmd.stdout,
                overwrite: cmd.overwrite,
                test: cmd.test,
                discard: self.list,
                opened: false,
                waker: self.id,
            }),
        );
        self.chain = Some(chain);
        Ok(true)
    }
}

impl Op for UnStreamOp {
    fn run(&mut self, core: &Rc<Core>) {
        let ok = loop {
            if self.stop {
                break false;
            }
            if self.chain.is_none() {
                match self.next_chain() {
                    Ok(true) => {}
                    Ok(false) => break true,
                    Err(e) => {
                        error!("{}", e);
                        break false;
                    }
                }
            }
            match self.chain.as_mut().unwrap().run(core) {
                ChainRun::Done => {
                    self.chain = None;
                }
                ChainRun::Async => return,
                ChainRun::Err => break false,
            }
        };

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
    use crate::arc::gz::GzWriter;
    use crate::ops::REGISTRY;
    use std::fs;
    use std::time::SystemTime;

    #[test]
    fn test_stream_out_name() {
        assert_eq!("data.bin", stream_out_name(None, "dir/data.bin.gz", ""));
        assert_eq!(
            "out/orig.txt",
            stream_out_name(Some("out"), "x.gz", "a/orig.txt")
        );
    }

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

    #[test]
    fn test_ungz_chain_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let arch = dir.path().join("payload.txt.gz");
        let mut w = GzWriter::new(6, "payload.txt", SystemTime::UNIX_EPOCH);
        let mut data = Vec::new();
        w.data(b"through the filter chain", &mut data).unwrap();
        w.finish(&mut data).unwrap();
        fs::write(&arch, &data).unwrap();

        let code = run_op(
            "ungz",
            &[arch.to_str().unwrap(), "-C", dir.path().to_str().unwrap()],
        );
        assert_eq!(0, code);
        assert_eq!(
            b"through the filter chain".to_vec(),
            fs::read(dir.path().join("payload.txt")).unwrap()
        );
    }

    #[test]
    fn test_ungz_corrupt_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let arch = dir.path().join("bad.gz");
        fs::write(&arch, b"definitely not gzip").unwrap();
        let code = run_op(
            "ungz",
            &[arch.to_str().unwrap(), "-C", dir.path().to_str().unwrap()],
        );
        assert_eq!(1, code);
    }
}
