/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `textcount`: analyze text files (line counts, line lengths, sizes).

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use log::error;

use crate::args::{self, GlobalOpts};
use crate::core::com::{Allowed, CmdInfo, CreateResult, InputKind, InputOrder, Op};
use crate::core::file::{FileConf, FileObj, OpenFlags, RState};
use crate::core::scheduler::OpId;
use crate::core::Core;

#[derive(Parser, Debug)]
#[command(
    name = "textcount",
    about = "Analyze text files (e.g. print number of lines).\n\
             `fcom textcount @` counts standard input.",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,
}

#[derive(Default, Clone, Copy)]
struct Stat {
    size: u64,
    lines: u64,
    empty_lines: u64,
    max_line: u64,
}

impl Stat {
    fn add(&mut self, other: &Stat) {
        self.size += other.size;
        self.lines += other.lines;
        self.empty_lines += other.empty_lines;
        self.max_line = self.max_line.max(other.max_line);
    }
}

pub struct TextCountOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    input: FileObj,
    nfiles: u64,
    all: Stat,
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
    // `@` alone means "count the stream itself", not a name list
    if cmd.input_list.as_deref() == Some("") {
        cmd.input_list = None;
        cmd.stdin = true;
    }
    let fc = FileConf {
        buffer_size: cmd.buffer_size,
        ..FileConf::default()
    };
    Ok(Rc::new(RefCell::new(TextCountOp {
        cmd: Some(cmd),
        id,
        stop: false,
        input: FileObj::create(fc),
        nfiles: 0,
        all: Stat::default(),
    })))
}

/// Count a whole stream; `tail` carries the unterminated-line length
/// between chunks.
fn count_chunk(stat: &mut Stat, tail: &mut u64, data: &[u8]) {
    stat.size += data.len() as u64;
    for &b in data {
        if b == b'\n' {
            stat.lines += 1;
            if *tail == 0 {
                stat.empty_lines += 1;
            }
            stat.max_line = stat.max_line.max(*tail);
            *tail = 0;
        } else if b != b'\r' {
            *tail += 1;
        }
    }
}

fn finish_count(stat: &mut Stat, tail: u64) {
    if tail > 0 {
        stat.lines += 1;
        stat.max_line = stat.max_line.max(tail);
    }
}

impl TextCountOp {
    fn count_file(&mut self, core: &Rc<Core>, name: &str, stdin: bool) -> crate::core::error::Result<Stat> {
        let flags = if stdin {
            OpenFlags::READ | OpenFlags::STDIN
        } else {
            OpenFlags::READ | OpenFlags::READAHEAD
        };
        self.input.open(name, flags)?;
        let mut stat = Stat::default();
        let mut tail = 0u64;
        let mut buf = Vec::new();
        loop {
            match self.input.read(core, &mut buf, None)? {
                RState::Data => count_chunk(&mut stat, &mut tail, &buf),
                RState::Eof => break,
                RState::Async => {
                    return Err(crate::core::error::Error::internal(
                        "unexpected suspension on input",
                    ))
                }
            }
        }
        finish_count(&mut stat, tail);
        Ok(stat)
    }
}

impl Op for TextCountOp {
    fn run(&mut self, core: &Rc<Core>) {
        let mut ok = true;
        let use_stdin = {
            let cmd = self.cmd.as_ref().unwrap();
            cmd.stdin && cmd.input.is_empty() && cmd.input_list.is_none()
        };

        if use_stdin {
            match self.count_file(core, "", true) {
                Ok(stat) => {
                    self.nfiles = 1;
                    self.all.add(&stat);
                }
                Err(e) => {
                    error!("{}", e);
                    ok = false;
                }
            }
        } else {
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
                let is_dir = std::fs::metadata(&n.name).map(|m| m.is_dir()).unwrap_or(false);
                let cmd = self.cmd.as_mut().unwrap();
                if is_dir {
                    if cmd.recursive {
                        cmd.input_dir();
                    }
                    continue;
                }
                if cmd.input_allowed(&n.name, InputKind::File) != Allowed::Yes {
                    continue;
                }
                match self.count_file(core, &n.name, false) {
                    Ok(stat) => {
                        self.nfiles += 1;
                        println!(
                            "{}: lines={} non-empty={} max-line={} size={}",
                            n.name,
                            stat.lines,
                            stat.lines - stat.empty_lines,
                            stat.max_line,
                            stat.size
                        );
                        self.all.add(&stat);
                    }
                    Err(e) => {
                        error!("{}", e);
                        ok = false;
                        break;
                    }
                }
            }
        }

        if ok {
            println!(
                "total: files={} lines={} non-empty={} max-line={} size={}",
                self.nfiles,
                self.all.lines,
                self.all.lines - self.all.empty_lines,
                self.all.max_line,
                self.all.size
            );
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

    fn count(data: &[u8]) -> Stat {
        let mut s = Stat::default();
        let mut tail = 0;
        count_chunk(&mut s, &mut tail, data);
        finish_count(&mut s, tail);
        s
    }

    #[test]
    fn test_count_basic() {
        let s = count(b"foo\nbar\n");
        assert_eq!(2, s.lines);
        assert_eq!(0, s.empty_lines);
        assert_eq!(3, s.max_line);
        assert_eq!(8, s.size);
    }

    #[test]
    fn test_count_empty_lines_and_no_trailing_newline() {
        let s = count(b"a\n\nlonger line");
        assert_eq!(3, s.lines);
        assert_eq!(1, s.empty_lines);
        assert_eq!(11, s.max_line);
    }

    #[test]
    fn test_count_crlf() {
        let s = count(b"ab\r\ncd\r\n");
        assert_eq!(2, s.lines);
        assert_eq!(2, s.max_line);
    }

    #[test]
    fn test_count_split_across_chunks() {
        let mut s = Stat::default();
        let mut tail = 0;
        count_chunk(&mut s, &mut tail, b"long li");
        count_chunk(&mut s, &mut tail, b"ne here\nx");
        finish_count(&mut s, tail);
        assert_eq!(2, s.lines);
        assert_eq!(14, s.max_line);
    }
}
