/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `sync`: compare/synchronize directories or create a file tree snapshot.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use crate::args::{self, GlobalOpts};
use crate::core::com::{CmdInfo, CreateResult, Op};
use crate::core::error::{Error, Result};
use crate::core::file::{FileConf, FileObj, OpenFlags, WState};
use crate::core::scheduler::{OpId, Task};
use crate::core::Core;
use crate::sync::action::{self, ActionOpts, Enabled, Outcome};
use crate::sync::diff::{Diff, DiffOpts, DiffStatus, SortBy, ViewProps};
use crate::sync::{scan, snapfile, Snapshot};

#[derive(Parser, Debug)]
#[command(
    name = "sync",
    about = "Compare/synchronize directories or create a file tree snapshot.\n\
             Implies '--recursive'.",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Create an INPUT_DIR tree snapshot
    #[arg(short = 's', long)]
    snapshot: bool,

    /// Treat .zip files as directories
    #[arg(long = "zip-expand")]
    zip_expand: bool,

    /// Use a snapshot file for the input file tree
    #[arg(long = "source-snap")]
    source_snap: bool,

    /// Use a snapshot file for the output file tree
    #[arg(long = "target-snap")]
    target_snap: bool,

    /// Just show the difference table; STR is empty or a set of [ADUM]
    #[arg(short = 'd', long = "diff", value_name = "STR")]
    diff: Option<String>,

    /// diff: don't check file attributes
    #[arg(long = "diff-no-attr")]
    diff_no_attr: bool,

    /// diff: don't check file time
    #[arg(long = "diff-no-time")]
    diff_no_time: bool,

    /// diff: file time granularity is 2 seconds
    #[arg(long = "diff-time-sec")]
    diff_time_2sec: bool,

    /// diff: don't show directory entries
    #[arg(long = "diff-no-dir")]
    diff_no_dir: bool,

    /// diff: don't cut file names
    #[arg(long = "diff-fullname")]
    diff_fullname: bool,

    /// Match moved files by metadata only (detects moves across renamed
    /// directories)
    #[arg(long = "move-no-name")]
    move_no_name: bool,

    /// Only show files less than DAYS days old
    #[arg(long, value_name = "DAYS")]
    recent: Option<u32>,

    /// Plain list of file names
    #[arg(short = 'p', long)]
    plain: bool,

    /// Sort the table by: name, size or mtime
    #[arg(long, value_name = "KEY", default_value = "name")]
    sort: String,

    /// Copy new files
    #[arg(long)]
    add: bool,

    /// Delete old files
    #[arg(long)]
    delete: bool,

    /// Overwrite modified files
    #[arg(long)]
    update: bool,

    /// Move files
    #[arg(long = "move")]
    mv: bool,

    /// Just copy the file date (don't overwrite content); use with --update
    #[arg(long = "replace-date")]
    replace_date: bool,

    /// Pass --write-into to `copy`
    #[arg(long = "write-into")]
    write_into: bool,
}

enum State {
    Begin,
    SyncNext,
    SyncWait,
}

pub struct SyncOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    st: State,
    o: Opts,

    diff: Option<Diff>,
    sel_pos: usize,
    cur_idx: usize,
    child_result: Rc<Cell<Option<i32>>>,
    n_done: u32,
    n_err: u32,
}

pub fn create(core: &Rc<Core>, mut cmd: Box<CmdInfo>, id: OpId) -> CreateResult {
    let mut opts = match args::parse_op::<Opts>(&cmd) {
        Ok(o) => o,
        Err(code) => return Err((cmd, code)),
    };
    let globals = std::mem::take(&mut opts.g);
    if let Err(e) = args::apply_global(core, &mut cmd, globals) {
        error!("{}", e);
        return Err((cmd, 1));
    }
    cmd.recursive = true;

    if cmd.input.is_empty() && cmd.input_list.is_none() {
        error!("no input directory");
        return Err((cmd, 1));
    }
    if cmd.output.is_none() && !cmd.stdout {
        error!("use -o to set the target directory or snapshot file");
        return Err((cmd, 1));
    }

    Ok(Rc::new(RefCell::new(SyncOp {
        cmd: Some(cmd),
        id,
        stop: false,
        st: State::Begin,
        o: opts,
        diff: None,
        sel_pos: 0,
        cur_idx: 0,
        child_result: Rc::new(Cell::new(None)),
        n_done: 0,
        n_err: 0,
    })))
}

/// `--diff=ADUM` letter set → status mask; empty string selects all four.
fn diff_mask(s: &str) -> Result<DiffStatus> {
    if s.is_empty() {
        return Ok(DiffStatus::LEFT | DiffStatus::RIGHT | DiffStatus::NEQ | DiffStatus::MOVE);
    }
    let mut mask = DiffStatus::empty();
    for c in s.chars() {
        mask |= match c.to_ascii_uppercase() {
            'A' => DiffStatus::LEFT,
            'D' => DiffStatus::RIGHT,
            'U' => DiffStatus::NEQ,
            'M' => DiffStatus::MOVE,
            'E' => DiffStatus::EQ,
            other => {
                return Err(Error::argument(format!(
                    "--diff: unknown flag '{}'",
                    other
                )))
            }
        };
    }
    Ok(mask)
}

fn status_tag(st: DiffStatus) -> &'static str {
    if st.contains(DiffStatus::MOVE) {
        "MOV"
    } else if st.contains(DiffStatus::LEFT) {
        "ADD"
    } else if st.contains(DiffStatus::RIGHT) {
        "DEL"
    } else if st.contains(DiffStatus::NEQ) {
        "UPD"
    } else {
        "EQ"
    }
}

impl SyncOp {
    fn left_snapshot(&self, cmd: &CmdInfo) -> Result<Snapshot> {
        let src = &cmd.input[0];
        if self.o.source_snap {
            snapfile::read(src)
        } else {
            scan::scan(src, self.o.zip_expand)
        }
    }

    fn right_snapshot(&self, cmd: &CmdInfo) -> Result<Snapshot> {
        let dst = cmd.output.as_deref().expect("target path");
        if self.o.target_snap {
            snapfile::read(dst)
        } else {
            scan::scan(dst, self.o.zip_expand)
        }
    }

    /// `sync INPUT -s -o SNAPSHOT`: write the snapshot file.
    fn write_snapshot(&mut self, core: &Rc<Core>) -> Result<()> {
        let cmd = self.cmd.as_ref().unwrap();
        let snap = self.left_snapshot(cmd)?;
        let text = snapfile::write(&snap)?;

        let mut f = FileObj::create(FileConf {
            buffer_size: cmd.buffer_size,
            n_buffers: 1,
            ..FileConf::default()
        });
        let mut flags = OpenFlags::WRITE;
        flags |= if cmd.overwrite {
            OpenFlags::CREATE
        } else {
            OpenFlags::CREATENEW
        };
        if cmd.stdout {
            flags |= OpenFlags::STDOUT;
        }
        if cmd.test {
            flags |= OpenFlags::FAKEWRITE;
        }
        let name = cmd.output.clone().unwrap_or_default();
        f.open(&name, flags)?;
        match f.write(core, text.as_bytes(), None)? {
            WState::Done => {}
            WState::Async => return Err(Error::internal("unexpected suspension on output")),
        }
        f.close(core);
        info!("{}: saved snapshot ({} entries)", name, snap.total);
        Ok(())
    }

    fn build_diff(&mut self, core: &Rc<Core>) -> Result<()> {
        let cmd = self.cmd.as_ref().unwrap();
        info!("comparing source & target...");
        let left = self.left_snapshot(cmd)?;
        let right = self.right_snapshot(cmd)?;

        let mut dopts = DiffOpts::empty();
        if self.o.diff_no_attr {
            dopts |= DiffOpts::NO_ATTR;
        }
        if self.o.diff_no_time {
            dopts |= DiffOpts::NO_TIME;
        }
        if self.o.diff_time_2sec {
            dopts |= DiffOpts::TIME_2SEC;
        }
        if self.o.move_no_name {
            dopts |= DiffOpts::MOVE_NO_NAME;
        }
        let mut diff = Diff::build(left, right, dopts);

        let mask = match &self.o.diff {
            Some(s) => diff_mask(s)?,
            None => {
                let mut m = DiffStatus::empty();
                if self.o.add {
                    m |= DiffStatus::LEFT;
                }
                if self.o.delete {
                    m |= DiffStatus::RIGHT;
                }
                if self.o.update {
                    m |= DiffStatus::NEQ;
                }
                if self.o.mv {
                    m |= DiffStatus::MOVE;
                }
                if m.is_empty() {
                    m = DiffStatus::LEFT | DiffStatus::RIGHT | DiffStatus::NEQ | DiffStatus::MOVE;
                }
                // adding files implies creating their directories
                m
            }
        };

        let cmd = self.cmd.as_ref().unwrap();
        let props = ViewProps {
            include: cmd.include.clone(),
            exclude: cmd.exclude.clone(),
            since_time: self
                .o
                .recent
                .map(|days| core.sched.utc() - Duration::from_secs(days as u64 * 86_400)),
            show_dirs: !self.o.diff_no_dir,
        };
        let n = diff.view(&props, mask);
        let sort = match self.o.sort.as_str() {
            "name" => SortBy::Name,
            "size" => SortBy::FileSize,
            "mtime" => SortBy::Mtime,
            other => {
                return Err(Error::argument(format!("--sort: unknown key '{}'", other)))
            }
        };
        diff.sort(sort);
        info!("{} entries selected", n);
        self.diff = Some(diff);
        Ok(())
    }

    fn print_table(&self) {
        const WIDTH_NAME: usize = 40;
        let cut = |s: &str| -> String {
            if self.o.diff_fullname || s.len() <= WIDTH_NAME {
                s.to_string()
            } else {
                format!("...{}", &s[s.len() - (WIDTH_NAME - 3)..])
            }
        };
        let diff = self.diff.as_ref().unwrap();
        for &i in diff.selected() {
            let (st, lname, rname) = diff.info(i, false);
            if self.o.plain {
                println!("{}", if lname.is_empty() { &rname } else { &lname });
                continue;
            }
            match status_tag(st) {
                "MOV" => println!("MOV  {} -> {}", cut(&rname), cut(&lname)),
                "DEL" => println!("DEL  {}", cut(&rname)),
                tag => println!("{}  {}", tag, cut(&lname)),
            }
        }
    }

    /// Launch the action for the next selected entry.  Returns the next
    /// state.
    fn sync_next(&mut self, core: &Rc<Core>) -> Result<State> {
        let enabled = Enabled {
            add: self.o.add,
            delete: self.o.delete,
            update: self.o.update,
            mv: self.o.mv,
        };
        let cmd = self.cmd.as_ref().unwrap();
        let aopts = ActionOpts {
            replace_date: self.o.replace_date,
            write_into: self.o.write_into,
            test: cmd.test,
            buffer_size: cmd.buffer_size,
        };
        loop {
            let diff = self.diff.as_ref().unwrap();
            if self.sel_pos >= diff.selected().len() {
                return Ok(State::Begin); // signals completion to run()
            }
            let idx = diff.selected()[self.sel_pos];
            self.sel_pos += 1;
            self.cur_idx = idx;

            self.child_result.set(None);
            let result = self.child_result.clone();
            let id = self.id;
            let on_complete = Box::new(move |core: &Rc<Core>, res: i32| {
                result.set(Some(res));
                core.sched.post(Task::RunOp(id));
            });

            match action::sync_entry(core, diff, idx, enabled, &aopts, on_complete)? {
                Outcome::Started => {
                    let diff = self.diff.as_mut().unwrap();
                    diff.set_status(idx, DiffStatus::SYNCING, DiffStatus::SYNCING);
                    return Ok(State::SyncWait);
                }
                Outcome::Done => {
                    let diff = self.diff.as_mut().unwrap();
                    diff.set_status(
                        idx,
                        DiffStatus::SYNCING | DiffStatus::DONE,
                        DiffStatus::DONE,
                    );
                    self.n_done += 1;
                }
                Outcome::Skipped => {}
            }
        }
    }
}

impl Op for SyncOp {
    fn run(&mut self, core: &Rc<Core>) {
        let ok = loop {
            if self.stop {
                break false;
            }
            match self.st {
                State::Begin => {
                    if self.o.snapshot {
                        match self.write_snapshot(core) {
                            Ok(()) => break true,
                            Err(e) => {
                                error!("{}", e);
                                break false;
                            }
                        }
                    }
                    if let Err(e) = self.build_diff(core) {
                        error!("{}", e);
                        break false;
                    }

                    let syncing =
                        self.o.add || self.o.delete || self.o.update || self.o.mv;
                    if self.o.diff.is_some() || !syncing {
                        self.print_table();
                        break true;
                    }
                    self.st = State::SyncNext;
                }

                State::SyncNext => match self.sync_next(core) {
                    Ok(State::SyncWait) => {
                        self.st = State::SyncWait;
                        return;
                    }
                    Ok(State::Begin) => {
                        info!("synchronized: {} done, {} errors", self.n_done, self.n_err);
                        break self.n_err == 0;
                    }
                    Ok(_) => unreachable!(),
                    Err(e) => {
                        error!("{}", e);
                        break false;
                    }
                },

                State::SyncWait => {
                    let Some(res) = self.child_result.get() else {
                        return;
                    };
                    let diff = self.diff.as_mut().unwrap();
                    if res == 0 {
                        diff.set_status(
                            self.cur_idx,
                            DiffStatus::SYNCING | DiffStatus::DONE,
                            DiffStatus::DONE,
                        );
                        self.n_done += 1;
                    } else {
                        diff.set_status(
                            self.cur_idx,
                            DiffStatus::SYNCING | DiffStatus::ERROR,
                            DiffStatus::ERROR,
                        );
                        self.n_err += 1;
                    }
                    self.st = State::SyncNext;
                }
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
    use crate::ops::REGISTRY;
    use std::fs;

    fn run_sync(args: &[&str]) -> i32 {
        let core = Core::new(crate::core::CoreConf::default(), REGISTRY);
        let mut cmd = CmdInfo::new();
        cmd.operation = "sync".into();
        cmd.argv = args.iter().map(|s| s.to_string()).collect();
        match core.com.run(&core, cmd) {
            Err(code) => code,
            Ok(()) => core.sched.run(&core),
        }
    }

    #[test]
    fn test_sync_diff_mode_completes() {
        let dir = tempfile::tempdir().unwrap();
        let l = dir.path().join("l");
        let r = dir.path().join("r");
        fs::create_dir(&l).unwrap();
        fs::create_dir(&r).unwrap();
        fs::write(l.join("only-left"), b"x").unwrap();
        fs::write(r.join("only-right"), b"y").unwrap();
        assert_eq!(
            0,
            run_sync(&[l.to_str().unwrap(), "-o", r.to_str().unwrap(), "--diff", ""])
        );
    }

    #[test]
    fn test_sync_add_and_move_actions() {
        let dir = tempfile::tempdir().unwrap();
        let l = dir.path().join("l");
        let r = dir.path().join("r");
        fs::create_dir_all(l.join("sub")).unwrap();
        fs::create_dir_all(r.join("sub")).unwrap();
        // new file on the left
        fs::write(l.join("new.txt"), b"fresh").unwrap();
        // same file, moved on the right
        fs::write(l.join("sub/kept.txt"), b"kept").unwrap();
        fs::write(r.join("kept.txt"), b"kept").unwrap();
        let t = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        for p in [l.join("sub/kept.txt"), r.join("kept.txt")] {
            fs::File::options()
                .write(true)
                .open(&p)
                .unwrap()
                .set_modified(t)
                .unwrap();
        }

        let code = run_sync(&[
            l.to_str().unwrap(),
            "-o",
            r.to_str().unwrap(),
            "--add",
            "--move",
        ]);
        assert_eq!(0, code);
        assert_eq!(b"fresh".to_vec(), fs::read(r.join("new.txt")).unwrap());
        // the moved file was renamed into the left-side layout
        assert!(r.join("sub/kept.txt").exists());
        assert!(!r.join("kept.txt").exists());
    }

    #[test]
    fn test_sync_snapshot_roundtrip_diff_clean() {
        let dir = tempfile::tempdir().unwrap();
        let l = dir.path().join("data");
        fs::create_dir(&l).unwrap();
        fs::write(l.join("f.txt"), b"stable").unwrap();
        let snap = dir.path().join("data.snap");

        assert_eq!(
            0,
            run_sync(&[l.to_str().unwrap(), "-s", "-o", snap.to_str().unwrap()])
        );
        let text = fs::read_to_string(&snap).unwrap();
        assert!(text.contains("\tv 1\n"));

        // the snapshot diffed against the live directory is all-equal, so
        // the default ADUM mask selects nothing
        assert_eq!(
            0,
            run_sync(&[
                snap.to_str().unwrap(),
                "--source-snap",
                "-o",
                l.to_str().unwrap(),
                "--diff",
                ""
            ])
        );
    }

    #[test]
    fn test_diff_mask_letters() {
        assert_eq!(
            DiffStatus::LEFT | DiffStatus::RIGHT | DiffStatus::NEQ | DiffStatus::MOVE,
            diff_mask("").unwrap()
        );
        assert_eq!(DiffStatus::LEFT | DiffStatus::MOVE, diff_mask("am").unwrap());
        assert!(diff_mask("x").is_err());
    }

    #[test]
    fn test_status_tags() {
        assert_eq!("ADD", status_tag(DiffStatus::LEFT));
        assert_eq!("DEL", status_tag(DiffStatus::RIGHT));
        assert_eq!("UPD", status_tag(DiffStatus::NEQ | DiffStatus::NEWER));
        assert_eq!("MOV", status_tag(DiffStatus::MOVE));
        assert_eq!("EQ", status_tag(DiffStatus::EQ));
    }
}
