/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `trash`: move files to the user's trash directory, with optional
//! content wiping and name obfuscation.

use std::cell::RefCell;
use std::process::Command;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use log::{debug, error, info, warn};

use crate::args::{self, GlobalOpts};
use crate::core::com::{CmdInfo, CreateResult, InputOrder, Op};
use crate::core::error::{Error, Result};
use crate::core::file::{self, FileConf, FileObj, OpenFlags, WState};
use crate::core::scheduler::OpId;
use crate::core::Core;

#[derive(Parser, Debug)]
#[command(
    name = "trash",
    about = "Move files to user's trash directory, plus obfuscation.",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Overwrite data to hide file content (files only); also resets the
    /// modification time to 2000-01-01
    #[arg(short = 'w', long)]
    wipe: bool,

    /// Rename to "00000000.0000" before deleting (files only)
    #[arg(short = 'n', long)]
    rename: bool,
}

pub struct TrashOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    n_trashed: u32,
    n_deleted: u32,
    wipe: bool,
    rename: bool,
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
    Ok(Rc::new(RefCell::new(TrashOp {
        cmd: Some(cmd),
        id,
        stop: false,
        n_trashed: 0,
        n_deleted: 0,
        wipe: opts.wipe,
        rename: opts.rename,
    })))
}

/// Overwrite the file content with zeros and reset its mtime.
fn wipe_file(core: &Core, name: &str, buffer_size: usize) -> Result<()> {
    let md = std::fs::metadata(name)
        .map_err(|e| Error::system(format!("file get info: '{}'", name), e))?;
    if md.is_dir() {
        return Ok(());
    }
    let mut f = FileObj::create(FileConf {
        buffer_size,
        n_buffers: 1,
        ..FileConf::default()
    });
    f.open(name, OpenFlags::WRITE | OpenFlags::NO_PREALLOC)?;
    let zeros = vec![0u8; 64 * 1024];
    let mut left = md.len();
    while left > 0 {
        let n = (left as usize).min(zeros.len());
        match f.write(core, &zeros[..n], None)? {
            WState::Done => left -= n as u64,
            WState::Async => {
                return Err(Error::internal("unexpected suspension on a regular file"))
            }
        }
    }
    // 2000-01-01 00:00:00 UTC
    f.mtime_set(SystemTime::UNIX_EPOCH + Duration::from_secs(946_684_800));
    f.close(core);
    debug!("wiped: {}", name);
    Ok(())
}

/// Rename to an anonymous name in the same directory.
fn obfuscate_name(name: &str) -> Result<String> {
    use rand::Rng as _;
    let dir = match name.rfind('/') {
        Some(i) => &name[..i + 1],
        None => "",
    };
    let mut rng = rand::thread_rng();
    let mut target = format!("{}00000000.0000", dir);
    if std::fs::symlink_metadata(&target).is_ok() {
        // occupied: pick a random numeric name instead
        target = format!("{}{:08}.{:04}", dir, rng.gen_range(0..99_999_999u32), rng.gen_range(0..9999u32));
    }
    file::move_file(name, &target, true)?;
    Ok(target)
}

/// Move one path into `~/.local/share/Trash` by hand (freedesktop layout).
fn trash_home(name: &str) -> Result<()> {
    let home = std::env::var("HOME")
        .map_err(|_| Error::format("trash: HOME is not set"))?;
    let abs = std::fs::canonicalize(name)
        .map_err(|e| Error::system(format!("file get info: '{}'", name), e))?;
    let files_dir = format!("{}/.local/share/Trash/files", home);
    let info_dir = format!("{}/.local/share/Trash/info", home);
    file::dir_create(&files_dir, true)?;
    file::dir_create(&info_dir, true)?;

    let base = name.rsplit('/').next().unwrap_or(name);
    let mut target = format!("{}/{}", files_dir, base);
    let mut n = 1u32;
    while std::fs::symlink_metadata(&target).is_ok() {
        target = format!("{}/{}.{}", files_dir, base, n);
        n += 1;
    }
    let tbase = target.rsplit('/').next().unwrap_or(base);

    let dt: chrono::DateTime<chrono::Utc> = SystemTime::now().into();
    let info = format!(
        "[Trash Info]\nPath={}\nDeletionDate={}\n",
        abs.display(),
        dt.format("%Y-%m-%dT%H:%M:%S")
    );
    std::fs::write(format!("{}/{}.trashinfo", info_dir, tbase), info)
        .map_err(|e| Error::system("trash info write", e))?;
    file::move_file(name, &target, true)?;
    Ok(())
}

/// Move one path to the trash: the desktop service first, the home trash
/// directory when that is unavailable.
fn trash_path(name: &str) -> Result<()> {
    let gio = Command::new("gio").arg("trash").arg("--").arg(name).output();
    match gio {
        Ok(out) if out.status.success() => return Ok(()),
        Ok(out) => debug!(
            "gio trash: '{}': {}",
            name,
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => debug!("gio trash: {}", e),
    }
    trash_home(name)
}

impl Op for TrashOp {
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

            let cmd = self.cmd.as_ref().unwrap();
            let (test, overwrite, skip_errors, bufsize) =
                (cmd.test, cmd.overwrite, cmd.skip_errors, cmd.buffer_size);
            if test {
                info!("would trash: {}", n.name);
                continue;
            }

            let r = (|| -> Result<()> {
                let mut name = n.name.clone();
                if self.wipe {
                    wipe_file(core, &name, bufsize)?;
                }
                if self.rename {
                    name = obfuscate_name(&name)?;
                }
                match trash_path(&name) {
                    Ok(()) => {
                        self.n_trashed += 1;
                        Ok(())
                    }
                    Err(e) if overwrite => {
                        // -f: fall back to plain deletion
                        warn!("{}", e);
                        file::del(&name)?;
                        self.n_deleted += 1;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })();

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

        info!(
            "trashed {} files, deleted {} files",
            self.n_trashed, self.n_deleted
        );
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
    fn test_wipe_overwrites_and_resets_mtime() {
        let core = Core::new_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("secret.txt");
        std::fs::write(&p, b"top secret").unwrap();
        wipe_file(&core, p.to_str().unwrap(), 0).unwrap();
        assert_eq!(vec![0u8; 10], std::fs::read(&p).unwrap());
        let mt = std::fs::metadata(&p).unwrap().modified().unwrap();
        assert_eq!(
            SystemTime::UNIX_EPOCH + Duration::from_secs(946_684_800),
            mt
        );
    }

    #[test]
    fn test_trash_home_layout() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        std::fs::create_dir(&home).unwrap();
        let old_home = std::env::var("HOME").ok();
        std::env::set_var("HOME", &home);

        let victim = dir.path().join("victim.txt");
        std::fs::write(&victim, b"gone").unwrap();
        trash_home(victim.to_str().unwrap()).unwrap();
        assert!(!victim.exists());
        assert!(home.join(".local/share/Trash/files/victim.txt").exists());
        let info = std::fs::read_to_string(
            home.join(".local/share/Trash/info/victim.txt.trashinfo"),
        )
        .unwrap();
        assert!(info.starts_with("[Trash Info]\n"));
        assert!(info.contains("Path="));

        match old_home {
            Some(h) => std::env::set_var("HOME", h),
            None => std::env::remove_var("HOME"),
        }
    }

    #[test]
    fn test_obfuscate_name_same_directory() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("visible.txt");
        std::fs::write(&p, b"x").unwrap();
        let new = obfuscate_name(p.to_str().unwrap()).unwrap();
        assert!(new.starts_with(dir.path().to_str().unwrap()));
        assert!(new.ends_with("00000000.0000"));
        assert!(std::path::Path::new(&new).exists());
    }
}
