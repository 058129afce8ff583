/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::SystemTime;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::core::error::{Error, Result};
use crate::core::fbuf::{BufSet, WriteBuf, ALIGN};
use crate::core::pipe::{PipeIo, PipeReader, PipeWriter};
use crate::core::scheduler::OpId;
use crate::core::Core;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_N_BUFFERS: usize = 3;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct OpenFlags: u32 {
        const READ = 1;
        const WRITE = 2;
        const READWRITE = 4;
        const CREATENEW = 8;
        const CREATE = 0x10;
        const STDIN = 0x20;
        const STDOUT = 0x40;
        const DIRECTIO = 0x80;
        const FAKEWRITE = 0x100;
        const NO_PREALLOC = 0x200;
        const INFO_NOFOLLOW = 0x400;
        const READAHEAD = 0x800;
    }
}

impl OpenFlags {
    fn is_write(self) -> bool {
        self.intersects(OpenFlags::WRITE | OpenFlags::READWRITE)
    }
}

/// Derive output-file open flags from the shared descriptor.
pub fn output_flags(stdout: bool, overwrite: bool, test: bool, directio: bool) -> OpenFlags {
    let mut f = OpenFlags::WRITE;
    f |= if overwrite {
        OpenFlags::CREATE
    } else {
        OpenFlags::CREATENEW
    };
    if stdout {
        f |= OpenFlags::STDOUT;
    }
    if test {
        f |= OpenFlags::FAKEWRITE;
    }
    if directio {
        f |= OpenFlags::DIRECTIO;
    }
    f
}

#[derive(Default)]
pub struct FileConf {
    pub buffer_size: usize,
    pub n_buffers: usize,
    pub fd_stdin: Option<PipeReader>,
    pub fd_stdout: Option<PipeWriter>,
}

#[derive(PartialEq, Eq, Debug)]
pub enum RState {
    Data,
    Eof,
    Async,
}

#[derive(PartialEq, Eq, Debug)]
pub enum WState {
    Done,
    Async,
}

pub enum Behaviour {
    Sequential,
    Random,
    TruncPrealloc,
}

enum Backing {
    Closed,
    File(fs::File),
    Stdin,
    Stdout,
    PipeR(PipeReader),
    PipeW(PipeWriter),
    Fake,
}

/// Buffered file object: asynchronous-looking read/write with a user-space
/// read cache, a coalescing write buffer, preallocate-then-truncate and
/// optional direct I/O, over a regular file, the standard streams or an
/// in-memory pipe.
pub struct FileObj {
    name: String,
    backing: Backing,
    open_flags: OpenFlags,
    buffer_size: usize,
    mtime: Option<SystemTime>,
    rbufs: BufSet,
    wbuf: WriteBuf,
    size: u64,
    cur_off: u64,
    prealloc: u64,
    wpartial: usize,
    fd_stdin: Option<PipeReader>,
    fd_stdout: Option<PipeWriter>,
    waker: Option<OpId>,
    total_read: u64,
    total_written: u64,
}

impl FileObj {
    pub fn create(conf: FileConf) -> Self {
        let mut buffer_size = conf.buffer_size;
        if buffer_size == 0 {
            buffer_size = DEFAULT_BUFFER_SIZE;
        }
        buffer_size = buffer_size.next_multiple_of(ALIGN);
        let n_buffers = if conf.n_buffers == 0 {
            DEFAULT_N_BUFFERS
        } else {
            conf.n_buffers
        };
        FileObj {
            name: String::new(),
            backing: Backing::Closed,
            open_flags: OpenFlags::empty(),
            buffer_size,
            mtime: None,
            rbufs: BufSet::new(n_buffers, buffer_size),
            wbuf: WriteBuf::new(buffer_size),
            size: 0,
            cur_off: 0,
            prealloc: 0,
            wpartial: 0,
            fd_stdin: conf.fd_stdin,
            fd_stdout: conf.fd_stdout,
            waker: None,
            total_read: 0,
            total_written: 0,
        }
    }

    /// Operation to re-post when a pipe-backed call returns `Async`.
    pub fn set_waker(&mut self, id: OpId) {
        self.waker = Some(id);
    }

    pub fn open(&mut self, name: &str, how: OpenFlags) -> Result<()> {
        self.close_inner();
        self.open_flags = how;
        self.rbufs.reset();
        self.wbuf.clear();
        self.size = 0;
        self.prealloc = 0;
        self.cur_off = 0;
        self.wpartial = 0;
        self.mtime = None;

        if how.contains(OpenFlags::STDIN) {
            debug!("file: using stdin");
            self.backing = match self.fd_stdin.take() {
                Some(pr) => Backing::PipeR(pr),
                None => Backing::Stdin,
            };
            return Ok(());
        }
        if how.contains(OpenFlags::STDOUT) {
            debug!("file: using stdout");
            self.open_flags |= OpenFlags::WRITE | OpenFlags::NO_PREALLOC;
            self.backing = match self.fd_stdout.take() {
                Some(pw) => Backing::PipeW(pw),
                None => Backing::Stdout,
            };
            return Ok(());
        }

        self.name = name.to_string();

        if how.contains(OpenFlags::FAKEWRITE) {
            self.backing = Backing::Fake;
            return Ok(());
        }

        let mut direct = how.contains(OpenFlags::DIRECTIO);
        let mut create_new = how.contains(OpenFlags::CREATENEW);
        let mut mkdir_tried = false;
        let file = loop {
            let mut oo = fs::OpenOptions::new();
            if how.contains(OpenFlags::READWRITE) {
                oo.read(true).write(true);
            } else if how.contains(OpenFlags::WRITE) {
                oo.write(true);
            } else {
                oo.read(true);
            }
            if create_new {
                oo.create_new(true);
            } else if how.contains(OpenFlags::CREATE) {
                oo.create(true);
            }
            if direct {
                oo.custom_flags(libc::O_DIRECT);
            }

            match oo.open(&self.name) {
                Ok(f) => break f,
                Err(e) => {
                    if direct && e.raw_os_error() == Some(libc::EINVAL) {
                        debug!("directio: EINVAL");
                        direct = false;
                        // keep the partially created file on retry
                        create_new = false;
                        continue;
                    }
                    if !mkdir_tried
                        && e.kind() == io::ErrorKind::NotFound
                        && how.is_write()
                    {
                        mkdir_tried = true;
                        if let Some(parent) = Path::new(&self.name).parent() {
                            fs::create_dir_all(parent).map_err(|e| {
                                Error::system(format!("create path for '{}'", self.name), e)
                            })?;
                            continue;
                        }
                    }
                    return Err(Error::system(format!("file open: '{}'", self.name), e));
                }
            }
        };

        if how.contains(OpenFlags::DIRECTIO) && !direct {
            info!("{}: opened without direct I/O", self.name);
            self.open_flags.remove(OpenFlags::DIRECTIO);
        }

        if how.contains(OpenFlags::READAHEAD) {
            fadvise(&file, libc::POSIX_FADV_SEQUENTIAL);
        }

        debug!("{}: opened file", self.name);
        self.backing = Backing::File(file);
        Ok(())
    }

    /// Read at `off` (`None`: current position) into `out`.
    pub fn read(&mut self, core: &Core, out: &mut Vec<u8>, off: Option<u64>) -> Result<RState> {
        let off = off.unwrap_or(self.cur_off);
        out.clear();

        if let Some(b) = self.rbufs.find(off) {
            debug!("{}: @{}: cache hit: {} @{}", self.name, off, b.len, b.off);
            out.extend_from_slice(&b.data[(off - b.off) as usize..b.len]);
            self.cur_off = b.off + b.len as u64;
            return Ok(if out.is_empty() { RState::Eof } else { RState::Data });
        }

        let buffer_size = self.buffer_size;
        let (read_off, n) = match &mut self.backing {
            Backing::File(f) => {
                let aligned = off & !(ALIGN as u64 - 1);
                let b = self.rbufs.next_buf();
                let n = f
                    .read_at(&mut b.data[..buffer_size], aligned)
                    .map_err(|e| Error::system(format!("file read: '{}'", self.name), e))?;
                b.off = aligned;
                b.len = n;
                (aligned, n)
            }
            Backing::Stdin => {
                if off != self.cur_off {
                    return Err(Error::format("invalid seeking on stdin"));
                }
                let b = self.rbufs.next_buf();
                let n = io::stdin()
                    .read(&mut b.data[..buffer_size])
                    .map_err(|e| Error::system("stdin read", e))?;
                b.off = off;
                b.len = n;
                (off, n)
            }
            Backing::PipeR(pr) => {
                if off != self.cur_off {
                    return Err(Error::format("invalid seeking on stdin"));
                }
                let b = self.rbufs.next_buf();
                match pr.read(core, &mut b.data[..buffer_size], self.waker) {
                    PipeIo::Done(n) => {
                        b.off = off;
                        b.len = n;
                        (off, n)
                    }
                    PipeIo::Eof => {
                        b.off = off;
                        b.len = 0;
                        (off, 0)
                    }
                    PipeIo::WouldBlock => return Ok(RState::Async),
                }
            }
            _ => return Err(Error::internal("read on a write-only file object")),
        };

        if n < buffer_size {
            self.size = read_off + n as u64;
        }
        self.total_read += n as u64;
        debug!("{}: read {} @{}", self.name, n, read_off);

        let b = self.rbufs.find(off);
        match b {
            Some(b) => {
                out.extend_from_slice(&b.data[(off - b.off) as usize..b.len]);
                self.cur_off = b.off + b.len as u64;
            }
            None => {
                // the filled buffer ends before `off`: end of file
                self.cur_off = read_off + n as u64;
            }
        }
        Ok(if out.is_empty() { RState::Eof } else { RState::Data })
    }

    /// Write `data` at `off` (`None`: current position).  On `Async` the
    /// object remembers its progress; re-call with the same arguments.
    pub fn write(&mut self, core: &Core, data: &[u8], off: Option<u64>) -> Result<WState> {
        if self.open_flags.contains(OpenFlags::FAKEWRITE) {
            let off = off.unwrap_or(self.cur_off);
            self.size = self.size.max(off + data.len() as u64);
            self.cur_off = off + data.len() as u64;
            return Ok(WState::Done);
        }

        let mut off = off.unwrap_or(self.cur_off);
        // resume after a previous Async return
        let mut data = &data[self.wpartial..];
        off += self.wpartial as u64;

        self.maybe_prealloc(off + data.len() as u64);

        loop {
            if !self.wbuf.is_contiguous(off) || self.wbuf.is_full() {
                match self.flush_wbuf(core)? {
                    WState::Done => {}
                    WState::Async => return Ok(WState::Async),
                }
            }
            if data.is_empty() {
                break;
            }
            let n = self.wbuf.fill(data, off);
            if n != data.len() {
                debug!(
                    "{}: write: cached {} bytes @{}+{}",
                    self.name, n, self.wbuf.off, self.wbuf.len
                );
            }
            data = &data[n..];
            off += n as u64;
            self.wpartial += n;
        }

        self.cur_off = off;
        self.wpartial = 0;
        Ok(WState::Done)
    }

    /// Force the pending write buffer out.
    pub fn flush(&mut self, core: &Core) -> Result<WState> {
        self.flush_wbuf(core)
    }

    fn maybe_prealloc(&mut self, end: u64) {
        if self.open_flags.contains(OpenFlags::NO_PREALLOC) || self.prealloc >= end {
            return;
        }
        let Backing::File(f) = &self.backing else { return };
        self.prealloc = end.next_power_of_two();
        if let Err(e) = f.set_len(self.prealloc) {
            warn!("file truncate: '{}': {}", self.name, e);
            self.open_flags |= OpenFlags::NO_PREALLOC;
            self.prealloc = 0;
        }
    }

    fn flush_wbuf(&mut self, core: &Core) -> Result<WState> {
        if self.wbuf.is_empty() {
            return Ok(WState::Done);
        }
        if let Backing::PipeW(pw) = &self.backing {
            if self.wbuf.off != self.size {
                return Err(Error::format("invalid seeking on stdout"));
            }
            loop {
                let wlen = self.wbuf.len;
                if wlen == 0 {
                    return Ok(WState::Done);
                }
                match pw.write(core, &self.wbuf.data[..wlen], self.waker) {
                    PipeIo::Done(n) => {
                        self.wbuf.consume(n);
                        self.size += n as u64;
                        self.total_written += n as u64;
                    }
                    PipeIo::WouldBlock => return Ok(WState::Async),
                    PipeIo::Eof => {
                        return Err(Error::format("write on a closed pipe"));
                    }
                }
            }
        }
        self.flush_nonpipe()
    }

    fn flush_nonpipe(&mut self) -> Result<WState> {
        if self.wbuf.is_empty() {
            return Ok(WState::Done);
        }
        let off = self.wbuf.off;
        let len = self.wbuf.len;
        match &self.backing {
            Backing::File(f) => {
                let mut wlen = len;
                if self.open_flags.contains(OpenFlags::DIRECTIO) {
                    wlen = len.next_multiple_of(ALIGN);
                    self.wbuf.data[len..wlen].fill(0);
                }
                f.write_all_at(&self.wbuf.data[..wlen], off).map_err(|e| {
                    Error::system(format!("file write: '{}' {} @{}", self.name, wlen, off), e)
                })?;
                self.total_written += wlen as u64;
                debug!("{}: written {} @{}", self.name, wlen, off);
                self.size = self.size.max(off + len as u64);
                self.prealloc = self.prealloc.max(off + wlen as u64);
                self.wbuf.clear();
                Ok(WState::Done)
            }
            Backing::Stdout => {
                if off != self.size {
                    return Err(Error::format("invalid seeking on stdout"));
                }
                io::stdout()
                    .write_all(&self.wbuf.data[..len])
                    .map_err(|e| Error::system("stdout write", e))?;
                self.size += len as u64;
                self.total_written += len as u64;
                self.wbuf.clear();
                Ok(WState::Done)
            }
            _ => Err(Error::internal("write on a read-only file object")),
        }
    }

    /// Set physical size to `size` (`None`: current logical offset).
    pub fn trunc(&mut self, size: Option<u64>) {
        if self.open_flags.contains(OpenFlags::NO_PREALLOC) {
            return;
        }
        let size = size.unwrap_or(self.cur_off);
        self.prealloc = size;
        if let Backing::File(f) = &self.backing {
            if let Err(e) = f.set_len(size) {
                warn!("file truncate: '{}': {}", self.name, e);
                self.open_flags |= OpenFlags::NO_PREALLOC;
            }
        }
        debug!("{}: truncate: {}", self.name, self.prealloc);
    }

    pub fn behaviour(&mut self, core: &Core, b: Behaviour) {
        match b {
            Behaviour::Sequential => {
                if let Backing::File(f) = &self.backing {
                    if let Ok(md) = f.metadata() {
                        self.size = md.len();
                    }
                    fadvise(f, libc::POSIX_FADV_SEQUENTIAL);
                    debug!("{}: sequential access", self.name);
                }
            }
            Behaviour::Random => {
                if let Backing::File(f) = &self.backing {
                    fadvise(f, libc::POSIX_FADV_RANDOM);
                    debug!("{}: random access", self.name);
                }
            }
            Behaviour::TruncPrealloc => {
                if let Err(e) = self.flush(core) {
                    warn!("file flush: '{}': {}", self.name, e);
                }
                self.prealloc_trunc();
            }
        }
    }

    pub fn info(&self) -> Result<fs::Metadata> {
        if self.open_flags.contains(OpenFlags::INFO_NOFOLLOW) {
            return fs::symlink_metadata(&self.name)
                .map_err(|e| Error::system(format!("file get info: '{}'", self.name), e));
        }
        match &self.backing {
            Backing::File(f) => f
                .metadata()
                .map_err(|e| Error::system(format!("file get info: '{}'", self.name), e)),
            _ => fs::metadata(&self.name)
                .map_err(|e| Error::system(format!("file get info: '{}'", self.name), e)),
        }
    }

    /// Remember the mtime to apply when the file is closed.
    pub fn mtime_set(&mut self, t: SystemTime) {
        if self.open_flags.contains(OpenFlags::FAKEWRITE) {
            return;
        }
        self.mtime = Some(t);
    }

    pub fn attr_set(&mut self, mode: u32) -> Result<()> {
        if self.open_flags.contains(OpenFlags::FAKEWRITE) {
            return Ok(());
        }
        if let Backing::File(f) = &self.backing {
            f.set_permissions(fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| Error::system(format!("file set attr: '{}'", self.name), e))?;
            debug!("{}: attr: {:o}", self.name, mode);
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn prealloc_trunc(&mut self) {
        if self.prealloc <= self.size {
            return;
        }
        debug!("{}: truncate: {}/{}", self.name, self.size, self.prealloc);
        if let Backing::File(f) = &self.backing {
            if let Err(e) = f.set_len(self.size) {
                warn!("file truncate: '{}': {}", self.name, e);
                return;
            }
            self.prealloc = self.size;
        }
    }

    fn apply_mtime(&self) {
        let Some(t) = self.mtime else { return };
        if self.open_flags.contains(OpenFlags::STDOUT) {
            return;
        }
        if let Backing::File(f) = &self.backing {
            if let Err(e) = f.set_modified(t) {
                warn!("file set mtime: '{}': {}", self.name, e);
            }
        }
    }

    fn close_inner(&mut self) {
        if matches!(self.backing, Backing::Closed) {
            return;
        }

        if self.open_flags.is_write() {
            // pipe-backed outputs flush through `close(core)` beforehand
            if !matches!(self.backing, Backing::PipeW(_)) {
                if let Err(e) = self.flush_nonpipe() {
                    log::error!("file flush: {}", e);
                }
            }
            self.prealloc_trunc();
            self.apply_mtime();
        }

        match std::mem::replace(&mut self.backing, Backing::Closed) {
            Backing::File(f) => {
                drop(f);
                if self.open_flags.is_write() {
                    debug!("saved file: {} ({})", self.name, self.size);
                } else {
                    debug!("read file: {} ({} bytes read)", self.name, self.total_read);
                }
            }
            // stdin/stdout and pipe ends are owned by whoever created them
            _ => {}
        }
        self.name.clear();
        self.total_read = 0;
        self.total_written = 0;
    }

    /// Flush to a pipe-backed output before closing; regular files flush in
    /// [`FileObj::close`] unconditionally.
    pub fn close(&mut self, core: &Core) {
        if let Backing::PipeW(_) = self.backing {
            if let Err(e) = self.flush_wbuf(core) {
                log::error!("file flush: {}", e);
            }
        }
        self.close_inner();
    }
}

impl Drop for FileObj {
    fn drop(&mut self) {
        self.close_inner();
    }
}

fn fadvise(f: &fs::File, advice: libc::c_int) {
    use std::os::unix::io::AsRawFd;
    let r = unsafe { libc::posix_fadvise(f.as_raw_fd(), 0, 0, advice) };
    if r != 0 {
        debug!("posix_fadvise: {}", io::Error::from_raw_os_error(r));
    }
}

/// Create a directory; with `recursive`, create missing parents too.
/// Succeeds if the directory already exists.
pub fn dir_create(name: &str, recursive: bool) -> Result<()> {
    let r = if recursive {
        fs::create_dir_all(name)
    } else {
        match fs::create_dir(name) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{}: directory already exists", name);
                return Ok(());
            }
            r => r,
        }
    };
    r.map_err(|e| Error::system(format!("directory create: '{}'", name), e))?;
    info!("{}: created directory", name);
    Ok(())
}

pub fn hlink(oldpath: &str, newpath: &str) -> Result<()> {
    fs::hard_link(oldpath, newpath)
        .map_err(|e| Error::system(format!("hard link: '{}' -> '{}'", newpath, oldpath), e))?;
    info!("created hard link: {} -> {}", newpath, oldpath);
    Ok(())
}

/// With `overwrite`, an existing link file is removed and the link retried.
pub fn slink(target: &str, linkpath: &str, overwrite: bool) -> Result<()> {
    match std::os::unix::fs::symlink(target, linkpath) {
        Ok(()) => {}
        Err(e) if overwrite && e.kind() == io::ErrorKind::AlreadyExists => {
            fs::remove_file(linkpath)
                .map_err(|e| Error::system(format!("remove: '{}'", linkpath), e))?;
            std::os::unix::fs::symlink(target, linkpath).map_err(|e| {
                Error::system(format!("symlink: '{}' -> '{}'", linkpath, target), e)
            })?;
        }
        Err(e) => {
            return Err(Error::system(
                format!("symlink: '{}' -> '{}'", linkpath, target),
                e,
            ))
        }
    }
    info!("created symbolic link: {} -> {}", linkpath, target);
    Ok(())
}

/// Rename; with `safe`, fail if the target exists.  A missing target parent
/// directory is created and the rename retried once.
pub fn move_file(old: &str, new: &str, safe: bool) -> Result<()> {
    if safe && fs::symlink_metadata(new).is_ok() {
        return Err(Error::Exists(new.to_string()));
    }
    match fs::rename(old, new) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = Path::new(new).parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::system(format!("create path for '{}'", new), e))?;
            }
            fs::rename(old, new)
                .map_err(|e| Error::system(format!("move: '{}' -> '{}'", old, new), e))?;
        }
        Err(e) => return Err(Error::system(format!("move: '{}' -> '{}'", old, new), e)),
    }
    info!("moved: {} -> {}", old, new);
    Ok(())
}

pub fn del(name: &str) -> Result<()> {
    let md = fs::symlink_metadata(name)
        .map_err(|e| Error::system(format!("file delete: '{}'", name), e))?;
    let r = if md.is_dir() {
        fs::remove_dir(name)
    } else {
        fs::remove_file(name)
    };
    r.map_err(|e| Error::system(format!("file delete: '{}'", name), e))?;
    info!("file deleted: {}", name);
    Ok(())
}

/// Unix mode bits with the directory bit, as stored in snapshots/archives.
pub fn unix_mode(md: &fs::Metadata) -> u32 {
    md.mode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;

    fn write_file(core: &Core, path: &str, data: &[u8], flags: OpenFlags) {
        let mut f = FileObj::create(FileConf::default());
        f.open(path, flags).unwrap();
        assert_eq!(WState::Done, f.write(core, data, None).unwrap());
        f.close(core);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let core = Core::new_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let path = path.to_str().unwrap();
        write_file(
            &core,
            path,
            b"hello world",
            OpenFlags::WRITE | OpenFlags::CREATENEW,
        );

        let mut f = FileObj::create(FileConf::default());
        f.open(path, OpenFlags::READ).unwrap();
        let mut out = Vec::new();
        assert_eq!(RState::Data, f.read(&core, &mut out, None).unwrap());
        assert_eq!(b"hello world", &out[..]);
        assert_eq!(RState::Eof, f.read(&core, &mut out, None).unwrap());
    }

    #[test]
    fn test_prealloc_truncated_on_close() {
        let core = Core::new_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        let path = path.to_str().unwrap();
        write_file(
            &core,
            path,
            &[7u8; 1000],
            OpenFlags::WRITE | OpenFlags::CREATENEW,
        );
        // watermark grew past the logical size during the write, the close
        // must shrink it back
        assert_eq!(1000, fs::metadata(path).unwrap().len());
    }

    #[test]
    fn test_fakewrite_leaves_no_file() {
        let core = Core::new_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let path = path.to_str().unwrap();
        let mut f = FileObj::create(FileConf::default());
        f.open(path, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::FAKEWRITE)
            .unwrap();
        f.write(&core, b"discarded", None).unwrap();
        assert_eq!(9, f.size());
        f.close(&core);
        assert!(fs::metadata(path).is_err());
    }

    #[test]
    fn test_parent_dir_created_for_output() {
        let core = Core::new_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/dir/x.bin");
        let path = path.to_str().unwrap();
        write_file(&core, path, b"x", OpenFlags::WRITE | OpenFlags::CREATENEW);
        assert_eq!(1, fs::metadata(path).unwrap().len());
    }

    #[test]
    fn test_createnew_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.bin");
        fs::write(&path, b"old").unwrap();
        let mut f = FileObj::create(FileConf::default());
        assert!(f
            .open(path.to_str().unwrap(), OpenFlags::WRITE | OpenFlags::CREATENEW)
            .is_err());
    }

    #[test]
    fn test_mtime_applied_on_close() {
        let core = Core::new_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        let path = path.to_str().unwrap();
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        let mut f = FileObj::create(FileConf::default());
        f.open(path, OpenFlags::WRITE | OpenFlags::CREATENEW).unwrap();
        f.write(&core, b"x", None).unwrap();
        f.mtime_set(t);
        f.close(&core);
        assert_eq!(t, fs::metadata(path).unwrap().modified().unwrap());
    }

    #[test]
    fn test_random_offset_write_size() {
        let core = Core::new_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.bin");
        let path = path.to_str().unwrap();
        let mut f = FileObj::create(FileConf::default());
        f.open(path, OpenFlags::WRITE | OpenFlags::CREATENEW).unwrap();
        f.write(&core, b"abcd", Some(100)).unwrap();
        f.write(&core, b"xy", Some(0)).unwrap();
        f.close(&core);
        // size equals max(offset + bytes) over all writes
        assert_eq!(104, fs::metadata(path).unwrap().len());
    }
}
