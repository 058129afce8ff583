/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! ISO 9660 reader and writer: primary volume descriptor, directory
//! records, L/M path tables.  The writer computes the complete volume
//! layout up front, so output streams strictly forward.

use std::collections::VecDeque;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use log::debug;

use crate::arc::{get_u32le, ArcEntry, EntryKind, ReadEvent};
use crate::core::error::{Error, Result};

pub const SECTOR: usize = 2048;
const PVD_SECTOR: u64 = 16;
const FLAG_DIR: u8 = 2;

fn u16_both(v: u16) -> [u8; 4] {
    let mut b = [0u8; 4];
    b[..2].copy_from_slice(&v.to_le_bytes());
    b[2..].copy_from_slice(&v.to_be_bytes());
    b
}

fn u32_both(v: u32) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[..4].copy_from_slice(&v.to_le_bytes());
    b[4..].copy_from_slice(&v.to_be_bytes());
    b
}

fn rec_datetime(t: SystemTime) -> [u8; 7] {
    let dt: DateTime<Utc> = t.into();
    [
        (dt.year() - 1900).clamp(0, 255) as u8,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
        0, // UTC
    ]
}

fn datetime_from_rec(b: &[u8]) -> SystemTime {
    let y = 1900 + b[0] as i32;
    let tz_quarters = b[6] as i8;
    match Utc
        .with_ymd_and_hms(
            y,
            (b[1] as u32).max(1),
            (b[2] as u32).max(1),
            b[3] as u32,
            b[4] as u32,
            b[5] as u32,
        )
        .single()
    {
        Some(dt) => {
            let utc = dt - chrono::Duration::minutes(tz_quarters as i64 * 15);
            utc.into()
        }
        None => SystemTime::UNIX_EPOCH,
    }
}

struct DirRef {
    path: String,
    extent: u64,
    size: u64,
}

enum RState {
    Start,
    Pvd,
    DirExtent,
    Ready,
    FileData,
    MemberDone,
}

/// ISO 9660 reader: walks the directory hierarchy from the PVD, then
/// extracts file extents.
pub struct IsoReader {
    state: RState,
    buf: Vec<u8>,
    dir_queue: VecDeque<DirRef>,
    cur_dir: Option<DirRef>,
    entries: Vec<ArcEntry>,
    cur: usize,
    data_left: u64,
}

impl IsoReader {
    pub fn new() -> Self {
        IsoReader {
            state: RState::Start,
            buf: Vec::new(),
            dir_queue: VecDeque::new(),
            cur_dir: None,
            entries: Vec::new(),
            cur: 0,
            data_left: 0,
        }
    }

    pub fn entries(&self) -> &[ArcEntry] {
        &self.entries
    }

    pub fn headers_done(&self) -> bool {
        matches!(self.state, RState::Ready)
    }

    pub fn entry(&self) -> &ArcEntry {
        &self.entries[self.cur]
    }

    /// Begin extraction of entry `idx`; returns the offset to read from.
    pub fn begin_member(&mut self, idx: usize) -> Option<u64> {
        self.cur = idx;
        let e = &self.entries[idx];
        if e.kind != EntryKind::Regular || e.size == 0 {
            self.state = RState::MemberDone;
            return None;
        }
        self.data_left = e.size;
        self.state = RState::FileData;
        Some(e.offset)
    }

    /// Parse one directory record; returns (consumed, entry) where a zero
    /// consumed length means "advance to the next sector boundary".
    fn parse_record(data: &[u8], dir_path: &str) -> Result<(usize, Option<(ArcEntry, bool)>)> {
        if data.is_empty() {
            return Ok((0, None));
        }
        let len = data[0] as usize;
        if len == 0 {
            return Ok((0, None));
        }
        if len < 34 || len > data.len() {
            return Err(Error::format("iso: bad directory record"));
        }
        let extent = get_u32le(&data[2..6]) as u64;
        let size = get_u32le(&data[10..14]) as u64;
        let mtime = datetime_from_rec(&data[18..25]);
        let flags = data[25];
        let name_len = data[32] as usize;
        if 33 + name_len > len {
            return Err(Error::format("iso: bad directory record"));
        }
        let raw = &data[33..33 + name_len];

        // self / parent pseudo-entries
        if name_len == 1 && (raw[0] == 0 || raw[0] == 1) {
            return Ok((len, None));
        }

        let mut name = String::from_utf8_lossy(raw).into_owned();
        if let Some(i) = name.find(';') {
            name.truncate(i);
        }
        let is_dir = flags & FLAG_DIR != 0;
        let full = if dir_path.is_empty() {
            name
        } else {
            format!("{}/{}", dir_path, name)
        };
        let e = ArcEntry {
            name: full,
            size: if is_dir { 0 } else { size },
            // for directories this carries the extent size (needed to walk
            // the hierarchy); meaningless to callers either way
            compressed_size: size,
            mtime,
            unix_attr: if is_dir { 0o755 } else { 0o644 },
            kind: if is_dir { EntryKind::Dir } else { EntryKind::Regular },
            link_target: String::new(),
            win_attr: 0,
            offset: extent * SECTOR as u64,
        };
        Ok((len, Some((e, is_dir))))
    }

    pub fn process(
        &mut self,
        input: &mut &[u8],
        output: &mut Vec<u8>,
        eof: bool,
    ) -> Result<ReadEvent> {
        loop {
            match self.state {
                RState::Start => {
                    self.state = RState::Pvd;
                    self.buf.clear();
                    return Ok(ReadEvent::Seek(PVD_SECTOR * SECTOR as u64));
                }

                RState::Pvd => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    if self.buf.len() < SECTOR {
                        if eof {
                            return Err(Error::format("iso: truncated volume descriptor"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    let sec: Vec<u8> = self.buf.drain(..SECTOR).collect();
                    if &sec[1..6] != b"CD001" {
                        return Err(Error::format("iso: bad volume descriptor id"));
                    }
                    match sec[0] {
                        1 => {
                            // root directory record sits at offset 156
                            let extent = get_u32le(&sec[158..162]) as u64;
                            let size = get_u32le(&sec[166..170]) as u64;
                            self.dir_queue.push_back(DirRef {
                                path: String::new(),
                                extent,
                                size,
                            });
                            debug!("iso: root directory at sector {}", extent);
                            // keep scanning until the set terminator
                        }
                        255 => {
                            let Some(d) = self.dir_queue.pop_front() else {
                                return Err(Error::format("iso: no primary volume descriptor"));
                            };
                            self.buf.clear();
                            let off = d.extent * SECTOR as u64;
                            self.cur_dir = Some(d);
                            self.state = RState::DirExtent;
                            return Ok(ReadEvent::Seek(off));
                        }
                        _ => {} // supplementary descriptors are skipped
                    }
                }

                RState::DirExtent => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    let dir = self.cur_dir.as_ref().expect("directory context");
                    if (self.buf.len() as u64) < dir.size {
                        if eof {
                            return Err(Error::format("iso: truncated directory extent"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    let data: Vec<u8> = std::mem::take(&mut self.buf);
                    let data = &data[..dir.size as usize];
                    let mut pos = 0;
                    while pos < data.len() {
                        let (len, parsed) = Self::parse_record(&data[pos..], &dir.path)?;
                        if len == 0 {
                            // zero fill: next record starts on a sector edge
                            pos = (pos / SECTOR + 1) * SECTOR;
                            continue;
                        }
                        pos += len;
                        if let Some((e, is_dir)) = parsed {
                            if is_dir {
                                self.dir_queue.push_back(DirRef {
                                    path: e.name.clone(),
                                    extent: e.offset / SECTOR as u64,
                                    size: get_dir_size(&e),
                                });
                            }
                            self.entries.push(e);
                        }
                    }
                    match self.dir_queue.pop_front() {
                        Some(d) => {
                            let off = d.extent * SECTOR as u64;
                            self.cur_dir = Some(d);
                            return Ok(ReadEvent::Seek(off));
                        }
                        None => {
                            self.state = RState::Ready;
                            return Ok(ReadEvent::Done);
                        }
                    }
                }

                RState::Ready => return Ok(ReadEvent::Done),

                RState::FileData => {
                    if self.data_left == 0 {
                        self.state = RState::MemberDone;
                        return Ok(ReadEvent::FileDone);
                    }
                    if input.is_empty() {
                        if eof {
                            return Err(Error::format("iso: truncated file extent"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    let take = (self.data_left as usize).min(input.len());
                    output.extend_from_slice(&input[..take]);
                    *input = &input[take..];
                    self.data_left -= take as u64;
                    return Ok(ReadEvent::Data);
                }

                RState::MemberDone => return Ok(ReadEvent::FileDone),
            }
        }
    }
}

// Directory sizes travel inside the record; stash the extent size in the
// compressed_size field which is otherwise meaningless for directories.
fn get_dir_size(e: &ArcEntry) -> u64 {
    e.compressed_size
}

struct WDir {
    path: String,
    parent: usize,
    children_dirs: Vec<usize>,
    children_files: Vec<usize>,
    extent: u64,
    size: u64,
    mtime: SystemTime,
}

struct WFile {
    entry: ArcEntry,
    extent: u64,
}

/// ISO 9660 writer.  All entries are registered first; `prepare` computes
/// the volume layout, then the header and the file extents stream out in
/// order.
pub struct IsoWriter {
    volume_id: String,
    dirs: Vec<WDir>,
    files: Vec<WFile>,
    prepared: bool,
    cur_file: usize,
    written_cur: u64,
    total_sectors: u64,
    path_table_size: u64,
    lpath_extent: u64,
    mpath_extent: u64,
}

impl IsoWriter {
    pub fn new(volume_id: &str) -> Self {
        IsoWriter {
            volume_id: volume_id.to_uppercase(),
            dirs: vec![WDir {
                path: String::new(),
                parent: 0,
                children_dirs: Vec::new(),
                children_files: Vec::new(),
                extent: 0,
                size: 0,
                mtime: SystemTime::UNIX_EPOCH,
            }],
            files: Vec::new(),
            prepared: false,
            cur_file: 0,
            written_cur: 0,
            total_sectors: 0,
            path_table_size: 0,
            lpath_extent: 0,
            mpath_extent: 0,
        }
    }

    fn dir_index(&mut self, path: &str) -> usize {
        if path.is_empty() {
            return 0;
        }
        if let Some(i) = self.dirs.iter().position(|d| d.path == path) {
            return i;
        }
        let parent_path = match path.rfind('/') {
            Some(i) => &path[..i],
            None => "",
        };
        let parent = self.dir_index(parent_path);
        self.dirs.push(WDir {
            path: path.to_string(),
            parent,
            children_dirs: Vec::new(),
            children_files: Vec::new(),
            extent: 0,
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
        });
        let idx = self.dirs.len() - 1;
        self.dirs[parent].children_dirs.push(idx);
        idx
    }

    pub fn add(&mut self, e: &ArcEntry) -> Result<()> {
        if self.prepared {
            return Err(Error::internal("iso: add after prepare"));
        }
        match e.kind {
            EntryKind::Dir => {
                let di = self.dir_index(&e.name);
                self.dirs[di].mtime = e.mtime;
            }
            EntryKind::Regular => {
                let parent_path = match e.name.rfind('/') {
                    Some(i) => e.name[..i].to_string(),
                    None => String::new(),
                };
                let parent = self.dir_index(&parent_path);
                self.files.push(WFile {
                    entry: e.clone(),
                    extent: 0,
                });
                let idx = self.files.len() - 1;
                self.dirs[parent].children_files.push(idx);
            }
            _ => {
                return Err(Error::format(format!(
                    "iso: '{}': links cannot be stored",
                    e.name
                )))
            }
        }
        Ok(())
    }

    fn base_name(path: &str) -> &str {
        match path.rfind('/') {
            Some(i) => &path[i + 1..],
            None => path,
        }
    }

    fn record_len(name: &str) -> usize {
        let n = 33 + name.len();
        n + n % 2
    }

    /// Size of one directory extent in bytes (sector aligned).
    fn dir_extent_size(&self, di: usize) -> u64 {
        let d = &self.dirs[di];
        let mut size = 34 + 34; // self + parent
        for &c in &d.children_dirs {
            size += Self::record_len(Self::base_name(&self.dirs[c].path));
        }
        for &f in &d.children_files {
            let name = format!("{};1", Self::base_name(&self.files[f].entry.name));
            size += Self::record_len(&name);
        }
        (size as u64).next_multiple_of(SECTOR as u64)
    }

    /// Assign extents: path tables first, then directories, then files.
    pub fn prepare(&mut self) -> Result<()> {
        self.prepared = true;

        // path table records, directories in tree order
        let mut pt_size = 0u64;
        for d in &self.dirs {
            let name = if d.path.is_empty() {
                "\0".to_string()
            } else {
                Self::base_name(&d.path).to_string()
            };
            let n = 8 + name.len();
            pt_size += (n + n % 2) as u64;
        }
        self.path_table_size = pt_size;
        let pt_sectors = pt_size.next_multiple_of(SECTOR as u64) / SECTOR as u64;

        let mut next = PVD_SECTOR + 2; // PVD + set terminator
        self.lpath_extent = next;
        next += pt_sectors;
        self.mpath_extent = next;
        next += pt_sectors;

        for di in 0..self.dirs.len() {
            let size = self.dir_extent_size(di);
            self.dirs[di].extent = next;
            self.dirs[di].size = size;
            next += size / SECTOR as u64;
        }
        for fi in 0..self.files.len() {
            self.files[fi].extent = next;
            next += self.files[fi].entry.size.next_multiple_of(SECTOR as u64) / SECTOR as u64;
        }
        self.total_sectors = next;
        debug!(
            "iso: {} directories, {} files, {} sectors",
            self.dirs.len(),
            self.files.len(),
            next
        );
        Ok(())
    }

    fn put_record(
        out: &mut Vec<u8>,
        name: &[u8],
        extent: u64,
        size: u64,
        mtime: SystemTime,
        is_dir: bool,
    ) {
        let len = {
            let n = 33 + name.len();
            n + n % 2
        };
        let start = out.len();
        out.resize(start + len, 0);
        let r = &mut out[start..];
        r[0] = len as u8;
        r[2..10].copy_from_slice(&u32_both(extent as u32));
        r[10..18].copy_from_slice(&u32_both(size as u32));
        r[18..25].copy_from_slice(&rec_datetime(mtime));
        r[25] = if is_dir { FLAG_DIR } else { 0 };
        r[28..32].copy_from_slice(&u16_both(1)); // volume sequence number
        r[32] = name.len() as u8;
        r[33..33 + name.len()].copy_from_slice(name);
    }

    fn pad_sector(out: &mut Vec<u8>) {
        let pad = out.len().next_multiple_of(SECTOR) - out.len();
        out.extend(std::iter::repeat(0).take(pad));
    }

    /// Emit everything up to the first file extent: system area, volume
    /// descriptors, path tables and directory extents.
    pub fn header(&mut self, output: &mut Vec<u8>) -> Result<()> {
        if !self.prepared {
            return Err(Error::internal("iso: header before prepare"));
        }
        let now = SystemTime::now();

        // system area
        output.extend(std::iter::repeat(0).take(16 * SECTOR));

        // primary volume descriptor
        let mut pvd = vec![0u8; SECTOR];
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        pvd[6] = 1;
        fill_padded(&mut pvd[8..40], b"");
        fill_padded(&mut pvd[40..72], self.volume_id.as_bytes());
        pvd[80..88].copy_from_slice(&u32_both(self.total_sectors as u32));
        pvd[120..124].copy_from_slice(&u16_both(1));
        pvd[124..128].copy_from_slice(&u16_both(1));
        pvd[128..132].copy_from_slice(&u16_both(SECTOR as u16));
        pvd[132..140].copy_from_slice(&u32_both(self.path_table_size as u32));
        pvd[140..144].copy_from_slice(&(self.lpath_extent as u32).to_le_bytes());
        pvd[148..152].copy_from_slice(&(self.mpath_extent as u32).to_be_bytes());
        {
            let mut root = Vec::new();
            Self::put_record(
                &mut root,
                &[0],
                self.dirs[0].extent,
                self.dirs[0].size,
                now,
                true,
            );
            pvd[156..156 + 34].copy_from_slice(&root[..34]);
        }
        fill_padded(&mut pvd[190..318], b""); // volume set id
        pvd[881] = 1; // file structure version
        output.extend_from_slice(&pvd);

        // volume descriptor set terminator
        let mut term = vec![0u8; SECTOR];
        term[0] = 255;
        term[1..6].copy_from_slice(b"CD001");
        term[6] = 1;
        output.extend_from_slice(&term);

        // path tables
        for big_endian in [false, true] {
            for d in &self.dirs {
                let name: &[u8] = if d.path.is_empty() {
                    &[0]
                } else {
                    Self::base_name(&d.path).as_bytes()
                };
                let mut rec = Vec::with_capacity(8 + name.len() + 1);
                rec.push(name.len() as u8);
                rec.push(0);
                if big_endian {
                    rec.extend_from_slice(&(d.extent as u32).to_be_bytes());
                    rec.extend_from_slice(&(d.parent as u16 + 1).to_be_bytes());
                } else {
                    rec.extend_from_slice(&(d.extent as u32).to_le_bytes());
                    rec.extend_from_slice(&(d.parent as u16 + 1).to_le_bytes());
                }
                rec.extend_from_slice(name);
                if rec.len() % 2 != 0 {
                    rec.push(0);
                }
                output.extend_from_slice(&rec);
            }
            Self::pad_sector(output);
        }

        // directory extents
        for di in 0..self.dirs.len() {
            let start = output.len();
            let d = &self.dirs[di];
            let parent = &self.dirs[d.parent];
            let mut ext = Vec::new();
            Self::put_record(&mut ext, &[0], d.extent, d.size, now, true);
            Self::put_record(&mut ext, &[1], parent.extent, parent.size, now, true);
            for &c in &d.children_dirs {
                let cd = &self.dirs[c];
                Self::put_record(
                    &mut ext,
                    Self::base_name(&cd.path).as_bytes(),
                    cd.extent,
                    cd.size,
                    cd.mtime,
                    true,
                );
            }
            for &f in &d.children_files {
                let wf = &self.files[f];
                let name = format!("{};1", Self::base_name(&wf.entry.name));
                Self::put_record(
                    &mut ext,
                    name.as_bytes(),
                    wf.extent,
                    wf.entry.size,
                    wf.entry.mtime,
                    false,
                );
            }
            output.extend_from_slice(&ext);
            let used = output.len() - start;
            let pad = d.size as usize - used;
            output.extend(std::iter::repeat(0).take(pad));
        }
        Ok(())
    }

    /// Files must be streamed in registration order.
    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.entry.name.clone()).collect()
    }

    pub fn data(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let e = &self.files[self.cur_file].entry;
        if self.written_cur + input.len() as u64 > e.size {
            return Err(Error::format("iso: more data than the registered size"));
        }
        self.written_cur += input.len() as u64;
        output.extend_from_slice(input);
        Ok(())
    }

    pub fn file_done(&mut self, output: &mut Vec<u8>) -> Result<()> {
        let e = &self.files[self.cur_file].entry;
        if self.written_cur != e.size {
            return Err(Error::format("iso: less data than the registered size"));
        }
        Self::pad_sector(output);
        self.cur_file += 1;
        self.written_cur = 0;
        Ok(())
    }
}

fn fill_padded(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    for b in dst[n..].iter_mut() {
        *b = b' ';
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn build() -> Vec<u8> {
        let mut w = IsoWriter::new("TEST");
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        w.add(&ArcEntry {
            name: "docs".into(),
            kind: EntryKind::Dir,
            mtime: t,
            ..ArcEntry::default()
        })
        .unwrap();
        w.add(&ArcEntry {
            name: "docs/readme.txt".into(),
            size: 11,
            kind: EntryKind::Regular,
            mtime: t,
            ..ArcEntry::default()
        })
        .unwrap();
        w.add(&ArcEntry {
            name: "top.bin".into(),
            size: 3000,
            kind: EntryKind::Regular,
            mtime: t,
            ..ArcEntry::default()
        })
        .unwrap();
        w.prepare().unwrap();
        let mut out = Vec::new();
        w.header(&mut out).unwrap();
        w.data(b"hello there", &mut out).unwrap();
        w.file_done(&mut out).unwrap();
        w.data(&[7u8; 3000], &mut out).unwrap();
        w.file_done(&mut out).unwrap();
        out
    }

    fn drive_headers(r: &mut IsoReader, img: &[u8]) {
        let mut pos: Option<usize> = None;
        loop {
            let mut chunk: &[u8] = match pos {
                Some(p) => &img[p..],
                None => &[],
            };
            let mut o = Vec::new();
            match r.process(&mut chunk, &mut o, true).unwrap() {
                ReadEvent::Seek(off) => pos = Some(off as usize),
                ReadEvent::Done => break,
                e => panic!("unexpected: {:?}", e),
            }
        }
    }

    #[test]
    fn test_iso_roundtrip() {
        let img = build();
        assert_eq!(0, img.len() % SECTOR);
        let mut r = IsoReader::new();
        drive_headers(&mut r, &img);

        let names: Vec<&str> = r.entries().iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"docs"));
        assert!(names.contains(&"docs/readme.txt"));
        assert!(names.contains(&"top.bin"));

        let idx = r
            .entries()
            .iter()
            .position(|e| e.name == "docs/readme.txt")
            .unwrap();
        let off = r.begin_member(idx).unwrap() as usize;
        let mut input = &img[off..];
        let mut data = Vec::new();
        loop {
            let mut o = Vec::new();
            match r.process(&mut input, &mut o, true).unwrap() {
                ReadEvent::Data => data.extend_from_slice(&o),
                ReadEvent::FileDone => break,
                e => panic!("unexpected: {:?}", e),
            }
        }
        assert_eq!(b"hello there".to_vec(), data);
    }

    #[test]
    fn test_iso_bad_descriptor_rejected() {
        let mut img = build();
        img[16 * SECTOR + 1] = b'X';
        let mut r = IsoReader::new();
        let mut input = &img[..0];
        let mut o = Vec::new();
        assert!(matches!(
            r.process(&mut input, &mut o, true).unwrap(),
            ReadEvent::Seek(_)
        ));
        let mut input = &img[16 * SECTOR..];
        assert!(r.process(&mut input, &mut o, true).is_err());
    }
}
