/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! ZIP reader/writer.  The reader is driven by the central directory and
//! `Seek` events; the writer streams local headers with data descriptors
//! and places the central directory at finish.  Methods: store, deflate,
//! zstd (93).

use std::time::SystemTime;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::{debug, warn};
use zstd::stream::raw::{InBuffer, Operation, OutBuffer};

use crate::arc::{get_u16le, get_u32le, ArcEntry, EntryKind, ReadEvent};
use crate::core::error::{Error, Result};

const LFH_SIG: u32 = 0x04034b50;
const CFH_SIG: u32 = 0x02014b50;
const EOCD_SIG: u32 = 0x06054b50;
const DD_SIG: u32 = 0x08074b50;

pub const METHOD_STORE: u16 = 0;
pub const METHOD_DEFLATE: u16 = 8;
pub const METHOD_ZSTD: u16 = 93;

/// General-purpose flag bits.
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const FLAG_UTF8: u16 = 1 << 11;

const EOCD_MIN: usize = 22;
/// EOCD + maximum comment length.
const EOCD_MAX: u64 = 22 + 65535;
const TAIL_FIRST: u64 = 1024;

const OUT_CHUNK: usize = 64 * 1024;

fn dos_datetime(t: SystemTime) -> (u16, u16) {
    let dt: DateTime<Utc> = t.into();
    let year = dt.year().clamp(1980, 2107) as u16;
    let date = (year - 1980) << 9 | (dt.month() as u16) << 5 | dt.day() as u16;
    let time = (dt.hour() as u16) << 11 | (dt.minute() as u16) << 5 | (dt.second() as u16 / 2);
    (date, time)
}

fn systime_from_dos(date: u16, time: u16) -> SystemTime {
    let y = 1980 + (date >> 9) as i32;
    let mo = (date >> 5 & 0x0f) as u32;
    let d = (date & 0x1f) as u32;
    let h = (time >> 11) as u32;
    let mi = (time >> 5 & 0x3f) as u32;
    let s = ((time & 0x1f) * 2) as u32;
    match Utc.with_ymd_and_hms(y, mo.max(1), d.max(1), h, mi, s).single() {
        Some(dt) => dt.into(),
        None => SystemTime::UNIX_EPOCH,
    }
}

/// One central-directory record.
pub struct ZipEntry {
    pub meta: ArcEntry,
    pub method: u16,
    pub crc: u32,
    local_header_off: u64,
}

enum Decomp {
    Store,
    Deflate(Box<Decompress>),
    Zstd(zstd::stream::raw::Decoder<'static>),
}

enum RState {
    Start,
    Eocd { tail: u64 },
    CentralDir { size: u64 },
    HeadersDone,
    LocalHeader,
    Data,
    MemberDone,
}

/// Central-directory-driven .zip reader.
pub struct ZipReader {
    total_size: u64,
    state: RState,
    buf: Vec<u8>,
    entries: Vec<ZipEntry>,
    cur: usize,
    decomp: Decomp,
    comp_left: u64,
    crc: crc32fast::Hasher,
    scratch: Vec<u8>,
}

impl ZipReader {
    pub fn new(total_size: u64) -> Self {
        ZipReader {
            total_size,
            state: RState::Start,
            buf: Vec::new(),
            entries: Vec::new(),
            cur: 0,
            decomp: Decomp::Store,
            comp_left: 0,
            crc: crc32fast::Hasher::new(),
            scratch: vec![0; OUT_CHUNK],
        }
    }

    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    pub fn headers_done(&self) -> bool {
        matches!(self.state, RState::HeadersDone)
    }

    /// Entry metadata of the member being extracted.
    pub fn entry(&self) -> &ArcEntry {
        &self.entries[self.cur].meta
    }

    /// Start extracting entry `idx`; returns the archive offset the driver
    /// must continue reading from.
    pub fn begin_member(&mut self, idx: usize) -> u64 {
        self.cur = idx;
        self.buf.clear();
        self.state = RState::LocalHeader;
        self.entries[idx].local_header_off
    }

    fn parse_central_dir(&mut self, data: &[u8]) -> Result<()> {
        let mut pos = 0usize;
        while pos + 46 <= data.len() {
            let b = &data[pos..];
            if get_u32le(b) != CFH_SIG {
                break;
            }
            let flags = get_u16le(&b[8..]);
            let method = get_u16le(&b[10..]);
            let time = get_u16le(&b[12..]);
            let date = get_u16le(&b[14..]);
            let crc = get_u32le(&b[16..]);
            let csize = get_u32le(&b[20..]) as u64;
            let usize_ = get_u32le(&b[24..]) as u64;
            let nlen = get_u16le(&b[28..]) as usize;
            let elen = get_u16le(&b[30..]) as usize;
            let clen = get_u16le(&b[32..]) as usize;
            let eattr = get_u32le(&b[38..]);
            let lho = get_u32le(&b[42..]) as u64;
            if pos + 46 + nlen > data.len() {
                return Err(Error::format("zip: truncated central directory"));
            }
            let name_raw = &b[46..46 + nlen];
            let name = if flags & FLAG_UTF8 != 0 {
                String::from_utf8_lossy(name_raw).into_owned()
            } else {
                // single-byte code page; map bytes directly
                name_raw.iter().map(|&c| c as char).collect()
            };
            let is_dir = name.ends_with('/') || eattr & 0x10 != 0;
            let unix_attr = eattr >> 16;
            self.entries.push(ZipEntry {
                meta: ArcEntry {
                    name: name.trim_end_matches('/').to_string(),
                    size: usize_,
                    compressed_size: csize,
                    mtime: systime_from_dos(date, time),
                    unix_attr,
                    win_attr: eattr & 0xff,
                    kind: if is_dir { EntryKind::Dir } else { EntryKind::Regular },
                    link_target: String::new(),
                    offset: lho,
                },
                method,
                crc,
                local_header_off: lho,
            });
            pos += 46 + nlen + elen + clen;
        }
        debug!("zip: {} central directory entries", self.entries.len());
        Ok(())
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
                    let tail = self.total_size.min(TAIL_FIRST);
                    self.state = RState::Eocd { tail };
                    self.buf.clear();
                    return Ok(ReadEvent::Seek(self.total_size - tail));
                }

                RState::Eocd { tail } => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    if !eof && (self.buf.len() as u64) < tail {
                        return Ok(ReadEvent::More);
                    }
                    // scan backward for the EOCD signature
                    let b = &self.buf;
                    let mut found = None;
                    if b.len() >= EOCD_MIN {
                        for i in (0..=b.len() - EOCD_MIN).rev() {
                            if get_u32le(&b[i..]) == EOCD_SIG {
                                found = Some(i);
                                break;
                            }
                        }
                    }
                    let Some(at) = found else {
                        let max_tail = self.total_size.min(EOCD_MAX);
                        if tail < max_tail {
                            self.buf.clear();
                            self.state = RState::Eocd { tail: max_tail };
                            return Ok(ReadEvent::Seek(self.total_size - max_tail));
                        }
                        return Err(Error::format("zip: end of central directory not found"));
                    };
                    let eocd = &self.buf[at..];
                    let cd_size = get_u32le(&eocd[12..]) as u64;
                    let cd_off = get_u32le(&eocd[16..]) as u64;
                    self.buf.clear();
                    self.state = RState::CentralDir { size: cd_size };
                    return Ok(ReadEvent::Seek(cd_off));
                }

                RState::CentralDir { size } => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    if (self.buf.len() as u64) < size {
                        if eof {
                            return Err(Error::format("zip: truncated central directory"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    let data = std::mem::take(&mut self.buf);
                    self.parse_central_dir(&data[..size as usize])?;
                    self.state = RState::HeadersDone;
                    return Ok(ReadEvent::Done);
                }

                RState::HeadersDone => return Ok(ReadEvent::Done),

                RState::LocalHeader => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    if self.buf.len() < 30 {
                        if eof {
                            return Err(Error::format("zip: truncated local header"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    if get_u32le(&self.buf) != LFH_SIG {
                        return Err(Error::format("zip: bad local header"));
                    }
                    let nlen = get_u16le(&self.buf[26..]) as usize;
                    let elen = get_u16le(&self.buf[28..]) as usize;
                    if self.buf.len() < 30 + nlen + elen {
                        if eof {
                            return Err(Error::format("zip: truncated local header"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    self.buf.drain(..30 + nlen + elen);

                    let e = &self.entries[self.cur];
                    self.comp_left = e.meta.compressed_size;
                    self.crc = crc32fast::Hasher::new();
                    self.decomp = match e.method {
                        METHOD_STORE => Decomp::Store,
                        METHOD_DEFLATE => Decomp::Deflate(Box::new(Decompress::new(false))),
                        METHOD_ZSTD => Decomp::Zstd(
                            zstd::stream::raw::Decoder::new()
                                .map_err(|e| Error::format(format!("zstd: {}", e)))?,
                        ),
                        m => {
                            return Err(Error::format(format!(
                                "zip: '{}': unsupported method {}",
                                e.meta.name, m
                            )))
                        }
                    };
                    self.state = RState::Data;
                    debug!("zip: extracting '{}'", e.meta.name);
                    return Ok(ReadEvent::FileHeader);
                }

                RState::Data => {
                    if self.comp_left == 0 {
                        let want = self.entries[self.cur].crc;
                        let got = self.crc.clone().finalize();
                        if want != got && self.entries[self.cur].meta.kind == EntryKind::Regular {
                            return Err(Error::format(format!(
                                "zip: '{}': CRC mismatch",
                                self.entries[self.cur].meta.name
                            )));
                        }
                        self.state = RState::MemberDone;
                        return Ok(ReadEvent::FileDone);
                    }
                    // consume buffered local-header remainder first
                    let from_buf = !self.buf.is_empty();
                    let avail: &[u8] = if from_buf { &self.buf } else { *input };
                    if avail.is_empty() {
                        if eof {
                            return Err(Error::format("zip: truncated member data"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    let take = (self.comp_left as usize).min(avail.len());
                    let chunk = &avail[..take];

                    let before = output.len();
                    let consumed = match &mut self.decomp {
                        Decomp::Store => {
                            output.extend_from_slice(chunk);
                            take
                        }
                        Decomp::Deflate(d) => {
                            let bi = d.total_in();
                            output.reserve(OUT_CHUNK);
                            d.decompress_vec(chunk, output, FlushDecompress::None)
                                .map_err(|e| Error::format(format!("zip deflate: {}", e)))?;
                            (d.total_in() - bi) as usize
                        }
                        Decomp::Zstd(z) => {
                            let mut inb = InBuffer::around(chunk);
                            let mut outb = OutBuffer::around(&mut self.scratch[..]);
                            z.run(&mut inb, &mut outb)
                                .map_err(|e| Error::format(format!("zip zstd: {}", e)))?;
                            let p = outb.pos();
                            let c = inb.pos();
                            output.extend_from_slice(&self.scratch[..p]);
                            c
                        }
                    };
                    self.crc.update(&output[before..]);
                    self.comp_left -= consumed as u64;
                    if from_buf {
                        self.buf.drain(..consumed);
                    } else {
                        *input = &input[consumed..];
                    }
                    if output.len() > before {
                        return Ok(ReadEvent::Data);
                    }
                }

                RState::MemberDone => return Ok(ReadEvent::FileDone),
            }
        }
    }
}

enum Comp {
    Store,
    Deflate(Box<Compress>),
    Zstd(zstd::stream::raw::Encoder<'static>),
}

/// Streaming .zip writer: local headers with data descriptors, central
/// directory at the end.
pub struct ZipWriter {
    method: u16,
    level: u32,
    workers: u32,
    written: u64,
    cd: Vec<u8>,
    count: u16,
    // per-member state
    comp: Comp,
    crc: crc32fast::Hasher,
    usize_cur: u64,
    csize_cur: u64,
    lho: u64,
    cur: Option<ArcEntry>,
    scratch: Vec<u8>,
}

impl ZipWriter {
    pub fn new(method: u16, level: u32, workers: u32) -> Self {
        ZipWriter {
            method,
            level,
            workers,
            written: 0,
            cd: Vec::new(),
            count: 0,
            comp: Comp::Store,
            crc: crc32fast::Hasher::new(),
            usize_cur: 0,
            csize_cur: 0,
            lho: 0,
            cur: None,
            scratch: vec![0; OUT_CHUNK],
        }
    }

    fn emit(&mut self, output: &mut Vec<u8>, data: &[u8]) {
        output.extend_from_slice(data);
        self.written += data.len() as u64;
    }

    pub fn add(&mut self, e: &ArcEntry, output: &mut Vec<u8>) -> Result<()> {
        let method = if e.kind == EntryKind::Dir {
            METHOD_STORE
        } else {
            self.method
        };
        self.comp = match method {
            METHOD_STORE => Comp::Store,
            METHOD_DEFLATE => Comp::Deflate(Box::new(Compress::new(
                Compression::new(self.level.clamp(1, 9)),
                false,
            ))),
            METHOD_ZSTD => {
                let mut enc = zstd::stream::raw::Encoder::new(self.level as i32)
                    .map_err(|er| Error::format(format!("zstd: {}", er)))?;
                if self.workers > 0 {
                    let _ = enc.set_parameter(zstd::stream::raw::CParameter::NbWorkers(
                        self.workers,
                    ));
                }
                Comp::Zstd(enc)
            }
            m => return Err(Error::format(format!("zip: unsupported method {}", m))),
        };
        self.crc = crc32fast::Hasher::new();
        self.usize_cur = 0;
        self.csize_cur = 0;
        self.lho = self.written;

        let mut name = e.name.clone();
        if e.kind == EntryKind::Dir && !name.ends_with('/') {
            name.push('/');
        }
        let (date, time) = dos_datetime(e.mtime);
        let flags = FLAG_DATA_DESCRIPTOR | FLAG_UTF8;

        let mut h = Vec::with_capacity(30 + name.len());
        h.extend_from_slice(&LFH_SIG.to_le_bytes());
        h.extend_from_slice(&[20, 0]); // version needed
        h.extend_from_slice(&flags.to_le_bytes());
        h.extend_from_slice(&method.to_le_bytes());
        h.extend_from_slice(&time.to_le_bytes());
        h.extend_from_slice(&date.to_le_bytes());
        h.extend_from_slice(&[0; 12]); // crc/csize/usize in the descriptor
        h.extend_from_slice(&(name.len() as u16).to_le_bytes());
        h.extend_from_slice(&[0, 0]); // extra length
        h.extend_from_slice(name.as_bytes());
        self.emit(output, &h);

        let mut cur = e.clone();
        cur.name = name;
        self.cur = Some(cur);
        debug!("zip: added header '{}'", e.name);
        Ok(())
    }

    pub fn data(&mut self, mut input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        self.crc.update(input);
        self.usize_cur += input.len() as u64;
        match &mut self.comp {
            Comp::Store => {
                self.csize_cur += input.len() as u64;
                self.written += input.len() as u64;
                output.extend_from_slice(input);
            }
            Comp::Deflate(d) => {
                while !input.is_empty() {
                    let bi = d.total_in();
                    let bl = output.len();
                    output.reserve(OUT_CHUNK);
                    d.compress_vec(input, output, FlushCompress::None)
                        .map_err(|e| Error::format(format!("zip deflate: {}", e)))?;
                    let consumed = (d.total_in() - bi) as usize;
                    input = &input[consumed..];
                    let produced = (output.len() - bl) as u64;
                    self.csize_cur += produced;
                    self.written += produced;
                }
            }
            Comp::Zstd(z) => {
                while !input.is_empty() {
                    let mut inb = InBuffer::around(input);
                    let mut outb = OutBuffer::around(&mut self.scratch[..]);
                    z.run(&mut inb, &mut outb)
                        .map_err(|e| Error::format(format!("zip zstd: {}", e)))?;
                    let c = inb.pos();
                    let p = outb.pos();
                    input = &input[c..];
                    self.csize_cur += p as u64;
                    self.written += p as u64;
                    output.extend_from_slice(&self.scratch[..p]);
                }
            }
        }
        Ok(())
    }

    /// Flush the member's compressor, write the data descriptor and record
    /// the central-directory entry.
    pub fn file_done(&mut self, output: &mut Vec<u8>) -> Result<()> {
        match &mut self.comp {
            Comp::Store => {}
            Comp::Deflate(d) => loop {
                let bl = output.len();
                output.reserve(OUT_CHUNK);
                let status = d
                    .compress_vec(&[], output, FlushCompress::Finish)
                    .map_err(|e| Error::format(format!("zip deflate: {}", e)))?;
                let produced = (output.len() - bl) as u64;
                self.csize_cur += produced;
                self.written += produced;
                if status == Status::StreamEnd {
                    break;
                }
            },
            Comp::Zstd(z) => loop {
                let mut outb = OutBuffer::around(&mut self.scratch[..]);
                let left = z
                    .finish(&mut outb, true)
                    .map_err(|e| Error::format(format!("zip zstd: {}", e)))?;
                let p = outb.pos();
                self.csize_cur += p as u64;
                self.written += p as u64;
                output.extend_from_slice(&self.scratch[..p]);
                if left == 0 {
                    break;
                }
            },
        }

        let e = self
            .cur
            .take()
            .ok_or_else(|| Error::internal("zip: file_done without add"))?;
        let crc = self.crc.clone().finalize();

        let mut dd = Vec::with_capacity(16);
        dd.extend_from_slice(&DD_SIG.to_le_bytes());
        dd.extend_from_slice(&crc.to_le_bytes());
        dd.extend_from_slice(&(self.csize_cur as u32).to_le_bytes());
        dd.extend_from_slice(&(self.usize_cur as u32).to_le_bytes());
        self.emit(output, &dd);

        let method = if e.kind == EntryKind::Dir {
            METHOD_STORE
        } else {
            self.method
        };
        let (date, time) = dos_datetime(e.mtime);
        let flags = FLAG_DATA_DESCRIPTOR | FLAG_UTF8;
        let eattr: u32 = (e.unix_attr << 16) | if e.kind == EntryKind::Dir { 0x10 } else { 0 };

        let cd = &mut self.cd;
        cd.extend_from_slice(&CFH_SIG.to_le_bytes());
        cd.extend_from_slice(&[30, 3]); // made by: unix, 3.0
        cd.extend_from_slice(&[20, 0]); // version needed
        cd.extend_from_slice(&flags.to_le_bytes());
        cd.extend_from_slice(&method.to_le_bytes());
        cd.extend_from_slice(&time.to_le_bytes());
        cd.extend_from_slice(&date.to_le_bytes());
        cd.extend_from_slice(&crc.to_le_bytes());
        cd.extend_from_slice(&(self.csize_cur as u32).to_le_bytes());
        cd.extend_from_slice(&(self.usize_cur as u32).to_le_bytes());
        cd.extend_from_slice(&(e.name.len() as u16).to_le_bytes());
        cd.extend_from_slice(&[0; 8]); // extra/comment len, disk, internal attr
        cd.extend_from_slice(&eattr.to_le_bytes());
        cd.extend_from_slice(&(self.lho as u32).to_le_bytes());
        cd.extend_from_slice(e.name.as_bytes());
        self.count += 1;
        Ok(())
    }

    /// Central directory plus end-of-central-directory record.
    pub fn finish(&mut self, output: &mut Vec<u8>) {
        let cd_off = self.written;
        let cd = std::mem::take(&mut self.cd);
        self.emit(output, &cd);

        let mut eocd = Vec::with_capacity(EOCD_MIN);
        eocd.extend_from_slice(&EOCD_SIG.to_le_bytes());
        eocd.extend_from_slice(&[0; 4]); // disk numbers
        eocd.extend_from_slice(&self.count.to_le_bytes());
        eocd.extend_from_slice(&self.count.to_le_bytes());
        eocd.extend_from_slice(&(cd.len() as u32).to_le_bytes());
        eocd.extend_from_slice(&(cd_off as u32).to_le_bytes());
        eocd.extend_from_slice(&[0, 0]); // comment length
        self.emit(output, &eocd);
        if self.written > u32::MAX as u64 {
            warn!("zip: archive exceeds 4 GiB, offsets are truncated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn build(method: u16, files: &[(&str, EntryKind, &[u8])]) -> Vec<u8> {
        let mut w = ZipWriter::new(method, 6, 0);
        let mut arch = Vec::new();
        for (name, kind, data) in files {
            let e = ArcEntry {
                name: name.to_string(),
                size: data.len() as u64,
                kind: *kind,
                mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
                unix_attr: 0o100644,
                ..ArcEntry::default()
            };
            w.add(&e, &mut arch).unwrap();
            if !data.is_empty() {
                w.data(data, &mut arch).unwrap();
            }
            w.file_done(&mut arch).unwrap();
        }
        w.finish(&mut arch);
        arch
    }

    /// Drive the header phase: honour Seek events against the in-memory
    /// archive until the central directory is parsed.
    fn read_headers(r: &mut ZipReader, arch: &[u8]) {
        let mut pos: Option<usize> = None;
        loop {
            let mut chunk: &[u8] = match pos {
                Some(p) => &arch[p..],
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

    /// Emulates the driver: gathers headers, then extracts every entry.
    fn extract_all(arch: &[u8]) -> Vec<(String, EntryKind, Vec<u8>)> {
        let mut r = ZipReader::new(arch.len() as u64);
        let mut out = Vec::new();
        read_headers(&mut r, arch);
        let n = r.entries().len();
        for i in 0..n {
            let off = r.begin_member(i) as usize;
            let mut input = &arch[off..];
            let mut name = String::new();
            let mut kind = EntryKind::Regular;
            let mut data = Vec::new();
            loop {
                let mut o = Vec::new();
                match r.process(&mut input, &mut o, true).unwrap() {
                    ReadEvent::FileHeader => {
                        name = r.entry().name.clone();
                        kind = r.entry().kind;
                    }
                    ReadEvent::Data => data.extend_from_slice(&o),
                    ReadEvent::FileDone => break,
                    e => panic!("unexpected: {:?}", e),
                }
            }
            out.push((name, kind, data));
        }
        out
    }

    #[test]
    fn test_zip_roundtrip_deflate() {
        let arch = build(
            METHOD_DEFLATE,
            &[
                ("dir", EntryKind::Dir, b""),
                ("dir/a.txt", EntryKind::Regular, b"alpha alpha alpha"),
                ("b.bin", EntryKind::Regular, &[0u8; 3000]),
            ],
        );
        let got = extract_all(&arch);
        assert_eq!(3, got.len());
        assert_eq!(("dir".to_string(), EntryKind::Dir), (got[0].0.clone(), got[0].1));
        assert_eq!(b"alpha alpha alpha".to_vec(), got[1].2);
        assert_eq!(vec![0u8; 3000], got[2].2);
    }

    #[test]
    fn test_zip_roundtrip_store_and_zstd() {
        for method in [METHOD_STORE, METHOD_ZSTD] {
            let arch = build(method, &[("x", EntryKind::Regular, b"payload bytes")]);
            let got = extract_all(&arch);
            assert_eq!(b"payload bytes".to_vec(), got[0].2);
        }
    }

    #[test]
    fn test_zip_mtime_2s_granularity() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_001);
        let (date, time) = dos_datetime(t);
        let back = systime_from_dos(date, time);
        let diff = t.duration_since(back).unwrap();
        assert!(diff <= Duration::from_secs(2));
    }

    #[test]
    fn test_zip_corrupt_crc_detected() {
        let mut arch = build(METHOD_STORE, &[("x", EntryKind::Regular, b"payload")]);
        // flip a payload byte inside the stored member
        let at = arch.windows(7).position(|w| w == b"payload").unwrap();
        arch[at] ^= 0xff;
        let mut r = ZipReader::new(arch.len() as u64);
        read_headers(&mut r, &arch);
        let off = r.begin_member(0) as usize;
        let mut input = &arch[off..];
        let mut failed = false;
        loop {
            let mut o = Vec::new();
            match r.process(&mut input, &mut o, true) {
                Ok(ReadEvent::FileDone) => break,
                Ok(_) => continue,
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed);
    }
}
