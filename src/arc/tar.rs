/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! ustar reader/writer: 512-byte block framing, octal numeric fields,
//! GNU 'L' long-name extension.

use std::time::{Duration, SystemTime};

use log::{debug, warn};

use crate::arc::{ArcEntry, EntryKind, ReadEvent};
use crate::core::error::{Error, Result};

const BLOCK: usize = 512;
const NAME_LEN: usize = 100;
const MAGIC_OFF: usize = 257;

fn octal(field: &[u8]) -> Result<u64> {
    // base-256 (GNU) when the high bit of the first byte is set
    if field[0] & 0x80 != 0 {
        let mut v: u64 = (field[0] & 0x7f) as u64;
        for &b in &field[1..] {
            v = v << 8 | b as u64;
        }
        return Ok(v);
    }
    let s = field
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>();
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 8).map_err(|_| Error::format("tar: bad octal field"))
}

fn put_octal(dst: &mut [u8], v: u64) {
    let s = format!("{:0w$o}", v, w = dst.len() - 1);
    dst[..s.len()].copy_from_slice(s.as_bytes());
    dst[s.len()] = 0;
}

fn checksum(block: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in block.iter().enumerate() {
        sum += if (148..156).contains(&i) { 0x20 } else { b as u32 };
    }
    sum
}

enum RState {
    Header,
    LongName(u64),
    PaxSkip(u64),
    Data,
    Padding,
    Trailer,
    Done,
}

/// Streaming .tar reader.
pub struct TarReader {
    state: RState,
    buf: Vec<u8>,
    entry: ArcEntry,
    long_name: Option<String>,
    data_left: u64,
    pad: usize,
}

impl TarReader {
    pub fn new() -> Self {
        TarReader {
            state: RState::Header,
            buf: Vec::new(),
            entry: ArcEntry::default(),
            long_name: None,
            data_left: 0,
            pad: 0,
        }
    }

    pub fn entry(&self) -> &ArcEntry {
        &self.entry
    }

    /// Gather exactly `n` bytes across calls; returns false when starved.
    fn gather(&mut self, input: &mut &[u8], n: usize) -> bool {
        let need = n.saturating_sub(self.buf.len());
        let take = need.min(input.len());
        self.buf.extend_from_slice(&input[..take]);
        *input = &input[take..];
        self.buf.len() >= n
    }

    pub fn process(&mut self, input: &mut &[u8], output: &mut Vec<u8>) -> Result<ReadEvent> {
        loop {
            match &self.state {
                RState::Header => {
                    if !self.gather(input, BLOCK) {
                        return Ok(ReadEvent::More);
                    }
                    let block: Vec<u8> = std::mem::take(&mut self.buf);
                    if block.iter().all(|&b| b == 0) {
                        self.state = RState::Trailer;
                        continue;
                    }
                    if &block[MAGIC_OFF..MAGIC_OFF + 5] != b"ustar" {
                        return Err(Error::format("tar: bad magic"));
                    }
                    let sum = octal(&block[148..156])? as u32;
                    if sum != checksum(&block) {
                        return Err(Error::format("tar: header checksum mismatch"));
                    }

                    let size = octal(&block[124..136])?;
                    let typeflag = block[156];
                    match typeflag {
                        b'L' => {
                            self.state = RState::LongName(size);
                            continue;
                        }
                        b'x' | b'g' => {
                            // pax extended headers are not interpreted
                            self.state = RState::PaxSkip(size.next_multiple_of(BLOCK as u64));
                            continue;
                        }
                        _ => {}
                    }

                    let mut name = match self.long_name.take() {
                        Some(n) => n,
                        None => {
                            let prefix = str_field(&block[345..345 + 155]);
                            let base = str_field(&block[..NAME_LEN]);
                            if prefix.is_empty() {
                                base
                            } else {
                                format!("{}/{}", prefix, base)
                            }
                        }
                    };

                    let kind = match typeflag {
                        b'0' | 0 => EntryKind::Regular,
                        b'1' => EntryKind::Hardlink,
                        b'2' => EntryKind::Symlink,
                        b'5' => EntryKind::Dir,
                        other => {
                            warn!("tar: unsupported entry type '{}'", other as char);
                            EntryKind::Regular
                        }
                    };
                    if kind == EntryKind::Dir {
                        name = name.trim_end_matches('/').to_string();
                    }

                    self.entry = ArcEntry {
                        name,
                        size,
                        compressed_size: size,
                        mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(octal(&block[136..148])?),
                        unix_attr: octal(&block[100..108])? as u32,
                        kind,
                        link_target: str_field(&block[157..157 + NAME_LEN]),
                        ..ArcEntry::default()
                    };
                    self.data_left = if kind == EntryKind::Regular { size } else { 0 };
                    self.pad = (BLOCK as u64 - size % BLOCK as u64) as usize % BLOCK;
                    if kind != EntryKind::Regular {
                        self.pad = 0;
                    }
                    debug!("tar: file header '{}' ({})", self.entry.name, size);
                    self.state = RState::Data;
                    return Ok(ReadEvent::FileHeader);
                }

                RState::LongName(size) => {
                    let total = (*size as usize).next_multiple_of(BLOCK);
                    let size = *size as usize;
                    if !self.gather(input, total) {
                        return Ok(ReadEvent::More);
                    }
                    let block = std::mem::take(&mut self.buf);
                    let name = String::from_utf8_lossy(&block[..size])
                        .trim_end_matches('\0')
                        .to_string();
                    self.long_name = Some(name);
                    self.state = RState::Header;
                }

                RState::PaxSkip(left) => {
                    let left = *left;
                    let take = (left as usize).min(input.len());
                    *input = &input[take..];
                    let left = left - take as u64;
                    if left > 0 {
                        self.state = RState::PaxSkip(left);
                        return Ok(ReadEvent::More);
                    }
                    self.state = RState::Header;
                }

                RState::Data => {
                    if self.data_left == 0 {
                        self.state = RState::Padding;
                        return Ok(ReadEvent::FileDone);
                    }
                    if input.is_empty() {
                        return Ok(ReadEvent::More);
                    }
                    let take = (self.data_left as usize).min(input.len());
                    output.extend_from_slice(&input[..take]);
                    *input = &input[take..];
                    self.data_left -= take as u64;
                    return Ok(ReadEvent::Data);
                }

                RState::Padding => {
                    let take = self.pad.min(input.len());
                    *input = &input[take..];
                    self.pad -= take;
                    if self.pad > 0 {
                        return Ok(ReadEvent::More);
                    }
                    self.state = RState::Header;
                }

                RState::Trailer => {
                    // second zero block plus any tool-appended padding
                    self.state = RState::Done;
                    return Ok(ReadEvent::Done);
                }

                RState::Done => return Ok(ReadEvent::Done),
            }
        }
    }
}

/// Streaming .tar writer.
pub struct TarWriter {
    written_cur: u64,
    cur_size: u64,
}

impl TarWriter {
    pub fn new() -> Self {
        TarWriter {
            written_cur: 0,
            cur_size: 0,
        }
    }

    /// Emit the header block(s) for the next member.
    pub fn add(&mut self, e: &ArcEntry, output: &mut Vec<u8>) -> Result<()> {
        if e.name.len() > NAME_LEN {
            // GNU long-name record carrying the full path as data
            let mut le = ArcEntry {
                name: "././@LongLink".to_string(),
                size: e.name.len() as u64 + 1,
                kind: EntryKind::Regular,
                ..ArcEntry::default()
            };
            Self::put_header(&mut le, b'L', output)?;
            output.extend_from_slice(e.name.as_bytes());
            output.push(0);
            let pad = output.len().next_multiple_of(BLOCK) - output.len();
            output.extend(std::iter::repeat(0).take(pad));
        }

        let typeflag = match e.kind {
            EntryKind::Regular => b'0',
            EntryKind::Hardlink => b'1',
            EntryKind::Symlink => b'2',
            EntryKind::Dir => b'5',
        };
        let mut e2 = e.clone();
        if e2.kind != EntryKind::Regular {
            e2.size = 0;
        }
        Self::put_header(&mut e2, typeflag, output)?;
        self.cur_size = e2.size;
        self.written_cur = 0;
        debug!("tar: added header '{}' ({})", e.name, e2.size);
        Ok(())
    }

    fn put_header(e: &mut ArcEntry, typeflag: u8, output: &mut Vec<u8>) -> Result<()> {
        let mut h = [0u8; BLOCK];
        let mut name = e.name.clone();
        if e.kind == EntryKind::Dir && !name.ends_with('/') {
            name.push('/');
        }
        let stored = if name.len() <= NAME_LEN {
            name.as_bytes()
        } else {
            &name.as_bytes()[..NAME_LEN]
        };
        h[..stored.len()].copy_from_slice(stored);
        put_octal(&mut h[100..108], (e.unix_attr & 0o7777) as u64);
        put_octal(&mut h[108..116], 0); // uid
        put_octal(&mut h[116..124], 0); // gid
        put_octal(&mut h[124..136], e.size);
        let mtime = e
            .mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        put_octal(&mut h[136..148], mtime);
        h[156] = typeflag;
        let lt = e.link_target.as_bytes();
        if !lt.is_empty() {
            if lt.len() > NAME_LEN {
                return Err(Error::format("tar: link target too long"));
            }
            h[157..157 + lt.len()].copy_from_slice(lt);
        }
        h[MAGIC_OFF..MAGIC_OFF + 6].copy_from_slice(b"ustar\0");
        h[263..265].copy_from_slice(b"00");
        let sum = checksum(&h);
        let s = format!("{:06o}", sum);
        h[148..154].copy_from_slice(s.as_bytes());
        h[154] = 0;
        h[155] = b' ';
        output.extend_from_slice(&h);
        Ok(())
    }

    /// Append member data; the caller feeds exactly the announced size.
    pub fn data(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        if self.written_cur + input.len() as u64 > self.cur_size {
            return Err(Error::format("tar: more data than announced in header"));
        }
        self.written_cur += input.len() as u64;
        output.extend_from_slice(input);
        Ok(())
    }

    /// Close the current member: block padding.
    pub fn file_done(&mut self, output: &mut Vec<u8>) -> Result<()> {
        if self.written_cur != self.cur_size {
            return Err(Error::format("tar: less data than announced in header"));
        }
        let pad = (BLOCK as u64 - self.cur_size % BLOCK as u64) as usize % BLOCK;
        output.extend(std::iter::repeat(0).take(pad));
        Ok(())
    }

    /// End-of-archive marker: two zero blocks.
    pub fn finish(&mut self, output: &mut Vec<u8>) {
        output.extend(std::iter::repeat(0).take(2 * BLOCK));
    }
}

fn str_field(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(entries: &[(&str, EntryKind, &[u8])]) -> Vec<(String, EntryKind, Vec<u8>)> {
        let mut w = TarWriter::new();
        let mut arch = Vec::new();
        for (name, kind, data) in entries {
            let e = ArcEntry {
                name: name.to_string(),
                size: data.len() as u64,
                kind: *kind,
                mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
                unix_attr: 0o644,
                ..ArcEntry::default()
            };
            w.add(&e, &mut arch).unwrap();
            w.data(data, &mut arch).unwrap();
            w.file_done(&mut arch).unwrap();
        }
        w.finish(&mut arch);
        assert_eq!(0, arch.len() % BLOCK);

        let mut r = TarReader::new();
        let mut input = &arch[..];
        let mut got = Vec::new();
        let mut cur: Option<(String, EntryKind, Vec<u8>)> = None;
        loop {
            let mut out = Vec::new();
            match r.process(&mut input, &mut out).unwrap() {
                ReadEvent::FileHeader => {
                    let e = r.entry();
                    cur = Some((e.name.clone(), e.kind, Vec::new()));
                }
                ReadEvent::Data => cur.as_mut().unwrap().2.extend_from_slice(&out),
                ReadEvent::FileDone => got.push(cur.take().unwrap()),
                ReadEvent::Done => break,
                ReadEvent::More => panic!("starved on complete archive"),
                ReadEvent::Seek(_) => panic!("tar reader must not seek"),
            }
        }
        got
    }

    #[test]
    fn test_tar_roundtrip() {
        let got = roundtrip(&[
            ("dir", EntryKind::Dir, b""),
            ("dir/hello.txt", EntryKind::Regular, b"hello tar"),
        ]);
        assert_eq!(2, got.len());
        assert_eq!(("dir".to_string(), EntryKind::Dir), (got[0].0.clone(), got[0].1));
        assert_eq!("dir/hello.txt", got[1].0);
        assert_eq!(b"hello tar".to_vec(), got[1].2);
    }

    #[test]
    fn test_tar_long_name() {
        let long = format!("{}/f.txt", "d".repeat(120));
        let got = roundtrip(&[(long.as_str(), EntryKind::Regular, b"x")]);
        assert_eq!(long, got[0].0);
    }

    #[test]
    fn test_tar_mtime_seconds_preserved() {
        let got = {
            let mut w = TarWriter::new();
            let mut arch = Vec::new();
            let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_234_567_890);
            let e = ArcEntry {
                name: "a".into(),
                size: 0,
                mtime: t,
                ..ArcEntry::default()
            };
            w.add(&e, &mut arch).unwrap();
            w.data(b"", &mut arch).unwrap();
            w.file_done(&mut arch).unwrap();
            w.finish(&mut arch);

            let mut r = TarReader::new();
            let mut input = &arch[..];
            let mut out = Vec::new();
            match r.process(&mut input, &mut out).unwrap() {
                ReadEvent::FileHeader => r.entry().mtime,
                other => panic!("unexpected event: {:?}", other),
            }
        };
        assert_eq!(
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_234_567_890),
            got
        );
    }

    #[test]
    fn test_tar_size_mismatch_rejected() {
        let mut w = TarWriter::new();
        let mut out = Vec::new();
        let e = ArcEntry {
            name: "a".into(),
            size: 4,
            ..ArcEntry::default()
        };
        w.add(&e, &mut out).unwrap();
        w.data(b"xy", &mut out).unwrap();
        assert!(w.file_done(&mut out).is_err());
    }
}
