/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! gzip member framing over raw deflate: RFC 1952 header with original
//! name and mtime, CRC-32 + ISIZE trailer, concatenated-member input.

use std::time::{Duration, SystemTime};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::debug;

use crate::arc::{get_u32le, ArcEntry, ReadEvent};
use crate::core::error::{Error, Result};

const FHCRC: u8 = 2;
const FEXTRA: u8 = 4;
const FNAME: u8 = 8;
const FCOMMENT: u8 = 16;

const OUT_CHUNK: usize = 64 * 1024;

enum RState {
    Header,
    Data,
    Trailer,
    Done,
}

/// Streaming .gz reader.  Concatenated members decode into one continuous
/// output stream, each member's CRC verified against its own data.
pub struct GzReader {
    state: RState,
    buf: Vec<u8>,
    inflate: Decompress,
    crc: crc32fast::Hasher,
    member_out: u64,
    entry: ArcEntry,
    first_member: bool,
}

impl GzReader {
    pub fn new() -> Self {
        GzReader {
            state: RState::Header,
            buf: Vec::new(),
            inflate: Decompress::new(false),
            crc: crc32fast::Hasher::new(),
            member_out: 0,
            entry: ArcEntry::default(),
            first_member: true,
        }
    }

    pub fn entry(&self) -> &ArcEntry {
        &self.entry
    }

    /// Try to parse a complete member header from `buf`; returns the header
    /// length, or None when more bytes are needed.
    fn parse_header(&mut self) -> Result<Option<usize>> {
        let b = &self.buf;
        if b.len() < 10 {
            return Ok(None);
        }
        if b[0] != 0x1f || b[1] != 0x8b {
            return Err(Error::format("gzip: bad magic"));
        }
        if b[2] != 8 {
            return Err(Error::format("gzip: unsupported compression method"));
        }
        let flg = b[3];
        let mtime = get_u32le(&b[4..8]);
        let mut pos = 10;

        if flg & FEXTRA != 0 {
            if b.len() < pos + 2 {
                return Ok(None);
            }
            let xlen = u16::from_le_bytes([b[pos], b[pos + 1]]) as usize;
            pos += 2 + xlen;
            if b.len() < pos {
                return Ok(None);
            }
        }
        let mut name = String::new();
        if flg & FNAME != 0 {
            match b[pos..].iter().position(|&c| c == 0) {
                Some(z) => {
                    name = String::from_utf8_lossy(&b[pos..pos + z]).into_owned();
                    pos += z + 1;
                }
                None => return Ok(None),
            }
        }
        if flg & FCOMMENT != 0 {
            match b[pos..].iter().position(|&c| c == 0) {
                Some(z) => pos += z + 1,
                None => return Ok(None),
            }
        }
        if flg & FHCRC != 0 {
            pos += 2;
            if b.len() < pos {
                return Ok(None);
            }
        }

        self.entry = ArcEntry {
            name,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(mtime as u64),
            ..ArcEntry::default()
        };
        debug!("gzip: member header, name '{}'", self.entry.name);
        Ok(Some(pos))
    }

    pub fn process(
        &mut self,
        input: &mut &[u8],
        output: &mut Vec<u8>,
        eof: bool,
    ) -> Result<ReadEvent> {
        loop {
            match self.state {
                RState::Header => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    match self.parse_header()? {
                        None => {
                            if eof {
                                if self.buf.is_empty() && !self.first_member {
                                    // clean end after the previous member
                                    self.state = RState::Done;
                                    return Ok(ReadEvent::FileDone);
                                }
                                return Err(Error::format("gzip: truncated header"));
                            }
                            return Ok(ReadEvent::More);
                        }
                        Some(n) => {
                            self.buf.drain(..n);
                            self.inflate = Decompress::new(false);
                            self.crc = crc32fast::Hasher::new();
                            self.member_out = 0;
                            self.state = RState::Data;
                            if self.first_member {
                                self.first_member = false;
                                return Ok(ReadEvent::FileHeader);
                            }
                        }
                    }
                }

                RState::Data => {
                    if self.buf.is_empty() && input.is_empty() && !eof {
                        return Ok(ReadEvent::More);
                    }
                    // drain the header-stage remainder before fresh input
                    let src_is_buf = !self.buf.is_empty();
                    let src: &[u8] = if src_is_buf { &self.buf } else { *input };

                    let before_in = self.inflate.total_in();
                    let before_out = self.inflate.total_out();
                    output.reserve(OUT_CHUNK);
                    let status = self
                        .inflate
                        .decompress_vec(src, output, FlushDecompress::None)
                        .map_err(|e| Error::format(format!("gzip: {}", e)))?;
                    let consumed = (self.inflate.total_in() - before_in) as usize;
                    let produced = (self.inflate.total_out() - before_out) as usize;
                    if src_is_buf {
                        self.buf.drain(..consumed);
                    } else {
                        *input = &input[consumed..];
                    }
                    let new = &output[output.len() - produced..];
                    self.crc.update(new);
                    self.member_out += produced as u64;

                    match status {
                        Status::StreamEnd => {
                            self.state = RState::Trailer;
                            if produced > 0 {
                                return Ok(ReadEvent::Data);
                            }
                        }
                        _ => {
                            if produced > 0 {
                                return Ok(ReadEvent::Data);
                            }
                            if eof && self.buf.is_empty() && input.is_empty() {
                                return Err(Error::format("gzip: truncated stream"));
                            }
                            if self.buf.is_empty() && input.is_empty() {
                                return Ok(ReadEvent::More);
                            }
                        }
                    }
                }

                RState::Trailer => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    if self.buf.len() < 8 {
                        if eof {
                            return Err(Error::format("gzip: truncated trailer"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    let crc = get_u32le(&self.buf[..4]);
                    let isize = get_u32le(&self.buf[4..8]);
                    if crc != self.crc.clone().finalize() {
                        return Err(Error::format("gzip: CRC mismatch"));
                    }
                    if isize != self.member_out as u32 {
                        return Err(Error::format("gzip: length mismatch"));
                    }
                    self.buf.drain(..8);
                    debug!("gzip: member complete ({} bytes)", self.member_out);
                    if self.buf.is_empty() && eof {
                        self.state = RState::Done;
                        return Ok(ReadEvent::FileDone);
                    }
                    // another member follows; it continues the same output
                    self.state = RState::Header;
                }

                RState::Done => return Ok(ReadEvent::Done),
            }
        }
    }
}

/// Streaming .gz writer: one member carrying the original file name and
/// mtime.
pub struct GzWriter {
    deflate: Compress,
    crc: crc32fast::Hasher,
    total_in: u64,
    header_done: bool,
    name: String,
    mtime: SystemTime,
}

impl GzWriter {
    pub fn new(level: u32, name: &str, mtime: SystemTime) -> Self {
        GzWriter {
            deflate: Compress::new(Compression::new(level), false),
            crc: crc32fast::Hasher::new(),
            total_in: 0,
            header_done: false,
            name: name.to_string(),
            mtime,
        }
    }

    fn header(&self, output: &mut Vec<u8>) {
        let mtime = self
            .mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let flg = if self.name.is_empty() { 0 } else { FNAME };
        output.extend_from_slice(&[0x1f, 0x8b, 8, flg]);
        output.extend_from_slice(&mtime.to_le_bytes());
        output.extend_from_slice(&[0, 3]); // XFL, OS=unix
        if !self.name.is_empty() {
            output.extend_from_slice(self.name.as_bytes());
            output.push(0);
        }
    }

    pub fn data(&mut self, mut input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        if !self.header_done {
            self.header_done = true;
            self.header(output);
        }
        self.crc.update(input);
        self.total_in += input.len() as u64;
        while !input.is_empty() {
            let before = self.deflate.total_in();
            output.reserve(OUT_CHUNK);
            self.deflate
                .compress_vec(input, output, FlushCompress::None)
                .map_err(|e| Error::format(format!("gzip: {}", e)))?;
            let consumed = (self.deflate.total_in() - before) as usize;
            input = &input[consumed..];
        }
        Ok(())
    }

    pub fn finish(&mut self, output: &mut Vec<u8>) -> Result<()> {
        if !self.header_done {
            self.header_done = true;
            self.header(output);
        }
        loop {
            output.reserve(OUT_CHUNK);
            let status = self
                .deflate
                .compress_vec(&[], output, FlushCompress::Finish)
                .map_err(|e| Error::format(format!("gzip: {}", e)))?;
            if status == Status::StreamEnd {
                break;
            }
        }
        output.extend_from_slice(&self.crc.clone().finalize().to_le_bytes());
        output.extend_from_slice(&(self.total_in as u32).to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(arch: &[u8]) -> (String, Vec<u8>) {
        let mut r = GzReader::new();
        let mut input = arch;
        let mut data = Vec::new();
        let mut name = String::new();
        loop {
            let mut out = Vec::new();
            match r.process(&mut input, &mut out, true).unwrap() {
                ReadEvent::FileHeader => name = r.entry().name.clone(),
                ReadEvent::Data => data.extend_from_slice(&out),
                ReadEvent::FileDone | ReadEvent::Done => break,
                ReadEvent::More => panic!("starved at eof"),
                ReadEvent::Seek(_) => panic!("gz reader must not seek"),
            }
        }
        (name, data)
    }

    #[test]
    fn test_gz_roundtrip_with_name() {
        let mut w = GzWriter::new(6, "orig.txt", SystemTime::UNIX_EPOCH);
        let mut arch = Vec::new();
        w.data(b"squeeze me ", &mut arch).unwrap();
        w.data(b"please", &mut arch).unwrap();
        w.finish(&mut arch).unwrap();

        let (name, data) = decode_all(&arch);
        assert_eq!("orig.txt", name);
        assert_eq!(b"squeeze me please".to_vec(), data);
    }

    #[test]
    fn test_gz_concatenated_members() {
        let mut arch = Vec::new();
        for part in [&b"first "[..], &b"second"[..]] {
            let mut w = GzWriter::new(1, "", SystemTime::UNIX_EPOCH);
            w.data(part, &mut arch).unwrap();
            w.finish(&mut arch).unwrap();
        }
        let (_, data) = decode_all(&arch);
        assert_eq!(b"first second".to_vec(), data);
    }

    #[test]
    fn test_gz_crc_mismatch_detected() {
        let mut w = GzWriter::new(6, "", SystemTime::UNIX_EPOCH);
        let mut arch = Vec::new();
        w.data(b"payload", &mut arch).unwrap();
        w.finish(&mut arch).unwrap();
        let n = arch.len();
        arch[n - 8] ^= 0xff; // corrupt stored CRC
        let mut r = GzReader::new();
        let mut input = &arch[..];
        let mut failed = false;
        loop {
            let mut out = Vec::new();
            match r.process(&mut input, &mut out, true) {
                Ok(ReadEvent::Done) | Ok(ReadEvent::FileDone) => break,
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
