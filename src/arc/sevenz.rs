/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! 7z container reader.  Parses the signature header, the (possibly
//! LZMA-compressed) metadata header and extracts files from folders using
//! the copy and LZMA coders.  Other coder chains are a format error.

use std::time::{Duration, SystemTime};

use log::debug;
use xz2::stream::{Action, Status, Stream};

use crate::arc::{get_u32le, get_u64le, ArcEntry, EntryKind, ReadEvent};
use crate::core::error::{Error, Result};

const SIGNATURE: [u8; 6] = [b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c];
const SIG_HEADER_LEN: usize = 32;

const K_END: u64 = 0x00;
const K_HEADER: u64 = 0x01;
const K_MAIN_STREAMS_INFO: u64 = 0x04;
const K_FILES_INFO: u64 = 0x05;
const K_PACK_INFO: u64 = 0x06;
const K_UNPACK_INFO: u64 = 0x07;
const K_SUBSTREAMS_INFO: u64 = 0x08;
const K_SIZE: u64 = 0x09;
const K_CRC: u64 = 0x0a;
const K_FOLDER: u64 = 0x0b;
const K_CODERS_UNPACK_SIZE: u64 = 0x0c;
const K_NUM_UNPACK_STREAM: u64 = 0x0d;
const K_EMPTY_STREAM: u64 = 0x0e;
const K_EMPTY_FILE: u64 = 0x0f;
const K_NAME: u64 = 0x11;
const K_MTIME: u64 = 0x14;
const K_ATTRIBUTES: u64 = 0x15;
const K_ENCODED_HEADER: u64 = 0x17;

const CODER_COPY: &[u8] = &[0x00];
const CODER_LZMA: &[u8] = &[0x03, 0x01, 0x01];

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_DIFF: u64 = 11_644_473_600;

const ATTR_UNIX_EXTENSION: u32 = 0x8000;
const ATTR_DIRECTORY: u32 = 0x10;

const OUT_CHUNK: usize = 128 * 1024;

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::format("7z: truncated header"))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::format("7z: truncated header"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// 7z variable-length number.
    fn number(&mut self) -> Result<u64> {
        let first = self.byte()?;
        let mut mask = 0x80u8;
        let mut value = 0u64;
        for i in 0..8 {
            if first & mask == 0 {
                let high = (first & (mask.wrapping_sub(1))) as u64;
                value |= high << (8 * i);
                return Ok(value);
            }
            value |= (self.byte()? as u64) << (8 * i);
            mask >>= 1;
        }
        Ok(value)
    }

    fn bit_vector(&mut self, n: usize) -> Result<Vec<bool>> {
        let bytes = self.bytes((n + 7) / 8)?;
        let mut v = Vec::with_capacity(n);
        for i in 0..n {
            v.push(bytes[i / 8] & (0x80 >> (i % 8)) != 0);
        }
        Ok(v)
    }

    /// All-defined flag byte, then a bit vector unless all are defined.
    fn defined_vector(&mut self, n: usize) -> Result<Vec<bool>> {
        if self.byte()? != 0 {
            Ok(vec![true; n])
        } else {
            self.bit_vector(n)
        }
    }
}

struct Folder {
    coder_id: Vec<u8>,
    props: Vec<u8>,
    unpack_size: u64,
    /// Offset of this folder's packed stream relative to the packed area.
    pack_off: u64,
    pack_size: u64,
    /// Number of files sharing this folder (solid block).
    num_substreams: usize,
}

struct StreamsInfo {
    pack_pos: u64,
    folders: Vec<Folder>,
    substream_sizes: Vec<u64>,
    substream_crcs: Vec<Option<u32>>,
}

/// One archive member.
pub struct SevenZFile {
    pub entry: ArcEntry,
    pub has_stream: bool,
    crc: Option<u32>,
    folder: usize,
}

enum FolderDec {
    Copy,
    Lzma(Box<Stream>),
}

enum RState {
    Start,
    SigHeader,
    NextHeader { size: u64 },
    EncPacked { pack_size: u64 },
    Ready,
    FolderData,
    MemberDone,
}

pub struct SevenZReader {
    state: RState,
    buf: Vec<u8>,
    next_header_off: u64,
    next_header_size: u64,
    enc_streams: Option<StreamsInfo>,
    streams: Option<StreamsInfo>,
    files: Vec<SevenZFile>,
    // extraction
    cur: usize,
    cur_folder: Option<usize>,
    dec: FolderDec,
    member_left: u64,
    folder_in_left: u64,
    crc: crc32fast::Hasher,
    /// Undecoded folder bytes awaiting the decompressor.
    pending: Vec<u8>,
    /// Decoded bytes past the current member boundary, owed to the next
    /// member of the same solid block.
    carry: Vec<u8>,
}

impl SevenZReader {
    pub fn new() -> Self {
        SevenZReader {
            state: RState::Start,
            buf: Vec::new(),
            next_header_off: 0,
            next_header_size: 0,
            enc_streams: None,
            streams: None,
            files: Vec::new(),
            cur: 0,
            cur_folder: None,
            dec: FolderDec::Copy,
            member_left: 0,
            folder_in_left: 0,
            crc: crc32fast::Hasher::new(),
            pending: Vec::new(),
            carry: Vec::new(),
        }
    }

    pub fn files(&self) -> &[SevenZFile] {
        &self.files
    }

    pub fn headers_done(&self) -> bool {
        matches!(self.state, RState::Ready)
    }

    pub fn entry(&self) -> &ArcEntry {
        &self.files[self.cur].entry
    }

    fn parse_streams_info(r: &mut ByteReader) -> Result<StreamsInfo> {
        let mut pack_pos = 0;
        let mut pack_sizes: Vec<u64> = Vec::new();
        let mut folders: Vec<Folder> = Vec::new();
        let mut substream_sizes: Vec<u64> = Vec::new();
        let mut substream_crcs: Vec<Option<u32>> = Vec::new();
        let mut folder_crcs: Vec<Option<u32>> = Vec::new();

        loop {
            let id = r.number()?;
            match id {
                K_END => break,

                K_PACK_INFO => {
                    pack_pos = r.number()?;
                    let n = r.number()? as usize;
                    loop {
                        let sub = r.number()?;
                        match sub {
                            K_END => break,
                            K_SIZE => {
                                for _ in 0..n {
                                    pack_sizes.push(r.number()?);
                                }
                            }
                            K_CRC => {
                                let defined = r.defined_vector(n)?;
                                for d in defined {
                                    if d {
                                        r.bytes(4)?;
                                    }
                                }
                            }
                            _ => return Err(Error::format("7z: unexpected pack info property")),
                        }
                    }
                }

                K_UNPACK_INFO => {
                    let sub = r.number()?;
                    if sub != K_FOLDER {
                        return Err(Error::format("7z: folder info expected"));
                    }
                    let num_folders = r.number()? as usize;
                    if r.byte()? != 0 {
                        return Err(Error::format("7z: external folder data unsupported"));
                    }
                    for _ in 0..num_folders {
                        let num_coders = r.number()? as usize;
                        if num_coders != 1 {
                            return Err(Error::format(
                                "7z: multi-coder folders are not supported",
                            ));
                        }
                        let flags = r.byte()?;
                        let id_size = (flags & 0x0f) as usize;
                        let is_complex = flags & 0x10 != 0;
                        let has_attrs = flags & 0x20 != 0;
                        let coder_id = r.bytes(id_size)?.to_vec();
                        if is_complex {
                            return Err(Error::format(
                                "7z: complex coders are not supported",
                            ));
                        }
                        let mut props = Vec::new();
                        if has_attrs {
                            let n = r.number()? as usize;
                            props = r.bytes(n)?.to_vec();
                        }
                        folders.push(Folder {
                            coder_id,
                            props,
                            unpack_size: 0,
                            pack_off: 0,
                            pack_size: 0,
                            num_substreams: 1,
                        });
                    }
                    let sub = r.number()?;
                    if sub != K_CODERS_UNPACK_SIZE {
                        return Err(Error::format("7z: coder unpack sizes expected"));
                    }
                    for f in folders.iter_mut() {
                        f.unpack_size = r.number()?;
                    }
                    loop {
                        match r.number()? {
                            K_END => break,
                            K_CRC => {
                                let defined = r.defined_vector(folders.len())?;
                                for d in defined {
                                    folder_crcs.push(if d {
                                        Some(get_u32le(r.bytes(4)?))
                                    } else {
                                        None
                                    });
                                }
                            }
                            _ => return Err(Error::format("7z: unexpected unpack property")),
                        }
                    }
                }

                K_SUBSTREAMS_INFO => {
                    let mut nums: Vec<usize> = vec![1; folders.len()];
                    let mut sub = r.number()?;
                    if sub == K_NUM_UNPACK_STREAM {
                        for n in nums.iter_mut() {
                            *n = r.number()? as usize;
                        }
                        sub = r.number()?;
                    }
                    for (fi, f) in folders.iter_mut().enumerate() {
                        f.num_substreams = nums[fi];
                    }
                    if sub == K_SIZE {
                        for (fi, f) in folders.iter().enumerate() {
                            let mut sum = 0;
                            for _ in 1..nums[fi] {
                                let s = r.number()?;
                                sum += s;
                                substream_sizes.push(s);
                            }
                            if nums[fi] > 0 {
                                substream_sizes.push(f.unpack_size - sum);
                            }
                        }
                        sub = r.number()?;
                    } else {
                        for f in folders.iter() {
                            if f.num_substreams == 1 {
                                substream_sizes.push(f.unpack_size);
                            } else {
                                return Err(Error::format("7z: substream sizes missing"));
                            }
                        }
                    }
                    if sub == K_CRC {
                        let total: usize = nums.iter().sum();
                        let defined = r.defined_vector(total)?;
                        for d in defined {
                            substream_crcs.push(if d {
                                Some(get_u32le(r.bytes(4)?))
                            } else {
                                None
                            });
                        }
                        sub = r.number()?;
                    }
                    if sub != K_END {
                        return Err(Error::format("7z: unexpected substream property"));
                    }
                }

                _ => return Err(Error::format("7z: unexpected streams property")),
            }
        }

        if pack_sizes.len() < folders.len() {
            return Err(Error::format("7z: pack stream count mismatch"));
        }
        let mut off = 0;
        for (i, f) in folders.iter_mut().enumerate() {
            f.pack_off = off;
            f.pack_size = pack_sizes[i];
            off += pack_sizes[i];
        }
        if substream_sizes.is_empty() {
            for f in &folders {
                substream_sizes.push(f.unpack_size);
            }
        }
        if substream_crcs.is_empty() {
            substream_crcs = folder_crcs;
            substream_crcs.resize(substream_sizes.len(), None);
        }
        Ok(StreamsInfo {
            pack_pos,
            folders,
            substream_sizes,
            substream_crcs,
        })
    }

    fn parse_files_info(&mut self, r: &mut ByteReader, si: &StreamsInfo) -> Result<()> {
        let num_files = r.number()? as usize;
        let mut empty_stream = vec![false; num_files];
        let mut empty_file: Vec<bool> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut mtimes: Vec<SystemTime> = vec![SystemTime::UNIX_EPOCH; num_files];
        let mut attrs: Vec<u32> = vec![0; num_files];

        loop {
            let prop = r.number()?;
            if prop == K_END {
                break;
            }
            let size = r.number()? as usize;
            let body = r.bytes(size)?;
            let mut br = ByteReader::new(body);
            match prop {
                K_EMPTY_STREAM => {
                    empty_stream = br.bit_vector(num_files)?;
                }
                K_EMPTY_FILE => {
                    let n = empty_stream.iter().filter(|&&b| b).count();
                    empty_file = br.bit_vector(n)?;
                }
                K_NAME => {
                    if br.byte()? != 0 {
                        return Err(Error::format("7z: external names unsupported"));
                    }
                    let mut units: Vec<u16> = Vec::new();
                    while br.pos + 1 < body.len() {
                        let u = u16::from_le_bytes([body[br.pos], body[br.pos + 1]]);
                        br.pos += 2;
                        if u == 0 {
                            names.push(String::from_utf16_lossy(&units).replace('\\', "/"));
                            units.clear();
                        } else {
                            units.push(u);
                        }
                    }
                }
                K_MTIME => {
                    let defined = br.defined_vector(num_files)?;
                    if br.byte()? != 0 {
                        return Err(Error::format("7z: external times unsupported"));
                    }
                    for (i, d) in defined.iter().enumerate() {
                        if *d {
                            let ft = get_u64le(br.bytes(8)?);
                            let secs = ft / 10_000_000;
                            let nanos = (ft % 10_000_000) * 100;
                            if secs >= FILETIME_EPOCH_DIFF {
                                mtimes[i] = SystemTime::UNIX_EPOCH
                                    + Duration::new(secs - FILETIME_EPOCH_DIFF, nanos as u32);
                            }
                        }
                    }
                }
                K_ATTRIBUTES => {
                    let defined = br.defined_vector(num_files)?;
                    if br.byte()? != 0 {
                        return Err(Error::format("7z: external attributes unsupported"));
                    }
                    for (i, d) in defined.iter().enumerate() {
                        if *d {
                            attrs[i] = get_u32le(br.bytes(4)?);
                        }
                    }
                }
                _ => {} // skip unknown file properties
            }
        }

        if names.len() != num_files {
            return Err(Error::format("7z: file name count mismatch"));
        }

        // map files to substreams in order
        let mut stream_idx = 0usize;
        let mut empty_idx = 0usize;
        let mut folder_of_stream: Vec<usize> = Vec::new();
        for (fi, f) in si.folders.iter().enumerate() {
            for _ in 0..f.num_substreams {
                folder_of_stream.push(fi);
            }
        }
        for i in 0..num_files {
            let has_stream = !empty_stream[i];
            let win_attr = attrs[i];
            let unix_attr = if win_attr & ATTR_UNIX_EXTENSION != 0 {
                win_attr >> 16
            } else {
                0o644
            };
            let (kind, size, folder, crc) = if has_stream {
                let idx = stream_idx;
                stream_idx += 1;
                (
                    EntryKind::Regular,
                    si.substream_sizes[idx],
                    folder_of_stream.get(idx).copied().unwrap_or(0),
                    si.substream_crcs.get(idx).copied().flatten(),
                )
            } else {
                let is_dir = empty_file.is_empty() || !empty_file[empty_idx];
                empty_idx += 1;
                let kind = if is_dir || win_attr & ATTR_DIRECTORY != 0 {
                    EntryKind::Dir
                } else {
                    EntryKind::Regular
                };
                (kind, 0, 0, None)
            };
            self.files.push(SevenZFile {
                entry: ArcEntry {
                    name: names[i].clone(),
                    size,
                    mtime: mtimes[i],
                    unix_attr,
                    win_attr: win_attr & 0xffff,
                    kind,
                    ..ArcEntry::default()
                },
                has_stream,
                crc,
                folder,
            });
        }
        debug!("7z: {} files", self.files.len());
        Ok(())
    }

    fn parse_header(&mut self, data: &[u8]) -> Result<HeaderKind> {
        let mut r = ByteReader::new(data);
        match r.number()? {
            K_HEADER => {
                let mut streams = None;
                loop {
                    match r.number()? {
                        K_END => break,
                        K_MAIN_STREAMS_INFO => {
                            streams = Some(Self::parse_streams_info(&mut r)?);
                        }
                        K_FILES_INFO => {
                            // an archive of directories only has no streams
                            let si = streams.take().unwrap_or(StreamsInfo {
                                pack_pos: 0,
                                folders: Vec::new(),
                                substream_sizes: Vec::new(),
                                substream_crcs: Vec::new(),
                            });
                            self.parse_files_info(&mut r, &si)?;
                            streams = Some(si);
                        }
                        _ => return Err(Error::format("7z: unexpected header property")),
                    }
                }
                self.streams = streams;
                Ok(HeaderKind::Plain)
            }
            K_ENCODED_HEADER => {
                let si = Self::parse_streams_info(&mut r)?;
                Ok(HeaderKind::Encoded(si))
            }
            _ => Err(Error::format("7z: bad header id")),
        }
    }

    fn folder_decoder(f: &Folder) -> Result<FolderDec> {
        if f.coder_id == CODER_COPY {
            Ok(FolderDec::Copy)
        } else if f.coder_id == CODER_LZMA {
            if f.props.len() != 5 {
                return Err(Error::format("7z: bad LZMA properties"));
            }
            let strm = Stream::new_lzma_decoder(1 << 31)
                .map_err(|e| Error::format(format!("7z lzma: {}", e)))?;
            Ok(FolderDec::Lzma(Box::new(strm)))
        } else {
            Err(Error::format(format!(
                "7z: unsupported coder {:02x?}",
                f.coder_id
            )))
        }
    }

    /// Decompress a whole in-memory folder (used for encoded headers).
    fn decode_folder(f: &Folder, packed: &[u8]) -> Result<Vec<u8>> {
        match Self::folder_decoder(f)? {
            FolderDec::Copy => Ok(packed.to_vec()),
            FolderDec::Lzma(mut strm) => {
                let mut framed = Vec::with_capacity(13 + packed.len());
                framed.extend_from_slice(&f.props);
                framed.extend_from_slice(&f.unpack_size.to_le_bytes());
                framed.extend_from_slice(packed);
                let mut out = Vec::with_capacity(f.unpack_size as usize);
                let mut input = &framed[..];
                loop {
                    let bi = strm.total_in();
                    out.reserve(OUT_CHUNK);
                    let status = strm
                        .process_vec(input, &mut out, Action::Run)
                        .map_err(|e| Error::format(format!("7z lzma: {}", e)))?;
                    let consumed = (strm.total_in() - bi) as usize;
                    input = &input[consumed..];
                    if status == Status::StreamEnd || out.len() as u64 >= f.unpack_size {
                        break;
                    }
                    if input.is_empty() && consumed == 0 {
                        return Err(Error::format("7z: truncated folder"));
                    }
                }
                Ok(out)
            }
        }
    }

    /// Begin extraction of file `idx`.  Returns the archive offset to read
    /// from, or None when the member carries no stream or continues the
    /// currently open folder.
    pub fn begin_member(&mut self, idx: usize) -> Result<Option<u64>> {
        self.cur = idx;
        let file = &self.files[idx];
        if !file.has_stream {
            self.state = RState::MemberDone;
            return Ok(None);
        }
        let si = self
            .streams
            .as_ref()
            .ok_or_else(|| Error::internal("7z: no streams info"))?;
        self.member_left = file.entry.size;
        self.crc = crc32fast::Hasher::new();
        self.state = RState::FolderData;
        if self.cur_folder == Some(file.folder) {
            return Ok(None); // same solid block, keep streaming
        }
        let f = &si.folders[file.folder];
        self.cur_folder = Some(file.folder);
        self.dec = Self::folder_decoder(f)?;
        self.folder_in_left = f.pack_size;
        self.pending.clear();
        self.carry.clear();
        if let FolderDec::Lzma(_) = self.dec {
            // prepend the rebuilt .lzma stream header
            self.pending.extend_from_slice(&f.props);
            self.pending
                .extend_from_slice(&f.unpack_size.to_le_bytes());
        }
        Ok(Some(SIG_HEADER_LEN as u64 + si.pack_pos + f.pack_off))
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
                    self.state = RState::SigHeader;
                    return Ok(ReadEvent::Seek(0));
                }

                RState::SigHeader => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    if self.buf.len() < SIG_HEADER_LEN {
                        if eof {
                            return Err(Error::format("7z: truncated signature header"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    if self.buf[..6] != SIGNATURE {
                        return Err(Error::format("7z: bad signature"));
                    }
                    self.next_header_off = get_u64le(&self.buf[12..20]);
                    self.next_header_size = get_u64le(&self.buf[20..28]);
                    if self.next_header_size == 0 {
                        self.state = RState::Ready;
                        return Ok(ReadEvent::Done);
                    }
                    self.buf.clear();
                    let size = self.next_header_size;
                    self.state = RState::NextHeader { size };
                    return Ok(ReadEvent::Seek(SIG_HEADER_LEN as u64 + self.next_header_off));
                }

                RState::NextHeader { size } => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    if (self.buf.len() as u64) < size {
                        if eof {
                            return Err(Error::format("7z: truncated header"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    let data = std::mem::take(&mut self.buf);
                    match self.parse_header(&data[..size as usize])? {
                        HeaderKind::Plain => {
                            self.state = RState::Ready;
                            return Ok(ReadEvent::Done);
                        }
                        HeaderKind::Encoded(si) => {
                            if si.folders.len() != 1 {
                                return Err(Error::format("7z: bad encoded header"));
                            }
                            let pack_size = si.folders[0].pack_size;
                            let off = SIG_HEADER_LEN as u64 + si.pack_pos;
                            self.enc_streams = Some(si);
                            self.state = RState::EncPacked { pack_size };
                            return Ok(ReadEvent::Seek(off));
                        }
                    }
                }

                RState::EncPacked { pack_size } => {
                    self.buf.extend_from_slice(input);
                    *input = &[];
                    if (self.buf.len() as u64) < pack_size {
                        if eof {
                            return Err(Error::format("7z: truncated encoded header"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    let packed = std::mem::take(&mut self.buf);
                    let si = self
                        .enc_streams
                        .take()
                        .ok_or_else(|| Error::internal("7z: encoded header state lost"))?;
                    let decoded =
                        Self::decode_folder(&si.folders[0], &packed[..pack_size as usize])?;
                    match self.parse_header(&decoded)? {
                        HeaderKind::Plain => {
                            self.state = RState::Ready;
                            return Ok(ReadEvent::Done);
                        }
                        HeaderKind::Encoded(_) => {
                            return Err(Error::format("7z: nested encoded header"))
                        }
                    }
                }

                RState::Ready => return Ok(ReadEvent::Done),

                RState::FolderData => {
                    if self.member_left == 0 {
                        if let Some(want) = self.files[self.cur].crc {
                            let got = self.crc.clone().finalize();
                            if want != got {
                                return Err(Error::format(format!(
                                    "7z: '{}': CRC mismatch",
                                    self.files[self.cur].entry.name
                                )));
                            }
                        }
                        self.state = RState::MemberDone;
                        return Ok(ReadEvent::FileDone);
                    }

                    // bytes decoded while finishing the previous member of
                    // this solid block come first
                    if !self.carry.is_empty() {
                        let n = (self.member_left as usize).min(self.carry.len());
                        output.extend_from_slice(&self.carry[..n]);
                        self.carry.drain(..n);
                        self.crc.update(&output[output.len() - n..]);
                        self.member_left -= n as u64;
                        return Ok(ReadEvent::Data);
                    }

                    let take = (self.folder_in_left as usize).min(input.len());
                    if take == 0 && self.pending.is_empty() {
                        if eof {
                            return Err(Error::format("7z: truncated member data"));
                        }
                        return Ok(ReadEvent::More);
                    }
                    self.pending.extend_from_slice(&input[..take]);
                    *input = &input[take..];
                    self.folder_in_left -= take as u64;

                    let before = output.len();
                    match &mut self.dec {
                        FolderDec::Copy => {
                            let n = (self.member_left as usize).min(self.pending.len());
                            output.extend_from_slice(&self.pending[..n]);
                            self.pending.drain(..n);
                        }
                        FolderDec::Lzma(strm) => {
                            let bi = strm.total_in();
                            let mut chunk = Vec::with_capacity(OUT_CHUNK);
                            strm.process_vec(&self.pending, &mut chunk, Action::Run)
                                .map_err(|e| Error::format(format!("7z lzma: {}", e)))?;
                            let consumed = (strm.total_in() - bi) as usize;
                            self.pending.drain(..consumed);
                            let n = (self.member_left as usize).min(chunk.len());
                            output.extend_from_slice(&chunk[..n]);
                            // decoded bytes past the member boundary belong
                            // to the next file in the solid block
                            self.carry.extend_from_slice(&chunk[n..]);
                        }
                    }
                    let produced = output.len() - before;
                    self.crc.update(&output[before..]);
                    self.member_left -= produced as u64;
                    if produced > 0 {
                        return Ok(ReadEvent::Data);
                    }
                }

                RState::MemberDone => return Ok(ReadEvent::FileDone),
            }
        }
    }
}

enum HeaderKind {
    Plain,
    Encoded(StreamsInfo),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal archive: one "hello" member in a copy-coded folder,
    /// plain (uncompressed) metadata header.
    fn handcrafted() -> Vec<u8> {
        let payload = b"hello";
        // Header: kHeader { MainStreamsInfo { PackInfo, UnpackInfo }, FilesInfo }
        let header: Vec<u8> = vec![
            0x01, // kHeader
            0x04, // kMainStreamsInfo
            0x06, // kPackInfo
            0x00, // packPos = 0
            0x01, // numPackStreams = 1
            0x09, 0x05, // kSize: 5
            0x00, // kEnd (PackInfo)
            0x07, // kUnpackInfo
            0x0b, // kFolder
            0x01, // numFolders = 1
            0x00, // external = 0
            0x01, // numCoders = 1
            0x01, // coder flags: idSize=1
            0x00, // coder id = copy
            0x0c, 0x05, // kCodersUnpackSize: 5
            0x00, // kEnd (UnpackInfo)
            0x00, // kEnd (StreamsInfo)
            0x05, // kFilesInfo
            0x01, // numFiles = 1
            0x11, 0x05, // kName, size 5
            0x00, // external = 0
            b'a', 0x00, 0x00, 0x00, // "a" UTF-16LE + terminator
            0x00, // kEnd (FilesInfo)
            0x00, // kEnd (Header)
        ];

        let mut arch = Vec::new();
        arch.extend_from_slice(&SIGNATURE);
        arch.extend_from_slice(&[0x00, 0x04]); // version
        arch.extend_from_slice(&[0; 4]); // start header CRC (not verified)
        arch.extend_from_slice(&(payload.len() as u64).to_le_bytes()); // next header offset
        arch.extend_from_slice(&(header.len() as u64).to_le_bytes()); // next header size
        arch.extend_from_slice(&[0; 4]); // next header CRC (not verified)
        arch.extend_from_slice(payload);
        arch.extend_from_slice(&header);
        arch
    }

    fn drive_headers(r: &mut SevenZReader, arch: &[u8]) {
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

    #[test]
    fn test_7z_copy_folder_extract() {
        let arch = handcrafted();
        let mut r = SevenZReader::new();
        drive_headers(&mut r, &arch);
        assert!(r.headers_done());
        assert_eq!(1, r.files().len());
        assert_eq!("a", r.files()[0].entry.name);
        assert_eq!(5, r.files()[0].entry.size);

        let off = r.begin_member(0).unwrap().unwrap() as usize;
        let mut input = &arch[off..];
        let mut data = Vec::new();
        loop {
            let mut o = Vec::new();
            match r.process(&mut input, &mut o, true).unwrap() {
                ReadEvent::Data => data.extend_from_slice(&o),
                ReadEvent::FileDone => break,
                e => panic!("unexpected: {:?}", e),
            }
        }
        assert_eq!(b"hello".to_vec(), data);
    }

    #[test]
    fn test_7z_bad_signature_rejected() {
        let mut arch = handcrafted();
        arch[0] = b'8';
        let mut r = SevenZReader::new();
        let mut input = &arch[..0];
        let mut o = Vec::new();
        assert!(matches!(
            r.process(&mut input, &mut o, true).unwrap(),
            ReadEvent::Seek(0)
        ));
        let mut input = &arch[..];
        assert!(r.process(&mut input, &mut o, true).is_err());
    }

    #[test]
    fn test_7z_number_encoding() {
        let mut r = ByteReader::new(&[0x7f]);
        assert_eq!(0x7f, r.number().unwrap());
        let mut r = ByteReader::new(&[0x80, 0x34]);
        assert_eq!(0x34, r.number().unwrap());
        let mut r = ByteReader::new(&[0xc0, 0x12, 0x34]);
        // two extra bytes little-endian, high bits from the first byte
        assert_eq!(0x3412, r.number().unwrap());
    }
}
