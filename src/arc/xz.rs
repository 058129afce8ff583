/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! xz stream decoder (liblzma).  Write support is a non-goal here: the
//! toolkit reads .xz/.txz archives and prefers zstd/gzip for packing.

use xz2::stream::{Action, Status, Stream};

use crate::arc::ReadEvent;
use crate::core::error::{Error, Result};

const OUT_CHUNK: usize = 128 * 1024;
const MEM_LIMIT: u64 = 1 << 31;

pub struct XzReader {
    strm: Stream,
    end: bool,
}

impl XzReader {
    pub fn new() -> Result<Self> {
        let strm = Stream::new_stream_decoder(MEM_LIMIT, 0)
            .map_err(|e| Error::format(format!("xz: {}", e)))?;
        Ok(XzReader { strm, end: false })
    }

    pub fn process(
        &mut self,
        input: &mut &[u8],
        output: &mut Vec<u8>,
        eof: bool,
    ) -> Result<ReadEvent> {
        if self.end {
            return Ok(ReadEvent::FileDone);
        }
        if input.is_empty() && !eof {
            return Ok(ReadEvent::More);
        }

        let action = if eof { Action::Finish } else { Action::Run };
        let before_in = self.strm.total_in();
        let before_len = output.len();
        output.reserve(OUT_CHUNK);
        let status = self
            .strm
            .process_vec(input, output, action)
            .map_err(|e| Error::format(format!("xz: {}", e)))?;
        let consumed = (self.strm.total_in() - before_in) as usize;
        *input = &input[consumed..];

        match status {
            Status::StreamEnd => {
                self.end = true;
                if output.len() > before_len {
                    return Ok(ReadEvent::Data);
                }
                Ok(ReadEvent::FileDone)
            }
            _ => {
                if output.len() > before_len {
                    Ok(ReadEvent::Data)
                } else if eof && input.is_empty() {
                    Err(Error::format("xz: truncated stream"))
                } else {
                    Ok(ReadEvent::More)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encode with liblzma directly; the reader must stream it back.
    fn xz_compress(data: &[u8]) -> Vec<u8> {
        let mut strm = Stream::new_easy_encoder(6, xz2::stream::Check::Crc64).unwrap();
        let mut out = Vec::with_capacity(data.len() + 1024);
        strm.process_vec(data, &mut out, Action::Finish).unwrap();
        out
    }

    #[test]
    fn test_xz_decode() {
        let arch = xz_compress(b"lzma compressed payload");
        let mut r = XzReader::new().unwrap();
        let mut input = &arch[..];
        let mut data = Vec::new();
        loop {
            match r.process(&mut input, &mut data, true).unwrap() {
                ReadEvent::Data | ReadEvent::More => {}
                ReadEvent::FileDone => break,
                e => panic!("unexpected event: {:?}", e),
            }
        }
        assert_eq!(b"lzma compressed payload".to_vec(), data);
    }

    #[test]
    fn test_xz_garbage_rejected() {
        let mut r = XzReader::new().unwrap();
        let mut input = &b"this is not xz data at all"[..];
        let mut data = Vec::new();
        let mut failed = false;
        for _ in 0..16 {
            match r.process(&mut input, &mut data, true) {
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
