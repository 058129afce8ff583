/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! zstd frame codec over the raw streaming interface.

use zstd::stream::raw::{CParameter, Decoder, Encoder, InBuffer, Operation, OutBuffer};

use crate::arc::ReadEvent;
use crate::core::error::{Error, Result};

const OUT_CHUNK: usize = 128 * 1024;

pub struct ZstReader {
    dec: Decoder<'static>,
    scratch: Vec<u8>,
    hint: usize,
}

impl ZstReader {
    pub fn new() -> Result<Self> {
        let dec = Decoder::new().map_err(|e| Error::format(format!("zstd: {}", e)))?;
        Ok(ZstReader {
            dec,
            scratch: vec![0; OUT_CHUNK],
            hint: 1,
        })
    }

    pub fn process(
        &mut self,
        input: &mut &[u8],
        output: &mut Vec<u8>,
        eof: bool,
    ) -> Result<ReadEvent> {
        if input.is_empty() {
            if eof {
                if self.hint != 0 {
                    return Err(Error::format("zstd: truncated stream"));
                }
                return Ok(ReadEvent::FileDone);
            }
            return Ok(ReadEvent::More);
        }

        let mut inb = InBuffer::around(input);
        let mut outb = OutBuffer::around(&mut self.scratch[..]);
        let hint = self
            .dec
            .run(&mut inb, &mut outb)
            .map_err(|e| Error::format(format!("zstd: {}", e)))?;
        self.hint = hint;
        let consumed = inb.pos();
        let produced = outb.pos();
        *input = &input[consumed..];
        output.extend_from_slice(&self.scratch[..produced]);

        if produced > 0 {
            Ok(ReadEvent::Data)
        } else if input.is_empty() && eof && self.hint == 0 {
            Ok(ReadEvent::FileDone)
        } else if input.is_empty() && eof {
            Err(Error::format("zstd: truncated stream"))
        } else {
            Ok(ReadEvent::More)
        }
    }
}

pub struct ZstWriter {
    enc: Encoder<'static>,
    scratch: Vec<u8>,
}

impl ZstWriter {
    /// `workers` > 0 enables the multi-threaded encoder.
    pub fn new(level: i32, workers: u32) -> Result<Self> {
        let mut enc = Encoder::new(level).map_err(|e| Error::format(format!("zstd: {}", e)))?;
        if workers > 0 {
            enc.set_parameter(CParameter::NbWorkers(workers))
                .map_err(|e| Error::format(format!("zstd workers: {}", e)))?;
        }
        Ok(ZstWriter {
            enc,
            scratch: vec![0; OUT_CHUNK],
        })
    }

    pub fn data(&mut self, mut input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        while !input.is_empty() {
            let mut inb = InBuffer::around(input);
            let mut outb = OutBuffer::around(&mut self.scratch[..]);
            self.enc
                .run(&mut inb, &mut outb)
                .map_err(|e| Error::format(format!("zstd: {}", e)))?;
            let consumed = inb.pos();
            let produced = outb.pos();
            input = &input[consumed..];
            output.extend_from_slice(&self.scratch[..produced]);
        }
        Ok(())
    }

    pub fn finish(&mut self, output: &mut Vec<u8>) -> Result<()> {
        loop {
            let mut outb = OutBuffer::around(&mut self.scratch[..]);
            let left = self
                .enc
                .finish(&mut outb, true)
                .map_err(|e| Error::format(format!("zstd: {}", e)))?;
            let produced = outb.pos();
            output.extend_from_slice(&self.scratch[..produced]);
            if left == 0 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zst_roundtrip() {
        let mut w = ZstWriter::new(3, 0).unwrap();
        let mut arch = Vec::new();
        let payload = vec![42u8; 100_000];
        w.data(&payload, &mut arch).unwrap();
        w.finish(&mut arch).unwrap();
        assert!(arch.len() < payload.len());

        let mut r = ZstReader::new().unwrap();
        let mut input = &arch[..];
        let mut data = Vec::new();
        loop {
            match r.process(&mut input, &mut data, true).unwrap() {
                ReadEvent::Data | ReadEvent::More => {}
                ReadEvent::FileDone => break,
                e => panic!("unexpected event: {:?}", e),
            }
        }
        assert_eq!(payload, data);
    }

    #[test]
    fn test_zst_truncated_detected() {
        let mut w = ZstWriter::new(3, 0).unwrap();
        let mut arch = Vec::new();
        w.data(b"some data to compress", &mut arch).unwrap();
        w.finish(&mut arch).unwrap();
        arch.truncate(arch.len() - 4);

        let mut r = ZstReader::new().unwrap();
        let mut input = &arch[..];
        let mut data = Vec::new();
        let mut failed = false;
        loop {
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
