/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `extract`: pull embedded binaries out of arbitrary files — gzip
//! streams found by signature, and icon images from .ico containers.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use log::{debug, error, info, warn};

use crate::arc::gz::GzReader;
use crate::arc::{get_u16le, get_u32le, ReadEvent};
use crate::args::{self, GlobalOpts};
use crate::core::com::{CmdInfo, CreateResult, InputOrder, Op};
use crate::core::error::{Error, Result};
use crate::core::file::{FileConf, FileObj, OpenFlags, RState, WState};
use crate::core::scheduler::OpId;
use crate::core::Core;

const MAX_INPUT: u64 = 1 << 30;

#[derive(Parser, Debug)]
#[command(
    name = "extract",
    about = "Extract embedded binaries: gzip streams by signature and\n\
             images from .ico files.",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,
}

pub struct ExtractOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    input: FileObj,
    n_extracted: u32,
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
    let fc = FileConf {
        buffer_size: cmd.buffer_size,
        ..FileConf::default()
    };
    Ok(Rc::new(RefCell::new(ExtractOp {
        cmd: Some(cmd),
        id,
        stop: false,
        input: FileObj::create(fc),
        n_extracted: 0,
    })))
}

/// One found blob.
struct Found {
    label: String,
    ext: &'static str,
    data: Vec<u8>,
}

/// Decode a gzip stream starting at `data`; returns the decompressed
/// payload and the header name if the stream is intact.
fn try_gzip(data: &[u8]) -> Option<(Vec<u8>, String)> {
    let mut r = GzReader::new();
    let mut input = data;
    let mut out = Vec::new();
    let mut name = String::new();
    loop {
        let mut chunk = Vec::new();
        match r.process(&mut input, &mut chunk, true) {
            Ok(ReadEvent::FileHeader) => name = r.entry().name.clone(),
            Ok(ReadEvent::Data) => out.extend_from_slice(&chunk),
            Ok(ReadEvent::FileDone) | Ok(ReadEvent::Done) => return Some((out, name)),
            Ok(ReadEvent::More) => return None,
            Ok(ReadEvent::Seek(_)) | Err(_) => return None,
        }
    }
}

fn scan_gzip(data: &[u8], found: &mut Vec<Found>) {
    let mut at = 0;
    while at + 10 < data.len() {
        if data[at] == 0x1f && data[at + 1] == 0x8b && data[at + 2] == 8 {
            if let Some((payload, name)) = try_gzip(&data[at..]) {
                debug!("gzip stream at {:#x}: {} bytes", at, payload.len());
                let label = if name.is_empty() {
                    format!("{:08x}", at)
                } else {
                    name
                };
                found.push(Found {
                    label,
                    ext: "bin",
                    data: payload,
                });
                at += 10;
                continue;
            }
        }
        at += 1;
    }
}

/// Row stride rounded up to 4 bytes.
fn stride(width: u32, bpp: u32) -> usize {
    (((width as usize * bpp as usize) + 31) / 32) * 4
}

/// Rebuild a standalone .bmp from an ICO directory entry's DIB.
fn dib_to_bmp(dib: &[u8]) -> Option<Vec<u8>> {
    if dib.len() < 40 {
        return None;
    }
    let hsize = get_u32le(dib) as usize;
    if hsize != 40 {
        return None; // only BITMAPINFOHEADER frames
    }
    let width = get_u32le(&dib[4..]);
    let dheight = get_u32le(&dib[8..]);
    let bpp = get_u16le(&dib[14..]) as u32;
    let compression = get_u32le(&dib[16..]);
    if compression != 0 || dheight % 2 != 0 {
        return None;
    }
    let height = dheight / 2; // the DIB stores image + AND mask rows
    let colors = if bpp <= 8 {
        let c = get_u32le(&dib[32..]);
        if c == 0 {
            1usize << bpp
        } else {
            c as usize
        }
    } else {
        0
    };
    let palette = colors * 4;
    let xor_size = stride(width, bpp) * height as usize;
    if dib.len() < hsize + palette + xor_size {
        return None;
    }

    let data_off = 14 + hsize + palette;
    let file_size = data_off + xor_size;
    let mut out = Vec::with_capacity(file_size);
    out.extend_from_slice(b"BM");
    out.extend_from_slice(&(file_size as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&(data_off as u32).to_le_bytes());
    // header with the mask rows removed from the height
    out.extend_from_slice(&dib[..8]);
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&dib[12..hsize]);
    out.extend_from_slice(&dib[hsize..hsize + palette + xor_size]);
    Some(out)
}

fn scan_ico(data: &[u8], found: &mut Vec<Found>) {
    if data.len() < 6 || get_u16le(data) != 0 || get_u16le(&data[2..]) != 1 {
        return;
    }
    let count = get_u16le(&data[4..]) as usize;
    for i in 0..count {
        let at = 6 + i * 16;
        if at + 16 > data.len() {
            break;
        }
        let size = get_u32le(&data[at + 8..]) as usize;
        let off = get_u32le(&data[at + 12..]) as usize;
        if off + size > data.len() {
            warn!("ico: image #{} out of bounds", i);
            continue;
        }
        let blob = &data[off..off + size];
        if blob.starts_with(&[0x89, b'P', b'N', b'G']) {
            found.push(Found {
                label: format!("icon{}", i),
                ext: "png",
                data: blob.to_vec(),
            });
        } else if let Some(bmp) = dib_to_bmp(blob) {
            found.push(Found {
                label: format!("icon{}", i),
                ext: "bmp",
                data: bmp,
            });
        } else {
            warn!("ico: image #{}: unsupported frame format", i);
        }
    }
}

impl ExtractOp {
    fn read_whole(&mut self, core: &Rc<Core>, name: &str) -> Result<Vec<u8>> {
        self.input.open(name, OpenFlags::READ | OpenFlags::READAHEAD)?;
        let md = self.input.info()?;
        if md.len() > MAX_INPUT {
            return Err(Error::format(format!("'{}': input too large", name)));
        }
        let mut all = Vec::with_capacity(md.len() as usize);
        let mut buf = Vec::new();
        loop {
            match self.input.read(core, &mut buf, None)? {
                RState::Data => all.extend_from_slice(&buf),
                RState::Eof => break,
                RState::Async => {
                    return Err(Error::internal("unexpected suspension on input"))
                }
            }
        }
        Ok(all)
    }

    fn write_found(&mut self, core: &Rc<Core>, src: &str, found: Vec<Found>) -> Result<()> {
        let cmd = self.cmd.as_ref().unwrap();
        let stem = src.rsplit('/').next().unwrap_or(src);
        for f in found {
            let name = format!("{}.{}.{}", stem, f.label, f.ext);
            let oname = match cmd.chdir.as_deref() {
                Some(d) => format!("{}/{}", d, name),
                None => name,
            };
            let mut out = FileObj::create(FileConf {
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
            if cmd.test {
                flags |= OpenFlags::FAKEWRITE;
            }
            out.open(&oname, flags)?;
            match out.write(core, &f.data, None)? {
                WState::Done => {}
                WState::Async => {
                    return Err(Error::internal("unexpected suspension on output"))
                }
            }
            out.close(core);
            self.n_extracted += 1;
            info!("extracted: {} ({} bytes)", oname, f.data.len());
        }
        Ok(())
    }
}

impl Op for ExtractOp {
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

            let r = (|| -> Result<()> {
                let data = self.read_whole(core, &n.name)?;
                let mut found = Vec::new();
                scan_ico(&data, &mut found);
                if found.is_empty() {
                    scan_gzip(&data, &mut found);
                }
                if found.is_empty() {
                    info!("{}: nothing found", n.name);
                    return Ok(());
                }
                self.write_found(core, &n.name, found)
            })();
            if let Err(e) = r {
                let skip = self.cmd.as_ref().unwrap().skip_errors;
                if skip {
                    warn!("{}", e);
                } else {
                    error!("{}", e);
                    ok = false;
                    break;
                }
            }
        }

        info!("extracted {} objects", self.n_extracted);
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
    use crate::arc::gz::GzWriter;
    use std::time::SystemTime;

    #[test]
    fn test_scan_gzip_embedded() {
        let mut w = GzWriter::new(6, "inner.txt", SystemTime::UNIX_EPOCH);
        let mut gz = Vec::new();
        w.data(b"embedded payload", &mut gz).unwrap();
        w.finish(&mut gz).unwrap();

        let mut host = b"JUNKJUNK".to_vec();
        host.extend_from_slice(&gz);
        host.extend_from_slice(b"TRAILER");

        let mut found = Vec::new();
        scan_gzip(&host, &mut found);
        assert_eq!(1, found.len());
        assert_eq!("inner.txt", found[0].label);
        assert_eq!(b"embedded payload".to_vec(), found[0].data);
    }

    #[test]
    fn test_scan_ico_png_frame() {
        // ICONDIR with one PNG entry
        let png = [0x89u8, b'P', b'N', b'G', 13, 10, 26, 10, 1, 2, 3];
        let mut ico = Vec::new();
        ico.extend_from_slice(&[0, 0, 1, 0, 1, 0]); // reserved, type=1, count=1
        ico.extend_from_slice(&[16, 16, 0, 0, 1, 0, 32, 0]); // w,h,colors,res,planes,bpp
        ico.extend_from_slice(&(png.len() as u32).to_le_bytes());
        ico.extend_from_slice(&(22u32).to_le_bytes()); // offset right after the directory
        ico.extend_from_slice(&png);

        let mut found = Vec::new();
        scan_ico(&ico, &mut found);
        assert_eq!(1, found.len());
        assert_eq!("png", found[0].ext);
        assert_eq!(png.to_vec(), found[0].data);
    }

    #[test]
    fn test_dib_to_bmp_height_halved() {
        // 1x2 DIB (image row + mask row), 32 bpp
        let mut dib = vec![0u8; 40];
        dib[0] = 40; // header size
        dib[4..8].copy_from_slice(&1u32.to_le_bytes()); // width
        dib[8..12].copy_from_slice(&2u32.to_le_bytes()); // doubled height
        dib[12] = 1; // planes
        dib[14] = 32; // bpp
        dib.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xff]); // one pixel
        dib.extend_from_slice(&[0, 0, 0, 0]); // mask row
        let bmp = dib_to_bmp(&dib).unwrap();
        assert_eq!(b"BM", &bmp[..2]);
        // height in the output header is 1
        assert_eq!(1, get_u32le(&bmp[14 + 8..]));
        assert_eq!(14 + 40 + 4, bmp.len());
    }
}
