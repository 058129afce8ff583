/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `pic`: image conversion.  The BMP codec is native; other formats plug
//! in through the `PicCodec` seam.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use log::{error, info, warn};

use crate::arc::{get_u16le, get_u32le};
use crate::args::{self, GlobalOpts};
use crate::core::com::{CmdInfo, CreateResult, InputOrder, Op};
use crate::core::error::{Error, Result};
use crate::core::file::{FileConf, FileObj, OpenFlags, RState, WState};
use crate::core::scheduler::OpId;
use crate::core::Core;

#[derive(Parser, Debug)]
#[command(
    name = "pic",
    about = "Convert images (BMP built in; the codec interface accepts\n\
             external decoders).",
    disable_version_flag = true
)]
struct Opts {
    #[command(flatten)]
    g: GlobalOpts,

    /// Derive each output name from the input name and the output format
    #[arg(long)]
    autoname: bool,

    /// Output format (by default taken from the -o extension)
    #[arg(long, value_name = "FORMAT")]
    format: Option<String>,
}

/// Decoded raster: bottom-up RGB24 rows, 4-byte aligned like BMP stores
/// them, but held unpadded here.
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// RGB triplets, row 0 = top.
    pub rgb: Vec<u8>,
}

/// Image codec seam.  Concrete PNG/JPEG decoders are external
/// collaborators; only BMP ships built in.
pub trait PicCodec {
    fn name(&self) -> &'static str;
    fn matches_ext(&self, ext: &str) -> bool;
    fn decode(&self, data: &[u8]) -> Result<Image>;
    fn encode(&self, img: &Image) -> Result<Vec<u8>>;
}

pub struct BmpCodec;

fn row_stride(width: u32, bpp: u32) -> usize {
    (((width as usize * bpp as usize) + 31) / 32) * 4
}

impl PicCodec for BmpCodec {
    fn name(&self) -> &'static str {
        "bmp"
    }

    fn matches_ext(&self, ext: &str) -> bool {
        ext.eq_ignore_ascii_case("bmp")
    }

    fn decode(&self, data: &[u8]) -> Result<Image> {
        if data.len() < 54 || &data[..2] != b"BM" {
            return Err(Error::format("bmp: bad signature"));
        }
        let data_off = get_u32le(&data[10..]) as usize;
        let hsize = get_u32le(&data[14..]) as usize;
        if hsize < 40 {
            return Err(Error::format("bmp: unsupported header"));
        }
        let width = get_u32le(&data[18..]);
        let height_raw = get_u32le(&data[22..]) as i32;
        let top_down = height_raw < 0;
        let height = height_raw.unsigned_abs();
        let bpp = get_u16le(&data[28..]) as u32;
        let compression = get_u32le(&data[30..]);
        if compression != 0 || !(bpp == 24 || bpp == 32) {
            return Err(Error::format(format!(
                "bmp: unsupported format ({} bpp, compression {})",
                bpp, compression
            )));
        }
        let stride = row_stride(width, bpp);
        if data.len() < data_off + stride * height as usize {
            return Err(Error::format("bmp: truncated pixel data"));
        }

        let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            let src_y = if top_down { y } else { height - 1 - y };
            let row = &data[data_off + src_y as usize * stride..];
            for x in 0..width as usize {
                let p = &row[x * (bpp as usize / 8)..];
                // BGR(A) on disk
                rgb.extend_from_slice(&[p[2], p[1], p[0]]);
            }
        }
        Ok(Image { width, height, rgb })
    }

    fn encode(&self, img: &Image) -> Result<Vec<u8>> {
        let stride = row_stride(img.width, 24);
        let data_size = stride * img.height as usize;
        let file_size = 54 + data_size;
        let mut out = Vec::with_capacity(file_size);
        out.extend_from_slice(b"BM");
        out.extend_from_slice(&(file_size as u32).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&54u32.to_le_bytes());
        out.extend_from_slice(&40u32.to_le_bytes());
        out.extend_from_slice(&img.width.to_le_bytes());
        out.extend_from_slice(&img.height.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&24u16.to_le_bytes());
        out.extend_from_slice(&[0; 4]); // compression
        out.extend_from_slice(&(data_size as u32).to_le_bytes());
        out.extend_from_slice(&[0; 16]); // resolution, palette counts

        let row_bytes = img.width as usize * 3;
        for y in (0..img.height).rev() {
            let row = &img.rgb[y as usize * row_bytes..][..row_bytes];
            for px in row.chunks(3) {
                out.extend_from_slice(&[px[2], px[1], px[0]]);
            }
            out.extend(std::iter::repeat(0).take(stride - row_bytes));
        }
        Ok(out)
    }
}

fn codecs() -> Vec<Box<dyn PicCodec>> {
    vec![Box::new(BmpCodec)]
}

fn codec_for(ext: &str) -> Result<Box<dyn PicCodec>> {
    codecs()
        .into_iter()
        .find(|c| c.matches_ext(ext))
        .ok_or_else(|| Error::format(format!("no image codec for '.{}'", ext)))
}

fn ext_of(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or("")
}

pub struct PicOp {
    cmd: Option<Box<CmdInfo>>,
    id: OpId,
    stop: bool,
    autoname: bool,
    format: Option<String>,
    n_converted: u32,
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
    if cmd.output.is_none() && !opts.autoname {
        error!("please use --out FILE or --autoname");
        return Err((cmd, 1));
    }
    Ok(Rc::new(RefCell::new(PicOp {
        cmd: Some(cmd),
        id,
        stop: false,
        autoname: opts.autoname,
        format: opts.format,
        n_converted: 0,
    })))
}

impl PicOp {
    fn convert_one(&mut self, core: &Rc<Core>, in_name: &str) -> Result<()> {
        let cmd = self.cmd.as_ref().unwrap();

        let out_fmt = self
            .format
            .clone()
            .or_else(|| cmd.output.as_deref().map(|o| ext_of(o).to_string()))
            .ok_or_else(|| Error::argument("output format is not known"))?;
        let oname = if self.autoname {
            let stem = in_name.strip_suffix(&format!(".{}", ext_of(in_name))).unwrap_or(in_name);
            format!("{}.{}", stem, out_fmt)
        } else {
            cmd.output.clone().unwrap()
        };

        let dec = codec_for(ext_of(in_name))?;
        let enc = codec_for(&out_fmt)?;

        let mut f = FileObj::create(FileConf {
            buffer_size: cmd.buffer_size,
            ..FileConf::default()
        });
        f.open(in_name, OpenFlags::READ | OpenFlags::READAHEAD)?;
        let mut data = Vec::new();
        let mut buf = Vec::new();
        loop {
            match f.read(core, &mut buf, None)? {
                RState::Data => data.extend_from_slice(&buf),
                RState::Eof => break,
                RState::Async => return Err(Error::internal("unexpected suspension on input")),
            }
        }

        let img = dec.decode(&data)?;
        let encoded = enc.encode(&img)?;

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
        match out.write(core, &encoded, None)? {
            WState::Done => {}
            WState::Async => return Err(Error::internal("unexpected suspension on output")),
        }
        out.close(core);
        self.n_converted += 1;
        info!(
            "'{}' ({}) -> '{}' ({}, {}x{})",
            in_name,
            dec.name(),
            oname,
            enc.name(),
            img.width,
            img.height
        );
        Ok(())
    }
}

impl Op for PicOp {
    fn run(&mut self, core: &Rc<Core>) {
        let mut ok = true;
        let mut nfiles = 0u32;
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
                Ok(None) => {
                    if nfiles == 0 {
                        error!("no input files");
                        ok = false;
                    }
                    break;
                }
                Err(e) => {
                    error!("{}", e);
                    ok = false;
                    break;
                }
            };
            nfiles += 1;
            if let Err(e) = self.convert_one(core, &n.name) {
                if self.cmd.as_ref().unwrap().skip_errors {
                    warn!("{}", e);
                } else {
                    error!("{}", e);
                    ok = false;
                    break;
                }
            }
        }

        info!("converted {} images", self.n_converted);
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
    fn test_bmp_roundtrip_24bpp() {
        let img = Image {
            width: 2,
            height: 2,
            rgb: vec![
                255, 0, 0, 0, 255, 0, // top row: red, green
                0, 0, 255, 255, 255, 255, // bottom row: blue, white
            ],
        };
        let codec = BmpCodec;
        let data = codec.encode(&img).unwrap();
        let back = codec.decode(&data).unwrap();
        assert_eq!(2, back.width);
        assert_eq!(2, back.height);
        assert_eq!(img.rgb, back.rgb);
    }

    #[test]
    fn test_bmp_rejects_garbage() {
        assert!(BmpCodec.decode(b"not a bitmap").is_err());
    }

    #[test]
    fn test_codec_lookup() {
        assert!(codec_for("BMP").is_ok());
        assert!(codec_for("png").is_err());
    }
}
