/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Global command-line option set, shared by every operation and merged
//! with the per-operation options at parse time.

use std::rc::Rc;

use clap::Parser;
use log::error;

use crate::core::com::{compile_patterns, CmdInfo};
use crate::core::error::{Error, Result};
use crate::core::Core;

#[derive(clap::Args, Debug, Default)]
pub struct GlobalOpts {
    /// Recursively process directories
    #[arg(short = 'R', long = "Recursive")]
    pub recursive: bool,

    /// Only process files matching this wildcard (repeatable)
    #[arg(short = 'I', long = "Include", value_name = "WILDCARD")]
    pub include: Vec<String>,

    /// Skip files matching this wildcard (repeatable)
    #[arg(short = 'E', long = "Exclude", value_name = "WILDCARD")]
    pub exclude: Vec<String>,

    /// Output directory
    #[arg(short = 'C', long = "chdir", value_name = "DIR")]
    pub chdir: Option<String>,

    /// Output file name ("STDOUT" writes to standard output)
    #[arg(short = 'o', long = "out", value_name = "PATH")]
    pub output: Option<String>,

    /// Overwrite existing output files
    #[arg(short = 'f', long = "overwrite")]
    pub overwrite: bool,

    /// Dry run: no on-disk output is produced
    #[arg(short = 'T', long = "test")]
    pub test: bool,

    /// I/O buffer size, with optional k/m suffix
    #[arg(long = "buffer", value_name = "N")]
    pub buffer: Option<String>,

    /// Bypass the kernel page cache
    #[arg(long)]
    pub directio: bool,

    /// Disable output file preallocation
    #[arg(long = "no-prealloc")]
    pub no_prealloc: bool,

    /// Continue after per-entry failures
    #[arg(short = 'k', long = "skip-errors")]
    pub skip_errors: bool,

    /// Input files; `@FILE` reads names from FILE, `@` alone from stdin
    #[arg(value_name = "INPUT")]
    pub input: Vec<String>,
}

pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let (num, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let n: usize = num
        .parse()
        .map_err(|_| Error::argument(format!("--buffer: incorrect value '{}'", s)))?;
    if n == 0 {
        return Err(Error::argument("--buffer: incorrect value"));
    }
    Ok(n * mult)
}

/// Merge parsed global options into the operation descriptor.  Fields set
/// programmatically by a parent operation are preserved: flags only turn
/// on, lists append.
pub fn apply_global(core: &Rc<Core>, cmd: &mut CmdInfo, g: GlobalOpts) -> Result<()> {
    for s in g.input {
        if s.is_empty() {
            cmd.stdin = true;
        } else if let Some(rest) = s.strip_prefix('@') {
            if cmd.input_list.is_some() {
                return Err(Error::argument(
                    "only one '@' notation for input files is supported",
                ));
            }
            cmd.input_list = Some(rest.to_string());
        } else {
            cmd.input.push(s);
        }
    }

    cmd.include.extend(compile_patterns(&g.include)?);
    cmd.exclude.extend(compile_patterns(&g.exclude)?);

    if let Some(out) = g.output {
        if out == "STDOUT" {
            cmd.stdout = true;
            core.stdout_busy.set(true);
        } else {
            cmd.output = Some(out);
        }
    }
    if let Some(dir) = g.chdir {
        cmd.chdir = Some(dir);
    }
    if let Some(b) = g.buffer {
        cmd.buffer_size = parse_size(&b)?;
    } else if cmd.buffer_size == 0 {
        cmd.buffer_size = core.conf.buffer_size;
    }

    cmd.recursive |= g.recursive;
    cmd.overwrite |= g.overwrite;
    cmd.test |= g.test;
    cmd.directio |= g.directio;
    cmd.no_prealloc |= g.no_prealloc;
    cmd.skip_errors |= g.skip_errors;
    Ok(())
}

/// Parse an operation's argv with its clap definition.  Returns the exit
/// code to complete with when parsing itself settled the operation
/// (`--help`) or failed.
pub fn parse_op<T: Parser>(cmd: &CmdInfo) -> std::result::Result<T, i32> {
    let it = std::iter::once(cmd.operation.clone()).chain(cmd.argv.iter().cloned());
    match T::try_parse_from(it) {
        Ok(t) => Ok(t),
        Err(e) => {
            use clap::error::ErrorKind;
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = e.print();
                    Err(0)
                }
                _ => {
                    error!("command-line: {}", e);
                    Err(1)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(512, parse_size("512").unwrap());
        assert_eq!(8 * 1024, parse_size("8k").unwrap());
        assert_eq!(2 * 1024 * 1024, parse_size("2M").unwrap());
        assert!(parse_size("0").is_err());
        assert!(parse_size("x").is_err());
    }

    #[test]
    fn test_apply_global_inputs() {
        let core = Core::new_for_tests();
        let mut cmd = CmdInfo::new();
        let g = GlobalOpts {
            input: vec!["a".into(), "@names.txt".into(), "".into()],
            ..GlobalOpts::default()
        };
        apply_global(&core, &mut cmd, g).unwrap();
        assert_eq!(vec!["a"], cmd.input);
        assert_eq!(Some("names.txt".to_string()), cmd.input_list);
        assert!(cmd.stdin);
    }

    #[test]
    fn test_apply_global_stdout() {
        let core = Core::new_for_tests();
        let mut cmd = CmdInfo::new();
        let g = GlobalOpts {
            output: Some("STDOUT".into()),
            ..GlobalOpts::default()
        };
        apply_global(&core, &mut cmd, g).unwrap();
        assert!(cmd.stdout);
        assert_eq!(None, cmd.output);
        assert!(core.stdout_busy.get());
    }
}
