/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Operation implementations and the name → operation registry.

pub mod arc_read;
pub mod arc_write;
pub mod copy;
pub mod extract;
pub mod mv;
pub mod pack;
pub mod pic;
pub mod sync;
pub mod textcount;
pub mod trash;
pub mod unpack;
pub mod unstream;

use crate::core::com::OpDesc;

pub static REGISTRY: &[OpDesc] = &[
    OpDesc {
        name: "copy",
        create: copy::create,
    },
    OpDesc {
        name: "move",
        create: mv::create,
    },
    OpDesc {
        name: "trash",
        create: trash::create,
    },
    OpDesc {
        name: "textcount",
        create: textcount::create,
    },
    OpDesc {
        name: "extract",
        create: extract::create,
    },
    OpDesc {
        name: "pic",
        create: pic::create,
    },
    OpDesc {
        name: "pack",
        create: pack::create,
    },
    OpDesc {
        name: "unpack",
        create: unpack::create,
    },
    OpDesc {
        name: "sync",
        create: sync::create,
    },
    OpDesc {
        name: "tar",
        create: arc_write::create_tar,
    },
    OpDesc {
        name: "zip",
        create: arc_write::create_zip,
    },
    OpDesc {
        name: "gz",
        create: arc_write::create_gz,
    },
    OpDesc {
        name: "zst",
        create: arc_write::create_zst,
    },
    OpDesc {
        name: "iso",
        create: arc_write::create_iso,
    },
    OpDesc {
        name: "untar",
        create: arc_read::create_untar,
    },
    OpDesc {
        name: "unzip",
        create: arc_read::create_unzip,
    },
    OpDesc {
        name: "ungz",
        create: unstream::create_ungz,
    },
    OpDesc {
        name: "unzst",
        create: unstream::create_unzst,
    },
    OpDesc {
        name: "unxz",
        create: unstream::create_unxz,
    },
    OpDesc {
        name: "un7z",
        create: arc_read::create_un7z,
    },
    OpDesc {
        name: "uniso",
        create: arc_read::create_uniso,
    },
];

/// Build an output file name from `-o`/`-C` and the input name.
///
/// * `file -o out`          : "file" -> "out"
/// * `file -C odir -o name` : "file" -> "odir/name"
/// * `file -C odir`         : "file" -> "odir/file"
/// * `dir -C odir`          : "dir/file" -> "odir/dir/file" (base = "dir")
pub fn out_name(
    output: Option<&str>,
    chdir: Option<&str>,
    in_name: &str,
    base: Option<&str>,
) -> Option<String> {
    match (output, chdir) {
        (Some(o), None) => Some(o.to_string()),
        (Some(o), Some(c)) => Some(format!("{}/{}", c, o)),
        (None, Some(c)) => {
            let base = base.unwrap_or(in_name);
            let pos = base.rfind('/').map(|i| i + 1).unwrap_or(0);
            Some(format!("{}/{}", c, &in_name[pos.min(in_name.len())..]))
        }
        (None, None) => None,
    }
}

/// Sanitize an archive member name for extraction: reject absolute paths
/// and parent references.
pub fn safe_member_path(name: &str) -> Option<String> {
    let name = name.trim_start_matches('/');
    let mut parts = Vec::new();
    for p in name.split('/') {
        match p {
            "" | "." => {}
            ".." => return None,
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_name_rules() {
        assert_eq!(Some("out".into()), out_name(Some("out"), None, "file", None));
        assert_eq!(
            Some("odir/name".into()),
            out_name(Some("name"), Some("odir"), "file", None)
        );
        assert_eq!(
            Some("odir/file".into()),
            out_name(None, Some("odir"), "file", None)
        );
        assert_eq!(
            Some("odir/dir/file".into()),
            out_name(None, Some("odir"), "/tmp/dir/file", Some("/tmp/dir"))
        );
        assert_eq!(None, out_name(None, None, "file", None));
    }

    #[test]
    fn test_safe_member_path() {
        assert_eq!(Some("a/b".to_string()), safe_member_path("/a//./b"));
        assert_eq!(None, safe_member_path("a/../b"));
        assert_eq!(None, safe_member_path("/"));
    }
}
