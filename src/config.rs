/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Persisted configuration: `~/.config/fcom/fcom.toml` (override with
//! `$FCOM_CONFIG`).  Command-line options win over file values.

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

#[derive(Serialize, Deserialize, Default, Debug)]
#[serde(default)]
pub struct Config {
    /// Code page for archive member names without a Unicode flag:
    /// "utf8" or "latin1".
    pub codepage: String,
    /// Worker threads for CPU-bound codec work (0 = codec default).
    pub workers: u32,
    /// Default I/O buffer size in bytes (0 = built-in default).
    pub buffer_size: usize,
}

fn config_path() -> Option<std::path::PathBuf> {
    if let Ok(p) = std::env::var("FCOM_CONFIG") {
        return Some(p.into());
    }
    let home = std::env::var("HOME").ok()?;
    Some(std::path::PathBuf::from(home).join(".config/fcom/fcom.toml"))
}

/// Load the config file; a missing file yields the defaults.
pub fn load() -> Result<Config> {
    let Some(path) = config_path() else {
        return Ok(Config::default());
    };
    let data = match std::fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => {
            return Err(Error::system(
                format!("config read: '{}'", path.display()),
                e,
            ))
        }
    };
    toml::from_str(&data)
        .map_err(|e| Error::format(format!("config '{}': {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse() {
        let c: Config = toml::from_str("codepage = \"latin1\"\nworkers = 4\n").unwrap();
        assert_eq!("latin1", c.codepage);
        assert_eq!(4, c.workers);
        assert_eq!(0, c.buffer_size);
    }

    #[test]
    fn test_config_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(0, c.workers);
    }
}
