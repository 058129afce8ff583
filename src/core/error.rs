/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{ctx}: {source}")]
    System { ctx: String, source: io::Error },
    #[error("{0}")]
    Format(String),
    #[error("{0}")]
    Argument(String),
    #[error("not found: '{0}'")]
    NotFound(String),
    #[error("already exists: '{0}'")]
    Exists(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn system(ctx: impl Into<String>, source: io::Error) -> Self {
        Error::System {
            ctx: ctx.into(),
            source,
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        Error::Argument(msg.into())
    }

    /// Invariant violation.  Panics in debug builds, surfaces as an error in
    /// release builds.
    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug_assert!(false, "{}", msg);
        Error::Internal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_error_context() {
        let e = Error::system("file open: 'a.bin'", io::Error::from_raw_os_error(2));
        let s = e.to_string();
        assert!(s.starts_with("file open: 'a.bin': "), "{}", s);
    }
}
