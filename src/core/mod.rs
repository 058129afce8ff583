/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod com;
pub mod error;
pub mod fbuf;
pub mod file;
pub mod fntree;
pub mod pipe;
pub mod scheduler;

use std::cell::Cell;
use std::rc::Rc;

use com::{Com, OpDesc};
use scheduler::Scheduler;

/// Process-wide runtime configuration, resolved from the config file and the
/// command line at bootstrap.
pub struct CoreConf {
    pub verbose: bool,
    pub debug: bool,
    /// Worker threads for CPU-bound codec work (zstd encoder); 0 = default.
    pub workers: u32,
    /// Default I/O buffer size; 0 = per-subsystem default.
    pub buffer_size: usize,
}

impl Default for CoreConf {
    fn default() -> Self {
        CoreConf {
            verbose: false,
            debug: false,
            workers: 0,
            buffer_size: 0,
        }
    }
}

/// The process-wide context passed to every operation: scheduler, operation
/// manager and resolved configuration.  Replaces the original's global
/// state; nothing here is a static.
pub struct Core {
    pub sched: Scheduler,
    pub com: Com,
    pub conf: CoreConf,
    /// Standard output carries operation payload; route messages to stderr.
    pub stdout_busy: Cell<bool>,
}

impl Core {
    pub fn new(conf: CoreConf, registry: &'static [OpDesc]) -> Rc<Core> {
        Rc::new(Core {
            sched: Scheduler::new(),
            com: Com::new(registry),
            conf,
            stdout_busy: Cell::new(false),
        })
    }

    #[cfg(test)]
    pub fn new_for_tests() -> Rc<Core> {
        Core::new(CoreConf::default(), &[])
    }
}
