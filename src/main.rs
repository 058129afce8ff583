/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, LevelFilter};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;

mod arc;
mod args;
mod config;
mod core;
mod crypto;
mod ops;
mod pipeline;
mod sync;

use crate::core::com::{CmdInfo, SIG_STOP};
use crate::core::{Core, CoreConf};

const VERSION: &str = env!("CARGO_PKG_VERSION");

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn init_logging(verbose: bool, debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else if verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("fcom: {h({l})}: {m}{n}")))
        .build();
    let cfg = log4rs::config::Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .expect("logging config");
    log4rs::init_config(cfg).expect("logging init");
}

fn short_usage() {
    println!("fcom v{} (linux)", VERSION);
    println!(
        "General usage:\n\n  \
         fcom [GLOBAL-OPTIONS] OPERATION [INPUT...] [-o OUTPUT] [OPTIONS]\n\n\
         Run `fcom OPERATION -h` for operation options.\n\n\
         Operations:"
    );
    for d in ops::REGISTRY {
        println!("  {}", d.name);
    }
}

fn run() -> i32 {
    let mut argv: Vec<String> = std::env::args().skip(1).collect();

    let verbose = argv.iter().any(|a| a == "-V" || a == "--verbose");
    let debug = argv.iter().any(|a| a == "-D" || a == "--debug");
    argv.retain(|a| a != "-V" && a != "--verbose" && a != "-D" && a != "--debug");
    init_logging(verbose, debug);

    if argv.is_empty() || argv[0] == "-h" || argv[0] == "--help" {
        short_usage();
        return 0;
    }
    if argv[0].starts_with('-') {
        log::error!("unknown option: {}", argv[0]);
        return 1;
    }

    let fcfg = match config::load() {
        Ok(c) => c,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };

    let conf = CoreConf {
        verbose,
        debug,
        workers: fcfg.workers,
        buffer_size: fcfg.buffer_size,
    };
    let core = Core::new(conf, ops::REGISTRY);

    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    let stop_timer = core.sched.new_timer();
    core.sched.timer_set(stop_timer, 200, |core| {
        if STOP.swap(false, Ordering::Relaxed) {
            debug!("interrupt: signalling all operations");
            core.com.signal_all(SIG_STOP);
        }
    });

    let mut cmd = CmdInfo::new();
    cmd.operation = argv[0].clone();
    cmd.argv = argv[1..].to_vec();
    if core.com.run(&core, cmd).is_err() {
        return core.sched.exit_code().unwrap_or(1);
    }

    core.sched.run(&core)
}

fn main() {
    std::process::exit(run());
}
