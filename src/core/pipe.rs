/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;

use crate::core::scheduler::{OpId, Task};
use crate::core::Core;

const DEFAULT_CAP: usize = 256 * 1024;

/// Outcome of a single pipe read/write attempt.
pub enum PipeIo {
    /// Bytes transferred.
    Done(usize),
    /// Reader only: writer end closed and the buffer is drained.
    Eof,
    /// Buffer empty (read) or full (write); the caller's operation is
    /// re-posted when the other end makes progress.
    WouldBlock,
}

struct Inner {
    buf: VecDeque<u8>,
    cap: usize,
    writer_open: bool,
    reader_open: bool,
    read_waker: Option<OpId>,
    write_waker: Option<OpId>,
}

impl Inner {
    fn wake_reader(&mut self, core: &Core) {
        if let Some(id) = self.read_waker.take() {
            core.sched.post(Task::RunOp(id));
        }
    }

    fn wake_writer(&mut self, core: &Core) {
        if let Some(id) = self.write_waker.take() {
            core.sched.post(Task::RunOp(id));
        }
    }
}

/// In-memory byte pipe connecting two operations on the same event loop.
/// Used by `pack`/`unpack` to join a container writer with a compressor
/// without intermediate files.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let inner = Rc::new(RefCell::new(Inner {
        buf: VecDeque::new(),
        cap: DEFAULT_CAP,
        writer_open: true,
        reader_open: true,
        read_waker: None,
        write_waker: None,
    }));
    (
        PipeWriter {
            inner: inner.clone(),
        },
        PipeReader { inner },
    )
}

/// Cloning an end shares the same channel (the descriptor-duplication
/// analogue); `close` affects every clone.
#[derive(Clone)]
pub struct PipeReader {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Clone)]
pub struct PipeWriter {
    inner: Rc<RefCell<Inner>>,
}

impl PipeReader {
    /// `waker`: operation to re-post once data arrives.
    pub fn read(&self, core: &Core, dst: &mut [u8], waker: Option<OpId>) -> PipeIo {
        let mut p = self.inner.borrow_mut();
        if p.buf.is_empty() {
            if !p.writer_open {
                return PipeIo::Eof;
            }
            p.read_waker = waker;
            return PipeIo::WouldBlock;
        }
        let n = dst.len().min(p.buf.len());
        for (i, b) in p.buf.drain(..n).enumerate() {
            dst[i] = b;
        }
        p.wake_writer(core);
        PipeIo::Done(n)
    }

    pub fn close(&self, core: &Core) {
        let mut p = self.inner.borrow_mut();
        p.reader_open = false;
        debug!("pipe: reader closed");
        p.wake_writer(core);
    }
}

impl PipeWriter {
    pub fn write(&self, core: &Core, data: &[u8], waker: Option<OpId>) -> PipeIo {
        let mut p = self.inner.borrow_mut();
        if !p.reader_open {
            // writing into a closed pipe is a hard error for the writer
            return PipeIo::Eof;
        }
        let room = p.cap.saturating_sub(p.buf.len());
        if room == 0 {
            p.write_waker = waker;
            return PipeIo::WouldBlock;
        }
        let n = data.len().min(room);
        p.buf.extend(&data[..n]);
        p.wake_reader(core);
        PipeIo::Done(n)
    }

    /// Closing the write end lets the reader observe EOF.
    pub fn close(&self, core: &Core) {
        let mut p = self.inner.borrow_mut();
        p.writer_open = false;
        debug!("pipe: writer closed");
        p.wake_reader(core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip() {
        let core = Core::new_for_tests();
        let (w, r) = pipe();
        assert!(matches!(w.write(&core, b"abc", None), PipeIo::Done(3)));
        let mut buf = [0u8; 8];
        match r.read(&core, &mut buf, None) {
            PipeIo::Done(n) => assert_eq!(b"abc", &buf[..n]),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn test_read_empty_then_eof() {
        let core = Core::new_for_tests();
        let (w, r) = pipe();
        let mut buf = [0u8; 8];
        assert!(matches!(r.read(&core, &mut buf, None), PipeIo::WouldBlock));
        w.close(&core);
        assert!(matches!(r.read(&core, &mut buf, None), PipeIo::Eof));
    }

    #[test]
    fn test_writer_woken_by_drain() {
        let core = Core::new_for_tests();
        let (w, r) = pipe();
        w.inner.borrow_mut().cap = 4;
        assert!(matches!(w.write(&core, b"abcd", None), PipeIo::Done(4)));
        assert!(matches!(w.write(&core, b"e", Some(1)), PipeIo::WouldBlock));
        let mut buf = [0u8; 4];
        let _ = r.read(&core, &mut buf, None);
        // the blocked writer op must have been re-posted
        assert!(core.sched.has_queued_op(1));
    }
}
