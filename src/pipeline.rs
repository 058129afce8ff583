/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Filter pipeline kernel: a dynamic chain of producer/transformer/consumer
//! stages with a bidirectional cursor.  Stage return codes steer the
//! scheduler: produce data, request more input, finish, split the chain, or
//! suspend the whole operation.

use std::rc::Rc;

use bitflags::bitflags;
use log::{debug, error};

use crate::core::Core;

/// Result of `Stage::open`.
pub enum OpenResult {
    Ok,
    /// Stage is inert for this run; it is treated as immediately done and
    /// never processed or closed.
    Skip,
    Err,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StepResult {
    /// `output` holds produced data for the next stage.
    Data,
    /// Need more input; `output` is empty.
    More,
    /// Need more input, and keep `output` as the upstream stage's input.
    Back,
    /// This stage finished producing.
    Done,
    /// This stage and all upstream stages finished.
    OutputDone,
    /// Downstream stages must finish their current batch before this stage
    /// continues.
    NextDone,
    /// Waiting for an external event; the operation re-enters later.
    Async,
    /// Terminate the whole chain successfully.
    Fin,
    Err,
    /// Fatal; the OS error has already been captured in the log.
    SysErr,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct StageFlags: u32 {
        /// The caller just pushed input forward.
        const FWD = 1;
        /// This stage is currently the first not-yet-done stage.
        const FIRST = 2;
        /// This stage is currently the last stage in the chain.
        const LAST = 4;
    }
}

/// Data window passed to each stage invocation.
pub struct StageCmd {
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub flags: StageFlags,
    /// Filters the stage asks to insert; the kernel applies them as soon as
    /// the stage returns (the chain-mutation control surface).
    pub adds: Vec<(AddPos, String, Box<dyn Stage>)>,
}

impl StageCmd {
    /// Request a filter insertion relative to the current cursor.
    pub fn add_filter(&mut self, pos: AddPos, name: impl Into<String>, stage: Box<dyn Stage>) {
        self.adds.push((pos, name.into(), stage));
    }
}

pub trait Stage {
    fn open(&mut self, _core: &Rc<Core>, _cmd: &mut StageCmd) -> OpenResult {
        OpenResult::Ok
    }
    fn process(&mut self, core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult;
    fn close(&mut self, _core: &Rc<Core>, _cmd: &mut StageCmd) {}
}

/// Placement of a stage added at run time, relative to the cursor.
pub enum AddPos {
    /// Immediately after the current stage.
    AfterCur,
    /// Immediately before the current stage.
    BeforeCur,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRun {
    /// All stages finished; the chain is closed.
    Done,
    /// A stage returned `Async`; re-enter `run` later.
    Async,
    Err,
}

struct Slot {
    name: String,
    stage: Box<dyn Stage>,
    seq: u32,
    opened: bool,
    done: bool,
    done_prev: bool,
    data_empty: bool,
}

/// The ordered stage chain of one operation.
pub struct Chain {
    slots: Vec<Slot>,
    /// Upstream half stored during a NEXTDONE split.
    stored: Option<Vec<Slot>>,
    cur: usize,
    cmd: StageCmd,
    next_seq: u32,
    /// Stage names in close order; drives the close-order invariant checks.
    closed_log: Vec<String>,
    finished: bool,
}

impl Chain {
    pub fn new() -> Self {
        Chain {
            slots: Vec::new(),
            stored: None,
            cur: 0,
            cmd: StageCmd {
                input: Vec::new(),
                output: Vec::new(),
                flags: StageFlags::FWD,
                adds: Vec::new(),
            },
            next_seq: 0,
            closed_log: Vec::new(),
            finished: false,
        }
    }

    pub fn add(&mut self, pos: AddPos, name: impl Into<String>, stage: Box<dyn Stage>) {
        let slot = Slot {
            name: name.into(),
            stage,
            seq: self.next_seq,
            opened: false,
            done: false,
            done_prev: false,
            data_empty: false,
        };
        self.next_seq += 1;
        let at = match pos {
            AddPos::Last => self.slots.len(),
            AddPos::AfterCur => (self.cur + 1).min(self.slots.len()),
            AddPos::BeforeCur => self.cur,
        };
        self.slots.insert(at, slot);
        if matches!(pos, AddPos::BeforeCur) {
            self.cur += 1;
        }
        debug!("chain: {}", self.topology());
    }

    fn topology(&self) -> String {
        let names: Vec<&str> = self.slots.iter().map(|s| s.name.as_str()).collect();
        names.join(" -> ")
    }

    pub fn closed_order(&self) -> &[String] {
        &self.closed_log
    }

    fn close_slot(core: &Rc<Core>, cmd: &mut StageCmd, log: &mut Vec<String>, mut slot: Slot) {
        if slot.opened {
            debug!("closing {}", slot.name);
            slot.stage.close(core, cmd);
            log.push(slot.name);
        }
    }

    fn close_all(&mut self, core: &Rc<Core>) {
        let mut rest: Vec<Slot> = self.slots.drain(..).collect();
        if let Some(st) = self.stored.take() {
            rest.extend(st);
        }
        // reverse attachment order
        rest.sort_by(|a, b| b.seq.cmp(&a.seq));
        for slot in rest {
            Self::close_slot(core, &mut self.cmd, &mut self.closed_log, slot);
        }
        self.finished = true;
    }

    fn is_first(&self, at: usize) -> bool {
        self.slots[..at].iter().all(|s| s.done)
    }

    /// Drive the chain until it completes, fails, or suspends.
    pub fn run(&mut self, core: &Rc<Core>) -> ChainRun {
        if self.finished {
            return ChainRun::Done;
        }
        loop {
            if self.slots.is_empty() {
                self.close_all(core);
                return ChainRun::Done;
            }
            debug_assert!(self.cur < self.slots.len());

            self.cmd.flags.remove(StageFlags::FIRST | StageFlags::LAST);
            if self.is_first(self.cur) {
                self.cmd.flags |= StageFlags::FIRST;
            }
            if self.cur + 1 == self.slots.len() {
                self.cmd.flags |= StageFlags::LAST;
            }

            let slot = &mut self.slots[self.cur];
            if !slot.opened {
                debug!("creating context for {}", slot.name);
                match slot.stage.open(core, &mut self.cmd) {
                    OpenResult::Ok => slot.opened = true,
                    OpenResult::Skip => {
                        debug!("{} is skipped", slot.name);
                        if self.handle_done(core, false) {
                            continue;
                        }
                        if self.slots.is_empty() && self.stored.is_none() {
                            self.close_all(core);
                            return ChainRun::Done;
                        }
                        continue;
                    }
                    OpenResult::Err => {
                        self.close_all(core);
                        return ChainRun::Err;
                    }
                }
            }

            let slot = &mut self.slots[self.cur];
            debug!(
                "{} calling {}, input:{} flags:{:?}",
                if self.cmd.flags.contains(StageFlags::FWD) {
                    ">>"
                } else {
                    "<<"
                },
                slot.name,
                self.cmd.input.len(),
                self.cmd.flags
            );
            let r = slot.stage.process(core, &mut self.cmd);
            debug!("  {} returned {:?}, output:{}", slot.name, r, self.cmd.output.len());

            let adds: Vec<_> = self.cmd.adds.drain(..).collect();
            for (pos, name, stage) in adds {
                self.add(pos, name, stage);
            }
            let is_last = self.cur + 1 == self.slots.len();

            match r {
                StepResult::Data => {
                    let slot = &mut self.slots[self.cur];
                    if slot.data_empty && self.cmd.output.is_empty() {
                        error!("filter {}: keeps returning empty data", slot.name);
                        self.close_all(core);
                        return ChainRun::Err;
                    }
                    slot.data_empty = self.cmd.output.is_empty();
                    if is_last {
                        error!("the last filter {} returned data", slot.name);
                        self.close_all(core);
                        return ChainRun::Err;
                    }
                    self.shift_next();
                }

                StepResult::Done => {
                    if self.handle_done(core, true) {
                        continue;
                    }
                }

                StepResult::OutputDone => {
                    if is_last {
                        self.close_all(core);
                        return ChainRun::Done;
                    }
                    let slot = &mut self.slots[self.cur];
                    slot.done = true;
                    slot.done_prev = true;
                    self.shift_next();
                }

                StepResult::NextDone => {
                    if self.stored.is_some() {
                        error!(
                            "filter {}: nested chain split is not supported",
                            self.slots[self.cur].name
                        );
                        self.close_all(core);
                        return ChainRun::Err;
                    }
                    if is_last {
                        error!(
                            "filter {}: chain split with no downstream",
                            self.slots[self.cur].name
                        );
                        self.close_all(core);
                        return ChainRun::Err;
                    }
                    let front: Vec<Slot> = self.slots.drain(..=self.cur).collect();
                    self.stored = Some(front);
                    self.cur = 0;
                    self.cmd.input = std::mem::take(&mut self.cmd.output);
                    self.cmd.flags |= StageFlags::FWD;
                    debug!("chain split: {}", self.topology());
                }

                StepResult::More => {
                    debug_assert!(self.cmd.output.is_empty());
                    if !self.shift_prev(core, false) {
                        return ChainRun::Err;
                    }
                }

                StepResult::Back => {
                    if !self.shift_prev(core, true) {
                        return ChainRun::Err;
                    }
                }

                StepResult::Async => return ChainRun::Async,

                StepResult::Fin => {
                    self.close_all(core);
                    return ChainRun::Done;
                }

                StepResult::Err | StepResult::SysErr => {
                    self.close_all(core);
                    return ChainRun::Err;
                }
            }

            if self.slots.is_empty() {
                if self.rejoin() {
                    continue;
                }
                self.close_all(core);
                return ChainRun::Done;
            }
        }
    }

    /// Restore the stored upstream half after the downstream half of a
    /// NEXTDONE split has drained.
    fn rejoin(&mut self) -> bool {
        let Some(front) = self.stored.take() else {
            return false;
        };
        self.slots = front;
        self.cur = self.slots.len() - 1;
        self.cmd.input.clear();
        self.cmd.flags.remove(StageFlags::FWD);
        debug!("chain rejoined: {}", self.topology());
        true
    }

    /// Handle a DONE result (or a SKIP open, with `close_it` = false).
    /// Returns true when the caller should continue the main loop.
    fn handle_done(&mut self, core: &Rc<Core>, close_it: bool) -> bool {
        if self.cur + 1 == self.slots.len() {
            let slot = self.slots.remove(self.cur);
            if close_it {
                Self::close_slot(core, &mut self.cmd, &mut self.closed_log, slot);
            }
            if self.slots.is_empty() {
                return self.rejoin();
            }
            // bounce to the previous stage and ask it for more
            self.cur = self.slots.len() - 1;
            match self.arrive_back(core) {
                Arrive::Empty => self.rejoin(),
                Arrive::Forwarded => true,
                Arrive::Normal => {
                    self.cmd.input.clear();
                    self.cmd.flags.remove(StageFlags::FWD);
                    true
                }
            }
        } else {
            // let downstream drain this stage's final output first
            let slot = &mut self.slots[self.cur];
            slot.done = true;
            if !close_it {
                // a skipped stage has no state; pass the window through
                self.cmd.output = std::mem::take(&mut self.cmd.input);
            }
            self.shift_next();
            true
        }
    }

    fn shift_next(&mut self) {
        self.cur += 1;
        self.cmd.input = std::mem::take(&mut self.cmd.output);
        self.cmd.flags |= StageFlags::FWD;
    }

    /// Unwind done/done-prev markers at the cursor after a backward move.
    fn arrive_back(&mut self, core: &Rc<Core>) -> Arrive {
        loop {
            if self.slots[self.cur].done_prev {
                self.slots[self.cur].done_prev = false;
                let upstream: Vec<Slot> = self.slots.drain(..self.cur).collect();
                for slot in upstream.into_iter().rev() {
                    Self::close_slot(core, &mut self.cmd, &mut self.closed_log, slot);
                }
                self.cur = 0;
            }
            if !self.slots[self.cur].done {
                return Arrive::Normal;
            }
            let slot = self.slots.remove(self.cur);
            Self::close_slot(core, &mut self.cmd, &mut self.closed_log, slot);
            if self.slots.is_empty() {
                return Arrive::Empty;
            }
            if self.cur >= self.slots.len() {
                // the done stage was last; keep bouncing upstream
                self.cur = self.slots.len() - 1;
                continue;
            }
            // forward to the stage we came from with an empty window: this
            // is how end-of-input propagates downstream
            self.cmd.input.clear();
            self.cmd.output.clear();
            self.cmd.flags |= StageFlags::FWD;
            return Arrive::Forwarded;
        }
    }

    /// Move the cursor upstream after MORE/BACK.  Returns false on a
    /// protocol error.
    fn shift_prev(&mut self, core: &Rc<Core>, back: bool) -> bool {
        self.slots[self.cur].data_empty = false;
        if self.cur == 0 {
            error!("{} requested more data", self.slots[self.cur].name);
            self.close_all(core);
            return false;
        }
        self.cur -= 1;

        match self.arrive_back(core) {
            Arrive::Empty => {
                // handled by the caller's empty-chain check
                true
            }
            Arrive::Forwarded => true,
            Arrive::Normal => {
                if back {
                    self.cmd.input = std::mem::take(&mut self.cmd.output);
                    self.cmd.flags |= StageFlags::FWD;
                } else {
                    self.cmd.input.clear();
                    self.cmd.flags.remove(StageFlags::FWD);
                }
                true
            }
        }
    }
}

enum Arrive {
    /// Landed on a live stage.
    Normal,
    /// A done stage was closed; the cursor points downstream again with an
    /// empty forward window.
    Forwarded,
    /// The chain ran out of stages.
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;

    /// Produces `chunks` then DONE.
    struct Producer {
        chunks: Vec<Vec<u8>>,
    }
    impl Stage for Producer {
        fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
            if self.chunks.is_empty() {
                return StepResult::Done;
            }
            cmd.output = self.chunks.remove(0);
            StepResult::Data
        }
    }

    /// Passes data through unchanged.
    struct PassThrough;
    impl Stage for PassThrough {
        fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
            if cmd.input.is_empty() {
                return if cmd.flags.contains(StageFlags::FWD) {
                    StepResult::Done
                } else {
                    StepResult::More
                };
            }
            cmd.output = std::mem::take(&mut cmd.input);
            StepResult::Data
        }
    }

    /// Collects everything it receives.
    struct Sink {
        got: Rc<std::cell::RefCell<Vec<u8>>>,
    }
    impl Stage for Sink {
        fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
            if cmd.input.is_empty() && cmd.flags.contains(StageFlags::FWD) {
                return StepResult::Done;
            }
            self.got.borrow_mut().extend_from_slice(&cmd.input);
            cmd.input.clear();
            StepResult::More
        }
    }

    fn collect_chain(stages: Vec<(&str, Box<dyn Stage>)>) -> (Chain, Rc<Core>) {
        let mut chain = Chain::new();
        for (name, s) in stages {
            chain.add(AddPos::Last, name, s);
        }
        (chain, Core::new_for_tests())
    }

    #[test]
    fn test_producer_to_sink() {
        let got = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (mut chain, core) = collect_chain(vec![
            (
                "prod",
                Box::new(Producer {
                    chunks: vec![b"ab".to_vec(), b"cd".to_vec()],
                }),
            ),
            ("pass", Box::new(PassThrough)),
            ("sink", Box::new(Sink { got: got.clone() })),
        ]);
        assert_eq!(ChainRun::Done, chain.run(&core));
        assert_eq!(b"abcd".to_vec(), *got.borrow());
    }

    #[test]
    fn test_close_reverse_attachment_order() {
        let got = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (mut chain, core) = collect_chain(vec![
            ("prod", Box::new(Producer { chunks: vec![b"x".to_vec()] })),
            ("pass", Box::new(PassThrough)),
            ("sink", Box::new(Sink { got })),
        ]);
        assert_eq!(ChainRun::Done, chain.run(&core));
        // every opened stage closed exactly once, in reverse attachment order
        assert_eq!(vec!["sink", "pass", "prod"], chain.closed_order());
    }

    #[test]
    fn test_empty_data_loop_detected() {
        struct EmptyLoop;
        impl Stage for EmptyLoop {
            fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
                cmd.output.clear();
                StepResult::Data
            }
        }
        let got = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (mut chain, core) = collect_chain(vec![
            ("bad", Box::new(EmptyLoop)),
            ("sink", Box::new(Sink { got })),
        ]);
        assert_eq!(ChainRun::Err, chain.run(&core));
    }

    #[test]
    fn test_last_stage_must_not_produce() {
        let (mut chain, core) = collect_chain(vec![(
            "prod",
            Box::new(Producer { chunks: vec![b"z".to_vec()] }),
        )]);
        assert_eq!(ChainRun::Err, chain.run(&core));
    }

    #[test]
    fn test_first_stage_cannot_request_more() {
        struct Hungry;
        impl Stage for Hungry {
            fn process(&mut self, _core: &Rc<Core>, _cmd: &mut StageCmd) -> StepResult {
                StepResult::More
            }
        }
        let got = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (mut chain, core) = collect_chain(vec![
            ("hungry", Box::new(Hungry)),
            ("sink", Box::new(Sink { got })),
        ]);
        assert_eq!(ChainRun::Err, chain.run(&core));
    }

    #[test]
    fn test_skip_stage_is_transparent() {
        struct Inert;
        impl Stage for Inert {
            fn open(&mut self, _core: &Rc<Core>, _cmd: &mut StageCmd) -> OpenResult {
                OpenResult::Skip
            }
            fn process(&mut self, _core: &Rc<Core>, _cmd: &mut StageCmd) -> StepResult {
                unreachable!()
            }
        }
        let got = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (mut chain, core) = collect_chain(vec![
            ("prod", Box::new(Producer { chunks: vec![b"ok".to_vec()] })),
            ("inert", Box::new(Inert)),
            ("sink", Box::new(Sink { got: got.clone() })),
        ]);
        assert_eq!(ChainRun::Done, chain.run(&core));
        assert_eq!(b"ok".to_vec(), *got.borrow());
        // the skipped stage was never opened, so it is never closed
        assert_eq!(vec!["sink", "prod"], chain.closed_order());
    }

    /// Consumes its final batch and completes on empty forward input.
    struct BatchSink {
        got: Rc<std::cell::RefCell<Vec<u8>>>,
    }
    impl Stage for BatchSink {
        fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
            if !cmd.input.is_empty() {
                self.got.borrow_mut().extend_from_slice(&cmd.input);
                cmd.input.clear();
            }
            StepResult::Done
        }
    }

    #[test]
    fn test_nextdone_split_and_rejoin() {
        /// Emits one batch, demands downstream finish, then attaches a new
        /// consumer for the second batch.  Models a container writer that
        /// flushes one inner stream before starting the next.
        struct Batcher {
            phase: u32,
            got2: Rc<std::cell::RefCell<Vec<u8>>>,
        }
        impl Stage for Batcher {
            fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
                self.phase += 1;
                match self.phase {
                    1 => {
                        cmd.output = b"one".to_vec();
                        StepResult::NextDone
                    }
                    2 => {
                        cmd.add_filter(
                            AddPos::Last,
                            "bsink2",
                            Box::new(BatchSink {
                                got: self.got2.clone(),
                            }),
                        );
                        cmd.output = b"two".to_vec();
                        StepResult::Data
                    }
                    _ => StepResult::Done,
                }
            }
        }
        let got1 = Rc::new(std::cell::RefCell::new(Vec::new()));
        let got2 = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut chain = Chain::new();
        chain.add(
            AddPos::Last,
            "batch",
            Box::new(Batcher {
                phase: 0,
                got2: got2.clone(),
            }),
        );
        chain.add(
            AddPos::Last,
            "bsink1",
            Box::new(BatchSink { got: got1.clone() }),
        );
        let core = Core::new_for_tests();
        assert_eq!(ChainRun::Done, chain.run(&core));
        // the first sink drained batch one inside the split; after the
        // rejoin the upstream stage resumed and fed the second sink
        assert_eq!(b"one".to_vec(), *got1.borrow());
        assert_eq!(b"two".to_vec(), *got2.borrow());
    }

    #[test]
    fn test_filters_added_around_cursor() {
        /// Inserts an uppercaser after itself and a no-op before itself on
        /// the first pass, then produces.
        struct Grower {
            grown: bool,
            n: u32,
        }
        impl Stage for Grower {
            fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
                if !self.grown {
                    self.grown = true;
                    cmd.add_filter(AddPos::BeforeCur, "head", Box::new(Exhausted));
                    cmd.add_filter(AddPos::AfterCur, "upper", Box::new(Upper));
                }
                self.n += 1;
                match self.n {
                    1 => {
                        cmd.output = b"ab".to_vec();
                        StepResult::Data
                    }
                    _ => StepResult::Done,
                }
            }
        }
        struct Upper;
        impl Stage for Upper {
            fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
                if cmd.input.is_empty() {
                    return if cmd.flags.contains(StageFlags::FWD) {
                        StepResult::Done
                    } else {
                        StepResult::More
                    };
                }
                cmd.output = cmd.input.to_ascii_uppercase();
                cmd.input.clear();
                StepResult::Data
            }
        }
        /// A producer with nothing left to produce.
        struct Exhausted;
        impl Stage for Exhausted {
            fn process(&mut self, _core: &Rc<Core>, _cmd: &mut StageCmd) -> StepResult {
                StepResult::Done
            }
        }
        let got = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (mut chain, core) = collect_chain(vec![
            ("grow", Box::new(Grower { grown: false, n: 0 })),
            ("sink", Box::new(Sink { got: got.clone() })),
        ]);
        assert_eq!(ChainRun::Done, chain.run(&core));
        // the stage added after the cursor transformed the data in flight
        assert_eq!(b"AB".to_vec(), *got.borrow());
    }

    #[test]
    fn test_second_simultaneous_split_is_fatal() {
        struct DoubleSplit;
        impl Stage for DoubleSplit {
            fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
                cmd.output = b"x".to_vec();
                StepResult::NextDone
            }
        }
        struct Splitter;
        impl Stage for Splitter {
            fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
                cmd.output = std::mem::take(&mut cmd.input);
                StepResult::NextDone
            }
        }
        let got = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (mut chain, core) = collect_chain(vec![
            ("outer", Box::new(DoubleSplit)),
            ("inner", Box::new(Splitter)),
            ("sink", Box::new(Sink { got })),
        ]);
        assert_eq!(ChainRun::Err, chain.run(&core));
    }

    #[test]
    fn test_outputdone_closes_upstream() {
        struct Head {
            n: u32,
        }
        impl Stage for Head {
            fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
                self.n += 1;
                if self.n > 10 {
                    return StepResult::Done;
                }
                cmd.output = vec![b'x'; 4];
                StepResult::Data
            }
        }
        /// Takes the first chunk only, then declares upstream finished.
        struct Taker {
            taken: bool,
        }
        impl Stage for Taker {
            fn process(&mut self, _core: &Rc<Core>, cmd: &mut StageCmd) -> StepResult {
                if !self.taken {
                    self.taken = true;
                    cmd.output = std::mem::take(&mut cmd.input);
                    return StepResult::Data;
                }
                cmd.input.clear();
                StepResult::OutputDone
            }
        }
        let got = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (mut chain, core) = collect_chain(vec![
            ("head", Box::new(Head { n: 0 })),
            ("taker", Box::new(Taker { taken: false })),
            ("sink", Box::new(Sink { got: got.clone() })),
        ]);
        assert_eq!(ChainRun::Done, chain.run(&core));
        assert_eq!(4, got.borrow().len());
        // the sink finished first; bouncing back over the OUTPUTDONE marker
        // closed the head, then the marker stage itself
        assert_eq!(vec!["sink", "head", "taker"], chain.closed_order());
    }
}
