// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scripted `Tracer` double over an in-memory byte map.

use std::collections::{BTreeMap, VecDeque};

use anyhow::anyhow;
use binimage::Address;
use proctrace::{Output, StopEvent, ThreadId, TraceError, Tracer};

use crate::breakpoint::INT3;

/// A mutating tracer call, as observed by `FakeTracer`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Set(Address),
    Remove(Address),
    Step(ThreadId),
    Detach,
    Terminate,
}

#[derive(Debug)]
pub struct FakeTracer {
    /// Sparse target memory, by address.
    pub memory: BTreeMap<u64, u8>,

    /// Events `resume` yields, in order. When drained, the target exits.
    pub script: VecDeque<Result<StopEvent, TraceError>>,

    /// Results `step_over` yields, in order. When drained, steps complete.
    pub step_results: VecDeque<Result<Option<StopEvent>, TraceError>>,

    /// Mutating calls, in order.
    pub ops: Vec<Op>,

    pub alive: bool,
    pub pid: u32,
}

impl FakeTracer {
    pub fn new() -> Self {
        Self {
            memory: BTreeMap::new(),
            script: VecDeque::new(),
            step_results: VecDeque::new(),
            ops: Vec::new(),
            alive: true,
            pid: 4100,
        }
    }

    /// Back target memory at `base` with `data`.
    pub fn map(&mut self, base: Address, data: &[u8]) {
        for (index, byte) in data.iter().enumerate() {
            self.memory.insert(base.0 + index as u64, *byte);
        }
    }

    pub fn byte_at(&self, addr: Address) -> Option<u8> {
        self.memory.get(&addr.0).copied()
    }

    pub fn push_event(&mut self, event: StopEvent) {
        self.script.push_back(Ok(event));
    }

    pub fn push_error(&mut self, message: &'static str) {
        self.script
            .push_back(Err(TraceError::Protocol(anyhow!(message))));
    }
}

impl Tracer for FakeTracer {
    fn resume(&mut self) -> Result<StopEvent, TraceError> {
        match self.script.pop_front() {
            Some(result) => result,
            None => {
                self.alive = false;
                Ok(StopEvent::ProcessExited { exit_code: Some(0) })
            }
        }
    }

    fn step_over(&mut self, thread: ThreadId) -> Result<Option<StopEvent>, TraceError> {
        self.ops.push(Op::Step(thread));
        self.step_results.pop_front().unwrap_or(Ok(None))
    }

    fn set_breakpoint(&mut self, addr: Address) -> Result<u8, TraceError> {
        self.ops.push(Op::Set(addr));

        let Some(byte) = self.memory.get_mut(&addr.0) else {
            return Err(TraceError::Protocol(anyhow!("unmapped address: {addr:x}")));
        };

        let original = *byte;
        *byte = INT3;

        Ok(original)
    }

    fn remove_breakpoint(&mut self, addr: Address, original: u8) -> Result<(), TraceError> {
        self.ops.push(Op::Remove(addr));

        let Some(byte) = self.memory.get_mut(&addr.0) else {
            return Err(TraceError::Protocol(anyhow!("unmapped address: {addr:x}")));
        };

        *byte = original;

        Ok(())
    }

    fn read_memory(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), TraceError> {
        for (index, out) in buf.iter_mut().enumerate() {
            let Some(byte) = self.memory.get(&(addr.0 + index as u64)) else {
                return Err(TraceError::Protocol(anyhow!("unmapped address: {addr:x}")));
            };

            *out = *byte;
        }

        Ok(())
    }

    fn write_memory(&mut self, addr: Address, data: &[u8]) -> Result<(), TraceError> {
        for (index, byte) in data.iter().enumerate() {
            self.memory.insert(addr.0 + index as u64, *byte);
        }

        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    fn detach(&mut self) -> Result<(), TraceError> {
        self.ops.push(Op::Detach);
        Ok(())
    }

    fn terminate(&mut self) {
        self.ops.push(Op::Terminate);
        self.alive = false;
    }

    fn take_output(&mut self) -> Output {
        Output::default()
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}
