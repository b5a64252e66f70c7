// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Debugger-based process tracing for breakpoint coverage.
//!
//! One `Tracer` trait, two backends: `ptrace` on Linux, the Win32 debug API
//! on Windows. Both present the target as a pulled stream of stop events.

#[macro_use]
extern crate log;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(windows)]
pub mod windows;

use std::fmt;
use std::process::Command;

use binimage::path::FilePath;
use binimage::Address;
use thiserror::Error;

/// Thread identifier within the traced process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An executable, file-backed module mapped into the traced process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleEvent {
    pub path: FilePath,
    pub base: Address,
    pub size: u64,
}

/// Cause of an abnormal target stop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Delivery of a fatal signal (Linux).
    Signal { signo: i32, name: String },

    /// Second-chance exception (Windows).
    Exception { code: u32, address: Address },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Fault::Signal { signo, name } => write!(f, "signal {name} ({signo})"),
            Fault::Exception { code, address } => {
                write!(f, "exception {code:#x} at {address:x}")
            }
        }
    }
}

/// A target stop delivered to the controlling caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StopEvent {
    /// A software breakpoint trap at an armed address.
    ///
    /// The backend has already rewound the program counter to `addr`, so the
    /// restored original instruction re-executes on resume.
    BreakpointHit { addr: Address, thread: ThreadId },

    ModuleLoaded(ModuleEvent),

    ModuleUnloaded { base: Address },

    ThreadCreated { thread: ThreadId },

    ThreadExited { thread: ThreadId },

    /// The process is gone. Terminal.
    ProcessExited { exit_code: Option<i64> },

    /// The process faulted and will not make further progress. Terminal.
    Crashed { fault: Fault },
}

/// Captured stdio and exit status of a spawned target.
///
/// Attached targets do not own their stdio, so their output is empty.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Output {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum TraceError {
    /// The target could not be launched or attached to. Fatal to a recording.
    #[error("unable to launch or attach to target process")]
    Attach(#[source] anyhow::Error),

    /// The debugger protocol failed while the target was alive.
    #[error("debugger protocol error")]
    Protocol(#[source] anyhow::Error),
}

/// Debugger control of one target process.
///
/// Events are pulled one at a time by a single controlling caller. Stops that
/// occur while another event is being handled are queued, and a stopped thread
/// is only restarted once its event has been fully handled. "Process is gone"
/// failures surface as `ProcessExited { exit_code: None }`, never as errors.
pub trait Tracer {
    /// Run the target until the next stop event.
    fn resume(&mut self) -> Result<StopEvent, TraceError>;

    /// Execute exactly one instruction on `thread`, holding it stopped after.
    ///
    /// Returns `Some(event)` only when a process-terminal event preempts the
    /// step. Non-terminal events observed meanwhile are queued for `resume`.
    fn step_over(&mut self, thread: ThreadId) -> Result<Option<StopEvent>, TraceError>;

    /// Write a software breakpoint at `addr`, returning the displaced byte.
    fn set_breakpoint(&mut self, addr: Address) -> Result<u8, TraceError>;

    /// Restore the `original` byte displaced by a breakpoint at `addr`.
    fn remove_breakpoint(&mut self, addr: Address, original: u8) -> Result<(), TraceError>;

    fn read_memory(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), TraceError>;

    fn write_memory(&mut self, addr: Address, data: &[u8]) -> Result<(), TraceError>;

    fn is_alive(&mut self) -> bool;

    /// Release the target and leave it running. The caller must disarm its
    /// breakpoints first.
    fn detach(&mut self) -> Result<(), TraceError>;

    /// Force-kill the target. Best effort.
    fn terminate(&mut self);

    fn take_output(&mut self) -> Output;

    fn pid(&self) -> u32;
}

/// Launch `cmd` under the native debugger backend, stopped before any target
/// code has run. Initial module loads are queued for the first `resume` calls.
#[cfg(target_os = "linux")]
pub fn spawn(cmd: Command) -> Result<linux::PtraceTracer, TraceError> {
    linux::PtraceTracer::spawn(cmd)
}

/// Attach to a running process by PID.
#[cfg(target_os = "linux")]
pub fn attach(pid: u32) -> Result<linux::PtraceTracer, TraceError> {
    linux::PtraceTracer::attach(pid)
}

#[cfg(windows)]
pub fn spawn(cmd: Command) -> Result<windows::DebugApiTracer, TraceError> {
    windows::DebugApiTracer::spawn(cmd)
}

#[cfg(windows)]
pub fn attach(pid: u32) -> Result<windows::DebugApiTracer, TraceError> {
    windows::DebugApiTracer::attach(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = Fault::Signal {
            signo: 11,
            name: "SIGSEGV".into(),
        };
        assert_eq!(fault.to_string(), "signal SIGSEGV (11)");

        let fault = Fault::Exception {
            code: 0xc0000005,
            address: Address(0x7fff_0000_1000),
        };
        assert_eq!(fault.to_string(), "exception 0xc0000005 at 7fff00001000");
    }
}
