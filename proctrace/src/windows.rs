// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod debug_event;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::io::Read;
use std::mem::MaybeUninit;
use std::os::windows::ffi::OsStringExt;
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::ptr;

use anyhow::{bail, format_err, Result};
use binimage::path::FilePath;
use binimage::Address;
use memmap2::Mmap;
use winapi::shared::basetsd::SIZE_T;
use winapi::shared::minwindef::{BOOL, DWORD, FALSE, LPCVOID, LPVOID, MAX_PATH, TRUE};
use winapi::shared::winerror::{ERROR_ACCESS_DENIED, WAIT_TIMEOUT};
use winapi::um::debugapi::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, WaitForDebugEvent,
};
use winapi::um::fileapi::GetFinalPathNameByHandleW;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{ReadProcessMemory, WriteProcessMemory};
use winapi::um::minwinbase::{
    DEBUG_EVENT, EXCEPTION_BREAKPOINT, EXCEPTION_DEBUG_INFO, EXCEPTION_SINGLE_STEP,
};
use winapi::um::processthreadsapi::{
    FlushInstructionCache, GetExitCodeProcess, GetThreadContext, ResumeThread, SetThreadContext,
    SuspendThread, TerminateProcess,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{DebugSetProcessKillOnExit, DEBUG_ONLY_THIS_PROCESS, INFINITE};
use winapi::um::winnt::{CONTEXT, CONTEXT_ALL, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, HANDLE};

use self::debug_event::{DebugEvent, DebugEventInfo};
use crate::{Fault, ModuleEvent, Output, StopEvent, ThreadId, TraceError, Tracer};

// Exception raised by the CLR to notify an attached debugger. Not a crash:
//   https://github.com/dotnet/coreclr/blob/9ee6b8a33741cc5f3eb82e990646dd3a81de996a/src/debug/inc/dbgipcevents.h#L37
const CLRDBG_NOTIFICATION_EXCEPTION_CODE: DWORD = 0x04242420;

// When debugging a WoW64 process, we see STATUS_WX86_BREAKPOINT in addition
// to EXCEPTION_BREAKPOINT.
const STATUS_WX86_BREAKPOINT: DWORD = ::winapi::shared::ntstatus::STATUS_WX86_BREAKPOINT as DWORD;

/// Win32 debug API tracer backend.
///
/// Every debug event freezes the whole target, so a reported stop leaves the
/// target held until the caller resumes. Single steps freeze all other
/// threads via their suspend counts, so only the stepped thread runs.
pub struct DebugApiTracer {
    child: Option<Child>,
    pid: u32,
    process: HANDLE,
    threads: BTreeMap<u32, ThreadInfo>,

    /// Addresses currently holding an `int3` we wrote. Byte save and restore
    /// is the caller's job; this set only classifies breakpoint exceptions.
    armed: BTreeSet<Address>,

    /// Events observed but not yet delivered to the caller.
    queue: VecDeque<StopEvent>,

    /// Modules mapped before the loader breakpoint. Breakpoints written any
    /// earlier would be clobbered by image initialization.
    pending_modules: Vec<ModuleEvent>,

    continue_args: Option<ContinueArgs>,
    saw_initial_break: bool,
    exit_code: Option<i64>,
    exited: bool,
}

impl DebugApiTracer {
    /// Spawn `cmd` under the debugger. The target stays kernel-blocked until
    /// its create event is continued by the first `resume`.
    pub fn spawn(mut cmd: Command) -> Result<Self, TraceError> {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.creation_flags(DEBUG_ONLY_THIS_PROCESS);

        let child = cmd.spawn().map_err(|err| TraceError::Attach(err.into()))?;

        check_winapi(|| unsafe { DebugSetProcessKillOnExit(TRUE) })
            .map_err(TraceError::Attach)?;

        let mut this = Self::new(Some(child));
        this.wait_create_event().map_err(TraceError::Attach)?;

        Ok(this)
    }

    /// Attach to a running process. The debug API synthesizes create, load,
    /// and breakpoint events to bring us up to date.
    pub fn attach(pid: u32) -> Result<Self, TraceError> {
        check_winapi(|| unsafe { DebugActiveProcess(pid as DWORD) })
            .map_err(TraceError::Attach)?;

        // Unlike a spawned target, an attached target outlives us.
        if let Err(err) = check_winapi(|| unsafe { DebugSetProcessKillOnExit(FALSE) }) {
            debug!("unable to clear kill-on-exit: {}", err);
        }

        let mut this = Self::new(None);
        this.wait_create_event().map_err(TraceError::Attach)?;

        Ok(this)
    }

    fn new(child: Option<Child>) -> Self {
        Self {
            child,
            pid: 0,
            process: ptr::null_mut(),
            threads: BTreeMap::new(),
            armed: BTreeSet::new(),
            queue: VecDeque::new(),
            pending_modules: Vec::new(),
            continue_args: None,
            saw_initial_break: false,
            exit_code: None,
            exited: false,
        }
    }

    fn wait_create_event(&mut self) -> Result<()> {
        let mut de = MaybeUninit::uninit();
        if unsafe { WaitForDebugEvent(de.as_mut_ptr(), INFINITE) } == FALSE {
            return Err(last_os_error());
        }
        let de = unsafe { de.assume_init() };
        let de = DebugEvent::new(&de);

        let DebugEventInfo::CreateProcess(info) = de.info() else {
            bail!("unexpected first debug event: {de}");
        };

        trace!("{de}");

        self.pid = de.process_id();
        self.process = info.hProcess;
        self.threads
            .insert(de.thread_id(), ThreadInfo::new(de.thread_id(), info.hThread));
        self.load_module(info.hFile, info.lpBaseOfImage as u64);
        self.stash_continue(&de, DBG_CONTINUE);

        Ok(())
    }

    fn wait_event(&mut self) -> Result<Option<DEBUG_EVENT>, TraceError> {
        let mut de = MaybeUninit::uninit();
        if unsafe { WaitForDebugEvent(de.as_mut_ptr(), INFINITE) } == FALSE {
            if !self.probe_alive() {
                return Ok(None);
            }

            return Err(TraceError::Protocol(last_os_error()));
        }

        let de = unsafe { de.assume_init() };

        Ok(Some(de))
    }

    fn process_event(&mut self, de: &DebugEvent) {
        trace!("{de}");

        match de.info() {
            DebugEventInfo::Exception(info) => {
                let status = self.handle_exception(de.thread_id(), info);
                self.stash_continue(de, status);
            }
            DebugEventInfo::CreateThread(info) => {
                self.threads
                    .insert(de.thread_id(), ThreadInfo::new(de.thread_id(), info.hThread));
                self.queue.push_back(StopEvent::ThreadCreated {
                    thread: ThreadId(de.thread_id()),
                });
                self.stash_continue(de, DBG_CONTINUE);
            }
            DebugEventInfo::ExitThread(_) => {
                self.threads.remove(&de.thread_id());
                self.queue.push_back(StopEvent::ThreadExited {
                    thread: ThreadId(de.thread_id()),
                });
                self.stash_continue(de, DBG_CONTINUE);
            }
            DebugEventInfo::LoadDll(info) => {
                self.load_module(info.hFile, info.lpBaseOfDll as u64);
                self.stash_continue(de, DBG_CONTINUE);
            }
            DebugEventInfo::UnloadDll(info) => {
                let base = Address(info.lpBaseOfDll as u64);
                if self.saw_initial_break {
                    self.queue.push_back(StopEvent::ModuleUnloaded { base });
                } else {
                    self.pending_modules.retain(|m| m.base != base);
                }
                self.stash_continue(de, DBG_CONTINUE);
            }
            DebugEventInfo::ExitProcess(info) => {
                self.exit_code = Some(i64::from(info.dwExitCode));
                self.exited = true;

                // The final continue releases what is left of the target.
                self.stash_continue(de, DBG_CONTINUE);
                if let Err(err) = self.continue_pending() {
                    debug!("unable to continue final debug event: {}", err);
                }
            }
            DebugEventInfo::CreateProcess(info) => {
                // Child processes are not debugged, so a second create event
                // means a misconfigured debug loop.
                debug!("unexpected create event: {de}");
                if !info.hFile.is_null() && info.hFile != INVALID_HANDLE_VALUE {
                    unsafe { CloseHandle(info.hFile) };
                }
                self.stash_continue(de, DBG_CONTINUE);
            }
            DebugEventInfo::Unknown => {
                debug!("debug event ignored: {de}");
                self.stash_continue(de, DBG_CONTINUE);
            }
        }
    }

    /// Returns the continue status for the exception.
    fn handle_exception(&mut self, tid: u32, info: &EXCEPTION_DEBUG_INFO) -> DWORD {
        let code = info.ExceptionRecord.ExceptionCode;
        let address = info.ExceptionRecord.ExceptionAddress as u64;

        if code == CLRDBG_NOTIFICATION_EXCEPTION_CODE {
            return DBG_CONTINUE;
        }

        if code == EXCEPTION_BREAKPOINT || code == STATUS_WX86_BREAKPOINT {
            let addr = Address(address);

            if self.armed.contains(&addr) {
                // The caller will restore the displaced instruction. Rewind
                // the program counter before the event is reported, so the
                // original instruction re-executes on resume, simulating a
                // hardware breakpoint.
                match self.rewind_to(tid, addr) {
                    Ok(()) => {
                        self.queue.push_back(StopEvent::BreakpointHit {
                            addr,
                            thread: ThreadId(tid),
                        });
                    }
                    Err(err) => {
                        warn!("unable to rewind thread {} to {:x}: {}", tid, addr, err);
                    }
                }

                return DBG_CONTINUE;
            }

            if !self.saw_initial_break {
                // The loader breakpoint. Image initialization is done, so
                // the modules seen so far can be reported and armed.
                self.saw_initial_break = true;

                for module in std::mem::take(&mut self.pending_modules) {
                    self.queue.push_back(StopEvent::ModuleLoaded(module));
                }

                return DBG_CONTINUE;
            }

            debug!("breakpoint not ours at {:x}", address);
            return DBG_CONTINUE;
        }

        if code == EXCEPTION_SINGLE_STEP {
            // Normally consumed by the step loop. A stray trap is not an
            // event for the caller.
            debug!("stray single step at {:x}", address);
            return DBG_CONTINUE;
        }

        if info.dwFirstChance != 0 {
            // Give any exception handlers in the target the first try.
            return DBG_EXCEPTION_NOT_HANDLED;
        }

        self.queue.push_back(StopEvent::Crashed {
            fault: Fault::Exception {
                code,
                address: Address(address),
            },
        });

        DBG_EXCEPTION_NOT_HANDLED
    }

    fn rewind_to(&mut self, tid: u32, addr: Address) -> Result<()> {
        let info = self
            .threads
            .get(&tid)
            .ok_or_else(|| format_err!("breakpoint on unknown thread {tid}"))?;

        let mut context = ThreadContext::capture(info.handle)?;
        context.set_program_counter(addr.0);
        context.apply(info.handle)?;

        Ok(())
    }

    fn load_module(&mut self, handle: HANDLE, base: u64) {
        let event = module_event(handle, base);

        // The debugger owns the file handle delivered with the event.
        if !handle.is_null() && handle != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(handle) };
        }

        let event = match event {
            Ok(event) => event,
            Err(err) => {
                debug!("unable to identify module at {:x}: {}", base, err);
                return;
            }
        };

        if self.saw_initial_break {
            self.queue.push_back(StopEvent::ModuleLoaded(event));
        } else {
            self.pending_modules.push(event);
        }
    }

    fn stash_continue(&mut self, de: &DebugEvent, status: DWORD) {
        self.continue_args = Some(ContinueArgs {
            process_id: de.process_id(),
            thread_id: de.thread_id(),
            status,
        });
    }

    fn continue_pending(&mut self) -> Result<(), TraceError> {
        let Some(args) = self.continue_args.take() else {
            return Ok(());
        };

        check_winapi(|| unsafe {
            ContinueDebugEvent(args.process_id, args.thread_id, args.status)
        })
        .map_err(TraceError::Protocol)
    }

    fn probe_alive(&self) -> bool {
        if self.process.is_null() {
            return false;
        }

        unsafe { WaitForSingleObject(self.process, 0) == WAIT_TIMEOUT }
    }

    fn mark_exited(&mut self) -> StopEvent {
        self.exited = true;

        if self.exit_code.is_none() && !self.process.is_null() && !self.probe_alive() {
            let mut code: DWORD = 0;
            if unsafe { GetExitCodeProcess(self.process, &mut code) } != FALSE {
                self.exit_code = Some(i64::from(code));
            }
        }

        StopEvent::ProcessExited {
            exit_code: self.exit_code,
        }
    }

    fn step_wait(&mut self, thread: ThreadId) -> Result<Option<StopEvent>, TraceError> {
        loop {
            self.continue_pending()?;

            let Some(raw) = self.wait_event()? else {
                return Ok(Some(self.mark_exited()));
            };
            let de = DebugEvent::new(&raw);

            if de.thread_id() == thread.0 {
                if let DebugEventInfo::Exception(info) = de.info() {
                    if info.ExceptionRecord.ExceptionCode == EXCEPTION_SINGLE_STEP {
                        // Step trap. The thread stays held at the debug
                        // event until the next resume.
                        self.stash_continue(&de, DBG_CONTINUE);
                        return Ok(None);
                    }
                }

                if let DebugEventInfo::ExitThread(_) = de.info() {
                    // The stepped instruction took the thread into an exit
                    // path.
                    self.process_event(&de);
                    return Ok(None);
                }
            }

            // Queue anything else and keep waiting for the step trap.
            self.process_event(&de);

            if self.exited {
                return Ok(Some(StopEvent::ProcessExited {
                    exit_code: self.exit_code,
                }));
            }

            if matches!(self.queue.back(), Some(StopEvent::Crashed { .. })) {
                if let Some(StopEvent::Crashed { fault }) = self.queue.pop_back() {
                    return Ok(Some(StopEvent::Crashed { fault }));
                }
            }
        }
    }
}

impl Tracer for DebugApiTracer {
    fn resume(&mut self) -> Result<StopEvent, TraceError> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(event);
        }

        if self.exited {
            return Ok(StopEvent::ProcessExited {
                exit_code: self.exit_code,
            });
        }

        loop {
            self.continue_pending()?;

            let Some(raw) = self.wait_event()? else {
                return Ok(self.mark_exited());
            };

            let de = DebugEvent::new(&raw);
            self.process_event(&de);

            if let Some(event) = self.queue.pop_front() {
                return Ok(event);
            }

            if self.exited {
                return Ok(StopEvent::ProcessExited {
                    exit_code: self.exit_code,
                });
            }
        }
    }

    fn step_over(&mut self, thread: ThreadId) -> Result<Option<StopEvent>, TraceError> {
        if self.exited {
            return Ok(Some(StopEvent::ProcessExited {
                exit_code: self.exit_code,
            }));
        }

        {
            let info = self.threads.get(&thread.0).ok_or_else(|| {
                TraceError::Protocol(format_err!("step requested for unknown thread {thread}"))
            })?;

            let mut context = ThreadContext::capture(info.handle).map_err(TraceError::Protocol)?;
            context.set_single_step(true);
            context.apply(info.handle).map_err(TraceError::Protocol)?;
        }

        // Freeze every other thread so only the stepped one makes progress.
        let frozen: Vec<u32> = self
            .threads
            .keys()
            .copied()
            .filter(|&tid| tid != thread.0)
            .collect();

        for tid in &frozen {
            if let Some(info) = self.threads.get_mut(tid) {
                if let Err(err) = info.suspend() {
                    debug!("unable to suspend thread {}: {}", tid, err);
                }
            }
        }

        let result = self.step_wait(thread);

        // Unfreeze regardless of how the step ended.
        for tid in &frozen {
            if let Some(info) = self.threads.get_mut(tid) {
                if let Err(err) = info.resume() {
                    debug!("unable to resume thread {}: {}", tid, err);
                }
            }
        }

        result
    }

    fn set_breakpoint(&mut self, addr: Address) -> Result<u8, TraceError> {
        let mut data = [0u8];
        self.read_memory(addr, &mut data)?;
        self.write_memory(addr, &[0xcc])?;
        self.armed.insert(addr);

        Ok(data[0])
    }

    fn remove_breakpoint(&mut self, addr: Address, original: u8) -> Result<(), TraceError> {
        self.write_memory(addr, &[original])?;
        self.armed.remove(&addr);

        Ok(())
    }

    fn read_memory(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), TraceError> {
        let mut bytes_read: SIZE_T = 0;

        check_winapi(|| unsafe {
            ReadProcessMemory(
                self.process,
                addr.0 as LPCVOID,
                buf.as_mut_ptr() as LPVOID,
                buf.len() as SIZE_T,
                &mut bytes_read,
            )
        })
        .map_err(TraceError::Protocol)?;

        if bytes_read != buf.len() as SIZE_T {
            return Err(TraceError::Protocol(format_err!(
                "short read of {} bytes at {:x}",
                bytes_read,
                addr
            )));
        }

        Ok(())
    }

    fn write_memory(&mut self, addr: Address, data: &[u8]) -> Result<(), TraceError> {
        let mut bytes_written: SIZE_T = 0;

        check_winapi(|| unsafe {
            WriteProcessMemory(
                self.process,
                addr.0 as LPVOID,
                data.as_ptr() as LPCVOID,
                data.len() as SIZE_T,
                &mut bytes_written,
            )
        })
        .map_err(TraceError::Protocol)?;

        check_winapi(|| unsafe {
            FlushInstructionCache(self.process, addr.0 as LPCVOID, data.len() as SIZE_T)
        })
        .map_err(TraceError::Protocol)?;

        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }

        self.probe_alive()
    }

    fn detach(&mut self) -> Result<(), TraceError> {
        self.continue_pending()?;

        for info in self.threads.values_mut() {
            if let Err(err) = info.resume() {
                debug!("unable to resume thread {} for detach: {}", info.id, err);
            }
        }

        if let Err(err) = check_winapi(|| unsafe { DebugSetProcessKillOnExit(FALSE) }) {
            debug!("unable to clear kill-on-exit: {}", err);
        }

        if let Err(err) = check_winapi(|| unsafe { DebugActiveProcessStop(self.pid as DWORD) }) {
            debug!("unable to stop debugging {}: {}", self.pid, err);
        }

        self.exited = true;

        Ok(())
    }

    fn terminate(&mut self) {
        if self.probe_alive() {
            debug!("terminating pid: {}", self.pid);
            if unsafe { TerminateProcess(self.process, 0) } == FALSE {
                debug!("unable to terminate {}: {}", self.pid, last_os_error());
            }
        }

        // Release the held debug event so the kill can complete.
        if let Err(err) = self.continue_pending() {
            debug!("unable to continue final debug event: {}", err);
        }

        self.exited = true;
    }

    fn take_output(&mut self) -> Output {
        let mut output = Output {
            exit_code: self.exit_code,
            ..Output::default()
        };

        let Some(mut child) = self.child.take() else {
            // Attached targets do not own the target's stdio.
            return output;
        };

        if let Some(pipe) = &mut child.stdout {
            let mut stdout = Vec::new();
            if pipe.read_to_end(&mut stdout).is_ok() {
                output.stdout = String::from_utf8_lossy(&stdout).into_owned();
            }
        }

        if let Some(pipe) = &mut child.stderr {
            let mut stderr = Vec::new();
            if pipe.read_to_end(&mut stderr).is_ok() {
                output.stderr = String::from_utf8_lossy(&stderr).into_owned();
            }
        }

        // Clean up, ignoring output that we've already gathered.
        //
        // These calls should also be unnecessary no-ops, but we really want
        // to avoid any dangling or zombie child processes.
        let _ = child.kill();
        if let Ok(status) = child.wait() {
            if output.exit_code.is_none() {
                output.exit_code = status.code().map(i64::from);
            }
        }

        output
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

struct ContinueArgs {
    process_id: DWORD,
    thread_id: DWORD,
    status: DWORD,
}

const SUSPEND_RESUME_ERROR_CODE: DWORD = -1i32 as DWORD;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ThreadState {
    Runnable,
    Suspended,
    Exited,
}

struct ThreadInfo {
    id: u32,
    handle: HANDLE,
    state: ThreadState,
}

impl ThreadInfo {
    fn new(id: u32, handle: HANDLE) -> Self {
        Self {
            id,
            handle,
            state: ThreadState::Runnable,
        }
    }

    fn suspend(&mut self) -> Result<()> {
        if self.state != ThreadState::Runnable {
            return Ok(());
        }

        trace!("suspending thread {}", self.id);

        if unsafe { SuspendThread(self.handle) } == SUSPEND_RESUME_ERROR_CODE {
            let os_error = io::Error::last_os_error();

            // The thread may have exited between the debug event and this
            // call, in which case we see an access denied error.
            if os_error.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
                self.state = ThreadState::Exited;
                return Ok(());
            }

            return Err(os_error.into());
        }

        self.state = ThreadState::Suspended;

        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if self.state != ThreadState::Suspended {
            return Ok(());
        }

        trace!("resuming thread {}", self.id);

        if unsafe { ResumeThread(self.handle) } == SUSPEND_RESUME_ERROR_CODE {
            let os_error = io::Error::last_os_error();

            if os_error.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
                self.state = ThreadState::Exited;
                return Ok(());
            }

            return Err(os_error.into());
        }

        self.state = ThreadState::Runnable;

        Ok(())
    }
}

// 16-byte alignment is required by `CONTEXT`, but missing from the winapi
// definition.
#[repr(C, align(16))]
struct Aligned16<T>(T);

struct ThreadContext(Aligned16<CONTEXT>);

impl ThreadContext {
    fn capture(handle: HANDLE) -> Result<Self> {
        let mut context: Aligned16<CONTEXT> = unsafe { MaybeUninit::zeroed().assume_init() };
        context.0.ContextFlags = CONTEXT_ALL;

        check_winapi(|| unsafe { GetThreadContext(handle, &mut context.0) })?;

        Ok(ThreadContext(context))
    }

    fn set_program_counter(&mut self, pc: u64) {
        self.0 .0.Rip = pc;
    }

    fn set_single_step(&mut self, enable: bool) {
        const TRAP_FLAG: u32 = 1 << 8;

        if enable {
            self.0 .0.EFlags |= TRAP_FLAG;
        } else {
            self.0 .0.EFlags &= !TRAP_FLAG;
        }
    }

    fn apply(&mut self, handle: HANDLE) -> Result<()> {
        check_winapi(|| unsafe { SetThreadContext(handle, &self.0 .0) })
    }
}

fn module_event(handle: HANDLE, base: u64) -> Result<ModuleEvent> {
    if handle.is_null() || handle == INVALID_HANDLE_VALUE {
        bail!("no file handle for module at {base:x}");
    }

    let path = path_from_handle(handle)?;

    let size = match image_size(&path) {
        Ok(size) => size,
        Err(err) => {
            debug!("unable to size image {}: {}", path.display(), err);
            0
        }
    };

    let path = FilePath::new(path.to_string_lossy())?;

    Ok(ModuleEvent {
        path,
        base: Address(base),
        size,
    })
}

fn path_from_handle(handle: HANDLE) -> Result<PathBuf> {
    let mut path: Vec<u16> = vec![0; MAX_PATH as usize];

    loop {
        // A `dwFlags` of 0 requests the default: normalized, with a drive
        // letter.
        let len =
            unsafe { GetFinalPathNameByHandleW(handle, path.as_mut_ptr(), path.len() as DWORD, 0) };

        if len == 0 {
            return Err(last_os_error());
        }

        if (len as usize) > path.len() {
            // The buffer was too small, and `len` is the required size.
            path.resize(len as usize, 0);
            continue;
        }

        path.truncate(len as usize);
        break;
    }

    Ok(PathBuf::from(OsString::from_wide(&path)))
}

fn image_size(path: &Path) -> Result<u64> {
    let file = fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };

    let header = goblin::pe::header::Header::parse(&mmap)?;
    let size = header
        .optional_header
        .map(|h| h.windows_fields.size_of_image)
        .ok_or_else(|| format_err!("missing optional header in PE image"))?;

    Ok(u64::from(size))
}

fn last_os_error() -> anyhow::Error {
    io::Error::last_os_error().into()
}

fn check_winapi<T: FnOnce() -> BOOL>(f: T) -> Result<()> {
    if f() == FALSE {
        Err(last_os_error())
    } else {
        Ok(())
    }
}
