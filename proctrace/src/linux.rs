// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Read;
use std::process::{Child, Command, Stdio};

use anyhow::{bail, format_err, Result};
use binimage::path::FilePath;
use binimage::Address;
use nix::sys::ptrace;
use pete::{Pid, Ptracer, Restart, Signal, Stop, Tracee};
use procfs::process::{MMPermissions, MMapPath, MemoryMap, Process};

use crate::{Fault, ModuleEvent, Output, StopEvent, ThreadId, TraceError, Tracer};

const CRASH_SIGNALS: &[Signal] = &[
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGABRT,
];

/// `ptrace`-based tracer backend.
///
/// The target is driven with syscall restarts so module maps can be rescanned
/// at syscall boundaries. Threads that stop on a reportable event are held in
/// their trace stop until the caller has handled the event, so breakpoint
/// writes always have a stopped thread to operate through.
pub struct PtraceTracer {
    tracer: Ptracer,
    child: Option<Child>,
    root: Pid,
    images: Images,

    /// Addresses currently holding an `int3` we wrote. Byte save and restore
    /// is the caller's job; this set only classifies SIGTRAP deliveries.
    armed: BTreeSet<Address>,

    /// Events observed but not yet delivered to the caller.
    queue: VecDeque<StopEvent>,

    /// Threads stopped on events that are queued or being handled.
    parked: VecDeque<Tracee>,

    exit_code: Option<i64>,
    exited: bool,
    _kill_on_drop: Option<KillOnDrop>,
}

impl PtraceTracer {
    /// Spawn `cmd` under the tracer, stopped at the return from its initial
    /// `execve()`. Modules mapped by the loader are queued as load events.
    pub fn spawn(mut cmd: Command) -> Result<Self, TraceError> {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut tracer = Ptracer::new();
        let child = tracer
            .spawn(cmd)
            .map_err(|err| TraceError::Attach(err.into()))?;

        let mut tracee = continue_to_init_execve(&mut tracer).map_err(TraceError::Attach)?;
        set_trace_options(&mut tracee).map_err(TraceError::Attach)?;

        let root = tracee.pid;

        let mut this = Self {
            tracer,
            child: Some(child),
            root,
            images: Images::new(root.as_raw()),
            armed: BTreeSet::new(),
            queue: VecDeque::new(),
            parked: VecDeque::new(),
            exit_code: None,
            exited: false,
            _kill_on_drop: Some(KillOnDrop(root)),
        };

        // Index modules mapped before any target code has run, so the caller
        // can arm them from the first resume.
        this.scan_modules().map_err(TraceError::Attach)?;
        this.parked.push_back(tracee);

        Ok(this)
    }

    /// Attach to a running process, stopping every thread in its group.
    pub fn attach(pid: u32) -> Result<Self, TraceError> {
        let mut tracer = Ptracer::new();
        let pid = Pid::from_raw(pid as i32);

        // Attach every task in the thread group. Tasks spawned while we scan
        // are caught on a later pass; the set is stable once a pass adds none.
        let mut attached: BTreeSet<i32> = BTreeSet::new();

        loop {
            let mut grew = false;

            let proc = Process::new(pid.as_raw()).map_err(|err| TraceError::Attach(err.into()))?;
            let tasks = proc.tasks().map_err(|err| TraceError::Attach(err.into()))?;

            for task in tasks {
                let Ok(task) = task else {
                    continue;
                };

                if attached.contains(&task.tid) {
                    continue;
                }

                if let Err(err) = tracer.attach(Pid::from_raw(task.tid)) {
                    debug!("unable to attach to task {}: {}", task.tid, err);
                    continue;
                }

                attached.insert(task.tid);
                grew = true;
            }

            if !grew {
                break;
            }
        }

        if attached.is_empty() {
            return Err(TraceError::Attach(format_err!(
                "no attachable tasks for pid {pid}"
            )));
        }

        // Collect the attach stop of every task, leaving each thread parked
        // so breakpoints can be written before the target resumes.
        let mut parked = VecDeque::new();
        let mut stopped: BTreeSet<i32> = BTreeSet::new();

        while stopped.len() < attached.len() {
            let mut tracee = match tracer.wait() {
                Ok(Some(tracee)) => tracee,
                Ok(None) => {
                    return Err(TraceError::Attach(format_err!(
                        "target {pid} exited during attach"
                    )));
                }
                Err(err) => return Err(TraceError::Attach(err.into())),
            };

            // Attached tasks do not inherit options from the root.
            set_trace_options(&mut tracee).map_err(TraceError::Attach)?;

            stopped.insert(tracee.pid.as_raw());
            parked.push_back(tracee);
        }

        let mut this = Self {
            tracer,
            child: None,
            root: pid,
            images: Images::new(pid.as_raw()),
            armed: BTreeSet::new(),
            queue: VecDeque::new(),
            parked,
            exit_code: None,
            exited: false,
            _kill_on_drop: None,
        };

        this.scan_modules().map_err(TraceError::Attach)?;

        Ok(this)
    }

    fn pump(&mut self) -> Result<StopEvent, TraceError> {
        loop {
            let waited = match self.tracer.wait() {
                Ok(waited) => waited,
                Err(err) => {
                    debug!("tracer wait failed, assuming target gone: {}", err);
                    return Ok(self.mark_exited());
                }
            };

            let Some(tracee) = waited else {
                return Ok(self.mark_exited());
            };

            self.dispatch(tracee)?;

            if self.exited {
                return Ok(StopEvent::ProcessExited {
                    exit_code: self.exit_code,
                });
            }

            if let Some(event) = self.queue.pop_front() {
                return Ok(event);
            }
        }
    }

    /// Classify a stop and either park the thread (it produced events) or
    /// restart it (nothing to report).
    fn dispatch(&mut self, mut tracee: Tracee) -> Result<(), TraceError> {
        match self.classify(&mut tracee) {
            Ok(true) => {
                self.parked.push_back(tracee);
                Ok(())
            }
            Ok(false) => {
                if let Err(err) = self.tracer.restart(tracee, Restart::Syscall) {
                    error!("unable to restart tracee: {}", err);
                }
                Ok(())
            }
            Err(err) => {
                if !self.probe_alive() {
                    self.mark_exited();
                    return Ok(());
                }
                Err(TraceError::Protocol(err))
            }
        }
    }

    /// Returns true if the stop produced events for the caller.
    fn classify(&mut self, tracee: &mut Tracee) -> Result<bool> {
        let before = self.queue.len();

        match tracee.stop {
            Stop::SyscallEnter => trace!("syscall-enter: {:?}", tracee.stop),
            Stop::SyscallExit => {
                self.scan_modules()?;
            }
            Stop::SignalDelivery {
                signal: Signal::SIGTRAP,
            } => {
                self.classify_trap(tracee)?;
            }
            Stop::SignalDelivery { signal } if CRASH_SIGNALS.contains(&signal) => {
                self.queue.push_back(StopEvent::Crashed {
                    fault: Fault::Signal {
                        signo: signal as i32,
                        name: signal.as_ref().to_owned(),
                    },
                });
            }
            Stop::Clone { new } => {
                self.queue.push_back(StopEvent::ThreadCreated {
                    thread: thread_id(new),
                });
            }
            Stop::Exiting { exit_code } => {
                if tracee.pid == self.root {
                    self.exit_code = Some(i64::from(exit_code));
                } else {
                    self.queue.push_back(StopEvent::ThreadExited {
                        thread: thread_id(tracee.pid),
                    });
                }
            }
            _ => {
                debug!("stop: {:?}", tracee.stop);
            }
        }

        Ok(self.queue.len() > before)
    }

    fn classify_trap(&mut self, tracee: &mut Tracee) -> Result<()> {
        let mut regs = tracee.registers()?;

        // Compute what the last PC would have been _if_ we stopped due to a
        // soft breakpoint. If the address is not armed, we will not use this
        // value.
        let pc = Address(regs.rip.saturating_sub(1));

        if self.armed.contains(&pc) {
            // The caller will restore the displaced instruction. Rewind the
            // tracee's registers before the event is reported, so the original
            // instruction re-executes on restart, simulating a hardware
            // breakpoint.
            regs.rip = pc.0;
            tracee.set_registers(regs)?;

            self.queue.push_back(StopEvent::BreakpointHit {
                addr: pc,
                thread: thread_id(tracee.pid),
            });
        } else {
            warn!("no armed breakpoint for SIGTRAP delivery at {pc:x}");
        }

        Ok(())
    }

    fn scan_modules(&mut self) -> Result<()> {
        let events = self.images.update()?;

        for (_base, image) in &events.loaded {
            self.queue.push_back(StopEvent::ModuleLoaded(ModuleEvent {
                path: image.path().clone(),
                base: image.base(),
                size: image.size(),
            }));
        }

        for (base, _image) in &events.unloaded {
            self.queue.push_back(StopEvent::ModuleUnloaded { base: *base });
        }

        Ok(())
    }

    fn stopped_tracee(&mut self) -> Result<&mut Tracee, TraceError> {
        self.parked
            .front_mut()
            .ok_or_else(|| TraceError::Protocol(format_err!("no stopped thread for memory access")))
    }

    fn probe_alive(&self) -> bool {
        // Signal 0 probes for existence without delivering anything.
        nix::sys::signal::kill(self.root, None).is_ok()
    }

    fn mark_exited(&mut self) -> StopEvent {
        self.exited = true;

        // The exit status observed by `waitpid` is authoritative when we
        // still own the child and the tracer has not already reaped it.
        if let Some(child) = &mut self.child {
            if let Ok(Some(status)) = child.try_wait() {
                if let Some(code) = status.code() {
                    self.exit_code = Some(code.into());
                }
            }
        }

        StopEvent::ProcessExited {
            exit_code: self.exit_code,
        }
    }
}

impl Tracer for PtraceTracer {
    fn resume(&mut self) -> Result<StopEvent, TraceError> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(event);
        }

        if self.exited {
            return Ok(StopEvent::ProcessExited {
                exit_code: self.exit_code,
            });
        }

        // Every pending event has been handled, so the threads that produced
        // them can run again.
        while let Some(tracee) = self.parked.pop_front() {
            if let Err(err) = self.tracer.restart(tracee, Restart::Syscall) {
                error!("unable to restart tracee: {}", err);
            }
        }

        self.pump()
    }

    fn step_over(&mut self, thread: ThreadId) -> Result<Option<StopEvent>, TraceError> {
        if self.exited {
            return Ok(Some(StopEvent::ProcessExited {
                exit_code: self.exit_code,
            }));
        }

        let Some(ix) = self.parked.iter().position(|t| thread_id(t.pid) == thread) else {
            return Err(TraceError::Protocol(format_err!(
                "step requested for thread {thread} with no pending stop"
            )));
        };

        let Some(tracee) = self.parked.remove(ix) else {
            return Ok(None);
        };

        if let Err(err) = self.tracer.restart(tracee, Restart::Step) {
            debug!("unable to single-step thread {}: {}", thread, err);
            return Ok(None);
        }

        loop {
            let waited = match self.tracer.wait() {
                Ok(waited) => waited,
                Err(err) => {
                    debug!("tracer wait failed during step, assuming target gone: {}", err);
                    return Ok(Some(self.mark_exited()));
                }
            };

            let Some(tracee) = waited else {
                return Ok(Some(self.mark_exited()));
            };

            if thread_id(tracee.pid) == thread {
                match tracee.stop {
                    Stop::SignalDelivery {
                        signal: Signal::SIGTRAP,
                    } => {
                        // Step trap. Hold the thread stopped for re-arming.
                        self.parked.push_back(tracee);
                        return Ok(None);
                    }
                    Stop::SignalDelivery { signal } if CRASH_SIGNALS.contains(&signal) => {
                        // The restored instruction faulted.
                        let fault = Fault::Signal {
                            signo: signal as i32,
                            name: signal.as_ref().to_owned(),
                        };
                        self.parked.push_back(tracee);
                        return Ok(Some(StopEvent::Crashed { fault }));
                    }
                    Stop::Exiting { exit_code } => {
                        // The stepped instruction entered an exit path.
                        let is_root = tracee.pid == self.root;
                        if is_root {
                            self.exit_code = Some(i64::from(exit_code));
                        } else {
                            self.queue.push_back(StopEvent::ThreadExited { thread });
                        }

                        if let Err(err) = self.tracer.restart(tracee, Restart::Continue) {
                            debug!("unable to restart exiting tracee: {}", err);
                        }

                        if is_root {
                            return Ok(Some(self.mark_exited()));
                        }

                        return Ok(None);
                    }
                    _ => {
                        // Syscall stops count as completion; the stepped
                        // instruction has executed.
                        self.parked.push_back(tracee);
                        return Ok(None);
                    }
                }
            }

            // Another thread stopped mid-step. Queue anything interesting and
            // keep waiting for the step trap.
            self.dispatch(tracee)?;

            if self.exited {
                return Ok(Some(StopEvent::ProcessExited {
                    exit_code: self.exit_code,
                }));
            }
        }
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
        let tracee = self.stopped_tracee()?;
        tracee
            .read_memory_mut(addr.0, buf)
            .map_err(|err| TraceError::Protocol(err.into()))?;

        Ok(())
    }

    fn write_memory(&mut self, addr: Address, data: &[u8]) -> Result<(), TraceError> {
        let tracee = self.stopped_tracee()?;
        tracee
            .write_memory(addr.0, data)
            .map_err(|err| TraceError::Protocol(err.into()))?;

        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }

        self.probe_alive()
    }

    fn detach(&mut self) -> Result<(), TraceError> {
        // Threads already in a trace stop can be detached directly.
        while let Some(tracee) = self.parked.pop_front() {
            if let Err(err) = ptrace::detach(tracee.pid, None) {
                debug!("unable to detach from {}: {}", tracee.pid, err);
            }
        }

        // The rest must be brought into a stop first. Group-stop the target,
        // detach each thread as it reports, then resume the group.
        if self.probe_alive() {
            if let Err(err) = nix::sys::signal::kill(self.root, Signal::SIGSTOP) {
                debug!("unable to stop target for detach: {}", err);
            }

            while let Ok(Some(tracee)) = self.tracer.wait() {
                if let Err(err) = ptrace::detach(tracee.pid, None) {
                    debug!("unable to detach from {}: {}", tracee.pid, err);
                }
            }

            let _ = nix::sys::signal::kill(self.root, Signal::SIGCONT);
        }

        self._kill_on_drop = None;
        self.exited = true;

        Ok(())
    }

    fn terminate(&mut self) {
        if self.probe_alive() {
            debug!("terminating pid: {}", self.root);
            let _ = nix::sys::signal::kill(self.root, Signal::SIGKILL);
        }

        // Release any threads held in a trace stop so the kill can complete.
        while let Some(tracee) = self.parked.pop_front() {
            let _ = self.tracer.restart(tracee, Restart::Continue);
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
            if let Some(code) = status.code() {
                output.exit_code = Some(code.into());
            }
        }

        output
    }

    fn pid(&self) -> u32 {
        self.root.as_raw() as u32
    }
}

fn thread_id(pid: Pid) -> ThreadId {
    ThreadId(pid.as_raw() as u32)
}

// Wrapper for a PID that signals it with SIGKILL when dropped.
//
// Covers panics and timeouts between spawn and an explicit `terminate`. The
// signaled PID may have already exited; the kill has no effect then.
struct KillOnDrop(Pid);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = nix::sys::signal::kill(self.0, Signal::SIGKILL);
    }
}

/// Executable memory-mapped files for a process.
#[derive(Clone, Debug)]
struct Images {
    mapped: BTreeMap<Address, ModuleImage>,
    pid: i32,
}

impl Images {
    fn new(pid: i32) -> Self {
        let mapped = BTreeMap::default();

        Self { mapped, pid }
    }

    fn update(&mut self) -> Result<LoadEvents> {
        let proc = Process::new(self.pid)?;

        let mut new = BTreeMap::new();
        let mut group: Vec<MemoryMap> = vec![];

        for map in proc.maps()? {
            if let Some(last) = group.last() {
                if last.pathname != map.pathname {
                    // The current memory mapping is the start of a new group.
                    //
                    // Consume the current group, and track any new module
                    // image.
                    if let Ok(image) = ModuleImage::new(group) {
                        let base = image.base();
                        new.insert(base, image);
                    }

                    // Reset the current group.
                    group = vec![];
                }
            }

            group.push(map);
        }

        // The loop only flushes a group when the pathname changes, so the
        // trailing group still needs to be consumed.
        if let Ok(image) = ModuleImage::new(group) {
            let base = image.base();
            new.insert(base, image);
        }

        let events = LoadEvents::new(&self.mapped, &new);

        self.mapped = new;

        Ok(events)
    }
}

/// A group of `MemoryMap`s known to be file-backed and executable.
#[derive(Clone, Debug)]
struct ModuleImage {
    base: Address,
    maps: Vec<MemoryMap>,
    path: FilePath,
}

impl ModuleImage {
    // Accepts an increasing sequence of memory mappings with a common
    // file-backed pathname.
    fn new(mut maps: Vec<MemoryMap>) -> Result<Self> {
        maps.sort_by_key(|m| m.address);

        if maps.is_empty() {
            bail!("no mapping for module image");
        }

        if !maps
            .iter()
            .any(|m| m.perms.contains(MMPermissions::EXECUTE))
        {
            bail!("no executable mapping for module image");
        }

        // Cannot panic due to initial length check.
        let first = &maps[0];

        let path = if let MMapPath::Path(path) = &first.pathname {
            FilePath::new(path.to_string_lossy())?
        } else {
            bail!("module image mappings must be file-backed");
        };

        for map in &maps {
            if map.pathname != first.pathname {
                bail!("module image mapping not file-backed");
            }
        }

        let base = Address(first.address.0);

        Ok(ModuleImage { base, maps, path })
    }

    fn path(&self) -> &FilePath {
        &self.path
    }

    fn base(&self) -> Address {
        self.base
    }

    fn size(&self) -> u64 {
        // Cannot panic, maps are non-empty by construction and sorted.
        let end = self.maps[self.maps.len() - 1].address.1;
        end.saturating_sub(self.base.0)
    }
}

struct LoadEvents {
    loaded: Vec<(Address, ModuleImage)>,
    unloaded: Vec<(Address, ModuleImage)>,
}

impl LoadEvents {
    fn new(old: &BTreeMap<Address, ModuleImage>, new: &BTreeMap<Address, ModuleImage>) -> Self {
        let same = |a: &ModuleImage, b: &ModuleImage| a.path() == b.path();

        // New not in old.
        let loaded = new
            .iter()
            .filter(|(base, image)| !old.get(base).map_or(false, |i| same(image, i)))
            .map(|(base, image)| (*base, image.clone()))
            .collect();

        // Old not in new.
        let unloaded = old
            .iter()
            .filter(|(base, image)| !new.get(base).map_or(false, |i| same(image, i)))
            .map(|(base, image)| (*base, image.clone()))
            .collect();

        Self { loaded, unloaded }
    }
}

fn set_trace_options(tracee: &mut Tracee) -> Result<()> {
    use pete::ptracer::Options;

    // Do not follow forks.
    //
    // After this, we assume that any new tracee is a thread in the same
    // group as the root tracee.
    let mut options = Options::all();
    options.remove(Options::PTRACE_O_TRACEFORK);
    options.remove(Options::PTRACE_O_TRACEVFORK);
    options.remove(Options::PTRACE_O_TRACEEXEC);
    tracee.set_options(options)?;

    Ok(())
}

fn continue_to_init_execve(tracer: &mut Ptracer) -> Result<Tracee> {
    while let Some(tracee) = tracer.wait()? {
        if let Stop::SyscallExit = &tracee.stop {
            return Ok(tracee);
        }

        tracer.restart(tracee, Restart::Continue)?;
    }

    bail!("did not see initial execve() in tracee");
}
