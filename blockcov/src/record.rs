// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use binimage::load::LoadImage;
use binimage::loader::Loader;
use binimage::{Address, Image, Offset};
use proctrace::{Fault, ModuleEvent, Output, StopEvent, ThreadId, TraceError, Tracer};

use crate::allowlist::AllowList;
use crate::binary::{CoverageMap, ModuleId};
use crate::breakpoint::BreakpointLedger;
use crate::cache::AnalysisCache;
use crate::timer::{self, TimerError};

/// Records the block coverage of one target process run.
///
/// Every statically recovered block entry of every allowed module gets a
/// software breakpoint. The result is tagged with how the run ended, and a
/// run that crashes or overruns its deadline still reports the blocks it
/// reached first.
pub struct CoverageRecorder {
    module_allowlist: AllowList,
    cache: Arc<AnalysisCache>,
    target: Target,
    loader: Arc<Loader>,
    timeout: Duration,
}

enum Target {
    Launch(Command),
    Attach(u32),
}

impl CoverageRecorder {
    pub fn new(cmd: Command) -> Self {
        Self {
            module_allowlist: AllowList::default(),
            cache: Arc::new(AnalysisCache::new()),
            target: Target::Launch(cmd),
            loader: Arc::new(Loader::new()),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn module_allowlist(mut self, module_allowlist: AllowList) -> Self {
        self.module_allowlist = module_allowlist;
        self
    }

    pub fn loader(mut self, loader: impl Into<Arc<Loader>>) -> Self {
        self.loader = loader.into();
        self
    }

    pub fn cache(mut self, cache: impl Into<Arc<AnalysisCache>>) -> Self {
        self.cache = cache.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Record an already-running process instead of launching one.
    ///
    /// The command passed to `new` is ignored. Attached targets do not own
    /// their stdio, so `output` in the result is empty.
    pub fn attach(mut self, pid: u32) -> Self {
        self.target = Target::Attach(pid);
        self
    }

    #[cfg(any(target_os = "linux", target_os = "windows"))]
    pub fn record(self) -> Result<Recorded> {
        let coverage = Arc::new(Mutex::new(CoverageMap::default()));
        let target_pid: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));

        let recorded = {
            let coverage = coverage.clone();
            let target_pid = target_pid.clone();

            let Self {
                module_allowlist,
                cache,
                target,
                loader,
                timeout,
            } = self;

            timer::timed(timeout, move || {
                let mut tracer: Box<dyn Tracer> = match target {
                    Target::Launch(cmd) => Box::new(proctrace::spawn(cmd)?),
                    Target::Attach(pid) => Box::new(proctrace::attach(pid)?),
                };

                // Save the target PID so we can send a kill on timeout.
                if let Ok(mut pid) = target_pid.lock() {
                    *pid = Some(tracer.pid());
                } else {
                    bail!("couldn't lock mutex to save target PID");
                }

                let driver = RunDriver::new(&loader, &cache, module_allowlist, coverage);

                driver.run(&mut *tracer)
            })
        };

        match recorded {
            Ok(recorded) => recorded,
            Err(TimerError::Timeout(..)) => {
                {
                    let Ok(pid) = target_pid.lock() else {
                        bail!("couldn't lock mutex to kill target PID");
                    };

                    if let Some(pid) = *pid {
                        kill_process(pid);
                    } else {
                        warn!("timeout before PID set for target process");
                    }
                }

                // The worker may still be wedged on a wait, so read the
                // shared map instead of waiting for its result.
                let Ok(coverage) = coverage.lock() else {
                    bail!("couldn't lock mutex to snapshot coverage");
                };

                Ok(Recorded {
                    coverage: coverage.clone(),
                    output: Output::default(),
                    outcome: Outcome::TimedOut,
                })
            }
            Err(err @ TimerError::Aborted) => Err(err.into()),
        }
    }
}

/// Force-kill `pid`, ignoring errors due to earlier exits.
#[cfg(target_os = "linux")]
fn kill_process(pid: u32) {
    use nix::sys::signal::{kill, SIGKILL};

    let pid = pete::Pid::from_raw(pid as i32);
    let _ = kill(pid, SIGKILL);
}

/// Force-kill `pid`, ignoring errors due to earlier exits.
#[cfg(target_os = "windows")]
fn kill_process(pid: u32) {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let process = OpenProcess(PROCESS_TERMINATE, 0, pid);

        if process.is_null() {
            return;
        }

        TerminateProcess(process, 1);
        CloseHandle(process);
    }
}

/// How a recorded run ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The target exited on its own.
    ///
    /// `exit_code` is `None` when the process was reaped out from under the
    /// debugger and no status could be read.
    Completed { exit_code: Option<i64> },

    /// The target faulted. Holds the first fatal fault observed.
    Crashed { fault: Fault },

    /// The target outlived the recording deadline and was killed.
    TimedOut,
}

impl Outcome {
    pub fn is_crash(&self) -> bool {
        matches!(self, Outcome::Crashed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Outcome::Completed {
                exit_code: Some(code),
            } => write!(f, "exited with code {code}"),
            Outcome::Completed { exit_code: None } => write!(f, "exited with unknown code"),
            Outcome::Crashed { fault } => write!(f, "crashed: {fault}"),
            Outcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// The result of one recording run.
///
/// Coverage is always present. A crashed or timed-out run carries the counts
/// collected up to the end.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Recorded {
    pub coverage: CoverageMap,
    pub output: Output,
    pub outcome: Outcome,
}

/// Platform-neutral driver of one recording run.
///
/// Owns the breakpoint ledger and the runtime module layout. Everything
/// platform-specific stays behind the `Tracer` it is handed.
struct RunDriver<'a> {
    loader: &'a Loader,
    cache: &'a AnalysisCache,
    allowlist: AllowList,
    ledger: BreakpointLedger,
    modules: BTreeMap<Address, TracedModule>,
    coverage: Arc<Mutex<CoverageMap>>,
}

/// A module currently mapped in the target, by runtime location.
struct TracedModule {
    id: ModuleId,
    base: Address,
    size: u64,
}

impl TracedModule {
    fn contains(&self, addr: Address) -> bool {
        addr.0 >= self.base.0 && addr.0 - self.base.0 < self.size
    }
}

impl<'a> RunDriver<'a> {
    fn new(
        loader: &'a Loader,
        cache: &'a AnalysisCache,
        allowlist: AllowList,
        coverage: Arc<Mutex<CoverageMap>>,
    ) -> Self {
        Self {
            loader,
            cache,
            allowlist,
            ledger: BreakpointLedger::new(),
            modules: BTreeMap::new(),
            coverage,
        }
    }

    /// Drive the target to a terminal state, then finalize the run.
    fn run(mut self, tracer: &mut dyn Tracer) -> Result<Recorded> {
        let outcome = match self.event_loop(tracer) {
            Ok(outcome) => outcome,
            Err(err) => {
                if tracer.is_alive() {
                    return Err(err);
                }

                // The target went away mid-handling. Keep what was collected.
                debug!("target gone during event handling: {err:#}");
                Outcome::Completed { exit_code: None }
            }
        };

        // Restore displaced bytes. After an exit there is no process left to
        // write to.
        if tracer.is_alive() {
            self.ledger.disarm_all(tracer);
        }

        if outcome.is_crash() {
            // Held stopped at the fault, with nothing more to observe.
            tracer.terminate();
        }

        let output = tracer.take_output();

        let Ok(coverage) = self.coverage.lock() else {
            bail!("couldn't lock mutex to finalize coverage");
        };

        Ok(Recorded {
            coverage: coverage.clone(),
            output,
            outcome,
        })
    }

    fn event_loop(&mut self, tracer: &mut dyn Tracer) -> Result<Outcome> {
        loop {
            match self.next_event(tracer)? {
                StopEvent::BreakpointHit { addr, thread } => {
                    if let Some(outcome) = self.on_breakpoint(tracer, addr, thread)? {
                        return Ok(outcome);
                    }
                }
                StopEvent::ModuleLoaded(module) => self.on_module_load(tracer, &module),
                StopEvent::ModuleUnloaded { base } => self.on_module_unload(base),
                StopEvent::ThreadCreated { thread } => {
                    trace!("thread created: {thread}");
                }
                StopEvent::ThreadExited { thread } => {
                    trace!("thread exited: {thread}");
                }
                StopEvent::ProcessExited { exit_code } => {
                    return Ok(Outcome::Completed { exit_code });
                }
                StopEvent::Crashed { fault } => {
                    info!("target crashed: {fault}");
                    return Ok(Outcome::Crashed { fault });
                }
            }
        }
    }

    /// Wait for the next stop, retrying once if the wait itself fails while
    /// the target is still alive.
    fn next_event(&mut self, tracer: &mut dyn Tracer) -> Result<StopEvent> {
        match tracer.resume() {
            Ok(event) => Ok(event),
            Err(TraceError::Protocol(err)) if tracer.is_alive() => {
                warn!("retrying wait after protocol error: {err:#}");
                Ok(tracer.resume()?)
            }
            Err(TraceError::Protocol(err)) => {
                debug!("target gone, ending run: {err:#}");
                Ok(StopEvent::ProcessExited { exit_code: None })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn on_breakpoint(
        &mut self,
        tracer: &mut dyn Tracer,
        addr: Address,
        thread: ThreadId,
    ) -> Result<Option<Outcome>> {
        if !self.ledger.on_hit(tracer, addr)? {
            warn!("breakpoint trap at address we did not arm: {addr:x}");
            return Ok(None);
        }

        self.count_hit(addr)?;

        // The displaced instruction has to execute before the trap byte goes
        // back in.
        match tracer.step_over(thread)? {
            None => {
                self.ledger.rearm_after_step(tracer, addr)?;
                Ok(None)
            }
            Some(StopEvent::ProcessExited { exit_code }) => {
                Ok(Some(Outcome::Completed { exit_code }))
            }
            Some(StopEvent::Crashed { fault }) => {
                info!("target crashed while stepping: {fault}");
                Ok(Some(Outcome::Crashed { fault }))
            }
            Some(event) => bail!("non-terminal event during single step: {event:?}"),
        }
    }

    fn count_hit(&self, addr: Address) -> Result<()> {
        let Some(module) = self.find_module(addr) else {
            warn!("breakpoint hit outside any traced module: {addr:x}");
            return Ok(());
        };

        let offset = addr.offset_from(module.base)?;
        let id = module.id.clone();

        let Ok(mut coverage) = self.coverage.lock() else {
            bail!("couldn't lock mutex to count hit");
        };

        let Some(module_coverage) = coverage.modules.get_mut(&id) else {
            bail!("coverage not initialized for module: {id}");
        };

        module_coverage.increment(offset)
    }

    fn find_module(&self, addr: Address) -> Option<&TracedModule> {
        let (_, module) = self.modules.range(..=addr).next_back()?;

        module.contains(addr).then_some(module)
    }

    fn on_module_load(&mut self, tracer: &mut dyn Tracer, module: &ModuleEvent) {
        if !self.allowlist.is_allowed(&module.path) {
            debug!("not inserting denylisted module: {}", module.path);
            return;
        }

        if let Err(err) = self.insert_module(tracer, module) {
            warn!("skipping undebuggable module `{}`: {err:#}", module.path);
        }
    }

    fn insert_module(&mut self, tracer: &mut dyn Tracer, module: &ModuleEvent) -> Result<()> {
        let image: Box<dyn Image> = LoadImage::load(self.loader, module.path.clone())?;
        let blocks = self.cache.blocks(&*image)?;

        let id = ModuleId::new(module.path.clone(), image.build_id().clone());
        let offsets: Vec<Offset> = blocks.offsets().collect();

        self.insert_sites(tracer, id, module.base, module.size, &offsets)
    }

    /// Register `offsets` as known sites of `id` and arm them at their
    /// runtime addresses.
    fn insert_sites(
        &mut self,
        tracer: &mut dyn Tracer,
        id: ModuleId,
        base: Address,
        size: u64,
        offsets: &[Offset],
    ) -> Result<()> {
        {
            let Ok(mut coverage) = self.coverage.lock() else {
                bail!("couldn't lock mutex to insert sites");
            };

            let module_coverage = coverage.modules.entry(id.clone()).or_default();

            for offset in offsets {
                module_coverage.insert_site(*offset);
            }
        }

        let mut armed = 0;

        for offset in offsets {
            let addr = base.offset_by(*offset)?;

            match self.ledger.arm(tracer, addr) {
                Ok(()) => armed += 1,
                Err(err) => debug!("unable to arm {addr:x} in `{}`: {err:#}", id.path),
            }
        }

        debug!(
            "inserted module `{}` at {:x}: {} sites, {armed} armed",
            id.path,
            base,
            offsets.len()
        );

        self.modules.insert(base, TracedModule { id, base, size });

        Ok(())
    }

    fn on_module_unload(&mut self, base: Address) {
        let Some(module) = self.modules.remove(&base) else {
            return;
        };

        debug!("module unloaded: {}", module.id.path);

        // Traps that crossed the unload may already be queued. Forgetting the
        // ledger entries makes them report as unowned instead of corrupting
        // counts.
        let end = Address(module.base.0.saturating_add(module.size));
        self.ledger.forget_range(module.base..end);
    }
}

#[cfg(test)]
mod tests;
