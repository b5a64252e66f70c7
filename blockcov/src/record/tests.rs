// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use binimage::build_id::BuildId;
use binimage::path::FilePath;
use pretty_assertions::assert_eq;

use super::*;
use crate::binary::Count;
use crate::fake::{FakeTracer, Op};

const BASE: u64 = 0x7000_0000;

fn module_id(name: &str) -> ModuleId {
    let path = FilePath::new(name).unwrap();
    let build_id = BuildId::content_hash(name.as_bytes());

    ModuleId::new(path, build_id)
}

fn map_sites(tracer: &mut FakeTracer, offsets: &[u64]) {
    for offset in offsets {
        tracer.map(Address(BASE + offset), &[0x55]);
    }
}

fn hit(offset: u64, thread: ThreadId) -> StopEvent {
    StopEvent::BreakpointHit {
        addr: Address(BASE + offset),
        thread,
    }
}

#[test]
fn test_driver_counts_hits_and_rearms() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    map_sites(&mut tracer, &[0x1000, 0x1010]);

    let id = module_id("/fake/target");
    let mut driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    driver.insert_sites(
        &mut tracer,
        id.clone(),
        Address(BASE),
        0x2000,
        &[Offset(0x1000), Offset(0x1010)],
    )?;

    let thread = ThreadId(1);
    tracer.push_event(hit(0x1000, thread));
    tracer.push_event(hit(0x1000, thread));

    let recorded = driver.run(&mut tracer)?;

    assert_eq!(recorded.outcome, Outcome::Completed { exit_code: Some(0) });

    let module = &recorded.coverage.modules[&id];
    assert_eq!(module.offsets[&Offset(0x1000)], Count(2));
    assert_eq!(module.offsets[&Offset(0x1010)], Count(0));

    // Each hit restores the byte, steps the thread, then re-arms.
    let addr = Address(BASE + 0x1000);
    assert_eq!(
        tracer.ops,
        vec![
            Op::Set(addr),
            Op::Set(Address(BASE + 0x1010)),
            Op::Remove(addr),
            Op::Step(thread),
            Op::Set(addr),
            Op::Remove(addr),
            Op::Step(thread),
            Op::Set(addr),
        ]
    );

    Ok(())
}

#[test]
fn test_only_executed_blocks_count() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();

    // Block layout of a small `if .. else ..`: entry, then, else, join.
    let sites = [0x1000, 0x1006, 0x100a, 0x100c];
    map_sites(&mut tracer, &sites);

    let id = module_id("/fake/branchy");
    let mut driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    let offsets: Vec<Offset> = sites.iter().copied().map(Offset).collect();
    driver.insert_sites(&mut tracer, id.clone(), Address(BASE), 0x2000, &offsets)?;

    // Execute the `then` path only.
    let thread = ThreadId(1);
    for offset in [0x1000, 0x1006, 0x100c] {
        tracer.push_event(hit(offset, thread));
    }

    let recorded = driver.run(&mut tracer)?;

    let module = &recorded.coverage.modules[&id];
    let covered: Vec<u64> = module.covered().map(|(offset, _)| offset.0).collect();
    assert_eq!(covered, vec![0x1000, 0x1006, 0x100c]);
    assert_eq!(module.offsets[&Offset(0x100a)], Count(0));

    Ok(())
}

#[test]
fn test_crash_keeps_partial_coverage() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    map_sites(&mut tracer, &[0x1000, 0x1010]);

    let id = module_id("/fake/crasher");
    let mut driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    driver.insert_sites(
        &mut tracer,
        id.clone(),
        Address(BASE),
        0x2000,
        &[Offset(0x1000), Offset(0x1010)],
    )?;

    tracer.push_event(hit(0x1000, ThreadId(1)));
    tracer.push_event(StopEvent::Crashed {
        fault: Fault::Signal {
            signo: 11,
            name: "SIGSEGV".into(),
        },
    });

    let recorded = driver.run(&mut tracer)?;

    assert!(recorded.outcome.is_crash());

    let module = &recorded.coverage.modules[&id];
    assert_eq!(module.offsets[&Offset(0x1000)], Count(1));
    assert_eq!(module.offsets[&Offset(0x1010)], Count(0));

    // The faulted process is cleaned up after its bytes are restored.
    assert_eq!(tracer.ops.last(), Some(&Op::Terminate));
    assert_eq!(tracer.byte_at(Address(BASE + 0x1000)), Some(0x55));
    assert_eq!(tracer.byte_at(Address(BASE + 0x1010)), Some(0x55));

    Ok(())
}

#[test]
fn test_undebuggable_module_is_skipped() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    tracer.push_event(StopEvent::ModuleLoaded(ModuleEvent {
        path: FilePath::new("/nonexistent/lib.so")?,
        base: Address(BASE),
        size: 0x1000,
    }));

    let driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    let recorded = driver.run(&mut tracer)?;

    // The unreadable module degrades; the run itself completes.
    assert_eq!(recorded.outcome, Outcome::Completed { exit_code: Some(0) });
    assert!(recorded.coverage.modules.is_empty());
    assert_eq!(tracer.ops, vec![]);

    Ok(())
}

#[test]
fn test_denied_module_is_not_armed() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let allowlist = AllowList::parse("*\n! /opt/denied/*")?;

    let mut tracer = FakeTracer::new();
    tracer.push_event(StopEvent::ModuleLoaded(ModuleEvent {
        path: FilePath::new("/opt/denied/lib.so")?,
        base: Address(BASE),
        size: 0x1000,
    }));

    let driver = RunDriver::new(&loader, &cache, allowlist, coverage);
    let recorded = driver.run(&mut tracer)?;

    assert!(recorded.coverage.modules.is_empty());
    assert_eq!(tracer.ops, vec![]);

    Ok(())
}

#[test]
fn test_unloaded_module_traps_are_ignored() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    map_sites(&mut tracer, &[0x1000]);

    let id = module_id("/fake/plugin");
    let mut driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    driver.insert_sites(&mut tracer, id.clone(), Address(BASE), 0x2000, &[Offset(0x1000)])?;

    // A trap that raced the unload is already queued behind it.
    tracer.push_event(StopEvent::ModuleUnloaded {
        base: Address(BASE),
    });
    tracer.push_event(hit(0x1000, ThreadId(1)));

    let recorded = driver.run(&mut tracer)?;

    // Known sites survive the unload, but the stale trap counts nothing.
    let module = &recorded.coverage.modules[&id];
    assert_eq!(module.offsets[&Offset(0x1000)], Count(0));
    assert_eq!(tracer.ops, vec![Op::Set(Address(BASE + 0x1000))]);

    Ok(())
}

#[test]
fn test_exit_during_step_skips_rearm() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    map_sites(&mut tracer, &[0x1000]);

    let id = module_id("/fake/exits-early");
    let mut driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    driver.insert_sites(&mut tracer, id.clone(), Address(BASE), 0x2000, &[Offset(0x1000)])?;

    let thread = ThreadId(1);
    tracer.push_event(hit(0x1000, thread));
    tracer
        .step_results
        .push_back(Ok(Some(StopEvent::ProcessExited { exit_code: Some(7) })));

    let recorded = driver.run(&mut tracer)?;

    assert_eq!(recorded.outcome, Outcome::Completed { exit_code: Some(7) });

    let module = &recorded.coverage.modules[&id];
    assert_eq!(module.offsets[&Offset(0x1000)], Count(1));

    // No re-arm after the preempted step.
    let addr = Address(BASE + 0x1000);
    assert_eq!(
        tracer.ops,
        vec![Op::Set(addr), Op::Remove(addr), Op::Step(thread)]
    );

    Ok(())
}

#[test]
fn test_crash_during_step_keeps_hit() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    map_sites(&mut tracer, &[0x1000]);

    let id = module_id("/fake/crashes-stepping");
    let mut driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    driver.insert_sites(&mut tracer, id.clone(), Address(BASE), 0x2000, &[Offset(0x1000)])?;

    let thread = ThreadId(1);
    tracer.push_event(hit(0x1000, thread));
    tracer.step_results.push_back(Ok(Some(StopEvent::Crashed {
        fault: Fault::Signal {
            signo: 4,
            name: "SIGILL".into(),
        },
    })));

    let recorded = driver.run(&mut tracer)?;

    assert!(recorded.outcome.is_crash());

    let module = &recorded.coverage.modules[&id];
    assert_eq!(module.offsets[&Offset(0x1000)], Count(1));
    assert_eq!(tracer.ops.last(), Some(&Op::Terminate));

    Ok(())
}

#[test]
fn test_wait_is_retried_after_protocol_error() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    map_sites(&mut tracer, &[0x1000]);

    let id = module_id("/fake/flaky");
    let mut driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    driver.insert_sites(&mut tracer, id.clone(), Address(BASE), 0x2000, &[Offset(0x1000)])?;

    tracer.push_error("spurious wait failure");
    tracer.push_event(hit(0x1000, ThreadId(1)));

    let recorded = driver.run(&mut tracer)?;

    assert_eq!(recorded.outcome, Outcome::Completed { exit_code: Some(0) });

    let module = &recorded.coverage.modules[&id];
    assert_eq!(module.offsets[&Offset(0x1000)], Count(1));

    Ok(())
}

#[test]
fn test_protocol_error_after_exit_ends_run() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    tracer.alive = false;
    tracer.push_error("wait failed");

    let driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage);
    let recorded = driver.run(&mut tracer)?;

    assert_eq!(recorded.outcome, Outcome::Completed { exit_code: None });

    Ok(())
}

#[test]
fn test_unmapped_site_does_not_fail_module() -> Result<()> {
    let loader = Loader::new();
    let cache = AnalysisCache::new();
    let coverage = Arc::new(Mutex::new(CoverageMap::default()));

    let mut tracer = FakeTracer::new();
    map_sites(&mut tracer, &[0x1000]);

    let id = module_id("/fake/partial");
    let mut driver = RunDriver::new(&loader, &cache, AllowList::default(), coverage.clone());
    driver.insert_sites(
        &mut tracer,
        id.clone(),
        Address(BASE),
        0x2000,
        &[Offset(0x1000), Offset(0x1010)],
    )?;

    // Only the mapped site armed, but both are known.
    assert_eq!(driver.ledger.len(), 1);

    let coverage = coverage.lock().unwrap();
    let module = &coverage.modules[&id];
    assert_eq!(module.known().count(), 2);

    Ok(())
}
