// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::ops::Range;

use binimage::Address;
use proctrace::{TraceError, Tracer};

/// The x86 `int3` instruction.
pub const INT3: u8 = 0xcc;

/// Per-address record of every software breakpoint owned by a run.
///
/// Each address moves between two states: `Armed` (trap byte in place,
/// original byte saved here) and `PendingStep` (original byte restored so
/// the displaced instruction can execute). The ledger is the only writer of
/// trap bytes; the saved byte is never the trap byte itself.
#[derive(Debug, Default)]
pub struct BreakpointLedger {
    breakpoints: BTreeMap<Address, BreakpointState>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BreakpointState {
    Armed { original: u8 },
    PendingStep { original: u8 },
}

impl BreakpointLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a breakpoint at `addr`, at most once.
    pub fn arm(&mut self, tracer: &mut dyn Tracer, addr: Address) -> Result<(), TraceError> {
        if self.breakpoints.contains_key(&addr) {
            return Ok(());
        }

        let original = tracer.set_breakpoint(addr)?;

        if original == INT3 {
            // Another debugger owns a trap here. Back out and leave it to them.
            tracer.remove_breakpoint(addr, original)?;
            warn!("address {addr:x} already holds a trap byte");
            return Ok(());
        }

        self.breakpoints
            .insert(addr, BreakpointState::Armed { original });

        Ok(())
    }

    /// Restore the displaced byte after a hit at `addr`, so the real
    /// instruction can execute.
    ///
    /// Returns whether the address was armed by this ledger.
    pub fn on_hit(&mut self, tracer: &mut dyn Tracer, addr: Address) -> Result<bool, TraceError> {
        let Some(state) = self.breakpoints.get_mut(&addr) else {
            return Ok(false);
        };

        if let BreakpointState::Armed { original } = *state {
            tracer.remove_breakpoint(addr, original)?;
            *state = BreakpointState::PendingStep { original };
        }

        Ok(true)
    }

    /// Re-arm `addr` once the displaced instruction has been stepped.
    pub fn rearm_after_step(
        &mut self,
        tracer: &mut dyn Tracer,
        addr: Address,
    ) -> Result<(), TraceError> {
        let Some(state) = self.breakpoints.get_mut(&addr) else {
            // Unloaded mid-step.
            return Ok(());
        };

        if let BreakpointState::PendingStep { original } = *state {
            let displaced = tracer.set_breakpoint(addr)?;

            if displaced != original {
                // The target rewrote its own code; the new byte is what must
                // come back on disarm.
                warn!("displaced byte changed at {addr:x}: {original:02x} -> {displaced:02x}");
                *state = BreakpointState::Armed {
                    original: displaced,
                };
            } else {
                *state = BreakpointState::Armed { original };
            }
        }

        Ok(())
    }

    /// Drop every entry in `range` without touching target memory.
    ///
    /// For unloaded modules: the mapping is gone, so there is nothing to
    /// restore.
    pub fn forget_range(&mut self, range: Range<Address>) {
        self.breakpoints.retain(|addr, _| !range.contains(addr));
    }

    /// Restore every armed byte, best effort.
    pub fn disarm_all(&mut self, tracer: &mut dyn Tracer) {
        for (addr, state) in std::mem::take(&mut self.breakpoints) {
            if let BreakpointState::Armed { original } = state {
                if let Err(err) = tracer.remove_breakpoint(addr, original) {
                    debug!("unable to restore byte at {addr:x}: {err}");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }
}
