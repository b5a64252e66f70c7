// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use binimage::build_id::BuildId;
use binimage::path::FilePath;
use binimage::Offset;
use serde::{Deserialize, Serialize};

/// Identity of one recorded module: its path plus the build id of the image
/// that was actually executed.
///
/// Keying coverage by both means a rebuilt binary at the same path never
/// merges into stale counts.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ModuleId {
    pub path: FilePath,
    pub build_id: BuildId,
}

impl ModuleId {
    pub fn new(path: FilePath, build_id: BuildId) -> Self {
        Self { path, build_id }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.build_id)
    }
}

/// Block coverage for a set of modules.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoverageMap {
    pub modules: BTreeMap<ModuleId, ModuleCoverage>,
}

impl CoverageMap {
    /// Take the per-offset maximum of counts, unioning modules and offsets.
    ///
    /// Commutative, associative, and idempotent, so accumulating coverage
    /// from many runs composes in any order.
    pub fn merge(&mut self, other: &Self) {
        for (id, module) in &other.modules {
            let entry = self.modules.entry(id.clone()).or_default();
            entry.merge(module);
        }
    }

    /// Take the per-offset saturating sum of counts, for callers that want
    /// totals across runs rather than set semantics.
    pub fn add(&mut self, other: &Self) {
        for (id, module) in &other.modules {
            let entry = self.modules.entry(id.clone()).or_default();
            entry.add(module);
        }
    }
}

/// Block coverage for one module: every known block-start offset, with a hit
/// count.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModuleCoverage {
    pub offsets: BTreeMap<Offset, Count>,
}

impl ModuleCoverage {
    /// Register a known block start, initially uncovered.
    ///
    /// Keeps any count already present, so re-registration on module reload
    /// does not erase earlier hits.
    pub fn insert_site(&mut self, offset: Offset) {
        self.offsets.entry(offset).or_insert(Count(0));
    }

    /// Count a hit at a known block start.
    pub fn increment(&mut self, offset: Offset) -> Result<()> {
        if let Some(count) = self.offsets.get_mut(&offset) {
            count.increment();
        } else {
            bail!("unknown coverage offset: {offset:x}");
        };

        Ok(())
    }

    pub fn merge(&mut self, other: &Self) {
        for (offset, count) in &other.offsets {
            let entry = self.offsets.entry(*offset).or_insert(Count(0));
            entry.0 = entry.0.max(count.0);
        }
    }

    pub fn add(&mut self, other: &Self) {
        for (offset, count) in &other.offsets {
            let entry = self.offsets.entry(*offset).or_insert(Count(0));
            entry.0 = entry.0.saturating_add(count.0);
        }
    }

    /// All known sites, in offset order.
    pub fn known(&self) -> impl Iterator<Item = (&Offset, &Count)> {
        self.offsets.iter()
    }

    /// Sites with at least one hit, in offset order.
    pub fn covered(&self) -> impl Iterator<Item = (&Offset, &Count)> {
        self.offsets.iter().filter(|(_, count)| count.reached())
    }
}

impl AsRef<BTreeMap<Offset, Count>> for ModuleCoverage {
    fn as_ref(&self) -> &BTreeMap<Offset, Count> {
        &self.offsets
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Count(pub u32);

impl Count {
    pub fn increment(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    pub fn reached(&self) -> bool {
        self.0 > 0
    }
}
