// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::Offset;

/// Function table and jump labels extracted from an image's debug info.
///
/// Empty when the image is stripped; block recovery then falls back to
/// symbol- and scan-derived entry points only.
#[derive(Clone, Debug, Default)]
pub struct DebugInfo {
    functions: BTreeMap<Offset, Function>,
    labels: BTreeSet<Offset>,
}

impl DebugInfo {
    pub fn new(functions: BTreeMap<Offset, Function>, labels: Option<BTreeSet<Offset>>) -> Self {
        let labels = labels.unwrap_or_default();

        Self { functions, labels }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.labels.is_empty()
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    pub fn labels(&self) -> impl Iterator<Item = Offset> + '_ {
        self.labels.iter().copied()
    }

    /// Find the function whose extent contains `offset`, if any.
    pub fn find_function(&self, offset: Offset) -> Option<&Function> {
        // Search backwards from the last function whose entrypoint is less
        // than or equal to `offset`.
        self.functions
            .range(..=offset)
            .rev()
            .map(|(_, f)| f)
            .find(|f| f.contains(&offset))
    }

    /// Is `offset` the entrypoint of a function known not to return?
    pub fn is_noreturn_target(&self, offset: Offset) -> bool {
        self.find_function(offset)
            .map(|f| f.noreturn)
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub offset: Offset,
    pub size: u64,
    pub noreturn: bool,
}

impl Function {
    pub fn contains(&self, offset: &Offset) -> bool {
        let range = self.offset.region(self.size);
        range.contains(&offset.0)
    }

    pub fn range(&self) -> Range<Offset> {
        let lo = self.offset;
        let hi = Offset(lo.0.saturating_add(self.size));
        lo..hi
    }
}
