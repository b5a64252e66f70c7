// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use binimage::load::LoadImage;
use binimage::loader::Loader;
use binimage::path::FilePath;
use binimage::Image;
use serde::{Deserialize, Serialize};

use crate::allowlist::AllowList;
use crate::binary::{Count, CoverageMap};
use crate::cache::AnalysisCache;

/// Line coverage per source file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SourceCoverage {
    pub files: BTreeMap<FilePath, FileCoverage>,
}

/// Line coverage within one source file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FileCoverage {
    pub lines: BTreeMap<Line, Count>,
}

impl FileCoverage {
    /// Fold in a block count for `line`, keeping the maximum.
    ///
    /// Several blocks can map to one line; its count is the most-executed
    /// block, not a sum that would overstate line executions.
    pub fn accumulate(&mut self, line: Line, count: Count) {
        let entry = self.lines.entry(line).or_insert(Count(0));
        entry.0 = entry.0.max(count.0);
    }
}

/// A 1-indexed source line number.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(into = "u32", try_from = "u32")]
pub struct Line(u32);

impl Line {
    pub fn new(number: u32) -> Result<Self> {
        if number == 0 {
            bail!("line numbers are 1-indexed");
        }

        Ok(Self(number))
    }

    pub fn number(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Line {
    type Error = anyhow::Error;

    fn try_from(number: u32) -> Result<Self> {
        Self::new(number)
    }
}

impl From<Line> for u32 {
    fn from(line: Line) -> Self {
        line.0
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project binary block coverage onto source lines.
///
/// Every known block-start offset resolves through its module's debug info,
/// so uncovered lines appear with a count of zero. Files not matched by
/// `source_allowlist` are dropped. Modules whose images cannot be reloaded,
/// were rebuilt since recording, or lack usable symbols are skipped.
pub fn binary_to_source_coverage(
    coverage: &CoverageMap,
    source_allowlist: &AllowList,
    loader: &Loader,
    cache: &AnalysisCache,
) -> Result<SourceCoverage> {
    let mut source = SourceCoverage::default();

    for (id, module) in &coverage.modules {
        let image: Box<dyn Image> = match LoadImage::load(loader, id.path.clone()) {
            Ok(image) => image,
            Err(err) => {
                debug!("skipping source projection for `{}`: {err}", id.path);
                continue;
            }
        };

        if *image.build_id() != id.build_id {
            debug!(
                "skipping source projection for `{}`: build id changed",
                id.path
            );
            continue;
        }

        let symbols = match cache.symbols(&*image) {
            Ok(symbols) => symbols,
            Err(err) => {
                debug!("no usable symbols for `{}`: {err}", id.path);
                continue;
            }
        };

        for (offset, count) in module.known() {
            let Some(symbol) = symbols.resolve(*offset) else {
                continue;
            };

            if !source_allowlist.is_allowed(&symbol.file) {
                continue;
            }

            // Source paths are tracked case-insensitively on Windows.
            let file = if cfg!(windows) {
                symbol.file.to_ascii_lowercase()
            } else {
                symbol.file
            };

            let Ok(path) = FilePath::new(file) else {
                continue;
            };

            let line = Line::new(symbol.line)?;

            source.files.entry(path).or_default().accumulate(line, *count);
        }
    }

    Ok(source)
}

#[cfg(test)]
mod tests;
