// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use binimage::build_id::BuildId;
use binimage::Offset;
use pretty_assertions::assert_eq;

use super::*;
use crate::binary::ModuleId;

#[test]
fn test_line_is_one_indexed() {
    assert!(Line::new(0).is_err());

    let line = Line::new(1).unwrap();
    assert_eq!(line.number(), 1);
}

#[test]
fn test_line_count_keeps_max_across_blocks() -> Result<()> {
    let mut file = FileCoverage::default();

    file.accumulate(Line::new(10)?, Count(1));
    file.accumulate(Line::new(10)?, Count(4));
    file.accumulate(Line::new(10)?, Count(2));

    assert_eq!(file.lines[&Line::new(10)?], Count(4));

    Ok(())
}

#[test]
fn test_uncovered_line_stays_known() -> Result<()> {
    let mut file = FileCoverage::default();

    file.accumulate(Line::new(3)?, Count(0));

    assert_eq!(file.lines.len(), 1);
    assert!(!file.lines[&Line::new(3)?].reached());

    Ok(())
}

#[test]
fn test_source_coverage_json_round_trip() -> Result<()> {
    let mut file = FileCoverage::default();
    file.accumulate(Line::new(5)?, Count(3));
    file.accumulate(Line::new(12)?, Count(0));

    let mut source = SourceCoverage::default();
    source.files.insert(FilePath::new("/src/main.c")?, file);

    let text = serde_json::to_string(&source)?;
    assert_eq!(text, r#"{"/src/main.c":{"5":3,"12":0}}"#);

    let back: SourceCoverage = serde_json::from_str(&text)?;
    assert_eq!(source, back);

    Ok(())
}

#[test]
fn test_zero_line_rejected_on_deserialize() {
    let text = r#"{"/src/main.c":{"0":1}}"#;

    let result: Result<SourceCoverage, _> = serde_json::from_str(text);
    assert!(result.is_err());
}

#[test]
fn test_unloadable_module_is_skipped() -> Result<()> {
    let path = FilePath::new("/nonexistent/prog")?;
    let id = ModuleId::new(path, BuildId::content_hash(b"prog"));

    let mut coverage = CoverageMap::default();
    coverage
        .modules
        .entry(id)
        .or_default()
        .insert_site(Offset(0x10));

    let loader = Loader::new();
    let cache = AnalysisCache::new();

    let source = binary_to_source_coverage(&coverage, &AllowList::default(), &loader, &cache)?;

    assert!(source.files.is_empty());

    Ok(())
}
