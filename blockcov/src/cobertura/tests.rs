// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use binimage::path::FilePath;
use cobertura::CoberturaCoverage;
use pretty_assertions::assert_eq;

use crate::binary::Count;
use crate::source::{FileCoverage, Line, SourceCoverage};

fn sample() -> Result<SourceCoverage> {
    let mut main = FileCoverage::default();
    main.accumulate(Line::new(1)?, Count(1));
    main.accumulate(Line::new(2)?, Count(0));

    let mut util = FileCoverage::default();
    util.accumulate(Line::new(10)?, Count(2));

    let mut source = SourceCoverage::default();
    source.files.insert(FilePath::new("/src/main.c")?, main);
    source.files.insert(FilePath::new("/src/util.c")?, util);

    Ok(source)
}

#[test]
fn test_rates_and_totals() -> Result<()> {
    let source = sample()?;
    let coverage = CoberturaCoverage::from(&source);

    assert_eq!(coverage.lines_covered, 2);
    assert_eq!(coverage.lines_valid, 3);
    assert!((coverage.line_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    assert_eq!(coverage.timestamp, 0);

    assert_eq!(coverage.packages.packages.len(), 2);

    let main = &coverage.packages.packages[0];
    assert_eq!(main.name, "/src/main.c");
    assert!((main.line_rate - 0.5).abs() < f64::EPSILON);

    let class = &main.classes.classes[0];
    assert_eq!(class.name, "main.c");
    assert_eq!(class.filename, "/src/main.c");
    assert_eq!(class.lines.lines.len(), 2);

    let util = &coverage.packages.packages[1];
    assert!((util.line_rate - 1.0).abs() < f64::EPSILON);

    Ok(())
}

#[test]
fn test_empty_coverage_has_zero_rate() {
    let source = SourceCoverage::default();
    let coverage = CoberturaCoverage::from(&source);

    assert_eq!(coverage.lines_valid, 0);
    assert!((coverage.line_rate - 0.0).abs() < f64::EPSILON);
    assert!(coverage.packages.packages.is_empty());
}

#[test]
fn test_export_is_deterministic() -> Result<()> {
    let source = sample()?;

    let first = CoberturaCoverage::from(&source).to_string()?;
    let second = CoberturaCoverage::from(&source).to_string()?;

    assert_eq!(first, second);

    Ok(())
}

#[test]
fn test_export_shape() -> Result<()> {
    let source = sample()?;
    let text = CoberturaCoverage::from(&source).to_string()?;

    assert!(text.contains(r#"lines-covered="2""#));
    assert!(text.contains(r#"lines-valid="3""#));
    assert!(text.contains(r#"line-rate="0.67""#));
    assert!(text.contains(r#"timestamp="0""#));
    assert!(text.contains(r#"<class name="main.c" filename="/src/main.c""#));
    assert!(text.contains(r#"<line number="10" hits="2""#));

    Ok(())
}
