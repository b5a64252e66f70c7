// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Conversion of source line coverage into the Cobertura XML model.

use cobertura::{Class, Classes, CoberturaCoverage, Line, Lines, Package, Packages};

use crate::source::SourceCoverage;

fn line_rate(covered: u64, valid: u64) -> f64 {
    if valid == 0 {
        return 0.0;
    }

    (covered as f64) / (valid as f64)
}

impl From<&SourceCoverage> for CoberturaCoverage {
    fn from(source: &SourceCoverage) -> Self {
        let mut packages = Vec::new();
        let mut total_covered = 0;
        let mut total_valid = 0;

        // One package holding one class per source file. Lines inherit the
        // map order, so identical coverage serializes identically.
        for (path, file) in &source.files {
            let mut lines = Vec::new();
            let mut covered = 0;

            for (line, count) in &file.lines {
                if count.reached() {
                    covered += 1;
                }

                lines.push(Line {
                    number: u64::from(line.number()),
                    hits: u64::from(count.0),
                    ..Line::default()
                });
            }

            let valid = file.lines.len() as u64;
            let rate = line_rate(covered, valid);

            total_covered += covered;
            total_valid += valid;

            let class = Class {
                name: path.file_name().to_owned(),
                filename: path.to_string(),
                line_rate: rate,
                lines: Lines { lines },
                ..Class::default()
            };

            let package = Package {
                name: path.to_string(),
                line_rate: rate,
                classes: Classes {
                    classes: vec![class],
                },
                ..Package::default()
            };

            packages.push(package);
        }

        CoberturaCoverage {
            line_rate: line_rate(total_covered, total_valid),
            lines_covered: total_covered,
            lines_valid: total_valid,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            // A fixed timestamp keeps equal coverage byte-identical across
            // exports.
            timestamp: 0,
            packages: Packages { packages },
            ..CoberturaCoverage::default()
        }
    }
}

#[cfg(test)]
mod tests;
