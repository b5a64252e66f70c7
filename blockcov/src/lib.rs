// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Breakpoint-driven binary block coverage.
//!
//! A recording run places a software breakpoint on every statically
//! recovered basic block entry of every allowed module in a target process,
//! then counts the hits. Runs that crash or overrun their deadline still
//! return the coverage collected up to that point.

#[macro_use]
extern crate log;

pub mod allowlist;
pub mod binary;
pub mod breakpoint;
pub mod cache;
pub mod cobertura;
pub mod record;
pub mod source;

mod timer;

#[cfg(test)]
pub(crate) mod fake;

pub use allowlist::{AllowList, TargetAllowList};
pub use record::{CoverageRecorder, Outcome, Recorded};
