// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Compact formatting helpers for trace timestamps.

use std::fmt;

use crate::types::TimeNs;

const NSEC_PER_SEC: u64 = 1_000_000_000;
const NSEC_PER_USEC: u64 = 1_000;

/// Formats a nanosecond timestamp the way `perf script` prints it:
/// `seconds.microseconds`, e.g. `1234.000567`.
pub struct FmtTs(pub TimeNs);

impl fmt::Display for FmtTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / NSEC_PER_SEC,
            (self.0 % NSEC_PER_SEC) / NSEC_PER_USEC
        )
    }
}

/// Formats a nanosecond duration in whole microseconds, right-aligned to
/// six columns.
pub struct FmtUs(pub TimeNs);

impl fmt::Display for FmtUs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:6} us", self.0 / NSEC_PER_USEC)
    }
}
