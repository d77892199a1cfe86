// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Collection of utility functions.

use std::convert::Into;
use std::thread::available_parallelism;

/// Returns the suggested number of worker threads.
///
/// Returns a non-zero `usize` value that is close to [`std::thread::available_parallelism`].
///
/// # Examples
///
/// ```
/// use tocc::utils;
///
/// assert_ne!(utils::advise_num_workers(), 0);
/// ```
#[inline]
#[must_use]
pub fn advise_num_workers() -> usize {
    available_parallelism().ok().map_or(1, Into::into)
}
