// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! [`Config`] of the certification core.

use super::utils;
use super::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// [`Config`] tunes the certification executor and the total-order manager.
///
/// Missing fields take their default values when deserialized.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// The number of worker threads that run certification tasks.
    pub num_workers: usize,

    /// The capacity of the channel feeding the task dispatcher.
    pub queue_capacity: usize,

    /// The interval in milliseconds at which the dispatcher re-scans pending tasks unprompted.
    pub check_interval_ms: u64,

    /// How long in milliseconds a prepare waits for a previous attempt of the same transaction to
    /// be reset.
    pub reset_wait_timeout_ms: u64,

    /// How many times a key acquisition is attempted against removed entries.
    pub max_acquire_attempts: usize,
}

impl Config {
    /// Sets the number of worker threads.
    ///
    /// # Examples
    ///
    /// ```
    /// use tocc::Config;
    ///
    /// let config = Config::default().with_num_workers(2);
    /// assert_eq!(config.num_workers, 2);
    /// assert!(config.validate().is_ok());
    /// ```
    #[inline]
    #[must_use]
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the capacity of the dispatcher channel.
    #[inline]
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the unprompted re-scan interval.
    #[inline]
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the reset wait timeout.
    #[inline]
    #[must_use]
    pub fn with_reset_wait_timeout(mut self, timeout: Duration) -> Self {
        self.reset_wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the maximum number of key acquisition attempts.
    #[inline]
    #[must_use]
    pub fn with_max_acquire_attempts(mut self, max_acquire_attempts: usize) -> Self {
        self.max_acquire_attempts = max_acquire_attempts;
        self
    }

    /// Returns the unprompted re-scan interval.
    #[inline]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Returns the reset wait timeout.
    #[inline]
    pub fn reset_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_wait_timeout_ms)
    }

    /// Checks the values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongParameter`] naming the first invalid field.
    #[inline]
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_workers == 0 {
            return Err(Error::WrongParameter("num_workers must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::WrongParameter("queue_capacity must be positive"));
        }
        if self.check_interval_ms == 0 {
            return Err(Error::WrongParameter("check_interval_ms must be positive"));
        }
        if self.max_acquire_attempts == 0 {
            return Err(Error::WrongParameter("max_acquire_attempts must be positive"));
        }
        Ok(())
    }
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Config {
            num_workers: utils::advise_num_workers(),
            queue_capacity: 1024,
            check_interval_ms: 1000,
            reset_wait_timeout_ms: 30_000,
            max_acquire_attempts: 4,
        }
    }
}
