// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as ThisError;

/// [`Error`] defines all the error codes used by the certification core.
///
/// Storage engine implementations may carry their own failure details in [`Error::Storage`].
#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum Error {
    /// The transaction conflicts with a concurrently committed transaction.
    ///
    /// This is a normal outcome of certification: the transaction is rolled back.
    #[error("the transaction conflicts with a concurrently committed transaction")]
    Conflict,

    /// An internal invariant of the dependency graph was found broken.
    ///
    /// The dependency graph cannot be trusted any longer once this is returned.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    /// The executor is shut down and cannot accept or complete tasks.
    #[error("the certification executor is shut down")]
    Shutdown,

    /// The storage engine failed to apply or discard the transaction.
    #[error("storage engine failure: {0}")]
    Storage(String),

    /// The operation was timed out.
    #[error("the operation was timed out")]
    Timeout,

    /// The message arrived in a state that cannot honor it.
    #[error("unexpected state: {0}")]
    UnexpectedState(&'static str),

    /// The supplied parameter value is wrong.
    #[error("wrong parameter: {0}")]
    WrongParameter(&'static str),
}

impl Error {
    /// Returns `true` if the error is a certification conflict rather than a failure.
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Error::InvariantViolation("writer and readers").to_string(),
            "invariant violation: writer and readers"
        );
        assert!(Error::Conflict.is_conflict());
        assert!(!Error::Timeout.is_conflict());
    }
}
