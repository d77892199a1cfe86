// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::command::{PrepareCommand, Version};
use super::Error;

/// [`StorageEngine`] is the multiversion storage that certified transactions are applied to.
///
/// The certification core guarantees that the methods are never invoked concurrently for two
/// transactions that conflict with each other, and that conflicting transactions reach the
/// storage engine in the order in which they were delivered.
///
/// Garbage collection is driven by [`StorageEngine::collect_garbage`], which is only invoked when
/// no transaction is certifying; every version older than the newest version visible to the
/// oldest active snapshot can then be reclaimed.
pub trait StorageEngine<K>: Send + Sync + 'static {
    /// Assigns a commit version to the transaction.
    ///
    /// The returned value must be greater than every version already applied to the keys of the
    /// transaction.
    fn assign_commit_version(&self, command: &PrepareCommand<K>) -> Version;

    /// Validates the transaction against the committed versions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the transaction must be rolled back.
    fn validate(&self, command: &PrepareCommand<K>, version: Version) -> Result<(), Error>;

    /// Applies the changes made by the transaction with the version.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the changes could not be applied.
    fn apply(&self, command: &PrepareCommand<K>, version: Version) -> Result<(), Error>;

    /// Discards the changes made by the transaction.
    fn discard(&self, command: &PrepareCommand<K>);

    /// Validates the transaction, and applies it if validated.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if validation or application failed.
    #[inline]
    fn validate_and_apply(&self, command: &PrepareCommand<K>, version: Version) -> Result<(), Error> {
        self.validate(command, version)?;
        self.apply(command, version)
    }

    /// Reclaims versions that are no longer visible to any reader.
    #[inline]
    fn collect_garbage(&self) {}
}
