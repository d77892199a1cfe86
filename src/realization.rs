// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Storage engine realizations.

mod versioned_store;
pub use versioned_store::VersionedStore;
