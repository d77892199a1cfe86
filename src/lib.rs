// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs, clippy::pedantic)]

//! Total-order certification and commit scheduling for replicated transactional caches.
//!
//! Transactions delivered by a total-order broadcast are turned into a dependency graph of
//! [`Latch`] instances by the [`TotalOrderManager`], and certified by the [`Certifier`] as soon as
//! every transaction they conflict with has been released.

mod certifier;
pub use certifier::{Certifier, Delivery};

mod command;
pub use command::{Command, Epoch, PrepareCommand, TransactionId, Version};

mod config;
pub use config::Config;

mod error;
pub use error::Error;

mod latch;
pub use latch::{Latch, LatchWait, Owner};

mod lock_table;
pub use lock_table::{Access, LockTable};

mod pending_certification;
pub use pending_certification::{Outcome, PendingCertification};

pub mod realization;
pub use realization::VersionedStore;

mod remote_transaction;
pub use remote_transaction::{Claim, RemoteTransactionState, Status};

pub mod sequencer;
pub use sequencer::{AtomicCounter, Sequencer, ToInstant};

mod storage;
pub use storage::StorageEngine;

mod task_processor;
pub use task_processor::{IdleHook, ReadyTask, ScanTrigger, TaskProcessor};

mod telemetry;
pub use telemetry::Telemetry;

mod total_order_manager;
pub use total_order_manager::TotalOrderManager;

pub mod utils;

#[cfg(test)]
mod tests {
    mod scenarios;
}
