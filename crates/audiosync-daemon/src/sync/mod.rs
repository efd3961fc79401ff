// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The synchronization engine: device identity, topology diffing, the
//! reconcile pass, hot-plug monitoring and recovery.

pub mod classify;
pub mod monitor;
pub mod reconcile;
pub mod recovery;
pub mod registry;
pub mod topology;
pub mod worker;

pub use reconcile::Reconciler;
pub use worker::{SyncCommand, SyncWorker, WorkerError};
