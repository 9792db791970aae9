// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// Errors surfaced by the store, cache and retry helpers.
///
/// `NotFound` is deliberately not returned by `Get*ById` — those return
/// `Ok(None)` per spec, reserving this variant for corrupted stored
/// records and for `Delete*`/`mutate`-style helpers that need to signal
/// "nothing there to act on".
#[derive(Error, Debug)]
pub enum DbError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("concurrent update: supplied DbModified did not match stored value for {0}")]
    ConcurrentUpdate(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

impl DbError {
    pub fn is_concurrent_update(&self) -> bool {
        matches!(self, DbError::ConcurrentUpdate(_))
    }
}

/// Errors surfaced by [`crate::bus::Bus`] subscriptions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("too many subscribers")]
    TooManyUsers,

    #[error("subscriber lagged past the high-water mark and was dropped")]
    StreamLost,
}
