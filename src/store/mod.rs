// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

//! Store contracts (spec.md §4.2–§4.4) plus in-memory implementations.
//! Every operation is copy-in/copy-out: callers never see a reference
//! into the store's internal state.

mod comment_store;
mod job_store;
mod persisted;
mod task_store;

pub use comment_store::{CommentSnapshot, CommentStore, InMemoryCommentStore};
pub use job_store::{InMemoryJobStore, JobStore};
pub use persisted::{PersistedCommentStore, SnapshotWriter};
pub use task_store::{InMemoryTaskStore, TaskStore};

use chrono::{DateTime, Utc};

use crate::time::{is_zero, now_truncated};

/// Produces a timestamp strictly greater than `previous`, truncated to
/// microseconds — the monotonic `DbModified` stamp spec.md §4.2
/// requires on every successful `Put*`.
pub(crate) fn next_db_modified(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now_truncated();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

pub(crate) fn created_is_valid(created: DateTime<Utc>) -> bool {
    !is_zero(created)
}
