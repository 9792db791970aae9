// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

//! Read-modify-write helpers that retry on `ConcurrentUpdate` (spec.md
//! §4.2). Free functions layered over `&dyn TaskStore` rather than
//! trait methods, the same shape as `redis_db::RedisDbTaskManager::new`
//! wrapping a fallible operation in a bounded retry loop rather than
//! pushing retry policy into the trait it retries against.

use crate::config::MAX_PUT_RETRIES;
use crate::error::DbError;
use crate::ids::Id;
use crate::model::Task;
use crate::store::TaskStore;

/// Fetches the task by `id`, applies `mutate` to a fresh copy, and
/// `put`s it back, retrying from a fresh read whenever the store
/// reports `ConcurrentUpdate`. Gives up after [`MAX_PUT_RETRIES`]
/// attempts. Returns `NotFound` immediately (no retry) if `id` doesn't
/// resolve to a stored task.
pub async fn update_task_with_retries<F>(
    store: &dyn TaskStore,
    id: &Id,
    mut mutate: F,
) -> Result<Task, DbError>
where
    F: FnMut(&mut Task),
{
    for attempt in 0..MAX_PUT_RETRIES {
        let mut task = store
            .get_task_by_id(id)
            .await?
            .ok_or_else(|| DbError::NotFound(id.to_string()))?;
        mutate(&mut task);
        match store.put_task(task).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_concurrent_update() && attempt + 1 < MAX_PUT_RETRIES => continue,
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns within MAX_PUT_RETRIES iterations")
}

/// Batched form of [`update_task_with_retries`]: `produce` is called
/// with a fresh read of each id in `ids` (in order) and returns the
/// tasks to commit as one all-or-nothing `put_tasks` batch. The whole
/// batch is retried — from fresh reads of every id — if the store
/// reports `ConcurrentUpdate` for any member.
pub async fn update_tasks_with_retries<F>(
    store: &dyn TaskStore,
    ids: &[Id],
    mut produce: F,
) -> Result<Vec<Task>, DbError>
where
    F: FnMut(Vec<Task>) -> Vec<Task>,
{
    for attempt in 0..MAX_PUT_RETRIES {
        let mut current = Vec::with_capacity(ids.len());
        for id in ids {
            let task = store
                .get_task_by_id(id)
                .await?
                .ok_or_else(|| DbError::NotFound(id.to_string()))?;
            current.push(task);
        }
        let proposed = produce(current);
        match store.put_tasks(proposed).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_concurrent_update() && attempt + 1 < MAX_PUT_RETRIES => continue,
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns within MAX_PUT_RETRIES iterations")
}
