// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::bus::{Bus, Subscription};
use crate::config::StoreConfig;
use crate::error::{BusError, DbError};
use crate::ids::Id;
use crate::model::Task;

use super::{created_is_valid, next_db_modified};

/// The Task store contract (spec.md §4.2). Implementations must be
/// `Send + Sync` so a single handle can be shared across the async
/// scheduler processes that read and write it concurrently.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fails with `AlreadyExists` if `task` already has an id;
    /// otherwise generates one and records it in place. Does not
    /// persist.
    async fn assign_id(&self, task: &mut Task) -> Result<(), DbError>;

    async fn get_task_by_id(&self, id: &Id) -> Result<Option<Task>, DbError>;

    /// `start` inclusive, `end` exclusive; sorted `(Created asc, Id
    /// asc)` for deterministic tie-break.
    async fn get_tasks_from_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        repo_filter: Option<&str>,
    ) -> Result<Vec<Task>, DbError>;

    async fn put_task(&self, task: Task) -> Result<Task, DbError> {
        let mut result = self.put_tasks(vec![task]).await?;
        Ok(result.remove(0))
    }

    /// All-or-nothing: either every task in `tasks` commits and is
    /// visible in one bus emission, or none do.
    async fn put_tasks(&self, tasks: Vec<Task>) -> Result<Vec<Task>, DbError>;

    /// Same as `put_tasks` but partitioned into `chunk_size`-sized
    /// transactions; not atomic across chunks.
    async fn put_tasks_in_chunks(
        &self,
        tasks: Vec<Task>,
        chunk_size: usize,
    ) -> Result<Vec<Task>, DbError> {
        let mut committed = Vec::with_capacity(tasks.len());
        for chunk in tasks.chunks(chunk_size.max(1)) {
            committed.extend(self.put_tasks(chunk.to_vec()).await?);
        }
        Ok(committed)
    }

    fn subscribe_modified_tasks(&self) -> Result<Subscription<Task>, BusError>;
}

#[derive(Default)]
struct TaskTable {
    by_id: HashMap<Id, Task>,
}

pub struct InMemoryTaskStore {
    table: Arc<RwLock<TaskTable>>,
    bus: Bus<Task>,
}

impl InMemoryTaskStore {
    pub fn new(config: &StoreConfig) -> Self {
        InMemoryTaskStore {
            table: Arc::new(RwLock::new(TaskTable::default())),
            bus: Bus::new(config.bus_high_water_mark, config.bus_lag_timeout),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn assign_id(&self, task: &mut Task) -> Result<(), DbError> {
        if !task.id.is_empty() {
            return Err(DbError::AlreadyExists(format!(
                "task {} already has an id",
                task.id
            )));
        }
        task.id = Id::generate();
        Ok(())
    }

    async fn get_task_by_id(&self, id: &Id) -> Result<Option<Task>, DbError> {
        let table = self.table.read().await;
        Ok(table.by_id.get(id).cloned())
    }

    async fn get_tasks_from_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        repo_filter: Option<&str>,
    ) -> Result<Vec<Task>, DbError> {
        let table = self.table.read().await;
        let mut out: Vec<Task> = table
            .by_id
            .values()
            .filter(|t| t.created >= start && t.created < end)
            .filter(|t| repo_filter.map_or(true, |r| r.is_empty() || t.repo_state.repo == r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn put_tasks(&self, mut tasks: Vec<Task>) -> Result<Vec<Task>, DbError> {
        for task in &tasks {
            if !created_is_valid(task.created) {
                return Err(DbError::InvalidInput(format!(
                    "task for {} has no Created timestamp",
                    task.name
                )));
            }
            if !task.repo_state.is_valid() {
                return Err(DbError::InvalidInput(format!(
                    "task {} has an invalid patch tuple",
                    task.id
                )));
            }
        }

        let mut table = self.table.write().await;

        // Validate every entry against the current stored state before
        // mutating anything, so the batch is all-or-nothing.
        for task in &mut tasks {
            if task.id.is_empty() {
                task.id = Id::generate();
            }
            let stored = table.by_id.get(&task.id);
            match stored {
                Some(existing) => {
                    if existing.db_modified != task.db_modified {
                        return Err(DbError::ConcurrentUpdate(task.id.to_string()));
                    }
                }
                None => {
                    if !crate::time::is_zero(task.db_modified) {
                        return Err(DbError::ConcurrentUpdate(task.id.to_string()));
                    }
                }
            }
        }

        for task in &mut tasks {
            let stored_modified = table.by_id.get(&task.id).map(|t| t.db_modified);
            task.db_modified = next_db_modified(stored_modified);
            table.by_id.insert(task.id.clone(), task.clone());
        }
        drop(table);

        debug!(count = tasks.len(), "committed task batch");
        self.bus.publish(tasks.clone()).await;
        Ok(tasks)
    }

    fn subscribe_modified_tasks(&self) -> Result<Subscription<Task>, BusError> {
        self.bus.subscribe(Vec::new())
    }
}
