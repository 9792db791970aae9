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
use crate::model::Job;

use super::{created_is_valid, next_db_modified};

/// The Job store contract (spec.md §4.3) — a mirror of `TaskStore`,
/// except jobs receive their id during `put_jobs` rather than through
/// a separate `assign_id` step.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job_by_id(&self, id: &Id) -> Result<Option<Job>, DbError>;

    async fn get_jobs_from_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        repo_filter: Option<&str>,
    ) -> Result<Vec<Job>, DbError>;

    async fn put_job(&self, job: Job) -> Result<Job, DbError> {
        let mut result = self.put_jobs(vec![job]).await?;
        Ok(result.remove(0))
    }

    async fn put_jobs(&self, jobs: Vec<Job>) -> Result<Vec<Job>, DbError>;

    async fn put_jobs_in_chunks(
        &self,
        jobs: Vec<Job>,
        chunk_size: usize,
    ) -> Result<Vec<Job>, DbError> {
        let mut committed = Vec::with_capacity(jobs.len());
        for chunk in jobs.chunks(chunk_size.max(1)) {
            committed.extend(self.put_jobs(chunk.to_vec()).await?);
        }
        Ok(committed)
    }

    fn subscribe_modified_jobs(&self) -> Result<Subscription<Job>, BusError>;
}

#[derive(Default)]
struct JobTable {
    by_id: HashMap<Id, Job>,
}

pub struct InMemoryJobStore {
    table: Arc<RwLock<JobTable>>,
    bus: Bus<Job>,
}

impl InMemoryJobStore {
    pub fn new(config: &StoreConfig) -> Self {
        InMemoryJobStore {
            table: Arc::new(RwLock::new(JobTable::default())),
            bus: Bus::new(config.bus_high_water_mark, config.bus_lag_timeout),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_job_by_id(&self, id: &Id) -> Result<Option<Job>, DbError> {
        let table = self.table.read().await;
        Ok(table.by_id.get(id).cloned())
    }

    async fn get_jobs_from_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        repo_filter: Option<&str>,
    ) -> Result<Vec<Job>, DbError> {
        let table = self.table.read().await;
        let mut out: Vec<Job> = table
            .by_id
            .values()
            .filter(|j| j.created >= start && j.created < end)
            .filter(|j| repo_filter.map_or(true, |r| r.is_empty() || j.repo_state.repo == r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn put_jobs(&self, mut jobs: Vec<Job>) -> Result<Vec<Job>, DbError> {
        for job in &jobs {
            if !created_is_valid(job.created) {
                return Err(DbError::InvalidInput(format!(
                    "job for {} has no Created timestamp",
                    job.name
                )));
            }
        }

        let mut table = self.table.write().await;

        for job in &mut jobs {
            if job.id.is_empty() {
                job.id = Id::generate();
            }
            let stored = table.by_id.get(&job.id);
            match stored {
                Some(existing) => {
                    if existing.db_modified != job.db_modified {
                        return Err(DbError::ConcurrentUpdate(job.id.to_string()));
                    }
                }
                None => {
                    if !crate::time::is_zero(job.db_modified) {
                        return Err(DbError::ConcurrentUpdate(job.id.to_string()));
                    }
                }
            }
        }

        for job in &mut jobs {
            let stored_modified = table.by_id.get(&job.id).map(|j| j.db_modified);
            job.db_modified = next_db_modified(stored_modified);
            table.by_id.insert(job.id.clone(), job.clone());
        }
        drop(table);

        debug!(count = jobs.len(), "committed job batch");
        self.bus.publish(jobs.clone()).await;
        Ok(jobs)
    }

    fn subscribe_modified_jobs(&self) -> Result<Subscription<Job>, BusError> {
        self.bus.subscribe(Vec::new())
    }
}
