// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::bus::BusEvent;
use crate::config::StoreConfig;
use crate::error::DbError;
use crate::ids::Id;
use crate::model::Job;
use crate::store::JobStore;
use crate::time::now_truncated;

use super::window_to_chrono;

#[derive(Default)]
struct JobCacheState {
    window_start: DateTime<Utc>,
    by_id: HashMap<Id, Job>,
    triggered_counts: HashMap<String, HashMap<String, u32>>,
    unfinished: HashMap<Id, Job>,
}

impl JobCacheState {
    fn insert(&mut self, job: &Job) {
        self.by_id.insert(job.id.clone(), job.clone());

        *self
            .triggered_counts
            .entry(job.repo_state.repo.clone())
            .or_default()
            .entry(job.repo_state.revision.clone())
            .or_insert(0) += 1;

        if !job.is_done() {
            self.unfinished.insert(job.id.clone(), job.clone());
        }
    }

    fn remove(&mut self, job: &Job) {
        self.by_id.remove(&job.id);

        if let Some(revisions) = self.triggered_counts.get_mut(&job.repo_state.repo) {
            if let Some(count) = revisions.get_mut(&job.repo_state.revision) {
                *count -= 1;
                if *count == 0 {
                    revisions.remove(&job.repo_state.revision);
                }
            }
            if revisions.is_empty() {
                self.triggered_counts.remove(&job.repo_state.repo);
            }
        }

        self.unfinished.remove(&job.id);
    }

    fn apply(&mut self, job: Job) {
        if let Some(prev) = self.by_id.get(&job.id).cloned() {
            self.remove(&prev);
        }
        if job.created < self.window_start {
            return;
        }
        self.insert(&job);
    }

    fn expire(&mut self, window_start: DateTime<Utc>) {
        self.window_start = window_start;
        let expired: Vec<Job> = self
            .by_id
            .values()
            .filter(|j| j.created < window_start)
            .cloned()
            .collect();
        for job in expired {
            self.remove(&job);
        }
    }
}

/// Read-through in-memory view of a `JobStore`, the job-cache mirror of
/// [`crate::cache::TaskCache`] (spec.md §4.6).
#[derive(Clone)]
pub struct JobCache {
    state: Arc<RwLock<JobCacheState>>,
    store: Arc<dyn JobStore>,
    window: Duration,
}

impl JobCache {
    pub async fn new(store: Arc<dyn JobStore>, config: &StoreConfig) -> Result<Self, DbError> {
        let cache = JobCache {
            state: Arc::new(RwLock::new(JobCacheState::default())),
            store,
            window: config.cache_window,
        };
        cache.reset().await?;
        let background = cache.clone();
        tokio::spawn(async move { background.run().await });
        Ok(cache)
    }

    async fn reset(&self) -> Result<(), DbError> {
        let now = now_truncated();
        let window_start = now - window_to_chrono(self.window);
        let scanned = self
            .store
            .get_jobs_from_date_range(window_start, now, None)
            .await?;

        let mut state = self.state.write().await;
        *state = JobCacheState {
            window_start,
            ..Default::default()
        };
        for job in scanned {
            state.insert(&job);
        }
        debug!(window_start = %window_start, jobs = state.by_id.len(), "job cache reset from range scan");
        Ok(())
    }

    async fn run(self) {
        loop {
            let mut sub = match self.store.subscribe_modified_jobs() {
                Ok(sub) => sub,
                Err(e) => {
                    error!(error = %e, "job cache could not subscribe, giving up");
                    return;
                }
            };
            if let Err(e) = self.reset().await {
                error!(error = %e, "job cache reset failed, giving up");
                return;
            }
            loop {
                match sub.recv().await {
                    Some(BusEvent::Batch(jobs)) => {
                        let mut state = self.state.write().await;
                        for job in jobs {
                            state.apply(job);
                        }
                    }
                    Some(BusEvent::StreamLost) => {
                        warn!("job cache subscription lagged, resetting");
                        break;
                    }
                    None => return,
                }
            }
        }
    }

    pub fn spawn_periodic_update(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.update(now_truncated()).await;
            }
        })
    }

    pub async fn update(&self, now: DateTime<Utc>) {
        let window_start = now - window_to_chrono(self.window);
        self.state.write().await.expire(window_start);
    }

    pub async fn get_job(&self, id: &Id) -> Result<Job, DbError> {
        self.state
            .read()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(id.to_string()))
    }

    pub async fn scheduled_jobs_for_commit(&self, repo: &str, revision: &str) -> bool {
        self.state
            .read()
            .await
            .triggered_counts
            .get(repo)
            .is_some_and(|revisions| revisions.contains_key(revision))
    }

    pub async fn unfinished_jobs(&self) -> Vec<Job> {
        self.state.read().await.unfinished.values().cloned().collect()
    }
}
