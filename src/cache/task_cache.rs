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
use crate::model::Task;
use crate::store::TaskStore;
use crate::time::now_truncated;

use super::window_to_chrono;

#[derive(Default)]
struct TaskCacheState {
    window_start: DateTime<Utc>,
    by_id: HashMap<Id, Task>,
    by_commit: HashMap<String, HashMap<String, HashMap<String, Task>>>,
    unfinished: HashMap<Id, Task>,
    known_name_counts: HashMap<String, HashMap<String, u32>>,
}

impl TaskCacheState {
    fn insert(&mut self, task: &Task) {
        self.by_id.insert(task.id.clone(), task.clone());

        for commit in &task.commits {
            self.by_commit
                .entry(task.repo_state.repo.clone())
                .or_default()
                .entry(commit.clone())
                .or_default()
                .insert(task.name.clone(), task.clone());
        }

        if !task.is_done() {
            self.unfinished.insert(task.id.clone(), task.clone());
        }

        if task.counts_as_known_signal() {
            *self
                .known_name_counts
                .entry(task.repo_state.repo.clone())
                .or_default()
                .entry(task.name.clone())
                .or_insert(0) += 1;
        }
    }

    fn remove(&mut self, task: &Task) {
        self.by_id.remove(&task.id);

        if let Some(by_commit) = self.by_commit.get_mut(&task.repo_state.repo) {
            for commit in &task.commits {
                if let Some(by_name) = by_commit.get_mut(commit) {
                    by_name.remove(&task.name);
                    if by_name.is_empty() {
                        by_commit.remove(commit);
                    }
                }
            }
            if by_commit.is_empty() {
                self.by_commit.remove(&task.repo_state.repo);
            }
        }

        self.unfinished.remove(&task.id);

        if task.counts_as_known_signal() {
            if let Some(names) = self.known_name_counts.get_mut(&task.repo_state.repo) {
                if let Some(count) = names.get_mut(&task.name) {
                    *count -= 1;
                    if *count == 0 {
                        names.remove(&task.name);
                    }
                }
                if names.is_empty() {
                    self.known_name_counts.remove(&task.repo_state.repo);
                }
            }
        }
    }

    /// Applies one incoming version: removes whatever index entries the
    /// prior version (if any) held, then reinserts the new version
    /// unless it falls outside the window (spec.md §4.5 steps 1-2).
    fn apply(&mut self, task: Task) {
        if let Some(prev) = self.by_id.get(&task.id).cloned() {
            self.remove(&prev);
        }
        if task.created < self.window_start {
            return;
        }
        self.insert(&task);
    }

    fn expire(&mut self, window_start: DateTime<Utc>) {
        self.window_start = window_start;
        let expired: Vec<Task> = self
            .by_id
            .values()
            .filter(|t| t.created < window_start)
            .cloned()
            .collect();
        for task in expired {
            self.remove(&task);
        }
    }
}

/// Read-through in-memory view of a `TaskStore`, kept current by
/// subscribing to `ModifiedTasksCh` (spec.md §4.5). Cloning shares the
/// same backing state — clones are handles, not independent caches.
#[derive(Clone)]
pub struct TaskCache {
    state: Arc<RwLock<TaskCacheState>>,
    store: Arc<dyn TaskStore>,
    window: Duration,
}

impl TaskCache {
    /// Builds the cache: an initial range scan over `[now-window, now)`
    /// followed by a background task that consumes the change bus for
    /// the cache's lifetime, resetting from scratch on `StreamLost`.
    pub async fn new(store: Arc<dyn TaskStore>, config: &StoreConfig) -> Result<Self, DbError> {
        let cache = TaskCache {
            state: Arc::new(RwLock::new(TaskCacheState::default())),
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
            .get_tasks_from_date_range(window_start, now, None)
            .await?;

        let mut state = self.state.write().await;
        *state = TaskCacheState {
            window_start,
            ..Default::default()
        };
        for task in scanned {
            state.insert(&task);
        }
        debug!(window_start = %window_start, tasks = state.by_id.len(), "task cache reset from range scan");
        Ok(())
    }

    async fn run(self) {
        loop {
            let mut sub = match self.store.subscribe_modified_tasks() {
                Ok(sub) => sub,
                Err(e) => {
                    error!(error = %e, "task cache could not subscribe, giving up");
                    return;
                }
            };
            if let Err(e) = self.reset().await {
                error!(error = %e, "task cache reset failed, giving up");
                return;
            }
            loop {
                match sub.recv().await {
                    Some(BusEvent::Batch(tasks)) => {
                        let mut state = self.state.write().await;
                        for task in tasks {
                            state.apply(task);
                        }
                    }
                    Some(BusEvent::StreamLost) => {
                        warn!("task cache subscription lagged, resetting");
                        break;
                    }
                    None => return,
                }
            }
        }
    }

    /// Spawns a ticker that calls [`TaskCache::update`] on a fixed
    /// interval for production use; tests call `update` directly
    /// instead (spec.md §4.5, "otherwise by a ticker").
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

    /// Drops everything whose `Created` has aged out of the window as
    /// of `now`. Exposed directly so tests can drive expiry
    /// deterministically without a real ticker.
    pub async fn update(&self, now: DateTime<Utc>) {
        let window_start = now - window_to_chrono(self.window);
        self.state.write().await.expire(window_start);
    }

    pub async fn get_task(&self, id: &Id) -> Result<Task, DbError> {
        self.state
            .read()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(id.to_string()))
    }

    pub async fn get_task_for_commit(
        &self,
        repo: &str,
        commit: &str,
        name: &str,
    ) -> Option<Task> {
        self.state
            .read()
            .await
            .by_commit
            .get(repo)
            .and_then(|by_commit| by_commit.get(commit))
            .and_then(|by_name| by_name.get(name))
            .cloned()
    }

    pub async fn get_tasks_for_commits(
        &self,
        repo: &str,
        commits: &[String],
    ) -> HashMap<String, HashMap<String, Task>> {
        let state = self.state.read().await;
        let by_commit = state.by_commit.get(repo);
        commits
            .iter()
            .map(|commit| {
                let by_name = by_commit
                    .and_then(|m| m.get(commit))
                    .cloned()
                    .unwrap_or_default();
                (commit.clone(), by_name)
            })
            .collect()
    }

    pub async fn get_tasks_from_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Task> {
        let state = self.state.read().await;
        let mut out: Vec<Task> = state
            .by_id
            .values()
            .filter(|t| t.created >= start && t.created < end)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn known_task_name(&self, repo: &str, name: &str) -> bool {
        self.state
            .read()
            .await
            .known_name_counts
            .get(repo)
            .is_some_and(|names| names.contains_key(name))
    }

    pub async fn unfinished_tasks(&self) -> Vec<Task> {
        self.state.read().await.unfinished.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepoState;
    use crate::store::InMemoryTaskStore;

    fn repo_state(repo: &str, rev: &str) -> RepoState {
        RepoState {
            repo: repo.to_string(),
            revision: rev.to_string(),
            ..Default::default()
        }
    }

    fn config_with_window(window: Duration) -> StoreConfig {
        StoreConfig {
            cache_window: window,
            ..StoreConfig::default()
        }
    }

    async fn flush(cache: &TaskCache) {
        // Gives the background consumption task a chance to drain the
        // bus batch published by the write just issued.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn bisect_blamelist_reassignment() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(&StoreConfig::default()));
        let t0 = Utc::now();

        let mut t1 = Task::new(repo_state("repo", "d"), "Build");
        t1.created = t0;
        t1.commits = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        let t1 = store.put_task(t1).await.unwrap();

        let cache = TaskCache::new(store.clone(), &config_with_window(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(
            cache.get_task_for_commit("repo", "c", "Build").await.unwrap().id,
            t1.id
        );

        let mut t1_updated = t1.clone();
        t1_updated.commits = vec!["a".into(), "b".into()];
        let mut t2 = Task::new(repo_state("repo", "d"), "Build");
        t2.created = t0 + chrono::Duration::minutes(1);
        t2.commits = vec!["c".into(), "d".into()];
        store.put_tasks(vec![t1_updated.clone(), t2.clone()]).await.unwrap();

        flush(&cache).await;

        let a = cache.get_task_for_commit("repo", "a", "Build").await.unwrap();
        let b = cache.get_task_for_commit("repo", "b", "Build").await.unwrap();
        let c = cache.get_task_for_commit("repo", "c", "Build").await.unwrap();
        assert_eq!(a.id, t1.id);
        assert_eq!(b.id, t1.id);
        assert_eq!(c.name, "Build");
        assert_ne!(c.id, t1.id);
    }

    #[tokio::test]
    async fn window_expiry_drops_stale_entries_and_known_names() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(&StoreConfig::default()));
        let now = Utc::now();

        let mut old = Task::new(repo_state("repo", "a"), "Build");
        old.created = now - chrono::Duration::minutes(12);
        store.put_task(old).await.unwrap();

        let mut recent = Task::new(repo_state("repo", "b"), "Build");
        recent.created = now - chrono::Duration::minutes(5);
        let recent = store.put_task(recent).await.unwrap();

        let mut current = Task::new(repo_state("repo", "c"), "Build");
        current.created = now;
        store.put_task(current).await.unwrap();

        let cache = TaskCache::new(store.clone(), &config_with_window(Duration::from_secs(10 * 60)))
            .await
            .unwrap();
        cache.update(now).await;

        assert!(cache.known_task_name("repo", "Build").await);
        let all = cache.get_tasks_from_date_range(now - chrono::Duration::hours(1), now + chrono::Duration::seconds(1)).await;
        assert!(all.iter().all(|t| t.created >= now - chrono::Duration::minutes(10)));
        assert!(all.iter().any(|t| t.id == recent.id));
    }

    #[tokio::test]
    async fn known_task_name_excludes_try_and_forced() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(&StoreConfig::default()));
        let mut try_task = Task::new(
            RepoState {
                repo: "repo".into(),
                revision: "a".into(),
                patch: crate::model::Patch {
                    server: "gerrit".into(),
                    issue: "1".into(),
                    patchset: "1".into(),
                    patch_repo: String::new(),
                },
            },
            "Build",
        );
        try_task.created = Utc::now();
        store.put_task(try_task).await.unwrap();

        let cache = TaskCache::new(store.clone(), &config_with_window(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(!cache.known_task_name("repo", "Build").await);
    }
}
