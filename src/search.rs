// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

//! Pure query functions over a store's range-scan path (spec.md §4.7).
//! Neither function mutates or caches anything; they exist purely to
//! give callers a documented filter surface without reimplementing
//! range-scan-then-match themselves.

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::DbError;
use crate::model::{Job, JobStatus, Task, TaskStatus};
use crate::store::{JobStore, TaskStore};

/// Matches `value` against `filter`: exact string match first, falling
/// back to a regex match. A filter that fails to compile as a regex
/// causes the candidate to be skipped rather than the whole search to
/// abort (spec.md §4.7, §7).
fn matches_str(filter: &str, value: &str) -> bool {
    if filter == value {
        return true;
    }
    match Regex::new(filter) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskSearchParams {
    pub attempt: Option<u32>,
    pub status: Option<TaskStatus>,
    pub forced_job_id: Option<String>,
    pub issue: Option<String>,
    pub name: Option<String>,
    pub patchset: Option<String>,
    pub repo: Option<String>,
    pub revision: Option<String>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobSearchParams {
    pub status: Option<JobStatus>,
    pub is_force: Option<bool>,
    pub buildbucket_build_id: Option<u64>,
    pub issue: Option<String>,
    pub name: Option<String>,
    pub patchset: Option<String>,
    pub repo: Option<String>,
    pub revision: Option<String>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
}

fn resolve_window(
    time_start: Option<DateTime<Utc>>,
    time_end: Option<DateTime<Utc>>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = match time_end {
        Some(t) if !crate::time::is_zero(t) => t,
        _ => Utc::now(),
    };
    let start = match time_start {
        Some(t) if !crate::time::is_zero(t) => t,
        _ => end - chrono::Duration::hours(24),
    };
    (start, end)
}

fn task_matches(task: &Task, params: &TaskSearchParams) -> bool {
    if let Some(attempt) = params.attempt {
        if task.attempt != attempt {
            return false;
        }
    }
    if let Some(status) = params.status {
        if task.status != status {
            return false;
        }
    }
    if let Some(forced_job_id) = &params.forced_job_id {
        if !matches_str(forced_job_id, task.forced_job_id.as_str()) {
            return false;
        }
    }
    if let Some(issue) = &params.issue {
        if !matches_str(issue, &task.repo_state.patch.issue) {
            return false;
        }
    }
    if let Some(name) = &params.name {
        if !matches_str(name, &task.name) {
            return false;
        }
    }
    if let Some(patchset) = &params.patchset {
        if !matches_str(patchset, &task.repo_state.patch.patchset) {
            return false;
        }
    }
    if let Some(revision) = &params.revision {
        if !matches_str(revision, &task.repo_state.revision) {
            return false;
        }
    }
    true
}

fn job_matches(job: &Job, params: &JobSearchParams) -> bool {
    if let Some(status) = params.status {
        if job.status != status {
            return false;
        }
    }
    if let Some(is_force) = params.is_force {
        if job.is_force != is_force {
            return false;
        }
    }
    if let Some(build_id) = params.buildbucket_build_id {
        if job.buildbucket_build_id != build_id {
            return false;
        }
    }
    if let Some(issue) = &params.issue {
        if !matches_str(issue, &job.repo_state.patch.issue) {
            return false;
        }
    }
    if let Some(name) = &params.name {
        if !matches_str(name, &job.name) {
            return false;
        }
    }
    if let Some(patchset) = &params.patchset {
        if !matches_str(patchset, &job.repo_state.patch.patchset) {
            return false;
        }
    }
    if let Some(revision) = &params.revision {
        if !matches_str(revision, &job.repo_state.revision) {
            return false;
        }
    }
    true
}

/// `SearchTasks` (spec.md §4.7): range-scans `[TimeStart, TimeEnd)`
/// (filtered by `Repo` if given) then matches every candidate against
/// the remaining filters.
pub async fn search_tasks(
    store: &dyn TaskStore,
    params: &TaskSearchParams,
) -> Result<Vec<Task>, DbError> {
    let (start, end) = resolve_window(params.time_start, params.time_end);
    let candidates = store
        .get_tasks_from_date_range(start, end, params.repo.as_deref())
        .await?;
    Ok(candidates
        .into_iter()
        .filter(|t| task_matches(t, params))
        .collect())
}

/// `SearchJobs` (spec.md §4.7).
pub async fn search_jobs(
    store: &dyn JobStore,
    params: &JobSearchParams,
) -> Result<Vec<Job>, DbError> {
    let (start, end) = resolve_window(params.time_start, params.time_end);
    let candidates = store
        .get_jobs_from_date_range(start, end, params.repo.as_deref())
        .await?;
    Ok(candidates
        .into_iter()
        .filter(|j| job_matches(j, params))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::model::RepoState;
    use crate::store::InMemoryJobStore;
    use std::sync::Arc;

    fn repo_state(repo: &str) -> RepoState {
        RepoState {
            repo: repo.to_string(),
            revision: "rev".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn search_by_name_exact_then_regex_miss() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(&StoreConfig::default()));
        for i in 0..4 {
            let mut job = Job::new(repo_state("repo"), "my-job");
            job.created = Utc::now() - chrono::Duration::seconds(i);
            store.put_job(job).await.unwrap();
        }
        let mut other = Job::new(repo_state("repo"), "my-other-job");
        other.created = Utc::now();
        store.put_job(other).await.unwrap();

        let by_name = search_jobs(
            store.as_ref(),
            &JobSearchParams {
                name: Some("my-job".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_name.len(), 4);

        let by_regex_miss = search_jobs(
            store.as_ref(),
            &JobSearchParams {
                name: Some("^T.*".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(by_regex_miss.is_empty());
    }

    #[tokio::test]
    async fn search_by_status() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(&StoreConfig::default()));
        let statuses = [
            JobStatus::Success,
            JobStatus::Failure,
            JobStatus::Failure,
            JobStatus::InProgress,
            JobStatus::Requested,
        ];
        for status in statuses {
            let mut job = Job::new(repo_state("repo"), "my-job");
            job.created = Utc::now();
            job.status = status;
            store.put_job(job).await.unwrap();
        }

        let failures = search_jobs(
            store.as_ref(),
            &JobSearchParams {
                status: Some(JobStatus::Failure),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn invalid_regex_skips_candidate_without_erroring() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(&StoreConfig::default()));
        let mut job = Job::new(repo_state("repo"), "my-job");
        job.created = Utc::now();
        store.put_job(job).await.unwrap();

        let result = search_jobs(
            store.as_ref(),
            &JobSearchParams {
                name: Some("(unterminated".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(result.is_empty());
    }
}
