// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{repo_state::RepoState, Identified};
use crate::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Success,
    Failure,
    Mishap,
    Requested,
    Cancelled,
}

impl JobStatus {
    /// A job is *done* iff its status is neither `InProgress` nor
    /// `Requested` (spec.md §3).
    pub fn is_done(self) -> bool {
        !matches!(self, JobStatus::InProgress | JobStatus::Requested)
    }
}

/// One task-summary produced for a task-spec name: enough of a task's
/// identity and outcome for a job to report on without re-fetching the
/// full `Task` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: Id,
    pub status: super::task::TaskStatus,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Id,
    pub repo_state: RepoState,
    pub name: String,
    pub priority: i32,
    pub is_force: bool,
    pub buildbucket_build_id: u64,

    /// task-spec name -> the set of task-spec names it depends on.
    pub dependencies: HashMap<String, HashSet<String>>,
    /// task-spec name -> the ordered sequence of summaries produced.
    pub tasks: HashMap<String, Vec<TaskSummary>>,

    pub status: JobStatus,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,

    pub db_modified: DateTime<Utc>,
}

impl Job {
    pub fn new(repo_state: RepoState, name: impl Into<String>) -> Self {
        Job {
            id: Id::default(),
            repo_state,
            name: name.into(),
            priority: 0,
            is_force: false,
            buildbucket_build_id: 0,
            dependencies: HashMap::new(),
            tasks: HashMap::new(),
            status: JobStatus::Requested,
            created: DateTime::<Utc>::default(),
            started: None,
            finished: None,
            db_modified: DateTime::<Utc>::default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }
}

impl Identified for Job {
    fn id(&self) -> Id {
        self.id.clone()
    }

    fn db_modified(&self) -> DateTime<Utc> {
        self.db_modified
    }
}
