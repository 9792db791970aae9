// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{repo_state::RepoState, Identified};
use crate::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Mishap,
}

impl TaskStatus {
    /// A task is *done* iff its status is one of these (spec.md §3).
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Mishap
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub repo_state: RepoState,
    pub name: String,
    pub forced_job_id: Id,
    pub attempt: u32,

    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,

    /// The blamelist: an ordered sequence of revisions this run owns.
    pub commits: Vec<String>,

    pub result_artifact: Option<String>,
    pub executor_id: String,
    pub parent_task_ids: Vec<Id>,

    pub db_modified: DateTime<Utc>,
}

impl Task {
    pub fn new(repo_state: RepoState, name: impl Into<String>) -> Self {
        Task {
            id: Id::default(),
            repo_state,
            name: name.into(),
            forced_job_id: Id::default(),
            attempt: 1,
            status: TaskStatus::Pending,
            created: DateTime::<Utc>::default(),
            started: None,
            finished: None,
            commits: Vec::new(),
            result_artifact: None,
            executor_id: String::new(),
            parent_task_ids: Vec::new(),
            db_modified: DateTime::<Utc>::default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    /// Forced jobs and try jobs are excluded from `knownNames` (spec.md
    /// §4.5, GLOSSARY "Forced job" / "Try job").
    pub fn counts_as_known_signal(&self) -> bool {
        !self.repo_state.patch.is_try() && self.forced_job_id.is_empty()
    }
}

impl Identified for Task {
    fn id(&self) -> Id {
        self.id.clone()
    }

    fn db_modified(&self) -> DateTime<Utc> {
        self.db_modified
    }
}
