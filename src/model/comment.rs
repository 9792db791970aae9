// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Identified;
use crate::ids::Id;

/// A comment attached to one run of one task-spec against one
/// revision. Keyed by `(repo, revision, name, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComment {
    pub repo: String,
    pub revision: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,

    pub task_id: Id,
    pub user: String,
    pub message: String,
    /// Tombstone flag. Only ever `true` on a change-bus delete
    /// emission — never persisted as `true` (spec.md §3).
    pub deleted: bool,
}

/// An annotation on a task-spec itself, independent of any one run.
/// Keyed by `(repo, name, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpecComment {
    pub repo: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,

    pub user: String,
    pub message: String,
    pub flaky: bool,
    pub ignore_failure: bool,
    pub deleted: bool,
}

/// An annotation on a single commit. Keyed by `(repo, revision,
/// timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitComment {
    pub repo: String,
    pub revision: String,
    pub timestamp: DateTime<Utc>,

    pub user: String,
    pub message: String,
    pub ignore_failure: bool,
    pub deleted: bool,
}

impl TaskComment {
    /// Natural-key equality, ignoring timezone on the timestamp
    /// comparison (spec.md §3).
    pub fn same_key(&self, other: &Self) -> bool {
        self.repo == other.repo
            && self.revision == other.revision
            && self.name == other.name
            && self.timestamp.timestamp_micros() == other.timestamp.timestamp_micros()
    }

    pub fn body_eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id && self.user == other.user && self.message == other.message
    }
}

impl Identified for TaskComment {
    fn id(&self) -> Id {
        Id::from(format!(
            "task-comment/{}/{}/{}/{}",
            self.repo,
            self.revision,
            self.name,
            self.timestamp.timestamp_micros()
        ))
    }

    fn db_modified(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl TaskSpecComment {
    pub fn same_key(&self, other: &Self) -> bool {
        self.repo == other.repo
            && self.name == other.name
            && self.timestamp.timestamp_micros() == other.timestamp.timestamp_micros()
    }

    pub fn body_eq(&self, other: &Self) -> bool {
        self.user == other.user
            && self.message == other.message
            && self.flaky == other.flaky
            && self.ignore_failure == other.ignore_failure
    }
}

impl Identified for TaskSpecComment {
    fn id(&self) -> Id {
        Id::from(format!(
            "task-spec-comment/{}/{}/{}",
            self.repo,
            self.name,
            self.timestamp.timestamp_micros()
        ))
    }

    fn db_modified(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl CommitComment {
    pub fn same_key(&self, other: &Self) -> bool {
        self.repo == other.repo
            && self.revision == other.revision
            && self.timestamp.timestamp_micros() == other.timestamp.timestamp_micros()
    }

    pub fn body_eq(&self, other: &Self) -> bool {
        self.user == other.user
            && self.message == other.message
            && self.ignore_failure == other.ignore_failure
    }
}

impl Identified for CommitComment {
    fn id(&self) -> Id {
        Id::from(format!(
            "commit-comment/{}/{}/{}",
            self.repo,
            self.revision,
            self.timestamp.timestamp_micros()
        ))
    }

    fn db_modified(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// One repo's worth of comments, as returned by
/// `CommentStore::get_comments_for_repos`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoComments {
    pub repo: String,
    pub task_comments: HashMap<String, HashMap<String, Vec<TaskComment>>>,
    pub task_spec_comments: HashMap<String, Vec<TaskSpecComment>>,
    pub commit_comments: HashMap<String, Vec<CommitComment>>,
}

impl RepoComments {
    pub fn new(repo: impl Into<String>) -> Self {
        RepoComments {
            repo: repo.into(),
            task_comments: HashMap::new(),
            task_spec_comments: HashMap::new(),
            commit_comments: HashMap::new(),
        }
    }
}
