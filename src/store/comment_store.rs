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

use crate::bus::{Bus, Subscription};
use crate::config::StoreConfig;
use crate::error::{BusError, DbError};
use crate::model::{CommitComment, RepoComments, TaskComment, TaskSpecComment};
use crate::time::is_zero;

/// The Comment store contract (spec.md §4.4). Comments are immutable
/// once written; the only mutation is a tombstone delete.
#[async_trait]
pub trait CommentStore: Send + Sync {
    /// Returns exactly one `RepoComments` per requested repo, in
    /// request order. `since` is a hint: implementations may drop
    /// task-/commit-comments older than it but must never drop
    /// `TaskSpecComments`.
    async fn get_comments_for_repos(
        &self,
        repos: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<RepoComments>, DbError>;

    async fn put_task_comment(&self, comment: TaskComment) -> Result<(), DbError>;
    async fn put_task_spec_comment(&self, comment: TaskSpecComment) -> Result<(), DbError>;
    async fn put_commit_comment(&self, comment: CommitComment) -> Result<(), DbError>;

    async fn delete_task_comment(&self, comment: TaskComment) -> Result<(), DbError>;
    async fn delete_task_spec_comment(&self, comment: TaskSpecComment) -> Result<(), DbError>;
    async fn delete_commit_comment(&self, comment: CommitComment) -> Result<(), DbError>;

    fn subscribe_modified_task_comments(&self) -> Result<Subscription<TaskComment>, BusError>;
    fn subscribe_modified_task_spec_comments(
        &self,
    ) -> Result<Subscription<TaskSpecComment>, BusError>;
    fn subscribe_modified_commit_comments(&self) -> Result<Subscription<CommitComment>, BusError>;
}

/// Inserts `comment` into `slice`, kept sorted by timestamp. Walks the
/// tail first since chronological insertion — the common case — is
/// then O(1) amortized. Returns `Ok(true)` if inserted, `Ok(false)` if
/// an identical comment already existed (a no-op), `Err` if the key
/// matched but the body differed.
fn insert_sorted<T, KeyEq, BodyEq>(
    slice: &mut Vec<T>,
    comment: T,
    same_key: KeyEq,
    body_eq: BodyEq,
    timestamp: impl Fn(&T) -> DateTime<Utc>,
) -> Result<bool, DbError>
where
    KeyEq: Fn(&T, &T) -> bool,
    BodyEq: Fn(&T, &T) -> bool,
{
    for existing in slice.iter().rev() {
        if same_key(existing, &comment) {
            return if body_eq(existing, &comment) {
                Ok(false)
            } else {
                Err(DbError::AlreadyExists(
                    "comment with the same key but a different body already exists".into(),
                ))
            };
        }
    }

    let pos = slice
        .iter()
        .rposition(|e| timestamp(e) <= timestamp(&comment))
        .map(|i| i + 1)
        .unwrap_or(0);
    slice.insert(pos, comment);
    Ok(true)
}

/// The complete in-memory comment map. Handed to a [`SnapshotWriter`]
/// whole on every mutation (spec.md §4.4: "the writer is called on
/// each mutation with the complete in-memory map"), and backs
/// [`InMemoryCommentStore`]'s own storage.
///
/// [`SnapshotWriter`]: crate::store::SnapshotWriter
#[derive(Debug, Clone, Default)]
pub struct CommentSnapshot {
    pub task_comments: HashMap<String, HashMap<String, HashMap<String, Vec<TaskComment>>>>,
    pub task_spec_comments: HashMap<String, HashMap<String, Vec<TaskSpecComment>>>,
    pub commit_comments: HashMap<String, HashMap<String, Vec<CommitComment>>>,
}

pub struct InMemoryCommentStore {
    tables: Arc<RwLock<CommentSnapshot>>,
    task_comment_bus: Bus<TaskComment>,
    task_spec_comment_bus: Bus<TaskSpecComment>,
    commit_comment_bus: Bus<CommitComment>,
}

impl InMemoryCommentStore {
    pub fn new(config: &StoreConfig) -> Self {
        InMemoryCommentStore {
            tables: Arc::new(RwLock::new(CommentSnapshot::default())),
            task_comment_bus: Bus::new(config.bus_high_water_mark, config.bus_lag_timeout),
            task_spec_comment_bus: Bus::new(config.bus_high_water_mark, config.bus_lag_timeout),
            commit_comment_bus: Bus::new(config.bus_high_water_mark, config.bus_lag_timeout),
        }
    }

    /// A deep copy of the complete in-memory map, for a [`SnapshotWriter`]
    /// to persist consistently.
    ///
    /// [`SnapshotWriter`]: crate::store::SnapshotWriter
    pub async fn snapshot(&self) -> CommentSnapshot {
        self.tables.read().await.clone()
    }

    /// Inserts `comment` without publishing to the bus. Returns the
    /// comment back if it was newly inserted, `None` if it was an
    /// idempotent no-op. Lets [`crate::store::PersistedCommentStore`]
    /// stage a write, hand the durable writer a snapshot, and only then
    /// decide whether to publish — never observable to subscribers
    /// until the write actually commits.
    pub(crate) async fn insert_task_comment(
        &self,
        comment: TaskComment,
    ) -> Result<Option<TaskComment>, DbError> {
        if comment.repo.is_empty()
            || comment.revision.is_empty()
            || comment.name.is_empty()
            || is_zero(comment.timestamp)
        {
            return Err(DbError::InvalidInput(
                "task comment is missing a key field".into(),
            ));
        }
        let mut tables = self.tables.write().await;
        let slice = tables
            .task_comments
            .entry(comment.repo.clone())
            .or_default()
            .entry(comment.revision.clone())
            .or_default()
            .entry(comment.name.clone())
            .or_default();
        let inserted = insert_sorted(
            slice,
            comment.clone(),
            TaskComment::same_key,
            TaskComment::body_eq,
            |c| c.timestamp,
        )?;
        Ok(inserted.then_some(comment))
    }

    pub(crate) async fn insert_task_spec_comment(
        &self,
        comment: TaskSpecComment,
    ) -> Result<Option<TaskSpecComment>, DbError> {
        if comment.repo.is_empty() || comment.name.is_empty() || is_zero(comment.timestamp) {
            return Err(DbError::InvalidInput(
                "task-spec comment is missing a key field".into(),
            ));
        }
        let mut tables = self.tables.write().await;
        let slice = tables
            .task_spec_comments
            .entry(comment.repo.clone())
            .or_default()
            .entry(comment.name.clone())
            .or_default();
        let inserted = insert_sorted(
            slice,
            comment.clone(),
            TaskSpecComment::same_key,
            TaskSpecComment::body_eq,
            |c| c.timestamp,
        )?;
        Ok(inserted.then_some(comment))
    }

    pub(crate) async fn insert_commit_comment(
        &self,
        comment: CommitComment,
    ) -> Result<Option<CommitComment>, DbError> {
        if comment.repo.is_empty() || comment.revision.is_empty() || is_zero(comment.timestamp) {
            return Err(DbError::InvalidInput(
                "commit comment is missing a key field".into(),
            ));
        }
        let mut tables = self.tables.write().await;
        let slice = tables
            .commit_comments
            .entry(comment.repo.clone())
            .or_default()
            .entry(comment.revision.clone())
            .or_default();
        let inserted = insert_sorted(
            slice,
            comment.clone(),
            CommitComment::same_key,
            CommitComment::body_eq,
            |c| c.timestamp,
        )?;
        Ok(inserted.then_some(comment))
    }

    /// Removes `comment` by key without publishing a tombstone. Used
    /// both by `delete_*_comment` (which publishes the tombstone itself)
    /// and by [`crate::store::PersistedCommentStore`] to
    /// undo a staged insert whose durable write failed — in that case
    /// the comment never becomes visible to subscribers at all.
    pub(crate) async fn remove_task_comment(&self, comment: &TaskComment) -> Option<TaskComment> {
        let mut tables = self.tables.write().await;
        let by_rev = tables.task_comments.get_mut(&comment.repo)?;
        let by_name = by_rev.get_mut(&comment.revision)?;
        let slice = by_name.get_mut(&comment.name)?;
        let pos = slice.iter().position(|c| c.same_key(comment))?;
        Some(slice.remove(pos))
    }

    pub(crate) async fn remove_task_spec_comment(
        &self,
        comment: &TaskSpecComment,
    ) -> Option<TaskSpecComment> {
        let mut tables = self.tables.write().await;
        let by_name = tables.task_spec_comments.get_mut(&comment.repo)?;
        let slice = by_name.get_mut(&comment.name)?;
        let pos = slice.iter().position(|c| c.same_key(comment))?;
        Some(slice.remove(pos))
    }

    pub(crate) async fn remove_commit_comment(
        &self,
        comment: &CommitComment,
    ) -> Option<CommitComment> {
        let mut tables = self.tables.write().await;
        let by_rev = tables.commit_comments.get_mut(&comment.repo)?;
        let slice = by_rev.get_mut(&comment.revision)?;
        let pos = slice.iter().position(|c| c.same_key(comment))?;
        Some(slice.remove(pos))
    }

    pub(crate) async fn publish_task_comment(&self, comment: TaskComment) {
        self.task_comment_bus.publish(vec![comment]).await;
    }

    pub(crate) async fn publish_task_spec_comment(&self, comment: TaskSpecComment) {
        self.task_spec_comment_bus.publish(vec![comment]).await;
    }

    pub(crate) async fn publish_commit_comment(&self, comment: CommitComment) {
        self.commit_comment_bus.publish(vec![comment]).await;
    }
}

#[async_trait]
impl CommentStore for InMemoryCommentStore {
    async fn get_comments_for_repos(
        &self,
        repos: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<RepoComments>, DbError> {
        let tables = self.tables.read().await;
        let mut out = Vec::with_capacity(repos.len());
        for repo in repos {
            let mut rc = RepoComments::new(repo.clone());
            if let Some(by_rev) = tables.task_comments.get(repo) {
                for (rev, by_name) in by_rev {
                    for (name, comments) in by_name {
                        let filtered: Vec<TaskComment> = comments
                            .iter()
                            .filter(|c| c.timestamp >= since)
                            .cloned()
                            .collect();
                        if !filtered.is_empty() {
                            rc.task_comments
                                .entry(rev.clone())
                                .or_default()
                                .insert(name.clone(), filtered);
                        }
                    }
                }
            }
            if let Some(by_name) = tables.task_spec_comments.get(repo) {
                for (name, comments) in by_name {
                    // TaskSpecComments are never dropped by `since` — they
                    // are few and annotate the spec, not a run.
                    rc.task_spec_comments
                        .insert(name.clone(), comments.clone());
                }
            }
            if let Some(by_rev) = tables.commit_comments.get(repo) {
                for (rev, comments) in by_rev {
                    let filtered: Vec<CommitComment> = comments
                        .iter()
                        .filter(|c| c.timestamp >= since)
                        .cloned()
                        .collect();
                    if !filtered.is_empty() {
                        rc.commit_comments.insert(rev.clone(), filtered);
                    }
                }
            }
            out.push(rc);
        }
        Ok(out)
    }

    async fn put_task_comment(&self, comment: TaskComment) -> Result<(), DbError> {
        if let Some(comment) = self.insert_task_comment(comment).await? {
            self.publish_task_comment(comment).await;
        }
        Ok(())
    }

    async fn put_task_spec_comment(&self, comment: TaskSpecComment) -> Result<(), DbError> {
        if let Some(comment) = self.insert_task_spec_comment(comment).await? {
            self.publish_task_spec_comment(comment).await;
        }
        Ok(())
    }

    async fn put_commit_comment(&self, comment: CommitComment) -> Result<(), DbError> {
        if let Some(comment) = self.insert_commit_comment(comment).await? {
            self.publish_commit_comment(comment).await;
        }
        Ok(())
    }

    async fn delete_task_comment(&self, comment: TaskComment) -> Result<(), DbError> {
        if let Some(mut tombstone) = self.remove_task_comment(&comment).await {
            tombstone.deleted = true;
            self.publish_task_comment(tombstone).await;
        }
        Ok(())
    }

    async fn delete_task_spec_comment(&self, comment: TaskSpecComment) -> Result<(), DbError> {
        if let Some(mut tombstone) = self.remove_task_spec_comment(&comment).await {
            tombstone.deleted = true;
            self.publish_task_spec_comment(tombstone).await;
        }
        Ok(())
    }

    async fn delete_commit_comment(&self, comment: CommitComment) -> Result<(), DbError> {
        if let Some(mut tombstone) = self.remove_commit_comment(&comment).await {
            tombstone.deleted = true;
            self.publish_commit_comment(tombstone).await;
        }
        Ok(())
    }

    fn subscribe_modified_task_comments(&self) -> Result<Subscription<TaskComment>, BusError> {
        self.task_comment_bus.subscribe(Vec::new())
    }

    fn subscribe_modified_task_spec_comments(
        &self,
    ) -> Result<Subscription<TaskSpecComment>, BusError> {
        self.task_spec_comment_bus.subscribe(Vec::new())
    }

    fn subscribe_modified_commit_comments(&self) -> Result<Subscription<CommitComment>, BusError> {
        self.commit_comment_bus.subscribe(Vec::new())
    }
}
