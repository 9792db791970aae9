// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;

use crate::error::{BusError, DbError};
use crate::model::{CommitComment, RepoComments, TaskComment, TaskSpecComment};

use super::comment_store::{CommentSnapshot, CommentStore};
use crate::bus::Subscription;

/// A durable sink for comment mutations, called with the complete
/// in-memory map on every mutation (spec.md §4.4, "the writer is called
/// on each mutation with the complete in-memory map").
///
/// Implementations are expected to be append-only (e.g. a snapshot
/// file, an object-store blob); `PersistedCommentStore` does not read
/// from `W` on startup, only write to it.
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    async fn write_snapshot(&self, snapshot: &CommentSnapshot) -> Result<(), DbError>;
}

/// Wraps an in-memory `CommentStore` with a durable-snapshot writer.
///
/// Every mutation is staged against the in-memory map *without*
/// publishing to the bus, then the writer is handed a full snapshot of
/// the resulting map. Only once the writer succeeds is the mutation
/// published; if it fails, the staged change is undone before ever
/// becoming visible, so subscribers never observe a write that didn't
/// make it to durable storage (spec.md §4.4, last paragraph).
pub struct PersistedCommentStore<W: SnapshotWriter> {
    inner: crate::store::InMemoryCommentStore,
    writer: W,
}

impl<W: SnapshotWriter> PersistedCommentStore<W> {
    pub fn new(inner: crate::store::InMemoryCommentStore, writer: W) -> Self {
        PersistedCommentStore { inner, writer }
    }
}

#[async_trait]
impl<W: SnapshotWriter> CommentStore for PersistedCommentStore<W> {
    async fn get_comments_for_repos(
        &self,
        repos: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<RepoComments>, DbError> {
        self.inner.get_comments_for_repos(repos, since).await
    }

    async fn put_task_comment(&self, comment: TaskComment) -> Result<(), DbError> {
        let Some(comment) = self.inner.insert_task_comment(comment).await? else {
            return Ok(()); // identical comment already present, nothing to write
        };
        let snapshot = self.inner.snapshot().await;
        if let Err(e) = self.writer.write_snapshot(&snapshot).await {
            error!(error = %e, "snapshot writer rejected task comment, rolling back");
            self.inner.remove_task_comment(&comment).await;
            return Err(e);
        }
        self.inner.publish_task_comment(comment).await;
        Ok(())
    }

    async fn put_task_spec_comment(&self, comment: TaskSpecComment) -> Result<(), DbError> {
        let Some(comment) = self.inner.insert_task_spec_comment(comment).await? else {
            return Ok(());
        };
        let snapshot = self.inner.snapshot().await;
        if let Err(e) = self.writer.write_snapshot(&snapshot).await {
            error!(error = %e, "snapshot writer rejected task-spec comment, rolling back");
            self.inner.remove_task_spec_comment(&comment).await;
            return Err(e);
        }
        self.inner.publish_task_spec_comment(comment).await;
        Ok(())
    }

    async fn put_commit_comment(&self, comment: CommitComment) -> Result<(), DbError> {
        let Some(comment) = self.inner.insert_commit_comment(comment).await? else {
            return Ok(());
        };
        let snapshot = self.inner.snapshot().await;
        if let Err(e) = self.writer.write_snapshot(&snapshot).await {
            error!(error = %e, "snapshot writer rejected commit comment, rolling back");
            self.inner.remove_commit_comment(&comment).await;
            return Err(e);
        }
        self.inner.publish_commit_comment(comment).await;
        Ok(())
    }

    async fn delete_task_comment(&self, comment: TaskComment) -> Result<(), DbError> {
        let Some(removed) = self.inner.remove_task_comment(&comment).await else {
            return Ok(()); // missing target, succeeds silently per spec.md §4.4
        };
        let snapshot = self.inner.snapshot().await;
        if let Err(e) = self.writer.write_snapshot(&snapshot).await {
            error!(error = %e, "snapshot writer rejected task comment delete, rolling back");
            self.inner.insert_task_comment(removed).await.ok();
            return Err(e);
        }
        let mut tombstone = removed;
        tombstone.deleted = true;
        self.inner.publish_task_comment(tombstone).await;
        Ok(())
    }

    async fn delete_task_spec_comment(&self, comment: TaskSpecComment) -> Result<(), DbError> {
        let Some(removed) = self.inner.remove_task_spec_comment(&comment).await else {
            return Ok(());
        };
        let snapshot = self.inner.snapshot().await;
        if let Err(e) = self.writer.write_snapshot(&snapshot).await {
            error!(error = %e, "snapshot writer rejected task-spec comment delete, rolling back");
            self.inner.insert_task_spec_comment(removed).await.ok();
            return Err(e);
        }
        let mut tombstone = removed;
        tombstone.deleted = true;
        self.inner.publish_task_spec_comment(tombstone).await;
        Ok(())
    }

    async fn delete_commit_comment(&self, comment: CommitComment) -> Result<(), DbError> {
        let Some(removed) = self.inner.remove_commit_comment(&comment).await else {
            return Ok(());
        };
        let snapshot = self.inner.snapshot().await;
        if let Err(e) = self.writer.write_snapshot(&snapshot).await {
            error!(error = %e, "snapshot writer rejected commit comment delete, rolling back");
            self.inner.insert_commit_comment(removed).await.ok();
            return Err(e);
        }
        let mut tombstone = removed;
        tombstone.deleted = true;
        self.inner.publish_commit_comment(tombstone).await;
        Ok(())
    }

    fn subscribe_modified_task_comments(&self) -> Result<Subscription<TaskComment>, BusError> {
        self.inner.subscribe_modified_task_comments()
    }

    fn subscribe_modified_task_spec_comments(
        &self,
    ) -> Result<Subscription<TaskSpecComment>, BusError> {
        self.inner.subscribe_modified_task_spec_comments()
    }

    fn subscribe_modified_commit_comments(&self) -> Result<Subscription<CommitComment>, BusError> {
        self.inner.subscribe_modified_commit_comments()
    }
}
