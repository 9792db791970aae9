// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use serde::{Deserialize, Serialize};

/// A pre-submit code-review patch applied on top of `revision`. All
/// four fields are either empty together or set together, except
/// `patch_repo`, which may be absent even when the others are set
/// (spec.md §3, "backwards exception").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub server: String,
    pub issue: String,
    pub patchset: String,
    pub patch_repo: String,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.server.is_empty() && self.issue.is_empty() && self.patchset.is_empty()
    }

    /// Validates the "all four empty or all set, `patch_repo` excepted"
    /// invariant from spec.md §3.
    pub fn is_valid(&self) -> bool {
        if self.is_empty() {
            return self.patch_repo.is_empty();
        }
        !self.server.is_empty() && !self.issue.is_empty() && !self.patchset.is_empty()
    }

    /// A try job is one whose patch tuple is fully set (GLOSSARY).
    pub fn is_try(&self) -> bool {
        !self.is_empty()
    }
}

/// The `(Repo, Revision, Patch)` tuple identifying the code under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    pub repo: String,
    pub revision: String,
    pub patch: Patch,
}

impl RepoState {
    pub fn is_valid(&self) -> bool {
        self.patch.is_valid()
    }
}
