// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

//! Windowed read-through caches kept in sync with a store via its
//! change bus (spec.md §4.5–§4.6).

mod job_cache;
mod task_cache;

pub use job_cache::JobCache;
pub use task_cache::TaskCache;

fn window_to_chrono(window: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
}
