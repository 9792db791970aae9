// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use std::time::Duration;

/// Tunables for the store/bus/cache stack. The embedding binary builds
/// this from its own configuration source (env, flags, a config file);
/// this crate never reads the environment itself.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Rolling window kept hot in [`crate::cache::TaskCache`] /
    /// [`crate::cache::JobCache`].
    pub cache_window: Duration,
    /// Per-subscriber pending-entity cap before the bus drops it.
    pub bus_high_water_mark: usize,
    /// Maximum time a subscriber may go without draining its mailbox
    /// before the bus drops it, even under the high-water mark.
    pub bus_lag_timeout: Duration,
    /// Chunk size used by `PutTasksInChunks`/`PutJobsInChunks`.
    pub put_chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            cache_window: Duration::from_secs(4 * 3600),
            bus_high_water_mark: 4096,
            bus_lag_timeout: Duration::from_secs(10 * 60),
            put_chunk_size: 500,
        }
    }
}

/// Retry budget for `UpdateTasksWithRetries`/`UpdateTaskWithRetries`.
pub const MAX_PUT_RETRIES: u32 = 5;
