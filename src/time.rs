// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

use chrono::{DateTime, Timelike, Utc};

/// Truncates a timestamp to microsecond resolution, per spec: "the
/// store truncates on write".
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let micros = ts.timestamp_subsec_micros();
    ts.with_nanosecond(micros * 1_000).unwrap_or(ts)
}

pub fn now_truncated() -> DateTime<Utc> {
    truncate_to_micros(Utc::now())
}

pub fn is_zero(ts: DateTime<Utc>) -> bool {
    ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0
}
