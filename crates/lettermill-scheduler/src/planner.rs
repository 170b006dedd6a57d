//! Batch Planner — schedule-time spacing for campaign sends.
//!
//! Every 80th recipient pushes the cumulative delay out by one minute, so
//! provider burst rate is capped by the schedule itself rather than by a
//! rate limiter at dispatch time.

use chrono::{DateTime, Duration, Utc};

use lettermill_core::types::Task;

/// Recipients per one-minute wave.
const WAVE_SIZE: usize = 80;

/// Plan one task per recipient, in the given order.
pub fn plan(
    recipients: &[String],
    campaign_id: &str,
    base_delay_minutes: i64,
    now: DateTime<Utc>,
) -> Vec<Task> {
    recipients
        .iter()
        .enumerate()
        .map(|(i, contact_id)| {
            let delay = base_delay_minutes + (i / WAVE_SIZE) as i64;
            Task::campaign(contact_id, campaign_id, now + Duration::minutes(delay))
        })
        .collect()
}
