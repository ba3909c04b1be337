//! Per-destination cooldown.
//!
//! Jobs are partitioned by `(account_ref, destination_ref)`. The last
//! activity of a partition is the latest of each member's most specific
//! timestamp (completion, else start, else creation). A job awaiting
//! execution may run only once `upload_delay` has elapsed since then.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{Job, JobView};

/// Last activity per partition, computed once per pass.
#[derive(Debug, Clone)]
pub struct CooldownIndex {
    last_activity: HashMap<(String, String), DateTime<Utc>>,
    upload_delay: Duration,
}

impl CooldownIndex {
    /// Index every job in the list.
    pub fn build<'a>(jobs: impl IntoIterator<Item = &'a Job>, upload_delay: Duration) -> Self {
        let mut last_activity: HashMap<(String, String), DateTime<Utc>> = HashMap::new();
        for job in jobs {
            let activity = job.last_activity();
            last_activity
                .entry((job.account_ref.clone(), job.destination_ref.clone()))
                .and_modify(|last| {
                    if activity > *last {
                        *last = activity;
                    }
                })
                .or_insert(activity);
        }
        Self {
            last_activity,
            upload_delay,
        }
    }

    /// Last activity recorded for a partition.
    pub fn last_activity(&self, account_ref: &str, destination_ref: &str) -> Option<DateTime<Utc>> {
        self.last_activity
            .get(&(account_ref.to_string(), destination_ref.to_string()))
            .copied()
    }

    /// Milliseconds until `job` may run. Zero for jobs not awaiting execution.
    pub fn remaining_ms(&self, job: &Job, now: DateTime<Utc>) -> u64 {
        if !job.status.is_awaiting_execution() {
            return 0;
        }

        let last = self
            .last_activity(&job.account_ref, &job.destination_ref)
            .unwrap_or_else(|| job.last_activity());
        let delay_ms = i64::try_from(self.upload_delay.as_millis()).unwrap_or(i64::MAX);
        let elapsed_ms = (now - last).num_milliseconds();

        // Activity stamped in the future never extends the wait past one delay
        delay_ms.saturating_sub(elapsed_ms).clamp(0, delay_ms) as u64
    }

    pub fn is_eligible(&self, job: &Job, now: DateTime<Utc>) -> bool {
        self.remaining_ms(job, now) == 0
    }
}

/// Annotate jobs with their cooldown projection.
pub fn annotate(jobs: Vec<Job>, upload_delay: Duration, now: DateTime<Utc>) -> Vec<JobView> {
    let index = CooldownIndex::build(&jobs, upload_delay);
    jobs.into_iter()
        .map(|job| {
            let cooldown_remaining_ms = index.remaining_ms(&job, now);
            JobView {
                job,
                cooldown_remaining_ms,
            }
        })
        .collect()
}
