use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::config::ScheduleConfig;

/// Cron triggers for scheduled pipeline runs.
#[derive(Debug, Clone)]
pub struct Scheduler {
    entries: Vec<(String, CronSchedule)>,
}

impl Scheduler {
    /// Parse every configured expression. One bad expression rejects the set.
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let entries = config
            .cron
            .iter()
            .map(|expr| {
                CronSchedule::from_str(expr)
                    .map(|s| (expr.clone(), s))
                    .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(e, _)| e.as_str())
    }

    /// Earliest fire time strictly after `now` across all expressions.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|(_, s)| s.after(&now).next()).min()
    }

    /// Fire times within the next `hours`, sorted, with the expression that
    /// produced each. This is strictly a dry-run preview.
    pub fn preview_next_runs(&self, now: DateTime<Utc>, hours: u64) -> Vec<(DateTime<Utc>, String)> {
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for (expr, schedule) in &self.entries {
            for next_time in schedule.after(&now) {
                if next_time > end {
                    break;
                }
                preview.push((next_time, expr.clone()));
            }
        }

        preview.sort();
        preview
    }
}
