//! Status payload served by `GET /status` and rendered by `GET /`.
use crate::timer::split_hms;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Worker states reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

/// The JSON payload returned by `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: WorkerStatus,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl StatusReport {
    pub fn new(running: bool, remaining_secs: u64) -> Self {
        let (hours, minutes, seconds) = split_hms(remaining_secs);
        Self {
            status: if running {
                WorkerStatus::Running
            } else {
                WorkerStatus::Stopped
            },
            hours,
            minutes,
            seconds,
        }
    }

    #[allow(dead_code)]
    pub fn remaining_secs(&self) -> u64 {
        self.hours * 3600 + self.minutes * 60 + self.seconds
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }
}

/// Details of the live worker, shown on the index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}
