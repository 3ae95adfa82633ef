use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run statistics of one periodic cadence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatus {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_run = Some(at);
        self.last_success = Some(at);
        self.run_count += 1;
        self.success_count += 1;
    }

    pub fn record_error(&mut self, at: DateTime<Utc>, error: impl ToString) {
        self.last_run = Some(at);
        self.last_error = Some(error.to_string());
        self.run_count += 1;
        self.error_count += 1;
    }
}

/// Status of both cadences driven by the control loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopTasks {
    pub state_poll: TaskStatus,
    pub boost_schedule: TaskStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_track_outcomes() {
        let mut status = TaskStatus::default();
        let now = Utc::now();
        status.record_success(now);
        status.record_error(now, "prices unavailable");
        status.record_success(now);

        assert_eq!(status.run_count, 3);
        assert_eq!(status.success_count, 2);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.last_error.as_deref(), Some("prices unavailable"));
        assert_eq!(status.last_success, Some(now));
    }
}
