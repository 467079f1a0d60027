/// Backend-assigned job identifier (`task_id` on the wire).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
