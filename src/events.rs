use crate::job::Job;

/// Internal notification from the repository to the scheduler that a job was
/// (re)scheduled into the delayed set.
#[derive(Debug, Clone)]
pub struct DelayedScheduled {
    pub id: String,
    pub due_ms: i64,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started,
    Stopped,
    Completed { job: Job },
    Failed { job: Job, error: String },
    Progress { job_id: String, progress: i64 },
    Error { message: String },
}
