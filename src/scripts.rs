use redis::Script;

const ADD_JOB_LUA: &str = include_str!("lua/add_job.lua");
const MOVE_JOB_LUA: &str = include_str!("lua/move_job.lua");
const MOVE_TO_ACTIVE_LUA: &str = include_str!("lua/move_to_active.lua");
const COMPLETE_JOB_LUA: &str = include_str!("lua/complete_job.lua");
const FAIL_JOB_LUA: &str = include_str!("lua/fail_job.lua");
const PROMOTE_DELAYED_JOBS_LUA: &str = include_str!("lua/promote_delayed_jobs.lua");
const RECOVER_STALLED_JOBS_LUA: &str = include_str!("lua/recover_stalled_jobs.lua");
const EXTEND_LOCK_LUA: &str = include_str!("lua/extend_lock.lua");
const UPDATE_PROGRESS_LUA: &str = include_str!("lua/update_progress.lua");
const TOKEN_BUCKET_LUA: &str = include_str!("lua/token_bucket.lua");
const SLIDING_WINDOW_LUA: &str = include_str!("lua/sliding_window.lua");
const MOVE_WAITING_TO_DELAYED_LUA: &str = include_str!("lua/move_waiting_to_delayed.lua");

/// The atomic state-transition scripts, compiled once per store.
pub(crate) struct ScriptSet {
    pub add_job: Script,
    pub move_job: Script,
    pub move_to_active: Script,
    pub complete_job: Script,
    pub fail_job: Script,
    pub promote_delayed_jobs: Script,
    pub recover_stalled_jobs: Script,
    pub extend_lock: Script,
    pub update_progress: Script,
    pub token_bucket: Script,
    pub sliding_window: Script,
    pub move_waiting_to_delayed: Script,
}

impl ScriptSet {
    pub fn new() -> Self {
        Self {
            add_job: Script::new(ADD_JOB_LUA),
            move_job: Script::new(MOVE_JOB_LUA),
            move_to_active: Script::new(MOVE_TO_ACTIVE_LUA),
            complete_job: Script::new(COMPLETE_JOB_LUA),
            fail_job: Script::new(FAIL_JOB_LUA),
            promote_delayed_jobs: Script::new(PROMOTE_DELAYED_JOBS_LUA),
            recover_stalled_jobs: Script::new(RECOVER_STALLED_JOBS_LUA),
            extend_lock: Script::new(EXTEND_LOCK_LUA),
            update_progress: Script::new(UPDATE_PROGRESS_LUA),
            token_bucket: Script::new(TOKEN_BUCKET_LUA),
            sliding_window: Script::new(SLIDING_WINDOW_LUA),
            move_waiting_to_delayed: Script::new(MOVE_WAITING_TO_DELAYED_LUA),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    #[tokio::test]
    async fn lua_scripts_compile_in_redis() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        for script in [
            ADD_JOB_LUA,
            MOVE_JOB_LUA,
            MOVE_TO_ACTIVE_LUA,
            COMPLETE_JOB_LUA,
            FAIL_JOB_LUA,
            PROMOTE_DELAYED_JOBS_LUA,
            RECOVER_STALLED_JOBS_LUA,
            EXTEND_LOCK_LUA,
            UPDATE_PROGRESS_LUA,
            TOKEN_BUCKET_LUA,
            SLIDING_WINDOW_LUA,
            MOVE_WAITING_TO_DELAYED_LUA,
        ] {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(script)
                .query_async(&mut ctx.store.conn)
                .await
                .unwrap();
            assert_eq!(sha.len(), 40);
        }
    }
}
