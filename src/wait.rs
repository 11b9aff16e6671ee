//! The `wait` helper: poll until a job reaches a terminal status.
//!
//! The runner is fully detached, so callers cannot `waitpid` it; this is
//! the filesystem equivalent, used by test harnesses and scripts that need
//! to block on a job's disposition.

use anyhow::Result;

use crate::env::JobsEnv;
use crate::jobstore;
use crate::schema::WaitReply;

/// Options for the `wait` subcommand.
#[derive(Debug)]
pub struct WaitOpts {
    pub jobid: i64,
    /// Poll interval in milliseconds.
    pub poll_ms: u64,
    /// Total timeout in milliseconds; 0 = wait indefinitely.
    pub timeout_ms: u64,
}

/// Poll the status directories until the job is terminal or the timeout
/// elapses.
pub fn wait(env: &JobsEnv, opts: &WaitOpts) -> Result<WaitReply> {
    let poll = std::time::Duration::from_millis(opts.poll_ms.max(1));
    let deadline = (opts.timeout_ms > 0)
        .then(|| std::time::Instant::now() + std::time::Duration::from_millis(opts.timeout_ms));

    loop {
        if let Some((status, _)) = jobstore::find(env, opts.jobid, None)?
            && status.is_terminal()
        {
            return Ok(WaitReply {
                jobid: opts.jobid,
                status: true,
                message: format!("Job {}", status.as_str()),
            });
        }
        if let Some(deadline) = deadline
            && std::time::Instant::now() >= deadline
        {
            return Ok(WaitReply {
                jobid: opts.jobid,
                status: false,
                message: "Timed out waiting for job".to_string(),
            });
        }
        std::thread::sleep(poll);
    }
}

// ---------- Unit tests ----------
