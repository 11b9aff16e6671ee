//! The `cancel` operation: remove a queued or running job.
//!
//! The canceled record written here is the authoritative state; the SIGTERM
//! sent to the runner is advisory. A runner whose queue file disappears
//! out-of-band self-cancels on its next admission poll, so both paths
//! converge on a `canceled/<jobid>.json` file.

use anyhow::Result;
use std::collections::BTreeSet;
use tracing::info;

use crate::env::JobsEnv;
use crate::jobstore;
use crate::schema::{CancelReply, JobStatus, now_epoch};
use crate::services::{AliasStore, Credentials};

/// A job reference from the wire: an id, or an alias name to resolve.
#[derive(Debug, Clone)]
pub enum JobRef {
    Id(i64),
    Name(String),
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRef::Id(id) => write!(f, "{id}"),
            JobRef::Name(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub job: JobRef,
    pub user: String,
    pub token: String,
    /// Only used to scope alias lookups.
    pub project: String,
}

/// Cancel a queued or running job. Only the job's owner may cancel it.
pub fn cancel(
    env: &JobsEnv,
    creds: &dyn Credentials,
    aliases: &AliasStore,
    req: &CancelRequest,
) -> CancelReply {
    match cancel_inner(env, creds, aliases, req) {
        Ok(reply) => reply,
        Err(e) => CancelReply::failure(format!("{e:#}")),
    }
}

fn cancel_inner(
    env: &JobsEnv,
    creds: &dyn Credentials,
    aliases: &AliasStore,
    req: &CancelRequest,
) -> Result<CancelReply> {
    let verification = creds.verify(&req.user, &req.token);
    if !verification.valid {
        return Ok(CancelReply::failure(verification.message));
    }

    // Only active jobs can be canceled.
    let qids = jobstore::ids(env, JobStatus::Queued)?;
    let rids = jobstore::ids(env, JobStatus::Running)?;
    let active = &qids | &rids;

    let jobids: BTreeSet<i64> = match &req.job {
        JobRef::Id(id) => BTreeSet::from([*id]),
        JobRef::Name(name) => aliases.jobids_from_alias(&req.user, name, &req.project)?,
    };
    let current: Vec<i64> = jobids.intersection(&active).copied().collect();
    let jobid = match current.as_slice() {
        [] => return Ok(CancelReply::failure("No running or queued job found")),
        [jobid] => *jobid,
        many => {
            let listed = many
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(CancelReply::failure(format!(
                "Too many jobids found! {} in project '{}' has the following jobids \
                 queued or running for '{}': {listed}",
                req.user, req.project, req.job
            )));
        }
    };

    // Locate the record, queued first. The load retries while the runner is
    // mid-write.
    let (found_in, record) = if let Some(r) = jobstore::load(env, JobStatus::Queued, jobid)? {
        (JobStatus::Queued, r)
    } else if let Some(r) = jobstore::load(env, JobStatus::Running, jobid)? {
        (JobStatus::Running, r)
    } else {
        return Ok(CancelReply::failure(
            "Job file could not be found in queue or running.",
        ));
    };

    if record.user != req.user {
        return Ok(CancelReply {
            jobid,
            status: false,
            message: "User did not start job, cannot cancel it!".to_string(),
        });
    }

    if let Some(pid) = record.pid {
        send_sigterm(pid)?;
        info!(jobid, pid, "sent SIGTERM to runner");
    }

    let now = now_epoch();
    let mut record = record;
    if record.queue_endtime.is_none() {
        record.queue_endtime = Some(now);
    }
    if record.starttime.is_none() {
        record.starttime = Some(now);
    }
    record.endtime = Some(now);
    record.returncode = Some(1);
    record.out = Some(None);
    record.err = Some(Some("Job was canceled externally".to_string()));

    // The runner may promote the record between our read and the rename;
    // chase it across the two active directories before giving up.
    let other = match found_in {
        JobStatus::Queued => JobStatus::Running,
        _ => JobStatus::Queued,
    };
    let moved = jobstore::transition(env, found_in, JobStatus::Canceled, &record)?
        || jobstore::transition(env, other, JobStatus::Canceled, &record)?;
    if !moved {
        return Ok(CancelReply::failure(
            "Job file could not be found in queue or running.",
        ));
    }
    info!(jobid, "job canceled");
    Ok(CancelReply {
        jobid,
        status: true,
        message: "Job canceled".to_string(),
    })
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal number.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: no such process — already gone, treat as success.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<()> {
    anyhow::bail!("cancel is not supported on this platform");
}

// ---------- Unit tests ----------
