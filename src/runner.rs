//! The per-job supervisor process, launched detached by `spawn`.
//!
//! The runner owns every on-disk transition of its job: it enqueues the
//! record, polls the queue for admission, promotes itself to running,
//! invokes the simulator, and writes the terminal disposition. There is no
//! central scheduler; each runner admits itself when its id is among the
//! `FIXIE_NJOBS` smallest queued ids, which (ids being monotone) yields
//! FIFO admission with bounded concurrency.

use anyhow::{Context, Result, bail};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

use crate::env::JobsEnv;
use crate::jobstore;
use crate::schema::{JobRecord, JobStatus, now_epoch};
use crate::spawn::Handoff;

/// Interval between admission polls.
const ADMISSION_TICK: std::time::Duration = std::time::Duration::from_millis(100);

/// Options for the hidden `runner` subcommand.
#[derive(Debug)]
pub struct RunnerOpts<'a> {
    pub jobid: i64,
    /// Path to the handoff file written by spawn.
    pub input: &'a Path,
}

/// Supervise one job from enqueue to terminal disposition.
pub fn execute(env: &JobsEnv, opts: RunnerOpts) -> Result<()> {
    let handoff = read_handoff(opts.input)?;
    if handoff.jobid != opts.jobid {
        bail!(
            "handoff {} is for job {} but runner was launched for job {}",
            opts.input.display(),
            handoff.jobid,
            opts.jobid
        );
    }
    let _ = std::fs::remove_file(opts.input);

    let outfile = env.outfile(opts.jobid);
    let mut record = JobRecord::enqueued(
        opts.jobid,
        handoff.user,
        handoff.project,
        handoff.simulation,
        outfile.display().to_string(),
        std::process::id(),
    );
    // Spawn already validated these; the record keeps a faithful copy of
    // the request.
    record.interactive = handoff.interactive;
    record.notify = handoff.notify;
    record.permissions = handoff.permissions;
    record.post = handoff.post;
    jobstore::write_record(env, JobStatus::Queued, &record)?;
    info!(jobid = record.jobid, "job enqueued");

    loop {
        let qids = jobstore::ids(env, JobStatus::Queued)?;
        match admission(&qids, record.jobid, env.njobs) {
            Admission::Admitted => break,
            Admission::Gone => return self_cancel(env, record),
            Admission::Waiting => std::thread::sleep(ADMISSION_TICK),
        }
    }

    record.queue_endtime = Some(now_epoch());
    if !jobstore::transition(env, JobStatus::Queued, JobStatus::Running, &record)? {
        // The queue file vanished between the eligibility check and the
        // rename; same outcome as discovering it gone during the poll.
        return self_cancel(env, record);
    }
    info!(jobid = record.jobid, "job admitted");

    // Run the simulator. A failing simulation is a recorded outcome, not a
    // runner error.
    let input = serde_json::to_string(&record.simulation)?;
    let starttime = now_epoch();
    let output = Command::new(&env.simulator)
        .arg("-f")
        .arg("json")
        .arg("-o")
        .arg(&outfile)
        .arg(&input)
        .output();
    let endtime = now_epoch();

    let (returncode, out, err) = match output {
        Ok(output) => (
            i64::from(output.status.code().unwrap_or(1)),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ),
        Err(e) => (
            1,
            String::new(),
            format!("failed to invoke simulator {:?}: {e}", env.simulator),
        ),
    };

    record.returncode = Some(returncode);
    record.starttime = Some(starttime);
    record.endtime = Some(endtime);
    record.out = Some(Some(out));
    record.err = Some(Some(err));

    let disposition = if returncode == 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    if !jobstore::transition(env, JobStatus::Running, disposition, &record)? {
        bail!(
            "job {} disappeared from the running directory",
            record.jobid
        );
    }
    info!(
        jobid = record.jobid,
        returncode,
        disposition = disposition.as_str(),
        "job finished"
    );
    if returncode != 0 {
        bail!("simulation exited with code {returncode}");
    }
    Ok(())
}

enum Admission {
    Admitted,
    Waiting,
    Gone,
}

/// Eligibility under the decentralized admission rule: admitted when our id
/// is among the `njobs` smallest queued ids, self-cancel when it is not
/// queued at all.
fn admission(qids: &BTreeSet<i64>, jobid: i64, njobs: usize) -> Admission {
    if qids.iter().take(njobs).any(|id| *id == jobid) {
        Admission::Admitted
    } else if !qids.contains(&jobid) {
        Admission::Gone
    } else {
        Admission::Waiting
    }
}

/// The queue file was removed out-of-band: record the cancellation and exit
/// non-zero.
fn self_cancel(env: &JobsEnv, mut record: JobRecord) -> Result<()> {
    let err = "Job canceled itself after jobfile was removed from queue";
    record.queue_endtime = Some(now_epoch());
    record.returncode = Some(1);
    record.out = Some(None);
    record.err = Some(Some(err.to_string()));
    jobstore::write_record(env, JobStatus::Canceled, &record)?;
    warn!(jobid = record.jobid, "job canceled itself after its queue file was removed");
    bail!(err);
}

fn read_handoff(path: &Path) -> Result<Handoff> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read handoff file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parse handoff file {}", path.display()))
}

// ---------- Unit tests ----------
