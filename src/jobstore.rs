//! Status-directory primitives.
//!
//! The five status directories are the only shared mutable state in the
//! service: directory membership defines job status, and `create`/`rename`
//! are the atomic operations coordinating the control plane with the
//! detached runners. Readers tolerate the races this leaves open by
//! ignoring non-conforming directory entries, retrying empty reads, and
//! falling back to an exhaustive scan when a hinted lookup misses.

use anyhow::{Context, Result, bail};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use crate::env::JobsEnv;
use crate::schema::{self, JobRecord, JobStatus};

/// How long to keep retrying a file that exists but reads empty.
const EMPTY_READ_RETRIES: u32 = 200;
const EMPTY_READ_PAUSE: std::time::Duration = std::time::Duration::from_millis(10);

/// Path of a job's record file within a status directory.
pub fn record_path(env: &JobsEnv, status: JobStatus, jobid: i64) -> PathBuf {
    env.status_dir(status).join(format!("{jobid}.json"))
}

/// The set of job ids currently in `status`, by enumerating `<jobid>.json`
/// filenames. Non-conforming names and unreadable entries are ignored; a
/// missing directory reads as empty.
pub fn ids(env: &JobsEnv, status: JobStatus) -> Result<BTreeSet<i64>> {
    let dir = env.status_dir(status);
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("read status directory {}", dir.display()));
        }
    };
    let mut out = BTreeSet::new();
    for entry in read_dir {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        let Ok(jobid) = stem.parse::<i64>() else {
            continue;
        };
        if jobid >= 0 {
            out.insert(jobid);
        }
    }
    Ok(out)
}

/// Load and decode a record. Returns `Ok(None)` when the file does not
/// exist (the job is not in this status, or a mover beat us to it).
///
/// A file may exist but read empty for a short window while a writer is
/// creating it; such reads are retried until a payload appears.
pub fn load(env: &JobsEnv, status: JobStatus, jobid: i64) -> Result<Option<JobRecord>> {
    let path = record_path(env, status, jobid);
    for _ in 0..EMPTY_READ_RETRIES {
        match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => std::thread::sleep(EMPTY_READ_PAUSE),
            Ok(bytes) => {
                return schema::decode(&bytes)
                    .map(Some)
                    .with_context(|| format!("decode job file {}", path.display()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read job file {}", path.display())),
        }
    }
    bail!("job file {} stayed empty", path.display());
}

/// Write a record into a status directory atomically: the content lands in
/// a temporary file in the same directory and is renamed into place, so no
/// reader ever observes a partial record.
pub fn write_record(env: &JobsEnv, status: JobStatus, record: &JobRecord) -> Result<()> {
    let dir = env.status_dir(status);
    let bytes = schema::encode(record)?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(&bytes)?;
    let path = record_path(env, status, record.jobid);
    tmp.persist(&path)
        .map_err(|e| e.error)
        .with_context(|| format!("persist job file {}", path.display()))?;
    Ok(())
}

/// Move a record from one status directory to another and rewrite its
/// content. Returns `Ok(false)` when the source file no longer exists,
/// which means another mover (a cancel, or the runner itself) won the race.
///
/// The rename happens first so the file is visible in exactly one status
/// directory at every moment; the short window where the destination holds
/// the pre-transition content is closed by the atomic rewrite.
pub fn transition(
    env: &JobsEnv,
    from: JobStatus,
    to: JobStatus,
    record: &JobRecord,
) -> Result<bool> {
    let src = record_path(env, from, record.jobid);
    let dst = record_path(env, to, record.jobid);
    match std::fs::rename(&src, &dst) {
        Ok(()) => {
            write_record(env, to, record)?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| {
            format!(
                "move job {} from {} to {}",
                record.jobid,
                from.as_str(),
                to.as_str()
            )
        }),
    }
}

/// Locate a record by id, probing a hinted status first and then scanning
/// the remaining directories. Returns the status it was found in.
pub fn find(
    env: &JobsEnv,
    jobid: i64,
    hint: Option<JobStatus>,
) -> Result<Option<(JobStatus, JobRecord)>> {
    if let Some(status) = hint
        && let Some(record) = load(env, status, jobid)?
    {
        return Ok(Some((status, record)));
    }
    for status in JobStatus::ALL {
        if Some(status) == hint {
            continue;
        }
        if let Some(record) = load(env, status, jobid)? {
            return Ok(Some((status, record)));
        }
    }
    Ok(None)
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_env(tmp: &tempfile::TempDir) -> JobsEnv {
        let root = tmp.path().display().to_string();
        let env = JobsEnv::from_lookup(|key| match key {
            "FIXIE_JOBS_DIR" => Some(root.clone()),
            "FIXIE_RUNNER_EXE" => Some("true".to_string()),
            _ => None,
        })
        .unwrap();
        env.ensure_dirs().unwrap();
        env
    }

    fn record(jobid: i64) -> JobRecord {
        JobRecord::enqueued(
            jobid,
            "me".to_string(),
            String::new(),
            json!({"k": 1}),
            format!("/sims/{jobid}.h5"),
            100,
        )
    }

    #[test]
    fn ids_ignores_non_conforming_names() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let dir = env.status_dir(JobStatus::Queued);
        std::fs::write(dir.join("12.json"), b"{}").unwrap();
        std::fs::write(dir.join("3.json"), b"{}").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.join("abc.json"), b"x").unwrap();
        std::fs::write(dir.join("-1.json"), b"x").unwrap();
        let ids = ids(&env, JobStatus::Queued).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![3, 12]);
    }

    #[test]
    fn ids_of_missing_directory_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        std::fs::remove_dir(env.status_dir(JobStatus::Failed)).unwrap();
        assert!(ids(&env, JobStatus::Failed).unwrap().is_empty());
    }

    #[test]
    fn write_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let rec = record(5);
        write_record(&env, JobStatus::Queued, &rec).unwrap();
        let loaded = load(&env, JobStatus::Queued, 5).unwrap().unwrap();
        assert_eq!(rec, loaded);
        assert!(load(&env, JobStatus::Running, 5).unwrap().is_none());
    }

    #[test]
    fn load_retries_until_payload_appears() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let path = record_path(&env, JobStatus::Queued, 8);
        std::fs::write(&path, b"").unwrap();

        let bytes = schema::encode(&record(8)).unwrap();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            std::fs::write(&path, bytes).unwrap();
        });
        let loaded = load(&env, JobStatus::Queued, 8).unwrap().unwrap();
        writer.join().unwrap();
        assert_eq!(loaded.jobid, 8);
    }

    #[test]
    fn transition_keeps_record_in_exactly_one_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let mut rec = record(2);
        write_record(&env, JobStatus::Queued, &rec).unwrap();

        rec.queue_endtime = Some(12.0);
        assert!(transition(&env, JobStatus::Queued, JobStatus::Running, &rec).unwrap());
        assert!(!record_path(&env, JobStatus::Queued, 2).exists());
        let moved = load(&env, JobStatus::Running, 2).unwrap().unwrap();
        assert_eq!(moved.queue_endtime, Some(12.0));
    }

    #[test]
    fn transition_reports_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let rec = record(4);
        assert!(!transition(&env, JobStatus::Queued, JobStatus::Running, &rec).unwrap());
        assert!(!record_path(&env, JobStatus::Running, 4).exists());
    }

    #[test]
    fn find_prefers_hint_then_scans() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let rec = record(6);
        write_record(&env, JobStatus::Completed, &rec).unwrap();

        let (status, _) = find(&env, 6, Some(JobStatus::Completed)).unwrap().unwrap();
        assert_eq!(status, JobStatus::Completed);
        // Stale hint falls back to the exhaustive scan.
        let (status, _) = find(&env, 6, Some(JobStatus::Queued)).unwrap().unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert!(find(&env, 99, None).unwrap().is_none());
    }
}
