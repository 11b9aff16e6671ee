//! Service configuration from `FIXIE_*` environment variables.
//!
//! Resolution order for the jobs root:
//!   1. `FIXIE_JOBS_DIR` environment variable
//!   2. `$XDG_DATA_HOME/fixie/jobs`
//!   3. `~/.local/share/fixie/jobs`
//!
//! Per-status directories default to `<root>/<status>` and may be overridden
//! individually; the five paths must be pairwise distinct because directory
//! membership *is* job status.

use anyhow::{Context, Result, bail};
use directories::BaseDirs;
use std::path::{Path, PathBuf};

use crate::schema::JobStatus;

/// Process-wide configuration, resolved once at startup and passed by
/// reference. Nothing reads the environment after construction.
#[derive(Debug, Clone)]
pub struct JobsEnv {
    /// Root used for defaults (`FIXIE_JOBS_DIR`).
    pub jobs_dir: PathBuf,
    /// Simulator output directory (`FIXIE_SIMS_DIR`).
    pub sims_dir: PathBuf,
    /// Concurrency bound (`FIXIE_NJOBS`). Zero admits nothing.
    pub njobs: usize,
    /// Simulator executable (`FIXIE_SIMULATOR`).
    pub simulator: String,
    /// Executable to launch runners with (`FIXIE_RUNNER_EXE`).
    pub runner_exe: PathBuf,
    /// Optional credentials table (`FIXIE_CREDS_FILE`).
    pub creds_file: Option<PathBuf>,
    status_dirs: [PathBuf; 5],
}

fn status_index(status: JobStatus) -> usize {
    match status {
        JobStatus::Queued => 0,
        JobStatus::Running => 1,
        JobStatus::Completed => 2,
        JobStatus::Failed => 3,
        JobStatus::Canceled => 4,
    }
}

impl JobsEnv {
    /// Resolve from the process environment. Empty variables count as unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Resolve from an arbitrary lookup function. This is the testable core
    /// of [`JobsEnv::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jobs_dir = match lookup("FIXIE_JOBS_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_jobs_dir(&lookup),
        };

        let mut status_dirs: [PathBuf; 5] = std::array::from_fn(|_| PathBuf::new());
        for status in JobStatus::ALL {
            let key = format!("FIXIE_{}_JOBS_DIR", status.as_str().to_uppercase());
            status_dirs[status_index(status)] = match lookup(&key) {
                Some(dir) => PathBuf::from(dir),
                None => jobs_dir.join(status.as_str()),
            };
        }
        for (i, a) in JobStatus::ALL.iter().enumerate() {
            for b in &JobStatus::ALL[i + 1..] {
                let (da, db) = (
                    &status_dirs[status_index(*a)],
                    &status_dirs[status_index(*b)],
                );
                if da == db {
                    bail!(
                        "$FIXIE_{}_JOBS_DIR and $FIXIE_{}_JOBS_DIR must have distinct \
                         values, got {:?}",
                        a.as_str().to_uppercase(),
                        b.as_str().to_uppercase(),
                        da
                    );
                }
            }
        }

        let sims_dir = match lookup("FIXIE_SIMS_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => jobs_dir.join("sims"),
        };

        let njobs = match lookup("FIXIE_NJOBS") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("FIXIE_NJOBS must be a non-negative integer, got {raw:?}"))?,
            None => 1,
        };

        let simulator = lookup("FIXIE_SIMULATOR").unwrap_or_else(|| "cyclus".to_string());

        let runner_exe = match lookup("FIXIE_RUNNER_EXE") {
            Some(exe) => PathBuf::from(exe),
            None => std::env::current_exe().context("resolve current exe")?,
        };

        let creds_file = lookup("FIXIE_CREDS_FILE").map(PathBuf::from);

        Ok(JobsEnv {
            jobs_dir,
            sims_dir,
            njobs,
            simulator,
            runner_exe,
            creds_file,
            status_dirs,
        })
    }

    pub fn status_dir(&self, status: JobStatus) -> &Path {
        &self.status_dirs[status_index(status)]
    }

    /// Spool directory for runner handoff files.
    pub fn spool_dir(&self) -> PathBuf {
        self.jobs_dir.join("spawn")
    }

    /// Simulator output path for a job.
    pub fn outfile(&self, jobid: i64) -> PathBuf {
        self.sims_dir.join(format!("{jobid}.h5"))
    }

    /// Create every directory the service writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        let mut dirs: Vec<&Path> = vec![&self.jobs_dir, &self.sims_dir];
        dirs.extend(self.status_dirs.iter().map(PathBuf::as_path));
        let spool = self.spool_dir();
        for dir in dirs.into_iter().chain(std::iter::once(spool.as_path())) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn default_jobs_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(xdg) = lookup("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("fixie").join("jobs");
    }
    if let Some(base_dirs) = BaseDirs::new() {
        return base_dirs
            .home_dir()
            .join(".local")
            .join("share")
            .join("fixie")
            .join("jobs");
    }
    // Fallback if the directories crate returns None.
    PathBuf::from("~/.local/share/fixie/jobs")
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_derive_from_jobs_dir() {
        let env = JobsEnv::from_lookup(env_of(&[("FIXIE_JOBS_DIR", "/tmp/fx")])).unwrap();
        assert_eq!(env.jobs_dir, PathBuf::from("/tmp/fx"));
        assert_eq!(env.status_dir(JobStatus::Queued), Path::new("/tmp/fx/queued"));
        assert_eq!(
            env.status_dir(JobStatus::Canceled),
            Path::new("/tmp/fx/canceled")
        );
        assert_eq!(env.sims_dir, PathBuf::from("/tmp/fx/sims"));
        assert_eq!(env.njobs, 1);
        assert_eq!(env.simulator, "cyclus");
        assert_eq!(env.outfile(7), PathBuf::from("/tmp/fx/sims/7.h5"));
    }

    #[test]
    fn explicit_overrides_win() {
        let env = JobsEnv::from_lookup(env_of(&[
            ("FIXIE_JOBS_DIR", "/tmp/fx"),
            ("FIXIE_QUEUED_JOBS_DIR", "/elsewhere/q"),
            ("FIXIE_SIMS_DIR", "/elsewhere/sims"),
            ("FIXIE_NJOBS", "8"),
            ("FIXIE_SIMULATOR", "fake-sim"),
        ]))
        .unwrap();
        assert_eq!(env.status_dir(JobStatus::Queued), Path::new("/elsewhere/q"));
        assert_eq!(env.sims_dir, PathBuf::from("/elsewhere/sims"));
        assert_eq!(env.njobs, 8);
        assert_eq!(env.simulator, "fake-sim");
    }

    #[test]
    fn xdg_fallback_for_jobs_dir() {
        let env = JobsEnv::from_lookup(env_of(&[("XDG_DATA_HOME", "/tmp/xdg")])).unwrap();
        assert_eq!(env.jobs_dir, PathBuf::from("/tmp/xdg/fixie/jobs"));
    }

    #[test]
    fn status_dirs_must_be_pairwise_distinct() {
        let err = JobsEnv::from_lookup(env_of(&[
            ("FIXIE_JOBS_DIR", "/tmp/fx"),
            ("FIXIE_QUEUED_JOBS_DIR", "/tmp/same"),
            ("FIXIE_FAILED_JOBS_DIR", "/tmp/same"),
        ]))
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("distinct"), "unexpected message: {msg}");
        assert!(msg.contains("QUEUED") && msg.contains("FAILED"));
    }

    #[test]
    fn njobs_rejects_garbage() {
        let err = JobsEnv::from_lookup(env_of(&[
            ("FIXIE_JOBS_DIR", "/tmp/fx"),
            ("FIXIE_NJOBS", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("FIXIE_NJOBS"));
    }

    #[test]
    fn njobs_zero_is_valid() {
        let env = JobsEnv::from_lookup(env_of(&[
            ("FIXIE_JOBS_DIR", "/tmp/fx"),
            ("FIXIE_NJOBS", "0"),
        ]))
        .unwrap();
        assert_eq!(env.njobs, 0);
    }
}
