//! Collaborator services backing the control plane: credential
//! verification, job-id allocation, and the job alias registry.
//!
//! The allocator and the alias registry live on the filesystem next to the
//! status directories and, like the job records themselves, survive
//! restarts of the controlling server. Multi-writer updates are serialized
//! through short-lived `create_new` lock files.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::env::JobsEnv;

/// Outcome of a credential check.
#[derive(Debug, Clone)]
pub struct Verification {
    pub valid: bool,
    pub message: String,
}

impl Verification {
    fn ok() -> Self {
        Verification {
            valid: true,
            message: "user verified".to_string(),
        }
    }

    fn denied(message: impl Into<String>) -> Self {
        Verification {
            valid: false,
            message: message.into(),
        }
    }
}

/// Credential verification seam. The control-plane operations only see this
/// trait, so tests can substitute stub verifiers.
pub trait Credentials {
    fn verify(&self, user: &str, token: &str) -> Verification;
}

/// Accepts every user/token pair. Used when no credentials table is
/// configured.
pub struct AllowAll;

impl Credentials for AllowAll {
    fn verify(&self, _user: &str, _token: &str) -> Verification {
        Verification::ok()
    }
}

/// User → token map loaded from a JSON file.
pub struct TokenTable {
    tokens: HashMap<String, String>,
}

impl TokenTable {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read credentials file {}", path.display()))?;
        let tokens = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse credentials file {}", path.display()))?;
        Ok(TokenTable { tokens })
    }
}

impl Credentials for TokenTable {
    fn verify(&self, user: &str, token: &str) -> Verification {
        match self.tokens.get(user) {
            None => Verification::denied(format!("user {user} is not registered")),
            Some(expected) if expected == token => Verification::ok(),
            Some(_) => Verification::denied(format!("invalid token for user {user}")),
        }
    }
}

/// Build the verifier configured for this environment.
pub fn credentials_from_env(env: &JobsEnv) -> Result<Box<dyn Credentials>> {
    match &env.creds_file {
        Some(path) => Ok(Box::new(TokenTable::load(path)?)),
        None => {
            warn!("no FIXIE_CREDS_FILE configured; accepting all credentials");
            Ok(Box::new(AllowAll))
        }
    }
}

// ---------- Lock file ----------

const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
const LOCK_PAUSE: std::time::Duration = std::time::Duration::from_millis(5);

/// A `create_new` lock file, removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf) -> Result<LockFile> {
        let deadline = std::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(LockFile { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() >= deadline {
                        bail!("timed out waiting for lock {}", path.display());
                    }
                    std::thread::sleep(LOCK_PAUSE);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("create lock file {}", path.display()));
                }
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------- Job-id allocation ----------

/// Allocate the next job id: a non-negative integer, unique and monotone
/// across the service's entire history, including restarts and concurrent
/// spawns.
pub fn next_jobid(env: &JobsEnv) -> Result<i64> {
    let counter = env.jobs_dir.join("jobid");
    let _lock = LockFile::acquire(env.jobs_dir.join("jobid.lock"))?;
    let next = match std::fs::read_to_string(&counter) {
        Ok(raw) => raw
            .trim()
            .parse::<i64>()
            .with_context(|| format!("corrupt job id counter {}", counter.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => {
            return Err(e).with_context(|| format!("read job id counter {}", counter.display()));
        }
    };
    let mut tmp = NamedTempFile::new_in(&env.jobs_dir)?;
    write!(tmp, "{}", next + 1)?;
    tmp.persist(&counter)
        .map_err(|e| e.error)
        .with_context(|| format!("persist job id counter {}", counter.display()))?;
    Ok(next)
}

// ---------- Alias registry ----------

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AliasEntry {
    pub jobid: i64,
    pub name: String,
    pub project: String,
    pub user: String,
}

/// File-backed registry mapping job names to job ids.
pub struct AliasStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl AliasStore {
    pub fn new(env: &JobsEnv) -> Self {
        AliasStore {
            path: env.jobs_dir.join("aliases.json"),
            lock_path: env.jobs_dir.join("aliases.lock"),
        }
    }

    fn entries(&self) -> Result<Vec<AliasEntry>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse alias registry {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => {
                Err(e).with_context(|| format!("read alias registry {}", self.path.display()))
            }
        }
    }

    /// Record an alias for a freshly spawned job.
    pub fn register(&self, jobid: i64, user: &str, name: &str, project: &str) -> Result<()> {
        let _lock = LockFile::acquire(self.lock_path.clone())?;
        let mut entries = self.entries()?;
        entries.push(AliasEntry {
            jobid,
            name: name.to_string(),
            project: project.to_string(),
            user: user.to_string(),
        });
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&entries)?)?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("persist alias registry {}", self.path.display()))?;
        Ok(())
    }

    /// Job ids registered by `user` under `name` within `project`.
    pub fn jobids_from_alias(
        &self,
        user: &str,
        name: &str,
        project: &str,
    ) -> Result<BTreeSet<i64>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.user == user && e.name == name && e.project == project)
            .map(|e| e.jobid)
            .collect())
    }

    /// Job ids registered under `name` by anyone, in any project.
    pub fn jobids_with_name(&self, name: &str) -> Result<BTreeSet<i64>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.name == name)
            .map(|e| e.jobid)
            .collect())
    }
}

// ---------- Unit tests ----------
