//! The `spawn` operation: admit a new simulation job and launch its
//! detached runner.
//!
//! Spawn itself never touches the status directories. It validates the
//! request, allocates a job id, writes a handoff file with the runner's
//! context, and launches the runner fully decoupled from its own lifetime.
//! The runner enqueues the job (see [`crate::runner`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::info;

use crate::env::JobsEnv;
use crate::schema::SpawnReply;
use crate::services::{self, AliasStore, Credentials};

/// A spawn request, mirroring the wire schema.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Opaque simulation payload; must be a mapping.
    pub simulation: Value,
    pub user: String,
    pub token: String,
    /// Optional alias to register for this job.
    pub name: String,
    pub project: String,
    /// Must equal "public"; other shapes are rejected.
    pub permissions: Value,
    /// Must be empty; post-processing is not supported.
    pub post: Vec<Value>,
    /// Must be empty; notifications are not supported.
    pub notify: Vec<Value>,
    /// Must be false; interactive sessions are not supported.
    pub interactive: bool,
    /// Include the runner pid in the reply (mostly for testing).
    pub return_pid: bool,
}

impl Default for SpawnRequest {
    fn default() -> Self {
        SpawnRequest {
            simulation: Value::Null,
            user: String::new(),
            token: String::new(),
            name: String::new(),
            project: String::new(),
            permissions: Value::String("public".to_string()),
            post: vec![],
            notify: vec![],
            interactive: false,
            return_pid: false,
        }
    }
}

/// Context handed to the runner through the spool file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Handoff {
    pub interactive: bool,
    pub jobid: i64,
    pub notify: Vec<Value>,
    pub permissions: Value,
    pub post: Vec<Value>,
    pub project: String,
    pub simulation: Value,
    pub user: String,
}

/// Validate a spawn request, allocate a job id, and launch the detached
/// runner. Every precondition failure maps to a `status=false` reply with a
/// fixed message; only the launch itself can fail internally.
pub fn spawn(
    env: &JobsEnv,
    creds: &dyn Credentials,
    aliases: &AliasStore,
    req: &SpawnRequest,
) -> SpawnReply {
    if !req.simulation.is_object() {
        return SpawnReply::failure("Simulation must be dict (i.e. mapping object) currently.");
    }
    if req.permissions.as_str() != Some("public") {
        return SpawnReply::failure("Non-public permissions are not supported yet.");
    }
    if !req.post.is_empty() {
        return SpawnReply::failure("Post-processing activities are not supported yet.");
    }
    if !req.notify.is_empty() {
        return SpawnReply::failure("Notifications are not supported yet.");
    }
    if req.interactive {
        return SpawnReply::failure("Interactive simulation spawning is not supported yet.");
    }
    let verification = creds.verify(&req.user, &req.token);
    if !verification.valid {
        return SpawnReply::failure(verification.message);
    }

    match launch(env, aliases, req) {
        Ok((jobid, pid)) => SpawnReply {
            jobid,
            status: true,
            message: "Simulation spawned".to_string(),
            pid: req.return_pid.then_some(pid),
        },
        Err(e) => SpawnReply::failure(format!("{e:#}")),
    }
}

fn launch(env: &JobsEnv, aliases: &AliasStore, req: &SpawnRequest) -> Result<(i64, u32)> {
    let jobid = services::next_jobid(env)?;
    let handoff_path = write_handoff(env, jobid, req)?;

    let mut cmd = Command::new(&env.runner_exe);
    cmd.arg("runner")
        .arg("--jobid")
        .arg(jobid.to_string())
        .arg("--input")
        .arg(&handoff_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // Own process group, so the runner's lifetime is independent of ours.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = std::fs::remove_file(&handoff_path);
            return Err(e).with_context(|| {
                format!("launch runner {} for job {jobid}", env.runner_exe.display())
            });
        }
    };
    let pid = child.id();
    info!(jobid, pid, "runner launched");

    if !req.name.is_empty() || !req.project.is_empty() {
        aliases.register(jobid, &req.user, &req.name, &req.project)?;
    }
    Ok((jobid, pid))
}

fn write_handoff(env: &JobsEnv, jobid: i64, req: &SpawnRequest) -> Result<PathBuf> {
    let handoff = Handoff {
        interactive: req.interactive,
        jobid,
        notify: req.notify.clone(),
        permissions: req.permissions.clone(),
        post: req.post.clone(),
        project: req.project.clone(),
        simulation: req.simulation.clone(),
        user: req.user.clone(),
    };
    let dir = env.spool_dir();
    let path = dir.join(format!("{jobid}.json"));
    let mut tmp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(&serde_json::to_vec_pretty(&handoff)?)?;
    tmp.persist(&path)
        .map_err(|e| e.error)
        .with_context(|| format!("persist handoff file {}", path.display()))?;
    Ok(path)
}

// ---------- Unit tests ----------
