//! fixie-batch — entry point
//!
//! All stdout is JSON only. Tracing logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use fixie_batch::cancel::{self, CancelRequest, JobRef};
use fixie_batch::env::JobsEnv;
use fixie_batch::query::{self, QueryRequest};
use fixie_batch::runner::{self, RunnerOpts};
use fixie_batch::schema::ErrorReply;
use fixie_batch::services::{self, AliasStore};
use fixie_batch::spawn::{self, SpawnRequest};
use fixie_batch::wait::{self, WaitOpts};

#[derive(Debug, Parser)]
#[command(name = "fixie-batch")]
#[command(about = "Batch execution service for long-running simulations", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spawn a simulation as a detached batch job.
    #[command(visible_alias = "run")]
    Spawn {
        /// Name of the user.
        #[arg(long)]
        user: String,

        /// Credential token for the user.
        #[arg(long)]
        token: String,

        /// Alias to register for this job.
        #[arg(long, default_value = "")]
        name: String,

        /// Name of the project.
        #[arg(long, default_value = "")]
        project: String,

        /// Job permissions; only "public" is supported.
        #[arg(long, default_value = "public")]
        permissions: String,

        /// Post-processing hooks (accepted for schema parity, not supported).
        #[arg(long = "post", value_name = "HOOK", action = clap::ArgAction::Append)]
        post: Vec<String>,

        /// Notification targets (accepted for schema parity, not supported).
        #[arg(long = "notify", value_name = "TARGET", action = clap::ArgAction::Append)]
        notify: Vec<String>,

        /// Request an interactive session (not supported).
        #[arg(long)]
        interactive: bool,

        /// Include the runner pid in the reply.
        #[arg(long)]
        return_pid: bool,

        /// Simulation payload: a JSON file path, `-` for stdin, or inline JSON.
        simulation: String,
    },

    /// Cancel a queued or running job.
    Cancel {
        /// Name of the user.
        #[arg(long)]
        user: String,

        /// Credential token for the user.
        #[arg(long)]
        token: String,

        /// Project scope for alias lookup.
        #[arg(long, default_value = "")]
        project: String,

        /// Job id, or a job name registered as an alias.
        job: String,
    },

    /// Query job records across the status directories.
    Query {
        /// Status filter; repeatable. Defaults to all statuses.
        #[arg(long = "statuses", value_name = "STATUS", action = clap::ArgAction::Append)]
        statuses: Vec<String>,

        /// User filter; repeatable.
        #[arg(long = "users", value_name = "USER", action = clap::ArgAction::Append)]
        users: Vec<String>,

        /// Job filter: ids or alias names; repeatable.
        #[arg(long = "jobs", value_name = "JOB", action = clap::ArgAction::Append)]
        jobs: Vec<String>,

        /// Project filter; repeatable.
        #[arg(long = "projects", value_name = "PROJECT", action = clap::ArgAction::Append)]
        projects: Vec<String>,
    },

    /// Wait for a job to reach a terminal status.
    Wait {
        /// Poll interval in milliseconds.
        #[arg(long, default_value = "200")]
        poll_ms: u64,

        /// Timeout in milliseconds (0 = indefinite).
        #[arg(long, default_value = "0")]
        timeout_ms: u64,

        /// Job ID.
        jobid: i64,
    },

    /// [Internal] Per-job supervisor — not for direct use.
    #[command(hide = true)]
    Runner {
        #[arg(long)]
        jobid: i64,

        /// Handoff file written by spawn.
        #[arg(long)]
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        ErrorReply::new(format!("{e:#}")).print();
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let env = JobsEnv::from_env()?;
    env.ensure_dirs()?;

    match cli.command {
        Command::Spawn {
            user,
            token,
            name,
            project,
            permissions,
            post,
            notify,
            interactive,
            return_pid,
            simulation,
        } => {
            let simulation = read_simulation(&simulation)?;
            let creds = services::credentials_from_env(&env)?;
            let aliases = AliasStore::new(&env);
            let req = SpawnRequest {
                simulation,
                user,
                token,
                name,
                project,
                permissions: Value::String(permissions),
                post: post.into_iter().map(Value::String).collect(),
                notify: notify.into_iter().map(Value::String).collect(),
                interactive,
                return_pid,
            };
            spawn::spawn(&env, creds.as_ref(), &aliases, &req).print();
        }

        Command::Cancel {
            user,
            token,
            project,
            job,
        } => {
            let job = match job.parse::<i64>() {
                Ok(id) => JobRef::Id(id),
                Err(_) => JobRef::Name(job),
            };
            let creds = services::credentials_from_env(&env)?;
            let aliases = AliasStore::new(&env);
            let req = CancelRequest {
                job,
                user,
                token,
                project,
            };
            cancel::cancel(&env, creds.as_ref(), &aliases, &req).print();
        }

        Command::Query {
            statuses,
            users,
            jobs,
            projects,
        } => {
            let aliases = AliasStore::new(&env);
            let req = QueryRequest {
                statuses: if statuses.is_empty() {
                    Value::String("all".to_string())
                } else {
                    Value::Array(statuses.into_iter().map(Value::String).collect())
                },
                users: values_of(users),
                jobs: jobs_of(jobs),
                projects: values_of(projects),
            };
            query::query(&env, &aliases, &req).print();
        }

        Command::Wait {
            poll_ms,
            timeout_ms,
            jobid,
        } => {
            wait::wait(
                &env,
                &WaitOpts {
                    jobid,
                    poll_ms,
                    timeout_ms,
                },
            )?
            .print();
        }

        Command::Runner { jobid, input } => {
            runner::execute(&env, RunnerOpts {
                jobid,
                input: &input,
            })?;
        }
    }
    Ok(())
}

/// Empty argument lists mean "no constraint".
fn values_of(args: Vec<String>) -> Option<Value> {
    if args.is_empty() {
        None
    } else {
        Some(Value::Array(args.into_iter().map(Value::String).collect()))
    }
}

/// Job filter arguments: numeric values are job ids, everything else is an
/// alias name.
fn jobs_of(args: Vec<String>) -> Option<Value> {
    if args.is_empty() {
        return None;
    }
    let items = args
        .into_iter()
        .map(|arg| match arg.parse::<i64>() {
            Ok(id) => Value::from(id),
            Err(_) => Value::String(arg),
        })
        .collect();
    Some(Value::Array(items))
}

/// Read the simulation payload from a file, stdin (`-`), or the argument
/// itself when it is inline JSON.
fn read_simulation(arg: &str) -> Result<Value> {
    let text = if arg == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read simulation from stdin")?;
        buf
    } else {
        match std::fs::read_to_string(arg) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Allow inline JSON so callers can skip the temp file.
                if serde_json::from_str::<Value>(arg).is_ok() {
                    arg.to_string()
                } else {
                    return Err(e).with_context(|| format!("read simulation file {arg}"));
                }
            }
            Err(e) => return Err(e).with_context(|| format!("read simulation file {arg}")),
        }
    };
    serde_json::from_str(&text).context("parse simulation JSON")
}
