//! The `query` operation: a read-only join across the status directories.
//!
//! Filter semantics: values within a field are ORed, the fields themselves
//! are ANDed. Results are ordered by ascending job id, each row carrying a
//! `status` key derived from the directory the record was found in.

use anyhow::Result;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::env::JobsEnv;
use crate::jobstore;
use crate::schema::{JobStatus, QueryReply};
use crate::services::AliasStore;

/// A query request, mirroring the wire schema. `None` means "no
/// constraint" for the nullable fields.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// "all", a status name, or a list of status names.
    pub statuses: Value,
    pub users: Option<Value>,
    /// Job ids, alias names, or a mixed list of both.
    pub jobs: Option<Value>,
    pub projects: Option<Value>,
}

impl Default for QueryRequest {
    fn default() -> Self {
        QueryRequest {
            statuses: Value::String("all".to_string()),
            users: None,
            jobs: None,
            projects: None,
        }
    }
}

/// Query job records, filtered as appropriate.
pub fn query(env: &JobsEnv, aliases: &AliasStore, req: &QueryRequest) -> QueryReply {
    match query_inner(env, aliases, req) {
        Ok(reply) => reply,
        Err(e) => QueryReply::failure(format!("{e:#}")),
    }
}

fn query_inner(env: &JobsEnv, aliases: &AliasStore, req: &QueryRequest) -> Result<QueryReply> {
    let users = match normalize_names(&req.users) {
        Ok(users) => users,
        Err(msg) => return Ok(QueryReply::failure(msg)),
    };
    let projects = match normalize_names(&req.projects) {
        Ok(projects) => projects,
        Err(msg) => return Ok(QueryReply::failure(msg)),
    };
    let statuses = match normalize_statuses(&req.statuses) {
        Ok(statuses) => statuses,
        Err(msg) => return Ok(QueryReply::failure(msg)),
    };

    // Candidate ids from the selected statuses, remembering where each id
    // was seen as a lookup hint. Disjoint residency is an invariant; a
    // duplicate means the store is corrupt and the query cannot be trusted.
    let mut sids: BTreeSet<i64> = BTreeSet::new();
    let mut hints: BTreeMap<i64, JobStatus> = BTreeMap::new();
    for status in &statuses {
        for id in jobstore::ids(env, *status)? {
            if let Some(prev) = hints.insert(id, *status) {
                return Ok(QueryReply::failure(format!(
                    "job {id} found in both {} and {} status directories",
                    prev.as_str(),
                    status.as_str()
                )));
            }
            sids.insert(id);
        }
    }

    // Candidate ids from the jobs filter: integers join directly, strings
    // resolve through the alias registry.
    let jids: BTreeSet<i64> = match &req.jobs {
        None => sids.clone(),
        Some(value) => {
            let items: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            let mut jids = BTreeSet::new();
            for item in items {
                if let Some(id) = item.as_i64() {
                    jids.insert(id);
                } else if let Some(name) = item.as_str() {
                    jids.extend(aliases.jobids_with_name(name)?);
                } else {
                    return Ok(QueryReply::failure(format!(
                        "type of job not reconized: {item}"
                    )));
                }
            }
            jids
        }
    };

    let mut data = Vec::new();
    for id in sids.intersection(&jids) {
        // The record may have moved (or vanished) since the id scan; the
        // hinted lookup falls back to scanning, and a missing record is
        // simply skipped.
        let Some((found_in, record)) = jobstore::find(env, *id, hints.get(id).copied())? else {
            continue;
        };
        if let Some(users) = &users
            && !users.contains(&record.user)
        {
            continue;
        }
        if let Some(projects) = &projects
            && !projects.contains(&record.project)
        {
            continue;
        }
        let mut row = serde_json::to_value(&record)?;
        if let Value::Object(map) = &mut row {
            map.insert(
                "status".to_string(),
                Value::String(found_in.as_str().to_string()),
            );
        }
        data.push(row);
    }

    Ok(QueryReply {
        data: Some(data),
        status: true,
        message: "Jobs queried".to_string(),
    })
}

/// Expand a statuses argument into a set of concrete statuses.
fn normalize_statuses(value: &Value) -> Result<BTreeSet<JobStatus>, String> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    let mut out = BTreeSet::new();
    for item in items {
        let Value::String(s) = item else {
            return Err(format!("status must be a string, got {item}"));
        };
        if s == "all" {
            out.extend(JobStatus::ALL);
        } else if let Some(status) = JobStatus::parse(s) {
            out.insert(status);
        } else {
            return Err(format!("{s} is not a valid status"));
        }
    }
    Ok(out)
}

/// Normalize a nullable string-or-list argument into an optional set.
fn normalize_names(value: &Option<Value>) -> Result<Option<BTreeSet<String>>, String> {
    let Some(value) = value else {
        return Ok(None);
    };
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    let mut out = BTreeSet::new();
    for item in items {
        match item {
            Value::String(s) => {
                out.insert(s.clone());
            }
            other => return Err(format!("{other} is not a string")),
        }
    }
    Ok(Some(out))
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

    /// Seed the five hand-written records the filter tests run against.
    fn seed(env: &JobsEnv) {
        let jobs = [
            (0, "completed", "aperson", "p0"),
            (1, "failed", "bperson", "p1"),
            (2, "canceled", "aperson", "p2"),
            (3, "running", "cperson", "p0"),
            (4, "queued", "dperson", "p3"),
        ];
        for (jobid, status, user, project) in jobs {
            let status = JobStatus::parse(status).unwrap();
            let path = jobstore::record_path(env, status, jobid);
            let body = format!(r#"{{"jobid": {jobid}, "user": "{user}", "project": "{project}"}}"#);
            std::fs::write(path, body).unwrap();
        }
    }

    fn run(env: &JobsEnv, req: QueryRequest) -> QueryReply {
        let aliases = AliasStore::new(env);
        query(env, &aliases, &req)
    }

    fn ids_of(reply: &QueryReply) -> Vec<i64> {
        assert!(reply.status, "query failed: {}", reply.message);
        reply
            .data
            .as_ref()
            .unwrap()
            .iter()
            .map(|row| row["jobid"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn unfiltered_query_returns_everything_in_id_order() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);

        let reply = run(&env, QueryRequest::default());
        assert_eq!(reply.message, "Jobs queried");
        assert_eq!(ids_of(&reply), vec![0, 1, 2, 3, 4]);

        // Each row carries the status of the directory it was found in.
        let data = reply.data.as_ref().unwrap();
        assert_eq!(data[0]["status"], json!("completed"));
        assert_eq!(data[1]["status"], json!("failed"));
        assert_eq!(data[4]["status"], json!("queued"));
        assert_eq!(data[3]["user"], json!("cperson"));
    }

    #[test]
    fn status_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);

        let one = run(
            &env,
            QueryRequest {
                statuses: json!("completed"),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&one), vec![0]);

        let two = run(
            &env,
            QueryRequest {
                statuses: json!(["completed", "failed"]),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&two), vec![0, 1]);
    }

    #[test]
    fn user_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);

        let one = run(
            &env,
            QueryRequest {
                users: Some(json!("bperson")),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&one), vec![1]);

        let two = run(
            &env,
            QueryRequest {
                users: Some(json!(["aperson", "bperson"])),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&two), vec![0, 1, 2]);
    }

    #[test]
    fn job_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);

        let one = run(
            &env,
            QueryRequest {
                jobs: Some(json!(0)),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&one), vec![0]);

        let two = run(
            &env,
            QueryRequest {
                jobs: Some(json!([0, 1])),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&two), vec![0, 1]);
    }

    #[test]
    fn job_names_resolve_through_aliases() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);
        let aliases = AliasStore::new(&env);
        aliases.register(1, "bperson", "burnup", "p1").unwrap();
        aliases.register(3, "cperson", "burnup", "p0").unwrap();

        let reply = query(
            &env,
            &aliases,
            &QueryRequest {
                jobs: Some(json!("burnup")),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&reply), vec![1, 3]);
    }

    #[test]
    fn project_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);

        let one = run(
            &env,
            QueryRequest {
                projects: Some(json!("p1")),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&one), vec![1]);

        let two = run(
            &env,
            QueryRequest {
                projects: Some(json!(["p1", "p0"])),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&two), vec![0, 1, 3]);
    }

    #[test]
    fn fields_are_anded_together() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);

        let reply = run(
            &env,
            QueryRequest {
                statuses: json!(["completed", "failed"]),
                users: Some(json!(["aperson", "bperson"])),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&reply), vec![0, 1]);

        let reply = run(
            &env,
            QueryRequest {
                statuses: json!(["completed", "failed"]),
                jobs: Some(json!([0, 1, 4])),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&reply), vec![0, 1]);

        let reply = run(
            &env,
            QueryRequest {
                users: Some(json!(["aperson", "bperson"])),
                projects: Some(json!(["p1", "p0"])),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&reply), vec![0, 1]);

        let reply = run(
            &env,
            QueryRequest {
                statuses: json!(["completed", "failed", "running"]),
                users: Some(json!(["aperson", "bperson"])),
                jobs: Some(json!([0, 1, 4])),
                projects: Some(json!(["p1", "p0"])),
            },
        );
        assert_eq!(ids_of(&reply), vec![0, 1]);
    }

    #[test]
    fn invalid_arguments_fail_with_null_data() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);

        let reply = run(
            &env,
            QueryRequest {
                statuses: json!("borked"),
                ..QueryRequest::default()
            },
        );
        assert!(!reply.status);
        assert!(reply.data.is_none());
        assert_eq!(reply.message, "borked is not a valid status");

        let reply = run(
            &env,
            QueryRequest {
                statuses: json!([42]),
                ..QueryRequest::default()
            },
        );
        assert_eq!(reply.message, "status must be a string, got 42");

        let reply = run(
            &env,
            QueryRequest {
                users: Some(json!(["aperson", 7])),
                ..QueryRequest::default()
            },
        );
        assert!(!reply.status);
        assert_eq!(reply.message, "7 is not a string");

        let reply = run(
            &env,
            QueryRequest {
                jobs: Some(json!([0, 1.5])),
                ..QueryRequest::default()
            },
        );
        assert!(!reply.status);
        assert_eq!(reply.message, "type of job not reconized: 1.5");
    }

    #[test]
    fn duplicate_residency_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        let body = r#"{"jobid": 0, "user": "aperson", "project": "p0"}"#;
        std::fs::write(jobstore::record_path(&env, JobStatus::Completed, 0), body).unwrap();
        std::fs::write(jobstore::record_path(&env, JobStatus::Failed, 0), body).unwrap();

        let reply = run(&env, QueryRequest::default());
        assert!(!reply.status);
        assert!(reply.data.is_none());
        assert!(reply.message.contains("found in both"));
    }

    #[test]
    fn vanished_records_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let env = test_env(&tmp);
        seed(&env);
        // Simulate a record vanishing between the id scan and the load by
        // pointing the filter at an id that no directory holds.
        let reply = run(
            &env,
            QueryRequest {
                jobs: Some(json!([0, 99])),
                ..QueryRequest::default()
            },
        );
        assert_eq!(ids_of(&reply), vec![0]);
    }
}
