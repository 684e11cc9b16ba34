use rusqlite::OptionalExtension;
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::domain::JobStatus;
use crate::ipc::helpers::{authed, get_optional_i64, get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Ctx, Request};

const JOB_COLUMNS: &str =
    "id, owner_kind, owner_id, input_path, status, error, created_at, started_at, finished_at";

fn job_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "ownerKind": r.get::<_, String>(1)?,
        "ownerId": r.get::<_, String>(2)?,
        "inputPath": r.get::<_, String>(3)?,
        "status": r.get::<_, String>(4)?,
        "error": r.get::<_, Option<String>>(5)?,
        "createdAt": r.get::<_, String>(6)?,
        "startedAt": r.get::<_, Option<String>>(7)?,
        "finishedAt": r.get::<_, Option<String>>(8)?,
    }))
}

fn handle_job_status(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let job_id = get_required_str(params, "jobId")?;
    let sql = format!("SELECT {} FROM media_jobs WHERE id = ? AND school_id = ?", JOB_COLUMNS);
    let job = ctx
        .conn
        .query_row(&sql, (&job_id, &p.school_id), job_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("job not found"))?;
    Ok(json!({ "job": job }))
}

fn handle_jobs(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let status = match get_optional_str(params, "status")?.filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(JobStatus::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params(format!("status must be one of: {}", JobStatus::choices()))
        })?),
    };
    let limit = get_optional_i64(params, "limit")?.unwrap_or(100).clamp(1, 1000);
    let status = status.map(|s| s.as_str());
    let sql = format!(
        "SELECT {} FROM media_jobs
         WHERE school_id = ? AND (? IS NULL OR status = ?)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?",
        JOB_COLUMNS
    );
    let mut stmt = ctx.conn.prepare(&sql)?;
    let jobs = stmt
        .query_map(rusqlite::params![&p.school_id, status, status, limit], job_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "jobs": jobs }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "media.jobStatus" => Some(authed(state, req, &Role::ALL, handle_job_status)),
        "media.jobs" => Some(authed(state, req, &Role::ALL, handle_jobs)),
        _ => None,
    }
}
