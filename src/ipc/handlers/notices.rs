use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::domain::Audience;
use crate::ipc::helpers::{
    authed, get_optional_instant, get_optional_str, get_required_str, new_id, now_rfc3339,
    ts_to_rfc3339, HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};

fn notice_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "message": r.get::<_, String>(2)?,
        "audience": r.get::<_, String>(3)?,
        "publishAt": r.get::<_, Option<i64>>(4)?.map(ts_to_rfc3339),
        "createdAt": r.get::<_, String>(5)?,
        "updatedAt": r.get::<_, String>(6)?,
    }))
}

fn load(conn: &Connection, school_id: &str, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, title, message, audience, publish_at, created_at, updated_at
         FROM notices WHERE id = ? AND school_id = ?",
        (id, school_id),
        notice_json,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("notice not found"))
}

fn get_audience(params: &serde_json::Value) -> Result<Option<Audience>, HandlerErr> {
    match get_optional_str(params, "audience")?.filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => Audience::parse(&raw).map(Some).ok_or_else(|| {
            HandlerErr::bad_params(format!("audience must be one of: {}", Audience::choices()))
        }),
    }
}

fn handle_create(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let message = get_required_str(params, "message")?;
    let audience = get_audience(params)?.ok_or_else(|| HandlerErr::bad_params("missing audience"))?;
    let publish_at = get_optional_instant(params, "publishAt")?.map(|t| t.timestamp());

    let id = new_id();
    let now = now_rfc3339();
    ctx.conn.execute(
        "INSERT INTO notices(id, school_id, title, message, audience, publish_at, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![&id, &p.school_id, &title, &message, audience.as_str(), publish_at, &now, &now],
    )?;
    Ok(json!({ "notice": load(ctx.conn, &p.school_id, &id)? }))
}

/// The school sees every notice; others see published notices addressed to them.
fn handle_list(ctx: &Ctx, p: &Principal, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = ctx.conn.prepare(
        "SELECT id, title, message, audience, publish_at, created_at, updated_at
         FROM notices WHERE school_id = ?
         ORDER BY COALESCE(publish_at, 0) DESC, created_at DESC",
    )?;
    let rows = stmt
        .query_map([&p.school_id], |r| {
            Ok((notice_json(r)?, r.get::<_, Option<i64>>(4)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let now = chrono::Utc::now().timestamp();
    let notices: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(n, publish_at)| {
            if p.role == Role::School {
                return true;
            }
            let reaches = n["audience"]
                .as_str()
                .and_then(Audience::parse)
                .is_some_and(|a| a.reaches(p.role));
            reaches && publish_at.map_or(true, |t| t <= now)
        })
        .map(|(n, _)| n)
        .collect();
    Ok(json!({ "notices": notices }))
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    load(ctx.conn, &p.school_id, &id)?;
    let title = get_optional_str(params, "title")?;
    let message = get_optional_str(params, "message")?;
    if title.as_deref() == Some("") || message.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("title and message must not be empty"));
    }
    let audience = get_audience(params)?.map(|a| a.as_str());
    // Explicit null unschedules the notice.
    let publish_change: Option<Option<i64>> = match params.get("publishAt") {
        None => None,
        Some(serde_json::Value::Null) => Some(None),
        Some(_) => Some(get_optional_instant(params, "publishAt")?.map(|t| t.timestamp())),
    };

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE notices SET title = COALESCE(?, title), message = COALESCE(?, message),
                            audience = COALESCE(?, audience), updated_at = ?
         WHERE id = ?",
        rusqlite::params![&title, &message, audience, now_rfc3339(), &id],
    )?;
    if let Some(publish_at) = publish_change {
        tx.execute("UPDATE notices SET publish_at = ? WHERE id = ?", (publish_at, &id))?;
    }
    tx.commit()?;
    Ok(json!({ "notice": load(ctx.conn, &p.school_id, &id)? }))
}

fn handle_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let n = ctx.conn.execute(
        "DELETE FROM notices WHERE id = ? AND school_id = ?",
        (&id, &p.school_id),
    )?;
    if n == 0 {
        return Err(HandlerErr::not_found("notice not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const SCHOOL: &[Role] = &[Role::School];
    match req.method.as_str() {
        "notices.create" => Some(authed(state, req, SCHOOL, handle_create)),
        "notices.list" => Some(authed(state, req, &Role::ALL, handle_list)),
        "notices.update" => Some(authed(state, req, SCHOOL, handle_update)),
        "notices.delete" => Some(authed(state, req, SCHOOL, handle_delete)),
        _ => None,
    }
}
