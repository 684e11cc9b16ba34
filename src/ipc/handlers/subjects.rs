use rusqlite::OptionalExtension;
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::ipc::helpers::{
    authed, get_optional_str, get_required_str, insert_err, new_id, now_rfc3339, require_subject,
    HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};

/// Trimmed, uppercased, 2 to 10 characters of `A-Z`, `0-9` or `-`.
pub fn normalize_codename(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    let valid = (2..=10).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-');
    valid.then_some(code)
}

fn get_codename(params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, "subjectCodename")? {
        None => Ok(None),
        Some(raw) => normalize_codename(&raw).map(Some).ok_or_else(|| {
            HandlerErr::bad_params("subjectCodename must be 2-10 characters of A-Z, 0-9 or -")
        }),
    }
}

fn subject_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "subjectName": r.get::<_, String>(1)?,
        "subjectCodename": r.get::<_, String>(2)?,
        "createdAt": r.get::<_, String>(3)?,
    }))
}

fn load(ctx: &Ctx, school_id: &str, id: &str) -> Result<serde_json::Value, HandlerErr> {
    ctx.conn
        .query_row(
            "SELECT id, subject_name, subject_codename, created_at FROM subjects
             WHERE id = ? AND school_id = ?",
            (id, school_id),
            subject_json,
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("subject not found"))
}

fn handle_create(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "subjectName")?;
    let code = get_codename(params)?.ok_or_else(|| HandlerErr::bad_params("missing subjectCodename"))?;
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO subjects(id, school_id, subject_name, subject_codename, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (&id, &p.school_id, &name, &code, now_rfc3339()),
        )
        .map_err(|e| insert_err(e, "subjects", "subject codename already in use"))?;
    Ok(json!({ "subject": load(ctx, &p.school_id, &id)? }))
}

fn handle_list(ctx: &Ctx, p: &Principal, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = ctx.conn.prepare(
        "SELECT id, subject_name, subject_codename, created_at FROM subjects
         WHERE school_id = ?
         ORDER BY subject_name",
    )?;
    let subjects = stmt
        .query_map([&p.school_id], subject_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    require_subject(ctx.conn, &p.school_id, &id)?;
    let name = get_optional_str(params, "subjectName")?;
    if name.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("subjectName must not be empty"));
    }
    let code = get_codename(params)?;
    ctx.conn
        .execute(
            "UPDATE subjects SET subject_name = COALESCE(?, subject_name),
                                 subject_codename = COALESCE(?, subject_codename)
             WHERE id = ?",
            (&name, &code, &id),
        )
        .map_err(|e| insert_err(e, "subjects", "subject codename already in use"))?;
    Ok(json!({ "subject": load(ctx, &p.school_id, &id)? }))
}

fn handle_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    require_subject(ctx.conn, &p.school_id, &id)?;
    let count = |table: &str| -> Result<i64, HandlerErr> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE subject_id = ?", table);
        Ok(ctx.conn.query_row(&sql, [&id], |r| r.get(0))?)
    };
    let (schedules, exams, assignments) = (
        count("schedules")?,
        count("examinations")?,
        count("assignments")?,
    );
    if schedules + exams + assignments > 0 {
        return Err(HandlerErr::conflict("subject is still in use").with_details(json!({
            "schedules": schedules,
            "examinations": exams,
            "assignments": assignments,
        })));
    }
    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute("DELETE FROM teacher_subjects WHERE subject_id = ?", [&id])?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&id])?;
    tx.commit()?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const SCHOOL: &[Role] = &[Role::School];
    match req.method.as_str() {
        "subjects.create" => Some(authed(state, req, SCHOOL, handle_create)),
        "subjects.list" => Some(authed(state, req, &Role::ALL, handle_list)),
        "subjects.update" => Some(authed(state, req, SCHOOL, handle_update)),
        "subjects.delete" => Some(authed(state, req, SCHOOL, handle_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codenames_are_normalized() {
        assert_eq!(normalize_codename(" math-1 ").as_deref(), Some("MATH-1"));
        assert_eq!(normalize_codename("M"), None);
        assert_eq!(normalize_codename("ABCDEFGHIJK"), None);
        assert_eq!(normalize_codename("SCI 2"), None);
    }
}
