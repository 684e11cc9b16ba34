//! Timetable entries. A slot may not overlap another slot of the same class
//! or of the same teacher; intervals are half-open so back-to-back lessons
//! are fine.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::calc;
use crate::ipc::helpers::{
    authed, ensure_student_class, get_optional_str, get_required_instant, get_required_str,
    new_id, now_rfc3339, require_class, require_subject, require_teacher, ts_to_rfc3339,
    HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Class,
    Teacher,
}

impl Dimension {
    fn as_str(self) -> &'static str {
        match self {
            Dimension::Class => "class",
            Dimension::Teacher => "teacher",
        }
    }

    fn column(self) -> &'static str {
        match self {
            Dimension::Class => "s.class_id",
            Dimension::Teacher => "s.teacher_id",
        }
    }
}

const SCHEDULE_SELECT: &str = "SELECT s.id, s.teacher_id, t.name, s.subject_id, sub.subject_name,
        sub.subject_codename, s.class_id, c.class_text, c.class_num, s.start_at, s.end_at, s.created_at
     FROM schedules s
     JOIN teachers t ON t.id = s.teacher_id
     JOIN subjects sub ON sub.id = s.subject_id
     JOIN classes c ON c.id = s.class_id";

fn schedule_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "teacher": { "id": r.get::<_, String>(1)?, "name": r.get::<_, String>(2)? },
        "subject": {
            "id": r.get::<_, String>(3)?,
            "subjectName": r.get::<_, String>(4)?,
            "subjectCodename": r.get::<_, String>(5)?,
        },
        "class": {
            "id": r.get::<_, String>(6)?,
            "classText": r.get::<_, String>(7)?,
            "classNum": r.get::<_, i64>(8)?,
        },
        "startTime": ts_to_rfc3339(r.get(9)?),
        "endTime": ts_to_rfc3339(r.get(10)?),
        "createdAt": r.get::<_, String>(11)?,
    }))
}

fn load(conn: &Connection, school_id: &str, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("{} WHERE s.id = ? AND s.school_id = ?", SCHEDULE_SELECT);
    conn.query_row(&sql, (id, school_id), schedule_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("schedule not found"))
}

/// Slots on `dimension` = `key` overlapping `[start, end)`, skipping `exclude`.
/// The query also returns touching slots; `intervals_overlap` drops them.
fn overlapping(
    conn: &Connection,
    school_id: &str,
    dimension: Dimension,
    key: &str,
    start: i64,
    end: i64,
    exclude: Option<&str>,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "{} WHERE s.school_id = ? AND {} = ?
           AND s.start_at <= ? AND s.end_at >= ?
           AND (? IS NULL OR s.id <> ?)
         ORDER BY s.start_at",
        SCHEDULE_SELECT,
        dimension.column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params![school_id, key, end, start, exclude, exclude],
            |r| Ok((schedule_json(r)?, r.get::<_, i64>(9)?, r.get::<_, i64>(10)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|(_, s, e)| calc::intervals_overlap(*s, *e, start, end))
        .map(|(slot, _, _)| slot)
        .collect())
}

fn conflict_err(dimension: Dimension, hit: &serde_json::Value) -> HandlerErr {
    let message = match dimension {
        Dimension::Class => "class already has a lesson in this time slot",
        Dimension::Teacher => "teacher is already scheduled in this time slot",
    };
    HandlerErr::conflict(message).with_details(json!({
        "dimension": dimension.as_str(),
        "scheduleId": hit["id"],
        "teacher": hit["teacher"]["name"],
        "subject": hit["subject"]["subjectName"],
        "class": hit["class"]["classText"],
        "startTime": hit["startTime"],
        "endTime": hit["endTime"],
    }))
}

/// First clash on either dimension, class checked first.
fn first_conflict(
    conn: &Connection,
    school_id: &str,
    slot: &Slot,
    exclude: Option<&str>,
) -> Result<(), HandlerErr> {
    for (dimension, key) in [
        (Dimension::Class, slot.class_id.as_str()),
        (Dimension::Teacher, slot.teacher_id.as_str()),
    ] {
        let hits = overlapping(conn, school_id, dimension, key, slot.start, slot.end, exclude)?;
        if let Some(hit) = hits.first() {
            return Err(conflict_err(dimension, hit));
        }
    }
    Ok(())
}

struct Slot {
    teacher_id: String,
    subject_id: String,
    class_id: String,
    start: i64,
    end: i64,
}

/// Slots are stored in whole seconds; finer input would be silently truncated.
fn slot_instant(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    let t: DateTime<Utc> = get_required_instant(params, key)?;
    if t.timestamp_subsec_nanos() != 0 {
        return Err(HandlerErr::bad_params(format!("{} must be a whole second", key)));
    }
    Ok(t.timestamp())
}

fn check_interval(start: i64, end: i64) -> Result<(), HandlerErr> {
    if end <= start {
        return Err(HandlerErr::bad_params("endTime must be after startTime")
            .with_details(json!({ "reason": "invalid_interval" })));
    }
    Ok(())
}

fn check_refs(ctx: &Ctx, school_id: &str, slot: &Slot) -> Result<(), HandlerErr> {
    require_teacher(ctx.conn, school_id, &slot.teacher_id)?;
    require_subject(ctx.conn, school_id, &slot.subject_id)?;
    require_class(ctx.conn, school_id, &slot.class_id)?;
    Ok(())
}

fn handle_create(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let class_id = get_required_str(params, "classId")?;
    let start = slot_instant(params, "startTime")?;
    let end = slot_instant(params, "endTime")?;
    check_interval(start, end)?;

    let slot = Slot {
        teacher_id,
        subject_id,
        class_id,
        start,
        end,
    };
    check_refs(ctx, &p.school_id, &slot)?;

    let tx = ctx.conn.unchecked_transaction()?;
    first_conflict(&tx, &p.school_id, &slot, None)?;
    let id = new_id();
    tx.execute(
        "INSERT INTO schedules(id, school_id, teacher_id, subject_id, class_id, start_at, end_at, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &p.school_id,
            &slot.teacher_id,
            &slot.subject_id,
            &slot.class_id,
            slot.start,
            slot.end,
            now_rfc3339(),
        ],
    )?;
    tx.commit()?;
    tracing::debug!(schedule_id = %id, class_id = %slot.class_id, "schedule created");
    Ok(json!({ "schedule": load(ctx.conn, &p.school_id, &id)? }))
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let current: Option<(String, String, String, i64, i64)> = ctx
        .conn
        .query_row(
            "SELECT teacher_id, subject_id, class_id, start_at, end_at FROM schedules
             WHERE id = ? AND school_id = ?",
            (&id, &p.school_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((teacher_id, subject_id, class_id, start_at, end_at)) = current else {
        return Err(HandlerErr::not_found("schedule not found"));
    };

    let start = match params.get("startTime") {
        None | Some(serde_json::Value::Null) => start_at,
        Some(_) => slot_instant(params, "startTime")?,
    };
    let end = match params.get("endTime") {
        None | Some(serde_json::Value::Null) => end_at,
        Some(_) => slot_instant(params, "endTime")?,
    };
    check_interval(start, end)?;
    let slot = Slot {
        teacher_id: get_optional_str(params, "teacherId")?
            .filter(|s| !s.is_empty())
            .unwrap_or(teacher_id),
        subject_id: get_optional_str(params, "subjectId")?
            .filter(|s| !s.is_empty())
            .unwrap_or(subject_id),
        class_id: get_optional_str(params, "classId")?
            .filter(|s| !s.is_empty())
            .unwrap_or(class_id),
        start,
        end,
    };
    check_refs(ctx, &p.school_id, &slot)?;

    let tx = ctx.conn.unchecked_transaction()?;
    first_conflict(&tx, &p.school_id, &slot, Some(&id))?;
    tx.execute(
        "UPDATE schedules SET teacher_id = ?, subject_id = ?, class_id = ?, start_at = ?, end_at = ?
         WHERE id = ?",
        rusqlite::params![
            &slot.teacher_id,
            &slot.subject_id,
            &slot.class_id,
            slot.start,
            slot.end,
            &id
        ],
    )?;
    tx.commit()?;
    Ok(json!({ "schedule": load(ctx.conn, &p.school_id, &id)? }))
}

fn handle_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let n = ctx.conn.execute(
        "DELETE FROM schedules WHERE id = ? AND school_id = ?",
        (&id, &p.school_id),
    )?;
    if n == 0 {
        return Err(HandlerErr::not_found("schedule not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn list_where(
    ctx: &Ctx,
    school_id: &str,
    column: &str,
    key: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "{} WHERE s.school_id = ? AND {} = ? ORDER BY s.start_at",
        SCHEDULE_SELECT, column
    );
    let mut stmt = ctx.conn.prepare(&sql)?;
    let rows = stmt
        .query_map((school_id, key), schedule_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_fetch_with_class(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    ensure_student_class(ctx.conn, p, &class_id)?;
    Ok(json!({ "schedules": list_where(ctx, &p.school_id, "s.class_id", &class_id)? }))
}

fn handle_for_teacher(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = match (p.role, get_optional_str(params, "teacherId")?.filter(|s| !s.is_empty())) {
        (Role::Teacher, Some(t)) if t != p.id => {
            return Err(HandlerErr::forbidden("teachers may only view their own timetable"))
        }
        (_, Some(t)) => t,
        (Role::Teacher, None) => p.id.clone(),
        (_, None) => return Err(HandlerErr::bad_params("missing teacherId")),
    };
    require_teacher(ctx.conn, &p.school_id, &teacher_id)?;
    Ok(json!({ "schedules": list_where(ctx, &p.school_id, "s.teacher_id", &teacher_id)? }))
}

fn handle_check_conflicts(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let class_id = get_required_str(params, "classId")?;
    let s = slot_instant(params, "startTime")?;
    let e = slot_instant(params, "endTime")?;
    check_interval(s, e)?;
    let exclude = get_optional_str(params, "excludeId")?.filter(|s| !s.is_empty());

    let teacher_conflicts = overlapping(
        ctx.conn,
        &p.school_id,
        Dimension::Teacher,
        &teacher_id,
        s,
        e,
        exclude.as_deref(),
    )?;
    let class_conflicts = overlapping(
        ctx.conn,
        &p.school_id,
        Dimension::Class,
        &class_id,
        s,
        e,
        exclude.as_deref(),
    )?;
    Ok(json!({
        "hasConflict": !teacher_conflicts.is_empty() || !class_conflicts.is_empty(),
        "teacherConflicts": teacher_conflicts,
        "classConflicts": class_conflicts,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const STAFF: &[Role] = &[Role::School, Role::Teacher];
    match req.method.as_str() {
        "schedules.create" => Some(authed(state, req, STAFF, handle_create)),
        "schedules.update" => Some(authed(state, req, STAFF, handle_update)),
        "schedules.delete" => Some(authed(state, req, STAFF, handle_delete)),
        "schedules.fetchWithClass" => Some(authed(state, req, &Role::ALL, handle_fetch_with_class)),
        "schedules.forTeacher" => Some(authed(state, req, STAFF, handle_for_teacher)),
        "schedules.checkConflicts" => Some(authed(state, req, STAFF, handle_check_conflicts)),
        _ => None,
    }
}
