use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::ipc::helpers::{
    authed, get_optional_i64, get_optional_str, get_required_str, new_id, now_rfc3339,
    require_class, require_teacher, HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};

fn class_json(conn: &Connection, school_id: &str, class_id: &str) -> Result<serde_json::Value, HandlerErr> {
    // Correlated subquery keeps the count from multiplying with the teacher join.
    conn.query_row(
        "SELECT c.id, c.class_text, c.class_num, c.class_teacher_id, t.name, c.created_at,
                (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         LEFT JOIN teachers t ON t.id = c.class_teacher_id
         WHERE c.id = ? AND c.school_id = ?",
        (class_id, school_id),
        row_json,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("class not found"))
}

fn row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "classText": r.get::<_, String>(1)?,
        "classNum": r.get::<_, i64>(2)?,
        "classTeacherId": r.get::<_, Option<String>>(3)?,
        "classTeacherName": r.get::<_, Option<String>>(4)?,
        "createdAt": r.get::<_, String>(5)?,
        "studentCount": r.get::<_, i64>(6)?,
    }))
}

fn get_class_num(params: &serde_json::Value) -> Result<Option<i64>, HandlerErr> {
    match get_optional_i64(params, "classNum")? {
        Some(n) if n < 0 => Err(HandlerErr::bad_params("classNum must not be negative")),
        other => Ok(other),
    }
}

fn handle_create(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_text = get_required_str(params, "classText")?;
    let class_num = get_class_num(params)?.ok_or_else(|| HandlerErr::bad_params("missing classNum"))?;
    let id = new_id();
    ctx.conn.execute(
        "INSERT INTO classes(id, school_id, class_text, class_num, created_at) VALUES(?, ?, ?, ?, ?)",
        (&id, &p.school_id, &class_text, class_num, now_rfc3339()),
    )?;
    Ok(json!({ "class": class_json(ctx.conn, &p.school_id, &id)? }))
}

fn handle_list(ctx: &Ctx, p: &Principal, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = ctx.conn.prepare(
        "SELECT c.id, c.class_text, c.class_num, c.class_teacher_id, t.name, c.created_at,
                (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         LEFT JOIN teachers t ON t.id = c.class_teacher_id
         WHERE c.school_id = ?
         ORDER BY c.class_num, c.class_text",
    )?;
    let classes = stmt
        .query_map([&p.school_id], row_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    require_class(ctx.conn, &p.school_id, &id)?;
    let class_text = get_optional_str(params, "classText")?;
    if class_text.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("classText must not be empty"));
    }
    let class_num = get_class_num(params)?;

    // Absent leaves the assignment alone; null clears it.
    let teacher_change: Option<Option<String>> = match params.get("classTeacherId") {
        None => None,
        Some(serde_json::Value::Null) => Some(None),
        Some(_) => {
            let tid = get_required_str(params, "classTeacherId")?;
            require_teacher(ctx.conn, &p.school_id, &tid)?;
            Some(Some(tid))
        }
    };

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE classes SET class_text = COALESCE(?, class_text), class_num = COALESCE(?, class_num)
         WHERE id = ?",
        (&class_text, class_num, &id),
    )?;
    if let Some(new_teacher) = teacher_change {
        let previous: Option<String> = tx.query_row(
            "SELECT class_teacher_id FROM classes WHERE id = ?",
            [&id],
            |r| r.get(0),
        )?;
        if let Some(prev) = previous.filter(|prev| Some(prev) != new_teacher.as_ref()) {
            tx.execute(
                "UPDATE teachers SET is_class_teacher = 0, class_id = NULL WHERE id = ?",
                [&prev],
            )?;
        }
        if let Some(tid) = &new_teacher {
            // A teacher leads one class at most.
            tx.execute(
                "UPDATE classes SET class_teacher_id = NULL WHERE class_teacher_id = ? AND id <> ?",
                (tid, &id),
            )?;
            tx.execute(
                "UPDATE teachers SET is_class_teacher = 1, class_id = ? WHERE id = ?",
                (&id, tid),
            )?;
        }
        tx.execute(
            "UPDATE classes SET class_teacher_id = ? WHERE id = ?",
            (&new_teacher, &id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "class": class_json(ctx.conn, &p.school_id, &id)? }))
}

fn handle_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    require_class(ctx.conn, &p.school_id, &id)?;

    let count = |table: &str| -> Result<i64, HandlerErr> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE class_id = ?", table);
        Ok(ctx.conn.query_row(&sql, [&id], |r| r.get(0))?)
    };
    let refs = json!({
        "students": count("students")?,
        "schedules": count("schedules")?,
        "examinations": count("examinations")?,
        "assignments": count("assignments")?,
    });
    let referenced = refs
        .as_object()
        .map(|m| m.values().any(|v| v.as_i64().unwrap_or(0) > 0))
        .unwrap_or(false);
    if referenced {
        return Err(HandlerErr::conflict("class is still in use").with_details(refs));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute("DELETE FROM teacher_classes WHERE class_id = ?", [&id])?;
    tx.execute(
        "UPDATE teachers SET is_class_teacher = 0, class_id = NULL WHERE class_id = ?",
        [&id],
    )?;
    tx.execute("DELETE FROM student_attendance WHERE class_id = ?", [&id])?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&id])?;
    tx.commit()?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const SCHOOL: &[Role] = &[Role::School];
    match req.method.as_str() {
        "classes.create" => Some(authed(state, req, SCHOOL, handle_create)),
        "classes.list" => Some(authed(state, req, &[Role::School, Role::Teacher], handle_list)),
        "classes.update" => Some(authed(state, req, SCHOOL, handle_update)),
        "classes.delete" => Some(authed(state, req, SCHOOL, handle_delete)),
        _ => None,
    }
}
