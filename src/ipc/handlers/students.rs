use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::password::hash_password;
use crate::auth::token::{generate_account_token, hash_account_token};
use crate::auth::{Principal, Role};
use crate::ipc::handlers::teachers::VERIFICATION_TTL_SECS;
use crate::ipc::helpers::{
    authed, get_new_password, get_optional_i64, get_optional_str, get_required_email,
    get_required_str, insert_err, new_id, now_rfc3339, require_class, store_param_file,
    HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::mail;
use crate::storage;

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "email": r.get::<_, String>(2)?,
        "classId": r.get::<_, String>(3)?,
        "className": r.get::<_, Option<String>>(4)?,
        "age": r.get::<_, Option<i64>>(5)?,
        "gender": r.get::<_, Option<String>>(6)?,
        "guardian": r.get::<_, Option<String>>(7)?,
        "guardianPhone": r.get::<_, Option<String>>(8)?,
        "imageUrl": r.get::<_, Option<String>>(9)?,
        "verified": r.get::<_, i64>(10)? != 0,
        "createdAt": r.get::<_, String>(11)?,
        "schoolId": r.get::<_, String>(12)?,
        "role": Role::Student,
    }))
}

const STUDENT_COLUMNS: &str = "s.id, s.name, s.email, s.class_id, c.class_text, s.age, s.gender,
    s.guardian, s.guardian_phone, s.image_path, s.verified, s.created_at, s.school_id";

pub fn student_profile(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM students s LEFT JOIN classes c ON c.id = s.class_id
         WHERE s.id = ? AND s.school_id = ?",
        STUDENT_COLUMNS
    );
    conn.query_row(&sql, (student_id, school_id), student_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("student not found"))
}

fn handle_register(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = get_required_email(params)?;
    let password = get_new_password(params)?;
    let class_id = get_required_str(params, "classId")?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    let age = get_optional_i64(params, "age")?;
    let gender = get_optional_str(params, "gender")?;
    let guardian = get_optional_str(params, "guardian")?;
    let guardian_phone = get_optional_str(params, "guardianPhone")?;
    let password_hash = hash_password(&password)?;
    let image = store_param_file(ctx, params, "imagePath", "students")?;

    let student_id = new_id();
    let token = generate_account_token();
    let expires = chrono::Utc::now().timestamp() + VERIFICATION_TTL_SECS;

    let tx = ctx.conn.unchecked_transaction()?;
    let inserted = tx.execute(
        "INSERT INTO students(id, school_id, name, email, password_hash, class_id, age, gender,
                              guardian, guardian_phone, image_path,
                              verification_token_hash, verification_expires_at, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &student_id,
            &p.school_id,
            &name,
            &email,
            &password_hash,
            &class_id,
            age,
            &gender,
            &guardian,
            &guardian_phone,
            &image,
            hash_account_token(&token),
            expires,
            now_rfc3339(),
        ],
    );
    if let Err(e) = inserted {
        if let Some(img) = &image {
            storage::remove(ctx.workspace, img);
        }
        return Err(insert_err(e, "students", "a student with this email already exists"));
    }
    mail::queue(
        &tx,
        &ctx.config.mail_from,
        mail::verification(Some(&p.school_id), &email, Role::Student, &token),
    )?;
    tx.commit()?;

    tracing::info!(student_id = %student_id, class_id = %class_id, "student registered");
    Ok(json!({ "student": student_profile(ctx.conn, &p.school_id, &student_id)? }))
}

fn handle_list(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_optional_str(params, "classId")?.filter(|s| !s.is_empty());
    let search = get_optional_str(params, "search")?
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s.to_ascii_lowercase()));
    let sql = format!(
        "SELECT {} FROM students s LEFT JOIN classes c ON c.id = s.class_id
         WHERE s.school_id = ?
           AND (? IS NULL OR s.class_id = ?)
           AND (? IS NULL OR lower(s.name) LIKE ? OR s.email LIKE ?)
         ORDER BY s.name",
        STUDENT_COLUMNS
    );
    let mut stmt = ctx.conn.prepare(&sql)?;
    let students = stmt
        .query_map(
            rusqlite::params![&p.school_id, &class_id, &class_id, &search, &search, &search],
            student_json,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn handle_get(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    Ok(json!({ "student": student_profile(ctx.conn, &p.school_id, &id)? }))
}

fn handle_me(ctx: &Ctx, p: &Principal, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "student": student_profile(ctx.conn, &p.school_id, &p.id)? }))
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let old_image: Option<String> = ctx
        .conn
        .query_row(
            "SELECT image_path FROM students WHERE id = ? AND school_id = ?",
            (&id, &p.school_id),
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;

    let name = get_optional_str(params, "name")?;
    if name.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let email = match params.get("email") {
        None | Some(serde_json::Value::Null) => None,
        Some(_) => Some(get_required_email(params)?),
    };
    let class_id = get_optional_str(params, "classId")?.filter(|s| !s.is_empty());
    if let Some(c) = &class_id {
        require_class(ctx.conn, &p.school_id, c)?;
    }
    let age = get_optional_i64(params, "age")?;
    let gender = get_optional_str(params, "gender")?;
    let guardian = get_optional_str(params, "guardian")?;
    let guardian_phone = get_optional_str(params, "guardianPhone")?;
    let image = store_param_file(ctx, params, "imagePath", "students")?;

    let updated = ctx.conn.execute(
        "UPDATE students SET
           name = COALESCE(?, name),
           email = COALESCE(?, email),
           class_id = COALESCE(?, class_id),
           age = COALESCE(?, age),
           gender = COALESCE(?, gender),
           guardian = COALESCE(?, guardian),
           guardian_phone = COALESCE(?, guardian_phone),
           image_path = COALESCE(?, image_path)
         WHERE id = ? AND school_id = ?",
        rusqlite::params![
            &name,
            &email,
            &class_id,
            age,
            &gender,
            &guardian,
            &guardian_phone,
            &image,
            &id,
            &p.school_id
        ],
    );
    if let Err(e) = updated {
        if let Some(img) = &image {
            storage::remove(ctx.workspace, img);
        }
        return Err(insert_err(e, "students", "a student with this email already exists"));
    }
    if let (Some(_), Some(old)) = (&image, old_image) {
        storage::remove(ctx.workspace, &old);
    }
    Ok(json!({ "student": student_profile(ctx.conn, &p.school_id, &id)? }))
}

fn handle_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let image: Option<String> = ctx
        .conn
        .query_row(
            "SELECT image_path FROM students WHERE id = ? AND school_id = ?",
            (&id, &p.school_id),
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;

    // Collect submission files before the rows go.
    let mut stmt = ctx.conn.prepare(
        "SELECT file_path, video_path, feedback_video_path FROM submissions WHERE student_id = ?",
    )?;
    let files: Vec<String> = stmt
        .query_map([&id], |r| {
            Ok([
                r.get::<_, Option<String>>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
            ])
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .flatten()
        .collect();

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM submission_rubric_scores
         WHERE submission_id IN (SELECT id FROM submissions WHERE student_id = ?)",
        [&id],
    )?;
    tx.execute("DELETE FROM submissions WHERE student_id = ?", [&id])?;
    tx.execute("DELETE FROM results WHERE student_id = ?", [&id])?;
    tx.execute("DELETE FROM student_attendance WHERE student_id = ?", [&id])?;
    tx.execute(
        "DELETE FROM attendance_summaries WHERE person_kind = 'student' AND person_id = ?",
        [&id],
    )?;
    tx.execute(
        "DELETE FROM leave_requests WHERE requester_kind = 'student' AND requester_id = ?",
        [&id],
    )?;
    tx.execute("DELETE FROM students WHERE id = ?", [&id])?;
    tx.commit()?;

    for f in files.iter().chain(image.iter()) {
        storage::remove(ctx.workspace, f);
    }
    tracing::info!(student_id = %id, "student deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const SCHOOL: &[Role] = &[Role::School];
    match req.method.as_str() {
        "students.register" => Some(authed(state, req, SCHOOL, handle_register)),
        "students.list" => Some(authed(state, req, &[Role::School, Role::Teacher], handle_list)),
        "students.get" => Some(authed(state, req, &[Role::School, Role::Teacher], handle_get)),
        "students.update" => Some(authed(state, req, SCHOOL, handle_update)),
        "students.delete" => Some(authed(state, req, SCHOOL, handle_delete)),
        "students.me" => Some(authed(state, req, &[Role::Student], handle_me)),
        _ => None,
    }
}
