use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::password::hash_password;
use crate::auth::token::{generate_account_token, hash_account_token};
use crate::auth::{Principal, Role};
use crate::ipc::helpers::{
    authed, get_new_password, get_optional_i64, get_optional_str, get_required_email,
    get_required_str, get_str_array, insert_err, new_id, now_rfc3339, require_class,
    require_subject, store_param_file, HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::mail;
use crate::storage;

pub const VERIFICATION_TTL_SECS: i64 = 24 * 60 * 60;

pub fn teacher_profile(
    conn: &Connection,
    school_id: &str,
    teacher_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let mut teacher = conn
        .query_row(
            "SELECT t.id, t.name, t.email, t.qualification, t.age, t.gender, t.image_path,
                    t.is_class_teacher, t.class_id, c.class_text, t.verified, t.created_at
             FROM teachers t
             LEFT JOIN classes c ON c.id = t.class_id
             WHERE t.id = ? AND t.school_id = ?",
            (teacher_id, school_id),
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "email": r.get::<_, String>(2)?,
                    "qualification": r.get::<_, Option<String>>(3)?,
                    "age": r.get::<_, Option<i64>>(4)?,
                    "gender": r.get::<_, Option<String>>(5)?,
                    "imageUrl": r.get::<_, Option<String>>(6)?,
                    "isClassTeacher": r.get::<_, i64>(7)? != 0,
                    "classId": r.get::<_, Option<String>>(8)?,
                    "className": r.get::<_, Option<String>>(9)?,
                    "verified": r.get::<_, i64>(10)? != 0,
                    "createdAt": r.get::<_, String>(11)?,
                    "schoolId": school_id,
                    "role": Role::Teacher,
                }))
            },
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("teacher not found"))?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.subject_name, s.subject_codename
         FROM teacher_subjects ts JOIN subjects s ON s.id = ts.subject_id
         WHERE ts.teacher_id = ?
         ORDER BY s.subject_name",
    )?;
    let subjects = stmt
        .query_map([teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectName": r.get::<_, String>(1)?,
                "subjectCodename": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT c.id, c.class_text, c.class_num
         FROM teacher_classes tc JOIN classes c ON c.id = tc.class_id
         WHERE tc.teacher_id = ?
         ORDER BY c.class_num, c.class_text",
    )?;
    let classes = stmt
        .query_map([teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classText": r.get::<_, String>(1)?,
                "classNum": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    teacher["subjects"] = json!(subjects);
    teacher["classes"] = json!(classes);
    Ok(teacher)
}

fn checked_links(
    ctx: &Ctx,
    school_id: &str,
    params: &serde_json::Value,
) -> Result<(Option<Vec<String>>, Option<Vec<String>>), HandlerErr> {
    let subjects = match params.get("subjectIds") {
        None | Some(serde_json::Value::Null) => None,
        Some(_) => {
            let mut ids = get_str_array(params, "subjectIds")?;
            ids.sort();
            ids.dedup();
            for id in &ids {
                require_subject(ctx.conn, school_id, id)?;
            }
            Some(ids)
        }
    };
    let classes = match params.get("classIds") {
        None | Some(serde_json::Value::Null) => None,
        Some(_) => {
            let mut ids = get_str_array(params, "classIds")?;
            ids.sort();
            ids.dedup();
            for id in &ids {
                require_class(ctx.conn, school_id, id)?;
            }
            Some(ids)
        }
    };
    Ok((subjects, classes))
}

fn replace_links(
    conn: &Connection,
    teacher_id: &str,
    subjects: Option<&[String]>,
    classes: Option<&[String]>,
) -> rusqlite::Result<()> {
    if let Some(ids) = subjects {
        conn.execute("DELETE FROM teacher_subjects WHERE teacher_id = ?", [teacher_id])?;
        for id in ids {
            conn.execute(
                "INSERT INTO teacher_subjects(teacher_id, subject_id) VALUES(?, ?)",
                (teacher_id, id),
            )?;
        }
    }
    if let Some(ids) = classes {
        conn.execute("DELETE FROM teacher_classes WHERE teacher_id = ?", [teacher_id])?;
        for id in ids {
            conn.execute(
                "INSERT INTO teacher_classes(teacher_id, class_id) VALUES(?, ?)",
                (teacher_id, id),
            )?;
        }
    }
    Ok(())
}

fn handle_register(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = get_required_email(params)?;
    let password = get_new_password(params)?;
    let qualification = get_optional_str(params, "qualification")?;
    let age = get_optional_i64(params, "age")?;
    let gender = get_optional_str(params, "gender")?;
    let (subjects, classes) = checked_links(ctx, &p.school_id, params)?;
    let password_hash = hash_password(&password)?;
    let image = store_param_file(ctx, params, "imagePath", "teachers")?;

    let teacher_id = new_id();
    let token = generate_account_token();
    let expires = chrono::Utc::now().timestamp() + VERIFICATION_TTL_SECS;

    let tx = ctx.conn.unchecked_transaction()?;
    let inserted = tx.execute(
        "INSERT INTO teachers(id, school_id, name, email, password_hash, qualification, age, gender,
                              image_path, verification_token_hash, verification_expires_at, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &teacher_id,
            &p.school_id,
            &name,
            &email,
            &password_hash,
            &qualification,
            age,
            &gender,
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
        return Err(insert_err(e, "teachers", "a teacher with this email already exists"));
    }
    replace_links(&tx, &teacher_id, subjects.as_deref(), classes.as_deref())?;
    mail::queue(
        &tx,
        &ctx.config.mail_from,
        mail::verification(Some(&p.school_id), &email, Role::Teacher, &token),
    )?;
    tx.commit()?;

    tracing::info!(teacher_id = %teacher_id, school_id = %p.school_id, "teacher registered");
    Ok(json!({ "teacher": teacher_profile(ctx.conn, &p.school_id, &teacher_id)? }))
}

fn handle_list(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let search = get_optional_str(params, "search")?
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s.to_ascii_lowercase()));
    let mut stmt = ctx.conn.prepare(
        "SELECT id FROM teachers
         WHERE school_id = ?
           AND (? IS NULL OR lower(name) LIKE ? OR email LIKE ?)
         ORDER BY name",
    )?;
    let ids = stmt
        .query_map((&p.school_id, &search, &search, &search), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let teachers = ids
        .iter()
        .map(|id| teacher_profile(ctx.conn, &p.school_id, id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "teachers": teachers }))
}

fn handle_get(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    if p.role == Role::Teacher && p.id != id {
        return Err(HandlerErr::forbidden("teachers may only view their own profile"));
    }
    Ok(json!({ "teacher": teacher_profile(ctx.conn, &p.school_id, &id)? }))
}

fn handle_me(ctx: &Ctx, p: &Principal, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "teacher": teacher_profile(ctx.conn, &p.school_id, &p.id)? }))
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let old_image: Option<String> = ctx
        .conn
        .query_row(
            "SELECT image_path FROM teachers WHERE id = ? AND school_id = ?",
            (&id, &p.school_id),
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("teacher not found"))?;

    let name = get_optional_str(params, "name")?;
    if name.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let email = match params.get("email") {
        None | Some(serde_json::Value::Null) => None,
        Some(_) => Some(get_required_email(params)?),
    };
    let qualification = get_optional_str(params, "qualification")?;
    let age = get_optional_i64(params, "age")?;
    let gender = get_optional_str(params, "gender")?;
    let (subjects, classes) = checked_links(ctx, &p.school_id, params)?;
    let image = store_param_file(ctx, params, "imagePath", "teachers")?;

    let tx = ctx.conn.unchecked_transaction()?;
    let updated = tx.execute(
        "UPDATE teachers SET
           name = COALESCE(?, name),
           email = COALESCE(?, email),
           qualification = COALESCE(?, qualification),
           age = COALESCE(?, age),
           gender = COALESCE(?, gender),
           image_path = COALESCE(?, image_path)
         WHERE id = ? AND school_id = ?",
        rusqlite::params![&name, &email, &qualification, age, &gender, &image, &id, &p.school_id],
    );
    if let Err(e) = updated {
        if let Some(img) = &image {
            storage::remove(ctx.workspace, img);
        }
        return Err(insert_err(e, "teachers", "a teacher with this email already exists"));
    }
    replace_links(&tx, &id, subjects.as_deref(), classes.as_deref())?;
    tx.commit()?;
    if let (Some(_), Some(old)) = (&image, old_image) {
        storage::remove(ctx.workspace, &old);
    }
    Ok(json!({ "teacher": teacher_profile(ctx.conn, &p.school_id, &id)? }))
}

fn handle_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let image: Option<String> = ctx
        .conn
        .query_row(
            "SELECT image_path FROM teachers WHERE id = ? AND school_id = ?",
            (&id, &p.school_id),
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("teacher not found"))?;

    let schedules: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM schedules WHERE teacher_id = ?",
        [&id],
        |r| r.get(0),
    )?;
    let assignments: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM assignments WHERE teacher_id = ?",
        [&id],
        |r| r.get(0),
    )?;
    if schedules > 0 || assignments > 0 {
        return Err(HandlerErr::conflict("teacher still has schedules or assignments")
            .with_details(json!({ "schedules": schedules, "assignments": assignments })));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute("DELETE FROM teacher_subjects WHERE teacher_id = ?", [&id])?;
    tx.execute("DELETE FROM teacher_classes WHERE teacher_id = ?", [&id])?;
    tx.execute("DELETE FROM teacher_attendance WHERE teacher_id = ?", [&id])?;
    tx.execute(
        "DELETE FROM attendance_summaries WHERE person_kind = 'teacher' AND person_id = ?",
        [&id],
    )?;
    tx.execute(
        "DELETE FROM leave_requests WHERE requester_kind = 'teacher' AND requester_id = ?",
        [&id],
    )?;
    tx.execute("UPDATE classes SET class_teacher_id = NULL WHERE class_teacher_id = ?", [&id])?;
    tx.execute("UPDATE results SET published_by = NULL WHERE published_by = ?", [&id])?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&id])?;
    tx.commit()?;
    if let Some(img) = image {
        storage::remove(ctx.workspace, &img);
    }
    tracing::info!(teacher_id = %id, "teacher deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const SCHOOL: &[Role] = &[Role::School];
    match req.method.as_str() {
        "teachers.register" => Some(authed(state, req, SCHOOL, handle_register)),
        "teachers.list" => Some(authed(state, req, SCHOOL, handle_list)),
        "teachers.get" => Some(authed(state, req, &[Role::School, Role::Teacher], handle_get)),
        "teachers.update" => Some(authed(state, req, SCHOOL, handle_update)),
        "teachers.delete" => Some(authed(state, req, SCHOOL, handle_delete)),
        "teachers.me" => Some(authed(state, req, &[Role::Teacher], handle_me)),
        _ => None,
    }
}
