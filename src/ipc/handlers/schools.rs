use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::ipc::helpers::{
    authed, get_optional_i64, get_optional_str, store_param_file, HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::storage;

pub fn school_profile(conn: &Connection, school_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, name, owner_name, email, image_path, verified, created_at
         FROM schools WHERE id = ?",
        [school_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "schoolName": r.get::<_, String>(1)?,
                "ownerName": r.get::<_, String>(2)?,
                "email": r.get::<_, String>(3)?,
                "imageUrl": r.get::<_, Option<String>>(4)?,
                "verified": r.get::<_, i64>(5)? != 0,
                "createdAt": r.get::<_, String>(6)?,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("school not found"))
}

fn handle_profile(ctx: &Ctx, p: &Principal, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school = school_profile(ctx.conn, &p.school_id)?;
    let count = |table: &str| -> Result<i64, HandlerErr> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE school_id = ?", table);
        Ok(ctx.conn.query_row(&sql, [&p.school_id], |r| r.get(0))?)
    };
    Ok(json!({
        "school": school,
        "counts": {
            "classes": count("classes")?,
            "subjects": count("subjects")?,
            "teachers": count("teachers")?,
            "students": count("students")?,
        }
    }))
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_optional_str(params, "schoolName")?;
    let owner = get_optional_str(params, "ownerName")?;
    if name.as_deref() == Some("") || owner.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("names must not be empty"));
    }
    let image = store_param_file(ctx, params, "imagePath", "schools")?;

    let old_image: Option<String> = ctx.conn.query_row(
        "SELECT image_path FROM schools WHERE id = ?",
        [&p.school_id],
        |r| r.get(0),
    )?;
    ctx.conn.execute(
        "UPDATE schools SET
           name = COALESCE(?, name),
           owner_name = COALESCE(?, owner_name),
           image_path = COALESCE(?, image_path)
         WHERE id = ?",
        (&name, &owner, &image, &p.school_id),
    )?;
    if let (Some(_), Some(old)) = (&image, old_image) {
        storage::remove(ctx.workspace, &old);
    }
    Ok(json!({ "school": school_profile(ctx.conn, &p.school_id)? }))
}

/// Mail queued for this tenant, newest first.
fn handle_mail_outbox(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let limit = get_optional_i64(params, "limit")?.unwrap_or(50).clamp(1, 500);
    let recipient = get_optional_str(params, "to")?.map(|s| s.to_ascii_lowercase());
    let mut stmt = ctx.conn.prepare(
        "SELECT id, recipient, sender, subject, body, created_at, sent_at
         FROM mail_outbox
         WHERE school_id = ? AND (? IS NULL OR recipient = ?)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?",
    )?;
    let mails = stmt
        .query_map((&p.school_id, &recipient, &recipient, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "to": r.get::<_, String>(1)?,
                "from": r.get::<_, String>(2)?,
                "subject": r.get::<_, String>(3)?,
                "body": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, String>(5)?,
                "sentAt": r.get::<_, Option<String>>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "mails": mails }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const SCHOOL: &[Role] = &[Role::School];
    match req.method.as_str() {
        "schools.profile" => Some(authed(state, req, SCHOOL, handle_profile)),
        "schools.update" => Some(authed(state, req, SCHOOL, handle_update)),
        "mail.outbox" => Some(authed(state, req, SCHOOL, handle_mail_outbox)),
        _ => None,
    }
}
