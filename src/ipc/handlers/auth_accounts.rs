//! Account lifecycle: tenant registration, login for the three actor kinds,
//! email verification and password reset.

use rusqlite::OptionalExtension;
use serde_json::json;

use crate::auth::password::{hash_password, verify_password};
use crate::auth::token::{generate_account_token, hash_account_token, issue_token};
use crate::auth::{AuthError, Principal, Role};
use crate::ipc::handlers::students::student_profile;
use crate::ipc::handlers::teachers::{teacher_profile, VERIFICATION_TTL_SECS};
use crate::ipc::handlers::schools::school_profile;
use crate::ipc::helpers::{
    get_new_password, get_required_email, get_required_str, insert_err, new_id, now_rfc3339,
    public, store_param_file, HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::mail;
use crate::storage;

const RESET_TTL_SECS: i64 = 60 * 60;

fn get_role(params: &serde_json::Value) -> Result<Role, HandlerErr> {
    let raw = get_required_str(params, "role")?;
    Role::parse(&raw).ok_or_else(|| HandlerErr::bad_params("role must be SCHOOL, TEACHER or STUDENT"))
}

fn handle_school_register(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_name = get_required_str(params, "schoolName")?;
    let owner_name = get_required_str(params, "ownerName")?;
    let email = get_required_email(params)?;
    let password = get_new_password(params)?;
    let password_hash = hash_password(&password)?;
    let image = store_param_file(ctx, params, "imagePath", "schools")?;

    let school_id = new_id();
    let token = generate_account_token();
    let expires = chrono::Utc::now().timestamp() + VERIFICATION_TTL_SECS;

    let tx = ctx.conn.unchecked_transaction()?;
    let inserted = tx.execute(
        "INSERT INTO schools(id, name, owner_name, email, password_hash, image_path,
                             verification_token_hash, verification_expires_at, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &school_id,
            &school_name,
            &owner_name,
            &email,
            &password_hash,
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
        return Err(insert_err(e, "schools", "a school with this email already exists"));
    }
    mail::queue(
        &tx,
        &ctx.config.mail_from,
        mail::verification(Some(&school_id), &email, Role::School, &token),
    )?;
    tx.commit()?;

    tracing::info!(school_id = %school_id, "school registered");
    Ok(json!({ "school": school_profile(ctx.conn, &school_id)? }))
}

fn login(ctx: &Ctx, role: Role, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?.to_ascii_lowercase();
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let school_col = if role == Role::School { "id" } else { "school_id" };
    let sql = format!(
        "SELECT id, {}, password_hash FROM {} WHERE email = ?",
        school_col,
        role.table()
    );
    let row: Option<(String, String, String)> = ctx
        .conn
        .query_row(&sql, [&email], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .optional()?;
    let Some((id, school_id, hash)) = row else {
        tracing::warn!(role = role.as_str(), "login for unknown email");
        return Err(AuthError::InvalidCredentials.into());
    };
    if !verify_password(password, &hash)? {
        tracing::warn!(role = role.as_str(), account = %id, "login with wrong password");
        return Err(AuthError::InvalidCredentials.into());
    }

    let principal = Principal {
        id,
        school_id,
        role,
        email,
    };
    let token = issue_token(&principal, ctx.config)?;
    let profile = match role {
        Role::School => school_profile(ctx.conn, &principal.school_id)?,
        Role::Teacher => teacher_profile(ctx.conn, &principal.school_id, &principal.id)?,
        Role::Student => student_profile(ctx.conn, &principal.school_id, &principal.id)?,
    };
    tracing::info!(role = role.as_str(), account = %principal.id, "login");
    Ok(json!({
        "token": token,
        "role": role,
        "profile": profile,
    }))
}

fn handle_school_login(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    login(ctx, Role::School, params)
}

fn handle_teacher_login(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    login(ctx, Role::Teacher, params)
}

fn handle_student_login(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    login(ctx, Role::Student, params)
}

fn handle_verify_email(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = get_role(params)?;
    let token = get_required_str(params, "token")?;
    let sql = format!(
        "UPDATE {} SET verified = 1, verification_token_hash = NULL, verification_expires_at = NULL
         WHERE verification_token_hash = ? AND verification_expires_at >= ?",
        role.table()
    );
    let n = ctx.conn.execute(
        &sql,
        (hash_account_token(&token), chrono::Utc::now().timestamp()),
    )?;
    if n == 0 {
        return Err(HandlerErr::bad_params("verification token is invalid or expired"));
    }
    Ok(json!({ "verified": true }))
}

fn handle_request_password_reset(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = get_role(params)?;
    let email = get_required_str(params, "email")?.to_ascii_lowercase();
    let school_col = if role == Role::School { "id" } else { "school_id" };
    let sql = format!(
        "SELECT id, {} FROM {} WHERE email = ?",
        school_col,
        role.table()
    );
    let row: Option<(String, String)> = ctx
        .conn
        .query_row(&sql, [&email], |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()?;

    // Unknown addresses get the same answer.
    if let Some((id, school_id)) = row {
        let token = generate_account_token();
        let tx = ctx.conn.unchecked_transaction()?;
        let sql = format!(
            "UPDATE {} SET reset_token_hash = ?, reset_expires_at = ? WHERE id = ?",
            role.table()
        );
        tx.execute(
            &sql,
            (
                hash_account_token(&token),
                chrono::Utc::now().timestamp() + RESET_TTL_SECS,
                &id,
            ),
        )?;
        mail::queue(
            &tx,
            &ctx.config.mail_from,
            mail::password_reset(Some(&school_id), &email, role, &token),
        )?;
        tx.commit()?;
    }
    Ok(json!({ "queued": true }))
}

fn handle_reset_password(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = get_role(params)?;
    let token = get_required_str(params, "token")?;
    let password = get_new_password(params)?;
    let sql = format!(
        "SELECT id FROM {} WHERE reset_token_hash = ? AND reset_expires_at >= ?",
        role.table()
    );
    let id: Option<String> = ctx
        .conn
        .query_row(
            &sql,
            (hash_account_token(&token), chrono::Utc::now().timestamp()),
            |r| r.get(0),
        )
        .optional()?;
    let Some(id) = id else {
        return Err(HandlerErr::bad_params("reset token is invalid or expired"));
    };
    let hash = hash_password(&password)?;
    let sql = format!(
        "UPDATE {} SET password_hash = ?, reset_token_hash = NULL, reset_expires_at = NULL WHERE id = ?",
        role.table()
    );
    ctx.conn.execute(&sql, (&hash, &id))?;
    tracing::info!(role = role.as_str(), account = %id, "password reset");
    Ok(json!({ "reset": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.school.register" => Some(public(state, req, handle_school_register)),
        "auth.school.login" => Some(public(state, req, handle_school_login)),
        "auth.teacher.login" => Some(public(state, req, handle_teacher_login)),
        "auth.student.login" => Some(public(state, req, handle_student_login)),
        "auth.verifyEmail" => Some(public(state, req, handle_verify_email)),
        "auth.requestPasswordReset" => Some(public(state, req, handle_request_password_reset)),
        "auth.resetPassword" => Some(public(state, req, handle_reset_password)),
        _ => None,
    }
}
