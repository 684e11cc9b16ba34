use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::password::MIN_PASSWORD_LENGTH;
use crate::auth::{self, AuthError, Principal, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::storage::{self, StorageError};

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

impl From<AuthError> for HandlerErr {
    fn from(e: AuthError) -> Self {
        HandlerErr::new(e.code(), e.to_string())
    }
}

impl From<StorageError> for HandlerErr {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::SourceMissing(_) => HandlerErr::bad_params(e.to_string()),
            StorageError::TooLarge { .. } => HandlerErr::new("payload_too_large", e.to_string()),
            StorageError::Io(_) => HandlerErr::new("io_failed", e.to_string()),
        }
    }
}

pub type Handler = fn(&Ctx, &Principal, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;
pub type PublicHandler = fn(&Ctx, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;

fn ctx(state: &AppState) -> Option<Ctx<'_>> {
    let conn = state.db.as_ref()?;
    let workspace = state.workspace.as_deref()?;
    Some(Ctx {
        conn,
        config: &state.config,
        workspace,
        media: state.media.as_ref(),
    })
}

/// Verify the bearer token, check the role set, then run `f`.
pub fn authed(state: &mut AppState, req: &Request, allowed: &[Role], f: Handler) -> serde_json::Value {
    let principal = match auth::authorize(req.token.as_deref(), allowed, &state.config) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(method = %req.method, error = %e, "request rejected");
            return HandlerErr::from(e).response(&req.id);
        }
    };
    let Some(ctx) = ctx(state) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(&ctx, &principal, &req.params) {
        Ok(data) => ok(&req.id, data),
        Err(e) => e.response(&req.id),
    }
}

pub fn public(state: &mut AppState, req: &Request, f: PublicHandler) -> serde_json::Value {
    let Some(ctx) = ctx(state) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(&ctx, &req.params) {
        Ok(data) => ok(&req.id, data),
        Err(e) => e.response(&req.id),
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn ts_to_rfc3339(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(f, _) => {
            f.code == ErrorCode::ConstraintViolation
                && (f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Insert failures: unique violations become `conflict`, the rest 500s.
pub fn insert_err(e: rusqlite::Error, table: &str, conflict_message: &str) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::conflict(conflict_message)
    } else {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": table }))
    }
}

fn type_err(key: &str, expected: &str) -> HandlerErr {
    HandlerErr::bad_params(format!("{} must be {}", key, expected))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.trim().to_string()))
            .ok_or_else(|| type_err(key, "a string")),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    match get_optional_str(params, key)? {
        Some(s) if !s.is_empty() => Ok(s),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must not be empty", key))),
        None => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

pub fn get_optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|x| x.is_finite())
            .map(Some)
            .ok_or_else(|| type_err(key, "a number")),
    }
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    get_optional_f64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| type_err(key, "an integer")),
    }
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or_else(|| type_err(key, "a boolean")),
    }
}

pub fn get_str_array(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| type_err(key, "an array of strings"))
            })
            .collect(),
        Some(_) => Err(type_err(key, "an array of strings")),
    }
}

/// Accepts `YYYY-MM-DD` or a full RFC3339 timestamp (date part in UTC).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_instant(t).map(|dt| dt.date_naive()))
}

pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn get_optional_date(params: &serde_json::Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match get_optional_str(params, key)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => parse_date(&s)
            .map(Some)
            .ok_or_else(|| type_err(key, "a date (YYYY-MM-DD)")),
    }
}

pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    get_optional_date(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_instant(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    match get_optional_str(params, key)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => parse_instant(&s)
            .map(Some)
            .ok_or_else(|| type_err(key, "an RFC3339 timestamp")),
    }
}

pub fn get_required_instant(params: &serde_json::Value, key: &str) -> Result<DateTime<Utc>, HandlerErr> {
    get_optional_instant(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Inclusive date window; `end` before `start` is rejected.
pub fn get_date_range(
    params: &serde_json::Value,
) -> Result<(Option<NaiveDate>, Option<NaiveDate>), HandlerErr> {
    let start = get_optional_date(params, "startDate")?;
    let end = get_optional_date(params, "endDate")?;
    if let (Some(s), Some(e)) = (start, end) {
        if e < s {
            return Err(HandlerErr::bad_params("endDate must not be before startDate"));
        }
    }
    Ok((start, end))
}

/// Lowercased address with a non-empty local part and domain.
pub fn get_required_email(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let email = get_required_str(params, "email")?.to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => {
            Ok(email)
        }
        _ => Err(HandlerErr::bad_params("email is not a valid address")),
    }
}

pub fn get_new_password(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let raw = match params.get("password").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return Err(HandlerErr::bad_params("missing password")),
    };
    if raw.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(raw)
}

/// Copy the file named by `params[key]` into the upload store.
pub fn store_param_file(
    ctx: &Ctx,
    params: &serde_json::Value,
    key: &str,
    category: &str,
) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, key)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => Ok(Some(storage::store_upload(
            ctx.workspace,
            category,
            std::path::Path::new(&s),
            ctx.config.upload_max_bytes,
        )?)),
    }
}

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub name: String,
    pub email: String,
    pub class_id: String,
}

#[derive(Debug, Clone)]
pub struct TeacherRef {
    pub id: String,
    pub name: String,
    pub email: String,
    pub is_class_teacher: bool,
    pub class_id: Option<String>,
}

pub fn find_student(conn: &Connection, school_id: &str, student_id: &str) -> Result<Option<StudentRef>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, name, email, class_id FROM students WHERE id = ? AND school_id = ?",
            (student_id, school_id),
            |r| {
                Ok(StudentRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    email: r.get(2)?,
                    class_id: r.get(3)?,
                })
            },
        )
        .optional()?)
}

pub fn require_student(conn: &Connection, school_id: &str, student_id: &str) -> Result<StudentRef, HandlerErr> {
    find_student(conn, school_id, student_id)?.ok_or_else(|| HandlerErr::not_found("student not found"))
}

pub fn find_teacher(conn: &Connection, school_id: &str, teacher_id: &str) -> Result<Option<TeacherRef>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, name, email, is_class_teacher, class_id FROM teachers WHERE id = ? AND school_id = ?",
            (teacher_id, school_id),
            |r| {
                Ok(TeacherRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    email: r.get(2)?,
                    is_class_teacher: r.get::<_, i64>(3)? != 0,
                    class_id: r.get(4)?,
                })
            },
        )
        .optional()?)
}

pub fn require_teacher(conn: &Connection, school_id: &str, teacher_id: &str) -> Result<TeacherRef, HandlerErr> {
    find_teacher(conn, school_id, teacher_id)?.ok_or_else(|| HandlerErr::not_found("teacher not found"))
}

/// The class a teacher is class teacher of, if flagged.
pub fn class_teacher_class(teacher: &TeacherRef) -> Option<&str> {
    if teacher.is_class_teacher {
        teacher.class_id.as_deref()
    } else {
        None
    }
}

fn exists_in_school(conn: &Connection, table: &str, school_id: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ? AND school_id = ?", table);
    Ok(conn
        .query_row(&sql, (id, school_id), |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn require_class(conn: &Connection, school_id: &str, class_id: &str) -> Result<(), HandlerErr> {
    if exists_in_school(conn, "classes", school_id, class_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("class not found"))
    }
}

pub fn require_subject(conn: &Connection, school_id: &str, subject_id: &str) -> Result<(), HandlerErr> {
    if exists_in_school(conn, "subjects", school_id, subject_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("subject not found"))
    }
}

/// Students may only read data of their own class.
pub fn ensure_student_class(conn: &Connection, principal: &Principal, class_id: &str) -> Result<(), HandlerErr> {
    if principal.role != Role::Student {
        return Ok(());
    }
    let me = require_student(conn, &principal.school_id, &principal.id)?;
    if me.class_id != class_id {
        return Err(HandlerErr::forbidden("students may only view their own class"));
    }
    Ok(())
}
