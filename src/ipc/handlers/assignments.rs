//! Assignments, student submissions and grading. Uploaded videos are handed
//! to the media queue; the request returns as soon as the job is recorded.

use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;

use crate::auth::{Principal, Role};
use crate::ipc::helpers::{
    authed, ensure_student_class, get_optional_bool, get_optional_f64, get_optional_str,
    get_required_f64, get_required_str, get_str_array, new_id, now_rfc3339, parse_date,
    parse_instant, require_class, require_student, require_subject, store_param_file,
    ts_to_rfc3339, HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::media::NewJob;
use crate::storage;

const DEFAULT_MAX_POINTS: f64 = 100.0;

/// RFC3339 instant, or a bare date meaning the last second of that day (UTC).
fn parse_deadline(raw: &str) -> Option<DateTime<Utc>> {
    parse_instant(raw).or_else(|| {
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59)?;
        parse_date(raw).map(|d| d.and_time(end_of_day).and_utc())
    })
}

fn get_deadline(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match get_optional_str(params, key)?.filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_deadline(&raw)
            .map(|t| Some(t.timestamp()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a date or RFC3339 timestamp", key))),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Criterion {
    name: String,
    max_score: f64,
}

fn get_rubric(params: &serde_json::Value) -> Result<Option<Vec<Criterion>>, HandlerErr> {
    let items = match params.get("rubric") {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::Array(items)) => items,
        Some(_) => return Err(HandlerErr::bad_params("rubric must be an array")),
    };
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let name = get_required_str(item, "name")?;
        let max_score = get_required_f64(item, "maxScore")?;
        if max_score <= 0.0 {
            return Err(HandlerErr::bad_params("rubric maxScore must be positive"));
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(HandlerErr::bad_params(format!("duplicate rubric criterion: {}", name)));
        }
        out.push(Criterion { name, max_score });
    }
    Ok(Some(out))
}

fn get_max_points(params: &serde_json::Value) -> Result<Option<f64>, HandlerErr> {
    match get_optional_f64(params, "maxPoints")? {
        Some(x) if x <= 0.0 => Err(HandlerErr::bad_params("maxPoints must be positive")),
        other => Ok(other),
    }
}

/// Store every listed upload, undoing earlier copies if a later one fails.
fn store_all(ctx: &Ctx, paths: &[String], category: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stored = Vec::with_capacity(paths.len());
    for raw in paths.iter().filter(|p| !p.is_empty()) {
        match storage::store_upload(ctx.workspace, category, Path::new(raw), ctx.config.upload_max_bytes) {
            Ok(rel) => stored.push(rel),
            Err(e) => {
                remove_all(ctx, &stored);
                return Err(e.into());
            }
        }
    }
    Ok(stored)
}

fn remove_all(ctx: &Ctx, files: &[String]) {
    for f in files {
        storage::remove(ctx.workspace, f);
    }
}

/// Runs after the owning row has committed, so a failure here only costs the
/// compression: the original upload stays in place and no job id is returned.
fn queue_compression(ctx: &Ctx, school_id: &str, owner_kind: &str, owner_id: &str, input: &str) -> Option<String> {
    let Some(media) = ctx.media else {
        tracing::warn!(owner_kind, owner_id, "media worker is not running; video left uncompressed");
        return None;
    };
    let job = NewJob {
        school_id,
        owner_kind,
        owner_id,
        input_path: input,
    };
    match media.enqueue(ctx.conn, job) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(owner_kind, owner_id, error = %format!("{e:#}"), "failed to queue compression");
            None
        }
    }
}

struct Assignment {
    id: String,
    class_id: String,
    teacher_id: String,
    due_at: i64,
    max_points: f64,
    allow_late: bool,
    video_path: Option<String>,
}

fn load_assignment(conn: &Connection, school_id: &str, id: &str) -> Result<Assignment, HandlerErr> {
    conn.query_row(
        "SELECT id, class_id, teacher_id, due_at, max_points, allow_late, video_path
         FROM assignments WHERE id = ? AND school_id = ?",
        (id, school_id),
        |r| {
            Ok(Assignment {
                id: r.get(0)?,
                class_id: r.get(1)?,
                teacher_id: r.get(2)?,
                due_at: r.get(3)?,
                max_points: r.get(4)?,
                allow_late: r.get::<_, i64>(5)? != 0,
                video_path: r.get(6)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("assignment not found"))
}

fn require_owner(p: &Principal, a: &Assignment) -> Result<(), HandlerErr> {
    if p.role == Role::Teacher && a.teacher_id != p.id {
        return Err(HandlerErr::forbidden("only the teacher who set this assignment can do that"));
    }
    Ok(())
}

fn rubric_of(conn: &Connection, assignment_id: &str) -> Result<Vec<Criterion>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT name, max_score FROM assignment_rubric WHERE assignment_id = ? ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([assignment_id], |r| {
            Ok(Criterion {
                name: r.get(0)?,
                max_score: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn attachments_of(conn: &Connection, assignment_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT path FROM assignment_attachments WHERE assignment_id = ? ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([assignment_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn assignment_json(conn: &Connection, school_id: &str, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let mut out = conn
        .query_row(
            "SELECT a.id, a.class_id, c.class_text, a.subject_id, s.subject_name, a.teacher_id, t.name,
                    a.title, a.description, a.due_at, a.video_path, a.video_job_id, j.status,
                    a.max_points, a.allow_late, a.peer_review, a.created_at,
                    (SELECT COUNT(*) FROM submissions sub WHERE sub.assignment_id = a.id)
             FROM assignments a
             JOIN classes c ON c.id = a.class_id
             JOIN subjects s ON s.id = a.subject_id
             JOIN teachers t ON t.id = a.teacher_id
             LEFT JOIN media_jobs j ON j.id = a.video_job_id
             WHERE a.id = ? AND a.school_id = ?",
            (id, school_id),
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "classId": r.get::<_, String>(1)?,
                    "className": r.get::<_, String>(2)?,
                    "subjectId": r.get::<_, String>(3)?,
                    "subjectName": r.get::<_, String>(4)?,
                    "teacherId": r.get::<_, String>(5)?,
                    "teacherName": r.get::<_, String>(6)?,
                    "title": r.get::<_, String>(7)?,
                    "description": r.get::<_, String>(8)?,
                    "dueDate": ts_to_rfc3339(r.get(9)?),
                    "videoUrl": r.get::<_, Option<String>>(10)?,
                    "videoJobId": r.get::<_, Option<String>>(11)?,
                    "videoStatus": r.get::<_, Option<String>>(12)?,
                    "maxPoints": r.get::<_, f64>(13)?,
                    "allowLateSubmission": r.get::<_, i64>(14)? != 0,
                    "peerReview": r.get::<_, i64>(15)? != 0,
                    "createdAt": r.get::<_, String>(16)?,
                    "submissionCount": r.get::<_, i64>(17)?,
                }))
            },
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("assignment not found"))?;
    let rubric: Vec<serde_json::Value> = rubric_of(conn, id)?
        .into_iter()
        .map(|c| json!({ "name": c.name, "maxScore": c.max_score }))
        .collect();
    out["rubric"] = json!(rubric);
    out["attachments"] = json!(attachments_of(conn, id)?);
    Ok(out)
}

fn write_rubric(conn: &Connection, assignment_id: &str, rubric: &[Criterion]) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM assignment_rubric WHERE assignment_id = ?", [assignment_id])?;
    for (i, c) in rubric.iter().enumerate() {
        conn.execute(
            "INSERT INTO assignment_rubric(assignment_id, sort_order, name, max_score) VALUES(?, ?, ?, ?)",
            (assignment_id, i as i64, &c.name, c.max_score),
        )?;
    }
    Ok(())
}

fn write_attachments(conn: &Connection, assignment_id: &str, files: &[String]) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM assignment_attachments WHERE assignment_id = ?",
        [assignment_id],
    )?;
    for (i, f) in files.iter().enumerate() {
        conn.execute(
            "INSERT INTO assignment_attachments(assignment_id, sort_order, path) VALUES(?, ?, ?)",
            (assignment_id, i as i64, f),
        )?;
    }
    Ok(())
}

fn handle_create(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let title = get_required_str(params, "title")?;
    let description = get_required_str(params, "description")?;
    let due_at = get_deadline(params, "dueDate")?.ok_or_else(|| HandlerErr::bad_params("missing dueDate"))?;
    let rubric = get_rubric(params)?.unwrap_or_default();
    let max_points = get_max_points(params)?.unwrap_or(DEFAULT_MAX_POINTS);
    let allow_late = get_optional_bool(params, "allowLateSubmission")?.unwrap_or(false);
    let peer_review = get_optional_bool(params, "peerReview")?.unwrap_or(false);
    let attachment_sources = get_str_array(params, "attachments")?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    require_subject(ctx.conn, &p.school_id, &subject_id)?;

    let attachments = store_all(ctx, &attachment_sources, "assignments")?;
    let video = match store_param_file(ctx, params, "videoPath", "videos") {
        Ok(v) => v,
        Err(e) => {
            remove_all(ctx, &attachments);
            return Err(e);
        }
    };

    let id = new_id();
    let saved = (|| -> Result<(), HandlerErr> {
        let tx = ctx.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO assignments(id, school_id, class_id, subject_id, teacher_id, title, description,
                                     due_at, video_path, max_points, allow_late, peer_review, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &id,
                &p.school_id,
                &class_id,
                &subject_id,
                &p.id,
                &title,
                &description,
                due_at,
                &video,
                max_points,
                allow_late,
                peer_review,
                now_rfc3339(),
            ],
        )?;
        write_attachments(&tx, &id, &attachments)?;
        write_rubric(&tx, &id, &rubric)?;
        tx.commit()?;
        Ok(())
    })();
    if let Err(e) = saved {
        remove_all(ctx, &attachments);
        remove_all(ctx, video.as_slice());
        return Err(e);
    }

    if let Some(job_id) = video
        .as_deref()
        .and_then(|v| queue_compression(ctx, &p.school_id, "assignment", &id, v))
    {
        ctx.conn.execute(
            "UPDATE assignments SET video_job_id = ? WHERE id = ?",
            (&job_id, &id),
        )?;
    }
    tracing::info!(assignment_id = %id, class_id = %class_id, teacher = %p.id, "assignment created");
    Ok(json!({ "assignment": assignment_json(ctx.conn, &p.school_id, &id)? }))
}

fn handle_list_by_class(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    ensure_student_class(ctx.conn, p, &class_id)?;
    let mut stmt = ctx.conn.prepare(
        "SELECT id FROM assignments WHERE school_id = ? AND class_id = ? ORDER BY due_at DESC",
    )?;
    let ids = stmt
        .query_map((&p.school_id, &class_id), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let assignments = ids
        .iter()
        .map(|id| assignment_json(ctx.conn, &p.school_id, id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "assignments": assignments }))
}

fn handle_get(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let a = load_assignment(ctx.conn, &p.school_id, &id)?;
    ensure_student_class(ctx.conn, p, &a.class_id)?;
    Ok(json!({ "assignment": assignment_json(ctx.conn, &p.school_id, &id)? }))
}

fn handle_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let a = load_assignment(ctx.conn, &p.school_id, &id)?;
    require_owner(p, &a)?;

    let title = get_optional_str(params, "title")?;
    let description = get_optional_str(params, "description")?;
    if title.as_deref() == Some("") || description.as_deref() == Some("") {
        return Err(HandlerErr::bad_params("title and description must not be empty"));
    }
    let due_at = get_deadline(params, "dueDate")?;
    let max_points = get_max_points(params)?;
    let allow_late = get_optional_bool(params, "allowLateSubmission")?;
    let peer_review = get_optional_bool(params, "peerReview")?;
    let rubric = get_rubric(params)?;
    let replace_attachments = params.get("attachments").is_some_and(|v| !v.is_null());
    let attachment_sources = get_str_array(params, "attachments")?;

    let old_attachments = attachments_of(ctx.conn, &id)?;
    let attachments = store_all(ctx, &attachment_sources, "assignments")?;
    let video = match store_param_file(ctx, params, "videoPath", "videos") {
        Ok(v) => v,
        Err(e) => {
            remove_all(ctx, &attachments);
            return Err(e);
        }
    };

    let saved = (|| -> Result<(), HandlerErr> {
        let tx = ctx.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE assignments SET
               title = COALESCE(?, title),
               description = COALESCE(?, description),
               due_at = COALESCE(?, due_at),
               max_points = COALESCE(?, max_points),
               allow_late = COALESCE(?, allow_late),
               peer_review = COALESCE(?, peer_review),
               video_path = COALESCE(?, video_path)
             WHERE id = ?",
            rusqlite::params![
                &title,
                &description,
                due_at,
                max_points,
                allow_late,
                peer_review,
                &video,
                &id
            ],
        )?;
        if replace_attachments {
            write_attachments(&tx, &id, &attachments)?;
        }
        if let Some(r) = &rubric {
            write_rubric(&tx, &id, r)?;
        }
        tx.commit()?;
        Ok(())
    })();
    if let Err(e) = saved {
        remove_all(ctx, &attachments);
        remove_all(ctx, video.as_slice());
        return Err(e);
    }

    if replace_attachments {
        remove_all(ctx, &old_attachments);
    }
    if let Some(v) = &video {
        if let Some(old) = &a.video_path {
            storage::remove(ctx.workspace, old);
        }
        let job_id = queue_compression(ctx, &p.school_id, "assignment", &id, v);
        ctx.conn.execute(
            "UPDATE assignments SET video_job_id = ? WHERE id = ?",
            (&job_id, &id),
        )?;
    }
    Ok(json!({ "assignment": assignment_json(ctx.conn, &p.school_id, &id)? }))
}

fn submission_files(conn: &Connection, assignment_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT file_path, video_path, feedback_video_path FROM submissions WHERE assignment_id = ?",
    )?;
    let files = stmt
        .query_map([assignment_id], |r| {
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
    Ok(files)
}

fn handle_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let a = load_assignment(ctx.conn, &p.school_id, &id)?;
    require_owner(p, &a)?;

    let mut files = submission_files(ctx.conn, &id)?;
    files.extend(attachments_of(ctx.conn, &id)?);
    files.extend(a.video_path.clone());

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM submission_rubric_scores
         WHERE submission_id IN (SELECT id FROM submissions WHERE assignment_id = ?)",
        [&id],
    )?;
    let removed = tx.execute("DELETE FROM submissions WHERE assignment_id = ?", [&id])?;
    tx.execute("DELETE FROM assignment_rubric WHERE assignment_id = ?", [&id])?;
    tx.execute("DELETE FROM assignment_attachments WHERE assignment_id = ?", [&id])?;
    tx.execute("DELETE FROM assignments WHERE id = ?", [&id])?;
    tx.commit()?;
    remove_all(ctx, &files);
    tracing::info!(assignment_id = %id, submissions = removed, "assignment deleted");
    Ok(json!({ "deleted": true, "submissionsRemoved": removed }))
}

const SUBMISSION_SELECT: &str = "SELECT s.id, s.assignment_id, s.student_id, st.name, s.file_path, s.video_path,
        s.remarks, s.grade, s.feedback, s.feedback_video_path, s.late, s.extension_until,
        s.submitted_at, s.graded_at
     FROM submissions s JOIN students st ON st.id = s.student_id";

fn submission_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "assignmentId": r.get::<_, String>(1)?,
        "studentId": r.get::<_, String>(2)?,
        "studentName": r.get::<_, String>(3)?,
        "fileUrl": r.get::<_, Option<String>>(4)?,
        "videoUrl": r.get::<_, Option<String>>(5)?,
        "remarks": r.get::<_, Option<String>>(6)?,
        "grade": r.get::<_, Option<f64>>(7)?,
        "feedback": r.get::<_, Option<String>>(8)?,
        "feedbackVideoUrl": r.get::<_, Option<String>>(9)?,
        "late": r.get::<_, i64>(10)? != 0,
        "extensionUntil": r.get::<_, Option<i64>>(11)?.map(ts_to_rfc3339),
        "submittedAt": ts_to_rfc3339(r.get(12)?),
        "gradedAt": r.get::<_, Option<i64>>(13)?.map(ts_to_rfc3339),
    }))
}

fn with_scores(conn: &Connection, mut sub: serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = sub["id"].as_str().unwrap_or_default().to_string();
    let mut stmt = conn.prepare(
        "SELECT name, score FROM submission_rubric_scores WHERE submission_id = ? ORDER BY name",
    )?;
    let scores = stmt
        .query_map([&id], |r| {
            Ok(json!({ "name": r.get::<_, String>(0)?, "score": r.get::<_, f64>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    sub["rubricScores"] = json!(scores);
    Ok(sub)
}

fn load_submission(conn: &Connection, school_id: &str, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("{} WHERE s.id = ? AND s.school_id = ?", SUBMISSION_SELECT);
    let sub = conn
        .query_row(&sql, (id, school_id), submission_row)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("submission not found"))?;
    with_scores(conn, sub)
}

fn handle_submit(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let a = load_assignment(ctx.conn, &p.school_id, &assignment_id)?;
    let me = require_student(ctx.conn, &p.school_id, &p.id)?;
    if me.class_id != a.class_id {
        return Err(HandlerErr::forbidden("assignment is not for your class"));
    }
    let remarks = get_optional_str(params, "remarks")?.filter(|s| !s.is_empty());
    let has_file = get_optional_str(params, "filePath")?.is_some_and(|s| !s.is_empty());
    let has_video = get_optional_str(params, "videoPath")?.is_some_and(|s| !s.is_empty());
    if !has_file && !has_video && remarks.is_none() {
        return Err(HandlerErr::bad_params("submit a file, a video or remarks"));
    }

    let now = Utc::now().timestamp();
    let existing: Option<(String, Option<i64>, [Option<String>; 3])> = ctx
        .conn
        .query_row(
            "SELECT id, extension_until, file_path, video_path, feedback_video_path
             FROM submissions WHERE assignment_id = ? AND student_id = ?",
            (&a.id, &me.id),
            |r| Ok((r.get(0)?, r.get(1)?, [r.get(2)?, r.get(3)?, r.get(4)?])),
        )
        .optional()?;

    let late = match &existing {
        None => {
            let late = now > a.due_at;
            if late && !a.allow_late {
                return Err(HandlerErr::bad_params("the due date has passed")
                    .with_details(json!({ "dueDate": ts_to_rfc3339(a.due_at) })));
            }
            late
        }
        Some((_, Some(ext), _)) if *ext > now => now > *ext,
        Some(_) => return Err(HandlerErr::conflict("you have already submitted this assignment")),
    };

    let file = store_param_file(ctx, params, "filePath", "submissions")?;
    let video = match store_param_file(ctx, params, "videoPath", "videos") {
        Ok(v) => v,
        Err(e) => {
            remove_all(ctx, file.as_slice());
            return Err(e);
        }
    };

    let submission_id = existing.as_ref().map(|(id, _, _)| id.clone()).unwrap_or_else(new_id);
    let saved = (|| -> Result<(), HandlerErr> {
        let tx = ctx.conn.unchecked_transaction()?;
        if existing.is_some() {
            // Resubmission under an extension starts grading over.
            tx.execute(
                "DELETE FROM submission_rubric_scores WHERE submission_id = ?",
                [&submission_id],
            )?;
            tx.execute(
                "UPDATE submissions SET file_path = ?, video_path = ?, remarks = ?, late = ?,
                                        submitted_at = ?, grade = NULL, feedback = NULL,
                                        feedback_video_path = NULL, graded_at = NULL
                 WHERE id = ?",
                rusqlite::params![&file, &video, &remarks, late, now, &submission_id],
            )?;
        } else {
            tx.execute(
                "INSERT INTO submissions(id, school_id, assignment_id, student_id, file_path, video_path,
                                         remarks, late, submitted_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    &submission_id,
                    &p.school_id,
                    &a.id,
                    &me.id,
                    &file,
                    &video,
                    &remarks,
                    late,
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    })();
    if let Err(e) = saved {
        remove_all(ctx, file.as_slice());
        remove_all(ctx, video.as_slice());
        return Err(e);
    }
    if let Some((_, _, old_files)) = &existing {
        let old: Vec<String> = old_files.iter().flatten().cloned().collect();
        remove_all(ctx, &old);
    }

    let video_job_id = video
        .as_deref()
        .and_then(|v| queue_compression(ctx, &p.school_id, "submission", &submission_id, v));
    tracing::info!(
        submission_id = %submission_id,
        assignment_id = %a.id,
        late,
        resubmitted = existing.is_some(),
        "assignment submitted"
    );
    let mut out = json!({ "submission": load_submission(ctx.conn, &p.school_id, &submission_id)? });
    out["videoJobId"] = json!(video_job_id);
    Ok(out)
}

fn handle_submissions(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let a = load_assignment(ctx.conn, &p.school_id, &assignment_id)?;
    require_owner(p, &a)?;
    let sql = format!(
        "{} WHERE s.assignment_id = ? ORDER BY s.submitted_at, st.name",
        SUBMISSION_SELECT
    );
    let mut stmt = ctx.conn.prepare(&sql)?;
    let subs = stmt
        .query_map([&a.id], submission_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let subs = subs
        .into_iter()
        .map(|s| with_scores(ctx.conn, s))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "submissions": subs }))
}

fn handle_my_submission(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let a = load_assignment(ctx.conn, &p.school_id, &assignment_id)?;
    let sql = format!(
        "{} WHERE s.assignment_id = ? AND s.student_id = ?",
        SUBMISSION_SELECT
    );
    let sub = ctx
        .conn
        .query_row(&sql, (&a.id, &p.id), submission_row)
        .optional()?;
    let sub = match sub {
        Some(s) => Some(with_scores(ctx.conn, s)?),
        None => None,
    };
    Ok(json!({ "submission": sub }))
}

fn get_rubric_scores(
    params: &serde_json::Value,
    rubric: &[Criterion],
) -> Result<Option<Vec<(String, f64)>>, HandlerErr> {
    let items = match params.get("rubricScores") {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::Array(items)) => items,
        Some(_) => return Err(HandlerErr::bad_params("rubricScores must be an array")),
    };
    let mut out = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for item in items {
        let name = get_required_str(item, "name")?;
        let score = get_required_f64(item, "score")?;
        let Some(c) = rubric.iter().find(|c| c.name.eq_ignore_ascii_case(&name)) else {
            return Err(HandlerErr::bad_params(format!("unknown rubric criterion: {}", name)));
        };
        if !(0.0..=c.max_score).contains(&score) {
            return Err(HandlerErr::bad_params(format!(
                "score for {} must be between 0 and {}",
                c.name, c.max_score
            )));
        }
        if !seen.insert(c.name.clone()) {
            return Err(HandlerErr::bad_params(format!("duplicate score for {}", c.name)));
        }
        out.push((c.name.clone(), score));
    }
    Ok(Some(out))
}

fn handle_grade(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = get_required_str(params, "submissionId")?;
    let assignment_id: String = ctx
        .conn
        .query_row(
            "SELECT assignment_id FROM submissions WHERE id = ? AND school_id = ?",
            (&submission_id, &p.school_id),
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("submission not found"))?;
    let a = load_assignment(ctx.conn, &p.school_id, &assignment_id)?;
    require_owner(p, &a)?;

    let grade = get_optional_f64(params, "grade")?;
    let extension = get_deadline(params, "extensionUntil")?;
    if grade.is_none() && extension.is_none() {
        return Err(HandlerErr::bad_params("missing grade"));
    }
    if let Some(g) = grade {
        if !(0.0..=a.max_points).contains(&g) {
            return Err(HandlerErr::bad_params(format!(
                "grade must be between 0 and {}",
                a.max_points
            )));
        }
    }
    let feedback = get_optional_str(params, "feedback")?;
    let scores = get_rubric_scores(params, &rubric_of(ctx.conn, &a.id)?)?;
    let feedback_video = store_param_file(ctx, params, "feedbackVideoPath", "feedback")?;
    let old_feedback_video: Option<String> = ctx.conn.query_row(
        "SELECT feedback_video_path FROM submissions WHERE id = ?",
        [&submission_id],
        |r| r.get(0),
    )?;

    let graded_at = grade.map(|_| Utc::now().timestamp());
    let saved = (|| -> Result<(), HandlerErr> {
        let tx = ctx.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE submissions SET
               grade = COALESCE(?, grade),
               feedback = COALESCE(?, feedback),
               feedback_video_path = COALESCE(?, feedback_video_path),
               extension_until = COALESCE(?, extension_until),
               graded_at = COALESCE(?, graded_at)
             WHERE id = ?",
            rusqlite::params![grade, &feedback, &feedback_video, extension, graded_at, &submission_id],
        )?;
        if let Some(scores) = &scores {
            tx.execute(
                "DELETE FROM submission_rubric_scores WHERE submission_id = ?",
                [&submission_id],
            )?;
            for (name, score) in scores {
                tx.execute(
                    "INSERT INTO submission_rubric_scores(submission_id, name, score) VALUES(?, ?, ?)",
                    (&submission_id, name, score),
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    })();
    if let Err(e) = saved {
        remove_all(ctx, feedback_video.as_slice());
        return Err(e);
    }

    let mut video_job_id = None;
    if let Some(v) = &feedback_video {
        if let Some(old) = &old_feedback_video {
            storage::remove(ctx.workspace, old);
        }
        video_job_id = queue_compression(ctx, &p.school_id, "feedback", &submission_id, v);
    }
    tracing::info!(submission_id = %submission_id, grade, "submission graded");
    let mut out = json!({ "submission": load_submission(ctx.conn, &p.school_id, &submission_id)? });
    out["videoJobId"] = json!(video_job_id);
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const TEACHER: &[Role] = &[Role::Teacher];
    const STAFF: &[Role] = &[Role::School, Role::Teacher];
    match req.method.as_str() {
        "assignments.create" => Some(authed(state, req, TEACHER, handle_create)),
        "assignments.listByClass" => Some(authed(state, req, &Role::ALL, handle_list_by_class)),
        "assignments.get" => Some(authed(state, req, &Role::ALL, handle_get)),
        "assignments.update" => Some(authed(state, req, TEACHER, handle_update)),
        "assignments.delete" => Some(authed(state, req, TEACHER, handle_delete)),
        "assignments.submit" => Some(authed(state, req, &[Role::Student], handle_submit)),
        "assignments.submissions" => Some(authed(state, req, STAFF, handle_submissions)),
        "assignments.mySubmission" => Some(authed(state, req, &[Role::Student], handle_my_submission)),
        "assignments.grade" => Some(authed(state, req, TEACHER, handle_grade)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_dates_are_due_at_end_of_day() {
        let t = parse_deadline("2026-05-01").unwrap();
        assert_eq!(t.to_rfc3339(), "2026-05-01T23:59:59+00:00");
        let t = parse_deadline("2026-05-01T09:00:00+02:00").unwrap();
        assert_eq!(t.timestamp(), parse_deadline("2026-05-01T07:00:00Z").unwrap().timestamp());
        assert!(parse_deadline("tomorrow").is_none());
    }

    #[test]
    fn rubric_scores_must_match_criteria() {
        let rubric = vec![Criterion {
            name: "Clarity".into(),
            max_score: 5.0,
        }];
        let ok = json!({ "rubricScores": [{ "name": "clarity", "score": 4 }] });
        assert_eq!(
            get_rubric_scores(&ok, &rubric).unwrap(),
            Some(vec![("Clarity".to_string(), 4.0)])
        );
        let over = json!({ "rubricScores": [{ "name": "Clarity", "score": 6 }] });
        assert!(get_rubric_scores(&over, &rubric).is_err());
        let unknown = json!({ "rubricScores": [{ "name": "Style", "score": 1 }] });
        assert!(get_rubric_scores(&unknown, &rubric).is_err());
    }

    #[test]
    fn compression_failures_do_not_fail_the_request() {
        let ws = std::env::temp_dir().join(format!("schoold-queue-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&ws).unwrap();
        let conn = crate::db::open_db(&ws).unwrap();
        let config = crate::config::Config::default();

        let no_worker = Ctx {
            conn: &conn,
            config: &config,
            workspace: &ws,
            media: None,
        };
        assert_eq!(queue_compression(&no_worker, "s1", "submission", "sub1", "uploads/x.mp4"), None);

        let media = crate::media::MediaQueue::start(ws.clone(), "false".into()).unwrap();
        conn.execute_batch("DROP TABLE media_jobs").unwrap();
        let broken = Ctx {
            media: Some(&media),
            ..no_worker
        };
        assert_eq!(queue_compression(&broken, "s1", "feedback", "sub1", "uploads/x.mp4"), None);
    }
}
