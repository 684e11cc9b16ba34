//! Daily attendance for students and teachers plus the monthly rollup that
//! every write refreshes inside its own transaction.

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeSet;

use crate::auth::{Principal, Role};
use crate::calc::{self, AttendanceCounts};
use crate::domain::{AttendanceStatus, TeacherAttendanceStatus};
use crate::ipc::helpers::{
    authed, ensure_student_class, find_student, find_teacher, get_date_range, get_optional_date,
    get_optional_str, get_required_str, insert_err, new_id, now_rfc3339, require_class,
    require_student, require_subject, require_teacher, today, HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};

const PERIOD_MONTHLY: &str = "Monthly";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Person {
    Student,
    Teacher,
}

impl Person {
    fn kind(self) -> &'static str {
        match self {
            Person::Student => "student",
            Person::Teacher => "teacher",
        }
    }
}

/// Rebuild the monthly rollup for `person_id` from every row of the month
/// containing `date`. Per-subject rows count once per day: present beats
/// late, which beats excused or on leave, which beats absent.
fn recompute_month(
    conn: &Connection,
    school_id: &str,
    person: Person,
    person_id: &str,
    date: NaiveDate,
) -> rusqlite::Result<()> {
    let (first, last) = calc::month_bounds(date);
    let sql = match person {
        Person::Student => {
            "SELECT date, status FROM student_attendance
             WHERE school_id = ? AND student_id = ? AND date >= ? AND date <= ?"
        }
        Person::Teacher => {
            "SELECT date, status FROM teacher_attendance
             WHERE school_id = ? AND teacher_id = ? AND date >= ? AND date <= ?"
        }
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(
            (school_id, person_id, first.to_string(), last.to_string()),
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let dated = rows
        .iter()
        .filter_map(|(d, s)| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok().map(|d| (d, s.as_str())));
    let counts = match person {
        Person::Student => AttendanceCounts::tally_students(calc::one_status_per_day(
            dated.filter_map(|(d, s)| AttendanceStatus::parse(s).map(|s| (d, s))),
            calc::student_day_rank,
        )),
        Person::Teacher => AttendanceCounts::tally_teachers(calc::one_status_per_day(
            dated.filter_map(|(d, s)| TeacherAttendanceStatus::parse(s).map(|s| (d, s))),
            calc::teacher_day_rank,
        )),
    };
    let days = calc::days_in_month(date.year(), date.month());
    let percentage = calc::monthly_attendance_percentage(counts.present, days);

    conn.execute(
        "INSERT INTO attendance_summaries(id, school_id, person_kind, person_id, period_type,
                                          start_date, end_date, total_days, present_days, absent_days,
                                          late_days, excused_days, on_leave_days, percentage, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(school_id, person_id, period_type, start_date, end_date) DO UPDATE SET
           total_days = excluded.total_days,
           present_days = excluded.present_days,
           absent_days = excluded.absent_days,
           late_days = excluded.late_days,
           excused_days = excluded.excused_days,
           on_leave_days = excluded.on_leave_days,
           percentage = excluded.percentage,
           updated_at = excluded.updated_at",
        rusqlite::params![
            new_id(),
            school_id,
            person.kind(),
            person_id,
            PERIOD_MONTHLY,
            first.to_string(),
            last.to_string(),
            days,
            counts.present,
            counts.absent,
            counts.late,
            counts.excused,
            counts.on_leave,
            percentage,
            now_rfc3339(),
        ],
    )?;
    Ok(())
}

fn student_status(raw: Option<&str>) -> Result<AttendanceStatus, HandlerErr> {
    let raw = raw.ok_or_else(|| HandlerErr::bad_params("missing status"))?;
    AttendanceStatus::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params(format!("status must be one of: {}", AttendanceStatus::choices()))
    })
}

fn teacher_status(raw: Option<&str>) -> Result<TeacherAttendanceStatus, HandlerErr> {
    let raw = raw.ok_or_else(|| HandlerErr::bad_params("missing status"))?;
    TeacherAttendanceStatus::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params(format!(
            "status must be one of: {}",
            TeacherAttendanceStatus::choices()
        ))
    })
}

fn subject_key(ctx: &Ctx, school_id: &str, params: &serde_json::Value) -> Result<String, HandlerErr> {
    match get_optional_str(params, "subjectId")?.filter(|s| !s.is_empty()) {
        Some(id) => {
            require_subject(ctx.conn, school_id, &id)?;
            Ok(id)
        }
        None => Ok(String::new()),
    }
}

const STUDENT_RECORD_SELECT: &str = "SELECT a.id, a.student_id, s.name, a.class_id, a.subject_id, a.date,
        a.status, a.notes, a.marked_by, a.created_at
     FROM student_attendance a JOIN students s ON s.id = a.student_id";

fn student_record_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let subject: String = r.get(4)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "classId": r.get::<_, String>(3)?,
        "subjectId": if subject.is_empty() { None } else { Some(subject) },
        "date": r.get::<_, String>(5)?,
        "status": r.get::<_, String>(6)?,
        "notes": r.get::<_, Option<String>>(7)?,
        "markedBy": r.get::<_, String>(8)?,
        "createdAt": r.get::<_, String>(9)?,
    }))
}

const TEACHER_RECORD_SELECT: &str = "SELECT a.id, a.teacher_id, t.name, a.date, a.status, a.notes,
        a.marked_by, a.created_at, a.updated_at
     FROM teacher_attendance a JOIN teachers t ON t.id = a.teacher_id";

fn teacher_record_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "teacherId": r.get::<_, String>(1)?,
        "teacherName": r.get::<_, String>(2)?,
        "date": r.get::<_, String>(3)?,
        "status": r.get::<_, String>(4)?,
        "notes": r.get::<_, Option<String>>(5)?,
        "markedBy": r.get::<_, String>(6)?,
        "createdAt": r.get::<_, String>(7)?,
        "updatedAt": r.get::<_, String>(8)?,
    }))
}

fn load_student_record(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("{} WHERE a.id = ?", STUDENT_RECORD_SELECT);
    Ok(conn.query_row(&sql, [id], student_record_json)?)
}

#[allow(clippy::too_many_arguments)]
fn insert_student_row(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
    class_id: &str,
    subject_id: &str,
    date: NaiveDate,
    status: AttendanceStatus,
    notes: Option<&str>,
    marked_by: &str,
) -> rusqlite::Result<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO student_attendance(id, school_id, student_id, class_id, subject_id, date, status,
                                        notes, marked_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            school_id,
            student_id,
            class_id,
            subject_id,
            date.to_string(),
            status.as_str(),
            notes,
            marked_by,
            now_rfc3339(),
        ],
    )?;
    Ok(id)
}

fn already_marked(conn: &Connection, student_id: &str, date: NaiveDate, subject_id: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM student_attendance WHERE student_id = ? AND date = ? AND subject_id = ?",
            (student_id, date.to_string(), subject_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

fn handle_student_mark(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let status = student_status(get_optional_str(params, "status")?.as_deref())?;
    let date = get_optional_date(params, "date")?.unwrap_or_else(today);
    let notes = get_optional_str(params, "notes")?;
    let subject_id = subject_key(ctx, &p.school_id, params)?;
    let student = require_student(ctx.conn, &p.school_id, &student_id)?;

    let tx = ctx.conn.unchecked_transaction()?;
    let id = insert_student_row(
        &tx,
        &p.school_id,
        &student.id,
        &student.class_id,
        &subject_id,
        date,
        status,
        notes.as_deref(),
        &p.id,
    )
    .map_err(|e| insert_err(e, "student_attendance", "attendance already marked for this date"))?;
    recompute_month(&tx, &p.school_id, Person::Student, &student.id, date)?;
    tx.commit()?;
    Ok(json!({ "attendance": load_student_record(ctx.conn, &id)? }))
}

/// Partial success: rejected rows land in `errors`, the rest are saved.
fn handle_student_bulk_mark(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    let date = get_optional_date(params, "date")?.unwrap_or_else(today);
    let subject_id = subject_key(ctx, &p.school_id, params)?;
    let Some(records) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("records must be an array"));
    };

    let tx = ctx.conn.unchecked_transaction()?;
    let mut saved: Vec<String> = Vec::new();
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (index, rec) in records.iter().enumerate() {
        let student_id = rec.get("studentId").and_then(|v| v.as_str()).unwrap_or("").trim();
        let attempt = (|| -> Result<String, HandlerErr> {
            if student_id.is_empty() {
                return Err(HandlerErr::bad_params("missing studentId"));
            }
            let status = student_status(rec.get("status").and_then(|v| v.as_str()))?;
            let notes = get_optional_str(rec, "notes")?;
            match find_student(&tx, &p.school_id, student_id)? {
                Some(s) if s.class_id == class_id => {}
                _ => return Err(HandlerErr::bad_params("student not found in this class")),
            }
            if already_marked(&tx, student_id, date, &subject_id)? {
                return Err(HandlerErr::conflict("attendance already marked for this date"));
            }
            Ok(insert_student_row(
                &tx,
                &p.school_id,
                student_id,
                &class_id,
                &subject_id,
                date,
                status,
                notes.as_deref(),
                &p.id,
            )?)
        })();
        match attempt {
            Ok(id) => {
                saved.push(id);
                touched.insert(student_id.to_string());
            }
            Err(e) => errors.push(json!({
                "index": index,
                "studentId": student_id,
                "code": e.code,
                "message": e.message,
            })),
        }
    }
    for student_id in &touched {
        recompute_month(&tx, &p.school_id, Person::Student, student_id, date)?;
    }
    tx.commit()?;
    tracing::info!(class_id = %class_id, date = %date, marked = saved.len(), failed = errors.len(), "bulk attendance");

    let records = saved
        .iter()
        .map(|id| load_student_record(ctx.conn, id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "date": date.to_string(),
        "marked": records.len(),
        "records": records,
        "errors": errors,
    }))
}

/// Stamp every student of a class that has no record for the day yet.
fn handle_all_mark(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    let status = match get_optional_str(params, "status")? {
        Some(raw) => student_status(Some(&raw))?,
        None => AttendanceStatus::Present,
    };
    let date = get_optional_date(params, "date")?.unwrap_or_else(today);

    let mut stmt = ctx
        .conn
        .prepare("SELECT id FROM students WHERE school_id = ? AND class_id = ? ORDER BY name")?;
    let students = stmt
        .query_map((&p.school_id, &class_id), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let tx = ctx.conn.unchecked_transaction()?;
    let mut marked = 0usize;
    let mut skipped = 0usize;
    for student_id in &students {
        if already_marked(&tx, student_id, date, "")? {
            skipped += 1;
            continue;
        }
        insert_student_row(&tx, &p.school_id, student_id, &class_id, "", date, status, None, &p.id)?;
        recompute_month(&tx, &p.school_id, Person::Student, student_id, date)?;
        marked += 1;
    }
    tx.commit()?;
    Ok(json!({
        "date": date.to_string(),
        "status": status.as_str(),
        "marked": marked,
        "skipped": skipped,
    }))
}

fn upsert_teacher_row(
    conn: &Connection,
    school_id: &str,
    teacher_id: &str,
    date: NaiveDate,
    status: TeacherAttendanceStatus,
    notes: Option<&str>,
    marked_by: &str,
) -> rusqlite::Result<String> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO teacher_attendance(id, school_id, teacher_id, date, status, notes, marked_by,
                                        created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(teacher_id, date, school_id) DO UPDATE SET
           status = excluded.status,
           notes = excluded.notes,
           marked_by = excluded.marked_by,
           updated_at = excluded.updated_at",
        rusqlite::params![
            new_id(),
            school_id,
            teacher_id,
            date.to_string(),
            status.as_str(),
            notes,
            marked_by,
            &now,
            &now,
        ],
    )?;
    conn.query_row(
        "SELECT id FROM teacher_attendance WHERE teacher_id = ? AND date = ? AND school_id = ?",
        (teacher_id, date.to_string(), school_id),
        |r| r.get(0),
    )
}

fn load_teacher_record(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("{} WHERE a.id = ?", TEACHER_RECORD_SELECT);
    Ok(conn.query_row(&sql, [id], teacher_record_json)?)
}

fn handle_teacher_mark(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let status = teacher_status(get_optional_str(params, "status")?.as_deref())?;
    let date = get_optional_date(params, "date")?.unwrap_or_else(today);
    let notes = get_optional_str(params, "notes")?;
    require_teacher(ctx.conn, &p.school_id, &teacher_id)?;

    let tx = ctx.conn.unchecked_transaction()?;
    let id = upsert_teacher_row(&tx, &p.school_id, &teacher_id, date, status, notes.as_deref(), &p.id)?;
    recompute_month(&tx, &p.school_id, Person::Teacher, &teacher_id, date)?;
    tx.commit()?;
    Ok(json!({ "attendance": load_teacher_record(ctx.conn, &id)? }))
}

fn handle_teacher_bulk_mark(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = get_optional_date(params, "date")?.unwrap_or_else(today);
    let Some(records) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("records must be an array"));
    };

    let tx = ctx.conn.unchecked_transaction()?;
    let mut saved: Vec<String> = Vec::new();
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (index, rec) in records.iter().enumerate() {
        let teacher_id = rec.get("teacherId").and_then(|v| v.as_str()).unwrap_or("").trim();
        let attempt = (|| -> Result<String, HandlerErr> {
            if teacher_id.is_empty() {
                return Err(HandlerErr::bad_params("missing teacherId"));
            }
            let status = teacher_status(rec.get("status").and_then(|v| v.as_str()))?;
            let notes = get_optional_str(rec, "notes")?;
            if find_teacher(&tx, &p.school_id, teacher_id)?.is_none() {
                return Err(HandlerErr::not_found("teacher not found"));
            }
            Ok(upsert_teacher_row(&tx, &p.school_id, teacher_id, date, status, notes.as_deref(), &p.id)?)
        })();
        match attempt {
            Ok(id) => {
                if !saved.contains(&id) {
                    saved.push(id);
                }
                touched.insert(teacher_id.to_string());
            }
            Err(e) => errors.push(json!({
                "index": index,
                "teacherId": teacher_id,
                "code": e.code,
                "message": e.message,
            })),
        }
    }
    for teacher_id in &touched {
        recompute_month(&tx, &p.school_id, Person::Teacher, teacher_id, date)?;
    }
    tx.commit()?;

    let records = saved
        .iter()
        .map(|id| load_teacher_record(ctx.conn, id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "date": date.to_string(),
        "marked": records.len(),
        "records": records,
        "errors": errors,
    }))
}

fn range_strings(params: &serde_json::Value) -> Result<(Option<String>, Option<String>), HandlerErr> {
    let (start, end) = get_date_range(params)?;
    Ok((start.map(|d| d.to_string()), end.map(|d| d.to_string())))
}

/// Students are pinned to themselves; staff may pass any id.
fn scoped_student(p: &Principal, params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    let requested = get_optional_str(params, "studentId")?.filter(|s| !s.is_empty());
    match (p.role, requested) {
        (Role::Student, Some(s)) if s != p.id => {
            Err(HandlerErr::forbidden("students may only view their own attendance"))
        }
        (Role::Student, _) => Ok(Some(p.id.clone())),
        (_, requested) => Ok(requested),
    }
}

/// Teachers are pinned to themselves; the school may pass any id.
fn scoped_teacher(p: &Principal, params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    let requested = get_optional_str(params, "teacherId")?.filter(|s| !s.is_empty());
    match (p.role, requested) {
        (Role::Teacher, Some(t)) if t != p.id => {
            Err(HandlerErr::forbidden("teachers may only view their own attendance"))
        }
        (Role::Teacher, _) => Ok(Some(p.id.clone())),
        (_, requested) => Ok(requested),
    }
}

fn student_rows(
    ctx: &Ctx,
    school_id: &str,
    class_id: Option<&str>,
    student_id: Option<&str>,
    range: &(Option<String>, Option<String>),
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "{} WHERE a.school_id = ?
           AND (? IS NULL OR a.class_id = ?)
           AND (? IS NULL OR a.student_id = ?)
           AND (? IS NULL OR a.date >= ?)
           AND (? IS NULL OR a.date <= ?)
         ORDER BY a.date DESC, s.name",
        STUDENT_RECORD_SELECT
    );
    let mut stmt = ctx.conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params![
                school_id, class_id, class_id, student_id, student_id, range.0, range.0, range.1,
                range.1
            ],
            student_record_json,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn teacher_rows(
    ctx: &Ctx,
    school_id: &str,
    teacher_id: Option<&str>,
    range: &(Option<String>, Option<String>),
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "{} WHERE a.school_id = ?
           AND (? IS NULL OR a.teacher_id = ?)
           AND (? IS NULL OR a.date >= ?)
           AND (? IS NULL OR a.date <= ?)
         ORDER BY a.date DESC, t.name",
        TEACHER_RECORD_SELECT
    );
    let mut stmt = ctx.conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params![school_id, teacher_id, teacher_id, range.0, range.0, range.1, range.1],
            teacher_record_json,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_student_list(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = scoped_student(p, params)?;
    let class_id = get_optional_str(params, "classId")?.filter(|s| !s.is_empty());
    if let Some(c) = &class_id {
        ensure_student_class(ctx.conn, p, c)?;
    }
    let range = range_strings(params)?;
    let records = student_rows(ctx, &p.school_id, class_id.as_deref(), student_id.as_deref(), &range)?;
    Ok(json!({ "records": records }))
}

fn handle_teacher_list(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = scoped_teacher(p, params)?;
    let range = range_strings(params)?;
    let records = teacher_rows(ctx, &p.school_id, teacher_id.as_deref(), &range)?;
    Ok(json!({ "records": records }))
}

fn summary_json(counts: &AttendanceCounts, range: &(Option<String>, Option<String>)) -> serde_json::Value {
    json!({
        "startDate": range.0,
        "endDate": range.1,
        "counts": counts,
        "percentage": counts.recorded_percentage(),
    })
}

fn handle_student_summary(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = scoped_student(p, params)?;
    if let Some(s) = &student_id {
        require_student(ctx.conn, &p.school_id, s)?;
    }
    let class_id = get_optional_str(params, "classId")?.filter(|s| !s.is_empty());
    let range = range_strings(params)?;
    let rows = student_rows(ctx, &p.school_id, class_id.as_deref(), student_id.as_deref(), &range)?;
    let counts = AttendanceCounts::tally_students(
        rows.iter()
            .filter_map(|r| r["status"].as_str().and_then(AttendanceStatus::parse)),
    );
    let mut out = summary_json(&counts, &range);
    out["studentId"] = json!(student_id);
    Ok(out)
}

fn handle_teacher_summary(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = scoped_teacher(p, params)?;
    if let Some(t) = &teacher_id {
        require_teacher(ctx.conn, &p.school_id, t)?;
    }
    let range = range_strings(params)?;
    let rows = teacher_rows(ctx, &p.school_id, teacher_id.as_deref(), &range)?;
    let counts = AttendanceCounts::tally_teachers(
        rows.iter()
            .filter_map(|r| r["status"].as_str().and_then(TeacherAttendanceStatus::parse)),
    );
    let mut out = summary_json(&counts, &range);
    out["teacherId"] = json!(teacher_id);
    Ok(out)
}

fn handle_class_summary(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    let range = range_strings(params)?;

    let mut stmt = ctx
        .conn
        .prepare("SELECT id, name FROM students WHERE school_id = ? AND class_id = ? ORDER BY name")?;
    let students = stmt
        .query_map((&p.school_id, &class_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let rows = student_rows(ctx, &p.school_id, Some(&class_id), None, &range)?;

    let mut class_counts = AttendanceCounts::default();
    let mut per_student = Vec::with_capacity(students.len());
    for (id, name) in &students {
        let counts = AttendanceCounts::tally_students(
            rows.iter()
                .filter(|r| r["studentId"] == id.as_str())
                .filter_map(|r| r["status"].as_str().and_then(AttendanceStatus::parse)),
        );
        class_counts.total += counts.total;
        class_counts.present += counts.present;
        class_counts.absent += counts.absent;
        class_counts.late += counts.late;
        class_counts.excused += counts.excused;
        per_student.push(json!({
            "studentId": id,
            "studentName": name,
            "counts": counts,
            "percentage": counts.recorded_percentage(),
        }));
    }
    let mut out = summary_json(&class_counts, &range);
    out["classId"] = json!(class_id);
    out["students"] = json!(per_student);
    Ok(out)
}

fn handle_summaries_list(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId")?.filter(|s| !s.is_empty());
    let teacher_id = get_optional_str(params, "teacherId")?.filter(|s| !s.is_empty());
    let (kind, person): (Option<&str>, Option<String>) = match p.role {
        Role::Student => {
            if student_id.as_ref().is_some_and(|s| *s != p.id) || teacher_id.is_some() {
                return Err(HandlerErr::forbidden("students may only view their own summaries"));
            }
            (Some("student"), Some(p.id.clone()))
        }
        Role::Teacher => match (student_id, teacher_id) {
            (Some(s), _) => (Some("student"), Some(s)),
            (None, Some(t)) if t != p.id => {
                return Err(HandlerErr::forbidden("teachers may only view their own summaries"))
            }
            (None, _) => (Some("teacher"), Some(p.id.clone())),
        },
        Role::School => match (student_id, teacher_id) {
            (Some(s), _) => (Some("student"), Some(s)),
            (None, Some(t)) => (Some("teacher"), Some(t)),
            (None, None) => (None, None),
        },
    };

    let mut stmt = ctx.conn.prepare(
        "SELECT person_kind, person_id, period_type, start_date, end_date, total_days, present_days,
                absent_days, late_days, excused_days, on_leave_days, percentage, updated_at
         FROM attendance_summaries
         WHERE school_id = ?
           AND (? IS NULL OR person_kind = ?)
           AND (? IS NULL OR person_id = ?)
         ORDER BY start_date DESC, person_id",
    )?;
    let summaries = stmt
        .query_map(
            rusqlite::params![&p.school_id, kind, kind, &person, &person],
            |r| {
                Ok(json!({
                    "personKind": r.get::<_, String>(0)?,
                    "personId": r.get::<_, String>(1)?,
                    "periodType": r.get::<_, String>(2)?,
                    "startDate": r.get::<_, String>(3)?,
                    "endDate": r.get::<_, String>(4)?,
                    "totalDays": r.get::<_, i64>(5)?,
                    "presentDays": r.get::<_, i64>(6)?,
                    "absentDays": r.get::<_, i64>(7)?,
                    "lateDays": r.get::<_, i64>(8)?,
                    "excusedDays": r.get::<_, i64>(9)?,
                    "onLeaveDays": r.get::<_, i64>(10)?,
                    "attendancePercentage": r.get::<_, i64>(11)?,
                    "updatedAt": r.get::<_, String>(12)?,
                }))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "summaries": summaries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const SCHOOL: &[Role] = &[Role::School];
    const STAFF: &[Role] = &[Role::School, Role::Teacher];
    match req.method.as_str() {
        "attendance.student.mark" => Some(authed(state, req, STAFF, handle_student_mark)),
        "attendance.student.bulkMark" => Some(authed(state, req, STAFF, handle_student_bulk_mark)),
        "attendance.all.mark" => Some(authed(state, req, STAFF, handle_all_mark)),
        "attendance.teacher.mark" => Some(authed(state, req, SCHOOL, handle_teacher_mark)),
        "attendance.teacher.bulkMark" => Some(authed(state, req, SCHOOL, handle_teacher_bulk_mark)),
        "attendance.student.list" => Some(authed(state, req, &Role::ALL, handle_student_list)),
        "attendance.teacher.list" => Some(authed(state, req, STAFF, handle_teacher_list)),
        "attendance.student.summary" => Some(authed(state, req, &Role::ALL, handle_student_summary)),
        "attendance.teacher.summary" => Some(authed(state, req, STAFF, handle_teacher_summary)),
        "attendance.class.summary" => Some(authed(state, req, STAFF, handle_class_summary)),
        "attendance.summaries.list" => Some(authed(state, req, &Role::ALL, handle_summaries_list)),
        _ => None,
    }
}
