//! Examinations, per-subject results, class analytics and the PDF export.

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::calc::{self, ResultRow};
use crate::domain::ExamType;
use crate::ipc::helpers::{
    authed, ensure_student_class, get_optional_date, get_optional_f64, get_optional_str,
    get_required_date, get_required_f64, get_required_str, insert_err, new_id, now_rfc3339,
    require_class, require_student, require_subject, HandlerErr,
};
use crate::ipc::types::{AppState, Ctx, Request};
use crate::pdf;
use crate::storage;

#[derive(Debug, Clone)]
struct Exam {
    id: String,
    class_id: String,
    class_text: String,
    subject_id: String,
    subject_name: String,
    exam_date: String,
    exam_type: String,
    created_at: String,
}

impl Exam {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "classId": self.class_id,
            "className": self.class_text,
            "subjectId": self.subject_id,
            "subjectName": self.subject_name,
            "examDate": self.exam_date,
            "examType": self.exam_type,
            "createdAt": self.created_at,
        })
    }
}

const EXAM_SELECT: &str = "SELECT e.id, e.class_id, c.class_text, e.subject_id, s.subject_name,
        e.exam_date, e.exam_type, e.created_at
     FROM examinations e
     JOIN classes c ON c.id = e.class_id
     JOIN subjects s ON s.id = e.subject_id";

fn exam_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Exam> {
    Ok(Exam {
        id: r.get(0)?,
        class_id: r.get(1)?,
        class_text: r.get(2)?,
        subject_id: r.get(3)?,
        subject_name: r.get(4)?,
        exam_date: r.get(5)?,
        exam_type: r.get(6)?,
        created_at: r.get(7)?,
    })
}

fn load_exam(conn: &Connection, school_id: &str, id: &str) -> Result<Exam, HandlerErr> {
    let sql = format!("{} WHERE e.id = ? AND e.school_id = ?", EXAM_SELECT);
    conn.query_row(&sql, (id, school_id), exam_row)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("examination not found"))
}

fn get_exam_type(params: &serde_json::Value) -> Result<Option<ExamType>, HandlerErr> {
    match get_optional_str(params, "examType")? {
        None => Ok(None),
        Some(raw) => ExamType::parse(&raw).map(Some).ok_or_else(|| {
            HandlerErr::bad_params(format!("examType must be one of: {}", ExamType::choices()))
        }),
    }
}

fn handle_exam_create(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let exam_date = get_required_date(params, "examDate")?;
    let exam_type = get_exam_type(params)?.ok_or_else(|| HandlerErr::bad_params("missing examType"))?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    require_subject(ctx.conn, &p.school_id, &subject_id)?;

    let id = new_id();
    ctx.conn.execute(
        "INSERT INTO examinations(id, school_id, class_id, subject_id, exam_date, exam_type, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &p.school_id,
            &class_id,
            &subject_id,
            exam_date.to_string(),
            exam_type.as_str(),
            now_rfc3339(),
        ],
    )?;
    Ok(json!({ "examination": load_exam(ctx.conn, &p.school_id, &id)?.to_json() }))
}

fn handle_exam_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let exam = load_exam(ctx.conn, &p.school_id, &id)?;
    let class_id = get_optional_str(params, "classId")?.filter(|s| !s.is_empty());
    let subject_id = get_optional_str(params, "subjectId")?.filter(|s| !s.is_empty());
    if let Some(c) = &class_id {
        require_class(ctx.conn, &p.school_id, c)?;
    }
    if let Some(s) = &subject_id {
        require_subject(ctx.conn, &p.school_id, s)?;
    }
    let moves = class_id.as_ref().is_some_and(|c| *c != exam.class_id)
        || subject_id.as_ref().is_some_and(|s| *s != exam.subject_id);
    if moves {
        let results: i64 = ctx.conn.query_row(
            "SELECT COUNT(*) FROM results WHERE examination_id = ?",
            [&id],
            |r| r.get(0),
        )?;
        if results > 0 {
            return Err(HandlerErr::conflict(
                "cannot change class or subject of an examination with results",
            ));
        }
    }
    let exam_date = get_optional_date(params, "examDate")?.map(|d| d.to_string());
    let exam_type = get_exam_type(params)?.map(|t| t.as_str());
    ctx.conn.execute(
        "UPDATE examinations SET
           class_id = COALESCE(?, class_id),
           subject_id = COALESCE(?, subject_id),
           exam_date = COALESCE(?, exam_date),
           exam_type = COALESCE(?, exam_type)
         WHERE id = ?",
        (&class_id, &subject_id, &exam_date, &exam_type, &id),
    )?;
    Ok(json!({ "examination": load_exam(ctx.conn, &p.school_id, &id)?.to_json() }))
}

fn handle_exam_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    load_exam(ctx.conn, &p.school_id, &id)?;
    let results: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM results WHERE examination_id = ?",
        [&id],
        |r| r.get(0),
    )?;
    if results > 0 {
        return Err(HandlerErr::conflict("examination has results")
            .with_details(json!({ "results": results })));
    }
    ctx.conn.execute("DELETE FROM examinations WHERE id = ?", [&id])?;
    Ok(json!({ "deleted": true }))
}

fn handle_exam_list_by_class(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(ctx.conn, &p.school_id, &class_id)?;
    ensure_student_class(ctx.conn, p, &class_id)?;
    let sql = format!(
        "{} WHERE e.school_id = ? AND e.class_id = ? ORDER BY e.exam_date DESC, s.subject_name",
        EXAM_SELECT
    );
    let mut stmt = ctx.conn.prepare(&sql)?;
    let exams = stmt
        .query_map((&p.school_id, &class_id), exam_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let exams: Vec<serde_json::Value> = exams.iter().map(Exam::to_json).collect();
    Ok(json!({ "examinations": exams }))
}

fn handle_exam_get(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let exam = load_exam(ctx.conn, &p.school_id, &id)?;
    ensure_student_class(ctx.conn, p, &exam.class_id)?;
    Ok(json!({ "examination": exam.to_json() }))
}

/// Validated marks for one student on one examination.
struct Marks {
    marks: f64,
    max_marks: f64,
}

fn check_marks(marks: f64, max_marks: f64) -> Result<Marks, HandlerErr> {
    if max_marks < 1.0 {
        return Err(HandlerErr::bad_params("maxMarks must be at least 1"));
    }
    if marks < 0.0 || marks > max_marks {
        return Err(HandlerErr::bad_params("marks must be between 0 and maxMarks"));
    }
    Ok(Marks { marks, max_marks })
}

fn check_student_in_exam_class(ctx: &Ctx, school_id: &str, exam: &Exam, student_id: &str) -> Result<(), HandlerErr> {
    let student = require_student(ctx.conn, school_id, student_id)?;
    if student.class_id != exam.class_id {
        return Err(HandlerErr::bad_params("student is not in the examination's class"));
    }
    Ok(())
}

fn insert_result(
    conn: &Connection,
    p: &Principal,
    exam: &Exam,
    student_id: &str,
    m: &Marks,
    remarks: Option<&str>,
) -> Result<String, HandlerErr> {
    let id = new_id();
    let now = now_rfc3339();
    let published_by = (p.role == Role::Teacher).then_some(p.id.as_str());
    conn.execute(
        "INSERT INTO results(id, school_id, examination_id, student_id, subject_id, marks, max_marks,
                             percentage, remarks, published_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &p.school_id,
            &exam.id,
            student_id,
            &exam.subject_id,
            m.marks,
            m.max_marks,
            calc::result_percentage(m.marks, m.max_marks),
            remarks,
            published_by,
            &now,
            &now,
        ],
    )
    .map_err(|e| insert_err(e, "results", "result already recorded for this student and subject"))?;
    Ok(id)
}

const RESULT_SELECT: &str = "SELECT r.id, r.examination_id, r.student_id, st.name, r.subject_id, sub.subject_name,
        r.marks, r.max_marks, r.percentage, r.remarks, r.published_by, t.name, r.created_at, r.updated_at,
        e.exam_type, e.exam_date
     FROM results r
     JOIN students st ON st.id = r.student_id
     JOIN subjects sub ON sub.id = r.subject_id
     JOIN examinations e ON e.id = r.examination_id
     LEFT JOIN teachers t ON t.id = r.published_by";

fn result_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "examinationId": r.get::<_, String>(1)?,
        "studentId": r.get::<_, String>(2)?,
        "studentName": r.get::<_, String>(3)?,
        "subjectId": r.get::<_, String>(4)?,
        "subjectName": r.get::<_, String>(5)?,
        "marks": r.get::<_, f64>(6)?,
        "maxMarks": r.get::<_, f64>(7)?,
        "percentage": r.get::<_, f64>(8)?,
        "remarks": r.get::<_, Option<String>>(9)?,
        "publishedBy": r.get::<_, Option<String>>(10)?,
        "publishedByName": r.get::<_, Option<String>>(11)?,
        "createdAt": r.get::<_, String>(12)?,
        "updatedAt": r.get::<_, String>(13)?,
        "examType": r.get::<_, String>(14)?,
        "examDate": r.get::<_, String>(15)?,
    }))
}

fn load_result(conn: &Connection, school_id: &str, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("{} WHERE r.id = ? AND r.school_id = ?", RESULT_SELECT);
    conn.query_row(&sql, (id, school_id), result_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("result not found"))
}

fn handle_result_create(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examinationId")?;
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let marks = check_marks(
        get_required_f64(params, "marks")?,
        get_required_f64(params, "maxMarks")?,
    )?;
    let remarks = get_optional_str(params, "remarks")?;

    let exam = load_exam(ctx.conn, &p.school_id, &exam_id)?;
    check_student_in_exam_class(ctx, &p.school_id, &exam, &student_id)?;
    if subject_id != exam.subject_id {
        return Err(HandlerErr::bad_params("subject does not match the examination"));
    }
    let id = insert_result(ctx.conn, p, &exam, &student_id, &marks, remarks.as_deref())?;
    tracing::debug!(result_id = %id, examination_id = %exam.id, "result recorded");
    Ok(json!({ "result": load_result(ctx.conn, &p.school_id, &id)? }))
}

/// Rows are validated one by one; good rows are saved and bad rows come back
/// in `errors`. With `atomic: true` any bad row discards the whole batch.
fn handle_result_create_bulk(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examinationId")?;
    let exam = load_exam(ctx.conn, &p.school_id, &exam_id)?;
    let Some(rows) = params.get("results").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("results must be an array"));
    };
    if rows.is_empty() {
        return Err(HandlerErr::bad_params("results must not be empty"));
    }
    let atomic = params.get("atomic").and_then(|v| v.as_bool()).unwrap_or(false);

    let tx = ctx.conn.unchecked_transaction()?;
    let mut created: Vec<String> = Vec::with_capacity(rows.len());
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        let student_id = row.get("studentId").and_then(|v| v.as_str()).unwrap_or("").trim();
        let attempt = (|| -> Result<String, HandlerErr> {
            if student_id.is_empty() {
                return Err(HandlerErr::bad_params("missing studentId"));
            }
            let marks = check_marks(get_required_f64(row, "marks")?, get_required_f64(row, "maxMarks")?)?;
            let remarks = get_optional_str(row, "remarks")?;
            check_student_in_exam_class(ctx, &p.school_id, &exam, student_id)?;
            insert_result(&tx, p, &exam, student_id, &marks, remarks.as_deref())
        })();
        match attempt {
            Ok(id) => created.push(id),
            Err(e) => errors.push(json!({
                "index": index,
                "studentId": student_id,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    if atomic && !errors.is_empty() {
        tx.rollback()?;
        return Err(HandlerErr::bad_params(format!(
            "{} of {} results failed validation; nothing was saved",
            errors.len(),
            rows.len()
        ))
        .with_details(json!({ "errors": errors })));
    }
    tx.commit()?;
    tracing::info!(
        examination_id = %exam.id,
        created = created.len(),
        failed = errors.len(),
        "results recorded in bulk"
    );
    let results = created
        .iter()
        .map(|id| load_result(ctx.conn, &p.school_id, id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "created": results.len(), "results": results, "errors": errors }))
}

fn handle_result_update(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let current = load_result(ctx.conn, &p.school_id, &id)?;
    let marks = get_optional_f64(params, "marks")?
        .or_else(|| current["marks"].as_f64())
        .unwrap_or(0.0);
    let max_marks = get_optional_f64(params, "maxMarks")?
        .or_else(|| current["maxMarks"].as_f64())
        .unwrap_or(0.0);
    let m = check_marks(marks, max_marks)?;
    let remarks = get_optional_str(params, "remarks")?;
    let published_by = (p.role == Role::Teacher).then_some(p.id.as_str());
    ctx.conn.execute(
        "UPDATE results SET marks = ?, max_marks = ?, percentage = ?,
                            remarks = COALESCE(?, remarks),
                            published_by = COALESCE(?, published_by),
                            updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            m.marks,
            m.max_marks,
            calc::result_percentage(m.marks, m.max_marks),
            &remarks,
            published_by,
            now_rfc3339(),
            &id
        ],
    )?;
    Ok(json!({ "result": load_result(ctx.conn, &p.school_id, &id)? }))
}

fn handle_result_delete(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let n = ctx.conn.execute(
        "DELETE FROM results WHERE id = ? AND school_id = ?",
        (&id, &p.school_id),
    )?;
    if n == 0 {
        return Err(HandlerErr::not_found("result not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn results_for_exam(conn: &Connection, exam_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "{} WHERE r.examination_id = ? ORDER BY st.name, sub.subject_name",
        RESULT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([exam_id], result_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_result_list_by_exam(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examinationId")?;
    let exam = load_exam(ctx.conn, &p.school_id, &exam_id)?;
    let mut results = results_for_exam(ctx.conn, &exam.id)?;
    if p.role == Role::Student {
        results.retain(|r| r["studentId"] == p.id.as_str());
    }
    Ok(json!({ "examination": exam.to_json(), "results": results }))
}

fn handle_result_list_by_student(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let requested = get_optional_str(params, "studentId")?.filter(|s| !s.is_empty());
    let student_id = match (p.role, requested) {
        (Role::Student, Some(s)) if s != p.id => {
            return Err(HandlerErr::forbidden("students may only view their own results"))
        }
        (_, Some(s)) => s,
        (Role::Student, None) => p.id.clone(),
        (_, None) => return Err(HandlerErr::bad_params("missing studentId")),
    };
    require_student(ctx.conn, &p.school_id, &student_id)?;
    let sql = format!(
        "{} WHERE r.student_id = ? AND r.school_id = ? ORDER BY e.exam_date DESC, sub.subject_name",
        RESULT_SELECT
    );
    let mut stmt = ctx.conn.prepare(&sql)?;
    let results = stmt
        .query_map((&student_id, &p.school_id), result_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "studentId": student_id, "results": results }))
}

fn result_rows(conn: &Connection, exam_id: &str) -> Result<Vec<ResultRow>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT r.student_id, st.name, r.marks, r.max_marks, r.percentage
         FROM results r JOIN students st ON st.id = r.student_id
         WHERE r.examination_id = ?
         ORDER BY st.name",
    )?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(ResultRow {
                student_id: r.get(0)?,
                student_name: r.get(1)?,
                marks: r.get(2)?,
                max_marks: r.get(3)?,
                percentage: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn get_threshold(ctx: &Ctx, params: &serde_json::Value) -> Result<f64, HandlerErr> {
    let t = get_optional_f64(params, "passThreshold")?.unwrap_or(ctx.config.pass_threshold);
    if !(0.0..=100.0).contains(&t) {
        return Err(HandlerErr::bad_params("passThreshold must be between 0 and 100"));
    }
    Ok(t)
}

fn handle_exam_analytics(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examinationId")?;
    let threshold = get_threshold(ctx, params)?;
    let exam = load_exam(ctx.conn, &p.school_id, &exam_id)?;
    let standings = calc::exam_standings(&result_rows(ctx.conn, &exam.id)?, threshold);
    let totals = calc::exam_totals(&standings);
    Ok(json!({
        "examination": exam.to_json(),
        "passThreshold": threshold,
        "totals": totals,
        "students": standings,
    }))
}

fn handle_export_pdf(ctx: &Ctx, p: &Principal, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examinationId")?;
    let threshold = get_threshold(ctx, params)?;
    let exam = load_exam(ctx.conn, &p.school_id, &exam_id)?;

    let rows = result_rows(ctx.conn, &exam.id)?;
    let table_rows: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.student_name.clone(),
                format!("{}", r.marks),
                format!("{}", r.max_marks),
                format!("{:.2}%", r.percentage),
                if r.percentage >= threshold { "Pass" } else { "Fail" }.to_string(),
            ]
        })
        .collect();
    let title = format!("{} results: {}", exam.exam_type, exam.subject_name);
    let subtitle = format!("Class {} | exam date {}", exam.class_text, exam.exam_date);
    let bytes = pdf::render_table(&pdf::Table {
        title: &title,
        subtitle: Some(&subtitle),
        headers: &["Student", "Marks", "Max", "Percentage", "Status"],
        columns: &[0.0, 220.0, 290.0, 350.0, 440.0],
        rows: table_rows,
    });

    let file_name = format!(
        "results-{}-{}.pdf",
        exam.exam_type.to_ascii_lowercase().replace(' ', "-"),
        exam.id
    );
    let path = storage::write_export(ctx.workspace, &p.school_id, &file_name, &bytes)?;
    tracing::info!(examination_id = %exam.id, rows = rows.len(), "results exported");
    Ok(json!({
        "path": path,
        "bytes": bytes.len(),
        "rows": rows.len(),
        "contentType": "application/pdf",
        "fileName": file_name,
        "contentDisposition": format!("attachment; filename={}", file_name),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    const STAFF: &[Role] = &[Role::School, Role::Teacher];
    match req.method.as_str() {
        "examinations.create" => Some(authed(state, req, STAFF, handle_exam_create)),
        "examinations.update" => Some(authed(state, req, STAFF, handle_exam_update)),
        "examinations.delete" => Some(authed(state, req, STAFF, handle_exam_delete)),
        "examinations.listByClass" => Some(authed(state, req, &Role::ALL, handle_exam_list_by_class)),
        "examinations.get" => Some(authed(state, req, &Role::ALL, handle_exam_get)),
        "examinations.analytics" => Some(authed(state, req, STAFF, handle_exam_analytics)),
        "results.create" => Some(authed(state, req, STAFF, handle_result_create)),
        "results.createBulk" => Some(authed(state, req, STAFF, handle_result_create_bulk)),
        "results.update" => Some(authed(state, req, STAFF, handle_result_update)),
        "results.delete" => Some(authed(state, req, STAFF, handle_result_delete)),
        "results.listByExamination" => Some(authed(state, req, &Role::ALL, handle_result_list_by_exam)),
        "results.listByStudent" => Some(authed(state, req, &Role::ALL, handle_result_list_by_student)),
        "results.exportPdf" => Some(authed(state, req, STAFF, handle_export_pdf)),
        _ => None,
    }
}
