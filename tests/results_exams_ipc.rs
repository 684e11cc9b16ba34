mod common;

use common::{create_class, create_subject, register_school, register_student, register_teacher, Sidecar};
use serde_json::json;

struct Fixture {
    sc: Sidecar,
    ws: std::path::PathBuf,
    school: common::School,
    class_id: String,
    subject_id: String,
    exam_id: String,
    students: Vec<common::Account>,
}

fn fixture(prefix: &str) -> Fixture {
    let (mut sc, ws) = Sidecar::with_workspace(prefix);
    let school = register_school(&mut sc, prefix);
    let class_id = create_class(&mut sc, &school, "10A", 10);
    let subject_id = create_subject(&mut sc, &school, "Chemistry", "CHEM");
    let students = ["Amy Atom", "Ben Bond", "Cy Carbon"]
        .iter()
        .map(|n| register_student(&mut sc, &school, n, &class_id))
        .collect();
    let exam = sc.ok(
        "examinations.create",
        Some(&school.token),
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "examDate": "2026-05-20",
            "examType": "first term",
        }),
    );
    assert_eq!(exam["examination"]["examType"], "First Term");
    let exam_id = exam["examination"]["id"].as_str().unwrap().to_string();
    Fixture {
        sc,
        ws,
        school,
        class_id,
        subject_id,
        exam_id,
        students,
    }
}

#[test]
fn results_compute_percentage_and_reject_duplicates() {
    let mut f = fixture("schoold-results");
    let teacher = register_teacher(&mut f.sc, &f.school, "Marie Curie", json!({}));

    let created = f.sc.ok(
        "results.create",
        Some(&teacher.token),
        json!({
            "examinationId": f.exam_id,
            "studentId": f.students[0].id,
            "subjectId": f.subject_id,
            "marks": 42,
            "maxMarks": 60,
        }),
    );
    assert_eq!(created["result"]["percentage"], 70.0);
    assert_eq!(created["result"]["publishedByName"], "Marie Curie");

    let e = f.sc.fail(
        "results.create",
        Some(&teacher.token),
        json!({
            "examinationId": f.exam_id,
            "studentId": f.students[0].id,
            "subjectId": f.subject_id,
            "marks": 50,
            "maxMarks": 60,
        }),
    );
    assert_eq!(e["code"], "conflict");

    let e = f.sc.fail(
        "results.create",
        Some(&teacher.token),
        json!({
            "examinationId": f.exam_id,
            "studentId": f.students[1].id,
            "subjectId": f.subject_id,
            "marks": 61,
            "maxMarks": 60,
        }),
    );
    assert_eq!(e["code"], "bad_params");

    let id = created["result"]["id"].as_str().unwrap().to_string();
    let updated = f.sc.ok(
        "results.update",
        Some(&f.school.token),
        json!({ "id": id, "marks": 30 }),
    );
    assert_eq!(updated["result"]["percentage"], 50.0);

    // Exams with results cannot be removed.
    let e = f.sc.fail("examinations.delete", Some(&f.school.token), json!({ "id": f.exam_id }));
    assert_eq!(e["code"], "conflict");

    let own = f.sc.ok("results.listByStudent", Some(&f.students[0].token), json!({}));
    assert_eq!(own["results"].as_array().unwrap().len(), 1);
    let e = f.sc.fail(
        "results.listByStudent",
        Some(&f.students[0].token),
        json!({ "studentId": f.students[1].id }),
    );
    assert_eq!(e["code"], "forbidden");
}

#[test]
fn bulk_results_report_row_failures_inline() {
    let mut f = fixture("schoold-results-bulk");
    let t = Some(f.school.token.clone());
    let outsider_class = create_class(&mut f.sc, &f.school, "11B", 11);
    let outsider = register_student(&mut f.sc, &f.school, "Otto Outside", &outsider_class);

    let bulk = f.sc.ok(
        "results.createBulk",
        t.as_deref(),
        json!({
            "examinationId": f.exam_id,
            "results": [
                { "studentId": f.students[0].id, "marks": 90, "maxMarks": 100 },
                { "studentId": outsider.id, "marks": 50, "maxMarks": 100 },
                { "studentId": f.students[1].id, "marks": 120, "maxMarks": 100 },
                { "studentId": f.students[2].id, "marks": 30, "maxMarks": 100 },
            ],
        }),
    );
    assert_eq!(bulk["created"], 2);
    let errors = bulk["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0]["index"], 1);
    assert_eq!(errors[1]["index"], 2);

    let e = f.sc.fail(
        "results.createBulk",
        t.as_deref(),
        json!({
            "examinationId": f.exam_id,
            "atomic": true,
            "results": [
                { "studentId": f.students[1].id, "marks": 70, "maxMarks": 100 },
                { "studentId": f.students[0].id, "marks": 70, "maxMarks": 100 },
            ],
        }),
    );
    assert_eq!(e["code"], "bad_params");
    assert_eq!(e["details"]["errors"][0]["code"], "conflict");
    let listed = f.sc.ok("results.listByExamination", t.as_deref(), json!({ "examinationId": f.exam_id }));
    assert_eq!(listed["results"].as_array().unwrap().len(), 2);

    let analytics = f.sc.ok(
        "examinations.analytics",
        t.as_deref(),
        json!({ "examinationId": f.exam_id, "passThreshold": 40 }),
    );
    assert_eq!(analytics["totals"]["studentCount"], 2);
    assert_eq!(analytics["totals"]["passCount"], 1);
    assert_eq!(analytics["totals"]["highestPercentage"], 90.0);
    assert_eq!(analytics["students"].as_array().unwrap().len(), 2);
}

#[test]
fn pdf_export_writes_a_pdf_file() {
    let mut f = fixture("schoold-results-pdf");
    let t = Some(f.school.token.clone());
    for (i, s) in f.students.iter().enumerate() {
        f.sc.ok(
            "results.create",
            t.as_deref(),
            json!({
                "examinationId": f.exam_id,
                "studentId": s.id,
                "subjectId": f.subject_id,
                "marks": 40 + 10 * i as i64,
                "maxMarks": 100,
            }),
        );
    }
    let exported = f.sc.ok(
        "results.exportPdf",
        t.as_deref(),
        json!({ "examinationId": f.exam_id, "outPath": f.ws.join("schoold.sqlite3").to_string_lossy() }),
    );
    // Output always lands under the school's export folder.
    let rel = exported["path"].as_str().unwrap().to_string();
    assert!(rel.starts_with(&format!("exports/{}/results-first-term-", f.school.id)));
    let out = f.ws.join(&rel);
    assert_eq!(exported["rows"], 3);
    assert_eq!(exported["contentType"], "application/pdf");
    assert!(exported["contentDisposition"]
        .as_str()
        .unwrap()
        .starts_with("attachment; filename=results-first-term-"));
    let bytes = std::fs::read(&out).expect("pdf written");
    assert!(bytes.starts_with(b"%PDF-"));
    assert_eq!(exported["bytes"], bytes.len());

    let listed = f.sc.ok(
        "examinations.listByClass",
        Some(&f.students[0].token),
        json!({ "classId": f.class_id }),
    );
    assert_eq!(listed["examinations"].as_array().unwrap().len(), 1);
}
