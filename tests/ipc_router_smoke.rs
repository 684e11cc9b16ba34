mod common;

use common::{register_school, Sidecar};
use serde_json::json;

#[test]
fn health_and_envelope_before_workspace() {
    let mut sc = Sidecar::spawn();

    let health = sc.ok("health", None, json!({}));
    assert!(health["workspacePath"].is_null());
    assert_eq!(health["mediaWorker"], false);

    let e = sc.fail("auth.school.login", None, json!({ "email": "a@b.co", "password": "x" }));
    assert_eq!(e["code"], "no_workspace");
    assert_eq!(e["status"], 400);

    let e = sc.fail("classes.list", None, json!({}));
    assert_eq!(e["code"], "missing_token");
    assert_eq!(e["status"], 401);

    let e = sc.fail("does.not.exist", None, json!({}));
    assert_eq!(e["code"], "not_implemented");

    let v = sc.send_raw("{not json");
    assert_eq!(v["success"], false);
    assert!(v["id"].is_null());
    assert_eq!(v["error"]["code"], "bad_json");
}

#[test]
fn tokens_are_checked_for_validity_and_role() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-router-auth");
    let school = register_school(&mut sc, "auth-guard");

    let e = sc.fail("classes.list", Some("garbage.token.value"), json!({}));
    assert_eq!(e["code"], "invalid_token");
    assert_eq!(e["status"], 401);

    let class_id = common::create_class(&mut sc, &school, "7A", 7);
    let student = common::register_student(&mut sc, &school, "Sam Pupil", &class_id);
    let e = sc.fail("classes.create", Some(&student.token), json!({ "classText": "8A", "classNum": 8 }));
    assert_eq!(e["code"], "forbidden");
    assert_eq!(e["status"], 403);
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-router-smoke");
    let school = register_school(&mut sc, "smoke");
    let t = Some(school.token.as_str());

    let methods = [
        "schools.profile",
        "mail.outbox",
        "teachers.list",
        "students.list",
        "classes.list",
        "subjects.list",
        "schedules.fetchWithClass",
        "schedules.forTeacher",
        "examinations.listByClass",
        "results.listByStudent",
        "assignments.listByClass",
        "attendance.student.list",
        "attendance.teacher.list",
        "attendance.summaries.list",
        "leave.pending",
        "leave.analytics",
        "leave.calendar",
        "notices.list",
        "media.jobs",
    ];
    for m in methods {
        let v = sc.call(m, t, json!({}));
        if v["success"] == false {
            assert_ne!(v["error"]["code"], "not_implemented", "unrouted method {}", m);
            assert_ne!(v["error"]["status"], 500, "{} failed: {}", m, v);
        }
    }
}

#[test]
fn internal_errors_hide_details_outside_dev_mode() {
    let (mut sc, ws) = Sidecar::with_workspace("schoold-router-redact");
    let school = register_school(&mut sc, "redact");
    let class_id = common::create_class(&mut sc, &school, "9C", 9);
    let subject_id = common::create_subject(&mut sc, &school, "Physics", "PHY");
    let exam = sc.ok(
        "examinations.create",
        Some(&school.token),
        json!({ "classId": class_id, "subjectId": subject_id, "examDate": "2026-06-01", "examType": "Final" }),
    );
    let exam_id = exam["examination"]["id"].as_str().unwrap().to_string();

    // A plain file where the exports folder should be makes the write fail.
    std::fs::write(ws.join("exports"), b"in the way").unwrap();
    let e = sc.fail(
        "results.exportPdf",
        Some(&school.token),
        json!({ "examinationId": exam_id }),
    );
    assert_eq!(e["code"], "io_failed");
    assert_eq!(e["status"], 500);
    assert_eq!(e["message"], "internal server error");
}
