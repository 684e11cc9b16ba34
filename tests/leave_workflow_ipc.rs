mod common;

use common::{create_class, register_school, register_student, register_teacher, Sidecar};
use serde_json::json;

#[test]
fn class_teacher_decides_student_leave_once() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-leave");
    let school = register_school(&mut sc, "leave-desk");
    let st = Some(school.token.as_str());
    let class_id = create_class(&mut sc, &school, "2A", 2);
    let class_teacher = register_teacher(&mut sc, &school, "Maya Angelou", json!({}));
    let other_teacher = register_teacher(&mut sc, &school, "Toni Morrison", json!({}));
    sc.ok(
        "classes.update",
        st,
        json!({ "id": class_id, "classTeacherId": class_teacher.id }),
    );
    let student = register_student(&mut sc, &school, "Leo Leave", &class_id);

    let e = sc.fail(
        "leave.submit",
        Some(&student.token),
        json!({ "startDate": "2026-03-12", "endDate": "2026-03-10", "reason": "trip" }),
    );
    assert_eq!(e["code"], "bad_params");

    let submitted = sc.ok(
        "leave.submit",
        Some(&student.token),
        json!({ "startDate": "2026-03-10", "endDate": "2026-03-12", "reason": "flu", "leaveType": "sick" }),
    );
    let leave = &submitted["leave"];
    assert_eq!(leave["status"], "PENDING");
    assert_eq!(leave["duration"], 3);
    let leave_id = leave["id"].as_str().unwrap().to_string();

    let pending = sc.ok("leave.pending", Some(&class_teacher.token), json!({}));
    assert_eq!(pending["leaves"].as_array().unwrap().len(), 1);
    let none = sc.ok("leave.pending", Some(&other_teacher.token), json!({}));
    assert_eq!(none["leaves"].as_array().unwrap().len(), 0);

    let e = sc.fail(
        "leave.updateStatus",
        Some(&other_teacher.token),
        json!({ "id": leave_id, "status": "APPROVED" }),
    );
    assert_eq!(e["code"], "forbidden");

    let e = sc.fail(
        "leave.updateStatus",
        Some(&class_teacher.token),
        json!({ "id": leave_id, "status": "REJECTED" }),
    );
    assert_eq!(e["code"], "bad_params");

    let decided = sc.ok(
        "leave.updateStatus",
        Some(&class_teacher.token),
        json!({ "id": leave_id, "status": "APPROVED" }),
    );
    assert_eq!(decided["leave"]["status"], "APPROVED");
    assert_eq!(decided["leave"]["approver"]["id"], class_teacher.id.as_str());

    let e = sc.fail(
        "leave.updateStatus",
        st,
        json!({ "id": leave_id, "status": "REJECTED", "rejectionReason": "late" }),
    );
    assert_eq!(e["code"], "conflict");

    // Decided requests are frozen for the requester too.
    let e = sc.fail(
        "leave.update",
        Some(&student.token),
        json!({ "id": leave_id, "reason": "changed my mind" }),
    );
    assert_eq!(e["code"], "conflict");

    let calendar = sc.ok(
        "leave.calendar",
        Some(&student.token),
        json!({ "year": 2026, "month": 3 }),
    );
    assert_eq!(calendar["leaves"].as_array().unwrap().len(), 1);
}

#[test]
fn teacher_leave_goes_to_the_school_and_feeds_analytics() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-leave-analytics");
    let school = register_school(&mut sc, "leave-stats");
    let st = Some(school.token.as_str());
    let class_id = create_class(&mut sc, &school, "8A", 8);
    let teacher = register_teacher(&mut sc, &school, "Rosalind Franklin", json!({}));
    sc.ok(
        "classes.update",
        st,
        json!({ "id": class_id, "classTeacherId": teacher.id }),
    );
    let colleague = register_teacher(&mut sc, &school, "Lise Meitner", json!({}));
    let student = register_student(&mut sc, &school, "Nia Notes", &class_id);

    let t_leave = sc.ok(
        "leave.submit",
        Some(&colleague.token),
        json!({ "startDate": "2026-04-06", "endDate": "2026-04-07", "reason": "conference", "leaveType": "casual" }),
    );
    let t_leave_id = t_leave["leave"]["id"].as_str().unwrap().to_string();
    let e = sc.fail(
        "leave.updateStatus",
        Some(&teacher.token),
        json!({ "id": t_leave_id, "status": "APPROVED" }),
    );
    assert_eq!(e["code"], "forbidden");
    sc.ok(
        "leave.updateStatus",
        st,
        json!({ "id": t_leave_id, "status": "REJECTED", "rejectionReason": "exam week" }),
    );

    let s_leave = sc.ok(
        "leave.submit",
        Some(&student.token),
        json!({ "startDate": "2026-04-20", "endDate": "2026-04-20", "reason": "dentist" }),
    );
    assert_eq!(s_leave["leave"]["leaveType"], "other");
    let s_leave_id = s_leave["leave"]["id"].as_str().unwrap().to_string();
    sc.ok(
        "leave.updateStatus",
        Some(&teacher.token),
        json!({ "id": s_leave_id, "status": "APPROVED" }),
    );

    let pending = sc.ok(
        "leave.submit",
        Some(&student.token),
        json!({ "startDate": "2026-05-04", "endDate": "2026-05-05", "reason": "family" }),
    );
    let pending_id = pending["leave"]["id"].as_str().unwrap().to_string();

    let stats = sc.ok("leave.analytics", st, json!({ "year": 2026 }));
    assert_eq!(stats["summary"]["total"], 3);
    assert_eq!(stats["summary"]["approved"], 1);
    assert_eq!(stats["summary"]["rejected"], 1);
    assert_eq!(stats["summary"]["pending"], 1);
    assert_eq!(stats["byRequesterType"]["student"], 2);
    assert_eq!(stats["byRequesterType"]["teacher"], 1);
    assert_eq!(stats["monthlyTrend"].as_array().unwrap().len(), 12);
    assert_eq!(stats["recent"].as_array().unwrap().len(), 3);

    // Rejected leave stays off the calendar.
    let april = sc.ok("leave.calendar", st, json!({ "year": 2026, "month": 4 }));
    assert_eq!(april["leaves"].as_array().unwrap().len(), 1);

    sc.ok("leave.delete", Some(&student.token), json!({ "id": pending_id }));
    let mine = sc.ok("leave.my", Some(&student.token), json!({}));
    assert_eq!(mine["leaves"].as_array().unwrap().len(), 1);
}
