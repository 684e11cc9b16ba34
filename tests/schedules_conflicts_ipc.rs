mod common;

use common::{create_class, create_subject, register_school, register_student, register_teacher, Sidecar};
use serde_json::json;

fn slot(teacher: &str, subject: &str, class: &str, start: &str, end: &str) -> serde_json::Value {
    json!({
        "teacherId": teacher,
        "subjectId": subject,
        "classId": class,
        "startTime": start,
        "endTime": end,
    })
}

#[test]
fn overlaps_are_rejected_on_class_and_teacher() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-schedules");
    let school = register_school(&mut sc, "timetable");
    let t = Some(school.token.as_str());
    let class_a = create_class(&mut sc, &school, "6A", 6);
    let class_b = create_class(&mut sc, &school, "6B", 6);
    let maths = create_subject(&mut sc, &school, "Mathematics", "MATH");
    let teacher_1 = register_teacher(&mut sc, &school, "Ada Lovelace", json!({})).id;
    let teacher_2 = register_teacher(&mut sc, &school, "Alan Turing", json!({})).id;

    let first = sc.ok(
        "schedules.create",
        t,
        slot(&teacher_1, &maths, &class_a, "2026-03-02T09:00:00Z", "2026-03-02T10:00:00Z"),
    );
    assert_eq!(first["schedule"]["class"]["classText"], "6A");
    assert_eq!(first["schedule"]["startTime"], "2026-03-02T09:00:00Z");

    // Same class, other teacher.
    let e = sc.fail(
        "schedules.create",
        t,
        slot(&teacher_2, &maths, &class_a, "2026-03-02T09:30:00Z", "2026-03-02T10:30:00Z"),
    );
    assert_eq!(e["code"], "conflict");
    assert_eq!(e["details"]["dimension"], "class");
    assert_eq!(e["details"]["teacher"], "Ada Lovelace");

    // Same teacher, other class.
    let e = sc.fail(
        "schedules.create",
        t,
        slot(&teacher_1, &maths, &class_b, "2026-03-02T09:59:00Z", "2026-03-02T11:00:00Z"),
    );
    assert_eq!(e["code"], "conflict");
    assert_eq!(e["details"]["dimension"], "teacher");

    // Back-to-back is fine.
    sc.ok(
        "schedules.create",
        t,
        slot(&teacher_1, &maths, &class_a, "2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"),
    );

    let e = sc.fail(
        "schedules.create",
        t,
        slot(&teacher_2, &maths, &class_b, "2026-03-02T12:00:00Z", "2026-03-02T12:00:00Z"),
    );
    assert_eq!(e["code"], "bad_params");
    assert_eq!(e["details"]["reason"], "invalid_interval");

    let check = sc.ok(
        "schedules.checkConflicts",
        t,
        json!({
            "teacherId": teacher_1,
            "classId": class_b,
            "startTime": "2026-03-02T09:15:00Z",
            "endTime": "2026-03-02T09:45:00Z",
        }),
    );
    assert_eq!(check["hasConflict"], true);
    assert_eq!(check["teacherConflicts"].as_array().unwrap().len(), 1);
    assert_eq!(check["classConflicts"].as_array().unwrap().len(), 0);

    let listed = sc.ok("schedules.fetchWithClass", t, json!({ "classId": class_a }));
    assert_eq!(listed["schedules"].as_array().unwrap().len(), 2);
}

#[test]
fn updates_ignore_their_own_slot_and_students_see_only_their_class() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-schedules-update");
    let school = register_school(&mut sc, "timetable2");
    let t = Some(school.token.as_str());
    let class_a = create_class(&mut sc, &school, "4A", 4);
    let class_b = create_class(&mut sc, &school, "4B", 4);
    let art = create_subject(&mut sc, &school, "Art", "ART");
    let teacher = register_teacher(&mut sc, &school, "Frida Kahlo", json!({}));

    let created = sc.ok(
        "schedules.create",
        t,
        slot(&teacher.id, &art, &class_a, "2026-04-01T08:00:00Z", "2026-04-01T09:00:00Z"),
    );
    let id = created["schedule"]["id"].as_str().unwrap().to_string();
    let moved = sc.ok(
        "schedules.update",
        t,
        json!({ "id": id, "startTime": "2026-04-01T08:30:00Z", "endTime": "2026-04-01T09:30:00Z" }),
    );
    assert_eq!(moved["schedule"]["endTime"], "2026-04-01T09:30:00Z");

    let mine = sc.ok("schedules.forTeacher", Some(&teacher.token), json!({}));
    assert_eq!(mine["schedules"].as_array().unwrap().len(), 1);

    let student = register_student(&mut sc, &school, "Kid Painter", &class_b);
    let e = sc.fail(
        "schedules.fetchWithClass",
        Some(&student.token),
        json!({ "classId": class_a }),
    );
    assert_eq!(e["code"], "forbidden");
    let own = sc.ok(
        "schedules.fetchWithClass",
        Some(&student.token),
        json!({ "classId": class_b }),
    );
    assert_eq!(own["schedules"].as_array().unwrap().len(), 0);

    sc.ok("schedules.delete", t, json!({ "id": id }));
    let after = sc.ok("schedules.fetchWithClass", t, json!({ "classId": class_a }));
    assert_eq!(after["schedules"].as_array().unwrap().len(), 0);
}

#[test]
fn teachers_write_slots_in_whole_seconds() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-schedules-teacher");
    let school = register_school(&mut sc, "timetable3");
    let class_id = create_class(&mut sc, &school, "7C", 7);
    let physics = create_subject(&mut sc, &school, "Physics", "PHY");
    let teacher = register_teacher(&mut sc, &school, "Richard Feynman", json!({}));
    let student = register_student(&mut sc, &school, "Sam Sparks", &class_id);
    let tt = Some(teacher.token.as_str());

    let created = sc.ok(
        "schedules.create",
        tt,
        slot(&teacher.id, &physics, &class_id, "2026-05-04T10:00:00Z", "2026-05-04T11:00:00Z"),
    );
    let id = created["schedule"]["id"].as_str().unwrap().to_string();

    let e = sc.fail(
        "schedules.create",
        tt,
        slot(&teacher.id, &physics, &class_id, "2026-05-04T11:00:00.200Z", "2026-05-04T12:00:00Z"),
    );
    assert_eq!(e["code"], "bad_params");
    let e = sc.fail(
        "schedules.create",
        tt,
        slot(&teacher.id, &physics, &class_id, "2026-05-04T13:00:00.200Z", "2026-05-04T13:00:00.700Z"),
    );
    assert_eq!(e["code"], "bad_params");
    let e = sc.fail(
        "schedules.update",
        tt,
        json!({ "id": id, "endTime": "2026-05-04T11:00:00.800Z" }),
    );
    assert_eq!(e["code"], "bad_params");

    let e = sc.fail(
        "schedules.create",
        Some(&student.token),
        slot(&teacher.id, &physics, &class_id, "2026-05-04T14:00:00Z", "2026-05-04T15:00:00Z"),
    );
    assert_eq!(e["code"], "forbidden");

    sc.ok("schedules.delete", tt, json!({ "id": id }));
    let left = sc.ok("schedules.forTeacher", tt, json!({}));
    assert_eq!(left["schedules"].as_array().unwrap().len(), 0);
}
