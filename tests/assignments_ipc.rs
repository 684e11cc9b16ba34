mod common;

use common::{create_class, create_subject, register_school, register_student, register_teacher, write_file, Sidecar};
use serde_json::json;
use std::time::{Duration, Instant};

#[test]
fn late_submissions_follow_the_assignment_policy() {
    let (mut sc, ws) = Sidecar::with_workspace("schoold-assignments-late");
    let school = register_school(&mut sc, "homework");
    let class_id = create_class(&mut sc, &school, "9A", 9);
    let subject_id = create_subject(&mut sc, &school, "History", "HIST");
    let teacher = register_teacher(&mut sc, &school, "Mary Beard", json!({}));
    let student = register_student(&mut sc, &school, "Tom Tardy", &class_id);
    let tt = Some(teacher.token.as_str());

    let strict = sc.ok(
        "assignments.create",
        tt,
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "title": "Essay on Rome",
            "description": "1000 words",
            "dueDate": "2020-01-01",
        }),
    );
    assert_eq!(strict["assignment"]["maxPoints"], 100.0);
    assert_eq!(strict["assignment"]["allowLateSubmission"], false);
    let strict_id = strict["assignment"]["id"].as_str().unwrap().to_string();

    let essay = write_file(&ws, "essay.txt", b"Rome was not built in a day.");
    let e = sc.fail(
        "assignments.submit",
        Some(&student.token),
        json!({ "assignmentId": strict_id, "filePath": essay.to_string_lossy() }),
    );
    assert_eq!(e["code"], "bad_params");
    let mine = sc.ok(
        "assignments.mySubmission",
        Some(&student.token),
        json!({ "assignmentId": strict_id }),
    );
    assert!(mine["submission"].is_null());

    let lenient = sc.ok(
        "assignments.create",
        tt,
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "title": "Timeline",
            "description": "Key dates",
            "dueDate": "2020-01-01T12:00:00Z",
            "allowLateSubmission": true,
        }),
    );
    let lenient_id = lenient["assignment"]["id"].as_str().unwrap().to_string();
    let submitted = sc.ok(
        "assignments.submit",
        Some(&student.token),
        json!({ "assignmentId": lenient_id, "filePath": essay.to_string_lossy(), "remarks": "sorry" }),
    );
    assert_eq!(submitted["submission"]["late"], true);
    let stored = submitted["submission"]["fileUrl"].as_str().unwrap().to_string();
    assert!(stored.starts_with("uploads/submissions/"));
    assert!(ws.join(&stored).is_file());
}

#[test]
fn grading_rubrics_and_extensions() {
    let (mut sc, ws) = Sidecar::with_workspace("schoold-assignments-grade");
    let school = register_school(&mut sc, "grading");
    let class_id = create_class(&mut sc, &school, "12B", 12);
    let other_class = create_class(&mut sc, &school, "12C", 12);
    let subject_id = create_subject(&mut sc, &school, "Biology", "BIO");
    let teacher = register_teacher(&mut sc, &school, "Jane Goodall", json!({}));
    let intruder = register_teacher(&mut sc, &school, "Other Teacher", json!({}));
    let student = register_student(&mut sc, &school, "Zoe Zoology", &class_id);
    let outsider = register_student(&mut sc, &school, "Xavier Xeno", &other_class);
    let tt = Some(teacher.token.as_str());

    let created = sc.ok(
        "assignments.create",
        tt,
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "title": "Cell diagram",
            "description": "Label the organelles",
            "dueDate": "2099-01-01T00:00:00Z",
            "maxPoints": 20,
            "rubric": [
                { "name": "Accuracy", "maxScore": 10 },
                { "name": "Presentation", "maxScore": 10 },
            ],
            "attachments": [write_file(&ws, "template.txt", b"cell").to_string_lossy()],
        }),
    );
    let assignment = &created["assignment"];
    assert_eq!(assignment["rubric"].as_array().unwrap().len(), 2);
    assert_eq!(assignment["attachments"].as_array().unwrap().len(), 1);
    let assignment_id = assignment["id"].as_str().unwrap().to_string();

    let e = sc.fail(
        "assignments.submit",
        Some(&outsider.token),
        json!({ "assignmentId": assignment_id, "remarks": "me too" }),
    );
    assert_eq!(e["code"], "forbidden");

    let first = sc.ok(
        "assignments.submit",
        Some(&student.token),
        json!({ "assignmentId": assignment_id, "remarks": "draft" }),
    );
    assert_eq!(first["submission"]["late"], false);
    let submission_id = first["submission"]["id"].as_str().unwrap().to_string();

    let e = sc.fail(
        "assignments.submit",
        Some(&student.token),
        json!({ "assignmentId": assignment_id, "remarks": "again" }),
    );
    assert_eq!(e["code"], "conflict");

    let e = sc.fail(
        "assignments.grade",
        Some(&intruder.token),
        json!({ "submissionId": submission_id, "grade": 10 }),
    );
    assert_eq!(e["code"], "forbidden");

    let e = sc.fail(
        "assignments.grade",
        tt,
        json!({ "submissionId": submission_id, "grade": 25 }),
    );
    assert_eq!(e["code"], "bad_params");

    let e = sc.fail(
        "assignments.grade",
        tt,
        json!({
            "submissionId": submission_id,
            "grade": 15,
            "rubricScores": [{ "name": "Accuracy", "score": 11 }],
        }),
    );
    assert_eq!(e["code"], "bad_params");

    let graded = sc.ok(
        "assignments.grade",
        tt,
        json!({
            "submissionId": submission_id,
            "grade": 15,
            "feedback": "Good labels",
            "rubricScores": [
                { "name": "accuracy", "score": 8 },
                { "name": "Presentation", "score": 7 },
            ],
            "extensionUntil": "2099-06-01T00:00:00Z",
        }),
    );
    let sub = &graded["submission"];
    assert_eq!(sub["grade"], 15.0);
    assert!(sub["gradedAt"].is_string());
    assert_eq!(sub["rubricScores"].as_array().unwrap().len(), 2);
    assert_eq!(sub["extensionUntil"], "2099-06-01T00:00:00Z");

    // The extension reopens the submission and clears the old grade.
    let resubmitted = sc.ok(
        "assignments.submit",
        Some(&student.token),
        json!({ "assignmentId": assignment_id, "remarks": "final version" }),
    );
    assert_eq!(resubmitted["submission"]["id"], submission_id.as_str());
    assert!(resubmitted["submission"]["grade"].is_null());
    assert_eq!(resubmitted["submission"]["remarks"], "final version");

    let listed = sc.ok("assignments.submissions", tt, json!({ "assignmentId": assignment_id }));
    assert_eq!(listed["submissions"].as_array().unwrap().len(), 1);
    let e = sc.fail(
        "assignments.submissions",
        Some(&intruder.token),
        json!({ "assignmentId": assignment_id }),
    );
    assert_eq!(e["code"], "forbidden");

    let deleted = sc.ok("assignments.delete", tt, json!({ "id": assignment_id }));
    assert_eq!(deleted["submissionsRemoved"], 1);
    let e = sc.fail("assignments.get", tt, json!({ "id": assignment_id }));
    assert_eq!(e["code"], "not_found");
}

#[test]
fn video_uploads_are_compressed_in_the_background() {
    // `false` exits non-zero, so every job ends up failed.
    let (mut sc, ws) = Sidecar::with_workspace_env(
        "schoold-assignments-video",
        &[("SCHOOLD_VIDEO_ENCODER", "false")],
    );
    let school = register_school(&mut sc, "video");
    let class_id = create_class(&mut sc, &school, "5A", 5);
    let subject_id = create_subject(&mut sc, &school, "Music", "MUS");
    let teacher = register_teacher(&mut sc, &school, "Clara Schumann", json!({}));

    let video = write_file(&ws, "lesson.mp4", b"not really a video");
    let created = sc.ok(
        "assignments.create",
        Some(&teacher.token),
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "title": "Listen",
            "description": "Watch the clip",
            "dueDate": "2099-01-01",
            "videoPath": video.to_string_lossy(),
        }),
    );
    let job_id = created["assignment"]["videoJobId"]
        .as_str()
        .expect("job queued")
        .to_string();

    let deadline = Instant::now() + Duration::from_secs(20);
    let job = loop {
        let data = sc.ok("media.jobStatus", Some(&teacher.token), json!({ "jobId": job_id }));
        let status = data["job"]["status"].as_str().unwrap_or("").to_string();
        if status == "done" || status == "failed" {
            break data["job"].clone();
        }
        assert!(Instant::now() < deadline, "job stuck in {}", status);
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(job["status"], "failed");
    assert!(job["error"].as_str().unwrap().contains("encoder"));
    assert_eq!(job["ownerKind"], "assignment");

    let failed = sc.ok("media.jobs", Some(&school.token), json!({ "status": "failed" }));
    assert_eq!(failed["jobs"].as_array().unwrap().len(), 1);
}

#[cfg(unix)]
#[test]
fn switching_workspace_does_not_wait_for_a_running_encoder() {
    use std::os::unix::fs::PermissionsExt;

    let bin = common::temp_dir("schoold-slow-encoder");
    let encoder = bin.join("slow-encoder.sh");
    std::fs::write(&encoder, "#!/bin/sh\nsleep 10\nexit 1\n").unwrap();
    std::fs::set_permissions(&encoder, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (mut sc, ws) = Sidecar::with_workspace_env(
        "schoold-assignments-switch",
        &[("SCHOOLD_VIDEO_ENCODER", encoder.to_str().unwrap())],
    );
    let school = register_school(&mut sc, "switch");
    let class_id = create_class(&mut sc, &school, "2B", 2);
    let subject_id = create_subject(&mut sc, &school, "Drama", "DRA");
    let teacher = register_teacher(&mut sc, &school, "Judi Dench", json!({}));
    let video = write_file(&ws, "scene.mp4", b"frames");
    let created = sc.ok(
        "assignments.create",
        Some(&teacher.token),
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "title": "Monologue",
            "description": "Film it",
            "dueDate": "2099-01-01",
            "videoPath": video.to_string_lossy(),
        }),
    );
    let job_id = created["assignment"]["videoJobId"].as_str().unwrap().to_string();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let data = sc.ok("media.jobStatus", Some(&teacher.token), json!({ "jobId": job_id }));
        if data["job"]["status"] == "running" {
            break;
        }
        assert!(Instant::now() < deadline, "job never started: {}", data);
        std::thread::sleep(Duration::from_millis(20));
    }

    let other = common::temp_dir("schoold-assignments-switch-2");
    let started = Instant::now();
    sc.ok("workspace.select", None, json!({ "path": other.to_string_lossy() }));
    assert!(started.elapsed() < Duration::from_secs(5));
    let health = sc.ok("health", None, json!({}));
    assert_eq!(health["mediaWorker"], true);
}
