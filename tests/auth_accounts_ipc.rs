mod common;

use common::{mailed_token, register_school, Sidecar, PASSWORD};
use serde_json::json;

#[test]
fn school_registration_login_and_verification() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-auth-school");
    let school = register_school(&mut sc, "Northside");

    let e = sc.fail(
        "auth.school.register",
        None,
        json!({ "schoolName": "Copy", "ownerName": "X", "email": "NORTHSIDE@school.test", "password": PASSWORD }),
    );
    assert_eq!(e["code"], "conflict");
    assert_eq!(e["status"], 409);

    let e = sc.fail(
        "auth.school.register",
        None,
        json!({ "schoolName": "Short", "ownerName": "X", "email": "short@school.test", "password": "abc" }),
    );
    assert_eq!(e["code"], "bad_params");

    let e = sc.fail(
        "auth.school.login",
        None,
        json!({ "email": school.email, "password": "wrong-password" }),
    );
    assert_eq!(e["code"], "invalid_credentials");
    let e = sc.fail(
        "auth.school.login",
        None,
        json!({ "email": "nobody@school.test", "password": PASSWORD }),
    );
    assert_eq!(e["code"], "invalid_credentials");

    let profile = sc.ok("schools.profile", Some(&school.token), json!({}));
    assert_eq!(profile["school"]["verified"], false);

    let token = mailed_token(&mut sc, &school, &school.email, "Verify");
    sc.ok("auth.verifyEmail", None, json!({ "role": "SCHOOL", "token": token }));
    let profile = sc.ok("schools.profile", Some(&school.token), json!({}));
    assert_eq!(profile["school"]["verified"], true);

    // Tokens are single use.
    let e = sc.fail("auth.verifyEmail", None, json!({ "role": "SCHOOL", "token": token }));
    assert_eq!(e["code"], "bad_params");
}

#[test]
fn password_reset_replaces_the_password() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-auth-reset");
    let school = register_school(&mut sc, "resetters");
    let class_id = common::create_class(&mut sc, &school, "5B", 5);
    let student = common::register_student(&mut sc, &school, "Robin Reset", &class_id);

    let queued = sc.ok(
        "auth.requestPasswordReset",
        None,
        json!({ "role": "STUDENT", "email": student.email }),
    );
    assert_eq!(queued["queued"], true);
    // Unknown addresses look the same from outside.
    let queued = sc.ok(
        "auth.requestPasswordReset",
        None,
        json!({ "role": "STUDENT", "email": "ghost@pupil.test" }),
    );
    assert_eq!(queued["queued"], true);

    let token = mailed_token(&mut sc, &school, &student.email, "reset");
    let e = sc.fail(
        "auth.resetPassword",
        None,
        json!({ "role": "TEACHER", "token": token, "password": "brand-new-pass" }),
    );
    assert_eq!(e["code"], "bad_params");
    sc.ok(
        "auth.resetPassword",
        None,
        json!({ "role": "STUDENT", "token": token, "password": "brand-new-pass" }),
    );

    let e = sc.fail(
        "auth.student.login",
        None,
        json!({ "email": student.email, "password": PASSWORD }),
    );
    assert_eq!(e["code"], "invalid_credentials");
    let login = sc.ok(
        "auth.student.login",
        None,
        json!({ "email": student.email, "password": "brand-new-pass" }),
    );
    assert_eq!(login["role"], "STUDENT");
    assert_eq!(login["profile"]["id"], student.id.as_str());
}

#[test]
fn tenants_are_isolated() {
    let (mut sc, _ws) = Sidecar::with_workspace("schoold-auth-tenants");
    let a = register_school(&mut sc, "alpha");
    let b = register_school(&mut sc, "beta");
    let class_a = common::create_class(&mut sc, &a, "1A", 1);

    let listed = sc.ok("classes.list", Some(&b.token), json!({}));
    assert_eq!(listed["classes"].as_array().unwrap().len(), 0);

    let e = sc.fail(
        "students.register",
        Some(&b.token),
        json!({ "name": "Cross Over", "email": "x@pupil.test", "password": PASSWORD, "classId": class_a }),
    );
    assert_eq!(e["code"], "not_found");
}
