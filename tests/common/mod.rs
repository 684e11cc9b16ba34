#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const PASSWORD: &str = "correct-horse-1";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        Self::spawn_with_env(&[])
    }

    pub fn spawn_with_env(env: &[(&str, &str)]) -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut cmd = Command::new(exe);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env_remove("SCHOOLD_WORKSPACE")
            .env_remove("SCHOOLD_DEV")
            .env("SCHOOLD_JWT_SECRET_SCHOOL", "test-school-secret")
            .env("SCHOOLD_JWT_SECRET_TEACHER", "test-teacher-secret")
            .env("SCHOOLD_JWT_SECRET_STUDENT", "test-student-secret");
        for (k, v) in env {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn().expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Spawn and select a fresh workspace.
    pub fn with_workspace(prefix: &str) -> (Self, PathBuf) {
        Self::with_workspace_env(prefix, &[])
    }

    pub fn with_workspace_env(prefix: &str, env: &[(&str, &str)]) -> (Self, PathBuf) {
        let workspace = temp_dir(prefix);
        let mut sc = Self::spawn_with_env(env);
        sc.ok(
            "workspace.select",
            None,
            json!({ "path": workspace.to_string_lossy() }),
        );
        (sc, workspace)
    }

    pub fn send_raw(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn call(&mut self, method: &str, token: Option<&str>, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut payload = json!({ "id": id, "method": method, "params": params });
        if let Some(t) = token {
            payload["token"] = json!(t);
        }
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    /// Call and return `data`, panicking on an error envelope.
    pub fn ok(&mut self, method: &str, token: Option<&str>, params: serde_json::Value) -> serde_json::Value {
        let v = self.call(method, token, params);
        assert_eq!(v["success"], true, "{} failed: {}", method, v);
        v["data"].clone()
    }

    /// Call and return the `error` object, panicking on success.
    pub fn fail(&mut self, method: &str, token: Option<&str>, params: serde_json::Value) -> serde_json::Value {
        let v = self.call(method, token, params);
        assert_eq!(v["success"], false, "{} unexpectedly succeeded: {}", method, v);
        let mut e = v["error"].clone();
        e["message"] = v["message"].clone();
        e
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct School {
    pub id: String,
    pub token: String,
    pub email: String,
}

pub fn register_school(sc: &mut Sidecar, tag: &str) -> School {
    let email = format!("{}@school.test", tag);
    let data = sc.ok(
        "auth.school.register",
        None,
        json!({
            "schoolName": format!("{} Academy", tag),
            "ownerName": "Pat Owner",
            "email": email,
            "password": PASSWORD,
        }),
    );
    let id = data["school"]["id"].as_str().expect("school id").to_string();
    let login = sc.ok(
        "auth.school.login",
        None,
        json!({ "email": email, "password": PASSWORD }),
    );
    School {
        id,
        token: login["token"].as_str().expect("token").to_string(),
        email,
    }
}

pub fn create_class(sc: &mut Sidecar, school: &School, text: &str, num: i64) -> String {
    let data = sc.ok(
        "classes.create",
        Some(&school.token),
        json!({ "classText": text, "classNum": num }),
    );
    data["class"]["id"].as_str().expect("class id").to_string()
}

pub fn create_subject(sc: &mut Sidecar, school: &School, name: &str, code: &str) -> String {
    let data = sc.ok(
        "subjects.create",
        Some(&school.token),
        json!({ "subjectName": name, "subjectCodename": code }),
    );
    data["subject"]["id"].as_str().expect("subject id").to_string()
}

pub struct Account {
    pub id: String,
    pub token: String,
    pub email: String,
}

pub fn register_teacher(sc: &mut Sidecar, school: &School, name: &str, extra: serde_json::Value) -> Account {
    let email = format!("{}@staff.test", name.to_ascii_lowercase().replace(' ', "."));
    let mut params = json!({ "name": name, "email": email, "password": PASSWORD });
    if let Some(obj) = extra.as_object() {
        for (k, v) in obj {
            params[k] = v.clone();
        }
    }
    let data = sc.ok("teachers.register", Some(&school.token), params);
    let id = data["teacher"]["id"].as_str().expect("teacher id").to_string();
    let login = sc.ok(
        "auth.teacher.login",
        None,
        json!({ "email": email, "password": PASSWORD }),
    );
    Account {
        id,
        token: login["token"].as_str().expect("token").to_string(),
        email,
    }
}

pub fn register_student(sc: &mut Sidecar, school: &School, name: &str, class_id: &str) -> Account {
    let email = format!("{}@pupil.test", name.to_ascii_lowercase().replace(' ', "."));
    let data = sc.ok(
        "students.register",
        Some(&school.token),
        json!({ "name": name, "email": email, "password": PASSWORD, "classId": class_id }),
    );
    let id = data["student"]["id"].as_str().expect("student id").to_string();
    let login = sc.ok(
        "auth.student.login",
        None,
        json!({ "email": email, "password": PASSWORD }),
    );
    Account {
        id,
        token: login["token"].as_str().expect("token").to_string(),
        email,
    }
}

/// Token from the newest outbox mail to `to` whose subject contains `subject`.
pub fn mailed_token(sc: &mut Sidecar, school: &School, to: &str, subject: &str) -> String {
    let data = sc.ok("mail.outbox", Some(&school.token), json!({ "to": to }));
    let mail = data["mails"]
        .as_array()
        .expect("mails")
        .iter()
        .find(|m| m["subject"].as_str().unwrap_or("").contains(subject))
        .unwrap_or_else(|| panic!("no '{}' mail for {}", subject, to))
        .clone();
    mail["body"]
        .as_str()
        .expect("body")
        .lines()
        .find_map(|l| l.trim().strip_prefix("token:"))
        .map(|t| t.trim().to_string())
        .expect("token line")
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, bytes).expect("write fixture");
    p
}
