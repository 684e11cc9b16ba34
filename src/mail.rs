//! Outgoing mail. Messages are written to `mail_outbox`; an SMTP relay
//! outside this process picks them up and stamps `sent_at`.

use rusqlite::Connection;

use crate::auth::Role;

pub struct Mail<'a> {
    pub school_id: Option<&'a str>,
    pub to: &'a str,
    pub subject: String,
    pub body: String,
}

pub fn queue(conn: &Connection, from: &str, mail: Mail<'_>) -> rusqlite::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO mail_outbox(id, school_id, recipient, sender, subject, body, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            mail.school_id,
            mail.to,
            from,
            &mail.subject,
            &mail.body,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    tracing::info!(to = %mail.to, subject = %mail.subject, "mail queued");
    Ok(id)
}

pub fn verification<'a>(school_id: Option<&'a str>, to: &'a str, role: Role, token: &str) -> Mail<'a> {
    Mail {
        school_id,
        to,
        subject: "Verify your email address".to_string(),
        body: format!(
            "Welcome! Confirm your {} account with this code within 24 hours:\n\nrole: {}\ntoken: {}\n",
            role.as_str().to_ascii_lowercase(),
            role.as_str(),
            token
        ),
    }
}

pub fn password_reset<'a>(school_id: Option<&'a str>, to: &'a str, role: Role, token: &str) -> Mail<'a> {
    Mail {
        school_id,
        to,
        subject: "Password reset request".to_string(),
        body: format!(
            "A password reset was requested for this account. The code expires in 1 hour.\n\nrole: {}\ntoken: {}\n\nIgnore this message if you did not ask for it.\n",
            role.as_str(),
            token
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_token(body: &str) -> Option<&str> {
        body.lines()
            .find_map(|l| l.trim().strip_prefix("token:"))
            .map(str::trim)
    }

    #[test]
    fn bodies_carry_extractable_token() {
        let m = verification(None, "a@example.com", Role::Teacher, "abc123");
        assert_eq!(extract_token(&m.body), Some("abc123"));
        let m = password_reset(Some("s1"), "a@example.com", Role::School, "zzz");
        assert_eq!(extract_token(&m.body), Some("zzz"));
        assert!(m.body.contains("role: SCHOOL"));
    }
}
