use std::path::PathBuf;

use crate::auth::Role;

pub const DEFAULT_UPLOAD_MAX_BYTES: u64 = 500 * 1024 * 1024;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub jwt_secret_school: String,
    pub jwt_secret_teacher: String,
    pub jwt_secret_student: String,
    /// Token lifetime in seconds (default: 7 days).
    pub token_ttl_secs: i64,
    pub upload_max_bytes: u64,
    /// Program invoked for video compression.
    pub video_encoder: String,
    /// Default pass threshold (percent) for examination analytics.
    pub pass_threshold: f64,
    /// Development mode: 500 responses carry the underlying message.
    pub dev_mode: bool,
    pub mail_from: String,
    pub log_json: bool,
}

const SECRET_VARS: [(&str, Role); 3] = [
    ("SCHOOLD_JWT_SECRET_SCHOOL", Role::School),
    ("SCHOOLD_JWT_SECRET_TEACHER", Role::Teacher),
    ("SCHOOLD_JWT_SECRET_STUDENT", Role::Student),
];

/// Development defaults. The JWT secrets here are public and only accepted
/// when `SCHOOLD_DEV` is on.
impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            jwt_secret_school: "school-dev-secret".into(),
            jwt_secret_teacher: "teacher-dev-secret".into(),
            jwt_secret_student: "student-dev-secret".into(),
            token_ttl_secs: 7 * 24 * 3600,
            upload_max_bytes: DEFAULT_UPLOAD_MAX_BYTES,
            video_encoder: "ffmpeg".into(),
            pass_threshold: 50.0,
            dev_mode: false,
            mail_from: "no-reply@schoold.local".into(),
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("SCHOOLD_WORKSPACE") {
            cfg.workspace = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SCHOOLD_DEV") {
            cfg.dev_mode = is_truthy(&v);
        }
        for (key, role) in SECRET_VARS {
            match get(key) {
                Some(v) => *cfg.jwt_secret_mut(role) = v,
                None if cfg.dev_mode => {}
                None => anyhow::bail!("{key} must be set unless SCHOOLD_DEV is on"),
            }
        }
        if let Some(v) = get("SCHOOLD_TOKEN_TTL_SECS") {
            cfg.token_ttl_secs = v
                .parse()
                .map_err(|e| anyhow::anyhow!("SCHOOLD_TOKEN_TTL_SECS: {e}"))?;
        }
        if let Some(v) = get("SCHOOLD_UPLOAD_MAX_BYTES") {
            cfg.upload_max_bytes = v
                .parse()
                .map_err(|e| anyhow::anyhow!("SCHOOLD_UPLOAD_MAX_BYTES: {e}"))?;
        }
        if let Some(v) = get("SCHOOLD_VIDEO_ENCODER") {
            cfg.video_encoder = v;
        }
        if let Some(v) = get("SCHOOLD_PASS_THRESHOLD") {
            let t: f64 = v
                .parse()
                .map_err(|e| anyhow::anyhow!("SCHOOLD_PASS_THRESHOLD: {e}"))?;
            if !(0.0..=100.0).contains(&t) {
                anyhow::bail!("SCHOOLD_PASS_THRESHOLD must be between 0 and 100");
            }
            cfg.pass_threshold = t;
        }
        if let Some(v) = get("SCHOOLD_MAIL_FROM") {
            cfg.mail_from = v;
        }
        if let Some(v) = get("SCHOOLD_LOG_JSON") {
            cfg.log_json = is_truthy(&v);
        }
        Ok(cfg)
    }

    pub fn jwt_secret(&self, role: Role) -> &str {
        match role {
            Role::School => &self.jwt_secret_school,
            Role::Teacher => &self.jwt_secret_teacher,
            Role::Student => &self.jwt_secret_student,
        }
    }

    fn jwt_secret_mut(&mut self, role: Role) -> &mut String {
        match role {
            Role::School => &mut self.jwt_secret_school,
            Role::Teacher => &mut self.jwt_secret_teacher,
            Role::Student => &mut self.jwt_secret_student,
        }
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    /// `lookup` with all three secrets present.
    fn cfg_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let mut all = vec![
            ("SCHOOLD_JWT_SECRET_SCHOOL", "s"),
            ("SCHOOLD_JWT_SECRET_TEACHER", "t"),
            ("SCHOOLD_JWT_SECRET_STUDENT", "u"),
        ];
        all.extend_from_slice(pairs);
        lookup(&all)
    }

    #[test]
    fn defaults_apply_when_env_empty() {
        let cfg = cfg_from(&[]).expect("config");
        assert_eq!(cfg.upload_max_bytes, DEFAULT_UPLOAD_MAX_BYTES);
        assert_eq!(cfg.pass_threshold, 50.0);
        assert!(!cfg.dev_mode);
        assert!(cfg.workspace.is_none());
    }

    #[test]
    fn per_role_secrets_are_distinct() {
        let cfg = cfg_from(&[
            ("SCHOOLD_JWT_SECRET_SCHOOL", "a"),
            ("SCHOOLD_JWT_SECRET_TEACHER", "b"),
            ("SCHOOLD_JWT_SECRET_STUDENT", "c"),
        ])
        .expect("config");
        assert_eq!(cfg.jwt_secret(Role::School), "a");
        assert_eq!(cfg.jwt_secret(Role::Teacher), "b");
        assert_eq!(cfg.jwt_secret(Role::Student), "c");
    }

    #[test]
    fn missing_secrets_are_fatal_outside_dev_mode() {
        let err = lookup(&[]).expect_err("secrets required");
        assert!(err.to_string().contains("SCHOOLD_JWT_SECRET_SCHOOL"));
        let err = lookup(&[
            ("SCHOOLD_JWT_SECRET_SCHOOL", "a"),
            ("SCHOOLD_JWT_SECRET_TEACHER", "b"),
        ])
        .expect_err("student secret required");
        assert!(err.to_string().contains("SCHOOLD_JWT_SECRET_STUDENT"));
        assert!(lookup(&[("SCHOOLD_DEV", "0")]).is_err());
    }

    #[test]
    fn dev_mode_falls_back_to_default_secrets() {
        let cfg = lookup(&[("SCHOOLD_DEV", "1"), ("SCHOOLD_JWT_SECRET_TEACHER", "b")]).expect("cfg");
        assert_eq!(cfg.jwt_secret(Role::School), Config::default().jwt_secret_school);
        assert_eq!(cfg.jwt_secret(Role::Teacher), "b");
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        assert!(cfg_from(&[("SCHOOLD_PASS_THRESHOLD", "140")]).is_err());
        assert!(cfg_from(&[("SCHOOLD_TOKEN_TTL_SECS", "soon")]).is_err());
    }

    #[test]
    fn dev_flag_accepts_common_spellings() {
        assert!(cfg_from(&[("SCHOOLD_DEV", "true")]).expect("cfg").dev_mode);
        assert!(cfg_from(&[("SCHOOLD_DEV", "1")]).expect("cfg").dev_mode);
        assert!(!cfg_from(&[("SCHOOLD_DEV", "0")]).expect("cfg").dev_mode);
    }
}
