mod auth;
mod calc;
mod config;
mod db;
mod domain;
mod ipc;
mod mail;
mod media;
mod pdf;
mod storage;

use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("schoold=info"));
    // stdout carries the protocol; logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    let config = config::Config::from_env();
    init_tracing(config.as_ref().map(|c| c.log_json).unwrap_or(false));
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "invalid configuration");
            std::process::exit(2);
        }
    };

    let initial_workspace = config.workspace.clone();
    let mut state = ipc::AppState::new(config);
    if let Some(path) = initial_workspace {
        if let Err(e) = ipc::open_workspace(&mut state, path.clone()) {
            tracing::error!(path = %path.display(), error = %format!("{e:#}"), "workspace open failed");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "schoold ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                // No id to echo back.
                let resp = serde_json::json!({
                    "id": serde_json::Value::Null,
                    "success": false,
                    "message": e.to_string(),
                    "error": { "code": "bad_json", "status": 400 },
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"success\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed; shutting down");
}
