use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::Config;
use crate::media::MediaQueue;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    /// Bearer token; a gateway copies the `Authorization` header here.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub config: Config,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub media: Option<MediaQueue>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            workspace: None,
            db: None,
            media: None,
        }
    }
}

/// Borrowed view of the state handed to every handler once a workspace is open.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub config: &'a Config,
    pub workspace: &'a Path,
    pub media: Option<&'a MediaQueue>,
}
