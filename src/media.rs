//! Background video compression.
//!
//! Each upload gets a row in `media_jobs` (`queued → running → done | failed`)
//! and its id is handed to a single worker thread. The worker runs the
//! configured encoder as a subprocess and swaps the compressed output over
//! the original file. Clients poll the job row for the outcome.

use anyhow::{anyhow, bail, Context};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use crate::db;
use crate::domain::JobStatus;
use crate::storage;

pub struct MediaQueue {
    tx: Option<Sender<String>>,
    worker: Option<JoinHandle<()>>,
}

pub struct NewJob<'a> {
    pub school_id: &'a str,
    pub owner_kind: &'a str,
    pub owner_id: &'a str,
    /// Workspace-relative path of the stored upload.
    pub input_path: &'a str,
}

impl MediaQueue {
    pub fn start(workspace: PathBuf, encoder: String) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<String>();
        let worker = std::thread::Builder::new()
            .name("media-worker".into())
            .spawn(move || {
                let conn = match db::open_existing(&workspace) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(error = %e, "media worker could not open database");
                        return;
                    }
                };
                for job_id in rx {
                    run_job(&conn, &workspace, &encoder, &job_id);
                }
            })
            .context("failed to spawn media worker")?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Record a queued job and hand it to the worker.
    pub fn enqueue(&self, conn: &Connection, job: NewJob<'_>) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO media_jobs(id, school_id, owner_kind, owner_id, input_path, status, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                job.school_id,
                job.owner_kind,
                job.owner_id,
                job.input_path,
                JobStatus::Queued.as_str(),
                chrono::Utc::now().to_rfc3339(),
            ),
        )?;
        let sent = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("media worker stopped"))
            .and_then(|tx| tx.send(id.clone()).map_err(|_| anyhow!("media worker stopped")));
        if let Err(e) = sent {
            finish(conn, &id, JobStatus::Failed, Some(&e.to_string()))?;
        }
        tracing::info!(job_id = %id, owner = %job.owner_id, "compression job queued");
        Ok(id)
    }
}

impl MediaQueue {
    /// Stop taking jobs without waiting for the worker. Whatever is already
    /// queued still runs against the old workspace's own connection.
    pub fn detach(mut self) {
        self.tx.take();
        if self.worker.take().is_some() {
            tracing::debug!("previous media worker detached");
        }
    }
}

impl Drop for MediaQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn run_job(conn: &Connection, workspace: &Path, encoder: &str, job_id: &str) {
    let input: Option<String> = match conn
        .query_row(
            "SELECT input_path FROM media_jobs WHERE id = ?",
            [job_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(job_id, error = %e, "failed to load media job");
            return;
        }
    };
    let Some(input) = input else {
        tracing::warn!(job_id, "media job vanished before it ran");
        return;
    };

    if let Err(e) = conn.execute(
        "UPDATE media_jobs SET status = ?, started_at = ? WHERE id = ?",
        (
            JobStatus::Running.as_str(),
            chrono::Utc::now().to_rfc3339(),
            job_id,
        ),
    ) {
        tracing::error!(job_id, error = %e, "failed to mark media job running");
        return;
    }

    let outcome = compress_in_place(encoder, &storage::resolve(workspace, &input));
    let result = match &outcome {
        Ok(()) => {
            tracing::info!(job_id, "compression finished");
            finish(conn, job_id, JobStatus::Done, None)
        }
        Err(e) => {
            tracing::warn!(job_id, error = %e, "compression failed");
            finish(conn, job_id, JobStatus::Failed, Some(&format!("{e:#}")))
        }
    };
    if let Err(e) = result {
        tracing::error!(job_id, error = %e, "failed to record media job outcome");
    }
}

fn finish(conn: &Connection, job_id: &str, status: JobStatus, error: Option<&str>) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE media_jobs SET status = ?, error = ?, finished_at = ? WHERE id = ?",
        (
            status.as_str(),
            error,
            chrono::Utc::now().to_rfc3339(),
            job_id,
        ),
    )?;
    Ok(())
}

fn compress_in_place(encoder: &str, input: &Path) -> anyhow::Result<()> {
    if !input.is_file() {
        bail!("input file missing: {}", input.display());
    }
    let tmp = input.with_extension("compressing.mp4");
    let out = Command::new(encoder)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-vcodec", "libx264", "-crf", "28"])
        .arg(&tmp)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to run encoder `{}`", encoder))?;
    if !out.status.success() {
        let _ = std::fs::remove_file(&tmp);
        let stderr = String::from_utf8_lossy(&out.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        bail!("encoder exited with {}: {}", out.status, tail);
    }
    if !tmp.is_file() {
        bail!("encoder produced no output");
    }
    std::fs::rename(&tmp, input)
        .with_context(|| format!("failed to replace {}", input.display()))?;
    Ok(())
}
