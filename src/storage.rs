//! Upload store under `<workspace>/uploads/<category>/` and generated
//! exports under `<workspace>/exports/<school>/`.

use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const UPLOADS_DIR: &str = "uploads";
pub const EXPORTS_DIR: &str = "exports";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload source not found: {0}")]
    SourceMissing(String),

    #[error("upload is {size} bytes; limit is {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Copy `source` into the store and return its workspace-relative path,
/// which is what records keep as the file's URL.
pub fn store_upload(
    workspace: &Path,
    category: &str,
    source: &Path,
    max_bytes: u64,
) -> Result<String, StorageError> {
    let meta = std::fs::metadata(source)
        .map_err(|_| StorageError::SourceMissing(source.to_string_lossy().to_string()))?;
    if !meta.is_file() {
        return Err(StorageError::SourceMissing(
            source.to_string_lossy().to_string(),
        ));
    }
    if meta.len() > max_bytes {
        return Err(StorageError::TooLarge {
            size: meta.len(),
            max: max_bytes,
        });
    }

    let file_name = source
        .file_name()
        .and_then(|s| s.to_str())
        .map(sanitize_file_name)
        .unwrap_or_else(|| "upload".to_string());
    let rel = PathBuf::from(UPLOADS_DIR)
        .join(category)
        .join(format!("{}-{}", Uuid::new_v4().simple(), file_name));
    let dest = workspace.join(&rel);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, &dest)?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Write a generated file for `school_id` and return its workspace-relative
/// path. Callers never choose the directory; `file_name` is sanitized.
pub fn write_export(
    workspace: &Path,
    school_id: &str,
    file_name: &str,
    bytes: &[u8],
) -> Result<String, StorageError> {
    let rel = PathBuf::from(EXPORTS_DIR)
        .join(sanitize_file_name(school_id))
        .join(sanitize_file_name(file_name));
    let dest = workspace.join(&rel);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&dest, bytes)?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

pub fn resolve(workspace: &Path, rel: &str) -> PathBuf {
    workspace.join(rel)
}

/// Best-effort removal of a stored file; missing files are ignored.
pub fn remove(workspace: &Path, rel: &str) {
    let p = resolve(workspace, rel);
    if let Err(e) = std::fs::remove_file(&p) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %p.display(), error = %e, "failed to remove upload");
        }
    }
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
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

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_file_name("my report (1).pdf"), "my_report__1_.pdf");
        assert_eq!(sanitize_file_name("..hidden"), "hidden");
        assert_eq!(sanitize_file_name("///"), "___");
    }

    #[test]
    fn copies_into_category_and_enforces_cap() {
        let ws = temp_dir("schoold-storage");
        let src = ws.join("notes.txt");
        std::fs::write(&src, b"hello").unwrap();

        let rel = store_upload(&ws, "assignments", &src, 1024).unwrap();
        assert!(rel.starts_with("uploads/assignments/"));
        assert!(rel.ends_with("-notes.txt"));
        assert_eq!(std::fs::read(resolve(&ws, &rel)).unwrap(), b"hello");

        assert!(matches!(
            store_upload(&ws, "assignments", &src, 2),
            Err(StorageError::TooLarge { size: 5, max: 2 })
        ));
        assert!(matches!(
            store_upload(&ws, "assignments", &ws.join("absent.bin"), 1024),
            Err(StorageError::SourceMissing(_))
        ));
    }

    #[test]
    fn exports_stay_inside_the_school_folder() {
        let ws = temp_dir("schoold-exports");
        let rel = write_export(&ws, "school-1", "../../schoold.sqlite3", b"%PDF-").unwrap();
        assert!(rel.starts_with("exports/school-1/"));
        assert_eq!(rel.matches('/').count(), 2);
        assert_eq!(std::fs::read(resolve(&ws, &rel)).unwrap(), b"%PDF-");
        assert!(!ws.join("schoold.sqlite3").exists());
    }
}
