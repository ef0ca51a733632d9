//! Dated per-target run files plus whole-run output, written atomically.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use jtt_core::{IngestionRecord, RunOutput};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunOutputStore {
    root: PathBuf,
}

/// Target names come from config; keep them filesystem-safe.
pub fn target_file_stem(target: &str) -> String {
    let stem: String = target
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "target".to_string()
    } else {
        stem
    }
}

impl RunOutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target_path(&self, target: &str, date: NaiveDate) -> PathBuf {
        self.root.join(format!(
            "{}-{}.json",
            target_file_stem(target),
            date.format("%Y-%m-%d")
        ))
    }

    /// Records saved for `target` on `date`, if that run already happened.
    pub async fn load_cached(
        &self,
        target: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<Vec<IngestionRecord>>> {
        let path = self.target_path(target, date);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking run file {}", path.display()))?
        {
            return Ok(None);
        }
        let data = fs::read(&path)
            .await
            .with_context(|| format!("reading run file {}", path.display()))?;
        let records = serde_json::from_slice(&data)
            .with_context(|| format!("parsing run file {}", path.display()))?;
        Ok(Some(records))
    }

    pub async fn save_target(
        &self,
        target: &str,
        date: NaiveDate,
        records: &[IngestionRecord],
    ) -> anyhow::Result<PathBuf> {
        let path = self.target_path(target, date);
        write_json_atomic(&path, &records).await?;
        Ok(path)
    }

    pub async fn load_run_output(path: impl AsRef<Path>) -> anyhow::Result<RunOutput> {
        let path = path.as_ref();
        let data = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Pretty JSON through a temp file and rename, so readers never see a partial file.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
