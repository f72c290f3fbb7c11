//! Utility functions
//!
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
///
/// The body is written to a temporary sibling first and renamed afterwards,
/// so `filepath` never holds a partial download.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;
    let content = resp.bytes().await?;

    let mut tmp_path = filepath.as_os_str().to_owned();
    tmp_path.push(".part");
    let tmp_path = PathBuf::from(tmp_path);

    tokio::fs::write(&tmp_path, &content)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, filepath).await?;

    log::debug!("Downloaded {} ({} bytes)", url, content.len());

    Ok(())
}

/// Directory where downloaded models are kept between runs.
pub fn default_models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("face_overlay")
        .join("models")
}
