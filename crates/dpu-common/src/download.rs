//! HTTP downloads and archive handling for firmware and boot artifacts

use crate::error::{CmdError, Result};
use regex::Regex;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Download `url` into `dest_dir`, keeping the last path segment as file name
pub async fn download_file(url: &str, dest_dir: &Path) -> Result<PathBuf> {
    let name = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("download");
    let dest = dest_dir.join(name);
    download_to(url, &dest).await?;
    Ok(dest)
}

/// Download `url` to exactly `dest`
pub async fn download_to(url: &str, dest: &Path) -> Result<()> {
    info!(url = %url, dest = %dest.display(), "Downloading");
    let mut resp = Client::new().get(url).send().await?;

    if !resp.status().is_success() {
        return Err(CmdError::Download {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!(bytes = written, dest = %dest.display(), "Download complete");
    Ok(())
}

/// Extract a `.tar.gz` into `extract_dir` and return the extracted paths
pub async fn extract_tar_gz(tar_path: &Path, extract_dir: &Path) -> Result<Vec<PathBuf>> {
    let tar_path = tar_path.to_path_buf();
    let extract_dir = extract_dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
        let file = std::fs::File::open(&tar_path)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let mut extracted = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel = entry.path()?.to_path_buf();
            if !entry
                .unpack_in(&extract_dir)
                .map_err(|e| CmdError::Archive(format!("{}: {}", rel.display(), e)))?
            {
                return Err(CmdError::Archive(format!(
                    "refusing to unpack {} outside {}",
                    rel.display(),
                    extract_dir.display()
                )));
            }
            extracted.push(extract_dir.join(rel));
        }

        Ok(extracted)
    })
    .await
    .map_err(|e| CmdError::Archive(e.to_string()))?
}

/// Names linked from an HTTP directory index (parent/sort links dropped)
pub fn parse_directory_listing(html: &str) -> Vec<String> {
    let re = Regex::new(r#"(?i)href\s*=\s*"([^"]+)""#).expect("static regex");
    re.captures_iter(html)
        .map(|c| c[1].to_string())
        .filter(|href| {
            !href.starts_with('?')
                && !href.starts_with('/')
                && !href.starts_with("..")
                && !href.contains("://")
        })
        .map(|href| href.trim_end_matches('/').to_string())
        .collect()
}

/// List an HTTP directory index page
pub async fn list_http_directory(url: &str) -> Result<Vec<String>> {
    let resp = Client::new().get(url).send().await?;
    if !resp.status().is_success() {
        return Err(CmdError::Download {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }
    let body = resp.text().await?;
    Ok(parse_directory_listing(&body))
}

/// Find the first file under `root` whose name contains both `prefix` and
/// `identifier`
pub fn find_file(root: &Path, prefix: &str, identifier: &str) -> Result<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .find(|e| {
            let name = e.file_name().to_string_lossy();
            name.contains(prefix) && name.contains(identifier)
        })
        .map(|e| e.into_path())
        .ok_or_else(|| CmdError::FileNotFound {
            name: format!("{prefix} (identifier '{identifier}')"),
            root: root.display().to_string(),
        })
}
