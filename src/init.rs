use crate::config::Config;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

const SCRIPT_EXTENSIONS: &[&str] = &["txt", "md", "fountain", "html", "htm"];

pub async fn ensure_directories(cfg: &Config) -> Result<()> {
    for dir in [&cfg.scripts_dir, &cfg.output_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
            tracing::info!("Created directory: {}", dir.display());
        }
    }
    Ok(())
}

/// Script documents under `dir`, sorted by path.
pub fn find_scripts(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| SCRIPT_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
                .unwrap_or(false)
        })
        .collect();
    out.sort();
    out
}
