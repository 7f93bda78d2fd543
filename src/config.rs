use crate::grid::GridGeometry;
use crate::planner::PagePlanner;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "open_api_key", alias = "openai_api_key", default)]
    pub openai_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    /// Pause after each successful generation call.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Per-call limit; 0 leaves timing to the HTTP client.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_grid_cols")]
    pub grid_cols: u32,
    #[serde(default = "default_grid_rows")]
    pub grid_rows: u32,
    #[serde(default = "default_page_capacity")]
    pub page_capacity: usize,
    #[serde(default = "default_max_script_chars")]
    pub max_script_chars: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_text_model() -> String {
    "gpt-4.1".to_string()
}

fn default_image_model() -> String {
    "gpt-image-1".to_string()
}

fn default_image_size() -> String {
    "1024x1536".to_string()
}

fn default_cooldown_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_grid_cols() -> u32 {
    2
}

fn default_grid_rows() -> u32 {
    3
}

fn default_page_capacity() -> usize {
    6
}

fn default_max_script_chars() -> usize {
    80_000
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_key: String::new(),
            openai_base_url: default_base_url(),
            text_model: default_text_model(),
            image_model: default_image_model(),
            image_size: default_image_size(),
            cooldown_ms: default_cooldown_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            grid_cols: default_grid_cols(),
            grid_rows: default_grid_rows(),
            page_capacity: default_page_capacity(),
            max_script_chars: default_max_script_chars(),
            output_dir: default_output_dir(),
            scripts_dir: default_scripts_dir(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P, require_key: bool) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.as_ref().display()))?;
        config.validate(require_key)?;
        Ok(config)
    }

    pub fn validate(&self, require_key: bool) -> Result<()> {
        if require_key && self.openai_key.trim().is_empty() {
            anyhow::bail!("config.json: open_api_key missing");
        }
        // Also checks that a full page fits the crop grid.
        self.planner()?;
        if self.max_script_chars == 0 {
            anyhow::bail!("config.json: max_script_chars must be positive");
        }
        Ok(())
    }

    pub fn geometry(&self) -> Result<GridGeometry> {
        Ok(GridGeometry::new(self.grid_cols, self.grid_rows)?)
    }

    pub fn planner(&self) -> Result<PagePlanner> {
        Ok(PagePlanner::new(self.page_capacity, self.geometry()?)?)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Writes a template config with every default filled in.
    pub async fn write_template<P: AsRef<Path>>(path: P) -> Result<()> {
        let body = serde_json::to_string_pretty(&Config::default())?;
        fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write config: {}", path.as_ref().display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn minimal_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"open_api_key":"sk-test","cooldown_ms":250}"#).unwrap();

        let cfg = Config::load(&path, true).await.unwrap();
        assert_eq!(cfg.openai_key, "sk-test");
        assert_eq!(cfg.cooldown(), Duration::from_millis(250));
        assert_eq!(cfg.geometry().unwrap(), GridGeometry::STORYBOARD);
        assert_eq!(cfg.page_capacity, 6);
        assert_eq!(cfg.request_timeout(), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn missing_key_only_matters_when_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        assert!(Config::load(&path, true).await.is_err());
        assert!(Config::load(&path, false).await.is_ok());
    }

    #[test]
    fn page_capacity_larger_than_grid_is_rejected() {
        let cfg = Config {
            page_capacity: 8,
            ..Config::default()
        };
        assert!(cfg.validate(false).is_err());

        let cfg = Config {
            grid_rows: 0,
            ..Config::default()
        };
        assert!(cfg.validate(false).is_err());
    }

    #[tokio::test]
    async fn template_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        Config::write_template(&path).await.unwrap();
        let cfg = Config::load(&path, false).await.unwrap();
        assert_eq!(cfg.image_size, "1024x1536");
        assert_eq!(cfg.output_dir, PathBuf::from("output"));
    }
}
