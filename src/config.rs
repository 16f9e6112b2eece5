// ABOUTME: JSON config file with serde defaults and CLI overrides
// ABOUTME: Sections mirror the runtime concerns: api, download, format, sync

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub download: DownloadConfig,
    pub format: FormatConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Knowledge-base server base URL, e.g. "https://kshttps0.example.net".
    pub server: Option<String>,
    /// Knowledge-base guid the account resolves to.
    pub kb_guid: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            server: None,
            kb_guid: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub output_dir: PathBuf,
    pub max_concurrent: usize,
    pub download_attachments: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            output_dir: PathBuf::from("notes-export"),
            max_concurrent: 5,
            download_attachments: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub convert_to_markdown: bool,
    pub preserve_structure: bool,
    pub extract_images: bool,
    pub add_metadata: bool,
}

impl Default for FormatConfig {
    fn default() -> Self {
        FormatConfig {
            convert_to_markdown: true,
            preserve_structure: true,
            extract_images: true,
            add_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub incremental: bool,
    pub exclude_folders: Vec<String>,
    /// Top-level directory the synced tree lands under.
    pub team: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            incremental: false,
            exclude_folders: vec!["/Deleted Items/".into()],
            team: "Personal".into(),
        }
    }
}

impl Config {
    /// Load from `path` if given and present; a missing file yields defaults,
    /// a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let Some(path) = path else {
            return Ok(Config::default());
        };

        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.download.max_concurrent, 5);
        assert!(config.format.convert_to_markdown);
        assert!(config.format.preserve_structure);
        assert!(!config.sync.incremental);
        assert_eq!(config.sync.exclude_folders, vec!["/Deleted Items/"]);
    }

    #[test]
    fn test_load_missing_file_is_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(Some(&temp.path().join("nope.json"))).unwrap();
        assert_eq!(config.download.max_concurrent, 5);
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "api": {"server": "https://kb.example.net", "kb_guid": "kb-1"},
                "download": {"max_concurrent": 2}
            }"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.api.server.as_deref(), Some("https://kb.example.net"));
        assert_eq!(config.download.max_concurrent, 2);
        // untouched sections keep their defaults
        assert!(config.download.download_attachments);
        assert!(config.format.add_metadata);
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
