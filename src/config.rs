use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use which::which;

use crate::{read_json_file, write_json_atomic, OmniError, Result};

const CONFIG_FILE: &str = "config.json";

/// Which persistence backend to open at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Everything lives in a JSON file under the data directory
    #[default]
    Local,

    /// A document service reached over HTTP
    Remote {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

/// Application configuration settings.
///
/// User preferences that travel with the data (retention, kanban columns,
/// profile) are stored in the settings collection instead.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding the local store file or the remote cache
    pub data_dir: PathBuf,

    /// Directory for zip backups
    pub backup_dir: PathBuf,

    /// Backend selection
    pub backend: BackendConfig,

    /// Upper bound on every storage call, in seconds
    pub request_timeout_secs: u64,

    /// How often background maintenance runs (in minutes)
    pub maintenance_interval_minutes: u32,

    /// Whether maintenance purges trash past its retention
    pub auto_purge_expired: bool,

    /// Whether maintenance also writes a backup
    pub auto_backup: bool,

    /// Maximum number of backups to keep (0 keeps all)
    pub max_backups: u32,

    /// Editor for long text fields
    pub editor_command: Option<String>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("app", "omnidesk", "omnidesk")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".omnidesk"));
        Config {
            backup_dir: data_dir.join("backups"),
            data_dir,
            backend: BackendConfig::Local,
            request_timeout_secs: 10,
            maintenance_interval_minutes: 60,
            auto_purge_expired: true,
            auto_backup: false,
            max_backups: 10,
            editor_command: None,
        }
    }
}

impl Config {
    /// Location of the configuration file when none is given explicitly.
    pub fn default_path() -> PathBuf {
        project_dirs()
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    /// Loads the configuration, falling back to defaults when the file is
    /// missing. Missing fields take their default values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let config = match read_json_file::<Config>(&path) {
            Ok(Some(config)) => {
                info!("Loaded configuration from {}", path.display());
                config
            }
            Ok(None) => {
                debug!("No configuration at {}, using defaults", path.display());
                Config::default()
            }
            Err(e) => {
                return Err(OmniError::ConfigError {
                    message: format!("Failed to read {}: {}", path.display(), e),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        self.validate()?;
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        write_json_atomic(&path, self)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.maintenance_interval_minutes) * 60)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(OmniError::ConfigError {
                message: "request_timeout_secs must be at least 1".to_string(),
            });
        }
        if self.maintenance_interval_minutes == 0 {
            return Err(OmniError::ConfigError {
                message: "maintenance_interval_minutes must be at least 1".to_string(),
            });
        }
        if let BackendConfig::Remote { url, .. } = &self.backend {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(OmniError::ConfigError {
                    message: format!("remote url must be http(s): {}", url),
                });
            }
        }
        Ok(())
    }

    // This method provides smart fallbacks when no editor is configured
    pub fn get_editor_command(&self) -> String {
        if let Some(editor) = &self.editor_command {
            return editor.clone();
        }

        if let Ok(editor) = std::env::var("EDITOR") {
            return editor;
        }

        if cfg!(windows) {
            "notepad".to_string()
        } else if cfg!(target_os = "macos") {
            "open -t".to_string()
        } else {
            for editor in &["nano", "vim", "vi", "emacs"] {
                if which(editor).is_ok() {
                    return editor.to_string();
                }
            }
            "nano".to_string()
        }
    }
}
