use std::path::PathBuf;

use clap::Parser;

use crate::{BackendConfig, Commands, Config};

/// Main CLI application arguments and command structure
#[derive(Parser)]
#[clap(
    version,
    about = "Tasks, ideas and calendar in one desk, with a recoverable trash"
)]
pub struct Cli {
    /// Path to the configuration file
    #[clap(short = 'c', long, value_parser)]
    pub config: Option<PathBuf>,

    /// Path to the data directory
    #[clap(long, value_parser)]
    pub data_dir: Option<PathBuf>,

    /// Path to the backup directory
    #[clap(long, value_parser)]
    pub backup_dir: Option<PathBuf>,

    /// Use the remote document service at this URL
    #[clap(long)]
    pub remote: Option<String>,

    /// Verbose output mode
    #[clap(short, long)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Command-line flags take precedence over the configuration file.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
            if self.backup_dir.is_none() {
                config.backup_dir = dir.join("backups");
            }
        }
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = dir.clone();
        }
        if let Some(url) = &self.remote {
            let token = match &config.backend {
                BackendConfig::Remote { token, .. } => token.clone(),
                BackendConfig::Local => None,
            };
            config.backend = BackendConfig::Remote {
                url: url.clone(),
                token,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "omnidesk",
            "--data-dir",
            "/tmp/desk",
            "--remote",
            "https://desk.example.com",
            "status",
        ]);
        let mut config = Config {
            backend: BackendConfig::Remote {
                url: "https://old.example.com".into(),
                token: Some("secret".into()),
            },
            ..Config::default()
        };
        cli.apply_overrides(&mut config);

        assert_eq!(config.data_dir, PathBuf::from("/tmp/desk"));
        assert_eq!(config.backup_dir, PathBuf::from("/tmp/desk/backups"));
        assert_eq!(
            config.backend,
            BackendConfig::Remote {
                url: "https://desk.example.com".into(),
                token: Some("secret".into())
            }
        );
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::parse_from(["omnidesk", "trash", "empty", "--force"]);
        assert!(matches!(
            cli.command,
            Commands::Trash {
                action: crate::TrashCommand::Empty { force: true }
            }
        ));
    }
}
