//! # Configuration Management
//!
//! Layered settings: built-in defaults, an optional TOML file, then
//! `SEALPLANE__*` environment variables (`__` separates nested keys, e.g.
//! `SEALPLANE__ENGINE__LOCK_MODE=fail_fast`). List-valued keys accept
//! comma-separated values.

pub mod settings;

pub use settings::{DevSettings, EngineSettings, ObservabilityConfig, Settings, SyncSettings, UnsealSettings};

use crate::errors::Result;
use crate::secrets::SecretString;
use config::{Config, Environment, File, FileFormat};
use std::path::Path;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "SEALPLANE";

const LIST_KEYS: [&str; 3] = ["bootstrap.thumbprints", "sync.paths", "dev.args"];

impl Settings {
    /// Load settings from an optional file plus the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let mut environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let mut settings: Settings = builder.add_source(environment).build()?.try_deserialize()?;

        if settings.sync.token.is_none() {
            settings.sync.token = std::env::var("VAULT_TOKEN").ok().filter(|t| !t.is_empty()).map(SecretString::new);
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[bootstrap]
region = "eu-west-1"
cluster_id = "prod-eks-1"
thumbprints = ["9e99a48a9960b14926bb7f3b02e22da2b0ab7280"]

[engine]
lock_mode = "fail_fast"
call_timeout_secs = 12

[sync]
paths = ["secret/data/platform/payments/db"]
interval_secs = 60
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.bootstrap.region, "eu-west-1");
        assert_eq!(settings.bootstrap.thumbprints.len(), 1);
        assert_eq!(settings.engine.lock_mode, crate::state::LockMode::FailFast);
        assert_eq!(settings.engine.call_timeout_secs, 12);
        assert_eq!(settings.sync.interval_secs, 60);
        assert_eq!(settings.dev.listen_address, "127.0.0.1:8200");
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[sync]\ninterval_secs = 1").unwrap();

        assert!(Settings::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/sealplane.toml")));
        assert!(result.is_err());
    }
}
