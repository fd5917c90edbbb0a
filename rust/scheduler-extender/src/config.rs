//! Extender settings: an optional YAML file, overridden by command line flags.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

pub const DEFAULT_LISTEN: &str = ":8000";
pub const DEFAULT_LOG_LEVEL: &str = "2";
pub const DEFAULT_CERT_FILE: &str = "/etc/csi-nfs-scheduler-extender/certs/tls.crt";
pub const DEFAULT_KEY_FILE: &str = "/etc/csi-nfs-scheduler-extender/certs/tls.key";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("unable to read config file from {path:?}"))]
    ReadConfigFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to parse config file"))]
    ParseConfig { source: serde_yaml::Error },
}

/// Every setting is optional, so the same shape serves for the file and the flags.
///
/// Keys the extender does not use (`default-divisor`, `cache-size`, ...) are ignored.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PartialConfig {
    pub listen: Option<String>,
    pub log_level: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub health_probe_bind_address: Option<String>,
}

impl PartialConfig {
    pub fn parse(yaml: &str) -> Result<Self, Error> {
        // An empty document deserializes to unit, not to a struct.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context(ParseConfigSnafu)
    }

    pub async fn load(path: &Path) -> Result<Self, Error> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .context(ReadConfigFileSnafu { path })?;
        Self::parse(&yaml)
    }

    /// Values of `self` win over `fallback`.
    pub fn or(self, fallback: Self) -> Self {
        Self {
            listen: self.listen.or(fallback.listen),
            log_level: self.log_level.or(fallback.log_level),
            cert_file: self.cert_file.or(fallback.cert_file),
            key_file: self.key_file.or(fallback.key_file),
            health_probe_bind_address: self
                .health_probe_bind_address
                .or(fallback.health_probe_bind_address),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub listen: String,
    pub log_level: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Plain HTTP listener for `/healthz` and `/readyz`, disabled when unset or empty.
    pub health_probe_bind_address: Option<String>,
}

impl From<PartialConfig> for Config {
    fn from(partial: PartialConfig) -> Self {
        Self {
            listen: partial.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_owned()),
            log_level: partial
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
            cert_file: partial
                .cert_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_FILE)),
            key_file: partial
                .key_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE)),
            health_probe_bind_address: partial
                .health_probe_bind_address
                .filter(|address| !address.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(
            Config::from(PartialConfig::default()),
            Config {
                listen: ":8000".to_owned(),
                log_level: "2".to_owned(),
                cert_file: PathBuf::from(DEFAULT_CERT_FILE),
                key_file: PathBuf::from(DEFAULT_KEY_FILE),
                health_probe_bind_address: None,
            }
        );
    }

    #[test]
    fn test_file_values_and_unknown_keys() {
        let file = PartialConfig::parse(indoc! {r#"
            listen: ":8099"
            log-level: "4"
            default-divisor: 1
            cache-size: 10
            health-probe-bind-address: ":8081"
            cert-file: /certs/tls.crt
            key-file: /certs/tls.key
        "#})
        .unwrap();

        let config = Config::from(file);
        assert_eq!(config.listen, ":8099");
        assert_eq!(config.log_level, "4");
        assert_eq!(config.cert_file, PathBuf::from("/certs/tls.crt"));
        assert_eq!(config.health_probe_bind_address.as_deref(), Some(":8081"));
    }

    #[test]
    fn test_flags_override_file() {
        let file = PartialConfig {
            listen: Some(":8099".to_owned()),
            log_level: Some("4".to_owned()),
            ..PartialConfig::default()
        };
        let flags = PartialConfig {
            listen: Some("127.0.0.1:9000".to_owned()),
            health_probe_bind_address: Some(String::new()),
            ..PartialConfig::default()
        };

        let config = Config::from(flags.or(file));
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.log_level, "4");
        assert_eq!(config.health_probe_bind_address, None);
    }

    #[test]
    fn test_empty_file() {
        assert_eq!(PartialConfig::parse("\n").unwrap(), PartialConfig::default());
    }

    #[test]
    fn test_malformed_file() {
        assert!(matches!(
            PartialConfig::parse("listen: [unclosed"),
            Err(Error::ParseConfig { .. })
        ));
    }
}
