use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::domain_xml::{self, Defaults, NetworkSpec};
use crate::error::VirtupError;
use crate::util;

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG: &str = "virtup.toml";

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub libvirt: LibvirtConfig,
    #[facet(default)]
    pub storage: StorageConfig,
    #[facet(default)]
    pub defaults: DefaultsConfig,
    #[facet(default)]
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LibvirtConfig {
    #[facet(default = "qemu:///system")]
    pub uri: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct StorageConfig {
    #[facet(default = "default")]
    pub pool: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool: "default".into(),
        }
    }
}

/// Instance resources used when the command line leaves them out.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DefaultsConfig {
    #[facet(default = "512M")]
    pub memory: String,
    #[facet(default = 1)]
    pub vcpus: u32,
    #[facet(default = "network:default")]
    pub network: String,
    #[facet(default = "kvm")]
    pub domain_type: String,
    #[facet(default = "pc")]
    pub machine: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            memory: "512M".into(),
            vcpus: domain_xml::DEFAULT_VCPUS,
            network: domain_xml::DEFAULT_NETWORK.into(),
            domain_type: "kvm".into(),
            machine: "pc".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TimeoutsConfig {
    #[facet(default = 60)]
    pub address_s: u64,
    #[facet(default = 1000)]
    pub poll_interval_ms: u64,
    #[facet(default = 30)]
    pub shutdown_s: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            address_s: 60,
            poll_interval_ms: 1000,
            shutdown_s: 30,
        }
    }
}

impl Config {
    /// Resolved instance defaults. Call after [`validate_config`].
    pub fn defaults(&self) -> Result<Defaults, VirtupError> {
        let d = &self.defaults;
        Ok(Defaults {
            memory_mib: util::parse_memory_mib(&d.memory)?,
            vcpus: d.vcpus,
            network: NetworkSpec::parse(&d.network)?,
            domain_type: d.domain_type.clone(),
            machine: d.machine.clone(),
        })
    }

    pub fn address_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.address_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_s)
    }
}

pub fn validate_config(config: &Config) -> Result<(), VirtupError> {
    if config.libvirt.uri.trim().is_empty() {
        return Err(VirtupError::Validation {
            message: "libvirt.uri must not be empty".into(),
        });
    }
    domain_xml::validate_name("pool", &config.storage.pool)?;

    if config.defaults.vcpus < 1 {
        return Err(VirtupError::Validation {
            message: "defaults.vcpus must be at least 1".into(),
        });
    }
    if config.defaults.domain_type.is_empty() || config.defaults.machine.is_empty() {
        return Err(VirtupError::Validation {
            message: "defaults.domain_type and defaults.machine must not be empty".into(),
        });
    }
    config.defaults()?;

    let t = &config.timeouts;
    if t.address_s == 0 || t.shutdown_s == 0 {
        return Err(VirtupError::Validation {
            message: "timeouts must be at least 1 second".into(),
        });
    }
    if t.poll_interval_ms == 0 {
        return Err(VirtupError::Validation {
            message: "timeouts.poll_interval_ms must be non-zero".into(),
        });
    }
    Ok(())
}

/// Load and validate the config.
///
/// With no explicit path, `virtup.toml` in the working directory is used if
/// present and built-in defaults otherwise. An explicit path must exist.
pub fn load_config(path: Option<&Path>) -> Result<Config, VirtupError> {
    let path: PathBuf = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if !default.exists() {
                tracing::debug!("no {DEFAULT_CONFIG}, using built-in defaults");
                return Ok(Config::default());
            }
            default
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| VirtupError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| VirtupError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        validate_config(&config).unwrap();
        let d = config.defaults().unwrap();
        assert_eq!(d.memory_mib, 512);
        assert_eq!(d.vcpus, 1);
        assert_eq!(d.network, NetworkSpec::Network("default".into()));
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[libvirt]
uri = "qemu:///session"

[storage]
pool = "images"

[defaults]
memory = "2G"
vcpus = 4
network = "bridge:br0"
machine = "q35"

[timeouts]
address_s = 90
poll_interval_ms = 250
"#;
        let config: Config = facet_toml::from_str(toml).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.libvirt.uri, "qemu:///session");
        assert_eq!(config.storage.pool, "images");
        assert_eq!(config.defaults.domain_type, "kvm");
        assert_eq!(config.address_timeout(), Duration::from_secs(90));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));

        let d = config.defaults().unwrap();
        assert_eq!(d.memory_mib, 2048);
        assert_eq!(d.network, NetworkSpec::Bridge("br0".into()));
        assert_eq!(d.machine, "q35");
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config: Config = facet_toml::from_str("[storage]\npool = \"fast\"\n").unwrap();
        assert_eq!(config.storage.pool, "fast");
        assert_eq!(config.libvirt.uri, "qemu:///system");
        assert_eq!(config.timeouts.address_s, 60);
    }

    #[test]
    fn zero_vcpus_rejected() {
        let mut config = Config::default();
        config.defaults.vcpus = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn bad_memory_rejected() {
        let mut config = Config::default();
        config.defaults.memory = "lots".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn bad_network_rejected() {
        let mut config = Config::default();
        config.defaults.network = "vlan:5".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut config = Config::default();
        config.timeouts.poll_interval_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, VirtupError::ConfigLoad { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("virtup.toml");
        std::fs::write(&path, "[defaults]\nvcpus = 2\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.defaults.vcpus, 2);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("virtup.toml");
        std::fs::write(&path, "[defaults\nvcpus = 2\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, VirtupError::ConfigParse { .. }));
    }
}
