//! Daemon configuration: a JSON file with defaults for every key.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, SomeIpError};
use crate::sd::types::{SD_DEFAULT_PORT, SD_MULTICAST_ADDR};

/// Resolved daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SD group address; offers are multicast here. A non-multicast address
    /// degrades to plain unicast SD (used by the loopback tests).
    pub sd_address: Ipv4Addr,
    /// SD port.
    pub sd_port: u16,
    /// Interface address for the multicast membership.
    pub interface: Ipv4Addr,
    /// Log filter (tracing `EnvFilter` syntax).
    pub log_level: String,
    /// Log file; stderr when unset.
    pub log_path: Option<PathBuf>,
    /// Unix-domain socket path for the IPC server.
    pub uds_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sd_address: SD_MULTICAST_ADDR,
            sd_port: SD_DEFAULT_PORT,
            interface: Ipv4Addr::new(127, 0, 0, 1),
            log_level: "info".to_string(),
            log_path: None,
            uds_path: PathBuf::from("/tmp/someipyd.sock"),
        }
    }
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| SomeIpError::Config(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|err| SomeIpError::Config(format!("{}: {err}", path.display())))
    }

    /// The SD group socket address.
    pub fn sd_socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.sd_address, self.sd_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.sd_address, Ipv4Addr::new(224, 224, 224, 245));
        assert_eq!(cfg.sd_port, 30490);
        assert_eq!(cfg.interface, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(cfg.uds_path, PathBuf::from("/tmp/someipyd.sock"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "sd_port": 31000, "uds_path": "/tmp/test-someipyd.sock" }}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.sd_port, 31000);
        assert_eq!(cfg.uds_path, PathBuf::from("/tmp/test-someipyd.sock"));
        // Untouched keys keep their defaults.
        assert_eq!(cfg.sd_address, Ipv4Addr::new(224, 224, 224, 245));
    }

    #[test]
    fn test_bad_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(SomeIpError::Config(_))
        ));

        assert!(matches!(
            Config::load(Path::new("/nonexistent/someipyd.json")),
            Err(SomeIpError::Config(_))
        ));
    }
}
