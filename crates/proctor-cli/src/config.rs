//! Configuration loading for the proctor CLI
//!
//! Settings come from a TOML file; CLI flags override individual fields.

use proctor_proxy::{GatewayConfig, ProxyError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load the gateway configuration from `path`.
///
/// A missing file yields the defaults; an unreadable or malformed one is
/// an error.
pub fn load(path: &Path) -> Result<GatewayConfig> {
    if !path.exists() {
        info!("No configuration at {}, using defaults", path.display());
        return Ok(GatewayConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config = parse(&text)
        .map_err(|e| ProxyError::Config(format!("{}: {}", path.display(), e)))?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn parse(text: &str) -> std::result::Result<GatewayConfig, toml::de::Error> {
    toml::from_str(text)
}

/// Apply command-line overrides.
pub fn apply_overrides(
    config: &mut GatewayConfig,
    port: Option<u16>,
    database: Option<PathBuf>,
) {
    if let Some(port) = port {
        config.gateway_port = port;
    }
    if let Some(database) = database {
        config.database = database;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proctor_proxy::config::DirectoryConfig;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.gateway_port, 8000);
    }

    #[test]
    fn test_load_file_with_static_sessions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
gateway_port = 7000
database = "/var/lib/proctor/leases.db"

[port_range]
start = 7001
end = 7100

[directory]
kind = "static"

[[directory.sessions]]
credential = "secret-1"
session_id = "s1"
participant_id = "p1"
assessment_id = "a1"
monitoring_active = true
blocked_hosts = ["chat.example.com", "*.search.example"]
"#
        )
        .unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.gateway_port, 7000);
        assert_eq!(config.port_range.start, 7001);
        match config.directory {
            DirectoryConfig::Static { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].session.blocked_hosts.len(), 2);
            }
            other => panic!("unexpected directory: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "gateway_port = \"eight thousand\"").unwrap();
        assert!(matches!(load(file.path()), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = GatewayConfig::default();
        apply_overrides(&mut config, Some(9000), Some(PathBuf::from("x.db")));
        assert_eq!(config.gateway_port, 9000);
        assert_eq!(config.database, PathBuf::from("x.db"));

        apply_overrides(&mut config, None, None);
        assert_eq!(config.gateway_port, 9000);
    }
}
