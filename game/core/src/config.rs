//! Process config: required environment variables plus an optional `ProtocolLimits` TOML
//! overlay (spec §6, SPEC_FULL §4.10).
//!
//! Mirrors the teacher's `gamecore::config::GameConfig` split: the *process* surface
//! (ports, path, logging) is read strictly from the environment and fails fast if a
//! required variable is missing or unparsable, while *protocol tuning* keeps
//! `corenet::ProtocolLimits`'s own `Default`/file-overlay split (`RT_CONFIG`) untouched.
use corenet::ProtocolLimits;
use flux::logging::LogConfig;
use std::env;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("environment variable {0} is not a valid value: {1}")]
    InvalidVar(&'static str, String),
    #[error("failed loading RT_CONFIG overlay: {0}")]
    Overlay(#[from] serdeconv::Error),
}

/// Everything `game/server`'s bootstrap needs to start listening (spec §6 "Environment
/// variables").
pub struct RuntimeConfig {
    pub ws_port: u16,
    pub ws_path: String,
    pub udp_port: u16,
    pub log: LogConfig,
    pub limits: ProtocolLimits,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<RuntimeConfig, ConfigError> {
        let ws_port = required_parsed("WS_PORT")?;
        let ws_path = required("WS_PATH")?;
        let udp_port = required_parsed("UDP_PORT")?;
        let log = LogConfig::from_env();
        let limits = match env::var("RT_CONFIG") {
            Ok(path) => ProtocolLimits::load(Some(Path::new(&path)))?,
            Err(_) => ProtocolLimits::default(),
        };
        Ok(RuntimeConfig { ws_port, ws_path, udp_port, log, limits })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn required_parsed<T: std::str::FromStr>(name: &'static str) -> Result<T, ConfigError> {
    let raw = required(name)?;
    raw.parse().map_err(|_| ConfigError::InvalidVar(name, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_required_var_fails_fast() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("WS_PORT");
        env::remove_var("WS_PATH");
        env::remove_var("UDP_PORT");
        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("WS_PORT")));
    }

    #[test]
    fn unparsable_port_is_reported() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("WS_PORT", "not-a-port");
        env::set_var("WS_PATH", "/ws");
        env::set_var("UDP_PORT", "9001");
        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar("WS_PORT", _)));
        env::remove_var("WS_PORT");
        env::remove_var("WS_PATH");
        env::remove_var("UDP_PORT");
    }

    #[test]
    fn valid_env_produces_config_with_default_limits() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("WS_PORT", "8080");
        env::set_var("WS_PATH", "/ws");
        env::set_var("UDP_PORT", "9001");
        env::remove_var("RT_CONFIG");
        let cfg = RuntimeConfig::from_env().unwrap();
        assert_eq!(cfg.ws_port, 8080);
        assert_eq!(cfg.ws_path, "/ws");
        assert_eq!(cfg.udp_port, 9001);
        assert_eq!(cfg.limits.attempt_count, ProtocolLimits::default().attempt_count);
        env::remove_var("WS_PORT");
        env::remove_var("WS_PATH");
        env::remove_var("UDP_PORT");
    }
}
