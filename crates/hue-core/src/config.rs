use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use thiserror::Error;

use crate::models::{LedIndicatorMode, MacAddress};

pub const DEFAULT_BUTTON_TIMEOUT_SECS: u64 = 30;
pub const MAX_BUTTON_TIMEOUT_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_DECONZ_API_KEY: &str = "hue-emulator";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid MAC address format: {0:?} (expected XX:XX:XX:XX:XX:XX)")]
    InvalidMacFormat(String),
    #[error("invalid button timeout: {0:?} (expected 1 to 86400 seconds)")]
    InvalidTimeout(String),
    #[error("invalid LED indicator mode: {0:?} (expected off, on or auto)")]
    InvalidLedMode(String),
    #[error("invalid deCONZ address: {0:?}")]
    InvalidDeconzAddress(String),
    #[error("invalid bind address: {0:?}")]
    InvalidBindAddress(String),
    #[error("cannot create config path {path}: {source}")]
    ConfigPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Unvalidated startup parameters as they arrive from flags or environment.
#[derive(Debug, Clone, Default)]
pub struct RawFlags {
    pub mac: Option<String>,
    pub config_path: PathBuf,
    pub debug: bool,
    pub no_serve_https: bool,
    pub deconz: Option<String>,
    pub deconz_api_key: Option<String>,
    pub button_security: bool,
    pub button_timeout: Option<String>,
    pub led_indicator: Option<String>,
    pub host_address: Option<Ipv4Addr>,
    pub bind: Option<String>,
    pub http_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mac: MacAddress,
    pub config_path: PathBuf,
    pub debug: bool,
    pub https_disabled: bool,
    pub deconz_address: Option<String>,
    pub deconz_api_key: String,
    pub security_mode: bool,
    pub button_timeout_secs: u64,
    pub led_indicator_mode: LedIndicatorMode,
    pub host_address: Option<Ipv4Addr>,
    pub bind_address: IpAddr,
    pub http_port: u16,
}

impl Config {
    pub fn required_confirmations(&self) -> u32 {
        if self.security_mode {
            3
        } else {
            1
        }
    }

    pub fn indicators_enabled(&self) -> bool {
        self.led_indicator_mode.enabled(self.security_mode)
    }
}

pub fn load_config(raw: RawFlags) -> Result<Config, ConfigError> {
    let mac_raw = raw.mac.unwrap_or_default();
    let mac: MacAddress = mac_raw
        .parse()
        .map_err(|_| ConfigError::InvalidMacFormat(mac_raw.clone()))?;

    let button_timeout_secs = match raw.button_timeout {
        Some(value) => parse_timeout(&value)?,
        None => DEFAULT_BUTTON_TIMEOUT_SECS,
    };

    let led_indicator_mode = match raw.led_indicator {
        Some(value) => parse_led_mode(&value)?,
        None => LedIndicatorMode::default(),
    };

    let deconz_address = match raw.deconz.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(addr) if addr.contains(char::is_whitespace) || addr.contains('/') => {
            return Err(ConfigError::InvalidDeconzAddress(addr.to_string()));
        }
        Some(addr) => Some(addr.to_string()),
    };

    let bind_address = match raw.bind.as_deref().map(str::trim) {
        None | Some("") => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Some(addr) => addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(addr.to_string()))?,
    };

    fs::create_dir_all(&raw.config_path).map_err(|source| ConfigError::ConfigPath {
        path: raw.config_path.clone(),
        source,
    })?;

    Ok(Config {
        mac,
        config_path: raw.config_path,
        debug: raw.debug,
        https_disabled: raw.no_serve_https,
        deconz_address,
        deconz_api_key: raw
            .deconz_api_key
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DECONZ_API_KEY.to_string()),
        security_mode: raw.button_security,
        button_timeout_secs,
        led_indicator_mode,
        host_address: raw.host_address,
        bind_address,
        http_port: raw.http_port.unwrap_or(DEFAULT_HTTP_PORT),
    })
}

fn parse_timeout(value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if (1..=MAX_BUTTON_TIMEOUT_SECS).contains(&secs) => Ok(secs),
        _ => Err(ConfigError::InvalidTimeout(value.to_string())),
    }
}

fn parse_led_mode(value: &str) -> Result<LedIndicatorMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" | "false" => Ok(LedIndicatorMode::Off),
        "on" | "true" => Ok(LedIndicatorMode::On),
        "auto" => Ok(LedIndicatorMode::Auto),
        _ => Err(ConfigError::InvalidLedMode(value.to_string())),
    }
}
