// src/config.rs
//
// Runtime configuration for the share application.
// Every field has a sensible default and can be overridden from the
// environment (or a .env file loaded by the binaries).

use log::{debug, warn};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Port the transfer server listens on and discovery advertises
pub const DEFAULT_PORT: u16 = 8080;

/// Service type shared by every participant
pub const DEFAULT_SERVICE_TYPE: &str = "_fileshare._tcp.local.";

/// Marker prefix carried by every instance name this application advertises
pub const DEFAULT_INSTANCE_PREFIX: &str = "LanShare-";

const DEFAULT_MAX_CONCURRENT_SENDS: usize = 4;
const RECEIVED_FILES_DIR: &str = "ReceivedFiles";

/// Configuration for discovery and file transfer
#[derive(Debug, Clone)]
pub struct ShareConfig {
    /// TCP port for the transfer server (also the advertised port)
    pub port: u16,

    /// mDNS service type to advertise and browse
    pub service_type: String,

    /// Prefix identifying our own advertised records
    pub instance_prefix: String,

    /// Human-readable device name embedded in the instance name
    pub device_name: String,

    /// Directory where incoming files are written
    pub receive_dir: PathBuf,

    /// Leave truncated files on disk when a receive fails
    pub keep_partial_files: bool,

    /// Upper bound on outbound transfers running at once
    pub max_concurrent_sends: usize,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            instance_prefix: DEFAULT_INSTANCE_PREFIX.to_string(),
            device_name: default_device_name(),
            receive_dir: default_receive_dir(),
            keep_partial_files: false,
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
        }
    }
}

impl ShareConfig {
    /// Build a configuration from `LANSHARE_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Missing keys keep their default; values that fail to parse are
    /// logged and also keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            port: parse_or(&lookup, "LANSHARE_PORT", defaults.port),
            service_type: lookup("LANSHARE_SERVICE_TYPE")
                .filter(|v| !v.trim().is_empty())
                .map(normalize_service_type)
                .unwrap_or(defaults.service_type),
            instance_prefix: lookup("LANSHARE_INSTANCE_PREFIX")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.instance_prefix),
            device_name: lookup("LANSHARE_DEVICE_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.device_name),
            receive_dir: lookup("LANSHARE_RECEIVE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.receive_dir),
            keep_partial_files: parse_or(
                &lookup,
                "LANSHARE_KEEP_PARTIAL",
                defaults.keep_partial_files,
            ),
            max_concurrent_sends: parse_or(
                &lookup,
                "LANSHARE_MAX_SENDS",
                defaults.max_concurrent_sends,
            )
            .max(1),
        };

        debug!("Loaded configuration: {:?}", config);
        config
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid value for {}: {:?}", key, raw);
                default
            }
        },
        None => default,
    }
}

/// mdns-sd only accepts fully qualified types ending in `.local.`
fn normalize_service_type(raw: String) -> String {
    let trimmed = raw.trim().trim_end_matches('.');
    if trimmed.ends_with(".local") {
        format!("{}.", trimmed)
    } else {
        format!("{}.local.", trimmed)
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "device".to_string())
}

fn default_receive_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(env::temp_dir)
        .join(RECEIVED_FILES_DIR)
}
