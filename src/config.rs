use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::SLOT_BOUNDARY_NUDGE_SECS;
use crate::model::Secs;

/// Per-engine tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Inward pull applied to both ends of a slot range before the overlap
    /// comparison. Zero makes back-to-back slots collide.
    pub slot_nudge_secs: Secs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_nudge_secs: SLOT_BOUNDARY_NUDGE_SECS,
        }
    }
}

/// Server configuration, read from `TIMETABLER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: parsed(&lookup, "TIMETABLER_PORT").unwrap_or(5433),
            bind: lookup("TIMETABLER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(
                lookup("TIMETABLER_DATA_DIR").unwrap_or_else(|| "./data".into()),
            ),
            password: lookup("TIMETABLER_PASSWORD").unwrap_or_else(|| "timetabler".into()),
            max_connections: parsed(&lookup, "TIMETABLER_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "TIMETABLER_COMPACT_THRESHOLD").unwrap_or(1000),
            tls_cert: lookup("TIMETABLER_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("TIMETABLER_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&lookup, "TIMETABLER_METRICS_PORT"),
            engine: EngineConfig {
                slot_nudge_secs: parsed(&lookup, "TIMETABLER_SLOT_NUDGE_SECS")
                    .filter(|n: &Secs| *n >= 0)
                    .unwrap_or(SLOT_BOUNDARY_NUDGE_SECS),
            },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
