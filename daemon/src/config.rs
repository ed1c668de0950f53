//! Daemon configuration file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use loopfx_dsp::PrefValue;
use loopfx_ipc::{BlockedApp, DumpMethod, ServiceConfig};

/// A session the simulated platform reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedSession {
    pub session_id: i32,
    pub uid: i32,
    pub package_name: String,
    #[serde(default = "default_usage")]
    pub usage: String,
    /// Whether the package allows its playback to be captured.
    #[serde(default = "default_true")]
    pub capture_allowed: bool,
}

fn default_usage() -> String {
    "USAGE_MEDIA".to_string()
}

fn default_true() -> bool {
    true
}

/// Everything the daemon reads at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub own_uid: i32,
    pub own_package: String,
    pub service: ServiceConfig,
    pub dump_method: DumpMethod,
    pub blocklist: Vec<BlockedApp>,
    /// DSP preferences as `{"namespace": {"key": value}}`.
    pub preferences: HashMap<String, HashMap<String, PrefValue>>,
    pub sessions: Vec<SimulatedSession>,
    /// Sample rate reported by the simulated HAL.
    pub sample_rate: Option<u32>,
    /// Stop after this many seconds; run until `quit` otherwise.
    pub run_seconds: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            own_uid: 10_001,
            own_package: "me.loopfx".to_string(),
            service: ServiceConfig::default(),
            dump_method: DumpMethod::default(),
            blocklist: Vec::new(),
            preferences: HashMap::new(),
            sessions: Vec::new(),
            sample_rate: Some(48_000),
            run_seconds: None,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No configuration file given, using defaults");
            return Ok(Self::default());
        };

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_json(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), sessions = config.sessions.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
