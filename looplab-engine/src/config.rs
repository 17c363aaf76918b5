//! Engine configuration
//!
//! The reference clamp bounds and timeouts are tied to the generation
//! service's cost/latency tradeoff, so they are settings with defaults,
//! not constants.

use looplab_timing::WindowParams;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for the playback engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Decode target sample rate for clip data
    pub target_sample_rate: u32,
    /// Time signature numerator used for whole-bar windows
    pub beats_per_bar: u32,
    /// Loop window derivation parameters
    pub window: WindowParams,
    /// Deadline for fetching one clip's encoded bytes
    pub fetch_timeout: Duration,
    /// Deadline for fallback elements to finish buffering
    pub fallback_ready_timeout: Duration,
    /// Position poll cadence for fallback loop emulation
    pub fallback_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 48000,
            beats_per_bar: 4,
            window: WindowParams::default(),
            fetch_timeout: Duration::from_secs(5),
            fallback_ready_timeout: Duration::from_secs(5),
            fallback_poll_interval: Duration::from_millis(30),
        }
    }
}

impl EngineConfig {
    /// Load config from the default location
    ///
    /// Returns defaults if the file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        Self::load_from(&path).unwrap_or_default()
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Save config to the default location
    pub fn save(&self) -> io::Result<()> {
        let path = Self::config_path();
        self.save_to(&path)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = self.serialize();
        fs::write(path, content)
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("looplab")
            .join("config.txt")
    }

    /// Parse config from simple key=value format
    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                match key {
                    "target_sample_rate" => {
                        if let Ok(v) = value.parse() {
                            config.target_sample_rate = v;
                        }
                    }
                    "beats_per_bar" => {
                        if let Ok(v) = value.parse() {
                            config.beats_per_bar = v;
                        }
                    }
                    "window_floor_secs" => {
                        if let Ok(v) = value.parse() {
                            config.window.floor_secs = v;
                        }
                    }
                    "window_tolerance_min_secs" => {
                        if let Ok(v) = value.parse() {
                            config.window.tolerance_min_secs = v;
                        }
                    }
                    "window_tolerance_max_secs" => {
                        if let Ok(v) = value.parse() {
                            config.window.tolerance_max_secs = v;
                        }
                    }
                    "fetch_timeout_ms" => {
                        if let Ok(v) = value.parse() {
                            config.fetch_timeout = Duration::from_millis(v);
                        }
                    }
                    "fallback_ready_timeout_ms" => {
                        if let Ok(v) = value.parse() {
                            config.fallback_ready_timeout = Duration::from_millis(v);
                        }
                    }
                    "fallback_poll_interval_ms" => {
                        if let Ok(v) = value.parse() {
                            config.fallback_poll_interval = Duration::from_millis(v);
                        }
                    }
                    _ => {} // Ignore unknown keys
                }
            }
        }

        config
    }

    /// Serialize config to simple key=value format
    fn serialize(&self) -> String {
        let lines = vec![
            "# LoopLab Configuration".to_string(),
            format!("target_sample_rate={}", self.target_sample_rate),
            format!("beats_per_bar={}", self.beats_per_bar),
            format!("window_floor_secs={}", self.window.floor_secs),
            format!(
                "window_tolerance_min_secs={}",
                self.window.tolerance_min_secs
            ),
            format!(
                "window_tolerance_max_secs={}",
                self.window.tolerance_max_secs
            ),
            format!("fetch_timeout_ms={}", self.fetch_timeout.as_millis()),
            format!(
                "fallback_ready_timeout_ms={}",
                self.fallback_ready_timeout.as_millis()
            ),
            format!(
                "fallback_poll_interval_ms={}",
                self.fallback_poll_interval.as_millis()
            ),
        ];

        lines.join("\n")
    }
}
