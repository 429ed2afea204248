//! Save configuration.
//!
//! Priority: CLI flags → JSON config file → `H5J_THREADS` env var → defaults.
//! Out-of-range values never fail a save: they are logged and replaced.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::stack::BitDepth;

/// Highest CRF accepted by x265.
pub const MAX_CRF: i64 = 51;

/// Env var consulted for the worker count when no CLI/config value is set.
pub const THREADS_ENV: &str = "H5J_THREADS";

/// Default CRF for a stack of the given depth.
pub fn default_crf(bit_depth: BitDepth) -> u8 {
    match bit_depth {
        BitDepth::Eight => 15,
        BitDepth::Sixteen => 7,
    }
}

/// Linear intensity remap applied to 8-bit sources before truncation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntensityMap {
    pub min: f64,
    pub range: f64,
}

impl Default for IntensityMap {
    fn default() -> Self {
        Self { min: 0.0, range: 1.0 }
    }
}

/// Options for one save operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOptions {
    /// Packing worker cap; `None` uses all cores. Also passed to x265 as `pools`.
    pub threads: Option<usize>,
    /// Per-channel CRF, positional by channel index.
    pub crf: Vec<i64>,
    /// FFmpeg encoder name.
    pub codec: String,
    /// HEVC preset.
    pub preset: String,
    pub psy_rd: f32,
    /// Per-channel intensity remap for 8-bit stacks.
    pub intensity: Vec<IntensityMap>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            threads: None,
            crf: Vec::new(),
            codec: "libx265".to_string(),
            preset: "veryslow".to_string(),
            psy_rd: 1.0,
            intensity: Vec::new(),
        }
    }
}

impl SaveOptions {
    /// Load options from a JSON file (missing fields take defaults).
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Fill `threads` from `H5J_THREADS` when not set explicitly.
    pub fn with_env_fallback(mut self) -> Self {
        if self.threads.is_none()
            && let Ok(raw) = std::env::var(THREADS_ENV)
        {
            self.threads = parse_threads(&raw);
        }
        self
    }

    /// CRF for `channel`; missing or out-of-range entries fall back to the
    /// bit-depth default.
    pub fn crf_for(&self, channel: usize, bit_depth: BitDepth) -> u8 {
        match self.crf.get(channel) {
            Some(&crf) if (0..=MAX_CRF).contains(&crf) => crf as u8,
            Some(&crf) => {
                let fallback = default_crf(bit_depth);
                warn!(
                    "Channel {}: crf {} out of range 0..={}, using {}",
                    channel, crf, MAX_CRF, fallback
                );
                fallback
            }
            None => default_crf(bit_depth),
        }
    }

    /// Worker count: available cores capped by `threads`, at least 1.
    pub fn worker_count(&self) -> usize {
        let cores = num_cpus::get().max(1);
        match self.threads {
            Some(0) | None => cores,
            Some(n) => n.min(cores),
        }
    }

    /// Encoder tuning for `channel`.
    pub fn tuning_for(&self, channel: usize, bit_depth: BitDepth) -> EncoderTuning {
        EncoderTuning {
            crf: self.crf_for(channel, bit_depth),
            psy_rd: self.psy_rd,
            pools: self.threads.filter(|&n| n > 0),
        }
    }
}

/// Parse a thread count; malformed or zero values mean "use the default".
pub fn parse_threads(raw: &str) -> Option<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(_) => {
            warn!("Ignoring malformed thread count '{}'", raw);
            None
        }
    }
}

/// Parse a comma-separated CRF list; unparsable entries become -1 so they
/// fall back to the default for that channel position.
pub fn parse_crf_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(|item| {
            item.trim().parse::<i64>().unwrap_or_else(|_| {
                warn!("Ignoring malformed crf '{}'", item.trim());
                -1
            })
        })
        .collect()
}

/// x265 tuning passed through FFmpeg's `x265-params`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncoderTuning {
    pub crf: u8,
    pub psy_rd: f32,
    pub pools: Option<usize>,
}

impl EncoderTuning {
    /// `crf=<n>:psy-rd=<f>[:pools=<n>]`
    pub fn to_x265_params(&self) -> String {
        let mut params = format!("crf={}:psy-rd={:.1}", self.crf, self.psy_rd);
        if let Some(pools) = self.pools {
            params.push_str(&format!(":pools={}", pools));
        }
        params
    }
}
