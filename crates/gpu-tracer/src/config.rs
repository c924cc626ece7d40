use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tracer settings, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Emit CPU-side begin/end events for every span.
    pub service_tracing: bool,
    /// Measure spans on the device with timer queries when supported.
    pub device_tracing: bool,
    /// Wrap each decoding cycle in its own span on the reserved source.
    pub trace_decoding_cycles: bool,
    /// Name of the background emission thread.
    pub output_thread_name: String,
    /// Bound on queued, not yet emitted events. `None` means unbounded.
    pub output_queue_capacity: Option<usize>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            service_tracing: true,
            device_tracing: true,
            trace_decoding_cycles: false,
            output_thread_name: "gpu-tracer-output".into(),
            output_queue_capacity: None,
        }
    }
}

impl TracerConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("failed to parse tracer config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read tracer config {}", path.display()))?;
        Self::from_json_str(&contents)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to encode tracer config")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write tracer config {}", path.display()))
    }

    /// Loads `<config dir>/GpuTracer/tracer.json`. Returns defaults if the
    /// file is missing or malformed.
    pub fn load_default() -> Self {
        let Some(path) = default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(target: "gpu_tracer", ?err, "ignoring tracer config");
                Self::default()
            }
        }
    }
}

fn default_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir()?;
    base.push("GpuTracer");
    base.push("tracer.json");
    Some(base)
}
