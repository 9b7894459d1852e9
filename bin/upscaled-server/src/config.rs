//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use upscaled_core::api;
use upscaled_core::engine::DEFAULT_MAX_INPUT_PIXELS;
use upscaled_core::engine::candle::{DevicePreference, ModelConfig};

/// Runtime configuration for upscaled-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind (default: `"127.0.0.1"`).
    pub host: String,

    /// TCP port (default: `5000`).
    pub port: u16,

    /// Root of the `uploads/` and `outputs/` directories (default: `"."`).
    pub data_dir: PathBuf,

    /// Generator weights, `.pth` or `.safetensors` (default: `"generator.pth"`).
    pub model_path: PathBuf,

    /// `auto`, `cpu`, `cuda` or `metal`.
    pub device: DevicePreference,

    /// `tracing` filter string, e.g. `"info"` or `"debug,upscaled_core=trace"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    pub max_upload_bytes: usize,

    /// Largest decoded image accepted, in pixels (default: `512 * 512`).
    pub max_input_pixels: u64,
    pub queue_capacity: usize,
    pub max_workers: usize,
    pub engine_instances: usize,
    pub job_timeout_secs: u64,

    /// `0` disables automatic eviction.
    pub task_ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = api::Config::default();
        Self {
            host: env_or("UPSCALED_HOST", "127.0.0.1"),
            port: parse_env("UPSCALED_PORT", 5000),
            data_dir: PathBuf::from(env_or("UPSCALED_DATA_DIR", ".")),
            model_path: PathBuf::from(env_or("UPSCALED_MODEL_PATH", "generator.pth")),
            device: parse_env("UPSCALED_DEVICE", DevicePreference::Auto),
            log_level: env_or("UPSCALED_LOG", "info"),
            log_json: std::env::var("UPSCALED_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            max_upload_bytes: parse_env("UPSCALED_MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
            max_input_pixels: parse_env("UPSCALED_MAX_INPUT_PIXELS", DEFAULT_MAX_INPUT_PIXELS),
            queue_capacity: parse_env("UPSCALED_QUEUE_CAPACITY", defaults.queue_capacity),
            max_workers: parse_env("UPSCALED_MAX_WORKERS", defaults.max_workers),
            engine_instances: parse_env("UPSCALED_ENGINE_INSTANCES", defaults.engine_instances),
            job_timeout_secs: parse_env("UPSCALED_JOB_TIMEOUT_SECS", defaults.job_timeout.as_secs()),
            task_ttl_secs: parse_env("UPSCALED_TASK_TTL_SECS", 0),
            reap_interval_secs: parse_env(
                "UPSCALED_REAP_INTERVAL_SECS",
                defaults.reap_interval.as_secs(),
            ),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn core_config(&self) -> api::Config {
        api::Config {
            data_dir: self.data_dir.clone(),
            max_upload_bytes: self.max_upload_bytes,
            queue_capacity: self.queue_capacity,
            max_workers: self.max_workers,
            engine_instances: self.engine_instances,
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            task_ttl: (self.task_ttl_secs > 0).then(|| Duration::from_secs(self.task_ttl_secs)),
            reap_interval: Duration::from_secs(self.reap_interval_secs),
            ..api::Config::default()
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            weights_path: self.model_path.clone(),
            device: self.device,
            max_input_pixels: self.max_input_pixels,
            ..ModelConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let defaults = api::Config::default();
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            data_dir: defaults.data_dir,
            model_path: PathBuf::from("generator.pth"),
            device: DevicePreference::Auto,
            log_level: "info".into(),
            log_json: false,
            max_upload_bytes: defaults.max_upload_bytes,
            max_input_pixels: DEFAULT_MAX_INPUT_PIXELS,
            queue_capacity: defaults.queue_capacity,
            max_workers: defaults.max_workers,
            engine_instances: defaults.engine_instances,
            job_timeout_secs: defaults.job_timeout.as_secs(),
            task_ttl_secs: 0,
            reap_interval_secs: defaults.reap_interval.as_secs(),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
