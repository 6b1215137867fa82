use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use texforge_comfyui::api::ApiTimeouts;
use texforge_comfyui::connection::DEFAULT_BACKEND_URL;
use texforge_core::engine::DEFAULT_OUTPUT_SUBFOLDER;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Session configuration loaded from environment variables.
///
/// All fields have defaults suitable for a backend on the local machine.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Backend base URL.
    pub backend_url: String,
    /// Window without a job state transition before the job fails.
    pub job_timeout_secs: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// HTTP connect timeout.
    pub connect_timeout_secs: u64,
    /// Interval between poll steps when the session drives polling.
    pub poll_interval_ms: u64,
    /// Age after which the capability snapshot is re-probed before binding.
    pub capability_ttl_secs: u64,
    /// History document location; in-memory history when unset.
    pub history_path: Option<PathBuf>,
    /// Backend output subfolder for saved images.
    pub output_subfolder: String,
    /// Whether to follow live progress over the WebSocket.
    pub stream_progress: bool,
    /// Reject backends older than this version.
    pub min_backend_version: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            job_timeout_secs: 120,
            request_timeout_secs: 15,
            connect_timeout_secs: 5,
            poll_interval_ms: 1000,
            capability_ttl_secs: 30,
            history_path: None,
            output_subfolder: DEFAULT_OUTPUT_SUBFOLDER.to_string(),
            stream_progress: true,
            min_backend_version: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `TEXFORGE_BACKEND_URL`           | `http://127.0.0.1:8188` |
    /// | `TEXFORGE_JOB_TIMEOUT_SECS`      | `120`                   |
    /// | `TEXFORGE_REQUEST_TIMEOUT_SECS`  | `15`                    |
    /// | `TEXFORGE_CONNECT_TIMEOUT_SECS`  | `5`                     |
    /// | `TEXFORGE_POLL_INTERVAL_MS`      | `1000`                  |
    /// | `TEXFORGE_CAPABILITY_TTL_SECS`   | `30`                    |
    /// | `TEXFORGE_HISTORY_PATH`          | unset (in memory)       |
    /// | `TEXFORGE_OUTPUT_SUBFOLDER`      | `texforge`              |
    /// | `TEXFORGE_STREAM_PROGRESS`       | `true`                  |
    /// | `TEXFORGE_MIN_BACKEND_VERSION`   | unset                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let job_timeout_secs = non_zero(
            "TEXFORGE_JOB_TIMEOUT_SECS",
            parse(&get, "TEXFORGE_JOB_TIMEOUT_SECS", defaults.job_timeout_secs)?,
        )?;
        let poll_interval_ms = non_zero(
            "TEXFORGE_POLL_INTERVAL_MS",
            parse(&get, "TEXFORGE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
        )?;

        Ok(Self {
            backend_url: get("TEXFORGE_BACKEND_URL").unwrap_or(defaults.backend_url),
            job_timeout_secs,
            request_timeout_secs: parse(
                &get,
                "TEXFORGE_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            connect_timeout_secs: parse(
                &get,
                "TEXFORGE_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            )?,
            poll_interval_ms,
            capability_ttl_secs: parse(
                &get,
                "TEXFORGE_CAPABILITY_TTL_SECS",
                defaults.capability_ttl_secs,
            )?,
            history_path: get("TEXFORGE_HISTORY_PATH").map(PathBuf::from),
            output_subfolder: get("TEXFORGE_OUTPUT_SUBFOLDER").unwrap_or(defaults.output_subfolder),
            stream_progress: parse_bool(&get, "TEXFORGE_STREAM_PROGRESS", defaults.stream_progress)?,
            min_backend_version: get("TEXFORGE_MIN_BACKEND_VERSION"),
        })
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn capability_ttl(&self) -> Duration {
        Duration::from_secs(self.capability_ttl_secs)
    }

    pub fn api_timeouts(&self) -> ApiTimeouts {
        ApiTimeouts {
            request: Duration::from_secs(self.request_timeout_secs),
            connect: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn non_zero(var: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value,
                reason: "expected true or false".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.job_timeout(), Duration::from_secs(120));
        assert_eq!(config.api_timeouts().request, Duration::from_secs(15));
        assert!(config.stream_progress);
        assert!(config.history_path.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("TEXFORGE_BACKEND_URL", "http://gpu-box:8188"),
            ("TEXFORGE_JOB_TIMEOUT_SECS", "300"),
            ("TEXFORGE_POLL_INTERVAL_MS", "250"),
            ("TEXFORGE_HISTORY_PATH", "/tmp/history.json"),
            ("TEXFORGE_STREAM_PROGRESS", "off"),
            ("TEXFORGE_MIN_BACKEND_VERSION", "0.3.0"),
        ])
        .unwrap();
        assert_eq!(config.backend_url, "http://gpu-box:8188");
        assert_eq!(config.job_timeout_secs, 300);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.history_path, Some(PathBuf::from("/tmp/history.json")));
        assert!(!config.stream_progress);
        assert_eq!(config.min_backend_version.as_deref(), Some("0.3.0"));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("TEXFORGE_BACKEND_URL", "  "), ("TEXFORGE_OUTPUT_SUBFOLDER", "")]).unwrap();
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.output_subfolder, DEFAULT_OUTPUT_SUBFOLDER);
    }

    #[test]
    fn invalid_values_are_errors() {
        assert_matches!(
            load(&[("TEXFORGE_JOB_TIMEOUT_SECS", "soon")]),
            Err(ConfigError::Invalid { var: "TEXFORGE_JOB_TIMEOUT_SECS", .. })
        );
        assert_matches!(
            load(&[("TEXFORGE_JOB_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Invalid { .. })
        );
        assert_matches!(
            load(&[("TEXFORGE_POLL_INTERVAL_MS", "0")]),
            Err(ConfigError::Invalid { var: "TEXFORGE_POLL_INTERVAL_MS", .. })
        );
        assert_matches!(
            load(&[("TEXFORGE_STREAM_PROGRESS", "maybe")]),
            Err(ConfigError::Invalid { var: "TEXFORGE_STREAM_PROGRESS", .. })
        );
    }
}
