use std::time::Duration;

use analyst_core::registry::PipelineKind;
use reqwest::Url;

use crate::reconnect::RetryPolicy;

const DEFAULT_STREAM_URL: &str = "http://localhost:8000/api";
const DEFAULT_CONNECT_RETRIES: u32 = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Stream controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Base address of the analysis API; stream paths are appended to it.
    pub base_url: Url,
    /// Which stage table the server runs.
    pub pipeline: PipelineKind,
    /// Retry policy for streams that fail to open.
    pub retry: RetryPolicy,
}

impl StreamConfig {
    /// Configuration with defaults for everything but the base address.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            pipeline: PipelineKind::default(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_pipeline(mut self, pipeline: PipelineKind) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                     |
    /// |---------------------------|-----------------------------|
    /// | `ANALYST_STREAM_URL`      | `http://localhost:8000/api` |
    /// | `ANALYST_PIPELINE`        | `standard`                  |
    /// | `ANALYST_CONNECT_RETRIES` | `2`                         |
    /// | `ANALYST_RETRY_DELAY_MS`  | `500`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("ANALYST_STREAM_URL").unwrap_or_else(|| DEFAULT_STREAM_URL.into());

        let pipeline = match lookup("ANALYST_PIPELINE") {
            Some(raw) => raw.parse::<PipelineKind>().map_err(|_| ConfigError::Invalid {
                key: "ANALYST_PIPELINE",
                value: raw,
            })?,
            None => PipelineKind::default(),
        };

        let max_retries: u32 = parse_number(&lookup, "ANALYST_CONNECT_RETRIES", DEFAULT_CONNECT_RETRIES)?;
        let delay_ms: u64 = parse_number(&lookup, "ANALYST_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?;

        let retry = RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(delay_ms),
            ..RetryPolicy::default()
        };

        Ok(Self::new(&base_url)?.with_pipeline(pipeline).with_retry(retry))
    }

    /// Stream endpoint for a single input.
    pub fn single_url(&self, input: &str) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["analyze", input, "stream"]);
        }
        url.into()
    }

    /// Fan-out stream endpoint for a batch of inputs.
    pub fn batch_url(&self, inputs: &[String]) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["analyze", "batch", "stream"]);
        }
        url.query_pairs_mut().append_pair("symbols", &inputs.join(","));
        url.into()
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl(format!(
            "{raw}: scheme must be http or https"
        )));
    }
    Ok(url)
}

fn parse_number<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid stream URL {0}")]
    InvalidUrl(String),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
