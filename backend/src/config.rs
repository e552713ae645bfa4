use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub session: SessionConfig,
    pub query: QueryConfig,
    pub context: ContextConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one SQLite file per uploaded dataset
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub max_upload_bytes: usize,
    /// Non-empty values per column scanned during type inference
    pub inference_sample_size: usize,
    /// Records parsed per candidate during delimiter detection
    pub delimiter_sample_rows: usize,
    /// Sample values kept on each column for previews
    pub sample_values: usize,
    /// Encoding labels probed in order after BOM sniffing
    pub encodings: Vec<String>,
    pub max_warnings: usize,
    /// Concurrent ingestions; 0 means one per CPU
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub row_cap: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    pub max_chars: usize,
    pub sample_values: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file before reading overrides
        let _ = dotenv::dotenv();

        let mut builder = Self::defaults()?;

        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("DATA_DIR", "storage.data_dir"),
            ("MAX_UPLOAD_BYTES", "ingest.max_upload_bytes"),
            ("SESSION_TTL_SECS", "session.ttl_secs"),
            ("SWEEP_INTERVAL_SECS", "session.sweep_interval_secs"),
            ("QUERY_ROW_CAP", "query.row_cap"),
            ("QUERY_TIMEOUT_SECS", "query.timeout_secs"),
            ("CONTEXT_MAX_CHARS", "context.max_chars"),
            ("LLM_GATEWAY_URL", "llm.gateway_url"),
            ("LLM_TIMEOUT_SECS", "llm.timeout_secs"),
            ("RUST_LOG", "logging.level"),
            ("RUST_LOG_STYLE", "logging.style"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        if let Ok(api_key) = env::var("LLM_API_KEY") {
            builder = builder.set_override("llm.api_key", Some(api_key))?;
        }

        if let Ok(encodings) = env::var("INGEST_ENCODINGS") {
            let labels: Vec<String> = encodings
                .split(',')
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
                .collect();
            builder = builder.set_override("ingest.encodings", labels)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate().map_err(config::ConfigError::Message)?;
        Ok(config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("storage.data_dir", "./data/datasets")?
            .set_default("ingest.max_upload_bytes", 50 * 1024 * 1024)?
            .set_default("ingest.inference_sample_size", 1000)?
            .set_default("ingest.delimiter_sample_rows", 50)?
            .set_default("ingest.sample_values", 5)?
            .set_default("ingest.encodings", vec!["utf-8", "windows-1252"])?
            .set_default("ingest.max_warnings", 100)?
            .set_default("ingest.max_concurrent", 0)?
            .set_default("session.ttl_secs", 24 * 60 * 60)?
            .set_default("session.sweep_interval_secs", 300)?
            .set_default("query.row_cap", 1000)?
            .set_default("query.timeout_secs", 30)?
            .set_default("context.max_chars", 6000)?
            .set_default("context.sample_values", 3)?
            .set_default("llm.gateway_url", "")?
            .set_default("llm.timeout_secs", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")
    }

    /// Reject settings that would make uploads or queries unbounded
    pub fn validate(&self) -> Result<(), String> {
        if self.query.row_cap == 0 {
            return Err("query.row_cap must be greater than 0".to_string());
        }
        if self.query.timeout_secs == 0 {
            return Err("query.timeout_secs must be greater than 0".to_string());
        }
        if self.ingest.max_upload_bytes == 0 {
            return Err("ingest.max_upload_bytes must be greater than 0".to_string());
        }
        if self.ingest.inference_sample_size == 0 || self.ingest.delimiter_sample_rows == 0 {
            return Err("ingest sample sizes must be greater than 0".to_string());
        }
        if self.ingest.encodings.is_empty() {
            return Err("ingest.encodings must name at least one encoding".to_string());
        }
        for label in &self.ingest.encodings {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                return Err(format!("Unknown encoding label in ingest.encodings: {}", label));
            }
        }
        if !self.llm.gateway_url.is_empty() {
            url::Url::parse(&self.llm.gateway_url)
                .map_err(|e| format!("Invalid llm.gateway_url: {}", e))?;
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }

    /// Sweep interval, falling back to 60 seconds when configured as zero
    /// (tokio::time::interval panics on a zero period)
    pub fn sweep_interval(&self) -> Duration {
        if self.session.sweep_interval_secs == 0 {
            tracing::warn!("session.sweep_interval_secs is 0, using default of 60 seconds");
            Duration::from_secs(60)
        } else {
            Duration::from_secs(self.session.sweep_interval_secs)
        }
    }

    pub fn max_concurrent_ingests(&self) -> usize {
        if self.ingest.max_concurrent == 0 {
            num_cpus::get().max(1)
        } else {
            self.ingest.max_concurrent
        }
    }

    /// Build a config from defaults only, pointing stores at `data_dir`
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Result<Self, config::ConfigError> {
        let data_dir: PathBuf = data_dir.into();
        let config: Config = Self::defaults()?
            .set_override("storage.data_dir", data_dir.to_string_lossy().to_string())?
            .build()?
            .try_deserialize()?;
        config.validate().map_err(config::ConfigError::Message)?;
        Ok(config)
    }
}
