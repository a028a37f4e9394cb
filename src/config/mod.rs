use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.ultracontext.ai";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Configuration for an UltraContext client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the context API
    pub base_url: String,

    /// API key sent as a bearer token (optional)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout in milliseconds applied by the HTTP transports
    pub timeout_ms: u64,

    /// User-Agent header value
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            user_agent: default_user_agent(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sub-millisecond timeouts round up to one millisecond
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(u64::MAX);
        self
    }

    /// Zero means the default
    pub fn timeout(&self) -> Duration {
        match self.timeout_ms {
            0 => Duration::from_millis(DEFAULT_TIMEOUT_MS),
            ms => Duration::from_millis(ms),
        }
    }

    /// Load configuration from defaults, `config/ultracontext.toml` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new("config/ultracontext.toml"))
    }

    /// Load configuration using `path` as the optional config file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        // Override with environment variables (e.g., ULTRACONTEXT__API_KEY=...)
        Self::load_layers(
            path,
            Some(Environment::with_prefix("ULTRACONTEXT").separator("__")),
        )
    }

    fn load_layers(path: &Path, environment: Option<Environment>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            // Start with defaults
            .set_default("base_url", DEFAULT_BASE_URL)?
            .set_default("timeout_ms", DEFAULT_TIMEOUT_MS)?
            .set_default("user_agent", default_user_agent())?
            // Load from config file if it exists
            .add_source(File::from(path).required(false));
        if let Some(environment) = environment {
            builder = builder.add_source(environment);
        }

        let config: Self = builder.build()?.try_deserialize()?;
        if config.timeout_ms == 0 {
            return Err(ConfigError::Message(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }

    /// Headers sent with every request
    pub fn default_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), self.user_agent.clone()),
        ];
        if let Some(api_key) = self.api_key.as_deref().filter(|key| !key.trim().is_empty()) {
            headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));
        }
        headers
    }
}

fn default_user_agent() -> String {
    format!("ultracontext-rust/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use test_case::test_case;

    fn temp_config(contents: &str) -> PathBuf {
        let mut file = std::env::temp_dir();
        file.push(format!("ultracontext-config-{}.toml", uuid::Uuid::new_v4()));
        let mut handle = std::fs::File::create(&file).unwrap();
        writeln!(handle, "{contents}").unwrap();
        file
    }

    #[test]
    fn file_values_override_defaults() {
        let file = temp_config("base_url = \"http://localhost:9999\"\ntimeout_ms = 1500");

        let config = ClientConfig::load_layers(&file, None).unwrap();
        std::fs::remove_file(&file).ok();

        assert_eq!(config.base_url, "http://localhost:9999");
        assert_eq!(config.timeout(), Duration::from_millis(1500));
        assert!(config.user_agent.starts_with("ultracontext-rust/"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ClientConfig::load_layers(Path::new("does/not/exist.toml"), None).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn zero_timeout_in_file_is_rejected() {
        let file = temp_config("timeout_ms = 0");
        let result = ClientConfig::load_layers(&file, None);
        std::fs::remove_file(&file).ok();

        let error = result.unwrap_err();
        assert!(error.to_string().contains("timeout_ms"));
    }

    #[test_case(Duration::from_millis(500), Duration::from_millis(500) ; "half a second")]
    #[test_case(Duration::from_micros(200), Duration::from_millis(1) ; "rounds up below a millisecond")]
    #[test_case(Duration::ZERO, Duration::from_millis(DEFAULT_TIMEOUT_MS) ; "zero means default")]
    fn builder_timeout_keeps_sub_second_precision(requested: Duration, effective: Duration) {
        let config = ClientConfig::new("http://h").with_timeout(requested);
        assert_eq!(config.timeout(), effective);
        assert!(config.timeout() > Duration::ZERO);
    }

    #[test]
    fn api_key_becomes_bearer_header() {
        let headers = ClientConfig::new("http://h").with_api_key("uc_123").default_headers();
        assert!(headers.contains(&("Authorization".to_string(), "Bearer uc_123".to_string())));

        let headers = ClientConfig::new("http://h").with_api_key("  ").default_headers();
        assert!(headers.iter().all(|(name, _)| name != "Authorization"));
    }
}
