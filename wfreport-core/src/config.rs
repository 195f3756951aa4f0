use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
}

fn default_fetch_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchemaConfig {
    /// JSON schema definition loaded at startup.
    pub path: String,
    /// Database schema searched by `--dump-schema`.
    #[serde(default = "default_introspection_schema")]
    pub introspection_schema: String,
    /// Tables `--dump-schema` introspects.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

fn default_introspection_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 200,
            max_limit: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    pub backend: String,
    pub model: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            backend: "openai".to_string(),
            model: "gpt-4o".to_string(),
            base_url: crate::reasoning::DEFAULT_BASE_URL.to_string(),
            timeout_seconds: 60,
            max_tokens: 1200,
            temperature: 0.0,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 7878,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "~/.wfreport/audit.jsonl".to_string(),
        }
    }
}

impl ReportConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }
}
