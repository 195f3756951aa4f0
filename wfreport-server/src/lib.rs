pub mod http;

use std::sync::Arc;

use anyhow::{bail, Result};
use wfreport_core::config::ReasoningConfig;
use wfreport_core::reasoning::{OpenAiReasoningClient, ReasoningBackend, ReasoningClientConfig};

/// Build the reasoning backend named by `[reasoning].backend`.
/// The API key comes from `OPENAI_API_KEY` unless `api_key` is given.
pub fn reasoner_from_config(
    config: &ReasoningConfig,
    api_key: Option<String>,
) -> Result<Arc<dyn ReasoningBackend>> {
    match config.backend.as_str() {
        "openai" => {
            let client_config = ReasoningClientConfig {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                max_retries: config.max_retries,
                ..ReasoningClientConfig::new(api_key, config.model.clone())
            };
            let client = OpenAiReasoningClient::with_base_url(client_config, config.base_url.clone())?;
            Ok(Arc::new(client))
        }
        other => bail!("unknown reasoning backend '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // TEST 1: openai backend builds with an explicit key
    // ========================================================================
    #[test]
    fn test_openai_backend_with_key() {
        let backend = reasoner_from_config(&ReasoningConfig::default(), Some("sk-test".into())).unwrap();
        assert_eq!(backend.name(), "openai");
    }

    // ========================================================================
    // TEST 2: unknown backend is rejected
    // ========================================================================
    #[test]
    fn test_unknown_backend_rejected() {
        let config = ReasoningConfig {
            backend: "carrier-pigeon".into(),
            ..ReasoningConfig::default()
        };
        let err = reasoner_from_config(&config, Some("sk-test".into())).err().unwrap();
        assert!(err.to_string().contains("carrier-pigeon"));
    }
}
