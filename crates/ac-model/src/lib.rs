// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod registry;
pub mod sanitize;
pub(crate) mod openai_compat;
mod types;
mod provider;
mod openai;
mod anthropic;
mod mock;

pub use catalog::{ModelCatalogEntry, InputModality};
pub use types::*;
pub use provider::{ModelProvider, ResponseStream};
pub use openai::OpenAiProvider;
pub use anthropic::AnthropicProvider;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use registry::{DriverMeta, get_driver, list_drivers};

use anyhow::bail;
use ac_config::Config;

/// Construct a boxed [`ModelProvider`] from the top-level [`Config`] (spec.md §6.5).
///
/// Selects the driver implementation based on `cfg.provider`. When
/// `cfg.model` is not found in the static catalog, a conservative
/// `max_output_tokens` default of 4096 is used.
pub fn from_config(cfg: &Config) -> anyhow::Result<Box<dyn ModelProvider>> {
    let key = || resolve_api_key(cfg);
    let resolved_max_tokens = catalog::lookup(&cfg.provider, &cfg.model).map(|e| e.max_output_tokens);
    let extra_headers: Vec<(String, String)> = cfg
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match cfg.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(
            cfg.model.clone(),
            key(),
            cfg.base_url.clone(),
            resolved_max_tokens,
            Some(cfg.temperature),
            serde_json::Value::Object(Default::default()),
        ))),
        "anthropic" => Ok(Box::new(AnthropicProvider::with_cache(
            cfg.model.clone(),
            key(),
            cfg.base_url.clone(),
            resolved_max_tokens,
            Some(cfg.temperature),
            true,  // cache_system_prompt
            false, // extended_cache_time
            true,  // cache_tools
            true,  // cache_conversation
            true,  // cache_images
            true,  // cache_tool_results
        ))),
        "ollama" => Ok(Box::new(openai_compat::OpenAICompatProvider::new(
            "ollama",
            cfg.model.clone(),
            None,
            cfg.base_url.as_deref().unwrap_or("http://localhost:11434/v1"),
            resolved_max_tokens,
            Some(cfg.temperature),
            extra_headers,
            openai_compat::AuthStyle::None,
            serde_json::Value::Object(Default::default()),
        ))),
        "mock" => Ok(Box::new(MockProvider)),
        other => {
            let known: Vec<&str> = registry::known_driver_ids().collect();
            bail!(
                "unknown model provider: {other:?}\n\
                 Known providers: {known}",
                known = known.join(", ")
            )
        }
    }
}

fn resolve_api_key(cfg: &Config) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    if let Some(meta) = registry::get_driver(&cfg.provider) {
        if let Some(env_var) = meta.default_api_key_env {
            return std::env::var(env_var).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(provider: &str, model: &str) -> Config {
        Config {
            provider: provider.into(),
            model: model.into(),
            ..Config::default()
        }
    }

    #[test]
    fn from_config_openai_succeeds() {
        let cfg = minimal_config("openai", "gpt-4o");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_anthropic_succeeds() {
        let cfg = minimal_config("anthropic", "claude-opus-4-5");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_mock_succeeds() {
        let cfg = minimal_config("mock", "mock-model");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_ollama_requires_no_key() {
        let cfg = minimal_config("ollama", "llama3.2");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_unknown_provider_returns_error() {
        let cfg = minimal_config("totally_unknown_provider_xyz", "some-model");
        let result = from_config(&cfg);
        assert!(result.is_err());
        let msg = result.err().unwrap().to_string();
        assert!(msg.contains("unknown model provider"));
    }

    #[test]
    fn resolve_api_key_prefers_explicit_key() {
        let cfg = Config {
            api_key: Some("explicit-key".into()),
            api_key_env: Some("NONEXISTENT_ENV_VAR_XYZ".into()),
            ..Config::default()
        };
        let key = resolve_api_key(&cfg);
        assert_eq!(key.as_deref(), Some("explicit-key"));
    }

    #[test]
    fn resolve_api_key_falls_back_to_registry_default_env() {
        let cfg = minimal_config("openai", "gpt-4o");
        // ANTHROPIC_API_KEY / OPENAI_API_KEY are unset in the test environment,
        // so this should resolve to None rather than panic.
        let _ = resolve_api_key(&cfg);
    }

    #[test]
    fn all_registry_drivers_have_constructors() {
        for meta in list_drivers() {
            let cfg = minimal_config(meta.id, "test-model");
            let result = from_config(&cfg);
            if let Err(e) = result {
                let msg = e.to_string();
                assert!(
                    !msg.contains("unknown model provider"),
                    "driver {id} is in registry but not handled by from_config: {msg}",
                    id = meta.id
                );
            }
        }
    }
}
