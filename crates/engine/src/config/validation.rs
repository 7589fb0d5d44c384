use std::collections::HashSet;

use promptloop_common::config::{LlmConfig, SystemConfig};

use super::loader::ConfigError;
use crate::llm::retry::MAX_RETRIES_CAP;

/// Validate the complete configuration.
///
/// Collects every problem rather than stopping at the first.
pub fn validate(config: &SystemConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_llm(&config.llm, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

fn validate_llm(llm: &LlmConfig, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();

    for (i, provider) in llm.providers.iter().enumerate() {
        if let Some(name) = &provider.name {
            if name.trim().is_empty() {
                errors.push(format!("llm.providers[{}].name must not be empty", i));
            }
        }

        let name = provider.resolved_name();
        if !seen.insert(name.clone()) {
            errors.push(format!("llm.providers[{}]: duplicate provider name '{}'", i, name));
        }

        if let Some(model) = &provider.model {
            if model.trim().is_empty() {
                errors.push(format!("llm.providers[{}].model must not be empty", i));
            }
        }

        if let Some(env) = &provider.api_key_env {
            if env.trim().is_empty() {
                errors.push(format!("llm.providers[{}].api_key_env must not be empty", i));
            }
        }

        if let Some(retries) = provider.max_retries {
            if retries > MAX_RETRIES_CAP {
                tracing::warn!(
                    provider = %name,
                    max_retries = retries,
                    cap = MAX_RETRIES_CAP,
                    "max_retries above cap, will be clamped"
                );
            }
        }
    }

    if let Some(default) = &llm.default_provider {
        let default = default.trim().to_lowercase();
        if !seen.contains(&default) {
            errors.push(format!(
                "llm.default_provider '{}' is not a configured provider",
                default
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloop_common::config::{ProviderConfig, ProviderKind};

    fn config_with(providers: Vec<ProviderConfig>, default: Option<&str>) -> SystemConfig {
        SystemConfig {
            llm: LlmConfig {
                default_provider: default.map(str::to_string),
                providers,
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let config = config_with(
            vec![
                ProviderConfig::new(ProviderKind::Anthropic),
                ProviderConfig::new(ProviderKind::OpenAi),
            ],
            Some("OpenAI"),
        );
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut second = ProviderConfig::new(ProviderKind::OpenAi);
        second.name = Some("Anthropic".into());
        let config = config_with(vec![ProviderConfig::new(ProviderKind::Anthropic), second], None);

        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("duplicate provider name 'anthropic'"));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut provider = ProviderConfig::new(ProviderKind::Anthropic);
        provider.model = Some(" ".into());
        provider.api_key_env = Some("".into());
        let config = config_with(vec![provider], Some("missing"));

        match validate(&config) {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("model must not be empty"));
                assert!(msg.contains("api_key_env must not be empty"));
                assert!(msg.contains("default_provider 'missing'"));
            }
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_over_cap_retries_is_not_an_error() {
        let mut provider = ProviderConfig::new(ProviderKind::OpenAi);
        provider.max_retries = Some(10);
        assert!(validate(&config_with(vec![provider], None)).is_ok());
    }
}
