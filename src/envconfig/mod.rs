use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::app::broker::BrokerConfig;
use crate::app::recovery::RecoveryConfig;
use crate::infra::assets::LocalAssetManager;
use crate::infra::engine::SamplingOptions;
use crate::infra::store::JsonEntryStore;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub models_dir: PathBuf,
    pub store_path: PathBuf,
    pub system_prompt: Option<String>,
    pub recovery_max_age_hours: i64,
    pub sampling: SamplingOptions,
    pub log_level: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SamplingOptions::default();
        Self {
            models_dir: lookup("HEARTH_MODELS")
                .map(|p| expand_home(&p))
                .unwrap_or_else(LocalAssetManager::default_models_dir),
            store_path: lookup("HEARTH_STORE")
                .map(|p| expand_home(&p))
                .unwrap_or_else(JsonEntryStore::default_path),
            system_prompt: lookup("HEARTH_SYSTEM_PROMPT").filter(|s| !s.trim().is_empty()),
            recovery_max_age_hours: parse_or(&lookup, "HEARTH_RECOVERY_MAX_AGE_HOURS", 24),
            sampling: SamplingOptions {
                temperature: parse_or(&lookup, "HEARTH_TEMPERATURE", defaults.temperature),
                top_p: defaults.top_p,
                seed: parse_or(&lookup, "HEARTH_SEED", defaults.seed),
                max_tokens: parse_or(&lookup, "HEARTH_MAX_TOKENS", defaults.max_tokens),
            },
            log_level: lookup("HEARTH_LOG"),
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            system_prompt: self.system_prompt.clone(),
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        match chrono::Duration::try_hours(self.recovery_max_age_hours.max(0)) {
            Some(max_age) => RecoveryConfig { max_age },
            None => {
                tracing::warn!(
                    hours = self.recovery_max_age_hours,
                    "recovery max age out of range, using default"
                );
                RecoveryConfig::default()
            }
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_overrides() {
        let config = EnvConfig::from_lookup(lookup_from(&[
            ("HEARTH_MODELS", "/srv/models"),
            ("HEARTH_MAX_TOKENS", "64"),
            ("HEARTH_RECOVERY_MAX_AGE_HOURS", "6"),
            ("HEARTH_SYSTEM_PROMPT", "Be terse."),
        ]));
        assert_eq!(config.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.sampling.max_tokens, 64);
        assert_eq!(config.recovery_config().max_age, chrono::Duration::hours(6));
        assert_eq!(config.broker_config().system_prompt.as_deref(), Some("Be terse."));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = EnvConfig::from_lookup(lookup_from(&[
            ("HEARTH_MAX_TOKENS", "lots"),
            ("HEARTH_SYSTEM_PROMPT", "   "),
        ]));
        assert_eq!(config.sampling.max_tokens, SamplingOptions::default().max_tokens);
        assert_eq!(config.system_prompt, None);
        assert_eq!(config.recovery_max_age_hours, 24);
    }

    #[test]
    fn test_out_of_range_max_age_falls_back() {
        let config = EnvConfig::from_lookup(lookup_from(&[(
            "HEARTH_RECOVERY_MAX_AGE_HOURS",
            &i64::MAX.to_string(),
        )]));
        assert_eq!(config.recovery_max_age_hours, i64::MAX);
        assert_eq!(config.recovery_config().max_age, RecoveryConfig::default().max_age);
    }
}
