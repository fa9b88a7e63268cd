//! Process configuration, read once from the environment at startup.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use mintforge_core::{MAX_ATTEMPTS, OwnerRef, RetryPolicy, validate_prompt};
use mintforge_infra::jobs::{DEFAULT_FALLBACK_PROMPT, ProcessorConfig, SchedulerConfig};
use mintforge_infra::ledger::JsonRpcLedgerConfig;
use mintforge_infra::ledger::json_rpc::NEXT_TOKEN_ID_SELECTOR;
use mintforge_infra::synthesis::HttpSynthesizerConfig;

pub const DEFAULT_SYNTHESIS_ENDPOINT: &str = "https://api.openai.com/v1/images/generations";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Environment reader over an arbitrary lookup function.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &'static str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn parsed_opt<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.optional(name)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                    name,
                    reason: format!("{raw:?}: {e}"),
                })
            })
            .transpose()
    }

    fn parsed<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parsed_opt(name)?.unwrap_or(default))
    }

    fn positive<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialEq + From<u8>,
        T::Err: Display,
    {
        let value = self.parsed(name, default)?;
        if value == T::from(0) {
            return Err(ConfigError::Invalid {
                name,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Job store connection and retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub max_attempts: u32,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };
        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            max_connections: env.positive("DATABASE_MAX_CONNECTIONS", 10u32)?,
            max_attempts: env.positive("MAX_ATTEMPTS", MAX_ATTEMPTS)?,
        })
    }
}

/// Ledger endpoint configuration.
pub fn ledger_config_from_env() -> Result<JsonRpcLedgerConfig, ConfigError> {
    ledger_config_from_lookup(env_lookup)
}

pub fn ledger_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<JsonRpcLedgerConfig, ConfigError> {
    let env = Env { lookup };
    let rpc_url = env.required("LEDGER_RPC_URL")?;
    let contract = env.required("LEDGER_CONTRACT_ADDRESS")?;
    OwnerRef::parse(&contract).map_err(|e| ConfigError::Invalid {
        name: "LEDGER_CONTRACT_ADDRESS",
        reason: e.to_string(),
    })?;

    let selector = env
        .optional("LEDGER_COUNT_SELECTOR")
        .unwrap_or_else(|| format!("0x{NEXT_TOKEN_ID_SELECTOR}"));
    let hex = selector.trim_start_matches("0x");
    if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::Invalid {
            name: "LEDGER_COUNT_SELECTOR",
            reason: format!("{selector:?} is not a 4-byte hex selector"),
        });
    }

    Ok(JsonRpcLedgerConfig::new(rpc_url, contract).with_count_selector(selector))
}

/// Synthesis adapter configuration.
pub fn synthesis_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<HttpSynthesizerConfig, ConfigError> {
    let env = Env { lookup };
    Ok(HttpSynthesizerConfig {
        endpoint: env
            .optional("SYNTHESIS_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_SYNTHESIS_ENDPOINT.to_string()),
        api_key: env.required("SYNTHESIS_API_KEY")?,
        image_size: env
            .optional("SYNTHESIS_IMAGE_SIZE")
            .unwrap_or_else(|| "1024x1024".to_string()),
        timeout: Duration::from_secs(env.positive("SYNTHESIS_TIMEOUT_SECS", 120u64)?),
    })
}

/// Scheduler, processor and optional background surfaces.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub processor: ProcessorConfig,
    pub scheduler: SchedulerConfig,
    pub reconcile_interval: Option<Duration>,
    pub webhook_bind: Option<SocketAddr>,
}

impl PipelineConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let fallback_prompt = env
            .optional("FALLBACK_PROMPT")
            .unwrap_or_else(|| DEFAULT_FALLBACK_PROMPT.to_string());
        validate_prompt(&fallback_prompt).map_err(|e| ConfigError::Invalid {
            name: "FALLBACK_PROMPT",
            reason: e.to_string(),
        })?;

        let max_attempts = env.positive("MAX_ATTEMPTS", MAX_ATTEMPTS)?;
        let base_delay = Duration::from_millis(env.positive("RETRY_BASE_DELAY_MS", 1000u64)?);
        let retry = RetryPolicy {
            max_attempts,
            base_delay,
            ..RetryPolicy::default()
        };

        let model = env
            .optional("SYNTHESIS_MODEL")
            .unwrap_or_else(|| "dall-e-3".to_string());
        let synthesis_timeout =
            Duration::from_secs(env.positive("SYNTHESIS_TIMEOUT_SECS", 120u64)?);
        let processor = ProcessorConfig::default()
            .with_model(model)
            .with_fallback_prompt(fallback_prompt)
            .with_synthesis_timeout(synthesis_timeout)
            .with_retry_policy(retry);

        let poll_interval = Duration::from_millis(env.positive("POLL_INTERVAL_MS", 1000u64)?);
        let scheduler = SchedulerConfig::default()
            .with_poll_interval(poll_interval)
            .with_batch_size(env.positive("BATCH_SIZE", 10usize)?);

        let reconcile_interval = match env.parsed_opt::<u64>("RECONCILE_INTERVAL_SECS")? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    name: "RECONCILE_INTERVAL_SECS",
                    reason: "must be greater than zero".to_string(),
                });
            }
            other => other.map(Duration::from_secs),
        };

        Ok(Self {
            processor,
            scheduler,
            reconcile_interval,
            webhook_bind: env.parsed_opt("WEBHOOK_BIND")?,
        })
    }
}

/// Everything `mintforge run` needs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store: StoreConfig,
    pub ledger: JsonRpcLedgerConfig,
    pub synthesis: HttpSynthesizerConfig,
    pub pipeline: PipelineConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            store: StoreConfig::from_lookup(&lookup)?,
            ledger: ledger_config_from_lookup(&lookup)?,
            synthesis: synthesis_config_from_lookup(&lookup)?,
            pipeline: PipelineConfig::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DATABASE_URL", "postgres://localhost/mintforge"),
            ("LEDGER_RPC_URL", "http://localhost:8545"),
            ("LEDGER_CONTRACT_ADDRESS", "0x00000000000000000000000000000000000C0FFE"),
            ("SYNTHESIS_API_KEY", "sk-test"),
        ]
    }

    #[test]
    fn defaults_apply() {
        let config = WorkerConfig::from_lookup(lookup(&required())).unwrap();

        assert_eq!(config.store.max_connections, 10);
        assert_eq!(config.store.max_attempts, 3);
        assert_eq!(config.ledger.count_selector, "0x75794a3c");
        assert_eq!(config.synthesis.endpoint, DEFAULT_SYNTHESIS_ENDPOINT);
        assert_eq!(config.synthesis.timeout, Duration::from_secs(120));
        assert_eq!(config.pipeline.processor.model, "dall-e-3");
        assert_eq!(config.pipeline.processor.retry.max_attempts, 3);
        assert_eq!(
            config.pipeline.processor.retry.delay_for_attempt(3),
            Duration::from_secs(4)
        );
        assert_eq!(config.pipeline.scheduler.poll_interval, Duration::from_secs(1));
        assert_eq!(config.pipeline.scheduler.batch_size, 10);
        assert!(config.pipeline.reconcile_interval.is_none());
        assert!(config.pipeline.webhook_bind.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = required();
        pairs.extend([
            ("BATCH_SIZE", "25"),
            ("POLL_INTERVAL_MS", "250"),
            ("MAX_ATTEMPTS", "5"),
            ("RECONCILE_INTERVAL_SECS", "600"),
            ("WEBHOOK_BIND", "127.0.0.1:9000"),
            ("LEDGER_COUNT_SELECTOR", "0x18160ddd"),
        ]);
        let config = WorkerConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.pipeline.scheduler.batch_size, 25);
        assert_eq!(config.pipeline.scheduler.poll_interval, Duration::from_millis(250));
        assert_eq!(config.store.max_attempts, 5);
        assert_eq!(config.pipeline.processor.retry.max_attempts, 5);
        assert_eq!(config.pipeline.reconcile_interval, Some(Duration::from_secs(600)));
        assert_eq!(config.pipeline.webhook_bind, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(config.ledger.count_selector, "0x18160ddd");
    }

    #[test]
    fn missing_required_variable_is_reported() {
        let pairs: Vec<_> = required()
            .into_iter()
            .filter(|(k, _)| *k != "SYNTHESIS_API_KEY")
            .collect();
        let err = WorkerConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SYNTHESIS_API_KEY"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (name, value) in [
            ("BATCH_SIZE", "0"),
            ("BATCH_SIZE", "ten"),
            ("LEDGER_CONTRACT_ADDRESS", "0x1234"),
            ("LEDGER_COUNT_SELECTOR", "0x1234"),
            ("WEBHOOK_BIND", "not-an-addr"),
            ("RECONCILE_INTERVAL_SECS", "0"),
            ("MAX_ATTEMPTS", "4294967296"),
            ("DATABASE_MAX_CONNECTIONS", "4294967296"),
        ] {
            let mut pairs: Vec<_> = required().into_iter().filter(|(k, _)| *k != name).collect();
            pairs.push((name, value));
            let err = WorkerConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { name: n, .. } if n == name),
                "{name}={value}: {err}"
            );
        }
    }

    #[test]
    fn oversized_fallback_prompt_is_rejected() {
        let long = "x".repeat(1001);
        let mut pairs = required();
        pairs.push(("FALLBACK_PROMPT", long.as_str()));
        let err = PipelineConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "FALLBACK_PROMPT", .. }));
    }

    #[test]
    fn store_config_needs_only_the_database() {
        let config =
            StoreConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://db/x")])).unwrap();
        assert_eq!(config.database_url, "postgres://db/x");
    }
}
