use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::conversation::TurnBudget;

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    /// Wall-clock limit for one network attempt.
    pub request_timeout: Duration,
    /// Wall-clock budget for a whole turn, retries included.
    pub turn_timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: usize,
    /// Zero disables batching.
    pub coalesce_window: Duration,
    pub max_batch_size: usize,
    pub max_attachment_bytes: usize,
    pub max_document_chars: usize,
    pub image_downscale_bytes: usize,
    pub image_max_dimension: u32,
    pub conversation_budget: TurnBudget,
    pub context_budget: TurnBudget,
    pub reply_language: String,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let config = Config {
            openai_api_key: require_env("OPENAI_API_KEY")?,
            openai_base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            openai_model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            request_timeout: Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECS", 30)?),
            turn_timeout: Duration::from_secs(parse_env("TURN_TIMEOUT_SECS", 90)?),
            max_attempts: parse_env("MAX_ATTEMPTS", 3)?,
            base_backoff: Duration::from_millis(parse_env("BASE_BACKOFF_MS", 500)?),
            max_backoff: Duration::from_millis(parse_env("MAX_BACKOFF_MS", 10_000)?),
            rate_limit_window: Duration::from_secs(parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),
            rate_limit_max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", 60)?,
            coalesce_window: Duration::from_millis(parse_env("COALESCE_WINDOW_MS", 1500)?),
            max_batch_size: parse_env("MAX_BATCH_SIZE", 3)?,
            max_attachment_bytes: parse_env("MAX_ATTACHMENT_BYTES", 10 * 1024 * 1024)?,
            max_document_chars: parse_env("MAX_DOCUMENT_CHARS", 12_000)?,
            image_downscale_bytes: parse_env("IMAGE_DOWNSCALE_BYTES", 2 * 1024 * 1024)?,
            image_max_dimension: parse_env("IMAGE_MAX_DIMENSION", 1568)?,
            conversation_budget: TurnBudget {
                max_turns: parse_env("MAX_CONVERSATION_TURNS", 20)?,
                max_tokens: parse_env("MAX_CONVERSATION_TOKENS", 8000)?,
            },
            context_budget: TurnBudget {
                max_turns: parse_env("CONTEXT_TURNS", 10)?,
                max_tokens: parse_env("CONTEXT_TOKENS", 4000)?,
            },
            reply_language: env_or("REPLY_LANGUAGE", "Vietnamese"),
            port: parse_env("PORT", 8080).context("PORT must be a valid port number")?,
            rust_log: env_or("RUST_LOG", "info"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the dispatcher cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.turn_timeout <= self.request_timeout {
            bail!(
                "TURN_TIMEOUT_SECS ({}s) must be longer than REQUEST_TIMEOUT_SECS ({}s)",
                self.turn_timeout.as_secs(),
                self.request_timeout.as_secs()
            );
        }
        if self.rate_limit_max_requests == 0 {
            bail!("RATE_LIMIT_MAX_REQUESTS must be at least 1");
        }
        if self.max_batch_size == 0 {
            bail!("MAX_BATCH_SIZE must be at least 1");
        }
        if self.base_backoff > self.max_backoff {
            bail!("BASE_BACKOFF_MS must not exceed MAX_BACKOFF_MS");
        }
        Ok(())
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A valid configuration for tests, independent of the process environment.
    pub(crate) fn test_config() -> Config {
        Config {
            openai_api_key: "test-key".to_string(),
            openai_base_url: "http://localhost:9".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(5),
            turn_timeout: Duration::from_secs(30),
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_requests: 100,
            coalesce_window: Duration::ZERO,
            max_batch_size: 3,
            max_attachment_bytes: 1024 * 1024,
            max_document_chars: 12_000,
            image_downscale_bytes: 512 * 1024,
            image_max_dimension: 1568,
            conversation_budget: TurnBudget {
                max_turns: 20,
                max_tokens: 8000,
            },
            context_budget: TurnBudget {
                max_turns: 10,
                max_tokens: 4000,
            },
            reply_language: "English".to_string(),
            port: 8080,
            rust_log: "info".to_string(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = Config {
            max_attempts: 0,
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_turn_timeout_must_exceed_request_timeout() {
        let config = Config {
            turn_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("TURN_TIMEOUT_SECS"));
    }

    #[test]
    fn test_batching_switch() {
        use crate::dispatcher::DispatcherSettings;

        assert!(!DispatcherSettings::from(&test_config()).batching_enabled());
        let config = Config {
            coalesce_window: Duration::from_millis(200),
            ..test_config()
        };
        assert!(DispatcherSettings::from(&config).batching_enabled());
    }

    #[test]
    fn test_parse_env_uses_default_when_unset() {
        let value: u32 = parse_env("ASSISTANT_TEST_SURELY_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
