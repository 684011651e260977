use std::path::PathBuf;
use std::time::Duration;

use pagecraft_llm::LlmConfig;
use pagecraft_pipeline::rate_limit::DEFAULT_RATE_LIMIT_PER_MINUTE;

use crate::auth::jwt::JwtConfig;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// Request timeout in seconds for non-streaming routes (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for live generations to stop (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// JWT verification settings.
    pub jwt: JwtConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs = env_parse("REQUEST_TIMEOUT_SECS", 30u64);
        let shutdown_timeout_secs = env_parse("SHUTDOWN_TIMEOUT_SECS", 30u64);

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            jwt: JwtConfig::from_env(),
        }
    }
}

/// Generation settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub llm: LlmConfig,
    /// System prompt template, read once at startup.
    pub template_path: PathBuf,
    /// How long an INTERRUPTED session waits for a reconnect before it is
    /// closed.
    pub interrupt_timeout: Duration,
    /// How often the expiry sweep runs.
    pub sweep_interval: Duration,
    /// Generation requests allowed per account per minute.
    pub rate_limit_per_minute: u32,
}

impl GenerationConfig {
    /// Load generation configuration from environment variables.
    ///
    /// | Env Var                  | Default                      |
    /// |--------------------------|------------------------------|
    /// | `LLM_API_URL`            | `https://api.anthropic.com`  |
    /// | `LLM_API_KEY`            | **required**                 |
    /// | `LLM_MODEL`              | `claude-sonnet-4-5`          |
    /// | `LLM_BRIEF_MODEL`        | value of `LLM_MODEL`         |
    /// | `LLM_MAX_TOKENS`         | `16000`                      |
    /// | `LLM_TIMEOUT_SECS`       | `120`                        |
    /// | `LLM_RETRY_DELAY_MS`     | `2000`                       |
    /// | `SYSTEM_PROMPT_TEMPLATE` | `templates/system_prompt.md` |
    /// | `INTERRUPT_TIMEOUT_SECS` | `600`                        |
    /// | `SWEEP_INTERVAL_SECS`    | `60`                         |
    /// | `RATE_LIMIT_PER_MINUTE`  | `10`                         |
    ///
    /// # Panics
    ///
    /// Panics if `LLM_API_KEY` is missing, a numeric value does not parse,
    /// or `SWEEP_INTERVAL_SECS` is zero.
    pub fn from_env() -> Self {
        let api_key =
            std::env::var("LLM_API_KEY").expect("LLM_API_KEY must be set in the environment");
        assert!(!api_key.is_empty(), "LLM_API_KEY must not be empty");

        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "claude-sonnet-4-5".into());
        let brief_model = std::env::var("LLM_BRIEF_MODEL").unwrap_or_else(|_| model.clone());

        let llm = LlmConfig {
            api_url: std::env::var("LLM_API_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".into()),
            api_key,
            model,
            brief_model,
            max_tokens: env_parse("LLM_MAX_TOKENS", 16_000u32),
            timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 120u64)),
            retry_delay: Duration::from_millis(env_parse("LLM_RETRY_DELAY_MS", 2_000u64)),
        };

        Self {
            llm,
            template_path: std::env::var("SYSTEM_PROMPT_TEMPLATE")
                .unwrap_or_else(|_| "templates/system_prompt.md".into())
                .into(),
            interrupt_timeout: Duration::from_secs(env_parse("INTERRUPT_TIMEOUT_SECS", 600u64)),
            sweep_interval: parse_interval(
                "SWEEP_INTERVAL_SECS",
                std::env::var("SWEEP_INTERVAL_SECS").ok().as_deref(),
                60,
            )
            .unwrap_or_else(|e| panic!("{e}")),
            rate_limit_per_minute: env_parse(
                "RATE_LIMIT_PER_MINUTE",
                DEFAULT_RATE_LIMIT_PER_MINUTE,
            ),
        }
    }
}

/// Read and parse an env var, falling back to `default` when it is unset.
///
/// Panics if the variable is set but does not parse.
fn env_parse<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
            panic!("{name} must be a valid {}: {e}", std::any::type_name::<T>())
        }),
        Err(_) => default,
    }
}

/// Parse a whole number of seconds that must be at least one.
fn parse_interval(name: &str, raw: Option<&str>, default_secs: u64) -> Result<Duration, String> {
    let secs = match raw {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("{name} must be a whole number of seconds: {e}"))?,
        None => default_secs,
    };
    if secs == 0 {
        return Err(format!("{name} must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}
