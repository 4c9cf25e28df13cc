use std::env;
use std::time::Duration;

const DEFAULT_PREFIX: &str = "!";
const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 30;

/// Startup configuration, read once from the environment (a `.env` file is
/// loaded beforehand in `main`).
pub struct Config {
    pub token: String,
    pub prefix: String,
    /// Upper bound on a single metadata lookup. A hanging extractor should
    /// fail the one `play` that issued it, not wedge the guild.
    pub resolve_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let token = env::var("DISCORD_TOKEN")?;

        let prefix = env::var("COMMAND_PREFIX").unwrap_or_else(|_| DEFAULT_PREFIX.to_string());

        let resolve_timeout = env::var("RESOLVE_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_RESOLVE_TIMEOUT_SECS));

        Ok(Config {
            token,
            prefix,
            resolve_timeout,
        })
    }
}
