use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};

/// Tunable thresholds and wiring for the verification engine.
///
/// Every tolerance the pipeline uses lives here rather than inline, so the
/// tiers can be re-tuned without touching the evaluators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Absolute tolerance for the zero-I/O numeric fast path.
    pub fast_path_epsilon: f64,
    /// Relative difference below which a numeric answer is accepted in the
    /// fallback path.
    pub exact_rel_tol: f64,
    /// Relative difference below which a wrong numeric answer is still
    /// reported as "close".
    pub close_rel_tol: f64,
    /// Edit-distance similarity above which a textual answer is accepted.
    pub similarity_accept: f64,
    /// Similarity above which an incorrect verdict carries a "close" note.
    pub similarity_note: f64,

    /// Budget for a single external verification round trip.
    pub verify_timeout: Duration,
    /// HTTP connect timeout for outbound clients.
    pub connect_timeout: Duration,
    /// Overall HTTP request timeout for outbound clients.
    pub request_timeout: Duration,

    /// Base URL of the external algebra service.
    pub algebra_base_url: String,
    /// Endpoint and model for the external reasoning service.
    pub reasoning_url: String,
    pub reasoning_model: String,
    pub reasoning_api_key: Option<String>,

    /// TTL per cache category; categories not listed use `default_ttl`.
    pub ttl: HashMap<String, Duration>,
    pub default_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut ttl = HashMap::new();
        ttl.insert("stats".to_string(), Duration::from_secs(30));
        ttl.insert("notebook".to_string(), Duration::from_secs(60));
        ttl.insert("user_lookup".to_string(), Duration::from_secs(5 * 60));
        ttl.insert("profile".to_string(), Duration::from_secs(5 * 60));
        ttl.insert("curriculum".to_string(), Duration::from_secs(10 * 60));
        ttl.insert("symbolic".to_string(), Duration::from_secs(10 * 60));
        ttl.insert("verification".to_string(), Duration::from_secs(5 * 60));

        Self {
            fast_path_epsilon: 0.01,
            exact_rel_tol: 0.01,
            close_rel_tol: 0.10,
            similarity_accept: 0.85,
            similarity_note: 0.50,
            verify_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            algebra_base_url: "https://newton.now.sh/api/v2".to_string(),
            reasoning_url: "https://api.anthropic.com/v1/messages".to_string(),
            reasoning_model: "claude-3-5-haiku-20241022".to_string(),
            reasoning_api_key: None,
            ttl,
            default_ttl: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment, falling back to defaults.
    /// Reads a `.env` file when present, the same way the rest of the app
    /// loads its service credentials.
    pub fn from_env() -> Self {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded environment overrides from .env");
        }

        let mut config = Self::default();

        match std::env::var("MATHMATE_REASONING_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
        {
            Ok(key) if !key.trim().is_empty() => config.reasoning_api_key = Some(key),
            _ => warn!("No reasoning API key found - external verification disabled"),
        }

        if let Ok(url) = std::env::var("MATHMATE_ALGEBRA_URL") {
            config.algebra_base_url = url;
        }
        if let Ok(url) = std::env::var("MATHMATE_REASONING_URL") {
            config.reasoning_url = url;
        }
        if let Ok(model) = std::env::var("MATHMATE_REASONING_MODEL") {
            config.reasoning_model = model;
        }
        if let Ok(secs) = std::env::var("MATHMATE_VERIFY_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(n) if n > 0 => config.verify_timeout = Duration::from_secs(n),
                _ => warn!("Ignoring invalid MATHMATE_VERIFY_TIMEOUT_SECS: {}", secs),
            }
        }

        config
    }

    pub fn ttl_for(&self, category: &str) -> Duration {
        self.ttl.get(category).copied().unwrap_or(self.default_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_table_has_expected_classes() {
        let config = EngineConfig::default();
        assert_eq!(config.ttl_for("stats"), Duration::from_secs(30));
        assert_eq!(config.ttl_for("curriculum"), Duration::from_secs(600));
        // Unknown categories fall back to the default.
        assert_eq!(config.ttl_for("nonsense"), Duration::from_secs(60));
    }
}
