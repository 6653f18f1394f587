// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{EngineError, EngineResult};

/// Feature flags exposed in the status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Serve streaming sessions over the WebSocket channel.
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,

    /// Serve the text-to-speech endpoint.
    #[serde(default = "default_true")]
    pub tts_enabled: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            streaming_enabled: true,
            tts_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// AI provider credentials and selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Google Generative AI key (Gemini generation and TTS).
    pub google_api_key: Option<String>,
    /// OpenAI key.
    pub openai_api_key: Option<String>,
    /// Provider backing streaming coach sessions: "gemini" or "openai".
    #[serde(default = "default_preferred")]
    pub preferred: String,
}

fn default_preferred() -> String {
    "gemini".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            google_api_key: None,
            openai_api_key: None,
            preferred: default_preferred(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailConfig {
    /// HTTP relay that performs the actual delivery. Without it, sends are
    /// logged and acknowledged.
    pub relay_url: Option<String>,
    pub from_address: Option<String>,
}

/// Pass-through collaborator endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    pub analytics_url: Option<String>,
    pub payments_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g. "127.0.0.1:3001")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Sustained request rate per actor.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    /// Burst capacity above the sustained rate.
    #[serde(default = "default_burst")]
    pub burst: f64,
}

fn default_bind_address() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_requests_per_second() -> f64 {
    5.0
}

fn default_burst() -> f64 {
    20.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub mail: MailConfig,
    pub collaborators: CollaboratorsConfig,
    pub features: FeaturesConfig,
    /// Directory holding the per-domain store documents.
    pub data_dir: PathBuf,
    /// Directory holding the daily audit logs.
    pub audit_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".clarity");
        Self {
            server: ServerConfig::default(),
            providers: ProvidersConfig::default(),
            mail: MailConfig::default(),
            collaborators: CollaboratorsConfig::default(),
            features: FeaturesConfig::default(),
            data_dir: base.join("data"),
            audit_dir: base.join("audit"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> EngineResult<()> {
        self.server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                EngineError::Configuration(format!(
                    "invalid bind_address '{}': {e}",
                    self.server.bind_address
                ))
            })?;

        if self.server.requests_per_second <= 0.0 || self.server.burst < 1.0 {
            return Err(EngineError::Configuration(
                "rate limit requires requests_per_second > 0 and burst >= 1".into(),
            ));
        }

        match self.providers.preferred.as_str() {
            "gemini" | "openai" => {}
            other => {
                return Err(EngineError::Configuration(format!(
                    "unknown preferred provider '{other}' (expected 'gemini' or 'openai')"
                )))
            }
        }

        if self.providers.google_api_key.is_none() && self.providers.openai_api_key.is_none() {
            // Requests may still carry their own keys; warn, don't fail.
            tracing::warn!("no provider API keys configured; callers must supply their own");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        let mut config = Config::default();
        config.server.bind_address = "not-an-address".into();
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_preferred_provider_rejected() {
        let mut config = Config::default();
        config.providers.preferred = "grok".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut config = Config::default();
        config.server.requests_per_second = 0.0;
        assert!(config.validate().is_err());
    }
}
