// Configuration loader
// Reads ~/.clarity/config.toml, then applies environment overrides.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use super::settings::{
    CollaboratorsConfig, Config, FeaturesConfig, MailConfig, ProvidersConfig, ServerConfig,
};

/// Load configuration from the config file and environment.
///
/// Missing file is fine: env vars alone are a working setup (the original
/// deployment ran entirely on env). A file that exists but does not parse is
/// an error.
pub fn load_config() -> Result<Config> {
    let mut config = match config_path() {
        Some(path) if path.exists() => {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse_config(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        _ => Config::default(),
    };

    apply_env_overrides(&mut config);

    config.validate().context("configuration validation failed")?;
    Ok(config)
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".clarity/config.toml"))
}

fn parse_config(contents: &str) -> Result<Config> {
    // TOML mirror of Config; every section optional so a partial file works.
    #[derive(serde::Deserialize)]
    struct TomlConfig {
        #[serde(default)]
        server: ServerConfig,
        #[serde(default)]
        providers: ProvidersConfig,
        #[serde(default)]
        mail: MailConfig,
        #[serde(default)]
        collaborators: CollaboratorsConfig,
        #[serde(default)]
        features: FeaturesConfig,
        #[serde(default)]
        data_dir: Option<PathBuf>,
        #[serde(default)]
        audit_dir: Option<PathBuf>,
    }

    let toml_config: TomlConfig = toml::from_str(contents)?;
    let defaults = Config::default();

    Ok(Config {
        server: toml_config.server,
        providers: toml_config.providers,
        mail: toml_config.mail,
        collaborators: toml_config.collaborators,
        features: toml_config.features,
        data_dir: toml_config.data_dir.unwrap_or(defaults.data_dir),
        audit_dir: toml_config.audit_dir.unwrap_or(defaults.audit_dir),
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(key) = std::env::var("GOOGLE_GENERATIVE_AI_API_KEY") {
        if !key.is_empty() {
            config.providers.google_api_key = Some(key);
        }
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            config.providers.openai_api_key = Some(key);
        }
    }
    if let Ok(relay) = std::env::var("MAIL_RELAY_URL") {
        if !relay.is_empty() {
            config.mail.relay_url = Some(relay);
        }
    }
    if let Ok(from) = std::env::var("EMAIL_USER") {
        if !from.is_empty() {
            config.mail.from_address = Some(from);
        }
    }
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse::<u16>() {
            config.server.bind_address = format!("127.0.0.1:{port}");
        }
    }
    if let Ok(addr) = std::env::var("CLARITY_BIND_ADDR") {
        if !addr.is_empty() {
            config.server.bind_address = addr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:3001");
        assert!(config.features.streaming_enabled);
        assert!(config.providers.google_api_key.is_none());
    }

    #[test]
    fn test_partial_file_overrides_sections() {
        let config = parse_config(
            r#"
            data_dir = "/tmp/clarity-data"

            [server]
            bind_address = "0.0.0.0:8080"

            [providers]
            google_api_key = "g-key"
            preferred = "openai"

            [features]
            tts_enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.providers.google_api_key.as_deref(), Some("g-key"));
        assert_eq!(config.providers.preferred, "openai");
        assert!(!config.features.tts_enabled);
        assert!(config.features.streaming_enabled);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/clarity-data"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(parse_config("providers = 7").is_err());
    }
}
