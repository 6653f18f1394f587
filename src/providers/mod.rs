// AI provider abstraction.
//
// Gemini and OpenAI sit behind one trait so handlers and the stream
// coordinator never care which upstream is wired in, and tests can inject
// doubles. Provider clients are constructed once at startup and passed in
// explicitly; there are no module-level singletons.

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

use crate::errors::{EngineError, EngineResult};

pub mod gemini;
pub mod openai;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// One incremental fragment of a streamed generation. The channel closing
/// without an error is the completion signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    TextDelta(String),
}

/// Provider-agnostic generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_instruction: Option<String>,
    /// Request-supplied credential, used when no server-side key is
    /// configured.
    pub api_key: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_instruction = Some(system.into());
        self
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. "gemini", "openai").
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    /// True when a server-side credential is configured. Submissions fail
    /// fast with a configuration error when this is false and the request
    /// carries no key of its own.
    fn is_configured(&self) -> bool;

    /// Send a request and wait for the complete response text.
    async fn generate(&self, request: &GenerationRequest) -> EngineResult<String>;

    /// Send a request and stream the response. The receiver yields text
    /// deltas and closes when the generation finishes; an `Err` item
    /// terminates the stream.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> EngineResult<Receiver<EngineResult<StreamChunk>>>;
}

/// Audio generation collaborator (backed by Gemini's AUDIO modality).
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Synthesize speech for `text`, returning base64-encoded audio.
    async fn synthesize(&self, text: &str, request_key: Option<&str>) -> EngineResult<String>;
}

/// Resolve the credential for one request: the configured key wins, a
/// request-supplied key is the fallback, then a fail-fast configuration
/// error.
pub(crate) fn resolve_key(
    provider: &str,
    configured: Option<&str>,
    request_key: Option<&str>,
) -> EngineResult<String> {
    configured
        .or(request_key)
        .map(str::to_string)
        .ok_or_else(|| EngineError::Configuration(format!("{provider} API key missing")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_key_prefers_configured() {
        // A caller-supplied key must not displace the server's credential.
        let key = resolve_key("gemini", Some("configured"), Some("from-request")).unwrap();
        assert_eq!(key, "configured");
    }

    #[test]
    fn test_resolve_key_falls_back_to_request_key() {
        let key = resolve_key("gemini", None, Some("from-request")).unwrap();
        assert_eq!(key, "from-request");
    }

    #[test]
    fn test_resolve_key_missing_is_configuration_error() {
        let err = resolve_key("openai", None, None).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("openai"));
    }
}
