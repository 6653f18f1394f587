// Google Gemini provider.
//
// Serves both text generation (single-shot and SSE streaming) and speech
// synthesis via the AUDIO response modality.

use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{resolve_key, GenerationRequest, LlmProvider, SpeechProvider, StreamChunk};
use crate::errors::{EngineError, EngineResult};

const REQUEST_TIMEOUT_SECS: u64 = 60;
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const TTS_VOICE: &str = "Kore";

#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: Option<String>,
    default_model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: Option<String>) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            default_model: "gemini-2.0-flash-exp".to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
        })
    }

    /// Point at a different endpoint (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn key_for(&self, request_key: Option<&str>) -> EngineResult<String> {
        resolve_key("Gemini", self.api_key.as_deref(), request_key)
    }

    fn to_gemini_request(&self, request: &GenerationRequest) -> GeminiRequest {
        GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: Some(request.prompt.clone()),
                    inline_data: None,
                }],
            }],
            system_instruction: request.system_instruction.as_ref().map(|text| {
                GeminiSystemInstruction {
                    parts: vec![GeminiPart {
                        text: Some(text.clone()),
                        inline_data: None,
                    }],
                }
            }),
            generation_config: None,
        }
    }

    async fn post_generate(
        &self,
        key: &str,
        endpoint: &str,
        body: &GeminiRequest,
    ) -> EngineResult<reqwest::Response> {
        let url = format!(
            "{}/models/{}:{}?key={}",
            self.base_url, self.default_model, endpoint, key
        );

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamProvider(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamProvider(format!(
                "Gemini API returned {status}: {error_body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, request: &GenerationRequest) -> EngineResult<String> {
        let key = self.key_for(request.api_key.as_deref())?;
        let body = self.to_gemini_request(request);

        tracing::debug!(model = self.default_model, "sending Gemini request");
        let response = self.post_generate(&key, "generateContent", &body).await?;

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            EngineError::UpstreamProvider(format!("failed to parse Gemini response: {e}"))
        })?;

        gemini_response
            .text()
            .ok_or_else(|| EngineError::UpstreamProvider("Gemini returned no candidates".into()))
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> EngineResult<mpsc::Receiver<EngineResult<StreamChunk>>> {
        let key = self.key_for(request.api_key.as_deref())?;
        let body = self.to_gemini_request(request);

        let url = format!(
            "{}/models/{}:streamGenerateContent?key={}&alt=sse",
            self.base_url, self.default_model, key
        );

        tracing::debug!(model = self.default_model, "sending Gemini streaming request");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EngineError::UpstreamProvider(format!("Gemini streaming request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamProvider(format!(
                "Gemini API returned {status}: {error_body}"
            )));
        }

        let (tx, rx) = mpsc::channel(100);

        // Parse the SSE body line by line, forwarding each text part as soon
        // as it arrives. The channel closing signals completion.
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();
            let mut done = false;

            while let Some(chunk) = stream.next().await {
                if done {
                    break;
                }

                match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);

                        while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();
                            let line = String::from_utf8_lossy(&line_bytes);

                            let Some(json_str) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            let json_str = json_str.trim();
                            if json_str == "[DONE]" {
                                done = true;
                                break;
                            }

                            if let Ok(partial) = serde_json::from_str::<GeminiResponse>(json_str) {
                                let finished = partial
                                    .candidates
                                    .first()
                                    .is_some_and(|c| c.finish_reason.is_some());
                                if let Some(text) = partial.text() {
                                    if !text.is_empty()
                                        && tx.send(Ok(StreamChunk::TextDelta(text))).await.is_err()
                                    {
                                        done = true;
                                        break;
                                    }
                                }
                                if finished {
                                    done = true;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::UpstreamProvider(format!(
                                "Gemini stream error: {e}"
                            ))))
                            .await;
                        break;
                    }
                }
            }

            tracing::debug!("Gemini streaming task finished");
        });

        Ok(rx)
    }
}

#[async_trait]
impl SpeechProvider for GeminiProvider {
    async fn synthesize(&self, text: &str, request_key: Option<&str>) -> EngineResult<String> {
        let key = self.key_for(request_key)?;

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: Some(text.to_string()),
                    inline_data: None,
                }],
            }],
            system_instruction: None,
            generation_config: Some(GeminiGenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(GeminiSpeechConfig {
                    voice_config: GeminiVoiceConfig {
                        prebuilt_voice_config: GeminiPrebuiltVoice {
                            voice_name: TTS_VOICE.to_string(),
                        },
                    },
                }),
            }),
        };

        tracing::debug!(voice = TTS_VOICE, "sending Gemini TTS request");
        let response = self.post_generate(&key, "generateContent", &body).await?;

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            EngineError::UpstreamProvider(format!("failed to parse Gemini TTS response: {e}"))
        })?;

        gemini_response
            .inline_audio()
            .ok_or_else(|| EngineError::UpstreamProvider("Gemini returned no audio data".into()))
    }
}

// Gemini wire types

#[derive(Debug, Clone, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiInlineData {
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<String>,
    #[serde(rename = "speechConfig", skip_serializing_if = "Option::is_none")]
    speech_config: Option<GeminiSpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiSpeechConfig {
    #[serde(rename = "voiceConfig")]
    voice_config: GeminiVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiVoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    prebuilt_voice_config: GeminiPrebuiltVoice,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiPrebuiltVoice {
    #[serde(rename = "voiceName")]
    voice_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

impl GeminiResponse {
    /// Concatenated text of the first candidate, if any part carries text.
    fn text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let text: String = candidate
            .content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if candidate.content.parts.iter().any(|p| p.text.is_some()) {
            Some(text)
        } else {
            None
        }
    }

    /// Base64 audio payload of the first candidate's first inline part.
    fn inline_audio(&self) -> Option<String> {
        self.candidates
            .first()?
            .content
            .parts
            .iter()
            .find_map(|p| p.inline_data.as_ref().map(|d| d.data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_name_and_model() {
        let provider = GeminiProvider::new(Some("test-key".into())).unwrap();
        assert_eq!(provider.name(), "gemini");
        assert_eq!(provider.default_model(), "gemini-2.0-flash-exp");
        assert!(provider.is_configured());
    }

    #[test]
    fn test_unconfigured_without_key() {
        let provider = GeminiProvider::new(None).unwrap();
        assert!(!provider.is_configured());
        assert!(provider.key_for(None).is_err());
        assert_eq!(provider.key_for(Some("req-key")).unwrap(), "req-key");
    }

    #[test]
    fn test_system_instruction_serialized_when_present() {
        let provider = GeminiProvider::new(Some("k".into())).unwrap();
        let request = GenerationRequest::new("hello").with_system("be brief");
        let body = serde_json::to_value(provider.to_gemini_request(&request)).unwrap();
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            json!("be brief")
        );
        assert_eq!(body["contents"][0]["parts"][0]["text"], json!("hello"));
    }

    #[test]
    fn test_response_text_concatenates_parts() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hel"}, {"text": "lo"}]},
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        assert_eq!(response.text().unwrap(), "Hello");
    }

    #[test]
    fn test_response_inline_audio() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"parts": [{"inlineData": {"mimeType": "audio/pcm", "data": "QUJD"}}]}
            }]
        }))
        .unwrap();
        assert_eq!(response.inline_audio().unwrap(), "QUJD");
        assert!(response.text().is_none());
    }

    #[tokio::test]
    async fn test_generate_against_mock_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "POST",
                mockito::Matcher::Regex(r"^/models/gemini-2.0-flash-exp:generateContent".into()),
            )
            .match_query(mockito::Matcher::UrlEncoded("key".into(), "k".into()))
            .with_status(200)
            .with_body(
                json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": "stay liquid"}]},
                        "finishReason": "STOP"
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = GeminiProvider::new(Some("k".into()))
            .unwrap()
            .with_base_url(server.url());
        let text = provider
            .generate(&GenerationRequest::new("advice?"))
            .await
            .unwrap();

        assert_eq!(text, "stay liquid");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upstream_error_surfaces_detail() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", mockito::Matcher::Any)
            .with_status(401)
            .with_body(r#"{"error": "invalid key"}"#)
            .create_async()
            .await;

        let provider = GeminiProvider::new(Some("bad".into()))
            .unwrap()
            .with_base_url(server.url());
        let err = provider
            .generate(&GenerationRequest::new("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::UpstreamProvider(_)));
        assert!(err.to_string().contains("401"));
    }
}
