// OpenAI chat completions provider.

use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{resolve_key, GenerationRequest, LlmProvider, StreamChunk};
use crate::errors::{EngineError, EngineResult};

const REQUEST_TIMEOUT_SECS: u64 = 60;
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_TEMPERATURE: f64 = 0.7;

#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: Option<String>,
    default_model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            default_model: "gpt-4-turbo-preview".to_string(),
            base_url: OPENAI_BASE_URL.to_string(),
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
        resolve_key("OpenAI", self.api_key.as_deref(), request_key)
    }

    fn to_openai_request(&self, request: &GenerationRequest, stream: bool) -> OpenAiRequest {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_instruction {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(OpenAiMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        OpenAiRequest {
            model: self.default_model.clone(),
            messages,
            temperature: DEFAULT_TEMPERATURE,
            stream,
        }
    }

    async fn post_completions(
        &self,
        key: &str,
        body: &OpenAiRequest,
    ) -> EngineResult<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {key}"))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamProvider(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamProvider(format!(
                "OpenAI API returned {status}: {error_body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, request: &GenerationRequest) -> EngineResult<String> {
        let key = self.key_for(request.api_key.as_deref())?;
        let body = self.to_openai_request(request, false);

        tracing::debug!(model = self.default_model, "sending OpenAI request");
        let response = self.post_completions(&key, &body).await?;

        let openai_response: OpenAiResponse = response.json().await.map_err(|e| {
            EngineError::UpstreamProvider(format!("failed to parse OpenAI response: {e}"))
        })?;

        openai_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.and_then(|m| m.content_text()))
            .ok_or_else(|| EngineError::UpstreamProvider("OpenAI returned no choices".into()))
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> EngineResult<mpsc::Receiver<EngineResult<StreamChunk>>> {
        let key = self.key_for(request.api_key.as_deref())?;
        let body = self.to_openai_request(request, true);

        tracing::debug!(model = self.default_model, "sending OpenAI streaming request");
        let response = self.post_completions(&key, &body).await?;

        let (tx, rx) = mpsc::channel(100);

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

                            if let Ok(partial) = serde_json::from_str::<OpenAiStreamChunk>(json_str)
                            {
                                let Some(choice) = partial.choices.into_iter().next() else {
                                    continue;
                                };
                                if let Some(content) = choice.delta.and_then(|d| d.content) {
                                    if !content.is_empty()
                                        && tx
                                            .send(Ok(StreamChunk::TextDelta(content)))
                                            .await
                                            .is_err()
                                    {
                                        done = true;
                                        break;
                                    }
                                }
                                if choice.finish_reason.is_some() {
                                    done = true;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::UpstreamProvider(format!(
                                "OpenAI stream error: {e}"
                            ))))
                            .await;
                        break;
                    }
                }
            }

            tracing::debug!("OpenAI streaming task finished");
        });

        Ok(rx)
    }
}

// OpenAI wire types

#[derive(Debug, Clone, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

impl OpenAiMessage {
    fn content_text(self) -> Option<String> {
        if self.content.is_empty() {
            None
        } else {
            Some(self.content)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiMessage>,
    #[serde(rename = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiDelta>,
    #[serde(rename = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_name_and_model() {
        let provider = OpenAiProvider::new(Some("sk-test".into())).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.default_model(), "gpt-4-turbo-preview");
    }

    #[test]
    fn test_request_shape_matches_chat_api() {
        let provider = OpenAiProvider::new(Some("sk".into())).unwrap();
        let request = GenerationRequest::new("analyze my margins").with_system("be a coach");
        let body = serde_json::to_value(provider.to_openai_request(&request, false)).unwrap();

        assert_eq!(body["model"], json!("gpt-4-turbo-preview"));
        assert_eq!(body["temperature"], json!(0.7));
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][1]["role"], json!("user"));
        assert_eq!(body["messages"][1]["content"], json!("analyze my margins"));
    }

    #[test]
    fn test_request_without_system_has_single_message() {
        let provider = OpenAiProvider::new(Some("sk".into())).unwrap();
        let body = provider.to_openai_request(&GenerationRequest::new("hi"), true);
        assert_eq!(body.messages.len(), 1);
        assert!(body.stream);
    }

    #[tokio::test]
    async fn test_generate_against_mock_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-k")
            .with_status(200)
            .with_body(
                json!({
                    "id": "chatcmpl-1",
                    "choices": [{
                        "message": {"role": "assistant", "content": "cut burn"},
                        "finish_reason": "stop"
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider = OpenAiProvider::new(Some("sk-k".into()))
            .unwrap()
            .with_base_url(server.url());
        let text = provider
            .generate(&GenerationRequest::new("advice?"))
            .await
            .unwrap();

        assert_eq!(text, "cut burn");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stream_parses_sse_deltas() {
        let mut server = mockito::Server::new_async().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_body)
            .create_async()
            .await;

        let provider = OpenAiProvider::new(Some("sk-k".into()))
            .unwrap()
            .with_base_url(server.url());
        let mut rx = provider
            .generate_stream(&GenerationRequest::new("hi"))
            .await
            .unwrap();

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            let StreamChunk::TextDelta(text) = chunk.unwrap();
            collected.push_str(&text);
        }
        assert_eq!(collected, "Hello");
    }
}
