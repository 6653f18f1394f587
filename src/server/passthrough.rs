// Pass-through collaborators (analytics, payments).
//
// These endpoints carry no control logic of their own: the payload is
// forwarded to the configured provider and the provider's response is
// returned verbatim.

use serde_json::Value;
use std::time::Duration;

use crate::errors::{EngineError, EngineResult};

#[derive(Clone)]
pub struct PassThroughClient {
    name: &'static str,
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl PassThroughClient {
    pub fn new(name: &'static str, endpoint: Option<String>) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            name,
            client,
            endpoint,
        })
    }

    pub async fn forward(&self, payload: &Value) -> EngineResult<Value> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            EngineError::Configuration(format!("{} endpoint not configured", self.name))
        })?;

        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                EngineError::UpstreamProvider(format!("{} provider unreachable: {e}", self.name))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamProvider(format!(
                "{} provider returned {status}: {body}",
                self.name
            )));
        }

        response.json().await.map_err(|e| {
            EngineError::UpstreamProvider(format!("{} provider sent invalid JSON: {e}", self.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_forward_returns_provider_response_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/track")
            .match_body(mockito::Matcher::Json(json!({"event": "signup"})))
            .with_status(200)
            .with_body(r#"{"accepted": true, "id": "evt_1"}"#)
            .create_async()
            .await;

        let client =
            PassThroughClient::new("analytics", Some(format!("{}/track", server.url()))).unwrap();
        let response = client.forward(&json!({"event": "signup"})).await.unwrap();

        assert_eq!(response, json!({"accepted": true, "id": "evt_1"}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unconfigured_endpoint_is_configuration_error() {
        let client = PassThroughClient::new("payments", None).unwrap();
        let err = client.forward(&json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_surfaces_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/charge")
            .with_status(402)
            .with_body("card declined")
            .create_async()
            .await;

        let client =
            PassThroughClient::new("payments", Some(format!("{}/charge", server.url()))).unwrap();
        let err = client.forward(&json!({"amount": 100})).await.unwrap_err();
        assert!(err.to_string().contains("402"));
    }
}
